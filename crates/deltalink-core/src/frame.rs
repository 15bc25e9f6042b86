//! Length-prefixed framing.
//!
//! Packs any number of strings into a single string. Each field is written
//! as `<decimal byte length>:<raw bytes>` and fields are joined by `,`:
//!
//! ```text
//! encode("ab", "cde")  =>  2:ab,3:cde
//! ```
//!
//! Decoding reads the length, skips the `:` and slices exactly that many
//! bytes, so a field may itself contain `:`, `,` or digits without any
//! escaping.
//!
//! ```rust
//! use deltalink_core::frame::{decode_from_length, encode_with_length};
//!
//! let packed = encode_with_length(["ab", "cde"]);
//! assert_eq!(packed, "2:ab,3:cde");
//! assert_eq!(decode_from_length(&packed, 2).unwrap(), vec!["ab", "cde"]);
//! ```

use crate::error::{CoreError, Result};

/// Separates the length prefix from the field bytes.
pub const LENGTH_SEPARATOR: char = ':';

/// Separates consecutive fields.
pub const FIELD_DELIMITER: char = ',';

/// Encode `fields` into a new frame string.
pub fn encode_with_length<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut buf = String::new();
    encode_with_length_into(&mut buf, fields);
    buf
}

/// Append `fields` to an existing frame buffer.
///
/// A delimiter is written before every field whenever the buffer is
/// already non-empty, so repeated calls extend one frame.
pub fn encode_with_length_into<I, S>(buf: &mut String, fields: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    for field in fields {
        let field = field.as_ref();
        if !buf.is_empty() {
            buf.push(FIELD_DELIMITER);
        }
        buf.push_str(&field.len().to_string());
        buf.push(LENGTH_SEPARATOR);
        buf.push_str(field);
    }
}

/// Decode exactly `n` fields from the front of `input`.
///
/// Anything after the `n`-th field is ignored.
///
/// # Errors
///
/// Returns [`CoreError::MalformedFrame`] when a field has no numeric
/// length prefix, lacks the `:` separator, announces more bytes than
/// remain, would split a UTF-8 sequence, or is not preceded by `,`.
/// A count larger than `input` could possibly hold is rejected up front.
pub fn decode_from_length(input: &str, n: usize) -> Result<Vec<String>> {
    // The shortest field is `0:` and every field after the first adds `,`.
    let most = (input.len() + 1) / 3;
    if n > most {
        return Err(CoreError::malformed(
            most,
            format!("announced {n} fields but input holds at most {most}"),
        ));
    }
    let mut fields = Vec::with_capacity(n);
    let mut rest = input;

    for field in 0..n {
        if field > 0 {
            rest = rest
                .strip_prefix(FIELD_DELIMITER)
                .ok_or_else(|| CoreError::malformed(field, "missing field delimiter"))?;
        }

        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return Err(CoreError::malformed(field, "missing length prefix"));
        }
        let len: usize = rest[..digits]
            .parse()
            .map_err(|_| CoreError::malformed(field, "length prefix out of range"))?;

        rest = rest[digits..]
            .strip_prefix(LENGTH_SEPARATOR)
            .ok_or_else(|| CoreError::malformed(field, "missing length separator"))?;

        if rest.len() < len {
            return Err(CoreError::malformed(
                field,
                format!("announced {len} bytes but only {} remain", rest.len()),
            ));
        }
        if !rest.is_char_boundary(len) {
            return Err(CoreError::malformed(field, "length splits a UTF-8 sequence"));
        }

        let (value, tail) = rest.split_at(len);
        fields.push(value.to_owned());
        rest = tail;
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_example() {
        assert_eq!(encode_with_length(["ab", "cde"]), "2:ab,3:cde");
    }

    #[test]
    fn test_decode_example() {
        let fields = decode_from_length("2:ab,3:cde", 2).unwrap();
        assert_eq!(fields, vec!["ab", "cde"]);
    }

    #[test]
    fn test_zero_fields() {
        assert_eq!(encode_with_length(Vec::<String>::new()), "");
        assert!(decode_from_length("", 0).unwrap().is_empty());
    }

    #[test]
    fn test_empty_fields() {
        let packed = encode_with_length(["", "", "x"]);
        assert_eq!(packed, "0:,0:,1:x");
        assert_eq!(decode_from_length(&packed, 3).unwrap(), vec!["", "", "x"]);
    }

    #[test]
    fn test_delimiters_inside_payload() {
        let fields = ["1:a,2:bc", ",,::", "12345"];
        let packed = encode_with_length(fields);
        assert_eq!(decode_from_length(&packed, 3).unwrap(), fields);
    }

    #[test]
    fn test_lengths_are_bytes() {
        let packed = encode_with_length(["é", "日本"]);
        assert_eq!(packed, "2:é,6:日本");
        assert_eq!(decode_from_length(&packed, 2).unwrap(), vec!["é", "日本"]);
    }

    #[test]
    fn test_append_extends_frame() {
        let mut buf = encode_with_length(["a"]);
        encode_with_length_into(&mut buf, ["bb"]);
        assert_eq!(buf, "1:a,2:bb");
    }

    #[test]
    fn test_trailing_content_ignored() {
        assert_eq!(decode_from_length("1:a,1:b", 1).unwrap(), vec!["a"]);
    }

    #[test]
    fn test_missing_length_prefix() {
        let err = decode_from_length("ab", 1).unwrap_err();
        assert!(matches!(err, CoreError::MalformedFrame { field: 0, .. }));
    }

    #[test]
    fn test_missing_separator() {
        let err = decode_from_length("2ab", 1).unwrap_err();
        assert!(matches!(err, CoreError::MalformedFrame { field: 0, .. }));
    }

    #[test]
    fn test_truncated_field() {
        let err = decode_from_length("5:abc", 1).unwrap_err();
        assert!(matches!(err, CoreError::MalformedFrame { field: 0, .. }));
    }

    #[test]
    fn test_too_few_fields() {
        let err = decode_from_length("2:ab", 2).unwrap_err();
        assert!(matches!(err, CoreError::MalformedFrame { field: 1, .. }));
    }

    #[test]
    fn test_missing_delimiter() {
        let err = decode_from_length("1:a1:b", 2).unwrap_err();
        assert!(matches!(err, CoreError::MalformedFrame { field: 1, .. }));
    }

    #[test]
    fn test_split_utf8_rejected() {
        let err = decode_from_length("1:é", 1).unwrap_err();
        assert!(matches!(err, CoreError::MalformedFrame { field: 0, .. }));
    }

    #[test]
    fn test_huge_field_count_rejected() {
        let err = decode_from_length("1:a", 1usize << 50).unwrap_err();
        assert!(matches!(err, CoreError::MalformedFrame { field: 1, .. }));
        let err = decode_from_length("0:,0:", usize::MAX).unwrap_err();
        assert!(matches!(err, CoreError::MalformedFrame { .. }));
    }

    #[test]
    fn test_tightest_frame_accepted() {
        assert_eq!(decode_from_length("0:,0:,0:", 3).unwrap(), vec!["", "", ""]);
        assert!(decode_from_length("0:,0:", 3).is_err());
    }

    proptest! {
        #[test]
        fn test_roundtrip(fields in prop::collection::vec("[0-9:,a-z\\PC]{0,16}", 0..8)) {
            let packed = encode_with_length(&fields);
            let decoded = decode_from_length(&packed, fields.len()).unwrap();
            prop_assert_eq!(decoded, fields);
        }

        #[test]
        fn test_any_count_on_any_input(input in "[0-9:,a-z]{0,24}", n in any::<usize>()) {
            if let Ok(fields) = decode_from_length(&input, n) {
                prop_assert_eq!(fields.len(), n);
            }
        }
    }
}

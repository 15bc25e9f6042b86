//! Typed property values and their prefixed string form.
//!
//! Every value is encoded as a one-letter type prefix followed by its
//! textual form:
//!
//! | prefix | type                                   |
//! |--------|----------------------------------------|
//! | `null` | [`Value::Null`] (the empty string too) |
//! | `s`    | string                                 |
//! | `B`    | byte (`i8`)                            |
//! | `BI`   | arbitrary-precision integer            |
//! | `BD`   | arbitrary-precision decimal            |
//! | `C`    | char                                   |
//! | `D`    | double (`f64`)                         |
//! | `F`    | float (`f32`)                          |
//! | `I`    | int (`i32`)                            |
//! | `J`    | long (`i64`)                           |
//! | `S`    | short (`i16`)                          |
//! | `Z`    | bool                                   |
//! | `m`    | object reference                       |
//! | `L`    | list, framed as `count, item, item...` |
//!
//! Arbitrary-precision numbers travel as validated decimal text and are
//! compared by that text, so `1.0` and `1.00` are different values.

use std::str::FromStr;

use crate::error::{CoreError, Result};
use crate::frame::{decode_from_length, encode_with_length};
use crate::serialize::IdentitySerializer;

const NULL: &str = "null";

/// A property value, generic over the model's object identity type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<O> {
    Null,
    Str(String),
    Byte(i8),
    Char(char),
    Double(f64),
    Float(f32),
    Int(i32),
    Long(i64),
    Short(i16),
    Bool(bool),
    /// Integer of any size, as decimal digits with an optional sign.
    BigInt(String),
    /// Decimal of any size and scale, e.g. `-12.50` or `1E+3`.
    BigDecimal(String),
    /// Reference to another model object.
    Object(O),
    List(Vec<Value<O>>),
}

impl<O> Value<O> {
    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// An arbitrary-precision integer from its decimal text.
    pub fn big_int(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if !is_integer(&text) {
            return Err(not_deserializable(&text, "not an integer"));
        }
        Ok(Value::BigInt(text))
    }

    /// An arbitrary-precision decimal from its text.
    pub fn big_decimal(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if !is_decimal(&text) {
            return Err(not_deserializable(&text, "not a decimal"));
        }
        Ok(Value::BigDecimal(text))
    }

    /// Encode to the prefixed string form.
    pub fn encode<S>(&self, serializer: &S) -> String
    where
        S: IdentitySerializer<Object = O> + ?Sized,
    {
        match self {
            Value::Null => NULL.to_string(),
            Value::Str(s) => format!("s{s}"),
            Value::Byte(v) => format!("B{v}"),
            Value::Char(v) => format!("C{v}"),
            Value::Double(v) => format!("D{v}"),
            Value::Float(v) => format!("F{v}"),
            Value::Int(v) => format!("I{v}"),
            Value::Long(v) => format!("J{v}"),
            Value::Short(v) => format!("S{v}"),
            Value::Bool(v) => format!("Z{v}"),
            Value::BigInt(v) => format!("BI{v}"),
            Value::BigDecimal(v) => format!("BD{v}"),
            Value::Object(o) => format!("m{}", serializer.serialize_object(o)),
            Value::List(items) => {
                let mut fields = Vec::with_capacity(items.len() + 1);
                fields.push(items.len().to_string());
                fields.extend(items.iter().map(|item| item.encode(serializer)));
                format!("L{}", encode_with_length(fields))
            }
        }
    }

    /// Decode from the prefixed string form.
    pub fn decode<S>(text: &str, serializer: &S) -> Result<Self>
    where
        S: IdentitySerializer<Object = O> + ?Sized,
    {
        if text.is_empty() || text == NULL {
            return Ok(Value::Null);
        }

        let mut chars = text.chars();
        let prefix = chars.next().unwrap_or_default();
        let rest = chars.as_str();

        let value = match prefix {
            's' => Value::Str(rest.to_string()),
            'B' => match (rest.strip_prefix('I'), rest.strip_prefix('D')) {
                (Some(digits), _) => Value::big_int(digits)?,
                (_, Some(digits)) => Value::big_decimal(digits)?,
                _ => Value::Byte(parse(text, rest)?),
            },
            'C' => {
                let mut it = rest.chars();
                match (it.next(), it.next()) {
                    (Some(c), None) => Value::Char(c),
                    _ => return Err(not_deserializable(text, "expected exactly one char")),
                }
            }
            'D' => Value::Double(parse(text, rest)?),
            'F' => Value::Float(parse(text, rest)?),
            'I' => Value::Int(parse(text, rest)?),
            'J' => Value::Long(parse(text, rest)?),
            'S' => Value::Short(parse(text, rest)?),
            'Z' => Value::Bool(parse(text, rest)?),
            'm' => Value::Object(serializer.deserialize_object(rest)?),
            'L' => Value::List(decode_list(rest, serializer)?),
            _ => return Err(not_deserializable(text, "unknown type prefix")),
        };
        Ok(value)
    }
}

fn decode_list<O, S>(rest: &str, serializer: &S) -> Result<Vec<Value<O>>>
where
    S: IdentitySerializer<Object = O> + ?Sized,
{
    let head = decode_from_length(rest, 1)?;
    let count: usize = parse(rest, &head[0])?;
    let fields = count
        .checked_add(1)
        .ok_or_else(|| not_deserializable(rest, "list length out of range"))?;
    decode_from_length(rest, fields)?
        .iter()
        .skip(1)
        .map(|item| Value::decode(item, serializer))
        .collect()
}

/// Optional sign, then at least one ASCII digit.
fn is_integer(text: &str) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Signed digits with at most one `.`, then an optional exponent.
fn is_decimal(text: &str) -> bool {
    let (mantissa, exponent) = match text.find(['e', 'E']) {
        Some(at) => (&text[..at], Some(&text[at + 1..])),
        None => (text, None),
    };
    let unsigned = mantissa.strip_prefix(['-', '+']).unwrap_or(mantissa);
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    let mantissa_ok = !(whole.is_empty() && fraction.is_empty()) && digits(whole) && digits(fraction);
    mantissa_ok && exponent.map_or(true, is_integer)
}

fn parse<T>(text: &str, rest: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    rest.parse()
        .map_err(|e: T::Err| not_deserializable(text, &e.to_string()))
}

fn not_deserializable(text: &str, reason: &str) -> CoreError {
    CoreError::NotDeserializable(format!("{text:?}: {reason}"))
}

impl<O> From<&str> for Value<O> {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl<O> From<String> for Value<O> {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<O> From<i32> for Value<O> {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl<O> From<i64> for Value<O> {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl<O> From<f64> for Value<O> {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl<O> From<bool> for Value<O> {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

//! Reversible converter stages and their composition.
//!
//! A serialized delta is produced by a chain of stages. Each stage is a
//! [`Converter`] with a forward and a backward direction that are exact
//! inverses on well-formed input. Stages compose with
//! [`ConverterExt::then`], so any stage can be swapped without touching
//! the others:
//!
//! ```text
//! Delta<O, P>  --StringDeltaConverter-->  StringDelta  --JsonConverter-->  String
//! ```

use std::collections::BTreeMap;
use std::hash::Hash;
use std::marker::PhantomData;

use serde_json::Value as JsonValue;

use crate::delta::{Change, Delta};
use crate::error::{CoreError, Result};
use crate::frame::{decode_from_length, encode_with_length};
use crate::serialize::IdentitySerializer;
use crate::value::Value;

/// Serialized object -> serialized property -> encoded new value.
pub type StringDelta = BTreeMap<String, BTreeMap<String, String>>;

/// A reversible conversion between `A` and `B`.
pub trait Converter<A, B>: Send + Sync {
    /// Convert `A` into `B`.
    fn forward(&self, value: &A) -> Result<B>;

    /// Convert `B` back into `A`.
    fn backward(&self, value: &B) -> Result<A>;
}

/// Two converters run one after the other.
pub struct Chain<X, Y, T> {
    first: X,
    second: Y,
    _mid: PhantomData<fn() -> T>,
}

impl<A, T, B, X, Y> Converter<A, B> for Chain<X, Y, T>
where
    X: Converter<A, T>,
    Y: Converter<T, B>,
{
    fn forward(&self, value: &A) -> Result<B> {
        self.second.forward(&self.first.forward(value)?)
    }

    fn backward(&self, value: &B) -> Result<A> {
        self.first.backward(&self.second.backward(value)?)
    }
}

/// Composition helper for converters.
pub trait ConverterExt<A, B>: Converter<A, B> + Sized {
    /// Append `next` after this stage.
    fn then<C, Y: Converter<B, C>>(self, next: Y) -> Chain<Self, Y, B> {
        Chain {
            first: self,
            second: next,
            _mid: PhantomData,
        }
    }
}

impl<A, B, X: Converter<A, B>> ConverterExt<A, B> for X {}

/// Structural stage: identities and values become strings.
///
/// Only the new value travels; the receiving side sees an unknown old
/// value.
pub struct StringDeltaConverter<S> {
    serializer: S,
}

impl<S> StringDeltaConverter<S> {
    pub fn new(serializer: S) -> Self {
        Self { serializer }
    }
}

impl<S> Converter<Delta<S::Object, S::Property>, StringDelta> for StringDeltaConverter<S>
where
    S: IdentitySerializer,
    S::Object: Eq + Hash,
    S::Property: Eq + Hash,
{
    fn forward(&self, delta: &Delta<S::Object, S::Property>) -> Result<StringDelta> {
        let mut out = StringDelta::new();
        for (object, props) in delta.objects() {
            let entry = out
                .entry(self.serializer.serialize_object(object))
                .or_default();
            for (property, change) in props {
                entry.insert(
                    self.serializer.serialize_property(property),
                    change.new.encode(&self.serializer),
                );
            }
        }
        Ok(out)
    }

    fn backward(&self, strings: &StringDelta) -> Result<Delta<S::Object, S::Property>> {
        let mut delta = Delta::new();
        for (object, props) in strings {
            for (property, value) in props {
                delta.insert(
                    self.serializer.deserialize_object(object)?,
                    self.serializer.deserialize_property(property)?,
                    Change::to(Value::decode(value, &self.serializer)?),
                );
            }
        }
        Ok(delta)
    }
}

/// Outer stage: a JSON object of objects of strings.
///
/// serde_json escapes control characters, so the output never contains a
/// raw newline.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl Converter<StringDelta, String> for JsonConverter {
    fn forward(&self, value: &StringDelta) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn backward(&self, text: &String) -> Result<StringDelta> {
        let root: JsonValue = serde_json::from_str(text)?;
        let root = match root {
            JsonValue::Null => return Ok(StringDelta::new()),
            JsonValue::Object(map) => map,
            other => {
                return Err(CoreError::NotDeserializable(format!(
                    "root is not an object but {}",
                    json_kind(&other)
                )))
            }
        };

        let mut out = StringDelta::new();
        for (object, props) in root {
            let props = match props {
                JsonValue::Object(props) => props,
                other => {
                    return Err(CoreError::NotDeserializable(format!(
                        "value of [{object}] is not an object but {}",
                        json_kind(&other)
                    )))
                }
            };
            let entry = out.entry(object.clone()).or_default();
            for (property, value) in props {
                match value {
                    JsonValue::String(value) => {
                        entry.insert(property, value);
                    }
                    other => {
                        return Err(CoreError::NotDeserializable(format!(
                            "value of [{object},{property}] is not a string but {}",
                            json_kind(&other)
                        )))
                    }
                }
            }
        }
        Ok(out)
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a bool",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Outer stage: one frame holding an entry count followed by one
/// `object, property, value` frame per entry.
///
/// The output contains newlines if any identity or value does.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramedLineConverter;

impl Converter<StringDelta, String> for FramedLineConverter {
    fn forward(&self, value: &StringDelta) -> Result<String> {
        let mut fields = vec![String::new()];
        for (object, props) in value {
            for (property, encoded) in props {
                fields.push(encode_with_length([object, property, encoded]));
            }
        }
        fields[0] = (fields.len() - 1).to_string();
        Ok(encode_with_length(fields))
    }

    fn backward(&self, text: &String) -> Result<StringDelta> {
        let head = decode_from_length(text, 1)?;
        let count: usize = head[0].parse().map_err(|_| {
            CoreError::NotDeserializable(format!("entry count {:?} is not a number", head[0]))
        })?;

        let fields = count.checked_add(1).ok_or_else(|| {
            CoreError::NotDeserializable(format!("entry count {count} out of range"))
        })?;

        let mut out = StringDelta::new();
        for entry in decode_from_length(text, fields)?.iter().skip(1) {
            let mut parts = decode_from_length(entry, 3)?.into_iter();
            if let (Some(object), Some(property), Some(value)) =
                (parts.next(), parts.next(), parts.next())
            {
                out.entry(object).or_default().insert(property, value);
            }
        }
        Ok(out)
    }
}

//! Proptest generators for property-based testing.

use proptest::prelude::*;

use deltalink_core::{Change, Delta, Value};
use deltalink_model::{MemoryModel, ObjectId, PropertyId};

/// Generate an object id.
pub fn object_id() -> impl Strategy<Value = ObjectId> {
    "[a-z][a-z0-9_]{0,7}".prop_map(ObjectId::new)
}

/// Generate a property id.
pub fn property_id() -> impl Strategy<Value = PropertyId> {
    "[a-z][a-z0-9_]{0,7}".prop_map(PropertyId::new)
}

fn finite_f64() -> impl Strategy<Value = f64> {
    any::<f64>().prop_filter("finite", |v| v.is_finite())
}

fn finite_f32() -> impl Strategy<Value = f32> {
    any::<f32>().prop_filter("finite", |v| v.is_finite())
}

/// Generate a non-list value.
pub fn leaf_value() -> impl Strategy<Value = Value<ObjectId>> {
    prop_oneof![
        any::<String>().prop_map(Value::Str),
        any::<char>().prop_map(Value::Char),
        finite_f64().prop_map(Value::Double),
        finite_f32().prop_map(Value::Float),
        integer(),
        any::<bool>().prop_map(Value::Bool),
        big_number(),
        object_id().prop_map(Value::Object),
    ]
}

fn integer() -> impl Strategy<Value = Value<ObjectId>> {
    prop_oneof![
        any::<i8>().prop_map(Value::Byte),
        any::<i16>().prop_map(Value::Short),
        any::<i32>().prop_map(Value::Int),
        any::<i64>().prop_map(Value::Long),
    ]
}

fn big_number() -> impl Strategy<Value = Value<ObjectId>> {
    prop_oneof![
        "[-+]?[0-9]{1,40}".prop_map(Value::BigInt),
        "-?[0-9]{1,20}\\.[0-9]{0,20}(E[-+]?[0-9]{1,3})?".prop_map(Value::BigDecimal),
    ]
}

/// Generate a value, lists nested up to three deep.
pub fn value() -> impl Strategy<Value = Value<ObjectId>> {
    leaf_value().prop_recursive(3, 24, 4, |inner| {
        prop::collection::vec(prop_oneof![Just(Value::Null), inner], 0..4).prop_map(Value::List)
    })
}

/// Generate a delta as seen by a receiver: old values unknown.
pub fn delta() -> impl Strategy<Value = Delta<ObjectId, PropertyId>> {
    prop::collection::vec((object_id(), property_id(), value()), 0..8).prop_map(|changes| {
        changes
            .into_iter()
            .map(|(o, p, v)| (o, p, Change::to(v)))
            .collect()
    })
}

/// A sequence of transactions against a [`MemoryModel`].
///
/// Writes of [`Value::Null`] remove the property.
#[derive(Debug, Clone)]
pub struct Script {
    pub transactions: Vec<Vec<(ObjectId, PropertyId, Value<ObjectId>)>>,
}

impl Script {
    /// Commit every transaction in order.
    pub fn run(&self, model: &MemoryModel) {
        for writes in &self.transactions {
            model
                .transact(|tx| {
                    for (o, p, v) in writes {
                        tx.set(o, p, v.clone())?;
                    }
                    Ok(())
                })
                .unwrap_or_else(|e| panic!("script transaction failed: {e}"));
        }
    }
}

impl Arbitrary for Script {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        // few ids so later transactions overwrite and remove earlier writes
        let write = (
            prop::sample::select(vec!["a", "b", "c"]).prop_map(ObjectId::from),
            prop::sample::select(vec!["x", "y"]).prop_map(PropertyId::from),
            prop_oneof![1 => Just(Value::Null), 4 => value()],
        );
        prop::collection::vec(prop::collection::vec(write, 1..4), 1..12)
            .prop_map(|transactions| Script { transactions })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltalink_core::DeltaCodec;
    use deltalink_model::MemorySerializer;

    proptest! {
        #[test]
        fn test_value_round_trip(v in value()) {
            let serializer = MemorySerializer::default();
            let text = v.encode(&serializer);
            prop_assert_eq!(Value::decode(&text, &serializer).unwrap(), v);
        }

        #[test]
        fn test_json_codec_round_trip(d in delta()) {
            let codec = DeltaCodec::json(MemorySerializer::default());
            let text = codec.encode(&d).unwrap();
            prop_assert!(!text.contains('\n'));
            prop_assert_eq!(codec.decode(&text).unwrap(), d);
        }

        #[test]
        fn test_framed_codec_round_trip(d in delta()) {
            let codec = DeltaCodec::framed(MemorySerializer::default());
            let text = codec.encode(&d).unwrap();
            prop_assert_eq!(codec.decode(&text).unwrap(), d);
        }

        #[test]
        fn test_script_is_deterministic(script: Script) {
            let first = MemoryModel::new("first");
            let second = MemoryModel::new("second");
            script.run(&first);
            script.run(&second);
            prop_assert_eq!(first.snapshot(), second.snapshot());
            first.stop();
            second.stop();
        }
    }
}

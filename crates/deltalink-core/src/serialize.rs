//! Serialization capability for model identities.
//!
//! The delta codec never interprets object or property identities. It asks
//! an [`IdentitySerializer`] supplied by the model binding to turn them
//! into strings that both peers resolve to the same thing, and back.

use std::sync::Arc;

use crate::error::Result;

/// Maps model object and property identities to strings and back.
///
/// Implementations must be inverse pairs: deserializing a serialized
/// identity yields an identity equal to the original on the peer side.
pub trait IdentitySerializer: Send + Sync {
    /// Object identity type of the model.
    type Object;
    /// Property identity type of the model.
    type Property;

    /// Serialize an object identity.
    fn serialize_object(&self, object: &Self::Object) -> String;

    /// Serialize a property identity.
    fn serialize_property(&self, property: &Self::Property) -> String;

    /// Resolve an object identity from its string form.
    fn deserialize_object(&self, s: &str) -> Result<Self::Object>;

    /// Resolve a property identity from its string form.
    fn deserialize_property(&self, s: &str) -> Result<Self::Property>;
}

impl<T: IdentitySerializer + ?Sized> IdentitySerializer for Arc<T> {
    type Object = T::Object;
    type Property = T::Property;

    fn serialize_object(&self, object: &Self::Object) -> String {
        (**self).serialize_object(object)
    }

    fn serialize_property(&self, property: &Self::Property) -> String {
        (**self).serialize_property(property)
    }

    fn deserialize_object(&self, s: &str) -> Result<Self::Object> {
        (**self).deserialize_object(s)
    }

    fn deserialize_property(&self, s: &str) -> Result<Self::Property> {
        (**self).deserialize_property(s)
    }
}

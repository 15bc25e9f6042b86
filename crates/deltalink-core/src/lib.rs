//! # deltalink core
//!
//! Pure primitives for delta replication: no threads, no sockets.
//!
//! ## Key Types
//!
//! - [`Delta`] - Changed properties of a commit, per object and property
//! - [`Value`] - A property value with its prefixed string form
//! - [`IdentitySerializer`] - Maps model identities to strings and back
//! - [`DeltaCodec`] - The converter chain between a delta and one wire line
//!
//! ## Framing
//!
//! Multi-field strings use the length-prefixed format of the [`frame`]
//! module, which tolerates any content inside a field.

pub mod codec;
pub mod converter;
pub mod delta;
pub mod error;
pub mod frame;
pub mod serialize;
pub mod value;

pub use codec::DeltaCodec;
pub use converter::{
    Chain, Converter, ConverterExt, FramedLineConverter, JsonConverter, StringDelta,
    StringDeltaConverter,
};
pub use delta::{Change, Delta};
pub use error::{CoreError, Result};
pub use frame::{decode_from_length, encode_with_length, encode_with_length_into};
pub use serialize::IdentitySerializer;
pub use value::Value;

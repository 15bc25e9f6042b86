//! The delta codec handed to the adaptor.

use std::fmt;
use std::hash::Hash;

use crate::converter::{
    Converter, ConverterExt, FramedLineConverter, JsonConverter, StringDeltaConverter,
};
use crate::delta::Delta;
use crate::error::Result;
use crate::serialize::IdentitySerializer;

/// Boxed converter chain between a [`Delta`] and its wire string.
pub struct DeltaCodec<O: Eq + Hash, P: Eq + Hash> {
    chain: Box<dyn Converter<Delta<O, P>, String>>,
}

impl<O, P> DeltaCodec<O, P>
where
    O: Eq + Hash + 'static,
    P: Eq + Hash + 'static,
{
    /// Wrap an arbitrary converter chain.
    pub fn new(chain: impl Converter<Delta<O, P>, String> + 'static) -> Self {
        Self {
            chain: Box::new(chain),
        }
    }

    /// Identity serialization followed by the JSON stage.
    ///
    /// The output is always a single line.
    pub fn json<S>(serializer: S) -> Self
    where
        S: IdentitySerializer<Object = O, Property = P> + 'static,
    {
        Self::new(StringDeltaConverter::new(serializer).then(JsonConverter))
    }

    /// Identity serialization followed by the length-prefixed framing stage.
    pub fn framed<S>(serializer: S) -> Self
    where
        S: IdentitySerializer<Object = O, Property = P> + 'static,
    {
        Self::new(StringDeltaConverter::new(serializer).then(FramedLineConverter))
    }

    pub fn encode(&self, delta: &Delta<O, P>) -> Result<String> {
        self.chain.forward(delta)
    }

    pub fn decode(&self, text: &str) -> Result<Delta<O, P>> {
        self.chain.backward(&text.to_string())
    }
}

impl<O: Eq + Hash, P: Eq + Hash> fmt::Debug for DeltaCodec<O, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaCodec").finish_non_exhaustive()
    }
}

//! A replication node: one model, one adaptor, one transport.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use deltalink_core::{DeltaCodec, IdentitySerializer};
use deltalink_model::{Model, ObjectFilter, PropertyFilter};
use deltalink_sync::{
    AdaptorConfig, DeltaAdaptor, Role, TcpTransport, TransportConfig, TransportHandle,
};

use crate::error::{LinkError, Result};

/// Environment variable naming the node's role.
pub const ROLE_ENV: &str = "DELTALINK_ROLE";
/// Environment variable overriding the host.
pub const HOST_ENV: &str = "DELTALINK_HOST";
/// Environment variable overriding the port.
pub const PORT_ENV: &str = "DELTALINK_PORT";

/// Wire format of serialized deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// JSON object of objects of encoded values. Always one line.
    #[default]
    Json,
    /// Length-prefixed frames.
    Framed,
}

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name used for the adaptor worker and in logs.
    pub name: String,
    #[serde(default)]
    pub codec: CodecKind,
    #[serde(default)]
    pub adaptor: AdaptorConfig,
    pub transport: TransportConfig,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            codec: CodecKind::default(),
            adaptor: AdaptorConfig::default(),
            transport: TransportConfig::new(role),
        }
    }

    /// Build from `DELTALINK_ROLE`, `DELTALINK_HOST` and `DELTALINK_PORT`.
    ///
    /// The role is required and must be `server` or `client`.
    pub fn from_env(name: impl Into<String>) -> Result<Self> {
        let role = Role::from_config(std::env::var(ROLE_ENV).ok().as_deref())?;
        let mut config = Self::new(name, role);
        if let Ok(host) = std::env::var(HOST_ENV) {
            config.transport.host = host;
        }
        if let Ok(port) = std::env::var(PORT_ENV) {
            config.transport.port = port
                .parse()
                .map_err(|_| LinkError::Config(format!("{PORT_ENV}={port:?} is not a port")))?;
        }
        Ok(config)
    }

    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_adaptor(mut self, adaptor: AdaptorConfig) -> Self {
        self.adaptor = adaptor;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}

/// A model bound to a running replication link.
pub struct SyncNode<M: Model> {
    name: String,
    adaptor: Arc<DeltaAdaptor<M>>,
    transport: TransportHandle,
}

impl<M: Model> SyncNode<M> {
    /// Build the codec, adaptor and transport and start them.
    pub fn start<S>(
        model: Arc<M>,
        serializer: S,
        objects: ObjectFilter<M::Object>,
        properties: PropertyFilter<M::Property>,
        config: NodeConfig,
    ) -> Result<Self>
    where
        S: IdentitySerializer<Object = M::Object, Property = M::Property> + 'static,
    {
        let codec = match config.codec {
            CodecKind::Json => DeltaCodec::json(serializer),
            CodecKind::Framed => DeltaCodec::framed(serializer),
        };
        let adaptor = Arc::new(DeltaAdaptor::with_config(
            config.name.clone(),
            model,
            objects,
            properties,
            codec,
            config.adaptor,
        )?);

        let transport = match TcpTransport::new(config.transport).start(Arc::clone(&adaptor)) {
            Ok(transport) => transport,
            Err(e) => {
                adaptor.stop();
                adaptor.interrupt();
                adaptor.join();
                return Err(e.into());
            }
        };

        info!(
            node = %config.name,
            role = %transport.role(),
            local_addr = ?transport.local_addr(),
            "node started"
        );
        Ok(Self {
            name: config.name,
            adaptor,
            transport,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adaptor(&self) -> &Arc<DeltaAdaptor<M>> {
        &self.adaptor
    }

    pub fn model(&self) -> &Arc<M> {
        self.adaptor.model()
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Bound address when listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn is_busy(&self) -> bool {
        self.adaptor.is_busy()
    }

    pub fn last_fatal_error(&self) -> Option<Arc<anyhow::Error>> {
        self.adaptor.last_fatal_error()
    }

    /// Stop the adaptor and the transport and wait for both.
    ///
    /// Returns how the transport ended; a refused connection shows up
    /// here as [`deltalink_sync::SyncError::ConnectionRefused`].
    pub fn shutdown(&self) -> Result<()> {
        info!(node = %self.name, "shutting down");
        self.adaptor.stop();
        self.adaptor.interrupt();
        self.transport.shutdown();
        self.adaptor.join();
        self.transport.join()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = NodeConfig::new("a", Role::Server);
        assert_eq!(config.codec, CodecKind::Json);
        assert_eq!(config.adaptor, AdaptorConfig::default());
        assert_eq!(config.transport.role, Role::Server);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "name": "b",
            "codec": "framed",
            "transport": {
                "role": "client",
                "host": "127.0.0.1",
                "port": 6000,
                "startup_delay": { "secs": 0, "nanos": 0 },
                "connect_attempts": 3,
                "retry_interval": { "secs": 0, "nanos": 100000000 },
                "duplex": true
            }
        }"#;
        let config: NodeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.codec, CodecKind::Framed);
        assert_eq!(config.adaptor, AdaptorConfig::default());
        assert_eq!(config.transport.role, Role::Client);
        assert_eq!(config.transport.port, 6000);
        assert_eq!(config.transport.bind_host, "0.0.0.0");
        assert!(config.transport.duplex);
    }

    #[test]
    fn test_config_rejects_unknown_role() {
        let json = r#"{ "name": "c", "transport": { "role": "none" } }"#;
        assert!(serde_json::from_str::<NodeConfig>(json).is_err());
    }
}

//! The client-facing configuration surface: a chainable `TransportConfig` builder plus the
//! top-level `ClientConfig` a `Connection` is started from.

use std::sync::Arc;

use failure::Fail;
use slog::Logger;

use crate::cid::{ConnectionIdGenerator, RandomConnectionIdGenerator};
use crate::congestion::{ControllerFactory, NewRenoFactory};
use crate::tls::TlsSessionFactory;
use crate::version::Version;
use crate::{MAX_CID_SIZE, MIN_CID_SIZE};

#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "connection ID length must be between 4 and 20 bytes")]
    CidLength,
    #[fail(display = "requested version {:#x} is below the minimum supported version", _0)]
    UnsupportedVersion(u32),
    #[fail(display = "server name must not be empty")]
    InvalidServerName,
}

/// Connection-wide knobs that aren't specific to any one handshake: idle timeout, flow control
/// window sizes, and which congestion controller to run.
#[derive(Clone)]
pub struct TransportConfig {
    pub(crate) max_idle_timeout: u64,
    pub(crate) initial_max_data: u64,
    pub(crate) initial_max_stream_data_bidi_local: u64,
    pub(crate) initial_max_stream_data_bidi_remote: u64,
    pub(crate) initial_max_stream_data_uni: u64,
    pub(crate) initial_max_streams_bidi: u64,
    pub(crate) initial_max_streams_uni: u64,
    pub(crate) active_connection_id_limit: u64,
    pub(crate) congestion_controller_factory: Arc<dyn ControllerFactory>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_timeout: 30_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 20,
            initial_max_stream_data_bidi_remote: 1 << 20,
            initial_max_stream_data_uni: 1 << 20,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            active_connection_id_limit: 4,
            congestion_controller_factory: Arc::new(NewRenoFactory::default()),
        }
    }
}

impl TransportConfig {
    pub fn max_idle_timeout(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.max_idle_timeout = value;
        Ok(self)
    }

    pub fn initial_max_data(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.initial_max_data = value;
        Ok(self)
    }

    pub fn active_connection_id_limit(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.active_connection_id_limit = value.max(2);
        Ok(self)
    }

    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn ControllerFactory>,
    ) -> Result<&mut Self, ConfigError> {
        self.congestion_controller_factory = factory;
        Ok(self)
    }
}

/// Fully resolved configuration for one or more client connection attempts.
pub struct ClientConfig {
    pub(crate) version: Version,
    pub(crate) cid_generator_factory: Arc<dyn Fn() -> Box<dyn ConnectionIdGenerator> + Send + Sync>,
    pub(crate) server_name: String,
    pub(crate) alpn_protocols: Vec<Vec<u8>>,
    pub(crate) transport: TransportConfig,
    pub(crate) tls_session_factory: Option<Arc<dyn TlsSessionFactory>>,
    pub(crate) logger: Logger,
}

/// Builds a `ClientConfig`, mirroring the teacher's chainable, `Result`-returning setter style
/// so invalid combinations (a version below the floor this client supports, an out-of-range
/// CID length) are caught at configuration time rather than deep inside the handshake.
pub struct ClientConfigBuilder {
    version: Version,
    cid_len: usize,
    server_name: String,
    alpn_protocols: Vec<Vec<u8>>,
    transport: TransportConfig,
    tls_session_factory: Option<Arc<dyn TlsSessionFactory>>,
    logger: Logger,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            version: Version::DEFAULT,
            cid_len: 8,
            server_name: String::new(),
            alpn_protocols: Vec::new(),
            transport: TransportConfig::default(),
            tls_session_factory: None,
            logger: Logger::root(slog::Discard, slog::o!()),
        }
    }
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the QUIC version this client offers. Must be at or above `Version::MIN_SUPPORTED`.
    pub fn version(&mut self, version: Version) -> Result<&mut Self, ConfigError> {
        if version.before(Version::MIN_SUPPORTED) {
            return Err(ConfigError::UnsupportedVersion(version.0));
        }
        self.version = version;
        Ok(self)
    }

    pub fn connection_id_length(&mut self, len: usize) -> Result<&mut Self, ConfigError> {
        if len < MIN_CID_SIZE || len > MAX_CID_SIZE {
            return Err(ConfigError::CidLength);
        }
        self.cid_len = len;
        Ok(self)
    }

    /// Sets the server name (for SNI/transport-parameter echo checks) and ALPN protocols this
    /// connection will offer, e.g. `uri("example.com", &[b"h3"])`.
    pub fn uri(&mut self, server_name: &str, alpn_protocols: &[&[u8]]) -> Result<&mut Self, ConfigError> {
        if server_name.is_empty() {
            return Err(ConfigError::InvalidServerName);
        }
        self.server_name = server_name.to_owned();
        self.alpn_protocols = alpn_protocols.iter().map(|p| p.to_vec()).collect();
        Ok(self)
    }

    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    pub fn transport_config(&mut self, transport: TransportConfig) -> &mut Self {
        self.transport = transport;
        self
    }

    pub fn tls_session_factory(&mut self, factory: Arc<dyn TlsSessionFactory>) -> &mut Self {
        self.tls_session_factory = Some(factory);
        self
    }

    pub fn build(&self) -> ClientConfig {
        let cid_len = self.cid_len;
        ClientConfig {
            version: self.version,
            cid_generator_factory: Arc::new(move || {
                Box::new(RandomConnectionIdGenerator::new(cid_len)) as Box<dyn ConnectionIdGenerator>
            }),
            server_name: self.server_name.clone(),
            alpn_protocols: self.alpn_protocols.clone(),
            transport: self.transport.clone(),
            tls_session_factory: self.tls_session_factory.clone(),
            logger: self.logger.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_below_floor_is_rejected() {
        let mut builder = ClientConfigBuilder::new();
        let err = builder.version(Version(0xff00_0010)).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(_)));
    }

    #[test]
    fn cid_length_out_of_range_is_rejected() {
        let mut builder = ClientConfigBuilder::new();
        assert!(builder.connection_id_length(0).is_err());
        assert!(builder.connection_id_length(21).is_err());
        assert!(builder.connection_id_length(8).is_ok());
    }

    #[test]
    fn empty_server_name_is_rejected() {
        let mut builder = ClientConfigBuilder::new();
        assert!(builder.uri("", &[]).is_err());
        assert!(builder.uri("example.com", &[b"h3"]).is_ok());
    }

    #[test]
    fn build_produces_a_working_cid_generator() {
        let mut builder = ClientConfigBuilder::new();
        builder.connection_id_length(6).unwrap();
        let config = builder.build();
        let mut gen = (config.cid_generator_factory)();
        assert_eq!(gen.cid_len(), 6);
        assert_eq!(gen.generate().len(), 6);
    }
}

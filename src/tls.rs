//! The seam between this crate and a TLS 1.3 engine (RFC 9001). Handshake message framing,
//! key derivation, and record protection all live behind `TlsSession`; this crate only needs to
//! know when the handshake has produced new keys, when it's finished, and what transport
//! parameters the peer sent inside it.

use crate::transport_parameters::TransportParameters;
use crate::TransportError;

/// One TLS 1.3 client session driving a single QUIC connection's handshake.
///
/// A real implementation wraps something like `rustls::ClientSession`, feeding it CRYPTO frame
/// bytes and pulling out both the next flight to send and newly available traffic secrets.
pub trait TlsSession: Send {
    /// Feeds newly received CRYPTO frame bytes at the current encryption level into the
    /// handshake. Returns an error if the peer's handshake message was rejected.
    fn read_handshake(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Pulls the next flight of outgoing handshake bytes, if any are ready to send.
    fn write_handshake(&mut self) -> Option<Vec<u8>>;

    /// True once the handshake has produced 1-RTT keys usable for sending.
    fn is_handshaking(&self) -> bool;

    /// True once the peer's Finished message has been verified, completing the handshake.
    fn is_handshake_confirmed(&self) -> bool;

    /// The peer's transport parameters, available as soon as its encrypted extensions (or, for
    /// a server, ClientHello) have been processed.
    fn peer_transport_parameters(&self) -> Option<&TransportParameters>;
}

/// Builds a fresh `TlsSession` for each new connection a `ClientConfig` is used to start.
pub trait TlsSessionFactory: Send + Sync {
    fn start_session(
        &self,
        server_name: &str,
        local_params: &TransportParameters,
    ) -> Box<dyn TlsSession>;
}

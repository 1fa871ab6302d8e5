//! Transport boundary.
//!
//! The engine does not open sockets itself. A [`Transport`] implementation is
//! injected at construction together with the sending half of an event
//! channel; the engine's demux loop is the only consumer of the receiving
//! half. The endpoint descriptor is opaque here — a URL-like string the
//! implementation knows how to dial.

use std::collections::BTreeMap;

use bytes::Bytes;
use hublink_core::TransportError;

/// Events a transport pushes into the engine.
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport finished connecting (and any TLS identity was settled).
    Connected,
    /// The transport dropped. Terminal until the next `open`.
    Disconnected,
    /// Connecting or I/O failed.
    Error(TransportError),
    /// Raw bytes arrived. Framing is the codec's concern, not the transport's.
    Data(Bytes),
    /// TLS verification failed below this layer. The connection is held until
    /// [`Transport::set_certificate_trusted`] decides.
    CertificateCheck {
        /// Issuer fields of the presented certificate (CN, O, ...).
        issuer_info: BTreeMap<String, String>,
        /// The certificate, PEM-encoded.
        pem: Bytes,
    },
}

/// Duplex byte transport under the engine.
pub trait Transport: Send + Sync + 'static {
    /// Begin connecting. Completion is reported through `Connected`,
    /// `CertificateCheck` or `Error` events, never synchronously.
    fn open(&self, endpoint: &str) -> Result<(), TransportError>;

    /// Ask the transport to close; `Disconnected` confirms. Implementations
    /// without a graceful-close concept may confirm immediately.
    fn close(&self);

    /// Queue one wire frame.
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Resolve a held `CertificateCheck`: `true` resumes the handshake,
    /// `false` fails the attempt with a trust error.
    fn set_certificate_trusted(&self, trusted: bool);
}

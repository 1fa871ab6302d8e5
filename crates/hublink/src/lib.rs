//! hublink: client engine for a JSON-RPC automation hub.
//!
//! One persistent, bidirectional connection to a hub; correlated
//! request/reply calls over it; fan-out of unsolicited notifications to
//! subscribers; and an authentication/trust state machine that survives the
//! transport connecting, dropping or failing at any point.
//!
//! # Quick start
//!
//! ```ignore
//! use hublink::{ClientConfig, Endpoint, FileTrustStore, HubClient, HubEvent};
//!
//! // A transport implementation pushes TransportEvents into `transport_rx`.
//! let (client, mut events) = HubClient::new(
//!     Box::new(transport),
//!     transport_rx,
//!     Box::new(FileTrustStore::new("/var/lib/myapp/certs")),
//!     ClientConfig::new("living-room-panel"),
//! );
//! tokio::spawn(client.clone().run());
//!
//! client.connect(Endpoint::with_server_id("wss://hub.local:4445", hub_id))?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         HubEvent::HandshakeReceived(caps) if caps.authentication_required => {
//!             client.authenticate("alice", "secret")?;
//!         }
//!         HubEvent::ConnectionStatusChanged(status) => { /* ... */ }
//!         _ => {}
//!     }
//! }
//!
//! // Once authenticated, issue commands and await replies:
//! let reply = client.send_command("Devices.List", serde_json::json!({}))?;
//! let devices = reply.await?;
//! ```
//!
//! The transport is an injected collaborator (see [`Transport`]); this crate
//! never opens sockets itself. `hublink-testkit` provides an in-memory pair
//! for tests.

mod auth;
mod client;
mod config;
mod event;
mod transport;
mod trust;

pub use auth::{AuthState, Capabilities, CloudConnectionState};
pub use client::{
    CommandError, ConnectError, ConnectionStatus, Endpoint, HubClient, PendingReply,
};
pub use config::{CertificatePinning, ClientConfig};
pub use event::HubEvent;
pub use transport::{Transport, TransportEvent};
pub use trust::{FileTrustStore, MemoryTrustStore, TrustStore};

// The protocol-layer types callers interact with directly.
pub use hublink_core::{
    CallError, CallResult, MethodFilter, Notification, ProtocolVersion, SubscriberId,
    TransportError,
};

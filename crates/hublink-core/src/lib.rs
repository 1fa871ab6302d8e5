//! hublink-core: Protocol types for the hublink client engine.
//!
//! This crate defines:
//! - The JSON wire envelope and framing codec ([`EnvelopeCodec`])
//! - The pending-call registry ([`PendingCalls`])
//! - The notification router ([`NotificationRouter`])
//! - Protocol version ordering ([`ProtocolVersion`])
//! - Error types ([`TransportError`], [`ProtocolError`], [`CallError`])
//!
//! No I/O happens here. The engine crate (`hublink`) owns the transport and
//! drives these pieces from its demux loop.

mod envelope;
mod error;
mod pending;
mod router;
mod version;

pub use envelope::*;
pub use error::*;
pub use pending::*;
pub use router::*;
pub use version::*;

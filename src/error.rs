//! # Error Taxonomy
//!
//! This module defines the typed error surface shared by every layer of the
//! stack: transports, redundant sessions, the presentation controller, and
//! the register store. Errors that threaten consistency (configuration
//! mistakes) are distinct from errors that are in-band with data flow
//! (transport faults, malformed payloads) so that callers can tell at a
//! glance which ones demand attention and which ones are routinely counted
//! and suppressed.
//!
//! `anyhow::Error` is reserved for the CLI boundary, where additional
//! human-readable context is attached before the error is reported to the
//! user; library code always returns [`Error`].

use thiserror::Error;

/// The unified error type returned by fallible operations in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Raised synchronously when an operation would leave the redundant
    /// transport, a register, or a session in an inconsistent state:
    /// mismatched inferior node-IDs, incompatible transfer-ID moduli, or an
    /// invalid register value conversion.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Raised when a closed port (publisher, subscriber, client, server, or
    /// a redundant session) is used, or when a pending operation on it is
    /// preempted by closure.
    #[error("port is closed")]
    ClosedPort,

    /// Raised by a client when every `transfer_id mod modulus` slot already
    /// has a request pending; the caller may retry once an in-flight call
    /// completes.
    #[error("no free transfer-ID slot: all {modulo} values are in use")]
    RequestIdExhausted {
        /// The transfer-ID modulus in effect at the time of the call.
        modulo: u64,
    },

    /// A recoverable I/O fault reported by a concrete transport. Carries the
    /// inferior's description for diagnostics.
    #[error("transport error: {0}")]
    Transport(String),

    /// A transfer's payload could not be decoded into the requested DSDL
    /// type. Never surfaces past the subscriber/client boundary; it is only
    /// ever counted.
    #[error("deserialization failure: {0}")]
    Deserialization(String),

    /// A response transfer arrived with no matching pending request.
    #[error("unexpected peer response: transfer-id {transfer_id} from node {source_node_id:?}")]
    UnexpectedResponse {
        /// The transfer-ID the response carried.
        transfer_id: u64,
        /// The node the response claims to originate from, if any.
        source_node_id: Option<u16>,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

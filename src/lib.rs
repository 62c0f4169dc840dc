//! # Cyphal Core
//!
//! A Rust implementation of the presentation-layer and transport-layer core
//! of the UAVCAN/Cyphal v1.0 protocol stack: typed publishers, subscribers,
//! clients and servers; a redundant/composite transport with transfer
//! deduplication; and a loopback reference transport. The DSDL compiler and
//! generated code, and concrete CAN/UDP/serial transports, are out of scope
//! and treated as external collaborators.

pub mod cli;
pub mod error;
pub mod logging;
pub mod presentation;
pub mod register;
pub mod transport;

pub use error::{Error, Result};
pub use presentation::{
    Client, DsdlType, GetInfoRequest, GetInfoResponse, Handler, PresentationController, Publisher, RequestMetadata,
    ScalarValue, Server, Subscriber,
};
pub use register::{RegisterStore, RegisterValue};
pub use transport::{NodeId, PortId, Priority, Transport};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

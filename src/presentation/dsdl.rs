//! # DSDL Type Stand-In
//!
//! The DSDL compiler and its generated code are external collaborators;
//! this crate exposes publishers, subscribers,
//! clients and servers as generic over any payload type implementing
//! [`DsdlType`] — a byte-level `serialize`/`deserialize` pair plus an
//! `EXTENT_BYTES` constant standing in for the `PayloadMetadata` a real
//! DSDL type would supply. [`bincode`] does the actual encoding.

use crate::error::{Error, Result};
use crate::transport::{Fragment, FragmentedPayload, PayloadMetadata, PortId};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// A stand-in for DSDL-generated code: anything serializable to a single
/// contiguous byte fragment with a known maximum size.
pub trait DsdlType: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// The fixed maximum serialized size of this type, used as the
    /// session's [`PayloadMetadata`].
    const EXTENT_BYTES: usize;

    /// The regulated/fixed port-ID this type defines, if any. `None` for
    /// vendor/application-specific types, which have no fixed port-ID and
    /// must always be constructed with an explicit subject/service-ID.
    const FIXED_PORT_ID: Option<PortId> = None;

    fn payload_metadata() -> PayloadMetadata {
        PayloadMetadata { extent_bytes: Self::EXTENT_BYTES }
    }

    fn to_fragmented_payload(&self) -> Result<FragmentedPayload> {
        let bytes = bincode::serialize(self).map_err(|e| Error::Deserialization(e.to_string()))?;
        let fragment: Fragment = Arc::from(bytes.into_boxed_slice());
        Ok(vec![fragment])
    }

    fn from_fragments(fragments: &[Fragment]) -> Result<Self> {
        // Loopback never actually fragments, so concatenation is
        // cheap; a framed transport would instead hand this a coalesced
        // buffer built while reassembling frames.
        let mut bytes = Vec::new();
        for fragment in fragments {
            bytes.extend_from_slice(fragment);
        }
        bincode::deserialize(&bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// A scalar demo message type, used by the CLI and by the pub/sub
/// end-to-end pub/sub smoke test: a single 32-bit float.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScalarValue(pub f32);

impl DsdlType for ScalarValue {
    const EXTENT_BYTES: usize = 4;
}

/// The request half of the demo `GetInfo` service used by the client/server
/// end-to-end client/server smoke test. `uavcan.node.GetInfo` is one of the
/// protocol's regulated fixed-port-ID services, so this stand-in carries
/// that same fixed service-ID (430) to exercise the fixed-port-ID helpers.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Default)]
pub struct GetInfoRequest;

impl DsdlType for GetInfoRequest {
    const EXTENT_BYTES: usize = 0;
    const FIXED_PORT_ID: Option<PortId> = Some(430);
}

/// The response half of the demo `GetInfo` service.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GetInfoResponse {
    pub name: String,
    pub software_version: (u8, u8),
}

impl DsdlType for GetInfoResponse {
    const EXTENT_BYTES: usize = 256;
    const FIXED_PORT_ID: Option<PortId> = Some(430);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_value_round_trips() {
        let value = ScalarValue(402.15);
        let fragments = value.to_fragmented_payload().unwrap();
        let decoded = ScalarValue::from_fragments(&fragments).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn get_info_response_round_trips() {
        let value = GetInfoResponse { name: "node".into(), software_version: (1, 0) };
        let fragments = value.to_fragmented_payload().unwrap();
        let decoded = GetInfoResponse::from_fragments(&fragments).unwrap();
        assert_eq!(decoded, value);
    }
}

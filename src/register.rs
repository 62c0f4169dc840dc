//! # Register Store
//!
//! An in-memory, typed configuration database standing in for the network
//! register interface: every `uavcan.*` register the node/CLI bootstrap
//! logic needs, plus an environment-variable overlay, plus the in-process
//! equivalent of the network's "list" and "access" RPCs. The typed,
//! layered-defaults shape follows this crate's own CLI config surface; the
//! register semantics themselves follow the pyuavcan register
//! documentation.

use crate::error::{Error, Result};
use crate::transport::loopback::{LoopbackTransport, DEFAULT_PROTOCOL_PARAMETERS};
use crate::transport::{NodeId, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// An MTU at or below this many bytes is assumed to be classic CAN, which
/// cannot carry a full 128-bit unique-ID in a single allocation request;
/// larger MTUs (CAN FD, UDP, serial) get the v2 plug-and-play protocol.
pub const PNP_V2_MTU_THRESHOLD: usize = 9;

/// Picks the plug-and-play allocation protocol version for a transport with
/// the given MTU.
pub fn pnp_protocol_version_for_mtu(mtu: usize) -> u8 {
    if mtu < PNP_V2_MTU_THRESHOLD {
        1
    } else {
        2
    }
}

/// A typed register value. Mirrors the DSDL `uavcan.register.Value` union:
/// one variant per primitive array type, plus string and opaque bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Bit(Vec<bool>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    String(String),
    Unstructured(Vec<u8>),
}

impl RegisterValue {
    fn kind(&self) -> &'static str {
        match self {
            RegisterValue::Bit(_) => "bit",
            RegisterValue::I8(_) => "i8",
            RegisterValue::I16(_) => "i16",
            RegisterValue::I32(_) => "i32",
            RegisterValue::I64(_) => "i64",
            RegisterValue::U8(_) => "u8",
            RegisterValue::U16(_) => "u16",
            RegisterValue::U32(_) => "u32",
            RegisterValue::U64(_) => "u64",
            RegisterValue::F32(_) => "f32",
            RegisterValue::F64(_) => "f64",
            RegisterValue::String(_) => "string",
            RegisterValue::Unstructured(_) => "unstructured",
        }
    }

    fn parse_env(kind_template: &RegisterValue, raw: &str) -> RegisterValue {
        match kind_template {
            RegisterValue::Bit(_) => RegisterValue::Bit(
                raw.split_whitespace().map(|tok| matches!(tok, "1" | "true" | "True")).collect(),
            ),
            RegisterValue::I8(_) => RegisterValue::I8(parse_tokens(raw)),
            RegisterValue::I16(_) => RegisterValue::I16(parse_tokens(raw)),
            RegisterValue::I32(_) => RegisterValue::I32(parse_tokens(raw)),
            RegisterValue::I64(_) => RegisterValue::I64(parse_tokens(raw)),
            RegisterValue::U8(_) => RegisterValue::U8(parse_tokens(raw)),
            RegisterValue::U16(_) => RegisterValue::U16(parse_tokens(raw)),
            RegisterValue::U32(_) => RegisterValue::U32(parse_tokens(raw)),
            RegisterValue::U64(_) => RegisterValue::U64(parse_tokens(raw)),
            RegisterValue::F32(_) => RegisterValue::F32(parse_tokens(raw)),
            RegisterValue::F64(_) => RegisterValue::F64(parse_tokens(raw)),
            RegisterValue::String(_) => RegisterValue::String(raw.to_string()),
            RegisterValue::Unstructured(_) => RegisterValue::Unstructured(raw.as_bytes().to_vec()),
        }
    }
}

fn parse_tokens<T: std::str::FromStr>(raw: &str) -> Vec<T> {
    raw.split_whitespace().filter_map(|tok| tok.parse().ok()).collect()
}

/// Converts a register name to the environment variable the register store
/// reads to bootstrap it: `.` becomes `__`, uppercased.
pub fn env_var_name(register_name: &str) -> String {
    register_name.to_uppercase().replace('.', "__")
}

struct Entry {
    value: RegisterValue,
    mutable: bool,
}

/// In-memory register database. See the module documentation.
pub struct RegisterStore {
    registers: Mutex<HashMap<String, Entry>>,
}

impl RegisterStore {
    pub fn new() -> Self {
        Self { registers: Mutex::new(HashMap::new()) }
    }

    /// Seeds the store from `defaults`, overriding each with the process
    /// environment variable named by [`env_var_name`] when it is set.
    pub fn with_env_defaults(defaults: Vec<(&str, RegisterValue, bool)>) -> Self {
        let mut registers = HashMap::new();
        for (name, default_value, mutable) in defaults {
            let value = match std::env::var(env_var_name(name)) {
                Ok(raw) => RegisterValue::parse_env(&default_value, &raw),
                Err(_) => default_value,
            };
            registers.insert(name.to_string(), Entry { value, mutable });
        }
        Self { registers: Mutex::new(registers) }
    }

    pub async fn get(&self, name: &str) -> Option<RegisterValue> {
        self.registers.lock().await.get(name).map(|e| e.value.clone())
    }

    /// Writes `value` to `name`, creating a new mutable register if absent.
    /// Writing to an existing immutable register leaves it unchanged and
    /// returns its current value, mirroring the network "access" RPC.
    pub async fn set(&self, name: &str, value: RegisterValue) -> RegisterValue {
        let mut registers = self.registers.lock().await;
        match registers.get_mut(name) {
            Some(entry) if entry.mutable => {
                entry.value = value;
                entry.value.clone()
            }
            Some(entry) => entry.value.clone(),
            None => {
                let inserted = value.clone();
                registers.insert(name.to_string(), Entry { value, mutable: true });
                inserted
            }
        }
    }

    /// The in-process equivalent of the network "access" RPC: reads if
    /// `value` is `None`, otherwise attempts the write (subject to the
    /// mutability and type-conversion rules of `set`) and returns the
    /// resulting stored value either way.
    pub async fn access(&self, name: &str, value: Option<RegisterValue>) -> Option<RegisterValue> {
        match value {
            Some(v) => Some(self.set(name, v).await),
            None => self.get(name).await,
        }
    }

    /// The in-process equivalent of the network "list" RPC: registers are
    /// ordered lexicographically by name so the index is stable across
    /// calls as long as the register set does not change.
    pub async fn list_by_index(&self, index: usize) -> Option<String> {
        let registers = self.registers.lock().await;
        let mut names: Vec<&String> = registers.keys().collect();
        names.sort();
        names.get(index).map(|s| s.to_string())
    }

    pub async fn get_bit(&self, name: &str) -> Option<bool> {
        match self.get(name).await? {
            RegisterValue::Bit(v) => v.first().copied(),
            _ => None,
        }
    }

    pub async fn get_natural8(&self, name: &str) -> Option<u8> {
        match self.get(name).await? {
            RegisterValue::U8(v) => v.first().copied(),
            _ => None,
        }
    }

    pub async fn get_natural16(&self, name: &str) -> Option<u16> {
        match self.get(name).await? {
            RegisterValue::U16(v) => v.first().copied(),
            _ => None,
        }
    }

    pub async fn get_string(&self, name: &str) -> Option<String> {
        match self.get(name).await? {
            RegisterValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub async fn get_unstructured(&self, name: &str) -> Option<Vec<u8>> {
        match self.get(name).await? {
            RegisterValue::Unstructured(b) => Some(b),
            _ => None,
        }
    }

    /// Default registers recognized by the node/CLI bootstrap, seeded
    /// from the environment where present.
    pub fn bootstrap() -> Self {
        Self::with_env_defaults(vec![
            ("uavcan.node.id", RegisterValue::U16(vec![0xFFFF]), true),
            ("uavcan.node.unique_id", RegisterValue::Unstructured(random_unique_id()), true),
            ("uavcan.loopback", RegisterValue::Bit(vec![true]), true),
            ("uavcan.diagnostic.severity", RegisterValue::U8(vec![2]), true),
            ("uavcan.diagnostic.timestamp", RegisterValue::Bit(vec![false]), true),
        ])
    }

    /// Interprets `uavcan.node.id`: `0xFFFF` or out-of-range means
    /// anonymous.
    pub async fn local_node_id(&self) -> Option<NodeId> {
        match self.get_natural16("uavcan.node.id").await {
            Some(id) if id != 0xFFFF => Some(id),
            _ => None,
        }
    }

    /// Builds the transport named by the current registers. Only
    /// `uavcan.loopback` is recognized (concrete CAN/UDP/serial
    /// transports); any other configuration is a configuration error.
    pub async fn build_transport(&self) -> Result<Arc<dyn Transport>> {
        if self.get_bit("uavcan.loopback").await != Some(true) {
            return Err(Error::Configuration(
                "no transport configured: set uavcan.loopback to construct the loopback transport".into(),
            ));
        }
        let local_node_id = self.local_node_id().await;
        Ok(LoopbackTransport::new(local_node_id, DEFAULT_PROTOCOL_PARAMETERS))
    }
}

impl Default for RegisterStore {
    fn default() -> Self {
        Self::new()
    }
}

fn random_unique_id() -> Vec<u8> {
    let mut bytes = vec![0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn immutable_register_rejects_writes() {
        let store = RegisterStore::with_env_defaults(vec![("uavcan.node.id", RegisterValue::U16(vec![42]), false)]);
        let result = store.set("uavcan.node.id", RegisterValue::U16(vec![99])).await;
        assert_eq!(result, RegisterValue::U16(vec![42]));
        assert_eq!(store.get_natural16("uavcan.node.id").await, Some(42));
    }

    #[tokio::test]
    async fn mutable_register_accepts_writes() {
        let store = RegisterStore::with_env_defaults(vec![("uavcan.node.id", RegisterValue::U16(vec![42]), true)]);
        store.set("uavcan.node.id", RegisterValue::U16(vec![99])).await;
        assert_eq!(store.get_natural16("uavcan.node.id").await, Some(99));
    }

    #[tokio::test]
    async fn list_by_index_is_sorted() {
        let store = RegisterStore::with_env_defaults(vec![
            ("uavcan.pub.foo.id", RegisterValue::U16(vec![100]), true),
            ("uavcan.node.id", RegisterValue::U16(vec![42]), true),
        ]);
        assert_eq!(store.list_by_index(0).await.as_deref(), Some("uavcan.node.id"));
        assert_eq!(store.list_by_index(1).await.as_deref(), Some("uavcan.pub.foo.id"));
        assert_eq!(store.list_by_index(2).await, None);
    }

    #[test]
    fn env_var_name_mangles_dots() {
        assert_eq!(env_var_name("uavcan.node.id"), "UAVCAN__NODE__ID");
    }

    #[test]
    fn pnp_version_follows_mtu_threshold() {
        assert_eq!(pnp_protocol_version_for_mtu(8), 1);
        assert_eq!(pnp_protocol_version_for_mtu(64), 2);
    }

    #[tokio::test]
    async fn anonymous_node_id_from_default() {
        let store = RegisterStore::bootstrap();
        assert_eq!(store.local_node_id().await, None);
    }
}

// src/lib.rs

pub mod blockchain;
pub mod core;
pub mod service;
pub mod storage;

pub use crate::blockchain::bridge::{BridgeTxn, BridgeTxnStatus, BridgeTxnType, TxDraft};
pub use crate::core::{BridgeError, EngineConfig};
pub use crate::service::{BridgeEngine, EngineDeps};

//! Data types published by the samplers and read by the command channel.
//! Keep this module minimal and stable: it is what readers get copies of.

use serde::{Deserialize, Serialize};

/// Smoothed utilization of one logical core (or the aggregate `cpu` line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreUsage {
    pub slug: String,
    // 0..=100, averaged with the previously published value
    pub percentage: u8,
}

/// Activity of one VPN peer, resolved to its display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub name: String,
    /// Unix seconds of the latest handshake; 0 means never.
    pub latest_handshake: i64,
    pub transfer_rx: u64,
    pub transfer_tx: u64,
}

impl PeerRecord {
    pub fn has_handshaked(&self) -> bool {
        self.latest_handshake != 0
    }
}

//! Persisted peer snapshot: peer name -> last known handshake.
//! Stored as base64 of a JSON object so the blob stays plain text on disk.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::PeerRecord;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("can't decode base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("can't (un)marshal snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPeer {
    #[serde(rename = "latestHandshakeUnix", default)]
    pub latest_handshake: i64,
}

pub type PeerSnapshot = BTreeMap<String, SnapshotPeer>;

pub fn from_records(records: &[PeerRecord]) -> PeerSnapshot {
    records
        .iter()
        .map(|p| {
            (
                p.name.clone(),
                SnapshotPeer {
                    latest_handshake: p.latest_handshake,
                },
            )
        })
        .collect()
}

pub fn encode(snapshot: &PeerSnapshot) -> Result<Vec<u8>, SnapshotError> {
    let json = serde_json::to_vec(snapshot)?;
    Ok(STANDARD.encode(json).into_bytes())
}

pub fn decode(blob: &[u8]) -> Result<PeerSnapshot, SnapshotError> {
    let json = STANDARD.decode(blob)?;
    Ok(serde_json::from_slice(&json)?)
}

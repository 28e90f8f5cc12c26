//! Peer activity reconciler.
//!
//! Each tick resolves peer names from the config directory, runs the status
//! command, and merges the fresh observation with the persisted snapshot so a
//! peer's latest handshake never moves backwards, even across restarts.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use ini::Ini;
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn, Span};

use crate::sampler::Job;
use crate::snapshot::{self, PeerSnapshot, SnapshotError};
use crate::state::UsageView;
use crate::store::{BlobStore, StoreError};
use crate::types::PeerRecord;

/// Tag the reconciled snapshot is persisted under.
pub const TAG_USAGE_PEER: &str = "usage_peer";

/// Fields per peer line of `wg show <iface> dump`.
const DUMP_FIELDS: usize = 8;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer config {path}: {reason}")]
    Config { path: PathBuf, reason: String },
    #[error("status command {program}: {reason}")]
    Command { program: String, reason: String },
    #[error("status command {program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("invalid status line {line:?}: {reason}")]
    Parse { line: String, reason: String },
    #[error("unknown peer with preshared key {0:?}")]
    UnknownPeer(String),
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl PeerError {
    fn config(path: &Path, reason: impl ToString) -> Self {
        PeerError::Config {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Maps preshared keys to display names taken from config file names.
pub struct NameResolver {
    dir: PathBuf,
    pattern: Regex,
}

impl NameResolver {
    /// `pattern` must capture exactly one group: the display name.
    pub fn new(dir: impl Into<PathBuf>, pattern: Regex) -> Result<Self, PeerError> {
        let dir = dir.into();
        if pattern.captures_len() != 2 {
            return Err(PeerError::config(
                &dir,
                format!("pattern {:?} must have exactly one capture group", pattern.as_str()),
            ));
        }
        Ok(Self { dir, pattern })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the directory (not recursively). Files not matching the pattern are
    /// ignored; a matching file without `[Peer] PresharedKey` fails the scan.
    pub fn resolve(&self) -> Result<HashMap<String, String>, PeerError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| PeerError::config(&self.dir, e))?;

        let mut names = HashMap::new();
        for entry in entries {
            let path = entry.map_err(|e| PeerError::config(&self.dir, e))?.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = self
                .pattern
                .captures(file_name)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_owned())
            else {
                continue;
            };

            let key = read_preshared_key(&path)?;
            if let Some(previous) = names.insert(key, name.clone()) {
                warn!(%previous, %name, "preshared key shared by two peer configs");
            }
        }
        Ok(names)
    }
}

fn read_preshared_key(path: &Path) -> Result<String, PeerError> {
    let conf = Ini::load_from_file(path).map_err(|e| PeerError::config(path, e))?;
    conf.section(Some("Peer"))
        .and_then(|peer| peer.get("PresharedKey"))
        .map(|key| key.trim().to_owned())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| PeerError::config(path, "missing [Peer] PresharedKey"))
}

/// Parse the status dump: header line first, then one line per peer.
pub fn parse_dump(
    text: &str,
    names: &HashMap<String, String>,
) -> Result<Vec<PeerRecord>, PeerError> {
    let mut lines = text.lines();
    if lines.next().is_none() {
        return Err(PeerError::Parse {
            line: String::new(),
            reason: "missing interface header".into(),
        });
    }

    lines
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_peer_line(line, names))
        .collect()
}

fn parse_peer_line(line: &str, names: &HashMap<String, String>) -> Result<PeerRecord, PeerError> {
    let parse_err = |reason: String| PeerError::Parse {
        line: line.to_owned(),
        reason,
    };

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != DUMP_FIELDS {
        return Err(parse_err(format!("unexpected field count: {}", fields.len())));
    }

    let preshared_key = fields[1];
    let name = names
        .get(preshared_key)
        .ok_or_else(|| PeerError::UnknownPeer(preshared_key.to_owned()))?;

    let latest_handshake = fields[4]
        .parse::<i64>()
        .map_err(|e| parse_err(format!("unexpected time format: {e}")))?;
    let transfer_rx = fields[5]
        .parse::<u64>()
        .map_err(|e| parse_err(format!("unexpected rx format: {e}")))?;
    let transfer_tx = fields[6]
        .parse::<u64>()
        .map_err(|e| parse_err(format!("unexpected tx format: {e}")))?;

    Ok(PeerRecord {
        name: name.clone(),
        latest_handshake,
        transfer_rx,
        transfer_tx,
    })
}

/// Keep the remembered handshake when the fresh one is older, then order the
/// peers by handshake, newest first (stable for ties).
pub fn reconcile(observed: Vec<PeerRecord>, remembered: &PeerSnapshot) -> Vec<PeerRecord> {
    let mut merged: Vec<PeerRecord> = observed
        .into_iter()
        .map(|mut peer| {
            if let Some(known) = remembered.get(&peer.name) {
                if peer.latest_handshake < known.latest_handshake {
                    peer.latest_handshake = known.latest_handshake;
                }
            }
            peer
        })
        .collect();
    merged.sort_by(|a, b| b.latest_handshake.cmp(&a.latest_handshake));
    merged
}

/// Produces the raw status dump.
pub trait PeerStatusSource: Send + Sync {
    fn dump(&self) -> impl Future<Output = Result<String, PeerError>> + Send;
}

/// External status command bounded by a timeout; the child is killed on expiry.
pub struct StatusCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl StatusCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl PeerStatusSource for StatusCommand {
    async fn dump(&self) -> Result<String, PeerError> {
        let command_err = |reason: String| PeerError::Command {
            program: self.program.clone(),
            reason,
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| PeerError::Timeout {
                program: self.program.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| command_err(format!("can't exec: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(command_err(format!(
                "exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        String::from_utf8(output.stdout).map_err(|e| command_err(format!("non-utf8 output: {e}")))
    }
}

pub struct PeerReconciler<S> {
    resolver: NameResolver,
    status: S,
    store: Arc<dyn BlobStore>,
    view: UsageView<PeerRecord>,
    span: Span,
}

impl<S: PeerStatusSource> PeerReconciler<S> {
    pub fn new(
        resolver: NameResolver,
        status: S,
        store: Arc<dyn BlobStore>,
        view: UsageView<PeerRecord>,
        span: Span,
    ) -> Self {
        Self {
            resolver,
            status,
            store,
            view,
            span,
        }
    }

    pub fn view(&self) -> UsageView<PeerRecord> {
        self.view.clone()
    }

    /// Startup check: the config directory is readable and any existing
    /// snapshot decodes. Returns the number of remembered peers.
    pub fn prepare(&self) -> Result<usize, PeerError> {
        self.resolver.resolve()?;
        let remembered = self.load_snapshot()?;
        info!(
            parent: &self.span,
            remembered = remembered.len(),
            conf_dir = %self.resolver.dir().display(),
            "peer reconciler prepared"
        );
        Ok(remembered.len())
    }

    /// Persisted snapshot; a missing tag means no history.
    pub fn load_snapshot(&self) -> Result<PeerSnapshot, PeerError> {
        match self.store.load(TAG_USAGE_PEER) {
            Ok(blob) => Ok(snapshot::decode(&blob)?),
            Err(StoreError::NotFound(_)) => Ok(PeerSnapshot::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// One full reconcile: observe, merge, persist, then publish.
    /// Nothing is persisted or published unless every step succeeds.
    pub async fn refresh(&self) -> Result<(), PeerError> {
        let names = self.resolver.resolve()?;
        let raw = self.status.dump().await?;
        let observed = parse_dump(&raw, &names)?;

        let mut remembered = self.load_snapshot()?;
        let merged = reconcile(observed, &remembered);

        // peers missing from this dump keep their remembered handshake
        remembered.extend(snapshot::from_records(&merged));
        let blob = snapshot::encode(&remembered)?;
        self.store.save(TAG_USAGE_PEER, &blob)?;

        debug!(peers = merged.len(), "peer usage updated");
        self.view.publish(merged).await;
        Ok(())
    }
}

impl<S: PeerStatusSource + 'static> Job for PeerReconciler<S> {
    fn span(&self) -> Span {
        self.span.clone()
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        self.refresh().await?;
        Ok(())
    }
}

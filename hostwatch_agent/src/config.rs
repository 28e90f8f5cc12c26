//! Agent configuration from `HOSTWATCH_*` environment variables.
//! `HOSTWATCH_LOG` is read by the binary before this runs.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use regex::Regex;

use crate::chat::api::DEFAULT_API_URL;

pub const ENV_PREFIX: &str = "HOSTWATCH_";

const DEFAULT_STORE_ROOT: &str = "/var/lib/hostwatch";
const DEFAULT_CPU_SOURCE: &str = "/proc/stat";
const DEFAULT_PERIOD_MS: u64 = 1000;
const DEFAULT_WG_CMD: &str = "wg";
const DEFAULT_WG_CMD_ARGS: &str = "show,wg0,dump";
const DEFAULT_WG_CONF_DIR: &str = "/etc/wireguard/peers";
const DEFAULT_WG_CONF_PATTERN: &str = r"^(.+)\.conf$";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CpuConfig {
    pub source: PathBuf,
    pub period: Duration,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub conf_dir: PathBuf,
    pub conf_pattern: Regex,
    pub period: Duration,
    pub command_timeout: Duration,
}

#[derive(Clone)]
pub struct ChatConfig {
    pub token: String,
    pub admin_id: i64,
    pub api_url: String,
}

impl fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatConfig")
            .field("token", &"<redacted>")
            .field("admin_id", &self.admin_id)
            .field("api_url", &self.api_url)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub store: StoreConfig,
    pub cpu: CpuConfig,
    /// `None` when `HOSTWATCH_WG_ENABLED=0`.
    pub peers: Option<PeerConfig>,
    /// `None` when no bot token is set.
    pub chat: Option<ChatConfig>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from a key lookup; keys are full variable names.
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };

        let store = StoreConfig {
            root: get("STORE_ROOT")
                .unwrap_or_else(|| DEFAULT_STORE_ROOT.into())
                .into(),
        };

        let cpu = CpuConfig {
            source: get("CPU_SOURCE")
                .unwrap_or_else(|| DEFAULT_CPU_SOURCE.into())
                .into(),
            period: period_ms("CPU_PERIOD_MS", get("CPU_PERIOD_MS"))?,
        };

        let wg_enabled = get("WG_ENABLED").map(|v| v != "0").unwrap_or(true);
        let peers = if wg_enabled {
            let period = period_ms("WG_PERIOD_MS", get("WG_PERIOD_MS"))?;
            let command_timeout = match get("WG_CMD_TIMEOUT_MS") {
                Some(v) => period_ms("WG_CMD_TIMEOUT_MS", Some(v))?,
                None => period,
            };
            let pattern = get("WG_CONF_PATTERN").unwrap_or_else(|| DEFAULT_WG_CONF_PATTERN.into());
            let conf_pattern = Regex::new(&pattern).with_context(|| {
                format!("{ENV_PREFIX}WG_CONF_PATTERN: invalid regex {pattern:?}")
            })?;
            ensure!(
                conf_pattern.captures_len() == 2,
                "{ENV_PREFIX}WG_CONF_PATTERN: {pattern:?} must have exactly one capture group"
            );

            Some(PeerConfig {
                command: get("WG_CMD").unwrap_or_else(|| DEFAULT_WG_CMD.into()),
                args: split_args(&get("WG_CMD_ARGS").unwrap_or_else(|| DEFAULT_WG_CMD_ARGS.into())),
                conf_dir: get("WG_CONF_DIR")
                    .unwrap_or_else(|| DEFAULT_WG_CONF_DIR.into())
                    .into(),
                conf_pattern,
                period,
                command_timeout,
            })
        } else {
            None
        };

        let chat = match get("CHAT_TOKEN") {
            None => None,
            Some(token) => {
                let Some(raw_id) = get("CHAT_ADMIN_ID") else {
                    bail!(
                        "{ENV_PREFIX}CHAT_ADMIN_ID is required when {ENV_PREFIX}CHAT_TOKEN is set"
                    );
                };
                let admin_id = raw_id
                    .trim()
                    .parse::<i64>()
                    .with_context(|| format!("{ENV_PREFIX}CHAT_ADMIN_ID: invalid id {raw_id:?}"))?;
                Some(ChatConfig {
                    token,
                    admin_id,
                    api_url: get("CHAT_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into()),
                })
            }
        };

        Ok(Self {
            store,
            cpu,
            peers,
            chat,
        })
    }
}

fn period_ms(name: &str, value: Option<String>) -> Result<Duration> {
    let ms = match value {
        Some(v) => v
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{ENV_PREFIX}{name}: invalid number {v:?}"))?,
        None => DEFAULT_PERIOD_MS,
    };
    ensure!(ms > 0, "{ENV_PREFIX}{name}: must be positive");
    Ok(Duration::from_millis(ms))
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

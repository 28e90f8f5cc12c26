//! CPU sampler: smoothed per-core utilization from consecutive /proc/stat snapshots.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, Span};

use crate::sampler::Job;
use crate::state::UsageView;
use crate::types::CoreUsage;

/// Every per-core line starts with this prefix; parsing stops at the first other line.
pub const CPU_PREFIX: &str = "cpu";

#[derive(Debug, Error)]
pub enum CpuError {
    #[error("can't read counter source {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid core line {line:?}: {reason}")]
    Parse { line: String, reason: String },
    #[error("core lines not found")]
    NoCores,
    #[error("inconsistent core set: {0}")]
    Inconsistent(String),
    #[error("counters of {0:?} went backwards")]
    CounterReset(String),
}

/// Cumulative jiffies of one core since boot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCoreCounters {
    pub slug: String,
    pub user: u64,       // user mode
    pub nice: u64,       // user mode, low priority
    pub system: u64,     // system mode
    pub idle: u64,       // idle task
    pub iowait: u64,     // waiting for I/O
    pub irq: u64,        // servicing interrupts
    pub softirq: u64,    // servicing softirqs
    pub steal: u64,      // stolen by other guests
    pub guest: u64,      // running a virtual CPU
    pub guest_nice: u64, // running a niced guest
}

// Sums are checked: `None` means the counters do not fit in a u64.
impl RawCoreCounters {
    pub fn idle_total(&self) -> Option<u64> {
        self.idle.checked_add(self.iowait)
    }

    pub fn busy_total(&self) -> Option<u64> {
        [self.nice, self.system, self.irq, self.softirq, self.steal]
            .into_iter()
            .try_fold(self.user, u64::checked_add)
    }

    pub fn total(&self) -> Option<u64> {
        self.idle_total()?.checked_add(self.busy_total()?)
    }
}

/// Parse one `cpuN v1 .. v8|v10` line. Guest fields default to 0 when absent.
pub fn parse_core_line(line: &str) -> Result<RawCoreCounters, CpuError> {
    let parse_err = |reason: String| CpuError::Parse {
        line: line.to_owned(),
        reason,
    };

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != 9 && tokens.len() != 11 {
        return Err(parse_err(format!("invalid length: {}", tokens.len())));
    }

    let mut recs = [0u64; 10];
    for (idx, tok) in tokens[1..].iter().enumerate() {
        recs[idx] = tok
            .parse::<u64>()
            .map_err(|e| parse_err(format!("invalid format at {idx}: {e}")))?;
    }

    let counters = RawCoreCounters {
        slug: tokens[0].to_owned(),
        user: recs[0],
        nice: recs[1],
        system: recs[2],
        idle: recs[3],
        iowait: recs[4],
        irq: recs[5],
        softirq: recs[6],
        steal: recs[7],
        guest: recs[8],
        guest_nice: recs[9],
    };
    if counters.total().is_none() {
        return Err(parse_err("counters overflow u64".into()));
    }
    Ok(counters)
}

/// Parse the leading block of `cpu*` lines from a /proc/stat style text.
pub fn parse_proc_stat(text: &str) -> Result<Vec<RawCoreCounters>, CpuError> {
    let cores = text
        .lines()
        .take_while(|line| line.starts_with(CPU_PREFIX))
        .map(parse_core_line)
        .collect::<Result<Vec<_>, _>>()?;
    if cores.is_empty() {
        return Err(CpuError::NoCores);
    }
    Ok(cores)
}

/// Busy share of the interval between two samples of the same core, 0..=100.
pub fn instantaneous_percentage(
    prev: &RawCoreCounters,
    cur: &RawCoreCounters,
) -> Result<u8, CpuError> {
    let reset = || CpuError::CounterReset(cur.slug.clone());
    let delta = |now: Option<u64>, before: Option<u64>| {
        now.zip(before)
            .and_then(|(now, before)| now.checked_sub(before))
            .ok_or_else(reset)
    };

    let diff_total = delta(cur.total(), prev.total())?;
    let diff_idle = delta(cur.idle_total(), prev.idle_total())?;
    let diff_busy = diff_total.checked_sub(diff_idle).ok_or_else(reset)?;

    if diff_total == 0 {
        return Ok(0);
    }
    // diff_busy <= diff_total, so this stays within 0..=100
    let pct = u128::from(diff_busy) * 100 / u128::from(diff_total);
    Ok(pct.min(100) as u8)
}

/// Average of the previously published and the instantaneous value.
pub fn smooth(previous: u8, instantaneous: u8) -> u8 {
    ((u16::from(previous) + u16::from(instantaneous)) / 2).min(100) as u8
}

/// Compute the next published usage from two samples matched by core slug.
///
/// Output order follows `prev`; `published` supplies the smoothing input by
/// slug and may be empty before the first publish.
pub fn compute_usage(
    prev: &[RawCoreCounters],
    cur: &[RawCoreCounters],
    published: &[CoreUsage],
) -> Result<Vec<CoreUsage>, CpuError> {
    if prev.len() != cur.len() {
        return Err(CpuError::Inconsistent(format!(
            "{} cores before, {} now",
            prev.len(),
            cur.len()
        )));
    }

    let previous: HashMap<&str, u8> = published
        .iter()
        .map(|u| (u.slug.as_str(), u.percentage))
        .collect();

    prev.iter()
        .map(|last| {
            let now = cur
                .iter()
                .find(|c| c.slug == last.slug)
                .ok_or_else(|| CpuError::Inconsistent(format!("core {:?} not found", last.slug)))?;
            let instant = instantaneous_percentage(last, now)?;
            let before = previous.get(last.slug.as_str()).copied().unwrap_or(0);
            Ok(CoreUsage {
                slug: last.slug.clone(),
                percentage: smooth(before, instant),
            })
        })
        .collect()
}

/// Where raw counters come from; a file in production, a string in tests.
pub trait CounterSource: Send + Sync {
    fn read(&self) -> Result<String, CpuError>;
}

pub struct ProcStatFile {
    path: PathBuf,
}

impl ProcStatFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl CounterSource for ProcStatFile {
    fn read(&self) -> Result<String, CpuError> {
        std::fs::read_to_string(&self.path).map_err(|source| CpuError::Read {
            path: self.path.display().to_string(),
            source,
        })
    }
}

pub struct CpuSampler<S> {
    source: S,
    // previous raw sample; None until the first tick
    baseline: Option<Vec<RawCoreCounters>>,
    last_published: Vec<CoreUsage>,
    view: UsageView<CoreUsage>,
    span: Span,
}

impl<S: CounterSource> CpuSampler<S> {
    pub fn new(source: S, view: UsageView<CoreUsage>, span: Span) -> Self {
        Self {
            source,
            baseline: None,
            last_published: Vec::new(),
            view,
            span,
        }
    }

    pub fn view(&self) -> UsageView<CoreUsage> {
        self.view.clone()
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    /// Take one sample and publish the smoothed usage.
    ///
    /// The first call only records a baseline. On any error the published view
    /// is untouched; a counter reset additionally re-baselines on the new sample.
    pub async fn refresh(&mut self) -> Result<(), CpuError> {
        let current = parse_proc_stat(&self.source.read()?)?;

        let Some(prev) = self.baseline.as_deref() else {
            debug!(cores = current.len(), "cpu baseline recorded");
            self.baseline = Some(current);
            return Ok(());
        };

        let usage = match compute_usage(prev, &current, &self.last_published) {
            Ok(usage) => usage,
            Err(e @ CpuError::CounterReset(_)) => {
                self.baseline = Some(current);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.view.publish(usage.clone()).await;
        debug!(?usage, "cpu usage updated");
        self.last_published = usage;
        self.baseline = Some(current);
        Ok(())
    }
}

impl<S: CounterSource + 'static> Job for CpuSampler<S> {
    fn span(&self) -> Span {
        self.span.clone()
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        self.refresh().await?;
        Ok(())
    }
}

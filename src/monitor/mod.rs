//! Background resource monitor.
//!
//! A sampler thread records memory, disk and load on a fixed interval into a
//! shared state guarded by one mutex, held only long enough to copy values.
//! The orchestrator asks [`ResourceMonitor::should_pause`] before starting new
//! work; running commands are never throttled or stopped.

pub mod host;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::MonitorConfig;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_free: u64,
    pub load_average: f64,
}

impl ResourceSample {
    pub fn memory_ratio(&self) -> f64 {
        if self.memory_total == 0 {
            0.0
        } else {
            self.memory_used as f64 / self.memory_total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PauseReason {
    MemoryPressure { ratio: f64, threshold: f64 },
    LowDisk { free: u64, minimum: u64 },
    HighLoad { load: f64, ceiling: f64 },
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::MemoryPressure { ratio, threshold } => write!(
                f,
                "memory use {:.0}% above {:.0}%",
                ratio * 100.0,
                threshold * 100.0
            ),
            PauseReason::LowDisk { free, minimum } => write!(
                f,
                "disk free {} GiB below {} GiB",
                free / GIB,
                minimum / GIB
            ),
            PauseReason::HighLoad { load, ceiling } => {
                write!(f, "load average {load:.2} above {ceiling:.2}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub max_memory_ratio: f64,
    pub min_disk_free: u64,
    pub max_load_average: f64,
}

impl Thresholds {
    pub fn from_config(config: &MonitorConfig, cpus: usize) -> Self {
        Self {
            max_memory_ratio: config.max_memory_ratio,
            min_disk_free: config.min_disk_free_gb.saturating_mul(GIB),
            max_load_average: config
                .max_load_average
                .unwrap_or((cpus.max(1) * 4) as f64),
        }
    }

    /// First breached threshold, checked memory, then disk, then load.
    pub fn evaluate(&self, sample: &ResourceSample) -> Option<PauseReason> {
        let ratio = sample.memory_ratio();
        if ratio > self.max_memory_ratio {
            return Some(PauseReason::MemoryPressure {
                ratio,
                threshold: self.max_memory_ratio,
            });
        }
        if sample.disk_free < self.min_disk_free {
            return Some(PauseReason::LowDisk {
                free: sample.disk_free,
                minimum: self.min_disk_free,
            });
        }
        if sample.load_average > self.max_load_average {
            return Some(PauseReason::HighLoad {
                load: sample.load_average,
                ceiling: self.max_load_average,
            });
        }
        None
    }
}

/// Source of resource samples. Fakes implement this in tests.
pub trait ResourceProbe: Send + Sync {
    /// Disk free is measured on the filesystem holding `disk_path`.
    fn sample(&self, disk_path: &Path) -> io::Result<ResourceSample>;
}

/// Samples the real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

impl ResourceProbe for HostProbe {
    fn sample(&self, disk_path: &Path) -> io::Result<ResourceSample> {
        let memory = host::read_meminfo()?;
        Ok(ResourceSample {
            timestamp: OffsetDateTime::now_utc(),
            memory_used: memory.used(),
            memory_total: memory.total,
            disk_free: host::available_disk(disk_path)?,
            load_average: host::load_average().unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Default)]
struct SharedState {
    latest: Option<ResourceSample>,
    window: VecDeque<ResourceSample>,
}

pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    disk_path: PathBuf,
    state: Arc<Mutex<SharedState>>,
    window_len: usize,
    thresholds: Thresholds,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ResourceMonitor {
    /// Take a first sample synchronously, then keep sampling every `interval`
    /// on a background thread. Disk free is measured at `disk_path`, the
    /// staged root of the running session.
    pub fn start(
        probe: Arc<dyn ResourceProbe>,
        disk_path: &Path,
        thresholds: Thresholds,
        interval: Duration,
        window: usize,
    ) -> Self {
        let window = window.max(1);
        let state = Arc::new(Mutex::new(SharedState::default()));
        let disk_path = disk_path.to_path_buf();
        record_sample(probe.as_ref(), &disk_path, &state, window);

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_state = Arc::clone(&state);
        let thread_probe = Arc::clone(&probe);
        let thread_path = disk_path.clone();
        let handle = thread::Builder::new()
            .name("resource-monitor".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        record_sample(thread_probe.as_ref(), &thread_path, &thread_state, window)
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "resource monitor thread failed to start; using the first sample only");
                None
            }
        };

        Self {
            probe,
            disk_path,
            state,
            window_len: window,
            thresholds,
            stop: Some(stop_tx),
            handle,
        }
    }

    pub fn latest(&self) -> Option<ResourceSample> {
        lock(&self.state).latest
    }

    pub fn window(&self) -> Vec<ResourceSample> {
        lock(&self.state).window.iter().copied().collect()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Whether new work should wait, judged on the latest sample.
    pub fn should_pause(&self) -> Option<PauseReason> {
        self.latest().and_then(|s| self.thresholds.evaluate(&s))
    }

    /// Take a sample now instead of waiting for the next tick.
    pub fn resample(&self) -> Option<ResourceSample> {
        record_sample(self.probe.as_ref(), &self.disk_path, &self.state, self.window_len);
        self.latest()
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(state: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record_sample(
    probe: &dyn ResourceProbe,
    disk_path: &Path,
    state: &Mutex<SharedState>,
    window: usize,
) {
    // Sample before locking; readers never wait on procfs.
    let sample = match probe.sample(disk_path) {
        Ok(sample) => sample,
        Err(e) => {
            tracing::debug!(error = %e, "resource sample failed");
            return;
        }
    };
    let mut shared = lock(state);
    shared.latest = Some(sample);
    shared.window.push_back(sample);
    while shared.window.len() > window {
        shared.window.pop_front();
    }
}

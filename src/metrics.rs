//! Resource-metric sampling for running jobs.
//!
//! A single sampler thread walks the Running set every few seconds,
//! reads `cpu.stat`, `memory.current` and `io.stat` under each job's
//! cgroup, turns the counters into rates against the previous sample,
//! and hands the result to the store (which fans it out to subscribers
//! and the persistence sidecar).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use crate::config::JobletConfig;
use crate::job::JobStatus;
use crate::platform::Platform;
use crate::store::{JobStore, MetricSample};

#[derive(Debug, Clone, Copy)]
struct Counters {
    cpu_usec: u64,
    io_bytes: u64,
    at: Instant,
}

pub struct MetricsSampler {
    platform: Arc<dyn Platform>,
    store: Arc<JobStore>,
    interval: Duration,
}

impl MetricsSampler {
    pub fn new(
        platform: Arc<dyn Platform>,
        store: Arc<JobStore>,
        config: &JobletConfig,
    ) -> MetricsSampler {
        MetricsSampler {
            platform,
            store,
            interval: Duration::from_secs(config.metrics_interval_secs.max(1)),
        }
    }

    /// Run until the shutdown channel closes or fires.
    pub fn spawn(self, shutdown: Receiver<()>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("metrics-sampler".to_string())
            .spawn(move || {
                let mut previous: HashMap<String, Counters> = HashMap::new();
                loop {
                    match shutdown.recv_timeout(self.interval) {
                        Err(RecvTimeoutError::Timeout) => self.sample_all(&mut previous),
                        _ => return,
                    }
                }
            })
            .expect("spawn metrics sampler")
    }

    fn sample_all(&self, previous: &mut HashMap<String, Counters>) {
        let running: Vec<_> = self
            .store
            .list()
            .into_iter()
            .filter(|j| j.status == JobStatus::Running)
            .collect();
        // Forget jobs that stopped running so counters never carry over
        // to a reused sampling slot.
        previous.retain(|uuid, _| running.iter().any(|j| &j.uuid == uuid));

        for job in running {
            let Some(counters) = self.read_counters(&job.cgroup_path) else {
                continue;
            };
            let sample = match previous.get(&job.uuid) {
                Some(last) => rate_sample(last, &counters),
                None => MetricSample {
                    timestamp: Utc::now(),
                    cpu_percent: 0.0,
                    memory_bytes: self.read_memory(&job.cgroup_path),
                    io_bps: 0,
                },
            };
            let sample = MetricSample {
                memory_bytes: self.read_memory(&job.cgroup_path),
                ..sample
            };
            debug!(job_id = %job.uuid, cpu = sample.cpu_percent, mem = sample.memory_bytes, "metric sample");
            self.store.record_metric(&job.uuid, sample);
            previous.insert(job.uuid.clone(), counters);
        }
    }

    fn read_counters(&self, cgroup: &Path) -> Option<Counters> {
        let cpu_raw = self.platform.read_file(&cgroup.join("cpu.stat")).ok()?;
        let cpu_usec = parse_cpu_stat(&String::from_utf8_lossy(&cpu_raw))?;
        let io_bytes = self
            .platform
            .read_file(&cgroup.join("io.stat"))
            .ok()
            .map(|raw| parse_io_stat(&String::from_utf8_lossy(&raw)))
            .unwrap_or(0);
        Some(Counters {
            cpu_usec,
            io_bytes,
            at: Instant::now(),
        })
    }

    fn read_memory(&self, cgroup: &Path) -> u64 {
        self.platform
            .read_file(&cgroup.join("memory.current"))
            .ok()
            .and_then(|raw| String::from_utf8_lossy(&raw).trim().parse().ok())
            .unwrap_or(0)
    }
}

fn rate_sample(last: &Counters, now: &Counters) -> MetricSample {
    let elapsed = now.at.duration_since(last.at).as_secs_f64().max(0.001);
    let cpu_delta_usec = now.cpu_usec.saturating_sub(last.cpu_usec) as f64;
    let io_delta = now.io_bytes.saturating_sub(last.io_bytes) as f64;
    MetricSample {
        timestamp: Utc::now(),
        cpu_percent: cpu_delta_usec / (elapsed * 1_000_000.0) * 100.0,
        memory_bytes: 0,
        io_bps: (io_delta / elapsed) as u64,
    }
}

/// `usage_usec` out of a v2 `cpu.stat`.
fn parse_cpu_stat(raw: &str) -> Option<u64> {
    raw.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        (parts.next() == Some("usage_usec"))
            .then(|| parts.next().and_then(|v| v.parse().ok()))
            .flatten()
    })
}

/// Total rbytes+wbytes across devices out of a v2 `io.stat`.
fn parse_io_stat(raw: &str) -> u64 {
    raw.lines()
        .flat_map(|line| line.split_whitespace())
        .filter_map(|field| {
            field
                .strip_prefix("rbytes=")
                .or_else(|| field.strip_prefix("wbytes="))
                .and_then(|v| v.parse::<u64>().ok())
        })
        .sum()
}

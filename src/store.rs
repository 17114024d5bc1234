//! In-memory job store, live output buffers, and the persistence bridge.
//!
//! The store's job table is the single source of truth for job records;
//! every mutation goes through it. Each job also owns a bounded
//! append-only output buffer with monotonic byte offsets: subscribers get
//! the buffered tail as a snapshot and then follow live writes, so a
//! reader stitching the persisted prefix to the live tail deduplicates
//! any overlap by offset and sees every byte exactly once.
//!
//! Writes are simultaneously framed onto a queue drained by the persist
//! forwarder thread, which ships them to the sidecar over a Unix socket.
//! A dead sidecar costs nothing but a warning: frames are dropped and the
//! in-memory buffer still holds the recent tail.

use std::collections::HashMap;
use std::io::Write as _;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result as JobletResult};
use crate::job::{Job, JobStatus};

/// Which pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// One buffered write with its position in the merged output stream.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub offset: u64,
    pub stream: StreamKind,
    pub data: Arc<[u8]>,
}

/// A resource sample for a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: chrono::DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub io_bps: u64,
}

/// Frame shipped to the persistence sidecar, one JSON line each.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PersistFrame {
    Log {
        job: String,
        stream: StreamKind,
        offset: u64,
        #[serde(with = "frame_b64")]
        data: Vec<u8>,
    },
    Metric {
        job: String,
        sample: MetricSample,
    },
    /// Ask the sidecar to delete everything it holds for a job.
    Purge { job: String },
}

mod frame_b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Single-writer, multi-subscriber byte buffer. Bounded: old bytes fall
/// off the front, the offset of the first retained byte advancing with
/// them.
struct OutputBuffer {
    chunks: Vec<LogChunk>,
    next_offset: u64,
    retained_bytes: usize,
    subscribers: Vec<Sender<LogChunk>>,
    metrics: Vec<MetricSample>,
    metric_subscribers: Vec<Sender<MetricSample>>,
}

impl OutputBuffer {
    fn new() -> OutputBuffer {
        OutputBuffer {
            chunks: Vec::new(),
            next_offset: 0,
            retained_bytes: 0,
            subscribers: Vec::new(),
            metrics: Vec::new(),
            metric_subscribers: Vec::new(),
        }
    }

    fn push(&mut self, stream: StreamKind, data: &[u8], cap: usize) -> LogChunk {
        let chunk = LogChunk {
            offset: self.next_offset,
            stream,
            data: Arc::from(data),
        };
        self.next_offset += data.len() as u64;
        self.retained_bytes += data.len();
        self.chunks.push(chunk.clone());
        while self.retained_bytes > cap && self.chunks.len() > 1 {
            let dropped = self.chunks.remove(0);
            self.retained_bytes -= dropped.data.len();
        }
        // Non-blocking fan-out; a gone subscriber is pruned.
        self.subscribers
            .retain(|tx| tx.send(chunk.clone()).is_ok());
        chunk
    }
}

pub struct JobStore {
    jobs: RwLock<HashMap<String, Job>>,
    buffers: Mutex<HashMap<String, OutputBuffer>>,
    retain_bytes: usize,
    persist_tx: Sender<PersistFrame>,
}

impl JobStore {
    /// Returns the store and the frame queue the persist forwarder
    /// drains.
    pub fn new(retain_bytes: usize) -> (Arc<JobStore>, Receiver<PersistFrame>) {
        let (persist_tx, persist_rx) = unbounded();
        (
            Arc::new(JobStore {
                jobs: RwLock::new(HashMap::new()),
                buffers: Mutex::new(HashMap::new()),
                retain_bytes,
                persist_tx,
            }),
            persist_rx,
        )
    }

    // ---- job table ----

    pub fn put(&self, job: Job) {
        self.jobs
            .write()
            .expect("job table")
            .insert(job.uuid.clone(), job);
    }

    pub fn get(&self, uuid: &str) -> JobletResult<Job> {
        self.jobs
            .read()
            .expect("job table")
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::not_found("job", uuid))
    }

    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().expect("job table").values().cloned().collect();
        jobs.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        jobs
    }

    /// Apply a mutation under the table lock; status transitions stay
    /// causally ordered because this is the only write path.
    pub fn update<F>(&self, uuid: &str, mutate: F) -> JobletResult<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().expect("job table");
        let job = jobs
            .get_mut(uuid)
            .ok_or_else(|| Error::not_found("job", uuid))?;
        mutate(job);
        Ok(job.clone())
    }

    pub fn remove(&self, uuid: &str) -> JobletResult<Job> {
        let removed = self
            .jobs
            .write()
            .expect("job table")
            .remove(uuid)
            .ok_or_else(|| Error::not_found("job", uuid))?;
        self.buffers.lock().expect("buffers").remove(uuid);
        self.send_frame(PersistFrame::Purge {
            job: uuid.to_string(),
        });
        Ok(removed)
    }

    /// UUIDs of jobs holding live resources or future intent.
    pub fn active_uuids(&self) -> Vec<String> {
        self.jobs
            .read()
            .expect("job table")
            .values()
            .filter(|j| j.status.is_active() || j.status == JobStatus::Initializing)
            .map(|j| j.uuid.clone())
            .collect()
    }

    // ---- output buffer ----

    /// Append a chunk. The slice is copied; callers may reuse their
    /// buffer. Never fails: output capture must not break execution.
    pub fn write_to_buffer(&self, uuid: &str, stream: StreamKind, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let chunk = {
            let mut buffers = self.buffers.lock().expect("buffers");
            buffers
                .entry(uuid.to_string())
                .or_insert_with(OutputBuffer::new)
                .push(stream, data, self.retain_bytes)
        };
        self.send_frame(PersistFrame::Log {
            job: uuid.to_string(),
            stream,
            offset: chunk.offset,
            data: chunk.data.to_vec(),
        });
    }

    /// Buffered tail plus a live receiver. The snapshot's first offset
    /// tells the reader where the buffer now begins; earlier bytes come
    /// from the persisted prefix.
    pub fn subscribe(&self, uuid: &str) -> (Vec<LogChunk>, Receiver<LogChunk>) {
        let (tx, rx) = unbounded();
        let mut buffers = self.buffers.lock().expect("buffers");
        let buffer = buffers
            .entry(uuid.to_string())
            .or_insert_with(OutputBuffer::new);
        let snapshot = buffer.chunks.clone();
        buffer.subscribers.push(tx);
        (snapshot, rx)
    }

    // ---- metrics ----

    pub fn record_metric(&self, uuid: &str, sample: MetricSample) {
        {
            let mut buffers = self.buffers.lock().expect("buffers");
            let buffer = buffers
                .entry(uuid.to_string())
                .or_insert_with(OutputBuffer::new);
            buffer.metrics.push(sample.clone());
            // Metrics are small; keep a fixed window.
            if buffer.metrics.len() > 1024 {
                buffer.metrics.remove(0);
            }
            buffer
                .metric_subscribers
                .retain(|tx| tx.send(sample.clone()).is_ok());
        }
        self.send_frame(PersistFrame::Metric {
            job: uuid.to_string(),
            sample,
        });
    }

    pub fn subscribe_metrics(&self, uuid: &str) -> (Vec<MetricSample>, Receiver<MetricSample>) {
        let (tx, rx) = unbounded();
        let mut buffers = self.buffers.lock().expect("buffers");
        let buffer = buffers
            .entry(uuid.to_string())
            .or_insert_with(OutputBuffer::new);
        let snapshot = buffer.metrics.clone();
        buffer.metric_subscribers.push(tx);
        (snapshot, rx)
    }

    fn send_frame(&self, frame: PersistFrame) {
        // The queue is unbounded; this only fails once the forwarder is
        // gone during shutdown, which is not worth surfacing.
        let _ = self.persist_tx.send(frame);
    }
}

/// `io::Write` adaptor handed to child-output pumps: forwards every write
/// to the buffer and always reports full success.
pub struct OutputWriter {
    store: Arc<JobStore>,
    uuid: String,
    stream: StreamKind,
}

impl OutputWriter {
    pub fn new(store: Arc<JobStore>, uuid: impl Into<String>, stream: StreamKind) -> OutputWriter {
        OutputWriter {
            store,
            uuid: uuid.into(),
            stream,
        }
    }
}

impl std::io::Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.store.write_to_buffer(&self.uuid, self.stream, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Pump a child pipe into the buffer in 8 KiB chunks until EOF. Read
/// errors end the pump; they never propagate into job execution.
pub fn pump_output(
    store: Arc<JobStore>,
    uuid: String,
    stream: StreamKind,
    mut reader: Box<dyn std::io::Read + Send>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut writer = OutputWriter::new(store, uuid, stream);
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = writer.write(&buf[..n]);
                }
                Err(_) => break,
            }
        }
    })
}

/// Drain the frame queue into the sidecar socket. Connection loss drops
/// frames with a warning and retries with a small backoff; the buffer
/// keeps the tail for late persistence.
pub fn spawn_persist_forwarder(
    rx: Receiver<PersistFrame>,
    socket_path: PathBuf,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("persist-forwarder".to_string())
        .spawn(move || {
            let mut conn: Option<UnixStream> = None;
            let mut warned = false;
            for frame in rx.iter() {
                if conn.is_none() {
                    match UnixStream::connect(&socket_path) {
                        Ok(stream) => {
                            let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));
                            debug!(socket = %socket_path.display(), "persist sidecar connected");
                            conn = Some(stream);
                            warned = false;
                        }
                        Err(e) => {
                            if !warned {
                                warn!(
                                    socket = %socket_path.display(),
                                    error = %e,
                                    "persist sidecar unreachable, dropping frames"
                                );
                                warned = true;
                            }
                            continue;
                        }
                    }
                }
                let line = match serde_json::to_vec(&frame) {
                    Ok(mut v) => {
                        v.push(b'\n');
                        v
                    }
                    Err(e) => {
                        warn!(error = %e, "unserializable persist frame dropped");
                        continue;
                    }
                };
                if let Some(stream) = conn.as_mut()
                    && let Err(e) = stream.write_all(&line)
                {
                    warn!(error = %e, "persist write failed, frame dropped");
                    conn = None;
                }
            }
        })
        .expect("spawn persist forwarder")
}

/// Concatenate a snapshot-plus-live subscription into ordered bytes,
/// skipping everything before `from_offset`. This is the reader-side
/// dedup rule for the persist→live transition.
pub fn merge_from_offset(chunks: &[LogChunk], from_offset: u64) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in chunks {
        let end = chunk.offset + chunk.data.len() as u64;
        if end <= from_offset {
            continue;
        }
        let skip = from_offset.saturating_sub(chunk.offset) as usize;
        out.extend_from_slice(&chunk.data[skip..]);
    }
    out
}

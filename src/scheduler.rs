//! Future-dated jobs.
//!
//! One background thread sleeps until the earliest due entry (or until a
//! mutation pokes the condvar), then hands the job over a channel to the
//! façade's executor. The scheduler starts empty on every daemon boot;
//! scheduled jobs do not survive restarts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, info};

use crate::job::Job;

struct Entry {
    when: DateTime<Utc>,
    job: Job,
}

pub struct Scheduler {
    entries: Mutex<Vec<Entry>>,
    wakeup: Condvar,
    due_tx: Sender<Job>,
    shutdown: AtomicBool,
}

impl Scheduler {
    /// Returns the scheduler and the channel due jobs arrive on.
    pub fn new() -> (Arc<Scheduler>, Receiver<Job>) {
        let (due_tx, due_rx) = unbounded();
        (
            Arc::new(Scheduler {
                entries: Mutex::new(Vec::new()),
                wakeup: Condvar::new(),
                due_tx,
                shutdown: AtomicBool::new(false),
            }),
            due_rx,
        )
    }

    pub fn add(&self, job: Job, when: DateTime<Utc>) {
        debug!(job_id = %job.uuid, at = %when.to_rfc3339(), "job scheduled");
        self.entries
            .lock()
            .expect("scheduler entries")
            .push(Entry { when, job });
        self.wakeup.notify_one();
    }

    /// Cancel a pending entry. Returns whether it was still held.
    pub fn remove(&self, uuid: &str) -> bool {
        let mut entries = self.entries.lock().expect("scheduler entries");
        let before = entries.len();
        entries.retain(|e| e.job.uuid != uuid);
        let removed = entries.len() != before;
        if removed {
            self.wakeup.notify_one();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("scheduler entries").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wakeup.notify_all();
    }

    /// The timer loop. Runs until [`shutdown`](Self::shutdown).
    pub fn spawn(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let scheduler = self.clone();
        std::thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || scheduler.run())
            .expect("spawn scheduler thread")
    }

    fn run(&self) {
        let mut entries = self.entries.lock().expect("scheduler entries");
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let now = Utc::now();
            let mut due = Vec::new();
            entries.retain(|e| {
                if e.when <= now {
                    due.push(e.job.clone());
                    false
                } else {
                    true
                }
            });
            for job in due {
                info!(job_id = %job.uuid, "scheduled job due");
                let _ = self.due_tx.send(job);
            }

            // Sleep to the earliest trigger; an add/remove pokes us
            // early. Capped so a clock jump cannot strand the loop.
            let sleep = entries
                .iter()
                .map(|e| e.when)
                .min()
                .map(|earliest| {
                    (earliest - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                })
                .unwrap_or(Duration::from_secs(60))
                .min(Duration::from_secs(60));
            let (guard, _timeout) = self
                .wakeup
                .wait_timeout(entries, sleep)
                .expect("scheduler wait");
            entries = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobletConfig;
    use crate::job::JobRequest;
    use chrono::Duration as ChronoDuration;

    fn job() -> Job {
        Job::build(
            JobRequest {
                command: "echo".to_string(),
                ..JobRequest::default()
            },
            &JobletConfig::default(),
            Utc::now(),
        )
        .expect("build job")
    }

    #[test]
    fn due_jobs_arrive_on_the_channel() {
        let (scheduler, due_rx) = Scheduler::new();
        let handle = scheduler.spawn();
        let j = job();
        let uuid = j.uuid.clone();
        scheduler.add(j, Utc::now() - ChronoDuration::seconds(1));
        let received = due_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("due job");
        assert_eq!(received.uuid, uuid);
        assert!(scheduler.is_empty());
        scheduler.shutdown();
        handle.join().expect("join");
    }

    #[test]
    fn removed_jobs_never_fire() {
        let (scheduler, due_rx) = Scheduler::new();
        let handle = scheduler.spawn();
        let j = job();
        let uuid = j.uuid.clone();
        scheduler.add(j, Utc::now() + ChronoDuration::milliseconds(300));
        assert!(scheduler.remove(&uuid));
        assert!(!scheduler.remove(&uuid));
        assert!(
            due_rx.recv_timeout(Duration::from_millis(700)).is_err(),
            "cancelled job fired"
        );
        scheduler.shutdown();
        handle.join().expect("join");
    }

    #[test]
    fn earlier_jobs_fire_first() {
        let (scheduler, due_rx) = Scheduler::new();
        let handle = scheduler.spawn();
        let first = job();
        let second = job();
        let (first_id, second_id) = (first.uuid.clone(), second.uuid.clone());
        scheduler.add(second, Utc::now() + ChronoDuration::milliseconds(250));
        scheduler.add(first, Utc::now() + ChronoDuration::milliseconds(50));
        let a = due_rx.recv_timeout(Duration::from_secs(2)).expect("first");
        let b = due_rx.recv_timeout(Duration::from_secs(2)).expect("second");
        assert_eq!(a.uuid, first_id);
        assert_eq!(b.uuid, second_id);
        scheduler.shutdown();
        handle.join().expect("join");
    }
}

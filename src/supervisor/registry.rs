//! Parent-side view of every worker.
//!
//! Time is passed in as Unix seconds so transitions can be tested without
//! waiting on a clock.

use super::heartbeat::Heartbeat;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Lifecycle of one worker as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Forked, no heartbeat yet
    Starting,
    /// Reporting on time
    Alive,
    /// Sent its shutdown sentinel
    Stopped,
    /// Silent for longer than the timeout
    Dead,
    /// Reaped by the parent
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub pid: Option<i32>,
    /// Timestamp carried by the last heartbeat
    pub last_heartbeat: Option<u64>,
    /// When the supervisor last heard from the worker (or registered it)
    pub last_seen: u64,
    pub open: u32,
    pub state: WorkerState,
}

/// Worker id to status.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: BTreeMap<u32, WorkerStatus>,
    timeout: u64,
}

impl WorkerRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            workers: BTreeMap::new(),
            timeout: timeout.as_secs().max(1),
        }
    }

    pub fn register(&mut self, worker: u32, pid: Option<i32>, now: u64) {
        self.workers.insert(
            worker,
            WorkerStatus {
                pid,
                last_heartbeat: None,
                last_seen: now,
                open: 0,
                state: WorkerState::Starting,
            },
        );
    }

    pub fn get(&self, worker: u32) -> Option<&WorkerStatus> {
        self.workers.get(&worker)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &WorkerStatus)> {
        self.workers.iter().map(|(id, status)| (*id, status))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Applies one heartbeat. Reports from unknown workers are ignored.
    pub fn record(&mut self, heartbeat: &Heartbeat, now: u64) {
        let Some(status) = self.workers.get_mut(&heartbeat.worker) else {
            warn!(worker = heartbeat.worker, "Heartbeat from unknown worker");
            return;
        };
        if status.state == WorkerState::Exited {
            return;
        }
        status.last_seen = now;
        status.open = heartbeat.open;
        match heartbeat.timestamp {
            Some(ts) => {
                status.last_heartbeat = Some(ts);
                if status.state == WorkerState::Dead {
                    info!(worker = heartbeat.worker, "Worker is reporting again");
                }
                status.state = WorkerState::Alive;
            }
            None => {
                info!(worker = heartbeat.worker, open = heartbeat.open, "Worker stopped");
                status.state = WorkerState::Stopped;
            }
        }
    }

    /// Marks workers silent for longer than the timeout as dead.
    ///
    /// Returns the workers that just died.
    pub fn sweep(&mut self, now: u64) -> Vec<u32> {
        let mut died = Vec::new();
        for (id, status) in self.workers.iter_mut() {
            let watched = matches!(status.state, WorkerState::Starting | WorkerState::Alive);
            if watched && now.saturating_sub(status.last_seen) > self.timeout {
                warn!(worker = *id, silent_secs = now - status.last_seen, "Worker missed its heartbeats");
                status.state = WorkerState::Dead;
                died.push(*id);
            }
        }
        died
    }

    /// Records that the process `pid` was reaped. Returns its worker id.
    pub fn mark_exited(&mut self, pid: i32) -> Option<u32> {
        let (id, status) = self
            .workers
            .iter_mut()
            .find(|(_, status)| status.pid == Some(pid))?;
        status.state = WorkerState::Exited;
        Some(*id)
    }

    /// Pids of workers not reaped yet.
    pub fn running_pids(&self) -> Vec<i32> {
        self.workers
            .values()
            .filter(|s| s.state != WorkerState::Exited)
            .filter_map(|s| s.pid)
            .collect()
    }

    /// True once every worker process has been reaped.
    pub fn all_exited(&self) -> bool {
        self.workers
            .values()
            .all(|s| s.state == WorkerState::Exited)
    }

    /// Open connections summed over workers still running.
    pub fn open_connections(&self) -> u64 {
        self.workers
            .values()
            .filter(|s| matches!(s.state, WorkerState::Starting | WorkerState::Alive))
            .map(|s| u64::from(s.open))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WorkerRegistry {
        let mut registry = WorkerRegistry::new(Duration::from_secs(10));
        registry.register(0, Some(100), 1000);
        registry.register(1, Some(101), 1000);
        registry
    }

    #[test]
    fn test_heartbeat_marks_alive() {
        let mut registry = registry();
        registry.record(&Heartbeat { worker: 0, timestamp: Some(1003), open: 4 }, 1003);
        let status = registry.get(0).unwrap();
        assert_eq!(status.state, WorkerState::Alive);
        assert_eq!(status.last_heartbeat, Some(1003));
        assert_eq!(status.open, 4);
        assert_eq!(registry.get(1).unwrap().state, WorkerState::Starting);
        assert_eq!(registry.open_connections(), 4);
    }

    #[test]
    fn test_silent_worker_dies_after_timeout() {
        let mut registry = registry();
        registry.record(&Heartbeat { worker: 0, timestamp: Some(1005), open: 0 }, 1005);
        assert!(registry.sweep(1010).is_empty());
        // Worker 1 never reported; worker 0 last spoke at 1005.
        assert_eq!(registry.sweep(1011), vec![1]);
        assert_eq!(registry.sweep(1016), vec![0]);
        assert_eq!(registry.get(0).unwrap().state, WorkerState::Dead);
        assert!(registry.sweep(2000).is_empty());
    }

    #[test]
    fn test_sentinel_marks_stopped() {
        let mut registry = registry();
        registry.record(&Heartbeat::sentinel(1, 2), 1001);
        assert_eq!(registry.get(1).unwrap().state, WorkerState::Stopped);
        // Stopped workers are not swept.
        assert_eq!(registry.sweep(5000), vec![0]);
        assert_eq!(registry.get(1).unwrap().state, WorkerState::Stopped);
    }

    #[test]
    fn test_dead_worker_can_recover() {
        let mut registry = registry();
        registry.sweep(2000);
        registry.record(&Heartbeat { worker: 0, timestamp: Some(2001), open: 1 }, 2001);
        assert_eq!(registry.get(0).unwrap().state, WorkerState::Alive);
    }

    #[test]
    fn test_reaping() {
        let mut registry = registry();
        assert_eq!(registry.running_pids(), vec![100, 101]);
        assert_eq!(registry.mark_exited(101), Some(1));
        assert_eq!(registry.mark_exited(555), None);
        assert_eq!(registry.running_pids(), vec![100]);
        assert!(!registry.all_exited());
        registry.mark_exited(100);
        assert!(registry.all_exited());
        // Late heartbeats do not resurrect a reaped worker.
        registry.record(&Heartbeat { worker: 0, timestamp: Some(1), open: 1 }, 3000);
        assert_eq!(registry.get(0).unwrap().state, WorkerState::Exited);
    }

    #[test]
    fn test_unknown_worker_ignored() {
        let mut registry = registry();
        registry.record(&Heartbeat::alive(42, 1), 1001);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(42).is_none());
    }
}

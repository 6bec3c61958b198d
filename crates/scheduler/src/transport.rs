//! Worker session and readiness primitives.
//!
//! The scheduler core never opens sockets itself: each worker is reachable
//! through a bidirectional message channel ([`WorkerLink`]), and the
//! [`Monitor`] multiplexes replies from whichever subset of channels is
//! currently armed. The session handle is passed explicitly into validation
//! instead of living in process-global state.

use std::collections::HashMap;

use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use pfw_common::{PfwError, Result};
use serde::{Deserialize, Serialize};

/// Count-entries request sent to one worker during startup validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// Whether the named object is an entry tree (as opposed to key counts).
    pub is_tree: bool,
    /// File to inspect.
    pub file_url: String,
    /// Directory inside the file.
    pub directory: String,
    /// Object to count entries of; may be a wildcard.
    pub object_name: String,
}

/// Replies a worker can send on its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerReply {
    /// Entry count for a validation request.
    Entries {
        /// Number of entries found; `<= 0` when the object is unreadable.
        entries: i64,
        /// Object name the worker resolved a wildcard to, if any.
        resolved_object_name: Option<String>,
    },
    /// A chunk of forwarded worker log output; drained and ignored here.
    LogFile {
        /// Raw log bytes.
        bytes: Vec<u8>,
    },
    /// End of forwarded log output.
    LogDone,
    /// The worker hit an unrecoverable error.
    Fatal {
        /// Worker-provided reason.
        reason: String,
    },
}

/// Static description of one worker in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Stable worker id used in scheduling and telemetry.
    pub id: String,
    /// Host the worker resides on; matched against file hosts for locality.
    pub host: String,
    /// Static performance index; seeds the first packet size only.
    pub perf_idx: i32,
}

/// Coordinator-side endpoint of one worker's message channel.
#[derive(Debug)]
pub struct WorkerLink {
    requests: Sender<ValidationRequest>,
    replies: Receiver<WorkerReply>,
}

/// Worker-side endpoint of the channel, handed to the worker loop.
#[derive(Debug)]
pub struct WorkerEndpoint {
    /// Requests arriving from the coordinator.
    pub requests: Receiver<ValidationRequest>,
    /// Replies back to the coordinator.
    pub replies: Sender<WorkerReply>,
}

impl WorkerLink {
    /// Create a connected link/endpoint pair.
    pub fn pair() -> (WorkerLink, WorkerEndpoint) {
        let (req_tx, req_rx) = unbounded();
        let (rep_tx, rep_rx) = unbounded();
        (
            WorkerLink {
                requests: req_tx,
                replies: rep_rx,
            },
            WorkerEndpoint {
                requests: req_rx,
                replies: rep_tx,
            },
        )
    }
}

/// All worker channels of one query, keyed by worker id.
///
/// Replaces the original design's process-global session: the handle is
/// passed explicitly wherever the scheduler needs to talk to workers.
#[derive(Debug, Default)]
pub struct WorkerSession {
    workers: Vec<WorkerInfo>,
    links: HashMap<String, WorkerLink>,
}

impl WorkerSession {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker and its channel.
    pub fn register(&mut self, info: WorkerInfo, link: WorkerLink) {
        self.links.insert(info.id.clone(), link);
        self.workers.push(info);
    }

    /// Workers in registration order.
    pub fn workers(&self) -> &[WorkerInfo] {
        &self.workers
    }

    /// Send a validation request to `worker_id`.
    pub fn send(&self, worker_id: &str, request: ValidationRequest) -> Result<()> {
        let link = self
            .links
            .get(worker_id)
            .ok_or_else(|| PfwError::Protocol(format!("unknown worker: {worker_id}")))?;
        link.requests
            .send(request)
            .map_err(|_| PfwError::WorkerLost(format!("send failed for worker {worker_id}")))
    }

    fn replies(&self, worker_id: &str) -> Option<&Receiver<WorkerReply>> {
        self.links.get(worker_id).map(|l| &l.replies)
    }
}

/// One readiness event produced by [`Monitor::wait`].
#[derive(Debug)]
pub enum MonitorEvent {
    /// A reply arrived from an armed worker channel.
    Reply {
        /// Worker the reply came from.
        worker: String,
        /// The reply payload.
        reply: WorkerReply,
    },
    /// An armed worker channel disconnected.
    Disconnected {
        /// Worker whose channel broke.
        worker: String,
    },
}

/// Readiness multiplexer over a subset of worker channels.
///
/// Channels are armed while a request is outstanding on them and disarmed
/// once the reply is consumed; [`Monitor::wait`] blocks until any armed
/// channel is ready.
#[derive(Debug, Default)]
pub struct Monitor {
    armed: Vec<String>,
}

impl Monitor {
    /// Create a monitor with no armed channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `worker_id` for the next wait.
    pub fn activate(&mut self, worker_id: &str) {
        if !self.armed.iter().any(|w| w == worker_id) {
            self.armed.push(worker_id.to_string());
        }
    }

    /// Disarm `worker_id`.
    pub fn deactivate(&mut self, worker_id: &str) {
        self.armed.retain(|w| w != worker_id);
    }

    /// Number of armed channels.
    pub fn active_count(&self) -> usize {
        self.armed.len()
    }

    /// Block until any armed channel is ready.
    pub fn wait(&self, session: &WorkerSession) -> Result<MonitorEvent> {
        if self.armed.is_empty() {
            return Err(PfwError::Protocol(
                "wait on a monitor with no armed channels".to_string(),
            ));
        }
        let mut receivers = Vec::with_capacity(self.armed.len());
        for worker in &self.armed {
            let rx = session.replies(worker).ok_or_else(|| {
                PfwError::Protocol(format!("armed channel for unknown worker: {worker}"))
            })?;
            receivers.push((worker, rx));
        }

        let mut sel = Select::new();
        for (_, rx) in &receivers {
            sel.recv(rx);
        }
        let oper = sel.select();
        let idx = oper.index();
        let (worker, rx) = receivers[idx];
        match oper.recv(rx) {
            Ok(reply) => Ok(MonitorEvent::Reply {
                worker: worker.clone(),
                reply,
            }),
            Err(_) => Ok(MonitorEvent::Disconnected {
                worker: worker.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_reports_only_armed_channels() {
        let mut session = WorkerSession::new();
        let (link_a, end_a) = WorkerLink::pair();
        let (link_b, end_b) = WorkerLink::pair();
        session.register(
            WorkerInfo {
                id: "a".into(),
                host: "h1".into(),
                perf_idx: 1,
            },
            link_a,
        );
        session.register(
            WorkerInfo {
                id: "b".into(),
                host: "h2".into(),
                perf_idx: 1,
            },
            link_b,
        );

        end_a.replies.send(WorkerReply::LogDone).expect("send a");
        end_b
            .replies
            .send(WorkerReply::Fatal {
                reason: "boom".into(),
            })
            .expect("send b");

        let mut mon = Monitor::new();
        mon.activate("b");
        match mon.wait(&session).expect("wait") {
            MonitorEvent::Reply { worker, reply } => {
                assert_eq!(worker, "b");
                assert!(matches!(reply, WorkerReply::Fatal { .. }));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn disconnect_surfaces_as_event_not_error() {
        let mut session = WorkerSession::new();
        let (link, endpoint) = WorkerLink::pair();
        session.register(
            WorkerInfo {
                id: "w".into(),
                host: "h1".into(),
                perf_idx: 1,
            },
            link,
        );
        drop(endpoint);

        let mut mon = Monitor::new();
        mon.activate("w");
        match mon.wait(&session).expect("wait") {
            MonitorEvent::Disconnected { worker } => assert_eq!(worker, "w"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

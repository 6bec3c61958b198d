//! One-shot startup validation: ask the worker pool to count entries in
//! every file that still lacks an authoritative total.
//!
//! Every worker is kept busy with one outstanding count request at a time,
//! preferring files on the worker's own host. The coordinator blocks on the
//! readiness multiplexer; log traffic is drained and the channel re-armed,
//! a broken channel or fatal reply marks the whole query invalid, and a
//! file the worker cannot count drops only its element.

use std::collections::VecDeque;

use pfw_common::metrics::global_metrics;
use pfw_common::{PfwError, Result};
use tracing::{debug, error, warn};

use crate::packetizer::Packetizer;
use crate::transport::{Monitor, MonitorEvent, ValidationRequest, WorkerReply, WorkerSession};

impl Packetizer {
    /// Run the validation round over `session` and fill in entry totals.
    pub(crate) fn validate_files(&mut self, session: &WorkerSession) -> Result<()> {
        let mut monitor = Monitor::new();
        let mut idle: VecDeque<String> =
            session.workers().iter().map(|w| w.id.clone()).collect();
        let total_files: i64 = self.nodes.iter().map(|n| n.files.len() as i64).sum();
        let mut validated: i64 = 0;

        loop {
            // Hand a file to every idle worker.
            while let Some(worker) = idle.pop_front() {
                let mut file = None;
                if let Some(home) = self.worker_stats[&worker].file_node {
                    file = self.next_unalloc_on(home);
                    if file.is_none() {
                        self.worker_stats
                            .get_mut(&worker)
                            .expect("registered worker")
                            .file_node = None;
                    }
                }
                if file.is_none() {
                    file = self.next_unalloc_any();
                }
                let Some(f) = file else {
                    // Nothing left to hand out; the worker drops out of the
                    // round.
                    continue;
                };

                // Validated files are done right away; only the counters
                // track the outstanding request.
                self.remove_active(f);
                let host = self.worker_stats[&worker].host.clone();
                self.nodes[f.node].inc_external(&host);
                self.worker_stats
                    .get_mut(&worker)
                    .expect("registered worker")
                    .cur_file = Some(f);
                let request = {
                    let e = &self.elements[self.cursor(f).elem];
                    ValidationRequest {
                        is_tree: self.is_tree,
                        file_url: e.file_url.clone(),
                        directory: e.directory.clone(),
                        object_name: e.object_name.clone(),
                    }
                };
                debug!(
                    worker_id = %worker,
                    file = %request.file_url,
                    operator = "PacketizerValidate",
                    "sent count-entries request"
                );
                if let Err(err) = session.send(&worker, request) {
                    error!(
                        worker_id = %worker,
                        %err,
                        operator = "PacketizerValidate",
                        "send failed"
                    );
                    self.valid = false;
                    continue;
                }
                monitor.activate(&worker);
            }

            if monitor.active_count() == 0 {
                break;
            }

            match monitor.wait(session)? {
                MonitorEvent::Disconnected { worker } => {
                    monitor.deactivate(&worker);
                    error!(
                        worker_id = %worker,
                        operator = "PacketizerValidate",
                        "channel read failed, marking worker bad"
                    );
                    self.valid = false;
                }
                MonitorEvent::Reply { worker, reply } => match reply {
                    WorkerReply::LogFile { bytes } => {
                        debug!(
                            worker_id = %worker,
                            size = bytes.len(),
                            operator = "PacketizerValidate",
                            "drained log chunk"
                        );
                    }
                    WorkerReply::LogDone => {
                        debug!(
                            worker_id = %worker,
                            operator = "PacketizerValidate",
                            "drained log end"
                        );
                    }
                    WorkerReply::Fatal { reason } => {
                        monitor.deactivate(&worker);
                        error!(
                            worker_id = %worker,
                            reason = %reason,
                            operator = "PacketizerValidate",
                            "fatal reply, marking worker bad"
                        );
                        self.valid = false;
                    }
                    WorkerReply::Entries {
                        entries,
                        resolved_object_name,
                    } => {
                        monitor.deactivate(&worker);
                        let Some(f) = self
                            .worker_stats
                            .get_mut(&worker)
                            .expect("registered worker")
                            .cur_file
                            .take()
                        else {
                            error!(
                                worker_id = %worker,
                                operator = "PacketizerValidate",
                                "entry count without an outstanding request"
                            );
                            self.valid = false;
                            continue;
                        };
                        let host = self.worker_stats[&worker].host.clone();
                        self.nodes[f.node].dec_external(&host);
                        let node_host = self.nodes[f.node].host.clone();
                        let elem_idx = self.cursor(f).elem;

                        let dropped = {
                            let e = &mut self.elements[elem_idx];
                            if let Some(name) = resolved_object_name {
                                e.object_name = name;
                            }
                            e.dataset_offset = entries;
                            e.entries = entries;
                            if entries <= 0 {
                                error!(
                                    file = %e.file_url,
                                    entries,
                                    operator = "PacketizerValidate",
                                    "cannot count entries, skipping file"
                                );
                                e.valid = false;
                                true
                            } else if e.entry_list.is_some() {
                                e.valid = true;
                                false
                            } else if e.first > entries {
                                error!(
                                    file = %e.file_url,
                                    first = e.first,
                                    entries,
                                    operator = "PacketizerValidate",
                                    "first entry past end of file, skipping file"
                                );
                                e.valid = false;
                                true
                            } else {
                                if e.num == -1 {
                                    e.num = entries - e.first;
                                } else if e.first + e.num > entries {
                                    warn!(
                                        file = %e.file_url,
                                        first = e.first,
                                        num = e.num,
                                        entries,
                                        operator = "PacketizerValidate",
                                        "range past end of file, clamping"
                                    );
                                    e.num = entries - e.first;
                                }
                                e.valid = true;
                                false
                            }
                        };
                        if dropped {
                            global_metrics().inc_validation_failures(&node_host);
                        } else {
                            validated += 1;
                            if let Some(p) = &self.progress {
                                p.file_validated(validated, total_files, self.valid);
                            }
                        }
                        idle.push_back(worker);
                    }
                },
            }
        }

        if !self.valid {
            return Err(PfwError::WorkerLost(
                "worker lost during validation; query is invalid".to_string(),
            ));
        }
        Ok(())
    }
}

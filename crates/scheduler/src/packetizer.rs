//! Adaptive packetizer state machine and scheduling logic.
//!
//! Responsibilities:
//! - own the clipped working set (elements bucketed by host into data
//!   nodes, one dispatch cursor per file);
//! - serve worker pulls: account the previous packet, pick the next file
//!   with locality preference, size the next packet from observed rates;
//! - keep per-node worker counters that drive the node ordering;
//! - terminate exactly when every entry of the clipped range was delivered
//!   once.
//!
//! Two node orderings exist, selected once per query: when the network is
//! faster than local disk, nodes with fewer running workers come first;
//! otherwise nodes whose resident workers are busy elsewhere come first,
//! with reversals when the remaining-work imbalance is large. The Mode B
//! comparator is intentionally not antisymmetric in all counter
//! configurations (see [`compare_nodes`]); node lists are small and sorted
//! with a stable sort on every decision.

use std::cmp::Ordering;
use std::collections::HashMap;

use pfw_common::metrics::global_metrics;
use pfw_common::{PacketizerConfig, PfwError, Result};
use pfw_dataset::{Dataset, DatasetElement, EntryList, UrlResolver};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::progress::ProgressReporter;
use crate::transport::{WorkerInfo, WorkerSession};

/// A sub-range of one element handed to one worker in one round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// File to read.
    pub file_url: String,
    /// Directory inside the file.
    pub directory: String,
    /// Object to process.
    pub object_name: String,
    /// First entry of the packet.
    pub first: i64,
    /// Number of entries in the packet.
    pub num: i64,
    /// Slice of the element's entry list covering this packet, if any.
    pub entry_list: Option<EntryList>,
}

/// Worker-reported statistics for one finished packet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacketReport {
    /// Request/reply latency in seconds.
    pub latency: f64,
    /// Wall-clock processing time in seconds.
    pub proc_time: f64,
    /// CPU time in seconds.
    pub proc_cpu: f64,
    /// Bytes read while processing, when reported.
    pub bytes_read: Option<i64>,
    /// Entry total of the file, when re-measured by the worker.
    pub total_entries: Option<i64>,
    /// Worker's cumulative processed count, when reported.
    ///
    /// Overrides the packet size during accounting so workers that skip
    /// entries stay accurately tracked.
    pub processed_total: Option<i64>,
}

pub(crate) type NodeId = usize;

/// Handle to one file cursor: node index plus position in the node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileRef {
    pub(crate) node: NodeId,
    pub(crate) file: usize,
}

/// Dispatch cursor over one element's remaining range.
#[derive(Debug)]
pub(crate) struct FileCursor {
    /// Parent node, as an opaque handle.
    pub(crate) node: NodeId,
    /// Index of the element in the packetizer's working set.
    pub(crate) elem: usize,
    /// Next entry to dispatch.
    pub(crate) next_entry: i64,
    /// Whether the whole range was dispatched.
    pub(crate) done: bool,
}

/// All file cursors whose file lives on one host.
#[derive(Debug)]
pub(crate) struct DataNode {
    pub(crate) host: String,
    pub(crate) files: Vec<FileCursor>,
    /// Cursor into `files`; advances only forward.
    pub(crate) unalloc_next: usize,
    /// Files currently being served, as indices into `files`.
    pub(crate) active: Vec<usize>,
    /// Round-robin cursor into `active`.
    pub(crate) act_next: usize,
    /// Workers residing on this host.
    pub(crate) resident_workers: i32,
    /// External workers currently assigned a file here.
    pub(crate) external_workers: i32,
    /// Total workers currently consuming this node's data.
    pub(crate) running_workers: i32,
    /// Entries processed on this node.
    pub(crate) processed: i64,
    /// Entries in files on this node.
    pub(crate) events: i64,
}

impl DataNode {
    pub(crate) fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            files: Vec::new(),
            unalloc_next: 0,
            active: Vec::new(),
            act_next: 0,
            resident_workers: 0,
            external_workers: 0,
            running_workers: 0,
            processed: 0,
            events: 0,
        }
    }

    pub(crate) fn add(&mut self, node: NodeId, elem: usize, first: i64) {
        self.files.push(FileCursor {
            node,
            elem,
            next_entry: first,
            done: false,
        });
    }

    /// Hand out the next unallocated file and make it active.
    pub(crate) fn next_unalloc(&mut self) -> Option<usize> {
        if self.unalloc_next >= self.files.len() {
            return None;
        }
        let idx = self.unalloc_next;
        self.unalloc_next += 1;
        self.active.push(idx);
        Some(idx)
    }

    /// Round-robin over files with work remaining.
    pub(crate) fn next_active(&mut self) -> Option<usize> {
        if self.active.is_empty() {
            return None;
        }
        if self.act_next >= self.active.len() {
            self.act_next = 0;
        }
        let idx = self.active[self.act_next];
        self.act_next = (self.act_next + 1) % self.active.len();
        Some(idx)
    }

    /// Drop a finished file from the active rotation, keeping the cursor on
    /// the file that followed it.
    pub(crate) fn remove_active(&mut self, file: usize) {
        if let Some(pos) = self.active.iter().position(|&f| f == file) {
            self.active.remove(pos);
            if pos < self.act_next {
                self.act_next -= 1;
            }
            if self.act_next >= self.active.len() {
                self.act_next = 0;
            }
        }
    }

    /// Remaining events with one extra hypothetical worker added.
    pub(crate) fn events_left_per_worker(&self) -> i64 {
        (self.events - self.processed) / (self.running_workers as i64 + 1)
    }

    pub(crate) fn worker_cnt(&self) -> i32 {
        self.resident_workers + self.external_workers
    }

    pub(crate) fn inc_external(&mut self, worker_host: &str) {
        if self.host != worker_host {
            self.external_workers += 1;
        }
    }

    pub(crate) fn dec_external(&mut self, worker_host: &str) {
        if self.host != worker_host {
            self.external_workers -= 1;
            debug_assert!(self.external_workers >= 0);
        }
    }

    pub(crate) fn inc_running(&mut self) {
        self.running_workers += 1;
    }

    pub(crate) fn dec_running(&mut self) {
        self.running_workers -= 1;
        debug_assert!(self.running_workers >= 0);
    }

    pub(crate) fn reset(&mut self) {
        self.unalloc_next = 0;
        self.active.clear();
        self.act_next = 0;
        self.resident_workers = 0;
        self.external_workers = 0;
        self.running_workers = 0;
    }
}

/// Order two nodes by need for another worker; `Less` means more in need.
///
/// Mode A (network faster than disk): fewer running workers first, then
/// more remaining events. Mode B (disk faster than network): primarily by
/// workers that could process remote files but currently do not, reversed
/// when the remaining-work imbalance exceeds half (or a third) of the
/// average and the opposite node still has external capacity. The Mode B
/// branches do not form an antisymmetric total order under every counter
/// configuration; callers rely on stable sorting, which keeps repeated
/// resorts deterministic.
pub(crate) fn compare_nodes(
    a: &DataNode,
    b: &DataNode,
    network_faster_than_hd: bool,
    max_workers_per_node: i32,
) -> Ordering {
    if network_faster_than_hd {
        // Fewer running workers first; ties go to the node with more
        // remaining events.
        return a
            .running_workers
            .cmp(&b.running_workers)
            .then((b.events - b.processed).cmp(&(a.events - a.processed)));
    }

    let diff = a.events_left_per_worker() - b.events_left_per_worker();
    let avg = (a.events_left_per_worker() + b.events_left_per_worker()) / 2;
    let a_proc_remote = a.worker_cnt() - a.running_workers;
    let b_proc_remote = b.worker_cnt() - b.running_workers;

    if a_proc_remote < b_proc_remote {
        if diff < -(avg / 2) && b.external_workers < max_workers_per_node {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    } else if a_proc_remote > b_proc_remote {
        if diff > avg / 2 && a.external_workers < max_workers_per_node {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    } else if a.external_workers < b.external_workers {
        if diff < -(avg / 3) && b.external_workers < max_workers_per_node {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    } else if a.external_workers > b.external_workers {
        if diff > avg / 3 && a.external_workers < max_workers_per_node {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    } else if a.resident_workers < b.resident_workers {
        if diff < -(avg / 3) && b.external_workers < max_workers_per_node {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    } else if a.resident_workers > b.resident_workers {
        if diff > avg / 3 && a.external_workers < max_workers_per_node {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    } else {
        match diff.cmp(&0) {
            Ordering::Greater => Ordering::Less,
            Ordering::Less => Ordering::Greater,
            Ordering::Equal => Ordering::Equal,
        }
    }
}

fn sort_node_list(
    list: &mut [NodeId],
    nodes: &[DataNode],
    network_faster_than_hd: bool,
    max_workers_per_node: i32,
) {
    list.sort_by(|&a, &b| {
        compare_nodes(
            &nodes[a],
            &nodes[b],
            network_faster_than_hd,
            max_workers_per_node,
        )
    });
}

/// Per-worker scheduling state.
#[derive(Debug)]
pub(crate) struct WorkerState {
    pub(crate) host: String,
    pub(crate) perf_idx: i32,
    /// Home node, while it still has work for this worker.
    pub(crate) file_node: Option<NodeId>,
    /// File currently being processed.
    pub(crate) cur_file: Option<FileRef>,
    /// Outgoing packet awaiting its report.
    pub(crate) cur_packet: Option<Packet>,
    pub(crate) processed: i64,
    pub(crate) proc_time: f64,
    pub(crate) cur_processed: i64,
    pub(crate) cur_proc_time: f64,
}

impl WorkerState {
    fn new(info: &WorkerInfo) -> Self {
        Self {
            host: info.host.clone(),
            perf_idx: info.perf_idx,
            file_node: None,
            cur_file: None,
            cur_packet: None,
            processed: 0,
            proc_time: 0.0,
            cur_processed: 0,
            cur_proc_time: 0.0,
        }
    }

    pub(crate) fn avg_rate(&self) -> f64 {
        if self.proc_time != 0.0 {
            self.processed as f64 / self.proc_time
        } else {
            0.0
        }
    }

    pub(crate) fn cur_rate(&self) -> f64 {
        if self.cur_proc_time != 0.0 {
            self.cur_processed as f64 / self.cur_proc_time
        } else {
            0.0
        }
    }
}

/// The adaptive packetizer: owns the clipped working set and produces the
/// next packet on each worker pull.
#[derive(Debug)]
pub struct Packetizer {
    pub(crate) cfg: PacketizerConfig,
    pub(crate) is_tree: bool,
    /// Clipped working set; immutable after construction.
    pub(crate) elements: Vec<DatasetElement>,
    pub(crate) nodes: Vec<DataNode>,
    pub(crate) node_by_host: HashMap<String, NodeId>,
    pub(crate) worker_stats: HashMap<String, WorkerState>,
    pub(crate) unallocated: Vec<NodeId>,
    pub(crate) active: Vec<NodeId>,
    pub(crate) total_entries: i64,
    pub(crate) processed: i64,
    pub(crate) bytes_read: i64,
    pub(crate) cum_proc_time: f64,
    pub(crate) max_perf_idx: i32,
    pub(crate) events_on_remote_loc: i64,
    pub(crate) valid: bool,
    pub(crate) stop: bool,
    pub(crate) packets: Vec<Packet>,
    pub(crate) progress: Option<ProgressReporter>,
}

impl Packetizer {
    /// Build a packetizer over `dataset` for the workers in `session`,
    /// restricted to the global `(first, num)` range (`num == -1` meaning
    /// all remaining).
    ///
    /// Runs end-point lookup, the startup validation round, and global
    /// range clipping; the result is ready to serve [`Self::next_packet`].
    pub fn new(
        dataset: &Dataset,
        session: &WorkerSession,
        first: i64,
        num: i64,
        cfg: PacketizerConfig,
        resolver: &dyn UrlResolver,
        progress: Option<ProgressReporter>,
    ) -> Result<Packetizer> {
        debug!(first, num, operator = "Packetizer", "enter");
        if dataset.is_empty() {
            return Err(PfwError::InvalidInput("dataset has no elements".to_string()));
        }
        if session.workers().is_empty() {
            return Err(PfwError::InvalidInput("worker pool is empty".to_string()));
        }

        // Resolve end-point urls to optimize distribution.
        let mut ds = dataset.clone();
        ds.lookup(resolver)?;

        let mut pkt = Packetizer {
            cfg,
            is_tree: ds.is_tree,
            elements: ds.elements().to_vec(),
            nodes: Vec::new(),
            node_by_host: HashMap::new(),
            worker_stats: HashMap::new(),
            unallocated: Vec::new(),
            active: Vec::new(),
            total_entries: 0,
            processed: 0,
            bytes_read: 0,
            cum_proc_time: 0.0,
            max_perf_idx: 1,
            events_on_remote_loc: 0,
            valid: true,
            stop: false,
            packets: Vec::new(),
            progress,
        };

        for w in session.workers() {
            pkt.max_perf_idx = pkt.max_perf_idx.max(w.perf_idx);
            pkt.worker_stats.insert(w.id.clone(), WorkerState::new(w));
        }

        // Bucket the elements that still need an entry count; elements
        // validated upstream keep their totals.
        for idx in 0..pkt.elements.len() {
            if pkt.elements[idx].valid {
                pkt.elements[idx].dataset_offset = pkt.elements[idx].entries.max(0);
                continue;
            }
            let host = pkt.elements[idx].host();
            let elem_first = pkt.elements[idx].first;
            let nid = pkt.node_for_host(&host);
            pkt.nodes[nid].add(nid, idx, elem_first);
        }

        pkt.reset();
        pkt.validate_files(session)?;

        // Per-element validation failures were dropped; rewrite the offsets
        // of the survivors to cumulative sums.
        pkt.elements.retain(|e| e.valid);
        let mut offset = 0;
        for e in &mut pkt.elements {
            let per_file = e.dataset_offset;
            e.dataset_offset = offset;
            offset += per_file;
        }

        // Apply the global (first, num) range and rebuild the node
        // structure from the clipped set.
        pkt.nodes.clear();
        pkt.node_by_host.clear();
        pkt.unallocated.clear();
        pkt.active.clear();
        let mut files = 0_usize;
        let mut total_entries = 0_i64;
        let mut cur = 0_i64;
        let validated = std::mem::take(&mut pkt.elements);
        let mut kept: Vec<DatasetElement> = Vec::new();
        for mut e in validated {
            if e.entry_list.is_none() {
                let e_num = e.num;
                // entirely before the start of the global range
                if cur + e_num < first {
                    cur += e_num;
                    continue;
                }
                // entirely after the end of the global range
                if num != -1 && first + num <= cur {
                    cur += e_num;
                    continue;
                }
                // contains the end of the global range
                if num != -1 && first + num < cur + e_num {
                    e.num = first + num - cur;
                }
                // contains the start of the global range
                if cur < first {
                    e.first += first - cur;
                    e.num -= first - cur;
                }
                cur += e_num;
            } else {
                let n = e.entry_list.as_ref().map(EntryList::count).unwrap_or(0);
                if n == 0 {
                    continue;
                }
                if e.num == -1 {
                    e.num = n - e.first;
                }
            }

            let host = e.host();
            let elem_first = e.first;
            let elem_num = e.num;
            let idx = kept.len();
            kept.push(e);
            let nid = pkt.node_for_host(&host);
            pkt.nodes[nid].add(nid, idx, elem_first);
            pkt.nodes[nid].events += elem_num;
            total_entries += elem_num;
            files += 1;
        }
        pkt.elements = kept;
        if let Some(list) = &ds.entry_list {
            // A dataset-level entry list overrides the clipped total.
            total_entries = list.count();
        }
        pkt.total_entries = total_entries;
        info!(
            total_entries,
            files,
            hosts = pkt.nodes.len(),
            operator = "Packetizer",
            "validated work set"
        );
        pkt.reset();

        // Count work that is not cached on any worker's host.
        let mut no_remote_files = 0_i64;
        let mut total_files = 0_i64;
        pkt.events_on_remote_loc = 0;
        for n in &pkt.nodes {
            total_files += n.files.len() as i64;
            if n.worker_cnt() == 0 {
                no_remote_files += n.files.len() as i64;
                pkt.events_on_remote_loc += n.events - n.processed;
            }
        }
        if total_files == 0 {
            return Err(PfwError::InvalidInput(
                "no valid or non-empty file found".to_string(),
            ));
        }
        // Integer division on purpose; diagnostic only.
        let fraction_of_remote_files = no_remote_files / total_files;
        info!(
            fraction_of_remote_files,
            operator = "Packetizer",
            "remote file fraction"
        );
        Ok(pkt)
    }

    /// Serve one worker pull: account `report` for the previous packet and
    /// return the next packet, or `None` when this worker is done.
    pub fn next_packet(
        &mut self,
        worker_id: &str,
        report: Option<&PacketReport>,
    ) -> Result<Option<Packet>> {
        if !self.valid {
            return Ok(None);
        }
        if !self.worker_stats.contains_key(worker_id) {
            return Err(PfwError::InvalidInput(format!(
                "unknown worker: {worker_id}"
            )));
        }

        // Account the previous packet.
        let finished = self
            .worker_stats
            .get_mut(worker_id)
            .and_then(|ws| ws.cur_packet.take());
        if let Some(prev) = finished {
            let r = report.ok_or_else(|| {
                PfwError::Protocol(format!("missing packet report from worker {worker_id}"))
            })?;
            let mut numev = prev.num;
            if let Some(totev) = r.processed_total {
                if totev > 0 {
                    numev = totev - self.worker_stats[worker_id].processed;
                }
            }
            self.processed += numev.max(0);
            let bytes = r.bytes_read.unwrap_or(0).max(0);
            self.bytes_read += bytes;
            self.cum_proc_time += r.proc_time;

            let cur_file = self.worker_stats[worker_id].cur_file;
            let cur_done = cur_file.map(|f| self.cursor(f).done).unwrap_or(false);
            {
                let ws = self
                    .worker_stats
                    .get_mut(worker_id)
                    .expect("worker checked above");
                if cur_done {
                    ws.cur_processed = 0;
                    ws.cur_proc_time = 0.0;
                } else {
                    ws.cur_processed += numev;
                    ws.cur_proc_time += r.proc_time;
                }
                ws.processed += numev;
                ws.proc_time += r.proc_time;
            }
            if let Some(f) = cur_file {
                self.nodes[f.node].processed += numev;
            }

            global_metrics().record_packet(
                worker_id,
                numev.max(0) as u64,
                bytes as u64,
                r.proc_time,
            );
            debug!(
                worker_id,
                entries = numev,
                latency = r.latency,
                proc_time = r.proc_time,
                proc_cpu = r.proc_cpu,
                file = %prev.file_url,
                operator = "PacketizerAccount",
                "accounted packet"
            );
            self.packets.push(prev);

            if self.processed == self.total_entries {
                if let Some(p) = self.progress.take() {
                    p.report(self.processed, self.total_entries, true);
                }
            }
        }

        if self.stop {
            return Ok(None);
        }

        // Retire the worker's file if the previous packet finished it.
        let mut file = self.worker_stats[worker_id].cur_file;
        if let Some(f) = file {
            if self.cursor(f).done {
                let host = self.worker_stats[worker_id].host.clone();
                let parent = self.cursor(f).node;
                let node = &mut self.nodes[parent];
                node.dec_external(&host);
                node.dec_running();
                let node_host = node.host.clone();
                let running = node.running_workers.max(0) as u64;
                let local = node_host == host;
                global_metrics().record_file_event(&node_host, local, false);
                global_metrics().set_node_running_workers(&node_host, running);
                debug!(
                    worker_id,
                    host = %node_host,
                    operator = "PacketizerFileClose",
                    "file retired"
                );
                self.worker_stats
                    .get_mut(worker_id)
                    .expect("worker checked above")
                    .cur_file = None;
                file = None;
            }
        }

        if self.total_entries == self.processed {
            return Ok(None);
        }
        let num_workers = self.worker_stats.len() as i64;
        let avg_events_left_per_worker = (self.total_entries - self.processed) / num_workers;

        // Pick a file if the worker has none.
        if file.is_none() {
            // Aiming for a preference of 1 when as many events are left on
            // worker-less hosts as everywhere else.
            let local_preference = self.cfg.base_local_preference
                - self.events_on_remote_loc as f32
                    / (0.4 * (self.total_entries - self.processed) as f32);

            if let Some(home) = self.worker_stats[worker_id].file_node {
                self.sort_unallocated();
                let first_remote = self.unallocated.first().copied();
                let remote_possible = first_remote
                    .map(|n| {
                        self.nodes[n].external_workers < self.cfg.max_workers_per_node as i32
                    })
                    .unwrap_or(false);
                let mut open_local = !remote_possible;
                if remote_possible {
                    let worker_rate = self.worker_stats[worker_id].avg_rate();
                    let home_node = &self.nodes[home];
                    let local_events_left = home_node.events_left_per_worker();
                    let remote = &self.nodes[first_remote.expect("remote_possible checked")];
                    if home_node.running_workers > home_node.resident_workers - 1 {
                        // External workers already help the home node; the
                        // requester is not running at this point.
                        open_local = true;
                    } else if worker_rate == 0.0 {
                        // First file for this worker in this query.
                        if local_events_left as f32 * local_preference
                            > avg_events_left_per_worker as f32
                        {
                            open_local = true;
                        } else if (remote.events_left_per_worker() as f32)
                            < local_events_left as f32 * local_preference
                        {
                            open_local = true;
                        } else if remote.external_workers > 1 {
                            open_local = true;
                        } else if remote.running_workers == 0 {
                            open_local = true;
                        }
                    } else {
                        let worker_time = local_events_left as f32 / worker_rate as f32;
                        let avg_time = avg_events_left_per_worker as f32
                            / (self.processed as f32 / self.cum_proc_time as f32);
                        if worker_time * local_preference > avg_time {
                            open_local = true;
                        } else if (remote.events_left_per_worker() as f32)
                            < local_events_left as f32 * local_preference
                        {
                            open_local = true;
                        }
                    }
                }
                if open_local {
                    let picked = self.nodes[home]
                        .next_unalloc()
                        .or_else(|| self.nodes[home].next_active())
                        .map(|f| FileRef { node: home, file: f });
                    if picked.is_none() {
                        // No more files on the worker's host.
                        self.worker_stats
                            .get_mut(worker_id)
                            .expect("worker checked above")
                            .file_node = None;
                    }
                    file = picked;
                }
            }

            if file.is_none() {
                file = self.next_unalloc_any();
            }
            if file.is_none() {
                file = self.next_active_any();
            }
            let Some(f) = file else {
                return Ok(None);
            };

            // First touch of a file on a host without resident workers
            // moves its events out of the remote-location pool.
            let first_touch_remote = {
                let node = &self.nodes[f.node];
                let cursor = &node.files[f.file];
                node.resident_workers == 0
                    && cursor.next_entry == self.elements[cursor.elem].first
            };
            if first_touch_remote {
                let elem_num = {
                    let cursor = &self.nodes[f.node].files[f.file];
                    self.elements[cursor.elem].num
                };
                self.events_on_remote_loc -= elem_num;
                debug_assert!(self.events_on_remote_loc >= 0);
            }

            let host = self.worker_stats[worker_id].host.clone();
            let node = &mut self.nodes[f.node];
            node.inc_external(&host);
            node.inc_running();
            let node_host = node.host.clone();
            let running = node.running_workers.max(0) as u64;
            let local = node_host == host;
            global_metrics().record_file_event(&node_host, local, true);
            global_metrics().set_node_running_workers(&node_host, running);
            debug!(
                worker_id,
                host = %node_host,
                local,
                operator = "PacketizerFileOpen",
                "file opened"
            );
            self.worker_stats
                .get_mut(worker_id)
                .expect("worker checked above")
                .cur_file = Some(f);
        }

        let f = file.expect("file chosen above");
        let mut num = self.calculate_packet_size(worker_id, num_workers);

        // Carve the packet; a remainder smaller than the packet size is
        // folded into this packet and the file retired.
        let (elem_idx, first) = {
            let cursor = self.cursor(f);
            (cursor.elem, cursor.next_entry)
        };
        let last = {
            let e = &self.elements[elem_idx];
            e.first + e.num
        };
        if first + num >= last {
            num = last - first;
            self.cursor_mut(f).done = true;
            self.remove_active(f);
        } else {
            self.cursor_mut(f).next_entry += num;
        }

        let e = &self.elements[elem_idx];
        let packet = Packet {
            file_url: e.file_url.clone(),
            directory: e.directory.clone(),
            object_name: e.object_name.clone(),
            first,
            num,
            entry_list: e.entry_list.as_ref().map(|l| l.slice(first, num)),
        };
        self.worker_stats
            .get_mut(worker_id)
            .expect("worker checked above")
            .cur_packet = Some(packet.clone());
        Ok(Some(packet))
    }

    /// Packet size from this worker's rate and the estimated time left.
    fn calculate_packet_size(&self, worker_id: &str, num_workers: i64) -> i64 {
        let ws = &self.worker_stats[worker_id];
        let k = self.cfg.packet_as_fraction.max(1) as f64;
        let mut rate = ws.cur_rate();
        if rate == 0.0 {
            rate = ws.avg_rate();
        }
        let num = if rate > 0.0 {
            let avg_proc_rate =
                self.processed as f64 / (self.cum_proc_time / num_workers as f64);
            let mut packet_time =
                ((self.total_entries - self.processed) as f64 / avg_proc_rate) / k;
            if packet_time < self.cfg.min_packet_time_secs as f64 {
                packet_time = self.cfg.min_packet_time_secs as f64;
            }
            (rate * packet_time) as i64
        } else {
            // First packet for this worker in this query.
            let base = (self.total_entries - self.processed)
                / (8 * self.cfg.packet_as_fraction.max(1) as i64 * num_workers);
            (base as f64 * (ws.perf_idx as f64 / self.max_perf_idx as f64)) as i64
        };
        num.max(1)
    }

    /// Request cooperative cancellation; packets already dispatched are not
    /// recalled.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// Mark a worker bad after a transport failure or fatal reply.
    ///
    /// There is no reassignment of the worker's in-flight packet: the whole
    /// query becomes unreliable and every subsequent pull returns no packet.
    pub fn mark_worker_bad(&mut self, worker_id: &str) {
        error!(
            worker_id,
            operator = "Packetizer",
            "worker marked bad, query invalid"
        );
        self.valid = false;
    }

    /// Whether the query is still reliable.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Entries accounted so far.
    pub fn processed(&self) -> i64 {
        self.processed
    }

    /// Entries in the clipped working set.
    pub fn total_entries(&self) -> i64 {
        self.total_entries
    }

    /// Bytes read as reported by workers.
    pub fn bytes_read(&self) -> i64 {
        self.bytes_read
    }

    /// Entries processed by one worker.
    pub fn entries_processed(&self, worker_id: &str) -> i64 {
        self.worker_stats
            .get(worker_id)
            .map(|ws| ws.processed)
            .unwrap_or(0)
    }

    /// Every packet accounted so far, in accounting order.
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// The clipped working set.
    pub fn elements(&self) -> &[DatasetElement] {
        &self.elements
    }

    pub(crate) fn cursor(&self, f: FileRef) -> &FileCursor {
        &self.nodes[f.node].files[f.file]
    }

    pub(crate) fn cursor_mut(&mut self, f: FileRef) -> &mut FileCursor {
        &mut self.nodes[f.node].files[f.file]
    }

    pub(crate) fn node_for_host(&mut self, host: &str) -> NodeId {
        if let Some(&nid) = self.node_by_host.get(host) {
            return nid;
        }
        let nid = self.nodes.len();
        self.nodes.push(DataNode::new(host));
        self.node_by_host.insert(host.to_string(), nid);
        nid
    }

    /// Rewind cursors, clear counters, and re-assign home nodes.
    pub(crate) fn reset(&mut self) {
        let Self {
            ref mut nodes,
            ref node_by_host,
            ref mut worker_stats,
            ref mut unallocated,
            ref mut active,
            ..
        } = *self;
        unallocated.clear();
        unallocated.extend(0..nodes.len());
        active.clear();
        for node in nodes.iter_mut() {
            node.reset();
        }
        for ws in worker_stats.values_mut() {
            ws.cur_file = None;
            ws.file_node = node_by_host.get(&ws.host).copied();
            if let Some(nid) = ws.file_node {
                nodes[nid].resident_workers += 1;
            }
        }
    }

    pub(crate) fn sort_unallocated(&mut self) {
        sort_node_list(
            &mut self.unallocated,
            &self.nodes,
            self.cfg.network_faster_than_hd,
            self.cfg.max_workers_per_node as i32,
        );
    }

    fn sort_active(&mut self) {
        sort_node_list(
            &mut self.active,
            &self.nodes,
            self.cfg.network_faster_than_hd,
            self.cfg.max_workers_per_node as i32,
        );
    }

    /// Head of the sorted unallocated list, unless it hit the external cap.
    fn next_node(&mut self) -> Option<NodeId> {
        self.sort_unallocated();
        let first = *self.unallocated.first()?;
        if self.nodes[first].external_workers >= self.cfg.max_workers_per_node as i32 {
            debug!(
                host = %self.nodes[first].host,
                limit = self.cfg.max_workers_per_node,
                operator = "PacketizerNextNode",
                "reached workers-per-node limit"
            );
            return None;
        }
        Some(first)
    }

    fn next_active_node(&mut self) -> Option<NodeId> {
        self.sort_active();
        let first = *self.active.first()?;
        if self.nodes[first].external_workers >= self.cfg.max_workers_per_node as i32 {
            debug!(
                host = %self.nodes[first].host,
                limit = self.cfg.max_workers_per_node,
                operator = "PacketizerNextActiveNode",
                "reached workers-per-node limit"
            );
            return None;
        }
        Some(first)
    }

    /// Next unallocated file from `node`, retiring the node from the
    /// unallocated list when exhausted.
    pub(crate) fn next_unalloc_on(&mut self, node: NodeId) -> Option<FileRef> {
        match self.nodes[node].next_unalloc() {
            Some(fidx) => {
                if !self.active.contains(&node) {
                    self.active.push(node);
                }
                Some(FileRef { node, file: fidx })
            }
            None => {
                self.remove_unalloc_node(node);
                None
            }
        }
    }

    /// Next unallocated file from the most needing node.
    pub(crate) fn next_unalloc_any(&mut self) -> Option<FileRef> {
        loop {
            let node = self.next_node()?;
            match self.nodes[node].next_unalloc() {
                Some(fidx) => {
                    if !self.active.contains(&node) {
                        self.active.push(node);
                    }
                    return Some(FileRef { node, file: fidx });
                }
                None => self.remove_unalloc_node(node),
            }
        }
    }

    /// Next file already being served, from the most needing active node.
    fn next_active_any(&mut self) -> Option<FileRef> {
        loop {
            let node = self.next_active_node()?;
            match self.nodes[node].next_active() {
                Some(fidx) => return Some(FileRef { node, file: fidx }),
                None => self.remove_active_node(node),
            }
        }
    }

    pub(crate) fn remove_unalloc_node(&mut self, node: NodeId) {
        self.unallocated.retain(|&n| n != node);
    }

    fn remove_active_node(&mut self, node: NodeId) {
        self.active.retain(|&n| n != node);
    }

    /// Retire a finished file from its node's rotation.
    pub(crate) fn remove_active(&mut self, f: FileRef) {
        self.nodes[f.node].remove_active(f.file);
        if self.nodes[f.node].active.is_empty() {
            self.remove_active_node(f.node);
        }
    }
}

#[cfg(test)]
#[path = "packetizer_tests.rs"]
mod tests;

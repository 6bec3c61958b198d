use std::collections::{HashMap, VecDeque};
use std::thread::{self, JoinHandle};

use pfw_common::{PacketizerConfig, PfwError};
use pfw_dataset::{Dataset, DatasetElement, IdentityResolver};
use pfw_scheduler::{
    Packet, PacketReport, Packetizer, ProgressReporter, WorkerEndpoint, WorkerInfo, WorkerLink,
    WorkerReply, WorkerSession,
};

fn dataset(files: &[(&str, i64)]) -> Dataset {
    let mut ds = Dataset::new("test", "events", "/", true);
    for (url, num) in files {
        ds.add(DatasetElement::new(url, "events", "/", 0, *num));
    }
    ds
}

fn counting_worker(
    endpoint: WorkerEndpoint,
    entries: HashMap<String, i64>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for req in endpoint.requests.iter() {
            let n = entries.get(&req.file_url).copied().unwrap_or(0);
            let _ = endpoint.replies.send(WorkerReply::Entries {
                entries: n,
                resolved_object_name: None,
            });
        }
    })
}

fn pool(
    workers: &[(&str, &str, i32)],
    entries: &HashMap<String, i64>,
) -> (WorkerSession, Vec<JoinHandle<()>>) {
    let mut session = WorkerSession::new();
    let mut handles = Vec::new();
    for (id, host, perf_idx) in workers {
        let (link, endpoint) = WorkerLink::pair();
        session.register(
            WorkerInfo {
                id: id.to_string(),
                host: host.to_string(),
                perf_idx: *perf_idx,
            },
            link,
        );
        handles.push(counting_worker(endpoint, entries.clone()));
    }
    (session, handles)
}

fn config(max_workers_per_node: u32) -> PacketizerConfig {
    PacketizerConfig {
        max_workers_per_node,
        ..PacketizerConfig::default()
    }
}

/// Round-robin the workers through the packetizer until everyone is done,
/// reporting each packet as processed at `speed` entries per second.
fn drain(
    pkt: &mut Packetizer,
    workers: &[&str],
    speed: f64,
) -> Vec<(String, Packet)> {
    let mut delivered = Vec::new();
    let mut pending: HashMap<String, PacketReport> = HashMap::new();
    let mut alive: VecDeque<&str> = workers.iter().copied().collect();
    while let Some(w) = alive.pop_front() {
        let report = pending.remove(w);
        match pkt.next_packet(w, report.as_ref()).expect("next_packet") {
            Some(p) => {
                pending.insert(
                    w.to_string(),
                    PacketReport {
                        latency: 0.001,
                        proc_time: p.num as f64 / speed,
                        proc_cpu: 0.0,
                        bytes_read: Some(p.num * 8),
                        total_entries: None,
                        processed_total: None,
                    },
                );
                delivered.push((w.to_string(), p));
                alive.push_back(w);
            }
            None => {}
        }
    }
    delivered
}

/// Packets within one file must cover its clipped range contiguously,
/// ascending and mutually disjoint.
fn assert_disjoint_cover(delivered: &[(String, Packet)], pkt: &Packetizer) {
    let mut by_file: HashMap<&str, Vec<&Packet>> = HashMap::new();
    for (_, p) in delivered {
        by_file.entry(p.file_url.as_str()).or_default().push(p);
    }
    for e in pkt.elements() {
        let mut packets = by_file.remove(e.file_url.as_str()).unwrap_or_default();
        packets.sort_by_key(|p| p.first);
        let mut next = e.first;
        for p in &packets {
            assert_eq!(p.first, next, "gap or overlap in {}", e.file_url);
            next += p.num;
        }
        assert_eq!(next, e.first + e.num, "incomplete cover of {}", e.file_url);
        let total: i64 = packets.iter().map(|p| p.num).sum();
        assert_eq!(total, e.num);
    }
    assert!(by_file.is_empty(), "packets for unknown files: {by_file:?}");
}

#[test]
fn single_worker_single_file_seeds_then_adapts() {
    let entries = HashMap::from([("nfs://h1/f0.dat".to_string(), 100_i64)]);
    let (session, handles) = pool(&[("w1", "h1", 4)], &entries);
    let ds = dataset(&[("nfs://h1/f0.dat", -1)]);
    let mut pkt = Packetizer::new(
        &ds,
        &session,
        0,
        -1,
        config(2),
        &IdentityResolver,
        None,
    )
    .expect("build packetizer");

    assert_eq!(pkt.total_entries(), 100);
    let delivered = drain(&mut pkt, &["w1"], 100.0);

    // First packet with no rate history: 100 / (8 * 4 * 1) = 3; the second
    // uses the observed rate.
    assert_eq!(delivered[0].1.first, 0);
    assert_eq!(delivered[0].1.num, 3);
    assert!(delivered[1].1.num > 3);
    assert_eq!(pkt.processed(), 100);
    assert_eq!(pkt.entries_processed("w1"), 100);
    assert_disjoint_cover(&delivered, &pkt);

    drop(session);
    for h in handles {
        h.join().expect("worker thread");
    }
}

#[test]
fn workers_stay_on_their_home_hosts_when_work_is_balanced() {
    let files = [
        ("nfs://h1/f0.dat", 100_i64),
        ("nfs://h1/f1.dat", 100),
        ("nfs://h2/f2.dat", 100),
        ("nfs://h2/f3.dat", 100),
    ];
    let entries: HashMap<String, i64> =
        files.iter().map(|(u, n)| (u.to_string(), *n)).collect();
    let (session, handles) = pool(&[("w1", "h1", 1), ("w2", "h2", 1)], &entries);
    let ds = dataset(&files.map(|(u, _)| (u, -1_i64)));
    let mut pkt = Packetizer::new(
        &ds,
        &session,
        0,
        -1,
        config(2),
        &IdentityResolver,
        None,
    )
    .expect("build packetizer");

    let delivered = drain(&mut pkt, &["w1", "w2"], 100.0);
    assert_eq!(pkt.processed(), 400);
    assert_disjoint_cover(&delivered, &pkt);
    for (worker, packet) in &delivered {
        let host = if worker == "w1" { "nfs://h1/" } else { "nfs://h2/" };
        assert!(
            packet.file_url.starts_with(host),
            "{worker} was sent off-host packet {}",
            packet.file_url
        );
    }

    drop(session);
    for h in handles {
        h.join().expect("worker thread");
    }
}

#[test]
fn remote_host_saturation_is_capped() {
    let mut files: Vec<(String, i64)> = Vec::new();
    for i in 0..6 {
        files.push((format!("nfs://h1/f{i}.dat"), 100));
    }
    for i in 0..6 {
        files.push((format!("nfs://h2/r{i}.dat"), 100));
    }
    let entries: HashMap<String, i64> = files.iter().cloned().collect();
    let refs: Vec<(&str, i64)> = files.iter().map(|(u, _)| (u.as_str(), -1)).collect();
    let (session, handles) = pool(
        &[("w1", "h1", 1), ("w2", "h1", 1), ("w3", "h1", 1)],
        &entries,
    );
    let ds = dataset(&refs);
    let mut pkt = Packetizer::new(
        &ds,
        &session,
        0,
        -1,
        config(2),
        &IdentityResolver,
        None,
    )
    .expect("build packetizer");

    // Drive manually so the instantaneous remote assignment can be checked
    // after every pull.
    let workers = ["w1", "w2", "w3"];
    let mut pending: HashMap<String, PacketReport> = HashMap::new();
    let mut current_host: HashMap<String, Option<String>> = HashMap::new();
    let mut alive: VecDeque<&str> = workers.iter().copied().collect();
    let mut delivered = Vec::new();
    while let Some(w) = alive.pop_front() {
        let report = pending.remove(w);
        match pkt.next_packet(w, report.as_ref()).expect("next_packet") {
            Some(p) => {
                pending.insert(
                    w.to_string(),
                    PacketReport {
                        latency: 0.001,
                        proc_time: p.num as f64 / 100.0,
                        proc_cpu: 0.0,
                        bytes_read: None,
                        total_entries: None,
                        processed_total: None,
                    },
                );
                current_host.insert(w.to_string(), Some(p.file_url.clone()));
                let remote_now = current_host
                    .values()
                    .flatten()
                    .filter(|u| u.starts_with("nfs://h2/"))
                    .count();
                assert!(remote_now <= 2, "more than 2 workers pulled from h2");
                delivered.push((w.to_string(), p));
                alive.push_back(w);
            }
            None => {
                current_host.insert(w.to_string(), None);
            }
        }
    }
    assert_eq!(pkt.processed(), 1200);
    assert_disjoint_cover(&delivered, &pkt);

    drop(session);
    for h in handles {
        h.join().expect("worker thread");
    }
}

#[test]
fn global_range_clips_elements() {
    let files = [
        ("nfs://h1/a.dat", 100_i64),
        ("nfs://h1/b.dat", 200),
        ("nfs://h1/c.dat", 400),
    ];
    let entries: HashMap<String, i64> =
        files.iter().map(|(u, n)| (u.to_string(), *n)).collect();
    let (session, handles) = pool(&[("w1", "h1", 1)], &entries);
    let ds = dataset(&files.map(|(u, _)| (u, -1_i64)));
    let pkt = Packetizer::new(
        &ds,
        &session,
        150,
        300,
        config(2),
        &IdentityResolver,
        None,
    )
    .expect("build packetizer");

    assert_eq!(pkt.total_entries(), 300);
    let elems = pkt.elements();
    assert_eq!(elems.len(), 2);
    assert_eq!(elems[0].file_url, "nfs://h1/b.dat");
    assert_eq!((elems[0].first, elems[0].num), (50, 150));
    assert_eq!(elems[1].file_url, "nfs://h1/c.dat");
    assert_eq!((elems[1].first, elems[1].num), (0, 150));

    drop(session);
    for h in handles {
        h.join().expect("worker thread");
    }
}

#[test]
fn uncountable_file_is_dropped_and_query_continues() {
    let entries = HashMap::from([
        ("nfs://h1/good.dat".to_string(), 100_i64),
        ("nfs://h1/bad.dat".to_string(), 0),
    ]);
    let (session, handles) = pool(&[("w1", "h1", 1)], &entries);
    let ds = dataset(&[("nfs://h1/good.dat", -1), ("nfs://h1/bad.dat", -1)]);
    let (reporter, progress_rx) = ProgressReporter::channel(2);
    let mut pkt = Packetizer::new(
        &ds,
        &session,
        0,
        -1,
        config(2),
        &IdentityResolver,
        Some(reporter),
    )
    .expect("build packetizer");

    assert!(pkt.is_valid());
    assert_eq!(pkt.total_entries(), 100);
    assert_eq!(pkt.elements().len(), 1);
    let delivered = drain(&mut pkt, &["w1"], 100.0);
    assert_eq!(pkt.processed(), 100);
    assert_disjoint_cover(&delivered, &pkt);

    drop(pkt);
    let reports: Vec<_> = progress_rx.iter().collect();
    assert!(!reports.is_empty());
    let last = reports.last().expect("final report");
    assert_eq!((last.processed, last.total, last.ok), (100, 100, true));

    drop(session);
    for h in handles {
        h.join().expect("worker thread");
    }
}

#[test]
fn fatal_reply_during_validation_invalidates_query() {
    let mut session = WorkerSession::new();
    let (link, endpoint) = WorkerLink::pair();
    session.register(
        WorkerInfo {
            id: "w1".to_string(),
            host: "h1".to_string(),
            perf_idx: 1,
        },
        link,
    );
    let handle = thread::spawn(move || {
        for _req in endpoint.requests.iter() {
            let _ = endpoint.replies.send(WorkerReply::Fatal {
                reason: "cannot open file".to_string(),
            });
        }
    });

    let ds = dataset(&[("nfs://h1/f0.dat", -1)]);
    let err = Packetizer::new(&ds, &session, 0, -1, config(2), &IdentityResolver, None)
        .expect_err("query must be invalid");
    assert!(matches!(err, PfwError::WorkerLost(_)));

    drop(session);
    handle.join().expect("worker thread");
}

#[test]
fn lost_channel_during_validation_invalidates_query() {
    let mut session = WorkerSession::new();
    let (link, endpoint) = WorkerLink::pair();
    session.register(
        WorkerInfo {
            id: "w1".to_string(),
            host: "h1".to_string(),
            perf_idx: 1,
        },
        link,
    );
    // The worker dies without replying.
    drop(endpoint);

    let ds = dataset(&[("nfs://h1/f0.dat", -1)]);
    let err = Packetizer::new(&ds, &session, 0, -1, config(2), &IdentityResolver, None)
        .expect_err("query must be invalid");
    assert!(matches!(err, PfwError::WorkerLost(_)));
}

#[test]
fn stop_flag_cuts_off_new_packets_only() {
    let entries = HashMap::from([("nfs://h1/f0.dat".to_string(), 1_000_i64)]);
    let (session, handles) = pool(&[("w1", "h1", 1)], &entries);
    let ds = dataset(&[("nfs://h1/f0.dat", -1)]);
    let mut pkt = Packetizer::new(
        &ds,
        &session,
        0,
        -1,
        config(2),
        &IdentityResolver,
        None,
    )
    .expect("build packetizer");

    let first = pkt
        .next_packet("w1", None)
        .expect("next_packet")
        .expect("first packet");
    pkt.stop();
    let report = PacketReport {
        latency: 0.001,
        proc_time: first.num as f64 / 100.0,
        proc_cpu: 0.0,
        bytes_read: None,
        total_entries: None,
        processed_total: None,
    };
    // The in-flight packet is still accounted; no new packet is produced.
    assert!(pkt
        .next_packet("w1", Some(&report))
        .expect("next_packet")
        .is_none());
    assert_eq!(pkt.processed(), first.num);

    drop(session);
    for h in handles {
        h.join().expect("worker thread");
    }
}

#[test]
fn worker_loss_during_query_invalidates_it() {
    let entries = HashMap::from([("nfs://h1/f0.dat".to_string(), 500_i64)]);
    let (session, handles) = pool(&[("w1", "h1", 1), ("w2", "h1", 1)], &entries);
    let ds = dataset(&[("nfs://h1/f0.dat", -1)]);
    let mut pkt = Packetizer::new(
        &ds,
        &session,
        0,
        -1,
        config(2),
        &IdentityResolver,
        None,
    )
    .expect("build packetizer");

    assert!(pkt
        .next_packet("w1", None)
        .expect("next_packet")
        .is_some());
    pkt.mark_worker_bad("w1");
    assert!(!pkt.is_valid());
    assert!(pkt.next_packet("w2", None).expect("next_packet").is_none());

    drop(session);
    for h in handles {
        h.join().expect("worker thread");
    }
}

#[test]
fn entry_list_elements_carve_list_slices() {
    let entries = HashMap::from([("nfs://h1/f0.dat".to_string(), 1_000_i64)]);
    let (session, handles) = pool(&[("w1", "h1", 1)], &entries);
    let mut ds = dataset(&[("nfs://h1/f0.dat", -1)]);
    ds.elements_mut()[0].entry_list = Some(pfw_dataset::EntryList::Entries {
        entries: (0..40).map(|i| i * 25).collect(),
    });
    let mut pkt = Packetizer::new(
        &ds,
        &session,
        0,
        -1,
        config(2),
        &IdentityResolver,
        None,
    )
    .expect("build packetizer");

    // The element contributes its list size, not the file total.
    assert_eq!(pkt.total_entries(), 40);
    let delivered = drain(&mut pkt, &["w1"], 100.0);
    assert_disjoint_cover(&delivered, &pkt);
    let carved: i64 = delivered
        .iter()
        .map(|(_, p)| p.entry_list.as_ref().expect("list slice").count())
        .sum();
    assert_eq!(carved, 40);

    drop(session);
    for h in handles {
        h.join().expect("worker thread");
    }
}

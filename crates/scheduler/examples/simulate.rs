//! Drive the packetizer against an in-process worker pool.
//!
//! Two hosts hold the data; three workers of different speeds pull packets
//! until the query drains. Knobs:
//! - `PFW_SIM_FILES` files per host (default 4)
//! - `PFW_SIM_ENTRIES` entries per file (default 10_000)

use std::collections::{HashMap, VecDeque};
use std::thread;

use pfw_common::{PacketizerConfig, Result};
use pfw_dataset::{Dataset, DatasetElement, IdentityResolver};
use pfw_scheduler::{
    PacketReport, Packetizer, ProgressReporter, WorkerInfo, WorkerLink, WorkerReply,
    WorkerSession,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let files_per_host = std::env::var("PFW_SIM_FILES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(4);
    let entries_per_file = std::env::var("PFW_SIM_ENTRIES")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(10_000);

    let mut ds = Dataset::new("simulated", "events", "/", true);
    let mut entry_counts = HashMap::new();
    for host in ["h1.example.org", "h2.example.org"] {
        for i in 0..files_per_host {
            let url = format!("nfs://{host}/data/run{i}.dat");
            entry_counts.insert(url.clone(), entries_per_file);
            ds.add(DatasetElement::new(&url, "events", "/", 0, -1));
        }
    }

    // Heterogeneous pool: two workers co-resident with h1, one with h2.
    let specs = [
        ("w1", "h1.example.org", 4, 20_000.0_f64),
        ("w2", "h1.example.org", 2, 10_000.0),
        ("w3", "h2.example.org", 4, 20_000.0),
    ];
    let mut session = WorkerSession::new();
    let mut handles = Vec::new();
    for (id, host, perf_idx, _) in &specs {
        let (link, endpoint) = WorkerLink::pair();
        session.register(
            WorkerInfo {
                id: id.to_string(),
                host: host.to_string(),
                perf_idx: *perf_idx,
            },
            link,
        );
        let counts = entry_counts.clone();
        handles.push(thread::spawn(move || {
            for req in endpoint.requests.iter() {
                let entries = counts.get(&req.file_url).copied().unwrap_or(0);
                let _ = endpoint.replies.send(WorkerReply::Entries {
                    entries,
                    resolved_object_name: None,
                });
            }
        }));
    }

    let (reporter, progress_rx) = ProgressReporter::channel(2);
    let mut pkt = Packetizer::new(
        &ds,
        &session,
        0,
        -1,
        PacketizerConfig::default(),
        &IdentityResolver,
        Some(reporter),
    )?;
    println!(
        "query: {} entries in {} files",
        pkt.total_entries(),
        pkt.elements().len()
    );

    let mut pending: HashMap<String, PacketReport> = HashMap::new();
    let mut packets_by_worker: HashMap<String, usize> = HashMap::new();
    let mut alive: VecDeque<&str> = specs.iter().map(|(id, ..)| *id).collect();
    while let Some(w) = alive.pop_front() {
        let report = pending.remove(w);
        match pkt.next_packet(w, report.as_ref())? {
            Some(packet) => {
                let speed = specs
                    .iter()
                    .find(|(id, ..)| *id == w)
                    .map(|(.., s)| *s)
                    .unwrap_or(10_000.0);
                pending.insert(
                    w.to_string(),
                    PacketReport {
                        latency: 0.002,
                        proc_time: packet.num as f64 / speed,
                        proc_cpu: packet.num as f64 / (speed * 1.3),
                        bytes_read: Some(packet.num * 64),
                        total_entries: None,
                        processed_total: None,
                    },
                );
                *packets_by_worker.entry(w.to_string()).or_default() += 1;
                alive.push_back(w);
            }
            None => {}
        }
    }

    println!(
        "processed {}/{} entries, {} bytes read, {} packets",
        pkt.processed(),
        pkt.total_entries(),
        pkt.bytes_read(),
        pkt.packets().len()
    );
    for (id, ..) in &specs {
        println!(
            "  {id}: {} entries in {} packets",
            pkt.entries_processed(id),
            packets_by_worker.get(*id).copied().unwrap_or(0)
        );
    }
    drop(pkt);
    let reports: Vec<_> = progress_rx.iter().collect();
    println!("progress reports: {}", reports.len());

    drop(session);
    for h in handles {
        let _ = h.join();
    }
    Ok(())
}

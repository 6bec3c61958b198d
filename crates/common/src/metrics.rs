use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Process-wide metrics registry shared by scheduler and dataset layers.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    packets_emitted: CounterVec,
    entries_processed: CounterVec,
    bytes_read: CounterVec,
    packet_proc_seconds: HistogramVec,
    files_opened: CounterVec,
    files_closed: CounterVec,
    validation_failures: CounterVec,
    node_running_workers: GaugeVec,
}

impl MetricsRegistry {
    /// Create a registry with all packflow series registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record one accounted packet reply from a worker.
    pub fn record_packet(&self, worker_id: &str, entries: u64, bytes: u64, proc_secs: f64) {
        let labels = [worker_id];
        self.inner
            .packets_emitted
            .with_label_values(&labels)
            .inc();
        self.inner
            .entries_processed
            .with_label_values(&labels)
            .inc_by(entries as f64);
        self.inner
            .bytes_read
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner
            .packet_proc_seconds
            .with_label_values(&labels)
            .observe(proc_secs.max(0.0));
    }

    /// Record a file open/close event on a host.
    pub fn record_file_event(&self, host: &str, local: bool, opened: bool) {
        let locality = if local { "local" } else { "remote" };
        let labels = [host, locality];
        if opened {
            self.inner.files_opened.with_label_values(&labels).inc();
        } else {
            self.inner.files_closed.with_label_values(&labels).inc();
        }
    }

    /// Record a per-element validation failure on a host.
    pub fn inc_validation_failures(&self, host: &str) {
        self.inner
            .validation_failures
            .with_label_values(&[host])
            .inc();
    }

    /// Set the number of workers currently consuming a host's data.
    pub fn set_node_running_workers(&self, host: &str, running: u64) {
        self.inner
            .node_running_workers
            .with_label_values(&[host])
            .set(running as f64);
    }

    /// Render all registered series in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        let packets_emitted = CounterVec::new(
            Opts::new("pfw_packets_emitted", "Packets accounted per worker"),
            &["worker"],
        )
        .expect("valid metric definition");
        let entries_processed = CounterVec::new(
            Opts::new("pfw_entries_processed", "Entries processed per worker"),
            &["worker"],
        )
        .expect("valid metric definition");
        let bytes_read = CounterVec::new(
            Opts::new("pfw_bytes_read", "Bytes read per worker"),
            &["worker"],
        )
        .expect("valid metric definition");
        let packet_proc_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pfw_packet_proc_seconds",
                "Per-packet processing time per worker",
            ),
            &["worker"],
        )
        .expect("valid metric definition");
        let files_opened = CounterVec::new(
            Opts::new("pfw_files_opened", "Files opened by host and locality"),
            &["host", "locality"],
        )
        .expect("valid metric definition");
        let files_closed = CounterVec::new(
            Opts::new("pfw_files_closed", "Files closed by host and locality"),
            &["host", "locality"],
        )
        .expect("valid metric definition");
        let validation_failures = CounterVec::new(
            Opts::new(
                "pfw_validation_failures",
                "Elements dropped during validation by host",
            ),
            &["host"],
        )
        .expect("valid metric definition");
        let node_running_workers = GaugeVec::new(
            Opts::new(
                "pfw_node_running_workers",
                "Workers currently consuming a host's data",
            ),
            &["host"],
        )
        .expect("valid metric definition");

        for c in [
            &packets_emitted,
            &entries_processed,
            &bytes_read,
            &files_opened,
            &files_closed,
            &validation_failures,
        ] {
            registry
                .register(Box::new(c.clone()))
                .expect("register metric");
        }
        registry
            .register(Box::new(packet_proc_seconds.clone()))
            .expect("register metric");
        registry
            .register(Box::new(node_running_workers.clone()))
            .expect("register metric");

        Self {
            registry,
            packets_emitted,
            entries_processed,
            bytes_read,
            packet_proc_seconds,
            files_opened,
            files_closed,
            validation_failures,
            node_running_workers,
        }
    }
}

/// Process-wide metrics registry accessor.
pub fn global_metrics() -> &'static MetricsRegistry {
    static GLOBAL: OnceLock<MetricsRegistry> = OnceLock::new();
    GLOBAL.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_series_after_use() {
        let m = MetricsRegistry::new();
        m.record_packet("w1", 128, 4096, 0.25);
        m.record_file_event("h1.example.org", true, true);
        m.set_node_running_workers("h1.example.org", 3);
        let text = m.render_prometheus();
        assert!(text.contains("pfw_packets_emitted"));
        assert!(text.contains("pfw_node_running_workers"));
    }
}

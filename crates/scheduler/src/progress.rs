//! Asynchronous progress reporting toward the client.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

/// One progress report toward the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStatus {
    /// Units accounted so far (validated files, then processed entries).
    pub processed: i64,
    /// Total units expected.
    pub total: i64,
    /// Whether the query is still healthy.
    pub ok: bool,
}

/// Throttled sender of [`DatasetStatus`] triples.
///
/// Reports are best-effort: a vanished receiver never fails the query.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: Sender<DatasetStatus>,
    step_percent: u32,
}

impl ProgressReporter {
    /// Create a reporter and the receiving end of its channel.
    pub fn channel(step_percent: u32) -> (ProgressReporter, Receiver<DatasetStatus>) {
        let (tx, rx) = unbounded();
        (
            ProgressReporter {
                tx,
                step_percent: step_percent.clamp(1, 100),
            },
            rx,
        )
    }

    /// Report one validated file, throttled to every ~`step_percent` of
    /// `total` files.
    pub fn file_validated(&self, validated: i64, total: i64, ok: bool) {
        let step = (total * self.step_percent as i64 / 100).max(1);
        if validated % step == 0 || validated == total {
            self.report(validated, total, ok);
        }
    }

    /// Send an unthrottled report.
    pub fn report(&self, processed: i64, total: i64, ok: bool) {
        let _ = self.tx.send(DatasetStatus {
            processed,
            total,
            ok,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_reports_are_throttled_to_step() {
        let (reporter, rx) = ProgressReporter::channel(2);
        for n in 1..=100 {
            reporter.file_validated(n, 100, true);
        }
        drop(reporter);
        let reports: Vec<_> = rx.iter().collect();
        assert_eq!(reports.len(), 50);
        assert_eq!(
            reports.last(),
            Some(&DatasetStatus {
                processed: 100,
                total: 100,
                ok: true
            })
        );
    }

    #[test]
    fn tiny_totals_still_report_every_file() {
        let (reporter, rx) = ProgressReporter::channel(2);
        for n in 1..=3 {
            reporter.file_validated(n, 3, true);
        }
        drop(reporter);
        assert_eq!(rx.iter().count(), 3);
    }
}

use std::time::{Duration, Instant};

use crate::media::MediaItem;

use super::upload_queue::ItemOutcome;

/// Receives progress events from the transport and the batch loop.
///
/// Every method has an empty default so implementors only pick what they render.
pub trait UploadObserver: Send + Sync {
    fn on_item_started(&self, _index: usize, _total: usize, _item: &MediaItem) {}

    /// A stored session was picked up at `offset` bytes.
    fn on_resumed(&self, _item: &MediaItem, _offset: u64, _total_size: u64) {}

    /// A stored session was thrown away and the upload starts over.
    fn on_restart(&self, _item: &MediaItem) {}

    fn on_chunk_confirmed(&self, _confirmed: u64, _total_size: u64) {}

    fn on_item_finished(&self, _index: usize, _item: &MediaItem, _outcome: &ItemOutcome) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl UploadObserver for NoopObserver {}

/// Running totals for a batch, used for the summary line and the ETA.
#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub total_items: usize,
    pub finished: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_bytes: u64,
    pub bytes_done: u64,
    started: Instant,
}

impl BatchProgress {
    pub fn new(total_items: usize, total_bytes: u64) -> Self {
        Self {
            total_items,
            finished: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            total_bytes,
            bytes_done: 0,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, outcome: &ItemOutcome, item_size: u64) {
        self.finished += 1;
        self.bytes_done += item_size;
        match outcome {
            ItemOutcome::Success { .. } => self.succeeded += 1,
            ItemOutcome::Failed { .. } => self.failed += 1,
            ItemOutcome::Skipped { .. } => self.skipped += 1,
        }

        log::info!(
            "Progress: {}/{} items ({} ok, {} failed, {} skipped)",
            self.finished,
            self.total_items,
            self.succeeded,
            self.failed,
            self.skipped
        );
    }

    pub fn percent(&self) -> f32 {
        if self.total_items == 0 {
            return 100.0;
        }
        self.finished as f32 / self.total_items as f32 * 100.0
    }

    /// Byte-rate based estimate of the remaining time. `None` until something finished.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.estimate_from(self.started.elapsed())
    }

    fn estimate_from(&self, elapsed: Duration) -> Option<Duration> {
        if self.bytes_done == 0 || elapsed.is_zero() {
            return None;
        }

        let rate = self.bytes_done as f64 / elapsed.as_secs_f64();
        let remaining = self.total_bytes.saturating_sub(self.bytes_done);
        let seconds = remaining as f64 / rate;

        log::debug!(
            "ETA: {:.0}s (rate: {:.0} bytes/sec, remaining: {} bytes)",
            seconds,
            rate,
            remaining
        );
        Some(Duration::from_secs_f64(seconds))
    }
}

/// `1m 05s` style rendering for ETAs.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_outcome() {
        let mut progress = BatchProgress::new(3, 300);
        progress.record(
            &ItemOutcome::Success {
                video_id: "abc".into(),
                watch_url: "https://youtu.be/abc".into(),
            },
            100,
        );
        progress.record(
            &ItemOutcome::Failed {
                reason: "boom".into(),
            },
            100,
        );
        assert_eq!(progress.succeeded, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.finished, 2);
        assert!((progress.percent() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_eta_from_byte_rate() {
        let mut progress = BatchProgress::new(2, 1000);
        assert!(progress.estimate_from(Duration::from_secs(10)).is_none());

        progress.bytes_done = 250;
        let eta = progress.estimate_from(Duration::from_secs(10)).unwrap();
        assert_eq!(eta.as_secs(), 30);
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(Duration::from_secs(42)), "42s");
        assert_eq!(format_eta(Duration::from_secs(65)), "1m 05s");
        assert_eq!(format_eta(Duration::from_secs(3720)), "1h 02m");
    }
}

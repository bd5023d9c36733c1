//! Receiver delivery statistics.
//!
//! The confirmer and listener bump [`Counters`]; the recorder task snapshots
//! them into a [`StatsLog`] every interval; the log is exported as a CSV
//! report once the receiver has terminated.
//!
//! ```text
//! Time Elapsed,Packets Received,Packets Sent,Correct Packets,Correct Rate
//! 00:10,12,12,11,91.67%
//! 00:20,0,0,0,N/A
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::shutdown::StopListener;

/// Running packet counters, shared between the worker tasks.
#[derive(Debug, Default)]
pub struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    correct: AtomicU64,
}

impl Counters {
    pub fn packet_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_correct(&self) {
        self.correct.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn correct(&self) -> u64 {
        self.correct.load(Ordering::Relaxed)
    }
}

/// One periodic snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRecord {
    /// Elapsed time since the recorder started, as `MM:SS`.
    pub elapsed: String,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub correct_packets: u64,
}

impl StatRecord {
    pub fn snapshot(elapsed: Duration, counters: &Counters) -> Self {
        Self {
            elapsed: format_elapsed(elapsed),
            packets_sent: counters.sent(),
            packets_received: counters.received(),
            correct_packets: counters.correct(),
        }
    }

    /// `correct / received` as a percentage with two decimals, or `N/A`
    /// when nothing was received.
    pub fn correct_rate(&self) -> String {
        if self.packets_received == 0 {
            return "N/A".to_string();
        }
        let rate = self.correct_packets as f64 / self.packets_received as f64 * 100.0;
        format!("{rate:.2}%")
    }
}

/// `MM:SS`, minutes wrapping at the hour.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", (secs / 60) % 60, secs % 60)
}

/// Append-only snapshot sequence.  One writer (the recorder), one reader
/// (the exporter, after the recorder has stopped).
#[derive(Debug, Clone, Default)]
pub struct StatsLog(Arc<Mutex<Vec<StatRecord>>>);

impl StatsLog {
    pub fn push(&self, record: StatRecord) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    pub fn records(&self) -> Vec<StatRecord> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Write the report to `path`, replacing any existing file.
    pub fn export(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        write_report(&self.records(), &mut out)?;
        out.flush()
    }
}

/// Render `records` as CSV with a header row.
pub fn write_report<W: Write>(records: &[StatRecord], out: &mut W) -> io::Result<()> {
    writeln!(
        out,
        "Time Elapsed,Packets Received,Packets Sent,Correct Packets,Correct Rate"
    )?;
    for r in records {
        writeln!(
            out,
            "{},{},{},{},{}",
            r.elapsed,
            r.packets_received,
            r.packets_sent,
            r.correct_packets,
            r.correct_rate()
        )?;
    }
    Ok(())
}

/// Snapshot `counters` into `log` every `interval` until `shutdown` closes.
pub async fn record_statistics(
    counters: Arc<Counters>,
    log: StatsLog,
    interval: Duration,
    mut shutdown: StopListener,
) {
    let start = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval_at(start + interval, interval);
    loop {
        tokio::select! {
            _ = shutdown.stopped() => return,
            _ = ticker.tick() => {
                let record = StatRecord::snapshot(start.elapsed(), &counters);
                log::debug!(
                    "[stats] {} received={} sent={} correct={}",
                    record.elapsed,
                    record.packets_received,
                    record.packets_sent,
                    record.correct_packets
                );
                log.push(record);
            }
        }
    }
}

//! Inbound sequence bookkeeping.
//!
//! Classifies each received sequence number as in-order, gap, duplicate or
//! reordered, and keeps per-turn loss statistics. Nothing here ever drops or
//! reorders packets; the tracker only observes.

use std::time::Instant;

use log::{debug, warn};

/// Default number of packets between progress log lines.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 128;

/// A forward jump of more than one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub expected: u32,
    pub received: u32,
    pub gap_size: u32,
}

/// Classification of a single tracked sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    InOrder,
    /// `missing` packets were skipped. A single skipped packet is counted
    /// but not recorded in the gap log.
    Gap { missing: u32 },
    Duplicate,
    OutOfOrder,
}

/// Raw counters for one turn.
#[derive(Debug, Clone)]
pub struct SequenceStats {
    pub expected_sequence: u32,
    pub last_received_sequence: u32,
    pub total_received: u64,
    pub missing_count: u64,
    pub duplicate_count: u64,
    pub out_of_order_count: u64,
    pub gap_log: Vec<SequenceGap>,
    pub last_arrival: Option<Instant>,
}

impl Default for SequenceStats {
    fn default() -> Self {
        Self {
            // The server numbers its first packet 1.
            expected_sequence: 1,
            last_received_sequence: 0,
            total_received: 0,
            missing_count: 0,
            duplicate_count: 0,
            out_of_order_count: 0,
            gap_log: Vec::new(),
            last_arrival: None,
        }
    }
}

/// Condensed view for end-of-turn logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceSummary {
    pub total: u64,
    pub missing: u64,
    pub duplicate: u64,
    pub out_of_order: u64,
    /// `missing / last_received`, 0 when nothing arrived.
    pub loss_rate: f64,
}

impl std::fmt::Display for SequenceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "received={} missing={} duplicate={} out_of_order={} loss={:.2}%",
            self.total,
            self.missing,
            self.duplicate,
            self.out_of_order,
            self.loss_rate * 100.0
        )
    }
}

/// Per-direction sequence tracker.
#[derive(Debug)]
pub struct SequenceTracker {
    stats: SequenceStats,
    progress_interval: u64,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::with_progress_interval(DEFAULT_PROGRESS_INTERVAL)
    }

    /// Create a tracker that logs progress every `interval` packets (0 disables).
    pub fn with_progress_interval(interval: u64) -> Self {
        Self {
            stats: SequenceStats::default(),
            progress_interval: interval,
        }
    }

    /// Record one received sequence number.
    pub fn track(&mut self, seq: u32) -> SequenceEvent {
        let stats = &mut self.stats;
        stats.total_received += 1;
        stats.last_arrival = Some(Instant::now());

        let event = if seq == stats.expected_sequence {
            stats.expected_sequence = seq.wrapping_add(1);
            stats.last_received_sequence = seq;
            SequenceEvent::InOrder
        } else if seq > stats.expected_sequence {
            let missing = seq - stats.expected_sequence;
            stats.missing_count += u64::from(missing);
            if missing > 1 {
                warn!(
                    target: "Media/Sequence",
                    "Sequence gap: expected {}, got {} ({} missing)",
                    stats.expected_sequence, seq, missing
                );
                stats.gap_log.push(SequenceGap {
                    expected: stats.expected_sequence,
                    received: seq,
                    gap_size: missing,
                });
            }
            stats.expected_sequence = seq.wrapping_add(1);
            stats.last_received_sequence = seq;
            SequenceEvent::Gap { missing }
        } else if seq <= stats.last_received_sequence {
            stats.duplicate_count += 1;
            debug!(target: "Media/Sequence", "Duplicate sequence {seq}");
            SequenceEvent::Duplicate
        } else {
            stats.out_of_order_count += 1;
            debug!(target: "Media/Sequence", "Out-of-order sequence {seq}");
            SequenceEvent::OutOfOrder
        };

        if self.progress_interval > 0 && self.stats.total_received % self.progress_interval == 0 {
            debug!(target: "Media/Sequence", "Progress: {}", self.summary());
        }

        event
    }

    /// Zero every counter and the gap log.
    pub fn reset(&mut self) {
        self.stats = SequenceStats::default();
    }

    pub fn stats(&self) -> &SequenceStats {
        &self.stats
    }

    pub fn gaps(&self) -> &[SequenceGap] {
        &self.stats.gap_log
    }

    pub fn last_arrival(&self) -> Option<Instant> {
        self.stats.last_arrival
    }

    pub fn summary(&self) -> SequenceSummary {
        let stats = &self.stats;
        let loss_rate = if stats.last_received_sequence == 0 {
            0.0
        } else {
            stats.missing_count as f64 / f64::from(stats.last_received_sequence)
        };

        SequenceSummary {
            total: stats.total_received,
            missing: stats.missing_count,
            duplicate: stats.duplicate_count,
            out_of_order: stats.out_of_order_count,
            loss_rate,
        }
    }
}

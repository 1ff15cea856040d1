//! Aggregation of connection outcomes between report flushes.

use std::collections::HashMap;
use std::fmt;

/// How a retried connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Outcome {
    /// Any bytes were downloaded.
    pub success: bool,
    /// The retry was triggered by the hello timeout rather than a close.
    pub timeout: bool,
}

impl Outcome {
    pub fn new(success: bool, timeout: bool) -> Self {
        Self { success, timeout }
    }

    pub fn result_label(&self) -> &'static str {
        if self.success {
            "success"
        } else {
            "failed"
        }
    }

    pub fn cause_label(&self) -> &'static str {
        if self.timeout {
            "timeout"
        } else {
            "closed"
        }
    }

    fn index(&self) -> usize {
        (self.success as usize) << 1 | self.timeout as usize
    }

    fn from_index(i: usize) -> Self {
        Self { success: i & 2 != 0, timeout: i & 1 != 0 }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.result_label(), self.cause_label())
    }
}

/// Event counts per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    counts: [u64; 4],
}

impl Counters {
    pub fn record(&mut self, outcome: Outcome) {
        self.counts[outcome.index()] += 1;
    }

    pub fn get(&self, outcome: Outcome) -> u64 {
        self.counts[outcome.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// The most frequent outcome. Ties go to failures, then timeouts.
    pub fn dominant(&self) -> Outcome {
        // failed.timeout, failed.closed, success.timeout, success.closed
        const PRIORITY: [usize; 4] = [1, 0, 3, 2];
        let mut best = PRIORITY[0];
        for i in PRIORITY {
            if self.counts[i] > self.counts[best] {
                best = i;
            }
        }
        Outcome::from_index(best)
    }
}

/// Outcome counters keyed by SNI.
#[derive(Debug, Default)]
pub struct ReportBatch {
    entries: HashMap<String, Counters>,
}

impl ReportBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sni: &str, outcome: Outcome) {
        self.entries.entry(sni.to_string()).or_default().record(outcome);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes the entry with the most events and returns its SNI with the
    /// dominant outcome. Other entries wait for later flushes.
    pub fn take_next(&mut self) -> Option<(String, Outcome, Counters)> {
        let sni = self
            .entries
            .iter()
            .max_by(|(a_sni, a), (b_sni, b)| a.total().cmp(&b.total()).then(b_sni.cmp(a_sni)))
            .map(|(sni, _)| sni.clone())?;
        let counters = self.entries.remove(&sni)?;
        Some((sni, counters.dominant(), counters))
    }
}

//! Publisher-confirm bookkeeping.
//!
//! A record exists for a sequence number exactly while a publish with that
//! number is on the wire and unconfirmed. Only the reactor touches it.

use super::task::Task;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct DeliveryRecord {
    task: Task,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
pub struct DeliveryTracker {
    records: BTreeMap<u64, DeliveryRecord>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sequence: u64, task: Task, now: Instant) {
        self.records.insert(
            sequence,
            DeliveryRecord {
                task,
                enqueued_at: now,
            },
        );
    }

    /// Settle a positive confirmation. Returns how many records it removed.
    pub fn confirm(&mut self, sequence: u64, multiple: bool) -> usize {
        self.settle(sequence, multiple).len()
    }

    /// Settle a negative confirmation, handing back the tasks to republish.
    pub fn reject(&mut self, sequence: u64, multiple: bool) -> Vec<Task> {
        self.settle(sequence, multiple)
    }

    fn settle(&mut self, sequence: u64, multiple: bool) -> Vec<Task> {
        if multiple {
            let rest = self.records.split_off(&sequence.saturating_add(1));
            let settled = std::mem::replace(&mut self.records, rest);
            settled.into_values().map(|r| r.task).collect()
        } else {
            self.records
                .remove(&sequence)
                .map(|r| vec![r.task])
                .unwrap_or_default()
        }
    }

    /// Remove every record older than `timeout`, oldest sequence first.
    pub fn expired(&mut self, now: Instant, timeout: Duration) -> Vec<Task> {
        let stale: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.enqueued_at) > timeout)
            .map(|(seq, _)| *seq)
            .collect();
        stale
            .into_iter()
            .filter_map(|seq| self.records.remove(&seq))
            .map(|r| r.task)
            .collect()
    }

    /// Remove everything; used when the publish channel's sequence restarts.
    pub fn drain(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.records)
            .into_values()
            .map(|r| r.task)
            .collect()
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.records.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

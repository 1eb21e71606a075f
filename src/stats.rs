//! Counter snapshots exposed by long-running components.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time copy of a component's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot(BTreeMap<String, u64>);

impl StatsSnapshot {
    /// Counter value; absent counters read as zero.
    pub fn get(&self, name: &str) -> u64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn add(&mut self, name: &str, n: u64) {
        *self.0.entry(name.to_string()).or_insert(0) += n;
    }

    pub fn merge(&mut self, other: &StatsSnapshot) {
        for (name, n) in &other.0 {
            self.add(name, *n);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Thread-safe named counters with an optional clear-on-read.
#[derive(Debug, Default)]
pub struct Counters {
    values: Mutex<StatsSnapshot>,
}

impl Counters {
    /// Counters pre-populated with zeroes so snapshots always list them.
    pub fn with_names(names: &[&str]) -> Self {
        let mut snapshot = StatsSnapshot::default();
        for name in names {
            snapshot.add(name, 0);
        }
        Self { values: Mutex::new(snapshot) }
    }

    pub fn add(&self, name: &str, n: u64) {
        self.values.lock().add(name, n);
    }

    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.values.lock().get(name)
    }

    pub fn merge(&self, other: &StatsSnapshot) {
        self.values.lock().merge(other);
    }

    /// Copy of every counter; `clear` zeroes them in the same critical section.
    pub fn snapshot(&self, clear: bool) -> StatsSnapshot {
        let mut values = self.values.lock();
        let snapshot = values.clone();
        if clear {
            for v in values.0.values_mut() {
                *v = 0;
            }
        }
        snapshot
    }
}

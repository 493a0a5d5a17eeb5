//! Dispatch statistics
//!
//! Counts section results per virtual server and request outcomes per
//! image. Snapshots serialize to JSON for debug output.

use crate::error::DispatchError;
use aaa_proto::RCode;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct SectionCounters {
    results: [AtomicU64; RCode::COUNT],
}

impl SectionCounters {
    fn snapshot(&self) -> BTreeMap<String, u64> {
        RCode::ALL
            .into_iter()
            .filter_map(|code| {
                let count = self.results[code.index()].load(Ordering::Relaxed);
                (count > 0).then(|| (code.as_str().to_string(), count))
            })
            .collect()
    }
}

/// Counters for one server image
#[derive(Debug, Default)]
pub struct DispatchStats {
    sections: DashMap<(String, String), SectionCounters>,
    requests: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one completed section
    pub fn record(&self, server: &str, section: &str, rcode: RCode) {
        let key = (server.to_string(), section.to_string());
        self.sections.entry(key).or_default().results[rcode.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Count one request handed to a protocol
    pub fn record_request(&self, outcome: &Result<RCode, DispatchError>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(_) => {}
            Err(DispatchError::Timeout(_)) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// How often a section produced a result
    pub fn count(&self, server: &str, section: &str, rcode: RCode) -> u64 {
        self.sections
            .get(&(server.to_string(), section.to_string()))
            .map(|counters| counters.results[rcode.index()].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut sections: Vec<SectionStatSnapshot> = self
            .sections
            .iter()
            .map(|entry| {
                let (server, section) = entry.key();
                let results = entry.value().snapshot();
                SectionStatSnapshot {
                    server: server.clone(),
                    section: section.clone(),
                    total: results.values().sum(),
                    results,
                }
            })
            .collect();
        sections.sort_by(|a, b| (&a.server, &a.section).cmp(&(&b.server, &b.section)));

        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            sections,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub sections: Vec<SectionStatSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionStatSnapshot {
    pub server: String,
    pub section: String,
    pub total: u64,
    /// Result keyword → count, zero counts omitted
    pub results: BTreeMap<String, u64>,
}

impl StatsSnapshot {
    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

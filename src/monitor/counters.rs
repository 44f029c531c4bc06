/// Per-category event counters.
///
/// Owned by the sampler while the monitor runs and handed back whole on stop.
use crate::monitor::classifier::EventMatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// One retained matching line
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    pub line: String,
    pub detail: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryStats {
    pub count: u64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub critical: bool,
    /// Occurrences attributed to the injected fault device; never critical
    #[serde(default)]
    pub expected: u64,
    /// Most recent matching lines, oldest first
    pub details: VecDeque<EventRecord>,
    /// Lines evicted from `details` by the retention bound
    pub dropped_details: u64,
}

impl CategoryStats {
    fn record(&mut self, at: DateTime<Utc>, line: &str, m: &EventMatch<'_>, limit: Option<usize>) {
        self.count += 1;
        self.first_seen.get_or_insert(at);
        self.last_seen = Some(at);
        self.critical |= m.critical;

        if limit == Some(0) {
            self.dropped_details += 1;
            return;
        }
        self.details.push_back(EventRecord {
            at,
            line: line.to_string(),
            detail: m.detail.clone(),
        });
        if let Some(limit) = limit {
            while self.details.len() > limit {
                self.details.pop_front();
                self.dropped_details += 1;
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventCounters {
    categories: BTreeMap<String, CategoryStats>,
    lines_seen: u64,
}

impl EventCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create zeroed entries so every category shows up in reports
    pub fn with_categories<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut counters = Self::new();
        for label in labels {
            counters
                .categories
                .insert(label.to_string(), CategoryStats::default());
        }
        counters
    }

    pub fn note_line(&mut self) {
        self.lines_seen += 1;
    }

    /// Count one matched line against its category
    pub fn record(
        &mut self,
        at: DateTime<Utc>,
        line: &str,
        event: &EventMatch<'_>,
        detail_limit: Option<usize>,
    ) {
        self.categories
            .entry(event.label.to_string())
            .or_default()
            .record(at, line, event, detail_limit);
    }

    /// Count a critical-class line that the run provoked on purpose.
    /// It is retained like any other but does not make the category critical.
    pub fn record_expected(
        &mut self,
        at: DateTime<Utc>,
        line: &str,
        event: &EventMatch<'_>,
        detail_limit: Option<usize>,
    ) {
        let downgraded = EventMatch {
            label: event.label,
            detail: event.detail.clone(),
            critical: false,
        };
        let stats = self.categories.entry(event.label.to_string()).or_default();
        stats.record(at, line, &downgraded, detail_limit);
        stats.expected += 1;
    }

    pub fn count(&self, label: &str) -> u64 {
        self.categories.get(label).map(|s| s.count).unwrap_or(0)
    }

    pub fn get(&self, label: &str) -> Option<&CategoryStats> {
        self.categories.get(label)
    }

    pub fn last_seen(&self, label: &str) -> Option<DateTime<Utc>> {
        self.categories.get(label).and_then(|s| s.last_seen)
    }

    pub fn details(&self, label: &str) -> Vec<&str> {
        self.categories
            .get(label)
            .map(|s| s.details.iter().map(|r| r.line.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn lines_seen(&self) -> u64 {
        self.lines_seen
    }

    pub fn total_events(&self) -> u64 {
        self.categories.values().map(|s| s.count).sum()
    }

    pub fn expected_events(&self) -> u64 {
        self.categories.values().map(|s| s.expected).sum()
    }

    /// category -> count, including zero entries
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.categories
            .iter()
            .map(|(label, stats)| (label.clone(), stats.count))
            .collect()
    }

    /// Categories with at least one critical occurrence
    pub fn critical_categories(&self) -> Vec<&str> {
        self.categories
            .iter()
            .filter(|(_, s)| s.critical && s.count > 0)
            .map(|(label, _)| label.as_str())
            .collect()
    }
}

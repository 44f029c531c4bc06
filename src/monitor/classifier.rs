//! Kernel log line classification.
//!
//! Rules are evaluated top to bottom and every matching rule is reported.
//! Categories are not mutually exclusive: a hung-task report is both a
//! `hung_task` and a `blocking` event.

use crate::config::types::{Result, StressError};
use regex::Regex;
use std::collections::BTreeSet;

#[derive(Clone, Debug)]
pub enum Matcher {
    /// Case-sensitive substring search
    Substring(String),
    Pattern(Regex),
}

impl Matcher {
    pub fn is_match(&self, line: &str) -> bool {
        match self {
            Matcher::Substring(needle) => line.contains(needle.as_str()),
            Matcher::Pattern(re) => re.is_match(line),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventRule {
    pub label: String,
    pub matcher: Matcher,
    /// First capture group (or whole match) becomes the event detail
    pub detail: Option<Regex>,
    /// Per-category bound on retained lines; `None` means unbounded
    pub detail_limit: Option<usize>,
    /// Any occurrence fails the run verdict
    pub critical: bool,
}

impl EventRule {
    pub fn substring(label: &str, needle: &str) -> Self {
        Self {
            label: label.to_string(),
            matcher: Matcher::Substring(needle.to_string()),
            detail: None,
            detail_limit: None,
            critical: false,
        }
    }

    pub fn pattern(label: &str, pattern: &str) -> Result<Self> {
        Ok(Self {
            label: label.to_string(),
            matcher: Matcher::Pattern(compile(label, pattern)?),
            detail: None,
            detail_limit: None,
            critical: false,
        })
    }

    pub fn with_detail(mut self, pattern: &str) -> Result<Self> {
        self.detail = Some(compile(&self.label, pattern)?);
        Ok(self)
    }

    pub fn with_detail_limit(mut self, limit: Option<usize>) -> Self {
        self.detail_limit = limit;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    fn extract(&self, line: &str) -> Option<String> {
        let caps = self.detail.as_ref()?.captures(line)?;
        caps.get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().to_string())
    }
}

fn compile(label: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| StressError::Config(format!("rule {}: bad pattern: {}", label, e)))
}

/// One rule that matched a line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventMatch<'r> {
    pub label: &'r str,
    pub detail: Option<String>,
    pub critical: bool,
}

/// Every rule matching `line`, in rule order, each label at most once
pub fn classify<'r>(line: &str, rules: &'r [EventRule]) -> Vec<EventMatch<'r>> {
    let mut matches: Vec<EventMatch<'r>> = Vec::new();
    for rule in rules {
        if !rule.matcher.is_match(line) || matches.iter().any(|m| m.label == rule.label) {
            continue;
        }
        matches.push(EventMatch {
            label: &rule.label,
            detail: rule.extract(line),
            critical: rule.critical,
        });
    }
    matches
}

/// Ordered rule list with unique labels
#[derive(Clone, Debug)]
pub struct RuleSet {
    rules: Vec<EventRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<EventRule>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for rule in &rules {
            if rule.label.is_empty() {
                return Err(StressError::Config("rule with empty label".to_string()));
            }
            if !seen.insert(rule.label.as_str()) {
                return Err(StressError::Config(format!(
                    "duplicate rule label: {}",
                    rule.label
                )));
            }
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[EventRule] {
        &self.rules
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.label.as_str())
    }

    pub fn get(&self, label: &str) -> Option<&EventRule> {
        self.rules.iter().find(|r| r.label == label)
    }

    pub fn classify<'r>(&'r self, line: &str) -> Vec<EventMatch<'r>> {
        classify(line, &self.rules)
    }

    /// Apply one retention bound to every rule that has none of its own
    pub fn with_default_detail_limit(mut self, limit: Option<usize>) -> Self {
        for rule in &mut self.rules {
            if rule.detail_limit.is_none() {
                rule.detail_limit = limit;
            }
        }
        self
    }
}

/// Signatures of storage and memory trouble in the kernel log
pub fn default_rules() -> Result<RuleSet> {
    RuleSet::new(vec![
        EventRule::pattern(
            "hung_task",
            r"INFO: task \S+:\d+ blocked for more than \d+ seconds",
        )?
        .with_detail(r"task (\S+:\d+) blocked")?
        .critical(),
        EventRule::pattern(
            "jbd2_wait",
            r"jbd2_log_wait_commit|jbd2_journal_commit_transaction|wait_transaction_locked",
        )?
        .with_detail(r"(jbd2_\w+|wait_transaction_locked)")?,
        EventRule::pattern(
            "lock_wait",
            r"rwsem_down_\w+_slowpath|__mutex_lock|__lock_page|folio_wait_bit|wait_on_page_bit",
        )?
        .with_detail(r"(rwsem_down_\w+|__mutex_lock\w*|__lock_page\w*|folio_wait_bit\w*|wait_on_page_bit\w*)")?,
        EventRule::substring("blocking", "blocked"),
        EventRule::pattern(
            "io_error",
            r"I/O error|Buffer I/O error|critical medium error|blk_update_request: I/O error",
        )?
        .with_detail(r"dev ([\w-]+)")?
        .critical(),
        EventRule::pattern(
            "fs_error",
            r"EXT4-fs error|EXT4-fs \(\S+\): .*(?:error|Remounting filesystem read-only)|XFS \(\S+\): .*(?:error|shutdown)|BTRFS (?:error|critical)|Aborting journal",
        )?
        .with_detail(r"\((\S+)\)")?
        .critical(),
        EventRule::pattern("oom", r"Out of memory|invoked oom-killer|oom-kill:")?
            .with_detail(r"Killed process (\d+ \(\S+\))")?
            .critical(),
        EventRule::substring("page_alloc_failure", "page allocation failure")
            .with_detail(r"(order:\d+)")?,
        EventRule::substring("soft_lockup", "soft lockup")
            .with_detail(r"(CPU#\d+)")?
            .critical(),
        EventRule::pattern("rcu_stall", r"rcu_\w+ (?:self-)?detected (?:expedited )?stalls?")?
            .critical(),
        EventRule::substring("call_trace", "Call Trace:"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels<'r>(matches: &[EventMatch<'r>]) -> Vec<&'r str> {
        matches.iter().map(|m| m.label).collect()
    }

    #[test]
    fn hung_task_is_also_blocking() {
        let rules = default_rules().unwrap();
        let line = "INFO: task kworker/u16:2:1234 blocked for more than 120 seconds.";
        let matches = rules.classify(line);
        assert_eq!(labels(&matches), vec!["hung_task", "blocking"]);
        assert_eq!(matches[0].detail.as_deref(), Some("kworker/u16:2:1234"));
        assert!(matches[0].critical);
        assert!(!matches[1].critical);
    }

    #[test]
    fn jbd2_wait_line_matches_two_categories() {
        let rules = default_rules().unwrap();
        let line = "task fsync-worker blocked in jbd2_log_wait_commit+0x9f/0x120";
        let matches = rules.classify(line);
        assert_eq!(labels(&matches), vec!["jbd2_wait", "blocking"]);
        assert_eq!(matches[0].detail.as_deref(), Some("jbd2_log_wait_commit"));
    }

    #[test]
    fn unrelated_line_matches_nothing() {
        let rules = default_rules().unwrap();
        assert!(rules.classify("EXT4-fs (dm-0): mounted filesystem").is_empty());
        assert!(rules.classify("").is_empty());
    }

    #[test]
    fn matching_is_case_sensitive() {
        let rules = RuleSet::new(vec![EventRule::substring("blocking", "blocked")]).unwrap();
        assert!(rules.classify("task BLOCKED").is_empty());
        assert_eq!(rules.classify("task blocked").len(), 1);
    }

    #[test]
    fn io_error_extracts_device() {
        let rules = default_rules().unwrap();
        let line = "blk_update_request: I/O error, dev dm-0, sector 4096 op 0x1:(WRITE)";
        let matches = rules.classify(line);
        assert_eq!(labels(&matches), vec!["io_error"]);
        assert_eq!(matches[0].detail.as_deref(), Some("dm-0"));
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let result = RuleSet::new(vec![
            EventRule::substring("oom", "Out of memory"),
            EventRule::substring("oom", "oom-kill"),
        ]);
        assert!(matches!(result, Err(StressError::Config(_))));
        assert!(EventRule::pattern("bad", "(unclosed").is_err());
    }

    #[test]
    fn same_label_in_raw_slice_reported_once() {
        let rules = vec![
            EventRule::substring("oom", "Out of memory"),
            EventRule::substring("oom", "memory"),
        ];
        assert_eq!(classify("Out of memory: Killed process", &rules).len(), 1);
    }

    #[test]
    fn default_detail_limit_fills_unset_rules() {
        let rules = RuleSet::new(vec![
            EventRule::substring("a", "a").with_detail_limit(Some(3)),
            EventRule::substring("b", "b"),
        ])
        .unwrap()
        .with_default_detail_limit(Some(10));
        assert_eq!(rules.get("a").unwrap().detail_limit, Some(3));
        assert_eq!(rules.get("b").unwrap().detail_limit, Some(10));
    }

    #[test]
    fn classifier_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RuleSet>();
    }
}

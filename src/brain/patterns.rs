//! Usage pattern mining
//!
//! Offline-style miner over the intent history. Surfaces recurring
//! commands (with a suggested schedule), repeated command sequences,
//! time-of-day clusters, and dominant tools. Confidence grows with
//! occurrences and all results come back sorted by confidence.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::history::HistoryRecord;
use crate::memory::semantic::normalize_command;

const MIN_OCCURRENCES: usize = 3;
const WORKFLOW_WINDOW_MINUTES: i64 = 30;
const PREFERENCE_SHARE: f64 = 0.3;

/// Kind of detected pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternType {
    Recurring,
    Workflow,
    TimeBased,
    Preference,
}

/// Suggested run schedule: (minute, hour, day-of-month, day-of-week)
pub type Schedule = (u32, u32, Option<u32>, Option<u32>);

/// One mined pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub pattern_type: PatternType,
    pub description: String,
    pub confidence: f64,
    pub occurrences: usize,
    pub first_seen: String,
    pub last_seen: String,
    pub frequency: Option<String>,
    pub suggested_schedule: Option<Schedule>,
    pub commands: Vec<String>,
}

/// Mines patterns from execution history
pub struct PatternDetector {
    lookback_days: i64,
}

impl PatternDetector {
    pub fn new() -> Self {
        Self { lookback_days: 30 }
    }

    pub fn with_lookback_days(mut self, days: i64) -> Self {
        self.lookback_days = days;
        self
    }

    /// Detect all pattern kinds, sorted by confidence descending.
    pub fn detect(&self, history: &[HistoryRecord]) -> Vec<DetectedPattern> {
        let cutoff = Utc::now() - chrono::Duration::days(self.lookback_days);
        let recent: Vec<(&HistoryRecord, DateTime<Utc>)> = history
            .iter()
            .filter_map(|r| {
                let ts = DateTime::parse_from_rfc3339(&r.timestamp)
                    .ok()?
                    .with_timezone(&Utc);
                (ts > cutoff).then_some((r, ts))
            })
            .collect();

        if recent.len() < MIN_OCCURRENCES {
            return Vec::new();
        }

        let mut patterns = Vec::new();
        patterns.extend(self.detect_recurring(&recent));
        patterns.extend(self.detect_workflows(&recent));
        patterns.extend(self.detect_time_based(&recent));
        patterns.extend(self.detect_preferences(&recent));

        patterns.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        patterns
    }

    fn detect_recurring(
        &self,
        recent: &[(&HistoryRecord, DateTime<Utc>)],
    ) -> Vec<DetectedPattern> {
        let mut groups: HashMap<String, Vec<&(&HistoryRecord, DateTime<Utc>)>> = HashMap::new();
        for entry in recent {
            groups
                .entry(normalize_command(&entry.0.user_input))
                .or_default()
                .push(entry);
        }

        let mut patterns = Vec::new();
        for (normalized, entries) in groups {
            if entries.len() < MIN_OCCURRENCES {
                continue;
            }

            let timestamps: Vec<DateTime<Utc>> = entries.iter().map(|e| e.1).collect();
            let Some((frequency, schedule)) = detect_frequency(&timestamps) else {
                continue;
            };

            patterns.push(DetectedPattern {
                pattern_type: PatternType::Recurring,
                description: format!("You {} {}", normalized, frequency),
                confidence: (entries.len() as f64 / 10.0).min(1.0),
                occurrences: entries.len(),
                first_seen: entries.first().map(|e| e.0.timestamp.clone()).unwrap_or_default(),
                last_seen: entries.last().map(|e| e.0.timestamp.clone()).unwrap_or_default(),
                frequency: Some(frequency),
                suggested_schedule: Some(schedule),
                commands: entries.iter().map(|e| e.0.user_input.clone()).collect(),
            });
        }
        patterns
    }

    fn detect_workflows(
        &self,
        recent: &[(&HistoryRecord, DateTime<Utc>)],
    ) -> Vec<DetectedPattern> {
        // Split history into sequences of commands issued within the
        // sliding window of each other.
        let mut sequences: Vec<Vec<&HistoryRecord>> = Vec::new();
        let mut current: Vec<&HistoryRecord> = Vec::new();
        let mut last_ts: Option<DateTime<Utc>> = None;

        for &(record, ts) in recent {
            let within = last_ts
                .map(|prev| (ts - prev).num_minutes() <= WORKFLOW_WINDOW_MINUTES)
                .unwrap_or(true);

            if within {
                current.push(record);
            } else {
                if current.len() >= 2 {
                    sequences.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
                current.push(record);
            }
            last_ts = Some(ts);
        }
        if current.len() >= 2 {
            sequences.push(current);
        }

        let mut counts: HashMap<Vec<String>, usize> = HashMap::new();
        for seq in &sequences {
            let normalized: Vec<String> = seq
                .iter()
                .map(|r| normalize_command(&r.user_input))
                .collect();
            *counts.entry(normalized).or_default() += 1;
        }

        counts
            .into_iter()
            .filter(|(_, count)| *count >= MIN_OCCURRENCES)
            .map(|(seq, count)| DetectedPattern {
                pattern_type: PatternType::Workflow,
                description: format!("Common workflow: {}", seq.join(" then ")),
                confidence: (count as f64 / 5.0).min(1.0),
                occurrences: count,
                first_seen: String::new(),
                last_seen: String::new(),
                frequency: None,
                suggested_schedule: None,
                commands: seq,
            })
            .collect()
    }

    fn detect_time_based(
        &self,
        recent: &[(&HistoryRecord, DateTime<Utc>)],
    ) -> Vec<DetectedPattern> {
        let mut hour_commands: HashMap<(u32, String), usize> = HashMap::new();
        for (record, ts) in recent {
            let key = (ts.hour(), normalize_command(&record.user_input));
            *hour_commands.entry(key).or_default() += 1;
        }

        hour_commands
            .into_iter()
            .filter(|(_, count)| *count >= MIN_OCCURRENCES)
            .map(|((hour, cmd), count)| DetectedPattern {
                pattern_type: PatternType::TimeBased,
                description: format!("You typically {} around {:02}:00", cmd, hour),
                confidence: (count as f64 / 10.0).min(1.0),
                occurrences: count,
                first_seen: String::new(),
                last_seen: String::new(),
                frequency: None,
                suggested_schedule: Some((0, hour, None, None)),
                commands: vec![cmd],
            })
            .collect()
    }

    fn detect_preferences(
        &self,
        recent: &[(&HistoryRecord, DateTime<Utc>)],
    ) -> Vec<DetectedPattern> {
        let mut tool_counts: HashMap<&str, usize> = HashMap::new();
        let mut total = 0usize;
        for (record, _) in recent {
            for tool in &record.tools {
                *tool_counts.entry(tool.as_str()).or_default() += 1;
                total += 1;
            }
        }
        if total == 0 {
            return Vec::new();
        }

        tool_counts
            .into_iter()
            .filter_map(|(tool, count)| {
                let share = count as f64 / total as f64;
                (share > PREFERENCE_SHARE).then(|| DetectedPattern {
                    pattern_type: PatternType::Preference,
                    description: format!(
                        "You frequently use {} ({:.0}% of operations)",
                        tool,
                        share * 100.0
                    ),
                    confidence: share,
                    occurrences: count,
                    first_seen: String::new(),
                    last_seen: String::new(),
                    frequency: None,
                    suggested_schedule: None,
                    commands: Vec::new(),
                })
            })
            .collect()
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify inter-arrival intervals into daily/weekly/monthly windows and
/// derive a schedule tuple by averaging timestamps.
fn detect_frequency(timestamps: &[DateTime<Utc>]) -> Option<(String, Schedule)> {
    if timestamps.len() < 2 {
        return None;
    }

    let mut sorted = timestamps.to_vec();
    sorted.sort();

    let intervals: Vec<f64> = sorted
        .windows(2)
        .map(|w| (w[1] - w[0]).num_seconds() as f64 / 3600.0)
        .collect();
    let avg_interval = intervals.iter().sum::<f64>() / intervals.len() as f64;

    let avg_hour =
        (sorted.iter().map(|t| t.hour() as f64).sum::<f64>() / sorted.len() as f64) as u32;

    if (20.0..=28.0).contains(&avg_interval) {
        Some(("daily".to_string(), (0, avg_hour, None, None)))
    } else if (160.0..=200.0).contains(&avg_interval) {
        let avg_weekday = (sorted
            .iter()
            .map(|t| t.weekday().num_days_from_monday() as f64)
            .sum::<f64>()
            / sorted.len() as f64) as u32;
        Some(("weekly".to_string(), (0, avg_hour, None, Some(avg_weekday))))
    } else if (600.0..=800.0).contains(&avg_interval) {
        let avg_day =
            (sorted.iter().map(|t| t.day() as f64).sum::<f64>() / sorted.len() as f64) as u32;
        Some(("monthly".to_string(), (0, avg_hour, Some(avg_day), None)))
    } else {
        None
    }
}

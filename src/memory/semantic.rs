//! Similar-utterance lookup
//!
//! Without an embedding backend, "similar past utterances" degrades to
//! exact match on a normalized form: paths and numbers are replaced by
//! placeholders so `delete /tmp/a.log` and `delete /var/b.log` coincide.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::memory::history::HistoryRecord;

/// Normalize a command for matching: paths and numbers become
/// placeholders, text is lowercased and trimmed.
pub fn normalize_command(command: &str) -> String {
    static PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/[^\s]+").expect("static regex"));
    static NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));

    let normalized = PATH_RE.replace_all(command, "<path>");
    let normalized = NUM_RE.replace_all(&normalized, "<num>");
    normalized.to_lowercase().trim().to_string()
}

/// Past records whose normalized form matches the utterance, newest first.
pub fn find_similar<'a>(
    records: &'a [HistoryRecord],
    utterance: &str,
    limit: usize,
) -> Vec<&'a HistoryRecord> {
    let needle = normalize_command(utterance);
    records
        .iter()
        .rev()
        .filter(|r| normalize_command(&r.user_input) == needle)
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(input: &str) -> HistoryRecord {
        HistoryRecord {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            user_input: input.to_string(),
            goal: "g".to_string(),
            tools: vec![],
            success: true,
        }
    }

    #[test]
    fn test_normalization_collapses_specifics() {
        assert_eq!(
            normalize_command("delete /tmp/a.log"),
            normalize_command("delete /var/log/b.log")
        );
        assert_eq!(
            normalize_command("show last 10 lines"),
            normalize_command("show last 25 lines")
        );
    }

    #[test]
    fn test_find_similar_exact_on_normalized() {
        let records = vec![
            record("delete /tmp/a.log"),
            record("list files"),
            record("delete /var/b.log"),
        ];

        let similar = find_similar(&records, "delete /home/c.log", 5);
        assert_eq!(similar.len(), 2);
        // Newest first.
        assert_eq!(similar[0].user_input, "delete /var/b.log");
    }

    #[test]
    fn test_no_match() {
        let records = vec![record("list files")];
        assert!(find_similar(&records, "reboot the server", 5).is_empty());
    }
}

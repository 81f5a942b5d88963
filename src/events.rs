use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use csv::ReaderBuilder;
use std::path::Path;
use std::time::Instant;
use tracing::info;

use crate::labeler;
use crate::vocabulary::TagVocabulary;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// One raw log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub user_id: String,
    pub timestamp: NaiveDateTime,
    pub url: String,
}

/// An event whose URL matched a vocabulary tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledEvent {
    pub user_id: String,
    pub timestamp: NaiveDateTime,
    pub label: String,
}

#[derive(Debug, Default)]
pub struct LabelingStats {
    pub root_excluded: usize,
    pub unmatched: usize,
}

/// Parse a log timestamp. Offsets in RFC 3339 input are kept as wall-clock
/// time, so the calendar date is the one the visitor saw.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();

    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(ts);
        }
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.naive_local());
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(ts) = date.and_hms_opt(0, 0, 0) {
            return Ok(ts);
        }
    }

    anyhow::bail!("Unparsable timestamp '{}'", raw)
}

/// Read the raw (UserID, Timestamp, URL) log. Any bad row aborts the read.
pub fn read_events(path: &Path, has_headers: bool) -> Result<Vec<Event>> {
    let start_time = Instant::now();
    info!(action = "start", component = "event_reading", file_path = ?path, "Reading raw events");

    if !path.exists() {
        anyhow::bail!("Input file not found: {:?}", path);
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {:?}", path))?;

    let mut events = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to read row {}", index + 1))?;
        if record.len() != 3 {
            anyhow::bail!(
                "Row {} has {} columns, expected 3 (UserID, Timestamp, URL)",
                index + 1,
                record.len()
            );
        }

        let timestamp = parse_timestamp(&record[1])
            .with_context(|| format!("Row {} of {:?}", index + 1, path))?;
        events.push(Event {
            user_id: record[0].to_string(),
            timestamp,
            url: record[2].to_string(),
        });
    }

    info!(
        action = "complete",
        component = "event_reading",
        event_count = events.len(),
        duration_ms = start_time.elapsed().as_millis(),
        "Read raw events"
    );
    Ok(events)
}

/// Drop site-root hits, label the rest and keep only the labeled ones.
pub fn label_events(
    events: &[Event],
    vocabulary: &TagVocabulary,
    site_root: &str,
) -> (Vec<LabeledEvent>, LabelingStats) {
    let mut stats = LabelingStats::default();
    let mut labeled = Vec::with_capacity(events.len());

    for event in events {
        if labeler::is_site_root(&event.url, site_root) {
            stats.root_excluded += 1;
            continue;
        }
        match labeler::label_url(&event.url, vocabulary) {
            Some(label) => labeled.push(LabeledEvent {
                user_id: event.user_id.clone(),
                timestamp: event.timestamp,
                label: label.to_string(),
            }),
            None => stats.unmatched += 1,
        }
    }

    info!(
        action = "complete",
        component = "labeling",
        labeled = labeled.len(),
        root_excluded = stats.root_excluded,
        unmatched = stats.unmatched,
        "Labeled events"
    );
    (labeled, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeler::DEFAULT_SITE_ROOT;
    use std::fs;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn parses_supported_timestamp_formats() {
        let expected = ts("2024-01-01 09:00:00");
        assert_eq!(parse_timestamp("2024-01-01 09:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-01T09:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp(" 2024/01/01 09:00:00 ").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-01 09:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-01T09:00:00+08:00").unwrap(), expected);
        assert_eq!(
            parse_timestamp("2024-01-01").unwrap(),
            ts("2024-01-01 00:00:00")
        );
        let fractional = parse_timestamp("2024-01-01 09:00:00.250").unwrap();
        assert_eq!(fractional.date(), expected.date());
    }

    #[test]
    fn rejects_garbage_timestamp() {
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("2024-13-40 09:00:00").is_err());
    }

    #[test]
    fn read_events_without_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        fs::write(
            &path,
            "U1,2024-01-01 09:00:00,https://www.cosme.net.tw/events\nU2,2024-01-02 10:00:00,https://www.cosme.net.tw/\n",
        )
        .unwrap();
        let events = read_events(&path, false).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].user_id, "U1");
        assert_eq!(events[1].url, "https://www.cosme.net.tw/");

        let skipped = read_events(&path, true).unwrap();
        assert_eq!(skipped.len(), 1);
    }

    #[test]
    fn bad_timestamp_aborts_the_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        fs::write(
            &path,
            "U1,2024-01-01 09:00:00,https://a/events\nU1,not-a-time,https://a/coupons\n",
        )
        .unwrap();
        let err = read_events(&path, false).unwrap_err();
        assert!(format!("{:#}", err).contains("not-a-time"));
    }

    #[test]
    fn wrong_column_count_aborts_the_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        fs::write(&path, "U1,2024-01-01 09:00:00\n").unwrap();
        assert!(read_events(&path, false).is_err());
        assert!(read_events(&dir.path().join("missing.csv"), false).is_err());
    }

    #[test]
    fn root_and_unmatched_urls_are_dropped() {
        let vocab = TagVocabulary::embedded().unwrap();
        let events = vec![
            Event {
                user_id: "U1".into(),
                timestamp: ts("2024-01-01 09:00:00"),
                url: DEFAULT_SITE_ROOT.into(),
            },
            Event {
                user_id: "U1".into(),
                timestamp: ts("2024-01-01 09:01:00"),
                url: "https://www.cosme.net.tw/about".into(),
            },
            Event {
                user_id: "U1".into(),
                timestamp: ts("2024-01-01 09:02:00"),
                url: "https://www.cosme.net.tw/coupons".into(),
            },
        ];
        let (labeled, stats) = label_events(&events, &vocab, DEFAULT_SITE_ROOT);
        assert_eq!(labeled.len(), 1);
        assert_eq!(labeled[0].label, "coupons");
        assert_eq!(stats.root_excluded, 1);
        assert_eq!(stats.unmatched, 1);
    }
}

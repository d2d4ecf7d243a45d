use std::collections::BTreeMap;

use tracing::warn;

use ingest_common::event::CandidateRecord;

/// Candidate records grouped by the source that publishes them.
#[derive(Debug, Default)]
pub struct SourceBatches {
    pub by_source: BTreeMap<String, Vec<CandidateRecord>>,
    /// Lines that were not a candidate record, or had no source to publish under
    pub rejected: usize,
}

/// Parse newline-delimited JSON candidate records, as written by the scrapers.
pub fn parse_ndjson(input: &str, default_source: Option<&str>) -> SourceBatches {
    let mut batches = SourceBatches::default();

    for (number, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: CandidateRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = number + 1, error = %e, "skipping malformed candidate record");
                batches.rejected += 1;
                continue;
            }
        };

        let source = record
            .source
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or(default_source);
        match source {
            Some(source) => batches
                .by_source
                .entry(source.to_owned())
                .or_default()
                .push(record),
            None => {
                warn!(line = number + 1, "skipping candidate record without a source");
                batches.rejected += 1;
            }
        }
    }

    batches
}

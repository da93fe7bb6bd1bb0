//! Flat-file inputs and exports. Column names are a fixed contract: every
//! reader names the columns it needs and aborts on the first one missing.

use crate::error::{PipelineError, Result};
use crate::schema::{
    AnalysisRecord, CleanPost, LabeledExample, LabeledPost, NarrativeLabel, Politician, RawPost,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

pub const POLITICIAN_COLUMNS: &[&str] = &["handle", "name", "chamber", "state", "party"];
pub const ANNOTATION_COLUMNS: &[&str] = &["id", "text", "label"];
pub const CLEAN_POST_COLUMNS: &[&str] = &[
    "id",
    "author_id",
    "handle",
    "date",
    "time",
    "text",
    "conversation_id",
    "reply_count",
    "repost_count",
    "like_count",
    "quote_count",
    "reply_like_ratio",
];
pub const LABELED_POST_COLUMNS: &[&str] =
    &["id", "handle", "date", "text", "manual_label", "predicted_label"];
pub const RAW_POST_COLUMNS: &[&str] = &[
    "id",
    "author_id",
    "handle",
    "created_at",
    "text",
    "conversation_id",
    "reply_count",
    "repost_count",
    "like_count",
    "quote_count",
];
pub const ANALYSIS_RECORD_COLUMNS: &[&str] = &[
    "post_id",
    "handle",
    "legislator",
    "legislator_name",
    "date",
    "day",
    "label",
    "party",
    "state",
    "trigger_state",
    "post_ruling",
    "window",
    "window_name",
];

/// A row type with a fixed header, in field order.
pub trait CsvRow: Serialize {
    const COLUMNS: &'static [&'static str];
}

impl CsvRow for CleanPost {
    const COLUMNS: &'static [&'static str] = CLEAN_POST_COLUMNS;
}

impl CsvRow for LabeledPost {
    const COLUMNS: &'static [&'static str] = LABELED_POST_COLUMNS;
}

impl CsvRow for AnalysisRecord {
    const COLUMNS: &'static [&'static str] = ANALYSIS_RECORD_COLUMNS;
}

pub fn read_csv<T: DeserializeOwned>(path: &Path, required: &[&str]) -> Result<Vec<T>> {
    let display = path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    for column in required {
        if !headers.iter().any(|h| h == *column) {
            return Err(PipelineError::MissingColumn {
                path: display,
                column: column.to_string(),
            });
        }
    }

    let mut rows = Vec::new();
    for result in reader.deserialize::<T>() {
        let row = result.map_err(|err| PipelineError::MalformedRow {
            path: display.clone(),
            line: err.position().map(|p| p.line()).unwrap_or(0),
            message: err.to_string(),
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Write the header first so an empty export still names its columns.
pub fn write_csv<T: CsvRow>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(File::create(path)?);
    writer.write_record(T::COLUMNS)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), rows = rows.len(), "wrote CSV");
    Ok(())
}

pub fn read_politicians(path: &Path) -> Result<Vec<Politician>> {
    read_csv(path, POLITICIAN_COLUMNS)
}

#[derive(Debug, Deserialize)]
struct AnnotationRow {
    id: String,
    text: String,
    label: String,
}

/// Manually annotated posts. An unknown label aborts with the offending id.
pub fn read_annotations(path: &Path) -> Result<Vec<LabeledExample>> {
    let rows: Vec<AnnotationRow> = read_csv(path, ANNOTATION_COLUMNS)?;
    rows.into_iter()
        .map(|row| {
            let label = row
                .label
                .parse::<NarrativeLabel>()
                .map_err(|message| PipelineError::InvalidRecord {
                    record: row.id.clone(),
                    message,
                })?;
            Ok(LabeledExample {
                id: row.id,
                text: row.text,
                label,
            })
        })
        .collect()
}

pub fn read_clean_posts(path: &Path) -> Result<Vec<CleanPost>> {
    read_csv(path, CLEAN_POST_COLUMNS)
}

pub fn read_labeled_posts(path: &Path) -> Result<Vec<LabeledPost>> {
    read_csv(path, LABELED_POST_COLUMNS)
}

/// Flat export row for raw posts; the CSV writer cannot nest the engagement bundle.
#[derive(Debug, Serialize)]
struct RawPostRow<'a> {
    id: &'a str,
    author_id: &'a str,
    handle: &'a str,
    created_at: &'a str,
    text: &'a str,
    conversation_id: Option<&'a str>,
    reply_count: Option<u64>,
    repost_count: Option<u64>,
    like_count: Option<u64>,
    quote_count: Option<u64>,
}

impl CsvRow for RawPostRow<'_> {
    const COLUMNS: &'static [&'static str] = RAW_POST_COLUMNS;
}

pub fn write_raw_posts(path: &Path, posts: &[RawPost]) -> Result<()> {
    let rows: Vec<RawPostRow<'_>> = posts
        .iter()
        .map(|p| {
            let e = p.engagement.clone().unwrap_or_default();
            RawPostRow {
                id: &p.id,
                author_id: &p.author_id,
                handle: &p.handle,
                created_at: &p.created_at,
                text: &p.text,
                conversation_id: p.conversation_id.as_deref(),
                reply_count: e.reply_count,
                repost_count: e.repost_count,
                like_count: e.like_count,
                quote_count: e.quote_count,
            }
        })
        .collect();
    write_csv(path, &rows)
}

pub fn write_analysis_records(path: &Path, records: &[AnalysisRecord]) -> Result<()> {
    write_csv(path, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Chamber, Party};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn missing_column_is_named() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("politicians.csv");
        fs::write(&path, "handle,name,state,party\nalice,Alice,TX,R\n").unwrap();

        let err = read_politicians(&path).unwrap_err();
        match err {
            PipelineError::MissingColumn { column, .. } => assert_eq!(column, "chamber"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn politicians_parse_lenient_party_and_chamber() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("politicians.csv");
        fs::write(
            &path,
            "handle,name,chamber,state,party\nalice,Alice A,Senate,TX,R\nbob,Bob B,house,CA,Democratic\n",
        )
        .unwrap();

        let politicians = read_politicians(&path).unwrap();
        assert_eq!(politicians.len(), 2);
        assert_eq!(politicians[0].party, Party::Republican);
        assert_eq!(politicians[0].chamber, Chamber::Senate);
        assert_eq!(politicians[1].party, Party::Democrat);
    }

    #[test]
    fn unknown_annotation_label_names_the_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("annotations.csv");
        fs::write(&path, "id,text,label\n17,some text,maybe\n").unwrap();

        let err = read_annotations(&path).unwrap_err();
        assert!(err.to_string().contains("'17'"), "{err}");
    }

    #[test]
    fn clean_posts_round_trip_keeps_missing_counters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean.csv");
        let post = CleanPost {
            id: "1".to_string(),
            author_id: "9".to_string(),
            handle: "alice".to_string(),
            date: time::macros::date!(2022 - 06 - 24),
            time: time::macros::time!(12:00:01),
            text: "text, with comma".to_string(),
            conversation_id: None,
            reply_count: None,
            repost_count: Some(2),
            like_count: None,
            quote_count: None,
            reply_like_ratio: None,
        };
        write_csv(&path, &[post.clone()]).unwrap();
        let back = read_clean_posts(&path).unwrap();
        assert_eq!(back, vec![post]);
    }

    #[test]
    fn empty_exports_keep_their_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topic.csv");
        write_csv::<CleanPost>(&path, &[]).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.trim_end(), CLEAN_POST_COLUMNS.join(","));
        assert!(read_clean_posts(&path).unwrap().is_empty());

        let labeled = dir.path().join("labeled.csv");
        write_csv::<LabeledPost>(&labeled, &[]).unwrap();
        assert!(read_labeled_posts(&labeled).unwrap().is_empty());

        let raw_posts = dir.path().join("raw.csv");
        write_raw_posts(&raw_posts, &[]).unwrap();
        assert_eq!(
            fs::read_to_string(&raw_posts).unwrap().trim_end(),
            RAW_POST_COLUMNS.join(",")
        );
    }

    #[test]
    fn header_follows_field_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labeled.csv");
        let post = LabeledPost {
            id: "1".to_string(),
            handle: "alice".to_string(),
            date: time::macros::date!(2022 - 06 - 24),
            text: "text".to_string(),
            manual_label: None,
            predicted_label: NarrativeLabel::Decline,
        };
        write_csv(&path, &[post.clone()]).unwrap();
        assert_eq!(read_labeled_posts(&path).unwrap(), vec![post]);
    }
}

//! Raw issue records as exported from a repository, and their conversion into documents.

use crate::error::SourceError;
use crate::index::{DocId, Document, IssueState};
use serde::Deserialize;
use std::io::BufRead;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Labels arrive either as bare names or as GitHub label objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawLabel {
    Name(String),
    Object { name: String },
}

impl RawLabel {
    fn into_name(self) -> String {
        match self {
            RawLabel::Name(name) | RawLabel::Object { name } => name,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawIssue {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "body", alias = "page_content")]
    pub description: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub labels: Vec<RawLabel>,
}

impl RawIssue {
    /// Validate and assign `id`. A record without a title, or with an unreadable
    /// timestamp or state, is malformed. A missing timestamp becomes the Unix epoch.
    pub fn into_document(self, id: DocId) -> Result<Document, SourceError> {
        let title = match self.title.map(|t| t.trim().to_string()) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(SourceError::malformed("missing title")),
        };
        let created_at = match self.created_at.as_deref() {
            Some(ts) => OffsetDateTime::parse(ts.trim(), &Rfc3339)
                .map_err(|e| SourceError::malformed(format!("created_at {ts:?}: {e}")))?,
            None => OffsetDateTime::UNIX_EPOCH,
        };
        let state = match self.state.as_deref() {
            Some(s) => IssueState::parse(s).ok_or_else(|| SourceError::malformed(format!("unknown state {s:?}")))?,
            None => IssueState::Open,
        };
        Ok(Document {
            id,
            title,
            url: self.url.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            creator: self.creator.unwrap_or_default(),
            created_at,
            state,
            labels: self.labels.into_iter().map(RawLabel::into_name).collect(),
        })
    }
}

/// Reads one record per non-empty line. Lines that fail to parse come back as errors
/// and the reader carries on with the next line.
pub fn read_jsonl<R: BufRead>(reader: R) -> impl Iterator<Item = Result<RawIssue, SourceError>> {
    reader.lines().filter_map(|line| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(serde_json::from_str::<RawIssue>(&line).map_err(SourceError::from)),
        Err(e) => Some(Err(SourceError::from(e))),
    })
}

/// Parses a JSON document holding either one record or an array of records.
pub fn read_json<R: std::io::Read>(reader: R) -> Result<Vec<Result<RawIssue, SourceError>>, SourceError> {
    let json: serde_json::Value = serde_json::from_reader(reader)?;
    Ok(match json {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|v| serde_json::from_value::<RawIssue>(v).map_err(SourceError::from))
            .collect(),
        obj @ serde_json::Value::Object(_) => vec![serde_json::from_value::<RawIssue>(obj).map_err(SourceError::from)],
        _ => Vec::new(),
    })
}

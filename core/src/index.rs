use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

pub type TermId = u32;
pub type DocId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Some(IssueState::Open),
            "closed" => Some(IssueState::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for IssueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueState::Open => f.write_str("open"),
            IssueState::Closed => f.write_str("closed"),
        }
    }
}

/// A GitHub issue as stored in the document store. Immutable once indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub title: String,
    pub url: String,
    pub description: String,
    pub creator: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub state: IssueState,
    pub labels: Vec<String>,
}

impl Document {
    /// Text fed to the sparse index: title, labels, then the description.
    pub fn indexed_text(&self) -> String {
        let mut text = String::with_capacity(self.title.len() + self.description.len() + 16);
        text.push_str(&self.title);
        for label in &self.labels {
            text.push(' ');
            text.push_str(label);
        }
        text.push('\n');
        text.push_str(&self.description);
        text
    }

    /// Text sent to the embedding provider.
    pub fn embedding_text(&self) -> String {
        if self.description.trim().is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.description)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: DocId,
    pub term_frequency: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSource {
    Sparse,
    Dense,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedHit {
    pub doc_id: DocId,
    pub score: f32,
    pub source: HitSource,
}

/// Owns the canonical documents. Ids are dense: the document with id `i` sits at position `i`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DocumentStore {
    docs: Vec<Document>,
}

impl DocumentStore {
    pub fn new() -> Self { Self::default() }

    /// Next id that `push` will accept.
    pub fn next_id(&self) -> DocId { self.docs.len() as DocId }

    /// Appends a document. The caller must have assigned `next_id()` as its id.
    pub fn push(&mut self, doc: Document) -> crate::Result<()> {
        if doc.id != self.next_id() {
            return Err(crate::Error::NonSequentialId { expected: self.next_id(), found: doc.id });
        }
        self.docs.push(doc);
        Ok(())
    }

    pub fn get(&self, id: DocId) -> Option<&Document> { self.docs.get(id as usize) }

    pub fn contains(&self, id: DocId) -> bool { (id as usize) < self.docs.len() }

    pub fn len(&self) -> usize { self.docs.len() }

    pub fn is_empty(&self) -> bool { self.docs.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &Document> { self.docs.iter() }

    /// Checks the dense-id invariant; used when a store comes off disk.
    pub(crate) fn ids_are_dense(&self) -> bool {
        self.docs.iter().enumerate().all(|(i, d)| d.id as usize == i)
    }
}

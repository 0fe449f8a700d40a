//! Inverted index scored with BM25.

use crate::config::Bm25Params;
use crate::index::{DocId, HitSource, Posting, RankedHit, TermId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Read-only view of the corpus statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusStats {
    pub document_count: u32,
    pub average_document_length: f32,
    pub term_count: usize,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SparseIndex {
    params: Bm25Params,
    dictionary: HashMap<String, TermId>,
    /// Indexed by term id; each list sorted by doc_id. Its length is the term's document frequency.
    postings: Vec<Vec<Posting>>,
    doc_lengths: HashMap<DocId, u32>,
    total_length: u64,
}

impl SparseIndex {
    pub fn new(params: Bm25Params) -> Self {
        Self { params, ..Self::default() }
    }

    pub fn params(&self) -> Bm25Params { self.params }

    /// Index one document's analyzed terms.
    pub fn add(&mut self, doc_id: DocId, terms: &[String]) -> Result<()> {
        if self.doc_lengths.contains_key(&doc_id) {
            return Err(Error::DuplicateDocument(doc_id));
        }
        let mut tf_counts: HashMap<TermId, u32> = HashMap::new();
        for term in terms {
            let next_id = self.postings.len() as TermId;
            let tid = *self.dictionary.entry(term.clone()).or_insert(next_id);
            if tid == next_id {
                self.postings.push(Vec::new());
            }
            *tf_counts.entry(tid).or_insert(0) += 1;
        }
        for (tid, term_frequency) in tf_counts {
            let list = &mut self.postings[tid as usize];
            let posting = Posting { doc_id, term_frequency };
            // Builders add in id order, so this is almost always a push.
            match list.last() {
                Some(last) if last.doc_id > doc_id => {
                    let at = list.partition_point(|p| p.doc_id < doc_id);
                    list.insert(at, posting);
                }
                _ => list.push(posting),
            }
        }
        self.doc_lengths.insert(doc_id, terms.len() as u32);
        self.total_length += terms.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> usize { self.doc_lengths.len() }

    pub fn is_empty(&self) -> bool { self.doc_lengths.is_empty() }

    pub fn contains(&self, doc_id: DocId) -> bool { self.doc_lengths.contains_key(&doc_id) }

    pub fn stats(&self) -> CorpusStats {
        CorpusStats {
            document_count: self.doc_lengths.len() as u32,
            average_document_length: self.average_length(),
            term_count: self.dictionary.len(),
        }
    }

    pub fn document_frequency(&self, term: &str) -> u32 {
        self.dictionary
            .get(term)
            .map(|tid| self.postings[*tid as usize].len() as u32)
            .unwrap_or(0)
    }

    pub fn postings(&self, term: &str) -> Option<&[Posting]> {
        self.dictionary.get(term).map(|tid| self.postings[*tid as usize].as_slice())
    }

    fn average_length(&self) -> f32 {
        if self.doc_lengths.is_empty() { 0.0 } else { self.total_length as f32 / self.doc_lengths.len() as f32 }
    }

    fn idf(&self, df: u32) -> f32 {
        let n = self.doc_lengths.len() as f32;
        let df = df as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// Top-k documents for the analyzed query. Repeated query terms count once; documents
    /// matching no query term are left out entirely.
    pub fn search(&self, query_terms: &[String], k: usize) -> Vec<RankedHit> {
        if k == 0 || self.is_empty() { return Vec::new(); }
        let Bm25Params { k1, b } = self.params;
        let avgdl = match self.average_length() { x if x > 0.0 => x, _ => 1.0 };

        let mut seen: HashSet<&str> = HashSet::new();
        let mut scores: HashMap<DocId, f32> = HashMap::new();
        for term in query_terms {
            if !seen.insert(term.as_str()) { continue; }
            let Some(&tid) = self.dictionary.get(term) else { continue };
            let list = &self.postings[tid as usize];
            let idf = self.idf(list.len() as u32);
            for p in list {
                let tf = p.term_frequency as f32;
                let dl = *self.doc_lengths.get(&p.doc_id).unwrap_or(&0) as f32;
                let norm = k1 * (1.0 - b + b * dl / avgdl);
                *scores.entry(p.doc_id).or_insert(0.0) += idf * (tf * (k1 + 1.0)) / (tf + norm);
            }
        }

        let mut scored: Vec<(DocId, f32)> = scores.into_iter().collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(doc_id, score)| RankedHit { doc_id, score, source: HitSource::Sparse })
            .collect()
    }

    /// Every posting points at an indexed document and every list is sorted with tf >= 1.
    pub(crate) fn check_consistency(&self) -> std::result::Result<(), String> {
        if self.dictionary.len() != self.postings.len() {
            return Err(format!("dictionary has {} terms but {} posting lists", self.dictionary.len(), self.postings.len()));
        }
        if self.dictionary.values().any(|tid| *tid as usize >= self.postings.len()) {
            return Err("term id out of range".into());
        }
        let total: u64 = self.doc_lengths.values().map(|l| *l as u64).sum();
        if total != self.total_length {
            return Err("document lengths do not add up to the corpus length".into());
        }
        for (tid, list) in self.postings.iter().enumerate() {
            for pair in list.windows(2) {
                if pair[0].doc_id >= pair[1].doc_id {
                    return Err(format!("postings for term {tid} are not sorted"));
                }
            }
            for p in list {
                if p.term_frequency == 0 {
                    return Err(format!("zero-frequency posting for term {tid}"));
                }
                if !self.doc_lengths.contains_key(&p.doc_id) {
                    return Err(format!("posting for term {tid} refers to unknown document {}", p.doc_id));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tokenize;

    fn index(docs: &[&str]) -> SparseIndex {
        let mut idx = SparseIndex::new(Bm25Params::default());
        for (i, text) in docs.iter().enumerate() {
            idx.add(i as DocId, &tokenize(text)).unwrap();
        }
        idx
    }

    #[test]
    fn scores_match_formula() {
        let idx = index(&["rust parser", "rust rust compiler", "python"]);
        let hits = idx.search(&["rust".to_string()], 10);
        assert_eq!(hits.len(), 2);

        // N=3, df=2, lengths 2/3/1 so avgdl=2
        let idf = (1.0f32 + (3.0 - 2.0 + 0.5) / (2.0 + 0.5)).ln();
        let avgdl = 2.0f32;
        let expect = |tf: f32, dl: f32| idf * tf * 2.2 / (tf + 1.2 * (0.25 + 0.75 * dl / avgdl));
        assert_eq!(hits[0].doc_id, 1);
        assert!((hits[0].score - expect(2.0, 3.0)).abs() < 1e-5);
        assert!((hits[1].score - expect(1.0, 2.0)).abs() < 1e-5);
    }

    #[test]
    fn non_matching_documents_are_excluded() {
        let idx = index(&["alpha", "beta", "gamma"]);
        let hits = idx.search(&["beta".to_string()], 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, 1);
        assert!(idx.search(&["delta".to_string()], 10).is_empty());
    }

    #[test]
    fn equal_scores_break_ties_by_lower_id() {
        let idx = index(&["shared words", "unrelated", "shared words"]);
        let hits = idx.search(&tokenize("shared"), 10);
        assert_eq!(hits.iter().map(|h| h.doc_id).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn postings_stay_sorted_for_out_of_order_adds() {
        let mut idx = SparseIndex::new(Bm25Params::default());
        idx.add(5, &["x".to_string()]).unwrap();
        idx.add(2, &["x".to_string(), "x".to_string()]).unwrap();
        idx.add(9, &["x".to_string()]).unwrap();
        let ids: Vec<DocId> = idx.postings("x").unwrap().iter().map(|p| p.doc_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert_eq!(idx.document_frequency("x"), 3);
        idx.check_consistency().unwrap();
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut idx = SparseIndex::new(Bm25Params::default());
        idx.add(0, &["x".to_string()]).unwrap();
        assert!(matches!(idx.add(0, &["y".to_string()]), Err(Error::DuplicateDocument(0))));
    }

    #[test]
    fn stats_track_corpus() {
        let idx = index(&["one two three", "four"]);
        let stats = idx.stats();
        assert_eq!(stats.document_count, 2);
        assert!((stats.average_document_length - 2.0).abs() < 1e-6);
        assert_eq!(stats.term_count, 4);
    }

    #[test]
    fn repeated_query_terms_count_once() {
        let idx = index(&["cache miss", "cache"]);
        let once = tokenize("cache");
        let twice = tokenize("cache cache");
        assert_eq!(twice.len(), 2);
        let (once, twice) = (idx.search(&once, 10), idx.search(&twice, 10));
        assert_eq!(once.len(), 2);
        assert_eq!(once, twice);
    }
}

//! Hierarchical navigable small-world graph for approximate nearest-neighbor search.
//!
//! Every node lives on layer 0; a node drawn at level `l` also lives on layers
//! `1..=l`. Level draws follow a geometric distribution with `mL = 1/ln(m)` and
//! are keyed by `(seed, doc_id)`, so the graph shape does not depend on the
//! order documents arrive in.
//!
//! Neighbor lists are bounded by `m` above layer 0 and `m0` on layer 0. When a
//! list overflows it is re-selected with the same diversity heuristic used at
//! insertion: a candidate is dropped when it is closer to an already selected
//! neighbor than to the base node.

use crate::config::{HnswParams, Metric};
use crate::index::{DocId, HitSource, RankedHit};
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    doc_id: DocId,
    vector: Vec<f32>,
    /// `neighbors[l]` holds node indices linked on layer `l`.
    neighbors: Vec<Vec<u32>>,
}

impl Node {
    fn level(&self) -> usize { self.neighbors.len().saturating_sub(1) }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f32,
    node: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool { self.cmp(other) == Ordering::Equal }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance).then(self.node.cmp(&other.node))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseIndex {
    params: HnswParams,
    dimension: usize,
    nodes: Vec<Node>,
    by_doc: HashMap<DocId, u32>,
    entry_point: Option<u32>,
}

impl DenseIndex {
    pub fn new(dimension: usize, params: HnswParams) -> Self {
        Self { params, dimension, nodes: Vec::new(), by_doc: HashMap::new(), entry_point: None }
    }

    pub fn params(&self) -> HnswParams { self.params }

    pub fn dimension(&self) -> usize { self.dimension }

    pub fn metric(&self) -> Metric { self.params.metric }

    pub fn len(&self) -> usize { self.nodes.len() }

    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    pub fn contains(&self, doc_id: DocId) -> bool { self.by_doc.contains_key(&doc_id) }

    pub fn doc_ids(&self) -> impl Iterator<Item = DocId> + '_ { self.nodes.iter().map(|n| n.doc_id) }

    /// Number of nodes present on each layer, layer 0 first.
    pub fn layer_counts(&self) -> Vec<usize> {
        let top = self.entry_point.map(|e| self.nodes[e as usize].level()).unwrap_or(0);
        let mut counts = vec![0usize; if self.nodes.is_empty() { 0 } else { top + 1 }];
        for node in &self.nodes {
            for count in counts.iter_mut().take(node.level() + 1) {
                *count += 1;
            }
        }
        counts
    }

    fn bound(&self, layer: usize) -> usize {
        if layer == 0 { self.params.m0 } else { self.params.m }
    }

    fn random_level(&self, doc_id: DocId) -> usize {
        let mut rng = StdRng::seed_from_u64(self.params.seed ^ (doc_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let ml = 1.0 / (self.params.m.max(2) as f64).ln();
        let u: f64 = rng.random();
        let level = (-(1.0 - u).ln() * ml).floor() as usize;
        level.min(MAX_LEVEL)
    }

    fn prepare(&self, mut vector: Vec<f32>) -> Vec<f32> {
        if self.params.metric == Metric::Cosine {
            let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                vector.iter_mut().for_each(|x| *x /= norm);
            }
        }
        vector
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.params.metric {
            // Both sides are unit length (or zero), so the dot product is the cosine.
            Metric::Cosine => 1.0 - a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
            Metric::Euclidean => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt(),
        }
    }

    fn similarity(&self, distance: f32) -> f32 {
        match self.params.metric {
            Metric::Cosine => 1.0 - distance,
            Metric::Euclidean => 1.0 / (1.0 + distance),
        }
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        if actual == self.dimension {
            Ok(())
        } else {
            Err(Error::DimensionMismatch { expected: self.dimension, actual })
        }
    }

    /// Beam search on one layer. Returns up to `ef` candidates, closest first.
    fn search_layer(&self, query: &[f32], entry_points: &[u32], ef: usize, layer: usize) -> Vec<Candidate> {
        let mut visited = vec![false; self.nodes.len()];
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut best: BinaryHeap<Candidate> = BinaryHeap::new();

        for &ep in entry_points {
            if std::mem::replace(&mut visited[ep as usize], true) { continue; }
            let c = Candidate { distance: self.distance(query, &self.nodes[ep as usize].vector), node: ep };
            frontier.push(Reverse(c));
            best.push(c);
        }
        while best.len() > ef {
            best.pop();
        }

        while let Some(Reverse(current)) = frontier.pop() {
            let worst = best.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
            if current.distance > worst && best.len() >= ef { break; }

            let node = &self.nodes[current.node as usize];
            let Some(links) = node.neighbors.get(layer) else { continue };
            for &n in links {
                if std::mem::replace(&mut visited[n as usize], true) { continue; }
                let distance = self.distance(query, &self.nodes[n as usize].vector);
                let worst = best.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
                if best.len() < ef || distance < worst {
                    let c = Candidate { distance, node: n };
                    frontier.push(Reverse(c));
                    best.push(c);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }
        best.into_sorted_vec()
    }

    /// Walks down from the top layer to `stop_above`, keeping only the closest node per layer.
    fn descend(&self, query: &[f32], entry: u32, top: usize, stop_above: usize) -> u32 {
        let mut ep = entry;
        for layer in (stop_above + 1..=top).rev() {
            if let Some(closest) = self.search_layer(query, &[ep], 1, layer).first() {
                ep = closest.node;
            }
        }
        ep
    }

    /// Diversity heuristic over candidates sorted by distance to the base node.
    fn select_neighbors(&self, candidates: &[Candidate], bound: usize) -> Vec<u32> {
        let mut selected: Vec<Candidate> = Vec::with_capacity(bound);
        for c in candidates {
            if selected.len() >= bound { break; }
            let vector = &self.nodes[c.node as usize].vector;
            let diverse = selected
                .iter()
                .all(|s| self.distance(vector, &self.nodes[s.node as usize].vector) >= c.distance);
            if diverse {
                selected.push(*c);
            }
        }
        selected.into_iter().map(|c| c.node).collect()
    }

    fn link(&mut self, from: u32, to: u32, layer: usize) {
        let bound = self.bound(layer);
        let list = &mut self.nodes[from as usize].neighbors[layer];
        if list.contains(&to) { return; }
        list.push(to);
        if list.len() <= bound { return; }

        let base = &self.nodes[from as usize];
        let mut candidates: Vec<Candidate> = base.neighbors[layer]
            .iter()
            .map(|&n| Candidate { distance: self.distance(&base.vector, &self.nodes[n as usize].vector), node: n })
            .collect();
        candidates.sort();
        let kept = self.select_neighbors(&candidates, bound);
        self.nodes[from as usize].neighbors[layer] = kept;
    }

    /// Insert one document vector.
    pub fn add(&mut self, doc_id: DocId, vector: Vec<f32>) -> Result<()> {
        self.check_dimension(vector.len())?;
        if self.by_doc.contains_key(&doc_id) {
            return Err(Error::DuplicateDocument(doc_id));
        }
        let vector = self.prepare(vector);
        let level = self.random_level(doc_id);
        let idx = self.nodes.len() as u32;
        self.nodes.push(Node { doc_id, vector, neighbors: vec![Vec::new(); level + 1] });
        self.by_doc.insert(doc_id, idx);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(idx);
            return Ok(());
        };
        let top = self.nodes[entry as usize].level();
        let query = self.nodes[idx as usize].vector.clone();

        let mut entry_points = vec![self.descend(&query, entry, top, level)];
        for layer in (0..=level.min(top)).rev() {
            let found = self.search_layer(&query, &entry_points, self.params.ef_construction, layer);
            let neighbors = self.select_neighbors(&found, self.params.m);
            for &n in &neighbors {
                self.link(n, idx, layer);
            }
            self.nodes[idx as usize].neighbors[layer] = neighbors;
            entry_points = found.iter().map(|c| c.node).collect();
        }

        if level > top {
            self.entry_point = Some(idx);
        }
        Ok(())
    }

    /// Approximate top-k with the configured `ef_search`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<RankedHit>> {
        self.search_with_ef(query, k, self.params.ef_search)
    }

    /// Approximate top-k with an explicit beam width; larger `ef` trades latency for recall.
    pub fn search_with_ef(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<RankedHit>> {
        self.check_dimension(query.len())?;
        let Some(entry) = self.entry_point else { return Ok(Vec::new()) };
        if k == 0 { return Ok(Vec::new()); }

        let query = self.prepare(query.to_vec());
        let top = self.nodes[entry as usize].level();
        let ep = self.descend(&query, entry, top, 0);
        let found = self.search_layer(&query, &[ep], ef.max(k), 0);
        Ok(self.rank(found.into_iter().map(|c| (c.distance, c.node)).collect(), k))
    }

    /// Brute-force top-k over every node; the reference for recall measurements.
    pub fn exact_search(&self, query: &[f32], k: usize) -> Result<Vec<RankedHit>> {
        self.check_dimension(query.len())?;
        let query = self.prepare(query.to_vec());
        let all = (0..self.nodes.len() as u32)
            .map(|i| (self.distance(&query, &self.nodes[i as usize].vector), i))
            .collect();
        Ok(self.rank(all, k))
    }

    fn rank(&self, mut found: Vec<(f32, u32)>, k: usize) -> Vec<RankedHit> {
        found.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| self.nodes[a.1 as usize].doc_id.cmp(&self.nodes[b.1 as usize].doc_id))
        });
        found.truncate(k);
        found
            .into_iter()
            .map(|(distance, node)| RankedHit {
                doc_id: self.nodes[node as usize].doc_id,
                score: self.similarity(distance),
                source: HitSource::Dense,
            })
            .collect()
    }

    pub(crate) fn check_consistency(&self) -> std::result::Result<(), String> {
        if self.by_doc.len() != self.nodes.len() {
            return Err("document map and node list disagree".into());
        }
        if let Some(i) = self.nodes.iter().position(|n| n.neighbors.is_empty()) {
            return Err(format!("node {i} has no layers"));
        }
        let top = match self.entry_point {
            None if self.nodes.is_empty() => return Ok(()),
            None => return Err("graph has nodes but no entry point".into()),
            Some(e) if e as usize >= self.nodes.len() => return Err("entry point out of range".into()),
            Some(e) => self.nodes[e as usize].level(),
        };
        for (i, node) in self.nodes.iter().enumerate() {
            if node.level() > top {
                return Err(format!("node {i} sits above the entry point"));
            }
            if node.vector.len() != self.dimension {
                return Err(format!("node {i} has dimension {} (expected {})", node.vector.len(), self.dimension));
            }
            if self.by_doc.get(&node.doc_id) != Some(&(i as u32)) {
                return Err(format!("node {i} is not mapped from document {}", node.doc_id));
            }
            for (layer, links) in node.neighbors.iter().enumerate() {
                if links.len() > self.bound(layer) {
                    return Err(format!("node {i} exceeds the neighbor bound on layer {layer}"));
                }
                for &n in links {
                    let Some(target) = self.nodes.get(n as usize) else {
                        return Err(format!("node {i} links to missing node {n}"));
                    };
                    if target.level() < layer {
                        return Err(format!("node {i} links to node {n} on layer {layer} it does not reach"));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl DenseIndex {
    /// Drops every node's layer lists, leaving a graph that must fail validation.
    pub(crate) fn clear_layers(&mut self) {
        for node in &mut self.nodes {
            node.neighbors.clear();
        }
    }
}

//! On-disk snapshot layout.
//!
//! ```text
//! <root>/meta.json   format version, counts, embedder, analyzer, part digests
//! <root>/docs.bin    document store (bincode)
//! <root>/sparse.bin  inverted index (bincode)
//! <root>/dense.bin   HNSW graph and vectors (bincode)
//! ```
//!
//! A snapshot is written into a sibling staging directory and renamed into
//! place, so a reader never sees a half-written one.

use crate::bm25::SparseIndex;
use crate::config::{FusionParams, Metric};
use crate::error::IndexCorruptionError;
use crate::hnsw::DenseIndex;
use crate::index::DocumentStore;
use crate::snapshot::Snapshot;
use crate::tokenizer::{Analyzer, AnalyzerConfig};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, info};

pub const SNAPSHOT_VERSION: u32 = 1;

const DOCS_PART: &str = "docs.bin";
const SPARSE_PART: &str = "sparse.bin";
const DENSE_PART: &str = "dense.bin";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub num_docs: u32,
    pub num_embedded: u32,
    pub dimension: usize,
    pub metric: Metric,
    pub embedder: String,
    pub analyzer: AnalyzerConfig,
    pub fusion: FusionParams,
    /// Part file name to hex SHA-1 of its bytes.
    pub digests: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    fn meta(&self) -> PathBuf { self.root.join("meta.json") }
    fn part(&self, name: &str) -> PathBuf { self.root.join(name) }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self.root.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "index".into());
        self.root.with_file_name(format!(".{name}.{suffix}"))
    }
}

fn sha1_hex(bytes: &[u8]) -> String {
    Sha1::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut f = File::create(path)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Encode(e.to_string()))
}

/// Write `snapshot` to `root`, replacing whatever snapshot is there.
pub fn save_snapshot<P: AsRef<Path>>(root: P, snapshot: &Snapshot) -> Result<MetaFile> {
    let paths = IndexPaths::new(root);
    let staging = IndexPaths::new(paths.sibling("staging"));
    if staging.root.exists() {
        fs::remove_dir_all(&staging.root)?;
    }
    if let Some(parent) = staging.root.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::create_dir_all(&staging.root)?;

    let mut digests = BTreeMap::new();
    let parts = [
        (DOCS_PART, encode(&snapshot.store)?),
        (SPARSE_PART, encode(&snapshot.sparse)?),
        (DENSE_PART, encode(&snapshot.dense)?),
    ];
    for (name, bytes) in &parts {
        write_file(&staging.part(name), bytes)?;
        digests.insert(name.to_string(), sha1_hex(bytes));
        debug!(part = name, bytes = bytes.len(), "wrote snapshot part");
    }

    let meta = MetaFile {
        version: SNAPSHOT_VERSION,
        created_at: snapshot.created_at,
        num_docs: snapshot.store.len() as u32,
        num_embedded: snapshot.dense.len() as u32,
        dimension: snapshot.dense.dimension(),
        metric: snapshot.dense.metric(),
        embedder: snapshot.embedder.clone(),
        analyzer: snapshot.analyzer.config(),
        fusion: snapshot.fusion,
        digests,
    };
    let json = serde_json::to_string_pretty(&meta).map_err(|e| Error::Encode(e.to_string()))?;
    write_file(&staging.meta(), json.as_bytes())?;

    swap_into_place(&staging.root, &paths.root, &paths.sibling("old"))?;
    info!(root = %paths.root.display(), docs = meta.num_docs, embedded = meta.num_embedded, "snapshot saved");
    Ok(meta)
}

/// Move `staging` to `root`, parking any existing snapshot at `retired` until the
/// swap succeeds. A failed swap puts the previous snapshot back.
fn swap_into_place(staging: &Path, root: &Path, retired: &Path) -> std::io::Result<()> {
    if retired.exists() {
        fs::remove_dir_all(retired)?;
    }
    let had_previous = root.exists();
    if had_previous {
        fs::rename(root, retired)?;
    }
    if let Err(e) = fs::rename(staging, root) {
        if had_previous {
            fs::rename(retired, root)?;
        }
        return Err(e);
    }
    if retired.exists() {
        fs::remove_dir_all(retired)?;
    }
    Ok(())
}

fn read_part(paths: &IndexPaths, name: &str) -> std::result::Result<Vec<u8>, IndexCorruptionError> {
    let mut f = File::open(paths.part(name)).map_err(|e| match e.kind() {
        ErrorKind::NotFound => IndexCorruptionError::MissingPart(name.to_string()),
        _ => IndexCorruptionError::Io(e),
    })?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Read and version-check `meta.json` without touching the binary parts.
pub fn load_meta<P: AsRef<Path>>(root: P) -> std::result::Result<MetaFile, IndexCorruptionError> {
    let paths = IndexPaths::new(root);
    let bytes = read_part(&paths, "meta.json")?;
    let decode_err = |e: serde_json::Error| IndexCorruptionError::Decode { part: "meta.json".into(), reason: e.to_string() };
    let probe: VersionProbe = serde_json::from_slice(&bytes).map_err(decode_err)?;
    if probe.version != SNAPSHOT_VERSION {
        return Err(IndexCorruptionError::UnsupportedVersion { found: probe.version, expected: SNAPSHOT_VERSION });
    }
    serde_json::from_slice(&bytes).map_err(decode_err)
}

fn load_part<T: DeserializeOwned>(paths: &IndexPaths, meta: &MetaFile, name: &str) -> std::result::Result<T, IndexCorruptionError> {
    let bytes = read_part(paths, name)?;
    let expected = meta.digests.get(name).ok_or_else(|| IndexCorruptionError::MissingPart(format!("{name} digest")))?;
    if sha1_hex(&bytes) != *expected {
        return Err(IndexCorruptionError::DigestMismatch { part: name.to_string() });
    }
    bincode::deserialize(&bytes).map_err(|e| IndexCorruptionError::Decode { part: name.to_string(), reason: e.to_string() })
}

/// Load and fully validate the snapshot at `root`. Any failure is an
/// [`IndexCorruptionError`]; nothing partial is returned.
pub fn load_snapshot<P: AsRef<Path>>(root: P) -> Result<Snapshot> {
    let paths = IndexPaths::new(root);
    let meta = load_meta(&paths.root)?;
    let store: DocumentStore = load_part(&paths, &meta, DOCS_PART)?;
    let sparse: SparseIndex = load_part(&paths, &meta, SPARSE_PART)?;
    let dense: DenseIndex = load_part(&paths, &meta, DENSE_PART)?;

    let inconsistent = |msg: String| Error::Corruption(IndexCorruptionError::Inconsistent(msg));
    if store.len() != meta.num_docs as usize {
        return Err(inconsistent(format!("meta records {} documents, store holds {}", meta.num_docs, store.len())));
    }
    if dense.len() != meta.num_embedded as usize {
        return Err(inconsistent(format!("meta records {} embedded documents, graph holds {}", meta.num_embedded, dense.len())));
    }
    if dense.dimension() != meta.dimension {
        return Err(inconsistent(format!("meta dimension {} does not match graph dimension {}", meta.dimension, dense.dimension())));
    }

    let snapshot = Snapshot {
        analyzer: Analyzer::new(meta.analyzer),
        store,
        sparse,
        dense,
        fusion: meta.fusion,
        embedder: meta.embedder,
        created_at: meta.created_at,
    };
    snapshot.validate()?;
    info!(root = %paths.root.display(), docs = snapshot.store.len(), embedded = snapshot.dense.len(), "snapshot loaded");
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Bm25Params, HnswParams};
    use crate::index::{Document, IssueState};
    use crate::tokenizer::tokenize;
    use time::macros::datetime;

    fn sample() -> Snapshot {
        let mut store = DocumentStore::new();
        let mut sparse = SparseIndex::new(Bm25Params::default());
        let mut dense = DenseIndex::new(3, HnswParams::default());
        let titles = ["Parser crash on empty input", "UI glitch in dark mode", "Slow startup"];
        for (i, title) in titles.iter().enumerate() {
            let id = i as u32;
            let doc = Document {
                id,
                title: title.to_string(),
                url: format!("https://github.com/o/r/issues/{}", i + 1),
                description: String::new(),
                creator: "octocat".into(),
                created_at: datetime!(2023-09-18 12:00 UTC),
                state: IssueState::Open,
                labels: vec![],
            };
            sparse.add(id, &tokenize(&doc.indexed_text())).unwrap();
            if i < 2 {
                let mut v = vec![0.0; 3];
                v[i] = 1.0;
                dense.add(id, v).unwrap();
            }
            store.push(doc).unwrap();
        }
        Snapshot {
            analyzer: Analyzer::default(),
            store,
            sparse,
            dense,
            fusion: FusionParams::default(),
            embedder: "test".into(),
            created_at: datetime!(2023-09-20 00:00 UTC),
        }
    }

    #[test]
    fn save_then_load_preserves_answers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("index");
        let original = sample();
        let meta = save_snapshot(&root, &original).unwrap();
        assert_eq!(meta.num_docs, 3);
        assert_eq!(meta.num_embedded, 2);

        let loaded = load_snapshot(&root).unwrap();
        assert_eq!(loaded.embedder(), "test");
        assert_eq!(loaded.created_at(), original.created_at());
        assert_eq!(loaded.bm25_search("parser", 3).unwrap(), original.bm25_search("parser", 3).unwrap());
        assert_eq!(loaded.dense_search(&[1.0, 0.0, 0.0], 2).unwrap(), original.dense_search(&[1.0, 0.0, 0.0], 2).unwrap());
    }

    #[test]
    fn overwrite_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("index");
        save_snapshot(&root, &sample()).unwrap();
        let mut second = sample();
        second.embedder = "second".into();
        save_snapshot(&root, &second).unwrap();
        assert_eq!(load_snapshot(&root).unwrap().embedder(), "second");
        assert!(!dir.path().join(".index.staging").exists());
        assert!(!dir.path().join(".index.old").exists());
    }

    #[test]
    fn tampered_part_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        save_snapshot(dir.path(), &sample()).unwrap();
        let path = dir.path().join(SPARSE_PART);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();
        assert!(matches!(
            load_snapshot(dir.path()),
            Err(Error::Corruption(IndexCorruptionError::DigestMismatch { .. }))
        ));
    }

    #[test]
    fn missing_part_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        save_snapshot(dir.path(), &sample()).unwrap();
        fs::remove_file(dir.path().join(DENSE_PART)).unwrap();
        assert!(matches!(
            load_snapshot(dir.path()),
            Err(Error::Corruption(IndexCorruptionError::MissingPart(_)))
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        save_snapshot(dir.path(), &sample()).unwrap();
        let meta_path = dir.path().join("meta.json");
        let mut meta: serde_json::Value = serde_json::from_slice(&fs::read(&meta_path).unwrap()).unwrap();
        meta["version"] = serde_json::json!(SNAPSHOT_VERSION + 1);
        fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();
        assert!(matches!(
            load_snapshot(dir.path()),
            Err(Error::Corruption(IndexCorruptionError::UnsupportedVersion { found: 2, expected: 1 }))
        ));
    }

    #[test]
    fn meta_counts_are_cross_checked() {
        let dir = tempfile::tempdir().unwrap();
        save_snapshot(dir.path(), &sample()).unwrap();
        let meta_path = dir.path().join("meta.json");
        let mut meta: serde_json::Value = serde_json::from_slice(&fs::read(&meta_path).unwrap()).unwrap();
        meta["num_docs"] = serde_json::json!(7);
        fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();
        assert!(matches!(
            load_snapshot(dir.path()),
            Err(Error::Corruption(IndexCorruptionError::Inconsistent(_)))
        ));
    }

    #[test]
    fn structurally_broken_graph_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut broken = sample();
        broken.dense.clear_layers();
        save_snapshot(dir.path(), &broken).unwrap();
        assert!(matches!(
            load_snapshot(dir.path()),
            Err(Error::Corruption(IndexCorruptionError::Inconsistent(_)))
        ));
    }

    #[test]
    fn failed_swap_restores_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("index");
        save_snapshot(&root, &sample()).unwrap();
        let missing_staging = dir.path().join("never-written");
        let retired = dir.path().join(".index.old");
        assert!(swap_into_place(&missing_staging, &root, &retired).is_err());
        assert!(!retired.exists());
        assert_eq!(load_snapshot(&root).unwrap().embedder(), "test");
    }
}

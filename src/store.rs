// ===============================
// src/store.rs (JSON files under DATA_DIR)
// ===============================
//
// Upstream jobs drop their outputs here in storage (dash) notation:
//   scores.json         [ScoredSymbol]          required
//   score_index.json    [symbol]                optional, defaults to scores.json symbols
//   exclusion_list.json [symbol]                optional
//   betas.json          {symbol: beta}          optional
//   wash_sale.json      [symbol]                written by the wash-sale step
//   paper_state.json    PaperSnapshot           paper broker seed
// Everything returned from here is in broker (dot) notation.
//
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::domain::ScoredSymbol;
use crate::gateway::PaperSnapshot;
use crate::symbol;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("{path}: {source}")]
    Json { path: String, source: serde_json::Error },
}

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    pub fn path(&self, name: &str) -> PathBuf { self.dir.join(name) }

    async fn read_opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let path = self.path(name);
        let raw = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path: path_str(&path), source }),
        };
        serde_json::from_slice(&raw).map(Some).map_err(|source| StoreError::Json { path: path_str(&path), source })
    }

    async fn read_required<T: DeserializeOwned>(&self, name: &str) -> Result<T, StoreError> {
        let path = self.path(name);
        self.read_opt(name).await?.ok_or_else(|| StoreError::Io {
            path: path_str(&path),
            source: std::io::Error::new(ErrorKind::NotFound, "required input missing"),
        })
    }

    pub async fn load_scores(&self) -> Result<Vec<ScoredSymbol>, StoreError> {
        let mut rows: Vec<ScoredSymbol> = self.read_required("scores.json").await?;
        for r in rows.iter_mut() {
            r.symbol = symbol::to_broker(&r.symbol);
        }
        Ok(rows)
    }

    /// Symbols with a score record, used by the verification gate.
    pub async fn load_score_index(&self, scores: &[ScoredSymbol]) -> Result<HashSet<String>, StoreError> {
        Ok(match self.read_opt::<Vec<String>>("score_index.json").await? {
            Some(rows) => rows.iter().map(|s| symbol::to_broker(s)).collect(),
            None => scores.iter().map(|s| s.symbol.clone()).collect(),
        })
    }

    pub async fn load_exclusions(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<String> = self.read_opt("exclusion_list.json").await?.unwrap_or_default();
        Ok(rows.iter().map(|s| symbol::to_broker(s)).collect())
    }

    pub async fn load_betas(&self) -> Result<HashMap<String, f64>, StoreError> {
        let rows: std::collections::HashMap<String, f64> = self.read_opt("betas.json").await?.unwrap_or_default();
        Ok(rows.into_iter().map(|(k, v)| (symbol::to_broker(&k), v)).collect())
    }

    pub async fn load_wash_sale(&self) -> Result<BTreeSet<String>, StoreError> {
        let rows: Vec<String> = self.read_opt("wash_sale.json").await?.unwrap_or_default();
        Ok(rows.iter().map(|s| symbol::to_broker(s)).collect())
    }

    /// Replace the persisted set wholesale (write temp file, then rename).
    pub async fn save_wash_sale(&self, symbols: &BTreeSet<String>) -> Result<(), StoreError> {
        let rows: Vec<String> = symbols.iter().map(|s| symbol::to_storage(s)).collect();
        let path = self.path("wash_sale.json");
        let tmp = self.path("wash_sale.json.tmp");
        let body = serde_json::to_vec_pretty(&rows).map_err(|source| StoreError::Json { path: path_str(&path), source })?;

        fs::create_dir_all(&self.dir).await.map_err(|source| StoreError::Io { path: path_str(&self.dir), source })?;
        fs::write(&tmp, body).await.map_err(|source| StoreError::Io { path: path_str(&tmp), source })?;
        fs::rename(&tmp, &path).await.map_err(|source| StoreError::Io { path: path_str(&path), source })?;
        info!(path = %path_str(&path), count = rows.len(), "wash sale set saved");
        Ok(())
    }

    pub async fn load_paper_snapshot(&self) -> Result<PaperSnapshot, StoreError> {
        Ok(self.read_opt("paper_state.json").await?.unwrap_or_default())
    }
}

fn path_str(p: &Path) -> String { p.display().to_string() }

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wash_sale_round_trip_uses_dash_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let set: BTreeSet<String> = ["BRK.B".to_string(), "AAPL".to_string()].into_iter().collect();
        store.save_wash_sale(&set).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("wash_sale.json")).unwrap();
        assert!(raw.contains("BRK-B"));
        assert_eq!(store.load_wash_sale().await.unwrap(), set);
    }

    #[tokio::test]
    async fn optional_inputs_default_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.load_exclusions().await.unwrap().is_empty());
        assert!(store.load_betas().await.unwrap().is_empty());
        assert!(store.load_wash_sale().await.unwrap().is_empty());
        assert!(store.load_scores().await.is_err());
    }

    #[tokio::test]
    async fn scores_and_index_converted_to_broker_notation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("scores.json"),
            r#"[{"symbol":"BRK-B","core_score":1.5,"quality_score":1,"growth_score":2,"sector":"Financials"}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("betas.json"), r#"{"BRK-B": 0.9}"#).unwrap();
        let store = FileStore::new(dir.path());

        let scores = store.load_scores().await.unwrap();
        assert_eq!(scores[0].symbol, "BRK.B");
        let idx = store.load_score_index(&scores).await.unwrap();
        assert!(idx.contains("BRK.B"));
        assert_eq!(store.load_betas().await.unwrap().get("BRK.B"), Some(&0.9));
    }

    #[tokio::test]
    async fn malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("exclusion_list.json"), "{not json").unwrap();
        let store = FileStore::new(dir.path());
        assert!(matches!(store.load_exclusions().await, Err(StoreError::Json { .. })));
    }
}

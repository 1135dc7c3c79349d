//! Append-only storage of scan results.
//!
//! Results are keyed by `(line, scan, point)`: the signal line (`"probe"`,
//! `"signal"`, ...), the scan index and the index along the swept variable.
//! A key is written once; the mean across scans is always recomputed from
//! the stored per-scan values.

use ndarray::Array1;
use pp_core::error::{PpError, PpResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanKey {
    pub line: String,
    pub scan: usize,
    pub point: usize,
}

impl ScanKey {
    pub fn new(line: impl Into<String>, scan: usize, point: usize) -> Self {
        Self {
            line: line.into(),
            scan,
            point,
        }
    }
}

impl std::fmt::Display for ScanKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.line, self.scan, self.point)
    }
}

pub trait ScanStore: Send {
    /// Store `data` under `key`. Fails if the key already exists.
    fn append(&mut self, key: ScanKey, data: Array1<f64>) -> PpResult<()>;

    fn get(&self, key: &ScanKey) -> Option<&Array1<f64>>;

    /// Every stored scan of `(line, point)`, ordered by scan index.
    fn scans(&self, line: &str, point: usize) -> Vec<&Array1<f64>>;

    /// Element-wise mean over all scans of `(line, point)`.
    fn mean_across_scans(&self, line: &str, point: usize) -> Option<Array1<f64>> {
        let scans = self.scans(line, point);
        let first = scans.first()?;
        let mut sum = Array1::<f64>::zeros(first.len());
        for data in &scans {
            if data.len() != sum.len() {
                return None;
            }
            sum += *data;
        }
        Some(sum / scans.len() as f64)
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush and release outputs. Later appends fail.
    fn close(&mut self) -> PpResult<()>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<ScanKey, Array1<f64>>,
    closed: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, key: ScanKey, data: Array1<f64>) -> PpResult<()> {
        if self.entries.contains_key(&key) {
            return Err(PpError::Storage(format!("{} already written", key)));
        }
        self.entries.insert(key, data);
        Ok(())
    }
}

impl ScanStore for MemoryStore {
    fn append(&mut self, key: ScanKey, data: Array1<f64>) -> PpResult<()> {
        if self.closed {
            return Err(PpError::Storage("store is closed".into()));
        }
        self.insert(key, data)
    }

    fn get(&self, key: &ScanKey) -> Option<&Array1<f64>> {
        self.entries.get(key)
    }

    fn scans(&self, line: &str, point: usize) -> Vec<&Array1<f64>> {
        self.entries
            .iter()
            .filter(|(key, _)| key.line == line && key.point == point)
            .map(|(_, data)| data)
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn close(&mut self) -> PpResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Record {
    #[serde(flatten)]
    key: ScanKey,
    data: Vec<f64>,
}

/// File-backed store writing one JSON object per line.
///
/// Opening an existing file replays it, so means can be recomputed after a
/// restart and already written keys stay protected.
pub struct JsonLinesStore {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    index: MemoryStore,
}

impl JsonLinesStore {
    /// Open `<dir>/<stem>.jsonl`, creating `dir` if needed.
    pub fn open(dir: impl AsRef<Path>, stem: &str) -> PpResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.jsonl", stem));

        let mut index = MemoryStore::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: Record = serde_json::from_str(&line)?;
                index.insert(record.key, Array1::from(record.data))?;
            }
            tracing::debug!(path = %path.display(), entries = index.len(), "Replayed scan store");
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScanStore for JsonLinesStore {
    fn append(&mut self, key: ScanKey, data: Array1<f64>) -> PpResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PpError::Storage(format!("{} is closed", self.path.display())))?;
        if self.index.get(&key).is_some() {
            return Err(PpError::Storage(format!("{} already written", key)));
        }

        let record = Record {
            key: key.clone(),
            data: data.to_vec(),
        };
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        self.index.insert(key, data)
    }

    fn get(&self, key: &ScanKey) -> Option<&Array1<f64>> {
        self.index.get(key)
    }

    fn scans(&self, line: &str, point: usize) -> Vec<&Array1<f64>> {
        self.index.scans(line, point)
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn close(&mut self) -> PpResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            tracing::debug!(path = %self.path.display(), "Scan store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_append_only() {
        let mut store = MemoryStore::new();
        store
            .append(ScanKey::new("signal", 0, 0), array![1.0, 2.0])
            .unwrap();
        let err = store
            .append(ScanKey::new("signal", 0, 0), array![9.0, 9.0])
            .unwrap_err();
        assert!(matches!(err, PpError::Storage(_)));
        assert_eq!(
            store.get(&ScanKey::new("signal", 0, 0)),
            Some(&array![1.0, 2.0])
        );
    }

    #[test]
    fn test_mean_across_scans() {
        let mut store = MemoryStore::new();
        store.append(ScanKey::new("signal", 0, 3), array![1.0, 4.0]).unwrap();
        store.append(ScanKey::new("signal", 1, 3), array![3.0, 8.0]).unwrap();
        store.append(ScanKey::new("signal", 0, 4), array![100.0, 100.0]).unwrap();
        store.append(ScanKey::new("probe", 0, 3), array![50.0, 50.0]).unwrap();

        assert_eq!(store.scans("signal", 3).len(), 2);
        assert_eq!(store.mean_across_scans("signal", 3), Some(array![2.0, 6.0]));
        assert_eq!(store.mean_across_scans("signal", 9), None);
    }

    #[test]
    fn test_closed_store_rejects_appends() {
        let mut store = MemoryStore::new();
        store.close().unwrap();
        assert!(store.append(ScanKey::new("probe", 0, 0), array![1.0]).is_err());
    }

    #[test]
    fn test_json_lines_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = JsonLinesStore::open(dir.path(), "run.pp").unwrap();
            store.append(ScanKey::new("signal", 0, 0), array![1.0, 2.0]).unwrap();
            store.append(ScanKey::new("signal", 1, 0), array![3.0, 4.0]).unwrap();
            store.close().unwrap();
            assert!(store.append(ScanKey::new("signal", 2, 0), array![0.0, 0.0]).is_err());
        }

        let mut reopened = JsonLinesStore::open(dir.path(), "run.pp").unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.mean_across_scans("signal", 0), Some(array![2.0, 3.0]));
        assert!(reopened
            .append(ScanKey::new("signal", 0, 0), array![0.0, 0.0])
            .is_err());
        reopened.append(ScanKey::new("signal", 2, 0), array![5.0, 6.0]).unwrap();
        assert_eq!(reopened.mean_across_scans("signal", 0), Some(array![3.0, 4.0]));

        let text = std::fs::read_to_string(reopened.path()).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("\"line\":\"signal\""));
    }
}

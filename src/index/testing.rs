use std::path::Path;

use anyhow::{Result, bail};

use super::{FlatIndex, IndexKind, Metric, Neighbor, VectorIndex};

/// 行数达到 `fail_after` 之后的 add 全部失败
pub(crate) struct FailingIndex {
    pub inner: FlatIndex,
    pub fail_after: usize,
}

impl FailingIndex {
    pub fn new(metric: Metric, dim: usize, fail_after: usize) -> Self {
        Self { inner: FlatIndex::new(metric, dim), fail_after }
    }
}

impl VectorIndex for FailingIndex {
    fn dim(&self) -> usize {
        self.inner.dim()
    }
    fn metric(&self) -> Metric {
        self.inner.metric()
    }
    fn kind(&self) -> IndexKind {
        self.inner.kind()
    }
    fn len(&self) -> usize {
        self.inner.len()
    }
    fn add(&mut self, vector: &[f32]) -> Result<u64> {
        if self.inner.len() >= self.fail_after {
            bail!("磁盘已满");
        }
        self.inner.add(vector)
    }
    fn remove_last(&mut self) -> Result<()> {
        self.inner.remove_last()
    }
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.inner.search(query, k)
    }
    fn vector(&self, row: u64) -> Option<Vec<f32>> {
        self.inner.vector(row)
    }
    fn save(&self, path: &Path) -> Result<()> {
        self.inner.save(path)
    }
}

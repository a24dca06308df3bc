use std::path::Path;

use anyhow::{Context, Result, ensure};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use super::{IndexKind, Metric, Neighbor, VectorIndex, pad_neighbors};

/// usearch 的 HNSW 索引，行号作为 key
pub struct HnswIndex {
    index: Index,
    metric: Metric,
    dim: usize,
    len: usize,
}

impl HnswIndex {
    pub fn new(metric: Metric, dim: usize) -> Result<Self> {
        let options = IndexOptions {
            dimensions: dim,
            metric: match metric {
                Metric::InnerProduct => MetricKind::IP,
                Metric::L2Squared => MetricKind::L2sq,
            },
            quantization: ScalarKind::F32,
            // usearch 默认参数
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            ..Default::default()
        };
        let index = Index::new(&options)?;
        Ok(Self { index, metric, dim, len: 0 })
    }

    pub fn open(metric: Metric, dim: usize, path: &Path) -> Result<Self> {
        let mut s = Self::new(metric, dim)?;
        let path = path.to_str().context("索引路径不是有效的 UTF-8")?;
        s.index.load(path)?;
        ensure!(s.index.dimensions() == dim, "索引维数不正确: {} != {}", s.index.dimensions(), dim);
        s.len = s.index.size();
        Ok(s)
    }

    /// usearch 返回的是距离，这里转换回度量的原始分数
    fn to_raw(&self, distance: f32) -> f32 {
        match self.metric {
            Metric::InnerProduct => 1. - distance,
            Metric::L2Squared => distance,
        }
    }
}

impl VectorIndex for HnswIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Hnsw
    }

    fn len(&self) -> usize {
        self.len
    }

    fn add(&mut self, vector: &[f32]) -> Result<u64> {
        ensure!(vector.len() == self.dim, "向量维数不正确: {} != {}", vector.len(), self.dim);
        if self.index.size() >= self.index.capacity() {
            self.index.reserve((self.index.capacity() * 2).max(1024))?;
        }
        let row = self.len as u64;
        self.index.add(row, vector)?;
        self.len += 1;
        Ok(row)
    }

    fn remove_last(&mut self) -> Result<()> {
        ensure!(self.len > 0, "索引为空");
        self.index.remove(self.len as u64 - 1)?;
        self.len -= 1;
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        ensure!(query.len() == self.dim, "查询向量维数不正确: {} != {}", query.len(), self.dim);
        let k = k.min(self.len);
        if k == 0 {
            return Ok(vec![]);
        }
        let matches = self.index.search(query, k)?;
        let neighbors = matches
            .keys
            .iter()
            .zip(&matches.distances)
            .map(|(&key, &distance)| Neighbor { row: key as i64, raw: self.to_raw(distance) })
            .collect();
        Ok(pad_neighbors(neighbors, k, self.len, self.metric))
    }

    fn vector(&self, row: u64) -> Option<Vec<f32>> {
        if row as usize >= self.len {
            return None;
        }
        let mut buf = vec![0f32; self.dim];
        match self.index.get(row, &mut buf) {
            Ok(n) if n > 0 => Some(buf),
            _ => None,
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let path = path.to_str().context("索引路径不是有效的 UTF-8")?;
        self.index.save(path)?;
        Ok(())
    }
}

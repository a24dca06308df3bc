use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Result, bail, ensure};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{IndexKind, Metric, Neighbor, VectorIndex, pad_neighbors};

const MAGIC: [u8; 4] = *b"PSFL";

#[derive(Debug, Serialize, Deserialize)]
struct FlatHeader {
    magic: [u8; 4],
    dim: u32,
    metric: Metric,
    len: u64,
}

/// 暴力搜索索引，所有向量连续存放在一块内存中
pub struct FlatIndex {
    metric: Metric,
    dim: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(metric: Metric, dim: usize) -> Self {
        Self { metric, dim, data: vec![] }
    }

    /// 文件格式：bincode 编码的头部，后接按行排列的 f32 数据
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let header: FlatHeader = bincode::deserialize_from(&mut reader)?;
        ensure!(header.magic == MAGIC, "{} 不是有效的索引文件", path.display());

        let mut bytes = vec![];
        reader.read_to_end(&mut bytes)?;
        let expected = header.len as usize * header.dim as usize * size_of::<f32>();
        if bytes.len() != expected {
            bail!("索引文件长度不正确: {} != {}", bytes.len(), expected);
        }

        Ok(Self {
            metric: header.metric,
            dim: header.dim as usize,
            data: bytemuck::pod_collect_to_vec(&bytes),
        })
    }

    fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }
}

impl VectorIndex for FlatIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn len(&self) -> usize {
        self.data.len() / self.dim.max(1)
    }

    fn add(&mut self, vector: &[f32]) -> Result<u64> {
        ensure!(vector.len() == self.dim, "向量维数不正确: {} != {}", vector.len(), self.dim);
        let row = self.len() as u64;
        self.data.extend_from_slice(vector);
        Ok(row)
    }

    fn remove_last(&mut self) -> Result<()> {
        ensure!(!self.is_empty(), "索引为空");
        let len = self.data.len() - self.dim;
        self.data.truncate(len);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        ensure!(query.len() == self.dim, "查询向量维数不正确: {} != {}", query.len(), self.dim);
        let metric = self.metric;

        let mut scored = self
            .data
            .par_chunks_exact(self.dim.max(1))
            .enumerate()
            .map(|(row, v)| Neighbor { row: row as i64, raw: metric.raw(query, v) })
            .collect::<Vec<_>>();

        let order = |a: &Neighbor, b: &Neighbor| match metric {
            Metric::InnerProduct => b.raw.total_cmp(&a.raw),
            Metric::L2Squared => a.raw.total_cmp(&b.raw),
        };
        // 只对前 k 个排序
        let k = k.min(scored.len());
        if k == 0 {
            return Ok(vec![]);
        }
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, order);
            scored.truncate(k);
        }
        scored.sort_by(order);

        Ok(pad_neighbors(scored, k, self.len(), metric))
    }

    fn vector(&self, row: u64) -> Option<Vec<f32>> {
        let row = row as usize;
        (row < self.len()).then(|| self.row(row).to_vec())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        let header = FlatHeader {
            magic: MAGIC,
            dim: self.dim as u32,
            metric: self.metric,
            len: self.len() as u64,
        };
        bincode::serialize_into(&mut writer, &header)?;
        writer.write_all(bytemuck::cast_slice(&self.data))?;
        writer.flush()?;
        Ok(())
    }
}

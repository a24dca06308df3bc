//! 单个向量空间的近邻索引
//!
//! 行号即插入顺序，从 0 开始连续递增。搜索最多返回 `min(k, len)` 个结果，
//! 后端返回不足时用行号为 -1 的占位补齐。

mod flat;
mod hnsw;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::path::Path;

use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub use self::flat::FlatIndex;
pub use self::hnsw::HnswIndex;
use crate::utils::{dot, l2_squared};

/// 占位结果的行号
pub const SENTINEL_ROW: i64 = -1;

/// 向量比较方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Metric {
    /// 内积，单位向量下等价于余弦相似度，越大越相似
    #[serde(rename = "ip")]
    #[value(name = "ip")]
    InnerProduct,
    /// 欧氏距离的平方，越小越相似
    #[serde(rename = "l2")]
    #[value(name = "l2")]
    L2Squared,
}

impl Metric {
    /// 计算两个向量在该度量下的原始分数
    pub fn raw(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::InnerProduct => dot(a, b),
            Metric::L2Squared => l2_squared(a, b),
        }
    }

    /// 将原始分数转换为越大越相似的相似度
    pub fn similarity(self, raw: f32) -> f32 {
        match self {
            Metric::InnerProduct => raw.clamp(-1., 1.),
            Metric::L2Squared => 1. - raw,
        }
    }

    /// a 是否比 b 更相似
    pub fn is_better(self, a: f32, b: f32) -> bool {
        match self {
            Metric::InnerProduct => a > b,
            Metric::L2Squared => a < b,
        }
    }

    /// 最差的原始分数，用于占位结果
    pub fn worst(self) -> f32 {
        match self {
            Metric::InnerProduct => f32::NEG_INFINITY,
            Metric::L2Squared => f32::INFINITY,
        }
    }

    /// 分数约定的文字描述，写入索引清单
    pub fn convention(self) -> &'static str {
        match self {
            Metric::InnerProduct => "inner_product",
            Metric::L2Squared => "squared_l2",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::InnerProduct => write!(f, "ip"),
            Metric::L2Squared => write!(f, "l2"),
        }
    }
}

/// 索引实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// 精确搜索，逐个比较
    Flat,
    /// usearch 的 HNSW 图索引
    Hnsw,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Flat => write!(f, "flat"),
            IndexKind::Hnsw => write!(f, "hnsw"),
        }
    }
}

/// 一个近邻结果，`raw` 为度量的原始分数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row: i64,
    pub raw: f32,
}

impl Neighbor {
    pub fn sentinel(metric: Metric) -> Self {
        Self { row: SENTINEL_ROW, raw: metric.worst() }
    }
}

pub trait VectorIndex: Send + Sync {
    fn dim(&self) -> usize;

    fn metric(&self) -> Metric;

    fn kind(&self) -> IndexKind;

    /// 已添加的向量数量
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 追加一个向量，返回它的行号
    fn add(&mut self, vector: &[f32]) -> Result<u64>;

    /// 撤销最后一次追加
    fn remove_last(&mut self) -> Result<()>;

    /// 搜索最相似的 k 个向量，返回 `min(k, len)` 个结果，按相似度降序，
    /// 后端返回不足时用占位结果补齐
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    /// 读取某一行的向量
    fn vector(&self, row: u64) -> Option<Vec<f32>>;

    fn save(&self, path: &Path) -> Result<()>;
}

/// 创建一个空索引
pub fn new_index(kind: IndexKind, metric: Metric, dim: usize) -> Result<Box<dyn VectorIndex>> {
    Ok(match kind {
        IndexKind::Flat => Box::new(FlatIndex::new(metric, dim)),
        IndexKind::Hnsw => Box::new(HnswIndex::new(metric, dim)?),
    })
}

/// 从文件加载索引
pub fn open_index(
    kind: IndexKind,
    metric: Metric,
    dim: usize,
    path: &Path,
) -> Result<Box<dyn VectorIndex>> {
    Ok(match kind {
        IndexKind::Flat => Box::new(FlatIndex::open(path)?),
        IndexKind::Hnsw => Box::new(HnswIndex::open(metric, dim, path)?),
    })
}

/// 用占位结果把搜索结果补齐到 `min(k, len)` 个
fn pad_neighbors(mut neighbors: Vec<Neighbor>, k: usize, len: usize, metric: Metric) -> Vec<Neighbor> {
    let k = k.min(len);
    neighbors.truncate(k);
    neighbors.resize(k, Neighbor::sentinel(metric));
    neighbors
}

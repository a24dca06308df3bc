use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use image::{DynamicImage, GenericImageView};
use log::debug;
use serde::Serialize;
use thiserror::Error;
use tokio::task::block_in_place;

use crate::extractor::{FeatureExtractor, ImageEmbedding};
use crate::loader::{AssetMetadata, RemoteFetcher, decode_image};
use crate::metrics;
pub use crate::store::Space;
use crate::store::{DualIndex, StoreError};
use crate::utils::l2_normalize;

/// 单次查询允许返回的最大结果数
pub const MAX_TOP_K: usize = 1000;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("查询向量为空")]
    EmptyQuery,
    #[error("top_k 必须在 1 到 {MAX_TOP_K} 之间")]
    InvalidTopK,
    #[error("{} 空间的向量维数应为 {expected}，实际为 {actual}", .space.as_str())]
    DimensionMismatch { space: Space, expected: usize, actual: usize },
    #[error("查询向量包含非有限值或范数为 0")]
    InvalidVector,
    #[error("无法解码图片: {0}")]
    Decode(String),
    #[error("无法下载图片: {0}")]
    Fetch(String),
    #[error("特征提取失败: {0}")]
    Extraction(String),
    #[error("索引查询失败: {0}")]
    Index(String),
}

impl SearchError {
    /// 是否为调用方的输入错误
    pub fn is_invalid_input(&self) -> bool {
        !matches!(self, SearchError::Extraction(_) | SearchError::Index(_))
    }
}

/// 一个搜索结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    /// 越大越相似，内积约定下范围为 [-1, 1]
    pub similarity: f32,
    pub row: u64,
    #[serde(flatten)]
    pub record: AssetMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// 以图搜图的结果
    pub image_matches: Vec<Match>,
    /// 以图搜提示词的结果
    pub prompt_matches: Vec<Match>,
}

pub struct Searcher<E: FeatureExtractor = Box<dyn FeatureExtractor>> {
    index: RwLock<Arc<DualIndex>>,
    extractor: Mutex<E>,
}

impl<E: FeatureExtractor> Searcher<E> {
    pub fn new(index: DualIndex, extractor: E) -> Result<Self, StoreError> {
        check_dims(&index, &extractor)?;
        Ok(Self { index: RwLock::new(Arc::new(index)), extractor: Mutex::new(extractor) })
    }

    /// 当前使用的索引
    pub fn index(&self) -> Arc<DualIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 替换索引，正在进行的查询继续使用旧索引
    pub fn replace(&self, index: DualIndex) -> Result<(), StoreError> {
        {
            let extractor = self.extractor.lock().unwrap_or_else(|e| e.into_inner());
            check_dims(&index, &*extractor)?;
        }
        *self.index.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(index);
        Ok(())
    }

    /// 解码并计算图片特征，之后可以用 [`Searcher::search_vector`] 搜索
    pub fn embed_bytes(&self, bytes: &[u8]) -> Result<ImageEmbedding, SearchError> {
        let image = decode_image(bytes).map_err(|e| SearchError::Decode(format!("{e:#}")))?;
        let mut extractor = self.extractor.lock().unwrap_or_else(|e| e.into_inner());
        extractor.embed_image(&image).map_err(|e| SearchError::Extraction(format!("{e:#}")))
    }

    /// 用图片同时搜索图片空间和文本空间
    pub fn search_image(&self, image: &DynamicImage, top_k: usize) -> Result<SearchResult, SearchError> {
        check_top_k(top_k)?;
        let start = Instant::now();
        metrics::inc_search_count("image", Some(image.dimensions()));

        let embedding = {
            let mut extractor = self.extractor.lock().unwrap_or_else(|e| e.into_inner());
            extractor.embed_image(image).map_err(|e| SearchError::Extraction(format!("{e:#}")))?
        };

        let index = self.index();
        let image_matches = lookup(&index, Space::Image, &embedding.stacked, top_k)?;
        let prompt_matches = lookup(&index, Space::Prompt, &embedding.primary, top_k)?;

        let elapsed = start.elapsed().as_secs_f32();
        debug!("图片搜索耗时 {:.2}ms", elapsed * 1000.);
        metrics::inc_search_duration("image", elapsed);
        Ok(SearchResult { image_matches, prompt_matches })
    }

    /// 解码后搜索
    pub fn search_bytes(&self, bytes: &[u8], top_k: usize) -> Result<SearchResult, SearchError> {
        check_top_k(top_k)?;
        let image = decode_image(bytes).map_err(|e| SearchError::Decode(format!("{e:#}")))?;
        self.search_image(&image, top_k)
    }

    /// 下载后搜索，下载使用与构建索引时相同的重试策略
    pub async fn search_url(
        &self,
        fetcher: &RemoteFetcher,
        url: &str,
        top_k: usize,
    ) -> Result<SearchResult, SearchError> {
        check_top_k(top_k)?;
        let bytes = fetcher.fetch_url(url).await.ok_or_else(|| SearchError::Fetch(url.to_string()))?;
        block_in_place(|| self.search_bytes(&bytes, top_k))
    }

    /// 直接用向量搜索某个空间，维数必须与该空间一致
    pub fn search_vector(&self, space: Space, vector: &[f32], top_k: usize) -> Result<Vec<Match>, SearchError> {
        check_top_k(top_k)?;
        if vector.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        let index = self.index();
        let expected = index.index(space).dim();
        if vector.len() != expected {
            return Err(SearchError::DimensionMismatch { space, expected, actual: vector.len() });
        }
        let mut query = vector.to_vec();
        if query.iter().any(|x| !x.is_finite()) || !l2_normalize(&mut query) {
            return Err(SearchError::InvalidVector);
        }

        let start = Instant::now();
        metrics::inc_search_count("vector", None);
        let matches = lookup(&index, space, &query, top_k)?;
        metrics::inc_search_duration("vector", start.elapsed().as_secs_f32());
        Ok(matches)
    }
}

fn check_top_k(top_k: usize) -> Result<(), SearchError> {
    if top_k == 0 || top_k > MAX_TOP_K {
        return Err(SearchError::InvalidTopK);
    }
    Ok(())
}

fn check_dims<E: FeatureExtractor + ?Sized>(index: &DualIndex, extractor: &E) -> Result<(), StoreError> {
    let image = index.index(Space::Image).dim();
    let prompt = index.index(Space::Prompt).dim();
    if image != extractor.stacked_dim() || prompt != extractor.primary_dim() {
        return Err(StoreError::Mismatch(format!(
            "索引维数 ({image}, {prompt}) 与特征提取器 ({}, {}) 不一致",
            extractor.stacked_dim(),
            extractor.primary_dim()
        )));
    }
    Ok(())
}

/// 查询一个空间，丢弃无效行号，转换为相似度并降序排列
fn lookup(index: &DualIndex, space: Space, query: &[f32], top_k: usize) -> Result<Vec<Match>, SearchError> {
    let metric = index.index(space).metric();
    let neighbors =
        index.search(space, query, top_k).map_err(|e| SearchError::Index(e.to_string()))?;

    let mut matches = neighbors
        .into_iter()
        .filter(|n| n.row >= 0)
        .filter_map(|n| {
            let record = index.record(n.row as u64)?;
            Some(Match {
                similarity: metric.similarity(n.raw),
                row: record.row,
                record: record.meta.clone(),
            })
        })
        .collect::<Vec<_>>();
    matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

    if let Some(best) = matches.first() {
        metrics::inc_search_best_similarity(space.as_str(), best.similarity);
    }
    Ok(matches)
}

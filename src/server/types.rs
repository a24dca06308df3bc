use axum::body::Bytes;
use axum_typed_multipart::TryFromMultipart;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::searcher::{Match, SearchResult};
use crate::store::Space;

/// 搜索请求参数
#[derive(TryFromMultipart)]
pub struct SearchRequest {
    pub file: Bytes,
    pub top_k: Option<usize>,
}

/// 搜索表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct SearchForm {
    /// 上传的图片文件
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
    /// 每个空间返回的结果数量
    pub top_k: Option<usize>,
}

/// 计算特征请求参数
#[derive(TryFromMultipart)]
pub struct EmbedRequest {
    pub file: Bytes,
}

/// 计算特征表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct EmbedForm {
    /// 上传的图片文件
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub file: String,
}

/// 通过 URL 搜索
#[derive(Debug, Deserialize, ToSchema)]
pub struct UrlSearchRequest {
    /// 图片地址
    pub url: String,
    pub top_k: Option<usize>,
}

/// 通过向量搜索
#[derive(Debug, Deserialize, ToSchema)]
pub struct VectorSearchRequest {
    /// 搜索的空间
    pub space: Space,
    /// 查询向量，维数必须与该空间一致
    pub embedding: Vec<f32>,
    pub top_k: Option<usize>,
}

/// 图片搜索响应
#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    /// 搜索耗时，单位为毫秒
    pub time: u64,
    /// 相似图片，格式为 `{similarity, row, id, prompt, seed, guidance, steps, sampler, ...}`
    #[schema(value_type = Vec<Object>)]
    pub image_matches: Vec<Match>,
    /// 相似提示词
    #[schema(value_type = Vec<Object>)]
    pub prompt_matches: Vec<Match>,
}

impl SearchResponse {
    pub fn new(time: u64, result: SearchResult) -> Self {
        Self { time, image_matches: result.image_matches, prompt_matches: result.prompt_matches }
    }
}

/// 向量搜索响应
#[derive(Debug, Serialize, ToSchema)]
pub struct VectorSearchResponse {
    /// 搜索耗时，单位为毫秒
    pub time: u64,
    #[schema(value_type = Vec<Object>)]
    pub matches: Vec<Match>,
}

/// 图片特征响应，`stacked` 可用于搜索 image 空间，`primary` 可用于搜索 prompt 空间
#[derive(Debug, Serialize, ToSchema)]
pub struct EmbedResponse {
    /// 耗时，单位为毫秒
    pub time: u64,
    pub stacked: Vec<f32>,
    pub primary: Vec<f32>,
}

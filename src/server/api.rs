use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum_auth::AuthBearer;
use axum_typed_multipart::TypedMultipart;
use log::info;
use tokio::task::block_in_place;

use super::error::{AppError, Result};
use super::state::AppState;
use super::types::*;
use crate::store::{DualIndex, IndexManifest};

/// 搜索一张上传的图片
#[utoipa::path(
    post,
    path = "/search",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = SearchResponse),
        (status = 400, description = "图片无法解码或参数错误"),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    let top_k = data.top_k.unwrap_or(state.top_k);
    let start = Instant::now();

    info!("正在搜索上传图片，大小 {} 字节", data.file.len());

    let result = block_in_place(|| state.searcher.search_bytes(&data.file, top_k))?;
    Ok(Json(SearchResponse::new(start.elapsed().as_millis() as u64, result)))
}

/// 计算上传图片的特征向量
#[utoipa::path(
    post,
    path = "/embed",
    request_body(content = EmbedForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = EmbedResponse),
        (status = 400, description = "图片无法解码"),
    )
)]
pub async fn embed_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<EmbedRequest>,
) -> Result<Json<EmbedResponse>> {
    let start = Instant::now();
    let embedding = block_in_place(|| state.searcher.embed_bytes(&data.file))?;
    Ok(Json(EmbedResponse {
        time: start.elapsed().as_millis() as u64,
        stacked: embedding.stacked,
        primary: embedding.primary,
    }))
}

/// 下载并搜索一张图片
#[utoipa::path(
    post,
    path = "/search/url",
    request_body = UrlSearchRequest,
    responses(
        (status = 200, body = SearchResponse),
        (status = 400, description = "图片无法下载或解码"),
    )
)]
pub async fn search_url_handler(
    State(state): State<Arc<AppState>>,
    Json(data): Json<UrlSearchRequest>,
) -> Result<Json<SearchResponse>> {
    let top_k = data.top_k.unwrap_or(state.top_k);
    let start = Instant::now();

    info!("正在搜索 {}", data.url);

    let result = state.searcher.search_url(&state.fetcher, &data.url, top_k).await?;
    Ok(Json(SearchResponse::new(start.elapsed().as_millis() as u64, result)))
}

/// 用特征向量搜索某个空间
#[utoipa::path(
    post,
    path = "/search/vector",
    request_body = VectorSearchRequest,
    responses(
        (status = 200, body = VectorSearchResponse),
        (status = 400, description = "向量维数不正确或无效"),
    )
)]
pub async fn search_vector_handler(
    State(state): State<Arc<AppState>>,
    Json(data): Json<VectorSearchRequest>,
) -> Result<Json<VectorSearchResponse>> {
    let top_k = data.top_k.unwrap_or(state.top_k);
    let start = Instant::now();
    let matches =
        block_in_place(|| state.searcher.search_vector(data.space, &data.embedding, top_k))?;
    Ok(Json(VectorSearchResponse { time: start.elapsed().as_millis() as u64, matches }))
}

/// 获取当前索引的清单
#[utoipa::path(
    get,
    path = "/stats",
    responses(
        (status = 200, body = IndexManifest),
    )
)]
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Json<IndexManifest>> {
    let index = state.searcher.index();
    match index.manifest() {
        Some(manifest) => Ok(Json(manifest.clone())),
        None => Err(AppError::new(StatusCode::SERVICE_UNAVAILABLE, anyhow!("索引尚未保存"))),
    }
}

/// 从磁盘重新加载索引
#[utoipa::path(
    post,
    path = "/reload",
    responses(
        (status = 200, body = IndexManifest),
        (status = 401, description = "token 不正确"),
    ),
    security(("bearer" = []))
)]
pub async fn reload_handler(
    State(state): State<Arc<AppState>>,
    AuthBearer(token): AuthBearer,
) -> Result<Json<IndexManifest>> {
    if token != state.token {
        return Err(AppError::new(StatusCode::UNAUTHORIZED, anyhow!("token 不正确")));
    }

    // NOTE: 加载失败时继续使用旧索引
    let index = block_in_place(|| DualIndex::load(&state.index_dir))?;
    let manifest = index.manifest().cloned();
    state.searcher.replace(index)?;
    info!("已重新加载索引 {}", state.index_dir.path().display());

    manifest
        .map(Json)
        .ok_or_else(|| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, anyhow!("索引缺少清单")))
}

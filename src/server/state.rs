use std::sync::Arc;

use crate::config::IndexDir;
use crate::loader::RemoteFetcher;
use crate::searcher::Searcher;

/// 应用状态
pub struct AppState {
    /// 搜索器，持有索引和特征提取器
    pub searcher: Searcher,
    /// 用于 URL 查询的下载器
    pub fetcher: RemoteFetcher,
    /// 重新加载时读取的索引目录
    pub index_dir: IndexDir,
    /// 默认返回结果数量
    pub top_k: usize,
    /// 鉴权 token
    pub token: String,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(
        searcher: Searcher,
        fetcher: RemoteFetcher,
        index_dir: IndexDir,
        top_k: usize,
        token: String,
    ) -> Arc<Self> {
        Arc::new(AppState { searcher, fetcher, index_dir, top_k, token })
    }
}

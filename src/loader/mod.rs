//! 并发读取并解码图片

mod fetch;
mod metadata;

use std::path::{Path, PathBuf};

use anyhow::Result;
use futures::StreamExt;
use futures::stream;
use image::DynamicImage;
use log::{debug, warn};
use regex::RegexBuilder;
use tokio::task::spawn_blocking;
use walkdir::WalkDir;

pub use self::fetch::*;
pub use self::metadata::*;
use crate::config::FetchOptions;
use crate::metrics;

/// 默认的图片后缀
pub const DEFAULT_SUFFIX: &str = "jpg,jpeg,png,webp";

/// 图片来源
#[derive(Debug, Clone)]
pub enum AssetSource {
    /// 本地目录，ID 为相对路径
    Directory(PathBuf),
    /// 远程服务，ID 拼接到 base_url 之后
    Remote(RemoteFetcher),
}

impl AssetSource {
    /// `http://` 或 `https://` 开头的视为远程来源
    pub fn parse(source: &str, opts: &FetchOptions) -> Result<Self> {
        if source.starts_with("http://") || source.starts_with("https://") {
            Ok(Self::Remote(RemoteFetcher::new(Some(source.to_string()), opts)?))
        } else {
            Ok(Self::Directory(PathBuf::from(source)))
        }
    }
}

/// 读取结果，失败时 image 为 None
#[derive(Debug)]
pub struct LoadedAsset {
    pub id: String,
    pub image: Option<DynamicImage>,
}

pub struct AssetLoader {
    source: AssetSource,
    concurrency: usize,
}

impl AssetLoader {
    pub fn new(source: AssetSource, concurrency: usize) -> Self {
        Self { source, concurrency: concurrency.max(1) }
    }

    pub fn source(&self) -> &AssetSource {
        &self.source
    }

    /// 并发读取一组图片，结果与输入一一对应且顺序相同
    pub async fn load(&self, ids: &[String]) -> Vec<LoadedAsset> {
        stream::iter(ids.iter().cloned())
            .map(|id| async move {
                let image = self.load_one(&id).await;
                LoadedAsset { id, image }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }

    /// 读取并解码一张图片，任何失败都只记录日志
    pub async fn load_one(&self, id: &str) -> Option<DynamicImage> {
        let bytes = match &self.source {
            AssetSource::Directory(root) => match tokio::fs::read(root.join(id)).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("无法读取 {id}: {e}");
                    None
                }
            },
            AssetSource::Remote(fetcher) => fetcher.fetch(id).await,
        };

        let image = match bytes {
            Some(bytes) => match spawn_blocking(move || decode_image(&bytes)).await {
                Ok(Ok(image)) => Some(image),
                Ok(Err(e)) => {
                    warn!("无法解码 {id}: {e}");
                    None
                }
                Err(e) => {
                    warn!("解码 {id} 的任务失败: {e}");
                    None
                }
            },
            None => None,
        };
        metrics::inc_loaded(image.is_some());
        image
    }

    /// 扫描目录，返回按文件名排序的相对路径
    pub fn scan_directory(root: &Path, suffix: &str) -> Result<Vec<String>> {
        let pattern = format!("^({})$", suffix.split(',').map(str::trim).collect::<Vec<_>>().join("|"));
        let re = RegexBuilder::new(&pattern).case_insensitive(true).build()?;

        let mut ids = vec![];
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().map(|s| re.is_match(&s.to_string_lossy())) != Some(true) {
                continue;
            }
            let relative = path.strip_prefix(root)?;
            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            ids.push(id);
        }
        debug!("在 {} 中找到 {} 张图片", root.display(), ids.len());
        Ok(ids)
    }
}

/// 从内存中解码图片
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    Ok(image::load_from_memory(bytes)?)
}

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;
use crate::index::{IndexKind, Metric};
use crate::loader::RetryPolicy;

static INDEX_DIR: LazyLock<IndexDir> = LazyLock::new(|| {
    let proj_dirs =
        ProjectDirs::from("", "promptsearch", "promptsearch").expect("failed to get project dir");
    IndexDir { path: proj_dirs.data_dir().join("index") }
});

fn default_index_dir() -> &'static str {
    INDEX_DIR.path().to_str().unwrap()
}

#[derive(Parser, Debug, Clone)]
pub struct ModelOptions {
    /// CLIP 模型目录，包含 vision.onnx、text.onnx 和 tokenizer.json
    #[arg(long, value_name = "DIR", env = "PROMPTSEARCH_MODEL_DIR", default_value = "models/clip")]
    pub model_dir: PathBuf,
    /// 文本最大 token 数，超出部分截断
    #[arg(long, value_name = "N", default_value_t = 77)]
    pub max_text_tokens: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct FetchOptions {
    /// 远程图片的最大尝试次数
    #[arg(long, value_name = "N", default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,
    /// 单次请求超时时间，单位为秒
    #[arg(long, value_name = "SECONDS", default_value_t = 20)]
    pub fetch_timeout: u64,
    /// 请求远程图片时使用的 Bearer token
    #[arg(long, value_name = "TOKEN", env = "PROMPTSEARCH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,
}

impl FetchOptions {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { max_attempts: self.max_attempts, ..Default::default() }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }
}

#[derive(Parser, Debug, Clone, Copy)]
pub struct IndexSettings {
    /// 索引类型
    #[arg(long, value_enum, default_value_t = IndexKind::Flat)]
    pub kind: IndexKind,
    /// 图片空间的度量
    #[arg(long, value_enum, default_value_t = Metric::InnerProduct)]
    pub image_metric: Metric,
    /// 文本空间的度量
    #[arg(long, value_enum, default_value_t = Metric::InnerProduct)]
    pub prompt_metric: Metric,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            kind: IndexKind::Flat,
            image_metric: Metric::InnerProduct,
            prompt_metric: Metric::InnerProduct,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 每个空间返回的结果数量
    #[arg(short = 'k', long, value_name = "K", default_value_t = 5)]
    pub top_k: usize,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "promptsearch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 索引文件目录
    #[arg(short = 'd', long, default_value = default_index_dir())]
    pub index_dir: IndexDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 从图片和元数据构建索引
    Build(BuildCommand),
    /// 搜索与图片相似的结果
    Search(SearchCommand),
    /// 启动 HTTP 搜索服务
    Server(ServerCommand),
    /// 导出索引中的向量为 npy 文件
    Export(ExportCommand),
    /// 显示索引信息或某一行的元数据
    Show(ShowCommand),
}

/// 索引目录，三个数据文件和清单必须作为一组读写
#[derive(Debug, Clone)]
pub struct IndexDir {
    path: PathBuf,
}

impl IndexDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回清单文件的路径
    pub fn manifest(&self) -> PathBuf {
        self.path.join("manifest.json")
    }

    /// 返回图片空间索引的路径
    pub fn image_index(&self) -> PathBuf {
        self.path.join("image.index")
    }

    /// 返回文本空间索引的路径
    pub fn prompt_index(&self) -> PathBuf {
        self.path.join("prompt.index")
    }

    /// 返回元数据文件的路径
    pub fn metadata(&self) -> PathBuf {
        self.path.join("metadata.json")
    }

    /// 写入时使用的临时目录
    pub fn staging(&self) -> IndexDir {
        IndexDir { path: self.sibling("tmp") }
    }

    /// 替换时旧索引的临时位置
    pub fn backup(&self) -> IndexDir {
        IndexDir { path: self.sibling("old") }
    }

    pub fn exists(&self) -> bool {
        self.manifest().exists()
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self.path.file_name().map(|s| s.to_string_lossy().to_string());
        let name = format!("{}.{}", name.as_deref().unwrap_or("index"), suffix);
        self.path.with_file_name(name)
    }
}

impl FromStr for IndexDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use log::info;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{FetchOptions, IndexSettings, ModelOptions, Opts};
use crate::extractor::open_extractor;
use crate::loader::{AssetLoader, AssetSource, DEFAULT_SUFFIX, MergePolicy, SideChannel};
use crate::pipeline::{
    DEFAULT_BATCH_SIZE, IngestOptions, MemoryPolicy, Orchestrator, Progress, ingest,
};
use crate::store::DualIndex;

#[derive(Parser, Debug, Clone)]
pub struct BuildCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    #[command(flatten)]
    pub fetch: FetchOptions,
    #[command(flatten)]
    pub index: IndexSettings,
    /// 图片目录，或以 http(s):// 开头的远程地址
    #[arg(long, value_name = "DIR|URL")]
    pub source: String,
    /// 元数据文件或目录，可以指定多次
    #[arg(long, value_name = "PATH")]
    pub metadata: Vec<PathBuf>,
    /// 重复 ID 的元数据使用后加载的
    #[arg(long)]
    pub metadata_overwrite: bool,
    /// 扫描目录时的文件后缀，逗号分隔
    #[arg(long, default_value = DEFAULT_SUFFIX)]
    pub suffix: String,
    /// 多少张图片为一个批次
    #[arg(long, value_name = "SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    /// 同时读取的图片数量
    #[arg(long, value_name = "N", default_value_t = num_cpus::get() * 2)]
    pub concurrency: usize,
    /// 缓存占用超过该字节数时释放
    #[arg(long, value_name = "BYTES")]
    pub memory_threshold: Option<u64>,
    /// 每处理多少张图片检查一次缓存占用
    #[arg(long, value_name = "N", default_value_t = 1000)]
    pub memory_check_every: usize,
    /// 每隔多少个批次保存一次索引
    #[arg(long, value_name = "N")]
    pub checkpoint_every: Option<usize>,
}

impl SubCommandExtend for BuildCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let policy =
            if self.metadata_overwrite { MergePolicy::LastWins } else { MergePolicy::FirstWins };
        let side = block_in_place(|| SideChannel::load(&self.metadata, policy))?;

        let source = AssetSource::parse(&self.source, &self.fetch)?;
        let ids = match &source {
            AssetSource::Directory(root) => AssetLoader::scan_directory(root, &self.suffix)?,
            AssetSource::Remote(_) => side.ids().cloned().collect(),
        };
        if ids.is_empty() {
            bail!("没有找到任何图片");
        }
        info!("共 {} 张图片，{} 条元数据", ids.len(), side.len());

        let extractor = block_in_place(|| open_extractor(&self.model))?;
        let mut store = DualIndex::create(
            self.index,
            extractor.stacked_dim(),
            extractor.primary_dim(),
            extractor.describe(),
        )?;

        let memory =
            MemoryPolicy { threshold: self.memory_threshold, check_every: self.memory_check_every };
        let mut orchestrator = Orchestrator::new(extractor, memory)
            .with_progress(Progress::new(Some(ids.len() as u64)));
        let loader = Arc::new(AssetLoader::new(source, self.concurrency));
        let ingest_opts = IngestOptions {
            batch_size: self.batch_size,
            checkpoint_every: self.checkpoint_every,
            index_dir: Some(opts.index_dir.clone()),
        };

        let report =
            ingest(&mut orchestrator, loader, Arc::new(side), ids, &mut store, &ingest_opts).await?;
        if store.is_empty() {
            bail!("没有任何图片写入索引");
        }

        block_in_place(|| store.persist(&opts.index_dir))?;
        info!(
            "构建索引成功: 写入 {} 行，读取失败 {} 张，失败批次 {}，耗时 {:.1}s",
            report.added,
            report.stats.failed_loads,
            report.stats.failed_batches,
            report.elapsed.as_secs_f32()
        );
        Ok(())
    }
}

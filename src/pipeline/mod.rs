//! 批量计算特征并写入索引
//!
//! 读取下一批图片与计算当前批次的特征同时进行，批次严格按顺序消费，
//! 写入索引的行顺序与输入 ID 的顺序一致。

mod progress;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use image::DynamicImage;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::block_in_place;

pub use self::progress::*;
use crate::config::IndexDir;
use crate::extractor::FeatureExtractor;
use crate::loader::{AssetLoader, AssetMetadata, SideChannel};
use crate::metrics;
use crate::store::{DualIndex, EmbeddedAsset, StoreError};

/// 默认批大小
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// 等待计算特征的图片，image 为 None 表示读取失败
#[derive(Debug)]
pub struct PendingAsset {
    pub meta: AssetMetadata,
    pub image: Option<DynamicImage>,
}

/// 显存/内存回收策略
#[derive(Debug, Clone, Copy)]
pub struct MemoryPolicy {
    /// 超过该字节数时释放缓存，None 表示从不释放
    pub threshold: Option<u64>,
    /// 每处理多少张图片检查一次
    pub check_every: usize,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self { threshold: None, check_every: 1000 }
    }
}

pub struct Orchestrator<E: FeatureExtractor> {
    extractor: E,
    memory: MemoryPolicy,
    since_check: usize,
    progress: Progress,
}

impl<E: FeatureExtractor> Orchestrator<E> {
    pub fn new(extractor: E, memory: MemoryPolicy) -> Self {
        Self { extractor, memory, since_check: 0, progress: Progress::hidden() }
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    pub fn into_extractor(self) -> E {
        self.extractor
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// 计算一批图片的特征，结果保持输入顺序，读取失败的图片被跳过
    ///
    /// 整个批次失败时返回空列表，错误只记录日志。
    pub fn embed_batch(&mut self, batch: Vec<PendingAsset>) -> Vec<EmbeddedAsset> {
        let total = batch.len();
        let mut metas = Vec::with_capacity(total);
        let mut images = Vec::with_capacity(total);
        for asset in batch {
            match asset.image {
                Some(image) => {
                    metas.push(asset.meta);
                    images.push(image);
                }
                None => debug!("跳过读取失败的图片 {}", asset.meta.id),
            }
        }
        let failed_loads = total - images.len();

        let (output, failed) = if images.is_empty() {
            (vec![], false)
        } else {
            match self.embed(metas, &images) {
                Ok(output) => {
                    metrics::inc_batch(true);
                    (output, false)
                }
                Err(e) => {
                    error!("批次特征计算失败，丢弃 {} 张图片: {e:?}", images.len());
                    metrics::inc_batch(false);
                    (vec![], true)
                }
            }
        };
        drop(images);

        self.progress.record_batch(total, failed_loads, output.len(), failed);
        self.check_memory(total);
        output
    }

    fn embed(&mut self, metas: Vec<AssetMetadata>, images: &[DynamicImage]) -> Result<Vec<EmbeddedAsset>> {
        let image_embeddings = self.extractor.embed_images(images)?;
        if image_embeddings.len() != images.len() {
            bail!("图片特征数量不正确: {} != {}", image_embeddings.len(), images.len());
        }

        let prompts = metas.iter().map(|m| m.prompt.as_str()).collect::<Vec<_>>();
        let prompt_embeddings = self.extractor.embed_texts(&prompts)?;
        if prompt_embeddings.len() != prompts.len() {
            bail!("文本特征数量不正确: {} != {}", prompt_embeddings.len(), prompts.len());
        }

        Ok(metas
            .into_iter()
            .zip(image_embeddings)
            .zip(prompt_embeddings)
            .map(|((meta, image), prompt_vector)| EmbeddedAsset {
                meta,
                image_vector: image.stacked,
                prompt_vector,
            })
            .collect())
    }

    fn check_memory(&mut self, processed: usize) {
        self.since_check += processed;
        if self.since_check < self.memory.check_every.max(1) {
            return;
        }
        self.since_check = 0;

        let (Some(threshold), Some(used)) = (self.memory.threshold, self.extractor.memory_in_use())
        else {
            return;
        };
        if used > threshold {
            debug!("缓存占用 {used} 字节，超过 {threshold}，释放缓存");
            self.extractor.release_cached_memory();
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub batch_size: usize,
    /// 每隔多少批保存一次索引
    pub checkpoint_every: Option<usize>,
    pub index_dir: Option<IndexDir>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE, checkpoint_every: None, index_dir: None }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub total: usize,
    /// 写入索引的行数
    pub added: usize,
    /// 写入时被拒绝的向量数
    pub rejected: usize,
    pub batches: usize,
    pub checkpoints: usize,
    pub stats: ProgressStats,
    pub elapsed: Duration,
}

/// 读取所有 ID 对应的图片，计算特征后追加到 store
pub async fn ingest<E: FeatureExtractor>(
    orchestrator: &mut Orchestrator<E>,
    loader: Arc<AssetLoader>,
    side: Arc<SideChannel>,
    ids: Vec<String>,
    store: &mut DualIndex,
    opts: &IngestOptions,
) -> Result<IngestReport> {
    let start = Instant::now();
    let total = ids.len();
    let batch_size = opts.batch_size.max(1);
    let (tx, mut rx) = mpsc::channel::<Vec<PendingAsset>>(2);

    let producer = tokio::spawn(async move {
        for chunk in ids.chunks(batch_size) {
            let loaded = loader.load(chunk).await;
            let pending = loaded
                .into_iter()
                .map(|asset| PendingAsset { meta: side.metadata_for(&asset.id), image: asset.image })
                .collect();
            if tx.send(pending).await.is_err() {
                break;
            }
        }
    });

    let mut report = IngestReport {
        total,
        added: 0,
        rejected: 0,
        batches: 0,
        checkpoints: 0,
        stats: ProgressStats::default(),
        elapsed: Duration::ZERO,
    };

    while let Some(batch) = rx.recv().await {
        let embedded = block_in_place(|| orchestrator.embed_batch(batch));
        for asset in embedded {
            let id = asset.meta.id.clone();
            match store.add(asset) {
                Ok(_) => report.added += 1,
                Err(e @ StoreError::Mismatch(_)) => return Err(e.into()),
                Err(e) => {
                    warn!("{id} 写入索引失败，已跳过: {e}");
                    report.rejected += 1;
                }
            }
        }
        report.batches += 1;

        if let (Some(every), Some(dir)) = (opts.checkpoint_every, &opts.index_dir) {
            if every > 0 && report.batches % every == 0 {
                block_in_place(|| store.persist(dir))?;
                report.checkpoints += 1;
                info!("已保存检查点，共 {} 行", store.len());
            }
        }
    }
    producer.await?;

    orchestrator.progress().finish();
    report.stats = orchestrator.progress().stats();
    report.elapsed = start.elapsed();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexSettings;
    use crate::extractor::testing::{DIM, MockExtractor, solid};
    use crate::index::testing::FailingIndex;
    use crate::index::{FlatIndex, Metric};

    fn pending(id: &str, image: Option<DynamicImage>) -> PendingAsset {
        let mut meta = AssetMetadata::new(id);
        meta.prompt = format!("a photo of {id}");
        PendingAsset { meta, image }
    }

    #[test]
    fn failed_load_keeps_order() {
        let mut o = Orchestrator::new(MockExtractor::default(), MemoryPolicy::default());
        let out = o.embed_batch(vec![
            pending("cat", Some(solid(255, 0, 0))),
            pending("broken", None),
            pending("dog", Some(solid(0, 0, 255))),
        ]);

        assert_eq!(out.iter().map(|a| a.meta.id.as_str()).collect::<Vec<_>>(), ["cat", "dog"]);
        assert_eq!(out[0].image_vector.len(), 2 * DIM);
        assert_eq!(out[0].prompt_vector.len(), DIM);
        assert!(out[0].prompt_vector[0] > 0.9);
        assert!(out[1].prompt_vector[2] > 0.9);
        assert_eq!(o.extractor().calls, 1);
        assert_eq!(o.progress().stats().failed_loads, 1);
    }

    #[test]
    fn failed_batch_is_isolated() {
        let extractor = MockExtractor { fail_calls: vec![1], ..Default::default() };
        let mut o = Orchestrator::new(extractor, MemoryPolicy::default());
        let batch = || vec![pending("a", Some(solid(1, 2, 3))), pending("b", Some(solid(3, 2, 1)))];

        assert_eq!(o.embed_batch(batch()).len(), 2);
        assert_eq!(o.embed_batch(batch()).len(), 0);
        assert_eq!(o.embed_batch(batch()).len(), 2);

        let stats = o.progress().stats();
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.succeeded, 4);
    }

    #[test]
    fn wrong_output_count_fails_whole_batch() {
        let extractor = MockExtractor { drop_last: true, ..Default::default() };
        let mut o = Orchestrator::new(extractor, MemoryPolicy::default());
        let out = o.embed_batch(vec![pending("a", Some(solid(1, 2, 3))), pending("b", Some(solid(3, 2, 1)))]);
        assert!(out.is_empty());
        assert_eq!(o.progress().stats().failed_batches, 1);
    }

    #[test]
    fn all_failed_loads_skip_extractor() {
        let mut o = Orchestrator::new(MockExtractor::default(), MemoryPolicy::default());
        assert!(o.embed_batch(vec![pending("a", None), pending("b", None)]).is_empty());
        assert_eq!(o.extractor().calls, 0);
        assert_eq!(o.progress().stats().failed_batches, 0);
    }

    #[test]
    fn releases_memory_over_threshold() {
        let policy = MemoryPolicy { threshold: Some(3000), check_every: 2 };
        let mut o = Orchestrator::new(MockExtractor::default(), policy);
        let batch = || vec![pending("a", Some(solid(1, 2, 3))), pending("b", Some(solid(3, 2, 1)))];

        // 每批增加 2048 字节，第二批后超过阈值
        o.embed_batch(batch());
        assert_eq!(o.extractor().releases, 0);
        o.embed_batch(batch());
        assert_eq!(o.extractor().releases, 1);
        assert_eq!(o.extractor().memory, 0);
    }

    #[test]
    fn no_threshold_never_releases() {
        let policy = MemoryPolicy { threshold: None, check_every: 1 };
        let mut o = Orchestrator::new(MockExtractor::default(), policy);
        for _ in 0..5 {
            o.embed_batch(vec![pending("a", Some(solid(1, 2, 3)))]);
        }
        assert_eq!(o.extractor().releases, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn index_errors_are_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        for (i, c) in [[255, 0, 0], [0, 255, 0], [0, 0, 255]].into_iter().enumerate() {
            image::RgbImage::from_pixel(4, 4, image::Rgb(c)).save(dir.path().join(format!("{i}.png"))).unwrap();
        }
        let ids = ["0.png", "1.png", "2.png"].map(String::from).to_vec();
        let loader = Arc::new(AssetLoader::new(
            crate::loader::AssetSource::Directory(dir.path().to_path_buf()),
            2,
        ));

        // 文本索引写入第 2 行时失败，图片索引会被回滚
        let image = Box::new(FlatIndex::new(Metric::InnerProduct, 2 * DIM));
        let prompt = Box::new(FailingIndex::new(Metric::InnerProduct, DIM, 2));
        let mut store = DualIndex::with_indexes(image, prompt, "mock").unwrap();
        let mut o = Orchestrator::new(MockExtractor::default(), MemoryPolicy::default());
        let opts = IngestOptions { batch_size: 2, ..Default::default() };

        let report =
            ingest(&mut o, loader, Arc::new(SideChannel::default()), ids, &mut store, &opts).await.unwrap();

        assert_eq!(report.added, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.batches, 2);
        store.check_alignment().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ingest_appends_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let colors = [("0.png", [255, 0, 0]), ("1.png", [0, 255, 0]), ("3.png", [0, 0, 255])];
        for (name, c) in colors {
            image::RgbImage::from_pixel(4, 4, image::Rgb(c)).save(dir.path().join(name)).unwrap();
        }
        let ids = ["0.png", "1.png", "2.png", "3.png"].map(String::from).to_vec();

        let loader = Arc::new(AssetLoader::new(
            crate::loader::AssetSource::Directory(dir.path().to_path_buf()),
            4,
        ));
        let side = Arc::new(SideChannel::default());
        let mut store = DualIndex::create(IndexSettings::default(), 2 * DIM, DIM, "mock").unwrap();
        let mut o = Orchestrator::new(MockExtractor::default(), MemoryPolicy::default());
        let opts = IngestOptions { batch_size: 3, ..Default::default() };

        let report = ingest(&mut o, loader, side, ids, &mut store, &opts).await.unwrap();

        assert_eq!(report.added, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(report.stats.failed_loads, 1);
        let order = store.records().iter().map(|r| r.meta.id.as_str()).collect::<Vec<_>>();
        assert_eq!(order, ["0.png", "1.png", "3.png"]);
        store.check_alignment().unwrap();
    }
}

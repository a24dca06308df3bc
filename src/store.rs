//! 图片空间、文本空间两个索引与元数据，三者按行对齐

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::config::{IndexDir, IndexSettings};
use crate::index::{IndexKind, Metric, Neighbor, VectorIndex, new_index, open_index};
use crate::loader::AssetMetadata;
use crate::utils::is_unit;

/// 清单格式版本
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("索引不存在: {0}")]
    NotFound(PathBuf),
    #[error("索引文件不一致: {0}")]
    Mismatch(String),
    #[error("无效的向量: {0}")]
    InvalidVector(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Index(#[from] anyhow::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// 向量空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Space {
    /// 堆叠特征，用于以图搜图
    Image,
    /// 主特征，图片与文本共享
    Prompt,
}

impl Space {
    pub fn as_str(self) -> &'static str {
        match self {
            Space::Image => "image",
            Space::Prompt => "prompt",
        }
    }
}

/// 已计算特征、等待写入索引的图片
#[derive(Debug, Clone)]
pub struct EmbeddedAsset {
    pub meta: AssetMetadata,
    /// 堆叠特征
    pub image_vector: Vec<f32>,
    /// 提示词的文本特征
    pub prompt_vector: Vec<f32>,
}

/// 一行元数据，`row` 与它在两个索引中的位置相同
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub row: u64,
    #[serde(flatten)]
    pub meta: AssetMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SpaceInfo {
    pub dim: usize,
    #[schema(value_type = String)]
    pub metric: Metric,
    #[schema(value_type = String)]
    pub kind: IndexKind,
    /// 原始分数的含义，`inner_product` 或 `squared_l2`
    pub score_convention: String,
}

impl SpaceInfo {
    fn of(index: &dyn VectorIndex) -> Self {
        Self {
            dim: index.dim(),
            metric: index.metric(),
            kind: index.kind(),
            score_convention: index.metric().convention().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Checksums {
    pub image: String,
    pub prompt: String,
    pub metadata: String,
}

/// 与索引文件一起保存的清单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct IndexManifest {
    pub version: u32,
    pub image: SpaceInfo,
    pub prompt: SpaceInfo,
    pub rows: u64,
    /// 三个文件的 blake3 校验和
    pub checksums: Checksums,
    /// 创建时间，unix 秒
    pub created_at: u64,
    /// 构建时使用的特征提取器
    pub extractor: String,
}

pub struct DualIndex {
    image: Box<dyn VectorIndex>,
    prompt: Box<dyn VectorIndex>,
    records: Vec<MetadataRecord>,
    extractor: String,
    manifest: Option<IndexManifest>,
}

impl DualIndex {
    /// 创建空的索引
    pub fn create(
        settings: IndexSettings,
        image_dim: usize,
        prompt_dim: usize,
        extractor: impl Into<String>,
    ) -> Result<Self> {
        let image = new_index(settings.kind, settings.image_metric, image_dim)?;
        let prompt = new_index(settings.kind, settings.prompt_metric, prompt_dim)?;
        Self::with_indexes(image, prompt, extractor)
    }

    /// 使用给定的空索引
    pub fn with_indexes(
        image: Box<dyn VectorIndex>,
        prompt: Box<dyn VectorIndex>,
        extractor: impl Into<String>,
    ) -> Result<Self> {
        if !image.is_empty() || !prompt.is_empty() {
            return Err(StoreError::Mismatch("新建索引时索引必须为空".to_string()));
        }
        Ok(Self { image, prompt, records: vec![], extractor: extractor.into(), manifest: None })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn index(&self, space: Space) -> &dyn VectorIndex {
        match space {
            Space::Image => self.image.as_ref(),
            Space::Prompt => self.prompt.as_ref(),
        }
    }

    pub fn records(&self) -> &[MetadataRecord] {
        &self.records
    }

    pub fn record(&self, row: u64) -> Option<&MetadataRecord> {
        self.records.get(row as usize)
    }

    pub fn extractor(&self) -> &str {
        &self.extractor
    }

    /// 最近一次保存或加载时的清单
    pub fn manifest(&self) -> Option<&IndexManifest> {
        self.manifest.as_ref()
    }

    /// 在某个空间中搜索
    pub fn search(&self, space: Space, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        Ok(self.index(space).search(query, k)?)
    }

    /// 添加一行，三个集合要么都增加一行，要么都不变
    pub fn add(&mut self, asset: EmbeddedAsset) -> Result<u64> {
        validate(self.image.as_ref(), &asset.image_vector, "图片")?;
        validate(self.prompt.as_ref(), &asset.prompt_vector, "文本")?;

        let row = self.records.len() as u64;
        let image_row = self.image.add(&asset.image_vector)?;
        let prompt_row = match self.prompt.add(&asset.prompt_vector) {
            Ok(r) => r,
            Err(e) => {
                self.image
                    .remove_last()
                    .map_err(|r| StoreError::Mismatch(format!("回滚图片索引失败: {r:#}")))?;
                return Err(e.into());
            }
        };
        if image_row != row || prompt_row != row {
            self.image.remove_last()?;
            self.prompt.remove_last()?;
            return Err(StoreError::Mismatch(format!(
                "行号不一致: image={image_row} prompt={prompt_row} metadata={row}"
            )));
        }

        self.records.push(MetadataRecord { row, meta: asset.meta });
        self.check_alignment()?;
        Ok(row)
    }

    /// 检查三个集合的长度以及每行的行号
    pub fn check_alignment(&self) -> Result<()> {
        let (image, prompt, meta) = (self.image.len(), self.prompt.len(), self.records.len());
        if image != prompt || prompt != meta {
            return Err(StoreError::Mismatch(format!(
                "行数不一致: image={image} prompt={prompt} metadata={meta}"
            )));
        }
        if let Some((i, r)) = self.records.iter().enumerate().find(|(i, r)| r.row != *i as u64) {
            return Err(StoreError::Mismatch(format!("第 {i} 行元数据的行号为 {}", r.row)));
        }
        Ok(())
    }

    /// 写入临时目录后整体替换目标目录
    pub fn persist(&mut self, dir: &IndexDir) -> Result<IndexManifest> {
        self.check_alignment()?;

        let staging = dir.staging();
        if staging.path().exists() {
            fs::remove_dir_all(staging.path())?;
        }
        fs::create_dir_all(staging.path())?;

        self.image.save(&staging.image_index())?;
        self.prompt.save(&staging.prompt_index())?;
        {
            let mut writer = BufWriter::new(File::create(staging.metadata())?);
            serde_json::to_writer(&mut writer, &self.records)?;
            writer.flush()?;
        }

        let manifest = IndexManifest {
            version: FORMAT_VERSION,
            image: SpaceInfo::of(self.image.as_ref()),
            prompt: SpaceInfo::of(self.prompt.as_ref()),
            rows: self.records.len() as u64,
            checksums: Checksums {
                image: checksum(&staging.image_index())?,
                prompt: checksum(&staging.prompt_index())?,
                metadata: checksum(&staging.metadata())?,
            },
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            extractor: self.extractor.clone(),
        };
        fs::write(staging.manifest(), serde_json::to_vec_pretty(&manifest)?)?;

        swap_dir(staging.path(), dir)?;
        info!("索引已保存到 {}，共 {} 行", dir.path().display(), manifest.rows);

        self.manifest = Some(manifest.clone());
        Ok(manifest)
    }

    /// 加载并校验索引，任何不一致都会返回 [`StoreError::Mismatch`]
    pub fn load(dir: &IndexDir) -> Result<Self> {
        restore_backup(dir)?;
        if !dir.exists() {
            return Err(StoreError::NotFound(dir.path().to_path_buf()));
        }
        let manifest: IndexManifest =
            serde_json::from_reader(BufReader::new(File::open(dir.manifest())?))?;
        if manifest.version != FORMAT_VERSION {
            return Err(StoreError::Mismatch(format!("不支持的清单版本 {}", manifest.version)));
        }

        verify(&dir.image_index(), &manifest.checksums.image)?;
        verify(&dir.prompt_index(), &manifest.checksums.prompt)?;
        verify(&dir.metadata(), &manifest.checksums.metadata)?;

        let image = open_space(&manifest.image, &dir.image_index())?;
        let prompt = open_space(&manifest.prompt, &dir.prompt_index())?;
        let records: Vec<MetadataRecord> =
            serde_json::from_reader(BufReader::new(File::open(dir.metadata())?))?;

        let this = Self {
            image,
            prompt,
            records,
            extractor: manifest.extractor.clone(),
            manifest: None,
        };
        this.check_alignment()?;
        if this.len() as u64 != manifest.rows {
            return Err(StoreError::Mismatch(format!(
                "清单记录 {} 行，实际 {} 行",
                manifest.rows,
                this.len()
            )));
        }

        debug!("加载索引 {}: {:?}", dir.path().display(), manifest);
        Ok(Self { manifest: Some(manifest), ..this })
    }
}

fn validate(index: &dyn VectorIndex, v: &[f32], name: &str) -> Result<()> {
    if v.len() != index.dim() {
        return Err(StoreError::InvalidVector(format!(
            "{name}向量维数为 {}，应为 {}",
            v.len(),
            index.dim()
        )));
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Err(StoreError::InvalidVector(format!("{name}向量包含非有限值")));
    }
    if !is_unit(v) {
        return Err(StoreError::InvalidVector(format!("{name}向量不是单位向量")));
    }
    Ok(())
}

fn open_space(info: &SpaceInfo, path: &Path) -> Result<Box<dyn VectorIndex>> {
    let index = open_index(info.kind, info.metric, info.dim, path)?;
    if index.dim() != info.dim || index.metric() != info.metric {
        return Err(StoreError::Mismatch(format!(
            "{} 与清单不符: dim={} metric={}",
            path.display(),
            index.dim(),
            index.metric()
        )));
    }
    Ok(index)
}

fn checksum(path: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(File::open(path)?)?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn verify(path: &Path, expected: &str) -> Result<()> {
    if !path.exists() {
        return Err(StoreError::Mismatch(format!("缺少文件 {}", path.display())));
    }
    if checksum(path)? != expected {
        return Err(StoreError::Mismatch(format!("{} 的校验和不正确", path.display())));
    }
    Ok(())
}

/// 用 staging 目录替换 dir，旧目录先移到 backup 再删除
/// 替换目录时中断会留下 `<dir>.old` 而没有 `<dir>`，此时恢复旧索引
fn restore_backup(dir: &IndexDir) -> Result<()> {
    let backup = dir.backup();
    if !dir.path().exists() && backup.exists() {
        warn!("{} 不存在，从 {} 恢复", dir.path().display(), backup.path().display());
        fs::rename(backup.path(), dir.path())?;
    }
    Ok(())
}

fn swap_dir(staging: &Path, dir: &IndexDir) -> Result<()> {
    if let Some(parent) = dir.path().parent() {
        fs::create_dir_all(parent)?;
    }
    restore_backup(dir)?;
    let backup = dir.backup();
    if backup.path().exists() {
        fs::remove_dir_all(backup.path())?;
    }
    let had_old = dir.path().exists();
    if had_old {
        fs::rename(dir.path(), backup.path())?;
    }
    fs::rename(staging, dir.path())?;
    if had_old {
        fs::remove_dir_all(backup.path())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FlatIndex;
    use crate::index::testing::FailingIndex;
    use crate::utils::l2_normalize;

    fn unit(v: &[f32]) -> Vec<f32> {
        let mut v = v.to_vec();
        l2_normalize(&mut v);
        v
    }

    fn asset(id: &str, image: &[f32], prompt: &[f32]) -> EmbeddedAsset {
        EmbeddedAsset {
            meta: AssetMetadata::new(id),
            image_vector: unit(image),
            prompt_vector: unit(prompt),
        }
    }

    fn empty() -> DualIndex {
        DualIndex::create(IndexSettings::default(), 4, 2, "test").unwrap()
    }

    #[test]
    fn add_keeps_rows_aligned() {
        let mut index = empty();
        for i in 0..5 {
            let row = index.add(asset(&i.to_string(), &[1., i as f32, 0., 0.], &[1., 0.])).unwrap();
            assert_eq!(row, i);
        }
        assert_eq!(index.len(), 5);
        assert_eq!(index.index(Space::Image).len(), 5);
        assert_eq!(index.index(Space::Prompt).len(), 5);
        assert_eq!(index.record(3).unwrap().meta.id, "3");
        index.check_alignment().unwrap();
    }

    #[test]
    fn invalid_vectors_touch_nothing() {
        let mut index = empty();
        index.add(asset("ok", &[1., 0., 0., 0.], &[0., 1.])).unwrap();

        let mut wrong_dim = asset("a", &[1., 0., 0., 0.], &[0., 1.]);
        wrong_dim.prompt_vector = vec![1., 0., 0.];
        assert!(matches!(index.add(wrong_dim), Err(StoreError::InvalidVector(_))));

        let mut not_unit = asset("b", &[1., 0., 0., 0.], &[0., 1.]);
        not_unit.image_vector = vec![1., 1., 0., 0.];
        assert!(matches!(index.add(not_unit), Err(StoreError::InvalidVector(_))));

        let mut nan = asset("c", &[1., 0., 0., 0.], &[0., 1.]);
        nan.prompt_vector = vec![f32::NAN, 1.];
        assert!(matches!(index.add(nan), Err(StoreError::InvalidVector(_))));

        assert_eq!(index.len(), 1);
        assert_eq!(index.index(Space::Image).len(), 1);
        assert_eq!(index.index(Space::Prompt).len(), 1);
    }

    #[test]
    fn failed_prompt_append_rolls_back_image() {
        let image = Box::new(FlatIndex::new(Metric::InnerProduct, 4));
        let prompt = Box::new(FailingIndex::new(Metric::InnerProduct, 2, 1));
        let mut index = DualIndex::with_indexes(image, prompt, "test").unwrap();

        index.add(asset("0", &[1., 0., 0., 0.], &[1., 0.])).unwrap();
        assert!(index.add(asset("1", &[0., 1., 0., 0.], &[0., 1.])).is_err());

        assert_eq!(index.len(), 1);
        assert_eq!(index.index(Space::Image).len(), 1);
        assert_eq!(index.index(Space::Prompt).len(), 1);
        index.check_alignment().unwrap();
    }

    #[test]
    fn persist_replaces_previous_build() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDir::new(tmp.path().join("index"));

        let mut first = empty();
        first.add(asset("old", &[1., 0., 0., 0.], &[1., 0.])).unwrap();
        first.persist(&dir).unwrap();

        let mut second = empty();
        second.add(asset("new-0", &[0., 1., 0., 0.], &[0., 1.])).unwrap();
        second.add(asset("new-1", &[0., 0., 1., 0.], &[0., 1.])).unwrap();
        second.persist(&dir).unwrap();

        let loaded = DualIndex::load(&dir).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.record(0).unwrap().meta.id, "new-0");
        assert!(!dir.staging().path().exists());
        assert!(!dir.backup().path().exists());
    }

    #[test]
    fn interrupted_swap_is_recovered() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDir::new(tmp.path().join("index"));
        let mut index = empty();
        index.add(asset("kept", &[1., 0., 0., 0.], &[1., 0.])).unwrap();
        index.persist(&dir).unwrap();

        // 旧索引已移走，新索引还未就位
        fs::rename(dir.path(), dir.backup().path()).unwrap();

        let loaded = DualIndex::load(&dir).unwrap();
        assert_eq!(loaded.record(0).unwrap().meta.id, "kept");
        assert!(dir.exists());
        assert!(!dir.backup().path().exists());
    }

    #[test]
    fn tampered_metadata_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDir::new(tmp.path().join("index"));
        let mut index = empty();
        index.add(asset("0", &[1., 0., 0., 0.], &[1., 0.])).unwrap();
        index.persist(&dir).unwrap();

        fs::write(dir.metadata(), "[]").unwrap();
        assert!(matches!(DualIndex::load(&dir), Err(StoreError::Mismatch(_))));
    }

    #[test]
    fn missing_index_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDir::new(tmp.path().join("nothing"));
        assert!(matches!(DualIndex::load(&dir), Err(StoreError::NotFound(_))));
    }
}

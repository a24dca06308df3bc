//! 特征提取器接口
//!
//! 模型本身不在本 crate 的范围内，这里只定义构建索引和搜索时共同依赖的契约：
//! 图片 → (堆叠向量, 主向量)，文本 → 主向量，所有向量均为单位向量。

#[cfg(feature = "clip")]
mod clip;
pub mod preprocess;
#[cfg(test)]
pub(crate) mod testing;

use anyhow::{Result, bail};
#[cfg(feature = "clip")]
pub use clip::*;
use image::DynamicImage;
use serde::Serialize;

use crate::config::ModelOptions;
use crate::utils::l2_normalize;

/// 一张图片的特征
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageEmbedding {
    /// 末层与中间层特征拼接后再归一化，维数为 2 * primary_dim
    pub stacked: Vec<f32>,
    /// 末层特征，和文本特征处于同一空间
    pub primary: Vec<f32>,
}

pub trait FeatureExtractor: Send {
    /// 主空间（图片/文本共享）的维数
    fn primary_dim(&self) -> usize;

    /// 堆叠空间的维数
    fn stacked_dim(&self) -> usize {
        self.primary_dim() * 2
    }

    /// 批量计算图片特征，返回结果与输入一一对应
    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Vec<ImageEmbedding>>;

    /// 批量计算文本特征，超出模型长度上限的文本会被截断
    fn embed_texts(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    fn embed_image(&mut self, image: &DynamicImage) -> Result<ImageEmbedding> {
        let mut v = self.embed_images(std::slice::from_ref(image))?;
        match v.pop() {
            Some(e) if v.is_empty() => Ok(e),
            _ => bail!("特征提取器返回的结果数量不正确"),
        }
    }

    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>> {
        let mut v = self.embed_texts(&[text])?;
        match v.pop() {
            Some(e) if v.is_empty() => Ok(e),
            _ => bail!("特征提取器返回的结果数量不正确"),
        }
    }

    /// 当前设备上占用的缓存内存（字节），无法统计时返回 None
    fn memory_in_use(&self) -> Option<u64> {
        None
    }

    /// 释放缓存的计算缓冲区
    fn release_cached_memory(&mut self) {}

    /// 写入索引清单的提取器描述
    fn describe(&self) -> String;
}

impl<E: FeatureExtractor + ?Sized> FeatureExtractor for Box<E> {
    fn primary_dim(&self) -> usize {
        (**self).primary_dim()
    }

    fn stacked_dim(&self) -> usize {
        (**self).stacked_dim()
    }

    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Vec<ImageEmbedding>> {
        (**self).embed_images(images)
    }

    fn embed_texts(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        (**self).embed_texts(texts)
    }

    fn memory_in_use(&self) -> Option<u64> {
        (**self).memory_in_use()
    }

    fn release_cached_memory(&mut self) {
        (**self).release_cached_memory()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// 按配置加载特征提取器
pub fn open_extractor(opts: &ModelOptions) -> Result<Box<dyn FeatureExtractor>> {
    #[cfg(feature = "clip")]
    {
        Ok(Box::new(ClipExtractor::open(opts)?))
    }
    #[cfg(not(feature = "clip"))]
    {
        bail!("未启用 clip 特性，无法加载模型 {}", opts.model_dir.display())
    }
}

/// 由同一次前向计算得到的末层、中间层特征构建 [`ImageEmbedding`]
///
/// 两个输入均为未归一化的投影向量，维数必须相同。
pub fn stack_features(last: &[f32], mid: &[f32]) -> Result<ImageEmbedding> {
    if last.len() != mid.len() {
        bail!("末层与中间层特征维数不一致: {} != {}", last.len(), mid.len());
    }

    let mut primary = last.to_vec();
    if !l2_normalize(&mut primary) {
        bail!("末层特征范数为 0");
    }

    let mut stacked = Vec::with_capacity(last.len() * 2);
    stacked.extend_from_slice(last);
    stacked.extend_from_slice(mid);
    if !l2_normalize(&mut stacked) {
        bail!("堆叠特征范数为 0");
    }

    Ok(ImageEmbedding { stacked, primary })
}

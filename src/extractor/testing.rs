use anyhow::{Result, bail};
use image::{DynamicImage, Rgb, RgbImage};

use super::{FeatureExtractor, ImageEmbedding, stack_features};
use crate::utils::l2_normalize;

/// 用平均颜色作为特征的测试用提取器
#[derive(Debug, Default)]
pub(crate) struct MockExtractor {
    /// embed_images 被调用的次数
    pub calls: usize,
    /// 第几次调用 embed_images 时返回错误
    pub fail_calls: Vec<usize>,
    /// 返回的结果比输入少一个
    pub drop_last: bool,
    pub memory: u64,
    pub releases: usize,
}

pub(crate) const DIM: usize = 4;

pub(crate) fn solid(r: u8, g: u8, b: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([r, g, b])))
}

fn mean_color(image: &DynamicImage) -> [f32; 3] {
    let rgb = image.to_rgb8();
    let mut sum = [0f32; 3];
    for p in rgb.pixels() {
        for c in 0..3 {
            sum[c] += p.0[c] as f32 / 255.;
        }
    }
    let n = (rgb.width() * rgb.height()).max(1) as f32;
    sum.map(|s| s / n)
}

impl FeatureExtractor for MockExtractor {
    fn primary_dim(&self) -> usize {
        DIM
    }

    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Vec<ImageEmbedding>> {
        let call = self.calls;
        self.calls += 1;
        self.memory += 1024 * images.len() as u64;
        if self.fail_calls.contains(&call) {
            bail!("模拟显存不足");
        }
        let mut out = images
            .iter()
            .map(|image| {
                let [r, g, b] = mean_color(image);
                stack_features(&[r, g, b, 0.05], &[g, b, r, 0.05])
            })
            .collect::<Result<Vec<_>>>()?;
        if self.drop_last {
            out.pop();
        }
        Ok(out)
    }

    fn embed_texts(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = if text.contains("cat") {
                    vec![1., 0., 0., 0.05]
                } else if text.contains("dog") {
                    vec![0., 0., 1., 0.05]
                } else {
                    vec![0., 1., 0., 0.05]
                };
                l2_normalize(&mut v);
                v
            })
            .collect())
    }

    fn memory_in_use(&self) -> Option<u64> {
        Some(self.memory)
    }

    fn release_cached_memory(&mut self) {
        self.memory = 0;
        self.releases += 1;
    }

    fn describe(&self) -> String {
        "mock-color".to_string()
    }
}

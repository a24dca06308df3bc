#![allow(dead_code)]

use std::path::Path;

use anyhow::Result;
use image::{DynamicImage, Rgb, RgbImage};
use promptsearch::extractor::stack_features;
use promptsearch::utils::l2_normalize;
use promptsearch::{FeatureExtractor, ImageEmbedding};

pub const DIM: usize = 4;

/// 用平均颜色作为特征，提示词中含 cat 的偏红，含 dog 的偏蓝
#[derive(Debug, Default)]
pub struct ColorExtractor;

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

impl FeatureExtractor for ColorExtractor {
    fn primary_dim(&self) -> usize {
        DIM
    }

    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Vec<ImageEmbedding>> {
        images
            .iter()
            .map(|image| {
                let [r, g, b] = mean_color(image);
                stack_features(&[r, g, b, 0.05], &[g, b, r, 0.05])
            })
            .collect()
    }

    fn embed_texts(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = if text.contains("cat") {
                    vec![1., 0.1, 0., 0.05]
                } else if text.contains("dog") {
                    vec![0., 0.1, 1., 0.05]
                } else {
                    vec![0., 1., 0., 0.05]
                };
                l2_normalize(&mut v);
                v
            })
            .collect())
    }

    fn describe(&self) -> String {
        "color".to_string()
    }
}

pub fn solid(color: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb(color)))
}

pub fn write_image(path: &Path, color: [u8; 3]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    solid(color).save(path).unwrap();
}

pub fn unit(v: &[f32]) -> Vec<f32> {
    let mut v = v.to_vec();
    assert!(l2_normalize(&mut v));
    v
}

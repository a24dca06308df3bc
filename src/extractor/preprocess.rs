use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use ndarray::{Array4, ArrayViewMut3, Axis};

// CLIP 预处理使用的归一化常量
const MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// CLIP 输入尺寸
pub const INPUT_SIZE: u32 = 224;

/// 将一批图片转换为 [N, 3, 224, 224] 的输入张量
///
/// 在原图上居中裁剪出正方形，缩放到 224（双三次插值），再按 CLIP 的均值方差归一化。
pub fn preprocess_batch(images: &[DynamicImage]) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((images.len(), 3, size, size));
    for (image, slot) in images.iter().zip(tensor.axis_iter_mut(Axis(0))) {
        fill_tensor(image, slot);
    }
    tensor
}

/// 原图中居中的正方形区域，边长为短边
fn center_square(image: &DynamicImage) -> DynamicImage {
    let (w, h) = image.dimensions();
    let side = w.min(h).max(1);
    image.crop_imm(w.saturating_sub(side) / 2, h.saturating_sub(side) / 2, side, side)
}

fn fill_tensor(image: &DynamicImage, mut slot: ArrayViewMut3<f32>) {
    let rgb = center_square(image).resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom).to_rgb8();

    for (px, py, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            slot[[c, py as usize, px as usize]] = (pixel.0[c] as f32 / 255. - MEAN[c]) / STD[c];
        }
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn extreme_aspect_ratio_is_cropped_first() {
        let tall = DynamicImage::new_rgb8(1, 65535);
        assert_eq!(center_square(&tall).dimensions(), (1, 1));
        let tensor = preprocess_batch(&[tall]);
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn crop_keeps_the_center() {
        let mut img = RgbImage::from_pixel(30, 10, Rgb([255, 0, 0]));
        for x in 10..20 {
            for y in 0..10 {
                img.put_pixel(x, y, Rgb([0, 255, 0]));
            }
        }
        let square = center_square(&DynamicImage::ImageRgb8(img)).to_rgb8();
        assert_eq!(square.dimensions(), (10, 10));
        assert!(square.pixels().all(|p| p.0 == [0, 255, 0]));
    }

    #[test]
    fn batch_shape() {
        let images = vec![DynamicImage::new_rgb8(640, 480), DynamicImage::new_rgb8(100, 300)];
        let tensor = preprocess_batch(&images);
        assert_eq!(tensor.shape(), &[2, 3, 224, 224]);
    }

    #[test]
    fn white_pixels_are_normalized_per_channel() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 300, Rgb([255, 255, 255])));
        let tensor = preprocess_batch(&[img]);
        for c in 0..3 {
            let expected = (1. - MEAN[c]) / STD[c];
            assert!((tensor[[0, c, 100, 100]] - expected).abs() < 1e-4);
        }
    }
}

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use image::DynamicImage;
use log::{debug, info};
use ndarray::{Array2, Ix2};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};

use super::preprocess::preprocess_batch;
use super::{FeatureExtractor, ImageEmbedding, stack_features};
use crate::config::ModelOptions;
use crate::utils::l2_normalize;

/// 导出为 ONNX 的 CLIP 模型
///
/// 模型目录中需要包含：
/// - `vision.onnx`：输入 `pixel_values`，输出末层投影 `image_embeds` 与中间层投影 `mid_embeds`
/// - `text.onnx`：输入 `input_ids`、`attention_mask`，输出 `text_embeds`
/// - `tokenizer.json`
pub struct ClipExtractor {
    vision: Session,
    text: Session,
    tokenizer: Tokenizer,
    dim: usize,
    name: String,
}

impl ClipExtractor {
    pub fn open(opts: &ModelOptions) -> Result<Self> {
        let dir = opts.model_dir.as_path();
        info!("加载 CLIP 模型: {}", dir.display());

        let vision = load_session(&dir.join("vision.onnx"))?;
        let text = load_session(&dir.join("text.onnx"))?;

        let mut tokenizer = Tokenizer::from_file(dir.join("tokenizer.json"))
            .map_err(|e| anyhow!("加载分词器失败: {e}"))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: opts.max_text_tokens,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("设置截断参数失败: {e}"))?;
        tokenizer.with_padding(Some(PaddingParams::default()));

        let name = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "clip".to_string());

        let mut this = Self { vision, text, tokenizer, dim: 0, name };
        // 用一次空文本推理确定输出维数
        this.dim = this.embed_texts(&[""])?[0].len();
        info!("CLIP 输出维数: {}", this.dim);
        Ok(this)
    }
}

fn load_session(path: &Path) -> Result<Session> {
    let session = Session::builder()?
        .commit_from_file(path)
        .with_context(|| format!("无法加载模型 {}", path.display()))?;
    debug!("{} inputs: {:?}", path.display(), session.inputs);
    debug!("{} outputs: {:?}", path.display(), session.outputs);
    Ok(session)
}

fn extract_2d(outputs: &ort::session::SessionOutputs, name: &str) -> Result<Array2<f32>> {
    let value = outputs.get(name).ok_or_else(|| anyhow!("模型缺少输出 {name}"))?;
    let view = value.try_extract_array::<f32>()?;
    Ok(view.into_dimensionality::<Ix2>()?.to_owned())
}

impl FeatureExtractor for ClipExtractor {
    fn primary_dim(&self) -> usize {
        self.dim
    }

    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Vec<ImageEmbedding>> {
        if images.is_empty() {
            return Ok(vec![]);
        }
        let pixel_values = Tensor::from_array(preprocess_batch(images))?;
        let outputs = self.vision.run(ort::inputs!["pixel_values" => pixel_values])?;

        let last = extract_2d(&outputs, "image_embeds")?;
        let mid = extract_2d(&outputs, "mid_embeds")?;
        if last.nrows() != images.len() || mid.nrows() != images.len() {
            bail!("视觉模型输出数量与输入不一致");
        }

        last.rows()
            .into_iter()
            .zip(mid.rows())
            .map(|(l, m)| stack_features(&l.to_vec(), &m.to_vec()))
            .collect()
    }

    fn embed_texts(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("分词失败: {e}"))?;

        let seq_len = encodings.iter().map(|e| e.len()).max().unwrap_or(0);
        let mut ids = Array2::<i64>::zeros((texts.len(), seq_len));
        let mut mask = Array2::<i64>::zeros((texts.len(), seq_len));
        for (i, encoding) in encodings.iter().enumerate() {
            for (j, (&id, &m)) in
                encoding.get_ids().iter().zip(encoding.get_attention_mask()).enumerate()
            {
                ids[[i, j]] = id as i64;
                mask[[i, j]] = m as i64;
            }
        }

        let outputs = self.text.run(ort::inputs![
            "input_ids" => Tensor::from_array(ids)?,
            "attention_mask" => Tensor::from_array(mask)?
        ])?;
        let embeds = extract_2d(&outputs, "text_embeds")?;

        embeds
            .rows()
            .into_iter()
            .map(|row| {
                let mut v = row.to_vec();
                if !l2_normalize(&mut v) {
                    bail!("文本特征范数为 0");
                }
                Ok(v)
            })
            .collect()
    }

    fn describe(&self) -> String {
        format!("clip-onnx:{}", self.name)
    }
}

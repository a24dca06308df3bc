use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use ndarray::Array2;
use ndarray_npy::write_npy;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::index::VectorIndex;
use crate::store::{DualIndex, Space};
use crate::{Opts, utils};

#[derive(Parser, Debug, Clone)]
pub struct ExportCommand {
    /// 输出目录
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    pub output: PathBuf,
}

impl SubCommandExtend for ExportCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        block_in_place(|| -> Result<()> {
            let index = DualIndex::load(&opts.index_dir)?;
            std::fs::create_dir_all(&self.output)?;
            for space in [Space::Image, Space::Prompt] {
                let data = export_vectors(index.index(space))?;
                let path = self.output.join(format!("{}.npy", space.as_str()));
                write_npy(&path, &data)?;
                info!("导出 {} 成功: {:?}", path.display(), data.dim());
            }
            Ok(())
        })
    }
}

/// 按行号顺序取出全部向量
pub fn export_vectors(index: &dyn VectorIndex) -> Result<Array2<f32>> {
    let (n, dim) = (index.len(), index.dim());
    let pb = indicatif::ProgressBar::new(n as u64).with_style(utils::pb_style());
    let mut data = Vec::with_capacity(n * dim);
    for row in 0..n as u64 {
        let v = index.vector(row).with_context(|| format!("无法读取第 {row} 行"))?;
        data.extend_from_slice(&v);
        pb.inc(1);
    }
    pb.finish_and_clear();
    Ok(Array2::from_shape_vec((n, dim), data)?)
}

use anyhow::{Result, bail};
use clap::Parser;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::store::DualIndex;

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {
    /// 显示某一行的元数据，不填则显示索引清单
    pub row: Option<u64>,
}

impl SubCommandExtend for ShowCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let index = block_in_place(|| DualIndex::load(&opts.index_dir))?;
        match self.row {
            Some(row) => match index.record(row) {
                Some(record) => println!("{}", serde_json::to_string_pretty(record)?),
                None => bail!("第 {row} 行不存在，索引共 {} 行", index.len()),
            },
            None => println!("{}", serde_json::to_string_pretty(&index.manifest())?),
        }
        Ok(())
    }
}

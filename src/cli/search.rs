use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{FetchOptions, ModelOptions, Opts, SearchOptions};
use crate::extractor::open_extractor;
use crate::loader::RemoteFetcher;
use crate::searcher::{Match, SearchResult, Searcher};
use crate::store::DualIndex;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    #[command(flatten)]
    pub fetch: FetchOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 被搜索的图片路径或 URL
    pub image: String,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let index = block_in_place(|| DualIndex::load(&opts.index_dir))?;
        let extractor = block_in_place(|| open_extractor(&self.model))?;
        let searcher = Searcher::new(index, extractor)?;

        let result = if self.image.starts_with("http://") || self.image.starts_with("https://") {
            // 地址由用户在命令行中指定，允许携带 token
            let fetcher = RemoteFetcher::new(Some(self.image.clone()), &self.fetch)?;
            searcher.search_url(&fetcher, &self.image, self.search.top_k).await?
        } else {
            let bytes = tokio::fs::read(&self.image).await?;
            block_in_place(|| searcher.search_bytes(&bytes, self.search.top_k))?
        };

        print_result(&result, self.output_format)
    }
}

fn print_result(result: &SearchResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            println!("# 相似图片");
            print_table(&result.image_matches);
            println!("# 相似提示词");
            print_table(&result.prompt_matches);
        }
    }
    Ok(())
}

fn print_table(matches: &[Match]) {
    for m in matches {
        let r = &m.record;
        println!(
            "{:.4}\t{}\tcfg={} steps={} sampler={} seed={}\t{}",
            m.similarity,
            r.id,
            r.guidance,
            r.steps,
            r.sampler,
            r.seed.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            r.prompt
        );
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}

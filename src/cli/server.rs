use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use prometheus::{BasicAuthentication, labels};
use rand::distr::{Alphanumeric, SampleString};
use tokio::net::TcpListener;
use tokio::task::{block_in_place, spawn_blocking};
use tokio::time::{Duration, sleep};

use crate::cli::SubCommandExtend;
use crate::config::{FetchOptions, ModelOptions, Opts, SearchOptions};
use crate::extractor::open_extractor;
use crate::loader::RemoteFetcher;
use crate::searcher::Searcher;
use crate::server;
use crate::store::DualIndex;

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    #[command(flatten)]
    pub model: ModelOptions,
    #[command(flatten)]
    pub fetch: FetchOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 监听地址
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub addr: String,
    /// 请求验证 token，不填则随机生成
    #[arg(long, default_value_t = String::new())]
    pub token: String,
    /// prometheus 主动推送地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 自定义 instance 标签值
    #[arg(long, value_name = "NAME")]
    pub prometheus_instance: Option<String>,
    /// prometheus 认证信息，格式为 username:password
    #[arg(long, value_name = "AUTH")]
    pub prometheus_auth: Option<String>,
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        // 索引不一致时直接退出，不启动服务
        let index = block_in_place(|| DualIndex::load(&opts.index_dir))?;
        let extractor = block_in_place(|| open_extractor(&self.model))?;
        let searcher = Searcher::new(index, extractor)?;
        // 查询地址由客户端提供，不能携带构建索引用的 token
        let fetch = FetchOptions { auth_token: None, ..self.fetch.clone() };
        let fetcher = RemoteFetcher::new(None, &fetch)?;

        let token = if self.token.is_empty() {
            let token = Alphanumeric.sample_string(&mut rand::rng(), 32);
            info!("鉴权 token: {token}");
            token
        } else {
            self.token.clone()
        };

        // 创建应用状态
        let state = server::AppState::new(
            searcher,
            fetcher,
            opts.index_dir.clone(),
            self.search.top_k,
            token,
        );

        // 创建应用
        let app = server::create_app(state);

        if let Some(url) = self.prometheus_push.clone() {
            let instance = self.prometheus_instance.clone().unwrap_or_else(|| self.addr.clone());
            let auth = self
                .prometheus_auth
                .as_deref()
                .map(|s| {
                    s.split_once(':')
                        .map(|(username, password)| (username.to_string(), password.to_string()))
                        .context("prometheus 认证信息格式应为 username:password")
                })
                .transpose()?;
            tokio::spawn(push_metrics(url, instance, auth));
        }

        // 启动服务器
        info!("服务器启动：http://{}", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn push_metrics(url: String, instance: String, auth: Option<(String, String)>) {
    loop {
        let metric_families = prometheus::gather();
        let url = url.clone();
        let instance = instance.clone();
        let auth = auth.clone();
        let r = spawn_blocking(move || {
            prometheus::push_metrics(
                "promptsearch",
                labels! {
                    "instance".to_string() => instance,
                },
                &url,
                metric_families,
                auth.map(|(username, password)| BasicAuthentication { username, password }),
            )
        })
        .await;
        match r {
            Ok(Err(e)) => error!("推送指标失败: {e}"),
            Err(e) => error!("推送指标任务失败: {e}"),
            Ok(Ok(())) => {}
        }
        sleep(Duration::from_secs(30)).await;
    }
}

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};
use reqwest::StatusCode;
use tokio::time::sleep;

use crate::config::FetchOptions;
use crate::metrics;

/// 远程下载的重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大尝试次数（包括第一次）
    pub max_attempts: u32,
    /// 普通失败后的基础等待时间
    pub base_delay: Duration,
    /// 被限流（429）后的基础等待时间
    pub rate_limit_delay: Duration,
    /// 单次等待的上限
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            rate_limit_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次（从 0 开始）失败后需要等待的时间，按指数增长
    pub fn delay(&self, attempt: u32, rate_limited: bool) -> Duration {
        let base = if rate_limited { self.rate_limit_delay } else { self.base_delay };
        base.saturating_mul(1u32 << attempt.min(16)).min(self.max_delay)
    }
}

/// 单次请求的结果
#[derive(Debug)]
pub enum Attempt {
    Success(Vec<u8>),
    NotFound,
    RateLimited,
    Failed(String),
}

/// 按重试策略反复调用 `attempt`，直到成功、确认不存在或用完次数
///
/// 返回 None 表示没有拿到图片，原因已记录到日志。
pub async fn fetch_with_retry<F, Fut>(policy: &RetryPolicy, name: &str, mut attempt: F) -> Option<Vec<u8>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt>,
{
    let max_attempts = policy.max_attempts.max(1);
    for i in 0..max_attempts {
        let rate_limited = match attempt().await {
            Attempt::Success(bytes) => {
                metrics::inc_fetch("ok");
                return Some(bytes);
            }
            Attempt::NotFound => {
                debug!("{name} 不存在");
                metrics::inc_fetch("not_found");
                return None;
            }
            Attempt::RateLimited => {
                warn!("{name} 被限流 (第 {} 次)", i + 1);
                metrics::inc_fetch("rate_limited");
                true
            }
            Attempt::Failed(e) => {
                warn!("{name} 下载失败 (第 {} 次): {e}", i + 1);
                metrics::inc_fetch("error");
                false
            }
        };
        if i + 1 < max_attempts {
            sleep(policy.delay(i, rate_limited)).await;
        }
    }
    warn!("{name} 重试 {max_attempts} 次后仍然失败，已跳过");
    metrics::inc_fetch("exhausted");
    None
}

/// 通过 HTTP 下载图片
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    client: reqwest::Client,
    base_url: Option<String>,
    token: Option<String>,
    policy: RetryPolicy,
}

impl RemoteFetcher {
    pub fn new(base_url: Option<String>, opts: &FetchOptions) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(opts.timeout()).build()?;
        Ok(Self {
            client,
            base_url: base_url.map(|s| s.trim_end_matches('/').to_string()),
            token: opts.auth_token.clone().filter(|s| !s.is_empty()),
            policy: opts.retry_policy(),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// token 只发送给 base_url 下的地址
    fn token_for(&self, url: &str) -> Option<&str> {
        let base = self.base_url.as_deref()?;
        let rest = url.strip_prefix(base)?;
        if rest.is_empty() || rest.starts_with('/') {
            self.token.as_deref()
        } else {
            None
        }
    }

    /// 资源 ID 对应的 URL
    pub fn url_for(&self, id: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{base}/{}", id.trim_start_matches('/')),
            None => id.to_string(),
        }
    }

    /// 下载 base_url 下的某个资源
    pub async fn fetch(&self, id: &str) -> Option<Vec<u8>> {
        self.fetch_url(&self.url_for(id)).await
    }

    /// 下载任意 URL
    pub async fn fetch_url(&self, url: &str) -> Option<Vec<u8>> {
        fetch_with_retry(&self.policy, url, || self.attempt(url)).await
    }

    async fn attempt(&self, url: &str) -> Attempt {
        let mut request = self.client.get(url);
        if let Some(token) = self.token_for(url) {
            request = request.bearer_auth(token);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Failed(e.to_string()),
        };
        match response.status() {
            s if s.is_success() => match response.bytes().await {
                Ok(bytes) => Attempt::Success(bytes.to_vec()),
                Err(e) => Attempt::Failed(e.to_string()),
            },
            StatusCode::NOT_FOUND => Attempt::NotFound,
            StatusCode::TOO_MANY_REQUESTS => Attempt::RateLimited,
            s => Attempt::Failed(format!("HTTP {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, header};
    use axum::routing::get;

    use super::*;

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0, false), Duration::from_secs(1));
        assert_eq!(policy.delay(2, false), Duration::from_secs(4));
        assert_eq!(policy.delay(1, true), Duration::from_secs(10));
        assert_eq!(policy.delay(10, true), Duration::from_secs(60));
        assert_eq!(policy.delay(40, false), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn constant_rate_limit_gives_up() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::default();
        let result = fetch_with_retry(&policy, "a.png", || {
            calls.set(calls.get() + 1);
            async { Attempt::RateLimited }
        })
        .await;
        assert_eq!(result, None);
        assert_eq!(calls.get(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_attempted_once() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::default();
        let result = fetch_with_retry(&policy, "a.png", || {
            calls.set(calls.get() + 1);
            async { Attempt::NotFound }
        })
        .await;
        assert_eq!(result, None);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_errors() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::default();
        let result = fetch_with_retry(&policy, "a.png", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 { Attempt::Failed("reset".into()) } else { Attempt::Success(vec![1, 2]) }
            }
        })
        .await;
        assert_eq!(result, Some(vec![1, 2]));
        assert_eq!(calls.get(), 3);
    }

    fn options(token: Option<&str>) -> FetchOptions {
        FetchOptions { max_attempts: 3, fetch_timeout: 5, auth_token: token.map(str::to_string) }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            rate_limit_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
        }
    }

    #[derive(Default)]
    struct Hits {
        missing: AtomicUsize,
        busy: AtomicUsize,
        authorized: Mutex<Vec<String>>,
    }

    /// 在本地端口启动一个返回固定状态码的服务，返回它的地址
    async fn serve(hits: Arc<Hits>) -> String {
        let app = Router::new()
            .route(
                "/missing.png",
                get(|State(h): State<Arc<Hits>>| async move {
                    h.missing.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NOT_FOUND
                }),
            )
            .route(
                "/busy.png",
                get(|State(h): State<Arc<Hits>>| async move {
                    h.busy.fetch_add(1, Ordering::SeqCst);
                    StatusCode::TOO_MANY_REQUESTS
                }),
            )
            .route(
                "/ok.png",
                get(|State(h): State<Arc<Hits>>, headers: HeaderMap| async move {
                    if let Some(v) = headers.get(header::AUTHORIZATION) {
                        h.authorized.lock().unwrap().push(v.to_str().unwrap().to_string());
                    }
                    vec![7u8, 8, 9]
                }),
            )
            .with_state(hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn http_statuses_map_to_retry_behaviour() {
        let hits = Arc::new(Hits::default());
        let base = serve(hits.clone()).await;
        let fetcher = RemoteFetcher::new(Some(base), &options(None)).unwrap().with_policy(fast_policy());

        assert_eq!(fetcher.fetch("missing.png").await, None);
        assert_eq!(hits.missing.load(Ordering::SeqCst), 1);

        assert_eq!(fetcher.fetch("busy.png").await, None);
        assert_eq!(hits.busy.load(Ordering::SeqCst), 3);

        assert_eq!(fetcher.fetch("ok.png").await, Some(vec![7, 8, 9]));
    }

    #[tokio::test]
    async fn token_is_only_sent_under_base_url() {
        let hits = Arc::new(Hits::default());
        let base = serve(hits.clone()).await;

        let fetcher = RemoteFetcher::new(Some(base.clone()), &options(Some("secret")))
            .unwrap()
            .with_policy(fast_policy());
        assert!(fetcher.fetch("ok.png").await.is_some());
        assert_eq!(*hits.authorized.lock().unwrap(), ["Bearer secret"]);

        // 不带 base_url 的下载器（例如 /search/url）从不发送 token
        let open = RemoteFetcher::new(None, &options(Some("secret"))).unwrap().with_policy(fast_policy());
        assert!(open.fetch_url(&format!("{base}/ok.png")).await.is_some());
        assert_eq!(hits.authorized.lock().unwrap().len(), 1);
    }

    #[test]
    fn token_scope_requires_path_boundary() {
        let fetcher = RemoteFetcher::new(Some("https://host/images".into()), &options(Some("t"))).unwrap();
        assert_eq!(fetcher.token_for("https://host/images/a.png"), Some("t"));
        assert_eq!(fetcher.token_for("https://host/images.evil.com/a.png"), None);
        assert_eq!(fetcher.token_for("https://evil.com/https://host/images/a.png"), None);
    }

    #[test]
    fn url_for_joins_base() {
        let opts = FetchOptions { max_attempts: 5, fetch_timeout: 20, auth_token: None };
        let fetcher = RemoteFetcher::new(Some("https://host/images/".into()), &opts).unwrap();
        assert_eq!(fetcher.url_for("part-1/a.png"), "https://host/images/part-1/a.png");
        let fetcher = RemoteFetcher::new(None, &opts).unwrap();
        assert_eq!(fetcher.url_for("https://x/y.png"), "https://x/y.png");
    }
}

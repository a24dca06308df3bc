use std::sync::LazyLock;

use prometheus::*;

static METRIC_FETCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "promptsearch_fetch_count",
        "count of remote fetch attempts by outcome",
        &["outcome"]
    )
    .unwrap()
});

static METRIC_LOAD_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "promptsearch_load_count",
        "count of loaded assets by result",
        &["result"]
    )
    .unwrap()
});

static METRIC_BATCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "promptsearch_batch_count",
        "count of embedding batches by result",
        &["result"]
    )
    .unwrap()
});

static METRIC_SEARCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "promptsearch_search_count",
        "count of the queries",
        &["kind", "size"]
    )
    .unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "promptsearch_search_duration",
        "duration of the per-query search in seconds",
        &["kind"]
    )
    .unwrap()
});

static METRIC_SEARCH_BEST_SIMILARITY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "promptsearch_search_best_similarity",
        "best similarity of the per-query search",
        &["space"],
        (-10..=10).map(|x| x as f64 / 10.).collect()
    )
    .unwrap()
});

pub fn inc_fetch(outcome: &str) {
    METRIC_FETCH_COUNT.with_label_values(&[outcome]).inc();
}

pub fn inc_loaded(ok: bool) {
    METRIC_LOAD_COUNT.with_label_values(&[if ok { "ok" } else { "failed" }]).inc();
}

pub fn inc_batch(ok: bool) {
    METRIC_BATCH_COUNT.with_label_values(&[if ok { "ok" } else { "failed" }]).inc();
}

/// 增加查询计数，`size` 为查询图片的尺寸，向量查询时为 None
pub fn inc_search_count(kind: &str, size: Option<(u32, u32)>) {
    let size = size.map(to_fixed_size).unwrap_or("-");
    METRIC_SEARCH_COUNT.with_label_values(&[kind, size]).inc();
}

pub fn inc_search_duration(kind: &str, duration: f32) {
    METRIC_SEARCH_DURATION.with_label_values(&[kind]).observe(duration as f64);
}

pub fn inc_search_best_similarity(space: &str, similarity: f32) {
    METRIC_SEARCH_BEST_SIMILARITY.with_label_values(&[space]).observe(similarity as f64);
}

/// 将图像面积范围调整到几个固定值
fn to_fixed_size((width, height): (u32, u32)) -> &'static str {
    let area = width as u64 * height as u64;
    if area <= 256 * 256 {
        "256"
    } else if area <= 512 * 512 {
        "512"
    } else if area <= 768 * 768 {
        "768"
    } else if area <= 1024 * 1024 {
        "1024"
    } else if area <= 2048 * 2048 {
        "2048"
    } else {
        "2048+"
    }
}

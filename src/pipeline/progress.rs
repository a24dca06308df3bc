use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use log::info;
use serde::Serialize;

use crate::utils::{pb_style, pb_style_speed};

/// 进度统计，只用于展示，不影响流程
pub struct Progress {
    pb: ProgressBar,
    stats: ProgressStats,
    window_start: Instant,
    window_items: usize,
    report_every: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressStats {
    /// 已处理的图片数，包括失败的
    pub processed: usize,
    /// 成功计算特征的图片数
    pub succeeded: usize,
    /// 读取或解码失败的图片数
    pub failed_loads: usize,
    /// 失败的批次数
    pub failed_batches: usize,
    /// 因批次失败而丢弃的图片数
    pub dropped: usize,
    /// 最近一个统计窗口内的速度，张/秒
    pub throughput: f64,
}

impl Progress {
    /// 显示进度条，total 未知时只显示速度
    pub fn new(total: Option<u64>) -> Self {
        let pb = match total {
            Some(total) => ProgressBar::new(total).with_style(pb_style()),
            None => ProgressBar::no_length().with_style(pb_style_speed()),
        };
        Self::with_bar(pb)
    }

    /// 不显示任何内容
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(pb: ProgressBar) -> Self {
        Self {
            pb,
            stats: ProgressStats::default(),
            window_start: Instant::now(),
            window_items: 0,
            report_every: Duration::from_secs(30),
        }
    }

    pub fn report_every(mut self, interval: Duration) -> Self {
        self.report_every = interval;
        self
    }

    /// 记录一个批次的结果
    pub fn record_batch(&mut self, total: usize, failed_loads: usize, succeeded: usize, failed: bool) {
        self.stats.processed += total;
        self.stats.failed_loads += failed_loads;
        self.stats.succeeded += succeeded;
        if failed {
            self.stats.failed_batches += 1;
            self.stats.dropped += total - failed_loads;
        }

        self.pb.inc(total as u64);
        self.pb.set_message(format!(
            "失败 {} 张，失败批次 {}",
            self.stats.failed_loads + self.stats.dropped,
            self.stats.failed_batches
        ));

        self.window_items += total;
        let elapsed = self.window_start.elapsed();
        if elapsed >= self.report_every {
            self.stats.throughput = self.window_items as f64 / elapsed.as_secs_f64();
            self.window_start = Instant::now();
            self.window_items = 0;
            self.report();
        }
    }

    pub fn report(&self) {
        let s = &self.stats;
        info!(
            "已处理 {} 张，成功 {} 张，读取失败 {} 张，失败批次 {}，速度 {:.1} 张/秒",
            s.processed, s.succeeded, s.failed_loads, s.failed_batches, s.throughput
        );
    }

    pub fn stats(&self) -> ProgressStats {
        self.stats
    }

    pub fn finish(&self) {
        self.pb.finish();
        self.report();
    }
}

//! 扫描选项与统计信息（模块）
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::{ErrorKind, ScanResult, ScanStatus};

/// OCR 引擎类型
/// - Offline：本地 OCR，受 CPU 限制，无速率限制。
/// - Cloud：云端 OCR，受提供方 RPM / 每日配额限制。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Offline,
    Cloud,
}

impl EngineKind {
    /// 默认并发：云端为 1（遵守 RPM），本地等于 CPU 核数
    pub fn default_concurrency(&self) -> usize {
        match self {
            EngineKind::Cloud => 1,
            EngineKind::Offline => num_cpus::get().max(1),
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offline" => Ok(EngineKind::Offline),
            "cloud" => Ok(EngineKind::Cloud),
            other => Err(format!("unknown engine: {other}")),
        }
    }
}

/// 限流/瞬时错误的重试策略（指数退避）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 单个条目最多调用 OCR 的次数（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间；提供方给出 retry_after 时优先采用
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << shift).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_millis(60_000),
        }
    }
}

/// 单次批处理的运行参数
#[derive(Debug, Clone)]
pub struct ScanRunOptions {
    /// 并发数：None 表示按引擎取默认值；Some(1) 走串行
    pub concurrency: Option<usize>,
    pub retry: RetryPolicy,
}

impl Default for ScanRunOptions {
    fn default() -> Self {
        Self { concurrency: None, retry: RetryPolicy::default() }
    }
}

/// 批处理汇总（区分成功 / 失败 / 跳过及原因）
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    /// 成功识别但未匹配任何规则的条目（计入 succeeded）
    pub unclassified: usize,
    pub failed: BTreeMap<ErrorKind, usize>,
    pub skipped: BTreeMap<ErrorKind, usize>,
}

impl BatchSummary {
    pub fn from_results(results: &[ScanResult]) -> Self {
        let mut summary = BatchSummary { total: results.len(), ..Default::default() };
        for r in results {
            match r.status {
                ScanStatus::Success => {
                    summary.succeeded += 1;
                    if r.matched_rule.is_none() { summary.unclassified += 1; }
                }
                ScanStatus::Failed => {
                    let kind = r.error_kind.unwrap_or(ErrorKind::TransientError);
                    *summary.failed.entry(kind).or_default() += 1;
                }
                ScanStatus::Skipped => {
                    let kind = r.error_kind.unwrap_or(ErrorKind::Cancelled);
                    *summary.skipped.entry(kind).or_default() += 1;
                }
            }
        }
        summary
    }

    pub fn failed_total(&self) -> usize { self.failed.values().sum() }

    pub fn skipped_total(&self) -> usize { self.skipped.values().sum() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(p.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, None), Duration::from_millis(350));
        assert_eq!(p.delay_for(1, Some(Duration::from_secs(10))), Duration::from_millis(350));
        assert_eq!(p.delay_for(1, Some(Duration::from_millis(50))), Duration::from_millis(50));
    }

    #[test]
    fn engine_kind_parses_case_insensitively() {
        assert_eq!("Cloud".parse::<EngineKind>(), Ok(EngineKind::Cloud));
        assert_eq!(" offline ".parse::<EngineKind>(), Ok(EngineKind::Offline));
        assert!("gpu".parse::<EngineKind>().is_err());
    }
}

//! 公共类型（对外暴露）
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::rules::Rule;

/// 文件夹校验失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    NotFound,
    NotADirectory,
    Empty,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::NotFound => "not_found",
            InvalidReason::NotADirectory => "not_a_directory",
            InvalidReason::Empty => "empty",
        }
    }
}

/// 批处理条目状态：pending → validated | invalid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum EntryStatus {
    Pending,
    Validated,
    Invalid(InvalidReason),
}

/// 批处理条目（列表文件中的一行，对应一份扫描文档）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub folder_path: PathBuf,
    pub sequence_index: usize,
    pub status: EntryStatus,
}

/// 单条扫描结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Success,
    Failed,
    Skipped,
}

/// 失败/跳过的原因分类（写入 ScanResult，并用于汇总统计）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidFolder,
    RateLimited,
    QuotaExhausted,
    AuthError,
    TransientError,
    Cancelled,
}

/// 每个条目恰好产生一条 ScanResult
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub folder_path: PathBuf,
    pub sequence_index: usize,
    #[serde(default)]
    pub extracted_text: String,
    #[serde(default)]
    pub matched_rule: Option<Rule>,
    #[serde(default)]
    pub confidence: f32,
    pub status: ScanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ScanResult {
    pub(crate) fn skipped(entry: &BatchEntry, kind: ErrorKind, detail: Option<String>) -> Self {
        Self::unsuccessful(entry, ScanStatus::Skipped, kind, detail)
    }

    pub(crate) fn failed(entry: &BatchEntry, kind: ErrorKind, detail: Option<String>) -> Self {
        Self::unsuccessful(entry, ScanStatus::Failed, kind, detail)
    }

    fn unsuccessful(entry: &BatchEntry, status: ScanStatus, kind: ErrorKind, detail: Option<String>) -> Self {
        Self {
            folder_path: entry.folder_path.clone(),
            sequence_index: entry.sequence_index,
            extracted_text: String::new(),
            matched_rule: None,
            confidence: 0.0,
            status,
            error_kind: Some(kind),
            detail,
        }
    }

    /// 已成功识别并匹配到规则时返回短代码
    pub fn short_code(&self) -> Option<&str> {
        match (&self.status, &self.matched_rule) {
            (ScanStatus::Success, Some(rule)) => Some(rule.short_code.as_str()),
            _ => None,
        }
    }
}

/// 进度事件：completed 单调递增
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub current_folder: PathBuf,
    pub last_status: ScanStatus,
}

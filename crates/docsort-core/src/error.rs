//! 错误类型（按来源划分）
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::ErrorKind;

/// 规则输入不合法
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("full name must not be empty")]
    EmptyFullName,
    #[error("short code must not be empty")]
    EmptyShortCode,
    #[error("short code {0:?} is longer than {max} characters", max = crate::rules::SHORT_CODE_MAX_LEN)]
    ShortCodeTooLong(String),
    #[error("short code {short_code:?} already belongs to {existing:?}")]
    ShortCodeTaken { short_code: String, existing: String },
    #[error("full name {0:?} appears more than once")]
    DuplicateFullName(String),
}

/// 规则存储失败（对整个调用是致命的）
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("rule store io error at {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("malformed rule store file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("cannot serialize rule store: {0}")]
    TomlWrite(#[from] toml::ser::Error),
    #[error("malformed rule snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("unsupported rule snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("cannot compile keyword matcher: {0}")]
    Matcher(#[from] aho_corasick::BuildError),
}

/// OCR 网关统一结果（云端/本地）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OcrError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider quota exhausted")]
    QuotaExhausted,
    #[error("transient ocr failure: {0}")]
    Transient(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl OcrError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OcrError::RateLimited { .. } | OcrError::Transient(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OcrError::RateLimited { .. } => ErrorKind::RateLimited,
            OcrError::QuotaExhausted => ErrorKind::QuotaExhausted,
            OcrError::Transient(_) => ErrorKind::TransientError,
            OcrError::Auth(_) => ErrorKind::AuthError,
        }
    }
}

/// 配置读写失败
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error at {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("malformed config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("cannot serialize config: {0}")]
    TomlWrite(#[from] toml::ser::Error),
    #[error("invalid value {value:?} for config key {key}")]
    Invalid { key: String, value: String },
}

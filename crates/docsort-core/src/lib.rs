//! 文档分类与批量扫描合并核心库
//!
//! 设计要点：
//! - 规则（全称 / 短代码 / 关键词）持久化在带版本号的 TOML 中，变更后发布不可变快照。
//! - 分类：关键词及其容错变体编译为 Aho-Corasick 自动机，按覆盖率打分，平分时按命中数、全称排序。
//! - 批处理：固定大小线程池并行执行 OCR + 分类；云端限流指数退避，配额耗尽即停止派发新调用。
//! - 结果按输入顺序返回；进度事件通过通道单独推送。
//! - 合并：按短代码分组、组内保持原序，逐组原子写出产物，单组失败互不影响。

mod api;
mod classifier;
mod config;
mod error;
mod merge;
mod ocr;
mod options;
mod rules;
mod scan;
mod store;
mod types;
mod validate;
mod variants;

pub use api::{BatchOutcome, BatchRun, DocSorter};
pub use classifier::{classify, Classification, Classifier};
pub use config::{ConfigStore, Settings};
pub use error::{ConfigError, OcrError, StoreError, ValidationError};
pub use merge::{artifact_name, merge, MergeCause, MergeError, MergeOptions, MergeReport, MergedArtifact, OutputOption, Page, PageAssembler, UnmergedItem, UnmergedReason, ZipAssembler};
pub use ocr::{translate_response, CloudEngine, CloudRequest, CloudTransport, Credentials, EnvCredentials, HttpTransport, OcrEngine, OfflineEngine, PagePayload, ProviderResponse, StaticCredentials};
pub use options::{BatchSummary, EngineKind, RetryPolicy, ScanRunOptions};
pub use rules::{default_rules, Rule, RuleDraft, SHORT_CODE_MAX_LEN};
pub use scan::{run_batch, scan_single, StopHandle};
pub use store::{RuleHandle, RuleStore};
pub use types::{BatchEntry, EntryStatus, ErrorKind, InvalidReason, ScanProgressEvent, ScanResult, ScanStatus};
pub use validate::{check_folder, list_page_files, parse_folder_list, validate_list, validate_paths};
pub use variants::{generate as generate_keyword_variants, normalize};

/// 配置键常量
pub mod config_keys {
    pub use crate::config::{
        KEY_CLOUD_API_KEY_ENV, KEY_CLOUD_BACKEND_URL, KEY_CONCURRENCY_CLOUD, KEY_CONCURRENCY_OFFLINE, KEY_ENGINE,
        KEY_MERGE_SUFFIX, KEY_OFFLINE_ARGS, KEY_OFFLINE_COMMAND, KEY_OUTPUT_FOLDER, KEY_OUTPUT_OPTION,
        KEY_RETRY_BASE_DELAY_MS, KEY_RETRY_MAX_ATTEMPTS, KEY_RETRY_MAX_DELAY_MS,
    };
}

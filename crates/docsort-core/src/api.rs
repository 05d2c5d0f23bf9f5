//! 对外操作入口（供桌面壳 / CLI 调用）
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Receiver;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

use crate::config::Settings;
use crate::merge::{merge, MergeOptions, MergeReport, PageAssembler, ZipAssembler};
use crate::ocr::{CloudEngine, EnvCredentials, HttpTransport, OcrEngine, OfflineEngine};
use crate::options::{BatchSummary, EngineKind, ScanRunOptions};
use crate::rules::{Rule, RuleDraft};
use crate::scan::{run_batch, scan_single, StopHandle};
use crate::store::RuleStore;
use crate::types::{BatchEntry, ErrorKind, ScanProgressEvent, ScanResult};
use crate::validate::{check_folder, validate_list};
use crate::variants::generate;

/// 云端请求超时
const CLOUD_TIMEOUT: Duration = Duration::from_secs(120);

/// 一次批处理的最终产出
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<ScanResult>,
    pub summary: BatchSummary,
    /// 未请求合并时为 None
    pub merge: Option<MergeReport>,
}

impl BatchOutcome {
    /// 云端配额是否在本次运行中耗尽（调用方可提示切换到本地引擎）
    pub fn quota_exhausted(&self) -> bool {
        self.summary.skipped.contains_key(&ErrorKind::QuotaExhausted)
    }

    /// 因配额耗尽而跳过的条目，可交给另一引擎重跑
    pub fn quota_skipped_entries(&self) -> Vec<BatchEntry> {
        self.results
            .iter()
            .filter(|r| r.error_kind == Some(ErrorKind::QuotaExhausted))
            .map(|r| BatchEntry {
                folder_path: r.folder_path.clone(),
                sequence_index: r.sequence_index,
                status: check_folder(&r.folder_path),
            })
            .collect()
    }
}

/// 后台运行中的批处理：进度流与最终结果分开消费
pub struct BatchRun {
    pub progress: Receiver<ScanProgressEvent>,
    pub stop: StopHandle,
    handle: JoinHandle<Result<BatchOutcome>>,
}

impl BatchRun {
    /// 等待批处理结束
    pub fn wait(self) -> Result<BatchOutcome> {
        self.handle.join().map_err(|_| anyhow!("batch thread panicked"))?
    }
}

/// 文档分类 / 合并服务
pub struct DocSorter {
    store: RuleStore,
    settings: Settings,
    offline: Arc<dyn OcrEngine>,
    cloud: Arc<dyn OcrEngine>,
    assembler: Arc<dyn PageAssembler>,
}

impl DocSorter {
    /// 按设置构建默认引擎（本地命令 + HTTP 云端）
    pub fn new(store: RuleStore, settings: Settings) -> Result<Self> {
        let offline = Arc::new(OfflineEngine::new(settings.offline_command.clone(), settings.offline_args.clone()));
        let credentials = Arc::new(EnvCredentials {
            backend_url: settings.cloud_backend_url.clone(),
            api_key_var: settings.cloud_api_key_env.clone(),
        });
        let transport = HttpTransport::new(CLOUD_TIMEOUT).context("build http client")?;
        let cloud = Arc::new(CloudEngine::new(Box::new(transport), credentials));
        Ok(Self::with_engines(store, settings, offline, cloud))
    }

    pub fn with_engines(store: RuleStore, settings: Settings, offline: Arc<dyn OcrEngine>, cloud: Arc<dyn OcrEngine>) -> Self {
        Self { store, settings, offline, cloud, assembler: Arc::new(ZipAssembler) }
    }

    pub fn with_assembler(mut self, assembler: Arc<dyn PageAssembler>) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn settings(&self) -> &Settings { &self.settings }

    /// 合并选项默认值（来自设置）
    pub fn default_merge_options(&self) -> MergeOptions {
        MergeOptions {
            output_option: self.settings.output_option,
            suffix: self.settings.merge_suffix.clone(),
            output_folder: self.settings.output_folder.clone(),
        }
    }

    fn engine(&self, kind: EngineKind) -> Arc<dyn OcrEngine> {
        match kind {
            EngineKind::Offline => Arc::clone(&self.offline),
            EngineKind::Cloud => Arc::clone(&self.cloud),
        }
    }

    pub fn validate_batch_folders(&self, list_path: &Path) -> Result<Vec<BatchEntry>> {
        validate_list(list_path)
    }

    /// 校验列表（同步，列表不可读时立即报错）后在后台运行扫描与合并
    pub fn process_batch_scan(&self, list_path: &Path, merge: Option<MergeOptions>) -> Result<BatchRun> {
        let entries = validate_list(list_path)?;
        self.process_entries(entries, self.settings.engine, merge)
    }

    /// 对已校验的条目运行批处理（例如配额耗尽后换用本地引擎重跑）
    pub fn process_entries(&self, entries: Vec<BatchEntry>, engine: EngineKind, merge_opts: Option<MergeOptions>) -> Result<BatchRun> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = StopHandle::new();
        let engine = self.engine(engine);
        let rules = self.store.handle();
        let assembler = Arc::clone(&self.assembler);
        let opts = ScanRunOptions {
            concurrency: Some(self.settings.concurrency_for(engine.kind())),
            retry: self.settings.retry,
        };
        let stop_in = stop.clone();

        let handle = std::thread::Builder::new()
            .name("docsort-batch".to_string())
            .spawn(move || -> Result<BatchOutcome> {
                let results = run_batch(&entries, engine.as_ref(), &rules, &opts, &tx, &stop_in)?;
                drop(tx);
                let summary = BatchSummary::from_results(&results);
                info!(
                    succeeded = summary.succeeded,
                    failed = summary.failed_total(),
                    skipped = summary.skipped_total(),
                    "batch summary"
                );
                let merge = merge_opts.map(|o| merge(&results, &o, assembler.as_ref()));
                if let Some(report) = &merge {
                    info!(merged = report.artifacts.len(), failed_groups = report.failures.len(), unmerged = report.unmerged.len(), "merge summary");
                }
                Ok(BatchOutcome { results, summary, merge })
            })
            .context("spawn batch thread")?;
        Ok(BatchRun { progress: rx, stop, handle })
    }

    /// 单个文件夹扫描；无效文件夹以 skipped(invalid_folder) 返回
    pub fn scan_single_folder(&self, folder: &Path, engine: EngineKind) -> ScanResult {
        let entry = BatchEntry { folder_path: folder.to_path_buf(), sequence_index: 0, status: check_folder(folder) };
        scan_single(&entry, self.engine(engine).as_ref(), &self.store.handle(), self.settings.retry)
    }

    pub fn merge_by_short_code(&self, items: &[ScanResult], opts: &MergeOptions) -> MergeReport {
        merge(items, opts, self.assembler.as_ref())
    }

    pub fn get_rules(&self) -> Vec<Rule> { self.store.list() }

    pub fn save_rule(&mut self, draft: &RuleDraft) -> Result<Rule> {
        Ok(self.store.save(draft)?)
    }

    pub fn delete_rule(&mut self, full_name: &str) -> Result<bool> {
        Ok(self.store.delete(full_name)?)
    }

    pub fn reset_rules(&mut self) -> Result<()> {
        Ok(self.store.reset_to_defaults()?)
    }

    pub fn export_rules(&self) -> Result<String> {
        Ok(self.store.export()?)
    }

    pub fn import_rules(&mut self, snapshot: &str, merge: bool) -> Result<usize> {
        Ok(self.store.import(snapshot, merge)?)
    }

    pub fn generate_keyword_variants(&self, keyword: &str, include_typos: bool) -> Vec<String> {
        generate(keyword, include_typos)
    }
}

//! 扫描编排：OCR + 分类的并行调度
//!
//! - 使用固定大小的 Rayon 线程池执行逐条目任务；线程数是唯一的并发控制。
//! - worker → collector 通过有界通道传递结果；collector 在调用线程上
//!   递增 completed 并发送进度事件，因此 completed 严格单调递增。
//! - 最终结果按输入顺序重排，与完成顺序无关。
//! - 云端配额耗尽后不再发出新的云端调用，已在途的调用允许完成。
//! - 停止信号只阻止新任务派发，不中断在途 OCR 调用。
use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::OcrError;
use crate::options::{EngineKind, RetryPolicy, ScanRunOptions};
use crate::ocr::OcrEngine;
use crate::store::RuleHandle;
use crate::types::{BatchEntry, EntryStatus, ErrorKind, ScanProgressEvent, ScanResult, ScanStatus};

/// 协作式停止信号（可克隆）
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self { Self::default() }

    pub fn stop(&self) { self.flag.store(true, Ordering::SeqCst); }

    pub fn is_stopped(&self) -> bool { self.flag.load(Ordering::SeqCst) }
}

/// 单个任务共享的只读上下文
struct TaskContext<'a> {
    engine: &'a dyn OcrEngine,
    rules: &'a RuleHandle,
    retry: RetryPolicy,
    stop: &'a StopHandle,
    quota_hit: &'a AtomicBool,
}

/// 运行一批条目，返回与输入顺序一致的结果
/// 进度事件写入 `progress`（无界通道，发送不阻塞；接收端关闭时静默丢弃）
pub fn run_batch(
    entries: &[BatchEntry],
    engine: &dyn OcrEngine,
    rules: &RuleHandle,
    opts: &ScanRunOptions,
    progress: &Sender<ScanProgressEvent>,
    stop: &StopHandle,
) -> Result<Vec<ScanResult>> {
    use crossbeam_channel as channel;
    use rayon::prelude::*;

    let total = entries.len();
    let threads = opts.concurrency.unwrap_or_else(|| engine.kind().default_concurrency()).max(1);
    info!(total, threads, engine = ?engine.kind(), "starting batch scan");

    let quota_hit = AtomicBool::new(false);
    let ctx = TaskContext { engine, rules, retry: opts.retry, stop, quota_hit: &quota_hit };

    // 通道用于 worker → collector 传递结果
    type Msg = (usize /*position*/, ScanResult);
    let (tx, rx) = channel::bounded::<Msg>(256);

    let mut buffer: BTreeMap<usize, ScanResult> = BTreeMap::new();
    std::thread::scope(|s| -> Result<()> {
        let ctx = &ctx;
        let worker = s.spawn(move || -> Result<()> {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
            pool.install(|| {
                entries.par_iter().enumerate().for_each(|(pos, entry)| {
                    let _ = tx.send((pos, process_entry(entry, ctx)));
                });
            });
            // 结束后 Sender 被丢弃，Receiver 将收到关闭信号
            Ok(())
        });

        let mut completed = 0usize;
        while let Ok((pos, result)) = rx.recv() {
            completed += 1;
            debug!(folder = ?result.folder_path, status = ?result.status, completed, total, "entry finished");
            let _ = progress.send(ScanProgressEvent {
                completed,
                total,
                current_folder: result.folder_path.clone(),
                last_status: result.status,
            });
            buffer.insert(pos, result);
        }

        worker.join().map_err(|_| anyhow!("scan worker panicked"))?
    })?;

    let results: Vec<ScanResult> = buffer.into_values().collect();
    if results.len() != total {
        return Err(anyhow!("scan produced {} results for {} entries", results.len(), total));
    }
    info!(total, stopped = stop.is_stopped(), quota_exhausted = quota_hit.load(Ordering::SeqCst), "batch scan finished");
    Ok(results)
}

/// 处理单个条目：校验状态 → 派发前检查 → OCR（含重试）→ 分类
fn process_entry(entry: &BatchEntry, ctx: &TaskContext<'_>) -> ScanResult {
    match entry.status {
        EntryStatus::Validated => {}
        EntryStatus::Invalid(reason) => {
            return ScanResult::skipped(entry, ErrorKind::InvalidFolder, Some(reason.as_str().to_string()));
        }
        EntryStatus::Pending => {
            return ScanResult::skipped(entry, ErrorKind::InvalidFolder, Some("not validated".to_string()));
        }
    }
    if ctx.stop.is_stopped() {
        return ScanResult::skipped(entry, ErrorKind::Cancelled, None);
    }
    if is_cloud(ctx) && ctx.quota_hit.load(Ordering::SeqCst) {
        return ScanResult::skipped(entry, ErrorKind::QuotaExhausted, None);
    }

    // 任务开始时取规则快照；之后的规则变更不影响本条目
    let classifier = ctx.rules.current();

    match extract_with_retry(entry, ctx) {
        Ok(text) => {
            let c = classifier.classify(&text);
            ScanResult {
                folder_path: entry.folder_path.clone(),
                sequence_index: entry.sequence_index,
                extracted_text: text,
                matched_rule: c.rule,
                confidence: c.confidence,
                status: ScanStatus::Success,
                error_kind: None,
                detail: None,
            }
        }
        Err(Halt::Failed(OcrError::QuotaExhausted)) => {
            if is_cloud(ctx) && !ctx.quota_hit.swap(true, Ordering::SeqCst) {
                warn!(folder = ?entry.folder_path, "cloud quota exhausted, no further cloud calls will be issued");
            }
            ScanResult::skipped(entry, ErrorKind::QuotaExhausted, None)
        }
        Err(Halt::Failed(e)) => ScanResult::failed(entry, e.kind(), Some(e.to_string())),
        Err(Halt::Cancelled(last)) => ScanResult::skipped(entry, ErrorKind::Cancelled, Some(last.to_string())),
    }
}

/// 重试循环的终止原因
enum Halt {
    Failed(OcrError),
    /// 退避期间收到停止信号；携带最后一次错误
    Cancelled(OcrError),
}

fn is_cloud(ctx: &TaskContext<'_>) -> bool {
    ctx.engine.kind() == EngineKind::Cloud
}

/// 调用 OCR；限流与瞬时错误按指数退避重试，最多 max_attempts 次
/// 退避期间若收到停止信号或配额已耗尽，不再发出新的调用
fn extract_with_retry(entry: &BatchEntry, ctx: &TaskContext<'_>) -> Result<String, Halt> {
    let max_attempts = ctx.retry.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        let err = match ctx.engine.extract_text(&entry.folder_path) {
            Ok(text) => return Ok(text),
            Err(e) => e,
        };
        if !err.is_retryable() || attempt >= max_attempts { return Err(Halt::Failed(err)); }

        let retry_after = match &err { OcrError::RateLimited { retry_after } => *retry_after, _ => None };
        let delay = ctx.retry.delay_for(attempt, retry_after);
        warn!(folder = ?entry.folder_path, attempt, delay_ms = delay.as_millis() as u64, error = %err, "ocr call failed, backing off");
        std::thread::sleep(delay);

        if is_cloud(ctx) && ctx.quota_hit.load(Ordering::SeqCst) { return Err(Halt::Failed(OcrError::QuotaExhausted)); }
        if ctx.stop.is_stopped() { return Err(Halt::Cancelled(err)); }
        attempt += 1;
    }
}

/// 单个文件夹：校验后直接扫描（无进度事件）
pub fn scan_single(entry: &BatchEntry, engine: &dyn OcrEngine, rules: &RuleHandle, retry: RetryPolicy) -> ScanResult {
    let stop = StopHandle::new();
    let quota_hit = AtomicBool::new(false);
    let ctx = TaskContext { engine, rules, retry, stop: &stop, quota_hit: &quota_hit };
    process_entry(entry, &ctx)
}

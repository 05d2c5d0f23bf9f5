use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docsort_core::{ConfigStore, DocSorter, EngineKind, MergeOptions, OutputOption, RuleDraft, RuleStore, ScanResult, Settings};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "docsort", version, about = "扫描文档分类与按短代码合并")]
struct Cli {
    /// 数据目录（规则与配置文件所在位置），默认为系统配置目录下的 docsort
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 校验文件夹列表
    Validate {
        /// 列表文件（每行一个文件夹路径）
        #[arg(long)]
        list: PathBuf,
    },
    /// 批量扫描、分类并按短代码合并
    Scan {
        #[arg(long)]
        list: PathBuf,
        /// OCR 引擎：offline 或 cloud（默认取配置）
        #[arg(long, value_parser = ["offline", "cloud"])]
        engine: Option<String>,
        /// 输出位置：folder 或 colocated（默认取配置）
        #[arg(long)]
        output_option: Option<String>,
        /// 产物名后缀
        #[arg(long)]
        suffix: Option<String>,
        #[arg(long)]
        output_folder: Option<PathBuf>,
        /// 只扫描不合并
        #[arg(long, default_value_t = false)]
        no_merge: bool,
        /// 结果写入 JSON 文件
        #[arg(long)]
        results: Option<PathBuf>,
        /// 云端配额耗尽时，用本地引擎重跑被跳过的条目
        #[arg(long, default_value_t = false)]
        fallback_offline: bool,
    },
    /// 扫描单个文件夹
    ScanFolder {
        folder: PathBuf,
        #[arg(long, value_parser = ["offline", "cloud"])]
        engine: Option<String>,
    },
    /// 根据 scan 输出的结果文件合并
    Merge {
        #[arg(long)]
        results: PathBuf,
        #[arg(long)]
        output_option: Option<String>,
        #[arg(long)]
        suffix: Option<String>,
        #[arg(long)]
        output_folder: Option<PathBuf>,
    },
    /// 规则管理
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
    /// 生成关键词变体
    Variants {
        keyword: String,
        #[arg(long, default_value_t = false)]
        typos: bool,
    },
    /// 键值配置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum RulesAction {
    List,
    Save {
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        short_code: String,
        /// 关键词，可重复
        #[arg(long = "keyword")]
        keywords: Vec<String>,
    },
    Delete {
        full_name: String,
    },
    Reset,
    Export {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Import {
        input: PathBuf,
        #[arg(long, default_value_t = false)]
        merge: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    List,
}

fn main() -> Result<()> {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(d) => d,
        None => dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("docsort"),
    };
    let config_path = data_dir.join("config.toml");

    if let Commands::Config { action } = &cli.command {
        return run_config(&config_path, action);
    }

    let config = ConfigStore::open(&config_path).context("open config")?;
    let settings = Settings::from_store(&config).context("parse config")?;
    let store = RuleStore::open(data_dir.join("rules.toml")).context("open rule store")?;
    let mut sorter = DocSorter::new(store, settings)?;

    match cli.command {
        Commands::Validate { list } => {
            let entries = sorter.validate_batch_folders(&list)?;
            print_json(&entries)?;
        }
        Commands::Scan { list, engine, output_option, suffix, output_folder, no_merge, results, fallback_offline } => {
            let merge = if no_merge { None } else { Some(merge_options(&sorter, output_option, suffix, output_folder)?) };
            let mut entries = sorter.validate_batch_folders(&list)?;
            let engine = parse_engine(engine, sorter.settings().engine)?;
            info!(?list, ?engine, entries = entries.len(), "starting batch");

            let mut all: Vec<ScanResult> = Vec::new();
            let mut current = engine;
            // 合并在所有轮次（含 --fallback-offline 的本地重跑）结束后统一进行
            loop {
                let run = sorter.process_entries(entries, current, None)?;
                let progress = run.progress.clone();
                // 进度在独立线程消费
                let printer = std::thread::spawn(move || {
                    for ev in progress.iter() {
                        info!(completed = ev.completed, total = ev.total, folder = ?ev.current_folder, status = ?ev.last_status, "progress");
                    }
                });
                let outcome = run.wait()?;
                let _ = printer.join();

                info!(
                    ?current,
                    succeeded = outcome.summary.succeeded,
                    unclassified = outcome.summary.unclassified,
                    failed = ?outcome.summary.failed,
                    skipped = ?outcome.summary.skipped,
                    "scan finished"
                );

                if outcome.quota_exhausted() && !fallback_offline {
                    warn!("cloud quota exhausted; rerun with --fallback-offline to finish skipped folders offline");
                }
                let fallback = if current == EngineKind::Cloud && fallback_offline { outcome.quota_skipped_entries() } else { Vec::new() };
                all.extend(outcome.results.into_iter().filter(|r| !fallback.iter().any(|e| e.sequence_index == r.sequence_index)));
                if fallback.is_empty() { break; }
                warn!(remaining = fallback.len(), "cloud quota exhausted, falling back to offline engine");
                entries = fallback;
                current = EngineKind::Offline;
            }
            all.sort_by_key(|r| r.sequence_index);

            if let Some(opts) = &merge {
                let report = sorter.merge_by_short_code(&all, opts);
                for a in &report.artifacts { info!(short_code = %a.short_code, path = ?a.path, pages = a.page_count, "artifact written"); }
                for e in &report.failures { warn!(error = %e, "merge group failed"); }
                info!(merged = report.artifacts.len(), unmerged = report.unmerged.len(), "merge finished");
            }
            if let Some(path) = results {
                std::fs::write(&path, serde_json::to_vec_pretty(&all)?).with_context(|| format!("write {}", path.display()))?;
            }
        }
        Commands::ScanFolder { folder, engine } => {
            let engine = parse_engine(engine, sorter.settings().engine)?;
            print_json(&sorter.scan_single_folder(&folder, engine))?;
        }
        Commands::Merge { results, output_option, suffix, output_folder } => {
            let txt = std::fs::read_to_string(&results).with_context(|| format!("read {}", results.display()))?;
            let items: Vec<ScanResult> = serde_json::from_str(&txt).context("parse results file")?;
            let opts = merge_options(&sorter, output_option, suffix, output_folder)?;
            let report = sorter.merge_by_short_code(&items, &opts);
            for e in &report.failures { warn!(error = %e, "merge group failed"); }
            print_json(&report.artifacts)?;
            info!(merged = report.artifacts.len(), failed = report.failures.len(), unmerged = report.unmerged.len(), "merge finished");
        }
        Commands::Rules { action } => match action {
            RulesAction::List => print_json(&sorter.get_rules())?,
            RulesAction::Save { full_name, short_code, keywords } => {
                let rule = sorter.save_rule(&RuleDraft { full_name, short_code, keywords })?;
                print_json(&rule)?;
            }
            RulesAction::Delete { full_name } => {
                if !sorter.delete_rule(&full_name)? { info!(%full_name, "rule not found, nothing deleted"); }
            }
            RulesAction::Reset => sorter.reset_rules()?,
            RulesAction::Export { output } => {
                let snapshot = sorter.export_rules()?;
                match output {
                    Some(path) => std::fs::write(&path, snapshot).with_context(|| format!("write {}", path.display()))?,
                    None => println!("{snapshot}"),
                }
            }
            RulesAction::Import { input, merge } => {
                let txt = std::fs::read_to_string(&input).with_context(|| format!("read {}", input.display()))?;
                let n = sorter.import_rules(&txt, merge)?;
                info!(imported = n, merge, "rules imported");
            }
        },
        Commands::Variants { keyword, typos } => {
            print_json(&sorter.generate_keyword_variants(&keyword, typos))?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 支持通过环境变量 RUST_LOG 控制日志等级，如：RUST_LOG=debug
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).with_writer(std::io::stderr).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run_config(path: &Path, action: &ConfigAction) -> Result<()> {
    let mut store = ConfigStore::open(path).context("open config")?;
    match action {
        ConfigAction::Get { key } => match store.get(key) {
            Some(v) => println!("{v}"),
            None => warn!(%key, "config key not set"),
        },
        ConfigAction::Set { key, value } => {
            store.set(key, value)?;
            // 立即校验，避免写入无法解析的值
            if let Err(e) = Settings::from_store(&store) {
                store.remove(key)?;
                return Err(e).context("rejected config value");
            }
        }
        ConfigAction::List => {
            for (k, v) in store.entries() { println!("{k} = {v}"); }
        }
    }
    Ok(())
}

fn parse_engine(arg: Option<String>, default: EngineKind) -> Result<EngineKind> {
    match arg {
        Some(s) => s.parse().map_err(anyhow::Error::msg),
        None => Ok(default),
    }
}

/// 命令行参数优先，其次取配置
fn merge_options(sorter: &DocSorter, option: Option<String>, suffix: Option<String>, folder: Option<PathBuf>) -> Result<MergeOptions> {
    let mut opts = sorter.default_merge_options();
    let explicit_option = option.is_some();
    if let Some(o) = option { opts.output_option = o.parse::<OutputOption>().map_err(anyhow::Error::msg)?; }
    if let Some(s) = suffix { opts.suffix = s; }
    if let Some(f) = folder {
        opts.output_folder = Some(f);
        // 只给了输出目录时视为 folder 模式
        if !explicit_option { opts.output_option = OutputOption::Folder; }
    }
    Ok(opts)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

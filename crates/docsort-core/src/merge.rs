//! 按短代码合并：分组 → 组内按原序排列 → 逐组组装产物
//!
//! 每组的产物要么完整生成，要么不生成：页面全部读入后才写临时文件，
//! 写完再 rename 到目标路径。某组失败不影响其他组。
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{ScanResult, ScanStatus};
use crate::validate::list_page_files;

/// 输出位置选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputOption {
    /// 所有产物写入同一个输出文件夹
    Folder,
    /// 产物写在该组首个源文件夹的上级目录
    CoLocated,
}

impl std::str::FromStr for OutputOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "folder" => Ok(OutputOption::Folder),
            "colocated" | "co_located" | "co-located" => Ok(OutputOption::CoLocated),
            other => Err(format!("unknown output option: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    pub output_option: OutputOption,
    /// 产物名后缀：`{short_code}{suffix}`
    pub suffix: String,
    pub output_folder: Option<PathBuf>,
}

/// 待组装的单页（不透明字节）
#[derive(Debug, Clone)]
pub struct Page {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// 页面组装器：把有序页面写成一个产物
pub trait PageAssembler: Send + Sync {
    /// 产物扩展名（不含点）
    fn extension(&self) -> &str;

    fn assemble(&self, pages: &[Page], out: &mut File) -> Result<(), MergeCause>;
}

/// 默认组装器：按顺序打包为 zip（页面原样存储，条目名带四位序号）
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipAssembler;

impl PageAssembler for ZipAssembler {
    fn extension(&self) -> &str { "zip" }

    fn assemble(&self, pages: &[Page], out: &mut File) -> Result<(), MergeCause> {
        let mut zip = zip::ZipWriter::new(out);
        let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (i, page) in pages.iter().enumerate() {
            zip.start_file(format!("{:04}_{}", i + 1, page.name), options)?;
            zip.write_all(&page.bytes).map_err(MergeCause::Write)?;
        }
        zip.finish()?;
        Ok(())
    }
}

/// 组失败原因
#[derive(Debug, Error)]
pub enum MergeCause {
    #[error("cannot read page {path}: {source}")]
    PageUnreadable { path: PathBuf, #[source] source: std::io::Error },
    #[error("source folder {0} has no pages")]
    NoPages(PathBuf),
    #[error("no output folder configured")]
    NoOutputFolder,
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// 单组合并失败（只影响该组）
#[derive(Debug, Error)]
#[error("merge group {group} failed: {cause}")]
pub struct MergeError {
    pub group: String,
    #[source]
    pub cause: MergeCause,
}

/// 已生成的产物描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedArtifact {
    pub short_code: String,
    pub full_name: String,
    pub path: PathBuf,
    /// 按原始顺序排列的源文件夹
    pub sources: Vec<PathBuf>,
    pub page_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmergedReason {
    Failed,
    Skipped,
    Unclassified,
}

/// 未参与合并的条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmergedItem {
    pub folder_path: PathBuf,
    pub sequence_index: usize,
    pub reason: UnmergedReason,
}

/// 合并汇总：已合并组 / 失败组 / 未合并条目
#[derive(Debug, Default)]
pub struct MergeReport {
    pub artifacts: Vec<MergedArtifact>,
    pub failures: Vec<MergeError>,
    pub unmerged: Vec<UnmergedItem>,
}

/// 一个合并组（组内已按 sequence_index 排序）
#[derive(Debug)]
struct MergeGroup<'a> {
    short_code: String,
    full_name: String,
    items: Vec<&'a ScanResult>,
}

/// 分组：成功且已分类的结果按短代码分组；组按首个成员的原始顺序排列
fn group_results(items: &[ScanResult]) -> (Vec<MergeGroup<'_>>, Vec<UnmergedItem>) {
    let mut groups: BTreeMap<String, MergeGroup<'_>> = BTreeMap::new();
    let mut unmerged = Vec::new();
    for item in items {
        let reason = match (item.status, &item.matched_rule) {
            (ScanStatus::Success, Some(rule)) => {
                groups
                    .entry(rule.short_code.clone())
                    .or_insert_with(|| MergeGroup {
                        short_code: rule.short_code.clone(),
                        full_name: rule.full_name.clone(),
                        items: Vec::new(),
                    })
                    .items
                    .push(item);
                continue;
            }
            (ScanStatus::Success, None) => UnmergedReason::Unclassified,
            (ScanStatus::Failed, _) => UnmergedReason::Failed,
            (ScanStatus::Skipped, _) => UnmergedReason::Skipped,
        };
        unmerged.push(UnmergedItem { folder_path: item.folder_path.clone(), sequence_index: item.sequence_index, reason });
    }

    let mut groups: Vec<MergeGroup<'_>> = groups.into_values().collect();
    for g in groups.iter_mut() {
        g.items.sort_by_key(|r| r.sequence_index);
    }
    groups.sort_by_key(|g| g.items.first().map(|r| r.sequence_index).unwrap_or(usize::MAX));
    unmerged.sort_by_key(|u| u.sequence_index);
    (groups, unmerged)
}

/// 按短代码合并
pub fn merge(items: &[ScanResult], opts: &MergeOptions, assembler: &dyn PageAssembler) -> MergeReport {
    let (groups, unmerged) = group_results(items);
    let mut report = MergeReport { unmerged, ..Default::default() };

    for group in groups {
        match assemble_group(&group, opts, assembler) {
            Ok(artifact) => {
                info!(short_code = %artifact.short_code, path = ?artifact.path, pages = artifact.page_count, "merged group");
                report.artifacts.push(artifact);
            }
            Err(cause) => {
                warn!(short_code = %group.short_code, error = %cause, "merge group failed");
                report.failures.push(MergeError { group: group.short_code.clone(), cause });
            }
        }
    }
    report
}

fn assemble_group(group: &MergeGroup<'_>, opts: &MergeOptions, assembler: &dyn PageAssembler) -> Result<MergedArtifact, MergeCause> {
    let out_dir = output_dir(group, opts)?;

    // 先读入全部页面；任何一页不可读则整组失败
    let mut pages = Vec::new();
    for item in &group.items {
        let folder = &item.folder_path;
        let files = list_page_files(folder).map_err(|source| MergeCause::PageUnreadable { path: folder.clone(), source })?;
        if files.is_empty() { return Err(MergeCause::NoPages(folder.clone())); }
        let folder_name = folder.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        for f in files {
            let bytes = std::fs::read(&f).map_err(|source| MergeCause::PageUnreadable { path: f.clone(), source })?;
            let page_name = f.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            pages.push(Page { name: format!("{folder_name}_{page_name}"), bytes });
        }
    }

    std::fs::create_dir_all(&out_dir).map_err(MergeCause::Write)?;
    let path = out_dir.join(artifact_name(&group.short_code, &opts.suffix, assembler.extension()));
    let mut tmp = tempfile::NamedTempFile::new_in(&out_dir).map_err(MergeCause::Write)?;
    assembler.assemble(&pages, tmp.as_file_mut())?;
    tmp.as_file_mut().flush().map_err(MergeCause::Write)?;
    tmp.persist(&path).map_err(|e| MergeCause::Write(e.error))?;

    Ok(MergedArtifact {
        short_code: group.short_code.clone(),
        full_name: group.full_name.clone(),
        path,
        sources: group.items.iter().map(|r| r.folder_path.clone()).collect(),
        page_count: pages.len(),
    })
}

fn output_dir(group: &MergeGroup<'_>, opts: &MergeOptions) -> Result<PathBuf, MergeCause> {
    match opts.output_option {
        OutputOption::Folder => opts.output_folder.clone().ok_or(MergeCause::NoOutputFolder),
        OutputOption::CoLocated => {
            let first = match group.items.first() { Some(r) => &r.folder_path, None => return Err(MergeCause::NoOutputFolder) };
            Ok(first.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new(".")).to_path_buf())
        }
    }
}

/// `{short_code}{suffix}.{ext}`；后缀已带扩展名时不重复追加
pub fn artifact_name(short_code: &str, suffix: &str, ext: &str) -> String {
    let base = format!("{short_code}{suffix}");
    if base.to_ascii_lowercase().ends_with(&format!(".{}", ext.to_ascii_lowercase())) {
        base
    } else {
        format!("{base}.{ext}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;
    use std::fs;
    use std::io::Read;

    fn rule(code: &str) -> Rule {
        Rule { id: 1, full_name: format!("Loại {code}"), short_code: code.to_string(), keywords: vec![] }
    }

    fn result(folder: PathBuf, idx: usize, code: Option<&str>, status: ScanStatus) -> ScanResult {
        ScanResult {
            folder_path: folder,
            sequence_index: idx,
            extracted_text: String::new(),
            matched_rule: code.map(rule),
            confidence: 1.0,
            status,
            error_kind: None,
            detail: None,
        }
    }

    fn make_folder(root: &Path, name: &str, pages: &[&str]) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for p in pages {
            fs::write(dir.join(p), format!("{name}/{p}")).unwrap();
        }
        dir
    }

    fn zip_entries(path: &Path) -> Vec<(String, String)> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut f = archive.by_index(i).unwrap();
                let mut s = String::new();
                f.read_to_string(&mut s).unwrap();
                (f.name().to_string(), s)
            })
            .collect()
    }

    #[test]
    fn groups_by_short_code_in_input_order() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("out");
        let a = make_folder(root.path(), "A", &["1.png", "2.png"]);
        let b = make_folder(root.path(), "B", &["1.png"]);
        let c = make_folder(root.path(), "C", &["1.png"]);
        let items = vec![
            result(a.clone(), 0, Some("001"), ScanStatus::Success),
            result(b.clone(), 1, Some("001"), ScanStatus::Success),
            result(c.clone(), 2, Some("002"), ScanStatus::Success),
        ];
        let opts = MergeOptions { output_option: OutputOption::Folder, suffix: "_merged".into(), output_folder: Some(out.clone()) };
        let report = merge(&items, &opts, &ZipAssembler);

        assert!(report.failures.is_empty());
        assert_eq!(report.artifacts.len(), 2);
        let first = &report.artifacts[0];
        assert_eq!(first.short_code, "001");
        assert_eq!(first.sources, vec![a, b]);
        assert_eq!(first.path, out.join("001_merged.zip"));
        assert_eq!(first.page_count, 3);
        let names: Vec<_> = zip_entries(&first.path).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["0001_A_1.png", "0002_A_2.png", "0003_B_1.png"]);
        assert_eq!(report.artifacts[1].sources, vec![c]);
    }

    #[test]
    fn group_order_follows_sequence_not_slice_position() {
        let root = tempfile::tempdir().unwrap();
        let a = make_folder(root.path(), "A", &["p.png"]);
        let b = make_folder(root.path(), "B", &["p.png"]);
        let items = vec![
            result(b.clone(), 5, Some("X"), ScanStatus::Success),
            result(a.clone(), 2, Some("X"), ScanStatus::Success),
        ];
        let opts = MergeOptions { output_option: OutputOption::CoLocated, suffix: String::new(), output_folder: None };
        let report = merge(&items, &opts, &ZipAssembler);
        assert_eq!(report.artifacts[0].sources, vec![a, b]);
        assert_eq!(report.artifacts[0].path, root.path().join("X.zip"));
    }

    #[test]
    fn unclassified_and_failed_items_are_reported_unmerged() {
        let root = tempfile::tempdir().unwrap();
        let a = make_folder(root.path(), "A", &["p.png"]);
        let items = vec![
            result(a.clone(), 0, Some("X"), ScanStatus::Success),
            result(root.path().join("B"), 1, None, ScanStatus::Success),
            result(root.path().join("C"), 2, Some("X"), ScanStatus::Failed),
            result(root.path().join("D"), 3, None, ScanStatus::Skipped),
        ];
        let opts = MergeOptions { output_option: OutputOption::CoLocated, suffix: String::new(), output_folder: None };
        let report = merge(&items, &opts, &ZipAssembler);
        assert_eq!(report.artifacts.len(), 1);
        let reasons: Vec<_> = report.unmerged.iter().map(|u| u.reason).collect();
        assert_eq!(reasons, vec![UnmergedReason::Unclassified, UnmergedReason::Failed, UnmergedReason::Skipped]);
    }

    #[test]
    fn unreadable_group_fails_alone() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("out");
        let a = make_folder(root.path(), "A", &["p.png"]);
        let gone = root.path().join("vanished");
        let c = make_folder(root.path(), "C", &["p.png"]);
        let items = vec![
            result(a, 0, Some("X"), ScanStatus::Success),
            result(gone, 1, Some("X"), ScanStatus::Success),
            result(c, 2, Some("Y"), ScanStatus::Success),
        ];
        let opts = MergeOptions { output_option: OutputOption::Folder, suffix: String::new(), output_folder: Some(out.clone()) };
        let report = merge(&items, &opts, &ZipAssembler);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].group, "X");
        assert!(!out.join("X.zip").exists());
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].short_code, "Y");
        // 失败组不留下临时文件
        assert_eq!(fs::read_dir(&out).unwrap().count(), 1);
    }

    #[test]
    fn folder_option_requires_output_folder() {
        let root = tempfile::tempdir().unwrap();
        let a = make_folder(root.path(), "A", &["p.png"]);
        let items = vec![result(a, 0, Some("X"), ScanStatus::Success)];
        let opts = MergeOptions { output_option: OutputOption::Folder, suffix: String::new(), output_folder: None };
        let report = merge(&items, &opts, &ZipAssembler);
        assert!(matches!(report.failures[0].cause, MergeCause::NoOutputFolder));
    }

    #[test]
    fn artifact_names_do_not_repeat_extension() {
        assert_eq!(artifact_name("GCN", "", "zip"), "GCN.zip");
        assert_eq!(artifact_name("GCN", "_2024", "zip"), "GCN_2024.zip");
        assert_eq!(artifact_name("GCN", "_merged.ZIP", "zip"), "GCN_merged.ZIP");
    }
}

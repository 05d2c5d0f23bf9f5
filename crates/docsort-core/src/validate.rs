//! 批处理文件夹列表解析与校验
use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::types::{BatchEntry, EntryStatus, InvalidReason};

/// 列出文件夹内的页面：深度为 1 的常规文件，忽略隐藏文件，按文件名排序
pub fn list_page_files(folder: &Path) -> io::Result<Vec<PathBuf>> {
    let mut pages: Vec<PathBuf> = vec![];
    for entry in WalkDir::new(folder).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() { continue; }
        let hidden = entry.file_name().to_str().map_or(false, |n| n.starts_with('.'));
        if !hidden { pages.push(entry.into_path()); }
    }
    // 按文件名排序，确保页序稳定
    pages.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(pages)
}

/// 解析列表文本：每行一个路径；忽略空行与 `#` 注释；相对路径基于 `base` 解析
pub fn parse_folder_list(text: &str, base: &Path) -> Vec<PathBuf> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            let p = PathBuf::from(l);
            if p.is_absolute() { p } else { base.join(p) }
        })
        .collect()
}

/// 校验单个文件夹：存在、是目录、至少一个页面
pub fn check_folder(path: &Path) -> EntryStatus {
    let md = match std::fs::metadata(path) {
        Ok(md) => md,
        Err(_) => return EntryStatus::Invalid(InvalidReason::NotFound),
    };
    if !md.is_dir() { return EntryStatus::Invalid(InvalidReason::NotADirectory); }
    match list_page_files(path) {
        Ok(pages) if !pages.is_empty() => EntryStatus::Validated,
        // 目录不可读也视为空（无法取得任何页面）
        _ => EntryStatus::Invalid(InvalidReason::Empty),
    }
}

/// 按输入顺序校验路径列表；单条无效不会报错
pub fn validate_paths(paths: &[PathBuf]) -> Vec<BatchEntry> {
    paths
        .iter()
        .enumerate()
        .map(|(i, p)| BatchEntry { folder_path: p.clone(), sequence_index: i, status: check_folder(p) })
        .collect()
}

/// 读取列表文件并校验；仅当列表文件本身读取失败时返回错误
pub fn validate_list(list_path: &Path) -> Result<Vec<BatchEntry>> {
    let text = std::fs::read_to_string(list_path)
        .with_context(|| format!("read folder list {}", list_path.display()))?;
    let base = list_path.parent().unwrap_or_else(|| Path::new("."));
    Ok(validate_paths(&parse_folder_list(&text, base)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn mixed_list_preserves_order_and_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("doc1");
        fs::create_dir(&good).unwrap();
        fs::write(good.join("page1.png"), b"x").unwrap();
        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        fs::write(empty.join(".DS_Store"), b"x").unwrap();
        let file = dir.path().join("note.txt");
        fs::write(&file, b"x").unwrap();

        let list = dir.path().join("list.txt");
        fs::write(
            &list,
            format!("# batch\ndoc1\n\n{}\nempty\nnote.txt\n", dir.path().join("missing").display()),
        )
        .unwrap();

        let entries = validate_list(&list).unwrap();
        let statuses: Vec<_> = entries.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                EntryStatus::Validated,
                EntryStatus::Invalid(InvalidReason::NotFound),
                EntryStatus::Invalid(InvalidReason::Empty),
                EntryStatus::Invalid(InvalidReason::NotADirectory),
            ]
        );
        assert_eq!(entries[0].folder_path, good);
        assert_eq!(entries.iter().map(|e| e.sequence_index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn missing_list_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_list(&dir.path().join("nope.txt")).is_err());
    }

    #[test]
    fn pages_are_sorted_and_skip_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.png"), b"x").unwrap();
        fs::write(dir.path().join("a.png"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let names: Vec<_> = list_page_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
    }
}

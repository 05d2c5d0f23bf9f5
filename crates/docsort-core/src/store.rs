//! 规则存储（持久化 + 快照发布）
//!
//! - 磁盘格式为带版本号的 TOML，规则以短代码为键；导出/导入使用同结构的 JSON。
//! - 每次变更：先校验并编译新快照 → 原子落盘（临时文件 + rename）→ 发布快照。
//!   落盘失败时内存状态保持不变。
//! - 扫描任务通过 `RuleHandle::current()` 在任务开始时取得不可变快照。
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

use crate::classifier::Classifier;
use crate::error::{StoreError, ValidationError};
use crate::rules::{assign_missing_ids, default_rules, parse_rules_toml, Rule, RuleDraft, RuleSnapshot};

/// 规则快照发布点（可克隆，跨线程共享）
#[derive(Clone)]
pub struct RuleHandle {
    inner: Arc<RwLock<Arc<Classifier>>>,
}

impl RuleHandle {
    pub fn new(classifier: Classifier) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(classifier))) }
    }

    /// 当前快照；之后的规则变更不会影响已取得的快照
    pub fn current(&self) -> Arc<Classifier> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn publish(&self, classifier: Classifier) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(classifier);
    }
}

impl Default for RuleHandle {
    fn default() -> Self { Self::new(Classifier::empty()) }
}

/// 规则存储：独占规则的生命周期
pub struct RuleStore {
    path: PathBuf,
    /// 短代码 -> 规则
    rules: BTreeMap<String, Rule>,
    handle: RuleHandle,
}

impl RuleStore {
    /// 打开存储；文件不存在时写入默认规则集
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let rules = match std::fs::read_to_string(&path) {
            Ok(txt) => parse_rules_toml(&txt)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let defaults = default_rules()?;
                write_atomically(&path, &defaults)?;
                info!(path = ?path, rules = defaults.len(), "seeded default rules");
                defaults
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let handle = RuleHandle::new(Classifier::new(rules.clone())?);
        let rules = rules.into_iter().map(|r| (r.short_code.clone(), r)).collect();
        Ok(Self { path, rules, handle })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// 快照发布点（交给扫描编排器）
    pub fn handle(&self) -> RuleHandle { self.handle.clone() }

    /// 全部规则（按短代码排序）
    pub fn list(&self) -> Vec<Rule> { self.rules.values().cloned().collect() }

    pub fn get(&self, full_name: &str) -> Option<&Rule> {
        let name = full_name.trim();
        self.rules.values().find(|r| r.full_name == name)
    }

    /// 按 full_name 插入或更新
    pub fn save(&mut self, draft: &RuleDraft) -> Result<Rule, StoreError> {
        let draft = draft.normalized()?;
        if let Some(other) = self.rules.get(&draft.short_code) {
            if other.full_name != draft.full_name {
                return Err(ValidationError::ShortCodeTaken {
                    short_code: draft.short_code,
                    existing: other.full_name.clone(),
                }
                .into());
            }
        }

        let mut next = self.rules.clone();
        let previous = next.values().find(|r| r.full_name == draft.full_name).map(|r| (r.short_code.clone(), r.id));
        let id = match previous {
            Some((old_code, id)) => {
                // 更新时短代码可能变化，移除旧键
                next.remove(&old_code);
                id
            }
            None => next.values().map(|r| r.id).max().unwrap_or(0) + 1,
        };
        let rule = Rule { id, full_name: draft.full_name, short_code: draft.short_code, keywords: draft.keywords };
        next.insert(rule.short_code.clone(), rule.clone());
        self.commit(next)?;
        Ok(rule)
    }

    /// 按 full_name 删除；不存在时不报错。返回是否确有删除
    pub fn delete(&mut self, full_name: &str) -> Result<bool, StoreError> {
        let name = full_name.trim();
        let code = match self.rules.values().find(|r| r.full_name == name) {
            Some(r) => r.short_code.clone(),
            None => return Ok(false),
        };
        let mut next = self.rules.clone();
        next.remove(&code);
        self.commit(next)?;
        Ok(true)
    }

    pub fn reset_to_defaults(&mut self) -> Result<(), StoreError> {
        let next = default_rules()?.into_iter().map(|r| (r.short_code.clone(), r)).collect();
        self.commit(next)
    }

    /// 导出为带版本号的 JSON 快照
    pub fn export(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(&RuleSnapshot::from_rules(self.rules.values()))?)
    }

    /// 导入快照
    /// - merge=false：整体替换（全部合法才生效）
    /// - merge=true：短代码冲突的条目被覆盖，其余追加；同名（full_name）旧条目也被替换
    pub fn import(&mut self, snapshot: &str, merge: bool) -> Result<usize, StoreError> {
        let snapshot: RuleSnapshot = serde_json::from_str(snapshot)?;
        let incoming = snapshot.into_rules()?;
        let count = incoming.len();

        let next = if merge {
            let mut next = self.rules.clone();
            for mut rule in incoming {
                let same_name = next.values().find(|r| r.full_name == rule.full_name).map(|r| r.short_code.clone());
                if let Some(code) = same_name { next.remove(&code); }
                match next.get(&rule.short_code) {
                    Some(existing) => rule.id = existing.id,
                    None => rule.id = 0,
                }
                next.insert(rule.short_code.clone(), rule);
            }
            let mut list: Vec<Rule> = next.into_values().collect();
            assign_missing_ids(&mut list);
            list.into_iter().map(|r| (r.short_code.clone(), r)).collect()
        } else {
            incoming.into_iter().map(|r| (r.short_code.clone(), r)).collect()
        };
        self.commit(next)?;
        info!(imported = count, merge, "imported rules");
        Ok(count)
    }

    /// 编译 → 落盘 → 替换内存状态 → 发布快照
    fn commit(&mut self, next: BTreeMap<String, Rule>) -> Result<(), StoreError> {
        let list: Vec<Rule> = next.values().cloned().collect();
        let classifier = Classifier::new(list.clone())?;
        write_atomically(&self.path, &list)?;
        self.rules = next;
        self.handle.publish(classifier);
        Ok(())
    }
}

fn write_atomically(path: &Path, rules: &[Rule]) -> Result<(), StoreError> {
    let txt = toml::to_string_pretty(&RuleSnapshot::from_rules(rules))?;
    let io_err = |source: std::io::Error| StoreError::Io { path: path.to_path_buf(), source };
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(txt.as_bytes()).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RuleStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::open(dir.path().join("rules.toml")).unwrap();
        (dir, store)
    }

    #[test]
    fn open_seeds_defaults_and_persists() {
        let (dir, store) = open_temp();
        assert!(dir.path().join("rules.toml").exists());
        assert_eq!(store.list(), default_rules().unwrap());
        let reopened = RuleStore::open(dir.path().join("rules.toml")).unwrap();
        assert_eq!(reopened.list(), store.list());
    }

    #[test]
    fn save_inserts_then_updates_by_full_name() {
        let (_dir, mut store) = open_temp();
        let before = store.list().len();
        let r = store.save(&RuleDraft::new("Biên bản bàn giao", "bbbg", &["biên bản", "bàn giao"])).unwrap();
        assert_eq!(r.short_code, "BBBG");
        assert_eq!(store.list().len(), before + 1);

        let updated = store.save(&RuleDraft::new("Biên bản bàn giao", "BBG", &["bàn giao"])).unwrap();
        assert_eq!(updated.id, r.id);
        let matching: Vec<_> = store.list().into_iter().filter(|x| x.full_name == "Biên bản bàn giao").collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].short_code, "BBG");
        assert_eq!(store.list().len(), before + 1);
        assert_eq!(store.get("  Biên bản bàn giao ").map(|r| r.short_code.as_str()), Some("BBG"));
        assert!(store.get("Không có").is_none());
    }

    #[test]
    fn save_rejects_short_code_collision() {
        let (_dir, mut store) = open_temp();
        let err = store.save(&RuleDraft::new("Khác", "gcn", &[])).unwrap_err();
        assert!(matches!(err, StoreError::Validation(ValidationError::ShortCodeTaken { .. })));
        let err = store.save(&RuleDraft::new("   ", "X", &[])).unwrap_err();
        assert!(matches!(err, StoreError::Validation(ValidationError::EmptyFullName)));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, mut store) = open_temp();
        assert!(store.delete("Căn cước công dân").unwrap());
        assert!(!store.delete("Căn cước công dân").unwrap());
        assert!(store.list().iter().all(|r| r.short_code != "CCCD"));
    }

    #[test]
    fn reset_restores_defaults() {
        let (_dir, mut store) = open_temp();
        store.delete("Căn cước công dân").unwrap();
        store.save(&RuleDraft::new("Mới", "NEW", &["mới"])).unwrap();
        store.reset_to_defaults().unwrap();
        assert_eq!(store.list(), default_rules().unwrap());
    }

    #[test]
    fn export_import_round_trip() {
        let (_dir, mut store) = open_temp();
        store.save(&RuleDraft::new("Mới", "NEW", &["mới", "khác"])).unwrap();
        let before = store.list();
        let snapshot = store.export().unwrap();
        store.reset_to_defaults().unwrap();
        store.import(&snapshot, false).unwrap();
        assert_eq!(store.list(), before);
    }

    #[test]
    fn import_merge_overwrites_colliding_codes() {
        let (dir, mut store) = open_temp();
        let mut other = RuleStore::open(dir.path().join("other.toml")).unwrap();
        other.delete("Căn cước công dân").unwrap();
        other.save(&RuleDraft::new("Giấy chứng nhận (mẫu mới)", "GCN2", &["mẫu mới"])).unwrap();
        // 先删除旧 GCN 再以新全称占用该短代码
        other.delete("Giấy chứng nhận quyền sử dụng đất").unwrap();
        other.save(&RuleDraft::new("Sổ đỏ", "GCN", &["sổ đỏ"])).unwrap();
        let snapshot = other.export().unwrap();

        let before = store.list().len();
        store.import(&snapshot, true).unwrap();
        let list = store.list();
        let gcn = list.iter().find(|r| r.short_code == "GCN").unwrap();
        assert_eq!(gcn.full_name, "Sổ đỏ");
        assert!(list.iter().any(|r| r.short_code == "CCCD"), "merge keeps entries absent from snapshot");
        assert!(list.iter().any(|r| r.short_code == "GCN2"));
        assert_eq!(list.len(), before + 1);
        let ids: std::collections::HashSet<_> = list.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), list.len());
    }

    #[test]
    fn invalid_import_leaves_store_untouched() {
        let (_dir, mut store) = open_temp();
        let before = store.list();
        let bad = r#"{"version":1,"rules":{"A":{"id":1,"full_name":"X"},"B":{"id":2,"full_name":"X"}}}"#;
        assert!(store.import(bad, false).is_err());
        assert!(store.import("{\"version\":2}", false).is_err());
        assert_eq!(store.list(), before);
    }

    #[test]
    fn handle_snapshots_are_isolated_from_later_edits() {
        let (_dir, mut store) = open_temp();
        let handle = store.handle();
        let snapshot = handle.current();
        store.delete("Giấy chứng nhận quyền sử dụng đất").unwrap();
        assert!(snapshot.rules().iter().any(|r| r.short_code == "GCN"));
        assert!(handle.current().rules().iter().all(|r| r.short_code != "GCN"));
    }
}

//! 规则模型与规则文件（TOML / JSON 快照）
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{StoreError, ValidationError};

/// 短代码最大长度（字符数）
pub const SHORT_CODE_MAX_LEN: usize = 10;
/// 快照/存储文件格式版本
pub const SNAPSHOT_VERSION: u32 = 1;

/// 内置默认规则集
const DEFAULT_RULES_TOML: &str = include_str!("../rules/default.toml");

/// 文档类型规则：全称 + 短代码 + 关键词
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: u32,
    pub full_name: String,
    pub short_code: String,
    pub keywords: Vec<String>,
}

/// 待保存的规则输入（尚未校验）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub full_name: String,
    pub short_code: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl RuleDraft {
    pub fn new(full_name: impl Into<String>, short_code: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            full_name: full_name.into(),
            short_code: short_code.into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// 在存储边界做校验与归一化：
    /// - 全称、短代码去首尾空白后不得为空
    /// - 短代码转大写，长度不超过 SHORT_CODE_MAX_LEN
    /// - 关键词去空白、去空、按首次出现去重
    pub(crate) fn normalized(&self) -> Result<RuleDraft, ValidationError> {
        let full_name = self.full_name.trim().to_string();
        if full_name.is_empty() { return Err(ValidationError::EmptyFullName); }
        let short_code = self.short_code.trim().to_uppercase();
        if short_code.is_empty() { return Err(ValidationError::EmptyShortCode); }
        if short_code.chars().count() > SHORT_CODE_MAX_LEN {
            return Err(ValidationError::ShortCodeTooLong(short_code));
        }
        let mut seen = HashSet::new();
        let keywords = self
            .keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .filter(|k| seen.insert(k.to_string()))
            .map(str::to_string)
            .collect();
        Ok(RuleDraft { full_name, short_code, keywords })
    }
}

/// 落盘/导出时的单条规则（键为短代码）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredRule {
    pub id: u32,
    pub full_name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// 顶层快照结构：带版本号，规则按短代码为键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RuleSnapshot {
    pub version: u32,
    #[serde(default)]
    pub rules: BTreeMap<String, StoredRule>,
}

impl RuleSnapshot {
    pub(crate) fn from_rules<'a>(rules: impl IntoIterator<Item = &'a Rule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|r| {
                let stored = StoredRule { id: r.id, full_name: r.full_name.clone(), keywords: r.keywords.clone() };
                (r.short_code.clone(), stored)
            })
            .collect();
        Self { version: SNAPSHOT_VERSION, rules }
    }

    /// 校验快照并转换为规则列表（全部合法才返回）
    pub(crate) fn into_rules(self) -> Result<Vec<Rule>, StoreError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion(self.version));
        }
        let mut out: Vec<Rule> = Vec::with_capacity(self.rules.len());
        let mut names: HashSet<String> = HashSet::new();
        let mut codes: BTreeMap<String, String> = BTreeMap::new();
        for (code, stored) in self.rules {
            let draft = RuleDraft { full_name: stored.full_name, short_code: code, keywords: stored.keywords }.normalized()?;
            if !names.insert(draft.full_name.clone()) {
                return Err(ValidationError::DuplicateFullName(draft.full_name).into());
            }
            // 键在归一化（大写）后可能冲突，例如 "gcn" 与 "GCN"
            if let Some(existing) = codes.insert(draft.short_code.clone(), draft.full_name.clone()) {
                return Err(ValidationError::ShortCodeTaken { short_code: draft.short_code, existing }.into());
            }
            out.push(Rule { id: stored.id, full_name: draft.full_name, short_code: draft.short_code, keywords: draft.keywords });
        }
        assign_missing_ids(&mut out);
        Ok(out)
    }
}

/// 保证 id 唯一：重复的 id 重新分配为当前最大值之后的序号
pub(crate) fn assign_missing_ids(rules: &mut [Rule]) {
    let mut next = rules.iter().map(|r| r.id).max().unwrap_or(0) + 1;
    let mut used = HashSet::new();
    for r in rules.iter_mut() {
        if r.id == 0 || !used.insert(r.id) {
            r.id = next;
            used.insert(next);
            next += 1;
        }
    }
}

/// 解析 TOML 规则文件（存储文件与默认规则共用格式）
pub(crate) fn parse_rules_toml(txt: &str) -> Result<Vec<Rule>, StoreError> {
    let parsed: RuleSnapshot = toml::from_str(txt)?;
    parsed.into_rules()
}

/// 内置默认规则集
pub fn default_rules() -> Result<Vec<Rule>, StoreError> {
    parse_rules_toml(DEFAULT_RULES_TOML)
}

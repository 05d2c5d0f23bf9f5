//! 规则分类器（Aho-Corasick 多模式匹配）
//!
//! 设计要点：
//! - 将所有规则关键词的变体（含容错变体）编译进同一个 AC 自动机，文本只扫描一遍。
//! - 变体 → (规则下标, 关键词下标) 的反向映射；同一变体可归属多个关键词。
//! - 规则得分 = 命中的不同关键词数 / 关键词总数（覆盖率）。
//! - 平分时：命中关键词数多者胜；仍平分则 full_name 字典序小者胜。
use aho_corasick::{AhoCorasick, BuildError, MatchKind};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::rules::Rule;
use crate::variants::{generate, normalize};

/// 容错变体的最小长度；更短的变体几乎匹配任何文本，不参与匹配（规范形式不受此限）
pub const MIN_TYPO_VARIANT_LEN: usize = 3;

/// 分类结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub rule: Option<Rule>,
    /// 覆盖率 0.0..=1.0；未命中时为 0
    pub confidence: f32,
    pub matched_keywords: usize,
}

/// 编译后的不可变分类器（即一次规则快照）
pub struct Classifier {
    rules: Vec<Rule>,
    /// 全局变体自动机（无任何模式时为 None）
    ac: Option<AhoCorasick>,
    /// 模式索引 -> 所属 (规则下标, 关键词下标) 列表
    owners: Vec<Vec<(usize, usize)>>,
}

impl Classifier {
    pub fn new(rules: Vec<Rule>) -> Result<Self, BuildError> {
        let mut patterns: Vec<String> = Vec::new();
        let mut owners: Vec<Vec<(usize, usize)>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for (ri, rule) in rules.iter().enumerate() {
            for (ki, kw) in rule.keywords.iter().enumerate() {
                for (vi, v) in generate(kw, true).into_iter().enumerate() {
                    if v.is_empty() { continue; }
                    if vi > 0 && v.chars().count() < MIN_TYPO_VARIANT_LEN { continue; }
                    let id = match index.get(&v) {
                        Some(id) => *id,
                        None => {
                            let id = patterns.len();
                            index.insert(v.clone(), id);
                            patterns.push(v);
                            owners.push(Vec::new());
                            id
                        }
                    };
                    if !owners[id].contains(&(ri, ki)) { owners[id].push((ri, ki)); }
                }
            }
        }

        // Standard 语义才支持重叠查找
        let ac = if patterns.is_empty() {
            None
        } else {
            Some(AhoCorasick::builder().match_kind(MatchKind::Standard).build(&patterns)?)
        };
        Ok(Self { rules, ac, owners })
    }

    /// 一个空分类器（不匹配任何文本）
    pub fn empty() -> Self {
        Self { rules: Vec::new(), ac: None, owners: Vec::new() }
    }

    pub fn rules(&self) -> &[Rule] { &self.rules }

    /// 对文本分类；纯函数，无副作用
    ///
    /// 关键词按容错变体展开后匹配，但长度不足 MIN_TYPO_VARIANT_LEN 的容错变体被忽略，
    /// 规范形式始终参与匹配。
    pub fn classify(&self, text: &str) -> Classification {
        let none = Classification { rule: None, confidence: 0.0, matched_keywords: 0 };
        let ac = match &self.ac { Some(ac) => ac, None => return none };
        let normalized = normalize(text);

        let mut hits: Vec<Vec<bool>> = self.rules.iter().map(|r| vec![false; r.keywords.len()]).collect();
        for m in ac.find_overlapping_iter(&normalized) {
            for &(ri, ki) in &self.owners[m.pattern().as_usize()] {
                hits[ri][ki] = true;
            }
        }

        // (规则下标, 命中数, 关键词数)
        let mut best: Option<(usize, usize, usize)> = None;
        for (ri, rule) in self.rules.iter().enumerate() {
            let total = rule.keywords.len();
            let matched = hits[ri].iter().filter(|h| **h).count();
            if matched == 0 || total == 0 { continue; }
            let better = match best {
                None => true,
                Some((bi, bm, bt)) => rank(matched, total, &rule.full_name, bm, bt, &self.rules[bi].full_name) == Ordering::Less,
            };
            if better { best = Some((ri, matched, total)); }
        }

        match best {
            Some((ri, matched, total)) => Classification {
                rule: Some(self.rules[ri].clone()),
                confidence: matched as f32 / total as f32,
                matched_keywords: matched,
            },
            None => none,
        }
    }
}

/// 候选排序：覆盖率降序 → 命中数降序 → full_name 升序（Less 表示 a 更优）
/// 覆盖率用交叉相乘比较，避免浮点误差
fn rank(am: usize, at: usize, an: &str, bm: usize, bt: usize, bn: &str) -> Ordering {
    (bm * at).cmp(&(am * bt))
        .then_with(|| bm.cmp(&am))
        .then_with(|| an.cmp(bn))
}

/// 便捷入口：按给定规则即时编译并分类（匹配规则同 `Classifier::classify`，短容错变体不参与）
pub fn classify(text: &str, rules: &[Rule]) -> Result<Classification, BuildError> {
    Ok(Classifier::new(rules.to_vec())?.classify(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rule(id: u32, name: &str, code: &str, kws: &[&str]) -> Rule {
        Rule {
            id,
            full_name: name.to_string(),
            short_code: code.to_string(),
            keywords: kws.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn sample_rules() -> Vec<Rule> {
        vec![
            rule(1, "Giấy chứng nhận quyền sử dụng đất", "GCN", &["giấy chứng nhận", "quyền sử dụng đất"]),
            rule(2, "Hợp đồng chuyển nhượng", "HDCN", &["hợp đồng", "chuyển nhượng", "bên nhận chuyển nhượng"]),
            rule(3, "Căn cước công dân", "CCCD", &["căn cước", "công dân"]),
        ]
    }

    #[test]
    fn picks_rule_with_best_coverage() {
        let c = Classifier::new(sample_rules()).unwrap();
        let text = "CỘNG HÒA ... GIẤY CHỨNG NHẬN\nquyền   sử dụng đất, quyền sở hữu nhà ở";
        let out = c.classify(text);
        assert_eq!(out.rule.unwrap().short_code, "GCN");
        assert_eq!(out.confidence, 1.0);
        assert_eq!(out.matched_keywords, 2);
    }

    #[test]
    fn tolerates_ocr_typos() {
        let c = Classifier::new(sample_rules()).unwrap();
        let out = c.classify("giay chumg nhan so 123");
        assert_eq!(out.rule.unwrap().short_code, "GCN");
        assert_eq!(out.confidence, 0.5);
    }

    #[test]
    fn no_match_returns_none() {
        let c = Classifier::new(sample_rules()).unwrap();
        let out = c.classify("lorem ipsum dolor sit amet");
        assert!(out.rule.is_none());
        assert_eq!(out.confidence, 0.0);
        assert!(Classifier::empty().classify("giấy chứng nhận").rule.is_none());
    }

    #[test]
    fn tie_break_prefers_lexicographically_smaller_full_name() {
        let rules = vec![
            rule(1, "Beta", "B", &["thua dat"]),
            rule(2, "Alpha", "A", &["thua dat"]),
        ];
        let out = classify("ban do thua dat", &rules).unwrap();
        assert_eq!(out.rule.unwrap().full_name, "Alpha");
    }

    #[test]
    fn tie_break_prefers_more_matched_keywords() {
        let rules = vec![
            rule(1, "Alpha", "A", &["thua dat"]),
            rule(2, "Beta", "B", &["thua dat", "ban ve"]),
        ];
        let out = classify("ban ve thua dat", &rules).unwrap();
        assert_eq!(out.rule.unwrap().short_code, "B");
        assert_eq!(out.matched_keywords, 2);
    }

    #[test]
    fn coverage_outranks_absolute_count() {
        let rules = vec![
            rule(1, "Alpha", "A", &["hop dong", "ben a", "ben b", "cong chung"]),
            rule(2, "Beta", "B", &["tang cho"]),
        ];
        let out = classify("hop dong tang cho ben a", &rules).unwrap();
        assert_eq!(out.rule.unwrap().short_code, "B");
    }

    #[test]
    fn short_typo_variants_do_not_match() {
        let rules = vec![rule(1, "Giấy chứng nhận", "GCN", &["GCN"])];
        assert!(classify("gn xyz", &rules).unwrap().rule.is_none());
        assert!(classify("so gcn 01", &rules).unwrap().rule.is_some());
    }

    proptest! {
        #[test]
        fn classify_is_pure(text in "[a-zA-Zàáảãạđêôơư0-9 \n]{0,120}") {
            let c = Classifier::new(sample_rules()).unwrap();
            prop_assert_eq!(c.classify(&text), c.classify(&text));
            prop_assert_eq!(classify(&text, &sample_rules()).unwrap(), c.classify(&text));
        }
    }
}

//! 文本归一化与关键词容错变体生成
//!
//! 归一化：小写 → 去除变音符（NFD 后丢弃组合记号，`đ` 单独映射为 `d`）→ 空白折叠。
//! 容错变体：相邻交换、单字符删除、按“邻键表”单字符替换。
//! 生成顺序固定，因此给定关键词与开关时结果确定。
use std::collections::HashSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// 超过该长度（字符数）的关键词不生成容错变体
pub const TYPO_MAX_KEYWORD_LEN: usize = 48;
/// 变体数量上限 = 关键词长度 × 该系数（不含规范形式本身）
pub const VARIANTS_PER_CHAR: usize = 8;

/// 归一化文本：小写、去变音符、空白折叠
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| match c {
            'đ' | 'Đ' => 'd',
            _ => c,
        })
        .flat_map(char::to_lowercase)
        .collect();
    collapse_whitespace(&folded)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 生成关键词变体集合（首个元素总是规范形式）
/// - include_typos=false：仅返回 `normalize(keyword)`
/// - include_typos=true：额外加入交换/删除/邻键替换变体，受长度与数量上限约束
pub fn generate(keyword: &str, include_typos: bool) -> Vec<String> {
    let canonical = normalize(keyword);
    let mut set = VariantSet::new(canonical.chars().count() * VARIANTS_PER_CHAR);
    set.items.push(canonical.clone());
    set.seen.insert(canonical.clone());

    let chars: Vec<char> = canonical.chars().collect();
    let n = chars.len();
    if !include_typos || n == 0 || n > TYPO_MAX_KEYWORD_LEN { return set.items; }

    // 1) 相邻交换
    for i in 0..n.saturating_sub(1) {
        if chars[i] == chars[i + 1] { continue; }
        let mut v = chars.clone();
        v.swap(i, i + 1);
        if !set.push(&v) { return set.items; }
    }
    // 2) 单字符删除（空白不删，避免与空白折叠重复）
    for i in 0..n {
        if chars[i].is_whitespace() { continue; }
        let mut v = chars.clone();
        v.remove(i);
        if !set.push(&v) { return set.items; }
    }
    // 3) 邻键替换
    for i in 0..n {
        for k in nearby_keys(chars[i]).chars() {
            let mut v = chars.clone();
            v[i] = k;
            if !set.push(&v) { return set.items; }
        }
    }
    set.items
}

/// 去重且有上限的变体集合
struct VariantSet {
    seen: HashSet<String>,
    items: Vec<String>,
    budget: usize,
}

impl VariantSet {
    fn new(budget: usize) -> Self {
        Self { seen: HashSet::new(), items: Vec::new(), budget }
    }

    /// 加入一个变体；达到上限时返回 false
    fn push(&mut self, chars: &[char]) -> bool {
        if self.items.len() > self.budget { return false; }
        let s = collapse_whitespace(&chars.iter().collect::<String>());
        if !s.is_empty() && self.seen.insert(s.clone()) {
            self.items.push(s);
        }
        self.items.len() <= self.budget
    }
}

/// 固定邻键表：QWERTY 键盘相邻键 + 常见 OCR 混淆（0/o、1/l/i、5/s、8/b）
fn nearby_keys(c: char) -> &'static str {
    match c {
        'q' => "wa",
        'w' => "qes",
        'e' => "wrd",
        'r' => "etf",
        't' => "ryg",
        'y' => "tuh",
        'u' => "yij",
        'i' => "uok1",
        'o' => "ipl0",
        'p' => "ol",
        'a' => "qsz",
        's' => "adw5",
        'd' => "sfe",
        'f' => "dgr",
        'g' => "fht",
        'h' => "gjy",
        'j' => "hku",
        'k' => "jli",
        'l' => "ko1",
        'z' => "xa",
        'x' => "zcs",
        'c' => "xvd",
        'v' => "cbf",
        'b' => "vng8",
        'n' => "bmh",
        'm' => "nj",
        '0' => "9o",
        '1' => "2li",
        '2' => "13",
        '3' => "24",
        '4' => "35",
        '5' => "46s",
        '6' => "57",
        '7' => "68",
        '8' => "79b",
        '9' => "80",
        _ => "",
    }
}

//! 分词模块
//!
//! 把检索查询切分为标签集合。含 CJK 字符时用 jieba-rs 分词，否则按非字母数字字符切分。

use std::collections::BTreeSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;
use regex::Regex;

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();
static SEPARATORS: OnceLock<Regex> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn separators() -> &'static Regex {
    SEPARATORS.get_or_init(|| Regex::new(r"[^\p{L}\p{N}_+#]+").expect("separator regex is valid"))
}

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 分词：小写化，丢弃单字符的非 CJK 片段
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| s.chars().count() > 1 || s.chars().next().is_some_and(is_cjk))
            .collect()
    } else {
        separators()
            .split(text)
            .map(|s| s.to_lowercase())
            .filter(|s| s.chars().count() > 1)
            .collect()
    }
}

/// 查询 → 标签集合
pub fn tokenize_to_tags(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

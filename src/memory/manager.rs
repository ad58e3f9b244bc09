//! 分层记忆管理器
//!
//! 四个逻辑分区：
//! - **short_term**：观察 / 动作 / 失败记录，容量有界，按 `importance - 0.5 * age_days` 淘汰
//! - **working**：任务范围的键值草稿（WorkingKey），溢出时按实时相关度淘汰
//! - **conversation**：有界对话日志
//! - **patterns**：按名称归并的已学习模式，可持久化
//!
//! 单一所有者（一个 Agent 或一个工作流），不在并发写者之间共享。

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MemorySection;
use crate::memory::item::clamp_unit;
use crate::memory::{tokenize_to_tags, ConversationMemory, MemoryItem, MemoryKind, Message, Role, WorkingKey};

/// consolidate：importance 超过该值的短期条目提升为模式
const CONSOLIDATE_MIN_IMPORTANCE: f64 = 0.8;
/// consolidate：访问次数超过该值的短期条目提升为模式
const CONSOLIDATE_MIN_ACCESSES: u32 = 5;
/// cleanup：importance 超过该值的条目不因过期被删除
const CLEANUP_KEEP_IMPORTANCE: f64 = 0.7;
/// consolidate 产生的模式带有的标签
pub const AUTO_DERIVED_TAG: &str = "auto_derived";

/// 各分区条目数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub short_term: usize,
    pub working: usize,
    pub conversation: usize,
    pub patterns: usize,
}

/// 分层记忆管理器
#[derive(Debug, Clone)]
pub struct MemoryManager {
    owner: Option<String>,
    short_term: Vec<MemoryItem>,
    working: HashMap<WorkingKey, MemoryItem>,
    conversation: ConversationMemory,
    patterns: BTreeMap<String, MemoryItem>,
    short_term_capacity: usize,
    working_capacity: usize,
    next_id: u64,
}

impl MemoryManager {
    pub fn new(limits: &MemorySection) -> Self {
        Self {
            owner: None,
            short_term: Vec::new(),
            working: HashMap::new(),
            conversation: ConversationMemory::new(limits.conversation_capacity),
            patterns: BTreeMap::new(),
            short_term_capacity: limits.short_term_capacity,
            working_capacity: limits.working_capacity,
            next_id: 1,
        }
    }

    /// 记录条目的来源 Agent
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ---------- 短期 ----------

    /// 追加到短期分区；超出容量时淘汰 `importance - 0.5 * age_days` 最低者
    pub fn add_observation<I, S>(
        &mut self,
        content: serde_json::Value,
        kind: MemoryKind,
        importance: f64,
        tags: I,
        confidence: f64,
    ) -> u64
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.alloc_id();
        let item = MemoryItem::new(id, content, kind, importance)
            .with_tags(tags)
            .with_source(self.owner.clone())
            .with_confidence(confidence);
        self.short_term.push(item);
        self.evict_short_term(Utc::now());
        id
    }

    fn evict_short_term(&mut self, now: DateTime<Utc>) {
        while self.short_term.len() > self.short_term_capacity {
            let victim = self
                .short_term
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.eviction_score(now)
                        .total_cmp(&b.eviction_score(now))
                        .then(a.id.cmp(&b.id))
                })
                .map(|(idx, _)| idx);
            match victim {
                Some(idx) => {
                    self.short_term.remove(idx);
                }
                None => break,
            }
        }
    }

    pub fn short_term(&self) -> &[MemoryItem] {
        &self.short_term
    }

    pub fn get(&self, id: u64) -> Option<&MemoryItem> {
        self.short_term.iter().find(|item| item.id == id)
    }

    /// 按查询分词后的标签集合检索短期条目，过滤 min_relevance，取前 limit 并标记访问
    pub fn retrieve_similar(
        &mut self,
        query: &str,
        kind: Option<MemoryKind>,
        limit: usize,
        min_relevance: f64,
    ) -> Vec<MemoryItem> {
        let query_tags = tokenize_to_tags(query);
        let query_tags = (!query_tags.is_empty()).then_some(query_tags);
        let now = Utc::now();

        let mut scored: Vec<(f64, usize)> = self
            .short_term
            .iter()
            .enumerate()
            .filter(|(_, item)| kind.map_or(true, |k| item.kind == k))
            .map(|(idx, item)| (item.relevance(query_tags.as_ref(), now), idx))
            .filter(|(score, _)| *score >= min_relevance)
            .collect();
        // 同分时保持插入顺序
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(limit);

        scored
            .into_iter()
            .map(|(_, idx)| {
                let item = &mut self.short_term[idx];
                item.mark_accessed(now);
                item.clone()
            })
            .collect()
    }

    /// 删除早于 max_age_hours 的短期条目（importance > 0.7 的保留）；返回删除数量
    pub fn cleanup(&mut self, max_age_hours: f64) -> usize {
        let now = Utc::now();
        let before = self.short_term.len();
        self.short_term.retain(|item| {
            item.importance > CLEANUP_KEEP_IMPORTANCE || item.age_hours(now) <= max_age_hours
        });
        before - self.short_term.len()
    }

    // ---------- 工作记忆 ----------

    /// 写入工作记忆；溢出时按实时相关度淘汰最低者（刚写入的键除外）
    pub fn set_working<I, S>(
        &mut self,
        key: WorkingKey,
        content: serde_json::Value,
        importance: f64,
        tags: I,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.alloc_id();
        let item = MemoryItem::new(id, content, MemoryKind::Working, importance)
            .with_tags(tags)
            .with_tags([key.as_str()])
            .with_source(self.owner.clone());
        self.working.insert(key, item);

        let now = Utc::now();
        while self.working.len() > self.working_capacity {
            let victim = self
                .working
                .iter()
                .filter(|(k, _)| **k != key || self.working_capacity == 0)
                .min_by(|(ka, a), (kb, b)| {
                    a.relevance(None, now)
                        .total_cmp(&b.relevance(None, now))
                        .then(ka.cmp(kb))
                })
                .map(|(k, _)| *k);
            match victim {
                Some(k) => {
                    self.working.remove(&k);
                }
                None => break,
            }
        }
    }

    /// 读取工作记忆并记一次访问
    pub fn get_working(&mut self, key: WorkingKey) -> Option<&serde_json::Value> {
        let item = self.working.get_mut(&key)?;
        item.mark_accessed(Utc::now());
        Some(&item.content)
    }

    /// 只读查看，不更新访问统计
    pub fn peek_working(&self, key: WorkingKey) -> Option<&serde_json::Value> {
        self.working.get(&key).map(|item| &item.content)
    }

    pub fn clear_working(&mut self) {
        self.working.clear();
    }

    // ---------- 对话 ----------

    pub fn add_conversation(&mut self, role: Role, content: impl Into<String>) {
        self.conversation.push(Message::new(role, content));
    }

    pub fn conversation(&self) -> &[Message] {
        self.conversation.messages()
    }

    // ---------- 模式 ----------

    /// 插入或合并模式：对象字段取并集（新值覆盖同名字段），importance 取最大，confidence 取平均
    pub fn learn_pattern(
        &mut self,
        name: impl Into<String>,
        data: serde_json::Value,
        importance: f64,
        confidence: f64,
    ) {
        let name = name.into();
        let importance = clamp_unit(importance);
        let confidence = clamp_unit(confidence);
        match self.patterns.get_mut(&name) {
            Some(existing) => {
                merge_content(&mut existing.content, data);
                existing.importance = existing.importance.max(importance);
                existing.confidence = (existing.confidence + confidence) / 2.0;
                existing.mark_accessed(Utc::now());
            }
            None => {
                let id = self.alloc_id();
                let item = MemoryItem::new(id, data, MemoryKind::Pattern, importance)
                    .with_tags([name.clone()])
                    .with_source(self.owner.clone())
                    .with_confidence(confidence);
                self.patterns.insert(name, item);
            }
        }
    }

    pub fn pattern(&self, name: &str) -> Option<&MemoryItem> {
        self.patterns.get(name)
    }

    pub fn patterns(&self) -> impl Iterator<Item = (&String, &MemoryItem)> {
        self.patterns.iter()
    }

    /// 原样导入（用于从持久化文件恢复），同名覆盖
    pub fn import_pattern(&mut self, name: String, mut item: MemoryItem) {
        item.id = self.alloc_id();
        self.patterns.insert(name, item);
    }

    /// 将 importance > 0.8 或访问次数 > 5 的短期条目提升为模式（带 auto_derived 标签）；返回提升数量
    pub fn consolidate(&mut self) -> usize {
        let promoted: Vec<(String, MemoryItem)> = self
            .short_term
            .iter()
            .filter(|item| {
                item.importance > CONSOLIDATE_MIN_IMPORTANCE
                    || item.access_count > CONSOLIDATE_MIN_ACCESSES
            })
            .map(|item| (format!("auto:{}", item.id), item.clone()))
            .collect();

        let count = promoted.len();
        for (name, item) in promoted {
            let tags: BTreeSet<String> = item.tags.clone();
            self.learn_pattern(name.clone(), item.content, item.importance, item.confidence);
            if let Some(pattern) = self.patterns.get_mut(&name) {
                pattern.tags.extend(tags);
                pattern.tags.insert(AUTO_DERIVED_TAG.to_string());
            }
        }
        count
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            short_term: self.short_term.len(),
            working: self.working.len(),
            conversation: self.conversation.len(),
            patterns: self.patterns.len(),
        }
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(&MemorySection::default())
    }
}

/// 两边都是对象时按字段合并，否则整体替换
fn merge_content(existing: &mut serde_json::Value, incoming: serde_json::Value) {
    match (existing, incoming) {
        (serde_json::Value::Object(old), serde_json::Value::Object(new)) => {
            for (k, v) in new {
                old.insert(k, v);
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small(short: usize, working: usize) -> MemoryManager {
        MemoryManager::new(&MemorySection {
            short_term_capacity: short,
            working_capacity: working,
            conversation_capacity: 4,
        })
    }

    #[test]
    fn test_short_term_evicts_lowest_importance() {
        let mut mem = small(2, 2);
        let low = mem.add_observation(json!("low"), MemoryKind::Observation, 0.1, ["a"], 1.0);
        let high = mem.add_observation(json!("high"), MemoryKind::Observation, 0.9, ["b"], 1.0);
        let mid = mem.add_observation(json!("mid"), MemoryKind::Observation, 0.5, ["c"], 1.0);
        assert_eq!(mem.short_term().len(), 2);
        assert!(mem.get(low).is_none());
        assert!(mem.get(high).is_some());
        assert!(mem.get(mid).is_some());
    }

    #[test]
    fn test_short_term_eviction_accounts_for_age() {
        let mut mem = small(2, 2);
        let old = mem.add_observation(json!("old"), MemoryKind::Observation, 0.9, Vec::<String>::new(), 1.0);
        mem.short_term[0].created_at = Utc::now() - chrono::Duration::days(3);
        mem.add_observation(json!("a"), MemoryKind::Observation, 0.3, Vec::<String>::new(), 1.0);
        mem.add_observation(json!("b"), MemoryKind::Observation, 0.3, Vec::<String>::new(), 1.0);
        assert!(mem.get(old).is_none(), "0.9 - 1.5 should rank below fresh 0.3 items");
    }

    #[test]
    fn test_working_roundtrip_and_overflow() {
        let mut mem = small(10, 2);
        mem.set_working(WorkingKey::Task, json!({"company": "acme"}), 0.9, ["task"]);
        mem.set_working(WorkingKey::Cursor, json!(0), 0.1, Vec::<String>::new());
        assert_eq!(mem.get_working(WorkingKey::Task), Some(&json!({"company": "acme"})));
        mem.set_working(WorkingKey::Goal, json!("find jobs"), 0.5, Vec::<String>::new());
        assert_eq!(mem.stats().working, 2);
        assert!(mem.peek_working(WorkingKey::Cursor).is_none());
        assert!(mem.peek_working(WorkingKey::Goal).is_some());
    }

    #[test]
    fn test_learn_pattern_merges() {
        let mut mem = MemoryManager::default();
        mem.learn_pattern("career_page:acme", json!({"url": "a"}), 0.6, 0.8);
        mem.learn_pattern("career_page:acme", json!({"selector": "s"}), 0.4, 0.4);
        let p = mem.pattern("career_page:acme").unwrap();
        assert_eq!(p.content, json!({"url": "a", "selector": "s"}));
        assert!((p.importance - 0.6).abs() < 1e-9);
        assert!((p.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_retrieve_similar_ranks_by_tag_overlap() {
        let mut mem = MemoryManager::default();
        mem.add_observation(json!("x"), MemoryKind::Observation, 0.2, ["rust", "backend"], 1.0);
        mem.add_observation(json!("y"), MemoryKind::Observation, 0.2, ["python"], 1.0);
        mem.add_observation(json!("z"), MemoryKind::Action, 0.2, ["rust"], 1.0);

        let hits = mem.retrieve_similar("rust backend", None, 2, 0.0);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, json!("x"));
        assert_eq!(hits[1].content, json!("z"));
        assert_eq!(mem.get(hits[0].id).unwrap().access_count, 1);

        let only_actions = mem.retrieve_similar("rust", Some(MemoryKind::Action), 10, 0.0);
        assert_eq!(only_actions.len(), 1);

        let strict = mem.retrieve_similar("golang", None, 10, 0.9);
        assert!(strict.is_empty());
    }

    #[test]
    fn test_consolidate_promotes_important_and_frequent() {
        let mut mem = MemoryManager::default();
        let important = mem.add_observation(json!("i"), MemoryKind::Result, 0.85, ["k"], 0.9);
        let frequent = mem.add_observation(json!("f"), MemoryKind::Observation, 0.1, ["quux"], 1.0);
        mem.add_observation(json!("n"), MemoryKind::Observation, 0.1, ["zed"], 1.0);
        for _ in 0..6 {
            let hits = mem.retrieve_similar("quux", Some(MemoryKind::Observation), 1, 0.0);
            assert_eq!(hits[0].id, frequent);
        }
        assert_eq!(mem.consolidate(), 2);
        let p = mem.pattern(&format!("auto:{important}")).unwrap();
        assert!(p.tags.contains(AUTO_DERIVED_TAG));
        assert!(mem.pattern(&format!("auto:{frequent}")).is_some());
    }

    #[test]
    fn test_cleanup_keeps_important() {
        let mut mem = MemoryManager::default();
        mem.add_observation(json!("keep"), MemoryKind::Observation, 0.75, Vec::<String>::new(), 1.0);
        mem.add_observation(json!("drop"), MemoryKind::Observation, 0.2, Vec::<String>::new(), 1.0);
        mem.add_observation(json!("fresh"), MemoryKind::Observation, 0.2, Vec::<String>::new(), 1.0);
        let old = Utc::now() - chrono::Duration::hours(48);
        mem.short_term[0].created_at = old;
        mem.short_term[1].created_at = old;
        assert_eq!(mem.cleanup(24.0), 1);
        let left: Vec<_> = mem.short_term().iter().map(|i| i.content.clone()).collect();
        assert_eq!(left, vec![json!("keep"), json!("fresh")]);
    }

    #[test]
    fn test_conversation_bounded() {
        let mut mem = small(1, 1);
        for i in 0..6 {
            mem.add_conversation(Role::Agent, format!("m{i}"));
        }
        assert_eq!(mem.conversation().len(), 4);
        assert_eq!(mem.conversation()[0].content, "m2");
    }
}

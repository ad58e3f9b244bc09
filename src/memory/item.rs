//! 记忆条目与相关度评分
//!
//! 相关度 = importance + 新近度加成 + 频率加成 + 标签重叠加成，截断到 [0,1]。
//! 淘汰与检索都用这一个函数；年龄在评分时实时计算，不缓存。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 新近度加成上限（刚访问过时）
const RECENCY_WEIGHT: f64 = 0.2;
/// 新近度线性衰减窗口（小时）
const RECENCY_WINDOW_HOURS: f64 = 24.0;
/// 每次访问的频率加成
const FREQUENCY_STEP: f64 = 0.05;
const FREQUENCY_CAP: f64 = 0.3;
const TAG_OVERLAP_WEIGHT: f64 = 0.3;
/// 短期淘汰分数：importance - 0.5 * age_in_days
const AGE_PENALTY_PER_DAY: f64 = 0.5;

/// 记忆条目类型标签
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Observation,
    Action,
    Failure,
    Result,
    Working,
    Conversation,
    Pattern,
}

/// 单条记忆；只由所属的 MemoryManager 修改（读取时更新访问计数，合并模式时更新 importance/confidence）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: u64,
    pub content: serde_json::Value,
    pub kind: MemoryKind,
    pub created_at: DateTime<Utc>,
    pub importance: f64,
    pub access_count: u32,
    pub last_accessed: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub source_agent: Option<String>,
    pub confidence: f64,
}

impl MemoryItem {
    pub fn new(id: u64, content: serde_json::Value, kind: MemoryKind, importance: f64) -> Self {
        let now = Utc::now();
        Self {
            id,
            content,
            kind,
            created_at: now,
            importance: clamp_unit(importance),
            access_count: 0,
            last_accessed: now,
            tags: BTreeSet::new(),
            source_agent: None,
            confidence: 1.0,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_source(mut self, agent: Option<String>) -> Self {
        self.source_agent = agent;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_unit(confidence);
        self
    }

    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = now;
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds().max(0) as f64 / 86_400_000.0
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        self.age_days(now) * 24.0
    }

    /// 短期淘汰分数（越低越先淘汰）
    pub fn eviction_score(&self, now: DateTime<Utc>) -> f64 {
        self.importance - AGE_PENALTY_PER_DAY * self.age_days(now)
    }

    /// 相关度评分
    pub fn relevance(&self, query_tags: Option<&BTreeSet<String>>, now: DateTime<Utc>) -> f64 {
        let hours_since_access =
            (now - self.last_accessed).num_milliseconds().max(0) as f64 / 3_600_000.0;
        relevance_score(
            self.importance,
            hours_since_access,
            self.access_count,
            query_tags.map(|q| (q.intersection(&self.tags).count(), q.len())),
        )
    }
}

/// 纯函数形式的相关度：overlap 为 (|query ∩ item|, |query|)，未提供查询标签时为 None
pub fn relevance_score(
    importance: f64,
    hours_since_access: f64,
    access_count: u32,
    overlap: Option<(usize, usize)>,
) -> f64 {
    let hours = if hours_since_access.is_finite() {
        hours_since_access.max(0.0)
    } else {
        f64::MAX
    };
    let recency = (1.0 - hours / RECENCY_WINDOW_HOURS).max(0.0) * RECENCY_WEIGHT;
    let frequency = (access_count as f64 * FREQUENCY_STEP).min(FREQUENCY_CAP);
    let tag_overlap = match overlap {
        Some((shared, total)) if total > 0 => {
            (shared.min(total) as f64 / total as f64) * TAG_OVERLAP_WEIGHT
        }
        _ => 0.0,
    };
    clamp_unit(importance + recency + frequency + tag_overlap)
}

/// 截断到 [0,1]；NaN 视为 0
pub fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_item_gets_full_recency() {
        let score = relevance_score(0.5, 0.0, 0, None);
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_recency_decays_to_zero_after_a_day() {
        assert!((relevance_score(0.1, 12.0, 0, None) - 0.2).abs() < 1e-9);
        assert!((relevance_score(0.1, 48.0, 0, None) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_frequency_capped() {
        let a = relevance_score(0.0, 100.0, 6, None);
        let b = relevance_score(0.0, 100.0, 60, None);
        assert!((a - 0.3).abs() < 1e-9);
        assert!((b - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_tag_overlap_fraction_of_query() {
        let score = relevance_score(0.0, 100.0, 0, Some((1, 2)));
        assert!((score - 0.15).abs() < 1e-9);
        assert_eq!(relevance_score(0.0, 100.0, 0, Some((0, 0))), 0.0);
    }

    #[test]
    fn test_clamped_to_unit() {
        assert_eq!(relevance_score(1.0, 0.0, 100, Some((3, 3))), 1.0);
        assert_eq!(relevance_score(-5.0, 0.0, 0, None), 0.0);
        assert_eq!(relevance_score(f64::NAN, 0.0, 0, None), 0.0);
    }

    #[test]
    fn test_eviction_score_penalises_age() {
        let mut item = MemoryItem::new(1, serde_json::json!("x"), MemoryKind::Observation, 0.9);
        let now = item.created_at + chrono::Duration::days(2);
        assert!((item.eviction_score(now) - (0.9 - 1.0)).abs() < 1e-9);
        item.mark_accessed(now);
        assert_eq!(item.access_count, 1);
    }
}

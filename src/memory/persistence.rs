//! 模式记忆持久化
//!
//! 把 importance 高于阈值的模式写入单个 JSON 文件（带 schema 版本），按模式名索引；
//! 加载时原样恢复 content / importance / confidence。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::memory::{MemoryItem, MemoryKind, MemoryManager};

/// 当前文件格式版本
pub const PATTERN_SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported pattern schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// 单条持久化模式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub name: String,
    pub content: serde_json::Value,
    pub importance: f64,
    pub confidence: f64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub source_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 文件顶层结构
#[derive(Debug, Serialize, Deserialize)]
struct PatternFile {
    version: u32,
    patterns: Vec<PatternRecord>,
}

impl PatternRecord {
    fn from_item(name: &str, item: &MemoryItem) -> Self {
        Self {
            name: name.to_string(),
            content: item.content.clone(),
            importance: item.importance,
            confidence: item.confidence,
            tags: item.tags.clone(),
            source_agent: item.source_agent.clone(),
            created_at: item.created_at,
        }
    }

    fn into_item(self) -> (String, MemoryItem) {
        let mut item = MemoryItem::new(0, self.content, MemoryKind::Pattern, self.importance)
            .with_tags(self.tags)
            .with_source(self.source_agent);
        // 不经过 clamp，保证精确往返
        item.importance = self.importance;
        item.confidence = self.confidence;
        item.created_at = self.created_at;
        (self.name, item)
    }
}

/// 单文件模式存储（tokio::fs，不阻塞运行时线程）
#[derive(Debug)]
pub struct PatternStore {
    path: PathBuf,
}

impl PatternStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "patterns".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    /// 读取全部记录；文件不存在时返回空 Vec
    pub async fn load(&self) -> Result<Vec<PatternRecord>, MemoryError> {
        let data = match fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: PatternFile = serde_json::from_str(&data)?;
        if file.version != PATTERN_SCHEMA_VERSION {
            return Err(MemoryError::UnsupportedVersion {
                found: file.version,
                expected: PATTERN_SCHEMA_VERSION,
            });
        }
        Ok(file.patterns)
    }

    /// 合并写入前读取已有记录；文件损坏或版本不符时移到 `<name>.corrupt` 并从空列表开始
    async fn load_for_merge(&self) -> Result<Vec<PatternRecord>, MemoryError> {
        match self.load().await {
            Ok(records) => Ok(records),
            Err(e @ (MemoryError::Json(_) | MemoryError::UnsupportedVersion { .. })) => {
                let aside = self.sibling(".corrupt");
                tracing::warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "Unreadable pattern file, starting fresh"
                );
                fs::rename(&self.path, &aside).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// 写入 importance > min_importance 的模式；与已有文件按名称合并（新值覆盖）。返回写入条数
    ///
    /// 先写同目录临时文件再 rename 覆盖目标，中途崩溃不会留下半个文件。
    pub async fn save(&self, memory: &MemoryManager, min_importance: f64) -> Result<usize, MemoryError> {
        let fresh: Vec<PatternRecord> = memory
            .patterns()
            .filter(|(_, item)| item.importance > min_importance)
            .map(|(name, item)| PatternRecord::from_item(name, item))
            .collect();
        let written = fresh.len();

        let mut records = self.load_for_merge().await?;
        for record in fresh {
            match records.iter_mut().find(|r| r.name == record.name) {
                Some(slot) => *slot = record,
                None => records.push(record),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = PatternFile {
            version: PATTERN_SCHEMA_VERSION,
            patterns: records,
        };
        let tmp = self.sibling(".tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&file)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(written)
    }

    /// 加载文件并导入到 memory 的模式分区；返回导入条数
    pub async fn restore_into(&self, memory: &mut MemoryManager) -> Result<usize, MemoryError> {
        let records = self.load().await?;
        let count = records.len();
        for record in records {
            let (name, item) = record.into_item();
            memory.import_pattern(name, item);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_roundtrip_exact_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::new(dir.path().join("nested/patterns.json"));

        let mut mem = MemoryManager::default().with_owner("orchestrator");
        mem.learn_pattern("career_page:acme", json!({"url": "https://acme.test/careers"}), 0.8, 0.1 + 0.2);
        mem.learn_pattern("noise", json!("low"), 0.2, 0.5);
        assert_eq!(store.save(&mem, 0.7).await.unwrap(), 1);
        assert!(!store.sibling(".tmp").exists());

        let mut restored = MemoryManager::default();
        assert_eq!(store.restore_into(&mut restored).await.unwrap(), 1);
        let original = mem.pattern("career_page:acme").unwrap();
        let loaded = restored.pattern("career_page:acme").unwrap();
        assert_eq!(loaded.content, original.content);
        assert_eq!(loaded.importance.to_bits(), original.importance.to_bits());
        assert_eq!(loaded.confidence.to_bits(), original.confidence.to_bits());
        assert_eq!(loaded.source_agent.as_deref(), Some("orchestrator"));
        assert!(restored.pattern("noise").is_none());
    }

    #[tokio::test]
    async fn test_threshold_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::new(dir.path().join("p.json"));
        let mut mem = MemoryManager::default();
        mem.learn_pattern("at_threshold", json!({}), 0.7, 1.0);
        mem.learn_pattern("above", json!({}), 0.71, 1.0);
        assert_eq!(store.save(&mem, 0.7).await.unwrap(), 1);
        let names: Vec<String> = store.load().await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["above".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::new(dir.path().join("none.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        std::fs::write(&path, r#"{"version": 99, "patterns": []}"#).unwrap();
        let err = PatternStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, MemoryError::UnsupportedVersion { found: 99, .. }));
    }

    #[tokio::test]
    async fn test_truncated_file_is_moved_aside_and_save_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        std::fs::write(&path, r#"{"version":1,"patt"#).unwrap();
        let store = PatternStore::new(&path);

        let mut mem = MemoryManager::default();
        mem.learn_pattern("career_page:acme", json!({"url": "https://acme.test/careers"}), 0.9, 1.0);
        assert_eq!(store.save(&mem, 0.7).await.unwrap(), 1);
        assert_eq!(store.save(&mem, 0.7).await.unwrap(), 1);

        assert_eq!(store.load().await.unwrap().len(), 1);
        let aside = std::fs::read_to_string(dir.path().join("patterns.json.corrupt")).unwrap();
        assert_eq!(aside, r#"{"version":1,"patt"#);
    }
}

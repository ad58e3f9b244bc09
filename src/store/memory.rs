//! 内存实现的 DataAccess
//!
//! 用于二进制演示与测试：按实体类型分表存放记录，保存结果时分配 `<kind>-<n>` 形式的 id。
//! `set_unavailable(true)` 之后所有写操作返回 Unavailable，用来模拟存储故障。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::DataAccessError;
use crate::store::{DataAccess, DerivedLink, EntityKind, Record};

#[derive(Debug, Default)]
struct Tables {
    entities: HashMap<EntityKind, BTreeMap<String, Record>>,
    links: Vec<DerivedLink>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 构建期写入实体
    pub fn with_entity(mut self, kind: EntityKind, id: impl Into<String>, record: Record) -> Self {
        self.tables
            .get_mut()
            .entities
            .entry(kind)
            .or_default()
            .insert(id.into(), record);
        self
    }

    pub async fn insert(&self, kind: EntityKind, id: impl Into<String>, record: Record) {
        let mut tables = self.tables.write().await;
        tables.entities.entry(kind).or_default().insert(id.into(), record);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn entity(&self, kind: EntityKind, id: &str) -> Option<Record> {
        let tables = self.tables.read().await;
        tables.entities.get(&kind).and_then(|t| t.get(id)).cloned()
    }

    /// 某类实体的全部记录（按 id 排序）
    pub async fn entities(&self, kind: EntityKind) -> Vec<(String, Record)> {
        let tables = self.tables.read().await;
        tables
            .entities
            .get(&kind)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub async fn derived_links(&self) -> Vec<DerivedLink> {
        self.tables.read().await.links.clone()
    }

    fn check_available(&self) -> Result<(), DataAccessError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(DataAccessError::Unavailable("store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DataAccess for InMemoryDataStore {
    async fn fetch_entity(&self, kind: EntityKind, id: &str) -> Result<Option<Record>, DataAccessError> {
        Ok(self.entity(kind, id).await)
    }

    async fn update_entity(&self, kind: EntityKind, id: &str, patch: Record) -> Result<(), DataAccessError> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let record = tables
            .entities
            .get_mut(&kind)
            .and_then(|t| t.get_mut(id))
            .ok_or_else(|| DataAccessError::UnknownEntity(format!("{kind} {id}")))?;
        record.extend(patch);
        Ok(())
    }

    async fn save_results(&self, kind: EntityKind, records: Vec<Record>) -> Result<Vec<String>, DataAccessError> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let mut ids = Vec::with_capacity(records.len());
        for mut record in records {
            tables.next_id += 1;
            let id = format!("{}-{}", kind.as_str(), tables.next_id);
            record.insert("id".to_string(), Value::String(id.clone()));
            tables.entities.entry(kind).or_default().insert(id.clone(), record);
            ids.push(id);
        }
        tracing::debug!(%kind, count = ids.len(), "Saved results");
        Ok(ids)
    }

    async fn save_derived_links(&self, links: Vec<DerivedLink>) -> Result<usize, DataAccessError> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let n = links.len();
        tables.links.extend(links);
        Ok(n)
    }
}

//! 数据访问协作方
//!
//! 编排器通过 DataAccess 解析请求引用的实体（公司、用户偏好）并持久化派生产物
//! （职业页地址、提取的职位、匹配关系）。实现方可以是数据库、HTTP 服务或内存存储。

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::DataAccessError;

pub use memory::InMemoryDataStore;

/// 实体记录：自由键值
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Company,
    User,
    JobListing,
    JobMatch,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Company => "company",
            EntityKind::User => "user",
            EntityKind::JobListing => "job_listing",
            EntityKind::JobMatch => "job_match",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 用户与职位之间的匹配关系
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedLink {
    pub user_id: String,
    pub company_id: String,
    pub job_id: Option<String>,
    pub score: f64,
    /// 完整的匹配记录
    pub detail: Value,
}

#[async_trait]
pub trait DataAccess: Send + Sync {
    /// 不存在时返回 Ok(None)
    async fn fetch_entity(&self, kind: EntityKind, id: &str) -> Result<Option<Record>, DataAccessError>;

    /// 合并字段到已有实体
    async fn update_entity(&self, kind: EntityKind, id: &str, patch: Record) -> Result<(), DataAccessError>;

    /// 批量保存，按输入顺序返回分配的 id
    async fn save_results(&self, kind: EntityKind, records: Vec<Record>) -> Result<Vec<String>, DataAccessError>;

    async fn save_derived_links(&self, links: Vec<DerivedLink>) -> Result<usize, DataAccessError>;
}

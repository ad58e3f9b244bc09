//! Jobhound - 职位发现智能体编排
//!
//! 入口：初始化日志、加载配置，按夹具文件构建内存数据与回放站点，运行一次工作流并输出结果 JSON。
//!
//! 用法：`jobhound <fixture.json> [config.toml]`

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use jobhound::agents::{ReplayCatalog, ReplaySite};
use jobhound::config::load_config;
use jobhound::store::{EntityKind, InMemoryDataStore, Record};
use jobhound::{observability, DiscoveryRequest, WorkflowOrchestrator};

/// 夹具文件格式
#[derive(Debug, Deserialize)]
struct Fixture {
    request: DiscoveryRequest,
    #[serde(default)]
    companies: HashMap<String, Record>,
    #[serde(default)]
    users: HashMap<String, Record>,
    #[serde(default)]
    sites: HashMap<String, ReplaySite>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let fixture_path = PathBuf::from(args.next().unwrap_or_else(|| "demos/acme.json".to_string()));
    let config_path = args.next().map(PathBuf::from);

    let config = load_config(config_path).context("Failed to load config")?;
    let raw = std::fs::read_to_string(&fixture_path)
        .with_context(|| format!("Failed to read fixture {}", fixture_path.display()))?;
    let fixture: Fixture = serde_json::from_str(&raw).context("Malformed fixture")?;

    let mut store = InMemoryDataStore::new();
    for (id, record) in fixture.companies {
        store = store.with_entity(EntityKind::Company, id, record);
    }
    for (id, record) in fixture.users {
        store = store.with_entity(EntityKind::User, id, record);
    }
    let mut catalog = ReplayCatalog::new();
    for (company, site) in fixture.sites {
        catalog.insert(company, site);
    }

    let agents = catalog.agent_set(&config.engine, &config.memory);
    let orchestrator = WorkflowOrchestrator::new(config, Arc::new(store), agents);
    orchestrator.on_progress(|p| {
        tracing::info!(
            stage = %p.stage,
            progress = p.progress_percentage,
            operation = %p.current_operation,
            "Progress"
        );
        Ok(())
    });

    let result = orchestrator.start_workflow(fixture.request).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize result")?
    );

    if !result.success {
        anyhow::bail!("workflow {} failed", result.workflow_id);
    }
    Ok(())
}

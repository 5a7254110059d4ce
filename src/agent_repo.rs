// Agent registry: the rollup hierarchy plus per-agent system info and config.
// Static identity is stored once per init (same idea as the single-row system_info table).

use std::collections::HashSet;

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::agent_rollup::AgentRollupId;
use crate::blob_store::encoding;
use crate::error::{StoreError, StoreResult};
use crate::models::{AgentConfig, SystemInfo};

/// One node of the hierarchy, as the rollup worker sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRollupNode {
    pub id: AgentRollupId,
    pub parent: Option<AgentRollupId>,
    /// True for agents that report data themselves; false for pure groupings.
    pub leaf: bool,
}

pub struct AgentRepo {
    pool: SqlitePool,
    registered: RwLock<HashSet<AgentRollupId>>,
}

impl AgentRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            registered: RwLock::new(HashSet::new()),
        }
    }

    pub async fn init(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_rollup (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                depth INTEGER NOT NULL,
                is_agent INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_agent_rollup_parent ON agent_rollup(parent_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent (
                agent_id TEXT PRIMARY KEY,
                system_info BLOB,
                config BLOB
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records `agent` as a reporting leaf and all its ancestors as groupings.
    /// A node is either one or the other: an id that already groups other agents
    /// cannot report, and a reporting agent cannot gain children.
    /// Repeated calls for a known agent do no I/O.
    #[instrument(skip(self, agent), fields(repo = "agent", operation = "register", agent = %agent))]
    pub async fn register(&self, agent: &AgentRollupId) -> StoreResult<()> {
        if self.registered.read().await.contains(agent) {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT is_agent FROM agent_rollup WHERE id = $1")
                .bind(agent.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if existing == Some(0) {
            return Err(StoreError::rejected(format!(
                "{agent} groups other agents and cannot report data"
            )));
        }
        for ancestor in agent.ancestors() {
            let reporting: Option<i64> =
                sqlx::query_scalar("SELECT is_agent FROM agent_rollup WHERE id = $1")
                    .bind(ancestor.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            if reporting == Some(1) {
                return Err(StoreError::rejected(format!(
                    "{ancestor} reports data itself and cannot group {agent}"
                )));
            }
        }
        sqlx::query(
            "INSERT OR IGNORE INTO agent_rollup (id, parent_id, depth, is_agent) VALUES ($1, $2, $3, 1)",
        )
        .bind(agent.as_str())
        .bind(agent.parent().map(String::from))
        .bind(agent.depth() as i64)
        .execute(&mut *tx)
        .await?;
        for ancestor in agent.ancestors() {
            sqlx::query(
                "INSERT OR IGNORE INTO agent_rollup (id, parent_id, depth, is_agent) VALUES ($1, $2, $3, 0)",
            )
            .bind(ancestor.as_str())
            .bind(ancestor.parent().map(String::from))
            .bind(ancestor.depth() as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        self.registered.write().await.insert(agent.clone());
        debug!("agent registered");
        Ok(())
    }

    /// All nodes, deepest first, so children finish a rollup pass before their parent.
    pub async fn rollup_order(&self) -> StoreResult<Vec<AgentRollupNode>> {
        let rows = sqlx::query(
            "SELECT id, parent_id, is_agent FROM agent_rollup ORDER BY depth DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_node_row).collect()
    }

    pub async fn children(&self, parent: &AgentRollupId) -> StoreResult<Vec<AgentRollupId>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM agent_rollup WHERE parent_id = $1 ORDER BY id",
        )
        .bind(parent.as_str())
        .fetch_all(&self.pool)
        .await?;
        ids.iter().map(|id| parse_id(id)).collect()
    }

    /// Stores the agent's system info and reconciles its config with the one held here.
    /// Returns the server-side config when it differs from what the agent sent.
    #[instrument(skip(self, agent, system_info, agent_config), fields(repo = "agent", operation = "store_init", agent = %agent))]
    pub async fn store_init(
        &self,
        agent: &AgentRollupId,
        system_info: &SystemInfo,
        agent_config: &AgentConfig,
    ) -> StoreResult<Option<AgentConfig>> {
        self.register(agent).await?;

        let info_blob = encoding::with_version_prefix(
            encoding::SYSTEM_INFO_VERSION,
            wincode::serialize(system_info).map_err(|e| StoreError::encode("system info", e))?,
        );
        let mut tx = self.pool.begin().await?;
        let stored: Option<Option<Vec<u8>>> =
            sqlx::query_scalar("SELECT config FROM agent WHERE agent_id = $1")
                .bind(agent.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let stored_config = match stored.flatten() {
            Some(bytes) => Some(decode_agent_config(&bytes)?),
            None => None,
        };

        let (config_to_store, updated) = match stored_config {
            Some(server_config) if &server_config != agent_config => {
                (server_config.clone(), Some(server_config))
            }
            Some(server_config) => (server_config, None),
            None => (agent_config.clone(), None),
        };
        let config_blob = encode_agent_config(&config_to_store)?;

        sqlx::query(
            r#"
            INSERT INTO agent (agent_id, system_info, config) VALUES ($1, $2, $3)
            ON CONFLICT(agent_id) DO UPDATE SET system_info = excluded.system_info, config = excluded.config
            "#,
        )
        .bind(agent.as_str())
        .bind(&info_blob)
        .bind(&config_blob)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Replaces the server-side config; the agent picks it up on its next init.
    pub async fn update_agent_config(
        &self,
        agent: &AgentRollupId,
        config: &AgentConfig,
    ) -> StoreResult<()> {
        let blob = encode_agent_config(config)?;
        sqlx::query(
            r#"
            INSERT INTO agent (agent_id, config) VALUES ($1, $2)
            ON CONFLICT(agent_id) DO UPDATE SET config = excluded.config
            "#,
        )
        .bind(agent.as_str())
        .bind(&blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_agent_config(&self, agent: &AgentRollupId) -> StoreResult<Option<AgentConfig>> {
        let blob: Option<Option<Vec<u8>>> =
            sqlx::query_scalar("SELECT config FROM agent WHERE agent_id = $1")
                .bind(agent.as_str())
                .fetch_optional(&self.pool)
                .await?;
        blob.flatten().map(|b| decode_agent_config(&b)).transpose()
    }

    pub async fn read_system_info(&self, agent: &AgentRollupId) -> StoreResult<Option<SystemInfo>> {
        let blob: Option<Option<Vec<u8>>> =
            sqlx::query_scalar("SELECT system_info FROM agent WHERE agent_id = $1")
                .bind(agent.as_str())
                .fetch_optional(&self.pool)
                .await?;
        let Some(bytes) = blob.flatten() else {
            return Ok(None);
        };
        let payload = encoding::blob_payload(&bytes, encoding::SYSTEM_INFO_VERSION)
            .ok_or_else(|| StoreError::corrupt("system info", "unknown blob version"))?;
        let info = wincode::deserialize::<SystemInfo>(payload)
            .map_err(|e| StoreError::corrupt("system info", e))?;
        Ok(Some(info))
    }
}

fn parse_id(raw: &str) -> StoreResult<AgentRollupId> {
    AgentRollupId::parse(raw).map_err(|e| StoreError::corrupt("agent_rollup.id", e))
}

fn parse_node_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<AgentRollupNode> {
    let id: String = row.try_get("id")?;
    let parent: Option<String> = row.try_get("parent_id")?;
    let is_agent: i64 = row.try_get("is_agent")?;
    Ok(AgentRollupNode {
        id: parse_id(&id)?,
        parent: parent.as_deref().map(parse_id).transpose()?,
        leaf: is_agent != 0,
    })
}

fn encode_agent_config(config: &AgentConfig) -> StoreResult<Vec<u8>> {
    Ok(encoding::with_version_prefix(
        encoding::AGENT_CONFIG_VERSION,
        wincode::serialize(config).map_err(|e| StoreError::encode("agent config", e))?,
    ))
}

fn decode_agent_config(bytes: &[u8]) -> StoreResult<AgentConfig> {
    let payload = encoding::blob_payload(bytes, encoding::AGENT_CONFIG_VERSION)
        .ok_or_else(|| StoreError::corrupt("agent config", "unknown blob version"))?;
    wincode::deserialize::<AgentConfig>(payload).map_err(|e| StoreError::corrupt("agent config", e))
}

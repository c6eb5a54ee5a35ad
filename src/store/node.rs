//! Node repository.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use crate::error::{Error, Result};
use crate::health::NodeRegistry;
use crate::store::sqlite::{Lifecycle, Tx};
use crate::types::Node;

const QUERY_SELECT: &str = r#"
    SELECT id, address, metadata, ttl, active, created_at
      FROM node
     WHERE active = TRUE
  ORDER BY created_at
"#;

const QUERY_SELECT_ONE: &str =
    "SELECT id, address, metadata, ttl, active, created_at FROM node WHERE id = ?1";

const QUERY_INSERT: &str =
    "INSERT INTO node (address, metadata, ttl, active, created_at) VALUES (?1, ?2, ?3, ?4, ?5)";

const QUERY_UPDATE: &str = r#"
    UPDATE node
       SET address = ?1, metadata = ?2, ttl = ?3, active = ?4, created_at = ?5
     WHERE id = ?6
"#;

pub struct Nodes {
    pool: SqlitePool,
}

impl Nodes {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// List the active nodes, oldest first.
    pub async fn select(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query(QUERY_SELECT).fetch_all(&self.pool).await?;
        rows.iter().map(decode_node).collect()
    }

    pub async fn select_one(&self, id: i64) -> Result<Node> {
        let row = sqlx::query(QUERY_SELECT_ONE)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => decode_node(&row),
            None => Err(Error::NotFound("node")),
        }
    }

    /// Insert a node inside the caller's transaction. The row exists only
    /// once the transaction commits.
    pub async fn insert(&self, tx: &mut Tx, node: Node) -> Result<Node> {
        let metadata = serde_json::to_string(&node.metadata)?;
        let result = sqlx::query(QUERY_INSERT)
            .bind(&node.address)
            .bind(metadata)
            .bind(ttl_nanos(node.ttl)?)
            .bind(node.active)
            .bind(node.created_at)
            .execute(&mut **tx)
            .await?;

        if result.rows_affected() != 1 {
            return Err(Error::Integrity {
                affected: result.rows_affected(),
            });
        }
        Ok(Node {
            id: result.last_insert_rowid(),
            ..node
        })
    }

    pub async fn update(&self, node: &Node) -> Result<()> {
        let metadata = serde_json::to_string(&node.metadata)?;
        let result = sqlx::query(QUERY_UPDATE)
            .bind(&node.address)
            .bind(metadata)
            .bind(ttl_nanos(node.ttl)?)
            .bind(node.active)
            .bind(node.created_at)
            .bind(node.id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() != 1 {
            return Err(Error::NotFound("node"));
        }
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for Nodes {
    async fn open(&self) -> Result<()> {
        // Fails fast when the schema this repository relies on is missing.
        sqlx::query("SELECT id FROM node LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl NodeRegistry for Nodes {
    async fn select(&self) -> Result<Vec<Node>> {
        Nodes::select(self).await
    }

    async fn update(&self, node: &Node) -> Result<()> {
        Nodes::update(self, node).await
    }
}

fn decode_node(row: &SqliteRow) -> Result<Node> {
    let metadata: Option<String> = row.try_get("metadata")?;
    let metadata: HashMap<String, String> = match metadata.as_deref() {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
        _ => HashMap::new(),
    };
    let ttl: i64 = row.try_get("ttl")?;

    Ok(Node {
        id: row.try_get("id")?,
        address: row.try_get("address")?,
        metadata,
        ttl: Duration::from_nanos(ttl.max(0) as u64),
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ttl_nanos(ttl: Duration) -> Result<i64> {
    i64::try_from(ttl.as_nanos())
        .map_err(|_| Error::validation("invalid node", "ttl", "duration out of range"))
}

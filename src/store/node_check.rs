//! Per-node failure counter repository.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;

use crate::error::{Error, Result};
use crate::health::CheckCounter;
use crate::store::sqlite::Lifecycle;

// The returned count is the row's post-state at commit; the database
// serializes concurrent increments.
const QUERY_INCREMENT: &str = r#"
    INSERT INTO node_check (id, count) VALUES (?1, 1)
    ON CONFLICT (id) DO UPDATE SET count = count + 1
    RETURNING count
"#;

const QUERY_UPDATE: &str = "UPDATE node_check SET count = ?2 WHERE id = ?1";

pub struct NodeChecks {
    pool: SqlitePool,
}

impl NodeChecks {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Bump the failure counter for a node, creating the row on first use.
    /// The first ever increment returns 1.
    pub async fn increment(&self, id: i64) -> Result<i64> {
        let count = sqlx::query_scalar(QUERY_INCREMENT)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn update(&self, id: i64, value: i64) -> Result<()> {
        let result = sqlx::query(QUERY_UPDATE)
            .bind(id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            return Err(Error::NotFound("node check"));
        }
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for NodeChecks {
    async fn open(&self) -> Result<()> {
        sqlx::query("SELECT id FROM node_check LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CheckCounter for NodeChecks {
    async fn increment(&self, id: i64) -> Result<i64> {
        NodeChecks::increment(self, id).await
    }

    async fn update(&self, id: i64, value: i64) -> Result<()> {
        NodeChecks::update(self, id, value).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::sqlite::Client;

    async fn setup() -> (Client, NodeChecks) {
        let client = Client::memory().await;
        client.start().await.unwrap();
        let checks = NodeChecks::new(client.pool());
        (client, checks)
    }

    /// `node_check.id` references `node.id`, so every counter needs a
    /// backing node row.
    async fn insert_node(client: &Client, id: i64) {
        sqlx::query(
            "INSERT INTO node (id, address, metadata, ttl, active, created_at) VALUES (?1, ?2, '{}', 0, TRUE, ?3)",
        )
        .bind(id)
        .bind(format!("http://10.0.0.{id}:8081"))
        .bind(Utc::now())
        .execute(&client.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn first_increment_returns_one() {
        let (client, checks) = setup().await;
        insert_node(&client, 1).await;
        assert_eq!(checks.increment(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn increments_are_monotonic_per_node() {
        let (client, checks) = setup().await;
        insert_node(&client, 1).await;
        insert_node(&client, 2).await;
        checks.increment(1).await.unwrap();
        checks.increment(1).await.unwrap();
        assert_eq!(checks.increment(1).await.unwrap(), 3);

        // An unrelated node starts its own streak.
        assert_eq!(checks.increment(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_resets_the_streak() {
        let (client, checks) = setup().await;
        insert_node(&client, 1).await;
        checks.increment(1).await.unwrap();
        checks.increment(1).await.unwrap();

        checks.update(1, 0).await.unwrap();
        assert_eq!(checks.increment(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_fails_when_no_row_exists() {
        let (_client, checks) = setup().await;
        assert!(matches!(
            checks.update(7, 0).await,
            Err(Error::NotFound("node check"))
        ));
    }
}

//! Schema migrations.
//!
//! Revisions form a monotone sequence; each carries an up and a down
//! script. `Manager::run` advances the store to the highest known revision
//! and is a no-op when already current. Applied revisions are recorded in
//! the `migrations` table.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;

use crate::error::Result;

struct Revision {
    version: i64,
    name: &'static str,
    up: &'static str,
    down: &'static str,
}

pub struct Manager {
    revisions: Vec<Revision>,
}

impl Manager {
    pub fn new() -> Self {
        Self {
            revisions: vec![revision_0()],
        }
    }

    /// Apply every revision newer than the recorded version.
    pub async fn run(&self, pool: &SqlitePool) -> Result<()> {
        self.ensure_version_table(pool).await?;
        let current = self.current_version(pool).await?;

        for revision in &self.revisions {
            if current.is_some_and(|version| revision.version <= version) {
                continue;
            }
            let mut tx = pool.begin().await?;
            sqlx::raw_sql(revision.up).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO migrations (version, name, applied_at) VALUES (?1, ?2, ?3)")
                .bind(revision.version)
                .bind(revision.name)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!(version = revision.version, name = revision.name, "applied migration");
        }
        Ok(())
    }

    /// Roll back the newest applied revision, if any.
    pub async fn revert(&self, pool: &SqlitePool) -> Result<()> {
        self.ensure_version_table(pool).await?;
        let Some(current) = self.current_version(pool).await? else {
            return Ok(());
        };
        let Some(revision) = self
            .revisions
            .iter()
            .find(|revision| revision.version == current)
        else {
            return Ok(());
        };

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(revision.down).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM migrations WHERE version = ?1")
            .bind(revision.version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(version = revision.version, name = revision.name, "reverted migration");
        Ok(())
    }

    async fn ensure_version_table(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                version    INTEGER PRIMARY KEY,
                name       TEXT NOT NULL,
                applied_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn current_version(&self, pool: &SqlitePool) -> Result<Option<i64>> {
        let version = sqlx::query_scalar("SELECT MAX(version) FROM migrations")
            .fetch_one(pool)
            .await?;
        Ok(version)
    }
}

fn revision_0() -> Revision {
    Revision {
        version: 0,
        name: "create node and node_check",
        up: r#"
            CREATE TABLE node (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                address    TEXT NOT NULL,
                metadata   JSON,
                ttl        INTEGER NOT NULL,
                active     BOOLEAN NOT NULL,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE node_check (
                id    INTEGER PRIMARY KEY UNIQUE,
                count INTEGER NOT NULL,

                FOREIGN KEY (id) REFERENCES node (id)
            );
        "#,
        down: r#"
            DROP TABLE node_check;
            DROP TABLE node;
        "#,
    }
}

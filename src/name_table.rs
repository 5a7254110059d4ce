// SQLite-backed `NameTable`: one table per name kind, `key` unique.

use sqlx::SqlitePool;

use crate::error::StoreResult;
use crate::name_cache::NameTable;

pub struct SqliteNameTable {
    pool: SqlitePool,
    table: &'static str,
}

impl SqliteNameTable {
    /// `table` is a fixed identifier chosen by the caller, never user input.
    pub fn new(pool: SqlitePool, table: &'static str) -> Self {
        Self { pool, table }
    }

    pub async fn init(&self) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                last_capture_time INTEGER NOT NULL
            )
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_last_capture_time ON {0}(last_capture_time)",
            self.table
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Keys starting with `prefix`, for listing names of one agent rollup.
    pub async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let keys = sqlx::query_scalar::<_, String>(&format!(
            "SELECT key FROM {} WHERE substr(key, 1, length($1)) = $1 ORDER BY key",
            self.table
        ))
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    /// Removes every row (used by destructive resets; pair with `invalidate_all`).
    pub async fn delete_all(&self) -> StoreResult<u64> {
        let r = sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }
}

impl NameTable for SqliteNameTable {
    async fn find(&self, key: &str) -> StoreResult<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT id FROM {} WHERE key = $1",
            self.table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert(&self, key: &str, capture_time: i64) -> StoreResult<i64> {
        let id = sqlx::query_scalar::<_, i64>(&format!(
            "INSERT INTO {} (key, last_capture_time) VALUES ($1, $2) RETURNING id",
            self.table
        ))
        .bind(key)
        .bind(capture_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn touch(&self, id: i64, capture_time: i64) -> StoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET last_capture_time = MAX(last_capture_time, $1) WHERE id = $2",
            self.table
        ))
        .bind(capture_time)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: i64) -> StoreResult<u64> {
        let r = sqlx::query(&format!(
            "DELETE FROM {} WHERE last_capture_time < $1",
            self.table
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }
}

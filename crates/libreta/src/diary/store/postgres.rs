//! PostgreSQL に保存するストア。

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};

use super::{DiaryEntry, DiaryStore, Namespace, StoreError};
use crate::diary::event::{MessageId, UserId};

pub struct PgStore {
    pool: PgPool,
    namespace: Namespace,
}

/// ID を BIGINT 列に保存できる値に変換する。
fn db_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::IdOutOfRange(id))
}

impl PgStore {
    /// 接続してマイグレーションを適用する。
    pub async fn connect(
        url: &str,
        max_connections: u32,
        namespace: Namespace,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool, namespace })
    }
}

#[async_trait]
impl DiaryStore for PgStore {
    async fn publish(
        &self,
        user: UserId,
        date: NaiveDate,
        message_id: MessageId,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let user_id = db_id(user)?;
        let message_id = db_id(message_id)?;
        let mut tx = self.pool.begin().await?;

        let previous: Option<NaiveDate> = sqlx::query_scalar(
            r#"
            SELECT entry_date FROM message_dates
            WHERE namespace = $1 AND user_id = $2 AND message_id = $3
            FOR UPDATE
            "#,
        )
        .bind(self.namespace.as_str())
        .bind(user_id)
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?;

        // 別の日付に保存済みなら移動する
        if let Some(previous) = previous
            && previous != date
        {
            sqlx::query(
                r#"
                DELETE FROM diary_entries
                WHERE namespace = $1 AND user_id = $2 AND entry_date = $3 AND message_id = $4
                "#,
            )
            .bind(self.namespace.as_str())
            .bind(user_id)
            .bind(previous)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO diary_entries (namespace, user_id, entry_date, message_id, payload, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (namespace, user_id, entry_date, message_id)
            DO UPDATE SET payload = EXCLUDED.payload, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(self.namespace.as_str())
        .bind(user_id)
        .bind(date)
        .bind(message_id)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO message_dates (namespace, user_id, message_id, entry_date)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (namespace, user_id, message_id)
            DO UPDATE SET entry_date = EXCLUDED.entry_date
            "#,
        )
        .bind(self.namespace.as_str())
        .bind(user_id)
        .bind(message_id)
        .bind(date)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn lookup_filed_date(
        &self,
        user: UserId,
        message_id: MessageId,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let date = sqlx::query_scalar(
            r#"
            SELECT entry_date FROM message_dates
            WHERE namespace = $1 AND user_id = $2 AND message_id = $3
            "#,
        )
        .bind(self.namespace.as_str())
        .bind(db_id(user)?)
        .bind(db_id(message_id)?)
        .fetch_optional(&self.pool)
        .await?;
        Ok(date)
    }

    async fn has_entry_on(&self, user: UserId, date: NaiveDate) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM diary_entries
                WHERE namespace = $1 AND user_id = $2 AND entry_date = $3
            )
            "#,
        )
        .bind(self.namespace.as_str())
        .bind(db_id(user)?)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn entry(
        &self,
        user: UserId,
        date: NaiveDate,
        message_id: MessageId,
    ) -> Result<Option<DiaryEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT payload, updated_at FROM diary_entries
            WHERE namespace = $1 AND user_id = $2 AND entry_date = $3 AND message_id = $4
            "#,
        )
        .bind(self.namespace.as_str())
        .bind(db_id(user)?)
        .bind(date)
        .bind(db_id(message_id)?)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DiaryEntry {
            owner: user,
            entry_date: date,
            message_id,
            payload: row.try_get("payload")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        }))
    }

    async fn timezone(&self, user: UserId) -> Result<Option<String>, StoreError> {
        let timezone = sqlx::query_scalar(
            "SELECT timezone FROM user_settings WHERE namespace = $1 AND user_id = $2",
        )
        .bind(self.namespace.as_str())
        .bind(db_id(user)?)
        .fetch_optional(&self.pool)
        .await?;
        Ok(timezone)
    }

    async fn set_timezone(&self, user: UserId, timezone: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_settings (namespace, user_id, timezone)
            VALUES ($1, $2, $3)
            ON CONFLICT (namespace, user_id) DO UPDATE SET timezone = EXCLUDED.timezone
            "#,
        )
        .bind(self.namespace.as_str())
        .bind(db_id(user)?)
        .bind(timezone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_authorized(&self, user: UserId) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM invited_users WHERE namespace = $1 AND user_id = $2
            )
            "#,
        )
        .bind(self.namespace.as_str())
        .bind(db_id(user)?)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn invite(&self, user: UserId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO invited_users (namespace, user_id)
            VALUES ($1, $2)
            ON CONFLICT (namespace, user_id) DO NOTHING
            "#,
        )
        .bind(self.namespace.as_str())
        .bind(db_id(user)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invited_users(&self) -> Result<Vec<UserId>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM invited_users WHERE namespace = $1 ORDER BY user_id",
        )
        .bind(self.namespace.as_str())
        .fetch_all(&self.pool)
        .await?;

        ids.into_iter()
            .map(|id| {
                UserId::try_from(id).map_err(|_| StoreError::Corrupt {
                    key: self.namespace.invited_prefix(),
                    reason: format!("negative user id {id}"),
                })
            })
            .collect()
    }
}

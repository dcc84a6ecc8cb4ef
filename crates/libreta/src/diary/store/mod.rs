//! 日記エントリとユーザー設定を永続化するストア。

mod file;
mod postgres;

pub use file::FileStore;
pub use postgres::PgStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::StoreConfig;

use super::event::{MessageId, UserId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Id {0} does not fit in a database integer")]
    IdOutOfRange(u64),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// 日付ごとに保存された 1 件の日記エントリ。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub owner: UserId,
    pub entry_date: NaiveDate,
    pub message_id: MessageId,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// 日記ストアのインターフェース。
///
/// 各操作は単体でアトミック。`publish` はエントリと日付インデックスを
/// まとめて書き込み、インデックスは必ずエントリの後に書く。
#[async_trait]
pub trait DiaryStore: Send + Sync {
    /// エントリを作成または上書きする（同じメッセージ ID は後勝ち）。
    async fn publish(
        &self,
        user: UserId,
        date: NaiveDate,
        message_id: MessageId,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// メッセージが保存された日付を返す。
    async fn lookup_filed_date(
        &self,
        user: UserId,
        message_id: MessageId,
    ) -> Result<Option<NaiveDate>, StoreError>;

    async fn has_entry_on(&self, user: UserId, date: NaiveDate) -> Result<bool, StoreError>;

    async fn entry(
        &self,
        user: UserId,
        date: NaiveDate,
        message_id: MessageId,
    ) -> Result<Option<DiaryEntry>, StoreError>;

    async fn timezone(&self, user: UserId) -> Result<Option<String>, StoreError>;

    async fn set_timezone(&self, user: UserId, timezone: &str) -> Result<(), StoreError>;

    async fn is_authorized(&self, user: UserId) -> Result<bool, StoreError>;

    async fn invite(&self, user: UserId) -> Result<(), StoreError>;

    async fn invited_users(&self) -> Result<Vec<UserId>, StoreError>;
}

/// 環境ごとに分けたストアのルート名前空間。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(root: impl Into<String>) -> Self {
        Self(root.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn user_root(&self, user: UserId) -> String {
        format!("{}/users/{user}", self.0)
    }

    pub fn timezone_key(&self, user: UserId) -> String {
        format!("{}/timezone", self.user_root(user))
    }

    /// 末尾に `/` を含む、日付単位のプレフィックス。
    pub fn date_prefix(&self, user: UserId, date: NaiveDate) -> String {
        format!("{}/by_date/{}/", self.user_root(user), date.format("%Y-%m-%d"))
    }

    pub fn entry_key(&self, user: UserId, date: NaiveDate, message_id: MessageId) -> String {
        format!("{}{message_id}", self.date_prefix(user, date))
    }

    pub fn message_date_key(&self, user: UserId, message_id: MessageId) -> String {
        format!("{}/message_date/{message_id}", self.user_root(user))
    }

    pub fn invited_prefix(&self) -> String {
        format!("{}/invited_users/", self.0)
    }

    pub fn invited_key(&self, user: UserId) -> String {
        format!("{}{user}", self.invited_prefix())
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 設定に従ってストアを開く。
pub async fn open(config: &StoreConfig, namespace: Namespace) -> Result<Arc<dyn DiaryStore>, StoreError> {
    match config {
        StoreConfig::File { path } => {
            let store = FileStore::load(path, namespace)?;
            tracing::info!(path = ?path, "Opened file store");
            Ok(Arc::new(store))
        }
        StoreConfig::Postgres {
            url,
            max_connections,
        } => {
            let store = PgStore::connect(url, *max_connections, namespace).await?;
            tracing::info!("Connected to PostgreSQL store");
            Ok(Arc::new(store))
        }
    }
}

//! JSON ファイルに保存するキーバリュー形式のストア。
//!
//! キーは `{namespace}/users/{id}/by_date/{date}/{message_id}` のような
//! 論理パスをそのまま使う。パスを指定しない場合はメモリ上だけで動作する。

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DiaryEntry, DiaryStore, Namespace, StoreError};
use crate::diary::event::{MessageId, UserId};

type Records = BTreeMap<String, Value>;

/// エントリのキーに保存する値。
#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    payload: Value,
    updated_at: DateTime<Utc>,
}

pub struct FileStore {
    /// 永続化ファイルのパス
    path: Option<PathBuf>,
    namespace: Namespace,
    records: RwLock<Records>,
}

impl FileStore {
    /// ストアを読み込む。ファイルが存在しない場合は空のストアを作成する。
    pub fn load(path: impl AsRef<Path>, namespace: Namespace) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Records::new()
        };
        Ok(Self {
            path: Some(path),
            namespace,
            records: RwLock::new(records),
        })
    }

    /// ファイルに保存しないストアを作成する。
    pub fn in_memory(namespace: impl Into<String>) -> Self {
        Self {
            path: None,
            namespace: Namespace::new(namespace),
            records: RwLock::new(Records::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Records>, StoreError> {
        self.records
            .read()
            .map_err(|_| StoreError::Unavailable("file store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Records>, StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Unavailable("file store lock poisoned".to_string()))
    }

    fn save(&self, records: &Records) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(records)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 変更を順番に適用して保存する。保存に失敗した場合は元に戻す。
    fn commit(&self, changes: Vec<(String, Option<Value>)>) -> Result<(), StoreError> {
        let mut records = self.write()?;
        let mut previous = Vec::with_capacity(changes.len());
        for (key, value) in changes {
            let old = match value {
                Some(value) => records.insert(key.clone(), value),
                None => records.remove(&key),
            };
            previous.push((key, old));
        }

        if let Err(e) = self.save(&records) {
            for (key, old) in previous.into_iter().rev() {
                match old {
                    Some(value) => records.insert(key, value),
                    None => records.remove(&key),
                };
            }
            return Err(e);
        }
        Ok(())
    }

    fn filed_date(records: &Records, key: &str) -> Result<Option<NaiveDate>, StoreError> {
        let Some(value) = records.get(key) else {
            return Ok(None);
        };
        let corrupt = |reason: &str| StoreError::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let text = value.as_str().ok_or_else(|| corrupt("expected a date string"))?;
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| corrupt(&e.to_string()))
    }
}

#[async_trait]
impl DiaryStore for FileStore {
    async fn publish(
        &self,
        user: UserId,
        date: NaiveDate,
        message_id: MessageId,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let index_key = self.namespace.message_date_key(user, message_id);
        let previous = Self::filed_date(&*self.read()?, &index_key)?;

        let record = EntryRecord {
            payload: payload.clone(),
            updated_at: Utc::now(),
        };
        let mut changes = Vec::with_capacity(3);
        // 別の日付に保存済みなら移動する
        if let Some(previous) = previous
            && previous != date
        {
            changes.push((self.namespace.entry_key(user, previous, message_id), None));
        }
        changes.push((
            self.namespace.entry_key(user, date, message_id),
            Some(serde_json::to_value(record)?),
        ));
        changes.push((
            index_key,
            Some(Value::String(date.format("%Y-%m-%d").to_string())),
        ));
        self.commit(changes)
    }

    async fn lookup_filed_date(
        &self,
        user: UserId,
        message_id: MessageId,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let records = self.read()?;
        Self::filed_date(&records, &self.namespace.message_date_key(user, message_id))
    }

    async fn has_entry_on(&self, user: UserId, date: NaiveDate) -> Result<bool, StoreError> {
        let prefix = self.namespace.date_prefix(user, date);
        let records = self.read()?;
        let found = records
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix));
        Ok(found)
    }

    async fn entry(
        &self,
        user: UserId,
        date: NaiveDate,
        message_id: MessageId,
    ) -> Result<Option<DiaryEntry>, StoreError> {
        let key = self.namespace.entry_key(user, date, message_id);
        let records = self.read()?;
        let Some(value) = records.get(&key) else {
            return Ok(None);
        };
        let record: EntryRecord = serde_json::from_value(value.clone())?;
        Ok(Some(DiaryEntry {
            owner: user,
            entry_date: date,
            message_id,
            payload: record.payload,
            updated_at: record.updated_at,
        }))
    }

    async fn timezone(&self, user: UserId) -> Result<Option<String>, StoreError> {
        let records = self.read()?;
        Ok(records
            .get(&self.namespace.timezone_key(user))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn set_timezone(&self, user: UserId, timezone: &str) -> Result<(), StoreError> {
        self.commit(vec![(
            self.namespace.timezone_key(user),
            Some(Value::String(timezone.to_string())),
        )])
    }

    async fn is_authorized(&self, user: UserId) -> Result<bool, StoreError> {
        let records = self.read()?;
        Ok(records.contains_key(&self.namespace.invited_key(user)))
    }

    async fn invite(&self, user: UserId) -> Result<(), StoreError> {
        self.commit(vec![(self.namespace.invited_key(user), Some(Value::Bool(true)))])
    }

    async fn invited_users(&self) -> Result<Vec<UserId>, StoreError> {
        let prefix = self.namespace.invited_prefix();
        let records = self.read()?;
        let users = records
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].parse().ok())
            .collect();
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn load_empty_store() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_path_buf();
        std::fs::remove_file(&path).ok();

        let store = FileStore::load(&path, Namespace::new("libreta")).unwrap();
        assert!(store.read().unwrap().is_empty());
        assert!(store.invited_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_writes_entry_and_index() {
        let store = FileStore::in_memory("libreta");
        let payload = serde_json::json!({ "text": "hello" });

        store.publish(1, date(2021, 7, 29), 10, &payload).await.unwrap();

        assert_eq!(store.lookup_filed_date(1, 10).await.unwrap(), Some(date(2021, 7, 29)));
        assert!(store.has_entry_on(1, date(2021, 7, 29)).await.unwrap());
        assert!(!store.has_entry_on(1, date(2021, 7, 30)).await.unwrap());
        assert!(!store.has_entry_on(2, date(2021, 7, 29)).await.unwrap());

        let entry = store.entry(1, date(2021, 7, 29), 10).await.unwrap().unwrap();
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.message_id, 10);
    }

    #[tokio::test]
    async fn republish_overwrites_in_place() {
        let store = FileStore::in_memory("libreta");
        let payload = serde_json::json!({ "text": "same" });

        store.publish(1, date(2021, 7, 29), 10, &payload).await.unwrap();
        store.publish(1, date(2021, 7, 29), 10, &payload).await.unwrap();

        let prefix = store.namespace.date_prefix(1, date(2021, 7, 29));
        let count = store
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn republish_on_other_date_moves_entry() {
        let store = FileStore::in_memory("libreta");
        let payload = serde_json::json!({ "text": "moved" });

        store.publish(1, date(2021, 7, 29), 10, &payload).await.unwrap();
        store.publish(1, date(2021, 7, 30), 10, &payload).await.unwrap();

        assert!(!store.has_entry_on(1, date(2021, 7, 29)).await.unwrap());
        assert_eq!(store.lookup_filed_date(1, 10).await.unwrap(), Some(date(2021, 7, 30)));
    }

    #[tokio::test]
    async fn date_prefix_is_scoped_to_user() {
        let store = FileStore::in_memory("libreta");
        store
            .publish(1, date(2021, 7, 29), 10, &serde_json::json!("x"))
            .await
            .unwrap();
        // `users/1` と `users/10` が混ざらないこと
        assert!(!store.has_entry_on(10, date(2021, 7, 29)).await.unwrap());
    }

    #[tokio::test]
    async fn invite_and_authorize() {
        let store = FileStore::in_memory("libreta");
        assert!(!store.is_authorized(5).await.unwrap());

        store.invite(5).await.unwrap();
        store.invite(12).await.unwrap();

        assert!(store.is_authorized(5).await.unwrap());
        let mut users = store.invited_users().await.unwrap();
        users.sort();
        assert_eq!(users, vec![5, 12]);
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_path_buf();
        std::fs::remove_file(&path).ok();

        {
            let store = FileStore::load(&path, Namespace::new("libreta")).unwrap();
            store.invite(3).await.unwrap();
            store.set_timezone(3, "Asia/Tokyo").await.unwrap();
            store
                .publish(3, date(2024, 1, 1), 99, &serde_json::json!({ "text": "new year" }))
                .await
                .unwrap();
        }

        let store = FileStore::load(&path, Namespace::new("libreta")).unwrap();
        assert!(store.is_authorized(3).await.unwrap());
        assert_eq!(store.timezone(3).await.unwrap().as_deref(), Some("Asia/Tokyo"));
        assert_eq!(store.lookup_filed_date(3, 99).await.unwrap(), Some(date(2024, 1, 1)));
    }

    #[tokio::test]
    async fn namespaces_are_isolated_in_one_file() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_path_buf();
        std::fs::remove_file(&path).ok();

        FileStore::load(&path, Namespace::new("libreta"))
            .unwrap()
            .invite(3)
            .await
            .unwrap();

        let test_store = FileStore::load(&path, Namespace::new("libreta-test")).unwrap();
        assert!(!test_store.is_authorized(3).await.unwrap());
    }

    #[test]
    fn load_existing_store() {
        let mut temp = NamedTempFile::new().unwrap();
        let json = r#"{"libreta/users/1/message_date/10":"2024-01-01","libreta/invited_users/1":true}"#;
        temp.write_all(json.as_bytes()).unwrap();

        let store = FileStore::load(temp.path(), Namespace::new("libreta")).unwrap();
        assert_eq!(store.read().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_index_is_reported() {
        let mut temp = NamedTempFile::new().unwrap();
        let json = r#"{"libreta/users/1/message_date/10":42}"#;
        temp.write_all(json.as_bytes()).unwrap();

        let store = FileStore::load(temp.path(), Namespace::new("libreta")).unwrap();
        assert!(matches!(
            store.lookup_filed_date(1, 10).await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}

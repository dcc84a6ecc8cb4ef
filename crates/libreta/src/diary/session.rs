//! ユーザーごとの対話セッションとそのストア。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::event::{MessageId, UserId};

/// 対話の状態。セッションがない状態が待機中にあたる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingContinent,
    AwaitingCity,
    AwaitingDate,
    AwaitingContent,
    AwaitingConfirmation,
}

/// 確認待ちの内容。
#[derive(Debug, Clone, PartialEq)]
pub struct PendingContent {
    pub message_id: MessageId,
    /// 元のメッセージの送信時刻。保存先の日付はこの時刻から計算する
    pub sent_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSession {
    pub state: SessionState,
    pub pending_date: Option<NaiveDate>,
    pub pending_payload: Option<PendingContent>,
    pub pending_continent: Option<String>,
}

impl ConversationSession {
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            pending_date: None,
            pending_payload: None,
            pending_continent: None,
        }
    }

    pub fn awaiting_date() -> Self {
        Self::new(SessionState::AwaitingDate)
    }

    pub fn awaiting_content(date: NaiveDate) -> Self {
        Self {
            pending_date: Some(date),
            ..Self::new(SessionState::AwaitingContent)
        }
    }

    pub fn awaiting_confirmation(content: PendingContent) -> Self {
        Self {
            pending_payload: Some(content),
            ..Self::new(SessionState::AwaitingConfirmation)
        }
    }

    pub fn awaiting_continent() -> Self {
        Self::new(SessionState::AwaitingContinent)
    }

    pub fn awaiting_city(continent: impl Into<String>) -> Self {
        Self {
            pending_continent: Some(continent.into()),
            ..Self::new(SessionState::AwaitingCity)
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    session: Option<ConversationSession>,
    touched_at: Option<Instant>,
}

impl Slot {
    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.session.is_some()
            && self
                .touched_at
                .is_some_and(|touched| now.saturating_duration_since(touched) >= timeout)
    }
}

type Slots = Arc<Mutex<HashMap<UserId, Arc<AsyncMutex<Slot>>>>>;

/// ユーザー ID ごとのセッションを保持する。
///
/// セッションはユーザーごとのロックの中でだけ読み書きされるため、
/// 同じユーザーのイベントはロックを取得した順に 1 件ずつ処理される。
/// セッションがなく待機中のイベントもないユーザーの枠は、ロックの解放時に取り除く。
pub struct SessionStore {
    slots: Slots,
    /// 最後のイベントからこの時間が過ぎたセッションは破棄する
    idle_timeout: Option<Duration>,
}

impl SessionStore {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
        }
    }

    /// ユーザーのセッションをロックする。他のユーザーのロックとは独立している。
    pub async fn lock(&self, user: UserId) -> SessionGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(user).or_default().clone()
        };
        let mut guard = slot.lock_owned().await;

        if let Some(timeout) = self.idle_timeout
            && guard.is_idle(Instant::now(), timeout)
        {
            tracing::debug!(user_id = user, "Session expired");
            guard.session = None;
            guard.touched_at = None;
        }

        SessionGuard {
            user,
            slots: self.slots.clone(),
            guard,
        }
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// ロック中のセッション。ドロップするとロックが解放される。
pub struct SessionGuard {
    user: UserId,
    slots: Slots,
    guard: OwnedMutexGuard<Slot>,
}

impl SessionGuard {
    pub fn current(&self) -> Option<&ConversationSession> {
        self.guard.session.as_ref()
    }

    pub fn replace(&mut self, session: ConversationSession) {
        self.guard.session = Some(session);
        self.guard.touched_at = Some(Instant::now());
    }

    /// セッションを変えずに最終操作時刻だけ更新する。
    pub fn touch(&mut self) {
        if self.guard.session.is_some() {
            self.guard.touched_at = Some(Instant::now());
        }
    }

    pub fn clear(&mut self) {
        self.guard.session = None;
        self.guard.touched_at = None;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.guard.session.is_some() {
            return;
        }
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // マップとこのガードの 2 つ以外に参照があれば、ロックを待っているイベントがある
        let unused = slots.get(&self.user).is_some_and(|slot| {
            Arc::ptr_eq(slot, OwnedMutexGuard::mutex(&self.guard)) && Arc::strong_count(slot) == 2
        });
        if unused {
            slots.remove(&self.user);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_pending_fields() {
        let date = NaiveDate::from_ymd_opt(2021, 7, 29).unwrap();
        let session = ConversationSession::awaiting_content(date);
        assert_eq!(session.state, SessionState::AwaitingContent);
        assert_eq!(session.pending_date, Some(date));
        assert_eq!(session.pending_payload, None);

        let session = ConversationSession::awaiting_city("Asia");
        assert_eq!(session.state, SessionState::AwaitingCity);
        assert_eq!(session.pending_continent.as_deref(), Some("Asia"));
    }

    #[test]
    fn slot_idle_after_timeout() {
        let touched = Instant::now();
        let slot = Slot {
            session: Some(ConversationSession::awaiting_date()),
            touched_at: Some(touched),
        };
        let timeout = Duration::from_secs(30 * 60);

        assert!(!slot.is_idle(touched + Duration::from_secs(60), timeout));
        assert!(slot.is_idle(touched + timeout, timeout));
        assert!(!Slot::default().is_idle(touched + timeout, timeout));
    }

    #[tokio::test]
    async fn session_survives_between_locks() {
        let store = SessionStore::new(None);
        store.lock(1).await.replace(ConversationSession::awaiting_date());

        let guard = store.lock(1).await;
        assert_eq!(guard.current().map(|s| s.state), Some(SessionState::AwaitingDate));
        drop(guard);

        assert!(store.lock(2).await.current().is_none());
    }

    #[tokio::test]
    async fn clear_removes_session() {
        let store = SessionStore::new(None);
        store.lock(1).await.replace(ConversationSession::awaiting_date());
        store.lock(1).await.clear();
        assert!(store.lock(1).await.current().is_none());
    }

    #[tokio::test]
    async fn idle_session_expires_on_next_lock() {
        let store = SessionStore::new(Some(Duration::ZERO));
        store.lock(1).await.replace(ConversationSession::awaiting_date());
        assert!(store.lock(1).await.current().is_none());
    }

    #[tokio::test]
    async fn same_user_is_serialized_other_users_are_not() {
        let store = Arc::new(SessionStore::new(None));
        let held = store.lock(1).await;

        let waiting = tokio::time::timeout(Duration::from_millis(50), store.lock(1)).await;
        assert!(waiting.is_err());

        let other = tokio::time::timeout(Duration::from_millis(50), store.lock(2)).await;
        assert!(other.is_ok());

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(50), store.lock(1)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn touch_keeps_session_alive() {
        let store = SessionStore::new(Some(Duration::from_millis(300)));
        store.lock(1).await.replace(ConversationSession::awaiting_date());

        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut guard = store.lock(1).await;
            assert!(guard.current().is_some());
            guard.touch();
        }

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(store.lock(1).await.current().is_none());
    }

    #[tokio::test]
    async fn empty_slots_are_dropped_on_release() {
        let store = SessionStore::new(None);
        for user in 0..100 {
            drop(store.lock(user).await);
        }
        assert_eq!(store.tracked_users(), 0);

        store.lock(1).await.replace(ConversationSession::awaiting_date());
        assert_eq!(store.tracked_users(), 1);

        store.lock(1).await.clear();
        assert_eq!(store.tracked_users(), 0);
    }

    #[tokio::test]
    async fn slot_with_waiter_is_kept() {
        let store = Arc::new(SessionStore::new(None));
        let held = store.lock(1).await;

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut guard = store.lock(1).await;
                guard.replace(ConversationSession::awaiting_date());
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        waiter.await.unwrap();

        assert_eq!(store.tracked_users(), 1);
        assert_eq!(
            store.lock(1).await.current().map(|s| s.state),
            Some(SessionState::AwaitingDate)
        );
    }
}

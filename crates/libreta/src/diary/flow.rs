//! 日記の対話フロー。
//!
//! 各操作は現在のセッションとイベントから返信とセッションの変更を計算する。
//! セッションへの反映はディスパッチャーが行い、エラー時は反映しない。

use std::sync::Arc;

use chrono_tz::Tz;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ContentMode, DiaryConfig};

use super::classify::classify;
use super::date::{parse_custom_date, today_for, yesterday_for};
use super::event::{InboundEvent, Reply, UserId};
use super::session::{ConversationSession, PendingContent, SessionState};
use super::store::{DiaryStore, StoreError};
use super::strings;
use super::timezone::{TimezoneCatalog, TimezoneResolver};

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Session invariant violated: {0}")]
    Invariant(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// セッションに対する変更。
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    Keep,
    Replace(ConversationSession),
    /// 保存またはキャンセルで対話が終わった
    End,
}

/// 1 件のイベントを処理した結果。
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub replies: Vec<Reply>,
    pub session: SessionChange,
}

impl Outcome {
    pub fn keep(replies: Vec<Reply>) -> Self {
        Self {
            replies,
            session: SessionChange::Keep,
        }
    }

    pub fn replace(session: ConversationSession, replies: Vec<Reply>) -> Self {
        Self {
            replies,
            session: SessionChange::Replace(session),
        }
    }

    pub fn end(replies: Vec<Reply>) -> Self {
        Self {
            replies,
            session: SessionChange::End,
        }
    }
}

/// 日記の操作をまとめたもの。
pub struct Diary {
    store: Arc<dyn DiaryStore>,
    catalog: TimezoneCatalog,
    default_timezone: Tz,
    content_mode: ContentMode,
}

impl Diary {
    pub fn new(store: Arc<dyn DiaryStore>, config: &DiaryConfig) -> Self {
        Self {
            store,
            catalog: TimezoneCatalog::new(),
            default_timezone: config.default_timezone,
            content_mode: config.content_mode,
        }
    }

    pub fn store(&self) -> &dyn DiaryStore {
        self.store.as_ref()
    }

    pub fn timezones(&self) -> TimezoneResolver<'_> {
        TimezoneResolver::new(self.store.as_ref(), self.default_timezone)
    }

    /// 招待済みのユーザーかどうか。送信者が不明な場合は `false`。
    pub async fn is_authorized(&self, user: Option<UserId>) -> Result<bool, StoreError> {
        match user {
            Some(user) => self.store.is_authorized(user).await,
            None => Ok(false),
        }
    }

    /// `/start`: 挨拶し、招待済みならタイムゾーンの設定を始める。
    pub async fn start(&self, user: Option<UserId>) -> Result<Outcome, FlowError> {
        let greeting = Reply::text(strings::GREETING);
        if self.is_authorized(user).await? {
            let mut outcome = self.begin_timezone();
            outcome.replies.insert(0, greeting);
            Ok(outcome)
        } else {
            Ok(Outcome::keep(vec![
                greeting,
                Reply::text(strings::UNAUTHENTICATED),
            ]))
        }
    }

    /// `/timezone`: 地域の選択を促す。
    pub fn begin_timezone(&self) -> Outcome {
        Outcome::replace(
            ConversationSession::awaiting_continent(),
            vec![self.continent_prompt()],
        )
    }

    /// `/yesterday`: コマンドを送った時点の前日を保存先にする。
    pub async fn begin_yesterday(
        &self,
        user: UserId,
        event: &InboundEvent,
    ) -> Result<Outcome, FlowError> {
        let tz = self.timezones().get_timezone(user).await?;
        let date = yesterday_for(tz, event.sent_at);
        Ok(Outcome::replace(
            ConversationSession::awaiting_content(date),
            vec![Reply::text(strings::enter_content_for(date))],
        ))
    }

    /// `/customdate`: 保存先の日付の入力を促す。
    pub fn begin_custom_date(&self) -> Outcome {
        Outcome::replace(
            ConversationSession::awaiting_date(),
            vec![Reply::text(strings::PLEASE_ENTER_DATE)],
        )
    }

    /// `/cancel`: どの状態からでも対話を終える。
    pub fn cancel(&self, session: Option<&ConversationSession>) -> Outcome {
        match session {
            Some(_) => Outcome::end(vec![Reply::text(strings::CANCELLED).remove_keyboard()]),
            None => Outcome::keep(vec![
                Reply::text(strings::NOTHING_TO_CANCEL).remove_keyboard(),
            ]),
        }
    }

    /// 対話中のセッションにイベントを渡す。
    pub async fn continue_session(
        &self,
        user: UserId,
        session: &ConversationSession,
        event: &InboundEvent,
    ) -> Result<Outcome, FlowError> {
        match session.state {
            SessionState::AwaitingContinent => Ok(self.select_continent(event)),
            SessionState::AwaitingCity => self.select_city(user, session, event).await,
            SessionState::AwaitingDate => Ok(self.enter_date(user, event)),
            SessionState::AwaitingContent => self.enter_content(user, session, event).await,
            SessionState::AwaitingConfirmation => self.confirm(user, session, event).await,
        }
    }

    /// 新しい内容を受け取った。設定に応じてすぐ保存するか確認する。
    pub async fn receive_content(
        &self,
        user: UserId,
        event: &InboundEvent,
    ) -> Result<Outcome, FlowError> {
        match self.content_mode {
            ContentMode::Immediate => self.publish_today(user, event).await,
            ContentMode::Confirm => Ok(self.request_confirmation(event)),
        }
    }

    /// 編集されたメッセージを、最初に保存した日付のまま上書きする。
    pub async fn edit(&self, user: UserId, event: &InboundEvent) -> Result<Outcome, FlowError> {
        let Some(date) = self
            .store
            .lookup_filed_date(user, event.message_id)
            .await?
        else {
            debug!(user_id = user, message_id = event.message_id, "Edited message is not a diary entry");
            return Ok(Outcome::keep(vec![]));
        };

        self.store
            .publish(user, date, event.message_id, &event.stored_payload())
            .await?;
        info!(user_id = user, %date, message_id = event.message_id, "Entry updated");
        Ok(Outcome::keep(vec![
            Reply::text(strings::UPDATED).reply_to(event.message_id),
        ]))
    }

    async fn publish_today(&self, user: UserId, event: &InboundEvent) -> Result<Outcome, FlowError> {
        let tz = self.timezones().get_timezone(user).await?;
        let date = today_for(tz, event.sent_at);
        self.store
            .publish(user, date, event.message_id, &event.stored_payload())
            .await?;
        info!(user_id = user, %date, message_id = event.message_id, "Entry published");
        Ok(Outcome::keep(vec![
            Reply::text(strings::published(date)).reply_to(event.message_id),
        ]))
    }

    fn request_confirmation(&self, event: &InboundEvent) -> Outcome {
        let pending = PendingContent {
            message_id: event.message_id,
            sent_at: event.sent_at,
            payload: event.stored_payload(),
        };
        Outcome::replace(
            ConversationSession::awaiting_confirmation(pending),
            vec![
                Reply::text(strings::CONFIRM_SAVE)
                    .keyboard([strings::YES, strings::NO])
                    .reply_to(event.message_id),
            ],
        )
    }

    fn continent_prompt(&self) -> Reply {
        Reply::text(strings::SELECT_CONTINENT).keyboard(self.catalog.continents())
    }

    fn select_continent(&self, event: &InboundEvent) -> Outcome {
        let Some((continent, cities)) = event
            .text()
            .map(str::trim)
            .and_then(|continent| Some((continent, self.catalog.cities(continent)?)))
        else {
            return Outcome::keep(vec![
                Reply::text(strings::CONTINENT_INVALID),
                self.continent_prompt(),
            ]);
        };

        Outcome::replace(
            ConversationSession::awaiting_city(continent),
            vec![Reply::text(strings::SELECT_CITY).keyboard(cities.iter().cloned())],
        )
    }

    async fn select_city(
        &self,
        user: UserId,
        session: &ConversationSession,
        event: &InboundEvent,
    ) -> Result<Outcome, FlowError> {
        let continent = session
            .pending_continent
            .as_deref()
            .ok_or(FlowError::Invariant("awaiting city without a continent"))?;

        let Some(tz) = event
            .text()
            .and_then(|city| self.catalog.resolve(continent, city.trim()))
        else {
            return Ok(Outcome::replace(
                ConversationSession::awaiting_continent(),
                vec![Reply::text(strings::TIMEZONE_INVALID), self.continent_prompt()],
            ));
        };

        self.timezones().set_timezone(user, tz).await?;
        info!(user_id = user, timezone = tz.name(), "Timezone set");
        Ok(Outcome::end(vec![
            Reply::text(strings::timezone_set(tz.name())).remove_keyboard(),
        ]))
    }

    fn enter_date(&self, user: UserId, event: &InboundEvent) -> Outcome {
        let parsed = match event.text() {
            Some(text) => parse_custom_date(text).map_err(|e| e.to_string()),
            None => Err("not a text message".to_string()),
        };
        match parsed {
            Ok(date) => Outcome::replace(
                ConversationSession::awaiting_content(date),
                vec![Reply::text(strings::enter_content_for(date))],
            ),
            Err(reason) => {
                debug!(user_id = user, reason = %reason, "Rejected custom date");
                Outcome::keep(vec![Reply::text(strings::TRY_AGAIN_CHECK_VALIDITY)])
            }
        }
    }

    async fn enter_content(
        &self,
        user: UserId,
        session: &ConversationSession,
        event: &InboundEvent,
    ) -> Result<Outcome, FlowError> {
        let date = session
            .pending_date
            .ok_or(FlowError::Invariant("awaiting content without a date"))?;

        if classify(event).is_none() {
            return Ok(Outcome::keep(vec![Reply::text(strings::PLEASE_ENTER_CONTENT)]));
        }

        self.store
            .publish(user, date, event.message_id, &event.stored_payload())
            .await?;
        info!(user_id = user, %date, message_id = event.message_id, "Entry published");
        Ok(Outcome::end(vec![
            Reply::text(strings::published(date)).reply_to(event.message_id),
        ]))
    }

    async fn confirm(
        &self,
        user: UserId,
        session: &ConversationSession,
        event: &InboundEvent,
    ) -> Result<Outcome, FlowError> {
        let pending = session
            .pending_payload
            .as_ref()
            .ok_or(FlowError::Invariant("awaiting confirmation without content"))?;

        if event.text() != Some(strings::YES) {
            return Ok(Outcome::end(vec![
                Reply::text(strings::CANCELLED).remove_keyboard(),
            ]));
        }

        let tz = self.timezones().get_timezone(user).await?;
        let date = today_for(tz, pending.sent_at);
        self.store
            .publish(user, date, pending.message_id, &pending.payload)
            .await?;
        info!(user_id = user, %date, message_id = pending.message_id, "Entry published after confirmation");
        Ok(Outcome::end(vec![
            Reply::text(strings::published(date))
                .reply_to(pending.message_id)
                .remove_keyboard(),
        ]))
    }
}

//! 受信イベントを操作に振り分けるディスパッチャー。
//!
//! ルートは上から順に評価し、最初にマッチしたものを使う。
//! どんな内容にもマッチする `Content` は必ず最後に置く。

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::classify::classify;
use super::event::{EventKind, InboundEvent, Reply};
use super::flow::{Diary, FlowError, Outcome, SessionChange};
use super::session::{ConversationSession, SessionGuard, SessionStore};
use super::strings;

/// ルートを実行する前に必要な認可。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Public,
    /// 招待済みユーザーのみ
    Invited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Cancel,
    Timezone,
    Yesterday,
    CustomDate,
    /// 保存済みメッセージの編集
    Edit,
    /// 対話中のセッションへの入力
    Session,
    /// どのルートにもマッチしなかった日記の内容
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub action: Action,
    pub guard: Guard,
}

const fn route(action: Action, guard: Guard) -> Route {
    Route { action, guard }
}

pub const ROUTES: [Route; 8] = [
    route(Action::Start, Guard::Public),
    route(Action::Cancel, Guard::Invited),
    route(Action::Timezone, Guard::Invited),
    route(Action::Yesterday, Guard::Invited),
    route(Action::CustomDate, Guard::Invited),
    route(Action::Edit, Guard::Invited),
    route(Action::Session, Guard::Invited),
    route(Action::Content, Guard::Invited),
];

impl Action {
    fn matches(self, event: &InboundEvent, session: Option<&ConversationSession>) -> bool {
        let created = event.kind == EventKind::Created;
        let command = |name: &str| created && event.command().is_some_and(|c| c.is(name));
        match self {
            Action::Start => command("start"),
            Action::Cancel => command("cancel"),
            Action::Timezone => command("timezone"),
            Action::Yesterday => command("yesterday"),
            Action::CustomDate => command("customdate"),
            Action::Edit => event.kind == EventKind::Edited && classify(event).is_some(),
            Action::Session => created && session.is_some(),
            Action::Content => created && classify(event).is_some(),
        }
    }
}

/// イベントにマッチする最初のルート。
pub fn find_route(
    event: &InboundEvent,
    session: Option<&ConversationSession>,
) -> Option<&'static Route> {
    ROUTES.iter().find(|r| r.action.matches(event, session))
}

pub struct Dispatcher {
    diary: Arc<Diary>,
    sessions: SessionStore,
}

impl Dispatcher {
    pub fn new(diary: Arc<Diary>, sessions: SessionStore) -> Self {
        Self { diary, sessions }
    }

    pub fn diary(&self) -> &Arc<Diary> {
        &self.diary
    }

    /// イベントを処理して返信を返す。エラーは返信に変換し、呼び出し元には返さない。
    pub async fn dispatch(&self, event: &InboundEvent) -> Vec<Reply> {
        self.handle(event, false).await
    }

    /// キーボードで選んだ選択肢を処理する。対話中でなければ何もしない。
    pub async fn dispatch_selection(&self, event: &InboundEvent) -> Vec<Reply> {
        self.handle(event, true).await
    }

    async fn handle(&self, event: &InboundEvent, selection: bool) -> Vec<Reply> {
        let mut guard = match event.user {
            Some(user) => Some(self.sessions.lock(user).await),
            None => None,
        };
        let session = guard.as_ref().and_then(SessionGuard::current).cloned();

        if selection && session.is_none() {
            debug!(user_id = ?event.user, "Selection outside of a dialogue");
            return vec![];
        }

        let Some(route) = find_route(event, session.as_ref()) else {
            debug!(user_id = ?event.user, message_id = event.message_id, "No route for event");
            return vec![];
        };

        if route.guard == Guard::Invited {
            match self.diary.is_authorized(event.user).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(user_id = ?event.user, action = ?route.action, "Unauthorized access attempt");
                    return vec![Reply::text(strings::UNAUTHENTICATED)];
                }
                Err(e) => {
                    warn!(error = %e, user_id = ?event.user, "Failed to check authorization");
                    return vec![Reply::text(strings::STORE_UNAVAILABLE)];
                }
            }
        }

        match self.run(route.action, event, session.as_ref()).await {
            Ok(outcome) => {
                if let Some(guard) = guard.as_mut() {
                    apply(guard, outcome.session);
                }
                outcome.replies
            }
            Err(FlowError::Invariant(reason)) => {
                error!(user_id = ?event.user, action = ?route.action, reason, "Session invariant violated");
                if let Some(guard) = guard.as_mut() {
                    guard.clear();
                }
                vec![Reply::text(strings::SERVER_ERROR_AND_CANCELLED).remove_keyboard()]
            }
            Err(FlowError::Store(e)) => {
                warn!(error = %e, user_id = ?event.user, action = ?route.action, "Store unavailable");
                if let Some(guard) = guard.as_mut() {
                    guard.touch();
                }
                vec![Reply::text(strings::STORE_UNAVAILABLE)]
            }
        }
    }

    async fn run(
        &self,
        action: Action,
        event: &InboundEvent,
        session: Option<&ConversationSession>,
    ) -> Result<Outcome, FlowError> {
        let diary = &self.diary;
        match (action, event.user) {
            (Action::Start, user) => diary.start(user).await,
            (_, None) => Err(FlowError::Invariant("protected route without a user")),
            (Action::Cancel, Some(_)) => Ok(diary.cancel(session)),
            (Action::Timezone, Some(_)) => Ok(diary.begin_timezone()),
            (Action::Yesterday, Some(user)) => diary.begin_yesterday(user, event).await,
            (Action::CustomDate, Some(_)) => Ok(diary.begin_custom_date()),
            (Action::Edit, Some(user)) => diary.edit(user, event).await,
            (Action::Session, Some(user)) => match session {
                Some(session) => diary.continue_session(user, session, event).await,
                None => Err(FlowError::Invariant("session route without a session")),
            },
            (Action::Content, Some(user)) => diary.receive_content(user, event).await,
        }
    }
}

fn apply(guard: &mut SessionGuard, change: SessionChange) {
    match change {
        SessionChange::Keep => guard.touch(),
        SessionChange::Replace(session) => guard.replace(session),
        SessionChange::End => guard.clear(),
    }
}

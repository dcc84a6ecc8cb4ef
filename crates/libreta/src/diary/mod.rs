//! 会話形式で日記を保存する機能を提供する。
//!
//! 受信したメッセージをルートに振り分け、ユーザーのタイムゾーンで
//! 日付を決めてストアに保存する。トランスポートには依存しない。

mod classify;
mod date;
mod event;
mod flow;
mod router;
mod session;
pub mod store;
mod strings;
mod timezone;

pub use event::{Body, Command, InboundEvent, Keyboard, Reply, UserId};
pub use flow::Diary;
pub use router::Dispatcher;
pub use session::SessionStore;
pub use store::{DiaryStore, Namespace, StoreError};
pub use strings::reminder as reminder_text;

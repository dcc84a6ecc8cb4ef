//! トランスポートに依存しない受信イベントと返信の表現。

use chrono::{DateTime, Utc};

pub type UserId = u64;
pub type MessageId = u64;

/// 新規メッセージか編集か。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Edited,
}

/// `/name args` 形式のコマンド。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// 先頭の `/` と `@bot` サフィックスを除いた小文字の名前
    pub name: String,
    pub args: String,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            args: String::new(),
        }
    }

    /// テキストをコマンドとして解釈する。`/` で始まらない場合は `None`。
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.trim_start().strip_prefix('/')?;
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };
        let name = head.split('@').next().unwrap_or_default();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        Some(Self {
            name: name.to_lowercase(),
            args: args.to_string(),
        })
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

/// メッセージ本文。
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Photo { url: String, filename: String },
    Document { url: String, filename: String },
    Command(Command),
    /// スタンプや埋め込みのみなど、日記にならないメッセージ
    Unsupported,
}

impl Body {
    /// テキストメッセージの本文を、コマンドかどうか判定して変換する。
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        match Command::parse(&text) {
            Some(command) => Body::Command(command),
            None => Body::Text(text),
        }
    }
}

/// 受信イベント。
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// 送信者。トランスポートが特定できない場合は `None`
    pub user: Option<UserId>,
    pub message_id: MessageId,
    /// メッセージの送信時刻
    pub sent_at: DateTime<Utc>,
    pub kind: EventKind,
    pub body: Body,
    /// 再表示に必要なトランスポートのメタデータ
    pub payload: serde_json::Value,
}

impl InboundEvent {
    pub fn created(user: UserId, message_id: MessageId, sent_at: DateTime<Utc>, body: Body) -> Self {
        Self {
            user: Some(user),
            message_id,
            sent_at,
            kind: EventKind::Created,
            body,
            payload: serde_json::Value::Null,
        }
    }

    pub fn edited(user: UserId, message_id: MessageId, sent_at: DateTime<Utc>, body: Body) -> Self {
        Self {
            kind: EventKind::Edited,
            ..Self::created(user, message_id, sent_at, body)
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn command(&self) -> Option<&Command> {
        match &self.body {
            Body::Command(command) => Some(command),
            _ => None,
        }
    }

    /// コマンド以外のテキスト本文。
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            Body::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    /// 保存用のペイロード。トランスポートがメタデータを付けていない場合は本文から作る。
    pub fn stored_payload(&self) -> serde_json::Value {
        if !self.payload.is_null() {
            return self.payload.clone();
        }
        match &self.body {
            Body::Text(text) => serde_json::json!({ "text": text }),
            Body::Photo { url, filename } => {
                serde_json::json!({ "photo": { "url": url, "filename": filename } })
            }
            Body::Document { url, filename } => {
                serde_json::json!({ "document": { "url": url, "filename": filename } })
            }
            Body::Command(_) | Body::Unsupported => serde_json::Value::Null,
        }
    }
}

/// 返信に付けるキーボードの指定。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Keyboard {
    #[default]
    Unchanged,
    /// 一度だけ使える選択肢
    Show(Vec<String>),
    Remove,
}

/// 送信する返信。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub keyboard: Keyboard,
    pub reply_to: Option<MessageId>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keyboard: Keyboard::Unchanged,
            reply_to: None,
        }
    }

    pub fn keyboard<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keyboard = Keyboard::Show(labels.into_iter().map(Into::into).collect());
        self
    }

    pub fn remove_keyboard(mut self) -> Self {
        self.keyboard = Keyboard::Remove;
        self
    }

    pub fn reply_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

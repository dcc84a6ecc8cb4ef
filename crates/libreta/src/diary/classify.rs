//! 受信イベントが日記の内容として扱えるかを判定する。

use super::event::{Body, InboundEvent};

/// 日記の内容の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Photo,
    Document,
}

/// イベントが日記の内容ならその種類を返す。
///
/// 新規メッセージと編集のどちらにも同じ規則を適用する。
/// コマンド、空のテキスト、未対応のメディアは `None`。
pub fn classify(event: &InboundEvent) -> Option<ContentKind> {
    match &event.body {
        Body::Text(text) if !text.trim().is_empty() => Some(ContentKind::Text),
        Body::Photo { .. } => Some(ContentKind::Photo),
        Body::Document { .. } => Some(ContentKind::Document),
        Body::Text(_) | Body::Command(_) | Body::Unsupported => None,
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use serenity::all::{
    Attachment, ButtonStyle, ChannelId, Client, CommandInteraction, ComponentInteraction,
    CreateActionRow, CreateButton, CreateCommand, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateMessage, EventHandler, GatewayIntents, GuildId, Http,
    Interaction, Message, MessageId, MessageUpdateEvent, Ready, Timestamp,
};
use serenity::async_trait;
use serenity::client::Context as SerenityContext;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ReminderConfig};
use crate::diary::{self, Body, Dispatcher, InboundEvent, Keyboard, Reply};
use crate::reminder::run_reminder;

/// ボタンの custom_id に付ける接頭辞
const BUTTON_PREFIX: &str = "kb:";
const BUTTONS_PER_ROW: usize = 5;
const MAX_ROWS: usize = 5;
const MAX_LABEL_LEN: usize = 80;
const MAX_CONTENT_LEN: usize = 2000;

const DM_ONLY: &str = "Please talk to me in a direct message.";

const COMMANDS: [(&str, &str); 5] = [
    ("start", "Start using the diary"),
    ("timezone", "Set your timezone"),
    ("yesterday", "Write an entry for yesterday"),
    ("customdate", "Write an entry for a specific date"),
    ("cancel", "Cancel the current dialogue"),
];

pub struct Handler {
    dispatcher: Arc<Dispatcher>,
    reminder: Option<ReminderConfig>,
    /// 再接続のたびに `ready` が呼ばれるため、リマインダーは一度だけ起動する
    reminder_started: AtomicBool,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: SerenityContext, ready: Ready) {
        info!(user = %ready.user.name, "Bot connected");

        let commands = COMMANDS
            .iter()
            .map(|(name, description)| CreateCommand::new(*name).description(*description))
            .collect::<Vec<_>>();

        if let Err(e) = serenity::all::Command::set_global_commands(&ctx.http, commands).await {
            error!(error = %e, "Failed to register commands");
        } else {
            info!("Slash commands registered");
        }

        if let Some(config) = &self.reminder
            && !self.reminder_started.swap(true, Ordering::SeqCst)
        {
            tokio::spawn(run_reminder(
                ctx.http.clone(),
                self.dispatcher.diary().clone(),
                config.clone(),
            ));
        }
    }

    async fn message(&self, ctx: SerenityContext, msg: Message) {
        // 日記は DM でだけ受け付ける
        if msg.author.bot || msg.guild_id.is_some() {
            return;
        }

        let event = message_event(&msg);
        let replies = self.dispatcher.dispatch(&event).await;
        send_replies(&ctx.http, msg.channel_id, replies).await;
    }

    async fn message_update(
        &self,
        ctx: SerenityContext,
        _old_if_available: Option<Message>,
        _new: Option<Message>,
        update: MessageUpdateEvent,
    ) {
        let Some(event) = edit_event(&update) else {
            return;
        };
        let replies = self.dispatcher.dispatch(&event).await;
        send_replies(&ctx.http, update.channel_id, replies).await;
    }

    async fn interaction_create(&self, ctx: SerenityContext, interaction: Interaction) {
        let result = match &interaction {
            Interaction::Command(command) => self.handle_command(&ctx, command).await,
            Interaction::Component(component) => self.handle_component(&ctx, component).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!(error = %e, "Interaction error");
        }
    }
}

impl Handler {
    /// スラッシュコマンドをテキストのコマンドと同じように処理する。
    async fn handle_command(
        &self,
        ctx: &SerenityContext,
        command: &CommandInteraction,
    ) -> Result<()> {
        if let Some(response) = dm_only_response(command.guild_id) {
            debug!(command = %command.data.name, "Command outside of DM");
            return command
                .create_response(&ctx.http, response)
                .await
                .context("Failed to respond to command");
        }

        let event = InboundEvent::created(
            command.user.id.get(),
            command.id.get(),
            to_utc(command.id.created_at()),
            Body::Command(diary::Command::new(command.data.name.as_str())),
        );
        let mut replies = self.dispatcher.dispatch(&event).await.into_iter();

        let Some(first) = replies.next() else {
            warn!(command = %command.data.name, "Command produced no reply");
            return Ok(());
        };
        // 最初の返信だけがコマンドへの応答になり、続きは通常のメッセージで送る
        let contents = reply_contents(&first);
        let mut response = CreateInteractionResponseMessage::new().content(&contents[0]);
        if contents.len() == 1 {
            response = response.components(action_rows(&first.keyboard));
        }
        command
            .create_response(&ctx.http, CreateInteractionResponse::Message(response))
            .await
            .context("Failed to respond to command")?;

        for message in create_messages(command.channel_id, &first).into_iter().skip(1) {
            send_message(&ctx.http, command.channel_id, message).await;
        }
        send_replies(&ctx.http, command.channel_id, replies.collect()).await;
        Ok(())
    }

    /// ボタンのクリックは、そのラベルを送信したものとして扱う。
    /// 対話が終わった後に残っていたボタンは無視する。
    async fn handle_component(
        &self,
        ctx: &SerenityContext,
        component: &ComponentInteraction,
    ) -> Result<()> {
        if let Some(response) = dm_only_response(component.guild_id) {
            return component
                .create_response(&ctx.http, response)
                .await
                .context("Failed to respond to button");
        }

        let Some(label) = component.data.custom_id.strip_prefix(BUTTON_PREFIX) else {
            debug!(custom_id = %component.data.custom_id, "Unknown component");
            return Ok(());
        };

        // 選択済みのボタンは消す
        let ack = CreateInteractionResponseMessage::new().components(vec![]);
        component
            .create_response(&ctx.http, CreateInteractionResponse::UpdateMessage(ack))
            .await
            .context("Failed to acknowledge button")?;

        let event = InboundEvent::created(
            component.user.id.get(),
            component.id.get(),
            to_utc(component.id.created_at()),
            Body::from_text(label),
        );
        let replies = self.dispatcher.dispatch_selection(&event).await;
        send_replies(&ctx.http, component.channel_id, replies).await;
        Ok(())
    }
}

/// DM 以外で使われたインタラクションへの応答。本人にだけ見える。
fn dm_only_response(guild_id: Option<GuildId>) -> Option<CreateInteractionResponse> {
    guild_id?;
    let message = CreateInteractionResponseMessage::new()
        .content(DM_ONLY)
        .ephemeral(true);
    Some(CreateInteractionResponse::Message(message))
}

/// 添付ファイルの必要な項目だけを抜き出したもの。
#[derive(Debug, Clone, Copy)]
struct AttachmentRef<'a> {
    filename: &'a str,
    url: &'a str,
    content_type: Option<&'a str>,
}

impl<'a> From<&'a Attachment> for AttachmentRef<'a> {
    fn from(attachment: &'a Attachment) -> Self {
        Self {
            filename: &attachment.filename,
            url: &attachment.url,
            content_type: attachment.content_type.as_deref(),
        }
    }
}

impl AttachmentRef<'_> {
    fn is_image(&self) -> bool {
        if self.content_type.is_some_and(|t| t.starts_with("image/")) {
            return true;
        }
        let lower = self.filename.to_lowercase();
        let image_extensions = [".png", ".jpg", ".jpeg", ".gif", ".webp", ".heic", ".heif"];
        image_extensions.iter().any(|ext| lower.ends_with(ext))
    }

    fn to_json(self) -> Value {
        json!({
            "kind": if self.is_image() { "photo" } else { "document" },
            "filename": self.filename,
            "url": self.url,
            "content_type": self.content_type,
        })
    }
}

/// 本文を決める。添付ファイルがあれば最初のものを内容の種類として使う。
fn message_body(content: &str, attachments: &[AttachmentRef<'_>]) -> Body {
    if let Some(first) = attachments.first() {
        let (url, filename) = (first.url.to_string(), first.filename.to_string());
        return if first.is_image() {
            Body::Photo { url, filename }
        } else {
            Body::Document { url, filename }
        };
    }
    if content.trim().is_empty() {
        return Body::Unsupported;
    }
    Body::from_text(content)
}

/// 再表示用に保存するペイロード。テキストと添付ファイルをすべて含む。
fn message_payload(content: &str, attachments: &[AttachmentRef<'_>]) -> Value {
    let mut payload = serde_json::Map::new();
    if !content.is_empty() {
        payload.insert("text".to_string(), json!(content));
    }
    if !attachments.is_empty() {
        let attachments = attachments.iter().map(|a| a.to_json()).collect();
        payload.insert("attachments".to_string(), Value::Array(attachments));
    }
    if payload.is_empty() {
        Value::Null
    } else {
        Value::Object(payload)
    }
}

fn message_event(msg: &Message) -> InboundEvent {
    let attachments: Vec<AttachmentRef<'_>> = msg.attachments.iter().map(Into::into).collect();
    InboundEvent::created(
        msg.author.id.get(),
        msg.id.get(),
        to_utc(msg.timestamp),
        message_body(&msg.content, &attachments),
    )
    .with_payload(message_payload(&msg.content, &attachments))
}

/// 編集イベントを変換する。埋め込みの展開など本文を含まない更新は無視する。
fn edit_event(update: &MessageUpdateEvent) -> Option<InboundEvent> {
    let author = update.author.as_ref()?;
    if author.bot || update.guild_id.is_some() {
        return None;
    }
    let content = update.content.as_deref()?;
    let attachments: Vec<AttachmentRef<'_>> = update
        .attachments
        .iter()
        .flatten()
        .map(Into::into)
        .collect();
    let edited_at = update
        .edited_timestamp
        .or(update.timestamp)
        .map_or_else(Utc::now, to_utc);

    Some(
        InboundEvent::edited(
            author.id.get(),
            update.id.get(),
            edited_at,
            message_body(content, &attachments),
        )
        .with_payload(message_payload(content, &attachments)),
    )
}

fn to_utc(timestamp: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp.unix_timestamp(), 0).unwrap_or_else(Utc::now)
}

/// キーボードをボタンの並びに変換する。ボタンで表せない場合は `None`。
fn button_rows(labels: &[String]) -> Option<Vec<&[String]>> {
    if labels.is_empty()
        || labels.len() > BUTTONS_PER_ROW * MAX_ROWS
        || labels.iter().any(|l| l.is_empty() || l.chars().count() > MAX_LABEL_LEN)
    {
        return None;
    }
    Some(labels.chunks(BUTTONS_PER_ROW).collect())
}

/// 本文を長さの上限ごとに分ける。
fn split_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(MAX_CONTENT_LEN)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// 返信の本文。ボタンで表せない選択肢は本文に列挙し、
/// 上限を超える場合は選択肢の途中で切らずに複数のメッセージに分ける。
fn reply_contents(reply: &Reply) -> Vec<String> {
    let mut contents = split_text(&reply.text);
    let Keyboard::Show(labels) = &reply.keyboard else {
        return contents;
    };
    if button_rows(labels).is_some() {
        return contents;
    }

    let mut current = contents.pop().unwrap_or_default();
    let mut len = current.chars().count();
    let mut separator = "\n\n";
    for label in labels {
        let added = separator.chars().count() + label.chars().count();
        if len + added > MAX_CONTENT_LEN && len > 0 {
            contents.push(std::mem::take(&mut current));
            len = 0;
            separator = "";
        }
        current.push_str(separator);
        current.push_str(label);
        len += separator.chars().count() + label.chars().count();
        separator = ", ";
    }
    contents.push(current);
    contents
}

fn action_rows(keyboard: &Keyboard) -> Vec<CreateActionRow> {
    let Keyboard::Show(labels) = keyboard else {
        return vec![];
    };
    let Some(rows) = button_rows(labels) else {
        return vec![];
    };
    rows.into_iter()
        .map(|row| {
            let buttons = row
                .iter()
                .map(|label| {
                    CreateButton::new(format!("{BUTTON_PREFIX}{label}"))
                        .label(label)
                        .style(ButtonStyle::Secondary)
                })
                .collect();
            CreateActionRow::Buttons(buttons)
        })
        .collect()
}

/// 返信をメッセージにする。参照は最初の、ボタンは最後のメッセージに付ける。
fn create_messages(channel_id: ChannelId, reply: &Reply) -> Vec<CreateMessage> {
    let contents = reply_contents(reply);
    let last = contents.len() - 1;
    contents
        .into_iter()
        .enumerate()
        .map(|(i, content)| {
            let mut message = CreateMessage::new().content(content);
            if i == last {
                message = message.components(action_rows(&reply.keyboard));
            }
            if i == 0
                && let Some(id) = reply.reply_to.filter(|id| *id != 0)
            {
                message = message.reference_message((channel_id, MessageId::new(id)));
            }
            message
        })
        .collect()
}

async fn send_message(http: &Http, channel_id: ChannelId, message: CreateMessage) {
    if let Err(e) = channel_id.send_message(http, message).await {
        error!(error = %e, channel_id = channel_id.get(), "Failed to send reply");
    }
}

async fn send_replies(http: &Http, channel_id: ChannelId, replies: Vec<Reply>) {
    for reply in replies {
        for message in create_messages(channel_id, &reply) {
            send_message(http, channel_id, message).await;
        }
    }
}

pub async fn run(config: &Config, dispatcher: Dispatcher) -> Result<()> {
    let intents = GatewayIntents::DIRECT_MESSAGES | GatewayIntents::MESSAGE_CONTENT;
    let handler = Handler {
        dispatcher: Arc::new(dispatcher),
        reminder: config.reminder.clone(),
        reminder_started: AtomicBool::new(false),
    };

    let mut client = Client::builder(&config.discord.token, intents)
        .event_handler(handler)
        .await
        .context("Failed to create client")?;

    info!("Starting bot");
    client.start().await.context("Client error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiaryConfig;
    use crate::diary::store::FileStore;
    use crate::diary::{Diary, DiaryStore, SessionStore};

    fn attachment<'a>(filename: &'a str, content_type: Option<&'a str>) -> AttachmentRef<'a> {
        AttachmentRef {
            filename,
            url: "https://cdn.example/file",
            content_type,
        }
    }

    fn make_labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("label{i}")).collect()
    }

    #[test]
    fn image_detection() {
        assert!(attachment("photo.JPG", None).is_image());
        assert!(attachment("IMG_0001.heic", None).is_image());
        assert!(attachment("blob", Some("image/png")).is_image());
        assert!(!attachment("notes.pdf", Some("application/pdf")).is_image());
    }

    #[test]
    fn body_prefers_attachments() {
        let files = [attachment("notes.pdf", None), attachment("a.png", None)];
        assert!(matches!(
            message_body("caption", &files),
            Body::Document { ref filename, .. } if filename == "notes.pdf"
        ));
        assert!(matches!(
            message_body("", &files[1..]),
            Body::Photo { ref filename, .. } if filename == "a.png"
        ));
        assert_eq!(message_body("hello", &[]), Body::Text("hello".to_string()));
        assert!(matches!(message_body("/cancel", &[]), Body::Command(_)));
        assert_eq!(message_body("  ", &[]), Body::Unsupported);
    }

    #[test]
    fn payload_keeps_text_and_all_attachments() {
        let files = [attachment("a.png", Some("image/png")), attachment("b.txt", None)];
        let payload = message_payload("caption", &files);
        assert_eq!(payload["text"], "caption");
        assert_eq!(payload["attachments"][0]["kind"], "photo");
        assert_eq!(payload["attachments"][1]["kind"], "document");
        assert_eq!(payload["attachments"][1]["filename"], "b.txt");

        assert_eq!(message_payload("", &[]), Value::Null);
        assert_eq!(message_payload("hi", &[]), json!({ "text": "hi" }));
    }

    #[test]
    fn buttons_are_split_into_rows() {
        let labels = make_labels(12);
        let rows = button_rows(&labels).unwrap();
        assert_eq!(rows.iter().map(|r| r.len()).collect::<Vec<_>>(), vec![5, 5, 2]);

        assert_eq!(button_rows(&make_labels(25)).map(|r| r.len()), Some(5));
        assert!(button_rows(&make_labels(26)).is_none());
        assert!(button_rows(&[]).is_none());
    }

    #[test]
    fn long_keyboards_are_listed_in_text() {
        let reply = Reply::text("Pick one").keyboard(make_labels(30));
        let contents = reply_contents(&reply);
        assert_eq!(contents.len(), 1);
        assert!(contents[0].starts_with("Pick one\n\nlabel0, label1"));
        assert!(contents[0].ends_with("label29"));
        assert!(action_rows(&reply.keyboard).is_empty());

        let reply = Reply::text("Save?").keyboard(["Yes", "No"]);
        assert_eq!(reply_contents(&reply), vec!["Save?"]);
        assert_eq!(action_rows(&reply.keyboard).len(), 1);
    }

    #[test]
    fn long_text_is_split() {
        let reply = Reply::text("x".repeat(MAX_CONTENT_LEN + 10));
        let contents = reply_contents(&reply);
        assert_eq!(
            contents.iter().map(|c| c.chars().count()).collect::<Vec<_>>(),
            vec![MAX_CONTENT_LEN, 10]
        );
        assert_eq!(reply_contents(&Reply::text("")), vec![""]);
    }

    #[test]
    fn labels_are_not_cut_between_messages() {
        let labels: Vec<String> = (0..300).map(|i| format!("City_{i:03}")).collect();
        let reply = Reply::text("Pick one").keyboard(labels.clone());
        let contents = reply_contents(&reply);

        assert!(contents.len() > 1);
        assert!(contents.iter().all(|c| c.chars().count() <= MAX_CONTENT_LEN));
        assert!(contents[1].starts_with("City_"));
        let listed = contents.join(", ");
        let listed = listed.strip_prefix("Pick one\n\n").unwrap();
        assert_eq!(listed.split(", ").collect::<Vec<_>>(), labels);
    }

    #[tokio::test]
    async fn every_city_of_every_continent_is_shown() {
        let store = Arc::new(FileStore::in_memory("libreta-test"));
        store.invite(1).await.unwrap();
        let diary = Arc::new(Diary::new(store, &DiaryConfig::default()));
        let dispatcher = Dispatcher::new(diary, SessionStore::new(None));
        let now = Utc::now();
        let send = |id: u64, text: &str| InboundEvent::created(1, id, now, Body::from_text(text));

        let replies = dispatcher.dispatch(&send(1, "/timezone")).await;
        let Keyboard::Show(continents) = &replies[0].keyboard else {
            panic!("no continents");
        };

        let mut split = 0;
        for (i, continent) in continents.iter().enumerate() {
            let id = 10 + 2 * i as u64;
            dispatcher.dispatch(&send(id, "/timezone")).await;
            let replies = dispatcher.dispatch(&send(id + 1, continent.as_str())).await;
            let reply = &replies[0];
            let Keyboard::Show(cities) = &reply.keyboard else {
                panic!("no cities for {continent}");
            };

            let contents = reply_contents(reply);
            assert!(contents.iter().all(|c| c.chars().count() <= MAX_CONTENT_LEN));
            if button_rows(cities).is_some() {
                assert_eq!(action_rows(&reply.keyboard).len(), cities.len().div_ceil(BUTTONS_PER_ROW));
                continue;
            }
            if contents.len() > 1 {
                split += 1;
            }
            let listed = contents.join(", ");
            let prefix = format!("{}\n\n", reply.text);
            let listed = listed.strip_prefix(&prefix).unwrap();
            assert_eq!(&listed.split(", ").map(str::to_string).collect::<Vec<_>>(), cities, "{continent}");
        }
        assert!(split > 0);
    }

    #[test]
    fn interactions_outside_dm_are_refused() {
        assert!(dm_only_response(None).is_none());
        assert!(dm_only_response(Some(GuildId::new(1))).is_some());
    }
}

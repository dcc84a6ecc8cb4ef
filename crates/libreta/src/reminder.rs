//! その日の日記がまだないユーザーに DM でリマインドする。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serenity::all::{CreateMessage, Http};
use tracing::{debug, info, warn};

use crate::config::ReminderConfig;
use crate::diary::{Diary, StoreError, UserId, reminder_text};

/// ローカル時刻が通知時刻を過ぎていて、その日まだ通知していなければ `true`。
pub fn is_due(local_now: DateTime<Tz>, hour: u32, last_sent: Option<NaiveDate>) -> bool {
    local_now.hour() >= hour && last_sent != Some(local_now.date_naive())
}

/// 通知が必要なユーザーと、そのユーザーのローカル日付を集める。
pub async fn collect_due(
    diary: &Diary,
    now: DateTime<Utc>,
    hour: u32,
    sent: &HashMap<UserId, NaiveDate>,
) -> Result<Vec<(UserId, NaiveDate)>, StoreError> {
    let mut due = Vec::new();
    for user in diary.store().invited_users().await? {
        let tz = diary.timezones().get_timezone(user).await?;
        let local_now = now.with_timezone(&tz);
        if !is_due(local_now, hour, sent.get(&user).copied()) {
            continue;
        }

        let date = local_now.date_naive();
        if diary.store().has_entry_on(user, date).await? {
            continue;
        }
        due.push((user, date));
    }
    Ok(due)
}

pub async fn run_reminder(http: Arc<Http>, diary: Arc<Diary>, config: ReminderConfig) {
    info!(
        hour = config.hour,
        interval = %humantime::format_duration(config.interval),
        "Starting reminder"
    );

    let mut sent: HashMap<UserId, NaiveDate> = HashMap::new();
    loop {
        match collect_due(&diary, Utc::now(), config.hour, &sent).await {
            Ok(due) => {
                for (user, date) in due {
                    match send_reminder(&http, user, date).await {
                        Ok(()) => {
                            debug!(user_id = user, %date, "Reminder sent");
                            sent.insert(user, date);
                        }
                        Err(e) => warn!(error = %e, user_id = user, "Failed to send reminder"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to collect reminders"),
        }

        tokio::time::sleep(config.interval).await;
    }
}

async fn send_reminder(http: &Http, user: UserId, date: NaiveDate) -> serenity::Result<()> {
    let channel = serenity::all::UserId::new(user)
        .create_dm_channel(http)
        .await?;
    channel
        .send_message(http, CreateMessage::new().content(reminder_text(date)))
        .await?;
    Ok(())
}

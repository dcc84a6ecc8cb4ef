use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub discord: DiscordConfig,
    #[serde(default)]
    pub diary: DiaryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub reminder: Option<ReminderConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiscordConfig {
    pub token: String,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: "YOUR_DISCORD_BOT_TOKEN".to_string(),
        }
    }
}

/// 日付のない新しいメッセージの扱い。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentMode {
    /// 保存してよいか確認してから今日の日付で保存する
    #[default]
    Confirm,
    /// すぐに今日の日付で保存する
    Immediate,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiaryConfig {
    /// ストアのルート名前空間。デバッグ時は `-test` が付く
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub content_mode: ContentMode,
    /// タイムゾーン未設定のユーザーに使う
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_timezone")]
    pub default_timezone: Tz,
    /// 放置された対話を破棄するまでの時間。未指定なら破棄しない
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_timeout: Option<Duration>,
}

impl Default for DiaryConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            content_mode: ContentMode::default(),
            default_timezone: default_timezone(),
            session_timeout: None,
        }
    }
}

fn default_namespace() -> String {
    "libreta".to_string()
}

fn default_timezone() -> Tz {
    Tz::UTC
}

impl DiaryConfig {
    /// 実行環境に応じたストアの名前空間。
    pub fn namespace_for(&self, environment: Environment) -> String {
        match environment {
            Environment::Production => self.namespace.clone(),
            Environment::Debug => format!("{}-test", self.namespace),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    File {
        path: PathBuf,
    },
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("libreta.json"),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReminderConfig {
    /// この時刻（ユーザーのローカル時刻）を過ぎても日記がなければ通知する
    #[serde(default = "default_reminder_hour")]
    pub hour: u32,
    #[serde(default = "default_reminder_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            hour: default_reminder_hour(),
            interval: default_reminder_interval(),
        }
    }
}

fn default_reminder_hour() -> u32 {
    21
}

fn default_reminder_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

/// ストアの名前空間を分けるための実行環境。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Debug,
}

impl Environment {
    /// `--debug` か環境変数 `DEBUG` があればデバッグ環境。
    pub fn detect(debug_flag: bool) -> Self {
        if debug_flag || std::env::var_os("DEBUG").is_some() {
            Self::Debug
        } else {
            Self::Production
        }
    }
}

pub fn open_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path.as_ref()).context("Failed to read configuration file")?;
    let config: Config = toml::from_str(&content).context("Failed to parse configuration file")?;
    if let Some(reminder) = &config.reminder
        && reminder.hour > 23
    {
        anyhow::bail!("reminder.hour must be between 0 and 23, got {}", reminder.hour);
    }
    Ok(config)
}

pub fn write_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
    let config = Config {
        reminder: Some(ReminderConfig::default()),
        ..Default::default()
    };
    let content = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
    fs::write(path.as_ref(), content).context("Failed to write configuration file")?;
    Ok(())
}

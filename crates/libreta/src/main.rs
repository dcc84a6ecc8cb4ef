mod config;
mod diary;
mod discord;
mod reminder;
mod version;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::info;

use crate::{
    config::{Environment, open_config, write_default_config},
    diary::{Diary, Dispatcher, Namespace, SessionStore, store},
    version::short_version,
};

#[derive(Parser)]
#[command(version = short_version(), long_version = version::long_version())]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(long)]
    init: bool,

    /// テスト用の名前空間を使う（環境変数 `DEBUG` でも有効になる）
    #[arg(long)]
    debug: bool,

    /// ユーザーを招待して終了する
    #[arg(long, value_name = "USER_ID")]
    invite: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    if args.init {
        write_default_config(&args.config)?;
        info!(path = ?args.config, "Created default configuration");
        return Ok(());
    }

    info!(version = short_version(), "libreta version");

    let config = open_config(&args.config).context("Failed to load configuration")?;
    let environment = Environment::detect(args.debug);
    let namespace = Namespace::new(config.diary.namespace_for(environment));
    info!(
        ?environment,
        %namespace,
        content_mode = ?config.diary.content_mode,
        default_timezone = %config.diary.default_timezone,
        "Configuration loaded"
    );

    let store = store::open(&config.store, namespace)
        .await
        .context("Failed to open diary store")?;

    if let Some(user) = args.invite {
        anyhow::ensure!(user != 0, "User ID must not be zero");
        store.invite(user).await.context("Failed to invite user")?;
        info!(user_id = user, "User invited");
        return Ok(());
    }

    if let Some(timeout) = config.diary.session_timeout {
        info!(timeout = %humantime::format_duration(timeout), "Idle sessions will expire");
    }
    let diary = Arc::new(Diary::new(store, &config.diary));
    let dispatcher = Dispatcher::new(diary, SessionStore::new(config.diary.session_timeout));

    discord::run(&config, dispatcher).await
}

//! livemonデーモンのエントリポイント
//!
//! `livemon run` で監視デーモンを起動し、`livemon recap` で本日の
//! 日次リキャップを送信して終了する。

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use livemon::backoff::IdleBackoffPolicy;
use livemon::cache::PersistenceCache;
use livemon::clock;
use livemon::config::{self, ConfigManager, LogConfig, MonitorConfig};
use livemon::notify::Notifier;
use livemon::recap;
use livemon::shutdown;
use livemon::sinks::{LivemonDatabase, SinkSet, WorkbookSink};
use livemon::supervisor::ConnectionSupervisor;
use livemon::transport::{BridgeTransport, LiveTransport};

#[derive(Parser)]
#[command(name = "livemon", about = "Live session monitor", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// 監視デーモンを起動する
    Run,
    /// 本日の日次リキャップを送信して終了する
    Recap,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let manager = ConfigManager::new()?;
    let config = manager.load_config()?;

    init_logging(&config.log)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config).await,
        Command::Recap => run_recap(config).await,
    }
}

/// ログ初期化（コンソール＋日次ローテーションファイル）
fn init_logging(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if config.enable_file_logging {
        let log_dir = match &config.log_dir {
            Some(dir) => dir.clone(),
            None => config::default_data_dir()?.join("logs"),
        };
        std::fs::create_dir_all(&log_dir)?;

        let file_appender = tracing_appender::rolling::daily(log_dir, "livemon.log");
        registry
            .with(fmt::layer().with_writer(file_appender).with_ansi(false))
            .try_init()?;
    } else {
        registry.try_init()?;
    }

    Ok(())
}

/// 監視デーモン本体
async fn run_daemon(config: MonitorConfig) -> Result<()> {
    tracing::info!("🎬 Starting livemon - live session monitor");

    if config.accounts.is_empty() {
        tracing::warn!("監視対象アカウントが設定されていません (accounts = [])");
    }

    let cache = Arc::new(PersistenceCache::load(config.cache_path()?));
    let database = Arc::new(LivemonDatabase::new(config.database_path()?)?);
    let workbook = Arc::new(WorkbookSink::new(config.report_path()?));

    let mut sinks = SinkSet::new();
    sinks.push(database);
    sinks.push(workbook);
    let sinks = Arc::new(sinks);

    let notifier = Arc::new(Notifier::new(&config.notification, config.marker_dir()?));
    let policy = Arc::new(IdleBackoffPolicy::new(&config.retry));
    let transport: Arc<dyn LiveTransport> =
        Arc::new(BridgeTransport::new(config.transport.bridge_addr.clone()));

    for account in &config.accounts {
        let supervisor = ConnectionSupervisor::new(
            account,
            transport.clone(),
            cache.clone(),
            policy.clone(),
            sinks.clone(),
            notifier.clone(),
            &config.retry,
        );
        tokio::spawn(supervisor.run());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 終了シグナルを受信しました");

    let flushed = shutdown::flush_all(&cache, &sinks, &notifier).await;
    tracing::info!("👋 livemon shutting down ({} session(s) flushed)", flushed);

    Ok(())
}

/// 日次リキャップの送信
async fn run_recap(config: MonitorConfig) -> Result<()> {
    let database = LivemonDatabase::new(config.database_path()?)?;
    let notifier = Notifier::new(&config.notification, config.marker_dir()?);

    let sent = recap::send_daily_recap(&database, &notifier, clock::today()).await?;
    if sent == 0 {
        tracing::info!("本日のライブデータはありません");
    }

    Ok(())
}

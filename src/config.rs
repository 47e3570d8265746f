//! アプリケーション設定管理モジュール
//!
//! XDGディレクトリを使用した設定ファイルの永続化と管理を提供します。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// 再試行・バックオフ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// アイドル時の最小再試行間隔（秒）
    pub idle_min_secs: u64,
    /// アイドル時の最大再試行間隔（秒）
    pub idle_max_secs: u64,
    /// アイドル間隔のエスカレーション幅（秒）
    pub idle_step_secs: u64,
    /// 全アカウントアイドル観測が何回続いたら間隔を1段上げるか
    pub idle_escalation_threshold: u32,
    /// ジッター幅（秒、±）
    pub jitter_secs: u64,
    /// どのジッター結果でも下回らない下限（秒）
    pub floor_secs: u64,
    /// 一時エラー時の固定短期リトライ（秒）
    pub short_retry_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            idle_min_secs: 15 * 60,
            idle_max_secs: 60 * 60,
            idle_step_secs: 5 * 60,
            idle_escalation_threshold: 3,
            jitter_secs: 60,
            floor_secs: 60,
            short_retry_secs: 3,
        }
    }
}

/// 永続化パス設定（未指定はXDGデータディレクトリ配下）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// クラッシュ耐性キャッシュのファイルパス
    pub cache_file: Option<PathBuf>,
    /// SQLiteデータベースのファイルパス
    pub database_file: Option<PathBuf>,
    /// Excelレポートのファイルパス
    pub report_file: Option<PathBuf>,
}

/// 通知設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// 通知送信を有効にするか
    pub enabled: bool,
    /// 送信先エンドポイントURL
    pub endpoint: String,
    /// Authorizationヘッダーに載せるトークン
    pub token: String,
    /// 送信先識別子（電話番号・チャンネルIDなど）
    pub target: String,
    /// アラート重複抑止マーカーの保存先
    pub marker_dir: Option<PathBuf>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false, // デフォルトは無効
            endpoint: String::new(),
            token: String::new(),
            target: String::new(),
            marker_dir: None,
        }
    }
}

/// トランスポート接続設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// イベントブリッジのアドレス（NDJSONストリーム）
    pub bridge_addr: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bridge_addr: "127.0.0.1:7008".to_string(),
        }
    }
}

/// ログ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: true,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// 監視対象アカウント一覧
    #[serde(default)]
    pub accounts: Vec<String>,

    /// 再試行・バックオフ設定
    #[serde(default)]
    pub retry: RetryConfig,

    /// 永続化パス設定
    #[serde(default)]
    pub storage: StorageConfig,

    /// 通知設定
    #[serde(default)]
    pub notification: NotificationConfig,

    /// トランスポート設定
    #[serde(default)]
    pub transport: TransportConfig,

    /// ログ設定
    #[serde(default)]
    pub log: LogConfig,
}

impl MonitorConfig {
    /// クラッシュ耐性キャッシュのパスを解決
    pub fn cache_path(&self) -> Result<PathBuf> {
        resolve_data_path(self.storage.cache_file.as_ref(), "live_cache.json")
    }

    /// SQLiteデータベースのパスを解決
    pub fn database_path(&self) -> Result<PathBuf> {
        resolve_data_path(self.storage.database_file.as_ref(), "livemon.db")
    }

    /// Excelレポートのパスを解決
    pub fn report_path(&self) -> Result<PathBuf> {
        resolve_data_path(self.storage.report_file.as_ref(), "live_report.xlsx")
    }

    /// アラートマーカーディレクトリを解決
    pub fn marker_dir(&self) -> Result<PathBuf> {
        match &self.notification.marker_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                Ok(dir.clone())
            }
            None => {
                let dir = default_data_dir()?.join("alerts");
                fs::create_dir_all(&dir)?;
                Ok(dir)
            }
        }
    }
}

/// 明示パスが無ければXDGデータディレクトリ配下のデフォルトを使う
fn resolve_data_path(explicit: Option<&PathBuf>, default_name: &str) -> Result<PathBuf> {
    match explicit {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            Ok(path.clone())
        }
        None => Ok(default_data_dir()?.join(default_name)),
    }
}

/// XDGデータディレクトリを取得（存在しなければ作成）
pub fn default_data_dir() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("dev", "sifyfy", "livemon")
        .context("Failed to get project directories")?;

    let data_dir = project_dirs.data_dir();
    fs::create_dir_all(data_dir)?;

    Ok(data_dir.to_path_buf())
}

/// 設定管理マネージャー
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// 新しい設定マネージャーを作成
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        // 設定ディレクトリを作成（存在しない場合）
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        Ok(Self { config_path })
    }

    /// 任意のパスを使う設定マネージャー（テスト用）
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// XDGディレクトリに基づく設定ファイルパスを取得
    fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("dev", "sifyfy", "livemon")
            .context("Failed to get project directories")?;

        let config_dir = project_dirs.config_dir();
        let config_file = config_dir.join("config.toml");

        debug!("Config file path: {}", config_file.display());

        Ok(config_file)
    }

    /// 設定を読み込み
    ///
    /// ファイルが無い場合はデフォルト設定を書き出してそれを返す。
    /// 壊れたファイルはデフォルトへフォールバックする（致命エラーにしない）。
    pub fn load_config(&self) -> Result<MonitorConfig> {
        if !self.config_path.exists() {
            info!(
                "Config file not found, creating defaults: {}",
                self.config_path.display()
            );
            let config = MonitorConfig::default();
            self.save_config(&config)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read config: {}", self.config_path.display()))?;

        match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("設定読み込みエラー、デフォルト設定を使用: {}", e);
                Ok(MonitorConfig::default())
            }
        }
    }

    /// 設定を保存
    pub fn save_config(&self, config: &MonitorConfig) -> Result<()> {
        let contents =
            toml::to_string_pretty(config).context("Failed to serialize config to TOML")?;
        fs::write(&self.config_path, contents)
            .with_context(|| format!("Failed to write config: {}", self.config_path.display()))?;

        debug!("💾 Config saved: {}", self.config_path.display());
        Ok(())
    }
}

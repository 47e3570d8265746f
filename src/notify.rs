//! アウトバウンド通知
//!
//! セッションサマリー通知の送りっぱなし送信と、重大エラーアラートの
//! 日次重複抑止を提供する。アラートの抑止マーカーはファイルとして
//! 永続化され、プロセス再起動をまたいで有効。

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::NotificationConfig;

/// 通知送信クライアント
pub struct Notifier {
    enabled: bool,
    endpoint: String,
    token: String,
    target: String,
    marker_dir: PathBuf,
    client: reqwest::Client,
}

impl Notifier {
    /// 設定から通知クライアントを作成
    pub fn new(config: &NotificationConfig, marker_dir: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            enabled: config.enabled && !config.endpoint.is_empty(),
            endpoint: config.endpoint.clone(),
            token: config.token.clone(),
            target: config.target.clone(),
            marker_dir,
            client,
        }
    }

    /// 送信無効の通知クライアント（テスト・リキャップのドライラン用）
    pub fn disabled(marker_dir: PathBuf) -> Self {
        Self::new(&NotificationConfig::default(), marker_dir)
    }

    /// メッセージを送信（fire-and-forget）
    ///
    /// 失敗はログに残すだけ。呼び出し側の処理は止めない。
    pub async fn send(&self, message: &str) {
        if !self.enabled {
            debug!("Notification skipped (disabled): {} chars", message.len());
            return;
        }

        let body = serde_json::json!({
            "target": self.target,
            "message": message,
        });

        let result = self
            .client
            .post(&self.endpoint)
            .header("Authorization", &self.token)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!("📨 Notification sent ({} chars)", message.len());
            }
            Ok(response) => {
                warn!("Notification endpoint returned HTTP {}", response.status());
            }
            Err(e) => {
                warn!("Failed to send notification: {}", e);
            }
        }
    }

    /// アラートを送信する（同一カテゴリは1日1回まで）
    ///
    /// その日の同カテゴリが送信済みなら何もしない。マーカーはファイル
    /// なので再起動後も抑止が効く。送信を試みたらtrueを返す。
    pub async fn send_alert(&self, category: &str, text: &str) -> bool {
        let today = clock::today();
        let marker = self.marker_path(category, &today.to_string());

        if marker.exists() {
            debug!("Alert suppressed (already sent today): {}", category);
            return false;
        }

        let message = format!("ALERT livemon\nDate: {}\nError: {}", today, text);
        self.send(&message).await;

        if let Some(parent) = marker.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Failed to create marker dir: {}", e);
                return true;
            }
        }
        if let Err(e) = std::fs::write(&marker, "sent") {
            warn!("Failed to write alert marker {}: {}", marker.display(), e);
        }

        true
    }

    /// カテゴリ×日付ごとの抑止マーカーのパス
    fn marker_path(&self, category: &str, day: &str) -> PathBuf {
        self.marker_dir
            .join(format!("alert-{}-{}.flag", category, day))
    }

    /// マーカーディレクトリ（テスト用）
    pub fn marker_dir(&self) -> &Path {
        &self.marker_dir
    }
}

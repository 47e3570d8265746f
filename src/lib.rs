//! livemon — ライブ配信アカウント常駐モニタリングデーモン
//!
//! 固定のアカウント集合を常時監視し、セッション単位の視聴者・ギフト
//! テレメトリを集計して、セッション終了時に永続ストレージへ記録する。
//! プロセス再起動やクラッシュをまたいでもデータを失わないことが責務。

pub mod backoff;
pub mod cache;
pub mod clock;
pub mod config;
pub mod notify;
pub mod recap;
pub mod session;
pub mod shutdown;
pub mod sinks;
pub mod supervisor;
pub mod transport;

use thiserror::Error;

/// クレート共通のエラー型
#[derive(Error, Debug)]
pub enum MonitorError {
    /// ファイルI/Oエラー
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSONシリアライズ/デシリアライズエラー
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// データベース操作エラー
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP通信エラー
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// トランスポート接続エラー
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// その他のエラー
    #[error("{0}")]
    General(#[from] anyhow::Error),
}

/// クレート共通のResult型
pub type MonitorResult<T> = Result<T, MonitorError>;

// Re-export the main types for convenience
pub use cache::PersistenceCache;
pub use config::MonitorConfig;
pub use notify::Notifier;
pub use session::{AccountSession, ContributorId, SessionStatus, SessionSummary, TopSpender};
pub use sinks::{SinkSet, SummarySink};
pub use supervisor::ConnectionSupervisor;
pub use transport::{ErrorClass, LiveTransport, TransportEvent};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        // Test that the main modules are accessible
        assert!(std::any::type_name::<cache::PersistenceCache>().contains("PersistenceCache"));
        assert!(std::any::type_name::<session::AccountSession>().contains("AccountSession"));
    }

    #[test]
    fn test_error_types() {
        // エラー型が生成・表示できることを確認
        let err = MonitorError::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing cache",
        ));
        assert!(err.to_string().contains("missing cache"));
    }
}

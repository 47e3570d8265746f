//! 永続ストレージシンク
//!
//! セッションサマリーとトップスペンダーの記録先。すべてのシンクは
//! session_idをキーにした冪等アップサートを提供し、同じセッションの
//! 再投入（クラッシュ後のリプレイ等）が行を複製しないことを保証する。

pub mod database;
pub mod spreadsheet;

pub use database::LivemonDatabase;
pub use spreadsheet::WorkbookSink;

use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

use crate::session::{SessionSummary, TopSpender};

/// 永続ストレージシンクのインターフェース
///
/// どちらの操作も同一session_idに対して2回呼んでも結果が変わらない
/// こと（最後の呼び出しが勝つ）。
pub trait SummarySink: Send + Sync {
    /// ログ用のシンク名
    fn name(&self) -> &'static str;

    /// セッションサマリーを記録（session_idで冪等アップサート）
    fn record_session_summary(&self, summary: &SessionSummary) -> Result<()>;

    /// トップスペンダーを記録（session_idの既存行を置き換え）
    fn record_top_spenders(&self, summary: &SessionSummary, spenders: &[TopSpender])
        -> Result<()>;
}

/// 登録済みシンクへのベストエフォート一括書き込み
///
/// 個々のシンクの失敗はログに残すだけで後続を止めない。部分的な永続化は
/// 次の自然な書き込み点（リトライやシャットダウンフラッシュ）で冪等に
/// 修復される前提。
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn SummarySink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// シンクを登録
    pub fn push(&mut self, sink: Arc<dyn SummarySink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// 全シンクへサマリーを記録（ベストエフォート）
    pub fn record_session_summary(&self, summary: &SessionSummary) {
        for sink in &self.sinks {
            if let Err(e) = sink.record_session_summary(summary) {
                warn!(
                    "[{}] Failed to record session summary to {}: {}",
                    summary.account,
                    sink.name(),
                    e
                );
            }
        }
    }

    /// 全シンクへトップスペンダーを記録（ベストエフォート）
    pub fn record_top_spenders(&self, summary: &SessionSummary, spenders: &[TopSpender]) {
        for sink in &self.sinks {
            if let Err(e) = sink.record_top_spenders(summary, spenders) {
                warn!(
                    "[{}] Failed to record top spenders to {}: {}",
                    summary.account,
                    sink.name(),
                    e
                );
            }
        }
    }
}

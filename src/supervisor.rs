//! 接続スーパーバイザー
//!
//! アカウント1つにつき1インスタンス。接続試行の発行、トランスポート
//! イベントの解釈、リトライ/バックオフのスケジューリングを担う
//! ステートマシン。状態遷移は `idle → connecting → connected → idle`
//! のループと、エラー分類による idle への分岐のみ。
//!
//! イベント処理はアカウントごとに直列化され、共有状態（キャッシュ・
//! バックオフ・アラート抑止）だけをプロセス横断で触る。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::backoff::IdleBackoffPolicy;
use crate::cache::PersistenceCache;
use crate::clock;
use crate::config::RetryConfig;
use crate::notify::Notifier;
use crate::session::{AccountSession, SessionStatus, SessionSummary, TopSpender, TOP_SPENDER_LIMIT};
use crate::sinks::SinkSet;
use crate::transport::{ErrorClass, LiveTransport, TransportEvent};

/// スーパーバイザーループへの内部コマンド
#[derive(Debug)]
enum Command {
    /// 接続を試みる（スケジュールされたリトライの発火）
    Attempt,
}

/// アカウント1つ分の接続スーパーバイザー
pub struct ConnectionSupervisor {
    session: AccountSession,
    transport: Arc<dyn LiveTransport>,
    cache: Arc<PersistenceCache>,
    policy: Arc<IdleBackoffPolicy>,
    sinks: Arc<SinkSet>,
    notifier: Arc<Notifier>,
    short_retry: Duration,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl ConnectionSupervisor {
    /// スーパーバイザーを作成する
    ///
    /// キャッシュに前回のスナップショットが残っていればそれを引き継ぐ。
    /// 中断されたセッションはゼロからではなく続きから集計される。
    pub fn new(
        account: &str,
        transport: Arc<dyn LiveTransport>,
        cache: Arc<PersistenceCache>,
        policy: Arc<IdleBackoffPolicy>,
        sinks: Arc<SinkSet>,
        notifier: Arc<Notifier>,
        retry: &RetryConfig,
    ) -> Self {
        let mut session = cache
            .get(account)
            .unwrap_or_else(|| AccountSession::new(account));
        if session.has_pending_data() {
            tracing::info!(
                "[{}] Resuming interrupted session {} ({} pt so far)",
                account,
                session.session_id.as_deref().unwrap_or("-"),
                session.total_diamond()
            );
        }
        // 復元直後は実際には未接続
        session.mark_idle();
        cache.store(&session);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        Self {
            session,
            transport,
            cache,
            policy,
            sinks,
            notifier,
            short_retry: Duration::from_secs(retry.short_retry_secs),
            cmd_tx,
            cmd_rx,
        }
    }

    /// イベントループを回す（プロセス終了まで戻らない）
    pub async fn run(mut self) {
        tracing::info!("[{}] 👀 Supervisor started", self.session.account);
        self.schedule_attempt(Duration::ZERO);

        while let Some(command) = self.cmd_rx.recv().await {
            match command {
                Command::Attempt => self.handle_attempt().await,
            }
        }
    }

    /// 指定した遅延の後に接続試行コマンドを送る
    fn schedule_attempt(&self, delay: Duration) {
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(Command::Attempt);
        });
    }

    /// 接続試行1回分を処理する
    async fn handle_attempt(&mut self) {
        // 並行ガード: 別経路で既に接続済みなら古いタイマー発火は無効
        if self.session.status != SessionStatus::Idle {
            tracing::debug!(
                "[{}] Stale retry fired while {:?}, ignoring",
                self.session.account,
                self.session.status
            );
            return;
        }

        self.session.mark_connecting();
        self.cache.store(&self.session);

        match self.transport.connect(&self.session.account).await {
            Ok(events) => {
                self.on_connected();
                self.drain_events(events).await;
            }
            Err(err) => {
                tracing::debug!("[{}] Connect failed: {}", self.session.account, err.detail);
                self.session.mark_idle();
                self.cache.store(&self.session);
                self.apply_error_policy(&err.detail).await;
            }
        }
    }

    /// connected遷移の副作用
    fn on_connected(&mut self) {
        let now = clock::now_local();
        self.session.begin_live(now);
        self.policy.on_connected();
        self.cache.store(&self.session);
        tracing::info!(
            "[{}] 🔴 LIVE started at {} (session {})",
            self.session.account,
            clock::fmt_time(now),
            self.session.session_id.as_deref().unwrap_or("-")
        );
    }

    /// 接続中のイベントストリームを消費する
    async fn drain_events(&mut self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Viewer { count } => {
                    // 高頻度サンプルなので毎回は永続化しない
                    self.session.record_viewers(count);
                }
                TransportEvent::Gift {
                    contributor_id,
                    display_name,
                    points,
                } => {
                    self.handle_gift(&contributor_id, &display_name, points);
                }
                TransportEvent::Disconnect => {
                    self.on_disconnect();
                    return;
                }
                TransportEvent::End => {
                    self.on_stream_end().await;
                    return;
                }
                TransportEvent::Error { detail } => {
                    self.on_stream_error(detail).await;
                    return;
                }
            }
        }

        // ストリームが黙って閉じた場合も素の切断として扱う
        self.on_disconnect();
    }

    /// ギフトイベント: 加算 → キャッシュ書き込み → ランキング更新
    fn handle_gift(&mut self, contributor_id: &str, display_name: &str, points: u64) {
        self.session.record_gift(contributor_id, display_name, points);
        tracing::info!(
            "[{}] 🎁 Gift from {}: {} pt (session total {})",
            self.session.account,
            display_name,
            points,
            self.session.total_diamond()
        );

        // ポイントが失われるのは最大でもキャッシュ書き込み2回分の間
        self.cache.store(&self.session);

        // 進行中セッションのランキングを即時に問い合わせ可能にしておく
        let interim = self.session.summarize(clock::now_local());
        let spenders = self.session.top_spenders(TOP_SPENDER_LIMIT);
        self.sinks.record_top_spenders(&interim, &spenders);
    }

    /// 素の切断: セッションは確定せず、すぐの再接続に備えて保持する
    fn on_disconnect(&mut self) {
        tracing::info!(
            "[{}] Disconnected (session kept for prompt reconnect)",
            self.session.account
        );
        self.session.mark_idle();
        self.cache.store(&self.session);
        self.schedule_attempt(self.short_retry);
    }

    /// 配信終了: セッションを確定してクリアする
    async fn on_stream_end(&mut self) {
        let ended_at = clock::now_local();
        self.session.ended_at = Some(ended_at);

        let summary = self.session.summarize(ended_at);
        let spenders = self.session.top_spenders(TOP_SPENDER_LIMIT);

        tracing::info!(
            "[{}] ⚪ LIVE ended at {}: {} in {} (peak {} viewers)",
            self.session.account,
            clock::fmt_time(ended_at),
            summary.total_diamond,
            summary.duration_label(),
            summary.peak_viewers
        );

        emit_session_record(&summary, &spenders, &self.sinks, &self.notifier).await;

        // 確定済みマークを先に永続化する。remove前にクラッシュしても
        // 再起動時にこのセッションが再開・再確定されることはない
        self.session.persisted = true;
        self.cache.store(&self.session);
        self.session.clear();
        self.cache.remove(&self.session.account);

        // 配信終了直後は長いアイドル待ちではなく最小間隔で再ポーリング
        self.schedule_attempt(self.policy.minimum_delay());
    }

    /// 接続中のエラー: 分類してリトライ方針を決める
    async fn on_stream_error(&mut self, detail: String) {
        tracing::error!("[{}] error: {}", self.session.account, detail);
        self.session.mark_idle();
        self.cache.store(&self.session);
        self.apply_error_policy(&detail).await;
    }

    /// エラー分類に応じた再試行スケジューリング
    async fn apply_error_policy(&mut self, detail: &str) {
        match ErrorClass::from_detail(detail) {
            ErrorClass::Offline => {
                // 配信していないだけ。クォーラム条件つきでバックオフを進める
                self.policy.observe_idle(self.cache.all_idle());
                let delay = self.policy.idle_delay();
                tracing::debug!(
                    "[{}] Not live, next poll in {}s",
                    self.session.account,
                    delay.as_secs()
                );
                self.schedule_attempt(delay);
            }
            ErrorClass::Transient => {
                self.schedule_attempt(self.short_retry);
            }
            ErrorClass::Severe(kind) => {
                tracing::error!(
                    "[{}] Severe error ({}): {}",
                    self.session.account,
                    kind.category(),
                    detail
                );
                self.schedule_attempt(self.short_retry);
                let message = format!("[{}] {}", self.session.account, detail);
                self.notifier.send_alert(kind.category(), &message).await;
            }
        }
    }
}

/// サマリーとランキングをシンクへ記録し、通知を送る
///
/// 各呼び出しは独立のベストエフォート。シンク側の冪等アップサートが
/// あるため、同じサマリーをもう一度投げても安全。
pub(crate) async fn emit_session_record(
    summary: &SessionSummary,
    spenders: &[TopSpender],
    sinks: &SinkSet,
    notifier: &Notifier,
) {
    sinks.record_session_summary(summary);
    sinks.record_top_spenders(summary, spenders);

    let top3 = spenders
        .iter()
        .take(3)
        .map(|s| format!("{} ({}pt)", s.display_name, s.points))
        .collect::<Vec<_>>()
        .join(" - ");

    let message = format!(
        "Live finished: {}\nDuration: {}\nTotal points: {} diamond\nTop spenders: {}",
        summary.account,
        summary.duration_label(),
        summary.total_diamond,
        if top3.is_empty() { "-".to_string() } else { top3 }
    );
    notifier.send(&message).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::LivemonDatabase;
    use crate::transport::{ConnectOutcome, ScriptedTransport, TransportError};
    use tempfile::TempDir;

    /// テスト用の依存一式
    struct Fixture {
        transport: Arc<ScriptedTransport>,
        cache: Arc<PersistenceCache>,
        policy: Arc<IdleBackoffPolicy>,
        db: Arc<LivemonDatabase>,
        sinks: Arc<SinkSet>,
        notifier: Arc<Notifier>,
        _marker_dir: TempDir,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(ScriptedTransport::new());
        let cache = Arc::new(PersistenceCache::in_memory());
        let policy = Arc::new(IdleBackoffPolicy::new(&RetryConfig::default()));
        let db = Arc::new(LivemonDatabase::new_in_memory().unwrap());

        let mut sinks = SinkSet::new();
        sinks.push(db.clone());
        let sinks = Arc::new(sinks);

        let marker_dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(Notifier::disabled(marker_dir.path().to_path_buf()));

        Fixture {
            transport,
            cache,
            policy,
            db,
            sinks,
            notifier,
            _marker_dir: marker_dir,
        }
    }

    fn supervisor(fx: &Fixture, account: &str) -> ConnectionSupervisor {
        ConnectionSupervisor::new(
            account,
            fx.transport.clone(),
            fx.cache.clone(),
            fx.policy.clone(),
            fx.sinks.clone(),
            fx.notifier.clone(),
            &RetryConfig::default(),
        )
    }

    fn gift(id: &str, name: &str, points: u64) -> TransportEvent {
        TransportEvent::Gift {
            contributor_id: id.to_string(),
            display_name: name.to_string(),
            points,
        }
    }

    #[tokio::test]
    async fn test_full_session_lifecycle() {
        let fx = fixture();
        fx.transport.push(
            "alpha",
            ConnectOutcome::Events(vec![
                TransportEvent::Viewer { count: 10 },
                gift("x", "userX", 50),
                TransportEvent::Viewer { count: 25 },
                gift("y", "userY", 30),
                TransportEvent::Viewer { count: 18 },
                TransportEvent::End,
            ]),
        );

        let mut sup = supervisor(&fx, "alpha");
        sup.handle_attempt().await;

        // セッションが確定してシンクへ到達している
        let sessions = fx.db.sessions_on(clock::today()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].total_diamond, 80);
        assert_eq!(sessions[0].peak_viewers, 25);

        let spenders = fx.db.top_spenders_for(&sessions[0].session_id, 10).unwrap();
        assert_eq!(spenders[0].display_name, "userX");
        assert_eq!(spenders[0].points, 50);

        // アキュムレータはクリアされ、キャッシュからも消えている
        assert_eq!(sup.session.status, SessionStatus::Idle);
        assert!(!sup.session.has_pending_data());
        assert!(fx.cache.get("alpha").is_none());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_session_and_reconnect_resumes() {
        let fx = fixture();
        fx.transport.push(
            "alpha",
            ConnectOutcome::Events(vec![gift("x", "userX", 50), TransportEvent::Disconnect]),
        );
        fx.transport.push(
            "alpha",
            ConnectOutcome::Events(vec![gift("y", "userY", 30), TransportEvent::End]),
        );

        let mut sup = supervisor(&fx, "alpha");
        sup.handle_attempt().await;

        // 素の切断ではアキュムレータが保持され、キャッシュにも残る
        let cached = fx.cache.get("alpha").unwrap();
        assert_eq!(cached.total_diamond(), 50);
        let first_id = cached.session_id.clone().unwrap();

        sup.handle_attempt().await;

        // 再接続後は同じセッションに積み増して確定する
        let sessions = fx.db.sessions_on(clock::today()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, first_id);
        assert_eq!(sessions[0].total_diamond, 80);
    }

    #[tokio::test]
    async fn test_gift_is_cache_durable_before_session_end() {
        let fx = fixture();
        fx.transport.push(
            "alpha",
            ConnectOutcome::Events(vec![gift("x", "userX", 50), TransportEvent::Disconnect]),
        );

        let mut sup = supervisor(&fx, "alpha");
        sup.handle_attempt().await;

        // セッション未確定でもギフトはキャッシュに到達している
        let cached = fx.cache.get("alpha").unwrap();
        assert_eq!(cached.total_diamond(), 50);
        assert!(cached.session_id.is_some());
    }

    #[tokio::test]
    async fn test_offline_errors_escalate_with_quorum() {
        let fx = fixture();
        // 他のアカウントもアイドルでクォーラムが成立している状況
        fx.cache.store(&AccountSession::new("other"));

        for _ in 0..3 {
            fx.transport.push(
                "alpha",
                ConnectOutcome::Fail(TransportError::new("user_not_found")),
            );
        }

        let mut sup = supervisor(&fx, "alpha");
        let base = fx.policy.current_interval();

        for _ in 0..3 {
            sup.handle_attempt().await;
        }

        // しきい値3回でちょうど1段エスカレーション
        assert_eq!(
            fx.policy.current_interval(),
            base + Duration::from_secs(300)
        );
    }

    #[tokio::test]
    async fn test_no_escalation_while_another_account_is_live() {
        let fx = fixture();
        let mut live = AccountSession::new("other");
        live.begin_live(clock::now_local());
        fx.cache.store(&live);

        for _ in 0..6 {
            fx.transport.push(
                "alpha",
                ConnectOutcome::Fail(TransportError::new("user_not_found")),
            );
        }

        let mut sup = supervisor(&fx, "alpha");
        let base = fx.policy.current_interval();
        for _ in 0..6 {
            sup.handle_attempt().await;
        }

        assert_eq!(fx.policy.current_interval(), base);
    }

    #[tokio::test]
    async fn test_stale_retry_is_noop() {
        let fx = fixture();
        fx.transport
            .push("alpha", ConnectOutcome::Events(vec![TransportEvent::End]));

        let mut sup = supervisor(&fx, "alpha");
        sup.session.begin_live(clock::now_local());

        // 既にconnectedの状態で古いタイマーが発火しても接続試行しない
        sup.handle_attempt().await;
        assert_eq!(fx.transport.remaining("alpha"), 1);
    }

    #[tokio::test]
    async fn test_severe_error_raises_deduplicated_alert() {
        let fx = fixture();
        fx.transport.push(
            "alpha",
            ConnectOutcome::Fail(TransportError::new("rate limit exceeded")),
        );
        fx.transport.push(
            "alpha",
            ConnectOutcome::Fail(TransportError::new("rate limit exceeded")),
        );

        let mut sup = supervisor(&fx, "alpha");
        sup.handle_attempt().await;
        sup.handle_attempt().await;

        // マーカーは1つだけ（同カテゴリの2回目は抑止）
        let markers: Vec<_> = std::fs::read_dir(fx.notifier.marker_dir())
            .unwrap()
            .collect();
        assert_eq!(markers.len(), 1);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_cache() {
        let fx = fixture();

        // 前回プロセスの進行中セッションがキャッシュに残っている
        let mut interrupted = AccountSession::new("alpha");
        interrupted.begin_live(clock::now_local());
        interrupted.record_gift("x", "userX", 50);
        interrupted.record_viewers(25);
        let session_id = interrupted.session_id.clone().unwrap();
        fx.cache.store(&interrupted);

        fx.transport.push(
            "alpha",
            ConnectOutcome::Events(vec![gift("y", "userY", 30), TransportEvent::End]),
        );

        let mut sup = supervisor(&fx, "alpha");
        sup.handle_attempt().await;

        // 復元したギフト・ピークを失わず、二重計上もしない
        let sessions = fx.db.sessions_on(clock::today()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, session_id);
        assert_eq!(sessions[0].total_diamond, 80);
        assert_eq!(sessions[0].peak_viewers, 25);
    }

    #[tokio::test]
    async fn test_connect_resets_backoff() {
        let fx = fixture();
        for _ in 0..3 {
            fx.transport.push(
                "alpha",
                ConnectOutcome::Fail(TransportError::new("user_not_found")),
            );
        }
        fx.transport
            .push("alpha", ConnectOutcome::Events(vec![TransportEvent::End]));

        let mut sup = supervisor(&fx, "alpha");
        for _ in 0..3 {
            sup.handle_attempt().await;
        }
        assert!(fx.policy.current_interval() > fx.policy.minimum_delay());

        sup.handle_attempt().await;

        // どれかのアカウントが接続したら最小値へ戻る
        assert_eq!(fx.policy.current_interval(), fx.policy.minimum_delay());
    }
}

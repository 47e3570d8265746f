//! シャットダウンフラッシュコーディネーター
//!
//! 終了シグナル受信時に全アカウントのキャッシュを歩き、未永続の
//! テレメトリを持つセッションを通常の確定手順で強制フラッシュする。
//! 終了シグナルなしでセッションを確定してよいのはここだけ。

use crate::cache::PersistenceCache;
use crate::clock;
use crate::notify::Notifier;
use crate::session::TOP_SPENDER_LIMIT;
use crate::sinks::SinkSet;
use crate::supervisor;

/// 未永続のセッションをすべてフラッシュし、最終キャッシュ書き込みを行う
///
/// 直前に通常経路で確定済みのアカウントはスナップショットの状態で
/// 弾かれるため、二重確定にならない（冪等）。失敗はログに残して
/// 飲み込み、プロセスは必ず正常終了できる。
pub async fn flush_all(cache: &PersistenceCache, sinks: &SinkSet, notifier: &Notifier) -> usize {
    let mut flushed = 0;

    for snapshot in cache.snapshot() {
        if !snapshot.has_pending_data() {
            continue;
        }

        // 生きているセッション自身の開始時刻とセッションIDが常に優先される
        let ended_at = clock::now_local();
        let summary = snapshot.summarize(ended_at);
        let spenders = snapshot.top_spenders(TOP_SPENDER_LIMIT);

        tracing::info!(
            "🛑 [{}] Flushing open session {} ({} pt, peak {})",
            snapshot.account,
            summary.session_id,
            summary.total_diamond,
            summary.peak_viewers
        );

        supervisor::emit_session_record(&summary, &spenders, sinks, notifier).await;

        // 確定済みマークを先に書いてから取り除く（remove前に落ちても
        // 次回起動で再確定されない）
        let mut done = snapshot.clone();
        done.persisted = true;
        cache.store(&done);
        cache.remove(&snapshot.account);
        flushed += 1;
    }

    // 最終書き込み。ここで失敗してもログのみで終了は止めない
    cache.write();

    if flushed > 0 {
        tracing::info!("💾 Shutdown flush completed: {} session(s)", flushed);
    } else {
        tracing::debug!("Shutdown flush: nothing pending");
    }

    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AccountSession;
    use crate::sinks::LivemonDatabase;
    use std::sync::Arc;

    fn sinks_with_db() -> (Arc<SinkSet>, Arc<LivemonDatabase>) {
        let db = Arc::new(LivemonDatabase::new_in_memory().unwrap());
        let mut sinks = SinkSet::new();
        sinks.push(db.clone());
        (Arc::new(sinks), db)
    }

    #[tokio::test]
    async fn test_flush_finalizes_open_sessions() {
        let cache = PersistenceCache::in_memory();
        let (sinks, db) = sinks_with_db();
        let marker_dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::disabled(marker_dir.path().to_path_buf());

        let mut open = AccountSession::new("alpha");
        open.begin_live(clock::now_local());
        open.record_gift("x", "userX", 50);
        open.record_viewers(25);
        cache.store(&open);

        // アイドルで何も持っていないアカウントは対象外
        cache.store(&AccountSession::new("beta"));

        let flushed = flush_all(&cache, &sinks, &notifier).await;

        assert_eq!(flushed, 1);
        let sessions = db.sessions_on(clock::today()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].account, "alpha");
        assert_eq!(sessions[0].total_diamond, 50);
        assert!(cache.get("alpha").is_none());
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let cache = PersistenceCache::in_memory();
        let (sinks, db) = sinks_with_db();
        let marker_dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::disabled(marker_dir.path().to_path_buf());

        let mut open = AccountSession::new("alpha");
        open.begin_live(clock::now_local());
        open.record_gift("x", "userX", 50);
        cache.store(&open);

        let first = flush_all(&cache, &sinks, &notifier).await;
        // 直後のリプレイ（クラッシュとシャットダウンが重なったケース）
        let second = flush_all(&cache, &sinks, &notifier).await;

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(db.sessions_on(clock::today()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_replays_after_partial_finalization() {
        let cache = PersistenceCache::in_memory();
        let (sinks, db) = sinks_with_db();
        let marker_dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::disabled(marker_dir.path().to_path_buf());

        // シンク書き込み後・キャッシュクリア前にクラッシュした状況:
        // スナップショットが残ったままシンクには行がある
        let mut open = AccountSession::new("alpha");
        open.begin_live(clock::now_local());
        open.record_gift("x", "userX", 50);
        let summary = open.summarize(clock::now_local());
        let spenders = open.top_spenders(TOP_SPENDER_LIMIT);
        supervisor::emit_session_record(&summary, &spenders, &sinks, &notifier).await;
        cache.store(&open);

        let flushed = flush_all(&cache, &sinks, &notifier).await;

        // 再フラッシュしても行は1つのまま（冪等アップサート）
        assert_eq!(flushed, 1);
        let sessions = db.sessions_on(clock::today()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].total_diamond, 50);
        assert_eq!(
            db.top_spenders_for(&sessions[0].session_id, 10).unwrap().len(),
            1
        );
    }
}

//! SQLite永続シンク
//!
//! セッションサマリーとトップスペンダーをローカルデータベースへ記録する。
//! どちらもsession_idをキーにした冪等アップサートで、クラッシュ後の
//! 再投入が重複行を作らないことを保証する。

use anyhow::Result;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::params;
use std::path::Path;

use super::SummarySink;
use crate::session::{ContributorId, SessionSummary, TopSpender};

/// livemon用データベース接続管理
pub struct LivemonDatabase {
    connection: Mutex<rusqlite::Connection>,
}

impl LivemonDatabase {
    /// 新しいデータベース接続を作成
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let connection = rusqlite::Connection::open(db_path)?;
        let db = Self {
            connection: Mutex::new(connection),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// インメモリデータベースを作成（テスト用）
    pub fn new_in_memory() -> Result<Self> {
        let connection = rusqlite::Connection::open_in_memory()?;
        let db = Self {
            connection: Mutex::new(connection),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// データベーススキーマを初期化
    fn initialize_schema(&self) -> Result<()> {
        self.connection
            .lock()
            .execute_batch(include_str!("schema.sql"))?;
        tracing::debug!("Database schema initialized");
        Ok(())
    }

    /// 指定日の確定済みセッション一覧を取得（開始時刻順）
    pub fn sessions_on(&self, date: NaiveDate) -> Result<Vec<SessionSummary>> {
        let conn = self.connection.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, account, date, start_time, end_time,
                    duration_hours, duration_minutes, total_diamond, peak_viewers
             FROM live_summary
             WHERE date = ?1
             ORDER BY start_time",
        )?;

        let rows = stmt.query_map(params![date], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                account: row.get(1)?,
                date: row.get(2)?,
                start_time: row.get(3)?,
                end_time: row.get(4)?,
                duration_hours: row.get::<_, i64>(5)? as u64,
                duration_minutes: row.get::<_, i64>(6)? as u64,
                total_diamond: row.get::<_, i64>(7)? as u64,
                peak_viewers: row.get::<_, i64>(8)? as u64,
                persisted: true,
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// セッションのトップスペンダーを上位から取得
    pub fn top_spenders_for(&self, session_id: &str, limit: usize) -> Result<Vec<TopSpender>> {
        let conn = self.connection.lock();
        let mut stmt = conn.prepare(
            "SELECT contributor_id, display_name, points
             FROM top_spenders
             WHERE session_id = ?1
             ORDER BY position
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            Ok(TopSpender {
                contributor_id: ContributorId::new(row.get::<_, String>(0)?),
                display_name: row.get(1)?,
                points: row.get::<_, i64>(2)? as u64,
            })
        })?;

        let mut spenders = Vec::new();
        for row in rows {
            spenders.push(row?);
        }
        Ok(spenders)
    }
}

impl SummarySink for LivemonDatabase {
    fn name(&self) -> &'static str {
        "database"
    }

    fn record_session_summary(&self, summary: &SessionSummary) -> Result<()> {
        self.connection.lock().execute(
            "INSERT INTO live_summary
                 (session_id, account, date, start_time, end_time,
                  duration_hours, duration_minutes, total_diamond, peak_viewers)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(session_id) DO UPDATE SET
                 account = excluded.account,
                 date = excluded.date,
                 start_time = excluded.start_time,
                 end_time = excluded.end_time,
                 duration_hours = excluded.duration_hours,
                 duration_minutes = excluded.duration_minutes,
                 total_diamond = excluded.total_diamond,
                 peak_viewers = excluded.peak_viewers",
            params![
                summary.session_id,
                summary.account,
                summary.date,
                summary.start_time,
                summary.end_time,
                summary.duration_hours as i64,
                summary.duration_minutes as i64,
                summary.total_diamond as i64,
                summary.peak_viewers as i64,
            ],
        )?;

        tracing::debug!(
            "💾 Session summary recorded: {} ({})",
            summary.session_id,
            summary.account
        );
        Ok(())
    }

    fn record_top_spenders(
        &self,
        summary: &SessionSummary,
        spenders: &[TopSpender],
    ) -> Result<()> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction()?;

        // 最新の呼び出しが勝つ: 同一セッションの既存行を丸ごと置き換える
        tx.execute(
            "DELETE FROM top_spenders WHERE session_id = ?1",
            params![summary.session_id],
        )?;

        for (index, spender) in spenders.iter().enumerate() {
            tx.execute(
                "INSERT INTO top_spenders
                     (session_id, position, contributor_id, display_name, points)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    summary.session_id,
                    (index + 1) as i64,
                    spender.contributor_id.to_string(),
                    spender.display_name,
                    spender.points as i64,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_summary(session_id: &str) -> SessionSummary {
        SessionSummary {
            account: "alpha".to_string(),
            session_id: session_id.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 5, 20).unwrap(),
            start_time: "18:00".to_string(),
            end_time: "19:23".to_string(),
            duration_hours: 1,
            duration_minutes: 23,
            total_diamond: 80,
            peak_viewers: 25,
            persisted: false,
        }
    }

    #[test]
    fn test_summary_upsert_is_idempotent() {
        let db = LivemonDatabase::new_in_memory().unwrap();
        let summary = sample_summary("s-1");

        // クラッシュ後の再投入をシミュレート: 2回書いても1行のまま
        db.record_session_summary(&summary).unwrap();
        db.record_session_summary(&summary).unwrap();

        let sessions = db.sessions_on(summary.date).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].total_diamond, 80);
        assert_eq!(sessions[0].peak_viewers, 25);
    }

    #[test]
    fn test_summary_upsert_latest_wins() {
        let db = LivemonDatabase::new_in_memory().unwrap();
        let mut summary = sample_summary("s-1");
        db.record_session_summary(&summary).unwrap();

        summary.total_diamond = 120;
        db.record_session_summary(&summary).unwrap();

        let sessions = db.sessions_on(summary.date).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].total_diamond, 120);
    }

    #[test]
    fn test_top_spenders_replaced_not_duplicated() {
        let db = LivemonDatabase::new_in_memory().unwrap();
        let summary = sample_summary("s-1");

        let first = vec![
            TopSpender {
                contributor_id: ContributorId::new("x"),
                display_name: "userX".into(),
                points: 50,
            },
            TopSpender {
                contributor_id: ContributorId::new("y"),
                display_name: "userY".into(),
                points: 30,
            },
        ];
        db.record_top_spenders(&summary, &first).unwrap();

        // ギフト追加後の再投入で置き換わる
        let second = vec![
            TopSpender {
                contributor_id: ContributorId::new("y"),
                display_name: "userY".into(),
                points: 90,
            },
            TopSpender {
                contributor_id: ContributorId::new("x"),
                display_name: "userX".into(),
                points: 50,
            },
        ];
        db.record_top_spenders(&summary, &second).unwrap();

        let spenders = db.top_spenders_for("s-1", 10).unwrap();
        assert_eq!(spenders.len(), 2);
        assert_eq!(spenders[0].contributor_id, ContributorId::new("y"));
        assert_eq!(spenders[0].points, 90);
    }

    #[test]
    fn test_sessions_on_filters_by_date() {
        let db = LivemonDatabase::new_in_memory().unwrap();
        db.record_session_summary(&sample_summary("s-1")).unwrap();

        let mut other_day = sample_summary("s-2");
        other_day.date = NaiveDate::from_ymd_opt(2025, 5, 21).unwrap();
        db.record_session_summary(&other_day).unwrap();

        let sessions = db
            .sessions_on(NaiveDate::from_ymd_opt(2025, 5, 20).unwrap())
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "s-1");
    }
}

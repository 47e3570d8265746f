//! 日次リキャップ
//!
//! データベースシンクからその日の確定済みセッションを読み出し、
//! 1通のまとめ通知として送信する。cronから `livemon recap` で
//! 実行される想定。

use anyhow::Result;
use chrono::NaiveDate;

use crate::notify::Notifier;
use crate::session::{SessionSummary, TopSpender};
use crate::sinks::LivemonDatabase;

/// 指定日のリキャップを組み立てて送信する
///
/// 送信したセッション数を返す。データが無い日は送信せず0を返す。
pub async fn send_daily_recap(
    db: &LivemonDatabase,
    notifier: &Notifier,
    date: NaiveDate,
) -> Result<usize> {
    let sessions = db.sessions_on(date)?;
    if sessions.is_empty() {
        tracing::info!("No live sessions recorded on {}", date);
        return Ok(0);
    }

    let mut message = format!("Live recap {}\n", date);
    for (index, summary) in sessions.iter().enumerate() {
        let top3 = db.top_spenders_for(&summary.session_id, 3)?;
        message.push('\n');
        message.push_str(&format_session_block(index + 1, summary, &top3));
    }

    notifier.send(&message).await;
    tracing::info!("📨 Daily recap sent: {} session(s)", sessions.len());

    Ok(sessions.len())
}

/// セッション1件分のリキャップ行を整形する
fn format_session_block(index: usize, summary: &SessionSummary, top3: &[TopSpender]) -> String {
    let spenders = if top3.is_empty() {
        "-".to_string()
    } else {
        top3.iter()
            .map(|s| format!("{} ({})", s.display_name, s.points))
            .collect::<Vec<_>>()
            .join(" - ")
    };

    format!(
        "Session {}: {}\n  {} - {} ({})\n  Total diamond: {}\n  Top spenders: {}\n",
        index,
        summary.account,
        summary.start_time,
        summary.end_time,
        summary.duration_label(),
        summary.total_diamond,
        spenders
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ContributorId;
    use crate::sinks::SummarySink;

    fn summary(session_id: &str, account: &str, start: &str) -> SessionSummary {
        SessionSummary {
            account: account.to_string(),
            session_id: session_id.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 5, 20).unwrap(),
            start_time: start.to_string(),
            end_time: "19:23".to_string(),
            duration_hours: 1,
            duration_minutes: 23,
            total_diamond: 80,
            peak_viewers: 25,
            persisted: true,
        }
    }

    #[tokio::test]
    async fn test_recap_counts_sessions_of_the_day() {
        let db = LivemonDatabase::new_in_memory().unwrap();
        let marker_dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::disabled(marker_dir.path().to_path_buf());

        db.record_session_summary(&summary("s-1", "alpha", "09:00"))
            .unwrap();
        db.record_session_summary(&summary("s-2", "beta", "18:00"))
            .unwrap();

        let date = NaiveDate::from_ymd_opt(2025, 5, 20).unwrap();
        let sent = send_daily_recap(&db, &notifier, date).await.unwrap();

        assert_eq!(sent, 2);
    }

    #[tokio::test]
    async fn test_recap_empty_day_sends_nothing() {
        let db = LivemonDatabase::new_in_memory().unwrap();
        let marker_dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::disabled(marker_dir.path().to_path_buf());

        let date = NaiveDate::from_ymd_opt(2025, 5, 20).unwrap();
        let sent = send_daily_recap(&db, &notifier, date).await.unwrap();

        assert_eq!(sent, 0);
    }

    #[test]
    fn test_session_block_format() {
        let top3 = vec![
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

        let block = format_session_block(1, &summary("s-1", "alpha", "18:00"), &top3);

        assert!(block.contains("Session 1: alpha"));
        assert!(block.contains("18:00 - 19:23 (1h 23m)"));
        assert!(block.contains("Total diamond: 80"));
        assert!(block.contains("userX (50) - userY (30)"));
    }

    #[test]
    fn test_session_block_without_spenders() {
        let block = format_session_block(2, &summary("s-1", "alpha", "18:00"), &[]);
        assert!(block.contains("Top spenders: -"));
    }
}

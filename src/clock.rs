//! ローカル時刻ユーティリティ
//!
//! 記録系のタイムスタンプは全てローカル日時（日付＋時刻）に揃える。

use chrono::{DateTime, Local, NaiveDate};

/// 現在のローカル日時
pub fn now_local() -> DateTime<Local> {
    Local::now()
}

/// 今日のローカル日付（日またぎ判定のキー）
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// 経過時間を「時間＋残り分」に分解する（秒以下は切り捨て）
///
/// 終了が開始より前の場合は 0h 0m として扱う。
pub fn split_duration(start: DateTime<Local>, end: DateTime<Local>) -> (u64, u64) {
    let elapsed = end.signed_duration_since(start);
    let total_minutes = elapsed.num_minutes().max(0) as u64;
    (total_minutes / 60, total_minutes % 60)
}

/// 表示用の経過時間文字列（例: "1h 23m"、1時間未満は "23m"）
pub fn format_duration(hours: u64, minutes: u64) -> String {
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

/// シンク記録用の日付文字列
pub fn fmt_date(dt: DateTime<Local>) -> String {
    dt.format("%Y-%m-%d").to_string()
}

/// シンク記録用の時刻文字列（分まで）
pub fn fmt_time(dt: DateTime<Local>) -> String {
    dt.format("%H:%M").to_string()
}

//! セッションアキュムレータ
//!
//! 接続中アカウント1つ分の可変状態（ギフト累計・ピーク視聴者数・開始時刻・
//! セッションID）と、終了時に導出されるサマリー/ランキングを提供する。

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::clock;

/// ランキングに載せる最大人数
pub const TOP_SPENDER_LIMIT: usize = 10;

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
}

/// 貢献者の安定ID
///
/// 表示名は変わり得るため、累計のキーには必ずこちらを使う。
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContributorId(pub String);

impl ContributorId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

/// 貢献者1人分の累計
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftTally {
    /// 表示名（最後に観測したもの）
    pub display_name: String,
    /// 累計ポイント
    pub points: u64,
    /// 初観測の順序（同点タイブレーク用）
    pub first_seen: u64,
}

/// ランキングスナップショットの1行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopSpender {
    pub contributor_id: ContributorId,
    pub display_name: String,
    pub points: u64,
}

/// アカウント1つ分のセッションアキュムレータ
///
/// ライフサイクル: 接続イベントで生成 → ギフト/視聴者イベントで更新 →
/// 終了イベントまたはシャットダウンフラッシュで確定 → 確定後にクリア。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSession {
    /// 監視対象アカウント
    pub account: String,
    /// 接続状態（idle/connecting/connectedのいずれか1つ）
    pub status: SessionStatus,
    /// 配信セッションの一意トークン（connected遷移時に採番）
    pub session_id: Option<String>,
    /// 配信開始時刻
    pub started_at: Option<DateTime<Local>>,
    /// 配信終了時刻
    pub ended_at: Option<DateTime<Local>>,
    /// ピーク視聴者数（セッション内で単調非減少）
    pub peak_viewers: u64,
    /// 貢献者ID → 累計ポイント
    pub gift_totals: HashMap<ContributorId, GiftTally>,
    /// 次に採番する初観測順序
    gift_seq: u64,
    /// 配信中フラグ（全アカウントアイドル判定に使う）
    pub last_live: bool,
    /// 終了処理がシンクまで到達済みか（二重確定ガード）
    pub persisted: bool,
}

impl AccountSession {
    /// 空のアイドル状態を作成
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            status: SessionStatus::Idle,
            session_id: None,
            started_at: None,
            ended_at: None,
            peak_viewers: 0,
            gift_totals: HashMap::new(),
            gift_seq: 0,
            last_live: false,
            persisted: false,
        }
    }

    /// 接続試行中に遷移
    pub fn mark_connecting(&mut self) {
        self.status = SessionStatus::Connecting;
    }

    /// アイドルに戻す（アキュムレータの中身には触れない）
    pub fn mark_idle(&mut self) {
        self.status = SessionStatus::Idle;
        self.last_live = false;
    }

    /// 配信開始（connected遷移）
    ///
    /// 未確定のセッションが残っている場合は新規採番せずそれを継続する。
    /// 瞬断からの再接続で同じセッションに積み続けるための挙動。
    /// 確定済み（persisted）の残骸は継続せず新しいセッションを開始する。
    pub fn begin_live(&mut self, now: DateTime<Local>) {
        if self.persisted {
            self.clear();
        }
        if self.session_id.is_none() {
            self.session_id = Some(Uuid::new_v4().to_string());
            self.started_at = Some(now);
            self.peak_viewers = 0;
            self.gift_totals.clear();
            self.gift_seq = 0;
        }
        self.status = SessionStatus::Connected;
        self.last_live = true;
        self.ended_at = None;
        self.persisted = false;
    }

    /// ギフトイベントを加算
    pub fn record_gift(&mut self, contributor_id: &str, display_name: &str, points: u64) {
        let key = ContributorId::new(contributor_id);
        if let Some(entry) = self.gift_totals.get_mut(&key) {
            // 表示名は変わり得るので最新を保持する
            entry.display_name = display_name.to_string();
            entry.points += points;
        } else {
            self.gift_totals.insert(
                key,
                GiftTally {
                    display_name: display_name.to_string(),
                    points,
                    first_seen: self.gift_seq,
                },
            );
            self.gift_seq += 1;
        }
    }

    /// 視聴者数サンプルを反映（peak = max(peak, sample)）
    pub fn record_viewers(&mut self, sample: u64) {
        if sample > self.peak_viewers {
            self.peak_viewers = sample;
        }
    }

    /// ギフト累計の合計ポイント
    pub fn total_diamond(&self) -> u64 {
        self.gift_totals.values().map(|t| t.points).sum()
    }

    /// ポイント降順のランキングを導出
    ///
    /// 同点は初観測が早い貢献者が上位。最大 `limit` 件。
    pub fn top_spenders(&self, limit: usize) -> Vec<TopSpender> {
        let mut ranked: Vec<(&ContributorId, &GiftTally)> = self.gift_totals.iter().collect();
        ranked.sort_by(|a, b| {
            b.1.points
                .cmp(&a.1.points)
                .then(a.1.first_seen.cmp(&b.1.first_seen))
        });
        ranked
            .into_iter()
            .take(limit)
            .map(|(id, tally)| TopSpender {
                contributor_id: id.clone(),
                display_name: tally.display_name.clone(),
                points: tally.points,
            })
            .collect()
    }

    /// 未確定のテレメトリを保持しているか
    pub fn has_pending_data(&self) -> bool {
        !self.persisted && (self.session_id.is_some() || !self.gift_totals.is_empty())
    }

    /// 終了時刻を確定してサマリーを導出
    ///
    /// 開始時刻が欠けているスナップショット（旧バージョンの部分書き込み）
    /// だけ、終了時刻とその場で採番したIDで補う。生きているセッションは
    /// 常に自分自身の開始時刻とセッションIDが優先される。
    pub fn summarize(&self, ended_at: DateTime<Local>) -> SessionSummary {
        let started = self.started_at.unwrap_or(ended_at);
        let (hours, minutes) = clock::split_duration(started, ended_at);

        SessionSummary {
            account: self.account.clone(),
            session_id: self
                .session_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            date: started.date_naive(),
            start_time: clock::fmt_time(started),
            end_time: clock::fmt_time(ended_at),
            duration_hours: hours,
            duration_minutes: minutes,
            total_diamond: self.total_diamond(),
            peak_viewers: self.peak_viewers,
            persisted: false,
        }
    }

    /// 確定済みセッションをクリアして素のアイドル状態へ戻す
    pub fn clear(&mut self) {
        let account = std::mem::take(&mut self.account);
        *self = Self::new(account);
    }
}

/// 確定したセッション1件分のサマリーレコード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub account: String,
    pub session_id: String,
    /// 開始日（ローカル）
    pub date: NaiveDate,
    /// 開始時刻 "HH:MM"
    pub start_time: String,
    /// 終了時刻 "HH:MM"
    pub end_time: String,
    pub duration_hours: u64,
    pub duration_minutes: u64,
    pub total_diamond: u64,
    pub peak_viewers: u64,
    /// 永続ストレージ到達確認フラグ
    pub persisted: bool,
}

impl SessionSummary {
    /// 表示用の経過時間文字列
    pub fn duration_label(&self) -> String {
        clock::format_duration(self.duration_hours, self.duration_minutes)
    }
}

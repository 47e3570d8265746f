//! アイドルバックオフポリシー
//!
//! プロセス全体で1つの段階的再試行間隔を管理する。全アカウントが同時に
//! アイドルのときだけ段階を上げ、どれか1つでも配信が始まれば最小値に
//! 戻す。個別アカウントの「配信していない」エラーだけで間隔が伸びて、
//! 他のアクティブなアカウントの巻き添えになるのを防ぐための条件。

use chrono::NaiveDate;
use parking_lot::Mutex;
use rand::Rng;
use std::time::Duration;

use crate::clock;
use crate::config::RetryConfig;

/// 可変部分（ミューテックスで直列化）
#[derive(Debug)]
struct IdleState {
    /// 現在の基準間隔（秒）
    current_secs: u64,
    /// 全アカウントアイドル観測の連続回数
    streak: u32,
    /// 最後に観測したローカル日付（日またぎリセット用）
    day: NaiveDate,
}

/// 共有アイドルバックオフポリシー
pub struct IdleBackoffPolicy {
    min_secs: u64,
    max_secs: u64,
    step_secs: u64,
    threshold: u32,
    jitter_secs: u64,
    floor_secs: u64,
    state: Mutex<IdleState>,
}

impl IdleBackoffPolicy {
    /// 設定からポリシーを作成
    pub fn new(cfg: &RetryConfig) -> Self {
        Self {
            min_secs: cfg.idle_min_secs,
            max_secs: cfg.idle_max_secs,
            step_secs: cfg.idle_step_secs,
            threshold: cfg.idle_escalation_threshold.max(1),
            jitter_secs: cfg.jitter_secs,
            floor_secs: cfg.floor_secs,
            state: Mutex::new(IdleState {
                current_secs: cfg.idle_min_secs,
                streak: 0,
                day: clock::today(),
            }),
        }
    }

    /// アイドル観測を1回記録する
    ///
    /// `all_idle` は全アカウント同時アイドルのクォーラム判定結果。
    /// クォーラム成立時のみカウントし、しきい値ごとに間隔を1段上げる
    /// （上限で頭打ち）。日付が変わっていたら先にリセットする。
    pub fn observe_idle(&self, all_idle: bool) {
        self.observe_idle_on(all_idle, clock::today());
    }

    fn observe_idle_on(&self, all_idle: bool, today: NaiveDate) {
        let mut state = self.state.lock();
        Self::roll_day(&mut state, today, self.min_secs);

        if !all_idle {
            return;
        }

        state.streak += 1;
        if state.streak % self.threshold == 0 && state.current_secs < self.max_secs {
            state.current_secs = (state.current_secs + self.step_secs).min(self.max_secs);
            tracing::info!(
                "⏳ Idle backoff escalated to {}s (streak: {})",
                state.current_secs,
                state.streak
            );
        }
    }

    /// どこかのアカウントが配信を開始した
    pub fn on_connected(&self) {
        let mut state = self.state.lock();
        state.streak = 0;
        state.current_secs = self.min_secs;
    }

    /// 次のアイドル再試行までの遅延（ジッター込み、下限保証あり）
    pub fn idle_delay(&self) -> Duration {
        let base_secs = {
            let mut state = self.state.lock();
            Self::roll_day(&mut state, clock::today(), self.min_secs);
            state.current_secs
        };
        self.jittered(base_secs)
    }

    /// ポリシーの最小間隔（セッション確定直後の再ポーリングに使う）
    pub fn minimum_delay(&self) -> Duration {
        Duration::from_secs(self.min_secs)
    }

    /// 現在の基準間隔
    pub fn current_interval(&self) -> Duration {
        Duration::from_secs(self.state.lock().current_secs)
    }

    /// 日付が変わっていたらエスカレーション状態をリセット
    fn roll_day(state: &mut IdleState, today: NaiveDate, min_secs: u64) {
        if state.day != today {
            state.day = today;
            state.streak = 0;
            state.current_secs = min_secs;
        }
    }

    /// 基準値に±ジッターを加え、ハード下限でフロアする
    fn jittered(&self, base_secs: u64) -> Duration {
        let base_ms = (base_secs * 1000) as i64;
        let jitter_ms = (self.jitter_secs * 1000) as i64;
        let offset = if jitter_ms > 0 {
            rand::thread_rng().gen_range(-jitter_ms..=jitter_ms)
        } else {
            0
        };
        let floor_ms = (self.floor_secs * 1000) as i64;
        Duration::from_millis((base_ms + offset).max(floor_ms) as u64)
    }
}

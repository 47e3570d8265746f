//! クラッシュ耐性キャッシュ
//!
//! 全アカウントの進行中セッション状態をプロセス横断でミラーし、状態が
//! 変わるたびに1つのJSONスナップショットへ書き出す。起動時に読み戻す
//! ことで、中断されたセッションをゼロからではなく続きから追跡できる。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::session::{AccountSession, SessionStatus};

/// スナップショットのシリアライズ形
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheState {
    accounts: HashMap<String, AccountSession>,
}

/// プロセス全体で共有する永続化キャッシュ
///
/// 書き込みはミューテックスで直列化される（同時書き込みによる
/// 部分的なスナップショット破損を防ぐ）。
pub struct PersistenceCache {
    path: Option<PathBuf>,
    state: Mutex<CacheState>,
}

impl PersistenceCache {
    /// ファイルからキャッシュを読み込む
    ///
    /// ファイルが無い・壊れている場合は空の状態で開始する（致命エラーに
    /// しない）。
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<CacheState>(&contents) {
                Ok(state) => {
                    info!(
                        "💾 Cache loaded: {} account(s) from {}",
                        state.accounts.len(),
                        path.display()
                    );
                    state
                }
                Err(e) => {
                    warn!("キャッシュ破損のため空で開始します: {}", e);
                    CacheState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache file not found, starting empty: {}", path.display());
                CacheState::default()
            }
            Err(e) => {
                warn!("キャッシュ読み込み失敗のため空で開始します: {}", e);
                CacheState::default()
            }
        };

        Self {
            path: Some(path),
            state: Mutex::new(state),
        }
    }

    /// ファイルを持たないキャッシュ（テスト用）
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// アカウントのスナップショットを更新して書き出す
    pub fn store(&self, session: &AccountSession) {
        let mut state = self.state.lock();
        state
            .accounts
            .insert(session.account.clone(), session.clone());
        self.write_locked(&state);
    }

    /// アカウントのエントリを取り除いて書き出す（確定完了後）
    pub fn remove(&self, account: &str) {
        let mut state = self.state.lock();
        state.accounts.remove(account);
        self.write_locked(&state);
    }

    /// アカウントのスナップショットを取得
    pub fn get(&self, account: &str) -> Option<AccountSession> {
        self.state.lock().accounts.get(account).cloned()
    }

    /// 全アカウントのスナップショット（シャットダウンフラッシュ用）
    pub fn snapshot(&self) -> Vec<AccountSession> {
        let mut sessions: Vec<AccountSession> =
            self.state.lock().accounts.values().cloned().collect();
        sessions.sort_by(|a, b| a.account.cmp(&b.account));
        sessions
    }

    /// 全アカウントが同時にアイドルか（バックオフのクォーラム条件）
    pub fn all_idle(&self) -> bool {
        self.state
            .lock()
            .accounts
            .values()
            .all(|s| s.status == SessionStatus::Idle && !s.last_live)
    }

    /// 現在の状態を強制的に書き出す（シャットダウン時の最終書き込み）
    pub fn write(&self) {
        let state = self.state.lock();
        self.write_locked(&state);
    }

    /// ロック保持中の書き込み本体
    ///
    /// 書き込み失敗はログのみ。永続化失敗でステートマシンを止めない。
    fn write_locked(&self, state: &CacheState) {
        let Some(path) = &self.path else {
            return;
        };

        let json = match serde_json::to_string_pretty(state) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize cache: {}", e);
                return;
            }
        };

        if let Err(e) = fs::write(path, json) {
            warn!("Failed to save cache to {}: {}", path.display(), e);
        }
    }
}

//! 監査ログシステム
//!
//! 追記専用・容量制限付きのリングバッファ。各エントリは直前エントリのハッシュを含み、
//! 保持ウィンドウ内の改ざんを検出できる。

use crate::sinks::EventSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// チェーン先頭の直前ハッシュ
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// 監査イベント種別
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// プラグイン登録・再登録
    PluginRegistered,
    /// プラグイン登録解除
    PluginDeregistered,
    /// マニフェスト拒否
    ManifestRejected,
    /// 宣言を超える権限要求
    PermissionDenied,
    /// レート制限発動
    RateLimitTripped,
    /// グラント発行
    GrantIssued,
    /// グラント取り消し
    GrantRevoked,
    /// 期限切れグラントの回収
    GrantExpired,
    /// 共有へのダウングレード
    GrantDowngraded,
    /// 競合解決の判断（コンセンサス入出力を含む）
    ConflictDecision,
    /// 戦略失敗による priority へのフォールバック
    ResolverFallback,
    /// ヘルス閾値バケットの遷移
    HealthTransition,
    /// ヘルス劣化による一括取り消しの要約
    HealthRevocation,
    /// デバイス登録
    DeviceRegistered,
    /// 名前空間衝突
    NamespaceConflict,
    /// コマンド制約違反
    ConstraintViolation,
    /// コマンド転送
    CommandRouted,
    /// 要求の拒否（権限・レート・競合以外）
    RequestRejected,
    /// コマンドの拒否（不明なグラントなど）
    CommandRejected,
    /// アービタ停止
    Shutdown,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditEventKind::PluginRegistered => "plugin_registered",
            AuditEventKind::PluginDeregistered => "plugin_deregistered",
            AuditEventKind::ManifestRejected => "manifest_rejected",
            AuditEventKind::PermissionDenied => "permission_denied",
            AuditEventKind::RateLimitTripped => "rate_limit_tripped",
            AuditEventKind::GrantIssued => "grant_issued",
            AuditEventKind::GrantRevoked => "grant_revoked",
            AuditEventKind::GrantExpired => "grant_expired",
            AuditEventKind::GrantDowngraded => "grant_downgraded",
            AuditEventKind::ConflictDecision => "conflict_decision",
            AuditEventKind::ResolverFallback => "resolver_fallback",
            AuditEventKind::HealthTransition => "health_transition",
            AuditEventKind::HealthRevocation => "health_revocation",
            AuditEventKind::DeviceRegistered => "device_registered",
            AuditEventKind::NamespaceConflict => "namespace_conflict",
            AuditEventKind::ConstraintViolation => "constraint_violation",
            AuditEventKind::CommandRouted => "command_routed",
            AuditEventKind::RequestRejected => "request_rejected",
            AuditEventKind::CommandRejected => "command_rejected",
            AuditEventKind::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// 監査ログエントリ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// 単調増加の通し番号
    pub sequence: u64,
    /// タイムスタンプ（UTC）
    pub timestamp: DateTime<Utc>,
    /// イベント種別
    pub kind: AuditEventKind,
    /// 所有ゾーン
    pub zone: Option<String>,
    /// 関係するプラグイン
    pub plugin_id: Option<String>,
    /// 構造化ペイロード
    pub payload: serde_json::Value,
    /// 直前エントリのハッシュ
    pub prev_hash: String,
    /// このエントリのハッシュ
    pub hash: String,
}

/// ハッシュ対象部分
#[derive(Serialize)]
struct HashedBody<'a> {
    sequence: u64,
    timestamp: &'a DateTime<Utc>,
    kind: AuditEventKind,
    zone: &'a Option<String>,
    plugin_id: &'a Option<String>,
    payload: &'a serde_json::Value,
}

impl AuditEntry {
    fn compute_hash(&self) -> String {
        let body = HashedBody {
            sequence: self.sequence,
            timestamp: &self.timestamp,
            kind: self.kind,
            zone: &self.zone,
            plugin_id: &self.plugin_id,
            payload: &self.payload,
        };
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(serde_json::to_vec(&body).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }
}

/// 記録前のイベント
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub kind: AuditEventKind,
    pub zone: Option<String>,
    pub plugin_id: Option<String>,
    pub payload: serde_json::Value,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            zone: None,
            plugin_id: None,
            payload,
        }
    }

    pub fn zone(mut self, zone: Option<impl Into<String>>) -> Self {
        self.zone = zone.map(Into::into);
        self
    }

    pub fn plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }
}

/// 監査ログ検索条件
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// イベント種別（None ならすべて）
    pub kinds: Option<HashSet<AuditEventKind>>,
    /// この時刻以降
    pub since: Option<DateTime<Utc>>,
    /// この時刻以前
    pub until: Option<DateTime<Utc>>,
    /// プラグインID
    pub plugin_id: Option<String>,
}

impl AuditQuery {
    pub fn kinds(kinds: impl IntoIterator<Item = AuditEventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&entry.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        if let Some(ref plugin_id) = self.plugin_id {
            if entry.plugin_id.as_ref() != Some(plugin_id) {
                return false;
            }
        }
        true
    }
}

/// ハッシュチェーンの破損
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("audit chain broken at sequence {sequence}")]
pub struct ChainBreak {
    pub sequence: u64,
}

/// 監査ログ統計情報
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStatistics {
    /// 記録された総数（破棄分を含む）
    pub total_recorded: u64,
    /// 容量超過で破棄された数
    pub evicted: u64,
    /// 保持中の種別ごとの数
    pub retained_by_kind: HashMap<AuditEventKind, u64>,
}

#[derive(Debug)]
struct AuditState {
    entries: VecDeque<AuditEntry>,
    last_hash: String,
    next_sequence: u64,
    evicted: u64,
}

/// 監査ログ
pub struct AuditLog {
    capacity: usize,
    state: RwLock<AuditState>,
    sink: Option<Arc<dyn EventSink>>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("capacity", &self.capacity)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: RwLock::new(AuditState {
                entries: VecDeque::with_capacity(capacity.clamp(1, 1024)),
                last_hash: GENESIS_HASH.to_string(),
                next_sequence: 0,
                evicted: 0,
            }),
            sink: None,
        }
    }

    /// テレメトリ出力先を設定
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// イベントを記録
    pub async fn record(&self, event: AuditEvent) -> AuditEntry {
        let entry = {
            let mut state = self.state.write().await;
            let mut entry = AuditEntry {
                sequence: state.next_sequence,
                timestamp: Utc::now(),
                kind: event.kind,
                zone: event.zone,
                plugin_id: event.plugin_id,
                payload: event.payload,
                prev_hash: state.last_hash.clone(),
                hash: String::new(),
            };
            entry.hash = entry.compute_hash();

            state.next_sequence += 1;
            state.last_hash = entry.hash.clone();
            state.entries.push_back(entry.clone());

            // 古いエントリから破棄
            while state.entries.len() > self.capacity {
                state.entries.pop_front();
                state.evicted += 1;
            }
            entry
        };

        if let Some(ref sink) = self.sink {
            sink.emit(&entry).await;
        }
        entry
    }

    /// 条件に一致するエントリを古い順に返す
    pub async fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn statistics(&self) -> AuditStatistics {
        let state = self.state.read().await;
        let mut retained_by_kind = HashMap::new();
        for entry in &state.entries {
            *retained_by_kind.entry(entry.kind).or_insert(0) += 1;
        }
        AuditStatistics {
            total_recorded: state.next_sequence,
            evicted: state.evicted,
            retained_by_kind,
        }
    }

    /// 保持ウィンドウ内のハッシュチェーンを検証
    pub async fn verify_chain(&self) -> Result<(), ChainBreak> {
        let state = self.state.read().await;
        let mut expected_prev: Option<&str> = None;
        for entry in &state.entries {
            if let Some(prev) = expected_prev {
                if entry.prev_hash != prev {
                    return Err(ChainBreak {
                        sequence: entry.sequence,
                    });
                }
            }
            if entry.compute_hash() != entry.hash {
                return Err(ChainBreak {
                    sequence: entry.sequence,
                });
            }
            expected_prev = Some(&entry.hash);
        }
        Ok(())
    }
}

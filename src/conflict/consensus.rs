//! Consensus Resolver
//!
//! 参加プラグインの投票を固定長の複素信号に変換し、重み付き合成スペクトルから
//! 支配周波数とコヒーレンスを取り出して判断を下す。同じ入力からは常に同じ結果が得られる。
//!
//! 信号モデル:
//! - 基本ビン = 権限レベルのランク（1..7）
//! - 2倍・3倍の高調波、振幅 `(priority / 255) / h`
//! - 投票が正なら `+bin`、負なら `N - bin`。`|vote|` が振幅を拡大縮小する

use std::collections::HashMap;
use std::f64::consts::PI;
use std::ops::{Add, Mul};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::Decision;
use crate::config::ConsensusConfig;
use crate::permission::PermissionLevel;

/// 高調波の次数
const HARMONICS: [usize; 2] = [2, 3];

/// 支配ビン比較の許容誤差
const MAGNITUDE_EPSILON: f64 = 1e-12;

/// Minimal complex number for the spectrum computation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Complex {
    re: f64,
    im: f64,
}

impl Complex {
    fn from_polar(magnitude: f64, phase: f64) -> Self {
        Self {
            re: magnitude * phase.cos(),
            im: magnitude * phase.sin(),
        }
    }

    fn norm_sqr(self) -> f64 {
        self.re * self.re + self.im * self.im
    }

    fn scale(self, factor: f64) -> Self {
        Self {
            re: self.re * factor,
            im: self.im * factor,
        }
    }
}

impl Add for Complex {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            re: self.re + rhs.re,
            im: self.im + rhs.im,
        }
    }
}

impl Mul for Complex {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self {
            re: self.re * rhs.re - self.im * rhs.im,
            im: self.re * rhs.im + self.im * rhs.re,
        }
    }
}

/// 参加者の役割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteRole {
    Requester,
    Holder,
    Bystander,
}

/// 1人の参加者の投票
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteInput {
    pub plugin_id: String,
    pub role: VoteRole,
    pub level: PermissionLevel,
    pub priority: u8,
    /// [-1, 1]。正は要求側、負は保持側を支持
    pub vote: f64,
    /// [0, 1]
    pub confidence: f64,
}

/// コンセンサスの結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub decision: Decision,
    /// 支配ビン周辺へのエネルギー集中度 [0, 1]
    pub coherence: f64,
    /// 支配周波数から写像した値 [-1, 1]
    pub consensus_value: f64,
    pub participants: usize,
    pub dominant_index: usize,
    /// 結果に反対した、または信頼度の低い参加者
    pub dissenters: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub cache_key: String,
}

/// 判断不能時は `Fallback` を返し、呼び出し側が別戦略に切り替える
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusOutcome {
    Decided(ConsensusResult),
    Fallback(String),
}

/// キャッシュキー（要求側, 保持側, リソース）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsensusKey {
    pub requester: String,
    pub holder: String,
    pub resource: String,
}

impl ConsensusKey {
    pub fn new(
        requester: impl Into<String>,
        holder: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            requester: requester.into(),
            holder: holder.into(),
            resource: resource.into(),
        }
    }

    fn as_string(&self) -> String {
        format!("{}|{}|{}", self.requester, self.holder, self.resource)
    }
}

#[derive(Debug, Clone)]
struct CachedResult {
    result: ConsensusResult,
    stored_at: Instant,
}

/// 周波数領域コンセンサスリゾルバ
#[derive(Debug)]
pub struct ConsensusResolver {
    config: ConsensusConfig,
    ttl: Duration,
    cache: RwLock<HashMap<ConsensusKey, CachedResult>>,
}

impl ConsensusResolver {
    pub fn new(config: ConsensusConfig) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_secs);
        Self {
            config,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// 傍観プラグインの投票: 要求側より高いレベルなら +1、低ければ -1
    pub fn bystander_vote(bystander: PermissionLevel, requester: PermissionLevel) -> f64 {
        match bystander.cmp(&requester) {
            std::cmp::Ordering::Greater => 1.0,
            std::cmp::Ordering::Less => -1.0,
            std::cmp::Ordering::Equal => 0.0,
        }
    }

    /// キャッシュを使って解決する。2番目の値はキャッシュヒットかどうか
    pub async fn resolve_cached(
        &self,
        key: ConsensusKey,
        inputs: &[VoteInput],
    ) -> (ConsensusOutcome, bool) {
        self.resolve_cached_at(key, inputs, Instant::now()).await
    }

    pub async fn resolve_cached_at(
        &self,
        key: ConsensusKey,
        inputs: &[VoteInput],
        now: Instant,
    ) -> (ConsensusOutcome, bool) {
        if let Some(cached) = self.cache.read().await.get(&key) {
            if now.saturating_duration_since(cached.stored_at) < self.ttl {
                debug!(cache_key = %key.as_string(), "Consensus cache hit");
                return (ConsensusOutcome::Decided(cached.result.clone()), true);
            }
        }

        let outcome = self.resolve(&key.as_string(), inputs);
        if let ConsensusOutcome::Decided(ref result) = outcome {
            self.cache.write().await.insert(
                key,
                CachedResult {
                    result: result.clone(),
                    stored_at: now,
                },
            );
        }
        (outcome, false)
    }

    /// 期限切れのキャッシュを削除し、削除数を返す
    pub async fn prune_expired(&self, now: Instant) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl = self.ttl;
        cache.retain(|_, cached| now.saturating_duration_since(cached.stored_at) < ttl);
        before - cache.len()
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// キャッシュを使わずに解決する
    pub fn resolve(&self, cache_key: &str, inputs: &[VoteInput]) -> ConsensusOutcome {
        let n = self.config.signal_length;

        if inputs
            .iter()
            .any(|input| !input.vote.is_finite() || !input.confidence.is_finite())
        {
            return ConsensusOutcome::Fallback("non-finite vote or confidence".to_string());
        }

        // 重み付き合成信号
        let mut combined = vec![Complex::default(); n];
        let mut total_weight = 0.0;
        for input in inputs {
            let weight = self.role_weight(input.role) * input.confidence.clamp(0.0, 1.0);
            if weight <= 0.0 {
                continue;
            }
            total_weight += weight;
            for (sample, value) in combined.iter_mut().zip(self.signal(input)) {
                *sample = *sample + value.scale(weight);
            }
        }
        if total_weight <= 0.0 {
            return ConsensusOutcome::Fallback("total vote weight is zero".to_string());
        }
        for sample in combined.iter_mut() {
            *sample = sample.scale(1.0 / total_weight);
        }

        let spectrum = dft(&combined);
        let energy: Vec<f64> = spectrum.iter().map(|bin| bin.norm_sqr()).collect();
        let total_energy: f64 = energy.iter().sum();
        if total_energy <= MAGNITUDE_EPSILON {
            return ConsensusOutcome::Fallback("combined spectrum is empty".to_string());
        }

        // 最大振幅のビン（同値なら小さいインデックス）
        let mut dominant_index = 0;
        for (index, value) in energy.iter().enumerate() {
            if *value > energy[dominant_index] + MAGNITUDE_EPSILON {
                dominant_index = index;
            }
        }

        let window = self.config.coherence_window.min(n / 2);
        let mut window_energy = 0.0;
        for offset in 0..=(2 * window) {
            let bin = (dominant_index + n + offset - window) % n;
            window_energy += energy[bin];
        }
        let coherence = (window_energy / total_energy).clamp(0.0, 1.0);

        let signed_index = if dominant_index <= n / 2 {
            dominant_index as f64
        } else {
            dominant_index as f64 - n as f64
        };
        let consensus_value = (signed_index / f64::from(PermissionLevel::MAX_RANK)).clamp(-1.0, 1.0);

        let decision = self.decide(coherence, consensus_value);
        let dissenters = inputs
            .iter()
            .filter(|input| {
                input.vote * consensus_value < 0.0 || input.confidence < self.config.min_confidence
            })
            .map(|input| input.plugin_id.clone())
            .collect();

        debug!(
            cache_key,
            coherence,
            consensus_value,
            dominant_index,
            decision = %decision,
            "Consensus computed"
        );

        ConsensusOutcome::Decided(ConsensusResult {
            decision,
            coherence,
            consensus_value,
            participants: inputs.len(),
            dominant_index,
            dissenters,
            timestamp: Utc::now(),
            cache_key: cache_key.to_string(),
        })
    }

    /// コヒーレンスとコンセンサス値から判断を決める
    pub fn decide(&self, coherence: f64, consensus_value: f64) -> Decision {
        if coherence < self.config.coherence_threshold {
            Decision::NoConsensus
        } else if consensus_value > self.config.grant_threshold {
            Decision::Grant
        } else if consensus_value > self.config.share_threshold {
            Decision::Share
        } else {
            Decision::Deny
        }
    }

    fn role_weight(&self, role: VoteRole) -> f64 {
        match role {
            VoteRole::Requester => self.config.requester_weight,
            VoteRole::Holder => self.config.holder_weight,
            VoteRole::Bystander => self.config.bystander_weight,
        }
    }

    /// 参加者の時間領域信号
    fn signal(&self, input: &VoteInput) -> Vec<Complex> {
        let n = self.config.signal_length;
        let vote = input.vote.clamp(-1.0, 1.0);
        let base = input.level.rank() as usize;
        let priority = f64::from(input.priority) / 255.0;

        let mut components = vec![(base, vote.abs())];
        for h in HARMONICS {
            components.push((base * h, vote.abs() * priority / h as f64));
        }

        let mut signal = vec![Complex::default(); n];
        if vote == 0.0 {
            return signal;
        }
        if n == 0 {
            warn!("Consensus signal length is zero");
            return signal;
        }
        for (bin, amplitude) in components {
            let bin = if vote > 0.0 { bin % n } else { (n - bin % n) % n };
            for (t, sample) in signal.iter_mut().enumerate() {
                let phase = 2.0 * PI * (bin * t) as f64 / n as f64;
                *sample = *sample + Complex::from_polar(amplitude, phase);
            }
        }
        signal
    }
}

/// N で正規化した離散フーリエ変換
fn dft(signal: &[Complex]) -> Vec<Complex> {
    let n = signal.len();
    (0..n)
        .map(|k| {
            let sum = signal
                .iter()
                .enumerate()
                .fold(Complex::default(), |acc, (t, sample)| {
                    let phase = -2.0 * PI * ((k * t) % n) as f64 / n as f64;
                    acc + *sample * Complex::from_polar(1.0, phase)
                });
            sum.scale(1.0 / n as f64)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(
        plugin_id: &str,
        role: VoteRole,
        level: PermissionLevel,
        priority: u8,
        vote: f64,
        confidence: f64,
    ) -> VoteInput {
        VoteInput {
            plugin_id: plugin_id.to_string(),
            role,
            level,
            priority,
            vote,
            confidence,
        }
    }

    fn resolver() -> ConsensusResolver {
        ConsensusResolver::new(ConsensusConfig::default())
    }

    fn decided(outcome: ConsensusOutcome) -> ConsensusResult {
        match outcome {
            ConsensusOutcome::Decided(result) => result,
            ConsensusOutcome::Fallback(reason) => panic!("unexpected fallback: {}", reason),
        }
    }

    #[test]
    fn test_dft_recovers_single_tone() {
        let n = 64;
        let signal: Vec<Complex> = (0..n)
            .map(|t| Complex::from_polar(0.5, 2.0 * PI * (5 * t) as f64 / n as f64))
            .collect();
        let spectrum = dft(&signal);
        assert!((spectrum[5].norm_sqr().sqrt() - 0.5).abs() < 1e-9);
        assert!(spectrum[6].norm_sqr() < 1e-18);
    }

    #[test]
    fn test_dominant_requester_yields_grant() {
        let inputs = vec![
            vote("b", VoteRole::Requester, PermissionLevel::Actuate, 200, 1.0, 0.95),
            vote("a", VoteRole::Holder, PermissionLevel::Control, 50, -0.2, 0.5),
        ];
        let result = decided(resolver().resolve("k", &inputs));

        assert_eq!(result.dominant_index, PermissionLevel::Actuate.rank() as usize);
        assert!((result.consensus_value - 4.0 / 7.0).abs() < 1e-9);
        assert!(result.coherence > 0.6, "coherence {}", result.coherence);
        assert_eq!(result.decision, Decision::Grant);
        assert_eq!(result.participants, 2);
        assert!(result.dissenters.contains(&"a".to_string()));
    }

    #[test]
    fn test_dominant_holder_yields_deny() {
        let inputs = vec![
            vote("b", VoteRole::Requester, PermissionLevel::Write, 10, 0.1, 0.6),
            vote("a", VoteRole::Holder, PermissionLevel::Control, 0, -1.0, 1.0),
        ];
        let result = decided(resolver().resolve("k", &inputs));
        assert_eq!(result.dominant_index, 64 - 5);
        assert!(result.consensus_value < 0.0);
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.dissenters, vec!["b".to_string()]);
    }

    #[test]
    fn test_evenly_split_vote_has_no_consensus() {
        let inputs = vec![
            vote("b", VoteRole::Requester, PermissionLevel::Actuate, 0, 1.0, 0.9),
            vote("a", VoteRole::Holder, PermissionLevel::Control, 0, -1.0, 0.9),
        ];
        let result = decided(resolver().resolve("k", &inputs));
        // エネルギーが2つのビンに等分される
        assert!((result.coherence - 0.5).abs() < 1e-9);
        assert_eq!(result.decision, Decision::NoConsensus);
        // 同値のビンは小さいインデックスが勝つ
        assert_eq!(result.dominant_index, 4);
    }

    #[test]
    fn test_low_share_value_maps_to_share() {
        let resolver = resolver();
        assert_eq!(resolver.decide(0.9, 0.2), Decision::Share);
        assert_eq!(resolver.decide(0.9, 0.31), Decision::Grant);
        assert_eq!(resolver.decide(0.9, 0.0), Decision::Deny);
        assert_eq!(resolver.decide(0.59, 1.0), Decision::NoConsensus);
    }

    #[test]
    fn test_zero_weight_falls_back() {
        let inputs = vec![vote(
            "b",
            VoteRole::Requester,
            PermissionLevel::Read,
            0,
            1.0,
            0.0,
        )];
        assert!(matches!(
            resolver().resolve("k", &inputs),
            ConsensusOutcome::Fallback(_)
        ));

        let silent = vec![vote("b", VoteRole::Requester, PermissionLevel::Read, 0, 0.0, 1.0)];
        assert!(matches!(
            resolver().resolve("k", &silent),
            ConsensusOutcome::Fallback(_)
        ));

        let nan = vec![vote("b", VoteRole::Requester, PermissionLevel::Read, 0, f64::NAN, 1.0)];
        assert!(matches!(
            resolver().resolve("k", &nan),
            ConsensusOutcome::Fallback(_)
        ));
    }

    #[test]
    fn test_bystander_vote_sign() {
        use PermissionLevel::*;
        assert_eq!(ConsensusResolver::bystander_vote(Control, Read), 1.0);
        assert_eq!(ConsensusResolver::bystander_vote(Monitor, Read), -1.0);
        assert_eq!(ConsensusResolver::bystander_vote(Read, Read), 0.0);
    }

    #[tokio::test]
    async fn test_cache_hit_and_expiry() {
        let resolver = resolver();
        let key = ConsensusKey::new("b", "a", "zone1:valve1:valve");
        let inputs = vec![
            vote("b", VoteRole::Requester, PermissionLevel::Actuate, 200, 1.0, 0.95),
            vote("a", VoteRole::Holder, PermissionLevel::Control, 50, -0.2, 0.5),
        ];
        let start = Instant::now();

        let (first, hit) = resolver.resolve_cached_at(key.clone(), &inputs, start).await;
        assert!(!hit);
        let (second, hit) = resolver
            .resolve_cached_at(key.clone(), &inputs, start + Duration::from_secs(10))
            .await;
        assert!(hit);
        assert_eq!(first, second);

        let later = start + Duration::from_secs(301);
        assert_eq!(resolver.prune_expired(later).await, 1);
        let (_, hit) = resolver.resolve_cached_at(key, &inputs, later).await;
        assert!(!hit);
    }
}

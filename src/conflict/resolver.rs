//! Strategy dispatch for resource conflicts.

use std::cmp::Reverse;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::consensus::{ConsensusKey, ConsensusOutcome, ConsensusResolver, VoteInput, VoteRole};
use super::{ConflictContext, ConflictStrategy, ConsensusResult, Contender, Decision, Resolution};
use crate::config::ConsensusConfig;
use crate::error::{Error, Result};
use crate::permission::PermissionLevel;

/// 戦略の出力（`decision` が None なら priority に委譲）
struct Verdict {
    decision: Option<Decision>,
    inputs: Vec<VoteInput>,
    consensus: Option<ConsensusResult>,
    cache_hit: bool,
}

impl Verdict {
    fn decided(decision: Decision) -> Self {
        Self {
            decision: Some(decision),
            inputs: Vec::new(),
            consensus: None,
            cache_hit: false,
        }
    }

    fn defer() -> Self {
        Self {
            decision: None,
            inputs: Vec::new(),
            consensus: None,
            cache_hit: false,
        }
    }
}

/// 競合リゾルバ
#[derive(Debug)]
pub struct ConflictResolver {
    strategy: RwLock<ConflictStrategy>,
    consensus: ConsensusResolver,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy, consensus: ConsensusConfig) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            consensus: ConsensusResolver::new(consensus),
        }
    }

    pub async fn strategy(&self) -> ConflictStrategy {
        *self.strategy.read().await
    }

    pub async fn set_strategy(&self, strategy: ConflictStrategy) {
        let mut current = self.strategy.write().await;
        let previous = *current;
        if previous != strategy {
            info!(from = %previous, to = %strategy, "Conflict strategy changed");
            *current = strategy;
        }
    }

    pub fn consensus(&self) -> &ConsensusResolver {
        &self.consensus
    }

    /// 競合を解決する
    ///
    /// # 引数
    /// * `context` - 要求側・保持側・リソースの状態
    /// * `strategy_override` - 保持側のロック規律が指定する戦略（None なら設定値）
    pub async fn resolve(
        &self,
        context: &ConflictContext,
        strategy_override: Option<ConflictStrategy>,
    ) -> Resolution {
        let requested = match strategy_override {
            Some(strategy) => strategy,
            None => self.strategy().await,
        };

        let (verdict, fallback) = match self.apply(requested, context).await {
            Ok(verdict) => (verdict, None),
            Err(e) => {
                warn!(
                    resource = %context.resource,
                    strategy = %requested,
                    error = %e,
                    "Conflict strategy failed, falling back to priority"
                );
                (Verdict::defer(), Some(e.to_string()))
            }
        };

        let deferred = verdict.decision.is_none() && fallback.is_none();
        let (decision, strategy) = match verdict.decision {
            Some(decision) => (decision, requested),
            None => (Self::priority(context), ConflictStrategy::Priority),
        };

        debug!(
            resource = %context.resource,
            requester = %context.requester.plugin_id,
            holder = %context.holder.plugin_id,
            decision = %decision,
            strategy = %strategy,
            deferred,
            "Conflict resolved"
        );

        Resolution {
            decision,
            strategy,
            requested_strategy: requested,
            deferred,
            fallback,
            consensus_inputs: verdict.inputs,
            consensus: verdict.consensus,
            cache_hit: verdict.cache_hit,
        }
    }

    async fn apply(&self, strategy: ConflictStrategy, context: &ConflictContext) -> Result<Verdict> {
        match strategy {
            ConflictStrategy::Priority => Ok(Verdict::decided(Self::priority(context))),
            ConflictStrategy::Temporal => Ok(Verdict::decided(Self::temporal(context))),
            ConflictStrategy::HealthBased => Ok(Self::health_based(context)),
            ConflictStrategy::ZoneLocal => Ok(Self::zone_local(context)),
            ConflictStrategy::Consensus => self.consensus_verdict(context).await,
        }
    }

    /// (権限レベル, 優先度, 早い要求時刻) の辞書順。同値なら保持側
    fn priority(context: &ConflictContext) -> Decision {
        let rank = |c: &Contender| (c.level, c.priority, Reverse(c.requested_at));
        if rank(&context.requester) > rank(&context.holder) {
            Decision::Grant
        } else {
            Decision::Deny
        }
    }

    fn temporal(context: &ConflictContext) -> Decision {
        if context.requester.level > context.holder.level {
            Decision::Grant
        } else {
            Decision::Deny
        }
    }

    fn health_based(context: &ConflictContext) -> Verdict {
        if !context.health.is_impaired() {
            return Verdict::defer();
        }
        if context.requester.level <= PermissionLevel::Read {
            Verdict::decided(Decision::Grant)
        } else {
            Verdict::decided(Decision::Deny)
        }
    }

    fn zone_local(context: &ConflictContext) -> Verdict {
        let cross_zone = context
            .requester
            .zone
            .as_deref()
            .is_some_and(|zone| zone != context.resource_zone);
        let federated = context.requester.can_federate && context.holder.can_federate;
        if cross_zone && !federated {
            Verdict::decided(Decision::Deny)
        } else {
            Verdict::defer()
        }
    }

    async fn consensus_verdict(&self, context: &ConflictContext) -> Result<Verdict> {
        let config = self.consensus.config();
        let mut inputs = vec![
            VoteInput {
                plugin_id: context.requester.plugin_id.clone(),
                role: VoteRole::Requester,
                level: context.requester.level,
                priority: context.requester.priority,
                vote: context.requester.vote.abs(),
                confidence: context.requester.confidence,
            },
            VoteInput {
                plugin_id: context.holder.plugin_id.clone(),
                role: VoteRole::Holder,
                level: context.holder.level,
                priority: context.holder.priority,
                vote: -context.holder.vote.abs(),
                confidence: context.holder.confidence,
            },
        ];
        inputs.extend(
            context
                .bystanders
                .iter()
                .take(config.max_bystanders)
                .map(|bystander| VoteInput {
                    plugin_id: bystander.plugin_id.clone(),
                    role: VoteRole::Bystander,
                    level: bystander.level,
                    priority: bystander.priority,
                    vote: ConsensusResolver::bystander_vote(bystander.level, context.requester.level),
                    confidence: bystander.confidence,
                }),
        );

        let key = ConsensusKey::new(
            context.requester.plugin_id.clone(),
            context.holder.plugin_id.clone(),
            context.resource.to_string(),
        );
        let (outcome, cache_hit) = self.consensus.resolve_cached(key, &inputs).await;
        match outcome {
            ConsensusOutcome::Fallback(reason) => Err(Error::NoDecision(reason)),
            ConsensusOutcome::Decided(result) => {
                let decision = match result.decision {
                    Decision::NoConsensus if config.defer_to_priority => None,
                    decision => Some(decision),
                };
                Ok(Verdict {
                    decision,
                    inputs,
                    consensus: Some(result),
                    cache_hit,
                })
            }
        }
    }
}

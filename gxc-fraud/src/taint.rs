use crate::registry::AddressRegistry;
use crate::TaintChainView;
use gxc_core::{now_ts, Address, Block, Hash32, Transaction, TransactionKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Propagation cutoff delta: branches below this taint are not explored and
/// scores below it are not reported.
pub const TAINT_THRESHOLD: f64 = 0.1;
pub const HIGH_TAINT: f64 = 0.5;
pub const CRITICAL_TAINT: f64 = 0.8;
/// Rule 1: parent-to-child spend faster than this is anomalous.
pub const VELOCITY_EPSILON: u64 = 300;
/// Rule 2: more distinct output addresses than this is smurfing.
pub const FAN_OUT_K: usize = 5;
/// Rule 3: tainted share of input value that flags re-aggregation.
pub const RE_AGG_THETA: f64 = 0.7;
/// Rule 4: dormant period before activation, seven days.
pub const DORMANCY_PERIOD: u64 = 604_800;
/// BFS hop bound.
pub const MAX_HOPS: u32 = 10;

const MAX_FLOW_PATHS: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaintInfo {
    /// tau in [0, 1].
    pub score: f64,
    /// Seed transaction this taint descends from.
    pub source_tx: Hash32,
    pub first_observed_at: u64,
    /// Transaction path from the source.
    pub ancestry: Vec<Hash32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertRule {
    VelocityAnomaly,
    FanOutPattern,
    ReAggregation,
    DormancyActivation,
    CleanZoneEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAlert {
    pub transaction_hash: Hash32,
    pub address: Address,
    pub level: AlertLevel,
    pub rule: AlertRule,
    pub taint_score: f64,
    pub description: String,
    pub timestamp: u64,
}

/// One tainted flow from a stolen transaction to a holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPath {
    pub transactions: Vec<Hash32>,
    pub addresses: Vec<Address>,
    pub taint_scores: Vec<f64>,
    pub final_taint: f64,
    pub hops: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FraudStats {
    pub stolen_transactions: usize,
    pub tainted_transactions: usize,
    pub total_alerts: usize,
    pub critical_alerts: usize,
    pub high_alerts: usize,
    pub medium_alerts: usize,
    pub low_alerts: usize,
    pub flagged_addresses: usize,
}

/// Persistable engine state, scores below the threshold filtered out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaintSnapshot {
    pub taint: Vec<(Hash32, TaintInfo)>,
    pub stolen: Vec<Hash32>,
    pub flagged: Vec<(Address, String)>,
}

/// Taint propagation over the transaction DAG under conservation of value:
/// `tau(T_j) = sum_i w_i * tau(T_i)` with `w_i` the share of input value
/// contributed by parent `T_i`. Clean-zone addresses absorb taint for
/// alerting but do not re-emit it downstream.
pub struct TaintEngine {
    taint: HashMap<Hash32, TaintInfo>,
    stolen: HashSet<Hash32>,
    flagged: HashMap<Address, String>,
    /// Parent score already pushed through each spend edge. Repeated
    /// propagation credits only the delta, so nothing double-counts and
    /// later score increases still flow.
    credited: HashMap<(Hash32, Hash32), f64>,
    alerts: Vec<FraudAlert>,
    alert_tx: broadcast::Sender<FraudAlert>,
}

impl Default for TaintEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TaintEngine {
    pub fn new() -> Self {
        let (alert_tx, _) = broadcast::channel(256);
        Self {
            taint: HashMap::new(),
            stolen: HashSet::new(),
            flagged: HashMap::new(),
            credited: HashMap::new(),
            alerts: Vec::new(),
            alert_tx,
        }
    }

    /// Alert feed; every emitted alert is published here as well.
    pub fn subscribe(&self) -> broadcast::Receiver<FraudAlert> {
        self.alert_tx.subscribe()
    }

    // ----- seed management -----

    /// Mark a transaction stolen (out-of-band fraud report) and propagate
    /// from it.
    pub fn mark_stolen<V: TaintChainView>(&mut self, hash: Hash32, view: &V, registry: &AddressRegistry) {
        if !self.stolen.insert(hash) {
            return;
        }
        warn!(tx = %hex::encode(&hash[..8]), "transaction marked stolen");
        let observed = view.tx_block_timestamp(&hash).unwrap_or_else(now_ts);
        self.taint.insert(
            hash,
            TaintInfo {
                score: 1.0,
                source_tx: hash,
                first_observed_at: observed,
                ancestry: Vec::new(),
            },
        );
        self.propagate(hash, view, registry);
    }

    pub fn remove_from_stolen(&mut self, hash: &Hash32) -> bool {
        self.stolen.remove(hash)
    }

    pub fn is_stolen(&self, hash: &Hash32) -> bool {
        self.stolen.contains(hash)
    }

    pub fn stolen_transactions(&self) -> impl Iterator<Item = &Hash32> {
        self.stolen.iter()
    }

    // ----- scores -----

    pub fn taint_score(&self, hash: &Hash32) -> f64 {
        self.taint.get(hash).map(|t| t.score).unwrap_or(0.0)
    }

    /// Taint info, present only at or above the reporting threshold.
    pub fn taint_info(&self, hash: &Hash32) -> Option<&TaintInfo> {
        self.taint.get(hash).filter(|t| t.score >= TAINT_THRESHOLD)
    }

    /// Taint a not-yet-committed transaction would inherit from its inputs.
    pub fn prospective_taint(&self, tx: &Transaction) -> f64 {
        if let Some(info) = self.taint.get(&tx.hash) {
            return info.score;
        }
        let total = tx.total_input();
        if total <= 0.0 {
            return 0.0;
        }
        let mut tau = 0.0;
        for input in &tx.inputs {
            let parent = self.taint_score(&input.prev_tx_hash);
            tau += parent * input.amount / total;
        }
        tau.min(1.0)
    }

    /// Consensus gate: block anything critically tainted except the
    /// reversal transactions that clean it up.
    pub fn should_block_transaction(&self, tx: &Transaction) -> bool {
        tx.kind != TransactionKind::Reversal && self.prospective_taint(tx) >= CRITICAL_TAINT
    }

    // ----- propagation -----

    fn edge_weight(parent: &Hash32, tx: &Transaction) -> f64 {
        let total = tx.total_input();
        if total <= 0.0 {
            return 0.0;
        }
        let contributed: f64 = tx
            .inputs
            .iter()
            .filter(|i| i.prev_tx_hash == *parent)
            .map(|i| i.amount)
            .sum();
        contributed / total
    }

    /// BFS from a tainted transaction, crediting each spend edge the delta
    /// of its parent's score.
    pub fn propagate<V: TaintChainView>(&mut self, start: Hash32, view: &V, registry: &AddressRegistry) {
        let mut queue = VecDeque::new();
        queue.push_back((start, 0u32));
        while let Some((current, hops)) = queue.pop_front() {
            if hops >= MAX_HOPS {
                continue;
            }
            let current_score = self.taint_score(&current);
            if current_score < TAINT_THRESHOLD {
                continue;
            }
            let Some(current_info) = self.taint.get(&current).cloned() else {
                continue;
            };
            for spender in view.spenders(&current) {
                let applied = self.credited.get(&(current, spender)).copied().unwrap_or(0.0);
                let delta = current_score - applied;
                if delta <= 0.0 {
                    continue;
                }
                let Some(child) = view.transaction(&spender) else {
                    continue;
                };
                self.credited.insert((current, spender), current_score);
                let contribution = Self::edge_weight(&current, &child) * delta;
                if contribution <= 0.0 {
                    continue;
                }
                let observed = view.tx_block_timestamp(&spender).unwrap_or_else(now_ts);
                let mut ancestry = current_info.ancestry.clone();
                ancestry.push(current);
                let entry = self.taint.entry(spender).or_insert(TaintInfo {
                    score: 0.0,
                    source_tx: current_info.source_tx,
                    first_observed_at: observed,
                    ancestry,
                });
                entry.score = (entry.score + contribution).min(1.0);
                let score = entry.score;
                if score < TAINT_THRESHOLD {
                    continue;
                }
                if self.recipient_clean_zone(&child, registry).is_some() {
                    // Absorbed: recorded and alertable, never re-emitted.
                    continue;
                }
                queue.push_back((spender, hops + 1));
            }
        }
    }

    fn recipient_clean_zone<'a>(&self, tx: &'a Transaction, registry: &AddressRegistry) -> Option<&'a Address> {
        tx.outputs
            .iter()
            .map(|o| &o.address)
            .find(|a| registry.is_registered(a))
    }

    /// Incremental update on block commit: every transaction whose inputs
    /// reference a tainted parent is (re)scored; one pass suffices because
    /// the DAG is acyclic and block order is parent-before-child.
    pub fn on_block_committed<V: TaintChainView>(
        &mut self,
        block: &Block,
        view: &V,
        registry: &AddressRegistry,
    ) -> Vec<FraudAlert> {
        let mut emitted = Vec::new();
        for tx in &block.transactions {
            if tx.is_coinbase() {
                continue;
            }
            let tainted_parents: Vec<&Hash32> = tx
                .inputs
                .iter()
                .map(|i| &i.prev_tx_hash)
                .filter(|p| self.taint_score(p) > 0.0)
                .collect();
            if tainted_parents.is_empty() {
                continue;
            }

            let mut best_parent: Option<(Hash32, f64)> = None;
            let mut tau = 0.0;
            for parent in tx.inputs.iter().map(|i| i.prev_tx_hash).collect::<HashSet<_>>() {
                let parent_score = self.taint_score(&parent);
                let applied = self.credited.get(&(parent, tx.hash)).copied().unwrap_or(0.0);
                let delta = parent_score - applied;
                if delta <= 0.0 {
                    continue;
                }
                // Clean zones absorb: taint does not flow out of them.
                let absorbed = view
                    .transaction(&parent)
                    .map(|p| self.recipient_clean_zone(&p, registry).is_some())
                    .unwrap_or(false);
                if absorbed {
                    continue;
                }
                self.credited.insert((parent, tx.hash), parent_score);
                let contribution = Self::edge_weight(&parent, tx) * delta;
                tau += contribution;
                if best_parent.map(|(_, c)| contribution > c).unwrap_or(true) {
                    best_parent = Some((parent, contribution));
                }
            }
            if tau <= 0.0 && self.taint_score(&tx.hash) <= 0.0 {
                continue;
            }

            if let Some((parent, _)) = best_parent {
                let (source, mut ancestry) = self
                    .taint
                    .get(&parent)
                    .map(|p| (p.source_tx, p.ancestry.clone()))
                    .unwrap_or((parent, Vec::new()));
                ancestry.push(parent);
                let entry = self.taint.entry(tx.hash).or_insert(TaintInfo {
                    score: 0.0,
                    source_tx: source,
                    first_observed_at: block.header.timestamp,
                    ancestry,
                });
                entry.score = (entry.score + tau).min(1.0);
            }

            let score = self.taint_score(&tx.hash);
            if score < TAINT_THRESHOLD {
                continue;
            }
            let alerts = self.evaluate_rules(tx, score, block.header.timestamp, view, registry);
            for alert in alerts {
                emitted.push(alert.clone());
                self.push_alert(alert);
            }
        }
        emitted
    }

    // ----- alert rules -----

    fn evaluate_rules<V: TaintChainView>(
        &self,
        tx: &Transaction,
        score: f64,
        block_timestamp: u64,
        view: &V,
        registry: &AddressRegistry,
    ) -> Vec<FraudAlert> {
        let mut violations = Vec::new();

        // Rule 1: velocity anomaly.
        let newest_parent = tx
            .inputs
            .iter()
            .filter(|i| self.taint_score(&i.prev_tx_hash) > 0.0)
            .filter_map(|i| view.tx_block_timestamp(&i.prev_tx_hash))
            .max();
        if let Some(parent_ts) = newest_parent {
            if block_timestamp.saturating_sub(parent_ts) <= VELOCITY_EPSILON {
                violations.push((
                    AlertRule::VelocityAnomaly,
                    tx.recipient().cloned().unwrap_or_default(),
                    format!("tainted funds moved within {}s of arrival", VELOCITY_EPSILON),
                ));
            }
        }

        // Rule 2: fan-out.
        let distinct: HashSet<&Address> = tx.outputs.iter().map(|o| &o.address).collect();
        if distinct.len() > FAN_OUT_K {
            violations.push((
                AlertRule::FanOutPattern,
                tx.recipient().cloned().unwrap_or_default(),
                format!("tainted value split across {} addresses", distinct.len()),
            ));
        }

        // Rule 3: re-aggregation of divergent tainted paths.
        let total_in = tx.total_input();
        if total_in > 0.0 {
            let tainted_parents: HashSet<Hash32> = tx
                .inputs
                .iter()
                .filter(|i| self.taint_score(&i.prev_tx_hash) > 0.0)
                .map(|i| i.prev_tx_hash)
                .collect();
            let tainted_in: f64 = tx
                .inputs
                .iter()
                .filter(|i| self.taint_score(&i.prev_tx_hash) > 0.0)
                .map(|i| i.amount)
                .sum();
            if tainted_in / total_in >= RE_AGG_THETA && tainted_parents.len() >= 2 {
                violations.push((
                    AlertRule::ReAggregation,
                    tx.recipient().cloned().unwrap_or_default(),
                    format!("{} tainted paths merged", tainted_parents.len()),
                ));
            }
        }

        // Rule 4: dormancy activation.
        let dormant = tx.inputs.iter().any(|i| {
            view.tx_block_timestamp(&i.prev_tx_hash)
                .map(|ts| block_timestamp.saturating_sub(ts) >= DORMANCY_PERIOD)
                .unwrap_or(false)
        });
        if dormant {
            violations.push((
                AlertRule::DormancyActivation,
                tx.recipient().cloned().unwrap_or_default(),
                "dormant tainted funds activated".to_string(),
            ));
        }

        // Rule 5: clean-zone entry.
        if let Some(address) = self.recipient_clean_zone(tx, registry) {
            violations.push((
                AlertRule::CleanZoneEntry,
                address.clone(),
                "tainted funds entered a registered clean zone".to_string(),
            ));
        }

        let level = alert_level(score, violations.len());
        violations
            .into_iter()
            .map(|(rule, address, description)| FraudAlert {
                transaction_hash: tx.hash,
                address,
                level,
                rule,
                taint_score: score,
                description,
                timestamp: block_timestamp,
            })
            .collect()
    }

    fn push_alert(&mut self, alert: FraudAlert) {
        info!(
            tx = %hex::encode(&alert.transaction_hash[..8]),
            rule = ?alert.rule,
            level = ?alert.level,
            score = alert.taint_score,
            "fraud alert"
        );
        let _ = self.alert_tx.send(alert.clone());
        self.alerts.push(alert);
    }

    // ----- flow tracing -----

    /// Enumerate tainted flows from a transaction, depth-first, bounded by
    /// hops and the propagation cutoff. Paths end where exploration stops.
    pub fn trace_tainted_flow<V: TaintChainView>(
        &self,
        start: &Hash32,
        max_hops: u32,
        view: &V,
        registry: &AddressRegistry,
    ) -> Vec<FlowPath> {
        let mut paths = Vec::new();
        let mut stack: Vec<Vec<Hash32>> = vec![vec![*start]];
        while let Some(path) = stack.pop() {
            if paths.len() >= MAX_FLOW_PATHS {
                break;
            }
            let current = *path.last().expect("path never empty");
            let hops = path.len() as u32 - 1;
            let score = self.taint_score(&current);
            let absorbed = view
                .transaction(&current)
                .map(|tx| self.recipient_clean_zone(&tx, registry).is_some())
                .unwrap_or(false);
            let spenders: Vec<Hash32> = if hops >= max_hops || absorbed {
                Vec::new()
            } else {
                view.spenders(&current)
                    .into_iter()
                    .filter(|s| self.taint_score(s) >= TAINT_THRESHOLD && !path.contains(s))
                    .collect()
            };
            if spenders.is_empty() {
                if score > 0.0 {
                    paths.push(self.finish_path(path, view));
                }
                continue;
            }
            for spender in spenders {
                let mut next = path.clone();
                next.push(spender);
                stack.push(next);
            }
        }
        paths
    }

    fn finish_path<V: TaintChainView>(&self, transactions: Vec<Hash32>, view: &V) -> FlowPath {
        let addresses = transactions
            .iter()
            .filter_map(|h| view.transaction(h))
            .filter_map(|tx| tx.recipient().cloned())
            .collect();
        let taint_scores: Vec<f64> = transactions.iter().map(|h| self.taint_score(h)).collect();
        let final_taint = *taint_scores.last().unwrap_or(&0.0);
        let hops = transactions.len() as u32 - 1;
        FlowPath {
            transactions,
            addresses,
            taint_scores,
            final_taint,
            hops,
        }
    }

    // ----- flagging and alerts -----

    pub fn flag_address(&mut self, address: &str, reason: &str) {
        self.flagged.insert(address.to_string(), reason.to_string());
    }

    pub fn unflag_address(&mut self, address: &str) -> bool {
        self.flagged.remove(address).is_some()
    }

    pub fn is_address_flagged(&self, address: &str) -> bool {
        self.flagged.contains_key(address)
    }

    pub fn alerts(&self, min_level: AlertLevel) -> Vec<&FraudAlert> {
        self.alerts.iter().filter(|a| a.level >= min_level).collect()
    }

    pub fn address_alerts(&self, address: &str) -> Vec<&FraudAlert> {
        self.alerts.iter().filter(|a| a.address == address).collect()
    }

    pub fn clear_alerts(&mut self) {
        self.alerts.clear();
    }

    pub fn statistics(&self) -> FraudStats {
        let mut stats = FraudStats {
            stolen_transactions: self.stolen.len(),
            tainted_transactions: self
                .taint
                .values()
                .filter(|t| t.score >= TAINT_THRESHOLD)
                .count(),
            total_alerts: self.alerts.len(),
            flagged_addresses: self.flagged.len(),
            ..Default::default()
        };
        for alert in &self.alerts {
            match alert.level {
                AlertLevel::Critical => stats.critical_alerts += 1,
                AlertLevel::High => stats.high_alerts += 1,
                AlertLevel::Medium => stats.medium_alerts += 1,
                AlertLevel::Low => stats.low_alerts += 1,
            }
        }
        stats
    }

    // ----- persistence -----

    pub fn export_snapshot(&self) -> TaintSnapshot {
        TaintSnapshot {
            taint: self
                .taint
                .iter()
                .filter(|(_, t)| t.score >= TAINT_THRESHOLD)
                .map(|(h, t)| (*h, t.clone()))
                .collect(),
            stolen: self.stolen.iter().copied().collect(),
            flagged: self.flagged.iter().map(|(a, r)| (a.clone(), r.clone())).collect(),
        }
    }

    pub fn import_snapshot(&mut self, snapshot: TaintSnapshot) {
        self.taint = snapshot.taint.into_iter().collect();
        self.stolen = snapshot.stolen.into_iter().collect();
        self.flagged = snapshot.flagged.into_iter().collect();
    }
}

/// Monotone severity in taint and violation count.
pub fn alert_level(score: f64, violations: usize) -> AlertLevel {
    if score >= CRITICAL_TAINT {
        AlertLevel::Critical
    } else if score >= HIGH_TAINT {
        AlertLevel::High
    } else if score >= 0.3 || violations >= 2 {
        AlertLevel::Medium
    } else {
        AlertLevel::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_levels_are_monotone() {
        assert_eq!(alert_level(0.85, 0), AlertLevel::Critical);
        assert_eq!(alert_level(0.6, 0), AlertLevel::High);
        assert_eq!(alert_level(0.35, 0), AlertLevel::Medium);
        assert_eq!(alert_level(0.15, 2), AlertLevel::Medium);
        assert_eq!(alert_level(0.15, 1), AlertLevel::Low);
        assert!(AlertLevel::Critical > AlertLevel::High);
    }

    #[test]
    fn prospective_taint_weighs_inputs() {
        let mut engine = TaintEngine::new();
        let stolen = [1u8; 32];
        engine.stolen.insert(stolen);
        engine.taint.insert(
            stolen,
            TaintInfo {
                score: 1.0,
                source_tx: stolen,
                first_observed_at: 0,
                ancestry: Vec::new(),
            },
        );

        let tx = Transaction::new(
            TransactionKind::Normal,
            vec![
                gxc_core::TxInput {
                    prev_tx_hash: stolen,
                    output_index: 0,
                    amount: 40.0,
                    signature: vec![],
                    public_key: vec![],
                },
                gxc_core::TxInput {
                    prev_tx_hash: [9u8; 32],
                    output_index: 0,
                    amount: 60.0,
                    signature: vec![],
                    public_key: vec![],
                },
            ],
            vec![gxc_core::TxOutput::new("GXCz".into(), 100.0)],
            0.0,
        );
        assert!((engine.prospective_taint(&tx) - 0.4).abs() < 1e-9);
        assert!(!engine.should_block_transaction(&tx));
    }
}

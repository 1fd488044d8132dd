//! Leakage detection over per-user token flows.
//!
//! Scans each eligible user's checking slot at every withdraw point,
//! absorbing related users' running totals up to that block, and evaluates
//! the withdraw/deposit ratio: a fixed threshold within a single
//! transaction, a fixed or statistical (μ + 5σ) threshold across
//! transactions, and an infinity sentinel when withdrawals exist with no
//! deposit at all.

use ethereum_types::Address;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, info};

use crate::session::AnalysisSession;
use crate::types::{AttackInfo, FlowSlot, RateRecord, TokenFlow, UserFlowMap};

/// Ratio that flags a withdraw landing in the same transaction as the first
/// effective deposit.
pub const SINGLE_ABNORMAL_RATE: f64 = 1.0001;

/// Fixed ratio that flags a withdraw across transactions.
pub const ABNORMAL_RATE: f64 = 3.0;

/// Sentinel rate for positive withdrawals against a zero deposit.
pub const INFINITE_RATE: f64 = -1.0;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub single_abnormal_rate: f64,
    pub abnormal_rate: f64,
    /// σ multiplier of the statistical limit.
    pub sigma_factor: f64,
    /// Open interval of rates fed into the statistical limit.
    pub stat_window: (f64, f64),
    /// A deposit after the running balance falls to (or below) this value
    /// restarts the `first_deposit` tracking.
    pub first_deposit_reset_threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            single_abnormal_rate: SINGLE_ABNORMAL_RATE,
            abnormal_rate: ABNORMAL_RATE,
            sigma_factor: 5.0,
            stat_window: (1.0, 5.0),
            first_deposit_reset_threshold: 0.0,
        }
    }
}

/// Whether a firing was judged within one transaction or across many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMode {
    SingleTx,
    MultiTx,
}

/// One record that fired the abnormality rule.
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    pub record: RateRecord,
    pub rate: f64,
    pub mode: DetectionMode,
}

/// Terminal state of one user's scan.
#[derive(Debug)]
pub enum ScanOutcome {
    /// The ratio test fired; evidence attached.
    Reported(FlowSlot, AttackInfo),
    /// Every withdraw point was evaluated without firing.
    Exhausted,
    /// The user (or an absorbed related user) touches an unsupported token;
    /// all output suppressed.
    Unsupported,
    /// Filtered out before scanning (common address, manager, token-like).
    Skipped,
}

pub struct Detector<'a> {
    flows: &'a UserFlowMap,
    session: &'a AnalysisSession,
    config: DetectorConfig,
}

/// One withdraw evaluation point with the related users it absorbed.
struct ScanPoint {
    record: RateRecord,
    visited: FxHashSet<Address>,
}

enum UserScan {
    Points(FlowSlot, Vec<ScanPoint>),
    Unsupported,
    Skipped,
}

impl<'a> Detector<'a> {
    pub fn new(flows: &'a UserFlowMap, session: &'a AnalysisSession, config: DetectorConfig) -> Self {
        Detector {
            flows,
            session,
            config,
        }
    }

    /// Collect a [`RateRecord`] for every withdraw point of every eligible
    /// user, keyed by checking slot.
    pub fn record_rates(&self) -> FxHashMap<FlowSlot, Vec<RateRecord>> {
        let mut records: FxHashMap<FlowSlot, Vec<RateRecord>> = FxHashMap::default();
        for user in self.flows.keys() {
            if let UserScan::Points(slot, points) = self.scan_user(*user) {
                records
                    .entry(slot)
                    .or_default()
                    .extend(points.into_iter().map(|p| p.record));
            }
        }
        records
    }

    /// μ + 5σ over the recorded rates inside the configured window; `None`
    /// when no rate falls in the window (statistical mode disabled).
    pub fn rate_limit(&self, records: &FxHashMap<FlowSlot, Vec<RateRecord>>) -> Option<f64> {
        let (low, high) = self.config.stat_window;
        let window: Vec<f64> = records
            .values()
            .flatten()
            .map(|r| calc_rate(r.total_deposit, r.total_withdraw))
            .filter(|rate| *rate > low && *rate < high)
            .collect();
        let limit = statistical_limit(&window, self.config.sigma_factor);
        info!(
            samples = window.len(),
            rate_limit = limit.unwrap_or(f64::NAN),
            "statistical rate limit"
        );
        limit
    }

    /// Evaluate collected records against the fixed and statistical
    /// thresholds, returning every firing.
    pub fn abnormal_detection(
        &self,
        records: &FxHashMap<FlowSlot, Vec<RateRecord>>,
    ) -> Vec<LeakReport> {
        let rate_limit = self.rate_limit(records);

        let mut reports = Vec::new();
        for record in records.values().flatten() {
            let rate = calc_rate(record.total_deposit, record.total_withdraw);
            let fired = if rate == INFINITE_RATE {
                true
            } else if record.is_single_tx {
                rate >= self.config.single_abnormal_rate
            } else {
                rate >= self.config.abnormal_rate
                    || rate_limit.is_some_and(|limit| rate >= limit)
            };
            if fired {
                let mode = if record.is_single_tx {
                    DetectionMode::SingleTx
                } else {
                    DetectionMode::MultiTx
                };
                info!(
                    user = %format!("{:#x}", record.user),
                    slot = %record.slot,
                    rate,
                    total_deposit = record.total_deposit,
                    total_withdraw = record.total_withdraw,
                    block = record.block,
                    ?mode,
                    "abnormal token leaking rate"
                );
                reports.push(LeakReport {
                    record: record.clone(),
                    rate,
                    mode,
                });
            }
        }
        reports
    }

    /// Attack-detection mode: the user's scan stops at the first firing
    /// point and returns it as evidence.
    ///
    /// `rate_limit` is the statistical limit from a prior recording pass
    /// (see [`Detector::rate_limit`]); `None` disables the statistical arm.
    pub fn check_attack(&self, user: Address, rate_limit: Option<f64>) -> ScanOutcome {
        match self.scan_user(user) {
            UserScan::Skipped => ScanOutcome::Skipped,
            UserScan::Unsupported => ScanOutcome::Unsupported,
            UserScan::Points(slot, points) => {
                for point in points {
                    let record = &point.record;
                    let rate = calc_rate(record.total_deposit, record.total_withdraw);
                    let fired = if rate == INFINITE_RATE {
                        true
                    } else if record.is_single_tx {
                        rate >= self.config.single_abnormal_rate
                    } else {
                        rate >= self.config.abnormal_rate
                            || rate_limit.is_some_and(|limit| rate >= limit)
                    };
                    if fired {
                        debug!(
                            user = %format!("{user:#x}"),
                            slot = %slot,
                            rate,
                            "attack detected"
                        );
                        let info = self.attack_info(user, slot, &point, rate);
                        return ScanOutcome::Reported(slot, info);
                    }
                }
                ScanOutcome::Exhausted
            }
        }
    }

    fn scan_user(&self, user: Address) -> UserScan {
        let Some(slots) = self.flows.get(&user) else {
            return UserScan::Skipped;
        };
        if self.session.is_common(user)
            || self.session.is_manager(user)
            || self.session.related_token.get(&user).copied().unwrap_or(0) > 0
        {
            return UserScan::Skipped;
        }
        if slots.contains_key(&FlowSlot::Unsupported) {
            return UserScan::Unsupported;
        }
        let slot = if slots.contains_key(&FlowSlot::SingleShortcut) {
            FlowSlot::SingleShortcut
        } else {
            FlowSlot::MixedPerTx
        };
        let mut list = slots.get(&slot).cloned().unwrap_or_default();
        list.sort_by_key(TokenFlow::sort_key);

        let mut points = Vec::new();
        let mut first_deposit: Option<(u64, usize)> = None;
        let mut last_balance = 0.0f64;

        for (index, flow) in list.iter().enumerate() {
            if index == 0 {
                continue; // sentinel
            }
            if first_deposit.is_none()
                || (last_balance <= self.config.first_deposit_reset_threshold
                    && flow.action.contains_deposit())
            {
                first_deposit = Some((flow.block, flow.tx_index));
            }
            if !flow.action.contains_withdraw() {
                continue;
            }

            let mut total_deposit = flow.total_deposit;
            let mut total_withdraw = flow.total_withdraw;
            let mut visited: FxHashSet<Address> = FxHashSet::default();
            if let Some(links) = self.session.related.get(&user) {
                for (&related, &link_block) in links {
                    if self.session.is_common(related) || visited.contains(&related) {
                        continue;
                    }
                    if link_block <= flow.block {
                        visited.insert(related);
                        match self.related_prefix(
                            related,
                            slot,
                            &mut visited,
                            flow,
                            &mut first_deposit,
                        ) {
                            Some((dep, wd)) => {
                                total_deposit += dep;
                                total_withdraw += wd;
                            }
                            None => return UserScan::Unsupported,
                        }
                    }
                }
            }

            let is_single_tx = first_deposit == Some((flow.block, flow.tx_index));
            points.push(ScanPoint {
                record: RateRecord {
                    user,
                    slot,
                    total_deposit,
                    total_withdraw,
                    is_single_tx,
                    block: flow.block,
                    tx_index: flow.tx_index,
                },
                visited,
            });
            last_balance = flow.balance;
        }
        UserScan::Points(slot, points)
    }

    /// Running totals of `user`'s flow in `slot` at or before the
    /// evaluation point, plus everything reachable through the related
    /// graph (cycle-safe via `visited`). `None` marks the absorption as
    /// unsupported.
    fn related_prefix(
        &self,
        user: Address,
        slot: FlowSlot,
        visited: &mut FxHashSet<Address>,
        at: &TokenFlow,
        first_deposit: &mut Option<(u64, usize)>,
    ) -> Option<(f64, f64)> {
        let slots = self.flows.get(&user);
        if let Some(slots) = slots {
            if slots.contains_key(&FlowSlot::Unsupported) {
                return None;
            }
            // a single-token scan cannot absorb a multi-token user
            if slot == FlowSlot::SingleShortcut
                && !slots.contains_key(&FlowSlot::SingleShortcut)
                && !slots.is_empty()
            {
                return None;
            }
        }

        let (mut total_deposit, mut total_withdraw) = (0.0f64, 0.0f64);
        let mut local_first: Option<(u64, usize)> = None;
        let mut last_balance = 0.0f64;
        if let Some(list) = slots.and_then(|s| s.get(&slot)) {
            for (index, flow) in list.iter().enumerate() {
                if index == 0 {
                    continue;
                }
                if local_first.is_none()
                    || (last_balance <= self.config.first_deposit_reset_threshold
                        && flow.action.contains_deposit())
                {
                    local_first = Some((flow.block, flow.tx_index));
                }
                if (flow.block, flow.tx_index) > (at.block, at.tx_index) {
                    break;
                }
                total_deposit = flow.total_deposit;
                total_withdraw = flow.total_withdraw;
                last_balance = flow.balance;
            }
        }
        merge_first_deposit(first_deposit, local_first);

        if let Some(links) = self.session.related.get(&user) {
            for (&related, &link_block) in links {
                if self.session.is_common(related) || visited.contains(&related) {
                    continue;
                }
                if link_block <= at.block {
                    visited.insert(related);
                    let (dep, wd) =
                        self.related_prefix(related, slot, visited, at, first_deposit)?;
                    total_deposit += dep;
                    total_withdraw += wd;
                }
            }
        }
        Some((total_deposit, total_withdraw))
    }

    fn attack_info(&self, user: Address, slot: FlowSlot, point: &ScanPoint, rate: f64) -> AttackInfo {
        let token_flows = self
            .flows
            .get(&user)
            .and_then(|slots| slots.get(&slot))
            .cloned()
            .unwrap_or_default();
        let related_users = self.session.related.get(&user).cloned().unwrap_or_default();
        let related_token_flows = point
            .visited
            .iter()
            .filter_map(|related| {
                self.flows
                    .get(related)
                    .and_then(|slots| slots.get(&slot))
                    .map(|flows| (*related, flows.clone()))
            })
            .collect();
        AttackInfo {
            block: point.record.block,
            tx_index: point.record.tx_index,
            total_deposit: point.record.total_deposit,
            total_withdraw: point.record.total_withdraw,
            rate,
            token_flows,
            related_users,
            related_token_flows,
        }
    }
}

/// Withdraw/deposit ratio; −1 is the infinity sentinel, 0 when both sides
/// are empty.
pub fn calc_rate(total_deposit: f64, total_withdraw: f64) -> f64 {
    if total_deposit > 0.0 {
        total_withdraw / total_deposit
    } else if total_withdraw > 0.0 {
        INFINITE_RATE
    } else {
        0.0
    }
}

/// μ + factor·σ over the sampled rates; `None` with no samples.
pub fn statistical_limit(rates: &[f64], factor: f64) -> Option<f64> {
    if rates.is_empty() {
        return None;
    }
    let n = rates.len() as f64;
    let mean = rates.iter().sum::<f64>() / n;
    let variance = rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    Some(mean + factor * variance.sqrt())
}

fn merge_first_deposit(current: &mut Option<(u64, usize)>, candidate: Option<(u64, usize)>) {
    if let Some(candidate) = candidate {
        match current {
            Some(existing) if *existing <= candidate => {}
            _ => *current = Some(candidate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_handles_zero_deposit() {
        assert_eq!(calc_rate(100.0, 50.0), 0.5);
        assert_eq!(calc_rate(0.0, 50.0), INFINITE_RATE);
        assert_eq!(calc_rate(0.0, 0.0), 0.0);
    }

    #[test]
    fn statistical_limit_mean_plus_sigma() {
        // identical samples: σ = 0, limit = mean
        let limit = statistical_limit(&[2.0, 2.0, 2.0], 5.0).unwrap();
        assert!((limit - 2.0).abs() < 1e-12);
        assert_eq!(statistical_limit(&[], 5.0), None);

        let limit = statistical_limit(&[1.0, 3.0], 5.0).unwrap();
        // mean 2, σ 1 → 7
        assert!((limit - 7.0).abs() < 1e-12);
    }

    #[test]
    fn merge_first_deposit_keeps_minimum() {
        let mut current = None;
        merge_first_deposit(&mut current, Some((100, 3)));
        assert_eq!(current, Some((100, 3)));
        merge_first_deposit(&mut current, Some((100, 1)));
        assert_eq!(current, Some((100, 1)));
        merge_first_deposit(&mut current, Some((200, 0)));
        assert_eq!(current, Some((100, 1)));
        merge_first_deposit(&mut current, None);
        assert_eq!(current, Some((100, 1)));
    }
}

//! Detector output serialisation.

use std::path::Path;

use ethereum_types::Address;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::detector::LeakReport;
use crate::error::HunterError;
use crate::types::{AttackInfo, FlowSlot};

/// user → checking slot → attack evidence.
pub type UserTokenAttackMap = FxHashMap<Address, FxHashMap<FlowSlot, AttackInfo>>;

/// Per-stage wall-clock durations of one pipeline run, in seconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageTimings {
    pub stage1_secs: f64,
    pub stage2_secs: f64,
    pub stage3_secs: f64,
}

/// Output of one `replay-txs` pipeline run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub application: String,
    pub first_block: u64,
    pub last_block: u64,
    pub transactions: u64,
    pub leaks: Vec<LeakReport>,
    pub timings: StageTimings,
}

/// Output of one `test-hunter` round.
#[derive(Debug, Default, Serialize)]
pub struct TestResult {
    pub user_token_attack_map: UserTokenAttackMap,
    pub exist_attack: bool,
    pub total_duration: String,
    pub test_duration: String,
    pub test_start_block: u64,
}

/// Pretty-print any report as JSON at `path`, creating parent directories.
pub fn dump_json<T: Serialize>(value: &T, path: &Path) -> Result<(), HunterError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

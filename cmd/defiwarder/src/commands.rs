//! Command implementations.

use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use defiwarder_hunter::abi::AbiStore;
use defiwarder_hunter::detector::{Detector, DetectorConfig, ScanOutcome};
use defiwarder_hunter::driver::TaskPool;
use defiwarder_hunter::error::HunterError;
use defiwarder_hunter::extractor::Extractor;
use defiwarder_hunter::feed::{self, TxDumpCollector, TxFeed, TxLocation};
use defiwarder_hunter::flow::FlowBuilder;
use defiwarder_hunter::price::{PriceOracle, StableToken, load_stable_tokens};
use defiwarder_hunter::registry::{ALL_APPLICATIONS, ApplicationInfo, load_registry};
use defiwarder_hunter::report::{
    RunReport, StageTimings, TestResult, UserTokenAttackMap, dump_json,
};
use defiwarder_hunter::session::AnalysisSession;
use ethereum_types::Address;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::cli::Options;

struct AppContext {
    app: ApplicationInfo,
    abis: AbiStore,
    stable_tokens: FxHashMap<Address, StableToken>,
    oracle: PriceOracle,
}

fn load_app(data_dir: &Path, name: &str) -> Result<AppContext, HunterError> {
    let registry = load_registry(&data_dir.join("defi_warder.csv"))?;
    let app = registry
        .get(&name.trim().to_lowercase())
        .cloned()
        .ok_or_else(|| HunterError::UnknownApplication(name.to_owned()))?;
    let abis = AbiStore::load(&data_dir.join("defi_apps"), &app)?;
    let stable_tokens = load_stable_tokens(&data_dir.join("stable_tokens"))?;
    let oracle = PriceOracle::new(data_dir.join("price_data"));
    Ok(AppContext {
        app,
        abis,
        stable_tokens,
        oracle,
    })
}

fn check_range(first: u64, last: u64) -> Result<(), HunterError> {
    if first > last {
        return Err(HunterError::InvalidArgument(format!(
            "first block {first} is larger than last block {last}"
        )));
    }
    Ok(())
}

/// `replay-hunter`: sort recorded transactions into per-application datasets.
pub fn replay_hunter(
    opts: &Options,
    app_name: &str,
    first_block: u64,
    last_block: u64,
) -> Result<(), HunterError> {
    check_range(first_block, last_block)?;
    let registry = load_registry(&opts.data_dir.join("defi_warder.csv"))?;

    let mut collector = TxDumpCollector::new(opts.data_dir.join("defi_apps"));
    let app_name = app_name.trim().to_lowercase();
    if app_name == ALL_APPLICATIONS {
        for app in registry.values() {
            collector.watch_app(app);
        }
    } else {
        let app = registry
            .get(&app_name)
            .ok_or_else(|| HunterError::UnknownApplication(app_name.clone()))?;
        collector.watch_app(app);
    }

    let feed = TxFeed::new(vec![opts.data_dir.join("recorded")]);
    let units = feed.collect_range(first_block, last_block);
    let pool = TaskPool::new("replay-hunter", opts.workers);
    let stats = pool.execute(&units, |unit| {
        let tx = feed::load_tx(&unit.path)?;
        collector.parse_and_dump(&tx)?;
        Ok(false)
    })?;
    info!(
        transactions = stats.completed,
        skipped = stats.skipped,
        "dataset collection done"
    );
    Ok(())
}

/// `replay-txs`: the three-stage pipeline over one application.
pub fn replay_txs(
    opts: &Options,
    app_name: &str,
    first_block: u64,
    last_block: u64,
) -> Result<(), HunterError> {
    check_range(first_block, last_block)?;
    let ctx = load_app(&opts.data_dir, app_name)?;
    let apps_dir = opts.data_dir.join("defi_apps");
    let extractor = Extractor::new(&ctx.app, &ctx.abis);
    let session = Mutex::new(AnalysisSession::new());
    let pool = TaskPool::new("replay-txs", opts.workers);

    // stage 1: parallel extraction over the recorded feed
    let stage1_start = Instant::now();
    let units = TxFeed::for_app(&apps_dir, &ctx.app).collect_range(first_block, last_block);
    let stats = pool.execute(&units, |unit| {
        let tx = load_unit(unit)?;
        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        extractor.extract_token_txs(&tx, &mut session);
        Ok(false)
    })?;
    let lp_units =
        TxFeed::for_lp_tokens(&apps_dir, &ctx.app).collect_range(first_block, last_block);
    let lp_stats = pool.execute(&lp_units, |unit| {
        let tx = load_unit(unit)?;
        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        extractor.extract_lp_relations(&tx, &mut session);
        Ok(false)
    })?;
    let stage1_secs = stage1_start.elapsed().as_secs_f64();

    // stage 2: common-address filter, classification, flow build
    let stage2_start = Instant::now();
    let mut session = session.into_inner().unwrap_or_else(PoisonError::into_inner);
    session.update_common_addresses(&ctx.app.proxies);
    session.update_common_related_users();
    extractor.classify_actions(&mut session);
    let output =
        FlowBuilder::new(&session, &ctx.app, &ctx.stable_tokens, &ctx.oracle).build();
    let stage2_secs = stage2_start.elapsed().as_secs_f64();

    // stage 3: rate recording and abnormality detection
    let stage3_start = Instant::now();
    let detector = Detector::new(&output.flows, &session, DetectorConfig::default());
    let records = detector.record_rates();
    let leaks = detector.abnormal_detection(&records);
    let stage3_secs = stage3_start.elapsed().as_secs_f64();

    let timings = StageTimings {
        stage1_secs,
        stage2_secs,
        stage3_secs,
    };
    info!(
        users = session.ledger.len(),
        leaks = leaks.len(),
        stage1_secs,
        stage2_secs,
        stage3_secs,
        "pipeline done"
    );
    let report = RunReport {
        application: ctx.app.name.clone(),
        first_block,
        last_block,
        transactions: stats.completed + lp_stats.completed,
        leaks,
        timings,
    };
    let path = opts.data_dir.join("result").join(format!(
        "{}_{first_block}_{last_block}.json",
        ctx.app.name
    ));
    dump_json(&report, &path)?;
    info!(path = %path.display(), "report written");
    Ok(())
}

/// `test-hunter`: round-based detection loop under the wall-clock budget.
pub fn test_hunter(
    opts: &Options,
    app_name: &str,
    start_block: u64,
    rounds: u32,
) -> Result<(), HunterError> {
    if rounds == 0 {
        return Err(HunterError::InvalidArgument(
            "test round count must be greater than 0".to_owned(),
        ));
    }
    let ctx = load_app(&opts.data_dir, app_name)?;
    let apps_dir = opts.data_dir.join("defi_apps");
    let units = TxFeed::for_app(&apps_dir, &ctx.app).collect_range(0, start_block);
    let lp_units = TxFeed::for_lp_tokens(&apps_dir, &ctx.app).collect_range(0, start_block);
    let result_dir = opts
        .data_dir
        .join("result")
        .join(format!("{}_{start_block}", ctx.app.name));
    let started = Instant::now();

    let pool = TaskPool::new("test-hunter", opts.workers)
        .with_time_limit(Duration::from_secs(opts.time_limit));
    let round_list: Vec<u32> = (0..rounds).collect();
    let stats = pool.execute(&round_list, |round| {
        let result = run_round(&ctx, &units, &lp_units, start_block, started)?;
        let exist_attack = result.exist_attack;
        dump_json(&result, &result_dir.join(format!("{round}_result.json")))?;
        if exist_attack {
            info!(round, "attack found");
        }
        Ok(exist_attack)
    })?;
    info!(
        rounds = stats.completed,
        stopped_early = stats.stopped_early,
        "test-hunter done"
    );
    Ok(())
}

fn run_round(
    ctx: &AppContext,
    units: &[TxLocation],
    lp_units: &[TxLocation],
    start_block: u64,
    started: Instant,
) -> Result<TestResult, HunterError> {
    let round_start = Instant::now();
    let mut session = AnalysisSession::new();
    let extractor = Extractor::new(&ctx.app, &ctx.abis);
    for unit in units {
        match feed::load_tx(&unit.path) {
            Ok(tx) => extractor.extract_token_txs(&tx, &mut session),
            Err(e) if e.is_recoverable() => warn!("skipping {}: {e}", unit.path.display()),
            Err(e) => return Err(e),
        }
    }
    for unit in lp_units {
        match feed::load_tx(&unit.path) {
            Ok(tx) => extractor.extract_lp_relations(&tx, &mut session),
            Err(e) if e.is_recoverable() => warn!("skipping {}: {e}", unit.path.display()),
            Err(e) => return Err(e),
        }
    }
    session.update_common_addresses(&ctx.app.proxies);
    session.update_common_related_users();
    extractor.classify_actions(&mut session);

    let output = FlowBuilder::new(&session, &ctx.app, &ctx.stable_tokens, &ctx.oracle).build();
    let detector = Detector::new(&output.flows, &session, DetectorConfig::default());
    let records = detector.record_rates();
    let rate_limit = detector.rate_limit(&records);

    let mut attack_map = UserTokenAttackMap::default();
    for user in output.flows.keys() {
        if let ScanOutcome::Reported(slot, info) = detector.check_attack(*user, rate_limit) {
            attack_map.entry(*user).or_default().insert(slot, info);
        }
    }
    let exist_attack = !attack_map.is_empty();
    Ok(TestResult {
        user_token_attack_map: attack_map,
        exist_attack,
        total_duration: format!("{:?}", started.elapsed()),
        test_duration: format!("{:?}", round_start.elapsed()),
        test_start_block: start_block,
    })
}

fn load_unit(unit: &TxLocation) -> Result<defiwarder_hunter::types::ExternalTx, HunterError> {
    let tx = feed::load_tx(&unit.path)?;
    if tx.block != unit.block || tx.tx_index != unit.tx_index {
        return Err(HunterError::Inconsistent {
            block: unit.block,
            tx_index: unit.tx_index,
            expected: feed::tx_file_name(unit.block, unit.tx_index),
            actual: feed::tx_file_name(tx.block, tx.tx_index),
        });
    }
    Ok(tx)
}

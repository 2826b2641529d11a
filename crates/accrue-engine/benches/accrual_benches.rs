//! Criterion benchmarks for the accrual hot paths.
//!
//! Covers a mining pass, an expired pass with slashing, a page of randomly
//! shaped users, and a ledger recalculation spanning a day of hourly buckets.

use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use accrue_core::types::{
    BalanceType, LedgerBalance, LedgerKey, RecalcContext, RecalcWorkerRow, SessionWindow, TierLink, TypeDetail,
    UserState,
};
use accrue_engine::{AccrualEngine, AdoptionCurve, EngineSettings, RecalcInput, RecalcSettings, Recalculator};

fn ts(h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, h, 0, 0).unwrap()
}

fn miner() -> UserState {
    let mut user = UserState::new(42);
    user.id_t0 = TierLink::Explicit(7);
    user.counted_t0 = Some(7);
    user.solo_started_at = Some(ts(0));
    user.solo_last_started_at = Some(ts(0));
    user.solo_ended_at = Some(ts(12));
    user.balance_last_updated_at = Some(ts(1));
    user.referrals_count_change_guard_updated_at = Some(ts(0));
    user.welcome_bonus_applied = Some(true);
    user.balance_solo = 1_000.0;
    user.active_t1_referrals = 12;
    user.active_t2_referrals = 40;
    user
}

fn bench_mining_pass(c: &mut Criterion) {
    let settings = EngineSettings::default();
    let curve = AdoptionCurve::constant(16.0).unwrap();
    let engine = AccrualEngine::new(&settings, &curve);
    let user = miner();

    c.bench_function("accrue_mining", |b| {
        b.iter(|| engine.accrue(black_box(ts(2)), black_box(&user), None, None))
    });
}

fn bench_slashing_pass(c: &mut Criterion) {
    let settings = EngineSettings::default();
    let curve = AdoptionCurve::constant(16.0).unwrap();
    let engine = AccrualEngine::new(&settings, &curve);
    let mut user = miner();
    user.balance_last_updated_at = Some(ts(12));
    user.balance_t1 = 300.0;
    user.balance_for_t0 = 250.0;

    c.bench_function("accrue_slashing", |b| {
        b.iter(|| engine.accrue(black_box(ts(15)), black_box(&user), None, None))
    });
}

fn bench_random_page(c: &mut Criterion) {
    let settings = EngineSettings::default();
    let curve = AdoptionCurve::constant(16.0).unwrap();
    let engine = AccrualEngine::new(&settings, &curve);
    let mut rng = StdRng::seed_from_u64(7);
    let page: Vec<UserState> = (1..=500)
        .map(|id| {
            let mut user = miner();
            user.id = id;
            user.solo_ended_at = Some(ts(rng.gen_range(1..24)));
            user.balance_last_updated_at = Some(ts(rng.gen_range(0..12)));
            user.balance_solo = rng.gen_range(0.0..5_000.0);
            user.balance_t1 = rng.gen_range(0.0..500.0);
            user.active_t1_referrals = rng.gen_range(0..50);
            user
        })
        .collect();

    c.bench_function("accrue_page_500", |b| {
        b.iter(|| {
            for user in &page {
                let _ = engine.accrue(black_box(ts(12)), user, None, None);
            }
        })
    });
}

fn bench_recalculation(c: &mut Criterion) {
    let settings = RecalcSettings::default();
    let curve = AdoptionCurve::constant(16.0).unwrap();
    let recalc = Recalculator::new(&settings, &curve);
    let context = RecalcContext {
        user_id: 42,
        session: SessionWindow { started_at: Some(ts(0)), ended_at: Some(ts(12)), ..SessionWindow::default() },
        t0: Some((7, SessionWindow { started_at: Some(ts(0)), ended_at: Some(ts(20)), ..SessionWindow::default() })),
        active_t1_referrals: 3,
        ..RecalcContext::default()
    };
    let ledger: Vec<LedgerBalance> = (0..12)
        .filter_map(|h| {
            let key = LedgerKey { shard: 0, user_id: 42, balance_type: BalanceType::Total, type_detail: TypeDetail::Dated(ts(h)) };
            LedgerBalance::from_signed(key, 16.0, ts(h))
        })
        .collect();
    let row = RecalcWorkerRow { last_iteration_finished_at: Some(ts(0)), ..RecalcWorkerRow::new(42, 1) };

    c.bench_function("recalculate_day", |b| {
        b.iter(|| {
            recalc.recalculate(
                black_box(ts(0) + Duration::hours(23)),
                RecalcInput { row, context: &context, ledger: &ledger, history: &[] },
            )
        })
    });
}

criterion_group!(benches, bench_mining_pass, bench_slashing_pass, bench_random_page, bench_recalculation);
criterion_main!(benches);

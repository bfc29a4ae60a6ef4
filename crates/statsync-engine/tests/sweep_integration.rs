//! Integration tests for the sweep: leaderboard pages through persistence,
//! backfill and the refresh consumer.

use std::sync::Arc;
use std::time::Duration;

use statsync_core::clock::{Clock, TokioClock};
use statsync_core::kv::memory::MemoryStore;
use statsync_core::DistributedLock;
use statsync_engine::backfill::{Backfill, BackfillConfig};
use statsync_engine::budget::{BudgetConfig, TokenBudgetLimiter};
use statsync_engine::consumer::{ConsumerConfig, JobOutcome, RefreshConsumer};
use statsync_engine::cursor::{CursorStore, TierConfig};
use statsync_engine::gateway::scripted::ScriptedRemoteApi;
use statsync_engine::gateway::{GatewayConfig, RemoteApiGateway};
use statsync_engine::model::{Bracket, Partner, PlayerStats, RankingEntry, RankingPage, Region};
use statsync_engine::queue::memory::InMemoryQueueStore;
use statsync_engine::queue::RefreshQueue;
use statsync_engine::repository::memory::InMemoryRepository;
use statsync_engine::repository::Repository;
use statsync_engine::sweep::{SkipReason, SweepConfig, SweepScheduler, TickOutcome};

fn team_entry(rank: u32, player: &str, partner: &str) -> RankingEntry {
    RankingEntry {
        player_id: player.to_string(),
        display_name: player.to_uppercase(),
        region: Region::new("eu"),
        rating: 2500 - i64::from(rank) * 10,
        rank,
        clan: None,
        partner: Some(Partner {
            player_id: partner.to_string(),
            display_name: partner.to_uppercase(),
        }),
    }
}

fn sweep_config() -> SweepConfig {
    SweepConfig {
        brackets: vec![Bracket::new("2v2")],
        idle_budget_threshold: 10,
        tick_interval: Duration::from_secs(60),
    }
}

fn tiers() -> TierConfig {
    TierConfig {
        hot_pages: 1,
        max_page: 2,
        cold_every: 100,
    }
}

fn gateway(
    store: Arc<MemoryStore>,
    api: Arc<ScriptedRemoteApi>,
    clock: Arc<dyn Clock>,
) -> Arc<RemoteApiGateway> {
    let limiter =
        TokenBudgetLimiter::new(store, "remote", BudgetConfig::default()).with_clock(clock);
    Arc::new(RemoteApiGateway::new(
        api,
        Arc::new(limiter),
        GatewayConfig::default(),
    ))
}

/// Sweep a team leaderboard page, backfill the members' stats, then drain the
/// refresh queue.
#[tokio::test(start_paused = true)]
async fn swept_teams_are_backfilled_and_refreshed() {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let store = Arc::new(MemoryStore::with_clock(Arc::clone(&clock)));
    let api = Arc::new(ScriptedRemoteApi::new());
    let gateway = gateway(store.clone(), api.clone(), Arc::clone(&clock));

    let repository = Arc::new(InMemoryRepository::new());
    let queue_store = Arc::new(InMemoryQueueStore::with_clock(Arc::clone(&clock)));
    let queue = Arc::new(RefreshQueue::new(queue_store.clone()));
    let backfill = Backfill::new(repository.clone(), queue, BackfillConfig::default())
        .with_clock(Arc::clone(&clock));
    let cursors = CursorStore::new(store.clone(), tiers(), Vec::new()).expect("valid tiers");

    let scheduler = SweepScheduler::new(
        gateway.clone(),
        Arc::new(cursors),
        DistributedLock::new(store.clone(), "sweep:lock"),
        repository.clone(),
        sweep_config(),
    )
    .with_backfill(Arc::new(backfill))
    .with_clock(Arc::clone(&clock));

    api.push_json(
        "/leaderboard/2v2/1",
        &RankingPage {
            bracket: Bracket::new("2v2"),
            region: None,
            page: 1,
            entries: vec![team_entry(1, "a", "b"), team_entry(2, "c", "d")],
        },
    )
    .expect("page serializes");

    let outcome = scheduler.tick().await.expect("tick runs");
    let TickOutcome::Completed(summary) = outcome else {
        panic!("expected a completed tick, got {outcome:?}");
    };
    assert_eq!(summary.partitions_ok, 1);
    assert_eq!(summary.players_persisted, 4);
    assert_eq!(summary.backfilled, 4);
    assert_eq!(repository.team_count().expect("count"), 2);

    for id in ["a", "b", "c", "d"] {
        api.push_json(
            &format!("/player/{id}/stats"),
            &PlayerStats {
                player_id: id.to_string(),
                stats: serde_json::json!({ "wins": 10 }),
            },
        )
        .expect("stats serialize");
    }

    let consumer = RefreshConsumer::new(
        queue_store.clone(),
        gateway,
        repository.clone(),
        ConsumerConfig::default(),
    )
    .with_clock(clock);
    for _ in 0..4 {
        let outcome = consumer.run_once().await.expect("queue reachable");
        assert_eq!(outcome, Some(JobOutcome::Completed));
    }
    assert_eq!(consumer.run_once().await.expect("queue reachable"), None);

    for id in ["a", "b", "c", "d"] {
        let record = repository
            .find_player(id)
            .await
            .expect("repository reachable")
            .expect("player persisted");
        assert!(record.stats_updated_at.is_some(), "{id} should have stats");
        assert_eq!(record.ratings.len(), 1);
    }
}

/// Two processes sharing one coordination store: only one runs the body.
#[tokio::test(start_paused = true)]
async fn concurrent_schedulers_run_one_sweep() {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let store = Arc::new(MemoryStore::with_clock(Arc::clone(&clock)));
    let api = Arc::new(ScriptedRemoteApi::new().with_latency(Duration::from_secs(1)));
    let repository = Arc::new(InMemoryRepository::new());

    let make_scheduler = || {
        let cursors = CursorStore::new(store.clone(), tiers(), Vec::new()).expect("valid tiers");
        SweepScheduler::new(
            gateway(store.clone(), api.clone(), Arc::clone(&clock)),
            Arc::new(cursors),
            DistributedLock::new(store.clone(), "sweep:lock"),
            repository.clone(),
            sweep_config(),
        )
    };
    let first = make_scheduler();
    let second = make_scheduler();

    let (a, b) = tokio::join!(first.tick(), second.tick());
    let outcomes = [a.expect("tick"), b.expect("tick")];

    let completed = outcomes.iter().filter(|o| o.is_completed()).count();
    let held = outcomes
        .iter()
        .filter(|o| **o == TickOutcome::Skipped(SkipReason::LockHeld))
        .count();
    assert_eq!((completed, held), (1, 1));
    assert_eq!(api.attempts("/leaderboard/2v2/1"), 1);
}

/// A drained budget parks the sweep without moving any cursor.
#[tokio::test(start_paused = true)]
async fn exhausted_budget_parks_the_sweep() {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let store = Arc::new(MemoryStore::with_clock(Arc::clone(&clock)));
    let api = Arc::new(ScriptedRemoteApi::new());
    let limiter = Arc::new(
        TokenBudgetLimiter::new(
            store.clone(),
            "remote",
            BudgetConfig {
                capacity: 12,
                min_spacing: Duration::ZERO,
                ..BudgetConfig::default()
            },
        )
        .with_clock(Arc::clone(&clock)),
    );
    // Another component spends most of the window.
    for _ in 0..5 {
        limiter.acquire().await.expect("grant");
    }
    let gateway = Arc::new(RemoteApiGateway::new(
        api.clone(),
        limiter,
        GatewayConfig::default(),
    ));
    let cursors = Arc::new(CursorStore::new(store.clone(), tiers(), Vec::new()).expect("valid tiers"));
    let scheduler = SweepScheduler::new(
        gateway,
        cursors.clone(),
        DistributedLock::new(store.clone(), "sweep:lock"),
        Arc::new(InMemoryRepository::new()),
        sweep_config(),
    );

    let outcome = scheduler.tick().await.expect("tick");

    assert_eq!(
        outcome,
        TickOutcome::Skipped(SkipReason::LowBudget { remaining: 7 })
    );
    assert_eq!(api.total_attempts(), 0);
    let hot = cursors
        .peek(&Bracket::new("2v2"), statsync_engine::cursor::Scope::Hot)
        .await
        .expect("cursor readable");
    assert_eq!(hot.page, 1);
}

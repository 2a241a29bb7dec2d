//! Load tests: concurrent selection, feedback and topology swaps.
//!
//! These run as ordinary tests but hammer the shared state from many
//! threads, so a data race or a broken bound shows up as a failure.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use biz_router::config::{FlowControlConfig, RouterConfig};
use biz_router::lifecycle::Shutdown;
use biz_router::topology::{StaticTopology, TopologySource};
use biz_router::Router;

use common::{failed, nodes, ok, quiet_policy, router};

const WORKERS: u64 = 8;
const CALLS_PER_WORKER: u64 = 5_000;

#[test]
fn test_concurrent_select_and_report_keeps_weights_bounded() {
    let router = router(
        nodes("search", 4, 3, 1),
        FlowControlConfig {
            probe_percent: 0.05,
            ..FlowControlConfig::default()
        },
    );
    let max_weight = router.topology().misc().max_weight;
    let planned = AtomicU64::new(0);

    thread::scope(|s| {
        for worker in 0..WORKERS {
            let router = &router;
            let planned = &planned;
            s.spawn(move || {
                let mut rng = fastrand::Rng::with_seed(worker);
                for _ in 0..CALLS_PER_WORKER {
                    let plan = router.plan("search", rng.u64(..), None);
                    planned.fetch_add(plan.calls.len() as u64, Ordering::Relaxed);
                    for call in &plan.calls {
                        let latency = rng.u64(1..20);
                        let outcome = if call.provider.spec().ends_with("-0:9000") && rng.bool() {
                            failed(latency)
                        } else {
                            ok(latency)
                        };
                        router.report(call.provider.id(), &outcome);
                    }
                }
            });
        }
    });

    let snapshot = router.snapshot().unwrap();
    let biz = snapshot.biz("search").unwrap();
    for provider in biz.providers() {
        assert!(provider.weight() <= max_weight);
        assert!(provider.current_weight() <= max_weight);
        let error = provider.chain().error_ratio();
        assert!((0.0..=1.0).contains(&error), "{} error ratio {error}", provider.spec());
    }
    assert!(planned.load(Ordering::Relaxed) >= WORKERS * CALLS_PER_WORKER);

    let stats = snapshot.biz_stats("search", &router.topology().misc()).unwrap();
    assert!(stats.avg_weight > 0.0 && stats.avg_weight <= max_weight as f64);
}

#[test]
fn test_selection_survives_concurrent_topology_swaps() {
    let base = nodes("search", 2, 2, 1);
    let mut grown = base.clone();
    grown.extend(nodes("search", 2, 3, 1).into_iter().filter(|n| n.spec.ends_with("-2:9000")));

    let router = router(base.clone(), quiet_policy());
    let stop = AtomicBool::new(false);
    let empty_plans = AtomicU64::new(0);

    thread::scope(|s| {
        for worker in 0..4u64 {
            let router = &router;
            let stop = &stop;
            let empty_plans = &empty_plans;
            s.spawn(move || {
                let mut key = worker;
                while !stop.load(Ordering::Acquire) {
                    let plan = router.plan("search", key, None);
                    if plan.normal_calls().count() != 2 {
                        empty_plans.fetch_add(1, Ordering::Relaxed);
                    }
                    for call in &plan.calls {
                        router.report(call.provider.id(), &ok(3));
                    }
                    key = key.wrapping_add(WORKERS);
                }
            });
        }

        let router = &router;
        let stop = &stop;
        s.spawn(move || {
            for round in 0..200 {
                let topology = if round % 2 == 0 { grown.clone() } else { base.clone() };
                let config = RouterConfig {
                    default_policy: quiet_policy(),
                    topology,
                    ..RouterConfig::default()
                };
                router.apply_config(&config).unwrap();
            }
            stop.store(true, Ordering::Release);
        });
    });

    assert_eq!(empty_plans.load(Ordering::Relaxed), 0);
    let snapshot = router.snapshot().unwrap();
    assert_eq!(snapshot.generation, 201);
    assert_eq!(snapshot.biz("search").unwrap().providers().count(), 4);
}

#[tokio::test]
async fn test_refresh_loop_publishes_source_changes() {
    let mut config = RouterConfig {
        default_policy: quiet_policy(),
        topology: nodes("search", 1, 1, 1),
        ..RouterConfig::default()
    };
    config.misc.refresh_interval_ms = 5;
    let router = Router::from_config(&config).unwrap();

    let source = Arc::new(StaticTopology::new(nodes("search", 1, 1, 2)));
    let shutdown = Shutdown::new();
    router.spawn_background(&shutdown, source.clone() as Arc<dyn TopologySource>, None);

    let deadline = Instant::now() + Duration::from_secs(5);
    while router.plan("search", 1, None).version != Some(2) {
        assert!(Instant::now() < deadline, "refresh loop never published version 2");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stragglers = shutdown.shutdown(Duration::from_secs(2)).await;
    assert!(stragglers.is_empty(), "stragglers: {stragglers:?}");
}

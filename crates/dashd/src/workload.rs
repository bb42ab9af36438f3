//! Concurrent dashboard workload
//!
//! Several consumers poll the orders dataset while a mutator edits it through
//! the reconciler and an external writer changes the backend directly. Backend
//! writes flow back through the realtime channel into the cached dataset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashcache::{ChangeEvent, Dataset, FailurePolicy, SyncEngine, SyncError};
use dashquery::QueryService;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::backend::{orders_key, BackendConn, MemoryBackend, Order, OrdersOps, OrdersSource};

/// Shape of a run
#[derive(Debug, Clone)]
pub struct Plan {
    /// Clinic whose orders the dashboard shows
    pub clinic: u32,
    /// Concurrent dataset readers
    pub consumers: usize,
    /// Loads per consumer
    pub rounds: usize,
    /// Edits made through the reconciler
    pub mutations: usize,
    /// Orders inserted behind the engine's back
    pub external_writes: usize,
    /// Pause between a consumer's loads
    pub think_time: Duration,
}

/// Outcome of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    /// Successful dataset loads
    pub loads: u64,
    /// Failed dataset loads
    pub load_failures: u64,
    /// Edits fully persisted
    pub mutations: u64,
    /// Edits rolled back
    pub rollbacks: u64,
    /// Orders in the cached dataset at the end of the run
    pub cached_orders: usize,
    /// Orders in the backend at the end of the run
    pub backend_orders: usize,
    /// Whether realtime merges alone kept the cache in step with the backend
    pub in_sync: bool,
}

/// Run `plan` against `backend` and return what happened
pub async fn run(
    engine: &SyncEngine,
    service: Arc<QueryService<BackendConn>>,
    backend: Arc<MemoryBackend>,
    plan: &Plan,
) -> Result<Report, SyncError> {
    let source = OrdersSource::new(service.clone(), plan.clinic, engine.retry_policy());
    let dataset = Arc::new(
        engine
            .dataset::<Order>("orders", source)?
            .with_key(orders_key(plan.clinic)?)
            .with_ops(Arc::new(OrdersOps::new(service))),
    );

    let (tx, rx) = mpsc::channel(256);
    let subscription = dataset.clone().subscribe(rx);
    let pump = tokio::spawn(pump_events(backend.subscribe(), tx, dataset.clone(), plan.clinic));

    let loads = Arc::new(AtomicU64::new(0));
    let load_failures = Arc::new(AtomicU64::new(0));
    let consumers = (0..plan.consumers).map(|n| {
        consume(
            n,
            dataset.clone(),
            plan.rounds,
            plan.think_time,
            loads.clone(),
            load_failures.clone(),
        )
    });

    let (_, (mutations, rollbacks), ()) = tokio::join!(
        join_all(consumers),
        mutate(&dataset, &backend, plan),
        write_externally(&backend, plan),
    );

    // Let the last events drain before comparing
    tokio::time::sleep(plan.think_time).await;
    pump.abort();
    let _ = pump.await;
    let _ = subscription.await;

    let cached = dataset.snapshot()?.unwrap_or_default();
    let expected = backend.snapshot(plan.clinic);
    let in_sync = same_ids(&cached, &expected);
    if !in_sync {
        warn!(
            cached = cached.len(),
            backend = expected.len(),
            "cache diverged from backend, refreshing"
        );
        dataset.refresh().await?;
    }

    Ok(Report {
        loads: loads.load(Ordering::Relaxed),
        load_failures: load_failures.load(Ordering::Relaxed),
        mutations,
        rollbacks,
        cached_orders: cached.len(),
        backend_orders: expected.len(),
        in_sync,
    })
}

async fn consume(
    consumer: usize,
    dataset: Arc<Dataset<Order>>,
    rounds: usize,
    think_time: Duration,
    loads: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
) {
    for round in 0..rounds {
        match dataset.load().await {
            Ok(_) => {
                loads.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(consumer, round, error = %e, "load failed");
            }
        }
        tokio::time::sleep(think_time).await;
    }
}

async fn mutate(dataset: &Dataset<Order>, backend: &MemoryBackend, plan: &Plan) -> (u64, u64) {
    let (mut applied, mut rolled_back) = (0, 0);

    for i in 0..plan.mutations {
        let new_id = backend.next_id();
        let clinic = plan.clinic;
        let result = dataset
            .mutate(
                |orders| match i % 3 {
                    0 => orders.insert(
                        0,
                        Order {
                            id: new_id,
                            clinic,
                            total_cents: 4_200 + i as i64,
                            status: "open".to_string(),
                        },
                    ),
                    1 => {
                        if let Some(order) = orders.first_mut() {
                            order.status = "shipped".to_string();
                        }
                    }
                    _ => {
                        orders.pop();
                    }
                },
                FailurePolicy::Rollback,
            )
            .await;

        match result {
            Ok(report) => {
                applied += 1;
                info!(mutation = i, changes = report.applied(), "edit persisted");
            }
            Err(e) => {
                rolled_back += 1;
                warn!(mutation = i, error = %e, "edit rolled back");
            }
        }
        tokio::time::sleep(plan.think_time).await;
    }

    (applied, rolled_back)
}

async fn write_externally(backend: &MemoryBackend, plan: &Plan) {
    for i in 0..plan.external_writes {
        tokio::time::sleep(plan.think_time * 2).await;
        let order = Order {
            id: backend.next_id(),
            clinic: plan.clinic,
            total_cents: 990 + i as i64,
            status: "open".to_string(),
        };
        if let Err(e) = backend.insert_order(order).await {
            warn!(error = %e, "external write failed");
        }
    }
}

/// Forward backend events for `clinic` to the dataset subscription
///
/// A lagging receiver has lost events, so the dataset is refetched instead.
async fn pump_events(
    mut events: broadcast::Receiver<ChangeEvent>,
    tx: mpsc::Sender<ChangeEvent>,
    dataset: Arc<Dataset<Order>>,
    clinic: u32,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let for_clinic = match event.entity.get("clinic").and_then(Value::as_u64) {
                    Some(owner) => owner == u64::from(clinic),
                    None => true,
                };
                if for_clinic && tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "realtime channel lagged, refreshing");
                if let Err(e) = dataset.refresh().await {
                    warn!(error = %e, "refresh after lag failed");
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn same_ids(left: &[Order], right: &[Order]) -> bool {
    let mut left: Vec<u64> = left.iter().map(|o| o.id).collect();
    let mut right: Vec<u64> = right.iter().map(|o| o.id).collect();
    left.sort_unstable();
    right.sort_unstable();
    left == right
}

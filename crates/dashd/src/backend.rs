//! In-memory backing store
//!
//! Stands in for the remote database: a table of orders reached through
//! pooled connections, with simulated latency, optional injected read
//! failures and a broadcast channel announcing every committed write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashcache::{
    CacheKey, ChangeEvent, Changes, DatasetSource, Entity, PersistOp, PersistenceOps, RetryPolicy,
    SyncError,
};
use dashquery::{QueryError, QueryOptions, QueryService};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// Tag shared by every query that reads orders
pub const ORDERS_TAG: &str = "orders";

/// Dashboard order row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Order id
    pub id: u64,
    /// Owning clinic
    pub clinic: u32,
    /// Order total
    pub total_cents: i64,
    /// Fulfilment status
    pub status: String,
}

impl Entity for Order {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }
}

/// Shared order table
pub struct MemoryBackend {
    orders: Mutex<Vec<Order>>,
    next_id: AtomicU64,
    latency: Duration,
    fail_every: u64,
    reads: AtomicU64,
    writes: AtomicU64,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemoryBackend {
    /// Backend with `per_clinic` orders for each of `clinics` clinics
    pub fn seeded(clinics: u32, per_clinic: u64, latency: Duration, fail_every: u64) -> Arc<Self> {
        let mut orders = Vec::new();
        let mut id = 0;
        for clinic in 1..=clinics {
            for n in 0..per_clinic {
                id += 1;
                orders.push(Order {
                    id,
                    clinic,
                    total_cents: 1_000 + (n as i64) * 250,
                    status: "open".to_string(),
                });
            }
        }
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            orders: Mutex::new(orders),
            next_id: AtomicU64::new(id + 1),
            latency,
            fail_every,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            events,
        })
    }

    /// Receive change events for every write committed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Reserve an id for a client-created order
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Read queries served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Writes committed
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Orders of `clinic` in display order (newest first)
    pub async fn list_orders(&self, clinic: u32) -> Result<Vec<Order>, QueryError> {
        tokio::time::sleep(self.latency).await;
        let read = self.reads.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fail_every > 0 && read % self.fail_every == 0 {
            return Err(QueryError::backend("injected read failure"));
        }
        Ok(self.snapshot(clinic))
    }

    /// Orders of `clinic` without latency or injected failures
    pub fn snapshot(&self, clinic: u32) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .lock()
            .iter()
            .filter(|order| order.clinic == clinic)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.id.cmp(&a.id));
        orders
    }

    /// Insert `order`; fails if the id is taken
    pub async fn insert_order(&self, order: Order) -> Result<Order, QueryError> {
        tokio::time::sleep(self.latency).await;
        {
            let mut orders = self.orders.lock();
            if orders.iter().any(|o| o.id == order.id) {
                return Err(QueryError::backend(format!("order {} already exists", order.id)));
            }
            orders.push(order.clone());
        }
        self.commit(ChangeEvent::insert(&order)?);
        Ok(order)
    }

    /// Apply `changes` to order `id`
    pub async fn update_order(&self, id: u64, changes: &Changes) -> Result<Order, QueryError> {
        tokio::time::sleep(self.latency).await;
        let updated = {
            let mut orders = self.orders.lock();
            let Some(order) = orders.iter_mut().find(|o| o.id == id) else {
                return Err(QueryError::backend(format!("order {} not found", id)));
            };
            let mut fields = match serde_json::to_value(&*order).map_err(SyncError::from)? {
                Value::Object(fields) => fields,
                _ => return Err(QueryError::backend("order is not an object")),
            };
            for (field, value) in changes {
                fields.insert(field.clone(), value.clone());
            }
            *order = serde_json::from_value(Value::Object(fields)).map_err(QueryError::backend)?;
            order.clone()
        };
        self.commit(ChangeEvent::update(&updated)?);
        Ok(updated)
    }

    /// Delete order `id`
    pub async fn delete_order(&self, id: u64) -> Result<(), QueryError> {
        tokio::time::sleep(self.latency).await;
        let removed = {
            let mut orders = self.orders.lock();
            let before = orders.len();
            orders.retain(|o| o.id != id);
            orders.len() != before
        };
        if !removed {
            return Err(QueryError::backend(format!("order {} not found", id)));
        }
        self.commit(ChangeEvent::delete::<Order>(&id)?);
        Ok(())
    }

    fn commit(&self, event: ChangeEvent) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Pooled handle to the backend
pub struct BackendConn {
    id: usize,
    backend: Arc<MemoryBackend>,
}

impl BackendConn {
    /// Connection number `id`
    pub fn new(id: usize, backend: Arc<MemoryBackend>) -> Self {
        debug!(conn = id, "opened backend connection");
        Self { id, backend }
    }

    /// Connection number
    pub fn id(&self) -> usize {
        self.id
    }

    /// Backend this connection talks to
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }
}

/// Cache key of the orders query for `clinic`
pub fn orders_key(clinic: u32) -> Result<CacheKey, SyncError> {
    CacheKey::new("orders", &serde_json::json!({ "clinic": clinic }))
}

/// Fetches a clinic's orders through the query service
pub struct OrdersSource {
    service: Arc<QueryService<BackendConn>>,
    clinic: u32,
    retry: RetryPolicy,
}

impl OrdersSource {
    /// Source for `clinic`
    pub fn new(service: Arc<QueryService<BackendConn>>, clinic: u32, retry: RetryPolicy) -> Self {
        Self {
            service,
            clinic,
            retry,
        }
    }
}

#[async_trait]
impl DatasetSource<Order> for OrdersSource {
    async fn fetch(&self) -> dashcache::Result<Vec<Order>> {
        let key = orders_key(self.clinic)?;
        let options = QueryOptions::new().tag(ORDERS_TAG);
        let clinic = self.clinic;

        let orders = self
            .retry
            .run("list orders", || {
                self.service.read(&key, &options, move |conn| async move {
                    debug!(conn = conn.id(), clinic, "listing orders");
                    conn.backend().list_orders(clinic).await
                })
            })
            .await?;
        Ok(orders)
    }
}

/// Writes dataset edits through the query service
pub struct OrdersOps {
    service: Arc<QueryService<BackendConn>>,
}

impl OrdersOps {
    /// Persist through `service`
    pub fn new(service: Arc<QueryService<BackendConn>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl PersistenceOps<Order> for OrdersOps {
    async fn add(&self, item: &Order) -> dashcache::Result<Order> {
        let order = item.clone();
        self.service
            .write(&[ORDERS_TAG], |conn| async move { conn.backend().insert_order(order).await })
            .await
            .map_err(|e| SyncError::persistence(ORDERS_TAG, PersistOp::Add, e))
    }

    async fn update(&self, id: &u64, changes: &Changes) -> dashcache::Result<()> {
        let id = *id;
        self.service
            .write(&[ORDERS_TAG], |conn| async move { conn.backend().update_order(id, changes).await })
            .await
            .map(|_| ())
            .map_err(|e| SyncError::persistence(ORDERS_TAG, PersistOp::Update, e))
    }

    async fn remove(&self, id: &u64) -> dashcache::Result<()> {
        let id = *id;
        self.service
            .write(&[ORDERS_TAG], |conn| async move { conn.backend().delete_order(id).await })
            .await
            .map_err(|e| SyncError::persistence(ORDERS_TAG, PersistOp::Remove, e))
    }
}

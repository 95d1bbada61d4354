use crate::exchange::Exchange;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fnv::FnvBuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InflightError {
    #[error("Exchange '{exchange_id}' left route {route:?} without a matching add.")]
    Unbalanced {
        exchange_id: String,
        route: Option<String>,
    },
}

impl InflightError {
    #[inline]
    pub fn unbalanced(exchange_id: impl Into<String>, route: Option<&str>) -> Self {
        InflightError::Unbalanced {
            exchange_id: exchange_id.into(),
            route: route.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InflightKey {
    exchange_id: String,
    route_id: Option<String>,
}

#[derive(Debug)]
struct InflightEntry {
    count: usize,
    since: Instant,
    created: DateTime<Utc>,
}

/// Snapshot of one in-flight exchange.
#[derive(Debug, Clone)]
pub struct InflightExchange {
    pub exchange_id: String,
    pub route_id: Option<String>,
    pub created: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Live counters of exchanges currently being processed, overall and per route.
///
/// Every `add` must be balanced by exactly one `remove` for the same exchange and route.
/// A `remove` without a matching `add` is reported as an error instead of being clamped.
#[derive(Debug)]
pub struct InflightRepository {
    entries: DashMap<InflightKey, InflightEntry, FnvBuildHasher>,
    routes: DashMap<String, usize, FnvBuildHasher>,
    total: AtomicUsize,
}

impl InflightRepository {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(FnvBuildHasher::default()),
            routes: DashMap::with_hasher(FnvBuildHasher::default()),
            total: AtomicUsize::new(0),
        }
    }

    fn key(exchange: &Exchange, route_id: Option<&str>) -> InflightKey {
        InflightKey {
            exchange_id: exchange.id().to_string(),
            route_id: route_id.map(str::to_string),
        }
    }

    pub fn add(&self, exchange: &Exchange, route_id: Option<&str>) {
        let key = Self::key(exchange, route_id);
        self.entries
            .entry(key)
            .and_modify(|entry| entry.count += 1)
            .or_insert_with(|| InflightEntry {
                count: 1,
                since: Instant::now(),
                created: exchange.created(),
            });
        if let Some(route_id) = route_id {
            *self.routes.entry(route_id.to_string()).or_insert(0) += 1;
        }
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove(&self, exchange: &Exchange, route_id: Option<&str>) -> Result<(), InflightError> {
        let key = Self::key(exchange, route_id);
        match self.entries.entry(key) {
            Entry::Vacant(_) => {
                log::error!(
                    "Inflight count for exchange '{}' on route {:?} would go negative",
                    exchange.id(),
                    route_id
                );
                return Err(InflightError::unbalanced(exchange.id(), route_id));
            }
            Entry::Occupied(mut entry) => {
                if entry.get().count <= 1 {
                    entry.remove();
                } else {
                    entry.get_mut().count -= 1;
                }
            }
        }
        if let Some(route_id) = route_id {
            if let Entry::Occupied(mut count) = self.routes.entry(route_id.to_string()) {
                if *count.get() <= 1 {
                    count.remove();
                } else {
                    *count.get_mut() -= 1;
                }
            }
        }
        self.total.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn route_size(&self, route_id: &str) -> usize {
        self.routes.get(route_id).map(|count| *count).unwrap_or(0)
    }

    /// Removes the counters of a route that is being discarded.
    pub fn remove_route(&self, route_id: &str) {
        self.routes.remove(route_id);
    }

    /// In-flight exchanges, oldest first. `None` lists every route.
    pub fn browse(&self, route_id: Option<&str>) -> Vec<InflightExchange> {
        let mut found: Vec<(Instant, InflightExchange)> = self
            .entries
            .iter()
            .filter(|entry| route_id.is_none() || entry.key().route_id.as_deref() == route_id)
            .map(|entry| {
                (
                    entry.since,
                    InflightExchange {
                        exchange_id: entry.key().exchange_id.clone(),
                        route_id: entry.key().route_id.clone(),
                        created: entry.created,
                        elapsed: entry.since.elapsed(),
                    },
                )
            })
            .collect();
        found.sort_by_key(|(since, _)| *since);
        found.into_iter().map(|(_, exchange)| exchange).collect()
    }

    pub fn oldest(&self, route_id: Option<&str>) -> Option<InflightExchange> {
        self.browse(route_id).into_iter().next()
    }

    fn pending(&self, route_id: Option<&str>) -> usize {
        match route_id {
            Some(route_id) => self.route_size(route_id),
            None => self.size(),
        }
    }

    /// Waits until nothing is in flight for the route (or overall), polling until `timeout`
    /// elapses. Returns whether the repository drained.
    pub async fn wait_drained(&self, route_id: Option<&str>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending(route_id) == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let pause = Duration::from_millis(10).min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }
}

impl Default for InflightRepository {
    fn default() -> Self {
        Self::new()
    }
}

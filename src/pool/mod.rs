pub mod consumer;
pub mod producer;

use crate::cache::BoundedCache;
use crate::endpoint::{EndpointError, EndpointKey};
use crate::polling::PollError;
use crate::processor::DispatchError;
use crate::service::{Service, ServiceError, ServiceSupport};
use crate::status::ServiceStatus;
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

pub use consumer::{ConsumerCache, ConsumerLease};
pub use producer::{ProducerCache, ProducerLease};

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Failed to create {kind} for endpoint '{endpoint}'.")]
    Creation {
        endpoint: String,
        kind: &'static str,
        #[source]
        source: EndpointError,
    },

    #[error("Failed to start {kind} for endpoint '{endpoint}'.")]
    Start {
        endpoint: String,
        kind: &'static str,
        #[source]
        source: ServiceError,
    },

    #[error("All {capacity} pooled {kind}(s) for endpoint '{endpoint}' are in use.")]
    Exhausted {
        endpoint: String,
        kind: &'static str,
        capacity: usize,
    },

    #[error("Timed out after {timeout:?} waiting for a pooled {kind} of endpoint '{endpoint}'.")]
    AcquireTimeout {
        endpoint: String,
        kind: &'static str,
        timeout: Duration,
    },

    #[error("The {kind} cache is not started.")]
    NotStarted { kind: &'static str },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Poll(#[from] PollError),
}

impl ResourceError {
    #[inline]
    pub fn creation(key: &EndpointKey, kind: &'static str, source: EndpointError) -> Self {
        ResourceError::Creation {
            endpoint: key.to_string(),
            kind,
            source,
        }
    }

    #[inline]
    pub fn start(key: &EndpointKey, kind: &'static str, source: ServiceError) -> Self {
        ResourceError::Start {
            endpoint: key.to_string(),
            kind,
            source,
        }
    }

    #[inline]
    pub fn exhausted(key: &EndpointKey, kind: &'static str, capacity: usize) -> Self {
        ResourceError::Exhausted {
            endpoint: key.to_string(),
            kind,
            capacity,
        }
    }

    #[inline]
    pub fn acquire_timeout(key: &EndpointKey, kind: &'static str, timeout: Duration) -> Self {
        ResourceError::AcquireTimeout {
            endpoint: key.to_string(),
            kind,
            timeout,
        }
    }

    #[inline]
    pub const fn not_started(kind: &'static str) -> Self {
        ResourceError::NotStarted { kind }
    }
}

/// What an acquire does when every pooled instance of a key is checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedPolicy {
    /// Fail immediately with [`ResourceError::Exhausted`].
    #[default]
    Fail,
    /// Wait for a release, optionally bounded.
    Block { timeout: Option<Duration> },
    /// Hand out an extra instance that is stopped again on release.
    CreateUnpooled,
}

/// Sizing of a pooled cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Number of endpoint keys tracked before the least recently used one is evicted.
    pub maximum_cache_size: usize,
    /// Live pooled instances per endpoint key.
    pub capacity: usize,
    pub exhausted_policy: ExhaustedPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            maximum_cache_size: 1000,
            capacity: 100,
            exhausted_policy: ExhaustedPolicy::Fail,
        }
    }
}

fn infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

fn same_instance<S: ?Sized>(left: &Arc<S>, right: &Arc<S>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(left), Arc::as_ptr(right))
}

fn stop_instance<S: Service + ?Sized>(key: &EndpointKey, kind: &'static str, instance: &S) {
    if let Err(e) = instance.stop() {
        log::warn!("Failed to stop {} for endpoint '{}': {}", kind, key, e);
    }
}

fn stop_and_shutdown<S: Service + ?Sized>(key: &EndpointKey, kind: &'static str, instance: &S) {
    stop_instance(key, kind, instance);
    if let Err(e) = instance.shutdown() {
        log::warn!("Failed to shut down {} for endpoint '{}': {}", kind, key, e);
    }
}

/// Pooled instances of one endpoint key.
///
/// The semaphore holds one permit per allowed live instance. A permit is taken before an
/// instance is checked out or created and is given back only after the instance has been
/// returned to the idle list, so the capacity check and the checkout are one decision.
///
/// An evicted pool is retired rather than dropped while it still has permits out: it keeps
/// its semaphore until every checked out instance is back, and is reinstated if its key is
/// used again in the meantime.
struct KeyPool<S: ?Sized> {
    key: EndpointKey,
    capacity: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Arc<S>>>,
    live: AtomicUsize,
    closed: AtomicBool,
    retired: AtomicBool,
}

impl<S> KeyPool<S>
where
    S: Service + ?Sized,
{
    fn new(key: EndpointKey, capacity: usize) -> Self {
        Self {
            key,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    /// Permits held by checked out instances and by checkouts in progress.
    fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    fn pop_idle(&self) -> Option<Arc<S>> {
        self.idle.lock().pop()
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn forget(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Stops idle instances and refuses further checkouts. Checked out instances are left
    /// running and are stopped when their lease ends.
    fn close(&self, kind: &'static str) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        self.stop_idle(kind);
    }

    fn stop_idle(&self, kind: &'static str) {
        let idle = std::mem::take(&mut *self.idle.lock());
        for instance in idle {
            self.forget();
            stop_and_shutdown(&self.key, kind, instance.as_ref());
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops idle instances. Permits stay valid, so instances still checked out keep
    /// counting against the capacity; they are stopped on release.
    fn retire(&self, kind: &'static str) {
        self.retired.store(true, Ordering::Release);
        self.stop_idle(kind);
    }

    fn reinstate(&self) {
        self.retired.store(false, Ordering::Release);
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// Singletons evicted while still referenced. Each is stopped once nothing but this list
/// holds it.
struct Orphans<S: ?Sized> {
    kind: &'static str,
    entries: Mutex<Vec<(EndpointKey, Arc<S>)>>,
}

impl<S> Orphans<S>
where
    S: Service + ?Sized,
{
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(Vec::new()),
        }
    }

    fn adopt(&self, key: &EndpointKey, instance: Arc<S>) {
        self.entries.lock().push((key.clone(), instance));
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Stops every orphan nobody references any more. `releasing` is the instance of a lease
    /// being released, whose reference does not count.
    fn sweep(&self, releasing: Option<&Arc<S>>) {
        let unused: Vec<(EndpointKey, Arc<S>)> = {
            let mut entries = self.entries.lock();
            let (unused, kept): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *entries)
                    .into_iter()
                    .partition(|(_, instance)| {
                        let held = releasing.is_some_and(|lease| same_instance(lease, instance));
                        Arc::strong_count(instance) - usize::from(held) == 1
                    });
            *entries = kept;
            unused
        };
        for (key, instance) in unused {
            log::debug!("Stopping evicted singleton {} for endpoint '{}'", self.kind, key);
            stop_and_shutdown(&key, self.kind, instance.as_ref());
        }
    }

    fn stop_all(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        for (key, instance) in entries {
            stop_and_shutdown(&key, self.kind, instance.as_ref());
        }
    }
}

enum LeaseKind<S: ?Sized> {
    Pooled {
        pool: Arc<KeyPool<S>>,
        permit: OwnedSemaphorePermit,
    },
    Shared {
        orphans: Arc<Orphans<S>>,
    },
    Unpooled,
    Transient,
}

/// An instance checked out of a [`ResourceCache`].
///
/// Dropping the lease releases it: pooled instances go back to their pool, singletons stay
/// shared, and unpooled or uncached instances are stopped and shut down.
pub struct Lease<S>
where
    S: Service + ?Sized,
{
    key: EndpointKey,
    kind_name: &'static str,
    resource: Arc<S>,
    kind: Option<LeaseKind<S>>,
}

impl<S> Lease<S>
where
    S: Service + ?Sized,
{
    fn new(key: &EndpointKey, kind_name: &'static str, resource: Arc<S>, kind: LeaseKind<S>) -> Self {
        Self {
            key: key.clone(),
            kind_name,
            resource,
            kind: Some(kind),
        }
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn resource(&self) -> &Arc<S> {
        &self.resource
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.kind, Some(LeaseKind::Pooled { .. }))
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.kind, Some(LeaseKind::Shared { .. }))
    }

    /// Returns the instance to its cache.
    pub fn release(mut self) {
        self.finish(false);
    }

    /// Stops the instance instead of returning it, e.g. after it failed. Shared singletons
    /// are left running.
    pub fn discard(mut self) {
        self.finish(true);
    }

    fn finish(&mut self, discard: bool) {
        let Some(kind) = self.kind.take() else {
            return;
        };
        match kind {
            LeaseKind::Pooled { pool, permit } => {
                let reusable = !discard
                    && !pool.is_closed()
                    && !pool.is_retired()
                    && self.resource.status().is_started();
                if reusable {
                    pool.idle.lock().push(self.resource.clone());
                } else {
                    pool.forget();
                    stop_and_shutdown(&self.key, self.kind_name, self.resource.as_ref());
                }
                drop(permit);
            }
            LeaseKind::Shared { orphans } => orphans.sweep(Some(&self.resource)),
            LeaseKind::Unpooled | LeaseKind::Transient => {
                stop_and_shutdown(&self.key, self.kind_name, self.resource.as_ref());
            }
        }
    }
}

impl<S> Deref for Lease<S>
where
    S: Service + ?Sized,
{
    type Target = S;

    fn deref(&self) -> &S {
        &self.resource
    }
}

impl<S> Drop for Lease<S>
where
    S: Service + ?Sized,
{
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl<S> Debug for Lease<S>
where
    S: Service + ?Sized,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            Some(LeaseKind::Pooled { .. }) => "pooled",
            Some(LeaseKind::Shared { .. }) => "shared",
            Some(LeaseKind::Unpooled) => "unpooled",
            Some(LeaseKind::Transient) => "transient",
            None => "released",
        };
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("kind", &kind)
            .finish()
    }
}

struct Pools<S: ?Sized> {
    capacity: usize,
    policy: ExhaustedPolicy,
    singletons: BoundedCache<EndpointKey, Arc<S>>,
    pools: BoundedCache<EndpointKey, Arc<KeyPool<S>>>,
    draining: Arc<DashMap<EndpointKey, Arc<KeyPool<S>>, FnvBuildHasher>>,
    orphans: Arc<Orphans<S>>,
}

/// Keyed cache of started service instances, shared by the producer and consumer caches.
///
/// Instances reporting [`Service::is_singleton`] are kept once per key and shared. Other
/// instances are pooled per key, at most `capacity` live instances each. Both maps are
/// bounded LRU caches; eviction stops only instances nobody is using.
///
/// The empty variant (see [`ResourceCache::empty`]) caches nothing: every acquire creates
/// and starts a fresh instance, every release stops and shuts it down.
pub struct ResourceCache<S>
where
    S: Service + ?Sized,
{
    kind: &'static str,
    support: ServiceSupport,
    pools: Option<Pools<S>>,
}

impl<S> ResourceCache<S>
where
    S: Service + ?Sized + 'static,
{
    pub fn new(kind: &'static str, settings: PoolSettings) -> Self {
        if settings.maximum_cache_size == 0 || settings.capacity == 0 {
            return Self::empty(kind);
        }
        let orphans = Arc::new(Orphans::new(kind));
        let draining: Arc<DashMap<EndpointKey, Arc<KeyPool<S>>, FnvBuildHasher>> =
            Arc::new(DashMap::with_hasher(FnvBuildHasher::default()));
        let singletons = BoundedCache::new("singletons", settings.maximum_cache_size)
            .with_eviction_listener({
                let orphans = orphans.clone();
                move |key: &EndpointKey, instance: Arc<S>| {
                    if Arc::strong_count(&instance) == 1 {
                        log::debug!("Evicted singleton {} for endpoint '{}'", kind, key);
                        stop_and_shutdown(key, kind, instance.as_ref());
                    } else {
                        log::debug!(
                            "Evicted singleton {} for endpoint '{}' is in use, stopping it once released",
                            kind,
                            key
                        );
                        orphans.adopt(key, instance);
                    }
                }
            });
        let pools = BoundedCache::new("pools", settings.maximum_cache_size)
            .with_eviction_listener({
                let draining = draining.clone();
                move |key: &EndpointKey, pool: Arc<KeyPool<S>>| {
                    pool.retire(kind);
                    let in_use = pool.in_use();
                    if in_use > 0 {
                        log::debug!(
                            "Evicted {} pool for endpoint '{}' has {} instance(s) checked out",
                            kind,
                            key,
                            in_use
                        );
                        draining.insert(key.clone(), pool);
                    } else {
                        log::debug!("Evicted {} pool for endpoint '{}'", kind, key);
                    }
                    draining.retain(|_, pool| pool.in_use() > 0);
                }
            });
        Self {
            kind,
            support: ServiceSupport::new(format!("{}-cache", kind)),
            pools: Some(Pools {
                capacity: settings.capacity,
                policy: settings.exhausted_policy,
                singletons,
                pools,
                draining,
                orphans,
            }),
        }
    }

    pub fn empty(kind: &'static str) -> Self {
        Self {
            kind,
            support: ServiceSupport::new(format!("empty-{}-cache", kind)),
            pools: None,
        }
    }

    pub fn is_empty_variant(&self) -> bool {
        self.pools.is_none()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.pools.as_ref().map(|pools| pools.capacity).unwrap_or(0)
    }

    fn ensure_started(&self) -> Result<(), ResourceError> {
        if self.support.status().is_started() {
            Ok(())
        } else {
            Err(ResourceError::not_started(self.kind))
        }
    }

    fn create_started<F>(&self, key: &EndpointKey, create: F) -> Result<Arc<S>, ResourceError>
    where
        F: FnOnce() -> Result<Arc<S>, EndpointError>,
    {
        let instance = create().map_err(|e| ResourceError::creation(key, self.kind, e))?;
        Self::start_instance(self.kind, key, &instance)?;
        Ok(instance)
    }

    fn start_instance(kind: &'static str, key: &EndpointKey, instance: &Arc<S>) -> Result<(), ResourceError> {
        if instance.status().is_started() {
            return Ok(());
        }
        instance
            .start()
            .map_err(|e| ResourceError::start(key, kind, e))
    }

    fn pool_for(&self, pools: &Pools<S>, key: &EndpointKey) -> Arc<KeyPool<S>> {
        infallible(pools.pools.get_or_resolve(key.clone(), |key| {
            if let Some((_, pool)) = pools.draining.remove(key) {
                log::debug!(
                    "Reinstating {} pool for endpoint '{}' with {} instance(s) checked out",
                    self.kind,
                    key,
                    pool.in_use()
                );
                pool.reinstate();
                return Ok(pool);
            }
            log::debug!("Creating {} pool for endpoint '{}'", self.kind, key);
            Ok(Arc::new(KeyPool::new(key.clone(), pools.capacity)))
        }))
    }

    fn shared_lease(pools: &Pools<S>, key: &EndpointKey, kind: &'static str, shared: Arc<S>) -> Lease<S> {
        let orphans = pools.orphans.clone();
        Lease::new(key, kind, shared, LeaseKind::Shared { orphans })
    }

    fn share(&self, pools: &Pools<S>, key: &EndpointKey, instance: Arc<S>) -> Lease<S> {
        let shared = pools.singletons.insert_if_absent(key.clone(), instance.clone());
        if !same_instance(&shared, &instance) {
            stop_and_shutdown(key, self.kind, instance.as_ref());
        }
        Self::shared_lease(pools, key, self.kind, shared)
    }

    fn checkout<F>(
        &self,
        pools: &Pools<S>,
        key: &EndpointKey,
        pool: Arc<KeyPool<S>>,
        permit: OwnedSemaphorePermit,
        create: F,
    ) -> Result<Lease<S>, ResourceError>
    where
        F: FnOnce() -> Result<Arc<S>, EndpointError>,
    {
        while let Some(idle) = pool.pop_idle() {
            if idle.status().is_started() {
                return Ok(Lease::new(
                    key,
                    self.kind,
                    idle,
                    LeaseKind::Pooled { pool, permit },
                ));
            }
            pool.forget();
            stop_and_shutdown(key, self.kind, idle.as_ref());
        }

        let instance = self.create_started(key, create)?;
        if instance.is_singleton() {
            drop(permit);
            if pool.live.load(Ordering::Acquire) == 0 {
                pools.pools.remove(key);
            }
            return Ok(self.share(pools, key, instance));
        }
        pool.live.fetch_add(1, Ordering::AcqRel);
        log::debug!(
            "Created pooled {} for endpoint '{}' ({}/{})",
            self.kind,
            key,
            pool.live.load(Ordering::Acquire),
            pool.capacity
        );
        Ok(Lease::new(
            key,
            self.kind,
            instance,
            LeaseKind::Pooled { pool, permit },
        ))
    }

    fn unpooled<F>(&self, key: &EndpointKey, create: F) -> Result<Lease<S>, ResourceError>
    where
        F: FnOnce() -> Result<Arc<S>, EndpointError>,
    {
        let instance = self.create_started(key, create)?;
        log::debug!(
            "Pool for endpoint '{}' is exhausted, created an unpooled {}",
            key,
            self.kind
        );
        Ok(Lease::new(key, self.kind, instance, LeaseKind::Unpooled))
    }

    fn transient<F>(&self, key: &EndpointKey, create: F) -> Result<Lease<S>, ResourceError>
    where
        F: FnOnce() -> Result<Arc<S>, EndpointError>,
    {
        let instance = self.create_started(key, create)?;
        Ok(Lease::new(key, self.kind, instance, LeaseKind::Transient))
    }

    /// Acquires an instance without waiting.
    ///
    /// Returns `Ok(None)` when the key's pool is exhausted and the policy is
    /// [`ExhaustedPolicy::Block`]; the caller should retry with [`ResourceCache::acquire`].
    pub fn try_acquire<F>(
        &self,
        key: &EndpointKey,
        create: F,
    ) -> Result<Option<Lease<S>>, ResourceError>
    where
        F: FnOnce() -> Result<Arc<S>, EndpointError>,
    {
        self.ensure_started()?;
        let Some(pools) = &self.pools else {
            return self.transient(key, create).map(Some);
        };
        if let Some(shared) = pools.singletons.get(key) {
            return Ok(Some(Self::shared_lease(pools, key, self.kind, shared)));
        }
        let pool = self.pool_for(pools, key);
        match pool.permits.clone().try_acquire_owned() {
            Ok(permit) => self.checkout(pools, key, pool, permit, create).map(Some),
            Err(TryAcquireError::Closed) => Err(ResourceError::not_started(self.kind)),
            Err(TryAcquireError::NoPermits) => match pools.policy {
                ExhaustedPolicy::Fail => {
                    Err(ResourceError::exhausted(key, self.kind, pools.capacity))
                }
                ExhaustedPolicy::CreateUnpooled => self.unpooled(key, create).map(Some),
                ExhaustedPolicy::Block { .. } => Ok(None),
            },
        }
    }

    /// Acquires an instance, waiting for a release when the pool is exhausted and the
    /// policy is [`ExhaustedPolicy::Block`].
    pub async fn acquire<F>(&self, key: &EndpointKey, create: F) -> Result<Lease<S>, ResourceError>
    where
        F: FnOnce() -> Result<Arc<S>, EndpointError>,
    {
        self.ensure_started()?;
        let Some(pools) = &self.pools else {
            return self.transient(key, create);
        };
        if let Some(shared) = pools.singletons.get(key) {
            return Ok(Self::shared_lease(pools, key, self.kind, shared));
        }
        let pool = self.pool_for(pools, key);
        let permit = match pool.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(ResourceError::not_started(self.kind)),
            Err(TryAcquireError::NoPermits) => match pools.policy {
                ExhaustedPolicy::Fail => {
                    return Err(ResourceError::exhausted(key, self.kind, pools.capacity));
                }
                ExhaustedPolicy::CreateUnpooled => return self.unpooled(key, create),
                ExhaustedPolicy::Block { timeout } => {
                    log::trace!("Waiting for a pooled {} of endpoint '{}'", self.kind, key);
                    let waiting = pool.permits.clone().acquire_owned();
                    let acquired = match timeout {
                        Some(timeout) => tokio::time::timeout(timeout, waiting)
                            .await
                            .map_err(|_| ResourceError::acquire_timeout(key, self.kind, timeout))?,
                        None => waiting.await,
                    };
                    acquired.map_err(|_| ResourceError::not_started(self.kind))?
                }
            },
        };
        self.checkout(pools, key, pool, permit, create)
    }

    /// Registers a pre-built instance with the cache and checks it out.
    ///
    /// The instance always joins the key's pool (or the singleton map), so releasing the
    /// returned lease makes it available to later acquires. Never waits: an exhausted pool
    /// fails unless the policy creates unpooled instances.
    pub fn add_and_acquire(&self, key: &EndpointKey, instance: Arc<S>) -> Result<Lease<S>, ResourceError> {
        self.ensure_started()?;
        Self::start_instance(self.kind, key, &instance)?;
        let Some(pools) = &self.pools else {
            return Ok(Lease::new(key, self.kind, instance, LeaseKind::Transient));
        };
        if instance.is_singleton() {
            return Ok(self.share(pools, key, instance));
        }
        let pool = self.pool_for(pools, key);
        match pool.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                pool.live.fetch_add(1, Ordering::AcqRel);
                Ok(Lease::new(key, self.kind, instance, LeaseKind::Pooled { pool, permit }))
            }
            Err(TryAcquireError::Closed) => Err(ResourceError::not_started(self.kind)),
            Err(TryAcquireError::NoPermits) => match pools.policy {
                ExhaustedPolicy::CreateUnpooled => {
                    Ok(Lease::new(key, self.kind, instance, LeaseKind::Unpooled))
                }
                _ => Err(ResourceError::exhausted(key, self.kind, pools.capacity)),
            },
        }
    }

    /// Idle pooled instances for `key`, plus the singleton if one is cached.
    pub fn pool_size(&self, key: &EndpointKey) -> usize {
        let Some(pools) = &self.pools else {
            return 0;
        };
        let singleton = usize::from(pools.singletons.contains(key));
        let idle = pools
            .pools
            .peek(key)
            .map(|pool| pool.idle_count())
            .unwrap_or(0);
        singleton + idle
    }

    /// Live pooled instances for `key`, idle or checked out, including those of an evicted
    /// pool that are not back yet.
    pub fn live_count(&self, key: &EndpointKey) -> usize {
        let Some(pools) = &self.pools else {
            return 0;
        };
        pools
            .pools
            .peek(key)
            .or_else(|| pools.draining.get(key).map(|pool| pool.value().clone()))
            .map(|pool| pool.live.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Evicted singletons still waiting for their last lease.
    pub fn orphan_count(&self) -> usize {
        self.pools
            .as_ref()
            .map(|pools| pools.orphans.len())
            .unwrap_or(0)
    }

    /// Cached instances over all keys: singletons plus idle pooled instances.
    pub fn size(&self) -> usize {
        let Some(pools) = &self.pools else {
            return 0;
        };
        let idle: usize = pools.pools.values().iter().map(|pool| pool.idle_count()).sum();
        pools.singletons.len() + idle
    }

    fn clear(&self) {
        let Some(pools) = &self.pools else {
            return;
        };
        for (key, instance) in pools.singletons.drain() {
            stop_and_shutdown(&key, self.kind, instance.as_ref());
        }
        for (_, pool) in pools.pools.drain() {
            pool.close(self.kind);
        }
        let draining: Vec<Arc<KeyPool<S>>> = pools
            .draining
            .iter()
            .map(|pool| pool.value().clone())
            .collect();
        pools.draining.clear();
        for pool in draining {
            pool.close(self.kind);
        }
        pools.orphans.stop_all();
    }
}

impl<S> Service for ResourceCache<S>
where
    S: Service + ?Sized + 'static,
{
    fn start(&self) -> Result<(), ServiceError> {
        self.support.start_with(|| Ok(()))
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.support.stop_with(|| {
            self.clear();
            Ok(())
        })
    }

    fn status(&self) -> ServiceStatus {
        self.support.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockService;

    fn key(uri: &str) -> EndpointKey {
        EndpointKey::parse(uri).unwrap()
    }

    fn started_cache(capacity: usize, policy: ExhaustedPolicy) -> ResourceCache<MockService> {
        let cache = ResourceCache::new(
            "service",
            PoolSettings {
                maximum_cache_size: 10,
                capacity,
                exhausted_policy: policy,
            },
        );
        cache.start().unwrap();
        cache
    }

    fn factory() -> impl FnOnce() -> Result<Arc<MockService>, EndpointError> {
        || Ok(Arc::new(MockService::new("pooled")))
    }

    #[test]
    fn test_acquire_release_reuses_instance() {
        let cache = started_cache(2, ExhaustedPolicy::Fail);
        let key = key("mock:a");

        let warm = cache.try_acquire(&key, factory()).unwrap().unwrap();
        let first = warm.resource().clone();
        warm.release();
        let before = cache.pool_size(&key);

        let lease = cache.try_acquire(&key, factory()).unwrap().unwrap();
        assert!(Arc::ptr_eq(lease.resource(), &first));
        lease.release();
        assert_eq!(cache.pool_size(&key), before);
        assert_eq!(cache.live_count(&key), 1);
        assert!(first.status().is_started());
    }

    #[test]
    fn test_fail_policy_never_exceeds_capacity() {
        let cache = started_cache(2, ExhaustedPolicy::Fail);
        let key = key("mock:a");
        let a = cache.try_acquire(&key, factory()).unwrap().unwrap();
        let b = cache.try_acquire(&key, factory()).unwrap().unwrap();
        let err = cache.try_acquire(&key, factory()).unwrap_err();
        assert!(matches!(err, ResourceError::Exhausted { capacity: 2, .. }));
        assert_eq!(cache.live_count(&key), 2);
        drop(a);
        drop(b);
        assert_eq!(cache.pool_size(&key), 2);
    }

    #[test]
    fn test_create_unpooled_policy() {
        let cache = started_cache(1, ExhaustedPolicy::CreateUnpooled);
        let key = key("mock:a");
        let pooled = cache.try_acquire(&key, factory()).unwrap().unwrap();
        let extra = cache.try_acquire(&key, factory()).unwrap().unwrap();
        assert!(pooled.is_pooled());
        assert!(!extra.is_pooled());
        let extra_instance = extra.resource().clone();
        extra.release();
        assert!(extra_instance.status().is_stopped());
        assert_eq!(extra_instance.shutdowns(), 1);
        assert_eq!(cache.live_count(&key), 1);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_release() {
        let cache = Arc::new(started_cache(1, ExhaustedPolicy::Block { timeout: None }));
        let key = key("mock:a");
        let held = cache.acquire(&key, factory()).await.unwrap();
        let first = held.resource().clone();
        assert!(cache.try_acquire(&key, factory()).unwrap().is_none());

        let waiter = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let lease = cache.acquire(&key, factory()).await.unwrap();
                lease.resource().clone()
            })
        };
        tokio::task::yield_now().await;
        held.release();
        let second = waiter.await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.live_count(&key), 1);
    }

    #[tokio::test]
    async fn test_block_policy_timeout() {
        let cache = started_cache(
            1,
            ExhaustedPolicy::Block {
                timeout: Some(Duration::from_millis(20)),
            },
        );
        let key = key("mock:a");
        let _held = cache.acquire(&key, factory()).await.unwrap();
        let err = cache.acquire(&key, factory()).await.unwrap_err();
        assert!(matches!(err, ResourceError::AcquireTimeout { .. }));
    }

    #[test]
    fn test_singletons_are_shared() {
        let cache = started_cache(1, ExhaustedPolicy::Fail);
        let key = key("mock:single");
        let create = || -> Result<Arc<MockService>, EndpointError> {
            Ok(Arc::new(MockService::singleton("single")))
        };
        let a = cache.try_acquire(&key, create).unwrap().unwrap();
        let b = cache.try_acquire(&key, create).unwrap().unwrap();
        assert!(a.is_shared());
        assert!(Arc::ptr_eq(a.resource(), b.resource()));
        assert_eq!(cache.pool_size(&key), 1);
        assert_eq!(cache.live_count(&key), 0);
    }

    #[test]
    fn test_empty_variant_creates_and_stops() {
        let cache: ResourceCache<MockService> = ResourceCache::empty("service");
        cache.start().unwrap();
        let key = key("mock:a");
        let lease = cache.try_acquire(&key, factory()).unwrap().unwrap();
        let instance = lease.resource().clone();
        assert!(instance.status().is_started());
        lease.release();
        assert!(instance.status().is_stopped());
        assert_eq!(instance.shutdowns(), 1);

        let again = cache.try_acquire(&key, factory()).unwrap().unwrap();
        assert!(!Arc::ptr_eq(again.resource(), &instance));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_zero_capacity_selects_empty_variant() {
        let cache: ResourceCache<MockService> = ResourceCache::new(
            "service",
            PoolSettings {
                capacity: 0,
                ..Default::default()
            },
        );
        assert!(cache.is_empty_variant());
    }

    #[test]
    fn test_creation_failure_is_distinct_and_frees_permit() {
        let cache = started_cache(1, ExhaustedPolicy::Fail);
        let key = key("mock:broken");
        let err = cache
            .try_acquire(&key, || {
                Err(EndpointError::creation(
                    &EndpointKey::parse("mock:broken").unwrap(),
                    "service",
                    std::io::Error::other("refused"),
                ))
            })
            .unwrap_err();
        assert!(matches!(err, ResourceError::Creation { .. }));
        assert!(cache.try_acquire(&key, factory()).unwrap().is_some());
    }

    #[test]
    fn test_add_and_acquire_enqueues() {
        let cache = started_cache(2, ExhaustedPolicy::Fail);
        let key = key("mock:a");
        let prebuilt = Arc::new(MockService::new("prebuilt"));
        let lease = cache.add_and_acquire(&key, prebuilt.clone()).unwrap();
        assert!(prebuilt.status().is_started());
        lease.release();
        assert_eq!(cache.pool_size(&key), 1);
        let reused = cache.try_acquire(&key, factory()).unwrap().unwrap();
        assert!(Arc::ptr_eq(reused.resource(), &prebuilt));
    }

    #[test]
    fn test_not_started_and_stop() {
        let cache: ResourceCache<MockService> = ResourceCache::new("service", PoolSettings::default());
        let key = key("mock:a");
        assert!(matches!(
            cache.try_acquire(&key, factory()),
            Err(ResourceError::NotStarted { .. })
        ));

        cache.start().unwrap();
        let busy = cache.try_acquire(&key, factory()).unwrap().unwrap();
        let busy_instance = busy.resource().clone();
        let idle = cache.try_acquire(&key, factory()).unwrap().unwrap();
        let idle_instance = idle.resource().clone();
        idle.release();

        cache.stop().unwrap();
        assert!(idle_instance.status().is_stopped());
        assert!(busy_instance.status().is_started());
        busy.release();
        assert!(busy_instance.status().is_stopped());
        assert!(matches!(
            cache.try_acquire(&key, factory()),
            Err(ResourceError::NotStarted { .. })
        ));
    }

    #[test]
    fn test_eviction_stops_only_idle() {
        let cache = ResourceCache::<MockService>::new(
            "service",
            PoolSettings {
                maximum_cache_size: 1,
                capacity: 2,
                exhausted_policy: ExhaustedPolicy::Fail,
            },
        );
        cache.start().unwrap();
        let a = key("mock:a");
        let idle = cache.try_acquire(&a, factory()).unwrap().unwrap();
        let busy = cache.try_acquire(&a, factory()).unwrap().unwrap();
        let idle_instance = idle.resource().clone();
        let busy_instance = busy.resource().clone();
        idle.release();

        let _other = cache.try_acquire(&key("mock:b"), factory()).unwrap().unwrap();
        assert!(idle_instance.status().is_stopped());
        assert!(busy_instance.status().is_started());
        busy.release();
        assert!(busy_instance.status().is_stopped());
    }

    #[test]
    fn test_eviction_keeps_capacity_of_busy_key() {
        let cache = ResourceCache::<MockService>::new(
            "service",
            PoolSettings {
                maximum_cache_size: 1,
                capacity: 1,
                exhausted_policy: ExhaustedPolicy::Fail,
            },
        );
        cache.start().unwrap();
        let a = key("mock:a");
        let held = cache.try_acquire(&a, factory()).unwrap().unwrap();
        let held_instance = held.resource().clone();

        let _b = cache.try_acquire(&key("mock:b"), factory()).unwrap().unwrap();
        assert_eq!(cache.live_count(&a), 1);
        assert!(matches!(
            cache.try_acquire(&a, factory()),
            Err(ResourceError::Exhausted { capacity: 1, .. })
        ));
        assert_eq!(cache.live_count(&a), 1);

        held.release();
        let again = cache.try_acquire(&a, factory()).unwrap().unwrap();
        assert!(Arc::ptr_eq(again.resource(), &held_instance));
        assert_eq!(cache.live_count(&a), 1);
    }

    struct WatchedSingleton {
        inner: MockService,
        stopped: Arc<AtomicBool>,
    }

    impl Service for WatchedSingleton {
        fn start(&self) -> Result<(), ServiceError> {
            self.inner.start()
        }

        fn stop(&self) -> Result<(), ServiceError> {
            self.stopped.store(true, Ordering::SeqCst);
            self.inner.stop()
        }

        fn status(&self) -> ServiceStatus {
            self.inner.status()
        }

        fn is_singleton(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_evicted_singleton_stops_after_last_lease() {
        let cache = ResourceCache::<WatchedSingleton>::new(
            "service",
            PoolSettings {
                maximum_cache_size: 1,
                capacity: 1,
                exhausted_policy: ExhaustedPolicy::Fail,
            },
        );
        cache.start().unwrap();
        let stopped = Arc::new(AtomicBool::new(false));
        let watched = {
            let stopped = stopped.clone();
            move || -> Result<Arc<WatchedSingleton>, EndpointError> {
                Ok(Arc::new(WatchedSingleton {
                    inner: MockService::new("watched"),
                    stopped,
                }))
            }
        };
        let unwatched = || -> Result<Arc<WatchedSingleton>, EndpointError> {
            Ok(Arc::new(WatchedSingleton {
                inner: MockService::new("other"),
                stopped: Arc::new(AtomicBool::new(false)),
            }))
        };

        let first = cache.try_acquire(&key("mock:a"), watched).unwrap().unwrap();
        let second = cache.try_acquire(&key("mock:a"), unwatched).unwrap().unwrap();
        let _other = cache.try_acquire(&key("mock:b"), unwatched).unwrap().unwrap();
        assert_eq!(cache.orphan_count(), 1);
        assert!(!stopped.load(Ordering::SeqCst));

        first.release();
        assert!(!stopped.load(Ordering::SeqCst));
        second.release();
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(cache.orphan_count(), 0);
    }
}

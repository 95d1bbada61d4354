use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to build thread pool '{name}'.")]
    Build {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Thread pool profile '{profile}' is invalid. {message}")]
    InvalidProfile { profile: String, message: String },

    #[error("Executor strategy is shut down, cannot create thread pool '{name}'.")]
    ShutDown { name: String },
}

impl ExecutorError {
    #[inline]
    pub fn build(name: impl Into<String>, source: std::io::Error) -> Self {
        ExecutorError::Build {
            name: name.into(),
            source,
        }
    }

    #[inline]
    pub fn invalid_profile(profile: impl Into<String>, message: impl Into<String>) -> Self {
        ExecutorError::InvalidProfile {
            profile: profile.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn shut_down(name: impl Into<String>) -> Self {
        ExecutorError::ShutDown { name: name.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    #[default]
    Cached,
    Fixed,
    Single,
    Scheduled,
}

impl Display for PoolKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PoolKind::Cached => "cached",
            PoolKind::Fixed => "fixed",
            PoolKind::Single => "single",
            PoolKind::Scheduled => "scheduled",
        };
        write!(f, "{}", name)
    }
}

/// Template for the thread pools handed out by an [`ExecutorServiceStrategy`].
///
/// `thread_name_pattern` may use `#name#` and `#counter#`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolProfile {
    pub id: String,
    pub kind: PoolKind,
    pub pool_size: usize,
    pub daemon: bool,
    pub thread_name_pattern: String,
}

impl Default for ThreadPoolProfile {
    fn default() -> Self {
        Self {
            id: String::from("default"),
            kind: PoolKind::Cached,
            pool_size: 10,
            daemon: true,
            thread_name_pattern: String::from("switchyard #counter# - #name#"),
        }
    }
}

impl ThreadPoolProfile {
    pub fn with_kind(mut self, kind: PoolKind, pool_size: usize) -> Self {
        self.kind = kind;
        self.pool_size = pool_size;
        self
    }

    fn worker_threads(&self) -> Result<usize, ExecutorError> {
        match self.kind {
            PoolKind::Single => Ok(1),
            PoolKind::Cached if self.pool_size == 0 => Ok(std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)),
            _ if self.pool_size == 0 => Err(ExecutorError::invalid_profile(
                &self.id,
                format!("a {} pool needs a pool_size above 0", self.kind),
            )),
            _ => Ok(self.pool_size),
        }
    }

    pub fn thread_name(&self, name: &str, counter: usize) -> String {
        self.thread_name_pattern
            .replace("#name#", name)
            .replace("#counter#", &counter.to_string())
    }
}

/// A thread pool handed out by an [`ExecutorServiceStrategy`].
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    name: Arc<str>,
    kind: PoolKind,
    handle: Handle,
}

impl ExecutorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

/// Supplies the thread pools used by polling consumers and asynchronous steps. Nothing else
/// in the engine creates threads.
pub trait ExecutorServiceStrategy: Send + Sync {
    /// Creates a pool named `name` for `source` (usually a route or endpoint id).
    fn new_thread_pool(
        &self,
        source: &str,
        name: &str,
        profile: &ThreadPoolProfile,
    ) -> Result<ExecutorHandle, ExecutorError>;

    fn default_profile(&self) -> &ThreadPoolProfile;

    fn new_default_pool(&self, source: &str, name: &str) -> Result<ExecutorHandle, ExecutorError> {
        let profile = self.default_profile().clone();
        self.new_thread_pool(source, name, &profile)
    }

    fn new_single_thread(&self, source: &str, name: &str) -> Result<ExecutorHandle, ExecutorError> {
        let profile = self.default_profile().clone().with_kind(PoolKind::Single, 1);
        self.new_thread_pool(source, name, &profile)
    }

    fn new_fixed_pool(
        &self,
        source: &str,
        name: &str,
        pool_size: usize,
    ) -> Result<ExecutorHandle, ExecutorError> {
        let profile = self.default_profile().clone().with_kind(PoolKind::Fixed, pool_size);
        self.new_thread_pool(source, name, &profile)
    }

    fn new_scheduled_pool(
        &self,
        source: &str,
        name: &str,
        pool_size: usize,
    ) -> Result<ExecutorHandle, ExecutorError> {
        let profile = self
            .default_profile()
            .clone()
            .with_kind(PoolKind::Scheduled, pool_size);
        self.new_thread_pool(source, name, &profile)
    }

    /// Shuts the pool down without waiting for its tasks. Returns `false` for unknown pools.
    fn shutdown(&self, executor: &ExecutorHandle) -> bool;

    fn shutdown_all(&self);
}

struct OwnedPool {
    name: Arc<str>,
    runtime: Runtime,
}

/// Backs every pool with its own multi-threaded tokio runtime.
///
/// Runtimes are shut down in the background, so shutting down is safe from inside another
/// runtime and never waits for running tasks. Tokio worker threads never keep the process
/// alive, which makes every pool a daemon pool; the profile flag is only reported.
pub struct TokioExecutorStrategy {
    default_profile: ThreadPoolProfile,
    pools: Mutex<Vec<OwnedPool>>,
    shut_down: std::sync::atomic::AtomicBool,
}

impl TokioExecutorStrategy {
    pub fn new(default_profile: ThreadPoolProfile) -> Self {
        Self {
            default_profile,
            pools: Mutex::new(Vec::new()),
            shut_down: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }
}

impl Default for TokioExecutorStrategy {
    fn default() -> Self {
        Self::new(ThreadPoolProfile::default())
    }
}

impl ExecutorServiceStrategy for TokioExecutorStrategy {
    fn new_thread_pool(
        &self,
        source: &str,
        name: &str,
        profile: &ThreadPoolProfile,
    ) -> Result<ExecutorHandle, ExecutorError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ExecutorError::shut_down(name));
        }
        let workers = profile.worker_threads()?;
        let counter = Arc::new(AtomicUsize::new(1));
        let thread_profile = profile.clone();
        let thread_name = name.to_string();
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name_fn(move || {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                thread_profile.thread_name(&thread_name, n)
            })
            .enable_all()
            .build()
            .map_err(|e| ExecutorError::build(name, e))?;
        log::debug!(
            "Created {} thread pool '{}' for '{}' with {} worker(s), daemon={}",
            profile.kind,
            name,
            source,
            workers,
            profile.daemon
        );
        let name: Arc<str> = Arc::from(name);
        let executor = ExecutorHandle {
            name: name.clone(),
            kind: profile.kind,
            handle: runtime.handle().clone(),
        };
        self.pools.lock().push(OwnedPool { name, runtime });
        Ok(executor)
    }

    fn default_profile(&self) -> &ThreadPoolProfile {
        &self.default_profile
    }

    fn shutdown(&self, executor: &ExecutorHandle) -> bool {
        let removed = {
            let mut pools = self.pools.lock();
            let index = pools
                .iter()
                .position(|pool| Arc::ptr_eq(&pool.name, &executor.name));
            index.map(|index| pools.swap_remove(index))
        };
        match removed {
            Some(pool) => {
                log::debug!("Shutting down thread pool '{}'", pool.name);
                pool.runtime.shutdown_background();
                true
            }
            None => false,
        }
    }

    fn shutdown_all(&self) {
        self.shut_down.store(true, Ordering::Release);
        let pools = std::mem::take(&mut *self.pools.lock());
        for pool in pools {
            log::debug!("Shutting down thread pool '{}'", pool.name);
            pool.runtime.shutdown_background();
        }
    }
}

impl Drop for TokioExecutorStrategy {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

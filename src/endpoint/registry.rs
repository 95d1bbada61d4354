use crate::cache::BoundedCache;
use crate::endpoint::{Component, Endpoint, EndpointError, EndpointKey};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fnv::FnvBuildHasher;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during component registration and lookup.
#[derive(Error, Debug)]
pub enum ComponentRegistryError {
    /// No component was registered for the scheme.
    #[error("Component for scheme '{scheme}' not found.")]
    MissingComponent { scheme: String },

    /// A component is already registered for the scheme.
    #[error("Component for scheme '{scheme}' already exists.")]
    ConflictingScheme { scheme: String },
}

impl ComponentRegistryError {
    #[inline]
    pub(crate) fn missing_component(scheme: impl Into<String>) -> Self {
        Self::MissingComponent {
            scheme: scheme.into(),
        }
    }

    #[inline]
    pub(crate) fn conflicting_scheme(scheme: impl Into<String>) -> Self {
        Self::ConflictingScheme {
            scheme: scheme.into(),
        }
    }
}

/// Adapts a closure into a [`Component`].
pub struct FnComponent<F> {
    factory: F,
    defaults: Vec<(String, String)>,
}

impl<F> FnComponent<F>
where
    F: Fn(&EndpointKey) -> Result<Arc<dyn Endpoint>, EndpointError> + Send + Sync,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            defaults: Vec::new(),
        }
    }

    pub fn with_default(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.push((name.into(), value.into()));
        self
    }
}

impl<F> Component for FnComponent<F>
where
    F: Fn(&EndpointKey) -> Result<Arc<dyn Endpoint>, EndpointError> + Send + Sync,
{
    fn create_endpoint(&self, key: &EndpointKey) -> Result<Arc<dyn Endpoint>, EndpointError> {
        (self.factory)(key)
    }

    fn default_parameters(&self) -> Vec<(String, String)> {
        self.defaults.clone()
    }
}

/// Explicit scheme to component table, filled in at startup.
pub struct ComponentRegistry {
    components: DashMap<String, Arc<dyn Component>, FnvBuildHasher>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            components: DashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    /// Registers `component` for `scheme`. Schemes are matched case-insensitively.
    pub fn register(
        &self,
        scheme: impl Into<String>,
        component: impl Component + 'static,
    ) -> Result<(), ComponentRegistryError> {
        let scheme = scheme.into().to_ascii_lowercase();
        match self.components.entry(scheme.clone()) {
            Entry::Occupied(_) => Err(ComponentRegistryError::conflicting_scheme(scheme)),
            Entry::Vacant(entry) => {
                log::debug!("Registered component for scheme '{}'", scheme);
                entry.insert(Arc::new(component));
                Ok(())
            }
        }
    }

    pub fn register_fn<F>(
        &self,
        scheme: impl Into<String>,
        factory: F,
    ) -> Result<(), ComponentRegistryError>
    where
        F: Fn(&EndpointKey) -> Result<Arc<dyn Endpoint>, EndpointError> + Send + Sync + 'static,
    {
        self.register(scheme, FnComponent::new(factory))
    }

    pub fn find(&self, scheme: &str) -> Result<Arc<dyn Component>, ComponentRegistryError> {
        match self.components.get(&scheme.to_ascii_lowercase()) {
            None => Err(ComponentRegistryError::missing_component(scheme)),
            Some(component) => Ok(component.value().clone()),
        }
    }

    pub fn unregister(&self, scheme: &str) -> Option<Arc<dyn Component>> {
        self.components
            .remove(&scheme.to_ascii_lowercase())
            .map(|(_, component)| component)
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self
            .components
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        schemes.sort();
        schemes
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves endpoint URIs to endpoint instances.
///
/// Singleton endpoints are cached under their normalized [`EndpointKey`], so every notation
/// of the same endpoint resolves to one instance. The cache is bounded, and an evicted
/// endpoint is only stopped when nothing else still holds it.
pub struct EndpointRegistry {
    components: Arc<ComponentRegistry>,
    endpoints: BoundedCache<EndpointKey, Arc<dyn Endpoint>>,
}

impl EndpointRegistry {
    pub fn new(components: Arc<ComponentRegistry>, capacity: usize) -> Self {
        let endpoints = BoundedCache::new("endpoints", capacity).with_eviction_listener(
            |key: &EndpointKey, endpoint: Arc<dyn Endpoint>| {
                if Arc::strong_count(&endpoint) > 1 {
                    log::debug!("Evicted endpoint '{}' is still referenced, leaving it running", key);
                    return;
                }
                if let Some(service) = endpoint.service() {
                    if let Err(e) = service.stop() {
                        log::warn!("Failed to stop evicted endpoint '{}': {}", key, e);
                    }
                }
            },
        );
        Self {
            components,
            endpoints,
        }
    }

    pub fn components(&self) -> &Arc<ComponentRegistry> {
        &self.components
    }

    /// Normalizes `uri` with the defaults of its component and returns the key.
    pub fn normalize(&self, uri: &str) -> Result<EndpointKey, EndpointError> {
        let scheme = EndpointKey::scheme_of(uri)?;
        let component = self
            .components
            .find(scheme)
            .map_err(|_| EndpointError::unknown_component(scheme))?;
        EndpointKey::normalize(uri, &component.default_parameters())
    }

    pub fn resolve(&self, uri: &str) -> Result<Arc<dyn Endpoint>, EndpointError> {
        let scheme = EndpointKey::scheme_of(uri)?;
        let component = self
            .components
            .find(scheme)
            .map_err(|_| EndpointError::unknown_component(scheme))?;
        let key = EndpointKey::normalize(uri, &component.default_parameters())?;
        if let Some(endpoint) = self.endpoints.get(&key) {
            return Ok(endpoint);
        }
        log::debug!("Creating endpoint '{}'", key);
        let endpoint = component.create_endpoint(&key)?;
        if let Some(service) = endpoint.service() {
            service
                .start()
                .map_err(|e| EndpointError::creation(&key, "endpoint", e))?;
        }
        if !endpoint.is_singleton() {
            return Ok(endpoint);
        }
        let cached = self.endpoints.insert_if_absent(key, endpoint.clone());
        if !std::ptr::addr_eq(Arc::as_ptr(&cached), Arc::as_ptr(&endpoint)) {
            log::debug!("Endpoint '{}' was created concurrently, discarding the duplicate", cached.key());
            if let Some(service) = endpoint.service() {
                if let Err(e) = service.stop() {
                    log::warn!("Failed to stop duplicate endpoint '{}': {}", cached.key(), e);
                }
            }
        }
        Ok(cached)
    }

    pub fn lookup(&self, key: &EndpointKey) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.get(key)
    }

    pub fn remove(&self, key: &EndpointKey) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.remove(key)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Removes every cached endpoint and stops those with a lifecycle.
    pub fn stop_all(&self) {
        for (key, endpoint) in self.endpoints.drain() {
            if let Some(service) = endpoint.service() {
                if let Err(e) = service.stop() {
                    log::warn!("Failed to stop endpoint '{}': {}", key, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEndpoint;
    use std::sync::{OnceLock, Weak};

    fn registry(capacity: usize) -> EndpointRegistry {
        let components = Arc::new(ComponentRegistry::new());
        components
            .register(
                "mock",
                FnComponent::new(|key: &EndpointKey| {
                    Ok(Arc::new(MockEndpoint::from_key(key.clone())) as Arc<dyn Endpoint>)
                })
                .with_default("capacity", "10"),
            )
            .unwrap();
        EndpointRegistry::new(components, capacity)
    }

    #[test]
    fn test_conflicting_scheme() {
        let components = ComponentRegistry::new();
        components
            .register_fn("Mock", |key: &EndpointKey| {
                Ok(Arc::new(MockEndpoint::from_key(key.clone())) as Arc<dyn Endpoint>)
            })
            .unwrap();
        let err = components
            .register_fn("mock", |key: &EndpointKey| {
                Ok(Arc::new(MockEndpoint::from_key(key.clone())) as Arc<dyn Endpoint>)
            })
            .unwrap_err();
        assert!(matches!(err, ComponentRegistryError::ConflictingScheme { .. }));
        assert!(components.find("MOCK").is_ok());
        assert!(matches!(
            components.find("other"),
            Err(ComponentRegistryError::MissingComponent { .. })
        ));
        assert_eq!(components.schemes(), vec![String::from("mock")]);
    }

    #[test]
    fn test_notations_resolve_to_one_instance() {
        let registry = registry(10);
        let a = registry.resolve("mock:orders?b=2&a=1").unwrap();
        let b = registry.resolve("MOCK://orders?a=1&b=2&capacity=10").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.key().as_str(), "mock://orders?a=1&b=2");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = registry(10);
        assert!(matches!(
            registry.resolve("nope:thing"),
            Err(EndpointError::UnknownComponent { .. })
        ));
    }

    #[test]
    fn test_endpoint_creation_may_resolve_other_endpoints() {
        let components = Arc::new(ComponentRegistry::new());
        let slot: Arc<OnceLock<Weak<EndpointRegistry>>> = Arc::new(OnceLock::new());
        components
            .register_fn("mock", |key: &EndpointKey| {
                Ok(Arc::new(MockEndpoint::from_key(key.clone())) as Arc<dyn Endpoint>)
            })
            .unwrap();
        let lookup = slot.clone();
        components
            .register_fn("relay", move |key: &EndpointKey| {
                let registry = lookup
                    .get()
                    .and_then(Weak::upgrade)
                    .ok_or_else(|| EndpointError::unknown_component("relay"))?;
                registry.resolve("mock:target")?;
                Ok(Arc::new(MockEndpoint::from_key(key.clone())) as Arc<dyn Endpoint>)
            })
            .unwrap();
        let registry = Arc::new(EndpointRegistry::new(components, 10));
        slot.set(Arc::downgrade(&registry)).unwrap();

        let relay = registry.resolve("relay:a").unwrap();
        assert_eq!(relay.key().as_str(), "relay://a");
        assert!(registry.lookup(&EndpointKey::parse("mock:target").unwrap()).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_lru_bound() {
        let registry = registry(2);
        let first = registry.resolve("mock:one").unwrap();
        registry.resolve("mock:two").unwrap();
        registry.resolve("mock:three").unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup(first.key()).is_none());
        let again = registry.resolve("mock:one").unwrap();
        assert!(!Arc::ptr_eq(&first, &again));
    }
}

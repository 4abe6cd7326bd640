use crate::cache::{Cache, NoCache};
use crate::error::{Error, Result};
use crate::factory::VariantRegistry;
use crate::gateway::{Connection, Gateway};
use crate::geo::{DEFAULT_MAX_ITERATIONS, DEFAULT_SEARCH_INFLATION};
use crate::identity::{self, IdentitySet, SecurityContext};
use crate::session::Session;
use crate::types::{DEFAULT_GOD_ID, RecordId, TEMPLATE_ROW_ID};
use serde::Deserialize;

const DEFAULT_READ_ATTEMPTS: u32 = 2;

/// Tunables a host can load from its own configuration files.
///
/// Every field has a default, so an empty document is a valid config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Reserved superuser id.
    pub god_id: RecordId,
    /// Phase-one radius multiplier for location searches.
    pub search_inflation: f64,
    /// Iteration cap for the exact geodesic.
    pub max_geodesic_iterations: u32,
    /// Attempts per read statement before the gateway gives up.
    pub read_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            god_id: DEFAULT_GOD_ID,
            search_inflation: DEFAULT_SEARCH_INFLATION,
            max_geodesic_iterations: DEFAULT_MAX_ITERATIONS,
            read_attempts: DEFAULT_READ_ATTEMPTS,
        }
    }
}

/// Row-level security engine over one backing store.
///
/// The engine is shared across requests; all per-request state lives in the
/// [`Session`] it hands out.
#[derive(Debug)]
pub struct Engine<C, K = NoCache> {
    pub(crate) gateway: Gateway<C>,
    pub(crate) cache: K,
    pub(crate) registry: VariantRegistry,
    pub(crate) god_id: RecordId,
    pub(crate) search_inflation: f64,
    pub(crate) max_geodesic_iterations: u32,
}

/// Builder for [`Engine`].
pub struct EngineBuilder<C, K = NoCache> {
    connection: C,
    cache: K,
    registry: VariantRegistry,
    config: EngineConfig,
}

impl<C> EngineBuilder<C, NoCache> {
    /// Creates a new builder with default configuration.
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            cache: NoCache,
            registry: VariantRegistry::default(),
            config: EngineConfig::default(),
        }
    }
}

impl<C, K> EngineBuilder<C, K> {
    /// Replaces every tunable at once.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the reserved superuser id.
    pub fn god_id(mut self, id: RecordId) -> Self {
        self.config.god_id = id;
        self
    }

    /// Sets the phase-one radius multiplier.
    pub fn search_inflation(mut self, factor: f64) -> Self {
        self.config.search_inflation = factor;
        self
    }

    /// Sets the iteration cap for exact distances.
    pub fn max_geodesic_iterations(mut self, iterations: u32) -> Self {
        self.config.max_geodesic_iterations = iterations;
        self
    }

    /// Sets how many times a read statement is attempted.
    pub fn read_attempts(mut self, attempts: u32) -> Self {
        self.config.read_attempts = attempts;
        self
    }

    /// Sets the discriminator registry.
    pub fn registry(mut self, registry: VariantRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the identity cache implementation.
    pub fn cache<K2: Cache>(self, cache: K2) -> EngineBuilder<C, K2> {
        EngineBuilder {
            connection: self.connection,
            cache,
            registry: self.registry,
            config: self.config,
        }
    }

    /// Builds the engine.
    ///
    /// Fails when the superuser id collides with the template row or the
    /// search inflation would shrink phase-one results.
    pub fn build(self) -> Result<Engine<C, K>> {
        let config = self.config;
        if config.god_id.get() == TEMPLATE_ROW_ID {
            return Err(Error::InvalidId(format!(
                "superuser id {} is reserved for template rows",
                config.god_id
            )));
        }
        if !config.search_inflation.is_finite() || config.search_inflation < 1.0 {
            return Err(Error::InvalidCriteria(format!(
                "search inflation must be >= 1, got {}",
                config.search_inflation
            )));
        }

        Ok(Engine {
            gateway: Gateway::new(self.connection, config.read_attempts),
            cache: self.cache,
            registry: self.registry,
            god_id: config.god_id,
            search_inflation: config.search_inflation,
            max_geodesic_iterations: config.max_geodesic_iterations,
        })
    }
}

impl<C, K> Engine<C, K> {
    /// Statement gateway.
    pub fn gateway(&self) -> &Gateway<C> {
        &self.gateway
    }

    /// Reserved superuser id.
    pub fn god_id(&self) -> RecordId {
        self.god_id
    }

    /// Discriminator registry.
    pub fn registry(&self) -> &VariantRegistry {
        &self.registry
    }
}

impl<C, K> Engine<C, K>
where
    C: Connection,
    K: Cache,
{
    /// Effective identity set for a principal, via the cache when possible.
    ///
    /// Only sets read from the store are cached; a degraded fallback is
    /// recomputed on the next request.
    pub async fn resolve_identities(&self, principal: RecordId) -> IdentitySet {
        if let Some(cached) = self.cache.get_identities(principal).await {
            return cached;
        }
        let resolution = identity::resolve(&self.gateway, principal).await;
        let cacheable = resolution.is_authoritative();
        let identities = resolution.into_identities();
        if cacheable {
            self.cache.set_identities(principal, identities.clone()).await;
        }
        identities
    }

    /// Security context for a request. `None` is an anonymous caller.
    pub async fn security_context(&self, principal: Option<RecordId>) -> SecurityContext {
        match principal {
            None => SecurityContext::anonymous(self.god_id),
            Some(principal) => {
                let identities = self.resolve_identities(principal).await;
                SecurityContext::authenticated(principal, identities, self.god_id)
            }
        }
    }

    /// Opens a session with a fresh identity map for one request.
    pub async fn session(&self, principal: Option<RecordId>) -> Session<'_, C, K> {
        let context = self.security_context(principal).await;
        tracing::debug!(
            principal = ?principal,
            identities = context.identities().len(),
            "session opened"
        );
        Session::new(self, context)
    }

    /// Drops a principal's cached identity set.
    pub async fn invalidate_identities(&self, principal: RecordId) {
        self.cache.invalidate_principal(principal).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::gateway::{Executed, Row, Statement, Value};
    use crate::types::SecurityId;
    use async_trait::async_trait;
    use futures::executor::block_on;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingConnection {
        queries: Mutex<u32>,
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl Connection for CountingConnection {
        async fn execute(
            &self,
            _statement: &Statement,
        ) -> std::result::Result<Executed, StoreError> {
            Ok(Executed::default())
        }

        async fn query(&self, _statement: &Statement) -> std::result::Result<Vec<Row>, StoreError> {
            *self.queries.lock().expect("poisoned lock") += 1;
            let mut failures = self.failures.lock().expect("poisoned lock");
            if *failures > 0 {
                *failures -= 1;
                return Err("store offline".into());
            }
            let mut row = Row::new();
            row.insert("delegated_ids", Value::Text("7,9".to_string()));
            Ok(vec![row])
        }
    }

    fn id(value: i64) -> RecordId {
        RecordId::new(value).unwrap()
    }

    #[test]
    fn build_should_reject_template_id_as_superuser() {
        let result = EngineBuilder::new(CountingConnection::default())
            .god_id(id(TEMPLATE_ROW_ID))
            .build();
        assert!(matches!(result, Err(Error::InvalidId(_))));
    }

    #[test]
    fn build_should_reject_shrinking_inflation() {
        let result = EngineBuilder::new(CountingConnection::default())
            .search_inflation(0.5)
            .build();
        assert!(matches!(result, Err(Error::InvalidCriteria(_))));
    }

    #[test]
    fn config_should_deserialize_with_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"god_id": 9}"#).unwrap();
        assert_eq!(config.god_id, id(9));
        assert_eq!(config.read_attempts, DEFAULT_READ_ATTEMPTS);
        assert!(serde_json::from_str::<EngineConfig>(r#"{"god_id": 0}"#).is_err());
    }

    #[test]
    fn session_should_resolve_delegated_identities() {
        let engine = EngineBuilder::new(CountingConnection::default())
            .build()
            .unwrap();
        let context = block_on(engine.security_context(Some(id(5))));
        let ids: Vec<i64> = context.identities().iter().map(SecurityId::get).collect();
        assert_eq!(ids, vec![5, 7, 9]);
        assert!(!context.is_god());
    }

    #[cfg(feature = "memory-cache")]
    #[test]
    fn cached_identities_should_skip_the_store() {
        let engine = EngineBuilder::new(CountingConnection::default())
            .cache(crate::MemoryCache::new(8))
            .build()
            .unwrap();

        block_on(engine.resolve_identities(id(5)));
        block_on(engine.resolve_identities(id(5)));
        assert_eq!(*engine.gateway().connection().queries.lock().unwrap(), 1);

        block_on(engine.invalidate_identities(id(5)));
        block_on(engine.resolve_identities(id(5)));
        assert_eq!(*engine.gateway().connection().queries.lock().unwrap(), 2);
    }

    #[cfg(feature = "memory-cache")]
    #[test]
    fn degraded_identities_should_not_be_cached() {
        let connection = CountingConnection {
            failures: Mutex::new(1),
            ..CountingConnection::default()
        };
        let engine = EngineBuilder::new(connection)
            .read_attempts(1)
            .cache(crate::MemoryCache::new(8))
            .build()
            .unwrap();

        let first: Vec<i64> = block_on(engine.resolve_identities(id(5)))
            .iter()
            .map(SecurityId::get)
            .collect();
        assert_eq!(first, vec![5]);

        let second: Vec<i64> = block_on(engine.resolve_identities(id(5)))
            .iter()
            .map(SecurityId::get)
            .collect();
        assert_eq!(second, vec![5, 7, 9]);
        assert_eq!(*engine.gateway().connection().queries.lock().unwrap(), 2);
    }
}

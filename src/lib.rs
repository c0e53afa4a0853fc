// Weft - Reactive, schema-validated data access over a replicated value store

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod multiplexer;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod store;

pub use config::{FlushMode, LayerConfig};
pub use dispatcher::{Changes, Dispatcher, Operation, OperationResult};
pub use error::{FieldViolation, Result, WeftError};
pub use multiplexer::{SubscriptionMultiplexer, WatchGuard};
pub use query::{Consumer, ConsumerState, QueryDescriptor, QueryEngine};
pub use resolver::{LoadState, ReferenceResolver, ResolvedView};
pub use schema::{SchemaDescriptor, SchemaId, SchemaStore};
pub use store::{DocId, MemoryStore, StorageKind, StoredValue, ValueStore};

use std::sync::Arc;

use query::FlushScheduler;

/// Every component wired over one value store.
///
/// Owns the multiplexer; nothing in the crate is process-global, so two
/// layers over two stores never share subscriptions.
pub struct DataLayer {
    config: LayerConfig,
    store: Arc<dyn ValueStore>,
    schemas: Arc<SchemaStore>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    dispatcher: Arc<Dispatcher>,
    queries: Arc<QueryEngine>,
}

impl DataLayer {
    /// A layer with a freshly bootstrapped schema registry.
    pub async fn new(store: Arc<dyn ValueStore>, config: LayerConfig) -> Result<Self> {
        config.validate()?;
        let schemas = Arc::new(SchemaStore::new(store.clone()));
        let bootstrap = schemas.bootstrap_id().await?;
        log::info!("data layer ready (meta-schema {})", bootstrap);
        Ok(Self::assemble(store, schemas, config))
    }

    /// A layer over a registry persisted by an earlier layer.
    pub async fn open(
        store: Arc<dyn ValueStore>,
        config: LayerConfig,
        registry_id: &DocId,
    ) -> Result<Self> {
        config.validate()?;
        let schemas = Arc::new(SchemaStore::open(store.clone(), registry_id).await?);
        Ok(Self::assemble(store, schemas, config))
    }

    fn assemble(store: Arc<dyn ValueStore>, schemas: Arc<SchemaStore>, config: LayerConfig) -> Self {
        let multiplexer = SubscriptionMultiplexer::new(store.clone(), config.grace_period());
        let resolver = Arc::new(ReferenceResolver::new(
            store.clone(),
            schemas.clone(),
            config.max_depth,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            schemas.clone(),
            resolver,
            multiplexer.clone(),
        ));
        let scheduler = FlushScheduler::new(config.flush_window());
        let queries = QueryEngine::new(dispatcher.clone(), multiplexer.clone(), scheduler);
        Self {
            config,
            store,
            schemas,
            multiplexer,
            dispatcher,
            queries,
        }
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ValueStore> {
        &self.store
    }

    pub fn schemas(&self) -> &Arc<SchemaStore> {
        &self.schemas
    }

    pub fn multiplexer(&self) -> &Arc<SubscriptionMultiplexer> {
        &self.multiplexer
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn queries(&self) -> &Arc<QueryEngine> {
        &self.queries
    }

    pub async fn execute(&self, operation: Operation) -> Result<OperationResult> {
        self.dispatcher.execute(operation).await
    }

    pub async fn execute_json(&self, operation: serde_json::Value) -> Result<OperationResult> {
        self.dispatcher.execute_json(operation).await
    }

    pub async fn attach(&self, consumer: &Arc<Consumer>) -> Result<()> {
        self.queries.attach(consumer).await
    }

    pub fn detach(&self, consumer: &Arc<Consumer>) {
        self.queries.detach(consumer)
    }

    /// Flush pending renders now. Returns the number of consumers rendered.
    pub fn flush(&self) -> usize {
        self.queries.flush()
    }

    pub fn flush_count(&self) -> usize {
        self.queries.scheduler().flush_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_layer_bootstraps_and_reopens() {
        let store = Arc::new(MemoryStore::new());
        let layer = DataLayer::new(store.clone(), LayerConfig::default())
            .await
            .unwrap();
        let todo = layer
            .execute_json(json!({
                "op": "registerSchema",
                "name": "Todo",
                "definition": {"kind": "map", "fields": {"text": {"valueType": "string"}}}
            }))
            .await
            .unwrap()
            .id()
            .cloned()
            .unwrap();
        let registry = layer.schemas().registry_id().await.unwrap();

        let reopened = DataLayer::open(store, LayerConfig::default(), &registry)
            .await
            .unwrap();
        let listed = reopened.schemas().list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].schema_id, todo);
        assert_eq!(
            reopened.schemas().bootstrap_id().await.unwrap(),
            layer.schemas().bootstrap_id().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = LayerConfig {
            max_depth: 0,
            ..LayerConfig::default()
        };
        let err = DataLayer::new(Arc::new(MemoryStore::new()), config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WeftError::Config(_)));
    }
}

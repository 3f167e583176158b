//! The policy bundle a store is configured with.

use std::sync::Arc;
use std::time::Duration;

use normcache_core::policy::{
    CacheKeyGenerator, DefaultEmbeddedFieldsProvider, DefaultFieldKeyGenerator,
    EmbeddedFieldsProvider, EmptyMetadataGenerator, FieldKeyGenerator, GlobalMaxAgeProvider,
    IdCacheKeyGenerator, MaxAgeProvider, MetadataGenerator,
};
use normcache_core::StoreConfig;
use normcache_storage::{DefaultRecordMerger, RecordMerger};

use crate::resolver::{
    CacheControlCacheResolver, CacheResolver, DefaultCacheResolver, FieldPolicyCacheResolver,
};

/// Identity, naming, freshness and merge policies used by one store.
#[derive(Clone)]
pub struct CachePolicies {
    pub cache_key_generator: Arc<dyn CacheKeyGenerator>,
    pub field_key_generator: Arc<dyn FieldKeyGenerator>,
    pub embedded_fields: Arc<dyn EmbeddedFieldsProvider>,
    pub metadata_generator: Arc<dyn MetadataGenerator>,
    pub max_age_provider: Arc<dyn MaxAgeProvider>,
    pub resolver: Arc<dyn CacheResolver>,
    pub record_merger: Arc<dyn RecordMerger>,
}

impl CachePolicies {
    pub fn builder() -> CachePoliciesBuilder {
        CachePoliciesBuilder::default()
    }

    /// Defaults with a global max-age taken from `config`.
    pub fn for_config(config: &StoreConfig) -> Self {
        Self::builder()
            .max_age_provider(GlobalMaxAgeProvider::new(Duration::from_secs(
                config.default_max_age_secs,
            )))
            .build()
    }
}

impl Default for CachePolicies {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`CachePolicies`].
///
/// Unless a resolver is given explicitly, `build` assembles
/// `CacheControl -> FieldPolicy -> Default` around the configured
/// max-age provider.
#[derive(Default)]
pub struct CachePoliciesBuilder {
    cache_key_generator: Option<Arc<dyn CacheKeyGenerator>>,
    field_key_generator: Option<Arc<dyn FieldKeyGenerator>>,
    embedded_fields: Option<Arc<dyn EmbeddedFieldsProvider>>,
    metadata_generator: Option<Arc<dyn MetadataGenerator>>,
    max_age_provider: Option<Arc<dyn MaxAgeProvider>>,
    resolver: Option<Arc<dyn CacheResolver>>,
    record_merger: Option<Arc<dyn RecordMerger>>,
}

impl CachePoliciesBuilder {
    pub fn cache_key_generator(mut self, generator: impl CacheKeyGenerator + 'static) -> Self {
        self.cache_key_generator = Some(Arc::new(generator));
        self
    }

    pub fn field_key_generator(mut self, generator: impl FieldKeyGenerator + 'static) -> Self {
        self.field_key_generator = Some(Arc::new(generator));
        self
    }

    pub fn embedded_fields(mut self, provider: impl EmbeddedFieldsProvider + 'static) -> Self {
        self.embedded_fields = Some(Arc::new(provider));
        self
    }

    pub fn metadata_generator(mut self, generator: impl MetadataGenerator + 'static) -> Self {
        self.metadata_generator = Some(Arc::new(generator));
        self
    }

    pub fn max_age_provider(mut self, provider: impl MaxAgeProvider + 'static) -> Self {
        self.max_age_provider = Some(Arc::new(provider));
        self
    }

    pub fn resolver(mut self, resolver: impl CacheResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn record_merger(mut self, merger: impl RecordMerger + 'static) -> Self {
        self.record_merger = Some(Arc::new(merger));
        self
    }

    pub fn build(self) -> CachePolicies {
        let max_age_provider = self
            .max_age_provider
            .unwrap_or_else(|| Arc::new(GlobalMaxAgeProvider::unlimited()));
        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(CacheControlCacheResolver::new(
                Arc::clone(&max_age_provider),
                FieldPolicyCacheResolver::new(DefaultCacheResolver),
            ))
        });

        CachePolicies {
            cache_key_generator: self
                .cache_key_generator
                .unwrap_or_else(|| Arc::new(IdCacheKeyGenerator::default())),
            field_key_generator: self
                .field_key_generator
                .unwrap_or_else(|| Arc::new(DefaultFieldKeyGenerator)),
            embedded_fields: self
                .embedded_fields
                .unwrap_or_else(|| Arc::new(DefaultEmbeddedFieldsProvider)),
            metadata_generator: self
                .metadata_generator
                .unwrap_or_else(|| Arc::new(EmptyMetadataGenerator)),
            max_age_provider,
            resolver,
            record_merger: self
                .record_merger
                .unwrap_or_else(|| Arc::new(DefaultRecordMerger)),
        }
    }
}

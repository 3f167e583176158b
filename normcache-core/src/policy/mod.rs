//! Policy plugins
//!
//! Each policy is a narrow single-method trait. Implementations compose by
//! delegation; none of them touch storage.

mod cache_key;
mod embedded;
mod field_key;
mod max_age;
mod metadata;

pub use cache_key::{
    object_typename, CacheKeyGenerator, CacheKeyGeneratorContext, IdCacheKeyGenerator,
    TypePolicyCacheKeyGenerator,
};
pub use embedded::{
    ConnectionEmbeddedFieldsProvider, DefaultEmbeddedFieldsProvider, EmbeddedFieldsProvider,
    TypePolicyEmbeddedFieldsProvider,
};
pub use field_key::{
    field_key_with_arguments, ConnectionFieldKeyGenerator, DefaultFieldKeyGenerator,
    FieldKeyContext, FieldKeyGenerator,
};
pub use max_age::{
    duration_secs, FieldInfo, GlobalMaxAgeProvider, MaxAge, MaxAgeContext, MaxAgeProvider,
    SchemaCoordinatesMaxAgeProvider,
};
pub use metadata::{
    ConnectionMetadataGenerator, EmptyMetadataGenerator, MetadataGenerator,
    MetadataGeneratorContext, AFTER, BEFORE, END_CURSOR, START_CURSOR,
};

//! normcache core
//!
//! Data model for the normalized cache: object and field identity, record
//! values, flat records, compiled selection trees, cache headers, policy
//! plugins, configuration and errors. No storage and no algorithms live here.

pub mod config;
pub mod error;
pub mod headers;
pub mod identity;
pub mod policy;
pub mod record;
pub mod selection;
pub mod value;

pub use config::{ReadMode, StoreConfig};
pub use error::{CacheError, CacheResult, ConfigError, MissError, StorageError};
pub use headers::CacheHeaders;
pub use identity::{
    field_name_of, CacheKey, ChangedKeys, FieldKey, MUTATION_ROOT, QUERY_ROOT, SUBSCRIPTION_ROOT,
};
pub use record::{changed_fields, FieldMetadata, Fields, Record};
pub use selection::{
    collect_fields, ArgValue, Argument, CompiledField, CompiledFieldBuilder, CompiledFragment,
    Condition, FieldType, NamedType, Operation, OperationKind, Selection, TypeKind,
};
pub use value::{format_path, ErrorValue, Object, Path, PathElement, Value, Variables};

//! Resolver chain
//!
//! A resolver turns one field of a loaded record into a value. Resolvers
//! compose by delegation: the default chain is
//! `CacheControl -> FieldPolicy -> Default`.

use std::collections::BTreeMap;
use std::sync::Arc;

use normcache_core::policy::{
    duration_secs, FieldKeyContext, FieldKeyGenerator, MaxAgeContext, MaxAgeProvider,
};
use normcache_core::{
    CacheHeaders, CacheKey, CompiledField, FieldKey, FieldMetadata, MissError, Object, Value,
    Variables,
};

/// Everything a resolver may look at for one field.
pub struct ResolverContext<'a> {
    pub field: &'a CompiledField,
    pub variables: &'a Variables,
    /// Fields of the record (or embedded object) being read.
    pub parent: &'a Object,
    pub parent_metadata: &'a BTreeMap<String, FieldMetadata>,
    pub parent_key: &'a CacheKey,
    pub parent_type: &'a str,
    pub headers: &'a CacheHeaders,
    pub field_key_generator: &'a dyn FieldKeyGenerator,
    /// Field path from the operation root, ending with this field.
    pub path: &'a MaxAgeContext,
    /// Current time in unix seconds.
    pub now: i64,
}

impl ResolverContext<'_> {
    pub fn field_key(&self) -> FieldKey {
        self.field_key_generator.field_key(&FieldKeyContext {
            parent_type: self.parent_type,
            field: self.field,
            variables: self.variables,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValue {
    pub value: Value,
    /// Served past its max-age but within the allowed staleness.
    pub stale: bool,
}

impl ResolvedValue {
    pub fn fresh(value: Value) -> Self {
        Self {
            value,
            stale: false,
        }
    }
}

pub trait CacheResolver: Send + Sync {
    fn resolve_field(&self, context: &ResolverContext<'_>) -> Result<ResolvedValue, MissError>;
}

impl<R: CacheResolver + ?Sized> CacheResolver for Arc<R> {
    fn resolve_field(&self, context: &ResolverContext<'_>) -> Result<ResolvedValue, MissError> {
        (**self).resolve_field(context)
    }
}

/// Exact field-key lookup; a missing key is a miss.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCacheResolver;

impl CacheResolver for DefaultCacheResolver {
    fn resolve_field(&self, context: &ResolverContext<'_>) -> Result<ResolvedValue, MissError> {
        let field_key = context.field_key();
        match context.parent.get(&field_key) {
            Some(value) => Ok(ResolvedValue::fresh(value.clone())),
            None => Err(MissError::field(context.parent_key.as_str(), field_key)),
        }
    }
}

/// Maps declared key arguments straight to a cache key.
///
/// `user(id: "1")` resolves to `User:1` without looking at the parent
/// record. A single list-valued key argument on a list field resolves to a
/// list of keys. Anything else goes to the delegate.
#[derive(Debug, Clone, Default)]
pub struct FieldPolicyCacheResolver<D> {
    delegate: D,
}

impl<D: CacheResolver> FieldPolicyCacheResolver<D> {
    pub fn new(delegate: D) -> Self {
        Self { delegate }
    }

    fn keys_from_arguments(context: &ResolverContext<'_>) -> Option<Value> {
        let field = context.field;
        let raw_type = field.raw_type();
        if !raw_type.is_composite() {
            return None;
        }
        let declared = field.arguments.iter().filter(|a| a.is_key).count();
        if declared == 0 {
            return None;
        }
        let values = field.key_argument_values(context.variables);
        if values.len() != declared {
            return None;
        }

        if field.ty.list_item().is_some() {
            let [Value::List(items)] = values.as_slice() else {
                return None;
            };
            let mut keys = Vec::with_capacity(items.len());
            for item in items {
                let id = item.to_key_string()?;
                keys.push(Value::Reference(CacheKey::declared(&raw_type.name, [id])));
            }
            return Some(Value::List(keys));
        }

        let ids = values
            .iter()
            .map(Value::to_key_string)
            .collect::<Option<Vec<_>>>()?;
        Some(Value::Reference(CacheKey::declared(&raw_type.name, ids)))
    }
}

impl<D: CacheResolver> CacheResolver for FieldPolicyCacheResolver<D> {
    fn resolve_field(&self, context: &ResolverContext<'_>) -> Result<ResolvedValue, MissError> {
        match Self::keys_from_arguments(context) {
            Some(value) => Ok(ResolvedValue::fresh(value)),
            None => self.delegate.resolve_field(context),
        }
    }
}

/// Enforces max-age and server expiry.
///
/// The age of a field comes from its `received-date` metadata and is
/// compared with the provider's max-age; a server `expiration-date` is
/// compared with now. Past the limit by at most the `max-stale` header the
/// value is served and flagged stale; beyond that it is a stale miss.
pub struct CacheControlCacheResolver<D> {
    max_age_provider: Arc<dyn MaxAgeProvider>,
    delegate: D,
}

impl<D: CacheResolver> CacheControlCacheResolver<D> {
    pub fn new(max_age_provider: Arc<dyn MaxAgeProvider>, delegate: D) -> Self {
        Self {
            max_age_provider,
            delegate,
        }
    }
}

/// Classify a value that is `stale_by` seconds past its limit, given
/// `max_stale` seconds of allowed staleness.
///
/// Returns [`Staleness::Fresh`] when `stale_by <= 0`, [`Staleness::Stale`]
/// when `0 < stale_by <= max_stale`, and [`Staleness::Expired`] otherwise.
/// A negative `max_stale` counts as zero.
pub fn staleness(stale_by: i64, max_stale: i64) -> Staleness {
    if stale_by > max_stale.max(0) {
        Staleness::Expired
    } else if stale_by > 0 {
        Staleness::Stale
    } else {
        Staleness::Fresh
    }
}

/// Outcome of [`staleness`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Within the limit.
    Fresh,
    /// Past the limit but within the allowed staleness; served and flagged.
    Stale,
    /// Past the allowed staleness; a miss on read, removed by the sweep.
    Expired,
}

impl<D: CacheResolver> CacheResolver for CacheControlCacheResolver<D> {
    fn resolve_field(&self, context: &ResolverContext<'_>) -> Result<ResolvedValue, MissError> {
        let mut resolved = self.delegate.resolve_field(context)?;
        let field_key = context.field_key();
        let Some(metadata) = context.parent_metadata.get(&field_key) else {
            return Ok(resolved);
        };
        let max_stale = context.headers.max_stale_secs().unwrap_or(0).max(0);

        if let Some(received) = metadata
            .get(normcache_core::record::RECEIVED_DATE)
            .and_then(Value::as_i64)
        {
            let age = context.now.saturating_sub(received);
            let max_age = duration_secs(self.max_age_provider.max_age(context.path));
            match staleness(age.saturating_sub(max_age), max_stale) {
                Staleness::Expired => {
                    return Err(MissError::StaleMiss {
                        key: context.parent_key.to_string(),
                        field: field_key,
                        age_secs: age,
                        allowed_secs: max_age.saturating_add(max_stale),
                    })
                }
                Staleness::Stale => resolved.stale = true,
                Staleness::Fresh => {}
            }
        }

        if let Some(expires) = metadata
            .get(normcache_core::record::EXPIRATION_DATE)
            .and_then(Value::as_i64)
        {
            let stale_by = context.now.saturating_sub(expires);
            match staleness(stale_by, max_stale) {
                Staleness::Expired => {
                    return Err(MissError::StaleMiss {
                        key: context.parent_key.to_string(),
                        field: field_key,
                        age_secs: stale_by,
                        allowed_secs: max_stale,
                    })
                }
                Staleness::Stale => resolved.stale = true,
                Staleness::Fresh => {}
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use normcache_core::headers::MAX_STALE;
    use normcache_core::policy::{
        DefaultFieldKeyGenerator, FieldInfo, GlobalMaxAgeProvider,
    };
    use normcache_core::record::{EXPIRATION_DATE, RECEIVED_DATE};
    use normcache_core::{Argument, FieldType};
    use std::time::Duration;

    struct Fixture {
        parent: Object,
        metadata: BTreeMap<String, FieldMetadata>,
        key: CacheKey,
        headers: CacheHeaders,
        variables: Variables,
        path: MaxAgeContext,
    }

    impl Fixture {
        fn new() -> Self {
            let mut parent = Object::new();
            parent.insert("name".to_string(), Value::from("Ann"));
            Self {
                parent,
                metadata: BTreeMap::new(),
                key: CacheKey::new("User:1"),
                headers: CacheHeaders::none(),
                variables: Variables::new(),
                path: MaxAgeContext::new(vec![FieldInfo::new("User", "name", "String", false)]),
            }
        }

        fn received(mut self, at: i64) -> Self {
            self.metadata
                .entry("name".to_string())
                .or_default()
                .insert(RECEIVED_DATE.to_string(), Value::Int(at));
            self
        }

        fn ctx<'a>(&'a self, field: &'a CompiledField, now: i64) -> ResolverContext<'a> {
            ResolverContext {
                field,
                variables: &self.variables,
                parent: &self.parent,
                parent_metadata: &self.metadata,
                parent_key: &self.key,
                parent_type: "User",
                headers: &self.headers,
                field_key_generator: &DefaultFieldKeyGenerator,
                path: &self.path,
                now,
            }
        }
    }

    fn name_field() -> CompiledField {
        CompiledField::builder("name", FieldType::scalar("String")).build()
    }

    fn cache_control(max_age_secs: u64) -> CacheControlCacheResolver<DefaultCacheResolver> {
        CacheControlCacheResolver::new(
            Arc::new(GlobalMaxAgeProvider::new(Duration::from_secs(max_age_secs))),
            DefaultCacheResolver,
        )
    }

    #[test]
    fn test_default_hit_and_miss() {
        let fixture = Fixture::new();
        let field = name_field();
        let hit = DefaultCacheResolver
            .resolve_field(&fixture.ctx(&field, 0))
            .expect("hit");
        assert_eq!(hit.value, Value::from("Ann"));

        let missing = CompiledField::builder("email", FieldType::scalar("String")).build();
        let miss = DefaultCacheResolver
            .resolve_field(&fixture.ctx(&missing, 0))
            .expect_err("miss");
        assert_eq!(miss, MissError::field("User:1", "email"));
    }

    #[test]
    fn test_field_policy_single_key() {
        let fixture = Fixture::new();
        let field = CompiledField::builder("user", FieldType::object("User"))
            .argument(Argument::literal("id", "42").key())
            .build();
        let resolved = FieldPolicyCacheResolver::new(DefaultCacheResolver)
            .resolve_field(&fixture.ctx(&field, 0))
            .expect("resolved");
        assert_eq!(resolved.value, Value::Reference(CacheKey::new("User:42")));
    }

    #[test]
    fn test_field_policy_list_of_keys() {
        let fixture = Fixture::new();
        let field = CompiledField::builder("users", FieldType::object("User").list())
            .argument(
                Argument::literal("ids", Value::List(vec!["1".into(), "2".into()])).key(),
            )
            .build();
        let resolved = FieldPolicyCacheResolver::new(DefaultCacheResolver)
            .resolve_field(&fixture.ctx(&field, 0))
            .expect("resolved");
        assert_eq!(
            resolved.value,
            Value::List(vec![
                Value::Reference(CacheKey::new("User:1")),
                Value::Reference(CacheKey::new("User:2")),
            ])
        );
    }

    #[test]
    fn test_field_policy_unbound_key_delegates() {
        let fixture = Fixture::new();
        let field = CompiledField::builder("user", FieldType::object("User"))
            .argument(Argument::variable("id", "missing").key())
            .build();
        let err = FieldPolicyCacheResolver::new(DefaultCacheResolver)
            .resolve_field(&fixture.ctx(&field, 0))
            .expect_err("delegated miss");
        assert!(!err.is_stale());
    }

    #[test]
    fn test_cache_control_boundary() {
        let fixture = Fixture::new().received(1_000);
        let field = name_field();
        let resolver = cache_control(60);

        let at_limit = resolver
            .resolve_field(&fixture.ctx(&field, 1_060))
            .expect("fresh at limit");
        assert!(!at_limit.stale);

        let past = resolver
            .resolve_field(&fixture.ctx(&field, 1_061))
            .expect_err("stale miss");
        assert!(past.is_stale());
    }

    #[test]
    fn test_cache_control_max_stale_flags_value() {
        let mut fixture = Fixture::new().received(1_000);
        fixture.headers = CacheHeaders::builder().add(MAX_STALE, 10).build();
        let field = name_field();
        let resolver = cache_control(60);

        let stale = resolver
            .resolve_field(&fixture.ctx(&field, 1_070))
            .expect("within allowance");
        assert!(stale.stale);

        assert!(resolver.resolve_field(&fixture.ctx(&field, 1_071)).is_err());
    }

    #[test]
    fn test_cache_control_expiration_date() {
        let mut fixture = Fixture::new();
        fixture
            .metadata
            .entry("name".to_string())
            .or_default()
            .insert(EXPIRATION_DATE.to_string(), Value::Int(500));
        let field = name_field();
        let resolver = cache_control(u64::MAX);

        assert!(resolver.resolve_field(&fixture.ctx(&field, 500)).is_ok());
        assert!(resolver.resolve_field(&fixture.ctx(&field, 501)).is_err());
    }

    #[test]
    fn test_staleness_thresholds() {
        assert_eq!(staleness(0, 0), Staleness::Fresh);
        assert_eq!(staleness(1, 0), Staleness::Expired);
        assert_eq!(staleness(5, 5), Staleness::Stale);
        assert_eq!(staleness(6, 5), Staleness::Expired);
        assert_eq!(staleness(-30, 0), Staleness::Fresh);
        assert_eq!(staleness(0, -5), Staleness::Fresh);
        assert_eq!(staleness(1, -1), Staleness::Expired);
        assert_eq!(staleness(i64::MAX, i64::MAX), Staleness::Stale);
    }
}

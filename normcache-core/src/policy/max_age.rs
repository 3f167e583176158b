//! Freshness policies.

use std::collections::HashMap;
use std::time::Duration;

/// One step of the field path from the operation root to a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub parent_type: String,
    pub field_name: String,
    /// Raw type name of the field.
    pub field_type: String,
    pub is_composite: bool,
}

impl FieldInfo {
    pub fn new(
        parent_type: impl Into<String>,
        field_name: impl Into<String>,
        field_type: impl Into<String>,
        is_composite: bool,
    ) -> Self {
        Self {
            parent_type: parent_type.into(),
            field_name: field_name.into(),
            field_type: field_type.into(),
            is_composite,
        }
    }

    /// `Type.field` schema coordinate.
    pub fn coordinate(&self) -> String {
        format!("{}.{}", self.parent_type, self.field_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaxAgeContext {
    pub field_path: Vec<FieldInfo>,
}

impl MaxAgeContext {
    pub fn new(field_path: Vec<FieldInfo>) -> Self {
        Self { field_path }
    }

    /// Context of the parent field.
    pub fn parent(&self) -> MaxAgeContext {
        let mut field_path = self.field_path.clone();
        field_path.pop();
        Self { field_path }
    }
}

/// Maximum age a field may reach before it is stale.
///
/// `Duration::ZERO` means "never store"; `Duration::MAX` means "never expires".
pub trait MaxAgeProvider: Send + Sync {
    fn max_age(&self, context: &MaxAgeContext) -> Duration;
}

/// Saturating whole seconds of a duration.
pub fn duration_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

/// The same max-age for every field.
#[derive(Debug, Clone, Copy)]
pub struct GlobalMaxAgeProvider {
    max_age: Duration,
}

impl GlobalMaxAgeProvider {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::MAX)
    }
}

impl MaxAgeProvider for GlobalMaxAgeProvider {
    fn max_age(&self, _context: &MaxAgeContext) -> Duration {
        self.max_age
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxAge {
    Duration(Duration),
    /// Use the max-age of the parent field.
    Inherit,
}

/// Max-ages keyed by `Type` or `Type.field` schema coordinates.
///
/// Lookup order for the last field of the path:
/// 1. the field coordinate (`Type.field`), a duration or inherit;
/// 2. the field's type coordinate, a duration or inherit;
/// 3. the default, for root fields and composite fields;
/// 4. otherwise the parent field's max-age.
#[derive(Debug, Clone)]
pub struct SchemaCoordinatesMaxAgeProvider {
    coordinates: HashMap<String, MaxAge>,
    default_max_age: Duration,
}

impl SchemaCoordinatesMaxAgeProvider {
    pub fn new(default_max_age: Duration) -> Self {
        Self {
            coordinates: HashMap::new(),
            default_max_age,
        }
    }

    pub fn with(mut self, coordinate: impl Into<String>, max_age: MaxAge) -> Self {
        self.coordinates.insert(coordinate.into(), max_age);
        self
    }

    fn resolve(&self, path: &[FieldInfo]) -> Duration {
        let Some((field, parents)) = path.split_last() else {
            return self.default_max_age;
        };

        match self.coordinates.get(&field.coordinate()) {
            Some(MaxAge::Duration(d)) => return *d,
            Some(MaxAge::Inherit) => return self.resolve(parents),
            None => {}
        }
        match self.coordinates.get(&field.field_type) {
            Some(MaxAge::Duration(d)) => return *d,
            Some(MaxAge::Inherit) => return self.resolve(parents),
            None => {}
        }
        if parents.is_empty() || field.is_composite {
            return self.default_max_age;
        }
        self.resolve(parents)
    }
}

impl MaxAgeProvider for SchemaCoordinatesMaxAgeProvider {
    fn max_age(&self, context: &MaxAgeContext) -> Duration {
        self.resolve(&context.field_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> MaxAgeContext {
        MaxAgeContext::new(vec![
            FieldInfo::new("Query", "user", "User", true),
            FieldInfo::new("User", "name", "String", false),
        ])
    }

    #[test]
    fn test_field_coordinate_wins() {
        let provider = SchemaCoordinatesMaxAgeProvider::new(Duration::from_secs(10))
            .with("User.name", MaxAge::Duration(Duration::from_secs(60)))
            .with("String", MaxAge::Duration(Duration::from_secs(5)));
        assert_eq!(provider.max_age(&path()), Duration::from_secs(60));
    }

    #[test]
    fn test_type_coordinate_before_default() {
        let provider = SchemaCoordinatesMaxAgeProvider::new(Duration::from_secs(10))
            .with("User", MaxAge::Duration(Duration::from_secs(30)));
        let ctx = MaxAgeContext::new(vec![FieldInfo::new("Query", "user", "User", true)]);
        assert_eq!(provider.max_age(&ctx), Duration::from_secs(30));
    }

    #[test]
    fn test_leaf_inherits_parent() {
        let provider = SchemaCoordinatesMaxAgeProvider::new(Duration::from_secs(10))
            .with("User", MaxAge::Duration(Duration::from_secs(30)));
        assert_eq!(provider.max_age(&path()), Duration::from_secs(30));
    }

    #[test]
    fn test_explicit_inherit() {
        let provider = SchemaCoordinatesMaxAgeProvider::new(Duration::from_secs(10))
            .with("Query.user", MaxAge::Duration(Duration::from_secs(90)))
            .with("User.name", MaxAge::Inherit);
        assert_eq!(provider.max_age(&path()), Duration::from_secs(90));
    }

    #[test]
    fn test_composite_gets_default() {
        let provider = SchemaCoordinatesMaxAgeProvider::new(Duration::from_secs(10))
            .with("Query.viewer", MaxAge::Duration(Duration::from_secs(90)));
        let ctx = MaxAgeContext::new(vec![
            FieldInfo::new("Query", "viewer", "User", true),
            FieldInfo::new("User", "repo", "Repository", true),
        ]);
        assert_eq!(provider.max_age(&ctx), Duration::from_secs(10));
        assert_eq!(provider.max_age(&ctx.parent()), Duration::from_secs(90));
    }

    #[test]
    fn test_duration_secs_saturates() {
        assert_eq!(duration_secs(Duration::MAX), i64::MAX);
        assert_eq!(duration_secs(Duration::from_secs(7)), 7);
    }
}

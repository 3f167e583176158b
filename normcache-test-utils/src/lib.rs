//! normcache Test Utilities
//!
//! Shared test infrastructure for the normcache workspace:
//! - A small fixture schema (users, repositories) as compiled selections
//! - Response and record fixtures
//! - Proptest generators for responses, selection sets and record graphs
//! - Assertions for normcache-specific results

pub use normcache_core::{
    Argument, CacheError, CacheHeaders, CacheKey, CacheResult, CompiledField, CompiledFragment,
    FieldType, MissError, Object, Operation, Record, Selection, Value, Variables,
};
pub use normcache_storage::{DefaultRecordMerger, MemoryStorage, Storage};

// ============================================================================
// SCHEMA FIXTURES
// ============================================================================

pub mod schema {
    //! Compiled selections over a small schema:
    //!
    //! ```graphql
    //! type Query { user(id: ID!): User, users: [User!]!, viewer: Viewer,
    //!              repository(id: ID!): Repository,
    //!              usersConnection(first: Int, after: String): UserConnection! }
    //! type User { id: ID!, name: String, age: Int, friends: [User] }
    //! type Bot { model: String }
    //! type Viewer { login: String!, settings: Settings }
    //! type Repository { id: ID!, name: String!, starGazers: [User!]! }
    //! type UserConnection { edges: [UserEdge!]!, pageInfo: PageInfo! }
    //! type UserEdge { cursor: String!, node: User! }
    //! type PageInfo { startCursor: String, endCursor: String, hasNextPage: Boolean! }
    //! ```

    use super::*;

    fn scalar(name: &str, ty: &str) -> Selection {
        CompiledField::builder(name, FieldType::scalar(ty)).build().into()
    }

    fn non_null_scalar(name: &str, ty: &str) -> Selection {
        CompiledField::builder(name, FieldType::scalar(ty).non_null())
            .build()
            .into()
    }

    fn aliased(alias: &str, name: &str, ty: &str) -> Selection {
        CompiledField::builder(name, FieldType::scalar(ty))
            .alias(alias)
            .build()
            .into()
    }

    pub fn id_field() -> Selection {
        non_null_scalar("id", "ID")
    }

    /// `__typename id name`
    pub fn user_fields() -> Vec<Selection> {
        vec![
            non_null_scalar("__typename", "String"),
            id_field(),
            scalar("name", "String"),
        ]
    }

    /// Optional pieces of a `User` selection set, in document order:
    /// `__typename name displayName: name years: age
    ///  ... on User { name age } ... on Bot { model }`
    pub fn user_selection_pieces() -> Vec<Selection> {
        vec![
            non_null_scalar("__typename", "String"),
            scalar("name", "String"),
            aliased("displayName", "name", "String"),
            aliased("years", "age", "Int"),
            CompiledFragment::new("User", ["User"])
                .with_selection(scalar("name", "String"))
                .with_selection(scalar("age", "Int"))
                .into(),
            CompiledFragment::new("Bot", ["Bot"])
                .with_selection(scalar("model", "String"))
                .into(),
        ]
    }

    /// `friends { ... }`, optionally aliased.
    pub fn friends_field(alias: Option<&str>, selections: Vec<Selection>) -> CompiledField {
        let mut builder = CompiledField::builder("friends", FieldType::object("User").list());
        if let Some(alias) = alias {
            builder = builder.alias(alias);
        }
        builder.selections(selections).build()
    }

    /// `users { ... }`, optionally aliased.
    pub fn users_field(alias: Option<&str>, selections: Vec<Selection>) -> CompiledField {
        let ty = FieldType::object("User").non_null().list().non_null();
        let mut builder = CompiledField::builder("users", ty);
        if let Some(alias) = alias {
            builder = builder.alias(alias);
        }
        builder.selections(selections).build()
    }

    /// `__typename id name age friends { __typename id name }`
    pub fn user_with_friends() -> Vec<Selection> {
        let mut fields = user_fields();
        fields.push(scalar("age", "Int"));
        fields.push(friends_field(None, user_fields()).into());
        fields
    }

    /// `user(id: $id)` with `id` declared as the key argument.
    pub fn user_field(selections: Vec<Selection>) -> CompiledField {
        CompiledField::builder("user", FieldType::object("User"))
            .argument(Argument::variable("id", "id").key())
            .selections(selections)
            .build()
    }

    pub fn user_query() -> Operation {
        Operation::query("User", vec![user_field(user_fields()).into()])
    }

    pub fn users_query() -> Operation {
        Operation::query("Users", vec![users_field(None, user_with_friends()).into()])
    }

    /// `viewer { login settings { theme } }`, an object without identity.
    pub fn viewer_query() -> Operation {
        Operation::query(
            "Viewer",
            vec![CompiledField::builder("viewer", FieldType::object("Viewer"))
                .selection(non_null_scalar("login", "String"))
                .selection(
                    CompiledField::builder("settings", FieldType::object("Settings"))
                        .selection(scalar("theme", "String"))
                        .build(),
                )
                .build()
                .into()],
        )
    }

    /// `repository(id: $id) { __typename id name starGazers { ... } }`
    pub fn repository_query() -> Operation {
        Operation::query(
            "Repository",
            vec![CompiledField::builder("repository", FieldType::object("Repository"))
                .argument(Argument::variable("id", "id").key())
                .selection(non_null_scalar("__typename", "String"))
                .selection(non_null_scalar("id", "ID"))
                .selection(non_null_scalar("name", "String"))
                .selection(
                    CompiledField::builder(
                        "starGazers",
                        FieldType::object("User").non_null().list().non_null(),
                    )
                    .selections(user_fields())
                    .build(),
                )
                .build()
                .into()],
        )
    }

    /// `usersConnection(first: $first, after: $after) { edges { cursor node
    /// { ... } } pageInfo { startCursor endCursor hasNextPage } }`
    pub fn users_connection_query() -> Operation {
        let edge_type = FieldType::object("UserEdge").non_null().list().non_null();
        let edge = CompiledField::builder("edges", edge_type)
            .selection(non_null_scalar("cursor", "String"))
            .selection(
                CompiledField::builder("node", FieldType::object("User").non_null())
                    .selections(user_fields())
                    .build(),
            )
            .build();
        let page_info_type = FieldType::object("PageInfo").non_null();
        let page_info = CompiledField::builder("pageInfo", page_info_type)
            .selection(scalar("startCursor", "String"))
            .selection(scalar("endCursor", "String"))
            .selection(non_null_scalar("hasNextPage", "Boolean"))
            .build();
        Operation::query(
            "UsersConnection",
            vec![CompiledField::builder(
                "usersConnection",
                FieldType::object("UserConnection").non_null(),
            )
            .argument(Argument::variable("first", "first").pagination())
            .argument(Argument::variable("after", "after").pagination())
            .selection(edge)
            .selection(page_info)
            .build()
            .into()],
        )
    }

    pub fn page_variables(first: i64, after: Option<&str>) -> Variables {
        let mut variables = Variables::new();
        variables.insert("first".to_string(), Value::Int(first));
        if let Some(cursor) = after {
            variables.insert("after".to_string(), Value::from(cursor));
        }
        variables
    }

    pub fn id_variables(id: &str) -> Variables {
        let mut variables = Variables::new();
        variables.insert("id".to_string(), Value::from(id));
        variables
    }
}

// ============================================================================
// DATA FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built responses and records.

    use super::*;

    /// Convert a JSON object literal into a response object.
    #[track_caller]
    pub fn object(json: serde_json::Value) -> Object {
        match Value::from(json) {
            Value::Object(obj) => obj,
            other => panic!("Expected a JSON object, got: {:?}", other),
        }
    }

    pub fn user_json(id: &str, name: &str) -> serde_json::Value {
        serde_json::json!({"__typename": "User", "id": id, "name": name})
    }

    /// Response of [`schema::user_query`](crate::schema::user_query).
    pub fn user_response(id: &str, name: &str) -> Object {
        object(serde_json::json!({ "user": user_json(id, name) }))
    }

    /// Friends of pool user `id`: none, one or two other pool users.
    pub fn friend_ids(id: u8) -> Vec<u8> {
        [(id + 1) % POOL_SIZE, (id + 3) % POOL_SIZE]
            .into_iter()
            .take(usize::from(id % 3))
            .collect()
    }

    fn pool_age(id: u8) -> serde_json::Value {
        if id % 2 == 0 {
            serde_json::Value::Null
        } else {
            serde_json::json!(i64::from(id) * 10)
        }
    }

    /// Deterministic user data: the same id always yields the same object.
    pub fn pool_user(id: u8) -> serde_json::Value {
        let friends: Vec<serde_json::Value> = friend_ids(id)
            .iter()
            .map(|f| user_json(&f.to_string(), &format!("user-{f}")))
            .collect();
        serde_json::json!({
            "__typename": "User",
            "id": id.to_string(),
            "name": format!("user-{id}"),
            "age": pool_age(id),
            "friends": friends,
        })
    }

    /// Pool user `id` as a server would answer `selections`: keys are
    /// response names and fragments on `User` are expanded in place.
    #[track_caller]
    pub fn project_user(id: u8, selections: &[Selection]) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        project_into(id, selections, &mut out);
        serde_json::Value::Object(out)
    }

    #[track_caller]
    fn project_into(
        id: u8,
        selections: &[Selection],
        out: &mut serde_json::Map<String, serde_json::Value>,
    ) {
        for selection in selections {
            match selection {
                Selection::Field(field) => {
                    let value = match field.name.as_str() {
                        "__typename" => serde_json::json!("User"),
                        "id" => serde_json::json!(id.to_string()),
                        "name" => serde_json::json!(format!("user-{id}")),
                        "age" => pool_age(id),
                        "friends" => friend_ids(id)
                            .into_iter()
                            .map(|f| project_user(f, &field.selections))
                            .collect(),
                        other => panic!("User has no field {:?}", other),
                    };
                    out.insert(field.response_name().to_string(), value);
                }
                Selection::Fragment(fragment) => {
                    if fragment.applies_to(Some("User"), "User") {
                        project_into(id, &fragment.selections, out);
                    }
                }
            }
        }
    }

    /// Number of distinct users [`pool_user`] draws from.
    pub const POOL_SIZE: u8 = 6;

    /// Response of [`schema::users_query`](crate::schema::users_query).
    pub fn users_response(ids: &[u8]) -> Object {
        let users: Vec<serde_json::Value> = ids.iter().map(|id| pool_user(*id)).collect();
        object(serde_json::json!({ "users": users }))
    }

    pub fn repository_response(id: &str, gazers: &[(&str, &str)]) -> Object {
        let gazers: Vec<serde_json::Value> =
            gazers.iter().map(|(id, name)| user_json(id, name)).collect();
        object(serde_json::json!({
            "repository": {
                "__typename": "Repository",
                "id": id,
                "name": format!("repo-{id}"),
                "starGazers": gazers,
            }
        }))
    }

    /// One page of [`schema::users_connection_query`](crate::schema::users_connection_query)
    /// holding users `ids`, with cursor `c<id>` per edge.
    pub fn users_page(ids: &[u8], has_next_page: bool) -> Object {
        let edges: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "cursor": format!("c{id}"),
                    "node": user_json(&id.to_string(), &format!("user-{id}")),
                })
            })
            .collect();
        let cursor = |id: Option<&u8>| id.map(|id| format!("c{id}"));
        object(serde_json::json!({
            "usersConnection": {
                "edges": edges,
                "pageInfo": {
                    "startCursor": cursor(ids.first()),
                    "endCursor": cursor(ids.last()),
                    "hasNextPage": has_next_page,
                }
            }
        }))
    }

    /// A memory storage seeded with `records`.
    #[track_caller]
    pub fn memory_storage_with(records: Vec<Record>) -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage
            .merge_records(records, &CacheHeaders::none(), &DefaultRecordMerger)
            .expect("seeding memory storage should succeed");
        storage
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for normcache data.

    use super::fixtures::{project_user, users_response, POOL_SIZE};
    use super::*;
    use proptest::prelude::*;

    /// Ids from the fixture user pool, repeats allowed.
    pub fn arb_user_ids() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(0..POOL_SIZE, 0..8)
    }

    /// A users response where repeated users are identical.
    pub fn arb_users_response() -> impl Strategy<Value = Object> {
        arb_user_ids().prop_map(|ids| users_response(&ids))
    }

    /// `id` plus any subsequence of [`schema::user_selection_pieces`].
    pub fn arb_user_selections() -> impl Strategy<Value = Vec<Selection>> {
        let pieces = schema::user_selection_pieces();
        let len = pieces.len();
        prop::sample::subsequence(pieces, 0..=len).prop_map(|picked| {
            let mut selections = vec![schema::id_field()];
            selections.extend(picked);
            selections
        })
    }

    /// A `users` operation with generated selections and its matching
    /// response.
    ///
    /// The root field may be aliased. Friends may be selected, aliased and
    /// wrapped in a `... on User` fragment, each with its own selections.
    pub fn arb_users_operation() -> impl Strategy<Value = (Operation, Object)> {
        (
            arb_user_ids(),
            arb_user_selections(),
            prop::option::of((arb_user_selections(), any::<bool>(), any::<bool>())),
            any::<bool>(),
        )
            .prop_map(|(ids, mut selections, friends, alias_root)| {
                if let Some((friend_selections, alias, in_fragment)) = friends {
                    let field =
                        schema::friends_field(alias.then_some("buddies"), friend_selections);
                    if in_fragment {
                        let fragment =
                            CompiledFragment::new("User", ["User"]).with_selection(field);
                        selections.push(fragment.into());
                    } else {
                        selections.push(field.into());
                    }
                }

                let users: Vec<serde_json::Value> = ids
                    .iter()
                    .map(|id| project_user(*id, &selections))
                    .collect();
                let field = schema::users_field(alias_root.then_some("everyone"), selections);
                let mut data = Object::new();
                data.insert(
                    field.response_name().to_string(),
                    Value::from(serde_json::Value::Array(users)),
                );
                (Operation::query("Users", vec![field.into()]), data)
            })
    }

    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Boolean),
            any::<i64>().prop_map(Value::Int),
            "[a-z ]{0,12}".prop_map(Value::String),
        ]
    }

    /// Key of node `i` in generated graphs.
    pub fn node_key(i: usize) -> CacheKey {
        CacheKey::declared("Node", [i.to_string()])
    }

    /// Records `Node:0..n`, each with a scalar and references to arbitrary
    /// other nodes (cycles and self references included).
    pub fn arb_record_graph(max_nodes: usize) -> impl Strategy<Value = Vec<Record>> {
        (1..=max_nodes.max(1)).prop_flat_map(|n| {
            prop::collection::vec(
                (arb_scalar(), prop::collection::vec(0..n, 0..3)),
                n,
            )
            .prop_map(|nodes| {
                nodes
                    .into_iter()
                    .enumerate()
                    .map(|(i, (scalar, edges))| {
                        let refs: Vec<Value> =
                            edges.into_iter().map(|e| Value::Reference(node_key(e))).collect();
                        Record::new(node_key(i))
                            .with_field("value", scalar)
                            .with_field("edges", Value::List(refs))
                    })
                    .collect()
            })
        })
    }

    /// Patches to one record's `name` field, one per mutation.
    pub fn arb_patch_names() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-z]{1,6}", 1..5)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion functions for normcache-specific validation.

    use super::*;

    /// Assert that a CacheResult is a cache miss (not a stale one).
    #[track_caller]
    pub fn assert_cache_miss<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Miss(MissError::CacheMiss { .. })) => {}
            other => panic!("Expected CacheMiss, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult is a stale miss.
    #[track_caller]
    pub fn assert_stale_miss<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Miss(MissError::StaleMiss { .. })) => {}
            other => panic!("Expected StaleMiss, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cancelled<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Cancelled) => {}
            other => panic!("Expected Cancelled, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a stored record holds `value` under `field`.
    #[track_caller]
    pub fn assert_field(storage: &dyn Storage, key: &str, field: &str, value: &Value) {
        let record = storage
            .load_record(&CacheKey::new(key), &CacheHeaders::none())
            .expect("load should succeed");
        match record {
            Some(record) => assert_eq!(
                record.get(field),
                Some(value),
                "Unexpected value for {key}.{field}"
            ),
            None => panic!("Expected record {key} to exist"),
        }
    }

    /// Assert that no record is stored under `key`.
    #[track_caller]
    pub fn assert_absent(storage: &dyn Storage, key: &str) {
        let record = storage
            .load_record(&CacheKey::new(key), &CacheHeaders::none())
            .expect("load should succeed");
        assert!(record.is_none(), "Expected {key} to be absent, got: {:?}", record);
    }
}

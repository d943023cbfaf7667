//! Property-based tests (fuzzing) for the cache's parsers and pure helpers.
//!
//! Uses proptest to generate random/malformed inputs and verify the cache
//! never panics, only returns clean errors, and that its encodings round-trip.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{json, Value};

use cmdb_cache::cache::mainline::rank_mainline;
use cmdb_cache::event::{Decoded, InstanceFields, MainlineAssociation};
use cmdb_cache::keys::{KeyKind, ListEntry};
use cmdb_cache::refresh::diff_members;
use cmdb_cache::{Filter, KeyGen};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,  // depth
        64, // max nodes
        10, // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

/// Entity namespaces as the caches name them
fn entity_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("biz".to_string()),
        Just("set".to_string()),
        Just("module".to_string()),
        Just("host".to_string()),
        "[a-z_]{1,12}".prop_map(|object| format!("custom.{}", object)),
    ]
}

/// Instance names, including `:` and unicode
fn name_strategy() -> impl Strategy<Value = String> {
    "[^\\x00]{1,40}"
}

/// A mainline chain of distinct custom levels between biz and set
fn chain_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-z]{3,8}", 0..5).prop_map(|levels| {
        let mut chain = vec!["biz".to_string()];
        chain.extend(levels.into_iter().filter(|l| !matches!(l.as_str(), "biz" | "set" | "module" | "host")));
        chain.extend(["set", "module", "host"].iter().map(|s| s.to_string()));
        chain
    })
}

// =============================================================================
// Key Parsing Tests
// =============================================================================

proptest! {
    /// Parsing should never panic on arbitrary strings
    #[test]
    fn fuzz_key_parse_arbitrary(key in ".*") {
        let keys = KeyGen::new("cc").unwrap();
        let _ = keys.parse(&key);
    }

    /// Every generated id-carrying key parses back to its parts
    #[test]
    fn prop_key_round_trip(entity in entity_strategy(), id in 1i64..i64::MAX) {
        let gen = KeyGen::new("cc").unwrap();
        let keys = gen.entity(&entity);
        let cases = [
            (keys.detail(id), KeyKind::Detail),
            (keys.detail_expire(id), KeyKind::DetailExpire),
            (keys.detail_lock(id), KeyKind::DetailLock),
            (keys.list(id), KeyKind::List),
            (keys.list_expire(id), KeyKind::ListExpire),
            (keys.list_lock(id), KeyKind::ListLock),
            (keys.id_list_temp(id), KeyKind::IdListTemp),
        ];
        for (key, kind) in cases {
            let parsed = gen.parse(&key).expect("generated key should parse");
            prop_assert_eq!(&parsed.entity, &entity);
            prop_assert_eq!(parsed.kind, kind);
            prop_assert_eq!(parsed.id, Some(id.to_string()));
        }
    }

    /// Keys of another prefix are never claimed
    #[test]
    fn prop_foreign_prefix_rejected(entity in entity_strategy(), id in 1i64..1_000_000) {
        let ours = KeyGen::new("cc").unwrap();
        let theirs = KeyGen::new("cc2").unwrap();
        prop_assert!(ours.parse(&theirs.entity(&entity).detail(id)).is_none());
    }
}

// =============================================================================
// List Entry Tests
// =============================================================================

proptest! {
    /// Decoding should never panic on arbitrary members
    #[test]
    fn fuzz_list_entry_decode(member in ".*") {
        match ListEntry::decode(&member) {
            Ok(entry) => prop_assert!(entry.id > 0 && !entry.name.is_empty()),
            Err(_) => {}
        }
        let _ = ListEntry::recover_id(&member);
    }

    /// Encoded entries decode to themselves, names with ':' included
    #[test]
    fn prop_list_entry_round_trip(id in 1i64..i64::MAX, parent in any::<i64>(), name in name_strategy()) {
        let entry = ListEntry::new(id, parent, name);
        let member = entry.encode();
        prop_assert_eq!(ListEntry::decode(&member).unwrap(), entry.clone());
        prop_assert!(entry.same_instance(&member));
    }

    /// Reconciliation diffs turn `actual` into `desired`
    #[test]
    fn prop_diff_members_converges(
        desired in prop::collection::vec("[a-z0-9:]{1,8}", 0..20),
        actual in prop::collection::vec("[a-z0-9:]{1,8}", 0..20),
    ) {
        let (add, remove) = diff_members(&desired, &actual);
        let mut result: std::collections::BTreeSet<String> = actual.iter().cloned().collect();
        for member in &remove {
            result.remove(member);
        }
        result.extend(add.iter().cloned());
        let wanted: std::collections::BTreeSet<String> = desired.iter().cloned().collect();
        prop_assert_eq!(&result, &wanted);

        let (add, remove) = diff_members(&desired, &result.into_iter().collect::<Vec<_>>());
        prop_assert!(add.is_empty() && remove.is_empty());
    }
}

// =============================================================================
// Filter and Decode Tests
// =============================================================================

proptest! {
    /// Filter evaluation should never panic on arbitrary documents or patterns
    #[test]
    fn fuzz_filter_matches(doc in arbitrary_json_strategy(), pattern in ".*", field in "[a-z_.]{0,12}") {
        let filters = [
            Filter::eq(field.clone(), 5),
            Filter::is_in(field.clone(), vec![1, 2, 3]),
            Filter::gt(field.clone(), "m"),
            Filter::regex(field.clone(), pattern),
            Filter::All.and(Filter::eq("bk_biz_id", 5)),
        ];
        for filter in &filters {
            let _ = filter.matches(&doc);
        }
        prop_assert!(Filter::All.matches(&doc));
    }

    /// Escaped names always match themselves, whatever the case
    #[test]
    fn prop_escaped_regex_matches_name(name in name_strategy()) {
        let doc = json!({"bk_set_name": name.to_uppercase()});
        let filter = Filter::regex("bk_set_name", regex::escape(&name.to_uppercase()));
        prop_assert!(filter.matches(&doc));
    }

    /// Decoding arbitrary documents either yields a valid record or a skip
    #[test]
    fn fuzz_instance_decode(doc in arbitrary_json_strategy()) {
        let fields = InstanceFields {
            id: "bk_set_id",
            name: "bk_set_name",
            parent: Some("bk_parent_id"),
            scope: Some("bk_biz_id"),
        };
        if let Decoded::Ok(record) = fields.decode(&doc) {
            prop_assert!(record.id > 0);
            prop_assert!(!record.name.is_empty());
        }
        let _ = MainlineAssociation::decode(&doc);
    }
}

// =============================================================================
// Mainline Ranking Tests
// =============================================================================

proptest! {
    /// Ranking recovers a chain from its edges in any order
    #[test]
    fn prop_rank_mainline_recovers_chain(chain in chain_strategy(), seed in any::<u64>()) {
        let mut edges: Vec<MainlineAssociation> = chain
            .windows(2)
            .map(|pair| MainlineAssociation::new(pair[1].as_str(), pair[0].as_str()))
            .collect();
        let len = edges.len();
        if len > 1 {
            edges.rotate_left((seed as usize) % len);
        }
        prop_assert_eq!(rank_mainline(&edges), chain);
    }

    /// Arbitrary (possibly cyclic) edges never loop forever and always start at biz
    #[test]
    fn fuzz_rank_mainline_arbitrary(
        pairs in prop::collection::vec(("[a-d]{1,2}", "[a-d]{1,2}"), 0..12),
    ) {
        let mut edges: Vec<MainlineAssociation> = pairs
            .iter()
            .map(|(object, parent)| MainlineAssociation::new(object.as_str(), parent.as_str()))
            .collect();
        edges.push(MainlineAssociation::new("a", "biz"));
        let ranked = rank_mainline(&edges);
        prop_assert_eq!(ranked.first().map(String::as_str), Some("biz"));
        let unique: std::collections::HashSet<&String> = ranked.iter().collect();
        prop_assert_eq!(unique.len(), ranked.len());
    }
}

//! Property-based test generators using proptest.
//!
//! Provides strategies for documents and document streams, plus a simple
//! model of what a partition should contain after a stream is applied.

use crate::fixtures::TEST_SOURCE;
use proptest::prelude::*;
use sediment_core::{Document, DocumentKind, Locator};
use std::collections::BTreeMap;

/// Strategy for primary keys drawn from a small key space.
///
/// A small space makes updates and deletes hit existing documents.
pub fn pk_strategy(key_space: usize) -> impl Strategy<Value = String> {
    (0..key_space.max(1)).prop_map(|i| format!("pk-{i}"))
}

/// Strategy for field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,6}").expect("Invalid regex")
}

/// Strategy for a non-empty field map.
pub fn fields_strategy() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(
        field_name_strategy(),
        prop::string::string_regex("[a-zA-Z0-9 ]{0,12}").expect("Invalid regex"),
        1..4,
    )
}

/// Strategy for one document without a locator.
pub fn document_strategy(key_space: usize) -> impl Strategy<Value = Document> {
    prop_oneof![
        4 => (pk_strategy(key_space), fields_strategy()).prop_map(|(pk, fields)| Document {
            fields,
            ..Document::add(pk)
        }),
        2 => (pk_strategy(key_space), fields_strategy()).prop_map(|(pk, fields)| Document {
            fields,
            ..Document::update(pk)
        }),
        1 => pk_strategy(key_space).prop_map(Document::delete),
    ]
}

/// Strategy for a document stream with strictly increasing locators.
///
/// The `i`-th document sits at offset `i + 1` of the test source.
pub fn document_stream_strategy(key_space: usize, len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<Document>> {
    prop::collection::vec(document_strategy(key_space), len).prop_map(|docs| {
        docs.into_iter()
            .enumerate()
            .map(|(i, doc)| doc.with_locator(Locator::new(TEST_SOURCE, i as i64 + 1)))
            .collect()
    })
}

/// Expected primary key to fields mapping after applying `docs` in order.
///
/// Adds replace a document, updates merge into a live document and are
/// lost otherwise, deletes remove it.
pub fn expected_state<'a>(docs: impl IntoIterator<Item = &'a Document>) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut state: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for doc in docs {
        match doc.kind {
            DocumentKind::Add => {
                state.insert(doc.pk.clone(), doc.fields.clone());
            }
            DocumentKind::Update => {
                if let Some(fields) = state.get_mut(&doc.pk) {
                    fields.extend(doc.fields.clone());
                }
            }
            DocumentKind::Delete => {
                state.remove(&doc.pk);
            }
        }
    }
    state
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 500,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn stream_locators_increase(docs in document_stream_strategy(8, 1..40)) {
            for pair in docs.windows(2) {
                prop_assert!(pair[1].locator.covers(&pair[0].locator));
                prop_assert_ne!(pair[0].locator, pair[1].locator);
            }
        }

        #[test]
        fn updates_carry_fields(doc in document_strategy(4)) {
            if doc.kind != DocumentKind::Delete {
                prop_assert!(!doc.fields.is_empty());
            }
        }
    }

    #[test]
    fn model_follows_document_semantics() {
        let docs = [
            Document::add("a").field("x", "1"),
            Document::update("a").field("y", "2"),
            Document::update("b").field("y", "3"),
            Document::add("b").field("z", "4"),
            Document::delete("b"),
        ];
        let state = expected_state(&docs);
        assert_eq!(state.len(), 1);
        assert_eq!(state["a"]["x"], "1");
        assert_eq!(state["a"]["y"], "2");
    }
}

//! End-to-end scenarios across building, merging and online serving.

use proptest::prelude::*;
use sediment_core::counter::names;
use sediment_core::{
    BuildConfig, BuildStatus, CoreError, CounterMap, Document, IndexBuilder, Locator, MergeConfig, OpenStatus,
    ParallelBuildInfo, ParallelPartitionDataMerger, PartitionStatus, ReopenStatus, SegmentId, VersionId, VersionStore,
};
use sediment_storage::{Directory, InMemoryDirectory};
use sediment_testkit::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn lookup_field(partition: &sediment_core::OnlinePartition, pk: &str, field: &str) -> Option<String> {
    partition
        .reader()
        .and_then(|r| r.lookup(pk))
        .and_then(|doc| doc.fields.get(field).cloned())
}

#[test]
fn full_segments_are_dumped_during_build() {
    let partition = TestPartition::memory();
    let builder = partition.builder(quiet_build_config().max_docs_per_segment(2));
    for i in 0..5 {
        assert!(builder.build(at(Document::add(format!("d{i}")), i + 1)));
    }
    assert_eq!(builder.end_index(10), BuildStatus::Ok);
    let version = builder.version();
    builder.close();

    assert_eq!(version.segments().len(), 3);
    assert_eq!(version.locator(), Locator::new(TEST_SOURCE, 5));
    assert_eq!(partition.latest_reader().doc_count(), 5);
}

#[test]
fn interrupted_merge_resumes_from_checkpoints() {
    let faulty = Arc::new(FaultyDirectory::new(Arc::new(InMemoryDirectory::new())));
    let partition = TestPartition::memory().with_directory(faulty.clone());
    let config = quiet_build_config()
        .max_docs_per_segment(1)
        .merge(MergeConfig::default().max_segment_count(1).merge_threads(1));
    let builder = partition.builder(config);
    for (i, pk) in ["a", "b", "c"].into_iter().enumerate() {
        assert!(builder.build(at(Document::add(pk).field("n", i.to_string()), i as i64 + 1)));
    }
    assert_eq!(builder.end_index(1), BuildStatus::Ok);
    assert_eq!(builder.version().segments().len(), 3);

    // The second work item does its work but never records its checkpoint.
    faulty.fail_next(FaultOp::Store, "checkpoints/plan_0_task_1");
    assert_eq!(builder.merge(false, 5), BuildStatus::Fail);
    assert_eq!(faulty.injected_count(), 1);
    assert_eq!(partition.latest_version().unwrap().segments().len(), 3);

    assert_eq!(builder.merge(false, 9), BuildStatus::Ok);
    assert_eq!(builder.counters().value(names::MERGE_CHECKPOINT_SKIP_COUNT), Some(1));
    let merged = builder.version();
    builder.close();

    assert_eq!(merged.segments().len(), 1);
    // The resumed plan keeps the timestamp it was created with.
    assert_eq!(merged.timestamp(), 5);
    let reader = partition.latest_reader();
    assert_eq!(reader.doc_count(), 3);
    assert_eq!(reader.lookup("b").unwrap().fields["n"], "1");
}

#[test]
fn parallel_shards_merge_into_one_version() {
    let partition = TestPartition::memory();
    let shard_docs = [
        vec![at(Document::add("a"), 1), at(Document::add("b"), 2)],
        vec![at(Document::add("c"), 3)],
    ];
    for (instance, docs) in shard_docs.into_iter().enumerate() {
        let info = ParallelBuildInfo::new(2, instance as u32, 7, VersionId::INITIAL);
        let builder = partition.builder(quiet_build_config().parallel(info));
        for doc in docs {
            assert!(builder.build(doc));
        }
        assert_eq!(builder.end_index(10 + instance as i64), BuildStatus::Ok);
        builder.close();
    }
    assert!(partition.latest_version().is_none());

    let counters = Arc::new(CounterMap::new());
    let merger = ParallelPartitionDataMerger::new(partition.context(), Arc::clone(&partition.dir), 2, Arc::clone(&counters));
    let version = merger.merge().unwrap().unwrap();

    assert_eq!(version.segments().len(), 2);
    assert_eq!(version.timestamp(), 11);
    assert_eq!(version.locator(), Locator::new(TEST_SOURCE, 3));
    assert_eq!(counters.value(names::MERGED_SEGMENT_COUNT), Some(2));
    assert!(!partition.dir.exists(&ParallelBuildInfo::new(2, 0, 7, VersionId::INITIAL).dir_name()));

    let reader = partition.latest_reader();
    for pk in ["a", "b", "c"] {
        assert!(reader.lookup(pk).is_some(), "{pk} missing after parallel merge");
    }
    // Nothing left to merge.
    assert!(merger.merge().unwrap().is_none());
}

#[test]
fn parallel_shards_extend_a_committed_base() {
    let partition = TestPartition::memory();
    let builder = partition.builder(quiet_build_config().max_docs_per_segment(1));
    assert!(builder.build(at(Document::add("a").field("f", "base"), 1)));
    assert!(builder.build(at(Document::add("b"), 2)));
    assert_eq!(builder.end_index(10), BuildStatus::Ok);
    let base = builder.version();
    builder.close();
    assert_eq!(base.segments(), &[SegmentId::new(0), SegmentId::new(1)]);

    let shard_docs = [
        vec![at(Document::add("c"), 3)],
        vec![at(Document::add("d"), 4), at(Document::update("a").field("f", "shard"), 5)],
    ];
    for (instance, docs) in shard_docs.into_iter().enumerate() {
        let info = ParallelBuildInfo::new(2, instance as u32, 8, base.id());
        let builder = partition.builder(quiet_build_config().parallel(info));
        for doc in docs {
            assert!(builder.build(doc));
        }
        assert_eq!(builder.end_index(20 + instance as i64), BuildStatus::Ok);
        builder.close();
    }
    assert_eq!(partition.latest_version().unwrap().id(), base.id());

    let merger = ParallelPartitionDataMerger::new(partition.context(), Arc::clone(&partition.dir), 2, Arc::new(CounterMap::new()));
    let merged = merger.merge().unwrap().unwrap();

    assert_eq!(merged.id(), base.id().next());
    assert_eq!(
        merged.segments(),
        &[SegmentId::new(0), SegmentId::new(1), SegmentId::new(2), SegmentId::new(3)]
    );
    assert_eq!(merged.locator(), Locator::new(TEST_SOURCE, 5));
    assert_eq!(merged.timestamp(), 21);

    let reader = partition.latest_reader();
    assert_eq!(reader.doc_count(), 4);
    assert_eq!(reader.lookup("a").unwrap().fields["f"], "shard");
    for pk in ["b", "c", "d"] {
        assert!(reader.lookup(pk).is_some(), "{pk} missing after parallel merge");
    }
}

#[test]
fn shards_introducing_the_same_segment_are_rejected() {
    let partition = TestPartition::memory();
    // Disagreeing shard counts make both shards allocate segment 1.
    let infos = [
        ParallelBuildInfo::new(1, 0, 3, VersionId::INITIAL),
        ParallelBuildInfo::new(2, 1, 3, VersionId::INITIAL),
    ];
    for (info, pks) in infos.into_iter().zip([&["a", "b"][..], &["c"][..]]) {
        let builder = partition.builder(quiet_build_config().max_docs_per_segment(1).parallel(info));
        for pk in pks {
            assert!(builder.build(Document::add(*pk)));
        }
        assert_eq!(builder.end_index(1), BuildStatus::Ok);
        builder.close();
    }

    let merger = ParallelPartitionDataMerger::new(partition.context(), Arc::clone(&partition.dir), 2, Arc::new(CounterMap::new()));
    let err = merger.merge().unwrap_err();
    assert!(matches!(err, CoreError::InconsistentState { .. }), "unexpected error {err}");
    assert!(partition.latest_version().is_none());
}

#[test]
fn online_partition_follows_new_versions() {
    let partition = TestPartition::file();
    partition.build_version(
        [at(Document::add("a").field("f", "1"), 1), at(Document::add("b"), 2)],
        10,
    );

    let online = partition.online(quiet_online_config());
    assert_eq!(online.open(None), OpenStatus::Ok);
    assert_eq!(online.status(), PartitionStatus::Serving);

    assert!(online.build(at(Document::add("c"), 3)));
    assert!(online.build(at(Document::update("a").field("f", "2"), 4)));
    assert_eq!(lookup_field(&online, "a", "f").as_deref(), Some("2"));

    // The next offline version only reaches offset 3.
    let v2 = partition.build_version([at(Document::add("c").field("g", "x"), 3)], 20);
    assert_eq!(online.reopen(false, None), ReopenStatus::Ok);
    assert_eq!(online.version().unwrap().id(), v2.id());
    assert_eq!(lookup_field(&online, "c", "g").as_deref(), Some("x"));
    assert_eq!(lookup_field(&online, "a", "f").as_deref(), Some("2"));
    assert_eq!(online.counters().value(names::REOPEN_COUNT), Some(1));

    assert_eq!(online.reopen(false, None), ReopenStatus::NoNeed);
    assert_eq!(online.close(), OpenStatus::Ok);
    assert_eq!(online.status(), PartitionStatus::Closed);
}

#[test]
fn merged_version_is_opened_with_a_force_reopen() {
    let partition = TestPartition::memory();
    partition.build_version([at(Document::add("a").field("f", "1"), 1)], 10);
    partition.build_version([at(Document::add("b"), 2)], 11);

    let config = quiet_online_config().max_normal_reopen_removed_segments(1);
    let online = partition.online(config);
    assert_eq!(online.open(None), OpenStatus::Ok);
    assert!(online.build(at(Document::update("a").field("f", "2"), 3)));
    assert!(online.build(at(Document::add("rt"), 4)));

    let builder = partition.builder(quiet_build_config());
    assert_eq!(builder.merge(true, 12), BuildStatus::Ok);
    let merged = builder.version();
    builder.close();
    assert_eq!(merged.segments().len(), 1);

    assert_eq!(online.reopen(false, None), ReopenStatus::Ok);
    assert_eq!(online.version().unwrap().id(), merged.id());
    assert_eq!(lookup_field(&online, "a", "f").as_deref(), Some("2"));
    assert!(online.reader().unwrap().lookup("b").is_some());
    assert!(online.reader().unwrap().lookup("rt").is_some());
    assert_eq!(online.counters().value(names::DISCARDED_OPERATION_COUNT), None);
}

#[test]
fn forced_reopen_keeps_realtime_documents() {
    let partition = TestPartition::memory();
    partition.build_version([at(Document::add("a"), 1)], 10);

    let online = partition.online(quiet_online_config());
    assert_eq!(online.open(None), OpenStatus::Ok);
    for i in 0..3 {
        assert!(online.build(at(Document::add(format!("rt{i}")), 10 + i)));
    }

    let v2 = partition.build_version([at(Document::add("b"), 2)], 11);
    assert_eq!(online.reopen(true, Some(v2.id())), ReopenStatus::Ok);
    assert_eq!(online.version().unwrap().id(), v2.id());
    let reader = online.reader().unwrap();
    assert!(reader.lookup("b").is_some());
    for i in 0..3 {
        assert!(reader.lookup(&format!("rt{i}")).is_some());
    }
    assert_eq!(online.counters().value(names::REOPEN_FALLBACK_COUNT), None);
}

#[test]
fn partition_lock_is_exclusive() {
    with_file_partition(|partition, path| {
        let config = || BuildConfig::default().enable_background_tasks(false);
        let first = IndexBuilder::open_path(partition.context(), path, config()).unwrap();
        assert!(matches!(
            IndexBuilder::open_path(partition.context(), path, config()),
            Err(CoreError::PartitionLocked)
        ));
        first.close();
        let second = IndexBuilder::open_path(partition.context(), path, config()).unwrap();
        second.close();
    });
}

#[test]
fn old_versions_are_cleaned_by_merge() {
    let partition = TestPartition::memory();
    for i in 0..4 {
        partition.build_version([at(Document::add(format!("d{i}")), i + 1)], 10 + i);
    }
    let store = VersionStore::new(Arc::clone(&partition.dir));
    assert_eq!(store.list_versions().unwrap().len(), 4);

    let builder = partition.builder(quiet_build_config().keep_version_count(2));
    assert_eq!(builder.merge(true, 20), BuildStatus::Ok);
    builder.close();

    let versions = store.list_versions().unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions.last().copied(), store.latest_version_id().unwrap());
    let live: BTreeSet<_> = store.segment_dirs().unwrap().into_iter().collect();
    let latest = partition.latest_version().unwrap();
    assert!(latest.segments().iter().all(|id| live.contains(id)));
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn lookups_match_the_model_before_and_after_merge(docs in document_stream_strategy(6, 1..40)) {
        let partition = TestPartition::memory();
        let expected = expected_state(&docs);

        let builder = partition.builder(quiet_build_config().max_docs_per_segment(3));
        for doc in docs {
            prop_assert!(builder.build(doc));
        }
        prop_assert!(matches!(builder.end_index(1), BuildStatus::Ok | BuildStatus::NoNeed));

        let check = |partition: &TestPartition| -> Result<(), TestCaseError> {
            let reader = partition.latest_reader();
            prop_assert_eq!(reader.doc_count(), expected.len());
            for (pk, fields) in &expected {
                let found = reader.lookup(pk);
                prop_assert!(found.is_some(), "{} missing", pk);
                prop_assert_eq!(&found.unwrap().fields, fields);
            }
            Ok(())
        };
        check(&partition)?;

        let status = builder.merge(true, 2);
        prop_assert!(matches!(status, BuildStatus::Ok | BuildStatus::NoNeed));
        builder.close();
        check(&partition)?;
    }
}

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::semantic::embeddings::EmbeddingProvider;
use crate::semantic::pipeline::{BuildError, BuildOutcome, BuildReport, IndexBuilder, Progress};
use crate::semantic::storage::IDS_FILE;
use crate::semantic::{CancelToken, IndexLocation, IndexStore, LoadState};
use crate::tests::common::{fake_vector, write_png, write_pngs, FakeEmbedder};

struct Harness {
    store: Arc<IndexStore>,
    embedder: Arc<FakeEmbedder>,
    builder: IndexBuilder,
}

fn harness(base: &Path, root: &Path, batch_size: usize) -> Harness {
    let embedder = Arc::new(FakeEmbedder::default());
    let location = IndexLocation::resolve(base, root).unwrap();
    let store = Arc::new(IndexStore::open(location, embedder.model_id()));
    let builder = IndexBuilder::new(store.clone(), embedder.clone(), batch_size);
    Harness {
        store,
        embedder,
        builder,
    }
}

/// Collects progress updates for later inspection.
#[derive(Default)]
struct Recorder(Mutex<Vec<Progress>>);

impl Recorder {
    fn record(&self, progress: Progress) {
        self.0.lock().unwrap().push(progress);
    }

    fn updates(&self) -> Vec<(usize, usize)> {
        self.0.lock().unwrap().iter().map(|p| (p.done, p.total)).collect()
    }

    fn last(&self) -> Progress {
        *self.0.lock().unwrap().last().unwrap()
    }

    fn assert_monotonic(&self) {
        let updates = self.0.lock().unwrap();
        for pair in updates.windows(2) {
            assert!(pair[0].done <= pair[1].done, "{updates:?}");
            assert!(pair[0].percent <= pair[1].percent, "{updates:?}");
        }
    }
}

#[test]
fn test_full_build_indexes_every_image() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 4);
    write_png(root.path(), "nested/deep.png", 200);
    let h = harness(base.path(), root.path(), 16);

    let progress = Recorder::default();
    let outcome = h
        .builder
        .full_build(&CancelToken::new(), &|p| progress.record(p))
        .unwrap();

    assert_eq!(
        outcome,
        BuildOutcome::Indexed(BuildReport {
            added: 5,
            skipped: 0,
            total: 5
        })
    );
    assert_eq!(h.store.len(), 5);
    assert!(h.store.contains("nested/deep.png"));
    assert!(h.store.has_persisted());

    progress.assert_monotonic();
    assert_eq!(progress.last(), Progress::complete(5));
    assert_eq!(progress.updates()[0], (1, 5));
}

#[test]
fn test_second_full_build_is_a_load() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 3);

    let first = harness(base.path(), root.path(), 16);
    first
        .builder
        .full_build(&CancelToken::new(), &|_| {})
        .unwrap();
    assert_eq!(first.embedder.image_calls(), 3);

    // simulated restart: new store and builder on the same location
    let second = harness(base.path(), root.path(), 16);
    let progress = Recorder::default();
    let outcome = second
        .builder
        .full_build(&CancelToken::new(), &|p| progress.record(p))
        .unwrap();

    assert_eq!(outcome, BuildOutcome::Loaded(3));
    assert_eq!(outcome.added(), 0);
    assert_eq!(second.embedder.image_calls(), 0);
    assert_eq!(progress.updates(), vec![(3, 3)]);
    assert_eq!(progress.last().percent, 100.0);
    assert_eq!(*second.store.snapshot(), *first.store.snapshot());
}

#[test]
fn test_empty_directory_is_a_valid_empty_index() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("notes.txt"), b"not an image").unwrap();
    let h = harness(base.path(), root.path(), 16);

    let progress = Recorder::default();
    let outcome = h
        .builder
        .full_build(&CancelToken::new(), &|p| progress.record(p))
        .unwrap();

    assert_eq!(outcome, BuildOutcome::Empty(BuildReport::default()));
    assert_eq!(progress.updates(), vec![(0, 0)]);
    assert_eq!(progress.last().percent, 100.0);
    assert!(h.store.is_empty());
    assert!(!h.store.has_persisted());
}

#[test]
fn test_unreadable_images_are_skipped() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 3);
    std::fs::write(root.path().join("broken.png"), b"definitely not a png").unwrap();
    let h = harness(base.path(), root.path(), 16);

    let outcome = h.builder.full_build(&CancelToken::new(), &|_| {}).unwrap();

    assert_eq!(
        outcome,
        BuildOutcome::Indexed(BuildReport {
            added: 3,
            skipped: 1,
            total: 4
        })
    );
    assert!(!h.store.contains("broken.png"));
    assert_eq!(h.embedder.image_calls(), 3);
}

#[test]
fn test_all_unreadable_is_empty_not_error() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("a.png"), b"garbage").unwrap();
    std::fs::write(root.path().join("b.jpg"), b"more garbage").unwrap();
    let h = harness(base.path(), root.path(), 16);

    let progress = Recorder::default();
    let outcome = h
        .builder
        .full_build(&CancelToken::new(), &|p| progress.record(p))
        .unwrap();

    assert!(matches!(outcome, BuildOutcome::Empty(r) if r.skipped == 2 && r.added == 0));
    assert_eq!(progress.last(), Progress::complete(2));
    assert!(!h.store.has_persisted());
}

#[test]
fn test_cancel_after_third_file_keeps_three() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 10);
    // batch larger than the cancel point: nothing is flushed before cancel
    let h = harness(base.path(), root.path(), 16);

    let token = CancelToken::new();
    let outcome = h
        .builder
        .full_build(&token, &|p| {
            if p.done == 3 {
                token.cancel();
            }
        })
        .unwrap();

    assert_eq!(
        outcome,
        BuildOutcome::Cancelled(BuildReport {
            added: 3,
            skipped: 0,
            total: 10
        })
    );
    assert_eq!(h.embedder.image_calls(), 3);
    assert_eq!(h.store.len(), 3);

    let reopened = harness(base.path(), root.path(), 16);
    assert_eq!(reopened.store.load().unwrap(), LoadState::Loaded(3));
    assert_eq!(
        reopened.store.snapshot().ids(),
        &["img_00.png", "img_01.png", "img_02.png"]
    );
}

#[test]
fn test_cancelled_before_start_extracts_nothing() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 2);
    let h = harness(base.path(), root.path(), 16);

    let token = CancelToken::new();
    token.cancel();
    let outcome = h.builder.full_build(&token, &|_| {}).unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(outcome.added(), 0);
    assert_eq!(h.embedder.image_calls(), 0);
    assert!(!h.store.has_persisted());
}

#[test]
fn test_small_batches_persist_everything() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 5);
    let h = harness(base.path(), root.path(), 2);

    let outcome = h.builder.full_build(&CancelToken::new(), &|_| {}).unwrap();
    assert_eq!(outcome.added(), 5);

    let reopened = harness(base.path(), root.path(), 2);
    assert_eq!(reopened.store.load().unwrap(), LoadState::Loaded(5));
}

#[test]
fn test_incremental_build_adds_only_new_files() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 2);
    let h = harness(base.path(), root.path(), 16);
    h.builder.full_build(&CancelToken::new(), &|_| {}).unwrap();

    write_png(root.path(), "later/new_a.png", 100);
    write_png(root.path(), "later/new_b.png", 101);

    let progress = Recorder::default();
    let outcome = h
        .builder
        .incremental_build(&CancelToken::new(), &|p| progress.record(p))
        .unwrap();

    assert_eq!(
        outcome,
        BuildOutcome::Indexed(BuildReport {
            added: 2,
            skipped: 0,
            total: 2
        })
    );
    assert_eq!(h.embedder.image_calls(), 4);
    assert_eq!(
        h.store.snapshot().ids(),
        &["img_00.png", "img_01.png", "later/new_a.png", "later/new_b.png"]
    );
    assert_eq!(progress.last(), Progress::complete(2));
}

#[test]
fn test_incremental_build_without_changes() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 2);
    let h = harness(base.path(), root.path(), 16);
    h.builder.full_build(&CancelToken::new(), &|_| {}).unwrap();

    let progress = Recorder::default();
    let outcome = h
        .builder
        .incremental_build(&CancelToken::new(), &|p| progress.record(p))
        .unwrap();

    assert_eq!(outcome, BuildOutcome::Indexed(BuildReport::default()));
    assert_eq!(progress.updates(), vec![(0, 0)]);
    assert_eq!(h.embedder.image_calls(), 2);
}

#[test]
fn test_incremental_build_loads_before_appending() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 2);
    harness(base.path(), root.path(), 16)
        .builder
        .full_build(&CancelToken::new(), &|_| {})
        .unwrap();

    write_png(root.path(), "extra.png", 77);
    let fresh = harness(base.path(), root.path(), 16);
    let outcome = fresh
        .builder
        .incremental_build(&CancelToken::new(), &|_| {})
        .unwrap();

    assert_eq!(outcome.added(), 1);
    assert_eq!(fresh.embedder.image_calls(), 1);
    assert_eq!(fresh.store.len(), 3);
}

#[test]
fn test_corrupt_index_is_rebuilt() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 3);
    let first = harness(base.path(), root.path(), 16);
    first.builder.full_build(&CancelToken::new(), &|_| {}).unwrap();
    std::fs::remove_file(first.store.location().dir().join(IDS_FILE)).unwrap();

    let second = harness(base.path(), root.path(), 16);
    let outcome = second.builder.full_build(&CancelToken::new(), &|_| {}).unwrap();

    assert_eq!(outcome.added(), 3);
    assert_eq!(second.embedder.image_calls(), 3);
    assert_eq!(second.store.len(), 3);
}

#[test]
fn test_missing_root_is_a_scan_error() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let missing = root.path().join("gone");
    let h = harness(base.path(), &missing, 16);

    let result = h.builder.full_build(&CancelToken::new(), &|_| {});
    assert!(matches!(result, Err(BuildError::Scan { .. })));
}

#[test]
fn test_persist_failure_fails_the_build() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 2);
    let h = harness(base.path(), root.path(), 16);
    std::fs::create_dir(h.store.location().dir().join(format!("{IDS_FILE}.tmp"))).unwrap();

    let result = h.builder.full_build(&CancelToken::new(), &|_| {});

    assert!(matches!(result, Err(BuildError::Persist(_))));
    assert!(h.store.is_empty());
    assert!(!h.store.has_persisted());
}

#[test]
fn test_built_index_answers_queries() {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_pngs(root.path(), 4);
    let h = harness(base.path(), root.path(), 16);
    h.builder.full_build(&CancelToken::new(), &|_| {}).unwrap();

    let bytes = std::fs::read(root.path().join("img_02.png")).unwrap();
    let hits = h.store.search(&fake_vector(&bytes), 2, 0.1);

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "img_02.png");
    assert!((hits[0].score - 1.0).abs() < 1e-5);
    assert!(hits[0].score >= hits[1].score);
}

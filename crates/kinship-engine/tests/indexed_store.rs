mod support;

use std::sync::Arc;

use kinship_core::SearchField;
use kinship_engine::{SyncOrchestrator, find_similar, init_tables};
use kinship_store::{IndexedIssueStore, IssueStore};
use tempfile::tempdir;

use support::{REPOSITORY, UpstreamIssues, raw_issue};

#[tokio::test]
async fn synced_issues_are_searchable_and_resync_is_a_no_op() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(IndexedIssueStore::open(temp.path()).await.expect("open store"));
    assert!(init_tables(store.as_ref()).await.expect("init tables"));

    let upstream = Arc::new(UpstreamIssues::new(
        vec![
            raw_issue(1, 1, "Crash on startup", Some("panic in main"), "2024-05-01T10:00:00Z"),
            raw_issue(2, 2, "Crash on startup", None, "2024-05-01T11:00:00Z"),
            raw_issue(3, 3, "Dark mode for settings", None, "2024-05-01T12:00:00Z"),
        ],
        100,
    ));
    let sync = SyncOrchestrator::new(upstream, store.clone(), REPOSITORY);

    let first = sync.sync_all().await.expect("first sync");
    assert_eq!(first.inserted, 3);

    let subject = store.get(1).await.expect("read").expect("stored");
    assert!(subject.title_vec.is_some());
    assert!(subject.body_vec.is_some());

    let candidates = find_similar(store.as_ref(), &subject, 5, 0.7).await;
    assert!(candidates.iter().all(|row| row.issue.external_id != 1));
    let best = candidates.first().expect("identical title is found");
    assert_eq!(best.issue.external_id, 2);
    assert_eq!(best.matched_field, SearchField::Title);
    assert!(best.distance < 1e-4);

    let second = sync.sync_all().await.expect("second sync");
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 3);
    assert_eq!(store.sqlite().count_issues().expect("count"), 3);
}

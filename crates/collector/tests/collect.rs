use async_trait::async_trait;
use collector::{
    CollectError, Collector, CollectorOptions, DateWindow, PostPage, PostSource, Result,
};
use narrative_core::db::{self, HandleStatus};
use narrative_core::schema::RawPost;
use narrative_core::CancelFlag;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use time::macros::date;

/// Serves canned pages keyed by (handle, cursor) and records every request.
#[derive(Default)]
struct FakeSource {
    pages: HashMap<(String, Option<String>), std::result::Result<PostPage, String>>,
    calls: Mutex<Vec<(String, Option<String>, u32)>>,
    cancel_after: Option<(usize, CancelFlag)>,
}

fn post(handle: &str, id: &str) -> (RawPost, Value) {
    let post = RawPost {
        id: id.to_string(),
        author_id: format!("a-{handle}"),
        handle: handle.to_string(),
        created_at: "2022-07-01T12:00:00Z".to_string(),
        text: format!("post {id}"),
        conversation_id: None,
        engagement: None,
    };
    (post, json!({ "id": id }))
}

impl FakeSource {
    fn page(mut self, handle: &str, cursor: Option<&str>, ids: &[&str], next: Option<&str>) -> Self {
        let posts = ids.iter().map(|id| post(handle, id)).collect();
        self.pages.insert(
            (handle.to_string(), cursor.map(str::to_string)),
            Ok(PostPage {
                posts,
                next_cursor: next.map(str::to_string),
            }),
        );
        self
    }

    fn failure(mut self, handle: &str, cursor: Option<&str>, message: &str) -> Self {
        self.pages.insert(
            (handle.to_string(), cursor.map(str::to_string)),
            Err(message.to_string()),
        );
        self
    }

    fn calls(&self) -> Vec<(String, Option<String>, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PostSource for FakeSource {
    async fn fetch_page(
        &self,
        handle: &str,
        _window: &DateWindow,
        cursor: Option<&str>,
        max_results: u32,
    ) -> Result<PostPage> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((handle.to_string(), cursor.map(str::to_string), max_results));
            calls.len()
        };
        if let Some((after, flag)) = &self.cancel_after
            && count >= *after
        {
            flag.cancel();
        }
        match self.pages.get(&(handle.to_string(), cursor.map(str::to_string))) {
            Some(Ok(page)) => Ok(page.clone()),
            Some(Err(message)) => Err(CollectError::Api {
                status: 503,
                message: message.clone(),
            }),
            None => Err(CollectError::Network(format!("no page for {handle}"))),
        }
    }
}

fn options(max_posts: Option<u64>) -> CollectorOptions {
    CollectorOptions {
        window: DateWindow {
            start: date!(2022 - 01 - 01),
            end: date!(2023 - 01 - 31),
        },
        page_size: 100,
        max_posts,
        page_delay: Duration::ZERO,
    }
}

fn handles(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn failing_handle_does_not_stop_the_others() {
    let conn = db::open_in_memory().unwrap();
    let source = FakeSource::default()
        .page("alice", None, &["1", "2"], Some("c1"))
        .page("alice", Some("c1"), &["3"], None)
        .failure("bob", None, "service unavailable")
        .page("carol", None, &["4"], None);
    let collector = Collector::new(source, options(None));

    let report = collector
        .collect(&handles(&["alice", "bob", "carol"]), &conn, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].handle, "bob");
    assert!(report.failures[0].error.contains("service unavailable"));
    assert_eq!(report.posts(), 4);
    assert!(!report.cancelled && !report.cap_reached);

    let bob = db::progress(&conn, "bob").unwrap().unwrap();
    assert_eq!(bob.status, HandleStatus::Failed);
    assert_eq!(db::progress(&conn, "carol").unwrap().unwrap().status, HandleStatus::Complete);
    let ids: Vec<String> = db::load_posts(&conn).unwrap().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["1", "2", "3", "4"]);
}

#[tokio::test]
async fn interrupted_handle_resumes_from_stored_cursor() {
    let conn = db::open_in_memory().unwrap();
    db::record_page(&conn, "alice", &[post("alice", "1")], Some("c1")).unwrap();

    let source = FakeSource::default().page("alice", Some("c1"), &["2"], None);
    let collector = Collector::new(source, options(None));
    let report = collector
        .collect(&handles(&["alice"]), &conn, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.handles[0].posts, 1);
    let calls = collector_calls(&collector);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.as_deref(), Some("c1"));
    let progress = db::progress(&conn, "alice").unwrap().unwrap();
    assert_eq!(progress.status, HandleStatus::Complete);
    assert_eq!(progress.pages, 2);
    assert_eq!(db::post_count(&conn).unwrap(), 2);
}

fn collector_calls(collector: &Collector<FakeSource>) -> Vec<(String, Option<String>, u32)> {
    collector.source().calls()
}

#[tokio::test]
async fn complete_handles_are_skipped_on_rerun() {
    let conn = db::open_in_memory().unwrap();
    let source = FakeSource::default().page("alice", None, &["1"], None);
    let collector = Collector::new(source, options(None));
    let cancel = CancelFlag::new();

    collector.collect(&handles(&["alice"]), &conn, &cancel).await.unwrap();
    let second = collector.collect(&handles(&["alice"]), &conn, &cancel).await.unwrap();

    assert_eq!(second.skipped, vec!["alice".to_string()]);
    assert!(second.handles.is_empty());
    assert_eq!(collector_calls(&collector).len(), 1);
}

#[tokio::test]
async fn zero_post_handle_completes_normally() {
    let conn = db::open_in_memory().unwrap();
    let source = FakeSource::default().page("quiet", None, &[], None);
    let collector = Collector::new(source, options(None));

    let report = collector
        .collect(&handles(&["quiet"]), &conn, &CancelFlag::new())
        .await
        .unwrap();

    assert!(report.failures.is_empty());
    assert_eq!(report.handles[0].posts, 0);
    assert_eq!(db::progress(&conn, "quiet").unwrap().unwrap().status, HandleStatus::Complete);
}

#[tokio::test]
async fn global_cap_stops_retrieval_and_shrinks_requests() {
    let conn = db::open_in_memory().unwrap();
    let source = FakeSource::default()
        .page("alice", None, &["1", "2", "3"], Some("c1"))
        .page("alice", Some("c1"), &["4", "5"], Some("c2"))
        .page("bob", None, &["6"], None);
    let collector = Collector::new(source, options(Some(5)));

    let report = collector
        .collect(&handles(&["alice", "bob"]), &conn, &CancelFlag::new())
        .await
        .unwrap();

    assert!(report.cap_reached);
    assert_eq!(db::post_count(&conn).unwrap(), 5);
    let calls = collector_calls(&collector);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].2, 5);
    assert_eq!(calls[1].2, 2);
    assert!(db::progress(&conn, "bob").unwrap().is_none());
    assert_eq!(
        db::progress(&conn, "alice").unwrap().unwrap().cursor.as_deref(),
        Some("c2")
    );
}

#[tokio::test]
async fn oversized_page_is_cut_to_the_cap() {
    let conn = db::open_in_memory().unwrap();
    let source = FakeSource::default()
        .page("alice", None, &["1", "2", "3", "4", "5"], Some("c1"))
        .page("bob", None, &["6"], None);
    let collector = Collector::new(source, options(Some(2)));

    let report = collector
        .collect(&handles(&["alice", "bob"]), &conn, &CancelFlag::new())
        .await
        .unwrap();

    assert!(report.cap_reached);
    assert_eq!(report.posts(), 2);
    assert_eq!(db::post_count(&conn).unwrap(), 2);
    let calls = collector_calls(&collector);
    assert_eq!(calls, vec![("alice".to_string(), None, 2)]);
    // nothing past the cut is marked as fetched
    assert!(db::progress(&conn, "alice").unwrap().is_none());
    assert!(db::progress(&conn, "bob").unwrap().is_none());
}

#[tokio::test]
async fn cancellation_between_pages_keeps_stored_progress() {
    let conn = db::open_in_memory().unwrap();
    let cancel = CancelFlag::new();
    let mut source = FakeSource::default()
        .page("alice", None, &["1"], Some("c1"))
        .page("alice", Some("c1"), &["2"], None);
    source.cancel_after = Some((1, cancel.clone()));
    let collector = Collector::new(source, options(None));

    let report = collector.collect(&handles(&["alice", "bob"]), &conn, &cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.posts(), 1);
    let alice = db::progress(&conn, "alice").unwrap().unwrap();
    assert_eq!(alice.status, HandleStatus::InProgress);
    assert_eq!(alice.cursor.as_deref(), Some("c1"));
}

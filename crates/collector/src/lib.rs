pub mod error;
pub mod twitter;
pub mod types;

pub use error::{CollectError, Result};
pub use twitter::{SearchClient, DEFAULT_BASE_URL};

use async_trait::async_trait;
use narrative_core::db::{self, HandleStatus};
use narrative_core::schema::RawPost;
use narrative_core::CancelFlag;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use time::Date;

/// Closed date interval searched for every handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: Date,
    pub end: Date,
}

/// One page of results: typed posts with their raw JSON, and the cursor of the
/// following page if there is one.
#[derive(Debug, Clone, Default)]
pub struct PostPage {
    pub posts: Vec<(RawPost, Value)>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait PostSource: Send + Sync {
    async fn fetch_page(
        &self,
        handle: &str,
        window: &DateWindow,
        cursor: Option<&str>,
        max_results: u32,
    ) -> Result<PostPage>;
}

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub window: DateWindow,
    pub page_size: u32,
    /// Cap on posts held in the store across all handles.
    pub max_posts: Option<u64>,
    /// Pause before every request after the first.
    pub page_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleSummary {
    pub handle: String,
    pub pages: u64,
    pub posts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleFailure {
    pub handle: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectReport {
    pub handles: Vec<HandleSummary>,
    pub skipped: Vec<String>,
    pub failures: Vec<HandleFailure>,
    pub cap_reached: bool,
    pub cancelled: bool,
}

impl CollectReport {
    pub fn posts(&self) -> u64 {
        self.handles.iter().map(|h| h.posts).sum()
    }
}

enum HandleOutcome {
    Complete,
    Failed(String),
    CapReached,
    Cancelled,
}

pub struct Collector<S> {
    source: S,
    options: CollectorOptions,
}

impl<S: PostSource> Collector<S> {
    pub fn new(source: S, options: CollectorOptions) -> Self {
        Self { source, options }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Retrieve every handle into `conn`, resuming where earlier runs stopped.
    /// Source errors fail only their handle; store errors abort.
    pub async fn collect(
        &self,
        handles: &[String],
        conn: &Connection,
        cancel: &CancelFlag,
    ) -> Result<CollectReport> {
        let mut report = CollectReport::default();
        let mut requests = 0u64;

        for handle in handles {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if self.remaining(conn)? == Some(0) {
                report.cap_reached = true;
                break;
            }

            let progress = db::progress(conn, handle)?;
            let cursor = match &progress {
                Some(p) if p.status == HandleStatus::Complete => {
                    tracing::debug!(handle = %handle, "Already complete, skipping");
                    report.skipped.push(handle.clone());
                    continue;
                }
                // Last page stored but the run stopped before marking completion.
                Some(p) if p.status == HandleStatus::InProgress && p.pages > 0 && p.cursor.is_none() => {
                    db::mark_complete(conn, handle)?;
                    report.skipped.push(handle.clone());
                    continue;
                }
                Some(p) => {
                    tracing::info!(handle = %handle, pages = p.pages, "Resuming retrieval");
                    p.cursor.clone()
                }
                None => None,
            };

            let mut summary = HandleSummary {
                handle: handle.clone(),
                pages: 0,
                posts: 0,
            };
            let outcome = self
                .collect_handle(handle, cursor, conn, cancel, &mut summary, &mut requests)
                .await?;
            tracing::info!(handle = %handle, pages = summary.pages, posts = summary.posts, "Handle retrieval finished");
            report.handles.push(summary);

            match outcome {
                HandleOutcome::Complete => {}
                HandleOutcome::Failed(error) => report.failures.push(HandleFailure {
                    handle: handle.clone(),
                    error,
                }),
                HandleOutcome::CapReached => {
                    report.cap_reached = true;
                    break;
                }
                HandleOutcome::Cancelled => {
                    report.cancelled = true;
                    break;
                }
            }
        }

        tracing::info!(
            handles = report.handles.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            posts = report.posts(),
            cap_reached = report.cap_reached,
            cancelled = report.cancelled,
            "Collection finished"
        );
        Ok(report)
    }

    async fn collect_handle(
        &self,
        handle: &str,
        mut cursor: Option<String>,
        conn: &Connection,
        cancel: &CancelFlag,
        summary: &mut HandleSummary,
        requests: &mut u64,
    ) -> Result<HandleOutcome> {
        loop {
            if cancel.is_cancelled() {
                return Ok(HandleOutcome::Cancelled);
            }
            let left = self.remaining(conn)?;
            let max_results = match left {
                Some(0) => return Ok(HandleOutcome::CapReached),
                Some(left) => left.min(u64::from(self.options.page_size)) as u32,
                None => self.options.page_size,
            };

            if *requests > 0 && !self.options.page_delay.is_zero() {
                tokio::time::sleep(self.options.page_delay).await;
            }
            *requests += 1;

            let mut page = match self
                .source
                .fetch_page(handle, &self.options.window, cursor.as_deref(), max_results)
                .await
            {
                Ok(page) => page,
                Err(err) if err.is_per_handle() => {
                    let message = err.to_string();
                    tracing::warn!(handle, error = %message, "Retrieval failed for handle");
                    db::mark_failed(conn, handle, &message)?;
                    return Ok(HandleOutcome::Failed(message));
                }
                Err(err) => return Err(err),
            };

            // The source may ignore max_results. Progress stays at the cursor
            // that fetched a page cut at the cap.
            if let Some(left) = left
                && page.posts.len() as u64 > left
            {
                tracing::debug!(handle, returned = page.posts.len(), kept = left, "Page truncated at the post cap");
                page.posts.truncate(left as usize);
                db::store_posts(conn, &page.posts)?;
                summary.pages += 1;
                summary.posts += left;
                return Ok(HandleOutcome::CapReached);
            }

            db::record_page(conn, handle, &page.posts, page.next_cursor.as_deref())?;
            summary.pages += 1;
            summary.posts += page.posts.len() as u64;

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    db::mark_complete(conn, handle)?;
                    return Ok(HandleOutcome::Complete);
                }
            }
        }
    }

    fn remaining(&self, conn: &Connection) -> Result<Option<u64>> {
        match self.options.max_posts {
            Some(cap) => Ok(Some(cap.saturating_sub(db::post_count(conn)?))),
            None => Ok(None),
        }
    }
}

//! Independent maintenance sub-operations run as one isolated batch.

use std::fmt::Display;

use futures::future::join_all;
use warden_store::{SqliteStore, StoreError};
use warden_tools::BoxFuture;

use crate::config::RetentionConfig;

pub struct RetentionTask<'a, E> {
    pub name: &'static str,
    pub run: BoxFuture<'a, Result<u64, E>>,
}

impl<'a, E> RetentionTask<'a, E> {
    pub fn new(name: &'static str, run: BoxFuture<'a, Result<u64, E>>) -> Self {
        Self { name, run }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    /// Rows removed per task, in submission order; zero for failed tasks.
    pub counts: Vec<(&'static str, u64)>,
    pub failed: Vec<&'static str>,
}

impl RetentionReport {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|(_, n)| n).sum()
    }

    #[must_use]
    pub fn count(&self, name: &str) -> Option<u64> {
        self.counts.iter().find(|(n, _)| *n == name).map(|(_, c)| *c)
    }
}

/// Run every task to completion; one failing never stops the others.
pub async fn run_retention<E: Display>(tasks: Vec<RetentionTask<'_, E>>) -> RetentionReport {
    let names: Vec<&'static str> = tasks.iter().map(|t| t.name).collect();
    let results = join_all(tasks.into_iter().map(|t| t.run)).await;

    let mut report = RetentionReport::default();
    for (name, result) in names.into_iter().zip(results) {
        match result {
            Ok(n) => {
                tracing::debug!(task = name, removed = n, "retention task finished");
                report.counts.push((name, n));
            }
            Err(e) => {
                tracing::warn!(task = name, error = %e, "retention task failed");
                report.counts.push((name, 0));
                report.failed.push(name);
            }
        }
    }
    tracing::info!(
        removed = report.total(),
        failed = report.failed.len(),
        "retention pass complete"
    );
    report
}

/// The four store-backed sub-operations.
#[must_use]
pub fn store_tasks<'a>(
    store: &'a SqliteStore,
    config: &RetentionConfig,
) -> Vec<RetentionTask<'a, StoreError>> {
    let RetentionConfig {
        session_idle_days,
        message_days,
        mailbox_days,
        turn_days,
    } = *config;
    vec![
        RetentionTask::new(
            "expired_sessions",
            Box::pin(store.purge_expired_sessions(session_idle_days)),
        ),
        RetentionTask::new("old_messages", Box::pin(store.purge_old_messages(message_days))),
        RetentionTask::new(
            "surfaced_mailbox",
            Box::pin(store.purge_surfaced_mail(mailbox_days)),
        ),
        RetentionTask::new("old_turns", Box::pin(store.purge_old_turns(turn_days))),
    ]
}

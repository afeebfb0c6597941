use std::fmt;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cloudtail_backend::{BackendError, BackendQuery, LogBackend};
use cloudtail_types::LogEntry;

use crate::cursor::Cursor;
use crate::error::TailError;
use crate::filter::{Filter, ResolvedFilter};
use crate::sink::OutputSink;

/// Timing and retry policy of the tail loop
#[derive(Clone, Debug)]
pub struct TailConfig {
    /// Wait between polls that returned nothing new, and between retries
    pub poll_interval: Duration,

    /// Consecutive transient failures tolerated while following
    pub max_retries: u32,

    /// Upper bound on a single backend fetch
    pub request_timeout: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_retries: 5,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-invocation run options
#[derive(Clone, Copy, Debug)]
pub struct TailOptions {
    /// Keep polling for new entries instead of stopping after one fetch
    pub follow: bool,

    /// Maximum entries to emit; negative means unbounded
    pub limit: i64,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            follow: false,
            limit: -1,
        }
    }
}

impl TailOptions {
    fn limit(&self) -> Option<u64> {
        u64::try_from(self.limit).ok()
    }
}

/// Why the tail loop stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// One-shot fetch finished
    Completed,
    /// The entry limit was reached
    LimitReached,
    /// The cancellation token fired
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "natural completion",
            Self::LimitReached => "limit reached",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Outcome of a finished run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TailSummary {
    /// Entries written to the sink
    pub emitted: u64,

    /// Malformed entries dropped
    pub skipped: u64,

    pub reason: StopReason,
}

/// Drives fetches against a backend and writes new entries to a sink
pub struct TailEngine<B> {
    backend: B,
    config: TailConfig,
}

impl<B: LogBackend> TailEngine<B> {
    pub fn new(backend: B, config: TailConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &TailConfig {
        &self.config
    }

    /// Run until the limit, one-shot completion, cancellation or a fatal error
    ///
    /// A relative lower bound is resolved against the current time once,
    /// here, and stays fixed for the rest of the run.
    pub async fn run<S: OutputSink + ?Sized>(
        &self,
        filter: &Filter,
        options: TailOptions,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<TailSummary, TailError> {
        let resolved = filter.resolve(Utc::now());
        self.run_resolved(&resolved, options, sink, cancel).await
    }

    /// Same as [`TailEngine::run`] with the lower bound already fixed
    pub async fn run_resolved<S: OutputSink + ?Sized>(
        &self,
        filter: &ResolvedFilter,
        options: TailOptions,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<TailSummary, TailError> {
        let limit = options.limit();
        let mut cursor = Cursor::new(filter.since());
        let mut skipped = 0u64;
        let mut failures = 0u32;

        let summary = |cursor: &Cursor, skipped: u64, reason: StopReason| {
            info!(emitted = cursor.emitted(), skipped, %reason, "tail finished");
            TailSummary {
                emitted: cursor.emitted(),
                skipped,
                reason,
            }
        };

        if limit == Some(0) {
            return Ok(summary(&cursor, skipped, StopReason::LimitReached));
        }

        loop {
            let query = self.next_query(filter, &cursor, limit);
            debug!(filter = %query.filter, max_entries = ?query.max_entries, "fetching entries");

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(summary(&cursor, skipped, StopReason::Cancelled));
                }
                result = tokio::time::timeout(self.config.request_timeout, self.backend.fetch(&query)) => {
                    result.unwrap_or_else(|_| {
                        Err(BackendError::Unavailable(format!(
                            "request timed out after {:?}",
                            self.config.request_timeout
                        )))
                    })
                }
            };

            let raw = match fetched {
                Ok(raw) => {
                    failures = 0;
                    raw
                }
                Err(err) if !err.is_transient() => return Err(TailError::BackendRejected(err)),
                Err(err) => {
                    failures += 1;
                    if !options.follow || failures > self.config.max_retries {
                        return Err(TailError::BackendUnavailable {
                            attempts: failures,
                            source: err,
                        });
                    }
                    warn!(
                        attempt = failures,
                        max_retries = self.config.max_retries,
                        error = %err,
                        "fetch failed, retrying"
                    );
                    if self.wait(cancel).await {
                        return Ok(summary(&cursor, skipped, StopReason::Cancelled));
                    }
                    continue;
                }
            };

            let fetched_count = raw.len();
            let mut batch = Vec::with_capacity(fetched_count);
            for value in raw {
                match LogEntry::from_json(value) {
                    Ok(entry) => batch.push(entry),
                    Err(err) => {
                        skipped += 1;
                        warn!(error = %err, "skipping malformed entry");
                    }
                }
            }
            batch.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.insert_id.cmp(&b.insert_id))
            });

            let mut fresh = 0usize;
            for entry in &batch {
                if !cursor.is_new(entry) {
                    continue;
                }
                sink.write(entry)?;
                cursor.advance(entry);
                fresh += 1;

                if limit.is_some_and(|limit| cursor.emitted() >= limit) {
                    return Ok(summary(&cursor, skipped, StopReason::LimitReached));
                }
            }
            debug!(fetched = fetched_count, fresh, "poll complete");

            if !options.follow {
                return Ok(summary(&cursor, skipped, StopReason::Completed));
            }

            if fresh == 0 && self.wait(cancel).await {
                return Ok(summary(&cursor, skipped, StopReason::Cancelled));
            }
        }
    }

    /// Query starting at the cursor, sized to what the limit still allows
    fn next_query(
        &self,
        filter: &ResolvedFilter,
        cursor: &Cursor,
        limit: Option<u64>,
    ) -> BackendQuery {
        let compiled = match cursor.last_seen() {
            Some(since) => filter.with_lower_bound(since).compile(),
            None => filter.compile(),
        };

        // Already-emitted ties come back with an inclusive bound and must
        // not use up the remaining budget.
        let max_entries = limit.map(|limit| {
            let remaining = usize::try_from(limit - cursor.emitted()).unwrap_or(usize::MAX);
            remaining.saturating_add(cursor.tie_count())
        });

        BackendQuery::new(compiled).with_max_entries(max_entries)
    }

    /// Sleep for the poll interval; true when cancelled first
    async fn wait(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.config.poll_interval) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::filter::LowerBound;
    use chrono::{DateTime, TimeZone};
    use cloudtail_types::Severity;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::collections::VecDeque;

    enum Step {
        Entries(Vec<Value>),
        Fail(BackendError),
        Hang,
    }

    /// Replays a fixed sequence of responses and records every query
    struct ScriptedBackend {
        steps: Mutex<VecDeque<Step>>,
        queries: Mutex<Vec<BackendQuery>>,
        cancel_when_drained: Option<CancellationToken>,
    }

    impl ScriptedBackend {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                queries: Mutex::new(Vec::new()),
                cancel_when_drained: None,
            }
        }

        fn cancelling(steps: Vec<Step>, cancel: &CancellationToken) -> Self {
            Self {
                cancel_when_drained: Some(cancel.clone()),
                ..Self::new(steps)
            }
        }

        fn queries(&self) -> Vec<BackendQuery> {
            self.queries.lock().clone()
        }
    }

    impl LogBackend for ScriptedBackend {
        async fn fetch(&self, query: &BackendQuery) -> Result<Vec<Value>, BackendError> {
            self.queries.lock().push(query.clone());
            let step = self.steps.lock().pop_front();
            match step {
                Some(Step::Entries(entries)) => Ok(entries),
                Some(Step::Fail(err)) => Err(err),
                Some(Step::Hang) => std::future::pending().await,
                None => {
                    if let Some(cancel) = &self.cancel_when_drained {
                        cancel.cancel();
                    }
                    Ok(Vec::new())
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        ids: Vec<String>,
    }

    impl OutputSink for RecordingSink {
        fn write(&mut self, entry: &LogEntry) -> Result<(), SinkError> {
            self.ids.push(entry.insert_id.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    impl OutputSink for BrokenSink {
        fn write(&mut self, _entry: &LogEntry) -> Result<(), SinkError> {
            Err(SinkError::Write(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )))
        }
    }

    fn ts(secs: u32) -> String {
        format!("2024-01-01T00:00:{secs:02}Z")
    }

    fn entry(id: &str, secs: u32) -> Value {
        json!({
            "insertId": id,
            "timestamp": ts(secs),
            "severity": "INFO",
            "textPayload": format!("message {id}")
        })
    }

    fn config() -> TailConfig {
        TailConfig {
            poll_interval: Duration::from_secs(1),
            max_retries: 2,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn one_shot(limit: i64) -> TailOptions {
        TailOptions {
            follow: false,
            limit,
        }
    }

    fn follow(limit: i64) -> TailOptions {
        TailOptions {
            follow: true,
            limit,
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn since_start() -> ResolvedFilter {
        Filter::new()
            .with_lower_bound(LowerBound::Absolute(start()))
            .resolve(start())
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_emits_in_timestamp_order() {
        let backend = ScriptedBackend::new(vec![Step::Entries(vec![
            entry("c", 3),
            entry("a", 1),
            entry("b", 2),
        ])]);
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let summary = engine
            .run(&Filter::new(), TailOptions::default(), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.ids, ["a", "b", "c"]);
        assert_eq!(
            summary,
            TailSummary {
                emitted: 3,
                skipped: 0,
                reason: StopReason::Completed
            }
        );
        assert_eq!(summary.reason.to_string(), "natural completion");
        assert_eq!(engine.backend().queries().len(), 1);
        assert_eq!(engine.backend().queries()[0], BackendQuery::new(""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_without_entries_completes() {
        let engine = TailEngine::new(ScriptedBackend::new(vec![Step::Entries(vec![])]), config());
        let mut sink = RecordingSink::default();

        let summary = engine
            .run_resolved(&since_start(), one_shot(-1), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.emitted, 0);
        assert_eq!(summary.reason, StopReason::Completed);
        assert_eq!(
            engine.backend().queries()[0].filter,
            r#"timestamp>="2024-01-01T00:00:00Z""#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ties_sorted_by_insert_id() {
        let backend = ScriptedBackend::new(vec![Step::Entries(vec![
            entry("z", 1),
            entry("m", 1),
            entry("a", 1),
        ])]);
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        engine
            .run(&Filter::new(), one_shot(-1), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.ids, ["a", "m", "z"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_stops_mid_batch() {
        let backend = ScriptedBackend::new(vec![Step::Entries(vec![
            entry("a", 1),
            entry("b", 2),
            entry("c", 3),
        ])]);
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let summary = engine
            .run(&Filter::new(), follow(2), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.ids, ["a", "b"]);
        assert_eq!(summary.reason, StopReason::LimitReached);
        let queries = engine.backend().queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].max_entries, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_larger_than_available() {
        let backend = ScriptedBackend::new(vec![Step::Entries(vec![entry("a", 1), entry("b", 2)])]);
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let summary = engine
            .run(&Filter::new(), one_shot(10), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.emitted, 2);
        assert_eq!(summary.reason, StopReason::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_makes_no_backend_calls() {
        let engine = TailEngine::new(ScriptedBackend::new(vec![]), config());
        let mut sink = RecordingSink::default();

        let summary = engine
            .run(&Filter::new(), follow(0), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.emitted, 0);
        assert_eq!(summary.reason, StopReason::LimitReached);
        assert!(engine.backend().queries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_never_repeats_tied_entries() {
        let cancel = CancellationToken::new();
        let backend = ScriptedBackend::cancelling(
            vec![
                Step::Entries(vec![entry("a", 1), entry("b", 2), entry("c", 2)]),
                // inclusive re-query returns the tie at :02 again
                Step::Entries(vec![entry("b", 2), entry("c", 2), entry("d", 2), entry("e", 3)]),
                Step::Entries(vec![entry("e", 3)]),
            ],
            &cancel,
        );
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let summary = engine
            .run_resolved(&since_start(), follow(-1), &mut sink, &cancel)
            .await
            .unwrap();

        assert_eq!(sink.ids, ["a", "b", "c", "d", "e"]);
        assert_eq!(summary.emitted, 5);
        assert_eq!(summary.reason, StopReason::Cancelled);

        let filters: Vec<String> = engine
            .backend()
            .queries()
            .into_iter()
            .map(|q| q.filter)
            .collect();
        assert_eq!(
            filters,
            [
                format!(r#"timestamp>="{}""#, ts(0)),
                format!(r#"timestamp>="{}""#, ts(2)),
                format!(r#"timestamp>="{}""#, ts(3)),
                format!(r#"timestamp>="{}""#, ts(3)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_limit_counts_across_polls() {
        let backend = ScriptedBackend::new(vec![
            Step::Entries(vec![entry("a", 1), entry("b", 2)]),
            Step::Entries(vec![entry("b", 2), entry("c", 3), entry("d", 4)]),
        ]);
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let summary = engine
            .run(&Filter::new(), follow(3), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.ids, ["a", "b", "c"]);
        assert_eq!(summary.reason, StopReason::LimitReached);

        let queries = engine.backend().queries();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].max_entries, Some(3));
        // one slot left plus the tie at :02 that comes back
        assert_eq!(queries[1].max_entries, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_waits_after_empty_poll() {
        let cancel = CancellationToken::new();
        let backend = ScriptedBackend::cancelling(
            vec![Step::Entries(vec![]), Step::Entries(vec![entry("a", 1)])],
            &cancel,
        );
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let started = tokio::time::Instant::now();
        let summary = engine
            .run(&Filter::new(), follow(-1), &mut sink, &cancel)
            .await
            .unwrap();

        assert_eq!(sink.ids, ["a"]);
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert_eq!(engine.backend().queries().len(), 3);
        assert!(started.elapsed() >= config().poll_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_entries_are_skipped() {
        let backend = ScriptedBackend::new(vec![Step::Entries(vec![
            entry("a", 1),
            json!({"garbage": true}),
            json!({"insertId": "", "timestamp": ts(2)}),
            entry("b", 3),
        ])]);
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let summary = engine
            .run(&Filter::new(), one_shot(-1), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.ids, ["a", "b"]);
        assert_eq!(summary.emitted, 2);
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_retries_transient_failures() {
        let cancel = CancellationToken::new();
        let backend = ScriptedBackend::cancelling(
            vec![
                Step::Fail(BackendError::Unavailable("503".into())),
                Step::Fail(BackendError::Decode("truncated".into())),
                Step::Entries(vec![entry("a", 1)]),
            ],
            &cancel,
        );
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let summary = engine
            .run(&Filter::new(), follow(-1), &mut sink, &cancel)
            .await
            .unwrap();

        assert_eq!(sink.ids, ["a"]);
        assert_eq!(summary.reason, StopReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_gives_up_after_max_retries() {
        let backend = ScriptedBackend::new(
            (0..3)
                .map(|_| Step::Fail(BackendError::Unavailable("503".into())))
                .collect(),
        );
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let result = engine
            .run(&Filter::new(), follow(-1), &mut sink, &CancellationToken::new())
            .await;

        match result {
            Err(TailError::BackendUnavailable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected BackendUnavailable, got {other:?}"),
        }
        assert_eq!(engine.backend().queries().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_surfaces_failure_immediately() {
        let backend = ScriptedBackend::new(vec![
            Step::Fail(BackendError::Unavailable("503".into())),
            Step::Entries(vec![entry("a", 1)]),
        ]);
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let result = engine
            .run(&Filter::new(), one_shot(-1), &mut sink, &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(TailError::BackendUnavailable { attempts: 1, .. })
        ));
        assert_eq!(engine.backend().queries().len(), 1);
        assert!(sink.ids.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_fatal_while_following() {
        let backend = ScriptedBackend::new(vec![Step::Fail(BackendError::Rejected {
            status: 400,
            message: "bad filter".into(),
        })]);
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let result = engine
            .run(&Filter::new(), follow(-1), &mut sink, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(TailError::BackendRejected(_))));
        assert_eq!(engine.backend().queries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_transient() {
        let backend = ScriptedBackend::new(vec![Step::Hang]);
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();

        let started = tokio::time::Instant::now();
        let result = engine
            .run(&Filter::new(), one_shot(-1), &mut sink, &CancellationToken::new())
            .await;

        match result {
            Err(TailError::BackendUnavailable { attempts, source }) => {
                assert_eq!(attempts, 1);
                assert!(source.to_string().contains("timed out"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= config().request_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_fetch() {
        let cancel = CancellationToken::new();
        let backend = ScriptedBackend::new(vec![Step::Hang]);
        let engine = TailEngine::new(
            backend,
            TailConfig {
                request_timeout: Duration::from_secs(3600),
                ..config()
            },
        );
        let mut sink = RecordingSink::default();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let summary = engine
            .run(&Filter::new(), follow(-1), &mut sink, &cancel)
            .await
            .unwrap();

        assert_eq!(summary.reason, StopReason::Cancelled);
        assert_eq!(summary.emitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_makes_no_calls() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = TailEngine::new(ScriptedBackend::new(vec![]), config());
        let mut sink = RecordingSink::default();

        let summary = engine
            .run(&Filter::new(), follow(-1), &mut sink, &cancel)
            .await
            .unwrap();

        assert_eq!(summary.reason, StopReason::Cancelled);
        assert!(engine.backend().queries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_is_fatal() {
        let backend = ScriptedBackend::new(vec![Step::Entries(vec![entry("a", 1)])]);
        let engine = TailEngine::new(backend, config());

        let result = engine
            .run(&Filter::new(), follow(-1), &mut BrokenSink, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(TailError::Write(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_clauses_carried_into_queries() {
        let cancel = CancellationToken::new();
        let backend = ScriptedBackend::cancelling(vec![Step::Entries(vec![entry("a", 5)])], &cancel);
        let engine = TailEngine::new(backend, config());
        let mut sink = RecordingSink::default();
        let filter = Filter::new()
            .with_severity(Severity::Warning)
            .with_lower_bound(LowerBound::Absolute(start()));

        engine
            .run(&filter, follow(-1), &mut sink, &cancel)
            .await
            .unwrap();

        let queries = engine.backend().queries();
        assert_eq!(
            queries[0].filter,
            format!(r#"severity>="WARNING" AND timestamp>="{}""#, ts(0))
        );
        assert_eq!(
            queries[1].filter,
            format!(r#"severity>="WARNING" AND timestamp>="{}""#, ts(5))
        );
    }
}

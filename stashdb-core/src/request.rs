//! Per-request context consulted by the cache and sync heuristics.

use std::collections::HashSet;
use std::sync::Mutex;

/// Cookie carrying the millisecond timestamp of the caller's last write.
pub const RECENT_POSTBACK_COOKIE: &str = "st-recent-postback";

/// What kind of work the current logical request is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// An interactive request with its HTTP method.
    Web { method: String },
    /// A background task.
    Task,
    /// A scheduled job.
    Job,
}

/// Explicit request context passed into every cache and sync call.
///
/// Holds the request kind, the caller's recency marker, and a set of
/// once-per-request memo keys.
#[derive(Debug)]
pub struct RequestContext {
    kind: RequestKind,
    recent_postback_millis: Option<i64>,
    memo: Mutex<HashSet<String>>,
}

impl RequestContext {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            recent_postback_millis: None,
            memo: Mutex::new(HashSet::new()),
        }
    }

    pub fn web(method: impl Into<String>) -> Self {
        Self::new(RequestKind::Web {
            method: method.into(),
        })
    }

    pub fn task() -> Self {
        Self::new(RequestKind::Task)
    }

    pub fn job() -> Self {
        Self::new(RequestKind::Job)
    }

    /// Attach the raw recency cookie value. Values that are not integer
    /// milliseconds are ignored.
    pub fn with_recent_postback_cookie(mut self, raw: &str) -> Self {
        self.recent_postback_millis = raw.trim().parse::<i64>().ok();
        self
    }

    pub fn with_recent_postback_millis(mut self, millis: i64) -> Self {
        self.recent_postback_millis = Some(millis);
        self
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn method(&self) -> Option<&str> {
        match &self.kind {
            RequestKind::Web { method } => Some(method),
            _ => None,
        }
    }

    /// True for tasks and jobs.
    pub fn is_background(&self) -> bool {
        matches!(self.kind, RequestKind::Task | RequestKind::Job)
    }

    /// True when the request is a web request that is not a `GET`.
    pub fn is_write_method(&self) -> bool {
        match &self.kind {
            RequestKind::Web { method } => !method.eq_ignore_ascii_case("GET"),
            _ => false,
        }
    }

    pub fn recent_postback_millis(&self) -> Option<i64> {
        self.recent_postback_millis
    }

    /// True when the caller wrote within `window_millis` of `now_millis`.
    pub fn has_recent_postback(&self, now_millis: i64, window_millis: i64) -> bool {
        self.recent_postback_millis
            .map(|marker| marker > now_millis - window_millis)
            .unwrap_or(false)
    }

    /// Record `key` for this request. Returns `true` the first time only.
    pub fn mark_once(&self, key: &str) -> bool {
        let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        memo.insert(key.to_string())
    }

    pub fn is_marked(&self, key: &str) -> bool {
        let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        memo.contains(key)
    }
}

//! StashDB Test Utilities
//!
//! Shared test infrastructure for the StashDB workspace:
//! - Fixture models (`Widget`, `Article`)
//! - A manually driven clock
//! - An in-memory delta source for the sync protocol
//! - Request-context builders
//! - Proptest generators

pub use stashdb_core::{
    Clock, Model, ModelDefinition, RequestContext, StashError, StashResult, SyncPolicy, Value,
    ValueKind,
};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use stashdb_core::{FieldDef, SortDirection, StorageError, UsageError};
use stashdb_storage::DeltaSource;
use tokio::sync::Mutex;

fn mismatch(property: &str, expected: &str, got: &Value) -> StashError {
    UsageError::TypeMismatch {
        property: property.to_string(),
        expected: expected.to_string(),
        got: got.type_name().to_string(),
    }
    .into()
}

fn unknown(model: &str, property: &str) -> StashError {
    UsageError::UnknownProperty {
        model: model.to_string(),
        property: property.to_string(),
    }
    .into()
}

// ============================================================================
// FIXTURE MODELS
// ============================================================================

/// `widgets (id, name varchar(250) not null default '', count int not null default 0)`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub id: Option<i64>,
    pub name: String,
    pub count: i32,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub new_insert: bool,
    #[serde(default)]
    pub last_modified_millis: i64,
}

impl Widget {
    pub fn new(name: impl Into<String>, count: i32) -> Self {
        Self {
            name: name.into(),
            count,
            ..Self::default()
        }
    }
}

impl Model for Widget {
    fn definition() -> ModelDefinition {
        ModelDefinition::table("widgets")
            .field(FieldDef::column("name", ValueKind::String).not_null())
            .field(FieldDef::column("count", ValueKind::Int).not_null())
    }

    fn model_name() -> &'static str {
        "Widget"
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn is_new_insert(&self) -> bool {
        self.new_insert
    }

    fn set_new_insert(&mut self, new_insert: bool) {
        self.new_insert = new_insert;
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    fn last_modified_millis(&self) -> i64 {
        self.last_modified_millis
    }

    fn set_last_modified_millis(&mut self, millis: i64) {
        self.last_modified_millis = millis;
    }

    fn property(&self, name: &str) -> Option<Value> {
        match name {
            "name" => Some(Value::Text(self.name.clone())),
            "count" => Some(Value::Int(self.count)),
            _ => None,
        }
    }

    fn set_property(&mut self, name: &str, value: Value) -> StashResult<()> {
        match name {
            "name" => match value {
                Value::Text(s) => self.name = s,
                Value::Null => self.name.clear(),
                other => return Err(mismatch(name, "Text", &other)),
            },
            "count" => match value.as_i32() {
                Some(n) => self.count = n,
                None if value.is_null() => self.count = 0,
                None => return Err(mismatch(name, "Int", &value)),
            },
            _ => return Err(unknown("Widget", name)),
        }
        Ok(())
    }
}

/// Publication state of an [`Article`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArticleStatus {
    #[default]
    Draft,
    Published,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Draft => "DRAFT",
            ArticleStatus::Published => "PUBLISHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(ArticleStatus::Draft),
            "PUBLISHED" => Some(ArticleStatus::Published),
            _ => None,
        }
    }
}

/// A model exercising every conversion path: enum, converters, timestamps,
/// floats, longs and boolean flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: Option<i64>,
    pub title: String,
    pub status: ArticleStatus,
    pub meta: serde_json::Map<String, serde_json::Value>,
    pub tags: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub score: f64,
    pub views: i64,
    pub featured: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub last_modified_millis: i64,
}

impl Model for Article {
    fn definition() -> ModelDefinition {
        ModelDefinition::table("articles")
            .field(
                FieldDef::column("title", ValueKind::String)
                    .length(120)
                    .not_null()
                    .alternative_key(),
            )
            .field(FieldDef::column("status", ValueKind::Enum).not_null())
            .field(FieldDef::column("meta", ValueKind::Map).converter("JsonMapConverter"))
            .field(FieldDef::column("tags", ValueKind::List).converter("JsonListConverter"))
            .field(FieldDef::column("publishedAt", ValueKind::ZonedDateTime).named("published_at"))
            .field(FieldDef::column("score", ValueKind::Double).not_null())
            .field(FieldDef::column("views", ValueKind::Long).not_null())
            .field(FieldDef::flag("featured").not_null())
            .extra_key("KEY `status_views_key` (`status`, `views`)")
            .default_sort("title", SortDirection::Asc)
    }

    fn model_name() -> &'static str {
        "Article"
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    fn last_modified_millis(&self) -> i64 {
        self.last_modified_millis
    }

    fn set_last_modified_millis(&mut self, millis: i64) {
        self.last_modified_millis = millis;
    }

    fn property(&self, name: &str) -> Option<Value> {
        let value = match name {
            "title" => Value::Text(self.title.clone()),
            "status" => Value::Enum(self.status.as_str().to_string()),
            "meta" => Value::Json(serde_json::Value::Object(self.meta.clone())),
            "tags" => Value::Json(serde_json::json!(self.tags)),
            "publishedAt" => self.published_at.into(),
            "score" => Value::Double(self.score),
            "views" => Value::BigInt(self.views),
            "featured" => Value::Bool(self.featured),
            _ => return None,
        };
        Some(value)
    }

    fn set_property(&mut self, name: &str, value: Value) -> StashResult<()> {
        match (name, value) {
            ("title", Value::Text(s)) => self.title = s,
            ("status", Value::Enum(s)) | ("status", Value::Text(s)) => {
                self.status = ArticleStatus::parse(&s)
                    .ok_or_else(|| mismatch(name, "ArticleStatus", &Value::Enum(s.clone())))?;
            }
            ("meta", Value::Json(serde_json::Value::Object(map))) => self.meta = map,
            ("meta", Value::Null) => self.meta.clear(),
            ("tags", Value::Json(json)) => self.tags = serde_json::from_value(json)?,
            ("tags", Value::Null) => self.tags.clear(),
            ("publishedAt", Value::Null) => self.published_at = None,
            ("publishedAt", value) => {
                self.published_at = Some(
                    value
                        .as_timestamp()
                        .ok_or_else(|| mismatch(name, "Timestamp", &value))?,
                );
            }
            ("score", value) => {
                self.score = value.as_f64().ok_or_else(|| mismatch(name, "Double", &value))?;
            }
            ("views", value) => {
                self.views = value.as_i64().ok_or_else(|| mismatch(name, "BigInt", &value))?;
            }
            ("featured", value) => {
                self.featured = value.as_bool().ok_or_else(|| mismatch(name, "Bool", &value))?;
            }
            (
                "title" | "status" | "meta" | "tags",
                other,
            ) => return Err(mismatch(name, "matching kind", &other)),
            (other, _) => return Err(unknown("Article", other)),
        }
        Ok(())
    }
}

// ============================================================================
// CLOCK
// ============================================================================

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn at_millis(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z
        Self::at_millis(1_704_067_200_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

// ============================================================================
// DELTA SOURCE
// ============================================================================

/// In-memory [`DeltaSource`]: rows are selected by their last-modified
/// milliseconds. Can be told to fail the next fetch.
#[derive(Debug)]
pub struct VecDeltaSource<M> {
    rows: Mutex<Vec<M>>,
    fail_next: AtomicBool,
    fetches: AtomicUsize,
    last_since: AtomicI64,
}

impl<M: Model> VecDeltaSource<M> {
    pub fn new(rows: Vec<M>) -> Self {
        Self {
            rows: Mutex::new(rows),
            fail_next: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            last_since: AtomicI64::new(i64::MIN),
        }
    }

    /// Add or replace a row by id.
    pub async fn upsert(&self, row: M) {
        let mut rows = self.rows.lock().await;
        rows.retain(|r| r.id() != row.id());
        rows.push(row);
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// The `since` bound of the most recent fetch, in milliseconds.
    pub fn last_since_millis(&self) -> Option<i64> {
        match self.last_since.load(Ordering::SeqCst) {
            i64::MIN => None,
            millis => Some(millis),
        }
    }
}

#[async_trait]
impl<M: Model> DeltaSource<M> for VecDeltaSource<M> {
    async fn fetch_updated_since(&self, since: DateTime<Utc>) -> StashResult<Vec<M>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.last_since.store(since.timestamp_millis(), Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Query {
                reason: "simulated delta fetch failure".to_string(),
            }
            .into());
        }
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|r| r.last_modified_millis() >= since.timestamp_millis())
            .cloned()
            .collect())
    }
}

// ============================================================================
// REQUEST FIXTURES
// ============================================================================

pub mod requests {
    //! Request-context builders.

    use super::*;

    pub fn get() -> RequestContext {
        RequestContext::web("GET")
    }

    pub fn post() -> RequestContext {
        RequestContext::web("POST")
    }

    /// A `GET` whose caller wrote `ago_millis` before `clock`'s now.
    pub fn get_after_write(clock: &dyn Clock, ago_millis: i64) -> RequestContext {
        RequestContext::web("GET").with_recent_postback_millis(clock.now_millis() - ago_millis)
    }

    pub fn task() -> RequestContext {
        RequestContext::task()
    }

    pub fn job() -> RequestContext {
        RequestContext::job()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for StashDB types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a widget name.
    pub fn arb_widget_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9 ]{0,30}"
    }

    /// Generate an unsaved widget.
    pub fn arb_widget() -> impl Strategy<Value = Widget> {
        (arb_widget_name(), any::<i32>()).prop_map(|(name, count)| Widget::new(name, count))
    }

    /// Generate a saved widget with an id and last-modified stamp.
    pub fn arb_saved_widget() -> impl Strategy<Value = Widget> {
        (arb_widget(), 100_000i64..1_000_000, 0i64..2_000_000_000_000).prop_map(
            |(mut widget, id, modified)| {
                widget.id = Some(id);
                widget.last_modified_millis = modified;
                widget
            },
        )
    }

    /// Generate an HTTP method.
    pub fn arb_method() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("GET".to_string()),
            Just("POST".to_string()),
            Just("PUT".to_string()),
            Just("DELETE".to_string()),
            Just("PATCH".to_string()),
        ]
    }

    /// Generate a non-null scalar value.
    pub fn arb_scalar_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(Value::Int),
            any::<i64>().prop_map(Value::BigInt),
            "[a-zA-Z0-9 ']{0,20}".prop_map(Value::Text),
        ]
    }

    /// Generate a JSON object with string keys and scalar values.
    pub fn arb_json_map() -> impl Strategy<Value = serde_json::Map<String, serde_json::Value>> {
        prop::collection::btree_map(
            "[a-z]{1,8}",
            prop_oneof![
                any::<i64>().prop_map(serde_json::Value::from),
                any::<bool>().prop_map(serde_json::Value::from),
                "[a-z ]{0,12}".prop_map(serde_json::Value::from),
            ],
            0..6,
        )
        .prop_map(|m| m.into_iter().collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Incremental sync of financial records into a local store.
//!
//! This crate contains:
//! - Domain types (entities, levels, session rules, timestamps, records)
//! - Record schemas and provider field maps
//! - The cursor, normalize, dedup and persist stages of a sync cycle
//! - The sync loop, its run context and a repeating runner
//! - Source adapters (static fixtures, HTTP JSON) and their request guards
//! - In-memory and DuckDB-backed stores

pub mod adapter;
pub mod adapters;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod context;
pub mod cursor;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod field_map;
pub mod hooks;
pub mod http_client;
pub mod logging;
pub mod normalize;
pub mod persist;
pub mod retry;
pub mod runner;
pub mod schema;
pub mod source_policy;
pub mod store;
pub mod sync;
pub mod throttling;
pub mod warehouse_store;

pub use adapter::{AdapterError, AdapterErrorKind, ErrorClass, FetchBatch, SourceAdapter};
pub use adapters::{HttpJsonAdapter, StaticAdapter};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FailureScope, SyncConfig};
pub use context::RunContext;
pub use cursor::{Cursor, CursorResolver, StaticTimestamps, TimestampSource};
pub use dedup::{DuplicatePolicy, DuplicateResolver};
pub use domain::{
    Entity, EntityType, FieldValue, IntervalLevel, PersistedRecord, RawRecord, SessionRules,
    Timestamp,
};
pub use error::{
    CoreError, MappingError, NormalizeError, StoreError, SyncError, TimestampParseError,
    ValidationError,
};
pub use field_map::{FieldMap, Transform};
pub use hooks::{BackfillHook, ExternalBackfillHook, FinishHook, HookError};
pub use http_client::{HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use normalize::Normalizer;
pub use persist::{BatchPersister, PersistOutcome};
pub use retry::{Backoff, RetryPolicy};
pub use runner::{Runner, RunnerSummary};
pub use schema::{kdata_schema, Cadence, FieldKind, FieldSpec, SchemaRegistry, SchemaSpec};
pub use source_policy::SourcePolicy;
pub use store::{BatchLog, EntityCatalog, EntityQuery, MemoryStore, Store};
pub use sync::{SyncEngine, SyncReport};
pub use throttling::Throttle;
pub use tickfill_warehouse::{QueryGuardrails, QueryResult, Warehouse, WarehouseConfig, WarehouseError};
pub use warehouse_store::WarehouseStore;

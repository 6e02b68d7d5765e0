//! # Agree Watch - Petition Counter Poll/Log/Serve Engine
//!
//! Polls public counter endpoints (the petition agree count and the petition
//! site's queue-wait count) on a fixed interval, appends every observation to a
//! flat log file, and serves the accumulated series over HTTP as JSON, PNG
//! charts and a server-sent event stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               AGREE WATCH                                 │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  FETCHER → APPENDER → (log file) → SERIES CACHE → AGGREGATOR / PREDICTOR  │
//! │                                          ↓                                │
//! │                         QUERY SURFACE + UPDATE HUB (SSE)                  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Unbounded fixed-delay retry**: transient upstream failures never reach readers
//! - **Bounded logs**: oldest records are rotated out once the cap is exceeded
//! - **Snapshot cache**: readers never observe a half-loaded series
//! - **Hourly deltas & trend projection**: when will the petition reach its goal?
//! - **Live updates**: subscribers get every new observation and the viewer count

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap, HashSet};
use std::convert::Infallible;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::{self, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use futures::stream::{self, Stream, StreamExt};

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use arc_swap::ArcSwap;
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, Timelike};

// ----------------------------------------------------------------------------
// Networking & HTTP
// ----------------------------------------------------------------------------
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client as HttpClient;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Chart Rendering
// ----------------------------------------------------------------------------
use embedded_graphics::mono_font::ascii::{FONT_10X20, FONT_6X10};
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{Circle, Line, Polyline, PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Alignment, Text};

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{providers::{Env, Format, Toml}, Figment};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry as PrometheusRegistry,
    TextEncoder,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults mirror the cadence the two petition watchers have always run at. Everything that
// varies per deployment is also exposed through configuration.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "agree-watch";
pub const ENGINE_FULL_NAME: &str = "Agree Watch Petition Counter Engine";

// ----------------------------------------------------------------------------
// Record Format
// ----------------------------------------------------------------------------

/// Timestamp format used by both log formats and every JSON response
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Separator between timestamp and value in the line log format
pub const LINE_SEPARATOR: &str = ": Agree Count = ";

// ----------------------------------------------------------------------------
// Upstream Endpoints
// ----------------------------------------------------------------------------

/// Petition status API (JSON, field `agreCo`)
pub const PETITION_STATUS_URL: &str = "https://petitions.assembly.go.kr/api/petits/14CBAF8CE5733410E064B49691C1987F?petitId=14CBAF8CE5733410E064B49691C1987F&sttusCode=";

/// Queue-wait endpoint (text blob containing `nwait=<int>&`)
pub const QUEUE_WAIT_URL: &str = "https://wpetitions.assembly.go.kr/ts.wseq?opcode=5101&nfid=0&prefix=NetFunnel.gRtype=5101;&sid=service_1&aid=naep_1&js=yes";

/// Signature threshold at which a petition is referred to committee
pub const DEFAULT_PETITION_GOAL: i64 = 50_000;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Delay between successful polls of the petition counter (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Delay between successful polls of the queue-wait counter (seconds)
pub const DEFAULT_WAIT_POLL_INTERVAL_SECS: u64 = 14;

/// Minimum allowed poll interval (milliseconds)
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Default timeout for upstream HTTP requests (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// Fixed delay between fetch retries (seconds)
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Maximum age of a cached series before a reload is forced (seconds)
pub const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 60;

/// Maximum age of the combined overview response (seconds)
pub const DEFAULT_OVERVIEW_CACHE_SECS: u64 = 180;

/// Interval between SSE keep-alive comments (seconds)
pub const SSE_KEEP_ALIVE_SECS: u64 = 15;

/// Default aggregation bucket (seconds)
pub const DEFAULT_BUCKET_SECS: u64 = 3600;

// ----------------------------------------------------------------------------
// Retention
// ----------------------------------------------------------------------------

/// Rotation cap for the line log
pub const DEFAULT_MAX_LOG_LINES: usize = 4000;

/// Rotation cap for the JSON wait-time log
pub const DEFAULT_MAX_WAIT_RECORDS: usize = 50_000;

/// Buffered update events per subscriber before it starts lagging
pub const DEFAULT_EVENT_BUFFER: usize = 64;

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

/// Default HTTP listen address
pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:5230";

// ----------------------------------------------------------------------------
// Charts & Projection
// ----------------------------------------------------------------------------

pub const CHART_WIDTH: u32 = 1000;
pub const CHART_HEIGHT: u32 = 600;

/// Markers are only drawn while the series is sparse enough to read them
pub const CHART_MARKER_LIMIT: usize = 200;

/// Horizontal and vertical grid divisions
pub const CHART_GRID_DIVISIONS: i32 = 5;

/// Projections further out than this are reported as out of range (seconds)
pub const MAX_PROJECTION_SECS: f64 = 100.0 * 365.25 * 86_400.0;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Observations, series and the wall clock. Timestamps are naive local time
// with one-second precision so that every log format round-trips exactly.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Helpers
// ----------------------------------------------------------------------------

/// Format a timestamp the way the logs and the API expect.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a `%Y-%m-%d %H:%M:%S` timestamp.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, RecordError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|_| RecordError::BadTimestamp {
        raw: raw.to_string(),
    })
}

/// Serde adapter writing `NaiveDateTime` as `%Y-%m-%d %H:%M:%S`.
pub mod timestamp_format {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&ts.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Observation
// ----------------------------------------------------------------------------

/// One sample of an external counter.
///
/// Serialized as a two-element array `["2024-06-20 14:03:11", 1234]`, which is
/// both the JSON log record and the raw-series wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Observation {
    pub timestamp: NaiveDateTime,
    pub value: i64,
}

impl Observation {
    /// Create an observation, dropping sub-second precision.
    pub fn new(timestamp: NaiveDateTime, value: i64) -> Self {
        Self {
            timestamp: timestamp.with_nanosecond(0).unwrap_or(timestamp),
            value,
        }
    }

    pub fn timestamp_string(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}

impl Display for Observation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.timestamp.format(TIMESTAMP_FORMAT), self.value)
    }
}

impl Serialize for Observation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.timestamp_string(), self.value).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Observation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (raw, value): (String, i64) = Deserialize::deserialize(deserializer)?;
        let timestamp = parse_timestamp(&raw).map_err(serde::de::Error::custom)?;
        Ok(Self { timestamp, value })
    }
}

// ----------------------------------------------------------------------------
// 3.3 Series
// ----------------------------------------------------------------------------

/// Chronologically ordered observations. Readers share it as `Arc<Series>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Series {
    observations: Vec<Observation>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn push(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    /// Drop the oldest observations beyond `cap`, returning how many went.
    pub fn retain_last(&mut self, cap: usize) -> usize {
        let excess = self.observations.len().saturating_sub(cap);
        if excess > 0 {
            self.observations.drain(..excess);
        }
        excess
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn first(&self) -> Option<&Observation> {
        self.observations.first()
    }

    pub fn latest(&self) -> Option<&Observation> {
        self.observations.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> + '_ {
        self.observations.iter()
    }

    pub fn as_slice(&self) -> &[Observation] {
        &self.observations
    }

    pub fn into_vec(self) -> Vec<Observation> {
        self.observations
    }

    /// Timestamps as strings, oldest first.
    pub fn times(&self) -> Vec<String> {
        self.observations.iter().map(Observation::timestamp_string).collect()
    }

    /// Values, oldest first.
    pub fn values(&self) -> Vec<i64> {
        self.observations.iter().map(|o| o.value).collect()
    }
}

impl FromIterator<Observation> for Series {
    fn from_iter<I: IntoIterator<Item = Observation>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Wall Clock
// ----------------------------------------------------------------------------

/// Source of observation timestamps.
pub trait WallClock: Send + Sync + Debug {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time, matching what the log files have always held.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl WallClock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, all convertible into `WatchError`. Nothing
// here is fatal to a running server: fetch errors are retried, storage errors
// degrade durability, record errors skip a single record.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Chart error: {0}")]
    Chart(#[from] ChartError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WatchError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            WatchError::Config(_) => false,
            WatchError::Fetch(e) => e.is_recoverable(),
            WatchError::Storage(_) => true,
            WatchError::Chart(_) => true,
            WatchError::Io(_) => true,
            WatchError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            WatchError::Config(_) => "config",
            WatchError::Fetch(_) => "fetch",
            WatchError::Storage(_) => "storage",
            WatchError::Chart(_) => "chart",
            WatchError::Io(_) => "io",
            WatchError::Internal(_) => "internal",
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry after the fixed delay
    RetryAfterDelay,
    /// Skip this item and continue
    Skip,
    /// Fix configuration and restart
    FixConfiguration,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Fetch Errors
// ----------------------------------------------------------------------------

/// Errors from a single upstream fetch attempt
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Timeout waiting for '{target}' (waited {timeout_ms}ms)")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("Connection to '{endpoint}' failed: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    #[error("HTTP error {status_code} from '{endpoint}'")]
    HttpStatus { endpoint: String, status_code: u16 },

    #[error("Invalid response from '{target}': {message}")]
    InvalidResponse { target: String, message: String },

    #[error("HTTP client setup failed: {message}")]
    ClientSetup { message: String },
}

impl FetchError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FetchError::ClientSetup { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            FetchError::ClientSetup { .. } => RecoveryHint::FixConfiguration,
            _ => RecoveryHint::RetryAfterDelay,
        }
    }

    pub fn timeout(target: impl Into<String>, timeout: Duration) -> Self {
        FetchError::Timeout {
            target: target.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn invalid_response(target: impl Into<String>, message: impl Into<String>) -> Self {
        FetchError::InvalidResponse {
            target: target.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Storage Errors
// ----------------------------------------------------------------------------

/// Errors related to the durable observation logs
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Read of {} failed: {message}", path.display())]
    ReadFailed { path: PathBuf, message: String },

    #[error("Write to {} failed: {message}", path.display())]
    WriteFailed { path: PathBuf, message: String },

    #[error("Serialization failed: {message}")]
    SerializationFailed { message: String },

    #[error("Log {} is corrupted: {message}", path.display())]
    Corrupted { path: PathBuf, message: String },
}

impl StorageError {
    pub fn read(path: &Path, err: impl Display) -> Self {
        StorageError::ReadFailed {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    pub fn write(path: &Path, err: impl Display) -> Self {
        StorageError::WriteFailed {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// A single malformed log record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing '{}' separator", LINE_SEPARATOR.trim())]
    MissingSeparator,

    #[error("bad timestamp '{raw}'")]
    BadTimestamp { raw: String },

    #[error("bad value '{raw}'")]
    BadValue { raw: String },

    #[error("expected a [timestamp, value] pair")]
    BadShape,
}

// ----------------------------------------------------------------------------
// 4.5 Chart Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ChartError {
    #[error("series is empty")]
    EmptySeries,

    #[error("PNG encoding failed: {0}")]
    Encode(String),
}

impl From<Infallible> for ChartError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Aliases
// ----------------------------------------------------------------------------

pub type WatchResult<T> = Result<T, WatchError>;
pub type FetchResult<T> = Result<T, FetchError>;
pub type StorageResult<T> = Result<T, StorageError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration is layered with figment:
// - TOML file (agree-watch.toml)
// - Environment variables (AGREEWATCH_ prefix, `__` for nesting)
// - Built-in defaults reproducing the petition and queue-wait watchers
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration
// ----------------------------------------------------------------------------

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// HTTP surface settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Counters to poll, one poller and one log per entry
    #[serde(default = "default_targets")]
    pub targets: Vec<TargetConfig>,

    /// Combined realtime + hourly view served at `/api/plot-data`
    #[serde(default = "default_overview", skip_serializing_if = "Option::is_none")]
    pub overview: Option<OverviewConfig>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            targets: default_targets(),
            overview: default_overview(),
        }
    }
}

fn default_targets() -> Vec<TargetConfig> {
    vec![TargetConfig::petition_default(), TargetConfig::queue_wait_default()]
}

fn default_overview() -> Option<OverviewConfig> {
    Some(OverviewConfig::default())
}

impl WatchConfig {
    /// Load configuration from file with environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: WatchConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("AGREEWATCH_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment layer)
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: WatchConfig = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid_value("server.address", e.to_string()))?;

        if self.server.event_buffer == 0 {
            return Err(ConfigError::invalid_value("server.event_buffer", "must be at least 1"));
        }

        if !self.targets.iter().any(|t| t.enabled) {
            return Err(ConfigError::invalid_value("targets", "at least one enabled target is required"));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !seen.insert(target.name.as_str()) {
                return Err(ConfigError::invalid_value(
                    format!("targets.{}", target.name),
                    "duplicate target name",
                ));
            }
        }

        if let Some(overview) = self.active_overview() {
            for (field, name) in [("overview.realtime", &overview.realtime), ("overview.hourly", &overview.hourly)] {
                if !self.targets.iter().any(|t| t.enabled && &t.name == name) {
                    return Err(ConfigError::invalid_value(
                        field,
                        format!("'{}' is not an enabled target", name),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// The overview settings, unless absent or switched off
    pub fn active_overview(&self) -> Option<&OverviewConfig> {
        self.overview.as_ref().filter(|o| o.enabled)
    }

    /// Generate default configuration as TOML string
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_else(|_| String::from("# Failed to generate config"))
    }
}

// ----------------------------------------------------------------------------
// 5.2 Server Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_server_addr")]
    pub address: String,

    /// Serve permissive CORS headers (the dashboards are hosted elsewhere)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Per-subscriber event buffer
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// SSE keep-alive interval
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_addr(),
            cors_enabled: true,
            event_buffer: default_event_buffer(),
            keep_alive: default_keep_alive(),
        }
    }
}

fn default_server_addr() -> String {
    DEFAULT_SERVER_ADDR.to_string()
}
fn default_true() -> bool {
    true
}
fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}
fn default_keep_alive() -> Duration {
    Duration::from_secs(SSE_KEEP_ALIVE_SECS)
}

// ----------------------------------------------------------------------------
// 5.3 Target Configuration
// ----------------------------------------------------------------------------

/// On-disk record format of a target's log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `<timestamp>: Agree Count = <value>` per line
    #[default]
    Lines,
    /// A single JSON array of `[timestamp, value]` pairs
    Json,
}

/// How the counter value is located in a response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorConfig {
    /// Integer field of a JSON object
    JsonField { field: String },
    /// `<token>=<int>&` inside an arbitrary text body
    QueryToken { token: String },
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        ExtractorConfig::JsonField {
            field: "agreCo".to_string(),
        }
    }
}

/// One polled counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// URL-safe identifier used in routes and metric labels
    pub name: String,

    /// Human readable label used as chart title
    #[serde(default)]
    pub label: Option<String>,

    pub url: String,

    #[serde(default)]
    pub extractor: ExtractorConfig,

    /// Request headers; Host and Accept-Encoding are left to the HTTP client
    #[serde(default = "default_browser_headers")]
    pub headers: BTreeMap<String, String>,

    /// Append `&<epoch millis>=` to every request
    #[serde(default)]
    pub cache_buster: bool,

    pub log_path: PathBuf,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Rotation cap
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Maximum age of the cached series
    #[serde(default = "default_cache_timeout", with = "humantime_serde")]
    pub cache_timeout: Duration,

    /// Also reload when the log's modification time moves
    #[serde(default = "default_true")]
    pub track_mtime: bool,

    #[serde(default = "default_bucket_size", with = "humantime_serde")]
    pub bucket_size: Duration,

    /// Value the trend projection aims for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<i64>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_max_records() -> usize {
    DEFAULT_MAX_LOG_LINES
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)
}
fn default_retry_delay() -> Duration {
    Duration::from_secs(DEFAULT_RETRY_DELAY_SECS)
}
fn default_cache_timeout() -> Duration {
    Duration::from_secs(DEFAULT_CACHE_TIMEOUT_SECS)
}
fn default_bucket_size() -> Duration {
    Duration::from_secs(DEFAULT_BUCKET_SECS)
}

/// Browser-like headers the petition API expects.
fn default_browser_headers() -> BTreeMap<String, String> {
    [
        ("User-Agent", "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:127.0) Gecko/20100101 Firefox/127.0"),
        ("Accept", "application/json, text/plain, */*"),
        ("Accept-Language", "ko-KR,ko;q=0.8,en-US;q=0.5,en;q=0.3"),
        ("Connection", "keep-alive"),
        ("Upgrade-Insecure-Requests", "1"),
        ("Sec-Fetch-Dest", "empty"),
        ("Sec-Fetch-Mode", "cors"),
        ("Sec-Fetch-Site", "same-origin"),
        ("Priority", "u=1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl TargetConfig {
    /// The petition agree counter, logged as lines every 5 seconds.
    pub fn petition_default() -> Self {
        Self {
            name: "agree".to_string(),
            label: Some("Agree Count".to_string()),
            url: PETITION_STATUS_URL.to_string(),
            extractor: ExtractorConfig::default(),
            headers: default_browser_headers(),
            cache_buster: false,
            log_path: PathBuf::from("AgreeCountLog.txt"),
            log_format: LogFormat::Lines,
            max_records: DEFAULT_MAX_LOG_LINES,
            poll_interval: default_poll_interval(),
            request_timeout: default_request_timeout(),
            retry_delay: default_retry_delay(),
            cache_timeout: default_cache_timeout(),
            track_mtime: true,
            bucket_size: default_bucket_size(),
            goal: Some(DEFAULT_PETITION_GOAL),
            enabled: true,
        }
    }

    /// The queue-wait counter, logged as a JSON array every 14 seconds.
    pub fn queue_wait_default() -> Self {
        Self {
            name: "waiting".to_string(),
            label: Some("Waiting Users".to_string()),
            url: QUEUE_WAIT_URL.to_string(),
            extractor: ExtractorConfig::QueryToken {
                token: "nwait".to_string(),
            },
            headers: BTreeMap::new(),
            cache_buster: true,
            log_path: PathBuf::from("wait_times.json"),
            log_format: LogFormat::Json,
            max_records: DEFAULT_MAX_WAIT_RECORDS,
            poll_interval: Duration::from_secs(DEFAULT_WAIT_POLL_INTERVAL_SECS),
            request_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            cache_timeout: Duration::from_secs(DEFAULT_WAIT_POLL_INTERVAL_SECS),
            track_mtime: false,
            bucket_size: default_bucket_size(),
            goal: None,
            enabled: true,
        }
    }

    pub fn title(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let field = |name: &str| format!("targets.{}.{}", self.name, name);

        if self.name.is_empty()
            || !self.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::invalid_value(
                format!("targets.{}", self.name),
                "name must be non-empty and use only [A-Za-z0-9_-]",
            ));
        }

        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::invalid_value(field("url"), "must be an http(s) URL"));
        }

        match &self.extractor {
            ExtractorConfig::JsonField { field: f } if f.is_empty() => {
                return Err(ConfigError::invalid_value(field("extractor.field"), "must not be empty"));
            }
            ExtractorConfig::QueryToken { token } if token.is_empty() => {
                return Err(ConfigError::invalid_value(field("extractor.token"), "must not be empty"));
            }
            _ => {}
        }

        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConfigError::invalid_value(field("headers"), format!("{}: {}", name, e)))?;
            HeaderValue::from_str(value)
                .map_err(|e| ConfigError::invalid_value(field("headers"), format!("{}: {}", name, e)))?;
        }

        if self.max_records == 0 {
            return Err(ConfigError::invalid_value(field("max_records"), "must be at least 1"));
        }

        if self.poll_interval < Duration::from_millis(MIN_POLL_INTERVAL_MS) {
            return Err(ConfigError::invalid_value(
                field("poll_interval"),
                format!("must be at least {}ms", MIN_POLL_INTERVAL_MS),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid_value(field("request_timeout"), "must be positive"));
        }

        if self.bucket_size < Duration::from_secs(1) {
            return Err(ConfigError::invalid_value(field("bucket_size"), "must be at least 1s"));
        }

        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.4 Overview Configuration
// ----------------------------------------------------------------------------

/// Which targets feed `/api/plot-data`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverviewConfig {
    /// `false` turns `/api/plot-data` off
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Target whose raw series becomes `time`/`count`
    pub realtime: String,

    /// Target whose hourly deltas become `hour`/`joined`
    pub hourly: String,

    #[serde(default = "default_overview_cache", with = "humantime_serde")]
    pub cache_timeout: Duration,
}

impl Default for OverviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            realtime: "waiting".to_string(),
            hourly: "agree".to_string(),
            cache_timeout: default_overview_cache(),
        }
    }
}

fn default_overview_cache() -> Duration {
    Duration::from_secs(DEFAULT_OVERVIEW_CACHE_SECS)
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Daily-rolled log file, in addition to stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source file and line
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with tracing:
// - Configurable output formats (pretty, JSON, compact)
// - RUST_LOG overrides on top of the configured level
// - Optional non-blocking daily-rolled file output
// ============================================================================

/// Log level wrapper for parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Initialize the logging system.
///
/// The returned guard flushes the file writer on drop and must live as long
/// as the process logs.
pub fn init_logging(config: &LoggingConfig) -> WatchResult<Option<WorkerGuard>> {
    let level = LogLevel::parse(&config.level).to_tracing_level();
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let stdout_layer = match config.format.as_str() {
        "json" => tracing_fmt::layer()
            .json()
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
        "compact" => tracing_fmt::layer()
            .compact()
            .with_ansi(config.colors)
            .with_target(true)
            .boxed(),
        _ => tracing_fmt::layer()
            .pretty()
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
    };

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let prefix = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| ENGINE_NAME.into());
            let appender = tracing_appender::rolling::daily(directory, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_fmt::layer().with_ansi(false).with_target(true).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| WatchError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "agree_watch::init",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

// ============================================================================
// SECTION 7: METRICS
// ============================================================================
// Prometheus counters and gauges, labelled by target, rendered at /metrics.
// ============================================================================

/// Process-wide metric families
#[derive(Clone)]
pub struct WatchMetrics {
    registry: PrometheusRegistry,
    polls: IntCounterVec,
    poll_failures: IntCounterVec,
    write_failures: IntCounterVec,
    rotations: IntCounterVec,
    cache_reloads: IntCounterVec,
    skipped_records: IntCounterVec,
    subscribers: IntGaugeVec,
    latest_value: IntGaugeVec,
}

impl Debug for WatchMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchMetrics").finish_non_exhaustive()
    }
}

impl WatchMetrics {
    pub fn new() -> WatchResult<Self> {
        let registry = PrometheusRegistry::new();

        let counter = |name: &str, help: &str| -> WatchResult<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(name, help), &["target"])
                .map_err(|e| WatchError::Internal(format!("metric {}: {}", name, e)))?;
            registry
                .register(Box::new(vec.clone()))
                .map_err(|e| WatchError::Internal(format!("metric {}: {}", name, e)))?;
            Ok(vec)
        };

        let polls = counter("agree_watch_polls_total", "Successful polls")?;
        let poll_failures = counter("agree_watch_poll_failures_total", "Failed fetch attempts")?;
        let write_failures = counter("agree_watch_log_write_failures_total", "Abandoned durable writes")?;
        let rotations = counter("agree_watch_rotations_total", "Records rotated out of a log")?;
        let cache_reloads = counter("agree_watch_cache_reloads_total", "Series reloads from disk")?;
        let skipped_records = counter("agree_watch_skipped_records_total", "Malformed records skipped on load")?;

        let gauge = |name: &str, help: &str| -> WatchResult<IntGaugeVec> {
            let vec = IntGaugeVec::new(Opts::new(name, help), &["target"])
                .map_err(|e| WatchError::Internal(format!("metric {}: {}", name, e)))?;
            registry
                .register(Box::new(vec.clone()))
                .map_err(|e| WatchError::Internal(format!("metric {}: {}", name, e)))?;
            Ok(vec)
        };

        let subscribers = gauge("agree_watch_subscribers", "Connected update subscribers")?;
        let latest_value = gauge("agree_watch_latest_value", "Most recently observed value")?;

        Ok(Self {
            registry,
            polls,
            poll_failures,
            write_failures,
            rotations,
            cache_reloads,
            skipped_records,
            subscribers,
            latest_value,
        })
    }

    /// Handles bound to one target's label
    pub fn for_target(&self, name: &str) -> TargetMetrics {
        TargetMetrics {
            polls: self.polls.with_label_values(&[name]),
            poll_failures: self.poll_failures.with_label_values(&[name]),
            write_failures: self.write_failures.with_label_values(&[name]),
            rotations: self.rotations.with_label_values(&[name]),
            cache_reloads: self.cache_reloads.with_label_values(&[name]),
            skipped_records: self.skipped_records.with_label_values(&[name]),
            subscribers: self.subscribers.with_label_values(&[name]),
            latest_value: self.latest_value.with_label_values(&[name]),
        }
    }

    /// Text exposition format
    pub fn render(&self) -> WatchResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| WatchError::Internal(format!("metrics encoding: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| WatchError::Internal(e.to_string()))
    }
}

#[derive(Clone)]
pub struct TargetMetrics {
    pub polls: IntCounter,
    pub poll_failures: IntCounter,
    pub write_failures: IntCounter,
    pub rotations: IntCounter,
    pub cache_reloads: IntCounter,
    pub skipped_records: IntCounter,
    pub subscribers: IntGauge,
    pub latest_value: IntGauge,
}

impl Debug for TargetMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetMetrics")
            .field("polls", &self.polls.get())
            .field("poll_failures", &self.poll_failures.get())
            .field("cache_reloads", &self.cache_reloads.get())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 8: CLI & COMMAND LINE INTERFACE
// ============================================================================
// Command-line interface with:
// - `run` (default): poll every target and serve the API
// - `validate` / `generate-config` / `version`
// - `report`: offline summary of one target's log
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Agree Watch CLI
#[derive(Parser, Debug)]
#[command(
    name = "agree-watch",
    version,
    about = "Petition counter poller and live dashboard backend",
    long_about = "Agree Watch polls public petition counters on a fixed interval, keeps \
                  a bounded log of every observation, and serves the series as JSON, \
                  PNG charts and a live event stream."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "agree-watch.toml", env = "AGREEWATCH_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "AGREEWATCH_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll all targets and serve the HTTP API (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Print the resolved targets
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration
    GenerateConfig {
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,

    /// Summarize a target's log without starting the server
    Report {
        /// Target name
        target: String,

        /// Also print per-bucket deltas
        #[arg(long)]
        hourly: bool,
    },
}

// ----------------------------------------------------------------------------
// 8.2 Command Handlers
// ----------------------------------------------------------------------------

/// Handle the version command
pub fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  Package:  {}", ENGINE_NAME);
    println!("  Target:   {}", std::env::consts::ARCH);
    println!("  OS:       {}", std::env::consts::OS);
}

/// Handle the generate-config command
pub fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config = WatchConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config)
                .with_context(|| format!("Failed to write config to {}", path.display()))?;
            println!("✅ Configuration written to {}", path.display());
        }
        None => {
            println!("{}", config);
        }
    }

    Ok(())
}

/// Handle the validate command
pub fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration: {}", config_path.display());

    match WatchConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid");

            if verbose {
                println!();
                println!("📋 Configuration Summary:");
                println!("  Listen address: {}", config.server.address);
                println!("  Targets:");
                for target in &config.targets {
                    println!(
                        "    • {} ({}) every {} → {} [{:?}, cap {}]{}",
                        target.name,
                        target.title(),
                        humantime::format_duration(target.poll_interval),
                        target.log_path.display(),
                        target.log_format,
                        target.max_records,
                        if target.enabled { "" } else { " (disabled)" }
                    );
                }
                if let Some(overview) = config.active_overview() {
                    println!("  Overview: realtime={} hourly={}", overview.realtime, overview.hourly);
                }
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration is invalid: {}", e);
            Err(e.into())
        }
    }
}

/// Handle the report command
pub fn handle_report(config: &WatchConfig, name: &str, hourly: bool) -> WatchResult<()> {
    let target = config
        .target(name)
        .ok_or_else(|| ConfigError::invalid_value("target", format!("unknown target '{}'", name)))?;

    // read-only: a corrupt JSON log is reported, never moved aside
    let loaded = match target.log_format {
        LogFormat::Lines => LineLog::new(&target.log_path, target.max_records).load()?,
        LogFormat::Json => read_json_records(&target.log_path)?,
    };
    let series = &loaded.series;

    println!("📋 {} ({})", target.title(), target.log_path.display());
    println!("  Records:  {} ({} skipped)", series.len(), loaded.skipped);
    match (series.first(), series.latest()) {
        (Some(first), Some(latest)) => {
            println!("  First:    {}", first);
            println!("  Latest:   {}", latest);
        }
        _ => println!("  No observations yet"),
    }

    if let Some(goal) = target.goal {
        match Predictor::predict(series, goal) {
            Ok(projection) => println!(
                "  Goal {}: projected {} ({:+.1}/h)",
                goal,
                format_timestamp(&projection.projected_timestamp),
                projection.slope_per_hour
            ),
            Err(reason) => println!("  Goal {}: no projection ({})", goal, reason),
        }
    }

    if hourly {
        let size = BucketSize::from_duration(target.bucket_size).unwrap_or(BucketSize::HOUR);
        println!();
        for delta in Aggregator::deltas(series, size) {
            println!("  {}  {:>+8}", format_timestamp(&delta.hour), delta.joined);
        }
    }

    Ok(())
}

// ============================================================================
// SECTION 9: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the agree-watch binary
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    // Load configuration
    let config_found = cli.config.exists();
    let config = if config_found {
        WatchConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        WatchConfig::default()
    };

    // Override log level if specified
    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(&logging_config)?;

    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    match cli.command {
        Some(Commands::Report { target, hourly }) => {
            handle_report(&config, &target, hourly)?;
        }
        Some(Commands::Run) | None => {
            info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
            let engine = Engine::new(config)?;
            engine.run().await?;
        }
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 10: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).unwrap()
    }

    #[test]
    fn test_observation_drops_subsecond_precision() {
        let precise = ts("2024-06-20 14:03:11") + TimeDelta::milliseconds(750);
        let observation = Observation::new(precise, 7);

        assert_eq!(observation.timestamp, ts("2024-06-20 14:03:11"));
        assert_eq!(observation.timestamp_string(), "2024-06-20 14:03:11");
    }

    #[test]
    fn test_observation_json_shape() {
        let observation = Observation::new(ts("2024-06-20 14:03:11"), 1234);
        let encoded = serde_json::to_string(&observation).unwrap();
        assert_eq!(encoded, r#"["2024-06-20 14:03:11",1234]"#);

        let decoded: Observation = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, observation);
    }

    #[test]
    fn test_series_retain_last() {
        let base = ts("2024-06-20 00:00:00");
        let mut series: Series = (0..6)
            .map(|i| Observation::new(base + TimeDelta::seconds(i), i))
            .collect();

        assert_eq!(series.retain_last(4), 2);
        assert_eq!(series.values(), vec![2, 3, 4, 5]);
        assert_eq!(series.retain_last(10), 0);
        assert_eq!(series.latest().map(|o| o.value), Some(5));
    }

    #[test]
    fn test_config_defaults() {
        let config = WatchConfig::default();

        assert_eq!(config.server.address, DEFAULT_SERVER_ADDR);
        assert_eq!(config.targets.len(), 2);

        let agree = config.target("agree").unwrap();
        assert_eq!(agree.log_format, LogFormat::Lines);
        assert_eq!(agree.max_records, DEFAULT_MAX_LOG_LINES);
        assert_eq!(agree.poll_interval, Duration::from_secs(5));
        assert_eq!(agree.goal, Some(DEFAULT_PETITION_GOAL));
        assert!(!agree.headers.contains_key("Host"));
        assert!(!agree.headers.contains_key("Accept-Encoding"));

        let waiting = config.target("waiting").unwrap();
        assert_eq!(waiting.log_format, LogFormat::Json);
        assert_eq!(waiting.max_records, DEFAULT_MAX_WAIT_RECORDS);
        assert!(waiting.cache_buster);
        assert_eq!(
            waiting.extractor,
            ExtractorConfig::QueryToken {
                token: "nwait".to_string()
            }
        );

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_parse_minimal_target() {
        let config = WatchConfig::parse_toml(
            r#"
            [server]
            address = "127.0.0.1:8080"

            [[targets]]
            name = "agree"
            url = "https://example.com/api"
            log_path = "agree.txt"
            poll_interval = "10s"
            extractor = { kind = "json_field", field = "count" }

            [overview]
            realtime = "agree"
            hourly = "agree"
            cache_timeout = "1m"
            "#,
        )
        .unwrap();

        assert_eq!(config.targets.len(), 1);
        let target = &config.targets[0];
        assert_eq!(target.poll_interval, Duration::from_secs(10));
        assert_eq!(target.retry_delay, Duration::from_secs(DEFAULT_RETRY_DELAY_SECS));
        assert_eq!(target.max_records, DEFAULT_MAX_LOG_LINES);
        assert_eq!(target.log_format, LogFormat::Lines);
        assert_eq!(target.title(), "agree");
        assert_eq!(config.overview.unwrap().cache_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_config_rejects_duplicate_names() {
        let mut config = WatchConfig::default();
        config.targets[1].name = "agree".to_string();
        config.overview = None;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_config_rejects_zero_cap() {
        let mut config = WatchConfig::default();
        config.targets[0].max_records = 0;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_records"));
    }

    #[test]
    fn test_config_rejects_unknown_overview_target() {
        let mut config = WatchConfig::default();
        config.overview = Some(OverviewConfig {
            realtime: "nope".to_string(),
            ..OverviewConfig::default()
        });

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_bad_route_name() {
        let mut config = WatchConfig::default();
        config.targets[0].name = "agree count".to_string();
        config.overview = None;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_config_parses_back() {
        let generated = WatchConfig::generate_default_config();
        let parsed = WatchConfig::parse_toml(&generated).unwrap();

        assert_eq!(parsed.targets.len(), 2);
        assert_eq!(parsed.targets[1].poll_interval, Duration::from_secs(DEFAULT_WAIT_POLL_INTERVAL_SECS));
        assert_eq!(parsed.targets[0].headers, default_browser_headers());
    }

    #[test]
    fn test_empty_file_matches_builtin_defaults() {
        let parsed = WatchConfig::parse_toml("").unwrap();
        let builtin = WatchConfig::default();

        let parsed_overview = parsed.active_overview().unwrap();
        let builtin_overview = builtin.active_overview().unwrap();
        assert_eq!(parsed_overview.realtime, builtin_overview.realtime);
        assert_eq!(parsed_overview.hourly, builtin_overview.hourly);
        assert_eq!(parsed_overview.cache_timeout, builtin_overview.cache_timeout);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_overview_can_be_switched_off() {
        let config = WatchConfig::parse_toml(
            r#"
            [[targets]]
            name = "solo"
            url = "https://example.com/api"
            log_path = "solo.txt"

            [overview]
            enabled = false
            realtime = "waiting"
            hourly = "agree"
            "#,
        )
        .unwrap();

        assert!(config.overview.is_some());
        assert!(config.active_overview().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_missing_file() {
        let err = WatchConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::parse("TRACE"), LogLevel::Trace);
        assert_eq!(LogLevel::parse("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("garbage"), LogLevel::Info);
        assert_eq!(LogLevel::Error.to_tracing_level(), Level::ERROR);
    }

    #[test]
    fn test_error_categories() {
        let err: WatchError = FetchError::timeout("agree", Duration::from_secs(60)).into();
        assert_eq!(err.category(), "fetch");
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("60000ms"));

        let err: WatchError = ConfigError::invalid_value("x", "y").into();
        assert!(!err.is_recoverable());

        let setup = FetchError::ClientSetup { message: "bad".into() };
        assert_eq!(setup.recovery_hint(), RecoveryHint::FixConfiguration);
    }

    #[test]
    fn test_metrics_render_per_target() {
        let metrics = WatchMetrics::new().unwrap();
        let agree = metrics.for_target("agree");
        agree.polls.inc();
        agree.latest_value.set(1234);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"agree_watch_polls_total{target="agree"} 1"#));
        assert!(text.contains(r#"agree_watch_latest_value{target="agree"} 1234"#));
    }

    #[test]
    fn test_cli_parses_report() {
        let cli = Cli::parse_from(["agree-watch", "-c", "x.toml", "report", "agree", "--hourly"]);
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert!(matches!(
            cli.command,
            Some(Commands::Report { ref target, hourly: true }) if target == "agree"
        ));
    }
}

// ============================================================================
// SECTION 11: RECORD CODECS
// ============================================================================
// Two on-disk record shapes:
// - Line:  `2024-06-20 14:03:11: Agree Count = 1234`
// - JSON:  `["2024-06-20 14:03:11", 1234]` inside one top-level array
// Decoding is per record so one bad record never poisons a load.
// ============================================================================

/// Line log codec
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCodec;

impl LineCodec {
    pub fn encode(observation: &Observation) -> String {
        format!(
            "{}{}{}",
            observation.timestamp.format(TIMESTAMP_FORMAT),
            LINE_SEPARATOR,
            observation.value
        )
    }

    pub fn decode(line: &str) -> Result<Observation, RecordError> {
        let (raw_ts, raw_value) = line.split_once(LINE_SEPARATOR).ok_or(RecordError::MissingSeparator)?;
        let timestamp = parse_timestamp(raw_ts.trim())?;
        let raw_value = raw_value.trim();
        let value = raw_value.parse::<i64>().map_err(|_| RecordError::BadValue {
            raw: raw_value.to_string(),
        })?;
        Ok(Observation { timestamp, value })
    }
}

/// JSON pair codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordCodec;

impl JsonRecordCodec {
    pub fn decode(record: &JsonValue) -> Result<Observation, RecordError> {
        let pair = record.as_array().filter(|a| a.len() == 2).ok_or(RecordError::BadShape)?;
        let raw_ts = pair[0].as_str().ok_or(RecordError::BadShape)?;
        let timestamp = parse_timestamp(raw_ts)?;
        let value = pair[1].as_i64().ok_or_else(|| RecordError::BadValue {
            raw: pair[1].to_string(),
        })?;
        Ok(Observation { timestamp, value })
    }
}

/// Outcome of reading a log: the good records plus a count of skipped ones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedSeries {
    pub series: Series,
    pub skipped: usize,
}

fn is_blank(raw: &[u8]) -> bool {
    raw.iter().all(u8::is_ascii_whitespace)
}

fn parse_line_records(path: &Path, bytes: &[u8]) -> LoadedSeries {
    let mut loaded = LoadedSeries::default();
    for (index, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        if is_blank(raw) {
            continue;
        }
        let line = String::from_utf8_lossy(raw);
        match LineCodec::decode(line.trim_end_matches('\r')) {
            Ok(observation) => loaded.series.push(observation),
            Err(e) => {
                loaded.skipped += 1;
                debug!(
                    target: "agree_watch::log",
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping malformed record"
                );
            }
        }
    }
    loaded
}

// ============================================================================
// SECTION 12: OBSERVATION LOGS (APPENDER)
// ============================================================================
// Durable, bounded, append-only storage of observations. The poller is the
// sole writer of each log. Rotation rewrites through a temp file and a rename
// so readers see either the old or the new content.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Log Trait
// ----------------------------------------------------------------------------

/// Result of a successful append
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Records dropped from the head of the log
    pub rotated: usize,
    /// Records remaining after the append
    pub retained: usize,
}

/// Durable storage for one target's observations
pub trait ObservationLog: Send + Sync + Debug {
    fn path(&self) -> &Path;

    fn format(&self) -> LogFormat;

    /// Append and rotate. A failed write is retried once before giving up.
    fn append(&self, observation: &Observation) -> StorageResult<AppendOutcome>;

    /// Read the durable copy, skipping malformed records.
    fn load(&self) -> StorageResult<LoadedSeries>;

    fn modified(&self) -> Option<SystemTime> {
        fs::metadata(self.path()).and_then(|m| m.modified()).ok()
    }
}

/// Open the log a target is configured for.
pub fn open_log(target: &TargetConfig) -> StorageResult<Arc<dyn ObservationLog>> {
    ensure_parent_dir(&target.log_path)?;
    let log: Arc<dyn ObservationLog> = match target.log_format {
        LogFormat::Lines => Arc::new(LineLog::new(&target.log_path, target.max_records)),
        LogFormat::Json => Arc::new(JsonArrayLog::open(&target.log_path, target.max_records)?),
    };
    Ok(log)
}

fn ensure_parent_dir(path: &Path) -> StorageResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| StorageError::write(parent, e))
        }
        _ => Ok(()),
    }
}

/// Read a whole file, treating a missing file as empty.
fn read_optional(path: &Path) -> StorageResult<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StorageError::read(path, e)),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` atomically with `contents`.
fn replace_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn with_write_retry<T>(path: &Path, mut op: impl FnMut() -> io::Result<T>) -> StorageResult<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(
                target: "agree_watch::log",
                path = %path.display(),
                error = %first,
                "Log write failed, retrying once"
            );
            op().map_err(|e| StorageError::write(path, e))
        }
    }
}

// ----------------------------------------------------------------------------
// 12.2 Line Log
// ----------------------------------------------------------------------------

/// One record per line, capped at `max_records` lines.
#[derive(Debug)]
pub struct LineLog {
    path: PathBuf,
    max_records: usize,
    /// Records currently in the file, `None` until counted
    record_count: Mutex<Option<usize>>,
}

impl LineLog {
    pub fn new(path: impl Into<PathBuf>, max_records: usize) -> Self {
        Self {
            path: path.into(),
            max_records: max_records.max(1),
            record_count: Mutex::new(None),
        }
    }

    fn count_records(&self) -> StorageResult<usize> {
        let bytes = read_optional(&self.path)?;
        Ok(bytes.split(|b| *b == b'\n').filter(|raw| !is_blank(raw)).count())
    }

    /// Keep the newest `max_records` lines. Returns how many were kept.
    fn rotate(&self) -> StorageResult<usize> {
        let bytes = read_optional(&self.path)?;
        let lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').filter(|raw| !is_blank(raw)).collect();
        let keep = &lines[lines.len().saturating_sub(self.max_records)..];

        let mut contents = Vec::with_capacity(bytes.len());
        for line in keep {
            contents.extend_from_slice(line);
            contents.push(b'\n');
        }
        with_write_retry(&self.path, || replace_file(&self.path, &contents))?;
        Ok(keep.len())
    }

    fn append_locked(&self, observation: &Observation, count: &mut Option<usize>) -> StorageResult<AppendOutcome> {
        let line = format!("{}\n", LineCodec::encode(observation));
        with_write_retry(&self.path, || {
            let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            file.write_all(line.as_bytes())?;
            file.flush()
        })?;

        let current = match *count {
            Some(n) => n + 1,
            None => self.count_records()?,
        };

        if current > self.max_records {
            let retained = self.rotate()?;
            *count = Some(retained);
            Ok(AppendOutcome {
                rotated: current - retained,
                retained,
            })
        } else {
            *count = Some(current);
            Ok(AppendOutcome {
                rotated: 0,
                retained: current,
            })
        }
    }
}

impl ObservationLog for LineLog {
    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> LogFormat {
        LogFormat::Lines
    }

    fn append(&self, observation: &Observation) -> StorageResult<AppendOutcome> {
        let mut count = self.record_count.lock();
        let result = self.append_locked(observation, &mut count);
        if result.is_err() {
            // recount from disk next time
            *count = None;
        }
        result
    }

    fn load(&self) -> StorageResult<LoadedSeries> {
        let bytes = read_optional(&self.path)?;
        Ok(parse_line_records(&self.path, &bytes))
    }
}

// ----------------------------------------------------------------------------
// 12.3 JSON Array Log
// ----------------------------------------------------------------------------

/// A single JSON array rewritten on every append, capped at `max_records`.
///
/// The in-memory mirror always holds what the file should contain, so a
/// write that failed is repaired by the next successful one.
#[derive(Debug)]
pub struct JsonArrayLog {
    path: PathBuf,
    max_records: usize,
    mirror: Mutex<Vec<Observation>>,
}

impl JsonArrayLog {
    pub fn open(path: impl Into<PathBuf>, max_records: usize) -> StorageResult<Self> {
        let path = path.into();
        let max_records = max_records.max(1);

        let mut records = match read_json_records(&path) {
            Ok(loaded) => loaded.series.into_vec(),
            Err(StorageError::Corrupted { message, .. }) => {
                let backup = path.with_extension("json.corrupt");
                warn!(
                    target: "agree_watch::log",
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %message,
                    "Log is not a JSON array, moving it aside and starting empty"
                );
                fs::rename(&path, &backup).map_err(|e| StorageError::write(&path, e))?;
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let excess = records.len().saturating_sub(max_records);
        records.drain(..excess);

        Ok(Self {
            path,
            max_records,
            mirror: Mutex::new(records),
        })
    }
}

fn read_json_records(path: &Path) -> StorageResult<LoadedSeries> {
    let bytes = read_optional(path)?;
    if is_blank(&bytes) {
        return Ok(LoadedSeries::default());
    }

    let records: Vec<JsonValue> = serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupted {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut loaded = LoadedSeries::default();
    for (index, record) in records.iter().enumerate() {
        match JsonRecordCodec::decode(record) {
            Ok(observation) => loaded.series.push(observation),
            Err(e) => {
                loaded.skipped += 1;
                debug!(
                    target: "agree_watch::log",
                    path = %path.display(),
                    index,
                    error = %e,
                    "Skipping malformed record"
                );
            }
        }
    }
    Ok(loaded)
}

impl ObservationLog for JsonArrayLog {
    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> LogFormat {
        LogFormat::Json
    }

    fn append(&self, observation: &Observation) -> StorageResult<AppendOutcome> {
        let mut records = self.mirror.lock();
        records.push(*observation);
        let rotated = records.len().saturating_sub(self.max_records);
        records.drain(..rotated);

        let contents = serde_json::to_vec(&*records).map_err(|e| StorageError::SerializationFailed {
            message: e.to_string(),
        })?;
        with_write_retry(&self.path, || replace_file(&self.path, &contents))?;

        Ok(AppendOutcome {
            rotated,
            retained: records.len(),
        })
    }

    fn load(&self) -> StorageResult<LoadedSeries> {
        read_json_records(&self.path)
    }
}

// ============================================================================
// SECTION 13: SERIES CACHE
// ============================================================================
// Readers get an immutable `Arc<Series>` snapshot published through ArcSwap.
// A stale snapshot is refreshed by exactly one reader (double-checked under a
// mutex); concurrent readers either wait for that reload or keep the old
// snapshot, never a partial one. While the log is behind memory because a
// write was abandoned, disk reloads are held back.
// ============================================================================

/// When a snapshot must be reloaded from disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    /// Maximum snapshot age
    pub timeout: Duration,
    /// Reload when the log's mtime differs from the snapshot's
    pub track_mtime: bool,
}

impl StalenessPolicy {
    pub fn for_target(target: &TargetConfig) -> Self {
        Self {
            timeout: target.cache_timeout,
            track_mtime: target.track_mtime,
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    series: Arc<Series>,
    /// `None` until the first load
    loaded_at: Option<Instant>,
    mtime: Option<SystemTime>,
}

#[derive(Debug)]
pub struct SeriesCache {
    log: Arc<dyn ObservationLog>,
    policy: StalenessPolicy,
    max_records: usize,
    state: ArcSwap<CacheState>,
    refresh_lock: Mutex<()>,
    durable_pending: AtomicBool,
    reloads: AtomicU64,
    metrics: Option<TargetMetrics>,
}

impl SeriesCache {
    pub fn new(log: Arc<dyn ObservationLog>, policy: StalenessPolicy, max_records: usize) -> Self {
        Self {
            log,
            policy,
            max_records: max_records.max(1),
            state: ArcSwap::from_pointee(CacheState::default()),
            refresh_lock: Mutex::new(()),
            durable_pending: AtomicBool::new(false),
            reloads: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: TargetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of reloads from disk so far
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(AtomicOrdering::Relaxed)
    }

    /// True while memory holds observations the log lacks
    pub fn durable_pending(&self) -> bool {
        self.durable_pending.load(AtomicOrdering::Acquire)
    }

    /// The current snapshot without any staleness check or I/O
    pub fn current(&self) -> Arc<Series> {
        Arc::clone(&self.state.load().series)
    }

    fn is_stale(&self, state: &CacheState) -> bool {
        let Some(loaded_at) = state.loaded_at else {
            return true;
        };
        if self.durable_pending() {
            return false;
        }
        if loaded_at.elapsed() >= self.policy.timeout {
            return true;
        }
        self.policy.track_mtime && self.log.modified() != state.mtime
    }

    /// Return a fresh snapshot, reloading from disk if stale. Blocking.
    pub fn get_series(&self) -> Arc<Series> {
        let state = self.state.load_full();
        if !self.is_stale(&state) {
            return Arc::clone(&state.series);
        }

        let _guard = self.refresh_lock.lock();
        let state = self.state.load_full();
        if !self.is_stale(&state) {
            return Arc::clone(&state.series);
        }
        self.reload_locked(&state)
    }

    /// `get_series`, going to the blocking pool only when a reload is due.
    pub async fn series(self: &Arc<Self>) -> Arc<Series> {
        let state = self.state.load_full();
        if !self.is_stale(&state) {
            return Arc::clone(&state.series);
        }

        let cache = Arc::clone(self);
        match task::spawn_blocking(move || cache.get_series()).await {
            Ok(series) => series,
            Err(e) => {
                warn!(target: "agree_watch::cache", path = %self.log.path().display(), error = %e, "Refresh task failed");
                self.current()
            }
        }
    }

    /// Read the log. On failure the previous series is kept.
    fn read_log(&self, previous: &CacheState) -> (Arc<Series>, Option<SystemTime>) {
        // mtime first: a write landing mid-read shows up as a newer mtime
        let mtime = self.log.modified();
        match self.log.load() {
            Ok(loaded) => {
                if loaded.skipped > 0 {
                    warn!(
                        target: "agree_watch::cache",
                        path = %self.log.path().display(),
                        skipped = loaded.skipped,
                        "Skipped malformed records"
                    );
                    if let Some(m) = &self.metrics {
                        m.skipped_records.inc_by(loaded.skipped as u64);
                    }
                }
                (Arc::new(loaded.series), mtime)
            }
            Err(e) => {
                warn!(
                    target: "agree_watch::cache",
                    path = %self.log.path().display(),
                    error = %e,
                    "Reload failed, serving previous snapshot"
                );
                (Arc::clone(&previous.series), previous.mtime)
            }
        }
    }

    fn reload_locked(&self, previous: &CacheState) -> Arc<Series> {
        let (series, mtime) = self.read_log(previous);
        self.reloads.fetch_add(1, AtomicOrdering::Relaxed);
        if let Some(m) = &self.metrics {
            m.cache_reloads.inc();
        }
        trace!(
            target: "agree_watch::cache",
            path = %self.log.path().display(),
            records = series.len(),
            "Series reloaded"
        );
        self.state.store(Arc::new(CacheState {
            series: Arc::clone(&series),
            loaded_at: Some(Instant::now()),
            mtime,
        }));
        series
    }

    /// Fold a new observation into the snapshot.
    ///
    /// `durable` tells whether the log append succeeded. Blocking on first use.
    pub fn record(&self, observation: Observation, durable: bool) -> Arc<Series> {
        let _guard = self.refresh_lock.lock();
        let previous = self.state.load_full();

        if previous.loaded_at.is_none() && durable {
            self.durable_pending.store(false, AtomicOrdering::Release);
            return self.reload_locked(&previous);
        }

        let (base, mut mtime) = if previous.loaded_at.is_none() {
            self.reloads.fetch_add(1, AtomicOrdering::Relaxed);
            self.read_log(&previous)
        } else {
            (Arc::clone(&previous.series), previous.mtime)
        };

        let mut series = (*base).clone();
        // an append that failed after writing its line is already on disk
        if series.latest() != Some(&observation) {
            series.push(observation);
        }
        series.retain_last(self.max_records);

        if durable {
            mtime = self.log.modified();
        }
        self.durable_pending.store(!durable, AtomicOrdering::Release);

        let series = Arc::new(series);
        self.state.store(Arc::new(CacheState {
            series: Arc::clone(&series),
            loaded_at: Some(Instant::now()),
            mtime,
        }));
        series
    }
}

// ============================================================================
// SECTION 14: AGGREGATION
// ============================================================================
// Fixed-width time buckets (hourly by default). The representative value of
// a bucket is the last observation seen for it; deltas compare consecutive
// buckets and are labelled with the end of the earlier bucket.
// ============================================================================

/// Width of an aggregation bucket, whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSize(i64);

impl BucketSize {
    pub const HOUR: BucketSize = BucketSize(3600);

    pub fn from_duration(duration: Duration) -> Option<Self> {
        let secs = i64::try_from(duration.as_secs()).ok()?;
        (secs >= 1).then_some(BucketSize(secs))
    }

    pub fn seconds(self) -> i64 {
        self.0
    }

    /// Start of the bucket containing `ts`.
    pub fn floor(self, ts: NaiveDateTime) -> NaiveDateTime {
        let secs = ts.and_utc().timestamp();
        let floored = secs - secs.rem_euclid(self.0);
        DateTime::from_timestamp(floored, 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or(ts)
    }

    pub fn end_of(self, bucket_start: NaiveDateTime) -> Option<NaiveDateTime> {
        bucket_start.checked_add_signed(TimeDelta::try_seconds(self.0)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bucket {
    #[serde(with = "timestamp_format")]
    pub bucket_start: NaiveDateTime,
    pub representative_value: i64,
    /// Change to the next bucket; `None` for the final bucket
    pub delta: Option<i64>,
}

/// Growth between two consecutive buckets, shaped for the hourly API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketDelta {
    #[serde(with = "timestamp_format")]
    pub hour: NaiveDateTime,
    pub joined: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator;

impl Aggregator {
    /// Group by bucket, ascending. Later observations overwrite earlier ones.
    pub fn bucket(series: &Series, size: BucketSize) -> Vec<Bucket> {
        let mut by_start: BTreeMap<NaiveDateTime, i64> = BTreeMap::new();
        for observation in series.iter() {
            by_start.insert(size.floor(observation.timestamp), observation.value);
        }

        let ordered: Vec<(NaiveDateTime, i64)> = by_start.into_iter().collect();
        ordered
            .iter()
            .enumerate()
            .map(|(i, (start, value))| Bucket {
                bucket_start: *start,
                representative_value: *value,
                delta: ordered.get(i + 1).map(|(_, next)| next.saturating_sub(*value)),
            })
            .collect()
    }

    /// Deltas between consecutive buckets; the final bucket contributes none.
    pub fn deltas(series: &Series, size: BucketSize) -> Vec<BucketDelta> {
        Self::bucket(series, size)
            .into_iter()
            .filter_map(|bucket| {
                let joined = bucket.delta?;
                let hour = size.end_of(bucket.bucket_start)?;
                Some(BucketDelta { hour, joined })
            })
            .collect()
    }
}

// ============================================================================
// SECTION 15: TREND PROJECTION
// ============================================================================
// Ordinary least squares of value against seconds since the first
// observation, extrapolated to the time the goal value is reached.
// ============================================================================

/// Least-squares fit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrendAnalysis;

impl TrendAnalysis {
    /// Fit `y = slope * x + intercept`. `None` with fewer than two points or
    /// when every x is identical.
    pub fn linear_regression(points: &[(f64, f64)]) -> Option<LinearFit> {
        if points.len() < 2 {
            return None;
        }

        let n = points.len() as f64;
        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

        let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
        for (x, y) in points {
            let dx = x - mean_x;
            let dy = y - mean_y;
            sxx += dx * dx;
            sxy += dx * dy;
            syy += dy * dy;
        }

        if sxx.abs() < f64::EPSILON {
            return None;
        }

        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        let r_squared = if syy.abs() < f64::EPSILON {
            1.0
        } else {
            (sxy * sxy) / (sxx * syy)
        };

        Some(LinearFit {
            slope,
            intercept,
            r_squared,
        })
    }
}

/// A projected crossing of the goal value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Projection {
    pub target_value: i64,
    #[serde(with = "timestamp_format")]
    pub projected_timestamp: NaiveDateTime,
    pub slope_per_hour: f64,
    pub r_squared: f64,
    pub samples: usize,
}

/// Why no projection can be made
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unavailable {
    #[error("fewer than two observations")]
    InsufficientData,
    #[error("all observations share one timestamp")]
    DegenerateTime,
    #[error("trend is flat or falling")]
    NonPositiveSlope,
    #[error("target value already reached")]
    TargetReached,
    #[error("projection is out of range")]
    OutOfRange,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Predictor;

impl Predictor {
    pub fn predict(series: &Series, target_value: i64) -> Result<Projection, Unavailable> {
        let (Some(first), Some(latest)) = (series.first(), series.latest()) else {
            return Err(Unavailable::InsufficientData);
        };
        if latest.value >= target_value {
            return Err(Unavailable::TargetReached);
        }
        if series.len() < 2 {
            return Err(Unavailable::InsufficientData);
        }

        let start = first.timestamp;
        let points: Vec<(f64, f64)> = series
            .iter()
            .map(|o| ((o.timestamp - start).num_milliseconds() as f64 / 1000.0, o.value as f64))
            .collect();

        let fit = TrendAnalysis::linear_regression(&points).ok_or(Unavailable::DegenerateTime)?;
        if !(fit.slope > 0.0) {
            return Err(Unavailable::NonPositiveSlope);
        }

        let elapsed = (target_value as f64 - fit.intercept) / fit.slope;
        if !elapsed.is_finite() || elapsed < 0.0 || elapsed > MAX_PROJECTION_SECS {
            return Err(Unavailable::OutOfRange);
        }

        let offset = TimeDelta::try_milliseconds((elapsed * 1000.0).round() as i64).ok_or(Unavailable::OutOfRange)?;
        let projected_timestamp = start.checked_add_signed(offset).ok_or(Unavailable::OutOfRange)?;

        Ok(Projection {
            target_value,
            projected_timestamp,
            slope_per_hour: fit.slope * 3600.0,
            r_squared: fit.r_squared,
            samples: series.len(),
        })
    }
}

// ============================================================================
// SECTION 16: PHASE 2 TESTS
// ============================================================================

#[cfg(test)]
mod phase2_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).unwrap()
    }

    fn obs(raw: &str, value: i64) -> Observation {
        Observation::new(ts(raw), value)
    }

    fn series_at(base: &str, points: &[(i64, i64)]) -> Series {
        let base = ts(base);
        points
            .iter()
            .map(|(secs, value)| Observation::new(base + TimeDelta::seconds(*secs), *value))
            .collect()
    }

    fn long_policy() -> StalenessPolicy {
        StalenessPolicy {
            timeout: Duration::from_secs(3600),
            track_mtime: false,
        }
    }

    // ------------------------------------------------------------------
    // Codecs
    // ------------------------------------------------------------------

    #[test]
    fn test_line_codec_exact_format() {
        let line = LineCodec::encode(&obs("2024-06-20 14:03:11", 1234));
        assert_eq!(line, "2024-06-20 14:03:11: Agree Count = 1234");
        assert_eq!(LineCodec::decode(&line).unwrap(), obs("2024-06-20 14:03:11", 1234));
    }

    #[rstest]
    #[case("garbage", RecordError::MissingSeparator)]
    #[case("2024-13-40 99:00:00: Agree Count = 5", RecordError::BadTimestamp { raw: "2024-13-40 99:00:00".into() })]
    #[case("2024-06-20 14:03:11: Agree Count = many", RecordError::BadValue { raw: "many".into() })]
    #[case("2024-06-20 14:03:11: Agree Count = ", RecordError::BadValue { raw: "".into() })]
    fn test_line_codec_rejects(#[case] line: &str, #[case] expected: RecordError) {
        assert_eq!(LineCodec::decode(line).unwrap_err(), expected);
    }

    #[rstest]
    #[case(json!(["2024-06-20 14:03:11", 3]), true)]
    #[case(json!(["2024-06-20 14:03:11"]), false)]
    #[case(json!(["not a time", 3]), false)]
    #[case(json!(["2024-06-20 14:03:11", "3"]), false)]
    #[case(json!({"ts": "2024-06-20 14:03:11"}), false)]
    fn test_json_record_decode(#[case] record: JsonValue, #[case] ok: bool) {
        assert_eq!(JsonRecordCodec::decode(&record).is_ok(), ok);
    }

    proptest! {
        #[test]
        fn prop_line_codec_round_trip(secs in 0i64..4_000_000_000, value in any::<i64>()) {
            let timestamp = DateTime::from_timestamp(secs, 0).unwrap().naive_utc();
            let observation = Observation::new(timestamp, value);
            let decoded = LineCodec::decode(&LineCodec::encode(&observation)).unwrap();
            prop_assert_eq!(decoded, observation);
        }
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    #[test]
    fn test_line_log_append_and_load() {
        let dir = TempDir::new().unwrap();
        let log = LineLog::new(dir.path().join("AgreeCountLog.txt"), 10);

        log.append(&obs("2024-06-20 10:00:00", 1)).unwrap();
        log.append(&obs("2024-06-20 10:00:05", 2)).unwrap();

        let content = fs::read_to_string(log.path()).unwrap();
        assert_eq!(
            content,
            "2024-06-20 10:00:00: Agree Count = 1\n2024-06-20 10:00:05: Agree Count = 2\n"
        );

        let loaded = log.load().unwrap();
        assert_eq!(loaded.series.values(), vec![1, 2]);
        assert_eq!(loaded.skipped, 0);
    }

    #[test]
    fn test_line_log_rotation_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let log = LineLog::new(dir.path().join("log.txt"), 3);

        let mut outcomes = Vec::new();
        for i in 0..5 {
            outcomes.push(log.append(&Observation::new(ts("2024-06-20 10:00:00") + TimeDelta::seconds(i), i)).unwrap());
        }

        assert_eq!(outcomes[2], AppendOutcome { rotated: 0, retained: 3 });
        assert_eq!(outcomes[3], AppendOutcome { rotated: 1, retained: 3 });

        let loaded = log.load().unwrap();
        assert_eq!(loaded.series.values(), vec![2, 3, 4]);
        assert_eq!(fs::read_to_string(log.path()).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_line_log_counts_existing_file_on_first_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.txt");
        let existing: String = (0..4)
            .map(|i| format!("2024-06-20 09:00:0{}: Agree Count = {}\n", i, i))
            .collect();
        fs::write(&path, existing).unwrap();

        let log = LineLog::new(&path, 4);
        let outcome = log.append(&obs("2024-06-20 09:00:09", 9)).unwrap();

        assert_eq!(outcome.rotated, 1);
        assert_eq!(log.load().unwrap().series.values(), vec![1, 2, 3, 9]);
    }

    #[test]
    fn test_line_log_skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.txt");
        fs::write(
            &path,
            "2024-06-20 10:00:00: Agree Count = 1\nnot a record\n\n2024-06-20 10:00:10: Agree Count = x\n2024-06-20 10:00:20: Agree Count = 3\r\n",
        )
        .unwrap();

        let loaded = LineLog::new(&path, 100).load().unwrap();
        assert_eq!(loaded.series.values(), vec![1, 3]);
        assert_eq!(loaded.skipped, 2);
    }

    #[test]
    fn test_line_log_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let loaded = LineLog::new(dir.path().join("absent.txt"), 10).load().unwrap();
        assert!(loaded.series.is_empty());
    }

    #[test]
    fn test_json_log_round_trip_and_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wait_times.json");
        let log = JsonArrayLog::open(&path, 2).unwrap();

        log.append(&obs("2024-06-20 10:00:00", 10)).unwrap();
        log.append(&obs("2024-06-20 10:00:14", 20)).unwrap();
        let outcome = log.append(&obs("2024-06-20 10:00:28", 30)).unwrap();
        assert_eq!(outcome, AppendOutcome { rotated: 1, retained: 2 });

        let on_disk: JsonValue = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, json!([["2024-06-20 10:00:14", 20], ["2024-06-20 10:00:28", 30]]));

        // reopening picks the history back up
        let reopened = JsonArrayLog::open(&path, 2).unwrap();
        reopened.append(&obs("2024-06-20 10:00:42", 40)).unwrap();
        assert_eq!(reopened.load().unwrap().series.values(), vec![30, 40]);
    }

    #[test]
    fn test_json_log_skips_bad_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wait_times.json");
        fs::write(&path, r#"[["2024-06-20 10:00:00", 1], ["oops"], ["2024-06-20 10:00:14", 2]]"#).unwrap();

        let loaded = JsonArrayLog::open(&path, 10).unwrap().load().unwrap();
        assert_eq!(loaded.series.values(), vec![1, 2]);
        assert_eq!(loaded.skipped, 1);
    }

    #[test]
    fn test_json_log_moves_corrupt_file_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wait_times.json");
        fs::write(&path, "{ not json").unwrap();

        let log = JsonArrayLog::open(&path, 10).unwrap();
        assert!(log.load().unwrap().series.is_empty());
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[test]
    fn test_open_log_creates_parent_dir() {
        let dir = TempDir::new().unwrap();
        let mut target = TargetConfig::petition_default();
        target.log_path = dir.path().join("nested/deeper/AgreeCountLog.txt");

        let log = open_log(&target).unwrap();
        log.append(&obs("2024-06-20 10:00:00", 1)).unwrap();
        assert_eq!(log.format(), LogFormat::Lines);
        assert!(target.log_path.exists());
    }

    // ------------------------------------------------------------------
    // Series cache
    // ------------------------------------------------------------------

    #[test]
    fn test_cache_serves_snapshot_until_stale() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(LineLog::new(dir.path().join("log.txt"), 100));
        log.append(&obs("2024-06-20 10:00:00", 1)).unwrap();

        let cache = SeriesCache::new(log.clone(), long_policy(), 100);
        assert_eq!(cache.get_series().values(), vec![1]);
        assert_eq!(cache.reload_count(), 1);

        // a write the cache was not told about stays invisible while fresh
        log.append(&obs("2024-06-20 10:00:05", 2)).unwrap();
        assert_eq!(cache.get_series().values(), vec![1]);
        assert_eq!(cache.reload_count(), 1);
    }

    #[test]
    fn test_cache_reloads_when_mtime_moves() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.txt");
        let log = Arc::new(LineLog::new(&path, 100));
        log.append(&obs("2024-06-20 10:00:00", 1)).unwrap();

        let cache = SeriesCache::new(
            log.clone(),
            StalenessPolicy {
                timeout: Duration::from_secs(3600),
                track_mtime: true,
            },
            100,
        );
        assert_eq!(cache.get_series().len(), 1);

        log.append(&obs("2024-06-20 10:00:05", 2)).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(30))
            .unwrap();

        assert_eq!(cache.get_series().values(), vec![1, 2]);
        assert_eq!(cache.reload_count(), 2);
    }

    #[test]
    fn test_cache_reloads_after_timeout() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(LineLog::new(dir.path().join("log.txt"), 100));
        let cache = SeriesCache::new(
            log.clone(),
            StalenessPolicy {
                timeout: Duration::ZERO,
                track_mtime: false,
            },
            100,
        );

        assert!(cache.get_series().is_empty());
        log.append(&obs("2024-06-20 10:00:00", 1)).unwrap();
        assert_eq!(cache.get_series().values(), vec![1]);
        assert_eq!(cache.reload_count(), 2);
    }

    #[test]
    fn test_cache_concurrent_stale_readers_reload_once() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(LineLog::new(dir.path().join("log.txt"), 100));
        log.append(&obs("2024-06-20 10:00:00", 1)).unwrap();

        let cache = Arc::new(SeriesCache::new(log, long_policy(), 100));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.get_series().len()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
        assert_eq!(cache.reload_count(), 1);
    }

    #[test]
    fn test_cache_record_applies_cap() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(LineLog::new(dir.path().join("log.txt"), 2));
        let cache = SeriesCache::new(log.clone(), long_policy(), 2);

        for (i, raw) in ["2024-06-20 10:00:00", "2024-06-20 10:00:05", "2024-06-20 10:00:10"].iter().enumerate() {
            let observation = obs(raw, i as i64);
            log.append(&observation).unwrap();
            cache.record(observation, true);
        }

        assert_eq!(cache.get_series().values(), vec![1, 2]);
        assert!(!cache.durable_pending());
    }

    #[test]
    fn test_cache_holds_back_reload_while_write_pending() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(LineLog::new(dir.path().join("log.txt"), 100));
        log.append(&obs("2024-06-20 10:00:00", 1)).unwrap();

        let cache = SeriesCache::new(
            log,
            StalenessPolicy {
                timeout: Duration::ZERO,
                track_mtime: true,
            },
            100,
        );
        assert_eq!(cache.get_series().len(), 1);

        // write abandoned: memory is ahead of disk
        cache.record(obs("2024-06-20 10:00:05", 2), false);
        assert!(cache.durable_pending());

        assert_eq!(cache.get_series().values(), vec![1, 2]);
        assert_eq!(cache.get_series().values(), vec![1, 2]);
        assert_eq!(cache.reload_count(), 1);
    }

    #[test]
    fn test_write_retry_tries_twice() {
        let path = Path::new("/tmp/agree-watch-retry.log");

        let mut attempts = 0;
        let recovered = with_write_retry(path, || {
            attempts += 1;
            if attempts == 1 {
                Err(io::Error::new(io::ErrorKind::Other, "disk hiccup"))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(recovered.unwrap(), 2);

        let mut attempts = 0;
        let abandoned: StorageResult<()> = with_write_retry(path, || {
            attempts += 1;
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        });
        assert!(matches!(abandoned, Err(StorageError::WriteFailed { .. })));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_cache_record_does_not_duplicate_written_line() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(LineLog::new(dir.path().join("log.txt"), 100));
        log.append(&obs("2024-06-20 10:00:00", 1)).unwrap();
        let observation = obs("2024-06-20 10:00:05", 2);
        log.append(&observation).unwrap();

        // line landed but the append reported failure afterwards
        let cache = SeriesCache::new(log, long_policy(), 100);
        let series = cache.record(observation, false);

        assert_eq!(series.values(), vec![1, 2]);
        assert!(cache.durable_pending());
    }

    #[tokio::test]
    async fn test_cache_async_read_skips_reload_when_fresh() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(LineLog::new(dir.path().join("log.txt"), 100));
        log.append(&obs("2024-06-20 10:00:00", 1)).unwrap();

        let cache = Arc::new(SeriesCache::new(log, long_policy(), 100));
        assert_eq!(cache.series().await.values(), vec![1]);
        let first = cache.series().await;
        let second = cache.series().await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.reload_count(), 1);
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    #[test]
    fn test_bucket_later_observation_wins() {
        let series = Series::from_vec(vec![
            obs("2024-06-20 10:05:00", 100),
            obs("2024-06-20 10:55:00", 150),
            obs("2024-06-20 11:10:00", 180),
        ]);

        let buckets = Aggregator::bucket(&series, BucketSize::HOUR);
        assert_eq!(
            buckets,
            vec![
                Bucket {
                    bucket_start: ts("2024-06-20 10:00:00"),
                    representative_value: 150,
                    delta: Some(30),
                },
                Bucket {
                    bucket_start: ts("2024-06-20 11:00:00"),
                    representative_value: 180,
                    delta: None,
                },
            ]
        );
    }

    #[test]
    fn test_deltas_are_labelled_with_bucket_end() {
        let series = Series::from_vec(vec![
            obs("2024-06-20 09:59:59", 10),
            obs("2024-06-20 10:30:00", 40),
            obs("2024-06-20 12:01:00", 100),
            obs("2024-06-20 12:59:00", 130),
        ]);

        let deltas = Aggregator::deltas(&series, BucketSize::HOUR);
        assert_eq!(
            deltas,
            vec![
                BucketDelta { hour: ts("2024-06-20 10:00:00"), joined: 30 },
                BucketDelta { hour: ts("2024-06-20 11:00:00"), joined: 90 },
            ]
        );

        let encoded = serde_json::to_value(&deltas).unwrap();
        assert_eq!(encoded[0], json!({"hour": "2024-06-20 10:00:00", "joined": 30}));
    }

    #[test]
    fn test_deltas_need_two_buckets() {
        let series = Series::from_vec(vec![obs("2024-06-20 10:00:00", 1), obs("2024-06-20 10:59:59", 5)]);
        assert!(Aggregator::deltas(&series, BucketSize::HOUR).is_empty());
        assert!(Aggregator::deltas(&Series::new(), BucketSize::HOUR).is_empty());
    }

    #[test]
    fn test_bucket_size_floor() {
        let size = BucketSize::from_duration(Duration::from_secs(900)).unwrap();
        assert_eq!(size.floor(ts("2024-06-20 10:44:59")), ts("2024-06-20 10:30:00"));
        assert!(BucketSize::from_duration(Duration::from_millis(500)).is_none());
    }

    // ------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------

    #[test]
    fn test_linear_regression() {
        let points: Vec<(f64, f64)> = (0..10).map(|x| (x as f64, 2.0 * x as f64 + 1.0)).collect();
        let fit = TrendAnalysis::linear_regression(&points).unwrap();

        assert!((fit.slope - 2.0).abs() < 1e-9);
        assert!((fit.intercept - 1.0).abs() < 1e-9);
        assert!((fit.r_squared - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_predict_two_points() {
        let series = series_at("2024-06-20 10:00:00", &[(0, 100), (100, 200)]);
        let projection = Predictor::predict(&series, 300).unwrap();

        assert_eq!(projection.projected_timestamp, ts("2024-06-20 10:03:20"));
        assert!((projection.slope_per_hour - 3600.0).abs() < 1e-6);
        assert_eq!(projection.samples, 2);
    }

    #[rstest]
    #[case(&[(0, 100)], 300, Unavailable::InsufficientData)]
    #[case(&[], 300, Unavailable::InsufficientData)]
    #[case(&[(0, 100), (0, 200)], 300, Unavailable::DegenerateTime)]
    #[case(&[(0, 100), (60, 100)], 300, Unavailable::NonPositiveSlope)]
    #[case(&[(0, 200), (60, 100)], 300, Unavailable::NonPositiveSlope)]
    #[case(&[(0, 100), (60, 300)], 300, Unavailable::TargetReached)]
    fn test_predict_unavailable(#[case] points: &[(i64, i64)], #[case] target: i64, #[case] expected: Unavailable) {
        let series = series_at("2024-06-20 10:00:00", points);
        assert_eq!(Predictor::predict(&series, target).unwrap_err(), expected);
    }

    #[test]
    fn test_predict_out_of_range() {
        let series = series_at("2024-06-20 10:00:00", &[(0, 0), (86_400 * 365, 1)]);
        assert_eq!(Predictor::predict(&series, 1_000_000).unwrap_err(), Unavailable::OutOfRange);
    }
}

// ============================================================================
// SECTION 17: COUNTER SOURCES & FETCHER
// ============================================================================
// A counter source performs one HTTP request and extracts one integer. The
// fetcher wraps it in unbounded fixed-delay retry: callers only ever see a
// value, failures are logged and counted.
// ============================================================================

// ----------------------------------------------------------------------------
// 17.1 Value Extraction
// ----------------------------------------------------------------------------

/// Locates the counter in a response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueExtractor {
    /// Integer (or integer string) field of a JSON object
    JsonField(String),
    /// First `<token>=<int>` occurrence, terminated by `&` or end of body
    QueryToken(String),
}

impl From<&ExtractorConfig> for ValueExtractor {
    fn from(config: &ExtractorConfig) -> Self {
        match config {
            ExtractorConfig::JsonField { field } => ValueExtractor::JsonField(field.clone()),
            ExtractorConfig::QueryToken { token } => ValueExtractor::QueryToken(token.clone()),
        }
    }
}

impl ValueExtractor {
    pub fn extract(&self, body: &str) -> Result<i64, String> {
        match self {
            ValueExtractor::JsonField(field) => {
                let document: JsonValue =
                    serde_json::from_str(body).map_err(|e| format!("body is not JSON: {}", e))?;
                match document.get(field) {
                    Some(JsonValue::Number(n)) => n
                        .as_i64()
                        .ok_or_else(|| format!("'{}' is not an integer: {}", field, n)),
                    Some(JsonValue::String(s)) => s
                        .trim()
                        .parse()
                        .map_err(|_| format!("'{}' is not an integer: {:?}", field, s)),
                    Some(other) => Err(format!("'{}' has unexpected value {}", field, other)),
                    None => Err(format!("field '{}' missing", field)),
                }
            }
            ValueExtractor::QueryToken(token) => {
                let marker = format!("{}=", token);
                let (_, rest) = body
                    .split_once(marker.as_str())
                    .ok_or_else(|| format!("token '{}' missing", token))?;
                let raw = rest.split('&').next().unwrap_or_default().trim();
                raw.parse()
                    .map_err(|_| format!("'{}' is not an integer: {:?}", token, raw))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 17.2 Counter Source Trait
// ----------------------------------------------------------------------------

/// One attempt at reading an external counter
#[async_trait]
pub trait CounterSource: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn fetch_once(&self) -> FetchResult<i64>;
}

// ----------------------------------------------------------------------------
// 17.3 HTTP Counter Source
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct HttpCounterSource {
    name: String,
    url: String,
    cache_buster: bool,
    timeout: Duration,
    extractor: ValueExtractor,
    client: HttpClient,
}

impl HttpCounterSource {
    pub fn new(target: &TargetConfig) -> FetchResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &target.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| FetchError::ClientSetup {
                message: format!("header name {:?}: {}", name, e),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| FetchError::ClientSetup {
                message: format!("header {}: {}", name, e),
            })?;
            headers.insert(name, value);
        }

        let client = HttpClient::builder()
            .timeout(target.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| FetchError::ClientSetup { message: e.to_string() })?;

        Ok(Self {
            name: target.name.clone(),
            url: target.url.clone(),
            cache_buster: target.cache_buster,
            timeout: target.request_timeout,
            extractor: ValueExtractor::from(&target.extractor),
            client,
        })
    }

    /// URL for the next request; a cache-busting `&<millis>=` pair is appended when enabled.
    pub fn request_url(&self) -> String {
        if !self.cache_buster {
            return self.url.clone();
        }
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let joiner = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}=", self.url, joiner, millis)
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::timeout(&self.name, self.timeout)
        } else {
            FetchError::ConnectionFailed {
                endpoint: self.url.clone(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl CounterSource for HttpCounterSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_once(&self) -> FetchResult<i64> {
        let url = self.request_url();
        trace!(target: "agree_watch::fetcher", source = %self.name, url = %url, "Requesting counter");

        let response = self.client.get(&url).send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                endpoint: self.url.clone(),
                status_code: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| self.classify(e))?;
        self.extractor
            .extract(&body)
            .map_err(|message| FetchError::invalid_response(&self.name, message))
    }
}

// ----------------------------------------------------------------------------
// 17.4 Retry
// ----------------------------------------------------------------------------

/// Fixed delay between attempts, retried without bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    pub const fn immediate() -> Self {
        Self { delay: Duration::ZERO }
    }
}

#[derive(Debug)]
pub struct Fetcher {
    source: Arc<dyn CounterSource>,
    policy: RetryPolicy,
    metrics: Option<TargetMetrics>,
}

impl Fetcher {
    pub fn new(source: Arc<dyn CounterSource>, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: TargetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fetch until a value arrives. Never returns an error.
    pub async fn fetch(&self) -> i64 {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.source.fetch_once().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            target: "agree_watch::fetcher",
                            source = %self.source.name(),
                            attempts = attempt,
                            value,
                            "Fetch recovered"
                        );
                    }
                    return value;
                }
                Err(e) => {
                    if let Some(m) = &self.metrics {
                        m.poll_failures.inc();
                    }
                    warn!(
                        target: "agree_watch::fetcher",
                        source = %self.source.name(),
                        attempt,
                        error = %e,
                        hint = ?e.recovery_hint(),
                        retry_in_ms = self.policy.delay.as_millis() as u64,
                        "Fetch failed, retrying"
                    );
                    sleep(self.policy.delay).await;
                }
            }
        }
    }
}

// ============================================================================
// SECTION 18: TARGETS & POLLER
// ============================================================================
// A target bundles everything one counter needs at runtime. Its poller is
// the only writer: fetch, stamp, append, fold into the cache, broadcast,
// sleep, repeat, until the shutdown token fires.
// ============================================================================

// ----------------------------------------------------------------------------
// 18.1 Target Handle
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct TargetHandle {
    pub config: TargetConfig,
    pub log: Arc<dyn ObservationLog>,
    pub cache: Arc<SeriesCache>,
    pub hub: Arc<UpdateHub>,
    pub charts: ChartCache,
    pub bucket_size: BucketSize,
    pub metrics: TargetMetrics,
}

impl TargetHandle {
    pub fn open(config: &TargetConfig, server: &ServerConfig, metrics: &WatchMetrics) -> WatchResult<Self> {
        let bucket_size = BucketSize::from_duration(config.bucket_size).ok_or_else(|| {
            ConfigError::invalid_value(format!("targets.{}.bucket_size", config.name), "must be at least 1s")
        })?;
        let metrics = metrics.for_target(&config.name);
        let log = open_log(config)?;
        let cache = SeriesCache::new(Arc::clone(&log), StalenessPolicy::for_target(config), config.max_records)
            .with_metrics(metrics.clone());
        let hub = UpdateHub::new(&config.name, server.event_buffer).with_gauge(metrics.subscribers.clone());

        debug!(
            target: "agree_watch::engine",
            counter = %config.name,
            log = %config.log_path.display(),
            format = ?config.log_format,
            "Target opened"
        );

        Ok(Self {
            config: config.clone(),
            log,
            cache: Arc::new(cache),
            hub: Arc::new(hub),
            charts: ChartCache::new(ChartRenderer::new(config.title())),
            bucket_size,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Chart URL with a cache-busting query derived from the latest timestamp
    pub fn chart_url(&self, latest: &Observation) -> String {
        format!("/api/{}/chart.png?t={}", self.config.name, latest.timestamp.format("%Y%m%d%H%M%S"))
    }

    pub fn update_event(&self, latest: &Observation, series: &Series) -> UpdateEvent {
        let projected_timestamp = self
            .config
            .goal
            .and_then(|goal| Predictor::predict(series, goal).ok())
            .map(|p| format_timestamp(&p.projected_timestamp));

        UpdateEvent {
            target: self.config.name.clone(),
            latest_count: latest.value,
            latest_timestamp: latest.timestamp_string(),
            chart_url: self.chart_url(latest),
            projected_timestamp,
        }
    }
}

// ----------------------------------------------------------------------------
// 18.2 Poller
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Poller {
    handle: Arc<TargetHandle>,
    fetcher: Fetcher,
    clock: Arc<dyn WallClock>,
}

impl Poller {
    pub fn new(handle: Arc<TargetHandle>, fetcher: Fetcher, clock: Arc<dyn WallClock>) -> Self {
        Self { handle, fetcher, clock }
    }

    pub fn handle(&self) -> &Arc<TargetHandle> {
        &self.handle
    }

    /// One full cycle without the trailing sleep.
    pub async fn poll_once(&self) -> Observation {
        let value = self.fetcher.fetch().await;
        let observation = Observation::new(self.clock.now(), value);

        let durable = self.persist(observation).await;

        let handle = Arc::clone(&self.handle);
        let series = match task::spawn_blocking(move || handle.cache.record(observation, durable)).await {
            Ok(series) => series,
            Err(e) => {
                warn!(target: "agree_watch::poller", counter = %self.handle.name(), error = %e, "Cache update failed");
                self.handle.cache.current()
            }
        };

        self.handle.metrics.polls.inc();
        self.handle.metrics.latest_value.set(value);
        info!(
            target: "agree_watch::poller",
            counter = %self.handle.name(),
            value,
            timestamp = %observation.timestamp_string(),
            durable,
            "Observation recorded"
        );

        let event = self.handle.update_event(&observation, &series);
        let receivers = self.handle.hub.publish(HubEvent::Update(event));
        trace!(target: "agree_watch::poller", counter = %self.handle.name(), receivers, "Update broadcast");

        observation
    }

    /// Append to the log; `false` means the observation lives only in memory.
    async fn persist(&self, observation: Observation) -> bool {
        let log = Arc::clone(&self.handle.log);
        match task::spawn_blocking(move || log.append(&observation)).await {
            Ok(Ok(outcome)) => {
                if outcome.rotated > 0 {
                    self.handle.metrics.rotations.inc_by(outcome.rotated as u64);
                    debug!(
                        target: "agree_watch::poller",
                        counter = %self.handle.name(),
                        rotated = outcome.rotated,
                        retained = outcome.retained,
                        "Log rotated"
                    );
                }
                true
            }
            Ok(Err(e)) => {
                self.handle.metrics.write_failures.inc();
                error!(
                    target: "agree_watch::poller",
                    counter = %self.handle.name(),
                    error = %e,
                    "Durable write abandoned for this cycle, value kept in memory"
                );
                false
            }
            Err(e) => {
                self.handle.metrics.write_failures.inc();
                error!(target: "agree_watch::poller", counter = %self.handle.name(), error = %e, "Append task failed");
                false
            }
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let interval = self.handle.config.poll_interval;
        info!(
            target: "agree_watch::poller",
            counter = %self.handle.name(),
            interval = %humantime::format_duration(interval),
            "Poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.poll_once() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }

        info!(target: "agree_watch::poller", counter = %self.handle.name(), "Poller stopped");
    }
}

// ============================================================================
// SECTION 19: UPDATE HUB
// ============================================================================
// Per-target broadcast of new observations and of the live subscriber count.
// Slow subscribers lag and skip; the poller never waits on them.
// ============================================================================

/// Payload of an `update` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateEvent {
    pub target: String,
    pub latest_count: i64,
    pub latest_timestamp: String,
    pub chart_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projected_timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    Update(UpdateEvent),
    UserCount { count: usize },
}

impl HubEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::Update(_) => "update",
            HubEvent::UserCount { .. } => "user_count",
        }
    }

    pub fn payload(&self) -> JsonValue {
        match self {
            HubEvent::Update(update) => serde_json::to_value(update).unwrap_or(JsonValue::Null),
            HubEvent::UserCount { count } => json!({ "count": count }),
        }
    }

    pub fn to_sse(&self) -> SseEvent {
        SseEvent::default().event(self.name()).data(self.payload().to_string())
    }
}

pub struct UpdateHub {
    target: String,
    sender: broadcast::Sender<HubEvent>,
    /// Held while announcing so counts go out in the order they change
    subscribers: Mutex<usize>,
    gauge: Option<IntGauge>,
}

impl Debug for UpdateHub {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateHub")
            .field("target", &self.target)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl UpdateHub {
    pub fn new(target: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            target: target.into(),
            sender,
            subscribers: Mutex::new(0),
            gauge: None,
        }
    }

    pub fn with_gauge(mut self, gauge: IntGauge) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Broadcast to current subscribers, returning how many got it.
    pub fn publish(&self, event: HubEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        *self.subscribers.lock()
    }

    fn announce(&self, count: usize) {
        if let Some(gauge) = &self.gauge {
            gauge.set(count as i64);
        }
        self.publish(HubEvent::UserCount { count });
    }

    /// Join the hub. Everyone, the newcomer included, receives the new count.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = Uuid::new_v4();
        let receiver = {
            let mut count = self.subscribers.lock();
            let receiver = self.sender.subscribe();
            *count += 1;
            debug!(target: "agree_watch::hub", counter = %self.target, subscriber = %id, count = *count, "Subscriber joined");
            self.announce(*count);
            receiver
        };
        Subscription {
            id,
            hub: Arc::clone(self),
            receiver,
        }
    }
}

/// A live subscription; dropping it leaves the hub.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    hub: Arc<UpdateHub>,
    receiver: broadcast::Receiver<HubEvent>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the hub is gone.
    pub async fn next_event(&mut self) -> Option<HubEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(target: "agree_watch::hub", subscriber = %self.id, skipped, "Subscriber lagging");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static {
        stream::unfold(self, |mut subscription| async move {
            let event = subscription.next_event().await?;
            Some((Ok(event.to_sse()), subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut count = self.hub.subscribers.lock();
        *count = count.saturating_sub(1);
        debug!(target: "agree_watch::hub", counter = %self.hub.target, subscriber = %self.id, count = *count, "Subscriber left");
        self.hub.announce(*count);
    }
}

// ============================================================================
// SECTION 20: CHART RENDERING
// ============================================================================
// Line chart of a series drawn with embedded-graphics into an in-memory RGB
// canvas, then PNG-encoded. Rendered charts are cached per latest timestamp.
// ============================================================================

// ----------------------------------------------------------------------------
// 20.1 Canvas
// ----------------------------------------------------------------------------

/// RGB888 framebuffer implementing `DrawTarget`
#[derive(Debug, Clone)]
pub struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32, background: Rgb888) -> Self {
        let pixels = [background.r(), background.g(), background.b()].repeat((width * height) as usize);
        Self { width, height, pixels }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb888> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        Some(Rgb888::new(self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2]))
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, ChartError> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, self.width, self.height);
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().map_err(|e| ChartError::Encode(e.to_string()))?;
            writer
                .write_image_data(&self.pixels)
                .map_err(|e| ChartError::Encode(e.to_string()))?;
            writer.finish().map_err(|e| ChartError::Encode(e.to_string()))?;
        }
        Ok(out)
    }
}

impl OriginDimensions for Canvas {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for Canvas {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if point.x < 0 || point.y < 0 {
                continue;
            }
            let (x, y) = (point.x as u32, point.y as u32);
            if x >= self.width || y >= self.height {
                continue;
            }
            let idx = ((y * self.width + x) * 3) as usize;
            self.pixels[idx] = color.r();
            self.pixels[idx + 1] = color.g();
            self.pixels[idx + 2] = color.b();
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 20.2 Viewport
// ----------------------------------------------------------------------------

/// Maps observations into the plot rectangle
#[derive(Debug, Clone, Copy)]
struct Viewport {
    plot: Rectangle,
    origin: NaiveDateTime,
    span_secs: f64,
    y_min: f64,
    y_max: f64,
}

impl Viewport {
    /// Fit the series with a 5% vertical margin.
    fn fit(series: &Series, plot: Rectangle) -> Option<Self> {
        let first = series.first()?;
        let latest = series.latest()?;
        let (min, max) = series
            .iter()
            .fold((i64::MAX, i64::MIN), |(lo, hi), o| (lo.min(o.value), hi.max(o.value)));

        let (mut y_min, mut y_max) = (min as f64, max as f64);
        let margin = (y_max - y_min) * 0.05;
        if margin > 0.0 {
            y_min -= margin;
            y_max += margin;
        } else {
            y_min -= 1.0;
            y_max += 1.0;
        }

        Some(Self {
            plot,
            origin: first.timestamp,
            span_secs: (latest.timestamp - first.timestamp).num_seconds() as f64,
            y_min,
            y_max,
        })
    }

    fn x_at(&self, fraction: f64) -> i32 {
        let width = self.plot.size.width.saturating_sub(1) as f64;
        self.plot.top_left.x + (fraction * width).round() as i32
    }

    fn y_at(&self, fraction: f64) -> i32 {
        let height = self.plot.size.height.saturating_sub(1) as f64;
        self.plot.top_left.y + ((1.0 - fraction) * height).round() as i32
    }

    fn to_screen(&self, observation: &Observation) -> Point {
        let elapsed = (observation.timestamp - self.origin).num_seconds() as f64;
        let fx = if self.span_secs > 0.0 { elapsed / self.span_secs } else { 0.5 };
        let fy = (observation.value as f64 - self.y_min) / (self.y_max - self.y_min);
        Point::new(self.x_at(fx), self.y_at(fy))
    }

    fn time_at(&self, fraction: f64) -> NaiveDateTime {
        let offset = TimeDelta::try_seconds((self.span_secs * fraction).round() as i64).unwrap_or_else(TimeDelta::zero);
        self.origin.checked_add_signed(offset).unwrap_or(self.origin)
    }

    fn value_at(&self, fraction: f64) -> f64 {
        self.y_min + (self.y_max - self.y_min) * fraction
    }
}

/// `1234567` → `1,234,567`
pub fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// ----------------------------------------------------------------------------
// 20.3 Renderer
// ----------------------------------------------------------------------------

const PLOT_PAD_LEFT: i32 = 90;
const PLOT_PAD_RIGHT: i32 = 30;
const PLOT_PAD_TOP: i32 = 50;
const PLOT_PAD_BOTTOM: i32 = 60;

const COLOR_GRID: Rgb888 = Rgb888::new(220, 220, 220);
const COLOR_LINE: Rgb888 = Rgb888::new(31, 119, 180);

#[derive(Debug, Clone)]
pub struct ChartRenderer {
    title: String,
    width: u32,
    height: u32,
}

impl ChartRenderer {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            width: CHART_WIDTH,
            height: CHART_HEIGHT,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn render(&self, series: &Series) -> Result<Vec<u8>, ChartError> {
        let canvas = self.draw(series)?;
        canvas.encode_png()
    }

    pub fn draw(&self, series: &Series) -> Result<Canvas, ChartError> {
        let plot = Rectangle::new(
            Point::new(PLOT_PAD_LEFT, PLOT_PAD_TOP),
            Size::new(
                (self.width as i32 - PLOT_PAD_LEFT - PLOT_PAD_RIGHT).max(2) as u32,
                (self.height as i32 - PLOT_PAD_TOP - PLOT_PAD_BOTTOM).max(2) as u32,
            ),
        );
        let viewport = Viewport::fit(series, plot).ok_or(ChartError::EmptySeries)?;

        let mut canvas = Canvas::new(self.width, self.height, Rgb888::WHITE);
        let small = MonoTextStyle::new(&FONT_6X10, Rgb888::BLACK);
        let large = MonoTextStyle::new(&FONT_10X20, Rgb888::BLACK);
        let grid = PrimitiveStyle::with_stroke(COLOR_GRID, 1);

        let left = plot.top_left.x;
        let top = plot.top_left.y;
        let right = left + plot.size.width as i32 - 1;
        let bottom = top + plot.size.height as i32 - 1;

        // grid and tick labels
        for i in 0..=CHART_GRID_DIVISIONS {
            let fraction = f64::from(i) / f64::from(CHART_GRID_DIVISIONS);

            let y = viewport.y_at(fraction);
            Line::new(Point::new(left, y), Point::new(right, y)).into_styled(grid).draw(&mut canvas)?;
            let label = group_thousands(viewport.value_at(fraction).round() as i64);
            Text::with_alignment(&label, Point::new(left - 8, y + 3), small, Alignment::Right).draw(&mut canvas)?;

            let x = viewport.x_at(fraction);
            Line::new(Point::new(x, top), Point::new(x, bottom)).into_styled(grid).draw(&mut canvas)?;
            let label = viewport.time_at(fraction).format("%m-%d %H:%M").to_string();
            Text::with_alignment(&label, Point::new(x, bottom + 18), small, Alignment::Center).draw(&mut canvas)?;
        }

        plot.into_styled(PrimitiveStyle::with_stroke(Rgb888::BLACK, 1)).draw(&mut canvas)?;

        let points: Vec<Point> = series.iter().map(|o| viewport.to_screen(o)).collect();
        if points.len() > 1 {
            Polyline::new(&points)
                .into_styled(PrimitiveStyle::with_stroke(COLOR_LINE, 2))
                .draw(&mut canvas)?;
        }
        if points.len() <= CHART_MARKER_LIMIT {
            let marker = PrimitiveStyle::with_fill(COLOR_LINE);
            for point in &points {
                Circle::with_center(*point, 7).into_styled(marker).draw(&mut canvas)?;
            }
        }

        let center = self.width as i32 / 2;
        Text::with_alignment(&self.title, Point::new(center, 32), large, Alignment::Center).draw(&mut canvas)?;
        Text::with_alignment("Timestamp", Point::new(left + plot.size.width as i32 / 2, bottom + 45), small, Alignment::Center)
            .draw(&mut canvas)?;
        Text::with_alignment("Count", Point::new(8, top - 8), small, Alignment::Left).draw(&mut canvas)?;

        Ok(canvas)
    }
}

// ----------------------------------------------------------------------------
// 20.4 Chart Cache
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct RenderedChart {
    /// Held so the address cannot be reused while cached
    snapshot: Arc<Series>,
    png: Bytes,
}

/// Re-renders only when the cache hands out a new snapshot
#[derive(Debug)]
pub struct ChartCache {
    renderer: ChartRenderer,
    rendered: Mutex<Option<RenderedChart>>,
    renders: AtomicU64,
}

impl ChartCache {
    pub fn new(renderer: ChartRenderer) -> Self {
        Self {
            renderer,
            rendered: Mutex::new(None),
            renders: AtomicU64::new(0),
        }
    }

    pub fn render_count(&self) -> u64 {
        self.renders.load(AtomicOrdering::Relaxed)
    }

    /// Blocking; call from the blocking pool.
    pub fn get_or_render(&self, series: &Arc<Series>) -> Result<Bytes, ChartError> {
        if series.is_empty() {
            return Err(ChartError::EmptySeries);
        }

        // snapshots are immutable, so identity means identical content
        if let Some(chart) = self.rendered.lock().as_ref().filter(|c| Arc::ptr_eq(&c.snapshot, series)) {
            return Ok(chart.png.clone());
        }

        let png = Bytes::from(self.renderer.render(series)?);
        self.renders.fetch_add(1, AtomicOrdering::Relaxed);
        *self.rendered.lock() = Some(RenderedChart {
            snapshot: Arc::clone(series),
            png: png.clone(),
        });
        Ok(png)
    }
}

// ============================================================================
// SECTION 21: HTTP QUERY SURFACE
// ============================================================================
// axum routes over the per-target caches:
//   GET /api/{target}/raw          [[ts, value], ...]
//   GET /api/{target}/latest       [[ts, value]] or [["", 0]]
//   GET /api/{target}/initial      latest + times + values
//   GET /api/{target}/hourly       [{hour, joined}, ...]
//   GET /api/{target}/prediction   projection or reason
//   GET /api/{target}/chart.png    PNG line chart
//   GET /api/{target}/events       SSE: update, user_count
//   GET /api/plot-data             combined overview
//   GET /healthz, /metrics
// ============================================================================

// ----------------------------------------------------------------------------
// 21.1 API Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("overview is not configured")]
    OverviewDisabled,

    #[error("Error generating graph: {0}")]
    Chart(#[from] ChartError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::UnknownTarget(_) | ApiError::OverviewDisabled => StatusCode::NOT_FOUND,
            ApiError::Chart(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ----------------------------------------------------------------------------
// 21.2 Overview
// ----------------------------------------------------------------------------

/// `/api/plot-data` body cache, rebuilt by one request at a time
#[derive(Debug)]
pub struct OverviewState {
    realtime: Arc<TargetHandle>,
    hourly: Arc<TargetHandle>,
    timeout: Duration,
    cached: Mutex<Option<(Instant, Arc<JsonValue>)>>,
    refresh: TokioMutex<()>,
    builds: AtomicU64,
}

impl OverviewState {
    pub fn new(realtime: Arc<TargetHandle>, hourly: Arc<TargetHandle>, timeout: Duration) -> Self {
        Self {
            realtime,
            hourly,
            timeout,
            cached: Mutex::new(None),
            refresh: TokioMutex::new(()),
            builds: AtomicU64::new(0),
        }
    }

    pub fn build_count(&self) -> u64 {
        self.builds.load(AtomicOrdering::Relaxed)
    }

    fn fresh(&self) -> Option<Arc<JsonValue>> {
        self.cached
            .lock()
            .as_ref()
            .filter(|(built_at, _)| built_at.elapsed() < self.timeout)
            .map(|(_, body)| Arc::clone(body))
    }

    pub async fn body(&self) -> Arc<JsonValue> {
        if let Some(body) = self.fresh() {
            return body;
        }

        let _guard = self.refresh.lock().await;
        if let Some(body) = self.fresh() {
            return body;
        }

        let realtime = self.realtime.cache.series().await;
        let hourly = self.hourly.cache.series().await;
        let deltas = Aggregator::deltas(&hourly, self.hourly.bucket_size);

        let body = Arc::new(json!({
            "time": realtime.times(),
            "count": realtime.values(),
            "hour": deltas.iter().map(|d| format_timestamp(&d.hour)).collect::<Vec<_>>(),
            "joined": deltas.iter().map(|d| d.joined).collect::<Vec<_>>(),
        }));

        *self.cached.lock() = Some((Instant::now(), Arc::clone(&body)));
        self.builds.fetch_add(1, AtomicOrdering::Relaxed);
        body
    }
}

// ----------------------------------------------------------------------------
// 21.3 Application State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct AppInner {
    targets: HashMap<String, Arc<TargetHandle>>,
    overview: Option<OverviewState>,
    metrics: WatchMetrics,
    keep_alive: Duration,
    shutdown: CancellationToken,
    started_at: Instant,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

impl AppState {
    pub fn new(
        targets: Vec<Arc<TargetHandle>>,
        overview: Option<&OverviewConfig>,
        metrics: WatchMetrics,
        server: &ServerConfig,
        shutdown: CancellationToken,
    ) -> WatchResult<Self> {
        let targets: HashMap<String, Arc<TargetHandle>> =
            targets.into_iter().map(|t| (t.name().to_string(), t)).collect();

        let overview = match overview {
            Some(config) => {
                let lookup = |field: &str, name: &str| {
                    targets
                        .get(name)
                        .cloned()
                        .ok_or_else(|| ConfigError::invalid_value(field, format!("'{}' is not an enabled target", name)))
                };
                let realtime = lookup("overview.realtime", &config.realtime)?;
                let hourly = lookup("overview.hourly", &config.hourly)?;
                Some(OverviewState::new(realtime, hourly, config.cache_timeout))
            }
            None => None,
        };

        Ok(Self {
            inner: Arc::new(AppInner {
                targets,
                overview,
                metrics,
                keep_alive: server.keep_alive,
                shutdown,
                started_at: Instant::now(),
            }),
        })
    }

    pub fn target(&self, name: &str) -> Result<Arc<TargetHandle>, ApiError> {
        self.inner
            .targets
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::UnknownTarget(name.to_string()))
    }

    pub fn overview(&self) -> Option<&OverviewState> {
        self.inner.overview.as_ref()
    }
}

// ----------------------------------------------------------------------------
// 21.4 Router
// ----------------------------------------------------------------------------

pub fn router(state: AppState, cors_enabled: bool) -> Router {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .route("/api/plot-data", get(plot_data))
        .route("/api/:target/raw", get(raw_series))
        .route("/api/:target/latest", get(latest))
        .route("/api/:target/initial", get(initial_data))
        .route("/api/:target/hourly", get(hourly))
        .route("/api/:target/prediction", get(prediction))
        .route("/api/:target/chart.png", get(chart_png))
        .route("/api/:target/events", get(events))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

// ----------------------------------------------------------------------------
// 21.5 Handlers
// ----------------------------------------------------------------------------

async fn raw_series(State(state): State<AppState>, UrlPath(name): UrlPath<String>) -> Result<Json<Arc<Series>>, ApiError> {
    let handle = state.target(&name)?;
    Ok(Json(handle.cache.series().await))
}

async fn latest(State(state): State<AppState>, UrlPath(name): UrlPath<String>) -> Result<Json<JsonValue>, ApiError> {
    let handle = state.target(&name)?;
    let series = handle.cache.series().await;
    let body = match series.latest() {
        Some(observation) => json!([[observation.timestamp_string(), observation.value]]),
        None => json!([["", 0]]),
    };
    Ok(Json(body))
}

async fn initial_data(State(state): State<AppState>, UrlPath(name): UrlPath<String>) -> Result<Json<JsonValue>, ApiError> {
    let handle = state.target(&name)?;
    let series = handle.cache.series().await;
    let latest = series.latest();
    Ok(Json(json!({
        "latest_count": latest.map(|o| o.value).unwrap_or(0),
        "latest_timestamp": latest.map(Observation::timestamp_string),
        "chart_url": latest.map(|o| handle.chart_url(o)),
        "times": series.times(),
        "values": series.values(),
    })))
}

async fn hourly(State(state): State<AppState>, UrlPath(name): UrlPath<String>) -> Result<Json<Vec<BucketDelta>>, ApiError> {
    let handle = state.target(&name)?;
    let series = handle.cache.series().await;
    Ok(Json(Aggregator::deltas(&series, handle.bucket_size)))
}

async fn prediction(State(state): State<AppState>, UrlPath(name): UrlPath<String>) -> Result<Json<JsonValue>, ApiError> {
    let handle = state.target(&name)?;
    let Some(goal) = handle.config.goal else {
        return Ok(Json(json!({ "available": false, "reason": "no_goal" })));
    };

    let series = handle.cache.series().await;
    let body = match Predictor::predict(&series, goal) {
        Ok(projection) => json!({
            "available": true,
            "target_value": projection.target_value,
            "projected_timestamp": format_timestamp(&projection.projected_timestamp),
            "slope_per_hour": projection.slope_per_hour,
            "r_squared": projection.r_squared,
            "samples": projection.samples,
        }),
        Err(reason) => json!({
            "available": false,
            "target_value": goal,
            "reason": reason,
        }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct ChartQuery {
    /// Cache-busting token, ignored
    #[serde(default)]
    t: Option<String>,
}

async fn chart_png(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Query(query): Query<ChartQuery>,
) -> Result<Response, ApiError> {
    let handle = state.target(&name)?;
    trace!(target: "agree_watch::http", counter = %name, t = ?query.t, "Chart requested");

    let series = handle.cache.series().await;
    let png = task::spawn_blocking(move || handle.charts.get_or_render(&series))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok((
        [(header::CONTENT_TYPE, "image/png"), (header::CACHE_CONTROL, "no-cache")],
        png,
    )
        .into_response())
}

async fn events(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static>, ApiError> {
    let handle = state.target(&name)?;
    let subscription = handle.hub.subscribe();
    info!(target: "agree_watch::http", counter = %name, subscriber = %subscription.id(), "Event stream opened");

    // end the stream on shutdown so graceful shutdown can drain connections
    let shutdown = state.inner.shutdown.clone();
    let stream = subscription
        .into_stream()
        .take_until(async move { shutdown.cancelled().await });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.inner.keep_alive)))
}

async fn plot_data(State(state): State<AppState>) -> Result<Json<Arc<JsonValue>>, ApiError> {
    let overview = state.overview().ok_or(ApiError::OverviewDisabled)?;
    Ok(Json(overview.body().await))
}

async fn healthz(State(state): State<AppState>) -> Json<JsonValue> {
    let targets: BTreeMap<&str, JsonValue> = state
        .inner
        .targets
        .iter()
        .map(|(name, handle)| {
            let series = handle.cache.current();
            let latest = series.latest();
            (
                name.as_str(),
                json!({
                    "latest_count": latest.map(|o| o.value),
                    "latest_timestamp": latest.map(Observation::timestamp_string),
                    "records": series.len(),
                    "durable_pending": handle.cache.durable_pending(),
                    "subscribers": handle.hub.subscriber_count(),
                }),
            )
        })
        .collect();

    Json(json!({
        "status": "ok",
        "version": ENGINE_VERSION,
        "uptime_secs": state.inner.started_at.elapsed().as_secs(),
        "targets": targets,
    }))
}

async fn metrics_text(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = state
        .inner
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

// ============================================================================
// SECTION 22: ENGINE
// ============================================================================
// Wires targets, pollers and the HTTP surface together and owns shutdown.
// ============================================================================

#[derive(Debug)]
pub struct Engine {
    config: WatchConfig,
    metrics: WatchMetrics,
    clock: Arc<dyn WallClock>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: WatchConfig) -> WatchResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            metrics: WatchMetrics::new()?,
            clock: Arc::new(LocalClock),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "agree_watch::engine", "Shutdown requested");
        self.shutdown.cancel();
    }

    /// Open every enabled target and build its poller.
    pub fn build(&self) -> WatchResult<(AppState, Vec<Poller>)> {
        let mut handles = Vec::new();
        let mut pollers = Vec::new();

        for target in self.config.targets.iter().filter(|t| t.enabled) {
            let handle = Arc::new(TargetHandle::open(target, &self.config.server, &self.metrics)?);
            let source: Arc<dyn CounterSource> = Arc::new(HttpCounterSource::new(target)?);
            let fetcher = Fetcher::new(source, RetryPolicy::fixed(target.retry_delay)).with_metrics(handle.metrics.clone());
            pollers.push(Poller::new(Arc::clone(&handle), fetcher, Arc::clone(&self.clock)));
            handles.push(handle);
        }

        let state = AppState::new(
            handles,
            self.config.active_overview(),
            self.metrics.clone(),
            &self.config.server,
            self.shutdown.clone(),
        )?;
        Ok((state, pollers))
    }

    /// Run the engine
    pub async fn run(&self) -> WatchResult<()> {
        info!(target: "agree_watch::engine", version = ENGINE_VERSION, "Starting engine");

        let (state, pollers) = self.build()?;
        let address: SocketAddr = self
            .config
            .server
            .address
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::invalid_value("server.address", e.to_string()))?;
        let listener = tokio::net::TcpListener::bind(address).await?;

        // Setup signal handlers
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.cancel();
        });

        let mut tasks = JoinSet::new();
        for poller in pollers {
            tasks.spawn(poller.run(self.shutdown.clone()));
        }

        info!(
            target: "agree_watch::engine",
            address = %address,
            targets = tasks.len(),
            "Serving HTTP API"
        );

        let app = router(state, self.config.server.cors_enabled);
        let shutdown = self.shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        // Graceful shutdown
        self.shutdown.cancel();
        let shutdown_start = Instant::now();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(target: "agree_watch::engine", error = %e, "Poller task failed");
            }
        }
        info!(
            target: "agree_watch::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            "Engine shutdown complete"
        );

        served.map_err(WatchError::from)
    }
}

async fn wait_for_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(target: "agree_watch::engine", error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(target: "agree_watch::engine", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

// ============================================================================
// SECTION 23: PHASE 3 TESTS
// ============================================================================

//! Typed views over the merged configuration value.
//!
//! Key names follow the recognized configuration surface (uppercase, Spanish
//! where the operators' files use Spanish). Unknown keys are ignored —
//! layering tools add bookkeeping keys the engine doesn't read.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl AppConfig {
    pub fn from_value(v: &Value) -> Result<Self> {
        serde_json::from_value(v.clone()).context("config shape extraction failed")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(rename = "DEFAULT_TIMEZONE", default = "d_timezone")]
    pub default_timezone: String,
    #[serde(rename = "LOCK_PROVIDER", default)]
    pub lock_provider: LockProvider,
    /// Root for queue journals and crash-recovery markers.
    #[serde(rename = "STATE_DIR", default = "d_state_dir")]
    pub state_dir: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_timezone: d_timezone(),
            lock_provider: LockProvider::default(),
            state_dir: d_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockProvider {
    #[default]
    Redis,
    Mysql,
}

impl LockProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockProvider::Redis => "redis",
            LockProvider::Mysql => "mysql",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(rename = "TAECEL", default)]
    pub taecel: Option<TaecelConfig>,
    #[serde(rename = "MST", default)]
    pub mst: Option<MstConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaecelConfig {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "KEY")]
    pub key: String,
    #[serde(rename = "NIP")]
    pub nip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MstConfig {
    /// Endpoint URL the SOAP envelopes are POSTed to.
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "USUARIO")]
    pub usuario: String,
    #[serde(rename = "CLAVE")]
    pub clave: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    #[default]
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    #[default]
    Interval,
    Cron,
    FixedTimes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageEntry {
    #[serde(rename = "PSL")]
    pub psl: String,
    #[serde(rename = "DIAS")]
    pub days: i64,
    #[serde(rename = "IMPORTE")]
    pub amount: i64,
    #[serde(rename = "LABEL", default)]
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Recharge amount in whole pesos (non-VOZ; VOZ amounts come from the
    /// package catalog).
    #[serde(rename = "IMPORTE", default = "d_importe")]
    pub importe: i64,
    /// Days of validity granted per recharge (non-VOZ).
    #[serde(rename = "DIAS", default = "d_dias")]
    pub dias: i64,
    /// Provider product code, where the provider requires one.
    #[serde(rename = "CODIGO", default)]
    pub codigo: Option<String>,
    #[serde(rename = "DELAY_BETWEEN_CALLS", default = "d_delay_ms")]
    pub delay_between_calls_ms: u64,
    #[serde(rename = "RETRY_STRATEGY", default)]
    pub retry_strategy: RetryStrategy,
    #[serde(rename = "RETRY_BASE_DELAY", default = "d_retry_base_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(rename = "MAX_RETRIES", default = "d_max_retries")]
    pub max_retries: u32,
    #[serde(rename = "SCHEDULE_TYPE", default)]
    pub schedule_type: ScheduleType,
    #[serde(rename = "SCHEDULE_MINUTES", default = "d_schedule_minutes")]
    pub schedule_minutes: Option<u32>,
    /// `HH:MM` entries in the operator timezone.
    #[serde(rename = "SCHEDULE_HOURS", default)]
    pub schedule_hours: Vec<String>,
    #[serde(rename = "SCHEDULE_CRON", default)]
    pub schedule_cron: Option<String>,
    /// Upper window: devices idle longer than this many days are abandoned
    /// and excluded from the candidate set.
    #[serde(rename = "DIAS_SIN_REPORTAR_LIMITE", default = "d_days_limit")]
    pub dias_sin_reportar_limite: i64,
    /// Lower gate: devices idle at least this many minutes get dispatched.
    #[serde(
        rename = "MINUTOS_SIN_REPORTAR_PARA_RECARGA",
        default = "d_minutes_threshold"
    )]
    pub minutos_sin_reportar: f64,
    #[serde(rename = "MIN_BALANCE_THRESHOLD", default = "d_min_balance")]
    pub min_balance_threshold: f64,
    #[serde(rename = "LOCK_TIMEOUT", default = "d_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(rename = "WEBSERVICE_TIMEOUT", default = "d_ws_timeout_ms")]
    pub webservice_timeout_ms: u64,
    #[serde(rename = "PAQUETES", default)]
    pub paquetes: BTreeMap<String, PackageEntry>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default()))
            .expect("defaults must deserialize")
    }
}

fn d_importe() -> i64 {
    10
}
fn d_schedule_minutes() -> Option<u32> {
    Some(10)
}
fn d_dias() -> i64 {
    8
}
fn d_delay_ms() -> u64 {
    500
}
fn d_retry_base_ms() -> u64 {
    1_000
}
fn d_max_retries() -> u32 {
    3
}
fn d_days_limit() -> i64 {
    14
}
fn d_minutes_threshold() -> f64 {
    10.0
}
fn d_min_balance() -> f64 {
    100.0
}
fn d_lock_timeout_secs() -> u64 {
    600
}
fn d_ws_timeout_ms() -> u64 {
    30_000
}
fn d_timezone() -> String {
    "America/Mazatlan".to_string()
}
fn d_state_dir() -> String {
    "./state".to_string()
}

//! Layered YAML configuration.
//!
//! Files are merged in order (later overrides earlier via deep-merge), then
//! canonicalized and hashed so the startup log can pin exactly which
//! configuration a process ran with. The merged value is extracted into typed
//! per-service views and validated as a whole; a single invalid key anywhere
//! fails startup with the full violation list (`ConfigError::Invalid`).

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::str::FromStr;

use rcg_schemas::{PackageDef, ServiceType};

mod typed;

pub use typed::{
    AppConfig, GlobalConfig, LockProvider, MstConfig, ProvidersConfig, RetryStrategy,
    ScheduleType, ServiceConfig, TaecelConfig,
};

/// Configuration rejected at startup. The CLI maps this to exit code 2.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration:\n{}", violations.join("\n"))]
    Invalid { violations: Vec<String> },
}

/// Load the layer files in order and fold them into one value. Later layers
/// win: objects merge key-by-key, anything else is replaced wholesale.
pub fn load_layers(paths: &[&str]) -> Result<LoadedConfig> {
    let merged = paths.iter().try_fold(Value::Object(Default::default()), |acc, path| {
        let raw = fs::read_to_string(path).with_context(|| format!("read config: {path}"))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&raw).with_context(|| format!("parse yaml: {path}"))?;
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("yaml->json conversion failed: {path}"))?;
        Ok::<_, anyhow::Error>(merge_layer(acc, layer))
    })?;

    let canonical_json = to_canonical_string(&merged);

    Ok(LoadedConfig {
        config_hash: hex::encode(Sha256::digest(canonical_json.as_bytes())),
        config_json: serde_json::from_str(&canonical_json)
            .context("canonical json parse failed")?,
        canonical_json,
    })
}

/// Load, extract, and validate in one step — the path the binary takes.
pub fn load_app_config(paths: &[&str]) -> Result<(AppConfig, LoadedConfig)> {
    let loaded = load_layers(paths)?;
    let app = AppConfig::from_value(&loaded.config_json)?;
    app.validate()?;
    Ok((app, loaded))
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Overlay one layer onto the accumulated value. Consumes both sides, so the
/// recursion moves entries instead of cloning them.
fn merge_layer(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut below), Value::Object(above)) => {
            for (key, value) in above {
                let merged = match below.remove(&key) {
                    Some(existing) => merge_layer(existing, value),
                    None => value,
                };
                below.insert(key, merged);
            }
            Value::Object(below)
        }
        // Mismatched shapes, arrays, scalars: the layer on top replaces.
        (_, replacement) => replacement,
    }
}

/// Compact JSON with every object's keys in lexicographic order, so the same
/// logical config always hashes identically regardless of file key order.
fn to_canonical_string(v: &Value) -> String {
    serde_json::to_string(&reorder(v)).expect("json serialization must not fail")
}

/// Rebuild each object through a `BTreeMap`, which sorts the keys; the
/// reconstructed `serde_json::Map` then serializes in that sorted order.
fn reorder(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, child)| (k, reorder(child))).collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, child)| (k.clone(), child))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(reorder).collect()),
        leaf => leaf.clone(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Cross-field validation. Every violation is reported, not just the
    /// first, so an operator fixes the file in one pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if chrono_tz::Tz::from_str(&self.global.default_timezone).is_err() {
            violations.push(format!(
                "global.DEFAULT_TIMEZONE: unknown timezone '{}'",
                self.global.default_timezone
            ));
        }

        for (name, svc) in &self.services {
            let svc_tag = match ServiceType::parse(name) {
                Ok(t) => t,
                Err(_) => {
                    violations.push(format!("services.{name}: unknown service type"));
                    continue;
                }
            };

            let key = |field: &str| format!("services.{name}.{field}");

            if svc.importe <= 0 {
                violations.push(format!("{}: must be > 0", key("IMPORTE")));
            }
            if svc.dias <= 0 {
                violations.push(format!("{}: must be > 0", key("DIAS")));
            }
            if svc.max_retries == 0 {
                violations.push(format!("{}: must be >= 1", key("MAX_RETRIES")));
            }
            if svc.min_balance_threshold < 0.0 {
                violations.push(format!("{}: must be >= 0", key("MIN_BALANCE_THRESHOLD")));
            }
            if svc.lock_timeout_secs == 0 {
                violations.push(format!("{}: must be > 0", key("LOCK_TIMEOUT")));
            }
            if svc.webservice_timeout_ms == 0 {
                violations.push(format!("{}: must be > 0", key("WEBSERVICE_TIMEOUT")));
            }
            if svc.dias_sin_reportar_limite <= 0 {
                violations.push(format!("{}: must be > 0", key("DIAS_SIN_REPORTAR_LIMITE")));
            }
            if svc.minutos_sin_reportar < 0.0 {
                violations.push(format!(
                    "{}: must be >= 0",
                    key("MINUTOS_SIN_REPORTAR_PARA_RECARGA")
                ));
            }

            match svc.schedule_type {
                ScheduleType::Interval => match svc.schedule_minutes {
                    Some(m) if m > 0 => {}
                    _ => violations.push(format!(
                        "{}: SCHEDULE_TYPE=interval requires SCHEDULE_MINUTES > 0",
                        key("SCHEDULE_MINUTES")
                    )),
                },
                ScheduleType::FixedTimes => {
                    if svc.schedule_hours.is_empty() {
                        violations.push(format!(
                            "{}: SCHEDULE_TYPE=fixed_times requires a non-empty SCHEDULE_HOURS",
                            key("SCHEDULE_HOURS")
                        ));
                    }
                    for h in &svc.schedule_hours {
                        if parse_hh_mm(h).is_none() {
                            violations
                                .push(format!("{}: '{h}' is not HH:MM", key("SCHEDULE_HOURS")));
                        }
                    }
                }
                ScheduleType::Cron => match &svc.schedule_cron {
                    Some(expr) => {
                        if cron::Schedule::from_str(expr).is_err() {
                            violations.push(format!(
                                "{}: cron expression '{expr}' failed to parse",
                                key("SCHEDULE_CRON")
                            ));
                        }
                    }
                    None => violations.push(format!(
                        "{}: SCHEDULE_TYPE=cron requires SCHEDULE_CRON",
                        key("SCHEDULE_CRON")
                    )),
                },
            }

            if svc_tag == ServiceType::Voz {
                if svc.paquetes.is_empty() {
                    violations.push(format!("{}: VOZ requires a package catalog", key("PAQUETES")));
                }
                for (code, p) in &svc.paquetes {
                    if p.days <= 0 || p.amount <= 0 {
                        violations.push(format!(
                            "{}.{code}: DIAS and IMPORTE must be > 0",
                            key("PAQUETES")
                        ));
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { violations })
        }
    }

    /// Typed view of one service's config, `None` if the service is absent
    /// from the file (that service simply isn't scheduled).
    pub fn service(&self, svc: ServiceType) -> Option<&ServiceConfig> {
        self.services.get(svc.as_str())
    }

    /// VOZ package catalog converted to the shared schema type.
    pub fn package_catalog(&self) -> BTreeMap<String, PackageDef> {
        self.service(ServiceType::Voz)
            .map(|s| {
                s.paquetes
                    .iter()
                    .map(|(code, p)| {
                        (
                            code.clone(),
                            PackageDef {
                                psl: p.psl.clone(),
                                days: p.days,
                                amount: p.amount,
                                label: p.label.clone(),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// `"HH:MM"` → (hour, minute).
pub fn parse_hh_mm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h < 24 && m < 60 {
        Some((h, m))
    } else {
        None
    }
}

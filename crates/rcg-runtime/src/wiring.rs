//! Config → runtime value conversions.

use std::time::Duration;

use anyhow::Result;

use rcg_config::{parse_hh_mm, AppConfig, RetryStrategy, ScheduleType, ServiceConfig};
use rcg_pipeline::ServiceStrategy;
use rcg_providers::retry::{RetryPolicy, Strategy};
use rcg_sched::Trigger;
use rcg_schemas::ServiceType;

pub fn retry_policy_from_config(cfg: &ServiceConfig) -> RetryPolicy {
    RetryPolicy {
        strategy: match cfg.retry_strategy {
            RetryStrategy::Linear => Strategy::Linear,
            RetryStrategy::Exponential => Strategy::Exponential,
        },
        base_delay_ms: cfg.retry_base_delay_ms,
        max_retries: cfg.max_retries,
    }
}

pub fn strategy_from_config(
    service: ServiceType,
    cfg: &ServiceConfig,
    app: &AppConfig,
) -> ServiceStrategy {
    ServiceStrategy {
        service,
        importe: cfg.importe,
        dias: cfg.dias,
        codigo: cfg.codigo.clone(),
        packages: if service == ServiceType::Voz {
            app.package_catalog()
        } else {
            Default::default()
        },
        delay_between_calls: Duration::from_millis(cfg.delay_between_calls_ms),
        retry: retry_policy_from_config(cfg),
        min_balance_threshold: cfg.min_balance_threshold,
        lock_timeout_secs: cfg.lock_timeout_secs,
        days_limit: cfg.dias_sin_reportar_limite,
        minutes_threshold: cfg.minutos_sin_reportar,
    }
}

/// Validated config guarantees the fields this reads; failures here mean the
/// validation and the wiring disagree, which is a bug worth surfacing.
pub fn trigger_from_config(cfg: &ServiceConfig) -> Result<Trigger> {
    match cfg.schedule_type {
        ScheduleType::Interval => Trigger::interval(cfg.schedule_minutes.unwrap_or(10)),
        ScheduleType::FixedTimes => {
            let times: Vec<(u32, u32)> = cfg
                .schedule_hours
                .iter()
                .filter_map(|h| parse_hh_mm(h))
                .collect();
            Trigger::fixed_times(times)
        }
        ScheduleType::Cron => Trigger::cron(cfg.schedule_cron.as_deref().unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_service_config_yields_interval_trigger() {
        let cfg = ServiceConfig::default();
        let trigger = trigger_from_config(&cfg).unwrap();
        assert!(matches!(trigger, Trigger::Interval { minutes: 10 }));
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let mut cfg = ServiceConfig::default();
        cfg.retry_strategy = RetryStrategy::Exponential;
        cfg.retry_base_delay_ms = 250;
        cfg.max_retries = 5;
        let p = retry_policy_from_config(&cfg);
        assert_eq!(p.base_delay_ms, 250);
        assert_eq!(p.max_retries, 5);
        assert!(matches!(p.strategy, Strategy::Exponential));
    }
}

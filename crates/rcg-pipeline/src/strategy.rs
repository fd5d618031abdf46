//! Per-service strategy.
//!
//! The runner is one template; everything service-specific (amounts, days of
//! validity, product codes, the VOZ package catalog, thresholds, pacing)
//! lives in this value, built once at startup from configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use rcg_clock::OperatorClock;
use rcg_providers::retry::RetryPolicy;
use rcg_schemas::{Candidate, PackageDef, ServiceType};

#[derive(Debug, Clone)]
pub struct ServiceStrategy {
    pub service: ServiceType,
    /// Whole pesos per recharge (non-VOZ).
    pub importe: i64,
    /// Days of validity granted (non-VOZ).
    pub dias: i64,
    /// Provider product code (non-VOZ).
    pub codigo: Option<String>,
    /// VOZ catalog: codigo_paquete → package.
    pub packages: BTreeMap<String, PackageDef>,
    pub delay_between_calls: Duration,
    pub retry: RetryPolicy,
    pub min_balance_threshold: f64,
    pub lock_timeout_secs: u64,
    pub days_limit: i64,
    pub minutes_threshold: f64,
}

/// What one candidate's webservice call should charge.
#[derive(Debug, Clone)]
pub struct ChargePlan {
    pub amount: i64,
    pub days: i64,
    pub codigo: Option<String>,
    pub package: bool,
    /// VOZ only: the catalog entry backing this plan.
    pub package_code: Option<String>,
    pub psl: Option<String>,
}

impl ServiceStrategy {
    /// Resolve the charge for one candidate. `None` means this candidate
    /// must be skipped and counted as failed; the only case is a VOZ
    /// subscriber referencing a package code absent from the catalog.
    /// Legacy codes are never defaulted: defaulting would charge the wrong
    /// amount.
    pub fn resolve_charge(&self, candidate: &Candidate) -> Option<ChargePlan> {
        if self.service != ServiceType::Voz {
            return Some(ChargePlan {
                amount: self.importe,
                days: self.dias,
                codigo: self.codigo.clone(),
                package: false,
                package_code: None,
                psl: None,
            });
        }

        let code = candidate.codigo_paquete.as_deref()?;
        let def = self.packages.get(code)?;
        Some(ChargePlan {
            amount: def.amount,
            days: def.days,
            codigo: Some(def.psl.clone()),
            package: true,
            package_code: Some(code.to_string()),
            psl: Some(def.psl.clone()),
        })
    }

    /// New expiry after a successful insert. GPS/ELIOT advance an exact
    /// number of days past the end of today; VOZ lands on the end of the
    /// civil date `days` ahead.
    pub fn new_expiry_unix(&self, clock: &OperatorClock, days: i64) -> i64 {
        match self.service {
            ServiceType::Voz => clock.end_of_day_in_days_unix(days),
            ServiceType::Gps | ServiceType::Eliot => clock.end_of_today_plus_days_unix(days),
        }
    }

    pub fn lock_key(&self) -> String {
        format!("recargas:{}", self.service.as_str())
    }
}

//! Two-level time gate.
//!
//! The eligibility SQL already applied the inclusion rules (active, expiry
//! within the window, not recharged today, idle within the day limit). This
//! pass decides who actually gets dispatched:
//!
//! - GPS/ELIOT: only devices idle at least the minute threshold. A device
//!   that would be charged by expiry but is still reporting is the "ahorro"
//!   — money intentionally not spent.
//! - VOZ: no telemetry concept; every remaining candidate is dispatched.
//!
//! The day-limit and the minute-threshold are different units on purpose;
//! they must never be compared against each other.

use rcg_schemas::{Candidate, ServiceType};

#[derive(Debug, Clone, Copy)]
pub struct FilterParams {
    /// Days: candidates idle beyond this are abandoned entirely.
    pub days_limit: i64,
    /// Minutes: dispatch gate for telemetry services.
    pub minutes_threshold: f64,
    pub end_of_today_unix: i64,
}

#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub to_recharge: Vec<Candidate>,
    /// Expiring today but still reporting — deliberately not charged.
    pub savings: Vec<Candidate>,
    /// Still reporting with expiry beyond today.
    pub reporting_on_time: usize,
    /// Idle beyond the day limit; dropped from every set.
    pub abandoned: usize,
}

pub fn classify(
    service: ServiceType,
    candidates: Vec<Candidate>,
    params: &FilterParams,
) -> FilterOutcome {
    let mut out = FilterOutcome::default();

    if !service.has_telemetry() {
        out.to_recharge = candidates;
        return out;
    }

    let limit_minutes = params.days_limit as f64 * 1_440.0;
    for c in candidates {
        if c.idle_minutes > limit_minutes {
            out.abandoned += 1;
            continue;
        }
        if c.idle_minutes >= params.minutes_threshold {
            out.to_recharge.push(c);
        } else if c.unix_saldo <= params.end_of_today_unix {
            out.savings.push(c);
        } else {
            out.reporting_on_time += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(sim: &str, idle_minutes: f64, unix_saldo: i64) -> Candidate {
        Candidate {
            sim: sim.into(),
            descripcion: format!("UNIT {sim}"),
            empresa: "ACME".into(),
            dispositivo: format!("dev-{sim}"),
            unix_saldo,
            idle_minutes,
            codigo_paquete: None,
        }
    }

    const EOD: i64 = 1_768_546_799;

    fn params() -> FilterParams {
        FilterParams {
            days_limit: 14,
            minutes_threshold: 10.0,
            end_of_today_unix: EOD,
        }
    }

    #[test]
    fn idle_devices_are_dispatched() {
        let out = classify(
            ServiceType::Gps,
            vec![candidate("1", 15.0, EOD - 100)],
            &params(),
        );
        assert_eq!(out.to_recharge.len(), 1);
        assert!(out.savings.is_empty());
    }

    #[test]
    fn reporting_device_expiring_today_is_savings() {
        let out = classify(
            ServiceType::Gps,
            vec![candidate("1", 5.0, EOD - 100)],
            &params(),
        );
        assert!(out.to_recharge.is_empty());
        assert_eq!(out.savings.len(), 1);
        assert_eq!(out.reporting_on_time, 0);
    }

    #[test]
    fn reporting_device_expiring_tomorrow_counts_on_time() {
        let out = classify(
            ServiceType::Gps,
            vec![candidate("1", 5.0, EOD + 3_600)],
            &params(),
        );
        assert!(out.to_recharge.is_empty());
        assert!(out.savings.is_empty());
        assert_eq!(out.reporting_on_time, 1);
    }

    #[test]
    fn beyond_day_limit_is_abandoned() {
        let out = classify(
            ServiceType::Gps,
            // 15 days idle > 14-day limit.
            vec![candidate("1", 15.0 * 1_440.0, EOD - 100)],
            &params(),
        );
        assert!(out.to_recharge.is_empty());
        assert_eq!(out.abandoned, 1);
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let out = classify(
            ServiceType::Gps,
            vec![candidate("1", 10.0, EOD - 100)],
            &params(),
        );
        assert_eq!(out.to_recharge.len(), 1);
    }

    #[test]
    fn voz_dispatches_everything() {
        let out = classify(
            ServiceType::Voz,
            vec![candidate("1", 0.0, EOD - 100), candidate("2", 0.0, EOD)],
            &params(),
        );
        assert_eq!(out.to_recharge.len(), 2);
        assert_eq!(out.reporting_on_time, 0);
    }

    #[test]
    fn sets_are_disjoint_and_cover_input() {
        let input = vec![
            candidate("1", 20.0, EOD - 100),       // to_recharge
            candidate("2", 2.0, EOD - 100),        // savings
            candidate("3", 2.0, EOD + 100),        // reporting on time
            candidate("4", 30.0 * 1_440.0, EOD),   // abandoned
        ];
        let out = classify(ServiceType::Eliot, input, &params());
        assert_eq!(
            out.to_recharge.len() + out.savings.len() + out.reporting_on_time + out.abandoned,
            4
        );
        assert_eq!(out.to_recharge[0].sim, "1");
        assert_eq!(out.savings[0].sim, "2");
    }
}

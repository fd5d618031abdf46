//! Tick scheduling.
//!
//! Every trigger is evaluated in the operator timezone. Three flavors:
//!
//! - `interval`: every N minutes aligned to the wall clock (minute 0, N,
//!   2N, … of each hour), the way the original cadence was defined —
//!   not "N minutes after whenever the process started".
//! - `fixed_times`: a list of HH:MM wall times per day.
//! - `cron`: full cron expressions for operators who need them.
//!
//! A new tick that would overlap a still-running one is suppressed by the
//! caller's try-lock; the distributed lock remains the ultimate guard. The
//! scheduler itself only decides *when*, never *whether*.

use std::future::Future;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Days, LocalResult, NaiveDate, TimeZone, Timelike};
use chrono_tz::Tz;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use rcg_clock::OperatorClock;
use rcg_schemas::ServiceType;

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Trigger {
    Interval { minutes: u32 },
    FixedTimes { times: Vec<(u32, u32)> },
    Cron { schedule: cron::Schedule, expr: String },
}

impl Trigger {
    pub fn interval(minutes: u32) -> Result<Self> {
        if minutes == 0 || minutes > 24 * 60 {
            return Err(anyhow!("interval minutes out of range: {minutes}"));
        }
        Ok(Trigger::Interval { minutes })
    }

    pub fn fixed_times(times: Vec<(u32, u32)>) -> Result<Self> {
        if times.is_empty() {
            return Err(anyhow!("fixed_times requires at least one HH:MM"));
        }
        Ok(Trigger::FixedTimes { times })
    }

    pub fn cron(expr: &str) -> Result<Self> {
        let schedule: cron::Schedule = expr
            .parse()
            .with_context(|| format!("cron expression '{expr}' failed to parse"))?;
        Ok(Trigger::Cron {
            schedule,
            expr: expr.to_string(),
        })
    }

    /// Next fire strictly after `now`.
    pub fn next_fire(&self, now: DateTime<Tz>) -> Option<DateTime<Tz>> {
        match self {
            Trigger::Interval { minutes } => {
                let m = *minutes;
                let msm = now.hour() * 60 + now.minute();
                let next_slot = (msm / m + 1) * m;
                let tz = now.timezone();
                if next_slot >= 24 * 60 {
                    let tomorrow = now.date_naive().checked_add_days(Days::new(1))?;
                    Some(local_at(tz, tomorrow, 0, 0))
                } else {
                    Some(local_at(tz, now.date_naive(), next_slot / 60, next_slot % 60))
                }
            }
            Trigger::FixedTimes { times } => {
                let tz = now.timezone();
                let mut best: Option<DateTime<Tz>> = None;
                for &(h, m) in times {
                    let today = local_at(tz, now.date_naive(), h, m);
                    let candidate = if today > now {
                        today
                    } else {
                        let tomorrow = now.date_naive().checked_add_days(Days::new(1))?;
                        local_at(tz, tomorrow, h, m)
                    };
                    best = Some(match best {
                        Some(b) if b <= candidate => b,
                        _ => candidate,
                    });
                }
                best
            }
            Trigger::Cron { schedule, .. } => schedule.after(&now).next(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Trigger::Interval { minutes } => format!("every {minutes} min (wall-aligned)"),
            Trigger::FixedTimes { times } => {
                let list: Vec<String> =
                    times.iter().map(|(h, m)| format!("{h:02}:{m:02}")).collect();
                format!("daily at {}", list.join(", "))
            }
            Trigger::Cron { expr, .. } => format!("cron '{expr}'"),
        }
    }
}

/// Wall time on a civil date, resolved in the timezone. Ambiguity picks the
/// earlier instant; a DST gap skips forward an hour.
fn local_at(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> DateTime<Tz> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .expect("validated wall time");
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earlier, _) => earlier,
        LocalResult::None => {
            let shifted = naive + chrono::Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) => dt,
                LocalResult::Ambiguous(earlier, _) => earlier,
                LocalResult::None => naive.and_utc().with_timezone(&tz),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Spawns one timer task per registered service. The `tick` callback is
/// responsible for in-process overlap suppression (try-lock the service's
/// queue) and for the distributed lock.
pub struct Scheduler {
    clock: OperatorClock,
    shutdown: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
    descriptions: Vec<(ServiceType, String)>,
}

impl Scheduler {
    pub fn new(clock: OperatorClock, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            clock,
            shutdown,
            handles: Vec::new(),
            descriptions: Vec::new(),
        }
    }

    pub fn register<F, Fut>(&mut self, service: ServiceType, trigger: Trigger, tick: F)
    where
        F: Fn(ServiceType) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        info!(%service, schedule = %trigger.describe(), "schedule registered");
        self.descriptions.push((service, trigger.describe()));

        let clock = self.clock.clone();
        let mut shutdown = self.shutdown.clone();

        self.handles.push(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let now = clock.now();
                let Some(next) = trigger.next_fire(now) else {
                    warn!(%service, "trigger produced no next fire; schedule stops");
                    break;
                };
                let wait = (next - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(0));

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        tick(service).await;
                    }
                    _ = shutdown.changed() => {
                        break;
                    }
                }
            }
            info!(%service, "schedule stopped");
        }));
    }

    pub fn descriptions(&self) -> &[(ServiceType, String)] {
        &self.descriptions
    }

    /// Wait for every schedule task to wind down (after the shutdown signal
    /// flips). In-flight ticks finish their cancellation path first.
    pub async fn join(self) {
        for h in self.handles {
            let _ = h.await;
        }
    }
}

//! Cron-driven job scheduler.
//!
//! Polls once a minute, fires jobs whose schedule matched inside the window,
//! and detects sleep/wake time jumps so a laptop-hosted deployment still
//! runs jobs it slept through; the scan gets a 2 h grace period, the weekly
//! audit 24 h.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::mpsc;

use crate::config::{ConfigError, SCAN_SCHEDULE, WEEKLY_SCHEDULE};

/// Grace period for a missed scan (2 hours).
const MISSED_JOB_GRACE_SECS: i64 = 7200;

/// Extended grace for the weekly job (24 hours).
const MISSED_WEEKLY_GRACE_SECS: i64 = 86400;

/// Time jump treated as a sleep/wake boundary (5 minutes).
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Scheduler poll interval.
const POLL_INTERVAL_SECS: u64 = 60;

/// Fire window around a scheduled minute.
const FIRE_WINDOW_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobId {
    Scan,
    Weekly,
}

impl JobId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Weekly => "weekly",
        }
    }

    fn cron(&self) -> &'static str {
        match self {
            Self::Scan => SCAN_SCHEDULE,
            Self::Weekly => WEEKLY_SCHEDULE,
        }
    }

    fn grace_secs(&self) -> i64 {
        match self {
            Self::Scan => MISSED_JOB_GRACE_SECS,
            Self::Weekly => MISSED_WEEKLY_GRACE_SECS,
        }
    }
}

/// Why a job fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTrigger {
    Scheduled,
    Missed,
    Manual,
}

/// Message sent to the executor task.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job: JobId,
    pub trigger: JobTrigger,
}

pub struct Scheduler {
    sender: mpsc::Sender<JobRequest>,
    last_runs: Mutex<HashMap<JobId, DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(sender: mpsc::Sender<JobRequest>) -> Self {
        Self {
            sender,
            last_runs: Mutex::new(HashMap::new()),
        }
    }

    /// Run the poll loop indefinitely.
    pub async fn run(&self) {
        let mut last_check = Utc::now();

        loop {
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
            let now = Utc::now();

            let time_jump = (now - last_check).num_seconds();
            if time_jump > TIME_JUMP_THRESHOLD_SECS {
                log::info!(
                    "Detected system wake (time jumped {} s), checking for missed jobs",
                    time_jump
                );
                self.check_missed_jobs(now).await;
            }

            self.check_due_jobs(now).await;
            last_check = now;
        }
    }

    async fn check_due_jobs(&self, now: DateTime<Utc>) {
        for job in [JobId::Scan, JobId::Weekly] {
            match self.is_due(job, now) {
                Ok(true) => self.dispatch(job, JobTrigger::Scheduled, now).await,
                Ok(false) => {}
                Err(e) => log::error!("Schedule check for {} failed: {}", job.name(), e),
            }
        }
    }

    fn is_due(&self, job: JobId, now: DateTime<Utc>) -> Result<bool, ConfigError> {
        let schedule = parse_cron(job.cron())?;
        let now_utc = now.with_timezone(&chrono_tz::UTC);

        let mut upcoming = schedule.after(&(now_utc - chrono::Duration::minutes(2)));
        if let Some(next) = upcoming.next() {
            let next_utc = next.with_timezone(&Utc);
            if (now - next_utc).num_seconds().abs() < FIRE_WINDOW_SECS {
                if let Some(last) = self.last_run(job) {
                    if (last - next_utc).num_seconds().abs() < 60 {
                        return Ok(false); // Already fired this slot.
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn check_missed_jobs(&self, now: DateTime<Utc>) {
        for job in [JobId::Scan, JobId::Weekly] {
            match self.find_missed(job, now) {
                Ok(Some(missed_at)) => {
                    log::info!(
                        "Found missed '{}' job (was due {}), running now",
                        job.name(),
                        missed_at
                    );
                    self.dispatch(job, JobTrigger::Missed, now).await;
                }
                Ok(None) => {}
                Err(e) => log::error!("Missed-job check for {} failed: {}", job.name(), e),
            }
        }
    }

    fn find_missed(
        &self,
        job: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ConfigError> {
        let schedule = parse_cron(job.cron())?;
        let grace_start =
            (now - chrono::Duration::seconds(job.grace_secs())).with_timezone(&chrono_tz::UTC);
        let last = self.last_run(job);

        for scheduled in schedule.after(&grace_start) {
            let scheduled_utc = scheduled.with_timezone(&Utc);
            if scheduled_utc > now {
                break;
            }
            if let Some(last_run) = last {
                if last_run >= scheduled_utc {
                    continue;
                }
            }
            return Ok(Some(scheduled_utc));
        }
        Ok(None)
    }

    async fn dispatch(&self, job: JobId, trigger: JobTrigger, now: DateTime<Utc>) {
        if let Ok(mut last_runs) = self.last_runs.lock() {
            last_runs.insert(job, now);
        }
        if self.sender.send(JobRequest { job, trigger }).await.is_err() {
            log::error!("Failed to dispatch {} job, executor channel closed", job.name());
        }
    }

    fn last_run(&self, job: JobId) -> Option<DateTime<Utc>> {
        self.last_runs.lock().ok()?.get(&job).copied()
    }
}

/// Parse a 5-field cron expression using the standard day-of-week dialect
/// (0 or 7 = Sunday, ..., 6 = Saturday). The `cron` crate wants a seconds
/// field (prepended here) and numbers Sunday..Saturday as 1..7 instead, so
/// numeric day-of-week tokens in the last field are shifted to match.
pub fn parse_cron(expr: &str) -> Result<Schedule, ConfigError> {
    let full_expr = format!("0 {}", translate_dow_field(expr));
    full_expr.parse::<Schedule>().map_err(|e| ConfigError::InvalidVar {
        var: "schedule",
        reason: format!("invalid cron expression '{}': {}", expr, e),
    })
}

/// Shift numeric day-of-week tokens in the last field of a 5-field cron
/// expression from the standard dialect (0/7 = Sunday) to the `cron` crate's
/// dialect (1 = Sunday .. 7 = Saturday). Non-numeric tokens (names, `*`,
/// `?`, ranges' non-numeric parts) are left untouched.
fn translate_dow_field(expr: &str) -> String {
    let mut fields: Vec<&str> = expr.split_whitespace().collect();
    let Some(dow) = fields.pop() else {
        return expr.to_string();
    };

    let shift_token = |token: &str| -> String {
        if let Ok(n) = token.parse::<u32>() {
            return (n % 7 + 1).to_string();
        }
        if let Some((start, end)) = token.split_once('-') {
            if let (Ok(s), Ok(e)) = (start.parse::<u32>(), end.parse::<u32>()) {
                return format!("{}-{}", s % 7 + 1, e % 7 + 1);
            }
        }
        token.to_string()
    };

    let translated = dow.split(',').map(shift_token).collect::<Vec<_>>().join(",");
    fields.push(&translated);
    fields.join(" ")
}

/// Next fire time for a job, for startup logging.
pub fn next_run_time(job: JobId) -> Result<DateTime<Utc>, ConfigError> {
    let schedule = parse_cron(job.cron())?;
    let tz: Tz = chrono_tz::UTC;
    schedule
        .upcoming(tz)
        .next()
        .map(|next| next.with_timezone(&Utc))
        .ok_or(ConfigError::InvalidVar {
            var: "schedule",
            reason: "no upcoming scheduled time".to_string(),
        })
}

//! Cron-driven trigger for the batch scanner
//!
//! Expressions use five fields (`min hour dom month dow`) or six, where the sixth is
//! seconds (`min hour dom month dow sec`). Day-of-week numbers follow crontab: `0` and
//! `7` are Sunday, `1-5` is Monday to Friday. Times are evaluated in local time.
//!
//! # Example
//!
//! ```no_run
//! # async fn example(ctx: music_dl::AppContext) -> music_dl::Result<()> {
//! // Every weeknight at 03:30, ten tracks per batch
//! ctx.scheduler.set_cron("30 3 * * 1-5", 10).await?;
//! println!("next scan at {:?}", ctx.scheduler.next_run_time().await);
//! # Ok(())
//! # }
//! ```

use crate::config::ScheduleConfig;
use crate::error::{Error, Result};
use crate::process::DownloadProcess;
use chrono::{DateTime, Local};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Parse a 5- or 6-field cron expression
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, dom, month, dow] => {
            format!("0 {} {} {} {} {}", minute, hour, dom, month, weekday_names(dow)?)
        }
        [minute, hour, dom, month, dow, second] => {
            let dow = weekday_names(dow)?;
            format!("{} {} {} {} {} {}", second, minute, hour, dom, month, dow)
        }
        _ => {
            return Err(cron_error(format!(
                "expected 5 or 6 fields, got {} in {:?}",
                fields.len(),
                expr
            )));
        }
    };

    Schedule::from_str(&normalized)
        .map_err(|e| cron_error(format!("invalid cron expression {:?}: {}", expr, e)))
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite crontab day-of-week numbers (0-7, Sunday twice) as day names
///
/// Items that already use names, `*` and `?` pass through untouched.
fn weekday_names(field: &str) -> Result<String> {
    let invalid = || cron_error(format!("invalid day-of-week field {:?}", field));
    let mut items = Vec::new();

    for item in field.split(',') {
        if item == "*" || item == "?" || item.chars().any(|c| c.is_ascii_alphabetic()) {
            items.push(item.to_string());
            continue;
        }

        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, step.parse::<usize>().map_err(|_| invalid())?),
            None => (item, 1),
        };
        let number = |text: &str| text.parse::<usize>().map_err(|_| invalid());
        let (start, end) = match base.split_once('-') {
            _ if base == "*" => (0, 6),
            Some((start, end)) => (number(start)?, number(end)?),
            None if item.contains('/') => (number(base)?, 6),
            None => (number(base)?, number(base)?),
        };
        if step == 0 || start > end || end > 7 {
            return Err(invalid());
        }

        let mut names: Vec<&str> = Vec::new();
        for day in (start..=end).step_by(step) {
            let name = WEEKDAYS[day % 7];
            if !names.contains(&name) {
                names.push(name);
            }
        }
        items.push(names.join(","));
    }
    Ok(items.join(","))
}

fn cron_error(message: String) -> Error {
    Error::Config {
        message,
        key: Some("schedule.cron".to_string()),
    }
}

#[derive(Default)]
struct SchedulerState {
    expression: Option<String>,
    schedule: Option<Schedule>,
    enabled: bool,
    batch_size: usize,
    worker: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Runs [`DownloadProcess::run`] on a cron schedule, never two at once
#[derive(Clone)]
pub struct ProcessScheduler {
    process: DownloadProcess,
    misfire_grace: Duration,
    state: Arc<Mutex<SchedulerState>>,
    run_lock: Arc<Mutex<()>>,
}

impl ProcessScheduler {
    /// Scheduler with nothing installed
    pub fn new(process: DownloadProcess, batch_size: usize, misfire_grace: Duration) -> Self {
        Self {
            process,
            misfire_grace,
            state: Arc::new(Mutex::new(SchedulerState {
                batch_size,
                ..Default::default()
            })),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Scheduler set up from configuration
    pub async fn from_config(process: DownloadProcess, config: &ScheduleConfig) -> Result<Self> {
        let scheduler = Self::new(process, config.batch_size, config.misfire_grace);
        if let Some(expr) = &config.cron {
            scheduler.set_cron(expr, config.batch_size).await?;
            if !config.enabled {
                scheduler.disable().await;
            }
        }
        Ok(scheduler)
    }

    /// Install `expr` as the trigger, replacing any existing one, and enable it
    ///
    /// Each scheduled scan dispatches `batch_size` tasks at a time. An invalid expression
    /// leaves the current schedule untouched.
    pub async fn set_cron(&self, expr: &str, batch_size: usize) -> Result<()> {
        let schedule = parse_cron(expr)?;
        let mut state = self.state.lock().await;
        state.expression = Some(expr.to_string());
        state.schedule = Some(schedule.clone());
        state.batch_size = batch_size;
        state.enabled = true;
        self.install(&mut state, schedule);
        tracing::info!(cron = expr, batch_size, "schedule installed");
        Ok(())
    }

    /// Resume firing on the stored expression
    pub async fn enable(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(schedule) = state.schedule.clone() else {
            return Err(cron_error("no cron expression set".to_string()));
        };
        state.enabled = true;
        self.install(&mut state, schedule);
        tracing::info!(cron = ?state.expression, "schedule enabled");
        Ok(())
    }

    /// Stop firing; the expression is kept
    pub async fn disable(&self) {
        let mut state = self.state.lock().await;
        state.enabled = false;
        stop_worker(&mut state);
        tracing::info!("schedule disabled");
    }

    /// Whether the trigger is installed
    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    /// The stored expression as given
    pub async fn cron_expression(&self) -> Option<String> {
        self.state.lock().await.expression.clone()
    }

    /// When the trigger fires next; `None` while disabled
    pub async fn next_run_time(&self) -> Option<DateTime<Local>> {
        let state = self.state.lock().await;
        if !state.enabled {
            return None;
        }
        state.schedule.as_ref()?.upcoming(Local).next()
    }

    /// Run the scheduled callback once, now
    ///
    /// Returns false without doing anything if a run is already in progress.
    pub async fn run_now(&self) -> bool {
        let Ok(_running) = self.run_lock.try_lock() else {
            tracing::warn!("previous scheduled run still in progress, skipping");
            return false;
        };
        if self.process.is_running() {
            tracing::warn!("scan already running, skipping scheduled run");
            return false;
        }

        let batch_size = self.state.lock().await.batch_size;
        match self.process.run(batch_size).await {
            Ok(status) => {
                tracing::info!(
                    processed_jobs = status.processed_jobs,
                    failed_jobs = status.failed_jobs,
                    "scheduled scan done"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "scheduled scan failed");
            }
        }
        true
    }

    /// Remove the trigger for good
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.enabled = false;
        stop_worker(&mut state);
    }

    fn install(&self, state: &mut SchedulerState, schedule: Schedule) {
        stop_worker(state);

        let token = CancellationToken::new();
        let this = self.clone();
        let worker_token = token.clone();
        let handle = tokio::spawn(async move { this.tick_loop(schedule, worker_token).await });
        state.worker = Some((token, handle));
    }

    async fn tick_loop(self, schedule: Schedule, token: CancellationToken) {
        let mut last_fire: Option<DateTime<Local>> = None;

        loop {
            let Some(next) = schedule
                .upcoming(Local)
                .find(|t| last_fire.is_none_or(|last| *t > last))
            else {
                tracing::info!("schedule has no upcoming runs");
                break;
            };
            let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            last_fire = Some(next);

            let late = (Local::now() - next).to_std().unwrap_or(Duration::ZERO);
            if late > self.misfire_grace {
                tracing::warn!(
                    scheduled = %next,
                    late_ms = late.as_millis() as u64,
                    "scheduled run missed its grace period, skipping"
                );
                continue;
            }

            let this = self.clone();
            tokio::spawn(async move {
                this.run_now().await;
            });
        }
    }
}

fn stop_worker(state: &mut SchedulerState) {
    if let Some((token, handle)) = state.worker.take() {
        token.cancel();
        // The loop only awaits the token and sleeps, so dropping the handle detaches it
        drop(handle);
    }
}

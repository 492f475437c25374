use crate::balance::describe_balance;
use crate::metrics;
use crate::models::CycleResult;
use crate::notify::escape_html;
use crate::pipeline::{OwnerOutcome, Pipeline};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Owners pulled from the store per cycle.
pub const BATCH_LIMIT: usize = 20;

/// Why a cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTrigger {
    Startup,
    Interval(Duration),
    Webhook,
}

impl CycleTrigger {
    pub fn label(self) -> String {
        match self {
            CycleTrigger::Startup => "стартап".to_string(),
            CycleTrigger::Interval(period) => {
                let minutes = period.as_secs_f64() / 60.0;
                format!("плановая проверка (каждые {} мин)", trim_float(minutes))
            }
            CycleTrigger::Webhook => "вебхук".to_string(),
        }
    }
}

/// Runs one batch: every pending owner in store order, failures isolated per owner.
pub async fn run_cycle(pipeline: &Pipeline, reason: &str) -> CycleResult {
    let cycle_id = Uuid::new_v4();
    let started = Instant::now();
    info!(target = "reconciler.cycle", %cycle_id, reason, "cycle_started");

    let owners = match pipeline.store().pending_owners(BATCH_LIMIT).await {
        Ok(owners) => owners,
        Err(err) => {
            error!(target = "reconciler.cycle", %cycle_id, error = %err, "owners_read_failed");
            pipeline
                .notifier()
                .log(&format!(
                    "Не удалось прочитать owners: {}",
                    escape_html(&err.to_string())
                ))
                .await;
            let result = CycleResult {
                total_owners: 0,
                processed_count: 0,
                errors: vec![err.to_string()],
            };
            send_failure_summary(pipeline, &result, &format!("{reason}, ошибка при чтении owners"))
                .await;
            return result;
        }
    };

    if owners.is_empty() {
        info!(target = "reconciler.cycle", %cycle_id, "nothing_to_do");
        pipeline
            .notifier()
            .log(&format!("Нет объектов для обработки ({reason})"))
            .await;
        return CycleResult::default();
    }

    let mut result = CycleResult {
        total_owners: owners.len(),
        ..CycleResult::default()
    };
    for owner in &owners {
        match pipeline.process_owner(owner).await {
            Ok(OwnerOutcome::Published {
                listing_id,
                external_id,
            }) => {
                result.processed_count += 1;
                debug!(
                    target = "reconciler.cycle",
                    owner_id = %owner.id,
                    listing_id = ?listing_id,
                    external_id = ?external_id,
                    "owner_published"
                );
            }
            Ok(outcome) => {
                result.processed_count += 1;
                debug!(target = "reconciler.cycle", owner_id = %owner.id, ?outcome, "owner_done");
            }
            Err(err) => {
                warn!(
                    target = "reconciler.cycle",
                    owner_id = %owner.id,
                    stage = err.stage(),
                    kind = ?err.kind(),
                    error = %err.detail(),
                    "owner_failed"
                );
                pipeline
                    .notifier()
                    .log(&format!(
                        "Ошибка парсинга owners {}: {}",
                        escape_html(&owner.id.to_string()),
                        escape_html(err.detail())
                    ))
                    .await;
                result.errors.push(format!("owners {}: {}", owner.id, err.detail()));
            }
        }
    }

    if !result.errors.is_empty() {
        send_failure_summary(pipeline, &result, reason).await;
    }
    let elapsed_ms = started.elapsed().as_millis();
    metrics::cycle_finished(
        result.total_owners,
        result.processed_count,
        result.errors.len(),
        elapsed_ms,
    );
    info!(
        target = "reconciler.cycle",
        %cycle_id,
        total = result.total_owners,
        processed = result.processed_count,
        failed = result.errors.len(),
        elapsed_ms = elapsed_ms as u64,
        "cycle_finished"
    );
    result
}

async fn send_failure_summary(pipeline: &Pipeline, result: &CycleResult, reason: &str) {
    let failed = result.errors.len();
    let summary = [
        format!("Задача не выполнена: {} ({reason})", errors_label(failed)),
        format!(
            "Всего проверено: {}, успешно: {}, с ошибками: {failed}",
            result.total_owners, result.processed_count
        ),
        format!(
            "Баланс фотосервиса: {}",
            describe_balance(pipeline.gate().last_observed_balance())
        ),
    ]
    .join("\n");
    pipeline.notifier().log(&summary).await;
}

fn errors_label(count: usize) -> String {
    let word = match (count % 10, count % 100) {
        (1, n) if n != 11 => "ошибка",
        (2..=4, n) if !(12..=14).contains(&n) => "ошибки",
        _ => "ошибок",
    };
    format!("{count} {word}")
}

fn trim_float(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value:.1}")
    }
}

/// Serializes cycles: a trigger that arrives mid-cycle is dropped.
pub struct CycleRunner {
    pipeline: Pipeline,
    running: AtomicBool,
}

/// Clears the running flag when the cycle ends, however it ends.
pub struct RunningGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl CycleRunner {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            running: AtomicBool::new(false),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn try_acquire(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard {
                flag: &self.running,
            })
    }

    /// Announces and runs one cycle; `None` when another cycle holds the guard.
    pub async fn trigger(&self, trigger: CycleTrigger) -> Option<CycleResult> {
        let Some(_guard) = self.try_acquire() else {
            debug!(target = "reconciler.cycle", ?trigger, "cycle_already_running");
            return None;
        };
        let reason = trigger.label();
        self.pipeline
            .notifier()
            .log(&format!("Проверка owners с parsed=false запущена ({reason})."))
            .await;
        Some(run_cycle(&self.pipeline, &reason).await)
    }
}

/// Fires an interval trigger every `period`; the first tick is one period out.
pub fn spawn_interval(runner: Arc<CycleRunner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let runner = runner.clone();
            tokio::spawn(async move {
                runner.trigger(CycleTrigger::Interval(period)).await;
            });
        }
    })
}

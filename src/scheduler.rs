//! Lifecycle Scheduler
//!
//! One background task that wakes every `interval`, asks the store for due
//! records and moves each one along its lifecycle:
//!
//! | record                        | transition                        | event      |
//! |-------------------------------|-----------------------------------|------------|
//! | schedule, unparseable         | deleted                           | none       |
//! | schedule, kind `BATCH`        | re-armed, pending items flushed   | `BATCH`    |
//! | schedule, other kinds         | re-armed                          | `CRON`     |
//! | ack hold, kind `SCHEDULE`     | marked expired, then deleted      | `SCHEDULE` |
//! | ack hold, other kinds         | marked expired                    | `EXPIRED`  |
//! | neither                       | deleted                           | none       |

use crate::batch::BatchAccumulator;
use crate::core::{Record, RecordKind, Result};
use crate::events::EventBus;
use crate::protocol::{Action, Envelope};
use crate::schedule::RecurringSchedule;
use crate::store::RecordStore;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Records returned by the due query
    pub due: usize,
    /// Recurring records re-armed (including batch flushes)
    pub rescheduled: usize,
    /// Batch flushes among `rescheduled`
    pub flushed: usize,
    /// Ack-hold records marked expired and kept
    pub expired: usize,
    /// One-shot schedules completed and removed
    pub completed: usize,
    /// Plain records removed without notice
    pub reaped: usize,
    /// Recurring records removed because their schedule no longer parses
    pub invalid: usize,
    /// Records changed or removed by a client before the transition ran
    pub skipped: usize,
    /// Subscriber deliveries across all published events
    pub published: usize,
    pub errors: usize,
}

/// Decision for one due record, made before touching the store.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    Rearm { next: DateTime<Utc>, flush: bool },
    DropInvalid { reason: String },
    Expire { complete: bool },
    Reap,
}

impl Transition {
    fn plan(record: &Record, now: DateTime<Utc>) -> Self {
        if let Some(spec) = record.schedule() {
            return match RecurringSchedule::next_fire(spec, now) {
                Ok(next) => Transition::Rearm {
                    next,
                    flush: record.kind == RecordKind::Batch,
                },
                Err(e) => Transition::DropInvalid {
                    reason: e.to_string(),
                },
            };
        }

        if record.ack_hold {
            Transition::Expire {
                complete: record.kind == RecordKind::Schedule,
            }
        } else {
            Transition::Reap
        }
    }
}

/// Outcome of applying one transition.
enum Applied {
    Skipped,
    Silent,
    Notify(Envelope),
}

pub struct LifecycleScheduler {
    store: RecordStore,
    batches: BatchAccumulator,
    bus: EventBus<Envelope>,
    interval: Duration,
}

impl LifecycleScheduler {
    pub fn new(
        store: RecordStore,
        batches: BatchAccumulator,
        bus: EventBus<Envelope>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            batches,
            bus,
            interval,
        }
    }

    /// Tick until `cancel` fires. A tick in progress always completes.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "Lifecycle scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if report.due > 0 {
                        debug!(?report, "Tick processed");
                    }
                }
            }
        }

        info!("Lifecycle scheduler stopped");
    }

    /// Runs one pass over the records due at `now`.
    ///
    /// A failed due query is logged and left for the next tick. A record
    /// whose transition fails is logged and skipped; the pass continues.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let due = match self.store.find_due(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Due query failed; retrying next tick");
                report.errors += 1;
                return report;
            }
        };
        report.due = due.len();

        for record in due {
            let transition = Transition::plan(&record, now);
            match self.apply(&record, &transition, now).await {
                Ok(Applied::Skipped) => report.skipped += 1,
                Ok(applied) => {
                    match &transition {
                        Transition::Rearm { flush, .. } => {
                            report.rescheduled += 1;
                            if *flush {
                                report.flushed += 1;
                            }
                        }
                        Transition::DropInvalid { .. } => report.invalid += 1,
                        Transition::Expire { complete: true } => report.completed += 1,
                        Transition::Expire { complete: false } => report.expired += 1,
                        Transition::Reap => report.reaped += 1,
                    }
                    if let Applied::Notify(event) = applied {
                        report.published += self.bus.publish(event);
                    }
                }
                Err(e) => {
                    warn!(key = %record.key, error = %e, "Transition failed; skipping record");
                    report.errors += 1;
                }
            }
        }

        report
    }

    async fn apply(&self, seen: &Record, transition: &Transition, now: DateTime<Utc>) -> Result<Applied> {
        let key = seen.key.clone();
        let seen_due_at = seen.due_at;
        let transition_in_txn = transition.clone();

        // Re-check under the write lock: a client may have overwritten or
        // removed the record after the due query.
        let stored = self
            .store
            .db()
            .transact(move |txn| {
                let current = match txn.get(&key) {
                    Some(current) if current.is_due(now) && current.due_at == seen_due_at => current,
                    _ => return Ok(None),
                };

                match transition_in_txn {
                    Transition::Rearm { next, .. } => txn
                        .update(&key, |record| {
                            record.due_at = next;
                            Ok(())
                        })
                        .map(Some),
                    Transition::Expire { complete } => {
                        let expired = txn.update(&key, |record| {
                            record.expired = true;
                            Ok(())
                        })?;
                        if complete {
                            txn.remove(&key);
                        }
                        Ok(Some(expired))
                    }
                    Transition::DropInvalid { .. } | Transition::Reap => {
                        txn.remove(&key);
                        Ok(Some(current))
                    }
                }
            })
            .await?;

        let Some(record) = stored else {
            debug!(key = %seen.key, "Record changed since the due query; skipping");
            return Ok(Applied::Skipped);
        };

        let applied = match transition {
            Transition::Rearm { flush: true, next } => {
                let cohort = self.batches.claim_and_flush(&record.key, now).await?;
                debug!(key = %record.key, items = cohort.len(), next = %next, "Batch flushed");
                let data = serde_json::to_string(&cohort)?;
                Applied::Notify(Envelope::event(Action::Batch, &record, data))
            }
            Transition::Rearm { flush: false, next } => {
                debug!(key = %record.key, next = %next, "Recurring record fired");
                Applied::Notify(Envelope::event(Action::Cron, &record, record.payload.clone()))
            }
            Transition::Expire { complete: true } => {
                debug!(key = %record.key, "One-shot schedule completed");
                Applied::Notify(Envelope::event(Action::Schedule, &record, record.payload.clone()))
            }
            Transition::Expire { complete: false } => {
                debug!(key = %record.key, "Record expired under ack hold");
                Applied::Notify(Envelope::event(Action::Expired, &record, record.payload.clone()))
            }
            Transition::DropInvalid { reason } => {
                warn!(key = %record.key, reason = %reason, "Dropping record with invalid schedule");
                Applied::Silent
            }
            Transition::Reap => {
                debug!(key = %record.key, "Record reaped");
                Applied::Silent
            }
        };

        Ok(applied)
    }
}

//! Task model for the distributed scheduler: firing kinds, execution
//! modes and the cron schedule wrapper.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use uuid::Uuid;

use crate::error::{FleetError, Result};

/// Boxed future returned by a task body
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A task body; invoked once per fire on a worker
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Cron schedule wrapper keeping the original expression for display
#[derive(Clone)]
pub struct CronSchedule {
    expr: String,
    cron: Cron,
}

impl CronSchedule {
    /// Parse a 5-field cron expression (minute hour day month weekday)
    pub fn parse(expr: &str) -> Result<Self> {
        let cron = Cron::from_str(expr).map_err(|e| {
            FleetError::configuration(format!("invalid cron expression {expr:?}: {e}"))
        })?;
        Ok(Self {
            expr: expr.to_string(),
            cron,
        })
    }

    /// Next occurrence strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.cron
            .find_next_occurrence(&after, false)
            .map_err(|e| {
                FleetError::configuration(format!(
                    "no next occurrence for cron {:?}: {e}",
                    self.expr
                ))
            })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }
}

impl std::fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expr).finish()
    }
}

/// When a task fires
#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Fires once at a wall-clock instant, then terminates
    Once { fire_at: DateTime<Utc> },
    /// Fires after `initial_delay`, then every `interval` computed from the
    /// wall clock at completion
    Interval {
        initial_delay: Duration,
        interval: Duration,
    },
    /// Fires on a cron schedule advanced over the fire instant
    Cron { schedule: CronSchedule },
}

/// Where a task executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Only the current leader runs it; non-leaders re-queue it at its next
    /// nominal time without running
    Clustered,
    /// Every node runs it independently
    Local,
}

/// Lifecycle state tracked per scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

/// A registered scheduler job
#[derive(Clone)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub kind: TaskKind,
    pub mode: ExecutionMode,
    /// Per-run bound; the worker cancels the body at this deadline
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    run: TaskFn,
}

impl Task {
    /// A task firing once at `fire_at`
    pub fn once(
        name: impl Into<String>,
        fire_at: DateTime<Utc>,
        mode: ExecutionMode,
        timeout: Duration,
        run: TaskFn,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: TaskKind::Once { fire_at },
            mode,
            timeout,
            created_at: Utc::now(),
            run,
        }
    }

    /// A periodic task firing after `initial_delay`, then every `interval`
    pub fn interval(
        name: impl Into<String>,
        initial_delay: Duration,
        interval: Duration,
        mode: ExecutionMode,
        timeout: Duration,
        run: TaskFn,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: TaskKind::Interval {
                initial_delay,
                interval,
            },
            mode,
            timeout,
            created_at: Utc::now(),
            run,
        }
    }

    /// A cron-scheduled task
    pub fn cron(
        name: impl Into<String>,
        expr: &str,
        mode: ExecutionMode,
        timeout: Duration,
        run: TaskFn,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: TaskKind::Cron {
                schedule: CronSchedule::parse(expr)?,
            },
            mode,
            timeout,
            created_at: Utc::now(),
            run,
        })
    }

    pub(crate) fn invoke(&self) -> TaskFuture {
        (self.run)()
    }

    /// First fire instant after registration
    pub(crate) fn first_fire(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match &self.kind {
            TaskKind::Once { fire_at } => Ok(*fire_at),
            TaskKind::Interval { initial_delay, .. } => {
                Ok(now + chrono_duration(*initial_delay))
            }
            TaskKind::Cron { schedule } => schedule.next_after(now),
        }
    }

    /// Next fire after a completed run, computed from the wall clock at
    /// completion. `None` terminates the task.
    pub(crate) fn next_after_completion(
        &self,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        match &self.kind {
            TaskKind::Once { .. } => Ok(None),
            TaskKind::Interval { interval, .. } => {
                Ok(Some(completed_at + chrono_duration(*interval)))
            }
            TaskKind::Cron { schedule } => Ok(Some(schedule.next_after(completed_at)?)),
        }
    }

    /// Next nominal instant `>= now` for a fire skipped on a non-leader.
    /// Missed fires are never back-filled; `None` terminates the task
    /// (a skipped `once` has no later nominal instant).
    pub(crate) fn next_nominal(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match &self.kind {
            TaskKind::Once { .. } => Ok(None),
            TaskKind::Interval { interval, .. } => {
                Ok(Some(now + chrono_duration(*interval)))
            }
            TaskKind::Cron { schedule } => Ok(Some(schedule.next_after(now)?)),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TaskFn {
        Arc::new(|| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn test_cron_parse_and_advance() {
        let schedule = CronSchedule::parse("0 3 * * *").unwrap();
        let after = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = schedule.next_after(after).unwrap();
        assert_eq!(next.format("%H:%M").to_string(), "03:00");
        assert!(next > after);

        assert!(CronSchedule::parse("not a cron").is_err());
    }

    #[test]
    fn test_interval_fires_from_completion_clock() {
        let task = Task::interval(
            "t",
            Duration::from_secs(60),
            Duration::from_secs(3600),
            ExecutionMode::Local,
            Duration::from_secs(10),
            noop(),
        );
        let now = Utc::now();
        assert_eq!(task.first_fire(now).unwrap(), now + chrono::Duration::seconds(60));
        let next = task.next_after_completion(now).unwrap().unwrap();
        assert_eq!(next, now + chrono::Duration::seconds(3600));
    }

    #[test]
    fn test_once_terminates() {
        let now = Utc::now();
        let task = Task::once(
            "t",
            now,
            ExecutionMode::Clustered,
            Duration::from_secs(10),
            noop(),
        );
        assert!(task.next_after_completion(now).unwrap().is_none());
        assert!(task.next_nominal(now).unwrap().is_none());
    }
}

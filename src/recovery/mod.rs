//! Recovery & provider circuit breaker (spec §4.7).
//!
//! Three pieces: an error classifier turning raw provider/tool failures
//! into `Transient`/`Permanent`/`Unknown`, a per-task exponential-backoff
//! scheduler that the Tracker's `mark_failed` path feeds into, and a
//! per-provider circuit breaker the Supervisor's scheduling loop
//! consults before handing a task to a worker.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use forge_common::{ErrorCategory, Task};
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::errors::RecoveryError;
use crate::registry::ProjectRegistry;
use crate::tracker::TaskTracker;

/// Exponential backoff schedule, indexed by `retry_count - 1` (spec §4.7).
pub const BACKOFF_SECS: [i64; 5] = [60, 120, 300, 900, 1800];
pub const MAX_RETRIES: u32 = 5;

/// Categorize a raw failure signal. HTTP status, when known, takes
/// precedence over message sniffing.
pub fn classify_error(message: &str, status_code: Option<u16>) -> ErrorCategory {
    match status_code {
        Some(429) | Some(500..=599) => return ErrorCategory::Transient,
        Some(401) | Some(403) => return ErrorCategory::Permanent,
        _ => {}
    }

    let lower = message.to_lowercase();
    let transient_markers = ["timeout", "timed out", "connection reset", "rate limit", "retry-after"];
    let permanent_markers = [
        "authentication",
        "unauthorized",
        "invalid api key",
        "quota exceeded",
        "invalid model",
        "malformed request",
        "sandbox denied",
        "refused",
    ];

    if transient_markers.iter().any(|m| lower.contains(m)) {
        ErrorCategory::Transient
    } else if permanent_markers.iter().any(|m| lower.contains(m)) {
        ErrorCategory::Permanent
    } else {
        ErrorCategory::Unknown
    }
}

/// The backoff deadline for a task that has just failed for the
/// `retry_count`-th time, with up to 10s of jitter. `None` once the
/// schedule is exhausted (`retry_count > MAX_RETRIES`).
pub fn next_retry_at(retry_count: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let idx = retry_count.checked_sub(1)? as usize;
    let base = *BACKOFF_SECS.get(idx)?;
    let jitter = rand::thread_rng().gen_range(0..=10);
    Some(now + ChronoDuration::seconds(base + jitter))
}

/// Record a task failure: classify, bump `retryCount`, and schedule the
/// next retry deadline. Feeds the Tracker's durable state directly so
/// the Recovery service's periodic sweep has up-to-date fields to read.
#[instrument(skip(tracker, message))]
pub async fn record_failure(
    tracker: &TaskTracker,
    project_id: Uuid,
    task_id: Uuid,
    category: ErrorCategory,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> Result<Task, RecoveryError> {
    if tracker.get(project_id, task_id).await.is_none() {
        return Err(RecoveryError::TaskNotFound { project_id, task_id });
    }
    let message = message.into();
    tracker
        .update(project_id, task_id, move |t| {
            t.mark_failed(category, message);
            t.retry_count += 1;
            t.next_retry_at = next_retry_at(t.retry_count, now);
        })
        .await
        .map_err(RecoveryError::Other)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct ProviderCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Default for ProviderCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Per-provider consecutive-transient-failure breaker (spec §4.7). Three
/// consecutive transient failures opens the circuit for a cooldown;
/// a single probe at cooldown end either closes it or reopens it fresh.
pub struct CircuitBreaker {
    providers: Arc<RwLock<HashMap<String, ProviderCircuit>>>,
    failure_threshold: u32,
    cooldown: ChronoDuration,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_params(3, ChronoDuration::minutes(10))
    }

    pub fn with_params(failure_threshold: u32, cooldown: ChronoDuration) -> Self {
        Self {
            providers: Arc::new(RwLock::new(HashMap::new())),
            failure_threshold,
            cooldown,
        }
    }

    /// Whether the scheduler may hand a task bound to `provider` to a
    /// worker right now. Transitions `Open` to `HalfOpen` (admitting
    /// exactly one probe) once the cooldown has elapsed.
    #[instrument(skip(self))]
    pub async fn allow_request(&self, provider: &str, now: DateTime<Utc>) -> bool {
        let mut guard = self.providers.write().await;
        let circuit = guard.entry(provider.to_string()).or_default();
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooldown_elapsed = circuit.opened_at.is_some_and(|opened| now - opened >= self.cooldown);
                if cooldown_elapsed {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_in_flight = true;
                    info!(provider, "circuit cooldown elapsed, admitting probe request");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    false
                } else {
                    circuit.probe_in_flight = true;
                    true
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn record_success(&self, provider: &str) {
        let mut guard = self.providers.write().await;
        if let Some(circuit) = guard.get_mut(provider) {
            if circuit.state != CircuitState::Closed {
                info!(provider, "circuit closed after successful probe");
            }
            *circuit = ProviderCircuit::default();
        }
    }

    /// Only transient failures count toward opening the circuit —
    /// permanent failures are the caller's problem, not the provider's.
    #[instrument(skip(self))]
    pub async fn record_failure(&self, provider: &str, category: ErrorCategory, now: DateTime<Utc>) {
        if category != ErrorCategory::Transient {
            return;
        }
        let mut guard = self.providers.write().await;
        let circuit = guard.entry(provider.to_string()).or_default();
        circuit.probe_in_flight = false;
        circuit.consecutive_failures += 1;
        if circuit.consecutive_failures >= self.failure_threshold {
            circuit.state = CircuitState::Open;
            circuit.opened_at = Some(now);
            warn!(provider, failures = circuit.consecutive_failures, "circuit opened");
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic sweep (default cadence 300 s, driven by the scheduler in
/// the orchestrator service) that resurrects retryable failed tasks.
pub struct RecoveryService {
    tracker: TaskTracker,
    registry: ProjectRegistry,
}

impl RecoveryService {
    pub fn new(tracker: TaskTracker, registry: ProjectRegistry) -> Self {
        Self { tracker, registry }
    }

    /// Reset every eligible `Failed` task across active projects back to
    /// `Unassigned`: category transient/unknown, under the retry cap,
    /// and past its backoff deadline. Returns how many were recovered.
    #[instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut recovered = 0;
        for project in self.registry.list_active().await {
            for task in self.tracker.list_failed(project.id).await {
                if is_retry_eligible(&task, now) {
                    self.tracker.retry(project.id, task.id).await?;
                    recovered += 1;
                    info!(project_id = %project.id, task_id = %task.id, "recovered failed task to unassigned");
                }
            }
        }
        Ok(recovered)
    }
}

fn is_retry_eligible(task: &Task, now: DateTime<Utc>) -> bool {
    matches!(task.last_error_category, Some(ErrorCategory::Transient) | Some(ErrorCategory::Unknown))
        && task.retry_count < MAX_RETRIES
        && task.next_retry_at.is_none_or(|t| t <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_common::AgentType;
    use std::path::PathBuf;

    #[test]
    fn classify_error_recognizes_transient_markers() {
        assert_eq!(classify_error("request timed out", None), ErrorCategory::Transient);
        assert_eq!(classify_error("rate limit exceeded", None), ErrorCategory::Transient);
        assert_eq!(classify_error("x", Some(503)), ErrorCategory::Transient);
        assert_eq!(classify_error("x", Some(429)), ErrorCategory::Transient);
    }

    #[test]
    fn classify_error_recognizes_permanent_markers() {
        assert_eq!(classify_error("authentication failed", None), ErrorCategory::Permanent);
        assert_eq!(classify_error("x", Some(401)), ErrorCategory::Permanent);
        assert_eq!(classify_error("invalid model name", None), ErrorCategory::Permanent);
    }

    #[test]
    fn classify_error_falls_back_to_unknown() {
        assert_eq!(classify_error("the sky is falling", None), ErrorCategory::Unknown);
    }

    #[test]
    fn next_retry_at_follows_backoff_schedule() {
        let now = Utc::now();
        let first = next_retry_at(1, now).unwrap();
        assert!(first >= now + ChronoDuration::seconds(60));
        assert!(first < now + ChronoDuration::seconds(75));
    }

    #[test]
    fn next_retry_at_is_none_once_schedule_exhausted() {
        let now = Utc::now();
        assert!(next_retry_at(6, now).is_none());
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new();
        let now = Utc::now();
        for _ in 0..3 {
            breaker.record_failure("acme", ErrorCategory::Transient, now).await;
        }
        assert!(!breaker.allow_request("acme", now).await);
    }

    #[tokio::test]
    async fn circuit_breaker_permanent_failures_do_not_open_circuit() {
        let breaker = CircuitBreaker::new();
        let now = Utc::now();
        for _ in 0..5 {
            breaker.record_failure("acme", ErrorCategory::Permanent, now).await;
        }
        assert!(breaker.allow_request("acme", now).await);
    }

    #[tokio::test]
    async fn circuit_breaker_admits_one_probe_after_cooldown_and_closes_on_success() {
        let breaker = CircuitBreaker::with_params(3, ChronoDuration::seconds(10));
        let t0 = Utc::now();
        for _ in 0..3 {
            breaker.record_failure("acme", ErrorCategory::Transient, t0).await;
        }
        assert!(!breaker.allow_request("acme", t0).await);

        let after_cooldown = t0 + ChronoDuration::seconds(11);
        assert!(breaker.allow_request("acme", after_cooldown).await);
        breaker.record_success("acme").await;
        assert!(breaker.allow_request("acme", after_cooldown).await);
    }

    #[tokio::test]
    async fn circuit_breaker_reopens_with_fresh_cooldown_on_failed_probe() {
        let breaker = CircuitBreaker::with_params(3, ChronoDuration::seconds(10));
        let t0 = Utc::now();
        for _ in 0..3 {
            breaker.record_failure("acme", ErrorCategory::Transient, t0).await;
        }
        let after_cooldown = t0 + ChronoDuration::seconds(11);
        assert!(breaker.allow_request("acme", after_cooldown).await);
        breaker.record_failure("acme", ErrorCategory::Transient, after_cooldown).await;
        assert!(!breaker.allow_request("acme", after_cooldown).await);
    }

    async fn setup() -> (TaskTracker, ProjectRegistry, tempfile::TempDir, Uuid) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::load(dir.path()).await.unwrap();
        let project = registry
            .create("demo", PathBuf::from("/tmp/demo"), "spec")
            .await
            .unwrap();
        let tracker = TaskTracker::new();
        tracker.register_project(project.id, dir.path().join(&project.name)).await.unwrap();
        (tracker, registry, dir, project.id)
    }

    #[tokio::test]
    async fn record_failure_sets_backoff_and_increments_retry_count() {
        let (tracker, _registry, _dir, project_id) = setup().await;
        let task = Task::new(project_id, "do it", "backend", AgentType::Coding, 1);
        tracker.add(task.clone()).await.unwrap();

        let now = Utc::now();
        let updated = record_failure(&tracker, project_id, task.id, ErrorCategory::Transient, "timed out", now)
            .await
            .unwrap();
        assert_eq!(updated.retry_count, 1);
        assert!(updated.next_retry_at.unwrap() > now);
    }

    #[tokio::test]
    async fn record_failure_on_an_unknown_task_returns_task_not_found() {
        let (tracker, _registry, _dir, project_id) = setup().await;
        let missing_task_id = uuid::Uuid::new_v4();

        let err = record_failure(&tracker, project_id, missing_task_id, ErrorCategory::Transient, "timed out", Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, RecoveryError::TaskNotFound { task_id, .. } if task_id == missing_task_id));
    }

    #[tokio::test]
    async fn recovery_service_resurrects_eligible_failed_tasks() {
        let (tracker, registry, _dir, project_id) = setup().await;
        let task = Task::new(project_id, "do it", "backend", AgentType::Coding, 1);
        tracker.add(task.clone()).await.unwrap();

        let past = Utc::now() - ChronoDuration::seconds(1);
        record_failure(&tracker, project_id, task.id, ErrorCategory::Transient, "timed out", past)
            .await
            .unwrap();

        let service = RecoveryService::new(tracker.clone(), registry.clone());
        let recovered = service.run_once(Utc::now() + ChronoDuration::seconds(120)).await.unwrap();
        assert_eq!(recovered, 1);
        let fetched = tracker.get(project_id, task.id).await.unwrap();
        assert_eq!(fetched.status, forge_common::TaskStatus::Unassigned);
    }

    #[tokio::test]
    async fn recovery_service_leaves_permanent_failures_alone() {
        let (tracker, registry, _dir, project_id) = setup().await;
        let task = Task::new(project_id, "do it", "backend", AgentType::Coding, 1);
        tracker.add(task.clone()).await.unwrap();
        record_failure(&tracker, project_id, task.id, ErrorCategory::Permanent, "bad api key", Utc::now())
            .await
            .unwrap();

        let service = RecoveryService::new(tracker.clone(), registry.clone());
        let recovered = service.run_once(Utc::now()).await.unwrap();
        assert_eq!(recovered, 0);
    }

    #[tokio::test]
    async fn recovery_service_respects_retry_cap() {
        let (tracker, registry, _dir, project_id) = setup().await;
        let task = Task::new(project_id, "do it", "backend", AgentType::Coding, 1);
        tracker.add(task.clone()).await.unwrap();

        let past = Utc::now() - ChronoDuration::seconds(1);
        for _ in 0..MAX_RETRIES {
            record_failure(&tracker, project_id, task.id, ErrorCategory::Transient, "timed out", past)
                .await
                .unwrap();
        }

        let service = RecoveryService::new(tracker.clone(), registry.clone());
        let recovered = service.run_once(Utc::now() + ChronoDuration::seconds(3600)).await.unwrap();
        assert_eq!(recovered, 0);
    }
}

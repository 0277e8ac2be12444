use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, mpsc, watch};

use crate::backend::{record_id, Backend, RowEvent, SubscriptionHandle};
use crate::config::CoordinatorConfig;
use crate::error::{BackendError, CoordinatorError, Result};
use crate::events::Notification;
use crate::types::{GenerationJob, JobSnapshot, JobStatus, Phase, SubmitRequest};

/// Tracks one RAMS generation job at a time.
///
/// [`submit()`](Self::submit) creates the job row, subscribes to it, and
/// only then triggers the remote worker, so no update can be missed.
/// Row updates are applied in the background; read the current state with
/// [`snapshot()`](Self::snapshot) or watch it via [`subscribe()`](Self::subscribe).
///
/// # Example
///
/// ```ignore
/// let coordinator = RamsCoordinator::new(backend, CoordinatorConfig::default());
/// let mut snapshots = coordinator.subscribe();
///
/// coordinator
///     .submit(SubmitRequest::new("Install a 32A radial circuit").linked_to("jp-1"))
///     .await?;
///
/// let done = snapshots.wait_for(|s| s.phase.is_terminal()).await?;
/// if done.phase == Phase::Complete {
///     std::fs::write("rams.json", coordinator.export_result()?)?;
/// }
/// ```
pub struct RamsCoordinator<B: Backend> {
    shared: Arc<Shared<B>>,
}

struct Shared<B: Backend> {
    backend: Arc<B>,
    config: CoordinatorConfig,
    state: Mutex<TrackingState>,
    snapshots: watch::Sender<JobSnapshot>,
    notifications: broadcast::Sender<Notification>,
}

#[derive(Default)]
struct TrackingState {
    snapshot: JobSnapshot,
    linked_record_id: Option<String>,
    subscription: Option<SubscriptionHandle>,
}

impl TrackingState {
    fn release_subscription(&mut self) {
        if let Some(mut handle) = self.subscription.take() {
            handle.unsubscribe();
        }
    }

    fn is_tracking(&self, job_id: &str) -> bool {
        self.snapshot.phase.is_tracking() && self.snapshot.job_id.as_deref() == Some(job_id)
    }
}

/// What to do once the state lock is released.
enum FollowUp {
    Nothing,
    Notify(Notification),
    Completed {
        job_id: String,
        linked_record_id: Option<String>,
        notification: Notification,
    },
}

impl<B: Backend> RamsCoordinator<B> {
    pub fn new(backend: B, config: CoordinatorConfig) -> Self {
        Self::with_shared_backend(Arc::new(backend), config)
    }

    /// Build a coordinator over a backend shared with other owners.
    pub fn with_shared_backend(backend: Arc<B>, config: CoordinatorConfig) -> Self {
        let (snapshots, _) = watch::channel(JobSnapshot::default());
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                state: Mutex::new(TrackingState::default()),
                snapshots,
                notifications,
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Current observable state.
    pub fn snapshot(&self) -> JobSnapshot {
        self.shared.lock().snapshot.clone()
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().snapshot.phase
    }

    /// Receive a fresh snapshot after every transition.
    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Receive submission, success and failure notifications.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.shared.notifications.subscribe()
    }

    /// Create a generation job and start tracking it.
    ///
    /// Returns once the worker has been triggered; completion arrives later
    /// through the snapshot stream. Only a blank description or a call while
    /// not `Idle` is reported as `Err` (and changes nothing). Backend
    /// failures move the coordinator to `Failed` and still return `Ok`.
    ///
    /// If the returned future is dropped before the trigger call finishes
    /// (e.g. by `tokio::time::timeout`), the coordinator moves to `Failed`
    /// with "Submission cancelled" so it can be reset.
    pub async fn submit(&self, request: SubmitRequest) -> Result<()> {
        let shared = &self.shared;
        let description = {
            let mut state = shared.lock();
            let phase = state.snapshot.phase;
            if phase != Phase::Idle {
                return Err(CoordinatorError::InvalidPhase {
                    operation: "submit",
                    phase,
                });
            }
            let description = request.validated_description()?.to_string();
            state.snapshot.phase = Phase::Submitting;
            state.linked_record_id = request.linked_record_id.clone();
            shared.publish(&state);
            description
        };
        let mut guard = SubmitGuard {
            shared: shared.as_ref(),
            armed: true,
        };

        tracing::info!(
            scale = request.scale.as_str(),
            linked = request.linked_record_id.as_deref().unwrap_or("-"),
            "Submitting RAMS generation job"
        );

        let fields = json!({
            "job_description": description,
            "job_scale": request.scale,
            "project_info": request.project_info,
            "status": JobStatus::Pending,
            "progress": 0,
        });
        let row = match shared
            .backend
            .create_record(&shared.config.jobs_table, fields)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                shared.fail_submission(None, e);
                return Ok(());
            }
        };
        let job_id = match record_id(&row) {
            Some(id) => id,
            None => {
                shared.fail_submission(
                    None,
                    BackendError::InvalidResponse("Created job record has no id".into()),
                );
                return Ok(());
            }
        };

        let subscription = match shared
            .backend
            .subscribe_to_row_updates(&shared.config.jobs_table, &job_id, RowEvent::Update)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                shared.fail_submission(None, e);
                return Ok(());
            }
        };
        let (updates, handle) = subscription.into_parts();

        {
            let mut state = shared.lock();
            state.snapshot = JobSnapshot {
                phase: Phase::Awaiting,
                job_id: Some(job_id.clone()),
                progress: 0,
                current_step: shared.config.submission_step.clone(),
                result: None,
                error: None,
            };
            state.subscription = Some(handle);
            shared.publish(&state);
        }
        tracing::info!(job_id = %job_id, "Tracking RAMS generation job");
        shared.notify(Notification::Submitted {
            job_id: job_id.clone(),
        });

        spawn_observer(Arc::downgrade(shared), job_id.clone(), updates);

        if let Err(e) = shared
            .backend
            .invoke_function(&shared.config.function_name, json!({ "jobId": job_id }))
            .await
        {
            shared.fail_submission(Some(&job_id), e);
        }
        guard.armed = false;
        Ok(())
    }

    /// Apply a row update pushed by the backend.
    ///
    /// Normally called by the background observer. Updates for any job other
    /// than the tracked one, or arriving outside `Awaiting`/`InProgress`, are
    /// ignored. Returns whether the update was applied.
    pub async fn observe_update(&self, row: GenerationJob) -> bool {
        self.shared.observe(row)
    }

    /// Return to `Idle` from `Complete` or `Failed`, clearing all state.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.shared.lock();
        let phase = state.snapshot.phase;
        if !phase.is_terminal() {
            return Err(CoordinatorError::InvalidPhase {
                operation: "reset",
                phase,
            });
        }
        state.release_subscription();
        *state = TrackingState::default();
        self.shared.publish(&state);
        tracing::debug!("Coordinator reset");
        Ok(())
    }

    /// The generated result as pretty-printed JSON. Only available in `Complete`.
    pub fn export_result(&self) -> Result<Vec<u8>> {
        let state = self.shared.lock();
        match (state.snapshot.phase, &state.snapshot.result) {
            (Phase::Complete, Some(result)) => Ok(serde_json::to_vec_pretty(result)?),
            (phase, _) => Err(CoordinatorError::InvalidPhase {
                operation: "export the result",
                phase,
            }),
        }
    }

    /// Write [`export_result()`](Self::export_result) to `path`.
    pub async fn export_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.export_result()?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    /// Suggested file name for the exported result, e.g. `rams-job-1.json`.
    pub fn export_file_name(&self) -> Option<String> {
        let state = self.shared.lock();
        match state.snapshot.phase {
            Phase::Complete => state
                .snapshot
                .job_id
                .as_ref()
                .map(|id| format!("rams-{}.json", id)),
            _ => None,
        }
    }
}

impl<B: Backend> Drop for RamsCoordinator<B> {
    fn drop(&mut self) {
        self.shared.lock().release_subscription();
    }
}

/// Fails the submission if `submit` is dropped before the trigger returns.
struct SubmitGuard<'a, B: Backend> {
    shared: &'a Shared<B>,
    armed: bool,
}

impl<B: Backend> Drop for SubmitGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cancel_submission();
        }
    }
}

impl<B: Backend> Shared<B> {
    fn lock(&self) -> MutexGuard<'_, TrackingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &TrackingState) {
        self.snapshots.send_replace(state.snapshot.clone());
    }

    fn notify(&self, notification: Notification) {
        // No receivers is fine.
        let _ = self.notifications.send(notification);
    }

    fn is_tracking(&self, job_id: &str) -> bool {
        self.lock().is_tracking(job_id)
    }

    /// Move to `Failed`, release the subscription, and build the failure
    /// notification. The caller sends it after dropping the lock.
    fn fail_locked(&self, state: &mut TrackingState, err: CoordinatorError) -> Notification {
        let error = err.user_message(&self.config.fallback_error);
        tracing::error!(
            job_id = state.snapshot.job_id.as_deref().unwrap_or("-"),
            error = %error,
            "RAMS generation failed"
        );
        state.snapshot.phase = Phase::Failed;
        state.snapshot.error = Some(error.clone());
        state.snapshot.result = None;
        state.release_subscription();
        self.publish(state);
        Notification::Failed {
            job_id: state.snapshot.job_id.clone(),
            error,
        }
    }

    /// Fail the in-flight submission. `job_id` is `None` before a job row
    /// exists; once it does, a failure for a job no longer tracked is dropped.
    fn fail_submission(&self, job_id: Option<&str>, err: BackendError) {
        let notification = {
            let mut state = self.lock();
            if !state.snapshot.phase.is_busy() {
                return;
            }
            if job_id.is_some() && state.snapshot.job_id.as_deref() != job_id {
                return;
            }
            self.fail_locked(&mut state, CoordinatorError::Submission(err.to_string()))
        };
        self.notify(notification);
    }

    /// Only `Submitting` and `Awaiting` are touched. Once an update has
    /// arrived the worker is known to be running.
    fn cancel_submission(&self) {
        let notification = {
            let mut state = self.lock();
            if !matches!(state.snapshot.phase, Phase::Submitting | Phase::Awaiting) {
                return;
            }
            tracing::warn!(
                job_id = state.snapshot.job_id.as_deref().unwrap_or("-"),
                "Submission dropped before the worker was triggered"
            );
            self.fail_locked(
                &mut state,
                CoordinatorError::Submission("Submission cancelled".into()),
            )
        };
        self.notify(notification);
    }

    fn observe(&self, row: GenerationJob) -> bool {
        let follow_up = {
            let mut state = self.lock();
            if !state.is_tracking(&row.id) {
                tracing::debug!(
                    job_id = %row.id,
                    phase = %state.snapshot.phase,
                    "Ignoring stale job update"
                );
                return false;
            }
            self.apply(&mut state, row)
        };

        match follow_up {
            FollowUp::Nothing => {}
            FollowUp::Notify(notification) => self.notify(notification),
            FollowUp::Completed {
                job_id,
                linked_record_id,
                notification,
            } => {
                self.notify(notification);
                if let Some(record_id) = linked_record_id {
                    self.spawn_linked_flag(job_id, record_id);
                }
            }
        }
        true
    }

    fn apply(&self, state: &mut TrackingState, row: GenerationJob) -> FollowUp {
        match row.status {
            JobStatus::Pending | JobStatus::InProgress => {
                state.snapshot.phase = Phase::InProgress;
                if let Some(progress) = row.progress_percent() {
                    state.snapshot.progress = progress;
                }
                if let Some(step) = row.current_step {
                    state.snapshot.current_step = step;
                }
                self.publish(state);
                tracing::debug!(
                    job_id = %row.id,
                    progress = state.snapshot.progress,
                    step = %state.snapshot.current_step,
                    "RAMS generation progress"
                );
                FollowUp::Nothing
            }
            JobStatus::Complete => {
                let result = match row.result() {
                    Some(Ok(result)) => result,
                    Some(Err(e)) => {
                        return FollowUp::Notify(self.fail_locked(
                            state,
                            CoordinatorError::Generation(format!(
                                "Generated RAMS could not be read: {}",
                                e
                            )),
                        ))
                    }
                    None => {
                        return FollowUp::Notify(self.fail_locked(
                            state,
                            CoordinatorError::Generation(
                                "Generation completed without a result".into(),
                            ),
                        ))
                    }
                };

                let notification = Notification::Completed {
                    job_id: row.id.clone(),
                    hazard_count: result.hazard_count(),
                    highest_risk: result.highest_risk(),
                };
                tracing::info!(
                    job_id = %row.id,
                    hazards = result.hazard_count(),
                    ppe = result.ppe_details.len(),
                    "RAMS generation complete"
                );

                state.snapshot.phase = Phase::Complete;
                state.snapshot.progress = row.progress_percent().unwrap_or(100);
                if let Some(step) = row.current_step {
                    state.snapshot.current_step = step;
                }
                state.snapshot.result = Some(result);
                state.snapshot.error = None;
                state.release_subscription();
                self.publish(state);

                FollowUp::Completed {
                    job_id: row.id,
                    linked_record_id: state.linked_record_id.clone(),
                    notification,
                }
            }
            JobStatus::Failed => {
                let message = row.error_message.unwrap_or_default();
                FollowUp::Notify(self.fail_locked(state, CoordinatorError::Generation(message)))
            }
        }
    }

    /// Mark the linked record in the background. The result stands even if
    /// this fails.
    fn spawn_linked_flag(&self, job_id: String, record_id: String) {
        let backend = Arc::clone(&self.backend);
        let table = self.config.linked_table.clone();
        let mut fields = serde_json::Map::new();
        fields.insert(self.config.linked_flag_column.clone(), Value::Bool(true));

        tokio::spawn(async move {
            let outcome = backend
                .update_record(&table, &record_id, Value::Object(fields))
                .await
                .map_err(|e| CoordinatorError::SideEffect(e.to_string()));
            match outcome {
                Ok(()) => tracing::debug!(
                    job_id = %job_id,
                    record_id = %record_id,
                    "Linked record flagged"
                ),
                Err(e) => tracing::warn!(
                    job_id = %job_id,
                    record_id = %record_id,
                    error = %e,
                    "Could not mark linked record as having RAMS"
                ),
            }
        });
    }

    fn stream_closed(&self, job_id: &str) {
        let notification = {
            let mut state = self.lock();
            if !state.is_tracking(job_id) {
                return;
            }
            self.fail_locked(
                &mut state,
                CoordinatorError::Submission(BackendError::Closed.to_string()),
            )
        };
        self.notify(notification);
    }
}

/// Drain row snapshots for `job_id` into the coordinator until it stops
/// tracking the job or the coordinator is dropped.
fn spawn_observer<B: Backend>(
    shared: Weak<Shared<B>>,
    job_id: String,
    mut updates: mpsc::UnboundedReceiver<Value>,
) {
    tokio::spawn(async move {
        while let Some(raw) = updates.recv().await {
            let Some(coordinator) = shared.upgrade() else {
                return;
            };
            match GenerationJob::from_row(raw) {
                Ok(row) => {
                    coordinator.observe(row);
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Skipping undecodable job update");
                }
            }
            if !coordinator.is_tracking(&job_id) {
                return;
            }
        }

        // The backend closed the stream while the job was still running.
        if let Some(coordinator) = shared.upgrade() {
            coordinator.stream_closed(&job_id);
        }
    });
}

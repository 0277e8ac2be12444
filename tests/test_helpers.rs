#![allow(dead_code)]

use rams_coordinator::*;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, watch};

pub const JOBS: &str = "rams_generation_jobs";
pub const PACKS: &str = "job_packs";

const WAIT: Duration = Duration::from_secs(2);

pub fn backend() -> MemoryBackend {
    MemoryBackend::new().with_sequential_ids("job")
}

pub fn coordinator(backend: &MemoryBackend) -> RamsCoordinator<MemoryBackend> {
    RamsCoordinator::new(backend.clone(), CoordinatorConfig::default())
}

pub fn project_info() -> ProjectInfo {
    ProjectInfo {
        project_name: Some("Kitchen rewire".into()),
        location: Some("14 Mill Lane, Leeds".into()),
        assessor: Some("J. Carter".into()),
        contractor: Some("Carter Electrical Ltd".into()),
        site_manager_name: Some("R. Patel".into()),
        site_manager_phone: Some("07700 900123".into()),
        ..Default::default()
    }
}

pub fn request(description: &str) -> SubmitRequest {
    SubmitRequest::new(description)
        .with_scale(JobScale::Medium)
        .with_project_info(project_info())
}

pub fn risks(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            json!({
                "id": format!("h{}", i + 1),
                "hazard": format!("Hazard {}", i + 1),
                "likelihood": 2 + (i % 3) as u8,
                "severity": 3 + (i % 3) as u8,
                "controlMeasure": "Safe isolation to GS38",
                "linkedToStep": i,
            })
        })
        .collect()
}

pub fn progress_patch(progress: i64, step: &str) -> Value {
    json!({
        "status": "in_progress",
        "progress": progress,
        "current_step": step,
    })
}

pub fn complete_patch(hazards: usize) -> Value {
    json!({
        "status": "complete",
        "progress": 100,
        "current_step": "Done",
        "rams_data": {
            "risks": risks(hazards),
            "ppeDetails": [
                {"itemNumber": 1, "ppeType": "Insulated gloves", "standard": "BS EN 60903", "mandatory": true, "purpose": "Shock protection"}
            ],
            "emergencyProcedures": ["Isolate supply and call 999"],
            "complianceRegulations": ["BS 7671:2018+A2:2022"],
        },
    })
}

pub fn failed_patch(message: &str) -> Value {
    json!({
        "status": "failed",
        "error_message": message,
    })
}

/// Row snapshot as the observer would decode it.
pub fn job_row(id: &str, patch: Value) -> GenerationJob {
    let mut row = json!({ "id": id });
    if let (Value::Object(target), Value::Object(patch)) = (&mut row, patch) {
        target.extend(patch);
    }
    GenerationJob::from_row(row).unwrap()
}

pub async fn wait_for_phase(rx: &mut watch::Receiver<JobSnapshot>, phase: Phase) -> JobSnapshot {
    tokio::time::timeout(WAIT, rx.wait_for(|s| s.phase == phase))
        .await
        .expect("timed out waiting for phase")
        .expect("snapshot channel closed")
        .clone()
}

pub async fn wait_for_progress(rx: &mut watch::Receiver<JobSnapshot>, progress: u8) -> JobSnapshot {
    tokio::time::timeout(WAIT, rx.wait_for(|s| s.progress == progress))
        .await
        .expect("timed out waiting for progress")
        .expect("snapshot channel closed")
        .clone()
}

pub async fn next_notification(rx: &mut broadcast::Receiver<Notification>) -> Notification {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification channel closed")
}

/// `update_record` calls issued against `table`, as `(id, fields)`.
pub fn updates_to(backend: &MemoryBackend, table: &str) -> Vec<(String, Value)> {
    backend
        .updates()
        .into_iter()
        .filter(|u| u.table == table)
        .map(|u| (u.id, u.fields))
        .collect()
}

/// Updates issued against the linked table.
pub fn linked_updates(backend: &MemoryBackend) -> Vec<(String, Value)> {
    updates_to(backend, PACKS)
}

/// Wait until `count` updates to `table` have been recorded. The linked
/// record flag is written in the background after completion.
pub async fn wait_for_updates(
    backend: &MemoryBackend,
    table: &str,
    count: usize,
) -> Vec<(String, Value)> {
    tokio::time::timeout(WAIT, async {
        loop {
            let updates = updates_to(backend, table);
            if updates.len() >= count {
                return updates;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for record update")
}

/// Everything already queued on the notification channel.
pub fn drain_notifications(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut received = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(n) => received.push(n),
            Err(TryRecvError::Empty) => return received,
            Err(e) => panic!("notification channel error: {:?}", e),
        }
    }
}

type BackendResult<T> = std::result::Result<T, BackendError>;

/// Which backend call never resolves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stall {
    Create,
    Invoke,
}

/// Wraps [`MemoryBackend`] with one call that hangs forever.
pub struct StalledBackend {
    pub inner: MemoryBackend,
    pub stall: Stall,
}

impl Backend for StalledBackend {
    async fn create_record(&self, table: &str, fields: Value) -> BackendResult<Value> {
        if self.stall == Stall::Create {
            return std::future::pending().await;
        }
        self.inner.create_record(table, fields).await
    }

    async fn update_record(&self, table: &str, id: &str, fields: Value) -> BackendResult<()> {
        self.inner.update_record(table, id, fields).await
    }

    async fn subscribe_to_row_updates(
        &self,
        table: &str,
        id: &str,
        event: RowEvent,
    ) -> BackendResult<Subscription> {
        self.inner.subscribe_to_row_updates(table, id, event).await
    }

    async fn invoke_function(&self, name: &str, payload: Value) -> BackendResult<()> {
        if self.stall == Stall::Invoke {
            return std::future::pending().await;
        }
        self.inner.invoke_function(name, payload).await
    }
}

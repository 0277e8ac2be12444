//! Track a RAMS generation end to end against the in-memory backend.
//!
//! A fake worker advances the job row through a few steps after the
//! coordinator triggers it, then writes a small result.
//!
//! ```sh
//! RUST_LOG=rams_coordinator=debug cargo run --example simulated_generation
//! ```

use rams_coordinator::*;
use serde_json::json;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const JOBS: &str = "rams_generation_jobs";

fn fake_worker(backend: &MemoryBackend, _name: &str, payload: &serde_json::Value) {
    let backend = backend.clone();
    let job_id = payload["jobId"].as_str().unwrap_or_default().to_string();

    tokio::spawn(async move {
        let steps = [
            (15, "Retrieving regulations"),
            (45, "Identifying hazards"),
            (80, "Scoring risks and controls"),
        ];
        for (progress, step) in steps {
            tokio::time::sleep(Duration::from_millis(400)).await;
            backend.push_update(
                JOBS,
                &job_id,
                json!({"status": "in_progress", "progress": progress, "current_step": step}),
            );
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        backend.push_update(
            JOBS,
            &job_id,
            json!({
                "status": "complete",
                "progress": 100,
                "current_step": "Complete",
                "rams_data": {
                    "risks": [
                        {"hazard": "Contact with live conductors", "likelihood": 3, "severity": 5,
                         "controlMeasure": "Safe isolation, lock-off and prove dead"},
                        {"hazard": "Dust from chasing walls", "likelihood": 3, "severity": 2,
                         "controlMeasure": "On-tool extraction, FFP3 mask"}
                    ],
                    "ppeDetails": [
                        {"itemNumber": 1, "ppeType": "Insulated gloves", "standard": "BS EN 60903",
                         "mandatory": true, "purpose": "Protection during live testing"}
                    ],
                    "emergencyProcedures": ["Isolate supply, call 999, start CPR if trained"],
                    "complianceRegulations": ["Electricity at Work Regulations 1989", "BS 7671"]
                }
            }),
        );
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let backend = MemoryBackend::new()
        .with_sequential_ids("job")
        .on_invoke(fake_worker);
    let coordinator = RamsCoordinator::new(backend.clone(), CoordinatorConfig::default());

    let mut snapshots = coordinator.subscribe();
    let mut notifications = coordinator.notifications();
    tokio::spawn(async move {
        while let Ok(n) = notifications.recv().await {
            println!("[notice] {}", n.message());
        }
    });

    let request = SubmitRequest::new("Rewire a three-bed semi, new 18-way consumer unit")
        .with_scale(JobScale::Medium)
        .with_project_info(ProjectInfo {
            project_name: Some("Mill Lane rewire".into()),
            location: Some("Leeds".into()),
            ..Default::default()
        })
        .linked_to("jp-1");
    coordinator.submit(request).await?;

    loop {
        snapshots.changed().await?;
        let snap = snapshots.borrow_and_update().clone();
        println!("{:>3}%  {:<12} {}", snap.progress, snap.phase, snap.current_step);
        if snap.phase.is_terminal() {
            break;
        }
    }

    if coordinator.phase() == Phase::Complete {
        let out = std::env::temp_dir().join(
            coordinator
                .export_file_name()
                .unwrap_or_else(|| "rams.json".into()),
        );
        coordinator.export_to_file(&out).await?;
        println!("Saved {}", out.display());
        println!("Linked record: {:?}", backend.row("job_packs", "jp-1"));
    }

    // Let the notification printer drain.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

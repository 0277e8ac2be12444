//! Submit a RAMS generation job to the hosted backend and follow it live.
//!
//! Reads `RAMS_BACKEND_URL`, `RAMS_BACKEND_KEY` and optionally
//! `RAMS_BACKEND_TOKEN` from the environment or a `.env` file.
//!
//! ```sh
//! cargo run --example remote_generation -- "Install a 32A radial circuit" jp-1
//! ```

use rams_coordinator::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let description = args
        .next()
        .unwrap_or_else(|| "Install a 32A radial circuit for an electric shower".into());
    let linked = args.next();

    let backend = RemoteBackend::new(RemoteConfig::from_env()?);
    let coordinator = RamsCoordinator::new(backend, CoordinatorConfig::default());
    let mut snapshots = coordinator.subscribe();

    let mut request = SubmitRequest::new(description).with_scale(JobScale::Medium);
    if let Some(id) = linked {
        request = request.linked_to(id);
    }
    coordinator.submit(request).await?;

    let last = snapshots
        .wait_for(|s| {
            println!("{:>3}%  {}", s.progress, s.current_step);
            s.phase.is_terminal()
        })
        .await?
        .clone();

    match last.phase {
        Phase::Complete => {
            let name = coordinator
                .export_file_name()
                .unwrap_or_else(|| "rams.json".into());
            coordinator.export_to_file(&name).await?;
            println!("Saved {}", name);
        }
        _ => eprintln!(
            "Failed: {}",
            last.error.unwrap_or_else(|| "unknown error".into())
        ),
    }
    Ok(())
}

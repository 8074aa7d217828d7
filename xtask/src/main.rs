use anyhow::Result;
use clap::{Parser, Subcommand};
use smartops_core::{
    telemetry, ClientState, MockBackend, Provider, SessionHandle, SnapshotStore, TaskKind,
};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for SmartOps")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a lightweight smoke test that exercises the client core logic.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let backend = Arc::new(MockBackend::default());
    let state = ClientState::with_backend(
        SnapshotStore::in_memory(),
        SessionHandle::new(),
        backend.clone(),
    );

    runtime.block_on(state.login("smoke", "smoke"))?;
    runtime.block_on(state.send_chat(Provider::Tongyi, "ping from xtask"))?;
    let task = runtime.block_on(state.orchestrator().submit(
        TaskKind::Generic,
        Provider::Deepseek,
        "smoke diagnostic",
    ))?;

    info!(
        "messages" = state.messages().len(),
        "tasks" = state.tasks().len(),
        "task_status" = task.status.as_str(),
        "smoke test finished"
    );
    Ok(())
}

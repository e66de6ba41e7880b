//! Drives the shell client end to end against the in-memory collaborator.
//!
//! Run with: RUST_LOG=debug cargo run -p shell-demo
//!
//! Nothing is executed: a background task plays the remote side, publishing
//! output, exits and port changes the way a VM would.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmshell_core::{Disposable, Emitter, Event, PortClient, PortInfo, RemoteError};
use vmshell_notify::Ports;
use vmshell_session::{
    MemoryShellClient, RunOptions, ShellConfig, ShellManager, ShellOptions,
};

/// Port list the simulated VM reports.
#[derive(Default)]
struct DemoPorts {
    open: Mutex<Vec<PortInfo>>,
    updated: Emitter<Vec<PortInfo>>,
}

impl DemoPorts {
    fn listen_on(&self, port: u16) {
        let snapshot = {
            let mut open = self.open.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            open.push(PortInfo {
                port,
                hostname: "0.0.0.0".into(),
            });
            open.clone()
        };
        self.updated.fire(snapshot);
    }
}

#[async_trait]
impl PortClient for DemoPorts {
    async fn get_ports(&self) -> Result<Vec<PortInfo>, RemoteError> {
        Ok(self
            .open
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    fn on_ports_updated(&self) -> Event<Vec<PortInfo>> {
        self.updated.event()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let client = Arc::new(MemoryShellClient::new());
    client.finish_on_create("git rev-parse", ["main\n"], 0);
    let manager = ShellManager::new(client.clone(), ShellConfig::from_env()?);

    let _flush = manager.on_will_shutdown().listen(|()| async {
        tracing::info!("Flushing state before shutdown");
        Ok(())
    });

    // A command the remote reports as finished before we subscribe.
    let branch = manager.run("git rev-parse --abbrev-ref HEAD", RunOptions::default()).await?;
    tracing::info!(branch = %branch.await.output, "Resolved branch");

    // A command that streams output, then exits.
    let build = manager
        .run(
            "cargo build",
            RunOptions {
                env: [("CARGO_TERM_COLOR".to_string(), "never".to_string())].into(),
                ..RunOptions::default()
            },
        )
        .await?;
    let _progress = build
        .on_output()
        .listen(|chunk: &String| tracing::info!(chunk = %chunk.trim_end(), "build"));
    let remote = client.clone();
    let id = build.id().to_string();
    tokio::spawn(async move {
        for line in ["Compiling vmshell-core\n", "Compiling vmshell-session\n", "Finished\n"] {
            tokio::time::sleep(Duration::from_millis(50)).await;
            remote.push_output(&id, line);
        }
        remote.exit(&id, 0);
    });
    let result = build.await;
    tracing::info!(exit_code = ?result.exit_code, "Build settled");

    // An interactive dev server, watched for its port.
    let ports_client = Arc::new(DemoPorts::default());
    let ports = Ports::connect(ports_client.clone()).await?;
    let server = manager
        .create(
            "npm run dev",
            ShellOptions {
                name: Some("dev server".into()),
                ..ShellOptions::default()
            },
        )
        .await?;
    let remote = client.clone();
    let id = server.id().to_string();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        remote.push_output(&id, "ready on :3000");
        ports_client.listen_on(3000);
    });
    let port = ports.wait_for_port(3000, Duration::from_secs(2)).await?;
    let mut output = server.output_stream();
    if let Some(line) = output.next().await {
        tracing::info!(shell = %server.name(), %line, port = port.port, "Server up");
    }

    // A run that never exits on its own.
    let watcher = manager.run("tail -f /var/log/app.log", RunOptions::default()).await?;
    watcher.kill().await;
    tracing::info!(exit_code = ?watcher.wait().await.exit_code, "Killed tail");

    println!("{}", serde_json::to_string_pretty(&manager.list().await?)?);

    ports.dispose();
    manager.shutdown().await?;
    Ok(())
}

//! Port open/close detection.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use vmshell_core::{Disposable, DisposableStore, Emitter, Event, PortClient, PortInfo};

use crate::{error::NotifyError, wait::wait_for};

type Snapshot = BTreeMap<u16, PortInfo>;

fn lock(snapshot: &Mutex<Snapshot>) -> MutexGuard<'_, Snapshot> {
    snapshot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Replace the snapshot, returning newly opened ports and newly closed port numbers.
fn apply(snapshot: &Mutex<Snapshot>, ports: &[PortInfo]) -> (Vec<PortInfo>, Vec<u16>) {
    let next: Snapshot = ports.iter().map(|info| (info.port, info.clone())).collect();
    let mut open = lock(snapshot);
    let opened = next
        .values()
        .filter(|info| !open.contains_key(&info.port))
        .cloned()
        .collect();
    let closed = open
        .keys()
        .filter(|port| !next.contains_key(port))
        .copied()
        .collect();
    *open = next;
    (opened, closed)
}

/// Tracks which ports are open inside the VM.
///
/// Each remote batch is diffed against the last known set of port numbers:
/// newly present ports fire [`on_did_port_open`](Self::on_did_port_open),
/// newly absent ones fire [`on_did_port_close`](Self::on_did_port_close).
pub struct Ports {
    open: Arc<Mutex<Snapshot>>,
    did_open: Arc<Emitter<PortInfo>>,
    did_close: Arc<Emitter<u16>>,
    store: DisposableStore,
}

impl Ports {
    /// Fetch the current ports and start following changes.
    ///
    /// Ports open at connect time do not fire open events.
    ///
    /// # Errors
    /// Returns error if the initial snapshot cannot be fetched.
    pub async fn connect(client: Arc<dyn PortClient>) -> Result<Self, NotifyError> {
        let initial = client.get_ports().await?;
        let open = Arc::new(Mutex::new(Snapshot::new()));
        apply(&open, &initial);
        tracing::debug!(ports = initial.len(), "Port snapshot loaded");

        let ports = Self {
            open,
            did_open: Arc::new(Emitter::new()),
            did_close: Arc::new(Emitter::new()),
            store: DisposableStore::new(),
        };
        ports.store.add(Arc::clone(&ports.did_open));
        ports.store.add(Arc::clone(&ports.did_close));

        let open = Arc::clone(&ports.open);
        let did_open = Arc::clone(&ports.did_open);
        let did_close = Arc::clone(&ports.did_close);
        ports.store.push(client.on_ports_updated().listen(move |batch| {
            let (opened, closed) = apply(&open, batch);
            for info in opened {
                tracing::info!(port = info.port, hostname = %info.hostname, "Port opened");
                did_open.fire(info);
            }
            for port in closed {
                tracing::info!(port, "Port closed");
                did_close.fire(port);
            }
        }));
        Ok(ports)
    }

    /// Newly opened ports.
    #[must_use]
    pub fn on_did_port_open(&self) -> Event<PortInfo> {
        self.did_open.event()
    }

    /// Port numbers that stopped listening.
    #[must_use]
    pub fn on_did_port_close(&self) -> Event<u16> {
        self.did_close.event()
    }

    /// All open ports, ordered by port number.
    #[must_use]
    pub fn get_all(&self) -> Vec<PortInfo> {
        lock(&self.open).values().cloned().collect()
    }

    /// The open port `port`, if any.
    #[must_use]
    pub fn get(&self, port: u16) -> Option<PortInfo> {
        lock(&self.open).get(&port).cloned()
    }

    /// Whether `port` is open.
    #[must_use]
    pub fn is_open(&self, port: u16) -> bool {
        lock(&self.open).contains_key(&port)
    }

    /// Wait until `port` is open.
    ///
    /// # Errors
    /// Returns [`NotifyError::Timeout`] if the port does not open within
    /// `timeout`, or [`NotifyError::Disposed`] if this tracker is disposed
    /// first.
    pub async fn wait_for_port(
        &self,
        port: u16,
        timeout: Duration,
    ) -> Result<PortInfo, NotifyError> {
        let event = self.did_open.event();
        let opened = wait_for(
            &event,
            || self.get(port),
            move |info: &PortInfo| info.port == port,
        );
        tokio::time::timeout(timeout, opened)
            .await
            .map_err(|_| NotifyError::Timeout(timeout))?
    }
}

impl Disposable for Ports {
    fn dispose(&self) {
        self.store.dispose();
    }
}

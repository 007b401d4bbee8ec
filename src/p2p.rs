use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::authority::Authority;
use crate::channel::{Channel, PendingNonces};
use crate::connections::Connections;
use crate::error::{Error, NetResult};
use crate::hosts::HostPool;
use crate::sessions::inbound::InboundSession;
use crate::sessions::manual::ManualSession;
use crate::sessions::outbound::OutboundSession;
use crate::sessions::seed::SeedSession;
use crate::sessions::{SessionContext, TaskList};
use crate::settings::Settings;
use crate::wire_protocol::messages::ProtocolMessage;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Everything that only exists while the service runs.
struct Running {
    connections: Connections,
    registry_worker: JoinHandle<()>,
    hosts: Arc<HostPool>,
    manual: ManualSession,
    stop_tx: watch::Sender<bool>,
    tasks: TaskList,
}

struct Lifecycle {
    state: ServiceState,
    running: Option<Running>,
}

/// The top-level peer-to-peer service: seed, manual, inbound and outbound
/// sessions over one shared connections registry, started and stopped as a
/// unit. Start either brings everything up or tears its partial artifacts
/// back down; stop always succeeds and is idempotent.
pub struct P2p {
    settings: Arc<Settings>,
    height: Arc<AtomicU32>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl P2p {
    pub fn new(settings: Settings) -> Self {
        P2p {
            settings: Arc::new(settings),
            height: Arc::new(AtomicU32::new(0)),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                state: ServiceState::Stopped,
                running: None,
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Our current blockchain height, surfaced to peers in outgoing
    /// `version` messages.
    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::Relaxed);
    }

    pub async fn state(&self) -> ServiceState {
        self.lifecycle.lock().await.state
    }

    /// Brings the service up: loads the host cache, spawns the registry,
    /// then runs the seed, manual, inbound and outbound session starts in
    /// that order. Fails fast with `OperationFailed` unless currently
    /// stopped; a failing session tears everything down again.
    pub async fn start(&self) -> NetResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != ServiceState::Stopped {
            return Err(Error::OperationFailed);
        }
        lifecycle.state = ServiceState::Starting;
        log::info!("starting p2p service on {:?}", self.settings.network);

        let hosts = Arc::new(HostPool::new(&self.settings));
        if let Err(code) = hosts.load() {
            lifecycle.state = ServiceState::Stopped;
            return Err(code);
        }

        let (connections, registry_worker) = Connections::spawn();
        let (stop_tx, stop_rx) = watch::channel(false);
        let tasks: TaskList = Default::default();

        let context = SessionContext {
            settings: Arc::clone(&self.settings),
            hosts: Arc::clone(&hosts),
            connections: connections.clone(),
            nonces: PendingNonces::default(),
            height: Arc::clone(&self.height),
            stopping: stop_rx,
            tasks: Arc::clone(&tasks),
            germinations: Arc::new(AtomicUsize::new(0)),
        };

        let manual = ManualSession::new(context.clone());
        let running = Running {
            connections,
            registry_worker,
            hosts,
            manual,
            stop_tx,
            tasks,
        };

        let sessions_up = async {
            SeedSession::new(context.clone()).start().await?;
            running.manual.start().await?;
            InboundSession::new(context.clone()).start().await?;
            OutboundSession::new(context.clone()).start().await?;
            Ok::<(), Error>(())
        };

        match sessions_up.await {
            Ok(()) => {
                lifecycle.running = Some(running);
                lifecycle.state = ServiceState::Started;
                log::info!("p2p service started");
                Ok(())
            }
            Err(code) => {
                log::warn!("p2p service start failed: {}", code);
                // the context holds a registry handle; release it so the
                // registry worker can wind down
                drop(context);
                Self::teardown(running).await;
                lifecycle.state = ServiceState::Stopped;
                Err(code)
            }
        }
    }

    /// Stops every channel with `ChannelStopped`, joins all session tasks
    /// and persists the host cache. Always succeeds; stopping an already
    /// stopped service is a no-op.
    pub async fn stop(&self) -> NetResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == ServiceState::Stopped {
            return Ok(());
        }
        lifecycle.state = ServiceState::Stopping;
        log::info!("stopping p2p service");

        if let Some(running) = lifecycle.running.take() {
            Self::teardown(running).await;
        }

        lifecycle.state = ServiceState::Stopped;
        log::info!("p2p service stopped");
        Ok(())
    }

    async fn teardown(running: Running) {
        let Running {
            connections,
            registry_worker,
            hosts,
            manual,
            stop_tx,
            tasks,
        } = running;

        let _ = stop_tx.send(true);
        connections.clear(Error::ChannelStopped).await;

        // session tasks can spawn follow-up tasks while draining
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut pending = tasks.lock().unwrap();
                pending.drain(..).collect()
            };
            if drained.is_empty() {
                break;
            }
            for task in drained {
                let _ = task.await;
            }
        }

        // the registry worker exits once the last handle is gone
        drop(manual);
        drop(connections);
        let _ = registry_worker.await;

        if let Err(err) = hosts.store() {
            log::warn!("cannot persist hosts file: {}", err);
        }
    }

    /// Connects to one specific peer, bypassing the host pool.
    pub async fn connect(&self, authority: Authority) -> NetResult<Arc<Channel>> {
        let manual = {
            let lifecycle = self.lifecycle.lock().await;
            match (&lifecycle.state, &lifecycle.running) {
                (ServiceState::Started, Some(running)) => running.manual.clone(),
                _ => return Err(Error::OperationFailed),
            }
        };
        manual.connect(authority).await
    }

    /// Sends `message` to every connected peer; yields one result per
    /// channel present at dispatch time.
    pub async fn broadcast(
        &self,
        message: ProtocolMessage,
    ) -> NetResult<mpsc::UnboundedReceiver<(Arc<Channel>, NetResult<()>)>> {
        let connections = self.registry().await?;
        Ok(connections.broadcast(message).await)
    }

    /// Number of channels currently in the registry; zero when stopped.
    pub async fn connection_count(&self) -> usize {
        match self.registry().await {
            Ok(connections) => connections.count().await,
            Err(_) => 0,
        }
    }

    /// Whether a peer with this authority is currently connected.
    pub async fn connected(&self, authority: Authority) -> bool {
        match self.registry().await {
            Ok(connections) => connections.exists(authority).await,
            Err(_) => false,
        }
    }

    async fn registry(&self) -> NetResult<Connections> {
        let lifecycle = self.lifecycle.lock().await;
        match (&lifecycle.state, &lifecycle.running) {
            (ServiceState::Started, Some(running)) => Ok(running.connections.clone()),
            _ => Err(Error::OperationFailed),
        }
    }
}

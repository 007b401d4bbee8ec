use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::authority::Authority;
use crate::channel::{Channel, PendingNonces};
use crate::connections::Connections;
use crate::error::{Error, NetResult};
use crate::hosts::HostPool;
use crate::settings::Settings;
use crate::wire_protocol::handshake::HandshakeDirection;
use crate::wire_protocol::node::{NodeDesc, NodeServiceSet};

pub(crate) mod inbound;
pub(crate) mod manual;
pub(crate) mod outbound;
pub(crate) mod seed;

pub(crate) type TaskList = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// What every session works against: the service's shared collaborators
/// plus the stop signal. Channels a session creates stay its own until it
/// hands them to the registry.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub settings: Arc<Settings>,
    pub hosts: Arc<HostPool>,
    pub connections: Connections,
    pub nonces: PendingNonces,
    pub height: Arc<AtomicU32>,
    pub stopping: watch::Receiver<bool>,
    pub tasks: TaskList,
    /// successful handshakes across the session's lifetime
    pub germinations: Arc<AtomicUsize>,
}

impl SessionContext {
    pub fn stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().unwrap().push(tokio::spawn(future));
    }

    pub fn node_desc(&self) -> NodeDesc {
        NodeDesc {
            chain: self.settings.network,
            protocol_version: self.settings.protocol_version,
            services: NodeServiceSet::from_bitmask(self.settings.services),
            sub_ver: self.settings.user_agent.clone(),
            start_height: self.height.load(Ordering::Relaxed) as i32,
        }
    }

    /// Dials a peer. The blacklist applies on every connect path, host-pool
    /// or not.
    pub async fn connect(&self, authority: Authority) -> NetResult<Arc<Channel>> {
        if self.settings.blacklisted(&authority) {
            return Err(Error::AddressBlocked);
        }
        Channel::connect(authority, self.node_desc(), &self.settings, self.nonces.clone()).await
    }

    /// Wraps an accepted socket into an inbound channel.
    pub fn accept(&self, socket: TcpStream) -> NetResult<Arc<Channel>> {
        Channel::attach(
            socket,
            HandshakeDirection::Inbound,
            self.node_desc(),
            &self.settings,
            self.nonces.clone(),
        )
    }

    /// Runs the channel's handshake and counts the germination.
    pub async fn start_channel(&self, channel: &Arc<Channel>) -> NetResult<()> {
        channel.start().await?;
        self.germinations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Hands the channel to the registry and arranges its removal once it
    /// closes.
    pub async fn register(&self, channel: &Arc<Channel>) -> NetResult<()> {
        self.connections.store(channel).await?;

        let connections = self.connections.clone();
        let watched = Arc::clone(channel);
        self.spawn(async move {
            watched.closed().await;
            let _ = connections.remove(&watched).await;
        });
        Ok(())
    }
}

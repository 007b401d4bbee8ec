use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::authority::Authority;
use crate::channel::Channel;
use crate::error::{Error, NetResult};
use crate::wire_protocol::messages::ProtocolMessage;

/// Work submitted to the registry's serialization task.
enum Directive {
    Store(Arc<Channel>, oneshot::Sender<NetResult<()>>),
    Remove(Arc<Channel>, oneshot::Sender<()>),
    Count(oneshot::Sender<usize>),
    Exists(Authority, oneshot::Sender<bool>),
    Authorities(oneshot::Sender<Vec<Authority>>),
    Clear(Error, oneshot::Sender<()>),
    Broadcast(ProtocolMessage, mpsc::UnboundedSender<(Arc<Channel>, NetResult<()>)>),
}

/// The set of live channels. All mutation and every authoritative query run
/// on one dedicated task, in submission order; the handle only queues work.
/// That one task is what enforces uniqueness of authority and nonce without
/// any lock on the hot path.
#[derive(Clone)]
pub struct Connections {
    queue: mpsc::UnboundedSender<Directive>,
}

impl Connections {
    pub(crate) fn spawn() -> (Self, JoinHandle<()>) {
        let (queue, backlog) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(backlog));
        (Connections { queue }, worker)
    }

    /// Appends a channel. Fails with `AddressInUse` when an entry with the
    /// same authority or the same nonce is already present.
    pub async fn store(&self, channel: &Arc<Channel>) -> NetResult<()> {
        let (done, result) = oneshot::channel();
        self.submit(Directive::Store(Arc::clone(channel), done))?;
        result.await.map_err(|_| Error::ChannelStopped)?
    }

    /// Removes by channel identity. Succeeds even when absent.
    pub async fn remove(&self, channel: &Arc<Channel>) -> NetResult<()> {
        let (done, result) = oneshot::channel();
        self.submit(Directive::Remove(Arc::clone(channel), done))?;
        result.await.map_err(|_| Error::ChannelStopped)
    }

    pub async fn count(&self) -> usize {
        let (done, result) = oneshot::channel();
        if self.submit(Directive::Count(done)).is_err() {
            return 0;
        }
        result.await.unwrap_or(0)
    }

    pub async fn exists(&self, authority: Authority) -> bool {
        let (done, result) = oneshot::channel();
        if self.submit(Directive::Exists(authority, done)).is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    /// Snapshot of the connected authorities, for host-pool selection.
    pub async fn authorities(&self) -> Vec<Authority> {
        let (done, result) = oneshot::channel();
        if self.submit(Directive::Authorities(done)).is_err() {
            return vec![];
        }
        result.await.unwrap_or_default()
    }

    /// Stops every channel with `code` and empties the registry.
    pub async fn clear(&self, code: Error) {
        let (done, result) = oneshot::channel();
        if self.submit(Directive::Clear(code, done)).is_ok() {
            let _ = result.await;
        }
    }

    /// Sends `message` on every channel present at dispatch time,
    /// concurrently. Yields one `(channel, result)` per channel, in no
    /// particular order; a channel racing its own close may legally report
    /// `ChannelStopped` here.
    pub async fn broadcast(&self, message: ProtocolMessage) -> mpsc::UnboundedReceiver<(Arc<Channel>, NetResult<()>)> {
        let (results, receiver) = mpsc::unbounded_channel();
        let _ = self.submit(Directive::Broadcast(message, results));
        receiver
    }

    fn submit(&self, directive: Directive) -> NetResult<()> {
        self.queue.send(directive).map_err(|_| Error::ChannelStopped)
    }

    async fn run(mut backlog: mpsc::UnboundedReceiver<Directive>) {
        let mut channels: Vec<Arc<Channel>> = Vec::new();

        while let Some(directive) = backlog.recv().await {
            match directive {
                Directive::Store(channel, done) => {
                    let duplicate = channels.iter().any(|existing| {
                        existing.nonce() == channel.nonce() || existing.authority() == channel.authority()
                    });
                    let outcome = if duplicate {
                        Err(Error::AddressInUse)
                    } else {
                        channels.push(channel);
                        Ok(())
                    };
                    let _ = done.send(outcome);
                }
                Directive::Remove(channel, done) => {
                    channels.retain(|existing| !Arc::ptr_eq(existing, &channel));
                    let _ = done.send(());
                }
                Directive::Count(done) => {
                    let _ = done.send(channels.len());
                }
                Directive::Exists(authority, done) => {
                    let _ = done.send(channels.iter().any(|existing| existing.authority() == authority));
                }
                Directive::Authorities(done) => {
                    let _ = done.send(channels.iter().map(|existing| existing.authority()).collect());
                }
                Directive::Clear(code, done) => {
                    log::debug!("clearing {} channels: {:?}", channels.len(), code);
                    for channel in channels.drain(..) {
                        channel.stop(code.clone()).await;
                    }
                    let _ = done.send(());
                }
                Directive::Broadcast(message, results) => {
                    for channel in channels.iter() {
                        let channel = Arc::clone(channel);
                        let message = message.clone();
                        let results = results.clone();
                        tokio::spawn(async move {
                            let outcome = channel.send(message).await;
                            let _ = results.send((channel, outcome));
                        });
                    }
                }
            }
        }
    }
}

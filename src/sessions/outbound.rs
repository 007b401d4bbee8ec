use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::channel::Channel;
use crate::error::{Error, NetResult};
use crate::sessions::SessionContext;

/// How long a connection slot waits before re-polling an empty host pool;
/// the pool's insert notification usually wakes it sooner.
const EMPTY_POOL_POLL: Duration = Duration::from_secs(5);

/// Keeps the configured number of outbound channels alive. One maintenance
/// task per slot: fetch an address, dial, handshake, register, then wait for
/// the channel to die and start over.
pub(crate) struct OutboundSession {
    context: SessionContext,
}

impl OutboundSession {
    pub fn new(context: SessionContext) -> Self {
        OutboundSession { context }
    }

    pub async fn start(&self) -> NetResult<()> {
        let settings = &self.context.settings;
        if settings.outbound_connections == 0 || settings.host_pool_capacity == 0 {
            log::debug!("not configured for outbound connections");
            return Ok(());
        }

        for slot in 0..settings.outbound_connections {
            let context = self.context.clone();
            self.context.spawn(Self::maintain(context, slot));
        }
        Ok(())
    }

    async fn maintain(context: SessionContext, slot: usize) {
        let mut stopping = context.stopping.clone();
        let retry_cap = context.settings.connect_timeout().max(Duration::from_secs(1));
        let mut retry = Duration::from_secs(1);

        while !*stopping.borrow() {
            let attempt = tokio::select! {
                outcome = Self::attempt(&context) => outcome,
                _ = stopping.changed() => break,
            };

            match attempt {
                Ok(channel) => {
                    retry = Duration::from_secs(1);
                    log::info!("outbound slot {} connected to {}", slot, channel.authority());
                    tokio::select! {
                        _ = channel.closed() => {}
                        _ = stopping.changed() => break,
                    }
                }
                Err(Error::NotFound) => {
                    // pool is dry; wait for an insert (or give it a nudge)
                    tokio::select! {
                        _ = context.hosts.wait_added() => {}
                        _ = time::sleep(EMPTY_POOL_POLL) => {}
                        _ = stopping.changed() => break,
                    }
                }
                Err(err) => {
                    log::debug!("outbound slot {} attempt failed: {}", slot, err);
                    tokio::select! {
                        _ = time::sleep(retry) => {}
                        _ = stopping.changed() => break,
                    }
                    retry = (retry * 2).min(retry_cap);
                }
            }
        }
    }

    async fn attempt(context: &SessionContext) -> NetResult<Arc<Channel>> {
        let connected = context.connections.authorities().await;
        let address = context.hosts.fetch(&connected)?;

        let channel = context.connect(address.authority).await?;
        context.start_channel(&channel).await?;

        if let Err(err) = context.register(&channel).await {
            // most likely a racing connection to the same peer
            channel.stop(err.clone()).await;
            return Err(err);
        }
        Ok(channel)
    }
}

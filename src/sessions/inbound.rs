use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};

use crate::authority::Authority;
use crate::error::{Error, NetResult};
use crate::sessions::SessionContext;

/// Accept loop for the configured inbound port. Blacklisted peers are
/// dropped before the handshake; the connection limit is enforced against
/// the registry count once the handshake is done.
pub(crate) struct InboundSession {
    context: SessionContext,
}

impl InboundSession {
    pub fn new(context: SessionContext) -> Self {
        InboundSession { context }
    }

    pub async fn start(&self) -> NetResult<()> {
        let settings = &self.context.settings;
        if settings.inbound_connection_limit == 0 {
            log::debug!("not configured for inbound connections");
            return Ok(());
        }

        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.inbound_port);
        let listener = match TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(err) => {
                log::warn!("cannot listen on {}: {}", bind, err);
                return Err(Error::OperationFailed);
            }
        };
        log::info!("accepting inbound connections on {}", bind);

        let context = self.context.clone();
        self.context.spawn(Self::accept_loop(context, listener));
        Ok(())
    }

    async fn accept_loop(context: SessionContext, listener: TcpListener) {
        let mut stopping = context.stopping.clone();

        while !*stopping.borrow() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        if context.settings.blacklisted(&Authority::from(peer)) {
                            log::debug!("dropping blacklisted inbound peer {}", peer);
                            continue;
                        }
                        context.spawn(Self::greet(context.clone(), socket));
                    }
                    Err(err) => log::warn!("accept failed: {}", err),
                },
                _ = stopping.changed() => break,
            }
        }
    }

    async fn greet(context: SessionContext, socket: TcpStream) {
        let channel = match context.accept(socket) {
            Ok(channel) => channel,
            Err(err) => {
                log::debug!("cannot attach inbound socket: {}", err);
                return;
            }
        };

        let mut stopping = context.stopping.clone();
        let started = tokio::select! {
            outcome = context.start_channel(&channel) => outcome,
            _ = stopping.changed() => {
                channel.stop(Error::ChannelStopped).await;
                return;
            }
        };
        if let Err(err) = started {
            log::debug!("inbound handshake with {} failed: {}", channel.authority(), err);
            return;
        }

        // limit check against the registry size at peer-count time
        let count = context.connections.count().await;
        if count >= context.settings.inbound_connection_limit {
            log::debug!("inbound limit reached, dropping {}", channel.authority());
            channel.stop(Error::PeerThrottling).await;
            return;
        }

        if let Err(err) = context.register(&channel).await {
            log::debug!("cannot register inbound {}: {}", channel.authority(), err);
            channel.stop(err).await;
            return;
        }
        log::info!("inbound channel from {} established", channel.authority());
    }
}

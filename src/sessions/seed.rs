use tokio::net::lookup_host;
use tokio::time;

use crate::authority::Authority;
use crate::error::{Error, NetResult};
use crate::sessions::SessionContext;
use crate::wire_protocol::messages::{GetAddrMessage, ProtocolMessage};
use crate::wire_protocol::raw_message::Command;

/// Bootstraps an empty host pool: one short-lived connection per configured
/// seed, asking each for its known addresses. Individual seed failures are
/// absorbed; the session fails only when not a single address was gathered.
pub(crate) struct SeedSession {
    context: SessionContext,
}

impl SeedSession {
    pub fn new(context: SessionContext) -> Self {
        SeedSession { context }
    }

    pub async fn start(&self) -> NetResult<()> {
        let settings = &self.context.settings;
        if settings.host_pool_capacity == 0 {
            log::debug!("not configured for host pool seeding");
            return Ok(());
        }
        if !self.context.hosts.is_empty() {
            log::debug!("host pool already populated, seeding skipped");
            return Ok(());
        }
        if settings.seeds.is_empty() {
            log::warn!("host pool is empty and no seeds are configured");
            return Err(Error::OperationFailed);
        }

        let before = self.context.hosts.len();
        for seed in &settings.seeds {
            if self.context.stopping() {
                break;
            }
            match self.harvest(seed).await {
                Ok(count) => log::info!("seed {} contributed {} addresses", seed, count),
                Err(err) => log::warn!("seed {} failed: {}", seed, err),
            }
        }

        if self.context.hosts.len() > before {
            Ok(())
        } else {
            log::warn!("seeding produced no addresses");
            Err(Error::OperationFailed)
        }
    }

    async fn harvest(&self, seed: &str) -> NetResult<usize> {
        let endpoints = lookup_host(seed).await?;

        for endpoint in endpoints {
            let authority = Authority::from(endpoint);
            match self.harvest_from(authority).await {
                Ok(count) => return Ok(count),
                Err(err) => log::debug!("seed endpoint {} failed: {}", authority, err),
            }
        }
        Err(Error::OperationFailed)
    }

    /// Connect, handshake, `getaddr`, collect one `addr` batch, hang up.
    /// The germination deadline covers everything past the dial; whatever
    /// happens, the channel is closed before returning.
    async fn harvest_from(&self, authority: Authority) -> NetResult<usize> {
        let channel = self.context.connect(authority).await?;
        let mut addresses = channel.subscribe(Command::Addr);

        let deadline = self.context.settings.germination_timeout();
        let harvested = time::timeout(deadline, async {
            self.context.start_channel(&channel).await?;
            channel.send(ProtocolMessage::GetAddr(GetAddrMessage)).await?;
            Ok::<_, Error>(addresses.recv().await)
        })
        .await;

        channel.stop(Error::ChannelStopped).await;

        let batch = match harvested {
            Ok(Ok(Some(ProtocolMessage::Addr(batch)))) => batch,
            Ok(Ok(_)) => return Err(Error::ChannelStopped),
            Ok(Err(code)) => return Err(code),
            Err(_elapsed) => return Err(Error::ChannelTimeout),
        };

        let mut inserted = 0;
        for address in batch.addresses {
            if self.context.hosts.insert(address).is_ok() {
                inserted += 1;
            }
        }
        if inserted == 0 {
            return Err(Error::OperationFailed);
        }
        Ok(inserted)
    }
}

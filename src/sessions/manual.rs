use std::sync::Arc;

use crate::authority::Authority;
use crate::channel::Channel;
use crate::error::NetResult;
use crate::sessions::SessionContext;

/// User-requested connections. No host pool involved; the blacklist still
/// applies.
#[derive(Clone)]
pub(crate) struct ManualSession {
    context: SessionContext,
}

impl ManualSession {
    pub fn new(context: SessionContext) -> Self {
        ManualSession { context }
    }

    pub async fn start(&self) -> NetResult<()> {
        // nothing to do until someone asks for a connection
        Ok(())
    }

    pub async fn connect(&self, authority: Authority) -> NetResult<Arc<Channel>> {
        let channel = self.context.connect(authority).await?;
        self.context.start_channel(&channel).await?;

        if let Err(err) = self.context.register(&channel).await {
            channel.stop(err.clone()).await;
            return Err(err);
        }
        log::info!("manual channel to {} established", authority);
        Ok(channel)
    }
}

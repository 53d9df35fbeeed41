//! Send-only peer channel surface, plus an in-process duplex pair used
//! by tests and single-process embedders.

use crate::params::SetTxParameter;
use anyhow::{anyhow, Result};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Dispatch of labelled parameter bundles to the counterparty. Delivery
/// of inbound bundles is the embedder's job (see
/// [`crate::params::apply_peer_message`]).
#[async_trait::async_trait]
pub trait PeerChannel: Send + Sync {
    async fn send(&self, msg: SetTxParameter) -> Result<()>;
}

/// One endpoint of an in-process duplex channel.
#[derive(Debug)]
pub struct DuplexChannel {
    outgoing: mpsc::UnboundedSender<SetTxParameter>,
    incoming: Mutex<mpsc::UnboundedReceiver<SetTxParameter>>,
}

impl DuplexChannel {
    /// Two endpoints wired to each other.
    pub fn pair() -> (DuplexChannel, DuplexChannel) {
        let (a_to_b, b_incoming) = mpsc::unbounded_channel();
        let (b_to_a, a_incoming) = mpsc::unbounded_channel();

        let a = DuplexChannel {
            outgoing: a_to_b,
            incoming: Mutex::new(a_incoming),
        };
        let b = DuplexChannel {
            outgoing: b_to_a,
            incoming: Mutex::new(b_incoming),
        };

        (a, b)
    }

    /// Next inbound bundle, if one is queued.
    pub fn try_recv(&self) -> Option<SetTxParameter> {
        self.incoming
            .lock()
            .expect("channel lock poisoned")
            .try_recv()
            .ok()
    }
}

#[async_trait::async_trait]
impl PeerChannel for DuplexChannel {
    async fn send(&self, msg: SetTxParameter) -> Result<()> {
        self.outgoing
            .send(msg)
            .map_err(|_| anyhow!("peer channel is closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{params::SubTxId, swap_id::SwapId};

    #[tokio::test]
    async fn bundles_cross_between_the_endpoints() {
        let (a, b) = DuplexChannel::pair();

        let msg = SetTxParameter::new(SwapId::default(), SubTxId::BeamLock);
        a.send(msg.clone()).await.unwrap();

        assert_eq!(b.try_recv(), Some(msg));
        assert_eq!(a.try_recv(), None);
    }

    #[tokio::test]
    async fn sending_into_a_dropped_peer_fails() {
        let (a, b) = DuplexChannel::pair();
        drop(b);

        let msg = SetTxParameter::new(SwapId::default(), SubTxId::Default);
        assert!(a.send(msg).await.is_err());
    }
}

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SwitchError;
use crate::io::BoxedIo;
use crate::multistream;

pub mod mplex;

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Dialer,
    Listener,
}

/// A stream multiplexer protocol.
pub trait StreamMuxer: Send + Sync {
    /// Protocol id negotiated via multistream.
    fn protocol(&self) -> &str;

    /// Take over a negotiated connection and start multiplexing it.
    ///
    /// Must be called from within a tokio runtime.
    fn upgrade(&self, io: BoxedIo, endpoint: Endpoint) -> Arc<dyn MuxedSession>;
}

/// A multiplexed connection.
#[async_trait]
pub trait MuxedSession: Send + Sync {
    /// Open a new outbound logical stream.
    async fn open_stream(&self) -> Result<BoxedIo, SwitchError>;

    /// Wait for the next inbound stream. `None` once the session has ended.
    async fn accept_stream(&self) -> Option<BoxedIo>;

    /// Tear the session down. Open streams observe a reset.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the session has ended, for whatever reason.
    async fn closed(&self);
}

/// Muxers in preference order.
#[derive(Clone, Default)]
pub struct MuxerRegistry {
    muxers: Vec<Arc<dyn StreamMuxer>>,
}

impl MuxerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, muxer: Arc<dyn StreamMuxer>) {
        self.muxers.push(muxer);
    }

    /// Protocol ids in preference order.
    pub fn protocols(&self) -> Vec<String> {
        self.muxers.iter().map(|m| m.protocol().to_string()).collect()
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn StreamMuxer>> {
        self.muxers.iter().find(|m| m.protocol() == protocol).cloned()
    }

    pub fn len(&self) -> usize {
        self.muxers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.muxers.is_empty()
    }

    /// Agree on a muxer with the remote and upgrade the connection with it.
    pub async fn negotiate(
        &self,
        mut io: BoxedIo,
        endpoint: Endpoint,
    ) -> Result<(String, Arc<dyn MuxedSession>), SwitchError> {
        let protocol = match endpoint {
            Endpoint::Dialer => multistream::dialer_select(&mut io, &self.protocols())
                .await
                .map_err(|e| match e {
                    SwitchError::ProtocolNotSupported { protocol } => SwitchError::Muxer {
                        reason: format!("remote supports none of: {}", protocol),
                    },
                    other => other,
                })?,
            Endpoint::Listener => {
                multistream::listener_select(&mut io, |p| self.get(p).is_some()).await?
            }
        };
        let muxer = self.get(&protocol).ok_or_else(|| SwitchError::Muxer {
            reason: format!("negotiated unknown muxer {}", protocol),
        })?;
        Ok((protocol, muxer.upgrade(io, endpoint)))
    }
}

use async_trait::async_trait;
use tokio::sync::mpsc;
use weft_types::PeerInfo;

use crate::error::SwitchError;

/// Where discovery services report the peers they find.
pub type DiscoverySink = mpsc::UnboundedSender<PeerInfo>;

/// A source of peer announcements.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Short name used in logs.
    fn tag(&self) -> &'static str;

    /// Begin reporting peers into `sink`.
    async fn start(&self, sink: DiscoverySink) -> Result<(), SwitchError>;

    /// Stop reporting peers.
    async fn stop(&self);
}

use tokio::io::AsyncWriteExt;
use tracing::debug;
use weft_switch::Stream;

/// Mirror every byte back to the sender, then close our side.
pub async fn echo(protocol: String, stream: Stream) {
    let peer = stream.remote_peer();
    let (mut reader, mut writer) = tokio::io::split(stream);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => {
            let _ = writer.shutdown().await;
            debug!(peer_id = %peer, protocol = %protocol, bytes, "echo finished");
        }
        Err(e) => debug!(peer_id = %peer, protocol = %protocol, error = %e, "echo aborted"),
    }
}

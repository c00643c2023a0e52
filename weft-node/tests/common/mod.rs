//! Helpers shared by the integration suites.
#![allow(dead_code)]

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use weft_node::echo::echo;
use weft_node::{Node, NodeEvent, NodeOptions};
use weft_transport::memory::memory_addr;
use weft_transport::MemoryHub;
use weft_types::constants::ECHO_PROTOCOL;
use weft_types::identity::{keypair_from_seed, peer_id_of};
use weft_types::{DialTarget, Multiaddr, PeerId, PeerInfo};

pub fn peer(seed: u8) -> PeerId {
    peer_id_of(&keypair_from_seed([seed; 32]).unwrap())
}

/// A node with `seed`'s identity listening on `addr`, serving echo.
pub fn echo_node(seed: u8, addr: Multiaddr, options: NodeOptions) -> Node {
    let node = Node::new(PeerInfo::new(peer(seed)).with_addr(addr), None, options).unwrap();
    node.handle(ECHO_PROTOCOL, echo);
    node
}

/// A started echo node on a memory hub.
pub async fn memory_node(seed: u8, hub: &MemoryHub) -> Node {
    let node = echo_node(seed, memory_addr(0), NodeOptions::memory(hub.clone()));
    node.start().await.unwrap();
    node
}

/// Send `payload` over an echo stream in `chunks` writes and return what came back.
pub async fn echo_roundtrip(
    node: &Node,
    target: impl Into<DialTarget>,
    payload: Vec<u8>,
    chunks: usize,
) -> Vec<u8> {
    let stream = node.dial_protocol(target, ECHO_PROTOCOL).await.unwrap();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let writer_task = tokio::spawn(async move {
        let chunk_size = payload.len().div_ceil(chunks.max(1)).max(1);
        for chunk in payload.chunks(chunk_size) {
            writer.write_all(chunk).await.unwrap();
        }
        writer.shutdown().await.unwrap();
    });
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), reader.read_to_end(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    writer_task.await.unwrap();
    received
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub async fn next_event(rx: &mut broadcast::Receiver<NodeEvent>) -> NodeEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event in time")
        .expect("event channel closed")
}

/// Poll `condition` until it holds, failing after ten seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

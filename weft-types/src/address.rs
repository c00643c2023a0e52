use std::net::{IpAddr, SocketAddr};

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use crate::error::TypesError;

/// Parse a multiaddr string.
pub fn parse_multiaddr(s: &str) -> Result<Multiaddr, TypesError> {
    s.trim()
        .parse::<Multiaddr>()
        .map_err(|e| TypesError::InvalidMultiaddr {
            addr: s.to_string(),
            reason: e.to_string(),
        })
}

/// Parse a base58 peer id string.
pub fn parse_peer_id(s: &str) -> Result<PeerId, TypesError> {
    s.trim().parse::<PeerId>().map_err(|e| TypesError::InvalidPeerId {
        id: s.to_string(),
        reason: e.to_string(),
    })
}

/// The peer id carried by the trailing `/p2p/<id>` component, if any.
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter()
        .filter_map(|p| match p {
            Protocol::P2p(id) => Some(id),
            _ => None,
        })
        .last()
}

/// Append `/p2p/<peer_id>` unless the address already names a peer.
pub fn with_peer_id(addr: &Multiaddr, peer_id: PeerId) -> Multiaddr {
    if peer_id_of(addr).is_some() {
        addr.clone()
    } else {
        addr.clone().with(Protocol::P2p(peer_id))
    }
}

/// Strip every `/p2p/<id>` component.
pub fn without_peer_id(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .filter(|p| !matches!(p, Protocol::P2p(_)))
        .collect()
}

/// The socket address of an `/ip4|ip6/<host>/tcp/<port>` prefix.
///
/// Anything after the tcp component is ignored, so star addresses resolve
/// to their signalling server.
pub fn socket_addr_of(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut iter = addr.iter();
    let ip: IpAddr = match iter.next()? {
        Protocol::Ip4(ip) => ip.into(),
        Protocol::Ip6(ip) => ip.into(),
        _ => return None,
    };
    match iter.next()? {
        Protocol::Tcp(port) => Some(SocketAddr::new(ip, port)),
        _ => None,
    }
}

/// True for a plain `/ip*/<host>/tcp/<port>` address, optionally followed by `/p2p/<id>`.
pub fn is_tcp_addr(addr: &Multiaddr) -> bool {
    socket_addr_of(addr).is_some() && addr.iter().skip(2).all(|p| matches!(p, Protocol::P2p(_)))
}

/// Build `/ip*/<host>/tcp/<port>` from a socket address.
pub fn from_socket_addr(addr: SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => Protocol::Ip4(ip),
        IpAddr::V6(ip) => Protocol::Ip6(ip),
    };
    Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{keypair_from_seed, peer_id_of as key_peer_id};

    fn test_peer() -> PeerId {
        key_peer_id(&keypair_from_seed([1u8; 32]).unwrap())
    }

    #[test]
    fn test_peer_id_of_trailing_component() {
        let peer = test_peer();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", peer)
            .parse()
            .unwrap();
        assert_eq!(peer_id_of(&addr), Some(peer));
    }

    #[test]
    fn test_peer_id_of_ipfs_alias() {
        let peer = test_peer();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/ipfs/{}", peer)
            .parse()
            .unwrap();
        assert_eq!(peer_id_of(&addr), Some(peer));
    }

    #[test]
    fn test_peer_id_of_missing() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert_eq!(peer_id_of(&addr), None);
    }

    #[test]
    fn test_with_and_without_peer_id() {
        let peer = test_peer();
        let base: Multiaddr = "/memory/42".parse().unwrap();
        let full = with_peer_id(&base, peer);
        assert_eq!(peer_id_of(&full), Some(peer));
        // Idempotent once a peer is present.
        assert_eq!(with_peer_id(&full, peer), full);
        assert_eq!(without_peer_id(&full), base);
    }

    #[test]
    fn test_socket_addr_of() {
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/9090/ws/p2p-websocket-star".parse().unwrap();
        assert_eq!(socket_addr_of(&addr), Some("10.0.0.1:9090".parse().unwrap()));

        let udp: Multiaddr = "/ip4/10.0.0.1/udp/9090".parse().unwrap();
        assert_eq!(socket_addr_of(&udp), None);
    }

    #[test]
    fn test_is_tcp_addr() {
        let peer = test_peer();
        assert!(is_tcp_addr(&"/ip4/127.0.0.1/tcp/1".parse().unwrap()));
        assert!(is_tcp_addr(
            &format!("/ip6/::1/tcp/1/p2p/{}", peer).parse().unwrap()
        ));
        assert!(!is_tcp_addr(&"/ip4/127.0.0.1/tcp/1/ws".parse().unwrap()));
        assert!(!is_tcp_addr(&"/memory/1".parse().unwrap()));
    }

    #[test]
    fn test_from_socket_addr() {
        let sa: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let addr = from_socket_addr(sa);
        assert_eq!(addr.to_string(), "/ip4/127.0.0.1/tcp/4001");
        assert_eq!(socket_addr_of(&addr), Some(sa));
    }

    #[test]
    fn test_parse_multiaddr_invalid() {
        let result = parse_multiaddr("not-a-multiaddr");
        assert!(matches!(result, Err(TypesError::InvalidMultiaddr { .. })));
    }

    #[test]
    fn test_parse_peer_id_roundtrip() {
        let peer = test_peer();
        assert_eq!(parse_peer_id(&peer.to_string()).unwrap(), peer);
        assert!(parse_peer_id("nope").is_err());
    }
}

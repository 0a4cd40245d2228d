//! Multi-node scenarios over the in-memory transport

use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::Framed;
use unicity_p2p::core::{BlockHash, BlockHeader, NetworkParams, PowVerifier, Sha256dPow};
use unicity_p2p::network::anchors::ANCHORS_FILE;
use unicity_p2p::network::transport::BoxedStream;
use unicity_p2p::network::{
    ConnectionType, MemoryNetwork, MemoryTransport, Message, MessageCodec, NetworkAddress, Node,
    NodeConfig, PeerState, ServiceFlags, Transport, VersionMessage,
};
use unicity_p2p::util::MockClock;

const PORT: u16 = 29590;

struct TestNet {
    network: Arc<MemoryNetwork>,
    clock: Arc<MockClock>,
}

impl TestNet {
    fn new() -> Self {
        let params = NetworkParams::regtest();
        Self {
            network: MemoryNetwork::new(),
            clock: MockClock::new(params.genesis.time as i64 + 3600),
        }
    }

    fn addr(last_octet: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), PORT)
    }

    async fn node(&self, last_octet: u8, config: NodeConfig) -> Node {
        let transport = Arc::new(MemoryTransport::new(
            self.network.clone(),
            Ipv4Addr::new(10, 0, 0, last_octet),
        ));
        let config = NodeConfig {
            port: Some(PORT),
            ..config
        };
        let node = Node::new(config, transport, self.clock.clone()).unwrap();
        node.listen().await.unwrap();
        let runner = node.clone();
        tokio::spawn(async move { runner.run().await });
        node
    }

    /// Raw protocol speaker used to play a misbehaving peer
    async fn raw_peer(&self, last_octet: u8, target: SocketAddr) -> Framed<BoxedStream, MessageCodec> {
        let transport = MemoryTransport::new(self.network.clone(), Ipv4Addr::new(10, 0, 0, last_octet));
        let stream = transport.connect(target).await.unwrap();
        Framed::new(stream, MessageCodec::new(NetworkParams::regtest().magic))
    }
}

async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn ready_peers(node: &Node) -> usize {
    node.peer_info()
        .await
        .iter()
        .filter(|p| p.state == PeerState::Ready)
        .count()
}

async fn connect(from: &Node, to: SocketAddr) {
    from.connect_to(to, ConnectionType::Manual).await.unwrap();
    assert!(wait_until(|| async { ready_peers(from).await == 1 }).await);
}

async fn handshake(raw: &mut Framed<BoxedStream, MessageCodec>, nonce: u64) {
    raw.send(Message::Version(VersionMessage::new(1, 0, nonce, 0)))
        .await
        .unwrap();
    loop {
        let frame = raw.next().await.unwrap().unwrap();
        if frame.message == Message::Verack {
            break;
        }
    }
    raw.send(Message::Verack).await.unwrap();
}

/// Solved headers that chain onto a parent nobody has
fn orphan_headers(count: usize) -> Vec<BlockHeader> {
    let params = NetworkParams::regtest();
    let pow = Sha256dPow::new(params.pow_limit_bits);
    let mut prev = BlockHash([0x66; 32]);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let mut header = BlockHeader {
            version: 1,
            prev_hash: prev,
            miner_address: [0x66; 20],
            time: params.genesis.time + 10 + i as u32,
            bits: params.pow_limit_bits,
            nonce: 0,
            hash_randomx: BlockHash::ZERO,
        };
        assert!(pow.solve(&mut header, 10_000));
        prev = header.hash();
        out.push(header);
    }
    out
}

/// Read until the node closes the connection
async fn expect_closed(raw: &mut Framed<BoxedStream, MessageCodec>) -> bool {
    let closed = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(frame) = raw.next().await {
            if frame.is_err() {
                break;
            }
        }
    });
    closed.await.is_ok()
}

#[tokio::test]
async fn test_nodes_converge_on_new_blocks() {
    let net = TestNet::new();
    let a = net.node(1, NodeConfig::regtest()).await;
    let b = net.node(2, NodeConfig::regtest()).await;
    connect(&b, TestNet::addr(1)).await;

    let hashes = a.generate_blocks(20, [1; 20]).await.unwrap();
    assert!(wait_until(|| async { b.height().await == 20 }).await);
    assert_eq!(b.tip_hash().await, hashes[19]);
}

#[tokio::test]
async fn test_initial_sync_spans_multiple_batches() {
    let net = TestNet::new();
    let a = net.node(1, NodeConfig::regtest()).await;
    let b = net.node(2, NodeConfig::regtest()).await;
    let hashes = a.generate_blocks(2500, [1; 20]).await.unwrap();

    connect(&b, TestNet::addr(1)).await;
    assert!(wait_until(|| async { b.height().await == 2500 }).await);
    assert_eq!(b.tip_hash().await, hashes[2499]);
}

#[tokio::test]
async fn test_heavier_chain_wins() {
    let net = TestNet::new();
    let a = net.node(1, NodeConfig::regtest()).await;
    let b = net.node(2, NodeConfig::regtest()).await;
    a.generate_blocks(5, [1; 20]).await.unwrap();
    let heavier = b.generate_blocks(8, [2; 20]).await.unwrap();

    connect(&b, TestNet::addr(1)).await;
    assert!(wait_until(|| async { a.tip_hash().await == heavier[7] }).await);
    assert_eq!(a.height().await, 8);
    assert_eq!(b.tip_hash().await, heavier[7]);
}

#[tokio::test]
async fn test_equal_work_keeps_first_seen() {
    let net = TestNet::new();
    let a = net.node(1, NodeConfig::regtest()).await;
    let b = net.node(2, NodeConfig::regtest()).await;
    let a_chain = a.generate_blocks(5, [1; 20]).await.unwrap();
    let b_chain = b.generate_blocks(5, [2; 20]).await.unwrap();

    connect(&b, TestNet::addr(1)).await;
    assert!(wait_until(|| async { a.chain_tips().await.len() == 2 }).await);
    assert!(wait_until(|| async { b.chain_tips().await.len() == 2 }).await);
    assert_eq!(a.tip_hash().await, a_chain[4]);
    assert_eq!(b.tip_hash().await, b_chain[4]);
}

#[tokio::test]
async fn test_invalidate_falls_back_to_fork() {
    let net = TestNet::new();
    let a = net.node(1, NodeConfig::regtest()).await;
    let b = net.node(2, NodeConfig::regtest()).await;
    let main = a.generate_blocks(10, [1; 20]).await.unwrap();
    let fork = b.generate_blocks(7, [2; 20]).await.unwrap();

    connect(&b, TestNet::addr(1)).await;
    assert!(wait_until(|| async { a.chain_tips().await.len() == 2 }).await);
    assert_eq!(a.tip_hash().await, main[9]);

    a.invalidate_block(&main[2]).await.unwrap();
    assert_eq!(a.height().await, 7);
    assert_eq!(a.tip_hash().await, fork[6]);
}

#[tokio::test]
async fn test_orphan_flood_disconnects_attacker() {
    let net = TestNet::new();
    let a = net.node(1, NodeConfig::regtest()).await;
    a.generate_blocks(3, [1; 20]).await.unwrap();
    let tip = a.tip_hash().await;

    let mut attacker = net.raw_peer(66, TestNet::addr(1)).await;
    handshake(&mut attacker, 0xdead).await;
    attacker.send(Message::Headers(orphan_headers(1000))).await.unwrap();

    assert!(expect_closed(&mut attacker).await);
    let attacker_ip: IpAddr = "10.0.0.66".parse().unwrap();
    assert!(wait_until(|| async { a.banman.lock().await.is_discouraged(&attacker_ip) }).await);
    // Orphans attributed to the attacker go with it
    assert!(wait_until(|| async { a.status().await.orphan_headers == 0 }).await);
    assert_eq!(a.height().await, 3);
    assert_eq!(a.tip_hash().await, tip);

    // Discouraged addresses are refused on reconnect
    let mut again = net.raw_peer(66, TestNet::addr(1)).await;
    assert!(expect_closed(&mut again).await);
    assert!(wait_until(|| async { a.status().await.peers == 0 }).await);
}

#[tokio::test]
async fn test_whitelisted_peer_is_not_disconnected() {
    let net = TestNet::new();
    let config = NodeConfig {
        whitelist: vec!["10.0.0.66".parse().unwrap()],
        ..NodeConfig::regtest()
    };
    let a = net.node(1, config).await;

    let mut peer = net.raw_peer(66, TestNet::addr(1)).await;
    handshake(&mut peer, 0xbeef).await;
    peer.send(Message::Headers(orphan_headers(200))).await.unwrap();

    assert!(
        wait_until(|| async {
            a.peer_info()
                .await
                .first()
                .map(|p| p.misbehavior_score >= 100)
                .unwrap_or(false)
        })
        .await
    );
    assert_eq!(a.status().await.peers, 1);
    assert!(!a.banman.lock().await.is_discouraged(&"10.0.0.66".parse().unwrap()));
}

#[tokio::test]
async fn test_banned_address_refused() {
    let net = TestNet::new();
    let a = net.node(1, NodeConfig::regtest()).await;
    let b = net.node(2, NodeConfig::regtest()).await;
    a.ban("10.0.0.2".parse().unwrap(), 0).await;

    b.connect_to(TestNet::addr(1), ConnectionType::Manual).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(wait_until(|| async { b.status().await.peers == 0 }).await);
    assert_eq!(a.status().await.peers, 0);

    assert!(a.unban("10.0.0.2".parse().unwrap()).await);
    connect(&b, TestNet::addr(1)).await;
}

#[tokio::test]
async fn test_self_connection_dropped() {
    let net = TestNet::new();
    let a = net.node(1, NodeConfig::regtest()).await;
    let listen = a.listen_addr().await.unwrap();

    assert!(a.connect_to(listen, ConnectionType::Manual).await.is_err());

    // Reaching ourselves through another address is caught by the nonce
    let mut raw = net.raw_peer(9, listen).await;
    raw.send(Message::Version(VersionMessage::new(1, 0, a.local_nonce(), 0)))
        .await
        .unwrap();
    assert!(expect_closed(&mut raw).await);
}

#[tokio::test]
async fn test_addresses_shared_with_outbound_peer() {
    let net = TestNet::new();
    let a = net.node(1, NodeConfig::regtest()).await;
    {
        let mut addrman = a.addrman.lock().await;
        for i in 0..5u8 {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 0, i + 1)), PORT);
            assert!(addrman.add(NetworkAddress::from_socket_addr(addr, ServiceFlags::NODE_NETWORK), 0));
        }
    }

    let config = NodeConfig {
        max_outbound: 0,
        ..NodeConfig::regtest()
    };
    let b = net.node(2, config).await;
    connect(&b, TestNet::addr(1)).await;
    assert!(wait_until(|| async { b.addrman.lock().await.size() >= 5 }).await);

    // Inbound-only answers: a never learns b's table
    assert_eq!(a.addrman.lock().await.size(), 5);
}

#[tokio::test]
async fn test_outbound_peer_kept_as_anchor_across_restart() {
    let net = TestNet::new();
    let dir = tempfile::tempdir().unwrap();
    let config = NodeConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..NodeConfig::regtest()
    };
    let a = net.node(1, NodeConfig::regtest()).await;

    let b = net.node(2, config.clone()).await;
    b.connect_to(TestNet::addr(1), ConnectionType::Outbound).await.unwrap();
    assert!(wait_until(|| async { ready_peers(&b).await == 1 }).await);
    b.shutdown().await;
    let anchors = dir.path().join(ANCHORS_FILE);
    assert!(wait_until(|| async { anchors.exists() }).await);

    // Restarted under a new address, the node goes straight back to its anchor
    let restarted = net.node(3, config).await;
    assert_eq!(restarted.connect_anchors().await, 1);
    assert!(!anchors.exists());
    assert!(wait_until(|| async { ready_peers(&restarted).await == 1 }).await);
    assert_eq!(restarted.peer_info().await[0].addr, TestNet::addr(1));
    assert!(a.status().await.peers >= 1);
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let net = TestNet::new();
    let a = net.node(1, NodeConfig::regtest()).await;

    let mut raw = net.raw_peer(7, TestNet::addr(1)).await;
    assert!(wait_until(|| async { a.status().await.peers == 1 }).await);

    net.clock.advance(Duration::from_secs(61));
    assert!(expect_closed(&mut raw).await);
    assert!(wait_until(|| async { a.status().await.peers == 0 }).await);
    // A handshake timeout is not misbehavior
    assert!(!a.banman.lock().await.is_discouraged(&"10.0.0.7".parse().unwrap()));
}

#[tokio::test]
async fn test_announcements_reach_late_joiner() {
    let net = TestNet::new();
    let a = net.node(1, NodeConfig::regtest()).await;
    a.generate_blocks(4, [1; 20]).await.unwrap();

    let mut raw = net.raw_peer(8, TestNet::addr(1)).await;
    handshake(&mut raw, 0x5eed).await;

    // The tip is announced as soon as the handshake completes
    let tip = a.tip_hash().await;
    let announced = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(frame)) = raw.next().await {
            if let Message::Inv(inv) = frame.message {
                return inv.iter().any(|i| i.hash == tip);
            }
        }
        false
    })
    .await;
    assert_eq!(announced.ok(), Some(true));
}

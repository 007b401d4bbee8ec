//! End-to-end service tests against in-process peers speaking the raw wire
//! protocol over localhost sockets.

use std::net::SocketAddr;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use bitcoin_net::authority::{Authority, NetworkAddress};
use bitcoin_net::channel::ChannelState;
use bitcoin_net::error::Error;
use bitcoin_net::p2p::{P2p, ServiceState};
use bitcoin_net::settings::Settings;
use bitcoin_net::wire_protocol::buffer::IOBuffer;
use bitcoin_net::wire_protocol::messages::{
    AddrMessage, GetAddrMessage, PingMessage, PongMessage, ProtocolMessage, VerackMessage,
    VersionMessage,
};
use bitcoin_net::wire_protocol::node::{Chain, NodeDesc, NodeService, NodeServiceSet};
use bitcoin_net::wire_protocol::raw_message::{Command, MessageParseOutcome, RawMessage};

const PEER_NONCE: u64 = 0xFEED_FACE_CAFE_BEEF;

fn peer_desc(chain: Chain) -> NodeDesc {
    NodeDesc {
        chain,
        protocol_version: 70016,
        services: NodeServiceSet(vec![NodeService::NodeNetwork]),
        sub_ver: "/fakenode:0.1/".to_string(),
        start_height: 100,
    }
}

/// A scripted remote node: answers `version` with its own version plus
/// verack, `getaddr` with a fixed batch, `ping` with `pong`.
async fn serve_peer(mut socket: TcpStream, chain: Chain, addresses: Vec<NetworkAddress>) {
    let me = peer_desc(chain);
    let remote = match socket.peer_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let mut buffer = IOBuffer::default();

    loop {
        let n = match socket.read(buffer.expose_writable_part()).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buffer.register_added_content(n);

        loop {
            match RawMessage::try_consume_message(&mut buffer, chain) {
                Ok(MessageParseOutcome::Message(raw)) => {
                    let Ok(message) = ProtocolMessage::try_from(raw) else {
                        return;
                    };
                    let replies = match message {
                        ProtocolMessage::Version(_) => vec![
                            ProtocolMessage::Version(VersionMessage::new(remote, PEER_NONCE, &me)),
                            ProtocolMessage::Verack(VerackMessage),
                        ],
                        ProtocolMessage::GetAddr(_) => {
                            vec![ProtocolMessage::Addr(AddrMessage {
                                addresses: addresses.clone(),
                            })]
                        }
                        ProtocolMessage::Ping(ping) => {
                            vec![ProtocolMessage::Pong(PongMessage { nonce: ping.nonce })]
                        }
                        _ => vec![],
                    };
                    for reply in replies {
                        if socket.write_all(&reply.to_bytes(chain)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(MessageParseOutcome::SkippedMessage) => {}
                Ok(MessageParseOutcome::NoMessage) => break,
                Err(_) => return,
            }
        }
    }
}

/// Binds a scripted peer on an ephemeral localhost port.
async fn spawn_peer(chain: Chain, addresses: Vec<NetworkAddress>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_peer(socket, chain, addresses.clone()));
        }
    });
    addr
}

fn no_connection_settings(dir: &TempDir) -> Settings {
    let mut settings = Settings::testnet();
    settings.threads = 1;
    settings.host_pool_capacity = 0;
    settings.outbound_connections = 0;
    settings.inbound_connection_limit = 0;
    settings.seeds = vec![];
    settings.hosts_file = dir.path().join("hosts.cache");
    settings
}

fn one_seed_settings(dir: &TempDir, seed: SocketAddr) -> Settings {
    let mut settings = no_connection_settings(dir);
    settings.host_pool_capacity = 42;
    settings.seeds = vec![seed.to_string()];
    settings
}

fn harvested() -> Vec<NetworkAddress> {
    vec![NetworkAddress::from_authority("10.0.0.1:18333".parse().unwrap())]
}

async fn wait_for_connections(network: &P2p, expected: usize) {
    time::timeout(Duration::from_secs(5), async {
        loop {
            if network.connection_count().await == expected {
                return;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("connection count never settled");
}

#[test]
fn height_default_is_zero_and_accessor_round_trips() {
    let dir = TempDir::new().unwrap();
    let network = P2p::new(no_connection_settings(&dir));
    assert_eq!(network.height(), 0);
    network.set_height(42);
    assert_eq!(network.height(), 42);
}

#[tokio::test]
async fn start_stop_without_sessions() {
    let dir = TempDir::new().unwrap();
    let network = P2p::new(no_connection_settings(&dir));
    assert_eq!(network.start().await, Ok(()));
    assert_eq!(network.state().await, ServiceState::Started);
    assert_eq!(network.stop().await, Ok(()));
    assert_eq!(network.state().await, ServiceState::Stopped);
}

#[tokio::test]
async fn double_start_fails_fast() {
    let dir = TempDir::new().unwrap();
    let network = P2p::new(no_connection_settings(&dir));
    assert_eq!(network.start().await, Ok(()));
    assert_eq!(network.start().await, Err(Error::OperationFailed));
    assert_eq!(network.stop().await, Ok(()));
}

#[tokio::test]
async fn stop_of_stopped_service_succeeds() {
    let dir = TempDir::new().unwrap();
    let network = P2p::new(no_connection_settings(&dir));
    assert_eq!(network.stop().await, Ok(()));
    assert_eq!(network.stop().await, Ok(()));
}

#[tokio::test]
async fn seed_session_start_stop_start() {
    let dir = TempDir::new().unwrap();
    let peer = spawn_peer(Chain::Testnet3, harvested()).await;
    let network = P2p::new(one_seed_settings(&dir, peer));

    assert_eq!(network.start().await, Ok(()));
    assert_eq!(network.stop().await, Ok(()));

    // the harvest was persisted; the second start seeds from the cache file
    let cache = std::fs::read_to_string(dir.path().join("hosts.cache")).unwrap();
    assert!(cache.contains("10.0.0.1:18333"));

    assert_eq!(network.start().await, Ok(()));
    assert_eq!(network.stop().await, Ok(()));
}

#[tokio::test]
async fn seed_handshake_timeout_fails_start_but_not_stop() {
    let dir = TempDir::new().unwrap();
    let peer = spawn_peer(Chain::Testnet3, harvested()).await;
    let mut settings = one_seed_settings(&dir, peer);
    settings.channel_handshake_seconds = 0;
    let network = P2p::new(settings);

    // the timeout on the individual connection is absorbed; zero harvested
    // addresses is what fails the start
    assert_eq!(network.start().await, Err(Error::OperationFailed));
    assert_eq!(network.state().await, ServiceState::Stopped);
    assert_eq!(network.stop().await, Ok(()));
}

#[tokio::test]
async fn seed_connect_timeout_fails_start_but_not_stop() {
    let dir = TempDir::new().unwrap();
    // TEST-NET-2, guaranteed to blackhole the dial
    let unreachable: SocketAddr = "192.0.2.1:18333".parse().unwrap();
    let mut settings = one_seed_settings(&dir, unreachable);
    settings.connect_timeout_seconds = 0;
    settings.channel_germination_seconds = 2;
    let network = P2p::new(settings);

    assert_eq!(network.start().await, Err(Error::OperationFailed));
    assert_eq!(network.stop().await, Ok(()));
}

#[tokio::test]
async fn fully_blacklisted_seed_fails_start_but_not_stop() {
    let dir = TempDir::new().unwrap();
    let peer = spawn_peer(Chain::Testnet3, harvested()).await;
    let mut settings = one_seed_settings(&dir, peer);
    settings.blacklists = vec![Authority::from(peer)];
    let network = P2p::new(settings);

    assert_eq!(network.start().await, Err(Error::OperationFailed));
    assert_eq!(network.stop().await, Ok(()));
}

#[tokio::test]
async fn manual_connect_broadcast_and_stop() {
    let dir = TempDir::new().unwrap();
    let peer = spawn_peer(Chain::Testnet3, vec![]).await;
    let network = P2p::new(no_connection_settings(&dir));
    network.start().await.unwrap();

    let channel = network.connect(Authority::from(peer)).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Established);
    let peer_desc = channel.peer_desc().unwrap();
    assert_eq!(peer_desc.sub_ver, "/fakenode:0.1/");
    assert_eq!(network.connection_count().await, 1);
    assert!(network.connected(Authority::from(peer)).await);

    // a second channel to the same authority violates uniqueness
    assert!(matches!(
        network.connect(Authority::from(peer)).await,
        Err(Error::AddressInUse)
    ));

    let mut pongs = channel.subscribe(Command::Pong);
    let mut results = network
        .broadcast(ProtocolMessage::Ping(PingMessage { nonce: 7 }))
        .await
        .unwrap();
    let (_, outcome) = time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Ok(()));

    let pong = time::timeout(Duration::from_secs(5), pongs.recv()).await.unwrap();
    assert_eq!(pong, Some(ProtocolMessage::Pong(PongMessage { nonce: 7 })));

    // the pong was post-handshake traffic, so the channel germinated
    assert!(channel.germinated().await);

    network.stop().await.unwrap();
    assert_eq!(network.connection_count().await, 0);
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(channel.last_error(), Some(Error::ChannelStopped));

    // no revival after stop
    assert!(network
        .broadcast(ProtocolMessage::GetAddr(GetAddrMessage))
        .await
        .is_err());
}

#[tokio::test]
async fn manual_connect_honors_blacklist() {
    let dir = TempDir::new().unwrap();
    let peer = spawn_peer(Chain::Testnet3, vec![]).await;
    let mut settings = no_connection_settings(&dir);
    settings.blacklists = vec![Authority::from(peer)];
    let network = P2p::new(settings);
    network.start().await.unwrap();

    assert!(matches!(
        network.connect(Authority::from(peer)).await,
        Err(Error::AddressBlocked)
    ));
    network.stop().await.unwrap();
}

#[tokio::test]
async fn outbound_session_fills_from_the_host_pool() {
    let dir = TempDir::new().unwrap();
    let peer = spawn_peer(Chain::Testnet3, vec![]).await;

    let mut settings = no_connection_settings(&dir);
    settings.host_pool_capacity = 42;
    settings.outbound_connections = 1;
    std::fs::write(
        &settings.hosts_file,
        format!("# cached peers\n{}\n", Authority::from(peer)),
    )
    .unwrap();

    let network = P2p::new(settings);
    network.start().await.unwrap();
    wait_for_connections(&network, 1).await;
    assert!(network.connected(Authority::from(peer)).await);
    network.stop().await.unwrap();
}

/// Raw inbound client: dials the service and completes the handshake from
/// the far side.
async fn client_handshake(addr: SocketAddr, chain: Chain) -> TcpStream {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let me = peer_desc(chain);
    let version = ProtocolMessage::Version(VersionMessage::new(addr, PEER_NONCE, &me));
    socket.write_all(&version.to_bytes(chain)).await.unwrap();

    let mut buffer = IOBuffer::default();
    let mut version_seen = false;
    let mut verack_seen = false;
    while !(version_seen && verack_seen) {
        let n = socket.read(buffer.expose_writable_part()).await.unwrap();
        assert_ne!(n, 0, "service hung up during handshake");
        buffer.register_added_content(n);
        loop {
            match RawMessage::try_consume_message(&mut buffer, chain).unwrap() {
                MessageParseOutcome::Message(raw) => {
                    match ProtocolMessage::try_from(raw).unwrap() {
                        ProtocolMessage::Version(_) => {
                            version_seen = true;
                            let verack = ProtocolMessage::Verack(VerackMessage);
                            socket.write_all(&verack.to_bytes(chain)).await.unwrap();
                        }
                        ProtocolMessage::Verack(_) => verack_seen = true,
                        _ => {}
                    }
                }
                MessageParseOutcome::SkippedMessage => {}
                MessageParseOutcome::NoMessage => break,
            }
        }
    }
    socket
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn inbound_session_accepts_and_registers_peers() {
    let dir = TempDir::new().unwrap();
    let mut settings = no_connection_settings(&dir);
    settings.inbound_connection_limit = 2;
    settings.inbound_port = free_port();
    let port = settings.inbound_port;
    let chain = settings.network;

    let network = P2p::new(settings);
    network.start().await.unwrap();

    let _client = client_handshake(format!("127.0.0.1:{port}").parse().unwrap(), chain).await;
    wait_for_connections(&network, 1).await;

    network.stop().await.unwrap();
    assert_eq!(network.connection_count().await, 0);
}

#[tokio::test]
async fn connecting_to_ourselves_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut settings = no_connection_settings(&dir);
    settings.inbound_connection_limit = 1;
    settings.inbound_port = free_port();
    let port = settings.inbound_port;

    let network = P2p::new(settings);
    network.start().await.unwrap();

    // our own version nonce comes straight back at us
    let own_authority: Authority = format!("127.0.0.1:{port}").parse().unwrap();
    assert!(network.connect(own_authority).await.is_err());
    assert_eq!(network.connection_count().await, 0);

    network.stop().await.unwrap();
}

//! The libp2p swarm driver.
//!
//! A command channel in, an event channel out, one `tokio::select!` loop in
//! between. The behaviour stacks the single-shot transfer protocol on top of
//! the three discovery paths: mDNS for the local subnet, Kademlia for wide
//! area, and manual dialing of full multiaddrs.

use crate::protocol::{TransferAck, TransferCodec, TransferFrame, TRANSFER_PROTOCOL};
use firma_types::{P2pConfig, TransportError};
use futures::StreamExt;
use libp2p::request_response::{self, OutboundRequestId, ProtocolSupport, ResponseChannel};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identify, identity, kad, mdns, noise, tcp, yamux, Multiaddr, PeerId, Swarm,
    SwarmBuilder, Transport};
use std::collections::HashMap;
use std::iter;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(NetworkBehaviour)]
pub struct TransferBehaviour {
    pub request_response: request_response::Behaviour<TransferCodec>,
    /// Absent when the multicast socket cannot be bound (containers without
    /// multicast); the other discovery paths keep working.
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub kad: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
}

/// Instructions into the swarm loop.
#[derive(Debug)]
pub enum SwarmCommand {
    Listen(Multiaddr),
    Dial(Multiaddr),
    /// Teach the routing table an address for a peer.
    AddPeerAddress { peer: PeerId, address: Multiaddr },
    /// Fire one transfer frame at a peer; the ack (or failure) comes back on
    /// `reply`.
    SendTransfer {
        peer: PeerId,
        frame: TransferFrame,
        reply: oneshot::Sender<Result<TransferAck, TransportError>>,
    },
    /// Answer an inbound request on its stream.
    SendAck {
        channel: ResponseChannel<TransferAck>,
        ack: TransferAck,
    },
}

/// What the swarm loop surfaces to the transport layer.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A transfer frame arrived; the handler must answer on `channel`.
    InboundTransfer {
        peer: PeerId,
        frame: TransferFrame,
        channel: ResponseChannel<TransferAck>,
    },
    PeerDiscovered {
        peer: PeerId,
        address: Multiaddr,
    },
    PeerExpired {
        peer: PeerId,
    },
    ConnectionEstablished {
        peer: PeerId,
        inbound: bool,
        total: usize,
    },
    ConnectionClosed {
        peer: PeerId,
        total: usize,
    },
    IdentifyReceived {
        peer: PeerId,
        protocols: Vec<String>,
    },
    Listening {
        address: Multiaddr,
    },
}

/// A running swarm loop: its command channel, event stream, and handle.
pub struct SwarmDriver {
    pub commands: mpsc::Sender<SwarmCommand>,
    pub events: mpsc::Receiver<NetworkEvent>,
    pub shutdown: watch::Sender<bool>,
    pub task: JoinHandle<()>,
    pub local_peer_id: PeerId,
}

fn build_swarm(
    keypair: identity::Keypair,
    config: &P2pConfig,
) -> Result<Swarm<TransferBehaviour>, TransportError> {
    let local_peer_id = keypair.public().to_peer_id();
    let connect_timeout = Duration::from_secs(config.connection_timeout_secs);
    let request_timeout = Duration::from_secs(config.send_deadline_secs);

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_other_transport(|key| {
            let noise_config = noise::Config::new(key)?;
            // Two listeners share one upgrade stack: plain TCP on `port`,
            // WebSocket-wrapped TCP on `port + 1` for browser-origin peers.
            let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
            let ws_transport = libp2p::websocket::WsConfig::new(tcp::tokio::Transport::new(
                tcp::Config::default().nodelay(true),
            ));
            let transport = tcp_transport
                .or_transport(ws_transport)
                .upgrade(libp2p::core::upgrade::Version::V1Lazy)
                .authenticate(noise_config)
                .multiplex(yamux::Config::default())
                .timeout(connect_timeout)
                .boxed();
            Ok(transport)
        })
        .map_err(|e| TransportError::Internal(format!("transport stack: {e}")))?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();
            let request_response = request_response::Behaviour::new(
                iter::once((TRANSFER_PROTOCOL, ProtocolSupport::Full)),
                request_response::Config::default().with_request_timeout(request_timeout),
            );
            let mdns = match mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id) {
                Ok(behaviour) => Toggle::from(Some(behaviour)),
                Err(e) => {
                    tracing::warn!(target: "p2p", event = "mdns_unavailable", error = %e);
                    Toggle::from(None)
                }
            };
            let kad =
                kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));
            let identify = identify::Behaviour::new(identify::Config::new(
                "/firma-sign/1.0.0".to_string(),
                key.public(),
            ));
            Ok(TransferBehaviour {
                request_response,
                mdns,
                kad,
                identify,
            })
        })
        .map_err(|e| TransportError::Internal(format!("behaviour: {e}")))?
        .build();

    tracing::info!(target: "p2p", event = "swarm_built", peer_id = %local_peer_id);
    Ok(swarm)
}

impl SwarmDriver {
    /// Builds the swarm and spawns its loop. Listeners for `port` and
    /// `port + 1` (WebSocket) are queued immediately, followed by bootstrap
    /// dials.
    pub fn start(
        keypair: identity::Keypair,
        config: P2pConfig,
    ) -> Result<SwarmDriver, TransportError> {
        let local_peer_id = keypair.public().to_peer_id();
        let mut swarm = build_swarm(keypair, &config)?;

        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tcp_listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.port)
            .parse()
            .map_err(|e| TransportError::InvalidConfig(format!("listen addr: {e}")))?;
        let ws_listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}/ws", config.port + 1)
            .parse()
            .map_err(|e| TransportError::InvalidConfig(format!("ws listen addr: {e}")))?;
        swarm
            .listen_on(tcp_listen)
            .map_err(|e| TransportError::Network(format!("listen: {e}")))?;
        swarm
            .listen_on(ws_listen)
            .map_err(|e| TransportError::Network(format!("ws listen: {e}")))?;

        for addr in &config.bootstrap {
            match addr.parse::<Multiaddr>() {
                Ok(multiaddr) => {
                    if let Err(e) = swarm.dial(multiaddr) {
                        tracing::warn!(target: "p2p", event = "bootstrap_dial_failed", addr = %addr, error = %e);
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "p2p", event = "bootstrap_addr_invalid", addr = %addr, error = %e);
                }
            }
        }

        let task = tokio::spawn(run_swarm_loop(
            swarm,
            config,
            command_rx,
            event_tx,
            shutdown_rx,
        ));

        Ok(SwarmDriver {
            commands: command_tx,
            events: event_rx,
            shutdown: shutdown_tx,
            task,
            local_peer_id,
        })
    }
}

async fn run_swarm_loop(
    mut swarm: Swarm<TransferBehaviour>,
    config: P2pConfig,
    mut commands: mpsc::Receiver<SwarmCommand>,
    events: mpsc::Sender<NetworkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    // In-flight outbound requests awaiting their ack.
    let mut pending: HashMap<
        OutboundRequestId,
        oneshot::Sender<Result<TransferAck, TransportError>>,
    > = HashMap::new();
    let mut connections: usize = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            command = commands.recv() => match command {
                None => break,
                Some(SwarmCommand::Listen(addr)) => { swarm.listen_on(addr).ok(); }
                Some(SwarmCommand::Dial(addr)) => {
                    if let Err(e) = swarm.dial(addr.clone()) {
                        tracing::warn!(target: "p2p", event = "dial_failed", %addr, error = %e);
                    }
                }
                Some(SwarmCommand::AddPeerAddress { peer, address }) => {
                    swarm.behaviour_mut().kad.add_address(&peer, address.clone());
                    swarm.behaviour_mut().request_response.add_address(&peer, address);
                }
                Some(SwarmCommand::SendTransfer { peer, frame, reply }) => {
                    let request_id = swarm
                        .behaviour_mut()
                        .request_response
                        .send_request(&peer, frame);
                    pending.insert(request_id, reply);
                }
                Some(SwarmCommand::SendAck { channel, ack }) => {
                    if swarm
                        .behaviour_mut()
                        .request_response
                        .send_response(channel, ack)
                        .is_err()
                    {
                        tracing::debug!(target: "p2p", event = "ack_stream_gone");
                    }
                }
            },
            event = swarm.select_next_some() => match event {
                SwarmEvent::NewListenAddr { address, .. } => {
                    tracing::info!(target: "p2p", event = "listening", %address);
                    events.send(NetworkEvent::Listening { address }).await.ok();
                }
                SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                    connections += 1;
                    if connections > config.max_connections as usize {
                        tracing::warn!(
                            target: "p2p",
                            event = "connection_limit_exceeded",
                            connections,
                            limit = config.max_connections
                        );
                    }
                    events.send(NetworkEvent::ConnectionEstablished {
                        peer: peer_id,
                        inbound: !endpoint.is_dialer(),
                        total: connections,
                    }).await.ok();
                }
                SwarmEvent::ConnectionClosed { peer_id, .. } => {
                    connections = connections.saturating_sub(1);
                    events.send(NetworkEvent::ConnectionClosed {
                        peer: peer_id,
                        total: connections,
                    }).await.ok();
                }
                SwarmEvent::Behaviour(TransferBehaviourEvent::Mdns(mdns_event)) => match mdns_event {
                    mdns::Event::Discovered(list) => {
                        for (peer, address) in list {
                            swarm.behaviour_mut().kad.add_address(&peer, address.clone());
                            // Warm connectivity toward freshly discovered
                            // peers, inside the connection budget.
                            if config.auto_dial && connections < config.max_connections as usize {
                                swarm.dial(address.clone()).ok();
                            }
                            events.send(NetworkEvent::PeerDiscovered { peer, address }).await.ok();
                        }
                    }
                    mdns::Event::Expired(list) => {
                        for (peer, _address) in list {
                            events.send(NetworkEvent::PeerExpired { peer }).await.ok();
                        }
                    }
                },
                SwarmEvent::Behaviour(TransferBehaviourEvent::Identify(identify::Event::Received { peer_id, info })) => {
                    for addr in info.listen_addrs {
                        swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                    }
                    let protocols = info
                        .protocols
                        .iter()
                        .map(|p| p.to_string())
                        .collect();
                    events.send(NetworkEvent::IdentifyReceived { peer: peer_id, protocols }).await.ok();
                }
                SwarmEvent::Behaviour(TransferBehaviourEvent::Identify(_)) => {}
                SwarmEvent::Behaviour(TransferBehaviourEvent::Kad(kad_event)) => {
                    if let kad::Event::RoutingUpdated { peer, addresses, .. } = kad_event {
                        let address = addresses.first();
                        events.send(NetworkEvent::PeerDiscovered {
                            peer,
                            address: address.clone(),
                        }).await.ok();
                    }
                }
                SwarmEvent::Behaviour(TransferBehaviourEvent::RequestResponse(rr_event)) => match rr_event {
                    request_response::Event::Message { peer, message } => match message {
                        request_response::Message::Request { request, channel, .. } => {
                            events.send(NetworkEvent::InboundTransfer {
                                peer,
                                frame: request,
                                channel,
                            }).await.ok();
                        }
                        request_response::Message::Response { request_id, response } => {
                            if let Some(reply) = pending.remove(&request_id) {
                                reply.send(Ok(response)).ok();
                            }
                        }
                    },
                    request_response::Event::OutboundFailure { peer, request_id, error } => {
                        tracing::warn!(target: "p2p", event = "outbound_failure", %peer, ?error);
                        if let Some(reply) = pending.remove(&request_id) {
                            reply.send(Err(map_outbound_failure(error))).ok();
                        }
                    }
                    request_response::Event::InboundFailure { peer, error, .. } => {
                        tracing::warn!(target: "p2p", event = "inbound_failure", %peer, ?error);
                    }
                    request_response::Event::ResponseSent { .. } => {}
                },
                _ => {}
            },
        }
    }

    // The loop is exiting; anything still pending will never resolve.
    for (_, reply) in pending.drain() {
        reply.send(Err(TransportError::Cancelled)).ok();
    }
    tracing::info!(target: "p2p", event = "swarm_loop_stopped");
}

fn map_outbound_failure(error: request_response::OutboundFailure) -> TransportError {
    use request_response::OutboundFailure::*;
    match error {
        Timeout => TransportError::SendTimeout,
        DialFailure => TransportError::Network("dial failure".into()),
        ConnectionClosed => TransportError::Network("connection closed".into()),
        UnsupportedProtocols => {
            TransportError::Rejected("peer does not speak the transfer protocol".into())
        }
        Io(e) => TransportError::Network(e.to_string()),
    }
}

//! Replica mesh: one duplex TCP connection to every other replica, each
//! filed by the remote replica's declared role.

use std::fmt;
use std::net::SocketAddr;

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::directory::Transaction;
use crate::replica::ProposalNumber;
use crate::utils::{
    safe_tcp_read, tcp_bind_with_retry, tcp_connect_with_retry, tcp_write_obj,
    RoomkeeperError,
};

/// Local handle number of a mesh connection.
pub type PeerId = u32;

/// Paxos role a replica plays for quorum purposes. Every replica also
/// learns decided transactions regardless of its role.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub enum ReplicaRole {
    Proposer,
    Acceptor,
    Learner,
}

impl ReplicaRole {
    /// Parses a role name, case-insensitively.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "proposer" => Some(ReplicaRole::Proposer),
            "acceptor" => Some(ReplicaRole::Acceptor),
            "learner" => Some(ReplicaRole::Learner),
            _ => None,
        }
    }
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Message exchanged between replicas over the mesh.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerMsg {
    /// First frame on every mesh connection, sent by the connecting side.
    TellMyRole { role: ReplicaRole },

    /// Proposer -> acceptors: phase 1a.
    Prepare { n: ProposalNumber },

    /// Acceptor -> proposer: phase 1b, carrying the highest accepted value
    /// if any.
    Promise {
        n: ProposalNumber,
        accepted: Option<(ProposalNumber, Transaction)>,
    },

    /// Proposer -> acceptors: phase 2a.
    Accept { n: ProposalNumber, txn: Transaction },

    /// Acceptor -> proposer: phase 2b.
    AcceptResponse { n: ProposalNumber, txn: Transaction },

    /// Proposer -> everyone: the value chosen for the round.
    Educate { txn: Transaction },
}

/// A filed mesh connection.
#[derive(Debug)]
pub struct MeshPeer {
    pub role: ReplicaRole,
    pub addr: SocketAddr,
    tx_send: mpsc::UnboundedSender<PeerMsg>,
}

/// Cloneable handle for asking the mesh to dial a replica.
#[derive(Debug, Clone)]
pub struct MeshConnector {
    tx_connect: mpsc::UnboundedSender<(SocketAddr, ReplicaRole)>,
}

impl MeshConnector {
    /// Requests a connection to the replica listening at `addr` that
    /// declared `role`. The connection is filed asynchronously.
    pub fn connect(
        &self,
        addr: SocketAddr,
        role: ReplicaRole,
    ) -> Result<(), RoomkeeperError> {
        self.tx_connect.send((addr, role))?;
        Ok(())
    }
}

/// Cloneable read-only view of the currently filed connections.
#[derive(Clone)]
pub struct MeshView {
    peers: flashmap::ReadHandle<PeerId, MeshPeer>,
}

impl MeshView {
    /// Number of connected replicas that declared the given role.
    pub fn count(&self, role: ReplicaRole) -> usize {
        self.peers
            .guard()
            .iter()
            .filter(|(_, peer)| peer.role == role)
            .count()
    }

    /// Snapshot of all connected replicas.
    pub fn peers(&self) -> Vec<(PeerId, ReplicaRole, SocketAddr)> {
        let mut peers: Vec<_> = self
            .peers
            .guard()
            .iter()
            .map(|(&id, peer)| (id, peer.role, peer.addr))
            .collect();
        peers.sort_by_key(|&(id, _, _)| id);
        peers
    }
}

/// The mesh endpoint of one replica.
pub struct ReplicaMesh {
    /// My identity string for logging.
    me: String,

    /// Address where other replicas reach my mesh listener.
    local_addr: SocketAddr,

    view: MeshView,

    connector: MeshConnector,

    /// Receiver side of the channel that all peer messengers feed.
    rx_recv: mpsc::UnboundedReceiver<(PeerId, PeerMsg)>,

    /// Join handle of the mesh keeper thread.
    _keeper_handle: JoinHandle<()>,
}

impl ReplicaMesh {
    /// Binds the mesh listener and spawns the mesh keeper thread, which
    /// files inbound connections once it reads their `TellMyRole` and dials
    /// replicas on request.
    pub async fn new_and_setup(
        me: String,
        role: ReplicaRole,
        bind_addr: SocketAddr,
        connect_retries: u8,
    ) -> Result<Self, RoomkeeperError> {
        let listener = tcp_bind_with_retry(bind_addr, connect_retries).await?;
        let local_addr = listener.local_addr()?;

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (peers_write, peers_read) = flashmap::new::<PeerId, MeshPeer>();

        let keeper_handle = tokio::spawn(Self::mesh_keeper_thread(
            me.clone(),
            role,
            listener,
            rx_connect,
            tx_recv,
            peers_write,
            connect_retries,
        ));
        pf_info!(me; "mesh listening on '{}' as {}", local_addr, role);

        Ok(ReplicaMesh {
            me,
            local_addr,
            view: MeshView { peers: peers_read },
            connector: MeshConnector { tx_connect },
            rx_recv,
            _keeper_handle: keeper_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn view(&self) -> MeshView {
        self.view.clone()
    }

    pub fn connector(&self) -> MeshConnector {
        self.connector.clone()
    }

    pub fn count(&self, role: ReplicaRole) -> usize {
        self.view.count(role)
    }

    /// Sends a message to one peer.
    pub fn send_msg(
        &self,
        msg: PeerMsg,
        peer: PeerId,
    ) -> Result<(), RoomkeeperError> {
        match self.view.peers.guard().get(&peer) {
            Some(p) => {
                p.tx_send.send(msg)?;
                Ok(())
            }
            None => logged_err!(self.me; "peer {} not found in mesh", peer),
        }
    }

    /// Sends a message to every peer of the given role, or to every peer if
    /// `role` is `None`. Returns the number of peers sent to.
    pub fn broadcast(&self, msg: &PeerMsg, role: Option<ReplicaRole>) -> usize {
        let mut sent = 0;
        for (&id, peer) in self.view.peers.guard().iter() {
            if role.is_some_and(|r| r != peer.role) {
                continue;
            }
            if let Err(e) = peer.tx_send.send(msg.clone()) {
                pf_warn!(self.me; "error sending to peer {}: {}", id, e);
            } else {
                sent += 1;
            }
        }
        sent
    }

    /// Waits for the next message from any peer.
    pub async fn recv_msg(
        &mut self,
    ) -> Result<(PeerId, PeerMsg), RoomkeeperError> {
        match self.rx_recv.recv().await {
            Some((id, msg)) => Ok((id, msg)),
            None => logged_err!(self.me; "mesh recv channel has been closed"),
        }
    }
}

/// A connection whose handshake has completed, waiting to be filed.
struct ShakenPeer {
    role: ReplicaRole,
    addr: SocketAddr,
    stream: TcpStream,
    read_buf: BytesMut,
}

// ReplicaMesh mesh_keeper thread implementation
impl ReplicaMesh {
    /// Reads the `TellMyRole` frame that opens an inbound connection.
    /// Keeps the read buffer too, as it may already hold later frames.
    async fn accept_new_peer(
        me: String,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<ShakenPeer, RoomkeeperError> {
        let mut read_buf = BytesMut::new();
        match safe_tcp_read(&mut read_buf, &mut stream).await? {
            PeerMsg::TellMyRole { role } => Ok(ShakenPeer {
                role,
                addr,
                stream,
                read_buf,
            }),
            msg => logged_err!(
                me;
                "expected TellMyRole from '{}', got {:?}",
                addr,
                msg
            ),
        }
    }

    /// Dials a replica and introduces myself.
    async fn connect_new_peer(
        my_role: ReplicaRole,
        addr: SocketAddr,
        role: ReplicaRole,
        connect_retries: u8,
    ) -> Result<ShakenPeer, RoomkeeperError> {
        let mut stream = tcp_connect_with_retry(addr, connect_retries).await?;
        tcp_write_obj(&mut stream, &PeerMsg::TellMyRole { role: my_role })
            .await?;
        Ok(ShakenPeer {
            role,
            addr,
            stream,
            read_buf: BytesMut::new(),
        })
    }

    /// Runs one handshake in its own task and hands the result back to the
    /// keeper, so a stalled connection never holds up other filings.
    fn spawn_handshake<F>(
        me: &str,
        handshake: F,
        tx_shaken: mpsc::UnboundedSender<ShakenPeer>,
    ) where
        F: std::future::Future<Output = Result<ShakenPeer, RoomkeeperError>>
            + Send
            + 'static,
    {
        let me = me.to_string();
        tokio::spawn(async move {
            match handshake.await {
                Ok(shaken) => {
                    if tx_shaken.send(shaken).is_err() {
                        pf_debug!(me; "mesh keeper gone before filing");
                    }
                }
                Err(e) => {
                    pf_warn!(me; "peer handshake failed: {}", e);
                }
            }
        });
    }

    /// Files a connection and spawns its messenger.
    fn file_peer(
        me: &str,
        id: PeerId,
        shaken: ShakenPeer,
        peers: &mut flashmap::WriteHandle<PeerId, MeshPeer>,
        tx_recv: mpsc::UnboundedSender<(PeerId, PeerMsg)>,
        tx_exit: mpsc::UnboundedSender<PeerId>,
    ) {
        let ShakenPeer {
            role,
            addr,
            stream,
            read_buf,
        } = shaken;
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let mut peers_guard = peers.guard();
        peers_guard.insert(id, MeshPeer { role, addr, tx_send });
        peers_guard.publish();

        tokio::spawn(Self::peer_messenger_thread(
            me.to_string(),
            id,
            addr,
            stream,
            read_buf,
            rx_send,
            tx_recv,
            tx_exit,
        ));
        pf_info!(me; "filed peer {} '{}' as {}", id, addr, role);
    }

    /// Mesh keeper thread function.
    async fn mesh_keeper_thread(
        me: String,
        my_role: ReplicaRole,
        listener: TcpListener,
        mut rx_connect: mpsc::UnboundedReceiver<(SocketAddr, ReplicaRole)>,
        tx_recv: mpsc::UnboundedSender<(PeerId, PeerMsg)>,
        mut peers: flashmap::WriteHandle<PeerId, MeshPeer>,
        connect_retries: u8,
    ) {
        pf_debug!(me; "mesh_keeper thread spawned");

        // handshake tasks report finished connections here
        let (tx_shaken, mut rx_shaken) = mpsc::unbounded_channel();
        // messenger threads report their termination here
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel();
        let mut next_id: PeerId = 0;

        loop {
            tokio::select! {
                // inbound connection from a replica told to dial me
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!(me; "error accepting peer connection: {}", e);
                            continue;
                        }
                    };
                    Self::spawn_handshake(
                        &me,
                        Self::accept_new_peer(me.clone(), stream, addr),
                        tx_shaken.clone(),
                    );
                },

                // request to dial a replica
                directive = rx_connect.recv() => {
                    let Some((addr, role)) = directive else {
                        break; // mesh endpoint dropped
                    };
                    Self::spawn_handshake(
                        &me,
                        Self::connect_new_peer(my_role, addr, role, connect_retries),
                        tx_shaken.clone(),
                    );
                },

                // a handshake completed
                shaken = rx_shaken.recv() => {
                    let Some(shaken) = shaken else { continue };
                    Self::file_peer(
                        &me, next_id, shaken,
                        &mut peers, tx_recv.clone(), tx_exit.clone(),
                    );
                    next_id += 1;
                },

                // a peer messenger thread exits
                id = rx_exit.recv() => {
                    let Some(id) = id else { continue };
                    let mut peers_guard = peers.guard();
                    if peers_guard.remove(id).is_some() {
                        pf_info!(me; "dropped peer {} from mesh", id);
                    }
                    peers_guard.publish();
                },
            }
        }

        pf_debug!(me; "mesh_keeper thread exited");
    }
}

// ReplicaMesh peer_messenger thread implementation
impl ReplicaMesh {
    /// Peer messenger thread function: writes queued messages to the peer
    /// and forwards whatever the peer sends into the shared recv channel.
    #[allow(clippy::too_many_arguments)]
    async fn peer_messenger_thread(
        me: String,
        id: PeerId,
        addr: SocketAddr,
        conn: TcpStream,
        mut read_buf: BytesMut,
        mut rx_send: mpsc::UnboundedReceiver<PeerMsg>,
        tx_recv: mpsc::UnboundedSender<(PeerId, PeerMsg)>,
        tx_exit: mpsc::UnboundedSender<PeerId>,
    ) {
        pf_debug!(me; "peer_messenger thread for {} '{}' spawned", id, addr);

        let (mut conn_read, mut conn_write) = conn.into_split();

        loop {
            tokio::select! {
                // gets a message to send out
                msg = rx_send.recv() => {
                    let Some(msg) = msg else {
                        break; // peer removed from the mesh
                    };
                    if let Err(e) = tcp_write_obj(&mut conn_write, &msg).await {
                        pf_warn!(me; "error sending to peer {}: {}", id, e);
                        break;
                    }
                    pf_trace!(me; "sent -> {} {:?}", id, msg);
                },

                // receives new message from peer
                msg = safe_tcp_read::<PeerMsg, _>(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(PeerMsg::TellMyRole { role }) => {
                            pf_warn!(me; "peer {} re-declared role {}, ignored", id, role);
                        }
                        Ok(msg) => {
                            pf_trace!(me; "recv <- {} {:?}", id, msg);
                            if tx_recv.send((id, msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            pf_info!(me; "lost peer {} '{}': {}", id, addr, e);
                            break;
                        }
                    }
                },
            }
        }

        if let Err(e) = tx_exit.send(id) {
            pf_error!(me; "error sending exit signal for {}: {}", id, e);
        }
        pf_debug!(me; "peer_messenger thread for {} '{}' exited", id, addr);
    }
}

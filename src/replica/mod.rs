//! Directory replica: mesh, Paxos engine, client API and chatroom failover
//! wired together around one replicated directory.

mod external;
mod failover;
mod mesh;
mod paxos;
mod round;

pub use external::{ClientApi, ClientReply, ClientRequest};
pub use failover::StatusMsg;
pub use mesh::{
    MeshConnector, MeshView, PeerId, PeerMsg, ReplicaMesh, ReplicaRole,
};
pub use paxos::PaxosEngine;
pub use round::{is_quorum, ProposalClock, ProposalNumber, Round};

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::directory::{Directory, DirectoryState, GroupPool, Transaction};
use crate::multicast::{GroupChannel, GroupSender};
use crate::registry::RegistryLink;
use crate::utils::RoomkeeperError;

use failover::HostedRoom;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplicaConfig {
    /// Interval between heartbeats sent to each chatroom host.
    pub heartbeat_interval_ms: u64,

    /// First address of the multicast group pool.
    pub group_pool_base: String,

    /// Number of consecutive addresses in the pool.
    pub group_pool_size: u32,

    /// UDP port all chatroom groups use.
    pub multicast_port: u16,

    /// Local interface address to send group announcements through;
    /// "0.0.0.0" leaves it to the routing table.
    pub multicast_interface: String,

    /// Retries for binding and dialing TCP sockets.
    pub connect_retries: u8,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            heartbeat_interval_ms: 500,
            group_pool_base: "239.0.0.1".into(),
            group_pool_size: 255,
            multicast_port: 4446,
            multicast_interface: "0.0.0.0".into(),
            connect_retries: 10,
        }
    }
}

impl ReplicaConfig {
    /// Parses the config from an optional TOML string.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, RoomkeeperError> {
        let config = parsed_config!(config_str => ReplicaConfig;
                                    heartbeat_interval_ms, group_pool_base,
                                    group_pool_size, multicast_port,
                                    multicast_interface, connect_retries)?;
        if config.heartbeat_interval_ms == 0 {
            return logged_err!("config"; "invalid heartbeat_interval_ms 0");
        }
        if config.group_pool_size == 0 {
            return logged_err!("config"; "invalid group_pool_size 0");
        }
        Ok(config)
    }

    /// Builds the multicast group pool this config describes.
    pub fn group_pool(&self) -> Result<GroupPool, RoomkeeperError> {
        let base: Ipv4Addr = self.group_pool_base.parse()?;
        Ok(GroupPool::new(base, self.group_pool_size))
    }

    /// Group port and interface this config describes.
    pub fn group_channel(&self) -> Result<GroupChannel, RoomkeeperError> {
        let interface: Ipv4Addr = self.multicast_interface.parse()?;
        Ok(GroupChannel::new(self.multicast_port).via(interface))
    }
}

/// State shared by a replica's client servants and chatroom leases.
#[derive(Debug)]
pub(crate) struct ReplicaContext {
    /// My identity string for logging.
    pub(crate) me: String,

    pub(crate) config: ReplicaConfig,

    pub(crate) directory: Directory,

    /// Sender side of the Paxos engine's proposal channel.
    tx_propose: mpsc::UnboundedSender<Transaction>,

    /// Chat name -> lease, for chatrooms hosted through this replica.
    hosted: Mutex<HashMap<String, HostedRoom>>,

    next_lease: AtomicU64,

    pub(crate) group_sender: GroupSender,
}

impl ReplicaContext {
    pub(crate) fn new(
        me: String,
        config: ReplicaConfig,
        directory: Directory,
        tx_propose: mpsc::UnboundedSender<Transaction>,
    ) -> Result<Self, RoomkeeperError> {
        let group_sender = GroupSender::new(config.group_channel()?.interface)?;
        Ok(ReplicaContext {
            me,
            config,
            directory,
            tx_propose,
            hosted: Mutex::new(HashMap::new()),
            next_lease: AtomicU64::new(0),
            group_sender,
        })
    }

    /// Applies a transaction tentatively to the local directory and submits
    /// it for replication.
    pub(crate) fn commit(&self, txn: Transaction) {
        self.directory.apply(&txn);
        self.propose(txn);
    }

    /// Submits an already applied transaction for replication.
    pub(crate) fn propose(&self, txn: Transaction) {
        if let Err(e) = self.tx_propose.send(txn) {
            pf_error!(self.me; "error submitting proposal: {}", e);
        }
    }

    pub(crate) fn hosted_rooms(
        &self,
    ) -> MutexGuard<'_, HashMap<String, HostedRoom>> {
        self.hosted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `user` hosts any chatroom through this replica.
    pub(crate) fn hosts_any(&self, user: &str) -> bool {
        self.hosted_rooms()
            .values()
            .any(|room| room.host_user == user)
    }

    pub(crate) fn next_lease_id(&self) -> u64 {
        self.next_lease.fetch_add(1, Ordering::Relaxed)
    }
}

/// Addresses and identity a replica is set up with.
#[derive(Debug, Clone)]
pub struct ReplicaParams<'a> {
    pub name: String,
    pub role: ReplicaRole,

    /// Client-facing API bind address.
    pub api_addr: SocketAddr,

    /// Replica-facing mesh bind address.
    pub mesh_addr: SocketAddr,

    /// Registry to join through, if any.
    pub registry_addr: Option<SocketAddr>,

    /// TOML string of `ReplicaConfig` fields to override.
    pub config_str: Option<&'a str>,
}

/// A running directory replica.
pub struct Replica {
    /// My identity string for logging.
    me: String,

    role: ReplicaRole,

    ctx: Arc<ReplicaContext>,

    mesh_addr: SocketAddr,
    mesh_view: MeshView,
    connector: MeshConnector,

    api: ClientApi,

    /// Kept alive so the registry keeps me listed.
    _link: Option<RegistryLink>,

    tx_term: watch::Sender<bool>,

    /// Join handle of the Paxos engine task.
    _engine_handle: JoinHandle<()>,
}

impl Replica {
    /// Sets up a replica: binds the mesh and client API listeners, joins
    /// the registry if given one, and starts the Paxos engine.
    pub async fn new_and_setup(
        params: ReplicaParams<'_>,
    ) -> Result<Self, RoomkeeperError> {
        let me = params.name;
        let config = ReplicaConfig::from_config_str(params.config_str)?;
        let directory =
            Directory::new(DirectoryState::new(config.group_pool()?));

        let mesh = ReplicaMesh::new_and_setup(
            me.clone(),
            params.role,
            params.mesh_addr,
            config.connect_retries,
        )
        .await?;
        let mesh_addr = mesh.local_addr();
        let mesh_view = mesh.view();
        let connector = mesh.connector();

        let link = match params.registry_addr {
            Some(registry_addr) => Some(
                RegistryLink::new_and_setup(
                    me.clone(),
                    registry_addr,
                    mesh_addr,
                    params.role,
                    connector.clone(),
                    config.connect_retries,
                )
                .await?,
            ),
            None => None,
        };

        let (tx_propose, rx_propose) = mpsc::unbounded_channel();
        let (tx_term, rx_term) = watch::channel(false);
        let engine =
            PaxosEngine::new(me.clone(), mesh, directory.clone(), rx_propose);
        let engine_handle = tokio::spawn(engine.run(rx_term));

        let ctx = Arc::new(ReplicaContext::new(
            me.clone(),
            config,
            directory,
            tx_propose,
        )?);
        let api =
            ClientApi::new_and_setup(ctx.clone(), params.api_addr).await?;

        pf_info!(me; "replica up as {}, api '{}' mesh '{}'",
                     params.role, api.local_addr(), mesh_addr);
        Ok(Replica {
            me,
            role: params.role,
            ctx,
            mesh_addr,
            mesh_view,
            connector,
            api,
            _link: link,
            tx_term,
            _engine_handle: engine_handle,
        })
    }

    pub fn role(&self) -> ReplicaRole {
        self.role
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api.local_addr()
    }

    pub fn mesh_addr(&self) -> SocketAddr {
        self.mesh_addr
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.ctx.config
    }

    /// Handle to this replica's directory.
    pub fn directory(&self) -> Directory {
        self.ctx.directory.clone()
    }

    pub fn mesh_view(&self) -> MeshView {
        self.mesh_view.clone()
    }

    /// Dials another replica directly, bypassing the registry.
    pub fn connect_peer(
        &self,
        addr: SocketAddr,
        role: ReplicaRole,
    ) -> Result<(), RoomkeeperError> {
        self.connector.connect(addr, role)
    }

    /// Submits a transaction for replication without applying it locally
    /// first; it takes effect here once its round is chosen.
    pub fn start_paxos(&self, txn: Transaction) -> Result<(), RoomkeeperError> {
        self.ctx.tx_propose.send(txn)?;
        Ok(())
    }

    /// Waits until termination is signalled on `rx_term`, then stops the
    /// Paxos engine.
    pub async fn run(
        &self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), RoomkeeperError> {
        rx_term.changed().await?;
        pf_info!(self.me; "replica caught termination signal");
        self.shutdown()
    }

    /// Stops the Paxos engine.
    pub fn shutdown(&self) -> Result<(), RoomkeeperError> {
        self.tx_term.send(true)?;
        Ok(())
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;
    use crate::registry::RegistryServer;
    use crate::utils::poll_until;

    fn local_params(
        name: &str,
        role: ReplicaRole,
        registry: SocketAddr,
    ) -> ReplicaParams<'static> {
        ReplicaParams {
            name: name.into(),
            role,
            api_addr: "127.0.0.1:0".parse().unwrap(),
            mesh_addr: "127.0.0.1:0".parse().unwrap(),
            registry_addr: Some(registry),
            config_str: Some("connect_retries = 3"),
        }
    }

    #[test]
    fn config_defaults_and_overrides() -> Result<(), RoomkeeperError> {
        assert_eq!(
            ReplicaConfig::from_config_str(None)?,
            ReplicaConfig::default()
        );
        let config = ReplicaConfig::from_config_str(Some(
            "heartbeat_interval_ms = 100\ngroup_pool_base = '127.0.1.1'",
        ))?;
        assert_eq!(config.heartbeat_interval_ms, 100);
        assert_eq!(
            config.group_pool()?.next_free(),
            Some("127.0.1.1".parse::<Ipv4Addr>()?)
        );
        assert!(
            ReplicaConfig::from_config_str(Some("heartbeat_interval_ms = 0"))
                .is_err()
        );
        assert!(ReplicaConfig::from_config_str(Some("nonsense = 1")).is_err());
        let config = ReplicaConfig::from_config_str(Some(
            "multicast_port = 5000\nmulticast_interface = '127.0.0.1'",
        ))?;
        assert_eq!(
            config.group_channel()?,
            GroupChannel::new(5000).via(Ipv4Addr::LOCALHOST)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mesh_forms_through_registry() -> Result<(), RoomkeeperError> {
        let registry =
            RegistryServer::new_and_setup("127.0.0.1:0".parse()?).await?;
        let raddr = registry.local_addr();

        let r1 = Replica::new_and_setup(local_params(
            "r1",
            ReplicaRole::Acceptor,
            raddr,
        ))
        .await?;
        let r2 = Replica::new_and_setup(local_params(
            "r2",
            ReplicaRole::Acceptor,
            raddr,
        ))
        .await?;
        let r3 = Replica::new_and_setup(local_params(
            "r3",
            ReplicaRole::Proposer,
            raddr,
        ))
        .await?;

        let (v1, v2, v3) = (r1.mesh_view(), r2.mesh_view(), r3.mesh_view());
        assert!(
            poll_until(|| {
                v1.count(ReplicaRole::Acceptor) == 1
                    && v1.count(ReplicaRole::Proposer) == 1
                    && v2.count(ReplicaRole::Acceptor) == 1
                    && v2.count(ReplicaRole::Proposer) == 1
                    && v3.count(ReplicaRole::Acceptor) == 2
            })
            .await
        );
        assert_eq!(v3.count(ReplicaRole::Proposer), 0);
        assert_eq!(registry.registered().len(), 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn proposal_reaches_every_replica() -> Result<(), RoomkeeperError> {
        let registry =
            RegistryServer::new_and_setup("127.0.0.1:0".parse()?).await?;
        let raddr = registry.local_addr();

        let a1 = Replica::new_and_setup(local_params(
            "a1",
            ReplicaRole::Acceptor,
            raddr,
        ))
        .await?;
        let a2 = Replica::new_and_setup(local_params(
            "a2",
            ReplicaRole::Acceptor,
            raddr,
        ))
        .await?;
        let p = Replica::new_and_setup(local_params(
            "p",
            ReplicaRole::Proposer,
            raddr,
        ))
        .await?;

        let pview = p.mesh_view();
        let (v1, v2) = (a1.mesh_view(), a2.mesh_view());
        assert!(
            poll_until(|| {
                pview.count(ReplicaRole::Acceptor) == 2
                    && v1.peers().len() == 2
                    && v2.peers().len() == 2
            })
            .await
        );

        p.start_paxos(Transaction::Register {
            user: "carol".into(),
            pass: "pw2".into(),
        })?;

        for replica in [&a1, &a2, &p] {
            let directory = replica.directory();
            assert!(
                poll_until(|| directory
                    .read(|d| d.password_of("carol") == Some("pw2")))
                .await
            );
        }
        Ok(())
    }
}

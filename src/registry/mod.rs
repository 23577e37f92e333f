//! Replica registry: the rendezvous that wires replicas into a full mesh.
//!
//! Each replica connects once and registers its mesh address and role. The
//! registry then tells every previously registered replica to dial the
//! newcomer. The registry never takes part in consensus.

mod link;

pub use link::RegistryLink;

use std::net::SocketAddr;

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::replica::ReplicaRole;
use crate::utils::{
    safe_tcp_read, tcp_bind_with_retry, tcp_write_obj, RoomkeeperError,
};

/// Registration number assigned by the registry.
pub type RegistrationId = u32;

/// Registry bootstrap protocol message.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RegistryMsg {
    /// Replica -> Registry: my mesh listener address and my role.
    Register { addr: SocketAddr, role: ReplicaRole },

    /// Registry -> Replica: dial this newly registered replica.
    StartConnection { addr: SocketAddr, role: ReplicaRole },
}

/// A registered replica, as known to the registry.
#[derive(Debug)]
struct Registered {
    addr: SocketAddr,
    role: ReplicaRole,
    tx_send: mpsc::UnboundedSender<RegistryMsg>,
}

/// The registry service.
pub struct RegistryServer {
    local_addr: SocketAddr,

    /// Replicas whose registry connection is still open.
    registered: flashmap::ReadHandle<RegistrationId, Registered>,

    /// Join handle of the replica acceptor thread.
    _acceptor_handle: JoinHandle<()>,
}

impl RegistryServer {
    /// Binds the registry listener and spawns the replica acceptor thread.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
    ) -> Result<Self, RoomkeeperError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let local_addr = listener.local_addr()?;

        let (registered_write, registered_read) =
            flashmap::new::<RegistrationId, Registered>();

        let acceptor_handle =
            tokio::spawn(Self::replica_acceptor_thread(listener, registered_write));

        Ok(RegistryServer {
            local_addr,
            registered: registered_read,
            _acceptor_handle: acceptor_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of currently registered replicas, in registration order.
    pub fn registered(&self) -> Vec<(SocketAddr, ReplicaRole)> {
        let guard = self.registered.guard();
        let mut entries: Vec<_> = guard
            .iter()
            .map(|(&id, r)| (id, r.addr, r.role))
            .collect();
        entries.sort_by_key(|&(id, _, _)| id);
        entries.into_iter().map(|(_, addr, role)| (addr, role)).collect()
    }
}

/// A connection that has sent its `Register` frame.
struct Registration {
    addr: SocketAddr,
    role: ReplicaRole,
    stream: TcpStream,
    read_buf: BytesMut,
}

// RegistryServer replica_acceptor thread implementation
impl RegistryServer {
    /// Reads a new replica's registration. Runs in its own task per
    /// connection.
    async fn read_registration(
        mut stream: TcpStream,
        conn_addr: SocketAddr,
    ) -> Result<Registration, RoomkeeperError> {
        let mut read_buf = BytesMut::new();
        let (mut addr, role) = match safe_tcp_read(&mut read_buf, &mut stream)
            .await?
        {
            RegistryMsg::Register { addr, role } => (addr, role),
            msg => {
                return logged_err!(
                    "reg";
                    "expected Register from '{}', got {:?}",
                    conn_addr,
                    msg
                );
            }
        };
        // a replica listening on the wildcard address is reachable at the
        // address it connected from
        if addr.ip().is_unspecified() {
            addr.set_ip(conn_addr.ip());
        }
        Ok(Registration {
            addr,
            role,
            stream,
            read_buf,
        })
    }

    /// Fans out the directive to dial a newly registered replica, and
    /// records it.
    fn file_replica(
        id: RegistrationId,
        registration: Registration,
        registered: &mut flashmap::WriteHandle<RegistrationId, Registered>,
        tx_exit: mpsc::UnboundedSender<RegistrationId>,
    ) {
        let Registration {
            addr,
            role,
            stream,
            read_buf,
        } = registration;

        let mut registered_guard = registered.guard();
        for (&other, known) in registered_guard.iter() {
            let directive = RegistryMsg::StartConnection { addr, role };
            if let Err(e) = known.tx_send.send(directive) {
                pf_warn!("reg"; "error directing replica {}: {}", other, e);
            }
        }

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        registered_guard.insert(id, Registered { addr, role, tx_send });
        registered_guard.publish();

        tokio::spawn(Self::replica_controller_thread(
            id, addr, stream, read_buf, rx_send, tx_exit,
        ));
        pf_info!("reg"; "registered replica {} '{}' as {}", id, addr, role);
    }

    /// Replica acceptor thread function.
    async fn replica_acceptor_thread(
        listener: TcpListener,
        mut registered: flashmap::WriteHandle<RegistrationId, Registered>,
    ) {
        pf_debug!("reg"; "replica_acceptor thread spawned");

        // registration readers report completed registrations here
        let (tx_reg, mut rx_reg) = mpsc::unbounded_channel();
        // replica controller threads report their termination here
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel();
        let mut next_id: RegistrationId = 0;

        loop {
            tokio::select! {
                // new replica connection
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!("reg"; "error accepting replica connection: {}", e);
                            continue;
                        }
                    };
                    let tx_reg = tx_reg.clone();
                    tokio::spawn(async move {
                        match Self::read_registration(stream, addr).await {
                            Ok(registration) => {
                                if tx_reg.send(registration).is_err() {
                                    pf_debug!("reg"; "acceptor gone before filing '{}'", addr);
                                }
                            }
                            Err(e) => {
                                pf_error!("reg"; "error accepting replica '{}': {}", addr, e);
                            }
                        }
                    });
                },

                // a replica finished registering
                registration = rx_reg.recv() => {
                    let Some(registration) = registration else { continue };
                    Self::file_replica(
                        next_id,
                        registration,
                        &mut registered,
                        tx_exit.clone(),
                    );
                    next_id += 1;
                },

                // a replica controller thread exits
                id = rx_exit.recv() => {
                    let Some(id) = id else { continue };
                    let mut registered_guard = registered.guard();
                    if registered_guard.remove(id).is_some() {
                        pf_info!("reg"; "replica {} left", id);
                    }
                    registered_guard.publish();
                },
            }
        }
    }

    /// Replica controller thread function: forwards directives to one
    /// replica and watches its connection for closure.
    async fn replica_controller_thread(
        id: RegistrationId,
        addr: SocketAddr,
        conn: TcpStream,
        mut read_buf: BytesMut,
        mut rx_send: mpsc::UnboundedReceiver<RegistryMsg>,
        tx_exit: mpsc::UnboundedSender<RegistrationId>,
    ) {
        pf_debug!("reg"; "replica_controller thread for {} '{}' spawned", id, addr);

        let (mut conn_read, mut conn_write) = conn.into_split();

        loop {
            tokio::select! {
                // gets a directive to send to the replica
                msg = rx_send.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = tcp_write_obj(&mut conn_write, &msg).await {
                        pf_warn!("reg"; "error sending to replica {}: {}", id, e);
                        break;
                    }
                },

                // replicas do not send anything after registering
                msg = safe_tcp_read::<RegistryMsg, _>(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(msg) => {
                            pf_warn!("reg"; "unexpected msg from replica {}: {:?}", id, msg);
                        }
                        Err(_) => break,
                    }
                },
            }
        }

        if let Err(e) = tx_exit.send(id) {
            pf_error!("reg"; "error sending exit signal for {}: {}", id, e);
        }
        pf_debug!("reg"; "replica_controller thread for {} '{}' exited", id, addr);
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::utils::{poll_until, tcp_connect_with_retry};
    use tokio::time::{timeout, Duration};

    async fn register_raw(
        registry: SocketAddr,
        addr: &str,
        role: ReplicaRole,
    ) -> Result<(TcpStream, BytesMut), RoomkeeperError> {
        let mut stream = tcp_connect_with_retry(registry, 3).await?;
        tcp_write_obj(
            &mut stream,
            &RegistryMsg::Register {
                addr: addr.parse()?,
                role,
            },
        )
        .await?;
        Ok((stream, BytesMut::new()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fan_out_to_earlier_replicas() -> Result<(), RoomkeeperError> {
        let registry =
            RegistryServer::new_and_setup("127.0.0.1:0".parse()?).await?;
        let reg_addr = registry.local_addr();

        let (mut r1, mut buf1) =
            register_raw(reg_addr, "127.0.0.1:41001", ReplicaRole::Acceptor)
                .await?;
        assert!(poll_until(|| registry.registered().len() == 1).await);
        let (mut r2, mut buf2) =
            register_raw(reg_addr, "127.0.0.1:41002", ReplicaRole::Acceptor)
                .await?;
        assert!(poll_until(|| registry.registered().len() == 2).await);

        // r1 hears about r2
        let msg: RegistryMsg = timeout(
            Duration::from_secs(5),
            safe_tcp_read(&mut buf1, &mut r1),
        )
        .await??;
        assert_eq!(
            msg,
            RegistryMsg::StartConnection {
                addr: "127.0.0.1:41002".parse()?,
                role: ReplicaRole::Acceptor,
            }
        );

        let (mut r3, mut buf3) =
            register_raw(reg_addr, "0.0.0.0:41003", ReplicaRole::Proposer)
                .await?;
        let expected = RegistryMsg::StartConnection {
            addr: "127.0.0.1:41003".parse()?,
            role: ReplicaRole::Proposer,
        };
        for (conn, buf) in [(&mut r1, &mut buf1), (&mut r2, &mut buf2)] {
            let msg: RegistryMsg =
                timeout(Duration::from_secs(5), safe_tcp_read(buf, conn))
                    .await??;
            assert_eq!(msg, expected);
        }

        // exactly one directive each, and none for the newcomer
        for (conn, buf) in
            [(&mut r1, &mut buf1), (&mut r2, &mut buf2), (&mut r3, &mut buf3)]
        {
            let extra = timeout(
                Duration::from_millis(300),
                safe_tcp_read::<RegistryMsg, _>(buf, conn),
            )
            .await;
            assert!(extra.is_err());
        }
        assert_eq!(
            registry.registered(),
            vec![
                ("127.0.0.1:41001".parse::<SocketAddr>()?, ReplicaRole::Acceptor),
                ("127.0.0.1:41002".parse::<SocketAddr>()?, ReplicaRole::Acceptor),
                ("127.0.0.1:41003".parse::<SocketAddr>()?, ReplicaRole::Proposer),
            ]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_replica_forgotten() -> Result<(), RoomkeeperError> {
        let registry =
            RegistryServer::new_and_setup("127.0.0.1:0".parse()?).await?;
        let (r1, _) = register_raw(
            registry.local_addr(),
            "127.0.0.1:42001",
            ReplicaRole::Learner,
        )
        .await?;
        assert!(poll_until(|| registry.registered().len() == 1).await);
        drop(r1);
        assert!(poll_until(|| registry.registered().is_empty()).await);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_connection_blocks_nothing() -> Result<(), RoomkeeperError> {
        let registry =
            RegistryServer::new_and_setup("127.0.0.1:0".parse()?).await?;
        let _silent = tcp_connect_with_retry(registry.local_addr(), 3).await?;
        let (_r1, _) = register_raw(
            registry.local_addr(),
            "127.0.0.1:43001",
            ReplicaRole::Acceptor,
        )
        .await?;
        assert!(poll_until(|| registry.registered().len() == 1).await);
        Ok(())
    }
}

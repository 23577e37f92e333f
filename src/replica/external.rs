//! Client-facing API: one servant per connected client, answering directory
//! requests from the local directory and submitting mutations for
//! replication.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::directory::{ChatroomId, LoginCheck, Transaction};
use crate::multicast::GroupMsg;
use crate::replica::failover::{announce, open_lease};
use crate::replica::ReplicaContext;
use crate::utils::{
    safe_tcp_read, tcp_bind_with_retry, tcp_write_obj, RoomkeeperError,
};

/// Request from a client to a replica.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    Login { user: String, pass: String },

    /// Create an account; logs the new user in on success.
    Register { user: String, pass: String },

    Logout { user: String },

    /// Create a chatroom hosted by `user`, who is the requesting client.
    CreateChat { name: String, user: String },

    /// Take over hosting an existing chatroom after succession.
    RecreateChat { name: String, user: String },

    JoinChat { name: String, user: String },

    GetMembers { name: String },

    GetRoomCounts,

    GetHistory { name: String },

    /// Record the port the chatroom's host accepts members on.
    UpdatePort { name: String, port: u16 },

    /// Tell the chatroom's members where the new host accepts them.
    NotifyRecreation {
        name: String,
        new_host: String,
        port: u16,
    },
}

/// Reply from a replica to a client request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ClientReply {
    Success,
    Incorrect,
    AlreadyLoggedIn,

    /// Username or chat name already taken.
    Exists,

    /// No such chatroom.
    NonExistent,

    /// The chatroom is yours to host; connect your status link to
    /// `heartbeat_addr`.
    ChatCreated {
        id: ChatroomId,
        group: Ipv4Addr,
        heartbeat_addr: SocketAddr,
    },

    /// Connect to the host at `host_addr` and listen on `group`.
    ChatJoined {
        host_addr: SocketAddr,
        group: Ipv4Addr,
    },

    Members(Vec<String>),

    /// `(chat name, member count)` pairs sorted by name.
    RoomCounts(Vec<(String, usize)>),

    /// `(sender, body)` pairs oldest first.
    History(Vec<(String, String)>),

    Failed { reason: String },
}

/// The client-facing API endpoint of a replica.
pub struct ClientApi {
    local_addr: SocketAddr,

    /// Join handle of the client acceptor thread.
    _acceptor_handle: JoinHandle<()>,
}

impl ClientApi {
    /// Binds the client listener and spawns the client acceptor thread.
    pub(crate) async fn new_and_setup(
        ctx: Arc<ReplicaContext>,
        bind_addr: SocketAddr,
    ) -> Result<Self, RoomkeeperError> {
        let listener =
            tcp_bind_with_retry(bind_addr, ctx.config.connect_retries).await?;
        let local_addr = listener.local_addr()?;

        let acceptor_handle =
            tokio::spawn(Self::client_acceptor_thread(ctx, listener));
        Ok(ClientApi {
            local_addr,
            _acceptor_handle: acceptor_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Client acceptor thread function.
    async fn client_acceptor_thread(
        ctx: Arc<ReplicaContext>,
        listener: TcpListener,
    ) {
        pf_debug!(ctx.me; "client_acceptor thread spawned");

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    pf_debug!(ctx.me; "accepted client '{}'", addr);
                    tokio::spawn(Self::client_servant_thread(
                        ctx.clone(),
                        stream,
                        addr,
                    ));
                }
                Err(e) => {
                    pf_warn!(ctx.me; "error accepting client: {}", e);
                }
            }
        }
    }

    /// Client servant thread function: serves one client's requests in
    /// order until it disconnects.
    async fn client_servant_thread(
        ctx: Arc<ReplicaContext>,
        stream: TcpStream,
        addr: SocketAddr,
    ) {
        let local_ip = match stream.local_addr() {
            Ok(local) => local.ip(),
            Err(e) => {
                pf_error!(ctx.me; "error getting local addr: {}", e);
                return;
            }
        };
        let (mut conn_read, mut conn_write) = stream.into_split();
        let mut read_buf = BytesMut::new();
        let mut servant = ClientServant {
            ctx,
            local_ip,
            peer_ip: addr.ip(),
            session_user: None,
        };

        loop {
            let req = match safe_tcp_read(&mut read_buf, &mut conn_read).await {
                Ok(req) => req,
                Err(e) => {
                    pf_debug!(servant.ctx.me; "client '{}' gone: {}", addr, e);
                    break;
                }
            };
            pf_trace!(servant.ctx.me; "request from '{}': {:?}", addr, req);

            let reply = servant.handle_req(req).await;
            if let Err(e) = tcp_write_obj(&mut conn_write, &reply).await {
                pf_warn!(servant.ctx.me; "error replying to '{}': {}", addr, e);
                break;
            }
        }

        servant.on_disconnect();
    }
}

/// Per-connection request handler.
struct ClientServant {
    ctx: Arc<ReplicaContext>,

    /// My address on this connection, where leases get bound.
    local_ip: IpAddr,

    /// The client's address, recorded as host address of its chatrooms.
    peer_ip: IpAddr,

    /// User logged in over this connection.
    session_user: Option<String>,
}

impl ClientServant {
    async fn handle_req(&mut self, req: ClientRequest) -> ClientReply {
        match req {
            ClientRequest::Login { user, pass } => self.handle_login(user, pass),
            ClientRequest::Register { user, pass } => {
                self.handle_register(user, pass)
            }
            ClientRequest::Logout { user } => {
                self.ctx.commit(Transaction::Logout { user: user.clone() });
                if self.session_user.as_deref() == Some(user.as_str()) {
                    self.session_user = None;
                }
                ClientReply::Success
            }
            ClientRequest::CreateChat { name, user } => {
                self.handle_create_chat(name, user).await
            }
            ClientRequest::RecreateChat { name, user } => {
                self.handle_recreate_chat(name, user).await
            }
            ClientRequest::JoinChat { name, user } => {
                self.handle_join_chat(name, user)
            }
            ClientRequest::GetMembers { name } => {
                self.ctx.directory.read(|d| match d.chatroom(&name) {
                    Some(room) => ClientReply::Members(room.members().to_vec()),
                    None => ClientReply::NonExistent,
                })
            }
            ClientRequest::GetRoomCounts => {
                ClientReply::RoomCounts(self.ctx.directory.read(|d| d.room_counts()))
            }
            ClientRequest::GetHistory { name } => {
                self.ctx.directory.read(|d| match d.chatroom(&name) {
                    Some(room) => ClientReply::History(
                        room.history()
                            .iter()
                            .map(|entry| {
                                (entry.sender.clone(), entry.body.clone())
                            })
                            .collect(),
                    ),
                    None => ClientReply::NonExistent,
                })
            }
            ClientRequest::UpdatePort { name, port } => {
                if self.ctx.directory.read(|d| d.chatroom(&name).is_none()) {
                    return ClientReply::NonExistent;
                }
                self.ctx.commit(Transaction::UpdatePort { name, port });
                ClientReply::Success
            }
            ClientRequest::NotifyRecreation {
                name,
                new_host,
                port,
            } => self.handle_notify_recreation(name, new_host, port).await,
        }
    }

    fn handle_login(&mut self, user: String, pass: String) -> ClientReply {
        let txn = Transaction::Login {
            user: user.clone(),
            pass: pass.clone(),
        };
        let check = self.ctx.directory.write(|d| {
            let check = d.check_login(&user, &pass);
            if check == LoginCheck::Success {
                d.apply(&txn);
            }
            check
        });

        match check {
            LoginCheck::Success => {
                pf_debug!(self.ctx.me; "{} logged in", user);
                self.ctx.propose(txn);
                self.session_user = Some(user);
                ClientReply::Success
            }
            LoginCheck::Incorrect => ClientReply::Incorrect,
            LoginCheck::AlreadyLoggedIn => ClientReply::AlreadyLoggedIn,
        }
    }

    fn handle_register(&mut self, user: String, pass: String) -> ClientReply {
        let txn = Transaction::Register {
            user: user.clone(),
            pass,
        };
        let created = self.ctx.directory.write(|d| {
            if d.has_account(&user) {
                return false;
            }
            d.apply(&txn);
            true
        });

        if created {
            pf_debug!(self.ctx.me; "{} registered", user);
            self.ctx.propose(txn);
            self.session_user = Some(user);
            ClientReply::Success
        } else {
            ClientReply::Exists
        }
    }

    async fn handle_create_chat(
        &mut self,
        name: String,
        user: String,
    ) -> ClientReply {
        let peer_ip = self.peer_ip;
        let allocated = self.ctx.directory.write(|d| {
            if d.chatroom(&name).is_some() {
                return Err(ClientReply::Exists);
            }
            let Some((id, group)) = d.next_allocation() else {
                return Err(ClientReply::Failed {
                    reason: "no free multicast group".into(),
                });
            };
            let txn = Transaction::CreateChat {
                name: name.clone(),
                host: user.clone(),
                host_addr: peer_ip,
                id,
                group,
            };
            d.apply(&txn);
            Ok((txn, id, group))
        });

        let (txn, id, group) = match allocated {
            Ok(allocated) => allocated,
            Err(reply) => return reply,
        };
        self.ctx.propose(txn);
        pf_info!(self.ctx.me; "'{}' created by {} as #{} on group {}",
                              name, user, id, group);

        match open_lease(&self.ctx, &name, &user, self.local_ip).await {
            Ok(heartbeat_addr) => ClientReply::ChatCreated {
                id,
                group,
                heartbeat_addr,
            },
            Err(e) => ClientReply::Failed {
                reason: e.to_string(),
            },
        }
    }

    async fn handle_recreate_chat(
        &mut self,
        name: String,
        user: String,
    ) -> ClientReply {
        let Some((id, group)) = self
            .ctx
            .directory
            .read(|d| d.chatroom(&name).map(|room| (room.id, room.group)))
        else {
            return ClientReply::NonExistent;
        };

        self.ctx.commit(Transaction::RecreateChat {
            name: name.clone(),
            new_host: user.clone(),
            new_host_addr: self.peer_ip,
        });
        pf_info!(self.ctx.me; "'{}' recreated by {}", name, user);

        match open_lease(&self.ctx, &name, &user, self.local_ip).await {
            Ok(heartbeat_addr) => ClientReply::ChatCreated {
                id,
                group,
                heartbeat_addr,
            },
            Err(e) => ClientReply::Failed {
                reason: e.to_string(),
            },
        }
    }

    fn handle_join_chat(&mut self, name: String, user: String) -> ClientReply {
        let Some((host_addr, group)) = self.ctx.directory.read(|d| {
            d.chatroom(&name).map(|room| {
                (SocketAddr::new(room.host_addr, room.client_port), room.group)
            })
        }) else {
            return ClientReply::NonExistent;
        };

        self.ctx.commit(Transaction::JoinChat { name, user });
        ClientReply::ChatJoined { host_addr, group }
    }

    async fn handle_notify_recreation(
        &mut self,
        name: String,
        new_host: String,
        port: u16,
    ) -> ClientReply {
        let Some(group) =
            self.ctx.directory.read(|d| d.chatroom(&name).map(|room| room.group))
        else {
            return ClientReply::NonExistent;
        };

        announce(
            &self.ctx,
            group,
            &GroupMsg::NotifyRecreation {
                new_host,
                address: self.peer_ip,
                port,
            },
        )
        .await;
        ClientReply::Success
    }

    /// Cleans up after the client's connection closed without a logout.
    /// Users hosting through this replica are left to their lease.
    fn on_disconnect(&mut self) {
        let Some(user) = self.session_user.take() else {
            return;
        };
        if self.ctx.hosts_any(&user) {
            return;
        }
        pf_info!(self.ctx.me; "{} disconnected", user);
        self.ctx.commit(Transaction::Disconnect { user });
    }
}

//! Directory client endpoint: request/reply access to the replicas, moving
//! on to the next replica whenever the current one fails.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::directory::ChatroomId;
use crate::replica::{ClientReply, ClientRequest};
use crate::utils::{
    safe_tcp_read, tcp_connect_with_retry, tcp_write_obj, RoomkeeperError,
};

/// Open connection to one replica.
struct ReplicaConn {
    addr: SocketAddr,
    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,
    read_buf: BytesMut,
}

/// Directory client endpoint.
pub struct DirectoryClient {
    /// My identity string for logging.
    me: String,

    /// Replica client API addresses, tried in order.
    servers: Vec<SocketAddr>,

    /// Index into `servers` of the replica to use next.
    current: usize,

    conn: Option<ReplicaConn>,
}

/// Where a created or re-created chatroom lives.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ChatGrant {
    pub id: ChatroomId,
    pub group: Ipv4Addr,
    pub heartbeat_addr: SocketAddr,
}

impl DirectoryClient {
    /// Creates a client that talks to the given replicas, connecting
    /// lazily on the first request.
    pub fn new(
        me: impl ToString,
        servers: Vec<SocketAddr>,
    ) -> Result<Self, RoomkeeperError> {
        let me = me.to_string();
        if servers.is_empty() {
            return logged_err!(me; "no replica addresses given");
        }
        Ok(DirectoryClient {
            me,
            servers,
            current: 0,
            conn: None,
        })
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Address of the replica currently connected to, if any.
    pub fn connected_to(&self) -> Option<SocketAddr> {
        self.conn.as_ref().map(|conn| conn.addr)
    }

    /// Connects to the first reachable replica starting from `current`.
    async fn connect(&mut self) -> Result<(), RoomkeeperError> {
        for _ in 0..self.servers.len() {
            let addr = self.servers[self.current];
            match tcp_connect_with_retry(addr, 0).await {
                Ok(stream) => {
                    let (conn_read, conn_write) = stream.into_split();
                    self.conn = Some(ReplicaConn {
                        addr,
                        conn_read,
                        conn_write,
                        read_buf: BytesMut::new(),
                    });
                    pf_debug!(self.me; "connected to replica '{}'", addr);
                    return Ok(());
                }
                Err(e) => {
                    pf_warn!(self.me; "replica '{}' unreachable: {}", addr, e);
                    self.current = (self.current + 1) % self.servers.len();
                }
            }
        }
        logged_err!(self.me; "no replica reachable")
    }

    /// Sends a request and waits for its reply. If the replica fails along
    /// the way, the request is retried on the next replica.
    pub async fn request(
        &mut self,
        req: &ClientRequest,
    ) -> Result<ClientReply, RoomkeeperError> {
        for _ in 0..self.servers.len() {
            if self.conn.is_none() {
                self.connect().await?;
            }
            let Some(conn) = self.conn.as_mut() else {
                continue;
            };

            let result = async {
                tcp_write_obj(&mut conn.conn_write, req).await?;
                safe_tcp_read::<ClientReply, _>(
                    &mut conn.read_buf,
                    &mut conn.conn_read,
                )
                .await
            }
            .await;
            match result {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    pf_warn!(self.me; "replica '{}' failed: {}", conn.addr, e);
                    self.conn = None;
                    self.current = (self.current + 1) % self.servers.len();
                }
            }
        }
        logged_err!(self.me; "request failed on every replica")
    }

    pub async fn register(
        &mut self,
        user: &str,
        pass: &str,
    ) -> Result<ClientReply, RoomkeeperError> {
        self.request(&ClientRequest::Register {
            user: user.into(),
            pass: pass.into(),
        })
        .await
    }

    pub async fn login(
        &mut self,
        user: &str,
        pass: &str,
    ) -> Result<ClientReply, RoomkeeperError> {
        self.request(&ClientRequest::Login {
            user: user.into(),
            pass: pass.into(),
        })
        .await
    }

    pub async fn logout(
        &mut self,
        user: &str,
    ) -> Result<ClientReply, RoomkeeperError> {
        self.request(&ClientRequest::Logout { user: user.into() })
            .await
    }

    pub async fn create_chat(
        &mut self,
        name: &str,
        user: &str,
    ) -> Result<ClientReply, RoomkeeperError> {
        self.request(&ClientRequest::CreateChat {
            name: name.into(),
            user: user.into(),
        })
        .await
    }

    pub async fn recreate_chat(
        &mut self,
        name: &str,
        user: &str,
    ) -> Result<ClientReply, RoomkeeperError> {
        self.request(&ClientRequest::RecreateChat {
            name: name.into(),
            user: user.into(),
        })
        .await
    }

    pub async fn join_chat(
        &mut self,
        name: &str,
        user: &str,
    ) -> Result<ClientReply, RoomkeeperError> {
        self.request(&ClientRequest::JoinChat {
            name: name.into(),
            user: user.into(),
        })
        .await
    }

    /// Member list of a chatroom, `None` if it does not exist.
    pub async fn members(
        &mut self,
        name: &str,
    ) -> Result<Option<Vec<String>>, RoomkeeperError> {
        match self
            .request(&ClientRequest::GetMembers { name: name.into() })
            .await?
        {
            ClientReply::Members(members) => Ok(Some(members)),
            ClientReply::NonExistent => Ok(None),
            reply => logged_err!(self.me; "unexpected reply {:?}", reply),
        }
    }

    pub async fn room_counts(
        &mut self,
    ) -> Result<Vec<(String, usize)>, RoomkeeperError> {
        match self.request(&ClientRequest::GetRoomCounts).await? {
            ClientReply::RoomCounts(counts) => Ok(counts),
            reply => logged_err!(self.me; "unexpected reply {:?}", reply),
        }
    }

    /// Message history of a chatroom, `None` if it does not exist.
    pub async fn history(
        &mut self,
        name: &str,
    ) -> Result<Option<Vec<(String, String)>>, RoomkeeperError> {
        match self
            .request(&ClientRequest::GetHistory { name: name.into() })
            .await?
        {
            ClientReply::History(history) => Ok(Some(history)),
            ClientReply::NonExistent => Ok(None),
            reply => logged_err!(self.me; "unexpected reply {:?}", reply),
        }
    }

    pub async fn update_port(
        &mut self,
        name: &str,
        port: u16,
    ) -> Result<ClientReply, RoomkeeperError> {
        self.request(&ClientRequest::UpdatePort {
            name: name.into(),
            port,
        })
        .await
    }

    pub async fn notify_recreation(
        &mut self,
        name: &str,
        new_host: &str,
        port: u16,
    ) -> Result<ClientReply, RoomkeeperError> {
        self.request(&ClientRequest::NotifyRecreation {
            name: name.into(),
            new_host: new_host.into(),
            port,
        })
        .await
    }
}

/// Unpacks a `ChatCreated` reply.
pub(crate) fn expect_grant(
    me: &str,
    reply: ClientReply,
) -> Result<ChatGrant, RoomkeeperError> {
    match reply {
        ClientReply::ChatCreated {
            id,
            group,
            heartbeat_addr,
        } => Ok(ChatGrant {
            id,
            group,
            heartbeat_addr,
        }),
        reply => logged_err!(me; "chatroom not granted: {:?}", reply),
    }
}

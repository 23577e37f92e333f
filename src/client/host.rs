//! Chatroom host endpoint: accepts members, relays their messages to the
//! chatroom's group, and keeps the status link to the replica that holds
//! the chatroom's lease.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::client::{expect_grant, ChatGrant, DirectoryClient, DisplayEvent};
use crate::directory::ChatroomId;
use crate::multicast::{GroupChannel, GroupMsg, GroupSender};
use crate::replica::{ClientReply, StatusMsg};
use crate::utils::{
    safe_tcp_read, tcp_bind_with_retry, tcp_connect_with_retry, tcp_write_obj,
    RoomkeeperError,
};

/// Message from a chatroom member to its host.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum MemberMsg {
    Message { sender: String, body: String },

    /// Member is leaving the chatroom, logging out as well if `logout`.
    Leave { user: String, logout: bool },
}

/// Command from the owning handle to the host thread.
#[derive(Debug)]
enum HostCmd {
    Send { body: String },
    Leave { logout: bool },
}

/// A chatroom host endpoint.
pub struct ChatroomHost {
    user: String,
    chat: String,
    id: ChatroomId,
    group: Ipv4Addr,

    /// Where members connect.
    member_addr: SocketAddr,

    tx_cmd: mpsc::UnboundedSender<HostCmd>,
    rx_event: mpsc::UnboundedReceiver<DisplayEvent>,

    /// Join handle of the host thread.
    host_handle: JoinHandle<()>,
}

impl ChatroomHost {
    /// Creates chatroom `chat` hosted by `user`, accepting members on
    /// `bind_ip` and relaying on the group through `channel`.
    pub async fn create(
        client: &mut DirectoryClient,
        chat: &str,
        user: &str,
        bind_ip: IpAddr,
        channel: GroupChannel,
    ) -> Result<Self, RoomkeeperError> {
        let grant = expect_grant(user, client.create_chat(chat, user).await?)?;
        Self::start(client, chat, user, grant, bind_ip, channel).await
    }

    /// Takes over hosting `chat` after `user` was announced its new host.
    /// Returns the chatroom's history, oldest first, for replay. The
    /// history is fetched before members can connect, and members are told
    /// where to reconnect only after that.
    pub async fn recreate(
        client: &mut DirectoryClient,
        chat: &str,
        user: &str,
        bind_ip: IpAddr,
        channel: GroupChannel,
    ) -> Result<(Self, Vec<(String, String)>), RoomkeeperError> {
        let grant =
            expect_grant(user, client.recreate_chat(chat, user).await?)?;
        let history = client.history(chat).await?.unwrap_or_default();
        let host =
            Self::start(client, chat, user, grant, bind_ip, channel).await?;

        match client
            .notify_recreation(chat, user, host.member_addr.port())
            .await?
        {
            ClientReply::Success => {}
            reply => {
                pf_warn!(user; "members of '{}' not notified: {:?}", chat, reply)
            }
        }
        Ok((host, history))
    }

    /// Connects the status link, opens the member listener, records its
    /// port in the directory and spawns the host thread.
    async fn start(
        client: &mut DirectoryClient,
        chat: &str,
        user: &str,
        grant: ChatGrant,
        bind_ip: IpAddr,
        channel: GroupChannel,
    ) -> Result<Self, RoomkeeperError> {
        let status = tcp_connect_with_retry(grant.heartbeat_addr, 3).await?;
        let (status_read, status_write) = status.into_split();

        let member_listener =
            tcp_bind_with_retry(SocketAddr::new(bind_ip, 0), 0).await?;
        let member_addr = member_listener.local_addr()?;
        match client.update_port(chat, member_addr.port()).await? {
            ClientReply::Success => {}
            reply => {
                return logged_err!(user; "port of '{}' not recorded: {:?}",
                                         chat, reply)
            }
        }

        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let relay = Relay {
            user: user.into(),
            group: grant.group,
            multicast_port: channel.port,
            sender: GroupSender::new(channel.interface)?,
            status_write,
            tx_event,
        };
        let host_handle = tokio::spawn(Self::host_thread(
            relay,
            status_read,
            member_listener,
            rx_cmd,
        ));

        pf_info!(user; "hosting '{}' #{} on group {}, members at '{}'",
                       chat, grant.id, grant.group, member_addr);
        Ok(ChatroomHost {
            user: user.into(),
            chat: chat.into(),
            id: grant.id,
            group: grant.group,
            member_addr,
            tx_cmd,
            rx_event,
            host_handle,
        })
    }

    pub fn chat(&self) -> &str {
        &self.chat
    }

    pub fn id(&self) -> ChatroomId {
        self.id
    }

    pub fn group(&self) -> Ipv4Addr {
        self.group
    }

    pub fn member_addr(&self) -> SocketAddr {
        self.member_addr
    }

    /// Sends a message of my own to the chatroom.
    pub fn send_message(&self, body: &str) -> Result<(), RoomkeeperError> {
        self.tx_cmd.send(HostCmd::Send { body: body.into() })?;
        Ok(())
    }

    /// Waits for the next display event; `None` once the host thread is
    /// gone.
    pub async fn recv_event(&mut self) -> Option<DisplayEvent> {
        self.rx_event.recv().await
    }

    /// Leaves the chatroom cooperatively, handing it to the next member in
    /// line, and waits for the replica to release me.
    pub async fn leave(self, logout: bool) -> Result<(), RoomkeeperError> {
        pf_info!(self.user; "leaving '{}' (logout {})", self.chat, logout);
        self.tx_cmd.send(HostCmd::Leave { logout })?;
        self.host_handle
            .await
            .map_err(|e| RoomkeeperError::msg(e.to_string()))
    }

    /// Stops hosting abruptly, closing every connection without notice as
    /// if the process died.
    pub fn crash(self) {
        pf_warn!(self.user; "host of '{}' crashing", self.chat);
        self.host_handle.abort();
    }
}

/// Host thread's outbound side.
struct Relay {
    user: String,
    group: Ipv4Addr,
    multicast_port: u16,
    sender: GroupSender,
    status_write: OwnedWriteHalf,
    tx_event: mpsc::UnboundedSender<DisplayEvent>,
}

impl Relay {
    /// Fans a message out to the group, reports it to the replica and shows
    /// it locally.
    async fn relay(
        &mut self,
        sender: String,
        body: String,
    ) -> Result<(), RoomkeeperError> {
        self.sender
            .send(
                self.group,
                self.multicast_port,
                &GroupMsg::Message {
                    sender: sender.clone(),
                    body: body.clone(),
                },
            )
            .await?;
        tcp_write_obj(
            &mut self.status_write,
            &StatusMsg::MessageSent {
                sender: sender.clone(),
                body: body.clone(),
            },
        )
        .await?;
        self.show(DisplayEvent::Message { sender, body });
        Ok(())
    }

    fn show(&self, event: DisplayEvent) {
        if self.tx_event.send(event).is_err() {
            pf_trace!(self.user; "display event dropped");
        }
    }
}

// ChatroomHost host thread implementation
impl ChatroomHost {
    /// Member reader thread function: forwards one member's messages.
    async fn member_reader_thread(
        user: String,
        stream: TcpStream,
        tx_member: mpsc::UnboundedSender<MemberMsg>,
    ) {
        let (mut conn_read, _conn_write) = stream.into_split();
        let mut read_buf = BytesMut::new();
        loop {
            match safe_tcp_read(&mut read_buf, &mut conn_read).await {
                Ok(msg) => {
                    if tx_member.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    pf_debug!(user; "member connection ended: {}", e);
                    break;
                }
            }
        }
    }

    /// Host thread function.
    async fn host_thread(
        mut relay: Relay,
        mut status_read: OwnedReadHalf,
        member_listener: TcpListener,
        mut rx_cmd: mpsc::UnboundedReceiver<HostCmd>,
    ) {
        let me = relay.user.clone();
        pf_debug!(me; "host thread spawned");

        let (tx_member, mut rx_member) = mpsc::unbounded_channel();
        // aborted along with this thread when dropped
        let mut readers = JoinSet::new();
        let mut read_buf = BytesMut::new();

        loop {
            tokio::select! {
                // heartbeat or directive from the replica
                msg = safe_tcp_read::<StatusMsg, _>(&mut read_buf, &mut status_read) => {
                    match msg {
                        Ok(StatusMsg::Heartbeat) => {
                            pf_trace!(me; "heartbeat");
                        }
                        Ok(StatusMsg::RemoveDisplay) => {
                            relay.show(DisplayEvent::Removed);
                            break;
                        }
                        Ok(msg) => {
                            pf_warn!(me; "unexpected status msg {:?}", msg);
                        }
                        Err(e) => {
                            pf_error!(me; "status link lost: {}", e);
                            relay.show(DisplayEvent::Removed);
                            break;
                        }
                    }
                },

                // new member connection
                accepted = member_listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            pf_debug!(me; "member connected from '{}'", addr);
                            readers.spawn(Self::member_reader_thread(
                                me.clone(),
                                stream,
                                tx_member.clone(),
                            ));
                        }
                        Err(e) => {
                            pf_warn!(me; "error accepting member: {}", e);
                        }
                    }
                },

                // message from a member
                msg = rx_member.recv() => {
                    let result = match msg {
                        Some(MemberMsg::Message { sender, body }) => {
                            relay.relay(sender, body).await
                        }
                        Some(MemberMsg::Leave { user, logout }) => {
                            pf_debug!(me; "member {} leaving", user);
                            tcp_write_obj(
                                &mut relay.status_write,
                                &StatusMsg::MemberLeft { user, logout },
                            )
                            .await
                        }
                        None => Ok(()), // tx_member is held here
                    };
                    if let Err(e) = result {
                        pf_error!(me; "error relaying member msg: {}", e);
                    }
                },

                // command from my owner
                cmd = rx_cmd.recv() => {
                    let result = match cmd {
                        Some(HostCmd::Send { body }) => {
                            relay.relay(me.clone(), body).await
                        }
                        Some(HostCmd::Leave { logout }) => {
                            let user = me.clone();
                            let msg = if logout {
                                StatusMsg::HostLoggingOut { user }
                            } else {
                                StatusMsg::HostReturningToSelection { user }
                            };
                            tcp_write_obj(&mut relay.status_write, &msg).await
                        }
                        None => break,
                    };
                    if let Err(e) = result {
                        pf_error!(me; "error handling host command: {}", e);
                    }
                },
            }
        }

        readers.shutdown().await;
        pf_debug!(me; "host thread exited");
    }
}

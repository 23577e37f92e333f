//! Chatroom member endpoint: sends messages to the host, displays what the
//! group carries, and follows the chatroom through host changes.

use std::future;
use std::net::{IpAddr, SocketAddr};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::{ChatroomHost, DirectoryClient, DisplayEvent, MemberMsg};
use crate::multicast::{GroupChannel, GroupListener, GroupMsg};
use crate::replica::ClientReply;
use crate::utils::{tcp_connect_with_retry, tcp_write_obj, RoomkeeperError};

/// Command from the owning handle to the member thread.
#[derive(Debug)]
enum MemberCmd {
    Send { body: String },
    Leave { logout: bool },
}

/// What a member endpoint currently is in its chatroom.
struct MemberLink {
    user: String,
    chat: String,
    servers: Vec<SocketAddr>,
    bind_ip: IpAddr,
    channel: GroupChannel,

    /// Connection to the host while I am an ordinary member.
    to_host: Option<OwnedWriteHalf>,

    /// Group listener while I am an ordinary member.
    listener: Option<GroupListener>,

    /// Set once I have been promoted to host.
    host: Option<ChatroomHost>,

    tx_event: mpsc::UnboundedSender<DisplayEvent>,
}

/// A chatroom member endpoint.
pub struct ChatroomMember {
    user: String,
    chat: String,

    tx_cmd: mpsc::UnboundedSender<MemberCmd>,
    rx_event: mpsc::UnboundedReceiver<DisplayEvent>,

    /// Join handle of the member thread.
    member_handle: JoinHandle<()>,
}

impl ChatroomMember {
    /// Joins chatroom `chat` as `user`: connects to its host and starts
    /// listening on its group. Should I be announced the next host, the
    /// chatroom is re-created through a fresh directory client on the same
    /// replicas, accepting members on `bind_ip`.
    pub async fn join(
        client: &mut DirectoryClient,
        chat: &str,
        user: &str,
        bind_ip: IpAddr,
        channel: GroupChannel,
    ) -> Result<Self, RoomkeeperError> {
        let (host_addr, group) = match client.join_chat(chat, user).await? {
            ClientReply::ChatJoined { host_addr, group } => (host_addr, group),
            reply => {
                return logged_err!(user; "cannot join '{}': {:?}", chat, reply)
            }
        };

        let listener = GroupListener::bind(group, channel)?;
        let stream = tcp_connect_with_retry(host_addr, 3).await?;
        let (_, to_host) = stream.into_split();
        pf_info!(user; "joined '{}' hosted at '{}'", chat, host_addr);

        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let link = MemberLink {
            user: user.into(),
            chat: chat.into(),
            servers: client.servers().to_vec(),
            bind_ip,
            channel,
            to_host: Some(to_host),
            listener: Some(listener),
            host: None,
            tx_event,
        };
        let member_handle = tokio::spawn(Self::member_thread(link, rx_cmd));

        Ok(ChatroomMember {
            user: user.into(),
            chat: chat.into(),
            tx_cmd,
            rx_event,
            member_handle,
        })
    }

    pub fn chat(&self) -> &str {
        &self.chat
    }

    /// Sends a message to the chatroom through its current host.
    pub fn send_message(&self, body: &str) -> Result<(), RoomkeeperError> {
        self.tx_cmd.send(MemberCmd::Send { body: body.into() })?;
        Ok(())
    }

    /// Waits for the next display event; `None` once the member thread is
    /// gone.
    pub async fn recv_event(&mut self) -> Option<DisplayEvent> {
        self.rx_event.recv().await
    }

    /// Leaves the chatroom, logging out as well if `logout`.
    pub async fn leave(self, logout: bool) -> Result<(), RoomkeeperError> {
        pf_info!(self.user; "leaving '{}' (logout {})", self.chat, logout);
        self.tx_cmd.send(MemberCmd::Leave { logout })?;
        self.member_handle
            .await
            .map_err(|e| RoomkeeperError::msg(e.to_string()))
    }
}

impl MemberLink {
    fn show(&self, event: DisplayEvent) {
        if self.tx_event.send(event).is_err() {
            pf_trace!(self.user; "display event dropped");
        }
    }

    async fn recv_group(
        listener: &mut Option<GroupListener>,
    ) -> Result<GroupMsg, RoomkeeperError> {
        match listener {
            Some(listener) => listener.recv().await,
            None => future::pending().await,
        }
    }

    async fn recv_host_event(
        host: &mut Option<ChatroomHost>,
    ) -> Option<DisplayEvent> {
        match host {
            Some(host) => host.recv_event().await,
            None => future::pending().await,
        }
    }

    /// Handles a command; returns false once I have left.
    async fn handle_cmd(
        &mut self,
        cmd: MemberCmd,
    ) -> Result<bool, RoomkeeperError> {
        match cmd {
            MemberCmd::Send { body } => {
                if let Some(host) = &self.host {
                    host.send_message(&body)?;
                } else if let Some(to_host) = &mut self.to_host {
                    tcp_write_obj(
                        to_host,
                        &MemberMsg::Message {
                            sender: self.user.clone(),
                            body,
                        },
                    )
                    .await?;
                }
                Ok(true)
            }
            MemberCmd::Leave { logout } => {
                if let Some(host) = self.host.take() {
                    host.leave(logout).await?;
                } else if let Some(to_host) = &mut self.to_host {
                    tcp_write_obj(
                        to_host,
                        &MemberMsg::Leave {
                            user: self.user.clone(),
                            logout,
                        },
                    )
                    .await?;
                }
                Ok(false)
            }
        }
    }

    /// Handles a group message; returns false if the chatroom stopped.
    async fn handle_group_msg(
        &mut self,
        msg: GroupMsg,
    ) -> Result<bool, RoomkeeperError> {
        match msg {
            GroupMsg::Message { sender, body } => {
                self.show(DisplayEvent::Message { sender, body });
            }
            GroupMsg::NewHost { username } if username == self.user => {
                self.promote().await?;
            }
            GroupMsg::NewHost { username } => {
                pf_debug!(self.user; "{} announced host of '{}'", username, self.chat);
                self.show(DisplayEvent::NewHost { username });
            }
            GroupMsg::NotifyRecreation {
                new_host,
                address,
                port,
            } => {
                if new_host != self.user {
                    let host_addr = SocketAddr::new(address, port);
                    let stream = tcp_connect_with_retry(host_addr, 3).await?;
                    let (_, to_host) = stream.into_split();
                    self.to_host = Some(to_host);
                    pf_info!(self.user; "reconnected to {} at '{}'", new_host, host_addr);
                    self.show(DisplayEvent::Reconnected { new_host, host_addr });
                }
            }
            GroupMsg::StopMulticast => {
                self.show(DisplayEvent::Removed);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// I was announced the next host: re-create the chatroom and replay its
    /// history.
    async fn promote(&mut self) -> Result<(), RoomkeeperError> {
        pf_info!(self.user; "taking over '{}'", self.chat);
        // hosts do not follow their own group
        self.listener = None;
        self.to_host = None;

        let mut client = DirectoryClient::new(&self.user, self.servers.clone())?;
        let (host, history) = ChatroomHost::recreate(
            &mut client,
            &self.chat,
            &self.user,
            self.bind_ip,
            self.channel,
        )
        .await?;
        self.host = Some(host);
        self.show(DisplayEvent::PromotedToHost { history });
        Ok(())
    }
}

// ChatroomMember member thread implementation
impl ChatroomMember {
    /// Member thread function.
    async fn member_thread(
        mut link: MemberLink,
        mut rx_cmd: mpsc::UnboundedReceiver<MemberCmd>,
    ) {
        let me = link.user.clone();
        pf_debug!(me; "member thread spawned");

        loop {
            tokio::select! {
                // command from my owner
                cmd = rx_cmd.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    match link.handle_cmd(cmd).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            pf_error!(me; "error handling member command: {}", e);
                        }
                    }
                },

                // traffic on the chatroom's group
                msg = MemberLink::recv_group(&mut link.listener) => {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) => {
                            pf_error!(me; "group listener failed: {}", e);
                            break;
                        }
                    };
                    match link.handle_group_msg(msg).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            pf_error!(me; "error following group: {}", e);
                        }
                    }
                },

                // display event of the chatroom I now host
                event = MemberLink::recv_host_event(&mut link.host) => {
                    match event {
                        Some(DisplayEvent::Removed) | None => {
                            link.host = None;
                            link.show(DisplayEvent::Removed);
                            break;
                        }
                        Some(event) => link.show(event),
                    }
                },
            }
        }

        pf_debug!(me; "member thread exited");
    }
}

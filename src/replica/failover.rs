//! Chatroom failover controller: one heartbeat lease per chatroom hosted
//! through this replica, plus the succession logic run when its host is
//! lost or leaves.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;

use rand::Rng;

use serde::{Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::directory::{Succession, Transaction};
use crate::multicast::GroupMsg;
use crate::replica::ReplicaContext;
use crate::utils::{
    safe_tcp_read, tcp_bind_with_retry, tcp_write_obj, RoomkeeperError,
};

/// Message on the status channel between a replica and a chatroom host.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum StatusMsg {
    /// Replica -> Host: periodic liveness marker, not answered.
    Heartbeat,

    /// Replica -> Host: tear down your chatroom display.
    RemoveDisplay,

    /// Host -> Replica: a message was relayed to the chatroom.
    MessageSent { sender: String, body: String },

    /// Host -> Replica: a member left, logging out as well if `logout`.
    MemberLeft { user: String, logout: bool },

    /// Host -> Replica: I am logging out.
    HostLoggingOut { user: String },

    /// Host -> Replica: I am going back to chat selection.
    HostReturningToSelection { user: String },
}

/// Bookkeeping of a live lease, kept in the replica context.
#[derive(Debug)]
pub(crate) struct HostedRoom {
    pub(crate) host_user: String,
    lease_id: u64,
    handle: JoinHandle<()>,
}

/// Why a lease ended.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Departure {
    /// Heartbeat write failed or the connection closed.
    Lost,

    /// Host announced it is leaving.
    Announced { logout: bool },
}

/// Binds a fresh heartbeat/status listener for `host` of `chat` and spawns
/// its lease, replacing any lease this replica held for the chatroom.
/// Returns the address the host should connect to.
pub(crate) async fn open_lease(
    ctx: &Arc<ReplicaContext>,
    chat: &str,
    host: &str,
    bind_ip: IpAddr,
) -> Result<SocketAddr, RoomkeeperError> {
    let listener = tcp_bind_with_retry(SocketAddr::new(bind_ip, 0), 0).await?;
    let lease_addr = listener.local_addr()?;
    let lease_id = ctx.next_lease_id();

    let handle = tokio::spawn(lease_thread(
        ctx.clone(),
        chat.to_string(),
        host.to_string(),
        lease_id,
        listener,
    ));
    let previous = ctx.hosted_rooms().insert(
        chat.to_string(),
        HostedRoom {
            host_user: host.to_string(),
            lease_id,
            handle,
        },
    );
    if let Some(previous) = previous {
        pf_debug!(ctx.me; "replacing lease of '{}' held by {}", chat,
                          previous.host_user);
        previous.handle.abort();
    }

    pf_info!(ctx.me; "lease for '{}' hosted by {} on '{}'", chat, host, lease_addr);
    Ok(lease_addr)
}

/// Forgets the lease of `chat` if it is still the one numbered `lease_id`.
fn release_lease(ctx: &ReplicaContext, chat: &str, lease_id: u64) {
    let mut hosted = ctx.hosted_rooms();
    if hosted.get(chat).is_some_and(|room| room.lease_id == lease_id) {
        hosted.remove(chat);
    }
}

/// Sends a tagged announcement to a chatroom's multicast group.
pub(crate) async fn announce(
    ctx: &ReplicaContext,
    group: std::net::Ipv4Addr,
    msg: &GroupMsg,
) {
    if let Err(e) = ctx
        .group_sender
        .send(group, ctx.config.multicast_port, msg)
        .await
    {
        pf_error!(ctx.me; "error announcing on group {}: {}", group, e);
    }
}

/// Runs the host-loss sequence: drop the host from the chatroom, replicate
/// that, then either announce the successor or report the teardown.
async fn host_departed(
    ctx: &ReplicaContext,
    chat: &str,
    host: &str,
    logout: bool,
) -> Succession {
    let succession = ctx
        .directory
        .write(|state| state.host_departed(chat, host, logout));
    ctx.propose(Transaction::HostLeft {
        chat: chat.into(),
        user: host.into(),
        logout,
    });

    match &succession {
        Succession::NewHost { successor, group } => {
            pf_info!(ctx.me; "'{}' passes from {} to {}", chat, host, successor);
            announce(
                ctx,
                *group,
                &GroupMsg::NewHost {
                    username: successor.clone(),
                },
            )
            .await;
        }
        Succession::TornDown { group } => {
            pf_info!(ctx.me; "'{}' torn down, group {} released", chat, group);
        }
        Succession::NotHost | Succession::Unknown => {
            pf_debug!(ctx.me; "{} left '{}' without hosting it", host, chat);
        }
    }
    succession
}

/// Heartbeats the host of `chat` and folds its status messages into
/// consensus rounds until it departs. A host that announced its departure
/// is told to remove its display.
async fn watch_host<R, W>(
    ctx: &ReplicaContext,
    chat: &str,
    host: &str,
    conn_read: &mut R,
    conn_write: &mut W,
) -> Departure
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut read_buf = BytesMut::new();
    let mut ticker =
        time::interval(Duration::from_millis(ctx.config.heartbeat_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let departure = loop {
        tokio::select! {
            // heartbeat marker to the host
            _ = ticker.tick() => {
                if let Err(e) = tcp_write_obj(conn_write, &StatusMsg::Heartbeat).await {
                    pf_warn!(ctx.me; "heartbeat to host {} of '{}' failed: {}",
                                     host, chat, e);
                    break Departure::Lost;
                }
            },

            // status pushed by the host
            msg = safe_tcp_read::<StatusMsg, _>(&mut read_buf, conn_read) => {
                match msg {
                    Ok(StatusMsg::MessageSent { sender, body }) => {
                        let msg_id = rand::thread_rng().gen::<u64>();
                        ctx.commit(Transaction::MessageSent {
                            chat: chat.to_string(),
                            sender,
                            body,
                            msg_id,
                        });
                    }
                    Ok(StatusMsg::MemberLeft { user, logout }) => {
                        ctx.commit(Transaction::MemberLeft {
                            chat: chat.to_string(),
                            user,
                            logout,
                        });
                    }
                    Ok(StatusMsg::HostLoggingOut { user }) => {
                        if user != host {
                            pf_warn!(ctx.me; "{} logged out on behalf of {}", user, host);
                        }
                        break Departure::Announced { logout: true };
                    }
                    Ok(StatusMsg::HostReturningToSelection { user }) => {
                        if user != host {
                            pf_warn!(ctx.me; "{} left on behalf of {}", user, host);
                        }
                        break Departure::Announced { logout: false };
                    }
                    Ok(msg) => {
                        pf_warn!(ctx.me; "unexpected status msg {:?}", msg);
                    }
                    Err(e) => {
                        pf_warn!(ctx.me; "lost host {} of '{}': {}", host, chat, e);
                        break Departure::Lost;
                    }
                }
            },
        }
    };

    if let Departure::Announced { .. } = departure {
        if let Err(e) =
            tcp_write_obj(conn_write, &StatusMsg::RemoveDisplay).await
        {
            pf_warn!(ctx.me; "error sending RemoveDisplay to {}: {}", host, e);
        }
    }
    departure
}

/// Lease thread function: waits for the host to connect, then heartbeats it
/// and folds its status messages into consensus rounds until it departs.
async fn lease_thread(
    ctx: Arc<ReplicaContext>,
    chat: String,
    host: String,
    lease_id: u64,
    listener: TcpListener,
) {
    pf_debug!(ctx.me; "lease thread for '{}' spawned", chat);

    let (stream, host_addr) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
            pf_error!(ctx.me; "error accepting host of '{}': {}", chat, e);
            release_lease(&ctx, &chat, lease_id);
            return;
        }
    };
    drop(listener);
    pf_debug!(ctx.me; "host of '{}' connected from '{}'", chat, host_addr);

    let (mut conn_read, mut conn_write) = stream.into_split();
    let departure =
        watch_host(&ctx, &chat, &host, &mut conn_read, &mut conn_write).await;
    let logout = match departure {
        Departure::Lost => true,
        Departure::Announced { logout } => logout,
    };

    release_lease(&ctx, &chat, lease_id);
    host_departed(&ctx, &chat, &host, logout).await;
    pf_debug!(ctx.me; "lease thread for '{}' exited", chat);
}

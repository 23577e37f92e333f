//! Chatroom multicast channel: tagged UDP datagrams sent to a chatroom's
//! group address. Used for ordinary chat fan-out and for host failover
//! announcements.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

use socket2::{Domain, Protocol, Socket, Type};

use tokio::net::UdpSocket;

use crate::codec::{decode_datagram, encode_datagram};
use crate::utils::RoomkeeperError;

/// Payload kinds carried on a chatroom's group.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum GroupMsg {
    /// Ordinary chat message relayed by the host.
    Message { sender: String, body: String },

    /// The named member should take over hosting the chatroom.
    NewHost { username: String },

    /// The chatroom now lives at a new host address; members other than the
    /// new host reconnect there.
    NotifyRecreation {
        new_host: String,
        address: IpAddr,
        port: u16,
    },

    /// Orderly receiver shutdown.
    StopMulticast,
}

/// Port and local interface a process uses for chatroom groups. The
/// unspecified interface leaves the choice to the routing table.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct GroupChannel {
    pub port: u16,
    pub interface: Ipv4Addr,
}

impl GroupChannel {
    pub fn new(port: u16) -> Self {
        GroupChannel {
            port,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Sends and joins groups through the interface owning `interface`.
    pub fn via(self, interface: Ipv4Addr) -> Self {
        GroupChannel { interface, ..self }
    }
}

/// Creates a non-blocking UDP socket that may share its port with other
/// sockets on the same host.
fn shared_udp_socket() -> Result<Socket, RoomkeeperError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Sending side, shared by everything in a process that announces on
/// chatroom groups.
#[derive(Debug)]
pub struct GroupSender {
    socket: UdpSocket,
}

impl GroupSender {
    /// Binds an ephemeral UDP socket for sending through `interface`.
    pub fn new(interface: Ipv4Addr) -> Result<Self, RoomkeeperError> {
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        if !interface.is_unspecified() {
            socket.set_multicast_if_v4(&interface)?;
        }
        socket.set_multicast_loop_v4(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
        Ok(GroupSender {
            socket: UdpSocket::from_std(socket.into())?,
        })
    }

    /// Sends one tagged datagram to the group.
    pub async fn send(
        &self,
        group: Ipv4Addr,
        port: u16,
        msg: &GroupMsg,
    ) -> Result<(), RoomkeeperError> {
        let datagram = encode_datagram(msg)?;
        self.socket.send_to(&datagram, (group, port)).await?;
        Ok(())
    }
}

/// Receiving side for one chatroom's group.
#[derive(Debug)]
pub struct GroupListener {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
}

impl GroupListener {
    /// Binds to the group's port with address reuse, so any number of
    /// listeners on one host can follow the same group. Joins the group on
    /// `channel.interface` if the address is a multicast one; a unicast
    /// address is simply bound as is, which lets a single receiver on a
    /// loopback address stand in for a group.
    pub fn bind(
        group: Ipv4Addr,
        channel: GroupChannel,
    ) -> Result<Self, RoomkeeperError> {
        let socket = shared_udp_socket()?;
        if group.is_multicast() {
            socket.join_multicast_v4(&group, &channel.interface)?;
            // binding the group address keeps out other groups on this port
            #[cfg(unix)]
            let bind_ip = group;
            #[cfg(not(unix))]
            let bind_ip = Ipv4Addr::UNSPECIFIED;
            socket.bind(&SocketAddrV4::new(bind_ip, channel.port).into())?;
        } else {
            socket.bind(&SocketAddrV4::new(group, channel.port).into())?;
        }
        Ok(GroupListener {
            socket: UdpSocket::from_std(socket.into())?,
            recv_buf: vec![0; 64 * 1024],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RoomkeeperError> {
        Ok(self.socket.local_addr()?)
    }

    /// Waits for the next datagram carrying our tag. Foreign and undecodable
    /// datagrams are skipped. Cancellation safe.
    pub async fn recv(&mut self) -> Result<GroupMsg, RoomkeeperError> {
        loop {
            let (len, _) = self.socket.recv_from(&mut self.recv_buf).await?;
            match decode_datagram(&self.recv_buf[..len]) {
                Ok(Some(msg)) => return Ok(msg),
                Ok(None) => continue,
                Err(e) => {
                    pf_debug!("mcast"; "dropping malformed group datagram: {}", e);
                }
            }
        }
    }
}

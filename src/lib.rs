//! Roomkeeper: a Paxos-replicated directory service for multi-room chat,
//! with heartbeat-driven chatroom host failover.

#[macro_use]
mod utils;

mod codec;
mod directory;
mod multicast;
mod registry;
mod replica;
mod client;

pub use utils::{logger_init, RoomkeeperError};

pub use directory::{
    ChatEntry, ChatroomId, ChatroomRecord, Directory, DirectoryState,
    GroupPool, LoginCheck, Succession, Transaction,
};
pub use multicast::{GroupChannel, GroupListener, GroupMsg, GroupSender};
pub use registry::{RegistryMsg, RegistryServer};
pub use replica::{
    is_quorum, ClientReply, ClientRequest, MeshView, PeerMsg, ProposalNumber,
    Replica, ReplicaConfig, ReplicaParams, ReplicaRole, StatusMsg,
};
pub use client::{
    ChatGrant, ChatroomHost, ChatroomMember, DirectoryClient, DisplayEvent,
    MemberMsg,
};

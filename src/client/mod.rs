//! Programmatic client endpoints: directory access, chatroom hosting and
//! chatroom membership.

mod endpoint;
mod host;
mod member;

use std::net::SocketAddr;

pub use endpoint::{ChatGrant, DirectoryClient};
pub use host::{ChatroomHost, MemberMsg};
pub use member::ChatroomMember;

pub(crate) use endpoint::expect_grant;

/// Something a chatroom display would show.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum DisplayEvent {
    Message { sender: String, body: String },

    /// Someone else was announced the chatroom's next host.
    NewHost { username: String },

    /// I now host the chatroom; `history` is what to replay, oldest first.
    PromotedToHost { history: Vec<(String, String)> },

    /// Moved my connection over to the chatroom's new host.
    Reconnected {
        new_host: String,
        host_addr: SocketAddr,
    },

    /// The chatroom display should be torn down.
    Removed,
}

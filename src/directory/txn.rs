//! Replicated transactions: the values agreed on by Paxos rounds.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Chatroom numeric ID, assigned by the replica that served the creation.
pub type ChatroomId = u32;

/// One atomic directory mutation. Every variant is applied idempotently by
/// value, so the replica that applied it tentatively can apply it again when
/// the round that carries it is decided.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Transaction {
    /// User logged in with a matching password.
    Login { user: String, pass: String },

    /// New account registered; also logs the user in.
    Register { user: String, pass: String },

    /// User logged out from the chat selection screen.
    Logout { user: String },

    /// Chatroom created, with its ID and multicast group already picked.
    CreateChat {
        name: String,
        host: String,
        host_addr: IpAddr,
        id: ChatroomId,
        group: Ipv4Addr,
    },

    /// Surviving member took over hosting an existing chatroom.
    RecreateChat {
        name: String,
        new_host: String,
        new_host_addr: IpAddr,
    },

    /// Host bound the port where members connect to it.
    UpdatePort { name: String, port: u16 },

    /// User joined a chatroom.
    JoinChat { name: String, user: String },

    /// Message relayed by a chatroom host. `msg_id` makes history appends
    /// idempotent.
    MessageSent {
        chat: String,
        sender: String,
        body: String,
        msg_id: u64,
    },

    /// Non-host member left the chatroom, logging out as well if `logout`.
    MemberLeft {
        chat: String,
        user: String,
        logout: bool,
    },

    /// Host of a chatroom departed or was lost, logging out as well if
    /// `logout`.
    HostLeft {
        chat: String,
        user: String,
        logout: bool,
    },

    /// Client connection dropped without a goodbye: user is logged out and
    /// removed from every chatroom.
    Disconnect { user: String },
}

impl Transaction {
    /// Short name of the transaction kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Transaction::Login { .. } => "Login",
            Transaction::Register { .. } => "Register",
            Transaction::Logout { .. } => "Logout",
            Transaction::CreateChat { .. } => "CreateChat",
            Transaction::RecreateChat { .. } => "RecreateChat",
            Transaction::UpdatePort { .. } => "UpdatePort",
            Transaction::JoinChat { .. } => "JoinChat",
            Transaction::MessageSent { .. } => "MessageSent",
            Transaction::MemberLeft { .. } => "MemberLeft",
            Transaction::HostLeft { .. } => "HostLeft",
            Transaction::Disconnect { .. } => "Disconnect",
        }
    }
}

impl fmt::Display for Transaction {
    // passwords and message bodies stay out of the logs
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transaction::Login { user, .. }
            | Transaction::Register { user, .. }
            | Transaction::Logout { user }
            | Transaction::Disconnect { user } => {
                write!(f, "{}({})", self.kind(), user)
            }
            Transaction::CreateChat {
                name, host, id, group, ..
            } => write!(f, "CreateChat({} #{} by {} on {})", name, id, host, group),
            Transaction::RecreateChat { name, new_host, .. } => {
                write!(f, "RecreateChat({} by {})", name, new_host)
            }
            Transaction::UpdatePort { name, port } => {
                write!(f, "UpdatePort({} :{})", name, port)
            }
            Transaction::JoinChat { name, user } => {
                write!(f, "JoinChat({} +{})", name, user)
            }
            Transaction::MessageSent {
                chat, sender, msg_id, ..
            } => write!(f, "MessageSent({} from {} #{:x})", chat, sender, msg_id),
            Transaction::MemberLeft { chat, user, logout }
            | Transaction::HostLeft { chat, user, logout } => write!(
                f,
                "{}({} -{}{})",
                self.kind(),
                chat,
                user,
                if *logout { " logout" } else { "" }
            ),
        }
    }
}

#[cfg(test)]
mod txn_tests {
    use super::*;

    #[test]
    fn display_hides_secrets() {
        let txn = Transaction::Register {
            user: "carol".into(),
            pass: "pw2".into(),
        };
        assert_eq!(txn.to_string(), "Register(carol)");
        let txn = Transaction::MessageSent {
            chat: "general".into(),
            sender: "alice".into(),
            body: "secret plans".into(),
            msg_id: 255,
        };
        assert!(!txn.to_string().contains("secret"));
    }

    #[test]
    fn display_departures() {
        let txn = Transaction::HostLeft {
            chat: "general".into(),
            user: "alice".into(),
            logout: true,
        };
        assert_eq!(txn.to_string(), "HostLeft(general -alice logout)");
        let txn = Transaction::MemberLeft {
            chat: "general".into(),
            user: "bob".into(),
            logout: false,
        };
        assert_eq!(txn.to_string(), "MemberLeft(general -bob)");
    }
}

//! Directory state store: accounts, sessions and chatroom records.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::directory::{ChatroomId, ChatroomRecord, GroupPool, Transaction};

/// Outcome of checking a login attempt against the directory.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LoginCheck {
    Success,
    Incorrect,
    AlreadyLoggedIn,
}

/// Outcome of a host departing its chatroom.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Succession {
    /// Oldest remaining member should take over.
    NewHost { successor: String, group: Ipv4Addr },

    /// Nobody left; the record is gone and the group returned to the pool.
    TornDown { group: Ipv4Addr },

    /// The departing user was not the recorded host; they were only removed
    /// from the member list.
    NotHost,

    /// No such chatroom.
    Unknown,
}

/// The replicated directory state. Mutated only through `apply()` (and
/// `host_departed()`, which is the same mutation with its outcome reported).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DirectoryState {
    /// Username -> password. Accounts are never removed.
    accounts: HashMap<String, String>,

    logged_in: HashSet<String>,

    /// Chat name -> record.
    chatrooms: HashMap<String, ChatroomRecord>,

    /// Lowest chatroom ID never handed out as far as this replica knows.
    next_chat_id: ChatroomId,

    groups: GroupPool,
}

impl DirectoryState {
    /// Creates an empty directory drawing multicast groups from `groups`.
    pub fn new(groups: GroupPool) -> Self {
        DirectoryState {
            accounts: HashMap::new(),
            logged_in: HashSet::new(),
            chatrooms: HashMap::new(),
            next_chat_id: 0,
            groups,
        }
    }

    /// Applies a transaction. Applying the same transaction again leaves the
    /// state unchanged.
    pub fn apply(&mut self, txn: &Transaction) {
        match txn {
            Transaction::Login { user, .. } => {
                self.logged_in.insert(user.clone());
            }

            Transaction::Register { user, pass } => {
                self.accounts
                    .entry(user.clone())
                    .or_insert_with(|| pass.clone());
                self.logged_in.insert(user.clone());
            }

            Transaction::Logout { user } => {
                self.logged_in.remove(user);
            }

            Transaction::CreateChat {
                name,
                host,
                host_addr,
                id,
                group,
            } => {
                // first creation wins a name
                if self.chatrooms.contains_key(name) {
                    return;
                }
                if !self.groups.reserve(*group) && self.groups.is_held(*group) {
                    pf_warn!("dir"; "group {} of '{}' already held by another room",
                                    group, name);
                }
                self.next_chat_id = self.next_chat_id.max(id + 1);
                self.chatrooms.insert(
                    name.clone(),
                    ChatroomRecord::new(
                        *id,
                        name.clone(),
                        host.clone(),
                        *host_addr,
                        *group,
                    ),
                );
            }

            Transaction::RecreateChat {
                name,
                new_host,
                new_host_addr,
            } => {
                if let Some(room) = self.chatrooms.get_mut(name) {
                    room.host_user = new_host.clone();
                    room.host_addr = *new_host_addr;
                    room.promote_member(new_host);
                }
            }

            Transaction::UpdatePort { name, port } => {
                if let Some(room) = self.chatrooms.get_mut(name) {
                    room.client_port = *port;
                }
            }

            Transaction::JoinChat { name, user } => {
                if let Some(room) = self.chatrooms.get_mut(name) {
                    room.add_member(user);
                }
            }

            Transaction::MessageSent {
                chat,
                sender,
                body,
                msg_id,
            } => {
                if let Some(room) = self.chatrooms.get_mut(chat) {
                    room.append_message(*msg_id, sender, body);
                }
            }

            Transaction::MemberLeft { chat, user, logout } => {
                if *logout {
                    self.logged_in.remove(user);
                }
                if let Some(room) = self.chatrooms.get_mut(chat) {
                    room.remove_member(user);
                }
            }

            Transaction::HostLeft { chat, user, logout } => {
                self.host_departed(chat, user, *logout);
            }

            Transaction::Disconnect { user } => {
                self.logged_in.remove(user);
                let mut emptied = vec![];
                for room in self.chatrooms.values_mut() {
                    if room.remove_member(user) && room.members().is_empty() {
                        emptied.push(room.name.clone());
                    }
                }
                for name in emptied {
                    self.tear_down(&name);
                }
            }
        }
    }

    /// Removes a departing host from its chatroom and reports who, if
    /// anyone, should host next. Same state effect as applying
    /// `Transaction::HostLeft`.
    pub fn host_departed(
        &mut self,
        chat: &str,
        user: &str,
        logout: bool,
    ) -> Succession {
        if logout {
            self.logged_in.remove(user);
        }
        let Some(room) = self.chatrooms.get_mut(chat) else {
            return Succession::Unknown;
        };
        if room.host_user != user {
            room.remove_member(user);
            return Succession::NotHost;
        }

        room.remove_member(user);
        let group = room.group;
        match room.successor() {
            Some(successor) => Succession::NewHost {
                successor: successor.into(),
                group,
            },
            None => {
                self.tear_down(chat);
                Succession::TornDown { group }
            }
        }
    }

    fn tear_down(&mut self, chat: &str) {
        if let Some(room) = self.chatrooms.remove(chat) {
            self.groups.release(room.group);
        }
    }

    /// Checks a username/password pair against the accounts and sessions.
    pub fn check_login(&self, user: &str, pass: &str) -> LoginCheck {
        match self.accounts.get(user) {
            Some(stored) if stored == pass => {
                if self.logged_in.contains(user) {
                    LoginCheck::AlreadyLoggedIn
                } else {
                    LoginCheck::Success
                }
            }
            _ => LoginCheck::Incorrect,
        }
    }

    pub fn has_account(&self, user: &str) -> bool {
        self.accounts.contains_key(user)
    }

    pub fn password_of(&self, user: &str) -> Option<&str> {
        self.accounts.get(user).map(|p| p.as_str())
    }

    pub fn is_logged_in(&self, user: &str) -> bool {
        self.logged_in.contains(user)
    }

    pub fn chatroom(&self, name: &str) -> Option<&ChatroomRecord> {
        self.chatrooms.get(name)
    }

    /// Number of members of each chatroom, sorted by chat name.
    pub fn room_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<_> = self
            .chatrooms
            .values()
            .map(|room| (room.name.clone(), room.members().len()))
            .collect();
        counts.sort();
        counts
    }

    /// ID and group address the next created chatroom would get, or `None`
    /// if the group pool is exhausted.
    pub fn next_allocation(&self) -> Option<(ChatroomId, Ipv4Addr)> {
        Some((self.next_chat_id, self.groups.next_free()?))
    }

    pub fn group_in_use(&self, group: Ipv4Addr) -> bool {
        self.groups.is_held(group)
    }
}

/// Thread-safe handle to a replica's directory state, shared by the Paxos
/// engine, client servants and failover controllers. Closures passed in
/// must not block.
#[derive(Debug, Clone)]
pub struct Directory(Arc<Mutex<DirectoryState>>);

impl Directory {
    pub fn new(state: DirectoryState) -> Self {
        Directory(Arc::new(Mutex::new(state)))
    }

    /// Runs a closure with shared access to the state.
    pub fn read<R>(&self, f: impl FnOnce(&DirectoryState) -> R) -> R {
        let guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Runs a closure with exclusive access to the state.
    pub fn write<R>(&self, f: impl FnOnce(&mut DirectoryState) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Applies a transaction.
    pub fn apply(&self, txn: &Transaction) {
        self.write(|state| state.apply(txn));
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use std::net::IpAddr;

    fn host_ip() -> IpAddr {
        "10.0.0.7".parse().unwrap()
    }

    fn empty_state() -> DirectoryState {
        DirectoryState::new(GroupPool::new("239.0.0.1".parse().unwrap(), 8))
    }

    fn create(name: &str, host: &str, state: &DirectoryState) -> Transaction {
        let (id, group) = state.next_allocation().unwrap();
        Transaction::CreateChat {
            name: name.into(),
            host: host.into(),
            host_addr: host_ip(),
            id,
            group,
        }
    }

    fn join(name: &str, user: &str) -> Transaction {
        Transaction::JoinChat {
            name: name.into(),
            user: user.into(),
        }
    }

    /// State with alice hosting "general" with members [alice, bob, carol].
    fn populated_state() -> DirectoryState {
        let mut state = empty_state();
        for user in ["alice", "bob", "carol"] {
            state.apply(&Transaction::Register {
                user: user.into(),
                pass: format!("{}-pw", user),
            });
        }
        let txn = create("general", "alice", &state);
        state.apply(&txn);
        state.apply(&join("general", "bob"));
        state.apply(&join("general", "carol"));
        state
    }

    #[test]
    fn login_checks() {
        let mut state = empty_state();
        assert_eq!(state.check_login("alice", "pw1"), LoginCheck::Incorrect);
        state.apply(&Transaction::Register {
            user: "alice".into(),
            pass: "pw1".into(),
        });
        assert!(state.is_logged_in("alice"));
        assert_eq!(
            state.check_login("alice", "pw1"),
            LoginCheck::AlreadyLoggedIn
        );
        state.apply(&Transaction::Logout {
            user: "alice".into(),
        });
        assert_eq!(state.check_login("alice", "PW1"), LoginCheck::Incorrect);
        assert_eq!(state.check_login("alice", "pw1"), LoginCheck::Success);
    }

    #[test]
    fn register_keeps_first_password() {
        let mut state = empty_state();
        state.apply(&Transaction::Register {
            user: "alice".into(),
            pass: "pw1".into(),
        });
        state.apply(&Transaction::Register {
            user: "alice".into(),
            pass: "other".into(),
        });
        assert_eq!(state.password_of("alice"), Some("pw1"));
    }

    #[test]
    fn shared_group_held_until_last_room() {
        let mut state = empty_state();
        // two replicas allocated the same id and group concurrently
        let a = create("a", "alice", &state);
        let b = create("b", "bob", &state);
        state.apply(&a);
        state.apply(&b);
        let group = state.chatroom("a").unwrap().group;
        assert_eq!(state.chatroom("b").unwrap().group, group);

        state.apply(&Transaction::HostLeft {
            chat: "a".into(),
            user: "alice".into(),
            logout: false,
        });
        assert!(state.chatroom("a").is_none());
        assert!(state.chatroom("b").is_some());
        assert!(state.group_in_use(group));
        assert_ne!(state.next_allocation().map(|(_, g)| g), Some(group));

        state.apply(&Transaction::HostLeft {
            chat: "b".into(),
            user: "bob".into(),
            logout: false,
        });
        assert!(!state.group_in_use(group));
        assert_eq!(state.next_allocation().map(|(_, g)| g), Some(group));
    }

    #[test]
    fn create_chat_first_wins() {
        let mut state = empty_state();
        let txn = create("general", "alice", &state);
        state.apply(&txn);
        let again = Transaction::CreateChat {
            name: "general".into(),
            host: "mallory".into(),
            host_addr: host_ip(),
            id: 9,
            group: "239.0.0.5".parse().unwrap(),
        };
        state.apply(&again);
        let room = state.chatroom("general").unwrap();
        assert_eq!(room.host_user, "alice");
        assert_eq!(room.members(), ["alice"]);
        assert!(!state.group_in_use("239.0.0.5".parse().unwrap()));
    }

    #[test]
    fn allocation_advances() {
        let mut state = empty_state();
        let txn = create("general", "alice", &state);
        state.apply(&txn);
        let (id, group) = state.next_allocation().unwrap();
        assert_eq!(id, 1);
        assert_eq!(group, "239.0.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn room_counts_sorted() {
        let mut state = populated_state();
        let txn = create("afterhours", "bob", &state);
        state.apply(&txn);
        assert_eq!(
            state.room_counts(),
            vec![
                (String::from("afterhours"), 1),
                (String::from("general"), 3)
            ]
        );
    }

    #[test]
    fn educate_idempotent_every_kind() {
        let base = populated_state();
        let mut msg_state = base.clone();
        let msg = Transaction::MessageSent {
            chat: "general".into(),
            sender: "bob".into(),
            body: "hello".into(),
            msg_id: 7,
        };
        msg_state.apply(&msg);

        let txns = vec![
            Transaction::Login {
                user: "bob".into(),
                pass: "bob-pw".into(),
            },
            Transaction::Register {
                user: "dave".into(),
                pass: "pw".into(),
            },
            Transaction::Logout {
                user: "carol".into(),
            },
            create("random", "dave", &base),
            Transaction::RecreateChat {
                name: "general".into(),
                new_host: "bob".into(),
                new_host_addr: "10.0.0.8".parse().unwrap(),
            },
            Transaction::UpdatePort {
                name: "general".into(),
                port: 40123,
            },
            join("general", "dave"),
            msg.clone(),
            Transaction::MemberLeft {
                chat: "general".into(),
                user: "carol".into(),
                logout: true,
            },
            Transaction::MemberLeft {
                chat: "general".into(),
                user: "nobody".into(),
                logout: false,
            },
            Transaction::HostLeft {
                chat: "general".into(),
                user: "alice".into(),
                logout: true,
            },
            Transaction::Disconnect { user: "bob".into() },
        ];
        for txn in txns {
            for start in [&base, &msg_state] {
                let mut once = start.clone();
                once.apply(&txn);
                let mut twice = once.clone();
                twice.apply(&txn);
                assert_eq!(once, twice, "{} not idempotent", txn);
            }
        }
    }

    #[test]
    fn succession_picks_oldest_member() {
        let mut state = populated_state();
        let outcome = state.host_departed("general", "alice", false);
        assert_eq!(
            outcome,
            Succession::NewHost {
                successor: "bob".into(),
                group: "239.0.0.1".parse().unwrap(),
            }
        );
        let room = state.chatroom("general").unwrap();
        assert_eq!(room.members(), ["bob", "carol"]);
        assert!(state.is_logged_in("alice"));
    }

    #[test]
    fn succession_tears_down_empty_room() {
        let mut state = empty_state();
        let txn = create("solo", "alice", &state);
        state.apply(&txn);
        let group = state.chatroom("solo").unwrap().group;
        assert!(state.group_in_use(group));
        let outcome = state.host_departed("solo", "alice", true);
        assert_eq!(outcome, Succession::TornDown { group });
        assert!(state.chatroom("solo").is_none());
        assert!(!state.group_in_use(group));
        assert_eq!(state.next_allocation().map(|(_, g)| g), Some(group));
        // departing again is harmless
        assert_eq!(
            state.host_departed("solo", "alice", true),
            Succession::Unknown
        );
    }

    #[test]
    fn departure_of_non_host() {
        let mut state = populated_state();
        assert_eq!(
            state.host_departed("general", "carol", false),
            Succession::NotHost
        );
        let room = state.chatroom("general").unwrap();
        assert_eq!(room.host_user, "alice");
        assert_eq!(room.members(), ["alice", "bob"]);
    }

    #[test]
    fn recreate_after_departure() {
        let mut state = populated_state();
        state.apply(&Transaction::HostLeft {
            chat: "general".into(),
            user: "alice".into(),
            logout: true,
        });
        state.apply(&Transaction::RecreateChat {
            name: "general".into(),
            new_host: "bob".into(),
            new_host_addr: "10.0.0.8".parse().unwrap(),
        });
        let room = state.chatroom("general").unwrap();
        assert_eq!(room.host_user, "bob");
        assert_eq!(room.members(), ["bob", "carol"]);
        assert!(!state.is_logged_in("alice"));
    }

    #[test]
    fn disconnect_leaves_everywhere() {
        let mut state = populated_state();
        let txn = create("solo", "carol", &state);
        state.apply(&txn);
        state.apply(&Transaction::Disconnect {
            user: "carol".into(),
        });
        assert!(!state.is_logged_in("carol"));
        assert!(state.chatroom("solo").is_none());
        assert_eq!(
            state.chatroom("general").unwrap().members(),
            ["alice", "bob"]
        );
    }

    #[test]
    fn shared_handle() {
        let directory = Directory::new(empty_state());
        let other = directory.clone();
        other.apply(&Transaction::Register {
            user: "carol".into(),
            pass: "pw2".into(),
        });
        assert_eq!(
            directory.read(|s| s.password_of("carol").map(String::from)),
            Some("pw2".into())
        );
    }
}

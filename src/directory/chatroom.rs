//! Chatroom records and the multicast group address pool.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::directory::ChatroomId;

/// One message in a chatroom's history.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub msg_id: u64,
    pub sender: String,
    pub body: String,
}

/// Replicated metadata of one live chatroom.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ChatroomRecord {
    pub id: ChatroomId,
    pub name: String,
    pub host_user: String,
    pub host_addr: IpAddr,

    /// Port on the host where members connect; 0 until the host reports it.
    pub client_port: u16,

    pub group: Ipv4Addr,

    /// In join order; `members[0]` is next in line to host.
    members: Vec<String>,

    /// In send order.
    history: Vec<ChatEntry>,
}

impl ChatroomRecord {
    /// Creates a record whose only member is its host.
    pub fn new(
        id: ChatroomId,
        name: String,
        host_user: String,
        host_addr: IpAddr,
        group: Ipv4Addr,
    ) -> Self {
        ChatroomRecord {
            id,
            name,
            members: vec![host_user.clone()],
            host_user,
            host_addr,
            client_port: 0,
            group,
            history: vec![],
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn history(&self) -> &[ChatEntry] {
        &self.history
    }

    pub fn has_member(&self, user: &str) -> bool {
        self.members.iter().any(|m| m == user)
    }

    /// Appends a member unless already present. Returns true if added.
    pub fn add_member(&mut self, user: &str) -> bool {
        if self.has_member(user) {
            return false;
        }
        self.members.push(user.into());
        true
    }

    /// Makes sure `user` is a member, placing them first in line if they
    /// were not.
    pub fn promote_member(&mut self, user: &str) {
        if !self.has_member(user) {
            self.members.insert(0, user.into());
        }
    }

    /// Removes a member if present. Returns true if removed.
    pub fn remove_member(&mut self, user: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != user);
        self.members.len() != before
    }

    /// Appends a message unless one with the same ID is already recorded.
    /// Returns true if appended.
    pub fn append_message(
        &mut self,
        msg_id: u64,
        sender: &str,
        body: &str,
    ) -> bool {
        if self.history.iter().any(|e| e.msg_id == msg_id) {
            return false;
        }
        self.history.push(ChatEntry {
            msg_id,
            sender: sender.into(),
            body: body.into(),
        });
        true
    }

    /// Next host in line: the oldest remaining member.
    pub fn successor(&self) -> Option<&str> {
        self.members.first().map(|m| m.as_str())
    }
}

/// Pool of multicast group addresses, one per live chatroom.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GroupPool {
    base: u32,
    size: u32,

    /// Offsets from `base` currently held, with the number of live
    /// chatrooms holding each.
    in_use: BTreeMap<u32, usize>,
}

impl GroupPool {
    /// Creates a pool of `size` consecutive addresses starting at `base`.
    pub fn new(base: Ipv4Addr, size: u32) -> Self {
        let base = u32::from(base);
        GroupPool {
            base,
            size: size.min(u32::MAX - base),
            in_use: BTreeMap::new(),
        }
    }

    /// Lowest address not held by any chatroom, without taking it.
    pub fn next_free(&self) -> Option<Ipv4Addr> {
        (0..self.size)
            .find(|off| !self.in_use.contains_key(off))
            .map(|off| Ipv4Addr::from(self.base + off))
    }

    fn offset_of(&self, addr: Ipv4Addr) -> Option<u32> {
        let off = u32::from(addr).checked_sub(self.base)?;
        (off < self.size).then_some(off)
    }

    /// Adds a holder to an address. Returns false if it lies outside the
    /// pool or already had a holder; the new holder is counted either way
    /// for in-pool addresses.
    pub fn reserve(&mut self, addr: Ipv4Addr) -> bool {
        match self.offset_of(addr) {
            Some(off) => {
                let holders = self.in_use.entry(off).or_insert(0);
                *holders += 1;
                *holders == 1
            }
            None => false,
        }
    }

    /// Drops one holder of an address. The address returns to the pool when
    /// its last holder is gone.
    pub fn release(&mut self, addr: Ipv4Addr) {
        let Some(off) = self.offset_of(addr) else { return };
        if let Some(holders) = self.in_use.get_mut(&off) {
            *holders -= 1;
            if *holders == 0 {
                self.in_use.remove(&off);
            }
        }
    }

    pub fn is_held(&self, addr: Ipv4Addr) -> bool {
        self.offset_of(addr)
            .is_some_and(|off| self.in_use.contains_key(&off))
    }
}

#[cfg(test)]
mod chatroom_tests {
    use super::*;

    fn room() -> ChatroomRecord {
        ChatroomRecord::new(
            0,
            "general".into(),
            "alice".into(),
            "127.0.0.1".parse().unwrap(),
            "239.0.0.1".parse().unwrap(),
        )
    }

    #[test]
    fn members_in_join_order() {
        let mut room = room();
        assert!(room.add_member("bob"));
        assert!(room.add_member("carol"));
        assert!(!room.add_member("bob"));
        assert_eq!(room.members(), ["alice", "bob", "carol"]);
        assert!(room.remove_member("alice"));
        assert!(!room.remove_member("alice"));
        assert_eq!(room.successor(), Some("bob"));
    }

    #[test]
    fn promote_absent_member() {
        let mut room = room();
        room.add_member("bob");
        room.promote_member("bob");
        assert_eq!(room.members(), ["alice", "bob"]);
        room.promote_member("dave");
        assert_eq!(room.members(), ["dave", "alice", "bob"]);
    }

    #[test]
    fn history_dedup() {
        let mut room = room();
        assert!(room.append_message(1, "alice", "hi"));
        assert!(room.append_message(2, "alice", "hi"));
        assert!(!room.append_message(1, "alice", "hi"));
        assert_eq!(room.history().len(), 2);
    }

    #[test]
    fn pool_lowest_free() {
        let mut pool = GroupPool::new("239.0.0.1".parse().unwrap(), 3);
        let a = pool.next_free().unwrap();
        assert_eq!(a, "239.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert!(pool.reserve(a));
        let b = pool.next_free().unwrap();
        assert!(pool.reserve(b));
        let c = pool.next_free().unwrap();
        assert_eq!(c, "239.0.0.3".parse::<Ipv4Addr>().unwrap());
        assert!(pool.reserve(c));
        assert_eq!(pool.next_free(), None);
        pool.release(a);
        assert_eq!(pool.next_free(), Some(a));
        assert!(!pool.is_held(a));
        assert!(pool.is_held(b));
    }

    #[test]
    fn pool_counts_holders() {
        let mut pool = GroupPool::new("239.0.0.1".parse().unwrap(), 2);
        let a = pool.next_free().unwrap();
        assert!(pool.reserve(a));
        assert!(!pool.reserve(a));
        pool.release(a);
        assert!(pool.is_held(a));
        assert_ne!(pool.next_free(), Some(a));
        pool.release(a);
        assert!(!pool.is_held(a));
        assert_eq!(pool.next_free(), Some(a));
        pool.release(a);
        assert!(!pool.is_held(a));
    }

    #[test]
    fn pool_rejects_outsiders() {
        let mut pool = GroupPool::new("239.0.0.1".parse().unwrap(), 2);
        assert!(!pool.reserve("239.0.0.0".parse().unwrap()));
        assert!(!pool.reserve("239.0.0.3".parse().unwrap()));
        assert!(pool.reserve("239.0.0.2".parse().unwrap()));
    }
}

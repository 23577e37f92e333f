//! Replicated directory: transactions and the state they mutate.

mod chatroom;
mod store;
mod txn;

pub use chatroom::{ChatEntry, ChatroomRecord, GroupPool};
pub use store::{Directory, DirectoryState, LoginCheck, Succession};
pub use txn::{ChatroomId, Transaction};

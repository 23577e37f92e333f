//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use error::RoomkeeperError;
pub use print::logger_init;

pub(crate) use safetcp::{
    safe_tcp_read, tcp_bind_with_retry, tcp_connect_with_retry, tcp_write_obj,
};

/// Polls a condition until it holds, giving up after a few seconds. Returns
/// whether the condition was observed to hold.
#[cfg(test)]
pub(crate) async fn poll_until(mut cond: impl FnMut() -> bool) -> bool {
    use tokio::time::{sleep, Duration, Instant};
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    cond()
}

//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;

/// Customized error type for Roomkeeper.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RoomkeeperError(pub String);

impl RoomkeeperError {
    pub fn msg(msg: impl ToString) -> Self {
        RoomkeeperError(msg.to_string())
    }
}

impl fmt::Display for RoomkeeperError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for RoomkeeperError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `RoomkeeperError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for RoomkeeperError {
            fn from(e: $error) -> Self {
                RoomkeeperError(e.to_string())
            }
        }
    };
}

// Same as above, for generic error types such as channel send errors that
// carry back the unsent value.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for RoomkeeperError {
            fn from(e: $error) -> RoomkeeperError {
                RoomkeeperError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::sync::watch::error::RecvError);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = RoomkeeperError("room vanished".into());
        assert_eq!(format!("{}", e), String::from("room vanished"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::BrokenPipe, "host gone");
        let e = RoomkeeperError::from(io_error);
        assert!(e.0.contains("host gone"));
    }

    #[test]
    fn from_addr_parse_error() {
        let parsed: Result<net::SocketAddr, _> = "not-an-addr".parse();
        let e = RoomkeeperError::from(parsed.unwrap_err());
        assert!(!e.0.is_empty());
    }
}

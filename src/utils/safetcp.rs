//! Safe TCP bind/connect/read/write helper functions.

use std::marker::Unpin;
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::codec::{decode_body, encode_frame, frame_body_len, FRAME_HEADER_LEN};
use crate::utils::RoomkeeperError;

/// Receives an object of type `T` from TCP readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(obj)` if successful; bytes of following frames that were already
///     read stay in the buffer for the next call
///   - `Err(err)` if the connection closed or any unexpected error occurs
///
/// CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()` here
/// because this function is intended to be used as a `tokio::select!` branch
/// and those two methods are not cancellation-safe. If cancelled midway, the
/// bytes already read are kept in `read_buf` and future invocations continue
/// appending to them.
pub(crate) async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, RoomkeeperError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    while read_buf.len() < FRAME_HEADER_LEN {
        fill_read_buf(read_buf, conn_read).await?;
    }
    let body_len = frame_body_len(&read_buf[..])?;
    let frame_end = FRAME_HEADER_LEN
        .checked_add(body_len)
        .ok_or_else(|| RoomkeeperError::msg("frame length overflow"))?;
    if read_buf.capacity() < frame_end {
        read_buf.reserve(frame_end - read_buf.len());
    }
    while read_buf.len() < frame_end {
        fill_read_buf(read_buf, conn_read).await?;
    }

    // no more await points from here on
    let obj = decode_body(&read_buf[FRAME_HEADER_LEN..frame_end]);
    read_buf.advance(frame_end);
    obj
}

/// Reads whatever is available into the buffer, treating end-of-stream as
/// an error.
async fn fill_read_buf<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<(), RoomkeeperError>
where
    Conn: AsyncReadExt + Unpin,
{
    if read_buf.capacity() == read_buf.len() {
        read_buf.reserve(1024);
    }
    if conn_read.read_buf(read_buf).await? == 0 {
        return Err(RoomkeeperError::msg("connection closed by peer"));
    }
    Ok(())
}

/// Sends an object of type `T` as one frame through TCP writable connection
/// `conn_write`.
pub(crate) async fn tcp_write_obj<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), RoomkeeperError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let frame = encode_frame(obj)?;
    conn_write.write_all(&frame).await?;
    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
/// Port 0 picks an ephemeral port; query `local_addr()` on the result.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, RoomkeeperError> {
    loop {
        let socket = match bind_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        match socket.bind(bind_addr).and_then(|_| socket.listen(1024)) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, RoomkeeperError> {
    loop {
        let socket = match conn_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    enum TestMsg {
        Ping(u32),
        Text(String),
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_in_order() -> Result<(), RoomkeeperError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let mut stream = tcp_connect_with_retry(addr, 3).await?;
            tcp_write_obj(&mut stream, &TestMsg::Ping(1)).await?;
            tcp_write_obj(&mut stream, &TestMsg::Text("x".repeat(5000)))
                .await?;
            tcp_write_obj(&mut stream, &TestMsg::Ping(3)).await?;
            Ok::<(), RoomkeeperError>(())
        });
        let (mut stream, _) = listener.accept().await?;
        let mut read_buf = BytesMut::new();
        assert_eq!(
            safe_tcp_read::<TestMsg, _>(&mut read_buf, &mut stream).await?,
            TestMsg::Ping(1)
        );
        assert_eq!(
            safe_tcp_read::<TestMsg, _>(&mut read_buf, &mut stream).await?,
            TestMsg::Text("x".repeat(5000))
        );
        assert_eq!(
            safe_tcp_read::<TestMsg, _>(&mut read_buf, &mut stream).await?,
            TestMsg::Ping(3)
        );
        // writer dropped its end
        assert!(safe_tcp_read::<TestMsg, _>(&mut read_buf, &mut stream)
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_no_listener() -> Result<(), RoomkeeperError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;
        drop(listener);
        assert!(tcp_connect_with_retry(addr, 0).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_header_is_error() -> Result<(), RoomkeeperError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let mut stream = tcp_connect_with_retry(addr, 3).await?;
            stream.write_all(&u64::MAX.to_be_bytes()).await?;
            // keep the connection open so only the header can fail the read
            time::sleep(Duration::from_secs(5)).await;
            Ok::<(), RoomkeeperError>(())
        });
        let (mut stream, _) = listener.accept().await?;
        let mut read_buf = BytesMut::new();
        assert!(safe_tcp_read::<TestMsg, _>(&mut read_buf, &mut stream)
            .await
            .is_err());
        assert!(read_buf.capacity() < 1 << 20);
        Ok(())
    }
}

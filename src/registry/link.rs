//! Replica side of the registry protocol.

use std::net::SocketAddr;

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

use crate::registry::RegistryMsg;
use crate::replica::{MeshConnector, ReplicaRole};
use crate::utils::{
    safe_tcp_read, tcp_connect_with_retry, tcp_write_obj, RoomkeeperError,
};

/// A replica's open connection to the registry. Directives received on it
/// are turned into mesh dial requests.
pub struct RegistryLink {
    /// Join handle of the registry listener thread.
    _listener_handle: JoinHandle<()>,
}

impl RegistryLink {
    /// Connects to the registry, registers my mesh address and role, and
    /// spawns the thread that follows its directives.
    pub async fn new_and_setup(
        me: String,
        registry_addr: SocketAddr,
        mesh_addr: SocketAddr,
        role: ReplicaRole,
        connector: MeshConnector,
        connect_retries: u8,
    ) -> Result<Self, RoomkeeperError> {
        let stream =
            tcp_connect_with_retry(registry_addr, connect_retries).await?;
        let (conn_read, mut conn_write) = stream.into_split();
        tcp_write_obj(
            &mut conn_write,
            &RegistryMsg::Register {
                addr: mesh_addr,
                role,
            },
        )
        .await?;
        pf_info!(me; "registered with registry '{}'", registry_addr);

        let listener_handle = tokio::spawn(Self::registry_listener_thread(
            me, conn_read, conn_write, connector,
        ));
        Ok(RegistryLink {
            _listener_handle: listener_handle,
        })
    }

    /// Registry listener thread function.
    async fn registry_listener_thread(
        me: String,
        mut conn_read: OwnedReadHalf,
        _conn_write: OwnedWriteHalf, // held so the registry keeps me listed
        connector: MeshConnector,
    ) {
        pf_debug!(me; "registry_listener thread spawned");

        let mut read_buf = BytesMut::new();
        loop {
            match safe_tcp_read(&mut read_buf, &mut conn_read).await {
                Ok(RegistryMsg::StartConnection { addr, role }) => {
                    pf_debug!(me; "directed to dial {} '{}'", role, addr);
                    if let Err(e) = connector.connect(addr, role) {
                        pf_error!(me; "error requesting mesh dial: {}", e);
                        break;
                    }
                }
                Ok(msg) => {
                    pf_warn!(me; "unexpected registry msg {:?}", msg);
                }
                Err(e) => {
                    pf_info!(me; "registry connection closed: {}", e);
                    break;
                }
            }
        }

        pf_debug!(me; "registry_listener thread exited");
    }
}

//! Multiplexing listener.
//!
//! Every group hosted on a node shares one TCP listener. A dialer opens each
//! connection by writing the fixed-width tag of the group it wants; the
//! listener reads the tag and hands the connection to that group. Connections
//! with an unknown tag are dropped.

use crate::errors::StoreError;
use crate::server::lock;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Width of the group tag written at the start of every peer connection.
pub const GROUP_TAG_LEN: usize = 32;

const TAG_READ_TIMEOUT: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// A group tag.
pub type GroupTag = [u8; GROUP_TAG_LEN];

/// Incoming connections of one group.
pub type Incoming = mpsc::UnboundedReceiver<TcpStream>;

type Routes = Arc<Mutex<HashMap<GroupTag, mpsc::UnboundedSender<TcpStream>>>>;

/// Builds the tag of `group`: its UTF-8 bytes, zero padded.
///
/// Longer identities are truncated at a character boundary, so two long
/// identities can share a tag; registration rejects the second one.
pub fn group_tag(group: &str) -> GroupTag {
    let mut end = group.len().min(GROUP_TAG_LEN);
    while !group.is_char_boundary(end) {
        end -= 1;
    }
    let mut tag = [0u8; GROUP_TAG_LEN];
    tag[..end].copy_from_slice(&group.as_bytes()[..end]);
    tag
}

fn display_tag(tag: &GroupTag) -> String {
    let end = tag.iter().position(|&b| b == 0).unwrap_or(GROUP_TAG_LEN);
    String::from_utf8_lossy(&tag[..end]).into_owned()
}

/// The shared peer listener of a node.
#[derive(Debug)]
pub struct MuxListener {
    local_addr: SocketAddr,
    routes: Routes,
    accept_task: JoinHandle<()>,
}

impl MuxListener {
    /// Binds the listener and starts accepting connections.
    pub async fn bind(addr: SocketAddr) -> Result<Self, StoreError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StoreError::TransportError(format!("cannot bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| StoreError::TransportError(e.to_string()))?;
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(listener, routes.clone()));
        info!("peer listener bound to {}", local_addr);
        Ok(Self {
            local_addr,
            routes,
            accept_task,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Routes connections tagged with `group` to the returned receiver.
    pub fn register(&self, group: &str) -> Result<Incoming, StoreError> {
        let tag = group_tag(group);
        let mut routes = lock(&self.routes);
        if routes.contains_key(&tag) {
            return Err(StoreError::TransportError(format!(
                "group tag {:?} is already registered",
                display_tag(&tag)
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(tag, tx);
        debug!("registered group {} on {}", group, self.local_addr);
        Ok(rx)
    }

    /// Stops routing connections to `group`.
    pub fn deregister(&self, group: &str) {
        lock(&self.routes).remove(&group_tag(group));
    }

    /// Stops accepting connections and drops every route.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        lock(&self.routes).clear();
    }
}

impl Drop for MuxListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, routes: Routes) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let routes = routes.clone();
                tokio::spawn(async move {
                    if let Err(e) = route_connection(stream, &routes).await {
                        debug!("dropping connection from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn route_connection(mut stream: TcpStream, routes: &Routes) -> Result<(), StoreError> {
    let mut tag = [0u8; GROUP_TAG_LEN];
    tokio::time::timeout(TAG_READ_TIMEOUT, stream.read_exact(&mut tag))
        .await
        .map_err(|_| StoreError::TransportError("timed out reading group tag".to_string()))?
        .map_err(|e| StoreError::TransportError(e.to_string()))?;
    let route = lock(routes).get(&tag).cloned();
    let route = route.ok_or_else(|| {
        StoreError::TransportError(format!("unknown group tag {:?}", display_tag(&tag)))
    })?;
    route
        .send(stream)
        .map_err(|_| StoreError::TransportError(format!("group {} is closed", display_tag(&tag))))
}

/// Opens a connection to the group `group` behind the listener at `addr`.
pub async fn dial(addr: SocketAddr, group: &str) -> Result<TcpStream, StoreError> {
    let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| StoreError::TransportError(format!("timed out connecting to {}", addr)))?
        .map_err(|e| StoreError::TransportError(format!("cannot connect to {}: {}", addr, e)))?;
    stream
        .set_nodelay(true)
        .map_err(|e| StoreError::TransportError(e.to_string()))?;
    stream
        .write_all(&group_tag(group))
        .await
        .map_err(|e| StoreError::TransportError(format!("cannot write tag to {}: {}", addr, e)))?;
    Ok(stream)
}

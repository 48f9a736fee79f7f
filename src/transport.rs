//! Group transport.
//!
//! Carries one group's consensus messages between nodes over connections
//! opened through the peers' [`MuxListener`](crate::mux::MuxListener)s.
//! Every peer gets two outbound links per group: a control link for votes,
//! responses and snapshot installs, and an [`AppendPipeline`] that streams
//! append requests back to back. Links reconnect lazily and drop a message
//! when it cannot be written; the engine retransmits on its next heartbeat.
//!
//! Snapshot installs larger than [`SNAPSHOT_CHUNK_LEN`] are split into
//! [`proto::SnapshotChunk`] frames and reassembled by the receiving reader
//! before the engine sees them.

use crate::command::{CommandEncoding, RawCommand};
use crate::config::Peer;
use crate::errors::StoreError;
use crate::mux::{self, Incoming};
use crate::rpc::proto::{self, peer_message::Kind, PeerMessage};
use crate::server::{lock, StoreCommand, StoreServer, StoreTransport};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use derivative::Derivative;
use little_raft::message::{LogEntry, Message};
use log::{debug, error, trace, warn};
use prost::Message as _;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
/// Largest piece of snapshot data carried by one frame.
pub const SNAPSHOT_CHUNK_LEN: usize = 4 * 1024 * 1024;

const CONTROL_QUEUE_DEPTH: usize = 1024;
const PIPELINE_DEPTH: usize = 64;
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

type EngineMessage = Message<StoreCommand, Bytes>;

/// An outbound link to one peer.
#[derive(Debug)]
struct PeerLink {
    tx: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

impl PeerLink {
    fn open(handle: &Handle, group: &str, addr: SocketAddr, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth);
        let task = handle.spawn(link_writer(group.to_string(), addr, rx));
        Self { tx, task }
    }

    fn try_send(&self, frame: Bytes) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Streams append requests to one peer without waiting for responses.
///
/// At most a bounded number of requests are in flight; further requests are
/// dropped until the link catches up.
#[derive(Debug)]
pub struct AppendPipeline {
    link: PeerLink,
    dropped: AtomicUsize,
}

impl AppendPipeline {
    fn open(handle: &Handle, group: &str, addr: SocketAddr) -> Self {
        Self {
            link: PeerLink::open(handle, group, addr, PIPELINE_DEPTH),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Queues an encoded append request.
    fn append(&self, frame: Bytes) {
        if !self.link.try_send(frame) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            trace!("append pipeline full, {} requests dropped so far", dropped);
        }
    }

    /// Number of requests dropped because the pipeline was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Inbound frame readers, aborted when the set is dropped.
#[derive(Default)]
struct Readers(Vec<JoinHandle<()>>);

impl Drop for Readers {
    fn drop(&mut self) {
        for reader in &self.0 {
            reader.abort();
        }
    }
}

/// Reassembles the chunks of one snapshot install.
#[derive(Debug, Default)]
struct SnapshotAssembler {
    request: Option<proto::InstallSnapshotRequest>,
    data: Vec<u8>,
    total_len: usize,
}

impl SnapshotAssembler {
    /// Adds `chunk`, returning the complete install once its last chunk
    /// has arrived. A chunk out of sequence abandons the transfer.
    fn push(&mut self, chunk: proto::SnapshotChunk) -> Result<Option<PeerMessage>, StoreError> {
        let offset = chunk.chunk_offset as usize;
        let total_len = chunk.total_len as usize;
        if offset == 0 {
            self.request = chunk.request;
            self.data = Vec::with_capacity(total_len.min(MAX_FRAME_LEN));
            self.total_len = total_len;
        } else if offset != self.data.len() || total_len != self.total_len {
            self.reset();
            return Err(StoreError::TransportError(format!(
                "snapshot chunk at offset {} is out of sequence",
                offset
            )));
        }
        if self.request.is_none() || self.data.len() + chunk.data.len() > self.total_len {
            self.reset();
            return Err(StoreError::TransportError(
                "malformed snapshot chunk".to_string(),
            ));
        }
        self.data.extend_from_slice(&chunk.data);
        if self.data.len() < self.total_len {
            return Ok(None);
        }
        let mut request = self.request.take().unwrap_or_default();
        request.data = std::mem::take(&mut self.data);
        self.reset();
        Ok(Some(PeerMessage {
            kind: Some(Kind::InstallSnapshotRequest(request)),
        }))
    }

    fn reset(&mut self) {
        self.request = None;
        self.data = Vec::new();
        self.total_len = 0;
    }
}

#[derive(Debug, Default)]
struct Links {
    control: HashMap<usize, PeerLink>,
    pipelines: HashMap<usize, AppendPipeline>,
}

/// Transport of one group.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct GroupTransport {
    group: String,
    this_id: usize,
    peers: HashMap<usize, SocketAddr>,
    #[derivative(Debug = "ignore")]
    handle: Handle,
    links: Mutex<Links>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl GroupTransport {
    /// Creates the transport of `group` on node `this_id`.
    ///
    /// Must be called from within a tokio runtime, which runs the links.
    pub fn new(group: &str, this_id: usize, peers: &[Peer]) -> Result<Self, StoreError> {
        let handle = Handle::try_current().map_err(|e| StoreError::TransportError(e.to_string()))?;
        let peers = peers
            .iter()
            .filter(|peer| peer.id != this_id)
            .map(|peer| (peer.id, peer.addr))
            .collect();
        Ok(Self {
            group: group.to_string(),
            this_id,
            peers,
            handle,
            links: Mutex::new(Links::default()),
            readers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Address of peer `id`.
    pub fn peer_addr(&self, id: usize) -> Option<SocketAddr> {
        self.peers.get(&id).copied()
    }

    /// Sends a vote request or response to `to_id`.
    pub fn request_vote(&self, to_id: usize, msg: EngineMessage) {
        self.send_control(to_id, msg)
    }

    /// Sends a snapshot install request or response to `to_id`.
    pub fn install_snapshot(&self, to_id: usize, msg: EngineMessage) {
        self.send_control(to_id, msg)
    }

    /// Sends an append response to `to_id`.
    pub fn append_entries(&self, to_id: usize, msg: EngineMessage) {
        self.send_control(to_id, msg)
    }

    /// Streams an append request to `to_id` through its pipeline.
    pub fn append_entries_pipeline(&self, to_id: usize, msg: EngineMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let addr = match self.peer_addr(to_id) {
            Some(addr) => addr,
            None => {
                warn!("[{}] no address for peer {}", self.group, to_id);
                return;
            }
        };
        let frame = encode_frame(&to_wire(msg));
        let mut links = lock(&self.links);
        links
            .pipelines
            .entry(to_id)
            .or_insert_with(|| AppendPipeline::open(&self.handle, &self.group, addr))
            .append(frame);
    }

    fn send_control(&self, to_id: usize, msg: EngineMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let addr = match self.peer_addr(to_id) {
            Some(addr) => addr,
            None => {
                warn!("[{}] no address for peer {}", self.group, to_id);
                return;
            }
        };
        let frames = to_frames(msg, SNAPSHOT_CHUNK_LEN);
        let chunked = frames.len() > 1;
        let mut links = lock(&self.links);
        let link = links
            .control
            .entry(to_id)
            .or_insert_with(|| PeerLink::open(&self.handle, &self.group, addr, CONTROL_QUEUE_DEPTH));
        for frame in frames {
            if !link.try_send(frame) {
                if chunked {
                    warn!("[{}] control link to {} is full, dropping snapshot install", self.group, to_id);
                } else {
                    debug!("[{}] control link to {} is full, dropping message", self.group, to_id);
                }
                break;
            }
        }
    }

    /// Feeds the connections arriving for this group into `server`.
    pub fn serve(&self, server: Arc<StoreServer<GroupTransport>>, mut incoming: Incoming) {
        let group = self.group.clone();
        let this_id = self.this_id;
        let task = self.handle.spawn(async move {
            let mut readers = Readers::default();
            while let Some(stream) = incoming.recv().await {
                readers.0.retain(|reader| !reader.is_finished());
                let server = server.clone();
                let group = group.clone();
                readers.0.push(tokio::spawn(async move {
                    match read_frames(stream, &server).await {
                        Err(e @ StoreError::TransportError(_)) => {
                            error!("[{}] inbound link of node {} failed: {}", group, this_id, e)
                        }
                        Err(e) => debug!("[{}] inbound link of node {} closed: {}", group, this_id, e),
                        Ok(()) => {}
                    }
                }));
            }
        });
        lock(&self.readers).push(task);
    }
}

#[async_trait]
impl StoreTransport for GroupTransport {
    fn send(&self, to_id: usize, msg: EngineMessage) {
        match msg {
            Message::AppendEntryRequest { .. } => self.append_entries_pipeline(to_id, msg),
            Message::AppendEntryResponse { .. } => self.append_entries(to_id, msg),
            Message::VoteRequest { .. } | Message::VoteResponse { .. } => {
                self.request_vote(to_id, msg)
            }
            Message::InstallSnapshotRequest { .. } | Message::InstallSnapshotResponse { .. } => {
                self.install_snapshot(to_id, msg)
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let readers = std::mem::take(&mut *lock(&self.readers));
        for reader in readers {
            reader.abort();
        }
        let links = std::mem::take(&mut *lock(&self.links));
        drop(links);
        debug!("[{}] transport of node {} closed", self.group, self.this_id);
    }
}

async fn link_writer(group: String, addr: SocketAddr, mut rx: mpsc::Receiver<Bytes>) {
    let mut stream: Option<TcpStream> = None;
    let mut retry_at = Instant::now();
    while let Some(frame) = rx.recv().await {
        if stream.is_none() {
            if Instant::now() < retry_at {
                continue;
            }
            match mux::dial(addr, &group).await {
                Ok(s) => stream = Some(s),
                Err(e) => {
                    debug!("[{}] cannot reach {}: {}", group, addr, e);
                    retry_at = Instant::now() + RECONNECT_BACKOFF;
                    continue;
                }
            }
        }
        if let Some(s) = stream.as_mut() {
            if let Err(e) = s.write_all(&frame).await {
                debug!("[{}] link to {} broken: {}", group, addr, e);
                stream = None;
            }
        }
    }
}

async fn read_frames(
    mut stream: TcpStream,
    server: &StoreServer<GroupTransport>,
) -> Result<(), StoreError> {
    let mut snapshot = SnapshotAssembler::default();
    loop {
        let msg = match read_frame(&mut stream).await? {
            PeerMessage {
                kind: Some(Kind::SnapshotChunk(chunk)),
            } => match snapshot.push(chunk) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(e) => {
                    warn!("[{}] dropping snapshot install: {}", server.group(), e);
                    continue;
                }
            },
            msg => msg,
        };
        server.recv_msg(from_wire(msg)?);
    }
}

/// Encodes `msg` into frames, splitting snapshot data into pieces of at
/// most `chunk_len` bytes.
fn to_frames(msg: EngineMessage, chunk_len: usize) -> Vec<Bytes> {
    match to_wire(msg).kind {
        Some(Kind::InstallSnapshotRequest(mut request)) if request.data.len() > chunk_len => {
            let data = std::mem::take(&mut request.data);
            data.chunks(chunk_len)
                .enumerate()
                .map(|(i, piece)| {
                    encode_frame(&PeerMessage {
                        kind: Some(Kind::SnapshotChunk(proto::SnapshotChunk {
                            request: Some(request.clone()),
                            chunk_offset: (i * chunk_len) as u64,
                            total_len: data.len() as u64,
                            data: piece.to_vec(),
                        })),
                    })
                })
                .collect()
        }
        kind => vec![encode_frame(&PeerMessage { kind })],
    }
}

/// Length-prefixes an encoded peer message.
pub fn encode_frame(msg: &PeerMessage) -> Bytes {
    let len = msg.encoded_len();
    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(len as u32);
    // Encoding into a buffer with enough capacity cannot fail.
    let _ = msg.encode(&mut buf);
    buf.freeze()
}

/// Reads one length-prefixed peer message.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PeerMessage, StoreError> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(StoreError::TransportError(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf).await?;
    PeerMessage::decode(&buf[..]).map_err(|e| StoreError::TransportError(e.to_string()))
}

fn encoding_to_wire(encoding: CommandEncoding) -> i32 {
    match encoding {
        CommandEncoding::Structured => proto::Encoding::Structured as i32,
        CommandEncoding::Directive => proto::Encoding::Directive as i32,
    }
}

fn encoding_from_wire(encoding: i32) -> Result<CommandEncoding, StoreError> {
    match proto::Encoding::from_i32(encoding) {
        Some(proto::Encoding::Structured) => Ok(CommandEncoding::Structured),
        Some(proto::Encoding::Directive) => Ok(CommandEncoding::Directive),
        None => Err(StoreError::TransportError(format!(
            "unknown command encoding {}",
            encoding
        ))),
    }
}

/// Converts an engine message to its wire form.
pub fn to_wire(msg: EngineMessage) -> PeerMessage {
    let kind = match msg {
        Message::AppendEntryRequest {
            from_id,
            term,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index,
        } => {
            let entries = entries
                .into_iter()
                .map(|entry| proto::LogEntry {
                    id: entry.transition.id as u64,
                    index: entry.index as u64,
                    term: entry.term as u64,
                    encoding: encoding_to_wire(entry.transition.command.encoding),
                    payload: entry.transition.command.payload,
                })
                .collect();
            Kind::AppendEntriesRequest(proto::AppendEntriesRequest {
                from_id: from_id as u64,
                term: term as u64,
                prev_log_index: prev_log_index as u64,
                prev_log_term: prev_log_term as u64,
                entries,
                commit_index: commit_index as u64,
            })
        }
        Message::AppendEntryResponse {
            from_id,
            term,
            success,
            last_index,
            mismatch_index,
        } => Kind::AppendEntriesResponse(proto::AppendEntriesResponse {
            from_id: from_id as u64,
            term: term as u64,
            success,
            last_index: last_index as u64,
            has_mismatch_index: mismatch_index.is_some(),
            mismatch_index: mismatch_index.unwrap_or_default() as u64,
        }),
        Message::VoteRequest {
            from_id,
            term,
            last_log_index,
            last_log_term,
        } => Kind::VoteRequest(proto::VoteRequest {
            from_id: from_id as u64,
            term: term as u64,
            last_log_index: last_log_index as u64,
            last_log_term: last_log_term as u64,
        }),
        Message::VoteResponse {
            from_id,
            term,
            vote_granted,
        } => Kind::VoteResponse(proto::VoteResponse {
            from_id: from_id as u64,
            term: term as u64,
            vote_granted,
        }),
        Message::InstallSnapshotRequest {
            from_id,
            term,
            last_included_index,
            last_included_term,
            offset,
            data,
            done,
        } => Kind::InstallSnapshotRequest(proto::InstallSnapshotRequest {
            from_id: from_id as u64,
            term: term as u64,
            last_included_index: last_included_index as u64,
            last_included_term: last_included_term as u64,
            offset: offset as u64,
            data: data.to_vec(),
            done,
        }),
        Message::InstallSnapshotResponse {
            from_id,
            term,
            last_included_index,
        } => Kind::InstallSnapshotResponse(proto::InstallSnapshotResponse {
            from_id: from_id as u64,
            term: term as u64,
            last_included_index: last_included_index as u64,
        }),
    };
    PeerMessage { kind: Some(kind) }
}

/// Converts a wire message back into an engine message.
pub fn from_wire(msg: PeerMessage) -> Result<EngineMessage, StoreError> {
    let kind = msg
        .kind
        .ok_or_else(|| StoreError::TransportError("empty peer message".to_string()))?;
    let msg = match kind {
        Kind::AppendEntriesRequest(req) => {
            let entries = req
                .entries
                .into_iter()
                .map(|entry| {
                    let command = RawCommand {
                        encoding: encoding_from_wire(entry.encoding)?,
                        payload: entry.payload,
                    };
                    Ok::<_, StoreError>(LogEntry {
                        transition: StoreCommand {
                            id: entry.id as usize,
                            command,
                        },
                        index: entry.index as usize,
                        term: entry.term as usize,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Message::AppendEntryRequest {
                from_id: req.from_id as usize,
                term: req.term as usize,
                prev_log_index: req.prev_log_index as usize,
                prev_log_term: req.prev_log_term as usize,
                entries,
                commit_index: req.commit_index as usize,
            }
        }
        Kind::AppendEntriesResponse(resp) => Message::AppendEntryResponse {
            from_id: resp.from_id as usize,
            term: resp.term as usize,
            success: resp.success,
            last_index: resp.last_index as usize,
            mismatch_index: if resp.has_mismatch_index {
                Some(resp.mismatch_index as usize)
            } else {
                None
            },
        },
        Kind::VoteRequest(req) => Message::VoteRequest {
            from_id: req.from_id as usize,
            term: req.term as usize,
            last_log_index: req.last_log_index as usize,
            last_log_term: req.last_log_term as usize,
        },
        Kind::VoteResponse(resp) => Message::VoteResponse {
            from_id: resp.from_id as usize,
            term: resp.term as usize,
            vote_granted: resp.vote_granted,
        },
        Kind::InstallSnapshotRequest(req) => Message::InstallSnapshotRequest {
            from_id: req.from_id as usize,
            term: req.term as usize,
            last_included_index: req.last_included_index as usize,
            last_included_term: req.last_included_term as usize,
            offset: req.offset as usize,
            data: Bytes::from(req.data),
            done: req.done,
        },
        Kind::InstallSnapshotResponse(resp) => Message::InstallSnapshotResponse {
            from_id: resp.from_id as usize,
            term: resp.term as usize,
            last_included_index: resp.last_included_index as usize,
        },
        Kind::SnapshotChunk(_) => {
            return Err(StoreError::TransportError(
                "snapshot chunk outside of a transfer".to_string(),
            ))
        }
    };
    Ok(msg)
}

/// Encodes a peer as its ID followed by its length-prefixed address.
pub fn encode_peer(peer: &Peer, buf: &mut BytesMut) {
    let addr = peer.addr.to_string();
    buf.put_u64(peer.id as u64);
    buf.put_u16(addr.len() as u16);
    buf.put_slice(addr.as_bytes());
}

/// Decodes a peer written by [`encode_peer`].
pub fn decode_peer<B: Buf>(buf: &mut B) -> Result<Peer, StoreError> {
    let truncated = || StoreError::StorageError("truncated peer record".to_string());
    if buf.remaining() < 10 {
        return Err(truncated());
    }
    let id = buf.get_u64() as usize;
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let addr = buf.copy_to_bytes(len);
    let addr = std::str::from_utf8(&addr)
        .ok()
        .and_then(|addr| addr.parse().ok())
        .ok_or_else(|| StoreError::StorageError("malformed peer address".to_string()))?;
    Ok(Peer { id, addr })
}

/// Encodes a membership list.
pub fn encode_membership(peers: &[Peer]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(peers.len() as u32);
    for peer in peers {
        encode_peer(peer, &mut buf);
    }
    buf.freeze()
}

/// Decodes a membership list written by [`encode_membership`].
pub fn decode_membership(mut data: &[u8]) -> Result<Vec<Peer>, StoreError> {
    if data.remaining() < 4 {
        return Err(StoreError::StorageError("truncated membership".to_string()));
    }
    let count = data.get_u32() as usize;
    let mut peers = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        peers.push(decode_peer(&mut data)?);
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::MuxListener;

    #[test]
    fn append_request_keeps_entries_and_encodings() {
        let msg = Message::AppendEntryRequest {
            from_id: 1,
            term: 3,
            prev_log_index: 7,
            prev_log_term: 2,
            entries: vec![
                LogEntry {
                    transition: StoreCommand {
                        id: 42,
                        command: RawCommand::structured("INSERT INTO t VALUES (1)"),
                    },
                    index: 8,
                    term: 3,
                },
                LogEntry {
                    transition: StoreCommand {
                        id: 43,
                        command: RawCommand::directive("USE shop; DELETE FROM t"),
                    },
                    index: 9,
                    term: 3,
                },
            ],
            commit_index: 7,
        };
        match from_wire(to_wire(msg)).unwrap() {
            Message::AppendEntryRequest {
                prev_log_index,
                entries,
                commit_index,
                ..
            } => {
                assert_eq!(prev_log_index, 7);
                assert_eq!(commit_index, 7);
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[1].index, 9);
                assert_eq!(entries[1].transition.id, 43);
                assert_eq!(entries[1].transition.command.encoding, CommandEncoding::Directive);
                assert_eq!(entries[0].transition.command, RawCommand::structured("INSERT INTO t VALUES (1)"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn missing_mismatch_index_stays_missing() {
        let msg = Message::AppendEntryResponse {
            from_id: 2,
            term: 1,
            success: true,
            last_index: 0,
            mismatch_index: None,
        };
        match from_wire(to_wire(msg)).unwrap() {
            Message::AppendEntryResponse { mismatch_index, .. } => assert_eq!(mismatch_index, None),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn empty_and_unknown_messages_are_rejected() {
        assert!(from_wire(PeerMessage { kind: None }).is_err());
        let msg = PeerMessage {
            kind: Some(Kind::AppendEntriesRequest(proto::AppendEntriesRequest {
                entries: vec![proto::LogEntry {
                    encoding: 9,
                    ..Default::default()
                }],
                ..Default::default()
            })),
        };
        assert!(matches!(from_wire(msg), Err(StoreError::TransportError(_))));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut data: &[u8] = &((MAX_FRAME_LEN as u32) + 1).to_be_bytes();
        assert!(matches!(
            read_frame(&mut data).await,
            Err(StoreError::TransportError(_))
        ));
    }

    fn snapshot_install(data: &[u8]) -> EngineMessage {
        Message::InstallSnapshotRequest {
            from_id: 1,
            term: 4,
            last_included_index: 9,
            last_included_term: 3,
            offset: 0,
            data: Bytes::copy_from_slice(data),
            done: true,
        }
    }

    async fn decode_frames(frames: Vec<Bytes>) -> Vec<PeerMessage> {
        let mut messages = vec![];
        for frame in frames {
            let mut frame: &[u8] = &frame;
            messages.push(read_frame(&mut frame).await.unwrap());
        }
        messages
    }

    fn chunk_of(msg: PeerMessage) -> proto::SnapshotChunk {
        match msg.kind {
            Some(Kind::SnapshotChunk(chunk)) => chunk,
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn large_snapshots_travel_in_chunks() {
        let frames = to_frames(snapshot_install(b"0123456789"), 4);
        assert_eq!(frames.len(), 3);
        let mut assembler = SnapshotAssembler::default();
        let mut messages = decode_frames(frames).await.into_iter();
        assert!(assembler.push(chunk_of(messages.next().unwrap())).unwrap().is_none());
        assert!(assembler.push(chunk_of(messages.next().unwrap())).unwrap().is_none());
        let whole = assembler.push(chunk_of(messages.next().unwrap())).unwrap().unwrap();
        match from_wire(whole).unwrap() {
            Message::InstallSnapshotRequest {
                last_included_index,
                data,
                done,
                ..
            } => {
                assert_eq!(last_included_index, 9);
                assert_eq!(&data[..], b"0123456789");
                assert!(done);
            }
            other => panic!("unexpected message {:?}", other),
        }

        let frames = to_frames(snapshot_install(b"0123"), 4);
        let messages = decode_frames(frames).await;
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0].kind, Some(Kind::InstallSnapshotRequest(_))));
    }

    #[tokio::test]
    async fn out_of_sequence_chunks_abandon_the_transfer() {
        let chunks: Vec<_> = decode_frames(to_frames(snapshot_install(b"0123456789"), 4))
            .await
            .into_iter()
            .map(chunk_of)
            .collect();
        let mut assembler = SnapshotAssembler::default();
        assert!(assembler.push(chunks[1].clone()).is_err());
        assert!(assembler.push(chunks[0].clone()).unwrap().is_none());
        assert!(assembler.push(chunks[2].clone()).is_err());

        // A fresh transfer starting at offset zero still completes.
        for chunk in &chunks[..2] {
            assert!(assembler.push(chunk.clone()).unwrap().is_none());
        }
        assert!(assembler.push(chunks[2].clone()).unwrap().is_some());
        assert!(from_wire(PeerMessage {
            kind: Some(Kind::SnapshotChunk(chunks[0].clone())),
        })
        .is_err());
    }

    #[test]
    fn membership_survives_encoding() {
        let peers = vec![
            Peer::new(1, "127.0.0.1:7001".parse().unwrap()),
            Peer::new(2, "[::1]:7002".parse().unwrap()),
        ];
        let data = encode_membership(&peers);
        assert_eq!(decode_membership(&data).unwrap(), peers);
        assert!(decode_membership(&data[..data.len() - 1]).is_err());
    }

    #[tokio::test]
    async fn messages_reach_the_peer_group() {
        let listener = MuxListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut incoming = listener.register("shop").unwrap();
        let peers = vec![Peer::new(2, listener.local_addr())];
        let transport = GroupTransport::new("shop", 1, &peers).unwrap();

        transport.send(
            2,
            Message::VoteRequest {
                from_id: 1,
                term: 5,
                last_log_index: 3,
                last_log_term: 4,
            },
        );
        let mut stream = incoming.recv().await.unwrap();
        match from_wire(read_frame(&mut stream).await.unwrap()).unwrap() {
            Message::VoteRequest { from_id, term, .. } => {
                assert_eq!(from_id, 1);
                assert_eq!(term, 5);
            }
            other => panic!("unexpected message {:?}", other),
        }
        transport.close().await;
    }
}

// Copyright (c) 2021-2023 Via Technology Ltd. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! TCP transport.
//!
//! Each connection consists of two sockets: a message channel carrying
//! length-prefixed typed frames (requests, responses, notifications) and a
//! bulk channel carrying `(payload id, size, bytes)` records. The two are
//! associated by a token assigned during the handshake. Integers on the
//! wire are in network byte order throughout.
//!
//! A connection runs one reader thread per socket. The message reader only
//! routes: responses wake the pending `execute_command` call, requests go
//! to a per-connection worker (they may block in `finish`), notifications
//! go to a dispatch thread. Nothing ever blocks a reader, so responses and
//! status messages cannot deadlock behind a long-running request.

use super::{DataTransfer, NodeConnection, PeerResolver, Process, SendConstPtr, SendPtr};
use crate::daemon::Daemon;
use crate::error::{Error, Result};
use crate::protocol::{EventMessage, Request, Response, DEFAULT_PORT};
use crate::registry::Registry;
use crate::types::{PayloadId, CL_COMPLETE, CL_IO_ERROR};
use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;

const FRAME_REQUEST: u8 = 1;
const FRAME_RESPONSE: u8 = 2;
const FRAME_MESSAGE: u8 = 3;

const CHANNEL_MESSAGE: u8 = b'M';
const CHANNEL_BULK: u8 = b'B';

/// The connecting process's role, sent in the handshake.
const ROLE_HOST: u8 = b'H';
const ROLE_NODE: u8 = b'P';

fn write_frame(stream: &mut TcpStream, class: u8, correlation: u64, payload: &[u8]) -> Result<()> {
    stream.write_u8(class)?;
    stream.write_u64::<NetworkEndian>(correlation)?;
    stream.write_u32::<NetworkEndian>(payload.len() as u32)?;
    stream.write_all(payload)?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<(u8, u64, Vec<u8>)> {
    let class = stream.read_u8()?;
    let correlation = stream.read_u64::<NetworkEndian>()?;
    let length = stream.read_u32::<NetworkEndian>()? as usize;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload)?;
    Ok((class, correlation, payload))
}

/* ***************************************************************************
 * Bulk channel endpoint
 ****************************************************************************/

struct BulkSendJob {
    payload: PayloadId,
    ptr: SendConstPtr,
    size: usize,
    transfer: Arc<DataTransfer>,
}

#[derive(Default)]
struct BulkReceiveState {
    /// Receives posted before their data arrived.
    pending: HashMap<PayloadId, Vec<(SendPtr, usize, Arc<DataTransfer>)>>,
    /// Data arrived before its receive was posted.
    buffered: HashMap<PayloadId, Vec<Vec<u8>>>,
}

struct BulkEndpoint {
    sends: mpsc::Sender<BulkSendJob>,
    receives: Mutex<BulkReceiveState>,
}

impl BulkEndpoint {
    /// Spawns the writer thread over the outgoing half of the bulk socket.
    fn new(mut stream: TcpStream) -> Arc<Self> {
        let (sends, jobs) = mpsc::channel::<BulkSendJob>();
        thread::Builder::new()
            .name("bulk writer".into())
            .spawn(move || {
                while let Ok(job) = jobs.recv() {
                    let data = unsafe { std::slice::from_raw_parts(job.ptr.0, job.size) };
                    let result = (|| -> Result<()> {
                        stream.write_u64::<NetworkEndian>(job.payload.command)?;
                        stream.write_u64::<NetworkEndian>(job.payload.memory)?;
                        stream.write_u64::<NetworkEndian>(job.size as u64)?;
                        stream.write_all(data)?;
                        Ok(())
                    })();
                    match result {
                        Ok(()) => job.transfer.finish(CL_COMPLETE),
                        Err(err) => {
                            warn!("bulk send failed: {err}");
                            job.transfer.finish(CL_IO_ERROR);
                        }
                    }
                }
            })
            .expect("failed to spawn bulk writer");
        Arc::new(Self { sends, receives: Mutex::new(BulkReceiveState::default()) })
    }

    /// Spawns the reader thread over the incoming half of the bulk socket.
    fn run_reader(self: &Arc<Self>, mut stream: TcpStream) {
        let endpoint = self.clone();
        thread::Builder::new()
            .name("bulk reader".into())
            .spawn(move || loop {
                let header = (|| -> Result<(PayloadId, usize)> {
                    let command = stream.read_u64::<NetworkEndian>()?;
                    let memory = stream.read_u64::<NetworkEndian>()?;
                    let size = stream.read_u64::<NetworkEndian>()? as usize;
                    Ok((PayloadId { command, memory }, size))
                })();
                let (payload, size) = match header {
                    Ok(header) => header,
                    Err(_) => break, // connection closed
                };
                let mut bytes = vec![0u8; size];
                if stream.read_exact(&mut bytes).is_err() {
                    break;
                }
                endpoint.deliver(payload, bytes);
            })
            .expect("failed to spawn bulk reader");
    }

    fn deliver(&self, payload: PayloadId, bytes: Vec<u8>) {
        let matched = {
            let mut state = self.receives.lock().unwrap();
            match state.pending.get_mut(&payload) {
                Some(pending) if !pending.is_empty() => Some(pending.remove(0)),
                _ => {
                    state.buffered.entry(payload).or_default().push(bytes);
                    return;
                }
            }
        };
        if let Some((ptr, size, transfer)) = matched {
            finish_receive(ptr, size, &bytes, &transfer);
        }
    }

    fn post_send(&self, payload: PayloadId, size: usize, ptr: SendConstPtr) -> Result<Arc<DataTransfer>> {
        let transfer = DataTransfer::new();
        self.sends
            .send(BulkSendJob { payload, ptr, size, transfer: transfer.clone() })
            .map_err(|_| Error::Connection("bulk channel is gone".into()))?;
        Ok(transfer)
    }

    fn post_receive(&self, payload: PayloadId, size: usize, ptr: SendPtr) -> Result<Arc<DataTransfer>> {
        let transfer = DataTransfer::new();
        let buffered = {
            let mut state = self.receives.lock().unwrap();
            match state.buffered.get_mut(&payload) {
                Some(buffered) if !buffered.is_empty() => Some(buffered.remove(0)),
                _ => {
                    state
                        .pending
                        .entry(payload)
                        .or_default()
                        .push((ptr, size, transfer.clone()));
                    None
                }
            }
        };
        if let Some(bytes) = buffered {
            finish_receive(ptr, size, &bytes, &transfer);
        }
        Ok(transfer)
    }
}

fn finish_receive(ptr: SendPtr, size: usize, bytes: &[u8], transfer: &Arc<DataTransfer>) {
    if bytes.len() != size {
        warn!("bulk transfer size mismatch ({} bytes, expected {size})", bytes.len());
        transfer.finish(CL_IO_ERROR);
        return;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.0, size);
    }
    transfer.finish(CL_COMPLETE);
}

/* ***************************************************************************
 * Connection: both ends share this shape
 ****************************************************************************/

#[derive(Default)]
struct ResponseSlots {
    slots: Mutex<HashMap<u64, Option<Vec<u8>>>>,
    arrived: Condvar,
}

impl ResponseSlots {
    fn expect(&self, request_id: u64) {
        self.slots.lock().unwrap().insert(request_id, None);
    }

    fn fulfill(&self, request_id: u64, payload: Vec<u8>) {
        let mut slots = self.slots.lock().unwrap();
        if slots.contains_key(&request_id) {
            slots.insert(request_id, Some(payload));
            self.arrived.notify_all();
        } else {
            warn!("discarding response for unknown request {request_id}");
        }
    }

    fn await_response(&self, request_id: u64) -> Result<Vec<u8>> {
        let mut slots = self.slots.lock().unwrap();
        loop {
            let arrived = match slots.get(&request_id) {
                Some(slot) => slot.is_some(),
                None => return Err(Error::Connection("connection closed".into())),
            };
            if arrived {
                let payload = slots.remove(&request_id).flatten();
                return payload.ok_or_else(|| Error::Connection("connection closed".into()));
            }
            slots = self.arrived.wait(slots).unwrap();
        }
    }

    fn close(&self) {
        self.slots.lock().unwrap().clear();
        self.arrived.notify_all();
    }
}

/// One TCP connection to a remote process.
pub struct TcpProcess {
    url: String,
    writer: Mutex<TcpStream>,
    bulk: Arc<BulkEndpoint>,
    responses: Arc<ResponseSlots>,
    next_request: AtomicU64,
}

impl TcpProcess {
    fn send_frame(&self, class: u8, correlation: u64, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        write_frame(&mut writer, class, correlation, payload)
    }
}

impl Process for TcpProcess {
    fn url(&self) -> &str {
        &self.url
    }

    fn send_message(&self, message: &EventMessage) -> Result<()> {
        self.send_frame(FRAME_MESSAGE, 0, &message.encode())
    }

    fn send_data(
        &self,
        payload: PayloadId,
        size: usize,
        ptr: SendConstPtr,
    ) -> Result<Arc<DataTransfer>> {
        self.bulk.post_send(payload, size, ptr)
    }

    fn receive_data(
        &self,
        payload: PayloadId,
        size: usize,
        ptr: SendPtr,
    ) -> Result<Arc<DataTransfer>> {
        self.bulk.post_receive(payload, size, ptr)
    }
}

impl NodeConnection for TcpProcess {
    fn execute_command(&self, request: &Request) -> Result<Response> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        self.responses.expect(request_id);
        self.send_frame(FRAME_REQUEST, request_id, &request.encode())?;
        let payload = self.responses.await_response(request_id)?;
        Response::decode(&payload)
    }

    fn as_process(self: Arc<Self>) -> Arc<dyn Process> {
        self
    }
}

/* ***************************************************************************
 * Host side
 ****************************************************************************/

fn connect_sockets(url: &str) -> Result<(TcpStream, TcpStream, u64)> {
    let address = if url.contains(':') { url.to_string() } else { format!("{url}:{DEFAULT_PORT}") };
    let addresses: Vec<_> = address
        .to_socket_addrs()
        .map_err(|err| Error::Connection(format!("{url}: {err}")))?
        .collect();
    let address = addresses
        .first()
        .ok_or_else(|| Error::Connection(format!("{url}: no address")))?;

    let mut message = TcpStream::connect(address)
        .map_err(|err| Error::Connection(format!("{url}: {err}")))?;
    message.set_nodelay(true).ok();
    message.write_u8(CHANNEL_MESSAGE)?;
    message.write_u8(ROLE_HOST)?;
    let token = message.read_u64::<NetworkEndian>()?;

    let mut bulk = TcpStream::connect(address)
        .map_err(|err| Error::Connection(format!("{url}: {err}")))?;
    bulk.set_nodelay(true).ok();
    bulk.write_u8(CHANNEL_BULK)?;
    bulk.write_u64::<NetworkEndian>(token)?;

    Ok((message, bulk, token))
}

/// Connects to the daemon at `url` (host:port, port defaulting to the
/// daemon port). Incoming notifications are dispatched into `registry`.
pub fn connect(url: &str, registry: Arc<Registry>) -> Result<Arc<TcpProcess>> {
    let (message, bulk_stream, _token) = connect_sockets(url)?;
    let bulk = BulkEndpoint::new(bulk_stream.try_clone()?);
    bulk.run_reader(bulk_stream);

    let process = Arc::new(TcpProcess {
        url: url.to_string(),
        writer: Mutex::new(message.try_clone()?),
        bulk,
        responses: Arc::new(ResponseSlots::default()),
        next_request: AtomicU64::new(1),
    });

    // notifications are decoupled from the reader so a dispatch that
    // issues a request cannot deadlock against its own response
    let (dispatch_sender, dispatch_receiver) = mpsc::channel::<Vec<u8>>();
    {
        let registry = registry.clone();
        let from: Arc<dyn Process> = process.clone();
        thread::Builder::new()
            .name("message dispatch".into())
            .spawn(move || {
                while let Ok(bytes) = dispatch_receiver.recv() {
                    match EventMessage::decode(&bytes) {
                        Ok(event_message) => registry.dispatch(&event_message, &from),
                        Err(err) => warn!("discarding undecodable message: {err}"),
                    }
                }
            })
            .expect("failed to spawn dispatch thread");
    }

    let responses = process.responses.clone();
    let mut reader = message;
    thread::Builder::new()
        .name("message reader".into())
        .spawn(move || {
            loop {
                match read_frame(&mut reader) {
                    Ok((FRAME_RESPONSE, request_id, payload)) => {
                        responses.fulfill(request_id, payload);
                    }
                    Ok((FRAME_MESSAGE, _, payload)) => {
                        if dispatch_sender.send(payload).is_err() {
                            break;
                        }
                    }
                    Ok((class, ..)) => warn!("discarding unexpected frame class {class}"),
                    Err(_) => break, // connection closed
                }
            }
            responses.close();
        })
        .expect("failed to spawn message reader");

    Ok(process)
}

/* ***************************************************************************
 * Daemon side
 ****************************************************************************/

struct NodeResolver {
    registry_owner: Arc<Daemon>,
    connections: Mutex<HashMap<String, Arc<TcpProcess>>>,
}

impl PeerResolver for NodeResolver {
    fn peer(&self, url: &str) -> Result<Arc<dyn Process>> {
        let mut connections = self.connections.lock().unwrap();
        if let Some(existing) = connections.get(url) {
            return Ok(existing.clone());
        }
        // node-to-node links carry only messages, but they use the same
        // handshake with the node role
        let process = connect_peer(url, self.registry_owner.clone())?;
        connections.insert(url.to_string(), process.clone());
        Ok(process)
    }
}

fn connect_peer(url: &str, daemon: Arc<Daemon>) -> Result<Arc<TcpProcess>> {
    let (mut message, bulk_stream, _token) = {
        let address =
            if url.contains(':') { url.to_string() } else { format!("{url}:{DEFAULT_PORT}") };
        let addresses: Vec<_> = address
            .to_socket_addrs()
            .map_err(|err| Error::Connection(format!("{url}: {err}")))?
            .collect();
        let address = addresses
            .first()
            .ok_or_else(|| Error::Connection(format!("{url}: no address")))?;
        let mut message = TcpStream::connect(address)
            .map_err(|err| Error::Connection(format!("{url}: {err}")))?;
        message.set_nodelay(true).ok();
        message.write_u8(CHANNEL_MESSAGE)?;
        message.write_u8(ROLE_NODE)?;
        let token = message.read_u64::<NetworkEndian>()?;
        let mut bulk = TcpStream::connect(address)
            .map_err(|err| Error::Connection(format!("{url}: {err}")))?;
        bulk.write_u8(CHANNEL_BULK)?;
        bulk.write_u64::<NetworkEndian>(token)?;
        (message, bulk, token)
    };
    let bulk = BulkEndpoint::new(bulk_stream.try_clone()?);
    bulk.run_reader(bulk_stream);

    let process = Arc::new(TcpProcess {
        url: url.to_string(),
        writer: Mutex::new(message.try_clone()?),
        bulk,
        responses: Arc::new(ResponseSlots::default()),
        next_request: AtomicU64::new(1),
    });

    let from: Arc<dyn Process> = process.clone();
    thread::Builder::new()
        .name("peer reader".into())
        .spawn(move || loop {
            match read_frame(&mut message) {
                Ok((FRAME_MESSAGE, _, payload)) => match EventMessage::decode(&payload) {
                    Ok(event_message) => daemon.handle_message(&event_message, &from),
                    Err(err) => warn!("discarding undecodable message: {err}"),
                },
                Ok(_) => warn!("discarding unexpected frame on node link"),
                Err(_) => break,
            }
        })
        .expect("failed to spawn peer reader");

    Ok(process)
}

/// The daemon's accept loop: serves host and peer connections on
/// `listener` until the process is told to shut down via `running`.
pub fn serve(
    daemon: Arc<Daemon>,
    listener: TcpListener,
    running: Arc<std::sync::atomic::AtomicBool>,
) -> Result<()> {
    info!("listening on {}", listener.local_addr()?);
    let connection_ids = Arc::new(AtomicU64::new(1));
    let handshakes: Arc<Mutex<HashMap<u64, (TcpStream, u8)>>> = Arc::new(Mutex::new(HashMap::new()));

    listener.set_nonblocking(true)?;
    while running.load(Ordering::SeqCst) {
        let (mut stream, _) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(std::time::Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        if stream.set_nonblocking(false).is_err() {
            continue;
        }
        stream.set_nodelay(true).ok();

        // a failed handshake only loses that connection
        let result = (|| -> Result<()> {
            let channel = stream.read_u8()?;
            match channel {
                CHANNEL_MESSAGE => {
                    let role = stream.read_u8()?;
                    let token = connection_ids.fetch_add(1, Ordering::SeqCst);
                    stream.write_u64::<NetworkEndian>(token)?;
                    handshakes.lock().unwrap().insert(token, (stream, role));
                }
                CHANNEL_BULK => {
                    let token = stream.read_u64::<NetworkEndian>()?;
                    let pending = handshakes.lock().unwrap().remove(&token);
                    match pending {
                        Some((message, role)) => {
                            serve_connection(daemon.clone(), token, role, message, stream)?;
                        }
                        None => warn!("bulk channel for unknown connection token {token}"),
                    }
                }
                _ => warn!("rejecting connection with unknown channel tag {channel}"),
            }
            Ok(())
        })();
        if let Err(err) = result {
            warn!("connection handshake failed: {err}");
        }
    }
    Ok(())
}

/// Wires up one accepted connection: the bulk endpoint, the per-connection
/// request worker, and the message reader.
fn serve_connection(
    daemon: Arc<Daemon>,
    connection_id: u64,
    role: u8,
    message: TcpStream,
    bulk_stream: TcpStream,
) -> Result<()> {
    let bulk = BulkEndpoint::new(bulk_stream.try_clone()?);
    bulk.run_reader(bulk_stream);

    let peer_url = message
        .peer_addr()
        .map(|address| address.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let process = Arc::new(TcpProcess {
        url: peer_url,
        writer: Mutex::new(message.try_clone()?),
        bulk,
        responses: Arc::new(ResponseSlots::default()),
        next_request: AtomicU64::new(1),
    });

    if role == ROLE_HOST {
        daemon.connect(connection_id);
    }

    // requests may block (finish, buffer creation); keep them off the
    // reader so notifications continue to flow
    let (request_sender, request_receiver) = mpsc::channel::<(u64, Vec<u8>)>();
    {
        let daemon = daemon.clone();
        let process = process.clone();
        let resolver = NodeResolver {
            registry_owner: daemon.clone(),
            connections: Mutex::new(HashMap::new()),
        };
        thread::Builder::new()
            .name("request worker".into())
            .spawn(move || {
                while let Ok((request_id, payload)) = request_receiver.recv() {
                    let response = match Request::decode(&payload) {
                        Ok(request) => {
                            let host: Arc<dyn Process> = process.clone();
                            daemon.handle_request(connection_id, &host, &resolver, request)
                        }
                        Err(err) => Response::Error(err.code()),
                    };
                    if process.send_frame(FRAME_RESPONSE, request_id, &response.encode()).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn request worker");
    }

    let mut reader = message;
    thread::Builder::new()
        .name("connection reader".into())
        .spawn(move || {
            let from: Arc<dyn Process> = process.clone();
            loop {
                match read_frame(&mut reader) {
                    Ok((FRAME_REQUEST, request_id, payload)) => {
                        if request_sender.send((request_id, payload)).is_err() {
                            break;
                        }
                    }
                    Ok((FRAME_MESSAGE, _, payload)) => match EventMessage::decode(&payload) {
                        Ok(event_message) => daemon.handle_message(&event_message, &from),
                        Err(err) => warn!("discarding undecodable message: {err}"),
                    },
                    Ok((class, ..)) => warn!("discarding unexpected frame class {class}"),
                    Err(_) => break,
                }
            }
            debug!("connection {connection_id} closed");
            if role == ROLE_HOST {
                daemon.disconnect(connection_id);
            }
        })
        .expect("failed to spawn connection reader");
    Ok(())
}

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

//! In-process transport: a host and any number of daemons wired together
//! inside one process.
//!
//! The wiring preserves the concurrency shape of the networked transport:
//! every process runs one inbox thread that dispatches incoming messages
//! in arrival order, and bulk transfers complete asynchronously when both
//! sides of a payload id have been posted. Requests and messages round-trip
//! through the wire codec, so the loopback exercises the same encoding as
//! TCP.

use super::{DataTransfer, NodeConnection, PeerResolver, Process, SendConstPtr, SendPtr};
use crate::daemon::Daemon;
use crate::error::{Error, Result};
use crate::host::platform::Platform;
use crate::native;
use crate::protocol::{EventMessage, Request, Response};
use crate::registry::Registry;
use crate::types::{PayloadId, CL_COMPLETE, CL_IO_ERROR};
use log::warn;
use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

/* ***************************************************************************
 * Bulk channel: payload-id matched byte copies
 ****************************************************************************/

struct PendingSend {
    ptr: SendConstPtr,
    size: usize,
    transfer: Arc<DataTransfer>,
}

struct PendingReceive {
    ptr: SendPtr,
    size: usize,
    transfer: Arc<DataTransfer>,
}

/// One direction of the bulk channel between two processes. A payload id
/// may be posted more than once (several consumers synchronising the same
/// event/memory pair); matching is first-in-first-out per id.
#[derive(Default)]
struct BulkState {
    sends: HashMap<PayloadId, Vec<PendingSend>>,
    receives: HashMap<PayloadId, Vec<PendingReceive>>,
}

#[derive(Default)]
struct BulkChannel {
    state: Mutex<BulkState>,
}

impl BulkChannel {
    fn post_send(&self, payload: PayloadId, size: usize, ptr: SendConstPtr) -> Arc<DataTransfer> {
        let transfer = DataTransfer::new();
        let send = PendingSend { ptr, size, transfer: transfer.clone() };
        let matched = {
            let mut state = self.state.lock().unwrap();
            match state.receives.get_mut(&payload) {
                Some(pending) if !pending.is_empty() => Some(pending.remove(0)),
                _ => {
                    state.sends.entry(payload).or_default().push(send);
                    None
                }
            }
        };
        if let Some(receive) = matched {
            complete_pair(PendingSend { ptr, size, transfer: transfer.clone() }, receive);
        }
        transfer
    }

    fn post_receive(&self, payload: PayloadId, size: usize, ptr: SendPtr) -> Arc<DataTransfer> {
        let transfer = DataTransfer::new();
        let receive = PendingReceive { ptr, size, transfer: transfer.clone() };
        let matched = {
            let mut state = self.state.lock().unwrap();
            match state.sends.get_mut(&payload) {
                Some(pending) if !pending.is_empty() => Some(pending.remove(0)),
                _ => {
                    state.receives.entry(payload).or_default().push(receive);
                    None
                }
            }
        };
        if let Some(send) = matched {
            complete_pair(send, PendingReceive { ptr, size, transfer: transfer.clone() });
        }
        transfer
    }
}

/// Copies the payload and completes both transfer handles. Callbacks run
/// on the posting thread, outside any channel lock.
fn complete_pair(send: PendingSend, receive: PendingReceive) {
    if send.size != receive.size {
        warn!(
            "bulk transfer size mismatch (sent {} bytes, expected {})",
            send.size, receive.size
        );
        send.transfer.finish(CL_IO_ERROR);
        receive.transfer.finish(CL_IO_ERROR);
        return;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(send.ptr.0, receive.ptr.0, send.size);
    }
    send.transfer.finish(CL_COMPLETE);
    receive.transfer.finish(CL_COMPLETE);
}

/* ***************************************************************************
 * Inboxes: one channel, one dispatch thread per process
 ****************************************************************************/

/// Everything arriving at a process travels through one ordered channel,
/// like the message socket of a network connection. Notifications are
/// dispatched inline by the inbox thread; requests are handed to a worker
/// (they may block in `finish`), preserving their position relative to
/// earlier notifications.
enum InboxEntry {
    Message(Vec<u8>, Arc<dyn Process>),
    Request {
        bytes: Vec<u8>,
        connection_id: u64,
        from: Arc<dyn Process>,
        reply: mpsc::Sender<Vec<u8>>,
    },
}

struct Inbox {
    sender: mpsc::Sender<InboxEntry>,
}

impl Inbox {
    /// Spawns the inbox thread of the host: only notifications arrive.
    fn spawn_host(registry: Arc<Registry>) -> Self {
        let (sender, receiver) = mpsc::channel::<InboxEntry>();
        thread::Builder::new()
            .name("inbox host".into())
            .spawn(move || {
                while let Ok(entry) = receiver.recv() {
                    match entry {
                        InboxEntry::Message(bytes, from) => match EventMessage::decode(&bytes) {
                            Ok(message) => registry.dispatch(&message, &from),
                            Err(err) => warn!("discarding undecodable message: {err}"),
                        },
                        InboxEntry::Request { .. } => {
                            warn!("discarding request sent to the host")
                        }
                    }
                }
            })
            .expect("failed to spawn inbox thread");
        Self { sender }
    }

    /// Spawns the inbox and request-worker threads of a daemon.
    fn spawn_daemon(name: &str, daemon: Arc<Daemon>, resolver: Arc<Resolver>) -> Self {
        let (sender, receiver) = mpsc::channel::<InboxEntry>();
        let (request_sender, request_receiver) = mpsc::channel::<InboxEntry>();

        {
            let daemon = daemon.clone();
            thread::Builder::new()
                .name(format!("requests {name}"))
                .spawn(move || {
                    while let Ok(entry) = request_receiver.recv() {
                        if let InboxEntry::Request { bytes, connection_id, from, reply } = entry {
                            let response = match Request::decode(&bytes) {
                                Ok(request) => daemon.handle_request(
                                    connection_id,
                                    &from,
                                    resolver.as_ref(),
                                    request,
                                ),
                                Err(err) => Response::Error(err.code()),
                            };
                            let _ = reply.send(response.encode());
                        }
                    }
                })
                .expect("failed to spawn request worker");
        }

        thread::Builder::new()
            .name(format!("inbox {name}"))
            .spawn(move || {
                while let Ok(entry) = receiver.recv() {
                    match entry {
                        InboxEntry::Message(bytes, from) => match EventMessage::decode(&bytes) {
                            Ok(message) => daemon.handle_message(&message, &from),
                            Err(err) => warn!("discarding undecodable message: {err}"),
                        },
                        request @ InboxEntry::Request { .. } => {
                            if request_sender.send(request).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn inbox thread");
        Self { sender }
    }
}

/* ***************************************************************************
 * Links: what one process sees of another
 ****************************************************************************/

/// A's handle of B: B's inbox plus the two bulk directions between them.
/// `reverse` is B's handle of A, delivered as the message source.
struct Link {
    url: String,
    inbox: mpsc::Sender<InboxEntry>,
    outgoing: Arc<BulkChannel>,
    incoming: Arc<BulkChannel>,
    reverse: Mutex<Option<Arc<dyn Process>>>,
}

impl Link {
    fn reverse(&self) -> Arc<dyn Process> {
        self.reverse.lock().unwrap().clone().expect("loopback link not wired")
    }
}

impl Process for Link {
    fn url(&self) -> &str {
        &self.url
    }

    fn send_message(&self, message: &EventMessage) -> Result<()> {
        self.inbox
            .send(InboxEntry::Message(message.encode(), self.reverse()))
            .map_err(|_| Error::Connection(format!("'{}' is gone", self.url)))
    }

    fn send_data(
        &self,
        payload: PayloadId,
        size: usize,
        ptr: SendConstPtr,
    ) -> Result<Arc<DataTransfer>> {
        Ok(self.outgoing.post_send(payload, size, ptr))
    }

    fn receive_data(
        &self,
        payload: PayloadId,
        size: usize,
        ptr: SendPtr,
    ) -> Result<Arc<DataTransfer>> {
        Ok(self.incoming.post_receive(payload, size, ptr))
    }
}

/// The host's connection to an in-process daemon. Requests round-trip
/// through the codec and travel the same ordered channel as notifications,
/// so a daemon observes them in the order the host produced them.
struct Connection {
    link: Arc<Link>,
    connection_id: u64,
}

impl Process for Connection {
    fn url(&self) -> &str {
        self.link.url()
    }

    fn send_message(&self, message: &EventMessage) -> Result<()> {
        self.link.send_message(message)
    }

    fn send_data(
        &self,
        payload: PayloadId,
        size: usize,
        ptr: SendConstPtr,
    ) -> Result<Arc<DataTransfer>> {
        self.link.send_data(payload, size, ptr)
    }

    fn receive_data(
        &self,
        payload: PayloadId,
        size: usize,
        ptr: SendPtr,
    ) -> Result<Arc<DataTransfer>> {
        self.link.receive_data(payload, size, ptr)
    }
}

impl NodeConnection for Connection {
    fn execute_command(&self, request: &Request) -> Result<Response> {
        let (reply, response) = mpsc::channel();
        self.link
            .inbox
            .send(InboxEntry::Request {
                bytes: request.encode(),
                connection_id: self.connection_id,
                from: self.link.reverse(),
                reply,
            })
            .map_err(|_| Error::Connection(format!("'{}' is gone", self.link.url)))?;
        let bytes = response
            .recv()
            .map_err(|_| Error::Connection(format!("'{}' is gone", self.link.url)))?;
        Response::decode(&bytes)
    }

    fn as_process(self: Arc<Self>) -> Arc<dyn Process> {
        self
    }
}

/// Resolves context peer URLs against the cluster's process table.
#[derive(Default)]
struct Resolver {
    peers: Mutex<HashMap<String, Arc<dyn Process>>>,
}

impl PeerResolver for Resolver {
    fn peer(&self, url: &str) -> Result<Arc<dyn Process>> {
        self.peers
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Connection(format!("unknown compute node '{url}'")))
    }
}

/* ***************************************************************************
 * Cluster assembly
 ****************************************************************************/

/// An in-process virtual platform: one host, `node_count` daemons, all
/// served by the built-in software platform.
pub struct Cluster {
    pub platform: Platform,
    daemons: Vec<Arc<Daemon>>,
}

impl Cluster {
    pub fn daemons(&self) -> &[Arc<Daemon>] {
        &self.daemons
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for (index, daemon) in self.daemons.iter().enumerate() {
            daemon.disconnect(index as u64);
        }
    }
}

pub fn node_url(index: usize) -> String {
    format!("loopback://node{index}")
}

/// Builds a cluster of `node_count` software-platform daemons and a host
/// platform connected to all of them.
pub fn cluster(node_count: usize) -> Result<Cluster> {
    let registry = Arc::new(Registry::new());
    let daemons: Vec<Arc<Daemon>> = (0..node_count)
        .map(|_| Daemon::new(Arc::new(native::software::SoftwarePlatform::new())))
        .collect();
    let resolvers: Vec<Arc<Resolver>> =
        (0..node_count).map(|_| Arc::new(Resolver::default())).collect();

    let host_inbox = Inbox::spawn_host(registry.clone());
    let daemon_inboxes: Vec<Inbox> = daemons
        .iter()
        .enumerate()
        .map(|(index, daemon)| {
            Inbox::spawn_daemon(&node_url(index), daemon.clone(), resolvers[index].clone())
        })
        .collect();

    // one bulk channel per ordered process pair; host is process 0
    let process_count = node_count + 1;
    let mut channels: HashMap<(usize, usize), Arc<BulkChannel>> = HashMap::new();
    for a in 0..process_count {
        for b in 0..process_count {
            if a != b {
                channels.insert((a, b), Arc::new(BulkChannel::default()));
            }
        }
    }
    let inbox_of = |index: usize| {
        if index == 0 {
            host_inbox.sender.clone()
        } else {
            daemon_inboxes[index - 1].sender.clone()
        }
    };
    let url_of = |index: usize| {
        if index == 0 {
            "loopback://host".to_string()
        } else {
            node_url(index - 1)
        }
    };

    // links[a][b]: a's handle of b
    let mut links: HashMap<(usize, usize), Arc<Link>> = HashMap::new();
    for a in 0..process_count {
        for b in 0..process_count {
            if a == b {
                continue;
            }
            links.insert(
                (a, b),
                Arc::new(Link {
                    url: url_of(b),
                    inbox: inbox_of(b),
                    outgoing: channels[&(a, b)].clone(),
                    incoming: channels[&(b, a)].clone(),
                    reverse: Mutex::new(None),
                }),
            );
        }
    }
    for ((a, b), link) in &links {
        let reverse: Arc<dyn Process> = links[&(*b, *a)].clone();
        *link.reverse.lock().unwrap() = Some(reverse);
    }

    // each daemon resolves its peers and the host by URL
    for daemon_index in 1..process_count {
        let mut peers = resolvers[daemon_index - 1].peers.lock().unwrap();
        for other in 0..process_count {
            if other != daemon_index {
                let process: Arc<dyn Process> = links[&(daemon_index, other)].clone();
                peers.insert(url_of(other), process);
            }
        }
    }

    let mut connections: Vec<Arc<dyn NodeConnection>> = Vec::with_capacity(node_count);
    for (index, daemon) in daemons.iter().enumerate() {
        daemon.connect(index as u64);
        connections.push(Arc::new(Connection {
            link: links[&(0, index + 1)].clone(),
            connection_id: index as u64,
        }));
    }

    let platform = Platform::from_connections(registry, connections)?;
    Ok(Cluster { platform, daemons })
}

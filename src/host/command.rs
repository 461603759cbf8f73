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

//! Host-side command: the record of one enqueued operation.
//!
//! A command listens for execution-status messages from its daemon and
//! drives the host's part of the work through two hooks: `submit` runs when
//! the status reaches `CL_SUBMITTED` and starts any host-side transfer
//! (a read posts the data receipt, a write posts the sending); `complete`
//! runs at a terminal status (an unmap releases its mapping, a broadcast
//! counts per-node completions). The generic state machine is shared by
//! all command kinds.

use super::command_queue::CommandQueue;
use super::event::Event;
use super::memory::Buffer;
use crate::error::{Error, Result};
use crate::registry::CommandListener;
use crate::transport::{SendConstPtr, SendPtr};
use crate::types::{
    cl_command_type, cl_int, cl_map_flags, is_terminal, ObjectId, PayloadId, CL_COMPLETE,
    CL_IO_ERROR, CL_MAP_READ, CL_MAP_WRITE, CL_QUEUED, CL_RUNNING, CL_SUBMITTED,
};
use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

pub enum CommandKind {
    /// Executed entirely on the compute node.
    Plain,
    /// The host receives `size` bytes into `ptr` once the node has mapped
    /// the buffer for reading.
    ReadBuffer { ptr: SendPtr, size: usize },
    /// The host sends `size` bytes from `ptr` once the node has mapped the
    /// buffer for writing.
    WriteBuffer { ptr: SendConstPtr, size: usize },
    /// Map: behaves like a read when mapped for reading, otherwise the
    /// node completes it as a marker.
    MapBuffer { flags: cl_map_flags, ptr: SendPtr, size: usize },
    /// Unmap: uploads the region when the mapping was writable, and always
    /// releases the mapping record on completion.
    UnmapBuffer { buffer: Arc<Buffer>, flags: cl_map_flags, ptr: SendPtr, size: usize },
    /// Collective broadcast: complete once every participating node has
    /// reported completion.
    Broadcast { remaining: AtomicUsize },
}

pub struct Command {
    id: ObjectId,
    command_type: cl_command_type,
    queue: Arc<CommandQueue>,
    kind: CommandKind,
    status: Mutex<cl_int>,
    status_changed: Condvar,
    event: Mutex<Option<Weak<Event>>>,
    weak_self: Weak<Command>,
}

impl Command {
    /// Creates the command and binds it to incoming status messages.
    pub(crate) fn new(
        command_type: cl_command_type,
        queue: Arc<CommandQueue>,
        kind: CommandKind,
    ) -> Arc<Self> {
        let id = queue.context().next_id();
        let command = Arc::new_cyclic(|weak_self| Self {
            id,
            command_type,
            queue,
            kind,
            status: Mutex::new(CL_QUEUED),
            status_changed: Condvar::new(),
            event: Mutex::new(None),
            weak_self: weak_self.clone(),
        });
        let trait_arc: Arc<dyn CommandListener> = command.clone();
        let listener: Weak<dyn CommandListener> = Arc::downgrade(&trait_arc);
        command.queue.context().registry().bind_command_listener(id, listener);
        command
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn command_type(&self) -> cl_command_type {
        self.command_type
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Attaches the event associated with this command. Called at most
    /// once; the current status is pushed into the event immediately.
    pub(crate) fn set_event(&self, event: &Arc<Event>) {
        let status = {
            let mut slot = self.event.lock().unwrap();
            debug_assert!(slot.is_none());
            *slot = Some(Arc::downgrade(event));
            *self.status.lock().unwrap()
        };
        event.on_command_execution_status_changed(status);
    }

    pub fn is_complete(&self) -> bool {
        is_terminal(*self.status.lock().unwrap())
    }

    /// Blocks until the command is terminal; an error status becomes an
    /// error.
    pub fn wait(&self) -> Result<()> {
        let mut status = self.status.lock().unwrap();
        while !is_terminal(*status) {
            status = self.status_changed.wait(status).unwrap();
        }
        if *status < 0 {
            return Err(Error::Cl(*status));
        }
        Ok(())
    }

    /// Message-driven entry point of the command state machine.
    pub(crate) fn update_execution_status(self: &Arc<Self>, status: cl_int) {
        let mut status = status;
        if status == CL_SUBMITTED {
            status = self.submit();
        }
        if is_terminal(status) {
            status = self.complete(status);
        }

        let changed = {
            let mut current = self.status.lock().unwrap();
            // statuses only ever decrease; stale or repeated updates are
            // ignored
            if status < *current {
                *current = status;
                true
            } else {
                false
            }
        };
        if !changed {
            return;
        }
        debug!("changed command execution status (ID={}, status={status})", self.id);
        self.status_changed.notify_all();

        let event = self.event.lock().unwrap().as_ref().and_then(Weak::upgrade);
        if let Some(event) = event {
            event.on_command_execution_status_changed(status);
        }
    }

    /// Starts the host's part of the data movement. Returns the status the
    /// command proceeds with.
    fn submit(self: &Arc<Self>) -> cl_int {
        let node = match self.queue.device().compute_node() {
            Ok(node) => node,
            Err(err) => return err.code(),
        };
        let process = node.process();
        let payload = PayloadId::command(self.id);
        match &self.kind {
            CommandKind::ReadBuffer { ptr, size } => {
                let command = self.clone();
                match process.receive_data(payload, *size, *ptr) {
                    Ok(receipt) => {
                        receipt.set_callback(move |status| {
                            command.update_execution_status(status);
                        });
                        CL_RUNNING
                    }
                    Err(_) => CL_IO_ERROR,
                }
            }
            CommandKind::MapBuffer { flags, ptr, size } if flags & CL_MAP_READ != 0 => {
                let command = self.clone();
                match process.receive_data(payload, *size, *ptr) {
                    Ok(receipt) => {
                        receipt.set_callback(move |status| {
                            command.update_execution_status(status);
                        });
                        CL_RUNNING
                    }
                    Err(_) => CL_IO_ERROR,
                }
            }
            CommandKind::WriteBuffer { ptr, size } => {
                // completion is reported by the compute node
                match process.send_data(payload, *size, *ptr) {
                    Ok(_) => CL_RUNNING,
                    Err(_) => CL_IO_ERROR,
                }
            }
            CommandKind::UnmapBuffer { flags, ptr, size, .. } if flags & CL_MAP_WRITE != 0 => {
                match process.send_data(payload, *size, SendConstPtr(ptr.0 as *const u8)) {
                    Ok(_) => CL_RUNNING,
                    Err(_) => CL_IO_ERROR,
                }
            }
            _ => CL_RUNNING,
        }
    }

    /// Finishes the host's part of the command; returns its final status.
    fn complete(&self, status: cl_int) -> cl_int {
        match &self.kind {
            CommandKind::UnmapBuffer { buffer, ptr, .. } => {
                if status == CL_COMPLETE {
                    if let Err(err) = buffer.unmap(ptr.0) {
                        return err.code();
                    }
                }
                status
            }
            CommandKind::Broadcast { remaining } => {
                if status == CL_COMPLETE && remaining.fetch_sub(1, Ordering::SeqCst) > 1 {
                    // other nodes are still writing
                    return CL_RUNNING;
                }
                status
            }
            _ => status,
        }
    }
}

impl CommandListener for Command {
    fn on_execution_status_changed(&self, status: cl_int) {
        if let Some(command) = self.weak_self.upgrade() {
            command.update_execution_status(status);
        }
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        self.queue.context().registry().unbind_command_listener(self.id);
    }
}

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

//! Transport contract.
//!
//! The engine only consumes these primitives; the wiring behind them is
//! interchangeable. Two implementations ship: [`loopback`] connects a host
//! and several daemons inside one process (used by the test-suite), [`tcp`]
//! connects them over the network.
//!
//! Every connection carries two channels: a message channel for typed
//! protocol messages and a bulk channel for raw byte payloads. Bulk
//! transfers are posted asynchronously on both sides and matched by
//! [`PayloadId`]; a transfer handle completes when the payload has been
//! copied, successfully or not.

pub mod loopback;
pub mod tcp;

use crate::error::{Error, Result};
use crate::protocol::{EventMessage, Request, Response};
use crate::types::{cl_int, is_terminal, PayloadId, CL_COMPLETE, CL_RUNNING};
use std::sync::{Arc, Condvar, Mutex};

/// A raw pointer that may be handed to another thread.
///
/// The poster of a bulk transfer guarantees the pointed-to region stays
/// valid and unaliased until the transfer handle completes.
#[derive(Clone, Copy)]
pub struct SendPtr(pub *mut u8);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

#[derive(Clone, Copy)]
pub struct SendConstPtr(pub *const u8);

unsafe impl Send for SendConstPtr {}
unsafe impl Sync for SendConstPtr {}

/// Completion handle of an asynchronous bulk transfer.
///
/// Starts out running and transitions exactly once to `CL_COMPLETE` or a
/// negative error code. Callbacks registered after completion fire
/// synchronously on the registering thread.
pub struct DataTransfer {
    state: Mutex<TransferState>,
    complete: Condvar,
}

struct TransferState {
    status: cl_int,
    callbacks: Vec<Box<dyn FnOnce(cl_int) + Send>>,
}

impl Default for DataTransfer {
    fn default() -> Self {
        Self {
            state: Mutex::new(TransferState { status: CL_RUNNING, callbacks: Vec::new() }),
            complete: Condvar::new(),
        }
    }
}

impl DataTransfer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a completion callback; fires immediately if the transfer
    /// has already completed.
    pub fn set_callback(&self, callback: impl FnOnce(cl_int) + Send + 'static) {
        let status = {
            let mut state = self.state.lock().unwrap();
            if !is_terminal(state.status) {
                state.callbacks.push(Box::new(callback));
                return;
            }
            state.status
        };
        callback(status);
    }

    /// Marks the transfer terminal and fires the registered callbacks.
    /// Later calls are ignored.
    pub fn finish(&self, status: cl_int) {
        debug_assert!(is_terminal(status));
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if is_terminal(state.status) {
                return;
            }
            state.status = status;
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(status);
        }
        self.complete.notify_all();
    }

    /// Blocks until the transfer is terminal and returns its status.
    pub fn wait(&self) -> cl_int {
        let mut state = self.state.lock().unwrap();
        while !is_terminal(state.status) {
            state = self.complete.wait(state).unwrap();
        }
        state.status
    }

    /// Like [`wait`](Self::wait) but maps failure onto an error.
    pub fn wait_ok(&self) -> Result<()> {
        match self.wait() {
            CL_COMPLETE => Ok(()),
            code => Err(Error::Cl(code)),
        }
    }

    pub fn is_complete(&self) -> bool {
        is_terminal(self.state.lock().unwrap().status)
    }
}

/// A remote process reachable over a connection: the host as seen from a
/// daemon, a daemon as seen from the host, or a peer daemon.
pub trait Process: Send + Sync {
    /// Connection URL, for diagnostics.
    fn url(&self) -> &str;

    /// Sends an asynchronous notification. Never blocks on the remote side.
    fn send_message(&self, message: &EventMessage) -> Result<()>;

    /// Posts an outgoing bulk transfer of `size` bytes at `ptr`.
    fn send_data(&self, payload: PayloadId, size: usize, ptr: SendConstPtr)
        -> Result<Arc<DataTransfer>>;

    /// Posts an incoming bulk transfer of `size` bytes into `ptr`.
    fn receive_data(&self, payload: PayloadId, size: usize, ptr: SendPtr)
        -> Result<Arc<DataTransfer>>;
}

/// A connection to a compute node that can execute requests. Only the host
/// issues requests; daemons answer them.
pub trait NodeConnection: Process {
    /// Sends `request` and blocks until the matching response arrives.
    fn execute_command(&self, request: &Request) -> Result<Response>;

    /// The same connection as a plain message/bulk peer.
    fn as_process(self: Arc<Self>) -> Arc<dyn Process>;
}

/// Resolves context peer URLs to process handles on a daemon.
pub trait PeerResolver: Send + Sync {
    fn peer(&self, url: &str) -> Result<Arc<dyn Process>>;
}

/// Sends `message` to every process in `processes`; the first failure wins.
pub fn send_message_to_all(processes: &[Arc<dyn Process>], message: &EventMessage) -> Result<()> {
    for process in processes {
        process.send_message(message)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CL_IO_ERROR;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_transfer_completion() {
        let transfer = DataTransfer::new();
        let seen = Arc::new(AtomicI32::new(i32::MIN));

        let seen_by_callback = seen.clone();
        transfer.set_callback(move |status| {
            seen_by_callback.store(status, Ordering::SeqCst);
        });
        assert!(!transfer.is_complete());

        transfer.finish(CL_COMPLETE);
        assert_eq!(seen.load(Ordering::SeqCst), CL_COMPLETE);
        assert_eq!(transfer.wait(), CL_COMPLETE);

        // completion is sticky
        transfer.finish(CL_IO_ERROR);
        assert_eq!(transfer.wait(), CL_COMPLETE);
    }

    #[test]
    fn test_late_callback_fires_synchronously() {
        let transfer = DataTransfer::new();
        transfer.finish(CL_IO_ERROR);

        let seen = Arc::new(AtomicI32::new(0));
        let seen_by_callback = seen.clone();
        transfer.set_callback(move |status| {
            seen_by_callback.store(status, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), CL_IO_ERROR);
        assert!(transfer.wait_ok().is_err());
    }
}

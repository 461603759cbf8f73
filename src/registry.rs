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

//! The object registry: a per-process table mapping object ids to the
//! listeners that consume incoming asynchronous notifications.
//!
//! Both the host runtime and every daemon own one registry. An id may be
//! bound for more than one listener kind at a time; commands and their
//! events share an id, with the command listening for execution-status
//! changes and the event for synchronisation requests. Listeners are held
//! weakly: the registry never keeps an object alive, it only routes to it.

use crate::protocol::EventMessage;
use crate::transport::Process;
use crate::types::{cl_int, ObjectId};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Consumes command-execution-status-changed notifications.
pub trait CommandListener: Send + Sync {
    fn on_execution_status_changed(&self, status: cl_int);
}

/// Consumes event-synchronisation requests. `process` is the process the
/// request arrived from, i.e. the destination of any released data.
pub trait SynchronizationListener: Send + Sync {
    fn on_synchronize(&self, process: &Arc<dyn Process>);
}

#[derive(Default)]
struct Tables {
    commands: HashMap<ObjectId, Weak<dyn CommandListener>>,
    synchronizations: HashMap<ObjectId, Weak<dyn SynchronizationListener>>,
}

#[derive(Default)]
pub struct Registry {
    tables: Mutex<Tables>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_command_listener(&self, id: ObjectId, listener: Weak<dyn CommandListener>) {
        let mut tables = self.tables.lock().unwrap();
        tables.commands.insert(id, listener);
    }

    pub fn unbind_command_listener(&self, id: ObjectId) {
        let mut tables = self.tables.lock().unwrap();
        tables.commands.remove(&id);
    }

    pub fn bind_synchronization_listener(
        &self,
        id: ObjectId,
        listener: Weak<dyn SynchronizationListener>,
    ) {
        let mut tables = self.tables.lock().unwrap();
        tables.synchronizations.insert(id, listener);
    }

    pub fn unbind_synchronization_listener(&self, id: ObjectId) {
        let mut tables = self.tables.lock().unwrap();
        tables.synchronizations.remove(&id);
    }

    /// Looks up the command listener for `id`, if one is bound and alive.
    /// The strong reference is returned so the caller can notify it outside
    /// the registry lock.
    pub fn lookup_command_listener(&self, id: ObjectId) -> Option<Arc<dyn CommandListener>> {
        let tables = self.tables.lock().unwrap();
        tables.commands.get(&id).and_then(Weak::upgrade)
    }

    pub fn lookup_synchronization_listener(
        &self,
        id: ObjectId,
    ) -> Option<Arc<dyn SynchronizationListener>> {
        let tables = self.tables.lock().unwrap();
        tables.synchronizations.get(&id).and_then(Weak::upgrade)
    }

    /// Routes an incoming notification to the listener bound to the id it
    /// carries. Messages for unknown ids are discarded with a warning; the
    /// object may legitimately have been released already.
    pub fn dispatch(&self, message: &EventMessage, from: &Arc<dyn Process>) {
        match message {
            EventMessage::CommandExecutionStatusChanged { id, status } => {
                match self.lookup_command_listener(*id) {
                    Some(listener) => {
                        debug!("dispatching status change (ID={id}, status={status})");
                        listener.on_execution_status_changed(*status);
                    }
                    None => warn!("discarding status change for unknown object (ID={id})"),
                }
            }
            EventMessage::EventSynchronization { id } => {
                match self.lookup_synchronization_listener(*id) {
                    Some(listener) => {
                        debug!("dispatching synchronization request (ID={id})");
                        listener.on_synchronize(from);
                    }
                    None => warn!("discarding synchronization request for unknown object (ID={id})"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct Recorder {
        last: AtomicI32,
    }

    impl CommandListener for Recorder {
        fn on_execution_status_changed(&self, status: cl_int) {
            self.last.store(status, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_bind_lookup_unbind() {
        let registry = Registry::new();
        let listener = Arc::new(Recorder { last: AtomicI32::new(3) });

        let weak: Weak<dyn CommandListener> =
            Arc::downgrade(&(listener.clone() as Arc<dyn CommandListener>));
        registry.bind_command_listener(42, weak);
        let found = registry.lookup_command_listener(42).unwrap();
        found.on_execution_status_changed(0);
        assert_eq!(listener.last.load(Ordering::SeqCst), 0);

        registry.unbind_command_listener(42);
        assert!(registry.lookup_command_listener(42).is_none());
    }

    #[test]
    fn test_dropped_listener_is_not_returned() {
        let registry = Registry::new();
        let listener = Arc::new(Recorder { last: AtomicI32::new(3) });
        let weak: Weak<dyn CommandListener> =
            Arc::downgrade(&(listener.clone() as Arc<dyn CommandListener>));
        registry.bind_command_listener(7, weak);
        drop(listener);
        assert!(registry.lookup_command_listener(7).is_none());
    }
}

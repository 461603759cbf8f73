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

//! Per-host session: the tables of live objects a connected host owns on
//! this daemon.
//!
//! A session is created on first connection and destroyed on disconnect.
//! Teardown fails every replica event that is still pending before the
//! tables are dropped; a native context cannot be torn down while user
//! events inside it are unset.

use super::context::Context;
use super::command_queue::CommandQueue;
use super::event::Event;
use super::memory::Buffer;
use super::program::{Kernel, Program};
use crate::registry::{CommandListener, Registry, SynchronizationListener};
use crate::types::{is_terminal, ObjectId, CL_CONNECTION_ERROR};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

#[derive(Default)]
struct Objects {
    contexts: HashMap<ObjectId, Arc<Context>>,
    command_queues: HashMap<ObjectId, Arc<CommandQueue>>,
    buffers: HashMap<ObjectId, Arc<Buffer>>,
    programs: HashMap<ObjectId, Arc<Program>>,
    kernels: HashMap<ObjectId, Arc<Kernel>>,
    events: HashMap<ObjectId, Arc<Event>>,
}

pub struct Session {
    registry: Arc<Registry>,
    objects: Mutex<Objects>,
}

impl Session {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self { registry, objects: Mutex::new(Objects::default()) })
    }

    pub fn insert_context(&self, id: ObjectId, context: Arc<Context>) {
        self.objects.lock().unwrap().contexts.insert(id, context);
    }

    pub fn context(&self, id: ObjectId) -> Option<Arc<Context>> {
        self.objects.lock().unwrap().contexts.get(&id).cloned()
    }

    pub fn remove_context(&self, id: ObjectId) -> Option<Arc<Context>> {
        self.objects.lock().unwrap().contexts.remove(&id)
    }

    pub fn insert_command_queue(&self, id: ObjectId, queue: Arc<CommandQueue>) {
        self.objects.lock().unwrap().command_queues.insert(id, queue);
    }

    pub fn command_queue(&self, id: ObjectId) -> Option<Arc<CommandQueue>> {
        self.objects.lock().unwrap().command_queues.get(&id).cloned()
    }

    pub fn remove_command_queue(&self, id: ObjectId) -> Option<Arc<CommandQueue>> {
        self.objects.lock().unwrap().command_queues.remove(&id)
    }

    pub fn insert_buffer(&self, id: ObjectId, buffer: Arc<Buffer>) {
        self.objects.lock().unwrap().buffers.insert(id, buffer);
    }

    pub fn buffer(&self, id: ObjectId) -> Option<Arc<Buffer>> {
        self.objects.lock().unwrap().buffers.get(&id).cloned()
    }

    pub fn remove_buffer(&self, id: ObjectId) -> Option<Arc<Buffer>> {
        self.objects.lock().unwrap().buffers.remove(&id)
    }

    pub fn insert_program(&self, id: ObjectId, program: Arc<Program>) {
        self.objects.lock().unwrap().programs.insert(id, program);
    }

    pub fn program(&self, id: ObjectId) -> Option<Arc<Program>> {
        self.objects.lock().unwrap().programs.get(&id).cloned()
    }

    pub fn remove_program(&self, id: ObjectId) -> Option<Arc<Program>> {
        self.objects.lock().unwrap().programs.remove(&id)
    }

    pub fn insert_kernel(&self, id: ObjectId, kernel: Arc<Kernel>) {
        self.objects.lock().unwrap().kernels.insert(id, kernel);
    }

    pub fn kernel(&self, id: ObjectId) -> Option<Arc<Kernel>> {
        self.objects.lock().unwrap().kernels.get(&id).cloned()
    }

    pub fn remove_kernel(&self, id: ObjectId) -> Option<Arc<Kernel>> {
        self.objects.lock().unwrap().kernels.remove(&id)
    }

    /// Stores an event and binds it into the registry: replicas listen for
    /// execution-status messages, every event answers synchronisation
    /// requests.
    pub fn insert_event(&self, event: Arc<Event>) {
        let id = event.id();
        if event.is_replica() {
            let command_trait_arc: Arc<dyn CommandListener> = event.clone();
            let listener: Weak<dyn CommandListener> = Arc::downgrade(&command_trait_arc);
            self.registry.bind_command_listener(id, listener);
        }
        let sync_trait_arc: Arc<dyn SynchronizationListener> = event.clone();
        let listener: Weak<dyn SynchronizationListener> = Arc::downgrade(&sync_trait_arc);
        self.registry.bind_synchronization_listener(id, listener);
        self.objects.lock().unwrap().events.insert(id, event);
    }

    pub fn event(&self, id: ObjectId) -> Option<Arc<Event>> {
        self.objects.lock().unwrap().events.get(&id).cloned()
    }

    pub fn remove_event(&self, id: ObjectId) -> Option<Arc<Event>> {
        self.registry.unbind_command_listener(id);
        self.registry.unbind_synchronization_listener(id);
        self.objects.lock().unwrap().events.remove(&id)
    }

    /// Tears the session down after a disconnect: pending replica events
    /// are failed with the connection-loss code so that native context
    /// teardown cannot block on them, then all object tables are dropped.
    pub fn tear_down(&self) {
        let objects = {
            let mut objects = self.objects.lock().unwrap();
            std::mem::take(&mut *objects)
        };
        for (id, event) in &objects.events {
            self.registry.unbind_command_listener(*id);
            self.registry.unbind_synchronization_listener(*id);
            if event.is_replica() && !is_terminal(event.native().status()) {
                warn!("cancelling pending replica event (ID={id})");
                let _ = event.native().set_status(CL_CONNECTION_ERROR);
            }
        }
        info!(
            "session torn down ({} contexts, {} queues, {} buffers, {} events)",
            objects.contexts.len(),
            objects.command_queues.len(),
            objects.buffers.len(),
            objects.events.len()
        );
    }
}

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

//! Daemon-side program and kernel objects.
//!
//! Kernels track their memory-object arguments so that an ND-range enqueue
//! can attach the set of writable arguments to its event; those are the
//! memory objects a consumer of the event acquires.

use super::memory::Buffer;
use crate::error::Result;
use crate::native;
use crate::types::ObjectId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A kernel argument with any memory-object id already resolved against
/// the session's object table.
pub enum ResolvedArg {
    Memory(Arc<Buffer>),
    Bytes(Vec<u8>),
}

pub struct Program {
    native: Arc<dyn native::Program>,
}

impl Program {
    pub fn new(native: Arc<dyn native::Program>) -> Arc<Self> {
        Arc::new(Self { native })
    }

    pub fn build(&self, options: &str) -> Result<()> {
        self.native.build(options)
    }

    pub fn create_kernel(&self, name: &str) -> Result<Arc<dyn native::Kernel>> {
        self.native.create_kernel(name)
    }
}

pub struct Kernel {
    native: Arc<dyn native::Kernel>,
    memory_arguments: Mutex<HashMap<u32, Arc<Buffer>>>,
}

impl Kernel {
    pub fn new(native: Arc<dyn native::Kernel>) -> Arc<Self> {
        Arc::new(Self { native, memory_arguments: Mutex::new(HashMap::new()) })
    }

    pub fn native(&self) -> &Arc<dyn native::Kernel> {
        &self.native
    }

    pub fn set_arg(&self, index: u32, arg: ResolvedArg) -> Result<()> {
        match arg {
            ResolvedArg::Memory(buffer) => {
                self.native.set_arg_buffer(index, buffer.native())?;
                self.memory_arguments.lock().unwrap().insert(index, buffer);
            }
            ResolvedArg::Bytes(bytes) => {
                self.native.set_arg_bytes(index, &bytes)?;
                self.memory_arguments.lock().unwrap().remove(&index);
            }
        }
        Ok(())
    }

    /// The writable memory objects currently bound as arguments, without
    /// duplicates. These are what an ND-range kernel's event releases.
    pub fn write_memory_objects(&self) -> Vec<Arc<Buffer>> {
        let arguments = self.memory_arguments.lock().unwrap();
        let mut seen: Vec<ObjectId> = Vec::new();
        let mut objects = Vec::new();
        for buffer in arguments.values() {
            if buffer.is_output() && !seen.contains(&buffer.id()) {
                seen.push(buffer.id());
                objects.push(buffer.clone());
            }
        }
        objects
    }
}

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

//! Host-side kernel object.
//!
//! Argument values are forwarded to every context node. Memory-object
//! arguments are additionally tracked on the host, because the writable
//! ones form the release set of every event produced by enqueuing this
//! kernel.

use super::compute_node::execute_on_all;
use super::memory::{check_context, Buffer};
use super::program::Program;
use super::References;
use crate::error::Result;
use crate::protocol::{KernelArg, Request};
use crate::types::{cl_uint, ObjectId};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct Kernel {
    id: ObjectId,
    program: Arc<Program>,
    name: String,
    memory_arguments: Mutex<HashMap<cl_uint, Arc<Buffer>>>,
    references: References,
    destroyed: AtomicBool,
}

impl Kernel {
    pub fn create(program: &Arc<Program>, name: &str) -> Result<Arc<Self>> {
        let context = program.context();
        let id = context.next_id();
        execute_on_all(
            context.compute_nodes(),
            &Request::CreateKernel { id, program_id: program.id(), name: name.to_string() },
        )?;
        info!("kernel '{name}' created (ID={id})");
        Ok(Arc::new(Self {
            id,
            program: program.clone(),
            name: name.to_string(),
            memory_arguments: Mutex::new(HashMap::new()),
            references: References::new(),
            destroyed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn function_name(&self) -> &str {
        &self.name
    }

    /// Binds a memory object to argument `index` on every context node.
    pub fn set_arg_buffer(&self, index: cl_uint, buffer: &Arc<Buffer>) -> Result<()> {
        check_context(buffer, self.program.context())?;
        execute_on_all(
            self.program.context().compute_nodes(),
            &Request::SetKernelArg {
                kernel_id: self.id,
                index,
                arg: KernelArg::Memory(buffer.id()),
            },
        )?;
        self.memory_arguments.lock().unwrap().insert(index, buffer.clone());
        Ok(())
    }

    /// Binds a by-value argument, as raw bytes, on every context node.
    pub fn set_arg_bytes(&self, index: cl_uint, bytes: &[u8]) -> Result<()> {
        execute_on_all(
            self.program.context().compute_nodes(),
            &Request::SetKernelArg {
                kernel_id: self.id,
                index,
                arg: KernelArg::Bytes(bytes.to_vec()),
            },
        )?;
        self.memory_arguments.lock().unwrap().remove(&index);
        Ok(())
    }

    /// The writable memory objects bound as arguments, deduplicated: the
    /// release set of an event produced by enqueuing this kernel.
    pub(crate) fn write_memory_objects(&self) -> Vec<Arc<Buffer>> {
        let arguments = self.memory_arguments.lock().unwrap();
        let mut objects: Vec<Arc<Buffer>> = Vec::new();
        for buffer in arguments.values() {
            if buffer.is_output() && !objects.iter().any(|other| Arc::ptr_eq(other, buffer)) {
                objects.push(buffer.clone());
            }
        }
        objects
    }

    pub fn reference_count(&self) -> u32 {
        self.references.count()
    }

    pub fn retain(&self) {
        self.references.retain();
    }

    pub fn release(&self) -> Result<()> {
        if self.references.release() {
            self.destroy()?;
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        execute_on_all(
            self.program.context().compute_nodes(),
            &Request::DeleteKernel { id: self.id },
        )?;
        info!("kernel deleted (ID={})", self.id);
        Ok(())
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            if let Err(err) = self.destroy() {
                warn!("deleting kernel failed (ID={}): {err}", self.id);
            }
        }
    }
}

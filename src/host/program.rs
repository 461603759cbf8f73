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

//! Host-side program object: OpenCL C source replicated to, and built on,
//! every context node.

use super::compute_node::execute_on_all;
use super::context::Context;
use super::References;
use crate::error::Result;
use crate::protocol::Request;
use crate::types::ObjectId;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Program {
    id: ObjectId,
    context: Arc<Context>,
    source: String,
    references: References,
    destroyed: AtomicBool,
}

impl Program {
    pub fn create_from_source(context: &Arc<Context>, source: &str) -> Result<Arc<Self>> {
        let id = context.next_id();
        execute_on_all(
            context.compute_nodes(),
            &Request::CreateProgram {
                id,
                context_id: context.id(),
                source: source.to_string(),
            },
        )?;
        info!("program created (ID={id})");
        Ok(Arc::new(Self {
            id,
            context: context.clone(),
            source: source.to_string(),
            references: References::new(),
            destroyed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Builds the program on every context node.
    pub fn build(&self, options: &str) -> Result<()> {
        execute_on_all(
            self.context.compute_nodes(),
            &Request::BuildProgram { id: self.id, options: options.to_string() },
        )?;
        info!("program built (ID={})", self.id);
        Ok(())
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
        execute_on_all(self.context.compute_nodes(), &Request::DeleteProgram { id: self.id })?;
        info!("program deleted (ID={})", self.id);
        Ok(())
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            if let Err(err) = self.destroy() {
                warn!("deleting program failed (ID={}): {err}", self.id);
            }
        }
    }
}

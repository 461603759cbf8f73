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

//! Host-side context: a device selection spanning one or more compute
//! nodes. Everything created through the context (queues, memory objects,
//! programs, kernels, events) lives on every context node that needs it.

use super::compute_node::{execute_on_all, ComputeNode};
use super::device::Device;
use super::platform::Platform;
use super::References;
use crate::error::{Error, Result};
use crate::protocol::Request;
use crate::registry::Registry;
use crate::types::{ObjectId, CL_INVALID_DEVICE, CL_INVALID_VALUE};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub struct Context {
    id: ObjectId,
    registry: Arc<Registry>,
    nodes: Vec<Arc<ComputeNode>>,
    devices: Vec<Arc<Device>>,
    id_source: Arc<AtomicU64>,
    references: References,
    destroyed: AtomicBool,
}

impl Context {
    /// Creates a context over `devices`, which may live on any subset of
    /// the platform's compute nodes.
    pub fn from_devices(platform: &Platform, devices: &[Arc<Device>]) -> Result<Arc<Self>> {
        if devices.is_empty() {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }

        // group the devices by owning node, preserving platform node order
        let mut nodes: Vec<Arc<ComputeNode>> = Vec::new();
        for device in devices {
            let node = device.compute_node()?;
            if !platform.compute_nodes().iter().any(|known| Arc::ptr_eq(known, &node)) {
                return Err(Error::Cl(CL_INVALID_DEVICE));
            }
            if !nodes.iter().any(|existing| Arc::ptr_eq(existing, &node)) {
                nodes.push(node);
            }
        }

        let id = platform.next_id();
        let context = Arc::new(Self {
            id,
            registry: platform.registry().clone(),
            nodes,
            devices: devices.to_vec(),
            id_source: platform.id_source(),
            references: References::new(),
            destroyed: AtomicBool::new(false),
        });

        for node in &context.nodes {
            let device_indices: Vec<u32> = devices
                .iter()
                .filter(|device| {
                    device
                        .compute_node()
                        .map(|owner| Arc::ptr_eq(&owner, node))
                        .unwrap_or(false)
                })
                .map(|device| device.index())
                .collect();
            let peer_urls: Vec<String> = context
                .nodes
                .iter()
                .filter(|peer| !Arc::ptr_eq(peer, node))
                .map(|peer| peer.url().to_string())
                .collect();
            node.execute_command(&Request::CreateContext { id, device_indices, peer_urls })?;
        }
        info!("context created (ID={id})");
        Ok(context)
    }

    /// Creates a context over every device of the given compute nodes.
    pub fn from_compute_nodes(
        platform: &Platform,
        nodes: &[Arc<ComputeNode>],
    ) -> Result<Arc<Self>> {
        let devices: Vec<Arc<Device>> =
            nodes.iter().flat_map(|node| node.devices().iter().cloned()).collect();
        Self::from_devices(platform, &devices)
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn compute_nodes(&self) -> &[Arc<ComputeNode>] {
        &self.nodes
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn has_device(&self, device: &Arc<Device>) -> bool {
        self.devices.iter().any(|known| Arc::ptr_eq(known, device))
    }

    /// Allocates a fresh object id from the platform's central allocator.
    pub(crate) fn next_id(&self) -> ObjectId {
        self.id_source.fetch_add(1, Ordering::SeqCst)
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
        execute_on_all(&self.nodes, &Request::ReleaseContext { id: self.id })?;
        info!("context released (ID={})", self.id);
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            if let Err(err) = self.destroy() {
                warn!("releasing context failed (ID={}): {err}", self.id);
            }
        }
    }
}

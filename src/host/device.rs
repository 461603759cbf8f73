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

//! A remote device: the snapshot of a daemon device relayed at connection
//! time, plus the handle of the compute node serving it.

use super::compute_node::ComputeNode;
use crate::error::{Error, Result};
use crate::protocol::DeviceDescription;
use crate::types::{cl_device_type, cl_uint, CL_INVALID_DEVICE};
use std::sync::{Arc, Weak};

pub struct Device {
    description: DeviceDescription,
    node: Weak<ComputeNode>,
}

impl Device {
    pub(crate) fn new(description: DeviceDescription, node: Weak<ComputeNode>) -> Arc<Self> {
        Arc::new(Self { description, node })
    }

    /// Daemon-local device index; requests address the device by it.
    pub fn index(&self) -> cl_uint {
        self.description.index
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn vendor(&self) -> &str {
        &self.description.vendor
    }

    pub fn version(&self) -> &str {
        &self.description.version
    }

    pub fn device_type(&self) -> cl_device_type {
        self.description.device_type
    }

    pub fn description(&self) -> &DeviceDescription {
        &self.description
    }

    /// The compute node serving this device.
    pub fn compute_node(&self) -> Result<Arc<ComputeNode>> {
        self.node.upgrade().ok_or(Error::Cl(CL_INVALID_DEVICE))
    }
}

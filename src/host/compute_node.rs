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

//! Host-side handle to a compute node: the connection to its daemon and the
//! devices it serves.

use super::device::Device;
use crate::error::Result;
use crate::protocol::{Request, Response};
use crate::transport::{NodeConnection, Process};
use log::info;
use std::sync::Arc;

pub struct ComputeNode {
    url: String,
    connection: Arc<dyn NodeConnection>,
    devices: Vec<Arc<Device>>,
}

impl ComputeNode {
    /// Completes the connection handshake: enumerates the daemon's devices
    /// and builds their host-side handles.
    pub fn connect(connection: Arc<dyn NodeConnection>) -> Result<Arc<Self>> {
        let response = connection.execute_command(&Request::ListDevices)?.into_result()?;
        let descriptions = match response {
            Response::DeviceList(descriptions) => descriptions,
            _ => {
                return Err(crate::error::Error::Protocol(
                    "expected a device list".into(),
                ))
            }
        };
        let url = connection.url().to_string();
        info!("connected to compute node '{url}' ({} device(s))", descriptions.len());
        Ok(Arc::new_cyclic(|node| Self {
            url,
            devices: descriptions
                .into_iter()
                .map(|description| Device::new(description, node.clone()))
                .collect(),
            connection,
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Executes a request on the daemon; error responses become errors.
    pub fn execute_command(&self, request: &Request) -> Result<Response> {
        self.connection.execute_command(request)?.into_result()
    }

    /// The node as a message/bulk peer.
    pub fn process(&self) -> Arc<dyn Process> {
        self.connection.clone().as_process()
    }
}

/// Executes `request` on every node; the first failure wins.
pub fn execute_on_all(nodes: &[Arc<ComputeNode>], request: &Request) -> Result<()> {
    for node in nodes {
        node.execute_command(request)?;
    }
    Ok(())
}

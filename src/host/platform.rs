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

//! The virtual platform: all devices of all connected compute nodes behind
//! one OpenCL platform.
//!
//! The node list comes from a node file: one URL per line, `#` starts a
//! comment, surrounding whitespace is trimmed and blank lines are skipped.
//! The path is taken from the `DCL_NODE_FILE` environment variable, or
//! `dcl.nodes` in the working directory.
//!
//! The platform also hosts two process-wide concerns: the object registry
//! that routes incoming notifications, and the central id allocator (the
//! host allocates every object id; daemons never do).

use super::compute_node::ComputeNode;
use super::device::Device;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::transport::{tcp, NodeConnection};
use crate::types::{cl_int, ObjectId, CL_INVALID_NODE_FILE};
use lazy_static::lazy_static;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_NODE_FILE: &str = "dcl.nodes";
pub const NODE_FILE_ENV: &str = "DCL_NODE_FILE";

lazy_static! {
    static ref DEFAULT_PLATFORM: std::result::Result<Platform, cl_int> =
        Platform::connect_default().map_err(|err| err.code());
}

pub struct Platform {
    registry: Arc<Registry>,
    nodes: Vec<Arc<ComputeNode>>,
    next_id: Arc<AtomicU64>,
}

impl Platform {
    /// The process-wide platform built from the node file, connected over
    /// TCP. Initialised on first use.
    pub fn default() -> Result<&'static Platform> {
        DEFAULT_PLATFORM.as_ref().map_err(|code| Error::Cl(*code))
    }

    /// Connects to the nodes named in the node file.
    pub fn connect_default() -> Result<Platform> {
        let path =
            std::env::var(NODE_FILE_ENV).unwrap_or_else(|_| DEFAULT_NODE_FILE.to_string());
        let urls = read_node_file(Path::new(&path))?;
        let registry = Arc::new(Registry::new());
        let mut connections: Vec<Arc<dyn NodeConnection>> = Vec::with_capacity(urls.len());
        for url in &urls {
            connections.push(tcp::connect(url, registry.clone())?);
        }
        Self::from_connections(registry, connections)
    }

    /// Builds a platform over already-established connections. `registry`
    /// must be the registry the connections dispatch into.
    pub fn from_connections(
        registry: Arc<Registry>,
        connections: Vec<Arc<dyn NodeConnection>>,
    ) -> Result<Platform> {
        let mut nodes = Vec::with_capacity(connections.len());
        for connection in connections {
            nodes.push(ComputeNode::connect(connection)?);
        }
        Ok(Platform { registry, nodes, next_id: Arc::new(AtomicU64::new(1)) })
    }

    pub fn compute_nodes(&self) -> &[Arc<ComputeNode>] {
        &self.nodes
    }

    /// All devices of all nodes, in node order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.nodes.iter().flat_map(|node| node.devices().iter().cloned()).collect()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Allocates a fresh process-wide object id. Ids are never reused.
    pub(crate) fn next_id(&self) -> ObjectId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The central id allocator, shared with every context.
    pub(crate) fn id_source(&self) -> Arc<AtomicU64> {
        self.next_id.clone()
    }
}

/// Parses a node file into node URLs.
pub fn read_node_file(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .map_err(|err| Error::NodeFile(format!("{}: {err}", path.display())))?;
    let mut urls = Vec::new();
    for line in content.lines() {
        let line = match line.find('#') {
            Some(comment) => &line[..comment],
            None => line,
        };
        let line = line.trim();
        if !line.is_empty() {
            urls.push(line.to_string());
        }
    }
    if urls.is_empty() {
        return Err(Error::Cl(CL_INVALID_NODE_FILE));
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_file_parsing() {
        let dir = std::env::temp_dir();
        let path = dir.join("dopencl-node-file-test.nodes");
        fs::write(
            &path,
            "# cluster nodes\n  node0:25025  \n\nnode1 # gpu box\n   # trailing comment\n",
        )
        .unwrap();

        let urls = read_node_file(&path).unwrap();
        assert_eq!(urls, vec!["node0:25025", "node1"]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_node_file_is_an_error() {
        let err = read_node_file(Path::new("/nonexistent/dcl.nodes")).unwrap_err();
        assert_eq!(err.code(), CL_INVALID_NODE_FILE);
    }

    #[test]
    fn test_empty_node_file_is_an_error() {
        let dir = std::env::temp_dir();
        let path = dir.join("dopencl-empty-node-file-test.nodes");
        fs::write(&path, "# no nodes\n\n").unwrap();
        let err = read_node_file(&path).unwrap_err();
        assert_eq!(err.code(), CL_INVALID_NODE_FILE);
        fs::remove_file(&path).unwrap();
    }
}

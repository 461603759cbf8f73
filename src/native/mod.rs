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

//! Native OpenCL driver contract.
//!
//! The daemon drives whatever OpenCL platform is installed on its machine
//! through these traits. Queues are in-order; `enqueue_*` returns a native
//! event immediately and executes asynchronously. Event callbacks may fire
//! on arbitrary driver-owned threads.
//!
//! Two implementations ship: [`software`] is a self-contained host-CPU
//! platform used when no OpenCL installation is available (and by the
//! test-suite); [`opencl`] adapts a real driver through the `cl3` crate
//! and is enabled by the `dynamic`/`static` features.

pub mod software;

#[cfg(any(feature = "dynamic", feature = "static"))]
pub mod opencl;

use crate::error::Result;
use crate::protocol::DeviceDescription;
use crate::transport::SendPtr;
use crate::types::{
    cl_command_queue_properties, cl_int, cl_map_flags, cl_mem_flags, cl_profiling_info, cl_ulong,
};
use std::any::Any;
use std::sync::Arc;

pub type EventCallback = Box<dyn FnOnce(cl_int) + Send>;

pub trait Platform: Send + Sync {
    fn name(&self) -> String;
    fn version(&self) -> String;
    fn device_count(&self) -> usize;
    fn device_description(&self, index: usize) -> Result<DeviceDescription>;

    /// Creates a context over the devices named by daemon-local index.
    fn create_context(&self, device_indices: &[usize]) -> Result<Arc<dyn Context>>;
}

pub trait Context: Send + Sync {
    /// Creates a command queue on the device with the given index within
    /// this context's device list, honouring the requested properties
    /// (out-of-order execution, profiling).
    fn create_queue(
        &self,
        device_index: usize,
        properties: cl_command_queue_properties,
    ) -> Result<Arc<dyn Queue>>;

    fn create_buffer(
        &self,
        flags: cl_mem_flags,
        size: usize,
        init: Option<&[u8]>,
    ) -> Result<Arc<dyn Buffer>>;

    /// Creates a user event in the submitted state; its status is set
    /// explicitly via [`Event::set_status`].
    fn create_user_event(&self) -> Result<Arc<dyn Event>>;

    fn create_program(&self, source: &str) -> Result<Arc<dyn Program>>;
}

pub trait Queue: Send + Sync {
    /// Maps `size` bytes of `buffer` at `offset` into host memory. The
    /// returned pointer is valid once the returned event completes.
    fn enqueue_map_buffer(
        &self,
        buffer: &Arc<dyn Buffer>,
        map_flags: cl_map_flags,
        offset: usize,
        size: usize,
        wait_list: &[Arc<dyn Event>],
    ) -> Result<(SendPtr, Arc<dyn Event>)>;

    fn enqueue_unmap_buffer(
        &self,
        buffer: &Arc<dyn Buffer>,
        ptr: SendPtr,
        wait_list: &[Arc<dyn Event>],
    ) -> Result<Arc<dyn Event>>;

    fn enqueue_copy_buffer(
        &self,
        src: &Arc<dyn Buffer>,
        dst: &Arc<dyn Buffer>,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        wait_list: &[Arc<dyn Event>],
    ) -> Result<Arc<dyn Event>>;

    fn enqueue_ndrange_kernel(
        &self,
        kernel: &Arc<dyn Kernel>,
        offset: &[usize],
        global: &[usize],
        local: &[usize],
        wait_list: &[Arc<dyn Event>],
    ) -> Result<Arc<dyn Event>>;

    fn enqueue_marker(&self, wait_list: &[Arc<dyn Event>]) -> Result<Arc<dyn Event>>;

    fn enqueue_barrier(&self, wait_list: &[Arc<dyn Event>]) -> Result<Arc<dyn Event>>;

    fn flush(&self) -> Result<()>;

    /// Blocks until every command enqueued so far has completed.
    fn finish(&self) -> Result<()>;
}

pub trait Buffer: Send + Sync {
    fn size(&self) -> usize;
    fn flags(&self) -> cl_mem_flags;

    /// Recovers the concrete driver type behind the trait object.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub trait Event: Send + Sync {
    fn status(&self) -> cl_int;

    /// Registers `callback` to fire once when the event reaches
    /// `trigger_status` or a lower (more terminal) status. Fires
    /// synchronously if the event is already there.
    fn set_callback(&self, trigger_status: cl_int, callback: EventCallback);

    /// Blocks until the event is terminal; returns the final status.
    fn wait(&self) -> cl_int;

    /// Sets the status of a user event. Errors on non-user events and on
    /// user events that are already terminal.
    fn set_status(&self, status: cl_int) -> Result<()>;

    /// Profiling timestamp in nanoseconds.
    fn profiling_info(&self, name: cl_profiling_info) -> Result<cl_ulong>;

    /// Recovers the concrete driver type behind the trait object.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub trait Program: Send + Sync {
    fn build(&self, options: &str) -> Result<()>;
    fn create_kernel(&self, name: &str) -> Result<Arc<dyn Kernel>>;
}

pub trait Kernel: Send + Sync {
    fn set_arg_buffer(&self, index: u32, buffer: &Arc<dyn Buffer>) -> Result<()>;
    fn set_arg_bytes(&self, index: u32, bytes: &[u8]) -> Result<()>;

    /// Recovers the concrete driver type behind the trait object.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Selects the platform the daemon serves: a named real platform through
/// cl3 when the crate is built with driver support, the built-in software
/// platform otherwise (or when `name` says so).
pub fn select_platform(name: Option<&str>) -> Result<Arc<dyn Platform>> {
    #[cfg(any(feature = "dynamic", feature = "static"))]
    {
        if name != Some(software::PLATFORM_NAME) {
            return opencl::OpenClPlatform::select(name);
        }
    }
    let _ = name;
    Ok(Arc::new(software::SoftwarePlatform::new()))
}

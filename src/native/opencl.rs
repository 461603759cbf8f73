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

//! The cl3-backed native driver: adapts a real OpenCL platform on the
//! daemon's machine to the driver contract. Requires OpenCL 1.1 or later.
//!
//! Native callbacks arrive on driver-owned threads; the registered closure
//! travels through the `void*` user data as an owned box and is dropped
//! exactly once, on the success and on the error path alike.

use super::{Buffer, Context, Event, EventCallback, Kernel, Platform, Program, Queue};
use crate::error::{Error, Result};
use crate::protocol::DeviceDescription;
use crate::transport::SendPtr;
use crate::types::{
    cl_command_queue_properties, cl_int, cl_map_flags, cl_mem_flags, cl_profiling_info, cl_ulong,
    CL_INVALID_DEVICE, CL_INVALID_PLATFORM, CL_INVALID_VALUE, CL_MEM_COPY_HOST_PTR,
};
use cl3::types::{
    cl_command_queue, cl_context, cl_device_id, cl_event, cl_kernel, cl_mem, cl_platform_id,
    cl_program, CL_NON_BLOCKING,
};
use libc::c_void;
use log::warn;
use std::any::Any;
use std::ffi::CString;
use std::ptr;
use std::sync::Arc;

/// Extracts "major.minor" from an OpenCL version string of the form
/// `OpenCL <major>.<minor> <vendor specific>`.
fn parse_version(version: &str) -> Option<(u32, u32)> {
    let number = version.strip_prefix("OpenCL ")?.split_whitespace().next()?;
    let (major, minor) = number.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

pub struct OpenClPlatform {
    platform: cl_platform_id,
    devices: Vec<cl_device_id>,
    name: String,
    version: String,
}

unsafe impl Send for OpenClPlatform {}
unsafe impl Sync for OpenClPlatform {}

impl OpenClPlatform {
    /// Selects a native platform: by name substring when one is given,
    /// otherwise the first platform supporting OpenCL 1.1 or later.
    pub fn select(name: Option<&str>) -> Result<Arc<dyn Platform>> {
        let platforms = cl3::platform::get_platform_ids()?;
        for platform in platforms {
            let platform_name = cl3::platform::get_platform_info(
                platform,
                cl3::platform::PlatformInfo::CL_PLATFORM_NAME,
            )?
            .to_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
            let version = cl3::platform::get_platform_info(
                platform,
                cl3::platform::PlatformInfo::CL_PLATFORM_VERSION,
            )?
            .to_str()
            .map(|version| version.to_string_lossy().into_owned())
            .unwrap_or_default();
            let supported = matches!(parse_version(&version),
                Some((major, minor)) if major > 1 || (major == 1 && minor >= 1));
            let selected = match name {
                Some(name) => platform_name.contains(name),
                None => supported,
            };
            if !selected {
                continue;
            }
            if !supported {
                warn!("platform '{platform_name}' ({version}) does not support OpenCL 1.1");
                break;
            }
            let devices =
                cl3::device::get_device_ids(platform, cl3::device::CL_DEVICE_TYPE_ALL)?;
            return Ok(Arc::new(Self { platform, devices, name: platform_name, version }));
        }
        Err(Error::Cl(CL_INVALID_PLATFORM))
    }
}

impl Platform for OpenClPlatform {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_description(&self, index: usize) -> Result<DeviceDescription> {
        let device = *self.devices.get(index).ok_or(Error::Cl(CL_INVALID_DEVICE))?;
        let info = |name| cl3::device::get_device_info(device, name);
        let info_string = |name| -> Result<String> {
            Ok(info(name)?
                .to_str()
                .map(|value| value.to_string_lossy().into_owned())
                .unwrap_or_default())
        };
        Ok(DeviceDescription {
            index: index as u32,
            name: info_string(cl3::device::DeviceInfo::CL_DEVICE_NAME)?,
            vendor: info_string(cl3::device::DeviceInfo::CL_DEVICE_VENDOR)?,
            version: info_string(cl3::device::DeviceInfo::CL_DEVICE_VERSION)?,
            device_type: info(cl3::device::DeviceInfo::CL_DEVICE_TYPE)?.to_ulong(),
            max_compute_units: info(cl3::device::DeviceInfo::CL_DEVICE_MAX_COMPUTE_UNITS)?
                .to_uint(),
            max_work_group_size: info(cl3::device::DeviceInfo::CL_DEVICE_MAX_WORK_GROUP_SIZE)?
                .to_size() as u64,
            global_mem_size: info(cl3::device::DeviceInfo::CL_DEVICE_GLOBAL_MEM_SIZE)?
                .to_ulong(),
        })
    }

    fn create_context(&self, device_indices: &[usize]) -> Result<Arc<dyn Context>> {
        let mut devices = Vec::with_capacity(device_indices.len());
        for index in device_indices {
            devices.push(*self.devices.get(*index).ok_or(Error::Cl(CL_INVALID_DEVICE))?);
        }
        let context =
            cl3::context::create_context(&devices, ptr::null(), None, ptr::null_mut())?;
        Ok(Arc::new(OpenClContext { context, devices }))
    }
}

pub struct OpenClContext {
    context: cl_context,
    devices: Vec<cl_device_id>,
}

unsafe impl Send for OpenClContext {}
unsafe impl Sync for OpenClContext {}

impl Drop for OpenClContext {
    fn drop(&mut self) {
        if let Err(code) = cl3::context::release_context(self.context) {
            warn!("releasing native context failed ({code})");
        }
    }
}

impl Context for OpenClContext {
    fn create_queue(
        &self,
        device_index: usize,
        properties: cl_command_queue_properties,
    ) -> Result<Arc<dyn Queue>> {
        let device = *self.devices.get(device_index).ok_or(Error::Cl(CL_INVALID_DEVICE))?;
        #[allow(deprecated)]
        let queue = cl3::command_queue::create_command_queue(self.context, device, properties)?;
        Ok(Arc::new(OpenClQueue { queue }))
    }

    fn create_buffer(
        &self,
        flags: cl_mem_flags,
        size: usize,
        init: Option<&[u8]>,
    ) -> Result<Arc<dyn Buffer>> {
        let mem = match init {
            Some(init) => cl3::memory::create_buffer(
                self.context,
                flags | CL_MEM_COPY_HOST_PTR,
                size,
                init.as_ptr() as *mut c_void,
            )?,
            None => cl3::memory::create_buffer(self.context, flags, size, ptr::null_mut())?,
        };
        Ok(Arc::new(OpenClBuffer { mem, size, flags }))
    }

    fn create_user_event(&self) -> Result<Arc<dyn Event>> {
        let event = cl3::event::create_user_event(self.context)?;
        Ok(Arc::new(OpenClEvent { event, user: true }))
    }

    fn create_program(&self, source: &str) -> Result<Arc<dyn Program>> {
        let source = CString::new(source).map_err(|_| Error::Cl(CL_INVALID_VALUE))?;
        let char_ptrs: [*const _; 1] = [source.as_ptr()];
        let program = cl3::program::create_program_with_source(
            self.context,
            1,
            char_ptrs.as_ptr(),
            ptr::null(),
        )?;
        Ok(Arc::new(OpenClProgram { program, devices: self.devices.clone() }))
    }
}

pub struct OpenClQueue {
    queue: cl_command_queue,
}

unsafe impl Send for OpenClQueue {}
unsafe impl Sync for OpenClQueue {}

impl Drop for OpenClQueue {
    fn drop(&mut self) {
        if let Err(code) = cl3::command_queue::release_command_queue(self.queue) {
            warn!("releasing native command queue failed ({code})");
        }
    }
}

fn native_wait_list(wait_list: &[Arc<dyn Event>]) -> Result<Vec<cl_event>> {
    let mut events = Vec::with_capacity(wait_list.len());
    for event in wait_list {
        let event = event
            .clone()
            .into_any()
            .downcast::<OpenClEvent>()
            .map_err(|_| Error::Cl(CL_INVALID_VALUE))?;
        events.push(event.event);
    }
    Ok(events)
}

impl Queue for OpenClQueue {
    fn enqueue_map_buffer(
        &self,
        buffer: &Arc<dyn Buffer>,
        map_flags: cl_map_flags,
        offset: usize,
        size: usize,
        wait_list: &[Arc<dyn Event>],
    ) -> Result<(SendPtr, Arc<dyn Event>)> {
        let buffer = opencl_buffer(buffer)?;
        let wait_list = native_wait_list(wait_list)?;
        let mut buffer_ptr: cl_mem = ptr::null_mut();
        let event = cl3::command_queue::enqueue_map_buffer(
            self.queue,
            buffer.mem,
            CL_NON_BLOCKING,
            map_flags,
            offset,
            size,
            &mut buffer_ptr,
            wait_list.len() as u32,
            if wait_list.is_empty() { ptr::null() } else { wait_list.as_ptr() },
        )?;
        let event: Arc<dyn Event> = Arc::new(OpenClEvent { event, user: false });
        Ok((SendPtr(buffer_ptr as *mut u8), event))
    }

    fn enqueue_unmap_buffer(
        &self,
        buffer: &Arc<dyn Buffer>,
        ptr: SendPtr,
        wait_list: &[Arc<dyn Event>],
    ) -> Result<Arc<dyn Event>> {
        let buffer = opencl_buffer(buffer)?;
        let wait_list = native_wait_list(wait_list)?;
        let event = cl3::command_queue::enqueue_unmap_mem_object(
            self.queue,
            buffer.mem,
            ptr.0 as *mut c_void,
            wait_list.len() as u32,
            if wait_list.is_empty() { ptr::null() } else { wait_list.as_ptr() },
        )?;
        Ok(Arc::new(OpenClEvent { event, user: false }))
    }

    fn enqueue_copy_buffer(
        &self,
        src: &Arc<dyn Buffer>,
        dst: &Arc<dyn Buffer>,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        wait_list: &[Arc<dyn Event>],
    ) -> Result<Arc<dyn Event>> {
        let src = opencl_buffer(src)?;
        let dst = opencl_buffer(dst)?;
        let wait_list = native_wait_list(wait_list)?;
        let event = cl3::command_queue::enqueue_copy_buffer(
            self.queue,
            src.mem,
            dst.mem,
            src_offset,
            dst_offset,
            size,
            wait_list.len() as u32,
            if wait_list.is_empty() { ptr::null() } else { wait_list.as_ptr() },
        )?;
        Ok(Arc::new(OpenClEvent { event, user: false }))
    }

    fn enqueue_ndrange_kernel(
        &self,
        kernel: &Arc<dyn Kernel>,
        offset: &[usize],
        global: &[usize],
        local: &[usize],
        wait_list: &[Arc<dyn Event>],
    ) -> Result<Arc<dyn Event>> {
        let kernel = kernel
            .clone()
            .into_any()
            .downcast::<OpenClKernel>()
            .map_err(|_| Error::Cl(CL_INVALID_VALUE))?;
        let wait_list = native_wait_list(wait_list)?;
        let event = cl3::command_queue::enqueue_nd_range_kernel(
            self.queue,
            kernel.kernel,
            global.len() as u32,
            if offset.is_empty() { ptr::null() } else { offset.as_ptr() },
            global.as_ptr(),
            if local.is_empty() { ptr::null() } else { local.as_ptr() },
            wait_list.len() as u32,
            if wait_list.is_empty() { ptr::null() } else { wait_list.as_ptr() },
        )?;
        Ok(Arc::new(OpenClEvent { event, user: false }))
    }

    fn enqueue_marker(&self, wait_list: &[Arc<dyn Event>]) -> Result<Arc<dyn Event>> {
        let wait_list = native_wait_list(wait_list)?;
        let event = cl3::command_queue::enqueue_marker_with_wait_list(
            self.queue,
            wait_list.len() as u32,
            if wait_list.is_empty() { ptr::null() } else { wait_list.as_ptr() },
        )?;
        Ok(Arc::new(OpenClEvent { event, user: false }))
    }

    fn enqueue_barrier(&self, wait_list: &[Arc<dyn Event>]) -> Result<Arc<dyn Event>> {
        let wait_list = native_wait_list(wait_list)?;
        let event = cl3::command_queue::enqueue_barrier_with_wait_list(
            self.queue,
            wait_list.len() as u32,
            if wait_list.is_empty() { ptr::null() } else { wait_list.as_ptr() },
        )?;
        Ok(Arc::new(OpenClEvent { event, user: false }))
    }

    fn flush(&self) -> Result<()> {
        Ok(cl3::command_queue::flush(self.queue)?)
    }

    fn finish(&self) -> Result<()> {
        Ok(cl3::command_queue::finish(self.queue)?)
    }
}

pub struct OpenClBuffer {
    mem: cl_mem,
    size: usize,
    flags: cl_mem_flags,
}

unsafe impl Send for OpenClBuffer {}
unsafe impl Sync for OpenClBuffer {}

impl Drop for OpenClBuffer {
    fn drop(&mut self) {
        if let Err(code) = cl3::memory::release_mem_object(self.mem) {
            warn!("releasing native buffer failed ({code})");
        }
    }
}

impl Buffer for OpenClBuffer {
    fn size(&self) -> usize {
        self.size
    }

    fn flags(&self) -> cl_mem_flags {
        self.flags
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn opencl_buffer(buffer: &Arc<dyn Buffer>) -> Result<Arc<OpenClBuffer>> {
    buffer
        .clone()
        .into_any()
        .downcast::<OpenClBuffer>()
        .map_err(|_| Error::Cl(CL_INVALID_VALUE))
}

pub struct OpenClEvent {
    event: cl_event,
    user: bool,
}

unsafe impl Send for OpenClEvent {}
unsafe impl Sync for OpenClEvent {}

impl Drop for OpenClEvent {
    fn drop(&mut self) {
        if let Err(code) = cl3::event::release_event(self.event) {
            warn!("releasing native event failed ({code})");
        }
    }
}

struct CallbackBox(EventCallback);

extern "C" fn event_callback_trampoline(_event: cl_event, status: cl_int, user_data: *mut c_void) {
    // take back ownership; the box is dropped exactly once
    let callback = unsafe { Box::from_raw(user_data as *mut CallbackBox) };
    (callback.0)(status);
}

impl Event for OpenClEvent {
    fn status(&self) -> cl_int {
        cl3::event::get_event_info(
            self.event,
            cl3::event::EventInfo::CL_EVENT_COMMAND_EXECUTION_STATUS,
        )
        .map(|info| info.to_int())
        .unwrap_or(CL_INVALID_VALUE)
    }

    fn set_callback(&self, trigger_status: cl_int, callback: EventCallback) {
        let user_data = Box::into_raw(Box::new(CallbackBox(callback)));
        if let Err(code) = cl3::event::set_event_callback(
            self.event,
            trigger_status,
            event_callback_trampoline,
            user_data as *mut c_void,
        ) {
            // reclaim the box and fail the callback
            let callback = unsafe { Box::from_raw(user_data) };
            (callback.0)(code);
        }
    }

    fn wait(&self) -> cl_int {
        if let Err(code) = cl3::event::wait_for_events(&[self.event]) {
            return code;
        }
        self.status()
    }

    fn set_status(&self, status: cl_int) -> Result<()> {
        if !self.user {
            return Err(Error::Cl(crate::types::CL_INVALID_EVENT));
        }
        Ok(cl3::event::set_user_event_status(self.event, status)?)
    }

    fn profiling_info(&self, name: cl_profiling_info) -> Result<cl_ulong> {
        let name = match name {
            crate::types::CL_PROFILING_COMMAND_QUEUED => {
                cl3::event::ProfilingInfo::CL_PROFILING_COMMAND_QUEUED
            }
            crate::types::CL_PROFILING_COMMAND_SUBMIT => {
                cl3::event::ProfilingInfo::CL_PROFILING_COMMAND_SUBMIT
            }
            crate::types::CL_PROFILING_COMMAND_START => {
                cl3::event::ProfilingInfo::CL_PROFILING_COMMAND_START
            }
            crate::types::CL_PROFILING_COMMAND_END => {
                cl3::event::ProfilingInfo::CL_PROFILING_COMMAND_END
            }
            _ => return Err(Error::Cl(CL_INVALID_VALUE)),
        };
        Ok(cl3::event::get_event_profiling_info(self.event, name)?.to_ulong())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct OpenClProgram {
    program: cl_program,
    devices: Vec<cl_device_id>,
}

unsafe impl Send for OpenClProgram {}
unsafe impl Sync for OpenClProgram {}

impl Drop for OpenClProgram {
    fn drop(&mut self) {
        if let Err(code) = cl3::program::release_program(self.program) {
            warn!("releasing native program failed ({code})");
        }
    }
}

impl Program for OpenClProgram {
    fn build(&self, options: &str) -> Result<()> {
        let options = CString::new(options).map_err(|_| Error::Cl(CL_INVALID_VALUE))?;
        Ok(cl3::program::build_program(
            self.program,
            &self.devices,
            &options,
            None,
            ptr::null_mut(),
        )?)
    }

    fn create_kernel(&self, name: &str) -> Result<Arc<dyn Kernel>> {
        let name = CString::new(name).map_err(|_| Error::Cl(CL_INVALID_VALUE))?;
        let kernel = cl3::kernel::create_kernel(self.program, &name)?;
        Ok(Arc::new(OpenClKernel { kernel }))
    }
}

pub struct OpenClKernel {
    kernel: cl_kernel,
}

unsafe impl Send for OpenClKernel {}
unsafe impl Sync for OpenClKernel {}

impl Drop for OpenClKernel {
    fn drop(&mut self) {
        if let Err(code) = cl3::kernel::release_kernel(self.kernel) {
            warn!("releasing native kernel failed ({code})");
        }
    }
}

impl Kernel for OpenClKernel {
    fn set_arg_buffer(&self, index: u32, buffer: &Arc<dyn Buffer>) -> Result<()> {
        let buffer = opencl_buffer(buffer)?;
        Ok(cl3::kernel::set_kernel_arg(
            self.kernel,
            index,
            std::mem::size_of::<cl_mem>(),
            &buffer.mem as *const cl_mem as *const c_void,
        )?)
    }

    fn set_arg_bytes(&self, index: u32, bytes: &[u8]) -> Result<()> {
        Ok(cl3::kernel::set_kernel_arg(
            self.kernel,
            index,
            bytes.len(),
            bytes.as_ptr() as *const c_void,
        )?)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

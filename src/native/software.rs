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

//! The built-in software platform.
//!
//! A self-contained OpenCL-shaped driver executing on the host CPU: one
//! device, in-order queues backed by a worker thread each, user events, and
//! profiling timestamps from a process-wide monotonic clock. Buffers live
//! in ordinary host memory, so mapping is free.
//!
//! Kernels are resolved against a table of built-in kernels by name; the
//! platform does not compile OpenCL C. Program objects accept and scan
//! source only to validate kernel names.

use super::{Buffer, Context, Event, EventCallback, Kernel, Platform, Program, Queue};
use crate::error::{Error, Result};
use crate::protocol::DeviceDescription;
use crate::transport::SendPtr;
use crate::types::{
    cl_command_queue_properties, cl_int, cl_map_flags, cl_mem_flags, cl_profiling_info, cl_ulong,
    is_terminal, CL_COMPLETE,
    CL_DEVICE_TYPE_CPU, CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST, CL_INVALID_ARG_INDEX,
    CL_INVALID_DEVICE, CL_INVALID_EVENT, CL_INVALID_KERNEL, CL_INVALID_KERNEL_ARGS,
    CL_INVALID_KERNEL_NAME, CL_INVALID_OPERATION, CL_INVALID_VALUE, CL_INVALID_WORK_DIMENSION,
    CL_PROFILING_COMMAND_END, CL_PROFILING_COMMAND_QUEUED, CL_PROFILING_COMMAND_START,
    CL_PROFILING_COMMAND_SUBMIT, CL_PROFILING_INFO_NOT_AVAILABLE, CL_RUNNING, CL_SUBMITTED,
    CL_QUEUED,
};
use crate::util::clock_ns;
use log::trace;
use std::any::Any;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub const PLATFORM_NAME: &str = "software";

/* ***************************************************************************
 * Events
 ****************************************************************************/

#[derive(Default)]
struct Timestamps {
    queued: cl_ulong,
    submit: cl_ulong,
    start: cl_ulong,
    end: cl_ulong,
}

struct EventState {
    status: cl_int,
    callbacks: Vec<(cl_int, EventCallback)>,
    timestamps: Timestamps,
}

pub struct SoftwareEvent {
    user: bool,
    state: Mutex<EventState>,
    changed: Condvar,
}

impl SoftwareEvent {
    fn queued() -> Arc<Self> {
        Arc::new(Self {
            user: false,
            state: Mutex::new(EventState {
                status: CL_QUEUED,
                callbacks: Vec::new(),
                timestamps: Timestamps { queued: clock_ns(), ..Timestamps::default() },
            }),
            changed: Condvar::new(),
        })
    }

    fn user() -> Arc<Self> {
        Arc::new(Self {
            user: true,
            state: Mutex::new(EventState {
                status: CL_SUBMITTED,
                callbacks: Vec::new(),
                timestamps: Timestamps::default(),
            }),
            changed: Condvar::new(),
        })
    }

    /// Moves the event to `status` if that is a forward transition,
    /// timestamps the step and fires due callbacks. Older or equal statuses
    /// are ignored.
    fn transition(&self, status: cl_int) {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if status >= state.status {
                return;
            }
            let now = clock_ns();
            match status {
                CL_SUBMITTED => state.timestamps.submit = now,
                CL_RUNNING => state.timestamps.start = now,
                _ => {
                    // terminal; backfill skipped steps for profiling
                    if state.timestamps.submit == 0 {
                        state.timestamps.submit = now;
                    }
                    if state.timestamps.start == 0 {
                        state.timestamps.start = now;
                    }
                    state.timestamps.end = now;
                }
            }
            state.status = status;
            let mut fired = Vec::new();
            let mut index = 0;
            while index < state.callbacks.len() {
                if state.callbacks[index].0 >= status {
                    fired.push(state.callbacks.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            fired
        };
        for (_, callback) in callbacks {
            callback(status);
        }
        self.changed.notify_all();
    }
}

impl Event for SoftwareEvent {
    fn status(&self) -> cl_int {
        self.state.lock().unwrap().status
    }

    fn set_callback(&self, trigger_status: cl_int, callback: EventCallback) {
        let status = {
            let mut state = self.state.lock().unwrap();
            if state.status > trigger_status {
                state.callbacks.push((trigger_status, callback));
                return;
            }
            state.status
        };
        callback(status);
    }

    fn wait(&self) -> cl_int {
        let mut state = self.state.lock().unwrap();
        while !is_terminal(state.status) {
            state = self.changed.wait(state).unwrap();
        }
        state.status
    }

    fn set_status(&self, status: cl_int) -> Result<()> {
        if !self.user {
            return Err(Error::Cl(CL_INVALID_EVENT));
        }
        if status > CL_COMPLETE {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }
        if is_terminal(self.status()) {
            return Err(Error::Cl(CL_INVALID_OPERATION));
        }
        self.transition(status);
        Ok(())
    }

    fn profiling_info(&self, name: cl_profiling_info) -> Result<cl_ulong> {
        if self.user {
            return Err(Error::Cl(CL_PROFILING_INFO_NOT_AVAILABLE));
        }
        let state = self.state.lock().unwrap();
        let value = match name {
            CL_PROFILING_COMMAND_QUEUED => state.timestamps.queued,
            CL_PROFILING_COMMAND_SUBMIT => state.timestamps.submit,
            CL_PROFILING_COMMAND_START => state.timestamps.start,
            CL_PROFILING_COMMAND_END => state.timestamps.end,
            _ => return Err(Error::Cl(CL_INVALID_VALUE)),
        };
        if value == 0 {
            return Err(Error::Cl(CL_PROFILING_INFO_NOT_AVAILABLE));
        }
        Ok(value)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/* ***************************************************************************
 * Buffers
 ****************************************************************************/

/// A stable heap allocation addressed by raw pointer. Access ordering is
/// provided by the in-order queues and event waits of the callers.
struct Storage {
    slice: *mut [u8],
}

unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn new(size: usize) -> Self {
        Self { slice: Box::into_raw(vec![0u8; size].into_boxed_slice()) }
    }

    fn ptr(&self) -> *mut u8 {
        self.slice as *mut u8
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.slice)) };
    }
}

pub struct SoftwareBuffer {
    size: usize,
    flags: cl_mem_flags,
    storage: Storage,
}

impl SoftwareBuffer {
    fn check_range(&self, offset: usize, size: usize) -> Result<()> {
        if offset.checked_add(size).map_or(true, |end| end > self.size) {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }
        Ok(())
    }

    fn ptr_at(&self, offset: usize) -> *mut u8 {
        unsafe { self.storage.ptr().add(offset) }
    }
}

impl Buffer for SoftwareBuffer {
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

fn software_buffer(buffer: &Arc<dyn Buffer>) -> Result<Arc<SoftwareBuffer>> {
    buffer
        .clone()
        .into_any()
        .downcast::<SoftwareBuffer>()
        .map_err(|_| Error::Cl(CL_INVALID_VALUE))
}

/* ***************************************************************************
 * Kernels
 ****************************************************************************/

enum KernelArgValue {
    Buffer(Arc<SoftwareBuffer>),
    Bytes(Vec<u8>),
}

pub struct SoftwareKernel {
    name: String,
    args: Mutex<HashMap<u32, KernelArgValue>>,
}

impl SoftwareKernel {
    fn arg_buffer(&self, index: u32) -> Result<Arc<SoftwareBuffer>> {
        match self.args.lock().unwrap().get(&index) {
            Some(KernelArgValue::Buffer(buffer)) => Ok(buffer.clone()),
            _ => Err(Error::Cl(CL_INVALID_KERNEL_ARGS)),
        }
    }

    fn arg_i32(&self, index: u32) -> Result<i32> {
        match self.args.lock().unwrap().get(&index) {
            Some(KernelArgValue::Bytes(bytes)) if bytes.len() == 4 => {
                Ok(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            _ => Err(Error::Cl(CL_INVALID_KERNEL_ARGS)),
        }
    }

    /// Executes one of the built-in kernels over `global[0]` work items.
    fn execute(&self, offset: &[usize], global: &[usize]) -> Result<()> {
        if global.is_empty() || global.len() > 3 {
            return Err(Error::Cl(CL_INVALID_WORK_DIMENSION));
        }
        let base = offset.first().copied().unwrap_or(0);
        let items = global[0];
        match self.name.as_str() {
            // v[gid] = gid
            "iota" => {
                let v = self.arg_buffer(0)?;
                v.check_range(base * 4, items * 4)?;
                for i in 0..items {
                    let gid = (base + i) as i32;
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            gid.to_ne_bytes().as_ptr(),
                            v.ptr_at((base + i) * 4),
                            4,
                        );
                    }
                }
                Ok(())
            }
            // c[gid] = a[gid] + b[gid]
            "vec_add" => {
                let a = self.arg_buffer(0)?;
                let b = self.arg_buffer(1)?;
                let c = self.arg_buffer(2)?;
                a.check_range(base * 4, items * 4)?;
                b.check_range(base * 4, items * 4)?;
                c.check_range(base * 4, items * 4)?;
                for i in 0..items {
                    let at = (base + i) * 4;
                    unsafe {
                        let lhs = std::ptr::read_unaligned(a.ptr_at(at) as *const i32);
                        let rhs = std::ptr::read_unaligned(b.ptr_at(at) as *const i32);
                        std::ptr::write_unaligned(c.ptr_at(at) as *mut i32, lhs.wrapping_add(rhs));
                    }
                }
                Ok(())
            }
            // v[gid] = value
            "fill_int" => {
                let v = self.arg_buffer(0)?;
                let value = self.arg_i32(1)?;
                v.check_range(base * 4, items * 4)?;
                for i in 0..items {
                    unsafe {
                        std::ptr::write_unaligned(v.ptr_at((base + i) * 4) as *mut i32, value);
                    }
                }
                Ok(())
            }
            _ => Err(Error::Cl(CL_INVALID_KERNEL)),
        }
    }
}

impl Kernel for SoftwareKernel {
    fn set_arg_buffer(&self, index: u32, buffer: &Arc<dyn Buffer>) -> Result<()> {
        let buffer = software_buffer(buffer)?;
        self.args.lock().unwrap().insert(index, KernelArgValue::Buffer(buffer));
        Ok(())
    }

    fn set_arg_bytes(&self, index: u32, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::Cl(CL_INVALID_ARG_INDEX));
        }
        self.args.lock().unwrap().insert(index, KernelArgValue::Bytes(bytes.to_vec()));
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct SoftwareProgram {
    kernel_names: Vec<String>,
}

/// Extracts the kernel names declared in OpenCL C source. Only the
/// signature heads are inspected.
fn parse_kernel_names(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = source;
    while let Some(at) = rest.find("__kernel") {
        rest = &rest[at + "__kernel".len()..];
        let head = rest.trim_start();
        if let Some(tail) = head.strip_prefix("void") {
            let tail = tail.trim_start();
            let name: String = tail
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                names.push(name);
            }
        }
    }
    names
}

impl Program for SoftwareProgram {
    fn build(&self, _options: &str) -> Result<()> {
        Ok(())
    }

    fn create_kernel(&self, name: &str) -> Result<Arc<dyn Kernel>> {
        if !self.kernel_names.iter().any(|n| n == name) {
            return Err(Error::Cl(CL_INVALID_KERNEL_NAME));
        }
        Ok(Arc::new(SoftwareKernel { name: name.to_string(), args: Mutex::new(HashMap::new()) }))
    }
}

/* ***************************************************************************
 * Queues
 ****************************************************************************/

enum Op {
    Map,
    Unmap,
    Copy {
        src: Arc<SoftwareBuffer>,
        dst: Arc<SoftwareBuffer>,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    },
    Kernel {
        kernel: Arc<SoftwareKernel>,
        offset: Vec<usize>,
        global: Vec<usize>,
    },
    Marker,
}

impl Op {
    fn execute(&self) -> Result<()> {
        match self {
            Self::Map | Self::Unmap | Self::Marker => Ok(()),
            Self::Copy { src, dst, src_offset, dst_offset, size } => {
                src.check_range(*src_offset, *size)?;
                dst.check_range(*dst_offset, *size)?;
                unsafe {
                    std::ptr::copy(src.ptr_at(*src_offset), dst.ptr_at(*dst_offset), *size);
                }
                Ok(())
            }
            Self::Kernel { kernel, offset, global } => kernel.execute(offset, global),
        }
    }
}

struct Task {
    wait_list: Vec<Arc<dyn Event>>,
    event: Arc<SoftwareEvent>,
    op: Op,
}

pub struct SoftwareQueue {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SoftwareQueue {
    fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let worker = thread::Builder::new()
            .name("software queue".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    let failed = task
                        .wait_list
                        .iter()
                        .map(|dep| dep.wait())
                        .any(|status| status < 0);
                    if failed {
                        task.event.transition(CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);
                        continue;
                    }
                    task.event.transition(CL_SUBMITTED);
                    task.event.transition(CL_RUNNING);
                    match task.op.execute() {
                        Ok(()) => task.event.transition(CL_COMPLETE),
                        Err(err) => task.event.transition(err.code()),
                    }
                }
            })
            .expect("failed to spawn queue worker");
        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn submit(
        &self,
        op: Op,
        wait_list: &[Arc<dyn Event>],
    ) -> Result<Arc<SoftwareEvent>> {
        let event = SoftwareEvent::queued();
        let task = Task { wait_list: wait_list.to_vec(), event: event.clone(), op };
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(sender) => sender
                .send(task)
                .map_err(|_| Error::Cl(CL_INVALID_OPERATION))?,
            None => return Err(Error::Cl(CL_INVALID_OPERATION)),
        }
        Ok(event)
    }
}

impl Drop for SoftwareQueue {
    fn drop(&mut self) {
        self.sender.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Queue for SoftwareQueue {
    fn enqueue_map_buffer(
        &self,
        buffer: &Arc<dyn Buffer>,
        _map_flags: cl_map_flags,
        offset: usize,
        size: usize,
        wait_list: &[Arc<dyn Event>],
    ) -> Result<(SendPtr, Arc<dyn Event>)> {
        let buffer = software_buffer(buffer)?;
        buffer.check_range(offset, size)?;
        let ptr = SendPtr(buffer.ptr_at(offset));
        let event: Arc<dyn Event> = self.submit(Op::Map, wait_list)?;
        trace!("mapped {size} bytes at offset {offset}");
        Ok((ptr, event))
    }

    fn enqueue_unmap_buffer(
        &self,
        buffer: &Arc<dyn Buffer>,
        _ptr: SendPtr,
        wait_list: &[Arc<dyn Event>],
    ) -> Result<Arc<dyn Event>> {
        software_buffer(buffer)?;
        Ok(self.submit(Op::Unmap, wait_list)?)
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
        let op = Op::Copy {
            src: software_buffer(src)?,
            dst: software_buffer(dst)?,
            src_offset,
            dst_offset,
            size,
        };
        Ok(self.submit(op, wait_list)?)
    }

    fn enqueue_ndrange_kernel(
        &self,
        kernel: &Arc<dyn Kernel>,
        offset: &[usize],
        global: &[usize],
        _local: &[usize],
        wait_list: &[Arc<dyn Event>],
    ) -> Result<Arc<dyn Event>> {
        let kernel = kernel
            .clone()
            .into_any()
            .downcast::<SoftwareKernel>()
            .map_err(|_| Error::Cl(CL_INVALID_KERNEL))?;
        let op = Op::Kernel { kernel, offset: offset.to_vec(), global: global.to_vec() };
        Ok(self.submit(op, wait_list)?)
    }

    fn enqueue_marker(&self, wait_list: &[Arc<dyn Event>]) -> Result<Arc<dyn Event>> {
        Ok(self.submit(Op::Marker, wait_list)?)
    }

    fn enqueue_barrier(&self, wait_list: &[Arc<dyn Event>]) -> Result<Arc<dyn Event>> {
        // the queue is in-order; a marker over the wait list is a barrier
        Ok(self.submit(Op::Marker, wait_list)?)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        let marker = self.submit(Op::Marker, &[])?;
        marker.wait();
        Ok(())
    }
}

/* ***************************************************************************
 * Context & platform
 ****************************************************************************/

pub struct SoftwareContext {
    device_count: usize,
}

impl Context for SoftwareContext {
    // in-order execution and always-recorded timestamps satisfy any
    // requested property set
    fn create_queue(
        &self,
        device_index: usize,
        _properties: cl_command_queue_properties,
    ) -> Result<Arc<dyn Queue>> {
        if device_index >= self.device_count {
            return Err(Error::Cl(CL_INVALID_DEVICE));
        }
        Ok(SoftwareQueue::new())
    }

    fn create_buffer(
        &self,
        flags: cl_mem_flags,
        size: usize,
        init: Option<&[u8]>,
    ) -> Result<Arc<dyn Buffer>> {
        let buffer = SoftwareBuffer { size, flags, storage: Storage::new(size) };
        if let Some(init) = init {
            if init.len() != size {
                return Err(Error::Cl(CL_INVALID_VALUE));
            }
            unsafe {
                std::ptr::copy_nonoverlapping(init.as_ptr(), buffer.storage.ptr(), size);
            }
        }
        Ok(Arc::new(buffer))
    }

    fn create_user_event(&self) -> Result<Arc<dyn Event>> {
        Ok(SoftwareEvent::user())
    }

    fn create_program(&self, source: &str) -> Result<Arc<dyn Program>> {
        Ok(Arc::new(SoftwareProgram { kernel_names: parse_kernel_names(source) }))
    }
}

#[derive(Default)]
pub struct SoftwarePlatform;

impl SoftwarePlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Platform for SoftwarePlatform {
    fn name(&self) -> String {
        PLATFORM_NAME.to_string()
    }

    fn version(&self) -> String {
        "OpenCL 1.2".to_string()
    }

    fn device_count(&self) -> usize {
        1
    }

    fn device_description(&self, index: usize) -> Result<DeviceDescription> {
        if index != 0 {
            return Err(Error::Cl(CL_INVALID_DEVICE));
        }
        Ok(DeviceDescription {
            index: 0,
            name: "software-cpu".to_string(),
            vendor: "dopencl".to_string(),
            version: "OpenCL 1.2".to_string(),
            device_type: CL_DEVICE_TYPE_CPU,
            max_compute_units: thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            max_work_group_size: 1024,
            global_mem_size: 1 << 31,
        })
    }

    fn create_context(&self, device_indices: &[usize]) -> Result<Arc<dyn Context>> {
        if device_indices.iter().any(|index| *index != 0) {
            return Err(Error::Cl(CL_INVALID_DEVICE));
        }
        Ok(Arc::new(SoftwareContext { device_count: 1 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Arc<dyn Context> {
        SoftwarePlatform::new().create_context(&[0]).unwrap()
    }

    #[test]
    fn test_copy_between_buffers() {
        let context = context();
        let queue = context.create_queue(0, 0).unwrap();
        let src = context.create_buffer(0, 8, Some(&[1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        let dst = context.create_buffer(0, 8, None).unwrap();

        let copy = queue.enqueue_copy_buffer(&src, &dst, 0, 0, 8, &[]).unwrap();
        assert_eq!(copy.wait(), CL_COMPLETE);

        let (ptr, map) = queue.enqueue_map_buffer(&dst, 0, 0, 8, &[]).unwrap();
        assert_eq!(map.wait(), CL_COMPLETE);
        let bytes = unsafe { std::slice::from_raw_parts(ptr.0, 8) };
        assert_eq!(bytes, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_user_event_gates_queue() {
        let context = context();
        let queue = context.create_queue(0, 0).unwrap();
        let src = context.create_buffer(0, 4, Some(&[9, 9, 9, 9])).unwrap();
        let dst = context.create_buffer(0, 4, None).unwrap();

        let gate = context.create_user_event().unwrap();
        let copy = queue
            .enqueue_copy_buffer(&src, &dst, 0, 0, 4, &[gate.clone()])
            .unwrap();
        assert!(!is_terminal(copy.status()));

        gate.set_status(CL_COMPLETE).unwrap();
        assert_eq!(copy.wait(), CL_COMPLETE);
    }

    #[test]
    fn test_failed_dependency_terminates_command() {
        let context = context();
        let queue = context.create_queue(0, 0).unwrap();
        let gate = context.create_user_event().unwrap();
        let marker = queue.enqueue_marker(&[gate.clone()]).unwrap();

        gate.set_status(-1).unwrap();
        assert_eq!(marker.wait(), CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);
        // a user event can only be set once
        assert!(gate.set_status(CL_COMPLETE).is_err());
    }

    #[test]
    fn test_builtin_kernel_iota() {
        let context = context();
        let queue = context.create_queue(0, 0).unwrap();
        let program = context
            .create_program("__kernel void iota(__global int *v) { v[get_global_id(0)] = get_global_id(0); }")
            .unwrap();
        program.build("").unwrap();
        assert!(program.create_kernel("missing").is_err());
        let kernel = program.create_kernel("iota").unwrap();

        let buffer = context.create_buffer(0, 16 * 4, None).unwrap();
        kernel.set_arg_buffer(0, &buffer).unwrap();
        let run = queue.enqueue_ndrange_kernel(&kernel, &[], &[16], &[], &[]).unwrap();
        assert_eq!(run.wait(), CL_COMPLETE);

        let (ptr, map) = queue.enqueue_map_buffer(&buffer, 0, 0, 16 * 4, &[]).unwrap();
        map.wait();
        let values = unsafe { std::slice::from_raw_parts(ptr.0 as *const i32, 16) };
        assert_eq!(values, (0..16).collect::<Vec<i32>>().as_slice());
    }

    #[test]
    fn test_profiling_timestamps_are_ordered() {
        let context = context();
        let queue = context.create_queue(0, 0).unwrap();
        let marker = queue.enqueue_marker(&[]).unwrap();
        marker.wait();

        let queued = marker.profiling_info(CL_PROFILING_COMMAND_QUEUED).unwrap();
        let submit = marker.profiling_info(CL_PROFILING_COMMAND_SUBMIT).unwrap();
        let start = marker.profiling_info(CL_PROFILING_COMMAND_START).unwrap();
        let end = marker.profiling_info(CL_PROFILING_COMMAND_END).unwrap();
        assert!(queued <= submit && submit <= start && start <= end);
    }
}

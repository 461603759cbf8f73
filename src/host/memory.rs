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

//! Host-side memory object (buffer).
//!
//! The host keeps a lazily allocated, page-aligned cache of the buffer
//! contents. `CL_MEM_ALLOC_HOST_PTR` is taken as a hint to page-lock that
//! cache; `CL_MEM_USE_HOST_PTR` uses the application's memory as the cache
//! instead. If initial bytes are supplied (`COPY_HOST_PTR`/`USE_HOST_PTR`),
//! they are broadcast to every context node at creation time; there is no
//! synchronisation point before the first command touches the buffer, so
//! the consistency protocol cannot deliver them later.
//!
//! Because daemons exchange bulk data only with the host, the host also
//! relays node-to-node synchronisation: `on_acquire` pulls the bytes from
//! the owner into the cache and pushes them on to the acquiring node.

use super::context::Context;
use super::References;
use crate::error::{Error, Result};
use crate::protocol::Request;
use crate::transport::{DataTransfer, Process, SendConstPtr, SendPtr};
use crate::types::{
    cl_map_flags, cl_mem_flags, cl_uint, ObjectId, PayloadId, CL_COMPLETE,
    CL_INVALID_BUFFER_SIZE, CL_INVALID_CONTEXT, CL_INVALID_HOST_PTR, CL_INVALID_VALUE,
    CL_MAP_READ, CL_MAP_WRITE, CL_MEM_ALLOC_HOST_PTR, CL_MEM_COPY_HOST_PTR,
    CL_MEM_OBJECT_ALLOCATION_FAILURE, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_USE_HOST_PTR,
    CL_MEM_WRITE_ONLY,
};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// An outstanding pointer handed to the application by a map call.
#[derive(Clone, Copy, Debug)]
pub struct Mapping {
    pub flags: cl_map_flags,
    pub offset: usize,
    pub size: usize,
}

/// Page-aligned host memory, optionally page-locked, optionally borrowed
/// from the application (`USE_HOST_PTR`).
struct HostAllocation {
    ptr: SendPtr,
    size: usize,
    owned: bool,
    locked: bool,
}

impl HostAllocation {
    fn allocate(size: usize, lock: bool) -> Result<Self> {
        #[cfg(unix)]
        {
            let mut ptr: *mut c_void = std::ptr::null_mut();
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            let err = unsafe { libc::posix_memalign(&mut ptr, page_size.max(64), size) };
            if err != 0 || ptr.is_null() {
                return Err(Error::Cl(CL_MEM_OBJECT_ALLOCATION_FAILURE));
            }
            unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };
            let mut allocation =
                Self { ptr: SendPtr(ptr as *mut u8), size, owned: true, locked: false };
            if lock {
                // page-lock is a best-effort optimisation for frequent
                // transfers; failure only costs performance
                if unsafe { libc::mlock(ptr, size) } == 0 {
                    allocation.locked = true;
                } else {
                    warn!("cannot page-lock host memory for memory object ({size} bytes)");
                }
            }
            Ok(allocation)
        }
        #[cfg(not(unix))]
        {
            let _ = lock;
            let layout = std::alloc::Layout::from_size_align(size.max(1), 64)
                .map_err(|_| Error::Cl(CL_MEM_OBJECT_ALLOCATION_FAILURE))?;
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::Cl(CL_MEM_OBJECT_ALLOCATION_FAILURE));
            }
            Ok(Self { ptr: SendPtr(ptr), size, owned: true, locked: false })
        }
    }

    fn borrowed(ptr: *mut u8, size: usize) -> Self {
        Self { ptr: SendPtr(ptr), size, owned: false, locked: false }
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            if self.locked {
                if libc::munlock(self.ptr.0 as *const c_void, self.size) != 0 {
                    warn!("could not unlock memory object in host memory");
                }
            }
            if self.owned {
                libc::free(self.ptr.0 as *mut c_void);
            }
        }
        #[cfg(not(unix))]
        if self.owned {
            let layout = std::alloc::Layout::from_size_align(self.size.max(1), 64).unwrap();
            unsafe { std::alloc::dealloc(self.ptr.0, layout) };
        }
    }
}

struct BufferState {
    data: Option<HostAllocation>,
    mappings: HashMap<usize, Mapping>,
}

pub struct Buffer {
    id: ObjectId,
    context: Arc<Context>,
    flags: cl_mem_flags,
    size: usize,
    host_ptr: Option<SendPtr>,
    state: Mutex<BufferState>,
    destructor_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    references: References,
    destroyed: AtomicBool,
}

impl Buffer {
    /// Creates a buffer of `size` bytes on every context node.
    ///
    /// `host_ptr` must be non-null exactly when `CL_MEM_COPY_HOST_PTR` or
    /// `CL_MEM_USE_HOST_PTR` is set; in that case the pointed-to bytes are
    /// broadcast to all context nodes before this call returns.
    pub fn create(
        context: &Arc<Context>,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
    ) -> Result<Arc<Self>> {
        let rw_flags = flags & (CL_MEM_READ_WRITE | CL_MEM_READ_ONLY | CL_MEM_WRITE_ONLY);
        let host_ptr_flags = flags & (CL_MEM_COPY_HOST_PTR | CL_MEM_USE_HOST_PTR);
        let alloc_host_ptr = flags & CL_MEM_ALLOC_HOST_PTR != 0;

        if size == 0 {
            return Err(Error::Cl(CL_INVALID_BUFFER_SIZE));
        }
        // the read-write flags are mutually exclusive
        if rw_flags.count_ones() > 1 {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }

        let mut state = BufferState { data: None, mappings: HashMap::new() };
        let mut use_host_ptr = None;
        if !host_ptr.is_null() {
            match host_ptr_flags {
                CL_MEM_COPY_HOST_PTR => {
                    let data = HostAllocation::allocate(size, alloc_host_ptr)?;
                    unsafe {
                        std::ptr::copy_nonoverlapping(host_ptr as *const u8, data.ptr.0, size);
                    }
                    state.data = Some(data);
                }
                CL_MEM_USE_HOST_PTR => {
                    if alloc_host_ptr {
                        return Err(Error::Cl(CL_INVALID_VALUE));
                    }
                    use_host_ptr = Some(SendPtr(host_ptr as *mut u8));
                    state.data = Some(HostAllocation::borrowed(host_ptr as *mut u8, size));
                }
                _ if host_ptr_flags == (CL_MEM_COPY_HOST_PTR | CL_MEM_USE_HOST_PTR) => {
                    return Err(Error::Cl(CL_INVALID_VALUE));
                }
                _ => return Err(Error::Cl(CL_INVALID_HOST_PTR)),
            }
        } else if host_ptr_flags != 0 {
            return Err(Error::Cl(CL_INVALID_HOST_PTR));
        }

        let id = context.next_id();
        let buffer = Arc::new(Self {
            id,
            context: context.clone(),
            flags,
            size,
            host_ptr: use_host_ptr,
            state: Mutex::new(state),
            destructor_callbacks: Mutex::new(Vec::new()),
            references: References::new(),
            destroyed: AtomicBool::new(false),
        });

        let request = Request::CreateBuffer {
            id,
            context_id: context.id(),
            flags,
            size: size as u64,
            initialized: host_ptr_flags != 0,
        };
        if host_ptr_flags != 0 {
            // ship the initial bytes alongside the create requests; the
            // data must be posted before the daemon starts waiting for it
            let ptr = {
                let state = buffer.state.lock().unwrap();
                SendConstPtr(state.data.as_ref().map(|data| data.ptr.0).unwrap_or(host_ptr as *mut u8)
                    as *const u8)
            };
            let mut transfers = Vec::new();
            for node in context.compute_nodes() {
                transfers.push(node.process().send_data(PayloadId::command(id), size, ptr)?);
                node.execute_command(&request)?;
            }
            for transfer in transfers {
                transfer.wait_ok()?;
            }
        } else {
            super::compute_node::execute_on_all(context.compute_nodes(), &request)?;
        }

        info!("buffer created (ID={id}, size={size})");
        Ok(buffer)
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn flags(&self) -> cl_mem_flags {
        self.flags
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn host_ptr(&self) -> Option<*mut u8> {
        self.host_ptr.map(|ptr| ptr.0)
    }

    /// The parent of a sub-buffer. Top-level buffers have none; sub-buffer
    /// creation is not supported yet.
    pub fn associated_mem_object(&self) -> Option<Arc<Buffer>> {
        None
    }

    /// Byte offset of a sub-buffer into its parent.
    pub fn offset(&self) -> usize {
        0
    }

    /// A buffer is an output if a kernel may write it.
    pub fn is_output(&self) -> bool {
        self.flags & (CL_MEM_WRITE_ONLY | CL_MEM_READ_WRITE) != 0
    }

    pub fn map_count(&self) -> cl_uint {
        self.state.lock().unwrap().mappings.len() as cl_uint
    }

    pub fn reference_count(&self) -> u32 {
        self.references.count()
    }

    /// Hands out a pointer into the cached copy and records the mapping.
    /// No data is moved; the map command's transfer fills the region.
    pub(crate) fn map(
        &self,
        flags: cl_map_flags,
        offset: usize,
        size: usize,
    ) -> Result<*mut u8> {
        if flags != CL_MAP_READ
            && flags != CL_MAP_WRITE
            && flags != (CL_MAP_READ | CL_MAP_WRITE)
        {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }
        if offset.checked_add(size).map_or(true, |end| end > self.size) {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }
        let mut state = self.state.lock().unwrap();
        self.allocate_locked(&mut state)?;
        let ptr = unsafe { state.data.as_ref().unwrap().ptr.0.add(offset) };
        state.mappings.insert(ptr as usize, Mapping { flags, offset, size });
        Ok(ptr)
    }

    /// Forgets the mapping behind `ptr`.
    pub(crate) fn unmap(&self, ptr: *mut u8) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.mappings.remove(&(ptr as usize)).is_none() {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }
        Ok(())
    }

    pub(crate) fn find_mapping(&self, ptr: *mut u8) -> Option<Mapping> {
        self.state.lock().unwrap().mappings.get(&(ptr as usize)).copied()
    }

    /// Registers a callback to run when the buffer is destroyed, before its
    /// resources are freed. Callbacks run in reverse registration order.
    pub fn set_destructor_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.destructor_callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// Receives this buffer's bytes from `source` into the host cache.
    pub(crate) fn acquire_from(
        &self,
        source: &Arc<dyn Process>,
        payload: PayloadId,
    ) -> Result<Arc<DataTransfer>> {
        let ptr = {
            let mut state = self.state.lock().unwrap();
            self.allocate_locked(&mut state)?;
            state.data.as_ref().unwrap().ptr
        };
        source.receive_data(payload, self.size, ptr)
    }

    /// Host-mediated synchronisation relay: pulls the buffer's bytes from
    /// the owner (`source`) and pushes them on to the acquiring node
    /// (`destination`). Failures are logged, not returned; the acquiring
    /// side observes them as a stalled transfer failing its user event.
    pub(crate) fn on_acquire(
        self: &Arc<Self>,
        destination: Arc<dyn Process>,
        source: Arc<dyn Process>,
        event_id: ObjectId,
    ) {
        debug!(
            "(SYN) acquiring memory object (ID={}) from '{}' on behalf of '{}'",
            self.id,
            source.url(),
            destination.url()
        );
        let payload = PayloadId::memory(event_id, self.id);
        let buffer = self.clone();
        match self.acquire_from(&source, payload) {
            Ok(receipt) => receipt.set_callback(move |status| {
                buffer.forward_acquired(&destination, payload, status);
            }),
            Err(err) => error!("(SYN) acquire failed (ID={}): {err}", self.id),
        }
    }

    fn forward_acquired(
        &self,
        destination: &Arc<dyn Process>,
        payload: PayloadId,
        status: crate::types::cl_int,
    ) {
        if status != CL_COMPLETE {
            error!("(SYN) acquire failed: data receipt failed (ID={})", self.id);
            return;
        }
        let ptr = {
            let state = self.state.lock().unwrap();
            match state.data.as_ref() {
                Some(data) => SendConstPtr(data.ptr.0 as *const u8),
                None => return,
            }
        };
        if let Err(err) = destination.send_data(payload, self.size, ptr) {
            error!("(SYN) acquire failed (ID={}): {err}", self.id);
        }
    }

    /// The host cache pointer, allocating on first use.
    pub(crate) fn cached_data(&self) -> Result<SendConstPtr> {
        let mut state = self.state.lock().unwrap();
        self.allocate_locked(&mut state)?;
        Ok(SendConstPtr(state.data.as_ref().unwrap().ptr.0 as *const u8))
    }

    fn allocate_locked(&self, state: &mut BufferState) -> Result<()> {
        if state.data.is_none() {
            state.data = Some(HostAllocation::allocate(
                self.size,
                self.flags & CL_MEM_ALLOC_HOST_PTR != 0,
            )?);
        }
        Ok(())
    }

    pub fn retain(&self) {
        self.references.retain();
    }

    pub fn release(self: &Arc<Self>) -> Result<()> {
        if self.references.release() {
            self.destroy()?;
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // callbacks run before any resource is freed
        let callbacks = std::mem::take(&mut *self.destructor_callbacks.lock().unwrap());
        for callback in callbacks.into_iter().rev() {
            callback();
        }
        super::compute_node::execute_on_all(
            self.context.compute_nodes(),
            &Request::DeleteMemory { id: self.id },
        )?;
        self.state.lock().unwrap().data = None;
        info!("memory object deleted (ID={})", self.id);
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            if let Err(err) = self.destroy() {
                warn!("deleting memory object failed (ID={}): {err}", self.id);
            }
        }
    }
}

/// Validates that `buffer` belongs to `context`.
pub(crate) fn check_context(buffer: &Buffer, context: &Arc<Context>) -> Result<()> {
    if !Arc::ptr_eq(buffer.context(), context) {
        return Err(Error::Cl(CL_INVALID_CONTEXT));
    }
    Ok(())
}

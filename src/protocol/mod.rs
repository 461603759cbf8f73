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

//! Host / daemon message model.
//!
//! Three message classes travel over the message channel:
//! * [`Request`]: host to daemon, answered by exactly one [`Response`].
//!   Every request that creates an object carries the id the host allocated
//!   for it; daemons never allocate object ids.
//! * [`Response`]: generic success, a typed error carrying an OpenCL error
//!   code, or an info-bearing payload for query operations.
//! * [`EventMessage`]: asynchronous notifications between any two
//!   processes. These are not responses; they carry the id of the object
//!   they target and are dispatched through the object registry.
//!
//! Bulk payloads (buffer contents) ride the bulk channel, correlated by
//! [`PayloadId`](crate::types::PayloadId).

pub mod bytes;

use crate::error::{Error, Result};
use crate::types::{
    cl_command_queue_properties, cl_int, cl_map_flags, cl_mem_flags, cl_uint, cl_ulong, ObjectId,
};
use bytes::ByteBuffer;

/// Default TCP port of the compute-node daemon.
pub const DEFAULT_PORT: u16 = 25025;

/// Device properties relayed from a daemon to the host at connection time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescription {
    /// Daemon-local device index; requests address devices by it.
    pub index: cl_uint,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub device_type: cl_ulong,
    pub max_compute_units: cl_uint,
    pub max_work_group_size: u64,
    pub global_mem_size: cl_ulong,
}

impl DeviceDescription {
    fn put(&self, buffer: &mut ByteBuffer) {
        buffer.put_u32(self.index);
        buffer.put_string(&self.name);
        buffer.put_string(&self.vendor);
        buffer.put_string(&self.version);
        buffer.put_u64(self.device_type);
        buffer.put_u32(self.max_compute_units);
        buffer.put_u64(self.max_work_group_size);
        buffer.put_u64(self.global_mem_size);
    }

    fn get(buffer: &mut ByteBuffer) -> Result<Self> {
        Ok(Self {
            index: buffer.get_u32()?,
            name: buffer.get_string()?,
            vendor: buffer.get_string()?,
            version: buffer.get_string()?,
            device_type: buffer.get_u64()?,
            max_compute_units: buffer.get_u32()?,
            max_work_group_size: buffer.get_u64()?,
            global_mem_size: buffer.get_u64()?,
        })
    }
}

/// A kernel argument as transmitted to the daemon owning the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelArg {
    /// A memory object argument, referenced by id.
    Memory(ObjectId),
    /// An argument passed by value, as raw bytes.
    Bytes(Vec<u8>),
}

/// Common fields of every enqueue request.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct EnqueueHeader {
    pub queue_id: ObjectId,
    /// Id of the command created by this enqueue. Doubles as the id of the
    /// associated event, if one is requested.
    pub command_id: ObjectId,
    pub wait_list: Vec<ObjectId>,
    pub want_event: bool,
}

impl EnqueueHeader {
    fn put(&self, buffer: &mut ByteBuffer) {
        buffer.put_u64(self.queue_id);
        buffer.put_u64(self.command_id);
        buffer.put_u64_vec(&self.wait_list);
        buffer.put_bool(self.want_event);
    }

    fn get(buffer: &mut ByteBuffer) -> Result<Self> {
        Ok(Self {
            queue_id: buffer.get_u64()?,
            command_id: buffer.get_u64()?,
            wait_list: buffer.get_u64_vec()?,
            want_event: buffer.get_bool()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Enumerate the daemon's devices.
    ListDevices,
    CreateContext {
        id: ObjectId,
        device_indices: Vec<cl_uint>,
        /// The other compute nodes of the context, by URL. The daemon sends
        /// execution-status broadcasts to them.
        peer_urls: Vec<String>,
    },
    ReleaseContext {
        id: ObjectId,
    },
    CreateCommandQueue {
        id: ObjectId,
        context_id: ObjectId,
        device_index: cl_uint,
        properties: cl_command_queue_properties,
    },
    DeleteCommandQueue {
        id: ObjectId,
    },
    CreateBuffer {
        id: ObjectId,
        context_id: ObjectId,
        flags: cl_mem_flags,
        size: u64,
        /// When set, the host follows up with the initial contents on the
        /// bulk channel under payload id `(id, 0)`.
        initialized: bool,
    },
    DeleteMemory {
        id: ObjectId,
    },
    /// Create a replica event for a command enqueued elsewhere. An empty
    /// memory-object list creates a replica of a user event.
    CreateEvent {
        id: ObjectId,
        context_id: ObjectId,
        memory_ids: Vec<ObjectId>,
    },
    DeleteEvent {
        id: ObjectId,
    },
    CreateProgram {
        id: ObjectId,
        context_id: ObjectId,
        source: String,
    },
    BuildProgram {
        id: ObjectId,
        options: String,
    },
    DeleteProgram {
        id: ObjectId,
    },
    CreateKernel {
        id: ObjectId,
        program_id: ObjectId,
        name: String,
    },
    DeleteKernel {
        id: ObjectId,
    },
    SetKernelArg {
        kernel_id: ObjectId,
        index: cl_uint,
        arg: KernelArg,
    },
    EnqueueCopyBuffer {
        header: EnqueueHeader,
        src_id: ObjectId,
        dst_id: ObjectId,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    EnqueueReadBuffer {
        header: EnqueueHeader,
        buffer_id: ObjectId,
        blocking: bool,
        offset: u64,
        size: u64,
    },
    EnqueueWriteBuffer {
        header: EnqueueHeader,
        buffer_id: ObjectId,
        blocking: bool,
        offset: u64,
        size: u64,
    },
    EnqueueMapBuffer {
        header: EnqueueHeader,
        buffer_id: ObjectId,
        blocking: bool,
        map_flags: cl_map_flags,
        offset: u64,
        size: u64,
    },
    EnqueueUnmapBuffer {
        header: EnqueueHeader,
        buffer_id: ObjectId,
        map_flags: cl_map_flags,
        offset: u64,
        size: u64,
    },
    EnqueueNDRangeKernel {
        header: EnqueueHeader,
        kernel_id: ObjectId,
        offset: Vec<u64>,
        global: Vec<u64>,
        local: Vec<u64>,
    },
    EnqueueMarker {
        header: EnqueueHeader,
    },
    EnqueueBarrier {
        header: EnqueueHeader,
    },
    EnqueueWaitForEvents {
        queue_id: ObjectId,
        event_ids: Vec<ObjectId>,
    },
    /// Collective broadcast: write the host-supplied payload into `dst_id`.
    /// The payload rides the bulk channel under `(command_id, dst_id)`.
    EnqueueBroadcastBuffer {
        header: EnqueueHeader,
        dst_id: ObjectId,
        offset: u64,
        size: u64,
    },
    FlushQueue {
        id: ObjectId,
    },
    FinishQueue {
        id: ObjectId,
    },
    GetEventProfilingInfos {
        id: ObjectId,
    },
}

const REQ_LIST_DEVICES: u8 = 1;
const REQ_CREATE_CONTEXT: u8 = 2;
const REQ_RELEASE_CONTEXT: u8 = 3;
const REQ_CREATE_COMMAND_QUEUE: u8 = 4;
const REQ_DELETE_COMMAND_QUEUE: u8 = 5;
const REQ_CREATE_BUFFER: u8 = 6;
const REQ_DELETE_MEMORY: u8 = 7;
const REQ_CREATE_EVENT: u8 = 8;
const REQ_DELETE_EVENT: u8 = 9;
const REQ_CREATE_PROGRAM: u8 = 10;
const REQ_BUILD_PROGRAM: u8 = 11;
const REQ_DELETE_PROGRAM: u8 = 12;
const REQ_CREATE_KERNEL: u8 = 13;
const REQ_DELETE_KERNEL: u8 = 14;
const REQ_SET_KERNEL_ARG: u8 = 15;
const REQ_ENQUEUE_COPY_BUFFER: u8 = 16;
const REQ_ENQUEUE_READ_BUFFER: u8 = 17;
const REQ_ENQUEUE_WRITE_BUFFER: u8 = 18;
const REQ_ENQUEUE_MAP_BUFFER: u8 = 19;
const REQ_ENQUEUE_UNMAP_BUFFER: u8 = 20;
const REQ_ENQUEUE_NDRANGE_KERNEL: u8 = 21;
const REQ_ENQUEUE_MARKER: u8 = 22;
const REQ_ENQUEUE_BARRIER: u8 = 23;
const REQ_ENQUEUE_WAIT_FOR_EVENTS: u8 = 24;
const REQ_ENQUEUE_BROADCAST_BUFFER: u8 = 25;
const REQ_FLUSH_QUEUE: u8 = 26;
const REQ_FINISH_QUEUE: u8 = 27;
const REQ_GET_EVENT_PROFILING_INFOS: u8 = 28;

const ARG_MEMORY: u8 = 0;
const ARG_BYTES: u8 = 1;

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = ByteBuffer::new();
        match self {
            Self::ListDevices => buffer.put_u8(REQ_LIST_DEVICES),
            Self::CreateContext { id, device_indices, peer_urls } => {
                buffer.put_u8(REQ_CREATE_CONTEXT);
                buffer.put_u64(*id);
                buffer.put_u32(device_indices.len() as u32);
                for index in device_indices {
                    buffer.put_u32(*index);
                }
                buffer.put_string_vec(peer_urls);
            }
            Self::ReleaseContext { id } => {
                buffer.put_u8(REQ_RELEASE_CONTEXT);
                buffer.put_u64(*id);
            }
            Self::CreateCommandQueue { id, context_id, device_index, properties } => {
                buffer.put_u8(REQ_CREATE_COMMAND_QUEUE);
                buffer.put_u64(*id);
                buffer.put_u64(*context_id);
                buffer.put_u32(*device_index);
                buffer.put_u64(*properties);
            }
            Self::DeleteCommandQueue { id } => {
                buffer.put_u8(REQ_DELETE_COMMAND_QUEUE);
                buffer.put_u64(*id);
            }
            Self::CreateBuffer { id, context_id, flags, size, initialized } => {
                buffer.put_u8(REQ_CREATE_BUFFER);
                buffer.put_u64(*id);
                buffer.put_u64(*context_id);
                buffer.put_u64(*flags);
                buffer.put_u64(*size);
                buffer.put_bool(*initialized);
            }
            Self::DeleteMemory { id } => {
                buffer.put_u8(REQ_DELETE_MEMORY);
                buffer.put_u64(*id);
            }
            Self::CreateEvent { id, context_id, memory_ids } => {
                buffer.put_u8(REQ_CREATE_EVENT);
                buffer.put_u64(*id);
                buffer.put_u64(*context_id);
                buffer.put_u64_vec(memory_ids);
            }
            Self::DeleteEvent { id } => {
                buffer.put_u8(REQ_DELETE_EVENT);
                buffer.put_u64(*id);
            }
            Self::CreateProgram { id, context_id, source } => {
                buffer.put_u8(REQ_CREATE_PROGRAM);
                buffer.put_u64(*id);
                buffer.put_u64(*context_id);
                buffer.put_string(source);
            }
            Self::BuildProgram { id, options } => {
                buffer.put_u8(REQ_BUILD_PROGRAM);
                buffer.put_u64(*id);
                buffer.put_string(options);
            }
            Self::DeleteProgram { id } => {
                buffer.put_u8(REQ_DELETE_PROGRAM);
                buffer.put_u64(*id);
            }
            Self::CreateKernel { id, program_id, name } => {
                buffer.put_u8(REQ_CREATE_KERNEL);
                buffer.put_u64(*id);
                buffer.put_u64(*program_id);
                buffer.put_string(name);
            }
            Self::DeleteKernel { id } => {
                buffer.put_u8(REQ_DELETE_KERNEL);
                buffer.put_u64(*id);
            }
            Self::SetKernelArg { kernel_id, index, arg } => {
                buffer.put_u8(REQ_SET_KERNEL_ARG);
                buffer.put_u64(*kernel_id);
                buffer.put_u32(*index);
                match arg {
                    KernelArg::Memory(id) => {
                        buffer.put_u8(ARG_MEMORY);
                        buffer.put_u64(*id);
                    }
                    KernelArg::Bytes(bytes) => {
                        buffer.put_u8(ARG_BYTES);
                        buffer.put_bytes(bytes);
                    }
                }
            }
            Self::EnqueueCopyBuffer { header, src_id, dst_id, src_offset, dst_offset, size } => {
                buffer.put_u8(REQ_ENQUEUE_COPY_BUFFER);
                header.put(&mut buffer);
                buffer.put_u64(*src_id);
                buffer.put_u64(*dst_id);
                buffer.put_u64(*src_offset);
                buffer.put_u64(*dst_offset);
                buffer.put_u64(*size);
            }
            Self::EnqueueReadBuffer { header, buffer_id, blocking, offset, size } => {
                buffer.put_u8(REQ_ENQUEUE_READ_BUFFER);
                header.put(&mut buffer);
                buffer.put_u64(*buffer_id);
                buffer.put_bool(*blocking);
                buffer.put_u64(*offset);
                buffer.put_u64(*size);
            }
            Self::EnqueueWriteBuffer { header, buffer_id, blocking, offset, size } => {
                buffer.put_u8(REQ_ENQUEUE_WRITE_BUFFER);
                header.put(&mut buffer);
                buffer.put_u64(*buffer_id);
                buffer.put_bool(*blocking);
                buffer.put_u64(*offset);
                buffer.put_u64(*size);
            }
            Self::EnqueueMapBuffer { header, buffer_id, blocking, map_flags, offset, size } => {
                buffer.put_u8(REQ_ENQUEUE_MAP_BUFFER);
                header.put(&mut buffer);
                buffer.put_u64(*buffer_id);
                buffer.put_bool(*blocking);
                buffer.put_u64(*map_flags);
                buffer.put_u64(*offset);
                buffer.put_u64(*size);
            }
            Self::EnqueueUnmapBuffer { header, buffer_id, map_flags, offset, size } => {
                buffer.put_u8(REQ_ENQUEUE_UNMAP_BUFFER);
                header.put(&mut buffer);
                buffer.put_u64(*buffer_id);
                buffer.put_u64(*map_flags);
                buffer.put_u64(*offset);
                buffer.put_u64(*size);
            }
            Self::EnqueueNDRangeKernel { header, kernel_id, offset, global, local } => {
                buffer.put_u8(REQ_ENQUEUE_NDRANGE_KERNEL);
                header.put(&mut buffer);
                buffer.put_u64(*kernel_id);
                buffer.put_u64_vec(offset);
                buffer.put_u64_vec(global);
                buffer.put_u64_vec(local);
            }
            Self::EnqueueMarker { header } => {
                buffer.put_u8(REQ_ENQUEUE_MARKER);
                header.put(&mut buffer);
            }
            Self::EnqueueBarrier { header } => {
                buffer.put_u8(REQ_ENQUEUE_BARRIER);
                header.put(&mut buffer);
            }
            Self::EnqueueWaitForEvents { queue_id, event_ids } => {
                buffer.put_u8(REQ_ENQUEUE_WAIT_FOR_EVENTS);
                buffer.put_u64(*queue_id);
                buffer.put_u64_vec(event_ids);
            }
            Self::EnqueueBroadcastBuffer { header, dst_id, offset, size } => {
                buffer.put_u8(REQ_ENQUEUE_BROADCAST_BUFFER);
                header.put(&mut buffer);
                buffer.put_u64(*dst_id);
                buffer.put_u64(*offset);
                buffer.put_u64(*size);
            }
            Self::FlushQueue { id } => {
                buffer.put_u8(REQ_FLUSH_QUEUE);
                buffer.put_u64(*id);
            }
            Self::FinishQueue { id } => {
                buffer.put_u8(REQ_FINISH_QUEUE);
                buffer.put_u64(*id);
            }
            Self::GetEventProfilingInfos { id } => {
                buffer.put_u8(REQ_GET_EVENT_PROFILING_INFOS);
                buffer.put_u64(*id);
            }
        }
        buffer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buffer = ByteBuffer::from_bytes(bytes.to_vec());
        let tag = buffer.get_u8()?;
        let request = match tag {
            REQ_LIST_DEVICES => Self::ListDevices,
            REQ_CREATE_CONTEXT => {
                let id = buffer.get_u64()?;
                let count = buffer.get_u32()? as usize;
                let mut device_indices = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    device_indices.push(buffer.get_u32()?);
                }
                let peer_urls = buffer.get_string_vec()?;
                Self::CreateContext { id, device_indices, peer_urls }
            }
            REQ_RELEASE_CONTEXT => Self::ReleaseContext { id: buffer.get_u64()? },
            REQ_CREATE_COMMAND_QUEUE => Self::CreateCommandQueue {
                id: buffer.get_u64()?,
                context_id: buffer.get_u64()?,
                device_index: buffer.get_u32()?,
                properties: buffer.get_u64()?,
            },
            REQ_DELETE_COMMAND_QUEUE => Self::DeleteCommandQueue { id: buffer.get_u64()? },
            REQ_CREATE_BUFFER => Self::CreateBuffer {
                id: buffer.get_u64()?,
                context_id: buffer.get_u64()?,
                flags: buffer.get_u64()?,
                size: buffer.get_u64()?,
                initialized: buffer.get_bool()?,
            },
            REQ_DELETE_MEMORY => Self::DeleteMemory { id: buffer.get_u64()? },
            REQ_CREATE_EVENT => Self::CreateEvent {
                id: buffer.get_u64()?,
                context_id: buffer.get_u64()?,
                memory_ids: buffer.get_u64_vec()?,
            },
            REQ_DELETE_EVENT => Self::DeleteEvent { id: buffer.get_u64()? },
            REQ_CREATE_PROGRAM => Self::CreateProgram {
                id: buffer.get_u64()?,
                context_id: buffer.get_u64()?,
                source: buffer.get_string()?,
            },
            REQ_BUILD_PROGRAM => Self::BuildProgram {
                id: buffer.get_u64()?,
                options: buffer.get_string()?,
            },
            REQ_DELETE_PROGRAM => Self::DeleteProgram { id: buffer.get_u64()? },
            REQ_CREATE_KERNEL => Self::CreateKernel {
                id: buffer.get_u64()?,
                program_id: buffer.get_u64()?,
                name: buffer.get_string()?,
            },
            REQ_DELETE_KERNEL => Self::DeleteKernel { id: buffer.get_u64()? },
            REQ_SET_KERNEL_ARG => {
                let kernel_id = buffer.get_u64()?;
                let index = buffer.get_u32()?;
                let arg = match buffer.get_u8()? {
                    ARG_MEMORY => KernelArg::Memory(buffer.get_u64()?),
                    ARG_BYTES => KernelArg::Bytes(buffer.get_byte_vec()?),
                    tag => {
                        return Err(Error::Protocol(format!("unknown kernel argument tag {tag}")))
                    }
                };
                Self::SetKernelArg { kernel_id, index, arg }
            }
            REQ_ENQUEUE_COPY_BUFFER => Self::EnqueueCopyBuffer {
                header: EnqueueHeader::get(&mut buffer)?,
                src_id: buffer.get_u64()?,
                dst_id: buffer.get_u64()?,
                src_offset: buffer.get_u64()?,
                dst_offset: buffer.get_u64()?,
                size: buffer.get_u64()?,
            },
            REQ_ENQUEUE_READ_BUFFER => Self::EnqueueReadBuffer {
                header: EnqueueHeader::get(&mut buffer)?,
                buffer_id: buffer.get_u64()?,
                blocking: buffer.get_bool()?,
                offset: buffer.get_u64()?,
                size: buffer.get_u64()?,
            },
            REQ_ENQUEUE_WRITE_BUFFER => Self::EnqueueWriteBuffer {
                header: EnqueueHeader::get(&mut buffer)?,
                buffer_id: buffer.get_u64()?,
                blocking: buffer.get_bool()?,
                offset: buffer.get_u64()?,
                size: buffer.get_u64()?,
            },
            REQ_ENQUEUE_MAP_BUFFER => Self::EnqueueMapBuffer {
                header: EnqueueHeader::get(&mut buffer)?,
                buffer_id: buffer.get_u64()?,
                blocking: buffer.get_bool()?,
                map_flags: buffer.get_u64()?,
                offset: buffer.get_u64()?,
                size: buffer.get_u64()?,
            },
            REQ_ENQUEUE_UNMAP_BUFFER => Self::EnqueueUnmapBuffer {
                header: EnqueueHeader::get(&mut buffer)?,
                buffer_id: buffer.get_u64()?,
                map_flags: buffer.get_u64()?,
                offset: buffer.get_u64()?,
                size: buffer.get_u64()?,
            },
            REQ_ENQUEUE_NDRANGE_KERNEL => Self::EnqueueNDRangeKernel {
                header: EnqueueHeader::get(&mut buffer)?,
                kernel_id: buffer.get_u64()?,
                offset: buffer.get_u64_vec()?,
                global: buffer.get_u64_vec()?,
                local: buffer.get_u64_vec()?,
            },
            REQ_ENQUEUE_MARKER => Self::EnqueueMarker { header: EnqueueHeader::get(&mut buffer)? },
            REQ_ENQUEUE_BARRIER => Self::EnqueueBarrier { header: EnqueueHeader::get(&mut buffer)? },
            REQ_ENQUEUE_WAIT_FOR_EVENTS => Self::EnqueueWaitForEvents {
                queue_id: buffer.get_u64()?,
                event_ids: buffer.get_u64_vec()?,
            },
            REQ_ENQUEUE_BROADCAST_BUFFER => Self::EnqueueBroadcastBuffer {
                header: EnqueueHeader::get(&mut buffer)?,
                dst_id: buffer.get_u64()?,
                offset: buffer.get_u64()?,
                size: buffer.get_u64()?,
            },
            REQ_FLUSH_QUEUE => Self::FlushQueue { id: buffer.get_u64()? },
            REQ_FINISH_QUEUE => Self::FinishQueue { id: buffer.get_u64()? },
            REQ_GET_EVENT_PROFILING_INFOS => {
                Self::GetEventProfilingInfos { id: buffer.get_u64()? }
            }
            tag => return Err(Error::Protocol(format!("unknown request tag {tag}"))),
        };
        Ok(request)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Success,
    Error(cl_int),
    DeviceList(Vec<DeviceDescription>),
    /// Event profiling timestamps in nanoseconds, all in the daemon clock
    /// domain (submit/start/end are skew-adjusted by `received - queued`).
    ProfilingInfos {
        received: cl_ulong,
        queued: cl_ulong,
        submit: cl_ulong,
        start: cl_ulong,
        end: cl_ulong,
    },
}

const RESP_SUCCESS: u8 = 1;
const RESP_ERROR: u8 = 2;
const RESP_DEVICE_LIST: u8 = 3;
const RESP_PROFILING_INFOS: u8 = 4;

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = ByteBuffer::new();
        match self {
            Self::Success => buffer.put_u8(RESP_SUCCESS),
            Self::Error(code) => {
                buffer.put_u8(RESP_ERROR);
                buffer.put_i32(*code);
            }
            Self::DeviceList(devices) => {
                buffer.put_u8(RESP_DEVICE_LIST);
                buffer.put_u32(devices.len() as u32);
                for device in devices {
                    device.put(&mut buffer);
                }
            }
            Self::ProfilingInfos { received, queued, submit, start, end } => {
                buffer.put_u8(RESP_PROFILING_INFOS);
                buffer.put_u64(*received);
                buffer.put_u64(*queued);
                buffer.put_u64(*submit);
                buffer.put_u64(*start);
                buffer.put_u64(*end);
            }
        }
        buffer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buffer = ByteBuffer::from_bytes(bytes.to_vec());
        let response = match buffer.get_u8()? {
            RESP_SUCCESS => Self::Success,
            RESP_ERROR => Self::Error(buffer.get_i32()?),
            RESP_DEVICE_LIST => {
                let count = buffer.get_u32()? as usize;
                let mut devices = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    devices.push(DeviceDescription::get(&mut buffer)?);
                }
                Self::DeviceList(devices)
            }
            RESP_PROFILING_INFOS => Self::ProfilingInfos {
                received: buffer.get_u64()?,
                queued: buffer.get_u64()?,
                submit: buffer.get_u64()?,
                start: buffer.get_u64()?,
                end: buffer.get_u64()?,
            },
            tag => return Err(Error::Protocol(format!("unknown response tag {tag}"))),
        };
        Ok(response)
    }

    /// Converts an error response into `Err`, any other response into `Ok`.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Error(code) => Err(Error::Cl(code)),
            other => Ok(other),
        }
    }
}

/// Asynchronous notifications; dispatched by object id, never answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventMessage {
    /// The execution status of the command `id` changed. Sent by the owner
    /// of an event to every process holding a replica, and by the host when
    /// it finishes a command or a user event is set.
    CommandExecutionStatusChanged { id: ObjectId, status: cl_int },
    /// The sender consumed the event `id` in a wait list for the first time
    /// and requests the release of the attached memory objects.
    EventSynchronization { id: ObjectId },
}

const MSG_STATUS_CHANGED: u8 = 1;
const MSG_EVENT_SYNCHRONIZATION: u8 = 2;

impl EventMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = ByteBuffer::new();
        match self {
            Self::CommandExecutionStatusChanged { id, status } => {
                buffer.put_u8(MSG_STATUS_CHANGED);
                buffer.put_u64(*id);
                buffer.put_i32(*status);
            }
            Self::EventSynchronization { id } => {
                buffer.put_u8(MSG_EVENT_SYNCHRONIZATION);
                buffer.put_u64(*id);
            }
        }
        buffer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buffer = ByteBuffer::from_bytes(bytes.to_vec());
        let message = match buffer.get_u8()? {
            MSG_STATUS_CHANGED => Self::CommandExecutionStatusChanged {
                id: buffer.get_u64()?,
                status: buffer.get_i32()?,
            },
            MSG_EVENT_SYNCHRONIZATION => Self::EventSynchronization { id: buffer.get_u64()? },
            tag => return Err(Error::Protocol(format!("unknown message tag {tag}"))),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CL_MEM_READ_WRITE, CL_SUBMITTED};

    #[test]
    fn test_request_round_trip() {
        let requests = vec![
            Request::ListDevices,
            Request::CreateContext {
                id: 1,
                device_indices: vec![0, 1],
                peer_urls: vec!["tcp://n1".to_string()],
            },
            Request::CreateBuffer {
                id: 5,
                context_id: 1,
                flags: CL_MEM_READ_WRITE,
                size: 4096,
                initialized: true,
            },
            Request::SetKernelArg {
                kernel_id: 9,
                index: 2,
                arg: KernelArg::Bytes(vec![1, 2, 3, 4]),
            },
            Request::EnqueueWriteBuffer {
                header: EnqueueHeader {
                    queue_id: 3,
                    command_id: 17,
                    wait_list: vec![11, 12],
                    want_event: true,
                },
                buffer_id: 5,
                blocking: false,
                offset: 0,
                size: 4096,
            },
            Request::EnqueueNDRangeKernel {
                header: EnqueueHeader { queue_id: 3, command_id: 18, ..Default::default() },
                kernel_id: 9,
                offset: vec![],
                global: vec![1024],
                local: vec![],
            },
            Request::GetEventProfilingInfos { id: 17 },
        ];
        for request in requests {
            assert_eq!(Request::decode(&request.encode()).unwrap(), request);
        }
    }

    #[test]
    fn test_response_round_trip() {
        let responses = vec![
            Response::Success,
            Response::Error(-34),
            Response::DeviceList(vec![DeviceDescription {
                index: 0,
                name: "cpu".to_string(),
                vendor: "software".to_string(),
                version: "OpenCL 1.2".to_string(),
                device_type: 2,
                max_compute_units: 8,
                max_work_group_size: 1024,
                global_mem_size: 1 << 30,
            }]),
            Response::ProfilingInfos { received: 1, queued: 1, submit: 2, start: 3, end: 4 },
        ];
        for response in responses {
            assert_eq!(Response::decode(&response.encode()).unwrap(), response);
        }
    }

    #[test]
    fn test_message_round_trip() {
        let messages = vec![
            EventMessage::CommandExecutionStatusChanged { id: 17, status: CL_SUBMITTED },
            EventMessage::EventSynchronization { id: 17 },
        ];
        for message in messages {
            assert_eq!(EventMessage::decode(&message.encode()).unwrap(), message);
        }
    }

    #[test]
    fn test_unknown_tag_is_a_protocol_error() {
        assert!(Request::decode(&[0xFF]).is_err());
        assert!(Response::decode(&[0xFF]).is_err());
        assert!(EventMessage::decode(&[0xFF]).is_err());
    }
}

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

//! Memory-consistency and event tests over a two-node loopback cluster.

use dopencl::host::command_queue::{enqueue_broadcast_buffer, CommandQueue};
use dopencl::host::context::Context;
use dopencl::host::event::Event;
use dopencl::host::kernel::Kernel;
use dopencl::host::memory::Buffer;
use dopencl::host::program::Program;
use dopencl::transport::loopback;
use dopencl::types::{
    CL_COMPLETE, CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST, CL_MAP_READ, CL_MAP_WRITE,
    CL_MEM_COPY_HOST_PTR, CL_MEM_READ_WRITE, CL_PROFILING_COMMAND_END,
    CL_PROFILING_COMMAND_RECEIVED, CL_PROFILING_COMMAND_START, CL_PROFILING_COMMAND_SUBMIT,
    CL_QUEUE_PROFILING_ENABLE,
};
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

const VEC_SIZE: usize = 1024 * 1024;

// field order matters: queues and the context must tear down while the
// cluster connections are still alive
struct MultiNodeFixture {
    queues: Vec<Arc<CommandQueue>>,
    context: Arc<Context>,
    cluster: loopback::Cluster,
}

impl MultiNodeFixture {
    fn new(node_count: usize) -> Self {
        let cluster = loopback::cluster(node_count).unwrap();
        let context =
            Context::from_compute_nodes(&cluster.platform, cluster.platform.compute_nodes())
                .unwrap();
        let queues = cluster
            .platform
            .compute_nodes()
            .iter()
            .map(|node| {
                CommandQueue::create(&context, &node.devices()[0], CL_QUEUE_PROFILING_ENABLE)
                    .unwrap()
            })
            .collect();
        Self { cluster, context, queues }
    }

    fn rw_buffer(&self, size: usize) -> Arc<Buffer> {
        Buffer::create(&self.context, CL_MEM_READ_WRITE, size, ptr::null_mut()).unwrap()
    }
}

fn filled_vec(start: i32) -> Vec<i32> {
    (0..VEC_SIZE as i32).map(|i| i.wrapping_add(start)).collect()
}

#[test]
fn test_create_buffer_round_trip_with_copy_host_ptr() {
    let fixture = MultiNodeFixture::new(2);
    let vec_in = filled_vec(1);
    let buffer = Buffer::create(
        &fixture.context,
        CL_MEM_READ_WRITE | CL_MEM_COPY_HOST_PTR,
        VEC_SIZE * 4,
        vec_in.as_ptr() as *mut c_void,
    )
    .unwrap();

    // the initial contents must be visible on a remote node
    let mut vec_out = vec![0i32; VEC_SIZE];
    fixture.queues[1]
        .enqueue_read_buffer(&buffer, true, 0, &mut vec_out, &[])
        .unwrap();
    assert_eq!(vec_in, vec_out);
}

#[test]
fn test_map_for_write_then_read_from_second_queue() {
    let fixture = MultiNodeFixture::new(1);
    let queue = &fixture.queues[0];
    let other_queue =
        CommandQueue::create(&fixture.context, queue.device(), 0).unwrap();
    let buffer = fixture.rw_buffer(VEC_SIZE * 4);
    let vec_in = filled_vec(3);

    let (ptr, _map) = queue
        .enqueue_map_buffer(&buffer, true, CL_MAP_WRITE, 0, VEC_SIZE * 4, &[])
        .unwrap();
    unsafe {
        ptr::copy_nonoverlapping(vec_in.as_ptr(), ptr as *mut i32, VEC_SIZE);
    }
    let unmap = queue.enqueue_unmap_buffer(&buffer, ptr, &[]).unwrap();

    let mut vec_out = vec![0i32; VEC_SIZE];
    other_queue
        .enqueue_read_buffer(&buffer, true, 0, &mut vec_out, &[unmap.clone()])
        .unwrap();
    assert_eq!(vec_in, vec_out);
}

#[test]
fn test_map_for_read_sees_device_data() {
    let fixture = MultiNodeFixture::new(1);
    let queue = &fixture.queues[0];
    let buffer = fixture.rw_buffer(1024 * 4);
    let vec_in: Vec<i32> = (0..1024).map(|i| i * 3).collect();

    queue
        .enqueue_write_buffer(&buffer, true, 0, &vec_in, &[])
        .unwrap();

    let (ptr, _map) = queue
        .enqueue_map_buffer(&buffer, true, CL_MAP_READ, 0, 1024 * 4, &[])
        .unwrap();
    let mapped = unsafe { std::slice::from_raw_parts(ptr as *const i32, 1024) };
    assert_eq!(vec_in, mapped);

    let unmap = queue.enqueue_unmap_buffer(&buffer, ptr, &[]).unwrap();
    unmap.wait().unwrap();
}

#[test]
fn test_wait_for_events_blocks_the_queue() {
    let fixture = MultiNodeFixture::new(1);
    let queue = &fixture.queues[0];
    let buffer = fixture.rw_buffer(1024 * 4);
    let vec_in: Vec<i32> = (0..1024).collect();

    let write = queue
        .enqueue_write_buffer(&buffer, false, 0, &vec_in, &[])
        .unwrap();
    queue.enqueue_wait_for_events(&[write.clone()]).unwrap();

    // the queue is blocked until the write has finished, so no wait list
    // is needed for the read
    let mut vec_out = vec![0i32; 1024];
    queue
        .enqueue_read_buffer(&buffer, true, 0, &mut vec_out, &[])
        .unwrap();
    assert_eq!(vec_in, vec_out);
}

#[test]
fn test_cross_node_write_then_read() {
    let fixture = MultiNodeFixture::new(2);
    let buffer = fixture.rw_buffer(VEC_SIZE * 4);
    let vec_in = filled_vec(1);

    // upload on the first node
    let write = fixture.queues[0]
        .enqueue_write_buffer(&buffer, false, 0, &vec_in, &[])
        .unwrap();
    fixture.queues[0].flush().unwrap();

    // download on the second node, synchronised by the write event
    let mut vec_out = vec![0i32; VEC_SIZE];
    fixture.queues[1]
        .enqueue_read_buffer(&buffer, true, 0, &mut vec_out, &[write.clone()])
        .unwrap();
    assert_eq!(vec_in, vec_out);
}

#[test]
fn test_kernel_writes_then_remote_read() {
    let source = "__kernel void iota(__global int *v) { \
                  v[get_global_id(0)] = get_global_id(0); }";
    let fixture = MultiNodeFixture::new(2);
    let buffer = fixture.rw_buffer(VEC_SIZE * 4);

    let program = Program::create_from_source(&fixture.context, source).unwrap();
    program.build("").unwrap();
    let kernel = Kernel::create(&program, "iota").unwrap();
    kernel.set_arg_buffer(0, &buffer).unwrap();

    let init = fixture.queues[0]
        .enqueue_ndrange_kernel(&kernel, &[], &[VEC_SIZE], &[], &[])
        .unwrap();
    fixture.queues[0].flush().unwrap();

    let mut vec_out = vec![-1i32; VEC_SIZE];
    fixture.queues[1]
        .enqueue_read_buffer(&buffer, true, 0, &mut vec_out, &[init.clone()])
        .unwrap();
    let expected: Vec<i32> = (0..VEC_SIZE as i32).collect();
    assert_eq!(expected, vec_out);
}

#[test]
fn test_concurrent_cross_over_exchange() {
    let fixture = MultiNodeFixture::new(2);
    let buffer0 = fixture.rw_buffer(VEC_SIZE * 4);
    let buffer1 = fixture.rw_buffer(VEC_SIZE * 4);
    let vec_in0 = filled_vec(1);
    let vec_in1 = filled_vec(2);
    let mut vec_out0 = vec![0i32; VEC_SIZE];
    let mut vec_out1 = vec![0i32; VEC_SIZE];

    let write0 = fixture.queues[0]
        .enqueue_write_buffer(&buffer0, false, 0, &vec_in0, &[])
        .unwrap();
    let write1 = fixture.queues[1]
        .enqueue_write_buffer(&buffer1, false, 0, &vec_in1, &[])
        .unwrap();

    // read each buffer back on the other node, gated by the writes
    let read0 = fixture.queues[0]
        .enqueue_read_buffer(&buffer1, false, 0, &mut vec_out0, &[write1.clone()])
        .unwrap();
    let read1 = fixture.queues[1]
        .enqueue_read_buffer(&buffer0, false, 0, &mut vec_out1, &[write0.clone()])
        .unwrap();

    Event::wait_for_events(&[read0, read1]).unwrap();
    assert_eq!(vec_in1, vec_out0);
    assert_eq!(vec_in0, vec_out1);
}

#[test]
fn test_user_event_gates_write() {
    let fixture = MultiNodeFixture::new(1);
    let queue = &fixture.queues[0];
    let buffer = fixture.rw_buffer(1024 * 4);
    let vec_in: Vec<i32> = (0..1024).collect();

    let gate = Event::new_user(&fixture.context).unwrap();
    let write = queue
        .enqueue_write_buffer(&buffer, false, 0, &vec_in, &[gate.clone()])
        .unwrap();
    queue.flush().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let seen_status = Arc::new(AtomicI32::new(i32::MIN));
    {
        let fired = fired.clone();
        let seen_status = seen_status.clone();
        write
            .set_callback(CL_COMPLETE, move |status| {
                fired.fetch_add(1, Ordering::SeqCst);
                seen_status.store(status, Ordering::SeqCst);
            })
            .unwrap();
    }

    assert!(!write.is_complete());
    gate.set_status(CL_COMPLETE).unwrap();
    write.wait().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(seen_status.load(Ordering::SeqCst), CL_COMPLETE);

    let mut vec_out = vec![0i32; 1024];
    queue
        .enqueue_read_buffer(&buffer, true, 0, &mut vec_out, &[write.clone()])
        .unwrap();
    assert_eq!(vec_in, vec_out);
}

#[test]
fn test_failed_wait_list_event_terminates_dependents() {
    let fixture = MultiNodeFixture::new(1);
    let queue = &fixture.queues[0];
    let buffer = fixture.rw_buffer(1024 * 4);
    let vec_in: Vec<i32> = (0..1024).collect();

    let gate = Event::new_user(&fixture.context).unwrap();
    gate.set_status(-1).unwrap();

    let seen_status = Arc::new(AtomicI32::new(0));
    let write = queue
        .enqueue_write_buffer(&buffer, false, 0, &vec_in, &[gate.clone()])
        .unwrap();
    {
        let seen_status = seen_status.clone();
        write
            .set_callback(CL_COMPLETE, move |status| {
                seen_status.store(status, Ordering::SeqCst);
            })
            .unwrap();
    }

    assert!(write.wait().is_err());
    assert_eq!(
        write.command_execution_status(),
        CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST
    );
    assert_eq!(
        seen_status.load(Ordering::SeqCst),
        CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST
    );
}

#[test]
fn test_finish_completes_all_commands() {
    let fixture = MultiNodeFixture::new(2);
    let buffer = fixture.rw_buffer(VEC_SIZE * 4);
    let vec_in = filled_vec(7);

    let write = fixture.queues[0]
        .enqueue_write_buffer(&buffer, false, 0, &vec_in, &[])
        .unwrap();
    let marker = fixture.queues[0].enqueue_marker(&[]).unwrap();
    fixture.queues[0].finish().unwrap();

    assert!(write.is_complete());
    assert!(marker.is_complete());
}

#[test]
fn test_retain_release_is_a_no_op() {
    let fixture = MultiNodeFixture::new(1);
    let buffer = fixture.rw_buffer(4096);

    buffer.retain();
    assert_eq!(buffer.reference_count(), 2);
    buffer.release().unwrap();
    assert_eq!(buffer.reference_count(), 1);

    // the buffer is still fully usable
    let vec_in: Vec<i32> = (0..1024).collect();
    let mut vec_out = vec![0i32; 1024];
    fixture.queues[0]
        .enqueue_write_buffer(&buffer, true, 0, &vec_in, &[])
        .unwrap();
    fixture.queues[0]
        .enqueue_read_buffer(&buffer, true, 0, &mut vec_out, &[])
        .unwrap();
    assert_eq!(vec_in, vec_out);

    fixture.context.retain();
    assert_eq!(fixture.context.reference_count(), 2);
    fixture.context.release().unwrap();
    assert_eq!(fixture.context.reference_count(), 1);
}

#[test]
fn test_destructor_callbacks_run_before_deletion() {
    let fixture = MultiNodeFixture::new(1);
    let buffer = fixture.rw_buffer(4096);

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        buffer.set_destructor_callback(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    buffer.release().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_copy_buffer_and_barrier() {
    let fixture = MultiNodeFixture::new(1);
    let queue = &fixture.queues[0];
    let src = fixture.rw_buffer(1024 * 4);
    let dst = fixture.rw_buffer(1024 * 4);
    let vec_in: Vec<i32> = (0..1024).rev().collect();

    let write = queue
        .enqueue_write_buffer(&src, false, 0, &vec_in, &[])
        .unwrap();
    let copy = queue
        .enqueue_copy_buffer(&src, &dst, 0, 0, 1024 * 4, &[write.clone()])
        .unwrap();
    let barrier = queue.enqueue_barrier(&[copy.clone()]).unwrap();

    let mut vec_out = vec![0i32; 1024];
    queue
        .enqueue_read_buffer(&dst, true, 0, &mut vec_out, &[barrier.clone()])
        .unwrap();
    assert_eq!(vec_in, vec_out);
}

#[test]
fn test_event_profiling_is_ordered_and_in_daemon_domain() {
    let fixture = MultiNodeFixture::new(1);
    let queue = &fixture.queues[0];
    let buffer = fixture.rw_buffer(1024 * 4);
    let vec_in: Vec<i32> = (0..1024).collect();

    let write = queue
        .enqueue_write_buffer(&buffer, true, 0, &vec_in, &[])
        .unwrap();
    queue.finish().unwrap();

    let received = write.profiling_info(CL_PROFILING_COMMAND_RECEIVED).unwrap();
    let submit = write.profiling_info(CL_PROFILING_COMMAND_SUBMIT).unwrap();
    let start = write.profiling_info(CL_PROFILING_COMMAND_START).unwrap();
    let end = write.profiling_info(CL_PROFILING_COMMAND_END).unwrap();

    // the receipt-time skew puts every timestamp in the daemon clock domain
    assert!(received <= submit);
    assert!(submit <= start);
    assert!(start <= end);
}

#[test]
fn test_user_event_profiling_is_not_available() {
    let fixture = MultiNodeFixture::new(1);
    let user = Event::new_user(&fixture.context).unwrap();
    assert!(user.profiling_info(CL_PROFILING_COMMAND_SUBMIT).is_err());
    user.set_status(CL_COMPLETE).unwrap();
}

#[test]
fn test_broadcast_buffer_to_all_nodes() {
    let fixture = MultiNodeFixture::new(2);
    let vec_in = filled_vec(11);
    let src = Buffer::create(
        &fixture.context,
        CL_MEM_READ_WRITE | CL_MEM_COPY_HOST_PTR,
        VEC_SIZE * 4,
        vec_in.as_ptr() as *mut c_void,
    )
    .unwrap();
    let dsts = vec![fixture.rw_buffer(VEC_SIZE * 4), fixture.rw_buffer(VEC_SIZE * 4)];

    let broadcast = enqueue_broadcast_buffer(
        &fixture.queues,
        &src,
        &dsts,
        0,
        &[0, 0],
        VEC_SIZE * 4,
        &[],
    )
    .unwrap();
    broadcast.wait().unwrap();

    for (queue, dst) in fixture.queues.iter().zip(&dsts) {
        let mut vec_out = vec![0i32; VEC_SIZE];
        queue
            .enqueue_read_buffer(dst, true, 0, &mut vec_out, &[])
            .unwrap();
        assert_eq!(vec_in, vec_out);
    }
}

#[test]
fn test_task_runs_single_work_item() {
    let source = "__kernel void fill_int(__global int *v, int value) { \
                  v[get_global_id(0)] = value; }";
    let fixture = MultiNodeFixture::new(1);
    let queue = &fixture.queues[0];
    let buffer = fixture.rw_buffer(4);

    let program = Program::create_from_source(&fixture.context, source).unwrap();
    program.build("").unwrap();
    let kernel = Kernel::create(&program, "fill_int").unwrap();
    kernel.set_arg_buffer(0, &buffer).unwrap();
    kernel.set_arg_bytes(1, &42i32.to_ne_bytes()).unwrap();

    let task = queue.enqueue_task(&kernel, &[]).unwrap();

    let mut out = [0i32; 1];
    queue
        .enqueue_read_buffer(&buffer, true, 0, &mut out, &[task.clone()])
        .unwrap();
    assert_eq!(out[0], 42);
}

#[test]
fn test_wait_list_must_share_the_context() {
    let fixture = MultiNodeFixture::new(1);
    let other = MultiNodeFixture::new(1);
    let buffer = fixture.rw_buffer(4096);
    let foreign = Event::new_user(&other.context).unwrap();

    let mut out = vec![0u8; 4096];
    let result =
        fixture.queues[0].enqueue_read_buffer(&buffer, false, 0, &mut out, &[foreign.clone()]);
    assert!(result.is_err());
    foreign.set_status(CL_COMPLETE).unwrap();

    // keep both clusters alive until the end of the test
    drop(other);
    drop(fixture);
}

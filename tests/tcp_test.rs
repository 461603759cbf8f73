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

//! Single-node smoke test over the TCP transport: a daemon on an ephemeral
//! port, a host platform connected to it, and a buffer round trip.

use dopencl::daemon::Daemon;
use dopencl::host::command_queue::CommandQueue;
use dopencl::host::context::Context;
use dopencl::host::event::Event;
use dopencl::host::memory::Buffer;
use dopencl::host::platform::Platform;
use dopencl::native::software::SoftwarePlatform;
use dopencl::registry::Registry;
use dopencl::transport::{tcp, NodeConnection};
use dopencl::types::{CL_COMPLETE, CL_MEM_READ_WRITE};
use std::net::TcpListener;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn test_buffer_round_trip_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let daemon = Daemon::new(Arc::new(SoftwarePlatform::new()));
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        thread::spawn(move || {
            let _ = tcp::serve(daemon, listener, running);
        });
    }

    let registry = Arc::new(Registry::new());
    let connection: Arc<dyn NodeConnection> =
        tcp::connect(&address, registry.clone()).unwrap();
    let platform = Platform::from_connections(registry, vec![connection]).unwrap();

    let nodes = platform.compute_nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].devices().len(), 1);

    let context = Context::from_compute_nodes(&platform, nodes).unwrap();
    let queue = CommandQueue::create(&context, &nodes[0].devices()[0], 0).unwrap();
    let buffer =
        Buffer::create(&context, CL_MEM_READ_WRITE, 4096 * 4, ptr::null_mut()).unwrap();

    let vec_in: Vec<i32> = (0..4096).collect();
    let mut vec_out = vec![0i32; 4096];

    // gate the write on a user event to exercise the message channel
    let gate = Event::new_user(&context).unwrap();
    let write = queue
        .enqueue_write_buffer(&buffer, false, 0, &vec_in, &[gate.clone()])
        .unwrap();
    queue.flush().unwrap();
    gate.set_status(CL_COMPLETE).unwrap();

    queue
        .enqueue_read_buffer(&buffer, true, 0, &mut vec_out, &[write])
        .unwrap();
    assert_eq!(vec_in, vec_out);

    queue.finish().unwrap();
    running.store(false, Ordering::SeqCst);
}

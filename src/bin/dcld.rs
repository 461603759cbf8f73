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

//! The compute-node daemon.
//!
//! ```text
//! dcld [--platform <name>] [--daemonize] <hostname>
//! ```
//!
//! Serves the devices of one native OpenCL platform (or the built-in
//! software platform) to hosts connecting on `<hostname>`. In daemonised
//! mode the process forks twice, starts a new session, changes its working
//! directory, takes an exclusive lock on a PID file so only one instance
//! runs, and detaches the standard streams. `SIGINT`/`SIGTERM` shut the
//! daemon down gracefully; `SIGHUP` is ignored.

use dopencl::daemon::Daemon;
use dopencl::native;
use dopencl::protocol::DEFAULT_PORT;
use dopencl::transport::tcp;
use std::net::TcpListener;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Options {
    platform: Option<String>,
    daemonize: bool,
    hostname: String,
}

fn usage() {
    eprintln!("Usage: dcld [--platform <name>] [--daemonize] <hostname>");
}

fn parse_options(mut args: std::env::Args) -> Option<Options> {
    let _ = args.next(); // program name
    let mut platform = None;
    let mut daemonize = false;
    let mut hostname = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--platform" | "-p" => match args.next() {
                Some(name) => platform = Some(name),
                None => return None,
            },
            "--daemonize" | "-d" => daemonize = true,
            "--help" => {
                usage();
                std::process::exit(0);
            }
            _ if hostname.is_none() && !arg.starts_with('-') => hostname = Some(arg),
            _ => return None,
        }
    }
    Some(Options { platform, daemonize, hostname: hostname? })
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_terminate(_signal: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let terminate = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGINT, &terminate);
        let _ = sigaction(Signal::SIGTERM, &terminate);
        let _ = sigaction(Signal::SIGHUP, &ignore);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

/// Classic double-fork daemonisation with a PID-file lock.
#[cfg(unix)]
fn daemonize() -> Result<(), String> {
    unsafe {
        match libc::fork() {
            -1 => return Err("cannot fork daemon process".into()),
            0 => {}
            _ => std::process::exit(0), // parent
        }
        if libc::setsid() < 0 {
            return Err("failed to create session".into());
        }
        match libc::fork() {
            -1 => return Err("second fork failed".into()),
            0 => {}
            _ => std::process::exit(0),
        }
        if libc::chdir(c"/tmp".as_ptr()) < 0 {
            return Err("cannot change working directory".into());
        }
        libc::umask(0);

        // one instance only: take an exclusive lock on the PID file
        let lock_file =
            libc::open(c"/tmp/dcld.lock".as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o640 as libc::c_uint);
        if lock_file < 0 {
            return Err("cannot open lock file".into());
        }
        if libc::lockf(lock_file, libc::F_TLOCK, 0) < 0 {
            // another instance is already running
            std::process::exit(0);
        }
        let pid = format!("{}\n", libc::getpid());
        libc::write(lock_file, pid.as_ptr() as *const libc::c_void, pid.len());

        // detach the standard streams
        libc::close(libc::STDIN_FILENO);
        libc::close(libc::STDOUT_FILENO);
        libc::close(libc::STDERR_FILENO);
        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        libc::dup(null); // stdout
        libc::dup(null); // stderr
    }
    Ok(())
}

#[cfg(not(unix))]
fn daemonize() -> Result<(), String> {
    Err("daemonised mode is not supported on this platform".into())
}

fn main() -> ExitCode {
    env_logger::init();

    let options = match parse_options(std::env::args()) {
        Some(options) => options,
        None => {
            usage();
            return ExitCode::FAILURE;
        }
    };

    if options.daemonize {
        if let Err(err) = daemonize() {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    }
    install_signal_handlers();

    let platform = match native::select_platform(options.platform.as_deref()) {
        Ok(platform) => platform,
        Err(err) => {
            eprintln!("platform not found: {err}");
            return ExitCode::FAILURE;
        }
    };

    let address = if options.hostname.contains(':') {
        options.hostname.clone()
    } else {
        format!("{}:{DEFAULT_PORT}", options.hostname)
    };
    let listener = match TcpListener::bind(&address) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("cannot listen on {address}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let daemon = Daemon::new(platform);
    let running = Arc::new(AtomicBool::new(true));
    {
        // poll the shutdown flag set by the signal handler
        let running = running.clone();
        std::thread::spawn(move || {
            while !SHUTDOWN.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    match tcp::serve(daemon, listener, running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

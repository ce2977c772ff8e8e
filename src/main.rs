// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod args;
mod dnssd;
mod error;
mod framer;
mod hotplug;
mod tcp;
mod usb;
mod worker;

use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::args::{Args, PortSelection};
use crate::dnssd::DnssdPublisher;
use crate::error::{Error, Result};
use crate::hotplug::UnplugDetector;
use crate::tcp::TcpListeners;
use crate::usb::{discover_interfaces, read_device_id, select_device, set_device_config, UsbPool};

/// Set by the signal handlers and consulted everywhere a loop needs to know
/// whether it's time to wind down.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// How long the accept loop waits for in-flight workers to finish on their
/// own before abandoning them.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub(crate) enum ShutdownReason {
    Error,
    Signal,
    Unplugged,
}

extern "C" fn on_terminate_signal(_: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_terminate_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Safe because the handler only stores to an AtomicBool, which is
    // signal-safe, and touches no other process state.
    unsafe {
        signal::sigaction(Signal::SIGINT, &action).map_err(Error::Poll)?;
        signal::sigaction(Signal::SIGTERM, &action).map_err(Error::Poll)?;
    }
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };
    if args.use_syslog {
        syslog::init_unix(syslog::Facility::LOG_USER, level).map_err(Error::Syslog)?;
    } else {
        env_logger::Builder::new().filter_level(level).init();
    }
    Ok(())
}

/// Builds a `UsbPool` for the first conformant device matching `args`'
/// filters: selects it, switches it to its IPP-over-USB configuration, and
/// discovers its interfaces. Also returns the device's IEEE-1284 device ID,
/// used for the mDNS-SD TXT record.
fn open_usb(args: &Args) -> Result<(Arc<UsbPool>, String)> {
    let context = rusb::Context::new().map_err(Error::CreateContext)?;
    let device_list = rusb::DeviceList::new_with_context(context).map_err(Error::DeviceList)?;

    let device = select_device(&device_list, &args.device_filter, args.serial.as_deref())?;
    info!(
        "Selected device {}:{}",
        device.bus_number(),
        device.address()
    );

    let (config, interfaces) = discover_interfaces(&device)?;
    let handle = device.open().map_err(Error::OpenDevice)?;
    if let Err(err) = set_device_config(&handle, config) {
        warn!("Failed to switch device configuration: {}", err);
    }

    let device_id = read_device_id(&handle, config, &interfaces[0])
        .unwrap_or_else(|err| {
            warn!("Failed to read IEEE-1284 device ID: {}", err);
            String::new()
        });

    let pool = Arc::new(UsbPool::new(handle, interfaces, &SHUTDOWN));
    Ok((pool, device_id))
}

fn fork_to_background() -> Result<()> {
    // Safe: fork() has no preconditions here, and the child returns to
    // run() normally while the parent exits immediately below.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Fork(std::io::Error::last_os_error()));
    }
    if pid > 0 {
        print!("{}|", pid);
        std::io::stdout().flush().ok();
        std::process::exit(0);
    }
    Ok(())
}

fn run() -> Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    let args = match args::parse(&argv)? {
        None => return Ok(()),
        Some(args) => args,
    };

    init_logging(&args)?;

    // Safe because the syscall doesn't touch any memory and always succeeds.
    unsafe { libc::umask(0o117) };

    let usb_info = if args.no_printer {
        None
    } else {
        Some(open_usb(&args)?)
    };

    let (from_port, only_port) = match args.port {
        PortSelection::Only(p) => (p, Some(p)),
        PortSelection::From(p) => (p, None),
    };
    let listeners = TcpListeners::bind(&args.interface, only_port, from_port)?;
    info!("Listening on port {}", listeners.port);

    print!("{}|", listeners.port);
    std::io::stdout().flush().ok();

    if !args.no_fork {
        fork_to_background()?;
    }

    install_signal_handlers()?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<ShutdownReason>();

    let pool = usb_info.as_ref().map(|(pool, _)| pool.clone());
    let _unplug = match (&pool, rusb::has_hotplug()) {
        (Some(pool), true) => {
            let device = pool.device_handle().device();
            match UnplugDetector::new(device, shutdown_tx.clone(), &SHUTDOWN) {
                Ok(detector) => Some(detector),
                Err(err) => {
                    warn!("Failed to register hotplug callback: {}", err);
                    None
                }
            }
        }
        _ => None,
    };

    let dnssd = if args.no_broadcast {
        None
    } else {
        let device_id = usb_info.as_ref().map(|(_, id)| id.as_str()).unwrap_or("");
        let host_ip: IpAddr = if args.interface == "lo" || args.interface == "lo0" {
            IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
        };
        match DnssdPublisher::register(
            listeners.port,
            device_id,
            args.interface == "lo" || args.interface == "lo0",
            host_ip,
            shutdown_tx.clone(),
        ) {
            Ok(publisher) => Some(publisher),
            Err(err) => {
                warn!("Failed to publish mDNS-SD advertisement: {}", err);
                None
            }
        }
    };

    let mut client_num: usize = 0;
    let mut workers: Vec<std::thread::JoinHandle<()>> = Vec::new();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        if let Ok(reason) = shutdown_rx.try_recv() {
            info!("Shutdown requested: {:?}", reason);
            break;
        }

        let conn = match listeners.accept(&SHUTDOWN) {
            Some(conn) => conn,
            None => break,
        };

        client_num += 1;
        let worker_pool = pool.clone();
        match std::thread::Builder::new()
            .name(format!("bridge-worker-{}", client_num))
            .spawn(move || worker::run(conn, worker_pool, &SHUTDOWN))
        {
            Ok(handle) => workers.push(handle),
            Err(err) => error!("Failed to spawn worker thread: {}", err),
        }
        workers.retain(|h| !h.is_finished());
    }

    SHUTDOWN.store(true, Ordering::Relaxed);
    info!(
        "Shutting down; waiting up to {:?} for {} worker thread(s)",
        WORKER_SHUTDOWN_GRACE,
        workers.len()
    );
    let deadline = Instant::now() + WORKER_SHUTDOWN_GRACE;
    while workers.iter().any(|h| !h.is_finished()) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    let (finished, unfinished): (Vec<_>, Vec<_>) = workers.into_iter().partition(|h| h.is_finished());
    for handle in finished {
        if let Err(err) = handle.join() {
            error!("Worker thread panicked: {:?}", err);
        }
    }
    if !unfinished.is_empty() {
        warn!(
            "{} worker thread(s) still running after the grace period; abandoning them",
            unfinished.len()
        );
    }

    drop(dnssd);
    drop(_unplug);
    drop(pool);
    Ok(())
}

fn main() {
    // Use run() instead of returning a Result from main() so errors print
    // via Display instead of Debug.
    if let Err(err) = run() {
        let code = match &err {
            Error::ParseArgs(parse_err) => parse_err.exit_code(),
            _ => 1,
        };
        error!("{}", err);
        std::process::exit(code);
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command-line parsing for the bridge binary.
//!
//! The flag table and the three distinct failure exit codes (bad port,
//! port out of range, malformed `--bus-device`) mirror the original
//! `ippusbxd` getopt_long table.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    Getopts(getopts::Fail),
    BadPort,
    PortOutOfRange,
    BadBusDevice,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Getopts(err) => write!(f, "{}", err),
            Error::BadPort => write!(f, "port must be a non-negative number"),
            Error::PortOutOfRange => write!(f, "port must be <= 65535"),
            Error::BadBusDevice => write!(f, "--bus-device must be of the form BUS:DEVICE"),
        }
    }
}

impl Error {
    /// Process exit code for this failure, per the externally specified CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::BadPort => 1,
            Error::PortOutOfRange => 2,
            Error::BadBusDevice => 3,
            Error::Getopts(_) => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum PortSelection {
    /// Bind exactly to this port or fail (`--only-port`).
    Only(u16),
    /// Bind at or above this port, trying upward (`--from-port`).
    From(u16),
}

impl Default for PortSelection {
    fn default() -> Self {
        PortSelection::From(0)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DeviceFilter {
    /// Match on vendor id, product id and/or serial number.
    Ids {
        vendor_id: Option<u16>,
        product_id: Option<u16>,
    },
    /// Match on an exact bus/device pair.
    BusDevice(u8, u8),
    /// No filter: pick the first conformant device found.
    Any,
}

#[derive(Debug, Clone)]
pub struct Args {
    pub device_filter: DeviceFilter,
    pub serial: Option<String>,
    pub port: PortSelection,
    pub interface: String,
    pub use_syslog: bool,
    pub verbose: bool,
    pub no_fork: bool,
    pub no_broadcast: bool,
    pub no_printer: bool,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            device_filter: DeviceFilter::Any,
            serial: None,
            port: PortSelection::default(),
            interface: "lo".to_string(),
            use_syslog: false,
            verbose: false,
            no_fork: false,
            no_broadcast: false,
            no_printer: false,
        }
    }
}

fn parse_hex_u16(s: &str) -> Option<u16> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(s, 16).ok()
}

/// Parses a port argument, distinguishing "not a number / negative" from
/// "valid number but exceeds u16::MAX" so the two documented exit codes stay
/// reachable.
fn parse_port(s: &str) -> Result<u16, Error> {
    let value: i64 = s.parse().map_err(|_| Error::BadPort)?;
    if value < 0 {
        return Err(Error::BadPort);
    }
    u16::try_from(value).map_err(|_| Error::PortOutOfRange)
}

fn parse_bus_device(s: &str) -> Result<(u8, u8), Error> {
    let (bus, device) = s.split_once(':').ok_or(Error::BadBusDevice)?;
    let bus: u8 = bus.parse().map_err(|_| Error::BadBusDevice)?;
    let device: u8 = device.parse().map_err(|_| Error::BadBusDevice)?;
    Ok((bus, device))
}

fn usage(program: &str, opts: &getopts::Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

/// Parses `argv`. Returns `Ok(None)` when `--help` was given (usage already
/// printed, caller should exit 0 without doing anything else).
pub fn parse(argv: &[String]) -> Result<Option<Args>, Error> {
    let mut opts = getopts::Options::new();
    opts.optopt("v", "vid", "Vendor id filter (hex)", "HEX");
    opts.optopt("m", "pid", "Product id filter (hex)", "HEX");
    opts.optopt("s", "serial", "Serial-number filter", "STR");
    opts.optopt("b", "bus", "Bus filter (decimal)", "BUS");
    opts.optopt("D", "device", "Device filter (decimal)", "DEVICE");
    opts.optopt("", "bus-device", "Bus/device filter BUS:DEVICE", "B:D");
    opts.optopt("p", "only-port", "Bind exactly to this port or fail", "N");
    opts.optopt("P", "from-port", "Bind at or above this port", "N");
    opts.optopt("i", "interface", "Interface to bind (default lo)", "NAME");
    opts.optflag("l", "logging", "Send logs to syslog");
    opts.optflag("q", "verbose", "Verbose tracing");
    opts.optflag("d", "debug", "Verbose + no fork");
    opts.optflag("n", "no-fork", "Foreground mode");
    opts.optflag("B", "no-broadcast", "Skip mDNS publication");
    opts.optflag("N", "no-printer", "Serve a stub page, no USB");
    opts.optflag("h", "help", "Print this help message");

    let matches = opts.parse(&argv[1..]).map_err(Error::Getopts)?;

    if matches.opt_present("h") {
        usage(&argv[0], &opts);
        return Ok(None);
    }

    let mut args = Args::default();

    let vendor_id = matches.opt_str("v").map(|s| parse_hex_u16(&s)).flatten();
    let product_id = matches.opt_str("m").map(|s| parse_hex_u16(&s)).flatten();
    let bus = matches.opt_str("b").and_then(|s| s.parse::<u8>().ok());
    let device = matches.opt_str("D").and_then(|s| s.parse::<u8>().ok());

    args.device_filter = if let Some(bus_device) = matches.opt_str("bus-device") {
        let (b, d) = parse_bus_device(&bus_device)?;
        DeviceFilter::BusDevice(b, d)
    } else if let (Some(b), Some(d)) = (bus, device) {
        DeviceFilter::BusDevice(b, d)
    } else if vendor_id.is_some() || product_id.is_some() {
        DeviceFilter::Ids {
            vendor_id,
            product_id,
        }
    } else {
        DeviceFilter::Any
    };
    args.serial = matches.opt_str("s");

    if let Some(port) = matches.opt_str("p") {
        args.port = PortSelection::Only(parse_port(&port)?);
    } else if let Some(port) = matches.opt_str("P") {
        args.port = PortSelection::From(parse_port(&port)?);
    }

    if let Some(interface) = matches.opt_str("i") {
        args.interface = interface;
    }

    args.use_syslog = matches.opt_present("l");
    args.verbose = matches.opt_present("q") || matches.opt_present("d");
    args.no_fork = matches.opt_present("n") || matches.opt_present("d");
    args.no_broadcast = matches.opt_present("B");
    args.no_printer = matches.opt_present("N");

    Ok(Some(args))
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    // Argument parsing.
    ParseArgs(crate::args::Error),

    // Logging / process setup.
    Syslog(syslog::Error),

    // USB device discovery and pool management.
    ClaimInterface(u8, rusb::Error),
    DetachDrivers(u8, rusb::Error),
    DeviceList(rusb::Error),
    OpenDevice(rusb::Error),
    ReadConfigDescriptor(rusb::Error),
    ReadDeviceDescriptor(rusb::Error),
    RegisterCallback(rusb::Error),
    SetActiveConfig(rusb::Error),
    SetAlternateSetting(u8, rusb::Error),
    NoDevice,
    NoFreeInterface,
    NotIppUsb,
    Conformance,
    Poll(nix::Error),
    CreateContext(rusb::Error),

    // TCP / framing.
    CreateSocket(io::Error),
    BindFailed(io::Error),
    Malformed(String),
    BufferExhausted,
    StreamClosed,

    // Supervisor.
    Fork(io::Error),

    // mDNS-SD.
    Dnssd(mdns_sd::Error),
}

impl std::error::Error for Error {}

impl From<crate::args::Error> for Error {
    fn from(err: crate::args::Error) -> Self {
        Error::ParseArgs(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            ParseArgs(err) => write!(f, "Failed to parse arguments: {}", err),
            Syslog(err) => write!(f, "Failed to initialize syslog: {}", err),
            ClaimInterface(i, err) => write!(f, "Failed to claim interface {}: {}", i, err),
            DetachDrivers(i, err) => write!(
                f,
                "Failed to detach kernel driver for interface {}: {}",
                i, err
            ),
            DeviceList(err) => write!(f, "Failed to read device list: {}", err),
            OpenDevice(err) => write!(f, "Failed to open device: {}", err),
            ReadConfigDescriptor(err) => write!(f, "Failed to read config descriptor: {}", err),
            ReadDeviceDescriptor(err) => write!(f, "Failed to read device descriptor: {}", err),
            RegisterCallback(err) => write!(f, "Failed to register for hotplug callback: {}", err),
            SetActiveConfig(err) => write!(f, "Failed to set active config: {}", err),
            SetAlternateSetting(i, err) => write!(
                f,
                "Failed to set interface {} alternate setting: {}",
                i, err
            ),
            NoDevice => write!(f, "No valid IPP-over-USB device found."),
            NoFreeInterface => write!(f, "There is no free IPP-over-USB interface to claim."),
            NotIppUsb => write!(f, "The specified device is not an IPP-over-USB device."),
            Conformance => write!(
                f,
                "Device exposes exactly one IPP-over-USB interface, which violates the spec."
            ),
            Poll(err) => write!(f, "Error polling shutdown fd: {}", err),
            CreateContext(err) => write!(f, "Failed to create USB context: {}", err),
            CreateSocket(err) => write!(f, "Failed to create socket: {}", err),
            BindFailed(err) => write!(f, "Failed to bind TCP listener: {}", err),
            Malformed(reason) => write!(f, "Malformed HTTP message: {}", reason),
            BufferExhausted => write!(f, "Packet buffer exceeded the 64 MiB cap"),
            StreamClosed => write!(f, "Stream closed before message completion"),
            Fork(err) => write!(f, "Failed to fork: {}", err),
            Dnssd(err) => write!(f, "mDNS-SD error: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

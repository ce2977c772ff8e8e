// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! USB device discovery and the interface pool.
//!
//! Grounded on the claim/release and endpoint-discovery logic of the
//! upstream `usb_connector.rs` InterfaceManager, reshaped around the four
//! distinct synchronization primitives the bridge's pool design calls for
//! instead of that implementation's single cleanup-thread/Condvar design.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rusb::{Context, DeviceHandle, UsbContext};

use crate::args::DeviceFilter;
use crate::error::{Error, Result};
use crate::framer::{HttpFramer, Message, Packet};

pub const IPPUSB_CLASS: u8 = 0x07;
pub const IPPUSB_SUBCLASS: u8 = 0x01;
pub const IPPUSB_PROTOCOL: u8 = 0x04;

/// Consecutive zero-byte reads before a held connection is flagged staled.
pub const STALE_THRESHOLD: u32 = 6;
/// Upper bound on how long a single acquired connection may sit idle before
/// the printer is treated as crashed.
pub const CRASH_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 6);
/// Per-transfer USB timeout.
const USB_TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);
/// How long `UsbPool::acquire` waits on exhaustion before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);
/// Bound on retries when claiming a kernel-busy interface (Design Notes:
/// no unbounded spin-retry).
const CLAIM_RETRY_LIMIT: u32 = 30;
const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One IPP-over-USB alternate setting on the device.
#[derive(Debug, Clone, Copy)]
pub struct UsbInterface {
    pub interface_number: u8,
    pub alt_setting: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
    pub max_packet_size: u16,
}

fn is_ippusb_interface(desc: &rusb::InterfaceDescriptor) -> bool {
    desc.class_code() == IPPUSB_CLASS
        && desc.sub_class_code() == IPPUSB_SUBCLASS
        && desc.protocol_code() == IPPUSB_PROTOCOL
}

/// Switches the device to `new_config`, temporarily detaching kernel
/// drivers bound to non-IPP-USB interfaces of the current config so the
/// switch itself doesn't fail, then best-effort reattaching them.
pub fn set_device_config<T: UsbContext>(handle: &DeviceHandle<T>, new_config: u8) -> Result<()> {
    let cur_config = handle
        .device()
        .active_config_descriptor()
        .map_err(Error::ReadConfigDescriptor)?;

    let mut restore_interfaces = Vec::new();
    for interface in cur_config.interfaces() {
        let is_ippusb = interface.descriptors().any(|d| is_ippusb_interface(&d));
        if !is_ippusb {
            match handle.kernel_driver_active(interface.number()) {
                Ok(false) => continue,
                Err(err) => return Err(Error::DetachDrivers(interface.number(), err)),
                _ => {}
            }
            restore_interfaces.push(interface.number());
        }

        match handle.detach_kernel_driver(interface.number()) {
            Err(err) if err != rusb::Error::NotFound => {
                return Err(Error::DetachDrivers(interface.number(), err));
            }
            _ => {}
        }
    }

    debug!(
        "Switching from configuration {} to {}",
        cur_config.number(),
        new_config
    );
    handle
        .set_active_configuration(new_config)
        .map_err(Error::SetActiveConfig)?;

    for inum in restore_interfaces {
        handle
            .attach_kernel_driver(inum)
            .unwrap_or_else(|err| warn!("Failed to reattach driver for interface {}: {}", inum, err));
    }

    Ok(())
}

/// Scans `device`'s configurations for the first one exposing at least two
/// IPP-over-USB interfaces, each with a bulk IN and bulk OUT endpoint.
/// Returns the chosen config value and the discovered interfaces.
pub fn discover_interfaces<T: UsbContext>(
    device: &rusb::Device<T>,
) -> Result<(u8, Vec<UsbInterface>)> {
    let device_desc = device.device_descriptor().map_err(Error::ReadDeviceDescriptor)?;

    for config_index in 0..device_desc.num_configurations() {
        let config = match device.config_descriptor(config_index) {
            Ok(c) => c,
            Err(_) => continue,
        };

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            'alternates: for alt in interface.descriptors() {
                if !is_ippusb_interface(&alt) {
                    continue;
                }
                let mut endpoint_in = None;
                let mut endpoint_out = None;
                let mut max_packet_size = 0;
                for ep in alt.endpoint_descriptors() {
                    if ep.transfer_type() != rusb::TransferType::Bulk {
                        continue;
                    }
                    max_packet_size = ep.max_packet_size();
                    match ep.direction() {
                        rusb::Direction::In => endpoint_in = Some(ep.address()),
                        rusb::Direction::Out => endpoint_out = Some(ep.address()),
                    }
                }
                if let (Some(endpoint_in), Some(endpoint_out)) = (endpoint_in, endpoint_out) {
                    interfaces.push(UsbInterface {
                        interface_number: alt.interface_number(),
                        alt_setting: alt.setting_number(),
                        endpoint_in,
                        endpoint_out,
                        max_packet_size,
                    });
                    // Only the first matching alternate per interface counts.
                    break 'alternates;
                }
            }
        }

        if interfaces.len() >= 2 {
            return Ok((config.number(), interfaces));
        } else if interfaces.len() == 1 {
            return Err(Error::Conformance);
        }
    }

    Err(Error::NotIppUsb)
}

/// Selects the device matching `filter` among `device_list`, preferring the
/// first one that conforms to the IPP-over-USB interface requirement when
/// no specific selector narrows it down.
pub fn select_device<T: UsbContext + Clone>(
    device_list: &rusb::DeviceList<T>,
    filter: &DeviceFilter,
    serial: Option<&str>,
) -> Result<rusb::Device<T>> {
    for device in device_list.iter() {
        let matches = match filter {
            DeviceFilter::BusDevice(bus, addr) => {
                device.bus_number() == *bus && device.address() == *addr
            }
            DeviceFilter::Ids {
                vendor_id,
                product_id,
            } => {
                let desc = match device.device_descriptor() {
                    Ok(d) => d,
                    Err(_) => continue,
                };
                let vendor_ok = vendor_id.map_or(true, |v| desc.vendor_id() == v);
                let product_ok = product_id.map_or(true, |p| desc.product_id() == p);
                if !vendor_ok || !product_ok {
                    continue;
                }
                if let Some(serial) = serial {
                    matches_serial(&device, &desc, serial)
                } else {
                    true
                }
            }
            DeviceFilter::Any => discover_interfaces(&device).is_ok(),
        };

        if matches && discover_interfaces(&device).is_ok() {
            return Ok(device);
        }
    }
    Err(Error::NoDevice)
}

fn matches_serial<T: UsbContext>(
    device: &rusb::Device<T>,
    desc: &rusb::DeviceDescriptor,
    serial: &str,
) -> bool {
    let handle = match device.open() {
        Ok(h) => h,
        Err(_) => return false,
    };
    let timeout = Duration::from_millis(500);
    let languages = handle.read_languages(timeout).unwrap_or_default();
    let language = match languages.first() {
        Some(l) => *l,
        None => return false,
    };
    handle
        .read_serial_number_string(language, desc, timeout)
        .map(|s| s == serial)
        .unwrap_or(false)
}

/// Fetches the IEEE-1284 device ID string via a class/interface control
/// transfer. The first two bytes are a length prefix, nominally big-endian;
/// devices that get this backwards are accommodated by falling back to a
/// little-endian read when the big-endian value is out of range.
pub fn read_device_id<T: UsbContext>(
    handle: &DeviceHandle<T>,
    config: u8,
    interface: &UsbInterface,
) -> Result<String> {
    const REQUEST_TYPE: u8 = rusb::request_type(
        rusb::Direction::In,
        rusb::RequestType::Class,
        rusb::Recipient::Interface,
    );
    const BUF_LEN: usize = 2048;
    let mut buf = [0u8; BUF_LEN];
    let index = (u16::from(interface.interface_number) << 8) | u16::from(interface.alt_setting);

    let read = handle
        .read_control(
            REQUEST_TYPE,
            0,
            u16::from(config),
            index,
            &mut buf,
            USB_TRANSFER_TIMEOUT,
        )
        .map_err(|_| Error::NotIppUsb)?;

    if read < 2 {
        return Err(Error::Malformed("device id response too short".into()));
    }

    let be_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let len = if (14..=read).contains(&be_len) {
        be_len
    } else {
        let le_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if (14..=read).contains(&le_len) {
            le_len
        } else {
            read
        }
    };

    Ok(String::from_utf8_lossy(&buf[2..len.min(read)]).into_owned())
}

/// A simple counting semaphore built on Mutex+Condvar, used for the pool's
/// low-priority (capacity N-1) and high-priority (capacity 1) slots. Kept
/// as its own type rather than folded into the pool-manage mutex: the
/// Design Notes call out that collapsing these reintroduces the
/// priority-inversion the split avoids.
struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    fn new(capacity: usize) -> Self {
        Semaphore {
            count: Mutex::new(capacity),
            cv: Condvar::new(),
        }
    }

    /// Blocks until a permit is available or `timeout` elapses or
    /// `terminate` is observed set; returns whether a permit was acquired.
    fn acquire_timeout(&self, timeout: Duration, terminate: &AtomicBool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            if terminate.load(Ordering::Relaxed) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .cv
                .wait_timeout(count, deadline - now)
                .expect("semaphore mutex poisoned");
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
    }

    fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

struct PoolManage {
    free: VecDeque<usize>,
    num_taken: usize,
    num_staled: usize,
}

/// Arbitrates acquisition of the device's IPP-over-USB interfaces across
/// concurrently running BridgeWorkers.
pub struct UsbPool {
    handle: DeviceHandle<Context>,
    interfaces: Vec<UsbInterface>,
    interface_locks: Vec<Mutex<()>>,
    manage: Mutex<PoolManage>,
    low_priority: Semaphore,
    high_priority: Semaphore,
    terminate: &'static AtomicBool,
}

impl UsbPool {
    pub fn new(
        handle: DeviceHandle<Context>,
        interfaces: Vec<UsbInterface>,
        terminate: &'static AtomicBool,
    ) -> Self {
        let n = interfaces.len();
        let free = (0..n).collect();
        let interface_locks = interfaces.iter().map(|_| Mutex::new(())).collect();
        UsbPool {
            handle,
            interfaces,
            interface_locks,
            manage: Mutex::new(PoolManage {
                free,
                num_taken: 0,
                num_staled: 0,
            }),
            low_priority: Semaphore::new(n.saturating_sub(1)),
            high_priority: Semaphore::new(1),
            terminate,
        }
    }

    pub fn num_total(&self) -> usize {
        self.interfaces.len()
    }

    pub fn device_handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    /// Acquires one interface, honoring the priority reservation described
    /// in the pool design: Normal takes a low-priority permit (capacity
    /// N-1, always leaving one interface for High); High takes the
    /// high-priority permit first and immediately trades it for a normal
    /// one if one is free without blocking, so it never starves a slot a
    /// Normal caller could have used.
    pub fn acquire(self: &std::sync::Arc<Self>, priority: Priority) -> Result<UsbConn> {
        let (holds_high, holds_low) = match priority {
            Priority::Normal => {
                if !self.low_priority.acquire_timeout(ACQUIRE_TIMEOUT, self.terminate) {
                    return Err(Error::NoFreeInterface);
                }
                (false, true)
            }
            Priority::High => {
                if !self
                    .high_priority
                    .acquire_timeout(ACQUIRE_TIMEOUT, self.terminate)
                {
                    return Err(Error::NoFreeInterface);
                }
                if self.low_priority.try_acquire() {
                    self.high_priority.release();
                    (false, true)
                } else {
                    (true, false)
                }
            }
        };

        let index = match self.claim_one() {
            Ok(index) => index,
            Err(err) => {
                if holds_low {
                    self.low_priority.release();
                }
                if holds_high {
                    self.high_priority.release();
                }
                return Err(err);
            }
        };

        Ok(UsbConn {
            pool: self.clone(),
            index,
            is_high_priority: holds_high,
            holds_low,
            is_staled: false,
            idle_since: None,
            consecutive_empty_reads: 0,
        })
    }

    /// Selects a free interface, detaches any conflicting kernel driver
    /// (best-effort; failure is non-fatal), claims it, and applies its alt
    /// setting. Claim retries a bounded number of times on transient busy,
    /// consulting the termination flag between attempts per Design Notes.
    fn claim_one(&self) -> Result<usize> {
        let index = {
            let mut manage = self.manage.lock().unwrap();
            let index = manage.free.pop_front().ok_or(Error::NoFreeInterface)?;
            manage.num_taken += 1;
            index
        };

        let iface = &self.interfaces[index];
        let _sentinel = self.interface_locks[index].lock().unwrap();

        if self.handle.kernel_driver_active(iface.interface_number).unwrap_or(false) {
            if let Err(err) = self.handle.detach_kernel_driver(iface.interface_number) {
                warn!("Failed to detach kernel driver for interface {}: {}", iface.interface_number, err);
            }
        }

        let mut attempt = 0;
        loop {
            match self.handle.claim_interface(iface.interface_number) {
                Ok(()) => break,
                Err(rusb::Error::Busy) if attempt < CLAIM_RETRY_LIMIT => {
                    if self.terminate.load(Ordering::Relaxed) {
                        self.release_slot(index);
                        return Err(Error::NoDevice);
                    }
                    attempt += 1;
                    std::thread::sleep(CLAIM_RETRY_DELAY);
                }
                Err(err) => {
                    self.release_slot(index);
                    return Err(Error::ClaimInterface(iface.interface_number, err));
                }
            }
        }

        if let Err(err) = self
            .handle
            .set_alternate_setting(iface.interface_number, iface.alt_setting)
        {
            let _ = self.handle.release_interface(iface.interface_number);
            self.release_slot(index);
            return Err(Error::SetAlternateSetting(iface.interface_number, err));
        }

        Ok(index)
    }

    fn release_slot(&self, index: usize) {
        let mut manage = self.manage.lock().unwrap();
        manage.free.push_back(index);
        manage.num_taken = manage.num_taken.saturating_sub(1);
    }

    fn release_interface(&self, index: usize, was_staled: bool) {
        let iface = &self.interfaces[index];
        let _sentinel = self.interface_locks[index].lock().unwrap();
        if let Err(err) = self.handle.release_interface(iface.interface_number) {
            warn!("Failed to release interface {}: {}", iface.interface_number, err);
        }
        let _ = self.handle.attach_kernel_driver(iface.interface_number);

        let mut manage = self.manage.lock().unwrap();
        manage.free.push_back(index);
        manage.num_taken = manage.num_taken.saturating_sub(1);
        if was_staled {
            manage.num_staled = manage.num_staled.saturating_sub(1);
        }
    }

    fn mark_staled(&self, now_staled: bool, was_staled: bool) {
        if now_staled == was_staled {
            return;
        }
        let mut manage = self.manage.lock().unwrap();
        if now_staled {
            manage.num_staled += 1;
        } else {
            manage.num_staled = manage.num_staled.saturating_sub(1);
        }
    }

    fn all_staled(&self) -> bool {
        let manage = self.manage.lock().unwrap();
        manage.num_taken > 0 && manage.num_staled >= manage.num_taken
    }
}

/// An acquired handle pairing one BridgeWorker with one `UsbInterface`.
/// Release is guaranteed by `Drop` on every exit path.
pub struct UsbConn {
    pool: std::sync::Arc<UsbPool>,
    index: usize,
    pub is_high_priority: bool,
    holds_low: bool,
    pub is_staled: bool,
    idle_since: Option<Instant>,
    consecutive_empty_reads: u32,
}

impl UsbConn {
    fn interface(&self) -> &UsbInterface {
        &self.pool.interfaces[self.index]
    }

    /// Repeated bulk OUT transfers until all of `pkt`'s filled bytes are
    /// delivered. Retries on per-call timeout up to a cumulative
    /// `CRASH_TIMEOUT`; `NoDevice` is fatal and propagated immediately.
    pub fn send(&mut self, pkt: &Packet) -> Result<()> {
        let iface = *self.interface();
        let data = pkt.bytes();
        let mut sent = 0;
        let started = Instant::now();
        while sent < data.len() {
            match self
                .pool
                .handle
                .write_bulk(iface.endpoint_out, &data[sent..], USB_TRANSFER_TIMEOUT)
            {
                Ok(n) => {
                    sent += n;
                    trace!("Sent {} bytes on interface {}", n, iface.interface_number);
                }
                Err(rusb::Error::Timeout) => {
                    if started.elapsed() > CRASH_TIMEOUT {
                        return Err(Error::StreamClosed);
                    }
                }
                Err(rusb::Error::NoDevice) => return Err(Error::NoDevice),
                Err(err) => return Err(Error::ClaimInterface(iface.interface_number, err)),
            }
        }
        Ok(())
    }

    /// Reads one Packet's worth of bytes for `msg`, padding the request to a
    /// multiple of the endpoint's max packet size and tracking staleness on
    /// zero-byte reads. Returns the packet once the framer is satisfied or
    /// the connection is judged crashed.
    pub fn recv(&mut self, msg: &mut Message) -> Result<Packet> {
        let iface = *self.interface();
        let mut pkt = msg.new_packet();
        let round_start = Instant::now();

        loop {
            let pending = HttpFramer::pending_bytes(msg, &mut pkt)?;
            if pending == 0 || pkt.is_completed() {
                break;
            }

            let mps = if iface.max_packet_size == 0 {
                512
            } else {
                iface.max_packet_size as usize
            };
            let padded = pending.div_ceil(mps) * mps;
            let mut buf = vec![0u8; padded];

            match self
                .pool
                .handle
                .read_bulk(iface.endpoint_in, &mut buf, USB_TRANSFER_TIMEOUT)
            {
                Ok(0) => {
                    self.consecutive_empty_reads += 1;
                    if self.idle_since.is_none() {
                        self.idle_since = Some(Instant::now());
                    }
                    let was_staled = self.is_staled;
                    self.is_staled = self.consecutive_empty_reads >= STALE_THRESHOLD;
                    self.pool.mark_staled(self.is_staled, was_staled);

                    if self.is_staled
                        && self.pool.all_staled()
                        && self.idle_since.map_or(false, |t| t.elapsed() > CRASH_TIMEOUT)
                    {
                        if pkt.filled() > 0 {
                            return Ok(pkt);
                        }
                        return Err(Error::NoDevice);
                    }
                }
                Ok(n) => {
                    self.consecutive_empty_reads = 0;
                    self.idle_since = None;
                    let was_staled = self.is_staled;
                    self.is_staled = false;
                    self.pool.mark_staled(false, was_staled);

                    let fit = n.min(pending);
                    pkt.copy_in(&buf[..fit]);
                    HttpFramer::mark_received(msg, &mut pkt, fit);
                }
                Err(rusb::Error::Timeout) => {
                    if round_start.elapsed() > CRASH_TIMEOUT {
                        return Err(Error::StreamClosed);
                    }
                }
                Err(rusb::Error::NoDevice) => return Err(Error::NoDevice),
                Err(err) => return Err(Error::ClaimInterface(iface.interface_number, err)),
            }
        }

        Ok(pkt)
    }
}

impl Drop for UsbConn {
    fn drop(&mut self) {
        if self.holds_low {
            self.pool.low_priority.release();
        }
        if self.is_high_priority {
            self.pool.high_priority.release();
        }
        self.pool.release_interface(self.index, self.is_staled);
        debug!("Released interface {}", self.interface().interface_number);
    }
}

// Convenience adapters so a UsbConn can be used with std::io-style helpers
// where the bridge worker wants to treat it as a plain byte sink/source for
// framing-agnostic glue code (kept thin; the framer-driven send/recv above
// are the real interface).
impl Write for UsbConn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let iface = *self.interface();
        self.pool
            .handle
            .write_bulk(iface.endpoint_out, buf, USB_TRANSFER_TIMEOUT)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Read for UsbConn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let iface = *self.interface();
        self.pool
            .handle
            .read_bulk(iface.endpoint_in, buf, USB_TRANSFER_TIMEOUT)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

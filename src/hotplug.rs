// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Watches for the bridged device being unplugged, grounded on the
//! original `UnplugDetector`'s libusb hotplug callback and dedicated
//! event-pump thread. The upstart/usbguard delayed-shutdown handshake is
//! dropped along with the D-Bus link it depended on; unplug always
//! triggers an immediate shutdown here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use rusb::{Context, Registration, UsbContext};

use crate::error::{Error, Result};
use crate::ShutdownReason;

/// Bounded wait passed to `handle_events`, so the pump thread re-checks
/// `event_thread_run` periodically instead of blocking until an event
/// fires.
const EVENT_PUMP_TIMEOUT: Duration = Duration::from_millis(500);

pub struct UnplugDetector {
    event_thread_run: Arc<AtomicBool>,
    // Always Some until the destructor runs.
    registration: Option<Registration<Context>>,
    event_thread: Option<std::thread::JoinHandle<()>>,
}

impl UnplugDetector {
    pub fn new(
        device: rusb::Device<Context>,
        shutdown_event: Sender<ShutdownReason>,
        shutdown: &'static AtomicBool,
    ) -> Result<Self> {
        let context = device.context().clone();
        let handler = CallbackHandler::new(device, shutdown_event, shutdown);
        let registration = rusb::HotplugBuilder::new()
            .enumerate(false)
            .register(&context, Box::new(handler))
            .map_err(Error::RegisterCallback)?;

        // Spawn a thread to pump plug/unplug events. handle_events blocks
        // until an event arrives; dropping the registration in our own
        // Drop impl below synthesizes an unplug event to wake it promptly.
        let run = Arc::new(AtomicBool::new(true));
        let thread_run = run.clone();
        let event_thread = std::thread::spawn(move || {
            while thread_run.load(Ordering::Relaxed) {
                if let Err(err) = context.handle_events(Some(EVENT_PUMP_TIMEOUT)) {
                    error!("Failed to handle libusb events: {}", err);
                }
            }
            info!("Shutting down libusb event thread.");
        });

        Ok(Self {
            event_thread_run: run,
            registration: Some(registration),
            event_thread: Some(event_thread),
        })
    }
}

impl Drop for UnplugDetector {
    fn drop(&mut self) {
        self.event_thread_run.store(false, Ordering::Relaxed);

        // The callback is unregistered when the registration is dropped.
        drop(self.registration.take().unwrap());

        let t = self.event_thread.take().unwrap();
        t.join()
            .unwrap_or_else(|e| error!("Failed to join event thread: {:?}", e));
    }
}

struct CallbackHandler {
    device: rusb::Device<Context>,
    shutdown_event: Sender<ShutdownReason>,
    shutdown_requested: &'static AtomicBool,
}

impl CallbackHandler {
    fn new(
        device: rusb::Device<Context>,
        shutdown_event: Sender<ShutdownReason>,
        shutdown_requested: &'static AtomicBool,
    ) -> Self {
        Self {
            device,
            shutdown_event,
            shutdown_requested,
        }
    }
}

impl rusb::Hotplug<Context> for CallbackHandler {
    fn device_arrived(&mut self, _device: rusb::Device<Context>) {
        // Do nothing.
    }

    fn device_left(&mut self, device: rusb::Device<Context>) {
        if device == self.device {
            info!("Device was unplugged, shutting down");
            self.shutdown_requested.store(true, Ordering::Relaxed);
            if let Err(err) = self.shutdown_event.send(ShutdownReason::Unplugged) {
                error!("Failed to trigger shutdown: {}", err);
            }
        }
    }
}

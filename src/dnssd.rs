// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! mDNS-SD publication of the bridged printer.
//!
//! The TXT keys, subtypes, and PDL-derivation rules are grounded on the
//! original `bonjour.c`'s `register_printer()`; the transport here is the
//! `mdns-sd` crate's threaded daemon rather than a libavahi client, since
//! the bridge no longer links against avahi.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use mdns_sd::{DaemonEvent, ServiceDaemon, ServiceInfo};

use crate::error::{Error, Result};
use crate::ShutdownReason;

/// Bounded wait on the daemon event channel, so the monitor thread re-checks
/// its run flag periodically instead of blocking forever.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Clone)]
pub struct DeviceIdFields {
    pub make: String,
    pub model: String,
    pub serial: Option<String>,
    pub command_set: String,
}

/// Parses a semicolon-delimited IEEE-1284 device ID string, accepting both
/// the short (`MFG:`/`MDL:`/`SN:`/`CMD:`) and long
/// (`MANUFACTURER:`/`MODEL:`/`SERIALNUMBER:`/`COMMAND SET:`) key forms.
pub fn parse_device_id(id: &str) -> DeviceIdFields {
    let mut fields = DeviceIdFields::default();
    for field in id.split(';') {
        let field = field.trim();
        let (key, value) = match field.split_once(':') {
            Some(kv) => kv,
            None => continue,
        };
        let key = key.trim().to_ascii_uppercase();
        let value = value.trim().to_string();
        match key.as_str() {
            "MFG" | "MANUFACTURER" => fields.make = value,
            "MDL" | "MODEL" => fields.model = value,
            "SN" | "SERN" | "SERIALNUMBER" => fields.serial = Some(value),
            "CMD" | "COMMAND SET" => fields.command_set = value,
            _ => {}
        }
    }
    fields
}

struct Formats {
    pdl: String,
    apple_raster: bool,
    pwg_raster: bool,
}

fn derive_formats(command_set: &str) -> Formats {
    let lower = command_set.to_ascii_lowercase();
    let apple_raster = lower.contains("urf") || (lower.contains("apple") && lower.contains("raster"));
    let pwg_raster = lower.contains("pwg-raster") || lower.contains("pwg raster");
    let pdf = lower.contains("pdf");
    let jpeg = lower.contains("jpeg") || lower.contains("jpg");
    let pclm = lower.contains("pclm");

    let mut formats = Vec::new();
    if pdf {
        formats.push("application/pdf");
    }
    if pwg_raster {
        formats.push("image/pwg-raster");
    }
    if apple_raster {
        formats.push("image/urf");
    }
    if pclm {
        formats.push("application/PCLm");
    }
    if jpeg {
        formats.push("image/jpeg");
    }

    Formats {
        pdl: formats.join(","),
        apple_raster,
        pwg_raster,
    }
}

/// Builds and republishes the printer's `_ipp._tcp`, `_printer._tcp`, and
/// `_http._tcp` advertisements.
pub struct DnssdPublisher {
    daemon: ServiceDaemon,
    fullnames: Vec<String>,
    monitor_run: Arc<AtomicBool>,
    monitor_thread: Option<std::thread::JoinHandle<()>>,
}

impl DnssdPublisher {
    pub fn register(
        port: u16,
        device_id: &str,
        interface_is_loopback: bool,
        host_ip: std::net::IpAddr,
        shutdown_event: Sender<ShutdownReason>,
    ) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(Error::Dnssd)?;
        let fields = parse_device_id(device_id);
        let formats = derive_formats(&fields.command_set);

        let instance = match &fields.serial {
            Some(serial) if !serial.is_empty() => format!("{} [{}]", fields.model, serial),
            _ => fields.model.clone(),
        };
        let host = format!("{}.local.", instance.replace(' ', "-"));
        let ip = host_ip.to_string();

        let mut txt: HashMap<String, String> = HashMap::new();
        txt.insert("rp".into(), "ipp/print".into());
        txt.insert("ty".into(), format!("{} {}", fields.make, fields.model));
        txt.insert("product".into(), format!("({})", fields.model));
        txt.insert("pdl".into(), formats.pdl.clone());
        txt.insert("Color".into(), "U".into());
        txt.insert("Duplex".into(), "U".into());
        txt.insert("usb_MFG".into(), fields.make.clone());
        txt.insert("usb_MDL".into(), fields.model.clone());
        if formats.apple_raster {
            txt.insert(
                "URF".into(),
                "CP1,IS1-5-7,MT1-2-3-4-5-6-8-9-10-11-12-13,RS300,SRGB24,V1.4,W8,DM1".into(),
            );
        }
        txt.insert("priority".into(), "60".into());
        txt.insert("txtvers".into(), "1".into());
        txt.insert("qtotal".into(), "1".into());
        if interface_is_loopback {
            txt.insert("adminurl".into(), format!("http://localhost:{}/", port));
        }

        let ipp_subtype = if formats.apple_raster && !formats.pwg_raster {
            "_universal._sub._ipp._tcp.local."
        } else {
            "_print._sub._ipp._tcp.local."
        };
        let http_subtype = "_printer._sub._http._tcp.local.";

        let mut fullnames = Vec::new();

        // `_printer._tcp` reserves the name; no TXT record, port 0.
        let printer_info = ServiceInfo::new(
            "_printer._tcp.local.",
            &instance,
            &host,
            ip.as_str(),
            0,
            None,
        )
        .map_err(Error::Dnssd)?;
        fullnames.push(printer_info.get_fullname().to_string());
        daemon.register(printer_info).map_err(Error::Dnssd)?;

        let ipp_info = ServiceInfo::new(
            ipp_subtype,
            &instance,
            &host,
            ip.as_str(),
            port,
            Some(txt),
        )
        .map_err(Error::Dnssd)?
        .enable_addr_auto();
        let ipp_fullname = ipp_info.get_fullname().to_string();
        fullnames.push(ipp_fullname);
        daemon.register(ipp_info).map_err(Error::Dnssd)?;
        info!("Registered {} with subtype {}", instance, ipp_subtype);

        let http_info = ServiceInfo::new(
            http_subtype,
            &instance,
            &host,
            ip.as_str(),
            port,
            None,
        )
        .map_err(Error::Dnssd)?;
        fullnames.push(http_info.get_fullname().to_string());
        daemon.register(http_info).map_err(Error::Dnssd)?;
        info!("Registered {} with subtype {}", instance, http_subtype);

        // The underlying daemon probes for name conflicts and re-announces
        // under a suffixed name itself; what's left for us to watch for is
        // the avahi-style client/group failure cases (daemon gone, fatal
        // error) that call for tearing the whole advertisement down. See
        // `monitor_events` below.
        let monitor_run = Arc::new(AtomicBool::new(true));
        let thread_run = monitor_run.clone();
        let events = daemon.monitor().map_err(Error::Dnssd)?;
        let monitor_thread = std::thread::spawn(move || {
            monitor_events(&events, &thread_run, &shutdown_event)
        });

        Ok(DnssdPublisher {
            daemon,
            fullnames,
            monitor_run,
            monitor_thread: Some(monitor_thread),
        })
    }

    /// Unregisters all published services. Called on shutdown and on
    /// host-name collision before re-registering under a new name.
    pub fn unregister(&self) {
        for fullname in &self.fullnames {
            if let Err(err) = self.daemon.unregister(fullname) {
                warn!("Failed to unregister {}: {:?}", fullname, err);
            }
        }
    }
}

impl Drop for DnssdPublisher {
    fn drop(&mut self) {
        self.monitor_run.store(false, Ordering::Relaxed);
        if let Some(t) = self.monitor_thread.take() {
            t.join()
                .unwrap_or_else(|e| error!("Failed to join mDNS-SD monitor thread: {:?}", e));
        }
        self.unregister();
        let _ = self.daemon.shutdown();
    }
}

/// Watches `ServiceDaemon`'s event channel for the lifetime of the
/// advertisement, mapping its events onto the avahi client/group state
/// machine this module is grounded on: `Announce` covers both the
/// collision-triggered rename and the normal registering-complete case,
/// since the daemon re-probes and re-announces under a new name by itself;
/// `Error` covers both a disconnected daemon and a group failure, since the
/// daemon gives us no way to distinguish "reconnect" from "give up" here, so
/// either one is treated as fatal to this advertisement and reported up so
/// the supervisor can shut down cleanly.
fn monitor_events(
    events: &mpsc::Receiver<DaemonEvent>,
    run: &AtomicBool,
    shutdown_event: &Sender<ShutdownReason>,
) {
    while run.load(Ordering::Relaxed) {
        match events.recv_timeout(MONITOR_POLL_INTERVAL) {
            Ok(DaemonEvent::Announce(service_type, fullname)) => {
                info!("mDNS-SD re-announced {} ({})", fullname, service_type);
            }
            Ok(DaemonEvent::Error(err)) => {
                error!("mDNS-SD daemon reported a fatal error: {:?}", err);
                if let Err(err) = shutdown_event.send(ShutdownReason::Error) {
                    error!("Failed to trigger shutdown: {}", err);
                }
                break;
            }
            Ok(other) => debug!("mDNS-SD daemon event: {:?}", other),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("mDNS-SD daemon event channel disconnected; treating as daemon loss");
                if let Err(err) = shutdown_event.send(ShutdownReason::Error) {
                    error!("Failed to trigger shutdown: {}", err);
                }
                break;
            }
        }
    }
    info!("Shutting down mDNS-SD monitor thread.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_form_device_id() {
        let fields = parse_device_id("MFG:Acme;MDL:Laser9000;SN:12345;CMD:PDF,URF;");
        assert_eq!(fields.make, "Acme");
        assert_eq!(fields.model, "Laser9000");
        assert_eq!(fields.serial.as_deref(), Some("12345"));
        assert_eq!(fields.command_set, "PDF,URF");
    }

    #[test]
    fn parses_long_form_device_id() {
        let fields = parse_device_id(
            "MANUFACTURER:Acme;MODEL:Laser9000;SERIALNUMBER:12345;COMMAND SET:PDF;",
        );
        assert_eq!(fields.make, "Acme");
        assert_eq!(fields.model, "Laser9000");
        assert_eq!(fields.serial.as_deref(), Some("12345"));
    }

    #[test]
    fn derives_apple_raster_from_urf() {
        let formats = derive_formats("PDF,URF");
        assert!(formats.apple_raster);
        assert!(formats.pdl.contains("application/pdf"));
        assert!(formats.pdl.contains("image/urf"));
    }

    #[test]
    fn derives_pwg_raster() {
        let formats = derive_formats("PWG-RASTER");
        assert!(formats.pwg_raster);
        assert!(!formats.apple_raster);
    }
}

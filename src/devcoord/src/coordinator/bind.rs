// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::Path;
use std::sync::Arc;

use super::Coordinator;
use crate::counters;
use crate::device::{BindRetry, Device, DeviceFlags, DeviceId, DeviceSpec, PendingOp, PendingOperation};
use crate::devhost::Devhost;
use crate::driver::{self, Driver};
use crate::error::{Error, Result, Status};
use crate::rpc::{HostRequest, LaunchSpec};
use crate::timer::TimerEvent;

impl Coordinator {
    /// Load a driver manifest into the registry. Once the coordinator runs,
    /// the new driver is offered to every existing device.
    pub fn load_driver(&mut self, path: &Path) -> Result<Arc<Driver>> {
        let driver = driver::load_driver(path)?;
        self.register_driver(driver)
    }

    pub fn register_driver(&mut self, driver: Driver) -> Result<Arc<Driver>> {
        let driver = self.drivers.insert(driver)?;
        info!(
            sl!(),
            "loaded driver {} from {}",
            driver.name(),
            driver.libname()
        );
        if self.running {
            self.bind_new_driver(&driver);
        }
        Ok(driver)
    }

    /// Load the explicitly configured manifests, then every manifest found
    /// in the search paths. Failures are logged and skipped. Returns the
    /// number of drivers loaded.
    pub fn load_configured_drivers(&mut self) -> usize {
        let mut loaded = 0;
        for path in self.config.load_drivers.clone() {
            match self.load_driver(&path) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(sl!(), "cannot load driver {}: {}", path.display(), e),
            }
        }

        for dir in self.config.driver_search_paths.clone() {
            let found = driver::find_loadable_drivers(&dir, |path, e| {
                warn!(sl!(), "skipping driver {}: {}", path.display(), e);
            });
            let found = match found {
                Ok(found) => found,
                Err(e) => {
                    warn!(sl!(), "cannot scan {}: {}", dir.display(), e);
                    continue;
                }
            };
            for driver in found {
                match self.register_driver(driver) {
                    Ok(_) => loaded += 1,
                    Err(e) => warn!(sl!(), "cannot register driver from {}: {}", dir.display(), e),
                }
            }
        }
        loaded
    }

    fn bind_new_driver(&mut self, driver: &Arc<Driver>) {
        for id in self.devices.ids() {
            let matches = match self.devices.get(id) {
                Ok(dev) => dev.is_bindable() && driver.is_bindable_to(dev, true),
                Err(_) => false,
            };
            if matches {
                if let Err(e) = self.bind_driver(id, driver) {
                    warn!(sl!(), "failed to bind {} to {}: {}", driver.name(), id, e);
                }
            }
        }
    }

    /// Offer the device to the registered drivers in evaluation order. The
    /// first match wins; MULTI_BIND devices are offered every match.
    pub(crate) fn autobind(&mut self, id: DeviceId) {
        for driver in self.drivers.drivers() {
            let (matches, multi) = match self.devices.get(id) {
                Ok(dev) if dev.is_bindable() => (
                    driver.is_bindable_to(dev, true),
                    dev.flags.contains(DeviceFlags::MULTI_BIND),
                ),
                _ => return,
            };
            if !matches {
                continue;
            }
            match self.bind_driver(id, &driver) {
                Ok(()) if !multi => return,
                Ok(()) => {}
                Err(e) => warn!(sl!(), "failed to bind {} to {}: {}", driver.name(), id, e),
            }
        }
    }

    /// Explicit bind requested by a devhost. An empty name asks for autobind.
    pub fn bind_device(&mut self, id: DeviceId, name: &str) -> Result<()> {
        let dev = self.devices.get(id)?;
        if dev.is_dead() {
            return Err(Error::BadState(format!("{} is dead", dev.name)));
        }
        if name.is_empty() {
            self.autobind(id);
            return Ok(());
        }
        let driver = self.drivers.find(name)?;
        if !driver.is_bindable_to(dev, false) {
            return Err(Error::NotSupported(format!(
                "driver {} does not bind to {}",
                driver.name(),
                dev.name
            )));
        }
        self.bind_driver(id, &driver)
    }

    /// Ask a devhost to load `driver` for the device. Isolated devices get a
    /// new devhost and a proxy first; the driver is loaded against the proxy.
    pub fn bind_driver(&mut self, id: DeviceId, driver: &Arc<Driver>) -> Result<()> {
        let dev = self.devices.get(id)?;
        if dev.is_dead() {
            return Err(Error::BadState(format!("{} is dead", dev.name)));
        }
        if dev.flags.contains(DeviceFlags::INVISIBLE) {
            return Err(Error::BadState(format!("{} is invisible", dev.name)));
        }
        if !dev.is_bindable() {
            return Err(Error::AlreadyExists(format!(
                "{} is already bound to {}",
                dev.name,
                dev.bound_driver().unwrap_or("a driver")
            )));
        }

        let target = if dev.flags.contains(DeviceFlags::MUST_ISOLATE) {
            self.prepare_proxy(id)?
        } else {
            id
        };
        let host = self.devices.get(target)?.host.ok_or_else(|| {
            Error::BadState(format!("{} has no devhost to bind {}", id, driver.name()))
        })?;

        let txid = self.next_txid();
        self.devices.get_mut(target)?.pending.try_reserve(1)?;
        self.devhosts.get(host)?.send(HostRequest::BindDriver {
            txid,
            device: target,
            libname: driver.libname().to_string(),
        })?;
        self.counters.incr(counters::BIND_REQUESTS);

        self.devices.get_mut(target)?.pending.push_back(PendingOperation {
            txid,
            op: PendingOp::Bind {
                driver: driver.name().to_string(),
            },
        });
        self.devices.get_mut(id)?.mark_bound(driver.name());
        info!(sl!(), "binding {} to {} in {}", driver.name(), id, host);
        Ok(())
    }

    /// Create the proxy and devhost for an isolated device, once.
    pub(crate) fn prepare_proxy(&mut self, id: DeviceId) -> Result<DeviceId> {
        let dev = self.devices.get(id)?;
        if let Some(proxy) = dev.proxy {
            if self.devices.get(proxy).map_or(false, |p| !p.is_dead()) {
                return Ok(proxy);
            }
        }

        let name = format!("devhost:{}", dev.name);
        let parent_host = dev.host;
        let spec = DeviceSpec {
            name: dev.name.clone(),
            libname: dev.libname.clone(),
            args: dev.args.clone(),
            protocol_id: dev.protocol_id,
            props: dev.props.clone(),
            flags: DeviceFlags::PROXY,
        };

        let host = self.devhosts.insert_with(|h| Devhost::new(h, &name));
        let launched = self.launcher.launch(&LaunchSpec {
            devhost: host,
            name: name.clone(),
            parent: parent_host,
        });
        let launched = match launched {
            Ok(launched) => launched,
            Err(e) => {
                self.devhosts.remove(host)?;
                error!(sl!(), "failed to launch {}: {}", name, e);
                return Err(e);
            }
        };
        self.counters.incr(counters::DEVHOSTS_LAUNCHED);

        {
            let dh = self.devhosts.get_mut(host)?;
            dh.set_channel(launched.channel);
            dh.set_process(launched.process);
            dh.set_koid(launched.koid);
            dh.set_parent(parent_host);
        }
        if let Some(parent_host) = parent_host {
            self.devhosts.get_mut(parent_host)?.add_child(host);
        }

        let retry = BindRetry::new(self.config.bind_retries, self.config.bind_backoff());
        let libname = spec.libname.clone();
        let args = spec.args.clone();
        let protocol_id = spec.protocol_id;
        let proxy = self
            .devices
            .insert_with(|p| Device::new(p, spec, Some(id), Some(host), retry));
        self.devhosts.get_mut(host)?.add_device(proxy);
        self.devices.get_mut(id)?.proxy = Some(proxy);
        info!(sl!(), "launched {} ({}) with proxy {} for {}", name, launched.koid, proxy, id);

        let txid = self.next_txid();
        let create = if libname.is_empty() {
            HostRequest::CreateDeviceStub {
                txid,
                device: proxy,
                protocol_id,
            }
        } else {
            HostRequest::CreateDevice {
                txid,
                device: proxy,
                libname,
                args,
                protocol_id,
            }
        };
        self.devhosts.get(host)?.send(create)?;

        if let Some(parent_host) = parent_host {
            let txid = self.next_txid();
            self.devhosts.get(parent_host)?.send(HostRequest::ConnectProxy {
                txid,
                device: id,
                proxy,
            })?;
        }
        Ok(proxy)
    }

    /// A devhost answered a bind request queued on `target`.
    pub(crate) fn bind_completed(&mut self, target: DeviceId, driver: &str, status: Status) {
        let id = match self.devices.get(target) {
            // A proxy that lost its channel is being torn down; its removal
            // decides whether the isolated device is bound again.
            Ok(dev) if dev.is_proxy() && status.is_err() && !dev.is_rpc_open() => return,
            Ok(dev) if dev.is_proxy() => match dev.parent {
                Some(parent) => parent,
                None => return,
            },
            Ok(_) => target,
            Err(_) => return,
        };
        let dev = match self.devices.get_mut(id) {
            Ok(dev) if !dev.is_dead() => dev,
            _ => return,
        };

        match status {
            Ok(()) => {
                dev.retry.reset();
                info!(sl!(), "bound {} to {}", driver, dev.name);
            }
            Err(e) => {
                warn!(sl!(), "driver {} failed to bind to {}: {}", driver, dev.name, e);
                dev.mark_unbound();
                self.counters.incr(counters::BIND_FAILURES);
                self.schedule_retry(id, driver);
            }
        }
        self.notify_modified(id);
    }

    /// Consume one retry and arm the backoff timer, or give up.
    fn schedule_retry(&mut self, id: DeviceId, driver: &str) {
        let dev = match self.devices.get_mut(id) {
            Ok(dev) => dev,
            Err(_) => return,
        };
        match dev.retry.on_failure() {
            Some(delay) => {
                debug!(sl!(), "retrying {} on {} in {:?}", driver, dev.name, delay);
                self.scheduler.schedule(
                    delay,
                    TimerEvent::BindRetry {
                        device: id,
                        driver: driver.to_string(),
                    },
                );
            }
            None => {
                dev.bind_failed = true;
                error!(
                    sl!(),
                    "giving up binding {} to {} after {} retries",
                    driver,
                    dev.name,
                    self.config.bind_retries
                );
            }
        }
    }

    /// The proxy of an isolated device went away with its devhost.
    pub(crate) fn schedule_rebind(&mut self, id: DeviceId) {
        let driver = match self.devices.get_mut(id) {
            Ok(dev) if !dev.is_dead() => {
                let driver = dev.bound_driver.clone().unwrap_or_default();
                dev.mark_unbound();
                driver
            }
            _ => return,
        };
        self.notify_modified(id);
        self.schedule_retry(id, &driver);
    }

    pub(crate) fn retry_bind(&mut self, id: DeviceId, driver: &str) {
        match self.devices.get(id) {
            Ok(dev) if dev.is_bindable() => {}
            _ => return,
        }
        let result = match self.drivers.find(driver) {
            Ok(driver) => self.bind_driver(id, &driver),
            Err(_) => {
                self.autobind(id);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(sl!(), "retry of {} on {} failed: {}", driver, id, e);
            if let Ok(dev) = self.devices.get_mut(id) {
                dev.mark_unbound();
            }
            self.counters.incr(counters::BIND_FAILURES);
            self.schedule_retry(id, driver);
        }
    }
}

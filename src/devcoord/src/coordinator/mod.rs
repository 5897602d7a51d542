// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The coordinator context: device tree, devhost set and driver registry.
//!
//! All state is mutated from a single dispatch context (see
//! [`crate::service::CoordinatorService`]); nothing here locks.

mod bind;
mod dispatch;
mod suspend;

use std::collections::VecDeque;
use std::fmt::Write as _;

use crate::arena::Arena;
use crate::config::CoordinatorConfig;
use crate::counters::{self, Counters};
use crate::device::{
    BindRetry, Device, DeviceFlags, DeviceId, DeviceSpec, Metadata, DEVICE_NAME_MAX,
    DEVICE_PROPS_MAX,
};
use crate::devfs::Devfs;
use crate::devhost::{Devhost, DevhostId};
use crate::driver::DriverRegistry;
use crate::error::{Error, Result};
use crate::power::PowerRequest;
use crate::protocol::{PROTOCOL_MISC_PARENT, PROTOCOL_ROOT, PROTOCOL_TEST_PARENT};
use crate::rpc::{DevhostLauncher, HostRequest, Txid};
use crate::suspend::SuspendContext;
use crate::timer::Scheduler;

/// How a removal was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RemoveMode {
    /// Requested by the coordinator or an administrator; the devhost is told.
    Requested,
    /// Requested by the devhost running the device.
    HostRequest,
    /// The devhost or the device channel is gone.
    Forced,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    devices: Arena<DeviceId, Device>,
    devhosts: Arena<DevhostId, Devhost>,
    drivers: DriverRegistry,
    root: DeviceId,
    misc: DeviceId,
    sys: DeviceId,
    test: DeviceId,
    suspend: Option<SuspendContext>,
    next_suspend: u64,
    next_txid: Txid,
    running: bool,
    launcher: Box<dyn DevhostLauncher>,
    scheduler: Box<dyn Scheduler>,
    devfs: Box<dyn Devfs>,
    counters: Counters,
    power_requests: VecDeque<PowerRequest>,
}

impl Coordinator {
    /// Build the coordinator and its four immortal devices: `root` and, below
    /// it, `misc`, `sys` and `test`.
    pub fn new(
        config: CoordinatorConfig,
        launcher: Box<dyn DevhostLauncher>,
        scheduler: Box<dyn Scheduler>,
        devfs: Box<dyn Devfs>,
    ) -> Result<Self> {
        let counters = Counters::new()?;
        let mut devices = Arena::new("device");
        let retry = BindRetry::new(config.bind_retries, config.bind_backoff());
        let immortal = DeviceFlags::IMMORTAL | DeviceFlags::MUST_ISOLATE;

        let root = devices.insert_with(|id| {
            Device::new(
                id,
                DeviceSpec::new("root", PROTOCOL_ROOT)
                    .with_flags(immortal | DeviceFlags::MULTI_BIND),
                None,
                None,
                retry.clone(),
            )
        });
        let mut child_of_root = |spec: DeviceSpec| {
            devices.insert_with(|id| Device::new(id, spec, Some(root), None, retry.clone()))
        };
        let misc = child_of_root(
            DeviceSpec::new("misc", PROTOCOL_MISC_PARENT)
                .with_flags(immortal | DeviceFlags::MULTI_BIND),
        );
        let sys = child_of_root(
            DeviceSpec::new("sys", 0)
                .with_flags(immortal)
                .with_libname(config.sys_device_driver.as_deref().unwrap_or_default()),
        );
        let test = child_of_root(
            DeviceSpec::new("test", PROTOCOL_TEST_PARENT)
                .with_flags(immortal | DeviceFlags::MULTI_BIND),
        );
        devices.get_mut(root)?.children = vec![misc, sys, test];

        let mut coordinator = Coordinator {
            config,
            devices,
            devhosts: Arena::new("devhost"),
            drivers: DriverRegistry::new(),
            root,
            misc,
            sys,
            test,
            suspend: None,
            next_suspend: 1,
            next_txid: 1,
            running: false,
            launcher,
            scheduler,
            devfs,
            counters,
            power_requests: VecDeque::new(),
        };
        for id in [root, misc, sys, test] {
            coordinator.publish_devfs(id)?;
        }
        Ok(coordinator)
    }

    /// Launch the `sys` devhost and offer the registered drivers to the
    /// coordinator-owned devices.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::BadState("coordinator already started".to_string()));
        }
        self.running = true;
        info!(sl!(), "starting coordinator with {} drivers", self.drivers.len());

        if !self.devices.get(self.sys)?.libname.is_empty() {
            if let Err(e) = self.prepare_proxy(self.sys) {
                error!(sl!(), "failed to create sys devhost: {}", e);
            }
        }
        for id in [self.root, self.misc, self.test] {
            self.autobind(id);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn root(&self) -> DeviceId {
        self.root
    }

    pub fn misc(&self) -> DeviceId {
        self.misc
    }

    pub fn sys(&self) -> DeviceId {
        self.sys
    }

    pub fn test(&self) -> DeviceId {
        self.test
    }

    pub fn device(&self, id: DeviceId) -> Result<&Device> {
        self.devices.get(id)
    }

    /// Live and zombie devices, in creation order.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.ids()
    }

    pub fn devhost(&self, id: DevhostId) -> Result<&Devhost> {
        self.devhosts.get(id)
    }

    pub fn devhost_ids(&self) -> Vec<DevhostId> {
        self.devhosts.ids()
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn devfs_path(&self, id: DeviceId) -> Option<String> {
        self.devfs.path(id)
    }

    /// Platform actions queued by completed suspends.
    pub fn take_power_requests(&mut self) -> Vec<PowerRequest> {
        self.power_requests.drain(..).collect()
    }

    fn next_txid(&mut self) -> Txid {
        let txid = self.next_txid;
        self.next_txid += 1;
        txid
    }

    /// The devhost that runs drivers bound to `id`: the proxy's host for an
    /// isolated device, the device's own host otherwise.
    fn servicing_host(&self, id: DeviceId) -> Result<(DeviceId, Option<DevhostId>)> {
        let dev = self.devices.get(id)?;
        match dev.proxy {
            Some(proxy) => Ok((proxy, self.devices.get(proxy)?.host)),
            None => Ok((id, dev.host)),
        }
    }

    fn publish_devfs(&mut self, id: DeviceId) -> Result<()> {
        let dev = self.devices.get(id)?;
        // Proxies are internal; their children appear below the isolated device.
        let mut parent = dev.parent;
        if let Some(p) = parent {
            let parent_dev = self.devices.get(p)?;
            if parent_dev.is_proxy() {
                parent = parent_dev.parent;
            }
        }
        let visible = !dev.flags.contains(DeviceFlags::INVISIBLE);
        self.devfs
            .publish(id, parent, &dev.name, dev.protocol_id, visible)
    }

    /// Tell namespace watchers that the device's bind state changed.
    fn notify_modified(&mut self, id: DeviceId) {
        if let Err(e) = self.devfs.advertise_modified(id) {
            debug!(sl!(), "cannot advertise change of {}: {}", id, e);
        }
    }

    /// Publish a new device below `parent`.
    ///
    /// `host` is the devhost asking for the device, or `None` for
    /// coordinator-initiated publishes. A devhost may only add children to
    /// devices it runs.
    pub fn publish(
        &mut self,
        parent: DeviceId,
        spec: DeviceSpec,
        host: Option<DevhostId>,
    ) -> Result<DeviceId> {
        if spec.name.is_empty() || spec.name.len() > DEVICE_NAME_MAX {
            return Err(Error::InvalidArgs(format!(
                "device name {:?} must be 1..={} bytes",
                spec.name, DEVICE_NAME_MAX
            )));
        }
        if spec.props.len() > DEVICE_PROPS_MAX {
            return Err(Error::InvalidArgs(format!(
                "{} properties exceed the limit of {}",
                spec.props.len(),
                DEVICE_PROPS_MAX
            )));
        }
        if !DeviceFlags::publishable().contains(spec.flags) {
            return Err(Error::InvalidArgs(format!(
                "flags {:?} cannot be requested",
                spec.flags
            )));
        }

        let (parent, parent_host) = match host {
            Some(host) => {
                let dev = self.devices.get(parent)?;
                if dev.host != Some(host) {
                    return Err(Error::AccessDenied(format!(
                        "{} does not run {}",
                        host, parent
                    )));
                }
                (parent, Some(host))
            }
            None => self.servicing_host(parent)?,
        };

        let parent_dev = self.devices.get(parent)?;
        if parent_dev.is_dead() {
            return Err(Error::BadState(format!("parent {} is dead", parent)));
        }
        for sibling in parent_dev.children.iter() {
            let sibling = self.devices.get(*sibling)?;
            if !sibling.is_dead() && sibling.name == spec.name {
                return Err(Error::AlreadyExists(format!(
                    "device {} below {}",
                    spec.name, parent_dev.name
                )));
            }
        }

        self.devices.get_mut(parent)?.children.try_reserve(1)?;
        if let Some(h) = parent_host {
            self.devhosts.get(h)?;
        }

        let retry = BindRetry::new(self.config.bind_retries, self.config.bind_backoff());
        let id = self
            .devices
            .insert_with(|id| Device::new(id, spec, Some(parent), parent_host, retry));
        self.devices.get_mut(parent)?.children.push(id);
        if let Some(h) = parent_host {
            self.devhosts.get_mut(h)?.add_device(id);
        }

        if let Err(e) = self.publish_devfs(id) {
            // Undo the linkage; the device never became visible.
            self.devices.get_mut(parent)?.remove_child(id);
            if let Some(h) = parent_host {
                self.devhosts.get_mut(h)?.remove_device(id);
            }
            self.devices.remove(id)?;
            return Err(e);
        }

        self.counters.incr(counters::DEVICES_PUBLISHED);
        let dev = self.devices.get(id)?;
        info!(sl!(), "published {} ({}) below {}", dev.name, id, parent);

        if !dev.flags.contains(DeviceFlags::INVISIBLE) {
            self.autobind(id);
        }
        Ok(id)
    }

    /// Remove a device and, before it, every device below it.
    pub fn remove(&mut self, id: DeviceId) -> Result<()> {
        self.remove_device(id, RemoveMode::Requested)
    }

    pub(crate) fn remove_device(&mut self, id: DeviceId, mode: RemoveMode) -> Result<()> {
        let dev = self.devices.get(id)?;
        if dev.flags.contains(DeviceFlags::IMMORTAL) {
            return Err(Error::AccessDenied(format!("{} is immortal", dev.name)));
        }
        if dev.is_dead() {
            return Err(Error::BadState(format!("{} already removed", dev.name)));
        }
        self.remove_subtree(id, mode, true);
        Ok(())
    }

    fn remove_subtree(&mut self, id: DeviceId, mode: RemoveMode, top: bool) {
        let (children, proxy, parent) = match self.devices.get(id) {
            Ok(dev) if !dev.is_dead() => (dev.children.clone(), dev.proxy, dev.parent),
            _ => return,
        };

        // Leaves first: the proxy's subtree and the children are torn down
        // before this device is.
        let child_mode = if mode == RemoveMode::HostRequest {
            RemoveMode::Requested
        } else {
            mode
        };
        for child in children.into_iter().chain(proxy) {
            self.remove_subtree(child, child_mode, false);
        }

        let (host, was_proxy) = match self.devices.get_mut(id) {
            Ok(dev) => {
                dev.flags.insert(DeviceFlags::DEAD);
                if mode == RemoveMode::Forced {
                    dev.rpc_open = false;
                    dev.pending.clear();
                }
                if dev.rpc_open {
                    dev.flags.insert(DeviceFlags::ZOMBIE);
                }
                (dev.host, dev.is_proxy())
            }
            Err(_) => return,
        };
        self.devfs.unpublish(id);
        self.counters.incr(counters::DEVICES_REMOVED);

        // Descendants of a host-requested removal are handed `Requested`, so
        // only the device the devhost named goes without a remove request.
        let rpc_open = self.devices.get(id).map_or(false, |d| d.rpc_open);
        if let (RemoveMode::Requested, Some(h), true) = (mode, host, rpc_open) {
            let txid = self.next_txid();
            if let Err(e) = self
                .devhosts
                .get(h)
                .and_then(|dh| dh.send(HostRequest::RemoveDevice { txid, device: id }))
            {
                warn!(sl!(), "failed to send remove for {}: {}", id, e);
            }
        }

        if let Some(p) = parent {
            if let Ok(parent_dev) = self.devices.get_mut(p) {
                parent_dev.remove_child(id);
                if parent_dev.proxy == Some(id) {
                    parent_dev.proxy = None;
                }
            }
        }

        if let Some(h) = host {
            self.release_from_host(h, id);
        }
        debug!(sl!(), "removed {} ({:?})", id, mode);

        // A proxy lost to a crash leaves the isolated device unbound; rebind
        // it after a backoff.
        if top && was_proxy && mode == RemoveMode::Forced {
            if let Some(p) = parent {
                self.schedule_rebind(p);
            }
        }

        self.try_reclaim(id);
    }

    /// Drop a device from its devhost and reap the host once it is empty.
    fn release_from_host(&mut self, host: DevhostId, id: DeviceId) {
        let reap = match self.devhosts.get_mut(host) {
            Ok(dh) => dh.remove_device(id),
            Err(_) => false,
        };
        if reap {
            self.reap_devhost(host);
        }
    }

    fn reap_devhost(&mut self, host: DevhostId) {
        if !self.devhosts.contains(host) {
            return;
        }
        // Zombies lose their channel together with the process.
        let closed = self.close_host_devices(host, "reaped");
        let mut dh = match self.devhosts.remove(host) {
            Ok(dh) => dh,
            Err(_) => return,
        };
        info!(sl!(), "reaping {} ({})", dh.name(), host);
        if let Err(e) = dh.kill() {
            warn!(sl!(), "failed to kill {}: {}", host, e);
        }
        if let Some(parent) = dh.parent() {
            if let Ok(parent) = self.devhosts.get_mut(parent) {
                parent.remove_child(host);
            }
        }
        for child in dh.children() {
            if let Ok(child) = self.devhosts.get_mut(*child) {
                child.set_parent(None);
            }
        }
        self.suspend_host_gone(host, dh.name());
        for device in closed {
            self.try_reclaim(device);
        }
    }

    /// Destroy `id` if nothing can reach it any more, then retry its parent.
    pub(crate) fn try_reclaim(&mut self, id: DeviceId) {
        let mut next = Some(id);
        while let Some(id) = next.take() {
            let dev = match self.devices.get(id) {
                Ok(dev) => dev,
                Err(_) => return,
            };
            if !dev.is_reclaimable() {
                return;
            }
            let referenced = self
                .devices
                .iter()
                .any(|(other, d)| other != id && d.parent == Some(id));
            if referenced {
                return;
            }
            let parent = dev.parent;
            if self.devices.remove(id).is_ok() {
                debug!(sl!(), "destroyed {}", id);
            }
            if let Some(p) = parent {
                if let Ok(parent_dev) = self.devices.get_mut(p) {
                    parent_dev.remove_child(id);
                    if parent_dev.proxy == Some(id) {
                        parent_dev.proxy = None;
                    }
                }
            }
            next = parent;
        }
    }

    /// Clear INVISIBLE, advertise the device and offer it to the drivers.
    pub fn make_visible(&mut self, id: DeviceId) -> Result<()> {
        let dev = self.devices.get_mut(id)?;
        if dev.is_dead() {
            return Err(Error::BadState(format!("{} is dead", dev.name)));
        }
        if !dev.flags.contains(DeviceFlags::INVISIBLE) {
            return Err(Error::BadState(format!("{} is already visible", dev.name)));
        }
        dev.flags.remove(DeviceFlags::INVISIBLE);
        self.devfs.advertise(id)?;
        self.autobind(id);
        Ok(())
    }

    pub fn add_metadata(&mut self, id: DeviceId, kind: u32, data: Vec<u8>) -> Result<()> {
        let dev = self.devices.get_mut(id)?;
        if dev.is_dead() {
            return Err(Error::BadState(format!("{} is dead", dev.name)));
        }
        dev.metadata.try_reserve(1)?;
        dev.metadata.push(Metadata { kind, data });
        Ok(())
    }

    /// Metadata of `kind` from the device or its nearest ancestor.
    pub fn get_metadata(&self, id: DeviceId, kind: u32) -> Result<Vec<u8>> {
        let mut next = Some(id);
        while let Some(id) = next {
            let dev = self.devices.get(id)?;
            if let Some(m) = dev.metadata.iter().find(|m| m.kind == kind) {
                return Ok(m.data.clone());
            }
            next = dev.parent;
        }
        Err(Error::NotFound(format!("metadata {:#x} for {}", kind, id)))
    }

    /// Human readable device tree.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let dev = match self.devices.get(id) {
                Ok(dev) => dev,
                Err(_) => continue,
            };
            let host = dev
                .host
                .and_then(|h| self.devhosts.get(h).ok())
                .map_or(0, |h| h.koid());
            writeln!(
                out,
                "{:indent$}[{}] {} pid={} flags={:?}{}",
                "",
                dev.name,
                id,
                host,
                dev.flags,
                dev.bound_driver
                    .as_deref()
                    .map(|d| format!(" driver={}", d))
                    .unwrap_or_default(),
                indent = depth * 3
            )
            .ok();
            for child in dev.children.iter().rev().chain(dev.proxy.iter()) {
                stack.push((*child, depth + 1));
            }
        }
        out
    }
}

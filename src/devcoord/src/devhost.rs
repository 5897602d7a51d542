// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::arena::define_id;
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::rpc::{HostChannel, HostProcess, HostRequest};

define_id!(
    /// Identifier of a devhost process known to the coordinator.
    DevhostId,
    "devhost"
);

bitflags! {
    pub struct DevhostFlags: u32 {
        /// No further devices will be placed here; reap once empty.
        const DYING = 0x01;
        /// A suspend request has been sent to this host.
        const SUSPEND = 0x02;
    }
}

/// One out-of-process driver host.
///
/// A descriptor is created before its process exists; the launcher result is
/// attached afterwards with [`Devhost::set_channel`] and
/// [`Devhost::set_process`].
pub struct Devhost {
    id: DevhostId,
    name: String,
    channel: Option<Arc<dyn HostChannel>>,
    process: Option<Box<dyn HostProcess>>,
    koid: u64,
    flags: DevhostFlags,
    parent: Option<DevhostId>,
    children: Vec<DevhostId>,
    devices: Vec<DeviceId>,
}

impl fmt::Debug for Devhost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Devhost")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("channel", &self.channel.is_some())
            .field("process", &self.process.is_some())
            .field("koid", &self.koid)
            .field("flags", &self.flags)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("devices", &self.devices)
            .finish()
    }
}

impl Devhost {
    pub fn new(id: DevhostId, name: &str) -> Self {
        Devhost {
            id,
            name: name.to_string(),
            channel: None,
            process: None,
            koid: 0,
            flags: DevhostFlags::empty(),
            parent: None,
            children: Vec::new(),
            devices: Vec::new(),
        }
    }

    pub fn id(&self) -> DevhostId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_channel(&mut self, channel: Arc<dyn HostChannel>) {
        self.channel = Some(channel);
    }

    pub fn set_process(&mut self, process: Box<dyn HostProcess>) {
        self.process = Some(process);
    }

    pub fn koid(&self) -> u64 {
        self.koid
    }

    pub fn set_koid(&mut self, koid: u64) {
        self.koid = koid;
    }

    pub fn flags(&self) -> DevhostFlags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut DevhostFlags {
        &mut self.flags
    }

    pub fn parent(&self) -> Option<DevhostId> {
        self.parent
    }

    pub fn set_parent(&mut self, parent: Option<DevhostId>) {
        self.parent = parent;
    }

    pub fn children(&self) -> &[DevhostId] {
        &self.children
    }

    pub fn add_child(&mut self, child: DevhostId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    pub fn remove_child(&mut self, child: DevhostId) {
        self.children.retain(|c| *c != child);
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn add_device(&mut self, device: DeviceId) {
        if !self.devices.contains(&device) {
            self.devices.push(device);
        }
    }

    /// Drop a device from the membership list. Returns true when the host is
    /// left without devices and is marked DYING, i.e. ready to be reaped.
    pub fn remove_device(&mut self, device: DeviceId) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| *d != device);
        if before != self.devices.len() && self.devices.is_empty() {
            self.flags.insert(DevhostFlags::DYING);
        }
        self.devices.is_empty() && self.flags.contains(DevhostFlags::DYING)
    }

    /// Fire-and-forget send; the answer arrives later as a host message.
    pub fn send(&self, request: HostRequest) -> Result<()> {
        match &self.channel {
            Some(channel) => channel.send(request),
            None => Err(Error::ChannelError(format!("{} has no channel", self.id))),
        }
    }

    /// The process is gone; forget its channel and handle.
    pub fn mark_exited(&mut self) {
        self.channel = None;
        self.process = None;
        self.flags.insert(DevhostFlags::DYING);
    }

    /// Terminate the host process, if one was attached.
    pub fn kill(&mut self) -> Result<()> {
        self.channel = None;
        match self.process.as_mut() {
            Some(process) => process.kill(),
            None => Ok(()),
        }
    }
}

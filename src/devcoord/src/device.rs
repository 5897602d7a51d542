// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::VecDeque;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::arena::define_id;
use crate::devhost::DevhostId;
use crate::rpc::Txid;
use crate::suspend::SuspendId;

define_id!(
    /// Identifier of a device in the coordinator's device tree.
    DeviceId,
    "dev"
);

/// Longest accepted device name, in bytes.
pub const DEVICE_NAME_MAX: usize = 31;
/// Most properties a device may carry.
pub const DEVICE_PROPS_MAX: usize = 256;

bitflags! {
    pub struct DeviceFlags: u32 {
        /// Never destroyed.
        const IMMORTAL = 0x01;
        /// Children are created in a new devhost attached to a proxy device.
        const MUST_ISOLATE = 0x02;
        /// May be bound multiple times.
        const MULTI_BIND = 0x04;
        /// Bound and not eligible for binding again until unbound.
        /// Not allowed on MULTI_BIND devices.
        const BOUND = 0x08;
        /// Has been removed.
        const DEAD = 0x10;
        /// Removed but the rpc channel is not torn down yet.
        const ZOMBIE = 0x20;
        /// Proxy device; its parent is the device it fronts.
        const PROXY = 0x40;
        /// Not visible in devfs nor bindable.
        const INVISIBLE = 0x80;
    }
}

impl DeviceFlags {
    /// Flags a devhost may request when publishing a device.
    pub fn publishable() -> DeviceFlags {
        DeviceFlags::MUST_ISOLATE | DeviceFlags::MULTI_BIND | DeviceFlags::INVISIBLE
    }
}

/// A single binding property.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProp {
    pub id: u16,
    pub reserved: u16,
    pub value: u32,
}

impl DeviceProp {
    pub fn new(id: u16, value: u32) -> Self {
        DeviceProp {
            id,
            reserved: 0,
            value,
        }
    }
}

/// Opaque metadata blob attached to a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub kind: u32,
    pub data: Vec<u8>,
}

/// Everything needed to publish a device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceSpec {
    pub name: String,
    pub libname: String,
    pub args: Option<String>,
    pub protocol_id: u32,
    pub props: Vec<DeviceProp>,
    pub flags: DeviceFlags,
}

impl Default for DeviceFlags {
    fn default() -> Self {
        DeviceFlags::empty()
    }
}

impl DeviceSpec {
    pub fn new(name: &str, protocol_id: u32) -> Self {
        DeviceSpec {
            name: name.to_string(),
            protocol_id,
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: DeviceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_props(mut self, props: Vec<DeviceProp>) -> Self {
        self.props = props;
        self
    }

    pub fn with_libname(mut self, libname: &str) -> Self {
        self.libname = libname.to_string();
        self
    }

    pub fn with_args(mut self, args: &str) -> Self {
        self.args = Some(args.to_string());
        self
    }
}

/// Kind of request a device is waiting on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingOp {
    Bind { driver: String },
    Suspend { context: SuspendId },
}

/// A request sent to the device's devhost and not yet acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingOperation {
    pub txid: Txid,
    pub op: PendingOp,
}

/// Retry budget for driver binds.
///
/// Each failure consumes one retry and yields the delay before the next
/// attempt; the delay doubles after every failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindRetry {
    initial_backoff: Duration,
    initial_retries: u32,
    backoff: Duration,
    retries: u32,
}

impl BindRetry {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        BindRetry {
            initial_backoff: backoff,
            initial_retries: retries,
            backoff,
            retries,
        }
    }

    /// Record a failure. Returns the delay before retrying, or `None` once
    /// the budget is exhausted.
    pub fn on_failure(&mut self) -> Option<Duration> {
        if self.retries == 0 {
            return None;
        }
        let delay = self.backoff;
        self.retries -= 1;
        self.backoff = self.backoff.saturating_mul(2);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.backoff = self.initial_backoff;
        self.retries = self.initial_retries;
    }

    pub fn retries_left(&self) -> u32 {
        self.retries
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}

/// One node of the device tree.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    pub name: String,
    pub libname: String,
    pub args: Option<String>,
    pub protocol_id: u32,
    pub props: Vec<DeviceProp>,
    pub(crate) flags: DeviceFlags,
    pub(crate) host: Option<DevhostId>,
    pub(crate) parent: Option<DeviceId>,
    pub(crate) proxy: Option<DeviceId>,
    pub(crate) children: Vec<DeviceId>,
    pub(crate) pending: VecDeque<PendingOperation>,
    /// Requests given up on; their late replies are dropped.
    pub(crate) abandoned: Vec<Txid>,
    pub(crate) metadata: Vec<Metadata>,
    pub(crate) retry: BindRetry,
    pub(crate) rpc_open: bool,
    pub(crate) bound_driver: Option<String>,
    pub(crate) bind_failed: bool,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        spec: DeviceSpec,
        parent: Option<DeviceId>,
        host: Option<DevhostId>,
        retry: BindRetry,
    ) -> Self {
        Device {
            id,
            name: spec.name,
            libname: spec.libname,
            args: spec.args,
            protocol_id: spec.protocol_id,
            props: spec.props,
            flags: spec.flags,
            host,
            parent,
            proxy: None,
            children: Vec::new(),
            pending: VecDeque::new(),
            abandoned: Vec::new(),
            metadata: Vec::new(),
            retry,
            rpc_open: host.is_some(),
            bound_driver: None,
            bind_failed: false,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn host(&self) -> Option<DevhostId> {
        self.host
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    pub fn proxy(&self) -> Option<DeviceId> {
        self.proxy
    }

    pub fn children(&self) -> &[DeviceId] {
        &self.children
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingOperation> {
        self.pending.iter()
    }

    pub fn bound_driver(&self) -> Option<&str> {
        self.bound_driver.as_deref()
    }

    /// The bind retry budget ran out and the device stays unbound.
    pub fn bind_failed(&self) -> bool {
        self.bind_failed
    }

    pub fn retry(&self) -> &BindRetry {
        &self.retry
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(DeviceFlags::DEAD)
    }

    pub fn is_proxy(&self) -> bool {
        self.flags.contains(DeviceFlags::PROXY)
    }

    pub fn is_rpc_open(&self) -> bool {
        self.rpc_open
    }

    /// Whether a driver could be bound to this device right now.
    pub fn is_bindable(&self) -> bool {
        if self
            .flags
            .intersects(DeviceFlags::DEAD | DeviceFlags::INVISIBLE | DeviceFlags::PROXY)
        {
            return false;
        }
        self.flags.contains(DeviceFlags::MULTI_BIND) || !self.flags.contains(DeviceFlags::BOUND)
    }

    pub(crate) fn mark_bound(&mut self, driver: &str) {
        if !self.flags.contains(DeviceFlags::MULTI_BIND) {
            self.flags.insert(DeviceFlags::BOUND);
        }
        self.bound_driver = Some(driver.to_string());
        self.bind_failed = false;
    }

    pub(crate) fn mark_unbound(&mut self) {
        self.flags.remove(DeviceFlags::BOUND);
        self.bound_driver = None;
    }

    pub(crate) fn remove_child(&mut self, child: DeviceId) {
        self.children.retain(|c| *c != child);
    }

    /// Pop the head of the pending queue if it carries `txid`.
    ///
    /// Replies complete strictly in FIFO order; anything else is a protocol
    /// violation and leaves the queue untouched.
    pub(crate) fn complete_pending(&mut self, txid: Txid) -> Option<PendingOperation> {
        match self.pending.front() {
            Some(op) if op.txid == txid => self.pending.pop_front(),
            _ => None,
        }
    }

    /// Stop waiting for `txid`, wherever it sits in the queue.
    pub(crate) fn abandon_pending(&mut self, txid: Txid) -> Option<PendingOperation> {
        let pos = self.pending.iter().position(|op| op.txid == txid)?;
        self.abandoned.push(txid);
        self.pending.remove(pos)
    }

    /// Whether `txid` was abandoned; forgets it either way.
    pub(crate) fn take_abandoned(&mut self, txid: Txid) -> bool {
        let before = self.abandoned.len();
        self.abandoned.retain(|t| *t != txid);
        before != self.abandoned.len()
    }

    /// Whether the coordinator may drop this device: it is dead, nothing is
    /// still in flight, and its rpc channel is gone.
    pub(crate) fn is_reclaimable(&self) -> bool {
        self.is_dead()
            && !self.flags.contains(DeviceFlags::IMMORTAL)
            && !self.rpc_open
            && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaId;

    fn device(flags: DeviceFlags) -> Device {
        Device::new(
            DeviceId::from_raw(1),
            DeviceSpec::new("dev", 0).with_flags(flags),
            None,
            Some(DevhostId::from_raw(1)),
            BindRetry::new(4, Duration::from_millis(250)),
        )
    }

    #[test]
    fn test_bind_retry_backoff_doubles() {
        let mut retry = BindRetry::new(4, Duration::from_millis(250));
        let delays: Vec<u64> = std::iter::from_fn(|| retry.on_failure())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000]);
        assert_eq!(retry.on_failure(), None);
        assert_eq!(retry.retries_left(), 0);

        retry.reset();
        assert_eq!(retry.retries_left(), 4);
        assert_eq!(retry.backoff(), Duration::from_millis(250));
    }

    #[test]
    fn test_bindable_states() {
        let mut dev = device(DeviceFlags::empty());
        assert!(dev.is_bindable());
        dev.mark_bound("drv");
        assert!(!dev.is_bindable());
        dev.mark_unbound();
        assert!(dev.is_bindable());

        let mut multi = device(DeviceFlags::MULTI_BIND);
        multi.mark_bound("drv");
        assert!(!multi.flags().contains(DeviceFlags::BOUND));
        assert!(multi.is_bindable());

        assert!(!device(DeviceFlags::INVISIBLE).is_bindable());
        assert!(!device(DeviceFlags::DEAD).is_bindable());
    }

    #[test]
    fn test_pending_fifo() {
        let mut dev = device(DeviceFlags::empty());
        for txid in 1..=2 {
            dev.pending.push_back(PendingOperation {
                txid,
                op: PendingOp::Bind {
                    driver: "drv".to_string(),
                },
            });
        }
        assert!(dev.complete_pending(2).is_none());
        assert_eq!(dev.complete_pending(1).unwrap().txid, 1);
        assert_eq!(dev.complete_pending(2).unwrap().txid, 2);
        assert!(dev.complete_pending(3).is_none());
    }

    #[test]
    fn test_abandoned_request_leaves_queue() {
        let mut dev = device(DeviceFlags::empty());
        for txid in 1..=2 {
            dev.pending.push_back(PendingOperation {
                txid,
                op: PendingOp::Bind {
                    driver: "drv".to_string(),
                },
            });
        }
        assert_eq!(dev.abandon_pending(1).unwrap().txid, 1);
        assert!(dev.abandon_pending(9).is_none());
        assert_eq!(dev.complete_pending(2).unwrap().txid, 2);
        assert!(dev.take_abandoned(1));
        assert!(!dev.take_abandoned(1));
    }

    #[test]
    fn test_reclaimable() {
        let mut dev = device(DeviceFlags::empty());
        assert!(!dev.is_reclaimable());
        dev.flags.insert(DeviceFlags::DEAD);
        assert!(!dev.is_reclaimable());
        dev.rpc_open = false;
        assert!(dev.is_reclaimable());

        let mut immortal = device(DeviceFlags::IMMORTAL | DeviceFlags::DEAD);
        immortal.rpc_open = false;
        assert!(!immortal.is_reclaimable());
    }
}

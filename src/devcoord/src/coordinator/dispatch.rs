// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

use super::{Coordinator, RemoveMode};
use crate::counters;
use crate::device::{DeviceFlags, DeviceId, DeviceSpec, PendingOp, PendingOperation};
use crate::devhost::DevhostId;
use crate::error::{Error, Result, Status};
use crate::rpc::{HostMessage, HostRequest, ReplyPayload, Txid};
use crate::timer::TimerEvent;

impl Coordinator {
    /// Handle one message read from a devhost channel.
    ///
    /// Host-initiated requests are answered with a `Reply` request; the
    /// returned status is the outcome of the message either way.
    pub fn handle_host_message(&mut self, host: DevhostId, message: HostMessage) -> Status {
        match message {
            HostMessage::Reply {
                txid,
                device,
                status,
            } => self.handle_reply(host, device, txid, status),
            HostMessage::DeviceClosed { device } => self.handle_device_closed(host, device),
            HostMessage::AddDevice {
                txid,
                parent,
                name,
                libname,
                args,
                protocol_id,
                props,
                flags,
            } => {
                let result = DeviceFlags::from_bits(flags)
                    .ok_or_else(|| Error::InvalidArgs(format!("unknown device flags {:#x}", flags)))
                    .and_then(|flags| {
                        let spec = DeviceSpec {
                            name,
                            libname,
                            args,
                            protocol_id,
                            props,
                            flags,
                        };
                        self.publish(parent, spec, Some(host))
                    });
                self.reply(host, txid, result.map(ReplyPayload::Device))
            }
            HostMessage::RemoveDevice { txid, device } => {
                let result = self
                    .check_owner(host, device)
                    .and_then(|_| self.remove_device(device, RemoveMode::HostRequest));
                self.reply(host, txid, result.map(|_| ReplyPayload::Empty))
            }
            HostMessage::MakeVisible { txid, device } => {
                let result = self
                    .check_owner(host, device)
                    .and_then(|_| self.make_visible(device));
                self.reply(host, txid, result.map(|_| ReplyPayload::Empty))
            }
            HostMessage::BindDevice {
                txid,
                device,
                driver,
            } => {
                let result = self
                    .check_owner(host, device)
                    .and_then(|_| self.bind_device(device, &driver));
                self.reply(host, txid, result.map(|_| ReplyPayload::Empty))
            }
            HostMessage::AddMetadata {
                txid,
                device,
                kind,
                data,
            } => {
                let result = self
                    .check_owner(host, device)
                    .and_then(|_| self.add_metadata(device, kind, data));
                self.reply(host, txid, result.map(|_| ReplyPayload::Empty))
            }
            HostMessage::GetMetadata { txid, device, kind } => {
                let result = self
                    .check_owner(host, device)
                    .and_then(|_| self.get_metadata(device, kind));
                self.reply(host, txid, result.map(ReplyPayload::Metadata))
            }
        }
    }

    /// Devhosts may only talk about devices they run.
    fn check_owner(&self, host: DevhostId, device: DeviceId) -> Result<()> {
        let dev = self.devices.get(device)?;
        if dev.host != Some(host) {
            return Err(Error::AccessDenied(format!(
                "{} does not run {}",
                host, device
            )));
        }
        Ok(())
    }

    fn reply(&mut self, host: DevhostId, txid: Txid, result: Result<ReplyPayload>) -> Status {
        let status = result.as_ref().map(|_| ()).map_err(Clone::clone);
        if let Err(e) = &status {
            warn!(sl!(), "request {} from {} failed: {}", txid, host, e);
        }
        // The devhost may have been reaped by the request itself.
        if let Ok(dh) = self.devhosts.get(host) {
            if let Err(e) = dh.send(HostRequest::Reply { txid, result }) {
                debug!(sl!(), "cannot reply to {}: {}", host, e);
            }
        }
        status
    }

    /// Resolve the head of the device's pending queue.
    fn handle_reply(&mut self, host: DevhostId, device: DeviceId, txid: Txid, status: Status) -> Status {
        self.check_owner(host, device)?;
        let dev = self.devices.get_mut(device)?;
        let op = match dev.complete_pending(txid) {
            Some(op) => op,
            None if dev.take_abandoned(txid) => {
                debug!(sl!(), "ignoring late reply {} for {}", txid, device);
                return Ok(());
            }
            None => {
                return Err(Error::BadState(format!(
                    "reply {} does not match the head of {}",
                    txid, device
                )))
            }
        };
        self.complete_operation(host, device, op, status);
        self.try_reclaim(device);
        Ok(())
    }

    fn complete_operation(
        &mut self,
        host: DevhostId,
        device: DeviceId,
        op: PendingOperation,
        status: Status,
    ) {
        match op.op {
            PendingOp::Bind { driver } => self.bind_completed(device, &driver, status),
            PendingOp::Suspend { context } => {
                self.suspend_acknowledged(context, host, op.txid, status)
            }
        }
    }

    /// Drop the device's rpc channel and fail whatever was still pending on it.
    fn close_device_rpc(&mut self, host: DevhostId, device: DeviceId) -> Vec<PendingOperation> {
        match self.devices.get_mut(device) {
            Ok(dev) => {
                dev.rpc_open = false;
                dev.flags.remove(DeviceFlags::ZOMBIE);
                let pending = dev.pending.drain(..).collect();
                debug!(sl!(), "rpc for {} in {} closed", device, host);
                pending
            }
            Err(_) => Vec::new(),
        }
    }

    /// Close the rpc of every device still attached to `host`, zombies
    /// included, failing their pending requests. Returns the devices closed.
    pub(crate) fn close_host_devices(&mut self, host: DevhostId, reason: &str) -> Vec<DeviceId> {
        let attached: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(_, d)| d.host == Some(host) && d.rpc_open)
            .map(|(id, _)| id)
            .collect();
        for device in attached.iter().copied() {
            let pending = self.close_device_rpc(host, device);
            for op in pending {
                self.complete_operation(
                    host,
                    device,
                    op,
                    Err(Error::ChannelError(format!("{} {}", host, reason))),
                );
            }
        }
        attached
    }

    /// The devhost closed the device's channel. Expected for removed
    /// devices; anything else is treated as a crash of that device.
    pub fn handle_device_closed(&mut self, host: DevhostId, device: DeviceId) -> Status {
        self.check_owner(host, device)?;
        let pending = self.close_device_rpc(host, device);
        for op in pending {
            self.complete_operation(
                host,
                device,
                op,
                Err(Error::ChannelError(format!("{} closed", device))),
            );
        }

        let dead = self.devices.get(device).map_or(true, |d| d.is_dead());
        if !dead {
            warn!(sl!(), "{} closed unexpectedly, removing it", device);
            self.remove_device(device, RemoveMode::Forced)?;
        }
        self.try_reclaim(device);
        Ok(())
    }

    /// The devhost process exited: everything it ran is gone.
    pub fn handle_devhost_exited(&mut self, host: DevhostId) {
        let name = match self.devhosts.get_mut(host) {
            Ok(dh) => {
                dh.mark_exited();
                dh.name().to_string()
            }
            Err(_) => return,
        };
        warn!(sl!(), "{} ({}) exited", name, host);
        self.counters.incr(counters::DEVHOSTS_EXITED);

        // Zombies left the membership list at removal but still wait for
        // their channel to close.
        self.close_host_devices(host, "exited");

        let members = match self.devhosts.get(host) {
            Ok(dh) => dh.devices().to_vec(),
            Err(_) => Vec::new(),
        };
        for device in members {
            let live = self.devices.get(device).map_or(false, |d| !d.is_dead());
            if live {
                if let Err(e) = self.remove_device(device, RemoveMode::Forced) {
                    warn!(sl!(), "cannot remove {} after {} exited: {}", device, name, e);
                }
            }
        }
        for device in self.devices.ids() {
            if self.devices.get(device).map_or(false, |d| d.host == Some(host)) {
                self.try_reclaim(device);
            }
        }

        if self.devhosts.contains(host) {
            self.reap_devhost(host);
        }
    }

    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::BindRetry { device, driver } => self.retry_bind(device, &driver),
            TimerEvent::SuspendTimeout {
                context,
                devhost,
                txid,
            } => self.suspend_timed_out(context, devhost, txid),
        }
    }
}

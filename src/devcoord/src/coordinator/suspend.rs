// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

use tokio::sync::oneshot;

use super::Coordinator;
use crate::arena::ArenaId;
use crate::counters;
use crate::device::{PendingOp, PendingOperation};
use crate::devhost::{DevhostFlags, DevhostId};
use crate::error::{Error, Result, Status};
use crate::power::PowerRequest;
use crate::rpc::{HostRequest, Txid};
use crate::suspend::{
    build_traversal, MexecPayload, SuspendAction, SuspendContext, SuspendId, SuspendReport,
    SuspendState,
};
use crate::timer::TimerEvent;

impl Coordinator {
    /// Start suspending every devhost, children before parents. Only one
    /// suspend may be active; a second request is refused with `BadState`
    /// and leaves the active one untouched.
    pub fn initiate_suspend(
        &mut self,
        action: SuspendAction,
        notifier: Option<oneshot::Sender<SuspendReport>>,
    ) -> Result<SuspendId> {
        self.start_suspend(action, notifier, None)
    }

    pub fn initiate_reboot(
        &mut self,
        notifier: Option<oneshot::Sender<SuspendReport>>,
    ) -> Result<SuspendId> {
        self.start_suspend(SuspendAction::Reboot, notifier, None)
    }

    pub fn initiate_poweroff(
        &mut self,
        notifier: Option<oneshot::Sender<SuspendReport>>,
    ) -> Result<SuspendId> {
        self.start_suspend(SuspendAction::Poweroff, notifier, None)
    }

    /// Suspend, then hand the kernel and bootdata images to the platform.
    pub fn initiate_mexec(
        &mut self,
        kernel: Vec<u8>,
        bootdata: Vec<u8>,
        notifier: Option<oneshot::Sender<SuspendReport>>,
    ) -> Result<SuspendId> {
        if kernel.is_empty() {
            return Err(Error::InvalidArgs("mexec needs a kernel image".to_string()));
        }
        self.start_suspend(
            SuspendAction::Mexec,
            notifier,
            Some(MexecPayload { kernel, bootdata }),
        )
    }

    pub fn suspend_state(&self) -> SuspendState {
        match &self.suspend {
            Some(ctx) => ctx.state(),
            None => SuspendState::Running,
        }
    }

    pub fn suspend_context(&self) -> Option<&SuspendContext> {
        self.suspend.as_ref()
    }

    fn start_suspend(
        &mut self,
        action: SuspendAction,
        notifier: Option<oneshot::Sender<SuspendReport>>,
        mexec: Option<MexecPayload>,
    ) -> Result<SuspendId> {
        if let Some(ctx) = &self.suspend {
            return Err(Error::BadState(format!(
                "{} is still in progress",
                ctx.id()
            )));
        }

        let id = SuspendId::from_raw(self.next_suspend);
        self.next_suspend += 1;
        let order = build_traversal(&self.devhosts);
        info!(
            sl!(),
            "starting {} ({:?}) over {} devhosts",
            id,
            action,
            order.len()
        );

        let mut ctx = SuspendContext::new(id, action, order, notifier);
        if let Some(payload) = mexec {
            ctx = ctx.with_mexec(payload);
        }
        self.suspend = Some(ctx);
        self.continue_suspend();
        Ok(id)
    }

    /// Send the next suspend request, skipping hosts without live devices,
    /// or finish when the traversal is exhausted.
    pub(crate) fn continue_suspend(&mut self) {
        loop {
            let ctx = match self.suspend.as_mut() {
                Some(ctx) => ctx,
                None => return,
            };
            if ctx.current().is_some() {
                return;
            }
            let host = match ctx.advance() {
                Some(host) => host,
                None => {
                    self.finish_suspend();
                    return;
                }
            };
            let (context, flags) = (ctx.id(), ctx.flags());

            let dh = match self.devhosts.get_mut(host) {
                Ok(dh) => dh,
                Err(_) => {
                    ctx.skip_current();
                    continue;
                }
            };
            let devices = &self.devices;
            let target = dh.devices().iter().copied().find(|d| {
                devices
                    .get(*d)
                    .map_or(false, |dev| !dev.is_dead() && dev.is_rpc_open())
            });
            let target = match target {
                Some(target) => target,
                None => {
                    debug!(sl!(), "{} has no live devices, skipping", host);
                    ctx.skip_current();
                    continue;
                }
            };

            let txid = self.next_txid;
            self.next_txid += 1;
            let sent = dh.send(HostRequest::Suspend {
                txid,
                device: target,
                flags,
            });
            self.counters.incr(counters::SUSPEND_RPCS);
            match sent {
                Ok(()) => {
                    dh.flags_mut().insert(DevhostFlags::SUSPEND);
                    ctx.message_sent(txid);
                    if let Ok(dev) = self.devices.get_mut(target) {
                        dev.pending.push_back(PendingOperation {
                            txid,
                            op: PendingOp::Suspend { context },
                        });
                    }
                    self.scheduler.schedule(
                        self.config.suspend_timeout(),
                        TimerEvent::SuspendTimeout {
                            context,
                            devhost: host,
                            txid,
                        },
                    );
                    return;
                }
                Err(e) => {
                    warn!(sl!(), "failed to suspend {}: {}", host, e);
                    self.counters.incr(counters::SUSPEND_FAILURES);
                    let name = dh.name().to_string();
                    ctx.complete_current(host, &name, Err(e));
                }
            }
        }
    }

    /// A devhost acknowledged (or failed) the suspend request `txid`.
    pub(crate) fn suspend_acknowledged(
        &mut self,
        context: SuspendId,
        host: DevhostId,
        txid: Txid,
        status: Status,
    ) {
        let ctx = match self.suspend.as_mut() {
            Some(ctx) if ctx.id() == context && ctx.is_awaiting(host, txid) => ctx,
            _ => {
                debug!(sl!(), "ignoring late suspend reply {} from {}", txid, host);
                return;
            }
        };
        let name = self
            .devhosts
            .get(host)
            .map(|dh| dh.name().to_string())
            .unwrap_or_default();
        if let Err(e) = &status {
            warn!(sl!(), "{} failed to suspend: {}", name, e);
            self.counters.incr(counters::SUSPEND_FAILURES);
        }
        ctx.complete_current(host, &name, status);
        self.continue_suspend();
    }

    pub(crate) fn suspend_timed_out(&mut self, context: SuspendId, host: DevhostId, txid: Txid) {
        let timed_out = matches!(
            self.suspend.as_ref(),
            Some(ctx) if ctx.id() == context && ctx.is_awaiting(host, txid)
        );
        if timed_out {
            warn!(sl!(), "{} did not acknowledge suspend {}", host, txid);
            self.fail_current_host(host, Error::Timeout);
        }
    }

    /// The devhost is gone; if it was being suspended, record the failure
    /// and move on.
    pub(crate) fn suspend_host_gone(&mut self, host: DevhostId, name: &str) {
        let current = self.suspend.as_ref().and_then(|ctx| ctx.current());
        if current == Some(host) {
            warn!(sl!(), "{} exited during suspend", name);
            self.fail_current_host(
                host,
                Error::ChannelError(format!("{} exited during suspend", name)),
            );
        }
    }

    fn fail_current_host(&mut self, host: DevhostId, error: Error) {
        let name = self
            .devhosts
            .get(host)
            .map(|dh| dh.name().to_string())
            .unwrap_or_else(|_| host.to_string());
        self.counters.incr(counters::SUSPEND_FAILURES);
        let mut abandoned = None;
        if let Some(ctx) = self.suspend.as_mut() {
            abandoned = ctx.awaited_txid();
            ctx.complete_current(host, &name, Err(error));
        }
        if let Some(txid) = abandoned {
            self.abandon_suspend_request(txid);
        }
        self.continue_suspend();
    }

    /// Take the request `txid` off the queue of the device it was sent to.
    fn abandon_suspend_request(&mut self, txid: Txid) {
        let target = self
            .devices
            .iter()
            .find(|(_, d)| d.pending.iter().any(|op| op.txid == txid))
            .map(|(id, _)| id);
        if let Some(device) = target {
            if let Ok(dev) = self.devices.get_mut(device) {
                dev.abandon_pending(txid);
            }
            self.try_reclaim(device);
        }
    }

    fn finish_suspend(&mut self) {
        let mut ctx = match self.suspend.take() {
            Some(ctx) => ctx,
            None => return,
        };
        let (report, notifier, mexec) = ctx.complete();
        match &report.status {
            Ok(()) => info!(
                sl!(),
                "{} complete: {} devhosts suspended",
                report.id,
                report.hosts_suspended
            ),
            Err(e) => error!(
                sl!(),
                "{} complete with {} failures, first: {}",
                report.id,
                report.failures.len(),
                e
            ),
        }

        let action = report.action;
        if let Some(notifier) = notifier {
            if notifier.send(report).is_err() {
                debug!(sl!(), "suspend requester went away");
            }
        }
        self.power_requests.push_back(PowerRequest { action, mexec });
    }
}

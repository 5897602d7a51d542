// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Suspend state machine and devhost traversal order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::convert::TryFrom;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::arena::{define_id, Arena};
use crate::devhost::{Devhost, DevhostId};
use crate::error::{Error, Result, Status};
use crate::rpc::Txid;
use crate::stats::SummaryStatistics;

define_id!(
    /// Identifier of one suspend, reboot, poweroff or mexec operation.
    SuspendId,
    "suspend"
);

pub const SUSPEND_FLAG_REBOOT: u32 = 0xdcdc_0100;
pub const SUSPEND_FLAG_REBOOT_BOOTLOADER: u32 = 0xdcdc_0101;
pub const SUSPEND_FLAG_REBOOT_RECOVERY: u32 = 0xdcdc_0102;
pub const SUSPEND_FLAG_POWEROFF: u32 = 0xdcdc_0200;
pub const SUSPEND_FLAG_MEXEC: u32 = 0xdcdc_0300;
pub const SUSPEND_FLAG_SUSPEND_RAM: u32 = 0xdcdc_0400;

/// Target of a system suspend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendAction {
    Reboot,
    RebootBootloader,
    RebootRecovery,
    Poweroff,
    Mexec,
    SuspendRam,
}

impl SuspendAction {
    /// Raw flags carried by the suspend request sent to devhosts.
    pub fn flags(self) -> u32 {
        match self {
            SuspendAction::Reboot => SUSPEND_FLAG_REBOOT,
            SuspendAction::RebootBootloader => SUSPEND_FLAG_REBOOT_BOOTLOADER,
            SuspendAction::RebootRecovery => SUSPEND_FLAG_REBOOT_RECOVERY,
            SuspendAction::Poweroff => SUSPEND_FLAG_POWEROFF,
            SuspendAction::Mexec => SUSPEND_FLAG_MEXEC,
            SuspendAction::SuspendRam => SUSPEND_FLAG_SUSPEND_RAM,
        }
    }
}

impl TryFrom<u32> for SuspendAction {
    type Error = Error;

    fn try_from(flags: u32) -> Result<Self> {
        match flags {
            SUSPEND_FLAG_REBOOT => Ok(SuspendAction::Reboot),
            SUSPEND_FLAG_REBOOT_BOOTLOADER => Ok(SuspendAction::RebootBootloader),
            SUSPEND_FLAG_REBOOT_RECOVERY => Ok(SuspendAction::RebootRecovery),
            SUSPEND_FLAG_POWEROFF => Ok(SuspendAction::Poweroff),
            SUSPEND_FLAG_MEXEC => Ok(SuspendAction::Mexec),
            SUSPEND_FLAG_SUSPEND_RAM => Ok(SuspendAction::SuspendRam),
            f => Err(Error::NotSupported(format!("suspend flags {:#x}", f))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspendState {
    Running,
    Suspending,
    Complete,
}

/// Kernel and bootdata images for an mexec reboot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MexecPayload {
    pub kernel: Vec<u8>,
    pub bootdata: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFailure {
    pub devhost: DevhostId,
    pub name: String,
    pub error: Error,
}

/// Outcome of a suspend operation, delivered to whoever started it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuspendReport {
    pub id: SuspendId,
    pub action: SuspendAction,
    /// First failure seen, or Ok.
    pub status: Status,
    pub hosts_suspended: usize,
    pub failures: Vec<HostFailure>,
    /// Per-host acknowledgment latency in milliseconds.
    pub latency: Option<SummaryStatistics>,
}

/// State of one in-flight suspend.
///
/// Hosts are visited strictly one at a time: the context only ever has a
/// single current host and at most one outstanding message.
#[derive(Debug)]
pub struct SuspendContext {
    id: SuspendId,
    action: SuspendAction,
    state: SuspendState,
    status: Status,
    order: Vec<DevhostId>,
    traversal: VecDeque<DevhostId>,
    current: Option<DevhostId>,
    current_txid: Option<Txid>,
    sent_at: Option<Instant>,
    outstanding: u32,
    mexec: Option<MexecPayload>,
    notifier: Option<oneshot::Sender<SuspendReport>>,
    hosts_suspended: usize,
    failures: Vec<HostFailure>,
    latencies_ms: Vec<f64>,
}

impl SuspendContext {
    pub fn new(
        id: SuspendId,
        action: SuspendAction,
        order: Vec<DevhostId>,
        notifier: Option<oneshot::Sender<SuspendReport>>,
    ) -> Self {
        SuspendContext {
            id,
            action,
            state: SuspendState::Suspending,
            status: Ok(()),
            traversal: order.iter().copied().collect(),
            order,
            current: None,
            current_txid: None,
            sent_at: None,
            outstanding: 0,
            mexec: None,
            notifier,
            hosts_suspended: 0,
            failures: Vec::new(),
            latencies_ms: Vec::new(),
        }
    }

    pub fn with_mexec(mut self, payload: MexecPayload) -> Self {
        self.mexec = Some(payload);
        self
    }

    pub fn id(&self) -> SuspendId {
        self.id
    }

    pub fn action(&self) -> SuspendAction {
        self.action
    }

    pub fn flags(&self) -> u32 {
        self.action.flags()
    }

    pub fn state(&self) -> SuspendState {
        self.state
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn current(&self) -> Option<DevhostId> {
        self.current
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Hosts not visited yet.
    pub fn remaining(&self) -> impl Iterator<Item = &DevhostId> {
        self.traversal.iter()
    }

    /// Full suspend order.
    pub fn order(&self) -> &[DevhostId] {
        &self.order
    }

    pub fn resume_order(&self) -> Vec<DevhostId> {
        resume_order(&self.order)
    }

    /// Move the head of the traversal into the current slot.
    pub fn advance(&mut self) -> Option<DevhostId> {
        if self.current.is_some() || self.state != SuspendState::Suspending {
            return None;
        }
        self.current = self.traversal.pop_front();
        self.current
    }

    /// The suspend request for the current host has been sent.
    pub fn message_sent(&mut self, txid: Txid) {
        self.current_txid = Some(txid);
        self.sent_at = Some(Instant::now());
        self.outstanding += 1;
    }

    /// Whether `(devhost, txid)` names the message currently awaited.
    pub fn is_awaiting(&self, devhost: DevhostId, txid: Txid) -> bool {
        self.current == Some(devhost) && self.current_txid == Some(txid)
    }

    pub fn awaited_txid(&self) -> Option<Txid> {
        self.current_txid
    }

    /// Resolve the current host with `status` and clear the slot.
    ///
    /// Returns false and changes nothing when `devhost` is not the current
    /// host, so late acknowledgments are ignored.
    pub fn complete_current(&mut self, devhost: DevhostId, name: &str, status: Status) -> bool {
        if self.current != Some(devhost) {
            return false;
        }
        if self.current_txid.take().is_some() {
            self.outstanding = self.outstanding.saturating_sub(1);
        }
        if let Some(sent_at) = self.sent_at.take() {
            self.latencies_ms.push(duration_ms(sent_at.elapsed()));
        }
        match status {
            Ok(()) => self.hosts_suspended += 1,
            Err(error) => self.record_failure(devhost, name, error),
        }
        self.current = None;
        true
    }

    /// Drop the current host without a message, e.g. when it has no live
    /// devices left.
    pub fn skip_current(&mut self) {
        if self.current_txid.is_none() {
            self.current = None;
        }
    }

    /// Record a failure for a host. The first failure becomes the overall
    /// status.
    pub fn record_failure(&mut self, devhost: DevhostId, name: &str, error: Error) {
        if self.status.is_ok() {
            self.status = Err(error.clone());
        }
        self.failures.push(HostFailure {
            devhost,
            name: name.to_string(),
            error,
        });
    }

    /// Nothing left to visit and nothing in flight.
    pub fn is_finished(&self) -> bool {
        self.traversal.is_empty() && self.current.is_none() && self.outstanding == 0
    }

    /// Mark complete and build the report. The notifier and the mexec
    /// payload are handed to the caller.
    pub fn complete(
        &mut self,
    ) -> (
        SuspendReport,
        Option<oneshot::Sender<SuspendReport>>,
        Option<MexecPayload>,
    ) {
        self.state = SuspendState::Complete;
        let report = SuspendReport {
            id: self.id,
            action: self.action,
            status: self.status.clone(),
            hosts_suspended: self.hosts_suspended,
            failures: self.failures.clone(),
            latency: SummaryStatistics::from_values(&self.latencies_ms),
        };
        (report, self.notifier.take(), self.mexec.take())
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Order in which devhosts are suspended: every host comes after all of its
/// child hosts. Roots and siblings are visited in id order.
pub fn build_traversal(hosts: &Arena<DevhostId, Devhost>) -> Vec<DevhostId> {
    let mut children: BTreeMap<DevhostId, Vec<DevhostId>> = BTreeMap::new();
    let mut roots = Vec::new();
    for (id, host) in hosts.iter() {
        match host.parent() {
            Some(parent) if hosts.contains(parent) && parent != id => {
                children.entry(parent).or_default().push(id)
            }
            _ => roots.push(id),
        }
    }

    let mut order = Vec::with_capacity(hosts.len());
    let mut visited = BTreeSet::new();
    for root in roots {
        // Iterative post-order walk; a node is emitted once its children are.
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            if let Some(kids) = children.get(&id) {
                for kid in kids.iter().rev() {
                    stack.push((*kid, false));
                }
            }
        }
    }
    order
}

/// Resume visits hosts in the exact reverse of the suspend order.
pub fn resume_order(suspend_order: &[DevhostId]) -> Vec<DevhostId> {
    suspend_order.iter().rev().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaId;

    fn host_tree(parents: &[Option<usize>]) -> (Arena<DevhostId, Devhost>, Vec<DevhostId>) {
        let mut arena = Arena::new("devhost");
        let mut ids: Vec<DevhostId> = Vec::new();
        for parent in parents {
            let parent = parent.map(|p| ids[p]);
            let id = arena.insert_with(|id| {
                let mut host = Devhost::new(id, "devhost:test");
                host.set_parent(parent);
                host
            });
            ids.push(id);
        }
        (arena, ids)
    }

    fn position(order: &[DevhostId], id: DevhostId) -> usize {
        order.iter().position(|h| *h == id).unwrap()
    }

    #[test]
    fn test_children_before_parents() {
        // 0 -> {1 -> {3, 4}, 2 -> {5}}, 6 standalone
        let (arena, ids) = host_tree(&[None, Some(0), Some(0), Some(1), Some(1), Some(2), None]);
        let order = build_traversal(&arena);
        assert_eq!(order.len(), ids.len());
        for (id, host) in arena.iter() {
            if let Some(parent) = host.parent() {
                assert!(position(&order, id) < position(&order, parent));
            }
        }
        assert_eq!(
            order,
            vec![ids[3], ids[4], ids[1], ids[5], ids[2], ids[0], ids[6]]
        );
        assert_eq!(resume_order(&order)[0], ids[6]);
        assert_eq!(resume_order(&order)[1], ids[0]);
    }

    #[test]
    fn test_deep_and_wide_trees() {
        let mut parents = vec![None];
        for i in 1..200 {
            parents.push(Some((i - 1) / 3));
        }
        let (arena, _) = host_tree(&parents);
        let order = build_traversal(&arena);
        assert_eq!(order.len(), 200);
        for (id, host) in arena.iter() {
            if let Some(parent) = host.parent() {
                assert!(position(&order, id) < position(&order, parent));
            }
        }
    }

    #[test]
    fn test_action_flags() {
        for action in [
            SuspendAction::Reboot,
            SuspendAction::RebootBootloader,
            SuspendAction::RebootRecovery,
            SuspendAction::Poweroff,
            SuspendAction::Mexec,
            SuspendAction::SuspendRam,
        ] {
            assert_eq!(SuspendAction::try_from(action.flags()).unwrap(), action);
        }
        assert_eq!(SuspendAction::Poweroff.flags(), 0xdcdc0200);
        assert!(matches!(
            SuspendAction::try_from(0x1234),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_context_sequencing() {
        let a = DevhostId::from_raw(1);
        let b = DevhostId::from_raw(2);
        let (tx, _rx) = oneshot::channel();
        let mut ctx = SuspendContext::new(
            SuspendId::from_raw(1),
            SuspendAction::Poweroff,
            vec![a, b],
            Some(tx),
        );

        assert_eq!(ctx.advance(), Some(a));
        ctx.message_sent(10);
        assert_eq!(ctx.outstanding(), 1);
        // Only one host is ever current.
        assert_eq!(ctx.advance(), None);
        assert!(!ctx.complete_current(b, "b", Ok(())));
        assert!(ctx.complete_current(a, "a", Err(Error::Timeout)));
        assert_eq!(ctx.outstanding(), 0);
        // A late duplicate is ignored and never underflows the counter.
        assert!(!ctx.complete_current(a, "a", Ok(())));
        assert_eq!(ctx.outstanding(), 0);

        assert_eq!(ctx.advance(), Some(b));
        ctx.message_sent(11);
        assert!(ctx.is_awaiting(b, 11));
        assert!(ctx.complete_current(b, "b", Err(Error::ChannelError("gone".into()))));
        assert!(ctx.is_finished());

        let (report, notifier, mexec) = ctx.complete();
        assert!(notifier.is_some());
        assert!(mexec.is_none());
        assert_eq!(ctx.state(), SuspendState::Complete);
        assert_eq!(report.status, Err(Error::Timeout));
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.hosts_suspended, 0);
        assert!(report.latency.is_some());
    }
}

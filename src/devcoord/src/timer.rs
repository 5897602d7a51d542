// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::Duration;

use crate::device::DeviceId;
use crate::devhost::DevhostId;
use crate::rpc::Txid;
use crate::suspend::SuspendId;

/// Deferred work fed back into the coordinator when its delay expires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// Retry binding `driver` to `device` after a backoff.
    BindRetry { device: DeviceId, driver: String },
    /// Deadline for a devhost to acknowledge a suspend request.
    SuspendTimeout {
        context: SuspendId,
        devhost: DevhostId,
        txid: Txid,
    },
}

/// Arms timers. Expired timers come back through the coordinator's event
/// queue, never as a direct call.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, event: TimerEvent);
}

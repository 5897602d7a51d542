// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use async_trait::async_trait;

use crate::suspend::{MexecPayload, SuspendAction};

/// Final platform action run once every devhost has been suspended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowerRequest {
    pub action: SuspendAction,
    pub mexec: Option<MexecPayload>,
}

#[async_trait]
pub trait PowerController: Send + Sync {
    async fn execute(&self, request: PowerRequest) -> Result<()>;
}

/// Logs the request instead of touching the platform.
#[derive(Debug, Default)]
pub struct LoggingPowerController;

#[async_trait]
impl PowerController for LoggingPowerController {
    async fn execute(&self, request: PowerRequest) -> Result<()> {
        let (kernel, bootdata) = request
            .mexec
            .as_ref()
            .map_or((0, 0), |m| (m.kernel.len(), m.bootdata.len()));
        info!(sl!(), "platform power action";
            "action" => format!("{:?}", request.action),
            "flags" => format!("{:#x}", request.action.flags()),
            "kernel_bytes" => kernel,
            "bootdata_bytes" => bootdata);
        Ok(())
    }
}

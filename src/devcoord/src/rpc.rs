// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Logical request/response contract between the coordinator and devhosts.
//!
//! Every send is fire-and-forget. Completions come back later as
//! [`HostMessage`]s delivered to the coordinator's event queue, so callers
//! never observe a synchronous result from a devhost.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::device::{DeviceId, DeviceProp};
use crate::devhost::DevhostId;
use crate::error::{Error, Result, Status};

/// Transaction id pairing a request with its reply.
pub type Txid = u64;

/// Payload of a reply to a devhost-initiated request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyPayload {
    Empty,
    Device(DeviceId),
    Metadata(Vec<u8>),
}

/// Coordinator to devhost.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostRequest {
    CreateDevice {
        txid: Txid,
        device: DeviceId,
        libname: String,
        args: Option<String>,
        protocol_id: u32,
    },
    CreateDeviceStub {
        txid: Txid,
        device: DeviceId,
        protocol_id: u32,
    },
    BindDriver {
        txid: Txid,
        device: DeviceId,
        libname: String,
    },
    ConnectProxy {
        txid: Txid,
        device: DeviceId,
        proxy: DeviceId,
    },
    RemoveDevice {
        txid: Txid,
        device: DeviceId,
    },
    Suspend {
        txid: Txid,
        device: DeviceId,
        flags: u32,
    },
    Reply {
        txid: Txid,
        result: std::result::Result<ReplyPayload, Error>,
    },
}

impl HostRequest {
    pub fn txid(&self) -> Txid {
        match self {
            HostRequest::CreateDevice { txid, .. }
            | HostRequest::CreateDeviceStub { txid, .. }
            | HostRequest::BindDriver { txid, .. }
            | HostRequest::ConnectProxy { txid, .. }
            | HostRequest::RemoveDevice { txid, .. }
            | HostRequest::Suspend { txid, .. }
            | HostRequest::Reply { txid, .. } => *txid,
        }
    }
}

/// Devhost to coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum HostMessage {
    /// Completion of a coordinator request queued on `device`.
    Reply {
        txid: Txid,
        device: DeviceId,
        status: Status,
    },
    AddDevice {
        txid: Txid,
        parent: DeviceId,
        name: String,
        libname: String,
        args: Option<String>,
        protocol_id: u32,
        props: Vec<DeviceProp>,
        flags: u32,
    },
    RemoveDevice {
        txid: Txid,
        device: DeviceId,
    },
    MakeVisible {
        txid: Txid,
        device: DeviceId,
    },
    BindDevice {
        txid: Txid,
        device: DeviceId,
        driver: String,
    },
    AddMetadata {
        txid: Txid,
        device: DeviceId,
        kind: u32,
        data: Vec<u8>,
    },
    GetMetadata {
        txid: Txid,
        device: DeviceId,
        kind: u32,
    },
    /// The device's rpc channel was closed by the devhost.
    DeviceClosed { device: DeviceId },
}

/// Outbound half of a devhost channel.
pub trait HostChannel: Send + Sync {
    fn send(&self, request: HostRequest) -> Result<()>;
}

impl HostChannel for UnboundedSender<HostRequest> {
    fn send(&self, request: HostRequest) -> Result<()> {
        UnboundedSender::send(self, request)
            .map_err(|e| Error::ChannelError(format!("devhost channel closed: {}", e)))
    }
}

/// Handle on a running devhost process.
pub trait HostProcess: Send {
    fn kill(&mut self) -> Result<()>;
}

/// Parameters for starting a devhost.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub devhost: DevhostId,
    pub name: String,
    pub parent: Option<DevhostId>,
}

/// What a successful launch hands back to the coordinator.
pub struct LaunchedDevhost {
    pub channel: Arc<dyn HostChannel>,
    pub process: Box<dyn HostProcess>,
    pub koid: u64,
}

/// Starts devhost processes.
pub trait DevhostLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedDevhost>;
}

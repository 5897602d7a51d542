// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Device coordinator.
//!
//! Maintains the device tree, matches drivers to devices, launches and reaps
//! devhost processes, and drives ordered system-wide suspend.

#[macro_use]
extern crate slog;

logging::logger_with_subsystem!(sl, "devcoord");

pub mod arena;
pub mod config;
pub mod coordinator;
pub mod counters;
pub mod devfs;
pub mod device;
pub mod devhost;
pub mod driver;
pub mod error;
pub mod launcher;
pub mod power;
pub mod protocol;
pub mod rpc;
pub mod service;
pub mod stats;
pub mod suspend;
pub mod timer;

#[cfg(test)]
mod test_utils;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use device::{DeviceFlags, DeviceId, DeviceSpec};
pub use devhost::DevhostId;
pub use error::{Error, Result, Status};
pub use service::{CoordinatorHandle, CoordinatorService};
pub use suspend::{SuspendAction, SuspendReport};

// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Fakes shared by the unit tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;
use crate::device::DeviceId;
use crate::devfs::{DevfsTree, DevfsWatchers};
use crate::devhost::DevhostId;
use crate::driver::tests::write_driver;
use crate::error::{Error, Result};
use crate::rpc::{DevhostLauncher, HostChannel, HostProcess, HostRequest, LaunchSpec, LaunchedDevhost};
use crate::timer::{Scheduler, TimerEvent};

/// Channel that records everything sent to a devhost.
#[derive(Clone, Default)]
pub struct RecordingChannel {
    sent: Arc<Mutex<Vec<HostRequest>>>,
    broken: Arc<AtomicBool>,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<HostRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<HostRequest> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

impl HostChannel for RecordingChannel {
    fn send(&self, request: HostRequest) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::ChannelError("peer closed".to_string()));
        }
        self.sent.lock().unwrap().push(request);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeProcess {
    killed: Arc<AtomicBool>,
}

impl FakeProcess {
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl HostProcess for FakeProcess {
    fn kill(&mut self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct LauncherState {
    launches: Vec<LaunchSpec>,
    channels: BTreeMap<DevhostId, RecordingChannel>,
    processes: BTreeMap<DevhostId, FakeProcess>,
}

/// Launcher handing out recording channels instead of processes.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
    fail: Arc<AtomicBool>,
}

impl FakeLauncher {
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn channel(&self, host: DevhostId) -> RecordingChannel {
        self.state.lock().unwrap().channels[&host].clone()
    }

    pub fn process(&self, host: DevhostId) -> FakeProcess {
        self.state.lock().unwrap().processes[&host].clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl DevhostLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedDevhost> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Io("no such binary".to_string()));
        }
        let channel = RecordingChannel::default();
        let process = FakeProcess::default();
        let mut state = self.state.lock().unwrap();
        state.launches.push(spec.clone());
        state.channels.insert(spec.devhost, channel.clone());
        state.processes.insert(spec.devhost, process.clone());
        Ok(LaunchedDevhost {
            channel: Arc::new(channel),
            process: Box::new(process),
            koid: 1000 + state.launches.len() as u64,
        })
    }
}

/// Scheduler that only records timers; tests fire them by hand.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    timers: Arc<Mutex<Vec<(Duration, TimerEvent)>>>,
}

impl ManualScheduler {
    pub fn take(&self) -> Vec<(Duration, TimerEvent)> {
        std::mem::take(&mut *self.timers.lock().unwrap())
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, event: TimerEvent) {
        self.timers.lock().unwrap().push((delay, event));
    }
}

/// A coordinator wired to fakes, plus a scratch driver directory.
pub struct TestBed {
    pub coordinator: Coordinator,
    pub launcher: FakeLauncher,
    pub scheduler: ManualScheduler,
    pub devfs: DevfsWatchers,
    pub dir: TempDir,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        let launcher = FakeLauncher::default();
        let scheduler = ManualScheduler::default();
        let tree = DevfsTree::new();
        let devfs = tree.watchers();
        let coordinator = Coordinator::new(
            config,
            Box::new(launcher.clone()),
            Box::new(scheduler.clone()),
            Box::new(tree),
        )
        .unwrap();
        TestBed {
            coordinator,
            launcher,
            scheduler,
            devfs,
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn write_driver(&self, name: &str, protocol_id: u32, fallback: bool) -> PathBuf {
        write_driver(self.dir.path(), name, protocol_id, fallback)
    }

    pub fn load_driver(&mut self, name: &str, protocol_id: u32) {
        let path = self.write_driver(name, protocol_id, false);
        self.coordinator.load_driver(&path).unwrap();
    }

    /// The devhost running the device and its recording channel.
    pub fn host_of(&self, device: DeviceId) -> (DevhostId, RecordingChannel) {
        let host = self.coordinator.device(device).unwrap().host().unwrap();
        (host, self.launcher.channel(host))
    }
}

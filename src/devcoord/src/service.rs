// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Single-consumer event loop driving the [`Coordinator`].
//!
//! Devhost messages, process exits, expired timers and administrative
//! commands are all funneled into one queue and handled one at a time, so
//! coordinator state never needs a lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::coordinator::Coordinator;
use crate::device::{DeviceId, DeviceSpec};
use crate::devhost::DevhostId;
use crate::error::{Error, Result};
use crate::power::PowerController;
use crate::rpc::HostMessage;
use crate::suspend::{MexecPayload, SuspendAction, SuspendId, SuspendReport};
use crate::timer::{Scheduler, TimerEvent};

/// Requests from outside the coordinator, each answered on its `reply`.
pub enum Command {
    LoadDriver {
        path: PathBuf,
        reply: oneshot::Sender<Result<String>>,
    },
    Publish {
        parent: DeviceId,
        spec: DeviceSpec,
        reply: oneshot::Sender<Result<DeviceId>>,
    },
    Remove {
        device: DeviceId,
        reply: oneshot::Sender<Result<()>>,
    },
    Suspend {
        action: SuspendAction,
        mexec: Option<MexecPayload>,
        notifier: oneshot::Sender<SuspendReport>,
        reply: oneshot::Sender<Result<SuspendId>>,
    },
    Dump {
        reply: oneshot::Sender<String>,
    },
    Shutdown,
}

pub enum CoordinatorEvent {
    Host {
        devhost: DevhostId,
        message: HostMessage,
    },
    HostExited {
        devhost: DevhostId,
    },
    Timer(TimerEvent),
    Command(Command),
}

pub type EventSender = UnboundedSender<CoordinatorEvent>;
pub type EventReceiver = UnboundedReceiver<CoordinatorEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    unbounded_channel()
}

/// Arms timers as tokio tasks that post the event back to the queue.
pub struct TokioScheduler {
    events: EventSender,
}

impl TokioScheduler {
    pub fn new(events: EventSender) -> Self {
        TokioScheduler { events }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, event: TimerEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The service may have stopped in the meantime.
            let _ = events.send(CoordinatorEvent::Timer(event));
        });
    }
}

pub struct CoordinatorService {
    coordinator: Coordinator,
    events: EventReceiver,
    power: Arc<dyn PowerController>,
}

impl CoordinatorService {
    pub fn new(
        coordinator: Coordinator,
        events: EventReceiver,
        power: Arc<dyn PowerController>,
    ) -> Self {
        CoordinatorService {
            coordinator,
            events,
            power,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Handle events until a `Shutdown` command arrives or every sender is
    /// gone. Platform actions queued by completed suspends run in between.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(sl!(), "coordinator service running");
        while let Some(event) = self.events.recv().await {
            let keep_going = self.handle_event(event);

            for request in self.coordinator.take_power_requests() {
                if let Err(e) = self.power.execute(request).await {
                    error!(sl!(), "power action failed: {:?}", e);
                }
            }
            if !keep_going {
                break;
            }
        }
        match self.coordinator.counters().encode() {
            Ok(text) => debug!(sl!(), "counters at exit:\n{}", text),
            Err(e) => warn!(sl!(), "cannot encode counters: {}", e),
        }
        info!(sl!(), "coordinator service stopped");
        Ok(())
    }

    fn handle_event(&mut self, event: CoordinatorEvent) -> bool {
        match event {
            CoordinatorEvent::Host { devhost, message } => {
                if let Err(e) = self.coordinator.handle_host_message(devhost, message) {
                    debug!(sl!(), "message from {} failed: {}", devhost, e);
                }
            }
            CoordinatorEvent::HostExited { devhost } => {
                self.coordinator.handle_devhost_exited(devhost)
            }
            CoordinatorEvent::Timer(event) => self.coordinator.handle_timer(event),
            CoordinatorEvent::Command(Command::Shutdown) => return false,
            CoordinatorEvent::Command(command) => self.handle_command(command),
        }
        true
    }

    fn handle_command(&mut self, command: Command) {
        let c = &mut self.coordinator;
        // Requesters that stopped waiting are not an error.
        match command {
            Command::LoadDriver { path, reply } => {
                let result = c.load_driver(&path).map(|d| d.name().to_string());
                let _ = reply.send(result);
            }
            Command::Publish {
                parent,
                spec,
                reply,
            } => {
                let _ = reply.send(c.publish(parent, spec, None));
            }
            Command::Remove { device, reply } => {
                let _ = reply.send(c.remove(device));
            }
            Command::Suspend {
                action,
                mexec,
                notifier,
                reply,
            } => {
                let result = match (action, mexec) {
                    (SuspendAction::Mexec, Some(payload)) => {
                        c.initiate_mexec(payload.kernel, payload.bootdata, Some(notifier))
                    }
                    (SuspendAction::Mexec, None) => {
                        Err(Error::InvalidArgs("mexec needs a payload".to_string()))
                    }
                    (action, _) => c.initiate_suspend(action, Some(notifier)),
                };
                let _ = reply.send(result);
            }
            Command::Dump { reply } => {
                let _ = reply.send(c.dump());
            }
            Command::Shutdown => {}
        }
    }
}

/// Cloneable front end posting commands to a running service.
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: EventSender,
}

fn stopped() -> Error {
    Error::ChannelError("coordinator service stopped".to_string())
}

impl CoordinatorHandle {
    pub fn new(events: EventSender) -> Self {
        CoordinatorHandle { events }
    }

    async fn request<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(CoordinatorEvent::Command(build(tx)))
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Load a driver manifest; returns the driver name.
    pub async fn load_driver(&self, path: PathBuf) -> Result<String> {
        self.request(|reply| Command::LoadDriver { path, reply })
            .await?
    }

    pub async fn publish(&self, parent: DeviceId, spec: DeviceSpec) -> Result<DeviceId> {
        self.request(|reply| Command::Publish {
            parent,
            spec,
            reply,
        })
        .await?
    }

    pub async fn remove(&self, device: DeviceId) -> Result<()> {
        self.request(|reply| Command::Remove { device, reply }).await?
    }

    /// Suspend every devhost and wait for the report.
    pub async fn suspend(&self, action: SuspendAction) -> Result<SuspendReport> {
        self.suspend_with(action, None).await
    }

    pub async fn reboot(&self) -> Result<SuspendReport> {
        self.suspend_with(SuspendAction::Reboot, None).await
    }

    pub async fn poweroff(&self) -> Result<SuspendReport> {
        self.suspend_with(SuspendAction::Poweroff, None).await
    }

    pub async fn mexec(&self, kernel: Vec<u8>, bootdata: Vec<u8>) -> Result<SuspendReport> {
        self.suspend_with(SuspendAction::Mexec, Some(MexecPayload { kernel, bootdata }))
            .await
    }

    async fn suspend_with(
        &self,
        action: SuspendAction,
        mexec: Option<MexecPayload>,
    ) -> Result<SuspendReport> {
        let (notifier, report) = oneshot::channel();
        let id = self
            .request(|reply| Command::Suspend {
                action,
                mexec,
                notifier,
                reply,
            })
            .await??;
        debug!(sl!(), "waiting for {}", id);
        report.await.map_err(|_| stopped())
    }

    pub async fn dump(&self) -> Result<String> {
        self.request(|reply| Command::Dump { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.events
            .send(CoordinatorEvent::Command(Command::Shutdown))
            .map_err(|_| stopped())
    }
}

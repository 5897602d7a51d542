// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Devhost processes speaking newline-delimited JSON over stdio.
//!
//! Requests are serialized onto the child's stdin by a writer task; every
//! line the child prints on stdout is parsed as a [`HostMessage`] and queued
//! as a coordinator event. End of stdout means the devhost exited.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::devhost::DevhostId;
use crate::error::{Error, Result};
use crate::rpc::{DevhostLauncher, HostMessage, HostProcess, HostRequest, LaunchSpec, LaunchedDevhost};
use crate::service::{CoordinatorEvent, EventSender};

pub struct ProcessLauncher {
    binary: PathBuf,
    args: Vec<String>,
    events: EventSender,
}

impl ProcessLauncher {
    pub fn new(binary: PathBuf, args: Vec<String>, events: EventSender) -> Self {
        ProcessLauncher {
            binary,
            args,
            events,
        }
    }
}

impl DevhostLauncher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedDevhost> {
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .arg("--name")
            .arg(&spec.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Io(format!("spawn {}: {}", self.binary.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Io(format!("{} has no stdin", spec.name)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io(format!("{} has no stdout", spec.name)))?;
        let koid = child.id().map(u64::from).unwrap_or_default();

        let (tx, rx) = unbounded_channel();
        tokio::spawn(write_requests(spec.devhost, stdin, rx));
        tokio::spawn(read_messages(spec.devhost, stdout, self.events.clone()));
        info!(sl!(), "spawned {} as pid {}", spec.name, koid);

        Ok(LaunchedDevhost {
            channel: Arc::new(tx),
            process: Box::new(DevhostProcess { child }),
            koid,
        })
    }
}

struct DevhostProcess {
    child: Child,
}

impl HostProcess for DevhostProcess {
    fn kill(&mut self) -> Result<()> {
        self.child.start_kill().map_err(Error::from)
    }
}

async fn write_requests(
    devhost: DevhostId,
    mut stdin: ChildStdin,
    mut requests: UnboundedReceiver<HostRequest>,
) {
    while let Some(request) = requests.recv().await {
        let mut line = match serde_json::to_vec(&request) {
            Ok(line) => line,
            Err(e) => {
                error!(sl!(), "cannot encode request for {}: {}", devhost, e);
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdin.write_all(&line).await {
            warn!(sl!(), "write to {} failed: {}", devhost, e);
            break;
        }
    }
    debug!(sl!(), "writer for {} stopped", devhost);
}

async fn read_messages(devhost: DevhostId, stdout: ChildStdout, events: EventSender) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<HostMessage>(&line) {
                Ok(message) => {
                    if events
                        .send(CoordinatorEvent::Host { devhost, message })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => warn!(sl!(), "malformed message from {}: {}", devhost, e),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(sl!(), "read from {} failed: {}", devhost, e);
                break;
            }
        }
    }
    let _ = events.send(CoordinatorEvent::HostExited { devhost });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaId;
    use crate::device::DeviceId;
    use crate::rpc::HostChannel;
    use crate::service;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            devhost: DevhostId::from_raw(3),
            name: "devhost:test".to_string(),
            parent: None,
        }
    }

    #[actix_rt::test]
    async fn test_process_round_trip() {
        let (tx, mut rx) = service::channel();
        // The script waits for one request before answering.
        let script = r#"read line; echo 'garbage'; echo '{"msg":"device_closed","device":7}'"#;
        let launcher = ProcessLauncher::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
            tx,
        );
        let launched = launcher.launch(&spec()).unwrap();
        assert!(launched.koid > 0);

        launched
            .channel
            .send(HostRequest::RemoveDevice {
                txid: 1,
                device: DeviceId::from_raw(7),
            })
            .unwrap();

        match rx.recv().await.unwrap() {
            CoordinatorEvent::Host { devhost, message } => {
                assert_eq!(devhost, DevhostId::from_raw(3));
                assert_eq!(
                    message,
                    HostMessage::DeviceClosed {
                        device: DeviceId::from_raw(7)
                    }
                );
            }
            _ => panic!("expected a host message"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            CoordinatorEvent::HostExited { devhost } if devhost == DevhostId::from_raw(3)
        ));
    }

    #[actix_rt::test]
    async fn test_kill() {
        let (tx, mut rx) = service::channel();
        let launcher = ProcessLauncher::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), "exec sleep 30".to_string()],
            tx,
        );
        let mut launched = launcher.launch(&spec()).unwrap();
        launched.process.kill().unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            CoordinatorEvent::HostExited { .. }
        ));
    }

    #[actix_rt::test]
    async fn test_missing_binary() {
        let (tx, _rx) = service::channel();
        let launcher = ProcessLauncher::new(PathBuf::from("/nonexistent/devhost"), vec![], tx);
        assert!(matches!(launcher.launch(&spec()), Err(Error::Io(_))));
    }
}

// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Filesystem-visible device namespace.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::protocol::{is_publishable, protocol_name};

pub const DEVFS_ROOT: &str = "/dev";
pub const DEVFS_CLASS: &str = "/dev/class";

/// Change notification delivered to namespace watchers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DevfsEvent {
    Added(String),
    Removed(String),
    Modified(String),
}

/// Side-effecting view of the device namespace used by the coordinator.
pub trait Devfs: Send {
    /// Reserve a node for `device` below its parent's node. Invisible nodes
    /// stay hidden until advertised.
    fn publish(
        &mut self,
        device: DeviceId,
        parent: Option<DeviceId>,
        name: &str,
        protocol_id: u32,
        visible: bool,
    ) -> Result<()>;

    fn unpublish(&mut self, device: DeviceId);

    fn advertise(&mut self, device: DeviceId) -> Result<()>;

    fn advertise_modified(&mut self, device: DeviceId) -> Result<()>;

    fn path(&self, device: DeviceId) -> Option<String>;
}

/// Registered watchers. Shared with threads outside the dispatch loop.
#[derive(Clone, Default)]
pub struct DevfsWatchers {
    senders: Arc<Mutex<Vec<UnboundedSender<DevfsEvent>>>>,
}

impl DevfsWatchers {
    pub fn watch(&self) -> UnboundedReceiver<DevfsEvent> {
        let (tx, rx) = unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn len(&self) -> usize {
        self.senders.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, event: DevfsEvent) {
        // Watchers that dropped their receiver are forgotten.
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Debug)]
struct DevfsNode {
    path: String,
    class_path: Option<String>,
    visible: bool,
}

/// In-memory device namespace.
#[derive(Default)]
pub struct DevfsTree {
    nodes: BTreeMap<DeviceId, DevfsNode>,
    paths: BTreeSet<String>,
    class_next: BTreeMap<u32, u32>,
    watchers: DevfsWatchers,
}

impl DevfsTree {
    pub fn new() -> Self {
        DevfsTree::default()
    }

    pub fn watchers(&self) -> DevfsWatchers {
        self.watchers.clone()
    }

    pub fn watch(&self) -> UnboundedReceiver<DevfsEvent> {
        self.watchers.watch()
    }

    /// Visible paths, class aliases included, in lexical order.
    pub fn entries(&self) -> Vec<String> {
        let mut entries: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.visible)
            .flat_map(|n| std::iter::once(n.path.clone()).chain(n.class_path.clone()))
            .collect();
        entries.sort();
        entries
    }

    fn class_alias(&mut self, protocol_id: u32) -> Option<String> {
        if !is_publishable(protocol_id) {
            return None;
        }
        let name = protocol_name(protocol_id)?;
        let next = self.class_next.entry(protocol_id).or_insert(0);
        let alias = format!("{}/{}/{:03}", DEVFS_CLASS, name, next);
        *next += 1;
        Some(alias)
    }

    fn announce(&self, node: &DevfsNode, event: fn(String) -> DevfsEvent) {
        self.watchers.notify(event(node.path.clone()));
        if let Some(class_path) = &node.class_path {
            self.watchers.notify(event(class_path.clone()));
        }
    }
}

impl Devfs for DevfsTree {
    fn publish(
        &mut self,
        device: DeviceId,
        parent: Option<DeviceId>,
        name: &str,
        protocol_id: u32,
        visible: bool,
    ) -> Result<()> {
        if self.nodes.contains_key(&device) {
            return Err(Error::AlreadyExists(format!("devfs node for {}", device)));
        }
        let path = match parent {
            Some(parent) => {
                let parent = self
                    .nodes
                    .get(&parent)
                    .ok_or_else(|| Error::NotFound(format!("devfs node for {}", parent)))?;
                format!("{}/{}", parent.path, name)
            }
            None => DEVFS_ROOT.to_string(),
        };
        if self.paths.contains(&path) {
            return Err(Error::AlreadyExists(path));
        }

        let class_path = self.class_alias(protocol_id);
        let node = DevfsNode {
            path: path.clone(),
            class_path,
            visible,
        };
        if visible {
            self.announce(&node, DevfsEvent::Added);
        }
        self.paths.insert(path);
        self.nodes.insert(device, node);
        Ok(())
    }

    fn unpublish(&mut self, device: DeviceId) {
        if let Some(node) = self.nodes.remove(&device) {
            self.paths.remove(&node.path);
            if node.visible {
                self.announce(&node, DevfsEvent::Removed);
            }
        }
    }

    fn advertise(&mut self, device: DeviceId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&device)
            .ok_or_else(|| Error::NotFound(format!("devfs node for {}", device)))?;
        if node.visible {
            return Ok(());
        }
        node.visible = true;
        let node = &self.nodes[&device];
        self.announce(node, DevfsEvent::Added);
        Ok(())
    }

    fn advertise_modified(&mut self, device: DeviceId) -> Result<()> {
        let node = self
            .nodes
            .get(&device)
            .ok_or_else(|| Error::NotFound(format!("devfs node for {}", device)))?;
        if node.visible {
            self.watchers.notify(DevfsEvent::Modified(node.path.clone()));
        }
        Ok(())
    }

    fn path(&self, device: DeviceId) -> Option<String> {
        self.nodes.get(&device).map(|n| n.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaId;
    use crate::protocol::{PROTOCOL_BLOCK, PROTOCOL_ROOT};

    fn id(raw: u64) -> DeviceId {
        DeviceId::from_raw(raw)
    }

    #[test]
    fn test_paths_and_class_aliases() {
        let mut devfs = DevfsTree::new();
        devfs.publish(id(1), None, "root", PROTOCOL_ROOT, true).unwrap();
        devfs.publish(id(2), Some(id(1)), "sys", 0, true).unwrap();
        devfs
            .publish(id(3), Some(id(2)), "disk0", PROTOCOL_BLOCK, true)
            .unwrap();
        devfs
            .publish(id(4), Some(id(2)), "disk1", PROTOCOL_BLOCK, false)
            .unwrap();

        assert_eq!(devfs.path(id(3)).as_deref(), Some("/dev/sys/disk0"));
        assert_eq!(
            devfs.entries(),
            vec!["/dev", "/dev/class/block/000", "/dev/sys", "/dev/sys/disk0"]
        );

        devfs.advertise(id(4)).unwrap();
        assert!(devfs.entries().contains(&"/dev/class/block/001".to_string()));
    }

    #[test]
    fn test_publish_errors() {
        let mut devfs = DevfsTree::new();
        devfs.publish(id(1), None, "root", PROTOCOL_ROOT, true).unwrap();
        devfs.publish(id(2), Some(id(1)), "a", 0, true).unwrap();
        assert!(matches!(
            devfs.publish(id(3), Some(id(1)), "a", 0, true),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            devfs.publish(id(4), Some(id(9)), "b", 0, true),
            Err(Error::NotFound(_))
        ));
        assert!(devfs.advertise(id(9)).is_err());

        devfs.unpublish(id(2));
        devfs.publish(id(3), Some(id(1)), "a", 0, true).unwrap();
    }

    #[test]
    fn test_watchers() {
        let mut devfs = DevfsTree::new();
        let mut rx = devfs.watch();
        devfs.publish(id(1), None, "root", PROTOCOL_ROOT, true).unwrap();
        devfs.publish(id(2), Some(id(1)), "hidden", 0, false).unwrap();
        devfs.advertise(id(2)).unwrap();
        devfs.advertise_modified(id(2)).unwrap();
        devfs.unpublish(id(2));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                DevfsEvent::Added("/dev".to_string()),
                DevfsEvent::Added("/dev/hidden".to_string()),
                DevfsEvent::Modified("/dev/hidden".to_string()),
                DevfsEvent::Removed("/dev/hidden".to_string()),
            ]
        );

        drop(rx);
        devfs.advertise_modified(id(1)).unwrap();
        assert!(devfs.watchers().is_empty());
    }
}

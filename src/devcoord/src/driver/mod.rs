// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Driver records, manifest loading and the binding registry.

pub mod binding;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use serde::Deserialize;

use crate::device::Device;
use crate::error::{Error, Result};
use binding::{BindContext, BindInst, BindProgram};

/// Longest accepted driver name, in bytes.
pub const DRIVER_NAME_LEN_MAX: usize = 64;
/// File extension of driver manifests.
pub const DRIVER_MANIFEST_EXT: &str = "json";

bitflags! {
    pub struct DriverFlags: u32 {
        /// Only considered after every regular driver.
        const FALLBACK = 0x01;
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DriverManifest {
    name: String,
    library: PathBuf,
    #[serde(default)]
    version: String,
    #[serde(default)]
    fallback: bool,
    binding: Vec<[u32; 2]>,
}

/// A loaded driver. Immutable once loaded.
#[derive(Debug)]
pub struct Driver {
    name: String,
    libname: String,
    version: String,
    flags: DriverFlags,
    binding: BindProgram,
    binary: File,
}

impl Driver {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the driver library handed to devhosts.
    pub fn libname(&self) -> &str {
        &self.libname
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn flags(&self) -> DriverFlags {
        self.flags
    }

    pub fn binding(&self) -> &BindProgram {
        &self.binding
    }

    /// Open handle on the driver library, held for the driver's lifetime.
    pub fn binary(&self) -> &File {
        &self.binary
    }

    pub fn is_bindable(&self, protocol_id: u32, props: &[crate::device::DeviceProp], autobind: bool) -> bool {
        self.binding.evaluate(&BindContext {
            protocol_id,
            props,
            autobind,
        })
    }

    pub fn is_bindable_to(&self, device: &Device, autobind: bool) -> bool {
        self.is_bindable(device.protocol_id, &device.props, autobind)
    }
}

/// Load the driver described by the manifest at `path`.
pub fn load_driver(path: &Path) -> Result<Driver> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::NotFound(format!("driver manifest {}: {}", path.display(), e)))?;
    let manifest: DriverManifest = serde_json::from_str(&content)
        .map_err(|e| Error::BadBinding(format!("{}: {}", path.display(), e)))?;

    if manifest.name.is_empty() || manifest.name.len() > DRIVER_NAME_LEN_MAX {
        return Err(Error::BadBinding(format!(
            "{}: driver name must be 1..={} bytes",
            path.display(),
            DRIVER_NAME_LEN_MAX
        )));
    }

    let insts = manifest
        .binding
        .iter()
        .map(|[op, arg]| BindInst { op: *op, arg: *arg })
        .collect();
    let binding = BindProgram::new(insts)
        .map_err(|e| Error::BadBinding(format!("{}: {}", path.display(), e)))?;

    let library = match path.parent() {
        Some(dir) if manifest.library.is_relative() => dir.join(&manifest.library),
        _ => manifest.library.clone(),
    };
    let binary = File::open(&library)
        .map_err(|e| Error::NotFound(format!("driver library {}: {}", library.display(), e)))?;

    let mut flags = DriverFlags::empty();
    if manifest.fallback {
        flags.insert(DriverFlags::FALLBACK);
    }

    Ok(Driver {
        name: manifest.name,
        libname: library.to_string_lossy().into_owned(),
        version: manifest.version,
        flags,
        binding,
        binary,
    })
}

/// Lazy, single pass over the driver manifests of a directory.
///
/// Entries are visited in file-name order. Manifests that fail to load are
/// handed to the error callback and skipped.
pub struct LoadableDrivers<F>
where
    F: FnMut(&Path, &Error),
{
    entries: std::vec::IntoIter<PathBuf>,
    on_error: F,
}

impl<F> Iterator for LoadableDrivers<F>
where
    F: FnMut(&Path, &Error),
{
    type Item = Driver;

    fn next(&mut self) -> Option<Driver> {
        for path in self.entries.by_ref() {
            match load_driver(&path) {
                Ok(driver) => return Some(driver),
                Err(e) => (self.on_error)(&path, &e),
            }
        }
        None
    }
}

pub fn find_loadable_drivers<F>(dir: &Path, on_error: F) -> Result<LoadableDrivers<F>>
where
    F: FnMut(&Path, &Error),
{
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == DRIVER_MANIFEST_EXT) {
            entries.push(path);
        }
    }
    entries.sort();

    Ok(LoadableDrivers {
        entries: entries.into_iter(),
        on_error,
    })
}

/// Drivers in binding evaluation order.
///
/// Regular drivers come first in load order, followed by fallback drivers in
/// load order. Append-only.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        DriverRegistry::default()
    }

    pub fn insert(&mut self, driver: Driver) -> Result<Arc<Driver>> {
        if self.drivers.iter().any(|d| d.name == driver.name) {
            return Err(Error::AlreadyExists(format!("driver {}", driver.name)));
        }
        self.drivers.try_reserve(1)?;

        let driver = Arc::new(driver);
        let pos = if driver.flags.contains(DriverFlags::FALLBACK) {
            self.drivers.len()
        } else {
            self.drivers
                .iter()
                .position(|d| d.flags.contains(DriverFlags::FALLBACK))
                .unwrap_or(self.drivers.len())
        };
        self.drivers.insert(pos, driver.clone());
        Ok(driver)
    }

    pub fn find(&self, name: &str) -> Result<Arc<Driver>> {
        self.drivers
            .iter()
            .find(|d| d.name == name || d.libname == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("driver {}", name)))
    }

    /// Snapshot in evaluation order.
    pub fn drivers(&self) -> Vec<Arc<Driver>> {
        self.drivers.clone()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

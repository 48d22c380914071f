// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: In-memory host capabilities materialised from a JSON host description.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Host snapshots.
//!
//! A snapshot describes a host in one JSON document: registry nodes, the
//! mount table, firmware variables and per-volume metadata keyed by BSD name.
//! Volume metadata is looked up through the mount table, so volumes mounted
//! privately during a run find their records wherever they land.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use bless_record::{ApfsBlessData, BlessRecord, FinderInfo};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::accessor::{
    AttributeSpec, CatalogEntry, MetadataStore, VolumeSnapshot, ROOT_OBJECT_ID,
};
use crate::codec::VariableStore;
use crate::error::{BlessError, Result};
use crate::mount::{
    mount_containing, CommandOutcome, CommandRunner, CommandSpec, MountEntry, MountTable,
};
use crate::registry::memory::{MemoryRegistry, NodeSpec};
use crate::topology::strip_dev;

/// One object in a volume catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeObject {
    /// Name within the parent directory.
    pub name: String,
    /// Object id of the parent directory.
    pub parent: u64,
    /// Whether the object is a directory.
    #[serde(default)]
    pub directory: bool,
    /// Finder info of the object itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finder_info: Option<FinderInfo>,
}

/// Metadata of one volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeImage {
    /// Legacy finder-info words.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finder_info: Option<FinderInfo>,
    /// Container volume bless data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bless_data: Option<ApfsBlessData>,
    /// Catalog objects by id; the root (id 2) is implicit.
    #[serde(default)]
    pub objects: BTreeMap<u64, VolumeObject>,
    /// Whether the volume reports a sealed format.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sealed: bool,
    /// Snapshots in listing order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<VolumeSnapshot>,
}

impl VolumeImage {
    fn object_at(&self, relative: &Path) -> Option<(u64, bool)> {
        let mut cursor = ROOT_OBJECT_ID;
        let mut directory = true;
        for component in relative.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            let name = name.to_str()?;
            let (id, object) = self
                .objects
                .iter()
                .find(|(_, object)| object.parent == cursor && object.name == name)?;
            cursor = *id;
            directory = object.directory;
        }
        Some((cursor, directory))
    }

    fn file_finder_info(&mut self, id: u64) -> Option<&mut Option<FinderInfo>> {
        if id == ROOT_OBJECT_ID {
            return Some(&mut self.finder_info);
        }
        self.objects.get_mut(&id).map(|object| &mut object.finder_info)
    }
}

/// JSON description of a host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSnapshot {
    /// Registry node specs, kept verbatim so the snapshot can be written back.
    #[serde(default)]
    pub registry: Vec<serde_json::Value>,
    /// Mount table.
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
    /// Firmware variables.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Volume metadata by BSD name.
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeImage>,
    /// Devices the simulated mount helper refuses to mount.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unmountable: BTreeSet<String>,
}

impl HostSnapshot {
    /// Parse a snapshot document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| BlessError::InvalidArgument(format!("host snapshot: {err}")))
    }

    /// Read a snapshot file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| BlessError::io(path, err))?;
        Self::from_json(&text)
    }

    /// Write the snapshot back as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|err| BlessError::InvalidArgument(format!("host snapshot: {err}")))?;
        fs::write(path, text + "\n").map_err(|err| BlessError::io(path, err))
    }

    /// Build in-memory collaborators.
    pub fn into_host(self) -> Result<SnapshotHost> {
        let specs = self
            .registry
            .iter()
            .cloned()
            .map(serde_json::from_value::<NodeSpec>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| BlessError::InvalidArgument(format!("registry snapshot: {err}")))?;
        Ok(SnapshotHost {
            registry: MemoryRegistry::from_specs(specs)?,
            mounts: MemoryMountTable::new(self.mounts),
            variables: MemoryVariableStore::new(self.variables),
            volumes: RefCell::new(self.volumes),
            unmountable: self.unmountable,
            raw_registry: self.registry,
        })
    }
}

/// In-memory host built from a [`HostSnapshot`].
#[derive(Debug)]
pub struct SnapshotHost {
    /// Device registry.
    pub registry: MemoryRegistry,
    /// Mount table, updated by the simulated mounter.
    pub mounts: MemoryMountTable,
    /// Firmware variables.
    pub variables: MemoryVariableStore,
    volumes: RefCell<BTreeMap<String, VolumeImage>>,
    unmountable: BTreeSet<String>,
    raw_registry: Vec<serde_json::Value>,
}

impl SnapshotHost {
    /// Mount helper simulation over this host's mount table.
    #[must_use]
    pub fn mounter(&self) -> SimulatedMounter<'_> {
        SimulatedMounter::new(&self.mounts).refusing(self.unmountable.iter().cloned())
    }

    /// Metadata store resolving paths through `table`.
    #[must_use]
    pub fn metadata<'a>(&'a self, table: &'a dyn MountTable) -> MemoryMetadataStore<'a> {
        MemoryMetadataStore {
            table,
            volumes: &self.volumes,
        }
    }

    /// Current state as a snapshot document.
    pub fn snapshot(&self) -> Result<HostSnapshot> {
        Ok(HostSnapshot {
            registry: self.raw_registry.clone(),
            mounts: self.mounts.mounts()?,
            variables: self.variables.values(),
            volumes: self.volumes.borrow().clone(),
            unmountable: self.unmountable.clone(),
        })
    }
}

/// Mount table held in memory.
#[derive(Debug, Default)]
pub struct MemoryMountTable {
    entries: RefCell<Vec<MountEntry>>,
}

impl MemoryMountTable {
    /// Table with initial entries.
    #[must_use]
    pub fn new(entries: Vec<MountEntry>) -> Self {
        Self {
            entries: RefCell::new(entries),
        }
    }

    /// Add a mount.
    pub fn insert(&self, entry: MountEntry) {
        self.entries.borrow_mut().push(entry);
    }

    /// Remove the mount of a device; returns whether one was present.
    pub fn remove_device(&self, device: &str) -> bool {
        let wanted = strip_dev(device);
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|entry| strip_dev(&entry.device) != wanted);
        entries.len() != before
    }
}

impl MountTable for MemoryMountTable {
    fn mounts(&self) -> Result<Vec<MountEntry>> {
        Ok(self.entries.borrow().clone())
    }
}

/// Command runner that interprets mount helper argument vectors against a
/// [`MemoryMountTable`] instead of running them.
#[derive(Debug)]
pub struct SimulatedMounter<'a> {
    table: &'a MemoryMountTable,
    refused: BTreeSet<String>,
    history: RefCell<Vec<CommandSpec>>,
}

impl<'a> SimulatedMounter<'a> {
    /// Mounter over a table.
    #[must_use]
    pub fn new(table: &'a MemoryMountTable) -> Self {
        Self {
            table,
            refused: BTreeSet::new(),
            history: RefCell::new(Vec::new()),
        }
    }

    /// Fail mounts of the given devices.
    #[must_use]
    pub fn refusing(mut self, devices: impl IntoIterator<Item = String>) -> Self {
        self.refused
            .extend(devices.into_iter().map(|device| strip_dev(&device).to_owned()));
        self
    }

    /// Commands run so far.
    #[must_use]
    pub fn history(&self) -> Vec<CommandSpec> {
        self.history.borrow().clone()
    }

    fn mount(&self, args: &[String]) -> CommandOutcome {
        let [.., device, mountpoint] = args else {
            return CommandOutcome::Exited(64);
        };
        let bsd = strip_dev(device);
        if self.refused.contains(bsd) {
            return CommandOutcome::Exited(1);
        }
        let fs_type = args
            .iter()
            .position(|arg| arg == "-t")
            .and_then(|index| args.get(index + 1))
            .cloned()
            .unwrap_or_else(|| "apfs".to_owned());
        self.table.insert(MountEntry {
            device: format!("/dev/{bsd}"),
            mountpoint: PathBuf::from(mountpoint),
            fs_type,
        });
        CommandOutcome::Exited(0)
    }

    fn unmount(&self, args: &[String]) -> CommandOutcome {
        match args {
            [device] if self.table.remove_device(device) => CommandOutcome::Exited(0),
            _ => CommandOutcome::Exited(1),
        }
    }
}

impl CommandRunner for SimulatedMounter<'_> {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutcome> {
        self.history.borrow_mut().push(command.clone());
        let program = command
            .program
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let outcome = match program {
            "mount" | "mount_apfs" => self.mount(&command.args),
            "umount" => self.unmount(&command.args),
            _ => CommandOutcome::Exited(127),
        };
        debug!("simulated {command}: {outcome}");
        Ok(outcome)
    }
}

/// Firmware variables held in memory.
#[derive(Debug, Default)]
pub struct MemoryVariableStore {
    values: RefCell<BTreeMap<String, String>>,
}

impl MemoryVariableStore {
    /// Store with initial values.
    #[must_use]
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self {
            values: RefCell::new(values),
        }
    }

    /// Copy of every variable.
    #[must_use]
    pub fn values(&self) -> BTreeMap<String, String> {
        self.values.borrow().clone()
    }
}

impl VariableStore for MemoryVariableStore {
    fn get_string(&self, name: &str) -> Result<Option<String>> {
        Ok(self.values.borrow().get(name).cloned())
    }

    fn set_string(&self, name: &str, value: &str) -> Result<()> {
        self.values
            .borrow_mut()
            .insert(name.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Volume metadata held in memory, keyed by device.
pub struct MemoryMetadataStore<'a> {
    table: &'a dyn MountTable,
    volumes: &'a RefCell<BTreeMap<String, VolumeImage>>,
}

impl fmt::Debug for MemoryMetadataStore<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMetadataStore")
            .field("volumes", &self.volumes.borrow().len())
            .finish_non_exhaustive()
    }
}

impl MemoryMetadataStore<'_> {
    fn locate(&self, path: &Path) -> Result<(String, PathBuf)> {
        let entry = mount_containing(self.table, path)?
            .ok_or_else(|| BlessError::not_found(format!("mount point for {}", path.display())))?;
        let relative = path
            .strip_prefix(&entry.mountpoint)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok((strip_dev(&entry.device).to_owned(), relative))
    }

    fn unknown_volume(device: &str) -> BlessError {
        BlessError::not_found(format!("metadata for {device}"))
    }

    fn file_slot<'v>(
        image: &'v mut VolumeImage,
        path: &Path,
        relative: &Path,
    ) -> Result<&'v mut Option<FinderInfo>> {
        let (id, _) = image
            .object_at(relative)
            .ok_or_else(|| BlessError::not_found(path.display().to_string()))?;
        image
            .file_finder_info(id)
            .ok_or_else(|| BlessError::not_found(path.display().to_string()))
    }

    fn image_of<T>(&self, path: &Path, read: impl FnOnce(&VolumeImage) -> T) -> Result<T> {
        let (device, _) = self.locate(path)?;
        let volumes = self.volumes.borrow();
        let image = volumes
            .get(&device)
            .ok_or_else(|| Self::unknown_volume(&device))?;
        Ok(read(image))
    }
}

impl MetadataStore for MemoryMetadataStore<'_> {
    fn get_attributes(&self, path: &Path, spec: AttributeSpec) -> Result<Vec<u8>> {
        let (device, relative) = self.locate(path)?;
        let mut volumes = self.volumes.borrow_mut();
        let image = volumes
            .get_mut(&device)
            .ok_or_else(|| Self::unknown_volume(&device))?;
        let record = match spec {
            AttributeSpec::FinderInfo => {
                BlessRecord::from(image.finder_info.unwrap_or_default())
            }
            AttributeSpec::BlessData => BlessRecord::from(image.bless_data.unwrap_or_default()),
            AttributeSpec::FileFinderInfo => {
                let slot = Self::file_slot(image, path, &relative)?;
                BlessRecord::from(slot.unwrap_or_default())
            }
        };
        Ok(record.encode())
    }

    fn set_attributes(&self, path: &Path, spec: AttributeSpec, buffer: &[u8]) -> Result<()> {
        let (device, relative) = self.locate(path)?;
        let mut volumes = self.volumes.borrow_mut();
        let image = volumes
            .get_mut(&device)
            .ok_or_else(|| Self::unknown_volume(&device))?;
        match (spec, BlessRecord::decode(spec.kind(), buffer)?) {
            (AttributeSpec::FileFinderInfo, BlessRecord::LegacyEightWord(info)) => {
                *Self::file_slot(image, path, &relative)? = Some(info);
            }
            (_, BlessRecord::LegacyEightWord(info)) => image.finder_info = Some(info),
            (_, BlessRecord::ModernTwoWord64(data)) => image.bless_data = Some(data),
        }
        debug!("{device}: {spec:?} updated");
        Ok(())
    }

    fn lookup_object(&self, mountpoint: &Path, id: u64) -> Result<Option<CatalogEntry>> {
        let (device, _) = self.locate(mountpoint)?;
        let volumes = self.volumes.borrow();
        let image = volumes
            .get(&device)
            .ok_or_else(|| Self::unknown_volume(&device))?;
        Ok(image.objects.get(&id).map(|object| CatalogEntry {
            name: object.name.clone(),
            parent: object.parent,
        }))
    }

    fn object_id(&self, path: &Path) -> Result<u64> {
        let (device, relative) = self.locate(path)?;
        let volumes = self.volumes.borrow();
        let image = volumes
            .get(&device)
            .ok_or_else(|| Self::unknown_volume(&device))?;
        image
            .object_at(&relative)
            .map(|(id, _)| id)
            .ok_or_else(|| BlessError::not_found(path.display().to_string()))
    }

    fn is_directory(&self, path: &Path) -> Result<bool> {
        let (device, relative) = self.locate(path)?;
        let volumes = self.volumes.borrow();
        Ok(volumes
            .get(&device)
            .and_then(|image| image.object_at(&relative))
            .is_some_and(|(_, directory)| directory))
    }

    fn is_sealed(&self, mountpoint: &Path) -> Result<bool> {
        self.image_of(mountpoint, |image| image.sealed)
    }

    fn snapshots(&self, mountpoint: &Path) -> Result<Vec<VolumeSnapshot>> {
        self.image_of(mountpoint, |image| image.snapshots.clone())
    }
}

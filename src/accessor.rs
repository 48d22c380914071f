// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Read and write bless records on mounted volumes and resolve object ids to paths.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;
use std::path::{Path, PathBuf};

use bless_record::{BlessRecord, FinderInfo, RecordKind};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::BlessConfig;
use crate::context::Context;
use crate::error::{BlessError, Result};
use crate::mount::{mount_containing, MountTable};

/// Object id of a volume's root directory.
pub const ROOT_OBJECT_ID: u64 = 2;

/// Attribute selected by a metadata read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttributeSpec {
    /// Volume root finder-info words.
    FinderInfo,
    /// Container volume bless data.
    BlessData,
    /// Finder info of a single file or folder.
    FileFinderInfo,
}

impl AttributeSpec {
    /// Attribute holding records of the given layout.
    #[must_use]
    pub fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::LegacyEightWord => AttributeSpec::FinderInfo,
            RecordKind::ModernTwoWord64 => AttributeSpec::BlessData,
        }
    }

    /// Layout of the records the attribute holds.
    #[must_use]
    pub fn kind(self) -> RecordKind {
        match self {
            AttributeSpec::FinderInfo | AttributeSpec::FileFinderInfo => {
                RecordKind::LegacyEightWord
            }
            AttributeSpec::BlessData => RecordKind::ModernTwoWord64,
        }
    }
}

/// Catalog entry returned by an object-id query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Name of the object within its parent.
    pub name: String,
    /// Object id of the parent directory.
    pub parent: u64,
}

/// Transaction id bit marking a snapshot as the one to boot from.
pub const SNAPSHOT_MARKED_AS_ROOT: u64 = 1 << 63;

/// A snapshot listed on a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeSnapshot {
    /// Snapshot name.
    pub name: String,
    /// Transaction id, including the root marker bit.
    pub xid: u64,
}

impl VolumeSnapshot {
    /// Whether the snapshot is marked as the volume's root.
    #[must_use]
    pub fn is_marked_as_root(&self) -> bool {
        self.xid & SNAPSHOT_MARKED_AS_ROOT != 0
    }
}

/// Volume metadata attribute store.
pub trait MetadataStore {
    /// Read the raw attribute buffer of the volume mounted at `path`.
    fn get_attributes(&self, path: &Path, spec: AttributeSpec) -> Result<Vec<u8>>;
    /// Replace the raw attribute buffer in one call.
    fn set_attributes(&self, path: &Path, spec: AttributeSpec, buffer: &[u8]) -> Result<()>;
    /// Look up an object id on the volume mounted at `mountpoint`.
    fn lookup_object(&self, mountpoint: &Path, id: u64) -> Result<Option<CatalogEntry>>;
    /// Object id of the file or folder at `path`.
    fn object_id(&self, path: &Path) -> Result<u64>;
    /// Whether `path` names a directory.
    fn is_directory(&self, path: &Path) -> Result<bool>;
    /// Whether the volume mounted at `mountpoint` reports a sealed format.
    fn is_sealed(&self, mountpoint: &Path) -> Result<bool>;
    /// Snapshots of the volume mounted at `mountpoint`, in listing order.
    fn snapshots(&self, mountpoint: &Path) -> Result<Vec<VolumeSnapshot>>;

    /// Name of the snapshot marked as root; `NotFound` when none is.
    fn snapshot_as_root(&self, mountpoint: &Path) -> Result<String> {
        self.snapshots(mountpoint)?
            .into_iter()
            .find(VolumeSnapshot::is_marked_as_root)
            .map(|snapshot| snapshot.name)
            .ok_or_else(|| {
                BlessError::not_found(format!("root snapshot on {}", mountpoint.display()))
            })
    }

    /// Whether anything exists at `path`.
    fn exists(&self, path: &Path) -> Result<bool> {
        match self.object_id(path) {
            Ok(_) => Ok(true),
            Err(BlessError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Reads, writes and interprets bless records.
#[derive(Clone, Copy)]
pub struct BlessAccessor<'a> {
    metadata: &'a dyn MetadataStore,
    max_hops: u32,
}

impl fmt::Debug for BlessAccessor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlessAccessor")
            .field("max_hops", &self.max_hops)
            .finish_non_exhaustive()
    }
}

impl<'a> BlessAccessor<'a> {
    /// Accessor over a metadata store.
    #[must_use]
    pub fn new(metadata: &'a dyn MetadataStore, config: &BlessConfig) -> Self {
        Self {
            metadata,
            max_hops: config.max_object_hops,
        }
    }

    /// Accessor over the context's metadata store.
    #[must_use]
    pub fn from_context(ctx: &Context<'a>) -> Self {
        Self::new(ctx.metadata, ctx.config)
    }

    /// Read the record of the given layout.
    pub fn read(&self, mountpoint: &Path, kind: RecordKind) -> Result<BlessRecord> {
        let buffer = self
            .metadata
            .get_attributes(mountpoint, AttributeSpec::for_kind(kind))?;
        Ok(BlessRecord::decode(kind, &buffer)?)
    }

    /// Persist a record with a single attribute write.
    pub fn write(&self, mountpoint: &Path, record: &BlessRecord) -> Result<()> {
        let spec = AttributeSpec::for_kind(record.kind());
        self.metadata
            .set_attributes(mountpoint, spec, &record.encode())
    }

    /// Read the legacy finder-info words.
    pub fn finder_info(&self, mountpoint: &Path) -> Result<FinderInfo> {
        match self.read(mountpoint, RecordKind::LegacyEightWord)? {
            BlessRecord::LegacyEightWord(info) => Ok(info),
            BlessRecord::ModernTwoWord64(_) => Err(BlessError::InvalidArgument(format!(
                "{} does not carry finder info",
                mountpoint.display()
            ))),
        }
    }

    /// Update words 0, 3 and 5 of the legacy record, preserving every other word.
    pub fn bless_dir(
        &self,
        mountpoint: &Path,
        dir9: u32,
        dir_x: u32,
        use_x: bool,
    ) -> Result<FinderInfo> {
        let updated = self
            .finder_info(mountpoint)?
            .with_blessed_dirs(dir9, dir_x, use_x);
        debug!(
            "finderinfo[0] = {}, finderinfo[3] = {}, finderinfo[5] = {}",
            updated.words()[0],
            updated.words()[3],
            updated.words()[5]
        );
        self.write(mountpoint, &BlessRecord::LegacyEightWord(updated))?;
        Ok(updated)
    }

    /// Resolve an object id on a mounted volume to an absolute path.
    ///
    /// Ids 0 and 1 mean "unset" and resolve to an empty path.
    pub fn resolve_object_id(&self, mountpoint: &Path, id: u64) -> Result<PathBuf> {
        if id < ROOT_OBJECT_ID {
            return Ok(PathBuf::new());
        }
        let mut components = Vec::new();
        let mut cursor = id;
        let mut hops = 0u32;
        while cursor != ROOT_OBJECT_ID {
            if hops >= self.max_hops {
                return Err(BlessError::BrokenChain {
                    mountpoint: mountpoint.to_path_buf(),
                    id,
                });
            }
            let entry = self
                .metadata
                .lookup_object(mountpoint, cursor)?
                .ok_or_else(|| BlessError::BrokenChain {
                    mountpoint: mountpoint.to_path_buf(),
                    id,
                })?;
            components.push(entry.name);
            cursor = entry.parent;
            hops += 1;
        }
        let mut path = mountpoint.to_path_buf();
        path.extend(components.iter().rev());
        Ok(path)
    }

    /// Object id of a folder on the volume.
    pub fn folder_id(&self, path: &Path) -> Result<u64> {
        if !self.metadata.is_directory(path)? {
            return Err(BlessError::InvalidArgument(format!(
                "{} is not a folder",
                path.display()
            )));
        }
        self.metadata.object_id(path)
    }

    /// Folder id narrowed to a finder-info word.
    pub fn legacy_folder_id(&self, path: &Path) -> Result<u32> {
        let id = self.folder_id(path)?;
        u32::try_from(id).map_err(|_| {
            BlessError::InvalidArgument(format!(
                "{} has an object id beyond the legacy record range",
                path.display()
            ))
        })
    }

    /// Set or clear one Finder flag on a file with a read-modify-write of its finder info.
    pub fn set_finder_flag(&self, path: &Path, flag: u16, set: bool) -> Result<FinderInfo> {
        let buffer = self
            .metadata
            .get_attributes(path, AttributeSpec::FileFinderInfo)?;
        let BlessRecord::LegacyEightWord(info) =
            BlessRecord::decode(RecordKind::LegacyEightWord, &buffer)?
        else {
            return Err(BlessError::InvalidArgument(format!(
                "{} has no finder info",
                path.display()
            )));
        };
        let updated = info.with_file_flag(flag, set);
        debug!(
            "{}: finder flags {:#06x} -> {:#06x}",
            path.display(),
            info.file_flags(),
            updated.file_flags()
        );
        self.metadata.set_attributes(
            path,
            AttributeSpec::FileFinderInfo,
            &BlessRecord::LegacyEightWord(updated).encode(),
        )?;
        Ok(updated)
    }
}

/// Record layout used by the volume mounted at `mountpoint`.
pub fn layout_of(
    table: &dyn MountTable,
    config: &BlessConfig,
    mountpoint: &Path,
) -> Result<RecordKind> {
    let entry = mount_containing(table, mountpoint)?
        .ok_or_else(|| BlessError::not_found(format!("mount point for {}", mountpoint.display())))?;
    Ok(if entry.fs_type == config.container_fs_type {
        RecordKind::ModernTwoWord64
    } else {
        RecordKind::LegacyEightWord
    })
}

/// Mount point shared by one or two paths.
///
/// With one path, its mount point. With two, the mount point both live on, or
/// `InvalidArgument` when they live on different volumes.
pub fn common_mount_point(
    table: &dyn MountTable,
    first: Option<&Path>,
    second: Option<&Path>,
) -> Result<PathBuf> {
    let mount_of = |path: &Path| -> Result<PathBuf> {
        let entry = mount_containing(table, path)?
            .ok_or_else(|| BlessError::not_found(format!("mount point for {}", path.display())))?;
        debug!("mount point for {} is {}", path.display(), entry.mountpoint.display());
        Ok(entry.mountpoint)
    };
    match (first, second) {
        (Some(first), Some(second)) => {
            let first_mount = mount_of(first)?;
            let second_mount = mount_of(second)?;
            if first_mount == second_mount {
                Ok(first_mount)
            } else {
                Err(BlessError::InvalidArgument(format!(
                    "{} and {} are on different volumes",
                    first.display(),
                    second.display()
                )))
            }
        }
        (Some(path), None) | (None, Some(path)) => mount_of(path),
        (None, None) => Err(BlessError::InvalidArgument(
            "no folders specified".to_owned(),
        )),
    }
}

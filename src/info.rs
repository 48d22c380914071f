// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Assemble boot and volume reports and apply boot configuration changes.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use bless_record::{
    ApfsBlessData, BlessRecord, FinderInfo, RecordKind, FINDER_INFO_MESSAGES, WORD_VSDB_HIGH,
};
use log::{debug, info};
use serde::Serialize;

use crate::accessor::{common_mount_point, layout_of, BlessAccessor};
use crate::codec::{self, BootTarget};
use crate::context::Context;
use crate::discovery::roles::{split_uuid_folder, volume_for_uuid_folder};
use crate::error::{BlessError, Result};
use crate::mount::{mount_containing, mount_for_device};
use crate::preboot::{classify, PrebootEnv};
use crate::topology::strip_dev;

/// Loader file looked up next to a blessed container system folder.
const CONTAINER_LOADER: &str = "boot.efi";

/// Firmware boot target as currently configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootReport {
    /// Preboot environment the string was read for.
    pub environment: PrebootEnv,
    /// Raw boot string.
    pub boot_string: String,
    /// Decoded target.
    pub target: BootTarget,
}

/// Read and decode the persisted boot string.
pub fn current_boot_target(ctx: &Context<'_>) -> Result<BootReport> {
    let environment = classify(ctx.registry)?;
    let boot_string = codec::read_boot_string(ctx, environment)?;
    debug!("current {environment} boot string: {boot_string}");
    let target = codec::decode(ctx, environment, &boot_string)?;
    Ok(BootReport {
        environment,
        boot_string,
        target,
    })
}

/// Mount point of the volume the firmware will boot.
pub fn current_boot_mountpoint(ctx: &Context<'_>) -> Result<PathBuf> {
    let report = current_boot_target(ctx)?;
    let device = report.target.device().ok_or_else(|| {
        BlessError::InvalidArgument(format!("{} is a network boot target", report.boot_string))
    })?;
    let entry = mount_for_device(ctx.mounts, device)?.ok_or_else(|| {
        BlessError::not_found(format!(
            "Volume for {} path {} is not available",
            report.environment, report.boot_string
        ))
    })?;
    debug!("mount: {}", entry.mountpoint.display());
    Ok(entry.mountpoint)
}

/// One finder-info word with its resolved path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinderInfoEntry {
    /// Word index.
    pub index: usize,
    /// Directory id stored in the word.
    pub directory_id: u32,
    /// Resolved path; empty when the word is unset.
    pub path: PathBuf,
}

/// An object referenced by container bless data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlessedObject {
    /// Object id.
    pub id: u64,
    /// Resolved path; empty when unset.
    pub path: PathBuf,
}

/// Bless state of one mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "layout", rename_all = "kebab-case")]
pub enum VolumeReport {
    /// Volume carrying the legacy finder-info record.
    Legacy {
        /// Mount point of the volume.
        mountpoint: PathBuf,
        /// Words 0 through 5.
        finder_info: Vec<FinderInfoEntry>,
        /// Words 6 and 7 as one identifier.
        vsdb_id: u64,
    },
    /// Container volume carrying two-word bless data.
    Container {
        /// Mount point of the volume.
        mountpoint: PathBuf,
        /// Blessed system folder.
        system: BlessedObject,
        /// Blessed loader file.
        loader: BlessedObject,
        /// Volume owning the preboot folder the system object lives in.
        #[serde(skip_serializing_if = "Option::is_none")]
        blessed_volume: Option<String>,
    },
}

/// Describe the bless record of the volume containing `path`.
pub fn volume_report(ctx: &Context<'_>, path: &Path) -> Result<VolumeReport> {
    let mountpoint = common_mount_point(ctx.mounts, Some(path), None)?;
    let accessor = BlessAccessor::from_context(ctx);
    match layout_of(ctx.mounts, ctx.config, &mountpoint)? {
        RecordKind::LegacyEightWord => {
            let words = accessor.finder_info(&mountpoint)?;
            let mut finder_info = Vec::with_capacity(WORD_VSDB_HIGH);
            for (index, &directory_id) in words.words().iter().take(WORD_VSDB_HIGH).enumerate() {
                let path = accessor.resolve_object_id(&mountpoint, u64::from(directory_id))?;
                finder_info.push(FinderInfoEntry {
                    index,
                    directory_id,
                    path,
                });
            }
            Ok(VolumeReport::Legacy {
                vsdb_id: words.vsdb_id(),
                mountpoint,
                finder_info,
            })
        }
        RecordKind::ModernTwoWord64 => {
            let record = accessor.read(&mountpoint, RecordKind::ModernTwoWord64)?;
            let data = record.as_apfs().copied().unwrap_or_default();
            let system = BlessedObject {
                id: data.system,
                path: accessor.resolve_object_id(&mountpoint, data.system)?,
            };
            let loader = BlessedObject {
                id: data.loader,
                path: accessor.resolve_object_id(&mountpoint, data.loader)?,
            };
            let blessed_volume = blessed_volume_in_container(ctx, &mountpoint, &system.path)?;
            Ok(VolumeReport::Container {
                mountpoint,
                system,
                loader,
                blessed_volume,
            })
        }
    }
}

fn blessed_volume_in_container(
    ctx: &Context<'_>,
    mountpoint: &Path,
    system_path: &Path,
) -> Result<Option<String>> {
    let Ok(relative) = system_path.strip_prefix(mountpoint) else {
        return Ok(None);
    };
    let relative = format!("/{}", relative.display());
    let Some((uuid, _)) = split_uuid_folder(&relative) else {
        return Ok(None);
    };
    let Some(entry) = mount_containing(ctx.mounts, mountpoint)? else {
        return Ok(None);
    };
    volume_for_uuid_folder(ctx.registry, strip_dev(&entry.device), uuid)
}

/// Render a volume report the way the `info` command prints it.
#[must_use]
pub fn render_text(report: &VolumeReport) -> String {
    let mut out = String::new();
    match report {
        VolumeReport::Legacy {
            finder_info,
            vsdb_id,
            ..
        } => {
            for entry in finder_info {
                let (unset, set) = FINDER_INFO_MESSAGES[entry.index];
                let message = if entry.directory_id > 0 { set } else { unset };
                let _ = writeln!(
                    out,
                    "finderinfo[{}]: {:>6} => {}{}",
                    entry.index,
                    entry.directory_id,
                    message,
                    entry.path.display()
                );
            }
            let _ = writeln!(out, "{} 0x{vsdb_id:016X}", FINDER_INFO_MESSAGES[6].1);
        }
        VolumeReport::Container {
            system,
            loader,
            blessed_volume,
            ..
        } => {
            let _ = writeln!(
                out,
                "blessed system folder: {:>6} => {}",
                system.id,
                system.path.display()
            );
            let _ = writeln!(
                out,
                "blessed system file:   {:>6} => {}",
                loader.id,
                loader.path.display()
            );
            if let Some(volume) = blessed_volume {
                let _ = writeln!(out, "blessed volume: /dev/{volume}");
            }
        }
    }
    out
}

/// Encode and persist a boot target; returns the boot string written.
pub fn set_boot_target(ctx: &Context<'_>, target: &BootTarget) -> Result<String> {
    let environment = classify(ctx.registry)?;
    let boot_string = codec::encode(ctx, environment, target)?;
    codec::write_boot_string(ctx, environment, &boot_string)?;
    info!(
        "{} set to {boot_string}",
        codec::variable_name(environment)
    );
    Ok(boot_string)
}

/// Device holding the volume mounted at or above `path`.
pub fn device_for_mount(ctx: &Context<'_>, path: &Path) -> Result<String> {
    let entry = mount_containing(ctx.mounts, path)?
        .ok_or_else(|| BlessError::not_found(format!("mount point for {}", path.display())))?;
    Ok(strip_dev(&entry.device).to_owned())
}

/// Result of blessing folders on a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlessOutcome {
    /// Volume mount point.
    pub mountpoint: PathBuf,
    /// Record written.
    pub record: BlessRecord,
}

/// Bless a system folder, and optionally a classic folder, on their common volume.
///
/// Legacy volumes get words 0, 3 and 5 updated with every other word
/// preserved. Container volumes get the folder and its loader file.
pub fn bless_folder(
    ctx: &Context<'_>,
    folder: &Path,
    folder9: Option<&Path>,
    use_x: bool,
) -> Result<BlessOutcome> {
    let mountpoint = common_mount_point(ctx.mounts, Some(folder), folder9)?;
    let accessor = BlessAccessor::from_context(ctx);
    let record = match layout_of(ctx.mounts, ctx.config, &mountpoint)? {
        RecordKind::LegacyEightWord => {
            let dir_x = accessor.legacy_folder_id(folder)?;
            let dir9 = folder9
                .map(|path| accessor.legacy_folder_id(path))
                .transpose()?
                .unwrap_or(0);
            let updated: FinderInfo =
                accessor.bless_dir(&mountpoint, dir9, dir_x, use_x || dir9 == 0)?;
            BlessRecord::from(updated)
        }
        RecordKind::ModernTwoWord64 => {
            if folder9.is_some() {
                return Err(BlessError::InvalidArgument(
                    "container volumes have no classic system folder".to_owned(),
                ));
            }
            let system = accessor.folder_id(folder)?;
            let loader_path = folder.join(CONTAINER_LOADER);
            let loader = if ctx.metadata.is_directory(&loader_path)? {
                0
            } else {
                match ctx.metadata.object_id(&loader_path) {
                    Ok(id) => id,
                    Err(BlessError::NotFound(_)) => {
                        debug!("no {CONTAINER_LOADER} in {}", folder.display());
                        0
                    }
                    Err(err) => return Err(err),
                }
            };
            let record = BlessRecord::from(ApfsBlessData::new(system, loader));
            accessor.write(&mountpoint, &record)?;
            record
        }
    };
    info!("blessed {} on {}", folder.display(), mountpoint.display());
    Ok(BlessOutcome { mountpoint, record })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_report_prints_messages_and_volume_id() {
        let report = VolumeReport::Legacy {
            mountpoint: PathBuf::from("/Volumes/Mac"),
            finder_info: vec![
                FinderInfoEntry {
                    index: 0,
                    directory_id: 17,
                    path: PathBuf::from("/Volumes/Mac/System/Library/CoreServices"),
                },
                FinderInfoEntry {
                    index: 1,
                    directory_id: 0,
                    path: PathBuf::new(),
                },
            ],
            vsdb_id: 0x0011_2233_4455_6677,
        };
        let text = render_text(&report);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "finderinfo[0]:     17 => Blessed System Folder is /Volumes/Mac/System/Library/CoreServices"
        );
        assert_eq!(
            lines[1],
            "finderinfo[1]:      0 => No Startup App folder (ignored anyway)"
        );
        assert_eq!(lines[2], "64-bit VSDB volume id:  0x0011223344556677");
    }
}

// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Find role-tagged companion volumes inside a container and their UUID folders.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;

use crate::context::Context;
use crate::error::{BlessError, Result};
use crate::mount::{MountGuard, MountOrchestrator};
use crate::registry::{
    Node, Plane, Registry, CLASS_CONTAINER_MEDIA, CLASS_VOLUME, KEY_ROLE, KEY_UUID,
    KEY_VOLUME_GROUP_UUID,
};
use crate::topology::{container_of, media_node, strip_dev, volume_node};

/// Role a container volume is tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VolumeRole {
    /// Untagged.
    None,
    /// Sealed operating system volume.
    System,
    /// User home volume.
    User,
    /// Recovery environment.
    Recovery,
    /// Swap files.
    Vm,
    /// Boot loader staging volume.
    Preboot,
    /// Installer volume.
    Installer,
    /// Writable data paired with a system volume.
    Data,
    /// Baseband firmware.
    Baseband,
    /// Secure enclave storage.
    XArt,
    /// Internal use.
    Internal,
    /// Time machine backup.
    Backup,
    /// Software update staging.
    Update,
    /// Hardware firmware.
    Hardware,
    /// Sidecar storage.
    SideCar,
    /// Enterprise managed data.
    Enterprise,
    /// Diagnostics environment.
    IDiags,
}

static ROLE_TABLE: [(VolumeRole, &str, u16); 17] = [
    (VolumeRole::None, "None", 0x0000),
    (VolumeRole::System, "System", 0x0001),
    (VolumeRole::User, "User", 0x0002),
    (VolumeRole::Recovery, "Recovery", 0x0004),
    (VolumeRole::Vm, "VM", 0x0008),
    (VolumeRole::Preboot, "PreBoot", 0x0010),
    (VolumeRole::Installer, "Installer", 0x0020),
    (VolumeRole::Data, "Data", 0x0040),
    (VolumeRole::Baseband, "Baseband", 0x0080),
    (VolumeRole::Update, "Update", 0x00C0),
    (VolumeRole::XArt, "xART", 0x0100),
    (VolumeRole::Hardware, "Hardware", 0x0140),
    (VolumeRole::Backup, "Backup", 0x0180),
    (VolumeRole::SideCar, "SideCar", 0x01C0),
    (VolumeRole::Enterprise, "Enterprise", 0x0200),
    (VolumeRole::Internal, "Internal", 0x0240),
    (VolumeRole::IDiags, "iDiags", 0x0280),
];

impl VolumeRole {
    /// Parse the registry spelling of a role; matching ignores ASCII case.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        ROLE_TABLE
            .iter()
            .find(|(_, label, _)| label.eq_ignore_ascii_case(name))
            .map(|(role, _, _)| *role)
    }

    /// Registry spelling.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.entry().1
    }

    /// Numeric role code.
    #[must_use]
    pub fn code(self) -> u16 {
        self.entry().2
    }

    fn entry(self) -> &'static (VolumeRole, &'static str, u16) {
        ROLE_TABLE
            .iter()
            .find(|(role, _, _)| *role == self)
            .unwrap_or(&ROLE_TABLE[0])
    }
}

impl fmt::Display for VolumeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A container volume and the roles it is tagged with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoledVolume {
    /// BSD name.
    pub device: String,
    /// Roles in registry order.
    pub roles: Vec<VolumeRole>,
}

fn role_names(node: &Node<'_>) -> Result<Vec<String>> {
    Ok(node.strings(KEY_ROLE)?.unwrap_or_default())
}

fn roles_of(node: &Node<'_>) -> Result<Vec<VolumeRole>> {
    Ok(role_names(node)?
        .iter()
        .filter_map(|name| VolumeRole::from_name(name))
        .collect())
}

fn container_media<'r>(registry: &'r dyn Registry, container: &str) -> Result<Node<'r>> {
    let node = media_node(registry, container)?;
    if node.conforms_to(CLASS_CONTAINER_MEDIA)? {
        Ok(node)
    } else {
        Err(BlessError::InvalidArgument(format!(
            "{container} is not a container disk"
        )))
    }
}

/// Every volume of a container with its roles.
pub fn container_volumes(registry: &dyn Registry, container: &str) -> Result<Vec<RoledVolume>> {
    let media = container_media(registry, container)?;
    let mut volumes = Vec::new();
    for node in media.descendants(Plane::Service)? {
        let node = node?;
        if !node.conforms_to(CLASS_VOLUME)? {
            continue;
        }
        if let Some(device) = node.bsd_name()? {
            volumes.push(RoledVolume {
                device,
                roles: roles_of(&node)?,
            });
        }
    }
    Ok(volumes)
}

/// The unique volume of a container tagged with `role`.
///
/// Two volumes with the role, or a matching volume with more than one role,
/// is `AmbiguousRole`; no match is `NoSuchRole`.
pub fn special_roled_volume(
    registry: &dyn Registry,
    container: &str,
    role: VolumeRole,
) -> Result<String> {
    let media = container_media(registry, container)?;
    let ambiguous = || BlessError::AmbiguousRole {
        container: container.to_owned(),
        role: role.name().to_owned(),
    };
    let mut found: Option<String> = None;
    for node in media.descendants(Plane::Service)? {
        let node = node?;
        if !node.conforms_to(CLASS_VOLUME)? {
            continue;
        }
        let names = role_names(&node)?;
        if !names
            .iter()
            .any(|name| VolumeRole::from_name(name) == Some(role))
        {
            continue;
        }
        if names.len() > 1 || found.is_some() {
            return Err(ambiguous());
        }
        found = Some(
            node.bsd_name()?
                .ok_or_else(|| BlessError::walk(container, "role volume has no BSD name"))?,
        );
    }
    let device = found.ok_or_else(|| BlessError::NoSuchRole {
        container: container.to_owned(),
        role: role.name().to_owned(),
    })?;
    debug!("{role} volume of {container} is {device}");
    Ok(device)
}

/// Role of a single container volume; snapshots report their volume's role.
///
/// An untagged volume, or one tagged with an unknown role name, is `None`.
pub fn role_of_volume(registry: &dyn Registry, device: &str) -> Result<VolumeRole> {
    let volume = volume_node(registry, device)?;
    let names = role_names(&volume)?;
    match names.as_slice() {
        [] => Ok(VolumeRole::None),
        [name] => Ok(VolumeRole::from_name(name).unwrap_or(VolumeRole::None)),
        [first, ..] => Err(BlessError::AmbiguousRole {
            container: device.to_owned(),
            role: first.clone(),
        }),
    }
}

/// Whether a device is the data half of a system and data volume pair.
pub fn is_data_role(registry: &dyn Registry, device: &str) -> Result<bool> {
    Ok(role_of_volume(registry, device)? == VolumeRole::Data)
}

/// Preboot volume serving a container volume.
pub fn preboot_volume_for(registry: &dyn Registry, volume: &str) -> Result<String> {
    special_roled_volume(registry, &container_of(registry, volume)?, VolumeRole::Preboot)
}

/// Split `/<UUID>/<rest>` into the UUID and `/<rest>`.
#[must_use]
pub fn split_uuid_folder(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.strip_prefix('/')?;
    let (first, rest) = match trimmed.find('/') {
        Some(slash) => (&trimmed[..slash], &trimmed[slash..]),
        None => (trimmed, "/"),
    };
    is_uuid(first).then_some((first, rest))
}

fn is_uuid(text: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    let parts: Vec<&str> = text.split('-').collect();
    parts.len() == GROUPS.len()
        && parts
            .iter()
            .zip(GROUPS)
            .all(|(part, len)| part.len() == len && part.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// The volume a preboot UUID folder belongs to.
///
/// A volume whose own UUID matches wins; otherwise the system-role member of
/// the volume group with that UUID.
pub fn volume_for_uuid_folder(
    registry: &dyn Registry,
    preboot: &str,
    uuid: &str,
) -> Result<Option<String>> {
    let container = container_of(registry, preboot)?;
    let media = container_media(registry, &container)?;
    let mut group_match = None;
    for node in media.descendants(Plane::Service)? {
        let node = node?;
        if !node.conforms_to(CLASS_VOLUME)? {
            continue;
        }
        if node
            .string(KEY_UUID)?
            .is_some_and(|own| own.eq_ignore_ascii_case(uuid))
        {
            return node.bsd_name();
        }
        let in_group = node
            .string(KEY_VOLUME_GROUP_UUID)?
            .is_some_and(|group| group.eq_ignore_ascii_case(uuid));
        if in_group && group_match.is_none() && roles_of(&node)?.contains(&VolumeRole::System) {
            group_match = node.bsd_name()?;
        }
    }
    Ok(group_match)
}

/// Folder for a volume inside a mounted preboot volume.
///
/// `<preboot>/<volume UUID>` when it is a directory, else
/// `<preboot>/<group UUID>` when that is, else `NotFound`.
pub fn uuid_folder_in_preboot(
    ctx: &Context<'_>,
    preboot_mountpoint: &Path,
    volume: &str,
) -> Result<PathBuf> {
    let node = volume_node(ctx.registry, volume)?;
    let candidates = [node.string(KEY_UUID)?, node.string(KEY_VOLUME_GROUP_UUID)?];
    for uuid in candidates.into_iter().flatten() {
        let folder = preboot_mountpoint.join(&uuid);
        if ctx.metadata.is_directory(&folder)? {
            return Ok(folder);
        }
    }
    Err(BlessError::not_found(format!(
        "folder for {volume} in {}",
        preboot_mountpoint.display()
    )))
}

/// Mount the `role` companion of a container volume, reusing an existing mount.
pub fn mount_special_volume<'a>(
    ctx: &Context<'a>,
    volume: &str,
    role: VolumeRole,
) -> Result<MountGuard<'a>> {
    let companion = special_roled_volume(ctx.registry, &container_of(ctx.registry, volume)?, role)?;
    MountOrchestrator::from_context(ctx).mount(&companion, false)
}

/// Mount the `role` companion of a volume and name the volume's folder on it.
///
/// The folder is named by the volume group UUID when `use_group_uuid` is set,
/// otherwise by the volume UUID; a volume without the requested UUID is
/// `InvalidArgument`. The guard keeps the companion mounted.
pub fn ensure_special_volume_uuid_path<'a>(
    ctx: &Context<'a>,
    volume: &str,
    role: VolumeRole,
    use_group_uuid: bool,
) -> Result<(PathBuf, MountGuard<'a>)> {
    let (key, label) = if use_group_uuid {
        (KEY_VOLUME_GROUP_UUID, "volume group UUID")
    } else {
        (KEY_UUID, "UUID")
    };
    let folder = volume_node(ctx.registry, volume)?
        .string(key)?
        .ok_or_else(|| BlessError::InvalidArgument(format!("{volume} has no {label}")))?;
    let guard = mount_special_volume(ctx, volume, role)?;
    let path = guard.mountpoint().join(folder);
    debug!("{role} folder for {volume} is {}", path.display());
    Ok((path, guard))
}

/// Root hash left in a preboot folder by installs with sealed-volume semantics.
const ROOT_HASH: &str = "usr/standalone/OS.dmg.root_hash";

/// Whether the system volume mounted at `mountpoint` boots with sealed-volume semantics.
///
/// Only System-role volumes qualify. A sealed volume does; otherwise a root
/// hash in the volume's preboot folder does, mounting the preboot volume for
/// the check when it is not already mounted.
pub fn is_volume_arv(ctx: &Context<'_>, mountpoint: &Path, volume: &str) -> Result<bool> {
    let volume = strip_dev(volume);
    if role_of_volume(ctx.registry, volume)? != VolumeRole::System {
        debug!("{volume} does not have the system role");
        return Ok(false);
    }
    if ctx.metadata.is_sealed(mountpoint)? {
        debug!("{} is sealed", mountpoint.display());
        return Ok(true);
    }
    let guard = mount_special_volume(ctx, volume, VolumeRole::Preboot)?;
    let folder = uuid_folder_in_preboot(ctx, guard.mountpoint(), volume)?;
    let root_hash = folder.join(ROOT_HASH);
    let found = ctx.metadata.exists(&root_hash)?;
    if found {
        debug!("{} exists", root_hash.display());
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_ignore_case() {
        assert_eq!(VolumeRole::from_name("Preboot"), Some(VolumeRole::Preboot));
        assert_eq!(VolumeRole::from_name("xART"), Some(VolumeRole::XArt));
        assert_eq!(VolumeRole::from_name("Scratch"), None);
        assert_eq!(VolumeRole::Data.code(), 0x40);
    }

    #[test]
    fn uuid_folders_split_from_paths() {
        let path = "/6D3B1A4F-2C1E-4F0B-9C77-1C2B0E9D4A11/System/Library/CoreServices/boot.efi";
        assert_eq!(
            split_uuid_folder(path),
            Some((
                "6D3B1A4F-2C1E-4F0B-9C77-1C2B0E9D4A11",
                "/System/Library/CoreServices/boot.efi"
            ))
        );
        assert_eq!(split_uuid_folder("/System/Library/CoreServices/boot.efi"), None);
    }
}

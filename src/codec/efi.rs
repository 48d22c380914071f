// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: EFI boot strings, redirecting container system volumes through their preboot volume.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use log::debug;

use super::{is_bsd_name, DiskLocator, Interpretation};
use crate::context::Context;
use crate::discovery::roles::{
    mount_special_volume, role_of_volume, uuid_folder_in_preboot, VolumeRole,
};
use crate::error::{BlessError, Result};
use crate::topology::{is_container_volume, media_node, strip_dev};

/// Loader path inside a preboot UUID folder.
pub const DEFAULT_LOADER: &str = "/System/Library/CoreServices/boot.efi";

/// Encode `/dev/<bsd>[,<path>]`.
///
/// A container system volume is booted through its preboot volume, so the
/// string names the preboot device and the volume's UUID folder on it.
pub fn encode_disk(ctx: &Context<'_>, device: &str, path: Option<&str>) -> Result<String> {
    let bsd = strip_dev(device);
    media_node(ctx.registry, bsd)?;
    if is_container_volume(ctx.registry, bsd)? && boots_through_preboot(ctx, bsd)? {
        match preboot_target(ctx, bsd, path) {
            Ok(encoded) => return Ok(encoded),
            Err(BlessError::NoSuchRole { .. }) => {
                debug!("{bsd}: container has no preboot volume, naming the volume directly");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(match path {
        Some(path) => format!("/dev/{bsd},{path}"),
        None => format!("/dev/{bsd}"),
    })
}

fn boots_through_preboot(ctx: &Context<'_>, device: &str) -> Result<bool> {
    Ok(matches!(
        role_of_volume(ctx.registry, device)?,
        VolumeRole::System | VolumeRole::None
    ))
}

fn preboot_target(ctx: &Context<'_>, device: &str, path: Option<&str>) -> Result<String> {
    let guard = mount_special_volume(ctx, device, VolumeRole::Preboot)?;
    let folder = uuid_folder_in_preboot(ctx, guard.mountpoint(), device)?;
    let folder = folder
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| BlessError::walk(device, "preboot folder has no name"))?
        .to_owned();
    let preboot = guard
        .record()
        .map(|record| record.device.clone())
        .ok_or_else(|| BlessError::walk(device, "preboot volume is not mounted"))?;
    let loader = path.unwrap_or(DEFAULT_LOADER);
    let separator = if loader.starts_with('/') { "" } else { "/" };
    Ok(format!("/dev/{preboot},/{folder}{separator}{loader}"))
}

/// Decode `/dev/<bsd>[,<path>]`.
pub fn decode_disk(boot_string: &str) -> Option<Interpretation> {
    let rest = boot_string.strip_prefix("/dev/")?;
    let (device, path) = match rest.split_once(',') {
        Some((device, path)) if !path.is_empty() => (device, Some(path.to_owned())),
        Some(_) => return None,
        None => (rest, None),
    };
    is_bsd_name(device).then(|| Interpretation::Disk {
        locator: DiskLocator::Device(device.to_owned()),
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_follows_first_comma() {
        assert_eq!(
            decode_disk("/dev/disk1s3,/EFI/BOOT/BOOTX64.EFI"),
            Some(Interpretation::Disk {
                locator: DiskLocator::Device("disk1s3".to_owned()),
                path: Some("/EFI/BOOT/BOOTX64.EFI".to_owned()),
            })
        );
        assert_eq!(decode_disk("/dev/disk1s3,"), None);
        assert_eq!(decode_disk("/dev/sda1"), None);
    }
}

// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Open Firmware boot strings built from firmware device paths.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use log::debug;

use super::{whole_disk_of, DiskLocator, Interpretation};
use crate::discovery::booter::{find_auxiliary_booter, AuxiliaryBooter};
use crate::error::{BlessError, Result};
use crate::preboot::is_new_world;
use crate::registry::{Registry, KEY_FIRMWARE_PATH, KEY_PARTITION_ID};
use crate::topology::media_node;

/// Loader selector appended on new-world machines.
pub const TBXI_SUFFIX: &str = ",\\:tbxi";

fn firmware_path(registry: &dyn Registry, device: &str) -> Result<String> {
    media_node(registry, device)?
        .string(KEY_FIRMWARE_PATH)?
        .ok_or_else(|| BlessError::not_found(format!("firmware path of {device}")))
}

/// Encode `<firmware-path>:<partition>`, pointing at the auxiliary booter when one is needed.
pub fn encode_disk(registry: &dyn Registry, device: &str, path: Option<&str>) -> Result<String> {
    if let Some(path) = path {
        return Err(BlessError::InvalidArgument(format!(
            "Open Firmware boot strings cannot carry a loader path ({path})"
        )));
    }
    let mut encoded = firmware_path(registry, device)?;
    let booter = match find_auxiliary_booter(registry, device) {
        Err(BlessError::UnsupportedTopology { .. }) => AuxiliaryBooter::NotNeeded,
        other => other?,
    };
    match booter {
        AuxiliaryBooter::NotNeeded => {}
        AuxiliaryBooter::Found(booter) => {
            let index = media_node(registry, &booter)?
                .number(KEY_PARTITION_ID)?
                .ok_or_else(|| BlessError::walk(&booter, "booter has no partition index"))?;
            let (base, _) = encoded
                .rsplit_once(':')
                .ok_or_else(|| BlessError::walk(device, "firmware path has no partition"))?;
            debug!("{device} boots through auxiliary booter {booter}");
            encoded = format!("{base}:{index}");
        }
        AuxiliaryBooter::NotFound { expected_index } => {
            return Err(BlessError::not_found(format!(
                "auxiliary booter partition {expected_index} for {device}"
            )));
        }
    }
    if is_new_world(registry)? {
        encoded.push_str(TBXI_SUFFIX);
    }
    Ok(encoded)
}

/// Encode the firmware path of the whole disk holding a device.
pub fn encode_legacy(registry: &dyn Registry, device: &str) -> Result<String> {
    firmware_path(registry, &whole_disk_of(registry, device)?)
}

/// Decode `<firmware-path>:<partition>[,<loader>]`.
pub fn decode_disk(boot_string: &str) -> Option<Interpretation> {
    if !boot_string.starts_with('/') {
        return None;
    }
    let body = boot_string
        .split_once(",\\")
        .map_or(boot_string, |(body, _)| body);
    let (base, partition) = body.rsplit_once(':')?;
    if partition.is_empty() || !partition.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(Interpretation::Disk {
        locator: DiskLocator::FirmwarePath(format!("{base}:{partition}")),
        path: None,
    })
}

/// Decode a bare firmware path naming a whole disk.
pub fn decode_legacy(boot_string: &str) -> Option<Interpretation> {
    (boot_string.starts_with('/') && !boot_string.contains(':')).then(|| {
        Interpretation::Legacy {
            locator: DiskLocator::FirmwarePath(boot_string.to_owned()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_selector_is_ignored_when_decoding() {
        let expected = Interpretation::Disk {
            locator: DiskLocator::FirmwarePath("/pci@f4000000/ata-6@d/disk@0:9".to_owned()),
            path: None,
        };
        assert_eq!(
            decode_disk("/pci@f4000000/ata-6@d/disk@0:9,\\:tbxi"),
            Some(expected.clone())
        );
        assert_eq!(decode_disk("/pci@f4000000/ata-6@d/disk@0:9"), Some(expected));
    }

    #[test]
    fn whole_disk_paths_are_legacy() {
        assert_eq!(decode_disk("/pci@f4000000/ata-6@d/disk@0"), None);
        assert!(decode_legacy("/pci@f4000000/ata-6@d/disk@0").is_some());
        assert!(decode_legacy("/pci@f4000000/ata-6@d/disk@0:3").is_none());
    }
}

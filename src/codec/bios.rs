// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: PC BIOS boot strings naming a BSD device.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use super::{is_bsd_name, DiskLocator, Interpretation};
use crate::error::{BlessError, Result};
use crate::registry::Registry;
use crate::topology::{media_node, strip_dev};

/// Encode `/dev/<bsd>`; BIOS loaders take no path.
pub fn encode_disk(registry: &dyn Registry, device: &str, path: Option<&str>) -> Result<String> {
    if let Some(path) = path {
        return Err(BlessError::InvalidArgument(format!(
            "BIOS boot strings cannot carry a loader path ({path})"
        )));
    }
    let bsd = strip_dev(device);
    media_node(registry, bsd)?;
    Ok(format!("/dev/{bsd}"))
}

/// Decode `/dev/<bsd>`.
pub fn decode_disk(boot_string: &str) -> Option<Interpretation> {
    let device = boot_string.strip_prefix("/dev/")?;
    is_bsd_name(device).then(|| Interpretation::Disk {
        locator: DiskLocator::Device(device.to_owned()),
        path: None,
    })
}

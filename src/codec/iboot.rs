// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Embedded boot ROM strings naming a volume by UUID.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use super::{DiskLocator, Interpretation};
use crate::error::{BlessError, Result};
use crate::registry::{Registry, KEY_UUID};
use crate::topology::media_node;

const UUID_PREFIX: &str = "uuid:";

/// Encode `uuid:<VOLUME-UUID>`.
pub fn encode_disk(registry: &dyn Registry, device: &str, path: Option<&str>) -> Result<String> {
    if let Some(path) = path {
        return Err(BlessError::InvalidArgument(format!(
            "embedded boot ROM strings cannot carry a loader path ({path})"
        )));
    }
    let uuid = media_node(registry, device)?
        .string(KEY_UUID)?
        .ok_or_else(|| BlessError::not_found(format!("UUID of {device}")))?;
    Ok(format!("{UUID_PREFIX}{uuid}"))
}

/// Decode `uuid:<VOLUME-UUID>`.
pub fn decode_disk(boot_string: &str) -> Option<Interpretation> {
    let uuid = boot_string.strip_prefix(UUID_PREFIX)?;
    (!uuid.is_empty()).then(|| Interpretation::Disk {
        locator: DiskLocator::VolumeUuid(uuid.to_owned()),
        path: None,
    })
}

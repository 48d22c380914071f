// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Locate the auxiliary booter partition that loads a non-native data partition.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use log::debug;
use serde::Serialize;

use crate::error::{BlessError, Result};
use crate::registry::{Plane, Registry, KEY_CONTENT, KEY_PARTITION_ID};
use crate::topology::{media_node, resolve_parent};

/// Outcome of the auxiliary booter search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "device", rename_all = "kebab-case")]
pub enum AuxiliaryBooter {
    /// The firmware boots the partition directly.
    NotNeeded,
    /// Booter partition serving the device.
    Found(String),
    /// A booter is required but the expected sibling is missing or mistagged.
    NotFound {
        /// Partition index the booter should occupy.
        expected_index: i64,
    },
}

/// Find the booter partition for `device`.
///
/// Only the sibling at the family's booter offset is inspected: its content is
/// read and compared, no other sibling's content is touched. Parents without
/// a booter family fail with `UnsupportedTopology`.
pub fn find_auxiliary_booter(registry: &dyn Registry, device: &str) -> Result<AuxiliaryBooter> {
    let parent = resolve_parent(registry, device)?;
    parent.require_booter_family(device)?;
    let (Some(offset), Some(booter_content)) = (
        parent.map_type.booter_offset(),
        parent.map_type.booter_content(),
    ) else {
        return Ok(AuxiliaryBooter::NotNeeded);
    };

    let node = media_node(registry, device)?;
    let content = node.string(KEY_CONTENT)?.unwrap_or_default();
    if parent.map_type.natively_bootable().contains(&content.as_str()) {
        debug!("{device}: {content} is natively bootable");
        return Ok(AuxiliaryBooter::NotNeeded);
    }

    let expected_index = parent.partition + offset;
    let scheme = node
        .parent(Plane::Service)?
        .ok_or_else(|| BlessError::walk(device, "partition has no scheme parent"))?;
    drop(node);
    for sibling in scheme.children(Plane::Service)? {
        let sibling = sibling?;
        if sibling.number(KEY_PARTITION_ID)? != Some(expected_index) {
            continue;
        }
        if sibling.string(KEY_CONTENT)?.as_deref() != Some(booter_content) {
            debug!("{device}: partition {expected_index} is not a booter");
            return Ok(AuxiliaryBooter::NotFound { expected_index });
        }
        let booter = sibling
            .bsd_name()?
            .ok_or_else(|| BlessError::walk(device, "booter partition has no BSD name"))?;
        debug!("{device}: auxiliary booter is {booter}");
        return Ok(AuxiliaryBooter::Found(booter));
    }
    Ok(AuxiliaryBooter::NotFound { expected_index })
}

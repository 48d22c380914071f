// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Classify a device's parent partition map and walk container hierarchies.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Partition topology resolver.
//!
//! Container volumes sit four service-plane levels above their physical stores:
//!
//! ```text
//! IOMedia (store 1)      IOMedia (store 2)
//!        \                  /
//!      AppleAPFSContainerScheme
//!                |
//!      IOMedia / AppleAPFSMedia (synthesised whole disk)
//!                |
//!      AppleAPFSContainer
//!                |
//!      IOMedia / AppleAPFSVolume
//!                |
//!      AppleAPFSSnapshot (optional)
//! ```

use std::fmt;

use log::debug;
use serde::Serialize;

use crate::error::{BlessError, Result};
use crate::registry::{
    Node, Plane, Registry, CLASS_APM_SCHEME, CLASS_CONTAINER, CLASS_CONTAINER_MEDIA,
    CLASS_CONTAINER_SCHEME, CLASS_GPT_SCHEME, CLASS_MBR_SCHEME, CLASS_MEDIA, CLASS_SNAPSHOT,
    CLASS_VOLUME, KEY_CONTENT, KEY_PARTITION_ID, KEY_WHOLE,
};

/// Content tag of an APM auxiliary booter partition.
pub const CONTENT_APM_BOOTER: &str = "Apple_Boot";
/// Content tag of an APM RAID booter partition.
pub const CONTENT_APM_RAID_BOOTER: &str = "Apple_Boot_RAID";
/// Content tag of an APM legacy filesystem partition.
pub const CONTENT_APM_HFS: &str = "Apple_HFS";
/// Content tag of an APM RAID member.
pub const CONTENT_APM_RAID: &str = "Apple_RAID";
/// Content tag of a GPT auxiliary booter partition.
pub const CONTENT_GPT_BOOTER: &str = "426F6F74-0000-11AA-AA11-00306543ECAC";
/// Content tag of a GPT legacy filesystem partition.
pub const CONTENT_GPT_HFS: &str = "48465300-0000-11AA-AA11-00306543ECAC";
/// Content tag of a GPT RAID member.
pub const CONTENT_GPT_RAID: &str = "52414944-0000-11AA-AA11-00306543ECAC";
/// Content tag of an EFI system partition.
pub const CONTENT_EFI_SYSTEM: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";

/// Partition map family of a partition's parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionMapType {
    /// No partition map, or one without sibling booters.
    None,
    /// Master boot record.
    Mbr,
    /// Apple partition map.
    Apm,
    /// GUID partition table.
    Gpt,
}

impl PartitionMapType {
    /// Offset from a data partition to its auxiliary booter, if the family has one.
    #[must_use]
    pub fn booter_offset(self) -> Option<i64> {
        match self {
            PartitionMapType::Apm => Some(1),
            PartitionMapType::Gpt => Some(-1),
            PartitionMapType::None | PartitionMapType::Mbr => None,
        }
    }

    /// Content tag an auxiliary booter carries in this family.
    #[must_use]
    pub fn booter_content(self) -> Option<&'static str> {
        match self {
            PartitionMapType::Apm => Some(CONTENT_APM_BOOTER),
            PartitionMapType::Gpt => Some(CONTENT_GPT_BOOTER),
            PartitionMapType::None | PartitionMapType::Mbr => None,
        }
    }

    /// Content tags the firmware boots without an auxiliary booter.
    #[must_use]
    pub fn natively_bootable(self) -> &'static [&'static str] {
        match self {
            PartitionMapType::Apm => &[CONTENT_APM_HFS, CONTENT_APM_BOOTER, CONTENT_APM_RAID_BOOTER],
            PartitionMapType::Gpt => &[CONTENT_GPT_HFS, CONTENT_GPT_BOOTER],
            PartitionMapType::None | PartitionMapType::Mbr => &[],
        }
    }

    fn from_scheme(scheme: &Node<'_>) -> Result<Self> {
        Ok(if scheme.conforms_to(CLASS_APM_SCHEME)? {
            PartitionMapType::Apm
        } else if scheme.conforms_to(CLASS_GPT_SCHEME)? {
            PartitionMapType::Gpt
        } else if scheme.conforms_to(CLASS_MBR_SCHEME)? {
            PartitionMapType::Mbr
        } else {
            PartitionMapType::None
        })
    }
}

impl fmt::Display for PartitionMapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PartitionMapType::None => "none",
            PartitionMapType::Mbr => "MBR",
            PartitionMapType::Apm => "APM",
            PartitionMapType::Gpt => "GPT",
        };
        f.write_str(label)
    }
}

/// Placement of a partition inside its parent media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentInfo {
    /// BSD name of the whole media holding the partition map.
    pub parent: String,
    /// One-based partition index, zero when the map has none.
    pub partition: i64,
    /// Family of the partition map.
    pub map_type: PartitionMapType,
    /// Registry name of the scheme object.
    pub scheme: String,
}

impl ParentInfo {
    /// Fail unless the parent is one of the map families that carry sibling booters.
    pub fn require_booter_family(&self, device: &str) -> Result<&Self> {
        if self.map_type.booter_offset().is_some() {
            Ok(self)
        } else {
            Err(BlessError::UnsupportedTopology {
                device: device.to_owned(),
                scheme: self.scheme.clone(),
            })
        }
    }
}

/// Look up a media node by BSD name, failing with `NotFound` when absent.
pub fn media_node<'r>(registry: &'r dyn Registry, device: &str) -> Result<Node<'r>> {
    Node::by_name(registry, strip_dev(device))?
        .ok_or_else(|| BlessError::not_found(format!("device {device}")))
}

/// Strip an optional `/dev/` prefix from a device identifier.
#[must_use]
pub fn strip_dev(device: &str) -> &str {
    device.strip_prefix("/dev/").unwrap_or(device)
}

/// Resolve the partition map a device lives in.
///
/// Parents that are not partition schemes resolve to [`PartitionMapType::None`].
pub fn resolve_parent(registry: &dyn Registry, device: &str) -> Result<ParentInfo> {
    let node = media_node(registry, device)?;
    if node.flag(KEY_WHOLE)? == Some(true) {
        return Err(BlessError::not_found(format!(
            "partition map parent of whole device {device}"
        )));
    }
    let scheme = node
        .parent(Plane::Service)?
        .ok_or_else(|| BlessError::not_found(format!("partition map parent of {device}")))?;
    let map_type = PartitionMapType::from_scheme(&scheme)?;
    let scheme_name = scheme.name()?;
    let whole = scheme
        .parent(Plane::Service)?
        .ok_or_else(|| BlessError::walk(device, "partition scheme has no media parent"))?;
    let parent = whole
        .bsd_name()?
        .ok_or_else(|| BlessError::walk(device, "partition map media has no BSD name"))?;
    let partition = match node.number(KEY_PARTITION_ID)? {
        Some(index) => index,
        None if map_type == PartitionMapType::None => 0,
        None => return Err(BlessError::walk(device, "partition has no index")),
    };
    debug!("{device}: partition {partition} of {parent} ({map_type})");
    Ok(ParentInfo {
        parent,
        partition,
        map_type,
        scheme: scheme_name,
    })
}

/// Content tag of a device.
pub fn content_of(registry: &dyn Registry, device: &str) -> Result<Option<String>> {
    media_node(registry, device)?.string(KEY_CONTENT)
}

fn hop<'r>(node: &Node<'r>, device: &str, expected: &str) -> Result<Node<'r>> {
    let parent = node
        .parent(Plane::Service)
        .map_err(|err| BlessError::walk(device, err.to_string()))?
        .ok_or_else(|| BlessError::walk(device, format!("missing {expected} parent")))?;
    let conforms = parent
        .conforms_to(expected)
        .map_err(|err| BlessError::walk(device, err.to_string()))?;
    if conforms {
        Ok(parent)
    } else {
        Err(BlessError::walk(device, format!("parent is not {expected}")))
    }
}

/// BSD names of the physical stores backing a container volume, in registry order.
pub fn physical_stores_of(registry: &dyn Registry, volume: &str) -> Result<Vec<String>> {
    let node = media_node(registry, volume)?;
    if !node.conforms_to(CLASS_VOLUME)? {
        return Err(BlessError::InvalidArgument(format!(
            "{volume} is not a container volume"
        )));
    }
    let container = hop(&node, volume, CLASS_CONTAINER)?;
    let media = hop(&container, volume, CLASS_CONTAINER_MEDIA)?;
    let scheme = hop(&media, volume, CLASS_CONTAINER_SCHEME)?;
    let stores = scheme
        .parents(Plane::Service)
        .map_err(|err| BlessError::walk(volume, err.to_string()))?;
    let mut names = Vec::new();
    for store in stores {
        let store = store.map_err(|err| BlessError::walk(volume, err.to_string()))?;
        if !store.conforms_to(CLASS_MEDIA)? {
            return Err(BlessError::walk(volume, "physical store is not media"));
        }
        let name = store
            .bsd_name()?
            .ok_or_else(|| BlessError::walk(volume, "physical store has no BSD name"))?;
        names.push(name);
    }
    debug!("{volume}: physical stores {names:?}");
    Ok(names)
}

/// Walk from a snapshot up to the volume it belongs to.
pub fn snapshot_to_volume<'r>(snapshot: &Node<'r>) -> Result<Node<'r>> {
    if !snapshot.conforms_to(CLASS_SNAPSHOT)? {
        return Err(BlessError::InvalidArgument(format!(
            "{} is not a snapshot",
            snapshot.bsd_name()?.unwrap_or_default()
        )));
    }
    let mut cursor = snapshot.parent(Plane::Service)?;
    while let Some(node) = cursor {
        if node.conforms_to(CLASS_VOLUME)? {
            return Ok(node);
        }
        cursor = node.parent(Plane::Service)?;
    }
    Err(BlessError::not_found(format!(
        "volume for snapshot {}",
        snapshot.bsd_name()?.unwrap_or_default()
    )))
}

/// Resolve a device to its container volume node, following snapshots upward.
pub fn volume_node<'r>(registry: &'r dyn Registry, device: &str) -> Result<Node<'r>> {
    let node = media_node(registry, device)?;
    if node.conforms_to(CLASS_SNAPSHOT)? {
        debug!("{device} is a snapshot device");
        return snapshot_to_volume(&node);
    }
    if node.conforms_to(CLASS_VOLUME)? {
        Ok(node)
    } else {
        Err(BlessError::InvalidArgument(format!(
            "{device} is not a container volume"
        )))
    }
}

/// BSD name of the synthesised container disk a volume belongs to.
pub fn container_of(registry: &dyn Registry, device: &str) -> Result<String> {
    let volume = volume_node(registry, device)?;
    let container = hop(&volume, device, CLASS_CONTAINER)?;
    let media = hop(&container, device, CLASS_CONTAINER_MEDIA)?;
    media
        .bsd_name()?
        .ok_or_else(|| BlessError::walk(device, "container media has no BSD name"))
}

/// Whether a device is a container volume or snapshot.
pub fn is_container_volume(registry: &dyn Registry, device: &str) -> Result<bool> {
    let node = media_node(registry, device)?;
    Ok(node.conforms_to(CLASS_VOLUME)? || node.conforms_to(CLASS_SNAPSHOT)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booter_offsets_follow_map_family() {
        assert_eq!(PartitionMapType::Apm.booter_offset(), Some(1));
        assert_eq!(PartitionMapType::Gpt.booter_offset(), Some(-1));
        assert_eq!(PartitionMapType::Mbr.booter_offset(), None);
        assert_eq!(PartitionMapType::None.booter_content(), None);
    }

    #[test]
    fn dev_prefix_is_optional() {
        assert_eq!(strip_dev("/dev/disk3s2"), "disk3s2");
        assert_eq!(strip_dev("disk3s2"), "disk3s2");
    }
}

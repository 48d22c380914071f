// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Assemble the partitions and volumes a boot configuration must touch for a device.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Booter and role discovery.
//!
//! [`booter::find_auxiliary_booter`] answers the narrow question of which
//! sibling loads a partition; [`booter_information`] gathers the complete set
//! of data, auxiliary, system and preboot devices involved in booting one
//! device, across RAID members and container physical stores.

pub mod booter;
pub mod raid;
pub mod roles;

use log::debug;
use serde::Serialize;

use crate::config::BlessConfig;
use crate::error::{BlessError, Result};
use crate::registry::{
    Node, Plane, PropertyValue, Registry, CLASS_MEDIA, KEY_BOOT_DEVICE, KEY_CONTENT,
    KEY_INTERCONNECT_LOCATION, KEY_INTERCONNECT_TYPE, KEY_PARTITION_ID,
    KEY_PROTOCOL_CHARACTERISTICS,
};
use crate::topology::{
    container_of, is_container_volume, media_node, physical_stores_of, resolve_parent,
    PartitionMapType, CONTENT_EFI_SYSTEM,
};

use self::raid::{boot_device_records, record_path};
use self::roles::{special_roled_volume, VolumeRole};

const INTERNAL_INTERCONNECTS: [&str; 2] = ["ATA", "SATA"];
const INTERNAL_LOCATION: &str = "Internal";

/// Devices involved in booting one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BooterInfo {
    /// Partitions holding the operating system.
    #[serde(rename = "Data Partitions")]
    pub data_partitions: Vec<String>,
    /// Auxiliary booter partitions.
    #[serde(rename = "Auxiliary Partitions")]
    pub auxiliary_partitions: Vec<String>,
    /// EFI system partitions, preferred one first.
    #[serde(rename = "System Partitions")]
    pub system_partitions: Vec<String>,
    /// Container preboot volumes.
    #[serde(rename = "Preboot Volumes")]
    pub preboot_volumes: Vec<String>,
}

fn push_unique(list: &mut Vec<String>, name: String) {
    if !list.contains(&name) {
        list.push(name);
    }
}

/// Collect the booter information for a device.
pub fn booter_information(
    registry: &dyn Registry,
    config: &BlessConfig,
    device: &str,
) -> Result<BooterInfo> {
    let mut info = BooterInfo::default();
    let root = media_node(registry, device)?;
    if !root.conforms_to(CLASS_MEDIA)? {
        return Err(BlessError::InvalidArgument(format!("{device} is not a media object")));
    }

    if is_container_volume(registry, device)? {
        drop(root);
        let volume = crate::topology::volume_node(registry, device)?
            .bsd_name()?
            .ok_or_else(|| BlessError::walk(device, "volume has no BSD name"))?;
        for store in physical_stores_of(registry, &volume)? {
            add_data_partition(registry, &store, &mut info)?;
        }
        match special_roled_volume(registry, &container_of(registry, &volume)?, VolumeRole::Preboot)
        {
            Ok(preboot) => push_unique(&mut info.preboot_volumes, preboot),
            Err(BlessError::NoSuchRole { .. }) => debug!("{device}: container has no preboot volume"),
            Err(err) => return Err(err),
        }
    } else if let Some(boot_data) = root.search_property(KEY_BOOT_DEVICE)? {
        drop(root);
        for record in boot_device_records(&boot_data)? {
            add_aggregate_member(registry, record, &mut info)?;
        }
    } else {
        drop(root);
        add_data_partition(registry, device, &mut info)?;
    }

    if let Some(index) = config.primary_booter_index {
        if index > 0 && index < info.auxiliary_partitions.len() {
            debug!("moving auxiliary partition {index} to the front");
            info.auxiliary_partitions.swap(0, index);
        }
    }
    promote_preferred_system_partition(registry, &mut info.system_partitions)?;
    Ok(info)
}

fn add_aggregate_member(
    registry: &dyn Registry,
    record: &PropertyValue,
    info: &mut BooterInfo,
) -> Result<()> {
    let Some(path) = record_path(record) else {
        return Ok(());
    };
    let (plane, path) = Plane::split_path(path);
    let Some(member) = Node::by_path(registry, plane, path)? else {
        debug!("boot device {path} is not in the registry");
        return Ok(());
    };
    let Some(name) = member.bsd_name()? else {
        return Ok(());
    };
    drop(member);
    add_data_partition(registry, &name, info)
}

fn add_data_partition(registry: &dyn Registry, device: &str, info: &mut BooterInfo) -> Result<()> {
    let node = media_node(registry, device)?;
    let content = node
        .string(KEY_CONTENT)?
        .ok_or_else(|| BlessError::walk(device, "partition has no content tag"))?;
    push_unique(&mut info.data_partitions, device.to_owned());

    let parent = match resolve_parent(registry, device) {
        Ok(parent) => parent,
        Err(BlessError::NotFound(_)) => {
            debug!("{device} has no partition map parent");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let needs_booter = match parent.map_type {
        PartitionMapType::Apm | PartitionMapType::Gpt => {
            !parent.map_type.natively_bootable().contains(&content.as_str())
        }
        PartitionMapType::Mbr | PartitionMapType::None => false,
    };
    let booter_index = parent
        .map_type
        .booter_offset()
        .map(|offset| parent.partition + offset);
    let scheme = node
        .parent(Plane::Service)?
        .ok_or_else(|| BlessError::walk(device, "partition has no scheme parent"))?;
    drop(node);

    for sibling in scheme.children(Plane::Service)? {
        let sibling = sibling?;
        let Some(name) = sibling.bsd_name()? else {
            continue;
        };
        let sibling_content = sibling.string(KEY_CONTENT)?.unwrap_or_default();
        if parent.map_type == PartitionMapType::Gpt && sibling_content == CONTENT_EFI_SYSTEM {
            push_unique(&mut info.system_partitions, name);
            continue;
        }
        if needs_booter
            && sibling.number(KEY_PARTITION_ID)? == booter_index
            && Some(sibling_content.as_str()) == parent.map_type.booter_content()
        {
            debug!("{device}: auxiliary partition {name}");
            push_unique(&mut info.auxiliary_partitions, name);
        }
    }
    Ok(())
}

fn is_preferred_system_partition(node: &Node<'_>) -> Result<bool> {
    let Some(value) = node.search_property(KEY_PROTOCOL_CHARACTERISTICS)? else {
        return Ok(false);
    };
    let Some(characteristics) = value.as_dict() else {
        return Ok(false);
    };
    let interconnect = characteristics
        .get(KEY_INTERCONNECT_TYPE)
        .and_then(PropertyValue::as_str);
    let location = characteristics
        .get(KEY_INTERCONNECT_LOCATION)
        .and_then(PropertyValue::as_str);
    Ok(interconnect.is_some_and(|kind| INTERNAL_INTERCONNECTS.contains(&kind))
        && location == Some(INTERNAL_LOCATION))
}

/// Put the internal ATA/SATA system partition first, adding it when none is listed.
fn promote_preferred_system_partition(
    registry: &dyn Registry,
    system_partitions: &mut Vec<String>,
) -> Result<()> {
    for index in 0..system_partitions.len() {
        let node = media_node(registry, &system_partitions[index])?;
        if is_preferred_system_partition(&node)? {
            if index > 0 {
                system_partitions.swap(0, index);
            }
            return Ok(());
        }
    }
    for candidate in Node::matching(registry, CLASS_MEDIA)? {
        let candidate = candidate?;
        if candidate.string(KEY_CONTENT)?.as_deref() != Some(CONTENT_EFI_SYSTEM) {
            continue;
        }
        if !is_preferred_system_partition(&candidate)? {
            continue;
        }
        if let Some(name) = candidate.bsd_name()? {
            debug!("preferred system partition is {name}");
            system_partitions.insert(0, name);
        }
        return Ok(());
    }
    Ok(())
}

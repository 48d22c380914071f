// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Map a RAID member partition back to the aggregate device that boots from it.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use log::debug;
use serde::Serialize;

use crate::error::{BlessError, Result};
use crate::registry::{
    Node, Plane, PropertyValue, Registry, CLASS_MEDIA, KEY_BOOT_DEVICE, KEY_BOOT_DEVICE_PATH,
};
use crate::topology::{
    content_of, media_node, CONTENT_APM_BOOTER, CONTENT_APM_HFS, CONTENT_APM_RAID,
    CONTENT_GPT_BOOTER, CONTENT_GPT_HFS, CONTENT_GPT_RAID,
};

/// Content tags that never make a member its own boot root.
const AGGREGATE_CONTENTS: [&str; 6] = [
    CONTENT_APM_RAID,
    CONTENT_GPT_RAID,
    CONTENT_APM_HFS,
    CONTENT_GPT_HFS,
    CONTENT_APM_BOOTER,
    CONTENT_GPT_BOOTER,
];

/// Boot root found for a member partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "device", rename_all = "kebab-case")]
pub enum BootRoot {
    /// Aggregate media whose boot-device records list the member.
    Aggregate(String),
    /// No aggregate lists the member, and its content makes it the boot root itself.
    MemberIsRoot(String),
    /// Nothing boots from the member.
    NotFound,
}

/// Records published under `IOBootDevice`: one dictionary or an array of them.
pub(crate) fn boot_device_records(value: &PropertyValue) -> Result<Vec<&PropertyValue>> {
    match value {
        PropertyValue::Dict(_) => Ok(vec![value]),
        PropertyValue::Array(items) => Ok(items.iter().collect()),
        _ => Err(BlessError::Uninterpretable(format!(
            "{KEY_BOOT_DEVICE} is neither a dictionary nor an array"
        ))),
    }
}

/// Registry path stored in one boot-device record.
pub(crate) fn record_path(record: &PropertyValue) -> Option<&str> {
    record
        .as_dict()?
        .get(KEY_BOOT_DEVICE_PATH)
        .and_then(PropertyValue::as_str)
}

fn lists_member(registry: &dyn Registry, value: &PropertyValue, member: &Node<'_>) -> Result<bool> {
    for record in boot_device_records(value)? {
        let Some(path) = record_path(record) else {
            continue;
        };
        let (plane, path) = Plane::split_path(path);
        if let Some(listed) = Node::by_path(registry, plane, path)? {
            if listed.same_entry(member) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Find the aggregate device whose boot-device records name `member`.
///
/// When no aggregate lists it, a member whose content is neither a RAID,
/// legacy filesystem nor booter tag is reported as its own boot root.
pub fn find_aggregate_for_member(registry: &dyn Registry, member: &str) -> Result<BootRoot> {
    let member_node = media_node(registry, member)?;
    for candidate in Node::matching(registry, CLASS_MEDIA)? {
        let candidate = candidate?;
        let Some(value) = candidate.property(KEY_BOOT_DEVICE)? else {
            continue;
        };
        if lists_member(registry, &value, &member_node)? {
            let aggregate = candidate
                .bsd_name()?
                .ok_or_else(|| BlessError::walk(member, "aggregate media has no BSD name"))?;
            debug!("{member} is a member of {aggregate}");
            return Ok(BootRoot::Aggregate(aggregate));
        }
    }
    drop(member_node);

    let content = content_of(registry, member)?.unwrap_or_default();
    if AGGREGATE_CONTENTS.contains(&content.as_str()) {
        Ok(BootRoot::NotFound)
    } else {
        debug!("{member} ({content}) is its own boot root");
        Ok(BootRoot::MemberIsRoot(member.to_owned()))
    }
}

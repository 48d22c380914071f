// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Encode boot targets into firmware boot strings and decode them back to devices.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Boot string codec.
//!
//! Decoding is two-staged. A boot string is first interpreted by an ordered
//! list of pure decoders (disk, then network, then legacy); the first one that
//! accepts the string wins. The interpretation is then resolved against the
//! device registry, which may map a booter partition back to its data
//! partition or a preboot folder back to its system volume.

pub mod bios;
pub mod efi;
pub mod iboot;
pub mod network;
pub mod openfirmware;

use std::fmt;

use log::debug;
use serde::Serialize;

use crate::context::Context;
use crate::discovery::roles;
use crate::error::{BlessError, Result};
use crate::preboot::PrebootEnv;
use crate::registry::{
    Node, Plane, Registry, CLASS_MEDIA, KEY_CONTENT, KEY_FIRMWARE_PATH, KEY_PARTITION_ID,
    KEY_UUID, KEY_WHOLE,
};
use crate::topology::{self, media_node, PartitionMapType};

/// Firmware variable store.
pub trait VariableStore {
    /// Read a variable.
    fn get_string(&self, name: &str) -> Result<Option<String>>;
    /// Write a variable.
    fn set_string(&self, name: &str, value: &str) -> Result<()>;
}

/// Network boot protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetBootProtocol {
    /// Boot service discovery protocol.
    Bsdp,
    /// Preboot execution environment.
    Pxe,
}

impl NetBootProtocol {
    /// Scheme token used in boot strings.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            NetBootProtocol::Bsdp => "bsdp",
            NetBootProtocol::Pxe => "pxe",
        }
    }

    /// Parse a scheme token.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "bsdp" => Some(NetBootProtocol::Bsdp),
            "pxe" => Some(NetBootProtocol::Pxe),
            _ => None,
        }
    }
}

/// What the firmware is told to boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BootTarget {
    /// A local device, optionally with a loader path on it.
    Disk {
        /// BSD name of the device.
        device: String,
        /// Loader path relative to the device root.
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// A network boot server.
    Network {
        /// Protocol spoken to the server.
        protocol: NetBootProtocol,
        /// Local interface.
        interface: String,
        /// Server host.
        host: String,
        /// Image path on the server.
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// A legacy (non-native) boot device.
    Legacy {
        /// BSD name of the device.
        device: String,
    },
}

impl BootTarget {
    /// Disk target without a path.
    #[must_use]
    pub fn disk(device: impl Into<String>) -> Self {
        BootTarget::Disk {
            device: device.into(),
            path: None,
        }
    }

    /// Device behind a disk or legacy target.
    #[must_use]
    pub fn device(&self) -> Option<&str> {
        match self {
            BootTarget::Disk { device, .. } | BootTarget::Legacy { device } => Some(device),
            BootTarget::Network { .. } => None,
        }
    }
}

impl fmt::Display for BootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootTarget::Disk { device, path: None } => write!(f, "/dev/{device}"),
            BootTarget::Disk {
                device,
                path: Some(path),
            } => write!(f, "/dev/{device} ({path})"),
            BootTarget::Network {
                protocol,
                interface,
                host,
                path,
            } => f.write_str(&network::format(*protocol, interface, host, path.as_deref())),
            BootTarget::Legacy { device } => write!(f, "legacy /dev/{device}"),
        }
    }
}

/// How a boot string names a device before registry lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskLocator {
    /// A BSD device name.
    Device(String),
    /// A firmware device path, as published in the `firmware-path` property.
    FirmwarePath(String),
    /// A volume UUID.
    VolumeUuid(String),
}

/// Pure interpretation of a boot string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpretation {
    /// Disk boot string.
    Disk {
        /// Device named by the string.
        locator: DiskLocator,
        /// Loader path, if the syntax carries one.
        path: Option<String>,
    },
    /// Network boot string.
    Network {
        /// Protocol token.
        protocol: NetBootProtocol,
        /// Local interface.
        interface: String,
        /// Server host.
        host: String,
        /// Image path.
        path: Option<String>,
    },
    /// Legacy device string.
    Legacy {
        /// Device named by the string.
        locator: DiskLocator,
    },
}

/// Pure decoder for one boot string kind.
pub type Decoder = fn(&str) -> Option<Interpretation>;

/// Decoders for an environment, in the order they are tried.
#[must_use]
pub fn decoders(env: PrebootEnv) -> [Decoder; 3] {
    match env {
        PrebootEnv::OpenFirmware => [
            openfirmware::decode_disk,
            network::decode,
            openfirmware::decode_legacy,
        ],
        PrebootEnv::Efi => [efi::decode_disk, network::decode, decode_legacy],
        PrebootEnv::Bios => [bios::decode_disk, network::decode, decode_legacy],
        PrebootEnv::IBoot => [iboot::decode_disk, network::decode, decode_legacy],
    }
}

/// Firmware variable holding the boot string in an environment.
#[must_use]
pub fn variable_name(env: PrebootEnv) -> &'static str {
    match env {
        PrebootEnv::OpenFirmware | PrebootEnv::Bios => "boot-device",
        PrebootEnv::Efi => "efi-boot-device",
        PrebootEnv::IBoot => "boot-volume",
    }
}

/// Interpret a boot string without consulting the registry.
pub fn interpret(env: PrebootEnv, boot_string: &str) -> Result<Interpretation> {
    let trimmed = boot_string.trim();
    decoders(env)
        .iter()
        .find_map(|decoder| decoder(trimmed))
        .ok_or_else(|| BlessError::Uninterpretable(boot_string.to_owned()))
}

/// Decode a boot string into a device-level target.
pub fn decode(ctx: &Context<'_>, env: PrebootEnv, boot_string: &str) -> Result<BootTarget> {
    let interpretation = interpret(env, boot_string)?;
    debug!("{boot_string:?} interpreted as {interpretation:?}");
    match interpretation {
        Interpretation::Disk { locator, path } => {
            let device = locate(ctx, &locator)?;
            let device = booter_to_data_partition(ctx, &device)?.unwrap_or(device);
            substitute_role_folder(ctx, device, path)
        }
        Interpretation::Network {
            protocol,
            interface,
            host,
            path,
        } => Ok(BootTarget::Network {
            protocol,
            interface,
            host,
            path,
        }),
        Interpretation::Legacy { locator } => Ok(BootTarget::Legacy {
            device: locate(ctx, &locator)?,
        }),
    }
}

/// Encode a target in an environment's syntax.
pub fn encode(ctx: &Context<'_>, env: PrebootEnv, target: &BootTarget) -> Result<String> {
    let encoded = match target {
        BootTarget::Network {
            protocol,
            interface,
            host,
            path,
        } => Ok(network::format(*protocol, interface, host, path.as_deref())),
        BootTarget::Disk { device, path } => match env {
            PrebootEnv::OpenFirmware => {
                openfirmware::encode_disk(ctx.registry, device, path.as_deref())
            }
            PrebootEnv::Efi => efi::encode_disk(ctx, device, path.as_deref()),
            PrebootEnv::Bios => bios::encode_disk(ctx.registry, device, path.as_deref()),
            PrebootEnv::IBoot => iboot::encode_disk(ctx.registry, device, path.as_deref()),
        },
        BootTarget::Legacy { device } => match env {
            PrebootEnv::OpenFirmware => openfirmware::encode_legacy(ctx.registry, device),
            PrebootEnv::Efi | PrebootEnv::Bios => encode_legacy(ctx, device),
            PrebootEnv::IBoot => Err(BlessError::InvalidArgument(
                "legacy boot devices are not supported by the embedded boot ROM".to_owned(),
            )),
        },
    }?;
    debug!("{target} encoded as {encoded:?} for {env}");
    Ok(encoded)
}

/// Read the persisted boot string.
pub fn read_boot_string(ctx: &Context<'_>, env: PrebootEnv) -> Result<String> {
    let name = variable_name(env);
    ctx.variables
        .get_string(name)?
        .ok_or_else(|| BlessError::not_found(format!("firmware variable {name}")))
}

/// Persist a boot string.
pub fn write_boot_string(ctx: &Context<'_>, env: PrebootEnv, boot_string: &str) -> Result<()> {
    ctx.variables.set_string(variable_name(env), boot_string)
}

const LEGACY_PREFIX: &str = "legacy:";

fn decode_legacy(boot_string: &str) -> Option<Interpretation> {
    let device = boot_string.strip_prefix(LEGACY_PREFIX)?;
    let device = device.strip_prefix("/dev/")?;
    is_bsd_name(device).then(|| Interpretation::Legacy {
        locator: DiskLocator::Device(device.to_owned()),
    })
}

fn encode_legacy(ctx: &Context<'_>, device: &str) -> Result<String> {
    let whole = whole_disk_of(ctx.registry, device)?;
    Ok(format!("{LEGACY_PREFIX}/dev/{whole}"))
}

/// BSD name of the whole disk holding a device.
pub(crate) fn whole_disk_of(registry: &dyn Registry, device: &str) -> Result<String> {
    let node = media_node(registry, device)?;
    if node.flag(KEY_WHOLE)? == Some(false) {
        return Ok(topology::resolve_parent(registry, device)?.parent);
    }
    node.bsd_name()?
        .ok_or_else(|| BlessError::not_found(format!("BSD name of {device}")))
}

/// Whether a string looks like a BSD disk name (`disk3`, `disk3s2`).
pub(crate) fn is_bsd_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("disk") else {
        return false;
    };
    let mut parts = rest.split('s');
    let whole = parts.next().unwrap_or_default();
    !whole.is_empty()
        && whole.bytes().all(|b| b.is_ascii_digit())
        && parts.all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

fn locate(ctx: &Context<'_>, locator: &DiskLocator) -> Result<String> {
    match locator {
        DiskLocator::Device(name) => {
            media_node(ctx.registry, name)?;
            Ok(name.clone())
        }
        DiskLocator::FirmwarePath(path) => find_media_by(ctx, KEY_FIRMWARE_PATH, path),
        DiskLocator::VolumeUuid(uuid) => find_media_by(ctx, KEY_UUID, uuid),
    }
}

fn find_media_by(ctx: &Context<'_>, key: &str, value: &str) -> Result<String> {
    for node in Node::matching(ctx.registry, CLASS_MEDIA)? {
        let node = node?;
        if node.string(key)?.as_deref() == Some(value) {
            if let Some(name) = node.bsd_name()? {
                return Ok(name);
            }
        }
    }
    Err(BlessError::not_found(format!("device with {key} {value}")))
}

/// Map an auxiliary booter partition back to the data partition it serves.
fn booter_to_data_partition(ctx: &Context<'_>, device: &str) -> Result<Option<String>> {
    let Some(content) = topology::content_of(ctx.registry, device)? else {
        return Ok(None);
    };
    let parent = match topology::resolve_parent(ctx.registry, device) {
        Ok(parent) => parent,
        Err(BlessError::NotFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };
    let (Some(offset), Some(booter)) = (
        parent.map_type.booter_offset(),
        parent.map_type.booter_content(),
    ) else {
        return Ok(None);
    };
    if content != booter {
        return Ok(None);
    }
    let data_index = parent.partition - offset;
    let node = media_node(ctx.registry, device)?;
    let Some(scheme) = node.parent(Plane::Service)? else {
        return Ok(None);
    };
    for sibling in scheme.children(Plane::Service)? {
        let sibling = sibling?;
        if sibling.number(KEY_PARTITION_ID)? != Some(data_index) {
            continue;
        }
        let sibling_content = sibling.string(KEY_CONTENT)?.unwrap_or_default();
        if natively_bootable(parent.map_type, &sibling_content) {
            return Ok(None);
        }
        let name = sibling.bsd_name()?;
        if let Some(name) = &name {
            debug!("{device} is the auxiliary booter of {name}");
        }
        return Ok(name);
    }
    Ok(None)
}

fn natively_bootable(map_type: PartitionMapType, content: &str) -> bool {
    map_type.natively_bootable().contains(&content)
}

fn substitute_role_folder(
    ctx: &Context<'_>,
    device: String,
    path: Option<String>,
) -> Result<BootTarget> {
    let Some(full_path) = path else {
        return Ok(BootTarget::Disk { device, path: None });
    };
    let Some((uuid, rest)) = roles::split_uuid_folder(&full_path) else {
        return Ok(BootTarget::Disk {
            device,
            path: Some(full_path),
        });
    };
    if !topology::is_container_volume(ctx.registry, &device)? {
        return Ok(BootTarget::Disk {
            device,
            path: Some(full_path),
        });
    }
    match roles::volume_for_uuid_folder(ctx.registry, &device, uuid)? {
        Some(system) => {
            debug!("{device}:{full_path} resolves to system volume {system}");
            // The default loader is implied by the redirect, so it decodes to no path.
            let path = (rest != efi::DEFAULT_LOADER).then(|| rest.to_owned());
            Ok(BootTarget::Disk {
                device: system,
                path,
            })
        }
        None => Ok(BootTarget::Disk {
            device,
            path: Some(full_path),
        }),
    }
}

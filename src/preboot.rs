// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Identify the firmware generation that will read the boot configuration.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;

use log::debug;
use serde::Serialize;

use crate::error::{BlessError, Result};
use crate::registry::{Node, Plane, Registry};

const EFI_PATH: &str = "/efi";
const OPENPROM_PATH: &str = "/openprom";
const CHOSEN_PATH: &str = "/chosen";
const ROOT_PATH: &str = "/";
const KEY_FIRMWARE_VERSION: &str = "firmware-version";
const KEY_MODEL: &str = "model";
const IBOOT_PREFIX: &str = "iBoot";
const NEW_WORLD_MODEL: &str = "Open Firmware, 3";

/// Preboot environment active on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrebootEnv {
    /// Open Firmware, including the older ROM-assisted variants.
    OpenFirmware,
    /// PC BIOS.
    Bios,
    /// EFI firmware.
    Efi,
    /// Embedded boot ROM.
    IBoot,
}

impl fmt::Display for PrebootEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PrebootEnv::OpenFirmware => "Open Firmware",
            PrebootEnv::Bios => "BIOS",
            PrebootEnv::Efi => "EFI",
            PrebootEnv::IBoot => "iBoot",
        };
        f.write_str(label)
    }
}

fn tree_node<'r>(registry: &'r dyn Registry, path: &str) -> Result<Option<Node<'r>>> {
    Node::by_path(registry, Plane::DeviceTree, path)
}

/// Determine the active preboot environment.
///
/// A host whose device tree cannot be inspected fails with `UnknownEnvironment`.
pub fn classify(registry: &dyn Registry) -> Result<PrebootEnv> {
    let env = if tree_node(registry, EFI_PATH)?.is_some() {
        PrebootEnv::Efi
    } else if tree_node(registry, OPENPROM_PATH)?.is_some() {
        PrebootEnv::OpenFirmware
    } else if is_iboot(registry)? {
        PrebootEnv::IBoot
    } else if tree_node(registry, ROOT_PATH)?.is_some() {
        PrebootEnv::Bios
    } else {
        return Err(BlessError::UnknownEnvironment);
    };
    debug!("preboot environment is {env}");
    Ok(env)
}

fn is_iboot(registry: &dyn Registry) -> Result<bool> {
    let Some(chosen) = tree_node(registry, CHOSEN_PATH)? else {
        return Ok(false);
    };
    Ok(chosen
        .string(KEY_FIRMWARE_VERSION)?
        .is_some_and(|version| version.starts_with(IBOOT_PREFIX)))
}

/// Whether Open Firmware needs the loader selector appended to boot strings.
pub fn is_new_world(registry: &dyn Registry) -> Result<bool> {
    let Some(openprom) = tree_node(registry, OPENPROM_PATH)? else {
        return Ok(false);
    };
    Ok(openprom
        .string(KEY_MODEL)?
        .is_some_and(|model| model.contains(NEW_WORLD_MODEL)))
}

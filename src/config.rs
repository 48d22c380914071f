// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load bless tunables from defaults, an optional TOML file and the environment.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{BlessError, Result};

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "BLESS_CONFIG";
/// Environment variable flagging an OS install environment.
pub const INSTALL_ENV: &str = "__OSINSTALL_ENVIRONMENT";
/// Environment variable selecting the primary auxiliary booter.
pub const PRIMARY_BOOTER_ENV: &str = "BL_PRIMARY_BOOTER_INDEX";

const DEFAULT_MOUNT_HELPER: &str = "/sbin/mount";
const DEFAULT_UNMOUNT_HELPER: &str = "/sbin/umount";
const DEFAULT_SNAPSHOT_MOUNT_HELPER: &str = "/sbin/mount_apfs";
const DEFAULT_NVRAM_HELPER: &str = "/usr/sbin/nvram";
const DEFAULT_INSTALL_SCRATCH: &str = "/var/tmp/RecoveryTemp";
const DEFAULT_FALLBACK_SCRATCH: &str = "/var/tmp";
const DEFAULT_CONTAINER_FS: &str = "apfs";
const DEFAULT_MAX_OBJECT_HOPS: u32 = 1024;

/// Tunables consumed by the resolution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlessConfig {
    /// Privileged mount helper.
    pub mount_helper: PathBuf,
    /// Unmount helper.
    pub unmount_helper: PathBuf,
    /// Helper used to mount container snapshots.
    pub snapshot_mount_helper: PathBuf,
    /// Firmware variable helper.
    pub nvram_helper: PathBuf,
    /// Preferred parent directory for private mount points.
    pub scratch_dir: PathBuf,
    /// Scratch directory used inside an OS install environment.
    pub install_scratch_dir: PathBuf,
    /// Scratch directory used when the preferred one is not writable.
    pub fallback_scratch_dir: PathBuf,
    /// Whether the process runs inside an OS install environment.
    pub install_environment: bool,
    /// Auxiliary booter moved to the front of booter listings.
    pub primary_booter_index: Option<usize>,
    /// Filesystem type passed to the mount helper for container volumes.
    pub container_fs_type: String,
    /// Maximum parent hops while resolving an object id to a path.
    pub max_object_hops: u32,
}

impl Default for BlessConfig {
    fn default() -> Self {
        Self {
            mount_helper: PathBuf::from(DEFAULT_MOUNT_HELPER),
            unmount_helper: PathBuf::from(DEFAULT_UNMOUNT_HELPER),
            snapshot_mount_helper: PathBuf::from(DEFAULT_SNAPSHOT_MOUNT_HELPER),
            nvram_helper: PathBuf::from(DEFAULT_NVRAM_HELPER),
            scratch_dir: env::temp_dir(),
            install_scratch_dir: PathBuf::from(DEFAULT_INSTALL_SCRATCH),
            fallback_scratch_dir: PathBuf::from(DEFAULT_FALLBACK_SCRATCH),
            install_environment: false,
            primary_booter_index: None,
            container_fs_type: DEFAULT_CONTAINER_FS.to_owned(),
            max_object_hops: DEFAULT_MAX_OBJECT_HOPS,
        }
    }
}

impl BlessConfig {
    /// Directory under which private mount points are created first.
    #[must_use]
    pub fn preferred_scratch_dir(&self) -> &Path {
        if self.install_environment {
            &self.install_scratch_dir
        } else {
            &self.scratch_dir
        }
    }

    /// Apply overrides from a variable lookup function.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(INSTALL_ENV) {
            self.install_environment = parse_install_flag(&value);
        }
        if let Some(value) = lookup(PRIMARY_BOOTER_ENV) {
            let index = value.trim().parse::<usize>().map_err(|_| {
                BlessError::Config(format!("{PRIMARY_BOOTER_ENV} is not an index: {value:?}"))
            })?;
            self.primary_booter_index = Some(index);
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| env::var(name).ok())
    }

    /// Defaults, then the file named by `BLESS_CONFIG` (if any), then the environment.
    pub fn from_env() -> Result<Self> {
        Self::resolve(None)
    }

    /// Like [`BlessConfig::from_env`], with `explicit` taking precedence over `BLESS_CONFIG`.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match (explicit, env::var_os(CONFIG_ENV)) {
            (Some(path), _) => load_config(path)?,
            (None, Some(path)) => load_config(Path::new(&path))?,
            (None, None) => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }
}

fn parse_install_flag(value: &str) -> bool {
    let value = value.trim();
    if let Ok(number) = value.parse::<i64>() {
        return number > 0;
    }
    value.eq_ignore_ascii_case("yes") || value.eq_ignore_ascii_case("true")
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    #[serde(default)]
    helpers: HelpersTomlSection,
    #[serde(default)]
    scratch: ScratchTomlSection,
    #[serde(default)]
    limits: LimitsTomlSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HelpersTomlSection {
    mount: Option<PathBuf>,
    unmount: Option<PathBuf>,
    snapshot_mount: Option<PathBuf>,
    nvram: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScratchTomlSection {
    dir: Option<PathBuf>,
    install_dir: Option<PathBuf>,
    fallback_dir: Option<PathBuf>,
    install_environment: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LimitsTomlSection {
    primary_booter_index: Option<usize>,
    container_fs_type: Option<String>,
    max_object_hops: Option<u32>,
}

/// Parse configuration TOML layered over the defaults.
pub fn parse_config(text: &str) -> Result<BlessConfig> {
    let parsed: ConfigToml =
        toml::from_str(text).map_err(|err| BlessError::Config(err.to_string()))?;
    let mut config = BlessConfig::default();
    let helpers = parsed.helpers;
    if let Some(path) = helpers.mount {
        config.mount_helper = path;
    }
    if let Some(path) = helpers.unmount {
        config.unmount_helper = path;
    }
    if let Some(path) = helpers.snapshot_mount {
        config.snapshot_mount_helper = path;
    }
    if let Some(path) = helpers.nvram {
        config.nvram_helper = path;
    }
    let scratch = parsed.scratch;
    if let Some(dir) = scratch.dir {
        config.scratch_dir = dir;
    }
    if let Some(dir) = scratch.install_dir {
        config.install_scratch_dir = dir;
    }
    if let Some(dir) = scratch.fallback_dir {
        config.fallback_scratch_dir = dir;
    }
    if let Some(flag) = scratch.install_environment {
        config.install_environment = flag;
    }
    let limits = parsed.limits;
    config.primary_booter_index = limits.primary_booter_index;
    if let Some(fs_type) = limits.container_fs_type {
        config.container_fs_type = fs_type;
    }
    if let Some(hops) = limits.max_object_hops {
        if hops == 0 {
            return Err(BlessError::Config("max_object_hops must be positive".to_owned()));
        }
        config.max_object_hops = hops;
    }
    Ok(config)
}

/// Load configuration TOML from disk.
pub fn load_config(path: &Path) -> Result<BlessConfig> {
    let text = fs::read_to_string(path).map_err(|err| BlessError::io(path, err))?;
    parse_config(&text).map_err(|err| match err {
        BlessError::Config(detail) => {
            BlessError::Config(format!("{}: {detail}", path.display()))
        }
        other => other,
    })
}

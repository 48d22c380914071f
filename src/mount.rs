// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Mount helper volumes at private scratch locations and tear them down on every path.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Mount orchestrator.
//!
//! Helper volumes (preboot, recovery, snapshots) are mounted through an
//! external helper at a fresh directory under a scratch location. A
//! [`MountGuard`] owns each mount it created and unmounts it when dropped, so
//! error returns cannot leak mount points or directories. Devices that are
//! already mounted are reused and never unmounted.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::BlessConfig;
use crate::context::Context;
use crate::error::{BlessError, Result};
use crate::topology::strip_dev;

const MOUNT_PREFIX: &str = "bless.";
const SNAPSHOT_PREFIX: &str = "snapshot.";

/// One row of the live mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Mounted device, usually `/dev/<bsd>`.
    pub device: String,
    /// Directory the device is mounted on.
    pub mountpoint: PathBuf,
    /// Filesystem type.
    #[serde(default)]
    pub fs_type: String,
}

/// Snapshot source for the live mount table.
pub trait MountTable {
    /// Enumerate current mounts; taken fresh on every call.
    fn mounts(&self) -> Result<Vec<MountEntry>>;
}

/// Mount entry of a device, compared by BSD name.
pub fn mount_for_device(table: &dyn MountTable, device: &str) -> Result<Option<MountEntry>> {
    let wanted = strip_dev(device);
    Ok(table
        .mounts()?
        .into_iter()
        .find(|entry| strip_dev(&entry.device) == wanted))
}

/// Mount entry whose mount point is the longest prefix of `path`.
pub fn mount_containing(table: &dyn MountTable, path: &Path) -> Result<Option<MountEntry>> {
    Ok(table
        .mounts()?
        .into_iter()
        .filter(|entry| path.starts_with(&entry.mountpoint))
        .max_by_key(|entry| entry.mountpoint.components().count()))
}

/// Fixed argument vector for an external helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Helper program.
    pub program: PathBuf,
    /// Arguments, never passed through a shell.
    pub args: Vec<String>,
    /// Discard the helper's standard output.
    pub quiet: bool,
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Completion status of an external helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Exited with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
}

impl CommandOutcome {
    /// Whether the helper exited with status zero.
    #[must_use]
    pub fn success(self) -> bool {
        self == CommandOutcome::Exited(0)
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Exited(code) => write!(f, "exit status {code}"),
            CommandOutcome::Signaled(signal) => write!(f, "terminated by signal {signal}"),
        }
    }
}

/// Synchronous runner for privileged helpers. No timeout is applied.
pub trait CommandRunner {
    /// Run the helper to completion.
    fn run(&self, command: &CommandSpec) -> Result<CommandOutcome>;
}

/// A device made available at a mount point for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountRecord {
    /// BSD name of the device.
    pub device: String,
    /// Where the device is mounted.
    pub mountpoint: PathBuf,
    /// Whether this orchestrator created the mount and must tear it down.
    pub private: bool,
}

impl MountRecord {
    /// Rewrite a path under the mount point so it does not leak a private location.
    ///
    /// Paths under a private mount come back rooted at `/`; paths under a
    /// pre-existing mount are returned unchanged.
    #[must_use]
    pub fn portable_path(&self, path: &Path) -> PathBuf {
        if !self.private {
            return path.to_path_buf();
        }
        match path.strip_prefix(&self.mountpoint) {
            Ok(rest) => Path::new("/").join(rest),
            Err(_) => path.to_path_buf(),
        }
    }
}

/// Mounts helper volumes and releases them.
#[derive(Clone, Copy)]
pub struct MountOrchestrator<'a> {
    table: &'a dyn MountTable,
    runner: &'a dyn CommandRunner,
    config: &'a BlessConfig,
}

impl fmt::Debug for MountOrchestrator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOrchestrator")
            .field("config", self.config)
            .finish_non_exhaustive()
    }
}

impl<'a> MountOrchestrator<'a> {
    /// Build from explicit collaborators.
    #[must_use]
    pub fn new(
        table: &'a dyn MountTable,
        runner: &'a dyn CommandRunner,
        config: &'a BlessConfig,
    ) -> Self {
        Self {
            table,
            runner,
            config,
        }
    }

    /// Build from a host context.
    #[must_use]
    pub fn from_context(ctx: &Context<'a>) -> Self {
        Self::new(ctx.mounts, ctx.runner, ctx.config)
    }

    /// Make a device available, reusing an existing mount when there is one.
    ///
    /// A record with `private == true` must be handed to [`Self::release`];
    /// prefer [`Self::mount`], which does that on drop.
    pub fn ensure_mounted(&self, device: &str, read_only: bool) -> Result<MountRecord> {
        let bsd = strip_dev(device);
        if let Some(entry) = mount_for_device(self.table, bsd)? {
            debug!("{bsd} already mounted at {}", entry.mountpoint.display());
            return Ok(MountRecord {
                device: bsd.to_owned(),
                mountpoint: entry.mountpoint,
                private: false,
            });
        }
        let mountpoint = self.scratch_mountpoint(MOUNT_PREFIX)?;
        let mut args = vec![
            "-t".to_owned(),
            self.config.container_fs_type.clone(),
            "-o".to_owned(),
            "perm".to_owned(),
            "-o".to_owned(),
            "owners".to_owned(),
            "-o".to_owned(),
            "nobrowse".to_owned(),
        ];
        if read_only {
            args.push("-r".to_owned());
        }
        args.push(format!("/dev/{bsd}"));
        args.push(mountpoint.display().to_string());
        let command = CommandSpec {
            program: self.config.mount_helper.clone(),
            args,
            quiet: false,
        };
        self.run_mount(bsd, &command, &mountpoint)?;
        Ok(MountRecord {
            device: bsd.to_owned(),
            mountpoint,
            private: true,
        })
    }

    /// Mount a named snapshot of a volume read-only at a private location.
    pub fn mount_snapshot(&self, device: &str, snapshot: &str) -> Result<MountGuard<'a>> {
        let bsd = strip_dev(device);
        if snapshot.is_empty() {
            return Err(BlessError::InvalidArgument(
                "snapshot name must not be empty".to_owned(),
            ));
        }
        let mountpoint = self.scratch_mountpoint(SNAPSHOT_PREFIX)?;
        let command = CommandSpec {
            program: self.config.snapshot_mount_helper.clone(),
            args: vec![
                "-s".to_owned(),
                snapshot.to_owned(),
                "-o".to_owned(),
                "perm".to_owned(),
                "-o".to_owned(),
                "owners".to_owned(),
                "-o".to_owned(),
                "nobrowse".to_owned(),
                "-o".to_owned(),
                "rdonly".to_owned(),
                format!("/dev/{bsd}"),
                mountpoint.display().to_string(),
            ],
            quiet: false,
        };
        self.run_mount(bsd, &command, &mountpoint)?;
        Ok(MountGuard {
            orchestrator: *self,
            record: Some(MountRecord {
                device: bsd.to_owned(),
                mountpoint,
                private: true,
            }),
        })
    }

    /// Scoped variant of [`Self::ensure_mounted`].
    pub fn mount(&self, device: &str, read_only: bool) -> Result<MountGuard<'a>> {
        let record = self.ensure_mounted(device, read_only)?;
        Ok(MountGuard {
            orchestrator: *self,
            record: Some(record),
        })
    }

    /// Undo a mount created by [`Self::ensure_mounted`]; pre-existing mounts are left alone.
    ///
    /// Failures are logged, never returned.
    pub fn release(&self, record: &MountRecord) {
        if !record.private {
            return;
        }
        let command = CommandSpec {
            program: self.config.unmount_helper.clone(),
            args: vec![format!("/dev/{}", record.device)],
            quiet: true,
        };
        debug!("executing {command}");
        match self.runner.run(&command) {
            Ok(outcome) if outcome.success() => {
                if let Err(err) = fs::remove_dir(&record.mountpoint) {
                    warn!(
                        "could not remove mount point {}: {err}",
                        record.mountpoint.display()
                    );
                }
            }
            Ok(outcome) => warn!(
                "{} returned {outcome} for {}",
                self.config.unmount_helper.display(),
                record.device
            ),
            Err(err) => warn!("could not unmount {}: {err}", record.device),
        }
    }

    fn run_mount(&self, bsd: &str, command: &CommandSpec, mountpoint: &Path) -> Result<()> {
        debug!("executing {command}");
        let failure = match self.runner.run(command) {
            Ok(outcome) if outcome.success() => return Ok(()),
            Ok(outcome) => outcome.to_string(),
            Err(err) => err.to_string(),
        };
        if let Err(err) = fs::remove_dir(mountpoint) {
            warn!(
                "could not remove mount point {}: {err}",
                mountpoint.display()
            );
        }
        Err(BlessError::MountFailed {
            device: bsd.to_owned(),
            detail: format!("{}: {failure}", command.program.display()),
        })
    }

    fn scratch_mountpoint(&self, prefix: &str) -> Result<PathBuf> {
        let preferred = self.config.preferred_scratch_dir();
        match create_scratch(preferred, prefix) {
            Ok(path) => Ok(path),
            Err(err) => {
                warn!(
                    "temporary directory {} is not writable ({err}); using {}",
                    preferred.display(),
                    self.config.fallback_scratch_dir.display()
                );
                create_scratch(&self.config.fallback_scratch_dir, prefix)
            }
        }
    }
}

fn create_scratch(parent: &Path, prefix: &str) -> Result<PathBuf> {
    let parent = fs::canonicalize(parent).map_err(|err| BlessError::io(parent, err))?;
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .rand_bytes(4)
        .tempdir_in(&parent)
        .map_err(|err| BlessError::io(&parent, err))?;
    let path = dir.into_path();
    debug!("mounting at {}", path.display());
    Ok(path)
}

/// Owns a [`MountRecord`] and releases it on drop.
pub struct MountGuard<'a> {
    orchestrator: MountOrchestrator<'a>,
    record: Option<MountRecord>,
}

impl MountGuard<'_> {
    /// The mount point in use.
    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        self.record
            .as_ref()
            .map_or_else(|| Path::new(""), |record| record.mountpoint.as_path())
    }

    /// The tracked record.
    #[must_use]
    pub fn record(&self) -> Option<&MountRecord> {
        self.record.as_ref()
    }

    /// Whether this guard will unmount on drop.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.record.as_ref().is_some_and(|record| record.private)
    }

    /// Release now instead of at drop.
    pub fn release(mut self) {
        if let Some(record) = self.record.take() {
            self.orchestrator.release(&record);
        }
    }
}

impl fmt::Debug for MountGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountGuard")
            .field("record", &self.record)
            .finish()
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.orchestrator.release(&record);
        }
    }
}

/// Join a path that may be absolute onto a mount point.
#[must_use]
pub fn join_under(mountpoint: &Path, path: &Path) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .collect();
    mountpoint.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portable_path_strips_private_mountpoint() {
        let record = MountRecord {
            device: "disk3s2".to_owned(),
            mountpoint: PathBuf::from("/var/tmp/bless.ab12"),
            private: true,
        };
        assert_eq!(
            record.portable_path(Path::new("/var/tmp/bless.ab12/UUID/boot.efi")),
            PathBuf::from("/UUID/boot.efi")
        );
        let shared = MountRecord {
            private: false,
            ..record
        };
        assert_eq!(
            shared.portable_path(Path::new("/var/tmp/bless.ab12/UUID")),
            PathBuf::from("/var/tmp/bless.ab12/UUID")
        );
    }

    #[test]
    fn join_under_ignores_leading_root() {
        assert_eq!(
            join_under(Path::new("/Volumes/Preboot"), Path::new("/ABC/System")),
            PathBuf::from("/Volumes/Preboot/ABC/System")
        );
    }

    #[test]
    fn outcome_reports_signals() {
        assert!(CommandOutcome::Exited(0).success());
        assert!(!CommandOutcome::Signaled(9).success());
        assert_eq!(
            CommandOutcome::Signaled(9).to_string(),
            "terminated by signal 9"
        );
    }
}

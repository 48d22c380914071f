// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Live host capabilities backed by the process mount table and external helpers.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, warn};

use crate::codec::VariableStore;
use crate::error::{BlessError, Result};
use crate::mount::{CommandOutcome, CommandRunner, CommandSpec, MountEntry, MountTable};

/// Default location of the process mount table.
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Mount table read from a `/proc/self/mounts` style file.
#[derive(Debug, Clone)]
pub struct ProcMountTable {
    path: PathBuf,
}

impl ProcMountTable {
    /// Table read from `path` on every query.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMountTable {
    fn default() -> Self {
        Self::new(PROC_MOUNTS)
    }
}

impl MountTable for ProcMountTable {
    fn mounts(&self) -> Result<Vec<MountEntry>> {
        let text = fs::read_to_string(&self.path).map_err(|err| BlessError::io(&self.path, err))?;
        Ok(parse_mount_table(&text))
    }
}

/// Parse mount table lines: device, mount point and filesystem type, with
/// octal escapes (`\040` for a space) decoded.
#[must_use]
pub fn parse_mount_table(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mountpoint = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: unescape_octal(device),
                mountpoint: PathBuf::from(unescape_octal(mountpoint)),
                fs_type: fs_type.to_owned(),
            })
        })
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'\\' && index + 3 < bytes.len() {
            let digits = &bytes[index + 1..index + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    index += 4;
                    continue;
                }
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Runs helpers as child processes and waits for them without a timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutcome> {
        let mut child = Command::new(&command.program);
        child.args(&command.args);
        if command.quiet {
            child.stdout(Stdio::null());
        }
        let status = child
            .status()
            .map_err(|err| BlessError::io(&command.program, err))?;
        let outcome = match (status.code(), status.signal()) {
            (Some(code), _) => CommandOutcome::Exited(code),
            (None, Some(signal)) => CommandOutcome::Signaled(signal),
            (None, None) => CommandOutcome::Exited(-1),
        };
        debug!("{command}: {outcome}");
        Ok(outcome)
    }
}

/// Firmware variables accessed through the nvram helper.
#[derive(Debug, Clone)]
pub struct NvramVariableStore {
    helper: PathBuf,
}

impl NvramVariableStore {
    /// Store using the given helper program.
    #[must_use]
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
        }
    }

    fn helper(&self) -> &Path {
        &self.helper
    }
}

/// Value part of an nvram helper line, `<name>\t<value>`.
#[must_use]
pub fn parse_nvram_line<'a>(name: &str, line: &'a str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?;
    rest.strip_prefix('\t').map(|value| value.trim_end_matches(['\r', '\n']))
}

impl VariableStore for NvramVariableStore {
    fn get_string(&self, name: &str) -> Result<Option<String>> {
        let output = Command::new(self.helper())
            .arg(name)
            .stderr(Stdio::null())
            .output()
            .map_err(|err| BlessError::io(self.helper(), err))?;
        if !output.status.success() {
            debug!("{} {name}: {}", self.helper().display(), output.status);
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .find_map(|line| parse_nvram_line(name, line))
            .map(str::to_owned))
    }

    fn set_string(&self, name: &str, value: &str) -> Result<()> {
        let status = Command::new(self.helper())
            .arg(format!("{name}={value}"))
            .status()
            .map_err(|err| BlessError::io(self.helper(), err))?;
        if status.success() {
            Ok(())
        } else {
            warn!("{} could not set {name}", self.helper().display());
            Err(BlessError::ServiceUnavailable(format!(
                "{} exited with {status}",
                self.helper().display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_table_decodes_escaped_spaces() {
        let table = "/dev/disk1s1 / apfs rw 0 0\n/dev/disk2s1 /Volumes/Mac\\040HD hfs rw 0 0\n";
        let entries = parse_mount_table(table);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].mountpoint, PathBuf::from("/Volumes/Mac HD"));
        assert_eq!(entries[1].fs_type, "hfs");
    }

    #[test]
    fn malformed_escapes_are_kept() {
        assert_eq!(unescape_octal("a\\09"), "a\\09");
        assert_eq!(unescape_octal("tail\\"), "tail\\");
    }

    #[test]
    fn nvram_lines_split_on_tab() {
        assert_eq!(
            parse_nvram_line("efi-boot-device", "efi-boot-device\t/dev/disk0s2"),
            Some("/dev/disk0s2")
        );
        assert_eq!(parse_nvram_line("boot-args", "boot-args-extra\tx"), None);
    }
}

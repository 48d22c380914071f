// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Error taxonomy shared by every bless resolution component.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::io;
use std::path::PathBuf;

use bless_record::RecordError;
use thiserror::Error;

/// Result alias used across the library.
pub type Result<T, E = BlessError> = std::result::Result<T, E>;

/// Errors surfaced by boot-target resolution and persistence.
#[derive(Debug, Error)]
pub enum BlessError {
    /// Expected absence of a device, mount, variable or object.
    #[error("{0} not found")]
    NotFound(String),
    /// The parent of a partition is not a recognised partition scheme.
    #[error("unsupported partition topology for {device}: {scheme}")]
    UnsupportedTopology {
        /// Device whose parent was inspected.
        device: String,
        /// Class of the unrecognised parent.
        scheme: String,
    },
    /// A registry hop failed while walking a fixed hierarchy.
    #[error("topology walk failed at {device}: {detail}")]
    TopologyWalkFailed {
        /// Device at which the walk started.
        device: String,
        /// Description of the failing hop.
        detail: String,
    },
    /// The device registry could not answer a query.
    #[error("device registry unavailable: {0}")]
    ServiceUnavailable(String),
    /// No preboot environment could be identified on this host.
    #[error("unknown preboot environment")]
    UnknownEnvironment,
    /// No decoder accepted the supplied boot string.
    #[error("uninterpretable boot string {0:?}")]
    Uninterpretable(String),
    /// The external mount helper reported failure.
    #[error("mount of {device} failed: {detail}")]
    MountFailed {
        /// Device that could not be mounted.
        device: String,
        /// Exit status or spawn failure description.
        detail: String,
    },
    /// Object-id resolution hit a missing link or exceeded the hop limit.
    #[error("broken object chain for id {id} on {mountpoint}")]
    BrokenChain {
        /// Mount point being searched.
        mountpoint: PathBuf,
        /// Object id that could not be resolved.
        id: u64,
    },
    /// More than one volume carries a role expected to be unique.
    #[error("ambiguous {role} role in container {container}")]
    AmbiguousRole {
        /// Container that was searched.
        container: String,
        /// Requested role.
        role: String,
    },
    /// No volume in the container carries the requested role.
    #[error("no {role} volume in container {container}")]
    NoSuchRole {
        /// Container that was searched.
        container: String,
        /// Requested role.
        role: String,
    },
    /// Caller supplied an argument the operation cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Bless record layout violation.
    #[error("bless record: {0}")]
    Record(#[from] RecordError),
    /// Filesystem access failure.
    #[error("{path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Configuration could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BlessError {
    /// Wrap an I/O error with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub(crate) fn walk(device: &str, detail: impl Into<String>) -> Self {
        Self::TopologyWalkFailed {
            device: device.to_owned(),
            detail: detail.into(),
        }
    }

    /// Coarse process exit code for this error class; 0 is reserved for success.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            BlessError::UnknownEnvironment
            | BlessError::Uninterpretable(_)
            | BlessError::ServiceUnavailable(_)
            | BlessError::InvalidArgument(_)
            | BlessError::Io { .. }
            | BlessError::Config(_) => 1,
            BlessError::NotFound(_) => 2,
            BlessError::UnsupportedTopology { .. } | BlessError::TopologyWalkFailed { .. } => 3,
            BlessError::AmbiguousRole { .. } | BlessError::NoSuchRole { .. } => 4,
            BlessError::BrokenChain { .. } | BlessError::Record(_) => 5,
            BlessError::MountFailed { .. } => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_group_error_classes() {
        assert_eq!(BlessError::not_found("disk9").exit_code(), 2);
        assert_eq!(BlessError::walk("disk1s1", "no parent").exit_code(), 3);
        let role = BlessError::NoSuchRole {
            container: "disk3".to_owned(),
            role: "Preboot".to_owned(),
        };
        assert_eq!(role.exit_code(), 4);
        assert_eq!(
            BlessError::Record(RecordError::WordIndex(9)).exit_code(),
            5
        );
        let mount = BlessError::MountFailed {
            device: "disk3s2".to_owned(),
            detail: "exit status 1".to_owned(),
        };
        assert_eq!(mount.exit_code(), 6);
        assert_eq!(BlessError::UnknownEnvironment.exit_code(), 1);
    }
}

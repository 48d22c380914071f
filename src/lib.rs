// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Resolve boot devices, auxiliary booters and bless records for the bless tool.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Boot-configuration resolution.
//!
//! Given a volume or device, the library works out which partitions the
//! firmware must touch to boot it, encodes and decodes firmware boot strings
//! for the active preboot environment, and reads and writes the per-volume
//! bless records. Host access (device registry, mount table, mount helpers,
//! metadata attributes and firmware variables) is injected through
//! [`context::Context`].

/// Read and write bless records on mounted volumes.
pub mod accessor;
/// Firmware boot string codec.
pub mod codec;
/// Tunables loaded from defaults, TOML and the environment.
pub mod config;
/// Host capability bundle.
pub mod context;
/// Auxiliary booter, RAID member and volume role discovery.
pub mod discovery;
/// Error taxonomy and exit codes.
pub mod error;
/// Snapshot and live host implementations.
pub mod host;
/// Volume and boot reports, and boot configuration changes.
pub mod info;
/// Helper volume mounting.
pub mod mount;
/// Preboot environment classification.
pub mod preboot;
/// Device registry adapter.
pub mod registry;
/// Partition map and container topology.
pub mod topology;

pub use bless_record::{ApfsBlessData, BlessRecord, FinderInfo, RecordKind};
pub use codec::{BootTarget, NetBootProtocol};
pub use config::BlessConfig;
pub use context::Context;
pub use error::{BlessError, Result};
pub use preboot::PrebootEnv;

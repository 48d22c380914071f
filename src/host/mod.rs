// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Concrete host capability implementations for the bless CLI and tests.
// Author: Lukas Bower
#![forbid(unsafe_code)]

pub mod snapshot;
pub mod system;

pub use snapshot::{
    HostSnapshot, MemoryMetadataStore, MemoryMountTable, MemoryVariableStore, SimulatedMounter,
    SnapshotHost, VolumeImage, VolumeObject,
};
pub use system::{NvramVariableStore, ProcMountTable, ProcessRunner};

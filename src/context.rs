// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Bundle the host capabilities every resolution step receives explicitly.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;

use crate::accessor::MetadataStore;
use crate::codec::VariableStore;
use crate::config::BlessConfig;
use crate::mount::{CommandRunner, MountTable};
use crate::registry::Registry;

/// Host capabilities for one invocation.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    /// Device registry.
    pub registry: &'a dyn Registry,
    /// Live mount table.
    pub mounts: &'a dyn MountTable,
    /// Runner for mount and unmount helpers.
    pub runner: &'a dyn CommandRunner,
    /// Volume metadata attributes.
    pub metadata: &'a dyn MetadataStore,
    /// Firmware variable store.
    pub variables: &'a dyn VariableStore,
    /// Tunables.
    pub config: &'a BlessConfig,
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", self.config)
            .finish_non_exhaustive()
    }
}

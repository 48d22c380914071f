// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Abstract device registry capability and scoped node handles.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Device registry adapter.
//!
//! The registry is a host capability: a graph of media, partition schemes,
//! containers and volumes with string-keyed properties. Every lookup that
//! yields a [`NodeId`] acquires a reference which must be handed back through
//! [`Registry::release`]. Callers inside this crate never do that by hand;
//! they hold a [`Node`] which releases on drop, so every exit path returns the
//! reference and scans keep at most a constant number of nodes open.

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Generic media object.
pub const CLASS_MEDIA: &str = "IOMedia";
/// Apple partition map scheme.
pub const CLASS_APM_SCHEME: &str = "IOApplePartitionScheme";
/// GUID partition table scheme.
pub const CLASS_GPT_SCHEME: &str = "IOGUIDPartitionScheme";
/// Master boot record scheme.
pub const CLASS_MBR_SCHEME: &str = "IOFDiskPartitionScheme";
/// Synthesised whole-disk media published by a container.
pub const CLASS_CONTAINER_MEDIA: &str = "AppleAPFSMedia";
/// Container object between the synthesised disk and its volumes.
pub const CLASS_CONTAINER: &str = "AppleAPFSContainer";
/// Scheme object sitting on top of a container's physical stores.
pub const CLASS_CONTAINER_SCHEME: &str = "AppleAPFSContainerScheme";
/// Logical volume inside a container.
pub const CLASS_VOLUME: &str = "AppleAPFSVolume";
/// Snapshot of a logical volume.
pub const CLASS_SNAPSHOT: &str = "AppleAPFSSnapshot";

/// BSD device name of a media node.
pub const KEY_BSD_NAME: &str = "BSD Name";
/// Content (partition type) tag of a media node.
pub const KEY_CONTENT: &str = "Content";
/// One-based partition index within its scheme.
pub const KEY_PARTITION_ID: &str = "Partition ID";
/// Whether a media node is a whole disk.
pub const KEY_WHOLE: &str = "Whole";
/// Volume UUID.
pub const KEY_UUID: &str = "UUID";
/// Role list of a container volume.
pub const KEY_ROLE: &str = "Role";
/// Volume group UUID shared by paired system and data volumes.
pub const KEY_VOLUME_GROUP_UUID: &str = "VolGroupUUID";
/// Boot-device records published by aggregate media.
pub const KEY_BOOT_DEVICE: &str = "IOBootDevice";
/// Registry path inside a boot-device record.
pub const KEY_BOOT_DEVICE_PATH: &str = "IOBootDevicePath";
/// Protocol characteristics dictionary published by storage drivers.
pub const KEY_PROTOCOL_CHARACTERISTICS: &str = "Protocol Characteristics";
/// Interconnect type inside the protocol characteristics.
pub const KEY_INTERCONNECT_TYPE: &str = "Physical Interconnect";
/// Interconnect location inside the protocol characteristics.
pub const KEY_INTERCONNECT_LOCATION: &str = "Physical Interconnect Location";
/// Firmware device path of a media node.
pub const KEY_FIRMWARE_PATH: &str = "firmware-path";

/// Registry planes the resolver walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Plane {
    /// Service plane: drivers, media and their clients.
    Service,
    /// Firmware device tree.
    DeviceTree,
}

impl Plane {
    /// Prefix naming the plane in qualified registry paths.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Plane::Service => "IOService:",
            Plane::DeviceTree => "IODeviceTree:",
        }
    }

    /// Split a qualified path such as `IODeviceTree:/efi` into plane and path.
    ///
    /// Unqualified paths belong to the service plane.
    #[must_use]
    pub fn split_path(path: &str) -> (Plane, &str) {
        for plane in [Plane::Service, Plane::DeviceTree] {
            if let Some(rest) = path.strip_prefix(plane.prefix()) {
                return (plane, rest);
            }
        }
        (Plane::Service, path)
    }
}

/// Identity of a registry entry.
///
/// Two ids compare equal exactly when they name the same entry, so equality
/// doubles as the registry's "is the same object" test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Wrap a raw registry entry id.
    #[must_use]
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Raw registry entry id.
    #[must_use]
    pub fn into_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry#{}", self.0)
    }
}

/// Typed registry property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer number.
    Number(i64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    Array(Vec<PropertyValue>),
    /// String-keyed dictionary.
    Dict(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Borrow the value as a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// Read the value as an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Read the value as a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Borrow the value as an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Borrow the value as a dictionary.
    #[must_use]
    pub fn as_dict(&self) -> Option<&BTreeMap<String, PropertyValue>> {
        match self {
            PropertyValue::Dict(map) => Some(map),
            _ => None,
        }
    }
}

/// Lazily acquiring node iterator returned by registry enumerations.
pub type NodeIter<'r> = Box<dyn Iterator<Item = Result<NodeId>> + 'r>;

/// Host device registry.
///
/// Methods returning [`NodeId`] hand over an acquired reference. Iterators
/// acquire each node as it is yielded, never ahead of time.
pub trait Registry {
    /// Look up the media node carrying the given BSD name.
    fn find_by_name(&self, bsd_name: &str) -> Result<Option<NodeId>>;
    /// Look up a node by its path in a plane.
    fn find_by_path(&self, plane: Plane, path: &str) -> Result<Option<NodeId>>;
    /// Enumerate every node conforming to a class.
    fn matching(&self, class: &str) -> Result<NodeIter<'_>>;
    /// Read a property of a node.
    fn property(&self, node: NodeId, key: &str) -> Result<Option<PropertyValue>>;
    /// First parent of a node in a plane.
    fn parent(&self, node: NodeId, plane: Plane) -> Result<Option<NodeId>>;
    /// Every parent of a node in a plane.
    fn parents(&self, node: NodeId, plane: Plane) -> Result<NodeIter<'_>>;
    /// Direct children of a node in a plane.
    fn children(&self, node: NodeId, plane: Plane) -> Result<NodeIter<'_>>;
    /// Whether the node is an instance of the class or one of its subclasses.
    fn conforms_to(&self, node: NodeId, class: &str) -> Result<bool>;
    /// Registry name of the node.
    fn name(&self, node: NodeId) -> Result<String>;
    /// Return a reference obtained from any lookup.
    fn release(&self, node: NodeId);
}

/// Scoped registry reference, released when dropped.
pub struct Node<'r> {
    registry: &'r dyn Registry,
    id: NodeId,
}

impl<'r> Node<'r> {
    /// Adopt an acquired reference.
    #[must_use]
    pub fn adopt(registry: &'r dyn Registry, id: NodeId) -> Self {
        Self { registry, id }
    }

    /// Find a media node by BSD name.
    pub fn by_name(registry: &'r dyn Registry, bsd_name: &str) -> Result<Option<Self>> {
        Ok(registry
            .find_by_name(bsd_name)?
            .map(|id| Self::adopt(registry, id)))
    }

    /// Find a node by plane path.
    pub fn by_path(registry: &'r dyn Registry, plane: Plane, path: &str) -> Result<Option<Self>> {
        Ok(registry
            .find_by_path(plane, path)?
            .map(|id| Self::adopt(registry, id)))
    }

    /// Enumerate nodes of a class.
    pub fn matching(registry: &'r dyn Registry, class: &str) -> Result<Nodes<'r>> {
        Ok(Nodes {
            registry,
            inner: registry.matching(class)?,
        })
    }

    /// Registry identity of this node.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Whether both handles name the same entry.
    #[must_use]
    pub fn same_entry(&self, other: &Node<'_>) -> bool {
        self.id == other.id
    }

    /// Read a raw property.
    pub fn property(&self, key: &str) -> Result<Option<PropertyValue>> {
        self.registry.property(self.id, key)
    }

    /// Read a string property; other types read as absent.
    pub fn string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .property(key)?
            .and_then(|value| value.as_str().map(str::to_owned)))
    }

    /// Read an integer property; other types read as absent.
    pub fn number(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.property(key)?.and_then(|value| value.as_i64()))
    }

    /// Read a boolean property; other types read as absent.
    pub fn flag(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.property(key)?.and_then(|value| value.as_bool()))
    }

    /// Read an array-of-strings property, skipping non-string members.
    pub fn strings(&self, key: &str) -> Result<Option<Vec<String>>> {
        Ok(self.property(key)?.and_then(|value| {
            value.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_owned))
                    .collect()
            })
        }))
    }

    /// BSD name of this node, if it publishes one.
    pub fn bsd_name(&self) -> Result<Option<String>> {
        self.string(KEY_BSD_NAME)
    }

    /// Search this node, then its service-plane ancestors, for a property.
    pub fn search_property(&self, key: &str) -> Result<Option<PropertyValue>> {
        if let Some(value) = self.property(key)? {
            return Ok(Some(value));
        }
        let mut cursor = self.parent(Plane::Service)?;
        while let Some(node) = cursor {
            if let Some(value) = node.property(key)? {
                return Ok(Some(value));
            }
            cursor = node.parent(Plane::Service)?;
        }
        Ok(None)
    }

    /// Class conformance test.
    pub fn conforms_to(&self, class: &str) -> Result<bool> {
        self.registry.conforms_to(self.id, class)
    }

    /// Registry name.
    pub fn name(&self) -> Result<String> {
        self.registry.name(self.id)
    }

    /// First parent in a plane.
    pub fn parent(&self, plane: Plane) -> Result<Option<Node<'r>>> {
        Ok(self
            .registry
            .parent(self.id, plane)?
            .map(|id| Node::adopt(self.registry, id)))
    }

    /// Every parent in a plane.
    pub fn parents(&self, plane: Plane) -> Result<Nodes<'r>> {
        Ok(Nodes {
            registry: self.registry,
            inner: self.registry.parents(self.id, plane)?,
        })
    }

    /// Direct children in a plane.
    pub fn children(&self, plane: Plane) -> Result<Nodes<'r>> {
        Ok(Nodes {
            registry: self.registry,
            inner: self.registry.children(self.id, plane)?,
        })
    }

    /// Every descendant in a plane, depth first, one open node per level.
    pub fn descendants(&self, plane: Plane) -> Result<Descendants<'r>> {
        Ok(Descendants {
            plane,
            stack: vec![self.children(plane)?],
        })
    }

    /// Registry this node belongs to.
    #[must_use]
    pub fn registry(&self) -> &'r dyn Registry {
        self.registry
    }
}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Drop for Node<'_> {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// Iterator adapting [`NodeIter`] into scoped handles.
pub struct Nodes<'r> {
    registry: &'r dyn Registry,
    inner: NodeIter<'r>,
}

impl<'r> Iterator for Nodes<'r> {
    type Item = Result<Node<'r>>;

    fn next(&mut self) -> Option<Self::Item> {
        let registry = self.registry;
        self.inner
            .next()
            .map(|item| item.map(|id| Node::adopt(registry, id)))
    }
}

/// Depth-first walk over every descendant of a node.
pub struct Descendants<'r> {
    plane: Plane,
    stack: Vec<Nodes<'r>>,
}

impl<'r> Iterator for Descendants<'r> {
    type Item = Result<Node<'r>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let level = self.stack.last_mut()?;
            match level.next() {
                None => {
                    self.stack.pop();
                }
                Some(Err(err)) => return Some(Err(err)),
                Some(Ok(node)) => {
                    match node.children(self.plane) {
                        Ok(children) => self.stack.push(children),
                        Err(err) => return Some(Err(err)),
                    }
                    return Some(Ok(node));
                }
            }
        }
    }
}

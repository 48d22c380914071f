// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: In-memory device registry with reference and property-read accounting.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::warn;
use serde::Deserialize;

use super::{
    NodeId, NodeIter, Plane, PropertyValue, Registry, CLASS_MEDIA, KEY_BSD_NAME, KEY_CONTENT,
    KEY_PARTITION_ID, KEY_WHOLE,
};
use crate::error::{BlessError, Result};

/// Declarative description of one registry entry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    /// Unique label used to reference the node from other specs.
    pub label: String,
    /// Class first, then every superclass the node conforms to.
    pub classes: Vec<String>,
    /// Registry name; defaults to the label.
    #[serde(default)]
    pub name: Option<String>,
    /// Properties published by the node.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// Service-plane parents, first parent first.
    #[serde(default)]
    pub parents: Vec<String>,
    /// Path in the device-tree plane.
    #[serde(default)]
    pub device_path: Option<String>,
    /// Path in the service plane.
    #[serde(default)]
    pub service_path: Option<String>,
    /// Device-tree parent.
    #[serde(default)]
    pub tree_parent: Option<String>,
}

impl NodeSpec {
    /// Entry with a label and its own class.
    #[must_use]
    pub fn new(label: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            classes: vec![class.into()],
            ..Self::default()
        }
    }

    /// Media entry labelled and named by its BSD name.
    #[must_use]
    pub fn media(bsd_name: &str) -> Self {
        Self::new(bsd_name, CLASS_MEDIA).property(KEY_BSD_NAME, bsd_name)
    }

    /// Media entry of a more specific class that also conforms to media.
    #[must_use]
    pub fn media_of(bsd_name: &str, class: &str) -> Self {
        Self::new(bsd_name, class)
            .conforms(CLASS_MEDIA)
            .property(KEY_BSD_NAME, bsd_name)
    }

    /// Add a superclass.
    #[must_use]
    pub fn conforms(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    /// Set a property.
    #[must_use]
    pub fn property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_owned(), value.into());
        self
    }

    /// Set the content tag.
    #[must_use]
    pub fn content(self, tag: &str) -> Self {
        self.property(KEY_CONTENT, tag)
    }

    /// Set the partition index.
    #[must_use]
    pub fn partition(self, index: i64) -> Self {
        self.property(KEY_PARTITION_ID, index)
            .property(KEY_WHOLE, false)
    }

    /// Mark as whole media.
    #[must_use]
    pub fn whole(self) -> Self {
        self.property(KEY_WHOLE, true)
    }

    /// Add a service-plane parent.
    #[must_use]
    pub fn parent(mut self, label: impl Into<String>) -> Self {
        self.parents.push(label.into());
        self
    }

    /// Place the node in the device tree.
    #[must_use]
    pub fn device_path(mut self, path: impl Into<String>) -> Self {
        self.device_path = Some(path.into());
        self
    }

    /// Give the node a service-plane path.
    #[must_use]
    pub fn service_path(mut self, path: impl Into<String>) -> Self {
        self.service_path = Some(path.into());
        self
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(values: Vec<T>) -> Self {
        PropertyValue::Array(values.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Default)]
struct Accounting {
    open: HashMap<NodeId, usize>,
    open_total: usize,
    peak_open: usize,
    acquisitions: usize,
    stray_releases: usize,
    reads: HashMap<(NodeId, String), usize>,
}

/// Registry backed by a list of [`NodeSpec`]s.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    nodes: Vec<NodeSpec>,
    labels: HashMap<String, NodeId>,
    failing_parents: BTreeSet<NodeId>,
    accounting: RefCell<Accounting>,
}

impl MemoryRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from specs, rejecting duplicate or dangling labels.
    pub fn from_specs(specs: impl IntoIterator<Item = NodeSpec>) -> Result<Self> {
        let mut registry = Self::new();
        for spec in specs {
            registry.insert(spec)?;
        }
        registry.validate()?;
        Ok(registry)
    }

    /// Parse a JSON array of node specs.
    pub fn from_json(text: &str) -> Result<Self> {
        let specs: Vec<NodeSpec> = serde_json::from_str(text)
            .map_err(|err| BlessError::InvalidArgument(format!("registry snapshot: {err}")))?;
        Self::from_specs(specs)
    }

    /// Add a node.
    pub fn insert(&mut self, spec: NodeSpec) -> Result<NodeId> {
        if self.labels.contains_key(&spec.label) {
            return Err(BlessError::InvalidArgument(format!(
                "duplicate registry label {}",
                spec.label
            )));
        }
        if spec.classes.is_empty() {
            return Err(BlessError::InvalidArgument(format!(
                "registry node {} has no class",
                spec.label
            )));
        }
        let id = NodeId::from_raw(self.nodes.len() as u64 + 1);
        self.labels.insert(spec.label.clone(), id);
        self.nodes.push(spec);
        Ok(id)
    }

    /// Add a node, replacing any node already carrying its label.
    pub fn add(&mut self, spec: NodeSpec) -> NodeId {
        if let Some(id) = self.labels.get(&spec.label).copied() {
            let index = id.into_raw() as usize - 1;
            self.nodes[index] = spec;
            return id;
        }
        let id = NodeId::from_raw(self.nodes.len() as u64 + 1);
        self.labels.insert(spec.label.clone(), id);
        self.nodes.push(spec);
        id
    }

    /// Check that every referenced label exists.
    pub fn validate(&self) -> Result<()> {
        for spec in &self.nodes {
            let referenced = spec.parents.iter().chain(spec.tree_parent.iter());
            for label in referenced {
                if !self.labels.contains_key(label) {
                    return Err(BlessError::InvalidArgument(format!(
                        "registry node {} references unknown parent {label}",
                        spec.label
                    )));
                }
            }
        }
        Ok(())
    }

    /// Make parent lookups on a node fail, simulating a broken registry.
    pub fn fail_parents_of(&mut self, label: &str) {
        if let Some(id) = self.labels.get(label) {
            self.failing_parents.insert(*id);
        }
    }

    /// Identity of a labelled node.
    #[must_use]
    pub fn id_of(&self, label: &str) -> Option<NodeId> {
        self.labels.get(label).copied()
    }

    /// References currently held by callers.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.accounting.borrow().open_total
    }

    /// Highest number of simultaneously held references.
    #[must_use]
    pub fn peak_open_handles(&self) -> usize {
        self.accounting.borrow().peak_open
    }

    /// Total references handed out.
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.accounting.borrow().acquisitions
    }

    /// Releases of references that were not held.
    #[must_use]
    pub fn stray_releases(&self) -> usize {
        self.accounting.borrow().stray_releases
    }

    /// Number of times a property of a labelled node was read.
    #[must_use]
    pub fn reads_of(&self, label: &str, key: &str) -> usize {
        let Some(id) = self.id_of(label) else {
            return 0;
        };
        self.accounting
            .borrow()
            .reads
            .get(&(id, key.to_owned()))
            .copied()
            .unwrap_or(0)
    }

    /// Reset property-read counters.
    pub fn clear_reads(&self) {
        self.accounting.borrow_mut().reads.clear();
    }

    fn spec(&self, id: NodeId) -> Result<&NodeSpec> {
        let index = id.into_raw().checked_sub(1).map(|value| value as usize);
        index
            .and_then(|index| self.nodes.get(index))
            .ok_or_else(|| BlessError::ServiceUnavailable(format!("stale registry handle {id}")))
    }

    fn lookup(&self, label: &str) -> Result<NodeId> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| BlessError::ServiceUnavailable(format!("dangling registry label {label}")))
    }

    fn acquire(&self, id: NodeId) -> NodeId {
        let mut accounting = self.accounting.borrow_mut();
        *accounting.open.entry(id).or_insert(0) += 1;
        accounting.open_total += 1;
        accounting.acquisitions += 1;
        accounting.peak_open = accounting.peak_open.max(accounting.open_total);
        id
    }

    fn lazy(&self, ids: Vec<NodeId>) -> NodeIter<'_> {
        Box::new(ids.into_iter().map(move |id| Ok(self.acquire(id))))
    }

    fn parent_ids(&self, node: NodeId, plane: Plane) -> Result<Vec<NodeId>> {
        if self.failing_parents.contains(&node) {
            return Err(BlessError::ServiceUnavailable(format!(
                "parent lookup failed for {node}"
            )));
        }
        let spec = self.spec(node)?;
        match plane {
            Plane::Service => spec.parents.iter().map(|label| self.lookup(label)).collect(),
            Plane::DeviceTree => spec
                .tree_parent
                .iter()
                .map(|label| self.lookup(label))
                .collect(),
        }
    }
}

impl Registry for MemoryRegistry {
    fn find_by_name(&self, bsd_name: &str) -> Result<Option<NodeId>> {
        let found = self.nodes.iter().position(|spec| {
            spec.properties
                .get(KEY_BSD_NAME)
                .and_then(PropertyValue::as_str)
                == Some(bsd_name)
        });
        Ok(found.map(|index| self.acquire(NodeId::from_raw(index as u64 + 1))))
    }

    fn find_by_path(&self, plane: Plane, path: &str) -> Result<Option<NodeId>> {
        let found = self.nodes.iter().position(|spec| {
            let candidate = match plane {
                Plane::Service => spec.service_path.as_deref(),
                Plane::DeviceTree => spec.device_path.as_deref(),
            };
            candidate == Some(path)
        });
        Ok(found.map(|index| self.acquire(NodeId::from_raw(index as u64 + 1))))
    }

    fn matching(&self, class: &str) -> Result<NodeIter<'_>> {
        let ids = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.classes.iter().any(|c| c == class))
            .map(|(index, _)| NodeId::from_raw(index as u64 + 1))
            .collect();
        Ok(self.lazy(ids))
    }

    fn property(&self, node: NodeId, key: &str) -> Result<Option<PropertyValue>> {
        let value = self.spec(node)?.properties.get(key).cloned();
        *self
            .accounting
            .borrow_mut()
            .reads
            .entry((node, key.to_owned()))
            .or_insert(0) += 1;
        Ok(value)
    }

    fn parent(&self, node: NodeId, plane: Plane) -> Result<Option<NodeId>> {
        Ok(self
            .parent_ids(node, plane)?
            .first()
            .map(|id| self.acquire(*id)))
    }

    fn parents(&self, node: NodeId, plane: Plane) -> Result<NodeIter<'_>> {
        let ids = self.parent_ids(node, plane)?;
        Ok(self.lazy(ids))
    }

    fn children(&self, node: NodeId, plane: Plane) -> Result<NodeIter<'_>> {
        let label = &self.spec(node)?.label;
        let ids = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, spec)| match plane {
                Plane::Service => spec.parents.iter().any(|parent| parent == label),
                Plane::DeviceTree => spec.tree_parent.as_ref() == Some(label),
            })
            .map(|(index, _)| NodeId::from_raw(index as u64 + 1))
            .collect();
        Ok(self.lazy(ids))
    }

    fn conforms_to(&self, node: NodeId, class: &str) -> Result<bool> {
        Ok(self.spec(node)?.classes.iter().any(|c| c == class))
    }

    fn name(&self, node: NodeId) -> Result<String> {
        let spec = self.spec(node)?;
        Ok(spec.name.clone().unwrap_or_else(|| spec.label.clone()))
    }

    fn release(&self, node: NodeId) {
        let mut accounting = self.accounting.borrow_mut();
        match accounting.open.get_mut(&node) {
            Some(count) if *count > 0 => {
                *count -= 1;
                accounting.open_total -= 1;
            }
            _ => {
                warn!("release of unheld registry reference {node}");
                accounting.stray_releases += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Node, CLASS_GPT_SCHEME};

    fn disk() -> MemoryRegistry {
        let mut registry = MemoryRegistry::new();
        registry.add(NodeSpec::media("disk0").whole());
        registry.add(NodeSpec::new("disk0-gpt", CLASS_GPT_SCHEME).parent("disk0"));
        for index in 1..=3 {
            registry.add(
                NodeSpec::media(&format!("disk0s{index}"))
                    .partition(index)
                    .parent("disk0-gpt"),
            );
        }
        registry
    }

    #[test]
    fn scoped_nodes_release_on_drop() {
        let registry = disk();
        {
            let scheme = Node::by_name(&registry, "disk0s2")
                .expect("lookup")
                .expect("present")
                .parent(Plane::Service)
                .expect("parent")
                .expect("scheme");
            let children: Vec<String> = scheme
                .children(Plane::Service)
                .expect("children")
                .map(|child| {
                    child
                        .expect("child")
                        .bsd_name()
                        .expect("name")
                        .unwrap_or_default()
                })
                .collect();
            assert_eq!(children, ["disk0s1", "disk0s2", "disk0s3"]);
            assert_eq!(registry.peak_open_handles(), 2);
        }
        assert_eq!(registry.open_handles(), 0);
        assert_eq!(registry.stray_releases(), 0);
    }

    #[test]
    fn json_specs_reject_dangling_parents() {
        let err = MemoryRegistry::from_json(
            r#"[{"label": "disk1s1", "classes": ["IOMedia"], "parents": ["disk1-apm"]}]"#,
        )
        .expect_err("dangling");
        assert!(matches!(err, BlessError::InvalidArgument(_)));
    }

    #[test]
    fn failing_parents_surface_as_unavailable() {
        let mut registry = disk();
        registry.fail_parents_of("disk0s1");
        let node = Node::by_name(&registry, "disk0s1")
            .expect("lookup")
            .expect("present");
        assert!(matches!(
            node.parent(Plane::Service),
            Err(BlessError::ServiceUnavailable(_))
        ));
    }
}

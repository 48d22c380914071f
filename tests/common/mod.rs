// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shared device graphs and in-memory hosts for bless integration tests.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use bless::config::BlessConfig;
use bless::host::{HostSnapshot, SimulatedMounter, SnapshotHost, VolumeImage, VolumeObject};
use bless::mount::MountEntry;
use bless::registry::memory::{MemoryRegistry, NodeSpec};
use bless::registry::{
    PropertyValue, CLASS_APM_SCHEME, CLASS_CONTAINER, CLASS_CONTAINER_MEDIA,
    CLASS_CONTAINER_SCHEME, CLASS_GPT_SCHEME, CLASS_MBR_SCHEME, CLASS_SNAPSHOT, CLASS_VOLUME,
    KEY_BOOT_DEVICE, KEY_BOOT_DEVICE_PATH, KEY_FIRMWARE_PATH, KEY_INTERCONNECT_LOCATION,
    KEY_INTERCONNECT_TYPE, KEY_PROTOCOL_CHARACTERISTICS, KEY_ROLE, KEY_UUID,
    KEY_VOLUME_GROUP_UUID,
};
use bless::topology::{CONTENT_APM_BOOTER, CONTENT_EFI_SYSTEM, CONTENT_GPT_BOOTER};
use bless::Context;
use tempfile::TempDir;

pub const SYSTEM_UUID: &str = "6D3B1A4F-2C1E-4F0B-9C77-1C2B0E9D4A11";
pub const GROUP_UUID: &str = "0B2C7E11-5A0D-4E8B-8F21-3D4C5B6A7988";
pub const DATA_UUID: &str = "A41F0C3E-77B2-4C19-8E0A-5F6D7C8B9A10";
pub const PREBOOT_UUID: &str = "F2E1D0C9-B8A7-4655-9443-322110FFEEDD";

pub const OF_DISK1: &str = "/pci@f4000000/ata-6@d/disk@0";
pub const CONTENT_UFS: &str = "Apple_UFS";
pub const CONTENT_ZFS: &str = "6A898CC3-1DD2-11B2-99A6-080020736631";
pub const CONTENT_APFS: &str = "7C3457EF-0000-11AA-AA11-00306543ECAC";

pub const DISK0S3_PATH: &str = "/pci0/sata0/disk0s3";
pub const DISK1S2_PATH: &str = "/pci0/ata6/disk1s2";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// GPT disk: ESP at 1, booter at 2, non-native data at 3.
pub fn gpt_disk0() -> Vec<NodeSpec> {
    vec![
        NodeSpec::media("disk0").whole(),
        NodeSpec::new("disk0-gpt", CLASS_GPT_SCHEME).parent("disk0"),
        NodeSpec::media("disk0s1")
            .partition(1)
            .content(CONTENT_EFI_SYSTEM)
            .parent("disk0-gpt"),
        NodeSpec::media("disk0s2")
            .partition(2)
            .content(CONTENT_GPT_BOOTER)
            .parent("disk0-gpt"),
        NodeSpec::media("disk0s3")
            .partition(3)
            .content(CONTENT_ZFS)
            .service_path(DISK0S3_PATH)
            .parent("disk0-gpt"),
    ]
}

/// APM disk: map at 1, non-native data at 2, booter at 3, free space at 4.
pub fn apm_disk1() -> Vec<NodeSpec> {
    vec![
        NodeSpec::media("disk1")
            .whole()
            .property(KEY_FIRMWARE_PATH, OF_DISK1),
        NodeSpec::new("disk1-apm", CLASS_APM_SCHEME).parent("disk1"),
        NodeSpec::media("disk1s1")
            .partition(1)
            .content("Apple_partition_map")
            .parent("disk1-apm"),
        NodeSpec::media("disk1s2")
            .partition(2)
            .content(CONTENT_UFS)
            .property(KEY_FIRMWARE_PATH, format!("{OF_DISK1}:2"))
            .service_path(DISK1S2_PATH)
            .parent("disk1-apm"),
        NodeSpec::media("disk1s3")
            .partition(3)
            .content(CONTENT_APM_BOOTER)
            .property(KEY_FIRMWARE_PATH, format!("{OF_DISK1}:3"))
            .parent("disk1-apm"),
        NodeSpec::media("disk1s4")
            .partition(4)
            .content("Apple_Free")
            .parent("disk1-apm"),
    ]
}

/// MBR disk with one partition.
pub fn mbr_disk2() -> Vec<NodeSpec> {
    vec![
        NodeSpec::media("disk2").whole(),
        NodeSpec::new("disk2-mbr", CLASS_MBR_SCHEME).parent("disk2"),
        NodeSpec::media("disk2s1")
            .partition(1)
            .content("Linux")
            .parent("disk2-mbr"),
    ]
}

fn internal_sata() -> PropertyValue {
    let mut characteristics = BTreeMap::new();
    characteristics.insert(
        KEY_INTERCONNECT_TYPE.to_owned(),
        PropertyValue::from("SATA"),
    );
    characteristics.insert(
        KEY_INTERCONNECT_LOCATION.to_owned(),
        PropertyValue::from("Internal"),
    );
    PropertyValue::Dict(characteristics)
}

fn volume(bsd: &str, roles: &[&str]) -> NodeSpec {
    NodeSpec::media_of(bsd, CLASS_VOLUME)
        .property(KEY_ROLE, roles.to_vec())
        .parent("disk5-container")
}

/// Internal GPT disk4 whose second partition backs container disk5.
pub fn container_disk4() -> Vec<NodeSpec> {
    vec![
        NodeSpec::media("disk4")
            .whole()
            .property(KEY_PROTOCOL_CHARACTERISTICS, internal_sata()),
        NodeSpec::new("disk4-gpt", CLASS_GPT_SCHEME).parent("disk4"),
        NodeSpec::media("disk4s1")
            .partition(1)
            .content(CONTENT_EFI_SYSTEM)
            .parent("disk4-gpt"),
        NodeSpec::media("disk4s2")
            .partition(2)
            .content(CONTENT_APFS)
            .parent("disk4-gpt"),
        NodeSpec::new("disk4s2-scheme", CLASS_CONTAINER_SCHEME).parent("disk4s2"),
        NodeSpec::media_of("disk5", CLASS_CONTAINER_MEDIA)
            .whole()
            .parent("disk4s2-scheme"),
        NodeSpec::new("disk5-container", CLASS_CONTAINER).parent("disk5"),
        volume("disk5s1", &["System"])
            .property(KEY_UUID, SYSTEM_UUID)
            .property(KEY_VOLUME_GROUP_UUID, GROUP_UUID),
        volume("disk5s2", &["PreBoot"]).property(KEY_UUID, PREBOOT_UUID),
        volume("disk5s3", &["Recovery"]),
        volume("disk5s5", &["Data"])
            .property(KEY_UUID, DATA_UUID)
            .property(KEY_VOLUME_GROUP_UUID, GROUP_UUID),
        NodeSpec::media_of("disk5s1s1", CLASS_SNAPSHOT).parent("disk5s1"),
    ]
}

/// Aggregate disk6 booting from disk1s2 and disk0s3.
pub fn aggregate_disk6() -> NodeSpec {
    let record = |path: &str| {
        let mut dict = BTreeMap::new();
        dict.insert(
            KEY_BOOT_DEVICE_PATH.to_owned(),
            PropertyValue::from(format!("IOService:{path}")),
        );
        PropertyValue::Dict(dict)
    };
    NodeSpec::media("disk6").whole().property(
        KEY_BOOT_DEVICE,
        PropertyValue::Array(vec![record(DISK1S2_PATH), record(DISK0S3_PATH)]),
    )
}

/// Preboot environments a fixture device tree can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    Efi,
    NewWorld,
    OldWorld,
    IBoot,
    Bios,
}

pub fn device_tree(firmware: Firmware) -> Vec<NodeSpec> {
    let entry = |label: &str, path: &str| NodeSpec::new(label, "IORegistryEntry").device_path(path);
    let mut specs = vec![entry("dt-root", "/")];
    match firmware {
        Firmware::Efi => specs.push(entry("dt-efi", "/efi")),
        Firmware::NewWorld => {
            specs.push(entry("dt-openprom", "/openprom").property("model", "Open Firmware, 3.1.2"))
        }
        Firmware::OldWorld => {
            specs.push(entry("dt-openprom", "/openprom").property("model", "Open Firmware, 2.4"))
        }
        Firmware::IBoot => specs.push(
            entry("dt-chosen", "/chosen").property("firmware-version", "iBoot-7459.101.2"),
        ),
        Firmware::Bios => {}
    }
    specs
}

pub fn mount(device: &str, mountpoint: &str, fs_type: &str) -> MountEntry {
    MountEntry {
        device: format!("/dev/{device}"),
        mountpoint: PathBuf::from(mountpoint),
        fs_type: fs_type.to_owned(),
    }
}

pub fn folder(name: &str, parent: u64) -> VolumeObject {
    VolumeObject {
        name: name.to_owned(),
        parent,
        directory: true,
        finder_info: None,
    }
}

pub fn file(name: &str, parent: u64) -> VolumeObject {
    VolumeObject {
        name: name.to_owned(),
        parent,
        directory: false,
        finder_info: None,
    }
}

pub fn image(objects: impl IntoIterator<Item = (u64, VolumeObject)>) -> VolumeImage {
    VolumeImage {
        objects: objects.into_iter().collect(),
        ..VolumeImage::default()
    }
}

/// In-memory host with a private scratch directory for mounts.
pub struct Fixture {
    pub host: SnapshotHost,
    pub config: BlessConfig,
    pub scratch: TempDir,
}

impl Fixture {
    pub fn new(specs: impl IntoIterator<Item = NodeSpec>) -> Self {
        Self::build(specs, HostSnapshot::default())
    }

    pub fn build(specs: impl IntoIterator<Item = NodeSpec>, snapshot: HostSnapshot) -> Self {
        init_logging();
        let scratch = TempDir::new().expect("scratch dir");
        let mut host = snapshot.into_host().expect("host");
        host.registry = MemoryRegistry::from_specs(specs).expect("registry");
        let config = BlessConfig {
            scratch_dir: scratch.path().to_path_buf(),
            fallback_scratch_dir: scratch.path().to_path_buf(),
            ..BlessConfig::default()
        };
        Self {
            host,
            config,
            scratch,
        }
    }

    /// Run `f` against a context over this host.
    pub fn with_context<R>(&self, f: impl FnOnce(&Context<'_>, &SimulatedMounter<'_>) -> R) -> R {
        let mounter = self.host.mounter();
        let metadata = self.host.metadata(&self.host.mounts);
        let ctx = Context {
            registry: &self.host.registry,
            mounts: &self.host.mounts,
            runner: &mounter,
            metadata: &metadata,
            variables: &self.host.variables,
            config: &self.config,
        };
        f(&ctx, &mounter)
    }

    pub fn scratch_entries(&self) -> usize {
        fs::read_dir(self.scratch.path())
            .expect("read scratch dir")
            .count()
    }
}

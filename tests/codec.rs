// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate boot string encoding and decoding for every preboot environment.
// Author: Lukas Bower
#![forbid(unsafe_code)]

mod common;

use std::collections::BTreeMap;
use std::path::PathBuf;

use bless::host::HostSnapshot;
use bless::info::{current_boot_mountpoint, current_boot_target, set_boot_target};
use bless::mount::MountTable;
use bless::registry::memory::NodeSpec;
use bless::registry::{CLASS_GPT_SCHEME, KEY_WHOLE};
use bless::topology::CONTENT_GPT_BOOTER;
use bless::{BlessError, BootTarget, NetBootProtocol, PrebootEnv};

use common::{
    apm_disk1, container_disk4, device_tree, folder, gpt_disk0, image, mbr_disk2, mount,
    Firmware, Fixture, OF_DISK1, SYSTEM_UUID,
};

fn specs(parts: impl IntoIterator<Item = Vec<NodeSpec>>) -> Vec<NodeSpec> {
    parts.into_iter().flatten().collect()
}

fn with_variable(specs: Vec<NodeSpec>, name: &str, value: &str) -> Fixture {
    let snapshot = HostSnapshot {
        variables: BTreeMap::from([(name.to_owned(), value.to_owned())]),
        ..HostSnapshot::default()
    };
    Fixture::build(specs, snapshot)
}

fn variable(fixture: &Fixture, name: &str) -> Option<String> {
    fixture.host.variables.values().get(name).cloned()
}

#[test]
fn efi_disk_targets_round_trip() {
    let fixture = Fixture::new(specs([gpt_disk0(), device_tree(Firmware::Efi)]));
    let target = BootTarget::Disk {
        device: "disk0s3".to_owned(),
        path: Some("/EFI/boot/bootx64.efi".to_owned()),
    };
    let report = fixture.with_context(|ctx, _| {
        let written = set_boot_target(ctx, &target).expect("set");
        assert_eq!(written, "/dev/disk0s3,/EFI/boot/bootx64.efi");
        current_boot_target(ctx).expect("current")
    });
    assert_eq!(report.environment, PrebootEnv::Efi);
    assert_eq!(report.target, target);
    assert_eq!(
        variable(&fixture, "efi-boot-device").as_deref(),
        Some("/dev/disk0s3,/EFI/boot/bootx64.efi")
    );
}

#[test]
fn booter_partitions_decode_to_their_data_partition() {
    let fixture = with_variable(
        specs([gpt_disk0(), device_tree(Firmware::Efi)]),
        "efi-boot-device",
        "/dev/disk0s2",
    );
    let report = fixture.with_context(|ctx, _| current_boot_target(ctx).expect("current"));
    assert_eq!(report.target, BootTarget::disk("disk0s3"));
}

fn container_host() -> HostSnapshot {
    HostSnapshot {
        volumes: BTreeMap::from([(
            "disk5s2".to_owned(),
            image([(80, folder(SYSTEM_UUID, 2))]),
        )]),
        ..HostSnapshot::default()
    }
}

#[test]
fn container_system_volumes_boot_through_preboot() {
    let fixture = Fixture::build(
        specs([container_disk4(), device_tree(Firmware::Efi)]),
        container_host(),
    );
    let expected =
        format!("/dev/disk5s2,/{SYSTEM_UUID}/System/Library/CoreServices/boot.efi");
    fixture.with_context(|ctx, _| {
        let written = set_boot_target(ctx, &BootTarget::disk("disk5s1")).expect("set");
        assert_eq!(written, expected);
        assert!(ctx.mounts.mounts().expect("table").is_empty());

        let report = current_boot_target(ctx).expect("current");
        assert_eq!(report.boot_string, expected);
        assert_eq!(report.target, BootTarget::disk("disk5s1"));

        let custom = BootTarget::Disk {
            device: "disk5s1".to_owned(),
            path: Some("/usr/standalone/i386/boot.efi".to_owned()),
        };
        set_boot_target(ctx, &custom).expect("custom loader");
        assert_eq!(current_boot_target(ctx).expect("custom").target, custom);
    });
    assert_eq!(fixture.scratch_entries(), 0);
    assert_eq!(fixture.host.registry.open_handles(), 0);
}

#[test]
fn containers_without_preboot_name_the_volume() {
    let without_preboot: Vec<NodeSpec> = container_disk4()
        .into_iter()
        .filter(|spec| spec.label != "disk5s2")
        .collect();
    let fixture = Fixture::new(specs([without_preboot, device_tree(Firmware::Efi)]));
    fixture.with_context(|ctx, _| {
        assert_eq!(
            set_boot_target(ctx, &BootTarget::disk("disk5s1")).expect("set"),
            "/dev/disk5s1"
        );
    });
    assert_eq!(fixture.scratch_entries(), 0);
}

#[test]
fn data_volumes_are_named_directly() {
    let fixture = Fixture::build(
        specs([container_disk4(), device_tree(Firmware::Efi)]),
        container_host(),
    );
    fixture.with_context(|ctx, mounter| {
        assert_eq!(
            set_boot_target(ctx, &BootTarget::disk("/dev/disk5s5")).expect("set"),
            "/dev/disk5s5"
        );
        assert!(mounter.history().is_empty());
    });
}

#[test]
fn new_world_open_firmware_points_at_booter() {
    let fixture = Fixture::new(specs([apm_disk1(), device_tree(Firmware::NewWorld)]));
    let report = fixture.with_context(|ctx, _| {
        let written = set_boot_target(ctx, &BootTarget::disk("disk1s2")).expect("set");
        assert_eq!(written, format!("{OF_DISK1}:3,\\:tbxi"));
        current_boot_target(ctx).expect("current")
    });
    assert_eq!(report.environment, PrebootEnv::OpenFirmware);
    assert_eq!(report.target, BootTarget::disk("disk1s2"));
    assert_eq!(
        variable(&fixture, "boot-device"),
        Some(format!("{OF_DISK1}:3,\\:tbxi"))
    );
}

#[test]
fn old_world_open_firmware_omits_loader_selector() {
    let fixture = Fixture::new(specs([apm_disk1(), device_tree(Firmware::OldWorld)]));
    fixture.with_context(|ctx, _| {
        assert_eq!(
            set_boot_target(ctx, &BootTarget::disk("disk1s2")).expect("set"),
            format!("{OF_DISK1}:3")
        );
        let err = set_boot_target(
            ctx,
            &BootTarget::Disk {
                device: "disk1s2".to_owned(),
                path: Some("/mach_kernel".to_owned()),
            },
        )
        .expect_err("path");
        assert!(matches!(err, BlessError::InvalidArgument(_)));
    });
}

#[test]
fn open_firmware_legacy_targets_name_the_whole_disk() {
    let fixture = Fixture::new(specs([apm_disk1(), device_tree(Firmware::OldWorld)]));
    let report = fixture.with_context(|ctx, _| {
        let written = set_boot_target(
            ctx,
            &BootTarget::Legacy {
                device: "disk1s2".to_owned(),
            },
        )
        .expect("set");
        assert_eq!(written, OF_DISK1);
        current_boot_target(ctx).expect("current")
    });
    assert_eq!(
        report.target,
        BootTarget::Legacy {
            device: "disk1".to_owned()
        }
    );
}

#[test]
fn iboot_names_volumes_by_uuid() {
    let fixture = Fixture::new(specs([container_disk4(), device_tree(Firmware::IBoot)]));
    fixture.with_context(|ctx, _| {
        let written = set_boot_target(ctx, &BootTarget::disk("disk5s1")).expect("set");
        assert_eq!(written, format!("uuid:{SYSTEM_UUID}"));
        let report = current_boot_target(ctx).expect("current");
        assert_eq!(report.environment, PrebootEnv::IBoot);
        assert_eq!(report.target, BootTarget::disk("disk5s1"));

        let err = set_boot_target(
            ctx,
            &BootTarget::Legacy {
                device: "disk5s1".to_owned(),
            },
        )
        .expect_err("legacy");
        assert!(matches!(err, BlessError::InvalidArgument(_)));
    });
    assert_eq!(
        variable(&fixture, "boot-volume"),
        Some(format!("uuid:{SYSTEM_UUID}"))
    );
}

#[test]
fn bios_strings_take_no_path() {
    let fixture = Fixture::new(specs([mbr_disk2(), device_tree(Firmware::Bios)]));
    fixture.with_context(|ctx, _| {
        assert_eq!(
            set_boot_target(ctx, &BootTarget::disk("disk2s1")).expect("set"),
            "/dev/disk2s1"
        );
        let err = set_boot_target(
            ctx,
            &BootTarget::Disk {
                device: "disk2s1".to_owned(),
                path: Some("/boot/loader".to_owned()),
            },
        )
        .expect_err("path");
        assert!(matches!(err, BlessError::InvalidArgument(_)));

        let legacy = BootTarget::Legacy {
            device: "disk2s1".to_owned(),
        };
        assert_eq!(
            set_boot_target(ctx, &legacy).expect("legacy"),
            "legacy:/dev/disk2"
        );
        assert_eq!(
            current_boot_target(ctx).expect("current").target,
            BootTarget::Legacy {
                device: "disk2".to_owned()
            }
        );
    });
    assert_eq!(
        variable(&fixture, "boot-device").as_deref(),
        Some("legacy:/dev/disk2")
    );
}

#[test]
fn network_targets_round_trip() {
    let fixture = Fixture::new(specs([gpt_disk0(), device_tree(Firmware::Efi)]));
    let target = BootTarget::Network {
        protocol: NetBootProtocol::Bsdp,
        interface: "en0".to_owned(),
        host: "10.0.0.2".to_owned(),
        path: Some("/NetBoot/boot.img".to_owned()),
    };
    fixture.with_context(|ctx, _| {
        assert_eq!(
            set_boot_target(ctx, &target).expect("set"),
            "bsdp://en0@10.0.0.2/NetBoot/boot.img"
        );
        assert_eq!(current_boot_target(ctx).expect("current").target, target);
        let err = current_boot_mountpoint(ctx).expect_err("network");
        assert!(matches!(err, BlessError::InvalidArgument(_)));
    });
}

#[test]
fn unreadable_boot_strings_are_rejected() {
    let fixture = with_variable(
        specs([gpt_disk0(), device_tree(Firmware::Efi)]),
        "efi-boot-device",
        "floppy:0",
    );
    fixture.with_context(|ctx, _| {
        let err = current_boot_target(ctx).expect_err("floppy");
        assert!(matches!(err, BlessError::Uninterpretable(_)));
    });
}

#[test]
fn hosts_without_device_tree_have_no_environment() {
    let fixture = Fixture::new(gpt_disk0());
    fixture.with_context(|ctx, _| {
        let err = set_boot_target(ctx, &BootTarget::disk("disk0s3")).expect_err("no tree");
        assert!(matches!(err, BlessError::UnknownEnvironment));
    });
}

#[test]
fn boot_mountpoint_requires_a_mounted_volume() {
    let snapshot = HostSnapshot {
        mounts: vec![mount("disk0s3", "/Volumes/Zed", "zfs")],
        variables: BTreeMap::from([("efi-boot-device".to_owned(), "/dev/disk0s3".to_owned())]),
        ..HostSnapshot::default()
    };
    let fixture = Fixture::build(specs([gpt_disk0(), device_tree(Firmware::Efi)]), snapshot);
    fixture.with_context(|ctx, _| {
        assert_eq!(
            current_boot_mountpoint(ctx).expect("mounted"),
            PathBuf::from("/Volumes/Zed")
        );
    });

    let fixture = with_variable(
        specs([gpt_disk0(), device_tree(Firmware::Efi)]),
        "efi-boot-device",
        "/dev/disk0s1",
    );
    fixture.with_context(|ctx, _| {
        let err = current_boot_mountpoint(ctx).expect_err("unmounted");
        assert!(matches!(err, BlessError::NotFound(_)));
        assert_eq!(err.exit_code(), 2);
    });

    let fixture = Fixture::new(specs([gpt_disk0(), device_tree(Firmware::Efi)]));
    fixture.with_context(|ctx, _| {
        let err = current_boot_target(ctx).expect_err("unset");
        assert!(matches!(err, BlessError::NotFound(_)));
    });
}

#[test]
fn booter_lookup_failures_are_not_mistaken_for_data_partitions() {
    let disk7 = vec![
        NodeSpec::media("disk7").whole(),
        NodeSpec::new("disk7-gpt", CLASS_GPT_SCHEME).parent("disk7"),
        NodeSpec::media("disk7s2")
            .property(KEY_WHOLE, false)
            .content(CONTENT_GPT_BOOTER)
            .parent("disk7-gpt"),
    ];
    let fixture = with_variable(
        specs([disk7, device_tree(Firmware::Efi)]),
        "efi-boot-device",
        "/dev/disk7s2",
    );
    fixture.with_context(|ctx, _| {
        let err = current_boot_target(ctx).expect_err("unindexed booter");
        assert!(matches!(err, BlessError::TopologyWalkFailed { .. }));
    });
}

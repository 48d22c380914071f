// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate private helper mounts, reuse of existing mounts and teardown on every path.
// Author: Lukas Bower
#![forbid(unsafe_code)]

mod common;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use bless::host::HostSnapshot;
use bless::mount::{mount_for_device, MountOrchestrator, MountTable};
use bless::BlessError;

use common::{container_disk4, mount, Fixture};

const PREBOOT: &str = "/System/Volumes/Preboot";

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_owned()
}

#[test]
fn private_mount_is_created_and_removed() {
    let fixture = Fixture::new(container_disk4());
    let scratch = fs::canonicalize(fixture.scratch.path()).expect("canonical scratch");
    fixture.with_context(|ctx, mounter| {
        let orchestrator = MountOrchestrator::from_context(ctx);
        let record = orchestrator
            .ensure_mounted("/dev/disk5s2", true)
            .expect("mount");
        assert!(record.private);
        assert_eq!(record.device, "disk5s2");
        assert_eq!(record.mountpoint.parent(), Some(scratch.as_path()));
        assert!(file_name(&record.mountpoint).starts_with("bless."));
        assert!(record.mountpoint.is_dir());

        let entry = mount_for_device(ctx.mounts, "disk5s2")
            .expect("table")
            .expect("mounted");
        assert_eq!(entry.mountpoint, record.mountpoint);

        let history = mounter.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].program, PathBuf::from("/sbin/mount"));
        assert!(history[0].args.iter().any(|arg| arg == "-r"));
        assert!(history[0].args.iter().any(|arg| arg == "nobrowse"));

        orchestrator.release(&record);
        assert!(!record.mountpoint.exists());
        assert!(mount_for_device(ctx.mounts, "disk5s2")
            .expect("table")
            .is_none());
        assert_eq!(mounter.history()[1].program, PathBuf::from("/sbin/umount"));
    });
    assert_eq!(fixture.scratch_entries(), 0);
}

#[test]
fn existing_mounts_are_reused_and_left_alone() {
    let snapshot = HostSnapshot {
        mounts: vec![mount("disk5s2", PREBOOT, "apfs")],
        ..HostSnapshot::default()
    };
    let fixture = Fixture::build(container_disk4(), snapshot);
    fixture.with_context(|ctx, mounter| {
        let guard = MountOrchestrator::from_context(ctx)
            .mount("disk5s2", false)
            .expect("mount");
        assert!(!guard.is_private());
        assert_eq!(guard.mountpoint(), Path::new(PREBOOT));
        drop(guard);

        assert!(mount_for_device(ctx.mounts, "disk5s2")
            .expect("table")
            .is_some());
        assert!(mounter.history().is_empty());
    });
}

#[test]
fn refused_mounts_leave_no_scratch_directory() {
    let snapshot = HostSnapshot {
        unmountable: BTreeSet::from(["disk5s2".to_owned()]),
        ..HostSnapshot::default()
    };
    let fixture = Fixture::build(container_disk4(), snapshot);
    fixture.with_context(|ctx, _| {
        let err = MountOrchestrator::from_context(ctx)
            .ensure_mounted("disk5s2", false)
            .expect_err("refused");
        assert!(matches!(err, BlessError::MountFailed { ref device, .. } if device == "disk5s2"));
        assert_eq!(err.exit_code(), 6);
        assert!(ctx.mounts.mounts().expect("table").is_empty());
    });
    assert_eq!(fixture.scratch_entries(), 0);
}

#[test]
fn guards_unmount_when_dropped() {
    let fixture = Fixture::new(container_disk4());
    fixture.with_context(|ctx, _| {
        let orchestrator = MountOrchestrator::from_context(ctx);
        let mountpoint = {
            let guard = orchestrator.mount("disk5s3", false).expect("mount");
            assert!(guard.is_private());
            let record = guard.record().expect("record");
            assert_eq!(
                record.portable_path(&guard.mountpoint().join("Recovery/boot.efi")),
                PathBuf::from("/Recovery/boot.efi")
            );
            guard.mountpoint().to_path_buf()
        };
        assert!(!mountpoint.exists());
        assert!(ctx.mounts.mounts().expect("table").is_empty());
    });
    assert_eq!(fixture.scratch_entries(), 0);
}

#[test]
fn snapshots_mount_read_only_through_snapshot_helper() {
    let fixture = Fixture::new(container_disk4());
    fixture.with_context(|ctx, mounter| {
        let orchestrator = MountOrchestrator::from_context(ctx);
        let guard = orchestrator
            .mount_snapshot("disk5s1", "com.apple.os.update-1A2B")
            .expect("snapshot mount");
        assert!(guard.is_private());
        assert!(file_name(guard.mountpoint()).starts_with("snapshot."));

        let history = mounter.history();
        assert_eq!(history[0].program, PathBuf::from("/sbin/mount_apfs"));
        assert_eq!(history[0].args[..2], ["-s", "com.apple.os.update-1A2B"]);
        assert!(history[0].args.iter().any(|arg| arg == "rdonly"));
        guard.release();
        assert!(ctx.mounts.mounts().expect("table").is_empty());

        let err = orchestrator
            .mount_snapshot("disk5s1", "")
            .expect_err("unnamed snapshot");
        assert!(matches!(err, BlessError::InvalidArgument(_)));
    });
    assert_eq!(fixture.scratch_entries(), 0);
}

#[test]
fn unwritable_scratch_falls_back() {
    let mut fixture = Fixture::new(container_disk4());
    fixture.config.scratch_dir = fixture.scratch.path().join("missing");
    let fallback = fs::canonicalize(fixture.scratch.path()).expect("canonical scratch");
    fixture.with_context(|ctx, _| {
        let guard = MountOrchestrator::from_context(ctx)
            .mount("disk5s2", true)
            .expect("mount");
        assert_eq!(guard.mountpoint().parent(), Some(fallback.as_path()));
    });
    assert_eq!(fixture.scratch_entries(), 0);
}

//! Run-mode lifecycle against the simulated hypervisor.

use std::time::Duration;

use hyfervisor::error::{ConfigError, IdentityError, LifecycleError};
use hyfervisor::settings::VmSettings;
use hyfervisor::vm::platform::{MIB, RecoveryMethod, StartOptions};
use hyfervisor::vm::simulated::{Faults, Operation};
use hyfervisor::vm::{
    Installer, Launch, LifecycleManager, SimulatedHypervisor, Termination, VmBundle, VmState,
};
use tempfile::TempDir;

fn settings() -> VmSettings {
    VmSettings {
        disk_size: 16 * MIB,
        ..VmSettings::default()
    }
}

/// Install a fresh bundle into a temporary directory.
async fn installed_bundle() -> (TempDir, VmBundle) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let image = tmp.path().join("restore.ipsw");
    std::fs::write(&image, b"ipsw").expect("write restore image");
    let bundle = VmBundle::at(tmp.path().join("VM.bundle"));

    Installer::new(SimulatedHypervisor::new(), settings(), bundle.clone())
        .run(&image, |_| {})
        .await
        .expect("install succeeds");
    (tmp, bundle)
}

fn manager(hv: SimulatedHypervisor, bundle: &VmBundle) -> LifecycleManager<SimulatedHypervisor> {
    LifecycleManager::new(hv, settings(), bundle.clone()).with_settle_interval(Duration::ZERO)
}

async fn running(hv: SimulatedHypervisor, bundle: &VmBundle) -> LifecycleManager<SimulatedHypervisor> {
    let mut vm = manager(hv, bundle);
    vm.configure().expect("configure");
    vm.start().await.expect("start");
    vm
}

fn journal_of(vm: &LifecycleManager<SimulatedHypervisor>) -> Vec<Operation> {
    vm.hypervisor().journal().lock().expect("journal").clone()
}

#[tokio::test]
async fn start_leaves_identity_untouched() {
    let (_tmp, bundle) = installed_bundle().await;
    let model = std::fs::read(bundle.hardware_model()).expect("hardware model");
    let id = std::fs::read(bundle.machine_identifier()).expect("machine identifier");

    let vm = running(SimulatedHypervisor::new(), &bundle).await;

    assert_eq!(vm.state(), VmState::Running);
    assert_eq!(std::fs::read(bundle.hardware_model()).expect("hardware model"), model);
    assert_eq!(std::fs::read(bundle.machine_identifier()).expect("machine identifier"), id);
}

#[tokio::test]
async fn missing_machine_identifier_is_fatal() {
    let (_tmp, bundle) = installed_bundle().await;
    std::fs::remove_file(bundle.machine_identifier()).expect("remove identifier");

    let mut vm = manager(SimulatedHypervisor::new(), &bundle);
    let err = vm.configure().unwrap_err();

    assert!(
        matches!(err, LifecycleError::Identity(IdentityError::Missing { .. })),
        "{err}"
    );
    assert!(err.to_string().contains("hyfervisor install"));
    assert!(vm.machine().is_none());
    assert_eq!(vm.state(), VmState::Unconfigured);
}

#[tokio::test]
async fn corrupt_hardware_model_is_fatal() {
    let (_tmp, bundle) = installed_bundle().await;
    std::fs::write(bundle.hardware_model(), b"garbage").expect("corrupt model");

    let mut vm = manager(SimulatedHypervisor::new(), &bundle);
    let err = vm.configure().unwrap_err();

    assert!(
        matches!(err, LifecycleError::Identity(IdentityError::Corrupt { .. })),
        "{err}"
    );
    assert!(vm.machine().is_none());
}

#[tokio::test]
async fn missing_auxiliary_storage_is_fatal() {
    let (_tmp, bundle) = installed_bundle().await;
    std::fs::remove_file(bundle.auxiliary_storage()).expect("remove aux storage");

    let mut vm = manager(SimulatedHypervisor::new(), &bundle);
    let err = vm.configure().unwrap_err();

    assert!(
        matches!(err, LifecycleError::Config(ConfigError::MissingAuxiliaryStorage(_))),
        "{err}"
    );
}

#[tokio::test]
async fn save_then_restore_consumes_snapshot() {
    let (_tmp, bundle) = installed_bundle().await;

    let mut vm = running(SimulatedHypervisor::new(), &bundle).await;
    vm.pause_and_save().await.expect("save");
    assert!(bundle.has_save_file());
    assert_eq!(vm.state(), VmState::Stopped);
    assert!(!bundle.root().join("SaveFile.partial").exists());
    drop(vm);

    let mut vm = manager(SimulatedHypervisor::new(), &bundle);
    vm.configure().expect("configure");
    let launch = vm.restore_or_start().await.expect("restore");

    assert_eq!(launch, Launch::Restored);
    assert_eq!(vm.state(), VmState::Running);
    assert!(!bundle.has_save_file());
    assert_eq!(journal_of(&vm), vec![Operation::Restore, Operation::Resume]);
}

#[tokio::test]
async fn failed_restore_deletes_snapshot_and_cold_starts() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = running(SimulatedHypervisor::new(), &bundle).await;
    vm.pause_and_save().await.expect("save");
    drop(vm);

    let hv = SimulatedHypervisor::new().with_faults(Faults {
        restore: true,
        ..Faults::default()
    });
    let mut vm = manager(hv, &bundle);
    vm.configure().expect("configure");
    let launch = vm.restore_or_start().await.expect("cold start");

    assert_eq!(launch, Launch::ColdStartAfterFailedRestore);
    assert_eq!(vm.state(), VmState::Running);
    assert!(!bundle.has_save_file());
    assert_eq!(
        journal_of(&vm),
        vec![Operation::Restore, Operation::Start(StartOptions::default())]
    );
}

#[tokio::test]
async fn no_snapshot_means_cold_start() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = manager(SimulatedHypervisor::new(), &bundle);
    vm.configure().expect("configure");

    assert_eq!(vm.restore_or_start().await.expect("start"), Launch::ColdStart);
    assert_eq!(journal_of(&vm), vec![Operation::Start(StartOptions::default())]);
}

#[tokio::test]
async fn failed_save_leaves_no_snapshot_and_resumes() {
    let (_tmp, bundle) = installed_bundle().await;
    let hv = SimulatedHypervisor::new().with_faults(Faults {
        save: true,
        ..Faults::default()
    });
    let mut vm = running(hv, &bundle).await;

    let err = vm.pause_and_save().await.unwrap_err();

    assert!(matches!(err, LifecycleError::Save(_)), "{err}");
    assert!(!bundle.has_save_file());
    assert!(!bundle.root().join("SaveFile.partial").exists());
    assert_eq!(vm.state(), VmState::Running);
}

#[tokio::test]
async fn save_requires_capability() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut hv = SimulatedHypervisor::new();
    hv.capabilities_mut().save_restore = false;
    let mut vm = running(hv, &bundle).await;

    let err = vm.pause_and_save().await.unwrap_err();
    assert!(matches!(err, LifecycleError::SaveRestoreUnsupported), "{err}");
    assert_eq!(vm.terminate().await, Termination::Immediate);
    assert_eq!(vm.state(), VmState::Running);
}

#[tokio::test]
async fn terminate_saves_running_machine() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = running(SimulatedHypervisor::new(), &bundle).await;

    assert_eq!(vm.terminate().await, Termination::Saved);
    assert!(bundle.has_save_file());
}

#[tokio::test]
async fn terminate_when_stopped_is_immediate() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = manager(SimulatedHypervisor::new(), &bundle);
    vm.configure().expect("configure");

    assert_eq!(vm.terminate().await, Termination::Immediate);
    assert!(!bundle.has_save_file());
}

#[tokio::test]
async fn restart_while_stopped_is_a_no_op() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = manager(SimulatedHypervisor::new(), &bundle);
    vm.configure().expect("configure");

    assert!(!vm.restart(false).await.expect("restart"));
    assert!(!vm.restart(true).await.expect("restart"));
    assert_eq!(vm.state(), VmState::Stopped);
    assert!(journal_of(&vm).is_empty());
}

#[tokio::test]
async fn restart_stops_then_starts() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = running(SimulatedHypervisor::new(), &bundle).await;

    assert!(vm.restart(false).await.expect("restart"));
    assert_eq!(vm.state(), VmState::Running);
    assert_eq!(
        journal_of(&vm),
        vec![
            Operation::Start(StartOptions::default()),
            Operation::Stop,
            Operation::Start(StartOptions::default()),
        ]
    );
}

#[tokio::test]
async fn recovery_restart_uses_start_options() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = running(SimulatedHypervisor::new(), &bundle).await;

    assert!(vm.restart(true).await.expect("restart"));
    assert_eq!(
        journal_of(&vm).last(),
        Some(&Operation::Start(StartOptions::recovery(RecoveryMethod::StartOptions)))
    );
}

#[tokio::test]
async fn recovery_falls_back_to_legacy_then_normal_boot() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut hv = SimulatedHypervisor::new().with_faults(Faults {
        recovery_start_options: true,
        legacy_recovery: true,
        ..Faults::default()
    });
    hv.capabilities_mut().legacy_recovery_boot = true;
    let mut vm = running(hv, &bundle).await;

    assert!(vm.restart(true).await.expect("restart"));
    assert_eq!(vm.state(), VmState::Running);
    assert_eq!(
        journal_of(&vm),
        vec![
            Operation::Start(StartOptions::default()),
            Operation::Stop,
            Operation::Start(StartOptions::recovery(RecoveryMethod::StartOptions)),
            Operation::Start(StartOptions::recovery(RecoveryMethod::Legacy)),
            Operation::Start(StartOptions::default()),
        ]
    );
}

#[tokio::test]
async fn recovery_without_capability_boots_normally() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut hv = SimulatedHypervisor::new();
    hv.capabilities_mut().recovery_start_options = false;
    hv.capabilities_mut().legacy_recovery_boot = false;
    let mut vm = manager(hv, &bundle);
    vm.configure().expect("configure");

    vm.start_recovery().await.expect("start");
    assert_eq!(journal_of(&vm), vec![Operation::Start(StartOptions::default())]);
}

#[tokio::test]
async fn operations_reject_wrong_state() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = manager(SimulatedHypervisor::new(), &bundle);

    let err = vm.start().await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { actual: VmState::Unconfigured, .. }));

    vm.configure().expect("configure");
    let err = vm.pause_and_save().await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { actual: VmState::Stopped, .. }));

    vm.start().await.expect("start");
    let err = vm.start().await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { actual: VmState::Running, .. }));
    let err = vm.configure().unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }));
}

#[tokio::test]
async fn start_failure_leaves_machine_stopped() {
    let (_tmp, bundle) = installed_bundle().await;
    let hv = SimulatedHypervisor::new().with_faults(Faults {
        start: true,
        ..Faults::default()
    });
    let mut vm = manager(hv, &bundle);
    vm.configure().expect("configure");

    let err = vm.start().await.unwrap_err();
    assert!(matches!(err, LifecycleError::Start(_)), "{err}");
    assert_eq!(vm.state(), VmState::Stopped);
}

#[tokio::test]
async fn poll_detects_guest_shutdown() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = running(SimulatedHypervisor::new(), &bundle).await;

    assert_eq!(vm.poll_guest().await, VmState::Running);
    vm.machine_mut().expect("machine").guest_shutdown();
    assert_eq!(vm.poll_guest().await, VmState::Stopped);
}

#[tokio::test]
async fn custom_boot_loader_blocks_save_restore_configuration() {
    let (tmp, bundle) = installed_bundle().await;
    let loader = tmp.path().join("loader.bin");
    std::fs::write(&loader, vec![0u8; 4096]).expect("write boot loader");
    let settings = VmSettings {
        boot_loader_path: loader.display().to_string(),
        ..settings()
    };

    let mut vm = LifecycleManager::new(SimulatedHypervisor::new(), settings, bundle.clone());
    let err = vm.configure().unwrap_err();

    assert!(matches!(err, LifecycleError::Config(ConfigError::SaveRestore(_))), "{err}");
}

#[tokio::test]
async fn save_replaces_existing_snapshot() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = running(SimulatedHypervisor::new(), &bundle).await;
    std::fs::write(bundle.save_file(), b"stale snapshot").expect("seed snapshot");

    vm.pause_and_save().await.expect("save");

    let saved = std::fs::read(bundle.save_file()).expect("snapshot");
    assert_ne!(saved, b"stale snapshot");
    let id = std::fs::read(bundle.machine_identifier()).expect("machine identifier");
    assert!(saved.ends_with(&id));
    assert!(!bundle.root().join("SaveFile.partial").exists());
}

#[tokio::test]
async fn recovery_boot_discards_snapshot() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = running(SimulatedHypervisor::new(), &bundle).await;
    vm.pause_and_save().await.expect("save");
    assert!(bundle.has_save_file());

    vm.start_recovery().await.expect("recovery boot");
    assert_eq!(vm.state(), VmState::Running);
    assert!(!bundle.has_save_file());
    drop(vm);

    let mut vm = manager(SimulatedHypervisor::new(), &bundle);
    vm.configure().expect("configure");
    assert_eq!(vm.restore_or_start().await.expect("start"), Launch::ColdStart);
}

#[tokio::test]
async fn snapshot_is_discarded_without_save_restore() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = running(SimulatedHypervisor::new(), &bundle).await;
    vm.pause_and_save().await.expect("save");
    drop(vm);

    let mut hv = SimulatedHypervisor::new();
    hv.capabilities_mut().save_restore = false;
    let mut vm = manager(hv, &bundle);
    vm.configure().expect("configure");

    assert_eq!(vm.restore_or_start().await.expect("start"), Launch::ColdStart);
    assert!(!bundle.has_save_file());
    assert_eq!(journal_of(&vm), vec![Operation::Start(StartOptions::default())]);
}

#[tokio::test]
async fn rejected_start_keeps_snapshot() {
    let (_tmp, bundle) = installed_bundle().await;
    let mut vm = running(SimulatedHypervisor::new(), &bundle).await;
    std::fs::write(bundle.save_file(), b"snapshot").expect("seed snapshot");

    let err = vm.start().await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }));
    assert!(bundle.has_save_file());
}

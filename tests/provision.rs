use std::path::{Path, PathBuf};

use eos_vbox_importer::backend::memory::{MemoryHypervisor, Operation};
use eos_vbox_importer::constants::{
    ClipboardMode, DeviceType, PointingHidType, StorageBus, StorageControllerType,
    UsbControllerType,
};
use eos_vbox_importer::error::ImporterError;
use eos_vbox_importer::logging::{LogBuffer, LogConfig, LogSink};
use eos_vbox_importer::profile::gib_to_bytes;
use eos_vbox_importer::provision::{
    ProvisionOutcome, ProvisionRequest, ProvisionSummary, Provisioner,
};

const EXT_PACK: &str = "Oracle VM VirtualBox Extension Pack";

fn write_image(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, b"<<< Oracle VM VirtualBox Disk Image >>>").unwrap();
    path
}

fn request(image: &Path) -> ProvisionRequest {
    ProvisionRequest::new(Some(image.to_path_buf()), None)
}

fn captured() -> (LogConfig, LogBuffer) {
    let buffer = LogBuffer::new();
    let config = LogConfig::default().with_sink(LogSink::Buffer(buffer.clone()));
    (config, buffer)
}

fn provisioned(outcome: ProvisionOutcome) -> ProvisionSummary {
    match outcome {
        ProvisionOutcome::Provisioned(summary) => summary,
        ProvisionOutcome::InvalidImage => panic!("image was rejected"),
    }
}

#[tokio::test]
async fn fresh_import_applies_full_profile() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new()
        .with_medium(&image, gib_to_bytes(20))
        .with_extension_pack(EXT_PACK);
    let (log, _) = captured();

    let provisioner = Provisioner::new(&api, request(&image), log);
    let summary = provisioned(provisioner.run(true).await.unwrap());
    assert!(!summary.replaced);
    assert!(summary.usb3_enabled);
    assert_eq!(summary.machine.name, "Hack OS");

    let registered = api.machine("Hack OS").expect("machine registered");
    let machine = &registered.machine;
    assert_eq!(machine.os_type, "Linux_64");
    assert_eq!(machine.memory_mb, 3072);
    assert_eq!(machine.graphics.vram_mb, 128);
    assert!(machine.graphics.accelerate_3d);
    assert!(machine.graphics.accelerate_2d_video);
    assert!(machine.audio.enabled && machine.audio.enabled_in && machine.audio.enabled_out);
    assert!(machine.bios.ioapic_enabled);
    assert_eq!(machine.clipboard_mode, ClipboardMode::Bidirectional);
    assert_eq!(machine.pointing_hid, PointingHidType::UsbTablet);
    assert!(machine.rtc_use_utc);

    let sata = machine.storage_controller("SATA Controller").unwrap();
    assert_eq!(sata.bus, StorageBus::Sata);
    assert_eq!(sata.controller_type, StorageControllerType::IntelAhci);

    let usb = machine.usb_controllers();
    assert_eq!(usb.len(), 1);
    assert_eq!(usb[0].name, "USB Controller");
    assert_eq!(usb[0].controller_type, UsbControllerType::Xhci);

    assert_eq!(registered.attachments.len(), 1);
    let attachment = &registered.attachments[0];
    assert_eq!(attachment.controller, "SATA Controller");
    assert_eq!((attachment.port, attachment.device), (0, 0));
    assert_eq!(attachment.device_type, DeviceType::HardDisk);
    assert_eq!(attachment.medium.location, image);
    assert_eq!(attachment.medium.logical_size, 64_424_509_440);

    assert_eq!(api.active_sessions(), 0);
    assert_eq!(api.unlock_count(), 1);
}

#[tokio::test]
async fn operations_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new()
        .with_medium(&image, gib_to_bytes(20))
        .with_extension_pack(EXT_PACK);
    let (log, _) = captured();

    Provisioner::new(&api, request(&image), log)
        .run(true)
        .await
        .unwrap();

    assert_eq!(
        api.calls(),
        vec![
            Operation::FindMachine,
            Operation::CreateMachine,
            Operation::OpenMedium,
            Operation::ResizeMedium,
            Operation::ListExtensionPacks,
            Operation::RegisterMachine,
            Operation::LockMachine,
            Operation::AttachDevice,
            Operation::SaveSettings,
            Operation::UnlockMachine,
        ]
    );
}

#[tokio::test]
async fn twenty_gib_image_grows_to_sixty() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, 21_474_836_480);
    let (log, _) = captured();

    let summary = provisioned(
        Provisioner::new(&api, request(&image), log)
            .run(true)
            .await
            .unwrap(),
    );

    assert_eq!(summary.medium.logical_size, 64_424_509_440);
    assert_eq!(api.medium(&image).unwrap().logical_size, 64_424_509_440);
}

#[tokio::test]
async fn full_size_image_is_not_resized() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(60));
    let (log, _) = captured();

    Provisioner::new(&api, request(&image), log)
        .run(true)
        .await
        .unwrap();

    assert!(!api.calls().contains(&Operation::ResizeMedium));
}

#[tokio::test]
async fn larger_image_is_left_alone_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(100));
    let (log, buffer) = captured();

    let summary = provisioned(
        Provisioner::new(&api, request(&image), log)
            .run(true)
            .await
            .unwrap(),
    );

    assert_eq!(summary.medium.logical_size, gib_to_bytes(100));
    assert!(!api.calls().contains(&Operation::ResizeMedium));
    let out = buffer.contents();
    assert!(out.contains("WARN"));
    assert!(out.contains("larger than the profile disk size"));
}

#[tokio::test]
async fn invalid_images_touch_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let wrong_ext = write_image(&dir, "hack.img");
    let as_dir = dir.path().join("folder.vdi");
    std::fs::create_dir(&as_dir).unwrap();

    let candidates = [
        Some(dir.path().join("missing.vdi")),
        Some(wrong_ext),
        Some(as_dir),
        None,
    ];

    for image_path in candidates {
        let api = MemoryHypervisor::new();
        let (log, buffer) = captured();
        let req = ProvisionRequest::new(image_path.clone(), None);

        let outcome = Provisioner::new(&api, req, log).run(true).await.unwrap();
        assert_eq!(outcome, ProvisionOutcome::InvalidImage, "{image_path:?}");
        assert!(api.calls().is_empty(), "{image_path:?}");

        let out = buffer.contents();
        assert!(out.contains("INFO"), "{out}");
        assert!(out.contains("invalid or does not exist."), "{out}");
    }
}

#[tokio::test]
async fn missing_image_is_logged_with_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("gone.vdi");
    let api = MemoryHypervisor::new();
    let (log, buffer) = captured();

    Provisioner::new(&api, request(&missing), log)
        .run(true)
        .await
        .unwrap();

    let expected = format!("Image file at '{}' invalid or does not exist.", missing.display());
    assert!(buffer.contents().contains(&expected));
}

#[tokio::test]
async fn uppercase_extension_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "HACK.VDI");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    let (log, _) = captured();

    let outcome = Provisioner::new(&api, request(&image), log)
        .run(true)
        .await
        .unwrap();
    assert!(matches!(outcome, ProvisionOutcome::Provisioned(_)));
}

#[tokio::test]
async fn second_run_replaces_machine() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new()
        .with_medium(&image, gib_to_bytes(20))
        .with_extension_pack(EXT_PACK);
    let (log, buffer) = captured();

    let provisioner = Provisioner::new(&api, request(&image), log);
    let first = provisioned(provisioner.run(true).await.unwrap());
    let second = provisioned(provisioner.run(true).await.unwrap());

    assert!(!first.replaced);
    assert!(second.replaced);
    assert_ne!(first.machine.id, second.machine.id);
    assert_eq!(api.machine_count(), 1);

    // The source image survives teardown and is attached again.
    assert!(api.deleted_media().is_empty());
    assert!(api.medium(&image).is_some());
    let registered = api.machine("Hack OS").unwrap();
    assert_eq!(registered.machine.id, second.machine.id);
    assert_eq!(registered.attachments.len(), 1);
    assert_eq!(registered.attachments[0].medium.location, image);

    let out = buffer.contents();
    assert!(out.contains(&format!(
        "Machine '{}' with name 'Hack OS' already exists.",
        first.machine.id
    )));
    assert!(out.contains("Removing existing machine with name 'Hack OS'"));
    assert_eq!(out.matches("Creating new machine with name 'Hack OS'").count(), 2);
}

#[tokio::test]
async fn replacing_with_new_image_deletes_old_disk() {
    let dir = tempfile::tempdir().unwrap();
    let old = write_image(&dir, "old.vdi");
    let new = write_image(&dir, "new.vdi");
    let api = MemoryHypervisor::new()
        .with_medium(&old, gib_to_bytes(20))
        .with_medium(&new, gib_to_bytes(20));

    let (log, _) = captured();
    Provisioner::new(&api, request(&old), log.clone())
        .run(true)
        .await
        .unwrap();
    Provisioner::new(&api, request(&new), log)
        .run(true)
        .await
        .unwrap();

    assert_eq!(api.machine_count(), 1);
    assert_eq!(api.deleted_media(), vec![old.clone()]);
    assert!(api.medium(&old).is_none());
    let registered = api.machine("Hack OS").unwrap();
    assert_eq!(registered.attachments[0].medium.location, new);
}

#[tokio::test]
async fn existing_machine_without_destroy_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    let (log, _) = captured();

    let provisioner = Provisioner::new(&api, request(&image), log);
    provisioner.run(true).await.unwrap();
    let mutating_before = api.mutating_calls().len();

    let err = provisioner.run(false).await.unwrap_err();
    assert!(matches!(err, ImporterError::MachineExists { ref name } if name == "Hack OS"));
    assert_eq!(api.mutating_calls().len(), mutating_before);
    assert_eq!(api.machine_count(), 1);
}

#[tokio::test]
async fn custom_machine_name() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    let (log, _) = captured();

    let req = ProvisionRequest::new(Some(image.clone()), Some("Endless Dev".into()));
    Provisioner::new(&api, req, log).run(true).await.unwrap();

    assert!(api.machine("Endless Dev").is_some());
    assert!(api.machine("Hack OS").is_none());
}

#[tokio::test]
async fn usb3_needs_extension_pack() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    let (log, buffer) = captured();

    let summary = provisioned(
        Provisioner::new(&api, request(&image), log)
            .run(true)
            .await
            .unwrap(),
    );

    assert!(!summary.usb3_enabled);
    let registered = api.machine("Hack OS").unwrap();
    assert!(registered.machine.usb_controllers().is_empty());
    // The rest of the import still completes.
    assert_eq!(registered.attachments.len(), 1);

    let out = buffer.contents();
    assert!(out.contains("WARN"));
    assert!(out.contains(
        "USB 3.0 support not enabled. Install extension pack 'Oracle VM VirtualBox Extension Pack'"
    ));
}

#[tokio::test]
async fn other_extension_packs_do_not_enable_usb3() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new()
        .with_medium(&image, gib_to_bytes(20))
        .with_extension_pack("VNC");
    let (log, _) = captured();

    let summary = provisioned(
        Provisioner::new(&api, request(&image), log)
            .run(true)
            .await
            .unwrap(),
    );
    assert!(!summary.usb3_enabled);
}

#[tokio::test]
async fn extension_pack_query_failure_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    api.fail_on(Operation::ListExtensionPacks);
    let (log, _) = captured();

    let err = Provisioner::new(&api, request(&image), log)
        .run(true)
        .await
        .unwrap_err();
    assert!(matches!(err, ImporterError::ControlApi { .. }));
    assert!(!api.calls().contains(&Operation::RegisterMachine));
}

#[tokio::test]
async fn attach_failure_still_unlocks_once() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    api.fail_on(Operation::AttachDevice);
    let (log, _) = captured();

    let err = Provisioner::new(&api, request(&image), log)
        .run(true)
        .await
        .unwrap_err();

    assert!(matches!(err, ImporterError::ControlApi { ref operation, .. } if operation == "AttachDevice"));
    assert_eq!(api.unlock_count(), 1);
    assert_eq!(api.active_sessions(), 0);
    assert!(!api.calls().contains(&Operation::SaveSettings));
    assert!(api.machine("Hack OS").unwrap().attachments.is_empty());
}

#[tokio::test]
async fn save_failure_still_unlocks_once() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    api.fail_on(Operation::SaveSettings);
    let (log, _) = captured();

    let err = Provisioner::new(&api, request(&image), log)
        .run(true)
        .await
        .unwrap_err();

    assert!(matches!(err, ImporterError::ControlApi { ref operation, .. } if operation == "SaveSettings"));
    assert_eq!(api.unlock_count(), 1);
    assert_eq!(api.active_sessions(), 0);
    assert!(api.machine("Hack OS").unwrap().attachments.is_empty());
}

#[tokio::test]
async fn attach_error_wins_over_unlock_error() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    api.fail_on(Operation::AttachDevice);
    api.fail_on(Operation::UnlockMachine);
    let (log, buffer) = captured();

    let err = Provisioner::new(&api, request(&image), log)
        .run(true)
        .await
        .unwrap_err();

    assert!(matches!(err, ImporterError::ControlApi { ref operation, .. } if operation == "AttachDevice"));
    let unlocks = api
        .calls()
        .into_iter()
        .filter(|op| *op == Operation::UnlockMachine)
        .count();
    assert_eq!(unlocks, 1);
    assert!(buffer.contents().contains("failed to unlock machine"));
}

#[tokio::test]
async fn create_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    api.fail_on(Operation::CreateMachine);
    let (log, buffer) = captured();

    let err = Provisioner::new(&api, request(&image), log)
        .run(true)
        .await
        .unwrap_err();

    assert!(matches!(err, ImporterError::CreateMachine { ref name, .. } if name == "Hack OS"));
    assert_eq!(api.calls(), vec![Operation::FindMachine, Operation::CreateMachine]);
    assert!(buffer.contents().contains("machine creation failed"));
}

#[tokio::test]
async fn failed_lookup_is_treated_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    api.fail_on(Operation::FindMachine);
    let (log, buffer) = captured();

    let summary = provisioned(
        Provisioner::new(&api, request(&image), log)
            .run(true)
            .await
            .unwrap(),
    );

    assert!(!summary.replaced);
    let out = buffer.contents();
    assert!(out.contains("DEBUG"));
    assert!(out.contains("machine lookup failed"));
}

#[tokio::test]
async fn failed_lookup_of_existing_machine_surfaces_on_create() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    let (log, _) = captured();

    let provisioner = Provisioner::new(&api, request(&image), log);
    provisioner.run(true).await.unwrap();

    api.fail_on(Operation::FindMachine);
    let err = provisioner.run(true).await.unwrap_err();
    assert!(matches!(err, ImporterError::CreateMachine { .. }));
    assert_eq!(api.machine_count(), 1);
}

#[tokio::test]
async fn quieter_level_hides_progress() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(&dir, "hack.vdi");
    let api = MemoryHypervisor::new().with_medium(&image, gib_to_bytes(20));
    let buffer = LogBuffer::new();
    let log = LogConfig::default()
        .with_level(tracing::level_filters::LevelFilter::WARN)
        .with_sink(LogSink::Buffer(buffer.clone()));

    Provisioner::new(&api, request(&image), log)
        .run(true)
        .await
        .unwrap();

    let out = buffer.contents();
    assert!(!out.contains("Creating new machine"));
    assert!(out.contains("USB 3.0 support not enabled"));
}

//! Control API backed by the `VBoxManage` front end.
//!
//! `VBoxManage` takes its own session lock around every command, so a
//! [`Session`] here is a queue of device changes that `save_settings` replays
//! and `unlock_machine` discards. An unregistered [`Machine`] exists only in
//! memory; `register_machine` creates, registers and configures it in one go,
//! so a run that fails earlier leaves nothing on the host.
//!
//! Media are always addressed by location. `showmediuminfo` does not add an
//! unattached medium to the media registry, so its UUID is not usable from
//! later invocations.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{ControlApi, ExtensionPack, Machine, MachineRef, MediumRef, Session};
use crate::constants::{
    AccessMode, CleanupMode, ClipboardMode, DeviceType, LockType, PointingHidType, StorageBus,
    StorageControllerType, UsbControllerType,
};
use crate::error::ImporterError;

const COMMAND: &str = "VBoxManage";

pub struct VBoxManage {
    program: PathBuf,
    sessions: Mutex<HashMap<u64, Vec<Vec<OsString>>>>,
    next_session: AtomicU64,
}

impl VBoxManage {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// `VBoxManage --version`, trimmed.
    pub async fn version(&self) -> Result<String, ImporterError> {
        Ok(self.run(["--version"]).await?.trim().to_string())
    }

    async fn run<I, S>(&self, args: I) -> Result<String, ImporterError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let subcommand = args
            .first()
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::debug!(command = COMMAND, ?args, "running");

        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| ImporterError::Io {
                context: format!("running {COMMAND} {subcommand}"),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ImporterError::ExternalCommand {
                command: format!("{COMMAND} {subcommand}"),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn machine_info(&self, machine: &str) -> Result<BTreeMap<String, String>, ImporterError> {
        let out = self
            .run(["showvminfo", machine, "--machinereadable"])
            .await?;
        Ok(parse_machine_readable(&out))
    }
}

impl ControlApi for VBoxManage {
    async fn find_machine(&self, name: &str) -> Result<Option<MachineRef>, ImporterError> {
        let info = match self.machine_info(name).await {
            Ok(info) => info,
            Err(ImporterError::ExternalCommand { message, .. }) if is_not_found(&message) => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let id = info.get("UUID").cloned().ok_or_else(|| ImporterError::Parse {
            command: format!("{COMMAND} showvminfo"),
            message: "missing UUID".into(),
        })?;
        Ok(Some(MachineRef {
            id,
            name: info.get("name").cloned().unwrap_or_else(|| name.to_string()),
            settings_file: info.get("CfgFile").map(PathBuf::from),
        }))
    }

    /// Nothing reaches the host until [`ControlApi::register_machine`].
    async fn create_machine(&self, name: &str, os_type: &str) -> Result<Machine, ImporterError> {
        Ok(Machine::new(uuid::Uuid::new_v4().to_string(), name, os_type))
    }

    async fn register_machine(&self, machine: &Machine) -> Result<MachineRef, ImporterError> {
        let out = self
            .run([
                "createvm",
                "--name",
                machine.name.as_str(),
                "--ostype",
                machine.os_type.as_str(),
                "--uuid",
                machine.id.as_str(),
                "--register",
            ])
            .await?;
        let created = parse_createvm(&out)?;

        let mut modify: Vec<String> = vec!["modifyvm".into(), created.id.clone()];
        modify.extend(modifyvm_args(machine));
        self.run(modify).await?;

        for args in storagectl_args(machine) {
            self.run(args).await?;
        }

        tracing::debug!(machine = %machine.name, id = %created.id, "machine registered");
        Ok(MachineRef {
            id: created.id,
            name: machine.name.clone(),
            settings_file: created.settings_file,
        })
    }

    async fn unregister_machine(
        &self,
        machine: &MachineRef,
        mode: CleanupMode,
    ) -> Result<Vec<MediumRef>, ImporterError> {
        let info = self.machine_info(&machine.id).await?;
        let attached = attached_disks(&info);

        self.run(["unregistervm", machine.id.as_str()]).await?;

        let media = match mode {
            CleanupMode::UnregisterOnly | CleanupMode::DetachAllReturnNone => Vec::new(),
            _ => attached,
        };
        Ok(media)
    }

    async fn delete_config(
        &self,
        machine: MachineRef,
        media: Vec<MediumRef>,
    ) -> Result<(), ImporterError> {
        for medium in &media {
            let mut args: Vec<OsString> = vec!["closemedium".into(), "disk".into()];
            args.push(medium.location.clone().into_os_string());
            args.push("--delete".into());
            self.run(args).await?;
            tracing::debug!(path = %medium.location.display(), "deleted medium");
        }

        let Some(settings_file) = machine.settings_file else {
            return Ok(());
        };
        remove_machine_files(&settings_file).await
    }

    async fn open_medium(
        &self,
        location: &Path,
        device_type: DeviceType,
        access_mode: AccessMode,
        force_new_uuid: bool,
    ) -> Result<MediumRef, ImporterError> {
        let kind = medium_kind_arg(device_type)?;
        if access_mode == AccessMode::ReadOnly && device_type == DeviceType::HardDisk {
            tracing::debug!("VBoxManage opens hard disks read-write; ignoring read-only request");
        }

        if force_new_uuid {
            let mut args: Vec<OsString> = vec!["internalcommands".into(), "sethduuid".into()];
            args.push(location.as_os_str().to_owned());
            self.run(args).await?;
        }

        let mut args: Vec<OsString> = vec!["showmediuminfo".into(), kind.into()];
        args.push(location.as_os_str().to_owned());
        let out = self.run(args).await?;
        parse_medium_info(&out, location)
    }

    async fn resize_medium(
        &self,
        medium: &MediumRef,
        logical_size: u64,
    ) -> Result<MediumRef, ImporterError> {
        let mut args: Vec<OsString> = vec!["modifymedium".into(), "disk".into()];
        args.push(medium.location.clone().into_os_string());
        args.push("--resizebyte".into());
        args.push(logical_size.to_string().into());
        self.run(args).await?;

        Ok(MediumRef {
            logical_size,
            ..medium.clone()
        })
    }

    async fn installed_extension_packs(&self) -> Result<Vec<ExtensionPack>, ImporterError> {
        let out = self.run(["list", "extpacks"]).await?;
        Ok(parse_extpacks(&out))
    }

    async fn lock_machine(
        &self,
        machine: &MachineRef,
        lock: LockType,
    ) -> Result<Session, ImporterError> {
        if lock != LockType::Write {
            return Err(ImporterError::control_api(
                "LockMachine",
                format!("{lock} locks are not supported through {COMMAND}"),
            ));
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().unwrap().insert(id, Vec::new());
        Ok(Session {
            id,
            machine: machine.clone(),
            lock,
        })
    }

    async fn attach_device(
        &self,
        session: &Session,
        controller: &str,
        port: i32,
        device: i32,
        device_type: DeviceType,
        medium: &MediumRef,
    ) -> Result<(), ImporterError> {
        let args = storageattach_args(&session.machine.id, controller, port, device, device_type, medium)?;

        let mut sessions = self.sessions.lock().unwrap();
        let pending = sessions.get_mut(&session.id).ok_or_else(|| {
            ImporterError::control_api("AttachDevice", "session is not locked")
        })?;
        pending.push(args);
        Ok(())
    }

    async fn save_settings(&self, session: &Session) -> Result<(), ImporterError> {
        let pending = {
            let mut sessions = self.sessions.lock().unwrap();
            let pending = sessions.get_mut(&session.id).ok_or_else(|| {
                ImporterError::control_api("SaveSettings", "session is not locked")
            })?;
            std::mem::take(pending)
        };

        for args in pending {
            self.run(args).await?;
        }
        Ok(())
    }

    async fn unlock_machine(&self, session: Session) -> Result<(), ImporterError> {
        self.sessions
            .lock()
            .unwrap()
            .remove(&session.id)
            .map(|_| ())
            .ok_or_else(|| ImporterError::control_api("UnlockMachine", "session is not locked"))
    }
}

// ── Argument builders ───────────────────────────────────────────────

fn on_off(flag: bool) -> String {
    if flag { "on".into() } else { "off".into() }
}

/// `modifyvm` options carrying every property of `machine`.
pub fn modifyvm_args(machine: &Machine) -> Vec<String> {
    let mut args = vec![
        "--memory".into(),
        machine.memory_mb.to_string(),
        "--vram".into(),
        machine.graphics.vram_mb.to_string(),
        "--accelerate-3d".into(),
        on_off(machine.graphics.accelerate_3d),
        "--accelerate-2d-video".into(),
        on_off(machine.graphics.accelerate_2d_video),
        "--audio-enabled".into(),
        on_off(machine.audio.enabled),
        "--audio-in".into(),
        on_off(machine.audio.enabled_in),
        "--audio-out".into(),
        on_off(machine.audio.enabled_out),
        "--ioapic".into(),
        on_off(machine.bios.ioapic_enabled),
        "--clipboard-mode".into(),
        clipboard_arg(machine.clipboard_mode).into(),
        "--mouse".into(),
        mouse_arg(machine.pointing_hid).into(),
        "--rtc-use-utc".into(),
        on_off(machine.rtc_use_utc),
    ];

    for usb in machine.usb_controllers() {
        let flag = match usb.controller_type {
            UsbControllerType::Ohci => "--usb-ohci",
            UsbControllerType::Ehci => "--usb-ehci",
            UsbControllerType::Xhci => "--usb-xhci",
        };
        args.push(flag.into());
        args.push("on".into());
    }

    args
}

/// One `storagectl` invocation per storage controller.
pub fn storagectl_args(machine: &Machine) -> Vec<Vec<String>> {
    machine
        .storage_controllers()
        .iter()
        .map(|ctl| {
            vec![
                "storagectl".into(),
                machine.id.clone(),
                "--name".into(),
                ctl.name.clone(),
                "--add".into(),
                bus_arg(ctl.bus).into(),
                "--controller".into(),
                controller_arg(ctl.controller_type).into(),
            ]
        })
        .collect()
}

fn storageattach_args(
    machine_id: &str,
    controller: &str,
    port: i32,
    device: i32,
    device_type: DeviceType,
    medium: &MediumRef,
) -> Result<Vec<OsString>, ImporterError> {
    let kind = match device_type {
        DeviceType::HardDisk => "hdd",
        DeviceType::Dvd => "dvddrive",
        DeviceType::Floppy => "fdd",
        other => {
            return Err(ImporterError::control_api(
                "AttachDevice",
                format!("{other} devices cannot be attached to a storage controller"),
            ));
        }
    };

    Ok([
        "storageattach",
        machine_id,
        "--storagectl",
        controller,
        "--port",
        &port.to_string(),
        "--device",
        &device.to_string(),
        "--type",
        kind,
        "--medium",
    ]
    .into_iter()
    .map(OsString::from)
    .chain([medium.location.clone().into_os_string()])
    .collect())
}

fn medium_kind_arg(device_type: DeviceType) -> Result<&'static str, ImporterError> {
    match device_type {
        DeviceType::HardDisk => Ok("disk"),
        DeviceType::Dvd => Ok("dvd"),
        DeviceType::Floppy => Ok("floppy"),
        other => Err(ImporterError::control_api(
            "OpenMedium",
            format!("{other} is not a medium type"),
        )),
    }
}

fn clipboard_arg(mode: ClipboardMode) -> &'static str {
    match mode {
        ClipboardMode::Disabled => "disabled",
        ClipboardMode::HostToGuest => "hosttoguest",
        ClipboardMode::GuestToHost => "guesttohost",
        ClipboardMode::Bidirectional => "bidirectional",
    }
}

fn mouse_arg(hid: PointingHidType) -> &'static str {
    match hid {
        PointingHidType::None => "none",
        PointingHidType::Ps2Mouse | PointingHidType::ComboMouse => "ps2",
        PointingHidType::UsbMouse => "usb",
        PointingHidType::UsbTablet => "usbtablet",
        PointingHidType::UsbMultiTouch => "usbmultitouch",
    }
}

fn bus_arg(bus: StorageBus) -> &'static str {
    match bus {
        StorageBus::Ide => "ide",
        StorageBus::Sata => "sata",
        StorageBus::Scsi => "scsi",
        StorageBus::Floppy => "floppy",
        StorageBus::Sas => "sas",
        StorageBus::Usb => "usb",
        StorageBus::PciExpress => "pcie",
        StorageBus::VirtioScsi => "virtio",
    }
}

fn controller_arg(controller: StorageControllerType) -> &'static str {
    match controller {
        StorageControllerType::LsiLogic => "LSILogic",
        StorageControllerType::BusLogic => "BusLogic",
        StorageControllerType::IntelAhci => "IntelAHCI",
        StorageControllerType::Piix3 => "PIIX3",
        StorageControllerType::Piix4 => "PIIX4",
        StorageControllerType::Ich6 => "ICH6",
        StorageControllerType::I82078 => "I82078",
        StorageControllerType::LsiLogicSas => "LSILogicSAS",
        StorageControllerType::Usb => "USB",
        StorageControllerType::NvMe => "NVMe",
        StorageControllerType::VirtioScsi => "VirtIO",
    }
}

// ── Output parsers ──────────────────────────────────────────────────

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("VBOX_E_OBJECT_NOT_FOUND")
        || stderr.contains("Could not find a registered machine")
}

/// Parse `key="value"` lines from `--machinereadable` output.
pub fn parse_machine_readable(out: &str) -> BTreeMap<String, String> {
    out.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim().trim_matches('"');
            let value = value.trim().trim_matches('"');
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Removable-media image formats that are never hard disks.
const REMOVABLE_IMAGE_EXTENSIONS: &[&str] = &["iso", "dmg", "cdr", "img", "ima", "vfd", "flp"];

/// Hard disks attached to a machine, from its `showvminfo` properties.
///
/// Each attachment appears as `"<ctl>-<port>-<dev>"="<path>"` with a
/// companion `"<ctl>-ImageUUID-<port>-<dev>"="<uuid>"`. Machine-readable
/// output does not name the device type, so a slot counts as a hard disk
/// unless it is a DVD drive (it carries an `-IsEjected-` flag) or its image
/// has a removable-media extension. Disks without an extension are kept.
fn attached_disks(info: &BTreeMap<String, String>) -> Vec<MediumRef> {
    info.iter()
        .filter_map(|(key, id)| {
            let (controller, slot) = key.split_once("-ImageUUID-")?;
            let location = info.get(&format!("{controller}-{slot}"))?;
            if location.eq_ignore_ascii_case("none") || location.eq_ignore_ascii_case("emptydrive") {
                return None;
            }
            if info.contains_key(&format!("{controller}-IsEjected-{slot}")) {
                return None;
            }
            let removable = Path::new(location)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| {
                    REMOVABLE_IMAGE_EXTENSIONS
                        .iter()
                        .any(|r| e.eq_ignore_ascii_case(r))
                });
            (!removable).then(|| MediumRef {
                id: id.clone(),
                location: PathBuf::from(location),
                logical_size: 0,
            })
        })
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
struct CreatedMachine {
    id: String,
    settings_file: Option<PathBuf>,
}

fn parse_createvm(out: &str) -> Result<CreatedMachine, ImporterError> {
    let mut id = None;
    let mut settings_file = None;
    for line in out.lines() {
        if let Some(value) = line.strip_prefix("UUID:") {
            id = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Settings file:") {
            settings_file = Some(PathBuf::from(value.trim().trim_matches('\'')));
        }
    }

    let id = id.ok_or_else(|| ImporterError::Parse {
        command: format!("{COMMAND} createvm"),
        message: "missing UUID".into(),
    })?;
    Ok(CreatedMachine { id, settings_file })
}

fn parse_medium_info(out: &str, location: &Path) -> Result<MediumRef, ImporterError> {
    let mut id = None;
    let mut capacity = None;
    for line in out.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "UUID" => id = Some(value.trim().to_string()),
            "Capacity" => capacity = parse_capacity(value),
            _ => {}
        }
    }

    let parse_err = |message: &str| ImporterError::Parse {
        command: format!("{COMMAND} showmediuminfo"),
        message: message.to_string(),
    };
    Ok(MediumRef {
        id: id.ok_or_else(|| parse_err("missing UUID"))?,
        location: location.to_path_buf(),
        logical_size: capacity.ok_or_else(|| parse_err("missing capacity"))?,
    })
}

/// `"20480 MBytes"` → bytes.
fn parse_capacity(value: &str) -> Option<u64> {
    let mut parts = value.split_whitespace();
    let number: u64 = parts.next()?.parse().ok()?;
    let multiplier: u64 = match parts.next().unwrap_or("bytes") {
        "bytes" => 1,
        "KBytes" => 1 << 10,
        "MBytes" => 1 << 20,
        "GBytes" => 1 << 30,
        "TBytes" => 1 << 40,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

fn parse_extpacks(out: &str) -> Vec<ExtensionPack> {
    let mut packs: Vec<ExtensionPack> = Vec::new();
    for line in out.lines() {
        if let Some(rest) = line.strip_prefix("Pack no.") {
            if let Some((_, name)) = rest.split_once(':') {
                packs.push(ExtensionPack {
                    name: name.trim().to_string(),
                    version: None,
                });
            }
        } else if let Some(version) = line.strip_prefix("Version:") {
            if let Some(last) = packs.last_mut() {
                last.version = Some(version.trim().to_string());
            }
        }
    }
    packs
}

/// Remove what `unregistervm --delete` would leave behind for the machine
/// itself: the settings file, its backup, the `Logs` directory and finally
/// the machine folder if nothing else lives in it.
async fn remove_machine_files(settings_file: &Path) -> Result<(), ImporterError> {
    let remove_file = async |path: PathBuf| match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ImporterError::Io {
            context: format!("removing {}", path.display()),
            source: e,
        }),
    };

    remove_file(settings_file.to_path_buf()).await?;
    remove_file(settings_file.with_extension("vbox-prev")).await?;

    let Some(dir) = settings_file.parent() else {
        return Ok(());
    };
    let logs = dir.join("Logs");
    if logs.exists() {
        tokio::fs::remove_dir_all(&logs)
            .await
            .map_err(|e| ImporterError::Io {
                context: format!("removing {}", logs.display()),
                source: e,
            })?;
    }
    if tokio::fs::remove_dir(dir).await.is_err() {
        tracing::debug!(path = %dir.display(), "machine folder not empty, leaving it");
    }
    Ok(())
}

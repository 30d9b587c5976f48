//! The hypervisor control API as seen by the provisioner.
//!
//! A backend owns every hypervisor object. The provisioner only holds
//! handles ([`MachineRef`], [`MediumRef`], [`Session`]) plus the unregistered
//! [`Machine`] it is configuring, which becomes part of the host inventory
//! through [`ControlApi::register_machine`].

pub mod memory;
pub mod vboxmanage;

use std::path::{Path, PathBuf};

use crate::constants::{
    AccessMode, CleanupMode, ClipboardMode, DeviceType, LockType, PointingHidType, StorageBus,
    StorageControllerType, UsbControllerType,
};
use crate::error::ImporterError;

// ── Handles ─────────────────────────────────────────────────────────

/// A machine registered in the host inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRef {
    pub id: String,
    pub name: String,
    pub settings_file: Option<PathBuf>,
}

/// An opened virtual disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumRef {
    pub id: String,
    pub location: PathBuf,
    /// Size the guest sees, in bytes.
    pub logical_size: u64,
}

/// Exclusive lock over a registered machine.
#[derive(Debug, PartialEq, Eq)]
pub struct Session {
    pub id: u64,
    pub machine: MachineRef,
    pub lock: LockType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPack {
    pub name: String,
    pub version: Option<String>,
}

// ── Machine ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsAdapter {
    pub vram_mb: u32,
    pub accelerate_3d: bool,
    pub accelerate_2d_video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioAdapter {
    pub enabled: bool,
    pub enabled_in: bool,
    pub enabled_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiosSettings {
    pub ioapic_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageController {
    pub name: String,
    pub bus: StorageBus,
    pub controller_type: StorageControllerType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbController {
    pub name: String,
    pub controller_type: UsbControllerType,
}

/// A machine that has been created but not yet registered.
///
/// Defaults mirror what VirtualBox gives a new machine before any settings
/// are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub os_type: String,
    pub settings_file: Option<PathBuf>,
    pub memory_mb: u32,
    pub graphics: GraphicsAdapter,
    pub audio: AudioAdapter,
    pub bios: BiosSettings,
    pub clipboard_mode: ClipboardMode,
    pub pointing_hid: PointingHidType,
    pub rtc_use_utc: bool,
    storage_controllers: Vec<StorageController>,
    usb_controllers: Vec<UsbController>,
}

impl Machine {
    pub fn new(id: impl Into<String>, name: impl Into<String>, os_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            os_type: os_type.into(),
            settings_file: None,
            memory_mb: 128,
            graphics: GraphicsAdapter {
                vram_mb: 8,
                accelerate_3d: false,
                accelerate_2d_video: false,
            },
            audio: AudioAdapter {
                enabled: false,
                enabled_in: false,
                enabled_out: false,
            },
            bios: BiosSettings {
                ioapic_enabled: false,
            },
            clipboard_mode: ClipboardMode::Disabled,
            pointing_hid: PointingHidType::Ps2Mouse,
            rtc_use_utc: false,
            storage_controllers: Vec::new(),
            usb_controllers: Vec::new(),
        }
    }

    pub fn with_settings_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_file = Some(path.into());
        self
    }

    pub fn add_storage_controller(
        &mut self,
        name: &str,
        bus: StorageBus,
    ) -> Result<&mut StorageController, ImporterError> {
        if self.storage_controller(name).is_some() {
            return Err(ImporterError::control_api(
                "AddStorageController",
                format!("storage controller named '{name}' already exists"),
            ));
        }
        self.storage_controllers.push(StorageController {
            name: name.to_string(),
            bus,
            controller_type: bus.default_controller_type(),
        });
        let index = self.storage_controllers.len() - 1;
        Ok(&mut self.storage_controllers[index])
    }

    pub fn add_usb_controller(
        &mut self,
        name: &str,
        controller_type: UsbControllerType,
    ) -> Result<&UsbController, ImporterError> {
        if self.usb_controllers.iter().any(|c| c.name == name) {
            return Err(ImporterError::control_api(
                "AddUSBController",
                format!("USB controller named '{name}' already exists"),
            ));
        }
        if self
            .usb_controllers
            .iter()
            .any(|c| c.controller_type == controller_type)
        {
            return Err(ImporterError::control_api(
                "AddUSBController",
                format!("a {controller_type} controller already exists"),
            ));
        }
        self.usb_controllers.push(UsbController {
            name: name.to_string(),
            controller_type,
        });
        let index = self.usb_controllers.len() - 1;
        Ok(&self.usb_controllers[index])
    }

    pub fn storage_controller(&self, name: &str) -> Option<&StorageController> {
        self.storage_controllers.iter().find(|c| c.name == name)
    }

    pub fn storage_controllers(&self) -> &[StorageController] {
        &self.storage_controllers
    }

    pub fn usb_controllers(&self) -> &[UsbController] {
        &self.usb_controllers
    }

    /// Handle for this machine once it is registered.
    pub fn to_ref(&self) -> MachineRef {
        MachineRef {
            id: self.id.clone(),
            name: self.name.clone(),
            settings_file: self.settings_file.clone(),
        }
    }
}

// ── ControlApi ──────────────────────────────────────────────────────

#[allow(async_fn_in_trait)] // only used through generics
pub trait ControlApi {
    /// `Ok(None)` means the inventory has no machine with this name; `Err`
    /// means the query itself failed.
    async fn find_machine(&self, name: &str) -> Result<Option<MachineRef>, ImporterError>;

    async fn create_machine(&self, name: &str, os_type: &str) -> Result<Machine, ImporterError>;

    async fn register_machine(&self, machine: &Machine) -> Result<MachineRef, ImporterError>;

    /// Unregister a machine, returning the media `mode` hands back for deletion.
    async fn unregister_machine(
        &self,
        machine: &MachineRef,
        mode: CleanupMode,
    ) -> Result<Vec<MediumRef>, ImporterError>;

    /// Delete an unregistered machine's settings and the given media.
    async fn delete_config(
        &self,
        machine: MachineRef,
        media: Vec<MediumRef>,
    ) -> Result<(), ImporterError>;

    async fn open_medium(
        &self,
        location: &Path,
        device_type: DeviceType,
        access_mode: AccessMode,
        force_new_uuid: bool,
    ) -> Result<MediumRef, ImporterError>;

    async fn resize_medium(
        &self,
        medium: &MediumRef,
        logical_size: u64,
    ) -> Result<MediumRef, ImporterError>;

    async fn installed_extension_packs(&self) -> Result<Vec<ExtensionPack>, ImporterError>;

    async fn lock_machine(
        &self,
        machine: &MachineRef,
        lock: LockType,
    ) -> Result<Session, ImporterError>;

    async fn attach_device(
        &self,
        session: &Session,
        controller: &str,
        port: i32,
        device: i32,
        device_type: DeviceType,
        medium: &MediumRef,
    ) -> Result<(), ImporterError>;

    async fn save_settings(&self, session: &Session) -> Result<(), ImporterError>;

    async fn unlock_machine(&self, session: Session) -> Result<(), ImporterError>;
}

impl<T: ControlApi> ControlApi for &T {
    async fn find_machine(&self, name: &str) -> Result<Option<MachineRef>, ImporterError> {
        (**self).find_machine(name).await
    }

    async fn create_machine(&self, name: &str, os_type: &str) -> Result<Machine, ImporterError> {
        (**self).create_machine(name, os_type).await
    }

    async fn register_machine(&self, machine: &Machine) -> Result<MachineRef, ImporterError> {
        (**self).register_machine(machine).await
    }

    async fn unregister_machine(
        &self,
        machine: &MachineRef,
        mode: CleanupMode,
    ) -> Result<Vec<MediumRef>, ImporterError> {
        (**self).unregister_machine(machine, mode).await
    }

    async fn delete_config(
        &self,
        machine: MachineRef,
        media: Vec<MediumRef>,
    ) -> Result<(), ImporterError> {
        (**self).delete_config(machine, media).await
    }

    async fn open_medium(
        &self,
        location: &Path,
        device_type: DeviceType,
        access_mode: AccessMode,
        force_new_uuid: bool,
    ) -> Result<MediumRef, ImporterError> {
        (**self)
            .open_medium(location, device_type, access_mode, force_new_uuid)
            .await
    }

    async fn resize_medium(
        &self,
        medium: &MediumRef,
        logical_size: u64,
    ) -> Result<MediumRef, ImporterError> {
        (**self).resize_medium(medium, logical_size).await
    }

    async fn installed_extension_packs(&self) -> Result<Vec<ExtensionPack>, ImporterError> {
        (**self).installed_extension_packs().await
    }

    async fn lock_machine(
        &self,
        machine: &MachineRef,
        lock: LockType,
    ) -> Result<Session, ImporterError> {
        (**self).lock_machine(machine, lock).await
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
        (**self)
            .attach_device(session, controller, port, device, device_type, medium)
            .await
    }

    async fn save_settings(&self, session: &Session) -> Result<(), ImporterError> {
        (**self).save_settings(session).await
    }

    async fn unlock_machine(&self, session: Session) -> Result<(), ImporterError> {
        (**self).unlock_machine(session).await
    }
}

/// Run `body` while holding a write lock on `machine`.
///
/// The session is released exactly once on every path. An error from `body`
/// wins over an error from releasing the lock.
pub async fn with_write_lock<A, T, F>(
    api: &A,
    machine: &MachineRef,
    body: F,
) -> Result<T, ImporterError>
where
    A: ControlApi,
    F: AsyncFnOnce(&Session) -> Result<T, ImporterError>,
{
    let session = api.lock_machine(machine, LockType::Write).await?;
    tracing::debug!(machine = %machine.name, session = session.id, "machine locked");

    let outcome = body(&session).await;

    let session_id = session.id;
    let released = api.unlock_machine(session).await;
    tracing::debug!(machine = %machine.name, session = session_id, "machine unlocked");

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(unlock_err)) => {
            tracing::warn!(error = %unlock_err, "failed to unlock machine after error");
            Err(e)
        }
        (Ok(_), Err(unlock_err)) => Err(unlock_err),
    }
}

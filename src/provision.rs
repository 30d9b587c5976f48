//! Import a disk image as a fully configured machine.

use std::path::{Path, PathBuf};

use tracing::Instrument;
use tracing::instrument::WithSubscriber;

use crate::backend::{ControlApi, Machine, MachineRef, MediumRef, with_write_lock};
use crate::constants::{
    AccessMode, CleanupMode, ClipboardMode, DeviceType, PointingHidType, StorageBus,
    StorageControllerType, UsbControllerType, lookup,
};
use crate::error::ImporterError;
use crate::logging::LogConfig;
use crate::profile::HardwareProfile;

pub const DEFAULT_MACHINE_NAME: &str = "Hack OS";

/// What the operator asked for. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub image_path: Option<PathBuf>,
    pub machine_name: String,
}

impl ProvisionRequest {
    /// An absent or empty name falls back to [`DEFAULT_MACHINE_NAME`].
    pub fn new(image_path: Option<PathBuf>, machine_name: Option<String>) -> Self {
        let machine_name = machine_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_MACHINE_NAME.to_string());
        Self {
            image_path,
            machine_name,
        }
    }

    /// The image path if it names an existing regular file with a `.vdi`
    /// extension.
    pub fn valid_image(&self) -> Option<&Path> {
        let path = self.image_path.as_deref()?;
        let is_vdi = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("vdi"));
        (is_vdi && path.is_file()).then_some(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub machine: MachineRef,
    pub medium: MediumRef,
    /// Whether a machine with the same name was removed first.
    pub replaced: bool,
    pub usb3_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The image was missing or not a `.vdi`; nothing was touched.
    InvalidImage,
    Provisioned(ProvisionSummary),
}

pub struct Provisioner<A> {
    api: A,
    request: ProvisionRequest,
    profile: HardwareProfile,
    log: LogConfig,
}

impl<A: ControlApi> Provisioner<A> {
    pub fn new(api: A, request: ProvisionRequest, log: LogConfig) -> Self {
        Self {
            api,
            request,
            profile: HardwareProfile::HACK_OS,
            log,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn request(&self) -> &ProvisionRequest {
        &self.request
    }

    /// Run the import. With `destroy_existing`, a machine already using the
    /// requested name is unregistered and deleted first; otherwise its
    /// presence is an error.
    pub async fn run(&self, destroy_existing: bool) -> Result<ProvisionOutcome, ImporterError> {
        let subscriber = self.log.subscriber();
        async {
            let span = tracing::info_span!("provision", machine = %self.request.machine_name);
            self.provision(destroy_existing).instrument(span).await
        }
        .with_subscriber(subscriber)
        .await
    }

    async fn provision(&self, destroy_existing: bool) -> Result<ProvisionOutcome, ImporterError> {
        let name = self.request.machine_name.as_str();

        let Some(image) = self.request.valid_image() else {
            let shown = self
                .request
                .image_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            tracing::info!("Image file at '{shown}' invalid or does not exist.");
            return Ok(ProvisionOutcome::InvalidImage);
        };

        let mut replaced = false;
        if let Some(existing) = self.find_existing(name).await {
            tracing::info!("Machine '{}' with name '{name}' already exists.", existing.id);
            if !destroy_existing {
                return Err(ImporterError::MachineExists {
                    name: name.to_string(),
                });
            }
            tracing::info!("Removing existing machine with name '{name}'");
            self.remove_machine(existing, image).await?;
            replaced = true;
        }

        tracing::info!("Creating new machine with name '{name}'");
        let mut machine = match self.api.create_machine(name, self.profile.os_type).await {
            Ok(machine) => machine,
            Err(e) => {
                tracing::debug!(error = %e, "machine creation failed");
                return Err(ImporterError::CreateMachine {
                    name: name.to_string(),
                    source: Box::new(e),
                });
            }
        };

        self.apply_profile(&mut machine)?;
        let medium = self.prepare_medium(image).await?;
        self.add_storage_controller(&mut machine)?;
        let usb3_enabled = self.add_usb_controller(&mut machine).await?;

        let machine = self.api.register_machine(&machine).await?;
        self.attach_medium(&machine, &medium).await?;

        tracing::info!(id = %machine.id, "machine ready");
        Ok(ProvisionOutcome::Provisioned(ProvisionSummary {
            machine,
            medium,
            replaced,
            usb3_enabled,
        }))
    }

    /// A failed lookup counts as "no such machine".
    async fn find_existing(&self, name: &str) -> Option<MachineRef> {
        match self.api.find_machine(name).await {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!(error = %e, "machine lookup failed");
                None
            }
        }
    }

    async fn remove_machine(&self, machine: MachineRef, image: &Path) -> Result<(), ImporterError> {
        let media = self
            .api
            .unregister_machine(&machine, CleanupMode::Full)
            .await?;

        // The image being imported stays on disk.
        let (kept, doomed): (Vec<_>, Vec<_>) = media
            .into_iter()
            .partition(|medium| same_file(&medium.location, image));
        for medium in &kept {
            tracing::debug!(path = %medium.location.display(), "keeping source image");
        }

        self.api.delete_config(machine, doomed).await
    }

    fn apply_profile(&self, machine: &mut Machine) -> Result<(), ImporterError> {
        let profile = &self.profile;

        machine.memory_mb = profile.memory_mb;

        machine.graphics.vram_mb = profile.vram_mb;
        machine.graphics.accelerate_3d = profile.accelerate_3d;
        machine.graphics.accelerate_2d_video = profile.accelerate_2d_video;

        machine.audio.enabled = profile.audio;
        machine.audio.enabled_in = profile.audio_in;
        machine.audio.enabled_out = profile.audio_out;

        machine.bios.ioapic_enabled = profile.ioapic;

        machine.clipboard_mode = lookup::<ClipboardMode>(profile.clipboard_mode)?;
        machine.pointing_hid = lookup::<PointingHidType>(profile.pointing_hid)?;
        machine.rtc_use_utc = profile.rtc_use_utc;
        Ok(())
    }

    async fn prepare_medium(&self, image: &Path) -> Result<MediumRef, ImporterError> {
        let medium = self
            .api
            .open_medium(image, DeviceType::HardDisk, AccessMode::ReadWrite, false)
            .await?;

        let wanted = self.profile.disk_size;
        if medium.logical_size < wanted {
            tracing::debug!(from = medium.logical_size, to = wanted, "resizing medium");
            self.api.resize_medium(&medium, wanted).await
        } else {
            if medium.logical_size > wanted {
                tracing::warn!(
                    size = medium.logical_size,
                    wanted,
                    "medium is larger than the profile disk size, leaving it unchanged"
                );
            }
            Ok(medium)
        }
    }

    fn add_storage_controller(&self, machine: &mut Machine) -> Result<(), ImporterError> {
        let bus = lookup::<StorageBus>(self.profile.storage_bus)?;
        let controller_type = lookup::<StorageControllerType>(self.profile.storage_controller_type)?;
        let controller = machine.add_storage_controller(self.profile.storage_controller, bus)?;
        controller.controller_type = controller_type;
        Ok(())
    }

    /// Add the USB 3 controller when the extension pack providing it is
    /// installed. Returns whether it was added.
    async fn add_usb_controller(&self, machine: &mut Machine) -> Result<bool, ImporterError> {
        let pack = self.profile.usb3_extension_pack;
        let installed = self.api.installed_extension_packs().await?;
        if !installed.iter().any(|p| p.name == pack) {
            tracing::warn!("USB 3.0 support not enabled. Install extension pack '{pack}'");
            return Ok(false);
        }

        let controller_type = lookup::<UsbControllerType>(self.profile.usb_controller_type)?;
        machine.add_usb_controller(self.profile.usb_controller, controller_type)?;
        Ok(true)
    }

    async fn attach_medium(
        &self,
        machine: &MachineRef,
        medium: &MediumRef,
    ) -> Result<(), ImporterError> {
        let profile = &self.profile;
        with_write_lock(&self.api, machine, async |session| {
            self.api
                .attach_device(
                    session,
                    profile.storage_controller,
                    profile.disk_port,
                    profile.disk_device,
                    DeviceType::HardDisk,
                    medium,
                )
                .await?;
            self.api.save_settings(session).await
        })
        .await
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

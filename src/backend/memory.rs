//! In-memory hypervisor.
//!
//! Models the parts of VirtualBox the provisioner relies on: the machine
//! inventory, the media registry, installed extension packs and write-lock
//! sessions. Every call is recorded, and any operation can be made to fail,
//! which is how the provisioning tests observe ordering and fault handling.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{ControlApi, ExtensionPack, Machine, MachineRef, MediumRef, Session};
use crate::constants::{AccessMode, CleanupMode, DeviceType, LockType, StorageBus};
use crate::error::ImporterError;

/// SATA controllers expose 30 ports with a single device each.
const SATA_PORT_COUNT: i32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FindMachine,
    CreateMachine,
    RegisterMachine,
    UnregisterMachine,
    DeleteConfig,
    OpenMedium,
    ResizeMedium,
    ListExtensionPacks,
    LockMachine,
    AttachDevice,
    SaveSettings,
    UnlockMachine,
}

impl Operation {
    /// Whether the operation changes hypervisor state that outlives the run.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Operation::CreateMachine
                | Operation::RegisterMachine
                | Operation::UnregisterMachine
                | Operation::DeleteConfig
                | Operation::ResizeMedium
                | Operation::AttachDevice
                | Operation::SaveSettings
        )
    }

    fn api_name(self) -> &'static str {
        match self {
            Operation::FindMachine => "FindMachine",
            Operation::CreateMachine => "CreateMachine",
            Operation::RegisterMachine => "RegisterMachine",
            Operation::UnregisterMachine => "Unregister",
            Operation::DeleteConfig => "DeleteConfig",
            Operation::OpenMedium => "OpenMedium",
            Operation::ResizeMedium => "Resize",
            Operation::ListExtensionPacks => "InstalledExtPacks",
            Operation::LockMachine => "LockMachine",
            Operation::AttachDevice => "AttachDevice",
            Operation::SaveSettings => "SaveSettings",
            Operation::UnlockMachine => "UnlockMachine",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub controller: String,
    pub port: i32,
    pub device: i32,
    pub device_type: DeviceType,
    pub medium: MediumRef,
}

/// A machine in the inventory together with its saved device attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredMachine {
    pub machine: Machine,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug)]
struct OpenSession {
    machine_id: String,
    pending: Vec<Attachment>,
}

#[derive(Debug, Default)]
struct State {
    machines: Vec<RegisteredMachine>,
    media: BTreeMap<PathBuf, MediumRef>,
    deleted_media: Vec<PathBuf>,
    extension_packs: Vec<ExtensionPack>,
    sessions: BTreeMap<u64, OpenSession>,
    failing: HashSet<Operation>,
    calls: Vec<Operation>,
    unlocks: usize,
    next_id: u64,
}

impl State {
    fn begin(&mut self, op: Operation) -> Result<(), ImporterError> {
        self.calls.push(op);
        if self.failing.contains(&op) {
            return Err(ImporterError::control_api(op.api_name(), "injected failure"));
        }
        Ok(())
    }

    fn next_uuid(&mut self) -> String {
        self.next_id += 1;
        format!("{:08x}-0000-4000-8000-{:012x}", self.next_id, self.next_id)
    }

    fn machine_by_id(&mut self, id: &str) -> Option<&mut RegisteredMachine> {
        self.machines.iter_mut().find(|m| m.machine.id == id)
    }
}

#[derive(Debug, Default)]
pub struct MemoryHypervisor {
    state: Mutex<State>,
}

impl MemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a disk image at `location` known to the media registry.
    pub fn with_medium(self, location: impl Into<PathBuf>, logical_size: u64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let id = state.next_uuid();
            let location = location.into();
            state.media.insert(
                location.clone(),
                MediumRef {
                    id,
                    location,
                    logical_size,
                },
            );
        }
        self
    }

    pub fn with_extension_pack(self, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .extension_packs
            .push(ExtensionPack {
                name: name.to_string(),
                version: Some("7.0.14".into()),
            });
        self
    }

    /// Make every subsequent call of `op` fail.
    pub fn fail_on(&self, op: Operation) {
        self.state.lock().unwrap().failing.insert(op);
    }

    pub fn recover(&self, op: Operation) {
        self.state.lock().unwrap().failing.remove(&op);
    }

    pub fn machine(&self, name: &str) -> Option<RegisteredMachine> {
        let state = self.state.lock().unwrap();
        state
            .machines
            .iter()
            .find(|m| m.machine.name == name)
            .cloned()
    }

    pub fn machine_count(&self) -> usize {
        self.state.lock().unwrap().machines.len()
    }

    pub fn medium(&self, location: &Path) -> Option<MediumRef> {
        self.state.lock().unwrap().media.get(location).cloned()
    }

    pub fn deleted_media(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().deleted_media.clone()
    }

    pub fn calls(&self) -> Vec<Operation> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<Operation> {
        self.calls()
            .into_iter()
            .filter(|op| op.is_mutating())
            .collect()
    }

    pub fn active_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn unlock_count(&self) -> usize {
        self.state.lock().unwrap().unlocks
    }
}

impl ControlApi for MemoryHypervisor {
    async fn find_machine(&self, name: &str) -> Result<Option<MachineRef>, ImporterError> {
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::FindMachine)?;
        Ok(state
            .machines
            .iter()
            .find(|m| m.machine.name == name)
            .map(|m| m.machine.to_ref()))
    }

    async fn create_machine(&self, name: &str, os_type: &str) -> Result<Machine, ImporterError> {
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::CreateMachine)?;

        let settings_file = PathBuf::from(format!("/VirtualBox VMs/{name}/{name}.vbox"));
        if state
            .machines
            .iter()
            .any(|m| m.machine.name == name || m.machine.settings_file.as_ref() == Some(&settings_file))
        {
            return Err(ImporterError::control_api(
                "CreateMachine",
                format!("machine settings file '{}' already exists", settings_file.display()),
            ));
        }

        let id = state.next_uuid();
        Ok(Machine::new(id, name, os_type).with_settings_file(settings_file))
    }

    async fn register_machine(&self, machine: &Machine) -> Result<MachineRef, ImporterError> {
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::RegisterMachine)?;

        if state
            .machines
            .iter()
            .any(|m| m.machine.id == machine.id || m.machine.name == machine.name)
        {
            return Err(ImporterError::control_api(
                "RegisterMachine",
                format!("a machine named '{}' is already registered", machine.name),
            ));
        }

        state.machines.push(RegisteredMachine {
            machine: machine.clone(),
            attachments: Vec::new(),
        });
        Ok(machine.to_ref())
    }

    async fn unregister_machine(
        &self,
        machine: &MachineRef,
        mode: CleanupMode,
    ) -> Result<Vec<MediumRef>, ImporterError> {
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::UnregisterMachine)?;

        if state
            .sessions
            .values()
            .any(|s| s.machine_id == machine.id)
        {
            return Err(ImporterError::control_api(
                "Unregister",
                format!("machine '{}' is locked by a session", machine.name),
            ));
        }

        let index = state
            .machines
            .iter()
            .position(|m| m.machine.id == machine.id)
            .ok_or_else(|| {
                ImporterError::control_api(
                    "Unregister",
                    format!("machine '{}' is not registered", machine.name),
                )
            })?;

        if mode == CleanupMode::UnregisterOnly && !state.machines[index].attachments.is_empty() {
            return Err(ImporterError::control_api(
                "Unregister",
                format!("machine '{}' still has media attached", machine.name),
            ));
        }

        let removed = state.machines.remove(index);
        let media = match mode {
            CleanupMode::UnregisterOnly | CleanupMode::DetachAllReturnNone => Vec::new(),
            CleanupMode::DetachAllReturnHardDisksOnly
            | CleanupMode::Full
            | CleanupMode::DetachAllReturnHardDisksAndVmRemovable => removed
                .attachments
                .into_iter()
                .filter(|a| a.device_type == DeviceType::HardDisk)
                .map(|a| a.medium)
                .collect(),
        };
        Ok(media)
    }

    async fn delete_config(
        &self,
        machine: MachineRef,
        media: Vec<MediumRef>,
    ) -> Result<(), ImporterError> {
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::DeleteConfig)?;

        if state.machine_by_id(&machine.id).is_some() {
            return Err(ImporterError::control_api(
                "DeleteConfig",
                format!("machine '{}' is still registered", machine.name),
            ));
        }

        for medium in media {
            if state.media.remove(&medium.location).is_some() {
                state.deleted_media.push(medium.location);
            }
        }
        Ok(())
    }

    async fn open_medium(
        &self,
        location: &Path,
        _device_type: DeviceType,
        _access_mode: AccessMode,
        force_new_uuid: bool,
    ) -> Result<MediumRef, ImporterError> {
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::OpenMedium)?;

        let new_id = force_new_uuid.then(|| state.next_uuid());
        let medium = state.media.get_mut(location).ok_or_else(|| {
            ImporterError::control_api(
                "OpenMedium",
                format!("could not find file for the medium '{}'", location.display()),
            )
        })?;
        if let Some(id) = new_id {
            medium.id = id;
        }
        Ok(medium.clone())
    }

    async fn resize_medium(
        &self,
        medium: &MediumRef,
        logical_size: u64,
    ) -> Result<MediumRef, ImporterError> {
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::ResizeMedium)?;

        let stored = state
            .media
            .values_mut()
            .find(|m| m.id == medium.id)
            .ok_or_else(|| {
                ImporterError::control_api("Resize", format!("unknown medium {}", medium.id))
            })?;
        if logical_size < stored.logical_size {
            return Err(ImporterError::control_api(
                "Resize",
                "shrinking a medium is not supported",
            ));
        }
        stored.logical_size = logical_size;
        Ok(stored.clone())
    }

    async fn installed_extension_packs(&self) -> Result<Vec<ExtensionPack>, ImporterError> {
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::ListExtensionPacks)?;
        Ok(state.extension_packs.clone())
    }

    async fn lock_machine(
        &self,
        machine: &MachineRef,
        lock: LockType,
    ) -> Result<Session, ImporterError> {
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::LockMachine)?;

        if state.machine_by_id(&machine.id).is_none() {
            return Err(ImporterError::control_api(
                "LockMachine",
                format!("machine '{}' is not registered", machine.name),
            ));
        }
        if state
            .sessions
            .values()
            .any(|s| s.machine_id == machine.id)
        {
            return Err(ImporterError::control_api(
                "LockMachine",
                format!("machine '{}' is already locked", machine.name),
            ));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.sessions.insert(
            id,
            OpenSession {
                machine_id: machine.id.clone(),
                pending: Vec::new(),
            },
        );
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
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::AttachDevice)?;

        let known_medium = state.media.values().any(|m| m.id == medium.id);
        let registered = state
            .machines
            .iter()
            .find(|m| m.machine.id == session.machine.id)
            .cloned()
            .ok_or_else(|| {
                ImporterError::control_api("AttachDevice", "session machine is not registered")
            })?;

        let ctl = registered.machine.storage_controller(controller).ok_or_else(|| {
            ImporterError::control_api(
                "AttachDevice",
                format!("no storage controller named '{controller}'"),
            )
        })?;
        if ctl.bus == StorageBus::Sata && !(0..SATA_PORT_COUNT).contains(&port) {
            return Err(ImporterError::control_api(
                "AttachDevice",
                format!("port {port} out of range for '{controller}'"),
            ));
        }
        if ctl.bus == StorageBus::Sata && device != 0 {
            return Err(ImporterError::control_api(
                "AttachDevice",
                format!("device {device} out of range for '{controller}'"),
            ));
        }
        if !known_medium {
            return Err(ImporterError::control_api(
                "AttachDevice",
                format!("medium {} is not registered", medium.id),
            ));
        }

        let open = state.sessions.get_mut(&session.id).ok_or_else(|| {
            ImporterError::control_api("AttachDevice", "session is not locked")
        })?;
        let occupied = registered
            .attachments
            .iter()
            .chain(open.pending.iter())
            .any(|a| a.controller == controller && a.port == port && a.device == device);
        if occupied {
            return Err(ImporterError::control_api(
                "AttachDevice",
                format!("port {port} device {device} of '{controller}' is already in use"),
            ));
        }

        open.pending.push(Attachment {
            controller: controller.to_string(),
            port,
            device,
            device_type,
            medium: medium.clone(),
        });
        Ok(())
    }

    async fn save_settings(&self, session: &Session) -> Result<(), ImporterError> {
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::SaveSettings)?;

        let open = state.sessions.get_mut(&session.id).ok_or_else(|| {
            ImporterError::control_api("SaveSettings", "session is not locked")
        })?;
        let pending = std::mem::take(&mut open.pending);
        let machine = state.machine_by_id(&session.machine.id).ok_or_else(|| {
            ImporterError::control_api("SaveSettings", "session machine is not registered")
        })?;
        machine.attachments.extend(pending);
        Ok(())
    }

    async fn unlock_machine(&self, session: Session) -> Result<(), ImporterError> {
        let mut state = self.state.lock().unwrap();
        state.begin(Operation::UnlockMachine)?;

        // unsaved changes are discarded with the session
        state.sessions.remove(&session.id).ok_or_else(|| {
            ImporterError::control_api("UnlockMachine", "session is not locked")
        })?;
        state.unlocks += 1;
        Ok(())
    }
}

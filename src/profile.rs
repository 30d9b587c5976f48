//! Fixed hardware profile for imported EOS machines.

/// Convert gibibytes to bytes.
pub const fn gib_to_bytes(gib: u64) -> u64 {
    gib << 30
}

/// Everything about the machine that does not come from the operator.
///
/// Enum-typed settings are kept as API symbols and resolved through
/// [`crate::constants`] when the profile is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareProfile {
    pub os_type: &'static str,
    pub memory_mb: u32,
    pub vram_mb: u32,
    pub disk_size: u64,
    pub accelerate_3d: bool,
    pub accelerate_2d_video: bool,
    pub audio: bool,
    pub audio_in: bool,
    pub audio_out: bool,
    pub ioapic: bool,
    pub clipboard_mode: &'static str,
    pub pointing_hid: &'static str,
    pub rtc_use_utc: bool,
    pub storage_controller: &'static str,
    pub storage_bus: &'static str,
    pub storage_controller_type: &'static str,
    pub disk_port: i32,
    pub disk_device: i32,
    pub usb_controller: &'static str,
    pub usb_controller_type: &'static str,
    /// Extension pack that must be installed for the USB 3 controller.
    pub usb3_extension_pack: &'static str,
}

impl HardwareProfile {
    pub const HACK_OS: HardwareProfile = HardwareProfile {
        os_type: "Linux_64",
        memory_mb: 3072,
        vram_mb: 128,
        disk_size: gib_to_bytes(60),
        accelerate_3d: true,
        accelerate_2d_video: true,
        audio: true,
        audio_in: true,
        audio_out: true,
        ioapic: true,
        clipboard_mode: "Bidirectional",
        pointing_hid: "USBTablet",
        rtc_use_utc: true,
        storage_controller: "SATA Controller",
        storage_bus: "SATA",
        storage_controller_type: "IntelAhci",
        disk_port: 0,
        disk_device: 0,
        usb_controller: "USB Controller",
        usb_controller_type: "XHCI",
        usb3_extension_pack: "Oracle VM VirtualBox Extension Pack",
    };
}

impl Default for HardwareProfile {
    fn default() -> Self {
        Self::HACK_OS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_size_is_sixty_gibibytes() {
        assert_eq!(HardwareProfile::HACK_OS.disk_size, 64_424_509_440);
    }

    #[test]
    fn gib_to_bytes_shifts_by_thirty() {
        assert_eq!(gib_to_bytes(0), 0);
        assert_eq!(gib_to_bytes(1), 1_073_741_824);
        assert_eq!(gib_to_bytes(20), 21_474_836_480);
    }

    #[test]
    fn profile_symbols_resolve() {
        let profile = HardwareProfile::HACK_OS;
        assert!(crate::constants::resolve("ClipboardMode", profile.clipboard_mode).is_ok());
        assert!(crate::constants::resolve("PointingHIDType", profile.pointing_hid).is_ok());
        assert!(crate::constants::resolve("StorageBus", profile.storage_bus).is_ok());
        assert!(
            crate::constants::resolve("StorageControllerType", profile.storage_controller_type)
                .is_ok()
        );
        assert!(crate::constants::resolve("USBControllerType", profile.usb_controller_type).is_ok());
    }
}

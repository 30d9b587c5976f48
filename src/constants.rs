//! Typed table of the VirtualBox API enumerations this tool touches.
//!
//! Every constant is addressable two ways: as a Rust enum variant, and by
//! `(category, symbol)` using the API's own spelling, e.g.
//! `("StorageBus", "SATA")`. Symbol lookups that miss yield
//! [`ImporterError::UnknownConstant`].

use std::fmt;

use crate::error::ImporterError;

/// An enumeration exposed by the hypervisor control API.
pub trait ApiConstant: Copy + Sized + 'static {
    /// API name of the enumeration, e.g. `"StorageBus"`.
    const CATEGORY: &'static str;
    /// Every variant known to this build.
    const ALL: &'static [Self];

    /// API spelling of the variant, e.g. `"IntelAhci"`.
    fn symbol(self) -> &'static str;

    /// Numeric value the API expects.
    fn value(self) -> u32;

    fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.symbol() == symbol)
    }
}

macro_rules! api_constants {
    (
        $(#[$meta:meta])*
        $name:ident => $category:literal {
            $($variant:ident = $value:literal => $symbol:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
        }

        impl ApiConstant for $name {
            const CATEGORY: &'static str = $category;
            const ALL: &'static [Self] = &[$($name::$variant,)+];

            fn symbol(self) -> &'static str {
                match self {
                    $($name::$variant => $symbol,)+
                }
            }

            fn value(self) -> u32 {
                match self {
                    $($name::$variant => $value,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.symbol())
            }
        }
    };
}

api_constants! {
    /// Shared clipboard direction between host and guest.
    ClipboardMode => "ClipboardMode" {
        Disabled = 0 => "Disabled",
        HostToGuest = 1 => "HostToGuest",
        GuestToHost = 2 => "GuestToHost",
        Bidirectional = 3 => "Bidirectional",
    }
}

api_constants! {
    /// Emulated pointing device.
    PointingHidType => "PointingHIDType" {
        None = 1 => "None",
        Ps2Mouse = 2 => "PS2Mouse",
        UsbMouse = 3 => "USBMouse",
        UsbTablet = 4 => "USBTablet",
        ComboMouse = 5 => "ComboMouse",
        UsbMultiTouch = 6 => "USBMultiTouch",
    }
}

api_constants! {
    StorageBus => "StorageBus" {
        Ide = 1 => "IDE",
        Sata = 2 => "SATA",
        Scsi = 3 => "SCSI",
        Floppy = 4 => "Floppy",
        Sas = 5 => "SAS",
        Usb = 6 => "USB",
        PciExpress = 7 => "PCIe",
        VirtioScsi = 8 => "VirtioSCSI",
    }
}

api_constants! {
    StorageControllerType => "StorageControllerType" {
        LsiLogic = 1 => "LsiLogic",
        BusLogic = 2 => "BusLogic",
        IntelAhci = 3 => "IntelAhci",
        Piix3 = 4 => "PIIX3",
        Piix4 = 5 => "PIIX4",
        Ich6 = 6 => "ICH6",
        I82078 = 7 => "I82078",
        LsiLogicSas = 8 => "LsiLogicSas",
        Usb = 9 => "USB",
        NvMe = 10 => "NVMe",
        VirtioScsi = 11 => "VirtioSCSI",
    }
}

api_constants! {
    DeviceType => "DeviceType" {
        Floppy = 1 => "Floppy",
        Dvd = 2 => "DVD",
        HardDisk = 3 => "HardDisk",
        Network = 4 => "Network",
        Usb = 5 => "USB",
        SharedFolder = 6 => "SharedFolder",
    }
}

api_constants! {
    AccessMode => "AccessMode" {
        ReadOnly = 1 => "ReadOnly",
        ReadWrite = 2 => "ReadWrite",
    }
}

api_constants! {
    UsbControllerType => "USBControllerType" {
        Ohci = 1 => "OHCI",
        Ehci = 2 => "EHCI",
        Xhci = 3 => "XHCI",
    }
}

api_constants! {
    /// How much of a machine `Unregister` tears down.
    CleanupMode => "CleanupMode" {
        UnregisterOnly = 1 => "UnregisterOnly",
        DetachAllReturnNone = 2 => "DetachAllReturnNone",
        DetachAllReturnHardDisksOnly = 3 => "DetachAllReturnHardDisksOnly",
        Full = 4 => "Full",
        DetachAllReturnHardDisksAndVmRemovable = 5 => "DetachAllReturnHardDisksAndVMRemovable",
    }
}

api_constants! {
    LockType => "LockType" {
        Shared = 1 => "Shared",
        Write = 2 => "Write",
        Vm = 3 => "VM",
    }
}

impl StorageBus {
    /// Controller type VirtualBox picks for a freshly added controller on this bus.
    pub fn default_controller_type(self) -> StorageControllerType {
        match self {
            StorageBus::Ide => StorageControllerType::Piix4,
            StorageBus::Sata => StorageControllerType::IntelAhci,
            StorageBus::Scsi => StorageControllerType::LsiLogic,
            StorageBus::Floppy => StorageControllerType::I82078,
            StorageBus::Sas => StorageControllerType::LsiLogicSas,
            StorageBus::Usb => StorageControllerType::Usb,
            StorageBus::PciExpress => StorageControllerType::NvMe,
            StorageBus::VirtioScsi => StorageControllerType::VirtioScsi,
        }
    }
}

/// Look up a typed constant by its API symbol.
pub fn lookup<T: ApiConstant>(symbol: &str) -> Result<T, ImporterError> {
    T::from_symbol(symbol).ok_or_else(|| ImporterError::UnknownConstant {
        category: T::CATEGORY.to_string(),
        symbol: symbol.to_string(),
    })
}

type Resolver = fn(&str) -> Option<u32>;

const RESOLVERS: &[(&str, Resolver)] = &[
    (ClipboardMode::CATEGORY, value_of::<ClipboardMode>),
    (PointingHidType::CATEGORY, value_of::<PointingHidType>),
    (StorageBus::CATEGORY, value_of::<StorageBus>),
    (StorageControllerType::CATEGORY, value_of::<StorageControllerType>),
    (DeviceType::CATEGORY, value_of::<DeviceType>),
    (AccessMode::CATEGORY, value_of::<AccessMode>),
    (UsbControllerType::CATEGORY, value_of::<UsbControllerType>),
    (CleanupMode::CATEGORY, value_of::<CleanupMode>),
    (LockType::CATEGORY, value_of::<LockType>),
];

/// Resolve `(category, symbol)` to the numeric value the API expects.
pub fn resolve(category: &str, symbol: &str) -> Result<u32, ImporterError> {
    RESOLVERS
        .iter()
        .find(|(name, _)| *name == category)
        .and_then(|(_, resolver)| resolver(symbol))
        .ok_or_else(|| ImporterError::UnknownConstant {
            category: category.to_string(),
            symbol: symbol.to_string(),
        })
}

fn value_of<T: ApiConstant>(symbol: &str) -> Option<u32> {
    T::from_symbol(symbol).map(ApiConstant::value)
}

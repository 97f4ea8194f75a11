//! Boot targets, the verified-boot color and the arbiter's decision record.

use core::fmt;

use alloc::string::String;
use uefi::CString16;

/// Everything the device can boot into on a given power-on.
///
/// `Reboot`, `PowerOff` and `UnknownTarget` are only ever produced by the
/// Fastboot service loop; the signal probes never emit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootTarget {
    NormalBoot,
    Recovery,
    Fastboot,
    /// An Android boot image stored as a file on the EFI system partition.
    EspBootImage,
    /// A chain-loadable EFI application on the EFI system partition.
    EspEfiBinary,
    /// A boot image already resident in RAM (`-a <address>`).
    Memory,
    Charger,
    Reboot,
    PowerOff,
    UnknownTarget,
}

impl fmt::Display for BootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootTarget::NormalBoot => "boot",
            BootTarget::Recovery => "recovery",
            BootTarget::Fastboot => "fastboot",
            BootTarget::EspBootImage => "ESP bootimage",
            BootTarget::EspEfiBinary => "ESP efi binary",
            BootTarget::Memory => "RAM bootimage",
            BootTarget::Charger => "Charge mode",
            BootTarget::Reboot => "reboot",
            BootTarget::PowerOff => "power off",
            BootTarget::UnknownTarget => "unknown",
        };
        f.write_str(name)
    }
}

/// Verified-boot color reported to the OS.
///
/// Within one invocation the color only escalates; use [`BootState::escalate`]
/// rather than plain assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BootState {
    Green = 0,
    Yellow = 1,
    Orange = 2,
    Red = 3,
}

impl BootState {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Raise the color to `to` if it is worse than the current one.
    #[must_use]
    pub fn escalate(self, to: BootState) -> BootState {
        self.max(to)
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootState::Green => "GREEN",
            BootState::Yellow => "YELLOW",
            BootState::Orange => "ORANGE",
            BootState::Red => "RED",
        };
        f.write_str(name)
    }
}

/// Output of the boot-target arbiter.
///
/// Invariants:
/// - `target_address` is present exactly when `target` is [`BootTarget::Memory`].
/// - `target_path` is only present for the two ESP targets.
/// - `oneshot` is true for `bootonce-` BCB entries and the loader one-shot
///   path, false for persistent `boot-` entries.
#[derive(Debug)]
pub struct Decision {
    pub target: BootTarget,
    pub target_path: Option<CString16>,
    pub target_address: Option<u64>,
    pub oneshot: bool,
}

impl Decision {
    pub fn normal_boot() -> Self {
        Decision {
            target: BootTarget::NormalBoot,
            target_path: None,
            target_address: None,
            oneshot: true,
        }
    }
}

/// The event that caused this power-on, as reported by platform firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    PowerButton,
    UsbChargerInserted,
    AcDcChargerInserted,
    BatteryInserted,
    RtcTimer,
    Unknown,
}

impl WakeSource {
    /// Charger insertions are the only wake sources that select charge mode.
    pub fn is_charger(self) -> bool {
        matches!(
            self,
            WakeSource::UsbChargerInserted | WakeSource::AcDcChargerInserted
        )
    }
}

/// Identity strings shown in the Fastboot information block. Populated from
/// SMBIOS on product hardware; the defaults are placeholders for bring-up.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub product: String,
    pub variant: String,
    pub hw_version: String,
    pub bootloader_version: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub production_signing: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            product: String::from("unknown"),
            variant: String::from("unknown"),
            hw_version: String::from("unknown"),
            bootloader_version: String::from("unknown"),
            firmware_version: String::from("unknown"),
            serial_number: String::from("unknown"),
            production_signing: false,
        }
    }
}

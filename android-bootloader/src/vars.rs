//! The two vendor-scoped variable namespaces and their access helpers.

use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, error};
use uefi::runtime::{VariableAttributes, VariableVendor};
use uefi::{cstr16, guid, CStr16};

use crate::platform::Platform;
use crate::target::BootState;

/// Vendor GUID for the Fastboot-owned variables.
pub const FASTBOOT_VENDOR: VariableVendor =
    VariableVendor(guid!("1ac80a82-4f0c-456b-9a99-debeb431fcc1"));
/// Gummiboot's GUID, we use some of the same variables.
pub const LOADER_VENDOR: VariableVendor =
    VariableVendor(guid!("4a67b082-0a4c-41cf-b6c7-440b29bb8c4f"));

pub const MAGIC_KEY_TIMEOUT_VAR: &CStr16 = cstr16!("MagicKeyTimeout");
pub const BOOT_STATE_VAR: &CStr16 = cstr16!("BootState");
pub const OFF_MODE_CHARGE_VAR: &CStr16 = cstr16!("off-mode-charge");
pub const LOADER_ENTRY_ONESHOT_VAR: &CStr16 = cstr16!("LoaderEntryOneShot");
pub const LOADER_VERSION_VAR: &CStr16 = cstr16!("LoaderVersion");

/// Name under which `off-mode-charge` is republished to Fastboot hosts.
pub const OFF_MODE_CHARGE: &str = "off-mode-charge";

/// Default console-settle window for magic key detection, in milliseconds.
/// Keep this small, it is added to the boot time of every boot.
pub const DEFAULT_KEY_TIMEOUT_MS: u32 = 200;

fn bs_rt() -> VariableAttributes {
    VariableAttributes::BOOTSERVICE_ACCESS | VariableAttributes::RUNTIME_ACCESS
}

fn nv_bs() -> VariableAttributes {
    VariableAttributes::NON_VOLATILE | VariableAttributes::BOOTSERVICE_ACCESS
}

fn nv_bs_rt() -> VariableAttributes {
    nv_bs() | VariableAttributes::RUNTIME_ACCESS
}

/// UCS-2 little-endian encoding with a terminating NUL, the layout every
/// string-valued variable in both namespaces uses.
fn ucs2_with_nul(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .chain(core::iter::once(0))
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

fn ucs2_to_string(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Cached view of the mutable variables the policy consults more than once.
///
/// The `off-mode-charge` byte is loaded lazily and refreshed whenever the
/// setter runs, so a single boot observes one consistent value.
#[derive(Default)]
pub struct Vars {
    off_mode_charge: Option<[u8; 2]>,
}

impl Vars {
    pub const fn new() -> Self {
        Vars {
            off_mode_charge: None,
        }
    }

    /// True when the stored value is `"0"`: the charger probe must not run.
    ///
    /// Malformed or absent values read as false, which leaves charge mode
    /// available, and are not cached so a later read sees a repaired value.
    pub fn off_mode_charge_disabled<P: Platform>(&mut self, platform: &mut P) -> bool {
        if self.off_mode_charge.is_none() {
            let data = match platform.get_variable(OFF_MODE_CHARGE_VAR, &FASTBOOT_VENDOR) {
                Ok(data) => data,
                Err(_) => return false,
            };

            if data.len() != 2 || (&*data != b"0\0" && &*data != b"1\0") {
                return false;
            }

            self.off_mode_charge = Some([data[0], data[1]]);
        }

        self.off_mode_charge
            .map(|value| &value == b"0\0")
            .unwrap_or(false)
    }

    pub fn set_off_mode_charge<P: Platform>(
        &mut self,
        platform: &mut P,
        enabled: bool,
    ) -> uefi::Result {
        let value: &[u8; 2] = if enabled { b"1\0" } else { b"0\0" };
        platform.set_variable(OFF_MODE_CHARGE_VAR, &FASTBOOT_VENDOR, nv_bs(), value)?;

        self.off_mode_charge = Some(*value);
        Ok(())
    }
}

/// Read `MagicKeyTimeout`: decimal milliseconds, ASCII, NUL-terminated.
/// Anything malformed or outside 0..=1000 falls back to the default.
pub fn magic_key_timeout_ms<P: Platform>(platform: &mut P) -> u32 {
    let data = match platform.get_variable(MAGIC_KEY_TIMEOUT_VAR, &FASTBOOT_VENDOR) {
        Ok(data) if !data.is_empty() => data,
        _ => {
            debug!("Couldn't read timeout variable; assuming default");
            return DEFAULT_KEY_TIMEOUT_MS;
        }
    };

    if *data.last().unwrap() != 0 {
        debug!("bad data for magic key timeout");
        return DEFAULT_KEY_TIMEOUT_MS;
    }

    let text = match core::str::from_utf8(&data[..data.len() - 1]) {
        Ok(text) => text,
        Err(_) => {
            debug!("bad data for magic key timeout");
            return DEFAULT_KEY_TIMEOUT_MS;
        }
    };

    match text.parse::<i64>() {
        Ok(ms) if (0..=1000).contains(&ms) => ms as u32,
        _ => {
            debug!("pathological magic key timeout, use default");
            DEFAULT_KEY_TIMEOUT_MS
        }
    }
}

/// Read `LoaderEntryOneShot` and clear it, unconditionally, so the entry
/// fires at most once. Returns the stored target name, if any.
pub fn take_loader_entry_oneshot<P: Platform>(platform: &mut P) -> Option<String> {
    let data = platform
        .get_variable(LOADER_ENTRY_ONESHOT_VAR, &LOADER_VENDOR)
        .ok();

    if let Err(err) = platform.delete_variable(LOADER_ENTRY_ONESHOT_VAR, &LOADER_VENDOR) {
        if err.status() != uefi::Status::NOT_FOUND {
            error!("Failed to clear {LOADER_ENTRY_ONESHOT_VAR}: {err:?}");
        }
    }

    data.map(|data| ucs2_to_string(&data))
}

pub fn set_loader_entry_oneshot<P: Platform>(platform: &mut P, target: &str) -> uefi::Result {
    platform.set_variable(
        LOADER_ENTRY_ONESHOT_VAR,
        &LOADER_VENDOR,
        nv_bs_rt(),
        &ucs2_with_nul(target),
    )
}

/// Persist the verified-boot color. Runs immediately before every hand-off.
pub fn write_boot_state<P: Platform>(platform: &mut P, state: BootState) -> uefi::Result {
    platform.set_variable(BOOT_STATE_VAR, &FASTBOOT_VENDOR, bs_rt(), &[state.as_byte()])
}

pub fn write_loader_version<P: Platform>(platform: &mut P, version: &str) -> uefi::Result {
    platform.set_variable(
        LOADER_VERSION_VAR,
        &LOADER_VENDOR,
        bs_rt(),
        &ucs2_with_nul(version),
    )
}

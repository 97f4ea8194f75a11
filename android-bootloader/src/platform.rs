//! The capability surface the boot policy consumes from firmware.
//!
//! Everything the core does to the outside world goes through [`Platform`]:
//! the persistent variable store, console input/output, files on the EFI
//! system partition, GPT partitions, image loading and the two terminal
//! operations. The production implementation lives in
//! [`crate::firmware::FirmwarePlatform`]; unit tests substitute an in-memory
//! double.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use uefi::proto::console::text::Key;
use uefi::runtime::{VariableAttributes, VariableVendor};
use uefi::{guid, CStr16, Guid, Handle};

use crate::target::{DeviceInfo, WakeSource};

/// GPT partition type of the Android `boot` partition.
pub const BOOT_PARTITION: Guid = guid!("49a4d17f-93a3-45c1-a0de-f50b2ebe2599");
/// GPT partition type of the Android `recovery` partition.
pub const RECOVERY_PARTITION: Guid = guid!("4177c722-9e92-4aab-8644-43502bfd5506");
/// GPT partition type of the `misc` partition holding the BCB.
pub const MISC_PARTITION: Guid = guid!("ef32a33b-a409-486c-9141-9ffb711f6266");

/// A boot image ready to be handed to the Android image starter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootPayload {
    /// Image bytes loaded from a partition, the ESP or the Fastboot
    /// transport.
    Buffer(Vec<u8>),
    /// Image already resident in RAM at this physical address.
    Resident(u64),
}

pub trait Platform {
    // Persistent variable store.
    fn get_variable(&mut self, name: &CStr16, vendor: &VariableVendor)
        -> uefi::Result<Box<[u8]>>;
    fn set_variable(
        &mut self,
        name: &CStr16,
        vendor: &VariableVendor,
        attributes: VariableAttributes,
        data: &[u8],
    ) -> uefi::Result;
    fn delete_variable(&mut self, name: &CStr16, vendor: &VariableVendor) -> uefi::Result;

    // Console.
    fn stall(&mut self, microseconds: usize);
    fn reset_console(&mut self) -> uefi::Result;
    /// Non-blocking key read. `Ok(None)` means no key is pending.
    fn read_key(&mut self) -> uefi::Result<Option<Key>>;
    /// User-facing prompt text. Distinct from logging.
    fn console_write(&mut self, text: &str);

    // EFI system partition files.
    fn file_exists(&mut self, path: &CStr16) -> bool;
    fn file_delete(&mut self, path: &CStr16) -> uefi::Result;
    fn read_file(&mut self, path: &CStr16) -> uefi::Result<Vec<u8>>;

    // GPT partitions, addressed by partition type.
    fn read_partition(&mut self, partition_type: Guid) -> uefi::Result<Vec<u8>>;
    /// Write `data` at the start of the partition, leaving the remainder
    /// untouched.
    fn write_partition(&mut self, partition_type: Guid, data: &[u8]) -> uefi::Result;

    // Firmware image loading.
    fn load_image_from_path(&mut self, path: &CStr16) -> uefi::Result<Handle>;
    fn load_image_from_buffer(&mut self, image: &[u8]) -> uefi::Result<Handle>;
    fn start_image(&mut self, image: Handle) -> uefi::Result;
    fn unload_image(&mut self, image: Handle) -> uefi::Result;

    // Android hand-off.
    fn start_android_image(&mut self, payload: &BootPayload, charger: bool) -> uefi::Result;
    /// Wipe memory the next stage must not inherit. Invoked before any
    /// non-green hand-off.
    fn clear_memory(&mut self);

    // Invocation context.
    fn load_options(&mut self) -> uefi::Result<Vec<String>>;
    fn wake_source(&mut self) -> WakeSource;
    fn device_info(&self) -> &DeviceInfo;

    // Terminals.
    fn reboot(&mut self) -> !;
    fn halt(&mut self) -> !;
}

//! The production [`Platform`] over UEFI boot and runtime services.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, warn};
use uefi::mem::memory_map::MemoryMap;
use uefi::proto::console::text::Key;
use uefi::proto::device_path::build::{self, DevicePathBuilder};
use uefi::proto::device_path::DevicePath;
use uefi::proto::loaded_image::LoadedImage;
use uefi::proto::media::block::BlockIO;
use uefi::proto::media::partition::PartitionInfo;
use uefi::proto::BootPolicy;
use uefi::runtime::{ResetType, VariableAttributes, VariableVendor};
use uefi::{boot, cstr16, fs, runtime, system, CStr16, CString16, Guid, Handle, Status};

use crate::android;
use crate::platform::{BootPayload, Platform};
use crate::target::{DeviceInfo, WakeSource};
use crate::vars::FASTBOOT_VENDOR;

/// Variable the platform firmware reports the power-on cause in.
const WAKE_SOURCE_VAR: &CStr16 = cstr16!("WakeSource");

pub struct FirmwarePlatform {
    disk_device: Handle,
    device_info: DeviceInfo,
}

impl FirmwarePlatform {
    /// Capture the handles the core needs: the device this image was loaded
    /// from doubles as the ESP and the GPT disk.
    pub fn new() -> uefi::Result<Self> {
        let loaded_image =
            boot::open_protocol_exclusive::<LoadedImage>(boot::image_handle())?;
        let disk_device = loaded_image.device().ok_or(Status::NOT_FOUND)?;

        Ok(FirmwarePlatform {
            disk_device,
            device_info: DeviceInfo::default(),
        })
    }

    /// Identity strings are owned by the platform integration (SMBIOS on
    /// product hardware).
    pub fn with_device_info(mut self, device_info: DeviceInfo) -> Self {
        self.device_info = device_info;
        self
    }

    fn filesystem(&self) -> uefi::Result<fs::FileSystem> {
        let sfs = boot::get_image_file_system(boot::image_handle())?;
        Ok(fs::FileSystem::new(sfs))
    }

    /// Find the handle of the GPT partition with the given partition type.
    fn partition_handle(&self, partition_type: Guid) -> uefi::Result<Handle> {
        for handle in boot::find_handles::<PartitionInfo>()? {
            let info = match boot::open_protocol_exclusive::<PartitionInfo>(handle) {
                Ok(info) => info,
                Err(_) => continue,
            };

            if let Some(entry) = info.gpt_partition_entry() {
                let partition_type_guid = entry.partition_type_guid.0;
                if partition_type_guid == partition_type {
                    return Ok(handle);
                }
            }
        }

        Err(Status::NOT_FOUND.into())
    }

    /// Append a `FilePath` node for `path` to the boot disk's device path.
    fn file_device_path(&self, path: &CStr16, storage: &mut Vec<u8>) -> uefi::Result<()> {
        let disk_path = boot::open_protocol_exclusive::<DevicePath>(self.disk_device)?;

        let mut builder = DevicePathBuilder::with_vec(storage);
        for node in disk_path.node_iter() {
            builder = builder
                .push(&node)
                .map_err(|_| uefi::Error::from(Status::OUT_OF_RESOURCES))?;
        }
        builder
            .push(&build::media::FilePath { path_name: path })
            .map_err(|_| uefi::Error::from(Status::OUT_OF_RESOURCES))?
            .finalize()
            .map_err(|_| uefi::Error::from(Status::OUT_OF_RESOURCES))?;

        Ok(())
    }
}

fn fs_error_status(error: fs::Error) -> Status {
    match error {
        fs::Error::Io(io) => io.uefi_error.status(),
        _ => Status::INVALID_PARAMETER,
    }
}

impl Platform for FirmwarePlatform {
    fn get_variable(
        &mut self,
        name: &CStr16,
        vendor: &VariableVendor,
    ) -> uefi::Result<Box<[u8]>> {
        runtime::get_variable_boxed(name, vendor).map(|(data, _attributes)| data)
    }

    fn set_variable(
        &mut self,
        name: &CStr16,
        vendor: &VariableVendor,
        attributes: VariableAttributes,
        data: &[u8],
    ) -> uefi::Result {
        runtime::set_variable(name, vendor, attributes, data)
    }

    fn delete_variable(&mut self, name: &CStr16, vendor: &VariableVendor) -> uefi::Result {
        runtime::delete_variable(name, vendor)
    }

    fn stall(&mut self, microseconds: usize) {
        boot::stall(microseconds);
    }

    fn reset_console(&mut self) -> uefi::Result {
        system::with_stdin(|stdin| stdin.reset(false))
    }

    fn read_key(&mut self) -> uefi::Result<Option<Key>> {
        system::with_stdin(|stdin| stdin.read_key())
    }

    fn console_write(&mut self, text: &str) {
        // The console wants CRLF line endings and UCS-2 text; anything that
        // does not convert is dropped.
        let crlf = text.replace('\n', "\r\n");
        if let Ok(text) = CString16::try_from(crlf.as_str()) {
            let _ = system::with_stdout(|stdout| stdout.output_string(&text));
        }
    }

    fn file_exists(&mut self, path: &CStr16) -> bool {
        let mut filesystem = match self.filesystem() {
            Ok(filesystem) => filesystem,
            Err(_) => return false,
        };
        filesystem.try_exists(path).unwrap_or(false)
    }

    fn file_delete(&mut self, path: &CStr16) -> uefi::Result {
        self.filesystem()?
            .remove_file(path)
            .map_err(|err| fs_error_status(err).into())
    }

    fn read_file(&mut self, path: &CStr16) -> uefi::Result<Vec<u8>> {
        self.filesystem()?
            .read(path)
            .map_err(|err| fs_error_status(err).into())
    }

    fn read_partition(&mut self, partition_type: Guid) -> uefi::Result<Vec<u8>> {
        let handle = self.partition_handle(partition_type)?;
        let block_io = boot::open_protocol_exclusive::<BlockIO>(handle)?;

        let media = block_io.media();
        let block_size = media.block_size() as usize;
        let blocks = media.last_block() + 1;

        let mut data = vec![0u8; blocks as usize * block_size];
        block_io.read_blocks(media.media_id(), 0, &mut data)?;
        Ok(data)
    }

    fn write_partition(&mut self, partition_type: Guid, data: &[u8]) -> uefi::Result {
        let handle = self.partition_handle(partition_type)?;
        let mut block_io = boot::open_protocol_exclusive::<BlockIO>(handle)?;

        let media = block_io.media();
        let block_size = media.block_size() as usize;
        let media_id = media.media_id();

        if data.len() % block_size == 0 {
            return block_io.write_blocks(media_id, 0, data);
        }

        // Partial trailing block: read-modify-write the covered blocks.
        let covered = data.len().div_ceil(block_size) * block_size;
        let mut buffer = vec![0u8; covered];
        block_io.read_blocks(media_id, 0, &mut buffer)?;
        buffer[..data.len()].copy_from_slice(data);
        block_io.write_blocks(media_id, 0, &buffer)
    }

    fn load_image_from_path(&mut self, path: &CStr16) -> uefi::Result<Handle> {
        let mut storage = Vec::new();
        self.file_device_path(path, &mut storage)?;
        let device_path = <&DevicePath>::try_from(storage.as_slice())
            .map_err(|_| uefi::Error::from(Status::INVALID_PARAMETER))?;

        boot::load_image(
            boot::image_handle(),
            boot::LoadImageSource::FromDevicePath {
                device_path,
                boot_policy: BootPolicy::ExactMatch,
            },
        )
    }

    fn load_image_from_buffer(&mut self, image: &[u8]) -> uefi::Result<Handle> {
        boot::load_image(
            boot::image_handle(),
            boot::LoadImageSource::FromBuffer {
                buffer: image,
                file_path: None,
            },
        )
    }

    fn start_image(&mut self, image: Handle) -> uefi::Result {
        boot::start_image(image)
    }

    fn unload_image(&mut self, image: Handle) -> uefi::Result {
        boot::unload_image(image)
    }

    fn start_android_image(&mut self, payload: &BootPayload, charger: bool) -> uefi::Result {
        match payload {
            BootPayload::Buffer(image) => {
                android::start_image_buffer(boot::image_handle(), image, charger)
            }
            BootPayload::Resident(address) => unsafe {
                android::start_image_resident(boot::image_handle(), *address, charger)
            },
        }
    }

    fn clear_memory(&mut self) {
        let memory_map = match boot::memory_map(boot::MemoryType::LOADER_DATA) {
            Ok(map) => map,
            Err(err) => {
                warn!("Couldn't obtain the memory map, leaving memory in place: {err:?}");
                return;
            }
        };

        let mut wiped: u64 = 0;
        for descriptor in memory_map.entries() {
            if descriptor.ty != boot::MemoryType::CONVENTIONAL {
                continue;
            }

            let bytes = descriptor.page_count * 4096;
            unsafe {
                core::ptr::write_bytes(descriptor.phys_start as *mut u8, 0, bytes as usize);
            }
            wiped += bytes;
        }
        debug!("wiped {wiped} bytes of free memory");
    }

    fn load_options(&mut self) -> uefi::Result<Vec<String>> {
        let loaded_image =
            boot::open_protocol_exclusive::<LoadedImage>(boot::image_handle())?;

        let options = match loaded_image.load_options_as_cstr16() {
            Ok(options) => options.to_string(),
            // No options at all is an empty command line.
            Err(_) => return Ok(Vec::new()),
        };

        Ok(options
            .split_whitespace()
            .map(|arg| arg.to_string())
            .collect())
    }

    fn wake_source(&mut self) -> WakeSource {
        let data = match runtime::get_variable_boxed(WAKE_SOURCE_VAR, &FASTBOOT_VENDOR) {
            Ok((data, _)) => data,
            Err(_) => return WakeSource::Unknown,
        };

        match data.first() {
            Some(0) => WakeSource::PowerButton,
            Some(1) => WakeSource::UsbChargerInserted,
            Some(2) => WakeSource::AcDcChargerInserted,
            Some(3) => WakeSource::BatteryInserted,
            Some(4) => WakeSource::RtcTimer,
            _ => WakeSource::Unknown,
        }
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    fn reboot(&mut self) -> ! {
        runtime::reset(ResetType::COLD, Status::SUCCESS, None)
    }

    fn halt(&mut self) -> ! {
        runtime::reset(ResetType::SHUTDOWN, Status::SUCCESS, None)
    }
}

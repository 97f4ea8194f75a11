//! Android boot image hand-off.
//!
//! Parses the classic `boot_img_hdr` layout, serves the ramdisk to the
//! EFI-stub kernel over the `LoadFile2` initrd protocol and starts the
//! kernel through the firmware loader.

use core::ffi::c_void;
use core::pin::Pin;
use core::ptr::slice_from_raw_parts_mut;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, error};
use snafu::prelude::Snafu;
use uefi::proto::device_path::build::{self, DevicePathBuilder};
use uefi::proto::device_path::{DevicePath, FfiDevicePath};
use uefi::proto::loaded_image::LoadedImage;
use uefi::proto::unsafe_protocol;
use uefi::{boot, guid, CString16, Guid, Handle, Identify, Result, ResultExt, Status, StatusExt};

/// Android magic boot string.
pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";

/// Size of the fixed v0 header, including the supplemental command line.
pub const BOOT_HEADER_SIZE: usize = 1632;

const BOOT_ARGS_SIZE: usize = 512;
const BOOT_EXTRA_ARGS_SIZE: usize = 1024;

/// The GUID of the INITRD EFI protocol of Linux; EFI-stub kernels fetch
/// their ramdisk through it.
const LINUX_EFI_INITRD_MEDIA_GUID: Guid = guid!("5568e427-68fc-4f3d-ac74-ca555231cc68");

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum AndroidImageError {
    #[snafu(display("image too small for a boot header: {got} bytes"))]
    TooShort { got: usize },
    #[snafu(display("boot image magic mismatch"))]
    BadMagic,
    #[snafu(display("unsupported page size {got}"))]
    BadPageSize { got: u32 },
    #[snafu(display("image truncated: expected {expected} bytes, got {got}"))]
    Truncated { expected: usize, got: usize },
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn nul_terminated(field: &[u8]) -> &[u8] {
    let len = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    &field[..len]
}

/// The fields of the v0 `boot_img_hdr` this loader consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootImgHeader {
    pub kernel_size: u32,
    pub ramdisk_size: u32,
    pub second_size: u32,
    pub page_size: u32,
    pub header_version: u32,
}

impl BootImgHeader {
    pub fn parse(data: &[u8]) -> core::result::Result<Self, AndroidImageError> {
        if data.len() < BOOT_HEADER_SIZE {
            return Err(AndroidImageError::TooShort { got: data.len() });
        }
        if data[..8] != BOOT_MAGIC {
            return Err(AndroidImageError::BadMagic);
        }

        let header = BootImgHeader {
            kernel_size: read_u32(data, 8),
            ramdisk_size: read_u32(data, 16),
            second_size: read_u32(data, 24),
            page_size: read_u32(data, 36),
            header_version: read_u32(data, 40),
        };

        if !header.page_size.is_power_of_two() || header.page_size < 2048 {
            return Err(AndroidImageError::BadPageSize {
                got: header.page_size,
            });
        }

        Ok(header)
    }

    fn pages(&self, bytes: u32) -> usize {
        (bytes as usize).div_ceil(self.page_size as usize)
    }

    /// Total image size in flash: all entities are page-aligned, the header
    /// occupies the first page.
    pub fn total_size(&self) -> usize {
        let pages =
            1 + self.pages(self.kernel_size) + self.pages(self.ramdisk_size)
                + self.pages(self.second_size);
        pages * self.page_size as usize
    }
}

/// A parsed boot image: borrowed kernel and ramdisk slices plus the combined
/// kernel command line.
pub struct BootImage<'a> {
    pub header: BootImgHeader,
    pub kernel: &'a [u8],
    pub ramdisk: &'a [u8],
    pub cmdline: String,
}

impl<'a> BootImage<'a> {
    pub fn parse(data: &'a [u8]) -> core::result::Result<Self, AndroidImageError> {
        let header = BootImgHeader::parse(data)?;
        let page = header.page_size as usize;

        let kernel_offset = page;
        let ramdisk_offset = page * (1 + header.pages(header.kernel_size));
        let end = ramdisk_offset + header.ramdisk_size as usize;
        if data.len() < end {
            return Err(AndroidImageError::Truncated {
                expected: end,
                got: data.len(),
            });
        }

        let kernel = &data[kernel_offset..kernel_offset + header.kernel_size as usize];
        let ramdisk = &data[ramdisk_offset..end];

        // The supplemental command line is appended verbatim.
        let mut cmdline =
            String::from_utf8_lossy(nul_terminated(&data[64..64 + BOOT_ARGS_SIZE])).into_owned();
        cmdline.push_str(&String::from_utf8_lossy(nul_terminated(
            &data[608..608 + BOOT_EXTRA_ARGS_SIZE],
        )));

        Ok(BootImage {
            header,
            kernel,
            ramdisk,
            cmdline,
        })
    }

    /// The command line handed to the kernel. Charger hand-offs tell the OS
    /// to come up in charging mode.
    pub fn kernel_cmdline(&self, charger: bool) -> String {
        let mut cmdline = self.cmdline.clone();
        if charger {
            if !cmdline.is_empty() {
                cmdline.push(' ');
            }
            cmdline.push_str("androidboot.mode=charger");
        }
        cmdline
    }
}

/// Stores the device path the ramdisk protocol is installed under.
///
/// The allocation is covered by the UEFI memory map and stays valid for the
/// lifetime of the system, so the `'static` borrow is sound.
static RAMDISK_DEVICE_PATH: once_cell::race::OnceBox<&'static DevicePath> =
    once_cell::race::OnceBox::new();

/// The UEFI LoadFile2 protocol, with the served bytes carried inline.
#[repr(C)]
#[unsafe_protocol("4006c0c1-fcb3-403e-996d-4a6c8724e06d")]
struct LoadFile2Protocol {
    load_file: unsafe extern "efiapi" fn(
        this: &mut LoadFile2Protocol,
        file_path: *const FfiDevicePath,
        boot_policy: bool,
        buffer_size: *mut usize,
        buffer: *mut c_void,
    ) -> Status,

    // This is not part of the official protocol struct.
    ramdisk: Vec<u8>,
}

impl LoadFile2Protocol {
    fn load_file(
        &mut self,
        _file_path: Option<&FfiDevicePath>,
        _boot_policy: bool,
        buffer_size: Option<&mut usize>,
        buffer: *mut u8,
    ) -> Result<()> {
        let buffer_size = buffer_size.ok_or(uefi::Error::new(Status::INVALID_PARAMETER, ()))?;
        if buffer.is_null() || *buffer_size < self.ramdisk.len() {
            // Give the caller a hint for the right buffer size.
            *buffer_size = self.ramdisk.len();
            return Err(Status::BUFFER_TOO_SMALL.into());
        }

        let output: &mut [u8] = unsafe { &mut *slice_from_raw_parts_mut(buffer, self.ramdisk.len()) };
        output.copy_from_slice(&self.ramdisk);

        Ok(())
    }
}

unsafe extern "efiapi" fn raw_load_file(
    this: &mut LoadFile2Protocol,
    file_path: *const FfiDevicePath,
    boot_policy: bool,
    buffer_size: *mut usize,
    buffer: *mut c_void,
) -> Status {
    this.load_file(
        unsafe { file_path.as_ref() },
        boot_policy,
        unsafe { buffer_size.as_mut() },
        buffer.cast(),
    )
    .status()
}

/// A RAII wrapper to install and uninstall the ramdisk serving protocol.
///
/// **Note:** You need to call [`RamdiskLoader::uninstall`], before this is
/// dropped.
pub struct RamdiskLoader {
    proto: Pin<Box<LoadFile2Protocol>>,
    handle: Handle,
    registered: bool,
}

impl RamdiskLoader {
    /// Register the ramdisk on `handle`. The kernel finds it by looking for
    /// the vendor device path associated with the initrd media GUID.
    pub fn new(handle: Handle, ramdisk: Vec<u8>) -> Result<Self> {
        let mut proto = Box::pin(LoadFile2Protocol {
            load_file: raw_load_file,
            ramdisk,
        });

        init_ramdisk_device_path();

        unsafe {
            let mut path_buf = Vec::new();
            let device_path = build_ramdisk_device_path(&mut path_buf);
            let device_path_ptr = device_path.as_ffi_ptr().cast_mut().cast::<c_void>();

            boot::install_protocol_interface(
                Some(handle),
                &DevicePath::GUID,
                device_path_ptr,
            )?;

            let proto_ptr: *mut LoadFile2Protocol = proto.as_mut().get_mut();
            boot::install_protocol_interface(
                Some(handle),
                &LoadFile2Protocol::GUID,
                proto_ptr as *mut c_void,
            )?;
        }

        Ok(RamdiskLoader {
            proto,
            handle,
            registered: true,
        })
    }

    pub fn uninstall(&mut self) -> Result<()> {
        // This should only be called once.
        assert!(self.registered);

        let device_path_ptr = RAMDISK_DEVICE_PATH
            .get()
            .unwrap()
            .as_ffi_ptr()
            .cast_mut()
            .cast::<c_void>();

        unsafe {
            boot::uninstall_protocol_interface(self.handle, &DevicePath::GUID, device_path_ptr)?;

            let proto_ptr: *mut LoadFile2Protocol = self.proto.as_mut().get_mut();
            boot::uninstall_protocol_interface(
                self.handle,
                &LoadFile2Protocol::GUID,
                proto_ptr as *mut c_void,
            )?;
        }

        self.registered = false;

        Ok(())
    }
}

impl Drop for RamdiskLoader {
    fn drop(&mut self) {
        // Dropped without unregistering!
        assert!(!self.registered);
    }
}

/// Builds the vendor device path the kernel's EFI stub probes for its
/// initrd.
fn build_ramdisk_device_path(buf: &mut Vec<u8>) -> &DevicePath {
    DevicePathBuilder::with_vec(buf)
        .push(&build::media::Vendor {
            vendor_guid: LINUX_EFI_INITRD_MEDIA_GUID,
            vendor_defined_data: &[],
        })
        // Unwrap is fine as the vec grows to the required size automatically.
        .unwrap()
        .finalize()
        .unwrap()
}

/// Initializes the global [`RAMDISK_DEVICE_PATH`]. Idempotent.
fn init_ramdisk_device_path() {
    let _ = RAMDISK_DEVICE_PATH.get_or_init(|| {
        let mut buf = Vec::new();
        {
            let _ = build_ramdisk_device_path(&mut buf);
        }
        let device_path = buf.leak();
        let device_path =
            unsafe { core::mem::transmute::<&mut [u8], &'static DevicePath>(device_path) };
        Box::new(device_path)
    });
}

/// Start the Android boot image in `image`.
///
/// The embedded kernel is expected to carry an EFI stub; it is loaded by the
/// firmware, which is also where signature enforcement happens. Returns only
/// if the kernel could not be entered or exited early.
pub fn start_image_buffer(parent: Handle, image: &[u8], charger: bool) -> Result<()> {
    let parsed = BootImage::parse(image).map_err(|err| {
        error!("{err}");
        uefi::Error::from(Status::INVALID_PARAMETER)
    })?;
    debug!(
        "boot image: kernel {} bytes, ramdisk {} bytes, header v{}",
        parsed.header.kernel_size, parsed.header.ramdisk_size, parsed.header.header_version
    );

    let cmdline = CString16::try_from(parsed.kernel_cmdline(charger).as_str())
        .map_err(|_| uefi::Error::from(Status::INVALID_PARAMETER))?;

    let kernel = boot::load_image(
        parent,
        boot::LoadImageSource::FromBuffer {
            buffer: parsed.kernel,
            file_path: None,
        },
    )?;

    {
        let mut kernel_image = boot::open_protocol_exclusive::<LoadedImage>(kernel)?;
        unsafe {
            kernel_image.set_load_options(
                cmdline.as_ptr() as *const u8,
                // Any command line that doesn't fit 4G is surely broken.
                u32::try_from(cmdline.num_bytes()).unwrap_or(0),
            );
        }
    }

    let mut ramdisk_loader = RamdiskLoader::new(parent, parsed.ramdisk.to_vec())?;

    let status = boot::start_image(kernel).status();

    ramdisk_loader.uninstall()?;
    status.to_result()
}

/// Start a boot image already resident in RAM.
///
/// # Safety
///
/// `address` must point at a complete, readable Android boot image. The
/// declared sizes in its header are trusted to describe the mapping.
pub unsafe fn start_image_resident(parent: Handle, address: u64, charger: bool) -> Result<()> {
    let head = unsafe { core::slice::from_raw_parts(address as *const u8, BOOT_HEADER_SIZE) };
    let header = BootImgHeader::parse(head).map_err(|err| {
        error!("{err}");
        uefi::Error::from(Status::INVALID_PARAMETER)
    })?;

    let image =
        unsafe { core::slice::from_raw_parts(address as *const u8, header.total_size()) };
    start_image_buffer(parent, image, charger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const PAGE: usize = 2048;

    fn build_image(kernel: &[u8], ramdisk: &[u8], cmdline: &[u8]) -> Vec<u8> {
        let kernel_pages = kernel.len().div_ceil(PAGE);
        let ramdisk_pages = ramdisk.len().div_ceil(PAGE);
        let mut image = vec![0u8; PAGE * (1 + kernel_pages + ramdisk_pages)];

        image[..8].copy_from_slice(&BOOT_MAGIC);
        image[8..12].copy_from_slice(&(kernel.len() as u32).to_le_bytes());
        image[16..20].copy_from_slice(&(ramdisk.len() as u32).to_le_bytes());
        image[36..40].copy_from_slice(&(PAGE as u32).to_le_bytes());
        image[64..64 + cmdline.len()].copy_from_slice(cmdline);

        image[PAGE..PAGE + kernel.len()].copy_from_slice(kernel);
        let ramdisk_offset = PAGE * (1 + kernel_pages);
        image[ramdisk_offset..ramdisk_offset + ramdisk.len()].copy_from_slice(ramdisk);
        image
    }

    #[test]
    fn parses_kernel_and_ramdisk_slices() {
        let image = build_image(b"kernel-bytes", b"ramdisk-bytes", b"console=ttyS0");

        let parsed = BootImage::parse(&image).unwrap();
        assert_eq!(parsed.kernel, b"kernel-bytes");
        assert_eq!(parsed.ramdisk, b"ramdisk-bytes");
        assert_eq!(parsed.cmdline, "console=ttyS0");
    }

    #[test]
    fn total_size_counts_whole_pages() {
        let image = build_image(&[1; PAGE + 1], &[2; 10], &[]);
        let header = BootImgHeader::parse(&image).unwrap();
        // Header page + two kernel pages + one ramdisk page.
        assert_eq!(header.total_size(), PAGE * 4);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = build_image(b"k", b"r", &[]);
        image[0] = b'X';
        assert!(matches!(
            BootImage::parse(&image),
            Err(AndroidImageError::BadMagic)
        ));
    }

    #[test]
    fn rejects_short_and_truncated_images() {
        assert!(matches!(
            BootImgHeader::parse(&[0u8; 16]),
            Err(AndroidImageError::TooShort { .. })
        ));

        let mut image = build_image(b"kernel", b"ramdisk", &[]);
        image.truncate(PAGE + 1);
        assert!(matches!(
            BootImage::parse(&image),
            Err(AndroidImageError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_pathological_page_sizes() {
        let mut image = build_image(b"k", b"r", &[]);
        image[36..40].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(
            BootImgHeader::parse(&image),
            Err(AndroidImageError::BadPageSize { got: 3 })
        ));
    }

    #[test]
    fn charger_flag_extends_the_command_line() {
        let image = build_image(b"k", b"r", b"quiet");
        let parsed = BootImage::parse(&image).unwrap();

        assert_eq!(parsed.kernel_cmdline(false), "quiet");
        assert_eq!(
            parsed.kernel_cmdline(true),
            "quiet androidboot.mode=charger"
        );
    }

    #[test]
    fn ramdisk_device_path_layout() {
        // Extracted actual runtime path.
        let expected: [u8; 24] = [
            0x04, 0x03, 0x14, 0x00, 0x27, 0xe4, 0x68, 0x55, 0xfc, 0x68, 0x3d, 0x4f, 0xac, 0x74,
            0xca, 0x55, 0x52, 0x31, 0xcc, 0x68, 0x7f, 0xff, 0x04, 0x00,
        ];

        let mut buf = Vec::new();
        let path = build_ramdisk_device_path(&mut buf);
        assert_eq!(path.as_bytes(), &expected);
    }
}

#![no_main]
#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

use android_bootloader::fastboot::enter_fastboot_mode;
use android_bootloader::firmware::FirmwarePlatform;
use android_bootloader::loader::{self, BootFlowOutcome};
use android_bootloader::platform::Platform;
use android_bootloader::policy::choose_boot_target;
use android_bootloader::target::{BootState, BootTarget};
use android_bootloader::ui::MenuTransport;
use android_bootloader::vars::{self, Vars};
use log::{debug, error, warn};
use uefi::prelude::*;

/// Loader identification, written to the `LoaderVersion` variable on init.
pub static LOADER_VERSION: &str = concat!("droidboot-", env!("CARGO_PKG_VERSION"));

fn run_fastboot(
    platform: &mut FirmwarePlatform,
    vars: &mut Vars,
    state: BootState,
    ram_image: Option<u64>,
) -> ! {
    let mut transport = MenuTransport::new();
    enter_fastboot_mode(platform, vars, &mut transport, state, ram_image)
}

#[entry]
fn main() -> Status {
    uefi::helpers::init().unwrap();

    debug!("{LOADER_VERSION}");

    let mut platform = match FirmwarePlatform::new() {
        Ok(platform) => platform,
        Err(err) => {
            error!("OpenProtocol: LoadedImageProtocol: {err:?}");
            return err.status();
        }
    };
    let mut vars = Vars::new();

    if vars::write_loader_version(&mut platform, LOADER_VERSION).is_err() {
        warn!("Failed to publish the loader version");
    }

    debug!("choosing a boot target");
    // No UX prompts before this point, do not want to interfere with magic
    // key detection.
    let decision = choose_boot_target(&mut platform, &mut vars);
    debug!("selected '{}'", decision.target);

    let boot_state = BootState::Green;

    // EFI binaries are validated by the BIOS.
    if decision.target == BootTarget::EspEfiBinary {
        debug!("entering EFI binary");
        match decision.target_path.as_deref() {
            Some(path) => {
                if let Err(err) = loader::chainload_efi(&mut platform, path, decision.oneshot) {
                    error!("EFI Application exited abnormally: {err:?}");
                    platform.stall(3_000_000);
                }
            }
            None => error!("EFI binary target without a path"),
        }
        platform.reboot()
    }

    // Fastboot is interactive and unverified; a RAM image is operator
    // input by definition. Both run under the service loop.
    if decision.target == BootTarget::Fastboot || decision.target == BootTarget::Memory {
        debug!("entering Fastboot mode");
        if decision.target == BootTarget::Fastboot {
            loader::try_esp_fastboot_image(&mut platform, decision.oneshot, boot_state);
        }
        run_fastboot(&mut platform, &mut vars, boot_state, decision.target_address)
    }

    match loader::boot_flow(&mut platform, decision) {
        BootFlowOutcome::Started(result) => result.status(),
        BootFlowOutcome::EnterFastboot { color } => {
            run_fastboot(&mut platform, &mut vars, color, None)
        }
    }
}

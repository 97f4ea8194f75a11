//! The Fastboot service loop.
//!
//! The wire protocol itself (USB transport, command parser, flashing) lives
//! behind the [`Transport`] trait. This module owns what happens around a
//! session: publishing device variables, dispatching whatever the session
//! resolved to, and the terminal behavior when the transport dies.

use alloc::vec::Vec;
use log::error;
use uefi::Status;

use crate::loader;
use crate::platform::{BootPayload, Platform};
use crate::target::{BootState, BootTarget};
use crate::vars::{self, Vars};

/// How long a fatal error stays on screen before the machine halts.
const FATAL_PAUSE_US: usize = 30 * 1_000_000;

/// What a single Fastboot session resolved to.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The host downloaded an Android boot image (`fastboot boot`).
    BootImage(Vec<u8>),
    /// The host downloaded a chain-loadable EFI binary.
    EfiImage(Vec<u8>),
    /// The session ended with a request to enter another target.
    Target(BootTarget),
}

/// A Fastboot session provider. `serve` blocks until the session resolves;
/// a hard error means the transport itself is unusable.
pub trait Transport<P: Platform> {
    /// Expose a device variable to `getvar`.
    fn publish(&mut self, name: &str, value: &str);

    fn serve(&mut self, platform: &mut P) -> uefi::Result<SessionOutcome>;
}

/// Set the off-mode-charge variable from an OEM command argument
/// (`oem off-mode-charge <0|1>`) and refresh the published value.
pub fn oem_off_mode_charge<P: Platform, T: Transport<P>>(
    platform: &mut P,
    vars: &mut Vars,
    transport: &mut T,
    value: &str,
) -> uefi::Result {
    let enabled = match value {
        "1" => true,
        "0" => false,
        _ => {
            error!("Please specify 1 or 0 to enable/disable charge mode");
            return Err(Status::INVALID_PARAMETER.into());
        }
    };

    vars.set_off_mode_charge(platform, enabled)?;
    publish_variables(platform, vars, transport);
    Ok(())
}

/// Handle `oem reboot <target>`: arm the loader one-shot, then reboot.
pub fn oem_reboot<P: Platform>(platform: &mut P, target: &str) -> uefi::Result {
    vars::set_loader_entry_oneshot(platform, target)?;
    platform.console_write(&alloc::format!("Rebooting to {target} ...\n"));
    platform.reboot()
}

fn publish_variables<P: Platform, T: Transport<P>>(
    platform: &mut P,
    vars: &mut Vars,
    transport: &mut T,
) {
    // Published value is the inverse of the stored byte; hosts depend on it.
    let value = if vars.off_mode_charge_disabled(platform) {
        "1"
    } else {
        "0"
    };
    transport.publish(vars::OFF_MODE_CHARGE, value);
}

fn start_efi_image<P: Platform>(platform: &mut P, image: &[u8]) {
    let handle = match platform.load_image_from_buffer(image) {
        Ok(handle) => handle,
        Err(err) => {
            error!("Unable to load the received EFI image: {err:?}");
            return;
        }
    };

    if let Err(err) = platform.start_image(handle) {
        error!("Unable to start the received EFI image: {err:?}");
    }
    let _ = platform.unload_image(handle);
}

/// Enter Fastboot mode and never come back.
///
/// `ram_image`, when present, is the `-a <address>` payload: a user-provided
/// image that is started once before the first session. Every hand-off out
/// of the loop re-reports the current color first.
pub fn enter_fastboot_mode<P: Platform, T: Transport<P>>(
    platform: &mut P,
    vars: &mut Vars,
    transport: &mut T,
    boot_state: BootState,
    ram_image: Option<u64>,
) -> ! {
    // Untrusted interaction is about to begin; report the color up front.
    if let Err(err) = vars::write_boot_state(platform, boot_state) {
        error!("Failed to write boot state: {err:?}");
    }

    if let Some(address) = ram_image {
        let _ = loader::hand_off(
            platform,
            &BootPayload::Resident(address),
            boot_state,
            false,
        );
    }

    loop {
        publish_variables(platform, vars, transport);

        let outcome = match transport.serve(platform) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Fastboot mode failed: {err:?}");
                break;
            }
        };

        match outcome {
            SessionOutcome::BootImage(image) => {
                let _ = loader::hand_off(
                    platform,
                    &BootPayload::Buffer(image),
                    boot_state,
                    false,
                );
            }
            SessionOutcome::EfiImage(image) => {
                // Chain-loaded binaries return here; the session continues.
                start_efi_image(platform, &image);
            }
            SessionOutcome::Target(BootTarget::Fastboot) => {
                // Arm the one-shot, then reboot. Two steps, in this order.
                if let Err(err) = vars::set_loader_entry_oneshot(platform, "bootloader") {
                    error!("Failed to set one-shot target: {err:?}");
                }
                platform.reboot()
            }
            SessionOutcome::Target(BootTarget::Reboot) => platform.reboot(),
            SessionOutcome::Target(BootTarget::PowerOff) => platform.halt(),
            SessionOutcome::Target(target @ (BootTarget::NormalBoot | BootTarget::Recovery)) => {
                match loader::load_boot_image(platform, target, None, None, false) {
                    Ok(payload) => {
                        let _ = loader::hand_off(platform, &payload, boot_state, false);
                    }
                    Err(err) => error!("Couldn't load bootimage: {err:?}"),
                }
            }
            SessionOutcome::Target(_) => {}
        }
    }

    // Allow plenty of time for the error to be visible before the screen
    // goes blank.
    platform.stall(FATAL_PAUSE_US);
    platform.halt()
}

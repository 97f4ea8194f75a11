//! Image loading and hand-off.
//!
//! Fetches the bytes a [`Decision`] points at, reports the verified-boot
//! color, and runs the degraded-path ladder when loading fails.

use log::{debug, error};
use uefi::{cstr16, CStr16, Status};

use crate::platform::{BootPayload, Platform, BOOT_PARTITION, RECOVERY_PARTITION};
use crate::target::{BootState, BootTarget, Decision};
use crate::vars;

/// Path to the Fastboot image on the ESP.
pub const FASTBOOT_PATH: &CStr16 = cstr16!("\\fastboot.img");

/// Terminal verdict of the normal boot path.
#[derive(Debug)]
pub enum BootFlowOutcome {
    /// The image was handed off; carries the result of the start call.
    Started(uefi::Result),
    /// Both the requested target and Recovery failed to load. The device can
    /// only be unbricked through Fastboot.
    EnterFastboot { color: BootState },
}

/// Load the boot image a decision names.
///
/// `NormalBoot` and `Charger` read the `boot` partition, `Recovery` the
/// `recovery` partition, `EspBootImage` a file on the ESP (deleted after a
/// successful read when one-shot), `Memory` a pre-resident RAM image. Other
/// targets have no loadable image.
pub fn load_boot_image<P: Platform>(
    platform: &mut P,
    target: BootTarget,
    target_path: Option<&CStr16>,
    target_address: Option<u64>,
    oneshot: bool,
) -> uefi::Result<BootPayload> {
    let payload = match target {
        BootTarget::NormalBoot | BootTarget::Charger => {
            BootPayload::Buffer(platform.read_partition(BOOT_PARTITION)?)
        }
        BootTarget::Recovery => BootPayload::Buffer(platform.read_partition(RECOVERY_PARTITION)?),
        BootTarget::EspBootImage => {
            // "fastboot boot" case
            let path = target_path.ok_or(Status::INVALID_PARAMETER)?;
            let image = platform.read_file(path)?;
            if oneshot {
                if let Err(err) = platform.file_delete(path) {
                    error!("Couldn't delete {path}: {err:?}");
                }
            }
            BootPayload::Buffer(image)
        }
        BootTarget::Memory => {
            BootPayload::Resident(target_address.ok_or(Status::INVALID_PARAMETER)?)
        }
        _ => return Err(Status::INVALID_PARAMETER.into()),
    };

    debug!("boot image loaded");
    Ok(payload)
}

/// Start a loaded image with the given color, wiping memory first on any
/// non-green boot so untrusted paths do not inherit bootloader state.
fn start_with_state<P: Platform>(
    platform: &mut P,
    payload: &BootPayload,
    state: BootState,
    charger: bool,
) -> uefi::Result {
    if state != BootState::Green {
        platform.clear_memory();
    }

    let result = platform.start_android_image(payload, charger);
    if let Err(err) = &result {
        error!("Couldn't load Boot image: {err:?}");
    }
    result
}

/// Report the color, then start the image. The color reaches the variable
/// store before control can leave this system.
pub fn hand_off<P: Platform>(
    platform: &mut P,
    payload: &BootPayload,
    state: BootState,
    charger: bool,
) -> uefi::Result {
    if let Err(err) = vars::write_boot_state(platform, state) {
        error!("Failed to write boot state: {err:?}");
    }

    debug!("chainloading boot image, boot state is {state}");
    start_with_state(platform, payload, state, charger)
}

/// Chain-load an EFI application from the ESP, optionally deleting the file
/// before entering it. EFI binaries are validated by the firmware. Returns
/// once the application exits; the caller is expected to reboot.
pub fn chainload_efi<P: Platform>(
    platform: &mut P,
    path: &CStr16,
    delete: bool,
) -> uefi::Result {
    let image = platform.load_image_from_path(path)?;

    if delete {
        if let Err(err) = platform.file_delete(path) {
            error!("Couldn't delete {path}: {err:?}");
        }
    }

    let result = platform.start_image(image);
    let _ = platform.unload_image(image);
    result
}

/// A Fastboot image dropped on the ESP takes precedence over the built-in
/// service loop. Failures fall through to the caller.
pub fn try_esp_fastboot_image<P: Platform>(platform: &mut P, oneshot: bool, state: BootState) {
    if !platform.file_exists(FASTBOOT_PATH) {
        return;
    }

    match load_boot_image(
        platform,
        BootTarget::EspBootImage,
        Some(FASTBOOT_PATH),
        None,
        oneshot,
    ) {
        Ok(payload) => {
            let _ = hand_off(platform, &payload, state, false);
        }
        Err(err) => error!("Couldn't load {FASTBOOT_PATH}: {err:?}"),
    }
}

/// The normal boot path with its fall-back ladder.
///
/// One retry: after the first load failure the target is rewritten to
/// Recovery, and a failure with the target already Recovery is terminal.
/// `AccessDenied` means verification refused the image and escalates the
/// color to red before falling back.
pub fn boot_flow<P: Platform>(platform: &mut P, decision: Decision) -> BootFlowOutcome {
    let mut color = BootState::Green;
    let mut target = decision.target;
    let mut target_path = decision.target_path;
    let mut oneshot = decision.oneshot;

    loop {
        debug!("loading boot image");
        let loaded = load_boot_image(
            platform,
            target,
            target_path.as_deref(),
            decision.target_address,
            oneshot,
        );
        target_path = None;

        match loaded {
            Ok(payload) => {
                let charger = target == BootTarget::Charger;
                return BootFlowOutcome::Started(hand_off(platform, &payload, color, charger));
            }
            Err(err) => {
                debug!("couldn't load boot image: {err:?}");

                if err.status() == Status::ACCESS_DENIED {
                    color = color.escalate(BootState::Red);
                }

                // Recovery itself is unverified. The only way to un-hose
                // this device is through Fastboot.
                if target == BootTarget::Recovery {
                    debug!("recovery image is bad");
                    return BootFlowOutcome::EnterFastboot {
                        color: BootState::Red,
                    };
                }

                debug!("fall back to recovery console");
                target = BootTarget::Recovery;
                oneshot = false;
            }
        }
    }
}

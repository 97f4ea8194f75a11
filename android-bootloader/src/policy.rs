//! Boot-target selection.
//!
//! Six independent signal probes, consulted in a fixed priority order; the
//! first one proposing anything other than a normal boot wins. Probe-local
//! failures never abort the boot, they degrade to `NormalBoot`.

use alloc::format;
use alloc::string::String;
use log::{debug, error};
use uefi::{cstr16, CStr16, CString16};

use crate::bcb;
use crate::platform::Platform;
use crate::target::{BootTarget, Decision};
use crate::vars::{self, Vars};

/// If we find this in the root of the EFI system partition, unconditionally
/// load the Fastboot image.
pub const FASTBOOT_SENTINEL: &CStr16 = cstr16!("\\force_fastboot");

/// Interval in ms to check on startup for initial press of the magic key.
const DETECT_KEY_STALL_TIME_MS: u32 = 1;

/// Time in µs between key reads to check if the key is being actively held.
/// Smaller stall values result in false reporting of no key pressed on
/// several devices.
const HOLD_KEY_STALL_TIME: usize = 500 * 1000;

/// How many hold-loop iterations make up the 4 s Fastboot hold window.
const FASTBOOT_HOLD_ITERATIONS: usize = 8;

/// Choose what to boot on this power-on.
///
/// Policy, in priority order:
/// 1. `-a <address>` on the command line: boot an image already in RAM.
/// 2. The `\force_fastboot` sentinel on the ESP.
/// 3. The magic key: released within the hold window selects Recovery,
///    held for the full window selects Fastboot.
/// 4. The bootloader control block, which may name a partition target or an
///    image on the ESP, one-shot or persistent.
/// 5. `LoaderEntryOneShot`.
/// 6. The charger/wake-source probe.
///
/// Probes 4 and 5 consume their backing store when consulted; probes after
/// the winning one are never run.
pub fn choose_boot_target<P: Platform>(platform: &mut P, vars: &mut Vars) -> Decision {
    let mut decision = Decision::normal_boot();

    let (target, address) = check_command_line(platform);
    if target != BootTarget::NormalBoot {
        decision.target = target;
        decision.target_address = address;
        return decision;
    }

    decision.target = check_fastboot_sentinel(platform);
    if decision.target != BootTarget::NormalBoot {
        return decision;
    }

    decision.target = check_magic_key(platform);
    if decision.target != BootTarget::NormalBoot {
        return decision;
    }

    let (target, path, oneshot) = check_bcb(platform);
    decision.oneshot = oneshot;
    if target != BootTarget::NormalBoot {
        decision.target = target;
        decision.target_path = path;
        return decision;
    }

    decision.target = check_loader_entry_one_shot(platform);
    if decision.target != BootTarget::NormalBoot {
        return decision;
    }

    decision.target = check_charge_mode(platform, vars);
    decision
}

fn parse_address(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse::<u64>().ok()
    }
}

/// Probe 1: the loaded-image command line. `-a <address>` boots an Android
/// image already resident in RAM. Any unrecognized argument past argv[0]
/// invalidates the whole command line.
fn check_command_line<P: Platform>(platform: &mut P) -> (BootTarget, Option<u64>) {
    debug!("checking loader command line");

    let args = match platform.load_options() {
        Ok(args) => args,
        Err(_) => return (BootTarget::NormalBoot, None),
    };

    let mut address = None;
    let mut pos = 0;
    while pos < args.len() {
        debug!("Argument {}: {}", pos, args[pos]);

        if args[pos] == "-a" {
            pos += 1;
            let raw = match args.get(pos) {
                Some(raw) => raw,
                None => {
                    error!("-a requires a memory address");
                    return (BootTarget::NormalBoot, None);
                }
            };

            match parse_address(raw) {
                Some(parsed) => address = Some(parsed),
                None => {
                    error!("couldn't parse memory address '{raw}'");
                    return (BootTarget::NormalBoot, None);
                }
            }
        } else if pos > 0 {
            error!("unexpected argument {}", args[pos]);
            return (BootTarget::NormalBoot, None);
        }
        // Firmware only populates the image name as argv[0] when invoked
        // from a shell; tolerate it.

        pos += 1;
    }

    match address {
        Some(address) => (BootTarget::Memory, Some(address)),
        None => (BootTarget::NormalBoot, None),
    }
}

/// Probe 2: presence of the Fastboot sentinel file. Never deleted.
fn check_fastboot_sentinel<P: Platform>(platform: &mut P) -> BootTarget {
    debug!("checking ESP for {FASTBOOT_SENTINEL}");

    if platform.file_exists(FASTBOOT_SENTINEL) {
        BootTarget::Fastboot
    } else {
        BootTarget::NormalBoot
    }
}

fn drain_keys<P: Platform>(platform: &mut P) {
    while let Ok(Some(_)) = platform.read_key() {}
}

/// Probe 3: the magic key. A press caught within the settle window arms hold
/// detection: releasing selects Recovery, surviving the full window selects
/// Fastboot.
fn check_magic_key<P: Platform>(platform: &mut P) -> BootTarget {
    debug!("checking for magic key");
    let _ = platform.reset_console();

    // Some systems require a short stall before we can be sure there wasn't
    // a keypress at boot; the settle window is platform-provisioned.
    let wait_ms = vars::magic_key_timeout_ms(platform);
    debug!("Reset wait time: {wait_ms}");

    let mut key = None;
    let mut elapsed_ms = 0;
    loop {
        if let Ok(Some(pressed)) = platform.read_key() {
            key = Some(pressed);
            break;
        }
        if elapsed_ms >= wait_ms {
            break;
        }
        platform.stall(DETECT_KEY_STALL_TIME_MS as usize * 1000);
        elapsed_ms += DETECT_KEY_STALL_TIME_MS;
    }

    if key.is_none() {
        return BootTarget::NormalBoot;
    }

    platform.console_write(&format!(
        "Continue holding key for {} seconds to force Fastboot mode.\n",
        FASTBOOT_HOLD_ITERATIONS * HOLD_KEY_STALL_TIME / 1_000_000
    ));
    platform.console_write("Release key now to load Recovery Console.");

    let mut held = true;
    for _ in 0..FASTBOOT_HOLD_ITERATIONS {
        platform.stall(HOLD_KEY_STALL_TIME);

        match platform.read_key() {
            Ok(Some(_)) => {}
            _ => {
                held = false;
                break;
            }
        }
        platform.console_write(".");

        // Flush any stacked up key events in the queue before we sleep
        // again.
        drain_keys(platform);
    }

    let target = if held {
        platform.console_write("FASTBOOT\n");
        BootTarget::Fastboot
    } else {
        platform.console_write("RECOVERY\n");
        BootTarget::Recovery
    };

    // In case we need to prompt the user about something, don't continue
    // until the key is released.
    loop {
        platform.stall(HOLD_KEY_STALL_TIME);

        match platform.read_key() {
            Ok(Some(_)) => drain_keys(platform),
            _ => break,
        }
    }

    target
}

/// Map a BCB target name onto a boot target. ESP paths must exist and be
/// longer than the bare `.efi` suffix.
fn map_bcb_target<P: Platform>(
    platform: &mut P,
    name: &str,
) -> (BootTarget, Option<CString16>) {
    if name.starts_with('\\') {
        let path = match CString16::try_from(name) {
            Ok(path) => path,
            Err(_) => {
                error!("BCB file '{name}' appears to be malformed");
                return (BootTarget::NormalBoot, None);
            }
        };

        if !platform.file_exists(&path) {
            error!("Specified BCB file '{name}' doesn't exist");
            return (BootTarget::NormalBoot, None);
        }

        if name.len() > 4 {
            let target = match name.get(name.len() - 4..) {
                Some(suffix) if suffix.eq_ignore_ascii_case(".efi") => BootTarget::EspEfiBinary,
                _ => BootTarget::EspBootImage,
            };
            return (target, Some(path));
        }

        error!("BCB file '{name}' appears to be malformed");
        return (BootTarget::NormalBoot, None);
    }

    match name {
        "fastboot" | "bootloader" => (BootTarget::Fastboot, None),
        "recovery" => (BootTarget::Recovery, None),
        _ => {
            error!("Unknown boot target in BCB: '{name}'");
            (BootTarget::NormalBoot, None)
        }
    }
}

/// Probe 4: the bootloader control block on `misc`.
///
/// `bootonce-` commands are cleared back to disk before the decision is
/// acted on, so the entry fires at most once across normal shutdowns; the
/// write-back is best-effort.
fn check_bcb<P: Platform>(platform: &mut P) -> (BootTarget, Option<CString16>, bool) {
    debug!("checking bootloader control block");
    let mut oneshot = false;

    let mut bcb = match bcb::read_bcb(platform) {
        Ok(bcb) => bcb,
        Err(_) => {
            error!("Unable to read BCB");
            return (BootTarget::NormalBoot, None, oneshot);
        }
    };

    let target: Option<String> = if let Some(name) = bcb.command().strip_prefix(b"boot-") {
        let name = String::from_utf8_lossy(name).into_owned();
        debug!("BCB boot target: '{name}'");
        Some(name)
    } else if let Some(name) = bcb.command().strip_prefix(b"bootonce-") {
        let name = String::from_utf8_lossy(name).into_owned();
        bcb.clear_command();
        debug!("BCB oneshot boot target: '{name}'");
        oneshot = true;
        Some(name)
    } else {
        None
    };

    if bcb::write_bcb(platform, &bcb).is_err() {
        error!("Unable to update BCB contents!");
    }

    match target {
        Some(name) => {
            let (target, path) = map_bcb_target(platform, &name);
            (target, path, oneshot)
        }
        None => (BootTarget::NormalBoot, None, oneshot),
    }
}

/// Probe 5: the loader one-shot variable, consumed on every read.
fn check_loader_entry_one_shot<P: Platform>(platform: &mut P) -> BootTarget {
    debug!("checking {}", vars::LOADER_ENTRY_ONESHOT_VAR);

    let target = match vars::take_loader_entry_oneshot(platform) {
        Some(target) => target,
        None => return BootTarget::NormalBoot,
    };

    match target.as_str() {
        "" => BootTarget::NormalBoot,
        "fastboot" | "bootloader" => BootTarget::Fastboot,
        "recovery" => BootTarget::Recovery,
        "charging" => BootTarget::Charger,
        _ => {
            error!("Unknown oneshot boot target: '{target}'");
            BootTarget::NormalBoot
        }
    }
}

/// Probe 6: enter charge mode when a charger woke the device and off-mode
/// charging has not been disabled.
fn check_charge_mode<P: Platform>(platform: &mut P, vars: &mut Vars) -> BootTarget {
    if vars.off_mode_charge_disabled(platform) {
        return BootTarget::NormalBoot;
    }

    if platform.wake_source().is_charger() {
        BootTarget::Charger
    } else {
        BootTarget::NormalBoot
    }
}

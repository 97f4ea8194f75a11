//! The interactive Fastboot menu.
//!
//! A cyclic list of boot actions plus a device-information block, rendered
//! over the console seam. Volume-down (or arrow-down) cycles the selection,
//! volume-up (or arrow-up) confirms it.

use alloc::format;
use alloc::string::String;
use log::debug;
use uefi::proto::console::text::{Key, ScanCode};

use crate::fastboot::{SessionOutcome, Transport};
use crate::platform::Platform;
use crate::target::BootTarget;

/// Poll interval of the menu event loop, in µs.
const EVENT_POLL_INTERVAL: usize = 50 * 1000;

#[derive(Debug, Clone, Copy)]
pub struct MenuEntry {
    pub label: &'static str,
    pub target: BootTarget,
}

pub const MENU_ACTIONS: [MenuEntry; 5] = [
    MenuEntry {
        label: "start",
        target: BootTarget::NormalBoot,
    },
    MenuEntry {
        label: "restartbootloader",
        target: BootTarget::Fastboot,
    },
    MenuEntry {
        label: "recoverymode",
        target: BootTarget::Recovery,
    },
    MenuEntry {
        label: "reboot",
        target: BootTarget::Reboot,
    },
    MenuEntry {
        label: "power_off",
        target: BootTarget::PowerOff,
    },
];

/// A user-interface event, decoded from raw key input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    Up,
    Down,
    Other,
}

pub fn decode_key(key: &Key) -> UiEvent {
    match key {
        Key::Special(ScanCode::UP) | Key::Special(ScanCode::VOLUME_UP) => UiEvent::Up,
        Key::Special(ScanCode::DOWN) | Key::Special(ScanCode::VOLUME_DOWN) => UiEvent::Down,
        _ => UiEvent::Other,
    }
}

/// The cyclic action menu.
#[derive(Debug, Default)]
pub struct Menu {
    current: usize,
}

impl Menu {
    pub fn new() -> Self {
        Menu { current: 0 }
    }

    pub fn selected(&self) -> &MenuEntry {
        &MENU_ACTIONS[self.current]
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % MENU_ACTIONS.len();
    }

    /// Handle one input event. `Up` resolves to the selected target, `Down`
    /// cycles, everything else leaves the menu as it is.
    pub fn handle_event<P: Platform>(&mut self, platform: &mut P, event: UiEvent) -> BootTarget {
        match event {
            UiEvent::Up => self.selected().target,
            UiEvent::Down => {
                self.advance();
                // TODO: cycling should repaint the info block as well;
                // draw_menu leaves it stale.
                self.draw_menu(platform);
                BootTarget::UnknownTarget
            }
            UiEvent::Other => BootTarget::UnknownTarget,
        }
    }

    fn draw_menu<P: Platform>(&self, platform: &mut P) {
        let mut text = String::from("\n");
        for (index, entry) in MENU_ACTIONS.iter().enumerate() {
            let marker = if index == self.current { "> " } else { "  " };
            text.push_str(&format!("{marker}{}\n", entry.label));
        }
        text.push_str("\nVolume DOWN button to choose boot option\n");
        text.push_str("Volume UP button to select boot option\n");
        platform.console_write(&text);
    }

    fn draw_info<P: Platform>(&self, platform: &mut P) {
        let info = platform.device_info().clone();
        let signing = if info.production_signing {
            "PRODUCTION"
        } else {
            "DEVELOPMENT"
        };

        let text = format!(
            "\nFASTBOOT MODE\n\n\
             PRODUCT NAME - {}\n\
             VARIANT - {}\n\
             HW_VERSION - {}\n\
             BOOTLOADER VERSION - {}\n\
             IFWI VERSION - {}\n\
             SERIAL NUMBER - {}\n\
             SIGNING - {signing}\n",
            info.product,
            info.variant,
            info.hw_version,
            info.bootloader_version,
            info.firmware_version,
            info.serial_number,
        );
        platform.console_write(&text);
    }

    pub fn refresh<P: Platform>(&self, platform: &mut P) {
        self.draw_menu(platform);
        self.draw_info(platform);
    }
}

/// The in-tree [`Transport`]: an interactive session driven entirely by the
/// menu. A wire transport replaces this on hosts that flash over USB.
pub struct MenuTransport {
    menu: Menu,
    initialized: bool,
    published: alloc::vec::Vec<(String, String)>,
}

impl MenuTransport {
    pub fn new() -> Self {
        MenuTransport {
            menu: Menu::new(),
            initialized: false,
            published: alloc::vec::Vec::new(),
        }
    }

    /// The device variables published so far, latest value per name.
    pub fn published(&self) -> &[(String, String)] {
        &self.published
    }
}

impl Default for MenuTransport {
    fn default() -> Self {
        MenuTransport::new()
    }
}

impl<P: Platform> Transport<P> for MenuTransport {
    fn publish(&mut self, name: &str, value: &str) {
        debug!("publishing {name}: {value}");
        self.published.retain(|(existing, _)| existing != name);
        self.published.push((String::from(name), String::from(value)));
    }

    fn serve(&mut self, platform: &mut P) -> uefi::Result<SessionOutcome> {
        if !self.initialized {
            self.menu.refresh(platform);
            platform.reset_console()?;
            self.initialized = true;
        }

        loop {
            match platform.read_key()? {
                Some(key) => {
                    let target = self.menu.handle_event(platform, decode_key(&key));
                    if target != BootTarget::UnknownTarget {
                        return Ok(SessionOutcome::Target(target));
                    }
                }
                None => platform.stall(EVENT_POLL_INTERVAL),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlatform;

    fn special(code: ScanCode) -> Key {
        Key::Special(code)
    }

    #[test]
    fn menu_cycles_through_all_actions() {
        let mut platform = MockPlatform::new();
        let mut menu = Menu::new();

        assert_eq!(menu.selected().target, BootTarget::NormalBoot);
        let order = [
            BootTarget::Fastboot,
            BootTarget::Recovery,
            BootTarget::Reboot,
            BootTarget::PowerOff,
            BootTarget::NormalBoot,
        ];
        for expected in order {
            let target = menu.handle_event(&mut platform, UiEvent::Down);
            assert_eq!(target, BootTarget::UnknownTarget);
            assert_eq!(menu.selected().target, expected);
        }
    }

    #[test]
    fn select_returns_the_current_target() {
        let mut platform = MockPlatform::new();
        let mut menu = Menu::new();

        menu.handle_event(&mut platform, UiEvent::Down);
        assert_eq!(
            menu.handle_event(&mut platform, UiEvent::Up),
            BootTarget::Fastboot
        );
    }

    #[test]
    fn other_events_do_nothing() {
        let mut platform = MockPlatform::new();
        let mut menu = Menu::new();

        assert_eq!(
            menu.handle_event(&mut platform, UiEvent::Other),
            BootTarget::UnknownTarget
        );
        assert_eq!(menu.selected().target, BootTarget::NormalBoot);
    }

    #[test]
    fn volume_and_arrow_keys_decode_alike() {
        assert_eq!(decode_key(&special(ScanCode::UP)), UiEvent::Up);
        assert_eq!(decode_key(&special(ScanCode::VOLUME_UP)), UiEvent::Up);
        assert_eq!(decode_key(&special(ScanCode::DOWN)), UiEvent::Down);
        assert_eq!(decode_key(&special(ScanCode::VOLUME_DOWN)), UiEvent::Down);
        assert_eq!(decode_key(&special(ScanCode::ESCAPE)), UiEvent::Other);
    }

    #[test]
    fn serve_resolves_on_selection() {
        let mut platform = MockPlatform::new();
        // Cycle once, then confirm: restartbootloader.
        platform.push_key(special(ScanCode::VOLUME_DOWN));
        platform.push_key(special(ScanCode::VOLUME_UP));

        let mut transport = MenuTransport::new();
        let outcome = Transport::<MockPlatform>::serve(&mut transport, &mut platform).unwrap();
        assert!(matches!(
            outcome,
            SessionOutcome::Target(BootTarget::Fastboot)
        ));
        assert!(platform.console.contains("FASTBOOT MODE"));
        assert!(platform.console.contains("restartbootloader"));
    }
}

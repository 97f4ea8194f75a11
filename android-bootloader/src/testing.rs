//! In-memory [`Platform`] double backing the unit tests.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;
use uefi::proto::console::text::Key;
use uefi::runtime::{VariableAttributes, VariableVendor};
use uefi::{CStr16, Char16, Guid, Handle, Status};

use crate::platform::{BootPayload, Platform};
use crate::target::{DeviceInfo, WakeSource};

/// Side effects the mock records, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ClearedMemory,
    StartedAndroidImage { resident: bool, charger: bool },
    StartedEfiImage,
    UnloadedEfiImage,
    DeletedFile(String),
    Reboot,
    Halt,
}

pub struct MockPlatform {
    vars: BTreeMap<(String, String), Vec<u8>>,
    files: BTreeMap<String, Vec<u8>>,
    pub partitions: BTreeMap<Guid, Vec<u8>>,
    pub fail_partition_reads: BTreeMap<Guid, Status>,
    pub fail_partition_writes: BTreeMap<Guid, Status>,
    keys: VecDeque<Option<Key>>,
    pub args: Vec<String>,
    pub wake: WakeSource,
    pub console: String,
    pub info: DeviceInfo,
    events: Rc<RefCell<Vec<Event>>>,
}

fn var_key(vendor: &VariableVendor, name: &str) -> (String, String) {
    (vendor.0.to_string(), name.to_string())
}

/// An arbitrary printable key for scripting key-press traces.
pub fn key() -> Key {
    Key::Printable(Char16::try_from('x').unwrap())
}

/// Run a code path that ends in a mock terminal (reboot or halt), swallowing
/// the panic the mock uses to model "never returns".
pub fn catch_terminal<F: FnOnce()>(f: F) {
    let hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));
    let result = std::panic::catch_unwind(core::panic::AssertUnwindSafe(f));
    std::panic::set_hook(hook);
    assert!(result.is_err(), "expected a terminal reboot or halt");
}

impl MockPlatform {
    pub fn new() -> Self {
        MockPlatform {
            vars: BTreeMap::new(),
            files: BTreeMap::new(),
            partitions: BTreeMap::new(),
            fail_partition_reads: BTreeMap::new(),
            fail_partition_writes: BTreeMap::new(),
            keys: VecDeque::new(),
            args: Vec::new(),
            wake: WakeSource::PowerButton,
            console: String::new(),
            info: DeviceInfo::default(),
            events: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn set_var(&mut self, vendor: &VariableVendor, name: &str, data: Vec<u8>) {
        self.vars.insert(var_key(vendor, name), data);
    }

    pub fn var(&self, vendor: &VariableVendor, name: &str) -> Option<Vec<u8>> {
        self.vars.get(&var_key(vendor, name)).cloned()
    }

    pub fn has_var(&self, vendor: &VariableVendor, name: &str) -> bool {
        self.vars.contains_key(&var_key(vendor, name))
    }

    pub fn set_oneshot_entry(&mut self, target: &str) {
        let data: Vec<u8> = target
            .encode_utf16()
            .chain(core::iter::once(0))
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        self.set_var(&crate::vars::LOADER_VENDOR, "LoaderEntryOneShot", data);
    }

    pub fn add_file(&mut self, path: &str, data: &[u8]) {
        self.files.insert(path.to_string(), data.to_vec());
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn push_key(&mut self, key: Key) {
        self.keys.push_back(Some(key));
    }

    pub fn push_no_key(&mut self) {
        self.keys.push_back(None);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    fn fake_handle() -> Handle {
        unsafe { Handle::from_ptr(0x1000 as *mut core::ffi::c_void) }.unwrap()
    }
}

impl Platform for MockPlatform {
    fn get_variable(
        &mut self,
        name: &CStr16,
        vendor: &VariableVendor,
    ) -> uefi::Result<Box<[u8]>> {
        self.var(vendor, &name.to_string())
            .map(Vec::into_boxed_slice)
            .ok_or(Status::NOT_FOUND.into())
    }

    fn set_variable(
        &mut self,
        name: &CStr16,
        vendor: &VariableVendor,
        _attributes: VariableAttributes,
        data: &[u8],
    ) -> uefi::Result {
        self.set_var(vendor, &name.to_string(), data.to_vec());
        Ok(())
    }

    fn delete_variable(&mut self, name: &CStr16, vendor: &VariableVendor) -> uefi::Result {
        match self.vars.remove(&var_key(vendor, &name.to_string())) {
            Some(_) => Ok(()),
            None => Err(Status::NOT_FOUND.into()),
        }
    }

    fn stall(&mut self, _microseconds: usize) {}

    fn reset_console(&mut self) -> uefi::Result {
        Ok(())
    }

    fn read_key(&mut self) -> uefi::Result<Option<Key>> {
        Ok(self.keys.pop_front().flatten())
    }

    fn console_write(&mut self, text: &str) {
        self.console.push_str(text);
    }

    fn file_exists(&mut self, path: &CStr16) -> bool {
        self.files.contains_key(&path.to_string())
    }

    fn file_delete(&mut self, path: &CStr16) -> uefi::Result {
        let path = path.to_string();
        match self.files.remove(&path) {
            Some(_) => {
                self.record(Event::DeletedFile(path));
                Ok(())
            }
            None => Err(Status::NOT_FOUND.into()),
        }
    }

    fn read_file(&mut self, path: &CStr16) -> uefi::Result<Vec<u8>> {
        self.files
            .get(&path.to_string())
            .cloned()
            .ok_or(Status::NOT_FOUND.into())
    }

    fn read_partition(&mut self, partition_type: Guid) -> uefi::Result<Vec<u8>> {
        if let Some(status) = self.fail_partition_reads.get(&partition_type) {
            return Err((*status).into());
        }
        self.partitions
            .get(&partition_type)
            .cloned()
            .ok_or(Status::NOT_FOUND.into())
    }

    fn write_partition(&mut self, partition_type: Guid, data: &[u8]) -> uefi::Result {
        if let Some(status) = self.fail_partition_writes.get(&partition_type) {
            return Err((*status).into());
        }

        let stored = self.partitions.entry(partition_type).or_default();
        if stored.len() < data.len() {
            stored.resize(data.len(), 0);
        }
        stored[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn load_image_from_path(&mut self, _path: &CStr16) -> uefi::Result<Handle> {
        Ok(Self::fake_handle())
    }

    fn load_image_from_buffer(&mut self, _image: &[u8]) -> uefi::Result<Handle> {
        Ok(Self::fake_handle())
    }

    fn start_image(&mut self, _image: Handle) -> uefi::Result {
        self.record(Event::StartedEfiImage);
        Ok(())
    }

    fn unload_image(&mut self, _image: Handle) -> uefi::Result {
        self.record(Event::UnloadedEfiImage);
        Ok(())
    }

    fn start_android_image(&mut self, payload: &BootPayload, charger: bool) -> uefi::Result {
        self.record(Event::StartedAndroidImage {
            resident: matches!(payload, BootPayload::Resident(_)),
            charger,
        });
        Ok(())
    }

    fn clear_memory(&mut self) {
        self.record(Event::ClearedMemory);
    }

    fn load_options(&mut self) -> uefi::Result<Vec<String>> {
        Ok(self.args.clone())
    }

    fn wake_source(&mut self) -> WakeSource {
        self.wake
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn reboot(&mut self) -> ! {
        self.record(Event::Reboot);
        panic!("reboot");
    }

    fn halt(&mut self) -> ! {
        self.record(Event::Halt);
        panic!("halt");
    }
}

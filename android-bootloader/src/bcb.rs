//! Bootloader control block codec.
//!
//! The BCB is a fixed 2 KiB record at the start of the `misc` partition,
//! shared with recovery and the OS. Only `command` and `status` are
//! interpreted here; the remaining fields pass through untouched.

use alloc::vec::Vec;
use log::debug;
use snafu::prelude::Snafu;

use crate::platform::{Platform, MISC_PARTITION};

pub const BCB_SIZE: usize = 2048;

const COMMAND_SIZE: usize = 32;
const STATUS_SIZE: usize = 32;
const RECOVERY_SIZE: usize = 768;
const STAGE_SIZE: usize = 32;
const RESERVED_SIZE: usize = 1184;

#[derive(Debug, Snafu)]
pub enum BcbError {
    #[snafu(display("misc partition too small for a bootloader message: {got} bytes"))]
    TooShort { got: usize },
}

/// In-memory copy of the on-disk `bootloader_message` record.
#[derive(Debug)]
pub struct BootloaderMessage {
    command: [u8; COMMAND_SIZE],
    status: [u8; STATUS_SIZE],
    recovery: [u8; RECOVERY_SIZE],
    stage: [u8; STAGE_SIZE],
    reserved: [u8; RESERVED_SIZE],
}

fn take<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut field = [0u8; N];
    field.copy_from_slice(&data[offset..offset + N]);
    field
}

fn nul_terminated(field: &[u8]) -> &[u8] {
    let len = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    &field[..len]
}

impl BootloaderMessage {
    pub fn from_bytes(data: &[u8]) -> Result<Self, BcbError> {
        if data.len() < BCB_SIZE {
            return Err(BcbError::TooShort { got: data.len() });
        }

        Ok(BootloaderMessage {
            command: take(data, 0),
            status: take(data, COMMAND_SIZE),
            recovery: take(data, COMMAND_SIZE + STATUS_SIZE),
            stage: take(data, COMMAND_SIZE + STATUS_SIZE + RECOVERY_SIZE),
            reserved: take(data, COMMAND_SIZE + STATUS_SIZE + RECOVERY_SIZE + STAGE_SIZE),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(BCB_SIZE);
        data.extend_from_slice(&self.command);
        data.extend_from_slice(&self.status);
        data.extend_from_slice(&self.recovery);
        data.extend_from_slice(&self.stage);
        data.extend_from_slice(&self.reserved);
        data
    }

    /// The command string, without its NUL terminator.
    pub fn command(&self) -> &[u8] {
        nul_terminated(&self.command)
    }

    pub fn clear_command(&mut self) {
        self.command[0] = 0;
    }

    pub fn clear_status(&mut self) {
        self.status = [0; STATUS_SIZE];
    }

    #[cfg(test)]
    pub fn set_command(&mut self, command: &[u8]) {
        self.command = [0; COMMAND_SIZE];
        self.command[..command.len()].copy_from_slice(command);
    }
}

/// Read the BCB from `misc`. The returned copy has its `status` field
/// cleared: this system owns `status` and never preserves stale data.
pub fn read_bcb<P: Platform>(platform: &mut P) -> uefi::Result<BootloaderMessage> {
    let data = platform.read_partition(MISC_PARTITION)?;

    let mut bcb = BootloaderMessage::from_bytes(&data).map_err(|err| {
        debug!("{err}");
        uefi::Error::from(uefi::Status::INVALID_PARAMETER)
    })?;

    bcb.clear_status();
    Ok(bcb)
}

pub fn write_bcb<P: Platform>(platform: &mut P, bcb: &BootloaderMessage) -> uefi::Result {
    platform.write_partition(MISC_PARTITION, &bcb.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlatform;

    fn misc_with_pattern() -> Vec<u8> {
        (0..BCB_SIZE as u32).map(|i| (i % 251 + 1) as u8).collect()
    }

    #[test]
    fn round_trip_only_zeroes_status() {
        let mut platform = MockPlatform::new();
        platform.partitions.insert(MISC_PARTITION, misc_with_pattern());

        let bcb = read_bcb(&mut platform).unwrap();
        write_bcb(&mut platform, &bcb).unwrap();

        let mut expected = misc_with_pattern();
        // Status owned by the bootloader, zeroed on read.
        expected[COMMAND_SIZE..COMMAND_SIZE + STATUS_SIZE].fill(0);
        assert_eq!(platform.partitions[&MISC_PARTITION], expected);
    }

    #[test]
    fn short_partition_is_rejected() {
        let mut platform = MockPlatform::new();
        platform
            .partitions
            .insert(MISC_PARTITION, alloc::vec![0; 512]);

        let err = read_bcb(&mut platform).unwrap_err();
        assert_eq!(err.status(), uefi::Status::INVALID_PARAMETER);
    }

    #[test]
    fn command_accessor_stops_at_nul() {
        let mut data = alloc::vec![0u8; BCB_SIZE];
        data[..5].copy_from_slice(b"boot-");
        data[5..13].copy_from_slice(b"recovery");

        let bcb = BootloaderMessage::from_bytes(&data).unwrap();
        assert_eq!(bcb.command(), b"boot-recovery");
    }

    #[test]
    fn clear_command_truncates_to_empty() {
        let mut data = alloc::vec![0u8; BCB_SIZE];
        data[..9].copy_from_slice(b"bootonce-");

        let mut bcb = BootloaderMessage::from_bytes(&data).unwrap();
        bcb.clear_command();
        assert_eq!(bcb.command(), b"");
    }
}

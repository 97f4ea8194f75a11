#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod android;
pub mod bcb;
pub mod fastboot;
pub mod firmware;
pub mod loader;
pub mod platform;
pub mod policy;
pub mod target;
pub mod ui;
pub mod vars;

#[cfg(test)]
pub(crate) mod testing;

//! `udpih` is a USB device that exploits the Wii U's USB host stack.
//!
//! It presents three identities to the console one after another. The
//! configuration descriptors of the first two shape and corrupt the host
//! stack's heap; the last one lands on top of a control transfer manager
//! and queues a forged transfer whose completion pivots the stack into a
//! ROP chain. That chain installs a kernel binary which loads a recovery
//! image from the SD card.
//!
//! The device side is split into:
//! 1. [`descriptor`]: answers every control request, driven by the
//! [`blueprint`] tables.
//! 2. [`device`]: the sequence of identities.
//! 3. [`engine`]: control transfer stages on top of a [`engine::Controller`],
//! implemented by [`sim`] and, on Linux, by `gadget`.
//!
//! [`recovery`] and [`trigger`] hold the logic that runs on the console.

pub use bytes;
pub use rusb;

pub mod blueprint;
pub mod ch9;
pub mod descriptor;
pub mod device;
pub mod engine;
pub mod error;
#[cfg(target_os = "linux")]
pub mod gadget;
pub mod layout;
pub mod payload;
pub mod recovery;
pub mod rop;
pub mod sim;
pub mod timer;
pub mod trigger;
pub mod usb;

#[cfg(target_os = "linux")]
#[macro_use]
extern crate nix;

pub use error::{Error, Result};

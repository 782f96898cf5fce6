use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("the {what} payload is {size:#x} bytes but only {limit:#x} bytes fit.")]
    PayloadTooBig {
        what: &'static str,
        size: usize,
        limit: usize,
    },
    #[error("the event queue is full.")]
    QueueFull,
    #[error("the event queue was closed.")]
    QueueClosed,
    #[error("the device stalled request {0:#x}.")]
    Stalled(u8),
    #[error("the device got stuck in {0:?}.")]
    Stuck(crate::device::State),
    #[error("due to an I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[cfg(target_os = "linux")]
    #[error("raw gadget request failed: {0}")]
    GadgetError(#[from] nix::Error),
    #[error("due an unknown usb error: {0}")]
    UnknownUsbError(#[from] rusb::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

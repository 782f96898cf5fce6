//! A [`Controller`] on top of the Linux raw gadget interface.
//!
//! The UDC answers `SET_ADDRESS` by itself and takes care of the status
//! stage of IN requests, so only the remaining stages reach
//! `/dev/raw-gadget`. Pull-up control goes through the UDC's
//! `soft_connect` attribute.

use crate::ch9::{
    ControlRequest, Direction, Speed, EP0_IN, SETUP_PACKET_SIZE, USB_REQ_SET_CONFIGURATION,
};
use crate::descriptor::EP0_BUFFER_SIZE;
use crate::engine::{Controller, Event, EventSink};
use crate::error::Result;
use nix::errno::Errno;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

pub const RAW_GADGET_PATH: &str = "/dev/raw-gadget";

/// Longest UDC driver or device name the kernel accepts.
const UDC_NAME_LENGTH_MAX: usize = 128;

mod sys {
    use super::{EP0_BUFFER_SIZE, SETUP_PACKET_SIZE, UDC_NAME_LENGTH_MAX};

    pub const EVENT_CONNECT: u32 = 1;
    pub const EVENT_CONTROL: u32 = 2;
    pub const EVENT_SUSPEND: u32 = 3;
    pub const EVENT_RESUME: u32 = 4;
    pub const EVENT_RESET: u32 = 5;
    pub const EVENT_DISCONNECT: u32 = 6;

    pub const SPEED_FULL: u8 = 2;
    pub const SPEED_HIGH: u8 = 3;

    #[repr(C)]
    pub struct Init {
        pub driver_name: [u8; UDC_NAME_LENGTH_MAX],
        pub device_name: [u8; UDC_NAME_LENGTH_MAX],
        pub speed: u8,
    }

    #[repr(C)]
    pub struct EventHeader {
        pub kind: u32,
        pub length: u32,
    }

    #[repr(C)]
    pub struct ControlEvent {
        pub header: EventHeader,
        pub data: [u8; SETUP_PACKET_SIZE],
    }

    #[repr(C)]
    pub struct EpIoHeader {
        pub ep: u16,
        pub flags: u16,
        pub length: u32,
    }

    #[repr(C)]
    pub struct ControlIo {
        pub header: EpIoHeader,
        pub data: [u8; EP0_BUFFER_SIZE],
    }

    ioctl_write_ptr!(raw_init, b'U', 0, Init);
    ioctl_none!(raw_run, b'U', 1);
    ioctl_read!(raw_event_fetch, b'U', 2, EventHeader);
    ioctl_write_ptr!(raw_ep0_write, b'U', 3, EpIoHeader);
    ioctl_readwrite!(raw_ep0_read, b'U', 4, EpIoHeader);
    ioctl_none!(raw_configure, b'U', 9);
    ioctl_none!(raw_ep0_stall, b'U', 12);
}

/// Which UDC to bind to and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GadgetConfig {
    /// UDC driver name, `dummy_udc` for dummy_hcd.
    pub driver: String,
    /// UDC device name, `dummy_udc.0` for dummy_hcd.
    pub device: String,
    pub speed: Speed,
}

pub struct RawGadget {
    config: GadgetConfig,
    file: Arc<File>,
    sink: EventSink,
    /// The latest SETUP, shared with the reader thread.
    request: Arc<Mutex<Option<ControlRequest>>>,
    io: Box<sys::ControlIo>,
}

impl RawGadget {
    /// Opens `/dev/raw-gadget`. Nothing is bound until
    /// [`Controller::initialize`].
    pub fn open(config: GadgetConfig, sink: EventSink) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(RAW_GADGET_PATH)?;

        Ok(RawGadget {
            config,
            file: Arc::new(file),
            sink,
            request: Arc::new(Mutex::new(None)),
            io: Box::new(sys::ControlIo {
                header: sys::EpIoHeader {
                    ep: 0,
                    flags: 0,
                    length: 0,
                },
                data: [0; EP0_BUFFER_SIZE],
            }),
        })
    }

    fn soft_connect(&self, command: &str) -> Result<()> {
        let path: PathBuf = ["/sys/class/udc", &self.config.device, "soft_connect"]
            .iter()
            .collect();
        log::debug!("{} > {}", command, path.display());
        fs::write(path, command)?;
        Ok(())
    }

    fn ep0_write(&mut self, data: &[u8]) -> Result<usize> {
        self.io.header.length = data.len() as u32;
        self.io.data[..data.len()].copy_from_slice(data);
        let io = &*self.io as *const sys::ControlIo as *const sys::EpIoHeader;
        let written = unsafe { sys::raw_ep0_write(self.file.as_raw_fd(), io)? };
        Ok(written as usize)
    }

    fn ep0_read(&mut self, length: usize) -> Result<usize> {
        self.io.header.length = length as u32;
        let io = &mut *self.io as *mut sys::ControlIo as *mut sys::EpIoHeader;
        let read = unsafe { sys::raw_ep0_read(self.file.as_raw_fd(), io)? };
        Ok(read as usize)
    }

    fn last_request(&self) -> Option<ControlRequest> {
        *lock(&self.request)
    }

    fn spawn_reader(&self) -> Result<()> {
        let file = self.file.clone();
        let sink = self.sink.clone();
        let request = self.request.clone();

        thread::Builder::new()
            .name("raw-gadget".into())
            .spawn(move || loop {
                let event = match fetch_event(&file) {
                    Ok(event) => event,
                    Err(err) => {
                        log::error!("fetching gadget event failed: {}", err);
                        return;
                    }
                };
                let event = match event {
                    Some(event) => event,
                    None => continue,
                };
                if let Event::Setup(setup) = event {
                    *lock(&request) = Some(setup);
                }
                if sink.send(event).is_err() {
                    return;
                }
            })?;

        Ok(())
    }
}

impl Controller for RawGadget {
    fn initialize(&mut self) -> Result<()> {
        let init = sys::Init {
            driver_name: udc_name(&self.config.driver)?,
            device_name: udc_name(&self.config.device)?,
            speed: match self.config.speed {
                Speed::Full => sys::SPEED_FULL,
                Speed::High => sys::SPEED_HIGH,
            },
        };

        let fd = self.file.as_raw_fd();
        unsafe {
            sys::raw_init(fd, &init)?;
            sys::raw_run(fd)?;
        }
        log::info!(
            "bound to {} ({}) at {:?} speed",
            self.config.device,
            self.config.driver,
            self.config.speed
        );

        self.spawn_reader()
    }

    fn set_address(&mut self, address: u8) -> Result<()> {
        log::debug!("address {} is handled by the UDC", address);
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        self.soft_connect("connect")
    }

    fn disconnect(&mut self) -> Result<()> {
        self.soft_connect("disconnect")
    }

    fn start_transfer(&mut self, endpoint: u8, data: &[u8]) -> Result<()> {
        let request = self.last_request();
        let out_request = request.map_or(false, |r| r.direction() == Direction::Out);

        let length = match Direction::from_bits(endpoint) {
            // acknowledges an OUT request
            Direction::In if out_request => {
                if request.map_or(false, |r| r.request == USB_REQ_SET_CONFIGURATION) {
                    unsafe { sys::raw_configure(self.file.as_raw_fd())? };
                }
                self.ep0_read(0)?
            }
            Direction::In => self.ep0_write(data)?,
            // the UDC finishes IN requests by itself
            Direction::Out if data.is_empty() => 0,
            Direction::Out => self.ep0_read(data.len())?,
        };

        self.sink.post(Event::TransferComplete { endpoint, length })
    }

    fn stall(&mut self, endpoint: u8) -> Result<()> {
        // one stall covers both directions of the control pipe
        if endpoint == EP0_IN {
            unsafe { sys::raw_ep0_stall(self.file.as_raw_fd())? };
        }
        Ok(())
    }

    fn speed(&self) -> Speed {
        self.config.speed
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn udc_name(name: &str) -> Result<[u8; UDC_NAME_LENGTH_MAX]> {
    let mut out = [0; UDC_NAME_LENGTH_MAX];
    // keep room for the terminator
    if name.len() >= UDC_NAME_LENGTH_MAX {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "UDC name too long").into());
    }
    out[..name.len()].copy_from_slice(name.as_bytes());
    Ok(out)
}

/// Blocks until the gadget reports an event.
fn fetch_event(file: &File) -> Result<Option<Event>> {
    let mut event = sys::ControlEvent {
        header: sys::EventHeader {
            kind: 0,
            length: SETUP_PACKET_SIZE as u32,
        },
        data: [0; SETUP_PACKET_SIZE],
    };
    let raw = &mut event as *mut sys::ControlEvent as *mut sys::EventHeader;

    match unsafe { sys::raw_event_fetch(file.as_raw_fd(), raw) } {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    Ok(decode_event(event.header.kind, &event.data))
}

fn decode_event(kind: u32, data: &[u8; SETUP_PACKET_SIZE]) -> Option<Event> {
    match kind {
        sys::EVENT_CONNECT | sys::EVENT_RESET => Some(Event::BusReset),
        sys::EVENT_CONTROL => Some(Event::Setup(ControlRequest::parse(data))),
        sys::EVENT_SUSPEND => Some(Event::Suspended),
        sys::EVENT_DISCONNECT => Some(Event::Disconnected),
        sys::EVENT_RESUME => None,
        kind => {
            log::warn!("unknown gadget event {}", kind);
            None
        }
    }
}

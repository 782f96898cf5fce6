//! An in-memory bus and a scripted model of the victim's enumeration.
//!
//! [`Simulation`] plays the host: it resets the bus, assigns an address,
//! reads the device descriptor and every configuration the way the victim's
//! host stack does, then configures the device. Time only advances when
//! the state timer fires.

use crate::ch9::{
    ConfigDescriptor, ControlRequest, Direction, Speed, EP0_IN, USB_DT_CONFIG,
    USB_DT_CONFIG_SIZE, USB_DT_DEVICE, USB_DT_DEVICE_SIZE,
};
use crate::descriptor::Responder;
use crate::device::{Identity, State};
use crate::engine::{channel, Controller, ControlEngine, Event, EventQueue, EventSink};
use crate::error::{Error, Result};
use crate::payload::Payloads;
use crate::timer::ManualTimer;
use bytes::Bytes;
use std::time::Duration;

/// Something the engine did to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    SetAddress(u8),
    Connect,
    Disconnect,
    Transfer { endpoint: u8, data: Bytes },
    Stall(u8),
}

/// A controller that records every operation and completes transfers at
/// once.
#[derive(Debug)]
pub struct SimController {
    speed: Speed,
    sink: EventSink,
    connected: bool,
    address: u8,
    ops: Vec<BusOp>,
}

impl SimController {
    pub fn new(speed: Speed, sink: EventSink) -> Self {
        SimController {
            speed,
            sink,
            connected: false,
            address: 0,
            ops: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn ops(&self) -> &[BusOp] {
        &self.ops
    }

    /// Returns the operations recorded so far and forgets them.
    pub fn take_ops(&mut self) -> Vec<BusOp> {
        std::mem::take(&mut self.ops)
    }
}

impl Controller for SimController {
    fn initialize(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn set_address(&mut self, address: u8) -> Result<()> {
        self.address = address;
        self.ops.push(BusOp::SetAddress(address));
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        self.ops.push(BusOp::Connect);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.ops.push(BusOp::Disconnect);
        self.sink.post(Event::Disconnected)
    }

    fn start_transfer(&mut self, endpoint: u8, data: &[u8]) -> Result<()> {
        self.ops.push(BusOp::Transfer {
            endpoint,
            data: Bytes::copy_from_slice(data),
        });
        self.sink.post(Event::TransferComplete {
            endpoint,
            length: data.len(),
        })
    }

    fn stall(&mut self, endpoint: u8) -> Result<()> {
        self.ops.push(BusOp::Stall(endpoint));
        Ok(())
    }

    fn speed(&self) -> Speed {
        self.speed
    }
}

/// One handled event and the state it left the device in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub at: Duration,
    pub event: Event,
    pub state: State,
}

/// A configuration read as the host saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigRead {
    pub index: u16,
    pub requested: u16,
    pub received: usize,
    pub total_length: u16,
}

/// Everything read during one enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumeration {
    pub identity: Option<Identity>,
    pub address: u8,
    pub reads: Vec<ConfigRead>,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub enumerations: Vec<Enumeration>,
    pub trace: Vec<Step>,
    pub elapsed: Duration,
    /// The last configuration descriptor delivered.
    pub final_descriptor: Bytes,
}

pub struct Simulation {
    engine: ControlEngine<SimController, ManualTimer>,
    queue: EventQueue,
    clock: Duration,
    trace: Vec<Step>,
    last_descriptor: Bytes,
}

impl Simulation {
    pub fn new(speed: Speed, max_packet_size: u8, payloads: Payloads) -> Self {
        let (sink, queue) = channel(8);
        let engine = ControlEngine::new(
            SimController::new(speed, sink),
            ManualTimer::default(),
            Responder::bind(max_packet_size, payloads),
        );

        Simulation {
            engine,
            queue,
            clock: Duration::ZERO,
            trace: Vec::new(),
            last_descriptor: Bytes::new(),
        }
    }

    /// Enumerates until the device presents its terminal identity and all
    /// of its configurations were read.
    pub fn run(mut self) -> Result<Report> {
        self.engine.start()?;

        let mut enumerations = Vec::new();
        // one enumeration per identity
        for address in 1..=3 {
            let enumeration = self.enumerate(address)?;
            log::info!(
                "enumerated {:?} with {} configuration reads",
                enumeration.identity,
                enumeration.reads.len()
            );
            enumerations.push(enumeration);

            if self.engine.session().state().is_terminal() {
                return Ok(Report {
                    enumerations,
                    trace: self.trace,
                    elapsed: self.clock,
                    final_descriptor: self.last_descriptor,
                });
            }

            while let Some(delay) = self.engine.timer_mut().take() {
                self.clock += delay;
                self.dispatch(Event::StateTimer)?;
            }
            if !self.engine.controller().is_connected() {
                return Err(Error::Stuck(self.engine.session().state()));
            }
        }

        Err(Error::Stuck(self.engine.session().state()))
    }

    fn enumerate(&mut self, address: u8) -> Result<Enumeration> {
        self.dispatch(Event::BusReset)?;
        self.control(ControlRequest::set_address(address))?;

        let device = self.control(ControlRequest::get_descriptor(
            USB_DT_DEVICE,
            0,
            0,
            USB_DT_DEVICE_SIZE as u16,
        ))?;
        let count = device.get(USB_DT_DEVICE_SIZE - 1).copied().unwrap_or(0);

        let mut reads = Vec::new();
        // the victim starts every read with the length of the previous one
        let mut requested = USB_DT_CONFIG_SIZE as u16;
        for index in 0..count as u16 {
            let data = self.read_config(index, requested, &mut reads)?;
            let total_length = ConfigDescriptor::total_length_of(&data);
            if total_length as usize != data.len() {
                requested = total_length;
                self.read_config(index, requested, &mut reads)?;
            }
        }

        self.control(ControlRequest::set_configuration(1))?;

        Ok(Enumeration {
            identity: Identity::from_configuration_count(count),
            address: self.engine.controller().address(),
            reads,
        })
    }

    fn read_config(
        &mut self,
        index: u16,
        requested: u16,
        reads: &mut Vec<ConfigRead>,
    ) -> Result<Bytes> {
        let data = self.control(ControlRequest::get_descriptor(
            USB_DT_CONFIG,
            0,
            index,
            requested,
        ))?;
        reads.push(ConfigRead {
            index,
            requested,
            received: data.len(),
            total_length: ConfigDescriptor::total_length_of(&data),
        });
        self.last_descriptor = data.clone();
        Ok(data)
    }

    /// Runs a whole control transfer and returns the IN data stage.
    fn control(&mut self, request: ControlRequest) -> Result<Bytes> {
        self.engine.controller_mut().take_ops();
        self.dispatch(Event::Setup(request))?;

        let mut data = Bytes::new();
        for op in self.engine.controller_mut().take_ops() {
            match op {
                BusOp::Stall(_) => return Err(Error::Stalled(request.request)),
                BusOp::Transfer { endpoint, data: sent }
                    if endpoint == EP0_IN && request.direction() == Direction::In =>
                {
                    data = sent;
                }
                _ => {}
            }
        }
        Ok(data)
    }

    /// Handles `event` and everything it queues.
    fn dispatch(&mut self, event: Event) -> Result<()> {
        self.step(event)?;
        while let Some(event) = self.queue.try_recv() {
            self.step(event)?;
        }
        Ok(())
    }

    fn step(&mut self, event: Event) -> Result<()> {
        self.engine.handle(event)?;
        self.trace.push(Step {
            at: self.clock,
            event,
            state: self.engine.session().state(),
        });
        Ok(())
    }
}

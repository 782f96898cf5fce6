//! The control transfer engine.
//!
//! Hardware specifics live behind [`Controller`]. Interrupt handlers (or a
//! reader thread) turn bus activity into [`Event`]s and post them to a fixed
//! capacity queue; the engine drains the queue on a single thread and drives
//! the SETUP, DATA and STATUS stages of every control transfer.

use crate::ch9::{ControlRequest, Direction, Speed, EP0_IN, EP0_OUT, USB_DIR_OUT, USB_REQ_SET_ADDRESS};
use crate::descriptor::{Reply, Responder, EP0_BUFFER_SIZE};
use crate::device::{Action, Session};
use crate::error::{Error, Result};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::time::Duration;

/// The queue has to hold a SETUP and the completion racing it.
pub const MIN_QUEUE_CAPACITY: usize = 2;

/// A USB device controller.
pub trait Controller {
    /// Brings up the controller and attaches to the bus.
    fn initialize(&mut self) -> Result<()>;

    fn set_address(&mut self, address: u8) -> Result<()>;

    /// Raises the pull-up.
    fn connect(&mut self) -> Result<()>;

    /// Drops the pull-up.
    fn disconnect(&mut self) -> Result<()>;

    /// Queues `data` on `endpoint`. Completion is reported through
    /// [`Event::TransferComplete`].
    fn start_transfer(&mut self, endpoint: u8, data: &[u8]) -> Result<()>;

    fn stall(&mut self, endpoint: u8) -> Result<()>;

    /// Speed of the current link.
    fn speed(&self) -> Speed;
}

/// A one-shot timer that posts [`Event::StateTimer`] when it expires.
pub trait StateTimer {
    fn arm(&mut self, delay: Duration) -> Result<()>;

    /// Drops every armed expiry.
    fn cancel(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Setup(ControlRequest),
    TransferComplete { endpoint: u8, length: usize },
    BusReset,
    Disconnected,
    Suspended,
    StateTimer,
}

/// Producer half of the event queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: SyncSender<Event>,
}

impl EventSink {
    /// Posts without blocking, for interrupt context.
    pub fn post(&self, event: Event) -> Result<()> {
        self.sender.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Disconnected(_) => Error::QueueClosed,
        })
    }

    /// Waits for room in the queue.
    pub fn send(&self, event: Event) -> Result<()> {
        self.sender.send(event).map_err(|_| Error::QueueClosed)
    }
}

/// Consumer half of the event queue.
#[derive(Debug)]
pub struct EventQueue {
    receiver: Receiver<Event>,
}

impl EventQueue {
    pub fn recv(&self) -> Result<Event> {
        self.receiver.recv().map_err(|_| Error::QueueClosed)
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

/// Creates an event queue holding at most `capacity` events.
pub fn channel(capacity: usize) -> (EventSink, EventQueue) {
    let (sender, receiver) = mpsc::sync_channel(capacity.max(MIN_QUEUE_CAPACITY));
    (EventSink { sender }, EventQueue { receiver })
}

pub struct ControlEngine<C, T> {
    controller: C,
    timer: T,
    responder: Responder,
    session: Session,
    buffer: Box<[u8]>,
}

impl<C: Controller, T: StateTimer> ControlEngine<C, T> {
    pub fn new(controller: C, timer: T, responder: Responder) -> Self {
        let session = Session::new(controller.speed());
        ControlEngine {
            controller,
            timer,
            responder,
            session,
            buffer: vec![0; EP0_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        log::info!("starting in {:?}", self.session.state());
        self.controller.initialize()
    }

    /// Handles events until every sink is gone.
    pub fn run(&mut self, queue: &EventQueue) -> Result<()> {
        loop {
            match queue.recv() {
                Ok(event) => self.handle(event)?,
                Err(Error::QueueClosed) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    pub fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Setup(request) => self.setup(request),
            Event::TransferComplete { endpoint, length } => self.transfer_complete(endpoint, length),
            Event::BusReset => {
                log::debug!("bus reset");
                self.session.speed = self.controller.speed();
                self.session.pending_address = None;
                self.controller.set_address(0)
            }
            Event::Disconnected | Event::Suspended => {
                log::debug!("host gone: {:?}", event);
                self.session.request = None;
                if self.session.machine.restart() {
                    self.timer.cancel();
                }
                Ok(())
            }
            Event::StateTimer => self.state_timer(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    fn setup(&mut self, request: ControlRequest) -> Result<()> {
        if self.session.machine.attach() {
            self.session.speed = self.controller.speed();
        }
        self.session.request = Some(request);
        let direction = request.direction();

        if request.request == USB_REQ_SET_ADDRESS && request.request_type == USB_DIR_OUT {
            let address = (request.value & 0xff) as u8;
            log::debug!("SET_ADDRESS {}", address);
            self.session.pending_address = Some(address);
            return self.status_stage(direction);
        }

        match self.responder.respond(&self.session, &request, &mut self.buffer) {
            Reply::Stall => {
                self.controller.stall(EP0_IN)?;
                self.controller.stall(EP0_OUT)
            }
            Reply::Configure => {
                if let Some(delay) = self.session.machine.configured() {
                    self.timer.arm(delay)?;
                }
                self.status_stage(direction)
            }
            Reply::ZeroLength => self.controller.start_transfer(direction.ep0(), &[]),
            Reply::Data(length) => self
                .controller
                .start_transfer(direction.ep0(), &self.buffer[..length]),
        }
    }

    fn transfer_complete(&mut self, endpoint: u8, length: usize) -> Result<()> {
        let request = match self.session.request {
            Some(request) => request,
            None => {
                log::warn!("transfer on {:#x} completed without a request", endpoint);
                return Ok(());
            }
        };
        let direction = request.direction();

        // opposite direction means the status stage is done
        if Direction::from_bits(endpoint) != direction {
            log::debug!("status complete");
            self.session.request = None;
            if let Some(address) = self.session.pending_address.take() {
                self.controller.set_address(address)?;
            }
            return Ok(());
        }

        log::debug!("data complete, {:#x} bytes", length);
        if !is_terminated(length, request.length as usize, self.responder.max_packet_size()) {
            log::warn!(
                "data stage ended after {:#x} of {:#x} bytes",
                length,
                request.length
            );
        }
        self.status_stage(direction)
    }

    /// Acknowledges in the direction opposite the data stage.
    fn status_stage(&mut self, direction: Direction) -> Result<()> {
        self.controller.start_transfer(direction.opposite().ep0(), &[])
    }

    fn state_timer(&mut self) -> Result<()> {
        log::debug!("state timer in {:?}", self.session.state());
        match self.session.machine.timer_expired() {
            Some(Action::Disconnect { rearm }) => {
                self.controller.disconnect()?;
                self.timer.arm(rearm)
            }
            Some(Action::Connect) => self.controller.connect(),
            None => Ok(()),
        }
    }
}

/// Whether a data stage of `length` bytes ended the way USB requires: with
/// everything the host asked for, or with a short (possibly empty) packet.
fn is_terminated(length: usize, requested: usize, max_packet_size: u8) -> bool {
    let max_packet_size = max_packet_size as usize;
    length >= requested || length == 0 || max_packet_size == 0 || length % max_packet_size != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ch9::{USB_DIR_IN, USB_DT_CONFIG, USB_DT_DEVICE};
    use crate::device::{State, READY_DELAY, RECONNECT_DELAY};
    use crate::payload::Payloads;
    use crate::sim::{BusOp, SimController};
    use crate::timer::ManualTimer;
    use bytes::Bytes;

    struct Harness {
        engine: ControlEngine<SimController, ManualTimer>,
        queue: EventQueue,
    }

    impl Harness {
        fn new() -> Self {
            let (sink, queue) = channel(8);
            let payloads =
                Payloads::new(Bytes::from_static(b"kernel"), Bytes::from_static(b"repair")).unwrap();
            let engine = ControlEngine::new(
                SimController::new(Speed::Full, sink),
                ManualTimer::default(),
                Responder::bind(64, payloads),
            );
            Harness { engine, queue }
        }

        /// Handles `event` and every completion it causes.
        fn feed(&mut self, event: Event) {
            self.engine.handle(event).unwrap();
            while let Some(event) = self.queue.try_recv() {
                self.engine.handle(event).unwrap();
            }
        }

        fn ops(&mut self) -> Vec<BusOp> {
            self.engine.controller_mut().take_ops()
        }
    }

    #[test]
    fn test_set_address_applied_after_status() {
        let mut harness = Harness::new();
        harness
            .engine
            .handle(Event::Setup(ControlRequest::set_address(7)))
            .unwrap();
        assert_eq!(
            harness.ops(),
            vec![BusOp::Transfer {
                endpoint: EP0_IN,
                data: Bytes::new()
            }]
        );
        assert_eq!(harness.engine.controller().address(), 0);
        assert_eq!(harness.engine.session().state(), State::Device0Connected);

        let event = harness.queue.try_recv().unwrap();
        harness.engine.handle(event).unwrap();
        assert_eq!(harness.ops(), vec![BusOp::SetAddress(7)]);
        assert_eq!(harness.engine.session().request, None);
    }

    #[test]
    fn test_in_request_data_then_status() {
        let mut harness = Harness::new();
        harness.feed(Event::Setup(ControlRequest::get_descriptor(
            USB_DT_DEVICE,
            0,
            0,
            0x40,
        )));

        let ops = harness.ops();
        assert_eq!(ops.len(), 2);
        match &ops[0] {
            BusOp::Transfer { endpoint, data } => {
                assert_eq!(*endpoint, EP0_IN);
                assert_eq!(data.len(), 18);
                assert_eq!(data[17], 7);
            }
            op => panic!("unexpected {:?}", op),
        }
        assert_eq!(
            ops[1],
            BusOp::Transfer {
                endpoint: EP0_OUT,
                data: Bytes::new()
            }
        );
    }

    #[test]
    fn test_stall_both_directions() {
        let mut harness = Harness::new();
        let request = ControlRequest {
            request_type: USB_DIR_IN,
            request: 0x00,
            value: 0,
            index: 0,
            length: 2,
        };
        harness.feed(Event::Setup(request));
        assert_eq!(harness.ops(), vec![BusOp::Stall(EP0_IN), BusOp::Stall(EP0_OUT)]);
    }

    #[test]
    fn test_configuration_arms_ready_timer() {
        let mut harness = Harness::new();
        harness.feed(Event::Setup(ControlRequest::set_configuration(1)));
        assert_eq!(harness.engine.session().state(), State::Device0Ready);
        assert_eq!(harness.engine.timer_mut().take(), Some(READY_DELAY));

        harness.feed(Event::StateTimer);
        assert_eq!(harness.engine.session().state(), State::Device0Disconnected);
        assert_eq!(harness.engine.timer_mut().take(), Some(RECONNECT_DELAY));

        harness.feed(Event::StateTimer);
        assert_eq!(harness.engine.session().state(), State::Device1Connected);
        assert_eq!(harness.engine.timer_mut().take(), None);

        let ops = harness.ops();
        assert!(ops.contains(&BusOp::Disconnect));
        assert_eq!(ops.last(), Some(&BusOp::Connect));
    }

    #[test]
    fn test_string_descriptor_sends_empty_data() {
        let mut harness = Harness::new();
        harness
            .engine
            .handle(Event::Setup(ControlRequest::get_descriptor(3, 2, 0x409, 0xff)))
            .unwrap();
        assert_eq!(
            harness.ops(),
            vec![BusOp::Transfer {
                endpoint: EP0_IN,
                data: Bytes::new()
            }]
        );
    }

    #[test]
    fn test_disconnect_while_presenting_restarts() {
        let mut harness = Harness::new();
        harness.feed(Event::Setup(ControlRequest::get_descriptor(
            USB_DT_CONFIG,
            0,
            0,
            9,
        )));
        assert_eq!(harness.engine.session().state(), State::Device0Connected);

        harness.feed(Event::Suspended);
        assert_eq!(harness.engine.session().state(), State::Init);
        assert_eq!(harness.engine.session().request, None);
    }

    #[test]
    fn test_disconnect_cancels_pending_timer() {
        let mut harness = Harness::new();
        harness.feed(Event::Setup(ControlRequest::set_configuration(1)));
        harness.feed(Event::StateTimer);
        harness.feed(Event::StateTimer);
        assert_eq!(harness.engine.session().state(), State::Device1Connected);

        harness.engine.timer_mut().arm(READY_DELAY).unwrap();
        harness.feed(Event::Disconnected);
        assert_eq!(harness.engine.session().state(), State::Init);
        assert_eq!(harness.engine.timer_mut().take(), None);
    }

    #[test]
    fn test_bus_reset_clears_address() {
        let mut harness = Harness::new();
        harness.feed(Event::Setup(ControlRequest::set_address(3)));
        assert_eq!(harness.engine.controller().address(), 3);

        harness.feed(Event::BusReset);
        assert_eq!(harness.engine.controller().address(), 0);
    }

    #[test]
    fn test_spurious_completion_is_ignored() {
        let mut harness = Harness::new();
        harness
            .engine
            .handle(Event::TransferComplete {
                endpoint: EP0_IN,
                length: 0,
            })
            .unwrap();
        assert!(harness.ops().is_empty());
    }

    #[test]
    fn test_queue_post_never_blocks() {
        let (sink, queue) = channel(0);
        sink.post(Event::BusReset).unwrap();
        sink.post(Event::StateTimer).unwrap();
        match sink.post(Event::BusReset) {
            Err(Error::QueueFull) => {}
            other => panic!("unexpected result {:?}", other),
        }

        assert_eq!(queue.try_recv(), Some(Event::BusReset));
        assert_eq!(queue.try_recv(), Some(Event::StateTimer));
        assert_eq!(queue.try_recv(), None);

        drop(queue);
        match sink.post(Event::BusReset) {
            Err(Error::QueueClosed) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_run_ends_when_sinks_are_gone() {
        let mut harness = Harness::new();
        let (sink, queue) = channel(4);
        sink.send(Event::Setup(ControlRequest::set_configuration(1))).unwrap();
        drop(sink);

        harness.engine.run(&queue).unwrap();
        assert_eq!(harness.engine.session().state(), State::Device0Ready);
    }

    #[test]
    fn test_data_stage_termination() {
        // full length, short packet, empty packet
        assert!(is_terminated(200, 200, 64));
        assert!(is_terminated(100, 200, 64));
        assert!(is_terminated(0, 0x40, 64));
        assert!(is_terminated(18, 0x40, 64));
        // ended on a packet boundary before wLength
        assert!(!is_terminated(128, 200, 64));
        assert!(!is_terminated(64, 0x1000, 64));
    }
}

//! [`StateTimer`] implementations.

use crate::engine::{Event, EventSink, StateTimer};
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Sleeps on a helper thread, then sends [`Event::StateTimer`].
#[derive(Debug)]
pub struct ThreadTimer {
    sink: EventSink,
    generation: Arc<AtomicU64>,
}

impl ThreadTimer {
    pub fn new(sink: EventSink) -> Self {
        ThreadTimer {
            sink,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl StateTimer for ThreadTimer {
    fn arm(&mut self, delay: Duration) -> Result<()> {
        let sink = self.sink.clone();
        let generation = self.generation.clone();
        let armed = generation.load(Ordering::SeqCst);

        thread::Builder::new()
            .name("state-timer".into())
            .spawn(move || {
                thread::sleep(delay);
                // cancelled in the meantime
                if generation.load(Ordering::SeqCst) != armed {
                    return;
                }
                if let Err(err) = sink.send(Event::StateTimer) {
                    log::warn!("state timer dropped: {}", err);
                }
            })?;

        Ok(())
    }

    fn cancel(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// A timer driven by hand, for simulations and tests.
#[derive(Debug, Default)]
pub struct ManualTimer {
    armed: VecDeque<Duration>,
}

impl ManualTimer {
    /// The delay of the next expiry, if any.
    pub fn pending(&self) -> Option<Duration> {
        self.armed.front().copied()
    }

    /// Removes the next expiry and returns its delay.
    pub fn take(&mut self) -> Option<Duration> {
        self.armed.pop_front()
    }
}

impl StateTimer for ManualTimer {
    fn arm(&mut self, delay: Duration) -> Result<()> {
        self.armed.push_back(delay);
        Ok(())
    }

    fn cancel(&mut self) {
        self.armed.clear();
    }
}

//! Request mailbox shared between the driver and other tasks.

use crate::error::RequestError;
use crate::state::{State, Substate};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Init,
    IoExpanderWrite,
    IoExpanderRead,
    EepromRead { address: u16 },
    EepromWrite { address: u16 },
    TemperatureSensorRead,
    BalancingFeedback,
    OpenWireCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRequest {
    pub kind: RequestKind,
    pub string: usize,
}

impl StateRequest {
    pub fn new(kind: RequestKind, string: usize) -> Self {
        Self { kind, string }
    }
}

#[derive(Debug)]
struct Status {
    state: State,
    substate: Substate,
    first_cycle_finished: bool,
}

#[derive(Debug)]
struct Shared {
    strings: usize,
    mailbox: Mutex<Option<StateRequest>>,
    status: Mutex<Status>,
    busy: AtomicBool,
}

/// Cloneable handle to the driver's request boundary.
#[derive(Debug, Clone)]
pub struct AfeHandle {
    shared: Arc<Shared>,
}

/// Held while a trigger runs; dropping it releases the driver.
#[derive(Debug)]
pub struct TriggerGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for TriggerGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl AfeHandle {
    pub(crate) fn new(strings: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                strings,
                mailbox: Mutex::new(None),
                status: Mutex::new(Status {
                    state: State::NeverRun,
                    substate: Substate::Entry,
                    first_cycle_finished: false,
                }),
                busy: AtomicBool::new(false),
            }),
        }
    }

    /// Places a request in the mailbox.
    ///
    /// Only an init request is accepted before initialization, and only once.
    pub fn set_state_request(&self, request: StateRequest) -> Result<(), RequestError> {
        if request.string >= self.shared.strings {
            return Err(RequestError::IllegalString(request.string));
        }
        let mut mailbox = self.shared.mailbox.lock();
        if mailbox.is_some() {
            return Err(RequestError::Pending);
        }
        let uninitialized = matches!(self.state(), State::NeverRun | State::Uninitialized);
        match (request.kind, uninitialized) {
            (RequestKind::Init, false) => return Err(RequestError::AlreadyInitialized),
            (RequestKind::Init, true) | (_, false) => {}
            (_, true) => return Err(RequestError::NotInitialized),
        }
        log::debug!("Accepted request {request:?}");
        *mailbox = Some(request);
        Ok(())
    }

    pub fn state(&self) -> State {
        self.shared.status.lock().state
    }

    pub fn substate(&self) -> Substate {
        self.shared.status.lock().substate
    }

    /// `true` once every string has completed one measurement cycle.
    pub fn is_first_cycle_finished(&self) -> bool {
        self.shared.status.lock().first_cycle_finished
    }

    pub fn has_pending_request(&self) -> bool {
        self.shared.mailbox.lock().is_some()
    }

    /// Claims the driver for one trigger; `None` while another trigger runs.
    pub fn try_enter(&self) -> Option<TriggerGuard<'_>> {
        self.shared
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| TriggerGuard {
                busy: &self.shared.busy,
            })
    }

    pub(crate) fn take_request(&self) -> Option<StateRequest> {
        self.shared.mailbox.lock().take()
    }

    /// Takes the request and, if `enter` names a state, publishes it before
    /// the mailbox is released.
    pub(crate) fn take_request_entering(
        &self,
        enter: impl FnOnce(&StateRequest) -> Option<State>,
    ) -> Option<StateRequest> {
        let mut mailbox = self.shared.mailbox.lock();
        let request = mailbox.take()?;
        if let Some(state) = enter(&request) {
            self.publish(state, Substate::Entry);
        }
        Some(request)
    }

    pub(crate) fn publish(&self, state: State, substate: Substate) {
        let mut status = self.shared.status.lock();
        status.state = state;
        status.substate = substate;
    }

    /// Latches the flag; returns `true` the first time only.
    pub(crate) fn latch_first_cycle_finished(&self) -> bool {
        let mut status = self.shared.status.lock();
        !std::mem::replace(&mut status.first_cycle_finished, true)
    }
}

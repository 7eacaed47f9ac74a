use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};

use mio::Token;

use crate::error::PollError;

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const FIRED: u8 = 2;
const RETIRED: u8 = 3;

/// Lifecycle of a [`Desc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescState {
    /// Created but not yet started.
    Idle,
    /// Waiting for exactly one readiness event.
    Armed,
    /// An event was delivered; no more will be until the descriptor is resumed.
    Fired,
    /// Stopped for good.
    Retired,
}

impl DescState {
    fn from_u8(state: u8) -> Self {
        match state {
            IDLE => DescState::Idle,
            ARMED => DescState::Armed,
            FIRED => DescState::Fired,
            _ => DescState::Retired,
        }
    }
}

/// A one-shot read registration for a single socket.
///
/// Created by [`Poller::handle_read_once`](super::Poller::handle_read_once). The
/// state only moves `Idle -> Armed -> Fired -> Armed -> ... -> Retired`, so a
/// descriptor can never deliver two events without a resume in between.
#[derive(Debug)]
pub struct Desc {
    fd: RawFd,
    token: Token,
    state: AtomicU8,
}

impl Desc {
    pub(crate) fn new(fd: RawFd, token: Token) -> Self {
        Self {
            fd,
            token,
            state: AtomicU8::new(IDLE),
        }
    }

    /// The raw descriptor being watched.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Token identifying this descriptor in the poller's registry.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DescState {
        DescState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the descriptor was stopped.
    pub fn is_retired(&self) -> bool {
        self.state() == DescState::Retired
    }

    /// `Idle -> Armed`, done once by `start`.
    pub(crate) fn arm(&self) -> Result<(), PollError> {
        match self
            .state
            .compare_exchange(IDLE, ARMED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(RETIRED) => Err(PollError::Closed),
            Err(_) => Err(PollError::Registered),
        }
    }

    /// `Armed -> Fired`. Returns false when the event must be dropped.
    pub(crate) fn fire(&self) -> bool {
        self.state
            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Fired -> Armed`. Returns false when the descriptor was already armed and
    /// nothing needs to be re-registered.
    pub(crate) fn rearm(&self) -> Result<bool, PollError> {
        match self
            .state
            .compare_exchange(FIRED, ARMED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(true),
            Err(ARMED) => Ok(false),
            Err(IDLE) => Err(PollError::NotStarted),
            Err(_) => Err(PollError::Closed),
        }
    }

    /// Moves to `Retired` and returns the previous state.
    pub(crate) fn retire(&self) -> DescState {
        DescState::from_u8(self.state.swap(RETIRED, Ordering::AcqRel))
    }
}

/// A readiness notification delivered to an [`EventCallback`](super::EventCallback).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    readable: bool,
    hangup: bool,
}

impl Event {
    /// Builds an event by hand, for callers that synthesize one.
    pub fn new(readable: bool, hangup: bool) -> Self {
        Self { readable, hangup }
    }

    /// The socket has bytes to read.
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    /// The peer closed its side, or the socket reported an error.
    pub fn is_hangup(&self) -> bool {
        self.hangup
    }

    pub(crate) fn from_mio(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            hangup: event.is_read_closed() || event.is_error(),
        }
    }
}

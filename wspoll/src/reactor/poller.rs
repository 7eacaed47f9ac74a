use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{error, trace, warn};

use super::desc::{Desc, DescState, Event};
use crate::error::PollError;

/// Reserved for waking the dispatch thread on shutdown.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Called on the poller's dispatch thread for every delivered event. Must not block
/// for long: every other registration waits behind it.
pub type EventCallback = Box<dyn Fn(Event) + Send + Sync>;

struct Registration {
    desc: Arc<Desc>,
    callback: EventCallback,
}

type Registrations = Arc<Mutex<HashMap<Token, Arc<Registration>>>>;

/// One-shot read readiness on top of `mio`.
///
/// `mio` registrations are edge-triggered; this type layers the one-shot contract on
/// them. Each [`Desc`] delivers a single event and then stays silent until
/// [`resume`](Poller::resume) re-registers it, at which point the OS re-checks
/// readiness so bytes that arrived in the meantime are reported again.
///
/// # Architecture
///
/// - **Registry**: shared handle through which workers register, resume and stop sockets
/// - **Registrations**: token to descriptor and callback
/// - **Dispatch loop**: background thread that waits for OS events and invokes callbacks
pub struct Poller {
    registry: Registry,
    waker: Waker,
    registrations: Registrations,
    next_token: AtomicUsize,
    closed: Arc<AtomicBool>,
}

impl Poller {
    /// Creates the OS poller and spawns its dispatch thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the poll instance, its waker or the thread cannot be
    /// created.
    pub fn new() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registrations: Registrations = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let loop_registrations = registrations.clone();
        let loop_closed = closed.clone();
        thread::Builder::new()
            .name("wspoll-poller".into())
            .spawn(move || run_poller_loop(poll, loop_registrations, loop_closed))?;

        Ok(Arc::new(Self {
            registry,
            waker,
            registrations,
            next_token: AtomicUsize::new(0),
            closed,
        }))
    }

    /// Creates a read registration for `fd`. Nothing is watched until
    /// [`start`](Poller::start) is called.
    pub fn handle_read_once(&self, fd: RawFd) -> Arc<Desc> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        Arc::new(Desc::new(fd, token))
    }

    /// Begins delivering readiness events for `desc` to `callback`.
    ///
    /// # Errors
    ///
    /// - [`PollError::Registered`] if `desc` was already started
    /// - [`PollError::Closed`] if `desc` was stopped or the poller is shut down
    /// - [`PollError::Io`] if the OS rejects the socket
    pub fn start<F>(&self, desc: &Arc<Desc>, callback: F) -> Result<(), PollError>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(PollError::Closed);
        }
        desc.arm()?;

        let token = desc.token();
        let registration = Arc::new(Registration {
            desc: desc.clone(),
            callback: Box::new(callback),
        });
        self.registrations.lock().insert(token, registration);

        if let Err(e) = self
            .registry
            .register(&mut SourceFd(&desc.fd()), token, Interest::READABLE)
        {
            self.registrations.lock().remove(&token);
            desc.retire();
            return Err(PollError::Io(e));
        }

        // A concurrent stop may have run between arming and inserting.
        if desc.is_retired() {
            self.registrations.lock().remove(&token);
            let _ = self.registry.deregister(&mut SourceFd(&desc.fd()));
            return Err(PollError::Closed);
        }
        Ok(())
    }

    /// Re-arms `desc` for exactly one more event. Resuming a descriptor that is
    /// still armed is a no-op.
    ///
    /// # Errors
    ///
    /// [`PollError::Closed`] if `desc` was stopped or the poller is shut down.
    pub fn resume(&self, desc: &Desc) -> Result<(), PollError> {
        if self.is_closed() {
            return Err(PollError::Closed);
        }
        if !desc.rearm()? {
            return Ok(());
        }
        self.registry
            .reregister(&mut SourceFd(&desc.fd()), desc.token(), Interest::READABLE)
            .map_err(PollError::Io)
    }

    /// Retires `desc` permanently and drops its callback.
    ///
    /// # Errors
    ///
    /// [`PollError::Closed`] if `desc` was already stopped.
    pub fn stop(&self, desc: &Desc) -> Result<(), PollError> {
        let previous = desc.retire();
        if previous == DescState::Retired {
            return Err(PollError::Closed);
        }

        let registration = self.registrations.lock().remove(&desc.token());
        if previous == DescState::Idle || self.is_closed() {
            return Ok(());
        }

        let result = self
            .registry
            .deregister(&mut SourceFd(&desc.fd()))
            .map_err(PollError::Io);
        // The callback may own the last reference to whatever holds this descriptor.
        drop(registration);
        result
    }

    /// Shuts the poller down. Registrations are dropped and every later call
    /// reports [`PollError::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "failed to wake poller for shutdown");
        }
    }

    /// Whether the poller was shut down, by [`close`](Poller::close) or a poll failure.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of started, not yet stopped registrations.
    pub fn registrations(&self) -> usize {
        self.registrations.lock().len()
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("registrations", &self.registrations())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The dispatch loop running on the poller's own thread.
///
/// Blocks until the OS reports readiness, then hands each event to its
/// registration's callback if that registration is armed. Events for disarmed or
/// unknown tokens are dropped; the one-shot contract guarantees they are reported
/// again on resume if still relevant.
fn run_poller_loop(mut poll: Poll, registrations: Registrations, closed: Arc<AtomicBool>) {
    let mut events = Events::with_capacity(1024);

    loop {
        // Block here until the OS signals readiness.
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "poller failed, shutting down");
            closed.store(true, Ordering::Release);
            hang_up_orphans(&registrations);
            break;
        }

        if closed.load(Ordering::Acquire) {
            break;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }

            // Clone out so callbacks can call back into the poller.
            let registration = registrations.lock().get(&token).cloned();
            let Some(registration) = registration else {
                continue;
            };

            if !registration.desc.fire() {
                trace!(token = token.0, "dropping event for disarmed descriptor");
                continue;
            }
            (registration.callback)(Event::from_mio(event));
        }
    }

    registrations.lock().clear();
    trace!("poller stopped");
}

/// Tells every registration left behind by a failed poller that its socket is gone.
///
/// Armed descriptors get a synthetic hang-up so their owners tear down. A descriptor
/// that already fired has a read in flight; its resume will report
/// [`PollError::Closed`] once the poller is marked closed.
fn hang_up_orphans(registrations: &Registrations) {
    let orphaned: Vec<_> = registrations.lock().drain().map(|(_, r)| r).collect();

    for registration in orphaned {
        warn!(
            token = registration.desc.token().0,
            "registration orphaned by poller failure"
        );
        if registration.desc.fire() {
            (registration.callback)(Event::new(false, true));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use crossbeam_channel::Receiver;

    fn started(poller: &Poller, fd: RawFd) -> (Arc<Desc>, Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let desc = poller.handle_read_once(fd);
        poller
            .start(&desc, move |event| {
                let _ = tx.send(event);
            })
            .unwrap();
        (desc, rx)
    }

    #[test]
    fn delivers_one_event_until_resumed() {
        let poller = Poller::new().unwrap();
        let (local, mut peer) = UnixStream::pair().unwrap();
        let (desc, events) = started(&poller, local.as_raw_fd());

        peer.write_all(b"first").unwrap();
        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(event.is_readable());
        assert!(!event.is_hangup());
        assert_eq!(desc.state(), DescState::Fired);

        peer.write_all(b"second").unwrap();
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

        // Nothing was read, so re-registering reports the pending bytes again.
        poller.resume(&desc).unwrap();
        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(event.is_readable());
    }

    #[test]
    fn hangup_then_stop_retires_descriptor() {
        let poller = Poller::new().unwrap();
        let (local, peer) = UnixStream::pair().unwrap();
        let (desc, events) = started(&poller, local.as_raw_fd());

        drop(peer);
        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(event.is_hangup());

        poller.stop(&desc).unwrap();
        assert!(desc.is_retired());
        assert_eq!(poller.registrations(), 0);
        assert!(matches!(poller.resume(&desc), Err(PollError::Closed)));
        assert!(matches!(poller.stop(&desc), Err(PollError::Closed)));
    }

    #[test]
    fn start_twice_reports_registered() {
        let poller = Poller::new().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        let (desc, _events) = started(&poller, local.as_raw_fd());

        let again = poller.start(&desc, |_| {});
        assert!(matches!(again, Err(PollError::Registered)));
        assert_eq!(poller.registrations(), 1);
    }

    #[test]
    fn resume_before_start_is_rejected() {
        let poller = Poller::new().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        let desc = poller.handle_read_once(local.as_raw_fd());

        assert!(matches!(poller.resume(&desc), Err(PollError::NotStarted)));
        poller.stop(&desc).unwrap();
    }

    #[test]
    fn orphaned_registrations_are_hung_up() {
        let poller = Poller::new().unwrap();
        let (armed_local, _armed_peer) = UnixStream::pair().unwrap();
        let (fired_local, mut fired_peer) = UnixStream::pair().unwrap();
        let (_armed, armed_events) = started(&poller, armed_local.as_raw_fd());
        let (fired, fired_events) = started(&poller, fired_local.as_raw_fd());

        fired_peer.write_all(b"x").unwrap();
        fired_events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(fired.state(), DescState::Fired);

        hang_up_orphans(&poller.registrations);

        let event = armed_events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(event.is_hangup());
        assert!(!event.is_readable());
        // The in-flight read learns about it from resume instead.
        assert!(fired_events.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(poller.registrations(), 0);
    }

    #[test]
    fn closed_poller_rejects_calls() {
        let poller = Poller::new().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        let (desc, _events) = started(&poller, local.as_raw_fd());

        poller.close();
        assert!(poller.is_closed());
        assert!(matches!(poller.resume(&desc), Err(PollError::Closed)));

        let other = poller.handle_read_once(local.as_raw_fd());
        assert!(matches!(poller.start(&other, |_| {}), Err(PollError::Closed)));
    }
}

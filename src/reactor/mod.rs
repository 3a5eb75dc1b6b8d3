//! Single-threaded event loop: owns an epoll reactor, arms/disarms
//! `Signal`/`Child`/`Io` events, and dispatches fired events through
//! whichever registry each event was started with.
//!
//! Grounded on `tokio-rs-mio`'s `deprecated::event_loop::EventLoop` for the
//! `run`/`run_once`/`shutdown` shape (see DESIGN.md): that type drove a
//! `while self.run { self.run_once(...) }` loop with a plain `bool` flag
//! checked every iteration, which this port keeps, minus mio's cross-thread
//! `Sender`/`Timer` machinery (Non-goal: multi-threaded parallelism; spec
//! §5: no built-in timeouts).

pub mod epoll;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use log::{trace, warn};

use crate::error::{ReactorError, Result};
use crate::event::{Args, Direction, LoopPayload};
use crate::registry::Registry;
use epoll::{Events, Interest, Selector, Token};

const SELF_PIPE_TOKEN: Token = Token(usize::MAX);

/// The write end of the currently-installed self-pipe, if any. Signal
/// handlers cannot safely close over non-static state, so the trampoline
/// reaches this through a global instead; only one `Loop` is expected to own
/// live signal registrations in a process at a time (documented precondition,
/// same spirit as "two `Signal` events for the same signum is a usage
/// error").
static SELF_PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_trampoline(signum: libc::c_int) {
    let fd = SELF_PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // SAFETY: write(2) of one byte to a pipe is async-signal-safe; we
        // deliberately ignore the result (a full pipe just drops the wakeup,
        // which a subsequent signal of the same kind will retry).
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

#[derive(Clone, Copy)]
struct SavedSignalState {
    mask: libc::sigset_t,
    action: libc::sigaction,
}

struct ChildWatcher {
    id: u64,
    pid: libc::pid_t,
    trace_stops: bool,
    registry: Rc<RefCell<Registry>>,
}

enum SlotOwner {
    Signal(Rc<RefCell<Registry>>),
    Child(Vec<ChildWatcher>),
}

struct SignalSlot {
    saved: SavedSignalState,
    owner: SlotOwner,
}

struct IoRegistration {
    fd: RawFd,
    direction: Direction,
    registry: Rc<RefCell<Registry>>,
}

struct LoopShared {
    selector: Selector,
    running: bool,
    depth: u32,
    stop_at_depth: Option<u32>,
    self_pipe_read: RawFd,
    self_pipe_write: RawFd,
    signal_slots: HashMap<i32, SignalSlot>,
    io_tokens: HashMap<usize, IoRegistration>,
    next_token: usize,
    next_watcher_id: u64,
}

/// A cheap handle to a running loop's shared state. Events hold one of
/// these once started so that `Drop` can tear down process-global signal
/// state and epoll registrations without needing a borrowed `&mut Loop`.
#[derive(Clone)]
pub struct LoopHandle(Rc<RefCell<LoopShared>>);

pub struct Loop {
    shared: Rc<RefCell<LoopShared>>,
    events_buf: Events,
}

/// Construction-time tuning for a [`Loop`]. `Loop::new()` is equivalent to
/// `LoopBuilder::new().build()`; the only knob so far is the epoll events
/// buffer capacity, matching `tokio-rs-mio`'s own `EventLoopConfig`
/// builder shape (DESIGN.md).
pub struct LoopBuilder {
    events_capacity: usize,
}

impl Default for LoopBuilder {
    fn default() -> LoopBuilder {
        LoopBuilder { events_capacity: 1024 }
    }
}

impl LoopBuilder {
    pub fn new() -> LoopBuilder {
        LoopBuilder::default()
    }

    /// How many ready events `epoll_wait` can report per `run_once` tick.
    pub fn events_capacity(mut self, capacity: usize) -> LoopBuilder {
        self.events_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Loop> {
        Loop::with_events_capacity(self.events_capacity)
    }
}

impl Loop {
    pub fn new() -> Result<Loop> {
        Loop::with_events_capacity(1024)
    }

    fn with_events_capacity(events_capacity: usize) -> Result<Loop> {
        let selector = Selector::new().map_err(ReactorError::Io)?;

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(ReactorError::Io(io::Error::last_os_error()));
        }
        let (self_pipe_read, self_pipe_write) = (fds[0], fds[1]);

        selector
            .register(self_pipe_read, SELF_PIPE_TOKEN, Interest::READABLE)
            .map_err(ReactorError::Io)?;

        SELF_PIPE_WRITE_FD.store(self_pipe_write, Ordering::Relaxed);

        trace!("event loop created, self-pipe read={self_pipe_read} write={self_pipe_write}");

        Ok(Loop {
            shared: Rc::new(RefCell::new(LoopShared {
                selector,
                running: false,
                depth: 0,
                stop_at_depth: None,
                self_pipe_read,
                self_pipe_write,
                signal_slots: HashMap::new(),
                io_tokens: HashMap::new(),
                next_token: 0,
                next_watcher_id: 0,
            })),
            events_buf: Events::with_capacity(events_capacity),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle(Rc::clone(&self.shared))
    }

    /// Runs until `stop(false)` (or a matching `stop(true)` at this nesting
    /// depth) is called.
    pub fn run(&mut self) -> Result<()> {
        let depth = {
            let mut shared = self.shared.borrow_mut();
            shared.running = true;
            shared.depth += 1;
            shared.depth
        };

        loop {
            self.run_once(None)?;
            let mut shared = self.shared.borrow_mut();
            let should_stop = !shared.running
                || shared.stop_at_depth.is_some_and(|d| d >= depth);
            if should_stop {
                if shared.stop_at_depth.is_some_and(|d| d == depth) {
                    shared.stop_at_depth = None;
                    shared.running = true;
                }
                shared.depth -= 1;
                break;
            }
        }
        Ok(())
    }

    pub fn stop(&mut self, once: bool) {
        let mut shared = self.shared.borrow_mut();
        if once {
            let depth = shared.depth;
            shared.stop_at_depth = Some(depth);
        } else {
            shared.running = false;
            shared.stop_at_depth = Some(0);
        }
    }

    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        let n = {
            let shared = self.shared.borrow();
            match shared.selector.select(&mut self.events_buf, timeout) {
                Ok(n) => n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
                Err(err) => return Err(ReactorError::Io(err)),
            }
        };
        trace!("event loop tick, {n} events");

        let readinesses: Vec<_> = self.events_buf.iter().collect();
        for readiness in readinesses {
            if readiness.token == SELF_PIPE_TOKEN {
                self.drain_self_pipe();
                continue;
            }
            self.dispatch_io(readiness);
        }
        Ok(())
    }

    fn drain_self_pipe(&mut self) {
        let fd = self.shared.borrow().self_pipe_read;
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
            for &signum_byte in &buf[..n as usize] {
                self.dispatch_signal(signum_byte as i32);
            }
            if (n as usize) < buf.len() {
                break;
            }
        }
    }

    fn dispatch_signal(&mut self, signum: i32) {
        let shared = self.shared.borrow();
        let Some(slot) = shared.signal_slots.get(&signum) else {
            return;
        };
        match &slot.owner {
            SlotOwner::Signal(registry) => {
                let registry = Rc::clone(registry);
                drop(shared);
                let mut args = Args::Loop(LoopPayload::Signal { signum });
                registry.borrow().call("evt-signal", &mut args);
            }
            SlotOwner::Child(watchers) => {
                let watchers: Vec<(libc::pid_t, bool, Rc<RefCell<Registry>>)> = watchers
                    .iter()
                    .map(|w| (w.pid, w.trace_stops, Rc::clone(&w.registry)))
                    .collect();
                drop(shared);
                self.reap_children(&watchers);
            }
        }
    }

    fn reap_children(&mut self, watchers: &[(libc::pid_t, bool, Rc<RefCell<Registry>>)]) {
        loop {
            let mut status: libc::c_int = 0;
            let flags = libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED;
            let rpid = unsafe { libc::waitpid(-1, &mut status, flags) };
            if rpid <= 0 {
                break;
            }
            for (pid, trace_stops, registry) in watchers {
                if *pid != rpid {
                    continue;
                }
                let is_stop_or_continue = unsafe {
                    libc::WIFSTOPPED(status) || libc::WIFCONTINUED(status)
                };
                if is_stop_or_continue && !trace_stops {
                    continue;
                }
                let mut args = Args::Loop(LoopPayload::Child {
                    pid: *pid,
                    rpid,
                    rstatus: status,
                });
                registry.borrow().call("evt-child", &mut args);
            }
        }
    }

    fn dispatch_io(&mut self, readiness: epoll::Readiness) {
        let shared = self.shared.borrow();
        let Some(reg) = shared.io_tokens.get(&readiness.token.0) else {
            return;
        };
        let (fd, direction, registry) = (reg.fd, reg.direction, Rc::clone(&reg.registry));
        drop(shared);

        if readiness.readable && direction.includes_read() {
            let mut args = Args::Loop(LoopPayload::Io { fd, direction: Direction::Read });
            registry.borrow().call("evt-io", &mut args);
        }
        if (readiness.writable || readiness.error) && direction.includes_write() {
            let mut args = Args::Loop(LoopPayload::Io { fd, direction: Direction::Write });
            registry.borrow().call("evt-io", &mut args);
        }
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        let shared = self.shared.borrow();
        unsafe {
            libc::close(shared.self_pipe_read);
            libc::close(shared.self_pipe_write);
        }
        if SELF_PIPE_WRITE_FD.load(Ordering::Relaxed) == shared.self_pipe_write {
            SELF_PIPE_WRITE_FD.store(-1, Ordering::Relaxed);
        }
    }
}

/// What an `Event` watches; unchanged shape from spec §3's `Event` variant.
pub enum EventSpec {
    Signal { signum: i32 },
    Child { pid: libc::pid_t, trace_stops: bool },
    Io { fd: RawFd, direction: Direction },
}

enum Armed {
    Signal { handle: LoopHandle, signum: i32 },
    Child { handle: LoopHandle, signum: i32, watcher_id: u64 },
    Io { handle: LoopHandle, token: Token, fd: RawFd },
}

/// A signal, child, or I/O readiness watch. Created detached; `start`
/// attaches it to a `Loop`; `stop` (or dropping an attached `Event`) tears
/// down both the epoll registration (for `Io`) and any process-global
/// signal mask/disposition this event installed.
pub struct Event {
    spec: EventSpec,
    registry: Rc<RefCell<Registry>>,
    armed: Option<Armed>,
}

impl Event {
    pub fn new(spec: EventSpec, registry: Rc<RefCell<Registry>>) -> Event {
        Event { spec, registry, armed: None }
    }

    pub fn start(&mut self, loop_: &Loop) -> Result<()> {
        self.start_with_handle(&loop_.handle())
    }

    pub fn start_with_handle(&mut self, handle: &LoopHandle) -> Result<()> {
        if self.armed.is_some() {
            return Ok(()); // idempotent-success, per spec §4.2
        }
        let handle = handle.clone();
        self.armed = Some(match &self.spec {
            EventSpec::Signal { signum } => {
                let saved = install_signal(&handle, *signum, SlotOwner::Signal(Rc::clone(&self.registry)))?;
                let _ = saved;
                Armed::Signal { handle, signum: *signum }
            }
            EventSpec::Child { pid, trace_stops } => {
                let watcher_id = install_child(&handle, *pid, *trace_stops, Rc::clone(&self.registry))?;
                Armed::Child { handle, signum: libc::SIGCHLD, watcher_id }
            }
            EventSpec::Io { fd, direction } => {
                let token = install_io(&handle, *fd, *direction, Rc::clone(&self.registry))?;
                Armed::Io { handle, token, fd: *fd }
            }
        });
        Ok(())
    }

    pub fn stop(&mut self) {
        match self.armed.take() {
            Some(Armed::Signal { handle, signum }) => uninstall_signal(&handle, signum),
            Some(Armed::Child { handle, signum, watcher_id }) => {
                uninstall_child(&handle, signum, watcher_id)
            }
            Some(Armed::Io { handle, token, fd }) => uninstall_io(&handle, token, fd),
            None => {}
        }
    }

    pub fn is_started(&self) -> bool {
        self.armed.is_some()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.stop();
    }
}

fn install_signal(handle: &LoopHandle, signum: i32, owner: SlotOwner) -> Result<()> {
    let mut shared = handle.0.borrow_mut();
    if shared.signal_slots.contains_key(&signum) {
        warn!("signal {signum} already has an active event; rejecting duplicate registration");
        return Err(ReactorError::BadParam("signal already registered"));
    }
    let saved = arm_sigaction(signum, false)?;
    shared.signal_slots.insert(signum, SignalSlot { saved, owner });
    trace!("armed signal event for signum={signum}");
    Ok(())
}

fn uninstall_signal(handle: &LoopHandle, signum: i32) {
    let mut shared = handle.0.borrow_mut();
    if let Some(slot) = shared.signal_slots.remove(&signum) {
        restore_sigaction(signum, slot.saved);
        trace!("restored signal disposition for signum={signum}");
    }
}

fn install_child(
    handle: &LoopHandle,
    pid: libc::pid_t,
    trace_stops: bool,
    registry: Rc<RefCell<Registry>>,
) -> Result<u64> {
    let mut shared = handle.0.borrow_mut();
    let watcher_id = shared.next_watcher_id;
    shared.next_watcher_id += 1;

    match shared.signal_slots.get_mut(&libc::SIGCHLD) {
        Some(slot) => match &mut slot.owner {
            SlotOwner::Child(watchers) => {
                watchers.push(ChildWatcher { id: watcher_id, pid, trace_stops, registry });
                reconcile_sigchld_flags(watchers);
            }
            SlotOwner::Signal(_) => {
                return Err(ReactorError::BadParam(
                    "SIGCHLD already owned by a plain signal event",
                ));
            }
        },
        None => {
            let saved = arm_sigaction(libc::SIGCHLD, !trace_stops)?;
            shared.signal_slots.insert(
                libc::SIGCHLD,
                SignalSlot {
                    saved,
                    owner: SlotOwner::Child(vec![ChildWatcher {
                        id: watcher_id,
                        pid,
                        trace_stops,
                        registry,
                    }]),
                },
            );
        }
    }
    trace!("armed child event for pid={pid} trace_stops={trace_stops}");
    Ok(watcher_id)
}

fn uninstall_child(handle: &LoopHandle, signum: i32, watcher_id: u64) {
    let mut shared = handle.0.borrow_mut();
    let empty = match shared.signal_slots.get_mut(&signum) {
        Some(slot) => match &mut slot.owner {
            SlotOwner::Child(watchers) => {
                watchers.retain(|w| w.id != watcher_id);
                if !watchers.is_empty() {
                    reconcile_sigchld_flags(watchers);
                }
                watchers.is_empty()
            }
            SlotOwner::Signal(_) => false,
        },
        None => false,
    };
    if empty {
        if let Some(slot) = shared.signal_slots.remove(&signum) {
            restore_sigaction(signum, slot.saved);
            trace!("restored SIGCHLD disposition, last child watcher removed");
        }
    }
}

fn reconcile_sigchld_flags(watchers: &[ChildWatcher]) {
    let any_trace_stops = watchers.iter().any(|w| w.trace_stops);
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = signal_trampoline as usize;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }
    action.sa_flags = libc::SA_RESTART | if any_trace_stops { 0 } else { libc::SA_NOCLDSTOP };
    unsafe {
        libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut());
    }
}

fn arm_sigaction(signum: i32, no_cldstop: bool) -> Result<SavedSignalState> {
    let mut old_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    let mut new_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut new_mask);
        libc::sigaddset(&mut new_mask, signum);
        if libc::pthread_sigmask(libc::SIG_UNBLOCK, &new_mask, &mut old_mask) != 0 {
            return Err(ReactorError::Io(io::Error::last_os_error()));
        }
    }

    let mut old_action: libc::sigaction = unsafe { std::mem::zeroed() };
    let mut new_action: libc::sigaction = unsafe { std::mem::zeroed() };
    new_action.sa_sigaction = signal_trampoline as usize;
    unsafe {
        libc::sigemptyset(&mut new_action.sa_mask);
    }
    new_action.sa_flags = libc::SA_RESTART | if no_cldstop { libc::SA_NOCLDSTOP } else { 0 };

    let rc = unsafe { libc::sigaction(signum, &new_action, &mut old_action) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, std::ptr::null_mut());
        }
        return Err(ReactorError::Io(err));
    }

    Ok(SavedSignalState { mask: old_mask, action: old_action })
}

fn restore_sigaction(signum: i32, saved: SavedSignalState) {
    unsafe {
        libc::sigaction(signum, &saved.action, std::ptr::null_mut());
        libc::pthread_sigmask(libc::SIG_SETMASK, &saved.mask, std::ptr::null_mut());
    }
}

fn install_io(
    handle: &LoopHandle,
    fd: RawFd,
    direction: Direction,
    registry: Rc<RefCell<Registry>>,
) -> Result<Token> {
    let mut shared = handle.0.borrow_mut();
    let token = Token(shared.next_token);
    shared.next_token += 1;

    let interest = match direction {
        Direction::Read => Interest::READABLE,
        Direction::Write => Interest::WRITABLE,
        Direction::ReadWrite => Interest::READABLE | Interest::WRITABLE,
    };
    shared.selector.register(fd, token, interest).map_err(ReactorError::Io)?;
    shared.io_tokens.insert(token.0, IoRegistration { fd, direction, registry });
    trace!("armed io event fd={fd} direction={direction:?} token={token:?}");
    Ok(token)
}

fn uninstall_io(handle: &LoopHandle, token: Token, fd: RawFd) {
    let mut shared = handle.0.borrow_mut();
    if shared.io_tokens.remove(&token.0).is_some() {
        let _ = shared.selector.deregister(fd);
        trace!("disarmed io event fd={fd} token={token:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_mask_and_disposition_are_restored() {
        let mut loop_ = Loop::new().unwrap();
        let registry = Rc::new(RefCell::new(Registry::new()));

        let signum = libc::SIGUSR1;
        let mut before_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
        let mut before_action: libc::sigaction = unsafe { std::mem::zeroed() };
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut before_mask);
            libc::sigaction(signum, std::ptr::null(), &mut before_action);
        }

        let mut event = Event::new(EventSpec::Signal { signum }, registry);
        event.start(&loop_).unwrap();
        event.stop();
        drop(loop_);

        let mut after_action: libc::sigaction = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigaction(signum, std::ptr::null(), &mut after_action);
        }
        assert_eq!(before_action.sa_sigaction, after_action.sa_sigaction);
        loop_ = Loop::new().unwrap();
        drop(loop_);
    }

    #[test]
    fn duplicate_signal_registration_rejected() {
        let loop_ = Loop::new().unwrap();
        let registry = Rc::new(RefCell::new(Registry::new()));

        let mut a = Event::new(EventSpec::Signal { signum: libc::SIGUSR2 }, Rc::clone(&registry));
        a.start(&loop_).unwrap();

        let mut b = Event::new(EventSpec::Signal { signum: libc::SIGUSR2 }, registry);
        assert!(b.start(&loop_).is_err());

        a.stop();
    }
}

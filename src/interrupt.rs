//! Edge-triggered interrupts multiplexed onto one monitor thread.
//!
//! Every attached pin owns an edge-detecting [`Line`]. The monitor polls the
//! descriptors of all active watchers together with the read end of a
//! self-pipe; `attach`, `detach` and `shutdown` write to the pipe so the
//! monitor rebuilds its descriptor set on the next iteration instead of
//! waiting out the poll timeout.

use log::{debug, error, info, warn};
use std::cell::Cell;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::pipe2;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::config::{Config, EdgeMode, InterruptConfig};
use crate::error::GpioError;
use crate::line::{EdgeEvent, Line, LineBackend};

pub type EdgeCallback = Box<dyn Fn(&EdgeEvent) + Send + Sync + 'static>;

thread_local! {
    // address of the `Shared` whose monitor runs on this thread, or 0
    static MONITOR_OF: Cell<usize> = const { Cell::new(0) };
}

/// One pin with an attached interrupt.
pub struct EdgeWatcher {
    pin: u32,
    mode: EdgeMode,
    callback: EdgeCallback,
    line: Mutex<Line>,
    fd: RawFd,
    active: AtomicBool,
}

impl EdgeWatcher {
    fn new(
        backend: &dyn LineBackend,
        pin: u32,
        mode: EdgeMode,
        callback: EdgeCallback,
        config: &InterruptConfig,
    ) -> Result<Self, GpioError> {
        let line = Line::for_edges(
            backend,
            pin,
            config.bias,
            mode,
            config.debounce(),
            config.event_buffer_capacity,
        )?;
        let fd = line.event_fd().ok_or_else(|| {
            GpioError::ResourceUnavailable(format!("edge detection unsupported on pin {pin}"))
        })?;
        Ok(Self {
            pin,
            mode,
            callback,
            line: Mutex::new(line),
            fd,
            active: AtomicBool::new(true),
        })
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn read_events(&self, out: &mut Vec<EdgeEvent>) -> Result<usize, GpioError> {
        self.line.lock().read_edge_events(out)
    }

    fn invoke(&self, event: &EdgeEvent) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(event)));
        if let Err(payload) = outcome {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("interrupt callback for pin {} panicked: {reason}", self.pin);
        }
    }
}

struct WakePipe {
    reader: File,
    writer: File,
}

impl WakePipe {
    fn new() -> Result<Self, GpioError> {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .map_err(|e| GpioError::Internal(format!("wake pipe: {e}")))?;
        Ok(Self {
            reader: File::from(reader),
            writer: File::from(writer),
        })
    }

    fn wake(&self) {
        match (&self.writer).write(&[1]) {
            Ok(_) => {}
            // a full pipe already guarantees a wake-up
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!("interrupt monitor wake-up failed: {e}"),
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

struct Shared {
    watchers: Mutex<FxHashMap<u32, Arc<EdgeWatcher>>>,
    // signalled whenever the monitor drops its descriptor snapshot
    released: Condvar,
    wake: WakePipe,
    poll_timeout: PollTimeout,
}

impl Shared {
    fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

struct Monitor {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Owns every [`EdgeWatcher`] and the single monitor thread serving them.
pub struct EdgeDispatcher {
    backend: Arc<dyn LineBackend>,
    config: InterruptConfig,
    max_pin: u32,
    shared: Arc<Shared>,
    monitor: Mutex<Option<Monitor>>,
    // serializes attach per pin across the line request
    attach_slots: Mutex<FxHashMap<u32, Arc<Mutex<()>>>>,
}

impl EdgeDispatcher {
    pub fn new(backend: Arc<dyn LineBackend>, config: &Config) -> Result<Self, GpioError> {
        let interrupts = config.interrupts.clone();
        let timeout_ms = u16::try_from(interrupts.poll_timeout_ms).unwrap_or(u16::MAX);
        let shared = Arc::new(Shared {
            watchers: Mutex::new(FxHashMap::default()),
            released: Condvar::new(),
            wake: WakePipe::new()?,
            poll_timeout: PollTimeout::from(timeout_ms),
        });
        debug!("interrupt dispatcher initialized");
        Ok(Self {
            backend,
            config: interrupts,
            max_pin: config.max_pin,
            shared,
            monitor: Mutex::new(None),
            attach_slots: Mutex::new(FxHashMap::default()),
        })
    }

    /// Registers `callback` for `mode` transitions on `pin`.
    ///
    /// Fails with `AlreadyAttached` if the pin already has a watcher; on any
    /// failure nothing is left claimed or registered. Concurrent attaches on
    /// one pin are serialized, so the later caller sees `AlreadyAttached`.
    /// From inside a callback an attach that would have to wait for another
    /// thread's attach on the same pin fails with `AlreadyAttached` instead.
    pub fn attach<F>(&self, pin: u32, callback: F, mode: EdgeMode) -> Result<(), GpioError>
    where
        F: Fn(&EdgeEvent) + Send + Sync + 'static,
    {
        if pin > self.max_pin {
            return Err(GpioError::invalid_pin(pin, self.max_pin));
        }

        let slot = Arc::clone(self.attach_slots.lock().entry(pin).or_default());
        // the holder may be waiting on the monitor in `release`
        let _serialized = if self.on_monitor_thread() {
            slot.try_lock().ok_or(GpioError::AlreadyAttached(pin))?
        } else {
            slot.lock()
        };

        let stale = {
            let mut watchers = self.shared.watchers.lock();
            if watchers.get(&pin).is_some_and(|w| w.is_active()) {
                return Err(GpioError::AlreadyAttached(pin));
            }
            watchers.remove(&pin)
        };
        if let Some(stale) = stale {
            debug!("discarding failed watcher on pin {pin}");
            self.release(stale);
        }

        let watcher = Arc::new(EdgeWatcher::new(
            self.backend.as_ref(),
            pin,
            mode,
            Box::new(callback),
            &self.config,
        )?);

        self.shared.watchers.lock().insert(pin, watcher);

        if let Err(e) = self.ensure_monitor() {
            let removed = self.shared.watchers.lock().remove(&pin);
            drop(removed);
            return Err(e);
        }
        self.shared.wake.wake();

        info!("interrupt attached to pin {pin} ({mode:?})");
        Ok(())
    }

    /// Removes the watcher on `pin`; `false` if there was none.
    ///
    /// Outside the monitor thread this returns only once the monitor has let
    /// go of the watcher: no callback for `pin` is running and the line is
    /// released.
    pub fn detach(&self, pin: u32) -> bool {
        let removed = self.shared.watchers.lock().remove(&pin);
        let Some(watcher) = removed else {
            return false;
        };
        watcher.deactivate();
        self.release(watcher);
        info!("interrupt detached from pin {pin}");
        true
    }

    pub fn is_attached(&self, pin: u32) -> bool {
        self.shared
            .watchers
            .lock()
            .get(&pin)
            .is_some_and(|w| w.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.shared
            .watchers
            .lock()
            .values()
            .filter(|w| w.is_active())
            .count()
    }

    /// Detaches every watcher and joins the monitor thread. A later `attach`
    /// starts a fresh monitor.
    pub fn shutdown(&self) {
        let monitor = self.monitor.lock().take();
        let watchers: Vec<Arc<EdgeWatcher>> =
            self.shared.watchers.lock().drain().map(|(_, w)| w).collect();
        for watcher in &watchers {
            watcher.deactivate();
        }

        if let Some(monitor) = monitor {
            debug!("stopping interrupt monitor");
            monitor.stop.store(true, Ordering::Release);
            self.shared.wake.wake();
            if self.on_monitor_thread() {
                debug!("shutdown requested from an interrupt callback, monitor exits after it");
            } else if monitor.handle.join().is_err() {
                error!("interrupt monitor panicked");
            }
        }
        drop(watchers);
    }

    fn on_monitor_thread(&self) -> bool {
        MONITOR_OF.with(|m| m.get()) == self.shared.id()
    }

    fn ensure_monitor(&self) -> Result<(), GpioError> {
        let mut monitor = self.monitor.lock();
        if let Some(running) = monitor.as_ref() {
            if !running.handle.is_finished() {
                return Ok(());
            }
        }
        if let Some(dead) = monitor.take() {
            warn!("interrupt monitor exited unexpectedly, restarting");
            let _ = dead.handle.join();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("gpio-interrupts".to_string())
            .spawn(move || monitor_loop(shared, stop_flag))
            .map_err(|e| GpioError::Internal(format!("spawn interrupt monitor: {e}")))?;
        *monitor = Some(Monitor { handle, stop });
        debug!("interrupt monitor thread started");
        Ok(())
    }

    fn release(&self, watcher: Arc<EdgeWatcher>) {
        self.shared.wake.wake();
        if !self.on_monitor_thread() {
            let mut guard = self.shared.watchers.lock();
            while Arc::strong_count(&watcher) > 1 {
                self.wait_released(&mut guard);
            }
        }
        drop(watcher);
    }

    fn wait_released(&self, guard: &mut MutexGuard<'_, FxHashMap<u32, Arc<EdgeWatcher>>>) {
        let timeout = self.config.poll_timeout();
        if self.shared.released.wait_for(guard, timeout).timed_out() {
            self.shared.wake.wake();
        }
    }
}

impl Drop for EdgeDispatcher {
    fn drop(&mut self) {
        debug!("interrupt dispatcher shutting down");
        self.shutdown();
    }
}

fn monitor_loop(shared: Arc<Shared>, stop: Arc<AtomicBool>) {
    MONITOR_OF.with(|m| m.set(shared.id()));
    debug!("interrupt monitor running");

    let mut events = Vec::new();
    while !stop.load(Ordering::Acquire) {
        let snapshot: Vec<Arc<EdgeWatcher>> = shared
            .watchers
            .lock()
            .values()
            .filter(|w| w.is_active())
            .cloned()
            .collect();

        let keep_running = poll_once(&shared, &snapshot, &mut events);
        drop(snapshot);
        {
            let _guard = shared.watchers.lock();
            shared.released.notify_all();
        }
        if !keep_running {
            break;
        }
    }

    MONITOR_OF.with(|m| m.set(0));
    debug!("interrupt monitor exiting");
}

/// One wait on the wake pipe plus every watcher; `false` on a fatal poll error.
fn poll_once(shared: &Shared, snapshot: &[Arc<EdgeWatcher>], events: &mut Vec<EdgeEvent>) -> bool {
    let mut fds = Vec::with_capacity(snapshot.len() + 1);
    fds.push(PollFd::new(shared.wake.reader.as_fd(), PollFlags::POLLIN));
    for watcher in snapshot {
        // SAFETY: the descriptor belongs to the watcher's line, which the
        // snapshot keeps open until after this poll returns.
        let fd = unsafe { BorrowedFd::borrow_raw(watcher.fd) };
        fds.push(PollFd::new(fd, PollFlags::POLLIN));
    }

    // idle: nothing but the wake pipe to wait on
    let timeout = if snapshot.is_empty() {
        PollTimeout::NONE
    } else {
        shared.poll_timeout
    };

    match poll(&mut fds, timeout) {
        Ok(0) => return true,
        Ok(_) => {}
        Err(Errno::EINTR) => return true,
        Err(e) => {
            error!("interrupt poll failed: {e}");
            return false;
        }
    }

    let ready: Vec<PollFlags> = fds
        .iter()
        .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
        .collect();
    drop(fds);

    if ready[0].contains(PollFlags::POLLIN) {
        shared.wake.drain();
        return true;
    }

    for (watcher, revents) in snapshot.iter().zip(&ready[1..]) {
        if revents.contains(PollFlags::POLLIN) {
            dispatch_ready(shared, watcher, events);
        } else if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            warn!(
                "edge descriptor for pin {} ({:?}) reported {revents:?}, deactivating watcher",
                watcher.pin, watcher.mode
            );
            watcher.deactivate();
        }
    }
    true
}

fn dispatch_ready(shared: &Shared, watcher: &Arc<EdgeWatcher>, events: &mut Vec<EdgeEvent>) {
    let current = shared
        .watchers
        .lock()
        .get(&watcher.pin)
        .is_some_and(|w| Arc::ptr_eq(w, watcher));
    if !current || !watcher.is_active() {
        return;
    }

    events.clear();
    if let Err(e) = watcher.read_events(events) {
        error!(
            "reading edge events for pin {} failed, deactivating watcher: {e}",
            watcher.pin
        );
        watcher.deactivate();
        return;
    }

    for event in events.drain(..) {
        if !watcher.is_active() {
            break;
        }
        watcher.invoke(&event);
    }
}

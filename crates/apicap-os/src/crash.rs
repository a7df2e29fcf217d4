//! Fatal-signal interception.
//!
//! [`install`] replaces the disposition of every catchable signal below
//! [`NUM_SIGNALS`] (except `SIGPIPE`) with one handler. On delivery the handler
//! logs to a private duplicate of stderr, runs the registered callback
//! (typically "flush the trace file") and dumps a backtrace, then forwards the
//! signal to whatever disposition was in place before installation.
//!
//! Everything the handler touches lives in [`CrashContext`] atomics; it never
//! takes a lock. Symbol resolution for the backtrace can still allocate, so a
//! crash inside the allocator may lose the backtrace or deadlock.

use std::ffi::c_void;
use std::fmt::{self, Write as _};
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

use libc::{c_int, siginfo_t};

/// Signals `1..NUM_SIGNALS` are candidates for interception.
pub const NUM_SIGNALS: usize = 16;

const LOG_LINE_CAPACITY: usize = 512;
const MAX_BACKTRACE_FRAMES: usize = 64;

pub type SimpleHandler = extern "C" fn(c_int);
pub type RichHandler = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

/// What a signal did before [`install`] replaced it.
#[derive(Debug, Clone, Copy)]
pub enum Disposition {
    Default,
    Ignore,
    Simple(SimpleHandler),
    /// Installed with `SA_SIGINFO`.
    Rich(RichHandler),
}

impl Disposition {
    fn from_sigaction(action: &libc::sigaction) -> Self {
        let handler = action.sa_sigaction;
        if handler == libc::SIG_DFL {
            Disposition::Default
        } else if handler == libc::SIG_IGN {
            Disposition::Ignore
        } else if action.sa_flags & libc::SA_SIGINFO != 0 {
            // SAFETY: with SA_SIGINFO the kernel calls `sa_sigaction` with this
            // signature.
            Disposition::Rich(unsafe { mem::transmute::<usize, RichHandler>(handler) })
        } else {
            // SAFETY: without SA_SIGINFO the field holds a plain `sa_handler`.
            Disposition::Simple(unsafe { mem::transmute::<usize, SimpleHandler>(handler) })
        }
    }

    fn encode(self) -> (u8, usize) {
        match self {
            Disposition::Default => (KIND_DEFAULT, 0),
            Disposition::Ignore => (KIND_IGNORE, 0),
            Disposition::Simple(handler) => (KIND_SIMPLE, handler as usize),
            Disposition::Rich(handler) => (KIND_RICH, handler as usize),
        }
    }
}

const KIND_DEFAULT: u8 = 0;
const KIND_IGNORE: u8 = 1;
const KIND_SIMPLE: u8 = 2;
const KIND_RICH: u8 = 3;

/// A [`Disposition`] stored in a form the signal handler can read without
/// locking.
struct SavedDisposition {
    kind: AtomicU8,
    handler: AtomicUsize,
}

impl SavedDisposition {
    const fn new() -> Self {
        Self {
            kind: AtomicU8::new(KIND_DEFAULT),
            handler: AtomicUsize::new(0),
        }
    }

    fn store(&self, disposition: Disposition) {
        let (kind, handler) = disposition.encode();
        self.handler.store(handler, Ordering::Release);
        self.kind.store(kind, Ordering::Release);
    }

    fn load(&self) -> Disposition {
        let kind = self.kind.load(Ordering::Acquire);
        let handler = self.handler.load(Ordering::Acquire);
        match kind {
            KIND_IGNORE => Disposition::Ignore,
            // SAFETY: only `store` writes non-zero handlers, taken from
            // function pointers of the matching kind.
            KIND_SIMPLE if handler != 0 => {
                Disposition::Simple(unsafe { mem::transmute::<usize, SimpleHandler>(handler) })
            }
            KIND_RICH if handler != 0 => {
                Disposition::Rich(unsafe { mem::transmute::<usize, RichHandler>(handler) })
            }
            _ => Disposition::Default,
        }
    }
}

/// Process-wide state shared between the installer and the signal handler.
///
/// Initialized once by [`install`] and never torn down (outside tests).
struct CrashContext {
    installed: AtomicBool,
    /// Set for the duration of every [`log`] call.
    logging: AtomicBool,
    /// Set while the callback and backtrace dump run.
    handling: AtomicBool,
    /// `fn()` stored as an address; zero when unset.
    callback: AtomicUsize,
    /// Duplicate of stderr taken at install time; negative when unset.
    log_fd: AtomicI32,
    saved: [SavedDisposition; NUM_SIGNALS],
}

impl CrashContext {
    const fn new() -> Self {
        Self {
            installed: AtomicBool::new(false),
            logging: AtomicBool::new(false),
            handling: AtomicBool::new(false),
            callback: AtomicUsize::new(0),
            log_fd: AtomicI32::new(-1),
            saved: [const { SavedDisposition::new() }; NUM_SIGNALS],
        }
    }

    fn saved(&self, sig: c_int) -> Option<&SavedDisposition> {
        usize::try_from(sig).ok().and_then(|sig| self.saved.get(sig))
    }

    fn callback(&self) -> Option<fn()> {
        match self.callback.load(Ordering::Acquire) {
            0 => None,
            // SAFETY: only `set_callback` stores non-zero values, all `fn()`.
            raw => Some(unsafe { mem::transmute::<usize, fn()>(raw) }),
        }
    }

    fn log_fd(&self) -> c_int {
        match self.log_fd.load(Ordering::Acquire) {
            fd if fd >= 0 => fd,
            _ => libc::STDERR_FILENO,
        }
    }
}

static CONTEXT: CrashContext = CrashContext::new();

fn intercepted_signals() -> impl Iterator<Item = c_int> {
    (1..NUM_SIGNALS as c_int)
        .filter(|&sig| !matches!(sig, libc::SIGKILL | libc::SIGSTOP | libc::SIGPIPE))
}

/// Installs the crash handler for every intercepted signal, remembering the
/// previous dispositions for chaining.
///
/// Installing twice is a programming error: it trips a debug assertion and is
/// otherwise a no-op.
pub fn install() {
    let installed = install_once();
    debug_assert!(installed, "crash handlers installed twice");
}

fn install_once() -> bool {
    if CONTEXT.installed.swap(true, Ordering::AcqRel) {
        return false;
    }

    // SAFETY: dup has no memory-safety preconditions.
    let fd = unsafe { libc::dup(libc::STDERR_FILENO) };
    CONTEXT.log_fd.store(fd, Ordering::Release);

    let mut count = 0;
    for sig in intercepted_signals() {
        match replace_action(sig) {
            Ok(()) => count += 1,
            Err(err) => tracing::warn!(sig, error = %err, "failed to intercept signal"),
        }
    }
    tracing::debug!(signals = count, log_fd = fd, "installed crash handlers");
    true
}

fn replace_action(sig: c_int) -> io::Result<()> {
    // SAFETY: an all-zero `sigaction` is a valid value and both calls receive
    // pointers to live locals.
    unsafe {
        let mut old: libc::sigaction = mem::zeroed();
        if libc::sigaction(sig, ptr::null(), &mut old) != 0 {
            return Err(io::Error::last_os_error());
        }
        if let Some(saved) = CONTEXT.saved(sig) {
            saved.store(Disposition::from_sigaction(&old));
        }

        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handle_signal as RichHandler as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        if libc::sigaction(sig, &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Registers `callback` and installs the handlers if that has not happened
/// yet.
pub fn set_exception_callback(callback: fn()) {
    set_callback(callback);
    install_once();
}

/// Registers the function run once per crash before the backtrace is dumped.
///
/// Only one callback may be registered at a time; a second registration trips
/// a debug assertion and is otherwise ignored.
pub fn set_callback(callback: fn()) {
    let registered = CONTEXT
        .callback
        .compare_exchange(0, callback as usize, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
    debug_assert!(registered, "crash callback registered twice");
}

pub fn reset_callback() {
    CONTEXT.callback.store(0, Ordering::Release);
}

pub fn is_installed() -> bool {
    CONTEXT.installed.load(Ordering::Acquire)
}

/// The disposition `sig` had before [`install`], if it is intercepted.
pub fn previous_disposition(sig: c_int) -> Option<Disposition> {
    if !is_installed() || !intercepted_signals().any(|s| s == sig) {
        return None;
    }
    CONTEXT.saved(sig).map(SavedDisposition::load)
}

extern "C" fn handle_signal(sig: c_int, info: *mut siginfo_t, context: *mut c_void) {
    // A signal raised by the log write itself (SIGPIPE on a closed stderr
    // pipe, say) must not log again.
    if CONTEXT.logging.load(Ordering::Acquire) {
        return;
    }

    log(format_args!("apicap: warning: caught signal {sig}\n"));

    if CONTEXT.handling.swap(true, Ordering::AcqRel) {
        log(format_args!(
            "apicap: warning: recursion handling signal {sig}\n"
        ));
    } else {
        if let Some(callback) = CONTEXT.callback() {
            callback();
        }
        dump_backtrace();
        CONTEXT.handling.store(false, Ordering::Release);
    }

    let Some(saved) = CONTEXT.saved(sig) else {
        log(format_args!("apicap: error: unexpected signal {sig}\n"));
        // SAFETY: raise is async-signal-safe.
        unsafe { libc::raise(libc::SIGKILL) };
        return;
    };

    match saved.load() {
        Disposition::Rich(handler) => handler(sig, info, context),
        Disposition::Simple(handler) => handler(sig),
        Disposition::Ignore => {}
        Disposition::Default => {
            log(format_args!(
                "apicap: info: taking default action for signal {sig}\n"
            ));
            // SAFETY: sigaction and raise are async-signal-safe; `sig` stays
            // blocked until this handler returns, so the default action runs
            // right after.
            unsafe {
                let mut action: libc::sigaction = mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(sig, &action, ptr::null_mut());
                libc::raise(sig);
            }
        }
    }
}

/// Fixed-capacity line buffer; anything past the end is dropped.
struct LineBuf {
    bytes: [u8; LOG_LINE_CAPACITY],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            bytes: [0; LOG_LINE_CAPACITY],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(LOG_LINE_CAPACITY - self.len);
        self.bytes[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Writes one message to the crash log without heap allocation.
///
/// Safe to call from a signal handler. Signals delivered while the write is in
/// progress are dropped by the crash handler.
pub fn log(args: fmt::Arguments<'_>) {
    CONTEXT.logging.store(true, Ordering::Release);
    let mut line = LineBuf::new();
    let _ = line.write_fmt(args);
    write_all(CONTEXT.log_fd(), line.as_bytes());
    CONTEXT.logging.store(false, Ordering::Release);
}

fn write_all(fd: c_int, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice for the duration of the call.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

fn dump_backtrace() {
    log(format_args!("apicap: backtrace:\n"));
    let mut index = 0usize;
    // SAFETY: the unsynchronized variants skip the backtrace crate's global
    // lock, which the interrupted thread may be holding. Nothing else in this
    // process walks the stack concurrently with a crash.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let ip = frame.ip();
            let mut resolved = false;
            backtrace::resolve_frame_unsynchronized(frame, |symbol| {
                if resolved {
                    return;
                }
                resolved = true;
                match symbol.name() {
                    Some(name) => log(format_args!("  #{index} {ip:p} {name:#}\n")),
                    None => log(format_args!("  #{index} {ip:p} <unknown>\n")),
                }
            });
            if !resolved {
                log(format_args!("  #{index} {ip:p}\n"));
            }
            index += 1;
            index < MAX_BACKTRACE_FRAMES
        });
    }
}

/// Restores the saved dispositions and clears the context so a later test can
/// install again.
#[cfg(test)]
pub(crate) fn reset_for_tests() {
    for sig in intercepted_signals() {
        let Some(saved) = CONTEXT.saved(sig) else {
            continue;
        };
        let (handler, flags) = match saved.load() {
            Disposition::Default => (libc::SIG_DFL, 0),
            Disposition::Ignore => (libc::SIG_IGN, 0),
            Disposition::Simple(handler) => (handler as libc::sighandler_t, 0),
            Disposition::Rich(handler) => (handler as libc::sighandler_t, libc::SA_SIGINFO),
        };
        // SAFETY: see `replace_action`.
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = handler;
            action.sa_flags = flags;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(sig, &action, ptr::null_mut());
        }
        saved.store(Disposition::Default);
    }

    CONTEXT.callback.store(0, Ordering::Release);
    CONTEXT.handling.store(false, Ordering::Release);
    CONTEXT.logging.store(false, Ordering::Release);
    let fd = CONTEXT.log_fd.swap(-1, Ordering::AcqRel);
    if fd >= 0 {
        // SAFETY: `fd` came from `dup` in `install_once` and is closed once.
        unsafe { libc::close(fd) };
    }
    CONTEXT.installed.store(false, Ordering::Release);
    tracing::debug!("restored signal dispositions");
}

//! Process signal dispatch.
//!
//! One registry maps OS signals to user callbacks. The first install wires
//! a trampoline through `sigaction` and sets SIGPIPE/SIGHUP to OS-level
//! ignore. Fatal signals (SEGV, ABRT, ILL, FPE, BUS) are dispatched like
//! general signals, then the disposition is restored to the default and the
//! signal re-raised so a core file is still produced.
//!
//! Signal context discipline: the trampoline takes no locks and allocates
//! nothing; it loads the slot pointer atomically and calls through it with
//! a stack-built [`SignalInfo`]. Handlers must themselves be
//! async-signal-safe (no heap allocation, `write(2)`-style logging only).
//! Replaced handlers are intentionally leaked, since a signal may be
//! executing the old handler at replacement time.

use basalt_core::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicPtr, Ordering};
use tracing::warn;

/// What the trampoline knows about a trapped signal.
#[derive(Debug, Clone, Copy)]
pub struct SignalInfo {
    /// Signal number.
    pub sig: i32,
    /// Pid of the sender, when the kernel reports one.
    pub sender_pid: i32,
    /// Uid of the sender, when the kernel reports one.
    pub sender_uid: u32,
}

type HandlerFn = dyn Fn(&SignalInfo) + Send + Sync;

const MAX_SIGNAL: usize = 64;

/// One atomic slot per signal number. The stored pointer is a leaked
/// `Box<Box<HandlerFn>>`; the double box keeps the atomically-swapped
/// pointer thin.
static SLOTS: [AtomicPtr<Box<HandlerFn>>; MAX_SIGNAL] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: AtomicPtr<Box<HandlerFn>> = AtomicPtr::new(std::ptr::null_mut());
    [EMPTY; MAX_SIGNAL]
};

/// Serializes installs; never touched from signal context.
static INSTALL_LOCK: Lazy<Mutex<bool>> = Lazy::new(|| Mutex::new(false));

/// Installs `handler` for `sig`, replacing any previous handler for it.
pub fn install<F>(sig: i32, handler: F) -> Result<()>
where
    F: Fn(&SignalInfo) + Send + Sync + 'static,
{
    install_boxed(sig, Box::new(handler))
}

/// Installs one shared handler for every signal in `sigs`.
pub fn install_all<F>(sigs: &[i32], handler: F) -> Result<()>
where
    F: Fn(&SignalInfo) + Send + Sync + Clone + 'static,
{
    for &sig in sigs {
        install(sig, handler.clone())?;
    }
    Ok(())
}

fn install_boxed(sig: i32, handler: Box<HandlerFn>) -> Result<()> {
    if !(1..=MAX_SIGNAL as i32).contains(&sig) {
        return Err(Error::InvalidArgument(format!(
            "signal {sig} out of range 1..=64"
        )));
    }
    if sig == libc::SIGKILL || sig == libc::SIGSTOP {
        return Err(Error::InvalidArgument(format!(
            "signal {sig} cannot be handled"
        )));
    }

    let mut initialized = INSTALL_LOCK.lock();
    if !*initialized {
        ignore_signal(libc::SIGPIPE)?;
        ignore_signal(libc::SIGHUP)?;
        *initialized = true;
    }

    // sigaction with the trampoline; SA_SIGINFO hands us the sender.
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = trampoline as usize;
        act.sa_flags = libc::SA_SIGINFO;
        if libc::sigaction(sig, &act, std::ptr::null_mut()) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }

    let cell = Box::into_raw(Box::new(handler));
    let prev = SLOTS[(sig - 1) as usize].swap(cell, Ordering::AcqRel);
    if !prev.is_null() {
        warn!(target: "basalt::signal", sig, "signal registered twice, replacing handler");
        // Leaked: the old handler may be mid-dispatch on another thread.
    }
    Ok(())
}

fn ignore_signal(sig: i32) -> Result<()> {
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = libc::SIG_IGN;
        if libc::sigaction(sig, &act, std::ptr::null_mut()) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

extern "C" fn trampoline(sig: libc::c_int, info: *mut libc::siginfo_t, _uctx: *mut libc::c_void) {
    let (pid, uid) = unsafe {
        if info.is_null() {
            (0, 0)
        } else {
            ((*info).si_pid(), (*info).si_uid())
        }
    };
    let siginfo = SignalInfo {
        sig,
        sender_pid: pid,
        sender_uid: uid,
    };

    let slot = SLOTS[(sig - 1) as usize].load(Ordering::Acquire);
    if !slot.is_null() {
        let handler: &Box<HandlerFn> = unsafe { &*slot };
        handler(&siginfo);
    }

    if is_fatal(sig) {
        // Restore the default disposition and re-raise so the process
        // still crashes with a core file.
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    }
}

fn is_fatal(sig: i32) -> bool {
    matches!(
        sig,
        libc::SIGSEGV | libc::SIGABRT | libc::SIGILL | libc::SIGFPE | libc::SIGBUS
    )
}

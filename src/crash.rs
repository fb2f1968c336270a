//! Thread registry and crash/backtrace subsystem.
//!
//! Every worker thread registers itself on start and unregisters on
//! exit. On a fatal signal, the handler restores the signal's default
//! disposition, reports the fault, pokes every other registered thread
//! with `SIGUSR1` so each dumps its own stack, waits for them all, then
//! dumps its own and returns — the default disposition then re-raises
//! the signal and terminates the process.
//!
//! Registry is a `Mutex<Vec<Arc<ThreadRecord>>>` rather than the
//! original's intrusive doubly-linked list: the same register/iterate/
//! unregister operations, without the unsafe pointer-chasing a
//! from-scratch Rust port would otherwise need.

use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use backtrace::Backtrace;
use lazy_static::lazy_static;

use crate::error::ScheduleError;

pub struct ThreadRecord {
    name: String,
    pthread: libc::pthread_t,
}

struct CrashState {
    alert: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    report: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

lazy_static! {
    static ref REGISTRY: Mutex<Vec<Arc<ThreadRecord>>> = Mutex::new(Vec::new());
    static ref STATE: Mutex<CrashState> = Mutex::new(CrashState { alert: None, report: None });
    static ref DUMP_DONE: Condvar = Condvar::new();
}

static DUMP_PENDING: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SELF_RECORD: std::cell::RefCell<Option<Arc<ThreadRecord>>> =
        std::cell::RefCell::new(None);
}

/// Unregisters the thread it was created for when dropped.
pub struct ThreadGuard(Arc<ThreadRecord>);

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        REGISTRY.lock().unwrap().retain(|r| !Arc::ptr_eq(r, &self.0));
    }
}

/// Register the calling thread under `name`. Hold the returned guard
/// for the thread's lifetime.
pub fn register_self(name: impl Into<String>) -> ThreadGuard {
    let record = Arc::new(ThreadRecord {
        name: name.into(),
        pthread: unsafe { libc::pthread_self() },
    });
    REGISTRY.lock().unwrap().push(Arc::clone(&record));
    SELF_RECORD.with(|cell| *cell.borrow_mut() = Some(Arc::clone(&record)));
    ThreadGuard(record)
}

/// Install the alert (fatal) and report (diagnostic) log callbacks
/// used by this subsystem, mirroring `crash_initialize(alertfn,
/// reportfn)`. Safe to call before or after `trap_signals`.
pub fn init(
    alert: impl Fn(&str) + Send + Sync + 'static,
    report: impl Fn(&str) + Send + Sync + 'static,
) {
    let mut state = STATE.lock().unwrap();
    state.alert = Some(Arc::new(alert));
    state.report = Some(Arc::new(report));
}

fn alert(msg: &str) {
    if let Some(f) = STATE.lock().unwrap().alert.as_ref() {
        f(msg);
    } else {
        tracing::error!("{}", msg);
    }
}

fn report(msg: &str) {
    if let Some(f) = STATE.lock().unwrap().report.as_ref() {
        f(msg);
    } else {
        tracing::warn!("{}", msg);
    }
}

const FATAL_SIGNALS: &[c_int] = &[
    libc::SIGABRT,
    libc::SIGSEGV,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGBUS,
    libc::SIGSYS,
];
const POKE_SIGNAL: c_int = libc::SIGUSR1;

/// Install the alternate signal stack and the handlers for every fatal
/// signal plus the internal poke signal. `argv0` is accepted for parity
/// with the original interface (used there to locate the binary for
/// symbolication); this port's backtraces are self-contained via the
/// `backtrace` crate and don't need it.
pub fn trap_signals(_argv0: &str) -> Result<(), ScheduleError> {
    unsafe {
        install_alt_stack()?;
        for &sig in FATAL_SIGNALS {
            install_handler(sig, handle_fatal)?;
        }
        install_handler(POKE_SIGNAL, handle_poke)?;
    }
    Ok(())
}

unsafe fn install_alt_stack() -> Result<(), ScheduleError> {
    let size = libc::SIGSTKSZ * 4;
    let stack = vec![0u8; size].into_boxed_slice();
    let ss = libc::stack_t {
        ss_sp: Box::into_raw(stack) as *mut c_void,
        ss_flags: 0,
        ss_size: size,
    };
    if libc::sigaltstack(&ss, std::ptr::null_mut()) != 0 {
        return Err(ScheduleError::Fatal("sigaltstack failed".into()));
    }
    Ok(())
}

unsafe fn install_handler(
    sig: c_int,
    handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void),
) -> Result<(), ScheduleError> {
    let mut sa: libc::sigaction = std::mem::zeroed();
    sa.sa_sigaction = handler as usize;
    sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    libc::sigemptyset(&mut sa.sa_mask);
    if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
        return Err(ScheduleError::Fatal(format!(
            "sigaction installation failed for signal {}",
            sig
        )));
    }
    Ok(())
}

extern "C" fn handle_poke(_sig: c_int, _info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    dump_self("poked");
    if DUMP_PENDING.load(Ordering::SeqCst) > 0 {
        DUMP_PENDING.fetch_sub(1, Ordering::SeqCst);
    }
    let _guard = REGISTRY.lock().unwrap();
    DUMP_DONE.notify_all();
}

extern "C" fn handle_fatal(sig: c_int, info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }

    let addr = unsafe { fault_address(info) };
    match addr {
        Some(a) => alert(&format!(
            "fatal signal {} at address {:#x}, nearest symbol: {}",
            sig,
            a,
            nearest_symbol(a)
        )),
        None => alert(&format!("fatal signal {}", sig)),
    }

    let others: Vec<Arc<ThreadRecord>> = {
        let registry = REGISTRY.lock().unwrap();
        let me = unsafe { libc::pthread_self() };
        registry
            .iter()
            .filter(|r| unsafe { libc::pthread_equal(r.pthread, me) } == 0)
            .cloned()
            .collect()
    };

    DUMP_PENDING.store(others.len(), Ordering::SeqCst);
    for other in &others {
        unsafe {
            libc::pthread_kill(other.pthread, POKE_SIGNAL);
        }
    }
    let guard = REGISTRY.lock().unwrap();
    let _ = DUMP_DONE
        .wait_while(guard, |_| DUMP_PENDING.load(Ordering::SeqCst) > 0)
        .unwrap();

    dump_self("faulting thread");
}

fn dump_self(context: &str) {
    let name = SELF_RECORD
        .with(|c| c.borrow().as_ref().map(|r| r.name.clone()))
        .unwrap_or_else(|| "<unregistered>".to_string());
    let bt = Backtrace::new();
    report(&format!(
        "--- backtrace for thread '{}' ({}) ---\n{:?}",
        name, context, bt
    ));
}

fn nearest_symbol(addr: usize) -> String {
    let mut found = None;
    backtrace::resolve(addr as *mut c_void, |symbol| {
        if found.is_none() {
            found = symbol.name().map(|n| n.to_string());
        }
    });
    found.unwrap_or_else(|| format!("{:#x}", addr))
}

/// Extracts `siginfo_t::si_addr`. The field sits behind a
/// platform-specific union in `libc`'s definition, so this is only
/// wired up for Linux/x86_64, where it is the first word of the
/// `sigfault` member at a fixed offset; other platforms fall back to
/// reporting the signal without an address.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> Option<usize> {
    const SI_ADDR_OFFSET: isize = 16;
    let ptr = (info as *const u8).offset(SI_ADDR_OFFSET) as *const *mut c_void;
    Some(*ptr as usize)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
unsafe fn fault_address(_info: *mut libc::siginfo_t) -> Option<usize> {
    None
}

/// Disable core dumps process-wide by setting `RLIMIT_CORE` to zero.
pub fn disable_core_dump() -> Result<(), ScheduleError> {
    nix::sys::resource::setrlimit(nix::sys::resource::Resource::RLIMIT_CORE, 0, 0)
        .map_err(|e| ScheduleError::Fatal(format!("setrlimit(RLIMIT_CORE) failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn register_and_unregister_round_trips() {
        assert_eq!(REGISTRY.lock().unwrap().len(), 0);
        let guard = register_self("test-thread");
        assert_eq!(REGISTRY.lock().unwrap().len(), 1);
        drop(guard);
        assert_eq!(REGISTRY.lock().unwrap().len(), 0);
    }

    #[test]
    #[serial_test::serial]
    fn init_installs_callbacks() {
        use std::sync::atomic::AtomicBool;
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = Arc::clone(&seen);
        init(move |_| seen2.store(true, Ordering::SeqCst), |_| {});
        alert("test message");
        assert!(seen.load(Ordering::SeqCst));
    }
}

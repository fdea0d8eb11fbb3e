//! The `SIGPROF` handler and the state it shares with the rest of the crate.
//!
//! The handler runs on whichever thread was consuming CPU when the profiling
//! timer expired. It does two things, both without allocating or locking:
//! - publishes the interrupted program counter into a one-slot mailbox that
//!   [`super::SignalSampler`] drains, and
//! - if a delay is armed and the thread is executing at or beneath the armed
//!   call site, sleeps for the armed delay and charges it to the thread.
//!
//! Only one handler is ever installed per process. After the sampler stops it
//! stays installed but does nothing, since the timer no longer fires and the
//! `SAMPLING` flag is clear.

use libc::{c_int, c_void, siginfo_t};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::cell::Cell;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::timer::sleep_until_interrupted;

/// Most recent unread sample. Zero means empty.
pub(crate) static LATEST_PC: AtomicUsize = AtomicUsize::new(0);

/// Set while a sampler is running; the handler ignores signals otherwise.
pub(crate) static SAMPLING: AtomicBool = AtomicBool::new(false);

/// Call site currently being slowed down. Zero when disarmed.
pub(crate) static ARMED_PC: AtomicUsize = AtomicUsize::new(0);

/// Delay per matching sample, in nanoseconds. Zero when disarmed.
pub(crate) static ARMED_DELAY_NS: AtomicU64 = AtomicU64::new(0);

/// Bumped to cut every in-progress injected sleep short.
pub(crate) static WAKE_EPOCH: AtomicU64 = AtomicU64::new(0);

/// Delay injected across all threads, in nanoseconds.
pub(crate) static TOTAL_INJECTED_NS: AtomicU64 = AtomicU64::new(0);

static INSTALLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Delay injected into this thread, in nanoseconds.
    static THREAD_DELAY_NS: Cell<u64> = const { Cell::new(0) };

    /// Top (highest address) of this thread's stack. `None` until looked up;
    /// `Some(0)` if the lookup failed.
    static STACK_TOP: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Frames followed when deciding whether a thread is beneath the armed pc.
const MAX_FRAMES: usize = 32;


/// Who currently handles `SIGPROF` in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigprofDisposition {
    /// Default action or ignored.
    Default,
    /// This crate's handler.
    Ours,
    /// Some other handler, normally another sampling profiler.
    Foreign,
}

/// Reads the current `SIGPROF` disposition without changing it.
///
/// # Errors
///
/// Returns the OS error if `sigaction` fails.
pub fn sigprof_disposition() -> io::Result<SigprofDisposition> {
    // SAFETY: a zeroed sigaction is a valid out-parameter and a null new
    // action only queries.
    let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::sigaction(libc::SIGPROF, ptr::null(), &raw mut current) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    let handler = current.sa_sigaction;
    Ok(if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        SigprofDisposition::Default
    } else if handler == on_sigprof as *const () as usize {
        SigprofDisposition::Ours
    } else {
        SigprofDisposition::Foreign
    })
}

/// Installs the handler unless it already is.
pub(crate) fn install() -> io::Result<()> {
    if INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }

    let action = SigAction::new(
        SigHandler::SigAction(on_sigprof),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches atomics, a const thread-local and
    // async-signal-safe libc calls.
    unsafe { signal::sigaction(Signal::SIGPROF, &action) }
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;

    INSTALLED.store(true, Ordering::Release);
    Ok(())
}

/// Delay injected into the calling thread so far.
pub(crate) fn thread_delay() -> Duration {
    Duration::from_nanos(THREAD_DELAY_NS.try_with(Cell::get).unwrap_or(0))
}

/// Records the calling thread's stack bounds for the frame walk, once.
///
/// Must run outside the handler: `pthread_getattr_np` allocates.
pub(crate) fn register_thread_stack() {
    let _ = STACK_TOP.try_with(|top| {
        if top.get().is_none() {
            top.set(Some(current_stack_top().unwrap_or(0)));
        }
    });
}

/// Stack top cached for the calling thread, or 0 if unknown.
pub(crate) fn thread_stack_top() -> usize {
    STACK_TOP.try_with(Cell::get).ok().flatten().unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn current_stack_top() -> Option<usize> {
    // SAFETY: attr is initialized by pthread_getattr_np before use and
    // destroyed exactly once.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &raw mut attr) != 0 {
            return None;
        }
        let mut addr: *mut c_void = ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&raw const attr, &raw mut addr, &raw mut size);
        libc::pthread_attr_destroy(&raw mut attr);
        if rc != 0 || addr.is_null() {
            return None;
        }
        (addr as usize).checked_add(size)
    }
}

#[cfg(not(target_os = "linux"))]
fn current_stack_top() -> Option<usize> {
    None
}

/// Publishes a new arming. The delay is cleared first so that the handler
/// never pairs the new pc with the previous delay.
pub(crate) fn arm(pc: usize, delay_ns: u64) {
    ARMED_DELAY_NS.store(0, Ordering::Release);
    ARMED_PC.store(pc, Ordering::Release);
    if pc != 0 {
        ARMED_DELAY_NS.store(delay_ns, Ordering::Release);
    }
}

/// Ends every injected sleep in progress.
pub(crate) fn wake_all() {
    WAKE_EPOCH.fetch_add(1, Ordering::AcqRel);
}

extern "C" fn on_sigprof(_signal: c_int, _info: *mut siginfo_t, context: *mut c_void) {
    // SAFETY: errno is thread-local and restored before returning, so the
    // interrupted code never sees it change.
    let saved_errno = unsafe { *libc::__errno_location() };

    if SAMPLING.load(Ordering::Acquire) {
        // SAFETY: the kernel passes a valid ucontext_t for SA_SIGINFO handlers.
        if let Some(regs) = unsafe { Registers::from_context(context) } {
            if regs.pc != 0 {
                LATEST_PC.store(regs.pc, Ordering::Release);
            }
            inject_delay(&regs);
        }
    }

    unsafe { *libc::__errno_location() = saved_errno };
}

fn inject_delay(regs: &Registers) {
    let target = ARMED_PC.load(Ordering::Acquire);
    let delay_ns = ARMED_DELAY_NS.load(Ordering::Acquire);
    if target == 0 || delay_ns == 0 || !regs.at_or_beneath(target) {
        return;
    }

    let epoch = WAKE_EPOCH.load(Ordering::Acquire);
    let slept = sleep_until_interrupted(Duration::from_nanos(delay_ns), &WAKE_EPOCH, epoch);
    let slept_ns = u64::try_from(slept.as_nanos()).unwrap_or(u64::MAX);

    let _ = THREAD_DELAY_NS.try_with(|total| total.set(total.get().saturating_add(slept_ns)));
    TOTAL_INJECTED_NS.fetch_add(slept_ns, Ordering::Relaxed);
}

/// The interrupted thread's program counter, stack pointer and frame pointer,
/// plus the top of its stack when known (0 otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Registers {
    pub(crate) pc: usize,
    pub(crate) sp: usize,
    pub(crate) fp: usize,
    pub(crate) stack_top: usize,
}

impl Registers {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[allow(clippy::cast_sign_loss)]
    unsafe fn from_context(context: *mut c_void) -> Option<Self> {
        let uc = context.cast::<libc::ucontext_t>().as_ref()?;
        let gregs = &uc.uc_mcontext.gregs;
        Some(Self {
            pc: gregs[libc::REG_RIP as usize] as usize,
            sp: gregs[libc::REG_RSP as usize] as usize,
            fp: gregs[libc::REG_RBP as usize] as usize,
            stack_top: thread_stack_top(),
        })
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    unsafe fn from_context(context: *mut c_void) -> Option<Self> {
        let uc = context.cast::<libc::ucontext_t>().as_ref()?;
        let mc = &uc.uc_mcontext;
        Some(Self {
            pc: mc.pc as usize,
            sp: mc.sp as usize,
            fp: mc.regs[29] as usize,
            stack_top: thread_stack_top(),
        })
    }

    #[cfg(not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )))]
    unsafe fn from_context(_context: *mut c_void) -> Option<Self> {
        None
    }

    /// Returns true if `target` is the current pc or a return address in the
    /// frame-pointer chain.
    ///
    /// The walk only dereferences frame records that lie wholly between the
    /// stack pointer and the thread's stack top, aligned and strictly
    /// increasing. Garbage in the frame pointer register just ends the walk.
    /// Without a known stack top only the exact pc matches.
    pub(crate) fn at_or_beneath(&self, target: usize) -> bool {
        if self.pc == target {
            return true;
        }
        if self.stack_top == 0 {
            return false;
        }

        let record_size = 2 * std::mem::size_of::<usize>();
        let align = std::mem::align_of::<usize>();
        let mut fp = self.fp;

        for _ in 0..MAX_FRAMES {
            let in_stack = fp >= self.sp
                && fp
                    .checked_add(record_size)
                    .is_some_and(|end| end <= self.stack_top);
            if !in_stack || fp % align != 0 {
                return false;
            }
            // SAFETY: the whole record lies in the mapped stack between sp and
            // the stack top.
            // The frame record is [saved fp, return address].
            let (next, ret) = unsafe {
                let record = fp as *const usize;
                (record.read(), record.add(1).read())
            };
            if ret == target {
                return true;
            }
            if next <= fp {
                return false;
            }
            fp = next;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pc_matches() {
        let regs = Registers {
            pc: 0x1234,
            sp: 0,
            fp: 0,
            stack_top: 0,
        };
        assert!(regs.at_or_beneath(0x1234));
        assert!(!regs.at_or_beneath(0x1235));
    }

    /// Lays out three frame records like a downward-growing stack:
    /// [saved fp, return address] pairs at increasing addresses.
    fn synthetic_chain(stack: &mut [usize; 8]) -> Registers {
        let base = stack.as_mut_ptr();
        let word = std::mem::size_of::<usize>();
        let records = [
            (base as usize + 2 * word, 0xaaaa),
            (base as usize + 4 * word, 0xbbbb),
            (0, 0xcccc), // end of chain
        ];
        for (i, (next, ret)) in records.into_iter().enumerate() {
            // SAFETY: 2 * i + 1 < 8.
            unsafe {
                base.add(2 * i).write(next);
                base.add(2 * i + 1).write(ret);
            }
        }
        Registers {
            pc: 0x1,
            sp: base as usize,
            fp: base as usize,
            stack_top: base as usize + stack.len() * word,
        }
    }

    #[test]
    fn walks_a_synthetic_frame_chain() {
        let mut stack = [0_usize; 8];
        let regs = synthetic_chain(&mut stack);
        assert!(regs.at_or_beneath(0xaaaa));
        assert!(regs.at_or_beneath(0xbbbb));
        assert!(regs.at_or_beneath(0xcccc));
        assert!(!regs.at_or_beneath(0xdddd));
    }

    #[test]
    fn unknown_stack_top_only_matches_exact_pc() {
        let mut stack = [0_usize; 8];
        let regs = Registers {
            stack_top: 0,
            ..synthetic_chain(&mut stack)
        };
        assert!(regs.at_or_beneath(0x1));
        assert!(!regs.at_or_beneath(0xaaaa));
    }

    #[test]
    fn record_straddling_stack_top_is_not_read() {
        let mut stack = [0_usize; 8];
        let full = synthetic_chain(&mut stack);
        let word = std::mem::size_of::<usize>();
        // Only the first record fits below the stack top.
        let regs = Registers {
            stack_top: full.sp + 3 * word,
            ..full
        };
        assert!(regs.at_or_beneath(0xaaaa));
        assert!(!regs.at_or_beneath(0xbbbb));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn chain_into_guard_page_stops_at_stack_top() {
        let page = 4096;
        // SAFETY: a fresh anonymous mapping of two pages.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                2 * page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED);
        let base = base as usize;
        // SAFETY: the second page belongs to the mapping above.
        assert_eq!(
            unsafe { libc::mprotect((base + page) as *mut c_void, page, libc::PROT_NONE) },
            0
        );

        let word = std::mem::size_of::<usize>();
        let fp = base + page - 2 * word;
        // SAFETY: fp lies in the readable first page.
        unsafe {
            (fp as *mut usize).write(base + page);
            (fp as *mut usize).add(1).write(0xaaaa);
        }

        let regs = Registers {
            pc: 0x1,
            sp: base,
            fp,
            stack_top: base + page,
        };
        assert!(regs.at_or_beneath(0xaaaa));
        // The saved fp points into the PROT_NONE page; the walk must stop.
        assert!(!regs.at_or_beneath(0x2));

        // SAFETY: unmaps exactly the mapping created above.
        unsafe { libc::munmap(base as *mut c_void, 2 * page) };
    }

    #[test]
    fn rejects_frame_pointer_below_stack_pointer() {
        let stack = [0_usize; 4];
        let base = stack.as_ptr() as usize;
        let word = std::mem::size_of::<usize>();
        let regs = Registers {
            pc: 0x1,
            sp: base + 2 * word,
            fp: base,
            stack_top: base + 4 * word,
        };
        assert!(!regs.at_or_beneath(0x2));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn thread_stack_top_is_above_locals() {
        std::thread::spawn(|| {
            assert_eq!(thread_stack_top(), 0);
            register_thread_stack();
            let local = 0_u8;
            let top = thread_stack_top();
            assert!(top > std::ptr::addr_of!(local) as usize);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn disarm_clears_delay() {
        arm(0x4000, 500);
        assert_eq!(ARMED_PC.load(Ordering::Acquire), 0x4000);
        assert_eq!(ARMED_DELAY_NS.load(Ordering::Acquire), 500);
        arm(0, 500);
        assert_eq!(ARMED_PC.load(Ordering::Acquire), 0);
        assert_eq!(ARMED_DELAY_NS.load(Ordering::Acquire), 0);
    }

    #[test]
    fn fresh_thread_has_no_delay() {
        let delay = std::thread::spawn(thread_delay).join().unwrap();
        assert_eq!(delay, Duration::ZERO);
    }
}

use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Async-safe interrupt handling
/// Handlers only store atomics; the coordinator polls them between waits.
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global interrupt flag (async-safe atomic)
static INTERRUPT_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Last signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Anything the orchestrator can ask "has the run been interrupted?"
pub trait InterruptSource: Send + Sync {
    fn interrupted(&self) -> bool;

    /// Signal number behind the interrupt, if any
    fn signal(&self) -> Option<i32> {
        None
    }

    /// Wait until interrupted or `timeout` elapses.
    /// Returns true if interrupted.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.interrupted() {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
        }
    }
}

/// Process-wide handler for SIGINT, SIGTERM and SIGHUP
pub struct SignalHandler;

impl SignalHandler {
    /// Install handlers.
    /// Must be called early in main() before any threads are spawned
    pub fn init() -> Result<Self, String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: the handler only touches atomics.
            unsafe {
                signal::sigaction(sig, &sig_action)
                    .map_err(|e| format!("Failed to install {} handler: {}", sig, e))?;
            }
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    /// No allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
        INTERRUPT_REQUESTED.store(true, Ordering::SeqCst);
    }

    /// Reset flags (for testing)
    #[allow(dead_code)]
    pub fn reset(&self) {
        INTERRUPT_REQUESTED.store(false, Ordering::SeqCst);
        SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
    }
}

impl InterruptSource for SignalHandler {
    fn interrupted(&self) -> bool {
        INTERRUPT_REQUESTED.load(Ordering::SeqCst)
    }

    fn signal(&self) -> Option<i32> {
        match SIGNAL_RECEIVED.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }
}

/// Interrupt triggered from code, e.g. by tests or an embedding application
#[derive(Clone, Default)]
pub struct ManualInterrupt {
    flag: Arc<AtomicBool>,
}

impl ManualInterrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl InterruptSource for ManualInterrupt {
    fn interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_handler_init() {
        let handler = SignalHandler::init();
        assert!(handler.is_ok());
    }

    #[test]
    fn test_interrupt_flag() {
        let handler = SignalHandler::init().unwrap();
        handler.reset();
        assert!(!handler.interrupted());

        // Simulate signal
        SignalHandler::signal_handler(libc::SIGTERM);
        assert!(handler.interrupted());
        assert_eq!(handler.signal(), Some(libc::SIGTERM));

        handler.reset();
    }

    #[test]
    fn manual_interrupt_wakes_waiter() {
        let interrupt = ManualInterrupt::new();
        let trigger = interrupt.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            trigger.trigger();
        });

        let start = Instant::now();
        assert!(interrupt.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires_without_interrupt() {
        let interrupt = ManualInterrupt::new();
        assert!(!interrupt.wait_timeout(Duration::from_millis(120)));
    }
}

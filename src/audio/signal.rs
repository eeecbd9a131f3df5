//! Signalling between the device completion notification and the player thread.
//!
//! Device drivers must not be re-entered from their own completion
//! notifications, so the notification only raises a flag here and the player
//! thread does the actual refill. Both signals are auto-reset: raising one
//! several times before it is observed counts once.

use std::sync::{Arc, Condvar, Mutex};

/// What woke the player thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerSignal {
    /// The device finished with the submitted buffer.
    BufferReturned,
    /// The engine asked the player thread to exit.
    Exit,
}

#[derive(Debug, Default)]
struct Flags {
    buffer_returned: bool,
    exit: bool,
}

/// The pair of wake-up signals shared by the engine, the device and the
/// player thread.
#[derive(Debug, Default)]
pub struct PlayerSignals {
    flags: Mutex<Flags>,
    wake: Condvar,
}

impl PlayerSignals {
    /// Creates a new pair of cleared signals.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Raises the "buffer returned" signal.
    pub fn raise_buffer_returned(&self) {
        self.raise(|flags| flags.buffer_returned = true);
    }

    /// Raises the "exit requested" signal.
    pub fn raise_exit(&self) {
        self.raise(|flags| flags.exit = true);
    }

    /// Clears both signals.
    pub fn reset(&self) {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        *flags = Flags::default();
    }

    /// Blocks until either signal is raised, then consumes it.
    ///
    /// A pending exit always wins over a pending buffer return, so the
    /// player never runs an extra refill after exit has been requested.
    pub fn wait(&self) -> PlayerSignal {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if flags.exit {
                flags.exit = false;
                return PlayerSignal::Exit;
            }
            if flags.buffer_returned {
                flags.buffer_returned = false;
                return PlayerSignal::BufferReturned;
            }
            flags = self.wake.wait(flags).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Returns a handle that can only raise "buffer returned".
    pub fn notifier(self: &Arc<Self>) -> BufferNotifier {
        BufferNotifier {
            signals: Arc::clone(self),
        }
    }

    fn raise(&self, set: impl FnOnce(&mut Flags)) {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        set(&mut flags);
        self.wake.notify_all();
    }
}

/// Handed to the device on open; the device calls [`buffer_done`](Self::buffer_done)
/// from its completion context whenever it has finished with a buffer.
#[derive(Debug, Clone)]
pub struct BufferNotifier {
    signals: Arc<PlayerSignals>,
}

impl BufferNotifier {
    /// Reports that the device has finished with the submitted buffer.
    ///
    /// Never blocks beyond a brief lock and never calls into the device.
    pub fn buffer_done(&self) {
        self.signals.raise_buffer_returned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_exit_wins_over_pending_buffer() {
        let signals = PlayerSignals::new();
        signals.raise_buffer_returned();
        signals.raise_exit();

        assert_eq!(signals.wait(), PlayerSignal::Exit);
        // The buffer signal is still pending afterwards
        assert_eq!(signals.wait(), PlayerSignal::BufferReturned);
    }

    #[test]
    fn test_signals_are_auto_reset() {
        let signals = PlayerSignals::new();
        let notifier = signals.notifier();
        notifier.buffer_done();
        notifier.buffer_done();

        assert_eq!(signals.wait(), PlayerSignal::BufferReturned);
        signals.raise_exit();
        assert_eq!(signals.wait(), PlayerSignal::Exit);
    }

    #[test]
    fn test_reset_clears_both() {
        let signals = PlayerSignals::new();
        signals.raise_buffer_returned();
        signals.raise_exit();
        signals.reset();

        let waiter = {
            let signals = Arc::clone(&signals);
            thread::spawn(move || signals.wait())
        };
        thread::sleep(Duration::from_millis(20));
        signals.notifier().buffer_done();
        assert_eq!(waiter.join().unwrap(), PlayerSignal::BufferReturned);
    }

    #[test]
    fn test_wakes_blocked_waiter() {
        let signals = PlayerSignals::new();
        let waiter = {
            let signals = Arc::clone(&signals);
            thread::spawn(move || signals.wait())
        };
        thread::sleep(Duration::from_millis(20));
        signals.raise_exit();
        assert_eq!(waiter.join().unwrap(), PlayerSignal::Exit);
    }
}

//! SENDME flow control
//!
//! Circuit-level and stream-level send windows, counted in RELAY_DATA
//! cells: 1000/100 for circuits, 500/50 for streams. A writer whose window
//! is exhausted suspends until the circuit's reader task credits the window
//! from an incoming SENDME. The receive side counts delivered DATA cells
//! and emits SENDME v1 acknowledgements carrying the running backward
//! digest of the last hop.

use std::sync::Mutex;
use tokio::sync::Notify;

/// Initial circuit-level send window.
pub const CIRC_WINDOW_INITIAL: i32 = 1000;
/// Initial stream-level send window.
pub const STREAM_WINDOW_INITIAL: i32 = 500;
/// Window credit per circuit-level SENDME; also the emission threshold.
pub const CIRC_SENDME_INCREMENT: i32 = 100;
/// Window credit per stream-level SENDME; also the emission threshold.
pub const STREAM_SENDME_INCREMENT: i32 = 50;

/// SENDME v1 version byte.
const SENDME_VERSION: u8 = 1;
/// SENDME v1 digest length.
const SENDME_DIGEST_LEN: usize = 20;

/// A send window that suspends writers instead of failing them.
pub(crate) struct SendWindow {
    available: Mutex<i32>,
    notify: Notify,
}

impl SendWindow {
    pub fn new(initial: i32) -> Self {
        Self {
            available: Mutex::new(initial),
            notify: Notify::new(),
        }
    }

    /// Takes one cell's worth of window, waiting for a SENDME credit when
    /// the window is exhausted.
    pub async fn reserve(&self) {
        let mut notified = std::pin::pin!(self.notify.notified());
        loop {
            notified.as_mut().enable();
            if self.try_reserve() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Non-blocking variant; returns false when the window is exhausted.
    pub fn try_reserve(&self) -> bool {
        let mut w = self.available.lock().expect("window lock");
        if *w > 0 {
            *w -= 1;
            true
        } else {
            false
        }
    }

    /// Credits the window (SENDME received) and wakes suspended writers.
    pub fn add(&self, n: i32) {
        let mut w = self.available.lock().expect("window lock");
        *w += n;
        log::trace!("send window now {}", *w);
        drop(w);
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn available(&self) -> i32 {
        *self.available.lock().expect("window lock")
    }
}

/// Counts received DATA cells toward the next SENDME emission.
#[derive(Debug, Default)]
pub(crate) struct RecvAccounting {
    received: i32,
}

impl RecvAccounting {
    /// Notes one delivered RELAY_DATA cell. Returns true exactly when the
    /// threshold is reached; the counter resets with the emission.
    pub fn note_data(&mut self, threshold: i32) -> bool {
        self.received += 1;
        if self.received >= threshold {
            self.received = 0;
            true
        } else {
            false
        }
    }
}

/// SENDME v1 payload: version | u16 digest length | 20-byte digest of the
/// acknowledged traffic.
pub(crate) fn sendme_v1_payload(backward_digest: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(3 + SENDME_DIGEST_LEN);
    payload.push(SENDME_VERSION);
    payload.extend_from_slice(&(SENDME_DIGEST_LEN as u16).to_be_bytes());
    payload.extend_from_slice(&backward_digest[..SENDME_DIGEST_LEN]);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn sendme_payload_shape() {
        let digest: Vec<u8> = (0..32).collect();
        let payload = sendme_v1_payload(&digest);
        assert_eq!(payload.len(), 23);
        assert_eq!(payload[0], 1);
        assert_eq!(&payload[1..3], &[0, 20]);
        assert_eq!(&payload[3..], &digest[..20]);
    }

    #[test]
    fn accounting_triggers_at_threshold() {
        let mut acct = RecvAccounting::default();
        for _ in 0..99 {
            assert!(!acct.note_data(100));
        }
        assert!(acct.note_data(100));
        // Counter reset atomically with the trigger.
        for _ in 0..99 {
            assert!(!acct.note_data(100));
        }
        assert!(acct.note_data(100));
    }

    #[test]
    fn window_reserve_and_credit() {
        let w = SendWindow::new(2);
        assert!(w.try_reserve());
        assert!(w.try_reserve());
        assert!(!w.try_reserve());
        w.add(50);
        assert_eq!(w.available(), 50);
        assert!(w.try_reserve());
    }

    #[tokio::test]
    async fn exhausted_window_suspends_until_credit() {
        let w = Arc::new(SendWindow::new(1));
        w.reserve().await; // consume the only slot

        let waiter = {
            let w = Arc::clone(&w);
            tokio::spawn(async move {
                w.reserve().await;
            })
        };

        // The writer stays suspended until a credit arrives.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        w.add(STREAM_SENDME_INCREMENT);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("writer should wake on SENDME credit")
            .unwrap();
        assert_eq!(w.available(), STREAM_SENDME_INCREMENT - 1);
    }

    #[tokio::test]
    async fn credit_wakes_all_writers() {
        let w = Arc::new(SendWindow::new(0));
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let w = Arc::clone(&w);
            tasks.push(tokio::spawn(async move { w.reserve().await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        w.add(3);
        for t in tasks {
            tokio::time::timeout(Duration::from_secs(1), t)
                .await
                .expect("all writers wake")
                .unwrap();
        }
        assert_eq!(w.available(), 0);
    }
}

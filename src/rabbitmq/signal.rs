// src/rabbitmq/signal.rs
//! Single-fire close notifications for connections and sessions.
//!
//! Every connection and every session owns one [`SignalSlot`]. Subscribers get
//! a [`CloseSignal`] that completes exactly once, when the slot fires or when
//! the slot is dropped. A slot that has already fired answers new subscribers
//! immediately, so a close that races with subscription is never lost.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// The error carried by an involuntary close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFault(String);

impl CloseFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl fmt::Display for CloseFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CloseFault {}

type Outcome = Option<CloseFault>;

#[derive(Default)]
struct SlotState {
    fired: Option<Outcome>,
    waiters: Vec<oneshot::Sender<Outcome>>,
    followers: Vec<SignalSlot>,
}

/// Firing side of a close notification.
#[derive(Clone, Default)]
pub struct SignalSlot {
    state: Arc<Mutex<SlotState>>,
}

impl SignalSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> CloseSignal {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        match &state.fired {
            Some(outcome) => {
                let _ = tx.send(outcome.clone());
            }
            None => state.waiters.push(tx),
        }
        CloseSignal { rx: Some(rx) }
    }

    /// Fire the slot. Returns false if it had already fired.
    pub fn fire(&self, fault: Option<CloseFault>) -> bool {
        let followers = {
            let mut state = self.lock();
            if state.fired.is_some() {
                return false;
            }
            state.fired = Some(fault.clone());
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(fault.clone());
            }
            std::mem::take(&mut state.followers)
        };

        for follower in followers {
            follower.fire(fault.clone());
        }
        true
    }

    /// Make `follower` fire with this slot's fault when this slot fires.
    pub fn chain(&self, follower: SignalSlot) {
        let fired = {
            let mut state = self.lock();
            match &state.fired {
                Some(outcome) => Some(outcome.clone()),
                None => {
                    state.followers.push(follower.clone());
                    None
                }
            }
        };

        if let Some(outcome) = fired {
            follower.fire(outcome);
        }
    }

    pub fn is_fired(&self) -> bool {
        self.lock().fired.is_some()
    }

    /// Number of subscribers still waiting for this slot to fire.
    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// Receiving side of a close notification for one epoch.
#[derive(Debug)]
pub struct CloseSignal {
    rx: Option<oneshot::Receiver<Outcome>>,
}

impl CloseSignal {
    /// Wait for the close. `None` means the close was voluntary.
    ///
    /// Once the signal has been consumed this never completes again.
    pub async fn recv(&mut self) -> Option<CloseFault> {
        match self.rx.as_mut() {
            Some(rx) => {
                let outcome = rx.await.unwrap_or(None);
                self.rx = None;
                outcome
            }
            None => std::future::pending().await,
        }
    }

    /// Consume the signal to completion, discarding its value.
    pub async fn drain(&mut self) {
        if let Some(rx) = self.rx.take() {
            let _ = rx.await;
        }
    }

    pub fn is_drained(&self) -> bool {
        self.rx.is_none()
    }
}

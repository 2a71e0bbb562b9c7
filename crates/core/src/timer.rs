//! Single-shot, resettable inactivity watchdog.
//!
//! Every `arm` replaces whatever was pending, so at most one timer is live at
//! a time. A fired timer hands its ticket to the owner, who redeems it with
//! [`InactivityTimer::take_fired`]; tickets from cancelled or replaced timers
//! are refused, which makes a late delivery harmless.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// How long the child may stay silent before a hint is offered.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_millis(7000);

/// Identifies one arming of the timer.
pub type TimerTicket = u64;

struct Pending {
    ticket: TimerTicket,
    deadline: Instant,
    handle: JoinHandle<()>,
}

pub struct InactivityTimer {
    interval: Duration,
    next_ticket: TimerTicket,
    pending: Option<Pending>,
}

impl InactivityTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_ticket: 0,
            pending: None,
        }
    }

    /// Cancels any pending timer and schedules a new one.
    ///
    /// `on_fire` runs once, on the runtime, after the interval elapses, and
    /// receives the ticket of this arming.
    pub fn arm<F>(&mut self, on_fire: F) -> TimerTicket
    where
        F: FnOnce(TimerTicket) + Send + 'static,
    {
        self.cancel();
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let deadline = Instant::now() + self.interval;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_fire(ticket);
        });
        debug!(ticket, interval_ms = self.interval.as_millis() as u64, "Inactivity timer armed");
        self.pending = Some(Pending {
            ticket,
            deadline,
            handle,
        });
        ticket
    }

    /// Cancels the pending timer, if any. Calling it again is a no-op.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.handle.abort();
            debug!(ticket = pending.ticket, "Inactivity timer cancelled");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// When the pending timer is due, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Accepts a fired ticket exactly once.
    ///
    /// Returns `false` when the ticket belongs to a timer that has since been
    /// cancelled or replaced.
    pub fn take_fired(&mut self, ticket: TimerTicket) -> bool {
        match &self.pending {
            Some(pending) if pending.ticket == ticket => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

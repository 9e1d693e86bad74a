//! Scheduler timer in virtual milliseconds
//!
//! The timer only records when the scheduler wants to run next. Whoever owns
//! the scheduler (the service task, a test, the simulator) sleeps until
//! [`TxTimer::deadline`] and calls back in.

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TxTimer {
    deadline: Option<u32>,
    /// The timer exists; it stays alive after firing until cancelled
    created: bool,
    worker_pending: bool,
}

impl TxTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the timer and arm it `delay_ms` after `now`
    pub fn create(&mut self, now: u32, delay_ms: u32) {
        self.created = true;
        self.deadline = Some(now.wrapping_add(delay_ms));
    }

    /// Re-arm a timer that exists, including one that already fired.
    /// Does nothing once the timer has been cancelled.
    pub fn modify(&mut self, now: u32, delay_ms: u32) {
        if self.created {
            self.deadline = Some(now.wrapping_add(delay_ms));
        }
    }

    pub fn cancel(&mut self) {
        self.created = false;
        self.deadline = None;
    }

    /// Ask for a scheduling pass as soon as the owner gets control back
    pub fn schedule_immediate(&mut self) {
        self.worker_pending = true;
    }

    /// Consume a pending scheduling pass request
    pub fn take_worker(&mut self) -> bool {
        std::mem::take(&mut self.worker_pending)
    }

    pub fn worker_pending(&self) -> bool {
        self.worker_pending
    }

    pub fn deadline(&self) -> Option<u32> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whether an armed deadline has been reached at `now`
    pub fn is_due(&self, now: u32) -> bool {
        match self.deadline {
            Some(deadline) => now.wrapping_sub(deadline) as i32 >= 0,
            None => false,
        }
    }

    /// Disarm and return whether the deadline was reached
    pub fn fire(&mut self, now: u32) -> bool {
        if self.is_due(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.cancel();
        self.worker_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_at_deadline() {
        let mut timer = TxTimer::new();
        timer.create(100, 25);
        assert_eq!(timer.deadline(), Some(125));
        assert!(!timer.fire(124));
        assert!(timer.fire(125));
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_timer_across_wrap() {
        let mut timer = TxTimer::new();
        timer.create(u32::MAX - 5, 10);
        assert_eq!(timer.deadline(), Some(4));
        assert!(!timer.is_due(u32::MAX));
        assert!(timer.is_due(4));
    }

    #[test]
    fn test_worker_request_is_consumed_once() {
        let mut timer = TxTimer::new();
        timer.schedule_immediate();
        assert!(timer.take_worker());
        assert!(!timer.take_worker());
    }

    #[test]
    fn test_modify_rearms_fired_timer_only() {
        let mut timer = TxTimer::new();
        timer.modify(0, 10);
        assert!(!timer.is_armed());

        timer.create(0, 10);
        assert!(timer.fire(10));
        timer.modify(10, 25);
        assert_eq!(timer.deadline(), Some(35));

        timer.cancel();
        timer.modify(40, 25);
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_cancel() {
        let mut timer = TxTimer::new();
        timer.create(0, 10);
        timer.modify(5, 10);
        assert_eq!(timer.deadline(), Some(15));
        timer.cancel();
        assert!(!timer.is_due(1000));
    }
}

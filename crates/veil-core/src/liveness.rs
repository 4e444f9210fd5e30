//! Server-side heartbeat bookkeeping for a connection.

/// What the heartbeat should do on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// The connection proved liveness since the last tick.
    Idle,
    /// Send a ping.
    Ping,
    /// Too many pings went unanswered; close the connection.
    Expired,
}

/// Tracks liveness proofs between heartbeat ticks.
///
/// Any inbound frame or pong counts as proof. A connection is pinged once it
/// has been silent for a full interval and expires after `missed_limit`
/// consecutive unanswered pings.
#[derive(Debug, Clone)]
pub struct Liveness {
    alive: bool,
    pinged: bool,
    missed: u32,
    missed_limit: u32,
}

impl Liveness {
    /// Create a tracker for a freshly opened connection.
    #[must_use]
    pub fn new(missed_limit: u32) -> Self {
        Self {
            alive: true,
            pinged: false,
            missed: 0,
            missed_limit: missed_limit.max(1),
        }
    }

    /// Record a liveness proof.
    pub fn mark_alive(&mut self) {
        self.alive = true;
        self.pinged = false;
        self.missed = 0;
    }

    /// Advance one heartbeat interval.
    pub fn tick(&mut self) -> Heartbeat {
        if self.alive {
            self.alive = false;
            self.missed = 0;
            return Heartbeat::Idle;
        }
        if self.pinged {
            self.missed += 1;
        }
        if self.missed >= self.missed_limit {
            return Heartbeat::Expired;
        }
        self.pinged = true;
        Heartbeat::Ping
    }

    /// Consecutive unanswered pings.
    #[must_use]
    pub fn missed(&self) -> u32 {
        self.missed
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_missed_pongs_expire() {
        let mut liveness = Liveness::default();
        assert_eq!(liveness.tick(), Heartbeat::Idle);
        assert_eq!(liveness.tick(), Heartbeat::Ping);
        assert_eq!(liveness.tick(), Heartbeat::Ping);
        assert_eq!(liveness.missed(), 1);
        assert_eq!(liveness.tick(), Heartbeat::Expired);
    }

    #[test]
    fn test_activity_resets() {
        let mut liveness = Liveness::default();
        liveness.tick();
        assert_eq!(liveness.tick(), Heartbeat::Ping);
        assert_eq!(liveness.tick(), Heartbeat::Ping);

        liveness.mark_alive();
        assert_eq!(liveness.missed(), 0);
        assert_eq!(liveness.tick(), Heartbeat::Idle);
        assert_eq!(liveness.tick(), Heartbeat::Ping);
    }

    #[test]
    fn test_busy_connection_never_pinged() {
        let mut liveness = Liveness::default();
        for _ in 0..10 {
            liveness.mark_alive();
            assert_eq!(liveness.tick(), Heartbeat::Idle);
        }
    }
}

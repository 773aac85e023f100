//! Drift-compensating pacing clock
//!
//! Each tick measures how far the previous sleep overshot or undershot the
//! frame duration and shortens or lengthens the next sleep by the same amount,
//! so the average output rate stays at one packet per duration.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PacingClock {
    duration_us: u64,
    last_tick: Option<u64>,
    origin: Instant,
}

impl PacingClock {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration_us: duration.as_micros() as u64,
            last_tick: None,
            origin: Instant::now(),
        }
    }

    pub fn duration_us(&self) -> u64 {
        self.duration_us
    }

    pub fn reset(&mut self) {
        self.last_tick = None;
    }

    /// Sleep to apply before the next output, measured against the wall clock
    pub fn next_wait(&mut self) -> Duration {
        let now = self.origin.elapsed().as_micros() as u64;
        Duration::from_micros(self.next_wait_at(now))
    }

    /// Core of the compensation, in microseconds since an arbitrary origin
    pub fn next_wait_at(&mut self, now: u64) -> u64 {
        let duration = self.duration_us;
        if duration == 0 {
            return 0;
        }
        let Some(last) = self.last_tick else {
            self.last_tick = Some(now);
            return duration;
        };

        let accuracy = now.saturating_sub(last);
        let mut tick = now;
        let wait = if accuracy < duration {
            // fired early
            let early = duration - accuracy;
            tick += early;
            duration + early
        } else if accuracy > duration {
            let late = accuracy - duration;
            if late < duration {
                tick = tick.saturating_sub(late);
                duration - late
            } else {
                // more than a whole frame late: fire now, carry the rest
                tick = tick.saturating_sub(late - duration);
                0
            }
        } else {
            duration
        };
        self.last_tick = Some(tick);
        wait
    }
}

//! Timer module.

use core::ops::{Add, Sub};

use embassy_time::Duration;

/// A point on the free-running microsecond tick counter.
///
/// The counter is 32 bits wide and wraps around roughly every 71 minutes. Ordering is defined
/// relative to the other tick: `a` is before `b` when the signed distance from `b` to `a` is
/// negative. This is only meaningful for ticks less than half the counter range apart.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticks(pub u32);

impl Ticks {
    /// Number of ticks per second.
    pub const PER_SECOND: u32 = 1_000_000;

    /// Create a tick value from a raw counter value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw counter value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Signed distance from `other` to `self` in ticks.
    pub const fn delta(self, other: Ticks) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// Returns `true` if `self` lies strictly before `other`.
    pub const fn is_before(self, other: Ticks) -> bool {
        self.delta(other) < 0
    }

    /// Returns `true` if `self` lies strictly after `other`.
    pub const fn is_after(self, other: Ticks) -> bool {
        self.delta(other) > 0
    }

    /// Add a number of microseconds.
    pub const fn add_micros(self, us: u32) -> Self {
        Self(self.0.wrapping_add(us))
    }

    /// Subtract a number of microseconds.
    pub const fn sub_micros(self, us: u32) -> Self {
        Self(self.0.wrapping_sub(us))
    }
}

impl Add<Duration> for Ticks {
    type Output = Ticks;

    fn add(self, rhs: Duration) -> Ticks {
        self.add_micros(usecs(rhs))
    }
}

impl Sub<Duration> for Ticks {
    type Output = Ticks;

    fn sub(self, rhs: Duration) -> Ticks {
        self.sub_micros(usecs(rhs))
    }
}

/// Convert a duration to microsecond ticks, saturating at the counter range.
pub fn usecs(d: Duration) -> u32 {
    u32::try_from(d.as_micros()).unwrap_or(u32::MAX)
}

/// Hardware alarms the link layer programs.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
    /// Start of the next scheduled item.
    Scheduler,
    /// Wait-for-response deadline after a transmission that expects a reply.
    WaitForResponse,
}

/// Trait for time providers.
///
/// The hardware interface has to provide an implementation of `Timer` to the stack. The
/// implementation must have microsecond accuracy.
///
/// This trait can also be implemented by a mock timer for testing.
pub trait Timer {
    /// Obtain the current time as [`Ticks`].
    ///
    /// The values returned by this function must never move backwards in time, except when
    /// the underlying value wraps around.
    fn now(&self) -> Ticks;

    /// Arm `alarm` to fire at `at`.
    ///
    /// When it fires, the interrupt handler must call
    /// [`LinkLayer::on_alarm`](crate::link::LinkLayer::on_alarm). Re-arming replaces the previous
    /// deadline of the same alarm.
    fn set_alarm(&mut self, alarm: Alarm, at: Ticks);

    /// Disarm `alarm`. Disarming an alarm that is not armed has no effect.
    fn clear_alarm(&mut self, alarm: Alarm);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_survives_wraparound() {
        let a = Ticks(u32::MAX - 10);
        let b = a.add_micros(20);
        assert_eq!(b, Ticks(9));
        assert!(a.is_before(b));
        assert!(b.is_after(a));
        assert_eq!(b.delta(a), 20);
        assert_eq!(a.delta(b), -20);
        assert!(!a.is_before(a));
    }

    #[test]
    fn duration_arithmetic() {
        let t = Ticks(1_000);
        assert_eq!(t + Duration::from_millis(10), Ticks(11_000));
        assert_eq!(t - Duration::from_micros(1_001), Ticks(u32::MAX));
        assert_eq!(usecs(Duration::from_secs(1)), Ticks::PER_SECOND);
    }
}

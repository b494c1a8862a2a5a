use std::time::Duration;

use rustix::time::{clock_gettime, ClockId};

/// Clock the kernel uses to stamp page-flip and vblank events
///
/// Drivers that advertise `DRM_CAP_TIMESTAMP_MONOTONIC` report
/// `CLOCK_MONOTONIC`, everything else reports wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentationClock {
    /// `CLOCK_MONOTONIC`
    Monotonic,
    /// `CLOCK_REALTIME`
    Realtime,
}

impl PresentationClock {
    /// Pick the clock matching the driver's timestamp capability
    pub fn for_device(monotonic_timestamps: bool) -> Self {
        if monotonic_timestamps {
            PresentationClock::Monotonic
        } else {
            PresentationClock::Realtime
        }
    }

    /// Gets the unix id of the clock, as advertised to presentation-time clients
    pub fn id(&self) -> libc::clockid_t {
        match self {
            PresentationClock::Monotonic => libc::CLOCK_MONOTONIC,
            PresentationClock::Realtime => libc::CLOCK_REALTIME,
        }
    }

    /// Returns the current time as an offset from the clock's epoch
    pub fn now(&self) -> Duration {
        let id = match self {
            PresentationClock::Monotonic => ClockId::Monotonic,
            PresentationClock::Realtime => ClockId::Realtime,
        };
        let tp = clock_gettime(id);
        Duration::new(tp.tv_sec.max(0) as u64, tp.tv_nsec.clamp(0, 999_999_999) as u32)
    }
}

/// Converts a refresh rate in mHz into the duration of one refresh cycle
///
/// A rate of zero yields [`Duration::ZERO`].
pub fn refresh_period(refresh_mhz: u32) -> Duration {
    if refresh_mhz == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(1_000_000_000_000u64 / refresh_mhz as u64)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{refresh_period, PresentationClock};

    #[test]
    fn monotonic_does_not_go_backwards() {
        let clock = PresentationClock::Monotonic;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
        assert_eq!(clock.id(), libc::CLOCK_MONOTONIC);
    }

    #[test]
    fn sixty_hertz_period() {
        assert_eq!(refresh_period(60_000), Duration::from_nanos(16_666_666));
        assert_eq!(refresh_period(0), Duration::ZERO);
    }
}

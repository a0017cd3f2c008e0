use std::{
    fmt,
    ops::{Add, AddAssign, Mul, Sub, SubAssign},
    sync::{
        atomic::{AtomicI64, Ordering as AtomicOrdering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const MILLION: i64 = 1_000_000;

/// A (seconds, microseconds) pair with microseconds kept in `[0, 1_000_000)`.
///
/// Shared representation behind [`EventTime`] and [`DelayInterval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
struct Timeval {
    secs: i64,
    usecs: i64,
}

impl Timeval {
    fn normalized(secs: i64, usecs: i64) -> Self {
        let secs = secs + usecs.div_euclid(MILLION);
        let usecs = usecs.rem_euclid(MILLION);
        Self { secs, usecs }
    }

    fn as_micros(&self) -> i64 {
        self.secs.saturating_mul(MILLION).saturating_add(self.usecs)
    }

    /// `self - other`, clamped to zero when `other` is later.
    fn saturating_sub(self, other: Self) -> Self {
        let mut secs = self.secs - other.secs;
        let mut usecs = self.usecs - other.usecs;
        if usecs < 0 {
            usecs += MILLION;
            secs -= 1;
        }
        if secs < 0 {
            Self::default()
        } else {
            Self { secs, usecs }
        }
    }

    fn add(self, other: Self) -> Self {
        let mut secs = self.secs + other.secs;
        let mut usecs = self.usecs + other.usecs;
        if usecs >= MILLION {
            usecs -= MILLION;
            secs += 1;
        }
        Self { secs, usecs }
    }
}

/// A relative amount of time. Never negative.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DelayInterval(Timeval);

impl DelayInterval {
    pub const ZERO: DelayInterval = DelayInterval::from_parts(0, 0);
    pub const SECOND: DelayInterval = DelayInterval::from_parts(1, 0);
    pub const MINUTE: DelayInterval = DelayInterval::from_parts(60, 0);
    pub const HOUR: DelayInterval = DelayInterval::from_parts(60 * 60, 0);
    pub const DAY: DelayInterval = DelayInterval::from_parts(24 * 60 * 60, 0);
    /// Represents "never". Larger than any delay a caller can schedule.
    pub const ETERNITY: DelayInterval = DelayInterval::from_parts(i32::MAX as i64, MILLION - 1);

    const fn from_parts(secs: i64, usecs: i64) -> Self {
        Self(Timeval { secs, usecs })
    }

    /// Build an interval, carrying excess microseconds into seconds.
    /// Negative totals clamp to zero.
    pub fn new(secs: i64, usecs: i64) -> Self {
        let tv = Timeval::normalized(secs, usecs);
        if tv.secs < 0 {
            Self::ZERO
        } else {
            Self(tv)
        }
    }

    /// Negative durations mean "as soon as possible" and clamp to zero.
    pub fn from_micros(micros: i64) -> Self {
        if micros <= 0 {
            return Self::ZERO;
        }
        Self(Timeval {
            secs: micros / MILLION,
            usecs: micros % MILLION,
        })
    }

    pub fn seconds(&self) -> i64 {
        self.0.secs
    }

    pub fn useconds(&self) -> i64 {
        self.0.usecs
    }

    pub fn as_micros(&self) -> i64 {
        self.0.as_micros()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Debug for DelayInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ETERNITY {
            f.write_str("ETERNITY")
        } else {
            write!(f, "{}.{:06}s", self.0.secs, self.0.usecs)
        }
    }
}

impl Add for DelayInterval {
    type Output = DelayInterval;

    fn add(self, rhs: DelayInterval) -> DelayInterval {
        DelayInterval(self.0.add(rhs.0))
    }
}

impl AddAssign for DelayInterval {
    fn add_assign(&mut self, rhs: DelayInterval) {
        *self = *self + rhs;
    }
}

impl Sub for DelayInterval {
    type Output = DelayInterval;

    /// Saturates at zero.
    fn sub(self, rhs: DelayInterval) -> DelayInterval {
        DelayInterval(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for DelayInterval {
    fn sub_assign(&mut self, rhs: DelayInterval) {
        *self = *self - rhs;
    }
}

impl Mul<DelayInterval> for i16 {
    type Output = DelayInterval;

    fn mul(self, rhs: DelayInterval) -> DelayInterval {
        let factor = i64::from(self);
        DelayInterval::new(factor * rhs.0.secs, factor * rhs.0.usecs)
    }
}

impl Mul<i16> for DelayInterval {
    type Output = DelayInterval;

    fn mul(self, rhs: i16) -> DelayInterval {
        rhs * self
    }
}

impl From<Duration> for DelayInterval {
    /// Durations past ETERNITY clamp to it.
    fn from(duration: Duration) -> Self {
        if duration >= Duration::from(DelayInterval::ETERNITY) {
            return DelayInterval::ETERNITY;
        }
        DelayInterval::from_parts(duration.as_secs() as i64, i64::from(duration.subsec_micros()))
    }
}

impl From<DelayInterval> for Duration {
    fn from(interval: DelayInterval) -> Self {
        Duration::new(interval.0.secs as u64, (interval.0.usecs * 1_000) as u32)
    }
}

/// An absolute point in time, measured from the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventTime(Timeval);

impl EventTime {
    pub const THE_END_OF_TIME: EventTime = EventTime(Timeval {
        secs: i32::MAX as i64,
        usecs: 0,
    });

    pub fn new(secs: i64, usecs: i64) -> Self {
        Self(Timeval::normalized(secs, usecs))
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(0, micros)
    }

    pub fn seconds(&self) -> i64 {
        self.0.secs
    }

    pub fn useconds(&self) -> i64 {
        self.0.usecs
    }

    pub fn as_micros(&self) -> i64 {
        self.0.as_micros()
    }
}

impl fmt::Debug for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{:06}", self.0.secs, self.0.usecs)
    }
}

impl Sub for EventTime {
    type Output = DelayInterval;

    /// Zero if `rhs` is not earlier than `self`.
    fn sub(self, rhs: EventTime) -> DelayInterval {
        DelayInterval(self.0.saturating_sub(rhs.0))
    }
}

impl Add<DelayInterval> for EventTime {
    type Output = EventTime;

    fn add(self, rhs: DelayInterval) -> EventTime {
        EventTime(self.0.add(rhs.0))
    }
}

impl AddAssign<DelayInterval> for EventTime {
    fn add_assign(&mut self, rhs: DelayInterval) {
        *self = *self + rhs;
    }
}

impl SubAssign<DelayInterval> for EventTime {
    /// Clamps at the epoch.
    fn sub_assign(&mut self, rhs: DelayInterval) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

/// Source of "now" for the delay queue.
///
/// Implementations may move backwards; the queue treats that as zero
/// elapsed time.
pub trait Clock {
    fn now(&self) -> EventTime;
}

/// Wall-clock time since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> EventTime {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => EventTime::new(
                i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
                i64::from(since.subsec_micros()),
            ),
            // clock set before 1970
            Err(_) => EventTime::default(),
        }
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: EventTime) -> Self {
        Self {
            micros: Arc::new(AtomicI64::new(start.as_micros())),
        }
    }

    pub fn advance(&self, by: DelayInterval) {
        self.micros.fetch_add(by.as_micros(), AtomicOrdering::SeqCst);
    }

    pub fn advance_micros(&self, micros: i64) {
        self.micros.fetch_add(micros, AtomicOrdering::SeqCst);
    }

    /// Move the clock to an arbitrary point, including into the past.
    pub fn set(&self, to: EventTime) {
        self.micros.store(to.as_micros(), AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> EventTime {
        EventTime::from_micros(self.micros.load(AtomicOrdering::SeqCst))
    }
}

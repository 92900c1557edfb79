use super::LogicalTime;
use std::time::{SystemTime, UNIX_EPOCH};

/// Coarse wall-clock source used to seed the seconds component of log times.
pub trait WallClock {
    /// Returns the current wall-clock time in whole seconds.
    fn now_secs(&mut self) -> u32;
}

impl<C: WallClock + ?Sized> WallClock for Box<C> {
    fn now_secs(&mut self) -> u32 {
        (**self).now_secs()
    }
}

/// System clock implementation backed by `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_secs(&mut self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs().min(u64::from(u32::MAX)) as u32)
            .unwrap_or(0)
    }
}

/// Stamps log entries with strictly increasing logical times.
#[derive(Debug)]
pub struct ClusterClock<C: WallClock> {
    clock: C,
    last: Option<LogicalTime>,
}

impl<C: WallClock> ClusterClock<C> {
    pub fn new(clock: C) -> Self {
        Self { clock, last: None }
    }

    /// Returns the most recently issued time.
    pub fn last(&self) -> Option<LogicalTime> {
        self.last
    }

    /// Issues the next time: the wall-clock second if it moved forward,
    /// otherwise the next increment within the current second.
    pub fn tick(&mut self) -> LogicalTime {
        let now_secs = self.clock.now_secs();
        let next = match self.last {
            Some(last) if now_secs <= last.secs => last.next(),
            _ => LogicalTime::new(now_secs, 1),
        };
        self.last = Some(next);
        next
    }

    /// Moves the clock past an externally supplied time.
    pub fn observe(&mut self, time: LogicalTime) {
        if self.last.map_or(true, |last| time > last) {
            self.last = Some(time);
        }
    }
}

//! Calendar edge detection. Once per second the broken-down local time
//! is compared against the last observed values; each changed field
//! fires its hook, second through year. The initial sentinels are -1 so
//! nothing fires on the very first tick.

use chrono::{Datelike, Local, LocalResult, TimeZone, Timelike};

#[derive(Debug)]
pub struct TimerState {
    prev_sec: i32,
    prev_min: i32,
    prev_hour: i32,
    prev_day: i32,
    prev_mon: i32,
    prev_year: i32,
}

/// Which calendar fields changed on this tick.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct Ticks {
    pub second: bool,
    pub minute: bool,
    pub hour: bool,
    pub day: bool,
    pub month: bool,
    pub year: bool,
}

impl TimerState {
    pub fn new() -> TimerState {
        TimerState {
            prev_sec: -1,
            prev_min: -1,
            prev_hour: -1,
            prev_day: -1,
            prev_mon: -1,
            prev_year: -1,
        }
    }

    /// Compare `t` against the previous observation and report edges.
    pub fn tick(&mut self, t: i64) -> Ticks {
        let dt = match Local.timestamp_opt(t, 0) {
            LocalResult::Single(dt) => dt,
            _ => return Ticks::default(),
        };

        let sec = dt.second() as i32;
        let min = dt.minute() as i32;
        let hour = dt.hour() as i32;
        let day = dt.day() as i32;
        let mon = dt.month() as i32;
        let year = dt.year();

        let ticks = Ticks {
            second: self.prev_sec != -1 && self.prev_sec != sec,
            minute: self.prev_min != -1 && self.prev_min != min,
            hour: self.prev_hour != -1 && self.prev_hour != hour,
            day: self.prev_day != -1 && self.prev_day != day,
            month: self.prev_mon != -1 && self.prev_mon != mon,
            year: self.prev_year != -1 && self.prev_year != year,
        };

        self.prev_sec = sec;
        self.prev_min = min;
        self.prev_hour = hour;
        self.prev_day = day;
        self.prev_mon = mon;
        self.prev_year = year;

        ticks
    }
}

impl Default for TimerState {
    fn default() -> TimerState {
        TimerState::new()
    }
}

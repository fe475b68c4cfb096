//! time helpers used by the poll loop and the session latency estimate.
//!
//! `StreamTimeStat` smooths the round trip latencies that the clock sync
//! exchanges produce so the reported value does not jump around with every
//! exchange.  The `MicroTimer` is how components know when to send the next
//! clock sync, give up on a connect attempt, or declare a peer dead.
use std::f64;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde::Serialize;

/// microseconds since the epoch.  Every deadline in the daemon is compared
/// against this one clock.
pub fn get_micro_time() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_micros()
}

#[derive(Debug, Deserialize, Serialize)]
struct MovingAverage {
    window: usize,
    total: f64,
    samples: Vec<f64>,
}

impl MovingAverage {
    fn new(window_size: usize) -> MovingAverage {
        MovingAverage {
            window: window_size,
            total: 0.0,
            samples: vec![0.0; window_size],
        }
    }
    fn get_mean(&self) -> f64 {
        self.total / self.window as f64
    }
    fn get_total(&self) -> f64 {
        self.total
    }
    fn get_window(&self) -> usize {
        self.window
    }
    fn add_sample(&mut self, v: f64) -> () {
        self.total += v;
        self.samples.push(v);
        self.total -= self.samples.remove(0);
    }
}

/// moving average filter that collects mean and sigma values for sequences
#[derive(Debug, Deserialize, Serialize)]
pub struct StreamTimeStat {
    window: u64,
    avg: MovingAverage,
    dev: MovingAverage,
}

impl StreamTimeStat {
    /// create a new stat collector with a specific window size
    pub fn new(window_size: u64) -> StreamTimeStat {
        StreamTimeStat {
            window: window_size,
            avg: MovingAverage::new(window_size as usize),
            dev: MovingAverage::new(window_size as usize),
        }
    }
    pub fn clear(&mut self) -> () {
        self.avg = MovingAverage::new(self.window as usize);
        self.dev = MovingAverage::new(self.window as usize);
    }
    pub fn get_mean(&self) -> f64 {
        self.avg.get_mean()
    }
    pub fn get_sigma(&self) -> f64 {
        f64::sqrt(self.dev.get_total()) / self.dev.get_window() as f64
    }
    pub fn get_window(&self) -> u64 {
        self.window
    }
    /// add a sample to the moving average sequence
    pub fn add_sample(&mut self, sample: f64) -> () {
        self.avg.add_sample(sample);
        let delta = sample - self.get_mean();
        self.dev.add_sample(delta * delta);
    }
}

impl fmt::Display for StreamTimeStat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ mean: {}, sigma: {} window: {} }}",
            self.get_mean(),
            self.get_sigma(),
            self.get_window()
        )
    }
}


/// Timer with microsecond accuracy to let things know when a certain time (or more) passed
#[derive(Debug)]
pub struct MicroTimer {
    last_time: u128,
    interval: u128,
}

impl MicroTimer {
    /// create a new timer with the current microsecond value and the interval (in microseconds)
    pub fn new(now: u128, interval: u128) -> MicroTimer {
        MicroTimer {
            last_time: now,
            interval: interval,
        }
    }
    /// reconfigure the interval
    pub fn set_interval(&mut self, interval: u128) -> () {
        self.interval = interval;
    }
    /// check if the timer is expired
    pub fn expired(&self, now: u128) -> bool {
        (self.last_time + self.interval) < now
    }
    /// reset the timer to the value of now
    pub fn reset(&mut self, now: u128) {
        self.last_time = now;
    }
    /// Ask how long since the last time you were reset
    pub fn since(&self, now: u128) -> u128 {
        now - self.last_time
    }
}

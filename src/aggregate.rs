//! Wall-clock aligned window averages and consumption snapshots.
//!
//! A window of `W` seconds closes at every timestamp `t` with `t mod W == 0`.
//! When it closes, the average of the readings folded since the previous
//! close is emitted and the accumulator is reset *before* the reading that
//! closed the window is folded in, so that reading opens the next window.

use crate::counters::{CounterCode, CounterDef, CounterMapping};
use crate::telegram::FieldId;
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: i64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Window {
    FiveMinutes,
    Hourly,
}

impl Window {
    pub const ALL: [Window; 2] = [Window::FiveMinutes, Window::Hourly];

    pub fn seconds(self) -> i64 {
        match self {
            Window::FiveMinutes => 300,
            Window::Hourly => 3600,
        }
    }

    pub fn closes_at(self, timestamp: i64) -> bool {
        timestamp.rem_euclid(self.seconds()) == 0
    }

    fn index(self) -> usize {
        match self {
            Window::FiveMinutes => 0,
            Window::Hourly => 1,
        }
    }

    fn destination(self) -> Destination {
        match self {
            Window::FiveMinutes => Destination::FiveMinute,
            Window::Hourly => Destination::Hourly,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WindowAccumulator {
    sum: f64,
    count: u64,
}

impl WindowAccumulator {
    #[cfg(test)]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[cfg(test)]
    pub fn count(&self) -> u64 {
        self.count
    }

    fn fold(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Returns the window average (if anything was folded) and resets.
    fn close(&mut self) -> Option<f64> {
        let average = (self.count > 0).then(|| self.sum / self.count as f64);
        *self = Self::default();
        average
    }
}

/// Store an emitted value is destined for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    Raw,
    FiveMinute,
    Hourly,
    Consumption,
}

impl Destination {
    pub const ALL: [Destination; 4] = [
        Destination::Raw,
        Destination::FiveMinute,
        Destination::Hourly,
        Destination::Consumption,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Destination::Raw => "raw",
            Destination::FiveMinute => "5-minute average",
            Destination::Hourly => "hourly average",
            Destination::Consumption => "consumption/production",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Emission {
    pub destination: Destination,
    pub counter: CounterDef,
    pub value: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tracking {
    /// Instantaneous reading, stored raw and averaged per window.
    Raw,
    /// Cumulative register, stored as-is on snapshot boundaries.
    Snapshot,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("counter {code} is already tracked as {existing:?}")]
    AlreadyTracked {
        code: CounterCode,
        existing: Tracking,
    },
    #[error("snapshot interval must be positive, got {0}")]
    InvalidInterval(i64),
}

#[derive(Debug)]
pub struct AggregationEngine {
    mapping: CounterMapping,
    tracked: HashMap<CounterCode, Tracking>,
    accumulators: HashMap<CounterCode, [WindowAccumulator; 2]>,
    snapshot_interval: i64,
}

impl AggregationEngine {
    pub fn new(mapping: CounterMapping) -> Self {
        Self {
            mapping,
            tracked: HashMap::new(),
            accumulators: HashMap::new(),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL_SECS,
        }
    }

    pub fn mapping(&self) -> &CounterMapping {
        &self.mapping
    }

    pub fn snapshot_interval(&self) -> i64 {
        self.snapshot_interval
    }

    pub fn set_snapshot_interval(&mut self, seconds: i64) -> Result<(), RegisterError> {
        if seconds <= 0 {
            return Err(RegisterError::InvalidInterval(seconds));
        }
        self.snapshot_interval = seconds;
        Ok(())
    }

    /// Registers a counter; re-registering with the same tracking is a no-op.
    pub fn register(
        &mut self,
        code: CounterCode,
        tracking: Tracking,
    ) -> Result<(), RegisterError> {
        match self.tracked.get(&code) {
            Some(existing) if *existing == tracking => return Ok(()),
            Some(existing) => {
                return Err(RegisterError::AlreadyTracked {
                    code,
                    existing: *existing,
                })
            }
            None => {}
        }
        self.tracked.insert(code, tracking);
        if tracking == Tracking::Raw {
            self.accumulators.insert(code, Default::default());
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn tracking(&self, code: CounterCode) -> Option<Tracking> {
        self.tracked.get(&code).copied()
    }

    #[cfg(test)]
    pub fn tracked(&self) -> impl Iterator<Item = (CounterCode, Tracking)> + '_ {
        self.tracked.iter().map(|(code, tracking)| (*code, *tracking))
    }

    #[cfg(test)]
    pub fn accumulator(&self, code: CounterCode, window: Window) -> Option<WindowAccumulator> {
        self.accumulators
            .get(&code)
            .map(|windows| windows[window.index()])
    }

    /// Feeds one reading. Untracked or unmapped fields produce nothing.
    pub fn observe(
        &mut self,
        timestamp: i64,
        field: FieldId,
        value: f64,
        out: &mut Vec<Emission>,
    ) {
        let Some(counter) = self.mapping.for_field(field).copied() else {
            return;
        };
        match self.tracked.get(&counter.code) {
            Some(Tracking::Raw) => self.observe_raw(timestamp, counter, value, out),
            Some(Tracking::Snapshot) => {
                if timestamp.rem_euclid(self.snapshot_interval) == 0 {
                    out.push(Emission {
                        destination: Destination::Consumption,
                        counter,
                        value,
                    });
                }
            }
            None => {}
        }
    }

    fn observe_raw(
        &mut self,
        timestamp: i64,
        counter: CounterDef,
        value: f64,
        out: &mut Vec<Emission>,
    ) {
        out.push(Emission {
            destination: Destination::Raw,
            counter,
            value,
        });

        let windows = self.accumulators.entry(counter.code).or_default();
        for window in Window::ALL {
            let accumulator = &mut windows[window.index()];
            if window.closes_at(timestamp) {
                match accumulator.close() {
                    Some(average) => out.push(Emission {
                        destination: window.destination(),
                        counter,
                        value: average,
                    }),
                    None => tracing::debug!(
                        counter = %counter.code,
                        window = window.seconds(),
                        timestamp,
                        "window closed without readings; nothing to average"
                    ),
                }
            }
            accumulator.fold(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(code: CounterCode, tracking: Tracking) -> AggregationEngine {
        let mut engine = AggregationEngine::new(CounterMapping::new());
        engine.register(code, tracking).expect("registered");
        engine
    }

    fn averages(emissions: &[Emission], destination: Destination) -> Vec<f64> {
        emissions
            .iter()
            .filter(|e| e.destination == destination)
            .map(|e| e.value)
            .collect()
    }

    #[test]
    fn five_minute_window_averages_readings_before_the_boundary() {
        let mut engine = engine_with(CounterCode::PowerUsed, Tracking::Raw);
        let readings = [
            (0, 10.0),
            (60, 20.0),
            (120, 30.0),
            (180, 40.0),
            (240, 50.0),
            (300, 60.0),
        ];

        let mut emitted_at = Vec::new();
        for (ts, value) in readings {
            let mut out = Vec::new();
            engine.observe(ts, FieldId::CurrentElectricityUsage, value, &mut out);
            for avg in averages(&out, Destination::FiveMinute) {
                emitted_at.push((ts, avg));
            }
        }

        assert_eq!(emitted_at, vec![(300, 30.0)]);
        let acc = engine
            .accumulator(CounterCode::PowerUsed, Window::FiveMinutes)
            .expect("tracked");
        assert_eq!((acc.sum(), acc.count()), (60.0, 1));

        // Hourly window only closed at t=0, with nothing folded yet.
        let hourly = engine
            .accumulator(CounterCode::PowerUsed, Window::Hourly)
            .expect("tracked");
        assert_eq!(hourly.count(), 6);
    }

    #[test]
    fn count_tracks_readings_between_boundaries() {
        let mut engine = engine_with(CounterCode::VoltageL1, Tracking::Raw);
        let mut out = Vec::new();
        for ts in 301..=399 {
            engine.observe(ts, FieldId::InstantaneousVoltageL1, 230.0, &mut out);
        }
        let acc = engine
            .accumulator(CounterCode::VoltageL1, Window::FiveMinutes)
            .expect("tracked");
        assert_eq!(acc.count(), 99);
        assert!(averages(&out, Destination::FiveMinute).is_empty());
        assert_eq!(averages(&out, Destination::Raw).len(), 99);
    }

    #[test]
    fn windows_close_independently() {
        let mut engine = engine_with(CounterCode::PowerUsed, Tracking::Raw);
        let mut out = Vec::new();
        engine.observe(3599, FieldId::CurrentElectricityUsage, 1.0, &mut out);
        out.clear();

        engine.observe(3600, FieldId::CurrentElectricityUsage, 3.0, &mut out);
        assert_eq!(averages(&out, Destination::FiveMinute), vec![1.0]);
        assert_eq!(averages(&out, Destination::Hourly), vec![1.0]);
        out.clear();

        engine.observe(3900, FieldId::CurrentElectricityUsage, 5.0, &mut out);
        assert_eq!(averages(&out, Destination::FiveMinute), vec![3.0]);
        assert!(averages(&out, Destination::Hourly).is_empty());

        let hourly = engine
            .accumulator(CounterCode::PowerUsed, Window::Hourly)
            .expect("tracked");
        assert_eq!((hourly.sum(), hourly.count()), (8.0, 2));
    }

    #[test]
    fn empty_window_skips_emission_and_still_folds() {
        let mut engine = engine_with(CounterCode::PowerUsed, Tracking::Raw);
        let mut out = Vec::new();
        engine.observe(600, FieldId::CurrentElectricityUsage, 4.0, &mut out);

        assert!(averages(&out, Destination::FiveMinute).is_empty());
        let acc = engine
            .accumulator(CounterCode::PowerUsed, Window::FiveMinutes)
            .expect("tracked");
        assert_eq!((acc.sum(), acc.count()), (4.0, 1));
    }

    #[test]
    fn snapshot_counter_never_averages() {
        let mut engine = engine_with(CounterCode::Used1, Tracking::Snapshot);
        let mut out = Vec::new();
        for ts in [0, 60, 299, 300, 3600] {
            engine.observe(ts, FieldId::ElectricityUsedTariff1, 1000.0 + ts as f64, &mut out);
        }
        assert!(out
            .iter()
            .all(|e| e.destination == Destination::Consumption));
        assert_eq!(
            averages(&out, Destination::Consumption),
            vec![1000.0, 1300.0, 4600.0]
        );
        assert!(engine
            .accumulator(CounterCode::Used1, Window::FiveMinutes)
            .is_none());
    }

    #[test]
    fn raw_counter_never_snapshots() {
        let mut engine = engine_with(CounterCode::PowerUsed, Tracking::Raw);
        let mut out = Vec::new();
        for ts in [0, 300, 600] {
            engine.observe(ts, FieldId::CurrentElectricityUsage, 1.0, &mut out);
        }
        assert!(averages(&out, Destination::Consumption).is_empty());
    }

    #[test]
    fn snapshot_interval_override_is_honoured() {
        let mut engine = engine_with(CounterCode::Gas, Tracking::Snapshot);
        engine.set_snapshot_interval(3600).expect("valid");
        assert_eq!(
            engine.set_snapshot_interval(0),
            Err(RegisterError::InvalidInterval(0))
        );
        assert_eq!(engine.snapshot_interval(), 3600);

        let mut out = Vec::new();
        engine.observe(300, FieldId::HourlyGasMeterReading, 12.0, &mut out);
        assert!(out.is_empty());
        engine.observe(7200, FieldId::HourlyGasMeterReading, 13.0, &mut out);
        assert_eq!(averages(&out, Destination::Consumption), vec![13.0]);
    }

    #[test]
    fn tracking_classes_are_exclusive() {
        let mut engine = engine_with(CounterCode::PowerUsed, Tracking::Raw);
        assert_eq!(engine.register(CounterCode::PowerUsed, Tracking::Raw), Ok(()));
        assert_eq!(
            engine.register(CounterCode::PowerUsed, Tracking::Snapshot),
            Err(RegisterError::AlreadyTracked {
                code: CounterCode::PowerUsed,
                existing: Tracking::Raw
            })
        );
        assert_eq!(engine.tracking(CounterCode::PowerUsed), Some(Tracking::Raw));
    }

    #[test]
    fn untracked_fields_are_ignored() {
        let mut engine = engine_with(CounterCode::PowerUsed, Tracking::Raw);
        let mut out = Vec::new();
        engine.observe(300, FieldId::InstantaneousVoltageL1, 230.0, &mut out);
        engine.observe(300, FieldId::P1MessageHeader, 50.0, &mut out);
        assert!(out.is_empty());
    }
}

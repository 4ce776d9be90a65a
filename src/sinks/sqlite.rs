use super::store::{MeasurementStore, SqliteStore};
use super::{Sink, SinkError};
use crate::aggregate::{AggregationEngine, Destination, Emission, Tracking};
use crate::config::LegacyDatabaseConfig;
use crate::counters::{CounterCode, CounterMapping};
use crate::telegram::Telegram;
use std::path::Path;

/// The four optional backing stores of the SQLite sink.
pub struct Stores<S> {
    pub raw: Option<S>,
    pub five_minute: Option<S>,
    pub hourly: Option<S>,
    pub consumption: Option<S>,
}

impl<S> Default for Stores<S> {
    fn default() -> Self {
        Self {
            raw: None,
            five_minute: None,
            hourly: None,
            consumption: None,
        }
    }
}

impl<S> Stores<S> {
    #[cfg(test)]
    pub fn get(&self, destination: Destination) -> Option<&S> {
        match destination {
            Destination::Raw => self.raw.as_ref(),
            Destination::FiveMinute => self.five_minute.as_ref(),
            Destination::Hourly => self.hourly.as_ref(),
            Destination::Consumption => self.consumption.as_ref(),
        }
    }

    fn get_mut(&mut self, destination: Destination) -> Option<&mut S> {
        match destination {
            Destination::Raw => self.raw.as_mut(),
            Destination::FiveMinute => self.five_minute.as_mut(),
            Destination::Hourly => self.hourly.as_mut(),
            Destination::Consumption => self.consumption.as_mut(),
        }
    }
}

impl Stores<SqliteStore> {
    pub fn open(config: &LegacyDatabaseConfig) -> Self {
        Self {
            raw: open_store(config.raw_db.as_deref(), Destination::Raw),
            five_minute: open_store(config.fivemin_avg.as_deref(), Destination::FiveMinute),
            hourly: open_store(config.hourly_avg.as_deref(), Destination::Hourly),
            consumption: open_store(config.total_consumed.as_deref(), Destination::Consumption),
        }
    }
}

fn open_store(path: Option<&Path>, destination: Destination) -> Option<SqliteStore> {
    let Some(path) = path else {
        tracing::info!(
            store = destination.label(),
            "no database configured for the sqlite3 sink"
        );
        return None;
    };
    match SqliteStore::open(path) {
        Ok(store) => {
            tracing::info!(
                path = %path.display(),
                store = destination.label(),
                "opened sqlite3 database"
            );
            Some(store)
        }
        Err(err) => {
            tracing::error!(
                path = %path.display(),
                store = destination.label(),
                error = %err,
                "failed to open sqlite3 database"
            );
            None
        }
    }
}

/// Persists raw readings, 5-minute and hourly averages, and periodic
/// consumption/production snapshots into per-counter tables.
pub struct SqliteSink<S: MeasurementStore = SqliteStore> {
    active: bool,
    stores: Stores<S>,
    engine: AggregationEngine,
    emissions: Vec<Emission>,
}

impl SqliteSink<SqliteStore> {
    pub fn from_config(config: Option<&LegacyDatabaseConfig>, mapping: CounterMapping) -> Self {
        tracing::info!("initialising sqlite3 sink");
        let Some(config) = config else {
            tracing::info!("no configuration for sqlite3 sink found; disabling it");
            return Self::with_stores(Stores::default(), None, mapping);
        };
        Self::with_stores(Stores::open(config), Some(config), mapping)
    }
}

impl<S: MeasurementStore> SqliteSink<S> {
    /// The sink is active when the raw or the consumption store is open.
    pub fn with_stores(
        stores: Stores<S>,
        config: Option<&LegacyDatabaseConfig>,
        mapping: CounterMapping,
    ) -> Self {
        let active = stores.raw.is_some() || stores.consumption.is_some();
        let mut sink = Self {
            active,
            stores,
            engine: AggregationEngine::new(mapping),
            emissions: Vec::new(),
        };

        match (active, config) {
            (true, Some(config)) => {
                tracing::info!("raw or total consumed database open; sqlite3 sink is active");
                sink.register_counters(config);
                tracing::info!(
                    interval_secs = sink.engine.snapshot_interval(),
                    "storing consumption/production snapshots"
                );
            }
            (false, Some(_)) => {
                tracing::warn!("neither raw nor total consumed database open; sqlite3 sink inactive")
            }
            _ => {}
        }
        sink
    }

    #[cfg(test)]
    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    #[cfg(test)]
    pub fn stores(&self) -> &Stores<S> {
        &self.stores
    }

    fn register_counters(&mut self, config: &LegacyDatabaseConfig) {
        let raw_ids = config
            .current_consumption_id
            .iter()
            .chain(config.current_production_id.iter())
            .chain(config.other_raw_counters.iter());
        for id in raw_ids {
            self.register(id, Tracking::Raw);
        }

        let snapshot_ids = config
            .consumption
            .values()
            .chain(config.production.values())
            .filter_map(|counter| counter.id.as_ref());
        for id in snapshot_ids {
            self.register(id, Tracking::Snapshot);
        }

        if let Some(interval) = config.total_interval {
            if let Err(err) = self.engine.set_snapshot_interval(interval) {
                tracing::warn!(
                    error = %err,
                    default_secs = self.engine.snapshot_interval(),
                    "ignoring total_interval"
                );
            }
        }
    }

    /// Tracks `id` if it names a known counter; unknown ids are warned about
    /// and skipped.
    pub fn register(&mut self, id: &str, tracking: Tracking) -> bool {
        let code = match id.parse::<CounterCode>() {
            Ok(code) => code,
            Err(err) => {
                tracing::warn!(error = %err, ?tracking, "no mapping for counter; not adding it");
                return false;
            }
        };
        if let Err(err) = self.engine.register(code, tracking) {
            tracing::warn!(error = %err, "not adding counter");
            return false;
        }
        let Some(counter) = self.engine.mapping().for_code(code).copied() else {
            return false;
        };
        tracing::info!(
            counter = %code,
            field = %counter.field,
            table = counter.table,
            unit = counter.unit,
            ?tracking,
            "tracking counter"
        );

        let destinations: &[Destination] = match tracking {
            Tracking::Raw => &[Destination::Raw, Destination::FiveMinute, Destination::Hourly],
            Tracking::Snapshot => &[Destination::Consumption],
        };
        for destination in destinations {
            if let Some(store) = self.stores.get_mut(*destination) {
                if let Err(err) = store.ensure_table(counter.table) {
                    tracing::error!(
                        table = counter.table,
                        store = destination.label(),
                        error = %err,
                        "failed to create table"
                    );
                }
            }
        }
        true
    }
}

impl<S: MeasurementStore> Sink for SqliteSink<S> {
    fn name(&self) -> &'static str {
        "sqlite3"
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn process(&mut self, timestamp: i64, telegram: &Telegram) -> Result<(), SinkError> {
        if !self.active {
            return Ok(());
        }

        let mut emissions = std::mem::take(&mut self.emissions);
        emissions.clear();
        for (field, value) in telegram.iter() {
            if let Some(reading) = value.as_number() {
                self.engine.observe(timestamp, field, reading, &mut emissions);
            }
        }

        let mut attempted_writes = 0;
        let mut failed_writes = 0;
        for emission in &emissions {
            let Some(store) = self.stores.get_mut(emission.destination) else {
                continue;
            };
            attempted_writes += 1;
            if let Err(err) = store.insert(
                emission.counter.table,
                timestamp,
                emission.value,
                emission.counter.unit,
            ) {
                failed_writes += 1;
                tracing::error!(
                    table = emission.counter.table,
                    store = emission.destination.label(),
                    error = %err,
                    "failed to insert value"
                );
            }
        }
        self.emissions = emissions;

        // One commit per open store, however many rows went into it.
        let mut failed_commits = 0;
        for destination in Destination::ALL {
            if let Some(store) = self.stores.get_mut(destination) {
                if let Err(err) = store.commit() {
                    failed_commits += 1;
                    tracing::error!(
                        store = destination.label(),
                        error = %err,
                        "failed to commit"
                    );
                }
            }
        }

        if failed_writes > 0 || failed_commits > 0 {
            return Err(SinkError::Partial {
                attempted_writes,
                failed_writes,
                failed_commits,
            });
        }
        Ok(())
    }
}

//! DuckDB-backed persistence for sward plot runs.

use duckdb::{Connection, Transaction, params};
use sward_core::{DayBatch, PlotConfig, PlotPersistence};
use thiserror::Error;

const DEFAULT_DAY_BUFFER: usize = 32;
const DEFAULT_PLANT_BUFFER: usize = 4096;
const DEFAULT_HERBIVORE_BUFFER: usize = 512;

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("config serialization error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("no active run; call begin_run first")]
    NoActiveRun,
}

/// Summary row written to the `days` table.
#[derive(Debug, Clone)]
struct DayRow {
    run_id: i64,
    day: i64,
    year: i64,
    shoot_total_kg: f64,
    shoot_mean_kg: f64,
    living_plants: i64,
}

/// Plant snapshot row.
#[derive(Debug, Clone)]
struct PlantRow {
    run_id: i64,
    day: i64,
    year: i64,
    plant: i64,
    kind: &'static str,
    height_m: f64,
    b_leaf: f64,
    b_stem: f64,
    b_defence: f64,
    ms: f64,
    ns: f64,
    cs: f64,
    mr: f64,
    cr: f64,
    nr: f64,
}

/// Herbivore day row.
#[derive(Debug, Clone)]
struct HerbivoreRow {
    run_id: i64,
    day: i64,
    year: i64,
    herbivore: i64,
    diet: &'static str,
    mass_kg: f64,
    x_m: f64,
    y_m: f64,
    distance_m: f64,
    pe_kj: f64,
    npe_kj: f64,
    intake_kg: f64,
    forage_water_kg: f64,
    lifetime_intake_kg: f64,
    water_balance_kg: f64,
    energy_balance_kj: f64,
}

/// Latest day summary fetched back out of the database.
#[derive(Debug, Clone, PartialEq)]
pub struct DayReading {
    pub day: i64,
    pub year: i64,
    pub shoot_total_kg: f64,
    pub shoot_mean_kg: f64,
    pub living_plants: i64,
}

/// Per-herbivore aggregates over a recorded run.
#[derive(Debug, Clone, PartialEq)]
pub struct HerbivoreTotals {
    pub herbivore: i64,
    pub intake_kg: f64,
    pub distance_m: f64,
    pub final_energy_balance_kj: f64,
}

#[derive(Default)]
struct StorageBuffer {
    days: Vec<DayRow>,
    plants: Vec<PlantRow>,
    herbivores: Vec<HerbivoreRow>,
}

impl StorageBuffer {
    fn is_empty(&self) -> bool {
        self.days.is_empty() && self.plants.is_empty() && self.herbivores.is_empty()
    }

    fn clear(&mut self) {
        self.days.clear();
        self.plants.clear();
        self.herbivores.clear();
    }
}

/// DuckDB-backed persistence sink with buffered writes.
pub struct Storage {
    conn: Connection,
    buffer: StorageBuffer,
    run_id: Option<i64>,
    day_flush_threshold: usize,
    plant_flush_threshold: usize,
    herbivore_flush_threshold: usize,
}

impl Storage {
    /// Open or create a database at `path` with default buffering thresholds.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory database; handy for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Override flush thresholds for days, plants and herbivores respectively.
    pub fn with_thresholds(
        path: &str,
        day: usize,
        plant: usize,
        herbivore: usize,
    ) -> Result<Self, StorageError> {
        let mut storage = Self::from_connection(Connection::open(path)?)?;
        storage.day_flush_threshold = day.max(1);
        storage.plant_flush_threshold = plant.max(1);
        storage.herbivore_flush_threshold = herbivore.max(1);
        Ok(storage)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let mut storage = Self {
            conn,
            buffer: StorageBuffer::default(),
            run_id: None,
            day_flush_threshold: DEFAULT_DAY_BUFFER,
            plant_flush_threshold: DEFAULT_PLANT_BUFFER,
            herbivore_flush_threshold: DEFAULT_HERBIVORE_BUFFER,
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute(
            "create table if not exists runs (
                run_id bigint primary key,
                started_at timestamp default current_timestamp,
                side_m double,
                plants integer,
                herbivores integer,
                years integer,
                spin_up_years integer,
                config json
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists days (
                run_id bigint,
                day bigint,
                year integer,
                shoot_total_kg double,
                shoot_mean_kg double,
                living_plants integer,
                primary key (run_id, day)
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists plants (
                run_id bigint,
                day bigint,
                year integer,
                plant integer,
                kind text,
                height_m double,
                b_leaf double,
                b_stem double,
                b_defence double,
                ms double,
                ns double,
                cs double,
                mr double,
                cr double,
                nr double,
                primary key (run_id, day, plant)
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists herbivores (
                run_id bigint,
                day bigint,
                year integer,
                herbivore integer,
                diet text,
                mass_kg double,
                x_m double,
                y_m double,
                distance_m double,
                pe_kj double,
                npe_kj double,
                intake_kg double,
                forage_water_kg double,
                lifetime_intake_kg double,
                water_balance_kg double,
                energy_balance_kj double,
                primary key (run_id, day, herbivore)
            )",
            [],
        )?;
        Ok(())
    }

    /// Register a new run, snapshotting the full configuration as JSON.
    /// Subsequent batches are attributed to it.
    pub fn begin_run(&mut self, config: &PlotConfig) -> Result<i64, StorageError> {
        self.flush()?;
        let run_id = self.next_run_id()?;
        let snapshot = serde_json::to_string(config)?;
        self.conn.execute(
            "insert into runs (
                run_id, side_m, plants, herbivores, years, spin_up_years, config
            ) values (?, ?, ?, ?, ?, ?, ?)",
            params![
                run_id,
                config.side_m,
                i64::from(config.plant_count()),
                i64::from(config.herbivore_count),
                i64::from(config.years),
                i64::from(config.spin_up_years),
                snapshot,
            ],
        )?;
        self.run_id = Some(run_id);
        Ok(run_id)
    }

    /// The run new batches are attributed to, if one has been started.
    #[must_use]
    pub fn run_id(&self) -> Option<i64> {
        self.run_id
    }

    fn next_run_id(&mut self) -> Result<i64, StorageError> {
        let mut stmt = self
            .conn
            .prepare("select coalesce(max(run_id), 0) + 1 from runs")?;
        let mut rows = stmt.query([])?;
        let row = rows.next()?.ok_or(duckdb::Error::QueryReturnedNoRows)?;
        Ok(row.get(0)?)
    }

    fn count_rows(&mut self, sql: &str, run_id: i64) -> Result<i64, StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params![run_id])?;
        let row = rows.next()?.ok_or(duckdb::Error::QueryReturnedNoRows)?;
        Ok(row.get(0)?)
    }

    fn enqueue(&mut self, batch: &DayBatch) -> Result<(), StorageError> {
        let run_id = self.run_id.ok_or(StorageError::NoActiveRun)?;
        let summary = &batch.summary;
        let day = i64::from(summary.day.0);

        self.buffer.days.push(DayRow {
            run_id,
            day,
            year: i64::from(summary.year),
            shoot_total_kg: summary.shoot_total_kg,
            shoot_mean_kg: summary.shoot_mean_kg,
            living_plants: summary.living_plants as i64,
        });

        for record in &batch.plants {
            self.buffer.plants.push(PlantRow {
                run_id,
                day: i64::from(record.day),
                year: i64::from(record.year),
                plant: i64::from(record.plant.0),
                kind: record.kind.label(),
                height_m: record.height_m,
                b_leaf: record.b_leaf,
                b_stem: record.b_stem,
                b_defence: record.b_defence,
                ms: record.ms,
                ns: record.ns,
                cs: record.cs,
                mr: record.mr,
                cr: record.cr,
                nr: record.nr,
            });
        }

        for record in &batch.herbivores {
            self.buffer.herbivores.push(HerbivoreRow {
                run_id,
                day: i64::from(record.day),
                year: i64::from(record.year),
                herbivore: i64::from(record.herbivore.0),
                diet: record.diet.label(),
                mass_kg: record.mass_kg,
                x_m: record.x_m,
                y_m: record.y_m,
                distance_m: record.distance_m,
                pe_kj: record.pe_kj,
                npe_kj: record.npe_kj,
                intake_kg: record.intake_kg,
                forage_water_kg: record.forage_water_kg,
                lifetime_intake_kg: record.lifetime_intake_kg,
                water_balance_kg: record.water_balance_kg,
                energy_balance_kj: record.energy_balance_kj,
            });
        }

        self.maybe_flush()?;
        Ok(())
    }

    /// Persist one day's batch, buffering until thresholds are met.
    pub fn record_day(&mut self, batch: &DayBatch) -> Result<(), StorageError> {
        self.enqueue(batch)
    }

    fn maybe_flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.days.len() >= self.day_flush_threshold
            || self.buffer.plants.len() >= self.plant_flush_threshold
            || self.buffer.herbivores.len() >= self.herbivore_flush_threshold
        {
            self.flush()?;
        }
        Ok(())
    }

    fn insert_days(tx: &Transaction<'_>, rows: &[DayRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into days (
                run_id, day, year, shoot_total_kg, shoot_mean_kg, living_plants
            ) values (?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.run_id,
                row.day,
                row.year,
                row.shoot_total_kg,
                row.shoot_mean_kg,
                row.living_plants,
            ])?;
        }
        Ok(())
    }

    fn insert_plants(tx: &Transaction<'_>, rows: &[PlantRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into plants (
                run_id, day, year, plant, kind, height_m,
                b_leaf, b_stem, b_defence, ms, ns, cs, mr, cr, nr
            ) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.run_id,
                row.day,
                row.year,
                row.plant,
                row.kind,
                row.height_m,
                row.b_leaf,
                row.b_stem,
                row.b_defence,
                row.ms,
                row.ns,
                row.cs,
                row.mr,
                row.cr,
                row.nr,
            ])?;
        }
        Ok(())
    }

    fn insert_herbivores(tx: &Transaction<'_>, rows: &[HerbivoreRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into herbivores (
                run_id, day, year, herbivore, diet, mass_kg,
                x_m, y_m, distance_m, pe_kj, npe_kj, intake_kg,
                forage_water_kg, lifetime_intake_kg, water_balance_kg, energy_balance_kj
            ) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.run_id,
                row.day,
                row.year,
                row.herbivore,
                row.diet,
                row.mass_kg,
                row.x_m,
                row.y_m,
                row.distance_m,
                row.pe_kj,
                row.npe_kj,
                row.intake_kg,
                row.forage_water_kg,
                row.lifetime_intake_kg,
                row.water_balance_kg,
                row.energy_balance_kj,
            ])?;
        }
        Ok(())
    }

    /// Force flush buffered rows to the database.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        Self::insert_days(&tx, &self.buffer.days)?;
        Self::insert_plants(&tx, &self.buffer.plants)?;
        Self::insert_herbivores(&tx, &self.buffer.herbivores)?;
        tx.commit()?;
        self.buffer.clear();
        Ok(())
    }

    /// Run database maintenance to optimize and compact storage.
    pub fn optimize(&mut self) -> Result<(), StorageError> {
        self.flush()?;
        self.conn.execute("PRAGMA optimize;", [])?;
        self.conn.execute("VACUUM;", [])?;
        Ok(())
    }

    /// Number of days recorded for a run.
    pub fn recorded_days(&mut self, run_id: i64) -> Result<i64, StorageError> {
        self.flush()?;
        self.count_rows("select count(*) from days where run_id = ?", run_id)
    }

    /// Number of plant rows recorded for a run.
    pub fn recorded_plant_rows(&mut self, run_id: i64) -> Result<i64, StorageError> {
        self.flush()?;
        self.count_rows("select count(*) from plants where run_id = ?", run_id)
    }

    /// The last recorded day summary of a run, if any.
    pub fn latest_day(&mut self, run_id: i64) -> Result<Option<DayReading>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select day, year, shoot_total_kg, shoot_mean_kg, living_plants
             from days
             where run_id = ?
             order by day desc
             limit 1",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(DayReading {
                day: row.get(0)?,
                year: row.get(1)?,
                shoot_total_kg: row.get(2)?,
                shoot_mean_kg: row.get(3)?,
                living_plants: row.get(4)?,
            })),
            None => Ok(None),
        }
    }

    /// Per-herbivore intake and travel aggregates for a run.
    pub fn herbivore_totals(&mut self, run_id: i64) -> Result<Vec<HerbivoreTotals>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select herbivore,
                    sum(intake_kg) as intake_kg,
                    sum(distance_m) as distance_m,
                    last(energy_balance_kj order by day) as final_energy_balance_kj
             from herbivores
             where run_id = ?
             group by herbivore
             order by herbivore",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        let mut totals = Vec::new();
        while let Some(row) = rows.next()? {
            totals.push(HerbivoreTotals {
                herbivore: row.get(0)?,
                intake_kg: row.get(1)?,
                distance_m: row.get(2)?,
                final_energy_balance_kj: row.get(3)?,
            });
        }
        Ok(totals)
    }

    /// The JSON configuration snapshot stored for a run.
    pub fn run_config(&mut self, run_id: i64) -> Result<Option<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("select config from runs where run_id = ?")?;
        let mut rows = stmt.query(params![run_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            eprintln!("failed to flush persistence buffer on drop: {err}");
        }
    }
}

impl PlotPersistence for Storage {
    fn on_day(&mut self, batch: &DayBatch) {
        if let Err(err) = self.record_day(batch) {
            eprintln!(
                "failed to enqueue persistence data for day {}: {err}",
                batch.summary.day.0
            );
        }
    }
}

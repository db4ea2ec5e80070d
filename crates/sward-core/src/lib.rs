//! Deterministic simulation core for a single vegetation plot: plant
//! carbon/nitrogen physiology on a daily step, plus a per-minute herbivore
//! foraging loop with a fixed-delay digestion pipeline.

use std::collections::VecDeque;
use std::f64::consts::{PI, TAU};
use std::fmt;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sward_index::{IndexError, TorusGrid};
use thiserror::Error;
use tracing::debug;

/// Minutes in one simulated day.
pub const MINUTES_PER_DAY: u64 = 24 * 60;

/// Days in one simulated year.
pub const DAYS_PER_YEAR: u32 = 365;

/// Soil-water level at which photosynthetic uptake starts to rise, and the
/// level at which it saturates.
const SOIL_WATER_RAMP: (f64, f64) = (0.15, 0.6);

/// Half-saturation of nitrogen uptake against soil nitrogen.
const SOIL_N_HALF_SAT: f64 = 0.1;

/// Steepness of product inhibition on carbon uptake.
const C_INHIBITION_SLOPE: f64 = 100.0;

/// Steepness of product inhibition on nitrogen uptake.
const N_INHIBITION_SLOPE: f64 = 1000.0;

/// Fraction of daily shoot growth routed into defence compounds.
const DEFENCE_ALLOCATION: f64 = 1e-4;

/// Stem litter turns over at this fraction of the leaf litter rate.
const STEM_LITTER_SCALE: f64 = 0.02;

/// Reproductive allocation scale applied to the shoot-mass ramp.
const REPRODUCTIVE_ALLOCATION: f64 = 0.01;

/// Shoot-mass ramp for reproductive allocation, in kg.
const REPRODUCTIVE_RAMP: (f64, f64) = (0.5, 10.0);

/// Leaf:stem ramp for stem allocation in trees.
const STEM_RAMP: (f64, f64) = (0.25, 5.0);

/// Initial structural mass range for freshly placed plants, kg.
const INIT_MASS_RANGE: (f64, f64) = (1.0, 100.0);

/// Initial substrate carbon fraction range, kg C per kg structure.
const INIT_CARBON_RANGE: (f64, f64) = (0.05, 0.5);

/// Initial substrate nitrogen fraction range, kg N per kg structure.
const INIT_NITROGEN_RANGE: (f64, f64) = (0.01, 0.025);

/// Litres of plant water carried per kg of structural mass at start-up.
const INIT_WATER_PER_KG: f64 = 8.0;

/// Starting heights, metres.
const GRASS_HEIGHT_M: f64 = 1.0;
const TREE_HEIGHT_M: f64 = 2.0;

/// Margin above the minimum shoot mass below which a plant no longer
/// registers as forage.
const EDIBLE_SHOOT_MARGIN: f64 = 1e-8;

/// Headroom subtracted from gut capacity before another bite fits, kg.
const GUT_HEADROOM_KG: f64 = 1e-4;

/// Scale on the diet-mismatch-per-density term in the patch-leaving rule.
const PATCH_LEAVE_SCALE: f64 = 10_000.0;

/// Linear ramp from 0 at `a` to 1 at `b`, clamped outside.
#[must_use]
pub fn ramp_up(x: f64, a: f64, b: f64) -> f64 {
    ((x - a) / (b - a)).clamp(0.0, 1.0)
}

/// Trapezoidal envelope: rises over `[a, b]`, holds 1 over `[b, c]`, falls
/// over `[c, d]`, zero outside.
#[must_use]
pub fn trapezoid(x: f64, a: f64, b: f64, c: f64, d: f64) -> f64 {
    ((x - a) / (b - a)).min(1.0).min((d - x) / (d - c)).max(0.0)
}

/// Monod saturation `r / (r + k)`.
#[must_use]
pub fn monod(r: f64, k: f64) -> f64 {
    r / (r + k)
}

/// Logistic product-inhibition switch: near 1 below `k`, near 0 above it.
#[must_use]
pub fn inhibition(x: f64, k: f64, slope: f64) -> f64 {
    1.0 / (1.0 + ((x - k) * slope).exp())
}

/// Litter flux that saturates towards `rate * m` as mass grows and vanishes
/// at zero mass.
fn saturating_loss(rate: f64, mass: f64, half_sat: f64) -> f64 {
    if mass > 0.0 {
        rate * mass / (1.0 + half_sat / mass)
    } else {
        0.0
    }
}

/// Errors surfaced by plot construction and stepping.
#[derive(Debug, Error)]
pub enum WorldError {
    /// A configuration field failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The spatial index rejected the plot geometry.
    #[error(transparent)]
    Grid(#[from] IndexError),
    /// A simulation invariant was broken at runtime.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

/// Absolute day index since the start of the run (day 0 = first day of the
/// first spin-up year).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimDay(pub u32);

impl SimDay {
    /// Calendar year this day falls in, starting at 0.
    #[must_use]
    pub const fn year(self) -> u32 {
        self.0 / DAYS_PER_YEAR
    }

    /// Day within the year, `0..365`.
    #[must_use]
    pub const fn day_of_year(self) -> u32 {
        self.0 % DAYS_PER_YEAR
    }
}

/// Identifier of a plant; doubles as its bucket index on the plot grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlantId(pub u32);

impl PlantId {
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of a herbivore on the plot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HerbivoreId(pub u32);

/// One day of environmental forcing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DayClimate {
    /// Mean air temperature, degrees Celsius.
    pub temp_c: f64,
    /// Relative soil water content, 0..=1.
    pub soil_water: f64,
    /// Relative soil nitrogen availability, 0..=1.
    pub nitrogen: f64,
}

/// Annual climate forcing, indexed by day of year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateTable {
    days: Vec<DayClimate>,
}

impl ClimateTable {
    /// Sinusoidal annual temperature cycle around the configured mean, with
    /// constant soil water and nitrogen.
    #[must_use]
    pub fn sinusoidal(config: &PlotConfig) -> Self {
        let days = (0..DAYS_PER_YEAR)
            .map(|i| {
                let phase = f64::from(i) * TAU / f64::from(DAYS_PER_YEAR - 1);
                DayClimate {
                    temp_c: config.temp_mean_c + config.temp_amplitude_c * phase.sin(),
                    soil_water: config.soil_water,
                    nitrogen: config.soil_nitrogen,
                }
            })
            .collect();
        Self { days }
    }

    /// Table from an explicit list of days, cycled over the run.
    pub fn from_days(days: Vec<DayClimate>) -> Result<Self, WorldError> {
        if days.is_empty() {
            return Err(WorldError::InvalidConfig("climate table must not be empty"));
        }
        Ok(Self { days })
    }

    /// Forcing for a simulation day; the table repeats once exhausted.
    #[must_use]
    pub fn day(&self, day: SimDay) -> DayClimate {
        self.days[day.0 as usize % self.days.len()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.days.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

/// Vegetation type of a plant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VegKind {
    GrassC3,
    GrassC4,
    Tree,
}

impl VegKind {
    #[must_use]
    pub const fn is_grass(self) -> bool {
        matches!(self, Self::GrassC3 | Self::GrassC4)
    }

    #[must_use]
    pub const fn is_tree(self) -> bool {
        matches!(self, Self::Tree)
    }

    /// Stable label used in persisted records.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::GrassC3 => "c3_grass",
            Self::GrassC4 => "c4_grass",
            Self::Tree => "tree",
        }
    }
}

/// Feeding guild of a herbivore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Diet {
    Grazer,
    Browser,
    Mixed,
}

impl Diet {
    /// Stable label used in persisted records.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Grazer => "grazer",
            Self::Browser => "browser",
            Self::Mixed => "mixed",
        }
    }
}

/// Minute-scale behavioural state of a herbivore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behaviour {
    Moving,
    Eating,
}

/// One rooted plant. Masses are kg dry matter, substrate pools kg C or kg N,
/// water litres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plant {
    pub kind: VegKind,
    pub x_m: f64,
    pub y_m: f64,
    pub height_m: f64,
    /// Shoot structural mass; always the sum of leaf, stem and defence.
    pub ms: f64,
    /// Root structural mass.
    pub mr: f64,
    /// Shoot substrate carbon.
    pub cs: f64,
    /// Root substrate carbon.
    pub cr: f64,
    /// Shoot substrate nitrogen.
    pub ns: f64,
    /// Root substrate nitrogen.
    pub nr: f64,
    pub b_leaf: f64,
    pub b_stem: f64,
    pub b_defence: f64,
    /// Reproductive allocation of the current day; not carried over.
    pub b_repr: f64,
    pub b_root: f64,
    /// Shoot water pool, drained by herbivory and never refilled.
    pub q_shoot: f64,
    pub q_root: f64,
}

impl Plant {
    /// Whether this plant is forage for `diet`. Trees are browse only while
    /// their leaves hang low enough.
    #[must_use]
    pub fn is_edible(&self, diet: Diet, config: &PlotConfig) -> bool {
        match self.kind {
            k if k.is_grass() => matches!(diet, Diet::Grazer | Diet::Mixed),
            _ => {
                matches!(diet, Diet::Browser | Diet::Mixed)
                    && self.height_m * config.leaf_height <= config.browse_height_m
            }
        }
    }

    /// Advance the plant by one day of transport-resistance growth.
    ///
    /// Uptake, transport and growth rates are computed from the morning
    /// state, integrated with a single Euler step, and the shoot is then
    /// repartitioned across leaf, stem and defence.
    pub fn grow_daily(&mut self, climate: DayClimate, config: &PlotConfig) {
        let [pa, pb, pc, pd] = config.photo_temp_curve;
        let [ga, gb, gc, gd] = config.growth_temp_curve;

        let water = ramp_up(climate.soil_water, SOIL_WATER_RAMP.0, SOIL_WATER_RAMP.1);
        let photo_temp = trapezoid(climate.temp_c, pa, pb, pc, pd);
        let growth_temp = trapezoid(climate.temp_c, ga, gb, gc, gd);
        let k_c = config.k_c * water.min(photo_temp);
        let k_n = config.k_n * monod(climate.nitrogen, SOIL_N_HALF_SAT);
        let g_shoot = config.g_shoot * growth_temp.min(water);
        let g_root = config.g_root * growth_temp.min(water);

        // Transport fluxes from the concentration differences.
        let tau_c = transport_flux(
            self.cs, self.ms, self.cr, self.mr, config.tr_c, config.q,
        );
        let tau_n = transport_flux(
            self.nr, self.mr, self.ns, self.ms, config.tr_n, config.q,
        );

        let uptake_c = if self.ms > 0.0 {
            k_c * self.ms / (1.0 + self.ms / config.k_m)
                * inhibition(self.cs / self.ms, config.pi_c, C_INHIBITION_SLOPE)
        } else {
            0.0
        };
        let uptake_n = if self.mr > 0.0 {
            k_n * self.mr / (1.0 + self.mr / config.k_m)
                * inhibition(self.nr / self.mr, config.pi_n, N_INHIBITION_SLOPE)
        } else {
            0.0
        };

        let g_s = if self.ms > 0.0 {
            g_shoot * self.cs * self.ns / self.ms
        } else {
            0.0
        };
        let g_r = if self.mr > 0.0 {
            g_root * self.cr * self.nr / self.mr
        } else {
            0.0
        };

        // Litter rates; leaf turnover accelerates once days turn cold.
        let loss_root = config.k_litter;
        let loss_leaf = if climate.temp_c > config.pheno_switch_c {
            config.k_litter
        } else {
            config.k_litter * config.accel_leaf_loss
        };
        let loss_stem = config.k_litter * STEM_LITTER_SCALE;
        let leaf_litter = saturating_loss(loss_leaf, self.b_leaf, config.k_m_litter);
        let stem_litter = saturating_loss(loss_stem, self.b_stem, config.k_m_litter);
        let defence_litter = saturating_loss(loss_leaf, self.b_defence, config.k_m_litter);
        let root_litter = saturating_loss(loss_root, self.mr, config.k_m_litter);

        self.ms += g_s - leaf_litter - stem_litter;
        self.mr += g_r - root_litter;
        self.cs += uptake_c - config.f_c * g_s - tau_c;
        self.cr += tau_c - config.f_c * g_r;
        self.ns += tau_n - config.f_n * g_s;
        self.nr += uptake_n - config.f_n * g_r - tau_n;

        // Partition the day's shoot growth; ramps use the post-step shoot.
        let prop_repr =
            ramp_up(self.ms, REPRODUCTIVE_RAMP.0, REPRODUCTIVE_RAMP.1) * REPRODUCTIVE_ALLOCATION;
        let prop_stem = if self.kind.is_tree() {
            if self.b_stem == 0.0 {
                // A bare stem reads as an unbounded leaf:stem ratio.
                1.0 - prop_repr
            } else {
                ramp_up(self.b_leaf / self.b_stem, STEM_RAMP.0, STEM_RAMP.1) * (1.0 - prop_repr)
            }
        } else {
            0.0
        };

        self.b_leaf += (1.0 - prop_stem) * g_s - leaf_litter;
        self.b_stem += prop_stem * g_s - stem_litter;
        self.b_defence += DEFENCE_ALLOCATION * g_s - defence_litter;
        self.b_repr = prop_repr * g_s;
        self.ms = self.b_leaf + self.b_stem + self.b_defence;
        self.b_root = self.mr;
    }
}

/// Shoot-to-root substrate flux over the two transport resistances.
/// Zero whenever either compartment is massless or the resistances
/// degenerate.
fn transport_flux(
    pool_src: f64,
    mass_src: f64,
    pool_dst: f64,
    mass_dst: f64,
    resistance: f64,
    q: f64,
) -> f64 {
    if mass_src <= 0.0 || mass_dst <= 0.0 {
        return 0.0;
    }
    let r_src = resistance / mass_src.powf(q);
    let r_dst = resistance / mass_dst.powf(q);
    let total = r_src + r_dst;
    if total > 0.0 && total.is_finite() {
        (pool_src / mass_src - pool_dst / mass_dst) / total
    } else {
        0.0
    }
}

/// Mass-allometric foraging traits, recomputed at the start of each
/// herbivory day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ForagingTraits {
    /// Wet-mass gut capacity, kg.
    pub gut_capacity_kg: f64,
    /// Bite size, g dry matter; tracked alongside the others though intake
    /// is limited by handling time alone.
    pub bite_size_g: f64,
    /// Handling time, minutes per g dry matter.
    pub handling_min_per_g: f64,
    /// Maximum travel speed, m/s.
    pub max_speed_m_s: f64,
}

/// Ingesta parcel for one gut-residence hour, split into the streams the
/// energetics step needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DigestaSlot {
    pub leaf_kg: f64,
    pub stem_kg: f64,
    pub defence_kg: f64,
    pub dc_leaf_kg: f64,
    pub dc_stem_kg: f64,
    pub dp_leaf_kg: f64,
    pub dp_stem_kg: f64,
    pub dp_defence_kg: f64,
}

impl DigestaSlot {
    /// Total ingesta mass in this slot.
    #[must_use]
    pub fn mass_kg(&self) -> f64 {
        self.leaf_kg + self.stem_kg + self.defence_kg
    }
}

/// Fixed-delay digestion pipeline: one slot per hour of mean retention
/// time, advanced as a ring so no parcel is ever copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestionTract {
    slots: Vec<DigestaSlot>,
    head: usize,
}

impl DigestionTract {
    #[must_use]
    pub fn new(retention_hours: u32) -> Self {
        Self {
            slots: vec![DigestaSlot::default(); retention_hours.max(1) as usize],
            head: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot by age: 0 is the current hour's intake, `len - 1` the parcel
    /// about to exit.
    #[must_use]
    pub fn slot(&self, age: usize) -> &DigestaSlot {
        &self.slots[(self.head + age) % self.slots.len()]
    }

    /// The current hour's intake slot.
    pub fn newest_mut(&mut self) -> &mut DigestaSlot {
        let head = self.head;
        &mut self.slots[head]
    }

    /// The parcel that will exit on the next advance.
    #[must_use]
    pub fn oldest(&self) -> &DigestaSlot {
        self.slot(self.slots.len() - 1)
    }

    /// Push every parcel one hour down the tract; the oldest falls out and
    /// a cleared slot becomes the new intake slot.
    pub fn advance(&mut self) {
        let len = self.slots.len();
        self.head = (self.head + len - 1) % len;
        self.slots[self.head] = DigestaSlot::default();
    }

    /// Total ingesta mass currently in the tract.
    #[must_use]
    pub fn total_mass_kg(&self) -> f64 {
        self.slots.iter().map(DigestaSlot::mass_kg).sum()
    }
}

/// One herbivore. Daily accumulators are zeroed at the start of each
/// foraging day; lifetime balances persist across days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Herbivore {
    pub mass_kg: f64,
    pub diet: Diet,
    pub x_m: f64,
    pub y_m: f64,
    pub behaviour: Behaviour,
    /// Plant currently targeted or fed on.
    pub target: Option<PlantId>,
    /// Cached torus distance to the target, metres.
    pub target_dist_m: f64,
    /// Hours of each day spent foraging, counted from midnight.
    pub foraging_hours: f64,
    /// Continuous hour clock since the first herbivory day.
    pub current_hour: u64,
    pub last_hour: u64,
    pub traits: ForagingTraits,
    pub tract: DigestionTract,
    /// Tract fill as of the last minute, kg.
    pub gut_content_kg: f64,
    pub intake_total_day_kg: f64,
    pub intake_defence_day_kg: f64,
    pub digested_carb_day_kg: f64,
    pub digested_protein_day_kg: f64,
    pub pe_day_kj: f64,
    pub npe_day_kj: f64,
    pub metabolic_water_day_kg: f64,
    pub forage_water_day_kg: f64,
    pub drinking_water_day_kg: f64,
    pub distance_day_m: f64,
    pub intake_total_kg: f64,
    pub energy_balance_kj: f64,
    pub water_balance_kg: f64,
}

impl Herbivore {
    /// A herbivore at the configured release point, with an empty tract.
    #[must_use]
    pub fn spawn(config: &PlotConfig) -> Self {
        Self {
            mass_kg: config.herbivore_mass_kg,
            diet: config.herbivore_diet,
            x_m: config.herbivore_start_x_m,
            y_m: config.herbivore_start_y_m,
            behaviour: Behaviour::Moving,
            target: None,
            target_dist_m: 0.0,
            foraging_hours: config.foraging_hours,
            current_hour: 0,
            last_hour: 0,
            traits: ForagingTraits::default(),
            tract: DigestionTract::new(config.mrt_h),
            gut_content_kg: 0.0,
            intake_total_day_kg: 0.0,
            intake_defence_day_kg: 0.0,
            digested_carb_day_kg: 0.0,
            digested_protein_day_kg: 0.0,
            pe_day_kj: 0.0,
            npe_day_kj: 0.0,
            metabolic_water_day_kg: 0.0,
            forage_water_day_kg: 0.0,
            drinking_water_day_kg: 0.0,
            distance_day_m: 0.0,
            intake_total_kg: 0.0,
            energy_balance_kj: 0.0,
            water_balance_kg: 0.0,
        }
    }

    fn reset_daily_totals(&mut self) {
        self.intake_total_day_kg = 0.0;
        self.intake_defence_day_kg = 0.0;
        self.digested_carb_day_kg = 0.0;
        self.digested_protein_day_kg = 0.0;
        self.pe_day_kj = 0.0;
        self.npe_day_kj = 0.0;
        self.metabolic_water_day_kg = 0.0;
        self.forage_water_day_kg = 0.0;
        self.drinking_water_day_kg = 0.0;
        self.distance_day_m = 0.0;
    }

    fn recompute_traits(&mut self, config: &PlotConfig) {
        self.traits = ForagingTraits {
            gut_capacity_kg: config.gut_capacity_coeff * self.mass_kg.powf(config.gut_capacity_exp),
            bite_size_g: config.bite_size_coeff * self.mass_kg.powf(config.bite_size_exp),
            handling_min_per_g: config.handling_time_coeff
                * self.mass_kg.powf(config.handling_time_exp),
            max_speed_m_s: config.velocity_coeff * self.mass_kg.powf(config.velocity_exp),
        };
    }

    /// Daily maintenance energy requirement, kJ.
    #[must_use]
    pub fn maintenance_kj(&self, config: &PlotConfig) -> f64 {
        config.maintenance_coeff * self.mass_kg.powf(config.maintenance_exp)
    }

    /// Locomotion cost of the distance moved so far today, kJ.
    #[must_use]
    pub fn locomotion_kj(&self, config: &PlotConfig) -> f64 {
        let cost_per_km = config.locomotion_coeff * self.mass_kg.powf(config.locomotion_exp) / 100.0;
        self.distance_day_m / 1000.0 * cost_per_km
    }

    /// Daily water turnover requirement, kg.
    #[must_use]
    pub fn water_requirement_kg(&self, config: &PlotConfig) -> f64 {
        config.water_turnover * self.mass_kg
    }

    /// Ratio of outstanding protein energy to outstanding non-protein
    /// energy, given today's costs and intake so far. Zero when the
    /// remainder degenerates.
    #[must_use]
    pub fn required_energy_ratio(&self, config: &PlotConfig) -> f64 {
        let demand = self.maintenance_kj(config) + self.locomotion_kj(config);
        let pe_share = demand / (config.npe_to_pe_target + 1.0);
        let pe_needed = pe_share - self.pe_day_kj;
        let npe_needed = pe_share * config.npe_to_pe_target - self.npe_day_kj;
        let ratio = pe_needed / npe_needed;
        if ratio.is_finite() { ratio } else { 0.0 }
    }

    /// Take one minute's bite from `plant`, splitting the fresh intake
    /// across the tract's newest slot.
    fn eat(&mut self, plant: &mut Plant, config: &PlotConfig) {
        if plant.ms <= 0.0 {
            return;
        }
        let prop_defence = plant.b_defence / plant.ms;
        let rate_kg_min = 1.0 / self.traits.handling_min_per_g / 1000.0 * (1.0 - prop_defence);
        let intake = rate_kg_min
            .min((plant.ms - config.min_shoot_kg).max(0.0))
            .min(self.traits.gut_capacity_kg - self.gut_content_kg);

        let ns = plant.ns.max(0.0);
        let cs = plant.cs.max(0.0);
        let shoot = plant.b_leaf + plant.b_stem + plant.b_defence;
        let intake_leaf = plant.b_leaf / shoot * intake;
        let intake_stem = plant.b_stem / shoot * intake;
        let intake_defence = plant.b_defence / shoot * intake;
        let intake_water = (intake * plant.q_shoot / plant.ms).max(0.0);

        let c_leaf = intake_leaf * cs / plant.ms;
        let c_stem = intake_stem * cs / plant.ms;
        let n_leaf = intake_leaf * ns / plant.ms;
        let n_stem = intake_stem * ns / plant.ms;
        let n_defence = intake_defence * ns / plant.ms;

        // Digestible carbohydrate: non-structural sugars in full, plus the
        // digestible share of the structural remainder.
        let dc_leaf = config.nsc_leaf * c_leaf
            + (1.0 - config.nsc_leaf) * c_leaf * config.carb_digestibility;
        let dc_stem = config.nsc_stem * c_stem
            + (1.0 - config.nsc_stem) * c_stem * config.carb_digestibility;
        let dp_leaf = config.n_to_protein * n_leaf * config.protein_digestibility;
        let dp_stem = config.n_to_protein * n_stem * config.protein_digestibility;
        let dp_defence = config.n_to_protein * n_defence * config.protein_digestibility;

        let slot = self.tract.newest_mut();
        slot.leaf_kg += intake_leaf;
        slot.stem_kg += intake_stem;
        slot.defence_kg += intake_defence;
        slot.dc_leaf_kg += dc_leaf;
        slot.dc_stem_kg += dc_stem;
        slot.dp_leaf_kg += dp_leaf;
        slot.dp_stem_kg += dp_stem;
        slot.dp_defence_kg += dp_defence;

        self.intake_total_day_kg += intake;
        self.intake_total_kg += intake;
        self.intake_defence_day_kg += intake_defence;
        self.forage_water_day_kg += intake_water;

        plant.b_leaf -= intake_leaf;
        plant.b_stem -= intake_stem;
        plant.b_defence -= intake_defence;
        plant.ms -= intake_leaf + intake_stem + intake_defence;
        plant.q_shoot -= intake_water;
    }

    /// Credit the energy and metabolic water of the parcel about to exit
    /// the tract. Runs just before the hourly advance.
    fn incorporate_oldest(&mut self, config: &PlotConfig) {
        let oldest = *self.tract.oldest();
        let dc = oldest.dc_leaf_kg + oldest.dc_stem_kg;
        let dp = oldest.dp_leaf_kg + oldest.dp_stem_kg + oldest.dp_defence_kg;
        self.digested_carb_day_kg += dc;
        self.digested_protein_day_kg += dp;
        self.npe_day_kj += config.carb_energy_kj_per_g * dc * 1000.0;
        self.pe_day_kj += config.protein_energy_kj_per_g * dp * 1000.0;
        self.metabolic_water_day_kg +=
            config.carb_water_yield * dc + config.protein_water_yield * dp;
    }

    fn refresh_gut_content(&mut self) {
        self.gut_content_kg = self.tract.total_mass_kg();
    }
}

/// Plants whose grid buckets fall inside the detection window around the
/// herbivore. Bucket indices double as plant identifiers.
fn detection_candidates(
    herbivore: &Herbivore,
    grid: &TorusGrid,
    config: &PlotConfig,
) -> Vec<PlantId> {
    let centre = grid.occupant_cell(herbivore.x_m, herbivore.y_m);
    let radius = grid.span_cells(config.detection_m);
    grid.neighborhood(centre, radius)
        .into_iter()
        .map(|cell| PlantId(cell.0))
        .collect()
}

/// Difference between the required protein:energy ratio and what a plant's
/// shoot offers per unit digestible carbohydrate. A carbon-depleted shoot
/// has no finite offer: the mismatch diverges, so the plant scores zero and
/// the stay-or-leave draw can never keep it.
fn ration_mismatch(desired: f64, plant: &Plant, config: &PlotConfig) -> f64 {
    let ns = plant.ns.max(0.0);
    let cs = plant.cs.max(0.0);
    let protein = ns / config.protein_digestibility / config.n_to_protein;
    let carb = cs / ((1.0 - config.nsc_leaf) * config.carb_digestibility + config.nsc_leaf);
    desired - protein / carb
}

/// Taste score of one candidate: inverse of diet mismatch, distance and
/// defence load. Inedible or depleted plants score zero.
fn selection_score(
    herbivore: &Herbivore,
    plant: &Plant,
    desired: f64,
    grid: &TorusGrid,
    config: &PlotConfig,
) -> f64 {
    if !plant.is_edible(herbivore.diet, config) {
        return 0.0;
    }
    if plant.ms <= config.min_shoot_kg + EDIBLE_SHOOT_MARGIN {
        return 0.0;
    }
    let mismatch = ration_mismatch(desired, plant, config).abs();
    let dist = grid.wrapped_distance((herbivore.x_m, herbivore.y_m), (plant.x_m, plant.y_m));
    let score = 1.0 / (mismatch + dist + plant.b_defence) * 100.0;
    if score.is_finite() { score } else { 0.0 }
}

/// Normalise taste scores into selection probabilities by walking the
/// remaining total and budget in candidate order.
fn selection_weights(scores: &[f64]) -> Vec<f64> {
    let mut remaining: f64 = scores.iter().sum();
    let mut budget = 1.0;
    scores
        .iter()
        .map(|&score| {
            let weight = if score == 0.0 { 0.0 } else { score / remaining * budget };
            remaining -= score;
            budget -= weight;
            weight
        })
        .collect()
}

/// Pick a new target by roulette over the detection window, or clear the
/// target when nothing there is worth eating.
fn pick_a_plant(
    herbivore: &mut Herbivore,
    plants: &[Plant],
    grid: &TorusGrid,
    config: &PlotConfig,
    desired: f64,
    rng: &mut SmallRng,
) {
    let candidates = detection_candidates(herbivore, grid, config);
    let here = (herbivore.x_m, herbivore.y_m);
    match candidates.len() {
        0 => {
            herbivore.target = None;
            herbivore.target_dist_m = 0.0;
        }
        1 => {
            let plant = &plants[candidates[0].as_usize()];
            herbivore.target = Some(candidates[0]);
            herbivore.target_dist_m = grid.wrapped_distance(here, (plant.x_m, plant.y_m));
        }
        _ => {
            let scores: Vec<f64> = candidates
                .iter()
                .map(|&id| selection_score(herbivore, &plants[id.as_usize()], desired, grid, config))
                .collect();
            let weights = selection_weights(&scores);
            if weights.iter().any(|&w| w > 0.0) {
                let draw: f64 = rng.random_range(0.0..1.0);
                let mut cumulative = 0.0;
                // The walk falls through to the last candidate when rounding
                // leaves the cumulative weights short of the draw.
                let mut picked = candidates[candidates.len() - 1];
                for (id, &weight) in candidates.iter().zip(&weights) {
                    cumulative += weight;
                    if cumulative >= draw {
                        picked = *id;
                        break;
                    }
                }
                let plant = &plants[picked.as_usize()];
                herbivore.target = Some(picked);
                herbivore.target_dist_m = grid.wrapped_distance(here, (plant.x_m, plant.y_m));
            } else {
                herbivore.target = None;
                herbivore.target_dist_m = 0.0;
            }
        }
    }
}

/// Edible plants per square kilometre within the detection window.
fn plant_density(
    herbivore: &Herbivore,
    plants: &[Plant],
    grid: &TorusGrid,
    config: &PlotConfig,
) -> f64 {
    let edible = detection_candidates(herbivore, grid, config)
        .into_iter()
        .filter(|id| plants[id.as_usize()].is_edible(herbivore.diet, config))
        .count();
    let area_km2 = PI * config.detection_m * config.detection_m / 1e6;
    edible as f64 / area_km2
}

/// Move one minute towards the target, or on a random bearing when there is
/// none. Within one step of the target the herbivore snaps onto it.
fn herbivore_move(
    herbivore: &mut Herbivore,
    plants: &[Plant],
    grid: &TorusGrid,
    rng: &mut SmallRng,
) {
    let max_step = herbivore.traits.max_speed_m_s * 60.0;

    if let Some(id) = herbivore.target {
        if herbivore.target_dist_m <= max_step {
            let plant = &plants[id.as_usize()];
            herbivore.x_m = plant.x_m;
            herbivore.y_m = plant.y_m;
            herbivore.distance_day_m += herbivore.target_dist_m;
            herbivore.target_dist_m =
                grid.wrapped_distance((herbivore.x_m, herbivore.y_m), (plant.x_m, plant.y_m));
            return;
        }
    }

    let (bearing_x, bearing_y) = match herbivore.target {
        Some(id) => {
            let plant = &plants[id.as_usize()];
            (plant.x_m, plant.y_m)
        }
        None => (
            rng.random_range(0.0..grid.side_m()),
            rng.random_range(0.0..grid.side_m()),
        ),
    };

    let (new_x, new_y) = if bearing_x == herbivore.x_m {
        // Vertical bearing; step straight along y.
        let step = if bearing_y < herbivore.y_m { -max_step } else { max_step };
        (herbivore.x_m, herbivore.y_m + step)
    } else {
        let slope = (bearing_y - herbivore.y_m) / (bearing_x - herbivore.x_m);
        let dx = max_step / (1.0 + slope * slope).sqrt();
        let x = if bearing_x < herbivore.x_m {
            herbivore.x_m - dx
        } else {
            herbivore.x_m + dx
        };
        (x, slope * (x - herbivore.x_m) + herbivore.y_m)
    };

    herbivore.x_m = grid.wrap_coord(new_x);
    herbivore.y_m = grid.wrap_coord(new_y);
    herbivore.distance_day_m += max_step;

    if let Some(id) = herbivore.target {
        let plant = &plants[id.as_usize()];
        herbivore.target_dist_m =
            grid.wrapped_distance((herbivore.x_m, herbivore.y_m), (plant.x_m, plant.y_m));
    }
}

/// One full herbivory day: 1440 minutes of digestion and foraging, then the
/// water and energy settlement.
fn forage_day(
    herbivore: &mut Herbivore,
    plants: &mut [Plant],
    grid: &TorusGrid,
    config: &PlotConfig,
    day: SimDay,
    rng: &mut SmallRng,
) -> Result<(), WorldError> {
    if herbivore
        .target
        .is_some_and(|id| id.as_usize() >= plants.len())
    {
        return Err(WorldError::Invariant("target plant out of range"));
    }
    herbivore.reset_daily_totals();
    herbivore.recompute_traits(config);

    let day_offset = u64::from(day.0.saturating_sub(config.spin_up_days()));
    for minute in 0..MINUTES_PER_DAY {
        herbivore.last_hour = herbivore.current_hour;
        herbivore.current_hour = (day_offset * MINUTES_PER_DAY + minute) / 60;
        if herbivore.current_hour != herbivore.last_hour {
            herbivore.incorporate_oldest(config);
            herbivore.tract.advance();
        }
        herbivore.refresh_gut_content();

        if minute as f64 >= herbivore.foraging_hours * 60.0 {
            continue;
        }
        if herbivore.gut_content_kg + GUT_HEADROOM_KG > herbivore.traits.gut_capacity_kg {
            continue;
        }
        let desired = herbivore.required_energy_ratio(config);

        match herbivore.behaviour {
            Behaviour::Eating => {
                let id = herbivore
                    .target
                    .ok_or(WorldError::Invariant("eating with no target plant"))?;
                let target = plants
                    .get(id.as_usize())
                    .ok_or(WorldError::Invariant("target plant out of range"))?;
                let stay = if target.ms > config.min_shoot_kg + EDIBLE_SHOOT_MARGIN {
                    let density = plant_density(herbivore, plants, grid, config);
                    let draw: f64 = rng.random_range(0.0..1.0);
                    let mismatch = ration_mismatch(desired, target, config).abs();
                    draw > mismatch / density * PATCH_LEAVE_SCALE
                } else {
                    false
                };
                if stay {
                    let plant = plants
                        .get_mut(id.as_usize())
                        .ok_or(WorldError::Invariant("target plant out of range"))?;
                    herbivore.eat(plant, config);
                } else {
                    herbivore.behaviour = Behaviour::Moving;
                    pick_a_plant(herbivore, plants, grid, config, desired, rng);
                    herbivore_move(herbivore, plants, grid, rng);
                }
            }
            Behaviour::Moving => {
                if herbivore.target_dist_m > config.eat_radius_m || herbivore.target.is_none() {
                    let draw: f64 = rng.random_range(0.0..1.0);
                    if draw > 0.9 || herbivore.target.is_none() {
                        pick_a_plant(herbivore, plants, grid, config, desired, rng);
                    }
                    herbivore_move(herbivore, plants, grid, rng);
                } else {
                    let id = herbivore
                        .target
                        .ok_or(WorldError::Invariant("within reach of no target plant"))?;
                    let plant = plants
                        .get_mut(id.as_usize())
                        .ok_or(WorldError::Invariant("target plant out of range"))?;
                    herbivore.behaviour = Behaviour::Eating;
                    herbivore.eat(plant, config);
                }
            }
        }
    }

    // Settle the day's water budget; a shortfall sends the herbivore on a
    // drinking trip before the locomotion bill is totalled.
    let required = herbivore.water_requirement_kg(config);
    let gained = herbivore.metabolic_water_day_kg + herbivore.forage_water_day_kg;
    if gained < required {
        herbivore.drinking_water_day_kg = required - gained;
        herbivore.distance_day_m += config.water_trip_m;
    }
    herbivore.energy_balance_kj += herbivore.pe_day_kj + herbivore.npe_day_kj
        - (herbivore.maintenance_kj(config) + herbivore.locomotion_kj(config));
    herbivore.water_balance_kg +=
        gained + herbivore.drinking_water_day_kg - required;

    debug!(
        day = day.0,
        intake_kg = herbivore.intake_total_day_kg,
        distance_m = herbivore.distance_day_m,
        "herbivore day settled"
    );
    Ok(())
}

/// Per-plant state persisted once per day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantRecord {
    pub year: u32,
    pub day: u32,
    pub plant: PlantId,
    pub kind: VegKind,
    pub height_m: f64,
    pub b_leaf: f64,
    pub b_stem: f64,
    pub b_defence: f64,
    pub ms: f64,
    pub ns: f64,
    pub cs: f64,
    pub mr: f64,
    pub cr: f64,
    pub nr: f64,
}

/// Per-herbivore state persisted once per herbivory day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HerbivoreRecord {
    pub year: u32,
    pub day: u32,
    pub herbivore: HerbivoreId,
    pub diet: Diet,
    pub mass_kg: f64,
    pub x_m: f64,
    pub y_m: f64,
    pub distance_m: f64,
    pub pe_kj: f64,
    pub npe_kj: f64,
    pub intake_kg: f64,
    pub forage_water_kg: f64,
    pub lifetime_intake_kg: f64,
    pub water_balance_kg: f64,
    pub energy_balance_kj: f64,
}

/// Condensed per-herbivore day totals carried in the day summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HerbivoreDaySummary {
    pub intake_kg: f64,
    pub pe_kj: f64,
    pub npe_kj: f64,
    pub distance_m: f64,
    pub energy_balance_kj: f64,
    pub water_balance_kg: f64,
}

/// Aggregate plot state after one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaySummary {
    pub day: SimDay,
    pub year: u32,
    pub shoot_total_kg: f64,
    pub shoot_mean_kg: f64,
    /// Plants whose shoot is still above the minimum forageable mass.
    pub living_plants: usize,
    pub herbivores: Vec<HerbivoreDaySummary>,
}

/// Everything persisted for one day: the summary, all plant rows and, on
/// herbivory days, the herbivore rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayBatch {
    pub summary: DaySummary,
    pub plants: Vec<PlantRecord>,
    pub herbivores: Vec<HerbivoreRecord>,
}

/// Sink for per-day output. Implementations must not panic; drop a batch
/// rather than poison the run.
pub trait PlotPersistence {
    fn on_day(&mut self, batch: &DayBatch);
}

/// Persistence sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPersistence;

impl PlotPersistence for NullPersistence {
    fn on_day(&mut self, _batch: &DayBatch) {}
}

/// Full configuration of a plot run. `Default` reproduces the reference
/// parameterisation: a 1 ha plot, 100 plants, one 2180 kg grazer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotConfig {
    /// Plot side length, metres. The plot wraps toroidally.
    pub side_m: f64,
    /// Plant grid columns.
    pub plants_x: u32,
    /// Plant grid rows.
    pub plants_y: u32,
    /// Simulated years, spin-up included.
    pub years: u32,
    /// Years of plant-only growth before herbivores are released.
    pub spin_up_years: u32,
    /// Master switch for the herbivory stage.
    pub herbivory: bool,
    /// Seed for the world RNG; a random seed is drawn when absent.
    pub rng_seed: Option<u64>,
    /// Day summaries retained in memory.
    pub history_capacity: usize,
    /// Annual mean temperature, degrees Celsius.
    pub temp_mean_c: f64,
    /// Amplitude of the annual temperature sinusoid.
    pub temp_amplitude_c: f64,
    /// Constant relative soil water content.
    pub soil_water: f64,
    /// Constant relative soil nitrogen availability.
    pub soil_nitrogen: f64,
    /// Vegetation kinds drawn uniformly at placement.
    pub plant_kinds: Vec<VegKind>,
    /// Shoot growth-rate coefficient.
    pub g_shoot: f64,
    /// Root growth-rate coefficient.
    pub g_root: f64,
    /// Maximum specific carbon uptake rate.
    pub k_c: f64,
    /// Maximum specific nitrogen uptake rate.
    pub k_n: f64,
    /// Mass half-saturation of uptake.
    pub k_m: f64,
    /// Carbon concentration at which uptake inhibition bites.
    pub pi_c: f64,
    /// Nitrogen concentration at which uptake inhibition bites.
    pub pi_n: f64,
    /// Carbon transport resistance.
    pub tr_c: f64,
    /// Nitrogen transport resistance.
    pub tr_n: f64,
    /// Mass-scaling exponent of transport resistance.
    pub q: f64,
    /// Carbon cost per kg of new structure.
    pub f_c: f64,
    /// Nitrogen cost per kg of new structure.
    pub f_n: f64,
    /// Baseline litter rate, per day.
    pub k_litter: f64,
    /// Mass half-saturation of litter loss.
    pub k_m_litter: f64,
    /// Leaf litter acceleration below the phenology switch.
    pub accel_leaf_loss: f64,
    /// Temperature below which leaf loss accelerates.
    pub pheno_switch_c: f64,
    /// Temperature envelope of carbon uptake: rise start, plateau start,
    /// plateau end, fall end.
    pub photo_temp_curve: [f64; 4],
    /// Temperature envelope of structural growth.
    pub growth_temp_curve: [f64; 4],
    /// Herbivores released after spin-up.
    pub herbivore_count: u32,
    /// Herbivore body mass, kg.
    pub herbivore_mass_kg: f64,
    pub herbivore_diet: Diet,
    pub herbivore_start_x_m: f64,
    pub herbivore_start_y_m: f64,
    /// Daily foraging window counted from midnight, hours.
    pub foraging_hours: f64,
    /// Mean gut retention time, hours; sets the digestion pipeline length.
    pub mrt_h: u32,
    /// Radius within which a targeted plant can be fed on, metres.
    pub eat_radius_m: f64,
    /// Shoot mass a plant cannot be grazed below, kg.
    pub min_shoot_kg: f64,
    /// Detection radius for candidate plants, metres.
    pub detection_m: f64,
    /// Browse line: trees with leaves above this height are out of reach.
    pub browse_height_m: f64,
    /// Leaf height as a fraction of plant height.
    pub leaf_height: f64,
    /// Target non-protein to protein energy ratio of the diet.
    pub npe_to_pe_target: f64,
    /// Daily water turnover, kg per kg body mass.
    pub water_turnover: f64,
    /// Round-trip distance to standing water, metres.
    pub water_trip_m: f64,
    /// Gut capacity allometry, kg wet mass.
    pub gut_capacity_coeff: f64,
    pub gut_capacity_exp: f64,
    /// Bite size allometry, g.
    pub bite_size_coeff: f64,
    pub bite_size_exp: f64,
    /// Handling time allometry, min/g.
    pub handling_time_coeff: f64,
    pub handling_time_exp: f64,
    /// Travel speed allometry, m/s.
    pub velocity_coeff: f64,
    pub velocity_exp: f64,
    /// Maintenance energy allometry, kJ/day.
    pub maintenance_coeff: f64,
    pub maintenance_exp: f64,
    /// Locomotion cost allometry, kJ/km per 100 kg.
    pub locomotion_coeff: f64,
    pub locomotion_exp: f64,
    /// Non-structural share of leaf carbon.
    pub nsc_leaf: f64,
    /// Non-structural share of stem carbon.
    pub nsc_stem: f64,
    /// Protein mass per unit nitrogen.
    pub n_to_protein: f64,
    /// Digestible fraction of ingested protein.
    pub protein_digestibility: f64,
    /// Digestible fraction of structural carbohydrate.
    pub carb_digestibility: f64,
    /// Energy yield of digested protein, kJ/g.
    pub protein_energy_kj_per_g: f64,
    /// Energy yield of digested carbohydrate, kJ/g.
    pub carb_energy_kj_per_g: f64,
    /// Metabolic water from digested carbohydrate, kg/kg.
    pub carb_water_yield: f64,
    /// Metabolic water from digested protein, kg/kg.
    pub protein_water_yield: f64,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            side_m: 100.0,
            plants_x: 10,
            plants_y: 10,
            years: 10,
            spin_up_years: 5,
            herbivory: true,
            rng_seed: None,
            history_capacity: 365,
            temp_mean_c: 15.0,
            temp_amplitude_c: 10.0,
            soil_water: 0.5,
            soil_nitrogen: 0.5,
            plant_kinds: vec![VegKind::GrassC3, VegKind::GrassC4],
            g_shoot: 200.0,
            g_root: 200.0,
            k_c: 0.1,
            k_n: 0.01,
            k_m: 10.0,
            pi_c: 0.1,
            pi_n: 0.01,
            tr_c: 1.0,
            tr_n: 1.0,
            q: 2.0 / 3.0,
            f_c: 0.5,
            f_n: 0.025,
            k_litter: 0.05,
            k_m_litter: 2.5,
            accel_leaf_loss: 10.0,
            pheno_switch_c: 10.0,
            photo_temp_curve: [1.0, 15.0, 25.0, 35.0],
            growth_temp_curve: [1.0, 24.0, 26.0, 40.0],
            herbivore_count: 1,
            herbivore_mass_kg: 2180.0,
            herbivore_diet: Diet::Grazer,
            herbivore_start_x_m: 2.9,
            herbivore_start_y_m: 95.7,
            foraging_hours: 12.0,
            mrt_h: 28,
            eat_radius_m: 1.0,
            min_shoot_kg: 1e-6,
            detection_m: 10.0,
            browse_height_m: 2.0,
            leaf_height: 0.66,
            npe_to_pe_target: 4.55,
            water_turnover: 0.061,
            water_trip_m: 498.0,
            gut_capacity_coeff: 0.030,
            gut_capacity_exp: 0.924,
            bite_size_coeff: 0.096,
            bite_size_exp: 0.72,
            handling_time_coeff: 1.65,
            handling_time_exp: -0.766,
            velocity_coeff: 0.73,
            velocity_exp: 0.04,
            maintenance_coeff: 293.0,
            maintenance_exp: 0.75,
            locomotion_coeff: 10_678.0,
            locomotion_exp: 0.70,
            nsc_leaf: 0.2,
            nsc_stem: 0.05,
            n_to_protein: 6.25,
            protein_digestibility: 0.5,
            carb_digestibility: 0.63,
            protein_energy_kj_per_g: 16.7,
            carb_energy_kj_per_g: 16.7,
            carb_water_yield: 0.62,
            protein_water_yield: 0.42,
        }
    }
}

impl PlotConfig {
    /// Check the ranges the simulation depends on.
    pub fn validate(&self) -> Result<(), WorldError> {
        if !(self.side_m.is_finite() && self.side_m > 0.0) {
            return Err(WorldError::InvalidConfig("side_m must be positive"));
        }
        if self.plants_x == 0 || self.plants_y == 0 {
            return Err(WorldError::InvalidConfig("plant grid must be non-empty"));
        }
        if self.years == 0 {
            return Err(WorldError::InvalidConfig("years must be at least 1"));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig("history_capacity must be at least 1"));
        }
        if self.plant_kinds.is_empty() {
            return Err(WorldError::InvalidConfig("plant_kinds must not be empty"));
        }
        if !(self.herbivore_mass_kg.is_finite() && self.herbivore_mass_kg > 0.0) {
            return Err(WorldError::InvalidConfig("herbivore_mass_kg must be positive"));
        }
        if !(0.0..=24.0).contains(&self.foraging_hours) {
            return Err(WorldError::InvalidConfig("foraging_hours must lie in 0..=24"));
        }
        if self.mrt_h == 0 {
            return Err(WorldError::InvalidConfig("mrt_h must be at least 1"));
        }
        if !(self.detection_m.is_finite() && self.detection_m > 0.0) {
            return Err(WorldError::InvalidConfig("detection_m must be positive"));
        }
        if !(self.eat_radius_m.is_finite() && self.eat_radius_m > 0.0) {
            return Err(WorldError::InvalidConfig("eat_radius_m must be positive"));
        }
        if !(self.min_shoot_kg.is_finite() && self.min_shoot_kg >= 0.0) {
            return Err(WorldError::InvalidConfig("min_shoot_kg must be non-negative"));
        }
        if !(self.npe_to_pe_target.is_finite() && self.npe_to_pe_target > 0.0) {
            return Err(WorldError::InvalidConfig("npe_to_pe_target must be positive"));
        }
        if !(self.water_turnover.is_finite() && self.water_turnover >= 0.0) {
            return Err(WorldError::InvalidConfig("water_turnover must be non-negative"));
        }
        if !(self.water_trip_m.is_finite() && self.water_trip_m >= 0.0) {
            return Err(WorldError::InvalidConfig("water_trip_m must be non-negative"));
        }
        if !(self.k_m.is_finite() && self.k_m > 0.0) {
            return Err(WorldError::InvalidConfig("k_m must be positive"));
        }
        for curve in [&self.photo_temp_curve, &self.growth_temp_curve] {
            if !(curve[0] < curve[1] && curve[1] <= curve[2] && curve[2] < curve[3]) {
                return Err(WorldError::InvalidConfig(
                    "temperature envelopes must be ordered a < b <= c < d",
                ));
            }
        }
        Ok(())
    }

    /// Number of plants on the plot.
    #[must_use]
    pub const fn plant_count(&self) -> u32 {
        self.plants_x * self.plants_y
    }

    /// Total days in the run.
    #[must_use]
    pub const fn total_days(&self) -> u32 {
        self.years * DAYS_PER_YEAR
    }

    /// Days before the herbivory stage can start.
    #[must_use]
    pub const fn spin_up_days(&self) -> u32 {
        self.spin_up_years * DAYS_PER_YEAR
    }

    /// Spatial index matching the plant grid.
    pub fn grid(&self) -> Result<TorusGrid, IndexError> {
        TorusGrid::new(self.side_m, self.plants_x, self.plants_y)
    }

    /// World RNG, seeded from the config or freshly drawn.
    #[must_use]
    pub fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }
}

/// A vegetation plot with its herbivores, stepped one day at a time.
pub struct PlotWorld {
    config: PlotConfig,
    day: SimDay,
    rng: SmallRng,
    grid: TorusGrid,
    climate: ClimateTable,
    plants: Vec<Plant>,
    herbivores: Vec<Herbivore>,
    persistence: Box<dyn PlotPersistence>,
    history: VecDeque<DaySummary>,
}

impl fmt::Debug for PlotWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlotWorld")
            .field("day", &self.day)
            .field("plants", &self.plants.len())
            .field("herbivores", &self.herbivores.len())
            .finish_non_exhaustive()
    }
}

impl PlotWorld {
    /// World with the default discarding sink.
    pub fn new(config: PlotConfig) -> Result<Self, WorldError> {
        Self::with_persistence(config, Box::new(NullPersistence))
    }

    /// World writing its per-day batches into `persistence`.
    pub fn with_persistence(
        config: PlotConfig,
        persistence: Box<dyn PlotPersistence>,
    ) -> Result<Self, WorldError> {
        config.validate()?;
        let grid = config.grid()?;
        let mut rng = config.seeded_rng();
        let climate = ClimateTable::sinusoidal(&config);
        let plants = seed_plants(&config, &grid, &mut rng);
        let herbivores = (0..config.herbivore_count)
            .map(|_| Herbivore::spawn(&config))
            .collect();
        Ok(Self {
            config,
            day: SimDay(0),
            rng,
            grid,
            climate,
            plants,
            herbivores,
            persistence,
            history: VecDeque::new(),
        })
    }

    /// Replace the climate forcing, e.g. with a measured series.
    pub fn set_climate(&mut self, climate: ClimateTable) {
        self.climate = climate;
    }

    /// Whether herbivores are active on the current day.
    #[must_use]
    pub fn herbivory_active(&self) -> bool {
        self.config.herbivory && self.day.year() >= self.config.spin_up_years
    }

    /// Advance the plot by one day: plant growth, then herbivory once
    /// spin-up has passed, then records.
    pub fn advance_day(&mut self) -> Result<DaySummary, WorldError> {
        let climate = self.climate.day(self.day);
        self.stage_growth(climate);
        let grazed = self.herbivory_active();
        if grazed {
            self.stage_herbivory()?;
        }
        let summary = self.build_summary(grazed);
        self.stage_records(grazed, &summary);
        self.day = SimDay(self.day.0 + 1);
        Ok(summary)
    }

    /// Run the configured number of years to completion.
    pub fn run(&mut self) -> Result<(), WorldError> {
        for _ in 0..self.config.total_days() {
            let summary = self.advance_day()?;
            if summary.day.day_of_year() == DAYS_PER_YEAR - 1 {
                debug!(
                    year = summary.year,
                    shoot_total_kg = summary.shoot_total_kg,
                    living_plants = summary.living_plants,
                    "year complete"
                );
            }
        }
        Ok(())
    }

    fn stage_growth(&mut self, climate: DayClimate) {
        let Self { plants, config, .. } = self;
        for plant in plants.iter_mut() {
            plant.grow_daily(climate, config);
        }
    }

    fn stage_herbivory(&mut self) -> Result<(), WorldError> {
        let Self {
            herbivores,
            plants,
            grid,
            config,
            rng,
            day,
            ..
        } = self;
        for herbivore in herbivores.iter_mut() {
            forage_day(herbivore, plants, grid, config, *day, rng)?;
        }
        Ok(())
    }

    fn build_summary(&self, grazed: bool) -> DaySummary {
        let shoot_total_kg: f64 = self.plants.iter().map(|p| p.ms).sum();
        let living_plants = self
            .plants
            .iter()
            .filter(|p| p.ms > self.config.min_shoot_kg)
            .count();
        let herbivores = if grazed {
            self.herbivores
                .iter()
                .map(|h| HerbivoreDaySummary {
                    intake_kg: h.intake_total_day_kg,
                    pe_kj: h.pe_day_kj,
                    npe_kj: h.npe_day_kj,
                    distance_m: h.distance_day_m,
                    energy_balance_kj: h.energy_balance_kj,
                    water_balance_kg: h.water_balance_kg,
                })
                .collect()
        } else {
            Vec::new()
        };
        DaySummary {
            day: self.day,
            year: self.day.year(),
            shoot_total_kg,
            shoot_mean_kg: shoot_total_kg / self.plants.len() as f64,
            living_plants,
            herbivores,
        }
    }

    fn stage_records(&mut self, grazed: bool, summary: &DaySummary) {
        let year = self.day.year();
        let day = self.day.0;
        let plants = self
            .plants
            .iter()
            .enumerate()
            .map(|(i, p)| PlantRecord {
                year,
                day,
                plant: PlantId(i as u32),
                kind: p.kind,
                height_m: p.height_m,
                b_leaf: p.b_leaf,
                b_stem: p.b_stem,
                b_defence: p.b_defence,
                ms: p.ms,
                ns: p.ns,
                cs: p.cs,
                mr: p.mr,
                cr: p.cr,
                nr: p.nr,
            })
            .collect();
        let herbivores = if grazed {
            self.herbivores
                .iter()
                .enumerate()
                .map(|(i, h)| HerbivoreRecord {
                    year,
                    day,
                    herbivore: HerbivoreId(i as u32),
                    diet: h.diet,
                    mass_kg: h.mass_kg,
                    x_m: h.x_m,
                    y_m: h.y_m,
                    distance_m: h.distance_day_m,
                    pe_kj: h.pe_day_kj,
                    npe_kj: h.npe_day_kj,
                    intake_kg: h.intake_total_day_kg,
                    forage_water_kg: h.forage_water_day_kg,
                    lifetime_intake_kg: h.intake_total_kg,
                    water_balance_kg: h.water_balance_kg,
                    energy_balance_kj: h.energy_balance_kj,
                })
                .collect()
        } else {
            Vec::new()
        };
        let batch = DayBatch {
            summary: summary.clone(),
            plants,
            herbivores,
        };
        self.persistence.on_day(&batch);

        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
    }

    #[must_use]
    pub fn day(&self) -> SimDay {
        self.day
    }

    #[must_use]
    pub fn config(&self) -> &PlotConfig {
        &self.config
    }

    #[must_use]
    pub fn grid(&self) -> &TorusGrid {
        &self.grid
    }

    #[must_use]
    pub fn plants(&self) -> &[Plant] {
        &self.plants
    }

    #[must_use]
    pub fn herbivores(&self) -> &[Herbivore] {
        &self.herbivores
    }

    #[must_use]
    pub fn history(&self) -> &VecDeque<DaySummary> {
        &self.history
    }
}

/// Place one plant per grid bucket and draw its starting pools. Draw order
/// is fixed per plant: kind, structural mass, carbon fraction, nitrogen
/// fraction.
fn seed_plants(config: &PlotConfig, grid: &TorusGrid, rng: &mut SmallRng) -> Vec<Plant> {
    let mut plants = Vec::with_capacity(config.plant_count() as usize);
    for row in 0..config.plants_y {
        for col in 0..config.plants_x {
            let kind = config.plant_kinds[rng.random_range(0..config.plant_kinds.len())];
            let mass = rng.random_range(INIT_MASS_RANGE.0..INIT_MASS_RANGE.1);
            let carbon = rng.random_range(INIT_CARBON_RANGE.0..INIT_CARBON_RANGE.1);
            let nitrogen = rng.random_range(INIT_NITROGEN_RANGE.0..INIT_NITROGEN_RANGE.1);
            let (b_leaf, b_stem, height_m) = if kind.is_tree() {
                (mass * 0.5, mass * 0.5, TREE_HEIGHT_M)
            } else {
                (mass, 0.0, GRASS_HEIGHT_M)
            };
            plants.push(Plant {
                kind,
                x_m: (f64::from(col) + 0.5) * grid.cell_x_m(),
                y_m: (f64::from(row) + 0.5) * grid.cell_y_m(),
                height_m,
                ms: mass,
                mr: mass,
                cs: mass * carbon,
                cr: mass * carbon,
                ns: mass * nitrogen,
                nr: mass * nitrogen,
                b_leaf,
                b_stem,
                b_defence: mass * DEFENCE_ALLOCATION,
                b_repr: 0.0,
                b_root: mass,
                q_shoot: INIT_WATER_PER_KG * mass,
                q_root: INIT_WATER_PER_KG * mass,
            });
        }
    }
    plants
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn sample_config() -> PlotConfig {
        PlotConfig {
            side_m: 30.0,
            plants_x: 3,
            plants_y: 3,
            years: 1,
            spin_up_years: 0,
            rng_seed: Some(7),
            history_capacity: 32,
            ..PlotConfig::default()
        }
    }

    fn sample_plant(kind: VegKind) -> Plant {
        let (b_leaf, b_stem, height_m) = if kind.is_tree() {
            (25.0, 25.0, TREE_HEIGHT_M)
        } else {
            (50.0, 0.0, GRASS_HEIGHT_M)
        };
        Plant {
            kind,
            x_m: 5.0,
            y_m: 5.0,
            height_m,
            ms: 50.0,
            mr: 50.0,
            cs: 10.0,
            cr: 10.0,
            ns: 0.5,
            nr: 0.5,
            b_leaf,
            b_stem,
            b_defence: 50.0 * DEFENCE_ALLOCATION,
            b_repr: 0.0,
            b_root: 50.0,
            q_shoot: 400.0,
            q_root: 400.0,
        }
    }

    fn mild_day() -> DayClimate {
        DayClimate {
            temp_c: 20.0,
            soil_water: 0.5,
            nitrogen: 0.5,
        }
    }

    fn sample_herbivore(config: &PlotConfig) -> Herbivore {
        let mut herbivore = Herbivore::spawn(config);
        herbivore.recompute_traits(config);
        herbivore
    }

    #[derive(Clone, Default)]
    struct SpyPersistence {
        batches: Arc<Mutex<Vec<DayBatch>>>,
    }

    impl PlotPersistence for SpyPersistence {
        fn on_day(&mut self, batch: &DayBatch) {
            self.batches.lock().unwrap().push(batch.clone());
        }
    }

    #[test]
    fn ramp_up_saturates_outside_its_thresholds() {
        assert_eq!(ramp_up(0.0, 0.15, 0.6), 0.0);
        assert_eq!(ramp_up(0.6, 0.15, 0.6), 1.0);
        assert_eq!(ramp_up(0.9, 0.15, 0.6), 1.0);
        let mid = ramp_up(0.375, 0.15, 0.6);
        assert!((mid - 0.5).abs() < 1e-12);
    }

    #[test]
    fn trapezoid_matches_its_piecewise_envelope() {
        assert_eq!(trapezoid(0.0, 1.0, 15.0, 25.0, 35.0), 0.0);
        assert!((trapezoid(8.0, 1.0, 15.0, 25.0, 35.0) - 0.5).abs() < 1e-12);
        assert_eq!(trapezoid(20.0, 1.0, 15.0, 25.0, 35.0), 1.0);
        assert!((trapezoid(30.0, 1.0, 15.0, 25.0, 35.0) - 0.5).abs() < 1e-12);
        assert_eq!(trapezoid(40.0, 1.0, 15.0, 25.0, 35.0), 0.0);
    }

    #[test]
    fn monod_and_inhibition_have_their_half_points() {
        assert!((monod(0.1, 0.1) - 0.5).abs() < 1e-12);
        assert!((monod(0.5, 0.1) - 5.0 / 6.0).abs() < 1e-12);
        assert!((inhibition(0.1, 0.1, 100.0) - 0.5).abs() < 1e-12);
        assert!(inhibition(0.5, 0.1, 100.0) < 1e-10);
    }

    #[test]
    fn saturating_loss_vanishes_at_zero_mass() {
        assert_eq!(saturating_loss(0.05, 0.0, 2.5), 0.0);
        assert_eq!(saturating_loss(0.05, -1.0, 2.5), 0.0);
        let small = saturating_loss(0.05, 0.1, 2.5);
        let large = saturating_loss(0.05, 100.0, 2.5);
        assert!(small < 0.05 * 0.1);
        assert!((large - 0.05 * 100.0 / 1.025).abs() < 1e-9);
    }

    #[test]
    fn climate_table_cycles_over_the_year() {
        let config = PlotConfig::default();
        let table = ClimateTable::sinusoidal(&config);
        assert_eq!(table.len(), DAYS_PER_YEAR as usize);
        let first = table.day(SimDay(0));
        assert!((first.temp_c - 15.0).abs() < 1e-9);
        assert_eq!(first.soil_water, 0.5);
        let peak = table.day(SimDay(91));
        assert!(peak.temp_c > 24.9);
        assert_eq!(table.day(SimDay(365)), table.day(SimDay(0)));
    }

    #[test]
    fn grass_growth_builds_shoot_and_spends_substrate() {
        let config = PlotConfig::default();
        let mut plant = sample_plant(VegKind::GrassC3);
        let before = plant.clone();
        plant.grow_daily(mild_day(), &config);
        assert!(plant.ms > before.ms);
        assert!(plant.cs < before.cs);
        for value in [
            plant.ms, plant.mr, plant.cs, plant.cr, plant.ns, plant.nr, plant.b_leaf,
            plant.b_stem, plant.b_defence, plant.b_repr,
        ] {
            assert!(value.is_finite());
        }
    }

    #[test]
    fn shoot_mass_stays_the_sum_of_its_compartments() {
        let config = PlotConfig::default();
        for kind in [VegKind::GrassC4, VegKind::Tree] {
            let mut plant = sample_plant(kind);
            for _ in 0..30 {
                plant.grow_daily(mild_day(), &config);
                let sum = plant.b_leaf + plant.b_stem + plant.b_defence;
                assert!(
                    (plant.ms - sum).abs() < 1e-9,
                    "{kind:?}: ms {} != compartment sum {sum}",
                    plant.ms
                );
                assert_eq!(plant.b_root, plant.mr);
            }
        }
    }

    #[test]
    fn negative_stem_tree_routes_growth_to_leaf() {
        let config = PlotConfig::default();
        let mut tree = sample_plant(VegKind::Tree);
        tree.b_stem = -0.2;
        tree.b_leaf = 25.0;
        tree.ms = tree.b_leaf + tree.b_stem + tree.b_defence;
        let leaf_before = tree.b_leaf;

        tree.grow_daily(mild_day(), &config);

        // A negative leaf:stem ratio falls off the low end of the ramp, so
        // the stem share is zero and shoot growth lands on the leaf.
        assert!(tree.b_leaf > leaf_before);
        assert!(tree.b_stem < 0.0);
    }

    #[test]
    fn massless_plant_stays_finite_through_growth() {
        let config = PlotConfig::default();
        let mut plant = sample_plant(VegKind::GrassC3);
        plant.ms = 0.0;
        plant.mr = 0.0;
        plant.b_leaf = 0.0;
        plant.b_stem = 0.0;
        plant.b_defence = 0.0;
        plant.cs = 0.0;
        plant.cr = 0.0;
        plant.ns = 0.0;
        plant.nr = 0.0;
        plant.grow_daily(mild_day(), &config);
        for value in [
            plant.ms, plant.mr, plant.cs, plant.cr, plant.ns, plant.nr, plant.b_leaf,
            plant.b_stem, plant.b_defence,
        ] {
            assert!(value.is_finite(), "non-finite field after zero-mass step");
        }
    }

    #[test]
    fn cold_days_shed_leaves_faster() {
        let config = PlotConfig::default();
        let mut cold = sample_plant(VegKind::GrassC3);
        let mut warm = cold.clone();
        // No substrate, so litter is the only flux on the leaf pool.
        for plant in [&mut cold, &mut warm] {
            plant.cs = 0.0;
            plant.ns = 0.0;
        }
        cold.grow_daily(
            DayClimate {
                temp_c: 5.0,
                ..mild_day()
            },
            &config,
        );
        warm.grow_daily(mild_day(), &config);
        assert!(cold.b_leaf < warm.b_leaf);
    }

    #[test]
    fn tract_holds_a_parcel_for_the_full_retention_time() {
        let mut tract = DigestionTract::new(28);
        tract.newest_mut().leaf_kg = 1.0;
        for _ in 0..27 {
            tract.advance();
        }
        assert!((tract.total_mass_kg() - 1.0).abs() < 1e-12);
        assert!((tract.oldest().leaf_kg - 1.0).abs() < 1e-12);
        tract.advance();
        assert_eq!(tract.total_mass_kg(), 0.0);
    }

    #[test]
    fn tract_newest_slot_accumulates_within_the_hour() {
        let mut tract = DigestionTract::new(4);
        tract.newest_mut().stem_kg += 0.25;
        tract.newest_mut().stem_kg += 0.5;
        assert!((tract.slot(0).stem_kg - 0.75).abs() < 1e-12);
        tract.advance();
        assert_eq!(tract.slot(0).stem_kg, 0.0);
        assert!((tract.slot(1).stem_kg - 0.75).abs() < 1e-12);
    }

    #[test]
    fn incorporation_credits_only_the_oldest_parcel() {
        let config = PlotConfig::default();
        let mut herbivore = sample_herbivore(&config);
        let len = herbivore.tract.len();
        {
            let slot = herbivore.tract.newest_mut();
            slot.dc_leaf_kg = 0.010;
            slot.dc_stem_kg = 0.002;
            slot.dp_leaf_kg = 0.003;
            slot.dp_stem_kg = 0.001;
            slot.dp_defence_kg = 0.0005;
        }
        for _ in 0..(len - 1) {
            herbivore.tract.advance();
        }
        herbivore.incorporate_oldest(&config);
        let dc = 0.012;
        let dp = 0.0045;
        assert!((herbivore.digested_carb_day_kg - dc).abs() < 1e-12);
        assert!((herbivore.digested_protein_day_kg - dp).abs() < 1e-12);
        assert!((herbivore.npe_day_kj - 16.7 * dc * 1000.0).abs() < 1e-9);
        assert!((herbivore.pe_day_kj - 16.7 * dp * 1000.0).abs() < 1e-9);
        assert!(
            (herbivore.metabolic_water_day_kg - (0.62 * dc + 0.42 * dp)).abs() < 1e-12
        );
    }

    #[test]
    fn selection_weights_normalise_and_keep_zeros() {
        let weights = selection_weights(&[0.0, 3.5, 0.0]);
        assert_eq!(weights, vec![0.0, 1.0, 0.0]);

        let even = selection_weights(&[2.0, 2.0, 2.0, 2.0]);
        let total: f64 = even.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        for weight in even {
            assert!((weight - 0.25).abs() < 1e-9);
        }

        let none = selection_weights(&[0.0, 0.0]);
        assert!(none.iter().all(|&w| w == 0.0));
    }

    #[test]
    fn lone_candidate_is_targeted_without_a_draw() {
        let config = PlotConfig {
            side_m: 10.0,
            plants_x: 1,
            plants_y: 1,
            ..sample_config()
        };
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let plants = seed_plants(&config, &grid, &mut rng);
        let mut herbivore = sample_herbivore(&config);
        herbivore.x_m = 2.0;
        herbivore.y_m = 2.0;

        let mut untouched = rng.clone();
        pick_a_plant(&mut herbivore, &plants, &grid, &config, 0.2, &mut rng);
        assert_eq!(herbivore.target, Some(PlantId(0)));
        let expected = grid.wrapped_distance((2.0, 2.0), (plants[0].x_m, plants[0].y_m));
        assert!((herbivore.target_dist_m - expected).abs() < 1e-12);
        // No roulette draw for a single candidate.
        assert_eq!(rng.random::<u64>(), untouched.random::<u64>());
    }

    #[test]
    fn depleted_neighbourhood_clears_the_target() {
        let config = sample_config();
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let mut plants = seed_plants(&config, &grid, &mut rng);
        for plant in &mut plants {
            plant.ms = config.min_shoot_kg;
        }
        let mut herbivore = sample_herbivore(&config);
        herbivore.target = Some(PlantId(4));
        herbivore.target_dist_m = 3.0;
        pick_a_plant(&mut herbivore, &plants, &grid, &config, 0.2, &mut rng);
        assert_eq!(herbivore.target, None);
        assert_eq!(herbivore.target_dist_m, 0.0);
    }

    #[test]
    fn density_counts_edible_neighbours_per_square_km() {
        let config = sample_config();
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let mut plants = seed_plants(&config, &grid, &mut rng);
        for plant in &mut plants {
            plant.kind = VegKind::GrassC3;
        }
        let herbivore = sample_herbivore(&config);
        let area_km2 = PI * 10.0 * 10.0 / 1e6;
        let density = plant_density(&herbivore, &plants, &grid, &config);
        assert!((density - 9.0 / area_km2).abs() < 1e-6);

        // A tall tree is out of a grazer's reach and leaves the count.
        plants[0].kind = VegKind::Tree;
        let density = plant_density(&herbivore, &plants, &grid, &config);
        assert!((density - 8.0 / area_km2).abs() < 1e-6);
    }

    #[test]
    fn browse_line_limits_tree_edibility() {
        let config = PlotConfig::default();
        let mut tree = sample_plant(VegKind::Tree);
        assert!(!tree.is_edible(Diet::Grazer, &config));
        assert!(tree.is_edible(Diet::Browser, &config));
        assert!(tree.is_edible(Diet::Mixed, &config));
        tree.height_m = 4.0;
        assert!(!tree.is_edible(Diet::Browser, &config));

        let grass = sample_plant(VegKind::GrassC4);
        assert!(grass.is_edible(Diet::Grazer, &config));
        assert!(grass.is_edible(Diet::Mixed, &config));
        assert!(!grass.is_edible(Diet::Browser, &config));
    }

    #[test]
    fn ration_mismatch_clamps_negative_pools() {
        let config = PlotConfig::default();
        let mut plant = sample_plant(VegKind::GrassC3);
        plant.ns = -1.0;
        // A drained N pool reads as zero protein, not a negative offer.
        let mismatch = ration_mismatch(0.3, &plant, &config);
        assert_eq!(mismatch, 0.3);

        // With the C pool drained too the offer is 0/0: never finite.
        plant.cs = -1.0;
        assert!(ration_mismatch(0.3, &plant, &config).is_nan());
    }

    #[test]
    fn carbon_depleted_shoot_drops_out_of_selection() {
        let config = PlotConfig::default();
        let grid = config.grid().unwrap();
        let herbivore = sample_herbivore(&config);
        let healthy = sample_plant(VegKind::GrassC3);
        let mut depleted = sample_plant(VegKind::GrassC3);
        depleted.cs = 0.0;

        let desired = 0.22;
        let mismatch = ration_mismatch(desired, &depleted, &config);
        assert_eq!(mismatch, f64::NEG_INFINITY);

        let healthy_score = selection_score(&herbivore, &healthy, desired, &grid, &config);
        let depleted_score = selection_score(&herbivore, &depleted, desired, &grid, &config);
        assert!(healthy_score > 0.0);
        assert_eq!(depleted_score, 0.0);

        // All of the roulette mass lands on the healthy plant.
        let weights = selection_weights(&[depleted_score, healthy_score]);
        assert_eq!(weights[0], 0.0);
        assert!((weights[1] - 1.0).abs() < 1e-12);

        // The stay-or-leave threshold is infinite, so no draw can pass it.
        let density = 9.0 / (PI * config.detection_m * config.detection_m / 1e6);
        assert!((mismatch.abs() / density * PATCH_LEAVE_SCALE).is_infinite());
    }

    #[test]
    fn fresh_day_requires_the_target_protein_share() {
        let config = PlotConfig::default();
        let herbivore = sample_herbivore(&config);
        let ratio = herbivore.required_energy_ratio(&config);
        assert!((ratio - 1.0 / config.npe_to_pe_target).abs() < 1e-12);
    }

    #[test]
    fn eating_moves_mass_from_plant_to_tract() {
        let config = PlotConfig::default();
        let mut herbivore = sample_herbivore(&config);
        let mut plant = sample_plant(VegKind::GrassC3);
        // A grown plant's shoot equals its compartment sum.
        plant.ms = plant.b_leaf + plant.b_stem + plant.b_defence;
        let shoot_before = plant.ms;
        let water_before = plant.q_shoot;

        herbivore.eat(&mut plant, &config);

        let intake = herbivore.intake_total_day_kg;
        assert!(intake > 0.0);
        assert!((shoot_before - plant.ms - intake).abs() < 1e-12);
        assert!((herbivore.tract.slot(0).mass_kg() - intake).abs() < 1e-12);
        assert_eq!(herbivore.intake_total_kg, intake);
        let water_taken = water_before - plant.q_shoot;
        assert!((herbivore.forage_water_day_kg - water_taken).abs() < 1e-12);
        assert!(
            (plant.ms - (plant.b_leaf + plant.b_stem + plant.b_defence)).abs() < 1e-9
        );
    }

    #[test]
    fn defence_load_slows_the_bite() {
        let config = PlotConfig::default();
        let mut plain = sample_plant(VegKind::GrassC3);
        let mut defended = sample_plant(VegKind::GrassC3);
        defended.b_defence = 25.0;
        defended.b_leaf = 25.0;
        let mut h1 = sample_herbivore(&config);
        let mut h2 = sample_herbivore(&config);
        h1.eat(&mut plain, &config);
        h2.eat(&mut defended, &config);
        assert!(h2.intake_total_day_kg < h1.intake_total_day_kg);
    }

    #[test]
    fn herbivore_snaps_onto_a_reachable_target() {
        let config = sample_config();
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let plants = seed_plants(&config, &grid, &mut rng);
        let mut herbivore = sample_herbivore(&config);
        let target = &plants[4];
        herbivore.x_m = target.x_m - 5.0;
        herbivore.y_m = target.y_m;
        herbivore.target = Some(PlantId(4));
        herbivore.target_dist_m = 5.0;

        herbivore_move(&mut herbivore, &plants, &grid, &mut rng);
        assert_eq!(herbivore.x_m, target.x_m);
        assert_eq!(herbivore.y_m, target.y_m);
        assert!((herbivore.distance_day_m - 5.0).abs() < 1e-12);
        assert_eq!(herbivore.target_dist_m, 0.0);
    }

    #[test]
    fn distant_target_draws_a_straight_step() {
        let config = sample_config();
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let plants = seed_plants(&config, &grid, &mut rng);
        let mut herbivore = sample_herbivore(&config);
        herbivore.traits.max_speed_m_s = 0.01;
        herbivore.x_m = 5.0;
        herbivore.y_m = 5.0;
        herbivore.target = Some(PlantId(4));
        herbivore.target_dist_m =
            grid.wrapped_distance((5.0, 5.0), (plants[4].x_m, plants[4].y_m));

        let before = herbivore.target_dist_m;
        herbivore_move(&mut herbivore, &plants, &grid, &mut rng);
        assert!((herbivore.distance_day_m - 0.6).abs() < 1e-12);
        assert!(herbivore.target_dist_m < before);
        // Step lies on the straight line towards (15, 15).
        assert!((herbivore.x_m - herbivore.y_m).abs() < 1e-12);
    }

    #[test]
    fn vertical_bearing_steps_along_y() {
        let config = sample_config();
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let mut plants = seed_plants(&config, &grid, &mut rng);
        plants[3].x_m = 5.0;
        plants[3].y_m = 25.0;
        let mut herbivore = sample_herbivore(&config);
        herbivore.traits.max_speed_m_s = 0.01;
        herbivore.x_m = 5.0;
        herbivore.y_m = 5.0;
        herbivore.target = Some(PlantId(3));
        herbivore.target_dist_m = 10.0;

        herbivore_move(&mut herbivore, &plants, &grid, &mut rng);
        assert_eq!(herbivore.x_m, 5.0);
        assert!((herbivore.y_m - 5.6).abs() < 1e-12);
    }

    #[test]
    fn aimless_move_stays_on_the_plot() {
        let config = sample_config();
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let plants = seed_plants(&config, &grid, &mut rng);
        let mut herbivore = sample_herbivore(&config);
        herbivore.traits.max_speed_m_s = 0.05;
        herbivore.x_m = 29.5;
        herbivore.y_m = 0.5;
        for _ in 0..50 {
            herbivore_move(&mut herbivore, &plants, &grid, &mut rng);
            assert!((0.0..=config.side_m).contains(&herbivore.x_m));
            assert!((0.0..=config.side_m).contains(&herbivore.y_m));
        }
    }

    #[test]
    fn idle_day_settles_water_by_drinking() {
        let config = sample_config();
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let mut plants = seed_plants(&config, &grid, &mut rng);
        let mut herbivore = sample_herbivore(&config);
        herbivore.foraging_hours = 0.0;

        forage_day(&mut herbivore, &mut plants, &grid, &config, SimDay(0), &mut rng)
            .unwrap();

        let required = config.water_turnover * config.herbivore_mass_kg;
        assert_eq!(herbivore.intake_total_day_kg, 0.0);
        assert_eq!(herbivore.drinking_water_day_kg, required);
        assert_eq!(herbivore.water_balance_kg, 0.0);
        assert_eq!(herbivore.distance_day_m, config.water_trip_m);
        let expected_cost =
            herbivore.maintenance_kj(&config) + herbivore.locomotion_kj(&config);
        assert!((herbivore.energy_balance_kj + expected_cost).abs() < 1e-9);
    }

    #[test]
    fn first_day_fires_twenty_three_hourly_advances() {
        let config = sample_config();
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let mut plants = seed_plants(&config, &grid, &mut rng);
        let mut herbivore = sample_herbivore(&config);
        herbivore.foraging_hours = 0.0;
        herbivore.tract.newest_mut().leaf_kg = 1.0;

        forage_day(&mut herbivore, &mut plants, &grid, &config, SimDay(0), &mut rng)
            .unwrap();
        // Day one advances at minutes 60..=1380, so the parcel sits 23 slots in.
        assert_eq!(herbivore.current_hour, 23);
        assert!((herbivore.tract.slot(23).leaf_kg - 1.0).abs() < 1e-12);
        assert!((herbivore.gut_content_kg - 1.0).abs() < 1e-12);

        forage_day(&mut herbivore, &mut plants, &grid, &config, SimDay(1), &mut rng)
            .unwrap();
        assert_eq!(herbivore.current_hour, 47);
        assert_eq!(herbivore.gut_content_kg, 0.0);
    }

    #[test]
    fn eating_without_a_target_is_an_invariant_error() {
        let config = sample_config();
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let mut plants = seed_plants(&config, &grid, &mut rng);
        let mut herbivore = sample_herbivore(&config);
        herbivore.behaviour = Behaviour::Eating;
        herbivore.target = None;

        let result =
            forage_day(&mut herbivore, &mut plants, &grid, &config, SimDay(0), &mut rng);
        assert!(matches!(result, Err(WorldError::Invariant(_))));
    }

    #[test]
    fn out_of_range_target_is_an_invariant_error() {
        let config = sample_config();
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let mut plants = seed_plants(&config, &grid, &mut rng);
        let mut herbivore = sample_herbivore(&config);
        herbivore.behaviour = Behaviour::Eating;
        herbivore.target = Some(PlantId(99));

        let result =
            forage_day(&mut herbivore, &mut plants, &grid, &config, SimDay(0), &mut rng);
        assert!(matches!(result, Err(WorldError::Invariant(_))));
    }

    #[test]
    fn seeded_worlds_evolve_identically() {
        let config = PlotConfig {
            rng_seed: Some(42),
            ..sample_config()
        };
        let mut a = PlotWorld::new(config.clone()).unwrap();
        let mut b = PlotWorld::new(config.clone()).unwrap();
        for _ in 0..6 {
            a.advance_day().unwrap();
            b.advance_day().unwrap();
        }
        assert_eq!(a.history(), b.history());

        let mut c = PlotWorld::new(PlotConfig {
            rng_seed: Some(43),
            ..config
        })
        .unwrap();
        for _ in 0..6 {
            c.advance_day().unwrap();
        }
        assert_ne!(a.history(), c.history());
    }

    #[test]
    fn persistence_sees_plants_daily_and_herbivores_after_spin_up() {
        let spy = SpyPersistence::default();
        let batches = Arc::clone(&spy.batches);
        let config = PlotConfig {
            years: 2,
            spin_up_years: 1,
            ..sample_config()
        };
        let mut world = PlotWorld::with_persistence(config, Box::new(spy)).unwrap();
        for _ in 0..366 {
            world.advance_day().unwrap();
        }

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 366);
        assert_eq!(batches[0].plants.len(), 9);
        assert!(batches[364].herbivores.is_empty());
        assert_eq!(batches[365].herbivores.len(), 1);
        assert_eq!(batches[365].herbivores[0].year, 1);
        assert_eq!(batches[365].summary.herbivores.len(), 1);
    }

    #[test]
    fn history_is_bounded_by_its_capacity() {
        let config = PlotConfig {
            history_capacity: 5,
            ..sample_config()
        };
        let mut world = PlotWorld::new(config).unwrap();
        for _ in 0..8 {
            world.advance_day().unwrap();
        }
        assert_eq!(world.history().len(), 5);
        assert_eq!(world.history().front().map(|s| s.day), Some(SimDay(3)));
        assert_eq!(world.history().back().map(|s| s.day), Some(SimDay(7)));
    }

    #[test]
    fn config_validation_rejects_degenerate_setups() {
        assert!(PlotConfig::default().validate().is_ok());
        let cases = [
            PlotConfig {
                side_m: 0.0,
                ..PlotConfig::default()
            },
            PlotConfig {
                plants_x: 0,
                ..PlotConfig::default()
            },
            PlotConfig {
                plant_kinds: Vec::new(),
                ..PlotConfig::default()
            },
            PlotConfig {
                mrt_h: 0,
                ..PlotConfig::default()
            },
            PlotConfig {
                foraging_hours: 25.0,
                ..PlotConfig::default()
            },
            PlotConfig {
                herbivore_mass_kg: -1.0,
                ..PlotConfig::default()
            },
            PlotConfig {
                photo_temp_curve: [35.0, 25.0, 15.0, 1.0],
                ..PlotConfig::default()
            },
        ];
        for config in cases {
            assert!(matches!(
                config.validate(),
                Err(WorldError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn seeding_places_one_plant_per_bucket() {
        let config = sample_config();
        let grid = config.grid().unwrap();
        let mut rng = config.seeded_rng();
        let plants = seed_plants(&config, &grid, &mut rng);
        assert_eq!(plants.len(), 9);
        for (i, plant) in plants.iter().enumerate() {
            let cell = grid.occupant_cell(plant.x_m, plant.y_m);
            assert_eq!(grid.index_of(cell).as_usize(), i);
            assert!((plant.ms - plant.mr).abs() < 1e-12);
            assert!((plant.q_shoot - 8.0 * plant.ms).abs() < 1e-9);
            let sum = plant.b_leaf + plant.b_stem + plant.b_defence;
            // Defence starts as an extra sliver on top of the shoot.
            assert!((sum - plant.ms * (1.0 + DEFENCE_ALLOCATION)).abs() < 1e-9);
        }
    }
}

//! The load timeline: declarative load simulations compiled into a
//! time-indexed schedule.
//!
//! A simulation list is compiled once per scenario into a gap-free,
//! total-ordered list of intervals starting at t=0. Closed intervals carry
//! a target level of concurrent copies; open intervals carry an injection
//! rate in copies per second. Within a ramp interval the value is linearly
//! interpolated between the previous value on the same track and the
//! declared endpoint; the first ramp on a track starts from 0.

use std::fmt;
use std::time::Duration;

use crate::error::{AppError, Result};

/// One declarative load phase.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoadSimulation {
    /// Linearly ramp the number of concurrent copies to `copies` over
    /// `during`.
    RampConstant { copies: u32, during: Duration },
    /// Maintain exactly `copies` concurrent copies for `during`.
    KeepConstant { copies: u32, during: Duration },
    /// Linearly ramp the injection rate to `rate` copies per second over
    /// `during`; each injected copy runs the pipeline once.
    RampPerSec { rate: f64, during: Duration },
    /// Inject `rate` copies per second for `during`.
    InjectPerSec { rate: f64, during: Duration },
}

impl LoadSimulation {
    pub fn during(&self) -> Duration {
        match self {
            Self::RampConstant { during, .. }
            | Self::KeepConstant { during, .. }
            | Self::RampPerSec { during, .. }
            | Self::InjectPerSec { during, .. } => *during,
        }
    }

    pub fn mode(&self) -> LoadMode {
        match self {
            Self::RampConstant { .. } | Self::KeepConstant { .. } => LoadMode::Closed,
            Self::RampPerSec { .. } | Self::InjectPerSec { .. } => LoadMode::Open,
        }
    }
}

impl fmt::Display for LoadSimulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RampConstant { copies, during } => {
                write!(f, "RampConstant(copies: {copies}, during: {during:?})")
            }
            Self::KeepConstant { copies, during } => {
                write!(f, "KeepConstant(copies: {copies}, during: {during:?})")
            }
            Self::RampPerSec { rate, during } => {
                write!(f, "RampPerSec(rate: {rate}, during: {during:?})")
            }
            Self::InjectPerSec { rate, during } => {
                write!(f, "InjectPerSec(rate: {rate}, during: {during:?})")
            }
        }
    }
}

/// Whether an interval schedules a concurrency level or an injection rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    Closed,
    Open,
}

/// One compiled interval `[start, end)`.
#[derive(Clone, Copy, Debug)]
pub struct TimelineInterval {
    pub start: Duration,
    pub end: Duration,
    pub mode: LoadMode,
    /// Copies target (closed) or rate (open) at `start`.
    pub from: f64,
    /// Same, at `end`.
    pub to: f64,
}

/// The instantaneous schedule at one point in time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimelinePoint {
    pub mode: LoadMode,
    /// Target concurrent copies; 0 inside open intervals.
    pub copies: u32,
    /// Injection rate in copies per second; 0 inside closed intervals.
    pub rate: f64,
}

/// A compiled, gap-free schedule starting at t=0.
#[derive(Clone, Debug)]
pub struct LoadTimeline {
    intervals: Vec<TimelineInterval>,
    planned_duration: Duration,
}

impl LoadTimeline {
    /// Compile a simulation list. The closed and open tracks keep
    /// independent running levels so a ramp resumes from its own track's
    /// previous endpoint.
    pub fn compile(scenario_name: &str, simulations: &[LoadSimulation]) -> Result<Self> {
        if simulations.is_empty() {
            return Err(AppError::EmptyLoadSimulations {
                scenario: scenario_name.to_string(),
            });
        }

        let mut intervals = Vec::with_capacity(simulations.len());
        let mut at = Duration::ZERO;
        let mut copies_level = 0.0_f64;
        let mut rate_level = 0.0_f64;

        for simulation in simulations {
            if simulation.during().is_zero() {
                return Err(AppError::InvalidDuration {
                    scenario: scenario_name.to_string(),
                    simulation: simulation.to_string(),
                });
            }

            let (from, to) = match *simulation {
                LoadSimulation::RampConstant { copies, .. } => (copies_level, f64::from(copies)),
                LoadSimulation::KeepConstant { copies, .. } => {
                    (f64::from(copies), f64::from(copies))
                }
                LoadSimulation::RampPerSec { rate, .. } => (rate_level, rate),
                LoadSimulation::InjectPerSec { rate, .. } => (rate, rate),
            };
            match simulation.mode() {
                LoadMode::Closed => copies_level = to,
                LoadMode::Open => rate_level = to,
            }

            let end = at + simulation.during();
            intervals.push(TimelineInterval {
                start: at,
                end,
                mode: simulation.mode(),
                from,
                to,
            });
            at = end;
        }

        Ok(Self {
            intervals,
            planned_duration: at,
        })
    }

    /// Sum of all simulation durations.
    pub fn planned_duration(&self) -> Duration {
        self.planned_duration
    }

    /// The instantaneous target at time `t`, or `None` once the plan is
    /// over (`t >= planned_duration`).
    pub fn target_at(&self, t: Duration) -> Option<TimelinePoint> {
        let interval = self
            .intervals
            .iter()
            .find(|interval| interval.start <= t && t < interval.end)?;

        let span = (interval.end - interval.start).as_secs_f64();
        let frac = (t - interval.start).as_secs_f64() / span;
        let value = interval.from + (interval.to - interval.from) * frac;

        Some(match interval.mode {
            LoadMode::Closed => TimelinePoint {
                mode: LoadMode::Closed,
                copies: value.round() as u32,
                rate: 0.0,
            },
            LoadMode::Open => TimelinePoint {
                mode: LoadMode::Open,
                copies: 0,
                rate: value,
            },
        })
    }

    pub fn intervals(&self) -> &[TimelineInterval] {
        &self.intervals
    }
}

//! Valve time→flow transfer curve.
//!
//! Flow through a motorized valve is rarely linear in stem travel: a ball
//! valve passes almost nothing over the first quarter turn and almost
//! everything over the last. A [`FlowCurve`] captures that shape as an
//! ascending sequence of (travel-time %, flow %) points, piecewise-linearly
//! interpolated, implicitly anchored at (0, 0) and (100, 100).
//!
//! Actuation uses the *inverse* direction: the caller asks for a flow
//! percentage and the channel worker needs the travel-time fraction that
//! produces it. Flat curve segments (dead zones) invert to their earliest
//! time so positioning never overshoots into the flat region.
//!
//! An empty curve is the identity mapping.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One point of a valve transfer curve. Both axes are percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub time_pct: f32,
    pub flow_pct: f32,
}

/// Piecewise-linear time%→flow% transfer curve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowCurve {
    points: Vec<CurvePoint>,
}

/// Closing anchor shared by both interpolation directions.
const END_ANCHOR: CurvePoint = CurvePoint {
    time_pct: 100.0,
    flow_pct: 100.0,
};

impl FlowCurve {
    pub fn new(points: Vec<CurvePoint>) -> Self {
        Self { points }
    }

    /// The identity mapping (no shaping points).
    pub fn identity() -> Self {
        Self { points: Vec::new() }
    }

    /// Convenience constructor from `(time_pct, flow_pct)` pairs.
    pub fn from_pairs(pairs: &[(f32, f32)]) -> Self {
        Self {
            points: pairs
                .iter()
                .map(|&(time_pct, flow_pct)| CurvePoint { time_pct, flow_pct })
                .collect(),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    /// Accept-time validation: both axes within 0–100, time strictly
    /// ascending, flow non-decreasing (a valve does not pass less flow the
    /// further it opens).
    pub fn validate(&self) -> Result<(), Error> {
        let mut prev_time = 0.0f32;
        let mut prev_flow = 0.0f32;
        for (i, p) in self.points.iter().enumerate() {
            if !(0.0..=100.0).contains(&p.time_pct) || !(0.0..=100.0).contains(&p.flow_pct) {
                return Err(Error::Config("flow curve point outside 0–100"));
            }
            if i > 0 && p.time_pct <= prev_time {
                return Err(Error::Config("flow curve times not strictly ascending"));
            }
            if p.flow_pct < prev_flow {
                return Err(Error::Config("flow curve flows not monotonic"));
            }
            prev_time = p.time_pct;
            prev_flow = p.flow_pct;
        }
        Ok(())
    }

    /// Flow percentage produced after `time_pct` of the travel time.
    pub fn flow_at(&self, time_pct: f32) -> f32 {
        let t = time_pct.clamp(0.0, 100.0);
        let mut prev = CurvePoint {
            time_pct: 0.0,
            flow_pct: 0.0,
        };
        for p in self.points.iter().copied().chain([END_ANCHOR]) {
            if t <= p.time_pct {
                let dt = p.time_pct - prev.time_pct;
                if dt <= f32::EPSILON {
                    return p.flow_pct;
                }
                let frac = (t - prev.time_pct) / dt;
                return prev.flow_pct + frac * (p.flow_pct - prev.flow_pct);
            }
            prev = p;
        }
        prev.flow_pct
    }

    /// Travel-time percentage needed to reach `flow_pct`, the inverse of
    /// [`flow_at`]. Within a flat segment the earliest time is returned.
    ///
    /// [`flow_at`]: FlowCurve::flow_at
    pub fn time_for_flow(&self, flow_pct: f32) -> f32 {
        let fl = flow_pct.clamp(0.0, 100.0);
        let mut prev = CurvePoint {
            time_pct: 0.0,
            flow_pct: 0.0,
        };
        for p in self.points.iter().copied().chain([END_ANCHOR]) {
            if fl <= p.flow_pct {
                let df = p.flow_pct - prev.flow_pct;
                if df <= f32::EPSILON {
                    return prev.time_pct;
                }
                let frac = (fl - prev.flow_pct) / df;
                return prev.time_pct + frac * (p.time_pct - prev.time_pct);
            }
            prev = p;
        }
        prev.time_pct
    }
}

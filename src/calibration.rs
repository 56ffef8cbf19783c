//! Voltage to temperature conversion for the multiplexed NTC inputs.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub millivolts: i32,
    /// Temperature in 0.1 °C.
    pub deci_celsius: i32,
}

const fn point(millivolts: i32, deci_celsius: i32) -> CurvePoint {
    CurvePoint {
        millivolts,
        deci_celsius,
    }
}

// 10k NTC (B=3435) against a 10k pull-up on the 3 V reference.
const DEFAULT_NTC: [CurvePoint; 12] = [
    point(2916, -400),
    point(2839, -300),
    point(2717, -200),
    point(2539, -100),
    point(2301, 0),
    point(2014, 100),
    point(1700, 200),
    point(1384, 300),
    point(1091, 400),
    point(838, 500),
    point(633, 600),
    point(350, 800),
];

/// Piecewise linear calibration curve, strictly monotonic in voltage.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureCurve {
    points: Vec<CurvePoint>,
    descending: bool,
}

impl TemperatureCurve {
    pub fn new(points: Vec<CurvePoint>) -> Result<Self, ConfigError> {
        if points.len() < 2 {
            return Err(ConfigError::Invalid(
                "temperature curve needs at least two points".into(),
            ));
        }
        let descending = points[0].millivolts > points[1].millivolts;
        let monotonic = points.windows(2).all(|pair| {
            if descending {
                pair[0].millivolts > pair[1].millivolts
            } else {
                pair[0].millivolts < pair[1].millivolts
            }
        });
        if !monotonic {
            return Err(ConfigError::Invalid(
                "temperature curve voltages must be strictly monotonic".into(),
            ));
        }
        if let Some(point) = points
            .iter()
            .find(|point| i16::try_from(point.deci_celsius).is_err())
        {
            return Err(ConfigError::Invalid(format!(
                "temperature curve point {} x 0.1 °C is out of range",
                point.deci_celsius
            )));
        }
        Ok(Self { points, descending })
    }

    pub fn default_ntc() -> Self {
        Self {
            points: DEFAULT_NTC.to_vec(),
            descending: true,
        }
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    /// `true` if the voltage lies between the first and the last point.
    pub fn covers(&self, millivolts: i32) -> bool {
        let first = self.points[0].millivolts;
        let last = self.points[self.points.len() - 1].millivolts;
        (first.min(last)..=first.max(last)).contains(&millivolts)
    }

    /// Converts a voltage to 0.1 °C, clamping to the ends of the curve.
    pub fn deci_celsius(&self, millivolts: i32) -> i32 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        let before_first = if self.descending {
            millivolts >= first.millivolts
        } else {
            millivolts <= first.millivolts
        };
        if before_first {
            return first.deci_celsius;
        }
        for pair in self.points.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let inside = if self.descending {
                millivolts <= a.millivolts && millivolts >= b.millivolts
            } else {
                millivolts >= a.millivolts && millivolts <= b.millivolts
            };
            if inside {
                let span = b.millivolts - a.millivolts;
                let offset = millivolts - a.millivolts;
                return a.deci_celsius + (b.deci_celsius - a.deci_celsius) * offset / span;
            }
        }
        last.deci_celsius
    }
}

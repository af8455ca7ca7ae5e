//! CIELAB conversions for perceptual interpolation.
//!
//! Gains are treated as linear-light sRGB primaries under a D65 white point.

use std::cell::RefCell;

use crate::color::{ColorTemperature, RgbGain, kelvin_to_rgb_gain};

const D65_WHITE_POINT: [f64; 3] = [0.95047, 1.0, 1.08883];
const EPSILON: f64 = 216.0 / 24389.0;
const KAPPA: f64 = 24389.0 / 27.0;

const RGB_TO_XYZ: [[f64; 3]; 3] = [
    [0.4124564, 0.3575761, 0.1804375],
    [0.2126729, 0.7151522, 0.0721750],
    [0.0193339, 0.1191920, 0.9503041],
];

/// Candidates scanned before refining to single Kelvin steps.
const COARSE_SCAN_STEPS: u32 = 200;

/// Nodes along a [`PerceptualPath`].
const PATH_SEGMENTS: u32 = 256;

/// Share of a [`PerceptualPath`]'s length measured in Kelvin rather than Lab.
/// Bounds the Kelvin covered by any slice of progress to `1 / KELVIN_SHARE`
/// times that slice of the full span.
const KELVIN_SHARE: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lab {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

impl Lab {
    /// CIE76 colour difference.
    pub fn distance(self, other: Lab) -> f64 {
        ((self.l - other.l).powi(2) + (self.a - other.a).powi(2) + (self.b - other.b).powi(2)).sqrt()
    }
}

fn mul(matrix: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        matrix[0][0] * v[0] + matrix[0][1] * v[1] + matrix[0][2] * v[2],
        matrix[1][0] * v[0] + matrix[1][1] * v[1] + matrix[1][2] * v[2],
        matrix[2][0] * v[0] + matrix[2][1] * v[1] + matrix[2][2] * v[2],
    ]
}

fn lab_f(t: f64) -> f64 {
    if t > EPSILON {
        t.cbrt()
    } else {
        (KAPPA * t + 16.0) / 116.0
    }
}

pub fn rgb_to_lab(gain: RgbGain) -> Lab {
    let xyz = mul(&RGB_TO_XYZ, [gain.red, gain.green, gain.blue]);
    let fx = lab_f(xyz[0] / D65_WHITE_POINT[0]);
    let fy = lab_f(xyz[1] / D65_WHITE_POINT[1]);
    let fz = lab_f(xyz[2] / D65_WHITE_POINT[2]);

    Lab {
        l: 116.0 * fy - 16.0,
        a: 500.0 * (fx - fy),
        b: 200.0 * (fy - fz),
    }
}

/// The temperature in `[low, high]` whose gain is perceptually closest to
/// `target`.
pub fn nearest_kelvin(target: RgbGain, low: u32, high: u32) -> ColorTemperature {
    let (low, high) = if low <= high { (low, high) } else { (high, low) };
    let target = rgb_to_lab(target);
    let distance = |kelvin: u32| rgb_to_lab(kelvin_to_rgb_gain(kelvin)).distance(target);

    let step = ((high - low) / COARSE_SCAN_STEPS).max(1);
    let mut best = low;
    let mut best_distance = distance(low);
    let mut kelvin = low;
    while kelvin <= high {
        let d = distance(kelvin);
        if d < best_distance {
            best = kelvin;
            best_distance = d;
        }
        kelvin += step;
    }
    if distance(high) < best_distance {
        best = high;
        best_distance = distance(high);
    }

    for kelvin in best.saturating_sub(step).max(low)..=(best + step).min(high) {
        let d = distance(kelvin);
        if d < best_distance {
            best = kelvin;
            best_distance = d;
        }
    }

    ColorTemperature::clamped(best as f64)
}

/// A route between two temperatures along the Kelvin curve, measured so
/// equal steps of progress cover equal distance.
///
/// Distance is CIELAB arc length plus a Kelvin term. Where the curve is
/// nearly flat in Lab (below the blue cutoff, above the red/blue crossover)
/// the Kelvin term keeps progress moving instead of jumping across the flat
/// stretch.
#[derive(Debug, Clone, PartialEq)]
pub struct PerceptualPath {
    from: ColorTemperature,
    to: ColorTemperature,
    kelvin: Vec<f64>,
    /// Cumulative distance at each node, normalised so the last is 1.
    distance: Vec<f64>,
}

impl PerceptualPath {
    pub fn new(from: ColorTemperature, to: ColorTemperature) -> Self {
        let start = from.kelvin() as f64;
        let end = to.kelvin() as f64;
        let segments = from.delta(to).clamp(1, PATH_SEGMENTS);
        let kelvin: Vec<f64> = (0..=segments)
            .map(|i| start + (end - start) * i as f64 / segments as f64)
            .collect();

        let lab_steps: Vec<f64> = kelvin
            .windows(2)
            .map(|pair| {
                let a = rgb_to_lab(kelvin_to_rgb_gain(pair[0].round() as u32));
                let b = rgb_to_lab(kelvin_to_rgb_gain(pair[1].round() as u32));
                a.distance(b)
            })
            .collect();
        let lab_total: f64 = lab_steps.iter().sum();
        let span = (end - start).abs();

        // Weight per Kelvin that makes Kelvin travel KELVIN_SHARE of the total
        let per_kelvin = if lab_total > 0.0 && span > 0.0 {
            lab_total * KELVIN_SHARE / ((1.0 - KELVIN_SHARE) * span)
        } else {
            1.0
        };

        let mut distance = Vec::with_capacity(kelvin.len());
        let mut total = 0.0;
        distance.push(total);
        for (i, lab_step) in lab_steps.iter().enumerate() {
            total += lab_step + per_kelvin * (kelvin[i + 1] - kelvin[i]).abs();
            distance.push(total);
        }
        if total > 0.0 {
            for d in &mut distance {
                *d /= total;
            }
        }

        Self {
            from,
            to,
            kelvin,
            distance,
        }
    }

    pub fn endpoints(&self) -> (ColorTemperature, ColorTemperature) {
        (self.from, self.to)
    }

    /// The temperature at fraction `t` of the path's length.
    pub fn at(&self, t: f64) -> ColorTemperature {
        if t <= 0.0 || self.from == self.to {
            return self.from;
        }
        if t >= 1.0 {
            return self.to;
        }

        let last = self.distance.len() - 1;
        let i = self.distance.partition_point(|&d| d < t).clamp(1, last);
        let (d0, d1) = (self.distance[i - 1], self.distance[i]);
        let within = if d1 > d0 { (t - d0) / (d1 - d0) } else { 1.0 };
        let kelvin = self.kelvin[i - 1] + (self.kelvin[i] - self.kelvin[i - 1]) * within;
        ColorTemperature::clamped(kelvin)
    }
}

thread_local! {
    static LAST_PATH: RefCell<Option<PerceptualPath>> = const { RefCell::new(None) };
}

/// Interpolate two temperatures at an even perceptual pace.
///
/// The path for the most recent `(from, to)` pair is kept per thread, so a
/// running transition builds it once.
pub fn interpolate_kelvin(from: ColorTemperature, to: ColorTemperature, t: f64) -> ColorTemperature {
    if t <= 0.0 || from == to {
        return from;
    }
    if t >= 1.0 {
        return to;
    }

    LAST_PATH.with(|cell| {
        let mut last = cell.borrow_mut();
        match last.as_ref() {
            Some(path) if path.endpoints() == (from, to) => path.at(t),
            _ => {
                let path = PerceptualPath::new(from, to);
                let kelvin = path.at(t);
                *last = Some(path);
                kelvin
            }
        }
    })
}

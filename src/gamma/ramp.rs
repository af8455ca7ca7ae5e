//! Gamma lookup tables.

use crate::color::{ColorTemperature, RgbGain};

/// Per-channel gamma lookup tables of equal length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GammaRamp {
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
}

impl GammaRamp {
    /// Linear ramp, the state of an unmodified display.
    pub fn identity(size: usize) -> Self {
        Self::for_gain(size, RgbGain::IDENTITY)
    }

    pub fn for_gain(size: usize, gain: RgbGain) -> Self {
        Self {
            red: generate_gamma_table(size, gain.red),
            green: generate_gamma_table(size, gain.green),
            blue: generate_gamma_table(size, gain.blue),
        }
    }

    pub fn for_temperature(size: usize, temperature: ColorTemperature) -> Self {
        Self::for_gain(size, temperature.rgb_gain())
    }

    pub fn size(&self) -> usize {
        self.red.len()
    }

    /// Number of bytes in the wire layout.
    pub fn byte_len(&self) -> usize {
        self.size() * 3 * std::mem::size_of::<u16>()
    }

    /// Concatenated R, G, B tables as little-endian 16-bit values, the layout
    /// the wlr gamma control protocol expects.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.byte_len()];
        self.write_le_bytes(&mut bytes);
        bytes
    }

    /// Write the wire layout into `buffer`, returning the bytes written.
    /// Stops early if the buffer is too small.
    pub fn write_le_bytes(&self, buffer: &mut [u8]) -> usize {
        let values = self.red.iter().chain(&self.green).chain(&self.blue);
        let mut written = 0;
        for (chunk, value) in buffer.chunks_exact_mut(2).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
            written += 2;
        }
        written
    }
}

/// Generate one channel's table scaled by `factor`.
pub fn generate_gamma_table(size: usize, factor: f64) -> Vec<u16> {
    if size == 0 {
        return Vec::new();
    }
    if size == 1 {
        return vec![(factor.clamp(0.0, 1.0) * 65535.0) as u16];
    }

    let factor = factor.clamp(0.0, 1.0);
    (0..size)
        .map(|i| {
            let input = i as f64 / (size - 1) as f64;
            (input * factor * 65535.0).round().clamp(0.0, 65535.0) as u16
        })
        .collect()
}

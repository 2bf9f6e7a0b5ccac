/// Smallest value an energy estimate is allowed to take.
pub const ENERGY_EPS: f32 = 1e-10;

/// Floor applied to RMS values before taking a logarithm.
pub const RMS_FLOOR: f32 = 1e-9;

pub fn db_to_gain(db: f32) -> f32 {
    (10.0f32).powf(db / 20.0)
}

pub fn mean_energy(x: &[f32]) -> f32 {
    let mut s = 0.0f32;
    for &v in x {
        s += v * v;
    }
    s / (x.len().max(1) as f32)
}

pub fn frame_rms(x: &[f32]) -> f32 {
    mean_energy(x).sqrt()
}

pub fn peak_abs(x: &[f32]) -> f32 {
    x.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
}

/// Sound pressure level of an RMS amplitude, relative to `reference`.
pub fn rms_to_db_spl(rms: f32, reference: f32) -> f32 {
    20.0 * (rms.max(RMS_FLOOR) / reference.max(RMS_FLOOR)).log10()
}

/// Clamp every sample into [-1, 1].
pub fn hard_ceiling(x: &mut [f32]) {
    for v in x.iter_mut() {
        if v.abs() > 1.0 {
            *v = v.signum();
        }
    }
}

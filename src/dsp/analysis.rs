//! Offline signal measurements used to check the output contracts.

use rustfft::{num_complex::Complex, FftPlanner};

const HARMONICS: usize = 10;

/// Total harmonic distortion of a (roughly) single-tone signal, in percent.
///
/// The fundamental is the strongest non-DC bin of a Hann-windowed spectrum.
/// Power is summed over ±1 bin around the fundamental and each of the next
/// nine harmonics below Nyquist. Returns 0 for silent or too-short input.
pub fn total_harmonic_distortion(signal: &[f32]) -> f32 {
    let n = signal.len();
    if n < 16 {
        return 0.0;
    }
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);
    let mut spectrum: Vec<Complex<f32>> = signal
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let w = 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos();
            Complex::new(x * w, 0.0)
        })
        .collect();
    fft.process(&mut spectrum);

    let nyq = n / 2;
    let power: Vec<f32> = spectrum[..=nyq].iter().map(|c| c.norm_sqr()).collect();

    let mut fundamental = 0usize;
    let mut best = 0.0f32;
    for (k, &p) in power.iter().enumerate().skip(2) {
        if p > best {
            best = p;
            fundamental = k;
        }
    }
    if fundamental == 0 || best <= 0.0 {
        return 0.0;
    }

    let band_power = |center: usize| -> f32 {
        let lo = center.saturating_sub(1);
        let hi = (center + 1).min(nyq);
        power[lo..=hi].iter().sum()
    };

    let fundamental_power = band_power(fundamental);
    let mut harmonic_power = 0.0f32;
    for h in 2..=HARMONICS {
        let k = fundamental * h;
        if k + 1 > nyq {
            break;
        }
        harmonic_power += band_power(k);
    }
    100.0 * (harmonic_power / fundamental_power.max(f32::MIN_POSITIVE)).sqrt()
}

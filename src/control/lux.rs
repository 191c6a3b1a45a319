//! Scene illuminance estimate.

use serde::Deserialize;

use super::histogram::Histogram;
use super::DeviceStatus;

fn default_aperture() -> f64 {
    1.0
}

/// Exposure and brightness measured once under a known illuminance.
#[derive(Debug, Clone, Deserialize)]
pub struct LuxParams {
    /// Microseconds.
    pub reference_shutter_speed: f64,
    pub reference_gain: f64,
    #[serde(default = "default_aperture")]
    pub reference_aperture: f64,
    #[serde(rename = "reference_Y")]
    pub reference_y: f64,
    pub reference_lux: f64,
}

impl Default for LuxParams {
    fn default() -> Self {
        Self {
            reference_shutter_speed: 10_000.0,
            reference_gain: 1.0,
            reference_aperture: 1.0,
            reference_y: 12_000.0,
            reference_lux: 400.0,
        }
    }
}

/// Lux from the mean of `hist` scaled by how far the current exposure is
/// from the reference one.
pub fn estimate(params: &LuxParams, hist: &Histogram, status: &DeviceStatus, aperture: f64) -> f64 {
    if hist.total() == 0 || status.shutter_us <= 0.0 || status.analogue_gain <= 0.0 {
        return 0.0;
    }
    let current_y = hist.inter_quantile_mean(0.0, 1.0);
    let gain_ratio = params.reference_gain / status.analogue_gain;
    let shutter_ratio = params.reference_shutter_speed / status.shutter_us;
    let aperture_ratio = params.reference_aperture / aperture;
    let y_ratio = current_y * (65536.0 / hist.bins() as f64) / params.reference_y;
    shutter_ratio * gain_ratio * aperture_ratio * aperture_ratio * y_ratio * params.reference_lux
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_conditions_give_reference_lux() {
        let params = LuxParams::default();
        let mut bins = vec![0u32; 128];
        bins[46] = 500;
        let hist = Histogram::new(&bins);
        // Bin 46 centre maps to 46.5 * 512 = 23808.
        let params = LuxParams {
            reference_y: 23808.0,
            ..params
        };
        let status = DeviceStatus {
            shutter_us: params.reference_shutter_speed,
            analogue_gain: params.reference_gain,
            ..DeviceStatus::default()
        };
        let lux = estimate(&params, &hist, &status, 1.0);
        assert!((lux - params.reference_lux).abs() < 1e-9);

        let doubled = DeviceStatus {
            shutter_us: params.reference_shutter_speed * 2.0,
            ..status
        };
        let lux = estimate(&params, &hist, &doubled, 1.0);
        assert!((lux - params.reference_lux / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_histogram() {
        let hist = Histogram::new(&[0u32; 128]);
        assert_eq!(estimate(&LuxParams::default(), &hist, &DeviceStatus::default(), 1.0), 0.0);
    }

    #[test]
    fn test_reference_y_key() {
        let params: LuxParams = serde_json::from_str(
            r#"{"reference_shutter_speed": 27242, "reference_gain": 1.0,
                "reference_lux": 830, "reference_Y": 17755}"#,
        )
        .unwrap();
        assert_eq!(params.reference_y, 17755.0);
        assert_eq!(params.reference_aperture, 1.0);
    }
}

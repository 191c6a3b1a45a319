//! Per-sensor tuning files in the libcamera JSON layout.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::autofocus::AfParams;
use crate::control::agc::AgcParams;
use crate::control::alsc::AlscParams;
use crate::control::contrast::ContrastParams;
use crate::control::lux::LuxParams;
use crate::error::{Result, SetupError};

/// 16-bit black level the ISP assumes when the tuning file has none.
pub const DEFAULT_BLACK_LEVEL: u16 = 4096;

#[derive(Debug, Clone)]
pub struct Tuning {
    pub black_level: u16,
    pub lux: LuxParams,
    pub agc: Option<AgcParams>,
    pub alsc: AlscParams,
    pub contrast: Option<ContrastParams>,
    pub af: Option<AfParams>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            black_level: DEFAULT_BLACK_LEVEL,
            lux: LuxParams::default(),
            agc: None,
            alsc: AlscParams::default(),
            contrast: None,
            af: None,
        }
    }
}

impl Tuning {
    #[instrument]
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let tuning = Self::from_str(&text)?;
        info!(
            agc = tuning.agc.is_some(),
            contrast = tuning.contrast.is_some(),
            af = tuning.af.is_some(),
            black_level = tuning.black_level,
            "tuning loaded"
        );
        Ok(tuning)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(text)?;
        let algorithms = flatten(doc)?;

        let black_level = match algorithms.get("rpi.black_level") {
            Some(section) => section
                .get("black_level")
                .and_then(Value::as_u64)
                .map_or(DEFAULT_BLACK_LEVEL, |v| v.min(u64::from(u16::MAX)) as u16),
            None => DEFAULT_BLACK_LEVEL,
        };

        let agc = section::<AgcParams>(&algorithms, "rpi.agc")?;
        if let Some(agc) = &agc {
            agc.validate()?;
        }
        let alsc = section::<AlscParams>(&algorithms, "rpi.alsc")?.unwrap_or_default();
        alsc.validate()?;

        Ok(Self {
            black_level,
            lux: section(&algorithms, "rpi.lux")?.unwrap_or_default(),
            agc,
            alsc,
            contrast: section(&algorithms, "rpi.contrast")?,
            af: section(&algorithms, "rpi.af")?,
        })
    }
}

/// Algorithm name to parameters, for either file version.
fn flatten(doc: Value) -> Result<Map<String, Value>> {
    let Value::Object(mut root) = doc else {
        return Err(SetupError::Tuning("top level is not an object".into()).into());
    };
    let version = root.get("version").and_then(Value::as_f64).unwrap_or(1.0);
    if version < 2.0 {
        root.remove("version");
        return Ok(root);
    }

    let Some(Value::Array(list)) = root.remove("algorithms") else {
        return Err(SetupError::Tuning("version 2 file without an algorithms list".into()).into());
    };
    let mut out = Map::new();
    for entry in list {
        match entry {
            Value::Object(map) => out.extend(map),
            other => {
                return Err(SetupError::Tuning(format!("algorithm entry is not an object: {other}")).into())
            }
        }
    }
    debug!(algorithms = out.len(), "tuning flattened");
    Ok(out)
}

fn section<T: DeserializeOwned>(algorithms: &Map<String, Value>, name: &str) -> Result<Option<T>> {
    let Some(value) = algorithms.get(name) else {
        return Ok(None);
    };
    // Multi-channel AGC: the first channel drives the sensor.
    let value = match value.get("channels").and_then(Value::as_array) {
        Some(channels) => channels.first().unwrap_or(value),
        None => value,
    };
    T::deserialize(value)
        .map(Some)
        .map_err(|e| SetupError::Tuning(format!("{name}: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGC: &str = r#"{
        "metering_modes": {"centre-weighted": {"weights": [3,3,3,2,2,2,2,1,1,1,1,0,0,0,0]}},
        "exposure_modes": {"normal": {"shutter": [100, 10000, 30000, 60000], "gain": [1.0, 2.0, 4.0, 6.0]}},
        "constraint_modes": {"normal": [{"bound": "LOWER", "q_lo": 0.98, "q_hi": 1.0, "y_target": [0, 0.5, 1000, 0.5]}]},
        "y_target": [0, 0.16, 1000, 0.165, 10000, 0.17]
    }"#;

    #[test]
    fn test_version_two_document() {
        let text = format!(
            r#"{{"version": 2.0, "target": "bcm2835", "algorithms": [
                {{"rpi.black_level": {{"black_level": 4096}}}},
                {{"rpi.lux": {{"reference_shutter_speed": 10857, "reference_gain": 1.49,
                              "reference_aperture": 1.0, "reference_lux": 1050, "reference_Y": 13959}}}},
                {{"rpi.agc": {AGC}}},
                {{"rpi.contrast": {{"ce_enable": 1, "gamma_curve": [0, 0, 65535, 65535]}}}}
            ]}}"#
        );
        let tuning = Tuning::from_str(&text).unwrap();
        assert_eq!(tuning.black_level, 4096);
        assert_eq!(tuning.lux.reference_lux, 1050.0);
        let agc = tuning.agc.unwrap();
        assert_eq!(agc.exposure_modes["normal"].shutter.len(), 4);
        assert_eq!(tuning.contrast.unwrap().ce_enable, 1);
        assert!(tuning.af.is_none());
    }

    #[test]
    fn test_version_one_document() {
        let text = format!(r#"{{"rpi.black_level": {{"black_level": 4000}}, "rpi.agc": {AGC}}}"#);
        let tuning = Tuning::from_str(&text).unwrap();
        assert_eq!(tuning.black_level, 4000);
        assert!(tuning.agc.is_some());
        assert!(tuning.contrast.is_none());
    }

    #[test]
    fn test_agc_channels_take_first() {
        let text = format!(r#"{{"version": 2.0, "algorithms": [{{"rpi.agc": {{"channels": [{AGC}, {{}}]}}}}]}}"#);
        let tuning = Tuning::from_str(&text).unwrap();
        assert!(tuning.agc.is_some());
    }

    #[test]
    fn test_non_monotone_stage_table_fails_load() {
        let bad = AGC.replace("[100, 10000, 30000, 60000]", "[100, 30000, 10000, 60000]");
        let text = format!(r#"{{"rpi.agc": {bad}}}"#);
        assert!(Tuning::from_str(&text).is_err());
    }

    #[test]
    fn test_missing_sections_default() {
        let tuning = Tuning::from_str(r#"{"version": 2.0, "algorithms": []}"#).unwrap();
        assert_eq!(tuning.black_level, DEFAULT_BLACK_LEVEL);
        assert!(tuning.agc.is_none());
        assert!(tuning.alsc.calibrations_cr.is_empty());
    }

    #[test]
    fn test_malformed_documents() {
        assert!(Tuning::from_str("[]").is_err());
        assert!(Tuning::from_str(r#"{"version": 2.0}"#).is_err());
        assert!(Tuning::from_str(r#"{"rpi.agc": {"exposure_modes": {}}}"#).is_err());
    }
}

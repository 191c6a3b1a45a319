//! Grey-world white balance.

use crate::capture::stats::Region;

/// Red and blue gains relative to green.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColourGains {
    pub red: f64,
    pub blue: f64,
}

impl Default for ColourGains {
    fn default() -> Self {
        Self {
            red: 1.0,
            blue: 1.0,
        }
    }
}

impl ColourGains {
    /// Values for `V4L2_CID_RED_BALANCE` / `V4L2_CID_BLUE_BALANCE`, which the
    /// ISP takes in thousandths.
    pub fn to_controls(self) -> (i32, i32) {
        (
            (self.red * 1000.0).round() as i32,
            (self.blue * 1000.0).round() as i32,
        )
    }
}

/// Gains that make the summed red and blue responses match green. Returns
/// `None` when no region counted any pixels.
pub fn process(regions: &[Region]) -> Option<ColourGains> {
    let (mut r, mut g, mut b, mut counted) = (0.0, 0.0, 0.0, 0u64);
    for region in regions {
        r += region.r_sum as f64;
        g += region.g_sum as f64;
        b += region.b_sum as f64;
        counted += u64::from(region.counted);
    }
    if counted == 0 || g == 0.0 {
        return None;
    }
    Some(ColourGains {
        red: g / (r + 1.0),
        blue: g / (b + 1.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(r_sum: u64, g_sum: u64, b_sum: u64) -> Region {
        Region {
            counted: 100,
            notcounted: 0,
            r_sum,
            g_sum,
            b_sum,
        }
    }

    #[test]
    fn test_neutral_scene_is_unity() {
        let gains = process(&[region(999, 1000, 999)]).unwrap();
        assert_eq!(gains, ColourGains { red: 1.0, blue: 1.0 });
    }

    #[test]
    fn test_swapping_red_and_blue_swaps_gains() {
        let regions = [region(400, 1000, 800), region(50, 900, 10)];
        let swapped: Vec<Region> = regions
            .iter()
            .map(|r| Region {
                r_sum: r.b_sum,
                b_sum: r.r_sum,
                ..*r
            })
            .collect();
        let a = process(&regions).unwrap();
        let b = process(&swapped).unwrap();
        assert_eq!(a.red, b.blue);
        assert_eq!(a.blue, b.red);
    }

    #[test]
    fn test_empty_statistics_keep_previous_gains() {
        assert_eq!(process(&[Region::default(); 4]), None);
    }

    #[test]
    fn test_control_scaling() {
        let gains = ColourGains {
            red: 1.5,
            blue: 2.25,
        };
        assert_eq!(gains.to_controls(), (1500, 2250));
    }
}

//! Piecewise-linear functions over `f64`.

use serde::Deserialize;

use crate::error::SetupError;

/// Minimum x separation between consecutive points.
pub const EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Points sorted by strictly increasing x. Evaluation outside the domain
/// extrapolates from the end spans.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "Vec<f64>")]
pub struct Pwl {
    points: Vec<Point>,
}

impl TryFrom<Vec<f64>> for Pwl {
    type Error = SetupError;

    /// Build from a flat `[x0, y0, x1, y1, ...]` list as found in tuning files.
    fn try_from(flat: Vec<f64>) -> Result<Self, Self::Error> {
        if flat.len() % 2 != 0 {
            return Err(SetupError::Tuning(format!(
                "piecewise-linear list has odd length {}",
                flat.len()
            )));
        }
        let mut pwl = Pwl::new();
        for pair in flat.chunks_exact(2) {
            if !pwl.points.is_empty() && pair[0] <= pwl.points[pwl.points.len() - 1].x {
                return Err(SetupError::Tuning(
                    "piecewise-linear x values must be increasing".into(),
                ));
            }
            pwl.append(pair[0], pair[1]);
        }
        Ok(pwl)
    }
}

impl Pwl {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    pub fn from_points(points: &[(f64, f64)]) -> Self {
        let mut pwl = Self::new();
        for &(x, y) in points {
            pwl.append(x, y);
        }
        pwl
    }

    /// Add a point if it lies beyond the current last x.
    pub fn append(&mut self, x: f64, y: f64) {
        match self.points.last() {
            Some(last) if last.x + EPS >= x => {}
            _ => self.points.push(Point { x, y }),
        }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// `(min x, max x)`.
    pub fn domain(&self) -> (f64, f64) {
        match (self.points.first(), self.points.last()) {
            (Some(a), Some(b)) => (a.x, b.x),
            _ => (0.0, 0.0),
        }
    }

    /// Index of the span containing `x`, starting the search at `hint`.
    /// Spans are short so a linear walk is enough.
    pub fn find_span(&self, x: f64, hint: usize) -> usize {
        let last_span = self.points.len().saturating_sub(2);
        let mut span = hint.min(last_span);
        while span < last_span && x >= self.points[span + 1].x {
            span += 1;
        }
        while span > 0 && x < self.points[span].x {
            span -= 1;
        }
        span
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.eval_from(x, (self.points.len() / 2).saturating_sub(1))
    }

    /// Evaluate with a span hint, for walks that move monotonically.
    pub fn eval_from(&self, x: f64, hint: usize) -> f64 {
        match self.points.len() {
            0 => 0.0,
            1 => self.points[0].y,
            _ => {
                let i = self.find_span(x, hint);
                let (a, b) = (self.points[i], self.points[i + 1]);
                a.y + (x - a.x) * (b.y - a.y) / (b.x - a.x)
            }
        }
    }

    /// Solve `eval(x) == y` on the first span whose y range contains `y`.
    pub fn inverse_eval(&self, y: f64) -> Option<f64> {
        self.points.windows(2).find_map(|w| {
            let (a, b) = (w[0], w[1]);
            let inside = (a.y <= y && y <= b.y) || (b.y <= y && y <= a.y);
            if !inside {
                None
            } else if a.y == b.y {
                Some(a.x)
            } else {
                Some(a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y))
            }
        })
    }

    /// Call `f` on every point in order.
    pub fn map<F: FnMut(f64, f64)>(&self, mut f: F) {
        for p in &self.points {
            f(p.x, p.y);
        }
    }

    /// `other(self(x))` as a new curve. Breakpoints of both curves are kept:
    /// walk this curve's spans and add a point wherever its output crosses
    /// one of `other`'s breakpoints.
    pub fn compose(&self, other: &Pwl) -> Pwl {
        if self.points.is_empty() || other.points.len() < 2 {
            return self.clone();
        }
        let pts = &self.points;
        let opts = &other.points;

        let mut this_span = 0usize;
        let mut this_x = pts[0].x;
        let mut this_y = pts[0].y;
        let mut other_span = other.find_span(this_y, 0);
        let mut result = Pwl::new();
        result.append(this_x, other.eval_from(this_y, other_span));

        while this_span + 1 < pts.len() {
            let dx = pts[this_span + 1].x - pts[this_span].x;
            let dy = pts[this_span + 1].y - pts[this_span].y;
            if dy.abs() > EPS
                && other_span + 2 < opts.len()
                && pts[this_span + 1].y >= opts[other_span + 1].x + EPS
            {
                // Output rises into the next span of `other`.
                this_x = pts[this_span].x + (opts[other_span + 1].x - pts[this_span].y) * dx / dy;
                other_span += 1;
                this_y = opts[other_span].x;
            } else if dy.abs() > EPS
                && other_span > 0
                && pts[this_span + 1].y <= opts[other_span].x - EPS
            {
                // Output falls back into the previous span of `other`.
                this_x = pts[this_span].x + (opts[other_span].x - pts[this_span].y) * dx / dy;
                this_y = opts[other_span].x;
                other_span -= 1;
            } else {
                this_span += 1;
                this_x = pts[this_span].x;
                this_y = pts[this_span].y;
            }
            result.append(this_x, other.eval_from(this_y, other_span));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Pwl {
        Pwl::from_points(&[(0.0, 0.0), (65535.0, 65535.0)])
    }

    #[test]
    fn test_eval_interpolates_and_extrapolates() {
        let pwl = Pwl::from_points(&[(0.0, 445.0), (15.0, 925.0)]);
        assert!((pwl.eval(7.5) - 685.0).abs() < 1e-9);
        assert!((pwl.eval(-1.0) - 413.0).abs() < 1e-9);
    }

    #[test]
    fn test_inverse_eval() {
        let pwl = Pwl::from_points(&[(0.0, 445.0), (15.0, 925.0)]);
        assert!((pwl.inverse_eval(685.0).unwrap() - 7.5).abs() < 1e-9);
        assert_eq!(pwl.inverse_eval(2000.0), None);
    }

    #[test]
    fn test_append_skips_non_increasing_x() {
        let mut pwl = Pwl::new();
        pwl.append(0.0, 0.0);
        pwl.append(0.0, 5.0);
        pwl.append(1.0, 1.0);
        assert_eq!(pwl.len(), 2);
    }

    #[test]
    fn test_flat_list_parsing() {
        assert!(Pwl::try_from(vec![0.0, 1.0, 2.0]).is_err());
        assert!(Pwl::try_from(vec![1.0, 0.0, 0.5, 1.0]).is_err());
        let pwl: Pwl = serde_json::from_str("[0, 0, 1024, 5040]").unwrap();
        assert_eq!(pwl.len(), 2);
    }

    #[test]
    fn test_find_span_from_any_hint() {
        let pwl = Pwl::from_points(&[(0.0, 0.0), (1.0, 1.0), (2.0, 4.0), (3.0, 9.0)]);
        for hint in 0..4 {
            assert_eq!(pwl.find_span(2.5, hint), 2);
            assert_eq!(pwl.find_span(0.2, hint), 0);
        }
    }

    #[test]
    fn test_compose_with_identity_is_noop() {
        let gamma = Pwl::from_points(&[(0.0, 0.0), (16384.0, 30000.0), (65535.0, 65535.0)]);
        let composed = gamma.compose(&identity());
        for x in [0.0, 1000.0, 16384.0, 40000.0, 65535.0] {
            assert!((composed.eval(x) - gamma.eval(x)).abs() < 1e-6);
        }
        let composed = identity().compose(&gamma);
        for x in [0.0, 1000.0, 16384.0, 40000.0, 65535.0] {
            assert!((composed.eval(x) - gamma.eval(x)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_compose_keeps_inner_breakpoints() {
        let stretch = Pwl::from_points(&[(0.0, 0.0), (100.0, 200.0)]);
        let outer = Pwl::from_points(&[(0.0, 0.0), (50.0, 100.0), (200.0, 150.0)]);
        let composed = stretch.compose(&outer);
        // stretch(25) == 50 is where outer bends.
        assert!(composed.points().iter().any(|p| (p.x - 25.0).abs() < 1e-9));
        for x in [0.0, 10.0, 25.0, 60.0, 100.0] {
            assert!((composed.eval(x) - outer.eval(stretch.eval(x))).abs() < 1e-6);
        }
    }
}

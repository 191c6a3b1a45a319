//! Cumulative histogram with fractional-bin quantiles.

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    /// `cumulative[i]` is the count of all bins below `i`; one longer than
    /// the bin count.
    cumulative: Vec<u64>,
}

impl Histogram {
    pub fn new(bins: &[u32]) -> Self {
        let mut cumulative = Vec::with_capacity(bins.len() + 1);
        let mut total = 0u64;
        cumulative.push(0);
        for &b in bins {
            total += u64::from(b);
            cumulative.push(total);
        }
        Self { cumulative }
    }

    pub fn bins(&self) -> usize {
        self.cumulative.len() - 1
    }

    pub fn total(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    /// Cumulative count up to a fractional bin position.
    pub fn cumulative_freq(&self, bin: f64) -> f64 {
        if bin <= 0.0 {
            return 0.0;
        }
        if bin >= self.bins() as f64 {
            return self.total() as f64;
        }
        let b = bin as usize;
        let lo = self.cumulative[b] as f64;
        let hi = self.cumulative[b + 1] as f64;
        lo + (bin - b as f64) * (hi - lo)
    }

    /// Bin position below which a fraction `q` of the samples lie, searching
    /// bins `first..=last`.
    pub fn quantile_in(&self, q: f64, first: usize, last: usize) -> f64 {
        let items = (q * self.total() as f64) as u64;
        let last = last.min(self.bins() - 1);
        let (mut first, mut last) = (first.min(last), last);
        while first < last {
            let middle = (first + last) / 2;
            if self.cumulative[middle + 1] > items {
                last = middle;
            } else {
                first = middle + 1;
            }
        }
        let lo = self.cumulative[first];
        let hi = self.cumulative[first + 1];
        let frac = if hi == lo {
            0.0
        } else {
            items.saturating_sub(lo) as f64 / (hi - lo) as f64
        };
        first as f64 + frac
    }

    pub fn quantile(&self, q: f64) -> f64 {
        self.quantile_in(q, 0, self.bins() - 1)
    }

    /// Mean bin position of the samples between two fractional bins, with
    /// each bin counted at its mid-point.
    pub fn inter_bin_mean(&self, bin_lo: f64, bin_hi: f64) -> f64 {
        let mut sum_bin_freq = 0.0;
        let mut cumul_freq = 0.0;
        let mut lo = bin_lo;
        let mut next = bin_lo.floor() + 1.0;
        while next <= bin_hi.ceil() {
            let bin = lo.floor() as usize;
            let count = (self.cumulative[bin + 1] - self.cumulative[bin]) as f64;
            let freq = count * (next.min(bin_hi) - lo);
            sum_bin_freq += bin as f64 * freq;
            cumul_freq += freq;
            lo = next;
            next += 1.0;
        }
        if cumul_freq == 0.0 {
            return bin_hi;
        }
        sum_bin_freq / cumul_freq + 0.5
    }

    /// Mean bin position of the samples between two quantiles.
    pub fn inter_quantile_mean(&self, q_lo: f64, q_hi: f64) -> f64 {
        let low = self.quantile(q_lo);
        let high = self.quantile_in(q_hi, low as usize, self.bins() - 1);
        self.inter_bin_mean(low, high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spike(bin: usize, count: u32) -> Histogram {
        let mut bins = vec![0u32; 128];
        bins[bin] = count;
        Histogram::new(&bins)
    }

    #[test]
    fn test_quantile_interpolates_inside_winning_bin() {
        let hist = spike(64, 1000);
        assert!((hist.quantile(0.5) - 64.5).abs() < 1e-9);
        assert!((hist.quantile(0.0) - 64.0).abs() < 1e-9);
    }

    #[test]
    fn test_quantile_uniform() {
        let hist = Histogram::new(&[10u32; 128]);
        assert!((hist.quantile(0.25) - 32.0).abs() < 1e-9);
        assert!((hist.cumulative_freq(32.0) - 320.0).abs() < 1e-9);
    }

    #[test]
    fn test_inter_quantile_mean_of_spike_is_bin_centre() {
        let hist = spike(64, 1000);
        assert!((hist.inter_quantile_mean(0.0, 1.0) - 64.5).abs() < 1e-9);
        assert!((hist.inter_quantile_mean(0.98, 1.0) - 64.5).abs() < 1e-9);
    }

    #[test]
    fn test_inter_bin_mean_of_empty_range() {
        let hist = spike(64, 1000);
        assert_eq!(hist.inter_bin_mean(10.0, 20.0), 20.0);
    }

    #[test]
    fn test_top_quantile_band_of_last_bin() {
        let hist = spike(127, 1000);
        assert!((hist.quantile(1.0) - 128.0).abs() < 1e-9);
        assert!((hist.quantile_in(1.0, 128, 127) - 128.0).abs() < 1e-9);
        assert!((hist.inter_quantile_mean(1.0, 1.0) - 128.0).abs() < 1e-9);
        assert!((hist.inter_quantile_mean(0.5, 1.0) - 127.5).abs() < 1e-9);
    }
}

//! Mergeable quantile sketch (t-digest).
//!
//! Used by the skew-mitigation pass to estimate quantiles of key-hash
//! distributions, and exposed through `percentiles` / `percentiles_by_key`.
//! Based on "Computing Extremely Accurate Quantiles Using t-Digests"
//! (Dunning): centroids sized so the digest stays small while keeping the
//! extreme quantiles accurate.

use ordered_float::OrderedFloat;

#[derive(Clone, Copy, Debug)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// Mergeable approximate quantile estimator over `f64` samples.
#[derive(Clone, Debug)]
pub struct TDigest {
    /// Accuracy/size trade-off; larger keeps more centroids.
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<Centroid>,
    total_weight: f64,
    min: f64,
    max: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl TDigest {
    pub fn new(compression: f64) -> Self {
        Self {
            compression: compression.max(20.0),
            centroids: Vec::new(),
            buffer: Vec::new(),
            total_weight: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.total_weight += 1.0;
        self.buffer.push(Centroid {
            mean: value,
            weight: 1.0,
        });
        if self.buffer.len() > 10 * self.compression as usize {
            self.compress();
        }
    }

    pub fn merge(&mut self, other: &TDigest) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.total_weight += other.total_weight;
        self.buffer.extend(other.centroids.iter().copied());
        self.buffer.extend(other.buffer.iter().copied());
        self.compress();
    }

    pub fn count(&self) -> f64 {
        self.total_weight
    }

    /// Fold the buffered points into the centroid list.
    pub fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut points = std::mem::take(&mut self.centroids);
        points.append(&mut self.buffer);
        points.sort_by_key(|c| OrderedFloat(c.mean));

        let total: f64 = points.iter().map(|c| c.weight).sum();
        let mut merged: Vec<Centroid> = Vec::new();
        let mut cum = 0.0;
        for point in points {
            match merged.last_mut() {
                Some(last) => {
                    let q = (cum + last.weight / 2.0) / total;
                    let limit = 4.0 * total * q * (1.0 - q) / self.compression;
                    if last.weight + point.weight <= limit.max(1.0) {
                        let w = last.weight + point.weight;
                        last.mean += (point.mean - last.mean) * point.weight / w;
                        last.weight = w;
                    } else {
                        cum += last.weight;
                        merged.push(point);
                    }
                }
                None => merged.push(point),
            }
        }
        self.centroids = merged;
    }

    /// Estimate the value at quantile `q` in `[0, 1]`.
    pub fn quantile(&mut self, q: f64) -> f64 {
        self.compress();
        if self.centroids.is_empty() {
            return f64::NAN;
        }
        if q <= 0.0 {
            return self.min;
        }
        if q >= 1.0 {
            return self.max;
        }
        let target = q * self.total_weight;
        let mut cum = 0.0;
        let mut prev_mid = self.min;
        let mut prev_cum = 0.0;
        for c in &self.centroids {
            let mid = cum + c.weight / 2.0;
            if target <= mid {
                let span = mid - prev_cum;
                let frac = if span > 0.0 {
                    (target - prev_cum) / span
                } else {
                    0.0
                };
                return prev_mid + (c.mean - prev_mid) * frac;
            }
            cum += c.weight;
            prev_mid = c.mean;
            prev_cum = mid;
        }
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_of_uniform_range() {
        let mut d = TDigest::default();
        for i in 0..10_000 {
            d.add(i as f64);
        }
        let median = d.quantile(0.5);
        assert!((median - 5_000.0).abs() < 250.0, "median was {median}");
        assert_eq!(d.quantile(0.0), 0.0);
        assert_eq!(d.quantile(1.0), 9_999.0);
    }

    #[test]
    fn merged_digests_cover_both_inputs() {
        let mut a = TDigest::default();
        let mut b = TDigest::default();
        for i in 0..1_000 {
            a.add(i as f64);
            b.add(1_000.0 + i as f64);
        }
        a.merge(&b);
        assert_eq!(a.count(), 2_000.0);
        let median = a.quantile(0.5);
        assert!((median - 1_000.0).abs() < 100.0, "median was {median}");
    }
}

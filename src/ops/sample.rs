//! Deterministic per-split sampling.

use crate::dataset::{Data, Dataset};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

impl<T: Data> Dataset<T> {
    /// Sample records, deterministically for a given `seed` and split.
    ///
    /// Without replacement every record is kept with probability `frac`;
    /// with replacement the split is materialized and `ceil(n * frac)`
    /// records are drawn uniformly.
    #[track_caller]
    pub fn sample(&self, frac: f64, with_replacement: bool, seed: u64) -> Dataset<T> {
        self.derive("Sampled", move |it, idx| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(idx as u64));
            if with_replacement {
                let materialized: Result<Vec<T>, _> = it.collect();
                match materialized {
                    Err(e) => Box::new(std::iter::once(Err(e))),
                    Ok(data) => {
                        if data.is_empty() {
                            return Box::new(std::iter::empty());
                        }
                        let draws = (data.len() as f64 * frac).ceil() as usize;
                        let picks: Vec<T> = (0..draws)
                            .map(|_| data[rng.gen_range(0..data.len())].clone())
                            .collect();
                        Box::new(picks.into_iter().map(Ok))
                    }
                }
            } else {
                Box::new(it.filter(move |r| r.is_err() || rng.gen_range(0.0..1.0) <= frac))
            }
        })
    }
}

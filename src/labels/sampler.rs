use anyhow::{Context, Result, bail};
use rand::distr::{Distribution, Uniform};
use rand::rngs::SmallRng;
use rand_distr::Exp;

/// Mean of the exponential migration-rate prior.
const MRATE_MEAN: f64 = 0.1;
/// Migration rates above this are clamped; a rate of 1.0 would replace the
/// whole population every generation.
const MRATE_MAX: f64 = 0.99;

/// Mutation parameter range; a scalar input collapses to `lo == hi`.
#[derive(Debug, Clone, Copy)]
pub struct ThetaRange {
    pub lo: f64,
    pub hi: f64,
}

impl ThetaRange {
    pub fn new(a: f64, b: f64) -> Result<Self> {
        let (lo, hi) = (a.min(b), a.max(b));
        if lo <= 0.0 {
            bail!("theta must be positive, got {}..{}", lo, hi);
        }
        Ok(Self { lo, hi })
    }

    /// Accepts `"0.01"` or `"0.001:0.1"`.
    pub fn parse(text: &str) -> Result<Self> {
        let parse_one = |s: &str| {
            s.trim()
                .parse::<f64>()
                .with_context(|| format!("bad theta value {:?}", s))
        };
        match text.split_once(':') {
            Some((a, b)) => Self::new(parse_one(a)?, parse_one(b)?),
            None => {
                let v = parse_one(text)?;
                Self::new(v, v)
            }
        }
    }

    pub fn draw(&self, ntests: usize, rng: &mut SmallRng) -> Result<Vec<f64>> {
        if self.lo == self.hi {
            return Ok(vec![self.lo; ntests]);
        }
        let u = Uniform::new(self.lo, self.hi)?;
        Ok((0..ntests).map(|_| u.sample(rng)).collect())
    }
}

/// One requested admixture edge: a (source, dest) branch pair plus optional
/// fixed timing and rate. Either all three of start/end/rate are fixed, or
/// all three are sampled.
#[derive(Debug, Clone, Copy)]
pub struct EdgeSpec {
    pub source: usize,
    pub dest: usize,
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub rate: Option<f64>,
}

impl EdgeSpec {
    pub fn free(source: usize, dest: usize) -> Self {
        Self {
            source,
            dest,
            start: None,
            end: None,
            rate: None,
        }
    }
}

/// `ntests` sampled (rate, start, end) triples for one edge.
#[derive(Debug, Clone)]
pub struct EdgeDraws {
    pub rates: Vec<f64>,
    pub starts: Vec<f64>,
    pub ends: Vec<f64>,
}

/// Sample migration parameters for `spec` inside the branch-overlap window
/// `interval`. Fixed edges are validated against the window and repeated
/// across tests; free edges draw `rate ~ Exp(mean 0.1)` clamped to 0.99 and
/// a sorted uniform (start, end) pair.
pub fn draw_edge(
    spec: &EdgeSpec,
    interval: (f64, f64),
    ntests: usize,
    rng: &mut SmallRng,
) -> Result<EdgeDraws> {
    let (lo, hi) = interval;
    if let (Some(start), Some(end), Some(rate)) = (spec.start, spec.end, spec.rate) {
        if start > end || start < lo || end > hi {
            bail!(
                "fixed migration interval ({}, {}) for edge {}->{} falls outside \
                 the branch overlap ({}, {})",
                start,
                end,
                spec.source,
                spec.dest,
                lo,
                hi
            );
        }
        return Ok(EdgeDraws {
            rates: vec![rate; ntests],
            starts: vec![start; ntests],
            ends: vec![end; ntests],
        });
    }

    let exp = Exp::new(1.0 / MRATE_MEAN)?;
    let u = Uniform::new(lo, hi)?;
    let mut draws = EdgeDraws {
        rates: Vec::with_capacity(ntests),
        starts: Vec::with_capacity(ntests),
        ends: Vec::with_capacity(ntests),
    };
    for _ in 0..ntests {
        draws.rates.push(exp.sample(rng).min(MRATE_MAX));
        let (a, b) = (u.sample(rng), u.sample(rng));
        draws.starts.push(a.min(b));
        draws.ends.push(a.max(b));
    }
    Ok(draws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn theta_parses_scalar_and_range() {
        let t = ThetaRange::parse("0.01").unwrap();
        assert_eq!((t.lo, t.hi), (0.01, 0.01));
        let t = ThetaRange::parse("0.1:0.001").unwrap();
        assert_eq!((t.lo, t.hi), (0.001, 0.1));
        assert!(ThetaRange::parse("0").is_err());
        assert!(ThetaRange::parse("abc").is_err());
    }

    #[test]
    fn theta_draws_stay_in_range() {
        let mut rng = SmallRng::seed_from_u64(1);
        let t = ThetaRange::parse("0.001:0.1").unwrap();
        for v in t.draw(500, &mut rng).unwrap() {
            assert!(v >= 0.001 && v < 0.1);
        }
        // scalar range needs no RNG support
        let t = ThetaRange::parse("0.05").unwrap();
        assert!(t.draw(3, &mut rng).unwrap().iter().all(|&v| v == 0.05));
    }

    #[test]
    fn free_edges_sample_inside_the_window() {
        let mut rng = SmallRng::seed_from_u64(2);
        let spec = EdgeSpec::free(0, 1);
        let d = draw_edge(&spec, (0.5, 1.5), 300, &mut rng).unwrap();
        for i in 0..300 {
            assert!(d.rates[i] > 0.0 && d.rates[i] <= 0.99);
            assert!(d.starts[i] <= d.ends[i]);
            assert!(d.starts[i] >= 0.5 && d.ends[i] < 1.5);
        }
    }

    #[test]
    fn fixed_edges_validate_against_the_window() {
        let mut rng = SmallRng::seed_from_u64(3);
        let spec = EdgeSpec {
            source: 2,
            dest: 3,
            start: Some(0.2),
            end: Some(0.4),
            rate: Some(0.3),
        };
        let d = draw_edge(&spec, (0.0, 1.0), 4, &mut rng).unwrap();
        assert!(d.rates.iter().all(|&r| r == 0.3));
        assert!(d.starts.iter().all(|&s| s == 0.2));

        let bad = EdgeSpec {
            end: Some(1.2),
            ..spec
        };
        assert!(draw_edge(&bad, (0.0, 1.0), 4, &mut rng).is_err());
    }
}

use anyhow::{Context, Result, bail};
use ndarray::{Array1, Array2};

use crate::labels::tree::Topology;

/// One admixture pulse as stored in the label arrays: branch ids plus timing
/// in coalescent units and a backward migration rate.
#[derive(Debug, Clone, Copy)]
pub struct AdmixEdge {
    pub source: usize,
    pub dest: usize,
    pub rate: f64,
    pub tstart: f64,
    pub tend: f64,
}

/// All simulation inputs for one database row.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub theta: f64,
    pub node_heights: Vec<f64>,
    pub edges: Vec<AdmixEdge>,
    pub nsnps: usize,
}

/// The label side of a database: every sampled parameter for every row, plus
/// the metadata workers need to rebuild a demography. Count matrices live in
/// a separate pre-allocated store (see `simulate::io`).
#[derive(Debug)]
pub struct Database {
    pub tree: Topology,
    pub nsnps: usize,
    pub nedges: usize,
    pub seed: u64,
    pub thetas: Array1<f64>,
    pub admix_sources: Array2<u8>,
    pub admix_targets: Array2<u8>,
    pub admix_props: Array2<f64>,
    pub admix_tstarts: Array2<f64>,
    pub admix_tends: Array2<f64>,
    pub node_heights: Array2<f64>,
}

impl Database {
    #[inline]
    pub fn nvalues(&self) -> usize {
        self.thetas.len()
    }

    #[inline]
    pub fn ntips(&self) -> usize {
        self.tree.ntips()
    }

    #[inline]
    pub fn nquarts(&self) -> usize {
        binomial(self.ntips(), 4)
    }

    /// Row-local RNG seed, mixed splitmix64-style so neighbouring rows
    /// decorrelate and results are independent of chunk scheduling.
    #[inline]
    pub fn row_seed(&self, row: usize) -> u64 {
        let mut z = self
            .seed
            .wrapping_add((row as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    pub fn scenario(&self, row: usize) -> Scenario {
        let edges = (0..self.nedges)
            .map(|e| AdmixEdge {
                source: self.admix_sources[[row, e]] as usize,
                dest: self.admix_targets[[row, e]] as usize,
                rate: self.admix_props[[row, e]],
                tstart: self.admix_tstarts[[row, e]],
                tend: self.admix_tends[[row, e]],
            })
            .collect();
        Scenario {
            theta: self.thetas[row],
            node_heights: self.node_heights.row(row).to_vec(),
            edges,
            nsnps: self.nsnps,
        }
    }

    /// Shape sanity across the label arrays; catches stale or hand-edited
    /// stores before any simulation runs.
    pub fn validate(&self) -> Result<()> {
        let nvalues = self.nvalues();
        for (name, shape) in [
            ("admix_sources", self.admix_sources.shape()),
            ("admix_targets", self.admix_targets.shape()),
            ("admix_props", self.admix_props.shape()),
            ("admix_tstarts", self.admix_tstarts.shape()),
            ("admix_tends", self.admix_tends.shape()),
        ] {
            if shape != [nvalues, self.nedges] {
                bail!(
                    "{} has shape {:?}, expected [{}, {}]",
                    name,
                    shape,
                    nvalues,
                    self.nedges
                );
            }
        }
        let n_internal = self.tree.n_internal();
        if self.node_heights.shape() != [nvalues, n_internal] {
            bail!(
                "node_heights has shape {:?}, expected [{}, {}]",
                self.node_heights.shape(),
                nvalues,
                n_internal
            );
        }
        if self.ntips() < 4 {
            bail!("database tree has {} tips; quartets need at least 4", self.ntips());
        }
        Ok(())
    }
}

/// n choose k without overflow surprises for the small inputs seen here.
pub fn binomial(n: usize, k: usize) -> usize {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut out: u128 = 1;
    for i in 0..k {
        out = out * (n - i) as u128 / (i + 1) as u128;
    }
    out as usize
}

// ── env knobs (ADMIX_*) ──────────────────────────────────────────────────────

pub fn env_usize(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(s) if !s.trim().is_empty() => s
            .trim()
            .parse::<usize>()
            .with_context(|| format!("{} must be an integer, got {:?}", key, s)),
        _ => Ok(default),
    }
}

pub fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(s) if !s.trim().is_empty() => s
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{} must be an integer, got {:?}", key, s)),
        _ => Ok(default),
    }
}

pub fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => default.to_string(),
    }
}

pub fn env_flag(key: &str) -> bool {
    matches!(std::env::var(key).ok().as_deref(), Some("1") | Some("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binomial_matches_known_values() {
        assert_eq!(binomial(4, 4), 1);
        assert_eq!(binomial(5, 4), 5);
        assert_eq!(binomial(6, 4), 15);
        assert_eq!(binomial(10, 2), 45);
        assert_eq!(binomial(3, 4), 0);
        assert_eq!(binomial(7, 0), 1);
    }

    #[test]
    fn row_seeds_differ_between_rows_and_bases() {
        let tree = Topology::from_newick("((0,1),(2,3));").unwrap();
        let mk = |seed| Database {
            tree: tree.clone(),
            nsnps: 10,
            nedges: 0,
            seed,
            thetas: Array1::zeros(4),
            admix_sources: Array2::zeros((4, 0)),
            admix_targets: Array2::zeros((4, 0)),
            admix_props: Array2::zeros((4, 0)),
            admix_tstarts: Array2::zeros((4, 0)),
            admix_tends: Array2::zeros((4, 0)),
            node_heights: Array2::zeros((4, 3)),
        };
        let a = mk(123);
        let b = mk(124);
        assert_ne!(a.row_seed(0), a.row_seed(1));
        assert_ne!(a.row_seed(0), b.row_seed(0));
        // stable across calls
        assert_eq!(a.row_seed(3), a.row_seed(3));
    }
}

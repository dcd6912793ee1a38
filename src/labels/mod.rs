use anyhow::{Context, Result, bail};
use itertools::Itertools;
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::SmallRng;

pub mod sampler;
pub mod tree;

use sampler::{EdgeSpec, ThetaRange, draw_edge};
use tree::Topology;

use crate::simulate::types::{Database, binomial, env_string, env_u64, env_usize};

/// How branch lengths vary across sampled trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeFunction {
    /// Every sample reuses the input branch lengths.
    Fixed,
    /// Every sample jitters internal node heights (`Topology::node_slider`).
    NodeSlider,
}

impl EdgeFunction {
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "fixed" | "none" => Ok(Self::Fixed),
            "node_slider" => Ok(Self::NodeSlider),
            "poisson" => bail!("edge function 'poisson' is not supported"),
            other => bail!(
                "unknown edge function {:?} (expected 'fixed' or 'node_slider')",
                other
            ),
        }
    }
}

/// Everything that determines the size and content of a database.
#[derive(Debug, Clone, Copy)]
pub struct BuildConfig {
    pub nedges: usize,
    pub ntrees: usize,
    pub ntests: usize,
    pub nreps: usize,
    pub nsnps: usize,
    pub theta: ThetaRange,
    pub seed: u64,
    pub edge_fn: EdgeFunction,
}

impl BuildConfig {
    /// Read the ADMIX_* knobs, defaulting to the stock database dimensions.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            nedges: env_usize("ADMIX_NEDGES", 0)?,
            ntrees: env_usize("ADMIX_NTREES", 100)?,
            ntests: env_usize("ADMIX_NTESTS", 100)?,
            nreps: env_usize("ADMIX_NREPS", 100)?,
            nsnps: env_usize("ADMIX_NSNPS", 1000)?,
            theta: ThetaRange::parse(&env_string("ADMIX_THETA", "0.01"))?,
            seed: env_u64("ADMIX_SEED", 123)?,
            edge_fn: EdgeFunction::parse(&env_string("ADMIX_EDGE_FN", "fixed"))?,
        })
    }

    fn validate(&self, tree: &Topology) -> Result<()> {
        if self.ntrees == 0 || self.ntests == 0 || self.nreps == 0 || self.nsnps == 0 {
            bail!("ntrees, ntests, nreps and nsnps must all be positive");
        }
        if tree.ntips() < 4 {
            bail!(
                "tree has {} tips; quartet invariants need at least 4",
                tree.ntips()
            );
        }
        if tree.nnodes() > u8::MAX as usize {
            bail!(
                "tree has {} nodes; edge labels are stored as u8",
                tree.nnodes()
            );
        }
        Ok(())
    }
}

/// Enumerate the full labeled parameter space for `tree` under `cfg`:
/// every sampled tree x every `nedges`-subset of candidate admixture edges x
/// `ntests` parameter draws x `nreps` replicates, laid out as sequential row
/// blocks with the replicate index fastest.
///
/// Edge subsets come from the input tree so the space has a fixed size;
/// migration windows are sampled from each *sampled* tree's overlap table,
/// and a jittered tree that loses a required overlap is an error.
pub fn enumerate_labels(tree: &Topology, cfg: &BuildConfig) -> Result<Database> {
    cfg.validate(tree)?;

    let base_edges = tree.candidate_edges();
    let nevents = binomial(base_edges.len(), cfg.nedges);
    if nevents == 0 {
        bail!(
            "tree offers {} candidate admixture edges; cannot draw {} at a time",
            base_edges.len(),
            cfg.nedges
        );
    }
    let nvalues = nevents * cfg.ntrees * cfg.ntests * cfg.nreps;
    let n_internal = tree.n_internal();

    let mut thetas = Array1::<f64>::zeros(nvalues);
    let mut sources = Array2::<u8>::zeros((nvalues, cfg.nedges));
    let mut targets = Array2::<u8>::zeros((nvalues, cfg.nedges));
    let mut props = Array2::<f64>::zeros((nvalues, cfg.nedges));
    let mut tstarts = Array2::<f64>::zeros((nvalues, cfg.nedges));
    let mut tends = Array2::<f64>::zeros((nvalues, cfg.nedges));
    let mut node_heights = Array2::<f64>::zeros((nvalues, n_internal));

    let mut rng = SmallRng::seed_from_u64(cfg.seed);
    let mut row = 0usize;

    for _ in 0..cfg.ntrees {
        let itree = match cfg.edge_fn {
            EdgeFunction::Fixed => tree.clone(),
            EdgeFunction::NodeSlider => tree.node_slider(&mut rng),
        };
        let heights = itree.internal_heights();
        let intervals = itree.admixture_intervals();

        for subset in base_edges.iter().combinations(cfg.nedges) {
            let specs: Vec<EdgeSpec> = subset
                .iter()
                .map(|&&(s, d)| EdgeSpec::free(s, d))
                .collect();

            let theta_draws = cfg.theta.draw(cfg.ntests, &mut rng)?;
            let edge_draws = specs
                .iter()
                .map(|spec| {
                    let window = intervals.get(&(spec.source, spec.dest)).with_context(|| {
                        format!(
                            "branches {} and {} no longer overlap in the sampled tree",
                            spec.source, spec.dest
                        )
                    })?;
                    draw_edge(spec, *window, cfg.ntests, &mut rng)
                })
                .collect::<Result<Vec<_>>>()?;

            for test in 0..cfg.ntests {
                for _ in 0..cfg.nreps {
                    thetas[row] = theta_draws[test];
                    for (e, spec) in specs.iter().enumerate() {
                        sources[[row, e]] = spec.source as u8;
                        targets[[row, e]] = spec.dest as u8;
                        props[[row, e]] = edge_draws[e].rates[test];
                        tstarts[[row, e]] = edge_draws[e].starts[test];
                        tends[[row, e]] = edge_draws[e].ends[test];
                    }
                    for (j, &h) in heights.iter().enumerate() {
                        node_heights[[row, j]] = h;
                    }
                    row += 1;
                }
            }
        }
    }
    if row != nvalues {
        bail!("filled {} label rows, expected {}", row, nvalues);
    }

    let db = Database {
        tree: tree.clone(),
        nsnps: cfg.nsnps,
        nedges: cfg.nedges,
        seed: cfg.seed,
        thetas,
        admix_sources: sources,
        admix_targets: targets,
        admix_props: props,
        admix_tstarts: tstarts,
        admix_tends: tends,
        node_heights,
    };
    db.validate()?;
    Ok(db)
}

use anyhow::{Result, bail};
use itertools::Itertools;
use ndarray::{Array2, Array3};
use rand::distr::Distribution;
use rand::prelude::*;
use rand::rngs::SmallRng;
use rand_distr::{Exp, Poisson};

use crate::labels::tree::Topology;
use crate::simulate::types::{Scenario, binomial};

/// Fixed per-site mutation rate; theta determines Ne via `theta / mut / 4`.
pub const MUT_RATE: f64 = 1e-8;
/// Simulated locus length in sites; one segregating site is kept per locus.
pub const LOCUS_LENGTH: f64 = 1000.0;
/// Genealogy draws allowed per requested SNP before a scenario is declared
/// unable to produce polymorphism.
pub const TRIES_PER_SNP: usize = 100;

/// A demographic change, time in generations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventKind {
    /// All lineages in `source` move to `dest` (a divergence, viewed
    /// backward in time).
    Divergence { source: usize, dest: usize },
    /// Set the backward migration rate from `from` into `to`.
    RateChange { from: usize, to: usize, rate: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemographicEvent {
    pub time: f64,
    pub kind: EventKind,
}

/// Build the time-ordered event list for one scenario row.
///
/// Divergences merge each internal node's non-minimal child clades into the
/// minimal one, using the smallest leaf id under a clade as its population
/// id (lineages of an already-merged clade live in that id's population by
/// the time deeper events fire). Admixture edges toggle one migration-matrix
/// entry on at `tstart` and off at `tend`. Heights and times arrive in
/// coalescent units and are scaled by `2 Ne` here.
pub fn build_demography(tree: &Topology, scenario: &Scenario, ne: f64) -> Vec<DemographicEvent> {
    let rep = tree.representatives();
    let ntips = tree.ntips();
    let mut events = Vec::new();

    for (j, &height) in scenario.node_heights.iter().enumerate() {
        let node = ntips + j;
        let dest = rep[node];
        for &child in tree.children(node) {
            if rep[child] != dest {
                events.push(DemographicEvent {
                    time: height * 2.0 * ne,
                    kind: EventKind::Divergence {
                        source: rep[child],
                        dest,
                    },
                });
            }
        }
    }

    for edge in &scenario.edges {
        let from = rep[edge.source];
        let to = rep[edge.dest];
        debug_assert_ne!(from, to, "overlapping branches cannot share a clade");
        events.push(DemographicEvent {
            time: edge.tstart * 2.0 * ne,
            kind: EventKind::RateChange {
                from,
                to,
                rate: edge.rate,
            },
        });
        events.push(DemographicEvent {
            time: edge.tend * 2.0 * ne,
            kind: EventKind::RateChange { from, to, rate: 0.0 },
        });
    }

    events.sort_by(|a, b| a.time.total_cmp(&b.time));
    events
}

/// A binary genealogy over `ntips` sampled lineages. Leaves are `0..ntips`;
/// coalescences append nodes, so the last node is the MRCA.
struct Genealogy {
    parent: Vec<usize>,
    children: Vec<[usize; 2]>,
    times: Vec<f64>,
    ntips: usize,
}

const NO_NODE: usize = usize::MAX;

impl Genealogy {
    fn root(&self) -> usize {
        self.parent.len() - 1
    }

    fn branch_length(&self, n: usize) -> f64 {
        self.times[self.parent[n]] - self.times[n]
    }

    fn total_branch_length(&self) -> f64 {
        (0..self.root()).map(|n| self.branch_length(n)).sum()
    }

    /// Sampled leaves below `node`.
    fn leaves_under(&self, node: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if n < self.ntips {
                out.push(n);
            } else {
                stack.extend(self.children[n - self.ntips]);
            }
        }
        out
    }
}

/// Single-locus structured coalescent: one sampled lineage per tip
/// population, piecewise-constant migration, demographic events applied in
/// order. Runs the exponential race between within-population coalescence
/// (`C(k,2) / 2Ne`) and per-lineage migration until one lineage remains.
fn simulate_genealogy(
    ntips: usize,
    ne: f64,
    events: &[DemographicEvent],
    rng: &mut SmallRng,
) -> Result<Genealogy> {
    let mut g = Genealogy {
        parent: vec![NO_NODE; ntips],
        children: Vec::new(),
        times: vec![0.0; ntips],
        ntips,
    };
    // (genealogy node, current population)
    let mut active: Vec<(usize, usize)> = (0..ntips).map(|i| (i, i)).collect();
    let mut mig = vec![0.0f64; ntips * ntips];
    let mut cursor = 0usize;
    let mut t = 0.0f64;

    while active.len() > 1 {
        let mut k = vec![0usize; ntips];
        for &(_, p) in &active {
            k[p] += 1;
        }
        let coal_total: f64 = k
            .iter()
            .map(|&kp| (kp * kp.saturating_sub(1)) as f64 / 2.0 / (2.0 * ne))
            .sum();
        let row_sum: Vec<f64> = (0..ntips)
            .map(|p| mig[p * ntips..(p + 1) * ntips].iter().sum())
            .collect();
        let mig_total: f64 = active.iter().map(|&(_, p)| row_sum[p]).sum();
        let total = coal_total + mig_total;

        let next_event = events.get(cursor).map(|e| e.time);
        if total <= 0.0 {
            match next_event {
                Some(time) => {
                    t = t.max(time);
                    apply_event(&events[cursor], &mut active, &mut mig, ntips);
                    cursor += 1;
                    continue;
                }
                None => bail!(
                    "{} lineages left with no coalescence or migration possible; \
                     demography never joins all populations",
                    active.len()
                ),
            }
        }

        let wait = Exp::new(total)?.sample(rng);
        if let Some(time) = next_event {
            if t + wait >= time {
                t = time;
                apply_event(&events[cursor], &mut active, &mut mig, ntips);
                cursor += 1;
                continue;
            }
        }
        t += wait;

        if rng.random::<f64>() * total < coal_total {
            // coalescence: population prop. to C(k,2), then a uniform pair in
            // it; start from the last eligible population so float fall-through
            // still lands on one holding a pair
            let Some(mut pop) = k.iter().rposition(|&kp| kp >= 2) else {
                bail!("coalescence drawn with no population holding two lineages");
            };
            let mut u = rng.random::<f64>() * coal_total;
            for (p, &kp) in k.iter().enumerate() {
                let r = (kp * kp.saturating_sub(1)) as f64 / 2.0 / (2.0 * ne);
                if u < r {
                    pop = p;
                    break;
                }
                u -= r;
            }
            let members: Vec<usize> = active
                .iter()
                .enumerate()
                .filter(|&(_, &(_, p))| p == pop)
                .map(|(i, _)| i)
                .collect();
            let i = rng.random_range(0..members.len());
            let mut j = rng.random_range(0..members.len() - 1);
            if j >= i {
                j += 1;
            }
            let (ai, aj) = (members[i], members[j]);
            let (node_a, _) = active[ai];
            let (node_b, _) = active[aj];

            let merged = g.parent.len();
            g.parent.push(NO_NODE);
            g.parent[node_a] = merged;
            g.parent[node_b] = merged;
            g.children.push([node_a, node_b]);
            g.times.push(t);

            let (hi, lo) = (ai.max(aj), ai.min(aj));
            active.swap_remove(hi);
            active.swap_remove(lo);
            active.push((merged, pop));
        } else {
            // migration: lineage ∝ its row sum, then destination ∝ the row
            let mut u = rng.random::<f64>() * mig_total;
            let mut idx = active.len() - 1;
            for (i, &(_, p)) in active.iter().enumerate() {
                if u < row_sum[p] {
                    idx = i;
                    break;
                }
                u -= row_sum[p];
            }
            let from = active[idx].1;
            let mut v = rng.random::<f64>() * row_sum[from];
            let mut dest = from;
            for to in 0..ntips {
                let r = mig[from * ntips + to];
                if v < r {
                    dest = to;
                    break;
                }
                v -= r;
            }
            active[idx].1 = dest;
        }
    }

    Ok(g)
}

fn apply_event(
    event: &DemographicEvent,
    active: &mut [(usize, usize)],
    mig: &mut [f64],
    ntips: usize,
) {
    match event.kind {
        EventKind::Divergence { source, dest } => {
            for (_, pop) in active.iter_mut() {
                if *pop == source {
                    *pop = dest;
                }
            }
        }
        EventKind::RateChange { from, to, rate } => {
            mig[from * ntips + to] = rate;
        }
    }
}

/// Reduce one genealogy to a 4-state character row, or `None` when the locus
/// carries no mutation. The reported site is the locus's first segregating
/// site, whose branch is length-proportional; leaves below it carry a
/// derived base, everything else the ancestral base (Jukes-Cantor).
fn draw_site(g: &Genealogy, rng: &mut SmallRng) -> Result<Option<Vec<u8>>> {
    let total_len = g.total_branch_length();
    let lambda = MUT_RATE * LOCUS_LENGTH * total_len;
    if lambda <= 0.0 {
        return Ok(None);
    }
    let n_mut = Poisson::new(lambda)?.sample(rng);
    if n_mut < 1.0 {
        return Ok(None);
    }

    let mut u = rng.random::<f64>() * total_len;
    let mut branch = 0;
    for n in 0..g.root() {
        let len = g.branch_length(n);
        if u < len {
            branch = n;
            break;
        }
        u -= len;
    }

    let ancestral = rng.random_range(0..4u8);
    let derived = (ancestral + rng.random_range(1..4u8)) % 4;
    let mut row = vec![ancestral; g.ntips];
    for leaf in g.leaves_under(branch) {
        row[leaf] = derived;
    }
    Ok(Some(row))
}

/// 16x16 site-pattern counts for one quartet: site `(a, b, c, d)` increments
/// cell `(4a + b, 4c + d)`.
pub fn count_matrix(snparr: &Array2<u8>, quartet: &[usize]) -> Array2<u32> {
    let mut out = Array2::<u32>::zeros((16, 16));
    for row in snparr.rows() {
        let (a, b, c, d) = (
            row[quartet[0]] as usize,
            row[quartet[1]] as usize,
            row[quartet[2]] as usize,
            row[quartet[3]] as usize,
        );
        out[[4 * a + b, 4 * c + d]] += 1;
    }
    out
}

/// Run one database row: simulate genealogies until `nsnps` segregating
/// sites are collected, then tabulate every quartet's count matrix. Column
/// order matches tip ids, so quartet columns line up with population labels.
pub fn run_scenario(tree: &Topology, scenario: &Scenario, seed: u64) -> Result<Array3<u32>> {
    let ntips = tree.ntips();
    let nquarts = binomial(ntips, 4);
    if scenario.theta <= 0.0 {
        bail!("theta must be positive, got {}", scenario.theta);
    }
    let ne = scenario.theta / MUT_RATE / 4.0;
    let events = build_demography(tree, scenario, ne);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut snparr = Array2::<u8>::zeros((scenario.nsnps, ntips));
    let budget = TRIES_PER_SNP * scenario.nsnps;
    let mut attempts = 0usize;
    let mut filled = 0usize;
    while filled < scenario.nsnps {
        attempts += 1;
        if attempts > budget {
            bail!(
                "collected {}/{} segregating sites after {} genealogies; \
                 theta {} yields too little polymorphism",
                filled,
                scenario.nsnps,
                budget,
                scenario.theta
            );
        }
        let g = simulate_genealogy(ntips, ne, &events, &mut rng)?;
        if let Some(site) = draw_site(&g, &mut rng)? {
            for (tip, &base) in site.iter().enumerate() {
                snparr[[filled, tip]] = base;
            }
            filled += 1;
        }
    }

    let mut counts = Array3::<u32>::zeros((nquarts, 16, 16));
    for (qi, quartet) in (0..ntips).combinations(4).enumerate() {
        counts
            .index_axis_mut(ndarray::Axis(0), qi)
            .assign(&count_matrix(&snparr, &quartet));
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::types::AdmixEdge;
    use ndarray::array;

    fn balanced() -> Topology {
        Topology::from_newick("((0,1),(2,3));").unwrap()
    }

    fn scenario(theta: f64, edges: Vec<AdmixEdge>, nsnps: usize) -> Scenario {
        Scenario {
            theta,
            node_heights: vec![1.0, 1.0, 2.0],
            edges,
            nsnps,
        }
    }

    #[test]
    fn demography_sorts_divergences_by_height() {
        let tree = balanced();
        let sc = scenario(0.01, vec![], 10);
        let ne = 0.01 / MUT_RATE / 4.0;
        let events = build_demography(&tree, &sc, ne);
        assert_eq!(events.len(), 3);
        // cherries first (height 1), root join last (height 2)
        assert!(events.windows(2).all(|w| w[0].time <= w[1].time));
        assert_eq!(
            events[2].kind,
            EventKind::Divergence { source: 2, dest: 0 }
        );
        assert!((events[2].time - 2.0 * 2.0 * ne).abs() < 1e-6);
    }

    #[test]
    fn demography_interleaves_migration_toggles() {
        let tree = balanced();
        let edge = AdmixEdge {
            source: 2,
            dest: 0,
            rate: 0.2,
            tstart: 0.25,
            tend: 0.75,
        };
        let sc = scenario(0.01, vec![edge], 10);
        let ne = 0.01 / MUT_RATE / 4.0;
        let events = build_demography(&tree, &sc, ne);
        assert_eq!(events.len(), 5);
        assert_eq!(
            events[0].kind,
            EventKind::RateChange { from: 2, to: 0, rate: 0.2 }
        );
        assert_eq!(
            events[1].kind,
            EventKind::RateChange { from: 2, to: 0, rate: 0.0 }
        );
    }

    #[test]
    fn genealogies_are_ultrametric_at_the_root_and_binary() {
        let tree = balanced();
        let sc = scenario(0.01, vec![], 10);
        let ne = 0.01 / MUT_RATE / 4.0;
        let events = build_demography(&tree, &sc, ne);
        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..20 {
            let g = simulate_genealogy(4, ne, &events, &mut rng).unwrap();
            assert_eq!(g.parent.len(), 7);
            assert_eq!(g.leaves_under(g.root()), vec![0, 1, 2, 3]);
            assert!(g.total_branch_length() > 0.0);
            // parents are strictly older than children
            for n in 0..g.root() {
                assert!(g.times[g.parent[n]] > g.times[n] - 1e-12);
            }
        }
    }

    #[test]
    fn sites_are_polymorphic_four_state_rows() {
        let tree = balanced();
        let sc = scenario(0.01, vec![], 10);
        let ne = 0.01 / MUT_RATE / 4.0;
        let events = build_demography(&tree, &sc, ne);
        let mut rng = SmallRng::seed_from_u64(5);
        let mut seen = 0;
        for _ in 0..200 {
            let g = simulate_genealogy(4, ne, &events, &mut rng).unwrap();
            if let Some(site) = draw_site(&g, &mut rng).unwrap() {
                seen += 1;
                assert_eq!(site.len(), 4);
                assert!(site.iter().all(|&b| b < 4));
                assert!(
                    site.iter().any(|&b| b != site[0]),
                    "segregating site must vary"
                );
            }
        }
        assert!(seen > 0, "theta 0.01 should yield some segregating sites");
    }

    #[test]
    fn count_matrix_tallies_paired_site_codes() {
        // two sites over 4 tips: (0,1,2,3) and (3,3,0,0)
        let snps = array![[0u8, 1, 2, 3], [3, 3, 0, 0]];
        let m = count_matrix(&snps, &[0, 1, 2, 3]);
        assert_eq!(m[[1, 11]], 1); // 4*0+1, 4*2+3
        assert_eq!(m[[15, 0]], 1); // 4*3+3, 4*0+0
        assert_eq!(m.sum(), 2);
    }

    #[test]
    fn scenario_counts_sum_to_nsnps_per_quartet() {
        let tree = balanced();
        let sc = scenario(0.01, vec![], 40);
        let counts = run_scenario(&tree, &sc, 99).unwrap();
        assert_eq!(counts.shape(), &[1, 16, 16]);
        assert_eq!(counts.index_axis(ndarray::Axis(0), 0).sum(), 40);
    }

    #[test]
    fn same_seed_reproduces_counts_and_seeds_differ() {
        let tree = balanced();
        let edge = AdmixEdge {
            source: 0,
            dest: 2,
            rate: 0.3,
            tstart: 0.1,
            tend: 0.9,
        };
        let sc = scenario(0.01, vec![edge], 25);
        let a = run_scenario(&tree, &sc, 7).unwrap();
        let b = run_scenario(&tree, &sc, 7).unwrap();
        let c = run_scenario(&tree, &sc, 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unjoined_demography_is_an_error() {
        let tree = balanced();
        let ne = 0.01 / MUT_RATE / 4.0;
        let mut rng = SmallRng::seed_from_u64(1);
        // no events at all: four isolated populations can never coalesce
        assert!(simulate_genealogy(4, ne, &[], &mut rng).is_err());
        // root height below its children: the root merge fires before the
        // (3 -> 2) cherry join, stranding that lineage in pop 2
        let sc = Scenario {
            theta: 0.01,
            node_heights: vec![1.0, 1.0, 0.5],
            edges: vec![],
            nsnps: 5,
        };
        assert!(run_scenario(&tree, &sc, 3).is_err());
    }
}

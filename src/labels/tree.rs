use ahash::AHashMap;
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand::rngs::SmallRng;
use smallvec::SmallVec;

/// Sentinel parent id for the root.
pub const NO_PARENT: usize = usize::MAX;

/// Damping applied to slider bounds so jittered nodes never collide with
/// their parent or children.
const SLIDE_DAMP: f64 = 0.99;

/// A rooted species tree with branch lengths in coalescent units.
///
/// Leaves are numbered `0..ntips` (their id doubles as the simulator
/// population id); internal nodes are numbered `ntips..nnodes` in postorder,
/// so the root is always `nnodes - 1`. `dist[n]` is the length of the branch
/// above node `n` (0 for the root).
#[derive(Debug, Clone)]
pub struct Topology {
    parent: Vec<usize>,
    children: Vec<SmallVec<[usize; 2]>>,
    dist: Vec<f64>,
    ntips: usize,
    /// Original leaf labels, keyed by leaf id.
    names: AHashMap<usize, String>,
}

struct RawNode {
    children: Vec<usize>,
    dist: f64,
    name: Option<String>,
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, b: u8) -> Result<()> {
        match self.peek() {
            Some(c) if c == b => {
                self.pos += 1;
                Ok(())
            }
            other => bail!(
                "newick parse error at byte {}: expected {:?}, found {:?}",
                self.pos,
                b as char,
                other.map(|c| c as char)
            ),
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn label(&mut self) -> Option<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b'(' | b')' | b',' | b':' | b';') || c.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            None
        } else {
            Some(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
        }
    }

    fn branch_length(&mut self) -> Result<f64> {
        self.skip_ws();
        if self.peek() != Some(b':') {
            return Ok(0.0);
        }
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b'+' | b'-' | b'.' | b'e' | b'E') || c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("");
        text.parse::<f64>()
            .with_context(|| format!("bad branch length {:?} at byte {}", text, start))
    }

    fn subtree(&mut self) -> Result<usize> {
        self.skip_ws();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            let mut kids = vec![self.subtree()?];
            self.skip_ws();
            while self.peek() == Some(b',') {
                self.pos += 1;
                kids.push(self.subtree()?);
                self.skip_ws();
            }
            self.eat(b')')?;
            let name = self.label();
            let dist = self.branch_length()?;
            let id = self.nodes.len();
            self.nodes.push(RawNode {
                children: kids,
                dist,
                name,
            });
            Ok(id)
        } else {
            let name = self.label();
            let dist = self.branch_length()?;
            if name.is_none() && dist == 0.0 {
                bail!("newick parse error at byte {}: empty leaf", self.pos);
            }
            let id = self.nodes.len();
            self.nodes.push(RawNode {
                children: Vec::new(),
                dist,
                name,
            });
            Ok(id)
        }
    }
}

impl Topology {
    /// Parse a newick string. Leaves are renumbered `0..ntips`; if every leaf
    /// label is already an integer in `0..ntips` those ids are kept (so an
    /// idx-labeled tree round-trips), otherwise ids follow appearance order
    /// and the original labels are retained in the name map.
    pub fn from_newick(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let mut p = Parser {
            bytes: trimmed.as_bytes(),
            pos: 0,
            nodes: Vec::new(),
        };
        let root = p.subtree()?;
        p.skip_ws();
        if p.peek() == Some(b';') {
            p.pos += 1;
        }
        p.skip_ws();
        if p.pos != p.bytes.len() {
            bail!("trailing characters after newick at byte {}", p.pos);
        }

        // Appearance order of leaves / postorder of internals.
        let mut leaves = Vec::new();
        let mut internals = Vec::new();
        fn walk(nodes: &[RawNode], id: usize, leaves: &mut Vec<usize>, internals: &mut Vec<usize>) {
            if nodes[id].children.is_empty() {
                leaves.push(id);
            } else {
                for &c in &nodes[id].children {
                    walk(nodes, c, leaves, internals);
                }
                internals.push(id);
            }
        }
        walk(&p.nodes, root, &mut leaves, &mut internals);

        let ntips = leaves.len();
        if ntips < 2 {
            bail!("tree must have at least 2 tips, found {}", ntips);
        }

        // Keep integer leaf labels when they form exactly 0..ntips.
        let explicit: Option<Vec<usize>> = {
            let parsed: Vec<Option<usize>> = leaves
                .iter()
                .map(|&l| p.nodes[l].name.as_deref().and_then(|s| s.parse().ok()))
                .collect();
            if parsed.iter().all(|x| x.is_some_and(|v| v < ntips)) {
                let mut seen = vec![false; ntips];
                let ids: Vec<usize> = parsed.into_iter().map(|x| x.unwrap()).collect();
                ids.iter().for_each(|&i| seen[i] = true);
                seen.iter().all(|&s| s).then_some(ids)
            } else {
                None
            }
        };

        let nnodes = p.nodes.len();
        let mut remap = vec![0usize; nnodes];
        for (slot, &raw) in leaves.iter().enumerate() {
            remap[raw] = match &explicit {
                Some(ids) => ids[slot],
                None => slot,
            };
        }
        for (slot, &raw) in internals.iter().enumerate() {
            remap[raw] = ntips + slot;
        }

        let mut parent = vec![NO_PARENT; nnodes];
        let mut children = vec![SmallVec::<[usize; 2]>::new(); nnodes];
        let mut dist = vec![0.0f64; nnodes];
        let mut names = AHashMap::new();
        for (raw, node) in p.nodes.iter().enumerate() {
            let id = remap[raw];
            dist[id] = node.dist;
            for &c in &node.children {
                parent[remap[c]] = id;
                children[id].push(remap[c]);
            }
            if node.children.is_empty() {
                if let Some(name) = &node.name {
                    names.insert(id, name.clone());
                }
            }
        }
        dist[remap[root]] = 0.0;

        Ok(Self {
            parent,
            children,
            dist,
            ntips,
            names,
        })
    }

    #[inline]
    pub fn ntips(&self) -> usize {
        self.ntips
    }

    #[inline]
    pub fn nnodes(&self) -> usize {
        self.parent.len()
    }

    #[inline]
    pub fn n_internal(&self) -> usize {
        self.nnodes() - self.ntips
    }

    #[inline]
    pub fn root(&self) -> usize {
        self.nnodes() - 1
    }

    #[inline]
    pub fn parent(&self, n: usize) -> usize {
        self.parent[n]
    }

    #[inline]
    pub fn children(&self, n: usize) -> &[usize] {
        &self.children[n]
    }

    #[inline]
    pub fn is_leaf(&self, n: usize) -> bool {
        n < self.ntips
    }

    pub fn leaf_name(&self, leaf: usize) -> Option<&str> {
        self.names.get(&leaf).map(String::as_str)
    }

    /// Node heights above the leaves: 0 at leaves, `max(child height + child
    /// branch)` at internals. Assumes an ultrametric input.
    pub fn heights(&self) -> Vec<f64> {
        let mut h = vec![0.0f64; self.nnodes()];
        // Internal ids are postorder, so children always precede parents.
        for n in self.ntips..self.nnodes() {
            let mut best = 0.0f64;
            for &c in &self.children[n] {
                best = best.max(h[c] + self.dist[c]);
            }
            h[n] = best;
        }
        h
    }

    /// Heights of internal nodes only, indexed `node - ntips`.
    pub fn internal_heights(&self) -> Vec<f64> {
        self.heights().split_off(self.ntips)
    }

    pub fn height(&self) -> f64 {
        self.heights()[self.root()]
    }

    /// Smallest leaf id in each node's subtree. After a clade's divergence
    /// events have run, this is the population id that carries its lineages.
    pub fn representatives(&self) -> Vec<usize> {
        let mut rep = vec![usize::MAX; self.nnodes()];
        for n in 0..self.nnodes() {
            if self.is_leaf(n) {
                rep[n] = n;
            } else {
                rep[n] = self.children[n].iter().map(|&c| rep[c]).min().unwrap();
            }
        }
        rep
    }

    /// Every ordered pair of non-root branches whose time intervals overlap,
    /// mapped to the overlap window. A branch's interval runs from its node's
    /// height to its parent's height.
    pub fn admixture_intervals(&self) -> AHashMap<(usize, usize), (f64, f64)> {
        let h = self.heights();
        let root = self.root();
        let mut out = AHashMap::new();
        for s in 0..self.nnodes() {
            if s == root {
                continue;
            }
            let (smin, smax) = (h[s], h[self.parent[s]]);
            for d in 0..self.nnodes() {
                if d == root || d == s {
                    continue;
                }
                let (dmin, dmax) = (h[d], h[self.parent[d]]);
                let lo = smin.max(dmin);
                let hi = smax.min(dmax);
                if hi > lo {
                    out.insert((s, d), (lo, hi));
                }
            }
        }
        out
    }

    /// The overlap table as a deterministically ordered edge list.
    pub fn candidate_edges(&self) -> Vec<(usize, usize)> {
        let mut edges: Vec<(usize, usize)> = self.admixture_intervals().into_keys().collect();
        edges.sort_unstable();
        edges
    }

    /// Copy with internal node heights jittered uniformly between the highest
    /// child and the parent (both damped by 1%), applied root-down so each
    /// node sees its parent's already-slid height. Topology and total tree
    /// height are preserved.
    pub fn node_slider(&self, rng: &mut SmallRng) -> Self {
        let mut t = self.clone();
        for n in t.levelorder() {
            if t.is_leaf(n) || t.parent[n] == NO_PARENT {
                continue;
            }
            let h = t.heights();
            let max_child = t.children[n]
                .iter()
                .map(|&c| t.dist[c])
                .fold(0.0f64, f64::max);
            let lo = -SLIDE_DAMP * max_child;
            let hi = SLIDE_DAMP * h[t.parent[n]] - h[n];
            if hi <= lo {
                continue; // branch too short to slide
            }
            let delta = rng.random_range(lo..hi);
            for &c in t.children[n].clone().iter() {
                t.dist[c] += delta;
            }
            t.dist[n] -= delta;
        }
        t
    }

    /// Copy rescaled so the root height equals `target`.
    pub fn scale_to_height(&self, target: f64) -> Result<Self> {
        let h = self.height();
        if h <= 0.0 {
            bail!("cannot rescale a tree of height {}", h);
        }
        let mut t = self.clone();
        let f = target / h;
        for d in &mut t.dist {
            *d *= f;
        }
        Ok(t)
    }

    /// Nodes in breadth-first order from the root.
    pub fn levelorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nnodes());
        let mut queue = std::collections::VecDeque::from([self.root()]);
        while let Some(n) = queue.pop_front() {
            order.push(n);
            queue.extend(self.children[n].iter().copied());
        }
        order
    }

    /// Leaf ids under `node`, ascending.
    pub fn leaves_under(&self, node: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if self.is_leaf(n) {
                out.push(n);
            } else {
                stack.extend(self.children[n].iter().copied());
            }
        }
        out.sort_unstable();
        out
    }

    /// Topology-only newick with leaves labeled by id, e.g. `((0,1),(2,3));`.
    /// This is the form stored in the database; branch lengths travel
    /// separately as per-row internal node heights.
    pub fn to_newick(&self) -> String {
        fn rec(t: &Topology, n: usize, out: &mut String) {
            if t.is_leaf(n) {
                out.push_str(&n.to_string());
            } else {
                out.push('(');
                for (i, &c) in t.children[n].iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    rec(t, c, out);
                }
                out.push(')');
            }
        }
        let mut out = String::new();
        rec(self, self.root(), &mut out);
        out.push(';');
        out
    }
}

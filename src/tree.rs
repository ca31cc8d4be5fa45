//! Sampled tips and the post-run reconstruction of their phylogeny.
//!
//! During the run the tree only collects tips. Once the run is over the
//! reconstruction steps fill in the `children`, `coverage`, `layout` and
//! `marked` fields of the genealogy and may rewire parent pointers when the
//! tree is streamlined. Every traversal is iterative.

use crate::genealogy::{Genealogy, PhenotypeId, VirusId};
use crate::phenotype::{Phenotype, project_principal_axes};
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_distr::Bernoulli;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    io::Write,
};

/// Width of the time bins used to mark tips (in years).
const MARK_BIN: f64 = 0.1;

/// Margin added around the phenotype range.
const RANGE_MARGIN: f64 = 10.0;

/// Bounding box of the two-dimensional phenotypes in the tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

/// Phenotype change rates along trunk and side branches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MkSummary {
    pub side_branch_rate: f64,
    pub trunk_rate: f64,
    /// Ratio of the trunk rate to the side branch rate.
    pub mk_ratio: f64,
}

#[derive(Serialize, Deserialize)]
pub struct VirusTree {
    tips: Vec<VirusId>,
    root: VirusId,
}

impl VirusTree {
    /// Create an empty tree rooted at `root`.
    pub fn new(root: VirusId) -> Self {
        Self {
            tips: Vec::new(),
            root,
        }
    }

    pub fn add(&mut self, tip: VirusId) {
        self.tips.push(tip);
    }

    pub fn clear(&mut self) {
        self.tips.clear();
    }

    pub fn tips(&self) -> &[VirusId] {
        &self.tips
    }

    pub fn root(&self) -> VirusId {
        self.root
    }

    /// Number of tips sampled in `deme`.
    pub fn deme_tip_count<P: Phenotype>(&self, genealogy: &Genealogy<P>, deme: usize) -> usize {
        self.tips
            .iter()
            .filter(|&&tip| genealogy.virus(tip).deme() == deme)
            .count()
    }

    /// Subsample tips to about `samples_per_deme` per deme.
    ///
    /// Surviving tips are grouped by deme.
    pub fn prune_tips<P: Phenotype, R: Rng + ?Sized>(
        &mut self,
        genealogy: &Genealogy<P>,
        deme_count: usize,
        samples_per_deme: usize,
        rng: &mut R,
    ) -> Result<()> {
        let mut kept = Vec::new();
        for deme in 0..deme_count {
            let count = self.deme_tip_count(genealogy, deme);
            if count == 0 {
                continue;
            }
            let keep = (samples_per_deme as f64 / count as f64).min(1.0);
            let keep_dist = Bernoulli::new(keep)?;
            for &tip in &self.tips {
                if genealogy.virus(tip).deme() == deme && keep_dist.sample(rng) {
                    kept.push(tip);
                }
            }
        }
        self.tips = kept;
        Ok(())
    }

    /// Mark one random tip per time bin up to `date`, along with its ancestors.
    ///
    /// The parentless ur-virus is never marked.
    pub fn mark_tips<P: Phenotype, R: Rng + ?Sized>(
        &self,
        genealogy: &mut Genealogy<P>,
        date: f64,
        rng: &mut R,
    ) {
        let n_bins = (date / MARK_BIN).ceil() as usize;
        for i_bin in 0..n_bins {
            let from = i_bin as f64 * MARK_BIN;
            let to = (i_bin + 1) as f64 * MARK_BIN;
            let in_bin: Vec<_> = self
                .tips
                .iter()
                .copied()
                .filter(|&tip| {
                    let birth = genealogy.virus(tip).birth();
                    birth >= from && birth < to
                })
                .collect();
            let Some(&tip) = in_bin.choose(rng) else {
                continue;
            };

            let mut node = tip;
            while let Some(parent) = genealogy.parent(node) {
                genealogy.virus_mut(node).marked = true;
                node = parent;
            }
        }
    }

    /// Move the root to the most recent common ancestor of all tips.
    pub fn reroot<P: Phenotype>(&mut self, genealogy: &Genealogy<P>) -> Result<()> {
        let Some((&first, rest)) = self.tips.split_first() else {
            return Ok(());
        };
        let mut root = first;
        for &tip in rest {
            root = genealogy
                .common_ancestor(root, tip)
                .with_context(|| format!("tip {tip} does not descend from {root}"))?;
        }
        self.root = root;
        Ok(())
    }

    /// Fill the children lists and coverage of every node between the tips and the root.
    pub fn fill_backward<P: Phenotype>(&self, genealogy: &mut Genealogy<P>) {
        for &tip in &self.tips {
            let mut child = tip;
            while child != self.root {
                let Some(parent) = genealogy.parent(child) else {
                    break;
                };
                let node = genealogy.virus_mut(parent);
                node.add_child(child);
                node.coverage += 1;
                child = parent;
            }
        }
    }

    /// Nodes reachable from the root, parents before children.
    pub fn preorder<P: Phenotype>(&self, genealogy: &Genealogy<P>) -> Vec<VirusId> {
        let mut nodes = Vec::new();
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            nodes.push(node);
            stack.extend(genealogy.virus(node).children.iter().rev());
        }
        nodes
    }

    /// Number of descendants of every reachable node.
    pub fn descendant_counts<P: Phenotype>(
        &self,
        genealogy: &Genealogy<P>,
    ) -> HashMap<VirusId, usize> {
        let mut counts = HashMap::new();
        for node in self.preorder(genealogy).into_iter().rev() {
            let count = genealogy
                .virus(node)
                .children
                .iter()
                .map(|child| 1 + counts[child])
                .sum();
            counts.insert(node, count);
        }
        counts
    }

    /// Sort every children list by ascending number of descendants.
    pub fn sort_children_by_descendants<P: Phenotype>(&self, genealogy: &mut Genealogy<P>) {
        let counts = self.descendant_counts(genealogy);
        for node in self.preorder(genealogy) {
            genealogy
                .virus_mut(node)
                .children
                .sort_by_key(|child| counts[child]);
        }
    }

    /// Lay tips out in traversal order and place internal nodes at the mean of their children.
    pub fn set_layout_by_descendants<P: Phenotype>(&self, genealogy: &mut Genealogy<P>) {
        let nodes = self.preorder(genealogy);

        let mut y = 0.0;
        for &node in &nodes {
            let virus = genealogy.virus_mut(node);
            if virus.is_tip() {
                virus.layout = y;
                y += 1.0;
            }
        }

        for &node in nodes.iter().rev() {
            let children = &genealogy.virus(node).children;
            if children.is_empty() {
                continue;
            }
            let sum: f64 = children.iter().map(|&c| genealogy.virus(c).layout).sum();
            let mean = sum / children.len() as f64;
            genealogy.virus_mut(node).layout = mean;
        }
    }

    /// Splice single-child internal nodes out of every tip's path to the root.
    pub fn streamline<P: Phenotype>(&self, genealogy: &mut Genealogy<P>) {
        for &tip in &self.tips {
            let mut node = tip;
            while node != self.root {
                while self.collapse(node, genealogy) {}
                match genealogy.parent(node) {
                    Some(parent) => node = parent,
                    None => break,
                }
            }
        }
    }

    // Replace the parent of `node` by `node` in its grandparent's children.
    fn collapse<P: Phenotype>(&self, node: VirusId, genealogy: &mut Genealogy<P>) -> bool {
        let Some(parent) = genealogy.parent(node) else {
            return false;
        };
        if parent == self.root || genealogy.virus(parent).children.len() != 1 {
            return false;
        }
        let Some(grandparent) = genealogy.parent(parent) else {
            return false;
        };
        let siblings = &mut genealogy.virus_mut(grandparent).children;
        let Some(idx) = siblings.iter().position(|&c| c == parent) else {
            return false;
        };
        siblings[idx] = node;
        genealogy.set_parent(node, grandparent);
        true
    }

    // Distinct phenotypes of the reachable nodes, in traversal order.
    fn tree_phenotypes<P: Phenotype>(&self, genealogy: &Genealogy<P>) -> Vec<PhenotypeId> {
        let mut seen = HashSet::new();
        self.preorder(genealogy)
            .into_iter()
            .map(|node| genealogy.virus(node).phenotype())
            .filter(|&phenotype| seen.insert(phenotype))
            .collect()
    }

    /// Rotate the phenotypes of the tree onto their principal axes.
    ///
    /// No-op for phenotypes without two-dimensional traits.
    pub fn rotate<P: Phenotype>(&self, genealogy: &mut Genealogy<P>) {
        // Nodes sharing a phenotype each count once in the fit.
        let phenotypes: Vec<PhenotypeId> = self
            .preorder(genealogy)
            .into_iter()
            .map(|node| genealogy.virus(node).phenotype())
            .collect();
        let points: Option<Vec<_>> = phenotypes
            .iter()
            .map(|&id| genealogy.phenotype(id).traits())
            .collect();
        let Some(points) = points else {
            return;
        };

        let projected = project_principal_axes(&points);
        let mut written = HashSet::new();
        for (&id, traits) in phenotypes.iter().zip(projected) {
            if written.insert(id) {
                genealogy.phenotype_mut(id).set_traits(traits);
            }
        }
    }

    /// Mirror the first axis so that the earliest node lies left of the latest one.
    pub fn flip<P: Phenotype>(&self, genealogy: &mut Genealogy<P>) {
        let nodes = self.preorder(genealogy);
        let mut first = self.root;
        let mut last = self.root;
        for &node in &nodes {
            let birth = genealogy.virus(node).birth();
            if birth < genealogy.virus(first).birth() {
                first = node;
            }
            if birth > genealogy.virus(last).birth() {
                last = node;
            }
        }

        let first_x = genealogy
            .phenotype(genealogy.virus(first).phenotype())
            .traits();
        let last_x = genealogy
            .phenotype(genealogy.virus(last).phenotype())
            .traits();
        let (Some(first_x), Some(last_x)) = (first_x, last_x) else {
            return;
        };
        if first_x[0] <= last_x[0] {
            return;
        }

        for id in self.tree_phenotypes(genealogy) {
            let phenotype = genealogy.phenotype_mut(id);
            if let Some([x, y]) = phenotype.traits() {
                phenotype.set_traits([-x, y]);
            }
        }
    }

    /// Range of the two-dimensional traits of the tree, padded and rounded outward.
    pub fn range<P: Phenotype>(&self, genealogy: &Genealogy<P>) -> Option<Range> {
        let mut range = Range {
            x_min: 0.0,
            x_max: 0.0,
            y_min: 0.0,
            y_max: 0.0,
        };
        for node in self.preorder(genealogy) {
            let [x, y] = genealogy.phenotype(genealogy.virus(node).phenotype()).traits()?;
            range.x_min = range.x_min.min(x);
            range.x_max = range.x_max.max(x);
            range.y_min = range.y_min.min(y);
            range.y_max = range.y_max.max(y);
        }
        Some(Range {
            x_min: range.x_min.floor() - RANGE_MARGIN,
            x_max: range.x_max.ceil() + RANGE_MARGIN,
            y_min: range.y_min.floor() - RANGE_MARGIN,
            y_max: range.y_max.ceil() + RANGE_MARGIN,
        })
    }

    /// Phenotype change rates on trunk and side branches born before `date - years_from_mk`.
    pub fn mk_summary<P: Phenotype>(
        &self,
        genealogy: &Genealogy<P>,
        date: f64,
        years_from_mk: f64,
    ) -> MkSummary {
        let (mut side_mut, mut side_opp) = (0.0, 0.0);
        let (mut trunk_mut, mut trunk_opp) = (0.0, 0.0);
        for node in self.preorder(genealogy) {
            if node == self.root {
                continue;
            }
            let virus = genealogy.virus(node);
            let Some(parent) = virus.parent() else {
                continue;
            };
            if virus.birth() >= date - years_from_mk {
                continue;
            }
            let parent = genealogy.virus(parent);
            let changed = if virus.phenotype() != parent.phenotype() {
                1.0
            } else {
                0.0
            };
            let time = virus.birth() - parent.birth();
            if virus.trunk && parent.trunk {
                trunk_mut += changed;
                trunk_opp += time;
            } else if !virus.trunk && !parent.trunk {
                side_mut += changed;
                side_opp += time;
            }
        }

        let side_branch_rate = side_mut / side_opp;
        let trunk_rate = trunk_mut / trunk_opp;
        MkSummary {
            side_branch_rate,
            trunk_rate,
            mk_ratio: trunk_rate / side_branch_rate,
        }
    }

    /// Time from `node` back to its closest branching ancestor, or to the root.
    pub fn branch_length<P: Phenotype>(&self, genealogy: &Genealogy<P>, node: VirusId) -> f64 {
        let birth = genealogy.virus(node).birth();
        let Some(mut ancestor) = genealogy.parent(node) else {
            return 0.0;
        };
        while ancestor != self.root && genealogy.virus(ancestor).children.len() == 1 {
            match genealogy.parent(ancestor) {
                Some(parent) => ancestor = parent,
                None => break,
            }
        }
        birth - genealogy.virus(ancestor).birth()
    }

    /// Write the tree in Newick format, terminated by `;`.
    pub fn write_newick<P: Phenotype, W: Write>(
        &self,
        genealogy: &Genealogy<P>,
        writer: &mut W,
    ) -> Result<()> {
        let mut visited = HashSet::from([self.root]);
        let mut node = Some(self.root);
        while let Some(current) = node {
            node = self.visit_node(genealogy, current, &visited, writer)?;
            if let Some(next) = node {
                visited.insert(next);
            }
        }
        writeln!(writer, ";")?;
        Ok(())
    }

    // Write what `node` contributes to the Newick string and return the next node to visit.
    fn visit_node<P: Phenotype, W: Write>(
        &self,
        genealogy: &Genealogy<P>,
        node: VirusId,
        visited: &HashSet<VirusId>,
        writer: &mut W,
    ) -> Result<Option<VirusId>> {
        let virus = genealogy.virus(node);
        let up = if node == self.root {
            None
        } else {
            virus.parent()
        };

        let mut finished = false;
        let next = match virus.children.as_slice() {
            [] => {
                write!(writer, "{node}")?;
                finished = true;
                up
            }
            &[child] => {
                if visited.contains(&child) {
                    up
                } else {
                    Some(child)
                }
            }
            children => match children.iter().position(|c| !visited.contains(c)) {
                Some(0) => {
                    write!(writer, "(")?;
                    Some(children[0])
                }
                Some(idx) => {
                    write!(writer, ",")?;
                    Some(children[idx])
                }
                None => {
                    write!(writer, ")")?;
                    finished = true;
                    up
                }
            },
        };

        if finished && node != self.root {
            let phenotype = genealogy.phenotype(virus.phenotype());
            let length = self.branch_length(genealogy, node);
            write!(writer, "[&antigenic={{{phenotype}}}]:{length:.4}")?;
        }
        Ok(next)
    }
}

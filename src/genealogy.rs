//! Genealogy of every virus created during a run.
//!
//! Viruses live in an append-only arena and point to their parent by index.
//! Phenotypes are interned in a separate store shared by viruses and host
//! immune histories.

use crate::config::PhenotypeConfig;
use crate::phenotype::Phenotype;
use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, iter};

/// Index of a virus in the genealogy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VirusId(usize);

/// Index of a phenotype in the genealogy's phenotype store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhenotypeId(usize);

impl fmt::Display for VirusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Node of the genealogy.
///
/// Parent, phenotype, birth and deme are fixed at creation (the parent is only
/// rewired when the reconstructed tree is streamlined). The remaining fields
/// are filled in during or after the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Virus {
    parent: Option<VirusId>,
    phenotype: PhenotypeId,
    birth: f64,
    deme: usize,

    /// Seasonal fitness, zero until first computed.
    pub fitness: f64,
    /// Average risk of infection over sampled hosts.
    pub average_infection_risk: f64,
    /// Fraction of susceptible hosts in the deme.
    pub prob_susceptible: f64,
    /// Seasonality of the deme.
    pub deme_seasonality: f64,

    pub trunk: bool,
    pub marked: bool,
    /// Children in the reconstructed tree, empty until the tree is filled.
    pub children: Vec<VirusId>,
    pub layout: f64,
    /// Number of tip lineages passing through this node.
    pub coverage: u32,
}

impl Virus {
    fn new(parent: Option<VirusId>, phenotype: PhenotypeId, birth: f64, deme: usize) -> Self {
        Self {
            parent,
            phenotype,
            birth,
            deme,
            fitness: 0.0,
            average_infection_risk: 0.0,
            prob_susceptible: 0.0,
            deme_seasonality: 0.0,
            trunk: false,
            marked: false,
            children: Vec::new(),
            layout: 0.0,
            coverage: 0,
        }
    }

    pub fn parent(&self) -> Option<VirusId> {
        self.parent
    }

    pub fn phenotype(&self) -> PhenotypeId {
        self.phenotype
    }

    /// Birth date in years.
    pub fn birth(&self) -> f64 {
        self.birth
    }

    pub fn deme(&self) -> usize {
        self.deme
    }

    pub fn is_tip(&self) -> bool {
        self.children.is_empty()
    }

    /// Add a child to the reconstructed tree unless already present.
    pub fn add_child(&mut self, child: VirusId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }
}

/// Arena of viruses and store of phenotypes.
#[derive(Serialize, Deserialize)]
pub struct Genealogy<P> {
    viruses: Vec<Virus>,
    phenotypes: Vec<P>,
}

impl<P: Phenotype> Genealogy<P> {
    pub fn new() -> Self {
        Self {
            viruses: Vec::new(),
            phenotypes: Vec::new(),
        }
    }

    /// Number of viruses ever created.
    pub fn len(&self) -> usize {
        self.viruses.len()
    }

    /// Add a phenotype to the store.
    pub fn intern(&mut self, phenotype: P) -> PhenotypeId {
        self.phenotypes.push(phenotype);
        PhenotypeId(self.phenotypes.len() - 1)
    }

    pub fn phenotype(&self, id: PhenotypeId) -> &P {
        &self.phenotypes[id.0]
    }

    pub fn phenotype_mut(&mut self, id: PhenotypeId) -> &mut P {
        &mut self.phenotypes[id.0]
    }

    pub fn virus(&self, id: VirusId) -> &Virus {
        &self.viruses[id.0]
    }

    pub fn virus_mut(&mut self, id: VirusId) -> &mut Virus {
        &mut self.viruses[id.0]
    }

    pub fn parent(&self, id: VirusId) -> Option<VirusId> {
        self.viruses[id.0].parent
    }

    /// Rewire the parent of `id` (only used when collapsing the reconstructed tree).
    pub fn set_parent(&mut self, id: VirusId, parent: VirusId) {
        self.viruses[id.0].parent = Some(parent);
    }

    fn push(&mut self, virus: Virus) -> VirusId {
        self.viruses.push(virus);
        VirusId(self.viruses.len() - 1)
    }

    /// Create a parentless virus.
    pub fn seed(&mut self, phenotype: PhenotypeId, deme: usize, birth: f64) -> VirusId {
        self.push(Virus::new(None, phenotype, birth, deme))
    }

    /// Create a copy of `parent` transmitted into `deme`.
    pub fn infect(&mut self, parent: VirusId, deme: usize, birth: f64) -> VirusId {
        let phenotype = self.virus(parent).phenotype;
        self.push(Virus::new(Some(parent), phenotype, birth, deme))
    }

    /// Create a child of `parent` with a mutated phenotype.
    pub fn mutate<R: Rng + ?Sized>(
        &mut self,
        parent: VirusId,
        birth: f64,
        cfg: &PhenotypeConfig,
        rng: &mut R,
    ) -> Result<VirusId> {
        let virus = self.virus(parent);
        let deme = virus.deme;
        let phenotype = self
            .phenotype(virus.phenotype)
            .mutate(cfg, rng)
            .context("failed to mutate phenotype")?;
        let phenotype = self.intern(phenotype);
        Ok(self.push(Virus::new(Some(parent), phenotype, birth, deme)))
    }

    /// Risk that phenotype `phenotype` infects a host with `history`.
    pub fn risk_of_infection(
        &self,
        phenotype: PhenotypeId,
        history: &[PhenotypeId],
        cfg: &PhenotypeConfig,
    ) -> f64 {
        let history = history.iter().map(|&id| self.phenotype(id));
        self.phenotype(phenotype).risk_of_infection(cfg, history)
    }

    /// `id` followed by all its ancestors.
    pub fn lineage(&self, id: VirusId) -> impl Iterator<Item = VirusId> + '_ {
        iter::successors(Some(id), |&id| self.parent(id))
    }

    /// Lowest common ancestor of `a` and `b`.
    ///
    /// Both lineages are walked upward in lock-step; the first node visited
    /// twice is the common ancestor. Returns `None` if the lineages never meet.
    pub fn common_ancestor(&self, a: VirusId, b: VirusId) -> Option<VirusId> {
        if a == b {
            return Some(a);
        }

        let mut lineage_a = Some(a);
        let mut lineage_b = Some(b);
        let mut ancestry = HashSet::from([a, b]);
        while lineage_a.is_some() || lineage_b.is_some() {
            if let Some(v) = lineage_a {
                lineage_a = self.parent(v);
                match lineage_a {
                    Some(p) if !ancestry.insert(p) => return Some(p),
                    _ => {}
                }
            }
            if let Some(v) = lineage_b {
                lineage_b = self.parent(v);
                match lineage_b {
                    Some(p) if !ancestry.insert(p) => return Some(p),
                    _ => {}
                }
            }
        }
        None
    }

    /// Sum of the branch lengths from `a` and `b` to their common ancestor (in years).
    pub fn distance(&self, a: VirusId, b: VirusId) -> Result<f64> {
        let ancestor = self
            .common_ancestor(a, b)
            .with_context(|| format!("viruses {a} and {b} share no common ancestor"))?;
        let birth = self.virus(ancestor).birth;
        Ok((self.virus(a).birth - birth) + (self.virus(b).birth - birth))
    }

    pub fn antigenic_distance(&self, a: VirusId, b: VirusId) -> f64 {
        let pa = self.phenotype(self.virus(a).phenotype);
        let pb = self.phenotype(self.virus(b).phenotype);
        pa.distance(pb)
    }

    /// Whether `a` and `b` coalesce within `window` years (1.0) or not (0.0).
    ///
    /// Each lineage is walked back over its own window, starting from its own
    /// birth.
    pub fn coalescence(&self, a: VirusId, b: VirusId, window: f64) -> f64 {
        let mut ancestry = HashSet::new();

        let start = self.virus(a).birth;
        let mut lineage = a;
        let mut time = start;
        while time > start - window {
            let Some(parent) = self.parent(lineage) else {
                break;
            };
            lineage = parent;
            time = self.virus(lineage).birth;
            ancestry.insert(lineage);
        }

        let start = self.virus(b).birth;
        let mut lineage = b;
        let mut time = start;
        while time > start - window {
            let Some(parent) = self.parent(lineage) else {
                break;
            };
            lineage = parent;
            time = self.virus(lineage).birth;
            if !ancestry.insert(lineage) {
                return 1.0;
            }
        }

        0.0
    }

    /// Time from the birth of the parent to the birth of `id`, `None` for roots.
    pub fn serial_interval(&self, id: VirusId) -> Option<f64> {
        let virus = self.virus(id);
        let parent = self.virus(virus.parent?);
        Some(virus.birth - parent.birth)
    }
}

impl<P: Phenotype> Default for Genealogy<P> {
    fn default() -> Self {
        Self::new()
    }
}

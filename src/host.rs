use crate::genealogy::{PhenotypeId, VirusId};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Host individual.
///
/// Holds an optional current infection and the phenotypes it has been exposed
/// to, oldest first. Which compartment the host belongs to is tracked by its
/// population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    birth: f64,
    infection: Option<VirusId>,
    immune_history: Vec<PhenotypeId>,
}

impl Host {
    /// Create a naive host born at `birth` (in years).
    pub fn new(birth: f64) -> Self {
        Self {
            birth,
            infection: None,
            immune_history: Vec::new(),
        }
    }

    /// Create a naive host that is immune to `phenotype` with probability `prob`.
    pub fn with_initial_immunity<R: Rng + ?Sized>(
        birth: f64,
        phenotype: PhenotypeId,
        prob: f64,
        rng: &mut R,
    ) -> Self {
        let mut host = Self::new(birth);
        if rng.random_bool(prob) {
            host.immune_history.push(phenotype);
        }
        host
    }

    pub fn birth(&self) -> f64 {
        self.birth
    }

    pub fn infection(&self) -> Option<VirusId> {
        self.infection
    }

    pub fn is_infected(&self) -> bool {
        self.infection.is_some()
    }

    pub fn history(&self) -> &[PhenotypeId] {
        &self.immune_history
    }

    /// Replace the host by a newborn: no infection, no history.
    pub fn reset(&mut self, birth: f64) {
        self.birth = birth;
        self.infection = None;
        self.immune_history.clear();
    }

    pub fn infect(&mut self, virus: VirusId) {
        self.infection = Some(virus);
    }

    /// Clear the infection, remembering its phenotype.
    pub fn clear_infection(&mut self, phenotype: PhenotypeId) {
        self.immune_history.push(phenotype);
        self.infection = None;
    }

    /// Forget one random phenotype of the history (no-op if empty).
    pub fn wane_immunity<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let len = self.immune_history.len();
        if len > 0 {
            self.immune_history.remove(rng.random_range(0..len));
        }
    }
}

//! Antigenic phenotypes.
//!
//! The simulation only relies on the [`Phenotype`] trait; [`GeometricPhenotype`]
//! places viruses and immune memories in a two-dimensional antigenic space.

use crate::config::PhenotypeConfig;
use anyhow::Result;
use rand::prelude::*;
use rand_distr::Gamma;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    f64::consts::{PI, TAU},
    fmt::{self, Debug, Display},
};

/// Capabilities the epidemic and the genealogy need from a phenotype.
pub trait Phenotype: Clone + Debug + Display + Serialize + DeserializeOwned {
    /// Header names of the comma separated fields written by [`Display`].
    const COLUMNS: &'static [&'static str];

    /// One formatted value per entry of [`Phenotype::COLUMNS`].
    fn values(&self) -> Vec<String>;

    /// Return a mutated copy, leaving `self` untouched.
    fn mutate<R: Rng + ?Sized>(&self, cfg: &PhenotypeConfig, rng: &mut R) -> Result<Self>;

    /// Symmetric antigenic distance.
    fn distance(&self, other: &Self) -> f64;

    /// Probability in `[0, 1]` of infecting a host with the given immune history.
    fn risk_of_infection<'a, I>(&self, cfg: &PhenotypeConfig, history: I) -> f64
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a;

    /// Coordinates in a two-dimensional space, if the phenotype has them.
    fn traits(&self) -> Option<[f64; 2]> {
        None
    }

    /// Overwrite the two-dimensional coordinates (no-op without them).
    fn set_traits(&mut self, _traits: [f64; 2]) {}
}

/// Point in a two-dimensional antigenic space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeometricPhenotype {
    trait_a: f64,
    trait_b: f64,
}

impl GeometricPhenotype {
    pub fn new(trait_a: f64, trait_b: f64) -> Self {
        Self { trait_a, trait_b }
    }

    /// Phenotype of the seed virus.
    pub fn initial_virus() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Phenotype hosts may be immune to at the start of the run.
    pub fn initial_immunity(cfg: &PhenotypeConfig) -> Self {
        Self::new(cfg.initial_trait_a, 0.0)
    }
}

impl Phenotype for GeometricPhenotype {
    const COLUMNS: &'static [&'static str] = &["ag1", "ag2"];

    fn values(&self) -> Vec<String> {
        vec![
            format!("{:.4}", self.trait_a),
            format!("{:.4}", self.trait_b),
        ]
    }

    fn mutate<R: Rng + ?Sized>(&self, cfg: &PhenotypeConfig, rng: &mut R) -> Result<Self> {
        // Direction of the mutation.
        let theta = if cfg.mut_2d {
            rng.random_range(0.0..TAU)
        } else if rng.random_bool(0.5) {
            0.0
        } else {
            PI
        };

        // Size of the mutation, gamma distributed with the configured mean and deviation.
        let r = if cfg.fixed_step {
            cfg.mean_step
        } else {
            let shape = cfg.mean_step.powi(2) / cfg.sd_step.powi(2);
            let scale = cfg.sd_step.powi(2) / cfg.mean_step;
            Gamma::new(shape, scale)?.sample(rng)
        };

        Ok(Self::new(
            self.trait_a + r * theta.cos(),
            self.trait_b + r * theta.sin(),
        ))
    }

    fn distance(&self, other: &Self) -> f64 {
        (self.trait_a - other.trait_a).hypot(self.trait_b - other.trait_b)
    }

    fn risk_of_infection<'a, I>(&self, cfg: &PhenotypeConfig, history: I) -> f64
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a,
    {
        // Protection comes from the closest phenotype in the history.
        let closest = history
            .into_iter()
            .map(|p| self.distance(p))
            .fold(f64::INFINITY, f64::min);
        if closest.is_infinite() {
            return 1.0;
        }
        let risk = closest * cfg.smith_conversion;
        risk.max(1.0 - cfg.homologous_immunity).min(1.0)
    }

    fn traits(&self) -> Option<[f64; 2]> {
        Some([self.trait_a, self.trait_b])
    }

    fn set_traits(&mut self, traits: [f64; 2]) {
        self.trait_a = traits[0];
        self.trait_b = traits[1];
    }
}

impl Display for GeometricPhenotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4},{:.4}", self.trait_a, self.trait_b)
    }
}

/// Rotate `points` onto their principal axes.
///
/// The first output coordinate lies along the direction of maximum variance.
/// Points are rotated about the origin, not centered.
pub fn project_principal_axes(points: &[[f64; 2]]) -> Vec<[f64; 2]> {
    let n_pts = points.len();
    if n_pts < 2 {
        return points.to_vec();
    }

    let mean_x = points.iter().map(|p| p[0]).sum::<f64>() / n_pts as f64;
    let mean_y = points.iter().map(|p| p[1]).sum::<f64>() / n_pts as f64;
    let (mut cxx, mut cxy, mut cyy) = (0.0, 0.0, 0.0);
    for p in points {
        let dx = p[0] - mean_x;
        let dy = p[1] - mean_y;
        cxx += dx * dx;
        cxy += dx * dy;
        cyy += dy * dy;
    }

    // Leading eigenvector of the symmetric 2x2 covariance matrix.
    let half_trace = (cxx + cyy) / 2.0;
    let lambda = half_trace + (((cxx - cyy) / 2.0).powi(2) + cxy * cxy).sqrt();
    let (ex, ey) = if cxy.abs() > f64::EPSILON {
        let norm = (lambda - cyy).hypot(cxy);
        ((lambda - cyy) / norm, cxy / norm)
    } else if cxx >= cyy {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    };

    points
        .iter()
        .map(|p| [p[0] * ex + p[1] * ey, -p[0] * ey + p[1] * ex])
        .collect()
}

use crate::genealogy::{Genealogy, VirusId};
use crate::phenotype::Phenotype;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Genealogical and antigenic diversity of the circulating viruses.
///
/// All fields are zero when fewer than two infections are available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Diversity {
    /// Mean pairwise genealogical distance (in years).
    pub diversity: f64,
    /// Half the largest sampled pairwise distance.
    pub tmrca: f64,
    /// Coalescent time scale estimate.
    pub netau: f64,
    /// Mean serial interval (in years).
    pub serial_interval: f64,
    /// Mean pairwise antigenic distance.
    pub antigenic_diversity: f64,
}

impl Diversity {
    /// Estimate diversity from `sample_count` random pairs produced by `draw`.
    ///
    /// `window` is the coalescence window in years.
    pub fn estimate<P, R, F>(
        genealogy: &Genealogy<P>,
        sample_count: usize,
        window: f64,
        rng: &mut R,
        mut draw: F,
    ) -> Result<Self>
    where
        P: Phenotype,
        R: ?Sized,
        F: FnMut(&mut R) -> Option<VirusId>,
    {
        let mut div = Self::default();
        if sample_count == 0 {
            return Ok(div);
        }

        let mut coal_count = 0.0;
        let mut coal_opp = 0.0;
        for _ in 0..sample_count {
            let (Some(a), Some(b)) = (draw(&mut *rng), draw(&mut *rng)) else {
                continue;
            };
            let dist = genealogy.distance(a, b)?;
            div.diversity += dist;
            div.tmrca = div.tmrca.max(dist);
            div.antigenic_diversity += genealogy.antigenic_distance(a, b);
            coal_opp += window;
            coal_count += genealogy.coalescence(a, b, window);
            div.serial_interval += genealogy.serial_interval(a).unwrap_or(0.0);
        }

        let n = sample_count as f64;
        div.diversity /= n;
        div.tmrca /= 2.0;
        div.antigenic_diversity /= n;
        div.serial_interval /= n;
        div.netau = if coal_count > 0.0 {
            coal_opp / coal_count
        } else {
            0.0
        };

        Ok(div)
    }
}

use crate::diversity::Diversity;
use serde::{Deserialize, Serialize};

/// State of one deme at a print step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemeRecord {
    pub n: usize,
    pub s: usize,
    pub i: usize,
    pub r: usize,
    /// New infections since the previous print step.
    pub cases: usize,

    pub diversity: Diversity,
}

/// One trajectory row, written at every print step after the burn-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub day: f64,
    /// Day in years.
    pub date: f64,

    pub diversity: Diversity,

    pub n: usize,
    pub s: usize,
    pub i: usize,
    pub r: usize,
    pub cases: usize,

    pub demes: Vec<DemeRecord>,

    /// Set on the first record after the epidemic was restarted.
    pub restart: bool,
}

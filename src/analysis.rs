use crate::config::Config;
use crate::model::Record;
use crate::stats::{TimeSeries, TimeSeriesReport};
use anyhow::{Context, Result};
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct SeriesReport {
    pub name: String,
    pub report: TimeSeriesReport,
}

/// Observable computed from the trajectory records of a run.
pub trait Obs {
    fn update(&mut self, record: &Record);
    /// Drop everything seen so far.
    fn clear(&mut self);
    fn report(&self) -> Vec<SeriesReport>;
}

fn reports<'a, I>(series: I) -> Vec<SeriesReport>
where
    I: IntoIterator<Item = (String, &'a TimeSeries)>,
{
    series
        .into_iter()
        .map(|(name, series)| SeriesReport {
            name,
            report: series.report(),
        })
        .collect()
}

/// Global compartment sizes and incidence.
pub struct Compartments {
    n: TimeSeries,
    s: TimeSeries,
    i: TimeSeries,
    r: TimeSeries,
    cases: TimeSeries,
}

impl Compartments {
    pub fn new() -> Self {
        Self {
            n: TimeSeries::new(),
            s: TimeSeries::new(),
            i: TimeSeries::new(),
            r: TimeSeries::new(),
            cases: TimeSeries::new(),
        }
    }
}

impl Obs for Compartments {
    fn update(&mut self, record: &Record) {
        self.n.push(record.n as f64);
        self.s.push(record.s as f64);
        self.i.push(record.i as f64);
        self.r.push(record.r as f64);
        self.cases.push(record.cases as f64);
    }

    fn clear(&mut self) {
        *self = Self::new();
    }

    fn report(&self) -> Vec<SeriesReport> {
        reports([
            ("N".to_string(), &self.n),
            ("S".to_string(), &self.s),
            ("I".to_string(), &self.i),
            ("R".to_string(), &self.r),
            ("cases".to_string(), &self.cases),
        ])
    }
}

/// Genealogical and antigenic diversity of the whole population.
pub struct GlobalDiversity {
    diversity: TimeSeries,
    tmrca: TimeSeries,
    netau: TimeSeries,
    serial_interval: TimeSeries,
    antigenic_diversity: TimeSeries,
}

impl GlobalDiversity {
    pub fn new() -> Self {
        Self {
            diversity: TimeSeries::new(),
            tmrca: TimeSeries::new(),
            netau: TimeSeries::new(),
            serial_interval: TimeSeries::new(),
            antigenic_diversity: TimeSeries::new(),
        }
    }
}

impl Obs for GlobalDiversity {
    fn update(&mut self, record: &Record) {
        let div = &record.diversity;
        self.diversity.push(div.diversity);
        self.tmrca.push(div.tmrca);
        self.netau.push(div.netau);
        self.serial_interval.push(div.serial_interval);
        self.antigenic_diversity.push(div.antigenic_diversity);
    }

    fn clear(&mut self) {
        *self = Self::new();
    }

    fn report(&self) -> Vec<SeriesReport> {
        reports([
            ("diversity".to_string(), &self.diversity),
            ("tmrca".to_string(), &self.tmrca),
            ("netau".to_string(), &self.netau),
            ("serialInterval".to_string(), &self.serial_interval),
            ("antigenicDiversity".to_string(), &self.antigenic_diversity),
        ])
    }
}

/// Prevalence and diversity of each deme.
pub struct DemeStats {
    prevalence: Vec<TimeSeries>,
    diversity: Vec<TimeSeries>,
}

impl DemeStats {
    pub fn new(cfg: &Config) -> Self {
        let n_demes = cfg.deme_count();
        Self {
            prevalence: vec![TimeSeries::new(); n_demes],
            diversity: vec![TimeSeries::new(); n_demes],
        }
    }
}

impl Obs for DemeStats {
    fn update(&mut self, record: &Record) {
        let series = self.prevalence.iter_mut().zip(self.diversity.iter_mut());
        for (deme, (prevalence, diversity)) in record.demes.iter().zip(series) {
            let prevalence_frac = if deme.n > 0 {
                deme.i as f64 / deme.n as f64
            } else {
                0.0
            };
            prevalence.push(prevalence_frac);
            diversity.push(deme.diversity.diversity);
        }
    }

    fn clear(&mut self) {
        self.prevalence.iter_mut().for_each(TimeSeries::clear);
        self.diversity.iter_mut().for_each(TimeSeries::clear);
    }

    fn report(&self) -> Vec<SeriesReport> {
        let prevalence = self
            .prevalence
            .iter()
            .enumerate()
            .map(|(deme, series)| (format!("prevalence-{deme}"), series));
        let diversity = self
            .diversity
            .iter()
            .enumerate()
            .map(|(deme, series)| (format!("diversity-{deme}"), series));
        reports(prevalence.chain(diversity))
    }
}

pub struct Analyzer {
    obs_ptr_vec: Vec<Box<dyn Obs>>,
    n_records: usize,
}

impl Analyzer {
    pub fn new(cfg: &Config) -> Self {
        let obs_ptr_vec: Vec<Box<dyn Obs>> = vec![
            Box::new(Compartments::new()),
            Box::new(GlobalDiversity::new()),
            Box::new(DemeStats::new(cfg)),
        ];
        Self {
            obs_ptr_vec,
            n_records: 0,
        }
    }

    /// Feed every record of a trajectory file to the observables.
    ///
    /// A record flagged as a restart discards everything seen before it.
    pub fn add_file<P: AsRef<Path>>(&mut self, file: P) -> Result<()> {
        let file = file.as_ref();
        let bytes = fs::read(file).with_context(|| format!("failed to read {file:?}"))?;
        let mut reader = bytes.as_slice();

        while !reader.is_empty() {
            let record: Record = decode::from_read(&mut reader).context("failed to read record")?;
            self.add_record(&record);
        }
        Ok(())
    }

    pub fn add_record(&mut self, record: &Record) {
        if record.restart {
            self.n_records = 0;
            for obs in &mut self.obs_ptr_vec {
                obs.clear();
            }
        }
        self.n_records += 1;
        for obs in &mut self.obs_ptr_vec {
            obs.update(record);
        }
    }

    pub fn n_records(&self) -> usize {
        self.n_records
    }

    pub fn report(&self) -> Vec<SeriesReport> {
        self.obs_ptr_vec
            .iter()
            .flat_map(|obs| obs.report())
            .collect()
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write_named(&mut writer, &self.report()).context("failed to serialize results")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }
}

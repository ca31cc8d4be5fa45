use crate::config::{Config, DAYS_PER_YEAR};
use crate::diversity::Diversity;
use crate::genealogy::{Genealogy, PhenotypeId, VirusId};
use crate::model::{DemeRecord, Record};
use crate::output;
use crate::phenotype::Phenotype;
use crate::population::{Context as StepContext, HostPopulation};
use crate::stats::Accumulator;
use crate::tree::VirusTree;
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Time averages of the global statistics over the recorded print steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Averages {
    pub diversity: Accumulator,
    pub tmrca: Accumulator,
    pub netau: Accumulator,
    pub serial_interval: Accumulator,
    pub antigenic_diversity: Accumulator,
    pub n: Accumulator,
    pub s: Accumulator,
    pub i: Accumulator,
    pub r: Accumulator,
    pub cases: Accumulator,
}

impl Averages {
    fn add(&mut self, record: &Record) {
        self.diversity.add(record.diversity.diversity);
        self.tmrca.add(record.diversity.tmrca);
        self.netau.add(record.diversity.netau);
        self.serial_interval.add(record.diversity.serial_interval);
        self.antigenic_diversity
            .add(record.diversity.antigenic_diversity);
        self.n.add(record.n as f64);
        self.s.add(record.s as f64);
        self.i.add(record.i as f64);
        self.r.add(record.r as f64);
        self.cases.add(record.cases as f64);
    }
}

/// Multi-deme epidemic simulation.
///
/// Holds the configuration, the demes, the genealogy of every virus and the
/// random number generator, and provides methods to run, reconstruct the
/// sampled phylogeny, save, and load simulations.
#[derive(Serialize, Deserialize)]
pub struct Simulation<P> {
    cfg: Config,
    day: f64,
    demes: Vec<HostPopulation>,
    genealogy: Genealogy<P>,
    tree: VirusTree,
    ur_virus: VirusId,
    ur_immunity: PhenotypeId,
    diversity: Diversity,
    deme_diversity: Vec<Diversity>,
    averages: Averages,
    finished: bool,
    restarted: bool,
    rng: ChaCha12Rng,
}

impl<P: Phenotype> Simulation<P> {
    /// Create a simulation at its initial conditions.
    ///
    /// The ur-virus carries `virus_phenotype`; hosts may start immune to
    /// `immunity_phenotype`.
    pub fn new(cfg: Config, virus_phenotype: P, immunity_phenotype: P) -> Result<Self> {
        let rng = match cfg.model.seed {
            Some(seed) => ChaCha12Rng::seed_from_u64(seed),
            None => ChaCha12Rng::try_from_os_rng()?,
        };

        let mut genealogy = Genealogy::new();
        let ur_phenotype = genealogy.intern(virus_phenotype);
        let ur_virus = genealogy.seed(ur_phenotype, cfg.model.initial_deme, 0.0);
        let ur_immunity = genealogy.intern(immunity_phenotype);

        let n_demes = cfg.deme_count();
        let mut sim = Self {
            cfg,
            day: 0.0,
            demes: Vec::with_capacity(n_demes),
            genealogy,
            tree: VirusTree::new(ur_virus),
            ur_virus,
            ur_immunity,
            diversity: Diversity::default(),
            deme_diversity: vec![Diversity::default(); n_demes],
            averages: Averages::default(),
            finished: false,
            restarted: false,
            rng,
        };
        sim.init_demes();
        Ok(sim)
    }

    fn init_demes(&mut self) {
        let Self {
            cfg,
            day,
            demes,
            genealogy,
            tree,
            ur_virus,
            ur_immunity,
            rng,
            ..
        } = self;
        let mut ctx = StepContext {
            cfg,
            day: *day,
            genealogy,
            tree,
            rng,
            ur_immunity: *ur_immunity,
        };
        demes.clear();
        for deme in 0..cfg.deme_count() {
            demes.push(HostPopulation::new(deme, *ur_virus, &mut ctx));
        }
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn day(&self) -> f64 {
        self.day
    }

    /// Current date in years.
    pub fn date(&self) -> f64 {
        self.day / DAYS_PER_YEAR
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn demes(&self) -> &[HostPopulation] {
        &self.demes
    }

    pub fn genealogy(&self) -> &Genealogy<P> {
        &self.genealogy
    }

    pub fn tree(&self) -> &VirusTree {
        &self.tree
    }

    pub fn averages(&self) -> &Averages {
        &self.averages
    }

    pub fn diversity(&self) -> &Diversity {
        &self.diversity
    }

    pub fn n(&self) -> usize {
        self.demes.iter().map(HostPopulation::n).sum()
    }

    pub fn s(&self) -> usize {
        self.demes.iter().map(HostPopulation::s).sum()
    }

    pub fn i(&self) -> usize {
        self.demes.iter().map(HostPopulation::i).sum()
    }

    pub fn r(&self) -> usize {
        self.demes.iter().map(HostPopulation::r).sum()
    }

    pub fn cases(&self) -> usize {
        self.demes.iter().map(HostPopulation::cases).sum()
    }

    /// Advance every deme by one timestep, then let each deme receive contacts from the others.
    pub fn step_forward(&mut self) -> Result<()> {
        let Self {
            cfg,
            day,
            demes,
            genealogy,
            tree,
            ur_immunity,
            rng,
            ..
        } = self;
        let mut ctx = StepContext {
            cfg,
            day: *day,
            genealogy,
            tree,
            rng,
            ur_immunity: *ur_immunity,
        };

        for i_deme in 0..demes.len() {
            demes[i_deme]
                .step_forward(&mut ctx)
                .with_context(|| format!("failed to step deme {i_deme}"))?;
            for j_deme in 0..demes.len() {
                if i_deme == j_deme {
                    continue;
                }
                let (target, other) = pair_mut(demes, i_deme, j_deme);
                target
                    .between_deme_contact(other, &mut ctx)
                    .with_context(|| format!("failed contacts from deme {j_deme} to {i_deme}"))?;
            }
        }

        self.day += self.cfg.model.delta_t;
        Ok(())
    }

    /// Run for `days` days (or until the run ends), writing each record to `file`.
    pub fn advance<Q: AsRef<Path>>(&mut self, days: f64, file: Q) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);

        let end_day = self.cfg.model.end_day;
        let mut limit = (self.day + days).min(end_day);
        let print_step = self.cfg.output.print_step;
        let delta_t = self.cfg.model.delta_t;

        while self.day < limit {
            if self.day % print_step < delta_t {
                self.update_diversity()
                    .context("failed to update diversity")?;
                self.log_state();
                if self.day > self.cfg.model.burnin {
                    let record = self.record();
                    self.averages.add(&record);
                    encode::write(&mut writer, &record).context("failed to serialize record")?;
                }
                self.reset_cases();
            }

            if self.i() == 0 {
                if self.cfg.model.repeat_sim {
                    log::warn!("epidemic went extinct on day {:.1}, restarting", self.day);
                    self.reset();
                    limit = days.min(end_day);
                    if self.i() == 0 {
                        log::warn!("no infected hosts after restart, finishing run");
                        self.finished = true;
                        break;
                    }
                } else {
                    log::warn!("epidemic went extinct on day {:.1}", self.day);
                    self.finished = true;
                    break;
                }
            }

            self.step_forward().context("failed to step forward")?;
        }

        if self.day >= end_day {
            self.finished = true;
        }

        writer.flush().context("failed to flush writer stream")?;

        Ok(())
    }

    // Global estimate draws infections proportionally to deme prevalence.
    fn update_diversity(&mut self) -> Result<()> {
        let count = self.cfg.output.diversity_sampling_count;
        let window = self.cfg.output.netau_window / DAYS_PER_YEAR;

        let demes = &self.demes;
        self.diversity = if self.i() > 1 {
            Diversity::estimate(&self.genealogy, count, window, &mut self.rng, |rng| {
                random_infection(demes, rng)
            })?
        } else {
            Diversity::default()
        };

        for (deme, diversity) in self.demes.iter().zip(&mut self.deme_diversity) {
            *diversity = deme.diversity(&self.genealogy, &self.cfg, &mut self.rng)?;
        }
        Ok(())
    }

    fn log_state(&self) {
        let div = &self.diversity;
        log::info!(
            "day {:.0} div {:.3} tmrca {:.3} netau {:.3} serial {:.3} agdiv {:.3} N {} S {} I {} R {} cases {}",
            self.day,
            div.diversity,
            div.tmrca,
            div.netau,
            div.serial_interval,
            div.antigenic_diversity,
            self.n(),
            self.s(),
            self.i(),
            self.r(),
            self.cases(),
        );
    }

    // Snapshot of the current state; consumes the pending restart flag.
    fn record(&mut self) -> Record {
        let demes = self
            .demes
            .iter()
            .zip(&self.deme_diversity)
            .map(|(deme, &diversity)| DemeRecord {
                n: deme.n(),
                s: deme.s(),
                i: deme.i(),
                r: deme.r(),
                cases: deme.cases(),
                diversity,
            })
            .collect();
        Record {
            day: self.day,
            date: self.date(),
            diversity: self.diversity,
            n: self.n(),
            s: self.s(),
            i: self.i(),
            r: self.r(),
            cases: self.cases(),
            demes,
            restart: std::mem::take(&mut self.restarted),
        }
    }

    fn reset_cases(&mut self) {
        for deme in &mut self.demes {
            deme.reset_cases();
        }
    }

    /// Restart the epidemic from its initial conditions on day zero.
    ///
    /// The genealogy is kept; sampled tips and averages are discarded.
    pub fn reset(&mut self) {
        self.day = 0.0;
        self.diversity = Diversity::default();
        self.deme_diversity.fill(Diversity::default());
        self.tree.clear();
        self.averages = Averages::default();
        self.restarted = true;
        self.init_demes();
    }

    /// Mark the lineages of every current infection as trunk.
    pub fn make_trunk(&mut self) {
        for deme in &self.demes {
            deme.make_trunk(&mut self.genealogy);
        }
    }

    /// Reconstruct the phylogeny of the sampled tips.
    pub fn reconstruct(&mut self) -> Result<()> {
        let date = self.date();
        let samples_per_deme = self.cfg.tree.tip_samples_per_deme;

        self.tree
            .prune_tips(
                &self.genealogy,
                self.demes.len(),
                samples_per_deme,
                &mut self.rng,
            )
            .context("failed to prune tips")?;
        self.tree
            .mark_tips(&mut self.genealogy, date, &mut self.rng);
        self.tree
            .reroot(&self.genealogy)
            .context("failed to reroot tree")?;
        log::info!(
            "reconstructing tree of {} tips rooted at {}",
            self.tree.tips().len(),
            self.tree.root()
        );

        self.make_trunk();
        self.tree.fill_backward(&mut self.genealogy);
        self.tree.sort_children_by_descendants(&mut self.genealogy);
        self.tree.set_layout_by_descendants(&mut self.genealogy);
        self.tree.streamline(&mut self.genealogy);

        if self.cfg.tree.pca_samples {
            self.tree.rotate(&mut self.genealogy);
            self.tree.flip(&mut self.genealogy);
        }

        Ok(())
    }

    /// Write the summary and, unless output is reduced, the tree files into `dir`.
    pub fn write_outputs<Q: AsRef<Path>>(&self, dir: Q) -> Result<()> {
        let dir = dir.as_ref();
        let out = &self.cfg.output;

        let mk = self
            .tree
            .mk_summary(&self.genealogy, self.date(), self.cfg.tree.years_from_mk);
        write_file(dir.join("summary.tsv"), |w| {
            output::write_summary(&self.averages, self.date(), &mk, w)
        })?;

        if out.reduced_output {
            return Ok(());
        }

        write_file(dir.join("tips.csv"), |w| {
            output::write_tips(&self.tree, &self.genealogy, w)
        })?;
        write_file(dir.join("branches.tsv"), |w| {
            output::write_branches(&self.tree, &self.genealogy, w)
        })?;
        write_file(dir.join("tree.newick"), |w| {
            self.tree.write_newick(&self.genealogy, w)
        })?;
        if let Some(range) = self.tree.range(&self.genealogy) {
            write_file(dir.join("range.csv"), |w| output::write_range(&range, w))?;
        }

        if out.detailed_output {
            write_file(dir.join("hosts.txt"), |w| {
                for deme in &self.demes {
                    deme.write_hosts(&self.genealogy, w)?;
                }
                Ok(())
            })?;
        }

        Ok(())
    }

    /// Save a checkpoint of the entire simulation state.
    ///
    /// Can be used to resume the simulation later.
    pub fn save_checkpoint<Q: AsRef<Path>>(&self, file: Q) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, &self).context("failed to serialize simulation")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    /// Load a previously saved simulation checkpoint.
    pub fn load_checkpoint<Q: AsRef<Path>>(file: Q) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let sim = decode::from_read(&mut reader).context("failed to deserialize simulation")?;
        Ok(sim)
    }
}

fn write_file<Q, F>(file: Q, write: F) -> Result<()>
where
    Q: AsRef<Path>,
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let file = file.as_ref();
    let handle = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
    let mut writer = BufWriter::new(handle);
    write(&mut writer).with_context(|| format!("failed to write {file:?}"))?;
    writer.flush().context("failed to flush writer stream")?;
    log::info!("wrote {file:?}");
    Ok(())
}

// Deme `i` mutably together with deme `j` (i != j).
fn pair_mut(
    demes: &mut [HostPopulation],
    i: usize,
    j: usize,
) -> (&mut HostPopulation, &HostPopulation) {
    if i < j {
        let (head, tail) = demes.split_at_mut(j);
        (&mut head[i], &tail[0])
    } else {
        let (head, tail) = demes.split_at_mut(i);
        (&mut tail[0], &head[j])
    }
}

// Random infection with demes weighted by their number of infected hosts.
fn random_infection<R: Rng + ?Sized>(demes: &[HostPopulation], rng: &mut R) -> Option<VirusId> {
    let total: usize = demes.iter().map(HostPopulation::i).sum();
    if total == 0 {
        return None;
    }
    let mut idx = rng.random_range(0..total);
    for deme in demes {
        if idx < deme.i() {
            return deme.infecteds()[idx].infection();
        }
        idx -= deme.i();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::phenotype::tests::Strain;

    fn strain_sim(cfg: Config) -> Simulation<Strain> {
        Simulation::new(cfg, Strain(0), Strain(1000)).unwrap()
    }

    fn tmp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("antigen-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn isolated_demes_stay_uninfected() {
        let mut cfg = test_config();
        cfg.model.between_deme_pro = 0.0;
        let mut sim = strain_sim(cfg);
        for _ in 0..300 {
            sim.step_forward().unwrap();
        }
        assert!(sim.demes()[0].i() > 0);
        assert_eq!(sim.demes()[1].i(), 0);
        assert_eq!(sim.demes()[1].cases(), 0);
        assert!((sim.day() - 30.0).abs() < 1e-6);
    }

    #[test]
    fn connected_demes_exchange_infections() {
        let mut cfg = test_config();
        cfg.model.between_deme_pro = 0.5;
        let mut sim = strain_sim(cfg);
        for _ in 0..300 {
            sim.step_forward().unwrap();
        }
        assert!(sim.demes()[1].i() > 0);
    }

    #[test]
    fn same_seed_same_run() {
        let mut a = strain_sim(test_config());
        let mut b = strain_sim(test_config());
        for _ in 0..200 {
            a.step_forward().unwrap();
            b.step_forward().unwrap();
        }
        assert_eq!((a.s(), a.i(), a.r()), (b.s(), b.i(), b.r()));
        assert_eq!(a.genealogy().len(), b.genealogy().len());
    }

    #[test]
    fn global_draw_follows_prevalence() {
        let mut sim = strain_sim(test_config());
        let mut rng = ChaCha12Rng::seed_from_u64(30);
        for _ in 0..50 {
            let virus = random_infection(sim.demes(), &mut rng).unwrap();
            assert_eq!(sim.genealogy().virus(virus).deme(), 0);
        }
        sim.update_diversity().unwrap();
        assert!(sim.diversity().diversity >= 0.0);
        assert!(random_infection(&[], &mut rng).is_none());
    }

    #[test]
    fn extinction_finishes_run() {
        let mut cfg = test_config();
        cfg.model.beta = 0.0;
        cfg.model.nu = 2.0;
        let mut sim = strain_sim(cfg);
        let dir = tmp_dir("extinction");
        sim.advance(200.0, dir.join("trajectory.msgpack")).unwrap();
        assert!(sim.is_finished());
        assert_eq!(sim.i(), 0);
        assert!(sim.day() < 200.0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn extinction_restarts_in_repeat_mode() {
        let mut cfg = test_config();
        cfg.model.repeat_sim = true;
        let mut sim = strain_sim(cfg);
        sim.averages.i.add(1.0);
        // Clear every infection by recovering all hosts.
        sim.cfg.model.nu = 1000.0;
        for _ in 0..5 {
            sim.step_forward().unwrap();
        }
        assert_eq!(sim.i(), 0);
        sim.cfg.model.nu = 0.2;

        let dir = tmp_dir("restart");
        let file = dir.join("trajectory.msgpack");
        sim.advance(20.0, &file).unwrap();
        assert!(!sim.is_finished());
        assert!(sim.i() > 0);
        assert!(!sim.tree().tips().contains(&sim.ur_virus));
        assert_eq!(sim.averages().i.n_vals(), 1);

        let reader = std::fs::File::open(&file).unwrap();
        let mut reader = std::io::BufReader::new(reader);
        let record: Record = decode::from_read(&mut reader).unwrap();
        assert!(record.restart);
        assert!(record.day > 9.0 && record.day < 11.0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn restart_without_infected_finishes() {
        let mut cfg = test_config();
        cfg.model.repeat_sim = true;
        cfg.model.initial_i = 0;
        let mut sim = strain_sim(cfg);
        assert_eq!(sim.i(), 0);

        let dir = tmp_dir("empty-restart");
        sim.advance(20.0, dir.join("trajectory.msgpack")).unwrap();
        assert!(sim.is_finished());
        assert_eq!(sim.i(), 0);
        assert_eq!(sim.day(), 0.0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut sim = strain_sim(test_config());
        for _ in 0..100 {
            sim.step_forward().unwrap();
        }
        let dir = tmp_dir("checkpoint");
        let file = dir.join("checkpoint.msgpack");
        sim.save_checkpoint(&file).unwrap();
        let mut loaded: Simulation<Strain> = Simulation::load_checkpoint(&file).unwrap();

        assert_eq!(loaded.cfg(), sim.cfg());
        assert_eq!(loaded.day(), sim.day());
        assert_eq!(loaded.genealogy().len(), sim.genealogy().len());
        for _ in 0..100 {
            sim.step_forward().unwrap();
            loaded.step_forward().unwrap();
        }
        assert_eq!((loaded.s(), loaded.i()), (sim.s(), sim.i()));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn full_run_writes_outputs() {
        let mut cfg = test_config();
        cfg.model.end_day = 100.0;
        cfg.model.repeat_sim = true;
        cfg.output.detailed_output = true;
        let mut sim: Simulation<crate::phenotype::GeometricPhenotype> = Simulation::new(
            cfg,
            crate::phenotype::GeometricPhenotype::initial_virus(),
            crate::phenotype::GeometricPhenotype::initial_immunity(&test_config().phenotype),
        )
        .unwrap();
        let dir = tmp_dir("outputs");
        sim.advance(100.0, dir.join("trajectory.msgpack")).unwrap();
        assert!(sim.is_finished());
        assert!(!sim.tree().tips().is_empty());
        assert!(sim.averages().i.n_vals() > 0);

        sim.reconstruct().unwrap();
        sim.write_outputs(&dir).unwrap();
        for name in [
            "summary.tsv",
            "tips.csv",
            "branches.tsv",
            "tree.newick",
            "range.csv",
            "hosts.txt",
        ] {
            assert!(dir.join(name).is_file(), "missing {name}");
        }
        let newick = std::fs::read_to_string(dir.join("tree.newick")).unwrap();
        assert!(newick.trim_end().ends_with(';'));
        std::fs::remove_dir_all(dir).ok();
    }
}

use crate::config::{Config, DAYS_PER_YEAR};
use crate::diversity::Diversity;
use crate::genealogy::{Genealogy, PhenotypeId, VirusId};
use crate::host::Host;
use crate::phenotype::Phenotype;
use crate::tree::VirusTree;
use anyhow::{Context as _, Result};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Bernoulli, Poisson};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Shared state a population needs while stepping forward.
pub struct Context<'a, P> {
    pub cfg: &'a Config,
    /// Current simulation day.
    pub day: f64,
    pub genealogy: &'a mut Genealogy<P>,
    pub tree: &'a mut VirusTree,
    pub rng: &'a mut ChaCha12Rng,
    /// Phenotype newborn hosts may start immune to.
    pub ur_immunity: PhenotypeId,
}

impl<P> Context<'_, P> {
    /// Current date in years.
    pub fn date(&self) -> f64 {
        self.day / DAYS_PER_YEAR
    }
}

/// Hosts of a single deme split into susceptible, infected and recovered classes.
///
/// Every infected host carries an infection; susceptible and recovered hosts
/// carry none. Recovered hosts are only used in transcendental mode.
#[derive(Serialize, Deserialize)]
pub struct HostPopulation {
    deme: usize,
    susceptibles: Vec<Host>,
    infecteds: Vec<Host>,
    recovereds: Vec<Host>,
    cases: usize,
    new_contacts: usize,
    new_recoveries: usize,
}

impl HostPopulation {
    /// Build deme `deme` at its initial conditions.
    ///
    /// Initial infections descend from `ur_virus`.
    pub fn new<P: Phenotype>(deme: usize, ur_virus: VirusId, ctx: &mut Context<P>) -> Self {
        let cfg = ctx.cfg;
        let model = &cfg.model;
        let date = ctx.date();
        let ur_immunity = ctx.ur_immunity;
        let n_hosts = model.initial_ns[deme];

        let n_recovereds = if model.transcendental {
            (n_hosts as f64 * model.initial_pr_t) as usize
        } else {
            0
        };
        let n_infecteds = if deme == model.initial_deme {
            model.initial_i
        } else {
            0
        };
        let n_susceptibles = n_hosts.saturating_sub(n_recovereds + n_infecteds);

        let rng = &mut *ctx.rng;
        let mut new_host =
            || Host::with_initial_immunity(date, ur_immunity, model.initial_pr_r, &mut *rng);
        let susceptibles: Vec<_> = (0..n_susceptibles).map(|_| new_host()).collect();
        let recovereds: Vec<_> = (0..n_recovereds).map(|_| new_host()).collect();
        let mut infecteds: Vec<_> = (0..n_infecteds).map(|_| new_host()).collect();

        for host in &mut infecteds {
            host.infect(ctx.genealogy.infect(ur_virus, deme, date));
        }

        Self {
            deme,
            susceptibles,
            infecteds,
            recovereds,
            cases: 0,
            new_contacts: 0,
            new_recoveries: 0,
        }
    }

    pub fn n(&self) -> usize {
        self.s() + self.i() + self.r()
    }

    pub fn s(&self) -> usize {
        self.susceptibles.len()
    }

    pub fn i(&self) -> usize {
        self.infecteds.len()
    }

    pub fn r(&self) -> usize {
        self.recovereds.len()
    }

    pub fn cases(&self) -> usize {
        self.cases
    }

    pub fn reset_cases(&mut self) {
        self.cases = 0;
    }

    pub fn susceptibles(&self) -> &[Host] {
        &self.susceptibles
    }

    pub fn infecteds(&self) -> &[Host] {
        &self.infecteds
    }

    pub fn recovereds(&self) -> &[Host] {
        &self.recovereds
    }

    /// Fraction of susceptible hosts.
    pub fn pr_s(&self) -> f64 {
        let n = self.n();
        if n == 0 {
            return 0.0;
        }
        self.s() as f64 / n as f64
    }

    /// Infection of a random infected host.
    pub fn random_infection<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<VirusId> {
        self.infecteds.choose(rng).and_then(Host::infection)
    }

    /// Random host from any class, chosen uniformly over the whole deme.
    fn random_host<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Host> {
        let n = self.n();
        if n == 0 {
            return None;
        }
        let idx = rng.random_range(0..n);
        let (s, i) = (self.s(), self.i());
        if idx < s {
            Some(&self.susceptibles[idx])
        } else if idx < s + i {
            Some(&self.infecteds[idx - s])
        } else {
            Some(&self.recovereds[idx - s - i])
        }
    }

    fn random_host_mut<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<&mut Host> {
        let n = self.n();
        if n == 0 {
            return None;
        }
        let idx = rng.random_range(0..n);
        let (s, i) = (self.s(), self.i());
        if idx < s {
            Some(&mut self.susceptibles[idx])
        } else if idx < s + i {
            Some(&mut self.infecteds[idx - s])
        } else {
            Some(&mut self.recovereds[idx - s - i])
        }
    }

    /// Advance the deme by one timestep.
    pub fn step_forward<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        let cfg = ctx.cfg;
        let model = &cfg.model;

        // Births and deaths.
        if model.swap_demography {
            self.swap(ctx).context("failed to swap hosts")?;
        } else {
            self.grow(ctx).context("failed to add hosts")?;
            self.decline(ctx).context("failed to remove hosts")?;
        }

        // Event counts are drawn before any of them is applied.
        self.record_contacts(ctx).context("failed to draw contacts")?;
        self.record_recoveries(ctx).context("failed to draw recoveries")?;

        self.distribute_contacts(ctx).context("failed to distribute contacts")?;
        self.distribute_recoveries(ctx).context("failed to distribute recoveries")?;

        if model.transcendental {
            self.lose_immunity(ctx).context("failed to lose immunity")?;
        }
        if model.waning {
            self.wane_immunity(ctx).context("failed to wane immunity")?;
        }

        self.mutate(ctx).context("failed to mutate infections")?;
        self.sample(ctx).context("failed to sample tips")?;

        Ok(())
    }

    // Reset a Poisson number of random hosts of each class to newborn susceptibles.
    fn swap<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        let rate = ctx.cfg.model.birth_rate * ctx.cfg.model.delta_t;
        let date = ctx.date();

        let births = draw_poisson(self.s() as f64 * rate, ctx.rng)?;
        for _ in 0..births {
            if let Some(host) = self.susceptibles.choose_mut(ctx.rng) {
                host.reset(date);
            }
        }

        let births = draw_poisson(self.i() as f64 * rate, ctx.rng)?;
        for _ in 0..births {
            if let Some(mut host) = remove_random(&mut self.infecteds, ctx.rng) {
                host.reset(date);
                self.susceptibles.push(host);
            }
        }

        let births = draw_poisson(self.r() as f64 * rate, ctx.rng)?;
        for _ in 0..births {
            if let Some(mut host) = remove_random(&mut self.recovereds, ctx.rng) {
                host.reset(date);
                self.susceptibles.push(host);
            }
        }

        Ok(())
    }

    fn grow<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        let model = &ctx.cfg.model;
        let date = ctx.date();
        let births = draw_poisson(self.n() as f64 * model.birth_rate * model.delta_t, ctx.rng)?;
        for _ in 0..births {
            let host =
                Host::with_initial_immunity(date, ctx.ur_immunity, model.initial_pr_r, ctx.rng);
            self.susceptibles.push(host);
        }
        Ok(())
    }

    fn decline<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        let rate = ctx.cfg.model.death_rate * ctx.cfg.model.delta_t;
        for class in [
            &mut self.susceptibles,
            &mut self.infecteds,
            &mut self.recovereds,
        ] {
            let deaths = draw_poisson(class.len() as f64 * rate, ctx.rng)?;
            for _ in 0..deaths {
                remove_random(class, ctx.rng);
            }
        }
        Ok(())
    }

    fn record_contacts<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        let model = &ctx.cfg.model;
        let rate = self.i() as f64
            * self.pr_s()
            * model.beta
            * model.seasonality(self.deme, ctx.date())
            * model.delta_t;
        self.new_contacts = draw_poisson(rate, ctx.rng)?;
        Ok(())
    }

    fn record_recoveries<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        let model = &ctx.cfg.model;
        let rate = self.i() as f64 * model.nu * model.delta_t;
        self.new_recoveries = draw_poisson(rate, ctx.rng)?;
        Ok(())
    }

    fn distribute_contacts<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        for _ in 0..self.new_contacts {
            if self.s() == 0 || self.i() == 0 {
                continue;
            }
            let i_host = ctx.rng.random_range(0..self.i());
            let i_sus = ctx.rng.random_range(0..self.s());
            let virus = self.infecteds[i_host]
                .infection()
                .context("infected host carries no infection")?;

            self.attempt_infection(virus, i_sus, ctx)?;

            // Viruses without fitness get it on their first contact.
            if ctx.genealogy.virus(virus).fitness == 0.0 {
                self.assign_fitness(virus, ctx);
            }
        }
        Ok(())
    }

    /// Contacts between the infected hosts of `other` and the susceptibles of this deme.
    pub fn between_deme_contact<P: Phenotype>(
        &mut self,
        other: &HostPopulation,
        ctx: &mut Context<P>,
    ) -> Result<()> {
        let cfg = ctx.cfg;
        let model = &cfg.model;
        let rate = other.i() as f64
            * self.pr_s()
            * model.beta
            * model.between_deme_pro
            * model.seasonality(self.deme, ctx.date())
            * model.delta_t;
        let contacts = draw_poisson(rate, ctx.rng)?;

        for _ in 0..contacts {
            if self.s() == 0 || other.i() == 0 {
                continue;
            }
            let virus = other
                .random_infection(ctx.rng)
                .context("infected host carries no infection")?;
            let i_sus = ctx.rng.random_range(0..self.s());

            self.attempt_infection(virus, i_sus, ctx)?;

            if ctx.genealogy.virus(virus).fitness == 0.0 {
                self.assign_fitness(virus, ctx);
            }
        }
        Ok(())
    }

    // Infect susceptible `i_sus` with a copy of `donor` with its risk of infection.
    fn attempt_infection<P: Phenotype>(
        &mut self,
        donor: VirusId,
        i_sus: usize,
        ctx: &mut Context<P>,
    ) -> Result<()> {
        let phenotype = ctx.genealogy.virus(donor).phenotype();
        let history = self.susceptibles[i_sus].history();
        let risk = ctx
            .genealogy
            .risk_of_infection(phenotype, history, &ctx.cfg.phenotype);
        let success = Bernoulli::new(risk)
            .with_context(|| format!("invalid risk of infection {risk}"))?
            .sample(ctx.rng);

        if success {
            let date = ctx.date();
            let virus = ctx.genealogy.infect(donor, self.deme, date);
            let mut host = self.susceptibles.swap_remove(i_sus);
            host.infect(virus);
            self.infecteds.push(host);
            self.cases += 1;
        }
        Ok(())
    }

    fn distribute_recoveries<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        for _ in 0..self.new_recoveries {
            let Some(mut host) = remove_random(&mut self.infecteds, ctx.rng) else {
                continue;
            };
            let virus = host
                .infection()
                .context("infected host carries no infection")?;
            host.clear_infection(ctx.genealogy.virus(virus).phenotype());
            if ctx.cfg.model.transcendental {
                self.recovereds.push(host);
            } else {
                self.susceptibles.push(host);
            }
        }
        Ok(())
    }

    fn lose_immunity<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        let model = &ctx.cfg.model;
        let returns = draw_poisson(self.r() as f64 * model.immunity_loss * model.delta_t, ctx.rng)?;
        for _ in 0..returns {
            if let Some(host) = remove_random(&mut self.recovereds, ctx.rng) {
                self.susceptibles.push(host);
            }
        }
        Ok(())
    }

    fn wane_immunity<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        let model = &ctx.cfg.model;
        let wanings = draw_poisson(self.n() as f64 * model.waning_rate * model.delta_t, ctx.rng)?;
        for _ in 0..wanings {
            if let Some(host) = self.random_host_mut(ctx.rng) {
                host.wane_immunity(ctx.rng);
            }
        }
        Ok(())
    }

    // Mutations are drawn with replacement: a host may mutate twice in one step.
    fn mutate<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        let cfg = ctx.cfg;
        let model = &cfg.model;
        let mutations = draw_poisson(self.i() as f64 * model.mu * model.delta_t, ctx.rng)?;
        for _ in 0..mutations {
            if self.i() == 0 {
                continue;
            }
            let i_host = ctx.rng.random_range(0..self.i());
            let host = &mut self.infecteds[i_host];
            let virus = host
                .infection()
                .context("infected host carries no infection")?;
            let date = ctx.date();
            let mutant = ctx
                .genealogy
                .mutate(virus, date, &ctx.cfg.phenotype, ctx.rng)?;
            host.infect(mutant);
            self.assign_fitness(mutant, ctx);
        }
        Ok(())
    }

    // Sample infections as tips once the burn-in is over.
    fn sample<P: Phenotype>(&mut self, ctx: &mut Context<P>) -> Result<()> {
        let cfg = ctx.cfg;
        let tree_cfg = &cfg.tree;
        if self.i() == 0 || ctx.day < ctx.cfg.model.burnin {
            return Ok(());
        }

        let mut rate = tree_cfg.tip_sampling_rate * ctx.cfg.model.delta_t;
        if tree_cfg.tip_sampling_proportional {
            rate *= self.i() as f64;
        }
        let samples = draw_poisson(rate, ctx.rng)?;
        for _ in 0..samples {
            let Some(virus) = self.random_infection(ctx.rng) else {
                continue;
            };
            self.assign_fitness(virus, ctx);
            ctx.tree.add(virus);
        }
        Ok(())
    }

    /// Compute the fitness of `virus` against the hosts of this deme.
    fn assign_fitness<P: Phenotype>(&self, virus: VirusId, ctx: &mut Context<P>) {
        let phenotype = ctx.genealogy.virus(virus).phenotype();
        let risk = self.average_risk(phenotype, ctx);
        let prob_susceptible = self.pr_s();
        let seasonality = ctx.cfg.model.seasonality(self.deme, ctx.date());

        let virus = ctx.genealogy.virus_mut(virus);
        virus.average_infection_risk = risk;
        virus.prob_susceptible = prob_susceptible;
        virus.deme_seasonality = seasonality;
        virus.fitness = risk * prob_susceptible * seasonality;
    }

    // Average risk of infection of `phenotype` over a random sample of hosts.
    fn average_risk<P: Phenotype>(&self, phenotype: PhenotypeId, ctx: &mut Context<P>) -> f64 {
        let sample_size = ctx.cfg.model.fitness_sample_size;
        let mut risk = 0.0;
        for _ in 0..sample_size {
            if let Some(host) = self.random_host(ctx.rng) {
                risk += ctx
                    .genealogy
                    .risk_of_infection(phenotype, host.history(), &ctx.cfg.phenotype);
            }
        }
        risk / sample_size as f64
    }

    /// Mark the lineages of all current infections as trunk.
    pub fn make_trunk<P: Phenotype>(&self, genealogy: &mut Genealogy<P>) {
        for virus in self.infecteds.iter().filter_map(Host::infection) {
            genealogy.virus_mut(virus).trunk = true;
            let mut lineage = virus;
            while let Some(parent) = genealogy.parent(lineage) {
                lineage = parent;
                let node = genealogy.virus_mut(lineage);
                if node.trunk {
                    break;
                }
                node.trunk = true;
            }
        }
    }

    /// Diversity of the infections circulating in this deme.
    pub fn diversity<P: Phenotype>(
        &self,
        genealogy: &Genealogy<P>,
        cfg: &Config,
        rng: &mut ChaCha12Rng,
    ) -> Result<Diversity> {
        if self.i() <= 1 {
            return Ok(Diversity::default());
        }
        Diversity::estimate(
            genealogy,
            cfg.output.diversity_sampling_count,
            cfg.output.netau_window / DAYS_PER_YEAR,
            rng,
            |rng| self.random_infection(rng),
        )
    }

    /// Write one `deme:infection:history` line per host.
    pub fn write_hosts<P: Phenotype, W: Write>(
        &self,
        genealogy: &Genealogy<P>,
        writer: &mut W,
    ) -> Result<()> {
        for host in self
            .susceptibles
            .iter()
            .chain(&self.infecteds)
            .chain(&self.recovereds)
        {
            write!(writer, "{}:", self.deme)?;
            match host.infection() {
                Some(virus) => {
                    let phenotype = genealogy.virus(virus).phenotype();
                    write!(writer, "{}", genealogy.phenotype(phenotype))?;
                }
                None => write!(writer, "n")?,
            }
            write!(writer, ":")?;
            if host.history().is_empty() {
                write!(writer, "n")?;
            }
            for (idx, &phenotype) in host.history().iter().enumerate() {
                if idx > 0 {
                    write!(writer, ";")?;
                }
                write!(writer, "{}", genealogy.phenotype(phenotype))?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }
}

/// Draw a Poisson number of events; non-positive rates give no events.
fn draw_poisson<R: Rng + ?Sized>(rate: f64, rng: &mut R) -> Result<usize> {
    if rate <= 0.0 {
        return Ok(0);
    }
    let dist = Poisson::new(rate).with_context(|| format!("invalid Poisson rate {rate}"))?;
    Ok(dist.sample(rng) as usize)
}

// Swap-remove a random element, `None` if empty.
fn remove_random<T, R: Rng + ?Sized>(vec: &mut Vec<T>, rng: &mut R) -> Option<T> {
    if vec.is_empty() {
        return None;
    }
    let idx = rng.random_range(0..vec.len());
    Some(vec.swap_remove(idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::phenotype::tests::Strain;

    struct Fixture {
        cfg: Config,
        genealogy: Genealogy<Strain>,
        tree: VirusTree,
        rng: ChaCha12Rng,
        ur_virus: VirusId,
        ur_immunity: PhenotypeId,
    }

    impl Fixture {
        fn new(cfg: Config) -> Self {
            let mut genealogy = Genealogy::new();
            let ur_virus = genealogy.intern(Strain(0));
            let ur_virus = genealogy.seed(ur_virus, cfg.model.initial_deme, 0.0);
            let ur_immunity = genealogy.intern(Strain(1000));
            Self {
                cfg,
                genealogy,
                tree: VirusTree::new(ur_virus),
                rng: ChaCha12Rng::seed_from_u64(11),
                ur_virus,
                ur_immunity,
            }
        }

        fn ctx(&mut self, day: f64) -> Context<'_, Strain> {
            Context {
                cfg: &self.cfg,
                day,
                genealogy: &mut self.genealogy,
                tree: &mut self.tree,
                rng: &mut self.rng,
                ur_immunity: self.ur_immunity,
            }
        }
    }

    fn check_partition(pop: &HostPopulation) {
        assert!(pop.infecteds().iter().all(Host::is_infected));
        assert!(!pop.susceptibles().iter().any(Host::is_infected));
        assert!(!pop.recovereds().iter().any(Host::is_infected));
    }

    #[test]
    fn initial_conditions() {
        let mut cfg = test_config();
        cfg.model.transcendental = true;
        cfg.model.initial_pr_t = 0.1;
        let mut fx = Fixture::new(cfg);
        let ur_virus = fx.ur_virus;
        let mut ctx = fx.ctx(0.0);

        let seeded = HostPopulation::new(0, ur_virus, &mut ctx);
        assert_eq!(seeded.i(), 20);
        assert_eq!(seeded.r(), 200);
        assert_eq!(seeded.s(), 1780);
        check_partition(&seeded);

        let empty = HostPopulation::new(1, ur_virus, &mut ctx);
        assert_eq!(empty.i(), 0);
        assert_eq!(empty.n(), 2000);
        assert!(empty.random_infection(ctx.rng).is_none());
    }

    #[test]
    fn compartments_stay_consistent() {
        let mut cfg = test_config();
        cfg.model.transcendental = true;
        cfg.model.initial_pr_t = 0.2;
        cfg.model.waning = true;
        cfg.model.waning_rate = 0.01;
        let mut fx = Fixture::new(cfg);
        let ur_virus = fx.ur_virus;
        let mut pop = HostPopulation::new(0, ur_virus, &mut fx.ctx(0.0));

        for step in 0..500 {
            let mut ctx = fx.ctx(step as f64 * 0.1);
            pop.step_forward(&mut ctx).unwrap();
            check_partition(&pop);
            assert_eq!(pop.n(), 2000);
        }
        assert!(pop.cases() > 0);
        pop.reset_cases();
        assert_eq!(pop.cases(), 0);
    }

    #[test]
    fn grow_and_decline_change_deme_size() {
        let mut cfg = test_config();
        cfg.model.swap_demography = false;
        cfg.model.birth_rate = 0.05;
        cfg.model.death_rate = 0.01;
        let mut fx = Fixture::new(cfg);
        let ur_virus = fx.ur_virus;
        let mut pop = HostPopulation::new(0, ur_virus, &mut fx.ctx(0.0));

        for step in 0..200 {
            let mut ctx = fx.ctx(step as f64 * 0.1);
            pop.step_forward(&mut ctx).unwrap();
            check_partition(&pop);
        }
        // Net growth of about 0.4% per step.
        assert!((3000..6000).contains(&pop.n()));
    }

    #[test]
    fn decline_removes_hosts_from_every_class() {
        let mut cfg = test_config();
        cfg.model.swap_demography = false;
        cfg.model.death_rate = 0.9;
        cfg.model.transcendental = true;
        cfg.model.initial_pr_t = 0.2;
        let mut fx = Fixture::new(cfg);
        let ur_virus = fx.ur_virus;
        let mut pop = HostPopulation::new(0, ur_virus, &mut fx.ctx(0.0));
        let (s, i, r) = (pop.s(), pop.i(), pop.r());

        let mut ctx = fx.ctx(0.0);
        for _ in 0..5 {
            pop.decline(&mut ctx).unwrap();
            check_partition(&pop);
        }
        assert!(pop.s() < s);
        assert!(pop.i() < i);
        assert!(pop.r() < r);
    }

    #[test]
    fn no_transmission_without_contacts() {
        let mut cfg = test_config();
        cfg.model.beta = 0.0;
        let mut fx = Fixture::new(cfg);
        let ur_virus = fx.ur_virus;
        let mut pop = HostPopulation::new(0, ur_virus, &mut fx.ctx(0.0));

        let mut infected = pop.i();
        for step in 0..200 {
            pop.step_forward(&mut fx.ctx(step as f64 * 0.1)).unwrap();
            assert!(pop.i() <= infected);
            infected = pop.i();
        }
        assert_eq!(pop.cases(), 0);
    }

    #[test]
    fn no_mutation_keeps_seed_phenotype() {
        let mut cfg = test_config();
        cfg.model.mu = 0.0;
        let mut fx = Fixture::new(cfg);
        let ur_virus = fx.ur_virus;
        let mut pop = HostPopulation::new(0, ur_virus, &mut fx.ctx(0.0));

        for step in 0..300 {
            pop.step_forward(&mut fx.ctx(step as f64 * 0.1)).unwrap();
        }
        assert!(pop.i() > 0);
        for virus in pop.infecteds().iter().filter_map(Host::infection) {
            let phenotype = fx.genealogy.virus(virus).phenotype();
            assert_eq!(*fx.genealogy.phenotype(phenotype), Strain(0));
        }
    }

    #[test]
    fn fitness_combines_risk_susceptibility_and_season() {
        let mut fx = Fixture::new(test_config());
        let ur_virus = fx.ur_virus;
        let mut ctx = fx.ctx(0.0);
        let pop = HostPopulation::new(0, ur_virus, &mut ctx);

        pop.assign_fitness(ur_virus, &mut ctx);
        let virus = fx.genealogy.virus(ur_virus);
        // Nobody is immune to the seed strain.
        assert_eq!(virus.average_infection_risk, 1.0);
        assert_eq!(virus.prob_susceptible, 1980.0 / 2000.0);
        assert!((virus.deme_seasonality - 1.1).abs() < 1e-12);
        let expected = virus.average_infection_risk * virus.prob_susceptible * virus.deme_seasonality;
        assert!((virus.fitness - expected).abs() < 1e-12);
    }

    #[test]
    fn between_deme_contacts_seed_other_deme() {
        let mut cfg = test_config();
        cfg.model.between_deme_pro = 1.0;
        let mut fx = Fixture::new(cfg);
        let ur_virus = fx.ur_virus;
        let (source, mut target) = {
            let mut ctx = fx.ctx(0.0);
            (
                HostPopulation::new(0, ur_virus, &mut ctx),
                HostPopulation::new(1, ur_virus, &mut ctx),
            )
        };

        for step in 0..100 {
            target
                .between_deme_contact(&source, &mut fx.ctx(step as f64 * 0.1))
                .unwrap();
        }
        assert!(target.i() > 0);
        check_partition(&target);
        for virus in target.infecteds().iter().filter_map(Host::infection) {
            assert_eq!(fx.genealogy.virus(virus).deme(), 1);
        }
    }

    #[test]
    fn sampled_tips_wait_for_burnin() {
        let mut cfg = test_config();
        cfg.model.burnin = 1000.0;
        cfg.tree.tip_sampling_rate = 1.0;
        let mut fx = Fixture::new(cfg);
        let ur_virus = fx.ur_virus;
        let mut pop = HostPopulation::new(0, ur_virus, &mut fx.ctx(0.0));

        for step in 0..50 {
            pop.step_forward(&mut fx.ctx(step as f64 * 0.1)).unwrap();
        }
        assert!(fx.tree.tips().is_empty());
        for step in 0..50 {
            pop.step_forward(&mut fx.ctx(1000.0 + step as f64 * 0.1)).unwrap();
        }
        assert!(!fx.tree.tips().is_empty());
    }

    #[test]
    fn writes_one_line_per_host() {
        let mut cfg = test_config();
        cfg.model.initial_ns = vec![30, 30];
        cfg.model.initial_i = 3;
        cfg.model.initial_pr_r = 0.0;
        let mut fx = Fixture::new(cfg);
        let ur_virus = fx.ur_virus;
        let pop = HostPopulation::new(0, ur_virus, &mut fx.ctx(0.0));

        let mut buf = Vec::new();
        pop.write_hosts(&fx.genealogy, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 30);
        assert_eq!(lines.iter().filter(|l| **l == "0:n:n").count(), 27);
        assert_eq!(lines.iter().filter(|l| **l == "0:0:n").count(), 3);
    }

    #[test]
    fn poisson_ignores_non_positive_rates() {
        let mut rng = ChaCha12Rng::seed_from_u64(12);
        assert_eq!(draw_poisson(0.0, &mut rng).unwrap(), 0);
        assert_eq!(draw_poisson(-3.0, &mut rng).unwrap(), 0);
        let total: usize = (0..1000).map(|_| draw_poisson(2.0, &mut rng).unwrap()).sum();
        assert!((1800..2200).contains(&total));
    }
}

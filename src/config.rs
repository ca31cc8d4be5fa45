use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{f64::consts::TAU, fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Number of days in a simulated year.
pub const DAYS_PER_YEAR: f64 = 365.0;

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Epidemic model parameters.
    pub model: ModelConfig,
    /// Antigenic phenotype parameters.
    pub phenotype: PhenotypeConfig,
    /// Tip sampling and tree reconstruction parameters.
    pub tree: TreeConfig,
    /// Output parameters.
    pub output: OutputConfig,
}

/// Epidemic model parameters. Rates are per day, times are in days.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Seed of the random number generator (drawn from the OS if absent).
    #[serde(default)]
    pub seed: Option<u64>,

    /// Length of a timestep.
    pub delta_t: f64,
    /// Day at which the run ends.
    pub end_day: f64,
    /// Days before tips are sampled and statistics are recorded.
    pub burnin: f64,
    /// Restart from initial conditions when the epidemic goes extinct.
    pub repeat_sim: bool,

    /// Initial number of hosts in each deme (one entry per deme).
    pub initial_ns: Vec<usize>,
    /// Index of the deme holding the initial infections.
    pub initial_deme: usize,
    /// Initial number of infected hosts.
    pub initial_i: usize,
    /// Probability that a new host starts with the initial immunity phenotype.
    pub initial_pr_r: f64,
    /// Initial fraction of recovered hosts in transcendental mode.
    pub initial_pr_t: f64,

    /// Per-host birth rate.
    pub birth_rate: f64,
    /// Per-host death rate.
    pub death_rate: f64,
    /// Reset hosts in place instead of adding and removing hosts.
    pub swap_demography: bool,

    /// Contact rate.
    pub beta: f64,
    /// Relative contact rate between demes.
    pub between_deme_pro: f64,
    /// Recovery rate.
    pub nu: f64,

    /// Recovered hosts enter a fully immune class instead of returning to S.
    pub transcendental: bool,
    /// Rate at which fully immune hosts return to S.
    pub immunity_loss: f64,

    /// Hosts randomly forget past infections.
    pub waning: bool,
    /// Per-host waning rate.
    pub waning_rate: f64,

    /// Per-infection mutation rate.
    pub mu: f64,
    /// Number of hosts sampled to estimate the fitness of a virus.
    pub fitness_sample_size: usize,

    /// Seasonality baseline of each deme.
    pub deme_baselines: Vec<f64>,
    /// Seasonality amplitude of each deme.
    pub deme_amplitudes: Vec<f64>,
    /// Seasonality phase offset of each deme (in years).
    pub deme_offsets: Vec<f64>,
}

/// Parameters of the geometric antigenic space.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PhenotypeConfig {
    /// First trait of the initial immunity phenotype.
    pub initial_trait_a: f64,
    /// Mean mutation step size.
    pub mean_step: f64,
    /// Standard deviation of the mutation step size.
    pub sd_step: f64,
    /// Every mutation moves exactly `mean_step`.
    pub fixed_step: bool,
    /// Mutations move in any direction instead of along the first axis.
    pub mut_2d: bool,
    /// Conversion from antigenic distance to infection risk.
    pub smith_conversion: f64,
    /// Protection against an identical phenotype.
    pub homologous_immunity: f64,
}

/// Tip sampling and tree reconstruction parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Rate at which infections are sampled as tips.
    pub tip_sampling_rate: f64,
    /// Scale the sampling rate by the number of infected hosts.
    pub tip_sampling_proportional: bool,
    /// Expected number of tips kept per deme after pruning.
    pub tip_samples_per_deme: usize,
    /// Years before the end excluded from trunk statistics.
    pub years_from_mk: f64,
    /// Rotate the antigenic space onto its principal axes.
    pub pca_samples: bool,
}

/// Output parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Days between recorded states.
    pub print_step: f64,
    /// Days simulated per trajectory file.
    pub days_per_file: f64,
    /// Number of pairs sampled to estimate diversity.
    pub diversity_sampling_count: usize,
    /// Coalescence window (in days).
    pub netau_window: f64,
    /// Only write the summary when the run finishes.
    pub reduced_output: bool,
    /// Also dump every host when the run finishes.
    pub detailed_output: bool,
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        let config: Config = toml::from_str(&contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate().context("invalid model table")?;
        self.phenotype.validate().context("invalid phenotype table")?;
        self.tree.validate().context("invalid tree table")?;
        self.output.validate().context("invalid output table")?;
        Ok(())
    }

    /// Number of demes.
    pub fn deme_count(&self) -> usize {
        self.model.initial_ns.len()
    }
}

impl ModelConfig {
    /// Seasonal forcing of the contact rate in deme `deme` at `date` (in years).
    pub fn seasonality(&self, deme: usize, date: f64) -> f64 {
        let amplitude = self.deme_amplitudes[deme];
        let offset = self.deme_offsets[deme];
        self.deme_baselines[deme] + amplitude * (TAU * date + TAU * offset).cos()
    }

    fn validate(&self) -> Result<()> {
        check_num(self.delta_t, 1e-6..=365.0).context("invalid timestep")?;
        check_num(self.end_day, 0.0..1e7).context("invalid end day")?;
        check_num(self.burnin, 0.0..1e7).context("invalid burn-in")?;

        let n_demes = self.initial_ns.len();
        check_num(n_demes, 1..100).context("invalid number of demes")?;
        for (deme, &n) in self.initial_ns.iter().enumerate() {
            check_num(n, 1..100_000_000).with_context(|| format!("invalid size of deme {deme}"))?;
        }
        check_num(self.initial_deme, 0..n_demes).context("invalid initial deme")?;
        let initial_n = self.initial_ns[self.initial_deme];
        check_num(self.initial_i, 1..=initial_n).context("invalid initial number of infected")?;
        check_num(self.initial_pr_r, 0.0..=1.0).context("invalid initial immune probability")?;
        check_num(self.initial_pr_t, 0.0..=1.0).context("invalid initial recovered fraction")?;
        if self.transcendental {
            let n_recovereds = (initial_n as f64 * self.initial_pr_t) as usize;
            if n_recovereds + self.initial_i > initial_n {
                bail!(
                    "{n_recovereds} recovered and {} infected hosts exceed size {initial_n} of deme {}",
                    self.initial_i,
                    self.initial_deme
                );
            }
        }

        check_num(self.birth_rate, 0.0..1.0).context("invalid birth rate")?;
        check_num(self.death_rate, 0.0..1.0).context("invalid death rate")?;
        check_num(self.beta, 0.0..100.0).context("invalid contact rate")?;
        check_num(self.between_deme_pro, 0.0..=1.0).context("invalid between-deme contact")?;
        check_num(self.nu, 0.0..100.0).context("invalid recovery rate")?;
        check_num(self.immunity_loss, 0.0..100.0).context("invalid immunity loss rate")?;
        check_num(self.waning_rate, 0.0..100.0).context("invalid waning rate")?;
        check_num(self.mu, 0.0..100.0).context("invalid mutation rate")?;
        check_num(self.fitness_sample_size, 1..1_000_000).context("invalid fitness sample size")?;

        check_vec(&self.deme_baselines, n_demes).context("invalid seasonality baselines")?;
        check_vec(&self.deme_amplitudes, n_demes).context("invalid seasonality amplitudes")?;
        check_vec(&self.deme_offsets, n_demes).context("invalid seasonality offsets")?;

        Ok(())
    }
}

impl PhenotypeConfig {
    fn validate(&self) -> Result<()> {
        check_num(self.initial_trait_a, -1e6..1e6).context("invalid initial trait")?;
        check_num(self.mean_step, 0.0..1e3).context("invalid mean step")?;
        check_num(self.sd_step, 0.0..1e3).context("invalid step standard deviation")?;
        if !self.fixed_step && (self.mean_step <= 0.0 || self.sd_step <= 0.0) {
            bail!("variable mutation steps need a positive mean and standard deviation");
        }
        check_num(self.smith_conversion, 0.0..100.0).context("invalid smith conversion")?;
        check_num(self.homologous_immunity, 0.0..=1.0).context("invalid homologous immunity")?;
        Ok(())
    }
}

impl TreeConfig {
    fn validate(&self) -> Result<()> {
        check_num(self.tip_sampling_rate, 0.0..1e6).context("invalid tip sampling rate")?;
        check_num(self.tip_samples_per_deme, 0..10_000_000)
            .context("invalid number of tips per deme")?;
        check_num(self.years_from_mk, 0.0..1e4).context("invalid trunk exclusion window")?;
        Ok(())
    }
}

impl OutputConfig {
    fn validate(&self) -> Result<()> {
        check_num(self.print_step, 1e-6..1e6).context("invalid print step")?;
        check_num(self.days_per_file, 1e-6..1e7).context("invalid days per file")?;
        check_num(self.diversity_sampling_count, 0..10_000_000)
            .context("invalid diversity sampling count")?;
        check_num(self.netau_window, 1e-6..1e6).context("invalid coalescence window")?;
        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_vec(vec: &[f64], exp_len: usize) -> Result<()> {
    // Ensure vector has one finite element per deme.
    let len = vec.len();
    if len != exp_len {
        bail!("vector length must be {exp_len}, but is {len}");
    }
    if vec.iter().any(|ele| !ele.is_finite()) {
        bail!("vector must have only finite elements");
    }
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Small two-deme configuration shared by the unit tests.
    pub fn test_config() -> Config {
        Config {
            model: ModelConfig {
                seed: Some(7),
                delta_t: 0.1,
                end_day: 200.0,
                burnin: 0.0,
                repeat_sim: false,
                initial_ns: vec![2000, 2000],
                initial_deme: 0,
                initial_i: 20,
                initial_pr_r: 0.5,
                initial_pr_t: 0.0,
                birth_rate: 1.0 / (30.0 * 365.0),
                death_rate: 1.0 / (30.0 * 365.0),
                swap_demography: true,
                beta: 0.36,
                between_deme_pro: 0.005,
                nu: 0.2,
                transcendental: false,
                immunity_loss: 0.01,
                waning: false,
                waning_rate: 0.0,
                mu: 0.01,
                fitness_sample_size: 10,
                deme_baselines: vec![1.0, 1.0],
                deme_amplitudes: vec![0.1, 0.1],
                deme_offsets: vec![0.0, 0.5],
            },
            phenotype: PhenotypeConfig {
                initial_trait_a: -6.0,
                mean_step: 0.3,
                sd_step: 0.3,
                fixed_step: false,
                mut_2d: true,
                smith_conversion: 0.1,
                homologous_immunity: 0.95,
            },
            tree: TreeConfig {
                tip_sampling_rate: 0.02,
                tip_sampling_proportional: true,
                tip_samples_per_deme: 50,
                years_from_mk: 0.1,
                pca_samples: true,
            },
            output: OutputConfig {
                print_step: 10.0,
                days_per_file: 100.0,
                diversity_sampling_count: 100,
                netau_window: 100.0,
                reduced_output: false,
                detailed_output: false,
            },
        }
    }

    #[test]
    fn test_config_is_valid() {
        test_config().validate().unwrap();
    }

    #[test]
    fn rejects_mismatched_seasonality() {
        let mut cfg = test_config();
        cfg.model.deme_offsets.pop();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_initial_deme() {
        let mut cfg = test_config();
        cfg.model.initial_deme = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_initial_infected() {
        let mut cfg = test_config();
        cfg.model.initial_i = 0;
        assert!(cfg.validate().is_err());
        cfg.model.initial_i = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_overfull_initial_deme() {
        let mut cfg = test_config();
        cfg.model.transcendental = true;
        cfg.model.initial_pr_t = 0.995;
        assert!(cfg.validate().is_err());
        cfg.model.initial_pr_t = 0.99;
        assert!(cfg.validate().is_ok());
        // Recovered hosts only seed transcendental runs.
        cfg.model.transcendental = false;
        cfg.model.initial_pr_t = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_toml_tables() {
        let cfg = test_config();
        let contents = r#"
[model]
seed = 7
delta_t = 0.1
end_day = 200.0
burnin = 0.0
repeat_sim = false
initial_ns = [2000, 2000]
initial_deme = 0
initial_i = 20
initial_pr_r = 0.5
initial_pr_t = 0.0
birth_rate = 9.132420091324201e-5
death_rate = 9.132420091324201e-5
swap_demography = true
beta = 0.36
between_deme_pro = 0.005
nu = 0.2
transcendental = false
immunity_loss = 0.01
waning = false
waning_rate = 0.0
mu = 0.01
fitness_sample_size = 10
deme_baselines = [1.0, 1.0]
deme_amplitudes = [0.1, 0.1]
deme_offsets = [0.0, 0.5]

[phenotype]
initial_trait_a = -6.0
mean_step = 0.3
sd_step = 0.3
fixed_step = false
mut_2d = true
smith_conversion = 0.1
homologous_immunity = 0.95

[tree]
tip_sampling_rate = 0.02
tip_sampling_proportional = true
tip_samples_per_deme = 50
years_from_mk = 0.1
pca_samples = true

[output]
print_step = 10.0
days_per_file = 100.0
diversity_sampling_count = 100
netau_window = 100.0
reduced_output = false
detailed_output = false
"#;
        let parsed: Config = toml::from_str(contents).unwrap();
        assert_eq!(parsed.deme_count(), 2);
        assert_eq!(parsed.tree, cfg.tree);
        assert_eq!(parsed.phenotype, cfg.phenotype);
        assert!((parsed.model.birth_rate - cfg.model.birth_rate).abs() < 1e-15);
    }

    #[test]
    fn seasonality_follows_offsets() {
        let cfg = test_config();
        assert!((cfg.model.seasonality(0, 0.0) - 1.1).abs() < 1e-12);
        assert!((cfg.model.seasonality(1, 0.0) - 0.9).abs() < 1e-12);
    }
}

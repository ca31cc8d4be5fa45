use std::{env, fs, path::PathBuf, process::Command};

const CONFIG: &str = r#"
[model]
seed = 17
delta_t = 0.1
end_day = 60.0
burnin = 5.0
repeat_sim = true
initial_ns = [1500, 1500]
initial_deme = 0
initial_i = 20
initial_pr_r = 0.5
initial_pr_t = 0.0
birth_rate = 9.132420091324201e-5
death_rate = 9.132420091324201e-5
swap_demography = true
beta = 0.36
between_deme_pro = 0.01
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
years_from_mk = 0.01
pca_samples = true

[output]
print_step = 5.0
days_per_file = 20.0
diversity_sampling_count = 50
netau_window = 100.0
reduced_output = false
detailed_output = true
"#;

fn run_bin(args: &[&str]) -> bool {
    let bin = PathBuf::from(env!("CARGO_BIN_EXE_antigen"));

    let output = Command::new(bin)
        .args(args)
        .output()
        .expect("failed to execute command");

    let stdout_str =
        std::str::from_utf8(&output.stdout).expect("failed to convert stdout to string");
    let stderr_str =
        std::str::from_utf8(&output.stderr).expect("failed to convert stderr to string");
    if !output.status.success() {
        eprintln!("{args:?} failed\nstdout:\n{stdout_str}\nstderr:\n{stderr_str}\n");
    }
    output.status.success()
}

#[test]
fn basic_workflow() {
    let test_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join("basic_workflow");

    fs::remove_dir_all(&test_dir).ok();
    fs::create_dir(&test_dir).expect("failed to create test directory");
    fs::write(test_dir.join("config.toml"), CONFIG).expect("failed to write config file");

    let test_dir_str = test_dir
        .to_str()
        .expect("failed to convert test directory to string");
    let sim = |args: &[&str]| {
        let mut full = vec!["--sim-dir", test_dir_str];
        full.extend_from_slice(args);
        assert!(run_bin(&full), "failed to run binary with {args:?}");
    };

    sim(&["create"]);
    sim(&["create"]);

    let run_0 = test_dir.join("run-0000");
    let run_1 = test_dir.join("run-0001");
    assert!(run_0.join("checkpoint.msgpack").is_file());
    assert!(run_1.join("trajectory-0000.msgpack").is_file());
    assert!(!run_0.join("tree.newick").exists());

    // Extinction restarts a run, which can take extra segments to finish.
    for (run_idx, run_dir) in [("0", &run_0), ("1", &run_1)] {
        let mut n_resumes = 0;
        while !run_dir.join("tree.newick").exists() {
            assert!(n_resumes < 20, "run {run_idx} did not finish");
            sim(&["resume", "--run-idx", run_idx]);
            n_resumes += 1;
        }
        assert!(n_resumes >= 2);
    }

    for run_dir in [&run_0, &run_1] {
        for file in [
            "trajectory-0002.msgpack",
            "summary.tsv",
            "tips.csv",
            "branches.tsv",
            "tree.newick",
            "range.csv",
            "hosts.txt",
        ] {
            assert!(run_dir.join(file).is_file(), "missing {file} in {run_dir:?}");
        }
        let newick = fs::read_to_string(run_dir.join("tree.newick")).unwrap();
        assert!(newick.trim_end().ends_with(';'));
        let summary = fs::read_to_string(run_dir.join("summary.tsv")).unwrap();
        assert!(summary.starts_with("parameter\tfull\n"));
        assert!(summary.contains("mkRatio\t"));
    }

    // Finished runs cannot be resumed.
    assert!(!run_bin(&["--sim-dir", test_dir_str, "resume", "--run-idx", "0"]));

    sim(&["analyze"]);
    assert!(run_0.join("results.msgpack").is_file());
    assert!(run_1.join("results.msgpack").is_file());

    sim(&["clean"]);
    assert!(!run_0.exists());
    assert!(!run_1.exists());

    fs::remove_dir_all(&test_dir).ok();
}

#[test]
fn rejects_invalid_config() {
    let test_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join("invalid_config");

    fs::remove_dir_all(&test_dir).ok();
    fs::create_dir(&test_dir).expect("failed to create test directory");
    let config = CONFIG.replace("delta_t = 0.1", "delta_t = -0.1");
    fs::write(test_dir.join("config.toml"), config).expect("failed to write config file");

    let test_dir_str = test_dir
        .to_str()
        .expect("failed to convert test directory to string");
    assert!(!run_bin(&["--sim-dir", test_dir_str, "create"]));
    assert!(!test_dir.join("run-0000").exists());

    fs::remove_dir_all(&test_dir).ok();
}

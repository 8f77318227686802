use calview::cli::CliOverrides;
use calview::config::ViewerConfig;
use calview::Launch;

const DEFAULT_CONFIG: &str = "config/calview.json";

fn main() {
    // wgpu backends are chatty at info; RUST_LOG still overrides.
    let default = "info,calview=info,wgpu_core=warn,wgpu_hal=warn,naga=warn";
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_secs()
        .try_init();

    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    let mut config = match cli.config_path() {
        Some(path) => match ViewerConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("[config] {err:?}");
                std::process::exit(2);
            }
        },
        None if std::path::Path::new(DEFAULT_CONFIG).exists() => ViewerConfig::load_or_default(DEFAULT_CONFIG),
        None => ViewerConfig::default(),
    };
    let overrides = cli.to_config_overrides();
    if !overrides.is_empty() {
        log::info!("command line overrides: {}", overrides.applied_fields().join(", "));
        config.apply_overrides(&overrides);
    }

    let launch = Launch { files: cli.files().to_vec(), reference: cli.reference().map(Into::into) };
    let result =
        if cli.headless() { calview::run_headless(config, launch) } else { calview::run(config, launch) };
    if let Err(err) = result {
        eprintln!("Application error: {err:?}");
        std::process::exit(1);
    }
}

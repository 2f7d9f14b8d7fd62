use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pagepool_core::config::{Config, LoggingConfig};

#[derive(Parser)]
#[command(
    name = "pagepool",
    about = "Keeps a small pool of headless browsers warm for short automation tasks",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the pool and keep it running until Ctrl+C / SIGTERM
    Serve {
        /// Override the configured pool size
        #[arg(long)]
        size: Option<usize>,

        /// Seconds between stats log lines
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },

    /// Load a URL in several pooled pages concurrently and print the titles
    Probe {
        /// Page to open
        #[arg(long)]
        url: String,

        /// Number of concurrent tasks
        #[arg(long, default_value_t = 5)]
        tasks: usize,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show resolved settings
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

/// Initialise tracing from the `logging` config section. `RUST_LOG` wins when set.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) -> anyhow::Result<()> {
    let defaults = LoggingConfig::default();
    let logging = logging.unwrap_or(&defaults);

    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let mut directives = vec![level.to_string()];
            directives.extend(logging.filters.iter().cloned());
            EnvFilter::try_new(directives.join(","))?
        }
    };

    let json = logging.format == "json";
    let stdout = logging.output == "stdout";
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_dir);

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides()?;

    init_logging(config.logging.as_ref(), cli.verbose)?;

    match cli.command {
        Commands::Serve {
            size,
            stats_interval,
        } => {
            if let Some(size) = size {
                config.pool.get_or_insert_with(Default::default).size = size;
            }
            check_config(&config)?;
            serve(&config, stats_interval).await?;
        }
        Commands::Probe { url, tasks } => {
            check_config(&config)?;
            probe(&config, url, tasks).await?;
        }
        Commands::Status => status(&config, &config_path),
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Configuration OK");
            }
        },
    }

    Ok(())
}

/// Log validation warnings and refuse to start on errors.
fn check_config(config: &Config) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        tracing::warn!("{w}");
    }
    if let Some(first) = errors.first() {
        anyhow::bail!("Invalid configuration: {first}");
    }
    Ok(())
}

fn status(config: &Config, config_path: &Path) {
    let browser = config.browser();
    println!("pagepool v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!("Pool size: {}", config.pool_size());
    println!("Task timeout: {:?}", config.task_timeout());
    match browser.chrome_path() {
        Some(path) => println!("Chrome: {}", path.display()),
        None => println!("Chrome: auto-detect"),
    }
    let fallback = browser.fallback_path();
    println!(
        "Fallback: {} ({})",
        fallback.display(),
        if fallback.exists() { "found" } else { "missing" }
    );
    println!("Headless: {}", browser.headless);
    println!(
        "Browser support: {}",
        if cfg!(feature = "browser") { "compiled in" } else { "not compiled in" }
    );
}

#[cfg(feature = "browser")]
async fn serve(config: &Config, stats_interval: u64) -> anyhow::Result<()> {
    use std::sync::Arc;

    let pool = Arc::new(pagepool_browser::chrome::browser_pool(config));
    pool.initialise().await?;
    let mut shutdown = pagepool_browser::lifecycle::destroy_on_shutdown(pool.clone());

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(stats_interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = pool.stats();
                tracing::info!(
                    size = stats.size,
                    busy = stats.busy,
                    queued = stats.queued,
                    unavailable = stats.unavailable,
                    crashes = stats.crashes,
                    "Pool stats"
                );
            }
            result = &mut shutdown => {
                result?;
                break;
            }
        }
    }
    Ok(())
}

#[cfg(feature = "browser")]
async fn probe(config: &Config, url: String, tasks: usize) -> anyhow::Result<()> {
    use std::sync::Arc;

    let pool = Arc::new(pagepool_browser::chrome::browser_pool(config));
    pool.initialise().await?;

    let mut handles = Vec::with_capacity(tasks);
    for n in 0..tasks {
        let pool = pool.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            let started = std::time::Instant::now();
            let result = pool
                .with_worker(|page| async move {
                    page.goto(url.as_str()).await?;
                    Ok::<_, anyhow::Error>(page.get_title().await?.unwrap_or_default())
                })
                .await;
            (n, started.elapsed(), result)
        }));
    }

    for handle in handles {
        let (n, elapsed, result) = handle.await?;
        match result {
            Ok(title) => println!("#{n} {elapsed:?} {title}"),
            Err(e) => println!("#{n} {elapsed:?} error: {e}"),
        }
    }

    println!("{}", serde_json::to_string_pretty(&pool.stats())?);
    pool.destroy().await;
    Ok(())
}

#[cfg(not(feature = "browser"))]
async fn serve(_config: &Config, _stats_interval: u64) -> anyhow::Result<()> {
    anyhow::bail!("pagepool was built without browser support; rebuild with --features browser")
}

#[cfg(not(feature = "browser"))]
async fn probe(_config: &Config, _url: String, _tasks: usize) -> anyhow::Result<()> {
    anyhow::bail!("pagepool was built without browser support; rebuild with --features browser")
}

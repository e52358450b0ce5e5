use clap::Parser;
use chaos_arena::cli::{self, Cli, Commands};
use chaos_arena::config::{AppConfig, LoggingConfig};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    if let Commands::ConfigCheck = cli.command {
        return config_check(&config);
    }

    init_logging(&config.logging);
    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!(problem = %problem, "invalid configuration");
        }
        anyhow::bail!("configuration has {} problem(s)", problems.len());
    }

    let mode = cli.output_mode();
    let arena = cli::build_arena(&config).await?;
    info!(namespace = %config.population.namespace, "arena ready");

    match &cli.command {
        Commands::Init { size } => cli::run_init(&arena, *size, mode).await?,
        Commands::Cycle { cycle } => cli::run_cycle(&arena, *cycle, mode).await?,
        Commands::Run {
            cycles,
            interval_secs,
        } => {
            cli::run_loop(&arena, *cycles, Duration::from_secs(*interval_secs), mode).await?
        }
        Commands::Leaderboard { all } => cli::show_leaderboard(&arena, *all, mode).await?,
        Commands::Lineage { agent_id } => cli::show_lineage(&arena, agent_id, mode).await?,
        Commands::Competitions { limit } => cli::show_competitions(&arena, *limit, mode).await?,
        Commands::ConfigCheck => {}
    }

    Ok(())
}

fn config_check(config: &AppConfig) -> anyhow::Result<()> {
    match config.validate() {
        Ok(()) => {
            println!("configuration ok");
            println!("  namespace:   {}", config.population.namespace);
            println!("  population:  {}", config.population.size);
            println!(
                "  backend:     {}",
                if config.database.url.is_some() { "postgres" } else { "in-memory" }
            );
            println!(
                "  advisor:     {}",
                if config.advisor.is_configured() { config.advisor.model.as_str() } else { "offline" }
            );
            Ok(())
        }
        Err(problems) => {
            for problem in &problems {
                eprintln!("  - {}", problem);
            }
            anyhow::bail!("configuration has {} problem(s)", problems.len())
        }
    }
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},chaos_arena=debug,sqlx=warn", logging.level))
    });

    // File logging only when ARENA_LOG_DIR is set and writable
    let file_layer = std::env::var("ARENA_LOG_DIR").ok().and_then(|log_dir| {
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                log_dir, e
            );
            return None;
        }
        let file_appender = tracing_appender::rolling::daily(&log_dir, "chaos-arena.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Keep the guard alive for the life of the process
        Box::leak(Box::new(guard));
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let (json_layer, text_layer) = if logging.json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true)))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init();
}

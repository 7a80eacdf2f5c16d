mod cli;

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use mf_core::config::Config;
use mf_core::JobState;
use mf_pipeline::{PipelineDefinition, StageRegistry};
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise use defaults based on the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "meshforge=debug,mf_core=debug,mf_db=debug,mf_tools=debug,mf_pipeline=debug,mf_server=debug,tower_http=debug".to_string()
        } else {
            "meshforge=info,mf_pipeline=info,mf_server=info,tower_http=info".to_string()
        }
    });

    // Logs go to stderr so `run` can print JSON on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Start {
            host,
            port,
            workers,
        } => {
            let mut config = Config::load_or_default(cli.config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(workers) = workers {
                config.server.workers = workers;
            }
            tracing::info!("Starting meshforge {}", env!("CARGO_PKG_VERSION"));
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(mf_server::start(config))?;
            Ok(())
        }
        Commands::Run { input } => run_file(&input, cli.config.as_deref()),
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("meshforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_file(input: &Path, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let rt = tokio::runtime::Runtime::new()?;
    let job = rt.block_on(async {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel();
            }
        });
        meshforge::local::run_file(config, input, &cancel).await
    })?;

    let body = serde_json::json!({
        "id": job.id.to_string(),
        "state": job.state.to_string(),
        "status": job.status(),
    });
    println!("{}", serde_json::to_string_pretty(&body)?);

    if job.state != JobState::Succeeded {
        anyhow::bail!("job {} did not succeed", job.id);
    }
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    println!("Checking external tools...\n");

    let tools = mf_tools::ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    if config.tools.validate_script.as_os_str().is_empty() {
        all_ok = false;
        println!("✗ validate script - not configured (tools.validate_script)");
    } else if !config.tools.validate_script.is_file() {
        all_ok = false;
        println!(
            "✗ validate script - {} not found",
            config.tools.validate_script.display()
        );
    }

    for script in config.tools.missing_repair_scripts() {
        all_ok = false;
        println!("✗ repair script - {} not found", script.display());
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Stages that need them will fail as unsupported input.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            Config::load(p)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let definition = PipelineDefinition::from_config(&config.pipeline);
    definition.check()?;
    let tools = std::sync::Arc::new(mf_tools::ToolRegistry::default());
    StageRegistry::with_builtin(tools, &config.tools).check(&definition)?;

    println!("✓ Configuration is valid");
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Workers: {}", config.server.workers);
    println!("  Max upload: {} MB", config.server.max_upload_mb);
    println!("  Storage root: {}", config.storage.root.display());
    println!("  Max retries: {}", config.retry.max_retries);
    println!("  Pipeline:");
    for stage in definition.stages() {
        println!("    - {} ({})", stage.name, stage.executor);
    }
    for warning in config.validate() {
        println!("  warning: {warning}");
    }

    Ok(())
}

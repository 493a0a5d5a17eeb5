use aaa_server::{Config, Context, Server, VirtualServers};
use clap::Parser;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// USG AAA Server - virtual server policy engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, disable_version_flag = true)]
#[command(name = "usg_aaa")]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG", default_value = "config.json")]
    config_path: String,

    /// Validate configuration and compile every virtual server, then exit
    #[arg(short, long)]
    validate: bool,

    /// Print version information and exit
    #[arg(short = 'V', long)]
    version: bool,
}

fn build_context() -> Arc<Context> {
    match Context::builder().with_builtins().build() {
        Ok(context) => Arc::new(context),
        Err(e) => {
            eprintln!("Failed to register protocols: {}", e);
            process::exit(1);
        }
    }
}

/// Compile everything without binding any socket
fn validate(context: Arc<Context>, config: &Config) -> ! {
    let image = VirtualServers::bootstrap(context, config).and_then(|mut image| {
        image.instantiate()?;
        Ok(image)
    });
    let image = match image {
        Ok(image) => image,
        Err(e) => {
            eprintln!("❌ Configuration validation failed!");
            eprintln!("   Error: {}", e);
            process::exit(1);
        }
    };

    println!("✓ Configuration validated successfully!");
    println!();
    println!("Configuration summary:");
    println!("  Workers: {}", config.workers);
    println!("  Request timeout: {}ms", config.request_timeout_ms);
    println!("  Log level: {}", config.log_level.as_deref().unwrap_or("info"));
    println!("  Modules: {}", image.modules().len());
    println!();

    println!("Virtual servers:");
    for server in image.servers() {
        println!(
            "  {} ({}) - {} compiled sections",
            server.name(),
            server.dict().name(),
            server.compiled_len()
        );
    }
    for server in &config.servers {
        for listen in &server.listen {
            println!("  listen {} {}:{} -> {}", listen.transport, listen.address, listen.port, server.name);
        }
    }
    image.free();
    process::exit(0);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("USG AAA Server v{}", env!("CARGO_PKG_VERSION"));
        println!("Virtual server policy engine");
        println!();
        println!("Repository: {}", env!("CARGO_PKG_REPOSITORY"));
        println!("License: {}", env!("CARGO_PKG_LICENSE"));
        process::exit(0);
    }

    // Load or create configuration (without logging first)
    let config = match Config::from_file(&cli.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing_subscriber::registry()
                .with(EnvFilter::new("info"))
                .with(tracing_subscriber::fmt::layer())
                .init();

            if cli.validate {
                eprintln!("❌ Configuration validation failed!");
                eprintln!("   Error: {}", e);
                process::exit(1);
            }

            warn!("Could not load config file from {}: {}", cli.config_path, e);
            info!("Creating example configuration at: {}", cli.config_path);
            if let Err(e) = Config::example().to_file(&cli.config_path) {
                error!("Error creating example config: {}", e);
                process::exit(1);
            }
            info!("Please edit {} and restart the server", cli.config_path);
            process::exit(0);
        }
    };

    let context = build_context();
    if cli.validate {
        validate(context.clone(), &config);
    }

    let log_level = if let Some(ref level) = config.log_level {
        level.as_str()
    } else if config.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("USG AAA Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from: {}", cli.config_path);
    info!("Protocols: {}", context.namespaces().join(", "));

    let server = Server::new(context);
    let image = match server.load(&config).await {
        Ok(image) => image,
        Err(e) => {
            error!("Failed to start server: {}", e);
            process::exit(1);
        }
    };
    for listener in image.listeners().listeners() {
        info!("  {} -> server {}", listener.data, listener.server);
    }
    drop(image);

    info!("Server started successfully!");
    info!("Press Ctrl+C to stop, send SIGHUP to reload");

    wait_for_shutdown(&server, &cli.config_path).await;
    server.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_shutdown(server: &Server, config_path: &str) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Reload on SIGHUP unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = hangup.recv() => {
                info!("Reloading configuration from {}", config_path);
                match Config::from_file(config_path) {
                    Ok(config) => {
                        if let Err(e) = server.reload(&config).await {
                            error!("Reload failed: {}", e);
                        }
                    }
                    Err(e) => error!("Reload skipped, invalid configuration: {}", e),
                }
                if server.current().is_none() {
                    error!("No server image left after reload, stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_server: &Server, _config_path: &str) {
    let _ = tokio::signal::ctrl_c().await;
}

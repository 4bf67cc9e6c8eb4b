use std::{future::IntoFuture, net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use routegate::{
    adapters::{
        FileRouteStore, HttpClientAdapter, HttpHandler, agent::ProxyRuntime, http_handler::router,
    },
    config::{
        GatewayConfigValidator,
        loader::{SAMPLE_CONFIG, SAMPLE_ROUTE_TABLE, load_config},
    },
    core::GatewayService,
    ports::{http_client::HttpClient, route_store::RouteStore},
    tracing_setup,
    utils::GracefulShutdown,
};

const DEFAULT_CONFIG: &str = "gateway.yaml";

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = DEFAULT_CONFIG)]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate the gateway configuration and the route directory
    Validate {
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Write a sample configuration and route table
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        #[clap(short, long, default_value = DEFAULT_CONFIG)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    tracing_setup::init_tracing(&config.log)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    GatewayConfigValidator::validate(&config).context("Invalid gateway configuration")?;
    let config = Arc::new(config);

    tracing::info!(
        route_dir = %config.route_dir.display(),
        services = ?config.services,
        "Loading route tables"
    );
    let store = Arc::new(FileRouteStore::new(&config.route_dir));
    for service in &config.services {
        if store.get(service).is_none() {
            tracing::warn!(service = %service, "No route table loaded for allowed service");
        }
    }
    store
        .watch()
        .context("Failed to start watching the route directory")?;

    let client: Arc<dyn HttpClient> = Arc::new(
        HttpClientAdapter::new(&config.transport).context("Failed to create HTTP client")?,
    );
    let runtime = Arc::new(ProxyRuntime::new(config.clone(), client));
    let gateway = Arc::new(GatewayService::new(
        config.clone(),
        store.clone() as Arc<dyn RouteStore>,
    ));
    let app = router(Arc::new(HttpHandler::new(gateway, runtime)));

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("routegate listening on {}", addr);

    let shutdown = GracefulShutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.run_signal_handler().await });
    }

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            let reason = shutdown.wait_for_shutdown_signal().await;
            tracing::info!("Shutdown signal received: {:?}, draining connections", reason);
        }
    });
    let drain_limit = {
        let shutdown = shutdown.clone();
        async move {
            shutdown.wait_for_shutdown_signal().await;
            tokio::time::sleep(shutdown.drain_timeout()).await;
        }
    };

    let server_result = tokio::select! {
        result = server.into_future() => result.context("Server error"),
        _ = drain_limit => {
            tracing::warn!(
                "Drain timeout ({:?}) exceeded, closing remaining connections",
                shutdown.drain_timeout()
            );
            Ok(())
        }
    };

    store.stop_watch();
    tracing::info!("Graceful shutdown completed");
    tracing_setup::shutdown_tracing();

    server_result
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = GatewayConfigValidator::validate(&config) {
        eprintln!("❌ Configuration validation failed:");
        eprintln!("{e}");
        println!();
        println!("💡 Common fixes:");
        println!("   • Verify listen address format (e.g., '127.0.0.1:8080')");
        println!("   • List at least one service under 'services'");
        println!("   • Durations need a unit (e.g., '500ms', '30s')");
        std::process::exit(1);
    }
    println!("✅ Configuration validation: OK");

    let mut route_errors = 0;
    for (path, result) in FileRouteStore::check_dir(&config.route_dir) {
        match result {
            Ok(service) => println!("✅ Route table '{service}': {}", path.display()),
            Err(e) => {
                route_errors += 1;
                eprintln!("❌ {e}");
            }
        }
    }

    let store = FileRouteStore::new(&config.route_dir);
    let missing: Vec<&str> = config
        .services
        .iter()
        .filter(|service| store.get(service).is_none())
        .map(String::as_str)
        .collect();

    println!();
    println!("📋 Configuration Summary:");
    println!("   • Listen Address: {}", config.listen_addr);
    println!("   • Route Directory: {}", store.root().display());
    println!("   • Services: {}", config.services.join(", "));
    println!("   • Route Tables Loaded: {}", store.get_all().len());
    println!("   • Default Timeout: {:?}", config.timeout);
    println!("   • Buffer Size: {} bytes", config.transport.buffer_size);

    if !missing.is_empty() {
        eprintln!();
        eprintln!("❌ No valid route table for: {}", missing.join(", "));
    }
    if route_errors > 0 || !missing.is_empty() {
        std::process::exit(1);
    }

    println!();
    println!("🎉 Configuration is valid and ready to use!");
    Ok(())
}

/// Write a sample configuration file and route table
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, SAMPLE_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");

    let route_dir = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("content/proxy");
    let table_path = route_dir.join("orders.json");
    if !table_path.exists() {
        tokio::fs::create_dir_all(&route_dir)
            .await
            .context("Failed to create route directory")?;
        tokio::fs::write(&table_path, SAMPLE_ROUTE_TABLE)
            .await
            .context("Failed to write sample route table")?;
        println!("✅ Created sample route table at: {}", table_path.display());
    }

    println!("   Run 'routegate serve --config {config_path}' to start the server");
    Ok(())
}

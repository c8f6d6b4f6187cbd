use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use refdata::{Coordinator, EppoConfig, EuConfig};
use std::sync::Arc;

/// Reference-data query service: ingests the EPPO code and EU
/// active-substance datasets and serves lookup and prefix-search queries.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// The port to listen on for API requests.
    #[clap(long, env = "PORT")]
    port: u16,
    /// Directory holding one sub-directory per provider.
    #[clap(long = "data-dir", env = "DATA_DIR")]
    data_dir: std::path::PathBuf,
    /// URL of the EPPO dataset-list endpoint.
    #[clap(long = "eppo-api-url", env = "EPPO_API_URL")]
    eppo_api_url: url::Url,
    /// API key sent on every EPPO upstream request.
    #[clap(long = "eppo-api-key", env = "EPPO_API_KEY", hide_env_values = true)]
    eppo_api_key: String,
    /// Comma-separated allow-list of EPPO code types.
    #[clap(long = "eppo-types", env = "EPPO_TYPES")]
    eppo_types: String,
    /// URL of the EU active-substance export.
    #[clap(long = "eu-url", env = "EU_URL")]
    eu_url: url::Url,
}

fn main() -> Result<(), anyhow::Error> {
    // Use reasonable defaults for printing structured logs to stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(
        port = args.port,
        data_dir = %args.data_dir.display(),
        "started!"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(args: Args) -> Result<(), anyhow::Error> {
    // Bind early in the application lifecycle, so the health endpoint is
    // reachable while the providers are still initialising.
    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", args.port))
        .await
        .context("failed to bind server port")?;

    let eppo_dir = args.data_dir.join("eppo");
    let eu_dir = args.data_dir.join("eu");
    std::fs::create_dir_all(&eppo_dir).context("failed to create eppo data directory")?;
    std::fs::create_dir_all(&eu_dir).context("failed to create eu data directory")?;

    let types = refdata::parse_types(&args.eppo_types);
    anyhow::ensure!(!types.is_empty(), "EPPO_TYPES must name at least one type");

    let eppo = Coordinator::new(
        refdata::eppo::Source::new(EppoConfig {
            api_url: args.eppo_api_url,
            api_key: args.eppo_api_key,
            types,
        }),
        eppo_dir,
    )?;
    let eu = Coordinator::new(
        refdata::eu::Source::new(EuConfig { url: args.eu_url }),
        eu_dir,
    )?;

    // Initialisation may fetch and build for minutes; serve NotReady in
    // the meantime rather than delaying the listener.
    {
        let eppo = eppo.clone();
        tokio::spawn(async move {
            if let Err(err) = eppo.initialise().await {
                tracing::error!(%err, "eppo initialisation failed");
            }
            eppo.spawn_refresh();
        });
    }
    {
        let eu = eu.clone();
        tokio::spawn(async move {
            if let Err(err) = eu.initialise().await {
                tracing::error!(%err, "eu initialisation failed");
            }
            eu.spawn_refresh();
        });
    }

    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let router = refdata_server::api::build_router(Arc::new(refdata_server::api::App {
        eppo,
        eu,
    }));
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

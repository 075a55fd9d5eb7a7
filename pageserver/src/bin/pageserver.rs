//! Main entry point for the Page Server executable.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use failpoints::FailpointRegistry;
use pageserver::config::{
    defaults::DEFAULT_CONFIG_FILE, ConfigToml, PageServerConf, PAGESERVER_CONFIG_FILE_NAME,
};
use pageserver::context::ServerContext;
use pageserver::http;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use utils::crashsafe;
use utils::logging::{self, Output};

#[derive(Parser)]
#[command(about = "Keeps the layer files of its tenants in sync with a remote storage", long_about = None)]
struct Cli {
    /// Working directory for the pageserver
    #[arg(short = 'D', long, default_value = ".neon")]
    workdir: Utf8PathBuf,

    /// Additional configuration overrides of the ones from the toml config file (or new ones to add there).
    /// Any option has to be a valid toml document, example: `-c="foo='hey'"` `-c="foo={value=1}"`
    #[arg(short = 'c', long = "config-override")]
    config_override: Vec<String>,

    /// Initialize pageserver working directory and config file, then exit
    #[arg(long)]
    init: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    if args.init {
        return initialize_workdir(&args.workdir, &args.config_override);
    }

    let conf = PageServerConf::load(&args.workdir, &args.config_override)?;
    let conf: &'static PageServerConf = Box::leak(Box::new(conf));

    logging::init(conf.log_format, Output::Stdout)?;
    logging::replace_panic_hook_with_tracing_panic_hook();
    info!(
        "starting pageserver {} in {}, listening on {}",
        conf.id, conf.workdir, conf.listen_http_addr
    );

    let failpoints = match std::env::var("FAILPOINTS") {
        Ok(failpoints) => FailpointRegistry::from_env_string(&failpoints)
            .context("parse FAILPOINTS environment variable")?,
        Err(_) => FailpointRegistry::new(),
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?
        .block_on(start_pageserver(conf, failpoints))
}

/// Writes the default config file, with the command line overrides applied, into
/// a new working directory.
fn initialize_workdir(workdir: &Utf8Path, overrides: &[String]) -> anyhow::Result<()> {
    let cfg_file_path = workdir.join(PAGESERVER_CONFIG_FILE_NAME);
    anyhow::ensure!(
        !cfg_file_path.exists(),
        "config file {cfg_file_path} already exists, refusing to overwrite it"
    );

    let mut contents = DEFAULT_CONFIG_FILE.to_string();
    for option_line in overrides {
        contents.push_str(option_line);
        contents.push('\n');
    }
    // Fail before writing anything if the result would not start.
    PageServerConf::parse_and_validate(ConfigToml::parse_with_overrides(&contents, &[])?, workdir)
        .context("validate the initial config")?;

    crashsafe::create_dir_all(workdir)?;
    std::fs::write(&cfg_file_path, contents)
        .with_context(|| format!("write config file {cfg_file_path}"))?;
    println!("initialized pageserver working directory {workdir}");
    Ok(())
}

async fn start_pageserver(
    conf: &'static PageServerConf,
    failpoints: FailpointRegistry,
) -> anyhow::Result<()> {
    crashsafe::create_dir_all(conf.tenants_path())?;

    let state = ServerContext::new(conf, failpoints)?;
    state.tenant_manager.init_from_disk().await?;

    let router = http::make_router(Arc::clone(&state))
        .build()
        .map_err(|err| anyhow!(err))?;
    let router_service = utils::http::RouterService::new(router).map_err(|err| anyhow!(err))?;

    let http_listener = std::net::TcpListener::bind(&conf.listen_http_addr)
        .with_context(|| format!("bind the http listener to {}", conf.listen_http_addr))?;
    http_listener.set_nonblocking(true)?;

    // Start HTTP server
    let server_shutdown = CancellationToken::new();
    let server = hyper::Server::from_tcp(http_listener)?
        .serve(router_service)
        .with_graceful_shutdown({
            let server_shutdown = server_shutdown.clone();
            async move {
                server_shutdown.cancelled().await;
            }
        });
    info!("Serving on {}", conf.listen_http_addr);
    let server_task = tokio::task::spawn(server);

    // Wait until we receive a signal
    let mut sigint = tokio::signal::unix::signal(SignalKind::interrupt())?;
    let mut sigquit = tokio::signal::unix::signal(SignalKind::quit())?;
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    info!("Terminating on signal");

    // Stop HTTP server first, so that no new work arrives while the tenants flush.
    server_shutdown.cancel();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server failed: {e}"),
        Err(e) => error!("Error joining HTTP server task: {e}"),
    }

    state.shutdown().await;
    info!("Shut down successfully completed");
    Ok(())
}

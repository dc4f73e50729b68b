//! Webserver binary: the TLS-terminating HTTP/WS frontend plus the
//! control-plane signaling socket ICE proxies register against.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Arg, Command};
use tracing::{error, info};
use webserver::{config, domain, orchestration, tls};

fn validate_config_path(value: &str) -> Result<std::path::PathBuf, String> {
    Ok(std::path::PathBuf::from(value))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("webserver")
        .version(env!("CARGO_PKG_VERSION"))
        .about("TLS-terminating HTTP/WS frontend for openvocs ICE session orchestration")
        .arg(
            Arg::new("config")
                .help("Path to the JSON config file")
                .short('c')
                .long("config")
                .value_parser(validate_config_path),
        )
        .arg(
            Arg::new("version")
                .help("Print version and exit")
                .short('v')
                .long("version")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if matches.get_flag("version") {
        println!("webserver {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let config_path = matches
        .get_one::<std::path::PathBuf>("config")
        .cloned()
        .unwrap_or_else(config::default_config_path);

    let cfg = match config::load_config_from_path(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let tls_config = match tls::build_server_config(&cfg.domains) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to build TLS configuration");
            return ExitCode::FAILURE;
        }
    };

    let (orchestrator, handle) = match orchestration::Orchestrator::bind(cfg.signalling_server, cfg.lock_timeout_msecs).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(addr = %cfg.signalling_server, error = %e, "failed to bind the control-plane socket");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %cfg.signalling_server, "control-plane socket listening");

    let domain_listener = match tokio::net::TcpListener::bind(cfg.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %cfg.listen_addr, error = %e, "failed to bind the domain listener");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %cfg.listen_addr, domains = cfg.domains.len(), "domain listener ready");

    let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
    let domains = Arc::new(cfg.domains);

    let orchestrator_task = tokio::spawn(orchestrator.run());
    let domain_task = tokio::spawn(domain::serve(domain_listener, acceptor, domains, handle));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutting down");
        }
        _ = orchestrator_task => {
            error!("control-plane orchestrator exited unexpectedly");
        }
        _ = domain_task => {
            error!("domain listener exited unexpectedly");
        }
    }

    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C"); },
        _ = terminate => { info!("received SIGTERM"); },
    }
}

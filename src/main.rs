use std::process::ExitCode;

use synguard::ebpf::{metrics, preflight};
use synguard::supervisor::shutdown_signal;
use synguard::{FilterConfig, FilterManager, Supervisor};
use tracing::{debug, error};

const BANNER: &str = "Firewall started. Blocking all traffic except HTTP (80) and HTTPS (443)...";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = match FilterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("synguard: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = synguard::tracing::init_tracing("synguard", config.otlp_endpoint.as_deref()) {
        eprintln!("synguard: failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }
    metrics::init();
    debug!(?config, "configuration loaded");

    if let Err(e) = preflight::check() {
        error!(error = %e, "preflight failed");
        eprintln!("synguard: {}", e);
        return ExitCode::FAILURE;
    }

    let mut supervisor = Supervisor::new(FilterManager::new(), config);
    if let Err(e) = supervisor.attach() {
        error!(error = %e, "startup failed");
        eprintln!("synguard: {}", e);
        synguard::tracing::shutdown_tracing();
        return ExitCode::FAILURE;
    }

    println!("{}", BANNER);

    let result = supervisor.run_until(shutdown_signal()).await;
    println!("Firewall stopped.");
    debug!(metrics = %metrics::gather_text(), "final metrics");
    synguard::tracing::shutdown_tracing();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "supervisor failed");
            ExitCode::FAILURE
        }
    }
}

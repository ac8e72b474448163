//! kim-snatch - Pod affinity mutating webhook for Kyma-managed namespaces

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use kim_snatch::{
    cli::{Cli, Command, TlsCommand},
    config::{Config, TlsSourceConfig},
    manifests::{self, ManifestParams},
    setup_tracing,
    tls::{CaParams, CertGenerator, ServingCertParams},
    webhook::WebhookServer,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // rustls needs one process-wide provider for the kube client
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    match cli.command {
        Some(Command::Tls(ref tls_cmd)) => run_tls_command(tls_cmd),
        Some(Command::Manifests {
            ref namespace,
            ref service,
            ref ca_bundle,
        }) => run_manifests(&cli, namespace, service, ca_bundle.as_deref()),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> Result<Config, kim_snatch::Error> {
    let mut config = Config::load(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if let Some(ref pool) = cli.worker_pool {
        config.policy.worker_pool = pool.clone();
    }
    if let Some(ref dir) = cli.cert_dir {
        config.tls.source = match config.tls.source {
            TlsSourceConfig::Directory {
                cert_file,
                key_file,
                ca_file,
                ..
            } => TlsSourceConfig::Directory {
                cert_dir: dir.display().to_string(),
                cert_file,
                key_file,
                ca_file,
            },
            TlsSourceConfig::Secret { .. } => TlsSourceConfig::Directory {
                cert_dir: dir.display().to_string(),
                cert_file: "tls.crt".to_string(),
                key_file: "tls.key".to_string(),
                ca_file: "ca.crt".to_string(),
            },
        };
    }

    config.validate()?;
    Ok(config)
}

async fn run_server(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        worker_pool = %config.policy.worker_pool,
        failure_policy = ?config.policy.failure_policy,
        "Starting kim-snatch"
    );

    if let Err(e) = WebhookServer::new(config).run().await {
        error!("Webhook server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

fn run_tls_command(cmd: &TlsCommand) -> ExitCode {
    match cmd {
        TlsCommand::InitCa {
            output,
            common_name,
            days,
        } => {
            let ca = match CertGenerator::init_ca(&CaParams {
                cn: common_name,
                validity_days: *days,
            }) {
                Ok(ca) => ca,
                Err(e) => {
                    eprintln!("Failed to generate CA: {e}");
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = CertGenerator::write_to_dir(&ca, output, "ca") {
                eprintln!("Failed to write CA: {e}");
                return ExitCode::FAILURE;
            }
            println!("CA written to {}", output.join("ca.crt").display());
            ExitCode::SUCCESS
        }
        TlsCommand::Issue { dir, sans, days } => match issue_serving_cert(dir, sans, *days) {
            Ok(()) => {
                println!("Serving certificate written to {}", dir.join("tls.crt").display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to issue serving certificate: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Writes `tls.crt` and `tls.key` next to `ca.crt`, the layout of a mounted
/// `kubernetes.io/tls` secret.
fn issue_serving_cert(dir: &Path, sans: &[String], days: u32) -> kim_snatch::Result<()> {
    let ca_cert = std::fs::read_to_string(dir.join("ca.crt"))?;
    let ca_key = std::fs::read_to_string(dir.join("ca.key"))?;
    let leaf = CertGenerator::issue_serving(
        &ServingCertParams {
            san_dns: sans.to_vec(),
            validity_days: days,
        },
        &ca_cert,
        &ca_key,
    )?;
    CertGenerator::write_to_dir(&leaf, dir, "tls")?;
    Ok(())
}

fn run_manifests(
    cli: &Cli,
    namespace: &str,
    service: &str,
    ca_bundle: Option<&Path>,
) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let ca_bundle = match ca_bundle.map(std::fs::read).transpose() {
        Ok(ca) => ca,
        Err(e) => {
            eprintln!("Failed to read CA bundle: {e}");
            return ExitCode::FAILURE;
        }
    };
    let params = ManifestParams {
        namespace: namespace.to_string(),
        service: service.to_string(),
        ca_bundle,
    };
    match manifests::render(&config, &params) {
        Ok(yaml) => {
            print!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render manifests: {e}");
            ExitCode::FAILURE
        }
    }
}

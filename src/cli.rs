//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Pod affinity mutating webhook for Kyma-managed namespaces
#[derive(Parser, Debug)]
#[command(name = "kim-snatch")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "KIM_SNATCH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Webhook port to listen on
    #[arg(short, long, env = "KIM_SNATCH_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "KIM_SNATCH_HOST")]
    pub host: Option<String>,

    /// Worker pool Pods are steered to
    #[arg(long, env = "KIM_SNATCH_WORKER_POOL")]
    pub worker_pool: Option<String>,

    /// Directory holding `tls.crt`, `tls.key` and `ca.crt`
    #[arg(long, env = "KIM_SNATCH_CERT_DIR")]
    pub cert_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "KIM_SNATCH_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "KIM_SNATCH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the webhook server (default)
    Serve,

    /// Certificate helpers for development clusters
    #[command(subcommand)]
    Tls(TlsCommand),

    /// Print the `PriorityClass` and `MutatingWebhookConfiguration` as YAML
    Manifests {
        /// Namespace the webhook Service lives in
        #[arg(long, default_value = "kyma-system")]
        namespace: String,

        /// Name of the webhook Service
        #[arg(long, default_value = "kim-snatch-webhook-service")]
        service: String,

        /// PEM CA bundle to embed as `caBundle`
        #[arg(long)]
        ca_bundle: Option<PathBuf>,
    },
}

/// TLS subcommands
#[derive(Subcommand, Debug)]
pub enum TlsCommand {
    /// Generate a self-signed CA
    InitCa {
        /// Output directory for `ca.crt` and `ca.key`
        #[arg(short, long, default_value = "certs")]
        output: PathBuf,

        /// CA common name
        #[arg(long, default_value = "kim-snatch CA")]
        common_name: String,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,
    },

    /// Issue a serving certificate signed by the CA
    Issue {
        /// Directory containing `ca.crt` and `ca.key`; also the output directory
        #[arg(short, long, default_value = "certs")]
        dir: PathBuf,

        /// DNS subject alternative names
        #[arg(long = "san", required = true)]
        sans: Vec<String>,

        /// Validity in days
        #[arg(long, default_value_t = 90)]
        days: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_has_no_subcommand() {
        let cli = Cli::try_parse_from(["kim-snatch"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn tls_issue_collects_repeated_sans() {
        let cli = Cli::try_parse_from([
            "kim-snatch",
            "tls",
            "issue",
            "--san",
            "kim-snatch-webhook-service.kyma-system.svc",
            "--san",
            "kim-snatch-webhook-service.kyma-system.svc.cluster.local",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Tls(TlsCommand::Issue { sans, days, .. })) => {
                assert_eq!(sans.len(), 2);
                assert_eq!(days, 90);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn serve_overrides_are_parsed() {
        let cli = Cli::try_parse_from([
            "kim-snatch",
            "--port",
            "10443",
            "--worker-pool",
            "kim-snatch-test",
            "serve",
        ])
        .unwrap();
        assert_eq!(cli.port, Some(10443));
        assert_eq!(cli.worker_pool.as_deref(), Some("kim-snatch-test"));
        assert!(matches!(cli.command, Some(Command::Serve)));
    }
}

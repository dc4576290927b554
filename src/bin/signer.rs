// src/bin/signer.rs
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use kube_external_ca::cert::AuthorityStore;
use kube_external_ca::config::{expand_path, split_csv, SignerConfig};
use kube_external_ca::signing::{SignerServer, SigningService};
use kube_external_ca::utils::logging;
use kube_external_ca::{PkiError, Result};

/// Remote signing service: holds the kubeadm authorities and signs CSRs
/// that match its profiles, over mutually authenticated TLS 1.3.
#[derive(Parser, Debug)]
#[command(name = "kube-ca-signer", version)]
pub struct Args {
    /// JSON config file; flags below override its values.
    #[arg(short, long)]
    pub config: Option<String>,
    #[arg(long)]
    pub addr: Option<String>,
    /// Directory holding one .crt/.key pair per authority.
    #[arg(long)]
    pub state_dir: Option<String>,
    #[arg(long)]
    pub server_cert: Option<String>,
    #[arg(long)]
    pub server_key: Option<String>,
    /// CA bundle that client certificates must chain to.
    #[arg(long)]
    pub client_ca: Option<String>,
    /// Comma-separated client certificate CNs allowed to call; empty allows any.
    #[arg(long)]
    pub allowed_client_cn: Option<String>,
    /// Write the effective config to this path and continue.
    #[arg(long)]
    pub save_config: Option<String>,
    #[arg(short, long)]
    pub debug: bool,
    #[arg(long)]
    pub log_file: Option<String>,
}

impl Args {
    fn effective_config(&self) -> Result<SignerConfig> {
        let mut config = match &self.config {
            Some(path) => SignerConfig::load_from_file(path)
                .map_err(|e| PkiError::Config(format!("load config {}: {}", path, e)))?,
            None => SignerConfig::default(),
        };
        let overrides = [
            (&self.addr, &mut config.listen_addr),
            (&self.state_dir, &mut config.state_dir),
            (&self.server_cert, &mut config.server_cert),
            (&self.server_key, &mut config.server_key),
            (&self.client_ca, &mut config.client_ca),
        ];
        for (flag, field) in overrides {
            if let Some(value) = flag {
                *field = value.clone();
            }
        }
        if let Some(cns) = &self.allowed_client_cn {
            config.allowed_client_cns = split_csv(cns);
        }
        Ok(config)
    }
}

async fn run(args: Args) -> Result<()> {
    let config = args.effective_config()?;
    config.validate()?;
    if let Some(path) = &args.save_config {
        config
            .save_to_file(path)
            .map_err(|e| PkiError::Config(format!("save config {}: {}", path, e)))?;
        info!(path = %path, "effective config saved");
    }

    let allow_list = config.allow_list();
    if allow_list.is_empty() {
        info!("no client allow-list configured; any authenticated client may call");
    } else {
        info!(allowed = ?allow_list.names().collect::<Vec<_>>(), "client allow-list active");
    }

    let store = AuthorityStore::new(config.state_path());
    let service = Arc::new(SigningService::from_store(&store, allow_list)?);
    let server = SignerServer::bind(&config.listen_addr, service, &config.tls_material()?).await?;

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_file = args.log_file.as_deref().map(expand_path);
    if let Err(e) = logging::init(args.debug, log_file.as_deref()) {
        eprintln!("failed to initialise logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "signer failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

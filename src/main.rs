// src/main.rs
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

use kube_external_ca::bootstrap::output::{cleanup_sensitive_output, write_artifacts};
use kube_external_ca::bootstrap::secrets::{previous_service_account, service_account_secret_name};
use kube_external_ca::bootstrap::{
    publish, resolve_server, ArtifactBuilder, ClusterApi, Issuer, ManifestDirectory,
};
use kube_external_ca::cert::{
    AuthorityMaterial, AuthorityStore, IdentityCatalog, LocalSigner, AUTHORITY_NAMES,
};
use kube_external_ca::config::{
    expand_path, split_csv, BootstrapConfig, CustodyMode, RemoteSignerConfig,
};
use kube_external_ca::signing::{HttpsTransport, RemoteSigningClient};
use kube_external_ca::utils::logging;
use kube_external_ca::Result;

/// Issue kubeadm control-plane PKI and publish it for an external-CA cluster.
#[derive(Parser, Debug)]
#[command(name = "kube-external-ca", version)]
pub struct Args {
    #[arg(long)]
    pub cluster_name: String,
    #[arg(long, default_value = "default")]
    pub namespace: String,
    /// Name of the KubeadmControlPlane to patch.
    #[arg(long = "kcp-name")]
    pub kcp_name: String,
    #[arg(long, value_enum, default_value_t = CustodyMode::Local)]
    pub mode: CustodyMode,
    /// Signer address (`host:port`) for `--mode remote`.
    #[arg(long, default_value = "")]
    pub endpoint: String,
    #[arg(long)]
    pub ca_cert: Option<String>,
    #[arg(long)]
    pub client_cert: Option<String>,
    #[arg(long)]
    pub client_key: Option<String>,
    /// TLS server name to verify instead of the endpoint host.
    #[arg(long)]
    pub server_name: Option<String>,
    /// Extra apiserver SANs, comma-separated.
    #[arg(long, default_value = "")]
    pub apiserver_san: String,
    /// Extra etcd SANs, comma-separated.
    #[arg(long, default_value = "")]
    pub etcd_san: String,
    /// Kubeconfig server URL, e.g. https://1.2.3.4:6443.
    #[arg(long)]
    pub server: Option<String>,
    /// Node name for the kubelet kubeconfig user (system:node:<name>).
    #[arg(long)]
    pub kubelet_node_name: Option<String>,
    #[arg(long, default_value = "out")]
    pub output_dir: String,
    /// Directory of cluster manifests read and written in place of a live cluster.
    #[arg(long, default_value = "out/manifests")]
    pub manifest_dir: String,
    /// Persist local-mode authorities here instead of generating fresh ones.
    #[arg(long)]
    pub ca_state_dir: Option<String>,
    /// Deadline for each call to the signer, in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
    #[arg(long)]
    pub dry_run: bool,
    /// Delete private keys and kubeconfigs from the output directory afterwards.
    #[arg(long)]
    pub cleanup: bool,
    #[arg(short, long)]
    pub debug: bool,
    #[arg(long)]
    pub log_file: Option<String>,
}

impl Args {
    fn into_config(self) -> BootstrapConfig {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        BootstrapConfig {
            cluster_name: self.cluster_name.trim().to_string(),
            namespace: self.namespace.trim().to_string(),
            control_plane_name: self.kcp_name.trim().to_string(),
            mode: self.mode,
            remote: RemoteSignerConfig {
                endpoint: self.endpoint.trim().to_string(),
                ca_cert: non_blank(self.ca_cert).map(|p| expand_path(&p)),
                client_cert: non_blank(self.client_cert).map(|p| expand_path(&p)),
                client_key: non_blank(self.client_key).map(|p| expand_path(&p)),
                server_name: non_blank(self.server_name),
            },
            apiserver_sans: split_csv(&self.apiserver_san),
            etcd_sans: split_csv(&self.etcd_san),
            server: non_blank(self.server),
            kubelet_node_name: non_blank(self.kubelet_node_name),
            output_dir: expand_path(&self.output_dir),
            manifest_dir: expand_path(&self.manifest_dir),
            ca_state_dir: non_blank(self.ca_state_dir).map(|p| expand_path(&p)),
            deadline: Duration::from_secs(self.timeout_secs),
            dry_run: self.dry_run,
            cleanup: self.cleanup,
        }
    }
}

fn local_issuer(state_dir: Option<&Path>) -> Result<LocalSigner> {
    let authorities = match state_dir {
        Some(dir) => AuthorityStore::new(dir).ensure_all(&AUTHORITY_NAMES)?,
        None => AUTHORITY_NAMES
            .iter()
            .map(|name| AuthorityMaterial::generate(name))
            .collect::<Result<Vec<_>>>()?,
    };
    Ok(LocalSigner::new(authorities))
}

async fn run(config: BootstrapConfig) -> Result<()> {
    config.validate()?;
    let api = ManifestDirectory::new(&config.manifest_dir);
    let server = resolve_server(
        &api,
        &config.namespace,
        &config.cluster_name,
        config.server.as_deref(),
    )
    .await?;

    let (issuer, authority_keys) = match config.mode {
        CustodyMode::Local => {
            let signer = local_issuer(config.ca_state_dir.as_deref())?;
            let keys = signer
                .authorities()
                .map(|a| a.export_with_key().map(|pair| (a.name().to_string(), pair)))
                .collect::<Result<Vec<_>>>()?;
            (Issuer::Local(signer), keys)
        }
        CustodyMode::Remote => {
            let transport = HttpsTransport::new(
                &config.remote.endpoint,
                &config.remote.tls_material()?,
                config.remote.server_name.as_deref(),
            )?;
            (
                Issuer::Remote(RemoteSigningClient::new(transport, config.deadline)),
                Vec::new(),
            )
        }
    };

    let existing_sa = api
        .get_secret(&config.namespace, &service_account_secret_name(&config.cluster_name))
        .await?;
    let catalog = IdentityCatalog::kubeadm(&config.apiserver_sans, &config.etcd_sans);
    let artifacts = ArtifactBuilder::new(catalog, issuer, server.clone())
        .kubelet_node_name(config.kubelet_node_name.clone())
        .previous_service_account(previous_service_account(existing_sa.as_ref())?)
        .build()
        .await?;

    let out_dir: PathBuf = config.output_path();
    write_artifacts(&out_dir, &artifacts, &authority_keys)?;

    let summary = publish(
        &api,
        &config.namespace,
        &config.cluster_name,
        &config.control_plane_name,
        &artifacts,
        config.dry_run,
    )
    .await?;

    if config.cleanup {
        cleanup_sensitive_output(&out_dir)?;
    }

    println!(
        "external-ca bootstrap material generated for cluster {:?} in namespace {:?}",
        config.cluster_name, config.namespace
    );
    println!("bootstrap mode: {:?}", config.mode);
    if config.mode == CustodyMode::Remote {
        println!("signer endpoint: {}", config.remote.endpoint);
    }
    println!("kubeconfig server used: {}", server);
    println!("secrets: {}", summary.secrets.join(", "));
    println!("output directory: {}", out_dir.display());
    if config.dry_run {
        println!("dry run: cluster manifests were not modified");
    }
    info!(cluster = %config.cluster_name, "bootstrap complete");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_file = args.log_file.as_deref().map(expand_path);
    if let Err(e) = logging::init(args.debug, log_file.as_deref()) {
        eprintln!("failed to initialise logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(args.into_config()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bootstrap failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

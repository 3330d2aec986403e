use clap::Parser;
use httptap::{Certificate, MitmConfig, MitmProxy};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "httptap")]
#[command(about = "Intercepting HTTP/HTTPS proxy that logs every exchange")]
#[command(version)]
struct Cli {
  /// Address to listen on
  #[arg(long, env = "HTTPTAP_LISTEN", default_value = "127.0.0.1:8081")]
  listen: String,
  /// PEM encoded root certificate used to sign forged certificates
  #[arg(long, env = "HTTPTAP_CA_CERT", default_value = "rootCA.pem")]
  ca_cert: PathBuf,
  /// PEM encoded PKCS#8 RSA private key of the root
  #[arg(long, env = "HTTPTAP_CA_KEY", default_value = "rootCA-key.pem")]
  ca_key: PathBuf,
  /// Extra attempts for failed idempotent requests
  #[arg(long, env = "HTTPTAP_RETRIES", default_value = "0")]
  retries: usize,
  /// Seconds to wait for an origin's response
  #[arg(long, env = "HTTPTAP_TIMEOUT", default_value = "60")]
  timeout: u64,
  /// Additional PEM bundle of roots trusted for origin servers
  #[arg(long, env = "HTTPTAP_UPSTREAM_CA")]
  upstream_ca: Option<PathBuf>,
  /// Do not verify origin certificates
  #[arg(long, env = "HTTPTAP_INSECURE_UPSTREAM")]
  insecure_upstream: bool,
}

async fn run(cli: Cli) -> httptap::Result<()> {
  let upstream_root_certs = match &cli.upstream_ca {
    Some(path) => Certificate::from_pem_bundle(&tokio::fs::read(path).await?)?,
    None => vec![],
  };
  let config = MitmConfig {
    listen_addr: cli.listen,
    ca_cert_path: cli.ca_cert,
    ca_key_path: cli.ca_key,
    read_timeout: Some(Duration::from_secs(cli.timeout)),
    max_retries: cli.retries,
    accept_invalid_upstream_certs: cli.insecure_upstream,
    upstream_root_certs,
    ..Default::default()
  };
  let proxy = MitmProxy::new(config).await?;
  tokio::select! {
    result = proxy.start() => result,
    _ = tokio::signal::ctrl_c() => {
      tracing::info!("[httptap] shutting down");
      Ok(())
    }
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(fmt::layer())
    .init();

  match run(Cli::parse()).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      eprintln!("httptap: {}", e);
      ExitCode::FAILURE
    }
  }
}

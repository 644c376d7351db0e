//! albumfs - SFTP gateway for Immich photo libraries.

use std::net::IpAddr;
use std::path::PathBuf;

use albumfs_immich::ImmichConfig;
use albumfs_sftp::hostkey;
use albumfs_sftp::server::{AlbumFsServer, BackendConfig, ServerConfig};
use anyhow::{Context, Result};
use chrono_tz::Tz;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// File name of the persistent host key inside the key directory.
const HOST_KEY_FILE: &str = "host.key";

/// SFTP gateway for Immich photo libraries
#[derive(Parser, Debug)]
#[command(name = "albumfs", version, about)]
struct Args {
    /// Catalog backend to serve
    #[arg(long, value_enum, default_value = "immich")]
    backend: Backend,

    /// Base URL of the Immich instance
    #[arg(long, env = "IMMICH_HOST", default_value = "http://127.0.0.1:2283")]
    immich_host: String,

    /// IANA timezone used for upload timestamps
    #[arg(long, env = "TZ", default_value = "UTC")]
    timezone: Tz,

    /// Store file backing the JSON backend
    #[arg(long, value_name = "FILE", default_value = "albumfs.json")]
    json_store: PathBuf,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "SFTP_PORT", default_value_t = 2222)]
    port: u16,

    /// Directory holding the host key (created on first run)
    #[arg(long, value_name = "DIR", default_value = ".")]
    key_dir: PathBuf,

    /// Log at debug level unless RUST_LOG overrides it
    #[arg(short, long)]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    /// Remote Immich instance
    Immich,
    /// Local JSON store
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let host_key = hostkey::load_or_generate(&args.key_dir.join(HOST_KEY_FILE))
        .context("preparing host key")?;

    let backend = match args.backend {
        Backend::Immich => BackendConfig::Immich(ImmichConfig {
            base_url: args.immich_host,
            timezone: args.timezone,
        }),
        Backend::Json => BackendConfig::Json {
            store_path: args.json_store,
        },
    };

    let server = AlbumFsServer::new(
        ServerConfig {
            bind_address: args.bind,
            port: args.port,
            backend,
        },
        host_key,
    );

    tokio::select! {
        result = server.run() => result.context("sftp server"),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    }
}

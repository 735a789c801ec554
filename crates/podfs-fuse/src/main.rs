//! podfs: mount a Solid Pod as a local filesystem.

use anyhow::{bail, Context, Result};
use clap::Parser;
use fuser::MountOption;
use podfs_core::{Credentials, PodConfig};
use podfs_fuse::PodFilesystem;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "podfs",
    version,
    about = "Mount a Solid Pod as a local filesystem",
    long_about = "Mounts a remote LDP resource store at a local directory. Containers \
                  appear as directories and non-RDF resources as regular files; writes \
                  are buffered locally and uploaded on close."
)]
struct Cli {
    /// Directory to mount the Pod at
    mountpoint: PathBuf,

    /// Base URL of the Pod's root container
    #[arg(long, env = "PODFS_BASE_URL")]
    url: Url,

    /// OAuth2 client id for the client-credentials grant
    #[arg(long, env = "PODFS_CLIENT_ID")]
    client_id: Option<String>,

    /// OAuth2 client secret
    #[arg(long, env = "PODFS_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Token endpoint of the identity provider
    #[arg(long, env = "PODFS_TOKEN_URL")]
    token_url: Option<Url>,

    /// Websocket notification gateway for change subscriptions
    #[arg(long, env = "PODFS_NOTIFICATION_GATEWAY")]
    notification_gateway: Option<Url>,

    /// Disable caching of resource bodies (every read hits the network)
    #[arg(long)]
    no_content_cache: bool,

    /// Freshness window for cached metadata, in seconds
    #[arg(long, default_value_t = 5)]
    cache_ttl: u64,

    /// Timeout for a single network operation, in seconds
    #[arg(long, default_value_t = 30)]
    io_timeout: u64,

    /// Allow other users to access the mount (requires user_allow_other
    /// in /etc/fuse.conf)
    #[arg(long)]
    allow_other: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn setup_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "podfs_core=warn,podfs_fuse=warn",
        1 => "podfs_core=info,podfs_fuse=info",
        2 => "podfs_core=debug,podfs_fuse=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn credentials_from(cli: &Cli) -> Result<Option<Credentials>> {
    match (&cli.client_id, &cli.client_secret, &cli.token_url) {
        (Some(client_id), Some(client_secret), Some(token_url)) => Ok(Some(Credentials {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            token_url: token_url.clone(),
        })),
        (None, None, None) => Ok(None),
        _ => bail!(
            "authentication requires all of --client-id, --client-secret and --token-url \
             (or none of them)"
        ),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    if !cli.mountpoint.is_dir() {
        bail!("mountpoint {} is not a directory", cli.mountpoint.display());
    }

    let mut config = PodConfig::new(cli.url.clone())
        .content_caching(!cli.no_content_cache)
        .cache_ttl(Duration::from_secs(cli.cache_ttl))
        .io_timeout(Duration::from_secs(cli.io_timeout));
    if let Some(credentials) = credentials_from(&cli)? {
        config = config.credentials(credentials);
    }
    if let Some(gateway) = cli.notification_gateway.clone() {
        config = config.notification_gateway(gateway);
    }

    let filesystem = PodFilesystem::new(config).context("initializing the pod engine")?;

    let mut options = vec![
        MountOption::FSName("podfs".to_string()),
        MountOption::Subtype("podfs".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    if cli.allow_other {
        options.push(MountOption::AllowOther);
    }

    let session = fuser::spawn_mount2(filesystem, &cli.mountpoint, &options)
        .context("mounting the filesystem")?;
    info!(mountpoint = %cli.mountpoint.display(), url = %cli.url, "mounted");

    // Block until a termination signal, then drop the session, which
    // unmounts and flushes.
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("installing the signal handler")?;
    rx.recv().ok();

    info!("unmounting");
    drop(session);
    Ok(())
}

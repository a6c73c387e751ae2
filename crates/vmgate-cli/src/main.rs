use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use url::Url;

use vmgate_core::config::{Configuration, LinkDialect};
use vmgate_core::ssh::{SshError, SshForward};
use vmgate_core::BoxedStream;
use vmgate_net::transport::{self, LinkListener};
use vmgate_net::virtualnetwork::NetError;
use vmgate_net::VirtualNetwork;

const DEFAULT_LISTEN: &str = "unix:///tmp/network.sock";

#[derive(Parser, Debug)]
#[command(name = "vmgate")]
#[command(about = "User-mode networking gateway for virtual machines")]
#[command(version)]
struct Cli {
    /// URL where the VM attaches its network link (repeatable)
    #[arg(long = "listen")]
    listen: Vec<String>,

    /// VPNKit socket to be used by HyperKit
    #[arg(long = "listen-vpnkit")]
    listen_vpnkit: Option<PathBuf>,

    /// Socket to be used by Qemu
    #[arg(long = "listen-qemu")]
    listen_qemu: Option<String>,

    /// Socket carrying Bess-framed packets
    #[arg(long = "listen-bess")]
    listen_bess: Option<String>,

    /// Attach the link over inherited stdin/stdout
    #[arg(long = "listen-stdio")]
    listen_stdio: bool,

    /// Datagram socket to be used by vfkit
    #[arg(long = "listen-vfkit")]
    listen_vfkit: Option<String>,

    /// Expose the services API on this URL (repeatable)
    #[arg(long = "services")]
    services: Vec<String>,

    /// Set the MTU
    #[arg(long, default_value_t = 1500)]
    mtu: usize,

    /// Print debug info and log link throughput
    #[arg(long)]
    debug: bool,

    /// Port to access the guest virtual machine. Must be between 1024 and 65535
    #[arg(long = "ssh-port", default_value_t = 2222)]
    ssh_port: u32,

    /// Forward a unix socket to the guest virtual machine over SSH
    #[arg(long = "forward-sock")]
    forward_sock: Option<PathBuf>,

    /// Unix socket path inside the guest to forward to
    #[arg(long = "forward-dest")]
    forward_dest: Option<String>,

    /// SSH user to use for the unix socket forward
    #[arg(long = "forward-user")]
    forward_user: Option<String>,

    /// Path to the SSH identity key for forwarding
    #[arg(long = "forward-identity")]
    forward_identity: Option<PathBuf>,

    /// Generate a file with the PID in it
    #[arg(long = "pid-file")]
    pid_file: Option<PathBuf>,
}

/// One VM link endpoint with the framing it speaks.
#[derive(Debug, PartialEq, Eq)]
enum LinkEndpoint {
    Stream(String),
    Datagram(String),
    Stdio,
}

#[derive(Debug)]
struct ForwardPlan {
    sock: PathBuf,
    dest_path: String,
    user: String,
    identity: PathBuf,
}

#[derive(Debug)]
struct Plan {
    links: Vec<(LinkDialect, LinkEndpoint)>,
    services: Vec<String>,
    protocol: LinkDialect,
    ssh_port: u16,
    forward: Option<ForwardPlan>,
}

fn validate(cli: &Cli) -> Result<Plan> {
    if cli.ssh_port < 1024 || cli.ssh_port > 65535 {
        bail!("ssh-port value must be between 1024 and 65535");
    }

    if cli.listen_vpnkit.is_some() && cli.listen_qemu.is_some() {
        bail!("cannot use qemu and vpnkit protocol at the same time");
    }

    let mut forward_count = 0;
    for present in [
        cli.forward_sock.is_some(),
        cli.forward_dest.is_some(),
        cli.forward_user.is_some(),
        cli.forward_identity.is_some(),
    ] {
        if present {
            forward_count += 1;
        }
    }
    if forward_count > 0 && forward_count < 4 {
        bail!(
            "--forward-sock, --forward-dest, --forward-user and --forward-identity \
             must all be specified together, or none specified"
        );
    }
    let forward = if forward_count == 4 {
        let identity = cli.forward_identity.clone().unwrap_or_default();
        std::fs::metadata(&identity)
            .with_context(|| format!("identity file {} can't be loaded", identity.display()))?;
        Some(ForwardPlan {
            sock: cli.forward_sock.clone().unwrap_or_default(),
            dest_path: cli.forward_dest.clone().unwrap_or_default(),
            user: cli.forward_user.clone().unwrap_or_default(),
            identity,
        })
    } else {
        None
    };

    let mut links: Vec<(LinkDialect, LinkEndpoint)> = Vec::new();
    for url in &cli.listen {
        links.push((LinkDialect::HyperKit, LinkEndpoint::Stream(url.clone())));
    }
    if let Some(path) = &cli.listen_vpnkit {
        links.push((
            LinkDialect::HyperKit,
            LinkEndpoint::Stream(format!("unix://{}", path.display())),
        ));
    }
    if let Some(url) = &cli.listen_qemu {
        transport::unix_path_available(url).map_err(|e| anyhow!("invalid listen-qemu: {e}"))?;
        links.push((LinkDialect::Qemu, LinkEndpoint::Stream(url.clone())));
    }
    if let Some(url) = &cli.listen_bess {
        links.push((LinkDialect::Bess, LinkEndpoint::Stream(url.clone())));
    }
    if cli.listen_stdio {
        links.push((LinkDialect::Stdio, LinkEndpoint::Stdio));
    }
    if let Some(url) = &cli.listen_vfkit {
        links.push((LinkDialect::VfkitUdp, LinkEndpoint::Datagram(url.clone())));
    }
    if links.is_empty() {
        links.push((
            LinkDialect::HyperKit,
            LinkEndpoint::Stream(DEFAULT_LISTEN.to_string()),
        ));
    }

    let protocol = links
        .iter()
        .map(|(dialect, _)| *dialect)
        .find(|dialect| dialect.single_connection())
        .unwrap_or_else(|| links[0].0);
    if protocol.single_connection() && links.len() > 1 {
        bail!("{protocol:?} is a point-to-point link and cannot share the process with other listeners");
    }

    Ok(Plan {
        links,
        services: cli.services.clone(),
        protocol,
        ssh_port: cli.ssh_port as u16,
        forward,
    })
}

/// PID file that disappears when the process shuts down cleanly.
struct PidFile(PathBuf);

impl PidFile {
    fn create(path: PathBuf) -> std::io::Result<PidFile> {
        let mut file = std::fs::File::create(&path)?;
        write!(file, "{}", std::process::id())?;
        Ok(PidFile(path))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            tracing::error!(path = %self.0.display(), error = %e, "could not remove pid file");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let default_level = if cli.debug { "vmgate=debug" } else { "vmgate=info" };
    let env_filter = EnvFilter::from_default_env().add_directive(default_level.parse()?);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let plan = validate(&cli)?;
    let _pid_file = cli.pid_file.clone().map(PidFile::create).transpose()?;

    let config = Configuration::default_plan(cli.mtu, plan.ssh_port, plan.protocol, cli.debug)?;
    let ssh_guest_addr = config.ssh_guest_addr;

    let token = CancellationToken::new();
    let vn = VirtualNetwork::new(config, token.clone());
    vn.start_forwards().await.context("cannot start forwards")?;
    tracing::info!("waiting for clients...");

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    // signals cancel the root; everything else drains behind it
    {
        let token = token.clone();
        tasks.spawn(async move {
            tokio::select! {
                caught = shutdown_signal() => {
                    caught?;
                    tracing::info!("signal caught, shutting down");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
            Ok(())
        });
    }

    for (dialect, endpoint) in plan.links {
        let vn = vn.clone();
        match endpoint {
            LinkEndpoint::Stream(url) => {
                let listener = LinkListener::bind(&url)
                    .await
                    .with_context(|| format!("cannot listen on {url}"))?;
                tracing::info!(%url, ?dialect, "listening");
                tasks.spawn(async move {
                    match vn.run_link_listener(listener, dialect).await {
                        Ok(()) => Ok(()),
                        Err(e) => Err(anyhow!(e)),
                    }
                });
            }
            LinkEndpoint::Datagram(url) => {
                let socket = transport::bind_datagram(&url)
                    .await
                    .with_context(|| format!("cannot listen on {url}"))?;
                tracing::info!(%url, ?dialect, "listening");
                tasks.spawn(async move { vn.serve_datagram_link(socket).await.map_err(Into::into) });
            }
            LinkEndpoint::Stdio => {
                let token = token.clone();
                tasks.spawn(async move {
                    let stream: BoxedStream =
                        Box::new(tokio::io::join(tokio::io::stdin(), tokio::io::stdout()));
                    match vn.serve_link(stream, LinkDialect::Stdio).await {
                        Ok(()) if token.is_cancelled() => Ok(()),
                        Ok(()) => Err(anyhow!(NetError::LinkClosed)),
                        Err(e) => Err(anyhow!(e)),
                    }
                });
            }
        }
    }

    for url in plan.services {
        let listener = LinkListener::bind(&url)
            .await
            .with_context(|| format!("cannot listen on {url}"))?;
        tracing::info!(%url, "services API listening");
        let vn = vn.clone();
        tasks.spawn(async move {
            vn.run_services_listener(listener).await;
            Ok(())
        });
    }

    if cli.debug {
        let vn = vn.clone();
        let token = token.clone();
        tasks.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    _ = interval.tick() => {
                        tracing::info!(
                            sent = vn.counters().bytes_sent(),
                            received = vn.counters().bytes_received(),
                            "bytes sent to the VM / received from the VM"
                        );
                    }
                }
            }
        });
    }

    if let Some(forward) = plan.forward {
        let dest = Url::parse(&format!(
            "ssh://{}@{}{}",
            forward.user, ssh_guest_addr, forward.dest_path
        ))
        .context("invalid ssh forward destination")?;
        let vn = vn.clone();
        let token = token.clone();
        tasks.spawn(async move {
            let mut ssh_forward = SshForward::new(
                &token,
                &forward.sock,
                &dest,
                Some(forward.identity.as_path()),
                vn.ssh_dialer(),
            )
            .await
            .context("cannot create ssh forward")?;

            loop {
                match ssh_forward.accept_and_tunnel(&token).await {
                    Ok(()) => {}
                    Err(SshError::Cancelled) => break,
                    Err(SshError::Io(e)) => {
                        tracing::error!(error = %e, "ssh forward listener failed");
                        break;
                    }
                    Err(e) => tracing::debug!(error = %e, "ssh forwarded connection failed"),
                }
            }
            ssh_forward.close().await;
            Ok(())
        });
    }

    // error-group: the first failure cancels the root, then everything is
    // awaited before exiting
    let mut outcome = Ok(());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
                token.cancel();
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                if outcome.is_ok() {
                    outcome = Err(anyhow!(e));
                }
                token.cancel();
            }
        }
    }
    outcome
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        caught = tokio::signal::ctrl_c() => caught?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

mod cache;
mod config;
mod engine;
mod filter;
mod policy;
mod singleflight;
mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::ResponseCache;
use crate::engine::Engine;
use crate::upstream::{Defense, UpstreamClient};

/// UDP workers poll with this timeout; every 4th idle tick sweeps the
/// transaction table.
const IDLE_TICK: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about = "DNS forwarding proxy with per-name routing and poisoning defense", long_about = None)]
struct Args {
    /// Local listen address; ":53" binds all interfaces
    #[arg(short = 'l', long = "listen", default_value = ":53")]
    listen: String,
    /// Configuration file path (JSON)
    #[arg(short = 'c', long = "config", default_value = "dnspanic.conf")]
    config: PathBuf,
    /// Reformat the configuration file in place and exit
    #[arg(long = "format", default_value_t = false)]
    format: bool,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker count (default: CPU cores)
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    if args.format {
        return config::format_config(&args.config);
    }

    let doc = config::load_config(&args.config).context("load config")?;
    let policy = Arc::new(config::compile(&doc).context("compile policy")?);
    let bind_addr = parse_listen_addr(&args.listen).context("parse listen address")?;

    let cache = Arc::new(ResponseCache::new());
    let upstream = UpstreamClient::new(Defense {
        cache: cache.clone(),
        global_filters: policy.global().filters.clone(),
    });
    let engine = Engine::new(policy, cache, upstream.clone());

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };
    info!(listen = %bind_addr, udp_workers, "dns proxy started");

    #[cfg(unix)]
    for worker_id in 0..udp_workers {
        // one SO_REUSEPORT socket per worker; the kernel spreads packets
        let std_socket = create_reuseport_udp_socket(bind_addr)
            .with_context(|| format!("create udp socket for worker {worker_id}"))?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let engine = engine.clone();
        let upstream = upstream.clone();
        tokio::spawn(async move {
            if let Err(err) = run_udp_worker(socket, engine, upstream).await {
                error!(worker_id, error = %err, "udp worker exited");
            }
        });
    }

    #[cfg(not(unix))]
    {
        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if bind_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create udp socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&bind_addr.into()).context("bind udp socket")?;
        let socket = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
        for worker_id in 0..udp_workers {
            let socket = Arc::clone(&socket);
            let engine = engine.clone();
            let upstream = upstream.clone();
            tokio::spawn(async move {
                if let Err(err) = run_udp_worker(socket, engine, upstream).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }

    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .context("bind tcp listener")?;
    let tcp_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_engine).await {
            error!(error = %err, "tcp server exited");
        }
    });

    wait_for_signal().await;
    upstream.shutdown();
    info!("shut down");
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// ":53" style shorthand binds every interface.
fn parse_listen_addr(s: &str) -> anyhow::Result<SocketAddr> {
    let full = if s.starts_with(':') {
        format!("0.0.0.0{s}")
    } else {
        s.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid listen address {s:?}"))
}

#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let val: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of_val(&val) as libc::socklen_t,
        )
    };
    if ret != 0 {
        // continue without reuseport; the workers then share one queue
        warn!("SO_REUSEPORT unavailable");
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

async fn run_udp_worker(
    socket: Arc<UdpSocket>,
    engine: Engine,
    upstream: Arc<UpstreamClient>,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 4096];
    let mut idle_ticks = 0u32;
    loop {
        let (len, peer) = match timeout(IDLE_TICK, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(err)) => {
                warn!(error = %err, "udp recv failed");
                continue;
            }
            Err(_) => {
                // idle; sweep stale transactions on every 4th tick
                idle_ticks = idle_ticks.wrapping_add(1);
                if idle_ticks & 3 == 3 {
                    upstream.cleanup();
                }
                continue;
            }
        };
        let packet = buf[..len].to_vec();
        let engine = engine.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            // a None response is dropped silently; the client retries
            if let Some(resp) = engine.handle_packet(&packet).await {
                let _ = socket.send_to(&resp, peer).await;
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, engine: Engine) -> anyhow::Result<()> {
    loop {
        let (stream, _peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, engine).await;
        });
    }
}

async fn handle_tcp_conn(mut stream: TcpStream, engine: Engine) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let Some(resp) = engine.handle_packet(&buf).await else {
            // nothing to answer; close and let the client retry
            return Ok(());
        };
        if resp.len() > u16::MAX as usize {
            return Ok(());
        }
        let len_bytes = (resp.len() as u16).to_be_bytes();
        if stream.write_all(&len_bytes).await.is_err() {
            return Ok(());
        }
        if stream.write_all(&resp).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut quit = signal(SignalKind::quit()).expect("install SIGQUIT handler");
    tokio::select! {
        _ = interrupt.recv() => info!("terminated by SIGINT"),
        _ = terminate.recv() => info!("terminated by SIGTERM"),
        _ = quit.recv() => info!("terminated by SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("terminated by ctrl-c");
}

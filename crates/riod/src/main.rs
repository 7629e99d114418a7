//! riod: serve a riofs tree to transports over a framed op protocol.
//!
//! Listens on `tcp!host!port` or `unix!path`, frames messages with a
//! 4-byte little-endian size, and dispatches every inbound message on its
//! own task so blocked reads never stall the connection.

use {
    clap::Parser,
    futures::sink::SinkExt,
    log::{error, info},
    riofs::{Config, OpenMode, Rio},
    std::{path::PathBuf, sync::Arc, time::Duration},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::Mutex,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::LengthDelimitedCodec,
};

mod proto;
use crate::proto::{Fcall, Msg};

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address[!port]
    /// where: proto = tcp | unix
    address: String,

    /// Host mount point of this tree
    #[arg(long, default_value = "/mnt/rio")]
    mount_root: PathBuf,

    /// Mount point of the agent filesystem
    #[arg(long, default_value = "/mnt/llm")]
    llmfs_mount: PathBuf,

    /// Shell for new terminals (defaults to $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Quiet interval before terminal output is marked ready
    #[arg(long, default_value_t = 120)]
    debounce_ms: u64,

    /// Terminals to spawn at startup
    #[arg(long, default_value_t = 0)]
    terminals: usize,

    /// Run without the shell sandbox (development only)
    #[arg(long)]
    no_sandbox: bool,

    /// Default target of ctl save/load
    #[arg(long)]
    state_path: Option<PathBuf>,
}

fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let (proto, rest) = arg.split_once('!')?;
    Some((proto, rest.replace('!', ":")))
}

async fn handle(rio: &Rio, body: Fcall) -> riofs::Result<Fcall> {
    match body {
        Fcall::TAttach => Ok(Fcall::RAttach {
            fid: rio.dispatch.attach().await,
        }),
        Fcall::TWalk { fid, wnames } => {
            let components: Vec<&str> = wnames.iter().map(String::as_str).collect();
            Ok(Fcall::RWalk {
                newfid: rio.dispatch.walk(fid, &components).await?,
            })
        }
        Fcall::TOpen { fid, mode } => {
            rio.dispatch
                .open(fid, OpenMode::from_bits_truncate(mode))
                .await?;
            Ok(Fcall::ROpen)
        }
        Fcall::TRead { fid, offset, count } => Ok(Fcall::RRead {
            data: rio.dispatch.read(fid, offset, count).await?,
        }),
        Fcall::TWrite { fid, offset, data } => Ok(Fcall::RWrite {
            count: rio.dispatch.write(fid, offset, &data).await?,
        }),
        Fcall::TClunk { fid } => {
            rio.dispatch.clunk(fid).await?;
            Ok(Fcall::RClunk)
        }
        other => Err(riofs::Error::Usage(format!(
            "unexpected message {:?}",
            proto::MsgType::from(&other)
        ))),
    }
}

async fn dispatch<Reader, Writer>(rio: Arc<Rio>, reader: Reader, writer: Writer)
where
    Reader: 'static + AsyncRead + Send + Unpin,
    Writer: 'static + AsyncWrite + Send + Unpin,
{
    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_read(reader);
    let framedwrite = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writer);
    let framedwrite = Arc::new(Mutex::new(framedwrite));

    while let Some(frame) = framedread.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                error!("connection read error: {e}");
                break;
            }
        };
        let msg = match proto::read_msg(&mut frame.as_ref()) {
            Ok(msg) => msg,
            Err(e) => {
                error!("bad frame: {e}");
                break;
            }
        };
        log::debug!("\t← {:?}", msg);

        let rio = rio.clone();
        let framedwrite = framedwrite.clone();
        tokio::spawn(async move {
            let body = handle(&rio, msg.body).await.unwrap_or_else(|e| {
                log::debug!("tag {}: error reply: {e}", msg.tag);
                Fcall::RError {
                    ename: e.to_string(),
                }
            });
            let response = Msg {
                tag: msg.tag,
                body,
            };

            let mut buf = Vec::with_capacity(4096);
            if let Err(e) = proto::write_msg(&mut buf, &response) {
                error!("failed to serialize response for tag {}: {e}", response.tag);
                return;
            }
            let mut writer = framedwrite.lock().await;
            if let Err(e) = writer.send(bytes::Bytes::from(buf)).await {
                error!("failed to send response for tag {}: {e}", response.tag);
            }
        });
    }
}

async fn serve(rio: Arc<Rio>, address: &str) -> riofs::Result<()> {
    let (proto, addr) = parse_proto(address).ok_or_else(|| {
        riofs::Error::Usage("address must be proto!addr[!port] with proto = tcp | unix".into())
    })?;

    match proto {
        "tcp" => {
            let listener = TcpListener::bind(&addr).await?;
            info!("listening on tcp {addr}");
            loop {
                let (stream, peer) = listener.accept().await?;
                info!("accepted: {peer:?}");
                let rio = rio.clone();
                tokio::spawn(async move {
                    let (readhalf, writehalf) = stream.into_split();
                    dispatch(rio, readhalf, writehalf).await;
                });
            }
        }
        "unix" => {
            let _ = std::fs::remove_file(&addr);
            let listener = UnixListener::bind(&addr)?;
            info!("listening on unix {addr}");
            loop {
                let (stream, _) = listener.accept().await?;
                let rio = rio.clone();
                tokio::spawn(async move {
                    let (readhalf, writehalf) = tokio::io::split(stream);
                    dispatch(rio, readhalf, writehalf).await;
                });
            }
        }
        other => Err(riofs::Error::Usage(format!("unknown protocol '{other}'"))),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = Config::default();
    config.mount_root = cli.mount_root;
    config.llmfs_mount = cli.llmfs_mount;
    if let Some(shell) = cli.shell {
        config.shell = shell;
    }
    config.debounce = Duration::from_millis(cli.debounce_ms);
    config.sandbox_enabled = !cli.no_sandbox;
    if let Some(path) = cli.state_path {
        config.state_path = path;
    }

    let rio = Arc::new(Rio::new(config));
    for _ in 0..cli.terminals {
        match rio.terms.spawn() {
            Ok(id) => info!("startup terminal: {id}"),
            Err(e) => error!("failed to spawn startup terminal: {e}"),
        }
    }

    let served = {
        let rio = rio.clone();
        let address = cli.address.clone();
        tokio::spawn(async move { serve(rio, &address).await })
    };

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("signal");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        res = served => {
            if let Ok(Err(e)) = res {
                error!("server error: {e}");
            }
        }
    }

    rio.shutdown();
    info!("shutdown complete");
}

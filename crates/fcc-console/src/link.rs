//! Transport side of the console: one connection at a time, handshake,
//! frame pumping in both directions, and reconnecting after a loss.
//!
//! The link task never touches the session. It reports what happened on the
//! socket as [`LinkEvent`]s and writes whatever the session sends through
//! its [`LinkChannel`].

use crate::config::Endpoint;
use fcc_core::wire::{
    encode_frame, FrameDecoder, HelloPayload, WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES,
};
use fcc_sync::{ChannelClosed, OutboundRequest, RemoteChannel};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub endpoint: Endpoint,
    pub client_id: String,
    pub reconnect_delay: Duration,
}

#[derive(Debug)]
pub enum LinkEvent {
    /// A socket is open and the hello is about to go out. Calls written to
    /// `channel` before `Ready` are queued behind the hello.
    Connecting { link: u64, channel: LinkChannel },
    Ready {
        link: u64,
        server_id: String,
        motd: Option<String>,
    },
    Message { link: u64, msg: WireMsg },
    Disconnected { link: u64, reason: String },
}

#[derive(Debug)]
enum Outbound {
    Request(OutboundRequest),
    Close,
}

/// Write half of one connection as seen by the session.
#[derive(Debug, Clone)]
pub struct LinkChannel {
    link: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl LinkChannel {
    pub fn link(&self) -> u64 {
        self.link
    }

    /// Asks the link task to drop this connection.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

impl RemoteChannel for LinkChannel {
    fn send(&mut self, request: OutboundRequest) -> Result<(), ChannelClosed> {
        self.tx
            .send(Outbound::Request(request))
            .map_err(|_| ChannelClosed)
    }
}

trait LinkStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkStream for T {}

enum Exit {
    Lost(String),
    Shutdown,
}

pub async fn run(
    config: LinkConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut link = 0u64;
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let opened = tokio::select! {
            opened = open(&config.endpoint) => opened,
            _ = shutdown.changed() => break,
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    event = "link_connect_error",
                    endpoint = %config.endpoint,
                    error = %err,
                    retry_ms = backoff.as_millis() as u64
                );
                if pause(backoff, &mut shutdown).await {
                    break;
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;
        link += 1;
        info!(event = "link_open", link, endpoint = %config.endpoint);

        let reason = match serve(link, stream, &config, &events, &mut shutdown).await {
            Exit::Lost(reason) => reason,
            Exit::Shutdown => break,
        };
        info!(event = "link_closed", link, reason = %reason);
        if events.send(LinkEvent::Disconnected { link, reason }).is_err() {
            break;
        }
        if !config.reconnect_delay.is_zero() && pause(config.reconnect_delay, &mut shutdown).await {
            break;
        }
    }
    debug!(event = "link_stopped", links = link);
}

async fn open(endpoint: &Endpoint) -> io::Result<Box<dyn LinkStream>> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        )),
    }
}

async fn serve(
    link: u64,
    stream: Box<dyn LinkStream>,
    config: &LinkConfig,
    events: &mpsc::UnboundedSender<LinkEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Exit {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = LinkChannel { link, tx };
    if events.send(LinkEvent::Connecting { link, channel }).is_err() {
        return Exit::Shutdown;
    }

    let hello = WireEnvelope::new(
        config.client_id.as_str(),
        WireMsg::Hello(HelloPayload {
            client_id: config.client_id.clone(),
            role: "console".to_string(),
            capabilities: vec!["notify".to_string(), "multicall".to_string()],
        }),
    );
    if let Err(err) = write_envelope(&mut writer, &hello).await {
        return Exit::Lost(format!("hello failed: {err}"));
    }

    let mut decoder = FrameDecoder::<WireEnvelope>::default();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut ready = false;
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => return Exit::Lost("closed by server".to_string()),
                    Ok(n) => n,
                    Err(err) => return Exit::Lost(format!("read failed: {err}")),
                };
                let report = decoder.push_chunk(&buf[..n]);
                for err in report.errors {
                    warn!(event = "link_decode_error", link, error = %err);
                }
                for envelope in report.frames {
                    if !envelope.version.is_supported() {
                        warn!(event = "link_unsupported_version", link, version = envelope.version.0);
                        continue;
                    }
                    let event = match envelope.msg {
                        WireMsg::Welcome(welcome) => {
                            if ready {
                                debug!(event = "link_duplicate_welcome", link);
                                continue;
                            }
                            ready = true;
                            LinkEvent::Ready {
                                link,
                                server_id: welcome.server_id,
                                motd: welcome.motd,
                            }
                        }
                        msg @ (WireMsg::Reply(_) | WireMsg::Error(_) | WireMsg::Notify(_)) => {
                            if !ready {
                                warn!(event = "link_frame_before_welcome", link, kind = msg.kind());
                                continue;
                            }
                            LinkEvent::Message { link, msg }
                        }
                        other => {
                            debug!(event = "link_unexpected_frame", link, kind = other.kind());
                            continue;
                        }
                    };
                    if events.send(event).is_err() {
                        return Exit::Shutdown;
                    }
                }
            }
            Some(outbound) = rx.recv() => match outbound {
                Outbound::Request(request) => {
                    let envelope = WireEnvelope::new(config.client_id.as_str(), request.into_wire());
                    if let Err(err) = write_envelope(&mut writer, &envelope).await {
                        return Exit::Lost(format!("write failed: {err}"));
                    }
                }
                Outbound::Close => return Exit::Lost("dropped by session".to_string()),
            },
            _ = shutdown.changed() => return Exit::Shutdown,
        }
    }
}

async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &WireEnvelope,
) -> io::Result<()> {
    let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Returns true when shutdown was requested while waiting.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}

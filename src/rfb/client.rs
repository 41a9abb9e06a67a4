use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::protocol::{self, PixelFormat, RectHeader, ServerInit};
use super::{RfbError, RfbEvent};
use crate::framebuffer::Framebuffer;

pub const DEFAULT_FRAME_RATE: u32 = 60;

const EVENT_CAPACITY: usize = 64;

/// Run one RFB connection over `stream` until the server closes it or a
/// protocol error occurs.
///
/// Returns `Ok(())` when the server closes the connection between messages.
pub async fn run_session<S>(
    mut stream: S,
    framebuffer: &Framebuffer,
    frame_rate: u32,
    events: &broadcast::Sender<RfbEvent>,
) -> Result<(), RfbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let init = handshake(&mut stream).await?;
    tracing::info!(
        name = %init.name,
        width = init.width,
        height = init.height,
        server_bpp = init.pixel_format.bits_per_pixel,
        "vnc connected"
    );

    framebuffer.resize(init.width, init.height);
    let _ = events.send(RfbEvent::Resized {
        width: init.width,
        height: init.height,
    });
    let _ = events.send(RfbEvent::Connected {
        name: init.name.clone(),
    });

    stream
        .write_all(&protocol::set_pixel_format(&PixelFormat::CLIENT))
        .await?;
    stream
        .write_all(&protocol::set_encodings(&[protocol::ENCODING_RAW]))
        .await?;

    update_loop(&mut stream, framebuffer, frame_rate, events).await
}

/// Version, security and init exchange. Nothing is written until the
/// server's banner has been accepted.
async fn handshake<S>(stream: &mut S) -> Result<ServerInit, RfbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut banner = [0u8; protocol::BANNER_LEN];
    stream.read_exact(&mut banner).await?;
    let (major, minor) = protocol::parse_version(&banner)
        .ok_or_else(|| RfbError::BadBanner(String::from_utf8_lossy(&banner).into_owned()))?;
    if (major, minor) < protocol::MIN_VERSION {
        return Err(RfbError::UnsupportedVersion { major, minor });
    }
    stream.write_all(protocol::PROTOCOL_VERSION).await?;

    let count = stream.read_u8().await?;
    if count == 0 {
        let reason = protocol::read_string(stream).await?;
        return Err(RfbError::ServerRefused(reason));
    }
    let mut types = vec![0u8; count as usize];
    stream.read_exact(&mut types).await?;
    if !types.contains(&protocol::SECURITY_NONE) {
        return Err(RfbError::AuthRequired(types));
    }
    stream.write_u8(protocol::SECURITY_NONE).await?;

    let result = stream.read_u32().await?;
    if result != protocol::SECURITY_RESULT_OK {
        let reason = protocol::read_string(stream).await?;
        return Err(RfbError::AuthFailed(reason));
    }

    // ClientInit: shared.
    stream.write_u8(1).await?;
    ServerInit::read_from(stream).await
}

async fn update_loop<S>(
    stream: &mut S,
    framebuffer: &Framebuffer,
    frame_rate: u32,
    events: &broadcast::Sender<RfbEvent>,
) -> Result<(), RfbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pace = Duration::from_millis(1000 / u64::from(frame_rate.max(1)));
    let bpp = PixelFormat::CLIENT.bytes_per_pixel();
    let mut incremental = false;

    loop {
        let (width, height) = framebuffer.size();
        stream
            .write_all(&protocol::update_request(incremental, 0, 0, width, height))
            .await?;
        incremental = true;

        let msg_type = match stream.read_u8().await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if msg_type != protocol::MSG_FRAMEBUFFER_UPDATE {
            return Err(RfbError::UnsupportedMessage(msg_type));
        }

        let _padding = stream.read_u8().await?;
        let rectangles = stream.read_u16().await?;
        for _ in 0..rectangles {
            let rect = RectHeader::read_from(stream).await?;
            if rect.encoding != protocol::ENCODING_RAW {
                return Err(RfbError::UnsupportedEncoding(rect.encoding));
            }
            let mut data = vec![0u8; rect.width as usize * rect.height as usize * bpp];
            stream.read_exact(&mut data).await?;
            framebuffer.blit_raw(rect.x, rect.y, rect.width, rect.height, &data);
        }
        let _ = events.send(RfbEvent::Updated { rectangles });

        tokio::time::sleep(pace).await;
    }
}

/// A VNC client running on its own task.
///
/// The connection is made once; when it ends, a `Disconnected` event is
/// published and the task finishes. Reconnecting is up to the owner.
pub struct VncConnection {
    shutdown: CancellationToken,
    events: broadcast::Sender<RfbEvent>,
    task: tokio::task::JoinHandle<Result<(), RfbError>>,
}

impl VncConnection {
    /// Connect to `address` and stream its screen into `framebuffer`.
    ///
    /// The returned receiver is subscribed before the task starts, so it sees
    /// every event.
    pub fn spawn(
        address: String,
        framebuffer: Framebuffer,
        frame_rate: u32,
    ) -> (Self, broadcast::Receiver<RfbEvent>) {
        let (events, rx) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(connection_task(
            address,
            framebuffer,
            frame_rate,
            events.clone(),
            shutdown.clone(),
        ));
        (
            Self {
                shutdown,
                events,
                task,
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RfbEvent> {
        self.events.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the socket and stop the client loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the client task to complete. Consumes the handle.
    pub async fn join(self) -> Result<(), RfbError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(RfbError::Io(std::io::Error::other(e))),
        }
    }
}

async fn connection_task(
    address: String,
    framebuffer: Framebuffer,
    frame_rate: u32,
    events: broadcast::Sender<RfbEvent>,
    shutdown: CancellationToken,
) -> Result<(), RfbError> {
    let session = async {
        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;
        run_session(stream, &framebuffer, frame_rate, &events).await
    };

    let result = tokio::select! {
        result = session => result,
        _ = shutdown.cancelled() => {
            tracing::debug!(address = %address, "vnc client shut down");
            Ok(())
        }
    };

    match &result {
        Ok(()) => tracing::info!(address = %address, "vnc disconnected"),
        Err(e) => tracing::warn!(address = %address, error = %e, "vnc disconnected"),
    }
    let _ = events.send(RfbEvent::Disconnected {
        reason: result.as_ref().err().map(ToString::to_string),
    });
    result
}

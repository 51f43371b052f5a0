//! Password-gated firmware update listener.
//!
//! Line protocol over TCP, one upload per connection:
//!
//! ```text
//! client: AUTH <password>\n     server: OK\n | ERR auth\n
//! client: SIZE <bytes>\n        server: OK\n | ERR size\n
//! client: <bytes raw octets>    server: OK\n
//! ```
//!
//! Connections are served by a background task so a slow client never
//! stalls the cycle; [`UpdateService::handle`] only collects finished
//! uploads.  The image is written to `<staging_dir>/firmware.bin.part` and
//! renamed to `firmware.bin` once complete.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Longest silence tolerated from a client.
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on one whole upload, however steadily the client trickles.
const UPLOAD_DEADLINE: Duration = Duration::from_secs(300);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(500);
const CHUNK: usize = 4096;

/// A complete image ready to be applied on the next boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Remote update capability, serviced once per cycle pass.
#[allow(async_fn_in_trait)]
pub trait UpdateService {
    /// Start listening.  Called once after the link is up.
    async fn begin(&mut self) -> Result<()>;
    /// Report at most one finished upload.  Never waits for a client.
    fn handle(&mut self) -> Result<Option<StagedImage>>;
}

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub hostname: String,
    pub password: String,
    pub bind: SocketAddr,
    pub staging_dir: PathBuf,
    pub max_image_bytes: u64,
}

type Outcome = Result<StagedImage>;

pub struct TcpUpdateListener {
    settings: Arc<UpdateSettings>,
    local_addr: Option<SocketAddr>,
    finished: Option<mpsc::UnboundedReceiver<Outcome>>,
    server: Option<JoinHandle<()>>,
}

impl TcpUpdateListener {
    pub fn new(settings: UpdateSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            local_addr: None,
            finished: None,
            server: None,
        }
    }

    /// Bound address, once [`UpdateService::begin`] has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for TcpUpdateListener {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

impl UpdateService for TcpUpdateListener {
    async fn begin(&mut self) -> Result<()> {
        let listener = TcpListener::bind(self.settings.bind)
            .await
            .with_context(|| format!("binding update listener on {}", self.settings.bind))?;
        let addr = listener.local_addr()?;
        info!(hostname = %self.settings.hostname, %addr, "update listener ready");

        let (done, finished) = mpsc::unbounded_channel();
        self.server = Some(tokio::spawn(serve(listener, Arc::clone(&self.settings), done)));
        self.finished = Some(finished);
        self.local_addr = Some(addr);
        Ok(())
    }

    fn handle(&mut self) -> Result<Option<StagedImage>> {
        let Some(finished) = self.finished.as_mut() else {
            return Ok(None);
        };
        match finished.try_recv() {
            Ok(outcome) => outcome.map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.finished = None;
                bail!("update listener stopped")
            }
        }
    }
}

/// Accept loop.  Uploads are taken one at a time.
async fn serve(
    listener: TcpListener,
    settings: Arc<UpdateSettings>,
    done: mpsc::UnboundedSender<Outcome>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accepting update connection: {e}");
                sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        info!(%peer, "update client connected");
        let outcome = match timeout(UPLOAD_DEADLINE, receive(&settings, stream)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow!("upload not finished within {UPLOAD_DEADLINE:?}")),
        };
        if let Err(e) = &outcome {
            error!(%peer, "update error: {e:#}");
        }
        if done.send(outcome).is_err() {
            return;
        }
    }
}

async fn receive(settings: &UpdateSettings, stream: TcpStream) -> Result<StagedImage> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let auth = read_line(&mut reader).await?;
    if auth.strip_prefix("AUTH ") != Some(settings.password.as_str()) {
        writer.write_all(b"ERR auth\n").await?;
        bail!("authentication failed");
    }
    writer.write_all(b"OK\n").await?;

    let size = read_line(&mut reader).await?;
    let accepted = size
        .strip_prefix("SIZE ")
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0 && *n <= settings.max_image_bytes);
    let Some(bytes) = accepted else {
        writer.write_all(b"ERR size\n").await?;
        bail!("rejected image size {size:?}");
    };
    writer.write_all(b"OK\n").await?;

    info!(bytes, "update start");
    let staged = stage(settings, &mut reader, bytes).await?;
    writer.write_all(b"OK\n").await?;
    info!(path = %staged.path.display(), "update end");
    Ok(staged)
}

async fn stage(
    settings: &UpdateSettings,
    body: &mut (impl AsyncRead + Unpin),
    bytes: u64,
) -> Result<StagedImage> {
    let dir = &settings.staging_dir;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let part = dir.join("firmware.bin.part");
    let done = dir.join("firmware.bin");

    let mut file = File::create(&part)
        .await
        .with_context(|| format!("creating {}", part.display()))?;
    let mut buf = [0u8; CHUNK];
    let mut received: u64 = 0;
    let mut last_decile = 0;
    while received < bytes {
        let want = usize::try_from(bytes - received).map_or(CHUNK, |r| r.min(CHUNK));
        let n = timeout(READ_TIMEOUT, body.read(&mut buf[..want]))
            .await
            .map_err(|_| anyhow!("client idle for {READ_TIMEOUT:?}"))?
            .context("receiving image")?;
        if n == 0 {
            bail!("connection closed after {received} of {bytes} bytes");
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;

        let decile = received * 10 / bytes;
        if decile > last_decile {
            last_decile = decile;
            info!(percent = decile * 10, "update progress");
        }
    }
    file.sync_all().await?;
    fs::rename(&part, &done)
        .await
        .with_context(|| format!("replacing {}", done.display()))?;
    Ok(StagedImage {
        path: done,
        bytes: received,
    })
}

async fn read_line(reader: &mut (impl AsyncBufRead + Unpin)) -> Result<String> {
    let mut line = String::new();
    let n = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("client idle for {READ_TIMEOUT:?}"))??;
    if n == 0 {
        warn!("update client hung up");
        bail!("connection closed before command");
    }
    Ok(line.trim_end().to_string())
}

// ===========================================================================
// Tests
// ===========================================================================

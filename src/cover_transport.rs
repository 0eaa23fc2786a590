//! HTTP transport for cover downloads.

use std::io::{self, ErrorKind, Read};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::LibraryError;

const BODY_CHUNK_SIZE: usize = 16 * 1024;
const BODY_CHANNEL_DEPTH: usize = 4;

/// Certificate validation for cover servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    /// Normal chain and hostname validation.
    #[default]
    SystemRoots,
    /// Accept any certificate and hostname. Only for self-hosted servers.
    AcceptAnyCertificate,
}

/// Unblocks a pending read on a [`CoverBody`] from another thread.
pub type ShutdownHook = Box<dyn FnOnce() + Send + 'static>;

/// Response body of a cover request.
///
/// When `shutdown` is set, calling it makes the current and every later read
/// fail with `ConnectionAborted`.
pub struct CoverBody {
    pub reader: Box<dyn Read + Send>,
    pub shutdown: Option<ShutdownHook>,
}

impl CoverBody {
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            shutdown: None,
        }
    }

    pub fn with_shutdown<F>(mut self, shutdown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.shutdown = Some(Box::new(shutdown));
        self
    }

    /// Moves the blocking reads of `reader` onto their own thread so the body
    /// can be shut down while a read is pending. The thread exits at the end
    /// of the body or once the returned body is dropped.
    pub fn detached(mut reader: Box<dyn Read + Send>) -> Result<Self, LibraryError> {
        let (sender, receiver) = mpsc::sync_channel::<io::Result<Vec<u8>>>(BODY_CHANNEL_DEPTH);
        let abort_sender = sender.clone();
        thread::Builder::new()
            .name("cover-body".to_string())
            .spawn(move || pump_body(reader.as_mut(), &sender))
            .map_err(|err| {
                LibraryError::Transport(format!("failed to start cover body reader: {err}"))
            })?;
        let body = ChannelBody {
            receiver,
            pending: Vec::new(),
            offset: 0,
        };
        Ok(Self::new(Box::new(body)).with_shutdown(move || {
            let aborted = io::Error::new(ErrorKind::ConnectionAborted, "cover transfer shut down");
            // A full channel means the reader is not blocked and sees the
            // cancellation at its next chunk.
            let _ = abort_sender.try_send(Err(aborted));
        }))
    }
}

fn pump_body(reader: &mut dyn Read, sender: &SyncSender<io::Result<Vec<u8>>>) {
    loop {
        let mut chunk = vec![0u8; BODY_CHUNK_SIZE];
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => {
                chunk.truncate(read);
                if sender.send(Ok(chunk)).is_err() {
                    debug!("CoverTransport: body dropped before the end of the response");
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                let _ = sender.send(Err(err));
                break;
            }
        }
    }
}

struct ChannelBody {
    receiver: Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
}

impl Read for ChannelBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset == self.pending.len() {
            match self.receiver.recv() {
                Ok(Ok(chunk)) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Ok(Err(err)) => return Err(err),
                // The pump hung up after the last chunk.
                Err(_) => return Ok(0),
            }
        }
        let available = &self.pending[self.offset..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.offset += count;
        Ok(count)
    }
}

/// Opens a cover URL and yields the response body as a stream.
///
/// Returning means the response headers arrived with a success status.
pub trait CoverTransport: Send + Sync {
    fn open(&self, url: &str) -> Result<CoverBody, LibraryError>;
}

/// `ureq` transport with an overall transfer timeout.
pub struct HttpCoverTransport {
    http_client: ureq::Agent,
}

impl HttpCoverTransport {
    pub fn new(policy: TrustPolicy, transfer_timeout: Duration) -> Result<Self, LibraryError> {
        let mut builder = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(15))
            .timeout(transfer_timeout);
        if policy == TrustPolicy::AcceptAnyCertificate {
            warn!("CoverTransport: certificate validation is disabled for cover downloads");
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|err| {
                    LibraryError::Transport(format!("failed to create tls connector: {err}"))
                })?;
            builder = builder.tls_connector(Arc::new(connector));
        }
        Ok(Self {
            http_client: builder.build(),
        })
    }
}

impl CoverTransport for HttpCoverTransport {
    fn open(&self, url: &str) -> Result<CoverBody, LibraryError> {
        let response = self
            .http_client
            .get(url)
            .set("Accept", "image/*")
            .call()
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => {
                    LibraryError::Transport(format!("cover request returned HTTP {code}"))
                }
                other => LibraryError::Transport(format!("cover request failed: {other}")),
            })?;
        CoverBody::detached(response.into_reader())
    }
}

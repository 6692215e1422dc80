use std::{fmt, io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::{debug, warn};

use crate::{
    collab::{Alerter, LogAlerter, PeerClassifier, PeerLabel, UnknownClassifier},
    sink::LogSink,
};

pub const REPLY_PREFIX: &str = "Message received: ";
pub const NOT_RECORDED_PREFIX: &str = "Message not recorded: ";

/// Everything connection handlers share. Nothing else crosses handler boundaries.
pub struct Services {
    pub sink: LogSink,
    pub alerter: Arc<dyn Alerter>,
    pub classifier: Arc<dyn PeerClassifier>,
}

impl Services {
    pub fn new(sink: LogSink) -> Self {
        Self {
            sink,
            alerter: Arc::new(LogAlerter),
            classifier: Arc::new(UnknownClassifier),
        }
    }

    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn PeerClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Records an activity line, escalating to the alerter if the activity log is down.
    pub async fn report(&self, text: &str) {
        if let Err(err) = self.sink.record_activity(text).await {
            warn!(error = %err, "activity log unavailable");
            self.alerter.alert(
                "activity log unavailable",
                &format!("{err}\nunrecorded event: {text}"),
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Active,
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    ClosedByPeer,
    Reset,
    Error(String),
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::ClosedByPeer => f.write_str("closed by peer"),
            CloseCause::Reset => f.write_str("reset"),
            CloseCause::Error(detail) => write!(f, "error: {detail}"),
        }
    }
}

impl From<io::Error> for CloseCause {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => CloseCause::Reset,
            _ => CloseCause::Error(err.to_string()),
        }
    }
}

struct Connection {
    peer: SocketAddr,
    state: ConnectionState,
}

impl Connection {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: ConnectionState::Accepted,
        }
    }

    fn mark_read(&mut self) {
        if self.state == ConnectionState::Accepted {
            debug!(peer = %self.peer, "connection active");
            self.state = ConnectionState::Active;
        }
    }

    fn close(&mut self, cause: &CloseCause) {
        debug!(peer = %self.peer, from = ?self.state, %cause, "connection closed");
        self.state = ConnectionState::Closed;
    }
}

pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    services: Arc<Services>,
    max_message_bytes: usize,
) -> CloseCause {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;
    serve(&mut reader, &mut writer, peer, &services, max_message_bytes).await
}

/// Drives one connection from accept to close and returns why it closed.
///
/// Every non-blank line is written to the message log before its
/// acknowledgement is sent back.
pub async fn serve<R, W>(
    reader: &mut R,
    writer: &mut W,
    peer: SocketAddr,
    services: &Services,
    max_message_bytes: usize,
) -> CloseCause
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut connection = Connection::new(peer);
    let greeting = match services.classifier.classify(peer.ip()) {
        PeerLabel::Known(label) => format!("connection established from {peer} ({label})"),
        PeerLabel::Unknown => format!("connection established from {peer}"),
    };
    services.report(&greeting).await;

    let cause = loop {
        let text = match read_line_limited(reader, max_message_bytes).await {
            Ok(Some(text)) => text,
            Ok(None) => break CloseCause::ClosedByPeer,
            Err(err) => break err.into(),
        };
        connection.mark_read();

        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if let Err(err) = process_message(writer, peer, text, services).await {
            break err.into();
        }
    };

    connection.close(&cause);
    if let Err(err) = writer.shutdown().await {
        debug!(%peer, ?err, "socket already gone during shutdown");
    }
    services
        .report(&format!("connection with {peer} closed: {cause}"))
        .await;
    cause
}

async fn process_message<W>(
    writer: &mut W,
    peer: SocketAddr,
    text: &str,
    services: &Services,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reply = match services.sink.record_message(peer.ip(), text).await {
        Ok(()) => {
            services
                .report(&format!("message from {}: {text}", peer.ip()))
                .await;
            format!("{REPLY_PREFIX}{text}\n")
        }
        Err(err) => {
            warn!(%peer, error = %err, "message not recorded");
            services
                .report(&format!("message log write failed for {peer}: {err}"))
                .await;
            format!("{NOT_RECORDED_PREFIX}{text}\n")
        }
    };

    writer.write_all(reply.as_bytes()).await?;
    writer.flush().await
}

/// Reads one `\n`-terminated line of at most `limit` bytes, not counting the
/// `\n` or `\r\n` terminator.
///
/// Returns `Ok(None)` on a clean end of stream. A final line without a
/// terminator is still returned.
pub async fn read_line_limited<R>(reader: &mut R, limit: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take((limit as u64).saturating_add(2))
        .read_until(b'\n', &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if buf.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message exceeds {limit} bytes"),
        ));
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

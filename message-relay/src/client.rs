use std::{io, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};
use tracing::{info, warn};

pub const EXIT_SENTINEL: &str = "exit";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {addr} after {}s", after.as_secs())]
    ConnectTimeout { addr: String, after: Duration },
    #[error("no reply from server within {}s", .0.as_secs())]
    ReadTimeout(Duration),
    #[error("server closed the connection")]
    Closed,
    #[error("messages must fit on a single line")]
    MultiLine,
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    options: ClientOptions,
}

impl Client {
    /// Connects once, giving up after `options.connect_timeout`.
    pub async fn connect(host: &str, port: u16, options: ClientOptions) -> Result<Self, ClientError> {
        let addr = format!("{host}:{port}");
        let stream = match timeout(options.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ClientError::Connect { addr, source }),
            Err(_) => {
                return Err(ClientError::ConnectTimeout {
                    addr,
                    after: options.connect_timeout,
                });
            }
        };

        let peer = stream.peer_addr()?;
        info!(%peer, "connected");
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            peer,
            options,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Sends one message and waits for its reply line.
    ///
    /// A timeout and a closed connection are errors; an empty reply line is
    /// returned as `Ok("")`.
    pub async fn send_and_receive(&mut self, text: &str) -> Result<String, ClientError> {
        if text.contains('\n') {
            return Err(ClientError::MultiLine);
        }

        let mut frame = String::with_capacity(text.len() + 1);
        frame.push_str(text);
        frame.push('\n');
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.flush().await?;

        let wait = self.options.read_timeout;
        let mut reply = String::new();
        let read = timeout(wait, self.reader.read_line(&mut reply))
            .await
            .map_err(|_| ClientError::ReadTimeout(wait))??;
        if read == 0 {
            return Err(ClientError::Closed);
        }
        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }

    pub async fn close(mut self) {
        if let Err(error) = self.writer.shutdown().await {
            warn!(?error, "failed to shutdown client writer cleanly");
        }
    }
}

/// Reads lines from `input`, sends each one, and prints the replies to `output`.
///
/// Stops at `exit`, end of input, or the first send/receive failure.
pub async fn run_interactive<I, O>(client: &mut Client, input: &mut I, output: &mut O) -> io::Result<()>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    write_line(output, &format!("connected to {}", client.peer_addr())).await?;
    write_line(output, &format!("type messages to send ('{EXIT_SENTINEL}' to quit)")).await?;

    let mut line = String::new();
    loop {
        output.write_all(b">>> ").await?;
        output.flush().await?;

        line.clear();
        if input.read_line(&mut line).await? == 0 {
            write_line(output, "closing connection").await?;
            break;
        }

        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text.eq_ignore_ascii_case(EXIT_SENTINEL) {
            write_line(output, "closing connection").await?;
            break;
        }

        match client.send_and_receive(text).await {
            Ok(reply) => write_line(output, &format!("Response: {reply}")).await?,
            Err(err) => {
                write_line(output, &format!("error: {err}")).await?;
                break;
            }
        }
    }

    Ok(())
}

async fn write_line<O>(output: &mut O, line: &str) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}

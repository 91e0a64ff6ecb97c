use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use smtp_proto::Request;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};

use crate::smtp::auth::AuthPolicy;
use crate::smtp::session::{DataReply, SessionReply, SmtpSession};
use crate::store::MessageStore;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),
    #[error("failed to write tcp stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
    #[error("command timed out")]
    Timeout,
}

const BUFFER_SIZE: usize = 1024;
const CODE_READY: u16 = 220;

enum LoopExit {
    Quit,
    StartTls,
}

/// Drives a single SMTP connection end to end, including an optional
/// mid-session `STARTTLS` upgrade (spec §4.8, §6: "Optional STARTTLS on
/// same port"). `tls_acceptor` being `None` means the capability is not
/// offered at `EHLO` and `STARTTLS` is rejected as unimplemented.
pub async fn handle(
    stream: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin),
    server_name: &str,
    peer_addr: SocketAddr,
    message_store: Arc<dyn MessageStore>,
    auth_policy: Arc<AuthPolicy>,
    max_body_bytes: u64,
    command_timeout: Duration,
    tls_acceptor: Option<&TlsAcceptor>,
) -> Result<(), ConnectionError> {
    let mut session = SmtpSession::new(peer_addr, message_store, auth_policy, max_body_bytes, tls_acceptor.is_some());
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);

    let (source, mut sink) = tokio::io::split(stream);
    let mut reader = BufReader::new(source);

    trace!("handling connection with {}", session.peer());

    write_reply(CODE_READY, server_name, &mut sink).await?;

    match run_session_loop(&mut session, &mut reader, &mut sink, &mut buffer, command_timeout).await? {
        LoopExit::Quit => {
            info!("connection handled");
            return Ok(());
        }
        LoopExit::StartTls => {}
    }

    // `SmtpSession` only emits `StartTls` when it was constructed with
    // `tls_available`, so `tls_acceptor` is always `Some` here.
    let Some(acceptor) = tls_acceptor else {
        return Ok(());
    };

    let plain = reader.into_inner().unsplit(sink);
    let mut tls_stream = acceptor.accept(plain).await.map_err(ConnectionError::Accept)?;
    session.mark_tls_active();

    let (source, mut sink) = tokio::io::split(&mut tls_stream);
    let mut reader = BufReader::new(source);

    // `tls_active` makes `SmtpSession::handle` reject a second
    // `STARTTLS`, so `StartTls` never recurs here.
    let _ = run_session_loop(&mut session, &mut reader, &mut sink, &mut buffer, command_timeout).await?;

    drop(reader);
    drop(sink);
    tls_stream.shutdown().await.map_err(ConnectionError::Write)?;

    info!("connection handled");
    Ok(())
}

async fn run_session_loop(
    session: &mut SmtpSession,
    reader: &mut (impl AsyncBufReadExt + Unpin),
    sink: &mut (impl AsyncWriteExt + Unpin),
    buffer: &mut Vec<u8>,
    command_timeout: Duration,
) -> Result<LoopExit, ConnectionError> {
    loop {
        read_line(&mut *reader, buffer, command_timeout).await?;

        let request = Request::parse(&mut buffer.iter());

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut *sink).await?;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(code, &message, &mut *sink).await?;
                return Ok(LoopExit::Quit);
            }
            SessionReply::RawReply(buf) => {
                sink.write_all(&buf).await.map_err(ConnectionError::Write)?;
            }
            SessionReply::IngestData(code, message) => {
                write_reply(code, &message, &mut *sink).await?;
                ingest_data(session, &mut *reader, &mut *sink, buffer, command_timeout).await?;
            }
            SessionReply::IngestAuth(code, message) => {
                write_reply(code, &message, &mut *sink).await?;
                read_buf(&mut *reader, buffer, command_timeout).await?;
                let (code, message) = session.handle_auth_continuation(buffer).await;
                write_reply(code, &message, &mut *sink).await?;
            }
            SessionReply::StartTls(code, message) => {
                write_reply(code, &message, &mut *sink).await?;
                return Ok(LoopExit::StartTls);
            }
        }
    }
}

async fn ingest_data(
    session: &mut SmtpSession,
    reader: &mut (impl AsyncBufReadExt + Unpin),
    sink: &mut (impl AsyncWriteExt + Unpin),
    buffer: &mut Vec<u8>,
    command_timeout: Duration,
) -> Result<(), ConnectionError> {
    loop {
        read_buf(&mut *reader, buffer, command_timeout).await?;

        match session.handle_data(buffer).await {
            DataReply::ContinueIngest => continue,
            DataReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut *sink).await?;
                return Ok(());
            }
        }
    }
}

async fn read_buf(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
    command_timeout: Duration,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    tokio::time::timeout(command_timeout, reader.take(BUFFER_SIZE as u64).read_buf(buffer))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::Read)
        .and_then(|size| if size > 0 { Ok(size) } else { Err(ConnectionError::Dropped) })
}

async fn read_line(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
    command_timeout: Duration,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    tokio::time::timeout(command_timeout, reader.take(BUFFER_SIZE as u64).read_until(b'\n', buffer))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::Read)
        .and_then(|size| if size > 0 { Ok(size) } else { Err(ConnectionError::Dropped) })
}

async fn write_reply(code: u16, message: &str, mut sink: impl AsyncWriteExt + Unpin) -> Result<(), ConnectionError> {
    let n = sink
        .write(format!("{code} {message}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)?;

    if n < 256 {
        debug!("sent: {} {}", code, message);
    } else {
        trace!("sent {} bytes", n);
    }

    Ok(())
}

// SPDX-License-Identifier: GPL-2.0-or-later

use crate::path_manager::PathManager;
use crate::rtp::{parse_rtp_header, H264Depacketizer};
use crate::session::{new_session_id, Session};
use common::{time::UnixH264, ArcLogger, LogEntry, LogLevel};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const READ_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUF_SIZE: usize = 2048;

// Accepts RTSP/1.0 connections and drives each through a `Session`. One
// connection may ANNOUNCE+RECORD (publish) or DESCRIBE+SETUP+PLAY (read);
// interleaved RTP/RTCP frames ride the same TCP stream per RFC 2326 §10.12.
pub struct RtspServer {
    addr: SocketAddr,
    path_manager: PathManager,
    logger: ArcLogger,
    live_session_ids: Arc<Mutex<HashSet<u64>>>,
}

impl RtspServer {
    #[must_use]
    pub fn new(addr: SocketAddr, path_manager: PathManager, logger: ArcLogger) -> Self {
        Self {
            addr,
            path_manager,
            logger,
            live_session_ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.logger.log(LogEntry::new(
            LogLevel::Info,
            "rtsp",
            None,
            format!("rtsp server listening on {}", self.addr),
        ));
        loop {
            tokio::select! {
                () = token.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let path_manager = self.path_manager.clone();
                    let logger = self.logger.clone();
                    let live_ids = self.live_session_ids.clone();
                    let conn_token = token.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, path_manager, live_ids.clone(), conn_token).await {
                            logger.log(LogEntry::new(
                                LogLevel::Debug,
                                "rtsp",
                                None,
                                format!("rtsp connection from {peer} ended: {e}"),
                            ));
                        }
                    });
                }
            }
        }
    }
}

#[derive(Debug)]
struct Request {
    method: String,
    uri: String,
    cseq: String,
    content_length: usize,
}

enum ConnEvent {
    Request(Request),
    RtpFrame { channel: u8, payload: Vec<u8> },
    Eof,
}

const INTERLEAVED_FRAME_MARKER: u8 = 0x24; // '$'

// A connection multiplexes RTSP/1.0 text requests and, once a track is set
// up with an interleaved channel, binary RTP/RTCP frames prefixed by `$`
// (RFC 2326 §10.12). Peek the first byte to tell them apart.
async fn read_event(
    reader: &mut BufReader<tokio::net::tcp::ReadHalf<'_>>,
) -> std::io::Result<ConnEvent> {
    let marker = tokio::time::timeout(READ_WRITE_TIMEOUT, reader.fill_buf())
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;
    if marker.is_empty() {
        return Ok(ConnEvent::Eof);
    }

    if marker[0] == INTERLEAVED_FRAME_MARKER {
        let mut header = [0u8; 4];
        tokio::time::timeout(READ_WRITE_TIMEOUT, reader.read_exact(&mut header))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;
        let channel = header[1];
        let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
        let mut payload = vec![0u8; len];
        tokio::time::timeout(READ_WRITE_TIMEOUT, reader.read_exact(&mut payload))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;
        return Ok(ConnEvent::RtpFrame { channel, payload });
    }

    let mut line = String::new();
    let n = tokio::time::timeout(READ_WRITE_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;
    if n == 0 {
        return Ok(ConnEvent::Eof);
    }
    let mut parts = line.trim_end().splitn(3, ' ');
    let method = parts.next().unwrap_or_default().to_owned();
    let uri = parts.next().unwrap_or_default().to_owned();

    let mut cseq = String::new();
    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        let n = tokio::time::timeout(READ_WRITE_TIMEOUT, reader.read_line(&mut header))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;
        if n == 0 || header.trim_end().is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "cseq" => cseq = value.trim().to_owned(),
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                _ => {}
            }
        }
    }

    Ok(ConnEvent::Request(Request {
        method,
        uri,
        cseq,
        content_length,
    }))
}

fn path_name_from_uri(uri: &str) -> String {
    uri.rsplit('/').next().unwrap_or(uri).to_owned()
}

async fn write_response(
    writer: &mut tokio::net::tcp::WriteHalf<'_>,
    cseq: &str,
    status: &str,
) -> std::io::Result<()> {
    let resp = format!("RTSP/1.0 {status}\r\nCSeq: {cseq}\r\n\r\n");
    tokio::time::timeout(READ_WRITE_TIMEOUT, writer.write_all(resp.as_bytes()))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"))??;
    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    path_manager: PathManager,
    live_ids: Arc<Mutex<HashSet<u64>>>,
    token: CancellationToken,
) -> std::io::Result<()> {
    let id = new_session_id(&live_ids);
    let session = Arc::new(Session::new(id, path_manager));
    let mut depacketizer = H264Depacketizer::new();

    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::with_capacity(READ_BUF_SIZE, read_half);

    let result = loop {
        tokio::select! {
            () = token.cancelled() => break Ok(()),
            event = read_event(&mut reader) => {
                match event? {
                    ConnEvent::Eof => break Ok(()),
                    ConnEvent::RtpFrame { channel, payload } => {
                        // Even channels carry RTP; odd channels carry RTCP,
                        // which this server doesn't act on.
                        if channel % 2 != 0 {
                            continue;
                        }
                        let Ok((header, rtp_payload)) = parse_rtp_header(&payload) else { continue };
                        if let Some(nals) = depacketizer.push(rtp_payload, header.marker) {
                            let pts = pts_from_rtp_timestamp(header.timestamp, 90_000);
                            _ = session.on_packet_access_unit(0, nals, pts).await;
                        }
                    }
                    ConnEvent::Request(req) => {
                        if req.content_length > 0 {
                            let mut body = vec![0u8; req.content_length];
                            tokio::time::timeout(READ_WRITE_TIMEOUT, reader.read_exact(&mut body)).await
                                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;
                        }
                        let path_name = path_name_from_uri(&req.uri);
                        let status = dispatch(&session, &req.method, &path_name).await;
                        write_response(&mut write_half, &req.cseq, status).await?;
                        if req.method.eq_ignore_ascii_case("TEARDOWN") {
                            break Ok(());
                        }
                    }
                }
            }
        }
    };

    session.on_conn_close().await;
    live_ids.lock().expect("lock not poisoned").remove(&id);
    result
}

async fn dispatch(session: &Session, method: &str, path_name: &str) -> &'static str {
    match method.to_ascii_uppercase().as_str() {
        "OPTIONS" => "200 OK",
        "DESCRIBE" => match session.on_describe(path_name).await {
            Ok(_) => "200 OK",
            Err(_) => "404 Not Found",
        },
        "ANNOUNCE" => match session.on_announce(path_name).await {
            Ok(()) => "200 OK",
            Err(crate::error::PublisherAddError::Busy) => "503 Service Unavailable",
            Err(crate::error::PublisherAddError::Closed) => "500 Internal Server Error",
        },
        "SETUP" => {
            let publish_result = session.on_setup_publish(0).await;
            match publish_result {
                Ok(()) => "200 OK",
                Err(crate::error::SetupError::TrackNotExist(_)) => "400 Bad Request",
                Err(crate::error::SetupError::PathNotExist) => {
                    match session.on_setup_play(path_name, 0).await {
                        Ok(()) => "200 OK",
                        Err(crate::error::SetupError::TrackNotExist(_)) => "400 Bad Request",
                        Err(crate::error::SetupError::PathNotExist) => "404 Not Found",
                    }
                }
            }
        }
        "RECORD" => match session.on_record().await {
            Ok(()) => "200 OK",
            Err(_) => "500 Internal Server Error",
        },
        "PLAY" => match session.on_play().await {
            Ok(_) => "200 OK",
            Err(_) => "404 Not Found",
        },
        "PAUSE" => {
            session.on_pause().await;
            "200 OK"
        }
        "TEARDOWN" => "200 OK",
        _ => "501 Not Implemented",
    }
}

#[must_use]
pub fn rtp_seq_and_ts(pkt: &[u8]) -> Option<(u16, u32)> {
    let (header, _) = parse_rtp_header(pkt).ok()?;
    Some((header.sequence_number, header.timestamp))
}

#[must_use]
pub fn pts_from_rtp_timestamp(timestamp: u32, clock_rate: u32) -> UnixH264 {
    let nanos = i64::from(timestamp) * 1_000_000_000 / i64::from(clock_rate);
    UnixH264::from(nanos)
}

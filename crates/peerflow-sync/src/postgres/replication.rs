//! PostgreSQL replication wire client.
//!
//! Minimal frontend for the streaming replication protocol: connects with
//! `replication=database`, authenticates (cleartext or md5), creates
//! logical slots and enters CopyBoth mode for pgoutput streaming. The
//! regular query path uses `tokio-postgres`; replication needs the startup
//! parameter that crate does not expose, so the handshake is done here.

use crate::error::{Result, SyncError};
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use peerflow_model::format_lsn;
use postgres_protocol::message::{backend, frontend};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Microseconds between the Unix and PostgreSQL epochs (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// PostgreSQL identifier limit (NAMEDATALEN - 1).
const PG_MAX_IDENTIFIER_LEN: usize = 63;

/// Validate a slot or publication name before splicing it into a
/// replication command.
pub fn validate_identifier(ident: &str) -> Result<()> {
    if ident.is_empty() || ident.len() > PG_MAX_IDENTIFIER_LEN {
        return Err(SyncError::config(format!(
            "identifier must be 1..={} characters: {:?}",
            PG_MAX_IDENTIFIER_LEN, ident
        )));
    }
    if !ident
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(SyncError::config(format!(
            "identifier may only contain [a-z0-9_]: {:?}",
            ident
        )));
    }
    Ok(())
}

/// Connection parameters for the replication session.
#[derive(Clone)]
pub struct ReplicationConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl std::fmt::Debug for ReplicationConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .finish()
    }
}

/// A connected replication session, pre-CopyBoth.
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
}

impl ReplicationClient {
    /// Connect and authenticate in replication mode.
    pub async fn connect(options: &ReplicationConnectOptions) -> Result<Self> {
        info!(
            host = %options.host,
            port = options.port,
            user = %options.user,
            database = %options.database,
            "connecting for logical replication"
        );
        let tcp = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((options.host.as_str(), options.port)),
        )
        .await
        .map_err(|_| SyncError::timeout("replication connect timed out"))??;
        let mut stream = BufReader::new(tcp);

        let params = [
            ("user", options.user.as_str()),
            ("database", options.database.as_str()),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.iter().copied(), &mut buf)
            .map_err(|e| SyncError::replication(format!("startup message: {}", e)))?;
        write_all(&mut stream, &buf).await?;

        // Authentication exchange.
        loop {
            let (tag, body) = read_message(&mut stream).await?;
            let mut framed = BytesMut::with_capacity(body.len() + 5);
            framed.put_u8(tag);
            framed.put_i32(body.len() as i32 + 4);
            framed.put_slice(&body);

            let message = backend::Message::parse(&mut framed)
                .map_err(|e| SyncError::replication(format!("parse auth message: {}", e)))?
                .ok_or_else(|| SyncError::replication("truncated auth message"))?;

            match message {
                backend::Message::AuthenticationOk => {
                    debug!("replication authentication ok");
                    break;
                }
                backend::Message::AuthenticationCleartextPassword => {
                    let password = options
                        .password
                        .as_deref()
                        .ok_or_else(|| SyncError::config("password required"))?;
                    send_password(&mut stream, password.as_bytes()).await?;
                }
                backend::Message::AuthenticationMd5Password(salted) => {
                    let password = options
                        .password
                        .as_deref()
                        .ok_or_else(|| SyncError::config("password required"))?;
                    let hashed = md5_password(&options.user, password, &salted.salt());
                    send_password(&mut stream, hashed.as_bytes()).await?;
                }
                backend::Message::AuthenticationSasl(_) => {
                    return Err(SyncError::replication(
                        "SASL authentication is not supported; use md5 or password auth",
                    ));
                }
                backend::Message::ErrorResponse(_) => {
                    return Err(SyncError::replication("authentication rejected"));
                }
                _ => {
                    return Err(SyncError::replication(format!(
                        "unexpected message during auth: {:#04x}",
                        tag
                    )));
                }
            }
        }

        // Drain parameter status until ReadyForQuery.
        loop {
            let (tag, _) = read_message(&mut stream).await?;
            match tag {
                b'Z' => break,
                b'E' => return Err(SyncError::replication("error waiting for ready")),
                _ => {}
            }
        }

        Ok(Self { stream })
    }

    /// `CREATE_REPLICATION_SLOT <slot> LOGICAL pgoutput`, tolerating an
    /// existing slot.
    pub async fn create_replication_slot(&mut self, slot_name: &str) -> Result<()> {
        validate_identifier(slot_name)?;
        let command = format!("CREATE_REPLICATION_SLOT {} LOGICAL pgoutput", slot_name);
        match self.simple_command(&command).await {
            Ok(()) => Ok(()),
            Err(SyncError::Replication(msg)) if msg.contains("command failed") => {
                // The slot may already exist from a previous run; the
                // caller owns it exclusively either way.
                debug!(slot_name, "create slot failed, assuming it exists");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// `START_REPLICATION` with pgoutput proto version 1; consumes the
    /// client and returns the CopyBoth stream.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        publication: &str,
        start_lsn: u64,
    ) -> Result<ReplicationStream> {
        validate_identifier(slot_name)?;
        validate_identifier(publication)?;

        let command = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            slot_name,
            format_lsn(start_lsn),
            publication,
        );
        let mut buf = BytesMut::new();
        frontend::query(&command, &mut buf)
            .map_err(|e| SyncError::replication(format!("query message: {}", e)))?;
        write_all(&mut self.stream, &buf).await?;

        let (tag, _) = read_message(&mut self.stream).await?;
        match tag {
            b'W' => {
                info!(slot_name, publication, start_lsn = %format_lsn(start_lsn), "entered CopyBoth mode");
                Ok(ReplicationStream {
                    stream: self.stream,
                })
            }
            b'E' => Err(SyncError::replication("START_REPLICATION rejected")),
            other => Err(SyncError::replication(format!(
                "unexpected response to START_REPLICATION: {:#04x}",
                other
            ))),
        }
    }

    async fn simple_command(&mut self, command: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        frontend::query(command, &mut buf)
            .map_err(|e| SyncError::replication(format!("query message: {}", e)))?;
        write_all(&mut self.stream, &buf).await?;

        let mut failed = false;
        loop {
            let (tag, _) = read_message(&mut self.stream).await?;
            match tag {
                b'Z' => break,
                b'E' => failed = true,
                _ => {}
            }
        }
        if failed {
            Err(SyncError::replication(format!(
                "command failed: {}",
                command
            )))
        } else {
            Ok(())
        }
    }
}

/// CopyBoth stream of WAL payloads.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

impl ReplicationStream {
    /// Next CopyData payload; `None` at CopyDone.
    pub async fn next_message(&mut self) -> Result<Option<Bytes>> {
        let (tag, body) = read_message(&mut self.stream).await?;
        match tag {
            b'd' => Ok(Some(Bytes::from(body))),
            b'c' => Ok(None),
            b'E' => Err(SyncError::replication("error on replication stream")),
            other => Err(SyncError::replication(format!(
                "unexpected stream message: {:#04x}",
                other
            ))),
        }
    }

    /// Standby status update.
    ///
    /// `flushed_lsn` is the durable checkpoint acknowledged by the sync
    /// activity; the server may recycle WAL up to it. `written_lsn` tracks
    /// what this client has consumed.
    pub async fn send_status_update(&mut self, written_lsn: u64, flushed_lsn: u64) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(written_lsn);
        payload.put_u64(flushed_lsn);
        payload.put_u64(flushed_lsn);
        payload.put_i64(pg_epoch_now_micros());
        payload.put_u8(0);

        let mut frame = BytesMut::with_capacity(payload.len() + 5);
        frame.put_u8(b'd');
        frame.put_i32(payload.len() as i32 + 4);
        frame.put_slice(&payload);

        write_all(&mut self.stream, &frame).await
    }
}

async fn send_password(stream: &mut BufReader<TcpStream>, password: &[u8]) -> Result<()> {
    let mut buf = BytesMut::new();
    frontend::password_message(password, &mut buf)
        .map_err(|e| SyncError::replication(format!("password message: {}", e)))?;
    write_all(stream, &buf).await
}

async fn write_all(stream: &mut BufReader<TcpStream>, data: &[u8]) -> Result<()> {
    timeout(IO_TIMEOUT, async {
        stream.get_mut().write_all(data).await?;
        stream.get_mut().flush().await
    })
    .await
    .map_err(|_| SyncError::timeout("replication write timed out"))??;
    Ok(())
}

async fn read_message(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let (tag, len) = timeout(IO_TIMEOUT, async {
        let tag = stream.read_u8().await?;
        let len = stream.read_i32().await?;
        Ok::<_, std::io::Error>((tag, len))
    })
    .await
    .map_err(|_| SyncError::timeout("replication read timed out"))??;

    let len = len as usize;
    if len < 4 {
        return Err(SyncError::replication(format!(
            "invalid message length {}",
            len
        )));
    }
    let mut body = vec![0u8; len - 4];
    timeout(IO_TIMEOUT, stream.read_exact(&mut body))
        .await
        .map_err(|_| SyncError::timeout("replication read timed out"))??;
    Ok((tag, body))
}

/// `md5<hex(md5(hex(md5(password || user)) || salt))>`.
fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password);
    hasher.update(user);
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner);
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

/// Microseconds since the PostgreSQL epoch, for status updates.
fn pg_epoch_now_micros() -> i64 {
    let unix_micros = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    unix_micros - PG_EPOCH_OFFSET_MICROS
}

/// Convert a pgoutput commit timestamp to a UTC instant.
pub fn pg_micros_to_utc(micros: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_micros(micros + PG_EPOCH_OFFSET_MICROS)
        .unwrap_or_else(chrono::Utc::now)
}

//! FTP storage backend
//!
//! Connects with a timeout, logs in, switches to passive mode, and
//! streams the artifact in 1 MiB chunks, failing on the first rejected
//! write. The control connection is closed on drop regardless of how the
//! upload ended.

use std::io::{Read, Write};
use std::net::ToSocketAddrs;
use std::time::Duration;

use log::debug;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{Mode, NativeTlsConnector, NativeTlsFtpStream};

use super::{StorageAdapter, UPLOAD_CHUNK_SIZE};
use crate::error::{BackupError, BackupResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connected FTP backend
pub struct FtpAdapter {
    stream: NativeTlsFtpStream,
}

impl FtpAdapter {
    /// Connect, optionally upgrade to TLS, log in, and switch to passive
    /// mode and binary transfers.
    pub fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        tls: bool,
    ) -> BackupResult<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| BackupError::Upload(format!("Failed to resolve {}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| {
                BackupError::Upload(format!("No address found for {}:{}", host, port))
            })?;

        let stream = NativeTlsFtpStream::connect_timeout(addr, CONNECT_TIMEOUT)
            .map_err(|e| BackupError::Upload(format!("FTP connect failed: {}", e)))?;

        let mut stream = if tls {
            let connector = TlsConnector::new()
                .map_err(|e| BackupError::Upload(format!("TLS setup failed: {}", e)))?;
            stream
                .into_secure(NativeTlsConnector::from(connector), host)
                .map_err(|e| BackupError::Upload(format!("FTP TLS negotiation failed: {}", e)))?
        } else {
            stream
        };

        stream
            .login(username, password)
            .map_err(|e| BackupError::Upload(format!("FTP login failed: {}", e)))?;
        stream.set_mode(Mode::Passive);
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| BackupError::Upload(format!("FTP transfer type failed: {}", e)))?;

        Ok(Self { stream })
    }
}

impl StorageAdapter for FtpAdapter {
    fn upload_stream(&mut self, stream: &mut dyn Read, destination: &str) -> BackupResult<bool> {
        let mut remote = self
            .stream
            .put_with_stream(destination)
            .map_err(|e| BackupError::Upload(format!("FTP upload of {} failed: {}", destination, e)))?;

        let written = copy_in_chunks(stream, &mut remote, UPLOAD_CHUNK_SIZE)?;

        self.stream
            .finalize_put_stream(remote)
            .map_err(|e| BackupError::Upload(format!("FTP failed to finalize {}: {}", destination, e)))?;
        debug!("uploaded {} bytes to {}", written, destination);

        Ok(true)
    }
}

impl Drop for FtpAdapter {
    fn drop(&mut self) {
        let _ = self.stream.quit();
    }
}

/// Copy `reader` into `writer` in fixed-size chunks, failing on the first
/// rejected write. Returns the number of bytes written.
fn copy_in_chunks<W: Write>(
    reader: &mut dyn Read,
    writer: &mut W,
    chunk_size: usize,
) -> BackupResult<u64> {
    let mut buffer = vec![0u8; chunk_size];
    let mut written = 0u64;
    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| BackupError::Upload(format!("Failed to read artifact stream: {}", e)))?;
        if n == 0 {
            return Ok(written);
        }
        writer.write_all(&buffer[..n]).map_err(|e| {
            BackupError::Upload(format!("Chunk rejected after {} bytes: {}", written, e))
        })?;
        written += n as u64;
    }
}

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::SockRef;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpResult, FtpStream, Mode};
use tracing::debug;

use crate::params::{ConnectionParameters, SocketTuning};
use crate::types::FtpKitError;

/// Distinguishes a wire failure from a local file failure inside a
/// streaming transfer.
#[derive(Debug)]
pub enum TransferError {
    Remote(FtpError),
    Local(std::io::Error),
}

/// Authenticated FTP control session with tuned socket options.
///
/// Every method blocks on network I/O; callers must run them on a worker
/// thread (see `FtpPool::run_blocking`), never on the async scheduler.
pub struct FtpSession {
    stream: FtpStream,
}

impl std::fmt::Debug for FtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpSession").finish_non_exhaustive()
    }
}

impl FtpSession {
    /// Connect, tune the control socket, log in and switch to extended
    /// passive mode.
    pub fn connect(params: &ConnectionParameters) -> Result<Self, FtpKitError> {
        let addr = format!("{}:{}", params.host, params.connect_port());
        let timeout = params.timeout();

        let stream = if timeout.is_zero() {
            FtpStream::connect(&addr)
        } else {
            let socket_addr = addr
                .to_socket_addrs()
                .map_err(|e| FtpKitError::Ftp(format!("Could not resolve {addr}: {e}")))?
                .next()
                .ok_or_else(|| FtpKitError::Ftp(format!("Could not resolve {addr}")))?;
            FtpStream::connect_timeout(socket_addr, timeout)
        }
        .map_err(|e| {
            FtpKitError::Ftp(format!("Could not open an FTP connection to: {addr}: {e}"))
        })?;

        // Tuning failures are fatal to the connection.
        tune_socket(stream.get_ref(), &params.tuning).map_err(|e| {
            FtpKitError::Ftp(format!("Failed to tune the control socket for {addr}: {e}"))
        })?;
        if !timeout.is_zero() {
            set_io_timeouts(stream.get_ref(), timeout).map_err(|e| {
                FtpKitError::Ftp(format!("Failed to set socket timeouts for {addr}: {e}"))
            })?;
        }

        let mut session = Self { stream };
        session
            .stream
            .login(
                params.credentials.username.as_str(),
                params.credentials.password.expose(),
            )
            .map_err(|e| FtpKitError::Ftp(format!("FTP login to {addr} failed: {e}")))?;
        session.stream.set_mode(Mode::ExtendedPassive);

        debug!(
            host = %params.host,
            port = params.connect_port(),
            "FTP connection has been created"
        );
        Ok(session)
    }

    pub fn cwd(&mut self, path: &str) -> FtpResult<()> {
        self.stream.cwd(path)
    }

    pub fn pwd(&mut self) -> FtpResult<String> {
        self.stream.pwd()
    }

    pub fn mkdir(&mut self, path: &str) -> FtpResult<()> {
        self.stream.mkdir(path)
    }

    pub fn rmdir(&mut self, path: &str) -> FtpResult<()> {
        self.stream.rmdir(path)
    }

    pub fn rm(&mut self, path: &str) -> FtpResult<()> {
        self.stream.rm(path)
    }

    pub fn size(&mut self, path: &str) -> FtpResult<usize> {
        self.stream.size(path)
    }

    /// `CWD` into `path`, then request a Unix long-format listing including
    /// hidden entries.
    pub fn list_all(&mut self, path: &str) -> FtpResult<Vec<String>> {
        self.stream.cwd(path)?;
        self.stream.list(Some("-a"))
    }

    pub fn binary(&mut self) -> FtpResult<()> {
        self.stream.transfer_type(FileType::Binary)
    }

    /// `RETR` the remote file into `writer`, returning the transferred byte
    /// count.
    pub fn retrieve_to<W: Write>(
        &mut self,
        path: &str,
        writer: &mut W,
        buffer_size: usize,
    ) -> Result<u64, TransferError> {
        let mut reader = self
            .stream
            .retr_as_stream(path)
            .map_err(TransferError::Remote)?;
        let mut buf = vec![0u8; buffer_size.max(8 * 1024)];
        let mut total = 0u64;
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| TransferError::Remote(FtpError::ConnectionError(e)))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).map_err(TransferError::Local)?;
            total += n as u64;
        }
        self.stream
            .finalize_retr_stream(reader)
            .map_err(TransferError::Remote)?;
        Ok(total)
    }

    /// `STOR` the contents of `reader` at the remote path, returning the
    /// transferred byte count.
    pub fn store_from<R: Read>(
        &mut self,
        path: &str,
        reader: &mut R,
        buffer_size: usize,
    ) -> Result<u64, TransferError> {
        let mut data = self
            .stream
            .put_with_stream(path)
            .map_err(TransferError::Remote)?;
        let mut buf = vec![0u8; buffer_size.max(8 * 1024)];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).map_err(TransferError::Local)?;
            if n == 0 {
                break;
            }
            data.write_all(&buf[..n])
                .map_err(|e| TransferError::Remote(FtpError::ConnectionError(e)))?;
            total += n as u64;
        }
        self.stream
            .finalize_put_stream(data)
            .map_err(TransferError::Remote)?;
        Ok(total)
    }

    /// Graceful shutdown. On failure the socket still closes on drop, which
    /// with `SO_LINGER{on,0}` is an immediate RST.
    pub fn quit(mut self) -> FtpResult<()> {
        self.stream.quit()
    }
}

fn tune_socket(stream: &TcpStream, tuning: &SocketTuning) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_recv_buffer_size(tuning.buffer_size)?;
    sock.set_send_buffer_size(tuning.buffer_size)?;
    sock.set_nodelay(tuning.nodelay)?;
    sock.set_keepalive(tuning.keepalive)?;
    sock.set_linger(tuning.linger_secs.map(Duration::from_secs))?;
    Ok(())
}

fn set_io_timeouts(stream: &TcpStream, timeout: Duration) -> std::io::Result<()> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Credentials;

    #[test]
    fn test_connect_refused() {
        // Port 1 on localhost should not have an FTP server listening.
        let mut params =
            ConnectionParameters::new("127.0.0.1", Credentials::new("test", "test")).unwrap();
        params.port = 1;
        params.timeout_secs = 1;

        let err = FtpSession::connect(&params).unwrap_err();
        assert!(matches!(err, FtpKitError::Ftp(_)));
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[test]
    fn test_connect_unresolvable_host() {
        let mut params =
            ConnectionParameters::new("host.invalid", Credentials::new("test", "test")).unwrap();
        params.timeout_secs = 1;

        let err = FtpSession::connect(&params).unwrap_err();
        assert!(matches!(err, FtpKitError::Ftp(_)));
    }
}

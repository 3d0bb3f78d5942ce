//! SSH transport built on the ssh2 crate.
//!
//! Password authentication only. Command execution and SFTP run over
//! the same authenticated session.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use ssh2::{ErrorCode, Session as SshSession, Sftp};
use tracing::debug;

use super::ConnectionError;
use super::transport::{Connection, ExecOutput, FileChannel, RemoteStat, Transport};
use crate::registry::HostRecord;
use crate::transfer::{ProgressTracker, TransferError};

/// Socket read/write timeout in seconds.
const IO_TIMEOUT_SECS: u64 = 30;

/// Streaming buffer size.
const CHUNK_SIZE: usize = 32 * 1024;

/// Pause between polls while a command produces no output.
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// libssh2 timeout error code.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// libssh2 authentication failure code.
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;

/// SFTP "no such file" status.
const SFTP_NO_SUCH_FILE: i32 = 2;

/// SFTP "permission denied" status.
const SFTP_PERMISSION_DENIED: i32 = 3;

/// SFTP "file already exists" status.
const SFTP_FILE_ALREADY_EXISTS: i32 = 11;

/// Production transport.
#[derive(Debug, Clone)]
pub struct SshTransport {
    /// Socket read/write timeout.
    io_timeout: Duration,
}

impl SshTransport {
    /// Creates a transport with the default socket timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            io_timeout: Duration::from_secs(IO_TIMEOUT_SECS),
        }
    }

    /// Sets the socket read/write timeout.
    #[must_use]
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    fn open_tcp(&self, host: &HostRecord, timeout: Duration) -> Result<TcpStream, ConnectionError> {
        let addrs = (host.address.as_str(), host.port)
            .to_socket_addrs()
            .map_err(|e| ConnectionError::Network(format!("cannot resolve {}: {}", host.address, e)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(tcp) => {
                    // Keep reads/writes from hanging forever.
                    let _ = tcp.set_read_timeout(Some(self.io_timeout));
                    let _ = tcp.set_write_timeout(Some(self.io_timeout));
                    return Ok(tcp);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => classify_io(&e),
            None => ConnectionError::Network(format!("no address for {}", host.address)),
        })
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SshTransport {
    fn connect(
        &self,
        host: &HostRecord,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        assert!(!host.address.is_empty(), "address must not be empty");
        assert!(host.port > 0, "port must be positive");

        let tcp = self.open_tcp(host, timeout)?;

        let mut session =
            SshSession::new().map_err(|e| ConnectionError::Protocol(e.message().to_string()))?;
        session.set_timeout(millis(timeout));
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| classify_ssh(&e))?;

        session
            .userauth_password(&host.login, &host.secret)
            .map_err(|e| match e.code() {
                ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => {
                    ConnectionError::Timeout(e.message().to_string())
                }
                _ => ConnectionError::AuthRejected(e.message().to_string()),
            })?;

        if !session.authenticated() {
            return Err(ConnectionError::AuthRejected(
                "server did not accept the credentials".to_string(),
            ));
        }

        debug!("SSH session established with {}", host.connection_string());
        Ok(Box::new(SshConnection { session }))
    }
}

/// Authenticated ssh2 session.
struct SshConnection {
    session: SshSession,
}

impl Connection for SshConnection {
    fn execute(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, ConnectionError> {
        if command.trim().is_empty() {
            return Err(ConnectionError::Protocol("empty command".to_string()));
        }

        self.session.set_timeout(millis(timeout));

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| classify_ssh(&e))?;
        channel.exec(command).map_err(|e| classify_ssh(&e))?;

        // Both streams share one channel window, so they are drained together.
        let mut out = channel.stream(0);
        let mut err = channel.stderr();
        self.session.set_blocking(false);
        let drained = drain_streams(
            &mut out,
            &mut err,
            || channel.eof(),
            timeout,
        );
        self.session.set_blocking(true);
        let (stdout, stderr) = drained?;

        channel.wait_close().map_err(|e| classify_ssh(&e))?;
        let exit_code = channel.exit_status().map_err(|e| classify_ssh(&e))?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn open_file_channel(&mut self) -> Result<Box<dyn FileChannel>, ConnectionError> {
        let sftp = self.session.sftp().map_err(|e| classify_ssh(&e))?;
        Ok(Box::new(SshFileChannel { sftp }))
    }

    fn close(&mut self) {
        let _ = self.session.disconnect(None, "closing", None);
    }
}

/// SFTP subsystem on an ssh2 session.
struct SshFileChannel {
    sftp: Sftp,
}

impl FileChannel for SshFileChannel {
    fn stat(&mut self, remote: &str) -> Result<Option<RemoteStat>, TransferError> {
        match self.sftp.stat(Path::new(remote)) {
            Ok(stat) => Ok(Some(RemoteStat {
                size: stat.size.unwrap_or(0),
                is_dir: stat.is_dir(),
            })),
            Err(e) if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Ok(None),
            Err(e) => Err(classify_sftp(&e, remote)),
        }
    }

    fn mkdir(&mut self, remote: &str) -> Result<(), TransferError> {
        match self.sftp.mkdir(Path::new(remote), 0o755) {
            Ok(()) => Ok(()),
            Err(e) if e.code() == ErrorCode::SFTP(SFTP_FILE_ALREADY_EXISTS) => Ok(()),
            Err(e) => Err(classify_sftp(&e, remote)),
        }
    }

    fn put(
        &mut self,
        source: &mut dyn Read,
        remote: &str,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<u64, TransferError> {
        let mut file = self
            .sftp
            .create(Path::new(remote))
            .map_err(|e| classify_sftp(&e, remote))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            let n = source
                .read(&mut buf)
                .map_err(|e| TransferError::LocalIo(e.to_string()))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| TransferError::Remote(format!("{}: {}", remote, e)))?;
            written += n as u64;
            progress.advance(n as u64);
        }

        file.flush()
            .map_err(|e| TransferError::Remote(format!("{}: {}", remote, e)))?;
        Ok(written)
    }

    fn get(
        &mut self,
        remote: &str,
        sink: &mut dyn Write,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<u64, TransferError> {
        let mut file = self
            .sftp
            .open(Path::new(remote))
            .map_err(|e| classify_sftp(&e, remote))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut read = 0u64;
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| TransferError::Remote(format!("{}: {}", remote, e)))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])
                .map_err(|e| TransferError::LocalIo(e.to_string()))?;
            read += n as u64;
            progress.advance(n as u64);
        }

        Ok(read)
    }
}

/// Reads stdout and stderr of a running command in turns until the remote
/// signals end of output.
///
/// Both readers must be non-blocking. Fails with `Timeout` if the output
/// has not ended within `timeout`.
fn drain_streams(
    stdout: &mut dyn Read,
    stderr: &mut dyn Read,
    is_eof: impl Fn() -> bool,
    timeout: Duration,
) -> Result<(Vec<u8>, Vec<u8>), ConnectionError> {
    let started = Instant::now();
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let read_out = read_available(stdout, &mut out, &mut buf)?;
        let read_err = read_available(stderr, &mut err, &mut buf)?;
        if read_out || read_err {
            continue;
        }
        if is_eof() {
            return Ok((out, err));
        }
        if started.elapsed() >= timeout {
            return Err(ConnectionError::Timeout(format!(
                "command still running after {}ms",
                timeout.as_millis()
            )));
        }
        thread::sleep(OUTPUT_POLL_INTERVAL);
    }
}

/// Appends whatever `reader` has ready. Returns true if anything was read.
fn read_available(
    reader: &mut dyn Read,
    sink: &mut Vec<u8>,
    buf: &mut [u8],
) -> Result<bool, ConnectionError> {
    let mut progressed = false;
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(progressed),
            Ok(n) => {
                sink.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(progressed),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(classify_io(&e)),
        }
    }
}

fn millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn classify_io(e: &io::Error) -> ConnectionError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ConnectionError::Timeout(e.to_string())
        }
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable => ConnectionError::Network(e.to_string()),
        _ => ConnectionError::Unknown(e.to_string()),
    }
}

fn classify_ssh(e: &ssh2::Error) -> ConnectionError {
    match e.code() {
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => {
            ConnectionError::Timeout(e.message().to_string())
        }
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED) => {
            ConnectionError::AuthRejected(e.message().to_string())
        }
        _ => ConnectionError::Protocol(e.message().to_string()),
    }
}

fn classify_sftp(e: &ssh2::Error, remote: &str) -> TransferError {
    match e.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => TransferError::RemoteNotFound(remote.to_string()),
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => {
            TransferError::PermissionDenied(remote.to_string())
        }
        _ => TransferError::Remote(format!("{}: {}", remote, e.message())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_classify_io() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(classify_io(&timeout), ConnectionError::Timeout(_)));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert!(matches!(classify_io(&refused), ConnectionError::Network(_)));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(2)), 2000);
        assert_eq!(millis(Duration::from_secs(u64::MAX / 4)), u32::MAX);
    }

    /// Yields its chunks one read at a time, with `WouldBlock` between
    /// them. `pending` counts chunks not yet read across all readers.
    struct Trickle {
        chunks: Vec<&'static [u8]>,
        ready: bool,
        pending: Rc<Cell<usize>>,
    }

    impl Trickle {
        fn new(chunks: Vec<&'static [u8]>, pending: &Rc<Cell<usize>>) -> Self {
            pending.set(pending.get() + chunks.len());
            Self {
                chunks,
                ready: false,
                pending: Rc::clone(pending),
            }
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.ready || self.chunks.is_empty() {
                self.ready = true;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.ready = false;
            let chunk = self.chunks.remove(0);
            self.pending.set(self.pending.get() - 1);
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_drain_reads_stderr_while_stdout_waits() {
        let pending = Rc::new(Cell::new(0));
        let mut stdout = Trickle::new(vec![&b"done\n"[..]], &pending);
        let mut stderr = Trickle::new(vec![&b"warn 1\n"[..]; 50], &pending);

        let (out, err) = drain_streams(
            &mut stdout,
            &mut stderr,
            || pending.get() == 0,
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(out, b"done\n");
        assert_eq!(err.len(), 50 * b"warn 1\n".len());
    }

    #[test]
    fn test_drain_times_out_without_eof() {
        let pending = Rc::new(Cell::new(0));
        let mut stdout = Trickle::new(Vec::new(), &pending);
        let mut stderr = Trickle::new(Vec::new(), &pending);

        let result = drain_streams(
            &mut stdout,
            &mut stderr,
            || false,
            Duration::from_millis(30),
        );

        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
    }

    #[test]
    fn test_unreachable_host_fails_fast() {
        // Port 1 on localhost is closed on any sane test machine.
        let host = HostRecord::new("127.0.0.1", "nobody", "x").with_port(1);
        let result = SshTransport::new().connect(&host, Duration::from_secs(2));

        match result {
            Err(e) => assert_ne!(e.kind(), crate::session::FailureKind::Authentication),
            Ok(_) => panic!("connection to a closed port must fail"),
        }
    }
}

//! Platform-specific pipe/socket implementation.
//!
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//!
//! The backend listens on the endpoint and the client connects, so the
//! client side only needs [`PipeStream::connect`]. [`PipeListener`] is the
//! backend half, used by the mock backend and by tests.
//!
//! # Example
//!
//! ```ignore
//! use flow_client::transport::{generate_endpoint_path, PipeListener, PipeStream};
//!
//! let path = generate_endpoint_path();
//! let listener = PipeListener::bind(&path).await?;
//! let client = PipeStream::connect(&path).await?;
//! let server = listener.accept().await?;
//! ```

use crate::error::Result;

/// Generate a unique endpoint address for a backend instance.
///
/// Format:
/// - Unix: `{tmp}/flow-{pid}-{random}.sock`
/// - Windows: `\\.\pipe\flow-{pid}-{random}`
pub fn generate_endpoint_path() -> String {
    let pid = std::process::id();
    let suffix: u64 = rand::random();

    #[cfg(unix)]
    {
        std::env::temp_dir()
            .join(format!("flow-{}-{:x}.sock", pid, suffix))
            .to_string_lossy()
            .into_owned()
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\flow-{}-{:x}", pid, suffix)
    }
}


// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    /// Read half of a connected endpoint.
    pub type PipeReadHalf = tokio::net::unix::OwnedReadHalf;
    /// Write half of a connected endpoint.
    pub type PipeWriteHalf = tokio::net::unix::OwnedWriteHalf;

    /// Unix Domain Socket listener.
    pub struct PipeListener {
        listener: UnixListener,
        path: String,
    }

    /// Unix Domain Socket stream (connected).
    #[derive(Debug)]
    pub struct PipeStream {
        stream: UnixStream,
    }

    /// Removes the socket file on drop.
    #[derive(Debug)]
    pub struct PipeCleanup {
        path: String,
    }

    impl PipeCleanup {
        pub fn new(path: impl Into<String>) -> Self {
            Self { path: path.into() }
        }
    }

    impl Drop for PipeCleanup {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    impl PipeListener {
        /// Bind to a Unix socket path.
        ///
        /// Removes any stale socket file at the path before binding.
        pub async fn bind(path: &str) -> Result<Self> {
            if Path::new(path).exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;

            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }

        /// Accept a single connection.
        pub async fn accept(&self) -> Result<PipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(PipeStream { stream })
        }

        /// Get the socket path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    impl PipeStream {
        /// Connect to a listening endpoint.
        ///
        /// Fails with `NotFound`/`ConnectionRefused` while the backend has not
        /// bound yet; the supervisor retries those.
        pub async fn connect(path: &str) -> Result<Self> {
            let stream = UnixStream::connect(path).await?;
            Ok(Self { stream })
        }

        /// Split into owned read and write halves.
        pub fn into_split(self) -> (PipeReadHalf, PipeWriteHalf) {
            self.stream.into_split()
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    /// Read half of a connected endpoint.
    pub type PipeReadHalf = tokio::io::ReadHalf<PipeStream>;
    /// Write half of a connected endpoint.
    pub type PipeWriteHalf = tokio::io::WriteHalf<PipeStream>;

    /// Windows Named Pipe listener.
    pub struct PipeListener {
        path: String,
        next: parking_lot::Mutex<Option<NamedPipeServer>>,
    }

    /// Either end of a Windows Named Pipe.
    #[derive(Debug)]
    pub enum PipeStream {
        Server(NamedPipeServer),
        Client(NamedPipeClient),
    }

    /// Named pipes vanish with their last handle; nothing to clean.
    #[derive(Debug)]
    pub struct PipeCleanup {
        _path: String,
    }

    impl PipeCleanup {
        pub fn new(path: impl Into<String>) -> Self {
            Self { _path: path.into() }
        }
    }

    impl PipeListener {
        /// Create the first Named Pipe instance so clients can open it.
        pub async fn bind(path: &str) -> Result<Self> {
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(path)?;

            Ok(Self {
                path: path.to_string(),
                next: parking_lot::Mutex::new(Some(first)),
            })
        }

        /// Accept a single connection.
        pub async fn accept(&self) -> Result<PipeStream> {
            let server = match self.next.lock().take() {
                Some(server) => server,
                None => ServerOptions::new().create(&self.path)?,
            };
            server.connect().await?;
            Ok(PipeStream::Server(server))
        }

        /// Get the pipe path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl PipeStream {
        /// Open a client handle to a listening pipe.
        pub async fn connect(path: &str) -> Result<Self> {
            let client = ClientOptions::new().open(path)?;
            Ok(PipeStream::Client(client))
        }

        /// Split into read and write halves.
        pub fn into_split(self) -> (PipeReadHalf, PipeWriteHalf) {
            tokio::io::split(self)
        }
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => Pin::new(pipe).poll_read(cx, buf),
                PipeStream::Client(pipe) => Pin::new(pipe).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => Pin::new(pipe).poll_write(cx, buf),
                PipeStream::Client(pipe) => Pin::new(pipe).poll_write(cx, buf),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => Pin::new(pipe).poll_flush(cx),
                PipeStream::Client(pipe) => Pin::new(pipe).poll_flush(cx),
            }
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(pipe) => Pin::new(pipe).poll_shutdown(cx),
                PipeStream::Client(pipe) => Pin::new(pipe).poll_shutdown(cx),
            }
        }
    }
}

// ============================================================================
// Platform-independent re-exports
// ============================================================================

#[cfg(unix)]
pub use unix_impl::{PipeCleanup, PipeListener, PipeReadHalf, PipeStream, PipeWriteHalf};

#[cfg(windows)]
pub use windows_impl::{PipeCleanup, PipeListener, PipeReadHalf, PipeStream, PipeWriteHalf};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_endpoint_path_format() {
        let path = generate_endpoint_path();

        #[cfg(unix)]
        {
            let name = std::path::Path::new(&path)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned();
            assert!(name.starts_with("flow-"));
            assert!(name.ends_with(".sock"));
            assert!(path.starts_with(&*std::env::temp_dir().to_string_lossy()));
        }

        #[cfg(windows)]
        {
            assert!(path.starts_with(r"\\.\pipe\flow-"));
        }

        assert!(path.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_generate_endpoint_path_uniqueness() {
        let paths: HashSet<String> = (0..100).map(|_| generate_endpoint_path()).collect();
        assert_eq!(paths.len(), 100);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_before_bind_fails() {
        let path = generate_endpoint_path();
        assert!(PipeStream::connect(&path).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_connect_exchange() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let path = generate_endpoint_path();
        let listener = PipeListener::bind(&path).await.unwrap();

        let client = PipeStream::connect(&path).await.unwrap();
        let server = listener.accept().await.unwrap();

        let (_client_read, mut client_write) = client.into_split();
        let (mut server_read, _server_write) = server.into_split();

        client_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(listener);
        assert!(!std::path::Path::new(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_cleanup_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        drop(PipeCleanup::new(path.to_string_lossy()));
        assert!(!path.exists());
    }
}

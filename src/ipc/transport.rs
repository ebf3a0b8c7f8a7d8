//! IPC transport layer
//!
//! Local controllers use a Unix domain socket (named pipe on Windows) through
//! the interprocess crate; remote controllers connect over TCP. Both carry
//! the same length-prefixed JSON frames.

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::common::paths;

/// Maximum message size (10 MB)
const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

#[cfg(unix)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericFilePath, ListenerOptions};
}

#[cfg(windows)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericNamespaced, ListenerOptions};
}

use platform::*;

pub use platform::{Listener as LocalListener, Stream as LocalStream};

/// A bidirectional byte stream to the other side
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

/// Where the agent can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// The per-user local socket
    Local,
    /// `host:port` of a remote agent
    Tcp(String),
}

impl Endpoint {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "{}", paths::socket_name()),
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Create a listener for local controllers
pub async fn create_listener() -> io::Result<Listener> {
    // Clean up a socket left behind by a previous agent
    paths::ensure_socket_dir()?;
    paths::remove_socket()?;

    let name = paths::socket_name();

    #[cfg(unix)]
    let listener = {
        let name = name.to_fs_name::<GenericFilePath>()?;
        ListenerOptions::new().name(name).create_tokio()?
    };

    #[cfg(windows)]
    let listener = {
        let name = name.to_ns_name::<GenericNamespaced>()?;
        ListenerOptions::new().name(name).create_tokio()?
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let path = paths::socket_path();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

/// Create a listener for remote controllers
pub async fn create_tcp_listener(addr: &str) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to the agent
pub async fn connect(endpoint: &Endpoint) -> io::Result<Box<dyn Connection>> {
    match endpoint {
        Endpoint::Local => Ok(Box::new(connect_local().await?)),
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
    }
}

async fn connect_local() -> io::Result<Stream> {
    let name = paths::socket_name();

    #[cfg(unix)]
    let stream = {
        let name = name.to_fs_name::<GenericFilePath>()?;
        Stream::connect(name).await?
    };

    #[cfg(windows)]
    let stream = {
        let name = name.to_ns_name::<GenericNamespaced>()?;
        Stream::connect(name).await?
    };

    Ok(stream)
}

/// Send a length-prefixed message
pub async fn send_message<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Message too large",
        ));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed message
pub async fn recv_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// Check if the local agent socket exists
pub fn socket_exists() -> bool {
    #[cfg(unix)]
    {
        paths::socket_path().exists()
    }

    #[cfg(windows)]
    {
        // Named pipes cannot be probed; rely on connection attempts
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_a_split_stream() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let payload = vec![7u8; 1000];
        let writer = tokio::spawn(async move {
            send_message(&mut a, b"first").await.unwrap();
            send_message(&mut a, &payload).await.unwrap();
        });
        assert_eq!(recv_message(&mut b).await.unwrap(), b"first");
        assert_eq!(recv_message(&mut b).await.unwrap().len(), 1000);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE + 1).to_le_bytes())
            .await
            .unwrap();
        let err = recv_message(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

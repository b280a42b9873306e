// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Listener setup and the merged accept stream feeding one hyper server.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

pub const DEFAULT_LISTEN_ADDR: &str = "localhost:12321";

/// A connection accepted from any of the server's listeners.
pub enum MuxConn {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl AsyncRead for MuxConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MuxConn::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            MuxConn::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MuxConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MuxConn::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            MuxConn::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MuxConn::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            MuxConn::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MuxConn::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            MuxConn::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// The bound listeners plus the metadata the server needs from them.
pub struct Listeners {
    tcp: TcpListener,
    pub tcp_addr: SocketAddr,
    #[cfg(unix)]
    unix: Option<tokio::net::UnixListener>,
    /// Set when this process created a socket file that shutdown must remove.
    pub unix_socket_path: Option<PathBuf>,
}

impl Listeners {
    /// Bind the TCP listener, falling back to an ephemeral port when the
    /// preferred address is taken.
    pub async fn bind(
        listen_addr: &str,
        unix_socket_path: Option<PathBuf>,
    ) -> io::Result<Listeners> {
        let tcp = match TcpListener::bind(listen_addr).await {
            Ok(listener) => listener,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                let fallback = fallback_addr(listen_addr);
                tracing::warn!(
                    preferred = listen_addr,
                    fallback = %fallback,
                    "preferred listen address in use, falling back to an ephemeral port"
                );
                TcpListener::bind(&fallback).await?
            }
            Err(err) => return Err(err),
        };
        let tcp_addr = tcp.local_addr()?;

        #[cfg(unix)]
        let (unix, unix_socket_path) = match unix_socket_path {
            Some(path) => (Some(bind_unix_socket(&path)?), Some(path)),
            None => (None, None),
        };
        #[cfg(not(unix))]
        let unix_socket_path: Option<PathBuf> = {
            let _ = unix_socket_path;
            None
        };

        Ok(Listeners {
            tcp,
            tcp_addr,
            #[cfg(unix)]
            unix,
            unix_socket_path,
        })
    }

    /// Merge every listener into one stream of accepted connections.
    pub fn into_accept_stream(self) -> BoxStream<'static, io::Result<MuxConn>> {
        let tcp = self.tcp;
        let tcp_stream = async_stream::stream! {
            loop {
                yield tcp.accept().await.map(|(conn, _)| MuxConn::Tcp(conn));
            }
        };

        #[cfg(unix)]
        if let Some(unix) = self.unix {
            let unix_stream = async_stream::stream! {
                loop {
                    yield unix.accept().await.map(|(conn, _)| MuxConn::Unix(conn));
                }
            };
            return futures::stream::select(tcp_stream.boxed(), unix_stream.boxed()).boxed();
        }

        tcp_stream.boxed()
    }
}

/// Same host, port 0.
fn fallback_addr(listen_addr: &str) -> String {
    match listen_addr.rsplit_once(':') {
        Some((host, _port)) => format!("{host}:0"),
        None => "localhost:0".to_owned(),
    }
}

/// The default socket path, `$HOME/.cirruslabs/omni-cache.sock`.
#[cfg(unix)]
pub fn default_unix_socket_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cirruslabs/omni-cache.sock"))
}

#[cfg(unix)]
fn bind_unix_socket(path: &std::path::Path) -> io::Result<tokio::net::UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    }

    // A socket file left behind by a previous run would fail the bind.
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path.display(), "removed stale socket file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    tokio::net::UnixListener::bind(path)
}

/// Remove the socket file on clean shutdown.
pub fn cleanup_unix_socket(path: &Option<PathBuf>) {
    if let Some(path) = path {
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove socket file");
            }
        }
    }
}

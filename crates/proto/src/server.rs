use crate::{
  controller::Controller,
  proto::{controller_server::ControllerServer, identity_server::IdentityServer},
  ControllerService,
};
use std::{
  fmt,
  fs,
  future::Future,
  io,
  net::SocketAddr,
  path::{Path, PathBuf},
  pin::Pin,
  str::FromStr,
  sync::Arc,
  task::{Context, Poll},
};
use thiserror::Error;
use tokio::{
  io::{AsyncRead, AsyncWrite, ReadBuf},
  net::{unix::UCred, UnixListener, UnixStream},
};
use tokio_stream::{wrappers::UnixListenerStream, StreamExt};
use tonic::transport::{server::Connected, Server};
use tracing::{debug, info};

/// Where the plugin listens for the CO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
  Unix(PathBuf),
  Tcp(SocketAddr),
}

#[derive(Debug, Error)]
pub enum EndpointError {
  #[error("invalid endpoint {0:?}: expected unix:///path or tcp://host:port")]
  InvalidEndpoint(String),

  #[error("invalid endpoint {endpoint:?}: unix socket path must be absolute")]
  RelativePath { endpoint: String },

  #[error("invalid endpoint {endpoint:?}: {source}")]
  InvalidAddress {
    endpoint: String,
    source: std::net::AddrParseError,
  },
}

impl FromStr for Endpoint {
  type Err = EndpointError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Some(rest) = s.strip_prefix("unix:") {
      let path = rest.strip_prefix("//").unwrap_or(rest);
      if !path.starts_with('/') {
        return Err(EndpointError::RelativePath {
          endpoint: s.to_owned(),
        });
      }

      return Ok(Endpoint::Unix(PathBuf::from(path)));
    }

    if let Some(addr) = s.strip_prefix("tcp://") {
      return addr
        .parse()
        .map(Endpoint::Tcp)
        .map_err(|source| EndpointError::InvalidAddress {
          endpoint: s.to_owned(),
          source,
        });
    }

    Err(EndpointError::InvalidEndpoint(s.to_owned()))
  }
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
      Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
    }
  }
}

#[derive(Debug, Error)]
pub enum ServeError {
  #[error("failed to prepare socket {path:?}: {source}")]
  Socket { path: PathBuf, source: io::Error },

  #[error(transparent)]
  Transport(#[from] tonic::transport::Error),
}

/// Serves the identity and controller services of `plugin` on `endpoint`
/// until `shutdown` resolves.
pub async fn serve<T, F>(plugin: T, endpoint: &Endpoint, shutdown: F) -> Result<(), ServeError>
where
  T: ControllerService,
  F: Future<Output = ()>,
{
  let controller = Controller::new(Arc::new(plugin));
  let router = Server::builder()
    .add_service(IdentityServer::new(controller.clone()))
    .add_service(ControllerServer::new(controller));

  match endpoint {
    Endpoint::Unix(path) => {
      remove_stale_socket(path)?;
      let listener = UnixListener::bind(path).map_err(|source| ServeError::Socket {
        path: path.clone(),
        source,
      })?;

      info!(%endpoint, "listening");
      router
        .serve_with_incoming_shutdown(
          UnixListenerStream::new(listener).map(|conn| conn.map(UnixConnection)),
          shutdown,
        )
        .await?;
    }

    Endpoint::Tcp(addr) => {
      info!(%endpoint, "listening");
      router.serve_with_shutdown(*addr, shutdown).await?;
    }
  }

  info!(%endpoint, "server stopped");
  Ok(())
}

/// Peer credentials of a CO connected over a unix socket.
#[derive(Debug, Clone)]
pub struct UnixConnectInfo {
  pub peer_cred: Option<UCred>,
}

/// A unix socket connection as seen by the tonic transport.
#[derive(Debug)]
struct UnixConnection(UnixStream);

impl Connected for UnixConnection {
  type ConnectInfo = UnixConnectInfo;

  fn connect_info(&self) -> Self::ConnectInfo {
    UnixConnectInfo {
      peer_cred: self.0.peer_cred().ok(),
    }
  }
}

impl AsyncRead for UnixConnection {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.0).poll_read(cx, buf)
  }
}

impl AsyncWrite for UnixConnection {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.0).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.0).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.0).poll_shutdown(cx)
  }
}

fn remove_stale_socket(path: &Path) -> Result<(), ServeError> {
  match fs::remove_file(path) {
    Ok(()) => {
      debug!(?path, "removed stale socket");
      Ok(())
    }
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(source) => Err(ServeError::Socket {
      path: path.to_path_buf(),
      source,
    }),
  }
}

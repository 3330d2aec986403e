//! Connection dispatcher
//!
//! A [`Dispatcher`] stands in for a listening socket. The raw accept loop
//! submits every new client connection; the forwarder reinjects connections
//! it took over after a `CONNECT`. Fresh and reinjected connections use two
//! separate handoff points, so the plain-HTTP terminator only ever sees new
//! connections and the TLS terminator only ever sees tunnels.
//!
//! Each handoff is a rendezvous: a producer waits until a consumer is
//! parked in `accept`, then moves the connection to exactly that consumer.

use crate::errors::{Error, Result};
use crate::stream::PendingConnection;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Mutex};

type Slot = oneshot::Sender<PendingConnection>;

struct Handoff {
  slots: mpsc::UnboundedSender<Slot>,
  waiting: Arc<Mutex<mpsc::UnboundedReceiver<Slot>>>,
}

impl Handoff {
  fn new() -> Self {
    let (slots, waiting) = mpsc::unbounded_channel();
    Self {
      slots,
      waiting: Arc::new(Mutex::new(waiting)),
    }
  }

  async fn take(&self) -> Option<PendingConnection> {
    self.prune();
    let (slot, rx) = oneshot::channel();
    self.slots.send(slot).ok()?;
    rx.await.ok()
  }

  // Drops slots left by consumers that stopped waiting. While a producer
  // holds the queue it discards them itself.
  fn prune(&self) {
    let Ok(mut waiting) = self.waiting.try_lock() else {
      return;
    };
    let mut live = Vec::new();
    while let Ok(slot) = waiting.try_recv() {
      if !slot.is_closed() {
        live.push(slot);
      }
    }
    for slot in live {
      let _ = self.slots.send(slot);
    }
  }
}

async fn give(
  waiting: &Mutex<mpsc::UnboundedReceiver<Slot>>,
  mut conn: PendingConnection,
) -> Result<()> {
  let mut waiting = waiting.lock().await;
  loop {
    match waiting.recv().await {
      Some(slot) => match slot.send(conn) {
        Ok(()) => return Ok(()),
        // that consumer stopped waiting, offer it to the next one
        Err(returned) => conn = returned,
      },
      None => return Err(Error::Other("dispatcher closed".to_string())),
    }
  }
}

struct Inner {
  fresh: Handoff,
  tunnels: Handoff,
  local_addr: Option<SocketAddr>,
}

/// Listener-like handoff between connection producers and protocol terminators.
///
/// Cloning is cheap; all clones share the same handoff points.
#[derive(Clone)]
pub struct Dispatcher {
  inner: Arc<Inner>,
}

impl Default for Dispatcher {
  fn default() -> Self {
    Self::new()
  }
}

impl Dispatcher {
  /// Create a dispatcher that is not bound to any socket.
  pub fn new() -> Self {
    Self::with_addr(None)
  }

  fn with_addr(local_addr: Option<SocketAddr>) -> Self {
    Self {
      inner: Arc::new(Inner {
        fresh: Handoff::new(),
        tunnels: Handoff::new(),
        local_addr,
      }),
    }
  }

  /// Bind `addr` and start the accept loop feeding [`accept`](Self::accept).
  ///
  /// The loop runs until every handle to the dispatcher is dropped. Accept
  /// errors are logged and do not stop it.
  pub async fn listen<A: ToSocketAddrs>(addr: A) -> Result<Dispatcher> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
      let error = Error::Bind(e);
      tracing::error!("{}", error);
      error
    })?;
    let local_addr = listener.local_addr().map_err(Error::Bind)?;
    let dispatcher = Self::with_addr(Some(local_addr));
    let waiting = dispatcher.inner.fresh.waiting.clone();
    tracing::info!("[httptap] listening on {}", local_addr);
    tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((stream, peer_addr)) => {
            tracing::trace!("[httptap] accepted {}", peer_addr);
            if give(&waiting, PendingConnection::new(stream)).await.is_err() {
              break;
            }
          }
          Err(e) => {
            tracing::warn!("[httptap] failed to accept connection: {}", e);
            tokio::time::sleep(Duration::from_millis(10)).await;
          }
        }
      }
      tracing::debug!("[httptap] accept loop on {} stopped", local_addr);
    });
    Ok(dispatcher)
  }

  /// Address of the bound socket, if this dispatcher was created by
  /// [`listen`](Self::listen).
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.inner.local_addr
  }

  /// Hand a fresh connection to exactly one [`accept`](Self::accept) caller.
  ///
  /// Waits until a consumer is ready.
  pub async fn submit(&self, conn: PendingConnection) -> Result<()> {
    give(&self.inner.fresh.waiting, conn).await
  }

  /// Hand a taken-over tunnel to exactly one
  /// [`accept_reinjected`](Self::accept_reinjected) caller.
  ///
  /// Waits until a consumer is ready.
  pub async fn reinject(&self, conn: PendingConnection) -> Result<()> {
    give(&self.inner.tunnels.waiting, conn).await
  }

  /// Wait for the next fresh connection.
  pub async fn accept(&self) -> Option<PendingConnection> {
    self.inner.fresh.take().await
  }

  /// Wait for the next reinjected tunnel.
  pub async fn accept_reinjected(&self) -> Option<PendingConnection> {
    self.inner.tunnels.take().await
  }
}

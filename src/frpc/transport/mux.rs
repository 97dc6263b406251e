use std::{collections::VecDeque, future::Future, pin::Pin, sync::Mutex, task::Poll};

use futures_util::future::poll_fn;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

use super::BoxedStream;
use crate::error::Error;

const STREAM_WINDOW: u32 = 6 * 1024 * 1024;

type OpenReply = oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>;

/// Client side of a yamux session. The connection itself is owned by a
/// driver task; substreams are requested over a channel.
pub struct MuxSession {
    open_tx: mpsc::Sender<OpenReply>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

enum DriverExit {
    Shutdown,
    Closed,
    Failed(yamux::ConnectionError),
}

impl MuxSession {
    /// Liveness of the session is checked by the control heartbeat, see
    /// `TransportConfig::liveness`.
    pub fn client(io: BoxedStream) -> MuxSession {
        let mut config = yamux::Config::default();
        #[allow(deprecated)]
        config.set_receive_window(STREAM_WINDOW);
        config.set_max_buffer_size(STREAM_WINDOW as usize);

        let conn = yamux::Connection::new(io.compat(), config, yamux::Mode::Client);
        let (open_tx, open_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(drive(conn, open_rx, shutdown_rx));

        MuxSession {
            open_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
        }
    }

    pub async fn open_stream(&self) -> Result<BoxedStream, Error> {
        let (tx, rx) = oneshot::channel();
        self.open_tx
            .send(tx)
            .await
            .map_err(|_| Error::Transport("mux session closed".to_string()))?;
        let stream = rx
            .await
            .map_err(|_| Error::Transport("mux session closed".to_string()))?
            .map_err(|err| Error::Transport(format!("open mux stream: {err}")))?;
        Ok(Box::new(stream.compat()))
    }

    pub fn close(&self) {
        if let Ok(mut shutdown) = self.shutdown.lock() {
            if let Some(tx) = shutdown.take() {
                let _ = tx.send(());
            }
        }
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive<T>(
    mut conn: yamux::Connection<T>,
    mut open_rx: mpsc::Receiver<OpenReply>,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    T: futures_util::AsyncRead + futures_util::AsyncWrite + Unpin,
{
    let mut pending: VecDeque<OpenReply> = VecDeque::new();

    let exit = poll_fn(|cx| loop {
        if Pin::new(&mut shutdown_rx).poll(cx).is_ready() {
            return Poll::Ready(DriverExit::Shutdown);
        }

        let mut progressed = false;

        while let Poll::Ready(req) = open_rx.poll_recv(cx) {
            match req {
                Some(reply) => pending.push_back(reply),
                None => return Poll::Ready(DriverExit::Shutdown),
            }
        }

        if !pending.is_empty() {
            if let Poll::Ready(result) = conn.poll_new_outbound(cx) {
                if let Some(reply) = pending.pop_front() {
                    let _ = reply.send(result);
                }
                progressed = true;
            }
        }

        match conn.poll_next_inbound(cx) {
            Poll::Ready(Some(Ok(stream))) => {
                // The server never opens streams towards the client.
                drop(stream);
                progressed = true;
            }
            Poll::Ready(Some(Err(err))) => return Poll::Ready(DriverExit::Failed(err)),
            Poll::Ready(None) => return Poll::Ready(DriverExit::Closed),
            Poll::Pending => {}
        }

        if !progressed {
            return Poll::Pending;
        }
    })
    .await;

    for reply in pending.drain(..) {
        let _ = reply.send(Err(yamux::ConnectionError::Closed));
    }

    match exit {
        DriverExit::Shutdown => {
            if let Err(err) = poll_fn(|cx| conn.poll_close(cx)).await {
                debug!("closing mux session: {err}");
            }
        }
        DriverExit::Closed => debug!("mux session closed by peer"),
        DriverExit::Failed(err) => warn!("mux session failed: {err}"),
    }
}

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use log::debug;
use quinn::{crypto::rustls::QuicClientConfig, Endpoint, IdleTimeout, TransportConfig, VarInt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::BoxedStream;
use crate::error::Error;
use crate::frpc::config::QuicOptions;

pub const FRP_ALPN: &[u8] = b"frp";

const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(30);
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);
const DEFAULT_MAX_STREAMS: u32 = 100_000;

/// One bidirectional QUIC stream exposed as a byte stream.
pub struct QuicStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

fn transport_config(opts: &QuicOptions) -> Result<TransportConfig, Error> {
    let secs = |v: i64, default: Duration| {
        if v > 0 {
            Duration::from_secs(v as u64)
        } else {
            default
        }
    };

    let idle = IdleTimeout::try_from(secs(opts.max_idle_timeout, DEFAULT_MAX_IDLE))
        .map_err(|err| Error::InvalidConfig(format!("quic max idle timeout: {err}")))?;
    let streams = if opts.max_incoming_streams > 0 {
        u32::try_from(opts.max_incoming_streams).unwrap_or(u32::MAX)
    } else {
        DEFAULT_MAX_STREAMS
    };

    let mut transport = TransportConfig::default();
    transport
        .max_idle_timeout(Some(idle))
        .keep_alive_interval(Some(secs(opts.keepalive_period, DEFAULT_KEEPALIVE)))
        .max_concurrent_bidi_streams(VarInt::from_u32(streams));
    Ok(transport)
}

pub struct QuicSession {
    endpoint: Endpoint,
    conn: quinn::Connection,
}

impl QuicSession {
    pub async fn dial(
        addr: SocketAddr,
        server_name: &str,
        mut tls: rustls::ClientConfig,
        opts: &QuicOptions,
    ) -> Result<QuicSession, Error> {
        tls.alpn_protocols = vec![FRP_ALPN.to_vec()];
        let crypto = QuicClientConfig::try_from(tls)
            .map_err(|err| Error::Transport(format!("quic tls config: {err}")))?;
        let mut client = quinn::ClientConfig::new(Arc::new(crypto));
        client.transport_config(Arc::new(transport_config(opts)?));

        let bind: SocketAddr = if addr.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client);

        let conn = endpoint
            .connect(addr, server_name)
            .map_err(|err| Error::Transport(format!("quic connect to {addr}: {err}")))?
            .await
            .map_err(|err| Error::Transport(format!("quic connect to {addr}: {err}")))?;
        debug!("quic session established with {addr}");
        Ok(QuicSession { endpoint, conn })
    }

    pub async fn open_stream(&self) -> Result<BoxedStream, Error> {
        let (send, recv) = self
            .conn
            .open_bi()
            .await
            .map_err(|err| Error::Transport(format!("open quic stream: {err}")))?;
        Ok(Box::new(QuicStream { send, recv }))
    }

    pub fn close(&self) {
        self.conn.close(VarInt::from_u32(0), b"");
        self.endpoint.close(VarInt::from_u32(0), b"");
    }
}

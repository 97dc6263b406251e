use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
};

use log::{debug, info};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::error::Error;
use crate::frpc::config::{ClientCommonConfig, Protocol, TransportConfig};

use self::{mux::MuxSession, quic::QuicSession};

pub mod mux;
pub mod proxy;
pub mod quic;
pub mod tls;
pub mod websocket;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

enum Session {
    Mux(MuxSession),
    Quic(QuicSession),
}

impl Session {
    fn close(&self) {
        match self {
            Session::Mux(mux) => mux.close(),
            Session::Quic(quic) => quic.close(),
        }
    }
}

/// Hands out streams to the frps server. Depending on the transport this is
/// a fresh dial per stream, a substream of one yamux session, or a stream
/// of one QUIC connection.
pub struct Connector {
    config: Arc<ClientCommonConfig>,
    session: Mutex<Option<Arc<Session>>>,
}

impl Connector {
    pub fn new(config: Arc<ClientCommonConfig>) -> Connector {
        Connector {
            config,
            session: Mutex::new(None),
        }
    }

    fn server_name(&self) -> String {
        let tls = &self.config.transport.tls;
        if tls.server_name.is_empty() {
            self.config.server_addr.clone()
        } else {
            tls.server_name.clone()
        }
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session.lock().ok().and_then(|session| session.clone())
    }

    fn install(&self, session: Session) {
        let previous = match self.session.lock() {
            Ok(mut slot) => slot.replace(Arc::new(session)),
            Err(_) => None,
        };
        if let Some(previous) = previous {
            previous.close();
        }
    }

    /// Sets up the long-lived transport session, if the protocol uses one.
    pub async fn open(&self) -> Result<(), Error> {
        let transport = &self.config.transport;

        if transport.protocol == Protocol::Quic {
            let addr = resolve(&self.config.server_address()).await?;
            let tls_config = tls::client_config(&transport.tls)?;
            let session =
                QuicSession::dial(addr, &self.server_name(), tls_config, &transport.quic).await?;
            self.install(Session::Quic(session));
            return Ok(());
        }

        if transport.tcp_mux {
            let io = self.dial_raw().await?;
            let session = MuxSession::client(io);
            self.install(Session::Mux(session));
        }
        Ok(())
    }

    pub async fn connect(&self) -> Result<BoxedStream, Error> {
        match self.current().as_deref() {
            Some(Session::Quic(quic)) => quic.open_stream().await,
            Some(Session::Mux(mux)) => mux.open_stream().await,
            None => self.dial_raw().await,
        }
    }

    /// Releases the session. Safe to call more than once.
    pub fn close(&self) {
        let session = self.session.lock().ok().and_then(|mut slot| slot.take());
        if let Some(session) = session {
            session.close();
            debug!("transport session to {} closed", self.config.server_address());
        }
    }

    async fn dial_raw(&self) -> Result<BoxedStream, Error> {
        let config = &self.config;
        let transport = &config.transport;
        let target = config.server_address();

        match transport.protocol {
            Protocol::Kcp => Err(Error::Transport(
                "kcp transport is not supported by this client".to_string(),
            )),
            Protocol::Quic => Err(Error::Transport(
                "quic streams are opened from the session".to_string(),
            )),
            Protocol::Websocket => {
                let tcp = dial_tcp(transport, &target).await?;
                let ws = websocket::connect(tcp, &config.server_addr, config.server_port).await?;
                Ok(Box::new(ws))
            }
            Protocol::Wss => {
                let tcp = dial_tcp(transport, &target).await?;
                let tls_config = if transport.tls.enable {
                    tls::client_config(&transport.tls)?
                } else {
                    tls::public_client_config()?
                };
                let secured = tls::connect(tcp, tls_config, &self.server_name(), false).await?;
                let ws =
                    websocket::connect(secured, &config.server_addr, config.server_port).await?;
                Ok(Box::new(ws))
            }
            Protocol::Tcp => {
                let tcp = dial_tcp(transport, &target).await?;
                if !transport.tls.enable {
                    return Ok(Box::new(tcp));
                }
                let tls_config = tls::client_config(&transport.tls)?;
                let secured = tls::connect(
                    tcp,
                    tls_config,
                    &self.server_name(),
                    !transport.tls.disable_custom_tls_first_byte,
                )
                .await?;
                Ok(Box::new(secured))
            }
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.close();
    }
}

async fn resolve(target: &str) -> Result<SocketAddr, Error> {
    lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| Error::Transport(format!("no address found for {target}")))
}

async fn connect_tcp(transport: &TransportConfig, target: &str) -> Result<TcpStream, Error> {
    if !transport.proxy_url.is_empty() {
        let url = proxy::parse(&transport.proxy_url)?;
        info!("dialing {target} through proxy {}", url.scheme());
        return proxy::dial(&url, target).await;
    }

    let local_ip = if transport.connect_server_local_ip.is_empty() {
        None
    } else {
        Some(transport.connect_server_local_ip.parse::<IpAddr>().map_err(|err| {
            Error::InvalidConfig(format!(
                "invalid connectServerLocalIP {:?}: {err}",
                transport.connect_server_local_ip
            ))
        })?)
    };

    let mut last_err = None;
    for addr in lookup_host(target).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(ip) = local_ip {
            socket.bind(SocketAddr::new(ip, 0))?;
        }
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!("dial {addr} failed: {err}");
                last_err = Some(err);
            }
        }
    }
    Err(match last_err {
        Some(err) => err.into(),
        None => Error::Transport(format!("no address found for {target}")),
    })
}

/// Plain TCP dial honouring the local bind address, dial timeout, keepalive
/// and outbound proxy settings.
pub async fn dial_tcp(transport: &TransportConfig, target: &str) -> Result<TcpStream, Error> {
    let stream = match transport.dial_timeout() {
        Some(limit) => tokio::time::timeout(limit, connect_tcp(transport, target)).await??,
        None => connect_tcp(transport, target).await?,
    };
    stream.set_nodelay(true)?;
    if let Some(keepalive) = transport.keepalive() {
        SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(keepalive))?;
    }
    Ok(stream)
}

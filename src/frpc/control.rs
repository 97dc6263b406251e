use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, info, warn};
use tokio::io::split;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::auth::AuthSetter;
use super::config::{ClientCommonConfig, ProxyConfig};
use super::crypto::{CryptoReader, CryptoWriter};
use super::msg::{read_msg, write_msg, Login, LoginResp, Message, NatHoleResp, NewWorkConn, Ping};
use super::proxy::{ProxyManager, ProxyStatus};
use super::supervisor::Supervisor;
use super::transport::{BoxedStream, Connector};
use crate::error::Error;

/// Protocol version announced to frps.
pub const FRP_VERSION: &str = "0.58.1";

pub const LOGIN_READ_TIMEOUT: Duration = Duration::from_secs(10);
const START_WORK_CONN_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 100;
const PONG_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const PROXY_RETRY_INTERVAL: Duration = Duration::from_secs(10);

fn go_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64",
        other => other,
    }
}

/// Opens the transport, sends Login in plaintext and waits for LoginResp.
/// On success the returned stream is the control connection.
pub async fn login(
    config: &ClientCommonConfig,
    connector: &Connector,
    auth: &AuthSetter,
    run_id: &str,
) -> Result<(BoxedStream, LoginResp), Error> {
    connector.open().await?;
    let mut conn = connector.connect().await?;

    let mut login = Login {
        version: FRP_VERSION.to_string(),
        os: std::env::consts::OS.to_string(),
        arch: go_arch().to_string(),
        user: config.user.clone(),
        timestamp: chrono::Utc::now().timestamp(),
        run_id: run_id.to_string(),
        metas: config.metadatas.clone(),
        pool_count: config.transport.pool_count,
        ..Login::default()
    };
    auth.set_login(&mut login).await?;
    write_msg(&mut conn, &Message::Login(login)).await?;

    let resp = timeout(LOGIN_READ_TIMEOUT, read_msg(&mut conn))
        .await
        .map_err(|_| Error::Timeout("waiting for login response".to_string()))??;
    match resp {
        Message::LoginResp(resp) if !resp.error.is_empty() => Err(Error::LoginRejected(resp.error)),
        Message::LoginResp(resp) => Ok((conn, resp)),
        other => Err(Error::Protocol(format!(
            "expected LoginResp, got {}",
            other.name()
        ))),
    }
}

/// In-flight requests waiting for a NatHoleResp, keyed by transaction id.
#[derive(Default)]
pub struct Transactions {
    pending: Mutex<HashMap<String, oneshot::Sender<NatHoleResp>>>,
}

impl Transactions {
    pub fn register(&self, transaction_id: &str) -> oneshot::Receiver<NatHoleResp> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(transaction_id.to_string(), tx);
        }
        rx
    }

    /// Hands the response to its waiter. Returns false when nobody waits.
    pub fn dispatch(&self, resp: NatHoleResp) -> bool {
        let waiter = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&resp.transaction_id));
        match waiter {
            Some(tx) => tx.send(resp).is_ok(),
            None => false,
        }
    }
}

/// One logged-in control session to frps.
pub struct Control {
    run_id: String,
    config: Arc<ClientCommonConfig>,
    connector: Arc<Connector>,
    auth: AuthSetter,
    proxies: ProxyManager,
    transactions: Transactions,
    send_tx: mpsc::Sender<Message>,
    send_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    closed: CancellationToken,
    last_pong: Mutex<Instant>,
}

impl Control {
    pub fn new(
        run_id: String,
        config: Arc<ClientCommonConfig>,
        connector: Arc<Connector>,
        auth: AuthSetter,
    ) -> Arc<Control> {
        let (send_tx, send_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let proxies = ProxyManager::new(send_tx.clone(), config.auth.token.clone());
        Arc::new(Control {
            run_id,
            config,
            connector,
            auth,
            proxies,
            transactions: Transactions::default(),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            closed: CancellationToken::new(),
            last_pong: Mutex::new(Instant::now()),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn transactions(&self) -> &Transactions {
        &self.transactions
    }

    /// Requests the session to shut down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn reload(&self, proxies: Vec<ProxyConfig>) -> Result<(), Error> {
        self.proxies.reload(proxies).await
    }

    pub async fn proxy_statuses(&self) -> Vec<ProxyStatus> {
        self.proxies.statuses().await
    }

    async fn send(&self, msg: Message) -> Result<(), Error> {
        self.send_tx.send(msg).await.map_err(|_| Error::ChannelClosed)
    }

    fn touch_pong(&self) {
        if let Ok(mut last) = self.last_pong.lock() {
            let now = Instant::now();
            if now > *last {
                *last = now;
            }
        }
    }

    fn since_last_pong(&self) -> Duration {
        self.last_pong
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Drives the session over the logged-in connection until it is closed,
    /// then tears everything down in order.
    pub async fn run(self: Arc<Self>, conn: BoxedStream, proxies: Vec<ProxyConfig>) {
        let Some(send_rx) = self.send_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            warn!("control session {} already running", self.run_id);
            return;
        };

        let token = self.config.auth.token.as_bytes().to_vec();
        let (read_half, write_half) = split(conn);
        let reader = CryptoReader::new(read_half, &token);
        let writer = CryptoWriter::new(write_half, &token);

        let (read_tx, read_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let writer_stop = CancellationToken::new();

        let mut readers = Supervisor::default();
        readers.go("control reader", self.clone().read_loop(reader, read_tx));
        readers.go("control handler", self.clone().handle_loop(read_rx));
        let mut writers = Supervisor::default();
        writers.go(
            "control writer",
            self.clone().write_loop(writer, send_rx, writer_stop.clone()),
        );

        if let Err(err) = self.proxies.reload(proxies).await {
            warn!("registering proxies failed: {err}");
            self.close();
        }

        self.closed.cancelled().await;
        info!("control session {} closing", self.run_id);

        readers.wait().await;
        writer_stop.cancel();
        writers.wait().await;
        self.proxies.close().await;
        self.connector.close();
        info!("control session {} closed", self.run_id);
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: CryptoReader<R>, read_tx: mpsc::Sender<Message>)
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        loop {
            let msg = tokio::select! {
                _ = self.closed.cancelled() => return,
                msg = read_msg(&mut reader) => msg,
            };
            match msg {
                Ok(msg) => {
                    if read_tx.send(msg).await.is_err() {
                        return;
                    }
                }
                Err(Error::IoError(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!("control connection closed by server");
                    self.close();
                    return;
                }
                Err(err) => {
                    warn!("read from control connection failed: {err}");
                    self.close();
                    return;
                }
            }
        }
    }

    async fn write_loop<W>(
        self: Arc<Self>,
        mut writer: CryptoWriter<W>,
        mut send_rx: mpsc::Receiver<Message>,
        stop: CancellationToken,
    ) where
        W: tokio::io::AsyncWrite + Unpin + Send,
    {
        loop {
            let msg = tokio::select! {
                biased;
                msg = send_rx.recv() => msg,
                _ = stop.cancelled() => None,
            };
            let Some(msg) = msg else {
                return;
            };
            if let Err(err) = write_msg(&mut writer, &msg).await {
                warn!("write {} to control connection failed: {err}", msg.name());
                self.close();
                return;
            }
        }
    }

    async fn handle_loop(self: Arc<Self>, mut read_rx: mpsc::Receiver<Message>) {
        let (heartbeat_interval, heartbeat_timeout) = self.config.transport.liveness();

        let mut heartbeat = heartbeat_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut pong_check = heartbeat_timeout
            .map(|_| interval_at(Instant::now() + PONG_CHECK_INTERVAL, PONG_CHECK_INTERVAL));
        let mut proxy_retry = interval_at(Instant::now() + PROXY_RETRY_INTERVAL, PROXY_RETRY_INTERVAL);

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                msg = read_rx.recv() => match msg {
                    Some(msg) => self.dispatch(msg).await,
                    None => return,
                },
                _ = tick(&mut heartbeat) => {
                    let mut ping = Ping::default();
                    if let Err(err) = self.auth.set_ping(&mut ping).await {
                        warn!("authenticating heartbeat failed: {err}");
                        continue;
                    }
                    debug!("send heartbeat to server");
                    if self.send(Message::Ping(ping)).await.is_err() {
                        return;
                    }
                }
                _ = tick(&mut pong_check) => {
                    if let Some(limit) = heartbeat_timeout {
                        if self.since_last_pong() > limit {
                            warn!("heartbeat timeout after {limit:?}, closing control session");
                            self.close();
                            return;
                        }
                    }
                }
                _ = proxy_retry.tick() => {
                    if let Err(err) = self.proxies.retry_failed().await {
                        debug!("retrying proxies failed: {err}");
                    }
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::ReqWorkConn(_) => {
                let control = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = control.new_work_conn().await {
                        warn!("work connection failed: {err}");
                    }
                });
            }
            Message::NewProxyResp(resp) => {
                self.proxies
                    .start_proxy(&resp.proxy_name, &resp.remote_addr, &resp.error)
                    .await;
            }
            Message::NatHoleResp(resp) => {
                let tid = resp.transaction_id.clone();
                if !self.transactions.dispatch(resp) {
                    debug!("no waiter for nat hole response {tid}");
                }
            }
            Message::Pong(pong) => {
                if !pong.error.is_empty() {
                    warn!("pong carries error: {}", pong.error);
                    self.close();
                    return;
                }
                self.touch_pong();
                debug!("receive heartbeat from server");
            }
            other => debug!("ignoring unexpected {} message", other.name()),
        }
    }

    async fn new_work_conn(self: Arc<Self>) -> Result<(), Error> {
        let mut conn = self.connector.connect().await?;

        let mut msg = NewWorkConn {
            run_id: self.run_id.clone(),
            ..NewWorkConn::default()
        };
        self.auth.set_new_work_conn(&mut msg).await?;
        write_msg(&mut conn, &Message::NewWorkConn(msg)).await?;

        let start = timeout(START_WORK_CONN_TIMEOUT, read_msg(&mut conn))
            .await
            .map_err(|_| Error::Timeout("waiting for StartWorkConn".to_string()))??;
        let Message::StartWorkConn(start) = start else {
            return Err(Error::Protocol(format!(
                "expected StartWorkConn, got {}",
                start.name()
            )));
        };

        let name = start.proxy_name.clone();
        self.proxies.handle_work_conn(&name, conn, start).await;
        Ok(())
    }
}

async fn tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frpc::config::{AuthClientConfig, TransportConfig};
    use crate::frpc::msg::{LoginResp, NewProxyResp, Pong, ReqWorkConn, StartWorkConn};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn config(port: u16, transport: TransportConfig) -> Arc<ClientCommonConfig> {
        Arc::new(ClientCommonConfig {
            server_addr: "127.0.0.1".to_string(),
            server_port: port,
            auth: AuthClientConfig {
                token: "T".to_string(),
                ..AuthClientConfig::default()
            },
            transport,
            ..ClientCommonConfig::default()
        })
    }

    async fn accept_login(listener: &TcpListener, error: &str) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        answer_login(&mut stream, error).await;
        stream
    }

    async fn answer_login<S>(stream: &mut S, error: &str)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let login = match read_msg(&mut *stream).await.unwrap() {
            Message::Login(login) => login,
            other => panic!("expected login, got {other:?}"),
        };
        assert_eq!(login.privilege_key, crate::frpc::auth::auth_key("T", login.timestamp));
        write_msg(
            &mut *stream,
            &Message::LoginResp(LoginResp {
                version: FRP_VERSION.to_string(),
                run_id: "run-1".to_string(),
                error: error.to_string(),
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn login_returns_run_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move { accept_login(&listener, "").await });

        let cfg = config(port, TransportConfig::default());
        let connector = Connector::new(cfg.clone());
        let auth = AuthSetter::new(&cfg.auth);
        let (_conn, resp) = login(&cfg, &connector, &auth, "").await.unwrap();
        assert_eq!(resp.run_id, "run-1");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn login_error_is_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move { accept_login(&listener, "token mismatch").await });

        let cfg = config(port, TransportConfig::default());
        let connector = Connector::new(cfg.clone());
        let auth = AuthSetter::new(&cfg.auth);
        let err = login(&cfg, &connector, &auth, "").await.err().unwrap();
        assert!(matches!(err, Error::LoginRejected(ref e) if e == "token mismatch"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn transactions_route_by_id() {
        let txs = Transactions::default();
        let rx = txs.register("tx-1");
        assert!(!txs.dispatch(NatHoleResp {
            transaction_id: "tx-2".to_string(),
            ..NatHoleResp::default()
        }));
        assert!(txs.dispatch(NatHoleResp {
            transaction_id: "tx-1".to_string(),
            sid: "s".to_string(),
            ..NatHoleResp::default()
        }));
        assert_eq!(rx.await.unwrap().sid, "s");
    }

    #[tokio::test]
    async fn session_registers_proxies_and_serves_work_conns() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            stream.write_all(b"pong").await.unwrap();
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cfg = config(port, TransportConfig::default());

        let server = tokio::spawn(async move {
            let stream = accept_login(&listener, "").await;
            let (r, w) = tokio::io::split(stream);
            let mut r = CryptoReader::new(r, b"T");
            let mut w = CryptoWriter::new(w, b"T");

            let Message::NewProxy(proxy) = read_msg(&mut r).await.unwrap() else {
                panic!("expected NewProxy");
            };
            assert_eq!(proxy.proxy_name, "app.web.http");
            write_msg(
                &mut w,
                &Message::NewProxyResp(NewProxyResp {
                    proxy_name: proxy.proxy_name.clone(),
                    remote_addr: ":80".to_string(),
                    error: String::new(),
                }),
            )
            .await
            .unwrap();
            write_msg(&mut w, &Message::ReqWorkConn(ReqWorkConn {}))
                .await
                .unwrap();

            let (mut work, _) = listener.accept().await.unwrap();
            let Message::NewWorkConn(nwc) = read_msg(&mut work).await.unwrap() else {
                panic!("expected NewWorkConn");
            };
            assert_eq!(nwc.run_id, "run-1");
            write_msg(
                &mut work,
                &Message::StartWorkConn(StartWorkConn {
                    proxy_name: "app.web.http".to_string(),
                    ..StartWorkConn::default()
                }),
            )
            .await
            .unwrap();
            let mut buf = [0u8; 4];
            work.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
            (r, w)
        });

        let connector = Arc::new(Connector::new(cfg.clone()));
        let auth = AuthSetter::new(&cfg.auth);
        let (conn, resp) = login(&cfg, &connector, &auth, "").await.unwrap();
        let control = Control::new(resp.run_id, cfg, connector, auth);
        let proxy = ProxyConfig {
            name: "app.web.http".to_string(),
            type_: "tcp".to_string(),
            local_ip: "127.0.0.1".to_string(),
            local_port: backend_port,
            remote_port: 80,
            ..ProxyConfig::default()
        };
        let session = tokio::spawn(control.clone().run(conn, vec![proxy]));

        let _control_conn = server.await.unwrap();
        let statuses = control.proxy_statuses().await;
        assert_eq!(statuses[0].remote_addr, ":80");
        control.close();
        session.await.unwrap();
        assert!(control.proxy_statuses().await.is_empty());
    }

    #[tokio::test]
    async fn missing_pongs_close_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cfg = config(
            port,
            TransportConfig {
                heartbeat_interval: 1,
                heartbeat_timeout: 3,
                ..TransportConfig::default()
            },
        );

        let server = tokio::spawn(async move {
            let stream = accept_login(&listener, "").await;
            let (r, w) = tokio::io::split(stream);
            let mut r = CryptoReader::new(r, b"T");
            let _w = CryptoWriter::new(w, b"T");
            // swallow pings without answering
            while let Ok(msg) = read_msg(&mut r).await {
                assert!(matches!(msg, Message::Ping(_)));
            }
        });

        let connector = Arc::new(Connector::new(cfg.clone()));
        let auth = AuthSetter::new(&cfg.auth);
        let (conn, resp) = login(&cfg, &connector, &auth, "").await.unwrap();
        let control = Control::new(resp.run_id, cfg, connector, auth);
        let started = Instant::now();
        control.clone().run(conn, Vec::new()).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "{elapsed:?}");
        assert!(control.is_closed());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn silent_mux_peer_closes_the_session() {
        use futures_util::future::poll_fn;
        use std::task::Poll;
        use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cfg = config(
            port,
            TransportConfig {
                tcp_mux: true,
                tcp_mux_keepalive_interval: 1,
                heartbeat_interval: -1,
                ..TransportConfig::default()
            },
        );

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut conn =
                yamux::Connection::new(tcp.compat(), yamux::Config::default(), yamux::Mode::Server);
            let stream = poll_fn(|cx| conn.poll_next_inbound(cx))
                .await
                .unwrap()
                .unwrap();
            let driver = tokio::spawn(async move {
                poll_fn(|cx| match conn.poll_next_inbound(cx) {
                    Poll::Ready(None) | Poll::Ready(Some(Err(_))) => Poll::Ready(()),
                    _ => Poll::Pending,
                })
                .await
            });

            let mut stream = stream.compat();
            answer_login(&mut stream, "").await;
            let (r, w) = tokio::io::split(stream);
            let mut r = CryptoReader::new(r, b"T");
            let _w = CryptoWriter::new(w, b"T");
            // the mux stays up but nothing is answered
            let mut pings = 0;
            while let Ok(msg) = read_msg(&mut r).await {
                assert!(matches!(msg, Message::Ping(_)));
                pings += 1;
            }
            driver.abort();
            pings
        });

        let connector = Arc::new(Connector::new(cfg.clone()));
        let auth = AuthSetter::new(&cfg.auth);
        let (conn, resp) = login(&cfg, &connector, &auth, "").await.unwrap();
        let control = Control::new(resp.run_id, cfg, connector, auth);
        let started = Instant::now();
        control.clone().run(conn, Vec::new()).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
        assert!(control.is_closed());

        let pings = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(pings >= 1, "{pings}");
    }

    #[tokio::test]
    async fn pong_with_error_closes() {
        let cfg = config(1, TransportConfig::default());
        let connector = Arc::new(Connector::new(cfg.clone()));
        let auth = AuthSetter::new(&cfg.auth);
        let control = Control::new("r".to_string(), cfg, connector, auth);
        control
            .dispatch(Message::Pong(Pong {
                error: "bad token".to_string(),
            }))
            .await;
        assert!(control.is_closed());
    }
}

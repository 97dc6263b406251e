use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use url::Url;

use crate::error::Error;

const MAX_RESPONSE_HEADER: usize = 8192;
const MAX_RESPONSE_HEADERS: usize = 64;

fn proxy_address(url: &Url) -> Result<String, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidConfig(format!("proxy url {url} has no host")))?;
    let port = url.port_or_known_default().unwrap_or(match url.scheme() {
        "socks5" => 1080,
        _ => 8080,
    });
    Ok(format!("{host}:{port}"))
}

fn credentials(url: &Url) -> Option<(String, String)> {
    (!url.username().is_empty()).then(|| {
        (
            url.username().to_string(),
            url.password().unwrap_or_default().to_string(),
        )
    })
}

pub fn parse(proxy_url: &str) -> Result<Url, Error> {
    let url = Url::parse(proxy_url)
        .map_err(|err| Error::InvalidConfig(format!("invalid proxy url {proxy_url:?}: {err}")))?;
    match url.scheme() {
        "http" | "socks5" => Ok(url),
        other => Err(Error::InvalidConfig(format!("unsupported proxy scheme {other:?}"))),
    }
}

fn connect_request(target: &str, auth: Option<(String, String)>) -> String {
    let mut req = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some((user, password)) = auth {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
        req.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    req.push_str("\r\n");
    req
}

async fn http_connect(url: &Url, target: &str) -> Result<TcpStream, Error> {
    let mut stream = TcpStream::connect(proxy_address(url)?).await?;
    stream
        .write_all(connect_request(target, credentials(url)).as_bytes())
        .await?;

    // Read byte-wise so nothing past the header is consumed.
    let mut header = Vec::new();
    let (code, reason) = loop {
        if header.len() >= MAX_RESPONSE_HEADER {
            return Err(Error::Transport("proxy response header too large".to_string()));
        }
        header.push(stream.read_u8().await?);
        if !header.ends_with(b"\n") {
            continue;
        }
        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&header) {
            Ok(httparse::Status::Complete(_)) => {
                break (
                    response.code.unwrap_or_default(),
                    response.reason.unwrap_or_default().to_string(),
                )
            }
            Ok(httparse::Status::Partial) => {}
            Err(err) => {
                return Err(Error::Transport(format!("invalid proxy response: {err}")));
            }
        }
    };

    if code != 200 {
        return Err(Error::Transport(format!(
            "proxy refused CONNECT to {target}: {code} {reason}"
        )));
    }
    Ok(stream)
}

async fn socks5_connect(url: &Url, target: &str) -> Result<TcpStream, Error> {
    let proxy = proxy_address(url)?;
    let stream = match credentials(url) {
        Some((user, password)) => {
            Socks5Stream::connect_with_password(proxy.as_str(), target, &user, &password).await
        }
        None => Socks5Stream::connect(proxy.as_str(), target).await,
    }
    .map_err(|err| Error::Transport(format!("socks5 proxy to {target} failed: {err}")))?;
    Ok(stream.into_inner())
}

pub async fn dial(url: &Url, target: &str) -> Result<TcpStream, Error> {
    match url.scheme() {
        "http" => http_connect(url, target).await,
        "socks5" => socks5_connect(url, target).await,
        other => Err(Error::InvalidConfig(format!("unsupported proxy scheme {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn rejects_unknown_schemes() {
        assert!(parse("ftp://proxy:21").is_err());
        assert!(parse("not a url").is_err());
        assert_eq!(parse("socks5://p:1080").unwrap().scheme(), "socks5");
    }

    #[test]
    fn connect_request_carries_basic_auth() {
        let req = connect_request("frps:7000", Some(("u".to_string(), "p".to_string())));
        assert!(req.starts_with("CONNECT frps:7000 HTTP/1.1\r\n"));
        assert!(req.contains("Proxy-Authorization: Basic dTpw\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn http_connect_tunnels_after_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "CONNECT frps:7000 HTTP/1.1\r\n");
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" {
                    break;
                }
            }
            let mut stream = reader.into_inner();
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhi")
                .await
                .unwrap();
        });

        let url = parse(&format!("http://{addr}")).unwrap();
        let mut stream = dial(&url, "frps:7000").await.unwrap();
        let mut rest = [0u8; 2];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"hi");
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn http_connect_reads_a_fragmented_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).await;
            for part in [
                &b"HTTP/1.1 200 Conn"[..],
                b"ection established\r\nVia: 1.1 squ",
                b"id\r\n",
                b"\r\nhi",
            ] {
                stream.write_all(part).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        });

        let url = parse(&format!("http://{addr}")).unwrap();
        let mut stream = dial(&url, "frps:7000").await.unwrap();
        let mut rest = [0u8; 2];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"hi");
    }

    #[tokio::test]
    async fn http_connect_rejects_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"SSH-2.0-OpenSSH\r\n\r\n").await;
        });

        let url = parse(&format!("http://{addr}")).unwrap();
        let err = dial(&url, "frps:7000").await.unwrap_err();
        assert!(err.to_string().contains("invalid proxy response"), "{err}");
    }

    #[tokio::test]
    async fn http_connect_rejects_non_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let url = parse(&format!("http://{addr}")).unwrap();
        let err = dial(&url, "frps:7000").await.unwrap_err();
        assert!(err.to_string().contains("407"));
    }
}

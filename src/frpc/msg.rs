//! FRP control messages and their framing: a one byte type tag, a big-endian
//! `i64` body length and a JSON body.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

pub const MAX_MSG_LENGTH: i64 = 10240;

pub const TYPE_LOGIN: u8 = b'o';
pub const TYPE_LOGIN_RESP: u8 = b'1';
pub const TYPE_NEW_PROXY: u8 = b'p';
pub const TYPE_NEW_PROXY_RESP: u8 = b'2';
pub const TYPE_CLOSE_PROXY: u8 = b'c';
pub const TYPE_NEW_WORK_CONN: u8 = b'w';
pub const TYPE_REQ_WORK_CONN: u8 = b'r';
pub const TYPE_START_WORK_CONN: u8 = b's';
pub const TYPE_PING: u8 = b'h';
pub const TYPE_PONG: u8 = b'4';
pub const TYPE_NAT_HOLE_RESP: u8 = b'm';

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Login {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub timestamp: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metas: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "is_zero_i32")]
    pub pool_count: i32,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoginResp {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NewProxy {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_type: String,
    #[serde(skip_serializing_if = "is_false")]
    pub use_encryption: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub use_compression: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metas: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub remote_port: u16,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NewProxyResp {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CloseProxy {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NewWorkConn {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub timestamp: i64,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReqWorkConn {}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StartWorkConn {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub src_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dst_addr: String,
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub src_port: u16,
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub dst_port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Ping {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub timestamp: i64,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Pong {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NatHoleResp {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub transaction_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidate_addrs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub assisted_addrs: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    NewWorkConn(NewWorkConn),
    ReqWorkConn(ReqWorkConn),
    StartWorkConn(StartWorkConn),
    Ping(Ping),
    Pong(Pong),
    NatHoleResp(NatHoleResp),
}

impl Message {
    pub fn type_byte(&self) -> u8 {
        match self {
            Message::Login(_) => TYPE_LOGIN,
            Message::LoginResp(_) => TYPE_LOGIN_RESP,
            Message::NewProxy(_) => TYPE_NEW_PROXY,
            Message::NewProxyResp(_) => TYPE_NEW_PROXY_RESP,
            Message::CloseProxy(_) => TYPE_CLOSE_PROXY,
            Message::NewWorkConn(_) => TYPE_NEW_WORK_CONN,
            Message::ReqWorkConn(_) => TYPE_REQ_WORK_CONN,
            Message::StartWorkConn(_) => TYPE_START_WORK_CONN,
            Message::Ping(_) => TYPE_PING,
            Message::Pong(_) => TYPE_PONG,
            Message::NatHoleResp(_) => TYPE_NAT_HOLE_RESP,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Login(_) => "Login",
            Message::LoginResp(_) => "LoginResp",
            Message::NewProxy(_) => "NewProxy",
            Message::NewProxyResp(_) => "NewProxyResp",
            Message::CloseProxy(_) => "CloseProxy",
            Message::NewWorkConn(_) => "NewWorkConn",
            Message::ReqWorkConn(_) => "ReqWorkConn",
            Message::StartWorkConn(_) => "StartWorkConn",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::NatHoleResp(_) => "NatHoleResp",
        }
    }

    fn body(&self) -> Result<Vec<u8>, Error> {
        let body = match self {
            Message::Login(m) => serde_json::to_vec(m)?,
            Message::LoginResp(m) => serde_json::to_vec(m)?,
            Message::NewProxy(m) => serde_json::to_vec(m)?,
            Message::NewProxyResp(m) => serde_json::to_vec(m)?,
            Message::CloseProxy(m) => serde_json::to_vec(m)?,
            Message::NewWorkConn(m) => serde_json::to_vec(m)?,
            Message::ReqWorkConn(m) => serde_json::to_vec(m)?,
            Message::StartWorkConn(m) => serde_json::to_vec(m)?,
            Message::Ping(m) => serde_json::to_vec(m)?,
            Message::Pong(m) => serde_json::to_vec(m)?,
            Message::NatHoleResp(m) => serde_json::to_vec(m)?,
        };
        Ok(body)
    }

    fn decode(type_byte: u8, body: &[u8]) -> Result<Message, Error> {
        fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
            Ok(serde_json::from_slice(body)?)
        }

        let msg = match type_byte {
            TYPE_LOGIN => Message::Login(parse(body)?),
            TYPE_LOGIN_RESP => Message::LoginResp(parse(body)?),
            TYPE_NEW_PROXY => Message::NewProxy(parse(body)?),
            TYPE_NEW_PROXY_RESP => Message::NewProxyResp(parse(body)?),
            TYPE_CLOSE_PROXY => Message::CloseProxy(parse(body)?),
            TYPE_NEW_WORK_CONN => Message::NewWorkConn(parse(body)?),
            TYPE_REQ_WORK_CONN => Message::ReqWorkConn(parse(body)?),
            TYPE_START_WORK_CONN => Message::StartWorkConn(parse(body)?),
            TYPE_PING => Message::Ping(parse(body)?),
            TYPE_PONG => Message::Pong(parse(body)?),
            TYPE_NAT_HOLE_RESP => Message::NatHoleResp(parse(body)?),
            other => {
                return Err(Error::Protocol(format!(
                    "unknown message type {:?}",
                    other as char
                )))
            }
        };
        Ok(msg)
    }
}

pub fn encode(msg: &Message) -> Result<Vec<u8>, Error> {
    let body = msg.body()?;
    let mut frame = Vec::with_capacity(body.len() + 9);
    frame.push(msg.type_byte());
    frame.extend_from_slice(&(body.len() as i64).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_msg<W>(w: &mut W, msg: &Message) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(msg)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_msg<R>(r: &mut R) -> Result<Message, Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let type_byte = r.read_u8().await?;
    let length = r.read_i64().await?;
    if !(0..=MAX_MSG_LENGTH).contains(&length) {
        return Err(Error::Protocol(format!("message length {length} out of range")));
    }
    let mut body = vec![0u8; length as usize];
    r.read_exact(&mut body).await?;
    Message::decode(type_byte, &body)
}

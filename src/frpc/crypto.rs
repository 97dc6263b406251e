//! AES-128-CFB stream wrappers used on the control connection. The writer
//! sends its random IV ahead of the first ciphertext byte; the reader expects
//! the peer's IV the same way.

use std::{
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use aes::Aes128;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use rand::Rng;
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub const DEFAULT_SALT: &[u8] = b"frp";
const BLOCK_SIZE: usize = 16;
const KEY_ROUNDS: u32 = 64;

pub fn derive_key(token: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut key = [0u8; BLOCK_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha1>(token, DEFAULT_SALT, KEY_ROUNDS, &mut key);
    key
}

pub struct CryptoWriter<W> {
    inner: W,
    enc: BufEncryptor<Aes128>,
    pending: Vec<u8>,
    pos: usize,
}

impl<W: AsyncWrite + Unpin> CryptoWriter<W> {
    pub fn new(inner: W, token: &[u8]) -> Self {
        let key = derive_key(token);
        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill(&mut iv);
        Self::with_iv(inner, &key, iv)
    }

    fn with_iv(inner: W, key: &[u8; BLOCK_SIZE], iv: [u8; BLOCK_SIZE]) -> Self {
        let enc = BufEncryptor::<Aes128>::new(key.into(), &iv.into());
        CryptoWriter {
            inner,
            enc,
            pending: iv.to_vec(),
            pos: 0,
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pos < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pos += n;
        }
        self.pending.clear();
        self.pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CryptoWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        let mut data = buf.to_vec();
        this.enc.encrypt(&mut data);
        this.pending = data;
        this.pos = 0;

        // Ciphertext is already committed, so a pending inner writer is
        // finished by the next write or flush.
        if let Poll::Ready(Err(err)) = this.poll_drain(cx) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

pub struct CryptoReader<R> {
    inner: R,
    key: [u8; BLOCK_SIZE],
    iv: [u8; BLOCK_SIZE],
    iv_len: usize,
    dec: Option<BufDecryptor<Aes128>>,
}

impl<R: AsyncRead + Unpin> CryptoReader<R> {
    pub fn new(inner: R, token: &[u8]) -> Self {
        CryptoReader {
            inner,
            key: derive_key(token),
            iv: [0u8; BLOCK_SIZE],
            iv_len: 0,
            dec: None,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CryptoReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.dec.is_none() {
            let mut iv_buf = ReadBuf::new(&mut this.iv[this.iv_len..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut iv_buf))?;
            let n = iv_buf.filled().len();
            if n == 0 {
                if this.iv_len == 0 {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed while reading iv",
                )));
            }
            this.iv_len += n;
            if this.iv_len == BLOCK_SIZE {
                this.dec = Some(BufDecryptor::<Aes128>::new(
                    (&this.key).into(),
                    (&this.iv).into(),
                ));
            }
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(dec) = this.dec.as_mut() {
            dec.decrypt(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

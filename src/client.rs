// Client module - request/response wrapper over the line protocol
// Typed helpers quote keys and values; anything containing a quote
// character should go through `request` directly.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::{KvError, Result};

pub struct KvClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl KvClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<KvClient> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        Ok(KvClient {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    /// Send one command line and return the reply line, newline stripped.
    pub async fn request(&mut self, command: impl AsRef<[u8]>) -> Result<Bytes> {
        self.writer.write_all(command.as_ref()).await?;
        self.writer.write_all(b"\n").await?;
        self.read_line().await
    }

    async fn read_line(&mut self) -> Result<Bytes> {
        let mut line = Vec::new();
        let n = self.reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(KvError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Bytes::from(line))
    }

    pub async fn put(&mut self, key: &str, value: &str) -> Result<bool> {
        let reply = self
            .request(format!("PUT \"{}\" \"{}\"", key, value))
            .await?;
        Ok(reply.as_ref() == b"OK")
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        let reply = self.request(format!("GET \"{}\"", key)).await?;
        if reply.as_ref() == b"NOT_FOUND" {
            Ok(None)
        } else {
            Ok(Some(reply))
        }
    }

    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        let reply = self.request(format!("DELETE \"{}\"", key)).await?;
        Ok(reply.as_ref() == b"OK")
    }

    pub async fn exists(&mut self, key: &str) -> Result<bool> {
        let reply = self.request(format!("EXISTS \"{}\"", key)).await?;
        Ok(reply.as_ref() == b"true")
    }

    pub async fn size(&mut self) -> Result<usize> {
        let reply = self.request("SIZE").await?;
        std::str::from_utf8(&reply)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(KvError::Protocol("unexpected SIZE reply"))
    }

    pub async fn ping(&mut self) -> Result<bool> {
        let reply = self.request("PING").await?;
        Ok(reply.as_ref() == b"PONG")
    }

    pub async fn flush(&mut self) -> Result<bool> {
        let reply = self.request("FLUSH").await?;
        Ok(reply.as_ref() == b"OK")
    }

    /// STATS replies with a four-line body; collect it whole.
    pub async fn stats(&mut self) -> Result<String> {
        let mut body = String::new();
        let first = self.request("STATS").await?;
        body.push_str(&String::from_utf8_lossy(&first));
        for _ in 0..3 {
            let line = self.read_line().await?;
            body.push('\n');
            body.push_str(&String::from_utf8_lossy(&line));
        }
        Ok(body)
    }
}

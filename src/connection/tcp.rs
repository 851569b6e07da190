//! Single-node TCP connection with buffered RESP I/O.

use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::Connection;
use crate::config::Endpoint;
use crate::error::{MigrationError, Result};
use crate::protocol::{decode_value, encode_pipeline, Command, Value};

/// Default read/write buffer size (8 KB).
const DEFAULT_BUF_SIZE: usize = 8 * 1024;

/// A connection to one store node.
///
/// Any transport failure drops the socket; the next round trip fails with
/// [`MigrationError::Connection`] until [`Connection::reconnect`] succeeds.
pub struct RespConnection {
    endpoint: Endpoint,
    connect_timeout: Duration,
    io_timeout: Duration,
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl RespConnection {
    /// Open a connection, authenticate and select the database.
    pub async fn connect(
        endpoint: Endpoint,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        let mut conn = Self {
            endpoint,
            connect_timeout,
            io_timeout,
            stream: None,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
        };
        conn.open().await?;
        Ok(conn)
    }

    /// Endpoint this connection points at
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open(&mut self) -> Result<()> {
        let addr = self.endpoint.addr();
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| MigrationError::Timeout(self.connect_timeout))?
            .map_err(|e| MigrationError::Connection(format!("{}: {}", addr, e)))?;
        tcp.set_nodelay(true)?;

        self.stream = Some(tcp);
        self.read_buf.clear();
        debug!(addr = %addr, "connected");

        if let Some(password) = self.endpoint.password.clone() {
            let auth = match self.endpoint.username.clone() {
                Some(user) => Command::new("AUTH").arg(user).arg(password),
                None => Command::new("AUTH").arg(password),
            };
            let reply = self.execute(auth).await?;
            if !is_ok(&reply) {
                self.stream = None;
                return Err(MigrationError::Connection(format!(
                    "{}: authentication failed: {}",
                    addr, reply
                )));
            }
        }

        if self.endpoint.database != 0 {
            let reply = self
                .execute(Command::new("SELECT").arg(self.endpoint.database as u64))
                .await?;
            if !is_ok(&reply) {
                self.stream = None;
                return Err(MigrationError::Connection(format!(
                    "{}: unexpected SELECT response: {}",
                    addr, reply
                )));
            }
        }

        Ok(())
    }

    async fn round_trip(&mut self, count: usize) -> Result<Vec<Value>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MigrationError::Connection("not connected".into()))?;

        stream.write_all(&self.write_buf).await?;
        stream.flush().await?;
        self.write_buf.clear();

        let mut replies = Vec::with_capacity(count);
        while replies.len() < count {
            if let Some(value) = decode_value(&mut self.read_buf)? {
                replies.push(value);
                continue;
            }
            let n = stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(MigrationError::Connection("connection closed by peer".into()));
            }
        }
        Ok(replies)
    }
}

fn is_ok(reply: &Value) -> bool {
    matches!(reply, Value::Status(s) if s == "OK")
}

#[async_trait]
impl Connection for RespConnection {
    async fn pipeline(&mut self, commands: Vec<Command>) -> Result<Vec<Value>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        if self.stream.is_none() {
            return Err(MigrationError::Connection(format!(
                "{}: not connected",
                self.endpoint.addr()
            )));
        }

        self.write_buf.clear();
        encode_pipeline(&commands, &mut self.write_buf);
        trace!(addr = %self.endpoint.addr(), commands = commands.len(), "pipeline");

        let io_timeout = self.io_timeout;
        let result = match tokio::time::timeout(io_timeout, self.round_trip(commands.len())).await
        {
            Ok(result) => result,
            Err(_) => Err(MigrationError::Timeout(io_timeout)),
        };

        if let Err(e) = &result {
            // the stream position is unknown after a failed round trip
            debug!(addr = %self.endpoint.addr(), error = %e, "dropping connection");
            self.stream = None;
            self.read_buf.clear();
            self.write_buf.clear();
        }
        result
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.stream = None;
        self.open().await
    }

    fn addr(&self) -> String {
        self.endpoint.addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_value;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    /// A one-shot fake server: answers each accepted batch with `replies`.
    async fn serve(replies: Vec<Value>) -> (Endpoint, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
            let mut out = BytesMut::new();
            for reply in &replies {
                encode_value(reply, &mut out);
            }
            socket.write_all(&out).await.unwrap();
            received
        });
        let endpoint = Endpoint::parse(&addr.to_string()).unwrap();
        (endpoint, handle)
    }

    #[tokio::test]
    async fn test_pipeline_round_trip() {
        let (endpoint, server) = serve(vec![
            Value::Status("OK".into()),
            Value::Error("WRONGTYPE nope".into()),
            Value::Bulk(Bytes::from("v")),
        ])
        .await;

        let mut conn =
            RespConnection::connect(endpoint, Duration::from_secs(1), Duration::from_secs(1))
                .await
                .unwrap();
        let replies = conn
            .pipeline(vec![
                Command::new("SET").arg("k").arg("v"),
                Command::new("LPUSH").arg("k").arg("x"),
                Command::new("GET").arg("k"),
            ])
            .await
            .unwrap();

        assert_eq!(replies.len(), 3);
        assert!(replies[1].is_error());
        assert_eq!(replies[2], Value::Bulk(Bytes::from("v")));

        let received = server.await.unwrap();
        assert!(received.starts_with(b"*3\r\n$3\r\nSET\r\n"));
    }

    #[tokio::test]
    async fn test_closed_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let endpoint = Endpoint::parse(&addr.to_string()).unwrap();
        let mut conn =
            RespConnection::connect(endpoint, Duration::from_secs(1), Duration::from_secs(1))
                .await
                .unwrap();
        let err = conn.execute(Command::new("PING")).await.unwrap_err();
        assert!(err.is_transient());

        // the socket is gone until reconnect
        let err = conn.execute(Command::new("PING")).await.unwrap_err();
        assert!(matches!(err, MigrationError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = Endpoint::parse(&addr.to_string()).unwrap();
        let result =
            RespConnection::connect(endpoint, Duration::from_secs(1), Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}

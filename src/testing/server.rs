//! RESP server in front of a [`MemoryStore`].

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

use super::MemoryStore;
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{decode_value, encode_value, Command, Value};

/// Serve `store` on an ephemeral localhost port until the handle is aborted.
pub async fn spawn_server(store: MemoryStore) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(serve(store, listener));
    Ok((addr, handle))
}

/// Accept connections on `listener`, one task per client.
pub async fn serve(store: MemoryStore, listener: TcpListener) {
    loop {
        let Ok((socket, peer)) = listener.accept().await else {
            return;
        };
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(store, socket).await {
                debug!(%peer, error = %e, "client connection closed");
            }
        });
    }
}

async fn handle_client(store: MemoryStore, mut socket: TcpStream) -> Result<()> {
    socket.set_nodelay(true)?;
    let mut conn = store.connection();
    let mut read_buf = BytesMut::with_capacity(16 * 1024);
    let mut write_buf = BytesMut::with_capacity(16 * 1024);

    loop {
        if socket.read_buf(&mut read_buf).await? == 0 {
            return Ok(());
        }

        // Answer everything already buffered as one pipeline.
        let mut commands = Vec::new();
        let mut replies = Vec::new();
        while let Some(frame) = decode_value(&mut read_buf)? {
            match into_command(frame) {
                Some(cmd) => commands.push(cmd),
                None => replies.push(Value::Error("ERR Protocol error".into())),
            }
        }
        if !commands.is_empty() {
            // An unreachable store drops the client.
            replies.extend(conn.pipeline(commands).await?);
        }

        for reply in &replies {
            encode_value(reply, &mut write_buf);
        }
        socket.write_all(&write_buf).await?;
        write_buf.clear();
    }
}

fn into_command(frame: Value) -> Option<Command> {
    let Value::Array(parts) = frame else {
        return None;
    };
    let args = parts
        .into_iter()
        .map(|part| match part {
            Value::Bulk(b) => Some(b),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Command::from_args(args)
}

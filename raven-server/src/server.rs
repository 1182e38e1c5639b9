//! Accept loop and engine event loop.

use std::collections::HashMap;

use anyhow::{Context, Result};
use raven_core::connection::ConnId;
use raven_core::{Engine, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

/// Events flowing from connection tasks into the engine loop.
enum NetEvent {
    Connected {
        peer: String,
        writer: mpsc::UnboundedSender<Vec<u8>>,
        reply: oneshot::Sender<Option<ConnId>>,
    },
    Input {
        conn: ConnId,
        bytes: Vec<u8>,
    },
    Eof {
        conn: ConnId,
    },
}

pub struct Server {
    listener: TcpListener,
    engine: Engine,
}

impl Server {
    /// Bind the listen socket and load the world. Fails early if either
    /// the address or the anchor directory is unusable.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen.0)
            .await
            .with_context(|| format!("binding {}", config.listen.0))?;
        let mut engine = Engine::new(config.engine);
        engine.load_world()?;
        Ok(Self { listener, engine })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run until the process dies: accept connections, pump bytes
    /// through the engine, flush its output after every round.
    pub async fn serve(self) -> Result<()> {
        let Server {
            listener,
            mut engine,
        } = self;
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(listener, tx));

        let mut writers: HashMap<ConnId, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();
        while let Some(event) = rx.recv().await {
            match event {
                NetEvent::Connected {
                    peer,
                    writer,
                    reply,
                } => match engine.attach_connection(peer) {
                    Ok(conn) => {
                        writers.insert(conn, writer);
                        let _ = reply.send(Some(conn));
                    }
                    Err(e) => {
                        tracing::warn!("rejecting connection: {e:#}");
                        let _ = writer.send(b"server unavailable\r\n".to_vec());
                        let _ = reply.send(None);
                    }
                },
                NetEvent::Input { conn, bytes } => engine.connection_input(conn, &bytes),
                NetEvent::Eof { conn } => engine.connection_eof(conn),
            }

            engine.run_until_idle();
            for (conn, bytes) in engine.drain_output() {
                if let Some(writer) = writers.get(&conn) {
                    let _ = writer.send(normalize_newlines(&bytes));
                }
            }
            for conn in engine.take_closed() {
                // Dropping the sender ends the writer task and with it
                // the socket.
                writers.remove(&conn);
            }
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<NetEvent>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                tokio::spawn(run_connection(socket, addr.to_string(), tx.clone()));
            }
            Err(e) => tracing::warn!("accept failed: {e}"),
        }
    }
}

async fn run_connection(socket: TcpStream, peer: String, tx: mpsc::UnboundedSender<NetEvent>) {
    let (read_half, mut write_half) = socket.into_split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let (reply_tx, reply_rx) = oneshot::channel();
    let connected = NetEvent::Connected {
        peer: peer.clone(),
        writer: writer_tx,
        reply: reply_tx,
    };
    if tx.send(connected).is_err() {
        return;
    }
    let Ok(Some(conn)) = reply_rx.await else {
        return;
    };

    read_loop(read_half, conn, tx).await;
    tracing::debug!(%peer, "reader task done");
}

async fn read_loop(mut read_half: OwnedReadHalf, conn: ConnId, tx: mpsc::UnboundedSender<NetEvent>) {
    let mut buf = [0u8; 1024];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = tx.send(NetEvent::Eof { conn });
                return;
            }
            Ok(n) => {
                let bytes = buf[..n].to_vec();
                if tx.send(NetEvent::Input { conn, bytes }).is_err() {
                    return;
                }
            }
        }
    }
}

/// Engine output uses bare `\n`; the wire speaks CR LF.
fn normalize_newlines(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut last = 0u8;
    for &b in bytes {
        if b == b'\n' && last != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        last = b;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newline_normalization() {
        assert_eq!(normalize_newlines(b"a\nb\n"), b"a\r\nb\r\n".to_vec());
        assert_eq!(normalize_newlines(b"a\r\nb"), b"a\r\nb".to_vec());
        assert_eq!(normalize_newlines(b"no newline"), b"no newline".to_vec());
    }
}

//! End-to-end over real sockets: two telnet-ish clients log in, echo
//! lines with interleaved arrivals, and disconnect cleanly.

use std::time::Duration;

use raven_core::{EngineConfig, ListenAddr, ServerConfig};
use raven_server::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const MASTER: &str = "void login() {\n\
     write(\"welcome\\n\");\n\
     while (true) {\n\
         string line = read_line();\n\
         if (line == \"quit\") break;\n\
         write(line + \"\\n\");\n\
     }\n\
     write(\"bye\\n\");\n\
 }\n";

async fn start() -> (std::net::SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("master"), MASTER).unwrap();

    let config = ServerConfig {
        listen: ListenAddr("127.0.0.1:0".to_string()),
        engine: EngineConfig {
            anchor: dir.path().to_path_buf(),
            master: "/master".to_string(),
            ..EngineConfig::default()
        },
    };
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    (addr, dir)
}

async fn read_line(stream: &mut TcpStream) -> String {
    let deadline = Duration::from_secs(5);
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = timeout(deadline, stream.read(&mut byte))
            .await
            .expect("read timed out")
            .expect("read failed");
        if n == 0 {
            panic!("peer closed before a full line arrived");
        }
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    String::from_utf8(line).unwrap()
}

async fn read_eof(stream: &mut TcpStream) {
    let deadline = Duration::from_secs(5);
    let mut buf = [0u8; 64];
    loop {
        let n = timeout(deadline, stream.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        if n == 0 {
            return;
        }
    }
}

#[tokio::test]
async fn interleaved_sessions_echo_in_line_order() {
    let (addr, _dir) = start().await;

    let mut alice = TcpStream::connect(addr).await.unwrap();
    let mut bob = TcpStream::connect(addr).await.unwrap();
    assert_eq!(read_line(&mut alice).await, "welcome");
    assert_eq!(read_line(&mut bob).await, "welcome");

    // Interleave partial lines across the two sessions.
    alice.write_all(b"first from a").await.unwrap();
    bob.write_all(b"only from b\r\n").await.unwrap();
    assert_eq!(read_line(&mut bob).await, "only from b");

    alice.write_all(b"\r\nsecond from a\r\n").await.unwrap();
    assert_eq!(read_line(&mut alice).await, "first from a");
    assert_eq!(read_line(&mut alice).await, "second from a");

    // Quitting gets the farewell, then the server closes the socket.
    alice.write_all(b"quit\r\n").await.unwrap();
    assert_eq!(read_line(&mut alice).await, "bye");
    read_eof(&mut alice).await;

    // Bob's session is unaffected.
    bob.write_all(b"still here\r\n").await.unwrap();
    assert_eq!(read_line(&mut bob).await, "still here");
}

#[tokio::test]
async fn abrupt_disconnect_is_survived() {
    let (addr, _dir) = start().await;

    let mut alice = TcpStream::connect(addr).await.unwrap();
    assert_eq!(read_line(&mut alice).await, "welcome");
    drop(alice);

    // The server keeps accepting and serving after the EOF.
    let mut bob = TcpStream::connect(addr).await.unwrap();
    assert_eq!(read_line(&mut bob).await, "welcome");
    bob.write_all(b"ping\r\n").await.unwrap();
    assert_eq!(read_line(&mut bob).await, "ping");
}

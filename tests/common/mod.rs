//! Loopback stand-in for the WebSQ device.
//!
//! Each helper hands back the device end of a real TCP connection so tests
//! can push frames exactly as the hardware would and inspect what the
//! client wrote.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, missing_docs)]

use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use websq_control::network::framing::FRAME_TERMINATOR;

/// Connected `(client, device)` socket pair on 127.0.0.1.
pub async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

/// Write one control frame: the JSON text followed by the terminator.
pub async fn push_message(device: &mut TcpStream, message: &Value) {
    let mut frame = message.to_string().into_bytes();
    frame.push(FRAME_TERMINATOR);
    push_raw(device, &frame).await;
}

/// Write raw bytes as-is.
pub async fn push_raw(device: &mut TcpStream, bytes: &[u8]) {
    device.write_all(bytes).await.unwrap();
    device.flush().await.unwrap();
}

/// Read from the device end until `count` complete JSON messages have
/// arrived. The client writes messages back-to-back without a separator.
pub async fn read_messages(device: &mut TcpStream, count: usize) -> Vec<Value> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let messages: Vec<Value> = serde_json::Deserializer::from_slice(&received)
                .into_iter::<Value>()
                .map_while(Result::ok)
                .collect();
            if messages.len() >= count {
                return messages;
            }
            let n = device.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed before sending {count} messages");
            received.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("client did not send the expected messages in time")
}

/// Poll `check` every 10 ms for up to 2 s.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Await `future`, failing the test instead of hanging after 5 s.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out; a record may have been merged into another read")
}

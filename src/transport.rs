//! The plain-TCP listener: accepts connections and drives each one through
//! a [`Session`], logging connect/disconnect at `log::info!`/`log::debug!`.
//! Telnet and serial transports are out of scope here; this module
//! provides the one concrete transport the core ships with.

use crate::access::Access;
use crate::engine::Engine;
use crate::reply;
use crate::session::{Session, SessionKind};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Runs the plain-TCP listener on `bind` until the process is torn down.
/// Each accepted connection gets its own [`Session`] at `access_limit`.
pub async fn serve(engine: Arc<Engine>, bind: &str, access_limit: Access) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    log::info!("listening on {bind}");
    loop {
        let (stream, peer) = listener.accept().await?;
        log::debug!("accepted connection from {peer}");
        let engine = engine.clone();
        stream.set_nodelay(true).ok();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(engine, stream, access_limit).await {
                log::warn!("session with {peer} ended: {err}");
            } else {
                log::debug!("session with {peer} closed cleanly");
            }
        });
    }
}

/// Drives one accepted connection over any duplex byte stream: sends the
/// `READy` handshake, then reads CRLF-terminated lines and feeds them to a
/// fresh [`Session`] until the client disconnects or requests
/// `EXIT`/`LOGOff`. Generic over the stream type (rather than pinned to
/// `TcpStream`) so the same driver backs both the real TCP listener and
/// in-memory `tokio::io::duplex` test harnesses.
pub async fn handle_stream<S>(engine: Arc<Engine>, stream: S, access_limit: Access) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let session = Session::new(engine, SessionKind::Client, access_limit, tx);
    let _ = session.write_line(reply::terminate(&reply::ready_line(&[("version", "1.0.0")])));

    let lines = Arc::new(AsyncMutex::new(BufReader::new(read_half).lines()));
    let result = read_loop(&session, &lines).await;

    // Always releases exclusive access, unsubscribes, and drops tracked
    // jobs, whether the read loop ended cleanly or with an I/O error.
    session.teardown();
    drop(session);
    let _ = writer_task.await;
    result
}

/// Reads and dispatches lines until the client disconnects, sends an empty
/// line (ignored), or requests `EXIT`/`LOGOff`.
async fn read_loop<R>(session: &Arc<Session>, lines: &Arc<AsyncMutex<tokio::io::Lines<BufReader<R>>>>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let next = { lines.lock().await.next_line().await? };
        let Some(line) = next else { break };
        if line.is_empty() {
            continue;
        }

        let lines = lines.clone();
        let read_more = move || {
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async {
                    lines.lock().await.next_line().await.ok().flatten()
                })
            })
        };

        if let Err(err) = session.handle_line(line, read_more).await {
            log::error!("unhandled error dispatching command: {err}");
        }
        if session.requested_exit() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builtin;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream as ClientStream;

    #[tokio::test]
    async fn handshake_then_version_round_trip() {
        let engine = Engine::new();
        builtin::install(&engine).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = handle_stream(engine, stream, Access::Full).await;
        });

        let mut client = ClientStream::connect(addr).await.unwrap();
        client.write_all(b"1 VERSion?\r\n").await.unwrap();

        let mut buf = vec![0u8; 256];
        let mut collected = Vec::new();
        loop {
            let n = client.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
            if collected.windows(2).filter(|w| w == b"\r\n").count() >= 2 {
                break;
            }
        }
        let text = String::from_utf8(collected).unwrap();
        assert!(text.starts_with("READy"));
        assert!(text.contains("OK 1 -Version=1.0.0 -Build=42\r\n"));
    }
}

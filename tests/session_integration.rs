//! Integration tests driving a full [`Session`](scpi_server::Session)
//! over an in-memory duplex stream rather than a real socket, the same
//! transport-free style as `transport.rs`'s own TCP-backed test but
//! exercised through `transport::handle_stream`'s generic stream support
//! directly.

use scpi_server::{builtin, transport, Access, Engine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

struct Harness {
    write: WriteHalf<DuplexStream>,
    lines: BufReader<ReadHalf<DuplexStream>>,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Harness {
    async fn connect(access: Access) -> Harness {
        Harness::connect_with(access, |_| {}).await
    }

    async fn connect_with(access: Access, setup: impl FnOnce(&Engine)) -> Harness {
        let engine = Engine::new();
        builtin::install(&engine).unwrap();
        setup(&engine);
        let (client, server_stream) = tokio::io::duplex(8192);
        let server = tokio::spawn(transport::handle_stream(engine, server_stream, access));
        let (read_half, write_half) = tokio::io::split(client);
        Harness { write: write_half, lines: BufReader::new(read_half), server }
    }

    async fn send(&mut self, line: &str) {
        self.write.write_all(line.as_bytes()).await.unwrap();
        self.write.write_all(b"\r\n").await.unwrap();
    }

    /// Reads one CRLF-terminated reply line, CRLF included (matching the
    /// wire format exactly, not trimmed).
    async fn recv_line(&mut self) -> String {
        let mut line = String::new();
        self.lines.read_line(&mut line).await.unwrap();
        line
    }
}

#[tokio::test]
async fn handshake_then_version_round_trip() {
    let mut h = Harness::connect(Access::Full).await;
    assert!(h.recv_line().await.starts_with("READy"));

    h.send("1 VERSion?").await;
    assert_eq!(h.recv_line().await, "OK 1 -Version=1.0.0 -Build=42\r\n");
}

#[tokio::test]
async fn unknown_command_reports_the_literal_wire_contract() {
    let mut h = Harness::connect(Access::Full).await;
    h.recv_line().await; // READy

    h.send("NOPE");
    let line = h.recv_line().await;
    assert_eq!(line, "ERRor NOPE [App.Core.UnknownCommand] -command=NOPE --> NOPE <-- Unknown Command\r\n");
}

#[tokio::test]
async fn access_denial_surfaces_required_and_current_levels() {
    let mut h = Harness::connect(Access::Observer).await;
    h.recv_line().await; // READy
    h.send("ACCess Observer");
    assert!(h.recv_line().await.starts_with("OK"));

    h.send("PUBLish topic text");
    let line = h.recv_line().await;
    assert!(line.starts_with("ERRor"));
    assert!(line.contains("[App.Core.InsufficientAccess]"));
    assert!(line.contains("-requiredAccess=Controller"));
    assert!(line.contains("-currentAccess=Observer"));
}

#[tokio::test]
async fn async_run_answers_next_then_ok_while_accepting_more_commands() {
    let mut h = Harness::connect(Access::Full).await;
    h.recv_line().await; // READy
    h.send("ACCess Controller");
    h.recv_line().await; // OK for the access change

    h.send("7 RUN job-a");
    assert_eq!(h.recv_line().await, "NEXT 7\r\n");

    // The session keeps answering other commands while the job runs.
    h.send("8 VERSion?");
    assert_eq!(h.recv_line().await, "OK 8 -Version=1.0.0 -Build=42\r\n");

    assert_eq!(h.recv_line().await, "OK RUN job-a\r\n");
}

#[tokio::test]
async fn macro_call_produces_exactly_one_ok_and_one_publish() {
    let mut h = Harness::connect(Access::Administrator).await;
    h.recv_line().await; // READy
    h.send("ACCess Administrator");
    assert!(h.recv_line().await.starts_with("OK"));

    h.send(r#"MACRo+ Greet -param=name "PUBLish greetings.hello $name""#);
    assert!(h.recv_line().await.starts_with("OK"));

    let sub_line = {
        h.send("SUBScribe greetings.hello");
        h.recv_line().await
    };
    assert!(sub_line.starts_with("OK"));

    h.send("Greet Alice");
    assert!(h.recv_line().await.starts_with("OK"));

    let message = h.recv_line().await;
    assert!(message.starts_with("MESSage"));
    assert!(message.contains("Alice"));
}

#[tokio::test]
async fn exit_closes_the_session_cleanly() {
    let mut h = Harness::connect(Access::Full).await;
    h.recv_line().await; // READy

    h.send("EXIT");
    assert!(h.recv_line().await.starts_with("OK"));

    let result = h.server.await.unwrap();
    assert!(result.is_ok());
}

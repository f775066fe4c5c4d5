//! Integration tests for the child-side command loop over in-memory pipes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use hidden_player::config::{OccupancyPolicy, PresenceClientOptions};
use hidden_player::ipc::{encode_line, Command, Event, Incoming, IpcReader};
use hidden_player::presence::{
    serve, ConnectError, Connection, ConnectionEvent, Connector, DisconnectReason, WorkerExit,
};
use hidden_player::probe::{PingResult, Probe, ProbeError};

struct EmptyServer;

#[async_trait]
impl Probe for EmptyServer {
    async fn ping(
        &self,
        _host: &str,
        _port: u16,
        _timeout: Duration,
    ) -> Result<PingResult, ProbeError> {
        // Only this client is online.
        Ok(PingResult {
            online: 1,
            max: 20,
            motd: "A Minecraft Server".to_string(),
            version: "1.18.2".to_string(),
            latency: Duration::from_millis(3),
            modern: true,
        })
    }
}

#[derive(Default)]
struct Server {
    chat: Mutex<Vec<String>>,
    remote: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
}

struct ServerConnection {
    server: Arc<Server>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

#[async_trait]
impl Connection for ServerConnection {
    async fn next_event(&mut self) -> ConnectionEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    async fn send_chat(&mut self, message: &str) -> Result<(), ConnectError> {
        self.server.chat.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn close(&mut self) {}
}

struct ServerConnector(Arc<Server>);

#[async_trait]
impl Connector for ServerConnector {
    async fn connect(
        &self,
        _options: &PresenceClientOptions,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.0.remote.lock().unwrap() = Some(tx);
        Ok(Box::new(ServerConnection {
            server: Arc::clone(&self.0),
            events: rx,
        }))
    }
}

struct Child {
    commands: DuplexStream,
    events: IpcReader<DuplexStream, Event>,
    server: Arc<Server>,
    worker: tokio::task::JoinHandle<WorkerExit>,
}

impl Child {
    fn start(options: PresenceClientOptions) -> Self {
        let server = Arc::new(Server::default());
        let (commands, child_stdin) = tokio::io::duplex(4096);
        let (child_stdout, events) = tokio::io::duplex(4096);
        let worker = tokio::spawn(serve(
            options,
            Arc::new(ServerConnector(Arc::clone(&server))),
            Arc::new(EmptyServer),
            child_stdin,
            child_stdout,
        ));
        Self {
            commands,
            events: IpcReader::new(events),
            server,
            worker,
        }
    }

    async fn send(&mut self, command: &Command) {
        let line = encode_line(command).unwrap();
        self.commands.write_all(line.as_bytes()).await.unwrap();
    }

    /// Chat lines the server received, once at least one has arrived.
    async fn sent_chat(&self) -> Vec<String> {
        for _ in 0..100 {
            let chat = self.server.chat.lock().unwrap().clone();
            if !chat.is_empty() {
                return chat;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server received no chat");
    }

    async fn next_event(&mut self) -> Event {
        let next = tokio::time::timeout(Duration::from_secs(5), self.events.next())
            .await
            .expect("no event within 5s");
        match next {
            Some(Incoming::Message(event)) => event,
            other => panic!("expected an event, got {other:?}"),
        }
    }
}

fn options() -> PresenceClientOptions {
    let mut options = PresenceClientOptions::new("mc.example.org", 25565);
    options.occupancy = Some(OccupancyPolicy {
        enabled: true,
        ..Default::default()
    });
    options
}

#[tokio::test]
async fn login_chat_and_disconnect_round_trip() {
    let mut child = Child::start(options());

    child.send(&Command::Login).await;
    assert_eq!(child.next_event().await, Event::Ready);

    child
        .send(&Command::Chat {
            message: "hello".to_string(),
        })
        .await;
    let remote = child.server.remote.lock().unwrap().clone().unwrap();
    remote
        .send(ConnectionEvent::Chat("<Steve> hi bot".to_string()))
        .unwrap();
    assert_eq!(
        child.next_event().await,
        Event::ChatReceived {
            message: "<Steve> hi bot".to_string()
        }
    );
    assert_eq!(child.sent_chat().await, ["hello"]);

    child
        .send(&Command::Disconnect {
            reason: Some("maintenance".to_string()),
        })
        .await;
    assert_eq!(
        child.next_event().await,
        Event::Disconnected {
            reason: DisconnectReason::RequestedStop.to_string()
        }
    );

    child.send(&Command::Exit).await;
    assert_eq!(child.worker.await.unwrap(), WorkerExit::Requested);
}

#[tokio::test]
async fn closed_input_stops_the_worker() {
    let mut child = Child::start(options());
    child.send(&Command::Login).await;
    assert_eq!(child.next_event().await, Event::Ready);

    drop(child.commands);
    assert_eq!(child.worker.await.unwrap(), WorkerExit::InputClosed);
}

#[tokio::test]
async fn malformed_lines_are_ignored() {
    let mut child = Child::start(options());
    child.commands.write_all(b"not json\n").await.unwrap();
    child
        .commands
        .write_all(b"{\"v\":9,\"type\":\"login\"}\n")
        .await
        .unwrap();
    child.send(&Command::Login).await;

    assert_eq!(child.next_event().await, Event::Ready);
    child.send(&Command::Exit).await;
    assert_eq!(child.worker.await.unwrap(), WorkerExit::Requested);
}

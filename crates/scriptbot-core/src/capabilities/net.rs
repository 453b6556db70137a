//! The `net` module: raw TCP client connections.
//!
//! Each connection runs on its own tokio task. Everything the task observes
//! reaches the script through the host queue as a [`NetEvent`], so the
//! handler runs on the host loop like any other callback.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use scriptbot_plugin_sdk::{OperationError, OperationErrorKind};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};

use crate::{dispatch::Outbox, plugin::ScriptContext};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConnectParams {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Only `tcp` is available.
    pub protocol: Option<String>,
}

impl NetConnectParams {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            protocol: None,
        }
    }
}

/// What a connection reports back. A failed connect yields a single `Error`;
/// an established one yields `Connected`, any `Data`, then one `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    Connected,
    Data(Bytes),
    Error(OperationError),
    Closed,
}

enum Command {
    Write(Bytes),
    Close,
}

pub struct NetNamespace {
    outbox: Outbox,
    connect_timeout: Duration,
}

impl NetNamespace {
    pub(crate) fn new(outbox: Outbox, connect_timeout: Duration) -> Self {
        Self {
            outbox,
            connect_timeout,
        }
    }

    /// Starts connecting and returns the client right away. Writes issued
    /// before the connection is up are sent once it is. Dropping every clone
    /// of the client closes the connection.
    pub fn connect<F>(&self, params: &NetConnectParams, handler: F) -> Result<NetClient, OperationError>
    where
        F: FnMut(&mut ScriptContext, NetEvent) + Send + 'static,
    {
        let protocol = params.protocol.as_deref().unwrap_or("tcp");
        if protocol != "tcp" {
            return Err(invalid(format!("protocol `{protocol}` is not available")));
        }
        let host = params
            .host
            .clone()
            .filter(|host| !host.trim().is_empty())
            .ok_or_else(|| invalid("a host is required"))?;
        let port = params
            .port
            .filter(|port| *port != 0)
            .ok_or_else(|| invalid("a port is required"))?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            OperationError::new(
                OperationErrorKind::Connection,
                "no async runtime available for connections",
            )
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventSink {
            outbox: self.outbox.clone(),
            handler: Arc::new(Mutex::new(handler)),
        };
        tracing::debug!(script = %self.outbox.script(), %host, port, "net connection started");
        runtime.spawn(drive(host, port, self.connect_timeout, rx, events));
        Ok(NetClient { commands: tx })
    }
}

/// Sending side of a connection.
#[derive(Clone)]
pub struct NetClient {
    commands: mpsc::UnboundedSender<Command>,
}

impl NetClient {
    /// Queues `data`; false once the connection is gone.
    pub fn write(&self, data: impl Into<Bytes>) -> bool {
        self.commands.send(Command::Write(data.into())).is_ok()
    }

    pub fn close(&self) {
        self.commands.send(Command::Close).ok();
    }
}

struct EventSink<F> {
    outbox: Outbox,
    handler: Arc<Mutex<F>>,
}

impl<F> EventSink<F>
where
    F: FnMut(&mut ScriptContext, NetEvent) + Send + 'static,
{
    fn send(&self, event: NetEvent) {
        let handler = self.handler.clone();
        self.outbox.ticket().complete(move |cx| {
            let mut handler = handler.lock();
            (*handler)(cx, event)
        });
    }
}

async fn drive<F>(
    host: String,
    port: u16,
    connect_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: EventSink<F>,
) where
    F: FnMut(&mut ScriptContext, NetEvent) + Send + 'static,
{
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            events.send(NetEvent::Error(OperationError::new(
                OperationErrorKind::Connection,
                format!("failed to connect to {host}:{port}: {err}"),
            )));
            return;
        }
        Err(_) => {
            events.send(NetEvent::Error(OperationError::new(
                OperationErrorKind::Timeout,
                format!("connecting to {host}:{port} timed out"),
            )));
            return;
        }
    };
    events.send(NetEvent::Connected);

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => events.send(NetEvent::Data(Bytes::copy_from_slice(&buf[..n]))),
                Err(err) => {
                    events.send(NetEvent::Error(OperationError::io(&err)));
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Write(data)) => {
                    if let Err(err) = writer.write_all(&data).await {
                        events.send(NetEvent::Error(OperationError::io(&err)));
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    writer.shutdown().await.ok();
                    break;
                }
            },
        }
    }
    tracing::debug!(%host, port, "net connection closed");
    events.send(NetEvent::Closed);
}

fn invalid(message: impl Into<String>) -> OperationError {
    OperationError::new(OperationErrorKind::InvalidRequest, message)
}

#[cfg(test)]
mod tests {
    use scriptbot_plugin_sdk::{Manifest, ScriptConfig};
    use tokio::net::TcpListener;

    use super::*;
    use crate::{capabilities::Net, config::HostConfig, host::ScriptHost};

    type Events = Arc<Mutex<Vec<NetEvent>>>;

    fn connected_host(params: NetConnectParams, events: &Events, clients: &Arc<Mutex<Vec<NetClient>>>) -> ScriptHost {
        let mut host = ScriptHost::new(HostConfig::default()).unwrap();
        let sink = events.clone();
        let keep = clients.clone();
        let main = move |cx: &mut ScriptContext, _: &ScriptConfig, _: &Manifest| -> anyhow::Result<()> {
            let sink = sink.clone();
            let client = cx
                .require::<Net>()?
                .connect(&params, move |_, event| sink.lock().push(event))?;
            client.write("ping");
            keep.lock().push(client);
            Ok(())
        };
        let id = host
            .register_plugin(
                Manifest::new("telnet", "tester", "net test", "1.0").with_modules(["net"]),
                main,
            )
            .unwrap();
        host.load(id).unwrap();
        host.start(id).unwrap();
        host
    }

    async fn step_until_closed(host: &mut ScriptHost, events: &Events) {
        while !events
            .lock()
            .last()
            .is_some_and(|event| matches!(event, NetEvent::Closed | NetEvent::Error(_)))
        {
            tokio::time::timeout(Duration::from_secs(10), host.step())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn data_and_close_arrive_through_the_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let events: Events = Arc::default();
        let clients = Arc::default();
        let mut host = connected_host(NetConnectParams::tcp("127.0.0.1", addr.port()), &events, &clients);
        assert!(events.lock().is_empty());
        step_until_closed(&mut host, &events).await;

        let events = events.lock();
        assert_eq!(events.first(), Some(&NetEvent::Connected));
        assert_eq!(events.last(), Some(&NetEvent::Closed));
        let echoed: Vec<u8> = events
            .iter()
            .filter_map(|event| match event {
                NetEvent::Data(data) => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(echoed, b"ping");
    }

    #[tokio::test]
    async fn refused_connection_reports_one_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let events: Events = Arc::default();
        let clients = Arc::default();
        let mut host = connected_host(NetConnectParams::tcp("127.0.0.1", port), &events, &clients);
        step_until_closed(&mut host, &events).await;

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], NetEvent::Error(err) if err.kind == OperationErrorKind::Connection));
    }

    #[test]
    fn parameters_are_checked_before_connecting() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(
            crate::plugin::ScriptId(0),
            Arc::default(),
            tx,
            crate::dispatch::EventHub::new(),
        );
        let net = NetNamespace::new(outbox, Duration::from_secs(1));
        let udp = NetConnectParams {
            protocol: Some("udp".into()),
            ..NetConnectParams::tcp("127.0.0.1", 9)
        };
        for params in [udp, NetConnectParams::default(), NetConnectParams::tcp("", 80)] {
            let err = net.connect(&params, |_, _| {}).err().unwrap();
            assert_eq!(err.kind, OperationErrorKind::InvalidRequest);
        }
        // Valid parameters still need a runtime.
        let err = net
            .connect(&NetConnectParams::tcp("127.0.0.1", 9), |_, _| {})
            .err()
            .unwrap();
        assert_eq!(err.kind, OperationErrorKind::Connection);
    }
}

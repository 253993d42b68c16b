/*
 * Copyright (C) 2025 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The accept loop that feeds requests to a [`Handler`] and sends back its
//! responses.

use crate::config::{ConfigError, ConfigProvider, RuntimeSettings};
use crate::connection::{Connection, ConnectionError};
use crate::constants::http;
use crate::httprequest::HttpRequest;
use crate::jsonrequest::JsonRequest;
use crate::request::{MethodPolicy, Request};
use crate::response::Response;
use crate::signals::SignalBridge;
use crate::transport::Transport;
use crate::websocket::{Flag, Opcode, WebSocketFrame, CLOSE_PROTOCOL_ERROR};
use crate::xmlrequest::XmlRequest;
use log::{debug, error, info, warn};
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("no handler with a send_ident of {0:?} configured")]
    UnknownApp(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("failed to install signal handlers: {0}")]
    Signals(io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Replace the connection with a fresh one.
    Restart,

    /// Close the connection and stop accepting requests.
    Shutdown,

    Checkpoint,
}

/// Sends commands to a running [`HandlerRuntime`] from other threads. They
/// take effect between requests.
#[derive(Clone)]
pub struct HandlerControl {
    sender: mpsc::Sender<Command>,
}

impl HandlerControl {
    /// Returns false if the runtime is gone.
    pub fn send(&self, cmd: Command) -> bool {
        self.sender.send(cmd).is_ok()
    }

    pub fn restart(&self) -> bool {
        self.send(Command::Restart)
    }

    pub fn shutdown(&self) -> bool {
        self.send(Command::Shutdown)
    }

    pub fn checkpoint(&self) -> bool {
        self.send(Command::Checkpoint)
    }
}

/// Application callbacks. Every method has a default, so an implementation
/// only overrides what it handles.
pub trait Handler {
    /// Called once before the first request is accepted.
    fn on_start(&mut self, _conn: &Arc<Connection>) {}

    /// Called after the connection has been replaced.
    fn on_restart(&mut self, _conn: &Arc<Connection>) {}

    /// Called after the connection has been closed for good.
    fn on_shutdown(&mut self) {}

    fn on_checkpoint(&mut self) {}

    fn handle(&mut self, _conn: &Connection, req: HttpRequest) -> Option<Response> {
        warn!("No default handler; responding with '204 No Content'");

        let mut resp = req.response();
        resp.set_status(http::NO_CONTENT);

        Some(resp.into())
    }

    fn handle_json(&mut self, _conn: &Connection, req: JsonRequest) -> Option<Response> {
        warn!(
            "Unhandled JSON message request ({:?})",
            req.envelope().method()
        );

        None
    }

    fn handle_xml(&mut self, _conn: &Connection, req: XmlRequest) -> Option<Response> {
        warn!(
            "Unhandled XML message request ({:?})",
            req.envelope().method()
        );

        None
    }

    /// The server's notice that a client went away. Nothing can be sent
    /// back for it.
    fn handle_disconnect(&mut self, _conn: &Connection, _req: JsonRequest) {}

    /// Rejects frames with reserved flags or opcodes, and hands the rest to
    /// the method for their opcode.
    fn handle_websocket(&mut self, conn: &Connection, frame: WebSocketFrame) -> Option<Response> {
        if frame.has_rsv_flags() || frame.opcode().is_reserved() {
            warn!(
                "rejecting frame with reserved flags or opcode (0x{:02x})",
                frame.flags()
            );

            let mut resp = frame.reply(&[Flag::Opcode(Opcode::Close)]);
            resp.set_status(CLOSE_PROTOCOL_ERROR);

            return Some(resp.into());
        }

        match frame.opcode() {
            Opcode::Continuation => self.handle_continuation_frame(conn, frame),
            Opcode::Text => self.handle_text_frame(conn, frame),
            Opcode::Binary => self.handle_binary_frame(conn, frame),
            Opcode::Close => self.handle_close_frame(conn, frame),
            Opcode::Ping => self.handle_ping_frame(conn, frame),
            Opcode::Pong => self.handle_pong_frame(conn, frame),
            Opcode::Reserved(_) => None,
        }
    }

    fn handle_continuation_frame(
        &mut self,
        _conn: &Connection,
        _frame: WebSocketFrame,
    ) -> Option<Response> {
        debug!("ignoring continuation frame");

        None
    }

    fn handle_text_frame(&mut self, _conn: &Connection, _frame: WebSocketFrame) -> Option<Response> {
        debug!("ignoring text frame");

        None
    }

    fn handle_binary_frame(
        &mut self,
        _conn: &Connection,
        _frame: WebSocketFrame,
    ) -> Option<Response> {
        debug!("ignoring binary frame");

        None
    }

    /// Acknowledges with a close frame of our own.
    fn handle_close_frame(&mut self, _conn: &Connection, frame: WebSocketFrame) -> Option<Response> {
        Some(frame.into_response(&[]).into())
    }

    /// Answers with a pong carrying the same payload.
    fn handle_ping_frame(&mut self, _conn: &Connection, frame: WebSocketFrame) -> Option<Response> {
        Some(frame.into_response(&[]).into())
    }

    fn handle_pong_frame(&mut self, _conn: &Connection, _frame: WebSocketFrame) -> Option<Response> {
        debug!("ignoring unsolicited pong frame");

        None
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// How long to wait for a request before checking for commands.
    pub poll_interval: Duration,

    /// Whether to turn SIGHUP, SIGINT, SIGTERM and SIGUSR1 into commands
    /// while running.
    pub trap_signals: bool,

    /// Given to the connection built by [`HandlerRuntime::from_config`].
    pub method_policy: MethodPolicy,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            trap_signals: true,
            method_policy: MethodPolicy::default(),
        }
    }
}

impl From<&RuntimeSettings> for RuntimeOptions {
    fn from(settings: &RuntimeSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            trap_signals: settings.trap_signals,
            method_policy: settings.method_policy,
        }
    }
}

/// Runs a [`Handler`] against a [`Connection`].
pub struct HandlerRuntime<H: Handler> {
    handler: H,
    conn: Arc<Connection>,
    control: HandlerControl,
    commands: mpsc::Receiver<Command>,
    options: RuntimeOptions,
}

impl<H: Handler> HandlerRuntime<H> {
    pub fn new(conn: Connection, handler: H) -> Self {
        let (sender, commands) = mpsc::channel();

        Self {
            handler,
            conn: Arc::new(conn),
            control: HandlerControl { sender },
            commands,
            options: RuntimeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;

        self
    }

    /// Builds a runtime for the handler registered as `app_id`.
    pub fn from_config(
        app_id: &str,
        provider: &dyn ConfigProvider,
        transport: Arc<dyn Transport>,
        handler: H,
        options: RuntimeOptions,
    ) -> Result<Self, RunError> {
        debug!("looking up handler spec for app id {:?}", app_id);

        let record = match provider.handler_by_send_ident(app_id)? {
            Some(record) => record,
            None => return Err(RunError::UnknownApp(app_id.to_string())),
        };

        info!(
            "config specs: {} <-> {}",
            record.send_spec, record.recv_spec
        );

        let conn = Connection::new(app_id, &record.send_spec, &record.recv_spec, transport)
            .with_method_policy(options.method_policy);

        Ok(Self::new(conn, handler).with_options(options))
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn control(&self) -> HandlerControl {
        self.control.clone()
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Accepts requests until shut down.
    pub fn run(&mut self) -> Result<(), RunError> {
        info!("starting up {}", self.conn);

        let bridge = if self.options.trap_signals {
            Some(SignalBridge::install(self.control()).map_err(RunError::Signals)?)
        } else {
            None
        };

        self.handler.on_start(&self.conn);

        let ret = self.start_accepting_requests();

        drop(bridge);

        info!("done: {}", self.conn);

        ret
    }

    fn process_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Restart => {
                    warn!("hangup: reconnecting");
                    self.restart();
                }
                Command::Shutdown => self.shutdown(),
                Command::Checkpoint => self.checkpoint(),
            }
        }
    }

    pub fn start_accepting_requests(&mut self) -> Result<(), RunError> {
        loop {
            self.process_commands();

            if self.conn.is_closed() {
                break;
            }

            let req = match self.conn.receive_timeout(self.options.poll_interval) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(ConnectionError::Closed) => continue,
                Err(ConnectionError::Transport(e)) => {
                    error!("{} while accepting requests", e);

                    thread::sleep(self.options.poll_interval);
                    continue;
                }
                Err(ConnectionError::Parse(e)) => {
                    warn!("dropping unparseable message: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            info!(
                "{} request from {}:{}",
                req.kind(),
                req.sender_id(),
                req.conn_id()
            );

            let resp = match self.dispatch_request(req) {
                Some(resp) => resp,
                None => {
                    debug!("no response; ignoring.");
                    continue;
                }
            };

            match self.conn.reply(&resp) {
                Ok(()) => debug!("responded to {}:{}", resp.sender_id(), resp.conn_id()),
                Err(ConnectionError::Frame(e)) => error!("dropping response: {}", e),
                Err(ConnectionError::Transport(e)) => error!("{} while responding", e),
                Err(ConnectionError::Closed) => warn!("connection closed before responding"),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Routes a request to the handler method for its type.
    pub fn dispatch_request(&mut self, req: Request) -> Option<Response> {
        let conn = &self.conn;

        if req.is_disconnect() {
            debug!("disconnect!");

            if let Request::Json(r) = req {
                self.handler.handle_disconnect(conn, r);
            }

            return None;
        }

        match req {
            Request::Http(r) => self.handler.handle(conn, r),
            Request::Json(r) => self.handler.handle_json(conn, r),
            Request::Xml(r) => self.handler.handle_xml(conn, r),
            Request::WebSocket(f) => self.handler.handle_websocket(conn, f),
            Request::Generic(r) => {
                error!(
                    "unhandled request type for METHOD {:?}",
                    r.envelope().method()
                );

                None
            }
        }
    }

    /// Swaps in a fresh connection and closes the old one.
    pub fn restart(&mut self) {
        info!("restarting");

        let old = Arc::clone(&self.conn);
        self.conn = Arc::new(old.reconnect());

        debug!("conn {} -> {}", old, self.conn);

        old.close();

        self.handler.on_restart(&self.conn);
    }

    pub fn shutdown(&mut self) {
        info!("shutting down.");

        self.conn.close();

        self.handler.on_shutdown();
    }

    pub fn checkpoint(&mut self) {
        info!("checkpoint: user signal.");

        self.handler.on_checkpoint();
    }
}

/// Looks up `app_id`, then runs `handler` until it is shut down.
pub fn run_handler<H: Handler>(
    app_id: &str,
    provider: &dyn ConfigProvider,
    transport: Arc<dyn Transport>,
    handler: H,
    options: RuntimeOptions,
) -> Result<H, RunError> {
    info!("running application {:?}", app_id);

    let mut runtime = HandlerRuntime::from_config(app_id, provider, transport, handler, options)?;

    runtime.run()?;

    Ok(runtime.into_handler())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HandlerRecord, Settings};
    use crate::testing::{MemoryTransport, RequestFactory, TEST_RECV_SPEC, TEST_SEND_SPEC};
    use crate::websocket::{FIN_FLAG, OPCODE_PING};
    use test_log::test;

    #[derive(Default)]
    struct Recorder {
        starts: usize,
        restarts: usize,
        shutdowns: usize,
        checkpoints: usize,
        disconnects: Vec<u64>,
        texts: Vec<Vec<u8>>,
    }

    impl Handler for Recorder {
        fn on_start(&mut self, _conn: &Arc<Connection>) {
            self.starts += 1;
        }

        fn on_restart(&mut self, _conn: &Arc<Connection>) {
            self.restarts += 1;
        }

        fn on_shutdown(&mut self) {
            self.shutdowns += 1;
        }

        fn on_checkpoint(&mut self) {
            self.checkpoints += 1;
        }

        fn handle_disconnect(&mut self, _conn: &Connection, req: JsonRequest) {
            self.disconnects.push(req.conn_id());
        }

        fn handle_text_frame(&mut self, _conn: &Connection, frame: WebSocketFrame) -> Option<Response> {
            self.texts.push(frame.payload().to_vec());

            let mut resp = frame.into_response(&[]);
            resp.set_payload("ok");

            Some(resp.into())
        }
    }

    struct Default204;

    impl Handler for Default204 {}

    fn setup<H: Handler>(handler: H) -> (MemoryTransport, HandlerRuntime<H>) {
        let transport = MemoryTransport::new();

        let conn = Connection::new(
            "test-app",
            TEST_SEND_SPEC,
            TEST_RECV_SPEC,
            Arc::new(transport.clone()),
        );

        let runtime = HandlerRuntime::new(conn, handler).with_options(RuntimeOptions {
            poll_interval: Duration::from_millis(10),
            trap_signals: false,
            ..Default::default()
        });

        (transport, runtime)
    }

    // runs until `count` responses have gone out
    fn run_until_sent<H: Handler>(
        transport: &MemoryTransport,
        runtime: &mut HandlerRuntime<H>,
        count: usize,
    ) -> Vec<Vec<u8>> {
        let control = runtime.control();
        let watcher = transport.clone();

        let stopper = thread::spawn(move || {
            let sent = watcher.wait_for_sent(count, Duration::from_secs(5));
            control.shutdown();

            sent
        });

        runtime.run().unwrap();
        assert!(stopper.join().unwrap());

        transport.take_sent()
    }

    #[test]
    fn default_http_response() {
        let (transport, mut runtime) = setup(Default204);

        transport.push(&b"ABCD 8 /handler 16:{\"METHOD\":\"GET\"},0:,"[..]);

        let sent = run_until_sent(&transport, &mut runtime, 1);
        assert_eq!(sent.len(), 1);

        let msg = String::from_utf8(sent[0].clone()).unwrap();
        assert!(msg.starts_with("ABCD 1:8, HTTP/1.1 204 No Content\r\n"));
        assert!(msg.contains("Content-Length: 0\r\n"));
        assert!(!msg.contains("Content-Type"));
        assert!(msg.ends_with("\r\n\r\n"));

        assert!(runtime.connection().is_closed());
    }

    #[test]
    fn ping_pong() {
        let (transport, mut runtime) = setup(Default204);

        let f = RequestFactory::new();
        let mut headers = crate::table::Table::new();
        headers.set("METHOD", "WEBSOCKET");
        headers.set("FLAGS", format!("0x{:x}", FIN_FLAG | OPCODE_PING));
        transport.push(f.wire("/ws", &headers, b"Hello"));

        let sent = run_until_sent(&transport, &mut runtime, 1);

        let mut expected = format!("{} 1:0, ", f.sender_id).into_bytes();
        expected.extend_from_slice(b"\x8a\x05Hello");
        assert_eq!(sent, vec![expected]);
    }

    #[test]
    fn bad_messages_are_dropped() {
        let (transport, mut runtime) = setup(Default204);

        transport.push("garbage");
        transport.push(&b"ABCD 8 /handler 2:{},0:,"[..]);
        transport.push(&b"ABCD 9 /handler 16:{\"METHOD\":\"GET\"},0:,"[..]);

        let sent = run_until_sent(&transport, &mut runtime, 1);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with(b"ABCD 1:9, HTTP/1.1 204"));
    }

    #[test]
    fn disconnect_gets_no_response() {
        let f = RequestFactory::new();
        let (_, mut runtime) = setup(Recorder::default());

        let resp = runtime.dispatch_request(Request::Json(f.disconnect()));
        assert!(resp.is_none());
        assert_eq!(runtime.handler().disconnects, vec![0]);
    }

    #[test]
    fn websocket_dispatch() {
        let f = RequestFactory::new();
        let (_, mut runtime) = setup(Recorder::default());

        let resp = runtime
            .dispatch_request(Request::WebSocket(f.websocket(Opcode::Text, b"hi")))
            .unwrap();
        assert_eq!(resp.to_bytes().unwrap(), b"\x81\x02ok");
        assert_eq!(runtime.handler().texts, vec![b"hi".to_vec()]);

        let resp = runtime
            .dispatch_request(Request::WebSocket(f.websocket(Opcode::Close, b"")))
            .unwrap();
        assert_eq!(resp.to_bytes().unwrap(), b"\x88\x00");

        assert!(runtime
            .dispatch_request(Request::WebSocket(f.websocket(Opcode::Pong, b"")))
            .is_none());
        assert!(runtime
            .dispatch_request(Request::WebSocket(f.websocket(Opcode::Binary, b"\xff")))
            .is_none());
    }

    #[test]
    fn websocket_protocol_errors() {
        let f = RequestFactory::new();
        let (_, mut runtime) = setup(Default204);

        let expected = {
            let mut out = vec![0x88, 20];
            out.extend_from_slice(b"1002 Protocol error.");
            out
        };

        let frame = f.websocket_with_flags(FIN_FLAG | 0x3, b"");
        let resp = runtime.dispatch_request(Request::WebSocket(frame)).unwrap();
        assert_eq!(resp.to_bytes().unwrap(), expected);

        let frame = f.websocket_with_flags(FIN_FLAG | crate::websocket::RSV1_FLAG | 0x1, b"x");
        let resp = runtime.dispatch_request(Request::WebSocket(frame)).unwrap();
        assert_eq!(resp.to_bytes().unwrap(), expected);
    }

    #[test]
    fn other_requests() {
        let f = RequestFactory::new();
        let (_, mut runtime) = setup(Default204);

        let req = f.json("/chat", &serde_json::json!({"type": "msg"})).unwrap();
        assert!(runtime.dispatch_request(Request::Json(req)).is_none());

        let req = f.xml("/feed", "<a/>").unwrap();
        assert!(runtime.dispatch_request(Request::Xml(req)).is_none());

        let raw = f.wire_http("BREW", "/a_handler", b"");
        let req = RequestFactory::parse(&raw).unwrap();
        assert_eq!(req.kind(), "generic");
        assert!(runtime.dispatch_request(req).is_none());
    }

    #[test]
    fn restart_and_commands() {
        let (transport, mut runtime) = setup(Recorder::default());

        runtime.connection().connect().unwrap();
        let old = Arc::clone(runtime.connection());

        runtime.restart();
        assert!(old.is_closed());
        assert!(!runtime.connection().is_closed());
        assert_eq!(runtime.connection().identifier(), old.identifier());
        assert_eq!(runtime.handler().restarts, 1);

        let control = runtime.control();
        assert!(control.restart());
        assert!(control.checkpoint());
        assert!(control.shutdown());

        runtime.run().unwrap();

        let h = runtime.handler();
        assert_eq!(h.starts, 1);
        assert_eq!(h.restarts, 2);
        assert_eq!(h.checkpoints, 1);
        assert_eq!(h.shutdowns, 1);
        assert!(runtime.connection().is_closed());

        // one pair for the initial connect only; later ones never opened
        assert_eq!(transport.opened().len(), 2);
    }

    #[test]
    fn from_config() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());

        let settings = Settings {
            handlers: vec![HandlerRecord::new(
                "test-app",
                TEST_SEND_SPEC,
                TEST_RECV_SPEC,
            )],
            ..Default::default()
        };

        let options = RuntimeOptions {
            method_policy: MethodPolicy::DefaultToGet,
            ..Default::default()
        };

        let runtime = HandlerRuntime::from_config(
            "test-app",
            &settings,
            Arc::clone(&transport),
            Default204,
            options.clone(),
        )
        .unwrap();
        assert_eq!(runtime.connection().sub_addr(), TEST_SEND_SPEC);
        assert_eq!(runtime.connection().pub_addr(), TEST_RECV_SPEC);
        assert_eq!(
            runtime.connection().method_policy(),
            MethodPolicy::DefaultToGet
        );

        let e = HandlerRuntime::from_config("nope", &settings, transport, Default204, options)
            .err()
            .unwrap();
        assert_eq!(
            e.to_string(),
            "no handler with a send_ident of \"nope\" configured"
        );
    }
}

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

use clap::Parser;
use log::{error, info};
use m2handler::cliargs::CliArgs;
use m2handler::config::FileConfig;
use m2handler::connection::Connection;
use m2handler::handler::{run_handler, Handler, RuntimeOptions};
use m2handler::heartbeat::{ConnectionTracker, Heartbeat};
use m2handler::httprequest::HttpRequest;
use m2handler::jsonrequest::JsonRequest;
use m2handler::response::Response;
use m2handler::websocket::WebSocketFrame;
use m2handler::zmq::ZmqTransport;
use std::error::Error;
use std::process;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_APP_ID: &str = "ws-echo";

/// Echoes WebSocket data frames back to the client, and closes clients
/// that stop answering pings.
struct WebSocketEcho {
    tracker: ConnectionTracker,
    heartbeat: Option<Heartbeat>,
    interval: Duration,
    idle: Duration,
}

impl WebSocketEcho {
    fn start_heartbeat(&mut self, conn: &Arc<Connection>) {
        // stop the old one first, so only one thread sweeps
        self.heartbeat.take();

        match Heartbeat::start(
            Arc::clone(conn),
            self.tracker.clone(),
            self.interval,
            self.idle,
        ) {
            Ok(hb) => self.heartbeat = Some(hb),
            Err(e) => error!("failed to start heartbeat: {}", e),
        }
    }

    fn echo(&mut self, frame: WebSocketFrame) -> Option<Response> {
        info!("echoing data frame: {}", frame);

        self.tracker.touch(frame.sender_id(), frame.conn_id());

        let fin = frame.fin();
        let payload = frame.payload().to_vec();

        let mut resp = frame.into_response(&[]);
        resp.set_fin(fin);
        resp.set_payload(payload);

        Some(resp.into())
    }
}

impl Handler for WebSocketEcho {
    fn on_start(&mut self, conn: &Arc<Connection>) {
        self.start_heartbeat(conn);
    }

    fn on_restart(&mut self, conn: &Arc<Connection>) {
        self.start_heartbeat(conn);
    }

    fn on_shutdown(&mut self) {
        if let Some(hb) = self.heartbeat.take() {
            hb.stop();
        }
    }

    fn handle(&mut self, conn: &Connection, req: HttpRequest) -> Option<Response> {
        info!("regular HTTP request ({}): closing channel.", req.path());

        if let Err(e) = conn.send_close(req.sender_id(), req.conn_id()) {
            error!("failed to close {}:{}: {}", req.sender_id(), req.conn_id(), e);
        }

        None
    }

    fn handle_disconnect(&mut self, _conn: &Connection, req: JsonRequest) {
        info!("client {}: disconnect.", req.conn_id());

        self.tracker.forget(req.sender_id(), req.conn_id());
    }

    fn handle_text_frame(&mut self, _conn: &Connection, frame: WebSocketFrame) -> Option<Response> {
        self.echo(frame)
    }

    fn handle_binary_frame(&mut self, _conn: &Connection, frame: WebSocketFrame) -> Option<Response> {
        self.echo(frame)
    }

    fn handle_continuation_frame(
        &mut self,
        _conn: &Connection,
        frame: WebSocketFrame,
    ) -> Option<Response> {
        self.echo(frame)
    }

    fn handle_close_frame(&mut self, conn: &Connection, frame: WebSocketFrame) -> Option<Response> {
        let sender_id = frame.sender_id().to_string();
        let conn_id = frame.conn_id();

        // still tracked means the client started the close, so acknowledge it
        let ret = if self.tracker.forget(&sender_id, conn_id) {
            conn.reply(&frame.into_response(&[]).into())
        } else {
            Ok(())
        };

        if let Err(e) = ret.and_then(|_| conn.send_close(&sender_id, conn_id)) {
            error!("failed to close {}:{}: {}", sender_id, conn_id, e);
        }

        None
    }

    fn handle_ping_frame(&mut self, _conn: &Connection, frame: WebSocketFrame) -> Option<Response> {
        self.tracker.touch(frame.sender_id(), frame.conn_id());

        Some(frame.into_response(&[]).into())
    }

    fn handle_pong_frame(&mut self, _conn: &Connection, frame: WebSocketFrame) -> Option<Response> {
        self.tracker.touch(frame.sender_id(), frame.conn_id());

        None
    }
}

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    m2handler::log::init(args.log_file.as_deref(), args.log_level)?;

    let config = FileConfig::load(&args.config_path()?)?;
    let runtime = &config.settings().runtime;

    let handler = WebSocketEcho {
        tracker: ConnectionTracker::new(),
        heartbeat: None,
        interval: runtime.heartbeat_interval(),
        idle: runtime.heartbeat_idle(),
    };

    run_handler(
        args.app_id_or(DEFAULT_APP_ID),
        &config,
        Arc::new(ZmqTransport::new()),
        handler,
        RuntimeOptions::from(runtime),
    )?;

    Ok(())
}

fn main() {
    let args = CliArgs::parse();

    if let Err(e) = process_args_and_run(args) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

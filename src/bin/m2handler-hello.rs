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
use log::info;
use m2handler::cliargs::CliArgs;
use m2handler::config::FileConfig;
use m2handler::connection::Connection;
use m2handler::constants::http;
use m2handler::handler::{run_handler, Handler, RuntimeOptions};
use m2handler::httprequest::HttpRequest;
use m2handler::response::Response;
use m2handler::zmq::ZmqTransport;
use std::error::Error;
use std::process;
use std::sync::Arc;
use time::OffsetDateTime;

const DEFAULT_APP_ID: &str = "helloworld-handler";

/// Answers every request with a plain text greeting.
struct HelloWorld;

impl Handler for HelloWorld {
    fn handle(&mut self, _conn: &Connection, req: HttpRequest) -> Option<Response> {
        info!("{} {}", req.method(), req.path());

        let mut resp = req.response();
        resp.set_status(http::OK);
        resp.set_content_type("text/plain");
        resp.puts(&format!(
            "Hello, world, it's {}!",
            OffsetDateTime::now_utc()
        ));

        Some(resp.into())
    }
}

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    m2handler::log::init(args.log_file.as_deref(), args.log_level)?;

    let config = FileConfig::load(&args.config_path()?)?;
    let options = RuntimeOptions::from(&config.settings().runtime);

    run_handler(
        args.app_id_or(DEFAULT_APP_ID),
        &config,
        Arc::new(ZmqTransport::new()),
        HelloWorld,
        options,
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

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

pub mod cliargs;
pub mod config;
pub mod connection;
pub mod constants;
pub mod control;
pub mod handler;
pub mod heartbeat;
pub mod httprequest;
pub mod httpresponse;
pub mod jsonrequest;
pub mod log;
pub mod request;
pub mod response;
pub mod signals;
pub mod table;
pub mod testing;
pub mod tnetstring;
pub mod transport;
pub mod websocket;
pub mod xmlrequest;
pub mod zmq;

pub use crate::connection::{Connection, ConnectionError};
pub use crate::handler::{run_handler, Handler, HandlerControl, HandlerRuntime, RuntimeOptions};
pub use crate::request::{MethodPolicy, Request, RequestRegistry};
pub use crate::response::Response;

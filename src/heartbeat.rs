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

//! Keeps WebSocket clients honest: connections that have been quiet too
//! long are closed, the rest are pinged.

use crate::connection::{Connection, ConnectionError};
use crate::websocket::{Opcode, WebSocketFrame, CLOSE_EXCEPTION};
use log::{debug, error, info};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub pinged: usize,
    pub closed: usize,
}

/// When each client connection was last heard from, keyed by server and
/// connection id. Clones share the same table.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    seen: Arc<Mutex<HashMap<(String, u64), Instant>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, sender_id: &str, conn_id: u64) {
        lock(&self.seen).insert((sender_id.to_string(), conn_id), Instant::now());
    }

    /// Returns whether the connection was being tracked.
    pub fn forget(&self, sender_id: &str, conn_id: u64) -> bool {
        lock(&self.seen)
            .remove(&(sender_id.to_string(), conn_id))
            .is_some()
    }

    pub fn contains(&self, sender_id: &str, conn_id: u64) -> bool {
        lock(&self.seen).contains_key(&(sender_id.to_string(), conn_id))
    }

    pub fn len(&self) -> usize {
        lock(&self.seen).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes connections idle for at least `idle` and pings the others.
    pub fn sweep(&self, conn: &Connection, idle: Duration) -> Result<SweepStats, ConnectionError> {
        let now = Instant::now();

        let snapshot: Vec<((String, u64), Instant)> = lock(&self.seen)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let mut stats = SweepStats::default();

        for ((sender_id, conn_id), last_seen) in snapshot {
            let mut frame = WebSocketFrame::new(&sender_id, conn_id, "");

            if now.duration_since(last_seen) >= idle {
                info!("closing idle connection {}:{}", sender_id, conn_id);

                frame.set_opcode(Opcode::Close);
                frame.set_status(CLOSE_EXCEPTION);

                conn.reply(&frame.into())?;
                conn.send_close(&sender_id, conn_id)?;

                self.forget(&sender_id, conn_id);
                stats.closed += 1;
            } else {
                frame.set_opcode(Opcode::Ping);

                conn.reply(&frame.into())?;
                stats.pinged += 1;
            }
        }

        debug!("heartbeat: {} pinged, {} closed", stats.pinged, stats.closed);

        Ok(stats)
    }
}

/// A background thread sweeping a [`ConnectionTracker`] every `interval`.
/// It stops when dropped or when the connection closes.
pub struct Heartbeat {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Heartbeat {
    pub fn start(
        conn: Arc<Connection>,
        tracker: ConnectionTracker,
        interval: Duration,
        idle: Duration,
    ) -> Result<Self, io::Error> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));

        let thread = {
            let stop = Arc::clone(&stop);

            thread::Builder::new()
                .name("heartbeat".to_string())
                .spawn(move || {
                    let (stopped, cond) = &*stop;

                    loop {
                        {
                            let guard = lock(stopped);

                            let guard = match cond.wait_timeout_while(guard, interval, |s| !*s) {
                                Ok((guard, _)) => guard,
                                Err(e) => e.into_inner().0,
                            };

                            if *guard {
                                break;
                            }
                        }

                        match tracker.sweep(&conn, idle) {
                            Ok(_) => {}
                            Err(ConnectionError::Closed) => {
                                debug!("heartbeat: connection closed");
                                break;
                            }
                            Err(e) => error!("heartbeat: {}", e),
                        }
                    }
                })?
        };

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        let (stopped, cond) = &*self.stop;

        *lock(stopped) = true;
        cond.notify_all();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

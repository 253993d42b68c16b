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

use crate::handler::{Command, HandlerControl};
use log::{debug, warn};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, TERM_SIGNALS};
use signal_hook::iterator::{Handle, Signals};
use signal_hook::SigId;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

pub const HANDLED_SIGNALS: &[i32] = &[SIGHUP, SIGINT, SIGTERM, SIGUSR1];

pub fn command_for_signal(signal: i32) -> Option<Command> {
    match signal {
        SIGHUP => Some(Command::Restart),
        SIGINT | SIGTERM => Some(Command::Shutdown),
        SIGUSR1 => Some(Command::Checkpoint),
        _ => None,
    }
}

/// Forwards process signals to a handler as commands, from a helper
/// thread. Dropping the bridge restores the previous signal dispositions.
pub struct SignalBridge {
    handle: Handle,
    thread: Option<thread::JoinHandle<()>>,
    ids: Vec<SigId>,
}

impl SignalBridge {
    pub fn install(control: HandlerControl) -> Result<Self, io::Error> {
        let mut signals = Signals::new(HANDLED_SIGNALS)?;
        let handle = signals.handle();

        let term_now = Arc::new(AtomicBool::new(false));
        let mut ids = Vec::new();

        // ensure two term signals in a row causes the process to immediately exit
        for signal_type in TERM_SIGNALS {
            ids.push(signal_hook::flag::register_conditional_shutdown(
                *signal_type,
                1, // exit code
                Arc::clone(&term_now),
            )?);

            ids.push(signal_hook::flag::register(
                *signal_type,
                Arc::clone(&term_now),
            )?);
        }

        let thread = thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                for signal in &mut signals {
                    let cmd = match command_for_signal(signal) {
                        Some(cmd) => cmd,
                        None => continue,
                    };

                    debug!("signal {} -> {:?}", signal, cmd);

                    if !control.send(cmd) {
                        break;
                    }
                }
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
            ids,
        })
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }

        self.handle.close();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("signal thread panicked");
            }
        }
    }
}

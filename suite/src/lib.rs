//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! End-to-end fixtures for the polling engine
//!
//! [`DumpHandler`] speaks a small line protocol: a `login:`/`Password:`
//! exchange, a `DUMP <since>` command answered with records up to `END`,
//! and `BYE` to hang up. [`Station`] is a fake data logger on a loopback TCP
//! port that serves that protocol, optionally behind a Hayes modem.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fieldpoll_channel::PatternMatcher;
use fieldpoll_service::{HandlerError, HandlerRegistry, ProtocolHandler, SessionIo};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Logger family tag served by [`DumpHandler`]
pub const DUMP_LOGGER: &str = "dump";

/// User name every station accepts
pub const USER: &str = "field";

/// Password stations expect unless told otherwise
pub const PASSWORD: &str = "logger";

/// Records a station returns for every dump
pub const RECORDS: &str = "T=21.5 RH=40\r\nT=21.7 RH=41\r\n";

const PROMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler for the `DUMP` line protocol
#[derive(Debug)]
pub struct DumpHandler {
    user: String,
    password: String,
}

impl DumpHandler {
    /// Create a handler logging in with `user` and `password`
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl ProtocolHandler for DumpHandler {
    async fn login(&mut self, io: &mut SessionIo<'_>) -> Result<(), HandlerError> {
        if !io.wait(PROMPT_TIMEOUT, &mut [PatternMatcher::new("login:")]).await {
            return Err(HandlerError::Authentication("no login prompt".into()));
        }
        io.send_line(&self.user).await?;

        if !io.wait(PROMPT_TIMEOUT, &mut [PatternMatcher::new("Password:")]).await {
            return Err(HandlerError::Authentication("no password prompt".into()));
        }
        io.send_line(&self.password).await?;

        let mut outcome = [PatternMatcher::new(">"), PatternMatcher::new("incorrect")];
        match io.wait_for(PROMPT_TIMEOUT, &mut outcome).await {
            Some(0) => Ok(()),
            Some(_) => Err(HandlerError::Authentication("login incorrect".into())),
            None => Err(HandlerError::Authentication("no command prompt".into())),
        }
    }

    async fn retrieve_data(
        &mut self,
        io: &mut SessionIo<'_>,
        since: DateTime<Utc>,
    ) -> Result<Option<Bytes>, HandlerError> {
        io.set_capture(true);
        io.send_line(&format!("DUMP {}", since.format("%Y%m%d%H%M")))
            .await?;
        let finished = io.wait(PROMPT_TIMEOUT, &mut [PatternMatcher::new("END")]).await;
        io.set_capture(false);
        if !finished {
            return Err(HandlerError::Protocol("dump never finished".into()));
        }

        let mut captured = io.take_captured();
        if let Some(end) = captured.windows(3).position(|window| window == b"END") {
            captured.truncate(end);
        }
        Ok((!captured.is_empty()).then(|| Bytes::from(captured)))
    }

    async fn logout(&mut self, io: &mut SessionIo<'_>) -> Result<(), HandlerError> {
        io.send_line("BYE").await?;
        Ok(())
    }
}

/// Registry serving [`DUMP_LOGGER`] targets with the default credentials
pub fn dump_registry() -> Arc<HandlerRegistry> {
    Arc::new(HandlerRegistry::new().with_handler(DUMP_LOGGER, |_target| {
        Ok(Box::new(DumpHandler::new(USER, PASSWORD)) as Box<dyn ProtocolHandler>)
    }))
}

/// How a fake station behaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationConfig {
    /// Password the station accepts
    pub password: String,
    /// Answer `ATZ` and `ATDT` before presenting the login
    pub modem: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            password: PASSWORD.to_string(),
            modem: false,
        }
    }
}

/// What a station saw
#[derive(Debug, Default)]
pub struct StationLog {
    connections: Mutex<Vec<String>>,
    dumps: Mutex<Vec<String>>,
}

impl StationLog {
    /// Create an empty log
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Station names in the order they were connected to
    pub fn connections(&self) -> Vec<String> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Dump commands received, prefixed with the station name
    pub fn dumps(&self) -> Vec<String> {
        self.dumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn connected(&self, name: &str) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
    }

    fn dumped(&self, name: &str, command: &str) {
        self.dumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{}: {}", name, command));
    }
}

/// Fake data logger on a loopback port
#[derive(Debug)]
pub struct Station {
    address: SocketAddr,
}

impl Station {
    /// Listen on an ephemeral loopback port
    pub async fn spawn(
        name: &str,
        config: StationConfig,
        log: Arc<StationLog>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let name = name.to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                log.connected(&name);
                let (name, config, log) = (name.clone(), config.clone(), Arc::clone(&log));
                tokio::spawn(async move {
                    let _ = serve(stream, &name, &config, &log, true).await;
                });
            }
        });
        Ok(Self { address })
    }

    /// Where the station listens
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

/// Call a listening poller as station `identity`
///
/// Answers the poller's password and identification prompts up front, then
/// serves the dump protocol. Returns once the poller hangs up.
pub async fn call_in(
    address: SocketAddr,
    listener_password: &str,
    identity: &str,
    log: Arc<StationLog>,
) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(address).await?;
    stream
        .write_all(format!("{}\r\n{}\r\nlogin: ", listener_password, identity).as_bytes())
        .await?;
    log.connected(identity);
    serve(stream, identity, &StationConfig::default(), &log, false).await
}

/// Serve one connection of the dump protocol
///
/// Lines are matched loosely since prompts from the other side carry no
/// line ending and end up in front of the answers.
async fn serve<S>(
    stream: S,
    name: &str,
    config: &StationConfig,
    log: &StationLog,
    greet: bool,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    if greet && !config.modem {
        write.write_all(b"\r\nlogin: ").await?;
    }

    let mut logged_in = false;
    let mut awaiting_password = false;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if config.modem && line.ends_with("ATZ") {
            write.write_all(b"OK\r\n").await?;
        } else if config.modem && line.contains("ATDT") {
            write.write_all(b"CONNECT 1200\r\nlogin: ").await?;
        } else if !logged_in && !awaiting_password && line.ends_with(USER) {
            awaiting_password = true;
            write.write_all(b"Password: ").await?;
        } else if awaiting_password {
            awaiting_password = false;
            if line.ends_with(config.password.as_str()) {
                logged_in = true;
                write.write_all(b"\r\nlogger> ").await?;
            } else {
                write.write_all(b"\r\nLogin incorrect\r\n").await?;
                return Ok(());
            }
        } else if logged_in && line.contains("DUMP") {
            log.dumped(name, line);
            write
                .write_all(format!("{}END\r\nlogger> ", RECORDS).as_bytes())
                .await?;
        } else if logged_in && line.contains("BYE") {
            return Ok(());
        }
    }
    Ok(())
}

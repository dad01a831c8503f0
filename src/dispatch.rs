//! Socket protocol to the two robots.
//!
//! Worker: one persistent connection per plan, one newline-terminated command at a time,
//! each followed by a blocking acknowledgement read and a settle delay.
//! Vision: a fresh connection per `home`/`bins` request, answered by exactly `DONE`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::command::{CommandLine, PlanAudit, Rejection};
use crate::config::NetworkConfig;
use crate::error::{CoreError, Result};

/// Reply the vision robot sends once it reaches a viewpoint.
pub const VISION_DONE: &str = "DONE";

/// Timing knobs for a link, derived from [`NetworkConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    pub connect_timeout: Option<Duration>,
    pub io_timeout: Option<Duration>,
    pub command_delay: Duration,
    pub vision_settle: Duration,
    pub ack_buffer: usize,
}

impl From<&NetworkConfig> for LinkSettings {
    fn from(net: &NetworkConfig) -> Self {
        Self {
            connect_timeout: net.connect_timeout(),
            io_timeout: net.io_timeout(),
            command_delay: net.command_delay(),
            vision_settle: net.vision_settle(),
            ack_buffer: net.ack_buffer,
        }
    }
}

async fn bounded<T>(
    limit: Option<Duration>,
    endpoint: &str,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T> {
    let outcome = match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no progress within {limit:?}"),
            )),
        },
        None => fut.await,
    };
    outcome.map_err(|e| CoreError::connection(endpoint, e))
}

async fn read_reply(
    stream: &mut TcpStream,
    endpoint: &str,
    settings: &LinkSettings,
) -> Result<String> {
    let mut buf = vec![0_u8; settings.ack_buffer];
    let n = bounded(settings.io_timeout, endpoint, stream.read(&mut buf)).await?;
    if n == 0 {
        return Err(CoreError::connection(
            endpoint,
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed before acknowledging",
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string())
}

/// Exclusive connection to the worker arm. Dropping it closes the socket.
pub struct WorkerLink {
    stream: TcpStream,
    endpoint: String,
    settings: LinkSettings,
}

impl std::fmt::Debug for WorkerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLink")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl WorkerLink {
    pub async fn connect(endpoint: &str, settings: LinkSettings) -> Result<Self> {
        let stream = bounded(settings.connect_timeout, endpoint, TcpStream::connect(endpoint)).await?;
        info!(%endpoint, "connected to worker");
        Ok(Self {
            stream,
            endpoint: endpoint.to_string(),
            settings,
        })
    }

    /// Sends one command and waits for its acknowledgement. The settle delay is not
    /// applied here; see [`dispatch_plan`].
    pub async fn send(&mut self, command: &CommandLine) -> Result<String> {
        let mut line = command.text.clone().into_bytes();
        line.push(b'\n');
        bounded(self.settings.io_timeout, &self.endpoint, self.stream.write_all(&line)).await?;
        let ack = read_reply(&mut self.stream, &self.endpoint, &self.settings).await?;
        info!(command = %command.text, %ack, "worker acknowledged");
        Ok(ack)
    }

    pub async fn close(mut self) -> Result<()> {
        bounded(self.settings.io_timeout, &self.endpoint, self.stream.shutdown()).await
    }
}

/// One acknowledged command.
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledged {
    pub command: String,
    pub ack: String,
}

/// What happened to a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub acknowledged: Vec<Acknowledged>,
    pub rejected: Vec<Rejection>,
    /// Set when the cancel flag stopped the plan before every command was sent.
    pub cancelled: bool,
}

impl DispatchReport {
    pub fn sent(&self) -> usize {
        self.acknowledged.len()
    }
}

/// Sends every accepted line of `audit` over a single worker connection.
///
/// Rejections are carried into the report untouched. `cancel` is checked between
/// commands, never while one is in flight. No connection is opened if nothing was
/// accepted.
pub async fn dispatch_plan(
    endpoint: &str,
    settings: &LinkSettings,
    audit: PlanAudit,
    cancel: Option<&AtomicBool>,
) -> Result<DispatchReport> {
    let mut report = DispatchReport {
        rejected: audit.rejected,
        ..DispatchReport::default()
    };
    if audit.accepted.is_empty() {
        warn!(%endpoint, rejected = report.rejected.len(), "no valid commands to send");
        return Ok(report);
    }

    let mut link = WorkerLink::connect(endpoint, settings.clone()).await?;
    info!(%endpoint, commands = audit.accepted.len(), "dispatching plan");

    for command in &audit.accepted {
        if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            warn!(%endpoint, sent = report.sent(), "dispatch cancelled");
            report.cancelled = true;
            break;
        }
        let ack = link.send(command).await?;
        report.acknowledged.push(Acknowledged {
            command: command.text.clone(),
            ack,
        });
        tokio::time::sleep(settings.command_delay).await;
    }

    // Acknowledged commands have already run; a failed shutdown must not lose the report.
    if let Err(e) = link.close().await {
        warn!(%endpoint, error = %e, "worker link shutdown failed after plan");
    }
    Ok(report)
}

/// Viewpoints the vision robot knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionCommand {
    /// Over the table; also parks the arm out of the worker's way.
    Home,
    /// Over the containers.
    Bins,
}

impl VisionCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisionCommand::Home => "home",
            VisionCommand::Bins => "bins",
        }
    }
}

/// Moves the vision robot and waits for `DONE`, then the settle delay.
pub async fn send_vision_command(
    endpoint: &str,
    settings: &LinkSettings,
    command: VisionCommand,
) -> Result<()> {
    let mut stream =
        bounded(settings.connect_timeout, endpoint, TcpStream::connect(endpoint)).await?;
    let line = format!("{}\n", command.as_str());
    bounded(settings.io_timeout, endpoint, stream.write_all(line.as_bytes())).await?;
    let reply = read_reply(&mut stream, endpoint, settings).await?;

    if reply != VISION_DONE {
        return Err(CoreError::UnexpectedReply {
            endpoint: endpoint.to_string(),
            reply,
        });
    }
    info!(%endpoint, command = command.as_str(), "vision robot in position");
    tokio::time::sleep(settings.vision_settle).await;
    Ok(())
}

//! Per-device supervision
//!
//! One task per configured device walks the connect → initialize → ready
//! cycle forever. In the ready state it alternates status polls, queued
//! commands and unsolicited data on a single select loop; because the task
//! exclusively owns the driver, polls and commands can never interleave on
//! the wire. Any failure tears the connection down and re-enters the cycle
//! after a delay of at least the polling interval.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tracing::{debug, info, warn};

use periph_core::ssi::DecodeEvent;
use periph_types::{
    CommandResult, DeviceCommand, DeviceDescriptor, ErrorCode, Severity, StatusEvent,
    StatusSnapshot,
};

use crate::driver::{DeviceDriver, DriverFactory};
use crate::error::{Error, Result};

/// Consecutive failures after which the connect-fail alarm turns Critical
/// and an established session is abandoned
const FAIL_THRESHOLD: u32 = 3;

/// Floor for the delay between reconnection attempts
const RECONNECT_FLOOR: Duration = Duration::from_millis(100);

const COMMAND_QUEUE_CAPACITY: usize = 8;

/// Lifecycle event from one supervisor.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    StatusUpdated(StatusSnapshot),
    Faulted { code: ErrorCode, message: String },
    Data(DecodeEvent),
}

/// [`DeviceEvent`] tagged with the originating device name.
#[derive(Debug, Clone)]
pub struct SupervisorEvent {
    pub device: String,
    pub event: DeviceEvent,
}

struct CommandRequest {
    command: DeviceCommand,
    reply: oneshot::Sender<CommandResult>,
}

/// Cloneable command entry point for one supervised device.
#[derive(Clone)]
pub struct SupervisorHandle {
    name: String,
    command_tx: mpsc::Sender<CommandRequest>,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a command; resolves when the device finished it.
    pub async fn execute(&self, command: DeviceCommand) -> Result<CommandResult> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(CommandRequest { command, reply })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        response.await.map_err(|_| Error::ShuttingDown)
    }
}

/// Owner of one supervision task
pub struct Supervisor {
    handle: SupervisorHandle,
    join: JoinHandle<()>,
}

impl Supervisor {
    /// Spawn the supervision task for one device.
    pub fn spawn(
        descriptor: DeviceDescriptor,
        factory: Arc<dyn DriverFactory>,
        events: mpsc::Sender<SupervisorEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let handle = SupervisorHandle {
            name: descriptor.name.clone(),
            command_tx,
        };
        let task = SupervisorTask {
            descriptor,
            factory,
            events,
            shutdown,
            command_rx,
            consecutive_failures: 0,
        };
        let join = tokio::spawn(task.run());
        Self { handle, join }
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub async fn execute(&self, command: DeviceCommand) -> Result<CommandResult> {
        self.handle.execute(command).await
    }

    /// Await task exit; meaningful only after the shutdown signal flipped.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Why the ready loop ended.
enum SessionEnd {
    Shutdown,
    Reconnect,
}

struct SupervisorTask {
    descriptor: DeviceDescriptor,
    factory: Arc<dyn DriverFactory>,
    events: mpsc::Sender<SupervisorEvent>,
    shutdown: watch::Receiver<bool>,
    command_rx: mpsc::Receiver<CommandRequest>,
    consecutive_failures: u32,
}

impl SupervisorTask {
    async fn run(mut self) {
        let delay = self.descriptor.poll_interval().max(RECONNECT_FLOOR);
        info!(device = %self.descriptor.name, "supervisor started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.connect_and_serve().await {
                SessionEnd::Shutdown => break,
                SessionEnd::Reconnect => {}
            }

            if self.idle(delay).await {
                break;
            }
        }

        info!(device = %self.descriptor.name, "supervisor stopped");
    }

    /// One full connect → initialize → ready cycle.
    async fn connect_and_serve(&mut self) -> SessionEnd {
        let mut driver = match self.factory.build(&self.descriptor).await {
            Ok(driver) => driver,
            Err(e) => {
                self.connect_failed(format!("connect failed: {e}")).await;
                return SessionEnd::Reconnect;
            }
        };

        let initial = match driver.initialize().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                driver.shutdown().await;
                self.connect_failed(format!("initialization failed: {e}")).await;
                return SessionEnd::Reconnect;
            }
        };
        if initial.has_fault() {
            // A device that comes up faulted is not usable; retry from scratch
            self.emit(DeviceEvent::StatusUpdated(initial)).await;
            driver.shutdown().await;
            self.connect_failed("device initialized with active faults".into())
                .await;
            return SessionEnd::Reconnect;
        }

        self.consecutive_failures = 0;
        self.emit(DeviceEvent::Connected).await;
        self.emit(DeviceEvent::StatusUpdated(initial)).await;

        let end = self.serve(driver.as_mut()).await;
        driver.shutdown().await;
        self.emit(DeviceEvent::Disconnected).await;
        end
    }

    /// Ready state: poll, execute and forward data until something breaks.
    async fn serve(&mut self, driver: &mut dyn DeviceDriver) -> SessionEnd {
        let poll = self.descriptor.poll_interval();
        let mut ticker = interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut disconnected = driver.disconnected();
        let mut data_rx = driver.subscribe_data();

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return SessionEnd::Shutdown;
                    }
                }

                changed = disconnected.changed() => {
                    if changed.is_err() || *disconnected.borrow() {
                        warn!(device = %self.descriptor.name, "connection lost");
                        return SessionEnd::Reconnect;
                    }
                }

                _ = ticker.tick() => {
                    let Some(status) =
                        until_shutdown(&mut self.shutdown, driver.get_status()).await
                    else {
                        return SessionEnd::Shutdown;
                    };
                    match status {
                        Ok(snapshot) => {
                            self.consecutive_failures = 0;
                            self.emit(DeviceEvent::StatusUpdated(snapshot)).await;
                        }
                        Err(e) => {
                            self.consecutive_failures += 1;
                            warn!(
                                device = %self.descriptor.name,
                                failures = self.consecutive_failures,
                                error = %e,
                                "status poll failed"
                            );
                            self.emit(DeviceEvent::Faulted {
                                code: ErrorCode::status_error(self.descriptor.model.family()),
                                message: e.to_string(),
                            })
                            .await;
                            if self.consecutive_failures >= FAIL_THRESHOLD {
                                return SessionEnd::Reconnect;
                            }
                        }
                    }
                }

                request = self.command_rx.recv() => {
                    let Some(request) = request else {
                        return SessionEnd::Shutdown;
                    };
                    match self.run_command(driver, request).await {
                        CommandOutcome::Continue => {}
                        CommandOutcome::Reconnect => return SessionEnd::Reconnect,
                        CommandOutcome::Shutdown => return SessionEnd::Shutdown,
                    }
                }

                event = next_data(&mut data_rx) => {
                    self.emit(DeviceEvent::Data(event)).await;
                }
            }
        }
    }

    async fn run_command(
        &mut self,
        driver: &mut dyn DeviceDriver,
        request: CommandRequest,
    ) -> CommandOutcome {
        debug!(device = %self.descriptor.name, command = %request.command, "executing");
        let name = request.command.name.clone();

        // Dropping the reply sender tells the caller the host is going down
        let Some(outcome) =
            until_shutdown(&mut self.shutdown, driver.execute(&request.command)).await
        else {
            return CommandOutcome::Shutdown;
        };
        match outcome {
            Ok(result) => {
                let restart = result.success && name == "RESTART";
                let _ = request.reply.send(result);
                if restart {
                    info!(device = %self.descriptor.name, "restart requested, reconnecting");
                    return CommandOutcome::Reconnect;
                }
                CommandOutcome::Continue
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.emit(DeviceEvent::Faulted {
                    code: ErrorCode::command_error(self.descriptor.model.family()),
                    message: e.to_string(),
                })
                .await;
                let _ = request.reply.send(CommandResult::fail(
                    format!("{name} failed: {e}"),
                    ErrorCode::command_error(self.descriptor.model.family()),
                    e.is_retryable(),
                ));
                if self.consecutive_failures >= FAIL_THRESHOLD {
                    CommandOutcome::Reconnect
                } else {
                    CommandOutcome::Continue
                }
            }
        }
    }

    /// Record a failed connection attempt as an offline snapshot.
    async fn connect_failed(&mut self, message: String) {
        self.consecutive_failures += 1;
        let severity = if self.consecutive_failures >= FAIL_THRESHOLD {
            Severity::Critical
        } else {
            Severity::Error
        };
        warn!(
            device = %self.descriptor.name,
            failures = self.consecutive_failures,
            "{message}"
        );

        let family = self.descriptor.model.family();
        let alarm = StatusEvent::new("CONNECT_FAIL", message.clone(), severity)
            .with_error_code(ErrorCode::connect_fail(family));
        self.emit(DeviceEvent::StatusUpdated(StatusSnapshot::offline(
            &self.descriptor.name,
            self.descriptor.model,
            alarm,
        )))
        .await;
        self.emit(DeviceEvent::Faulted {
            code: ErrorCode::connect_fail(family),
            message,
        })
        .await;
    }

    /// Wait out the reconnect delay, failing queued commands meanwhile.
    ///
    /// Returns true when shutdown was requested.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return true;
                    }
                }

                request = self.command_rx.recv() => {
                    let Some(request) = request else { return true };
                    let _ = request.reply.send(CommandResult::fail(
                        "device offline",
                        ErrorCode::connect_fail(self.descriptor.model.family()),
                        true,
                    ));
                }
            }
        }
    }

    async fn emit(&self, event: DeviceEvent) {
        let _ = self
            .events
            .send(SupervisorEvent {
                device: self.descriptor.name.clone(),
                event,
            })
            .await;
    }
}

enum CommandOutcome {
    Continue,
    Reconnect,
    Shutdown,
}

/// Drive a device operation, abandoning it when shutdown is signalled.
///
/// Polls and command executions can suspend for a full device conversation
/// (a long-running dispense holds the wire for up to a minute); shutdown
/// must not wait that out. Returns `None` when the operation was abandoned.
async fn until_shutdown<F>(shutdown: &mut watch::Receiver<bool>, op: F) -> Option<F::Output>
where
    F: std::future::Future,
{
    tokio::pin!(op);
    loop {
        tokio::select! {
            result = &mut op => return Some(result),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
        }
    }
}

/// Next unsolicited data event, or pend forever when the device has none.
async fn next_data(rx: &mut Option<broadcast::Receiver<DecodeEvent>>) -> DecodeEvent {
    match rx {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "decode events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
            }
        },
        None => std::future::pending().await,
    }
}

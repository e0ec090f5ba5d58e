//! ACE device link
//!
//! [`AceDevice`] owns one transport and runs everything from timer events:
//!
//! - **Supervise**: reconnect check while disconnected
//! - **Read**: drain the transport into the frame decoder, dispatch responses
//! - **Write**: adaptive `get_status` polling, then send at most one queued request
//! - **ParkDeadline / ToolChangeSettle / ToolChangeWait**: park and tool-change steps
//!
//! The host pops due events from the scheduler and calls [`AceDevice::run_due`],
//! or hands the device to [`crate::runtime::spawn`].

pub mod park;
pub mod status;
pub mod toolchange;

use std::fmt;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{AceConfig, MIN_DRYER_TEMPERATURE};
use crate::error::AceError;
use crate::notify::{Notification, Notifier};
use crate::protocol::{
    encode_request, find_ace_device, Command, Dispatcher, FrameDecoder, ProtocolError, Reply,
    RequestError, RequestId, Response, SerialTransport, Transport,
};
use crate::scheduler::{Scheduler, TimerEvent, TimerHandle, TimerQueue};

use park::{ParkFailure, ParkOutcome, ParkTracker};
use status::{DeviceState, DeviceStatus};
use toolchange::{settle_duration, ChangeKind, ChangePhase, ToolChange};

/// Fan speed used for drying
pub const DRYER_FAN_SPEED: u32 = 7000;

/// Drying duration when the host gives none, in minutes
pub const DEFAULT_DRYING_MINUTES: u32 = 240;

/// Bytes pulled from the transport per read tick
const READ_CHUNK: usize = 512;

/// Host continuation for a request
pub type HostCallback = Box<dyn FnOnce(Reply) + Send>;

/// What to do with a request's reply
pub enum Handler {
    /// Fire-and-forget
    Discard,
    /// `get_info` issued on connect
    DeviceInfo,
    /// Periodic `get_status`
    Status,
    /// `start_feed_assist` that opens a park session
    ParkStart {
        /// Slot being parked
        slot: u8,
    },
    /// Unwind of the outgoing slot during a tool change
    ToolChangeUnwind {
        /// Outgoing slot
        slot: u8,
    },
    /// Host feed-assist toggle; tracks the active assist slot
    FeedAssist {
        /// Slot being toggled
        slot: u8,
        /// `true` for start, `false` for stop
        enable: bool,
        /// Host continuation
        reply: Option<HostCallback>,
    },
    /// Hand the reply to the host
    Host(HostCallback),
}

impl Handler {
    fn host(reply: Option<HostCallback>) -> Self {
        reply.map_or(Handler::Discard, Handler::Host)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Discard => write!(f, "Discard"),
            Handler::DeviceInfo => write!(f, "DeviceInfo"),
            Handler::Status => write!(f, "Status"),
            Handler::ParkStart { slot } => write!(f, "ParkStart({slot})"),
            Handler::ToolChangeUnwind { slot } => write!(f, "ToolChangeUnwind({slot})"),
            Handler::FeedAssist { slot, enable, .. } => {
                write!(f, "FeedAssist({slot}, enable={enable})")
            }
            Handler::Host(_) => write!(f, "Host"),
        }
    }
}

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No port open
    Disconnected,
    /// Open attempts in progress
    Connecting,
    /// Port open and device polled
    Connected,
}

/// Serial transport for `config`, auto-detecting the port when none is set
pub fn serial_transport(config: &AceConfig) -> Result<SerialTransport, AceError> {
    let port = match &config.serial {
        Some(port) => port.clone(),
        None => find_ace_device()
            .ok_or_else(|| ProtocolError::PortNotFound("no ACE device detected".to_string()))?,
    };
    Ok(SerialTransport::new(
        port,
        Some(config.baud),
        config.write_timeout(),
    ))
}

/// One ACE hub
pub struct AceDevice<S: Scheduler = TimerQueue> {
    config: AceConfig,
    transport: Box<dyn Transport>,
    notifier: Box<dyn Notifier>,
    scheduler: S,
    dispatcher: Dispatcher<Handler>,
    decoder: FrameDecoder,
    status: DeviceStatus,
    connection: ConnectionState,

    supervise_tick: Option<TimerHandle>,
    reconnect_timer: Option<TimerHandle>,
    read_tick: Option<TimerHandle>,
    write_tick: Option<TimerHandle>,
    last_status_request: Option<Instant>,

    park: ParkTracker,
    park_deadline: Option<TimerHandle>,
    tool_change: Option<ToolChange>,
    tool_change_timer: Option<TimerHandle>,

    current_tool: Option<u8>,
    feed_assist_slot: Option<u8>,
    infinity_counter: u8,
}

impl<S: Scheduler> AceDevice<S> {
    /// Validate `config` and build a disconnected device
    pub fn new(
        config: AceConfig,
        transport: Box<dyn Transport>,
        notifier: Box<dyn Notifier>,
        scheduler: S,
    ) -> Result<Self, AceError> {
        config.validate()?;
        Ok(Self {
            dispatcher: Dispatcher::new(config.max_queue_size, config.response_timeout()),
            decoder: FrameDecoder::new(),
            status: DeviceStatus::with_slots(config.slot_count),
            park: ParkTracker::new(config.park_hit_count),
            connection: ConnectionState::Disconnected,
            supervise_tick: None,
            reconnect_timer: None,
            read_tick: None,
            write_tick: None,
            last_status_request: None,
            park_deadline: None,
            tool_change: None,
            tool_change_timer: None,
            current_tool: None,
            feed_assist_slot: None,
            infinity_counter: 1,
            config,
            transport,
            notifier,
            scheduler,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Active configuration
    pub fn config(&self) -> &AceConfig {
        &self.config
    }

    /// Mirrored device status
    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    /// Current link state
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    /// Shorthand for `Connected`
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// Timer source
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Timer source, mutable (tests advance a `ManualClock` through it)
    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    /// Requests waiting to be written
    pub fn queued_requests(&self) -> usize {
        self.dispatcher.queued_len()
    }

    /// Requests written and awaiting a reply
    pub fn in_flight_requests(&self) -> usize {
        self.dispatcher.in_flight_len()
    }

    /// Tool selected on this device, `None` when unloaded
    pub fn current_tool(&self) -> Option<u8> {
        self.current_tool
    }

    /// Seed the current tool from the host's persisted value
    pub fn set_current_tool(&mut self, tool: Option<u8>) {
        self.current_tool = tool;
    }

    /// Next slot infinity spool will switch to
    pub fn infinity_counter(&self) -> u8 {
        self.infinity_counter
    }

    /// Seed the infinity-spool counter from the host's persisted value
    pub fn set_infinity_counter(&mut self, counter: u8) {
        self.infinity_counter = counter;
    }

    /// Slot feed assist was last enabled on
    pub fn feed_assist_slot(&self) -> Option<u8> {
        self.feed_assist_slot
    }

    /// Whether a park session is starting or running
    pub fn is_parking(&self) -> bool {
        self.park.is_active()
    }

    /// Tool change in progress
    pub fn tool_change(&self) -> Option<&ToolChange> {
        self.tool_change.as_ref()
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Arm the supervise tick; the first connect happens on the next `run_due`
    pub fn start(&mut self) {
        if let Some(handle) = self.supervise_tick.take() {
            self.scheduler.cancel(handle);
        }
        let now = self.scheduler.now();
        self.supervise_tick = Some(self.scheduler.schedule(now, TimerEvent::Supervise));
    }

    /// Disconnect and cancel every timer
    pub fn shutdown(&mut self) {
        self.disconnect();
        for handle in [
            self.supervise_tick.take(),
            self.reconnect_timer.take(),
            self.tool_change_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.scheduler.cancel(handle);
        }
        self.tool_change = None;
        info!("ACE link shut down");
    }

    /// Run every due timer event; returns how many ran
    pub fn run_due(&mut self) -> usize {
        let mut ran = 0;
        while let Some(event) = self.scheduler.pop_due() {
            self.handle_timer(event);
            ran += 1;
        }
        ran
    }

    /// Run one fired timer
    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Supervise => {
                let interval = self.config.connect_check_interval();
                self.supervise_tick = Some(self.scheduler.schedule_in(interval, TimerEvent::Supervise));
                if self.connection == ConnectionState::Disconnected && self.reconnect_timer.is_none() {
                    self.connect();
                }
            }
            TimerEvent::Reconnect => {
                self.reconnect_timer = None;
                self.connect();
            }
            TimerEvent::Read => {
                self.read_tick = None;
                self.on_read_tick();
            }
            TimerEvent::Write => {
                self.write_tick = None;
                self.on_write_tick();
            }
            TimerEvent::RequestTimeout(id) => {
                if let Some((handler, reply)) = self.dispatcher.on_timeout(id) {
                    self.complete(handler, reply);
                }
            }
            TimerEvent::ParkDeadline => {
                self.park_deadline = None;
                if let Some(outcome) = self.park.fail(ParkFailure::TimedOut) {
                    self.on_park_outcome(outcome);
                }
            }
            TimerEvent::ToolChangeSettle => {
                self.tool_change_timer = None;
                self.after_settle();
            }
            TimerEvent::ToolChangeWait => {
                self.tool_change_timer = None;
                self.poll_slot_ready();
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection supervision
    // ------------------------------------------------------------------

    /// Open the transport, retrying up to `max_connection_attempts` times
    pub fn connect(&mut self) -> bool {
        if self.connection == ConnectionState::Connected {
            return true;
        }
        self.connection = ConnectionState::Connecting;

        let attempts = self.config.max_connection_attempts;
        for attempt in 1..=attempts {
            match self.transport.open() {
                Ok(()) => {
                    self.on_connected();
                    return true;
                }
                Err(e) => warn!(attempt, "connection attempt failed: {e}"),
            }
        }

        self.connection = ConnectionState::Disconnected;
        error!("{}", ProtocolError::ConnectionFailed { attempts });
        false
    }

    fn on_connected(&mut self) {
        self.connection = ConnectionState::Connected;
        self.status.status = DeviceState::Ready;
        self.decoder.reset();
        self.last_status_request = None;
        info!("connected to ACE");

        self.submit(Command::GetInfo, Handler::DeviceInfo);

        let now = self.scheduler.now();
        if self.read_tick.is_none() {
            self.read_tick = Some(self.scheduler.schedule(now, TimerEvent::Read));
        }
        if self.write_tick.is_none() {
            self.write_tick = Some(self.scheduler.schedule(now, TimerEvent::Write));
        }
    }

    /// Tear the link down; safe to call when already disconnected
    ///
    /// In-flight requests are dropped without running their continuations.
    /// Queued requests stay queued for the next connection.
    pub fn disconnect(&mut self) {
        let was_connected = self.connection == ConnectionState::Connected;
        self.connection = ConnectionState::Disconnected;

        for handle in [self.read_tick.take(), self.write_tick.take()]
            .into_iter()
            .flatten()
        {
            self.scheduler.cancel(handle);
        }
        self.dispatcher.abandon_in_flight(&mut self.scheduler);
        self.decoder.reset();
        self.transport.close();
        self.status.status = DeviceState::Disconnected;

        if let Some(outcome) = self.park.fail(ParkFailure::ConnectionLost) {
            self.on_park_outcome(outcome);
        }

        if was_connected {
            info!("disconnected from ACE");
            self.notifier.notify(Notification::Disconnected);
        }
    }

    /// Disconnect, then connect again after the back-off delay
    pub fn reconnect(&mut self) {
        self.disconnect();
        if self.reconnect_timer.is_none() {
            let delay = self.config.reconnect_delay();
            self.reconnect_timer = Some(self.scheduler.schedule_in(delay, TimerEvent::Reconnect));
        }
    }

    // ------------------------------------------------------------------
    // Read / write ticks
    // ------------------------------------------------------------------

    fn on_read_tick(&mut self) {
        if !self.is_connected() {
            return;
        }

        let mut buf = [0u8; READ_CHUNK];
        match self.transport.read_some(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                let output = self.decoder.feed(&buf[..n]);
                for frame in output.frames {
                    self.handle_frame(frame);
                }
                if output.reset_required {
                    warn!("too many incomplete frames, resetting connection");
                    self.reconnect();
                    return;
                }
            }
            Err(e) => {
                warn!("read error: {e}");
                self.reconnect();
                return;
            }
        }

        if self.is_connected() {
            let interval = self.config.read_interval();
            self.read_tick = Some(self.scheduler.schedule_in(interval, TimerEvent::Read));
        }
    }

    fn on_write_tick(&mut self) {
        if !self.is_connected() {
            return;
        }

        let now = self.scheduler.now();
        let interval = self.config.status_interval(self.park.is_parking());
        let due = self
            .last_status_request
            .map_or(true, |last| now.saturating_duration_since(last) > interval);
        if due {
            self.submit(Command::GetStatus, Handler::Status);
            self.last_status_request = Some(now);
        }

        if let Some(outbound) = self.dispatcher.next_outbound() {
            match encode_request(&outbound.request) {
                Err(e) => {
                    warn!(id = outbound.id(), "failed to encode request: {e}");
                    let (handler, reply) = self.dispatcher.fail_unsent(
                        &mut self.scheduler,
                        outbound,
                        RequestError::Encoding(e.to_string()),
                    );
                    self.complete(handler, reply);
                }
                Ok(frame) => match self.transport.write_all(&frame) {
                    Ok(()) => {
                        debug!(id = outbound.id(), method = %outbound.request.method, "request sent");
                        self.dispatcher.mark_sent(outbound);
                    }
                    Err(e) => {
                        warn!(id = outbound.id(), "write failed, requeuing: {e}");
                        self.dispatcher.requeue_front(outbound);
                        self.reconnect();
                        return;
                    }
                },
            }
        }

        if self.is_connected() {
            let interval = self.config.write_interval();
            self.write_tick = Some(self.scheduler.schedule_in(interval, TimerEvent::Write));
        }
    }

    // ------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------

    fn handle_frame(&mut self, frame: Value) {
        match serde_json::from_value::<Response>(frame) {
            Ok(response) => self.handle_response(response),
            Err(e) => warn!("ignoring malformed response: {e}"),
        }
    }

    /// Run the matching continuation, then merge the result into the status
    pub fn handle_response(&mut self, response: Response) {
        let result = response.result_object().cloned();

        if let Some(id) = response.id {
            match self.dispatcher.resolve(&mut self.scheduler, id) {
                Some(handler) => self.complete(handler, response.into_reply()),
                None => debug!(id, "response without a pending request"),
            }
        }

        if let Some(result) = result {
            self.status.merge(&result);
            if result.contains_key("status") {
                if let Some(outcome) = self.park.observe(&self.status) {
                    self.on_park_outcome(outcome);
                }
            }
        }
    }

    fn submit(&mut self, command: Command, handler: Handler) -> RequestId {
        let (id, overflowed) = self
            .dispatcher
            .enqueue(&mut self.scheduler, command, handler);
        for (handler, reply) in overflowed {
            self.complete(handler, reply);
        }
        id
    }

    fn complete(&mut self, handler: Handler, reply: Reply) {
        match handler {
            Handler::Discard => {
                if let Err(e) = reply {
                    warn!("request failed: {e}");
                }
            }
            Handler::DeviceInfo => match reply {
                Ok(response) => {
                    let model = response.result_str("model").unwrap_or("Unknown").to_string();
                    let firmware = response
                        .result_str("firmware")
                        .unwrap_or("Unknown")
                        .to_string();
                    info!(%model, %firmware, "device info");
                    self.notifier
                        .notify(Notification::Connected { model, firmware });
                }
                Err(e) => warn!("get_info failed: {e}"),
            },
            Handler::Status => {
                if let Err(e) = reply {
                    debug!("status request failed: {e}");
                }
            }
            Handler::ParkStart { slot } => self.on_park_start(slot, reply),
            Handler::ToolChangeUnwind { slot } => {
                if let Err(e) = reply {
                    warn!(slot, "tool change unwind failed: {e}");
                }
            }
            Handler::FeedAssist {
                slot,
                enable,
                reply: callback,
            } => {
                if reply.is_ok() {
                    if enable {
                        self.feed_assist_slot = Some(slot);
                    } else if self.feed_assist_slot == Some(slot) {
                        self.feed_assist_slot = None;
                    }
                }
                if let Some(callback) = callback {
                    callback(reply);
                }
            }
            Handler::Host(callback) => callback(reply),
        }
    }

    // ------------------------------------------------------------------
    // Parking
    // ------------------------------------------------------------------

    fn on_park_start(&mut self, slot: u8, reply: Reply) {
        let starting = self.park.slot() == Some(slot) && !self.park.is_parking();
        match reply {
            Ok(response) if starting => {
                let count = response
                    .result_i64("feed_assist_count")
                    .unwrap_or(self.status.feed_assist_count);
                let now = self.scheduler.now();
                self.park.engage(now, count);
                self.feed_assist_slot = Some(slot);
                let timeout = self.config.park_timeout();
                self.park_deadline = Some(self.scheduler.schedule_in(timeout, TimerEvent::ParkDeadline));
            }
            Ok(_) => {
                // session already ended; don't leave the motor running
                warn!(slot, "feed assist started after its park ended, stopping it");
                self.submit(Command::StopFeedAssist { index: slot }, Handler::Discard);
            }
            Err(e) => {
                // the device may have started assisting without the reply reaching us
                if matches!(e, RequestError::Timeout { .. }) {
                    self.submit(Command::StopFeedAssist { index: slot }, Handler::Discard);
                }
                if !starting {
                    return;
                }
                if let Some(outcome) = self.park.fail(ParkFailure::StartRejected(e.to_string())) {
                    self.on_park_outcome(outcome);
                }
            }
        }
    }

    fn on_park_outcome(&mut self, outcome: ParkOutcome) {
        if let Some(handle) = self.park_deadline.take() {
            self.scheduler.cancel(handle);
        }

        match &outcome {
            ParkOutcome::Completed { slot } => {
                self.submit(Command::StopFeedAssist { index: *slot }, Handler::Discard);
                if self.config.disable_assist_after_toolchange {
                    self.feed_assist_slot = None;
                }
                self.notifier
                    .notify(Notification::ParkCompleted { slot: *slot });
            }
            ParkOutcome::Failed { slot, reason } => {
                warn!(slot, "park failed: {reason}");
                if *reason == ParkFailure::TimedOut {
                    self.submit(Command::StopFeedAssist { index: *slot }, Handler::Discard);
                }
                self.notifier.notify(Notification::ParkFailed {
                    slot: *slot,
                    reason: reason.to_string(),
                });
            }
        }

        let waiting = self.tool_change.as_ref().is_some_and(|change| {
            change.phase == ChangePhase::Parking && change.to == Some(outcome.slot())
        });
        if waiting {
            let result = match outcome {
                ParkOutcome::Completed { .. } => Ok(()),
                ParkOutcome::Failed { reason, .. } => Err(reason.to_string()),
            };
            self.finish_tool_change(result);
        }
    }

    fn start_park(&mut self, slot: u8) -> Result<RequestId, AceError> {
        self.park.begin(slot).map_err(AceError::AlreadyParking)?;
        info!(slot, "parking to toolhead");
        Ok(self.submit(Command::StartFeedAssist { index: slot }, Handler::ParkStart { slot }))
    }

    /// Feed `index` until the filament reaches the toolhead
    pub fn park_to_toolhead(&mut self, index: u8) -> Result<RequestId, AceError> {
        self.check_slot(index)?;
        if let Some(active) = self.park.slot() {
            return Err(AceError::AlreadyParking(active));
        }
        if self.tool_change.is_some() {
            return Err(AceError::ToolChangeInProgress);
        }
        self.require_ready(index)?;
        self.start_park(index)
    }

    // ------------------------------------------------------------------
    // Tool change
    // ------------------------------------------------------------------

    /// Switch from the current tool to `to` (`None` unloads)
    pub fn change_tool(&mut self, to: Option<u8>) -> Result<(), AceError> {
        if let Some(slot) = to {
            self.check_slot(slot)?;
        }
        if self.tool_change.is_some() {
            return Err(AceError::ToolChangeInProgress);
        }
        if let Some(active) = self.park.slot() {
            return Err(AceError::AlreadyParking(active));
        }

        let from = self.current_tool;
        if from == to {
            self.notifier
                .notify(Notification::AlreadySelected { tool: to });
            return Ok(());
        }
        if let Some(slot) = to {
            self.require_ready(slot)?;
        }

        let mut change = ToolChange::new(from, to);
        info!(change = %change, "tool change starting");
        self.notifier
            .notify(Notification::PreToolChange { from, to });
        self.current_tool = to;
        self.notifier.notify(Notification::ToolSelected { tool: to });

        match (change.unwinds(), from, to) {
            (true, Some(old), _) => {
                let length = self.config.toolchange_retract_length;
                let speed = self.config.retract_speed;
                self.submit(
                    Command::UnwindFilament {
                        index: old,
                        length,
                        speed,
                        mode: None,
                    },
                    Handler::ToolChangeUnwind { slot: old },
                );
                let settle = settle_duration(length, speed);
                debug!(slot = old, ?settle, "unwinding before tool change");
                self.tool_change_timer =
                    Some(self.scheduler.schedule_in(settle, TimerEvent::ToolChangeSettle));
                self.tool_change = Some(change);
            }
            (_, _, Some(new)) => {
                change.phase = ChangePhase::Parking;
                self.start_park(new)?;
                self.tool_change = Some(change);
            }
            _ => {}
        }
        Ok(())
    }

    fn after_settle(&mut self) {
        let now = self.scheduler.now();
        let Some(change) = self.tool_change.as_mut() else {
            return;
        };
        if change.to.is_none() {
            self.finish_tool_change(Ok(()));
            return;
        }
        change.phase = ChangePhase::WaitingForSlot { since: now };
        self.poll_slot_ready();
    }

    fn poll_slot_ready(&mut self) {
        let now = self.scheduler.now();
        let bound = self.config.slot_ready_timeout();
        let Some(change) = self.tool_change.as_mut() else {
            return;
        };
        if !matches!(change.phase, ChangePhase::WaitingForSlot { .. }) {
            return;
        }

        let ready = change.from.map_or(true, |slot| self.status.is_slot_ready(slot));
        let expired = change.wait_expired(now, bound);
        if !ready && !expired {
            let poll = self.config.slot_ready_poll();
            self.tool_change_timer = Some(self.scheduler.schedule_in(poll, TimerEvent::ToolChangeWait));
            return;
        }
        if !ready {
            warn!(change = %change, "vacated slot never reported ready, parking anyway");
        }

        change.phase = ChangePhase::Parking;
        if let Some(slot) = change.to {
            if let Err(e) = self.start_park(slot) {
                self.finish_tool_change(Err(e.to_string()));
            }
        }
    }

    fn finish_tool_change(&mut self, result: Result<(), String>) {
        let Some(change) = self.tool_change.take() else {
            return;
        };
        if let Some(handle) = self.tool_change_timer.take() {
            self.scheduler.cancel(handle);
        }

        let (from, to) = (change.from, change.to);
        match result {
            Ok(()) => {
                info!(change = %change, "tool change completed");
                match change.kind {
                    ChangeKind::ToolChange => self
                        .notifier
                        .notify(Notification::PostToolChange { from, to }),
                    ChangeKind::InfinitySpool => {
                        self.notifier.notify(Notification::PostInfinitySpool)
                    }
                }
                self.notifier
                    .notify(Notification::ToolChangeCompleted { from, to });
            }
            Err(reason) => {
                warn!(change = %change, "tool change failed: {reason}");
                self.notifier
                    .notify(Notification::ToolChangeFailed { from, to, reason });
            }
        }
    }

    /// Park the next spool after the current one runs out
    pub fn infinity_spool(&mut self) -> Result<(), AceError> {
        if !self.config.infinity_spool_mode {
            return Err(AceError::InfinitySpoolDisabled);
        }
        let from = self.current_tool.ok_or(AceError::NoToolSelected)?;
        if self.tool_change.is_some() {
            return Err(AceError::ToolChangeInProgress);
        }
        if let Some(active) = self.park.slot() {
            return Err(AceError::AlreadyParking(active));
        }
        let slot = self.infinity_counter;
        if slot >= self.config.slot_count {
            return Err(AceError::NoSpoolsLeft(slot));
        }
        self.require_ready(slot)?;

        self.notifier.notify(Notification::PreInfinitySpool);
        self.start_park(slot)?;
        self.tool_change = Some(ToolChange::infinity_spool(Some(from), slot));

        self.current_tool = Some(slot);
        self.notifier
            .notify(Notification::ToolSelected { tool: Some(slot) });
        self.infinity_counter = slot + 1;
        self.notifier.notify(Notification::InfinitySpoolAdvanced {
            counter: self.infinity_counter,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Host commands
    // ------------------------------------------------------------------

    fn check_slot(&self, index: u8) -> Result<(), AceError> {
        if index >= self.config.slot_count {
            return Err(AceError::invalid(
                "index",
                format!("{index} is outside 0..{}", self.config.slot_count),
            ));
        }
        Ok(())
    }

    fn require_ready(&mut self, slot: u8) -> Result<(), AceError> {
        if self.status.is_slot_ready(slot) {
            return Ok(());
        }
        self.notifier.notify(Notification::SlotEmpty { slot });
        Err(AceError::SlotNotReady(slot))
    }

    fn speed_or(&self, speed: Option<u32>, default: u32) -> Result<u32, AceError> {
        let speed = speed.unwrap_or(default);
        if speed == 0 {
            return Err(AceError::invalid("speed", "must be at least 1"));
        }
        Ok(speed)
    }

    /// Start the dryer at `temp` °C for `minutes` (default 240)
    pub fn start_drying(
        &mut self,
        temp: u32,
        minutes: Option<u32>,
        reply: Option<HostCallback>,
    ) -> Result<RequestId, AceError> {
        let max = self.config.max_dryer_temperature;
        if !(MIN_DRYER_TEMPERATURE..=max).contains(&temp) {
            return Err(AceError::invalid(
                "temp",
                format!("{temp} is outside {MIN_DRYER_TEMPERATURE}..={max}"),
            ));
        }
        let minutes = minutes.unwrap_or(DEFAULT_DRYING_MINUTES);
        if minutes == 0 {
            return Err(AceError::invalid("duration", "must be at least 1 minute"));
        }
        let command = Command::Drying {
            temp,
            fan_speed: DRYER_FAN_SPEED,
            duration: minutes.saturating_mul(60),
        };
        Ok(self.submit(command, Handler::host(reply)))
    }

    /// Stop the dryer
    pub fn stop_drying(&mut self, reply: Option<HostCallback>) -> RequestId {
        self.submit(Command::DryingStop, Handler::host(reply))
    }

    /// Start feed assist on slot `index`
    pub fn enable_feed_assist(
        &mut self,
        index: u8,
        reply: Option<HostCallback>,
    ) -> Result<RequestId, AceError> {
        self.check_slot(index)?;
        Ok(self.submit(
            Command::StartFeedAssist { index },
            Handler::FeedAssist {
                slot: index,
                enable: true,
                reply,
            },
        ))
    }

    /// Stop feed assist on `index`, or on the active assist slot when `None`
    pub fn disable_feed_assist(
        &mut self,
        index: Option<u8>,
        reply: Option<HostCallback>,
    ) -> Result<RequestId, AceError> {
        let index = index
            .or(self.feed_assist_slot)
            .ok_or_else(|| AceError::invalid("index", "no feed assist slot is active"))?;
        self.check_slot(index)?;
        Ok(self.submit(
            Command::StopFeedAssist { index },
            Handler::FeedAssist {
                slot: index,
                enable: false,
                reply,
            },
        ))
    }

    /// Feed `length` mm at `speed` (default `feed_speed`)
    pub fn feed(
        &mut self,
        index: u8,
        length: u32,
        speed: Option<u32>,
        reply: Option<HostCallback>,
    ) -> Result<RequestId, AceError> {
        self.check_slot(index)?;
        if length == 0 {
            return Err(AceError::invalid("length", "must be at least 1"));
        }
        let speed = self.speed_or(speed, self.config.feed_speed)?;
        Ok(self.submit(
            Command::FeedFilament {
                index,
                length,
                speed,
            },
            Handler::host(reply),
        ))
    }

    /// Change the speed of a running move; `None` uses `feed_speed`
    pub fn update_feeding_speed(
        &mut self,
        index: u8,
        speed: Option<u32>,
        reply: Option<HostCallback>,
    ) -> Result<RequestId, AceError> {
        self.check_slot(index)?;
        let speed = self.speed_or(speed, self.config.feed_speed)?;
        Ok(self.submit(
            Command::UpdateFeedingSpeed { index, speed },
            Handler::host(reply),
        ))
    }

    /// Stop feeding slot `index`
    pub fn stop_feed(
        &mut self,
        index: u8,
        reply: Option<HostCallback>,
    ) -> Result<RequestId, AceError> {
        self.check_slot(index)?;
        Ok(self.submit(Command::StopFeedFilament { index }, Handler::host(reply)))
    }

    /// Retract `length` mm; speed and mode default to the configured values
    pub fn retract(
        &mut self,
        index: u8,
        length: u32,
        speed: Option<u32>,
        mode: Option<u8>,
        reply: Option<HostCallback>,
    ) -> Result<RequestId, AceError> {
        self.check_slot(index)?;
        if length == 0 {
            return Err(AceError::invalid("length", "must be at least 1"));
        }
        let speed = self.speed_or(speed, self.config.retract_speed)?;
        let mode = mode.unwrap_or(self.config.retract_mode);
        if mode > 1 {
            return Err(AceError::invalid("mode", format!("{mode} is not 0 or 1")));
        }
        Ok(self.submit(
            Command::UnwindFilament {
                index,
                length,
                speed,
                mode: Some(mode),
            },
            Handler::host(reply),
        ))
    }

    /// Change the speed of a running move; `None` uses `retract_speed`
    pub fn update_retract_speed(
        &mut self,
        index: u8,
        speed: Option<u32>,
        reply: Option<HostCallback>,
    ) -> Result<RequestId, AceError> {
        self.check_slot(index)?;
        let speed = self.speed_or(speed, self.config.retract_speed)?;
        Ok(self.submit(
            Command::UpdateUnwindingSpeed { index, speed },
            Handler::host(reply),
        ))
    }

    /// Stop retracting slot `index`
    pub fn stop_retract(
        &mut self,
        index: u8,
        reply: Option<HostCallback>,
    ) -> Result<RequestId, AceError> {
        self.check_slot(index)?;
        Ok(self.submit(Command::StopUnwindFilament { index }, Handler::host(reply)))
    }

    /// RFID details for a slot
    pub fn filament_info(
        &mut self,
        index: u8,
        reply: Option<HostCallback>,
    ) -> Result<RequestId, AceError> {
        self.check_slot(index)?;
        Ok(self.submit(Command::GetFilamentInfo { index }, Handler::host(reply)))
    }

    /// Send an arbitrary method, for debugging
    pub fn send_raw(
        &mut self,
        method: &str,
        params: Option<Value>,
        reply: Option<HostCallback>,
    ) -> Result<RequestId, AceError> {
        let method = method.trim();
        if method.is_empty() {
            return Err(AceError::invalid("method", "must not be empty"));
        }
        Ok(self.submit(
            Command::Raw {
                method: method.to_string(),
                params,
            },
            Handler::host(reply),
        ))
    }
}

impl<S: Scheduler> fmt::Debug for AceDevice<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AceDevice")
            .field("connection", &self.connection)
            .field("status", &self.status.status)
            .field("queued", &self.dispatcher.queued_len())
            .field("in_flight", &self.dispatcher.in_flight_len())
            .field("parking", &self.park.slot())
            .field("tool_change", &self.tool_change)
            .field("current_tool", &self.current_tool)
            .finish()
    }
}

//! Session manager for the cloud generation: REST login, device discovery,
//! the IoT-backbone MQTT connection, request/response correlation by
//! session id, the polling loop, and the supervisor that restarts the whole
//! group when any part of it ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{Local, LocalResult, NaiveTime, TimeZone, Utc};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, Transport};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::convert;
use crate::envelope::{self, RequestKind, ResponseBody, TopicSet, DISCONNECT_NOTICE_TOPIC};
use crate::error::{Error, Result};
use crate::logger::{MessageLogMode, MessageLogger};
use crate::rest::{DeviceRecord, RestClient, CLOUD_SERVER};
use crate::schedule::{self, ScheduleAction};
use crate::state::StateModel;
use crate::types::{DeviceControl, DeviceSorting, OnOffFlag, ScheduleEntry};

pub const BROKER_HOST: &str = "a1t30mldyslmuq-ats.iot.us-east-1.amazonaws.com";
pub const BROKER_PORT: u16 = 443;

const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(15);
/// Delay before the supervisor rebuilds the group after an error; a
/// scheduled reconnect restarts immediately instead.
const RESTART_DELAY: Duration = Duration::from_secs(15);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

pub struct NavilinkCloudBuilder {
    user_id: String,
    password: String,
    device_index: usize,
    polling_interval: Duration,
    polling: bool,
    subscribe_extras: bool,
    rest_base: String,
    broker_host: String,
    broker_port: u16,
    state: Option<Arc<StateModel>>,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl NavilinkCloudBuilder {
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
            device_index: 0,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            polling: true,
            subscribe_extras: false,
            rest_base: CLOUD_SERVER.to_string(),
            broker_host: BROKER_HOST.to_string(),
            broker_port: BROKER_PORT,
            state: None,
            log_mode: None,
            log_path: None,
        }
    }

    /// Which account device acts as the gateway (default: the first).
    pub fn device_index(mut self, index: usize) -> Self {
        self.device_index = index;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Disable the background polling loop; the manager then only logs in
    /// and serves on-demand requests.
    pub fn polling(mut self, enabled: bool) -> Self {
        self.polling = enabled;
        self
    }

    /// Also subscribe to the trend and schedule response topics.
    pub fn subscribe_extras(mut self, enabled: bool) -> Self {
        self.subscribe_extras = enabled;
        self
    }

    pub fn rest_base(mut self, base: impl Into<String>) -> Self {
        self.rest_base = base.into();
        self
    }

    pub fn broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.broker_host = host.into();
        self.broker_port = port;
        self
    }

    pub fn state(mut self, state: Arc<StateModel>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> NavilinkCloud {
        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(StdMutex::new(
                MessageLogger::new(mode, &path).expect("failed to open log file"),
            )),
            _ => None,
        };
        let client_id = format!("navilink-rs-{}", uuid::Uuid::new_v4().simple());
        NavilinkCloud {
            inner: Arc::new(CloudInner {
                user_id: self.user_id,
                password: self.password,
                device_index: self.device_index,
                polling_interval: self.polling_interval,
                polling: self.polling,
                subscribe_extras: self.subscribe_extras,
                broker_host: self.broker_host,
                broker_port: self.broker_port,
                rest: RestClient::new(self.rest_base),
                client_id,
                state: self.state.unwrap_or_default(),
                context: StdMutex::new(None),
                pending: StdMutex::new(HashMap::new()),
                session_counter: AtomicI64::new(0),
                mqtt: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                disconnect_notify: Notify::new(),
                shutdown_notify: Notify::new(),
                logger,
            }),
        }
    }
}

/// Everything login establishes: the selected gateway device, its topic
/// namespace and the temporary broker credentials.
#[derive(Debug, Clone)]
struct CloudContext {
    device: DeviceRecord,
    topics: TopicSet,
    access_key_id: String,
    secret_key: String,
}

struct CloudInner {
    user_id: String,
    password: String,
    device_index: usize,
    polling_interval: Duration,
    polling: bool,
    subscribe_extras: bool,
    broker_host: String,
    broker_port: u16,
    rest: RestClient,
    client_id: String,
    state: Arc<StateModel>,
    context: StdMutex<Option<CloudContext>>,
    pending: StdMutex<HashMap<String, oneshot::Sender<ResponseBody>>>,
    session_counter: AtomicI64,
    mqtt: Mutex<Option<AsyncClient>>,
    shutting_down: AtomicBool,
    disconnect_notify: Notify,
    shutdown_notify: Notify,
    logger: Option<StdMutex<MessageLogger>>,
}

/// Why one supervisor cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    /// The daily 02:00 refresh: restart login immediately.
    Scheduled,
    /// Broker offline or the event pump died: restart after a delay.
    ConnectionLost,
    Shutdown,
}

impl CycleEnd {
    /// `None` stops the supervisor; a zero delay re-logs-in immediately.
    fn restart_delay(&self) -> Option<Duration> {
        match self {
            CycleEnd::Scheduled => Some(Duration::ZERO),
            CycleEnd::ConnectionLost => Some(RESTART_DELAY),
            CycleEnd::Shutdown => None,
        }
    }
}

/// Cheap clonable handle; clones share the session, pending table and
/// state tree.
#[derive(Clone)]
pub struct NavilinkCloud {
    inner: Arc<CloudInner>,
}

impl NavilinkCloud {
    pub fn builder(
        user_id: impl Into<String>,
        password: impl Into<String>,
    ) -> NavilinkCloudBuilder {
        NavilinkCloudBuilder::new(user_id, password)
    }

    pub fn state_model(&self) -> Arc<StateModel> {
        self.inner.state.clone()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// The gateway selected at login, once logged in.
    pub fn device(&self) -> Option<DeviceRecord> {
        self.inner
            .context
            .lock()
            .unwrap()
            .as_ref()
            .map(|ctx| ctx.device.clone())
    }

    /// REST sign-in and device selection. Bad credentials and a missing
    /// broker-credential bundle are fatal; everything else is retried by
    /// the supervisor.
    pub async fn login(&self) -> Result<()> {
        let sign_in = self
            .inner
            .rest
            .sign_in(&self.inner.user_id, &self.inner.password)
            .await?;
        let broker = sign_in.broker.ok_or(Error::MissingBrokerCredentials)?;
        let devices = self.inner.rest.device_list(&sign_in.user_seq).await?;
        let device = devices
            .get(self.inner.device_index)
            .cloned()
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "device index {} out of range ({} devices)",
                    self.inner.device_index,
                    devices.len()
                ))
            })?;
        info!(name = %device.name, mac = %device.mac_address, "gateway selected");
        let topics = TopicSet {
            device_type: device.device_type,
            mac_address: device.mac_address.clone(),
            home_seq: device.home_seq,
            user_seq: sign_in.user_seq,
            client_id: self.inner.client_id.clone(),
        };
        *self.inner.context.lock().unwrap() = Some(CloudContext {
            device,
            topics,
            access_key_id: broker.access_key_id,
            secret_key: broker.secret_key,
        });
        Ok(())
    }

    /// Log in and run the supervised session in the background. Returns
    /// once channels are discovered, or with the fatal error that stopped
    /// startup; transient failures keep retrying behind the scenes.
    pub async fn start(&self) -> Result<()> {
        if !self.inner.polling {
            return self.login().await;
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        let manager = self.clone();
        tokio::spawn(async move { manager.run_loop(Some(ready_tx)).await });
        match ready_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Protocol("session task ended during startup".to_string())),
        }
    }

    /// Deliberate shutdown: the supervisor observes it as a non-error end
    /// and does not reconnect.
    pub async fn disconnect(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.shutdown_notify.notify_waiters();
        let mut guard = self.inner.mqtt.lock().await;
        if let Some(client) = guard.take()
            && let Err(e) = client.disconnect().await
        {
            debug!("broker disconnect failed: {e}");
        }
    }

    async fn run_loop(&self, mut ready: Option<oneshot::Sender<Result<()>>>) {
        loop {
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            match self.login().await {
                Err(e) if e.is_fatal() => {
                    warn!("startup aborted: {e}");
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(e));
                    }
                    break;
                }
                Err(e) => {
                    warn!("login failed ({e}), retrying");
                    tokio::time::sleep(RESTART_DELAY).await;
                    continue;
                }
                Ok(()) => {}
            }
            let end = self.run_cycle(&mut ready).await;
            match end.restart_delay() {
                None => break,
                Some(delay) if delay.is_zero() => {
                    info!("scheduled reconnect, logging in again");
                }
                Some(delay) => {
                    warn!("session ended, restarting in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        debug!("session loop ended");
    }

    /// One supervised connection: broker session, dispatcher, polling loop
    /// and the daily-reconnect timer run as a group; whichever ends first
    /// cancels the others and classifies the restart.
    async fn run_cycle(&self, ready: &mut Option<oneshot::Sender<Result<()>>>) -> CycleEnd {
        let Some(ctx) = self.inner.context.lock().unwrap().clone() else {
            return CycleEnd::ConnectionLost;
        };

        let broker_url = format!("wss://{}:{}/mqtt", self.inner.broker_host, self.inner.broker_port);
        let mut options = MqttOptions::new(&self.inner.client_id, broker_url, self.inner.broker_port);
        options.set_transport(Transport::wss_with_default_config());
        options.set_keep_alive(KEEP_ALIVE);
        options.set_credentials(&ctx.access_key_id, &ctx.secret_key);
        let will_payload = json!({ "clientID": self.inner.client_id, "connected": false });
        options.set_last_will(LastWill::new(
            ctx.topics.last_will(),
            will_payload.to_string(),
            QoS::AtLeastOnce,
            false,
        ));

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        *self.inner.mqtt.lock().await = Some(client);

        // The broker client's callback context stops here: publishes are
        // handed off over this channel and touch shared state only from the
        // dispatcher below.
        let (incoming_tx, mut incoming_rx) = mpsc::channel::<(String, Vec<u8>)>(64);
        let pump = {
            let manager = self.clone();
            tokio::spawn(async move {
                loop {
                    match event_loop.poll().await {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let message = (publish.topic.clone(), publish.payload.to_vec());
                            if incoming_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if !manager.inner.shutting_down.load(Ordering::SeqCst) {
                                warn!("broker connection lost: {e}");
                                manager.inner.disconnect_notify.notify_one();
                            }
                            break;
                        }
                    }
                }
            })
        };

        let session = async {
            if let Err(e) = self.subscribe_all(&ctx).await {
                warn!("subscription failed: {e}");
                return;
            }
            if self.inner.state.channel_info().is_none() {
                if let Err(e) = self.request(RequestKind::ChannelInformation).await {
                    warn!("channel information request failed: {e}");
                }
            }
            if self.inner.state.channel_info().is_some()
                && let Some(tx) = ready.take()
            {
                let _ = tx.send(Ok(()));
            }
            // Prime the state tree before settling into the tick cadence.
            self.poll_channels().await;
            self.poll_loop().await;
        };

        let end = tokio::select! {
            _ = session => CycleEnd::ConnectionLost,
            _ = async {
                while let Some((topic, payload)) = incoming_rx.recv().await {
                    self.handle_incoming(&topic, &payload);
                }
            } => CycleEnd::ConnectionLost,
            _ = Self::sleep_until_daily_reconnect() => CycleEnd::Scheduled,
            _ = self.inner.disconnect_notify.notified() => {
                if self.inner.shutting_down.load(Ordering::SeqCst) {
                    CycleEnd::Shutdown
                } else {
                    CycleEnd::ConnectionLost
                }
            }
            _ = self.inner.shutdown_notify.notified() => CycleEnd::Shutdown,
        };

        // Teardown before the next cycle: drop the client, stop the pump,
        // abandon outstanding correlations.
        {
            let mut guard = self.inner.mqtt.lock().await;
            if let Some(client) = guard.take()
                && let Err(e) = client.disconnect().await
            {
                debug!("broker disconnect failed: {e}");
            }
        }
        pump.abort();
        self.inner.pending.lock().unwrap().clear();
        end
    }

    async fn subscribe_all(&self, ctx: &CloudContext) -> Result<()> {
        let mut topics = ctx.topics.response_subscriptions();
        if self.inner.subscribe_extras {
            topics.extend(ctx.topics.extra_subscriptions());
        }
        topics.push(DISCONNECT_NOTICE_TOPIC.to_string());
        let guard = self.inner.mqtt.lock().await;
        let client = guard.as_ref().ok_or(Error::NotConnected)?;
        for topic in topics {
            client.subscribe(topic, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// Publish one request and wait for its correlated response, at most
    /// one polling interval. Timing out is not an error: the poll proceeds
    /// and a late response still lands in the state tree.
    async fn request(&self, kind: RequestKind) -> Result<Option<ResponseBody>> {
        let Some(ctx) = self.inner.context.lock().unwrap().clone() else {
            return Err(Error::NotConnected);
        };
        let session_id = self.next_session_id();
        let (topic, payload) = envelope::envelope(&kind, &ctx.device, &ctx.topics, &session_id);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(session_id.clone(), tx);

        let publish = {
            // One lock around every client call: the underlying client is
            // never driven from two logical callers at once.
            let guard = self.inner.mqtt.lock().await;
            match guard.as_ref() {
                Some(client) => {
                    if let Some(logger) = &self.inner.logger {
                        logger
                            .lock()
                            .unwrap()
                            .log_publish(&topic, &session_id, &payload);
                    }
                    client
                        .publish(topic, QoS::AtLeastOnce, false, payload.to_string())
                        .await
                        .map_err(Error::from)
                }
                None => Err(Error::NotConnected),
            }
        };
        if let Err(e) = publish {
            self.inner.pending.lock().unwrap().remove(&session_id);
            return Err(e);
        }

        match timeout(self.inner.polling_interval, rx).await {
            Ok(Ok(body)) => Ok(Some(body)),
            _ => {
                self.inner.pending.lock().unwrap().remove(&session_id);
                debug!(%session_id, "no response within the polling interval");
                Ok(None)
            }
        }
    }

    /// Dispatch one inbound publish: update the state tree, then resolve
    /// the pending request it correlates to, if any.
    fn handle_incoming(&self, topic: &str, payload: &[u8]) {
        if topic.ends_with("/disconnect-mqtt") {
            if !self.inner.shutting_down.load(Ordering::SeqCst) {
                warn!("backbone announced a forced disconnect");
                self.inner.disconnect_notify.notify_one();
            }
            return;
        }
        let Some(response) = envelope::parse_response(payload) else {
            trace!(topic, "unparseable publish ignored");
            return;
        };
        if let Some(logger) = &self.inner.logger {
            logger.lock().unwrap().log_incoming(
                topic,
                response.session_id.as_deref(),
                payload.len(),
            );
        }
        match &response.body {
            ResponseBody::ChannelInformation(info) => {
                self.inner.state.set_channel_info(info.clone());
            }
            ResponseBody::ChannelStatus { channel, units } => {
                for raw in units {
                    self.inner.state.apply_state(*channel, raw.device_number, raw);
                }
            }
            ResponseBody::ControlFail(detail) => {
                warn!(%detail, "gateway rejected a control request");
            }
        }
        if let Some(session_id) = response.session_id {
            match self.inner.pending.lock().unwrap().remove(&session_id) {
                Some(tx) => {
                    let _ = tx.send(response.body);
                }
                None => {
                    trace!(%session_id, "response for unknown session id ignored");
                }
            }
        }
    }

    async fn poll_loop(&self) {
        let mut last_cost = Duration::ZERO;
        loop {
            // Cadence tracks wall-clock periods: the time the previous poll
            // spent comes out of the nominal interval.
            tokio::time::sleep(self.inner.polling_interval.saturating_sub(last_cost)).await;
            let started = Instant::now();
            self.poll_channels().await;
            last_cost = started.elapsed();
        }
    }

    async fn poll_channels(&self) {
        for channel in self.channels_to_poll() {
            if let Err(e) = self.request(RequestKind::ChannelStatus { channel }).await {
                warn!(channel, "channel poll failed: {e}");
            }
        }
    }

    /// Channels worth polling: those whose channel record reports an
    /// attached device model.
    fn channels_to_poll(&self) -> Vec<u8> {
        self.inner
            .state
            .channel_info()
            .map(|info| {
                info.channels
                    .iter()
                    .filter(|c| c.device_sorting != DeviceSorting::NoDevice)
                    .map(|c| c.channel)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn sleep_until_daily_reconnect() {
        let wait = until_next_daily_reconnect();
        debug!(?wait, "next scheduled reconnect");
        tokio::time::sleep(wait).await;
        info!("daily reconnect due, refreshing session");
    }

    /// Session ids are millisecond-epoch strings, bumped past the previous
    /// id when two requests land in the same millisecond.
    fn next_session_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .inner
            .session_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1).to_string()
    }

    // -- Control operations --

    pub async fn refresh_channel(&self, channel: u8) -> Result<()> {
        self.validate_target(channel, 1)?;
        self.request(RequestKind::ChannelStatus { channel }).await?;
        Ok(())
    }

    pub async fn set_power(&self, channel: u8, device_number: u8, on: bool) -> Result<()> {
        self.control(
            channel,
            device_number,
            DeviceControl::Power,
            OnOffFlag::from(on).code(),
            None,
        )
        .await
    }

    /// Momentary "hot button" request.
    pub async fn press_on_demand(&self, channel: u8, device_number: u8) -> Result<()> {
        if let Some(info) = self.inner.state.channel(channel)
            && !info.use_on_demand
        {
            return Err(Error::Unsupported("on demand"));
        }
        self.control(
            channel,
            device_number,
            DeviceControl::OnDemand,
            OnOffFlag::On.code(),
            None,
        )
        .await
    }

    pub async fn set_water_temperature(
        &self,
        channel: u8,
        device_number: u8,
        temperature: f64,
    ) -> Result<()> {
        let info = self
            .inner
            .state
            .channel(channel)
            .ok_or(Error::InvalidChannel(channel))?;
        let (min, max) = convert::water_temperature_range(&info);
        if temperature < min || temperature > max {
            return Err(Error::InvalidTemperature {
                requested: temperature,
                min,
                max,
            });
        }
        let wire = convert::water_temperature_to_wire(&info, temperature);
        self.control(channel, device_number, DeviceControl::WaterTemperature, wire, None)
            .await
    }

    pub async fn set_weekly_control(
        &self,
        channel: u8,
        device_number: u8,
        enabled: bool,
    ) -> Result<()> {
        self.control(
            channel,
            device_number,
            DeviceControl::Weekly,
            OnOffFlag::from(enabled).code(),
            None,
        )
        .await
    }

    /// Add or remove one weekly-schedule entry, preserving the rest of the
    /// day and the feature's enable flag.
    pub async fn edit_schedule(
        &self,
        channel: u8,
        device_number: u8,
        day_of_week: u8,
        entry: ScheduleEntry,
        action: ScheduleAction,
    ) -> Result<()> {
        let snapshot = self
            .inner
            .state
            .snapshot(channel, device_number)
            .ok_or_else(|| {
                Error::Protocol("no cached state to edit a schedule from".to_string())
            })?;
        let edit = schedule::apply(
            &snapshot.day_schedules,
            snapshot.weekly_control,
            day_of_week,
            entry,
            action,
        )?;
        self.control(
            channel,
            device_number,
            DeviceControl::Weekly,
            edit.control_value,
            Some(edit.block),
        )
        .await
    }

    async fn control(
        &self,
        channel: u8,
        device_number: u8,
        control: DeviceControl,
        value: u8,
        weekly: Option<crate::types::WeeklyDayBlock>,
    ) -> Result<()> {
        self.validate_target(channel, device_number)?;
        let reply = self
            .request(RequestKind::Control {
                channel,
                device_number,
                control,
                value,
                weekly,
            })
            .await?;
        match reply {
            Some(ResponseBody::ControlFail(detail)) => {
                Err(Error::Protocol(format!("control rejected: {detail}")))
            }
            // Status responses were already applied by the dispatcher.
            _ => Ok(()),
        }
    }

    fn validate_target(&self, channel: u8, device_number: u8) -> Result<()> {
        if !(1..=3).contains(&channel) {
            return Err(Error::InvalidChannel(channel));
        }
        if device_number == 0 {
            return Err(Error::InvalidDevice(device_number));
        }
        if let Some(info) = self.inner.state.channel(channel)
            && device_number > info.device_count
        {
            return Err(Error::InvalidDevice(device_number));
        }
        Ok(())
    }
}

/// Time left until the next local 02:00, today if it has not passed yet,
/// otherwise tomorrow.
fn until_next_daily_reconnect() -> Duration {
    let now = Local::now();
    let two_am = NaiveTime::from_hms_opt(2, 0, 0).expect("02:00 is a valid time");
    let date = if now.time() < two_am {
        now.date_naive()
    } else {
        now.date_naive().succ_opt().unwrap_or_else(|| now.date_naive())
    };
    match Local.from_local_datetime(&date.and_time(two_am)) {
        LocalResult::Single(target) | LocalResult::Ambiguous(target, _) => (target - now)
            .to_std()
            .unwrap_or(Duration::from_secs(60)),
        // A DST gap swallowed 02:00; try again in a day.
        LocalResult::None => Duration::from_secs(24 * 3600),
    }
}

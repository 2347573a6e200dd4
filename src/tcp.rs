//! Session manager for the relay-server binary protocol. Owns one TCP
//! socket; the whole request/response cycle runs under a depth-1 lock, so
//! the half-duplex relay never sees overlapping requests.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, warn};

use crate::codec::{self, ControlCommand, Message, Payload};
use crate::convert;
use crate::error::{Error, Result};
use crate::logger::{MessageLogMode, MessageLogger};
use crate::schedule::{self, ScheduleAction};
use crate::state::StateModel;
use crate::types::{
    ControlType, DeviceControl, OnOffFlag, ScheduleEntry, StateSnapshot, TrendCycle, TrendSample,
    WeeklyDayBlock,
};

pub const RELAY_SERVER: &str = "uscv2.naviensmartcontrol.com";
pub const RELAY_PORT: u16 = 6001;

/// Tag the relay expects in the login line after the user id.
const CLIENT_TAG: &str = "iPhone1.0";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// The relay drops idle sessions; anything older than this is rebuilt
/// before the next request goes out.
const SESSION_MAX_AGE: Duration = Duration::from_secs(600);
const READ_BUFFER: usize = 1024;

#[derive(Default)]
struct Session {
    stream: Option<TcpStream>,
    logged_in: bool,
    last_connect: Option<Instant>,
}

impl Session {
    fn reset(&mut self) {
        self.stream = None;
        self.logged_in = false;
        self.last_connect = None;
    }
}

pub struct NavilinkTcpBuilder {
    host: String,
    port: u16,
    user_id: String,
    gateway_id: String,
    state: Option<Arc<StateModel>>,
    session_max_age: Duration,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl NavilinkTcpBuilder {
    pub fn new(user_id: impl Into<String>, gateway_id: impl Into<String>) -> Self {
        Self {
            host: RELAY_SERVER.to_string(),
            port: RELAY_PORT,
            user_id: user_id.into(),
            gateway_id: gateway_id.into(),
            state: None,
            session_max_age: SESSION_MAX_AGE,
            log_mode: None,
            log_path: None,
        }
    }

    /// Point the client somewhere other than the vendor relay (tests,
    /// tunnels).
    pub fn server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Share a state tree with other components instead of owning one.
    pub fn state(mut self, state: Arc<StateModel>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    #[cfg(test)]
    pub(crate) fn session_max_age(mut self, age: Duration) -> Self {
        self.session_max_age = age;
        self
    }

    pub fn build(self) -> NavilinkTcp {
        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(std::sync::Mutex::new(
                MessageLogger::new(mode, &path).expect("failed to open log file"),
            )),
            _ => None,
        };
        NavilinkTcp {
            inner: Arc::new(TcpInner {
                host: self.host,
                port: self.port,
                user_id: self.user_id,
                gateway_id: self.gateway_id,
                state: self.state.unwrap_or_default(),
                session: Mutex::new(Session::default()),
                session_max_age: self.session_max_age,
                logger,
            }),
        }
    }
}

struct TcpInner {
    host: String,
    port: u16,
    user_id: String,
    gateway_id: String,
    state: Arc<StateModel>,
    session: Mutex<Session>,
    session_max_age: Duration,
    logger: Option<std::sync::Mutex<MessageLogger>>,
}

/// Cheap clonable handle; clones share the socket, lock and state tree.
#[derive(Clone)]
pub struct NavilinkTcp {
    inner: Arc<TcpInner>,
}

impl NavilinkTcp {
    pub fn builder(
        user_id: impl Into<String>,
        gateway_id: impl Into<String>,
    ) -> NavilinkTcpBuilder {
        NavilinkTcpBuilder::new(user_id, gateway_id)
    }

    pub fn state_model(&self) -> Arc<StateModel> {
        self.inner.state.clone()
    }

    /// Open the socket and authenticate. Authentication is implicit: the
    /// relay answers the login line with a channel-information response, and
    /// a decodable one marks the session as logged in.
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        self.connect_session(&mut session).await
    }

    /// Best-effort close. Always clears cached connection state and always
    /// reports success.
    pub async fn disconnect(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        self.disconnect_session(&mut session).await;
        Ok(())
    }

    /// Fetch and store a fresh state reading for one unit.
    pub async fn refresh_state(
        &self,
        channel: u8,
        device_number: u8,
    ) -> Result<Option<StateSnapshot>> {
        self.state_request(
            channel,
            device_number,
            ControlCommand::Info(ControlType::State),
            WeeklyDayBlock::default(),
            true,
        )
        .await
    }

    pub async fn set_power(
        &self,
        channel: u8,
        device_number: u8,
        on: bool,
    ) -> Result<Option<StateSnapshot>> {
        self.state_request(
            channel,
            device_number,
            ControlCommand::Control(DeviceControl::Power, OnOffFlag::from(on).code()),
            WeeklyDayBlock::default(),
            true,
        )
        .await
    }

    pub async fn set_heat(
        &self,
        channel: u8,
        device_number: u8,
        on: bool,
    ) -> Result<Option<StateSnapshot>> {
        self.state_request(
            channel,
            device_number,
            ControlCommand::Control(DeviceControl::Heat, OnOffFlag::from(on).code()),
            WeeklyDayBlock::default(),
            true,
        )
        .await
    }

    /// Momentary "hot button": request immediate hot water delivery. The
    /// next status reading reports the resulting tri-state.
    pub async fn press_on_demand(
        &self,
        channel: u8,
        device_number: u8,
    ) -> Result<Option<StateSnapshot>> {
        if let Some(info) = self.inner.state.channel(channel)
            && !info.use_on_demand
        {
            return Err(Error::Unsupported("on demand"));
        }
        self.state_request(
            channel,
            device_number,
            ControlCommand::Control(DeviceControl::OnDemand, OnOffFlag::On.code()),
            WeeklyDayBlock::default(),
            true,
        )
        .await
    }

    /// Set the hot-water target temperature, given in the channel's own
    /// unit system. The relay sends no reply to this request.
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
        self.state_request(
            channel,
            device_number,
            ControlCommand::Control(DeviceControl::WaterTemperature, wire),
            WeeklyDayBlock::default(),
            false,
        )
        .await
        .map(|_| ())
    }

    /// Set the heating-loop target temperature (whole degrees on the wire).
    pub async fn set_heating_water_temperature(
        &self,
        channel: u8,
        device_number: u8,
        temperature: f64,
    ) -> Result<Option<StateSnapshot>> {
        let info = self
            .inner
            .state
            .channel(channel)
            .ok_or(Error::InvalidChannel(channel))?;
        let (min, max) = (
            f64::from(info.min_heating_water_temperature),
            f64::from(info.max_heating_water_temperature),
        );
        if temperature < min || temperature > max {
            return Err(Error::InvalidTemperature {
                requested: temperature,
                min,
                max,
            });
        }
        self.state_request(
            channel,
            device_number,
            ControlCommand::Control(DeviceControl::HeatingWaterTemperature, temperature.round() as u8),
            WeeklyDayBlock::default(),
            true,
        )
        .await
    }

    /// Set the recirculation target temperature; only on channels that
    /// report the capability and a settable range.
    pub async fn set_recirculation_temperature(
        &self,
        channel: u8,
        device_number: u8,
        temperature: f64,
    ) -> Result<Option<StateSnapshot>> {
        let info = self
            .inner
            .state
            .channel(channel)
            .ok_or(Error::InvalidChannel(channel))?;
        let (min, max) = match (info.recirculation_possible(), info.recirculation_temperature_range)
        {
            (true, Some((min, max))) => (f64::from(min), f64::from(max)),
            _ => return Err(Error::Unsupported("recirculation temperature")),
        };
        if temperature < min || temperature > max {
            return Err(Error::InvalidTemperature {
                requested: temperature,
                min,
                max,
            });
        }
        self.state_request(
            channel,
            device_number,
            ControlCommand::Control(
                DeviceControl::RecirculationTemperature,
                temperature.round() as u8,
            ),
            WeeklyDayBlock::default(),
            true,
        )
        .await
    }

    /// Enable or disable the weekly schedule feature.
    pub async fn set_weekly_control(
        &self,
        channel: u8,
        device_number: u8,
        enabled: bool,
    ) -> Result<Option<StateSnapshot>> {
        self.state_request(
            channel,
            device_number,
            ControlCommand::Control(DeviceControl::Weekly, OnOffFlag::from(enabled).code()),
            WeeklyDayBlock::default(),
            true,
        )
        .await
    }

    /// Add or remove one weekly-schedule entry, built from the cached
    /// snapshot so the other entries and the enable flag are preserved.
    pub async fn edit_schedule(
        &self,
        channel: u8,
        device_number: u8,
        day_of_week: u8,
        entry: ScheduleEntry,
        action: ScheduleAction,
    ) -> Result<Option<StateSnapshot>> {
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
        self.state_request(
            channel,
            device_number,
            ControlCommand::Control(DeviceControl::Weekly, edit.control_value),
            edit.block,
            true,
        )
        .await
    }

    pub async fn trend_sample(&self, channel: u8, device_number: u8) -> Result<Option<TrendSample>> {
        let reply = self
            .send_request(
                channel,
                device_number,
                ControlCommand::Info(ControlType::TrendSample),
                WeeklyDayBlock::default(),
                true,
            )
            .await?;
        Ok(match reply {
            Some(Message {
                payload: Payload::TrendSample(sample),
                ..
            }) => Some(sample),
            _ => None,
        })
    }

    pub async fn trend_month(&self, channel: u8, device_number: u8) -> Result<Option<TrendCycle>> {
        let reply = self
            .send_request(
                channel,
                device_number,
                ControlCommand::Info(ControlType::TrendMonth),
                WeeklyDayBlock::default(),
                true,
            )
            .await?;
        Ok(match reply {
            Some(Message {
                payload: Payload::TrendMonth(cycle),
                ..
            }) => Some(cycle),
            _ => None,
        })
    }

    pub async fn trend_year(&self, channel: u8, device_number: u8) -> Result<Option<TrendCycle>> {
        let reply = self
            .send_request(
                channel,
                device_number,
                ControlCommand::Info(ControlType::TrendYear),
                WeeklyDayBlock::default(),
                true,
            )
            .await?;
        Ok(match reply {
            Some(Message {
                payload: Payload::TrendYear(cycle),
                ..
            }) => Some(cycle),
            _ => None,
        })
    }

    /// Send one raw request and decode whatever comes back. Public for
    /// callers that need request types without a convenience wrapper.
    pub async fn send_request(
        &self,
        channel: u8,
        device_number: u8,
        command: ControlCommand,
        weekly: WeeklyDayBlock,
        read_response: bool,
    ) -> Result<Option<Message>> {
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
        let frame = codec::encode_control_request(
            &self.inner.gateway_id,
            channel,
            device_number,
            &command,
            &weekly,
        )?;

        // Depth-1 request queue: the lock spans the whole write/read cycle,
        // totally ordering concurrent callers.
        let mut session = self.inner.session.lock().await;
        if !session.logged_in {
            self.connect_session(&mut session).await?;
        }
        if session
            .last_connect
            .map(|at| at.elapsed() >= self.inner.session_max_age)
            .unwrap_or(false)
        {
            debug!("relay session past max age, reconnecting");
            self.disconnect_session(&mut session).await;
            self.connect_session(&mut session).await?;
        }
        self.log_sent(command_kind(&command), &frame);
        self.exchange(&mut session, &frame, read_response).await
    }

    async fn state_request(
        &self,
        channel: u8,
        device_number: u8,
        command: ControlCommand,
        weekly: WeeklyDayBlock,
        read_response: bool,
    ) -> Result<Option<StateSnapshot>> {
        let reply = self
            .send_request(channel, device_number, command, weekly, read_response)
            .await?;
        if !read_response {
            return Ok(None);
        }
        match reply {
            Some(Message {
                payload: Payload::State(raw),
                ..
            }) => Ok(self.inner.state.apply_state(channel, device_number, &raw)),
            _ => {
                self.inner.state.apply_decode_failure(channel, device_number);
                Ok(None)
            }
        }
    }

    async fn connect_session(&self, session: &mut Session) -> Result<()> {
        let addr = (self.inner.host.as_str(), self.inner.port);
        loop {
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    session.stream = Some(stream);
                    break;
                }
                Ok(Err(e)) => {
                    error!("{e} while attempting to reconnect to relay server");
                }
                Err(_) => {
                    error!("timed out while attempting to reconnect to relay server");
                }
            }
        }

        let login = format!(
            "{}${}${}",
            self.inner.user_id, CLIENT_TAG, self.inner.gateway_id
        );
        self.log_sent("login", login.as_bytes());
        match self.exchange(session, login.as_bytes(), true).await? {
            Some(Message {
                payload: Payload::ChannelInformation(info),
                ..
            }) => {
                self.inner.state.set_channel_info(info);
                session.logged_in = true;
                session.last_connect = Some(Instant::now());
                debug!("relay session authenticated");
            }
            _ => {
                warn!("relay login produced no channel information");
            }
        }
        Ok(())
    }

    async fn disconnect_session(&self, session: &mut Session) {
        if let Some(mut stream) = session.stream.take()
            && let Err(e) = stream.shutdown().await
        {
            debug!("error closing relay socket: {e}");
        }
        session.reset();
    }

    async fn exchange(
        &self,
        session: &mut Session,
        frame: &[u8],
        read_response: bool,
    ) -> Result<Option<Message>> {
        let stream = session.stream.as_mut().ok_or(Error::NotConnected)?;
        if let Err(e) = stream.write_all(frame).await {
            warn!("relay write failed: {e}");
            session.reset();
            return Ok(None);
        }
        if let Err(e) = stream.flush().await {
            warn!("relay flush failed: {e}");
            session.reset();
            return Ok(None);
        }
        if !read_response {
            return Ok(None);
        }
        let mut buf = [0u8; READ_BUFFER];
        match timeout(READ_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                warn!("connection reset by relay server, reconnecting on next request");
                session.reset();
                Ok(None)
            }
            Ok(Ok(n)) => {
                let decoded = codec::decode(&buf[..n]);
                self.log_received(decoded.as_ref(), &buf[..n]);
                Ok(decoded)
            }
            Ok(Err(e)) => {
                warn!("relay read failed: {e}");
                session.reset();
                Ok(None)
            }
            Err(_) => {
                warn!("relay read timed out");
                Ok(None)
            }
        }
    }

    fn log_sent(&self, kind: &str, frame: &[u8]) {
        if let Some(logger) = &self.inner.logger {
            logger.lock().unwrap().log_frame_sent(kind, frame);
        }
    }

    fn log_received(&self, decoded: Option<&Message>, frame: &[u8]) {
        if let Some(logger) = &self.inner.logger {
            let kind = decoded.map(|m| payload_kind(&m.payload));
            logger.lock().unwrap().log_frame_received(kind, frame);
        }
    }

}

fn command_kind(command: &ControlCommand) -> &'static str {
    match command {
        ControlCommand::Info(ControlType::ChannelInformation) => "channel-information",
        ControlCommand::Info(ControlType::State) => "state",
        ControlCommand::Info(ControlType::TrendSample) => "trend-sample",
        ControlCommand::Info(ControlType::TrendMonth) => "trend-month",
        ControlCommand::Info(ControlType::TrendYear) => "trend-year",
        ControlCommand::Info(_) => "info",
        ControlCommand::Control(DeviceControl::Power, _) => "power",
        ControlCommand::Control(DeviceControl::Heat, _) => "heat",
        ControlCommand::Control(DeviceControl::WaterTemperature, _) => "water-temperature",
        ControlCommand::Control(DeviceControl::HeatingWaterTemperature, _) => {
            "heating-water-temperature"
        }
        ControlCommand::Control(DeviceControl::OnDemand, _) => "on-demand",
        ControlCommand::Control(DeviceControl::Weekly, _) => "weekly",
        ControlCommand::Control(DeviceControl::RecirculationTemperature, _) => {
            "recirculation-temperature"
        }
    }
}

fn payload_kind(payload: &Payload) -> &'static str {
    match payload {
        Payload::ChannelInformation(_) => "channel-information",
        Payload::State(_) => "state",
        Payload::TrendSample(_) => "trend-sample",
        Payload::TrendMonth(_) => "trend-month",
        Payload::TrendYear(_) => "trend-year",
        Payload::ErrorCode(_) => "error-code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    const GATEWAY_ID: &str = "0123456789abcdef";

    fn channel_info_frame() -> Vec<u8> {
        let mut frame = vec![0u8; 13 + 13 * 3];
        frame[0..8].copy_from_slice(&hex::decode(GATEWAY_ID).unwrap());
        frame[9] = 1; // channel information
        frame[10] = 14;
        frame[11] = 50;
        frame[12] = 1; // channel 1 in use
        // channel 1: NPE, one device, Celsius
        frame[13..26].copy_from_slice(&[1, 1, 1, 1, 60, 120, 40, 80, 1, 1, 0x0C, 0, 1]);
        frame[26] = 2;
        frame[39] = 3;
        frame
    }

    fn state_frame(channel: u8, device: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 271];
        frame[0..8].copy_from_slice(&hex::decode(GATEWAY_ID).unwrap());
        frame[9] = 2;
        frame[16] = 1; // NPE
        frame[18] = channel;
        frame[19] = device;
        frame[30] = 97; // setting temperature
        frame[38] = 1; // power on
        frame
    }

    /// Relay double that requires strict write-then-read pairing: it reads
    /// exactly one request before producing the matching response, so
    /// interleaved requests would produce mismatched frames.
    async fn spawn_relay() -> (std::net::SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = connections.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    // Login line first.
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    assert!(buf[..n].ends_with(GATEWAY_ID.as_bytes()));
                    socket.write_all(&channel_info_frame()).await.unwrap();
                    loop {
                        let n = match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        let request = match codec::decode_control_request(&buf[..n]) {
                            Some(request) => request,
                            None => return,
                        };
                        let response = state_frame(request.channel, request.device_number);
                        if socket.write_all(&response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (addr, connections)
    }

    fn client(addr: std::net::SocketAddr) -> NavilinkTcp {
        NavilinkTcp::builder("user@example.com", GATEWAY_ID)
            .server(addr.ip().to_string(), addr.port())
            .build()
    }

    #[tokio::test]
    async fn connect_stores_channel_information() {
        let (addr, _) = spawn_relay().await;
        let client = client(addr);
        client.connect().await.unwrap();
        let info = client.state_model().channel_info().expect("channel info cached");
        assert_eq!(info.channel(1).unwrap().device_count, 1);
    }

    #[tokio::test]
    async fn session_past_max_age_reconnects_before_request() {
        let (addr, connections) = spawn_relay().await;
        // Zero max age: the session is considered stale the moment the 600s
        // window would normally start, without the test waiting it out.
        let client = NavilinkTcp::builder("user@example.com", GATEWAY_ID)
            .server(addr.ip().to_string(), addr.port())
            .session_max_age(Duration::ZERO)
            .build();
        client.connect().await.unwrap();
        assert_eq!(connections.load(std::sync::atomic::Ordering::SeqCst), 1);

        let snapshot = client.refresh_state(1, 1).await.unwrap().unwrap();
        assert_eq!(snapshot.channel, 1);
        assert_eq!(connections.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fresh_session_does_not_reconnect() {
        let (addr, connections) = spawn_relay().await;
        let client = client(addr);
        client.connect().await.unwrap();
        client.refresh_state(1, 1).await.unwrap().unwrap();
        assert_eq!(connections.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}

//! JSON wire codec for the cloud generation: topic templates, outbound
//! request envelopes, and inbound response extraction. The broker never
//! interprets the session id; it exists purely so the client can match a
//! response to the request that asked for it.

use serde_json::{json, Value};

use crate::rest::DeviceRecord;
use crate::types::{
    ChannelInfo, ChannelInformation, DaySchedule, DeviceControl, DeviceSorting, OnDemand,
    OnOffFlag, RawAverages, RawState, ScheduleEntry, TemperatureUnit, WeeklyDayBlock,
};

pub const PROTOCOL_VERSION: u8 = 2;

/// Broadcast topic announcing that the backbone dropped a client.
pub const DISCONNECT_NOTICE_TOPIC: &str = "evt/+/mobile/event/disconnect-mqtt";

const CMD_CHANNEL_INFORMATION: u32 = 16777217;
const CMD_CHANNEL_STATUS: u32 = 16777219;
const CMD_CONTROL: u32 = 33554437;

/// Per-gateway topic namespace. Requests go to the device's namespace;
/// responses come back on a root private to this client instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub device_type: u8,
    pub mac_address: String,
    pub home_seq: u64,
    pub user_seq: String,
    pub client_id: String,
}

impl TopicSet {
    fn request_root(&self) -> String {
        format!("cmd/{}/navilink-{}/", self.device_type, self.mac_address)
    }

    fn response_root(&self) -> String {
        format!(
            "cmd/{}/{}/{}/{}/res/",
            self.device_type, self.home_seq, self.user_seq, self.client_id
        )
    }

    pub fn status_start(&self) -> String {
        format!("{}status/start", self.request_root())
    }

    pub fn channel_status(&self) -> String {
        format!("{}status/channelstatus", self.request_root())
    }

    pub fn control(&self) -> String {
        format!("{}control", self.request_root())
    }

    pub fn res_channel_info(&self) -> String {
        format!("{}channelinfo", self.response_root())
    }

    pub fn res_channel_status(&self) -> String {
        format!("{}channelstatus", self.response_root())
    }

    pub fn res_control_fail(&self) -> String {
        format!("{}controlfail", self.response_root())
    }

    pub fn res_trend_sample(&self) -> String {
        format!("{}trendsample", self.response_root())
    }

    pub fn res_weekly_schedule(&self) -> String {
        format!("{}weeklyschedule", self.response_root())
    }

    pub fn last_will(&self) -> String {
        format!("evt/1/navilink-{}/app-connection", self.mac_address)
    }

    /// The response topics every session subscribes to before its first
    /// request.
    pub fn response_subscriptions(&self) -> Vec<String> {
        vec![
            self.res_channel_info(),
            self.res_channel_status(),
            self.res_control_fail(),
        ]
    }

    /// Optional extras: trend and schedule responses.
    pub fn extra_subscriptions(&self) -> Vec<String> {
        vec![self.res_trend_sample(), self.res_weekly_schedule()]
    }
}

/// One outbound request to the backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    ChannelInformation,
    ChannelStatus {
        channel: u8,
    },
    Control {
        channel: u8,
        device_number: u8,
        control: DeviceControl,
        value: u8,
        weekly: Option<WeeklyDayBlock>,
    },
}

/// Build the publish topic and JSON envelope for one request.
pub fn envelope(
    kind: &RequestKind,
    device: &DeviceRecord,
    topics: &TopicSet,
    session_id: &str,
) -> (String, Value) {
    let mut request = json!({
        "additionalValue": device.additional_value,
        "deviceType": device.device_type,
        "macAddress": device.mac_address,
    });
    let (topic, response_topic, command) = match kind {
        RequestKind::ChannelInformation => {
            (topics.status_start(), topics.res_channel_info(), CMD_CHANNEL_INFORMATION)
        }
        RequestKind::ChannelStatus { channel } => {
            request["channelNumber"] = json!(channel);
            (topics.channel_status(), topics.res_channel_status(), CMD_CHANNEL_STATUS)
        }
        RequestKind::Control {
            channel,
            device_number,
            control,
            value,
            weekly,
        } => {
            request["channelNumber"] = json!(channel);
            request["deviceNumber"] = json!(device_number);
            request["controlItem"] = json!(control.code());
            request["controlValue"] = json!(value);
            if let Some(block) = weekly {
                let entries: Vec<Value> = (0..usize::from(block.count))
                    .map(|i| {
                        let (hour, minute, flag) = block.slots[i];
                        json!({ "hour": hour, "minute": minute, "isOnOFF": flag })
                    })
                    .collect();
                request["weeklyDay"] = json!({
                    "dayOfWeek": block.day,
                    "count": block.count,
                    "daySequence": entries,
                });
            }
            (topics.control(), topics.res_channel_status(), CMD_CONTROL)
        }
    };
    request["command"] = json!(command);
    let payload = json!({
        "clientID": topics.client_id,
        "protocolVersion": PROTOCOL_VERSION,
        "request": request,
        "requestTopic": topic,
        "responseTopic": response_topic,
        "sessionID": session_id,
    });
    (topic, payload)
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudResponse {
    pub session_id: Option<String>,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    ChannelInformation(ChannelInformation),
    ChannelStatus { channel: u8, units: Vec<RawState> },
    ControlFail(Value),
}

/// Parse one inbound publish. Anything that is not one of the known nested
/// response objects is no message.
pub fn parse_response(payload: &[u8]) -> Option<CloudResponse> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let session_id = value.get("sessionID").map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    let response = value.get("response")?;
    let body = if let Some(info) = response.get("channelInfo") {
        ResponseBody::ChannelInformation(channel_information_from_json(info)?)
    } else if let Some(status) = response.get("channelStatus") {
        let channel = u8_field(status, "channelNumber")?;
        let units = status
            .get("units")
            .or_else(|| status.get("unitList"))
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(raw_state_from_json).collect())
            .unwrap_or_default();
        ResponseBody::ChannelStatus { channel, units }
    } else if let Some(fail) = response.get("controlFail") {
        ResponseBody::ControlFail(fail.clone())
    } else {
        return None;
    };
    Some(CloudResponse { session_id, body })
}

fn channel_information_from_json(info: &Value) -> Option<ChannelInformation> {
    let list = info
        .get("channelList")
        .or_else(|| info.get("channel"))
        .and_then(Value::as_array)?;
    let mut channels = Vec::with_capacity(list.len());
    for item in list {
        let recirculation = match (
            u8_field(item, "minimumSettingRecirculationTemperature"),
            u8_field(item, "maximumSettingRecirculationTemperature"),
        ) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        };
        channels.push(ChannelInfo {
            channel: u8_field(item, "channelNumber").or_else(|| u8_field(item, "channel"))?,
            device_sorting: DeviceSorting::from_code(u8_field(item, "deviceSorting")?)?,
            device_count: u8_field(item, "deviceCount").unwrap_or(0),
            temperature_unit: TemperatureUnit::from_code(
                u8_field(item, "deviceTempFlag").unwrap_or(0),
            ),
            min_water_temperature: u8_field(item, "minimumSettingWaterTemperature").unwrap_or(0),
            max_water_temperature: u8_field(item, "maximumSettingWaterTemperature").unwrap_or(0),
            min_heating_water_temperature: u8_field(item, "heatingMinimumSettingWaterTemperature")
                .unwrap_or(0),
            max_heating_water_temperature: u8_field(item, "heatingMaximumSettingWaterTemperature")
                .unwrap_or(0),
            use_on_demand: OnDemand::from_code(u8_field(item, "useOnDemand").unwrap_or(0))
                == Some(OnDemand::On),
            heating_control: u8_field(item, "heatingControl").unwrap_or(0),
            wwsd: u8_field(item, "wwsdFlag").unwrap_or(0),
            high_temperature: u8_field(item, "highTemperature").unwrap_or(0),
            use_warm_water: u8_field(item, "useWarmWater").unwrap_or(0) == 1,
            recirculation_temperature_range: recirculation,
        });
    }
    if channels.is_empty() {
        return None;
    }
    let channel_use = u8_field(info, "channelUse").unwrap_or_else(|| {
        channels
            .iter()
            .filter(|c| c.device_sorting != DeviceSorting::NoDevice)
            .fold(0u8, |acc, c| acc | 1u8.wrapping_shl(u32::from(c.channel.saturating_sub(1))))
    });
    Some(ChannelInformation {
        channel_use,
        channels,
    })
}

fn raw_state_from_json(unit: &Value) -> Option<RawState> {
    let day_schedules = unit
        .get("daySequences")
        .and_then(Value::as_array)
        .map(|days| {
            days.iter()
                .filter_map(|day| {
                    let entries = day
                        .get("daySequence")
                        .and_then(Value::as_array)
                        .map(|seq| {
                            seq.iter()
                                .filter_map(|e| {
                                    Some(ScheduleEntry {
                                        hour: u8_field(e, "hour")?,
                                        minute: u8_field(e, "minute")?,
                                        state: OnOffFlag::from_code(u8_field(e, "isOnOFF")?),
                                    })
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    Some(DaySchedule {
                        day_of_week: u8_field(day, "dayOfWeek")?,
                        entries,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let averages = u8_field(unit, "hotWaterAverageTemperature").map(|hot_water| RawAverages {
        hot_water,
        inlet: u8_field(unit, "inletAverageTemperature").unwrap_or(0),
        supply: u8_field(unit, "supplyAverageTemperature").unwrap_or(0),
        return_water: u8_field(unit, "returnAverageTemperature").unwrap_or(0),
        recirculation_setting: u8_field(unit, "recirculationSettingTemperature"),
        recirculation_current: u8_field(unit, "recirculationCurrentTemperature"),
    });
    Some(RawState {
        controller_version: u16_field(unit, "controllerVersion").unwrap_or(0),
        panel_version: u16_field(unit, "pannelVersion")
            .or_else(|| u16_field(unit, "panelVersion"))
            .unwrap_or(0),
        device_sorting: DeviceSorting::from_code(u8_field(unit, "deviceSorting")?)?,
        device_count: u8_field(unit, "deviceCount").unwrap_or(0),
        current_channel: u8_field(unit, "currentChannel").unwrap_or(0),
        device_number: u8_field(unit, "deviceNumber")?,
        error_code: u16_field(unit, "errorCD").unwrap_or(0),
        operation_device_number: u8_field(unit, "operationDeviceNumber").unwrap_or(0),
        average_calorimeter: u8_field(unit, "averageCalorimeter").unwrap_or(0),
        gas_instant_use: u16_field(unit, "gasInstantUse").unwrap_or(0),
        gas_accumulated_use: unit
            .get("gasAccumulatedUse")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        hot_water_setting_temperature: u8_field(unit, "hotWaterSettingTemperature").unwrap_or(0),
        hot_water_current_temperature: u8_field(unit, "hotWaterCurrentTemperature").unwrap_or(0),
        hot_water_flow_rate: u16_field(unit, "hotWaterFlowRate").unwrap_or(0),
        hot_water_temperature: u8_field(unit, "hotWaterTemperature").unwrap_or(0),
        heat_setting_temperature: u8_field(unit, "heatSettingTemperature").unwrap_or(0),
        working_fluid_temperature: u8_field(unit, "currentWorkingFluidTemperature").unwrap_or(0),
        return_water_temperature: u8_field(unit, "currentReturnWaterTemperature").unwrap_or(0),
        power_status: u8_field(unit, "powerStatus").unwrap_or(0),
        heat_status: u8_field(unit, "heatStatus").unwrap_or(0),
        use_on_demand: u8_field(unit, "useOnDemand").unwrap_or(0),
        weekly_control: u8_field(unit, "weeklyControl").unwrap_or(0),
        total_day_sequence: u8_field(unit, "totalDaySequence").unwrap_or(0),
        day_schedules,
        averages,
    })
}

fn u8_field(value: &Value, key: &str) -> Option<u8> {
    value.get(key)?.as_u64().map(|v| v as u8)
}

fn u16_field(value: &Value, key: &str) -> Option<u16> {
    value.get(key)?.as_u64().map(|v| v as u16)
}

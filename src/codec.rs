//! Wire codec for the binary relay-server protocol. Pure byte slicing: no
//! I/O, no state. Malformed or truncated frames decode to `None` so a bad
//! read costs one polling cycle instead of the session.

use crate::error::{Error, Result};
use crate::types::*;

/// Every response frame starts with this fixed header; anything at or under
/// this length carries no payload.
pub const COMMON_HEADER_LEN: usize = 12;

/// Fixed request header: start byte, destination id, reserved, command code,
/// payload length, sub-id.
const REQUEST_HEADER: [u8; 6] = [0x07, 0x99, 0x00, 0xA6, 0x37, 0x00];

/// Control requests are always exactly this long: header + gateway id +
/// control block + weekly day block.
pub const CONTROL_REQUEST_LEN: usize = 6 + 8 + 7 + 32;

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    ChannelInformation(ChannelInformation),
    State(RawState),
    TrendSample(TrendSample),
    TrendMonth(TrendCycle),
    TrendYear(TrendCycle),
    ErrorCode(ErrorReport),
}

/// What goes into the control block of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Read request: the info item names the response type wanted.
    Info(ControlType),
    /// Write request: control item plus the value to set.
    Control(DeviceControl, u8),
}

impl ControlCommand {
    fn parts(&self) -> (u8, u8, u8, u8) {
        match self {
            ControlCommand::Info(item) => (ControlSorting::Info.code(), item.code(), 0, 0),
            ControlCommand::Control(item, value) => {
                (ControlSorting::Control.code(), 0, item.code(), *value)
            }
        }
    }
}

/// Control-request fields recovered by [`decode_control_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub gateway_id: String,
    pub channel: u8,
    pub device_number: u8,
    pub control_sorting: u8,
    pub info_item: u8,
    pub control_item: u8,
    pub control_value: u8,
    pub weekly: WeeklyDayBlock,
}

/// Multi-byte fields arrive in an internal byte order: reverse the bytes,
/// then read the result as a big-endian integer. This is the exact rule the
/// gateways use, not a plain endianness swap of a fixed-width word.
fn reverse_then_parse(bytes: &[u8]) -> u64 {
    let mut reversed = bytes.to_vec();
    reversed.reverse();
    reversed.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn u16_field(bytes: &[u8]) -> u16 {
    reverse_then_parse(bytes) as u16
}

fn u32_field(bytes: &[u8]) -> u32 {
    reverse_then_parse(bytes) as u32
}

/// Decode one response frame. `None` means "no message this cycle": a short
/// frame, an unknown control type, or a payload that does not parse.
pub fn decode(data: &[u8]) -> Option<Message> {
    if data.len() <= COMMON_HEADER_LEN {
        return None;
    }
    let header = Header {
        device_id: hex::encode(&data[0..8]),
        country_code: data[8],
        sw_version_major: data[10],
        sw_version_minor: data[11],
    };
    let payload = match ControlType::from_code(data[9]) {
        ControlType::ChannelInformation => {
            Payload::ChannelInformation(decode_channel_information(&header, data)?)
        }
        ControlType::State => Payload::State(decode_state(data)?),
        ControlType::TrendSample => Payload::TrendSample(decode_trend_sample(data)?),
        ControlType::TrendMonth => Payload::TrendMonth(decode_trend_cycle(data)?),
        ControlType::TrendYear => Payload::TrendYear(decode_trend_cycle(data)?),
        ControlType::ErrorCode => Payload::ErrorCode(decode_error_report(data)?),
        ControlType::Unknown => return None,
    };
    Some(Message { header, payload })
}

fn decode_channel_information(header: &Header, data: &[u8]) -> Option<ChannelInformation> {
    let channel_use = *data.get(12)?;
    if channel_use == 0 {
        return None;
    }
    // Firmware newer than 15.00 appends min/max recirculation temperatures
    // to each channel record.
    let record_len = if header.firmware() > 1500 { 15 } else { 13 };
    let mut channels = Vec::with_capacity(3);
    for x in 0..3 {
        let start = 13 + record_len * x;
        let rec = data.get(start..start + record_len)?;
        channels.push(ChannelInfo {
            channel: rec[0],
            device_sorting: DeviceSorting::from_code(rec[1])?,
            device_count: rec[2],
            temperature_unit: TemperatureUnit::from_code(rec[3]),
            min_water_temperature: rec[4],
            max_water_temperature: rec[5],
            min_heating_water_temperature: rec[6],
            max_heating_water_temperature: rec[7],
            use_on_demand: OnDemand::from_code(rec[8])? == OnDemand::On,
            heating_control: rec[9],
            wwsd: rec[10],
            high_temperature: rec[11],
            use_warm_water: rec[12] == 1,
            recirculation_temperature_range: if record_len == 15 {
                Some((rec[13], rec[14]))
            } else {
                None
            },
        });
    }
    Some(ChannelInformation {
        channel_use,
        channels,
    })
}

fn decode_state(data: &[u8]) -> Option<RawState> {
    let block = data.get(12..43)?;
    let mut day_schedules = Vec::with_capacity(7);
    for i in 0..7 {
        let base = 43 + i * 32;
        let day = data.get(base..base + 32)?;
        let count = usize::from(day[1]).min(10);
        let mut entries = Vec::with_capacity(count);
        for j in 0..count {
            entries.push(ScheduleEntry {
                hour: day[2 + j * 3],
                minute: day[3 + j * 3],
                state: OnOffFlag::from_code(day[4 + j * 3]),
            });
        }
        day_schedules.push(DaySchedule {
            day_of_week: day[0],
            entries,
        });
    }
    let averages = if data.len() >= 273 {
        Some(RawAverages {
            hot_water: data[267],
            inlet: data[268],
            supply: data[269],
            return_water: data[270],
            recirculation_setting: Some(data[271]),
            recirculation_current: Some(data[272]),
        })
    } else if data.len() >= 271 {
        Some(RawAverages {
            hot_water: data[267],
            inlet: data[268],
            supply: data[269],
            return_water: data[270],
            recirculation_setting: None,
            recirculation_current: None,
        })
    } else {
        None
    };
    Some(RawState {
        controller_version: u16_field(&block[0..2]),
        panel_version: u16_field(&block[2..4]),
        device_sorting: DeviceSorting::from_code(block[4])?,
        device_count: block[5],
        current_channel: block[6],
        device_number: block[7],
        error_code: u16_field(&block[8..10]),
        operation_device_number: block[10],
        average_calorimeter: block[11],
        gas_instant_use: u16_field(&block[12..14]),
        gas_accumulated_use: u32_field(&block[14..18]),
        hot_water_setting_temperature: block[18],
        hot_water_current_temperature: block[19],
        hot_water_flow_rate: u16_field(&block[20..22]),
        hot_water_temperature: block[22],
        heat_setting_temperature: block[23],
        working_fluid_temperature: block[24],
        return_water_temperature: block[25],
        power_status: block[26],
        heat_status: block[27],
        use_on_demand: block[28],
        weekly_control: block[29],
        total_day_sequence: block[30],
        day_schedules,
        averages,
    })
}

fn decode_error_report(data: &[u8]) -> Option<ErrorReport> {
    let block = data.get(12..23)?;
    Some(ErrorReport {
        controller_version: u16_field(&block[0..2]),
        panel_version: u16_field(&block[2..4]),
        device_sorting: DeviceSorting::from_code(block[4])?,
        device_count: block[5],
        current_channel: block[6],
        device_number: block[7],
        error_flag: block[8],
        error_code: u16_field(&block[9..11]),
    })
}

fn decode_trend_sample(data: &[u8]) -> Option<TrendSample> {
    let block = data.get(12..41)?;
    Some(TrendSample {
        controller_version: u16_field(&block[0..2]),
        panel_version: u16_field(&block[2..4]),
        device_sorting: DeviceSorting::from_code(block[4])?,
        device_count: block[5],
        current_channel: block[6],
        device_number: block[7],
        model_info: u32_field(&block[8..11]),
        total_operated_time: u32_field(&block[11..15]),
        total_gas_accumulate_sum: u32_field(&block[15..19]),
        total_hot_water_accumulate_sum: u32_field(&block[19..23]),
        total_ch_operated_time: u32_field(&block[23..27]),
        total_dhw_usage_time: u16_field(&block[27..29]),
    })
}

fn decode_trend_cycle(data: &[u8]) -> Option<TrendCycle> {
    let block = data.get(12..21)?;
    let total = usize::from(block[8]);
    let mut records = Vec::with_capacity(total);
    for i in 0..total {
        let base = 21 + i * 22;
        let rec = data.get(base..base + 22)?;
        records.push(TrendRecord {
            index: rec[0],
            model_info: u32_field(&rec[1..4]),
            gas_accumulated_use: u32_field(&rec[4..8]),
            hot_water_accumulated_use: u32_field(&rec[8..12]),
            hot_water_operated_count: u16_field(&rec[12..14]),
            on_demand_use_count: u16_field(&rec[14..16]),
            heat_accumulated_use: u16_field(&rec[16..18]),
            outdoor_air_max_temperature: rec[18],
            outdoor_air_min_temperature: rec[19],
            dhw_accumulated_use: u16_field(&rec[20..22]),
        });
    }
    Some(TrendCycle {
        controller_version: u16_field(&block[0..2]),
        panel_version: u16_field(&block[2..4]),
        device_sorting: DeviceSorting::from_code(block[4])?,
        device_count: block[5],
        current_channel: block[6],
        device_number: block[7],
        records,
    })
}

/// Build the bytes of one control request. The weekly block is always
/// transmitted; pass `WeeklyDayBlock::default()` when the request does not
/// touch schedules.
pub fn encode_control_request(
    gateway_id: &str,
    channel: u8,
    device_number: u8,
    command: &ControlCommand,
    weekly: &WeeklyDayBlock,
) -> Result<Vec<u8>> {
    let gateway_bytes = hex::decode(gateway_id)
        .map_err(|_| Error::InvalidGatewayId(gateway_id.to_string()))?;
    if gateway_bytes.len() != 8 {
        return Err(Error::InvalidGatewayId(gateway_id.to_string()));
    }
    let (control_sorting, info_item, control_item, control_value) = command.parts();
    let mut out = Vec::with_capacity(CONTROL_REQUEST_LEN);
    out.extend_from_slice(&REQUEST_HEADER);
    out.extend_from_slice(&gateway_bytes);
    out.extend_from_slice(&[
        0x01, // command count
        channel,
        device_number,
        control_sorting,
        info_item,
        control_item,
        control_value,
    ]);
    out.extend_from_slice(&weekly.to_bytes());
    Ok(out)
}

/// Inverse of [`encode_control_request`], used by tests and fake relay
/// servers to check what a client actually asked for.
pub fn decode_control_request(data: &[u8]) -> Option<ControlRequest> {
    if data.len() != CONTROL_REQUEST_LEN || data[0..6] != REQUEST_HEADER {
        return None;
    }
    let weekly: [u8; 32] = data[21..53].try_into().ok()?;
    Some(ControlRequest {
        gateway_id: hex::encode(&data[6..14]),
        channel: data[15],
        device_number: data[16],
        control_sorting: data[17],
        info_item: data[18],
        control_item: data[19],
        control_value: data[20],
        weekly: WeeklyDayBlock::from_bytes(&weekly),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_then_parse_is_bytewise_reversal() {
        // [0x01, 0x02] reversed is [0x02, 0x01], read big-endian: 0x0201.
        assert_eq!(reverse_then_parse(&[0x01, 0x02]), 0x0201);
        assert_eq!(reverse_then_parse(&[0x12, 0x34, 0x56]), 0x563412);
        assert_eq!(reverse_then_parse(&[0x00]), 0x00);
        assert_eq!(reverse_then_parse(&[]), 0);
    }

    #[test]
    fn short_frame_is_no_message() {
        assert!(decode(&[]).is_none());
        assert!(decode(&[0u8; 12]).is_none());
    }

    #[test]
    fn unknown_control_type_is_no_message() {
        let mut frame = vec![0u8; 60];
        frame[9] = 0x7F;
        assert!(decode(&frame).is_none());
    }

    #[test]
    fn header_device_id_is_hex() {
        let mut frame = vec![0u8; 23 + 1];
        frame[0..8].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0x01, 0x02, 0x03, 0x04]);
        frame[8] = 1; // country
        frame[9] = 6; // error code report
        frame[10] = 15;
        frame[11] = 1;
        frame[16] = 1; // deviceSorting NPE
        let msg = decode(&frame).expect("error report should decode");
        assert_eq!(msg.header.device_id, "aabbccdd01020304");
        assert_eq!(msg.header.firmware(), 1501);
    }

    #[test]
    fn control_request_round_trip() {
        let commands = [
            ControlCommand::Info(ControlType::State),
            ControlCommand::Info(ControlType::ChannelInformation),
            ControlCommand::Info(ControlType::TrendSample),
            ControlCommand::Info(ControlType::TrendMonth),
            ControlCommand::Info(ControlType::TrendYear),
            ControlCommand::Control(DeviceControl::Power, 1),
            ControlCommand::Control(DeviceControl::Heat, 2),
            ControlCommand::Control(DeviceControl::WaterTemperature, 97),
            ControlCommand::Control(DeviceControl::HeatingWaterTemperature, 60),
            ControlCommand::Control(DeviceControl::OnDemand, 1),
            ControlCommand::Control(DeviceControl::Weekly, 1),
            ControlCommand::Control(DeviceControl::RecirculationTemperature, 45),
        ];
        for command in commands {
            let bytes =
                encode_control_request("0123456789abcdef", 2, 1, &command, &WeeklyDayBlock::default())
                    .unwrap();
            assert_eq!(bytes.len(), CONTROL_REQUEST_LEN);
            let decoded = decode_control_request(&bytes).expect("round trip");
            assert_eq!(decoded.gateway_id, "0123456789abcdef");
            assert_eq!(decoded.channel, 2);
            assert_eq!(decoded.device_number, 1);
            let (sorting, info, item, value) = command.parts();
            assert_eq!(decoded.control_sorting, sorting);
            assert_eq!(decoded.info_item, info);
            assert_eq!(decoded.control_item, item);
            assert_eq!(decoded.control_value, value);
        }
    }

    #[test]
    fn control_request_carries_weekly_block() {
        let mut weekly = WeeklyDayBlock {
            day: 3,
            count: 2,
            ..Default::default()
        };
        weekly.slots[0] = (6, 30, 1);
        weekly.slots[1] = (22, 0, 2);
        let bytes = encode_control_request(
            "0123456789abcdef",
            1,
            1,
            &ControlCommand::Control(DeviceControl::Weekly, 1),
            &weekly,
        )
        .unwrap();
        let decoded = decode_control_request(&bytes).unwrap();
        assert_eq!(decoded.weekly, weekly);
    }

    #[test]
    fn bad_gateway_id_rejected() {
        let short = encode_control_request(
            "0102",
            1,
            1,
            &ControlCommand::Info(ControlType::State),
            &WeeklyDayBlock::default(),
        );
        assert!(matches!(short, Err(Error::InvalidGatewayId(_))));
        let not_hex = encode_control_request(
            "zz23456789abcdef",
            1,
            1,
            &ControlCommand::Info(ControlType::State),
            &WeeklyDayBlock::default(),
        );
        assert!(matches!(not_hex, Err(Error::InvalidGatewayId(_))));
    }

    fn channel_record_13(channel: u8, sorting: u8, unit: u8) -> [u8; 13] {
        [channel, sorting, 1, unit, 30, 60, 40, 80, 2, 1, 0x0C, 0, 1]
    }

    #[test]
    fn channel_information_13_byte_records() {
        let mut frame = vec![0u8; 13 + 13 * 3];
        frame[9] = 1; // channel information
        frame[10] = 14;
        frame[11] = 99; // firmware 1499: old record layout
        frame[12] = 7; // all three channels in use
        frame[13..26].copy_from_slice(&channel_record_13(1, 1, 1));
        frame[26..39].copy_from_slice(&channel_record_13(2, 0, 0));
        frame[39..52].copy_from_slice(&channel_record_13(3, 0, 0));
        let msg = decode(&frame).unwrap();
        let Payload::ChannelInformation(info) = msg.payload else {
            panic!("expected channel information");
        };
        assert_eq!(info.channels.len(), 3);
        let first = info.channel(1).unwrap();
        assert_eq!(first.device_sorting, DeviceSorting::Npe);
        assert_eq!(first.temperature_unit, TemperatureUnit::Celsius);
        assert_eq!(first.min_water_temperature, 30);
        assert_eq!(first.max_water_temperature, 60);
        assert!(!first.use_on_demand); // wire code 2 is OFF
        assert!(first.hot_water_possible());
        assert!(first.recirculation_possible());
        assert!(first.recirculation_temperature_range.is_none());
        assert_eq!(info.channel(2).unwrap().device_sorting, DeviceSorting::NoDevice);
    }

    #[test]
    fn channel_information_15_byte_records_after_1500() {
        let mut frame = vec![0u8; 13 + 15 * 3];
        frame[9] = 1;
        frame[10] = 15;
        frame[11] = 1; // firmware 1501
        frame[12] = 1;
        let mut rec = [0u8; 15];
        rec[0..13].copy_from_slice(&channel_record_13(1, 8, 2));
        rec[13] = 35;
        rec[14] = 55;
        frame[13..28].copy_from_slice(&rec);
        // channels 2 and 3 left zeroed: NO_DEVICE records
        let msg = decode(&frame).unwrap();
        let Payload::ChannelInformation(info) = msg.payload else {
            panic!("expected channel information");
        };
        let first = info.channel(1).unwrap();
        assert_eq!(first.device_sorting, DeviceSorting::Nfc);
        assert_eq!(first.temperature_unit, TemperatureUnit::Fahrenheit);
        assert_eq!(first.recirculation_temperature_range, Some((35, 55)));
    }

    #[test]
    fn channel_use_zero_is_no_message() {
        let mut frame = vec![0u8; 13 + 13 * 3];
        frame[9] = 1;
        frame[12] = 0;
        assert!(decode(&frame).is_none());
    }

    #[test]
    fn truncated_channel_information_is_no_message() {
        let mut frame = vec![0u8; 20];
        frame[9] = 1;
        frame[12] = 7;
        assert!(decode(&frame).is_none());
    }

    #[test]
    fn state_with_four_trailing_averages() {
        let mut frame = vec![0u8; 271];
        frame[9] = 2;
        let block = &mut frame[12..43];
        block[0] = 0x10; // controllerVersion, reversed parse
        block[1] = 0x02;
        block[4] = 1; // NPE
        block[5] = 1;
        block[6] = 1;
        block[7] = 1;
        block[12] = 0x2A; // gasInstantUse low byte first on the wire
        block[18] = 97; // setting temperature, half-degree counts
        block[26] = 1; // power on
        block[30] = 7;
        // day 0 carries one entry
        frame[43] = 1; // Sunday
        frame[44] = 1;
        frame[45] = 6;
        frame[46] = 30;
        frame[47] = 1;
        frame[267] = 90;
        frame[268] = 20;
        frame[269] = 70;
        frame[270] = 60;
        let msg = decode(&frame).unwrap();
        let Payload::State(state) = msg.payload else {
            panic!("expected state");
        };
        assert_eq!(state.controller_version, 0x0210);
        assert_eq!(state.gas_instant_use, 0x2A);
        assert_eq!(state.hot_water_setting_temperature, 97);
        assert_eq!(state.power_status, 1);
        assert_eq!(state.day_schedules.len(), 7);
        assert_eq!(state.day_schedules[0].day_of_week, 1);
        assert_eq!(
            state.day_schedules[0].entries,
            vec![ScheduleEntry {
                hour: 6,
                minute: 30,
                state: OnOffFlag::On
            }]
        );
        let avg = state.averages.unwrap();
        assert_eq!(avg.hot_water, 90);
        assert_eq!(avg.recirculation_setting, None);
    }

    #[test]
    fn state_with_six_trailing_averages() {
        let mut frame = vec![0u8; 273];
        frame[9] = 2;
        frame[16] = 1; // deviceSorting NPE
        frame[271] = 45;
        frame[272] = 43;
        let msg = decode(&frame).unwrap();
        let Payload::State(state) = msg.payload else {
            panic!("expected state");
        };
        let avg = state.averages.unwrap();
        assert_eq!(avg.recirculation_setting, Some(45));
        assert_eq!(avg.recirculation_current, Some(43));
    }

    #[test]
    fn truncated_state_is_no_message() {
        let mut frame = vec![0u8; 100];
        frame[9] = 2;
        frame[16] = 1;
        assert!(decode(&frame).is_none());
    }

    #[test]
    fn error_report_decodes() {
        let mut frame = vec![0u8; 24];
        frame[9] = 6;
        frame[16] = 2; // NCB
        frame[19] = 1; // errorFlag
        frame[21] = 0x0F; // errorCD low byte
        let msg = decode(&frame).unwrap();
        let Payload::ErrorCode(report) = msg.payload else {
            panic!("expected error report");
        };
        assert_eq!(report.device_sorting, DeviceSorting::Ncb);
        assert_eq!(report.error_flag, 1);
        assert_eq!(report.error_code, 0x0F);
    }

    #[test]
    fn trend_cycle_reads_all_records() {
        let mut frame = vec![0u8; 21 + 22 * 2];
        frame[9] = 4; // trend month
        frame[16] = 1;
        frame[20] = 2; // two day records
        frame[21] = 1; // first record index
        frame[43] = 2; // second record index
        let msg = decode(&frame).unwrap();
        let Payload::TrendMonth(cycle) = msg.payload else {
            panic!("expected trend month");
        };
        assert_eq!(cycle.records.len(), 2);
        assert_eq!(cycle.records[0].index, 1);
        assert_eq!(cycle.records[1].index, 2);
    }

    #[test]
    fn trend_cycle_truncated_record_is_no_message() {
        let mut frame = vec![0u8; 30];
        frame[9] = 5;
        frame[16] = 1;
        frame[20] = 2;
        assert!(decode(&frame).is_none());
    }
}

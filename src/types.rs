use chrono::{DateTime, Utc};

/// Message type carried in byte 9 of the relay-server common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Unknown,
    ChannelInformation,
    State,
    TrendSample,
    TrendMonth,
    TrendYear,
    ErrorCode,
}

impl ControlType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => ControlType::ChannelInformation,
            2 => ControlType::State,
            3 => ControlType::TrendSample,
            4 => ControlType::TrendMonth,
            5 => ControlType::TrendYear,
            6 => ControlType::ErrorCode,
            _ => ControlType::Unknown,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ControlType::Unknown => 0,
            ControlType::ChannelInformation => 1,
            ControlType::State => 2,
            ControlType::TrendSample => 3,
            ControlType::TrendMonth => 4,
            ControlType::TrendYear => 5,
            ControlType::ErrorCode => 6,
        }
    }
}

/// Device model reported per channel. Selects unit-conversion factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSorting {
    #[default]
    NoDevice,
    Npe,
    Ncb,
    Nhb,
    CasNpe,
    CasNhb,
    Nfb,
    CasNfb,
    Nfc,
    Npn,
    CasNpn,
    Npe2,
    CasNpe2,
    NcbH,
    Nvw,
    CasNvw,
}

impl DeviceSorting {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => DeviceSorting::NoDevice,
            1 => DeviceSorting::Npe,
            2 => DeviceSorting::Ncb,
            3 => DeviceSorting::Nhb,
            4 => DeviceSorting::CasNpe,
            5 => DeviceSorting::CasNhb,
            6 => DeviceSorting::Nfb,
            7 => DeviceSorting::CasNfb,
            8 => DeviceSorting::Nfc,
            9 => DeviceSorting::Npn,
            10 => DeviceSorting::CasNpn,
            11 => DeviceSorting::Npe2,
            12 => DeviceSorting::CasNpe2,
            13 => DeviceSorting::NcbH,
            14 => DeviceSorting::Nvw,
            15 => DeviceSorting::CasNvw,
            _ => return None,
        })
    }

    pub fn code(&self) -> u8 {
        match self {
            DeviceSorting::NoDevice => 0,
            DeviceSorting::Npe => 1,
            DeviceSorting::Ncb => 2,
            DeviceSorting::Nhb => 3,
            DeviceSorting::CasNpe => 4,
            DeviceSorting::CasNhb => 5,
            DeviceSorting::Nfb => 6,
            DeviceSorting::CasNfb => 7,
            DeviceSorting::Nfc => 8,
            DeviceSorting::Npn => 9,
            DeviceSorting::CasNpn => 10,
            DeviceSorting::Npe2 => 11,
            DeviceSorting::CasNpe2 => 12,
            DeviceSorting::NcbH => 13,
            DeviceSorting::Nvw => 14,
            DeviceSorting::CasNvw => 15,
        }
    }

    /// Cascade installations report extra averaged temperatures.
    pub fn is_cascade(&self) -> bool {
        matches!(
            self,
            DeviceSorting::CasNpe
                | DeviceSorting::CasNhb
                | DeviceSorting::CasNfb
                | DeviceSorting::CasNpn
                | DeviceSorting::CasNpe2
                | DeviceSorting::CasNvw
        )
    }

    /// Models whose hot-water temperatures and flow rate are scaled on the wire.
    pub fn heats_water(&self) -> bool {
        !matches!(
            self,
            DeviceSorting::NoDevice | DeviceSorting::Nhb | DeviceSorting::CasNhb
        )
    }

    /// Models reporting gas use at the finer granularity.
    pub fn high_gas_resolution(&self) -> bool {
        matches!(
            self,
            DeviceSorting::Nfc | DeviceSorting::NcbH | DeviceSorting::Nfb | DeviceSorting::Nvw
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureUnit {
    Unknown,
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => TemperatureUnit::Celsius,
            2 => TemperatureUnit::Fahrenheit,
            _ => TemperatureUnit::Unknown,
        }
    }
}

/// On-demand ("hot button") state. The wire reports a third state while the
/// recirculation loop is priming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDemand {
    Unknown,
    On,
    Off,
    WarmUp,
}

impl OnDemand {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => OnDemand::Unknown,
            1 => OnDemand::On,
            2 => OnDemand::Off,
            3 => OnDemand::WarmUp,
            _ => return None,
        })
    }
}

/// Two-state wire flag: 1 is on, anything else is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnOffFlag {
    On,
    Off,
}

impl OnOffFlag {
    pub fn from_code(code: u8) -> Self {
        if code == 1 { OnOffFlag::On } else { OnOffFlag::Off }
    }

    pub fn code(&self) -> u8 {
        match self {
            OnOffFlag::On => 1,
            OnOffFlag::Off => 2,
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, OnOffFlag::On)
    }
}

impl From<bool> for OnOffFlag {
    fn from(on: bool) -> Self {
        if on { OnOffFlag::On } else { OnOffFlag::Off }
    }
}

/// Request discriminator: read information or change a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSorting {
    Info,
    Control,
}

impl ControlSorting {
    pub fn code(&self) -> u8 {
        match self {
            ControlSorting::Info => 1,
            ControlSorting::Control => 2,
        }
    }
}

/// Settable items in a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceControl {
    Power,
    Heat,
    WaterTemperature,
    HeatingWaterTemperature,
    OnDemand,
    Weekly,
    RecirculationTemperature,
}

impl DeviceControl {
    pub fn code(&self) -> u8 {
        match self {
            DeviceControl::Power => 1,
            DeviceControl::Heat => 2,
            DeviceControl::WaterTemperature => 3,
            DeviceControl::HeatingWaterTemperature => 4,
            DeviceControl::OnDemand => 5,
            DeviceControl::Weekly => 6,
            DeviceControl::RecirculationTemperature => 7,
        }
    }
}

// WWSD capability bitmask on the channel record.
pub const WWSD_FLAG: u8 = 0x01;
pub const WWSD_COMMERCIAL_LOCK: u8 = 0x02;
pub const WWSD_HOTWATER_POSSIBILITY: u8 = 0x04;
pub const WWSD_RECIRCULATION_POSSIBILITY: u8 = 0x08;

/// Common header present on every relay-server response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Gateway device id, rendered as lowercase hex.
    pub device_id: String,
    pub country_code: u8,
    pub sw_version_major: u8,
    pub sw_version_minor: u8,
}

impl Header {
    /// Derived firmware version selecting version-dependent payload layouts.
    pub fn firmware(&self) -> u16 {
        u16::from(self.sw_version_major) * 100 + u16::from(self.sw_version_minor)
    }
}

/// One serial bus on the gateway, as described by the channel-information
/// response. Temperature limits are raw wire values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel: u8,
    pub device_sorting: DeviceSorting,
    pub device_count: u8,
    pub temperature_unit: TemperatureUnit,
    pub min_water_temperature: u8,
    pub max_water_temperature: u8,
    pub min_heating_water_temperature: u8,
    pub max_heating_water_temperature: u8,
    pub use_on_demand: bool,
    pub heating_control: u8,
    pub wwsd: u8,
    pub high_temperature: u8,
    pub use_warm_water: bool,
    /// Only reported by firmware newer than 15.00.
    pub recirculation_temperature_range: Option<(u8, u8)>,
}

impl ChannelInfo {
    pub fn hot_water_possible(&self) -> bool {
        self.wwsd & WWSD_HOTWATER_POSSIBILITY != 0
    }

    pub fn recirculation_possible(&self) -> bool {
        self.wwsd & WWSD_RECIRCULATION_POSSIBILITY != 0
    }

    pub fn commercial_lock(&self) -> bool {
        self.wwsd & WWSD_COMMERCIAL_LOCK != 0
    }
}

/// Channel-information payload: three channel records, of which only those
/// with `device_sorting != NoDevice` host appliances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInformation {
    pub channel_use: u8,
    pub channels: Vec<ChannelInfo>,
}

impl ChannelInformation {
    pub fn channel(&self, number: u8) -> Option<&ChannelInfo> {
        self.channels.iter().find(|c| c.channel == number)
    }
}

/// One schedule slot: hour, minute and whether the unit turns on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub hour: u8,
    pub minute: u8,
    pub state: OnOffFlag,
}

/// One day bucket of the weekly schedule, at most ten entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DaySchedule {
    /// Wire day code, 1 (Sunday) through 7 (Saturday).
    pub day_of_week: u8,
    pub entries: Vec<ScheduleEntry>,
}

/// The 32-byte day block transmitted with every control request: day code,
/// entry count, then ten (hour, minute, flag) slots, zero-filled when the
/// request does not touch schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WeeklyDayBlock {
    pub day: u8,
    pub count: u8,
    pub slots: [(u8, u8, u8); 10],
}

impl WeeklyDayBlock {
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[0] = self.day;
        out[1] = self.count;
        for (i, (hour, minute, flag)) in self.slots.iter().enumerate() {
            out[2 + i * 3] = *hour;
            out[3 + i * 3] = *minute;
            out[4 + i * 3] = *flag;
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let mut slots = [(0u8, 0u8, 0u8); 10];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = (bytes[2 + i * 3], bytes[3 + i * 3], bytes[4 + i * 3]);
        }
        WeeklyDayBlock {
            day: bytes[0],
            count: bytes[1],
            slots,
        }
    }
}

/// State payload exactly as decoded from the wire, before unit conversion.
/// Multi-byte counters have already been through reverse-then-parse; no
/// conversion factor has been applied yet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawState {
    pub controller_version: u16,
    pub panel_version: u16,
    pub device_sorting: DeviceSorting,
    pub device_count: u8,
    pub current_channel: u8,
    pub device_number: u8,
    pub error_code: u16,
    pub operation_device_number: u8,
    pub average_calorimeter: u8,
    pub gas_instant_use: u16,
    pub gas_accumulated_use: u32,
    pub hot_water_setting_temperature: u8,
    pub hot_water_current_temperature: u8,
    pub hot_water_flow_rate: u16,
    pub hot_water_temperature: u8,
    pub heat_setting_temperature: u8,
    pub working_fluid_temperature: u8,
    pub return_water_temperature: u8,
    pub power_status: u8,
    pub heat_status: u8,
    pub use_on_demand: u8,
    pub weekly_control: u8,
    pub total_day_sequence: u8,
    pub day_schedules: Vec<DaySchedule>,
    pub averages: Option<RawAverages>,
}

/// Trailing average-temperature bytes, present on longer state frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAverages {
    pub hot_water: u8,
    pub inlet: u8,
    pub supply: u8,
    pub return_water: u8,
    /// Only on the six-byte form.
    pub recirculation_setting: Option<u8>,
    pub recirculation_current: Option<u8>,
}

/// Fully converted status reading for one unit. Immutable once produced;
/// replaced wholesale by the next successful read.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub controller_version: u16,
    pub panel_version: u16,
    pub device_sorting: DeviceSorting,
    pub device_count: u8,
    pub channel: u8,
    pub device_number: u8,
    pub error_code: u16,
    pub operation_device_number: u8,
    pub average_calorimeter: u8,
    pub gas_instant_use: f64,
    pub gas_accumulated_use: f64,
    pub hot_water_setting_temperature: f64,
    pub hot_water_current_temperature: f64,
    pub hot_water_flow_rate: f64,
    pub hot_water_temperature: f64,
    pub heat_setting_temperature: f64,
    pub working_fluid_temperature: f64,
    pub return_water_temperature: f64,
    pub power: bool,
    pub heat: bool,
    pub on_demand: OnDemand,
    pub weekly_control: bool,
    pub day_schedules: Vec<DaySchedule>,
    pub averages: Option<StateAverages>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StateAverages {
    pub hot_water: f64,
    pub inlet: f64,
    pub supply: f64,
    pub return_water: f64,
    pub recirculation_setting: Option<f64>,
    pub recirculation_current: Option<f64>,
}

/// Error-code payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub controller_version: u16,
    pub panel_version: u16,
    pub device_sorting: DeviceSorting,
    pub device_count: u8,
    pub current_channel: u8,
    pub device_number: u8,
    pub error_flag: u8,
    pub error_code: u16,
}

/// Lifetime counters returned by a trend-sample request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendSample {
    pub controller_version: u16,
    pub panel_version: u16,
    pub device_sorting: DeviceSorting,
    pub device_count: u8,
    pub current_channel: u8,
    pub device_number: u8,
    pub model_info: u32,
    pub total_operated_time: u32,
    pub total_gas_accumulate_sum: u32,
    pub total_hot_water_accumulate_sum: u32,
    pub total_ch_operated_time: u32,
    pub total_dhw_usage_time: u16,
}

/// Per-day (or per-month) usage record in a trend cycle response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendRecord {
    pub index: u8,
    pub model_info: u32,
    pub gas_accumulated_use: u32,
    pub hot_water_accumulated_use: u32,
    pub hot_water_operated_count: u16,
    pub on_demand_use_count: u16,
    pub heat_accumulated_use: u16,
    pub outdoor_air_max_temperature: u8,
    pub outdoor_air_min_temperature: u8,
    pub dhw_accumulated_use: u16,
}

/// Trend-month / trend-year payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendCycle {
    pub controller_version: u16,
    pub panel_version: u16,
    pub device_sorting: DeviceSorting,
    pub device_count: u8,
    pub current_channel: u8,
    pub device_number: u8,
    pub records: Vec<TrendRecord>,
}

//! Unit conversion from raw wire readings to caller-facing values.
//!
//! Every factor is a pure function of (field, device model, unit system).
//! A factor is applied exactly once, when a raw reading becomes a
//! [`StateSnapshot`]; applying it again to an already-converted value
//! produces a different number. Callers must never re-run conversion on
//! stored state.

use chrono::Utc;

use crate::types::{
    ChannelInfo, DeviceSorting, OnDemand, OnOffFlag, RawState, StateAverages, StateSnapshot,
    TemperatureUnit,
};

/// Converted reading families. Temperatures cover the setting/current/outlet
/// fields and the cascade averages alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Temperature,
    GasInstantUse,
    GasAccumulatedUse,
    FlowRate,
}

/// The multiplier taking a raw wire value to the value reported to callers.
pub fn factor(field: Field, sorting: DeviceSorting, unit: TemperatureUnit) -> f64 {
    match (field, unit) {
        // Celsius channels store temperatures as half-degree counts; the
        // scaling only applies to models that heat water at all.
        (Field::Temperature, TemperatureUnit::Celsius) if sorting.heats_water() => 0.5,
        (Field::Temperature, _) => 1.0,
        (Field::GasInstantUse, TemperatureUnit::Celsius) => {
            if sorting.high_gas_resolution() { 10.0 } else { 1.0 }
        }
        (Field::GasInstantUse, TemperatureUnit::Fahrenheit) => {
            let giu = if sorting.high_gas_resolution() { 10.0 } else { 1.0 };
            giu * 3.968
        }
        (Field::GasInstantUse, TemperatureUnit::Unknown) => 1.0,
        (Field::GasAccumulatedUse, TemperatureUnit::Celsius) => 0.1,
        (Field::GasAccumulatedUse, TemperatureUnit::Fahrenheit) => 3.5314667,
        (Field::GasAccumulatedUse, TemperatureUnit::Unknown) => 1.0,
        (Field::FlowRate, TemperatureUnit::Celsius) if sorting.heats_water() => 0.1,
        // Liters-per-minute tenths to gallons per minute in one step.
        (Field::FlowRate, TemperatureUnit::Fahrenheit) if sorting.heats_water() => 1.0 / 37.85,
        (Field::FlowRate, _) => 1.0,
    }
}

/// Apply one conversion, rounded to a single decimal like the gateways'
/// own applications report.
pub fn convert(field: Field, raw: f64, sorting: DeviceSorting, unit: TemperatureUnit) -> f64 {
    round1(raw * factor(field, sorting, unit))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Build the converted snapshot for one raw state reading, scoped to the
/// owning channel's temperature unit. The capture timestamp is stamped here.
pub fn convert_state(raw: &RawState, channel: &ChannelInfo) -> StateSnapshot {
    let unit = channel.temperature_unit;
    let sorting = raw.device_sorting;
    let temp = |value: u8| convert(Field::Temperature, f64::from(value), sorting, unit);
    let averages = raw.averages.map(|avg| {
        // Only cascade installations aggregate hot-water and inlet readings;
        // single-unit frames carry them unscaled.
        let cascade_temp = |value: u8| {
            if sorting.is_cascade() {
                temp(value)
            } else {
                f64::from(value)
            }
        };
        StateAverages {
            hot_water: cascade_temp(avg.hot_water),
            inlet: cascade_temp(avg.inlet),
            supply: f64::from(avg.supply),
            return_water: f64::from(avg.return_water),
            recirculation_setting: avg.recirculation_setting.map(f64::from),
            recirculation_current: avg.recirculation_current.map(f64::from),
        }
    });
    StateSnapshot {
        controller_version: raw.controller_version,
        panel_version: raw.panel_version,
        device_sorting: sorting,
        device_count: raw.device_count,
        channel: raw.current_channel,
        device_number: raw.device_number,
        error_code: raw.error_code,
        operation_device_number: raw.operation_device_number,
        average_calorimeter: raw.average_calorimeter,
        gas_instant_use: convert(
            Field::GasInstantUse,
            f64::from(raw.gas_instant_use),
            sorting,
            unit,
        ),
        gas_accumulated_use: convert(
            Field::GasAccumulatedUse,
            f64::from(raw.gas_accumulated_use),
            sorting,
            unit,
        ),
        hot_water_setting_temperature: temp(raw.hot_water_setting_temperature),
        hot_water_current_temperature: temp(raw.hot_water_current_temperature),
        hot_water_flow_rate: convert(
            Field::FlowRate,
            f64::from(raw.hot_water_flow_rate),
            sorting,
            unit,
        ),
        hot_water_temperature: temp(raw.hot_water_temperature),
        heat_setting_temperature: f64::from(raw.heat_setting_temperature),
        working_fluid_temperature: f64::from(raw.working_fluid_temperature),
        return_water_temperature: f64::from(raw.return_water_temperature),
        power: OnOffFlag::from_code(raw.power_status).is_on(),
        heat: OnOffFlag::from_code(raw.heat_status).is_on(),
        on_demand: OnDemand::from_code(raw.use_on_demand).unwrap_or(OnDemand::Unknown),
        weekly_control: OnOffFlag::from_code(raw.weekly_control).is_on(),
        day_schedules: raw.day_schedules.clone(),
        averages,
        captured_at: Utc::now(),
    }
}

/// Settable water-temperature bounds in caller units, converted with the
/// same factor the status fields use.
pub fn water_temperature_range(channel: &ChannelInfo) -> (f64, f64) {
    let convert_limit = |value: u8| {
        convert(
            Field::Temperature,
            f64::from(value),
            channel.device_sorting,
            channel.temperature_unit,
        )
    };
    (
        convert_limit(channel.min_water_temperature),
        convert_limit(channel.max_water_temperature),
    )
}

/// Inverse of the temperature factor: caller units back to the wire value a
/// control request carries.
pub fn water_temperature_to_wire(channel: &ChannelInfo, temperature: f64) -> u8 {
    let f = factor(
        Field::Temperature,
        channel.device_sorting,
        channel.temperature_unit,
    );
    (temperature / f).round() as u8
}

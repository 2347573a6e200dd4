mod common;

use navilink::{
    convert, convert_state, decode, factor, water_temperature_range, ChannelInfo, DeviceSorting,
    Field, Payload, TemperatureUnit,
};

use common::state_frame;

fn channel(unit: TemperatureUnit, sorting: DeviceSorting) -> ChannelInfo {
    ChannelInfo {
        channel: 1,
        device_sorting: sorting,
        device_count: 1,
        temperature_unit: unit,
        min_water_temperature: 60,
        max_water_temperature: 120,
        min_heating_water_temperature: 40,
        max_heating_water_temperature: 80,
        use_on_demand: true,
        heating_control: 1,
        wwsd: 0x0C,
        high_temperature: 0,
        use_warm_water: true,
        recirculation_temperature_range: None,
    }
}

#[test]
fn factors_are_deterministic_for_identical_inputs() {
    let fields = [
        Field::Temperature,
        Field::GasInstantUse,
        Field::GasAccumulatedUse,
        Field::FlowRate,
    ];
    let units = [
        TemperatureUnit::Celsius,
        TemperatureUnit::Fahrenheit,
        TemperatureUnit::Unknown,
    ];
    let models = [
        DeviceSorting::Npe,
        DeviceSorting::Nfc,
        DeviceSorting::Nhb,
        DeviceSorting::CasNvw,
    ];
    for field in fields {
        for unit in units {
            for model in models {
                assert_eq!(factor(field, model, unit), factor(field, model, unit));
                assert_eq!(
                    convert(field, 42.0, model, unit),
                    convert(field, 42.0, model, unit)
                );
            }
        }
    }
}

#[test]
fn double_conversion_is_visibly_different() {
    // Accidentally re-converting stored state must not be a no-op; this is
    // the property that catches a decoder re-normalizing cached snapshots.
    let cases = [
        (Field::Temperature, 97.0, DeviceSorting::Npe, TemperatureUnit::Celsius),
        (Field::FlowRate, 100.0, DeviceSorting::Npe, TemperatureUnit::Celsius),
        (Field::GasAccumulatedUse, 1000.0, DeviceSorting::Npe, TemperatureUnit::Celsius),
        (Field::GasInstantUse, 10.0, DeviceSorting::Nfc, TemperatureUnit::Fahrenheit),
    ];
    for (field, raw, model, unit) in cases {
        let once = convert(field, raw, model, unit);
        let twice = convert(field, once, model, unit);
        assert_ne!(once, twice, "{field:?} must not be idempotent");
    }
}

#[test]
fn decoded_celsius_setting_temperature_is_half_the_raw_byte() {
    // Full wire path: a state frame whose setting-temperature byte is 97
    // converts to 48.5 on a Celsius channel.
    let frame = state_frame(1, 1, 1, 850);
    let message = decode(&frame).expect("state frame decodes");
    let Payload::State(raw) = message.payload else {
        panic!("expected state payload");
    };
    assert_eq!(raw.hot_water_setting_temperature, 97);

    let snapshot = convert_state(&raw, &channel(TemperatureUnit::Celsius, DeviceSorting::Npe));
    assert_eq!(snapshot.hot_water_setting_temperature, 97.0 / 2.0);

    // The same frame against a Fahrenheit channel reports the raw degrees.
    let snapshot = convert_state(&raw, &channel(TemperatureUnit::Fahrenheit, DeviceSorting::Npe));
    assert_eq!(snapshot.hot_water_setting_temperature, 97.0);
}

#[test]
fn model_dependent_gas_factors() {
    for model in [
        DeviceSorting::Nfc,
        DeviceSorting::NcbH,
        DeviceSorting::Nfb,
        DeviceSorting::Nvw,
    ] {
        assert_eq!(factor(Field::GasInstantUse, model, TemperatureUnit::Celsius), 10.0);
        assert_eq!(
            factor(Field::GasInstantUse, model, TemperatureUnit::Fahrenheit),
            10.0 * 3.968
        );
    }
    for model in [DeviceSorting::Npe, DeviceSorting::Ncb, DeviceSorting::CasNpn] {
        assert_eq!(factor(Field::GasInstantUse, model, TemperatureUnit::Celsius), 1.0);
        assert_eq!(factor(Field::GasInstantUse, model, TemperatureUnit::Fahrenheit), 3.968);
    }
}

#[test]
fn flow_rate_gallons_conversion_single_step() {
    // 189.25 raw tenths-of-liters equals five gallons per minute.
    assert_eq!(
        convert(Field::FlowRate, 189.25, DeviceSorting::Npe, TemperatureUnit::Fahrenheit),
        5.0
    );
    assert_eq!(
        convert(Field::FlowRate, 85.0, DeviceSorting::Npe, TemperatureUnit::Celsius),
        8.5
    );
}

#[test]
fn settable_range_uses_the_same_temperature_factor() {
    let celsius = channel(TemperatureUnit::Celsius, DeviceSorting::Npe);
    assert_eq!(water_temperature_range(&celsius), (30.0, 60.0));
    let fahrenheit = channel(TemperatureUnit::Fahrenheit, DeviceSorting::Npe);
    assert_eq!(water_temperature_range(&fahrenheit), (60.0, 120.0));
}

#[test]
fn heating_only_models_skip_hot_water_scaling() {
    let frame = state_frame(1, 1, 1, 850);
    let Payload::State(mut raw) = decode(&frame).unwrap().payload else {
        panic!("expected state payload");
    };
    raw.device_sorting = DeviceSorting::Nhb;
    let snapshot = convert_state(&raw, &channel(TemperatureUnit::Celsius, DeviceSorting::Nhb));
    assert_eq!(snapshot.hot_water_setting_temperature, 97.0);
    assert_eq!(snapshot.hot_water_flow_rate, 850.0);
    // Gas accumulation scaling applies to every model.
    assert_eq!(snapshot.gas_accumulated_use, 0.0);
}

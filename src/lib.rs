mod cloud;
mod codec;
mod convert;
mod envelope;
mod error;
mod logger;
mod rest;
mod schedule;
mod state;
mod tcp;
mod types;

pub use cloud::{NavilinkCloud, NavilinkCloudBuilder, BROKER_HOST, BROKER_PORT};
pub use codec::{
    decode, decode_control_request, encode_control_request, ControlCommand, ControlRequest,
    Message, Payload, COMMON_HEADER_LEN, CONTROL_REQUEST_LEN,
};
pub use convert::{
    convert, convert_state, factor, water_temperature_range, water_temperature_to_wire, Field,
};
pub use envelope::{
    envelope, parse_response, CloudResponse, RequestKind, ResponseBody, TopicSet,
    DISCONNECT_NOTICE_TOPIC, PROTOCOL_VERSION,
};
pub use error::{Error, Result};
pub use logger::MessageLogMode;
pub use rest::{
    BrokerCredentials, DeviceRecord, GatewayRecord, RestClient, SignIn, CLOUD_SERVER,
    LEGACY_SERVER,
};
pub use schedule::{apply, ScheduleAction, ScheduleEdit, MAX_ENTRIES_PER_DAY};
pub use state::StateModel;
pub use tcp::{NavilinkTcp, NavilinkTcpBuilder, RELAY_PORT, RELAY_SERVER};
pub use types::*;

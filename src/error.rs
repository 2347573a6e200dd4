use std::fmt;

#[derive(Debug)]
pub enum Error {
    Http(reqwest::Error),
    Io(std::io::Error),
    Mqtt(rumqttc::ClientError),
    NotConnected,
    /// Bad credentials or unknown account. Fatal for startup: never retried.
    Auth(String),
    /// The sign-in response carried no temporary broker credentials. Fatal.
    MissingBrokerCredentials,
    InvalidGatewayId(String),
    InvalidChannel(u8),
    InvalidDevice(u8),
    InvalidSchedule(String),
    InvalidTemperature { requested: f64, min: f64, max: f64 },
    Unsupported(&'static str),
    Protocol(String),
    Timeout,
}

impl Error {
    /// Errors that abort startup instead of being retried by the supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::MissingBrokerCredentials)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
            Error::Mqtt(e) => write!(f, "MQTT error: {e}"),
            Error::NotConnected => write!(f, "not connected"),
            Error::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Error::MissingBrokerCredentials => {
                write!(f, "sign-in response carried no broker credentials")
            }
            Error::InvalidGatewayId(id) => write!(f, "invalid gateway id: {id}"),
            Error::InvalidChannel(ch) => write!(f, "invalid channel: {ch}"),
            Error::InvalidDevice(dev) => write!(f, "invalid device number: {dev}"),
            Error::InvalidSchedule(msg) => write!(f, "invalid schedule edit: {msg}"),
            Error::InvalidTemperature { requested, min, max } => {
                write!(f, "temperature {requested} outside settable range {min}..{max}")
            }
            Error::Unsupported(what) => write!(f, "unsupported on this channel: {what}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Timeout => write!(f, "timed out waiting for response"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Mqtt(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<rumqttc::ClientError> for Error {
    fn from(e: rumqttc::ClientError) -> Self {
        Error::Mqtt(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

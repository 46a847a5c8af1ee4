//! An error from the Stevedore clients

/// An error from the Stevedore clients
#[derive(Debug)]
pub enum Error {
    /// A generic error with a message
    Generic(String),
    /// An error from sending or recieving a request
    Reqwest(reqwest::Error),
    /// An IO Error
    IO(std::io::Error),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from converting a type to a Uuid
    Uuid(uuid::Error),
    /// An error from parsing an IP CIDR
    CidrParse(cidr::errors::NetworkParseError),
    /// An error from parsing an IP address
    AddrParse(std::net::AddrParseError),
    /// An error from parsing a URL
    UrlParse(url::ParseError),
    /// An error from joining a tokio task
    JoinError(tokio::task::JoinError),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Get the error message for this error if one exists
    pub fn msg(&self) -> Option<String> {
        // get the msg from any error types that support it
        match self {
            Error::Generic(msg) => Some(msg.clone()),
            Error::Reqwest(err) => Some(err.to_string()),
            Error::IO(err) => Some(err.to_string()),
            Error::Config(err) => Some(err.to_string()),
            Error::Serde(err) => Some(err.to_string()),
            Error::Uuid(err) => Some(err.to_string()),
            Error::CidrParse(err) => Some(err.to_string()),
            Error::AddrParse(err) => Some(err.to_string()),
            Error::UrlParse(err) => Some(err.to_string()),
            Error::JoinError(err) => Some(err.to_string()),
        }
    }

    /// get the kind of error as a str
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Generic(_) => "Generic",
            Error::Reqwest(_) => "Reqwest",
            Error::IO(_) => "IO",
            Error::Config(_) => "Config",
            Error::Serde(_) => "Serde",
            Error::Uuid(_) => "Uuid",
            Error::CidrParse(_) => "CidrParse",
            Error::AddrParse(_) => "AddrParse",
            Error::UrlParse(_) => "UrlParse",
            Error::JoinError(_) => "JoinError",
        }
    }
}

impl std::fmt::Display for Error {
    /// display this error in a easy readble format
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.msg() {
            Some(msg) => write!(f, "Error: {}", msg),
            None => write!(f, "Kind: {}", self.kind()),
        }
    }
}

// mark that this is an error struct
impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Reqwest(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<uuid::Error> for Error {
    fn from(error: uuid::Error) -> Self {
        Error::Uuid(error)
    }
}

impl From<cidr::errors::NetworkParseError> for Error {
    fn from(error: cidr::errors::NetworkParseError) -> Self {
        Error::CidrParse(error)
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(error: std::net::AddrParseError) -> Self {
        Error::AddrParse(error)
    }
}

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Error::UrlParse(error)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::JoinError(error)
    }
}

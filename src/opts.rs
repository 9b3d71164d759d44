//! Connection options.

use std::time::Duration;

use url::Url;

use crate::error::Error;

/// SSL connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Don't use SSL
    Disable,
    /// Try SSL, fall back to unencrypted if not supported
    #[default]
    Prefer,
    /// Require SSL connection
    Require,
}

impl SslMode {
    fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "disable" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            _ => Err(Error::InvalidUsage(format!(
                "Invalid sslmode: expected one of ['disable', 'prefer', 'require'], got {}",
                value
            ))),
        }
    }
}

/// Which sessions are acceptable once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetSessionAttrs {
    /// Any session
    #[default]
    Any,
    /// Only a session that accepts writes (`transaction_read_only = off`)
    ReadWrite,
}

impl TargetSessionAttrs {
    fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "any" => Ok(TargetSessionAttrs::Any),
            "read-write" => Ok(TargetSessionAttrs::ReadWrite),
            _ => Err(Error::InvalidUsage(format!(
                "Invalid target_session_attrs: expected 'any' or 'read-write', got {}",
                value
            ))),
        }
    }
}

/// Connection options for PostgreSQL.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Hostname or IP address.
    ///
    /// Default: `""`
    pub host: String,

    /// Port number for the PostgreSQL server.
    ///
    /// Default: `5432`
    pub port: u16,

    /// Unix socket directory. When set, the client connects to
    /// `{socket}/.s.PGSQL.{port}` instead of `host`.
    ///
    /// Default: `None`
    pub socket: Option<String>,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Database name to use.
    ///
    /// Default: `None` (the server uses the user name)
    pub database: Option<String>,

    /// Application name to report to the server.
    ///
    /// Default: `None`
    pub application_name: Option<String>,

    /// SSL connection mode.
    ///
    /// Default: `SslMode::Prefer`
    pub ssl_mode: SslMode,

    /// Limit on establishing the TCP / Unix connection.
    ///
    /// Default: `None` (OS default)
    pub connect_timeout: Option<Duration>,

    /// Read/write timeout on the socket once connected.
    ///
    /// Default: `None` (block indefinitely)
    pub socket_timeout: Option<Duration>,

    /// Required session properties.
    ///
    /// Default: `TargetSessionAttrs::Any`
    pub target_session_attrs: TargetSessionAttrs,

    /// Additional startup parameters, e.g. `("search_path", "app")`.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            socket: None,
            user: String::new(),
            password: None,
            database: None,
            application_name: None,
            ssl_mode: SslMode::Prefer,
            connect_timeout: None,
            socket_timeout: None,
            target_session_attrs: TargetSessionAttrs::Any,
            params: Vec::new(),
        }
    }
}

impl Opts {
    /// Build options from `key = value` pairs.
    ///
    /// Recognized keys: `host`, `port`, `user`, `password`, `dbname`,
    /// `application_name`, `sslmode`, `connect_timeout` (seconds),
    /// `target_session_attrs`. A `host` starting with `/` is a Unix socket
    /// directory. Unknown keys are sent as startup parameters.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut opts = Opts::default();
        for (key, value) in pairs {
            opts.set(key.as_ref(), value.as_ref())?;
        }
        Ok(opts)
    }

    /// Apply one `key = value` option.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        match key {
            "host" => {
                if value.starts_with('/') {
                    self.socket = Some(value.to_string());
                } else {
                    self.host = value.to_string();
                }
            }
            "port" => {
                self.port = value
                    .parse()
                    .map_err(|_| Error::InvalidUsage(format!("Invalid port: {}", value)))?;
            }
            "user" => self.user = value.to_string(),
            "password" => self.password = Some(value.to_string()),
            "dbname" => self.database = Some(value.to_string()),
            "application_name" => self.application_name = Some(value.to_string()),
            "sslmode" => self.ssl_mode = SslMode::parse(value)?,
            "connect_timeout" => {
                let seconds: u64 = value.parse().map_err(|_| {
                    Error::InvalidUsage(format!("Invalid connect_timeout: {}", value))
                })?;
                // Zero means wait indefinitely.
                self.connect_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
            }
            "target_session_attrs" => {
                self.target_session_attrs = TargetSessionAttrs::parse(value)?;
            }
            _ => self.params.push((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    /// Parse a `key=value key='quoted value'` connection string.
    pub fn parse_key_value(s: &str) -> Result<Self, Error> {
        Self::from_pairs(split_key_value(s)?)
    }

    /// Path of the Unix socket file, if connecting over one.
    pub fn socket_path(&self) -> Option<String> {
        self.socket
            .as_ref()
            .map(|dir| format!("{}/.s.PGSQL.{}", dir.trim_end_matches('/'), self.port))
    }
}

fn split_key_value(s: &str) -> Result<Vec<(String, String)>, Error> {
    let mut pairs = Vec::new();
    let mut chars = s.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            return Ok(pairs);
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return Err(Error::InvalidUsage(format!(
                "missing \"=\" after {:?} in connection string",
                key
            )));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\'') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => break,
                    },
                    Some(c) => value.push(c),
                    None => {
                        return Err(Error::InvalidUsage(
                            "unterminated quoted string in connection string".into(),
                        ));
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                } else {
                    value.push(c);
                }
            }
        }
        pairs.push((key, value));
    }
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse a PostgreSQL connection URL.
    ///
    /// Format: `postgres://[user[:password]@]host[:port][/database][?key=value&..]`
    ///
    /// Query parameters are the keys accepted by [`Opts::from_pairs`].
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        if !["postgres", "postgresql"].contains(&url.scheme()) {
            return Err(Error::InvalidUsage(format!(
                "Invalid scheme: expected 'postgres://' or 'postgresql://', got '{}://'",
                url.scheme()
            )));
        }

        let mut opts = Opts {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(5432),
            user: url.username().to_string(),
            password: url.password().map(|s| s.to_string()),
            database: url.path().strip_prefix('/').and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            }),
            ..Opts::default()
        };

        for (key, value) in url.query_pairs() {
            opts.set(&key, &value)?;
        }

        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    /// Parse a URL (`postgres://…`) or a `key=value` connection string.
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.starts_with("postgres://") || s.starts_with("postgresql://") {
            let url =
                Url::parse(s).map_err(|e| Error::InvalidUsage(format!("Invalid URL: {}", e)))?;
            Self::try_from(&url)
        } else {
            Self::parse_key_value(s)
        }
    }
}

impl TryFrom<&String> for Opts {
    type Error = Error;

    fn try_from(s: &String) -> Result<Self, Self::Error> {
        Self::try_from(s.as_str())
    }
}

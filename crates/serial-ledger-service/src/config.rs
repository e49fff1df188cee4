use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use http::HeaderValue;
use serial_ledger_core::{LedgerError, DEFAULT_FORWARDED_HEADERS, DEFAULT_MAX_REQUESTS_PER_WINDOW};

#[derive(Debug, Parser)]
#[command(name = "serial-ledger-service")]
#[command(about = "HTTP endpoint that logs banknote serial lookups")]
pub struct Args {
    #[arg(long, env = "SERIAL_LEDGER_DB_PATH", default_value = "./serial_ledger.sqlite3")]
    pub db: PathBuf,
    #[arg(long, env = "SERIAL_LEDGER_BIND", default_value = "127.0.0.1:4020")]
    pub bind: SocketAddr,
    #[arg(long, env = "SERIAL_LEDGER_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    pub operation_timeout_ms: u64,
    #[arg(long, env = "SERIAL_LEDGER_MAX_REQUESTS_PER_HOUR", default_value_t = DEFAULT_MAX_REQUESTS_PER_WINDOW)]
    pub max_requests_per_hour: u32,
    #[arg(long, env = "SERIAL_LEDGER_SERVER_NAME", default_value = "api.serial-ledger.local")]
    pub server_name: String,
    /// Origin allowed to call the endpoint from a browser. Repeat for more;
    /// none means any origin.
    #[arg(long = "allowed-origin", env = "SERIAL_LEDGER_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,
    /// Serve database diagnostics on `GET /?debug`.
    #[arg(long, env = "SERIAL_LEDGER_ENABLE_DEBUG")]
    pub enable_debug: bool,
    /// Forwarding headers consulted for the client address, in order.
    #[arg(
        long = "forwarded-header",
        env = "SERIAL_LEDGER_FORWARDED_HEADERS",
        value_delimiter = ',',
        default_values = DEFAULT_FORWARDED_HEADERS
    )]
    pub forwarded_headers: Vec<String>,
}

/// Validated runtime settings shared by every request.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub bind: SocketAddr,
    pub operation_timeout: Duration,
    pub max_requests_per_hour: u32,
    pub server_name: String,
    pub allowed_origins: Vec<HeaderValue>,
    pub enable_debug: bool,
    pub forwarded_headers: Vec<String>,
}

#[cfg(test)]
impl ServiceConfig {
    pub fn with_db_path(db_path: PathBuf) -> Self {
        Self {
            db_path,
            bind: SocketAddr::from(([127, 0, 0, 1], 4020)),
            operation_timeout: Duration::from_millis(2500),
            max_requests_per_hour: DEFAULT_MAX_REQUESTS_PER_WINDOW,
            server_name: "api.serial-ledger.local".to_string(),
            allowed_origins: Vec::new(),
            enable_debug: false,
            forwarded_headers: DEFAULT_FORWARDED_HEADERS.map(String::from).to_vec(),
        }
    }
}

impl TryFrom<Args> for ServiceConfig {
    type Error = LedgerError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if args.operation_timeout_ms == 0 {
            return Err(LedgerError::Configuration(
                "operation timeout must be at least 1 ms".to_string(),
            ));
        }
        if args.max_requests_per_hour == 0 {
            return Err(LedgerError::Configuration(
                "max requests per hour must be at least 1".to_string(),
            ));
        }
        if args.server_name.trim().is_empty() {
            return Err(LedgerError::Configuration(
                "server name cannot be empty".to_string(),
            ));
        }

        let allowed_origins = args
            .allowed_origins
            .iter()
            .map(|origin| origin.trim())
            .filter(|origin| !origin.is_empty())
            .map(|origin| {
                HeaderValue::from_str(origin).map_err(|err| {
                    LedgerError::Configuration(format!("invalid allowed origin {origin:?}: {err}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let forwarded_headers: Vec<String> = args
            .forwarded_headers
            .iter()
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        if let Some(bad) = forwarded_headers
            .iter()
            .find(|name| http::HeaderName::from_bytes(name.as_bytes()).is_err())
        {
            return Err(LedgerError::Configuration(format!(
                "invalid forwarded header name {bad:?}"
            )));
        }

        Ok(Self {
            db_path: args.db,
            bind: args.bind,
            operation_timeout: Duration::from_millis(args.operation_timeout_ms),
            max_requests_per_hour: args.max_requests_per_hour,
            server_name: args.server_name,
            allowed_origins,
            enable_debug: args.enable_debug,
            forwarded_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        match Args::try_parse_from(std::iter::once("serial-ledger-service").chain(argv.iter().copied())) {
            Ok(args) => args,
            Err(err) => panic!("failed to parse args {argv:?}: {err}"),
        }
    }

    #[test]
    fn defaults_validate() {
        let config = match ServiceConfig::try_from(parse(&[])) {
            Ok(config) => config,
            Err(err) => panic!("defaults must validate: {err}"),
        };
        assert_eq!(config.max_requests_per_hour, 100);
        assert_eq!(config.operation_timeout, Duration::from_millis(2500));
        assert_eq!(config.forwarded_headers, vec!["client-ip", "x-forwarded-for"]);
        assert!(config.allowed_origins.is_empty());
        assert!(!config.enable_debug);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let timeout = ServiceConfig::try_from(parse(&["--operation-timeout-ms", "0"]));
        assert!(matches!(timeout, Err(LedgerError::Configuration(_))));

        let budget = ServiceConfig::try_from(parse(&["--max-requests-per-hour", "0"]));
        assert!(matches!(budget, Err(LedgerError::Configuration(_))));
    }

    #[test]
    fn forwarded_headers_are_lowercased_in_order() {
        let config = match ServiceConfig::try_from(parse(&[
            "--forwarded-header",
            "X-Real-IP",
            "--forwarded-header",
            "X-Forwarded-For",
        ])) {
            Ok(config) => config,
            Err(err) => panic!("valid headers must be accepted: {err}"),
        };
        assert_eq!(config.forwarded_headers, vec!["x-real-ip", "x-forwarded-for"]);

        let bad = ServiceConfig::try_from(parse(&["--forwarded-header", "bad header"]));
        assert!(matches!(bad, Err(LedgerError::Configuration(_))));
    }

    #[test]
    fn allowed_origins_are_collected() {
        let config = match ServiceConfig::try_from(parse(&[
            "--allowed-origin",
            "https://example.org,https://example.net",
        ])) {
            Ok(config) => config,
            Err(err) => panic!("valid origins must be accepted: {err}"),
        };
        assert_eq!(config.allowed_origins.len(), 2);
    }
}

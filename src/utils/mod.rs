/// Utility functions and helpers
use crate::config::ConfigError;
use crate::core::HostAddress;
use std::time::Duration;

/// Port used when a host list entry carries none
pub const DEFAULT_PORT: u16 = 3306;

/// Parse a driver-style host list such as `db1:3306,db2,db3:3307`.
///
/// Entries get no declared role; [`crate::core::Topology::new`] assigns one
/// according to the HA mode.
pub fn parse_host_list(list: &str) -> Result<Vec<HostAddress>, ConfigError> {
    let mut hosts = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (host, port) = match entry.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::ParseError(format!("Invalid port in host entry: {}", entry)))?;
                (host, port)
            }
            None => (entry, DEFAULT_PORT),
        };
        if host.is_empty() || port == 0 {
            return Err(ConfigError::ParseError(format!("Invalid host entry: {}", entry)));
        }
        hosts.push(HostAddress::new(host, port, Default::default()));
    }

    if hosts.is_empty() {
        return Err(ConfigError::ParseError("host list is empty".to_string()));
    }
    Ok(hosts)
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", millis)
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HostRole;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h1m1s");
    }

    #[test]
    fn test_parse_host_list() {
        let hosts = parse_host_list("db1:3307, db2 ,db3:3308").unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0], HostAddress::primary("db1", 3307));
        assert_eq!(hosts[1].port, DEFAULT_PORT);
        assert_eq!(hosts[2].to_string(), "db3:3308");
        assert!(hosts.iter().all(|h| h.role == HostRole::Unset));
    }

    #[test]
    fn test_parse_host_list_errors() {
        assert!(parse_host_list("").is_err());
        assert!(parse_host_list(" , ").is_err());
        assert!(parse_host_list("db1:notaport").is_err());
        assert!(parse_host_list("db1:0").is_err());
        assert!(parse_host_list(":3306").is_err());
    }
}

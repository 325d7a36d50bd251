use chrono::{DateTime, Utc};

// Collectors expect timestamps in units of 100 microseconds
const TIMESTAMP_DIVISOR: i64 = 100_000;

/// Current time in the unit used by `heartbeat.post` and `host_info.get` payloads
pub fn timestamp() -> i64 {
    timestamp_at(Utc::now())
}

pub fn timestamp_at(datetime: DateTime<Utc>) -> i64 {
    datetime.timestamp_nanos_opt().unwrap_or_default() / TIMESTAMP_DIVISOR
}

/// Strip the root label DNS hands back on SRV targets ("host.example.com." -> "host.example.com")
pub fn host_name(target: &str) -> &str {
    target.trim_end_matches('.')
}

/// Parse a `datacenter=query` pair
pub fn parse_query(pair: &str) -> Result<(String, String), String> {
    match pair.split_once('=') {
        Some((datacenter, query)) if !datacenter.trim().is_empty() && !query.trim().is_empty() => {
            Ok((datacenter.trim().to_string(), query.trim().to_string()))
        }
        _ => Err(format!(
            "Invalid query format: {}. Use format like 'dfw=_monitoringagent._tcp.example.com'",
            pair
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_unit() {
        let datetime = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(timestamp_at(datetime), 17_000_000_000_000);
    }

    #[test]
    fn test_timestamp_is_current() {
        let before = timestamp_at(Utc::now());
        let now = timestamp();
        assert!(now >= before);
    }

    #[test]
    fn test_host_name_strips_root() {
        assert_eq!(host_name("collector.example.com."), "collector.example.com");
        assert_eq!(host_name("collector.example.com"), "collector.example.com");
    }

    #[test]
    fn test_parse_query() {
        assert_eq!(
            parse_query("dfw=_monitoringagent._tcp.dfw1.example.com").unwrap(),
            ("dfw".to_string(), "_monitoringagent._tcp.dfw1.example.com".to_string())
        );
        assert_eq!(parse_query(" ord = srv ").unwrap(), ("ord".to_string(), "srv".to_string()));
    }

    #[test]
    fn test_parse_query_invalid() {
        assert!(parse_query("dfw").is_err());
        assert!(parse_query("=srv").is_err());
        assert!(parse_query("dfw=").is_err());
    }
}

//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"`, or `"draining"` once shutdown has begun.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered WebSocket connections.
    pub connections: usize,
    /// Distinct users with at least one connection.
    pub users: usize,
    /// Whether a fanout broker is attached.
    pub fanout: bool,
    /// This process's fanout instance id.
    pub instance_id: String,
}

/// Live values the health body is built from.
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs<'a> {
    /// Process start.
    pub start_time: Instant,
    /// Registered connections.
    pub connections: usize,
    /// Users with a local connection.
    pub users: usize,
    /// Whether a broker is attached.
    pub fanout: bool,
    /// Fanout instance id.
    pub instance_id: &'a str,
    /// Shutdown has begun.
    pub draining: bool,
}

/// Build a health response from live counters.
pub fn health_check(inputs: HealthInputs<'_>) -> HealthResponse {
    HealthResponse {
        status: if inputs.draining { "draining" } else { "ok" }.into(),
        uptime_secs: inputs.start_time.elapsed().as_secs(),
        connections: inputs.connections,
        users: inputs.users,
        fanout: inputs.fanout,
        instance_id: inputs.instance_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn inputs(start_time: Instant) -> HealthInputs<'static> {
        HealthInputs {
            start_time,
            connections: 3,
            users: 2,
            fanout: true,
            instance_id: "1-2-abc",
            draining: false,
        }
    }

    #[test]
    fn status_ok_with_counts() {
        let resp = health_check(inputs(Instant::now()));
        assert_eq!(resp.status, "ok");
        assert_eq!((resp.connections, resp.users), (3, 2));
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now().checked_sub(Duration::from_secs(60)).unwrap();
        assert!(health_check(inputs(start)).uptime_secs >= 59);
    }

    #[test]
    fn draining_status() {
        let resp = health_check(HealthInputs {
            draining: true,
            ..inputs(Instant::now())
        });
        assert_eq!(resp.status, "draining");
    }

    #[test]
    fn camel_case_body() {
        let value = serde_json::to_value(health_check(inputs(Instant::now()))).unwrap();
        assert_eq!(value["instanceId"], "1-2-abc");
        assert!(value["uptimeSecs"].is_u64());
    }
}

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Mutex,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Process-wide counters rendered as Prometheus text on `GET /metrics`.
///
/// One instance is built at startup and shared by reference with every
/// component that reports into it.
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_messages_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    admission_rejections_total: Mutex<HashMap<String, u64>>,
    degraded_decisions_total: Mutex<HashMap<String, u64>>,
    persistence_success_total: AtomicU64,
    persistence_failure_total: AtomicU64,
    active_sessions: AtomicI64,
    active_connections: AtomicI64,
}

const ADMISSION_REASONS: [&str; 4] = ["auth", "capacity", "rate", "storage"];
const DEGRADED_OUTCOMES: [&str; 2] = ["allowed", "denied"];

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_messages_total: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            admission_rejections_total: Mutex::new(zeroed(&ADMISSION_REASONS)),
            degraded_decisions_total: Mutex::new(zeroed(&DEGRADED_OUTCOMES)),
            persistence_success_total: AtomicU64::new(0),
            persistence_failure_total: AtomicU64::new(0),
            active_sessions: AtomicI64::new(0),
            active_connections: AtomicI64::new(0),
        }
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_message(&self, kind: &str, is_error: bool) {
        let label = normalize_label(kind);
        increment_label_counter(&self.ws_messages_total, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn record_admission_rejection(&self, reason: &str) {
        increment_label_counter(&self.admission_rejections_total, &normalize_label(reason), 1);
    }

    pub fn record_degraded_decision(&self, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        increment_label_counter(&self.degraded_decisions_total, outcome, 1);
    }

    pub fn record_persist(&self, success: bool) {
        let counter = if success {
            &self.persistence_success_total
        } else {
            &self.persistence_failure_total
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failure_total.load(Ordering::SeqCst)
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_messages_total Total inbound websocket messages by type.\n");
        output.push_str("# TYPE relay_ws_messages_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_messages_total",
            "type",
            &self.ws_messages_total,
        );

        output.push_str(
            "# HELP relay_ws_errors_total Total rejected inbound websocket messages by type.\n",
        );
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_errors_total", "type", &self.ws_errors_total);

        output.push_str(
            "# HELP relay_admission_rejections_total Connections and messages refused by reason.\n",
        );
        output.push_str("# TYPE relay_admission_rejections_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_admission_rejections_total",
            "reason",
            &self.admission_rejections_total,
        );

        output.push_str("# HELP relay_counter_store_degraded_total Admission decisions made without the counter store.\n");
        output.push_str("# TYPE relay_counter_store_degraded_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_counter_store_degraded_total",
            "outcome",
            &self.degraded_decisions_total,
        );

        output.push_str("# HELP relay_persist_total Diagram state flushes by result.\n");
        output.push_str("# TYPE relay_persist_total counter\n");
        output.push_str(&format!(
            "relay_persist_total{{result=\"success\"}} {}\n",
            self.persistence_success_total.load(Ordering::SeqCst)
        ));
        output.push_str(&format!(
            "relay_persist_total{{result=\"failure\"}} {}\n",
            self.persistence_failure_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_active_sessions Diagram sessions held in memory.\n");
        output.push_str("# TYPE relay_active_sessions gauge\n");
        output.push_str(&format!("relay_active_sessions {}\n", self.active_sessions().max(0)));

        output.push_str("# HELP relay_active_connections Live collaboration sockets.\n");
        output.push_str("# TYPE relay_active_connections gauge\n");
        output.push_str(&format!("relay_active_connections {}\n", self.active_connections().max(0)));

        output
    }
}

fn zeroed(labels: &[&str]) -> HashMap<String, u64> {
    labels.iter().map(|label| (label.to_string(), 0)).collect()
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::RelayMetrics;

    #[test]
    fn render_prometheus_includes_collaboration_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request("GET", "/v1/diagrams/00000000-0000-0000-0000-000000000001/ws", 101, 3);
        metrics.record_http_request("GET", "/healthz", 500, 25);
        metrics.record_ws_message("update", false);
        metrics.record_ws_message("update", true);
        metrics.record_ws_message("cursor", false);
        metrics.record_admission_rejection("capacity");
        metrics.record_degraded_decision(true);
        metrics.record_persist(true);
        metrics.record_persist(false);
        metrics.record_persist(false);
        metrics.session_opened();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("endpoint=\"/v1/diagrams/{uuid}/ws\""));
        assert!(rendered.contains("relay_request_errors_total{method=\"GET\",endpoint=\"/healthz\"} 1"));
        assert!(rendered.contains("relay_ws_messages_total{type=\"update\"} 2"));
        assert!(rendered.contains("relay_ws_messages_total{type=\"cursor\"} 1"));
        assert!(rendered.contains("relay_ws_errors_total{type=\"update\"} 1"));
        assert!(rendered.contains("relay_admission_rejections_total{reason=\"capacity\"} 1"));
        assert!(rendered.contains("relay_admission_rejections_total{reason=\"rate\"} 0"));
        assert!(rendered.contains("relay_counter_store_degraded_total{outcome=\"allowed\"} 1"));
        assert!(rendered.contains("relay_counter_store_degraded_total{outcome=\"denied\"} 0"));
        assert!(rendered.contains("relay_persist_total{result=\"success\"} 1"));
        assert!(rendered.contains("relay_persist_total{result=\"failure\"} 2"));
        assert!(rendered.contains("relay_active_sessions 1"));
        assert!(rendered.contains("relay_active_connections 1"));
    }

    #[test]
    fn gauges_never_render_negative() {
        let metrics = RelayMetrics::default();
        metrics.session_closed();
        assert!(metrics.render_prometheus().contains("relay_active_sessions 0"));
    }
}

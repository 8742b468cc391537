use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Default Prometheus latency buckets.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Time-to-first-token buckets; TTFT distributions are coarser than
/// request latency.
const TTFT_BUCKETS: &[f64] = &[0.1, 0.2, 0.5, 1.0, 2.0, 5.0];

/// Bound on distinct label combinations per metric, so a key-spraying
/// client cannot grow the registry without limit.
const MAX_SERIES: usize = 1024;

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct RequestKey {
    method: String,
    status: u16,
    tenant_id: String,
    model: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    tenant_id: String,
    model: String,
}

#[derive(Clone, Debug)]
struct Histogram {
    buckets: &'static [f64],
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(buckets: &'static [f64]) -> Self {
        Self {
            buckets,
            counts: vec![0; buckets.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count = self.count.saturating_add(1);
        for (idx, bound) in self.buckets.iter().enumerate() {
            if value <= *bound {
                self.counts[idx] = self.counts[idx].saturating_add(1);
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    requests_total: HashMap<RequestKey, u64>,
    request_duration_seconds: HashMap<SeriesKey, Histogram>,
    token_usage_total: HashMap<(SeriesKey, &'static str), u64>,
    ttft_seconds: HashMap<SeriesKey, Histogram>,
}

/// Request/latency/token metrics with Prometheus text exposition.
///
/// The registry is a plain mutexed map; every record is a short critical
/// section, which lets the body-close observer run from a `Drop` impl.
#[derive(Default)]
pub struct GatewayMetrics {
    inner: Mutex<Inner>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(
        &self,
        method: &str,
        status: u16,
        tenant_id: &str,
        model: &str,
        duration: Duration,
    ) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        bump_limited(
            &mut inner.requests_total,
            RequestKey {
                method: method.to_string(),
                status,
                tenant_id: tenant_id.to_string(),
                model: model.to_string(),
            },
            1,
        );
        observe_limited(
            &mut inner.request_duration_seconds,
            SeriesKey {
                tenant_id: tenant_id.to_string(),
                model: model.to_string(),
            },
            DURATION_BUCKETS,
            duration.as_secs_f64(),
        );
    }

    /// Side channel for the proxy engine, split by token kind.
    pub fn record_tokens(&self, tenant_id: &str, model: &str, input: u64, output: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        for (kind, amount) in [("input", input), ("output", output)] {
            let key = SeriesKey {
                tenant_id: tenant_id.to_string(),
                model: model.to_string(),
            };
            bump_limited(&mut inner.token_usage_total, (key, kind), amount);
        }
    }

    /// Side channel for the proxy engine: wall time from request intake
    /// to the first forwarded line.
    pub fn record_ttft(&self, tenant_id: &str, model: &str, seconds: f64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        observe_limited(
            &mut inner.ttft_seconds,
            SeriesKey {
                tenant_id: tenant_id.to_string(),
                model: model.to_string(),
            },
            TTFT_BUCKETS,
            seconds,
        );
    }

    pub fn render(&self) -> String {
        let Ok(inner) = self.inner.lock() else {
            return String::new();
        };
        let mut out = String::new();

        out.push_str("# HELP http_requests_total Total number of HTTP requests.\n");
        out.push_str("# TYPE http_requests_total counter\n");
        let mut requests: Vec<(&RequestKey, &u64)> = inner.requests_total.iter().collect();
        requests.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (key, value) in requests {
            out.push_str(&format!(
                "http_requests_total{{method=\"{}\",status=\"{}\",tenant_id=\"{}\",model=\"{}\"}} {value}\n",
                escape_label_value(&key.method),
                key.status,
                escape_label_value(&key.tenant_id),
                escape_label_value(&key.model),
            ));
        }

        write_histogram_map(
            &mut out,
            "http_request_duration_seconds",
            "HTTP request latency in seconds, observed at response body close.",
            &inner.request_duration_seconds,
        );

        out.push_str("# HELP llm_token_usage_total Total number of LLM tokens processed.\n");
        out.push_str("# TYPE llm_token_usage_total counter\n");
        let mut tokens: Vec<(&(SeriesKey, &'static str), &u64)> =
            inner.token_usage_total.iter().collect();
        tokens.sort_by(|(a, _), (b, _)| a.cmp(b));
        for ((key, kind), value) in tokens {
            out.push_str(&format!(
                "llm_token_usage_total{{tenant_id=\"{}\",model=\"{}\",type=\"{kind}\"}} {value}\n",
                escape_label_value(&key.tenant_id),
                escape_label_value(&key.model),
            ));
        }

        write_histogram_map(
            &mut out,
            "llm_ttft_seconds",
            "Time to first token in seconds.",
            &inner.ttft_seconds,
        );

        out
    }
}

fn bump_limited<K: Eq + std::hash::Hash>(map: &mut HashMap<K, u64>, key: K, amount: u64) {
    if map.len() >= MAX_SERIES && !map.contains_key(&key) {
        return;
    }
    *map.entry(key).or_insert(0) += amount;
}

fn observe_limited(
    map: &mut HashMap<SeriesKey, Histogram>,
    key: SeriesKey,
    buckets: &'static [f64],
    value: f64,
) {
    if map.len() >= MAX_SERIES && !map.contains_key(&key) {
        return;
    }
    map.entry(key)
        .or_insert_with(|| Histogram::new(buckets))
        .observe(value);
}

fn write_histogram_map(
    out: &mut String,
    metric: &str,
    help: &str,
    map: &HashMap<SeriesKey, Histogram>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} histogram\n"));

    let mut entries: Vec<(&SeriesKey, &Histogram)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (key, hist) in entries {
        let tenant_id = escape_label_value(&key.tenant_id);
        let model = escape_label_value(&key.model);
        for (idx, bound) in hist.buckets.iter().enumerate() {
            out.push_str(&format!(
                "{metric}_bucket{{tenant_id=\"{tenant_id}\",model=\"{model}\",le=\"{bound}\"}} {}\n",
                hist.counts[idx]
            ));
        }
        out.push_str(&format!(
            "{metric}_bucket{{tenant_id=\"{tenant_id}\",model=\"{model}\",le=\"+Inf\"}} {}\n",
            hist.count
        ));
        out.push_str(&format!(
            "{metric}_sum{{tenant_id=\"{tenant_id}\",model=\"{model}\"}} {}\n",
            hist.sum
        ));
        out.push_str(&format!(
            "{metric}_count{{tenant_id=\"{tenant_id}\",model=\"{model}\"}} {}\n",
            hist.count
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

//! Traffic anomaly detection.
//!
//! Maintains a bounded sliding log of `(ip, timestamp, user-agent)` and
//! raises advisory flags. Flags are surfaced as events for observability;
//! nothing here blocks a request.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

const LOG_CAP: usize = 100_000;
const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 3_600_000;
const HIGH_RATE_PER_MIN: usize = 100;
const UA_CHURN_LIMIT: usize = 10;
const BURST_SIGMA: f64 = 10.0;
/// Minutes of history required before the burst rule can fire.
const BURST_MIN_HISTORY: usize = 10;

/// An advisory anomaly flag.
#[derive(Debug, Clone, PartialEq)]
pub enum AnomalyFlag {
    /// More than 100 requests within one minute from a single ip.
    HighRate { ip: String, per_minute: usize },

    /// More than 10 distinct user agents from one ip within an hour.
    UserAgentChurn { ip: String, distinct: usize },

    /// This minute's request count is >10σ above the subject's mean.
    BurstSpike {
        subject: String,
        count: u64,
        mean: f64,
        sigma: f64,
    },
}

#[derive(Debug)]
struct LogEntry {
    ip: String,
    ua: String,
    ts_ms: u64,
}

#[derive(Debug, Default)]
struct SubjectMinutes {
    /// `(minute_index, count)` pairs, oldest first.
    minutes: VecDeque<(u64, u64)>,
}

/// The anomaly detector. One per gateway instance.
pub struct AnomalyDetector {
    log: Mutex<VecDeque<LogEntry>>,
    subjects: Mutex<HashMap<String, SubjectMinutes>>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(VecDeque::new()),
            subjects: Mutex::new(HashMap::new()),
        }
    }

    /// Record one request and return any flags it raised.
    pub fn record(&self, ip: &str, ua: &str, subject: &str, now_ms: u64) -> Vec<AnomalyFlag> {
        let mut flags = Vec::new();

        {
            let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            log.push_back(LogEntry {
                ip: ip.to_string(),
                ua: ua.to_string(),
                ts_ms: now_ms,
            });
            while log.len() > LOG_CAP
                || log
                    .front()
                    .is_some_and(|e| e.ts_ms + HOUR_MS < now_ms)
            {
                log.pop_front();
            }

            let mut last_minute = 0usize;
            let mut uas: HashSet<&str> = HashSet::new();
            for entry in log.iter().filter(|e| e.ip == ip) {
                if entry.ts_ms + MINUTE_MS > now_ms {
                    last_minute += 1;
                }
                uas.insert(entry.ua.as_str());
            }

            if last_minute > HIGH_RATE_PER_MIN {
                flags.push(AnomalyFlag::HighRate {
                    ip: ip.to_string(),
                    per_minute: last_minute,
                });
            }
            if uas.len() > UA_CHURN_LIMIT {
                flags.push(AnomalyFlag::UserAgentChurn {
                    ip: ip.to_string(),
                    distinct: uas.len(),
                });
            }
        }

        if let Some(flag) = self.record_subject_minute(subject, now_ms) {
            flags.push(flag);
        }

        flags
    }

    fn record_subject_minute(&self, subject: &str, now_ms: u64) -> Option<AnomalyFlag> {
        let minute = now_ms / MINUTE_MS;
        let mut subjects = self.subjects.lock().unwrap_or_else(|e| e.into_inner());
        let state = subjects.entry(subject.to_string()).or_default();

        match state.minutes.back_mut() {
            Some((m, count)) if *m == minute => *count += 1,
            _ => state.minutes.push_back((minute, 1)),
        }
        while state.minutes.len() > 120 {
            state.minutes.pop_front();
        }

        // Historical minutes, excluding the one being accumulated
        let history: Vec<u64> = state
            .minutes
            .iter()
            .take(state.minutes.len().saturating_sub(1))
            .map(|(_, c)| *c)
            .collect();
        if history.len() < BURST_MIN_HISTORY {
            return None;
        }

        let mean = history.iter().sum::<u64>() as f64 / history.len() as f64;
        let variance = history
            .iter()
            .map(|c| {
                let d = *c as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / history.len() as f64;
        let sigma = variance.sqrt();

        let current = state.minutes.back().map(|(_, c)| *c).unwrap_or(0);
        if sigma > 0.0 && current as f64 > mean + BURST_SIGMA * sigma {
            return Some(AnomalyFlag::BurstSpike {
                subject: subject.to_string(),
                count: current,
                mean,
                sigma,
            });
        }
        None
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_traffic_raises_nothing() {
        let det = AnomalyDetector::new();
        for i in 0..20 {
            let flags = det.record("10.0.0.1", "curl/8", "k1", i * 1_000);
            assert!(flags.is_empty(), "unexpected flags: {flags:?}");
        }
    }

    #[test]
    fn high_rate_from_one_ip_flags() {
        let det = AnomalyDetector::new();
        let mut flagged = false;
        for i in 0..150 {
            let flags = det.record("10.0.0.2", "curl/8", "k1", i * 100);
            if flags
                .iter()
                .any(|f| matches!(f, AnomalyFlag::HighRate { .. }))
            {
                flagged = true;
            }
        }
        assert!(flagged);
    }

    #[test]
    fn user_agent_churn_flags() {
        let det = AnomalyDetector::new();
        let mut flagged = false;
        for i in 0..12 {
            let ua = format!("client/{i}");
            let flags = det.record("10.0.0.3", &ua, "k1", i * 10_000);
            if flags
                .iter()
                .any(|f| matches!(f, AnomalyFlag::UserAgentChurn { .. }))
            {
                flagged = true;
            }
        }
        assert!(flagged);
    }

    #[test]
    fn burst_spike_needs_history_then_fires() {
        let det = AnomalyDetector::new();
        // Steady background: 2 requests per minute for 15 minutes, with
        // slight jitter so sigma is non-zero
        for minute in 0..15u64 {
            let n = if minute % 3 == 0 { 3 } else { 2 };
            for i in 0..n {
                det.record("10.0.0.4", "curl/8", "bursty", minute * MINUTE_MS + i * 100);
            }
        }

        // Blast 200 requests in one minute
        let mut flagged = false;
        for i in 0..200u64 {
            let flags = det.record("10.0.0.4", "curl/8", "bursty", 20 * MINUTE_MS + i * 10);
            if flags
                .iter()
                .any(|f| matches!(f, AnomalyFlag::BurstSpike { .. }))
            {
                flagged = true;
                break;
            }
        }
        assert!(flagged);
    }
}

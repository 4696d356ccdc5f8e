//! Merge step
//!
//! Folds one round of probe results into a device record and reports what
//! changed. Runs under the record's lock, so it is synchronous and never
//! touches the network.
//!
//! ## Status rules
//!
//! - something succeeded and no known-good protocol failed: `online`
//! - something succeeded but a known-good protocol failed: `degraded`
//! - nothing succeeded and the device never answered before: `unknown`
//! - nothing succeeded, failures below the threshold: `degraded`
//! - nothing succeeded, failures at the threshold: `offline`
//!
//! A "known-good" protocol is one that succeeded for the device in some
//! earlier round.

use chrono::Utc;
use std::collections::BTreeSet;

use crate::alerts::{EventKind, HealthTransition};
use crate::device::{DeviceRecord, HealthStatus, Protocol};
use crate::traits::{ProbePayload, ProbeResult};

const SYS_DESCR_OID: &str = "1.3.6.1.2.1.1.1.0";

/// What one merge changed
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Results actually folded into the record
    pub merged: usize,
    /// Status change, if any
    pub transition: Option<HealthTransition>,
    /// Security findings (open ports, authentication failures)
    pub findings: Vec<EventKind>,
}

/// Fold a round of results into `record`
///
/// Cancelled results and results older than what the record already holds
/// for their protocol are ignored. A round with nothing left to merge leaves
/// the record untouched.
pub fn merge_results(
    record: &mut DeviceRecord,
    mut results: Vec<ProbeResult>,
    expected_ports: Option<&BTreeSet<u16>>,
    failure_threshold: u32,
) -> MergeOutcome {
    results.retain(|result| {
        !result.is_cancelled()
            && record
                .last_probed_at(result.protocol)
                .is_none_or(|last| result.timestamp >= last)
    });
    if results.is_empty() {
        return MergeOutcome::default();
    }
    results.sort_by_key(|result| result.protocol);

    let known_good: BTreeSet<Protocol> = Protocol::ALL
        .into_iter()
        .filter(|p| record.protocol_ever_succeeded(*p))
        .collect();
    let previous_status = record.status;
    let mut findings = Vec::new();

    for result in &results {
        apply_result(record, result, expected_ports, &mut findings);
    }

    let successes: Vec<&ProbeResult> = results.iter().filter(|r| r.is_success()).collect();
    let known_good_failures: Vec<Protocol> = results
        .iter()
        .filter(|r| !r.is_success() && known_good.contains(&r.protocol))
        .map(|r| r.protocol)
        .collect();

    let new_status = if !successes.is_empty() {
        record.consecutive_failures = 0;
        record.last_seen_at = successes.iter().map(|r| r.timestamp).max();
        if known_good_failures.is_empty() {
            HealthStatus::Online
        } else {
            HealthStatus::Degraded
        }
    } else {
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        if known_good.is_empty() {
            HealthStatus::Unknown
        } else if record.consecutive_failures >= failure_threshold {
            HealthStatus::Offline
        } else {
            HealthStatus::Degraded
        }
    };

    record.status = new_status;
    record.updated_at = Utc::now();

    let transition = (new_status != previous_status).then(|| {
        let cause = match new_status {
            HealthStatus::Online => successes.first().map(|r| r.protocol),
            _ => known_good_failures.first().copied(),
        }
        .or_else(|| results.iter().find(|r| !r.is_success()).map(|r| r.protocol))
        .unwrap_or(results[0].protocol);

        HealthTransition {
            identity: record.identity.clone(),
            previous: previous_status,
            new: new_status,
            cause,
            timestamp: results
                .iter()
                .map(|r| r.timestamp)
                .max()
                .unwrap_or_else(Utc::now),
        }
    });

    MergeOutcome {
        merged: results.len(),
        transition,
        findings,
    }
}

fn apply_result(
    record: &mut DeviceRecord,
    result: &ProbeResult,
    expected_ports: Option<&BTreeSet<u16>>,
    findings: &mut Vec<EventKind>,
) {
    let previous_error = record
        .protocols
        .get(&result.protocol)
        .and_then(|state| state.last_error.clone());
    let state = record.protocols.entry(result.protocol).or_default();
    state.last_probed_at = Some(result.timestamp);

    let payload = match &result.outcome {
        Ok(payload) => payload,
        Err(error) => {
            state.failures += 1;
            state.last_error = Some(error.clone());
            // Report once per streak, not every cycle
            if error.is_authentication() && !previous_error.is_some_and(|e| e.is_authentication())
            {
                findings.push(EventKind::AuthenticationFailure {
                    protocol: result.protocol,
                    detail: error.to_string(),
                });
            }
            return;
        }
    };

    state.successes += 1;
    state.last_success_at = Some(result.timestamp);
    state.last_latency_ms = Some(duration_ms(result.latency));
    state.last_error = None;

    let attributes = &mut record.attributes;
    match payload {
        ProbePayload::Reachability { rtt, .. } => {
            attributes.latency_ms = Some(duration_ms(*rtt));
        }
        ProbePayload::Snmp { values } => {
            if let Some(descr) = values.get(SYS_DESCR_OID).filter(|d| !d.is_empty()) {
                attributes.vendor_hint = Some(descr.clone());
            }
            attributes
                .snmp
                .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        ProbePayload::Command(output) => {
            attributes.last_command = Some(output.clone());
        }
        ProbePayload::Ports { open } => {
            for port in flagged_ports(attributes.open_ports.as_ref(), open, expected_ports) {
                findings.push(EventKind::OpenPortDetected { port });
            }
            attributes.open_ports = Some(open.clone());
        }
    }
}

/// Ports worth an alert
///
/// The first observation is a baseline unless expected ports are declared.
/// Afterwards only newly opened ports are reported, minus the expected ones.
fn flagged_ports(
    previous: Option<&BTreeSet<u16>>,
    open: &BTreeSet<u16>,
    expected: Option<&BTreeSet<u16>>,
) -> Vec<u16> {
    let candidates: Vec<u16> = match previous {
        Some(previous) => open.difference(previous).copied().collect(),
        None if expected.is_some() => open.iter().copied().collect(),
        None => Vec::new(),
    };
    candidates
        .into_iter()
        .filter(|port| expected.is_none_or(|expected| !expected.contains(port)))
        .collect()
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIdentity;
    use crate::error::ProbeError;
    use std::collections::BTreeMap;
    use std::net::IpAddr;
    use std::time::Duration;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::mac("aa:bb:cc:dd:ee:ff").unwrap()
    }

    fn record() -> DeviceRecord {
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        DeviceRecord::new(identity(), addr)
    }

    fn ok(protocol: Protocol) -> ProbeResult {
        let payload = match protocol {
            Protocol::Reachability => ProbePayload::Reachability {
                rtt: Duration::from_millis(3),
                replies: 1,
                ttl: Some(64),
            },
            Protocol::Snmp => ProbePayload::Snmp {
                values: BTreeMap::from([(SYS_DESCR_OID.to_string(), "Lab switch".to_string())]),
            },
            Protocol::Command => ProbePayload::Command(crate::traits::CommandOutput {
                command: "uptime".to_string(),
                stdout: "up 3 days".to_string(),
                stderr: String::new(),
                exit_code: 0,
            }),
            Protocol::Ports => ProbePayload::Ports {
                open: BTreeSet::from([22]),
            },
        };
        ProbeResult::new(identity(), protocol, Ok(payload), Duration::from_millis(3))
    }

    fn fail(protocol: Protocol, error: ProbeError) -> ProbeResult {
        ProbeResult::new(identity(), protocol, Err(error), Duration::from_millis(5))
    }

    fn ports(open: &[u16]) -> ProbeResult {
        ProbeResult::new(
            identity(),
            Protocol::Ports,
            Ok(ProbePayload::Ports {
                open: open.iter().copied().collect(),
            }),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn test_first_success_goes_online() {
        let mut rec = record();
        let results = vec![ok(Protocol::Reachability), ok(Protocol::Snmp)];
        let outcome = merge_results(&mut rec, results, None, 3);

        let transition = outcome.transition.unwrap();
        assert_eq!(transition.previous, HealthStatus::Unknown);
        assert_eq!(transition.new, HealthStatus::Online);
        assert_eq!(transition.cause, Protocol::Reachability);
        assert_eq!(rec.attributes.vendor_hint.as_deref(), Some("Lab switch"));
        assert!(rec.last_seen_at.is_some());
    }

    #[test]
    fn test_known_good_protocol_failure_degrades() {
        let mut rec = record();
        let first = vec![ok(Protocol::Reachability), ok(Protocol::Snmp)];
        merge_results(&mut rec, first, None, 3);

        let second = vec![
            ok(Protocol::Reachability),
            fail(Protocol::Snmp, ProbeError::Timeout),
        ];
        let outcome = merge_results(&mut rec, second, None, 3);

        let transition = outcome.transition.unwrap();
        assert_eq!(transition.new, HealthStatus::Degraded);
        assert_eq!(transition.cause, Protocol::Snmp);
        assert_eq!(rec.consecutive_failures, 0);
    }

    #[test]
    fn test_never_working_protocol_does_not_degrade() {
        let mut rec = record();
        let results = vec![
            ok(Protocol::Reachability),
            fail(Protocol::Snmp, ProbeError::AgentUnreachable("no agent".into())),
        ];
        let outcome = merge_results(&mut rec, results, None, 3);

        assert_eq!(rec.status, HealthStatus::Online);
        assert_eq!(outcome.transition.unwrap().new, HealthStatus::Online);
    }

    #[test]
    fn test_offline_exactly_at_threshold() {
        let mut rec = record();
        merge_results(&mut rec, vec![ok(Protocol::Reachability)], None, 3);

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let results = vec![fail(Protocol::Reachability, ProbeError::Unreachable)];
            merge_results(&mut rec, results, None, 3);
            statuses.push(rec.status);
        }

        assert_eq!(
            statuses,
            vec![HealthStatus::Degraded, HealthStatus::Degraded, HealthStatus::Offline]
        );
        assert_eq!(rec.consecutive_failures, 3);
    }

    #[test]
    fn test_unknown_device_stays_unknown() {
        let mut rec = record();
        for _ in 0..5 {
            let results = vec![fail(Protocol::Reachability, ProbeError::Unreachable)];
            let outcome = merge_results(&mut rec, results, None, 3);
            assert!(outcome.transition.is_none());
        }
        assert_eq!(rec.status, HealthStatus::Unknown);
        assert_eq!(rec.consecutive_failures, 5);
    }

    #[test]
    fn test_cancelled_results_leave_record_untouched() {
        let mut rec = record();
        let before = rec.clone();
        let results = vec![fail(Protocol::Reachability, ProbeError::Cancelled)];
        let outcome = merge_results(&mut rec, results, None, 3);

        assert_eq!(outcome.merged, 0);
        assert_eq!(rec, before);
    }

    #[test]
    fn test_older_result_is_ignored() {
        let mut rec = record();
        let fresh = ok(Protocol::Reachability);
        let mut stale = fail(Protocol::Reachability, ProbeError::Unreachable);
        stale.timestamp = fresh.timestamp - chrono::Duration::seconds(5);
        merge_results(&mut rec, vec![fresh], None, 3);

        let outcome = merge_results(&mut rec, vec![stale], None, 3);
        assert_eq!(outcome.merged, 0);
        assert_eq!(rec.status, HealthStatus::Online);
    }

    #[test]
    fn test_new_open_port_is_flagged_after_baseline() {
        let mut rec = record();
        let baseline = merge_results(&mut rec, vec![ports(&[22, 80])], None, 3);
        assert!(baseline.findings.is_empty());

        let outcome = merge_results(&mut rec, vec![ports(&[22, 80, 23])], None, 3);
        assert_eq!(outcome.findings, vec![EventKind::OpenPortDetected { port: 23 }]);

        let again = merge_results(&mut rec, vec![ports(&[22, 80, 23])], None, 3);
        assert!(again.findings.is_empty());
    }

    #[test]
    fn test_unexpected_port_flagged_on_first_observation() {
        let mut rec = record();
        let expected = BTreeSet::from([22, 443]);
        let outcome = merge_results(&mut rec, vec![ports(&[22, 23])], Some(&expected), 3);
        assert_eq!(outcome.findings, vec![EventKind::OpenPortDetected { port: 23 }]);
    }

    #[test]
    fn test_authentication_failure_reported_once_per_streak() {
        let mut rec = record();
        let mut reported = 0;
        for _ in 0..3 {
            let results = vec![
                ok(Protocol::Reachability),
                fail(Protocol::Command, ProbeError::AuthenticationFailed),
            ];
            reported += merge_results(&mut rec, results, None, 3).findings.len();
        }
        assert_eq!(reported, 1);

        merge_results(&mut rec, vec![ok(Protocol::Command)], None, 3);
        let results = vec![fail(Protocol::Command, ProbeError::AuthenticationFailed)];
        let outcome = merge_results(&mut rec, results, None, 3);
        assert_eq!(outcome.findings.len(), 1);
    }

    #[test]
    fn test_recovery_cause_is_first_success() {
        let mut rec = record();
        merge_results(&mut rec, vec![ok(Protocol::Snmp)], None, 1);
        merge_results(
            &mut rec,
            vec![fail(Protocol::Snmp, ProbeError::Timeout)],
            None,
            1,
        );
        assert_eq!(rec.status, HealthStatus::Offline);

        let outcome = merge_results(&mut rec, vec![ok(Protocol::Snmp)], None, 1);
        let transition = outcome.transition.unwrap();
        assert_eq!(transition.previous, HealthStatus::Offline);
        assert_eq!(transition.new, HealthStatus::Online);
        assert_eq!(transition.cause, Protocol::Snmp);
    }
}

//! Adaptive backpressure for slow consumers.
//!
//! Every `send` evaluates the sending connection against the acceptor's
//! suspect policy: a connection whose outbound backlog crosses the suspect
//! threshold (or that is hoarding a capacity-limited buffer pool) is flagged
//! as a *suspect* and watched; a suspect that keeps growing, or that crosses
//! the hard limit, is killed to protect the rest of the service. Evaluation
//! is rate-limited per connection so the bookkeeping stays off the send hot
//! path.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tracing::{error, info};

use crate::network::connection::Connection;
use crate::service::{AppError, SuspectConfig};

/// Re-evaluating a connection more often than this tells us nothing new.
const CHECK_INTERVAL_MILLIS: u64 = 3_000;

/// A connection younger than this is still filling its window; the
/// fair-share rule does not apply to it.
const FAIR_SHARE_MIN_AGE_MILLIS: u64 = 30_000;

/// Process-local monotonic clock in milliseconds.
pub(crate) fn monotonic_millis() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let millis = EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64;
    // Backdating a timestamp cannot work near process start (the clock is
    // only milliseconds old), so tests advance the clock itself instead.
    // The offset is thread-local to keep parallel tests independent.
    #[cfg(test)]
    let millis = millis + TEST_CLOCK_OFFSET_MILLIS.with(|offset| offset.get());
    millis
}

#[cfg(test)]
thread_local! {
    // The test clock starts 1 ms ahead so a timestamp taken in the first
    // millisecond of the process can never collide with the
    // `latest_check_millis == 0` "never checked" sentinel in `check_due`.
    pub(crate) static TEST_CLOCK_OFFSET_MILLIS: std::cell::Cell<u64> =
        const { std::cell::Cell::new(1) };
}

/// Advance this thread's view of [`monotonic_millis`] by `millis`.
#[cfg(test)]
pub(crate) fn advance_test_clock(millis: u64) {
    TEST_CLOCK_OFFSET_MILLIS.with(|offset| offset.set(offset.get() + millis));
}

/// Per-connection suspect bookkeeping, guarded by the connection's own
/// mutex. All timestamps come from [`monotonic_millis`].
#[derive(Debug, Default)]
pub(crate) struct SuspectState {
    pub suspect: bool,
    /// When this connection was last evaluated (0 = never).
    pub latest_check_millis: u64,
    /// When the connection was flagged.
    pub initial_millis: u64,
    pub initial_bytes: u64,
    pub initial_messages: u64,
    pub latest_bytes: u64,
    pub latest_messages: u64,
    pub check_count: u32,
    pub bytes_worse_count: u32,
    pub messages_worse_count: u32,
    /// Dropping below this backlog clears the flag.
    pub target_bytes: u64,
    pub target_messages: u64,
}

impl SuspectState {
    /// Passes at most once per [`CHECK_INTERVAL_MILLIS`] per connection.
    fn check_due(&mut self, now: u64) -> bool {
        if self.latest_check_millis == 0 || now > self.latest_check_millis + CHECK_INTERVAL_MILLIS {
            self.latest_check_millis = now;
            true
        } else {
            false
        }
    }
}

/// Evaluate `conn` against the suspect policy using the counter snapshot
/// taken under the queue lock at enqueue time.
pub(crate) fn evaluate(
    conn: &Arc<Connection>,
    was_suspect: bool,
    queued_messages: u64,
    queued_bytes: u64,
    sent_messages: u64,
    sent_bytes: u64,
) {
    let behind_messages = queued_messages.saturating_sub(sent_messages);
    let behind_bytes = queued_bytes.saturating_sub(sent_bytes);
    if behind_messages > i32::MAX as u64 || behind_bytes > i32::MAX as u64 {
        // torn snapshot from a concurrent send; the next send re-evaluates
        return;
    }

    let shared = conn.shared();
    let cfg = &shared.config.suspect;
    let pool = &shared.pool_out;

    // A single connection that has swallowed the pool's entire configured
    // capacity starves every other connection of outbound buffers. That is
    // fatal on its own, independent of the suspect flag and of the check
    // interval.
    if pool.is_capacity_limited() {
        let capacity_buffers = pool.capacity() as u64;
        let capacity_bytes = capacity_buffers * pool.buffer_size() as u64;
        if behind_messages > capacity_buffers || behind_bytes > capacity_bytes {
            let cause = format!(
                "the connection backlog of {} messages ({} bytes) exceeds the \
                 entire outgoing buffer pool capacity of {} buffers ({} bytes)",
                behind_messages, behind_bytes, capacity_buffers, capacity_bytes
            );
            kill(conn, cause);
            return;
        }
    }

    // Mature connections on a capacity-limited pool are also screened
    // against their fair share, which sits below the suspect threshold.
    let fair_share_applies =
        pool.is_capacity_limited() && conn.alive_millis() > FAIR_SHARE_MIN_AGE_MILLIS;

    if was_suspect {
        evaluate_suspect(conn, cfg, behind_messages, behind_bytes);
    } else if pool.in_overflow()
        || behind_messages > cfg.suspect_messages
        || behind_bytes > cfg.suspect_bytes
        || fair_share_applies
    {
        evaluate_candidate(conn, cfg, behind_messages, behind_bytes);
    }
}

/// A connection already under watch: clear it, keep watching, or kill it.
fn evaluate_suspect(
    conn: &Arc<Connection>,
    cfg: &SuspectConfig,
    behind_messages: u64,
    behind_bytes: u64,
) {
    let now = monotonic_millis();
    let mut verdict = Verdict::Watch;
    {
        let mut state = conn.suspect.lock();
        if !state.suspect || !state.check_due(now) {
            return;
        }

        if behind_messages > cfg.limit_messages || behind_bytes > cfg.limit_bytes {
            verdict = Verdict::Kill(format!(
                "the connection is {} messages ({} bytes) behind; the limit is \
                 {} messages ({} bytes)",
                behind_messages, behind_bytes, cfg.limit_messages, cfg.limit_bytes
            ));
        } else if behind_bytes < state.target_bytes {
            verdict = Verdict::Clear(format!(
                "the backlog shrank to {} bytes, under the target of {} bytes",
                behind_bytes, state.target_bytes
            ));
        } else {
            // track the trend since the connection was flagged
            state.check_count += 1;
            if behind_bytes > state.latest_bytes {
                state.bytes_worse_count += 1;
            }
            if behind_messages > state.latest_messages {
                state.messages_worse_count += 1;
            }
            state.latest_bytes = behind_bytes;
            state.latest_messages = behind_messages;

            let elapsed = now.saturating_sub(state.initial_millis);
            let pct_bytes = state.bytes_worse_count * 100 / state.check_count;
            let pct_messages = state.messages_worse_count * 100 / state.check_count;

            let growing = behind_bytes > state.initial_bytes;
            let long_decline = state.check_count > 20
                && elapsed > 60_000
                && (pct_bytes > 90 || pct_messages > 90);
            let sharp_decline = state.check_count > 6
                && elapsed > 20_000
                && (pct_bytes == 100 || pct_messages == 100);
            let long_recovery = state.check_count > 20
                && elapsed > 60_000
                && (pct_bytes < 10 || pct_messages < 10);

            if growing && (long_decline || sharp_decline) {
                verdict = Verdict::Kill(format!(
                    "the backlog grew from {} to {} bytes over {} checks in {}s \
                     and shows no sign of recovery",
                    state.initial_bytes,
                    behind_bytes,
                    state.check_count,
                    elapsed / 1_000
                ));
            } else if behind_bytes < state.initial_bytes && long_recovery {
                verdict = Verdict::Clear(format!(
                    "the backlog fell from {} to {} bytes over {} checks in {}s",
                    state.initial_bytes,
                    behind_bytes,
                    state.check_count,
                    elapsed / 1_000
                ));
            }
        }

        if matches!(verdict, Verdict::Clear(_) | Verdict::Kill(_)) {
            state.suspect = false;
        }
    }

    match verdict {
        Verdict::Watch => {}
        Verdict::Clear(cause) => {
            info!("{} is no longer a suspect: {}", conn, cause);
        }
        Verdict::Kill(cause) => kill(conn, cause),
    }
}

enum Verdict {
    Watch,
    Clear(String),
    Kill(String),
}

/// A connection whose backlog has crossed the suspect threshold, or whose
/// pool is overflowing: decide whether to flag it.
fn evaluate_candidate(
    conn: &Arc<Connection>,
    cfg: &SuspectConfig,
    behind_messages: u64,
    behind_bytes: u64,
) {
    let now = monotonic_millis();
    if !conn.suspect.lock().check_due(now) {
        return;
    }

    let shared = conn.shared();
    let pool = &shared.pool_out;

    let mut cause = None;
    let mut target_bytes = cfg.nominal_bytes;
    let target_messages = cfg.nominal_messages;

    if behind_messages > cfg.suspect_messages || behind_bytes > cfg.suspect_bytes {
        cause = Some(format!(
            "the connection has fallen {} messages ({} bytes) behind; the \
             suspect threshold is {} messages or {} bytes",
            behind_messages, behind_bytes, cfg.suspect_messages, cfg.suspect_bytes
        ));
    }

    // When the pool is capacity-limited, mature connections are also held
    // to a fair share of the pool, scaled by the connection count.
    if pool.is_capacity_limited() && conn.alive_millis() > FAIR_SHARE_MIN_AGE_MILLIS {
        let connections = (shared.connections.len() as u64).max(1);
        let capacity_bytes = pool.capacity() as u64 * pool.buffer_size() as u64;
        let fair_share = capacity_bytes / connections;
        let trigger = cfg.suspect_bytes.min(cfg.nominal_bytes.max(fair_share / 2 * 3));
        if behind_bytes > trigger {
            target_bytes = cfg.suspect_bytes.min(cfg.nominal_bytes.max(fair_share));
            cause = Some(format!(
                "the connection has fallen {} messages ({} bytes) behind; with \
                 {} connections sharing a pool of {} bytes, the backlog trigger \
                 is {} bytes",
                behind_messages, behind_bytes, connections, capacity_bytes, trigger
            ));
        }
    }

    let Some(cause) = cause else {
        return;
    };

    // Only the worst few percent of connections get flagged. The registry
    // may gain or lose entries while we rank; the comparison is advisory
    // and a stale read just delays the flag by one check interval.
    let mut others = 0u64;
    let mut worse = 0u64;
    for entry in shared.connections.iter() {
        let other = entry.value();
        if other.id() == conn.id() {
            continue;
        }
        others += 1;
        let (other_messages, other_bytes) = other.backlog();
        if (other_messages > 0
            && other_messages < i32::MAX as u64
            && other_messages > behind_messages)
            || (other_bytes > 0 && other_bytes < i32::MAX as u64 && other_bytes > behind_bytes)
        {
            worse += 1;
        }
    }

    if worse < 3u64.max(others / 20) {
        let mut state = conn.suspect.lock();
        state.suspect = true;
        state.initial_millis = now;
        state.initial_bytes = behind_bytes;
        state.initial_messages = behind_messages;
        state.latest_bytes = behind_bytes;
        state.latest_messages = behind_messages;
        state.check_count = 0;
        state.bytes_worse_count = 0;
        state.messages_worse_count = 0;
        state.target_bytes = target_bytes;
        state.target_messages = target_messages;
        info!("flagged {} as a suspect: {}", conn, cause);
    }
}

fn kill(conn: &Arc<Connection>, cause: String) {
    error!(
        "closing {} to preserve service stability: {}",
        conn, cause
    );
    conn.kill(AppError::SuspectConnection(cause));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::acceptor::test_support::test_shared;
    use crate::service::{AcceptorConfig, AppError};
    use std::thread;

    fn connection_with(config: AcceptorConfig) -> Arc<Connection> {
        let shared = test_shared(config);
        let conn = Connection::new("127.0.0.1:50000".parse().unwrap(), shared.clone());
        shared.connections.insert(conn.id(), conn.clone());
        conn
    }

    fn rewind_check(conn: &Connection, millis: u64) {
        let mut state = conn.suspect.lock();
        state.latest_check_millis = state.latest_check_millis.saturating_sub(millis);
    }

    // the reactor normally takes the close reason; tests peek at it instead
    fn killed_as_suspect(conn: &Connection) -> bool {
        matches!(
            *conn.peek_close_reason(),
            Some(AppError::SuspectConnection(_))
        )
    }

    #[test]
    fn small_backlog_is_never_flagged() {
        let conn = connection_with(AcceptorConfig::default());
        evaluate(&conn, false, 100, 1_000, 0, 0);
        assert!(!conn.is_suspect());
    }

    #[test]
    fn crossing_the_threshold_flags_and_crossing_the_limit_kills() {
        let conn = connection_with(AcceptorConfig::default());

        // over suspect_bytes (10 MB): flagged, only connection so worst-ranked
        evaluate(&conn, false, 2_000, 11_000_000, 0, 0);
        assert!(conn.is_suspect());
        assert!(conn.is_open());

        // over limit_bytes (100 MB) after the check interval: killed
        rewind_check(&conn, CHECK_INTERVAL_MILLIS + 1_000);
        evaluate(&conn, true, 20_000, 101_000_000, 0, 0);
        assert!(!conn.is_suspect());
        assert!(killed_as_suspect(&conn));
        assert_eq!(conn.shared().release_queue.lock().len(), 1);
    }

    #[test]
    fn shrinking_below_target_clears_the_flag() {
        let conn = connection_with(AcceptorConfig::default());
        evaluate(&conn, false, 2_000, 11_000_000, 0, 0);
        assert!(conn.is_suspect());

        // drain below the nominal target of 2 MB
        rewind_check(&conn, CHECK_INTERVAL_MILLIS + 1_000);
        evaluate(&conn, true, 2_100, 11_500_000, 2_000, 10_000_000);
        assert!(!conn.is_suspect());
        assert!(conn.is_open());
        assert!(conn.peek_close_reason().is_none());
    }

    #[test]
    fn relentless_growth_is_killed_on_trend() {
        let conn = connection_with(AcceptorConfig::default());
        evaluate(&conn, false, 2_000, 11_000_000, 0, 0);
        assert!(conn.is_suspect());

        // age the flag so elapsed-time gates pass, then grow every check
        advance_test_clock(25_000);
        let mut bytes = 12_000_000u64;
        for _ in 0..7 {
            rewind_check(&conn, CHECK_INTERVAL_MILLIS + 1_000);
            bytes += 1_000_000;
            evaluate(&conn, true, 3_000, bytes, 0, 0);
            if !conn.is_open() {
                break;
            }
        }
        assert!(killed_as_suspect(&conn));
    }

    #[test]
    fn mature_connections_are_held_to_a_fair_share_of_a_limited_pool() {
        // 10_000 buffers of 2048 bytes: the pool holds 20_480_000 bytes, so
        // with 4 connections the fair share is 5_120_000 bytes and the
        // flagging trigger is 7_680_000 (fair share * 3/2)
        let mut config = AcceptorConfig::default();
        config.outgoing_pool.buffer_size = 2_048;
        config.outgoing_pool.capacity = 10_000;
        let conn = connection_with(config);
        let shared = conn.shared().clone();
        for port in 0..3u16 {
            let other = Connection::new(
                format!("127.0.0.1:{}", 50_100 + port).parse().unwrap(),
                shared.clone(),
            );
            shared.connections.insert(other.id(), other);
        }

        // under suspect_bytes and still young: the fair-share rule is off
        evaluate(&conn, false, 100, 8_000_000, 0, 0);
        assert!(!conn.is_suspect());

        conn.age_by(FAIR_SHARE_MIN_AGE_MILLIS + 1_000);
        rewind_check(&conn, CHECK_INTERVAL_MILLIS + 1_000);
        evaluate(&conn, false, 100, 8_000_000, 0, 0);
        assert!(conn.is_suspect());
        assert_eq!(conn.suspect.lock().target_bytes, 5_120_000);
        assert!(conn.is_open());
    }

    #[test]
    fn a_consistently_shrinking_backlog_is_cleared_on_trend() {
        let conn = connection_with(AcceptorConfig::default());
        evaluate(&conn, false, 2_000, 11_000_000, 0, 0);
        assert!(conn.is_suspect());

        // age the flag past the one minute gate, then shrink on every check
        // while staying above the 2 MB target so only the trend can clear it
        advance_test_clock(65_000);
        let mut bytes = 10_900_000u64;
        for _ in 0..21 {
            rewind_check(&conn, CHECK_INTERVAL_MILLIS + 1_000);
            bytes -= 100_000;
            evaluate(&conn, true, 2_000, bytes, 0, 0);
        }
        assert!(!conn.is_suspect());
        assert!(conn.is_open());
        assert!(conn.peek_close_reason().is_none());
    }

    #[test]
    fn checks_are_rate_limited_per_connection() {
        let conn = connection_with(AcceptorConfig::default());
        evaluate(&conn, false, 2_000, 11_000_000, 0, 0);
        assert!(conn.is_suspect());

        // within the interval nothing is re-evaluated, even over the limit
        evaluate(&conn, true, 20_000, 101_000_000, 0, 0);
        assert!(conn.is_open());
        assert!(conn.is_suspect());
    }

    #[test]
    fn hoarding_the_entire_pool_capacity_is_fatal_without_a_flag() {
        let mut config = AcceptorConfig::default();
        config.outgoing_pool.buffer_size = 1_024;
        config.outgoing_pool.capacity = 2;
        let conn = connection_with(config);

        // no prior flag and no rate-limit window: still killed outright
        evaluate(&conn, false, 10, 4_096, 0, 0);
        assert!(killed_as_suspect(&conn));
    }

    #[test]
    fn ranking_tolerates_registry_churn() {
        let conn = connection_with(AcceptorConfig::default());
        let shared = conn.shared().clone();

        let churn = thread::spawn(move || {
            for _ in 0..200 {
                let other = Connection::new("127.0.0.1:50001".parse().unwrap(), shared.clone());
                shared.connections.insert(other.id(), other.clone());
                shared.connections.remove(&other.id());
            }
        });

        for _ in 0..50 {
            rewind_check(&conn, CHECK_INTERVAL_MILLIS + 1_000);
            conn.suspect.lock().suspect = false;
            evaluate(&conn, false, 2_000, 11_000_000, 0, 0);
        }
        churn.join().unwrap();
    }
}

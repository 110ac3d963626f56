//! Background renewal of a held lease.
//!
//! One task per lease. Each tick re-extends the record's TTL through the
//! `renew` CAS. A CAS miss means the lease is gone. Transport and timeout
//! errors are retried on the next tick, subject to the [`StalenessPolicy`];
//! any other store error ends the lease.

use crate::{
    lease::{with_deadline, LeaseState, LeaseStatus, LostCallback},
    options::StalenessPolicy,
    store::LeaseStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

pub(crate) struct Watchdog {
    pub(crate) store: Arc<dyn LeaseStore>,
    pub(crate) key: String,
    pub(crate) token: String,
    pub(crate) ttl: Duration,
    pub(crate) interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) staleness: StalenessPolicy,
    pub(crate) state: Arc<LeaseState>,
    pub(crate) on_lost: Option<LostCallback>,
}

/// Completes at `deadline`, or never when there is none.
async fn stale_after(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Watchdog {
    pub(crate) fn spawn(self) -> tokio::task::JoinHandle<LeaseStatus> {
        tokio::spawn(self.run())
    }

    /// When the store may have expired a record last extended at `extended`.
    fn stale_at(&self, extended: Instant) -> Option<Instant> {
        match self.staleness {
            StalenessPolicy::BoundedByTtl => extended.checked_add(self.ttl),
            StalenessPolicy::Unbounded => None,
        }
    }

    async fn run(self) -> LeaseStatus {
        let stop = self.state.stop_token().clone();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        let mut last_renewed = Instant::now();
        let mut stale_at = self.stale_at(last_renewed);

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => return self.stopped(),
                () = stale_after(stale_at) => return self.lost("no successful renewal within ttl"),
                _ = ticker.tick() => {}
            }

            // The store extends the expiry when it applies the renewal, which
            // is no earlier than this.
            let sent_at = Instant::now();
            let renewal = with_deadline(
                "renew",
                &self.key,
                self.timeout,
                self.store.renew(&self.key, &self.token, self.ttl),
            );
            let renewed = tokio::select! {
                biased;
                () = stop.cancelled() => return self.stopped(),
                () = stale_after(stale_at) => return self.lost("no successful renewal within ttl"),
                result = renewal => result,
            };

            match renewed {
                Ok(true) => {
                    last_renewed = sent_at;
                    stale_at = self.stale_at(sent_at);
                    trace!(key = %self.key, "lease renewed");
                }
                Ok(false) => {
                    return self.lost("token no longer matches");
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        key = %self.key,
                        error = %err,
                        stale_ms = u64::try_from(last_renewed.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "lease renewal failed, retrying"
                    );
                }
                Err(err) => {
                    warn!(key = %self.key, error = %err, "lease renewal rejected by store");
                    return self.lost("ownership can no longer be verified");
                }
            }
        }
    }

    fn stopped(&self) -> LeaseStatus {
        debug!(key = %self.key, "watchdog stopped by release");
        LeaseStatus::Released
    }

    fn lost(&self, reason: &'static str) -> LeaseStatus {
        // A release racing with this tick may already have deleted the
        // record; in that case the release wins and no callback fires.
        if !self.state.finish(LeaseStatus::Lost) {
            return self.stopped();
        }
        warn!(key = %self.key, token = %self.token, reason, "lease lost");
        if let Some(on_lost) = &self.on_lost {
            on_lost();
        }
        LeaseStatus::Lost
    }
}

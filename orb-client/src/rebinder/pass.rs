//! 单次重绑定流程 - 全量重绑、租约续期、增量绑定

use shared::{BindingRecord, Cookie, RebindResult};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

use super::{RebindEntry, RebindState, RebinderShared, RemovalReason};
use crate::cache::ObjectRefCache;
use crate::error::{OrbError, OrbResult};
use crate::rpc::NameServer;

impl RebinderShared {
    fn cache(&self) -> &ObjectRefCache {
        self.resolver.cache()
    }

    /// One pass. Never fails: errors turn into a forced full resync.
    pub(super) async fn tick(&self) {
        let mut state = self.state.lock().await;
        self.counters.passes.fetch_add(1, Ordering::Relaxed);

        match self.run_pass(&mut state).await {
            Ok(()) => state.last_error = None,
            Err(e) => {
                let msg = e.to_string();
                // 连续相同的错误只记录一次
                if state.last_error.as_deref() != Some(msg.as_str()) {
                    tracing::warn!("Auto-rebind pass failed: {msg}");
                }
                state.last_error = Some(msg);
                state.last_cookie = Cookie::UNKNOWN;
                state.last_contact = Instant::now();
            }
        }
    }

    async fn run_pass(&self, state: &mut RebindState) -> OrbResult<()> {
        let now = Instant::now();

        // Someone else saw the server change under us
        if state.last_cookie != self.cache().last_cookie() {
            state.last_cookie = Cookie::UNKNOWN;
        }

        let mut ns = None;
        if now.duration_since(state.last_contact) >= self.config.ping_interval {
            state.last_contact = now;
            let proxy = self.resolver.name_server(Duration::ZERO).await?;
            let cookie = self.query_cookie(&proxy).await?;
            if cookie != state.last_cookie {
                state.last_cookie = Cookie::UNKNOWN;
            }
            ns = Some(proxy);
        }

        let nothing_due = !state.entries.first().is_some_and(|e| e.lease.needs_work(now));
        if state.last_cookie.is_known() && nothing_due {
            return Ok(());
        }

        let ns = match ns {
            Some(proxy) => proxy,
            None => self.resolver.name_server(Duration::ZERO).await?,
        };

        let changed = if state.last_cookie.is_known() {
            let renewed = self.renewal_pass(&ns, state).await?;
            // 续期时发现 cookie 不一致则本轮不再增量绑定
            let bound = state.last_cookie.is_known() && self.binding_pass(&ns, state).await?;
            renewed || bound
        } else {
            self.full_rebind(&ns, state).await?
        };

        if changed {
            state.entries.sort_by_key(|e| e.lease.next_renewal());
        }
        Ok(())
    }

    async fn query_cookie(&self, ns: &Arc<dyn NameServer>) -> OrbResult<Cookie> {
        let cookie = ns
            .query_cookie()
            .await
            .map_err(|e| self.resolver.note_failure(e))?;
        self.cache().check_cookie(cookie);
        Ok(cookie)
    }

    /// Send every entry with the server's current cookie.
    async fn full_rebind(&self, ns: &Arc<dyn NameServer>, state: &mut RebindState) -> OrbResult<bool> {
        state.last_contact = Instant::now();
        let cookie = self.query_cookie(ns).await?;

        let records: Vec<BindingRecord> = state.entries.iter().map(|e| e.record.clone()).collect();
        let reply = ns
            .rebind_objects(&records, cookie)
            .await
            .map_err(|e| self.resolver.note_failure(e))?;
        self.cache().check_cookie(reply.cookie);

        if !reply.in_sync {
            tracing::debug!("Name server changed during full rebind, will retry");
            state.last_cookie = Cookie::UNKNOWN;
            return Ok(false);
        }
        check_result_count(records.len(), reply.results.len())?;

        let all: Vec<usize> = (0..records.len()).collect();
        self.apply_rebind_results(state, &all, &reply.results);
        state.last_cookie = reply.cookie;
        self.counters.full_rebinds.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(count = records.len(), cookie = %reply.cookie, "Full rebind complete");
        Ok(true)
    }

    /// Renew every bound entry whose lease is due.
    async fn renewal_pass(&self, ns: &Arc<dyn NameServer>, state: &mut RebindState) -> OrbResult<bool> {
        let now = Instant::now();
        let due: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.lease.needs_refresh(now))
            .map(|(i, _)| i)
            .collect();
        if due.is_empty() {
            return Ok(false);
        }

        let paths: Vec<String> = due.iter().map(|&i| state.entries[i].record.full_path()).collect();
        let reply = ns
            .renew_leases(&paths, state.last_cookie)
            .await
            .map_err(|e| self.resolver.note_failure(e))?;
        state.last_contact = Instant::now();
        self.cache().check_cookie(reply.cookie);

        if !reply.in_sync {
            tracing::debug!(count = due.len(), "Cookie mismatch on renewal, forcing full rebind");
            for &i in &due {
                state.entries[i].lease.set_not_bound();
            }
            state.last_cookie = Cookie::UNKNOWN;
            return Ok(true);
        }
        check_result_count(due.len(), reply.results.len())?;

        let now = Instant::now();
        for (&i, &renewed) in due.iter().zip(&reply.results) {
            let lease = &mut state.entries[i].lease;
            if renewed {
                lease.set_next_renewal(now, self.config.lease_threshold);
                self.counters.renewals_ok.fetch_add(1, Ordering::Relaxed);
            } else {
                // 续期失败不累加错误计数，只标记为待重绑
                lease.set_not_bound();
            }
        }
        Ok(true)
    }

    /// Bind the entries that are not currently leased.
    async fn binding_pass(&self, ns: &Arc<dyn NameServer>, state: &mut RebindState) -> OrbResult<bool> {
        let unbound: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.lease.is_bound())
            .map(|(i, _)| i)
            .collect();
        if unbound.is_empty() {
            return Ok(false);
        }

        let records: Vec<BindingRecord> = unbound.iter().map(|&i| state.entries[i].record.clone()).collect();
        let reply = ns
            .rebind_objects(&records, state.last_cookie)
            .await
            .map_err(|e| self.resolver.note_failure(e))?;
        state.last_contact = Instant::now();
        self.cache().check_cookie(reply.cookie);

        if !reply.in_sync {
            tracing::debug!("Cookie mismatch on rebind, forcing full rebind");
            state.last_cookie = Cookie::UNKNOWN;
            return Ok(false);
        }
        check_result_count(records.len(), reply.results.len())?;

        self.apply_rebind_results(state, &unbound, &reply.results);
        Ok(true)
    }

    /// Apply positional results to the entries at `indices`, building the
    /// compacted list in one go.
    fn apply_rebind_results(&self, state: &mut RebindState, indices: &[usize], results: &[RebindResult]) {
        let now = Instant::now();
        let mut outcomes: Vec<Option<RebindResult>> = vec![None; state.entries.len()];
        for (&i, &result) in indices.iter().zip(results) {
            outcomes[i] = Some(result);
        }

        let entries = std::mem::take(&mut state.entries);
        state.entries = entries
            .into_iter()
            .zip(outcomes)
            .filter_map(|(entry, outcome)| match outcome {
                None => Some(entry),
                Some(result) => self.apply_outcome(entry, result, now),
            })
            .collect();
    }

    fn apply_outcome(&self, mut entry: RebindEntry, result: RebindResult, now: Instant) -> Option<RebindEntry> {
        match result {
            RebindResult::Success => {
                entry.lease.set_next_renewal(now, self.config.lease_threshold);
                self.counters.binds_ok.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            RebindResult::Exception => {
                self.counters.failed_rebinds.fetch_add(1, Ordering::Relaxed);
                let failures = entry.lease.inc_error_count();
                if failures > self.config.max_bind_failures {
                    self.record_removal(entry.record.full_path(), RemovalReason::TooManyFailures(failures));
                    return None;
                }
                tracing::debug!(path = %entry.record.full_path(), failures, "Bind failed");
                entry.lease.set_not_bound();
                Some(entry)
            }
            RebindResult::NotATerminal => {
                self.record_removal(entry.record.full_path(), RemovalReason::NotATerminal);
                None
            }
        }
    }
}

fn check_result_count(expected: usize, got: usize) -> OrbResult<()> {
    if expected != got {
        return Err(OrbError::Rpc(format!(
            "name server returned {got} results for {expected} items"
        )));
    }
    Ok(())
}

//! Handler and fan-out counters.
//!
//! Every counter is a relaxed [`AtomicU64`]; handlers only ever add to them.
//! The metric structs are injected into the handler context so tests can
//! assert on exactly which counters moved.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic event counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Add one
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

macro_rules! counters {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $($(#[$field_meta:meta])* $field:ident,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $($(#[$field_meta])* pub $field: Counter,)*
        }

        impl $name {
            /// Counter names with their current values
            #[must_use]
            pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
                vec![$((stringify!($field), self.$field.get()),)*]
            }
        }
    };
}

counters! {
    /// Session update handler counters
    pub struct SessionUpdateMetrics {
        /// Packets handled
        invocations,
        /// Packet failed to decode
        read_packet_failure,
        /// Unknown buyer
        buyer_not_found,
        /// Buyer is not live
        buyer_not_live,
        /// Packet signature did not verify
        signature_check_failed,
        /// Client stopped answering pings
        client_ping_timed_out,
        /// Route matrix is too old
        stale_route_matrix,
        /// Unknown datacenter
        unknown_datacenter,
        /// Buyer alias points at a missing datacenter
        datacenter_misconfigured_alias,
        /// Datacenter not enabled for the buyer
        datacenter_not_enabled,
        /// Client IP could not be located
        client_locate_failure,
        /// Session data blob failed to decode
        read_session_data_failure,
        /// Session id did not match the session data
        bad_session_id,
        /// Slice number did not match the session data
        bad_slice_number,
        /// Fallback: bad route token
        fallback_bad_route_token,
        /// Fallback: no next route to continue
        fallback_no_next_route_to_continue,
        /// Fallback: previous update still pending
        fallback_previous_update_still_pending,
        /// Fallback: bad continue token
        fallback_bad_continue_token,
        /// Fallback: route expired
        fallback_route_expired,
        /// Fallback: route request timed out
        fallback_route_request_timed_out,
        /// Fallback: continue request timed out
        fallback_continue_request_timed_out,
        /// Fallback: client timed out
        fallback_client_timed_out,
        /// Fallback: upgrade response timed out
        fallback_upgrade_response_timed_out,
        /// Fallback: route update timed out
        fallback_route_update_timed_out,
        /// Fallback: direct pong timed out
        fallback_direct_pong_timed_out,
        /// Fallback: next pong timed out
        fallback_next_pong_timed_out,
        /// Fallback with no reason flag set
        fallback_unknown_reason,
        /// Datacenter has no relays
        no_relays_in_datacenter,
        /// No near relays found on slice 0
        near_relays_locate_failure,
        /// Session on next but no route relays stored
        next_without_route_relays,
        /// SDK dropped the relay route on its own
        sdk_aborted,
        /// Route relays left the matrix or could not be resolved
        route_does_not_exist,
        /// Moved to a different relay route
        route_switched,
        /// Left next: no route
        no_route,
        /// Left next: multipath overload
        multipath_overload,
        /// Left next: repeated mispredicts
        mispredict_veto,
        /// Left next: latency worse than direct
        latency_worse,
        /// Session data failed to encode
        write_session_data_failure,
        /// Response failed to encode
        write_response_failure,
        /// Slices answered direct
        direct_slices,
        /// Slices answered with a relay route
        next_slices,
    }
}

counters! {
    /// Server init handler counters
    pub struct ServerInitMetrics {
        /// Packets handled
        invocations,
        /// Packet failed to decode
        read_packet_failure,
        /// Unknown buyer
        buyer_not_found,
        /// Buyer is not live
        buyer_not_active,
        /// SDK below the minimum version
        old_sdk_version,
        /// Packet signature did not verify
        signature_check_failed,
        /// Datacenter unknown; init still succeeds
        datacenter_not_found,
        /// Datacenter not enabled for the buyer
        datacenter_not_enabled,
    }
}

counters! {
    /// Server update handler counters
    pub struct ServerUpdateMetrics {
        /// Packets handled
        invocations,
        /// Packet failed to decode
        read_packet_failure,
        /// Unknown buyer
        buyer_not_found,
        /// Buyer is not live
        buyer_not_live,
        /// Packet signature did not verify
        signature_check_failed,
        /// SDK below the minimum version
        sdk_too_old,
        /// Datacenter unknown
        datacenter_not_found,
    }
}

counters! {
    /// Post-session fan-out counters
    pub struct PostSessionMetrics {
        /// Billing entries queued
        billing_entries_sent,
        /// Billing entries dropped on a full queue
        billing_buffer_full,
        /// Billing entries handed to the biller
        billing_entries_finished,
        /// Biller failures
        billing_failure,
        /// Session counts queued
        portal_counts_sent,
        /// Session counts dropped on a full queue
        portal_counts_buffer_full,
        /// Session portal data queued
        portal_data_sent,
        /// Session portal data dropped on a full queue
        portal_data_buffer_full,
        /// Portal messages published
        portal_entries_finished,
        /// Portal messages that exhausted every publisher
        portal_failure,
        /// Match data entries queued
        match_data_sent,
        /// Match data entries dropped on a full queue
        match_data_buffer_full,
        /// Match data entries handed to the matcher
        match_data_finished,
        /// Matcher failures
        match_data_failure,
    }
}

/// All counters the backend keeps
#[derive(Debug, Default)]
pub struct Metrics {
    /// Session update
    pub session_update: SessionUpdateMetrics,
    /// Server init
    pub server_init: ServerInitMetrics,
    /// Server update
    pub server_update: ServerUpdateMetrics,
    /// Post-session fan-out, shared with its worker tasks
    pub post_session: Arc<PostSessionMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::default();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_snapshot_names() {
        let metrics = ServerInitMetrics::default();
        metrics.old_sdk_version.inc();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), 8);
        assert!(snapshot.contains(&("old_sdk_version", 1)));
        assert!(snapshot.contains(&("invocations", 0)));
    }
}

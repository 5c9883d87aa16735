//! Route decisions over the route matrix.
//!
//! [`RouteDecider`] is the seam the session update handler calls through.
//! [`LowestCostDecider`] is the stock implementation: it applies the buyer's
//! route shader and internal config to decide whether a session should take
//! a relay route, stay on it, switch or fall back to direct. Every decision
//! is deterministic; among candidates within the selection threshold the
//! cheapest wins.

use std::fmt::Write as _;

use super::matrix::{RouteMatrix, route_hash, tri_matrix_index};
use super::model::{InternalConfig, RouteShader};
use super::{RouteState, UNROUTABLE_COST};
use crate::{COST_BIAS, MAX_RELAYS_PER_ROUTE};

/// Source cost used when a route's first relay is not a near relay
const UNKNOWN_SOURCE_COST: i32 = 1000;

/// Slices of bad behavior tolerated before leaving a route
const STRIKES: u32 = 3;

/// Slices try-before-you-buy waits for an improvement
const COMMIT_SLICES: i32 = 3;

/// Next RTT above prediction by this much counts as a mispredict
const MISPREDICT_MARGIN: i32 = 10;

/// A relay route in matrix index space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteSelection {
    /// Predicted RTT including the cost bias
    pub cost: i32,
    num_relays: usize,
    relays: [i32; MAX_RELAYS_PER_ROUTE],
}

impl RouteSelection {
    /// Build a selection from relay indices; extra relays are dropped.
    #[must_use]
    pub fn new(cost: i32, relays: &[i32]) -> Self {
        let num_relays = relays.len().min(MAX_RELAYS_PER_ROUTE);
        let mut out = [0; MAX_RELAYS_PER_ROUTE];
        out[..num_relays].copy_from_slice(&relays[..num_relays]);
        Self { cost, num_relays, relays: out }
    }

    /// Relay indices from client side to server side
    #[must_use]
    pub fn relays(&self) -> &[i32] {
        &self.relays[..self.num_relays]
    }

    /// Number of relays on the route
    #[must_use]
    pub fn num_relays(&self) -> usize {
        self.num_relays
    }

    /// Whether the route has no relays
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_relays == 0
    }
}

/// Outcome of [`RouteDecider::take_network_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeDecision {
    /// Stay on the public internet
    Direct,
    /// Take this relay route
    Take(RouteSelection),
}

/// Outcome of [`RouteDecider::stay_on_network_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StayDecision {
    /// Leave the relay route; the reason is latched in [`RouteState`]
    Leave,
    /// Keep the current route
    Hold(RouteSelection),
    /// Move to a different route
    Switch(RouteSelection),
}

/// Per-slice measurements and configuration a decision works from
#[derive(Debug, Clone, Copy)]
pub struct RouteInputs<'a> {
    /// Current route matrix
    pub matrix: &'a RouteMatrix,
    /// Buyer route shader for this slice
    pub route_shader: &'a RouteShader,
    /// Buyer internal tuning
    pub internal: &'a InternalConfig,
    /// User is barred from multipath
    pub multipath_vetoed: bool,
    /// Direct RTT in milliseconds
    pub direct_latency: i32,
    /// Relay route RTT in milliseconds
    pub next_latency: i32,
    /// RTT predicted for the route on the previous slice
    pub predicted_latency: i32,
    /// Direct packet loss percentage
    pub direct_packet_loss: f32,
    /// Relay route packet loss percentage
    pub next_packet_loss: f32,
    /// Near relay indices
    pub source_relays: &'a [i32],
    /// Cost to reach each near relay; 255 marks it unroutable
    pub source_relay_cost: &'a [i32],
    /// Relay indices in the destination datacenter
    pub dest_relays: &'a [i32],
}

impl RouteInputs<'_> {
    fn sanitized_source_costs(&self) -> Vec<i32> {
        self.source_relay_cost
            .iter()
            .map(|cost| if *cost <= 0 { UNROUTABLE_COST } else { *cost })
            .collect()
    }
}

/// Route decision capability consumed by the session update handler
pub trait RouteDecider: Send + Sync {
    /// Decide whether a direct session should move onto a relay route.
    ///
    /// Updates `state` with the reasons for the decision and appends a
    /// narrative to `debug` when present.
    fn take_network_next(
        &self,
        inputs: &RouteInputs<'_>,
        state: &mut RouteState,
        debug: &mut Option<String>,
    ) -> TakeDecision;

    /// Decide whether a session on `current` should stay, switch or leave.
    ///
    /// Leaving clears `state.next` and latches `state.veto`.
    fn stay_on_network_next(
        &self,
        inputs: &RouteInputs<'_>,
        current: &RouteSelection,
        state: &mut RouteState,
        debug: &mut Option<String>,
    ) -> StayDecision;

    /// Map a route's relay ids to current matrix indices.
    fn reframe_route(
        &self,
        state: &mut RouteState,
        matrix: &RouteMatrix,
        relay_ids: &[u64],
    ) -> Option<RouteSelection> {
        reframe_route(state, matrix, relay_ids)
    }
}

/// Map relay ids onto the current matrix.
///
/// Sets `relay_went_away` when any relay is missing and clears it otherwise.
pub fn reframe_route(
    state: &mut RouteState,
    matrix: &RouteMatrix,
    relay_ids: &[u64],
) -> Option<RouteSelection> {
    let mut relays = Vec::with_capacity(relay_ids.len());
    for id in relay_ids {
        let Some(index) = matrix.relay_index(*id) else {
            state.relay_went_away = true;
            return None;
        };
        relays.push(index);
    }
    state.relay_went_away = false;
    Some(RouteSelection::new(0, &relays))
}

/// Cost of reaching a near relay from its reported RTT and packet loss.
#[must_use]
pub fn near_relay_cost(rtt: i32, packet_loss: i32) -> i32 {
    if packet_loss > 0 || rtt <= 0 {
        UNROUTABLE_COST
    } else {
        rtt.min(UNROUTABLE_COST)
    }
}

/// Near relay indices and their costs for a decision.
///
/// The cost of a near relay is its reported RTT. Relays that reported packet
/// loss or a non-positive RTT cost [`UNROUTABLE_COST`]. Relays missing from the
/// matrix are left out.
#[must_use]
pub fn reframe_near_relays(
    matrix: &RouteMatrix,
    relay_ids: &[u64],
    relay_rtt: &[i32],
    relay_packet_loss: &[i32],
) -> (Vec<i32>, Vec<i32>) {
    let mut relays = Vec::with_capacity(relay_ids.len());
    let mut costs = Vec::with_capacity(relay_ids.len());
    for (i, id) in relay_ids.iter().enumerate() {
        let Some(index) = matrix.relay_index(*id) else {
            continue;
        };
        let rtt = relay_rtt.get(i).copied().unwrap_or(0);
        let packet_loss = relay_packet_loss.get(i).copied().unwrap_or(0);
        relays.push(index);
        costs.push(near_relay_cost(rtt, packet_loss));
    }
    (relays, costs)
}

fn debug_line(debug: &mut Option<String>, line: std::fmt::Arguments<'_>) {
    if let Some(out) = debug.as_mut() {
        let _ = out.write_fmt(line);
        out.push('\n');
    }
}

/// Lowest best-route cost over all source and destination pairs.
///
/// Returns `i32::MAX` when no pair has a route.
#[must_use]
pub fn best_route_cost(
    matrix: &RouteMatrix,
    source_relays: &[i32],
    source_relay_cost: &[i32],
    dest_relays: &[i32],
) -> i32 {
    let mut best = i32::MAX;
    for (source, source_cost) in source_relays.iter().zip(source_relay_cost) {
        if *source_cost >= UNROUTABLE_COST {
            continue;
        }
        for dest in dest_relays {
            let Some(entry) = matrix.entry(*source, *dest) else {
                continue;
            };
            if entry.num_routes > 0 {
                best = best.min(source_cost + entry.route_cost[0]);
            }
        }
    }
    if best == i32::MAX { best } else { best + COST_BIAS }
}

/// Cost of an existing route in the current matrix, if it still exists.
#[must_use]
pub fn current_route_cost(
    matrix: &RouteMatrix,
    route: &[i32],
    source_relays: &[i32],
    source_relay_cost: &[i32],
    debug: &mut Option<String>,
) -> Option<i32> {
    let (Some(first), Some(last)) = (route.first(), route.last()) else {
        return None;
    };
    if matrix.route_entries().is_empty() {
        debug_line(debug, format_args!("route matrix is empty"));
        return None;
    }

    let source_cost = source_relays
        .iter()
        .position(|relay| relay == first)
        .map_or(UNKNOWN_SOURCE_COST, |i| source_relay_cost[i]);
    if source_cost >= UNROUTABLE_COST {
        debug_line(debug, format_args!("source relay for route is no longer routable"));
        return None;
    }

    if first == last {
        debug_line(debug, format_args!("source and dest relays are the same"));
        return None;
    }

    let oriented: Vec<i32> = if first < last {
        route.iter().rev().copied().collect()
    } else {
        route.to_vec()
    };
    let hash = route_hash(&oriented);

    let entry = matrix.entry(*first, *last)?;
    for k in 0..entry.num_routes {
        if entry.route_hash[k] == hash && entry.route_num_relays[k] == oriented.len() {
            return Some(source_cost + entry.route_cost[k] + COST_BIAS);
        }
    }

    debug_line(debug, format_args!("could not find route"));
    None
}

/// Routes found within a cost window
struct Candidates {
    best: Option<RouteSelection>,
    diversity: i32,
}

fn lowest_cost_route(
    matrix: &RouteMatrix,
    source_relays: &[i32],
    source_relay_cost: &[i32],
    dest_relays: &[i32],
    max_cost: i32,
) -> Candidates {
    let mut best: Option<RouteSelection> = None;
    let mut diversity = 0;

    for (source, source_cost) in source_relays.iter().zip(source_relay_cost) {
        if *source_cost >= UNROUTABLE_COST {
            continue;
        }
        let mut contributed = false;
        for dest in dest_relays {
            let Some(entry) = matrix.entry(*source, *dest) else {
                continue;
            };
            for k in 0..entry.num_routes {
                let cost = entry.route_cost[k] + source_cost;
                if cost > max_cost {
                    break;
                }
                contributed = true;
                if best.is_none_or(|b| cost + COST_BIAS < b.cost) {
                    let relays = entry.relays(k);
                    // entries run from the higher index to the lower one
                    let selection = if source < dest {
                        let reversed: Vec<i32> = relays.iter().rev().copied().collect();
                        RouteSelection::new(cost + COST_BIAS, &reversed)
                    } else {
                        RouteSelection::new(cost + COST_BIAS, relays)
                    };
                    best = Some(selection);
                }
            }
        }
        if contributed {
            diversity += 1;
        }
    }

    Candidates { best, diversity }
}

/// Best route no costlier than `max_cost`, with the route diversity seen.
///
/// A `max_cost` of -1 disables relay routes.
fn best_route(
    inputs: &RouteInputs<'_>,
    source_relay_cost: &[i32],
    max_cost: i32,
    debug: &mut Option<String>,
) -> (Option<RouteSelection>, i32) {
    if max_cost == -1 {
        return (None, 0);
    }

    let best_cost = best_route_cost(
        inputs.matrix,
        inputs.source_relays,
        source_relay_cost,
        inputs.dest_relays,
    );
    debug_line(debug, format_args!("best route cost is {best_cost}"));
    if best_cost > max_cost {
        debug_line(debug, format_args!("could not find any next route <= max cost {max_cost}"));
        return (None, 0);
    }

    let window = best_cost.saturating_add(inputs.internal.route_select_threshold);
    let candidates = lowest_cost_route(
        inputs.matrix,
        inputs.source_relays,
        source_relay_cost,
        inputs.dest_relays,
        window,
    );
    if candidates.best.is_none() {
        debug_line(debug, format_args!("could not find any next routes"));
    }
    (candidates.best, candidates.diversity)
}

/// Deterministic lowest-cost route decisions
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestCostDecider;

impl LowestCostDecider {
    /// Create a decider
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn early_out_direct(shader: &RouteShader, state: &mut RouteState) -> bool {
        if state.vetoed() {
            return true;
        }

        if shader.disable_network_next {
            state.disabled = true;
            return true;
        }

        let selection_percent = u64::try_from(shader.selection_percent).unwrap_or(0);
        if selection_percent == 0 || state.user_id % 100 > selection_percent {
            state.not_selected = true;
            return true;
        }

        if shader.ab_test {
            state.ab_test = true;
            if state.user_id % 2 == 1 {
                state.b = true;
                return true;
            }
            state.a = true;
        }

        if shader.banned_users.contains(&state.user_id) {
            state.banned = true;
            return true;
        }

        false
    }

    /// Returns false when the uncommitted route should be abandoned
    fn try_before_you_buy(inputs: &RouteInputs<'_>, state: &mut RouteState) -> bool {
        let internal = inputs.internal;
        if !internal.try_before_you_buy || state.committed {
            return true;
        }

        state.commit_counter += 1;
        if state.commit_counter > COMMIT_SLICES {
            state.commit_veto = true;
            return false;
        }

        let packet_loss_ok = inputs.next_packet_loss <= inputs.direct_packet_loss;
        let latency_target = if state.reduce_packet_loss {
            inputs.direct_latency - internal.rtt_veto_packet_loss
        } else {
            inputs.direct_latency
        };
        if inputs.next_latency <= latency_target && packet_loss_ok {
            state.committed = true;
        }
        true
    }

    fn stay(
        &self,
        inputs: &RouteInputs<'_>,
        current: &RouteSelection,
        state: &mut RouteState,
        debug: &mut Option<String>,
    ) -> StayDecision {
        if Self::early_out_direct(inputs.route_shader, state) {
            return StayDecision::Leave;
        }

        let internal = inputs.internal;
        let source_relay_cost = inputs.sanitized_source_costs();

        if inputs.predicted_latency > 0
            && inputs.next_latency >= inputs.predicted_latency + MISPREDICT_MARGIN
        {
            state.mispredict_counter += 1;
            if state.mispredict_counter == STRIKES {
                debug_line(
                    debug,
                    format_args!(
                        "mispredict: next rtt = {}, predicted rtt = {}",
                        inputs.next_latency, inputs.predicted_latency
                    ),
                );
                state.mispredict = true;
                return StayDecision::Leave;
            }
        } else {
            state.mispredict_counter = 0;
        }

        if state.multipath && inputs.direct_latency >= internal.multipath_overload_threshold {
            debug_line(
                debug,
                format_args!(
                    "multipath overload: direct rtt = {} > threshold {}",
                    inputs.direct_latency, internal.multipath_overload_threshold
                ),
            );
            state.multipath_overload = true;
            return StayDecision::Leave;
        }

        let mut max_cost = i32::MAX;
        if !internal.force_next {
            let rtt_veto = if state.multipath {
                internal.rtt_veto_multipath
            } else if state.reduce_packet_loss {
                internal.rtt_veto_packet_loss
            } else {
                internal.rtt_veto_default
            };

            let worse = inputs.next_latency > inputs.direct_latency - rtt_veto;
            if state.committed {
                if !state.multipath && worse {
                    debug_line(
                        debug,
                        format_args!(
                            "aborting route because we made latency worse: next rtt = {}, direct rtt = {}",
                            inputs.next_latency, inputs.direct_latency
                        ),
                    );
                    state.latency_worse = true;
                    return StayDecision::Leave;
                }
                if state.multipath {
                    if worse {
                        state.latency_worse_counter += 1;
                        if state.latency_worse_counter == STRIKES {
                            debug_line(
                                debug,
                                format_args!("aborting route because we made latency worse 3X"),
                            );
                            state.latency_worse = true;
                            return StayDecision::Leave;
                        }
                    } else {
                        state.latency_worse_counter = 0;
                    }
                }
            }

            max_cost = inputs.direct_latency - rtt_veto;
        }

        let current_cost = current_route_cost(
            inputs.matrix,
            current.relays(),
            inputs.source_relays,
            &source_relay_cost,
            debug,
        );

        let (updated, switched) = match current_cost {
            None => {
                debug_line(debug, format_args!("current route no longer exists"));
                state.route_lost = true;
                (best_route(inputs, &source_relay_cost, max_cost, debug).0, true)
            }
            Some(current_cost) => {
                state.route_lost = false;
                let best_cost = best_route_cost(
                    inputs.matrix,
                    inputs.source_relays,
                    &source_relay_cost,
                    inputs.dest_relays,
                );
                if current_cost > best_cost.saturating_add(internal.route_switch_threshold) {
                    debug_line(
                        debug,
                        format_args!(
                            "current route cost {current_cost} not within switch threshold of best route cost {best_cost}"
                        ),
                    );
                    (best_route(inputs, &source_relay_cost, best_cost, debug).0, true)
                } else {
                    (Some(RouteSelection::new(current_cost, current.relays())), false)
                }
            }
        };

        let Some(updated) = updated.filter(|route| !route.is_empty()) else {
            debug_line(debug, format_args!("no suitable next route remains"));
            state.no_route = true;
            return StayDecision::Leave;
        };

        if updated.cost > internal.max_rtt {
            debug_line(
                debug,
                format_args!(
                    "next latency is too high. next rtt = {}, threshold = {}",
                    updated.cost, internal.max_rtt
                ),
            );
            state.next_latency_too_high = true;
            return StayDecision::Leave;
        }

        if !Self::try_before_you_buy(inputs, state) {
            debug_line(debug, format_args!("try before you buy vetoed the session"));
            return StayDecision::Leave;
        }

        if debug.is_some() {
            let names = inputs.matrix.relay_names();
            let route: Vec<&str> = updated
                .relays()
                .iter()
                .filter_map(|i| usize::try_from(*i).ok().and_then(|i| names.get(i)))
                .map(String::as_str)
                .collect();
            debug_line(debug, format_args!("{}", route.join(" - ")));
        }

        if switched {
            StayDecision::Switch(updated)
        } else {
            StayDecision::Hold(updated)
        }
    }
}

impl RouteDecider for LowestCostDecider {
    fn take_network_next(
        &self,
        inputs: &RouteInputs<'_>,
        state: &mut RouteState,
        debug: &mut Option<String>,
    ) -> TakeDecision {
        if Self::early_out_direct(inputs.route_shader, state) {
            return TakeDecision::Direct;
        }

        let shader = inputs.route_shader;
        let internal = inputs.internal;
        let direct = inputs.direct_latency;
        let source_relay_cost = inputs.sanitized_source_costs();

        let mut max_cost = direct;

        let mut reduce_latency = false;
        if shader.reduce_latency {
            if direct > shader.acceptable_latency {
                debug_line(debug, format_args!("try to reduce latency"));
                max_cost = direct - (shader.latency_threshold + internal.route_select_threshold);
                reduce_latency = true;
            } else {
                debug_line(
                    debug,
                    format_args!("direct latency is already acceptable. direct latency = {direct}"),
                );
                max_cost = -1;
            }
        }

        let mut reduce_packet_loss = false;
        if shader.reduce_packet_loss && inputs.direct_packet_loss > shader.acceptable_packet_loss {
            debug_line(debug, format_args!("try to reduce packet loss"));
            max_cost = direct + internal.max_latency_trade_off - internal.route_select_threshold;
            reduce_packet_loss = true;
        }

        state.multipath_restricted = inputs.multipath_vetoed;

        let mut pro_mode = false;
        if shader.pro_mode && !state.multipath_restricted {
            debug_line(debug, format_args!("pro mode"));
            max_cost = direct + internal.max_latency_trade_off - internal.route_select_threshold;
            pro_mode = true;
            reduce_latency = false;
            reduce_packet_loss = false;
        }

        if internal.force_next {
            debug_line(debug, format_args!("forcing network next"));
            max_cost = i32::MAX;
            state.forced_next = true;
        }

        let (route, diversity) = best_route(inputs, &source_relay_cost, max_cost, debug);

        if diversity < internal.route_diversity {
            debug_line(
                debug,
                format_args!(
                    "not enough route diversity. {diversity} < {}",
                    internal.route_diversity
                ),
            );
            state.lack_of_diversity = true;
            return TakeDecision::Direct;
        }

        let Some(route) = route else {
            debug_line(debug, format_args!("no next route available within parameters"));
            return TakeDecision::Direct;
        };

        if route.cost > internal.max_rtt {
            debug_line(
                debug,
                format_args!("best route is higher than max rtt {}", internal.max_rtt),
            );
            return TakeDecision::Direct;
        }

        let mut multipath = (pro_mode || shader.multipath) && !state.multipath_restricted;
        if internal.multipath_threshold > 0 && direct - route.cost > internal.multipath_threshold {
            multipath = false;
        }

        state.next = true;
        state.reduce_latency = reduce_latency;
        state.reduce_packet_loss = reduce_packet_loss;
        state.pro_mode = pro_mode;
        state.multipath = multipath;
        state.committed = !internal.uncommitted && (!internal.try_before_you_buy || multipath);

        TakeDecision::Take(route)
    }

    fn stay_on_network_next(
        &self,
        inputs: &RouteInputs<'_>,
        current: &RouteSelection,
        state: &mut RouteState,
        debug: &mut Option<String>,
    ) -> StayDecision {
        let decision = self.stay(inputs, current, state, debug);
        if state.next && decision == StayDecision::Leave {
            state.next = false;
            state.veto = true;
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::matrix::MatrixRelay;
    use std::net::SocketAddr;

    // relays 0,1 are near the client; 2,3 sit in the destination datacenter
    fn matrix() -> RouteMatrix {
        let relays = (0..4)
            .map(|i| MatrixRelay {
                id: 100 + i,
                addr: SocketAddr::from(([10, 0, 0, i as u8], 40000)),
                name: format!("relay.{i}"),
                latitude: 0.0,
                longitude: i as f32,
                datacenter_id: if i < 2 { 1 } else { 2 },
            })
            .collect();
        let mut matrix = RouteMatrix::new(relays, 0);
        matrix.add_route(20, &[0, 2]);
        matrix.add_route(25, &[0, 1, 2]);
        matrix.add_route(40, &[1, 3]);
        matrix
    }

    fn shader() -> RouteShader {
        RouteShader { selection_percent: 100, ..RouteShader::default() }
    }

    fn inputs<'a>(
        matrix: &'a RouteMatrix,
        shader: &'a RouteShader,
        internal: &'a InternalConfig,
        costs: &'a [i32],
    ) -> RouteInputs<'a> {
        RouteInputs {
            matrix,
            route_shader: shader,
            internal,
            multipath_vetoed: false,
            direct_latency: 100,
            next_latency: 40,
            predicted_latency: 0,
            direct_packet_loss: 0.0,
            next_packet_loss: 0.0,
            source_relays: &[0, 1],
            source_relay_cost: costs,
            dest_relays: &[2, 3],
        }
    }

    #[test]
    fn test_best_route_cost() {
        let m = matrix();
        assert_eq!(best_route_cost(&m, &[0, 1], &[10, 5], &[2, 3]), 30 + COST_BIAS);
        assert_eq!(best_route_cost(&m, &[0, 1], &[255, 255], &[2, 3]), i32::MAX);
    }

    #[test]
    fn test_current_route_cost() {
        let m = matrix();
        let mut debug = None;
        assert_eq!(
            current_route_cost(&m, &[0, 1, 2], &[0, 1], &[10, 5], &mut debug),
            Some(10 + 25 + COST_BIAS)
        );
        assert_eq!(current_route_cost(&m, &[0, 3], &[0, 1], &[10, 5], &mut debug), None);
        assert_eq!(current_route_cost(&m, &[0, 2], &[0, 1], &[255, 5], &mut debug), None);
    }

    #[test]
    fn test_take_picks_lowest_cost() {
        let m = matrix();
        let s = shader();
        let internal = InternalConfig::default();
        let costs = [10, 5];
        let mut state = RouteState { user_id: 4, ..RouteState::default() };
        let mut debug = Some(String::new());

        let decision = LowestCostDecider.take_network_next(
            &inputs(&m, &s, &internal, &costs),
            &mut state,
            &mut debug,
        );
        let TakeDecision::Take(route) = decision else {
            panic!("expected a route, got {decision:?}");
        };
        assert_eq!(route.relays(), &[0, 2]);
        assert_eq!(route.cost, 30 + COST_BIAS);
        assert!(state.next);
        assert!(debug.unwrap().contains("best route cost"));
    }

    #[test]
    fn test_take_early_out() {
        let m = matrix();
        let internal = InternalConfig::default();
        let costs = [10, 5];

        let disabled = RouteShader { disable_network_next: true, ..shader() };
        let mut state = RouteState::default();
        let d = LowestCostDecider.take_network_next(
            &inputs(&m, &disabled, &internal, &costs),
            &mut state,
            &mut None,
        );
        assert_eq!(d, TakeDecision::Direct);
        assert!(state.disabled);

        let ab = RouteShader { ab_test: true, ..shader() };
        let mut state = RouteState { user_id: 3, ..RouteState::default() };
        LowestCostDecider.take_network_next(&inputs(&m, &ab, &internal, &costs), &mut state, &mut None);
        assert!(state.ab_test && state.b && !state.next);

        let mut banned = shader();
        banned.banned_users.insert(8);
        let mut state = RouteState { user_id: 8, ..RouteState::default() };
        LowestCostDecider.take_network_next(
            &inputs(&m, &banned, &internal, &costs),
            &mut state,
            &mut None,
        );
        assert!(state.banned);

        let none = RouteShader { selection_percent: 0, ..shader() };
        let mut state = RouteState::default();
        LowestCostDecider.take_network_next(&inputs(&m, &none, &internal, &costs), &mut state, &mut None);
        assert!(state.not_selected);
    }

    #[test]
    fn test_take_acceptable_latency_stays_direct() {
        let m = matrix();
        let s = RouteShader { reduce_latency: true, acceptable_latency: 150, ..shader() };
        let internal = InternalConfig::default();
        let costs = [10, 5];
        let mut state = RouteState::default();
        let d = LowestCostDecider.take_network_next(
            &inputs(&m, &s, &internal, &costs),
            &mut state,
            &mut None,
        );
        assert_eq!(d, TakeDecision::Direct);
        assert!(!state.next);
    }

    #[test]
    fn test_take_force_next_and_diversity() {
        let m = matrix();
        let s = shader();
        let costs = [10, 5];

        let forced = InternalConfig { force_next: true, ..InternalConfig::default() };
        let mut i = inputs(&m, &s, &forced, &costs);
        i.direct_latency = 1;
        let mut state = RouteState::default();
        assert!(matches!(
            LowestCostDecider.take_network_next(&i, &mut state, &mut None),
            TakeDecision::Take(_)
        ));
        assert!(state.forced_next);

        let diverse = InternalConfig { route_diversity: 5, ..InternalConfig::default() };
        let mut state = RouteState::default();
        let d = LowestCostDecider.take_network_next(
            &inputs(&m, &s, &diverse, &costs),
            &mut state,
            &mut None,
        );
        assert_eq!(d, TakeDecision::Direct);
        assert!(state.lack_of_diversity);
    }

    #[test]
    fn test_stay_holds_current_route() {
        let m = matrix();
        let s = shader();
        let internal = InternalConfig::default();
        let costs = [10, 5];
        let mut state = RouteState { next: true, committed: true, ..RouteState::default() };
        let current = RouteSelection::new(0, &[0, 2]);

        let d = LowestCostDecider.stay_on_network_next(
            &inputs(&m, &s, &internal, &costs),
            &current,
            &mut state,
            &mut None,
        );
        assert_eq!(d, StayDecision::Hold(RouteSelection::new(30 + COST_BIAS, &[0, 2])));
        assert!(state.next);
    }

    #[test]
    fn test_stay_switches_when_route_lost() {
        let m = matrix();
        let s = shader();
        let internal = InternalConfig::default();
        let costs = [10, 5];
        let mut state = RouteState { next: true, committed: true, ..RouteState::default() };
        let current = RouteSelection::new(0, &[0, 3]);

        let d = LowestCostDecider.stay_on_network_next(
            &inputs(&m, &s, &internal, &costs),
            &current,
            &mut state,
            &mut None,
        );
        assert!(matches!(d, StayDecision::Switch(route) if route.relays() == [0, 2]));
        assert!(state.route_lost);
    }

    #[test]
    fn test_stay_leaves_when_latency_worse() {
        let m = matrix();
        let s = shader();
        let internal = InternalConfig::default();
        let costs = [10, 5];
        let mut state = RouteState { next: true, committed: true, ..RouteState::default() };
        let mut i = inputs(&m, &s, &internal, &costs);
        i.next_latency = 120;

        let d = LowestCostDecider.stay_on_network_next(
            &i,
            &RouteSelection::new(0, &[0, 2]),
            &mut state,
            &mut None,
        );
        assert_eq!(d, StayDecision::Leave);
        assert!(state.latency_worse);
        assert!(state.veto);
        assert!(!state.next);
    }

    #[test]
    fn test_stay_mispredict_three_strikes() {
        let m = matrix();
        let s = shader();
        let internal = InternalConfig::default();
        let costs = [10, 5];
        let mut state = RouteState { next: true, committed: true, ..RouteState::default() };
        let mut i = inputs(&m, &s, &internal, &costs);
        i.predicted_latency = 20;
        i.next_latency = 35;
        let current = RouteSelection::new(0, &[0, 2]);

        for _ in 0..2 {
            let d = LowestCostDecider.stay_on_network_next(&i, &current, &mut state, &mut None);
            assert!(matches!(d, StayDecision::Hold(_)));
        }
        let d = LowestCostDecider.stay_on_network_next(&i, &current, &mut state, &mut None);
        assert_eq!(d, StayDecision::Leave);
        assert!(state.mispredict);
    }

    #[test]
    fn test_stay_multipath_overload() {
        let m = matrix();
        let s = shader();
        let internal = InternalConfig::default();
        let costs = [10, 5];
        let mut state = RouteState {
            next: true,
            committed: true,
            multipath: true,
            ..RouteState::default()
        };
        let mut i = inputs(&m, &s, &internal, &costs);
        i.direct_latency = internal.multipath_overload_threshold;

        let d = LowestCostDecider.stay_on_network_next(
            &i,
            &RouteSelection::new(0, &[0, 2]),
            &mut state,
            &mut None,
        );
        assert_eq!(d, StayDecision::Leave);
        assert!(state.multipath_overload);
    }

    #[test]
    fn test_stay_no_route() {
        let m = matrix();
        let s = shader();
        let internal = InternalConfig::default();
        let costs = [255, 255];
        let mut state = RouteState { next: true, committed: true, ..RouteState::default() };

        let d = LowestCostDecider.stay_on_network_next(
            &inputs(&m, &s, &internal, &costs),
            &RouteSelection::new(0, &[0, 2]),
            &mut state,
            &mut None,
        );
        assert_eq!(d, StayDecision::Leave);
        assert!(state.no_route);
    }

    #[test]
    fn test_try_before_you_buy_commits_or_vetoes() {
        let m = matrix();
        let s = shader();
        let internal = InternalConfig { try_before_you_buy: true, ..InternalConfig::default() };
        let costs = [10, 5];
        let current = RouteSelection::new(0, &[0, 2]);

        let mut state = RouteState { next: true, ..RouteState::default() };
        LowestCostDecider.stay_on_network_next(
            &inputs(&m, &s, &internal, &costs),
            &current,
            &mut state,
            &mut None,
        );
        assert!(state.committed);

        let mut state = RouteState { next: true, ..RouteState::default() };
        let mut i = inputs(&m, &s, &internal, &costs);
        i.next_latency = 150;
        for _ in 0..3 {
            assert_ne!(
                LowestCostDecider.stay_on_network_next(&i, &current, &mut state, &mut None),
                StayDecision::Leave
            );
        }
        assert_eq!(
            LowestCostDecider.stay_on_network_next(&i, &current, &mut state, &mut None),
            StayDecision::Leave
        );
        assert!(state.commit_veto);
    }

    #[test]
    fn test_reframe_route() {
        let m = matrix();
        let mut state = RouteState::default();
        let route = reframe_route(&mut state, &m, &[100, 102]).unwrap();
        assert_eq!(route.relays(), &[0, 2]);
        assert!(!state.relay_went_away);

        assert!(reframe_route(&mut state, &m, &[100, 999]).is_none());
        assert!(state.relay_went_away);
    }

    #[test]
    fn test_reframe_near_relays() {
        let m = matrix();
        let (relays, costs) =
            reframe_near_relays(&m, &[100, 101, 555, 103], &[12, 30, 5, 0], &[0, 4, 0, 0]);
        assert_eq!(relays, vec![0, 1, 3]);
        assert_eq!(costs, vec![12, UNROUTABLE_COST, UNROUTABLE_COST]);
    }
}

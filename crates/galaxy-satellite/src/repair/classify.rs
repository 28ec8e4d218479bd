//! Segment piece classification.
//!
//! Each piece of a remote segment lands in one or more buckets depending on
//! the state of its node. The buckets drive the repair decision:
//!
//! - **missing**: the node is unknown or disqualified
//! - **exiting**: the node is gracefully exiting
//! - **clumped**: more than one piece shares a /24 subnet; all but one per
//!   subnet count as clumped
//! - **out_of_placement**: the node violates the segment's placement
//! - **retrievable**: the node is reachable (online and not in an excluded
//!   country)
//! - **healthy**: retrievable and in none of the bad buckets
//! - **forcing_repair**: buckets that mandate repair regardless of
//!   thresholds; placement violations do, clumping alone does not

use std::collections::{HashMap, HashSet};

use galaxy_core::{NodeId, PlacementConstraint};
use galaxy_metabase::Piece;

/// What the checker needs to know about a node.
#[derive(Debug, Clone, Default)]
pub struct NodeSummary {
    pub online: bool,
    pub disqualified: bool,
    pub exiting: bool,
    pub last_net: String,
    pub country_code: String,
}

#[derive(Debug, Default)]
pub struct PiecesCheck {
    pub missing: HashSet<u16>,
    pub exiting: HashSet<u16>,
    pub clumped: HashSet<u16>,
    pub out_of_placement: HashSet<u16>,
    pub retrievable: HashSet<u16>,
    pub healthy: HashSet<u16>,
    pub forcing_repair: HashSet<u16>,
}

#[derive(Debug, Clone)]
pub struct ClassifyOptions {
    pub do_declumping: bool,
    pub do_placement_check: bool,
    pub excluded_countries: HashSet<String>,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            do_declumping: true,
            do_placement_check: true,
            excluded_countries: HashSet::new(),
        }
    }
}

pub fn classify_pieces(
    pieces: &[Piece],
    nodes: &HashMap<NodeId, NodeSummary>,
    placement: PlacementConstraint,
    options: &ClassifyOptions,
) -> PiecesCheck {
    let mut check = PiecesCheck::default();
    let mut seen_nets: HashSet<&str> = HashSet::new();

    for piece in pieces {
        let number = piece.number;
        let Some(node) = nodes.get(&piece.storage_node) else {
            check.missing.insert(number);
            continue;
        };
        if node.disqualified {
            check.missing.insert(number);
            continue;
        }

        if node.exiting {
            check.exiting.insert(number);
        }

        if options.do_placement_check && !placement.allows(&node.country_code) {
            check.out_of_placement.insert(number);
            check.forcing_repair.insert(number);
        }

        if options.do_declumping && !node.last_net.is_empty() {
            if !seen_nets.insert(node.last_net.as_str()) {
                check.clumped.insert(number);
            }
        }

        let excluded_country = options
            .excluded_countries
            .contains(&node.country_code.to_ascii_uppercase());
        if node.online && !excluded_country {
            check.retrievable.insert(number);
        }
    }

    for number in &check.retrievable {
        if !check.exiting.contains(number)
            && !check.clumped.contains(number)
            && !check.out_of_placement.contains(number)
        {
            check.healthy.insert(*number);
        }
    }

    check
}

/// Repair priority for an injured segment: survival probability of keeping
/// at least `required` of `healthy` pieces when each node independently
/// fails with `failure_rate` per repair interval. Lower means worse. The
/// effective failure rate is floored at `1/total_nodes` so very small
/// networks do not report a deceptively perfect score.
pub fn segment_health(
    healthy: usize,
    required: usize,
    total_nodes: usize,
    failure_rate: f64,
) -> f64 {
    if healthy < required {
        return 0.0;
    }
    let p = failure_rate.max(1.0 / (total_nodes.max(1) as f64)).min(1.0);
    let n = healthy;
    let max_failures = n - required;

    // P(at most max_failures of n fail)
    let mut survival = 0.0;
    for i in 0..=max_failures {
        survival += binomial(n, i) * p.powi(i as i32) * (1.0 - p).powi((n - i) as i32);
    }
    survival
}

fn binomial(n: usize, k: usize) -> f64 {
    let k = k.min(n - k);
    let mut result = 1.0;
    for i in 0..k {
        result = result * (n - i) as f64 / (i + 1) as f64;
    }
    result
}

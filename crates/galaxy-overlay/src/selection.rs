//! Node selection for uploads and repair.
//!
//! Two modes:
//!
//! - **ByID**: uniform sample over candidate nodes.
//! - **BySubnet**: partition candidates by their /24 subnet, sample subnets
//!   uniformly, then pick one node at random inside each chosen subnet. A
//!   node alone in its subnet is picked with probability `k / |subnets|`
//!   regardless of how crowded the other subnets are, and a crowded subnet's
//!   aggregate probability equals that of any single subnet.
//!
//! Over-constrained filters return fewer nodes than requested; that is not
//! an error, the caller decides whether it can proceed.

use std::collections::{HashMap, HashSet};

use galaxy_core::{NodeId, PlacementConstraint};
use rand::seq::SliceRandom;

use crate::types::SelectedNode;

/// Filters applied before sampling.
#[derive(Debug, Clone, Default)]
pub struct NodeFilters {
    pub excluded_ids: HashSet<NodeId>,
    pub excluded_subnets: HashSet<String>,
    pub placement: PlacementConstraint,
    pub countries: Option<HashSet<String>>,
}

impl NodeFilters {
    pub fn with_excluded_ids(mut self, ids: impl IntoIterator<Item = NodeId>) -> Self {
        self.excluded_ids.extend(ids);
        self
    }

    pub fn with_excluded_subnets(
        mut self,
        subnets: impl IntoIterator<Item = String>,
    ) -> Self {
        self.excluded_subnets.extend(subnets);
        self
    }

    pub fn with_placement(mut self, placement: PlacementConstraint) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_country_filter(mut self, countries: impl IntoIterator<Item = String>) -> Self {
        self.countries = Some(
            countries
                .into_iter()
                .map(|c| c.to_ascii_uppercase())
                .collect(),
        );
        self
    }

    pub fn matches(&self, node: &SelectedNode) -> bool {
        if self.excluded_ids.contains(&node.id) {
            return false;
        }
        if self.excluded_subnets.contains(&node.last_net) {
            return false;
        }
        if !self.placement.allows(&node.country_code) {
            return false;
        }
        if let Some(countries) = &self.countries {
            if !countries.contains(&node.country_code.to_ascii_uppercase()) {
                return false;
            }
        }
        true
    }
}

/// Uniform-random sample without replacement.
pub struct SelectById {
    nodes: Vec<SelectedNode>,
}

impl SelectById {
    pub fn new(nodes: Vec<SelectedNode>) -> Self {
        Self { nodes }
    }

    pub fn select(&self, count: usize, filters: &NodeFilters) -> Vec<SelectedNode> {
        let mut rng = rand::thread_rng();
        let candidates: Vec<&SelectedNode> =
            self.nodes.iter().filter(|n| filters.matches(n)).collect();
        candidates
            .choose_multiple(&mut rng, count)
            .map(|n| (*n).clone())
            .collect()
    }
}

/// Subnet-partitioned sample: subnets first, then one node per subnet.
pub struct SelectBySubnet {
    by_subnet: HashMap<String, Vec<SelectedNode>>,
}

impl SelectBySubnet {
    pub fn new(nodes: Vec<SelectedNode>) -> Self {
        let mut by_subnet: HashMap<String, Vec<SelectedNode>> = HashMap::new();
        for node in nodes {
            by_subnet.entry(node.last_net.clone()).or_default().push(node);
        }
        Self { by_subnet }
    }

    pub fn select(&self, count: usize, filters: &NodeFilters) -> Vec<SelectedNode> {
        let mut rng = rand::thread_rng();

        // filter inside each subnet first so an excluded node does not drag
        // its whole subnet out of the draw
        let subnets: Vec<Vec<&SelectedNode>> = self
            .by_subnet
            .values()
            .map(|nodes| nodes.iter().filter(|n| filters.matches(n)).collect())
            .filter(|nodes: &Vec<&SelectedNode>| !nodes.is_empty())
            .collect();

        subnets
            .choose_multiple(&mut rng, count)
            .filter_map(|subnet| subnet.choose(&mut rng).map(|n| (*n).clone()))
            .collect()
    }
}

//! Dependency layering for steps and sub-queries.
//!
//! Both the phase executor and the query decomposer schedule work as a
//! sequence of layers: groups whose members are mutually independent and
//! whose dependencies all live in earlier layers. The executor tolerates
//! malformed graphs (cycles, references to nodes outside the set) by
//! emitting the unresolvable remainder as one final layer in declaration
//! order; the decomposer treats the same condition as an error.

use std::collections::HashSet;
use uuid::Uuid;

/// Anything with an id and a set of same-scope dependency ids.
pub trait DagNode {
    fn node_id(&self) -> Uuid;
    fn node_dependencies(&self) -> &[Uuid];
}

impl DagNode for crate::model::Step {
    fn node_id(&self) -> Uuid {
        self.id
    }
    fn node_dependencies(&self) -> &[Uuid] {
        &self.dependencies
    }
}

impl DagNode for crate::model::SubQuery {
    fn node_id(&self) -> Uuid {
        self.id
    }
    fn node_dependencies(&self) -> &[Uuid] {
        &self.dependencies
    }
}

/// Result of layering a node set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layering {
    /// Indices into the input slice, grouped into execution layers.
    pub layers: Vec<Vec<usize>>,
    /// True when the final layer was forced (cycle or foreign reference).
    pub recovered: bool,
}

/// Layer nodes by dependency order.
///
/// Maintains a completed set; each round collects every remaining node whose
/// dependencies are all completed. When no node qualifies but nodes remain,
/// the remainder becomes a single final layer in declaration order and
/// `recovered` is set.
pub fn layer<T: DagNode>(nodes: &[T]) -> Layering {
    let mut layers: Vec<Vec<usize>> = Vec::new();
    let mut completed: HashSet<Uuid> = HashSet::new();
    let mut remaining: Vec<usize> = (0..nodes.len()).collect();
    let mut recovered = false;

    while !remaining.is_empty() {
        let ready: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| {
                nodes[i]
                    .node_dependencies()
                    .iter()
                    .all(|dep| completed.contains(dep))
            })
            .collect();

        if ready.is_empty() {
            // Cycle or dependency outside the node set: best-effort recovery.
            layers.push(remaining.clone());
            recovered = true;
            break;
        }

        for &i in &ready {
            completed.insert(nodes[i].node_id());
        }
        remaining.retain(|i| !ready.contains(i));
        layers.push(ready);
    }

    Layering { layers, recovered }
}

/// Strict layering: errors instead of recovering. Used by the decomposer.
pub fn layer_strict<T: DagNode>(nodes: &[T]) -> Result<Vec<Vec<usize>>, CycleDetected> {
    let layering = layer(nodes);
    if layering.recovered {
        Err(CycleDetected)
    } else {
        Ok(layering.layers)
    }
}

/// Marker error for [`layer_strict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleDetected;

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        id: Uuid,
        deps: Vec<Uuid>,
    }

    impl DagNode for Node {
        fn node_id(&self) -> Uuid {
            self.id
        }
        fn node_dependencies(&self) -> &[Uuid] {
            &self.deps
        }
    }

    fn nodes(edges: &[&[usize]]) -> Vec<Node> {
        let ids: Vec<Uuid> = edges.iter().map(|_| Uuid::new_v4()).collect();
        edges
            .iter()
            .enumerate()
            .map(|(i, deps)| Node {
                id: ids[i],
                deps: deps.iter().map(|&d| ids[d]).collect(),
            })
            .collect()
    }

    #[test]
    fn independent_nodes_form_one_layer() {
        let ns = nodes(&[&[], &[], &[]]);
        let layering = layer(&ns);
        assert!(!layering.recovered);
        assert_eq!(layering.layers, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn linear_chain_forms_one_layer_each() {
        let ns = nodes(&[&[], &[0], &[1]]);
        let layering = layer(&ns);
        assert_eq!(layering.layers, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn diamond_forms_three_layers() {
        // 0 -> (1, 2) -> 3
        let ns = nodes(&[&[], &[0], &[0], &[1, 2]]);
        let layering = layer(&ns);
        assert_eq!(layering.layers.len(), 3);
        assert_eq!(layering.layers[0], vec![0]);
        assert_eq!(layering.layers[1], vec![1, 2]);
        assert_eq!(layering.layers[2], vec![3]);
    }

    #[test]
    fn every_dependency_lands_in_an_earlier_layer() {
        let ns = nodes(&[&[], &[0], &[0], &[1, 2], &[], &[3, 4]]);
        let layering = layer(&ns);
        assert!(!layering.recovered);

        // For each node, its dependencies must appear in a strictly earlier layer.
        let layer_of = |idx: usize| {
            layering
                .layers
                .iter()
                .position(|l| l.contains(&idx))
                .unwrap()
        };
        for (i, node) in ns.iter().enumerate() {
            for dep in node.node_dependencies() {
                let dep_idx = ns.iter().position(|n| n.node_id() == *dep).unwrap();
                assert!(layer_of(dep_idx) < layer_of(i));
            }
        }
    }

    #[test]
    fn cycle_recovers_into_single_final_layer() {
        // 0 <-> 1 cycle
        let ids = [Uuid::new_v4(), Uuid::new_v4()];
        let ns = vec![
            Node {
                id: ids[0],
                deps: vec![ids[1]],
            },
            Node {
                id: ids[1],
                deps: vec![ids[0]],
            },
        ];
        let layering = layer(&ns);
        assert!(layering.recovered);
        assert_eq!(layering.layers, vec![vec![0, 1]]);
    }

    #[test]
    fn cycle_after_valid_prefix_keeps_prefix_layers() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let ns = vec![
            Node {
                id: ids[0],
                deps: vec![],
            },
            Node {
                id: ids[1],
                deps: vec![ids[2]],
            },
            Node {
                id: ids[2],
                deps: vec![ids[1]],
            },
        ];
        let layering = layer(&ns);
        assert!(layering.recovered);
        assert_eq!(layering.layers, vec![vec![0], vec![1, 2]]);
    }

    #[test]
    fn foreign_reference_recovers() {
        let ns = vec![Node {
            id: Uuid::new_v4(),
            deps: vec![Uuid::new_v4()], // not in the set
        }];
        let layering = layer(&ns);
        assert!(layering.recovered);
        assert_eq!(layering.layers, vec![vec![0]]);
    }

    #[test]
    fn strict_layering_rejects_cycles() {
        let ids = [Uuid::new_v4(), Uuid::new_v4()];
        let ns = vec![
            Node {
                id: ids[0],
                deps: vec![ids[1]],
            },
            Node {
                id: ids[1],
                deps: vec![ids[0]],
            },
        ];
        assert_eq!(layer_strict(&ns), Err(CycleDetected));
    }

    #[test]
    fn empty_input_yields_no_layers() {
        let ns: Vec<Node> = vec![];
        let layering = layer(&ns);
        assert!(layering.layers.is_empty());
        assert!(!layering.recovered);
    }
}

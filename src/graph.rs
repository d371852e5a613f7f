//! Connected components over an association graph.
//!
//! Split checks model an event's sub-events as graph nodes with an edge
//! wherever the association predicate holds between two of them; each
//! connected component is one resulting event.

use std::collections::VecDeque;

/// Partition `nodes` into connected components under `associated`.
///
/// The predicate is treated as symmetric; an edge found in either direction
/// joins the pair. Component order follows the first node index each
/// contains, and nodes within a component keep input order, so output is
/// deterministic for a given input order.
pub fn connected_components<T, F>(nodes: Vec<T>, mut associated: F) -> Vec<Vec<T>>
where
    F: FnMut(&T, &T) -> bool,
{
    let n = nodes.len();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for j in (i + 1)..n {
            if associated(&nodes[i], &nodes[j]) || associated(&nodes[j], &nodes[i]) {
                adjacency[i].push(j);
                adjacency[j].push(i);
            }
        }
    }

    let mut component_of: Vec<Option<usize>> = vec![None; n];
    let mut components: Vec<Vec<usize>> = Vec::new();
    for start in 0..n {
        if component_of[start].is_some() {
            continue;
        }
        let component_index = components.len();
        let mut members = Vec::new();
        let mut queue = VecDeque::from([start]);
        component_of[start] = Some(component_index);
        while let Some(node) = queue.pop_front() {
            members.push(node);
            for &next in &adjacency[node] {
                if component_of[next].is_none() {
                    component_of[next] = Some(component_index);
                    queue.push_back(next);
                }
            }
        }
        members.sort_unstable();
        components.push(members);
    }

    // move nodes out in component order
    let mut slots: Vec<Option<T>> = nodes.into_iter().map(Some).collect();
    components
        .into_iter()
        .map(|members| {
            members
                .into_iter()
                .map(|i| slots[i].take().expect("node moved twice"))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_component_when_all_connected() {
        let components = connected_components(vec![1i32, 2, 3], |a, b| (a - b).abs() == 1);
        assert_eq!(components, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn splits_into_disconnected_groups() {
        // 1-2 connected, 10-11 connected, 20 alone
        let components =
            connected_components(vec![1i32, 2, 10, 11, 20], |a, b| (a - b).abs() == 1);
        assert_eq!(components, vec![vec![1, 2], vec![10, 11], vec![20]]);
    }

    #[test]
    fn transitive_connection_joins_a_chain() {
        // 1-2 and 2-3 edges join 1 and 3 despite no direct edge
        let components = connected_components(vec![1i32, 3, 2], |a, b| (a - b).abs() == 1);
        assert_eq!(components, vec![vec![1, 3, 2]]);
    }

    #[test]
    fn empty_input_yields_no_components() {
        let components = connected_components(Vec::<i32>::new(), |_, _| true);
        assert!(components.is_empty());
    }
}

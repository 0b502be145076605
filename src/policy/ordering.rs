// src/policy/ordering.rs

//! Dependency ordering of the install sequence
//!
//! The repair is a single stable pass over the selected products: each
//! direct dependency is moved (or inserted) in front of its dependent.
//! Orderings broken by an earlier move are not revisited.

use tracing::{debug, info};

/// Repair `sequence` so that direct dependencies precede their dependents
///
/// `dependencies` returns the product ids a product depends on. Dependents
/// are visited in their original order; dependencies missing from the
/// sequence are inserted, dependencies placed after their dependent are
/// moved to the dependent's position.
pub fn repair_dependency_order<F>(sequence: &[String], mut dependencies: F) -> Vec<String>
where
    F: FnMut(&str) -> Vec<String>,
{
    let mut repaired: Vec<String> = sequence.to_vec();

    for product_id in sequence {
        for dependency in dependencies(product_id) {
            if dependency == *product_id {
                continue;
            }
            let Some(ppos) = repaired.iter().position(|p| p == product_id) else {
                continue;
            };

            match repaired.iter().position(|p| *p == dependency) {
                None => {
                    info!(
                        "Inserting missing dependency '{}' of '{}' into install sequence",
                        dependency, product_id
                    );
                    repaired.insert(ppos, dependency);
                }
                Some(dpos) if dpos > ppos => {
                    debug!(
                        "Moving dependency '{}' in front of '{}' (position {} -> {})",
                        dependency, product_id, dpos, ppos
                    );
                    repaired.remove(dpos);
                    repaired.insert(ppos, dependency);
                }
                Some(_) => {}
            }
        }
    }

    repaired
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn deps(map: &[(&str, &[&str])]) -> impl FnMut(&str) -> Vec<String> {
        let map: HashMap<String, Vec<String>> = map
            .iter()
            .map(|(k, v)| (k.to_string(), ids(v)))
            .collect();
        move |id| map.get(id).cloned().unwrap_or_default()
    }

    #[test]
    fn test_missing_dependency_is_inserted() {
        let sequence = ids(&["a", "b"]);
        let repaired = repair_dependency_order(&sequence, deps(&[("b", &["c"])]));
        assert_eq!(repaired, ids(&["a", "c", "b"]));
    }

    #[test]
    fn test_late_dependency_is_moved() {
        let sequence = ids(&["app", "lib", "other"]);
        let repaired = repair_dependency_order(&sequence, deps(&[("app", &["lib"])]));
        assert_eq!(repaired, ids(&["lib", "app", "other"]));
    }

    #[test]
    fn test_satisfied_order_is_stable() {
        let sequence = ids(&["lib", "app", "other"]);
        let repaired = repair_dependency_order(&sequence, deps(&[("app", &["lib"])]));
        assert_eq!(repaired, sequence);
    }

    #[test]
    fn test_single_pass_direct_only() {
        // c depends on b, b depends on a; a arrives last
        let sequence = ids(&["c", "b", "a"]);
        let repaired = repair_dependency_order(&sequence, deps(&[("c", &["b"]), ("b", &["a"])]));
        assert_eq!(repaired, ids(&["a", "b", "c"]));

        // Inserted products are not visited, so c -> d stays unrepaired
        let sequence = ids(&["a", "b", "d"]);
        let repaired = repair_dependency_order(&sequence, deps(&[("b", &["c"]), ("c", &["d"])]));
        assert_eq!(repaired, ids(&["a", "c", "b", "d"]));
    }

    #[test]
    fn test_self_dependency_ignored() {
        let sequence = ids(&["a"]);
        let repaired = repair_dependency_order(&sequence, deps(&[("a", &["a"])]));
        assert_eq!(repaired, sequence);
    }
}

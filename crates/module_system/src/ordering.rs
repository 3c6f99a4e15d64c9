//! Dependency ordering of registered modules.
//!
//! Only required dependencies constrain the order. A module whose required
//! dependency is absent, or transitively depends on one that is, is reported
//! as [`ModuleError::MissingDependency`]; modules on a cycle are reported as
//! [`ModuleError::DependencyCycle`]. Both are detected before anything is
//! compiled.

use crate::error::ModuleError;
use crate::registry::ModuleRegistry;
use std::collections::{BTreeSet, HashMap};

/// Result of [`dependency_order`].
#[derive(Debug, Default)]
pub struct DependencyOrder {
    /// Identities that can be compiled, dependencies first.
    pub order: Vec<String>,
    /// Identities that cannot be compiled, with the reason.
    pub failures: Vec<(String, ModuleError)>,
}

/// Orders the registry so that every required dependency precedes its
/// dependents. Ties are broken by insertion order.
pub fn dependency_order(registry: &ModuleRegistry) -> DependencyOrder {
    let modules = registry.all();
    let position: HashMap<&str, usize> = modules
        .iter()
        .enumerate()
        .map(|(index, descriptor)| (descriptor.identity(), index))
        .collect();

    let mut result = DependencyOrder::default();
    let mut excluded = vec![false; modules.len()];

    // Missing dependencies, propagated until nothing changes.
    loop {
        let mut changed = false;
        for (index, descriptor) in modules.iter().enumerate() {
            if excluded[index] {
                continue;
            }
            let missing = descriptor.required_dependencies().iter().find(|dep| {
                position
                    .get(dep.as_str())
                    .map_or(true, |&dep_index| excluded[dep_index])
            });
            if let Some(dependency) = missing {
                excluded[index] = true;
                changed = true;
                result.failures.push((
                    descriptor.identity().to_string(),
                    ModuleError::MissingDependency {
                        identity: descriptor.identity().to_string(),
                        dependency: dependency.clone(),
                    },
                ));
            }
        }
        if !changed {
            break;
        }
    }

    // Kahn's algorithm over the remaining modules.
    let mut pending: Vec<usize> = vec![0; modules.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); modules.len()];
    for (index, descriptor) in modules.iter().enumerate() {
        if excluded[index] {
            continue;
        }
        for dependency in descriptor.required_dependencies() {
            let dep_index = position[dependency.as_str()];
            pending[index] += 1;
            dependents[dep_index].push(index);
        }
    }

    let mut ready: BTreeSet<usize> = (0..modules.len())
        .filter(|&index| !excluded[index] && pending[index] == 0)
        .collect();
    let mut placed = vec![false; modules.len()];
    while let Some(index) = ready.pop_first() {
        placed[index] = true;
        result.order.push(modules[index].identity().to_string());
        for &dependent in &dependents[index] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    // Whatever is left sits on or behind a cycle.
    let remaining: Vec<usize> = (0..modules.len())
        .filter(|&index| !excluded[index] && !placed[index])
        .collect();
    for &index in &remaining {
        let identity = modules[index].identity().to_string();
        let cycle = find_cycle(registry, &position, &remaining, index);
        let error = if cycle.first() == Some(&identity) {
            ModuleError::DependencyCycle { cycle }
        } else {
            let dependency = cycle.first().cloned().unwrap_or_default();
            ModuleError::MissingDependency {
                identity: identity.clone(),
                dependency,
            }
        };
        result.failures.push((identity, error));
    }

    result
}

/// Follows unplaced required dependencies from `start` until a module repeats.
///
/// Returns the cycle starting and ending at its entry point, rotated to start
/// at `start` when `start` lies on it.
fn find_cycle(
    registry: &ModuleRegistry,
    position: &HashMap<&str, usize>,
    remaining: &[usize],
    start: usize,
) -> Vec<String> {
    let modules = registry.all();
    let mut path: Vec<usize> = Vec::new();
    let mut current = start;

    loop {
        if let Some(seen) = path.iter().position(|&index| index == current) {
            let mut cycle: Vec<usize> = path[seen..].to_vec();
            if let Some(offset) = cycle.iter().position(|&index| index == start) {
                cycle.rotate_left(offset);
            }
            let mut names: Vec<String> = cycle
                .iter()
                .map(|&index| modules[index].identity().to_string())
                .collect();
            if let Some(first) = names.first().cloned() {
                names.push(first);
            }
            return names;
        }
        path.push(current);

        let next = modules[current]
            .required_dependencies()
            .iter()
            .filter_map(|dep| position.get(dep.as_str()).copied())
            .find(|dep_index| remaining.contains(dep_index));
        match next {
            Some(next) => current = next,
            None => return Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::extract;

    fn registry(modules: &[(&str, Vec<&str>)]) -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        for (identity, requires) in modules {
            let attr = if requires.is_empty() {
                String::new()
            } else {
                format!("#[require_module({})]", requires.join(", "))
            };
            let source = format!(
                "{attr} pub struct {identity}; impl ServerModule for {identity} {{}}"
            );
            registry
                .add(extract(source, format!("{}.rs", identity)).unwrap())
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_dependencies_come_first() {
        let registry = registry(&[("Shop", vec!["Bank", "Chat"]), ("Chat", vec![]), ("Bank", vec!["Chat"])]);
        let result = dependency_order(&registry);
        assert!(result.failures.is_empty());
        assert_eq!(result.order, vec!["Chat", "Bank", "Shop"]);
    }

    #[test]
    fn test_independent_modules_keep_insertion_order() {
        let registry = registry(&[("Zeta", vec![]), ("Alpha", vec![]), ("Mid", vec![])]);
        assert_eq!(dependency_order(&registry).order, vec!["Zeta", "Alpha", "Mid"]);
    }

    #[test]
    fn test_optional_dependencies_do_not_constrain_order() {
        let mut registry = ModuleRegistry::new();
        registry
            .add(
                extract(
                    "pub struct A { #[module_ref] pub B: ModuleRef } impl ServerModule for A {}",
                    "a.rs",
                )
                .unwrap(),
            )
            .unwrap();
        registry
            .add(extract("pub struct B; impl ServerModule for B {}", "b.rs").unwrap())
            .unwrap();
        assert_eq!(dependency_order(&registry).order, vec!["A", "B"]);
    }

    #[test]
    fn test_missing_dependency_propagates() {
        let registry = registry(&[("Shop", vec!["Bank"]), ("Bank", vec!["Vault"]), ("Chat", vec![])]);
        let result = dependency_order(&registry);
        assert_eq!(result.order, vec!["Chat"]);

        let failed: Vec<_> = result.failures.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(failed, vec!["Bank", "Shop"]);
        assert!(matches!(
            &result.failures[0].1,
            ModuleError::MissingDependency { dependency, .. } if dependency == "Vault"
        ));
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let registry = registry(&[("A", vec!["B"]), ("B", vec!["C"]), ("C", vec!["A"]), ("D", vec!["A"]), ("E", vec![])]);
        let result = dependency_order(&registry);
        assert_eq!(result.order, vec!["E"]);

        let by_id: HashMap<_, _> = result
            .failures
            .iter()
            .map(|(id, error)| (id.as_str(), error))
            .collect();
        assert!(matches!(
            by_id["A"],
            ModuleError::DependencyCycle { cycle } if cycle == &["A", "B", "C", "A"]
        ));
        assert!(matches!(
            by_id["B"],
            ModuleError::DependencyCycle { cycle } if cycle == &["B", "C", "A", "B"]
        ));
        assert!(matches!(by_id["D"], ModuleError::MissingDependency { .. }));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let registry = registry(&[("Solo", vec!["Solo"])]);
        let result = dependency_order(&registry);
        assert!(result.order.is_empty());
        assert!(matches!(
            &result.failures[0].1,
            ModuleError::DependencyCycle { cycle } if cycle == &["Solo", "Solo"]
        ));
    }
}

//! Task-graph validation and auto-repair.
//!
//! Producer-submitted task lists arrive with three classes of structural
//! defects: dependencies naming tasks that do not exist, dependency cycles,
//! and final tasks (documentation / verification work) that nothing forces
//! to run last. [`validate_and_fix`] repairs all three in place and reports
//! human-readable warnings; [`validate_strict`] rejects the same defects
//! instead of repairing them and is used by diagnostics and tests.

use std::collections::{HashMap, HashSet};

use crate::error::{MarcusError, Result};
use crate::models::Task;

/// Maximum cycle-breaking iterations before repair is abandoned.
///
/// If a cycle still exists after the cap, the remaining defects are left
/// for strict validation to reject downstream.
const MAX_CYCLE_PASSES: usize = 10;

/// Repair a task list in place and return human-readable warnings.
///
/// Three passes run in order: orphan-dependency removal, cycle breaking,
/// final-task closure. The function never fails on fixable defects and is
/// idempotent: re-running it on its own output produces no further changes.
pub fn validate_and_fix(tasks: &mut [Task]) -> Vec<String> {
    let mut warnings = Vec::new();
    remove_orphan_dependencies(tasks, &mut warnings);
    break_cycles(tasks, &mut warnings);
    close_final_tasks(tasks, &mut warnings);
    warnings
}

/// Reject the defects [`validate_and_fix`] would repair.
pub fn validate_strict(tasks: &[Task]) -> Result<()> {
    let known: HashSet<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
    for task in tasks {
        for dep in &task.dependencies {
            if !known.contains(dep.as_str()) {
                return Err(MarcusError::invalid_graph(format!(
                    "Task '{}' depends on unknown task '{dep}'",
                    task.name
                ))
                .with_task(task.task_id.clone()));
            }
        }
    }

    if let Some(cycle) = find_cycle(tasks) {
        return Err(MarcusError::invalid_graph(format!(
            "Circular dependency: {}",
            cycle.join(" -> ")
        )));
    }

    let has_implementation = tasks.iter().any(|t| t.is_implementation_task());
    if has_implementation {
        for task in tasks {
            if task.is_final_task() && task.dependencies.is_empty() {
                return Err(MarcusError::invalid_graph(format!(
                    "Final task '{}' has no dependencies and is not forced to run last",
                    task.name
                ))
                .with_task(task.task_id.clone()));
            }
        }
    }

    Ok(())
}

/// Pass 1: drop dependency entries that name no task in the list.
fn remove_orphan_dependencies(tasks: &mut [Task], warnings: &mut Vec<String>) {
    let known: HashSet<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
    for task in tasks.iter_mut() {
        let before = task.dependencies.len();
        retain_dependencies(task, |dep| known.contains(dep));
        let removed = before - task.dependencies.len();
        if removed > 0 {
            warnings.push(format!(
                "Removed {removed} invalid {} from '{}'",
                plural(removed, "dependency", "dependencies"),
                task.name
            ));
        }
    }
}

/// Pass 2: break cycles one edge at a time.
///
/// Each iteration finds one cycle with a three-color depth-first search and
/// removes the edge from the cycle's second-to-last node to its last node,
/// the least disruptive single removal by convention. Iteration stops when
/// the graph is acyclic or the pass cap is reached.
fn break_cycles(tasks: &mut [Task], warnings: &mut Vec<String>) {
    for _ in 0..MAX_CYCLE_PASSES {
        let Some(cycle) = find_cycle(tasks) else {
            return;
        };
        let from_id = cycle[cycle.len() - 2].clone();
        let to_id = cycle[cycle.len() - 1].clone();
        let from_name = name_of(tasks, &from_id);
        let to_name = name_of(tasks, &to_id);
        if let Some(task) = tasks.iter_mut().find(|t| t.task_id == from_id) {
            retain_dependencies(task, |dep| dep != to_id);
        }
        warnings.push(format!(
            "Broke circular dependency: removed link from '{from_name}' to '{to_name}'"
        ));
    }
    // Still cyclic after the cap: leave the rest for strict validation.
}

/// Pass 3: force final tasks to depend on all implementation tasks.
///
/// An implementation task that already depends (transitively) on the final
/// task is excluded from the closure edge set, so this pass never undoes
/// the acyclicity pass 2 just established.
fn close_final_tasks(tasks: &mut [Task], warnings: &mut Vec<String>) {
    let implementation_ids: Vec<String> = tasks
        .iter()
        .filter(|t| t.is_implementation_task())
        .map(|t| t.task_id.clone())
        .collect();
    let any_final = tasks.iter().any(|t| t.is_final_task());
    if implementation_ids.is_empty() || !any_final {
        return;
    }

    for i in 0..tasks.len() {
        if !(tasks[i].is_final_task() && tasks[i].dependencies.is_empty()) {
            continue;
        }
        let final_id = tasks[i].task_id.clone();
        let deps: Vec<String> = implementation_ids
            .iter()
            .filter(|id| **id != final_id && !reaches(tasks, id, &final_id))
            .cloned()
            .collect();
        if deps.is_empty() {
            continue;
        }
        let added = deps.len();
        let task = &mut tasks[i];
        task.dependencies = deps;
        task.dependency_types.clear();
        warnings.push(format!(
            "Added {added} implementation task {} to '{}' to ensure it runs last",
            plural(added, "dependency", "dependencies"),
            task.name
        ));
    }
}

/// Whether `target` is reachable from `from` along dependency edges.
fn reaches(tasks: &[Task], from: &str, target: &str) -> bool {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();
    let mut stack = vec![from];
    let mut visited = HashSet::new();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        if let Some(task) = by_id.get(id) {
            stack.extend(task.dependencies.iter().map(String::as_str));
        }
    }
    false
}

/// Three-color DFS cycle detection.
///
/// Returns the cycle as a node path that repeats its first node, e.g.
/// `[A, B, C, A]`, or `None` when the graph is acyclic. Traversal follows
/// the task list order and each task's dependency order, so the reported
/// cycle is deterministic for a given input.
fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();
    let mut colors: HashMap<&str, Color> =
        tasks.iter().map(|t| (t.task_id.as_str(), Color::White)).collect();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Task>,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colors.insert(id, Color::Gray);
        path.push(id);
        let task = by_id[id];
        for dep in &task.dependencies {
            let dep = dep.as_str();
            match colors.get(dep) {
                None => continue, // orphan; pass 1 handles these
                Some(Color::Black) => continue,
                Some(Color::Gray) => {
                    let start = path.iter().position(|p| *p == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|p| p.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                Some(Color::White) => {
                    if let Some(cycle) = visit(dep, by_id, colors, path) {
                        return Some(cycle);
                    }
                }
            }
        }
        path.pop();
        colors.insert(id, Color::Black);
        None
    }

    let mut path = Vec::new();
    for task in tasks {
        if colors[task.task_id.as_str()] == Color::White {
            if let Some(cycle) = visit(task.task_id.as_str(), &by_id, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Filter a task's dependencies, keeping the parallel type array aligned.
fn retain_dependencies(task: &mut Task, keep: impl Fn(&str) -> bool) {
    let mut deps = Vec::with_capacity(task.dependencies.len());
    let mut types = Vec::new();
    for (i, dep) in task.dependencies.iter().enumerate() {
        if keep(dep) {
            deps.push(dep.clone());
            if !task.dependency_types.is_empty() {
                types.push(task.dependency_type(i));
            }
        }
    }
    task.dependencies = deps;
    task.dependency_types = types;
}

fn name_of(tasks: &[Task], task_id: &str) -> String {
    tasks
        .iter()
        .find(|t| t.task_id == task_id)
        .map(|t| t.name.clone())
        .unwrap_or_else(|| task_id.to_string())
}

fn plural<'a>(n: usize, singular: &'a str, plural: &'a str) -> &'a str {
    if n == 1 {
        singular
    } else {
        plural
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;
    use chrono::Utc;

    fn build(specs: &[(&str, &str, &[&str], &[&str])]) -> Vec<Task> {
        specs
            .iter()
            .map(|(id, name, deps, labels)| {
                NewTask::new(*id, *name)
                    .with_dependencies(deps)
                    .with_labels(labels)
                    .into_task(Utc::now())
            })
            .collect()
    }

    fn deps_of<'a>(tasks: &'a [Task], id: &str) -> &'a [String] {
        &tasks.iter().find(|t| t.task_id == id).unwrap().dependencies
    }

    #[test]
    fn repairs_orphans_cycles_and_final_closure_together() {
        let mut tasks = build(&[
            ("T1", "Design API", &[], &[]),
            ("T2", "Impl API", &["T1", "TGhost"], &[]),
            ("T3", "Test API", &["T2", "T4"], &[]),
            ("T4", "Circular", &["T3"], &[]),
            ("T5", "README update", &[], &["final"]),
        ]);

        let warnings = validate_and_fix(&mut tasks);

        assert_eq!(deps_of(&tasks, "T1"), &[] as &[String]);
        assert_eq!(deps_of(&tasks, "T2"), &["T1".to_string()]);
        assert_eq!(deps_of(&tasks, "T3"), &["T2".to_string(), "T4".to_string()]);
        assert_eq!(deps_of(&tasks, "T4"), &[] as &[String]);
        assert_eq!(
            deps_of(&tasks, "T5"),
            &["T1".to_string(), "T2".to_string(), "T3".to_string(), "T4".to_string()]
        );

        assert_eq!(warnings.len(), 3);
        assert_eq!(warnings[0], "Removed 1 invalid dependency from 'Impl API'");
        assert_eq!(
            warnings[1],
            "Broke circular dependency: removed link from 'Circular' to 'Test API'"
        );
        assert_eq!(
            warnings[2],
            "Added 4 implementation task dependencies to 'README update' to ensure it runs last"
        );

        validate_strict(&tasks).expect("repaired graph should pass strict validation");
    }

    #[test]
    fn orphan_warning_agrees_in_number() {
        let mut tasks = build(&[("T1", "Solo", &["ghost1", "ghost2"], &[])]);
        let warnings = validate_and_fix(&mut tasks);
        assert_eq!(warnings, vec!["Removed 2 invalid dependencies from 'Solo'"]);
    }

    #[test]
    fn duplicate_dependencies_are_tolerated() {
        let mut tasks = build(&[
            ("T1", "Base", &[], &[]),
            ("T2", "Twice", &["T1", "T1"], &[]),
        ]);
        let warnings = validate_and_fix(&mut tasks);
        assert!(warnings.is_empty());
        assert_eq!(deps_of(&tasks, "T2"), &["T1".to_string(), "T1".to_string()]);
    }

    #[test]
    fn self_cycle_is_broken() {
        let mut tasks = build(&[("T1", "Selfish", &["T1"], &[])]);
        let warnings = validate_and_fix(&mut tasks);
        assert_eq!(deps_of(&tasks, "T1"), &[] as &[String]);
        assert_eq!(
            warnings,
            vec!["Broke circular dependency: removed link from 'Selfish' to 'Selfish'"]
        );
    }

    #[test]
    fn long_cycle_is_broken_with_one_edge() {
        let mut tasks = build(&[
            ("A", "A", &["B"], &[]),
            ("B", "B", &["C"], &[]),
            ("C", "C", &["A"], &[]),
        ]);
        let warnings = validate_and_fix(&mut tasks);
        assert_eq!(warnings.len(), 1);
        // DFS from A reaches A again through C, so the C->A edge is removed
        assert_eq!(
            warnings[0],
            "Broke circular dependency: removed link from 'C' to 'A'"
        );
        assert!(find_cycle(&tasks).is_none());
        let removed_edges: usize = 3 - tasks.iter().map(|t| t.dependencies.len()).sum::<usize>();
        assert_eq!(removed_edges, 1);
    }

    #[test]
    fn final_closure_skips_when_no_implementation_tasks() {
        let mut tasks = build(&[
            ("T1", "Docs", &[], &["documentation"]),
            ("T2", "Verify", &[], &["verification"]),
        ]);
        let warnings = validate_and_fix(&mut tasks);
        assert!(warnings.is_empty());
        assert!(deps_of(&tasks, "T2").is_empty());
    }

    #[test]
    fn final_closure_preserves_existing_dependencies() {
        let mut tasks = build(&[
            ("T1", "Impl", &[], &[]),
            ("T2", "Impl 2", &[], &[]),
            ("T3", "Verify", &["T1"], &["verification"]),
        ]);
        let warnings = validate_and_fix(&mut tasks);
        assert!(warnings.is_empty());
        assert_eq!(deps_of(&tasks, "T3"), &["T1".to_string()]);
    }

    #[test]
    fn readme_named_task_gains_closure_but_never_depends_on_itself() {
        let mut tasks = build(&[
            ("T1", "Impl", &[], &[]),
            ("T2", "Update README", &[], &[]),
        ]);
        let warnings = validate_and_fix(&mut tasks);
        // T2 is final by name but also an implementation task; it must not
        // end up depending on itself.
        assert_eq!(deps_of(&tasks, "T2"), &["T1".to_string()]);
        assert_eq!(
            warnings,
            vec!["Added 1 implementation task dependency to 'Update README' to ensure it runs last"]
        );
    }

    #[test]
    fn closure_never_reintroduces_a_cycle() {
        // T1 (implementation) already depends on the final task, so the
        // closure must not add the reverse edge.
        let mut tasks = build(&[
            ("T1", "Impl", &["T9"], &[]),
            ("T2", "Impl 2", &[], &[]),
            ("T9", "Verify", &[], &["verification"]),
        ]);
        let warnings = validate_and_fix(&mut tasks);
        assert!(find_cycle(&tasks).is_none());
        assert_eq!(deps_of(&tasks, "T9"), &["T2".to_string()]);
        assert_eq!(
            warnings,
            vec!["Added 1 implementation task dependency to 'Verify' to ensure it runs last"]
        );
    }

    #[test]
    fn fix_is_idempotent_on_the_seed_scenario() {
        let mut tasks = build(&[
            ("T1", "Design API", &[], &[]),
            ("T2", "Impl API", &["T1", "TGhost"], &[]),
            ("T3", "Test API", &["T2", "T4"], &[]),
            ("T4", "Circular", &["T3"], &[]),
            ("T5", "README update", &[], &["final"]),
        ]);
        validate_and_fix(&mut tasks);
        let fixed_once = tasks.clone();
        let warnings = validate_and_fix(&mut tasks);
        assert!(warnings.is_empty());
        assert_eq!(tasks, fixed_once);
    }

    #[test]
    fn strict_rejects_each_defect_class() {
        let orphan = build(&[("T1", "A", &["ghost"], &[])]);
        assert!(validate_strict(&orphan).unwrap_err().message.contains("unknown task"));

        let cyclic = build(&[("T1", "A", &["T2"], &[]), ("T2", "B", &["T1"], &[])]);
        assert!(validate_strict(&cyclic)
            .unwrap_err()
            .message
            .contains("Circular dependency"));

        let unclosed = build(&[
            ("T1", "Impl", &[], &[]),
            ("T2", "Verify", &[], &["verification"]),
        ]);
        assert!(validate_strict(&unclosed)
            .unwrap_err()
            .message
            .contains("not forced to run last"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arbitrary_tasks() -> impl Strategy<Value = Vec<Task>> {
            // Up to 8 tasks drawn from a fixed id universe, each with random
            // dependencies over the same universe (orphans included on
            // purpose) and occasionally a final-ish label or name.
            let ids: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
            let dep_pool = ids.clone();
            prop::collection::vec(
                (
                    0usize..10,
                    prop::collection::vec(0usize..12, 0..4),
                    prop::sample::select(vec![
                        Vec::<String>::new(),
                        vec!["final".to_string()],
                        vec!["verification".to_string()],
                        vec!["documentation".to_string()],
                        vec!["backend".to_string()],
                    ]),
                    prop::bool::ANY,
                ),
                1..8,
            )
            .prop_map(move |rows| {
                let mut seen = std::collections::HashSet::new();
                rows.into_iter()
                    .filter_map(|(idx, deps, labels, readme)| {
                        let id = ids[idx].clone();
                        if !seen.insert(id.clone()) {
                            return None;
                        }
                        let name = if readme {
                            format!("README for {id}")
                        } else {
                            format!("Work on {id}")
                        };
                        let deps: Vec<&str> = deps
                            .iter()
                            .map(|d| {
                                dep_pool
                                    .get(*d)
                                    .map(|s| s.as_str())
                                    .unwrap_or("ghost-task")
                            })
                            .collect();
                        let labels: Vec<&str> = labels.iter().map(|l| l.as_str()).collect();
                        Some(
                            NewTask::new(id, name)
                                .with_dependencies(&deps)
                                .with_labels(&labels)
                                .into_task(chrono::Utc::now()),
                        )
                    })
                    .collect()
            })
        }

        proptest! {
            #[test]
            fn fix_is_idempotent(mut tasks in arbitrary_tasks()) {
                validate_and_fix(&mut tasks);
                let once = tasks.clone();
                let warnings = validate_and_fix(&mut tasks);
                prop_assert!(warnings.is_empty(), "second pass warned: {warnings:?}");
                prop_assert_eq!(tasks, once);
            }

            #[test]
            fn fixed_graphs_are_sound(mut tasks in arbitrary_tasks()) {
                validate_and_fix(&mut tasks);

                let known: std::collections::HashSet<&str> =
                    tasks.iter().map(|t| t.task_id.as_str()).collect();
                for task in &tasks {
                    for dep in &task.dependencies {
                        prop_assert!(known.contains(dep.as_str()), "orphan survived: {dep}");
                    }
                }
                prop_assert!(find_cycle(&tasks).is_none(), "cycle survived");

                // Every final task with an orderable implementation task
                // (one that does not itself depend on the final task) must
                // have been forced to depend on something.
                for task in &tasks {
                    let orderable_impl = tasks.iter().any(|t| {
                        t.task_id != task.task_id
                            && t.is_implementation_task()
                            && !reaches(&tasks, &t.task_id, &task.task_id)
                    });
                    if task.is_final_task() && orderable_impl {
                        prop_assert!(
                            !task.dependencies.is_empty(),
                            "final task '{}' left unordered",
                            task.task_id
                        );
                    }
                }
            }
        }
    }
}

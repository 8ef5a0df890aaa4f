//! 步骤依赖图
//!
//! 邻接表 + 入度表做 Kahn 拓扑排序：建计划时检测环与悬空依赖，
//! 调度时从依赖图（而非到达顺序）计算就绪集，平局按创建顺序。

use std::collections::{HashMap, HashSet};

use crate::core::EngineError;
use crate::plan::types::{Plan, Step, StepId, StepStatus};

/// 校验步骤集合构成 DAG：id 唯一、依赖存在、无环
pub fn validate_dag(steps: &[Step]) -> Result<(), EngineError> {
    let mut ids: HashSet<&str> = HashSet::new();
    for step in steps {
        if !ids.insert(&step.id) {
            return Err(EngineError::Validation(format!(
                "duplicate step id: {}",
                step.id
            )));
        }
    }

    for step in steps {
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(EngineError::Validation(format!(
                    "step {} depends on unknown step {}",
                    step.id, dep
                )));
            }
            if dep == &step.id {
                return Err(EngineError::Validation(format!(
                    "step {} depends on itself",
                    step.id
                )));
            }
        }
    }

    // Kahn 拓扑排序：未能消费全部节点即存在环
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        in_degree.entry(&step.id).or_insert(0);
        adjacency.entry(&step.id).or_default();
    }
    for step in steps {
        for dep in &step.dependencies {
            adjacency.entry(dep.as_str()).or_default().push(&step.id);
            *in_degree.entry(&step.id).or_insert(0) += 1;
        }
    }

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = queue.pop() {
        visited += 1;
        if let Some(dependents) = adjacency.get(id) {
            for dependent in dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(dependent);
                    }
                }
            }
        }
    }

    if visited != steps.len() {
        let cyclic: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        return Err(EngineError::Validation(format!(
            "cyclic dependency among steps: {:?}",
            cyclic
        )));
    }

    Ok(())
}

/// 就绪步骤：自身 pending 且依赖全部 completed，按创建顺序返回
///
/// 幂等：相邻两次 update 之间重复调用返回相同结果。
pub fn ready_steps(plan: &Plan) -> Vec<StepId> {
    let status: HashMap<&str, StepStatus> = plan
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.status))
        .collect();

    plan.steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter(|s| {
            s.dependencies
                .iter()
                .all(|dep| status.get(dep.as_str()) == Some(&StepStatus::Completed))
        })
        .map(|s| s.id.clone())
        .collect()
}

/// 级联跳过：依赖进入 failed / skipped 的 pending 步骤标记为 skipped
///
/// 迭代到不动点，返回本次被跳过的步骤 id。
pub fn cascade_skip(plan: &mut Plan) -> Vec<StepId> {
    let mut skipped = Vec::new();
    loop {
        let status: HashMap<String, StepStatus> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.status))
            .collect();
        let mut changed = false;
        for step in plan.steps.iter_mut() {
            if step.status != StepStatus::Pending {
                continue;
            }
            let dep_broken = step.dependencies.iter().any(|dep| {
                matches!(
                    status.get(dep),
                    Some(StepStatus::Failed) | Some(StepStatus::Skipped)
                )
            });
            if dep_broken {
                step.status = StepStatus::Skipped;
                skipped.push(step.id.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    skipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::types::{PlanStatus, StepSpec};
    use chrono::Utc;

    fn step(id: &str, deps: &[&str]) -> Step {
        let mut spec = StepSpec::new(format!("step {}", id)).with_id(id);
        for d in deps {
            spec = spec.depends_on(*d);
        }
        Step::from_spec(spec, 2)
    }

    fn plan_of(steps: Vec<Step>) -> Plan {
        Plan {
            id: "p".into(),
            source_intent: "test".into(),
            steps,
            status: PlanStatus::Executing,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            replan_count: 0,
        }
    }

    #[test]
    fn test_validate_accepts_dag() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["a", "b"])];
        assert!(validate_dag(&steps).is_ok());
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        let err = validate_dag(&steps).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_validate_rejects_self_loop() {
        let steps = vec![step("a", &["a"])];
        assert!(validate_dag(&steps).is_err());
    }

    #[test]
    fn test_validate_rejects_dangling_dependency() {
        let steps = vec![step("a", &["ghost"])];
        assert!(validate_dag(&steps).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_id() {
        let steps = vec![step("a", &[]), step("a", &[])];
        assert!(validate_dag(&steps).is_err());
    }

    #[test]
    fn test_ready_in_creation_order() {
        // 场景 A：A 无依赖，B、C 依赖 A；A 完成后 ready 按创建顺序返回 {B, C}
        let mut plan = plan_of(vec![step("A", &[]), step("B", &["A"]), step("C", &["A"])]);
        assert_eq!(ready_steps(&plan), vec!["A"]);
        plan.step_mut("A").unwrap().status = StepStatus::Completed;
        assert_eq!(ready_steps(&plan), vec!["B", "C"]);
    }

    #[test]
    fn test_ready_is_idempotent() {
        let plan = plan_of(vec![step("a", &[]), step("b", &["a"])]);
        assert_eq!(ready_steps(&plan), ready_steps(&plan));
    }

    #[test]
    fn test_cascade_skip_transitive() {
        let mut plan = plan_of(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        plan.step_mut("a").unwrap().status = StepStatus::Failed;
        let skipped = cascade_skip(&mut plan);
        assert_eq!(skipped, vec!["b", "c"]);
        assert_eq!(plan.step("c").unwrap().status, StepStatus::Skipped);
    }
}

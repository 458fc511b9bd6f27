use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use taskmesh_core::{models::Task, traits::TaskRepository, SchedulerError, SchedulerResult};

/// 任务ID -> 直接依赖
pub type DependencyGraph = HashMap<Uuid, Vec<Uuid>>;

pub struct DependencyChecker {
    task_repo: Arc<dyn TaskRepository>,
}

impl DependencyChecker {
    pub fn new(task_repo: Arc<dyn TaskRepository>) -> Self {
        Self { task_repo }
    }

    /// 检查直接自环和未知依赖
    ///
    /// `known` 中的ID视为已存在（同一批次内的任务）。
    pub async fn validate_dependencies(
        &self,
        task: &Task,
        known: &HashSet<Uuid>,
    ) -> SchedulerResult<()> {
        if task.dependencies.contains(&task.id) {
            return Err(SchedulerError::SelfDependency { id: task.id });
        }

        let external: Vec<Uuid> = task
            .dependencies
            .iter()
            .filter(|dep| !known.contains(dep))
            .copied()
            .collect();
        if external.is_empty() {
            return Ok(());
        }

        let found: HashSet<Uuid> = self
            .task_repo
            .get_by_ids(&external)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        if let Some(missing) = external.iter().find(|dep| !found.contains(dep)) {
            return Err(SchedulerError::UnknownDependency {
                task_id: task.id,
                dependency_id: *missing,
            });
        }
        Ok(())
    }

    /// 存储中的依赖图
    pub async fn build_dependency_graph(&self) -> SchedulerResult<DependencyGraph> {
        let tasks = self.task_repo.list_all().await?;
        Ok(tasks
            .into_iter()
            .map(|task| (task.id, task.dependencies))
            .collect())
    }

    /// 存储中的依赖图加上候选任务后必须无环
    pub async fn validate_acyclic(&self, candidates: &[Task]) -> SchedulerResult<()> {
        let mut graph = self.build_dependency_graph().await?;
        for task in candidates {
            graph.insert(task.id, task.dependencies.clone());
        }

        if let Some(cycle) = find_cycle(&graph) {
            warn!("检测到循环依赖，涉及 {} 个任务", cycle.len());
            return Err(SchedulerError::CircularDependency { tasks: cycle });
        }
        Ok(())
    }

    /// 传递依赖（BFS，近的在前）
    pub async fn transitive_dependencies(&self, task_id: Uuid) -> SchedulerResult<Vec<Uuid>> {
        let task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut queue: VecDeque<Uuid> = VecDeque::new();
        let mut result = Vec::new();
        for dep in task.dependencies {
            if visited.insert(dep) {
                queue.push_back(dep);
            }
        }

        while let Some(current) = queue.pop_front() {
            result.push(current);
            if let Some(current_task) = self.task_repo.get_by_id(current).await? {
                for dep in current_task.dependencies {
                    if visited.insert(dep) {
                        queue.push_back(dep);
                    }
                }
            }
        }

        debug!("任务 {} 共有 {} 个传递依赖", task_id, result.len());
        Ok(result)
    }
}

/// Kahn拓扑排序；有环时返回无法排序的任务
///
/// 图外的依赖ID不参与判定。
pub fn find_cycle(graph: &DependencyGraph) -> Option<Vec<Uuid>> {
    // 入度 = 依赖当前节点的任务数
    let mut in_degree: HashMap<Uuid, usize> = graph.keys().map(|id| (*id, 0)).collect();
    for dependencies in graph.values() {
        for dep in dependencies {
            if let Some(degree) = in_degree.get_mut(dep) {
                *degree += 1;
            }
        }
    }

    let mut queue: VecDeque<Uuid> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut processed = 0usize;
    while let Some(node) = queue.pop_front() {
        processed += 1;
        if let Some(dependencies) = graph.get(&node) {
            for dep in dependencies {
                if let Some(degree) = in_degree.get_mut(dep) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dep);
                    }
                }
            }
        }
    }

    if processed == graph.len() {
        return None;
    }
    let mut remaining: Vec<Uuid> = in_degree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(id, _)| id)
        .collect();
    remaining.sort();
    Some(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_chain_is_acyclic() {
        let id = ids(3);
        let graph: DependencyGraph = [
            (id[0], vec![]),
            (id[1], vec![id[0]]),
            (id[2], vec![id[1], id[0]]),
        ]
        .into_iter()
        .collect();
        assert!(find_cycle(&graph).is_none());
    }

    #[test]
    fn test_indirect_cycle_detected() {
        let id = ids(4);
        let graph: DependencyGraph = [
            (id[0], vec![id[2]]),
            (id[1], vec![id[0]]),
            (id[2], vec![id[1]]),
            (id[3], vec![id[0]]),
        ]
        .into_iter()
        .collect();

        let cycle = find_cycle(&graph).unwrap();
        assert_eq!(cycle.len(), 3);
        assert!(!cycle.contains(&id[3]));
    }

    #[test]
    fn test_external_dependencies_ignored() {
        let id = ids(2);
        let graph: DependencyGraph = [(id[0], vec![Uuid::new_v4()]), (id[1], vec![id[0]])]
            .into_iter()
            .collect();
        assert!(find_cycle(&graph).is_none());
    }
}

use remedy_core::{RemedyError, RemedyResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// When a role runs relative to consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Produces recommendations that feed consensus.
    #[default]
    Analysis,
    /// Acts on the consensus decision.
    Action,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Analysis => write!(f, "analysis"),
            Stage::Action => write!(f, "action"),
        }
    }
}

/// A workflow role and the roles it waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub stage: Stage,
}

impl RoleSpec {
    pub fn analysis(name: impl Into<String>, depends_on: &[&str]) -> Self {
        Self {
            name: name.into(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            stage: Stage::Analysis,
        }
    }

    pub fn action(name: impl Into<String>, depends_on: &[&str]) -> Self {
        Self {
            stage: Stage::Action,
            ..Self::analysis(name, depends_on)
        }
    }
}

/// Levels of roles for one workflow run.
///
/// `analysis` levels run before consensus, `action` levels after it. Roles in
/// one level never depend on each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub analysis: Vec<Vec<String>>,
    pub action: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Roles of the first analysis level.
    pub fn detection_roles(&self) -> &[String] {
        self.analysis.first().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn role_count(&self) -> usize {
        self.analysis
            .iter()
            .chain(self.action.iter())
            .map(Vec::len)
            .sum()
    }
}

/// Read-only description of the graph for introspection queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphView {
    pub nodes: Vec<RoleSpec>,
    /// `(prerequisite, dependent)` pairs.
    pub edges: Vec<(String, String)>,
    pub topological_order: Vec<String>,
    pub levels: Vec<Vec<String>>,
    pub plan: ExecutionPlan,
}

/// Static role dependency graph, validated on construction.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    roles: BTreeMap<String, RoleSpec>,
    levels: BTreeMap<String, usize>,
}

impl DependencyGraph {
    /// Validate `roles` and compute levels.
    ///
    /// Fails with [`RemedyError::Configuration`] on an empty graph, duplicate
    /// roles, unknown prerequisites, cycles, or an analysis role that depends
    /// on an action role.
    pub fn new(roles: Vec<RoleSpec>) -> RemedyResult<Self> {
        if roles.is_empty() {
            return Err(RemedyError::Configuration(
                "Dependency graph has no roles".into(),
            ));
        }

        let mut by_name = BTreeMap::new();
        for role in roles {
            if by_name.contains_key(&role.name) {
                return Err(RemedyError::Configuration(format!(
                    "Role '{}' is defined twice",
                    role.name
                )));
            }
            by_name.insert(role.name.clone(), role);
        }

        for role in by_name.values() {
            for dep in &role.depends_on {
                let Some(prerequisite) = by_name.get(dep) else {
                    return Err(RemedyError::Configuration(format!(
                        "Role '{}' depends on unknown role '{dep}'",
                        role.name
                    )));
                };
                if role.stage == Stage::Analysis && prerequisite.stage == Stage::Action {
                    return Err(RemedyError::Configuration(format!(
                        "Analysis role '{}' cannot depend on action role '{dep}'",
                        role.name
                    )));
                }
            }
        }

        let mut graph = Self {
            roles: by_name,
            levels: BTreeMap::new(),
        };
        if let Some(path) = graph.find_cycle() {
            return Err(RemedyError::Configuration(format!(
                "Dependency cycle detected: {}",
                path.join(" -> ")
            )));
        }
        graph.levels = graph.compute_levels(|_| true);
        Ok(graph)
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashMap::new();
        let mut path = Vec::new();
        for name in self.roles.keys() {
            if self.dfs_cycle(name, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        name: &'a str,
        visited: &mut HashMap<&'a str, u8>,
        path: &mut Vec<String>,
    ) -> bool {
        match visited.get(name) {
            Some(1) => {
                path.push(name.to_string());
                return true;
            }
            Some(2) => return false,
            _ => {}
        }
        visited.insert(name, 1);
        path.push(name.to_string());
        if let Some(role) = self.roles.get(name) {
            for dep in &role.depends_on {
                if self.dfs_cycle(dep, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        visited.insert(name, 2);
        false
    }

    /// Longest-path levels over the edges whose prerequisite passes `counts`.
    fn compute_levels(&self, counts: impl Fn(&RoleSpec) -> bool) -> BTreeMap<String, usize> {
        let mut levels: BTreeMap<String, usize> = BTreeMap::new();
        while levels.len() < self.roles.len() {
            let before = levels.len();
            for (name, role) in &self.roles {
                if levels.contains_key(name) {
                    continue;
                }
                let mut level = 0;
                let mut ready = true;
                for dep in &role.depends_on {
                    let Some(prerequisite) = self.roles.get(dep) else {
                        continue;
                    };
                    if !counts(prerequisite) {
                        continue;
                    }
                    match levels.get(dep) {
                        Some(dep_level) => level = level.max(dep_level + 1),
                        None => {
                            ready = false;
                            break;
                        }
                    }
                }
                if ready {
                    levels.insert(name.clone(), level);
                }
            }
            if levels.len() == before {
                // Only reachable with a cycle, which `new` rejects.
                break;
            }
        }
        levels
    }

    fn group(levels: &BTreeMap<String, usize>, keep: impl Fn(&str) -> bool) -> Vec<Vec<String>> {
        let mut grouped: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (name, level) in levels {
            if keep(name) {
                grouped.entry(*level).or_default().push(name.clone());
            }
        }
        grouped.into_values().collect()
    }

    /// Level of a role: 0 without prerequisites, otherwise one more than its
    /// deepest prerequisite.
    pub fn level_of(&self, role: &str) -> Option<usize> {
        self.levels.get(role).copied()
    }

    /// All roles grouped by level, names sorted within a level.
    pub fn levels(&self) -> Vec<Vec<String>> {
        Self::group(&self.levels, |_| true)
    }

    /// Split the levels into the pre- and post-consensus halves.
    ///
    /// Action roles are levelled among themselves; their analysis
    /// prerequisites have all finished by the time consensus is reached.
    pub fn execution_plan(&self) -> ExecutionPlan {
        let action_levels = self.compute_levels(|prerequisite| prerequisite.stage == Stage::Action);
        ExecutionPlan {
            analysis: Self::group(&self.levels, |name| self.is_stage(name, Stage::Analysis)),
            action: Self::group(&action_levels, |name| self.is_stage(name, Stage::Action)),
        }
    }

    fn is_stage(&self, role: &str, stage: Stage) -> bool {
        self.roles.get(role).is_some_and(|r| r.stage == stage)
    }

    /// Roles ordered so every prerequisite comes before its dependents.
    pub fn topological_order(&self) -> Vec<String> {
        self.levels().into_iter().flatten().collect()
    }

    pub fn get(&self, role: &str) -> Option<&RoleSpec> {
        self.roles.get(role)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleSpec> {
        self.roles.values()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// `(prerequisite, dependent)` pairs, sorted.
    pub fn edges(&self) -> Vec<(String, String)> {
        let edges: BTreeSet<(String, String)> = self
            .roles
            .values()
            .flat_map(|r| r.depends_on.iter().map(|d| (d.clone(), r.name.clone())))
            .collect();
        edges.into_iter().collect()
    }

    pub fn introspect(&self) -> GraphView {
        GraphView {
            nodes: self.roles.values().cloned().collect(),
            edges: self.edges(),
            topological_order: self.topological_order(),
            levels: self.levels(),
            plan: self.execution_plan(),
        }
    }
}

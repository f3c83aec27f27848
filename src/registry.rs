use bitvec::prelude::*;
use indexmap::{IndexMap, IndexSet};

use crate::error::{ExpressionError, Result};
use crate::expression::Expression;

/// What `register` does when the name is taken.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RegistrationMode {
    /// Replace the existing expression (edit in place).
    #[default]
    Overwrite,
    /// Fail with `DuplicateName`.
    Strict,
}

/// Named expressions of one task, in registration order.
#[derive(Clone, Debug, Default)]
pub struct ExpressionRegistry {
    mode: RegistrationMode,
    expressions: IndexMap<String, Expression>,
}

impl ExpressionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: RegistrationMode) -> Self {
        Self {
            mode,
            expressions: IndexMap::new(),
        }
    }

    pub fn mode(&self) -> RegistrationMode {
        self.mode
    }

    /// Inserts `expression`, returning the one it replaced.
    pub fn register(&mut self, expression: Expression) -> Result<Option<Expression>> {
        let name = expression.name().to_string();
        if self.mode == RegistrationMode::Strict && self.expressions.contains_key(&name) {
            return Err(ExpressionError::DuplicateName(name));
        }
        log::debug!("registering expression `{name}`");
        Ok(self.expressions.insert(name, expression))
    }

    pub fn remove(&mut self, name: &str) -> Option<Expression> {
        self.expressions.shift_remove(name)
    }

    pub fn resolve(&self, name: &str) -> Result<&Expression> {
        self.expressions
            .get(name)
            .ok_or_else(|| ExpressionError::NotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&Expression> {
        self.expressions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.expressions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.expressions.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Expression> {
        self.expressions.values()
    }

    pub fn len(&self) -> usize {
        self.expressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    /// Registered expressions that `name` references directly.
    pub fn dependencies(&self, name: &str) -> Result<Vec<&str>> {
        let index = self.index_of(name)?;
        Ok(self
            .dependency_indices(index, &IndexSet::new())
            .into_iter()
            .map(|i| self.name_at(i))
            .collect())
    }

    /// Every expression grouped into levels; each level only depends on
    /// earlier ones.
    pub fn evaluation_order(&self) -> Result<Vec<Vec<&str>>> {
        self.evaluation_order_over(&IndexSet::new())
    }

    /// Like [`ExpressionRegistry::evaluation_order`] for fractions measuring
    /// `quantities`. A measured quantity binds before any expression of the
    /// same name, so referencing it adds no edge.
    pub fn evaluation_order_over(&self, quantities: &IndexSet<String>) -> Result<Vec<Vec<&str>>> {
        let everything = bitvec![1; self.expressions.len()];
        self.levels_of(&everything, quantities)
    }

    /// Levels for `name` and everything it transitively depends on; `name` is
    /// alone in the last level.
    pub fn evaluation_order_for(
        &self,
        name: &str,
        quantities: &IndexSet<String>,
    ) -> Result<Vec<Vec<&str>>> {
        let root = self.index_of(name)?;
        let mut closure = bitvec![0; self.expressions.len()];
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            if closure.replace(index, true) {
                continue;
            }
            stack.extend(self.dependency_indices(index, quantities));
        }
        self.levels_of(&closure, quantities)
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.expressions
            .get_index_of(name)
            .ok_or_else(|| ExpressionError::NotFound(name.to_string()))
    }

    fn name_at(&self, index: usize) -> &str {
        self.expressions
            .get_index(index)
            .map_or("", |(name, _)| name.as_str())
    }

    fn dependency_indices(&self, index: usize, quantities: &IndexSet<String>) -> Vec<usize> {
        let Some((_, expression)) = self.expressions.get_index(index) else {
            return Vec::new();
        };
        expression
            .tree()
            .references()
            .iter()
            .filter(|name| !quantities.contains(name.as_str()))
            .filter_map(|name| self.expressions.get_index_of(name.as_str()))
            .collect()
    }

    /// Kahn's algorithm over the expressions selected by `subset`, one level
    /// at a time. Whatever never reaches in-degree zero is on or behind a
    /// cycle.
    fn levels_of(&self, subset: &BitSlice, quantities: &IndexSet<String>) -> Result<Vec<Vec<&str>>> {
        let n = self.expressions.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for index in subset.iter_ones() {
            for dep in self.dependency_indices(index, quantities) {
                if subset[dep] {
                    in_degree[index] += 1;
                    dependents[dep].push(index);
                }
            }
        }

        let mut current: Vec<usize> = subset.iter_ones().filter(|&i| in_degree[i] == 0).collect();
        let mut processed = bitvec![0; n];
        let mut levels = Vec::new();
        while !current.is_empty() {
            let mut next = Vec::new();
            for &index in &current {
                processed.set(index, true);
                for &dependent in &dependents[index] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            levels.push(current.iter().map(|&i| self.name_at(i)).collect());
            current = next;
        }

        let stuck: Vec<String> = subset
            .iter_ones()
            .filter(|&i| !processed[i])
            .map(|i| self.name_at(i).to_string())
            .collect();
        if !stuck.is_empty() {
            return Err(ExpressionError::CyclicDependency { names: stuck });
        }
        Ok(levels)
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use indexmap::{IndexMap, IndexSet};

#[cfg(feature = "rayon")]
use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};

use crate::error::{ExpressionError, Result};
use crate::evaluate::{ExpressionResult, Scope};
use crate::expression::Expression;
use crate::fraction::Fraction;
use crate::registry::{ExpressionRegistry, RegistrationMode};

#[derive(Clone, Debug)]
struct CachedResult {
    version: u64,
    result: Arc<ExpressionResult>,
}

/// Outcome of a batch evaluation that was not aborted by a cycle.
#[derive(Debug, Default)]
pub struct EvaluationReport {
    /// Names in the order they were evaluated (level by level).
    pub evaluated: Vec<String>,
    /// Expressions whose own evaluation failed; the rest of the batch still
    /// ran.
    pub failed: IndexMap<String, ExpressionError>,
}

impl EvaluationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The live computation scope: fractions, parameters and named expressions.
///
/// Every mutation bumps [`TaskContext::version`]; cached results from an
/// older version are ignored and dropped when next looked at.
#[derive(Debug, Default)]
pub struct TaskContext {
    fractions: Vec<Fraction>,
    parameters: IndexMap<String, f64>,
    registry: ExpressionRegistry,
    version: u64,
    cache: HashMap<String, CachedResult>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registration_mode(mode: RegistrationMode) -> Self {
        Self {
            registry: ExpressionRegistry::with_mode(mode),
            ..Self::default()
        }
    }

    pub fn with_fraction(mut self, fraction: Fraction) -> Result<Self> {
        self.add_fraction(fraction)?;
        Ok(self)
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: f64) -> Self {
        self.set_parameter(name, value);
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn bump(&mut self) {
        self.version += 1;
        log::trace!("task context now at version {}", self.version);
    }

    pub fn fractions(&self) -> &[Fraction] {
        &self.fractions
    }

    pub fn reference_materials(&self) -> impl Iterator<Item = &Fraction> {
        self.fractions.iter().filter(|f| f.is_reference_material())
    }

    pub fn unknowns(&self) -> impl Iterator<Item = &Fraction> {
        self.fractions.iter().filter(|f| !f.is_reference_material())
    }

    /// Results are keyed by fraction name, so names must be unique.
    pub fn add_fraction(&mut self, fraction: Fraction) -> Result<()> {
        if self.fractions.iter().any(|f| f.name() == fraction.name()) {
            return Err(ExpressionError::DuplicateFraction(fraction.name().to_string()));
        }
        self.fractions.push(fraction);
        self.bump();
        Ok(())
    }

    /// Replaces every fraction. On a duplicate name nothing changes.
    pub fn set_fractions(&mut self, fractions: Vec<Fraction>) -> Result<()> {
        let mut names = IndexSet::with_capacity(fractions.len());
        if let Some(duplicate) = fractions.iter().find(|f| !names.insert(f.name())) {
            return Err(ExpressionError::DuplicateFraction(duplicate.name().to_string()));
        }
        self.fractions = fractions;
        self.bump();
        Ok(())
    }

    /// Every quantity measured on some fraction of the task.
    fn quantities(&self) -> IndexSet<String> {
        self.fractions
            .iter()
            .flat_map(|f| f.quantities().map(str::to_string))
            .collect()
    }

    pub fn parameters(&self) -> &IndexMap<String, f64> {
        &self.parameters
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: f64) {
        self.parameters.insert(name.into(), value);
        self.bump();
    }

    pub fn remove_parameter(&mut self, name: &str) -> Option<f64> {
        let removed = self.parameters.shift_remove(name);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    pub fn registry(&self) -> &ExpressionRegistry {
        &self.registry
    }

    /// Registers (or, outside strict mode, replaces) an expression.
    pub fn register(&mut self, expression: Expression) -> Result<()> {
        self.registry.register(expression)?;
        self.bump();
        Ok(())
    }

    pub fn remove_expression(&mut self, name: &str) -> Option<Expression> {
        let removed = self.registry.remove(name);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    pub fn resolve(&self, name: &str) -> Result<&Expression> {
        self.registry.resolve(name)
    }

    /// Cached result of `name` for the current version, if any.
    pub fn result(&mut self, name: &str) -> Option<Arc<ExpressionResult>> {
        match self.cache.get(name) {
            Some(cached) if cached.version == self.version => Some(cached.result.clone()),
            Some(_) => {
                self.cache.remove(name);
                None
            }
            None => None,
        }
    }

    /// Evaluates every registered expression in dependency order.
    ///
    /// A cycle anywhere fails the whole batch before anything is evaluated or
    /// cached. Otherwise an expression that fails is recorded in the report and
    /// its dependents fail with it; everything else is cached.
    pub fn evaluate_all(&mut self) -> Result<EvaluationReport> {
        let levels = owned_levels(self.registry.evaluation_order_over(&self.quantities())?);
        log::debug!(
            "evaluating {} expressions in {} levels at version {}",
            self.registry.len(),
            levels.len(),
            self.version
        );
        let (results, report) = self.run_levels(&levels, HashMap::new());
        self.store(results);
        Ok(report)
    }

    /// Evaluates `name`, first bringing everything it depends on up to date.
    /// Fresh cached results are reused.
    pub fn evaluate(&mut self, name: &str) -> Result<Arc<ExpressionResult>> {
        if let Some(result) = self.result(name) {
            log::debug!("cache hit for `{name}`");
            return Ok(result);
        }
        let levels = owned_levels(self.registry.evaluation_order_for(name, &self.quantities())?);
        let fresh = self.fresh_results();
        let (results, mut report) = self.run_levels(&levels, fresh);
        let result = results.get(name).cloned();
        self.store(results);
        match (result, report.failed.shift_remove(name)) {
            (Some(result), _) => Ok(result),
            (None, Some(e)) => Err(e),
            (None, None) => Err(ExpressionError::NotFound(name.to_string())),
        }
    }

    /// Current-version cache entries; stale ones are dropped on the way.
    fn fresh_results(&mut self) -> HashMap<String, Arc<ExpressionResult>> {
        let version = self.version;
        self.cache.retain(|_, cached| cached.version == version);
        self.cache
            .iter()
            .map(|(name, cached)| (name.clone(), cached.result.clone()))
            .collect()
    }

    fn store(&mut self, results: HashMap<String, Arc<ExpressionResult>>) {
        let version = self.version;
        self.cache.extend(
            results
                .into_iter()
                .map(|(name, result)| (name, CachedResult { version, result })),
        );
    }

    /// Runs each level to completion before starting the next, skipping names
    /// already present in `results`.
    fn run_levels(
        &self,
        levels: &[Vec<String>],
        mut results: HashMap<String, Arc<ExpressionResult>>,
    ) -> (HashMap<String, Arc<ExpressionResult>>, EvaluationReport) {
        let quantities = self.quantities();
        let mut failed = IndexSet::new();
        let mut report = EvaluationReport::default();

        for level in levels {
            let pending: Vec<&Expression> = level
                .iter()
                .filter(|name| !results.contains_key(name.as_str()))
                .filter_map(|name| self.registry.get(name))
                .collect();
            let scope = Scope {
                quantities: &quantities,
                results: &results,
                failed: &failed,
                parameters: &self.parameters,
            };
            let evaluate_one = |expression: &&Expression| {
                let start = Instant::now();
                let outcome = self.evaluate_expression(expression, &scope);
                log::trace!(
                    "evaluated `{}` in {} us",
                    expression.name(),
                    start.elapsed().as_micros()
                );
                (expression.name().to_string(), outcome)
            };

            // Expressions within a level never depend on each other.
            #[cfg(feature = "rayon")]
            let outcomes: Vec<_> = pending.par_iter().map(evaluate_one).collect();
            #[cfg(not(feature = "rayon"))]
            let outcomes: Vec<_> = pending.iter().map(evaluate_one).collect();

            for (name, outcome) in outcomes {
                match outcome {
                    Ok(result) => {
                        results.insert(name.clone(), Arc::new(result));
                        report.evaluated.push(name);
                    }
                    Err(e) => {
                        log::warn!("expression `{name}` failed: {e}");
                        failed.insert(name.clone());
                        report.failed.insert(name, e);
                    }
                }
            }
        }
        (results, report)
    }

    /// Task-wide expressions see no fractions; reference-material expressions
    /// see only reference materials; everything else sees every fraction.
    fn evaluate_expression(
        &self,
        expression: &Expression,
        scope: &Scope,
    ) -> Result<ExpressionResult> {
        let tree = expression.tree();
        if expression.is_task_wide() {
            let no_fractions: &[Fraction] = &[];
            return Ok(ExpressionResult::Summary(
                tree.root().evaluate(no_fractions, scope)?,
            ));
        }
        if expression.is_reference_material_value() {
            let references: Vec<&Fraction> = self.reference_materials().collect();
            return tree.evaluate_result(&references, scope);
        }
        tree.evaluate_result(&self.fractions, scope)
    }
}

fn owned_levels(levels: Vec<Vec<&str>>) -> Vec<Vec<String>> {
    levels
        .into_iter()
        .map(|level| level.into_iter().map(str::to_string).collect())
        .collect()
}

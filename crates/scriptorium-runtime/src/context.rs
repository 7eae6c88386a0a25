//! Runtime context: the shared services a run executes against.
//!
//! One context owns a budget governor, circuit breaker, retry policy,
//! result cache and tracer. Task graphs hold it by `Arc`, so graphs built
//! on the same context share the cache and the counters, while separate
//! contexts (for instance one per test) are fully isolated.

use scriptorium_core::{BudgetStatus, RetryPolicy};
use std::sync::Arc;

use crate::cache::ResultCache;
use crate::config::{ConfigError, RuntimeConfig};
use crate::resilience::{BudgetGovernor, CircuitBreaker, CircuitStatus};
use crate::tracer::{LogTracer, Tracer};

/// Shared services for a run.
pub struct RuntimeContext {
    config: RuntimeConfig,
    budget: BudgetGovernor,
    breaker: CircuitBreaker,
    cache: ResultCache,
    tracer: Arc<dyn Tracer>,
}

impl RuntimeContext {
    /// Create a context from configuration with the default tracer.
    pub fn new(config: RuntimeConfig) -> Self {
        let cache = ResultCache::new(config.cache_capacity);
        Self::assemble(config, cache, Arc::new(LogTracer::new()))
    }

    pub fn builder() -> RuntimeContextBuilder {
        RuntimeContextBuilder::new()
    }

    fn assemble(config: RuntimeConfig, cache: ResultCache, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            budget: BudgetGovernor::new(config.effective_budget()),
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            cache,
            tracer,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn budget(&self) -> &BudgetGovernor {
        &self.budget
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn tracer(&self) -> &dyn Tracer {
        self.tracer.as_ref()
    }

    pub fn budget_status(&self) -> BudgetStatus {
        self.budget.get_status()
    }

    pub fn circuit_status(&self) -> CircuitStatus {
        self.breaker.status()
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

/// Builder for RuntimeContext.
pub struct RuntimeContextBuilder {
    config: RuntimeConfig,
    cache: Option<ResultCache>,
    tracer: Option<Arc<dyn Tracer>>,
}

impl RuntimeContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            cache: None,
            tracer: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing result cache instead of creating one.
    pub fn cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the span collaborator.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Build the context.
    pub fn build(self) -> Result<RuntimeContext, ConfigError> {
        self.config.validate()?;

        let cache = self
            .cache
            .unwrap_or_else(|| ResultCache::new(self.config.cache_capacity));
        let tracer = self.tracer.unwrap_or_else(|| Arc::new(LogTracer::new()));

        Ok(RuntimeContext::assemble(self.config, cache, tracer))
    }
}

impl Default for RuntimeContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

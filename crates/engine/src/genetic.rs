//! Genetic parameter search
//!
//! Generation loop:
//! 1. evaluate every individual (optionally fanned out over rayon, joined
//!    before selection)
//! 2. update the all-time best with a strict `>` so the earliest best wins ties
//! 3. carry `elite_keep` top individuals over unchanged
//! 4. fill the rest with blend-crossover children, then mutate them
//!
//! The random source belongs to the optimizer instance. A seeded optimizer
//! run start to finish is reproducible.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::params::{Individual, ParamBounds, ParamValue, ParameterSpace};

/// Smallest population the optimizer will run with
pub const MIN_POPULATION: usize = 4;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneticConfig {
    pub population_size: usize,
    pub generations: usize,
    pub crossover_rate: f64,
    pub mutation_rate: f64,
    pub elite_keep: usize,
    pub seed: Option<u64>,
    /// Evaluate each generation on the rayon pool
    pub parallel: bool,
}

impl Default for GeneticConfig {
    fn default() -> Self {
        Self {
            population_size: 20,
            generations: 10,
            crossover_rate: 0.8,
            mutation_rate: 0.2,
            elite_keep: 2,
            seed: None,
            parallel: true,
        }
    }
}

impl GeneticConfig {
    /// Clamp every field into its valid range
    pub fn normalized(&self) -> Self {
        let population_size = self.population_size.max(MIN_POPULATION);
        let rate = |r: f64| if r.is_nan() { 0.0 } else { r.clamp(0.0, 1.0) };
        Self {
            population_size,
            generations: self.generations.max(1),
            crossover_rate: rate(self.crossover_rate),
            mutation_rate: rate(self.mutation_rate),
            elite_keep: self.elite_keep.min(population_size),
            seed: self.seed,
            parallel: self.parallel,
        }
    }
}

// ============================================================================
// Progress + results
// ============================================================================

/// Convergence record for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub generation: usize,
    /// Best fitness within this generation
    pub best_fitness: f64,
    pub mean_fitness: f64,
    /// Best fitness seen in this or any earlier generation
    pub all_time_best: f64,
}

/// Snapshot handed to observers after each evaluation phase
#[derive(Debug)]
pub struct GenerationState<'a> {
    pub generation: usize,
    pub population: &'a [Individual],
    pub fitnesses: &'a [f64],
    pub best: &'a Individual,
    pub best_fitness: f64,
}

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// All-time best, not the final generation's best
    pub best: Individual,
    pub best_fitness: f64,
    pub history: Vec<GenerationSummary>,
    pub evaluations: usize,
}

// ============================================================================
// Optimizer
// ============================================================================

pub struct GeneticOptimizer<R: Rng = StdRng> {
    space: ParameterSpace,
    config: GeneticConfig,
    rng: R,
}

impl GeneticOptimizer<StdRng> {
    /// Optimizer with its own `StdRng`, seeded from `config.seed` when set
    pub fn new(space: ParameterSpace, config: GeneticConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(space, config, rng)
    }
}

impl<R: Rng> GeneticOptimizer<R> {
    pub fn with_rng(space: ParameterSpace, config: GeneticConfig, rng: R) -> Self {
        Self {
            space,
            config: config.normalized(),
            rng,
        }
    }

    pub fn config(&self) -> &GeneticConfig {
        &self.config
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    /// Search for the individual maximizing `fitness_fn`.
    ///
    /// `fitness_fn` must not panic; mapping evaluation failures to a low
    /// fitness is the caller's job.
    pub fn optimize<F>(&mut self, fitness_fn: F) -> OptimizationResult
    where
        F: Fn(&Individual) -> f64 + Sync,
    {
        self.optimize_with_observer(fitness_fn, |_| {})
    }

    pub fn optimize_with_observer<F, O>(&mut self, fitness_fn: F, mut observer: O) -> OptimizationResult
    where
        F: Fn(&Individual) -> f64 + Sync,
        O: FnMut(&GenerationState<'_>),
    {
        let n = self.config.population_size;
        let generations = self.config.generations;

        info!(
            params = self.space.len(),
            population = n,
            generations,
            crossover = self.config.crossover_rate,
            mutation = self.config.mutation_rate,
            elites = self.config.elite_keep,
            "Starting genetic optimization"
        );

        let mut population: Vec<Individual> =
            (0..n).map(|_| self.space.sample(&mut self.rng)).collect();
        let mut best: Option<(Individual, f64)> = None;
        let mut history = Vec::with_capacity(generations);
        let mut evaluations = 0usize;

        for generation in 0..generations {
            let fitnesses = self.evaluate_population(&population, &fitness_fn);
            evaluations += fitnesses.len();

            for (individual, &fitness) in population.iter().zip(&fitnesses) {
                let improves = match &best {
                    Some((_, incumbent)) => fitness > *incumbent,
                    None => true,
                };
                if improves {
                    best = Some((individual.clone(), fitness));
                }
            }

            let Some((best_individual, best_fitness)) = &best else {
                break;
            };

            let summary = summarize(generation, &fitnesses, *best_fitness);
            debug!(
                generation,
                gen_best = summary.best_fitness,
                mean = summary.mean_fitness,
                all_time_best = summary.all_time_best,
                "Generation evaluated"
            );
            history.push(summary);

            observer(&GenerationState {
                generation,
                population: &population,
                fitnesses: &fitnesses,
                best: best_individual,
                best_fitness: *best_fitness,
            });

            // The last generation is never bred from
            if generation + 1 < generations {
                population = self.next_generation(&population, &fitnesses);
            }
        }

        let (best, best_fitness) = best.unwrap_or_else(|| (Individual::new(), f64::NEG_INFINITY));

        info!(
            best_fitness,
            best = %best,
            evaluations,
            "Genetic optimization complete"
        );

        OptimizationResult {
            best,
            best_fitness,
            history,
            evaluations,
        }
    }

    fn evaluate_population<F>(&self, population: &[Individual], fitness_fn: &F) -> Vec<f64>
    where
        F: Fn(&Individual) -> f64 + Sync,
    {
        let raw: Vec<f64> = if self.config.parallel {
            population.par_iter().map(fitness_fn).collect()
        } else {
            population.iter().map(fitness_fn).collect()
        };

        raw.into_iter()
            .map(|f| {
                if f.is_nan() {
                    warn!("Fitness function returned NaN, treating as -inf");
                    f64::NEG_INFINITY
                } else {
                    f
                }
            })
            .collect()
    }

    fn next_generation(&mut self, population: &[Individual], fitnesses: &[f64]) -> Vec<Individual> {
        let n = self.config.population_size;

        let mut next = select_top(population, fitnesses, self.config.elite_keep, &mut self.rng);
        let pool = select_top(population, fitnesses, n, &mut self.rng);

        while next.len() < n {
            let parents: Vec<&Individual> = pool.choose_multiple(&mut self.rng, 2).collect();
            let (a, b) = match parents.as_slice() {
                [a, b] => (*a, *b),
                _ => break,
            };
            let child = crossover(&self.space, a, b, self.config.crossover_rate, &mut self.rng);
            let child = mutate(&self.space, &child, self.config.mutation_rate, &mut self.rng);
            next.push(child);
        }

        next.truncate(n);
        next
    }
}

fn summarize(generation: usize, fitnesses: &[f64], all_time_best: f64) -> GenerationSummary {
    let best_fitness = fitnesses.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean_fitness = if fitnesses.is_empty() {
        0.0
    } else {
        fitnesses.iter().sum::<f64>() / fitnesses.len() as f64
    };
    GenerationSummary {
        generation,
        best_fitness,
        mean_fitness,
        all_time_best,
    }
}

// ============================================================================
// Operators
// ============================================================================

/// Top `k` individuals by fitness, descending. Exact ties are broken by a
/// uniform random key, never by position.
pub fn select_top<R: Rng + ?Sized>(
    population: &[Individual],
    fitnesses: &[f64],
    k: usize,
    rng: &mut R,
) -> Vec<Individual> {
    let mut keyed: Vec<(f64, f64, usize)> = fitnesses
        .iter()
        .enumerate()
        .map(|(i, &f)| (f, rng.gen::<f64>(), i))
        .collect();

    keyed.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| b.1.total_cmp(&a.1)));

    keyed
        .into_iter()
        .take(k)
        .filter_map(|(_, _, i)| population.get(i).cloned())
        .collect()
}

/// Arithmetic blend crossover. Each gene of `a` is blended with `b`'s with
/// probability `rate`, otherwise (or when `b` lacks it) copied from `a`.
pub fn crossover<R: Rng + ?Sized>(
    space: &ParameterSpace,
    a: &Individual,
    b: &Individual,
    rate: f64,
    rng: &mut R,
) -> Individual {
    a.iter()
        .map(|(key, &va)| {
            let value = match (b.get(key), space.get(key)) {
                (Some(vb), Some(bounds)) if rng.gen::<f64>() < rate => {
                    let t: f64 = rng.gen();
                    bounds.clip((1.0 - t) * va.as_f64() + t * vb.as_f64())
                }
                _ => va,
            };
            (key.clone(), value)
        })
        .collect()
}

/// Type-aware perturbation. Each gene mutates with probability `rate`:
/// integers step by up to `max(1, span / 5)`, reals by up to ±10% of the span.
pub fn mutate<R: Rng + ?Sized>(
    space: &ParameterSpace,
    individual: &Individual,
    rate: f64,
    rng: &mut R,
) -> Individual {
    let mut mutated = individual.clone();

    for (key, bounds) in space.iter() {
        if rng.gen::<f64>() >= rate {
            continue;
        }
        let Some(current) = individual.get(key) else {
            continue;
        };

        let value = match *bounds {
            ParamBounds::Integer { low, high } => {
                let step = i64::try_from(high.abs_diff(low) / 5)
                    .unwrap_or(i64::MAX)
                    .max(1);
                let delta = rng.gen_range(-step..=step);
                let base = current.as_i64().unwrap_or(current.as_f64().round() as i64);
                ParamValue::Int(base.saturating_add(delta).clamp(low, high))
            }
            ParamBounds::Real { low, high } => {
                let span = high - low;
                let fifth = if span.is_finite() {
                    span * 0.2
                } else {
                    high * 0.2 - low * 0.2
                };
                let delta = fifth * (rng.gen::<f64>() - 0.5);
                bounds.clip(current.as_f64() + delta)
            }
        };
        mutated = mutated.with(key, value);
    }

    mutated
}

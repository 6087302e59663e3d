// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Observed outcome counts per circuit.
//!
//! A [`DataSet`] is assembled through a [`DataSetBuilder`] and is immutable
//! once built. [`generate_data`] simulates counts from a model.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Binomial, Distribution};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::circuit::{Circuit, Outcome};
use crate::error::{Error, Result};
use crate::forward::{bulk_probabilities, EvalLayout, LayoutOptions};
use crate::model::Model;
use crate::validation::validate_counts;

/// Immutable map from circuit to outcome counts.
#[derive(Debug, Clone, Default)]
pub struct DataSet {
    circuits: Vec<Circuit>,
    index: HashMap<Circuit, usize>,
    rows: Vec<BTreeMap<Outcome, f64>>,
}

impl DataSet {
    pub fn builder() -> DataSetBuilder {
        DataSetBuilder::default()
    }

    /// Number of circuits with data.
    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    pub fn contains(&self, circuit: &Circuit) -> bool {
        self.index.contains_key(circuit)
    }

    /// Circuits in insertion order.
    pub fn circuits(&self) -> impl Iterator<Item = &Circuit> {
        self.circuits.iter()
    }

    /// Outcome counts recorded for `circuit`.
    pub fn get_counts(&self, circuit: &Circuit) -> Option<&BTreeMap<Outcome, f64>> {
        self.index.get(circuit).map(|&i| &self.rows[i])
    }

    /// Count for one outcome; outcomes never observed count as zero.
    pub fn count(&self, circuit: &Circuit, outcome: &Outcome) -> f64 {
        self.get_counts(circuit)
            .and_then(|row| row.get(outcome))
            .copied()
            .unwrap_or(0.0)
    }

    /// Sum of counts over all outcomes of `circuit`.
    pub fn total_count(&self, circuit: &Circuit) -> Option<f64> {
        self.get_counts(circuit).map(|row| row.values().sum())
    }
}

/// Accumulates counts before freezing them into a [`DataSet`].
#[derive(Debug, Default)]
pub struct DataSetBuilder {
    data: DataSet,
}

impl DataSetBuilder {
    /// Add counts for `circuit`, summing with any counts already present.
    pub fn add_counts<I, O>(&mut self, circuit: Circuit, counts: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (O, f64)>,
        O: Into<Outcome>,
    {
        let counts: Vec<(Outcome, f64)> = counts.into_iter().map(|(o, n)| (o.into(), n)).collect();
        validate_counts(&circuit, counts.iter().map(|(_, n)| *n))?;

        let data = &mut self.data;
        let idx = match data.index.get(&circuit) {
            Some(&i) => i,
            None => {
                data.index.insert(circuit.clone(), data.circuits.len());
                data.circuits.push(circuit);
                data.rows.push(BTreeMap::new());
                data.rows.len() - 1
            }
        };
        for (outcome, n) in counts {
            *data.rows[idx].entry(outcome).or_insert(0.0) += n;
        }
        Ok(self)
    }

    pub fn build(self) -> DataSet {
        self.data
    }
}

/// How simulated counts are drawn from model probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    /// Counts equal N·p (not integral in general).
    Expected,
    /// Multinomial draw from a seeded generator.
    Multinomial { seed: u64 },
}

/// Simulate `num_samples` shots of every circuit under `model`.
pub fn generate_data(
    model: &Model,
    circuits: &[Circuit],
    num_samples: u64,
    sampling: Sampling,
) -> Result<DataSet> {
    let layout = EvalLayout::new(model, circuits, &LayoutOptions::default())?;
    let probs = bulk_probabilities(model, &layout)?;
    let mut rng = match sampling {
        Sampling::Multinomial { seed } => Some(StdRng::seed_from_u64(seed)),
        Sampling::Expected => None,
    };

    let mut builder = DataSet::builder();
    for (ci, circuit) in circuits.iter().enumerate() {
        let range = layout.element_range(ci);
        let elements = &layout.elements()[range.clone()];
        let p: Vec<f64> = probs
            .slice(ndarray::s![range])
            .iter()
            .map(|p| p.clamp(0.0, 1.0))
            .collect();

        let counts: Vec<f64> = match rng.as_mut() {
            None => p.iter().map(|p| p * num_samples as f64).collect(),
            Some(rng) => multinomial(rng, num_samples, &p)?,
        };
        builder.add_counts(
            circuit.clone(),
            elements.iter().map(|e| e.outcome.clone()).zip(counts),
        )?;
    }
    debug!(
        num_circuits = circuits.len(),
        num_samples, "generated simulated data"
    );
    Ok(builder.build())
}

/// Multinomial sample via sequential conditional binomials.
fn multinomial(rng: &mut StdRng, n: u64, probs: &[f64]) -> Result<Vec<f64>> {
    let mut counts = vec![0.0; probs.len()];
    let mut remaining = n;
    let mut mass: f64 = probs.iter().sum();
    for (k, &p) in probs.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        if k + 1 == probs.len() {
            counts[k] = remaining as f64;
            break;
        }
        let conditional = if mass > 0.0 { (p / mass).clamp(0.0, 1.0) } else { 0.0 };
        let draw = Binomial::new(remaining, conditional)
            .map_err(|e| Error::Config(format!("invalid sampling probability: {}", e)))?
            .sample(rng);
        counts[k] = draw as f64;
        remaining -= draw;
        mass -= p;
    }
    Ok(counts)
}

// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Circuits, outcome labels, and construction of the nested circuit lists
//! used by iterative long-sequence GST.

use std::collections::HashSet;
use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};

/// An ordered sequence of operation labels, applied left to right.
///
/// A circuit may optionally begin with a preparation label and end with a
/// POVM label; otherwise the model's defaults are used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Circuit {
    labels: Vec<String>,
}

impl Circuit {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    /// The empty circuit `{}`.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Number of labels in the circuit.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `self` followed by `other`.
    pub fn concat(&self, other: &Circuit) -> Circuit {
        let mut labels = Vec::with_capacity(self.len() + other.len());
        labels.extend_from_slice(&self.labels);
        labels.extend_from_slice(&other.labels);
        Circuit { labels }
    }

    /// `self` repeated `n` times.
    pub fn repeat(&self, n: usize) -> Circuit {
        Circuit {
            labels: (0..n).flat_map(|_| self.labels.iter().cloned()).collect(),
        }
    }

    /// The germ power `self^⌊max_length / len⌋` (empty for an empty germ).
    pub fn repeat_to_length(&self, max_length: usize) -> Circuit {
        if self.is_empty() {
            return Circuit::empty();
        }
        self.repeat(max_length / self.len())
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            write!(f, "{{}}")
        } else {
            write!(f, "{}", self.labels.concat())
        }
    }
}

impl Add for &Circuit {
    type Output = Circuit;

    fn add(self, rhs: &Circuit) -> Circuit {
        self.concat(rhs)
    }
}

impl From<&[&str]> for Circuit {
    fn from(labels: &[&str]) -> Self {
        Circuit::new(labels.iter().copied())
    }
}

/// Outcome label of one measurement record.
///
/// Plain POVM measurements have a single part (e.g. `"0"`); circuits with
/// intermediate instruments prepend one part per instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Outcome(Vec<String>);

impl Outcome {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Outcome(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for Outcome {
    fn from(label: &str) -> Self {
        Outcome(vec![label.to_string()])
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}

/// Build the nested circuit lists for long-sequence GST.
///
/// List `i` contains every circuit of list `i - 1` followed by
/// `prep + germ^⌊L/|germ|⌋ + meas` for `L = max_lengths[i]`, every germ
/// with `|germ| ≤ L` and every fiducial pair. Duplicates are dropped and
/// first-seen order is kept, so each list is a prefix of the next.
pub fn make_lsgst_lists(
    prep_fiducials: &[Circuit],
    meas_fiducials: &[Circuit],
    germs: &[Circuit],
    max_lengths: &[usize],
) -> Vec<Vec<Circuit>> {
    let mut seen = HashSet::new();
    let mut current = Vec::new();
    let mut lists = Vec::with_capacity(max_lengths.len());

    for &max_length in max_lengths {
        for germ in germs {
            if germ.is_empty() || germ.len() > max_length {
                continue;
            }
            let power = germ.repeat_to_length(max_length);
            for prep in prep_fiducials {
                for meas in meas_fiducials {
                    let circuit = &(prep + &power) + meas;
                    if seen.insert(circuit.clone()) {
                        current.push(circuit);
                    }
                }
            }
        }
        lists.push(current.clone());
    }
    lists
}

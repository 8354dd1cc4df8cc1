use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::slugify;

const MAX_OVERLAP_TERMS: usize = 1 << 16;

/// One concrete assignment of a value to every matrix dimension.
pub type Combination = IndexMap<String, String>;

/// A parameterized job template over named dimensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixSpec {
    /// Dimensions in declared order, each with values in declared order
    pub dimensions: IndexMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adjustments: Vec<Adjustment>,
}

/// A partial or complete combination that is either skipped or added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub with: IndexMap<String, String>,
    pub skip: bool,
}

/// Documented size limits of a target's matrix construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MatrixLimits {
    pub max_dimensions: usize,
    pub max_values_per_dimension: usize,
    pub max_adjustments: usize,
    pub max_jobs: usize,
}

impl MatrixSpec {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_dimension(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.dimensions.insert(name.into(), values);
        self
    }

    #[must_use]
    pub fn with_adjustment(mut self, with: IndexMap<String, String>, skip: bool) -> Self {
        self.adjustments.push(Adjustment { with, skip });
        self
    }

    /// Materializes the matrix into concrete combinations.
    ///
    /// Dimensions are iterated in declared order and combinations follow the
    /// lexicographic order of declared value positions. Combinations matching
    /// a skip adjustment are dropped; complete non-skip adjustments that are
    /// not already present are appended in declared order.
    pub fn combinations(&self) -> Vec<Combination> {
        let mut result: Vec<Combination> = vec![IndexMap::new()];
        for (name, values) in &self.dimensions {
            let mut next = Vec::with_capacity(result.len() * values.len().max(1));
            for partial in &result {
                for value in values {
                    let mut combination = partial.clone();
                    combination.insert(name.clone(), value.clone());
                    next.push(combination);
                }
            }
            result = next;
        }

        if self.dimensions.is_empty() {
            result.clear();
        }

        result.retain(|combination| !self.is_skipped(combination));

        for addition in self.adjustments.iter().filter(|a| !a.skip) {
            if !self.is_complete(&addition.with) {
                continue;
            }
            let combination: Combination = self
                .dimensions
                .keys()
                .filter_map(|k| addition.with.get(k).map(|v| (k.clone(), v.clone())))
                .collect();
            if !result.contains(&combination) {
                result.push(combination);
            }
        }

        result
    }

    /// Materializes the combinations only when there are at most `limit`.
    pub fn combinations_within(&self, limit: usize) -> Option<Vec<Combination>> {
        match self.combination_count() {
            Some(count) if count <= limit => Some(self.combinations()),
            _ => None,
        }
    }

    /// Number of combinations [`Self::combinations`] yields, counted without
    /// building them.
    ///
    /// Skips are subtracted by inclusion-exclusion over the skip patterns.
    /// `None` when the count overflows or the skip patterns overlap in too
    /// many ways to count.
    pub fn combination_count(&self) -> Option<usize> {
        if self.dimensions.is_empty() {
            return Some(0);
        }
        let product = self
            .dimensions
            .values()
            .try_fold(1usize, |acc, values| acc.checked_mul(values.len()))?;

        let skips: Vec<&IndexMap<String, String>> =
            self.adjustments.iter().filter(|a| a.skip).map(|a| &a.with).collect();
        let mut skipped: i128 = 0;
        let mut budget = MAX_OVERLAP_TERMS;
        self.count_overlaps(&skips, 0, &IndexMap::new(), 1, &mut skipped, &mut budget)?;
        let remaining = product.checked_sub(usize::try_from(skipped).ok()?)?;

        let mut added: Vec<Combination> = Vec::new();
        for addition in self.adjustments.iter().filter(|a| !a.skip) {
            if !self.is_complete(&addition.with) {
                continue;
            }
            let combination: Combination = self
                .dimensions
                .keys()
                .filter_map(|k| addition.with.get(k).map(|v| (k.clone(), v.clone())))
                .collect();
            let generated = self.in_cross_product(&combination) && !self.is_skipped(&combination);
            if !generated && !added.contains(&combination) {
                added.push(combination);
            }
        }
        remaining.checked_add(added.len())
    }

    /// Adds `sign * |pattern ∩ skips[i..]|` terms, alternating sign per depth.
    fn count_overlaps(
        &self,
        skips: &[&IndexMap<String, String>],
        start: usize,
        pattern: &IndexMap<String, String>,
        sign: i128,
        total: &mut i128,
        budget: &mut usize,
    ) -> Option<()> {
        for (i, skip) in skips.iter().enumerate().skip(start) {
            let Some(merged) = merge_patterns(pattern, skip) else {
                continue;
            };
            let matching = self.matching(&merged);
            // Every superset of an empty intersection is empty too.
            if matching == 0 {
                continue;
            }
            *budget = budget.checked_sub(1)?;
            *total += sign * i128::try_from(matching).ok()?;
            self.count_overlaps(skips, i + 1, &merged, -sign, total, budget)?;
        }
        Some(())
    }

    /// Cross-product combinations matching every entry of `pattern`.
    fn matching(&self, pattern: &IndexMap<String, String>) -> usize {
        if pattern.keys().any(|k| !self.dimensions.contains_key(k)) {
            return 0;
        }
        self.dimensions
            .iter()
            .map(|(name, values)| match pattern.get(name) {
                Some(value) => values.iter().filter(|v| *v == value).count(),
                None => values.len(),
            })
            .product()
    }

    fn in_cross_product(&self, combination: &Combination) -> bool {
        self.dimensions
            .iter()
            .all(|(name, values)| combination.get(name).is_some_and(|v| values.contains(v)))
    }

    fn is_skipped(&self, combination: &Combination) -> bool {
        self.adjustments
            .iter()
            .filter(|a| a.skip)
            .any(|a| a.with.iter().all(|(k, v)| combination.get(k) == Some(v)))
    }

    fn is_complete(&self, with: &IndexMap<String, String>) -> bool {
        self.dimensions.keys().all(|k| with.contains_key(k))
    }

    /// Checks the matrix against a target's documented limits.
    ///
    /// The adjustment limit only applies when the native matrix construct is used.
    ///
    /// # Errors
    ///
    /// Returns a description of the first exceeded limit.
    pub fn check_limits(&self, limits: &MatrixLimits, native: bool) -> Result<(), String> {
        if self.dimensions.len() > limits.max_dimensions {
            return Err(format!(
                "{} dimensions (limit {})",
                self.dimensions.len(),
                limits.max_dimensions
            ));
        }
        if let Some((name, values)) = self
            .dimensions
            .iter()
            .find(|(_, values)| values.len() > limits.max_values_per_dimension)
        {
            return Err(format!(
                "dimension '{name}' has {} values (limit {})",
                values.len(),
                limits.max_values_per_dimension
            ));
        }
        if native && self.adjustments.len() > limits.max_adjustments {
            return Err(format!(
                "{} adjustments (limit {})",
                self.adjustments.len(),
                limits.max_adjustments
            ));
        }
        match self.combination_count() {
            Some(jobs) if jobs <= limits.max_jobs => Ok(()),
            Some(jobs) => Err(format!("{jobs} jobs (limit {})", limits.max_jobs)),
            None => Err(format!("more jobs than can be counted (limit {})", limits.max_jobs)),
        }
    }

    /// Names of dimensions referenced through `{{matrix.NAME}}` tokens in `text`.
    pub fn references_in<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.dimensions
            .keys()
            .map(String::as_str)
            .filter(move |name| text.contains(&matrix_token(name)))
    }
}

/// Union of two skip patterns, `None` when they disagree on a dimension.
fn merge_patterns(a: &IndexMap<String, String>, b: &IndexMap<String, String>) -> Option<IndexMap<String, String>> {
    let mut merged = a.clone();
    for (name, value) in b {
        match merged.get(name) {
            Some(existing) if existing != value => return None,
            Some(_) => {}
            None => {
                merged.insert(name.clone(), value.clone());
            }
        }
    }
    Some(merged)
}

/// Canonical IR token referencing a matrix dimension.
pub fn matrix_token(name: &str) -> String {
    format!("{{{{matrix.{name}}}}}")
}

/// Replaces every matrix token in `text` with the combination's values.
pub fn substitute(text: &str, combination: &Combination) -> String {
    combination
        .iter()
        .fold(text.to_string(), |acc, (name, value)| {
            acc.replace(&matrix_token(name), value)
        })
}

/// Id suffix for an expanded combination (`linux-18`).
pub fn combination_suffix(combination: &Combination) -> String {
    combination
        .values()
        .map(|v| slugify(v))
        .collect::<Vec<_>>()
        .join("-")
}

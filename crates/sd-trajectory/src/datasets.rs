//! Merge named data sets into one contiguous array and split results back.
//!
//! Merging concatenates along the first axis in the iteration order of the
//! input map; the recorded ranges make the split exact.

use std::ops::Range;

use indexmap::IndexMap;
use ndarray::{ArrayD, Axis, IxDyn, Slice, concatenate};
use tracing::debug;

use crate::{TrajectoryError, TrajectoryResult};

pub type DataSets = IndexMap<String, ArrayD<f64>>;

/// Where each data set lives in a merged array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitPlan {
    ranges: IndexMap<String, Range<usize>>,
}

impl SplitPlan {
    pub fn ranges(&self) -> &IndexMap<String, Range<usize>> {
        &self.ranges
    }

    /// Length of the merged first axis.
    pub fn total_len(&self) -> usize {
        self.ranges.values().map(|r| r.end).max().unwrap_or(0)
    }
}

pub fn merge_data_sets(sets: &DataSets) -> TrajectoryResult<(ArrayD<f64>, SplitPlan)> {
    let mut ranges = IndexMap::with_capacity(sets.len());
    let mut start = 0;
    for (name, values) in sets {
        if values.ndim() == 0 {
            return Err(TrajectoryError::invalid(format!(
                "data set '{name}' is a scalar"
            )));
        }
        let end = start + values.len_of(Axis(0));
        ranges.insert(name.clone(), start..end);
        start = end;
    }

    let merged = if sets.is_empty() {
        ArrayD::zeros(IxDyn(&[0]))
    } else {
        let views: Vec<_> = sets.values().map(|v| v.view()).collect();
        concatenate(Axis(0), &views)?
    };
    debug!(sets = sets.len(), len = start, "data sets merged");
    Ok((merged, SplitPlan { ranges }))
}

pub fn split_data_sets(merged: &ArrayD<f64>, plan: &SplitPlan) -> TrajectoryResult<DataSets> {
    let len = if merged.ndim() == 0 {
        0
    } else {
        merged.len_of(Axis(0))
    };
    if merged.ndim() == 0 || len != plan.total_len() {
        return Err(TrajectoryError::Split {
            name: "<merged>".to_string(),
            reason: format!(
                "first axis has length {len}, plan expects {}",
                plan.total_len()
            ),
        });
    }

    Ok(plan
        .ranges
        .iter()
        .map(|(name, range)| {
            let part = merged
                .slice_axis(Axis(0), Slice::from(range.clone()))
                .to_owned();
            (name.clone(), part)
        })
        .collect())
}

/// [`merge_data_sets`] for every tracer.
pub fn merge_tracer_data_sets(
    tracers: &IndexMap<String, DataSets>,
) -> TrajectoryResult<(IndexMap<String, ArrayD<f64>>, IndexMap<String, SplitPlan>)> {
    let mut merged = IndexMap::with_capacity(tracers.len());
    let mut plans = IndexMap::with_capacity(tracers.len());
    for (tracer, sets) in tracers {
        let (values, plan) = merge_data_sets(sets)?;
        merged.insert(tracer.clone(), values);
        plans.insert(tracer.clone(), plan);
    }
    Ok((merged, plans))
}

pub fn split_tracer_data_sets(
    values: &IndexMap<String, ArrayD<f64>>,
    plans: &IndexMap<String, SplitPlan>,
) -> TrajectoryResult<IndexMap<String, DataSets>> {
    values
        .iter()
        .map(|(tracer, merged)| {
            let plan = plans.get(tracer).ok_or_else(|| TrajectoryError::Split {
                name: tracer.clone(),
                reason: "no split plan recorded for tracer".to_string(),
            })?;
            Ok((tracer.clone(), split_data_sets(merged, plan)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};
    use proptest::prelude::*;

    #[test]
    fn merge_keeps_trailing_axes() {
        let mut sets = DataSets::new();
        sets.insert("b".to_string(), Array2::<f64>::ones((2, 3)).into_dyn());
        sets.insert("a".to_string(), Array2::<f64>::zeros((1, 3)).into_dyn());

        let (merged, plan) = merge_data_sets(&sets).unwrap();
        assert_eq!(merged.shape(), &[3, 3]);
        assert_eq!(plan.ranges()["b"], 0..2);
        assert_eq!(plan.ranges()["a"], 2..3);

        let split = split_data_sets(&merged, &plan).unwrap();
        assert_eq!(split.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(split, sets);
    }

    #[test]
    fn mismatched_trailing_shapes_fail() {
        let mut sets = DataSets::new();
        sets.insert("a".to_string(), Array2::<f64>::ones((2, 3)).into_dyn());
        sets.insert("b".to_string(), Array2::<f64>::ones((2, 2)).into_dyn());
        assert!(matches!(merge_data_sets(&sets), Err(TrajectoryError::Shape(_))));
    }

    #[test]
    fn split_rejects_wrong_length() {
        let mut sets = DataSets::new();
        sets.insert("a".to_string(), array![1.0, 2.0].into_dyn());
        let (_, plan) = merge_data_sets(&sets).unwrap();
        let wrong = array![1.0, 2.0, 3.0].into_dyn();
        assert!(matches!(
            split_data_sets(&wrong, &plan),
            Err(TrajectoryError::Split { .. })
        ));
    }

    #[test]
    fn empty_mapping_round_trips() {
        let (merged, plan) = merge_data_sets(&DataSets::new()).unwrap();
        assert_eq!(merged.len(), 0);
        assert!(split_data_sets(&merged, &plan).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn split_inverts_merge(
            columns in 1usize..4,
            sets in prop::collection::vec(prop::collection::vec(-1e6_f64..1e6, 0..12), 0..6),
        ) {
            let mut input = DataSets::new();
            for (i, values) in sets.into_iter().enumerate() {
                let rows = values.len() / columns;
                let values: Vec<f64> = values.into_iter().take(rows * columns).collect();
                let array = ArrayD::from_shape_vec(IxDyn(&[rows, columns]), values).unwrap();
                input.insert(format!("set_{i}"), array);
            }

            let (merged, plan) = merge_data_sets(&input).unwrap();
            let output = split_data_sets(&merged, &plan).unwrap();
            prop_assert_eq!(output, input);
        }
    }
}

//! Ready-made operators
//!
//! Small aggregates, transforms and one iterative clustering operator, used
//! by the CLI demos and the integration tests.

mod aggregates;
mod kmeans;
mod transforms;

pub use aggregates::{
    Average, AverageState, BoundedPasses, BoundedPassesState, Collect, CollectState, Count,
    CountState, GroupCount, GroupCountState, PassCounter, Sum, SumState,
};
pub use kmeans::{KMeans1d, KMeansRound, KMeansState};
pub use transforms::{Center, CenterState, Filter, FilterState, Scale, ScaleState};

use crate::chunk::Value;
use std::cmp::Ordering;

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int64(_) | Value::Float64(_) => 2,
        Value::Utf8(_) => 3,
    }
}

/// Total order over values: nulls first, numbers compared across types
pub(crate) fn value_order(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int64(x), Value::Int64(y)) => x.cmp(y),
        (Value::Float64(x), Value::Float64(y)) => x.total_cmp(y),
        (Value::Int64(x), Value::Float64(y)) => (*x as f64).total_cmp(y),
        (Value::Float64(x), Value::Int64(y)) => x.total_cmp(&(*y as f64)),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Utf8(x), Value::Utf8(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_order() {
        let mut values = vec![
            Value::Utf8("b".into()),
            Value::Float64(2.5),
            Value::Null,
            Value::Int64(2),
            Value::Bool(true),
            Value::Int64(-1),
        ];
        values.sort_by(value_order);
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Int64(-1),
                Value::Int64(2),
                Value::Float64(2.5),
                Value::Utf8("b".into()),
            ]
        );
    }
}

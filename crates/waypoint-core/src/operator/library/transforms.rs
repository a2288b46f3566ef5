use super::aggregates::AverageState;
use crate::chunk::{DataType, QueryId, SlotId, Value};
use crate::error::{Error, Result};
use crate::operator::gt::{Gt, GtDescriptor};
use crate::operator::state::ConstantInputs;

/// Multiplies a numeric column by a constant factor
#[derive(Debug, Clone, Copy)]
pub struct Scale {
    slot: SlotId,
    factor: f64,
}

impl Scale {
    /// `slot * factor`
    pub fn new(slot: SlotId, factor: f64) -> Self {
        Self { slot, factor }
    }
}

/// Per-chunk scaling state
#[derive(Debug, Clone, Copy)]
pub struct ScaleState {
    factor: f64,
}

impl Gt for ScaleState {
    type Constant = f64;

    fn init(factor: &f64) -> Self {
        Self { factor: *factor }
    }

    fn process_tuple(&mut self, row: &[Value], out: &mut Vec<Vec<Value>>) -> Result<()> {
        let scaled = row[0].as_f64().map_or(Value::Null, |v| Value::Float64(v * self.factor));
        out.push(vec![scaled]);
        Ok(())
    }
}

impl GtDescriptor for Scale {
    type State = ScaleState;

    fn inputs(&self) -> Vec<SlotId> {
        vec![self.slot]
    }

    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        vec![(0, DataType::Float64)]
    }

    fn constant(&self, _query: QueryId, _upstream: &ConstantInputs) -> Result<f64> {
        Ok(self.factor)
    }
}

/// Keeps tuples whose test column is at least `min`, projecting `columns`
#[derive(Debug, Clone)]
pub struct Filter {
    columns: Vec<(SlotId, DataType)>,
    test: SlotId,
    min: f64,
}

impl Filter {
    /// Select rows with `test >= min`. `test` must be one of `columns`.
    pub fn new(columns: Vec<(SlotId, DataType)>, test: SlotId, min: f64) -> Self {
        Self { columns, test, min }
    }
}

/// Position of the test column and the threshold
#[derive(Debug, Clone, Copy)]
pub struct FilterState {
    test: usize,
    min: f64,
}

impl Gt for FilterState {
    type Constant = (usize, f64);

    fn init(&(test, min): &(usize, f64)) -> Self {
        Self { test, min }
    }

    fn process_tuple(&mut self, row: &[Value], out: &mut Vec<Vec<Value>>) -> Result<()> {
        if row[self.test].as_f64().is_some_and(|v| v >= self.min) {
            out.push(row.to_vec());
        }
        Ok(())
    }
}

impl GtDescriptor for Filter {
    type State = FilterState;

    fn inputs(&self) -> Vec<SlotId> {
        self.columns.iter().map(|(s, _)| *s).collect()
    }

    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        self.columns.clone()
    }

    fn constant(&self, query: QueryId, _upstream: &ConstantInputs) -> Result<(usize, f64)> {
        let test = self
            .columns
            .iter()
            .position(|(s, _)| *s == self.test)
            .ok_or_else(|| {
                Error::plan(
                    "filter",
                    Some(query),
                    format!("test slot {} is not projected", self.test),
                )
            })?;
        Ok((test, self.min))
    }
}

/// Subtracts the mean computed by an upstream [`Average`](super::Average)
/// waypoint finalized as state
#[derive(Debug, Clone, Copy)]
pub struct Center {
    slot: SlotId,
}

impl Center {
    /// `slot - mean(slot)`
    pub fn new(slot: SlotId) -> Self {
        Self { slot }
    }
}

/// Mean to subtract
#[derive(Debug, Clone, Copy)]
pub struct CenterState {
    mean: f64,
}

impl Gt for CenterState {
    type Constant = f64;

    fn init(mean: &f64) -> Self {
        Self { mean: *mean }
    }

    fn process_tuple(&mut self, row: &[Value], out: &mut Vec<Vec<Value>>) -> Result<()> {
        let centered = row[0].as_f64().map_or(Value::Null, |v| Value::Float64(v - self.mean));
        out.push(vec![centered]);
        Ok(())
    }
}

impl GtDescriptor for Center {
    type State = CenterState;

    fn inputs(&self) -> Vec<SlotId> {
        vec![self.slot]
    }

    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        vec![(0, DataType::Float64)]
    }

    fn constant(&self, _query: QueryId, upstream: &ConstantInputs) -> Result<f64> {
        // an average over no tuples centers nothing
        Ok(upstream.get::<AverageState>(0)?.mean().unwrap_or(0.0))
    }
}

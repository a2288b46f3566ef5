use super::value_order;
use crate::chunk::{DataType, QueryId, SlotId, Value};
use crate::error::{Error, Result};
use crate::operator::gla::{Gla, GlaDescriptor};
use crate::operator::state::ConstantInputs;
use std::collections::HashMap;
use xxhash_rust::xxh3::xxh3_64;

/// `COUNT(*)`
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

/// Tuples seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountState(pub u64);

impl Gla for CountState {
    type Constant = ();

    fn init(_: &()) -> Self {
        Self(0)
    }

    fn add_item(&mut self, _row: &[Value]) -> Result<()> {
        self.0 += 1;
        Ok(())
    }

    fn add_state(&mut self, other: Self) {
        self.0 += other.0;
    }

    fn finalize(&self, _fragment: usize) -> Result<Vec<Vec<Value>>> {
        Ok(vec![vec![Value::Int64(self.0 as i64)]])
    }
}

impl GlaDescriptor for Count {
    type State = CountState;

    fn inputs(&self) -> Vec<SlotId> {
        Vec::new()
    }

    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        vec![(0, DataType::Int64)]
    }

    fn constant(&self, _query: QueryId, _upstream: &ConstantInputs) -> Result<()> {
        Ok(())
    }
}

/// `SUM(slot)` over numeric values; nulls are skipped
#[derive(Debug, Clone, Copy)]
pub struct Sum {
    slot: SlotId,
}

impl Sum {
    /// Sum the values in `slot`
    pub fn new(slot: SlotId) -> Self {
        Self { slot }
    }
}

/// Running sum
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SumState(pub f64);

impl Gla for SumState {
    type Constant = ();

    fn init(_: &()) -> Self {
        Self(0.0)
    }

    fn add_item(&mut self, row: &[Value]) -> Result<()> {
        self.0 += row[0].as_f64().unwrap_or(0.0);
        Ok(())
    }

    fn add_state(&mut self, other: Self) {
        self.0 += other.0;
    }

    fn finalize(&self, _fragment: usize) -> Result<Vec<Vec<Value>>> {
        Ok(vec![vec![Value::Float64(self.0)]])
    }
}

impl GlaDescriptor for Sum {
    type State = SumState;

    fn inputs(&self) -> Vec<SlotId> {
        vec![self.slot]
    }

    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        vec![(0, DataType::Float64)]
    }

    fn constant(&self, _query: QueryId, _upstream: &ConstantInputs) -> Result<()> {
        Ok(())
    }
}

/// `AVG(slot)`; optionally handed downstream as a constant instead of a row
#[derive(Debug, Clone, Copy)]
pub struct Average {
    slot: SlotId,
    as_state: bool,
}

impl Average {
    /// Average of the values in `slot`
    pub fn new(slot: SlotId) -> Self {
        Self {
            slot,
            as_state: false,
        }
    }

    /// Finalize into an [`AverageState`] constant for a later waypoint
    #[must_use]
    pub fn as_state(mut self) -> Self {
        self.as_state = true;
        self
    }
}

/// Sum and count of non-null values
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AverageState {
    /// Sum of values
    pub sum: f64,
    /// Non-null values seen
    pub count: u64,
}

impl AverageState {
    /// Mean, or `None` before any value
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

impl Gla for AverageState {
    type Constant = ();

    fn init(_: &()) -> Self {
        Self::default()
    }

    fn add_item(&mut self, row: &[Value]) -> Result<()> {
        if let Some(v) = row[0].as_f64() {
            self.sum += v;
            self.count += 1;
        }
        Ok(())
    }

    fn add_state(&mut self, other: Self) {
        self.sum += other.sum;
        self.count += other.count;
    }

    fn finalize(&self, _fragment: usize) -> Result<Vec<Vec<Value>>> {
        let mean = self.mean().map_or(Value::Null, Value::Float64);
        Ok(vec![vec![mean]])
    }
}

impl GlaDescriptor for Average {
    type State = AverageState;

    fn inputs(&self) -> Vec<SlotId> {
        vec![self.slot]
    }

    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        vec![(0, DataType::Float64)]
    }

    fn constant(&self, _query: QueryId, _upstream: &ConstantInputs) -> Result<()> {
        Ok(())
    }

    fn finalize_as_state(&self) -> bool {
        self.as_state
    }
}

/// `SELECT key, COUNT(*) GROUP BY key`, finalized in several fragments
#[derive(Debug, Clone, Copy)]
pub struct GroupCount {
    key: SlotId,
    key_type: DataType,
    fragments: usize,
}

impl GroupCount {
    /// Group on `key`, emitting the groups in `fragments` pieces
    pub fn new(key: SlotId, key_type: DataType, fragments: usize) -> Self {
        Self {
            key,
            key_type,
            fragments: fragments.max(1),
        }
    }
}

/// Count per distinct key
#[derive(Debug, Clone)]
pub struct GroupCountState {
    fragments: usize,
    groups: HashMap<Vec<u8>, (Value, u64)>,
}

impl GroupCountState {
    /// Number of distinct keys
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }
}

fn group_key(value: &Value) -> Vec<u8> {
    let mut key = vec![u8::from(!value.is_null())];
    value.encode(&mut key);
    key
}

impl Gla for GroupCountState {
    type Constant = usize;

    fn init(fragments: &usize) -> Self {
        Self {
            fragments: *fragments,
            groups: HashMap::new(),
        }
    }

    fn add_item(&mut self, row: &[Value]) -> Result<()> {
        let entry = self
            .groups
            .entry(group_key(&row[0]))
            .or_insert_with(|| (row[0].clone(), 0));
        entry.1 += 1;
        Ok(())
    }

    fn add_state(&mut self, other: Self) {
        for (key, (value, count)) in other.groups {
            self.groups.entry(key).or_insert((value, 0)).1 += count;
        }
    }

    fn num_fragments(&self) -> usize {
        self.fragments
    }

    fn finalize(&self, fragment: usize) -> Result<Vec<Vec<Value>>> {
        let mut rows: Vec<(&Value, u64)> = self
            .groups
            .iter()
            .filter(|(key, _)| xxh3_64(key) % self.fragments as u64 == fragment as u64)
            .map(|(_, (value, count))| (value, *count))
            .collect();
        rows.sort_by(|a, b| value_order(a.0, b.0));
        Ok(rows
            .into_iter()
            .map(|(value, count)| vec![value.clone(), Value::Int64(count as i64)])
            .collect())
    }
}

impl GlaDescriptor for GroupCount {
    type State = GroupCountState;

    fn inputs(&self) -> Vec<SlotId> {
        vec![self.key]
    }

    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        vec![(0, self.key_type), (1, DataType::Int64)]
    }

    fn constant(&self, _query: QueryId, _upstream: &ConstantInputs) -> Result<usize> {
        Ok(self.fragments)
    }
}

/// Gathers a numeric column into a constant for a later waypoint
#[derive(Debug, Clone, Copy)]
pub struct Collect {
    slot: SlotId,
}

impl Collect {
    /// Collect the values in `slot`
    pub fn new(slot: SlotId) -> Self {
        Self { slot }
    }
}

/// Collected values, in no particular order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectState {
    /// Non-null values
    pub values: Vec<f64>,
}

impl Gla for CollectState {
    type Constant = ();

    fn init(_: &()) -> Self {
        Self::default()
    }

    fn add_item(&mut self, row: &[Value]) -> Result<()> {
        if let Some(v) = row[0].as_f64() {
            self.values.push(v);
        }
        Ok(())
    }

    fn add_state(&mut self, mut other: Self) {
        self.values.append(&mut other.values);
    }

    fn finalize(&self, _fragment: usize) -> Result<Vec<Vec<Value>>> {
        Ok(self.values.iter().map(|v| vec![Value::Float64(*v)]).collect())
    }
}

impl GlaDescriptor for Collect {
    type State = CollectState;

    fn inputs(&self) -> Vec<SlotId> {
        vec![self.slot]
    }

    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        vec![(0, DataType::Float64)]
    }

    fn constant(&self, _query: QueryId, _upstream: &ConstantInputs) -> Result<()> {
        Ok(())
    }

    fn finalize_as_state(&self) -> bool {
        true
    }
}

/// Counts tuples over a fixed number of passes of the same input
#[derive(Debug, Clone, Copy)]
pub struct BoundedPasses {
    passes: u32,
}

impl BoundedPasses {
    /// Run exactly `passes` passes (at least one)
    pub fn new(passes: u32) -> Self {
        Self {
            passes: passes.max(1),
        }
    }
}

/// Pass bookkeeping carried between passes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassCounter {
    /// Passes completed
    pub pass: u32,
    /// Passes to run
    pub passes: u32,
    /// Tuples seen by completed passes
    pub seen: u64,
}

/// Tuples seen in the current pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundedPassesState {
    pass: u32,
    seen: u64,
    tuples: u64,
}

impl Gla for BoundedPassesState {
    type Constant = PassCounter;

    fn init(constant: &PassCounter) -> Self {
        Self {
            pass: constant.pass,
            seen: constant.seen,
            tuples: 0,
        }
    }

    fn add_item(&mut self, _row: &[Value]) -> Result<()> {
        self.tuples += 1;
        Ok(())
    }

    fn add_state(&mut self, other: Self) {
        self.tuples += other.tuples;
    }

    fn should_iterate(&mut self, constant: &mut PassCounter) -> bool {
        constant.pass += 1;
        constant.seen += self.tuples;
        self.pass = constant.pass;
        self.seen = constant.seen - self.tuples;
        constant.pass < constant.passes
    }

    fn finalize(&self, _fragment: usize) -> Result<Vec<Vec<Value>>> {
        Ok(vec![vec![
            Value::Int64(i64::from(self.pass)),
            Value::Int64((self.seen + self.tuples) as i64),
        ]])
    }
}

impl GlaDescriptor for BoundedPasses {
    type State = BoundedPassesState;

    fn inputs(&self) -> Vec<SlotId> {
        Vec::new()
    }

    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        vec![(0, DataType::Int64), (1, DataType::Int64)]
    }

    fn constant(&self, query: QueryId, _upstream: &ConstantInputs) -> Result<PassCounter> {
        if self.passes == 0 {
            return Err(Error::plan("bounded_passes", Some(query), "zero passes requested"));
        }
        Ok(PassCounter {
            pass: 0,
            passes: self.passes,
            seen: 0,
        })
    }

    fn iterative(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_state() {
        let mut a = AverageState::init(&());
        a.add_item(&[Value::Int64(2)]).unwrap();
        a.add_item(&[Value::Null]).unwrap();
        let mut b = AverageState::init(&());
        b.add_item(&[Value::Float64(4.0)]).unwrap();
        a.add_state(b);
        approx::assert_relative_eq!(a.mean().unwrap(), 3.0);
        assert_eq!(AverageState::default().finalize(0).unwrap(), vec![vec![Value::Null]]);
    }

    #[test]
    fn test_group_count_fragments_partition_groups() {
        let mut state = GroupCountState::init(&3);
        for key in ["a", "b", "a", "c", "d", "a"] {
            state.add_item(&[Value::from(key)]).unwrap();
        }
        state.add_item(&[Value::Null]).unwrap();
        assert_eq!(state.num_groups(), 5);

        let mut all: Vec<Vec<Value>> = (0..state.num_fragments())
            .flat_map(|f| state.finalize(f).unwrap())
            .collect();
        assert_eq!(all.len(), 5);
        all.sort_by(|a, b| value_order(&a[0], &b[0]));
        assert_eq!(all[0], vec![Value::Null, Value::Int64(1)]);
        assert_eq!(all[1], vec![Value::from("a"), Value::Int64(3)]);
    }

    #[test]
    fn test_bounded_passes_bookkeeping() {
        let mut constant = PassCounter {
            pass: 0,
            passes: 3,
            seen: 0,
        };
        let mut last = None;
        for expected_more in [true, true, false] {
            let mut state = BoundedPassesState::init(&constant);
            for _ in 0..4 {
                state.add_item(&[]).unwrap();
            }
            assert_eq!(state.should_iterate(&mut constant), expected_more);
            last = Some(state);
        }
        assert_eq!(
            last.unwrap().finalize(0).unwrap(),
            vec![vec![Value::Int64(3), Value::Int64(12)]]
        );
    }
}

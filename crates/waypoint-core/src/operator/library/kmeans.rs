use super::aggregates::CollectState;
use crate::chunk::{DataType, QueryId, SlotId, Value};
use crate::error::Result;
use crate::operator::gist::{Gist, GistDescriptor};
use crate::operator::state::ConstantInputs;
use std::ops::Range;
use std::sync::Arc;

const POINTS_PER_TASK: usize = 4096;
const CONVERGED: f64 = 1e-9;

/// One-dimensional k-means over the values gathered by an upstream
/// [`Collect`](super::Collect) waypoint
#[derive(Debug, Clone, Copy)]
pub struct KMeans1d {
    k: usize,
    max_iterations: u32,
}

impl KMeans1d {
    /// `k` clusters, stopping after `max_iterations` rounds at the latest
    pub fn new(k: usize, max_iterations: u32) -> Self {
        Self {
            k: k.max(1),
            max_iterations: max_iterations.max(1),
        }
    }
}

/// Points, current centers and round bookkeeping
#[derive(Debug, Clone)]
pub struct KMeansState {
    points: Arc<Vec<f64>>,
    centers: Vec<f64>,
    counts: Vec<u64>,
    iteration: u32,
    max_iterations: u32,
}

/// Per-cluster sums of one round
#[derive(Debug, Clone, Default)]
pub struct KMeansRound {
    sums: Vec<f64>,
    counts: Vec<u64>,
}

impl KMeansState {
    /// Current centers
    pub fn centers(&self) -> &[f64] {
        &self.centers
    }

    /// Rounds completed
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    fn nearest(&self, point: f64) -> usize {
        let mut best = 0;
        for (i, c) in self.centers.iter().enumerate() {
            if (point - c).abs() < (point - self.centers[best]).abs() {
                best = i;
            }
        }
        best
    }
}

fn initial_centers(points: &[f64], k: usize) -> Vec<f64> {
    let mut sorted = points.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();
    if sorted.len() <= k {
        return sorted;
    }
    // evenly spaced quantiles
    (0..k)
        .map(|i| sorted[i * (sorted.len() - 1) / (k - 1).max(1)])
        .collect()
}

impl Gist for KMeansState {
    type Task = Range<usize>;
    type Round = KMeansRound;

    fn prepare_round(&mut self, parallelism: usize) -> Vec<Vec<Range<usize>>> {
        let tasks: Vec<Range<usize>> = (0..self.points.len())
            .step_by(POINTS_PER_TASK)
            .map(|start| start..(start + POINTS_PER_TASK).min(self.points.len()))
            .collect();
        let lists = parallelism.min(tasks.len()).max(1);
        let mut schedulers = vec![Vec::new(); lists];
        for (i, task) in tasks.into_iter().enumerate() {
            schedulers[i % lists].push(task);
        }
        schedulers
    }

    fn new_round(&self) -> KMeansRound {
        KMeansRound {
            sums: vec![0.0; self.centers.len()],
            counts: vec![0; self.centers.len()],
        }
    }

    fn do_step(&self, task: &Range<usize>, round: &mut KMeansRound) -> Result<()> {
        if self.centers.is_empty() {
            return Ok(());
        }
        for &point in &self.points[task.clone()] {
            let c = self.nearest(point);
            round.sums[c] += point;
            round.counts[c] += 1;
        }
        Ok(())
    }

    fn merge_round(&self, into: &mut KMeansRound, other: KMeansRound) {
        for (a, b) in into.sums.iter_mut().zip(other.sums) {
            *a += b;
        }
        for (a, b) in into.counts.iter_mut().zip(other.counts) {
            *a += b;
        }
    }

    fn should_iterate(&mut self, round: KMeansRound) -> bool {
        let mut moved = 0.0f64;
        for (i, center) in self.centers.iter_mut().enumerate() {
            if round.counts[i] > 0 {
                let next = round.sums[i] / round.counts[i] as f64;
                moved = moved.max((next - *center).abs());
                *center = next;
            }
        }
        self.counts = round.counts;
        self.iteration += 1;
        tracing::debug!(iteration = self.iteration, moved, "k-means round");
        moved > CONVERGED && self.iteration < self.max_iterations
    }

    fn finalize(&self) -> Result<Vec<Vec<Value>>> {
        Ok(self
            .centers
            .iter()
            .enumerate()
            .map(|(i, c)| {
                vec![
                    Value::Int64(i as i64),
                    Value::Float64(*c),
                    Value::Int64(self.counts.get(i).copied().unwrap_or(0) as i64),
                ]
            })
            .collect())
    }
}

impl GistDescriptor for KMeans1d {
    type State = KMeansState;

    fn output_schema(&self) -> Vec<(SlotId, DataType)> {
        vec![(0, DataType::Int64), (1, DataType::Float64), (2, DataType::Int64)]
    }

    fn init(&self, _query: QueryId, upstream: &ConstantInputs) -> Result<KMeansState> {
        let points = Arc::new(upstream.get::<CollectState>(0)?.values.clone());
        let centers = initial_centers(&points, self.k);
        Ok(KMeansState {
            counts: vec![0; centers.len()],
            centers,
            points,
            iteration: 0,
            max_iterations: self.max_iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::gist::GistOps;
    use crate::operator::state::ConstantState;

    fn run_to_end(ops: &dyn GistOps, query: QueryId, inputs: &ConstantInputs) -> Vec<Vec<Value>> {
        let mut state = ops.pre_process(query, inputs).unwrap();
        loop {
            let plan = ops.prepare_round(&mut state, 3).unwrap();
            let rounds = plan
                .schedulers
                .into_iter()
                .map(|s| ops.do_steps(&plan.snapshot, s).unwrap())
                .collect();
            let merged = ops.merge_rounds(&plan.snapshot, rounds).unwrap();
            if !ops.should_iterate(&mut state, merged).unwrap() {
                break;
            }
        }
        let chunk = ops.finalize(query, &state).unwrap();
        (0..chunk.num_tuples())
            .map(|t| chunk.row(t, &[0, 1, 2]).unwrap())
            .collect()
    }

    #[test]
    fn test_two_clusters() {
        let q = QueryId::new(0).unwrap();
        let inputs = ConstantInputs::new(vec![ConstantState::new(CollectState {
            values: vec![1.0, 10.2, 1.1, 9.8, 0.9, 10.0],
        })]);
        let rows = run_to_end(&KMeans1d::new(2, 20), q, &inputs);
        assert_eq!(rows.len(), 2);
        approx::assert_relative_eq!(rows[0][1].as_f64().unwrap(), 1.0, epsilon = 1e-9);
        approx::assert_relative_eq!(rows[1][1].as_f64().unwrap(), 10.0, epsilon = 1e-9);
        assert_eq!(rows[0][2], Value::Int64(3));
    }

    #[test]
    fn test_no_points() {
        let q = QueryId::new(0).unwrap();
        let inputs = ConstantInputs::new(vec![ConstantState::new(CollectState::default())]);
        assert!(run_to_end(&KMeans1d::new(3, 5), q, &inputs).is_empty());
    }

    #[test]
    fn test_tasks_cover_all_points() {
        let mut state = KMeansState {
            points: Arc::new(vec![0.0; 10_000]),
            centers: vec![0.0],
            counts: vec![0],
            iteration: 0,
            max_iterations: 1,
        };
        let lists = state.prepare_round(2);
        assert_eq!(lists.len(), 2);
        let covered: usize = lists.iter().flatten().map(|r| r.len()).sum();
        assert_eq!(covered, 10_000);
    }
}

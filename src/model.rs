//! Forward/backward pass and prediction.
//!
//! A `Model` is transient: it borrows the shared input/output matrices
//! for the duration of one training run or one batch of predictions and
//! carries its own scratch vectors, lookup tables and RNG. Workers each
//! build their own `Model` over the same matrices.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ordered_float::NotNan;

use crate::args::{Args, LossKind, ModelKind};
use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::quant::QMatrix;
use crate::rng::MinstdRand;

const SIGMOID_TABLE_SIZE: usize = 512;
const MAX_SIGMOID: f32 = 8.0;
const LOG_TABLE_SIZE: usize = 512;
const NEGATIVE_TABLE_SIZE: usize = 10_000_000;

/// Node of the Huffman coding tree used by hierarchical softmax.
#[derive(Clone, Copy, Debug)]
struct Node {
    parent: i32,
    left: i32,
    right: i32,
    count: u64,
    binary: bool,
}

/// A scored class, ordered so that the *worst* prediction is the
/// maximum: a size-k max-heap of these keeps the k best. Ties are
/// broken by class index, lowest first.
#[derive(Debug, Eq, PartialEq)]
struct Candidate {
    score: NotNan<f32>,
    class: usize,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.score.cmp(&self.score) {
            Ordering::Equal => self.class.cmp(&other.class),
            ordering => ordering,
        }
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Matrices a model computes against: dense during training, optionally
/// quantized after compression.
pub struct ModelMatrices<'a> {
    pub input: &'a Matrix,
    pub output: &'a Matrix,
    pub qinput: Option<&'a QMatrix>,
    pub qoutput: Option<&'a QMatrix>,
}

pub struct Model<'a> {
    wi: &'a Matrix,
    wo: &'a Matrix,
    qwi: Option<&'a QMatrix>,
    qwo: Option<&'a QMatrix>,
    qout: bool,
    model: ModelKind,
    loss: LossKind,
    neg: usize,
    osz: usize,
    hidden: Vec<f32>,
    output: Vec<f32>,
    grad: Vec<f32>,
    rng: MinstdRand,
    negatives: Vec<i32>,
    negpos: usize,
    paths: Vec<Vec<i32>>,
    codes: Vec<Vec<bool>>,
    tree: Vec<Node>,
    t_sigmoid: Vec<f32>,
    t_log: Vec<f32>,
    loss_total: f32,
    nexamples: u64,
}

impl<'a> Model<'a> {
    pub fn new(matrices: ModelMatrices<'a>, args: &Args, seed: u64) -> Self {
        let osz = match (matrices.qoutput, args.qout) {
            (Some(qwo), true) => qwo.rows(),
            _ => matrices.output.rows(),
        };

        let t_sigmoid = (0..=SIGMOID_TABLE_SIZE)
            .map(|i| {
                let x = i as f32 * 2.0 * MAX_SIGMOID / SIGMOID_TABLE_SIZE as f32 - MAX_SIGMOID;
                1.0 / (1.0 + (-x).exp())
            })
            .collect();
        let t_log = (0..=LOG_TABLE_SIZE)
            .map(|i| {
                let x = (i as f32 + 1e-5) / LOG_TABLE_SIZE as f32;
                x.ln()
            })
            .collect();

        Model {
            wi: matrices.input,
            wo: matrices.output,
            qwi: matrices.qinput,
            qwo: matrices.qoutput,
            qout: args.qout,
            model: args.model,
            loss: args.loss,
            neg: args.neg,
            osz,
            hidden: vec![0.0; args.dim],
            output: vec![0.0; matrices.output.rows().max(osz)],
            grad: vec![0.0; args.dim],
            rng: MinstdRand::new(seed),
            negatives: Vec::new(),
            negpos: 0,
            paths: Vec::new(),
            codes: Vec::new(),
            tree: Vec::new(),
            t_sigmoid,
            t_log,
            loss_total: 0.0,
            nexamples: 1,
        }
    }

    pub fn is_quantized(&self) -> bool {
        self.qwi.is_some()
    }

    pub fn rng(&mut self) -> &mut MinstdRand {
        &mut self.rng
    }

    /// Average loss over the examples seen so far.
    pub fn loss(&self) -> f32 {
        self.loss_total / self.nexamples as f32
    }

    /// Prepare the loss-specific tables from the per-class counts.
    pub fn set_target_counts(&mut self, counts: &[u64]) {
        debug_assert_eq!(counts.len(), self.osz);
        if self.loss == LossKind::NegativeSampling {
            self.init_table_negatives(counts);
        }
        if self.loss == LossKind::HierarchicalSoftmax {
            self.build_tree(counts);
        }
    }

    fn init_table_negatives(&mut self, counts: &[u64]) {
        use rand::seq::SliceRandom;

        let z: f64 = counts.iter().map(|&c| (c as f64).sqrt()).sum();
        let mut negatives = Vec::with_capacity(NEGATIVE_TABLE_SIZE);
        for (i, &count) in counts.iter().enumerate() {
            let c = (count as f64).sqrt() * NEGATIVE_TABLE_SIZE as f64 / z;
            for _ in 0..c.ceil() as usize {
                negatives.push(i as i32);
            }
        }
        negatives.shuffle(&mut self.rng);
        self.negatives = negatives;
        self.negpos = 0;
    }

    fn get_negative(&mut self, target: i32) -> i32 {
        loop {
            let negative = self.negatives[self.negpos];
            self.negpos = (self.negpos + 1) % self.negatives.len();
            if negative != target {
                return negative;
            }
        }
    }

    /// Huffman tree over the class counts; merges use two pointers over
    /// the sorted leaves and the already-built inner nodes.
    fn build_tree(&mut self, counts: &[u64]) {
        let osz = self.osz;
        let mut tree = vec![
            Node {
                parent: -1,
                left: -1,
                right: -1,
                count: 1_000_000_000_000_000,
                binary: false,
            };
            2 * osz - 1
        ];
        for (i, &count) in counts.iter().enumerate() {
            tree[i].count = count;
        }

        let mut leaf = osz as i32 - 1;
        let mut node = osz;
        for i in osz..2 * osz - 1 {
            let mut mini = [0usize; 2];
            for m in mini.iter_mut() {
                if leaf >= 0
                    && (node >= tree.len() || tree[leaf as usize].count < tree[node].count)
                {
                    *m = leaf as usize;
                    leaf -= 1;
                } else {
                    *m = node;
                    node += 1;
                }
            }
            tree[i].left = mini[0] as i32;
            tree[i].right = mini[1] as i32;
            tree[i].count = tree[mini[0]].count + tree[mini[1]].count;
            tree[mini[0]].parent = i as i32;
            tree[mini[1]].parent = i as i32;
            tree[mini[1]].binary = true;
        }

        let mut paths = Vec::with_capacity(osz);
        let mut codes = Vec::with_capacity(osz);
        for i in 0..osz {
            let mut path = Vec::new();
            let mut code = Vec::new();
            let mut j = i;
            while tree[j].parent != -1 {
                path.push(tree[j].parent - osz as i32);
                code.push(tree[j].binary);
                j = tree[j].parent as usize;
            }
            paths.push(path);
            codes.push(code);
        }
        self.tree = tree;
        self.paths = paths;
        self.codes = codes;
    }

    fn sigmoid(&self, x: f32) -> f32 {
        if x < -MAX_SIGMOID {
            0.0
        } else if x > MAX_SIGMOID {
            1.0
        } else {
            let i = ((x + MAX_SIGMOID) * SIGMOID_TABLE_SIZE as f32 / MAX_SIGMOID / 2.0) as usize;
            self.t_sigmoid[i]
        }
    }

    fn log(&self, x: f32) -> f32 {
        if x > 1.0 {
            return 0.0;
        }
        let i = (x * LOG_TABLE_SIZE as f32) as usize;
        self.t_log[i]
    }

    fn std_log(x: f32) -> f32 {
        (x + 1e-5).ln()
    }

    /// Dot product of the hidden layer with output row `i`, against the
    /// quantized output matrix when one is active.
    fn output_dot(&self, i: usize) -> Result<f32> {
        match (self.qwo, self.qout) {
            (Some(qwo), true) => Ok(qwo.dot_row(&self.hidden, i)),
            _ => self.wo.dot_row(&self.hidden, i),
        }
    }

    fn binary_logistic(&mut self, target: usize, label: bool, lr: f32) -> Result<f32> {
        let score = self.sigmoid(self.wo.dot_row(&self.hidden, target)?);
        let alpha = lr * (label as i32 as f32 - score);
        self.wo.add_row_to(&mut self.grad, target, alpha);
        self.wo.add_row(&self.hidden, target, alpha);
        if label {
            Ok(-self.log(score))
        } else {
            Ok(-self.log(1.0 - score))
        }
    }

    fn negative_sampling(&mut self, target: i32, lr: f32) -> Result<f32> {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
        let mut loss = 0.0;
        for n in 0..=self.neg {
            if n == 0 {
                loss += self.binary_logistic(target as usize, true, lr)?;
            } else {
                let negative = self.get_negative(target);
                loss += self.binary_logistic(negative as usize, false, lr)?;
            }
        }
        Ok(loss)
    }

    fn hierarchical_softmax(&mut self, target: usize, lr: f32) -> Result<f32> {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
        let mut loss = 0.0;
        let path = self.paths[target].clone();
        let code = self.codes[target].clone();
        for (node, bit) in path.into_iter().zip(code) {
            loss += self.binary_logistic(node as usize, bit, lr)?;
        }
        Ok(loss)
    }

    /// Numerically stable softmax over the output layer into
    /// `self.output`.
    fn compute_output_softmax(&mut self) -> Result<()> {
        for i in 0..self.osz {
            let dot = self.output_dot(i)?;
            self.output[i] = dot;
        }
        let mut max = self.output[0];
        for &v in &self.output[..self.osz] {
            max = max.max(v);
        }
        let mut z = 0.0;
        for v in &mut self.output[..self.osz] {
            *v = (*v - max).exp();
            z += *v;
        }
        for v in &mut self.output[..self.osz] {
            *v /= z;
        }
        Ok(())
    }

    fn softmax(&mut self, target: usize, lr: f32) -> Result<f32> {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
        self.compute_output_softmax()?;
        for i in 0..self.osz {
            let label = if i == target { 1.0 } else { 0.0 };
            let alpha = lr * (label - self.output[i]);
            self.wo.add_row_to(&mut self.grad, i, alpha);
            self.wo.add_row(&self.hidden, i, alpha);
        }
        Ok(-self.log(self.output[target]))
    }

    /// Mean of the input rows selected by `input` into `self.hidden`.
    fn compute_hidden(&mut self, input: &[i32]) {
        self.hidden.iter_mut().for_each(|h| *h = 0.0);
        for &id in input {
            match self.qwi {
                Some(qwi) => qwi.add_row_to(&mut self.hidden, id as usize),
                None => self.wi.add_row_to(&mut self.hidden, id as usize, 1.0),
            }
        }
        let scale = 1.0 / input.len() as f32;
        self.hidden.iter_mut().for_each(|h| *h *= scale);
    }

    /// One SGD step on `(input, target)`.
    pub fn update(&mut self, input: &[i32], target: i32, lr: f32) -> Result<()> {
        if target < 0 || target as usize >= self.osz {
            return Err(Error::invalid_argument(format!(
                "Target {} is out of range [0, {})",
                target, self.osz
            )));
        }
        if input.is_empty() {
            return Ok(());
        }
        self.compute_hidden(input);
        let loss = match self.loss {
            LossKind::NegativeSampling => self.negative_sampling(target, lr)?,
            LossKind::HierarchicalSoftmax => self.hierarchical_softmax(target as usize, lr)?,
            LossKind::Softmax => self.softmax(target as usize, lr)?,
        };
        self.loss_total += loss;
        self.nexamples += 1;

        if self.model == ModelKind::Supervised {
            let scale = 1.0 / input.len() as f32;
            self.grad.iter_mut().for_each(|g| *g *= scale);
        }
        for &id in input {
            self.wi.add_row(&self.grad, id as usize, 1.0);
        }
        Ok(())
    }

    /// Top-`k` classes by log-probability, best first. Ties are stable
    /// by class index.
    pub fn predict(&mut self, input: &[i32], k: usize) -> Result<Vec<(f32, usize)>> {
        if k == 0 {
            return Err(Error::invalid_argument("k needs to be 1 or higher"));
        }
        if self.model != ModelKind::Supervised {
            return Err(Error::invalid_argument(
                "Model needs to be supervised for prediction",
            ));
        }
        self.compute_hidden(input);
        let mut heap = BinaryHeap::with_capacity(k + 1);
        if self.loss == LossKind::HierarchicalSoftmax {
            self.dfs(k, 2 * self.osz as i32 - 2, 0.0, &mut heap)?;
        } else {
            self.find_k_best(k, &mut heap)?;
        }
        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| (*c.score, c.class))
            .collect())
    }

    fn push_candidate(heap: &mut BinaryHeap<Candidate>, k: usize, score: f32, class: usize) {
        let candidate = Candidate {
            score: NotNan::new(score).expect("scores are never NaN"),
            class,
        };
        if heap.len() < k {
            heap.push(candidate);
        } else if let Some(mut worst) = heap.peek_mut() {
            if candidate < *worst {
                *worst = candidate;
            }
        }
    }

    fn find_k_best(&mut self, k: usize, heap: &mut BinaryHeap<Candidate>) -> Result<()> {
        self.compute_output_softmax()?;
        for i in 0..self.osz {
            let score = Self::std_log(self.output[i]);
            if heap.len() == k && score < heap.peek().map(|c| *c.score).unwrap_or(f32::MIN) {
                continue;
            }
            Self::push_candidate(heap, k, score, i);
        }
        Ok(())
    }

    /// Depth-first search over the Huffman tree, pruning subtrees that
    /// cannot beat the current k-th best score.
    fn dfs(&self, k: usize, node: i32, score: f32, heap: &mut BinaryHeap<Candidate>) -> Result<()> {
        if heap.len() == k && score < heap.peek().map(|c| *c.score).unwrap_or(f32::MIN) {
            return Ok(());
        }
        let n = &self.tree[node as usize];
        if n.left == -1 && n.right == -1 {
            Self::push_candidate(heap, k, score, node as usize);
            return Ok(());
        }

        let f = self.output_dot((node - self.osz as i32) as usize)?;
        let f = 1.0 / (1.0 + (-f).exp());
        self.dfs(k, n.left, score + Self::std_log(1.0 - f), heap)?;
        self.dfs(k, n.right, score + Self::std_log(f), heap)
    }
}

#[cfg(test)]
mod tests {
    use crate::args::{Args, LossKind, ModelKind};
    use crate::matrix::Matrix;
    use crate::rng::MinstdRand;

    use super::{Model, ModelMatrices};

    fn dense_model<'a>(input: &'a Matrix, output: &'a Matrix, args: &Args) -> Model<'a> {
        Model::new(
            ModelMatrices {
                input,
                output,
                qinput: None,
                qoutput: None,
            },
            args,
            1,
        )
    }

    fn supervised_args(dim: usize) -> Args {
        let mut args = Args::new(ModelKind::Supervised);
        args.dim = dim;
        args.finalize().unwrap()
    }

    #[test]
    fn sigmoid_table_matches_closed_form() {
        let input = Matrix::new(4, 8);
        let output = Matrix::new(3, 8);
        let model = dense_model(&input, &output, &supervised_args(8));
        for &x in &[-7.5f32, -1.0, 0.0, 0.5, 3.25, 7.9] {
            let exact = 1.0 / (1.0 + (-x).exp());
            assert!((model.sigmoid(x) - exact).abs() < 2e-2);
        }
        assert_eq!(model.sigmoid(-9.0), 0.0);
        assert_eq!(model.sigmoid(9.0), 1.0);
    }

    #[test]
    fn log_table_matches_closed_form() {
        let input = Matrix::new(4, 8);
        let output = Matrix::new(3, 8);
        let model = dense_model(&input, &output, &supervised_args(8));
        for &x in &[0.1f32, 0.25, 0.5, 0.99] {
            assert!((model.log(x) - x.ln()).abs() < 2e-2);
        }
        assert_eq!(model.log(1.5), 0.0);
    }

    #[test]
    fn huffman_tree_shape() {
        let input = Matrix::new(4, 4);
        let output = Matrix::new(5, 4);
        let mut args = Args::new(ModelKind::Supervised);
        args.dim = 4;
        let mut args = args.finalize().unwrap();
        args.loss = LossKind::HierarchicalSoftmax;
        let mut model = dense_model(&input, &output, &args);
        // Counts arrive sorted descending, the way the dictionary
        // produces them.
        model.set_target_counts(&[40, 30, 16, 10, 4]);

        assert_eq!(model.tree.len(), 2 * 5 - 1);
        // Root accumulates every leaf count.
        assert_eq!(model.tree.last().unwrap().count, 100);
        // More frequent classes sit closer to the root.
        assert!(model.codes[0].len() <= model.codes[4].len());
        for (path, code) in model.paths.iter().zip(&model.codes) {
            assert_eq!(path.len(), code.len());
            assert!(!path.is_empty());
        }
    }

    #[test]
    fn negatives_table_skips_target() {
        let input = Matrix::new(4, 4);
        let output = Matrix::new(3, 4);
        let mut args = Args::new(ModelKind::SkipGram);
        args.dim = 4;
        let mut args = args.finalize().unwrap();
        args.loss = LossKind::NegativeSampling;
        let mut model = dense_model(&input, &output, &args);
        model.set_target_counts(&[100, 50, 10]);
        for _ in 0..1000 {
            assert_ne!(model.get_negative(0), 0);
        }
    }

    #[test]
    fn update_moves_loss_and_rows() {
        let args = supervised_args(6);
        let input = Matrix::new(8, 6);
        let output = Matrix::new(2, 6);
        input.uniform(&mut MinstdRand::new(1), 1.0 / 6.0);
        let mut model = dense_model(&input, &output, &args);
        model.set_target_counts(&[3, 2]);

        let before = input.row(0);
        for _ in 0..50 {
            model.update(&[0, 3, 5], 0, 0.1).unwrap();
        }
        assert!(model.loss() > 0.0);
        assert_ne!(before, input.row(0));
    }

    #[test]
    fn update_rejects_bad_target() {
        let args = supervised_args(4);
        let input = Matrix::new(4, 4);
        let output = Matrix::new(2, 4);
        let mut model = dense_model(&input, &output, &args);
        model.set_target_counts(&[1, 1]);
        assert!(model.update(&[0], 2, 0.1).is_err());
        assert!(model.update(&[0], -1, 0.1).is_err());
    }

    #[test]
    fn predict_orders_by_probability() {
        let args = supervised_args(4);
        let input = Matrix::new(6, 4);
        let output = Matrix::new(3, 4);
        input.uniform(&mut MinstdRand::new(1), 0.25);
        let mut model = dense_model(&input, &output, &args);
        model.set_target_counts(&[5, 3, 2]);

        // Train towards label 1 so it dominates.
        for _ in 0..200 {
            model.update(&[0, 1], 1, 0.2).unwrap();
        }
        let predictions = model.predict(&[0, 1], 3).unwrap();
        assert_eq!(predictions.len(), 3);
        assert_eq!(predictions[0].1, 1);
        for pair in predictions.windows(2) {
            assert!(pair[0].0 >= pair[1].0);
        }
        // Log-probabilities exponentiate to a distribution.
        let total: f32 = predictions.iter().map(|(s, _)| s.exp()).sum();
        assert!((total - 1.0).abs() < 1e-3);
    }

    #[test]
    fn predict_requires_supervised() {
        let mut args = Args::new(ModelKind::SkipGram);
        args.dim = 4;
        let args = args.finalize().unwrap();
        let input = Matrix::new(4, 4);
        let output = Matrix::new(2, 4);
        let mut model = dense_model(&input, &output, &args);
        assert!(model.predict(&[0], 1).is_err());
        let args2 = supervised_args(4);
        let mut model = dense_model(&input, &output, &args2);
        assert!(model.predict(&[0], 0).is_err());
    }

    #[test]
    fn hs_predict_agrees_with_itself_on_reruns() {
        let mut args = Args::new(ModelKind::Supervised);
        args.dim = 4;
        let mut args = args.finalize().unwrap();
        args.loss = LossKind::HierarchicalSoftmax;
        let input = Matrix::new(8, 4);
        let output = Matrix::new(4, 4);
        input.uniform(&mut MinstdRand::new(1), 0.25);
        output.uniform(&mut MinstdRand::new(2), 0.25);

        let run = || {
            let mut model = Model::new(
                super::ModelMatrices {
                    input: &input,
                    output: &output,
                    qinput: None,
                    qoutput: None,
                },
                &args,
                1,
            );
            model.set_target_counts(&[10, 5, 3, 1]);
            model.predict(&[0, 2], 2).unwrap()
        };
        assert_eq!(run(), run());
    }
}

//! Owning facade over the dictionary, matrices and model.
//!
//! A `FastText` value is either trained from a corpus or loaded from a
//! binary model file. It owns the matrices and hands out read-only
//! borrows to the transient [`Model`] values used for prediction; the
//! precomputed nearest-neighbour bank is built lazily and can be
//! evicted under memory pressure.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};

use byteorder::{ReadBytesExt, WriteBytesExt};
use ndarray::{Array1, Array2};
use ordered_float::NotNan;

use crate::args::{Args, ModelKind};
use crate::dictionary::{Dictionary, EntryType, EOS};
use crate::error::{Error, Result};
use crate::io::{check_model, format_float, sign_model, MODEL_VERSION};
use crate::matrix::Matrix;
use crate::model::{Model, ModelMatrices};
use crate::quant::QMatrix;
use crate::rng::MinstdRand;
use crate::subword::{BOW, EOW};
use crate::trainer::{load_pretrained_vectors, CancelToken, Trainer};

const FIND_NN_THRESHOLD: f32 = 1e-8;

/// A scored word, ordered so a size-k max-heap keeps the k nearest.
#[derive(Debug, Eq, PartialEq)]
struct WordSimilarity<'a> {
    similarity: NotNan<f32>,
    word: &'a str,
}

impl<'a> Ord for WordSimilarity<'a> {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.similarity.cmp(&self.similarity) {
            Ordering::Equal => self.word.cmp(other.word),
            ordering => ordering,
        }
    }
}

impl<'a> PartialOrd for WordSimilarity<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Settings for model compression.
#[derive(Clone, Debug)]
pub struct QuantizeOptions {
    /// Keep only this many input rows (0 keeps all).
    pub cutoff: usize,
    /// Sub-quantizer width in vector components.
    pub dsub: usize,
    /// Quantize row norms separately.
    pub qnorm: bool,
    /// Also quantize the output matrix.
    pub qout: bool,
    /// Fine-tune after cutoff pruning.
    pub retrain: bool,
    pub epoch: usize,
    pub lr: f64,
    pub thread: usize,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        QuantizeOptions {
            cutoff: 0,
            dsub: 2,
            qnorm: false,
            qout: false,
            retrain: false,
            epoch: 5,
            lr: 0.1,
            thread: 1,
        }
    }
}

/// Result of evaluating a labeled test stream.
#[derive(Clone, Copy, Debug)]
pub struct TestInfo {
    pub k: usize,
    pub precision: f64,
    pub nexamples: usize,
    pub nlabels: usize,
}

impl TestInfo {
    pub fn precision_at_k(&self) -> f64 {
        self.precision / (self.k * self.nexamples) as f64
    }

    pub fn recall_at_k(&self) -> f64 {
        self.precision / self.nlabels as f64
    }
}

impl fmt::Display for TestInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "N\t{}", self.nexamples)?;
        writeln!(f, "P@{}\t{:.3}", self.k, self.precision_at_k())?;
        write!(f, "R@{}\t{:.3}", self.k, self.recall_at_k())
    }
}

/// A trained (or loaded) embedding model.
pub struct FastText {
    args: Args,
    dict: Dictionary,
    input: Matrix,
    output: Matrix,
    qinput: Option<QMatrix>,
    qoutput: Option<QMatrix>,
    version: i32,
    word_bank: RwLock<Option<Arc<Array2<f32>>>>,
}

impl FastText {
    /// Train a model on the corpus at `path`.
    pub fn train(args: Args, path: &Path) -> Result<FastText> {
        Self::train_with(args, path, None, CancelToken::new())
    }

    /// Train with optional pretrained input vectors and a cancellation
    /// token.
    pub fn train_with(
        args: Args,
        path: &Path,
        pretrained: Option<&Path>,
        cancel: CancelToken,
    ) -> Result<FastText> {
        args.validate()?;
        let file =
            File::open(path).map_err(|e| Error::read_error("Input file cannot be opened", e))?;
        let mut dict = Dictionary::read_from(BufReader::new(file), &args)?;

        let input = match pretrained {
            Some(vectors) => load_pretrained_vectors(&args, &mut dict, vectors)?,
            None => {
                let input = Matrix::new(dict.nwords() + args.bucket, args.dim);
                input.uniform(&mut MinstdRand::new(1), 1.0 / args.dim as f32);
                input
            }
        };
        let output = if args.model == ModelKind::Supervised {
            Matrix::new(dict.nlabels(), args.dim)
        } else {
            Matrix::new(dict.nwords(), args.dim)
        };

        Trainer::new(&args, path, &dict, &input, &output, cancel)?.run()?;

        Ok(FastText {
            args,
            dict,
            input,
            output,
            qinput: None,
            qoutput: None,
            version: MODEL_VERSION,
            word_bank: RwLock::new(None),
        })
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn is_quantized(&self) -> bool {
        self.qinput.is_some()
    }

    /// Build a transient model over the owned matrices.
    fn model(&self) -> Model {
        let mut model = Model::new(
            ModelMatrices {
                input: &self.input,
                output: &self.output,
                qinput: self.qinput.as_ref(),
                qoutput: self.qoutput.as_ref(),
            },
            &self.args,
            0,
        );
        let counts = if self.args.model == ModelKind::Supervised {
            self.dict.counts(EntryType::Label)
        } else {
            self.dict.counts(EntryType::Word)
        };
        model.set_target_counts(&counts);
        model
    }

    fn add_input_vector(&self, vec: &mut [f32], id: i32) {
        match &self.qinput {
            Some(qinput) => qinput.add_row_to(vec, id as usize),
            None => self.input.add_row_to(vec, id as usize, 1.0),
        }
    }

    /// Word vector: mean of the input rows of the word's subwords.
    pub fn word_vector(&self, word: &str) -> Array1<f32> {
        let mut vec = vec![0f32; self.args.dim];
        let ngrams = self.dict.subwords_of(word);
        for &id in &ngrams {
            self.add_input_vector(&mut vec, id);
        }
        if !ngrams.is_empty() {
            let scale = 1.0 / ngrams.len() as f32;
            vec.iter_mut().for_each(|v| *v *= scale);
        }
        Array1::from(vec)
    }

    /// Sentence vector.
    ///
    /// Supervised models average the input rows of the tokenized line;
    /// an empty line yields the zero vector without dividing. Other
    /// models average the L2-normalized word vectors of the line.
    pub fn sentence_vector(&self, line: &str) -> Result<Array1<f32>> {
        if self.args.model == ModelKind::Supervised {
            let (words, _labels) = self.dict.line_from_str(line)?;
            let mut vec = vec![0f32; self.args.dim];
            if words.is_empty() {
                return Ok(Array1::from(vec));
            }
            for &id in &words {
                self.add_input_vector(&mut vec, id);
            }
            let scale = 1.0 / words.len() as f32;
            vec.iter_mut().for_each(|v| *v *= scale);
            return Ok(Array1::from(vec));
        }

        let mut svec = Array1::<f32>::zeros(self.args.dim);
        let mut count = 0;
        for word in line.split_whitespace() {
            let vec = self.word_vector(word);
            let norm = vec.dot(&vec).sqrt();
            if norm > 0.0 {
                svec += &(&vec / norm);
                count += 1;
            }
        }
        if count > 0 {
            svec /= count as f32;
        }
        Ok(svec)
    }

    /// N-grams of `word` with their row id and vector; the word itself
    /// comes first (id -1 when out of vocabulary).
    pub fn ngram_vectors(&self, word: &str) -> Result<Vec<(String, i32, Array1<f32>)>> {
        if word.is_empty() {
            return Err(Error::invalid_argument("Empty word"));
        }
        let id = self.dict.word_id(word);
        let mut pairs = vec![(word.to_string(), id)];
        let padded = format!("{}{}{}", BOW, word, EOW);
        pairs.extend(self.dict.subword_ngrams(&padded));

        Ok(pairs
            .into_iter()
            .map(|(ngram, id)| {
                let mut vec = vec![0f32; self.args.dim];
                if id >= 0 {
                    self.add_input_vector(&mut vec, id);
                }
                (ngram, id, Array1::from(vec))
            })
            .collect())
    }

    /// Normalized word vectors of the whole vocabulary, built lazily.
    fn word_bank(&self) -> Arc<Array2<f32>> {
        if let Some(bank) = self
            .word_bank
            .read()
            .expect("word vector bank lock poisoned")
            .as_ref()
        {
            return Arc::clone(bank);
        }

        let mut bank = Array2::<f32>::zeros((self.dict.nwords(), self.args.dim));
        for i in 0..self.dict.nwords() {
            let vec = self.word_vector(self.dict.word(i));
            let norm = vec.dot(&vec).sqrt();
            if norm > 0.0 {
                bank.row_mut(i).assign(&(&vec / norm));
            }
        }
        let bank = Arc::new(bank);
        *self
            .word_bank
            .write()
            .expect("word vector bank lock poisoned") = Some(Arc::clone(&bank));
        bank
    }

    /// Drop the precomputed nearest-neighbour bank.
    pub fn evict_word_bank(&self) {
        *self
            .word_bank
            .write()
            .expect("word vector bank lock poisoned") = None;
    }

    fn find_nn(
        &self,
        bank: &Array2<f32>,
        query: &Array1<f32>,
        k: usize,
        ban: &HashSet<&str>,
    ) -> Vec<(String, f32)> {
        let mut query_norm = query.dot(query).sqrt();
        if query_norm.abs() < FIND_NN_THRESHOLD {
            query_norm = 1.0;
        }

        let mut heap = BinaryHeap::with_capacity(k + 1);
        for i in 0..self.dict.nwords() {
            let word = self.dict.word(i);
            if ban.contains(word) {
                continue;
            }
            let dp = bank.row(i).dot(query) / query_norm;
            let candidate = WordSimilarity {
                similarity: NotNan::new(dp).expect("Encountered NaN"),
                word,
            };
            if heap.len() < k {
                heap.push(candidate);
            } else if let Some(mut worst) = heap.peek_mut() {
                if candidate < *worst {
                    *worst = candidate;
                }
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|c| (c.word.to_string(), *c.similarity))
            .collect()
    }

    /// The `k` words nearest to `word` by cosine similarity, excluding
    /// the query itself.
    pub fn nn(&self, k: usize, word: &str) -> Result<Vec<(String, f32)>> {
        if word.is_empty() {
            return Err(Error::invalid_argument("Empty query word"));
        }
        if k == 0 {
            return Err(Error::invalid_argument("k needs to be 1 or higher"));
        }
        let bank = self.word_bank();
        let mut ban = HashSet::new();
        ban.insert(word);
        let query = self.word_vector(word);
        Ok(self.find_nn(&bank, &query, k, &ban))
    }

    /// Analogy query `a - b + c`, excluding the three query words.
    pub fn analogies(&self, k: usize, a: &str, b: &str, c: &str) -> Result<Vec<(String, f32)>> {
        for word in &[a, b, c] {
            if word.is_empty() {
                return Err(Error::invalid_argument("Empty query word"));
            }
        }
        if k == 0 {
            return Err(Error::invalid_argument("k needs to be 1 or higher"));
        }
        let bank = self.word_bank();
        let mut ban = HashSet::new();
        ban.insert(a);
        ban.insert(b);
        ban.insert(c);
        let query = self.word_vector(a) - self.word_vector(b) + self.word_vector(c);
        Ok(self.find_nn(&bank, &query, k, &ban))
    }

    /// Cosine similarity of two word vectors.
    pub fn word_similarity(&self, left: &str, right: &str) -> f32 {
        let lv = self.word_vector(left);
        let rv = self.word_vector(right);
        let norms = lv.dot(&lv).sqrt() * rv.dot(&rv).sqrt();
        if norms == 0.0 {
            return 0.0;
        }
        lv.dot(&rv) / norms
    }

    /// Cosine similarity of two sentence vectors.
    pub fn sentence_similarity(&self, left: &str, right: &str) -> Result<f32> {
        let lv = self.sentence_vector(left)?;
        let rv = self.sentence_vector(right)?;
        let norms = lv.dot(&lv).sqrt() * rv.dot(&rv).sqrt();
        if norms == 0.0 {
            return Ok(0.0);
        }
        Ok(lv.dot(&rv) / norms)
    }

    /// Alignment-based sentence similarity: every word of either
    /// sentence contributes its best cosine against the other sentence,
    /// and all maxima are averaged.
    pub fn aligned_sentence_similarity(&self, left: &str, right: &str) -> f32 {
        let left_words: Vec<&str> = left.split_whitespace().collect();
        let right_words: Vec<&str> = right.split_whitespace().collect();
        if left_words.is_empty() || right_words.is_empty() {
            return 0.0;
        }

        let mut sims = Vec::with_capacity(left_words.len() + right_words.len());
        for &lw in &left_words {
            let best = right_words
                .iter()
                .map(|&rw| self.word_similarity(lw, rw))
                .fold(0.0f32, f32::max);
            sims.push(best);
        }
        for &rw in &right_words {
            let best = left_words
                .iter()
                .map(|&lw| self.word_similarity(lw, rw))
                .fold(0.0f32, f32::max);
            sims.push(best);
        }
        sims.iter().sum::<f32>() / sims.len() as f32
    }

    /// Predict the `k` most likely labels for one line, with
    /// probabilities, best first.
    pub fn predict_line(&self, line: &str, k: usize) -> Result<Vec<(String, f32)>> {
        let (words, _labels) = self.dict.line_from_str(line)?;
        if words.is_empty() {
            return Ok(Vec::new());
        }
        let mut model = self.model();
        let predictions = model.predict(&words, k)?;
        predictions
            .into_iter()
            .map(|(score, label)| {
                Ok((
                    self.dict.label(label as i32)?.to_string(),
                    score.exp(),
                ))
            })
            .collect()
    }

    /// Evaluate P@k and R@k over a labeled stream, one example per
    /// line.
    pub fn test(&self, reader: impl BufRead, k: usize) -> Result<TestInfo> {
        if k == 0 {
            return Err(Error::invalid_argument("k needs to be 1 or higher"));
        }
        let mut model = self.model();
        let mut info = TestInfo {
            k,
            precision: 0.0,
            nexamples: 0,
            nlabels: 0,
        };
        for line in reader.lines() {
            let line = line.map_err(|e| Error::read_error("Cannot read test line", e))?;
            let (words, labels) = self.dict.line_from_str(&line)?;
            if labels.is_empty() || words.is_empty() {
                continue;
            }
            for (_score, predicted) in model.predict(&words, k)? {
                if labels.contains(&(predicted as i32)) {
                    info.precision += 1.0;
                }
            }
            info.nexamples += 1;
            info.nlabels += labels.len();
        }
        Ok(info)
    }

    /// Input rows ordered for cutoff pruning: EOS first, then by
    /// descending norm, ties broken by row id.
    fn select_embeddings(&self, cutoff: usize) -> Result<Vec<i32>> {
        let norms = self.input.l2_norm_row()?;
        let eos_id = self.dict.word_id(EOS);
        let mut idx: Vec<i32> = (0..self.input.rows() as i32).collect();
        idx.sort_by(|&a, &b| {
            if a == eos_id {
                Ordering::Less
            } else if b == eos_id {
                Ordering::Greater
            } else {
                norms[b as usize]
                    .total_cmp(&norms[a as usize])
                    .then(a.cmp(&b))
            }
        });
        idx.truncate(cutoff);
        Ok(idx)
    }

    /// Compress the model with product quantization.
    ///
    /// Only supervised models can be quantized, and only once. With a
    /// cutoff, the input matrix is pruned to the highest-norm rows and
    /// optionally fine-tuned on `retrain_path` before quantization.
    pub fn quantize(
        &self,
        options: &QuantizeOptions,
        retrain_path: Option<&Path>,
    ) -> Result<FastText> {
        if self.is_quantized() {
            return Err(Error::invalid_argument("Model is already quantized"));
        }
        if self.args.model != ModelKind::Supervised {
            return Err(Error::invalid_argument(
                "Only supervised models can be quantized",
            ));
        }

        let mut qargs = self.args.clone();
        qargs.qout = options.qout;
        qargs.qnorm = options.qnorm;
        qargs.dsub = options.dsub;
        qargs.cutoff = options.cutoff;

        let mut qdict = self.dict.clone();
        let output = self.output.copy();
        let input;
        if options.cutoff > 0 && options.cutoff < self.input.rows() {
            let idx = self.select_embeddings(options.cutoff)?;
            let kept = qdict.prune(&idx);
            let pruned = Matrix::new(kept.len(), qargs.dim);
            for (i, &row) in kept.iter().enumerate() {
                for j in 0..qargs.dim {
                    pruned.set(i, j, self.input.at(row as usize, j));
                }
            }
            if options.retrain {
                let path = retrain_path.ok_or_else(|| {
                    Error::invalid_argument("Retraining requires the training data file")
                })?;
                qargs.epoch = options.epoch;
                qargs.lr = options.lr;
                qargs.thread = options.thread;
                Trainer::new(&qargs, path, &qdict, &pruned, &output, CancelToken::new())?
                    .run()?;
            }
            input = pruned;
        } else {
            input = self.input.copy();
        }

        let qinput = QMatrix::quantize(&input, qargs.dsub, qargs.qnorm)?;
        let qoutput = if qargs.qout {
            Some(QMatrix::quantize(&output, 2, qargs.qnorm)?)
        } else {
            None
        };

        Ok(FastText {
            args: qargs,
            dict: qdict,
            input,
            output,
            qinput: Some(qinput),
            qoutput,
            version: MODEL_VERSION,
            word_bank: RwLock::new(None),
        })
    }

    /// Write the binary model.
    pub fn save_model(&self, path: &Path) -> Result<()> {
        let file =
            File::create(path).map_err(|e| Error::write_error("Model file cannot be created", e))?;
        self.write_model(&mut BufWriter::new(file))
    }

    pub fn write_model(&self, write: &mut impl Write) -> Result<()> {
        sign_model(write)?;
        self.args.write(write)?;
        self.dict.write(write)?;

        let quant = self.is_quantized();
        write
            .write_u8(quant as u8)
            .map_err(|e| Error::write_error("Cannot write quantization flag", e))?;
        match &self.qinput {
            Some(qinput) => qinput.write(write)?,
            None => self.input.write(write)?,
        }
        write
            .write_u8(self.args.qout as u8)
            .map_err(|e| Error::write_error("Cannot write qout flag", e))?;
        match (&self.qoutput, quant && self.args.qout) {
            (Some(qoutput), true) => qoutput.write(write)?,
            _ => self.output.write(write)?,
        }
        Ok(())
    }

    /// Load a binary model.
    pub fn load_model(path: &Path) -> Result<FastText> {
        let file =
            File::open(path).map_err(|e| Error::read_error("Model file cannot be opened", e))?;
        Self::read_model(&mut BufReader::new(file))
    }

    pub fn read_model(read: &mut impl BufRead) -> Result<FastText> {
        let version = check_model(read)?;
        let mut args = Args::read(read)?;
        if version == 11 && args.model == ModelKind::Supervised {
            // Old supervised models do not use char n-grams.
            args.maxn = 0;
        }
        let dict = Dictionary::read(read, &args)?;

        let quant_input = read
            .read_u8()
            .map_err(|e| Error::read_error("Cannot read quantization flag", e))?
            != 0;
        let (input, qinput) = if quant_input {
            (Matrix::new(0, 0), Some(QMatrix::read(read)?))
        } else {
            (Matrix::read(read)?, None)
        };
        if !quant_input && dict.is_pruned() {
            return Err(Error::format_error(
                "Invalid model file: pruned dictionary with a dense input matrix",
            ));
        }

        args.qout = read
            .read_u8()
            .map_err(|e| Error::read_error("Cannot read qout flag", e))?
            != 0;
        let (output, qoutput) = if quant_input && args.qout {
            (Matrix::new(0, 0), Some(QMatrix::read(read)?))
        } else {
            (Matrix::read(read)?, None)
        };

        Ok(FastText {
            args,
            dict,
            input,
            output,
            qinput,
            qoutput,
            version,
            word_bank: RwLock::new(None),
        })
    }

    /// Write word vectors in `.vec` text form.
    pub fn save_vectors(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| Error::write_error("Vector file cannot be created", e))?;
        let mut writer = BufWriter::new(file);
        self.write_vectors(&mut writer, self.dict.nwords(), |i| {
            (self.dict.word(i), self.word_vector(self.dict.word(i)))
        })
    }

    /// Write output-layer vectors in `.vec` text form. Not available on
    /// quantized models.
    pub fn save_output(&self, path: &Path) -> Result<()> {
        if self.is_quantized() {
            return Err(Error::UnsupportedOperation("saving the output matrix"));
        }
        let n = if self.args.model == ModelKind::Supervised {
            self.dict.nlabels()
        } else {
            self.dict.nwords()
        };
        let file = File::create(path)
            .map_err(|e| Error::write_error("Vector file cannot be created", e))?;
        let mut writer = BufWriter::new(file);
        self.write_vectors(&mut writer, n, |i| {
            let word = if self.args.model == ModelKind::Supervised {
                self.dict.label(i as i32).expect("label id in range")
            } else {
                self.dict.word(i)
            };
            let mut vec = vec![0f32; self.args.dim];
            self.output.add_row_to(&mut vec, i, 1.0);
            (word, Array1::from(vec))
        })
    }

    fn write_vectors<'b>(
        &'b self,
        write: &mut impl Write,
        lines: usize,
        entry: impl Fn(usize) -> (&'b str, Array1<f32>),
    ) -> Result<()> {
        let mut out = format!("{} {}\n", lines, self.args.dim);
        for i in 0..lines {
            let (word, vec) = entry(i);
            out.push_str(word);
            for v in vec.iter() {
                out.push(' ');
                out.push_str(&format_float(*v, 5));
            }
            out.push('\n');
            if out.len() > 64 * 1024 {
                write
                    .write_all(out.as_bytes())
                    .map_err(|e| Error::write_error("Cannot write vectors", e))?;
                out.clear();
            }
        }
        write
            .write_all(out.as_bytes())
            .map_err(|e| Error::write_error("Cannot write vectors", e))
    }
}

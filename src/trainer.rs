//! Parallel SGD over a byte-sharded input file.
//!
//! Each worker owns a seekable reader positioned at
//! `thread_id · file_size / threads` and loops over lines until the
//! global token counter reaches `epoch · ntokens`. Matrix rows are
//! updated without synchronization; only the token counter is atomic.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::args::{Args, ModelKind};
use crate::dictionary::{Dictionary, EntryType, TokenReader};
use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::model::{Model, ModelMatrices};
use crate::rng::MinstdRand;

/// Cooperative cancellation flag checked by workers between lines.
///
/// Cancelling discards the in-progress training; no partial model is
/// persisted.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct Trainer<'a> {
    args: &'a Args,
    path: PathBuf,
    file_size: u64,
    dict: &'a Dictionary,
    input: &'a Matrix,
    output: &'a Matrix,
    token_count: AtomicU64,
    start: Instant,
    cancel: CancelToken,
}

impl<'a> Trainer<'a> {
    pub fn new(
        args: &'a Args,
        path: impl Into<PathBuf>,
        dict: &'a Dictionary,
        input: &'a Matrix,
        output: &'a Matrix,
        cancel: CancelToken,
    ) -> Result<Self> {
        let path = path.into();
        let file_size = std::fs::metadata(&path)
            .map_err(|e| Error::read_error("Input file cannot be opened", e))?
            .len();
        Ok(Trainer {
            args,
            path,
            file_size,
            dict,
            input,
            output,
            token_count: AtomicU64::new(0),
            start: Instant::now(),
            cancel,
        })
    }

    /// Run all workers to completion.
    pub fn run(&mut self) -> Result<()> {
        self.start = Instant::now();
        self.token_count.store(0, Ordering::SeqCst);

        if self.args.thread <= 1 {
            self.worker(0)?;
            if self.cancel.is_cancelled() {
                return Err(Error::format_error("Training was cancelled"));
            }
            return Ok(());
        }

        let threads = self.args.thread;
        std::thread::scope(|scope| {
            let this = &*self;
            let handles: Vec<_> = (0..threads)
                .map(|id| scope.spawn(move || this.worker(id)))
                .collect();
            let mut result = Ok(());
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        if result.is_ok() {
                            result = Err(e);
                        }
                        this.cancel.cancel();
                    }
                    Err(_) => {
                        if result.is_ok() {
                            result = Err(Error::format_error("Worker thread panicked"));
                        }
                    }
                }
            }
            result
        })?;

        if self.cancel.is_cancelled() {
            return Err(Error::format_error("Training was cancelled"));
        }
        Ok(())
    }

    fn open_reader(&self) -> Result<TokenReader<BufReader<File>>> {
        let file = File::open(&self.path)
            .map_err(|e| Error::read_error("Input file cannot be opened", e))?;
        Ok(TokenReader::new(BufReader::new(file)))
    }

    fn worker(&self, thread_id: usize) -> Result<()> {
        let mut reader = self.open_reader()?;
        reader.seek(thread_id as u64 * self.file_size / self.args.thread as u64)?;

        let mut model = Model::new(
            ModelMatrices {
                input: self.input,
                output: self.output,
                qinput: None,
                qoutput: None,
            },
            self.args,
            thread_id as u64,
        );
        let counts = if self.args.model == ModelKind::Supervised {
            self.dict.counts(EntryType::Label)
        } else {
            self.dict.counts(EntryType::Word)
        };
        model.set_target_counts(&counts);

        let epoch_tokens = self.args.epoch as u64 * self.dict.ntokens();
        let mut local_token_count = 0u64;
        let mut line: Vec<i32> = Vec::new();
        let mut labels: Vec<i32> = Vec::new();

        while self.token_count.load(Ordering::Relaxed) < epoch_tokens {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let progress =
                self.token_count.load(Ordering::Relaxed) as f32 / epoch_tokens as f32;
            let lr = (self.args.lr * (1.0 - f64::from(progress))) as f32;

            match self.args.model {
                ModelKind::Supervised => {
                    local_token_count +=
                        self.dict
                            .read_line_labeled(&mut reader, &mut line, &mut labels)?
                            as u64;
                    self.supervised(&mut model, lr, &line, &labels)?;
                }
                ModelKind::Cbow => {
                    local_token_count +=
                        self.dict
                            .read_line_unlabeled(&mut reader, &mut line, model.rng())?
                            as u64;
                    self.cbow(&mut model, lr, &line)?;
                }
                ModelKind::SkipGram => {
                    local_token_count +=
                        self.dict
                            .read_line_unlabeled(&mut reader, &mut line, model.rng())?
                            as u64;
                    self.skipgram(&mut model, lr, &line)?;
                }
            }

            if local_token_count > self.args.lr_update_rate as u64 {
                self.token_count
                    .fetch_add(local_token_count, Ordering::Relaxed);
                local_token_count = 0;
                if thread_id == 0 {
                    debug!("{}", self.progress_line(progress, model.loss()));
                }
            }
        }
        if thread_id == 0 {
            info!("{}", self.progress_line(1.0, model.loss()));
        }
        Ok(())
    }

    fn progress_line(&self, progress: f32, loss: f32) -> String {
        let elapsed = self.start.elapsed().as_secs_f32();
        let wst = self.token_count.load(Ordering::Relaxed) as f32 / elapsed.max(1e-6);
        let lr = self.args.lr * (1.0 - f64::from(progress));
        let eta = if progress > 0.0 {
            (elapsed / progress * (1.0 - progress) / self.args.thread as f32) as u64
        } else {
            0
        };
        format!(
            "Progress: {:.1}%  words/sec/thread: {:.0}  lr: {:.6}  loss: {:.6}  eta: {}h{}m",
            100.0 * progress,
            wst,
            lr,
            loss,
            eta / 3600,
            (eta % 3600) / 60
        )
    }

    /// One supervised step: a uniformly random label of the line is the
    /// target.
    fn supervised(&self, model: &mut Model, lr: f32, line: &[i32], labels: &[i32]) -> Result<()> {
        if labels.is_empty() || line.is_empty() {
            return Ok(());
        }
        let i = model.rng().uniform_int(0, labels.len() - 1);
        model.update(line, labels[i], lr)
    }

    /// One cbow pass over the line: each position predicts itself from
    /// the bag of subwords of a random-width context window.
    fn cbow(&self, model: &mut Model, lr: f32, line: &[i32]) -> Result<()> {
        let mut bow: Vec<i32> = Vec::new();
        for w in 0..line.len() {
            let boundary = model.rng().uniform_int(1, self.args.ws) as isize;
            bow.clear();
            for c in -boundary..=boundary {
                let wc = w as isize + c;
                if c != 0 && wc >= 0 && (wc as usize) < line.len() {
                    bow.extend_from_slice(self.dict.subwords(line[wc as usize]));
                }
            }
            model.update(&bow, line[w], lr)?;
        }
        Ok(())
    }

    /// One skipgram pass: each position predicts its context words from
    /// its own subwords.
    fn skipgram(&self, model: &mut Model, lr: f32, line: &[i32]) -> Result<()> {
        for w in 0..line.len() {
            let boundary = model.rng().uniform_int(1, self.args.ws) as isize;
            let ngrams = self.dict.subwords(line[w]);
            for c in -boundary..=boundary {
                let wc = w as isize + c;
                if c != 0 && wc >= 0 && (wc as usize) < line.len() {
                    model.update(ngrams, line[wc as usize], lr)?;
                }
            }
        }
        Ok(())
    }
}

/// Bootstrap an input matrix from a `.vec` text file of pretrained
/// vectors, then overwrite the rows of in-vocabulary words.
pub fn load_pretrained_vectors(
    args: &Args,
    dict: &mut Dictionary,
    path: &Path,
) -> Result<Matrix> {
    let file =
        File::open(path).map_err(|e| Error::read_error("Pretrained vectors file cannot be opened", e))?;
    let mut reader = BufReader::new(file);

    let mut header = String::new();
    reader
        .read_line(&mut header)
        .map_err(|e| Error::read_error("Cannot read pretrained vectors header", e))?;
    let mut fields = header.split_whitespace();
    let n: usize = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| Error::format_error("Pretrained vectors header is missing the row count"))?;
    let dim: usize = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| Error::format_error("Pretrained vectors header is missing the dimension"))?;
    if dim != args.dim {
        return Err(Error::format_error(format!(
            "Dimension of pretrained vectors ({}) does not match -dim ({})",
            dim, args.dim
        )));
    }

    let mut words = Vec::with_capacity(n);
    let mut data = vec![0f32; n * dim];
    for i in 0..n {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| Error::read_error("Cannot read pretrained vector line", e))?;
        let mut fields = line.split_whitespace();
        let word = fields
            .next()
            .ok_or_else(|| Error::format_error("Empty pretrained vector line"))?;
        for j in 0..dim {
            data[i * dim + j] = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| {
                    Error::format_error(format!("Wrong number of vector components for {}", word))
                })?;
        }
        words.push(word.to_string());
        dict.add(word);
    }

    dict.threshold(1, 0);
    let matrix = Matrix::new(dict.nwords() + args.bucket, args.dim);
    matrix.uniform(&mut MinstdRand::new(1), 1.0 / args.dim as f32);
    for (i, word) in words.iter().enumerate() {
        let id = dict.word_id(word);
        if id < 0 || id as usize >= dict.nwords() {
            continue;
        }
        for j in 0..dim {
            matrix.set(id as usize, j, data[i * dim + j]);
        }
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use crate::args::{Args, ModelKind};
    use crate::dictionary::Dictionary;
    use crate::matrix::Matrix;
    use crate::rng::MinstdRand;

    use super::{CancelToken, Trainer};

    fn temp_corpus(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("jamotext-test-{}-{}", std::process::id(), name));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn tiny_args() -> Args {
        let mut args = Args::new(ModelKind::SkipGram);
        args.dim = 10;
        args.minn = 2;
        args.maxn = 4;
        args.bucket = 1000;
        args.min_count = 1;
        args.epoch = 2;
        args.thread = 1;
        args.t = 1.0;
        args.finalize().unwrap()
    }

    fn train_once(path: &std::path::Path, args: &Args) -> (Dictionary, Vec<f32>) {
        let file = std::fs::File::open(path).unwrap();
        let dict = Dictionary::read_from(std::io::BufReader::new(file), args).unwrap();
        let input = Matrix::new(dict.nwords() + args.bucket, args.dim);
        input.uniform(&mut MinstdRand::new(1), 1.0 / args.dim as f32);
        let output = Matrix::new(dict.nwords(), args.dim);
        let mut trainer =
            Trainer::new(args, path, &dict, &input, &output, CancelToken::new()).unwrap();
        trainer.run().unwrap();
        let flat = input.to_vec();
        (dict, flat)
    }

    #[test]
    fn single_thread_training_is_deterministic() {
        let corpus = "the quick brown fox jumps over the lazy dog\n".repeat(40);
        let path = temp_corpus("determinism", &corpus);
        let args = tiny_args();

        let (_, first) = train_once(&path, &args);
        let (_, second) = train_once(&path, &args);
        std::fs::remove_file(&path).ok();

        let first: Vec<u32> = first.iter().map(|v| v.to_bits()).collect();
        let second: Vec<u32> = second.iter().map(|v| v.to_bits()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn training_moves_the_input_matrix() {
        let corpus = "one two three four five six seven\n".repeat(30);
        let path = temp_corpus("movement", &corpus);
        let args = tiny_args();

        let file = std::fs::File::open(&path).unwrap();
        let dict = Dictionary::read_from(std::io::BufReader::new(file), &args).unwrap();
        let input = Matrix::new(dict.nwords() + args.bucket, args.dim);
        input.uniform(&mut MinstdRand::new(1), 1.0 / args.dim as f32);
        let before = input.to_vec();
        let output = Matrix::new(dict.nwords(), args.dim);

        let mut trainer =
            Trainer::new(&args, &path, &dict, &input, &output, CancelToken::new()).unwrap();
        trainer.run().unwrap();
        std::fs::remove_file(&path).ok();

        assert_ne!(before, input.to_vec());
        assert!(input.to_vec().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn cancelled_training_stops_and_reports() {
        let corpus = "alpha beta gamma delta epsilon\n".repeat(50);
        let path = temp_corpus("cancel", &corpus);
        let mut args = tiny_args();
        args.thread = 2;
        args.epoch = 50;

        let file = std::fs::File::open(&path).unwrap();
        let dict = Dictionary::read_from(std::io::BufReader::new(file), &args).unwrap();
        let input = Matrix::new(dict.nwords() + args.bucket, args.dim);
        input.uniform(&mut MinstdRand::new(1), 1.0 / args.dim as f32);
        let output = Matrix::new(dict.nwords(), args.dim);

        let cancel = CancelToken::new();
        cancel.cancel();
        let mut trainer = Trainer::new(&args, &path, &dict, &input, &output, cancel).unwrap();
        assert!(trainer.run().is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn multi_thread_training_completes() {
        let corpus = "seoul busan daegu incheon gwangju daejeon ulsan\n".repeat(60);
        let path = temp_corpus("threads", &corpus);
        let mut args = tiny_args();
        args.thread = 4;

        let (dict, flat) = {
            let file = std::fs::File::open(&path).unwrap();
            let dict = Dictionary::read_from(std::io::BufReader::new(file), &args).unwrap();
            let input = Matrix::new(dict.nwords() + args.bucket, args.dim);
            input.uniform(&mut MinstdRand::new(1), 1.0 / args.dim as f32);
            let output = Matrix::new(dict.nwords(), args.dim);
            let mut trainer =
                Trainer::new(&args, &path, &dict, &input, &output, CancelToken::new()).unwrap();
            trainer.run().unwrap();
            (dict, input.to_vec())
        };
        std::fs::remove_file(&path).ok();

        assert!(dict.nwords() > 0);
        assert!(flat.iter().all(|v| v.is_finite()));
    }
}

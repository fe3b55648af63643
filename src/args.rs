//! Training and model configuration.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::subword::SubwordScheme;

/// Model architecture.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModelKind {
    Cbow,
    SkipGram,
    Supervised,
}

impl ModelKind {
    fn to_wire(self) -> i32 {
        match self {
            ModelKind::Cbow => 1,
            ModelKind::SkipGram => 2,
            ModelKind::Supervised => 3,
        }
    }

    fn from_wire(value: i32) -> Result<Self> {
        match value {
            1 => Ok(ModelKind::Cbow),
            2 => Ok(ModelKind::SkipGram),
            3 => Ok(ModelKind::Supervised),
            m => Err(Error::format_error(format!("Unknown model: {}", m))),
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "cbow" => Ok(ModelKind::Cbow),
            "skipgram" => Ok(ModelKind::SkipGram),
            "supervised" => Ok(ModelKind::Supervised),
            m => Err(Error::invalid_argument(format!("Unknown model name: {}", m))),
        }
    }
}

/// Loss function.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LossKind {
    HierarchicalSoftmax,
    NegativeSampling,
    Softmax,
}

impl LossKind {
    fn to_wire(self) -> i32 {
        match self {
            LossKind::HierarchicalSoftmax => 1,
            LossKind::NegativeSampling => 2,
            LossKind::Softmax => 3,
        }
    }

    fn from_wire(value: i32) -> Result<Self> {
        match value {
            1 => Ok(LossKind::HierarchicalSoftmax),
            2 => Ok(LossKind::NegativeSampling),
            3 => Ok(LossKind::Softmax),
            l => Err(Error::format_error(format!("Unknown loss: {}", l))),
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "hs" => Ok(LossKind::HierarchicalSoftmax),
            "ns" => Ok(LossKind::NegativeSampling),
            "softmax" => Ok(LossKind::Softmax),
            l => Err(Error::invalid_argument(format!("Unknown loss name: {}", l))),
        }
    }
}

/// Immutable configuration of a model.
///
/// Build with [`Args::new`] followed by field assignments and a final
/// [`Args::finalize`]; `finalize` applies the invariants that fastText
/// forces (supervised models use softmax loss and no character n-grams;
/// the bucket table disappears when nothing would be hashed into it).
#[derive(Clone, Debug)]
pub struct Args {
    pub model: ModelKind,
    pub loss: LossKind,
    pub dim: usize,
    pub ws: usize,
    pub epoch: usize,
    pub min_count: u64,
    pub min_count_label: u64,
    pub neg: usize,
    pub word_ngrams: usize,
    pub bucket: usize,
    pub minn: usize,
    pub maxn: usize,
    pub lr: f64,
    pub lr_update_rate: usize,
    pub t: f64,
    pub label: String,
    pub thread: usize,
    pub scheme: SubwordScheme,
    // quantization:
    pub qout: bool,
    pub qnorm: bool,
    pub dsub: usize,
    pub cutoff: usize,
}

impl Args {
    /// Default arguments for the given model kind.
    pub fn new(model: ModelKind) -> Self {
        Args {
            model,
            loss: LossKind::NegativeSampling,
            dim: 100,
            ws: 5,
            epoch: 5,
            min_count: 5,
            min_count_label: 0,
            neg: 5,
            word_ngrams: 1,
            bucket: 2_000_000,
            minn: 3,
            maxn: 6,
            lr: 0.05,
            lr_update_rate: 100,
            t: 1e-4,
            label: "__label__".to_string(),
            thread: 12,
            scheme: SubwordScheme::default(),
            qout: false,
            qnorm: false,
            dsub: 2,
            cutoff: 0,
        }
    }

    /// Apply the per-model invariants and validate the configuration.
    pub fn finalize(mut self) -> Result<Self> {
        if self.model == ModelKind::Supervised {
            self.loss = LossKind::Softmax;
            self.min_count = 1;
            self.minn = 0;
            self.maxn = 0;
            self.lr = 0.1;
        }
        if self.word_ngrams <= 1 && self.maxn == 0 {
            self.bucket = 0;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(Error::invalid_argument("dim must be positive"));
        }
        if self.ws == 0 {
            return Err(Error::invalid_argument("ws must be positive"));
        }
        if self.epoch == 0 {
            return Err(Error::invalid_argument("epoch must be positive"));
        }
        if self.lr <= 0.0 {
            return Err(Error::invalid_argument("lr must be positive"));
        }
        if self.t <= 0.0 {
            return Err(Error::invalid_argument("t must be positive"));
        }
        if self.minn > self.maxn {
            return Err(Error::invalid_argument("minn must not exceed maxn"));
        }
        if self.dsub == 0 {
            return Err(Error::invalid_argument("dsub must be positive"));
        }
        Ok(())
    }

    /// Write the argument header of the binary model format.
    pub fn write(&self, write: &mut impl Write) -> Result<()> {
        let mut put =
            |v: i32, what: &str| -> Result<()> {
                write
                    .write_i32::<LittleEndian>(v)
                    .map_err(|e| Error::write_error(format!("Cannot write {}", what), e))
            };
        put(self.dim as i32, "dim")?;
        put(self.ws as i32, "window size")?;
        put(self.epoch as i32, "epoch")?;
        put(self.min_count as i32, "minimum count")?;
        put(self.neg as i32, "negative samples")?;
        put(self.word_ngrams as i32, "word n-grams")?;
        put(self.loss.to_wire(), "loss")?;
        put(self.model.to_wire(), "model")?;
        put(self.bucket as i32, "bucket")?;
        put(self.minn as i32, "minn")?;
        put(self.maxn as i32, "maxn")?;
        put(self.lr_update_rate as i32, "lr update rate")?;
        write
            .write_f64::<LittleEndian>(self.t)
            .map_err(|e| Error::write_error("Cannot write sampling threshold", e))?;
        Ok(())
    }

    /// Read the argument header of the binary model format.
    ///
    /// Fields absent from the header (thread count, label prefix,
    /// quantization settings) keep their defaults.
    pub fn read(read: &mut impl Read) -> Result<Self> {
        let mut get = |what: &str| -> Result<i32> {
            read.read_i32::<LittleEndian>()
                .map_err(|e| Error::read_error(format!("Cannot read {}", what), e))
        };
        let dim = get("dim")? as usize;
        let ws = get("window size")? as usize;
        let epoch = get("epoch")? as usize;
        let min_count = get("minimum count")? as u64;
        let neg = get("negative samples")? as usize;
        let word_ngrams = get("word n-grams")? as usize;
        let loss = LossKind::from_wire(get("loss")?)?;
        let model = ModelKind::from_wire(get("model")?)?;
        let bucket = get("bucket")? as usize;
        let minn = get("minn")? as usize;
        let maxn = get("maxn")? as usize;
        let lr_update_rate = get("lr update rate")? as usize;
        let t = read
            .read_f64::<LittleEndian>()
            .map_err(|e| Error::read_error("Cannot read sampling threshold", e))?;

        let mut args = Args::new(model);
        args.loss = loss;
        args.dim = dim;
        args.ws = ws;
        args.epoch = epoch;
        args.min_count = min_count;
        args.neg = neg;
        args.word_ngrams = word_ngrams;
        args.bucket = bucket;
        args.minn = minn;
        args.maxn = maxn;
        args.lr_update_rate = lr_update_rate;
        args.t = t;
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{Args, LossKind, ModelKind};

    #[test]
    fn supervised_invariants_are_forced() {
        let mut args = Args::new(ModelKind::Supervised);
        args.loss = LossKind::NegativeSampling;
        args.minn = 2;
        args.maxn = 5;
        args.min_count = 10;
        let args = args.finalize().unwrap();
        assert_eq!(args.loss, LossKind::Softmax);
        assert_eq!(args.minn, 0);
        assert_eq!(args.maxn, 0);
        assert_eq!(args.min_count, 1);
        assert!((args.lr - 0.1).abs() < f64::EPSILON);
        // word_ngrams == 1 and maxn == 0: no subword hashing left.
        assert_eq!(args.bucket, 0);
    }

    #[test]
    fn bucket_survives_word_ngrams() {
        let mut args = Args::new(ModelKind::Supervised);
        args.word_ngrams = 2;
        let args = args.finalize().unwrap();
        assert_eq!(args.bucket, 2_000_000);
    }

    #[test]
    fn zero_dim_is_rejected() {
        let mut args = Args::new(ModelKind::SkipGram);
        args.dim = 0;
        assert!(args.finalize().is_err());
    }

    #[test]
    fn header_roundtrip() {
        let mut args = Args::new(ModelKind::SkipGram);
        args.dim = 10;
        args.minn = 2;
        args.maxn = 5;
        args.t = 1e-3;
        let args = args.finalize().unwrap();

        let mut cursor = Cursor::new(Vec::new());
        args.write(&mut cursor).unwrap();
        cursor.set_position(0);
        let read = Args::read(&mut cursor).unwrap();

        assert_eq!(read.model, args.model);
        assert_eq!(read.loss, args.loss);
        assert_eq!(read.dim, 10);
        assert_eq!(read.minn, 2);
        assert_eq!(read.maxn, 5);
        assert!((read.t - 1e-3).abs() < f64::EPSILON);
    }
}

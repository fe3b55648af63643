//! Vocabulary construction, subword expansion and line tokenization.

use std::io::{BufRead, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fnv::FnvHashMap;
use log::{debug, info};

use crate::args::{Args, ModelKind};
use crate::error::{Error, Result};
use crate::io::{read_string, write_string};
use crate::rng::MinstdRand;
use crate::subword::{hash, SubwordScheme, BOW, EOW};

/// Capacity of the open-addressed `word2int` table. Never resized.
pub const MAX_VOCAB_SIZE: u64 = 30_000_000;

/// Hard cap on tokens consumed per line during unsupervised training.
pub const MAX_LINE_SIZE: usize = 1024;

/// End-of-sentence token, stored in the vocabulary like any word.
pub const EOS: &str = "</s>";

const WORD_ID_DEFAULT: i32 = -1;
const PRUNE_IDX_SIZE_DEFAULT: i64 = -1;
const WORD_NGRAM_FACTOR: u64 = 116_049_371;
const READ_LOG_STEP: u64 = 10_000_000;

/// Token delimiters; the first is the newline symbol that maps to EOS.
const DELIMITERS: [u8; 7] = [b'\n', b'\r', b'\t', b' ', 0x0B, 0x0C, 0x00];

/// Vocabulary entry type. Words sort before labels.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum EntryType {
    Word,
    Label,
}

impl EntryType {
    fn to_wire(self) -> u8 {
        match self {
            EntryType::Word => 0,
            EntryType::Label => 1,
        }
    }

    fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EntryType::Word),
            1 => Ok(EntryType::Label),
            v => Err(Error::format_error(format!("Unknown entry type: {}", v))),
        }
    }
}

/// A vocabulary entry.
///
/// `subwords` is populated once by `init_ngrams` after thresholding:
/// the entry's own id first, followed by bucket-hashed n-gram ids in
/// `[nwords, nwords + bucket)`.
#[derive(Clone, Debug)]
pub struct Entry {
    pub word: String,
    pub count: u64,
    pub entry_type: EntryType,
    pub subwords: Vec<i32>,
}

/// Streaming whitespace tokenizer.
///
/// Yields whitespace-separated tokens; a newline with no pending token
/// yields the literal [`EOS`] token, and a newline terminating a token
/// is pushed back so the following call yields EOS.
pub struct TokenReader<R> {
    inner: R,
    peeked: Option<u8>,
    eof: bool,
}

impl<R: BufRead> TokenReader<R> {
    pub fn new(inner: R) -> Self {
        TokenReader {
            inner,
            peeked: None,
            eof: false,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.peeked.is_none()
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        if let Some(b) = self.peeked.take() {
            return Ok(Some(b));
        }
        let buf = self
            .inner
            .fill_buf()
            .map_err(|e| Error::read_error("Cannot read token", e))?;
        if buf.is_empty() {
            self.eof = true;
            return Ok(None);
        }
        let b = buf[0];
        self.inner.consume(1);
        Ok(Some(b))
    }

    /// Next token, or `None` at end of stream.
    pub fn next_word(&mut self) -> Result<Option<String>> {
        let mut word = Vec::new();
        while let Some(b) = self.next_byte()? {
            if !DELIMITERS.contains(&b) {
                word.push(b);
                continue;
            }
            if word.is_empty() {
                if b == DELIMITERS[0] {
                    return Ok(Some(EOS.to_string()));
                }
                continue;
            }
            if b == DELIMITERS[0] {
                self.peeked = Some(b);
            }
            return Ok(Some(into_token(word)?));
        }
        if word.is_empty() {
            Ok(None)
        } else {
            Ok(Some(into_token(word)?))
        }
    }
}

impl<R: BufRead + Seek> TokenReader<R> {
    /// Position the reader at a byte offset, dropping buffered state.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.inner
            .seek(SeekFrom::Start(pos))
            .map_err(|e| Error::read_error("Cannot seek in input", e))?;
        self.peeked = None;
        self.eof = false;
        Ok(())
    }

    /// Restart from the beginning when the stream is exhausted, so
    /// training epochs wrap around the worker's shard end.
    pub fn rewind_if_eof(&mut self) -> Result<()> {
        if self.is_eof() {
            self.seek(0)?;
        }
        Ok(())
    }
}

fn into_token(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|e| Error::format_error(format!("Token contains invalid UTF-8: {}", e)))
}

/// The dictionary: vocabulary, subword table and discard table.
#[derive(Clone)]
pub struct Dictionary {
    words: Vec<Entry>,
    pdiscard: Vec<f32>,
    word2int: FnvHashMap<u64, i32>,
    size: usize,
    nwords: usize,
    nlabels: usize,
    ntokens: u64,
    prune_idx: FnvHashMap<i32, i32>,
    prune_idx_size: i64,
    // args:
    model: ModelKind,
    label: String,
    bucket: u64,
    minn: usize,
    maxn: usize,
    word_ngrams: usize,
    t: f64,
    scheme: SubwordScheme,
}

impl Dictionary {
    pub fn new(args: &Args) -> Self {
        Dictionary {
            words: Vec::new(),
            pdiscard: Vec::new(),
            word2int: FnvHashMap::default(),
            size: 0,
            nwords: 0,
            nlabels: 0,
            ntokens: 0,
            prune_idx: FnvHashMap::default(),
            prune_idx_size: PRUNE_IDX_SIZE_DEFAULT,
            model: args.model,
            label: args.label.clone(),
            bucket: args.bucket as u64,
            minn: args.minn,
            maxn: args.maxn,
            word_ngrams: args.word_ngrams,
            t: args.t,
            scheme: args.scheme,
        }
    }

    pub fn nwords(&self) -> usize {
        self.nwords
    }

    pub fn nlabels(&self) -> usize {
        self.nlabels
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ntokens(&self) -> u64 {
        self.ntokens
    }

    pub fn entries(&self) -> &[Entry] {
        &self.words
    }

    pub fn is_pruned(&self) -> bool {
        self.prune_idx_size >= 0
    }

    /// Probe for the slot of `w` in the open-addressed table.
    fn find(&self, w: &str) -> u64 {
        self.find_hashed(w, hash(w))
    }

    fn find_hashed(&self, w: &str, h: u32) -> u64 {
        find_slot(&self.word2int, &self.words, w, h)
    }

    /// Id of `w`, or -1 when out of vocabulary.
    pub fn word_id(&self, w: &str) -> i32 {
        self.id_at_slot(self.find(w))
    }

    fn id_at_slot(&self, slot: u64) -> i32 {
        self.word2int.get(&slot).copied().unwrap_or(WORD_ID_DEFAULT)
    }

    fn type_of_token(&self, token: &str) -> EntryType {
        if token.starts_with(&self.label) {
            EntryType::Label
        } else {
            EntryType::Word
        }
    }

    pub fn word(&self, id: usize) -> &str {
        &self.words[id].word
    }

    /// Label string for a label id in `[0, nlabels)`.
    pub fn label(&self, lid: i32) -> Result<&str> {
        if lid < 0 || lid as usize >= self.nlabels {
            return Err(Error::invalid_argument(format!(
                "Label id is out of range [0, {})",
                self.nlabels
            )));
        }
        Ok(&self.words[lid as usize + self.nwords].word)
    }

    /// Count one occurrence of `w`, inserting it on first sight.
    pub fn add(&mut self, w: &str) {
        let slot = self.find(w);
        self.ntokens += 1;
        match self.word2int.get(&slot) {
            None => {
                self.words.push(Entry {
                    word: w.to_string(),
                    count: 1,
                    entry_type: self.type_of_token(w),
                    subwords: Vec::new(),
                });
                self.word2int.insert(slot, self.size as i32);
                self.size += 1;
            }
            Some(&id) => {
                self.words[id as usize].count += 1;
            }
        }
    }

    /// Per-type occurrence counts, in entry order.
    pub fn counts(&self, entry_type: EntryType) -> Vec<u64> {
        self.words
            .iter()
            .filter(|e| e.entry_type == entry_type)
            .map(|e| e.count)
            .collect()
    }

    /// Build the dictionary from a token stream.
    pub fn read_from(reader: impl BufRead, args: &Args) -> Result<Dictionary> {
        let mut dict = Dictionary::new(args);
        let mut tokens = TokenReader::new(reader);
        let mut min_threshold = 1;

        while let Some(word) = tokens.next_word()? {
            dict.add(&word);
            if dict.ntokens % READ_LOG_STEP == 0 {
                debug!("Read {}M words", dict.ntokens / 1_000_000);
            }
            if dict.size as u64 * 4 > MAX_VOCAB_SIZE * 3 {
                min_threshold += 1;
                dict.threshold(min_threshold, min_threshold);
            }
        }
        dict.threshold(args.min_count, args.min_count_label);
        dict.init_table_discard();
        dict.init_ngrams();

        info!("Read {}M words", dict.ntokens / 1_000_000);
        info!("Number of words:  {}", dict.nwords);
        info!("Number of labels: {}", dict.nlabels);
        if dict.size == 0 {
            return Err(Error::format_error(
                "Empty vocabulary. Try a smaller -minCount value.",
            ));
        }
        Ok(dict)
    }

    /// Drop entries below the per-type thresholds, sort words before
    /// labels by descending count and rebuild the slot table.
    pub fn threshold(&mut self, word_threshold: u64, label_threshold: u64) {
        let mut words = std::mem::take(&mut self.words);
        words.retain(|e| match e.entry_type {
            EntryType::Word => e.count >= word_threshold,
            EntryType::Label => e.count >= label_threshold,
        });
        words.sort_by(|a, b| {
            a.entry_type
                .cmp(&b.entry_type)
                .then(b.count.cmp(&a.count))
        });

        self.word2int = FnvHashMap::default();
        self.nwords = 0;
        self.nlabels = 0;
        for (i, e) in words.iter().enumerate() {
            let slot = find_slot(&self.word2int, &words, &e.word, hash(&e.word));
            self.word2int.insert(slot, i as i32);
            match e.entry_type {
                EntryType::Word => self.nwords += 1,
                EntryType::Label => self.nlabels += 1,
            }
        }
        self.size = words.len();
        self.words = words;
    }

    /// Precompute the subword id lists of all entries.
    fn init_ngrams(&mut self) {
        for i in 0..self.size {
            let padded = format!("{}{}{}", BOW, self.words[i].word, EOW);
            let mut subwords = vec![i as i32];
            if self.words[i].word != EOS {
                self.compute_subwords(&padded, &mut subwords);
            }
            self.words[i].subwords = subwords;
        }
    }

    /// Hash the n-grams of a padded word into `ngrams`.
    pub fn compute_subwords(&self, word: &str, ngrams: &mut Vec<i32>) {
        if self.bucket == 0 {
            return;
        }
        let mut pushed = Vec::new();
        self.scheme.compute(word, self.minn, self.maxn, |ngram| {
            pushed.push((hash(ngram) as u64 % self.bucket) as i32);
        });
        for id in pushed {
            self.push_hash(ngrams, id);
        }
    }

    /// N-grams of a padded word together with their id, bypassing the
    /// prune remap. Used by n-gram inspection.
    pub fn subword_ngrams(&self, word: &str) -> Vec<(String, i32)> {
        let mut out = Vec::new();
        if self.bucket == 0 {
            return out;
        }
        let nwords = self.nwords as i32;
        self.scheme.compute(word, self.minn, self.maxn, |ngram| {
            let id = (hash(ngram) as u64 % self.bucket) as i32;
            out.push((ngram.to_string(), nwords + id));
        });
        out
    }

    fn push_hash(&self, hashes: &mut Vec<i32>, id: i32) {
        if self.prune_idx_size == 0 || id < 0 {
            return;
        }
        let mut id = id;
        if self.prune_idx_size > 0 {
            match self.prune_idx.get(&id) {
                Some(&remapped) => id = remapped,
                None => return,
            }
        }
        hashes.push(self.nwords as i32 + id);
    }

    fn init_table_discard(&mut self) {
        self.pdiscard = self
            .words
            .iter()
            .map(|e| {
                let f = e.count as f64 / self.ntokens as f64;
                (self.t / f).sqrt() as f32 + (self.t / f) as f32
            })
            .collect();
    }

    /// Should token `id` be dropped given a fresh `U(0, 1)` sample?
    /// Never discards for supervised models.
    fn discard(&self, id: i32, rand: f64) -> bool {
        debug_assert!(id >= 0 && (id as usize) < self.nwords);
        self.model != ModelKind::Supervised && rand > f64::from(self.pdiscard[id as usize])
    }

    /// Subword ids of an in-vocabulary word.
    pub fn subwords(&self, id: i32) -> &[i32] {
        debug_assert!(id >= 0 && (id as usize) < self.nwords);
        &self.words[id as usize].subwords
    }

    /// Subword ids of any word; out-of-vocabulary words are expanded on
    /// the fly without a leading self-index.
    pub fn subwords_of(&self, word: &str) -> Vec<i32> {
        let id = self.word_id(word);
        if id >= 0 {
            return self.subwords(id).to_vec();
        }
        let mut ngrams = Vec::new();
        self.compute_subwords(&format!("{}{}{}", BOW, word, EOW), &mut ngrams);
        ngrams
    }

    fn add_subwords(&self, line: &mut Vec<i32>, token: &str, wid: i32) {
        if wid < 0 {
            // out of vocab
            self.compute_subwords(&format!("{}{}{}", BOW, token, EOW), line);
        } else if self.maxn == 0 {
            line.push(wid);
        } else {
            line.extend_from_slice(self.subwords(wid));
        }
    }

    fn add_word_ngrams(&self, line: &mut Vec<i32>, hashes: &[i32]) {
        if self.bucket == 0 {
            return;
        }
        for i in 0..hashes.len() {
            let mut h = hashes[i] as i64 as u64;
            for &hj in hashes
                .iter()
                .take((i + self.word_ngrams).min(hashes.len()))
                .skip(i + 1)
            {
                h = h.wrapping_mul(WORD_NGRAM_FACTOR).wrapping_add(hj as i64 as u64);
                self.push_hash(line, (h % self.bucket) as i32);
            }
        }
    }

    /// Read one labeled line: subword ids of the words into `line`,
    /// label ids (offset by `nwords`) into `labels`, then word n-gram
    /// ids. Used at test and predict time and by supervised training.
    pub fn read_line_labeled<R: BufRead + Seek>(
        &self,
        reader: &mut TokenReader<R>,
        line: &mut Vec<i32>,
        labels: &mut Vec<i32>,
    ) -> Result<usize> {
        reader.rewind_if_eof()?;
        let mut word_hashes: Vec<i32> = Vec::new();
        let mut ntokens = 0;
        line.clear();
        labels.clear();

        while let Some(token) = reader.next_word()? {
            ntokens += 1;
            let h = hash(&token);
            let wid = self.id_at_slot(self.find_hashed(&token, h));
            let entry_type = if wid < 0 {
                self.type_of_token(&token)
            } else {
                self.words[wid as usize].entry_type
            };
            match entry_type {
                EntryType::Word => {
                    self.add_subwords(line, &token, wid);
                    word_hashes.push(h as i32);
                }
                EntryType::Label if wid >= 0 => {
                    labels.push(wid - self.nwords as i32);
                }
                EntryType::Label => {}
            }
            if token == EOS {
                break;
            }
        }
        self.add_word_ngrams(line, &word_hashes);
        Ok(ntokens)
    }

    /// Read one line of word ids for unsupervised training, applying
    /// the discard table. Stops at EOS or after [`MAX_LINE_SIZE`]
    /// in-vocabulary tokens.
    pub fn read_line_unlabeled<R: BufRead + Seek>(
        &self,
        reader: &mut TokenReader<R>,
        line: &mut Vec<i32>,
        rng: &mut MinstdRand,
    ) -> Result<usize> {
        reader.rewind_if_eof()?;
        let mut ntokens = 0;
        line.clear();

        while let Some(token) = reader.next_word()? {
            let h = hash(&token);
            let wid = self.id_at_slot(self.find_hashed(&token, h));
            if wid < 0 {
                continue;
            }
            ntokens += 1;
            if self.words[wid as usize].entry_type == EntryType::Word
                && !self.discard(wid, rng.uniform_unit())
            {
                line.push(wid);
            }
            if ntokens > MAX_LINE_SIZE || token == EOS {
                break;
            }
        }
        Ok(ntokens)
    }

    /// Tokenize a single in-memory line the way `read_line_labeled`
    /// would.
    pub fn line_from_str(&self, line: &str) -> Result<(Vec<i32>, Vec<i32>)> {
        // Trailing newline makes the line produce its EOS token.
        let data = format!("{}\n", line);
        let mut reader = TokenReader::new(std::io::Cursor::new(data.into_bytes()));
        let mut words = Vec::new();
        let mut labels = Vec::new();
        self.read_line_labeled(&mut reader, &mut words, &mut labels)?;
        Ok((words, labels))
    }

    /// Restrict input rows to `idx` (word ids ascending, then n-gram
    /// ids), recording the n-gram remap. Returns the kept row ids in
    /// their new order.
    pub fn prune(&mut self, idx: &[i32]) -> Vec<i32> {
        let nwords = self.nwords as i32;
        let mut kept_words: Vec<i32> = idx.iter().copied().filter(|&i| i < nwords).collect();
        let ngrams: Vec<i32> = idx.iter().copied().filter(|&i| i >= nwords).collect();
        kept_words.sort_unstable();

        let mut result = kept_words.clone();
        if !ngrams.is_empty() {
            for (j, &ngram) in ngrams.iter().enumerate() {
                self.prune_idx.insert(ngram - nwords, j as i32);
            }
            result.extend_from_slice(&ngrams);
        }
        self.prune_idx_size = self.prune_idx.len() as i64;

        self.word2int = FnvHashMap::default();
        let mut j = 0usize;
        for i in 0..self.words.len() {
            let keep = self.words[i].entry_type == EntryType::Label
                || (j < kept_words.len() && kept_words[j] == i as i32);
            if !keep {
                continue;
            }
            self.words.swap(j, i);
            let slot = find_slot(
                &self.word2int,
                &self.words,
                &self.words[j].word,
                hash(&self.words[j].word),
            );
            self.word2int.insert(slot, j as i32);
            j += 1;
        }
        self.nwords = kept_words.len();
        self.size = self.nwords + self.nlabels;
        self.words.truncate(self.size);
        self.init_ngrams();
        result
    }

    pub fn write(&self, write: &mut impl Write) -> Result<()> {
        let mut put_i32 = |v: i32, what: &str| -> Result<()> {
            write
                .write_i32::<LittleEndian>(v)
                .map_err(|e| Error::write_error(format!("Cannot write {}", what), e))
        };
        put_i32(self.size as i32, "dictionary size")?;
        put_i32(self.nwords as i32, "number of words")?;
        put_i32(self.nlabels as i32, "number of labels")?;
        write
            .write_i64::<LittleEndian>(self.ntokens as i64)
            .map_err(|e| Error::write_error("Cannot write number of tokens", e))?;
        write
            .write_i64::<LittleEndian>(self.prune_idx_size)
            .map_err(|e| Error::write_error("Cannot write pruned vocabulary size", e))?;
        for entry in &self.words {
            write_string(write, &entry.word)?;
            write
                .write_i64::<LittleEndian>(entry.count as i64)
                .map_err(|e| Error::write_error("Cannot write word count", e))?;
            write
                .write_u8(entry.entry_type.to_wire())
                .map_err(|e| Error::write_error("Cannot write entry type", e))?;
        }
        for (&key, &value) in &self.prune_idx {
            write
                .write_i32::<LittleEndian>(key)
                .and_then(|_| write.write_i32::<LittleEndian>(value))
                .map_err(|e| Error::write_error("Cannot write prune pair", e))?;
        }
        Ok(())
    }

    pub fn read(read: &mut impl BufRead, args: &Args) -> Result<Dictionary> {
        let mut dict = Dictionary::new(args);
        let size = read
            .read_i32::<LittleEndian>()
            .map_err(|e| Error::read_error("Cannot read dictionary size", e))?;
        let nwords = read
            .read_i32::<LittleEndian>()
            .map_err(|e| Error::read_error("Cannot read number of words", e))?;
        let nlabels = read
            .read_i32::<LittleEndian>()
            .map_err(|e| Error::read_error("Cannot read number of labels", e))?;
        let ntokens = read
            .read_i64::<LittleEndian>()
            .map_err(|e| Error::read_error("Cannot read number of tokens", e))?;
        let prune_idx_size = read
            .read_i64::<LittleEndian>()
            .map_err(|e| Error::read_error("Cannot read pruned vocabulary size", e))?;

        dict.size = size as usize;
        dict.nwords = nwords as usize;
        dict.nlabels = nlabels as usize;
        dict.ntokens = ntokens as u64;
        dict.prune_idx_size = prune_idx_size;

        dict.words.reserve(dict.size);
        for i in 0..dict.size {
            let word = read_string(read)?;
            let count = read
                .read_i64::<LittleEndian>()
                .map_err(|e| Error::read_error("Cannot read word count", e))?;
            let entry_type = EntryType::from_wire(
                read.read_u8()
                    .map_err(|e| Error::read_error("Cannot read entry type", e))?,
            )?;
            dict.words.push(Entry {
                word,
                count: count as u64,
                entry_type,
                subwords: Vec::new(),
            });
            let slot = find_slot(
                &dict.word2int,
                &dict.words,
                &dict.words[i].word,
                hash(&dict.words[i].word),
            );
            dict.word2int.insert(slot, i as i32);
        }
        for _ in 0..prune_idx_size.max(0) {
            let key = read
                .read_i32::<LittleEndian>()
                .map_err(|e| Error::read_error("Cannot read prune pair key", e))?;
            let value = read
                .read_i32::<LittleEndian>()
                .map_err(|e| Error::read_error("Cannot read prune pair value", e))?;
            dict.prune_idx.insert(key, value);
        }
        dict.init_table_discard();
        dict.init_ngrams();
        Ok(dict)
    }
}

/// Linear probing over the slot map; stops at an empty slot or the slot
/// whose entry matches `w`.
fn find_slot(word2int: &FnvHashMap<u64, i32>, words: &[Entry], w: &str, h: u32) -> u64 {
    let mut slot = u64::from(h) % MAX_VOCAB_SIZE;
    loop {
        match word2int.get(&slot) {
            None => return slot,
            Some(&id) if words[id as usize].word == w => return slot,
            Some(_) => slot = (slot + 1) % MAX_VOCAB_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::args::{Args, ModelKind};
    use crate::rng::MinstdRand;

    use super::{Dictionary, EntryType, TokenReader, EOS};

    fn skipgram_args() -> Args {
        let mut args = Args::new(ModelKind::SkipGram);
        args.min_count = 1;
        args.minn = 2;
        args.maxn = 4;
        args.bucket = 10_000;
        args.finalize().unwrap()
    }

    fn small_dict(corpus: &str, args: &Args) -> Dictionary {
        Dictionary::read_from(Cursor::new(corpus.as_bytes().to_vec()), args).unwrap()
    }

    #[test]
    fn tokenizer_emits_eos_on_newlines() {
        let mut reader = TokenReader::new(Cursor::new(b"one two\nthree\n\n".to_vec()));
        let mut tokens = Vec::new();
        while let Some(t) = reader.next_word().unwrap() {
            tokens.push(t);
        }
        assert_eq!(tokens, vec!["one", "two", EOS, "three", EOS, EOS]);
        assert!(reader.is_eof());
    }

    #[test]
    fn tokenizer_skips_other_whitespace() {
        let mut reader = TokenReader::new(Cursor::new(b"a\t b\r\nc".to_vec()));
        let mut tokens = Vec::new();
        while let Some(t) = reader.next_word().unwrap() {
            tokens.push(t);
        }
        assert_eq!(tokens, vec!["a", "b", EOS, "c"]);
    }

    #[test]
    fn counts_and_thresholding() {
        let args = skipgram_args();
        let dict = small_dict("b a a b b c\n", &args);
        // a:2 b:3 c:1 </s>:1; words sorted by descending count.
        assert_eq!(dict.size(), 4);
        assert_eq!(dict.nwords(), 4);
        assert_eq!(dict.ntokens(), 7);
        assert_eq!(dict.word(0), "b");
        assert_eq!(dict.word(1), "a");

        let mut args = skipgram_args();
        args.min_count = 2;
        let dict = small_dict("b a a b b c\n", &args);
        assert_eq!(dict.nwords(), 2);
        assert!(dict.word_id("c") < 0);
    }

    #[test]
    fn empty_vocabulary_is_fatal() {
        let mut args = skipgram_args();
        args.min_count = 100;
        assert!(Dictionary::read_from(Cursor::new(b"a b c\n".to_vec()), &args).is_err());
    }

    #[test]
    fn labels_sort_after_words() {
        let mut args = Args::new(ModelKind::Supervised);
        args.word_ngrams = 2;
        let args = args.finalize().unwrap();
        let dict = small_dict("__label__pos good film\n__label__neg bad film\n", &args);
        assert_eq!(dict.nlabels(), 2);
        assert_eq!(dict.nwords(), 4);
        for entry in dict.entries().iter().take(dict.nwords()) {
            assert_eq!(entry.entry_type, EntryType::Word);
        }
        for entry in dict.entries().iter().skip(dict.nwords()) {
            assert_eq!(entry.entry_type, EntryType::Label);
        }
        assert_eq!(dict.label(0).unwrap().starts_with("__label__"), true);
        assert!(dict.label(5).is_err());
    }

    #[test]
    fn subwords_start_with_self_index() {
        let args = skipgram_args();
        let dict = small_dict("seoul busan seoul\n", &args);
        for id in 0..dict.nwords() as i32 {
            let subwords = dict.subwords(id);
            assert_eq!(subwords[0], id);
            for &sw in &subwords[1..] {
                assert!(sw >= dict.nwords() as i32);
                assert!((sw as usize) < dict.nwords() + 10_000);
            }
        }
    }

    #[test]
    fn eos_has_no_subwords() {
        let args = skipgram_args();
        let dict = small_dict("a b\n", &args);
        let eos = dict.word_id(EOS);
        assert!(eos >= 0);
        assert_eq!(dict.subwords(eos), &[eos]);
    }

    #[test]
    fn oov_subwords_have_no_self_index() {
        let args = skipgram_args();
        let dict = small_dict("seoul busan\n", &args);
        let subwords = dict.subwords_of("daegu");
        assert!(!subwords.is_empty());
        assert!(subwords.iter().all(|&id| id >= dict.nwords() as i32));
    }

    #[test]
    fn discard_table_is_finite_and_positive() {
        let args = skipgram_args();
        let dict = small_dict("a a a a b b c\n", &args);
        for i in 0..dict.size() {
            let p = dict.pdiscard[i];
            assert!(p.is_finite());
            assert!(p > 0.0);
        }
    }

    #[test]
    fn unlabeled_line_reads_ids() {
        let args = skipgram_args();
        let dict = small_dict("a b c a\n", &args);
        let mut reader = TokenReader::new(Cursor::new(b"a c b unknown\n".to_vec()));
        let mut line = Vec::new();
        let mut rng = MinstdRand::new(1);
        let ntokens = dict
            .read_line_unlabeled(&mut reader, &mut line, &mut rng)
            .unwrap();
        // "unknown" is not counted, EOS is.
        assert_eq!(ntokens, 4);
        assert!(line.len() <= 4);
    }

    #[test]
    fn labeled_line_collects_words_and_labels() {
        let mut args = Args::new(ModelKind::Supervised);
        args.word_ngrams = 2;
        let args = args.finalize().unwrap();
        let dict = small_dict("__label__pos good fine film\n__label__neg bad film\n", &args);
        assert_eq!(dict.nwords(), 5);
        let (words, labels) = dict.line_from_str("__label__pos good film").unwrap();
        assert_eq!(labels.len(), 1);
        assert!(labels[0] >= 0 && (labels[0] as usize) < dict.nlabels());
        // words: "good", "film", EOS plus bigram bucket ids.
        assert!(words.len() >= 3);
        let bigrams: Vec<_> = words
            .iter()
            .filter(|&&w| w >= dict.nwords() as i32)
            .collect();
        assert!(!bigrams.is_empty());
    }

    #[test]
    fn save_load_roundtrip() {
        let args = skipgram_args();
        let dict = small_dict("seoul busan seoul daegu\n", &args);
        let mut cursor = Cursor::new(Vec::new());
        dict.write(&mut cursor).unwrap();
        cursor.set_position(0);
        let loaded = Dictionary::read(&mut cursor, &args).unwrap();

        assert_eq!(loaded.size(), dict.size());
        assert_eq!(loaded.nwords(), dict.nwords());
        assert_eq!(loaded.ntokens(), dict.ntokens());
        for id in 0..dict.nwords() {
            assert_eq!(loaded.word(id), dict.word(id));
            assert_eq!(loaded.subwords(id as i32), dict.subwords(id as i32));
        }
        assert_eq!(loaded.word_id("seoul"), dict.word_id("seoul"));
    }

    #[test]
    fn prune_remaps_ngrams() {
        let args = skipgram_args();
        let mut dict = small_dict("seoul busan daegu\n", &args);
        let nwords = dict.nwords() as i32;
        // Keep two words and two n-gram rows.
        let idx = vec![1, 0, nwords + 5, nwords + 9];
        let kept = dict.prune(&idx);
        assert_eq!(&kept[..2], &[0, 1]);
        assert_eq!(dict.nwords(), 2);
        assert!(dict.is_pruned());
        // Surviving subword ids must stay within the compact row space.
        for id in 0..dict.nwords() as i32 {
            for &sw in dict.subwords(id) {
                assert!((sw as usize) < dict.nwords() + 2);
            }
        }
    }
}

//! Subword hashing and n-gram extraction.
//!
//! Words are padded with `<` and `>` and decomposed into byte n-grams
//! whose lengths are bounded in *bytes* but which always cover whole
//! UTF-8 code points. Each n-gram is mapped into the bucket space with
//! the FNV-1a hash below.

use std::collections::HashSet;

use crate::jamo::{is_consonant, SYLLABLE_TERMINATOR};

/// Beginning-of-word marker used for padding.
pub const BOW: char = '<';
/// End-of-word marker used for padding.
pub const EOW: char = '>';

/// FNV-1a over the UTF-8 bytes of `word`.
///
/// fastText accumulates `char` values, which sign extends bytes above
/// 0x7F before the XOR on platforms with a signed `char`. Pretrained
/// models bake that behavior into their bucket assignment, so it is
/// reproduced here by widening through `i8`.
pub fn hash(word: &str) -> u32 {
    let mut h: u32 = 2_166_136_261;
    for byte in word.bytes() {
        h ^= (byte as i8) as u32;
        h = h.wrapping_mul(16_777_619);
    }
    h
}

fn is_continuation_byte(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Walk every byte n-gram of `word` with `n` in `[minn, maxn]`.
///
/// `n` counts code points; the walker starts at every code point
/// boundary and extends one code point at a time. An n-gram of length 1
/// that touches either padding marker is skipped, matching the
/// reference: the whole word already has its own embedding row.
pub fn ngrams(word: &str, minn: usize, maxn: usize, mut push: impl FnMut(&str)) {
    let bytes = word.as_bytes();
    for start in 0..bytes.len() {
        if is_continuation_byte(bytes[start]) {
            continue;
        }
        let mut end = start;
        for n in 1..=maxn {
            if end >= bytes.len() {
                break;
            }
            end += 1;
            while end < bytes.len() && is_continuation_byte(bytes[end]) {
                end += 1;
            }
            if n >= minn && !(n == 1 && (start == 0 || end == bytes.len())) {
                push(&word[start..end]);
            }
        }
    }
}

/// Strategy for generating subword n-grams from a (decomposed) word.
///
/// The non-classic schemes target jamo-decomposed Korean text: they
/// derive variant words from the syllable groups between `ᴥ`
/// terminators and hash n-grams of the variants in addition to the
/// classic n-grams. Duplicate n-grams within one word are suppressed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubwordScheme {
    /// Byte n-grams of the padded word only.
    Classic,
    /// Classic n-grams plus, for each n-gram, its consonant-only
    /// reduction.
    ConsonantOnly,
    /// Classic n-grams plus n-grams of per-syllable variants with that
    /// syllable's vowels deleted.
    VowelAblation,
    /// Classic n-grams plus n-grams of per-syllable variants with the
    /// entire syllable deleted.
    SyllableAblation,
}

impl Default for SubwordScheme {
    fn default() -> Self {
        SubwordScheme::Classic
    }
}

impl SubwordScheme {
    /// Generate all n-gram strings of `word` (already padded) under this
    /// scheme.
    pub fn compute(self, word: &str, minn: usize, maxn: usize, mut push: impl FnMut(&str)) {
        match self {
            SubwordScheme::Classic => ngrams(word, minn, maxn, push),
            SubwordScheme::ConsonantOnly => {
                let mut seen = HashSet::new();
                ngrams(word, minn, maxn, |ngram| {
                    push(ngram);
                    let reduced = consonant_skeleton(ngram);
                    if seen.insert(reduced.clone()) {
                        push(&reduced);
                    }
                });
            }
            SubwordScheme::VowelAblation => {
                variant_ngrams(word, minn, maxn, strip_vowels, push)
            }
            SubwordScheme::SyllableAblation => {
                variant_ngrams(word, minn, maxn, |_| String::new(), push)
            }
        }
    }
}

/// Drop everything but consonants and syllable terminators, skipping the
/// final character (the padding marker or closing terminator).
fn consonant_skeleton(ngram: &str) -> String {
    let chars: Vec<char> = ngram.chars().collect();
    let take = chars.len().saturating_sub(1);
    chars[..take]
        .iter()
        .filter(|&&ch| ch == SYLLABLE_TERMINATOR || is_consonant(ch))
        .collect()
}

fn strip_vowels(syllable: &str) -> String {
    syllable.chars().filter(|&ch| is_consonant(ch)).collect()
}

/// Emit n-grams for each per-syllable variant of `word`, then for `word`
/// itself, deduplicating across all of them.
///
/// `word` is the padded form; the variant at position `k` replaces the
/// `k`-th syllable group with `ablate(group)`.
fn variant_ngrams(
    word: &str,
    minn: usize,
    maxn: usize,
    ablate: impl Fn(&str) -> String,
    mut push: impl FnMut(&str),
) {
    let mut seen: HashSet<String> = HashSet::new();
    let stripped: String = word
        .chars()
        .filter(|&ch| ch != BOW && ch != EOW)
        .collect();
    let syllables: Vec<&str> = stripped
        .split(SYLLABLE_TERMINATOR)
        .filter(|s| !s.is_empty())
        .collect();

    for position in 0..syllables.len() {
        let mut variant = String::with_capacity(word.len());
        variant.push(BOW);
        for (i, syllable) in syllables.iter().enumerate() {
            if i == position {
                variant.push_str(&ablate(syllable));
            } else {
                variant.push_str(syllable);
            }
            variant.push(SYLLABLE_TERMINATOR);
        }
        variant.push(EOW);

        ngrams(&variant, minn, maxn, |ngram| {
            if seen.insert(ngram.to_string()) {
                push(ngram);
            }
        });
    }

    ngrams(word, minn, maxn, |ngram| {
        if seen.insert(ngram.to_string()) {
            push(ngram);
        }
    });
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use lazy_static::lazy_static;
    use maplit::hashmap;

    use super::{hash, ngrams, SubwordScheme};

    lazy_static! {
        // Bucket assignments (hash % 2_000_000) pinned so that models
        // trained today keep resolving the same rows tomorrow.
        static ref BUCKET_TESTS_36: HashMap<&'static str, Vec<u32>> = hashmap! {
            "<hello>" =>
                vec![128664, 350912, 617342, 798165, 1068687, 1188580,
                     1198310, 1361308, 1504790, 1613742, 1616881,
                     1760905, 1831723, 1992344],
            "<ㄷㅐᴥㅎㅏㄴᴥ>" =>
                vec![377, 60253, 99731, 285659, 363860, 557411, 600359,
                     611729, 672521, 684373, 695398, 858106, 866485,
                     961520, 1156889, 1267003, 1396377, 1412067,
                     1505400, 1584977, 1837893, 1920323],
        };
    }

    #[test]
    fn bucket_assignment_is_stable() {
        for (word, check) in BUCKET_TESTS_36.iter() {
            let mut buckets = Vec::new();
            ngrams(word, 3, 6, |g| buckets.push(hash(g) % 2_000_000));
            buckets.sort_unstable();
            assert_eq!(&buckets, check, "bucket drift for {}", word);
        }
    }

    #[test]
    fn fnv1a_reference_vectors() {
        assert_eq!(hash(""), 2_166_136_261);
        assert_eq!(hash("a"), 3_826_002_220);
        assert_eq!(hash("Test"), 805_092_869);
        assert_eq!(hash("This is some test sentence."), 386_908_734);
        assert_eq!(hash("这是一些测试句子。"), 1_487_114_043);
        assert_eq!(hash("Šis ir daži pārbaudes teikumi."), 2_296_385_247);
        assert_eq!(hash("Тестовое предложение"), 3_337_793_681);
    }

    fn collect(word: &str, minn: usize, maxn: usize) -> Vec<String> {
        let mut out = Vec::new();
        ngrams(word, minn, maxn, |s| out.push(s.to_string()));
        out.sort();
        out
    }

    #[test]
    fn ngrams_of_short_word() {
        // "<ab>" with n in [2, 3].
        let mut check = vec!["<a", "<ab", "ab", "ab>", "b>"];
        check.sort();
        assert_eq!(collect("<ab>", 2, 3), check);
    }

    #[test]
    fn unigrams_skip_padding_boundaries() {
        // n = 1 n-grams at the word boundary would duplicate the word
        // itself, so only interior single characters remain.
        let grams = collect("<ab>", 1, 1);
        assert_eq!(grams, vec!["a", "b"]);
    }

    #[test]
    fn ngrams_respect_utf8_boundaries() {
        let mut out = Vec::new();
        ngrams("<한글>", 2, 2, |s| out.push(s.to_string()));
        assert!(out.iter().all(|g| g.chars().count() == 2));
        assert!(out.contains(&"한글".to_string()));
    }

    #[test]
    fn empty_word_produces_nothing() {
        assert!(collect("", 1, 3).is_empty());
    }

    #[test]
    fn consonant_scheme_adds_reductions() {
        let word = "<ㄷㅐᴥㅎㅏㄴᴥ>";
        let mut classic = Vec::new();
        SubwordScheme::Classic.compute(word, 3, 6, |s| classic.push(s.to_string()));
        let mut extended = Vec::new();
        SubwordScheme::ConsonantOnly.compute(word, 3, 6, |s| extended.push(s.to_string()));
        assert!(extended.len() > classic.len());
        let classic: HashSet<_> = classic.into_iter().collect();
        let extras: Vec<_> = extended
            .into_iter()
            .filter(|g| !classic.contains(g))
            .collect();
        assert!(extras
            .iter()
            .all(|g| g.chars().all(|c| c == 'ᴥ' || crate::jamo::is_consonant(c))));
    }

    #[test]
    fn ablation_schemes_deduplicate() {
        let word = "<ㄷㅐᴥㅎㅏㄴᴥ>";
        for scheme in &[SubwordScheme::VowelAblation, SubwordScheme::SyllableAblation] {
            let mut out = Vec::new();
            scheme.compute(word, 3, 6, |s| out.push(s.to_string()));
            let unique: HashSet<_> = out.iter().collect();
            assert_eq!(unique.len(), out.len(), "{:?} produced duplicates", scheme);
        }
    }

    #[test]
    fn classic_scheme_matches_plain_ngrams() {
        let word = "<hello>";
        let mut via_scheme = Vec::new();
        SubwordScheme::Classic.compute(word, 3, 6, |s| via_scheme.push(s.to_string()));
        via_scheme.sort();
        assert_eq!(via_scheme, collect(word, 3, 6));
    }
}

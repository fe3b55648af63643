//! Hangul syllable decomposition and recomposition.
//!
//! Training text is decomposed into compatibility jamo before it reaches
//! the dictionary, so subword n-grams see the initial consonant, medial
//! vowel and final consonant (초성, 중성, 종성) of every syllable as
//! separate characters. Each syllable is closed with the terminator
//! [`SYLLABLE_TERMINATOR`] so that word segmentation survives the
//! decomposition while n-grams may still span syllable boundaries.

/// Terminator emitted after every decomposed Hangul syllable (U+1D25).
pub const SYLLABLE_TERMINATOR: char = '\u{1D25}';

const HANGUL_BASE: u32 = 0xAC00;
const HANGUL_LAST: u32 = 0xD7A3;
const JUNG_COUNT: u32 = 21;
const JONG_COUNT: u32 = 28;

/// Initial consonants, compatibility jamo block.
const CHOSUNG: [char; 19] = [
    'ㄱ', 'ㄲ', 'ㄴ', 'ㄷ', 'ㄸ', 'ㄹ', 'ㅁ', 'ㅂ', 'ㅃ', 'ㅅ', 'ㅆ', 'ㅇ', 'ㅈ', 'ㅉ', 'ㅊ',
    'ㅋ', 'ㅌ', 'ㅍ', 'ㅎ',
];

/// Medial vowels.
const JUNGSUNG: [char; 21] = [
    'ㅏ', 'ㅐ', 'ㅑ', 'ㅒ', 'ㅓ', 'ㅔ', 'ㅕ', 'ㅖ', 'ㅗ', 'ㅘ', 'ㅙ', 'ㅚ', 'ㅛ', 'ㅜ', 'ㅝ',
    'ㅞ', 'ㅟ', 'ㅠ', 'ㅡ', 'ㅢ', 'ㅣ',
];

/// Final consonants; index 0 means no final consonant.
const JONGSUNG: [char; 28] = [
    '\0', 'ㄱ', 'ㄲ', 'ㄳ', 'ㄴ', 'ㄵ', 'ㄶ', 'ㄷ', 'ㄹ', 'ㄺ', 'ㄻ', 'ㄼ', 'ㄽ', 'ㄾ', 'ㄿ',
    'ㅀ', 'ㅁ', 'ㅂ', 'ㅄ', 'ㅅ', 'ㅆ', 'ㅇ', 'ㅈ', 'ㅊ', 'ㅋ', 'ㅌ', 'ㅍ', 'ㅎ',
];

/// Adjacent jamo pairs that collapse into a compound jamo on
/// recomposition.
const DOUBLE_CONSONANTS: [(&str, char); 10] = [
    ("ㄱㅅ", 'ㄳ'),
    ("ㄴㅈ", 'ㄵ'),
    ("ㄴㅎ", 'ㄶ'),
    ("ㄹㄱ", 'ㄺ'),
    ("ㄹㅁ", 'ㄻ'),
    ("ㄹㅂ", 'ㄼ'),
    ("ㄹㅅ", 'ㄽ'),
    ("ㄹㅌ", 'ㄾ'),
    ("ㄹㅎ", 'ㅀ'),
    ("ㅂㅅ", 'ㅄ'),
];

const DOUBLE_VOWELS: [(&str, char); 7] = [
    ("ㅗㅏ", 'ㅘ'),
    ("ㅗㅐ", 'ㅙ'),
    ("ㅗㅣ", 'ㅚ'),
    ("ㅜㅓ", 'ㅝ'),
    ("ㅜㅔ", 'ㅞ'),
    ("ㅜㅣ", 'ㅟ'),
    ("ㅡㅣ", 'ㅢ'),
];

/// Is `ch` a precomposed Hangul syllable?
pub fn is_hangul_syllable(ch: char) -> bool {
    (HANGUL_BASE..=HANGUL_LAST).contains(&(ch as u32))
}

/// Is `ch` a compatibility jamo consonant?
pub fn is_consonant(ch: char) -> bool {
    ('ㄱ'..='ㅎ').contains(&ch)
}

/// Is `ch` a compatibility jamo vowel?
pub fn is_vowel(ch: char) -> bool {
    ('ㅏ'..='ㅣ').contains(&ch)
}

fn chosung_index(ch: char) -> Option<u32> {
    CHOSUNG.iter().position(|&c| c == ch).map(|i| i as u32)
}

fn jungsung_index(ch: char) -> Option<u32> {
    JUNGSUNG.iter().position(|&c| c == ch).map(|i| i as u32)
}

fn jongsung_index(ch: char) -> Option<u32> {
    JONGSUNG[1..]
        .iter()
        .position(|&c| c == ch)
        .map(|i| i as u32 + 1)
}

/// Decompose every Hangul syllable of `text` into its jamo.
///
/// Each syllable emits its 초성 and 중성, the 종성 when present, and the
/// terminator `ᴥ`. All other characters pass through unchanged without
/// terminators, so the function is idempotent on already decomposed
/// text.
pub fn hangul_to_jaso(text: &str) -> String {
    let mut result = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        if !is_hangul_syllable(ch) {
            result.push(ch);
            continue;
        }

        let c = ch as u32 - HANGUL_BASE;
        let cho = c / (JUNG_COUNT * JONG_COUNT);
        let jung = (c / JONG_COUNT) % JUNG_COUNT;
        let jong = c % JONG_COUNT;

        result.push(CHOSUNG[cho as usize]);
        result.push(JUNGSUNG[jung as usize]);
        if jong != 0 {
            result.push(JONGSUNG[jong as usize]);
        }
        result.push(SYLLABLE_TERMINATOR);
    }
    result
}

/// Collapse adjacent single jamo into compound jamo (ㄱ+ㅅ → ㄳ,
/// ㅗ+ㅏ → ㅘ) ahead of recomposition.
fn collapse_couples(jamos: &str) -> String {
    let chars: Vec<char> = jamos.chars().collect();
    let mut result = String::with_capacity(jamos.len());
    let mut i = 0;
    while i < chars.len() {
        if i + 1 < chars.len() {
            let pair: String = chars[i..i + 2].iter().collect();
            let table = if is_consonant(chars[i]) {
                &DOUBLE_CONSONANTS[..]
            } else if is_vowel(chars[i]) {
                &DOUBLE_VOWELS[..]
            } else {
                &[]
            };
            if let Some(&(_, compound)) = table.iter().find(|(p, _)| *p == pair) {
                result.push(compound);
                i += 2;
                continue;
            }
        }
        result.push(chars[i]);
        i += 1;
    }
    result
}

/// Recompose a jamo string into Hangul syllables.
///
/// The string is scanned right to left around each medial vowel,
/// grouping 초성+중성 and an optional 종성 into one syllable. Used for
/// diagnostics only; terminators should be removed by the caller.
pub fn jaso_to_hangul(jamos: &str) -> String {
    let mut chars: Vec<char> = collapse_couples(jamos).chars().collect();
    // Lower bound of the part already composed on the right.
    let mut composed_from = chars.len();

    let mut i = chars.len().saturating_sub(1);
    while i > 0 {
        let current = chars[i];
        let jung = match jungsung_index(current) {
            Some(j) => j,
            None => {
                i -= 1;
                continue;
            }
        };

        let cho = chosung_index(chars[i - 1]);
        let jong = if i + 1 < chars.len() && i + 1 < composed_from {
            jongsung_index(chars[i + 1])
        } else {
            None
        };

        if let Some(cho) = cho {
            let (replaced, jong) = match jong {
                Some(jong) => (3, jong),
                None => (2, 0),
            };
            let syllable = HANGUL_BASE + (cho * JUNG_COUNT + jung) * JONG_COUNT + jong;
            let syllable = char::from_u32(syllable).expect("valid Hangul code point");
            chars.splice(i - 1..i - 1 + replaced, Some(syllable));
            i -= 1;
            composed_from = i;
        }
        if i == 0 {
            break;
        }
        i -= 1;
    }
    chars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::{hangul_to_jaso, jaso_to_hangul, SYLLABLE_TERMINATOR};

    #[test]
    fn decomposes_with_terminators() {
        assert_eq!(hangul_to_jaso("대한"), "ㄷㅐᴥㅎㅏㄴᴥ");
        assert_eq!(hangul_to_jaso("가"), "ㄱㅏᴥ");
        assert_eq!(hangul_to_jaso("힣"), "ㅎㅣㅎᴥ");
    }

    #[test]
    fn passes_non_hangul_through() {
        assert_eq!(hangul_to_jaso("abc 123"), "abc 123");
        assert_eq!(hangul_to_jaso("한a글"), "ㅎㅏㄴᴥaㄱㅡㄹᴥ");
    }

    #[test]
    fn decomposition_is_idempotent() {
        let once = hangul_to_jaso("이명박은 대통령이다.");
        let twice = hangul_to_jaso(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn recomposes_simple_syllables() {
        let jaso = hangul_to_jaso("대한민국").replace(SYLLABLE_TERMINATOR, "");
        assert_eq!(jaso_to_hangul(&jaso), "대한민국");
    }

    #[test]
    fn recomposes_compound_finals_and_vowels() {
        for word in &["닭", "값", "과자", "의사", "얹다"] {
            let jaso = hangul_to_jaso(word).replace(SYLLABLE_TERMINATOR, "");
            assert_eq!(&jaso_to_hangul(&jaso), word, "failed on {}", word);
        }
    }
}

//! Tokenization shared by indexing and querying.
//!
//! The same tokenizer instance must be used on both sides, otherwise query
//! terms silently stop matching postings.

use unicode_segmentation::UnicodeSegmentation;

/// Turns free text into a sequence of index terms.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Default tokenizer.
///
/// Splits on Unicode word boundaries (whitespace and punctuation), lowercases
/// each word, and breaks runs of CJK characters into single-character unigrams
/// so that scripts without word separators still produce matchable terms.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTokenizer;

impl Tokenizer for DefaultTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        for word in text.unicode_words() {
            let mut run = String::new();
            for ch in word.chars() {
                if is_cjk(ch) {
                    if !run.is_empty() {
                        tokens.push(std::mem::take(&mut run));
                    }
                    tokens.push(ch.to_string());
                } else {
                    run.extend(ch.to_lowercase());
                }
            }
            if !run.is_empty() {
                tokens.push(run);
            }
        }
        tokens
    }
}

/// CJK ideographs, kana and hangul syllables.
pub fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x3040..=0x30FF      // hiragana, katakana
        | 0x3400..=0x4DBF    // CJK extension A
        | 0x4E00..=0x9FFF    // CJK unified ideographs
        | 0xAC00..=0xD7AF    // hangul syllables
        | 0xF900..=0xFAFF    // compatibility ideographs
        | 0x20000..=0x2FA1F  // extensions B-F, compatibility supplement
    )
}

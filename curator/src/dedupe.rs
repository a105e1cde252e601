//! Lexical near-duplicate removal for selected headlines.
//!
//! Titles are reduced to token sets and compared pairwise with the Jaccard
//! index. The pass is quadratic in the number of selected items, which the
//! consensus step keeps small; no attempt is made to go sub-quadratic.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::candidate::Candidate;

pub const DEFAULT_THRESHOLD: f64 = 0.6;

/// English and Bangla function words plus news filler that says nothing about the story
static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // English
        "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her",
        "was", "one", "our", "out", "has", "have", "his", "how", "its", "may", "new", "now",
        "old", "see", "two", "who", "did", "get", "let", "say", "she", "too", "use", "with",
        "from", "this", "that", "they", "will", "what", "when", "where", "which", "while",
        "into", "over", "than", "then", "them", "their", "there", "these", "those", "been",
        "were", "after", "before", "about", "amid", "says", "said", "more", "most", "also",
        "just", "some", "such", "only", "own", "same", "very", "would", "could", "should",
        "per", "cent", "percent", "today",
        // Bangla
        "এবং", "থেকে", "জন্য", "করে", "করা", "হবে", "হয়", "হয়েছে", "বলেন", "এই", "সেই",
        "তার", "তাদের", "আর", "কিন্তু", "নিয়ে", "দিয়ে", "পর্যন্ত", "মধ্যে", "সঙ্গে",
        "সাথে", "বিষয়ে", "শতাংশ", "আজ",
    ]
    .into_iter()
    .collect()
});

/// Lowercase title tokens longer than two characters, minus stop words.
pub fn title_tokens(title: &str) -> HashSet<String> {
    title
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || ('\u{0980}'..='\u{09FF}').contains(&c)))
        .filter(|t| t.chars().count() > 2)
        .filter(|t| !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Jaccard index of two token sets; 0 when either is empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Drop near-duplicates, keeping the item with the longer description
/// (the earlier item on a tie). Input order is preserved.
pub fn dedupe<T: AsRef<Candidate>>(items: Vec<T>, threshold: f64) -> Vec<T> {
    let tokens: Vec<HashSet<String>> = items
        .iter()
        .map(|item| title_tokens(&item.as_ref().title))
        .collect();
    let lengths: Vec<usize> = items
        .iter()
        .map(|item| item.as_ref().description.chars().count())
        .collect();
    let mut keep = vec![true; items.len()];

    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            if !keep[i] || !keep[j] {
                continue;
            }
            let similarity = jaccard(&tokens[i], &tokens[j]);
            if similarity < threshold {
                continue;
            }
            let drop = if lengths[j] > lengths[i] { i } else { j };
            debug!(
                kept = items[if drop == i { j } else { i }].as_ref().id,
                dropped = items[drop].as_ref().id,
                similarity,
                "dropping near-duplicate headline"
            );
            keep[drop] = false;
        }
    }

    items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, kept)| kept.then_some(item))
        .collect()
}

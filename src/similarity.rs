//! # String Similarity
//!
//! Edit-distance helpers shared by diagnosis canonicalization and duplicate
//! detection on treatment text.

/// Calculate Levenshtein distance between two strings, counted in chars
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    let len1 = s1_chars.len();
    let len2 = s2_chars.len();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    // Two rolling rows instead of the full matrix
    let mut previous: Vec<usize> = (0..=len2).collect();
    let mut current = vec![0; len2 + 1];

    for i in 1..=len1 {
        current[0] = i;
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] {
                0
            } else {
                1
            };

            current[j] = (previous[j] + 1)
                .min(current[j - 1] + 1)
                .min(previous[j - 1] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[len2]
}

/// Lowercase, turn punctuation into spaces and collapse whitespace.
///
/// `"Artemether-Lumefantrine"` and `"artemether  lumefantrine"` normalize alike.
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity in `[0, 1]`: `1 - distance / longest length` over normalized text.
///
/// Two empty strings are identical (1.0).
pub fn normalized_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_text(a);
    let b = normalize_text(b);
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    let distance = levenshtein_distance(&a, &b);
    1.0 - distance as f64 / longest as f64
}

/// Find the closest candidate within `max_distance`, comparing case-insensitively.
///
/// Ties on distance go to the alphabetically first candidate so results do not
/// depend on dictionary iteration order.
pub fn find_best_match<'a, I>(word: &str, candidates: I, max_distance: usize) -> Option<(&'a str, usize)>
where
    I: IntoIterator<Item = &'a str>,
{
    let word_lower = word.to_lowercase();
    let mut best: Option<(&'a str, usize)> = None;

    for candidate in candidates {
        let distance = levenshtein_distance(&word_lower, &candidate.to_lowercase());
        if distance > max_distance {
            continue;
        }
        best = match best {
            Some((current, current_distance))
                if current_distance < distance
                    || (current_distance == distance && current <= candidate) =>
            {
                Some((current, current_distance))
            }
            _ => Some((candidate, distance)),
        };
    }

    best
}

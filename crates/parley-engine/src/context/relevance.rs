use std::collections::HashSet;

use parley_core::tools::ToolDefinition;

const MENTION_SCORE: u32 = 100;
const NAME_HIT_SCORE: u32 = 3;
const DESCRIPTION_HIT_SCORE: u32 = 1;
const MIN_KEYWORD_LEN: usize = 3;

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= MIN_KEYWORD_LEN)
        .map(|w| w.to_lowercase())
        .collect()
}

fn score(tool: &ToolDefinition, words: &HashSet<String>, mentioned: &HashSet<&str>) -> u32 {
    let mut total = 0;
    if mentioned.contains(tool.name.as_str()) {
        total += MENTION_SCORE;
    }
    let name = tool.name.to_lowercase();
    let description = tool.description.to_lowercase();
    for word in words {
        if name.contains(word.as_str()) {
            total += NAME_HIT_SCORE;
        }
        if description.contains(word.as_str()) {
            total += DESCRIPTION_HIT_SCORE;
        }
    }
    total
}

/// Keep at most `max` tools, preferring mentioned tools and keyword matches.
///
/// When the candidates already fit, nothing is dropped. Otherwise tools with
/// a zero score go first, and ties keep registry order.
pub fn narrow_tools(
    candidates: Vec<ToolDefinition>,
    message: &str,
    mentioned: &[String],
    max: usize,
) -> Vec<ToolDefinition> {
    if candidates.len() <= max {
        return candidates;
    }
    let words = keywords(message);
    let mentioned: HashSet<&str> = mentioned.iter().map(String::as_str).collect();

    let mut scored: Vec<(usize, u32, ToolDefinition)> = candidates
        .into_iter()
        .enumerate()
        .map(|(i, t)| {
            let s = score(&t, &words, &mentioned);
            (i, s, t)
        })
        .filter(|(_, s, _)| *s > 0)
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(max);
    // Restore registry order for a stable payload.
    scored.sort_by_key(|(i, _, _)| *i);
    scored.into_iter().map(|(_, _, t)| t).collect()
}

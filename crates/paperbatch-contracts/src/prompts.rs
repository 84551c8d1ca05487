use anyhow::bail;

/// Strips a leading run of enumeration markers (digits, dots, dashes,
/// asterisks, whitespace). Idempotent: stripping an already-stripped line is
/// a no-op.
pub fn strip_enumeration(line: &str) -> &str {
    line.trim_start_matches(|c: char| {
        c.is_ascii_digit() || matches!(c, '.' | '-' | '*') || c.is_whitespace()
    })
}

/// Splits a raw model response into cleaned prompt lines, in order. Lines that
/// are empty after stripping are discarded.
pub fn clean_prompt_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .map(strip_enumeration)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pads a short list to exactly `count` entries by cyclic repetition from a
/// frozen snapshot of the cleaned list, indexed modulo its original length,
/// then truncates. A single-element list repeats that element. An empty list
/// is a hard error rather than a modulo-by-zero.
pub fn pad_to_count(cleaned: Vec<String>, count: usize) -> anyhow::Result<Vec<String>> {
    if cleaned.is_empty() {
        bail!("prompt model returned no usable lines");
    }
    let original_len = cleaned.len();
    let snapshot = cleaned.clone();
    let mut out = cleaned;
    while out.len() < count {
        out.push(snapshot[out.len() % original_len].clone());
    }
    out.truncate(count);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripping_removes_numbering_and_bullets() {
        assert_eq!(strip_enumeration("1. Aged parchment"), "Aged parchment");
        assert_eq!(strip_enumeration("12) torn paper"), ") torn paper");
        assert_eq!(strip_enumeration("- collage sheet"), "collage sheet");
        assert_eq!(strip_enumeration("* lace macro"), "lace macro");
        assert_eq!(strip_enumeration("  3 - 4. stamps"), "stamps");
    }

    #[test]
    fn stripping_is_idempotent() {
        let once = strip_enumeration("12. - * Vintage herbarium page");
        assert_eq!(strip_enumeration(once), once);
    }

    #[test]
    fn clean_drops_lines_that_become_empty() {
        let raw = "1.\n2. Faded botanical print\n\n---\n3. Coffee-stained ledger";
        assert_eq!(
            clean_prompt_lines(raw),
            vec![
                "Faded botanical print".to_string(),
                "Coffee-stained ledger".to_string(),
            ]
        );
    }

    #[test]
    fn pad_returns_exactly_count_for_short_lists() -> anyhow::Result<()> {
        let cleaned = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let padded = pad_to_count(cleaned, 7)?;
        assert_eq!(padded, vec!["a", "b", "c", "a", "b", "c", "a"]);
        Ok(())
    }

    #[test]
    fn pad_is_a_noop_when_length_already_matches() -> anyhow::Result<()> {
        let cleaned = vec!["a".to_string(), "b".to_string()];
        assert_eq!(pad_to_count(cleaned.clone(), 2)?, cleaned);
        Ok(())
    }

    #[test]
    fn pad_truncates_long_lists() -> anyhow::Result<()> {
        let cleaned: Vec<String> = (0..12).map(|i| format!("prompt {i}")).collect();
        let padded = pad_to_count(cleaned, 10)?;
        assert_eq!(padded.len(), 10);
        assert_eq!(padded[9], "prompt 9");
        Ok(())
    }

    #[test]
    fn single_element_list_repeats_that_element() -> anyhow::Result<()> {
        let padded = pad_to_count(vec!["only".to_string()], 4)?;
        assert_eq!(padded, vec!["only", "only", "only", "only"]);
        Ok(())
    }

    #[test]
    fn empty_list_is_an_error_not_a_panic() {
        let err = pad_to_count(Vec::new(), 5).unwrap_err();
        assert!(err.to_string().contains("no usable lines"));
    }

    #[test]
    fn numbered_response_yields_exactly_requested_count() -> anyhow::Result<()> {
        let raw = (1..=12)
            .map(|i| format!("{i}. Weathered pirate chart variant {i}, sepia ink on parchment."))
            .collect::<Vec<_>>()
            .join("\n");
        let prompts = pad_to_count(clean_prompt_lines(&raw), 10)?;
        assert_eq!(prompts.len(), 10);
        assert!(prompts.iter().all(|p| p.starts_with("Weathered")));
        Ok(())
    }
}

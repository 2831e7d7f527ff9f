//! Region-name normalization.
//!
//! Every raw source spells region names its own way: statistical-office
//! tables prefix a numeric region code ("01 Stockholm county"), zonal
//! summaries lose diacritics ("Vasterbotten"), and so on. Normalization is a
//! deterministic two-stage mapping: a fixed lookup table of known spelling
//! variants first, then the textual cleanup rules, in that order. Applying it
//! twice is a no-op, which is what makes cross-source joins trustworthy.

use std::collections::HashMap;

/// Immutable lookup of alternate/misspelled region names to canonical ones.
/// Built once from configuration at process start; no ambient global state.
#[derive(Debug, Clone, Default)]
pub struct NameLookup {
    canonical: HashMap<String, String>,
}

impl NameLookup {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            canonical: entries.into_iter().collect(),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.canonical.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

/// Canonicalizes a raw region name.
///
/// Order is fixed: lookup-table substitution, then cleanup rules (strip a
/// leading numeric code, strip a trailing "county" word, collapse interior
/// whitespace). The lookup is consulted again after cleanup so that entries
/// keyed on the cleaned spelling also resolve.
pub fn normalize_region(raw: &str, lookup: &NameLookup) -> String {
    let trimmed = raw.trim();
    let substituted = lookup.resolve(trimmed).unwrap_or(trimmed);
    let cleaned = cleanup(substituted);
    match lookup.resolve(&cleaned) {
        Some(canonical) => canonical.to_string(),
        None => cleaned,
    }
}

fn cleanup(name: &str) -> String {
    let stripped = strip_leading_code(name);
    let stripped = strip_county_suffix(stripped);
    // Collapse runs of whitespace so "Vastra  Gotaland" and "Vastra Gotaland"
    // normalize identically.
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Removes a leading numeric region code and the whitespace after it
/// ("01 Stockholm" -> "Stockholm").
fn strip_leading_code(name: &str) -> &str {
    let rest = name.trim_start_matches(|c: char| c.is_ascii_digit());
    if rest.len() == name.len() {
        return name;
    }
    // Only treat the digits as a code when whitespace follows; "08forsen"
    // would be a genuinely odd name, not a coded one.
    if rest.starts_with(char::is_whitespace) {
        rest.trim_start()
    } else {
        name
    }
}

/// Removes a trailing "county" word, case-insensitively
/// ("Stockholm county" -> "Stockholm").
fn strip_county_suffix(name: &str) -> &str {
    let trimmed = name.trim_end();
    let lower = trimmed.to_ascii_lowercase();
    if let Some(prefix_len) = lower.strip_suffix("county").map(|p| p.len()) {
        let prefix = &trimmed[..prefix_len];
        if prefix.ends_with(char::is_whitespace) {
            return prefix.trim_end();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup() -> NameLookup {
        NameLookup::new(vec![
            ("Orebro".to_string(), "Örebro".to_string()),
            ("Vastra Gotaland".to_string(), "Västra Götaland".to_string()),
        ])
    }

    #[test]
    fn strips_leading_code_and_county_suffix() {
        let lk = NameLookup::default();
        assert_eq!(normalize_region("01 Stockholm county", &lk), "Stockholm");
        assert_eq!(normalize_region("25 Norrbotten County", &lk), "Norrbotten");
        assert_eq!(normalize_region("  Uppsala  ", &lk), "Uppsala");
    }

    #[test]
    fn lookup_applies_before_and_after_cleanup() {
        let lk = lookup();
        // Keyed on the raw spelling.
        assert_eq!(normalize_region("Orebro", &lk), "Örebro");
        // Keyed on the cleaned spelling: cleanup runs first, then lookup.
        assert_eq!(normalize_region("14 Vastra Gotaland county", &lk), "Västra Götaland");
    }

    #[test]
    fn does_not_eat_names_that_merely_contain_digits_or_county() {
        let lk = NameLookup::default();
        // No whitespace after the digits: not a region code.
        assert_eq!(normalize_region("08forsen", &lk), "08forsen");
        // "county" must be a standalone trailing word.
        assert_eq!(normalize_region("Viscounty", &lk), "Viscounty");
    }

    #[test]
    fn normalization_is_idempotent() {
        let lk = lookup();
        for raw in [
            "01 Stockholm county",
            "Orebro",
            "14 Vastra Gotaland county",
            "Gotland",
            "  Skåne county ",
            "08forsen",
        ] {
            let once = normalize_region(raw, &lk);
            let twice = normalize_region(&once, &lk);
            assert_eq!(once, twice, "normalize not idempotent for {raw:?}");
        }
    }
}

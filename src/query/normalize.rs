//! Accent-insensitive search patterns.

const CLASSES: &[(&str, &str)] = &[
    ("aáàâãä", "[aáàâãäAÁÀÂÃÄ]"),
    ("eéèêë", "[eéèêëEÉÈÊË]"),
    ("iíìîï", "[iíìîïIÍÌÎÏ]"),
    ("oóòôõö", "[oóòôõöOÓÒÔÕÖ]"),
    ("uúùûü", "[uúùûüUÚÙÛÜ]"),
    ("cç", "[cçCÇ]"),
    ("nñ", "[nñNÑ]"),
];

const METACHARACTERS: &str = ".*+?^${}()|[]\\";

/// Escape regex metacharacters in `text`, then widen vowels, `c` and `n` (accented or not,
/// either case) into character classes. Other letters still need a case-insensitive match.
/// e.g. "José" -> "j[oóòôõöOÓÒÔÕÖ]s[eéèêëEÉÈÊË]", "a.b" -> "[aáàâãäAÁÀÂÃÄ]\.b"
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 4);
    for c in text.chars() {
        if METACHARACTERS.contains(c) {
            out.push('\\');
            out.push(c);
            continue;
        }
        let lower = c.to_lowercase().next().unwrap_or(c);
        match CLASSES.iter().find(|(members, _)| members.contains(lower)) {
            Some((_, class)) => out.push_str(class),
            None => out.push(c),
        }
    }
    out
}

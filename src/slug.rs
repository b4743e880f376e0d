//! Slugs for tables and fields, and the identifier form scripts use to name them.

/// Latin letter without its diacritic, for the accents admins commonly type.
fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

/// Text with the diacritics `fold_diacritic` knows removed, case preserved.
pub fn strip_diacritics(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_uppercase() {
                let lower = c.to_lowercase().next().unwrap_or(c);
                let folded = fold_diacritic(lower);
                if folded == lower { c } else { folded.to_ascii_uppercase() }
            } else {
                fold_diacritic(c)
            }
        })
        .collect()
}

/// Derive a slug from a human-entered name.
/// e.g. "Data de Início" -> "data-de-inicio", "  Preço (R$) " -> "preco-r"
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars().flat_map(char::to_lowercase) {
        let c = fold_diacritic(c);
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Identifier form of a slug: hyphens become underscores.
/// e.g. "data-de-inicio" -> "data_de_inicio"
pub fn to_identifier(slug: &str) -> String {
    slug.replace('-', "_")
}

/// Script variable bound to a field: `<table>_<field>` in identifier form.
pub fn field_variable(table_slug: &str, field_slug: &str) -> String {
    format!("{}_{}", to_identifier(table_slug), to_identifier(field_slug))
}

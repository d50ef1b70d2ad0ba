//! `${NAME}` substitution for the bundled resource files.

/// Replace every `${NAME}` in `template` with its value.
///
/// Placeholders without a value are left as they are.
#[must_use]
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_owned(), |text, (name, value)| {
        text.replace(&format!("${{{name}}}"), value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_every_occurrence() {
        assert_eq!(
            render("${A}-${B}-${A}", &[("A", "1"), ("B", "2")]),
            "1-2-1"
        );
    }

    #[test]
    fn unknown_placeholders_survive() {
        assert_eq!(render("${A} ${C}", &[("A", "x")]), "x ${C}");
    }
}

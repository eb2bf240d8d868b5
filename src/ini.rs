//! Assembly of the engine configuration file.

use std::sync::OnceLock;

use regex::Regex;

use crate::deps::{file_name, LoadDirective};

static INDENT: OnceLock<Regex> = OnceLock::new();

fn indent_regex() -> &'static Regex {
    INDENT.get_or_init(|| Regex::new(r"\n\s+").expect("indentation regex is valid"))
}

/// The `extension=` line loading one resolved library.
#[must_use]
pub fn extension_line(directive: &LoadDirective) -> String {
    match directive {
        LoadDirective::Path(lib) | LoadDirective::Url(lib) => format!("extension={lib}"),
        LoadDirective::Ini { url } => format!("extension={}", file_name(url)),
    }
}

/// Strips leading indentation from every line after the first.
///
/// A newline followed by any whitespace, including further newlines,
/// collapses to a single newline.
#[must_use]
pub fn strip_indentation(text: &str) -> String {
    indent_regex().replace_all(text, "\n").into_owned()
}

/// Extension lines for `libs`, then the caller's text, newline-terminated.
#[must_use]
pub fn assemble_config(libs: &[LoadDirective], caller_ini: Option<&str>) -> String {
    let mut lines: Vec<String> = libs.iter().map(extension_line).collect();
    if let Some(ini) = caller_ini {
        lines.push(strip_indentation(ini));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_lines_per_directive_kind() {
        assert_eq!(extension_line(&LoadDirective::Path("libzip.so".into())), "extension=libzip.so");
        assert_eq!(
            extension_line(&LoadDirective::Url("https://cdn/a/libxml.so".into())),
            "extension=https://cdn/a/libxml.so"
        );
        assert_eq!(
            extension_line(&LoadDirective::Ini {
                url: "https://cdn/a/intl.so".into()
            }),
            "extension=intl.so"
        );
    }

    #[test]
    fn caller_text_is_dedented_and_appended_last() {
        let libs = vec![LoadDirective::Path("libzip.so".into())];
        let ini = "date.timezone=UTC\n        memory_limit=64M\n\n    display_errors=0";
        let config = assemble_config(&libs, Some(ini));
        assert_eq!(
            config,
            "extension=libzip.so\ndate.timezone=UTC\nmemory_limit=64M\ndisplay_errors=0\n"
        );
    }

    #[test]
    fn empty_config_is_single_newline() {
        assert_eq!(assemble_config(&[], None), "\n");
    }
}

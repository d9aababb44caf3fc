//! User-facing messages in English and Chinese.

use std::fs;
use std::path::Path;
use std::process::ExitCode;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    English,
    Chinese,
}

impl Language {
    /// Select the language from `language.txt` in the working directory.
    pub fn detect() -> Self {
        Self::detect_in(Path::new("."))
    }

    pub fn detect_in(dir: &Path) -> Self {
        match fs::read_to_string(dir.join("language.txt")) {
            Ok(content) if content.contains("Chinese") => Language::Chinese,
            _ => Language::English,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKey {
    Usage,
    FileNotFound,
    InternalError,
    RuntimeError,
    TypeError,
    ImportError,
    SyntaxError,
    UndefinedIdentifier,
    True,
    False,
}

fn template(lang: Language, key: MessageKey) -> &'static str {
    use MessageKey::*;
    match lang {
        Language::English => match key {
            Usage => "Usage: steve <filename>",
            FileNotFound => "Error: File not found",
            InternalError => "Internal Error: {0}",
            RuntimeError => "Runtime Error: {0}",
            TypeError => "Type Error: {0}",
            ImportError => "Import Error: {0}",
            SyntaxError => "Syntax Error: {0}",
            UndefinedIdentifier => "Undefined identifier: {0}",
            True => "true",
            False => "false",
        },
        Language::Chinese => match key {
            Usage => "用法: steve <文件名>",
            FileNotFound => "错误: 找不到文件",
            InternalError => "内部错误: {0}",
            RuntimeError => "运行时错误: {0}",
            TypeError => "类型错误: {0}",
            ImportError => "导入错误: {0}",
            SyntaxError => "语法错误: {0}",
            UndefinedIdentifier => "未定义的标识符: {0}",
            True => "真",
            False => "假",
        },
    }
}

/// Look up a message, substituting the first `{0}` with `arg` when `arg` is
/// non-empty.
pub fn localize(lang: Language, key: MessageKey, arg: &str) -> String {
    let text = template(lang, key);
    if arg.is_empty() {
        text.to_string()
    } else {
        text.replacen("{0}", arg, 1)
    }
}

/// Print a localized error to stderr. Fatal errors yield a failing exit code
/// for the caller to return.
pub fn report_error(lang: Language, key: MessageKey, arg: &str, fatal: bool) -> Option<ExitCode> {
    eprintln!("{}", localize(lang, key, arg));
    fatal.then_some(ExitCode::FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localize_substitutes_once() {
        assert_eq!(
            localize(Language::English, MessageKey::InternalError, "boom"),
            "Internal Error: boom"
        );
        assert_eq!(
            localize(Language::English, MessageKey::InternalError, ""),
            "Internal Error: {0}"
        );
        assert_eq!(localize(Language::Chinese, MessageKey::TypeError, "x"), "类型错误: x");
    }

    #[test]
    fn test_usage() {
        assert_eq!(
            localize(Language::English, MessageKey::Usage, ""),
            "Usage: steve <filename>"
        );
    }

    #[test]
    fn test_detect() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Language::detect_in(dir.path()), Language::English);
        std::fs::write(dir.path().join("language.txt"), "Chinese\n").unwrap();
        assert_eq!(Language::detect_in(dir.path()), Language::Chinese);
    }

    #[test]
    fn test_report_error_fatality() {
        assert!(report_error(Language::English, MessageKey::SyntaxError, "x", false).is_none());
        assert!(report_error(Language::English, MessageKey::SyntaxError, "x", true).is_some());
    }
}

//! Language table: runtime descriptors and run-command builders
//!
//! Dispatch is a tagged variant plus a small table, not string matching
//! scattered through the pipeline. The command builders produce a single
//! `/bin/sh -c` invocation with every interpolated filename single-quoted,
//! so no inner quote can terminate the command.

use crate::submission::FileEntry;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Supported target languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// CPython
    Python,
    /// Node.js
    Javascript,
    /// C, compiled whole-directory with the system C compiler
    C,
    /// C++, compiled whole-directory with the system C++ compiler
    Cpp,
    /// Java, javac + small-heap serial-GC JVM
    Java,
    /// SQL script fed to the bundled relational client
    Sql,
}

/// Password the database runtime is provisioned with
const SQL_ROOT_PASSWORD: &str = "coderunner";

/// Which per-container resource class a runtime draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    /// The default memory/CPU caps
    Default,
    /// The larger caps reserved for database-like runtimes
    Database,
}

/// Static description of one language runtime
#[derive(Debug, Clone)]
pub struct RuntimeDescriptor {
    /// The language this descriptor serves
    pub language: Language,
    /// Container image the pool creates for this language
    pub image: &'static str,
    /// Resource class, resolved against `ResourceConfig` by the pool
    pub resource_class: ResourceClass,
    /// Exec timeout override in milliseconds; `None` uses the configured
    /// fallback
    pub exec_timeout_ms: Option<u64>,
    /// Readiness probe for images whose startup is external (databases);
    /// the pool polls this until it exits zero
    pub health_check: Option<&'static [&'static str]>,
    /// Environment injected at container creation
    pub env: &'static [&'static str],
}

static DESCRIPTORS: &[RuntimeDescriptor] = &[
    RuntimeDescriptor {
        language: Language::Python,
        image: "python:3.11-slim",
        resource_class: ResourceClass::Default,
        exec_timeout_ms: None,
        health_check: None,
        env: &[],
    },
    RuntimeDescriptor {
        language: Language::Javascript,
        image: "node:20-slim",
        resource_class: ResourceClass::Default,
        exec_timeout_ms: None,
        health_check: None,
        env: &[],
    },
    RuntimeDescriptor {
        language: Language::C,
        image: "gcc:13",
        resource_class: ResourceClass::Default,
        exec_timeout_ms: Some(60_000),
        health_check: None,
        env: &[],
    },
    RuntimeDescriptor {
        language: Language::Cpp,
        image: "gcc:13",
        resource_class: ResourceClass::Default,
        exec_timeout_ms: Some(60_000),
        health_check: None,
        env: &[],
    },
    RuntimeDescriptor {
        language: Language::Java,
        image: "eclipse-temurin:21-jdk",
        resource_class: ResourceClass::Default,
        exec_timeout_ms: Some(60_000),
        health_check: None,
        env: &[],
    },
    RuntimeDescriptor {
        language: Language::Sql,
        image: "mysql:8.0",
        resource_class: ResourceClass::Database,
        exec_timeout_ms: Some(60_000),
        health_check: Some(&[
            "mysqladmin",
            "ping",
            "-h",
            "127.0.0.1",
            "-uroot",
            "-pcoderunner",
            "--silent",
        ]),
        env: &["MYSQL_ROOT_PASSWORD=coderunner"],
    },
];

/// Extensions treated as C++ sources
const CPP_SOURCE_EXTS: &[&str] = &[".cpp", ".cc", ".cxx", ".c++"];

/// Files kept in a C compile set
const C_KEEP_EXTS: &[&str] = &[".c", ".h"];

/// Files kept in a C++ compile set
const CPP_KEEP_EXTS: &[&str] = &[".cpp", ".cc", ".cxx", ".c++", ".hpp", ".h"];

impl Language {
    /// Parse the wire spelling. `c`, `cpp` and `c++` are all accepted for
    /// the C family; the entry extension settles the dialect later.
    pub fn parse(s: &str) -> Result<Language> {
        match s {
            "python" => Ok(Language::Python),
            "javascript" => Ok(Language::Javascript),
            "c" => Ok(Language::C),
            "cpp" | "c++" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            "sql" => Ok(Language::Sql),
            other => Err(Error::Validation(format!("unknown language '{}'", other))),
        }
    }

    /// Canonical lowercase name, used as a metrics key
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Sql => "sql",
        }
    }

    /// Runtime descriptor for this language
    pub fn descriptor(&self) -> &'static RuntimeDescriptor {
        DESCRIPTORS
            .iter()
            .find(|d| d.language == *self)
            .expect("descriptor table covers every language")
    }

    /// Every known descriptor (startup image preflight)
    pub fn all_descriptors() -> &'static [RuntimeDescriptor] {
        DESCRIPTORS
    }
}

/// Quote a string for interpolation into a `/bin/sh -c` command so that no
/// inner single quote can terminate it.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn has_ext(path: &str, exts: &[&str]) -> bool {
    let lower = path.to_ascii_lowercase();
    exts.iter().any(|ext| lower.ends_with(ext))
}

/// Determine the entry file of a submission.
///
/// Most languages require exactly one file carrying the entry marker. SQL
/// falls back to the first `.sql` file; the C family may omit the entry
/// entirely because compilation is whole-directory.
pub fn resolve_entry<'a>(
    language: Language,
    files: &'a [FileEntry],
) -> Result<Option<&'a FileEntry>> {
    let mut marked = files.iter().filter(|f| f.to_be_exec);
    let first = marked.next();
    if marked.next().is_some() {
        return Err(Error::Validation(
            "more than one file is marked as the entry".to_string(),
        ));
    }
    if let Some(entry) = first {
        return Ok(Some(entry));
    }

    match language {
        Language::Sql => files
            .iter()
            .find(|f| has_ext(&f.path, &[".sql"]))
            .map(Some)
            .ok_or_else(|| Error::Validation("no .sql file in submission".to_string())),
        Language::C | Language::Cpp => Ok(None),
        _ => Err(Error::Validation(format!(
            "no entry file marked for {}",
            language.as_str()
        ))),
    }
}

/// Settle the C/C++ dialect from the entry extension, when there is one.
pub fn effective_language(language: Language, entry: Option<&FileEntry>) -> Language {
    if !matches!(language, Language::C | Language::Cpp) {
        return language;
    }
    match entry {
        Some(e) if has_ext(&e.path, &[".c"]) => Language::C,
        Some(e) if has_ext(&e.path, CPP_SOURCE_EXTS) => Language::Cpp,
        _ => language,
    }
}

/// For the C family, restrict the file set to one dialect's extensions so
/// the other dialect's objects never reach the linker. Other languages keep
/// the full set.
pub fn filter_sources(language: Language, files: &[FileEntry]) -> Vec<FileEntry> {
    let keep: &[&str] = match language {
        Language::C => C_KEEP_EXTS,
        Language::Cpp => CPP_KEEP_EXTS,
        _ => return files.to_vec(),
    };
    files
        .iter()
        .filter(|f| has_ext(&f.path, keep))
        .cloned()
        .collect()
}

/// Build the in-container run command for one submission. Returns the argv
/// handed to the interactive exec (`/bin/sh -c <script>`), with every
/// filename quoted.
pub fn build_command(
    language: Language,
    entry: Option<&FileEntry>,
    files: &[FileEntry],
) -> Result<Vec<String>> {
    let script = match language {
        Language::Python => {
            let entry = required_entry(language, entry)?;
            format!("python -u {}", shell_quote(&entry.path))
        }
        Language::Javascript => {
            let entry = required_entry(language, entry)?;
            format!("node {}", shell_quote(&entry.path))
        }
        Language::C => {
            let sources = quoted_sources(files, &[".c"])?;
            format!("cc {} -o ./app && ./app", sources)
        }
        Language::Cpp => {
            let sources = quoted_sources(files, CPP_SOURCE_EXTS)?;
            format!("c++ {} -o ./app && ./app", sources)
        }
        Language::Java => {
            let entry = required_entry(language, entry)?;
            let sources = quoted_sources(files, &[".java"])?;
            let stem = entry
                .path
                .rsplit('/')
                .next()
                .unwrap_or(&entry.path)
                .trim_end_matches(".java");
            format!(
                "javac {} -d . && java -XX:+UseSerialGC -Xmx128m -Xss512k {}",
                sources,
                shell_quote(stem)
            )
        }
        Language::Sql => {
            let entry = required_entry(language, entry)?;
            format!(
                "mysql -uroot -p{} < {}",
                shell_quote(SQL_ROOT_PASSWORD),
                shell_quote(&entry.path)
            )
        }
    };

    Ok(vec!["/bin/sh".to_string(), "-c".to_string(), script])
}

fn required_entry<'a>(language: Language, entry: Option<&'a FileEntry>) -> Result<&'a FileEntry> {
    entry.ok_or_else(|| {
        Error::Validation(format!("no entry file for {}", language.as_str()))
    })
}

fn quoted_sources(files: &[FileEntry], exts: &[&str]) -> Result<String> {
    let quoted: Vec<String> = files
        .iter()
        .filter(|f| has_ext(&f.path, exts))
        .map(|f| shell_quote(&f.path))
        .collect();
    if quoted.is_empty() {
        return Err(Error::Validation(format!(
            "no source files matching {:?}",
            exts
        )));
    }
    Ok(quoted.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, entry: bool) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            content: String::new(),
            to_be_exec: entry,
        }
    }

    #[test]
    fn test_parse_spellings() {
        assert_eq!(Language::parse("python").unwrap(), Language::Python);
        assert_eq!(Language::parse("c++").unwrap(), Language::Cpp);
        assert_eq!(Language::parse("cpp").unwrap(), Language::Cpp);
        assert!(matches!(
            Language::parse("ruby"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_shell_quote_defuses_inner_quotes() {
        assert_eq!(shell_quote("main.py"), "'main.py'");
        assert_eq!(shell_quote("a'b.py"), r#"'a'\''b.py'"#);
    }

    #[test]
    fn test_python_command() {
        let files = vec![file("main.py", true)];
        let entry = resolve_entry(Language::Python, &files).unwrap();
        let cmd = build_command(Language::Python, entry, &files).unwrap();
        assert_eq!(cmd[0], "/bin/sh");
        assert_eq!(cmd[2], "python -u 'main.py'");
    }

    #[test]
    fn test_missing_entry_is_validation_error() {
        let files = vec![file("main.py", false)];
        assert!(matches!(
            resolve_entry(Language::Python, &files),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_double_entry_is_validation_error() {
        let files = vec![file("a.py", true), file("b.py", true)];
        assert!(matches!(
            resolve_entry(Language::Python, &files),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_sql_falls_back_to_first_sql_file() {
        let files = vec![file("readme.txt", false), file("query.sql", false)];
        let entry = resolve_entry(Language::Sql, &files).unwrap().unwrap();
        assert_eq!(entry.path, "query.sql");
    }

    #[test]
    fn test_c_family_entry_optional() {
        let files = vec![file("main.cpp", false), file("g.h", false)];
        assert!(resolve_entry(Language::Cpp, &files).unwrap().is_none());
    }

    #[test]
    fn test_dialect_settled_by_entry_extension() {
        let c_entry = file("main.c", true);
        assert_eq!(
            effective_language(Language::Cpp, Some(&c_entry)),
            Language::C
        );
        let cpp_entry = file("main.cc", true);
        assert_eq!(
            effective_language(Language::C, Some(&cpp_entry)),
            Language::Cpp
        );
        assert_eq!(effective_language(Language::Cpp, None), Language::Cpp);
    }

    #[test]
    fn test_cpp_filter_drops_c_sources() {
        let files = vec![
            file("main.cpp", false),
            file("legacy.c", false),
            file("g.h", false),
        ];
        let kept = filter_sources(Language::Cpp, &files);
        let paths: Vec<&str> = kept.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["main.cpp", "g.h"]);
    }

    #[test]
    fn test_cpp_command_compiles_all_sources() {
        let files = vec![
            file("main.cpp", false),
            file("g.h", false),
            file("g.cpp", false),
        ];
        let cmd = build_command(Language::Cpp, None, &files).unwrap();
        assert_eq!(cmd[2], "c++ 'main.cpp' 'g.cpp' -o ./app && ./app");
    }

    #[test]
    fn test_java_command_runs_entry_stem() {
        let files = vec![file("Main.java", true), file("Helper.java", false)];
        let entry = resolve_entry(Language::Java, &files).unwrap();
        let cmd = build_command(Language::Java, entry, &files).unwrap();
        assert!(cmd[2].starts_with("javac 'Main.java' 'Helper.java' -d ."));
        assert!(cmd[2].ends_with("java -XX:+UseSerialGC -Xmx128m -Xss512k 'Main'"));
    }

    #[test]
    fn test_sql_descriptor_is_database_class() {
        let desc = Language::Sql.descriptor();
        assert_eq!(desc.resource_class, ResourceClass::Database);
        assert!(desc.health_check.is_some());
    }
}

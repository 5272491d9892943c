//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async production code MUST NOT use blocking I/O. A blocked
//! worker thread stalls every SSE stream scheduled on it.
//! **Required**: `tokio::net`, `tokio::fs`, `tokio::process` inside async code.
//! **Acceptable**: blocking calls in plain `fn`s that run before the server
//! starts (configuration loading) and in test code.

use std::fs;
use std::path::Path;

use architectural_enforcement::production_dirs;

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let mut violations = Vec::new();
    let mut scanned = 0;
    for dir in production_dirs() {
        scanned += check_directory(&dir, &mut violations);
    }

    assert!(scanned > 0, "No production sources found to scan");

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n❌ FORBIDDEN blocking I/O:");
        eprintln!("  - std::fs::read(), std::fs::write(), std::fs::File");
        eprintln!("  - std::net::TcpStream, std::net::TcpListener");
        eprintln!("  - std::process::Command::output()");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::net::TcpListener::bind().await");
        eprintln!("  - tokio::fs::read().await");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn check_directory(path: &Path, violations: &mut Vec<String>) -> usize {
    if !path.exists() {
        return 0;
    }

    let mut scanned = 0;
    for entry in walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
            check_file(entry.path(), violations);
            scanned += 1;
        }
    }
    scanned
}

fn check_file(path: &Path, violations: &mut Vec<String>) {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return,
    };

    let lines: Vec<&str> = content.lines().collect();

    for (idx, line) in lines.iter().enumerate() {
        let line_number = idx + 1;

        // Skip comments
        let code_part = line.split("//").next().unwrap_or(line);

        if is_in_test_function(&lines, idx) || is_in_non_async_function(&lines, idx) {
            continue;
        }

        let kind = if code_part.contains("std::fs::") || code_part.contains("use std::fs") {
            Some("Blocking file I/O")
        } else if code_part.contains("std::net::") || code_part.contains("use std::net") {
            Some("Blocking network I/O")
        } else if code_part.contains("std::process::Command") {
            Some("Blocking process I/O")
        } else if code_part.contains("reqwest::blocking") {
            Some("Blocking HTTP client")
        } else {
            None
        };

        if let Some(kind) = kind {
            violations.push(format!(
                "{}:{} - {}: {}",
                path.display(),
                line_number,
                kind,
                line.trim()
            ));
        }
    }
}

/// Check if line is inside a test function
fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    let mut found_fn_idx = None;
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.starts_with("fn ") || line.contains(" fn ") {
            found_fn_idx = Some(i);
            break;
        }

        // Stop at module boundaries
        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }

    if let Some(fn_idx) = found_fn_idx {
        for i in (0..fn_idx).rev() {
            let line = lines[i].trim();

            if line.starts_with("#[test]")
                || line.starts_with("#[tokio::test")
                || line.starts_with("#[cfg(test)]")
            {
                return true;
            }

            if line.starts_with("fn ") || line.starts_with("mod ") || line.starts_with("impl ") {
                break;
            }
        }
    }

    false
}

/// Check if line is inside a non-async function (acceptable for blocking I/O)
fn is_in_non_async_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.contains("async fn ") || line.contains("async move") {
            return false;
        }

        if line.starts_with("fn ") || line.starts_with("pub fn ") {
            return true;
        }

        // Stop at module/impl boundaries
        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_function_is_not_exempt() {
        let test_code = vec![
            "async fn bind_listener() {",
            "    let listener = std::net::TcpListener::bind(addr)?;",
            "}",
        ];

        assert!(!is_in_non_async_function(&test_code, 1));
        assert!(!is_in_test_function(&test_code, 1));
    }

    #[test]
    fn test_config_loading_is_exempt() {
        let test_code = vec![
            "fn load_config_with_env<F>(path: Option<PathBuf>, env: F) {",
            "    let toml_content = std::fs::read_to_string(config_path)?;",
            "}",
        ];

        assert!(is_in_non_async_function(&test_code, 1));
    }

    #[test]
    fn test_test_function_detection() {
        let test_code = vec![
            "#[test]",
            "fn test_parse_valid_toml() {",
            "    let contents = std::fs::read_to_string(\"relay.toml\")?;",
            "}",
        ];

        assert!(is_in_test_function(&test_code, 2));
    }
}

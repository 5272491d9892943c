//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT sleep to wait for something to
//! happen. Sessions are event driven: observers wake on channel receives and
//! the sweeper runs on `tokio::time::interval`.
//!
//! **Exceptions**: producer pacing (the simulated producer's stand-in for
//! generation latency), periodic tasks built on `interval`, and test code.

use std::fs;
use std::path::Path;

use architectural_enforcement::workspace_root;

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let (violations, scanned) = find_sleep_violations();

    assert!(scanned > 0, "No production sources found to scan");

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Producer pacing (simulated generation latency)");
        eprintln!("  - Test code (#[test] or #[tokio::test] functions)");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");
        eprintln!("  - Sleep to 'wait' for chunks (use the observer channel!)");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Find all sleep() calls in production code; also returns files scanned
fn find_sleep_violations() -> (Vec<String>, usize) {
    let root = workspace_root();
    let mut violations = Vec::new();
    let mut scanned = 0;

    scanned += check_directory(
        &root.join("relay/core/src"),
        &mut violations,
        &SleepPolicy {
            allow_pacing: true,
            allow_tests: true,
        },
    );

    scanned += check_directory(
        &root.join("relay/daemon/src"),
        &mut violations,
        &SleepPolicy {
            allow_pacing: false,
            allow_tests: true,
        },
    );

    (violations, scanned)
}

struct SleepPolicy {
    allow_pacing: bool,
    allow_tests: bool,
}

fn check_directory(path: &Path, violations: &mut Vec<String>, policy: &SleepPolicy) -> usize {
    if !path.exists() {
        return 0;
    }

    let mut scanned = 0;
    for entry in walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
            check_file(entry.path(), violations, policy);
            scanned += 1;
        }
    }
    scanned
}

fn check_file(path: &Path, violations: &mut Vec<String>, policy: &SleepPolicy) {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return,
    };

    let lines: Vec<&str> = content.lines().collect();

    for (idx, line) in lines.iter().enumerate() {
        let line_number = idx + 1;

        // Skip comments
        let code_part = line.split("//").next().unwrap_or(line);

        if code_part.contains("::sleep(") || code_part.contains(".sleep(") {
            if policy.allow_tests && is_in_test_function(&lines, idx) {
                continue;
            }

            if policy.allow_pacing && is_pacing_context(&lines, idx) {
                continue;
            }

            if is_interval_pattern(&lines, idx) {
                continue;
            }

            violations.push(format!(
                "{}:{} - {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }
    }
}

/// Check if line is inside a test function
fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.starts_with("fn ") && !line.contains("test") {
            return false;
        }

        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }

        // Stop at module boundaries
        if line.starts_with("mod ") || line.starts_with("impl ") {
            return false;
        }
    }
    false
}

/// Check if sleep paces a producer (acceptable in the core only)
fn is_pacing_context(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(5)..std::cmp::min(current_idx + 2, lines.len());

    for i in context_range {
        if lines[i].to_lowercase().contains("pacing") {
            return true;
        }
    }
    false
}

/// Check if this is tokio::time::interval pattern (acceptable for periodic tasks)
fn is_interval_pattern(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(20)..current_idx;

    for i in context_range {
        let line = lines[i];
        if line.contains("interval.tick()")
            || line.contains("ticker.tick()")
            || line.contains("tokio::time::interval")
        {
            return true;
        }
    }

    let forward_range = current_idx..std::cmp::min(current_idx + 5, lines.len());
    for i in forward_range {
        let line = lines[i];
        if line.contains("interval.tick()") || line.contains("ticker.tick()") {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_outside_test_is_not_exempt() {
        let test_code = vec![
            "fn wait_for_observer() {",
            "    tokio::time::sleep(Duration::from_millis(10)).await;",
            "}",
        ];

        assert!(!is_in_test_function(&test_code, 1));
        assert!(!is_pacing_context(&test_code, 1));
        assert!(!is_interval_pattern(&test_code, 1));
    }

    #[test]
    fn test_pacing_detection() {
        let test_code = vec![
            "for word in words {",
            "    // Pacing stands in for generation latency",
            "    tokio::time::sleep(self.pacing).await;",
            "}",
        ];

        assert!(is_pacing_context(&test_code, 2));
    }

    #[test]
    fn test_tokio_test_detection() {
        let test_code = vec![
            "#[tokio::test(start_paused = true)]",
            "async fn test_sweeper_evicts_on_schedule() {",
            "    tokio::time::sleep(Duration::from_secs(61)).await;",
            "}",
        ];

        assert!(is_in_test_function(&test_code, 2));
    }
}

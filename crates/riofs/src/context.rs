//! Compaction of the executed-code log.
//!
//! `CONTEXT` readers want the shortest program that reproduces the current
//! session, not the full history of every fragment. Compaction is a pure
//! function of the append log plus the set of live bindings: identical
//! import lines collapse to their first occurrence, repeated assignments to
//! a top-level name keep only the latest, and statements whose only effect
//! was creating a widget that has since been destroyed are dropped. Any
//! failure falls back to the raw concatenation.

use {
    crate::{
        dsl::{self, Expr, LineKind, Stmt, Target},
        exec,
    },
    std::collections::{HashMap, HashSet},
};

/// Compact the log. `is_live` reports whether a top-level binding still
/// exists in the execution namespace. Deterministic for equal inputs.
pub fn compact(log: &[String], is_live: &dyn Fn(&str) -> bool) -> Result<String, String> {
    let mut lines: Vec<(String, LineKind)> = Vec::new();
    for fragment in log {
        for line in fragment.lines() {
            let kind = dsl::classify_line(line);
            if kind == LineKind::Blank {
                continue;
            }
            lines.push((line.trim_end().to_string(), kind));
        }
    }

    let mut last_assign: HashMap<String, usize> = HashMap::new();
    for (idx, (_, kind)) in lines.iter().enumerate() {
        if let LineKind::Assign(name) = kind {
            last_assign.insert(name.clone(), idx);
        }
    }

    let mut seen_imports: HashSet<String> = HashSet::new();
    let mut out = String::new();
    for (idx, (line, kind)) in lines.iter().enumerate() {
        match kind {
            LineKind::Blank => {}
            LineKind::Import => {
                if seen_imports.insert(line.trim().to_string()) {
                    out.push_str(line);
                    out.push('\n');
                }
            }
            LineKind::Assign(name) => {
                if last_assign.get(name) != Some(&idx) {
                    continue;
                }
                if creates_widget(line)? && !is_live(name) {
                    continue;
                }
                out.push_str(line);
                out.push('\n');
            }
            LineKind::Other => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    Ok(out)
}

/// Whether an assignment line's whole right-hand side is a widget
/// constructor call.
fn creates_widget(line: &str) -> Result<bool, String> {
    let stmts = dsl::parse_program(line)?;
    Ok(matches!(
        stmts.as_slice(),
        [Stmt::Assign {
            expr: Expr::Call {
                target: Target::Function(f),
                ..
            },
            ..
        }] if exec::is_widget_constructor(f)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_live(_: &str) -> bool {
        true
    }

    fn logv(fragments: &[&str]) -> Vec<String> {
        fragments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn imports_deduplicate_keeping_first_occurrence() {
        let log = logv(&["import math\nx = 1\n", "import math\ny = 2\n"]);
        let out = compact(&log, &always_live).unwrap();
        assert_eq!(out, "import math\nx = 1\ny = 2\n");
    }

    #[test]
    fn latest_assignment_supersedes() {
        let log = logv(&["x = 1\n", "print(x)\n", "x = 2\n"]);
        let out = compact(&log, &always_live).unwrap();
        assert_eq!(out, "print(x)\nx = 2\n");
    }

    #[test]
    fn destroyed_widget_statements_are_elided() {
        let log = logv(&["w = label(\"hi\")\n", "x = 5\n"]);
        let gone = |name: &str| name != "w";
        let out = compact(&log, &gone).unwrap();
        assert_eq!(out, "x = 5\n");
        // Still live: the statement stays.
        let out = compact(&log, &always_live).unwrap();
        assert_eq!(out, "w = label(\"hi\")\nx = 5\n");
    }

    #[test]
    fn widget_elision_only_applies_to_pure_constructor_lines() {
        // The rect is a scene item, not a widget; binding gone or not, the
        // statement survives.
        let log = logv(&["r = rect(0, 0, 1, 1)\n"]);
        let out = compact(&log, &|_| false).unwrap();
        assert_eq!(out, "r = rect(0, 0, 1, 1)\n");
    }

    #[test]
    fn blank_lines_and_comments_are_dropped() {
        let log = logv(&["# build the header\n\nx = 1\n"]);
        assert_eq!(compact(&log, &always_live).unwrap(), "x = 1\n");
    }

    #[test]
    fn compaction_is_deterministic() {
        let log = logv(&["import a\nx = 1\n", "import a\nx = 2\nprint(x)\n"]);
        let first = compact(&log, &always_live).unwrap();
        for _ in 0..5 {
            assert_eq!(compact(&log, &always_live).unwrap(), first);
        }
    }

    #[test]
    fn unparseable_assignment_reports_an_error_for_fallback() {
        let log = logv(&["x = ((((\n"]);
        assert!(compact(&log, &always_live).is_err());
    }
}

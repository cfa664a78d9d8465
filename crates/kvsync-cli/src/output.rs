//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use kvsync_core::{KeyTree, PatternState, TreeNode, Value};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print the keys currently matching a pattern
    pub fn print_entries(&self, state: &PatternState) {
        match self.format {
            OutputFormat::Human => {
                if state.is_empty() {
                    println!("No matching keys.");
                    return;
                }
                for (key, value) in state.entries().iter() {
                    println!("{} = {}", key, truncate(&value.to_string(), 60));
                }
                println!("\n{} key(s)", state.len());
            }
            OutputFormat::Json => {
                println!("{}", entries_json(state));
            }
            OutputFormat::Quiet => {
                for key in state.entries().keys() {
                    println!("{}", key);
                }
            }
        }
    }

    /// Print a key tree
    pub fn print_tree(&self, tree: &KeyTree, separator: char) {
        match self.format {
            OutputFormat::Human => {
                if tree.is_empty() {
                    println!("Empty tree.");
                    return;
                }
                for line in render_tree(tree.root()) {
                    println!("{}", line);
                }
            }
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "paths": tree.paths() }));
            }
            OutputFormat::Quiet => {
                for path in tree.paths() {
                    println!("{}", path.join(&separator.to_string()));
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// JSON object of a pattern state, keys in insertion order
fn entries_json(state: &PatternState) -> Value {
    let map = state
        .entries()
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect::<serde_json::Map<String, Value>>();
    Value::Object(map)
}

/// Indented lines, one per node
fn render_tree(root: &TreeNode) -> Vec<String> {
    fn walk(node: &TreeNode, depth: usize, lines: &mut Vec<String>) {
        for (segment, child) in node.children() {
            lines.push(format!("{}{}", "  ".repeat(depth), segment));
            walk(child, depth + 1, lines);
        }
    }

    let mut lines = Vec::new();
    walk(root, 0, &mut lines);
    lines
}

/// Truncate a string to max length in characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

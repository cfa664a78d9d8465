//! Simulate command
//!
//! Replays a script of store operations against an in-process store and
//! prints what a pattern subscription ends up holding. Scripts are JSON
//! lines; blank lines and lines starting with `//` are skipped:
//!
//! ```text
//! {"op": "set", "key": "plant/line-1/temp", "value": 21.5}
//! {"op": "publish", "key": "plant/alarms", "value": "overheat"}
//! {"op": "delete", "key": "plant/line-1/temp"}
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use kvsync_core::{
    ClientScope, Config, Connection, ConnectionSettings, KeyTree, MemoryStore, MemoryTransport,
    PatternState, SubscribeOptions, Value,
};

use crate::output::Output;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One scripted operation
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Set { key: String, value: Value },
    Publish { key: String, value: Value },
    Delete { key: String },
}

/// Result of replaying a script
#[derive(Debug)]
pub struct Simulation {
    pub state: PatternState,
    pub tree: KeyTree,
    pub steps: usize,
    pub batches: usize,
}

/// Run the simulate command
pub async fn run(
    config: &Config,
    script: &Path,
    pattern: &str,
    show_tree: bool,
    output: &Output,
) -> Result<()> {
    let content = std::fs::read_to_string(script)
        .with_context(|| format!("Failed to read script: {:?}", script))?;
    let steps = parse_script(&content)?;

    let simulation = simulate(config, &steps, pattern).await?;

    output.message(&format!(
        "Replayed {} step(s), {} batch(es) delivered",
        simulation.steps, simulation.batches
    ));
    if show_tree {
        output.print_tree(&simulation.tree, config.separator);
    } else {
        output.print_entries(&simulation.state);
    }

    Ok(())
}

/// Parse a JSON-lines script
pub fn parse_script(content: &str) -> Result<Vec<Step>> {
    let mut steps = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let step = serde_json::from_str(line)
            .with_context(|| format!("Invalid step on line {}", index + 1))?;
        steps.push(step);
    }
    Ok(steps)
}

/// Replay `steps` and fold every delivery for `pattern`
pub async fn simulate(config: &Config, steps: &[Step], pattern: &str) -> Result<Simulation> {
    let transport = MemoryTransport::new(MemoryStore::with_syntax(config.syntax()));
    let settings = ConnectionSettings::new("memory://simulate");
    let scope = ClientScope::new(transport, settings);

    let connection = scope
        .wait_connected(CONNECT_TIMEOUT)
        .await
        .context("Failed to connect to the in-process store")?;
    let pattern = scope.parse_pattern(pattern)?;

    let mut subscription = connection
        .psubscribe(&pattern, SubscribeOptions::default())
        .await?;
    let mut simulation = Simulation {
        state: PatternState::new(pattern.clone()),
        tree: KeyTree::new(),
        steps: 0,
        batches: 0,
    };

    for step in steps {
        match step {
            Step::Set { key, value } => {
                scope.set(&scope.parse_key(key)?, value.clone()).await?;
            }
            Step::Publish { key, value } => {
                scope.publish(&scope.parse_key(key)?, value.clone()).await?;
            }
            Step::Delete { key } => {
                scope.delete(&scope.parse_key(key)?).await?;
            }
        }
        simulation.steps += 1;

        // The in-process store delivers synchronously
        while let Some(event) = subscription.try_recv() {
            debug!(
                upserted = event.upserted.len(),
                removed = event.removed.len(),
                "Batch delivered"
            );
            simulation.tree.apply(&event);
            simulation.state.apply(&pattern, event);
            simulation.batches += 1;
        }
    }

    subscription.release();
    scope.shutdown().await;
    info!(steps = simulation.steps, batches = simulation.batches, "Simulation finished");

    Ok(simulation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsync_core::Key;
    use serde_json::json;
    use tempfile::TempDir;

    const SCRIPT: &str = r#"
        // two sensors, one alarm, one sensor removed
        {"op": "set", "key": "plant/line-1/temp", "value": 21.5}
        {"op": "set", "key": "plant/line-2/temp", "value": 19.0}
        {"op": "publish", "key": "plant/alarms", "value": "overheat"}

        {"op": "delete", "key": "plant/line-1/temp"}
        {"op": "set", "key": "office/temp", "value": 22.0}
    "#;

    fn key(raw: &str) -> Key {
        Key::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_script() {
        let steps = parse_script(SCRIPT).unwrap();
        assert_eq!(steps.len(), 5);
        assert_eq!(
            steps[3],
            Step::Delete {
                key: "plant/line-1/temp".to_string()
            }
        );
    }

    #[test]
    fn test_parse_script_reports_line() {
        let err = parse_script("{\"op\": \"set\", \"key\": \"a\", \"value\": 1}\n{\"op\": \"explode\"}")
            .unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn test_simulate_pattern_state() {
        let steps = parse_script(SCRIPT).unwrap();
        let simulation = simulate(&Config::default(), &steps, "plant/#").await.unwrap();

        assert_eq!(simulation.steps, 5);
        assert_eq!(simulation.batches, 4);
        assert_eq!(simulation.state.len(), 2);
        assert_eq!(
            simulation.state.get(&key("plant/line-2/temp")),
            Some(&json!(19.0))
        );
        // Published values are delivered but not removed later
        assert_eq!(
            simulation.state.get(&key("plant/alarms")),
            Some(&json!("overheat"))
        );
        assert!(simulation.state.get(&key("office/temp")).is_none());
    }

    #[tokio::test]
    async fn test_simulate_tree() {
        let steps = parse_script(SCRIPT).unwrap();
        let simulation = simulate(&Config::default(), &steps, "plant/#").await.unwrap();

        assert_eq!(
            simulation.tree.paths(),
            vec![
                vec!["plant".to_string(), "line-2".to_string(), "temp".to_string()],
                vec!["plant".to_string(), "alarms".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_simulate_custom_separator() {
        let config = Config {
            separator: '.',
            wildcard: '*',
            multi_wildcard: '>',
            ..Config::default()
        };
        let steps = parse_script(r#"{"op": "set", "key": "a.b", "value": 1}"#).unwrap();

        let simulation = simulate(&config, &steps, "a.*").await.unwrap();
        assert_eq!(simulation.state.get(&key("a/b")), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_run_reads_script_file() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("script.jsonl");
        std::fs::write(&script, SCRIPT).unwrap();
        let output = Output::new(crate::output::OutputFormat::Quiet);

        run(&Config::default(), &script, "plant/#", true, &output)
            .await
            .unwrap();
        assert!(run(
            &Config::default(),
            &dir.path().join("missing.jsonl"),
            "#",
            false,
            &output
        )
        .await
        .is_err());
    }
}
